//! The terminate path: building abort records, routing them through the
//! installed handler, and taking the process down exactly once.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};

use stackscope_backtrace::{all_stacks, cleanup_stack_trace, current_stack, this_thread};
use stackscope_signal::handoff::HandoffSlot;
use stackscope_types::{AbortCause, AbortError, MultiStack, SourceLocation, StackFrame};

use crate::config::{abort_behavior, StackType};
use crate::memory::memory_usage;

/// Handler invoked by [`raise`] with ownership of the abort record.
pub type AbortHandler = fn(AbortError);

/// Supplies stacks from cooperating processes for
/// [`StackType::Global`] captures.
pub type GlobalStackHook = fn() -> Vec<Vec<StackFrame>>;

/// Requests a termination of all cooperating processes. Runs inside
/// [`terminate`] before the local process abort.
pub type GlobalAbortHook = fn();

static HANDLER: RwLock<Option<AbortHandler>> = RwLock::new(None);
static GLOBAL_STACKS: RwLock<Option<GlobalStackHook>> = RwLock::new(None);
static GLOBAL_ABORT: RwLock<Option<GlobalAbortHook>> = RwLock::new(None);

// Once a termination sequence is running, every further entry bypasses
// formatting and goes straight to the platform abort.
static FORCE_EXIT: AtomicU32 = AtomicU32::new(0);
static TERMINATE_LOCK: Mutex<()> = Mutex::new(());

/// Routes an [`AbortError`] built by the signal bridge or by user code.
///
/// The default handler is [`terminate`].
pub fn set_abort_handler(handler: AbortHandler) {
    let mut current = HANDLER.write().unwrap_or_else(|poison| poison.into_inner());
    *current = Some(handler);
}

/// Restores the default handler ([`terminate`]).
pub fn clear_abort_handler() {
    let mut current = HANDLER.write().unwrap_or_else(|poison| poison.into_inner());
    *current = None;
}

/// Registers the source of cooperating-process stacks used by
/// [`StackType::Global`] captures.
pub fn set_global_stack_hook(hook: GlobalStackHook) {
    let mut current = GLOBAL_STACKS
        .write()
        .unwrap_or_else(|poison| poison.into_inner());
    *current = Some(hook);
}

/// Registers the hook [`terminate`] uses to bring down cooperating
/// processes when the behaviour asks for a global abort.
pub fn set_global_abort_hook(hook: GlobalAbortHook) {
    let mut current = GLOBAL_ABORT
        .write()
        .unwrap_or_else(|poison| poison.into_inner());
    *current = Some(hook);
}

fn capture_for(stack_type: StackType) -> MultiStack {
    match stack_type {
        StackType::Thread => MultiStack::from(current_stack().as_slice()),
        StackType::AllThreads => all_stacks(),
        StackType::Global => {
            let mut multi = all_stacks();
            let hook = *GLOBAL_STACKS
                .read()
                .unwrap_or_else(|poison| poison.into_inner());
            if let Some(hook) = hook {
                for stack in hook() {
                    multi.add(&stack);
                }
            }
            multi
        }
    }
}

fn build_record(message: String, cause: AbortCause, signal: i32) -> AbortError {
    let behavior = abort_behavior();
    let mut err = AbortError::new(message, cause);
    err.signal = signal;
    err.bytes_in_use = memory_usage();
    err.print_memory = behavior.print_memory;
    err.print_stack = behavior.print_stack;
    err.stack = capture_for(behavior.stack_type);
    cleanup_stack_trace(&mut err.stack);
    err
}

/// Builds an [`AbortError`] for an explicit abort at `source`.
///
/// Captures the stack scope selected by the current [`AbortBehavior`]
/// (see [`crate::set_abort_behavior`]) together with the memory in use.
/// "Raising" the abort is the caller's move: return it as an error up the
/// stack, or hand it to [`raise`] to terminate through the installed
/// handler — an abort must never look like a normal return.
///
/// [`AbortBehavior`]: crate::AbortBehavior
pub fn abort_error(message: impl Into<String>, source: SourceLocation) -> AbortError {
    let mut err = build_record(message.into(), AbortCause::Abort, 0);
    err.source = source;
    err
}

/// Builds an abort record for `source` and raises it immediately.
///
/// Shorthand for [`raise`]`(`[`abort_error`]`(message, source))`; does not
/// return.
pub fn abort(message: impl Into<String>, source: SourceLocation) -> ! {
    raise(abort_error(message, source))
}

/// Builds an [`AbortError`] describing a caught signal.
///
/// Captures stack and memory like [`abort_error`]. Not async-signal-safe:
/// this is for the logger thread draining the crash hand-off slot, or for
/// synchronous use after the signal has been translated, never for the
/// signal handler itself.
pub fn report_signal(signal: i32) -> AbortError {
    let message = format!("caught {}", stackscope_signal::signal_name(signal));
    build_record(message, AbortCause::Signal, signal)
}

/// Routes an abort record through the installed handler.
///
/// Without a handler this is [`terminate`]. A handler that returns does not
/// resume the program: the process still goes down, skipping the report the
/// handler already had its chance to emit.
pub fn raise(err: AbortError) -> ! {
    crate::stackscope_debug!("raising abort: {}", err.message);
    let handler = *HANDLER.read().unwrap_or_else(|poison| poison.into_inner());
    match handler {
        Some(handler) => {
            handler(err);
            std::process::abort();
        }
        None => terminate(err),
    }
}

/// Prints the abort report and takes the process down.
///
/// Serialized process-wide: one termination sequence runs to completion,
/// and any thread (or recursive signal) arriving while it runs bypasses all
/// formatting and calls the platform abort directly. This function cannot
/// fail; when everything else breaks it still aborts.
pub fn terminate(err: AbortError) -> ! {
    if FORCE_EXIT.fetch_add(1, Ordering::SeqCst) >= 1 {
        std::process::abort();
    }
    let _guard = TERMINATE_LOCK
        .lock()
        .unwrap_or_else(|poison| poison.into_inner());

    // Stop translating further signals; the process is going down.
    stackscope_signal::clear_signals();

    let behavior = abort_behavior();
    if behavior.print_on_abort {
        eprint!("{err}");
    }
    if !behavior.throw_exception {
        let hook = *GLOBAL_ABORT
            .read()
            .unwrap_or_else(|poison| poison.into_inner());
        if let Some(hook) = hook {
            hook();
        }
    }
    std::process::abort();
}

/****************************************************************************
 *  Panic bridge                                                             *
 ****************************************************************************/

static PANIC_HOOK: std::sync::Once = std::sync::Once::new();

/// Extracts the message of a panic.
#[allow(deprecated)] // `PanicHookInfo` needs a newer toolchain than we ask for
fn message_from_panic<'a>(info: &'a std::panic::PanicInfo<'a>) -> &'a str {
    match info.payload().downcast_ref::<&'static str>() {
        Some(message) => message,
        None => match info.payload().downcast_ref::<String>() {
            Some(message) => message.as_str(),
            None => "Box<Any>",
        },
    }
}

/// Builds an [`AbortError`] from a caught panic.
///
/// The stack is the panicking thread's, captured from inside the hook.
#[allow(deprecated)]
pub fn panic_error(info: &std::panic::PanicInfo<'_>) -> AbortError {
    let mut err = build_record(
        message_from_panic(info).to_owned(),
        AbortCause::Exception,
        0,
    );
    if let Some(location) = info.location() {
        err.source = SourceLocation::new(location.file(), location.line(), "");
    }
    err
}

/// Installs a panic hook that prints panics as full abort reports.
///
/// The previous hook still runs afterwards, so unwinding, `should_panic`
/// tests and any other registered reporter keep working. Installing more
/// than once is a no-op.
pub fn install_panic_reporter() {
    PANIC_HOOK.call_once(|| {
        let next = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let err = panic_error(info);
            if abort_behavior().print_on_abort {
                eprint!("{err}");
            }
            next(info);
        }));
    });
}

/****************************************************************************
 *  Signal bridge                                                            *
 ****************************************************************************/

static CRASH_SLOT: HandoffSlot = HandoffSlot::new();

/// The hand-off slot the crash handler publishes into.
///
/// A logger thread can poll this and turn records into full reports with
/// [`report_signal`].
pub fn crash_handoff() -> &'static HandoffSlot {
    &CRASH_SLOT
}

/// The default crash-signal handler.
///
/// Async-signal-safe: publishes the signal into the hand-off slot, writes
/// one pre-formatted line to stderr, then restores the signal's previous
/// disposition and re-raises it so the process exits with the original
/// signal's semantics.
pub extern "C" fn crash_signal_handler(signal: i32) {
    CRASH_SLOT.publish(signal, this_thread().raw(), b"");

    const PREFIX: &[u8] = b"stackscope: caught fatal signal ";
    let mut buf = [0u8; 48];
    buf[..PREFIX.len()].copy_from_slice(PREFIX);
    let mut len = PREFIX.len() + format_u32(signal.unsigned_abs(), &mut buf[PREFIX.len()..]);
    buf[len] = b'\n';
    len += 1;
    if let Ok(line) = std::str::from_utf8(&buf[..len]) {
        stackscope_signal::write_stderr(line);
    }

    stackscope_signal::restore_and_reraise(signal);
}

// Renders a number into `out` without allocating; returns the length.
fn format_u32(mut value: u32, out: &mut [u8]) -> usize {
    let mut digits = [0u8; 10];
    let mut count = 0;
    loop {
        digits[count] = b'0' + (value % 10) as u8;
        value /= 10;
        count += 1;
        if value == 0 {
            break;
        }
    }
    for (index, slot) in out.iter_mut().take(count).enumerate() {
        *slot = digits[count - 1 - index];
    }
    count
}

/// Installs [`crash_signal_handler`] for the default signal set.
pub fn install_crash_handlers() -> Result<(), stackscope_signal::SignalError> {
    let signals = stackscope_signal::default_signals_to_catch();
    crate::stackscope_debug!("installing crash handlers for {} signals", signals.len());
    stackscope_signal::set_signals(&signals, crash_signal_handler)
}

/// Dereferences null, on purpose.
///
/// Test helper for exercising the crash-signal path end to end.
pub fn cause_segfault() -> ! {
    unsafe {
        std::ptr::null_mut::<i32>().write_volatile(42);
    }
    // not reached; the write faults
    std::process::abort();
}
