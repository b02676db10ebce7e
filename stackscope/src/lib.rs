//! Cross-platform stack traces, crash reports and abort handling.
//!
//! This crate produces rich call-stack reports for crashes, assertions and
//! on-demand introspection:
//!
//! ```
//! for frame in stackscope::current_stack() {
//!     println!("{frame}");
//! }
//! ```
//!
//! Stacks can be captured for the current thread, a specific thread, or
//! every thread of the process; multi-thread captures fold into a
//! prefix-shared [`MultiStack`] tree. Each raw address resolves into a
//! [`StackFrame`] carrying module, function, file and line, using the
//! dynamic loader, the executable's own symbol table and the platform's
//! symboliser.
//!
//! The abort path ties it together: [`abort_error`] builds an
//! [`AbortError`] with the stack and memory use at the point of failure,
//! [`raise`] routes it through the installed handler, and [`terminate`]
//! prints the report and takes the process down exactly once, no matter how
//! many threads race into it. [`install_crash_handlers`] bridges
//! asynchronous signals into the same path.
//!
//! # Crash signals
//!
//! ```no_run
//! stackscope::install_crash_handlers().unwrap();
//! ```
//!
//! The installed handler is async-signal-safe: it writes one pre-formatted
//! line to stderr and re-raises the signal with its previous disposition.
//! Richer reporting belongs on a logger thread fed through the one-slot
//! ring in [`handoff`].

#![warn(missing_docs)]

mod abort;
mod config;
mod memory;

pub use crate::abort::{
    abort, abort_error, cause_segfault, clear_abort_handler, crash_handoff, crash_signal_handler,
    install_crash_handlers, install_panic_reporter, panic_error, raise, report_signal,
    set_abort_handler, set_global_abort_hook, set_global_stack_hook, terminate, AbortHandler,
    GlobalAbortHook, GlobalStackHook,
};
pub use crate::config::{abort_behavior, set_abort_behavior, set_debug, AbortBehavior, StackType};
pub use crate::memory::memory_usage;

pub use stackscope_types::{
    source_location, wire, AbortCause, AbortError, MultiStack, SourceLocation, StackFrame,
    StackNode, WireError,
};

pub use stackscope_backtrace::{
    active_threads, all_stacks, backtrace, backtrace_all, backtrace_thread, cleanup_stack_trace,
    current_stack, executable_path, module_of, resolve, resolve_all, symbol_search_path, symbols,
    this_thread, thread_stack, CaptureError, ModuleInfo, RawBacktrace, StopReason, SymbolsError,
    ThreadHandle, DEFAULT_MAX_DEPTH,
};

pub use stackscope_signal::{
    all_signals_to_catch, clear_signal, clear_signals, default_signals_to_catch, handoff,
    handled_signals, raise_signal, signal_name, set_signals, SignalError,
};

#[doc(hidden)]
pub fn __debug_enabled() -> bool {
    config::debug_enabled()
}

/// Prints a debug message to stderr when debug output is enabled via
/// [`set_debug`].
///
/// Not async-signal-safe; never call it from a signal handler.
#[macro_export]
macro_rules! stackscope_debug {
    ($($arg:tt)*) => {
        if $crate::__debug_enabled() {
            eprint!("[stackscope] ");
            eprintln!($($arg)*);
        }
    };
}
