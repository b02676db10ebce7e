//! Capture primitives for Linux and macOS.
//!
//! Current-thread capture walks the stack with the `backtrace` crate.
//! Cross-thread capture (Linux only) is a directed-signal hand-off: the
//! target thread is signalled with `SIGURG`, walks its own stack from inside
//! the handler into a one-slot buffer of atomics, and the requesting thread
//! spin-waits for the result. `SIGURG` is ignored by default, so a stray
//! late delivery after a timeout is harmless.

use std::collections::BTreeSet;

#[cfg(target_os = "macos")]
use crate::error::CaptureError;
use crate::{RawBacktrace, StopReason};

use super::{ModuleInfo, OfflineSymbol, ThreadHandle};

pub(crate) fn capture(max_depth: usize) -> RawBacktrace {
    let mut addresses = Vec::with_capacity(max_depth.min(256));
    let mut stop = StopReason::Complete;
    backtrace::trace(|frame| {
        if addresses.len() >= max_depth {
            stop = StopReason::DepthLimit;
            return false;
        }
        addresses.push(frame.ip() as u64);
        true
    });
    RawBacktrace { addresses, stop }
}

pub(crate) fn executable_path() -> String {
    std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

pub(crate) fn symbol_search_path() -> String {
    String::new()
}

/****************************************************************************
 *  Address to module lookup via the dynamic loader                          *
 ****************************************************************************/

pub(crate) fn module_of(address: u64) -> Option<ModuleInfo> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::dladdr(address as usize as *const libc::c_void, &mut info) };
    if rc == 0 || info.dli_fname.is_null() {
        return None;
    }
    let path = unsafe { std::ffi::CStr::from_ptr(info.dli_fname) }
        .to_string_lossy()
        .into_owned();
    if path.is_empty() {
        return None;
    }
    let symbol = if info.dli_sname.is_null() {
        None
    } else {
        Some(
            unsafe { std::ffi::CStr::from_ptr(info.dli_sname) }
                .to_string_lossy()
                .into_owned(),
        )
    };
    Some(ModuleInfo {
        path,
        base: info.dli_fbase as usize as u64,
        symbol,
    })
}

/****************************************************************************
 *  Offline symboliser                                                       *
 ****************************************************************************/

#[cfg(target_os = "linux")]
pub(crate) fn symbolise_offline(object: &str, address: u64) -> OfflineSymbol {
    use std::process::Command;

    if object.is_empty() || address == 0 {
        return OfflineSymbol::default();
    }
    let output = crate::exec::run(
        Command::new("addr2line")
            .arg("-C")
            .arg("-f")
            .arg("-i")
            .arg("-e")
            .arg(object)
            .arg(format!("{address:#x}")),
        crate::exec::QUERY_DEADLINE,
    );
    let output = match output {
        Ok(out) if out.status == 0 => out,
        _ => return OfflineSymbol::default(),
    };
    parse_addr2line(&output.stdout)
}

// The atos equivalent is not wired up; resolution on macOS relies on the
// loader and the nm symbol table.
#[cfg(target_os = "macos")]
pub(crate) fn symbolise_offline(_object: &str, _address: u64) -> OfflineSymbol {
    OfflineSymbol::default()
}

/// Parses `addr2line -f` output: a function line followed by `file:line`.
#[cfg(any(target_os = "linux", test))]
fn parse_addr2line(stdout: &str) -> OfflineSymbol {
    let mut lines = stdout.lines();
    let mut result = OfflineSymbol::default();
    if let Some(func) = lines.next() {
        if !func.is_empty() && !func.starts_with('?') {
            result.function = Some(func.to_owned());
        }
    }
    if let Some(location) = lines.next() {
        if !location.is_empty() && !location.starts_with('?') {
            let (file, line) = match location.rsplit_once(':') {
                Some((file, line)) => {
                    // the line column may carry " (discriminator N)"
                    let digits: String =
                        line.chars().take_while(|c| c.is_ascii_digit()).collect();
                    (file, digits.parse().unwrap_or(0))
                }
                None => (location, 0),
            };
            if !file.is_empty() && !file.starts_with('?') {
                result.filename = Some(file.to_owned());
                result.line = Some(line);
            }
        }
    }
    result
}

/****************************************************************************
 *  Thread enumeration                                                       *
 ****************************************************************************/

#[cfg(target_os = "linux")]
pub(crate) fn this_thread() -> ThreadHandle {
    ThreadHandle(unsafe { libc::syscall(libc::SYS_gettid) } as u64)
}

#[cfg(target_os = "macos")]
pub(crate) fn this_thread() -> ThreadHandle {
    ThreadHandle(unsafe { libc::pthread_self() } as u64)
}

#[cfg(target_os = "linux")]
pub(crate) fn enumerate_threads() -> BTreeSet<ThreadHandle> {
    let mut threads = BTreeSet::new();
    if let Ok(entries) = std::fs::read_dir("/proc/self/task") {
        for entry in entries.flatten() {
            if let Ok(tid) = entry.file_name().to_string_lossy().parse::<u64>() {
                threads.insert(ThreadHandle(tid));
            }
        }
    }
    threads.insert(this_thread());
    threads
}

#[cfg(target_os = "macos")]
pub(crate) fn enumerate_threads() -> BTreeSet<ThreadHandle> {
    let mut threads = BTreeSet::new();
    threads.insert(this_thread());
    threads
}

/****************************************************************************
 *  Cross-thread capture (Linux)                                             *
 ****************************************************************************/

#[cfg(target_os = "linux")]
pub(crate) use linux_thread_capture::capture_thread;

#[cfg(target_os = "macos")]
pub(crate) fn capture_thread(
    _thread: ThreadHandle,
    _max_depth: usize,
) -> Result<RawBacktrace, CaptureError> {
    Err(CaptureError::Unsupported(
        "cross-thread stack capture on macOS",
    ))
}

#[cfg(target_os = "linux")]
mod linux_thread_capture {
    use std::sync::atomic::{AtomicBool, AtomicUsize, AtomicU64, Ordering};
    use std::sync::{Mutex, Once};
    use std::time::{Duration, Instant};

    use crate::error::CaptureError;
    use crate::{RawBacktrace, StopReason};

    use super::ThreadHandle;

    const SLOT_DEPTH: usize = 192;
    const RESPONSE_DEADLINE: Duration = Duration::from_millis(200);

    /// One-slot hand-off buffer written by the signal handler.
    ///
    /// Plain atomics throughout: the handler runs on the target thread and
    /// must not take locks or allocate. `target` guards against a signal
    /// from a timed-out earlier request landing after the slot has been
    /// re-armed for a different thread.
    struct HandoffSlot {
        target: AtomicU64,
        ready: AtomicBool,
        len: AtomicUsize,
        truncated: AtomicBool,
        addresses: [AtomicU64; SLOT_DEPTH],
    }

    static SLOT: HandoffSlot = HandoffSlot {
        target: AtomicU64::new(0),
        ready: AtomicBool::new(false),
        len: AtomicUsize::new(0),
        truncated: AtomicBool::new(false),
        addresses: [const { AtomicU64::new(0) }; SLOT_DEPTH],
    };

    // Serializes requesters so the single slot suffices.
    static REQUEST: Mutex<()> = Mutex::new(());
    static INSTALL: Once = Once::new();

    fn install_handler() {
        INSTALL.call_once(|| unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handoff_handler as extern "C" fn(libc::c_int) as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGURG, &action, std::ptr::null_mut());
        });
    }

    extern "C" fn handoff_handler(_sig: libc::c_int) {
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as u64;
        if SLOT.target.load(Ordering::Acquire) != tid || SLOT.ready.load(Ordering::Acquire) {
            return;
        }
        let mut len = 0usize;
        let mut truncated = false;
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                if len >= SLOT_DEPTH {
                    truncated = true;
                    return false;
                }
                SLOT.addresses[len].store(frame.ip() as u64, Ordering::Relaxed);
                len += 1;
                true
            });
        }
        SLOT.len.store(len, Ordering::Relaxed);
        SLOT.truncated.store(truncated, Ordering::Relaxed);
        SLOT.ready.store(true, Ordering::Release);
    }

    pub(crate) fn capture_thread(
        thread: ThreadHandle,
        max_depth: usize,
    ) -> Result<RawBacktrace, CaptureError> {
        let _guard = REQUEST.lock().unwrap_or_else(|poison| poison.into_inner());
        install_handler();

        SLOT.target.store(thread.0, Ordering::Release);
        SLOT.ready.store(false, Ordering::Release);

        let pid = unsafe { libc::getpid() };
        let rc = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                pid as libc::c_long,
                thread.0 as libc::c_long,
                libc::SIGURG as libc::c_long,
            )
        };
        if rc != 0 {
            return Err(CaptureError::NoSuchThread(thread.0));
        }

        let deadline = Instant::now() + RESPONSE_DEADLINE;
        while !SLOT.ready.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                SLOT.target.store(0, Ordering::Release);
                return Err(CaptureError::Timeout(thread.0));
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        SLOT.target.store(0, Ordering::Release);

        let len = SLOT.len.load(Ordering::Relaxed).min(SLOT_DEPTH);
        let take = len.min(max_depth);
        let addresses: Vec<u64> = SLOT.addresses[..take]
            .iter()
            .map(|a| a.load(Ordering::Relaxed))
            .collect();
        let stop = if take < len || SLOT.truncated.load(Ordering::Relaxed) {
            StopReason::DepthLimit
        } else {
            StopReason::Complete
        };
        Ok(RawBacktrace { addresses, stop })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_returns_nonempty_innermost_first() {
        let trace = capture(64);
        assert!(!trace.addresses.is_empty());
        assert!(trace.addresses.iter().all(|&a| a != 0));
    }

    #[test]
    fn capture_truncates_at_depth() {
        let trace = capture(2);
        assert!(trace.addresses.len() <= 2);
        assert_eq!(trace.stop, StopReason::DepthLimit);
    }

    #[test]
    fn module_of_resolves_own_function() {
        let address = capture_returns_nonempty_innermost_first as usize as u64;
        let info = module_of(address).expect("own code is always mapped");
        assert!(!info.path.is_empty());
        assert!(info.base > 0);
    }

    #[test]
    fn parse_addr2line_full_output() {
        let parsed = parse_addr2line("compute_widget\n/src/widget.rs:42\n");
        assert_eq!(parsed.function.as_deref(), Some("compute_widget"));
        assert_eq!(parsed.filename.as_deref(), Some("/src/widget.rs"));
        assert_eq!(parsed.line, Some(42));
    }

    #[test]
    fn parse_addr2line_unknown_output() {
        let parsed = parse_addr2line("??\n??:0\n");
        assert!(parsed.function.is_none());
        assert!(parsed.filename.is_none());
        assert!(parsed.line.is_none());
    }

    #[test]
    fn parse_addr2line_discriminator_suffix() {
        let parsed = parse_addr2line("f\n/src/lib.rs:7 (discriminator 3)\n");
        assert_eq!(parsed.filename.as_deref(), Some("/src/lib.rs"));
        assert_eq!(parsed.line, Some(7));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn enumerate_includes_self() {
        let threads = enumerate_threads();
        assert!(threads.contains(&this_thread()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn cross_thread_capture_roundtrip() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;

        let tid = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicU64::new(0));
        let worker = {
            let tid = Arc::clone(&tid);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                tid.store(this_thread().0, Ordering::SeqCst);
                while done.load(Ordering::SeqCst) == 0 {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            })
        };
        while tid.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }

        let trace = capture_thread(ThreadHandle(tid.load(Ordering::SeqCst)), 64);
        done.store(1, Ordering::SeqCst);
        worker.join().unwrap();

        let trace = trace.expect("target thread should respond");
        assert!(!trace.addresses.is_empty());
    }
}
