//! Signal handling surface for stackscope.
//!
//! Installs handlers for a configurable set of asynchronous signals,
//! remembering each signal's previous disposition so it can be restored,
//! and bridges caught signals into the abort path.
//!
//! A signal handler may only touch async-signal-safe state. The default
//! crash handler here does exactly two things: a single `write` of a
//! pre-formatted message to stderr, then restore-and-re-raise so the
//! process dies with the original signal's semantics. Anything richer —
//! formatting, symbolisation, logging — must happen on another thread; the
//! [`handoff`] module provides the lock-free one-slot hand-off for that.

#![warn(missing_docs)]

pub mod handoff;

use thiserror::Error;

/// Failure to change a signal disposition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// Signal handling is not available on this platform.
    #[error("signal handling is not supported on this platform")]
    Unsupported,
    /// The OS rejected the disposition change.
    #[error("failed to install handler for signal {0}")]
    Install(i32),
}

/// Handler type accepted by [`set_signals`]: called with the signal number.
pub type SignalHandler = extern "C" fn(i32);

#[cfg(unix)]
mod imp {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use once_cell::sync::Lazy;

    use super::{SignalError, SignalHandler};

    // Previous dispositions of the signals we have taken over. Touched only
    // from set/clear, never from a handler.
    static PREVIOUS: Lazy<Mutex<HashMap<i32, libc::sigaction>>> =
        Lazy::new(|| Mutex::new(HashMap::new()));

    pub fn set_signals(signals: &[i32], handler: SignalHandler) -> Result<(), SignalError> {
        let mut previous = PREVIOUS.lock().unwrap_or_else(|poison| poison.into_inner());
        for &signal in signals {
            let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
            action.sa_sigaction = handler as usize;
            action.sa_flags = libc::SA_RESTART;
            unsafe { libc::sigemptyset(&mut action.sa_mask) };

            let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
            if unsafe { libc::sigaction(signal, &action, &mut old) } != 0 {
                return Err(SignalError::Install(signal));
            }
            // Only the first installation's predecessor is worth keeping;
            // re-installing ours must not clobber it.
            previous.entry(signal).or_insert(old);
        }
        Ok(())
    }

    pub fn clear_signal(signal: i32) {
        let mut previous = PREVIOUS.lock().unwrap_or_else(|poison| poison.into_inner());
        if let Some(old) = previous.remove(&signal) {
            unsafe { libc::sigaction(signal, &old, std::ptr::null_mut()) };
        }
    }

    pub fn clear_signals() {
        let mut previous = PREVIOUS.lock().unwrap_or_else(|poison| poison.into_inner());
        for (signal, old) in previous.drain() {
            unsafe { libc::sigaction(signal, &old, std::ptr::null_mut()) };
        }
    }

    pub fn handled_signals() -> Vec<i32> {
        let previous = PREVIOUS.lock().unwrap_or_else(|poison| poison.into_inner());
        let mut signals: Vec<i32> = previous.keys().copied().collect();
        signals.sort_unstable();
        signals
    }

    pub fn raise_signal(signal: i32) {
        unsafe { libc::raise(signal) };
    }

    /// Restores the previous disposition of `signal` and re-raises it.
    ///
    /// Async-signal-safe: `sigaction` and `raise` both are. This is the
    /// tail of the default crash handler; the process dies with the
    /// original signal's exit semantics.
    pub fn restore_and_reraise(signal: i32) {
        // Cannot take the mutex here; fall back to the OS default, which is
        // what the previous disposition overwhelmingly is for crash signals.
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = libc::SIG_DFL;
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signal, &action, std::ptr::null_mut());
            libc::raise(signal);
        }
    }

    /// Single `write(2)` to stderr, usable from a signal handler.
    pub fn write_stderr(message: &str) {
        unsafe {
            libc::write(
                libc::STDERR_FILENO,
                message.as_ptr() as *const libc::c_void,
                message.len(),
            );
        }
    }

    pub fn all_signals_to_catch() -> Vec<i32> {
        let mut signals = Vec::new();
        for signal in 1..32 {
            // these two can never be caught
            if signal == libc::SIGKILL || signal == libc::SIGSTOP {
                continue;
            }
            signals.push(signal);
        }
        signals
    }

    pub fn default_signals_to_catch() -> Vec<i32> {
        // Job control, child notifications, terminal resizes and developer
        // traps do not translate into a meaningful abort.
        let excluded = [
            libc::SIGTSTP,
            libc::SIGTTIN,
            libc::SIGTTOU,
            libc::SIGCONT,
            libc::SIGCHLD,
            libc::SIGURG,
            libc::SIGWINCH,
            libc::SIGTRAP,
            libc::SIGALRM,
            libc::SIGVTALRM,
            libc::SIGPROF,
            libc::SIGIO,
        ];
        all_signals_to_catch()
            .into_iter()
            .filter(|signal| !excluded.contains(signal))
            .collect()
    }

    pub fn signal_name(signal: i32) -> String {
        let name = match signal {
            libc::SIGHUP => "SIGHUP",
            libc::SIGINT => "SIGINT",
            libc::SIGQUIT => "SIGQUIT",
            libc::SIGILL => "SIGILL",
            libc::SIGTRAP => "SIGTRAP",
            libc::SIGABRT => "SIGABRT",
            libc::SIGBUS => "SIGBUS",
            libc::SIGFPE => "SIGFPE",
            libc::SIGKILL => "SIGKILL",
            libc::SIGUSR1 => "SIGUSR1",
            libc::SIGSEGV => "SIGSEGV",
            libc::SIGUSR2 => "SIGUSR2",
            libc::SIGPIPE => "SIGPIPE",
            libc::SIGALRM => "SIGALRM",
            libc::SIGTERM => "SIGTERM",
            libc::SIGCHLD => "SIGCHLD",
            libc::SIGCONT => "SIGCONT",
            libc::SIGSTOP => "SIGSTOP",
            libc::SIGTSTP => "SIGTSTP",
            libc::SIGTTIN => "SIGTTIN",
            libc::SIGTTOU => "SIGTTOU",
            libc::SIGURG => "SIGURG",
            libc::SIGXCPU => "SIGXCPU",
            libc::SIGXFSZ => "SIGXFSZ",
            libc::SIGVTALRM => "SIGVTALRM",
            libc::SIGPROF => "SIGPROF",
            libc::SIGWINCH => "SIGWINCH",
            libc::SIGIO => "SIGIO",
            libc::SIGSYS => "SIGSYS",
            _ => return format!("signal {signal}"),
        };
        name.to_owned()
    }
}

#[cfg(not(unix))]
mod imp {
    use super::{SignalError, SignalHandler};

    pub fn set_signals(_signals: &[i32], _handler: SignalHandler) -> Result<(), SignalError> {
        Err(SignalError::Unsupported)
    }

    pub fn clear_signal(_signal: i32) {}

    pub fn clear_signals() {}

    pub fn handled_signals() -> Vec<i32> {
        Vec::new()
    }

    pub fn raise_signal(_signal: i32) {}

    pub fn restore_and_reraise(_signal: i32) {}

    pub fn write_stderr(message: &str) {
        eprint!("{message}");
    }

    pub fn all_signals_to_catch() -> Vec<i32> {
        Vec::new()
    }

    pub fn default_signals_to_catch() -> Vec<i32> {
        Vec::new()
    }

    pub fn signal_name(signal: i32) -> String {
        format!("signal {signal}")
    }
}

/// Installs `handler` for each signal in `signals`.
///
/// The previous disposition of every newly taken-over signal is remembered
/// so [`clear_signal`] and [`clear_signals`] can restore it. Installing
/// twice for the same signal keeps the original predecessor.
pub fn set_signals(signals: &[i32], handler: SignalHandler) -> Result<(), SignalError> {
    imp::set_signals(signals, handler)
}

/// Restores the previous disposition of one signal taken by [`set_signals`].
pub fn clear_signal(signal: i32) {
    imp::clear_signal(signal)
}

/// Restores the previous disposition of every signal taken by
/// [`set_signals`].
pub fn clear_signals() {
    imp::clear_signals()
}

/// The signals currently routed to a handler installed by [`set_signals`],
/// sorted ascending.
pub fn handled_signals() -> Vec<i32> {
    imp::handled_signals()
}

/// Sends `signal` to the current process.
pub fn raise_signal(signal: i32) {
    imp::raise_signal(signal)
}

/// Restores the default disposition of `signal` and re-raises it.
///
/// This is the async-signal-safe tail of a crash handler: the process exits
/// with the original signal's semantics (core dump, exit status).
pub fn restore_and_reraise(signal: i32) {
    imp::restore_and_reraise(signal)
}

/// Writes a pre-formatted message to stderr with a single `write`.
///
/// Safe to call from a signal handler; does not allocate or lock.
pub fn write_stderr(message: &str) {
    imp::write_stderr(message)
}

/// Every signal the OS permits catching.
pub fn all_signals_to_catch() -> Vec<i32> {
    imp::all_signals_to_catch()
}

/// The curated subset of catchable signals worth translating into an abort.
///
/// Excludes job-control signals, child/IO notifications, timers and
/// developer traps.
pub fn default_signals_to_catch() -> Vec<i32> {
    imp::default_signals_to_catch()
}

/// Human-readable name for a signal number.
pub fn signal_name(signal: i32) -> String {
    imp::signal_name(signal)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

    extern "C" fn recording_handler(signal: i32) {
        LAST_SIGNAL.store(signal, Ordering::SeqCst);
    }

    #[test]
    fn uncatchable_signals_are_excluded() {
        let all = all_signals_to_catch();
        assert!(!all.contains(&libc::SIGKILL));
        assert!(!all.contains(&libc::SIGSTOP));
        assert!(all.contains(&libc::SIGSEGV));
        assert!(all.contains(&libc::SIGTERM));
    }

    #[test]
    fn default_set_is_a_strict_subset() {
        let all = all_signals_to_catch();
        let default = default_signals_to_catch();
        assert!(default.len() < all.len());
        assert!(default.iter().all(|signal| all.contains(signal)));
        assert!(!default.contains(&libc::SIGTSTP));
        assert!(!default.contains(&libc::SIGCHLD));
        assert!(!default.contains(&libc::SIGTRAP));
        assert!(default.contains(&libc::SIGSEGV));
        assert!(default.contains(&libc::SIGABRT));
    }

    #[test]
    fn names_cover_common_signals() {
        assert_eq!(signal_name(libc::SIGSEGV), "SIGSEGV");
        assert_eq!(signal_name(libc::SIGABRT), "SIGABRT");
        assert_eq!(signal_name(4242), "signal 4242");
    }

    #[test]
    fn install_raise_and_restore_roundtrip() {
        set_signals(&[libc::SIGUSR2], recording_handler).unwrap();
        assert_eq!(handled_signals(), vec![libc::SIGUSR2]);

        raise_signal(libc::SIGUSR2);
        assert_eq!(LAST_SIGNAL.load(Ordering::SeqCst), libc::SIGUSR2);

        // installing again keeps the signal listed once
        set_signals(&[libc::SIGUSR2], recording_handler).unwrap();
        assert_eq!(handled_signals(), vec![libc::SIGUSR2]);

        clear_signal(libc::SIGUSR2);
        assert!(handled_signals().is_empty());
    }
}
