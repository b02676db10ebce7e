//! Stack capture and symbol resolution for stackscope.
//!
//! Exposes functions to capture raw return-address traces for the current
//! thread, other threads, or every thread of the process, and to resolve the
//! captured addresses into structured [`StackFrame`]s using the dynamic
//! loader, the executable's own symbol table, and the platform's offline
//! symboliser.
//!
//! Capture is handled by a per-platform backend selected at build time; the
//! fallback backend reports [`CaptureError::Unsupported`] for the
//! capabilities the target lacks and degrades everything else to empty data.

#![warn(missing_docs)]

mod backend;
mod error;
mod exec;
mod resolve;
pub mod symbols;
mod trim;
mod utils;

pub use crate::backend::{ModuleInfo, ThreadHandle};
pub use crate::error::{CaptureError, SymbolsError};
pub use crate::resolve::{resolve, resolve_all};
pub use crate::trim::cleanup_stack_trace;

use std::collections::BTreeSet;

use stackscope_types::{MultiStack, StackFrame};

/// Default frame limit for captures that do not specify one.
pub const DEFAULT_MAX_DEPTH: usize = 128;

/// Why a capture stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The walk reached the outermost frame.
    Complete,
    /// The walk hit the requested depth limit.
    DepthLimit,
    /// The walker detected a self-referential frame loop and gave up.
    Recursion,
}

/// An ordered sequence of raw return addresses, innermost first.
#[derive(Debug, Clone)]
pub struct RawBacktrace {
    /// Captured program-counter values, innermost first.
    pub addresses: Vec<u64>,
    /// Why the capture stopped.
    pub stop: StopReason,
}

impl RawBacktrace {
    /// Whether the capture covered the whole stack.
    pub fn is_complete(&self) -> bool {
        self.stop == StopReason::Complete
    }
}

/// Captures the current thread's raw backtrace.
///
/// Addresses are innermost first. The capture truncates at `max_depth`
/// frames, which [`RawBacktrace::stop`] records.
pub fn backtrace(max_depth: usize) -> RawBacktrace {
    backend::capture(max_depth)
}

/// Captures the raw backtrace of another thread of this process.
///
/// May fail with [`CaptureError::Unsupported`] on platforms without
/// cross-thread capture, or [`CaptureError::Timeout`] when the target thread
/// did not respond in time (it may be blocked in an uninterruptible state).
pub fn backtrace_thread(
    thread: ThreadHandle,
    max_depth: usize,
) -> Result<RawBacktrace, CaptureError> {
    if thread == backend::this_thread() {
        return Ok(backend::capture(max_depth));
    }
    backend::capture_thread(thread, max_depth)
}

/// Captures raw backtraces for every enumerable thread of the process.
///
/// Threads that fail to respond are skipped; the calling thread is always
/// present.
pub fn backtrace_all(max_depth: usize) -> Vec<(ThreadHandle, RawBacktrace)> {
    let mut stacks = Vec::new();
    for thread in active_threads() {
        match backtrace_thread(thread, max_depth) {
            Ok(trace) => stacks.push((thread, trace)),
            Err(_) => continue,
        }
    }
    if stacks.is_empty() {
        stacks.push((this_thread(), backend::capture(max_depth)));
    }
    stacks
}

/// Returns the set of threads currently running in this process.
///
/// Always contains the calling thread. On platforms without thread
/// enumeration the set holds only the calling thread.
pub fn active_threads() -> BTreeSet<ThreadHandle> {
    let mut threads = backend::enumerate_threads();
    threads.insert(backend::this_thread());
    threads
}

/// Returns a handle to the calling thread.
pub fn this_thread() -> ThreadHandle {
    backend::this_thread()
}

/// Captures and resolves the current thread's call stack.
pub fn current_stack() -> Vec<StackFrame> {
    let trace = backend::capture(DEFAULT_MAX_DEPTH);
    resolve_all(&trace.addresses)
}

/// Captures and resolves the call stack of the given thread.
pub fn thread_stack(thread: ThreadHandle) -> Result<Vec<StackFrame>, CaptureError> {
    let trace = backtrace_thread(thread, DEFAULT_MAX_DEPTH)?;
    Ok(resolve_all(&trace.addresses))
}

/// Captures, resolves and aggregates the stacks of every thread.
pub fn all_stacks() -> MultiStack {
    let mut multi = MultiStack::new();
    for (_, trace) in backtrace_all(DEFAULT_MAX_DEPTH) {
        multi.add(&resolve_all(&trace.addresses));
    }
    multi
}

/// Best-effort lookup of the module containing `address`.
///
/// Uses the dynamic loader first, then a scan of the loaded-module list.
/// `None` when no loaded image covers the address.
pub fn module_of(address: u64) -> Option<ModuleInfo> {
    backend::module_of(address)
}

/// Returns the path of the running executable, or an empty string.
pub fn executable_path() -> String {
    backend::executable_path()
}

/// Returns the symbol search path used by the platform symboliser.
///
/// Only the Windows backend assembles a non-trivial path; elsewhere this is
/// empty.
pub fn symbol_search_path() -> String {
    backend::symbol_search_path()
}
