//! Backend for targets without a dedicated implementation.
//!
//! Current-thread capture still works wherever the `backtrace` crate has
//! unwinder support; everything needing OS help degrades to `Unsupported`
//! or empty data.

use std::collections::BTreeSet;

use crate::error::CaptureError;
use crate::{RawBacktrace, StopReason};

use super::{ModuleInfo, OfflineSymbol, ThreadHandle};

pub(crate) fn capture(max_depth: usize) -> RawBacktrace {
    let mut addresses = Vec::new();
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

pub(crate) fn capture_thread(
    _thread: ThreadHandle,
    _max_depth: usize,
) -> Result<RawBacktrace, CaptureError> {
    Err(CaptureError::Unsupported("cross-thread stack capture"))
}

pub(crate) fn enumerate_threads() -> BTreeSet<ThreadHandle> {
    let mut threads = BTreeSet::new();
    threads.insert(this_thread());
    threads
}

pub(crate) fn this_thread() -> ThreadHandle {
    // No portable native id; hash the std thread id instead.
    use std::hash::{Hash, Hasher};
    let mut hasher = std::hash::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    ThreadHandle(hasher.finish())
}

pub(crate) fn module_of(_address: u64) -> Option<ModuleInfo> {
    None
}

pub(crate) fn symbolise_offline(_object: &str, _address: u64) -> OfflineSymbol {
    OfflineSymbol::default()
}

pub(crate) fn executable_path() -> String {
    std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

pub(crate) fn symbol_search_path() -> String {
    String::new()
}
