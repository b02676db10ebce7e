use thiserror::Error;

/// Failure to capture a stack.
///
/// Recoverable resolution problems (a missing module, an absent symboliser)
/// never surface here; they degrade the affected frame's fields instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The platform lacks this capability.
    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),
    /// The target thread did not publish its stack before the deadline.
    #[error("thread {0} did not respond to the capture request")]
    Timeout(u64),
    /// The target thread no longer exists.
    #[error("no such thread: {0}")]
    NoSuchThread(u64),
}

/// Failure to load the executable's symbol table.
///
/// The first failure is cached and handed to every subsequent caller until
/// the cache is cleared.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SymbolsError {
    /// Symbol listing is not available on this platform.
    #[error("symbol listing is not supported on this platform")]
    Unsupported,
    /// The listing tool could not be spawned.
    #[error("failed to run symbol lister: {0}")]
    Spawn(String),
    /// The listing tool ran but failed.
    #[error("symbol lister exited with status {0}")]
    ToolFailed(i32),
}
