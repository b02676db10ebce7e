use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use once_cell::sync::Lazy;

/// Which scope of stacks an abort record captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StackType {
    /// Only the aborting thread.
    #[default]
    Thread,
    /// Every thread of the current process.
    AllThreads,
    /// Every thread of every cooperating process, through the registered
    /// global stack hook; falls back to [`StackType::AllThreads`] when no
    /// hook is registered.
    Global,
}

/// Process-wide behaviour of the abort path, read at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortBehavior {
    /// Include memory use in abort reports.
    pub print_memory: bool,
    /// Include the captured stack in abort reports.
    pub print_stack: bool,
    /// Abort locally instead of requesting a global abort through the
    /// registered hook.
    pub throw_exception: bool,
    /// Print the report before taking the process down.
    pub print_on_abort: bool,
    /// Which stacks an abort record captures.
    pub stack_type: StackType,
}

impl Default for AbortBehavior {
    fn default() -> Self {
        AbortBehavior {
            print_memory: true,
            print_stack: true,
            throw_exception: false,
            print_on_abort: true,
            stack_type: StackType::Thread,
        }
    }
}

static BEHAVIOR: Lazy<RwLock<AbortBehavior>> =
    Lazy::new(|| RwLock::new(AbortBehavior::default()));

static DEBUG: AtomicBool = AtomicBool::new(false);

/// Replaces the process-wide abort behaviour.
pub fn set_abort_behavior(behavior: AbortBehavior) {
    let mut current = BEHAVIOR.write().unwrap_or_else(|poison| poison.into_inner());
    *current = behavior;
}

/// The current process-wide abort behaviour.
pub fn abort_behavior() -> AbortBehavior {
    *BEHAVIOR.read().unwrap_or_else(|poison| poison.into_inner())
}

/// Enables or disables [`stackscope_debug!`](crate::stackscope_debug)
/// output.
pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::Relaxed);
}

pub(crate) fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}
