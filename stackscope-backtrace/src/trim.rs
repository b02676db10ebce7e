//! Removal of capture-machinery frames from an aggregated trace.

use stackscope_types::{MultiStack, StackFrame};

use crate::utils::in_module;

/// Module paths and bare symbols that are part of acquiring a trace rather
/// than of the traced program. Everything a capture enters through lands
/// here: the public capture calls, the unwinder, and the signal trampolines
/// that deliver a capture request or a crash signal.
const CAPTURE_MACHINERY: &[&str] = &[
    "stackscope_backtrace::",
    "stackscope_signal::",
    "stackscope::abort",
    "backtrace::",
    "__libc_restore",
    "__restore_rt",
    "_sigtramp",
    "killpg",
    "gsignal",
    "raise",
    "abort",
];

fn is_capture_frame(frame: &StackFrame) -> bool {
    if frame.function.is_empty() {
        return false;
    }
    CAPTURE_MACHINERY
        .iter()
        .any(|pattern| in_module(&frame.function, pattern))
}

/// Prunes the leading frames that belong to the trace-capture machinery.
///
/// Every stack in the tree enters capture through the same code path, so
/// those frames form a single chain at the root. The chain is stripped node
/// by node until the first frame that is not capture machinery; pruning
/// stops early if the tree diverges. Calling this twice is a no-op the
/// second time.
pub fn cleanup_stack_trace(stack: &mut MultiStack) {
    while stack.children.len() == 1 && is_capture_frame(&stack.children[0].frame) {
        let node = stack.children.swap_remove(0);
        stack.children = node.children;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(name: &str, address: u64) -> StackFrame {
        StackFrame {
            address,
            function: name.into(),
            ..Default::default()
        }
    }

    fn machinery_stack() -> Vec<StackFrame> {
        vec![
            frame("backtrace::trace::h0123456789abcdef", 0x10),
            frame("stackscope_backtrace::backtrace", 0x20),
            frame("app::compute", 0x30),
            frame("app::main", 0x40),
        ]
    }

    #[test]
    fn strips_leading_machinery() {
        let mut multi = MultiStack::new();
        multi.add(&machinery_stack());
        cleanup_stack_trace(&mut multi);

        let chain = multi.root_chain();
        let names: Vec<&str> = chain.iter().map(|n| n.frame.function.as_str()).collect();
        assert_eq!(names, ["app::compute", "app::main"]);
        assert_eq!(multi.count, 1);
    }

    #[test]
    fn cleanup_is_idempotent() {
        let mut multi = MultiStack::new();
        multi.add(&machinery_stack());
        cleanup_stack_trace(&mut multi);
        let once = multi.clone();
        cleanup_stack_trace(&mut multi);
        assert_eq!(multi, once);
    }

    #[test]
    fn stops_at_divergence() {
        // two threads diverge inside the machinery; nothing below the
        // divergence point is touched
        let mut multi = MultiStack::new();
        multi.add(&[
            frame("stackscope_backtrace::backtrace", 0x10),
            frame("app::worker_a", 0x20),
        ]);
        multi.add(&[
            frame("stackscope_backtrace::backtrace", 0x10),
            frame("app::worker_b", 0x30),
        ]);
        cleanup_stack_trace(&mut multi);

        assert_eq!(multi.children.len(), 2);
        let names: Vec<&str> = multi
            .children
            .iter()
            .map(|n| n.frame.function.as_str())
            .collect();
        assert_eq!(names, ["app::worker_a", "app::worker_b"]);
    }

    #[test]
    fn leaves_user_frames_alone() {
        let mut multi = MultiStack::new();
        multi.add(&[frame("app::main", 0x40)]);
        let before = multi.clone();
        cleanup_stack_trace(&mut multi);
        assert_eq!(multi, before);
    }

    #[test]
    fn empty_tree_is_untouched() {
        let mut multi = MultiStack::new();
        cleanup_stack_trace(&mut multi);
        assert!(multi.is_empty());
    }

    #[test]
    fn signal_trampolines_are_machinery() {
        assert!(is_capture_frame(&frame("__restore_rt", 0x1)));
        assert!(is_capture_frame(&frame("_sigtramp", 0x2)));
        assert!(!is_capture_frame(&frame("application::run", 0x3)));
        assert!(!is_capture_frame(&StackFrame::from_address(0x4)));
    }
}
