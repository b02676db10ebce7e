use stackscope::{StackFrame, StopReason};

// Three nested, never-inlined functions so the capture has a known shape.

#[inline(never)]
fn alpha() -> Vec<StackFrame> {
    let stack = beta();
    // keep the frame alive past the call
    std::hint::black_box(stack)
}

#[inline(never)]
fn beta() -> Vec<StackFrame> {
    std::hint::black_box(gamma())
}

#[inline(never)]
fn gamma() -> Vec<StackFrame> {
    std::hint::black_box(stackscope::current_stack())
}

fn position_of(stack: &[StackFrame], needle: &str) -> Option<usize> {
    stack.iter().position(|f| f.function.contains(needle))
}

#[test]
fn test_nested_calls_appear_innermost_first() {
    let stack = alpha();
    assert!(!stack.is_empty());
    for frame in &stack {
        assert_ne!(frame.address, 0);
        if frame.filename.is_empty() {
            assert_eq!(frame.line, 0);
        }
    }

    // Name resolution needs a symbol source (nm or the platform
    // symboliser); without one, only the structural checks above apply.
    let (Some(g), Some(b), Some(a)) = (
        position_of(&stack, "gamma"),
        position_of(&stack, "beta"),
        position_of(&stack, "alpha"),
    ) else {
        eprintln!("no symbol source available; skipping name-order checks");
        return;
    };
    assert!(g < b, "gamma must be inner to beta: {g} vs {b}");
    assert!(b < a, "beta must be inner to alpha: {b} vs {a}");
}

#[test]
fn test_raw_backtrace_depth_limit() {
    let full = stackscope::backtrace(stackscope::DEFAULT_MAX_DEPTH);
    assert!(!full.addresses.is_empty());

    let clipped = stackscope::backtrace(3);
    assert!(clipped.addresses.len() <= 3);
    assert_eq!(clipped.stop, StopReason::DepthLimit);
    assert!(!clipped.is_complete());
}

#[test]
fn test_active_threads_contains_caller() {
    let threads = stackscope::active_threads();
    assert!(threads.contains(&stackscope::this_thread()));
}

#[test]
fn test_capture_own_thread_via_handle() {
    let trace = stackscope::backtrace_thread(stackscope::this_thread(), 64).unwrap();
    assert!(!trace.addresses.is_empty());
}

#[cfg(target_os = "linux")]
#[test]
fn test_all_stacks_covers_parked_threads() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let stop = Arc::new(AtomicBool::new(false));
    let workers: Vec<_> = (0..3)
        .map(|_| {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            })
        })
        .collect();

    // give the workers a moment to reach the park loop
    std::thread::sleep(std::time::Duration::from_millis(20));
    let multi = stackscope::all_stacks();
    stop.store(true, Ordering::SeqCst);
    for worker in workers {
        worker.join().unwrap();
    }

    // the caller plus at least some of the workers
    assert!(multi.count >= 2, "got {} stacks", multi.count);
    assert!(multi.check_counts());
}

#[test]
fn test_executable_path_points_at_test_binary() {
    let exe = stackscope::executable_path();
    assert!(!exe.is_empty());
    assert!(std::path::Path::new(&exe).exists());
}
