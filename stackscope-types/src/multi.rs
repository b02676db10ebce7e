use serde::{Deserialize, Serialize};

use crate::frame::StackFrame;

/// One node of a [`MultiStack`]: a frame plus the number of threads whose
/// stacks include that frame at this depth.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StackNode {
    /// The frame shared by `count` contributing stacks.
    pub frame: StackFrame,
    /// Number of threads passing through this frame at this depth.
    pub count: u32,
    /// Continuations of the stacks sharing this prefix.
    pub children: Vec<StackNode>,
}

/// A prefix-shared tree summarising the call stacks of multiple threads.
///
/// The root is empty; stacks are inserted in capture order (innermost frame
/// first), so stacks whose leading frames agree share a single subtree — at
/// an all-thread dump, threads parked in the same place collapse into one
/// chain. Children are kept sorted by descending `count`, ties broken by
/// ascending frame address, so two captures of the same state render
/// identically.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct MultiStack {
    /// Total number of stacks folded into the tree.
    pub count: u32,
    /// First (innermost) frames of the contributing stacks.
    pub children: Vec<StackNode>,
}

impl MultiStack {
    /// Creates an empty tree.
    pub fn new() -> Self {
        MultiStack::default()
    }

    /// Whether any stack has been folded in.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Resets the tree.
    pub fn clear(&mut self) {
        self.count = 0;
        self.children.clear();
    }

    /// Folds one stack (innermost frame first) into the tree.
    pub fn add(&mut self, stack: &[StackFrame]) {
        self.count += 1;
        let mut children = &mut self.children;
        for frame in stack {
            match children.iter().position(|c| c.frame.same_call(frame)) {
                Some(idx) => children[idx].count += 1,
                None => children.push(StackNode {
                    frame: frame.clone(),
                    count: 1,
                    children: Vec::new(),
                }),
            }
            sort_siblings(children);
            let idx = children
                .iter()
                .position(|c| c.frame.same_call(frame))
                .expect("frame inserted above");
            children = &mut children[idx].children;
        }
    }

    /// Walks the unambiguous leading chain of the tree.
    ///
    /// Returns the nodes from the root for as long as each level has exactly
    /// one child. This chain is where every contributing stack agrees, e.g.
    /// the shared capture machinery at the innermost end.
    pub fn root_chain(&self) -> Vec<&StackNode> {
        let mut chain = Vec::new();
        let mut children = &self.children;
        while children.len() == 1 {
            let node = &children[0];
            chain.push(node);
            children = &node.children;
        }
        chain
    }

    /// Checks the structural counting invariant of every node.
    ///
    /// For each node, the children's counts must not sum past the node's own
    /// count.
    pub fn check_counts(&self) -> bool {
        fn sum_ok(count: u32, children: &[StackNode]) -> bool {
            let total: u32 = children.iter().map(|c| c.count).sum();
            total <= count && children.iter().all(|c| sum_ok(c.count, &c.children))
        }
        sum_ok(self.count, &self.children)
    }
}

impl From<&[StackFrame]> for MultiStack {
    fn from(stack: &[StackFrame]) -> Self {
        let mut multi = MultiStack::new();
        multi.add(stack);
        multi
    }
}

impl From<Vec<Vec<StackFrame>>> for MultiStack {
    fn from(stacks: Vec<Vec<StackFrame>>) -> Self {
        let mut multi = MultiStack::new();
        for stack in &stacks {
            multi.add(stack);
        }
        multi
    }
}

fn sort_siblings(children: &mut [StackNode]) {
    children.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then(a.frame.address.cmp(&b.frame.address))
    });
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

    // innermost-first, like capture output
    fn stack(names: &[(&str, u64)]) -> Vec<StackFrame> {
        names.iter().map(|&(n, a)| frame(n, a)).collect()
    }

    #[test]
    fn aggregates_shared_prefixes() {
        let mut multi = MultiStack::new();
        multi.add(&stack(&[("a", 1), ("b", 2), ("c", 3)]));
        multi.add(&stack(&[("a", 1), ("b", 2), ("d", 4)]));
        multi.add(&stack(&[("a", 1), ("e", 5)]));

        assert_eq!(multi.count, 3);
        assert_eq!(multi.children.len(), 1);

        let a = &multi.children[0];
        assert_eq!(a.frame.function, "a");
        assert_eq!(a.count, 3);
        assert_eq!(a.children.len(), 2);

        // b(2) sorts before e(1)
        let b = &a.children[0];
        assert_eq!(b.frame.function, "b");
        assert_eq!(b.count, 2);
        let e = &a.children[1];
        assert_eq!(e.frame.function, "e");
        assert_eq!(e.count, 1);

        // equal counts order by address: c(3) before d(4)
        assert_eq!(b.children.len(), 2);
        assert_eq!(b.children[0].frame.function, "c");
        assert_eq!(b.children[1].frame.function, "d");

        assert!(multi.check_counts());
    }

    #[test]
    fn deterministic_regardless_of_insertion_order() {
        let stacks = [
            stack(&[("a", 1), ("b", 2), ("c", 3)]),
            stack(&[("a", 1), ("b", 2), ("d", 4)]),
            stack(&[("a", 1), ("e", 5)]),
        ];

        let mut forward = MultiStack::new();
        for s in &stacks {
            forward.add(s);
        }
        let mut reverse = MultiStack::new();
        for s in stacks.iter().rev() {
            reverse.add(s);
        }
        assert_eq!(forward, reverse);
    }

    #[test]
    fn root_chain_stops_at_divergence() {
        let mut multi = MultiStack::new();
        multi.add(&stack(&[("a", 1), ("b", 2), ("c", 3)]));
        multi.add(&stack(&[("a", 1), ("b", 2), ("d", 4)]));

        let chain = multi.root_chain();
        let names: Vec<&str> = chain.iter().map(|n| n.frame.function.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn single_stack_keeps_capture_order() {
        let s = stack(&[("inner", 2), ("outer", 1)]);
        let multi: MultiStack = s.as_slice().into();
        assert_eq!(multi.count, 1);
        let chain = multi.root_chain();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].frame.function, "inner");
        assert_eq!(chain[1].frame.function, "outer");
    }

    #[test]
    fn counts_hold_for_empty_and_cleared() {
        let mut multi = MultiStack::new();
        assert!(multi.is_empty());
        assert!(multi.check_counts());

        multi.add(&stack(&[("a", 1)]));
        assert!(!multi.is_empty());
        multi.clear();
        assert!(multi.is_empty());
        assert!(multi.children.is_empty());
    }
}
