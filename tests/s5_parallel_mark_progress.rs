// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! spec.md §8 scenario S5: with `GC_MARKERS` set to enable parallel mark,
//! every node of a large binary tree must have its mark bit set after one
//! collection — the work-stealing drain (`mark::parallel_drain`) must reach
//! a true fixed point, not just whatever the initiating thread's own local
//! stack happened to cover. The spec's "< 2x single-threaded wall time"
//! bound is not asserted here: wall-clock comparisons are too
//! environment-dependent to make a reliable `#[test]`, and `GC_MARKERS` is
//! read once per process, so a same-process single-vs-parallel comparison
//! isn't possible from one test binary anyway.

use gcmalloc::{Debug, Gc};

struct Node {
    left: Option<Gc<Node>>,
    right: Option<Gc<Node>>,
}

fn build(depth: usize) -> Gc<Node> {
    if depth == 0 {
        Gc::new(Node {
            left: None,
            right: None,
        })
    } else {
        let left = build(depth - 1);
        let right = build(depth - 1);
        Gc::new(Node {
            left: Some(left),
            right: Some(right),
        })
    }
}

fn count_black(node: Gc<Node>) -> usize {
    let mut n = usize::from(Debug::is_black(node.as_ptr() as *mut u8));
    if let Some(l) = node.left {
        n += count_black(l);
    }
    if let Some(r) = node.right {
        n += count_black(r);
    }
    n
}

// spec.md §8 calls for depth 20 (~10^6 nodes); scaled down to keep this
// test's wall time and memory use reasonable while still exercising the same
// multi-helper mark-stack work-stealing path `parallel_drain` implements.
const DEPTH: usize = 17;

#[test]
fn parallel_mark_reaches_every_node_of_a_large_tree() {
    std::env::set_var("GC_MARKERS", "4");

    let root = build(DEPTH);
    gcmalloc::collect();

    let expected = (1usize << (DEPTH + 1)) - 1;
    assert_eq!(count_black(root), expected);
}
