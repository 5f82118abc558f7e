// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Black-listing of HBLK-aligned addresses that have been the target of a
//! conservative false pointer (spec.md §4.F "Blacklisting", §2 component B).
//!
//! Two pairs of sets are kept: a "stack" black list (hit by a value found on
//! a thread stack or in registers) and a "normal" black list (hit by a value
//! found inside a heap object, i.e. one mutator-controlled word pointing
//! where it shouldn't). Each pair has an `incomplete` half, accumulating
//! during the in-progress cycle, and a `stable` half, promoted at the end of
//! a cycle (`promote`). Consulting only `stable` during allocation avoids a
//! block being blacklisted and un-blacklisted within the same cycle from
//! confusing the allocator.

use crate::config::HBLKSIZE;
use parking_lot::RwLock;
use std::collections::HashSet;

#[derive(Default)]
struct BlSet {
    incomplete: HashSet<usize>,
    stable: HashSet<usize>,
}

impl BlSet {
    fn add(&mut self, block_addr: usize) {
        self.incomplete.insert(block_addr);
    }

    fn promote(&mut self) {
        for a in self.incomplete.drain() {
            self.stable.insert(a);
        }
    }

    fn contains(&self, block_addr: usize) -> bool {
        self.stable.contains(&block_addr) || self.incomplete.contains(&block_addr)
    }

    fn clear_all(&mut self) {
        self.incomplete.clear();
        self.stable.clear();
    }

    fn len(&self) -> usize {
        self.stable.len() + self.incomplete.len()
    }
}

pub struct BlackList {
    stack_bl: RwLock<BlSet>,
    normal_bl: RwLock<BlSet>,
}

fn block_align(addr: usize) -> usize {
    addr & !(HBLKSIZE - 1)
}

impl BlackList {
    pub const fn new() -> Self {
        BlackList {
            stack_bl: RwLock::new(BlSet {
                incomplete: HashSet::new(),
                stable: HashSet::new(),
            }),
            normal_bl: RwLock::new(BlSet {
                incomplete: HashSet::new(),
                stable: HashSet::new(),
            }),
        }
    }

    /// Record that `candidate` (a value that looked like it might point into
    /// the heap but didn't resolve to a live object start) was found on a
    /// thread stack or in a register.
    pub fn add_stack(&self, candidate: usize) {
        self.stack_bl.write().add(block_align(candidate));
    }

    /// Record that `candidate` was found inside an ordinary heap object.
    pub fn add_normal(&self, candidate: usize) {
        self.normal_bl.write().add(block_align(candidate));
    }

    /// True if the HBLK containing `addr` has been stack-blacklisted (the
    /// allocator should simply skip such blocks for pointerful kinds).
    pub fn is_stack_blacklisted(&self, addr: usize) -> bool {
        self.stack_bl.read().contains(block_align(addr))
    }

    /// True if the HBLK containing `addr` has been blacklisted by either
    /// set. Used by the mark engine's invariant-5 check: a candidate
    /// pointer landing in a blacklisted region is not followed.
    pub fn is_black_listed(&self, addr: usize) -> bool {
        let block = block_align(addr);
        self.stack_bl.read().contains(block) || self.normal_bl.read().contains(block)
    }

    /// Move this cycle's accumulated entries into the stable sets so they
    /// are consulted by subsequent allocations (spec.md §4.I driver:
    /// `promote_black_lists`).
    pub fn promote(&self) {
        self.stack_bl.write().promote();
        self.normal_bl.write().promote();
    }

    /// Drop all black-list state. Used when the caller wants a fresh start,
    /// e.g. after deliberately reclaiming a previously-blacklisted region.
    pub fn clear(&self) {
        self.stack_bl.write().clear_all();
        self.normal_bl.write().clear_all();
    }

    pub fn stack_len(&self) -> usize {
        self.stack_bl.read().len()
    }

    pub fn normal_len(&self) -> usize {
        self.normal_bl.read().len()
    }
}

impl Default for BlackList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshly_created_list_blacklists_nothing() {
        let bl = BlackList::new();
        assert!(!bl.is_black_listed(0x1000));
    }

    #[test]
    fn stack_hits_are_not_visible_until_promoted() {
        let bl = BlackList::new();
        bl.add_stack(0x1000);
        // Incomplete entries are still consulted within the same cycle
        // (spec.md invariant 5 must hold continuously, not just after
        // promotion), so this is visible immediately...
        assert!(bl.is_black_listed(0x1000));
        bl.promote();
        // ...and remains visible after promotion.
        assert!(bl.is_black_listed(0x1000));
        assert!(bl.is_stack_blacklisted(0x1000));
    }

    #[test]
    fn block_alignment_groups_interior_addresses() {
        let bl = BlackList::new();
        bl.add_normal(0x1234);
        assert!(bl.is_black_listed(0x1000));
        assert!(bl.is_black_listed(0x1fff));
        assert!(!bl.is_black_listed(0x2000));
    }

    #[test]
    fn clear_removes_both_sets() {
        let bl = BlackList::new();
        bl.add_stack(0x4000);
        bl.add_normal(0x8000);
        bl.clear();
        assert!(!bl.is_black_listed(0x4000));
        assert!(!bl.is_black_listed(0x8000));
    }
}
