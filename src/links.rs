// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Disappearing links: `register_disappearing_link(slot)` (spec.md §6, §7
//! public API) arranges for `*slot` to be zeroed, rather than keeping its
//! target artificially alive, once that target becomes otherwise
//! unreachable. Grounded on bdwgc's `GC_general_register_disappearing_link`,
//! simplified to a flat registry rather than a hash table keyed by target.

use crate::block::Heap;
use parking_lot::Mutex;

/// One registered slot: `*mut *mut u8` the caller wants nulled out once the
/// object it currently points at is collected.
pub struct DisappearingLinks {
    slots: Mutex<Vec<usize>>,
}

impl DisappearingLinks {
    pub const fn new() -> Self {
        DisappearingLinks {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// `register_disappearing_link(slot)`. Re-registering the same slot
    /// address is a no-op (matches bdwgc's idempotent re-registration).
    pub fn register(&self, slot: *mut *mut u8) {
        let addr = slot as usize;
        let mut slots = self.slots.lock();
        if !slots.contains(&addr) {
            slots.push(addr);
        }
    }

    pub fn unregister(&self, slot: *mut *mut u8) {
        let addr = slot as usize;
        self.slots.lock().retain(|&s| s != addr);
    }

    /// Called once mark has finished but before reclaim: any slot whose
    /// current target did not get marked this cycle is zeroed and dropped
    /// from the registry (spec.md §6 "cleared ... once the target is no
    /// longer reachable").
    pub fn clear_unmarked(&self, heap: &Heap) {
        let mut slots = self.slots.lock();
        slots.retain(|&slot_addr| {
            let slot = slot_addr as *mut *mut u8;
            let target = unsafe { *slot };
            if target.is_null() {
                return false;
            }
            if heap.is_marked(target as usize) {
                true
            } else {
                unsafe { *slot = std::ptr::null_mut() };
                false
            }
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

impl Default for DisappearingLinks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let links = DisappearingLinks::new();
        let mut slot: *mut u8 = std::ptr::null_mut();
        links.register(&mut slot as *mut *mut u8);
        links.register(&mut slot as *mut *mut u8);
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn unregister_removes_the_slot() {
        let links = DisappearingLinks::new();
        let mut slot: *mut u8 = std::ptr::null_mut();
        links.register(&mut slot as *mut *mut u8);
        links.unregister(&mut slot as *mut *mut u8);
        assert_eq!(links.len(), 0);
    }

    #[test]
    fn clear_unmarked_nulls_a_slot_pointing_at_a_dead_heap_object() {
        use crate::block::AllocFlags;
        use crate::objkind::KIND_NORMAL;

        let heap = Heap::new();
        let idx = heap
            .allochblk(64, KIND_NORMAL, AllocFlags::default(), 0)
            .unwrap();
        let addr = heap.with_header(idx, |h| h.block);

        let links = DisappearingLinks::new();
        let mut slot: *mut u8 = addr as *mut u8;
        links.register(&mut slot as *mut *mut u8);

        // Never marked: `clear_unmarked` should null the slot and drop it.
        links.clear_unmarked(&heap);
        assert!(slot.is_null());
        assert_eq!(links.len(), 0);
    }

    #[test]
    fn clear_unmarked_keeps_a_slot_pointing_at_a_marked_object() {
        use crate::block::AllocFlags;
        use crate::objkind::KIND_NORMAL;

        let heap = Heap::new();
        let idx = heap
            .allochblk(64, KIND_NORMAL, AllocFlags::default(), 0)
            .unwrap();
        let addr = heap.with_header(idx, |h| h.block);
        heap.set_mark_bit(addr);

        let links = DisappearingLinks::new();
        let mut slot: *mut u8 = addr as *mut u8;
        links.register(&mut slot as *mut *mut u8);

        links.clear_unmarked(&heap);
        assert!(!slot.is_null());
        assert_eq!(links.len(), 1);
    }
}
