// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Object kinds, per-kind free lists, and the per-block mark-bit / start-of-
//! object maps (spec.md §4.D, §2 component D).

use crate::config::{GRANULE_BYTES, MAXOBJGRANULES};
use crate::mark::Descriptor;
use parking_lot::Mutex;

/// Well-known kind indices, per spec.md §3 "Object kind".
pub const KIND_PTRFREE: usize = 0;
pub const KIND_NORMAL: usize = 1;
pub const KIND_UNCOLLECTABLE: usize = 2;
/// First index available for a caller-registered kind.
pub const FIRST_USER_KIND: usize = 3;

/// Optional callback invoked instead of freeing an object outright when its
/// kind has `HAS_DISCLAIM` set; returning `false` vetoes the reclaim.
pub type DisclaimProc = fn(obj: *mut u8) -> bool;

/// Static description of a class of objects sharing a scanning policy
/// (spec.md §3 "Object kind").
pub struct ObjKind {
    /// Zero-fill new objects of this kind on allocation.
    pub init: bool,
    /// Objects are never scanned for outgoing pointers (PTRFREE-like).
    pub atomic: bool,
    /// Objects are always treated as marked and are never reclaimed
    /// (UNCOLLECTABLE-like), but are still roots for tracing their
    /// children.
    pub uncollectable: bool,
    /// Default mark descriptor used unless an object carries its own
    /// (`DS_PER_OBJECT`). `None` means "conservatively scan the whole
    /// object", resolved against the object's actual length once that is
    /// known (`Heap::setup_header` / `Heap::configure_size_class`); `Some`
    /// is a fixed override, used by atomic kinds (scan nothing) and by
    /// `malloc_explicitly_typed`'s caller-supplied descriptor.
    pub default_descr: Option<Descriptor>,
    pub disclaim: Option<DisclaimProc>,
    /// Per-granule-class free list heads. Index `g` holds objects of
    /// `g` granules.
    pub free_lists: Mutex<Vec<Option<usize>>>,
    /// Per-granule-class list of blocks awaiting sweep ("reclaim list"),
    /// populated by the collector and drained lazily by the allocator.
    pub reclaim_lists: Mutex<Vec<Vec<usize>>>,
}

impl ObjKind {
    fn new(init: bool, atomic: bool, uncollectable: bool, default_descr: Option<Descriptor>) -> Self {
        ObjKind {
            init,
            atomic,
            uncollectable,
            default_descr,
            disclaim: None,
            free_lists: Mutex::new(vec![None; MAXOBJGRANULES + 1]),
            reclaim_lists: Mutex::new(vec![Vec::new(); MAXOBJGRANULES + 1]),
        }
    }
}

/// The registry of all known kinds, indexed by `obj_kind`.
pub struct ObjKindTable {
    kinds: Mutex<Vec<ObjKind>>,
}

impl ObjKindTable {
    pub fn new() -> Self {
        let kinds = vec![
            // PTRFREE: atomic, explicitly never scanned.
            ObjKind::new(false, true, false, Some(Descriptor::Length(0))),
            // NORMAL: conservatively scanned over its own length.
            ObjKind::new(true, false, false, None),
            // UNCOLLECTABLE: conservatively scanned, never reclaimed.
            ObjKind::new(true, false, true, None),
        ];
        ObjKindTable {
            kinds: Mutex::new(kinds),
        }
    }

    /// Register a new, caller-defined kind (the "user-defined" kind named
    /// in spec.md §3). Returns its index.
    pub fn register(
        &self,
        init: bool,
        atomic: bool,
        uncollectable: bool,
        default_descr: Option<Descriptor>,
        disclaim: Option<DisclaimProc>,
    ) -> usize {
        let mut kinds = self.kinds.lock();
        let mut k = ObjKind::new(init, atomic, uncollectable, default_descr);
        k.disclaim = disclaim;
        kinds.push(k);
        kinds.len() - 1
    }

    pub fn with_kind<R>(&self, idx: usize, f: impl FnOnce(&ObjKind) -> R) -> R {
        let kinds = self.kinds.lock();
        f(&kinds[idx])
    }

    pub fn len(&self) -> usize {
        self.kinds.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ObjKindTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-used-block mark-bit storage plus an optional start-of-object map
/// (spec.md §4.D).
#[derive(Debug, Clone)]
pub enum MarkBits {
    /// One bit per slot (index 0..=n_slots, the extra bit is the
    /// always-set "one past end" sentinel that simplifies iteration
    /// termination).
    Bitmap(Vec<u64>),
    /// One byte per slot, enabled when `USE_MARK_BYTES`-equivalent behavior
    /// is requested (faster atomic updates under parallel mark, at the cost
    /// of more memory).
    Bytes(Vec<u8>),
}

impl MarkBits {
    pub fn new_bitmap(n_slots: usize) -> Self {
        let words = (n_slots + 1 + 63) / 64;
        let mut bits = vec![0u64; words];
        set_bit(&mut bits, n_slots); // sentinel "one past end"
        MarkBits::Bitmap(bits)
    }

    pub fn new_bytes(n_slots: usize) -> Self {
        let mut bytes = vec![0u8; n_slots + 1];
        bytes[n_slots] = 1;
        MarkBits::Bytes(bytes)
    }

    pub fn is_set(&self, slot: usize) -> bool {
        match self {
            MarkBits::Bitmap(words) => get_bit(words, slot),
            MarkBits::Bytes(bytes) => bytes[slot] != 0,
        }
    }

    /// Sets the bit for `slot`, returning whether it was previously clear
    /// (i.e. whether this is a newly-discovered reachable object).
    pub fn set(&mut self, slot: usize) -> bool {
        match self {
            MarkBits::Bitmap(words) => {
                let was_set = get_bit(words, slot);
                set_bit(words, slot);
                !was_set
            }
            MarkBits::Bytes(bytes) => {
                let was_set = bytes[slot] != 0;
                bytes[slot] = 1;
                !was_set
            }
        }
    }

    /// Clears every bit except the sentinel (spec.md §4.D `clear_hdr_marks`).
    pub fn clear(&mut self, n_slots: usize) {
        match self {
            MarkBits::Bitmap(words) => {
                for w in words.iter_mut() {
                    *w = 0;
                }
                set_bit(words, n_slots);
            }
            MarkBits::Bytes(bytes) => {
                for b in bytes.iter_mut() {
                    *b = 0;
                }
                bytes[n_slots] = 1;
            }
        }
    }

    /// Sets every bit (spec.md §4.D `set_hdr_marks`, used for
    /// UNCOLLECTABLE blocks).
    pub fn set_all(&mut self) {
        match self {
            MarkBits::Bitmap(words) => {
                for w in words.iter_mut() {
                    *w = u64::MAX;
                }
            }
            MarkBits::Bytes(bytes) => {
                for b in bytes.iter_mut() {
                    *b = 1;
                }
            }
        }
    }

    /// Approximate count of set bits, excluding the sentinel. Per spec.md
    /// §4.D this is only used as an "is this block empty" fast-path hint
    /// and need not be exact under parallel mark.
    pub fn count(&self, n_slots: usize) -> usize {
        (0..n_slots).filter(|&s| self.is_set(s)).count()
    }
}

fn set_bit(words: &mut [u64], bit: usize) {
    words[bit / 64] |= 1 << (bit % 64);
}

fn get_bit(words: &[u64], bit: usize) -> bool {
    words[bit / 64] & (1 << (bit % 64)) != 0
}

/// Precomputed offset -> slot-index map for one size class, turning an
/// interior-pointer lookup into a single indexed load (spec.md §4.D
/// `obj_map`).
pub fn build_obj_map(granules_per_obj: usize, hblk_objs: usize) -> Vec<u16> {
    let obj_bytes = granules_per_obj * GRANULE_BYTES;
    let total_bytes = obj_bytes * hblk_objs;
    let mut map = vec![0u16; total_bytes / GRANULE_BYTES];
    for (i, slot) in map.iter_mut().enumerate() {
        let byte_off = i * GRANULE_BYTES;
        *slot = (byte_off / obj_bytes) as u16;
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_table_has_well_known_kinds() {
        let t = ObjKindTable::new();
        assert_eq!(t.len(), 3);
        t.with_kind(KIND_PTRFREE, |k| assert!(k.atomic));
        t.with_kind(KIND_NORMAL, |k| assert!(!k.atomic && !k.uncollectable));
        t.with_kind(KIND_UNCOLLECTABLE, |k| assert!(k.uncollectable));
    }

    #[test]
    fn mark_bits_set_reports_transition() {
        let mut mb = MarkBits::new_bitmap(10);
        assert!(mb.set(3));
        assert!(!mb.set(3));
        assert!(mb.is_set(3));
        assert!(!mb.is_set(4));
    }

    #[test]
    fn clear_resets_but_keeps_sentinel() {
        let mut mb = MarkBits::new_bitmap(10);
        mb.set(2);
        mb.clear(10);
        assert!(!mb.is_set(2));
        assert!(mb.is_set(10));
    }

    #[test]
    fn obj_map_maps_every_granule_to_its_owning_slot() {
        let map = build_obj_map(2, 4); // 2-granule objects, 4 per block
        assert_eq!(map[0], 0);
        assert_eq!(map[1], 0);
        assert_eq!(map[2], 1);
        assert_eq!(map[3], 1);
    }
}
