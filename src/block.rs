// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The heap block allocator: size-segregated free lists of aligned coarse
//! blocks (HBLKs), coalescing, and lazy unmap (spec.md §4.C, §2 component C).
//! Also owns the block header arena shared by every other subsystem.

use crate::addr_map::{AddrMap, HdrIdx, MapEntry};
use crate::blacklist::BlackList;
use crate::config::{
    BLACKLISTED_DROP_RATE, HBLKSIZE, HUGE_THRESHOLD, N_HBLK_FLS, UNIQUE_THRESHOLD, UNMAP_THRESHOLD,
};
use crate::error::{current_gc_no, fatal_abort, GcError};
use crate::mark::Descriptor;
use crate::objkind::{MarkBits, ObjKindTable, KIND_NORMAL, KIND_PTRFREE, KIND_UNCOLLECTABLE};
use crate::os_alloc;
use packed_struct::prelude::*;
use packed_struct_codegen::PackedStruct;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

static_assertions::const_assert!(HBLKSIZE.is_power_of_two());

/// Bit flags carried in a block header (spec.md §3 "Block header (HDR)").
/// Packed via `packed_struct` into a single byte, the same way the teacher's
/// `packed_struct`/`packed_struct_codegen` dependencies are meant to encode
/// small fixed-width bitfields.
#[derive(PackedStruct, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "1")]
pub struct HdrFlags {
    #[packed_field(bits = "0")]
    pub free_blk: bool,
    #[packed_field(bits = "1")]
    pub was_unmapped: bool,
    #[packed_field(bits = "2")]
    pub large_block: bool,
    #[packed_field(bits = "3")]
    pub ignore_off_page: bool,
    #[packed_field(bits = "4")]
    pub has_disclaim: bool,
    #[packed_field(bits = "5")]
    pub mark_unconditionally: bool,
}

/// Caller-supplied request flags for `allochblk` (spec.md §4.C inputs).
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocFlags {
    pub ignore_off_page: bool,
}

/// One block header (spec.md §3 "Block header (HDR)"). Object size (`sz`)
/// and the total span of the HBLK run this header owns (`blk_bytes`) are
/// kept as separate fields rather than one overloaded word: bdwgc reuses
/// `hb_sz` for both meanings depending on `FREE_BLK`, which the REDESIGN
/// FLAGS direct us away from in favor of explicit state.
pub struct Hdr {
    pub sz: usize,
    pub blk_bytes: usize,
    pub obj_kind: usize,
    pub flags: HdrFlags,
    pub descr: Descriptor,
    pub marks: MarkBits,
    pub n_marks: AtomicUsize,
    pub map: Option<Vec<u16>>,
    pub prev: Option<HdrIdx>,
    pub next: Option<HdrIdx>,
    pub last_reclaimed: usize,
    pub block: usize,
}

impl Hdr {
    fn new_free(block: usize, blk_bytes: usize) -> Self {
        Hdr {
            sz: blk_bytes,
            blk_bytes,
            obj_kind: 0,
            flags: HdrFlags {
                free_blk: true,
                ..Default::default()
            },
            descr: Descriptor::Length(0),
            marks: MarkBits::new_bitmap(0),
            n_marks: AtomicUsize::new(0),
            map: None,
            prev: None,
            next: None,
            last_reclaimed: current_gc_no(),
            block,
        }
    }

    pub fn hblk_objs(&self) -> usize {
        if self.sz == 0 {
            0
        } else {
            self.blk_bytes / self.sz
        }
    }

    pub fn is_free(&self) -> bool {
        self.flags.free_blk
    }
}

struct HeaderArena {
    headers: Vec<Hdr>,
    free_slots: Vec<HdrIdx>,
}

impl HeaderArena {
    fn new() -> Self {
        HeaderArena {
            headers: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    /// Allocate a header slot from the dedicated header arena. This never
    /// recurses into the object allocator (`generic_malloc_inner`): the
    /// backing `Vec<Hdr>` grows via the ordinary process allocator, which is
    /// independent of the GC's own heap (spec.md §4.A: "The header allocator
    /// itself must not recurse into the normal allocator").
    fn alloc(&mut self, hdr: Hdr) -> HdrIdx {
        if let Some(idx) = self.free_slots.pop() {
            self.headers[idx] = hdr;
            idx
        } else {
            self.headers.push(hdr);
            self.headers.len() - 1
        }
    }

    fn free(&mut self, idx: HdrIdx) {
        self.free_slots.push(idx);
    }
}

/// The heap: address map, header arena, free-list buckets, black list, and
/// object-kind registry. One instance is shared process-wide behind the
/// global allocator lock (spec.md §5).
pub struct Heap {
    pub addr_map: AddrMap,
    headers: Mutex<HeaderArena>,
    free_lists: [Mutex<Option<HdrIdx>>; N_HBLK_FLS + 1],
    pub kinds: ObjKindTable,
    pub blacklist: BlackList,
    pub large_free_bytes: AtomicUsize,
    pub bytes_allocd: AtomicUsize,
    pub bytes_freed: AtomicUsize,
    pub non_gc_bytes: AtomicUsize,
    least_heap_addr: AtomicUsize,
    greatest_heap_addr: AtomicUsize,
    consecutive_blacklist_drops: AtomicUsize,
    /// Addresses pinned live by `Debug::keep_alive`, independent of the
    /// per-cycle mark bitmap (spec.md §9 debug/test introspection). Consulted
    /// by the reclaim phase alongside `is_marked` so a pin survives even a
    /// cycle that runs with mark tracing disabled.
    pinned: Mutex<std::collections::HashSet<usize>>,
}

/// `blocks_needed -> free-list bucket`, per spec.md §3 "Free heap block free
/// list array" (grounded on `original_source/allchblk.c`'s
/// `GC_hblk_fl_from_blocks`).
pub fn fl_index(blocks_needed: usize) -> usize {
    if blocks_needed <= UNIQUE_THRESHOLD {
        blocks_needed
    } else if blocks_needed >= HUGE_THRESHOLD {
        N_HBLK_FLS
    } else {
        (blocks_needed - UNIQUE_THRESHOLD) / crate::config::FL_COMPRESSION + UNIQUE_THRESHOLD
    }
}

/// A block count guaranteed to map back to bucket `i` (the smallest such
/// count for compressed buckets). Used for the round-trip property in
/// spec.md §8 property 6.
pub fn fl_index_inv(i: usize) -> usize {
    if i == 0 {
        0
    } else if i <= UNIQUE_THRESHOLD {
        i
    } else if i == N_HBLK_FLS {
        HUGE_THRESHOLD
    } else {
        (i - UNIQUE_THRESHOLD) * crate::config::FL_COMPRESSION + UNIQUE_THRESHOLD
    }
}

fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            addr_map: AddrMap::new(),
            headers: Mutex::new(HeaderArena::new()),
            free_lists: std::array::from_fn(|_| Mutex::new(None)),
            kinds: ObjKindTable::new(),
            blacklist: BlackList::new(),
            large_free_bytes: AtomicUsize::new(0),
            bytes_allocd: AtomicUsize::new(0),
            bytes_freed: AtomicUsize::new(0),
            non_gc_bytes: AtomicUsize::new(0),
            least_heap_addr: AtomicUsize::new(usize::MAX),
            greatest_heap_addr: AtomicUsize::new(0),
            consecutive_blacklist_drops: AtomicUsize::new(0),
            pinned: Mutex::new(std::collections::HashSet::new()),
        }
    }

    fn note_heap_extent(&self, start: usize, end: usize) {
        self.least_heap_addr.fetch_min(start, Ordering::AcqRel);
        self.greatest_heap_addr.fetch_max(end, Ordering::AcqRel);
    }

    pub fn with_header<R>(&self, idx: HdrIdx, f: impl FnOnce(&mut Hdr) -> R) -> R {
        let mut arena = self.headers.lock();
        f(&mut arena.headers[idx])
    }

    /// `header_of(addr)` (spec.md §4.A). Resolves continuations to their
    /// owning header.
    pub fn header_of(&self, addr: usize) -> Option<HdrIdx> {
        let block_addr = addr & !(HBLKSIZE - 1);
        match self.addr_map.lookup(block_addr) {
            MapEntry::Vacant => None,
            MapEntry::Block(idx) => Some(idx),
            MapEntry::Continuation(owner) => Some(owner),
        }
    }

    /// Grow the heap by mapping a fresh region of at least `min_bytes`,
    /// installing it as one large free block.
    fn grow(&self, min_bytes: usize) -> Option<HdrIdx> {
        let region = os_alloc::scratch_alloc(min_bytes)?;
        let start = region.as_ptr() as usize;
        let len = {
            let rounded = (min_bytes + HBLKSIZE - 1) & !(HBLKSIZE - 1);
            rounded
        };
        self.note_heap_extent(start, start + len);
        let idx = self.install_free_block(start, len);
        Some(idx)
    }

    fn install_free_block(&self, start: usize, len: usize) -> HdrIdx {
        let hdr = Hdr::new_free(start, len);
        let idx = self.headers.lock().alloc(hdr);
        self.addr_map.install(start, MapEntry::Block(idx));
        self.addr_map.install_continuations(start, len, idx);
        self.push_free(idx, len);
        self.large_free_bytes.fetch_add(len, Ordering::AcqRel);
        idx
    }

    fn push_free(&self, idx: HdrIdx, len: usize) {
        let blocks = len / HBLKSIZE;
        let bucket = fl_index(blocks);
        let start_addr = self.with_header(idx, |h| h.block);
        let mut head_slot = self.free_lists[bucket].lock();
        // Address-ordered ascending insertion (spec.md §3 invariant).
        let mut cursor = *head_slot;
        let mut prev: Option<HdrIdx> = None;
        while let Some(c) = cursor {
            let (c_addr, c_next) = self.with_header(c, |h| (h.block, h.next));
            if c_addr > start_addr {
                break;
            }
            prev = Some(c);
            cursor = c_next;
        }
        self.with_header(idx, |h| {
            h.prev = prev;
            h.next = cursor;
        });
        if let Some(c) = cursor {
            self.with_header(c, |h| h.prev = Some(idx));
        }
        match prev {
            Some(p) => self.with_header(p, |h| h.next = Some(idx)),
            None => *head_slot = Some(idx),
        }
    }

    fn remove_free(&self, idx: HdrIdx, bucket: usize) {
        let (prev, next) = self.with_header(idx, |h| (h.prev, h.next));
        let mut head_slot = self.free_lists[bucket].lock();
        match prev {
            Some(p) => self.with_header(p, |h| h.next = next),
            None => *head_slot = next,
        }
        if let Some(n) = next {
            self.with_header(n, |h| h.prev = prev);
        }
        self.with_header(idx, |h| {
            h.prev = None;
            h.next = None;
        });
    }

    /// Heuristic upper bound on how many buckets above `start_list`
    /// `allochblk` may split into (spec.md §4.C step 3).
    fn split_limit(&self, start_list: usize) -> usize {
        let free_bytes = self.large_free_bytes.load(Ordering::Acquire);
        if free_bytes > HBLKSIZE * HUGE_THRESHOLD * 4 {
            N_HBLK_FLS
        } else {
            (start_list + UNIQUE_THRESHOLD).min(N_HBLK_FLS)
        }
    }

    /// `allochblk` (spec.md §4.C): size-class bucketed first-fit search with
    /// alignment and black-list avoidance, splitting the remainder back
    /// onto the correct free list.
    pub fn allochblk(
        &self,
        adjusted_sz: usize,
        kind: usize,
        flags: AllocFlags,
        align_m1: usize,
    ) -> Option<HdrIdx> {
        let blocks_needed = ceil_div(adjusted_sz, HBLKSIZE);
        let size_needed = blocks_needed * HBLKSIZE;
        let start_list = fl_index(blocks_needed);
        let pointerful = kind != KIND_PTRFREE && kind != KIND_UNCOLLECTABLE;

        if let Some(idx) = self.scan_bucket(start_list, size_needed, align_m1, pointerful, flags) {
            return self.finish_alloc(idx, size_needed, kind);
        }

        let limit = self.split_limit(start_list);
        for bucket in (start_list + 1)..=limit {
            if let Some(idx) = self.scan_bucket(bucket, size_needed, align_m1, pointerful, flags) {
                return self.finish_alloc(idx, size_needed, kind);
            }
        }

        // Heap exhausted for this request: grow and retry once.
        self.grow(size_needed.max(HBLKSIZE * 16))?;
        for bucket in start_list..=N_HBLK_FLS {
            if let Some(idx) = self.scan_bucket(bucket, size_needed, align_m1, pointerful, flags) {
                return self.finish_alloc(idx, size_needed, kind);
            }
        }
        None
    }

    fn scan_bucket(
        &self,
        bucket: usize,
        size_needed: usize,
        align_m1: usize,
        pointerful: bool,
        flags: AllocFlags,
    ) -> Option<HdrIdx> {
        let mut cursor = *self.free_lists[bucket].lock();
        while let Some(idx) = cursor {
            let (addr, span, next) = self.with_header(idx, |h| (h.block, h.blk_bytes, h.next));
            let align_ofs = if align_m1 == 0 {
                0
            } else {
                (align_m1 + 1 - (addr & align_m1)) & align_m1
            };
            if span >= size_needed + align_ofs {
                if pointerful && !flags.ignore_off_page && self.region_fully_blacklisted(addr, size_needed) {
                    let drop_it = self
                        .consecutive_blacklist_drops
                        .fetch_add(1, Ordering::AcqRel)
                        % BLACKLISTED_DROP_RATE
                        == 0;
                    if !drop_it {
                        cursor = next;
                        continue;
                    }
                }
                return Some(idx);
            }
            cursor = next;
        }
        None
    }

    fn region_fully_blacklisted(&self, addr: usize, len: usize) -> bool {
        let mut off = 0;
        while off < len {
            if !self.blacklist.is_stack_blacklisted(addr + off) {
                return false;
            }
            off += HBLKSIZE;
        }
        true
    }

    fn finish_alloc(&self, idx: HdrIdx, size_needed: usize, kind: usize) -> Option<HdrIdx> {
        let bucket = fl_index(self.with_header(idx, |h| h.blk_bytes) / HBLKSIZE);
        self.remove_free(idx, bucket);
        let (addr, span) = self.with_header(idx, |h| (h.block, h.blk_bytes));
        // The whole found block leaves the free lists here; `install_free_block`
        // below adds back only whatever's left over from a split, so the net
        // change lands at exactly `-size_needed`.
        self.large_free_bytes.fetch_sub(span, Ordering::AcqRel);

        let used_idx = if span > size_needed {
            // Split: carve `size_needed` bytes for the caller, return the
            // remainder to its free list (spec.md §4.C step 5).
            let rest_addr = addr + size_needed;
            let rest_len = span - size_needed;
            self.with_header(idx, |h| {
                h.blk_bytes = size_needed;
                h.sz = size_needed;
            });
            self.install_free_block(rest_addr, rest_len);
            idx
        } else {
            idx
        };

        if self.with_header(used_idx, |h| h.flags.was_unmapped) {
            let remapped = unsafe { os_alloc::remap(addr, size_needed) };
            if !remapped {
                return None;
            }
        }

        self.setup_header(used_idx, kind, size_needed);
        self.consecutive_blacklist_drops.store(0, Ordering::Release);
        Some(used_idx)
    }

    /// Write kind/size/descriptor/flags/mark map for a freshly-carved block
    /// (spec.md §4.C step 6 "call `setup_header`").
    fn setup_header(&self, idx: HdrIdx, kind: usize, blk_bytes: usize) {
        let default_descr = self.kinds.with_kind(kind, |k| k.default_descr);
        let uncollectable = self.kinds.with_kind(kind, |k| k.uncollectable);
        self.with_header(idx, |h| {
            h.obj_kind = kind;
            h.flags = HdrFlags {
                free_blk: false,
                was_unmapped: false,
                large_block: blk_bytes > HBLKSIZE,
                ..Default::default()
            };
            // Object size is set by the caller (`alloc.rs`) once it knows
            // the granule class being carved from this block; until then
            // this header describes one large object spanning the whole
            // block (the common case for `alloc_large_and_clear`).
            h.sz = blk_bytes;
            h.descr = default_descr.unwrap_or(Descriptor::Length(blk_bytes));
            h.blk_bytes = blk_bytes;
            let n_slots = h.hblk_objs().max(1);
            h.marks = MarkBits::new_bitmap(n_slots);
            if uncollectable {
                h.marks.set_all();
            }
            h.last_reclaimed = current_gc_no();
        });
    }

    /// Re-slice an already-`setup_header`'d block into `n_slots` objects of
    /// `obj_bytes` each (called once the object allocator knows the final
    /// granule class for a freshly carved block).
    pub fn configure_size_class(&self, idx: HdrIdx, obj_bytes: usize) {
        let kind = self.with_header(idx, |h| h.obj_kind);
        let uncollectable = self.kinds.with_kind(kind, |k| k.uncollectable);
        let default_descr = self.kinds.with_kind(kind, |k| k.default_descr);
        self.with_header(idx, |h| {
            h.sz = obj_bytes;
            h.descr = default_descr.unwrap_or(Descriptor::Length(obj_bytes));
            let n_slots = h.hblk_objs().max(1);
            h.marks = MarkBits::new_bitmap(n_slots);
            if uncollectable {
                h.marks.set_all();
            }
        });
    }

    /// `freehblk` (spec.md §4.C): returns a used block to the free lists,
    /// coalescing with mapped, physically adjacent free neighbors.
    pub fn freehblk(&self, idx: HdrIdx) {
        let (addr, mut span, already_free) =
            self.with_header(idx, |h| (h.block, h.blk_bytes, h.is_free()));
        if already_free {
            fatal_abort(GcError::DuplicateFree);
        }
        self.with_header(idx, |h| {
            h.flags.free_blk = true;
            h.last_reclaimed = current_gc_no();
        });

        let mut base = addr;
        let mut owner = idx;

        // Forward coalesce.
        if let MapEntry::Block(next_idx) = self.addr_map.lookup(base + span) {
            if self.with_header(next_idx, |h| h.is_free())
                && !self.with_header(next_idx, |h| h.flags.was_unmapped)
                && !self.with_header(owner, |h| h.flags.was_unmapped)
            {
                let next_span = self.with_header(next_idx, |h| h.blk_bytes);
                if span.checked_add(next_span).is_some() {
                    self.unlink_free(next_idx, next_span);
                    self.addr_map.remove(base + span);
                    self.addr_map.remove_continuations(base + span, next_span);
                    span += next_span;
                    self.headers.lock().free(next_idx);
                }
            }
        }

        // Backward coalesce: find whichever header ends exactly at `base`.
        if let Some(prev_idx) = self.header_ending_at(base) {
            if self.with_header(prev_idx, |h| h.is_free())
                && !self.with_header(prev_idx, |h| h.flags.was_unmapped)
                && !self.with_header(owner, |h| h.flags.was_unmapped)
            {
                let prev_addr = self.with_header(prev_idx, |h| h.block);
                let prev_span = self.with_header(prev_idx, |h| h.blk_bytes);
                if prev_span.checked_add(span).is_some() {
                    self.unlink_free(prev_idx, prev_span);
                    self.addr_map.remove(base);
                    self.addr_map.remove_continuations(base, span);
                    self.headers.lock().free(owner);
                    base = prev_addr;
                    span = prev_span + span;
                    owner = prev_idx;
                }
            }
        }

        self.with_header(owner, |h| {
            h.block = base;
            h.blk_bytes = span;
            h.sz = span;
            h.flags.free_blk = true;
        });
        self.addr_map.install(base, MapEntry::Block(owner));
        self.addr_map.install_continuations(base, span, owner);
        self.push_free(owner, span);
        self.large_free_bytes.fetch_add(span, Ordering::AcqRel);
    }

    fn unlink_free(&self, idx: HdrIdx, span: usize) {
        let bucket = fl_index(span / HBLKSIZE);
        self.remove_free(idx, bucket);
    }

    /// Finds the header of the free block (if any) whose span ends exactly
    /// at `addr`, using the address map's continuation markers for an O(1)
    /// lookup rather than bdwgc's free-list scan.
    fn header_ending_at(&self, addr: usize) -> Option<HdrIdx> {
        if addr < HBLKSIZE {
            return None;
        }
        let probe = addr - HBLKSIZE;
        let idx = match self.addr_map.lookup(probe) {
            MapEntry::Vacant => return None,
            MapEntry::Block(i) => i,
            MapEntry::Continuation(owner) => owner,
        };
        let (block, span) = self.with_header(idx, |h| (h.block, h.blk_bytes));
        if block + span == addr {
            Some(idx)
        } else {
            None
        }
    }

    /// Unmap free blocks that have sat idle since before `cycle -
    /// UNMAP_THRESHOLD` (spec.md §4.C "Lazy unmap").
    pub fn unmap_old(&self, cycle: usize) {
        if cycle < UNMAP_THRESHOLD {
            return;
        }
        let threshold = cycle - UNMAP_THRESHOLD;
        for bucket in 0..=N_HBLK_FLS {
            let mut cursor = *self.free_lists[bucket].lock();
            while let Some(idx) = cursor {
                let (addr, span, last, unmapped, next) = self.with_header(idx, |h| {
                    (h.block, h.blk_bytes, h.last_reclaimed, h.flags.was_unmapped, h.next)
                });
                if !unmapped && last < threshold {
                    unsafe { os_alloc::unmap(addr, span) };
                    self.with_header(idx, |h| h.flags.was_unmapped = true);
                }
                cursor = next;
            }
        }
    }

    /// Opportunistically unmap the gap between an unmapped and an adjacent
    /// mapped free block to avoid perpetually fragmenting the unmap state
    /// (spec.md §4.C `merge_unmapped`).
    pub fn merge_unmapped(&self) {
        for bucket in 0..=N_HBLK_FLS {
            let mut cursor = *self.free_lists[bucket].lock();
            while let Some(idx) = cursor {
                let (addr, span, unmapped, next) =
                    self.with_header(idx, |h| (h.block, h.blk_bytes, h.flags.was_unmapped, h.next));
                if unmapped {
                    if let MapEntry::Block(n_idx) = self.addr_map.lookup(addr + span) {
                        let n_unmapped = self.with_header(n_idx, |h| h.flags.was_unmapped);
                        if !n_unmapped {
                            let n_span = self.with_header(n_idx, |h| h.blk_bytes);
                            unsafe { os_alloc::unmap(addr + span, n_span) };
                            self.with_header(n_idx, |h| h.flags.was_unmapped = true);
                        }
                    }
                }
                cursor = next;
            }
        }
    }

    /// Resolves a raw candidate word found during heap-object scanning to
    /// `(object_start, descriptor)` if it plausibly points at (or, for
    /// interior pointers, into) a live heap object that hasn't been
    /// black-listed (spec.md §3 invariant 5, §4.F `mark_from`). A miss lands
    /// in the *normal* black list (spec.md §4.B: a value found inside another
    /// heap object). Root/stack scanning should use
    /// [`Heap::resolve_candidate_from_stack`] instead, so a miss there lands
    /// in the stack black list.
    pub fn resolve_candidate(&self, word: usize) -> Option<(usize, Descriptor)> {
        self.resolve_candidate_from(word, false)
    }

    /// Same as [`Heap::resolve_candidate`], but for a candidate found while
    /// conservatively scanning a thread's stack or registers rather than
    /// another heap object's fields — a miss lands in the *stack* black list
    /// instead (spec.md §4.B), since a value that is merely register/stack
    /// slop is far likelier to recur than one embedded in live object state.
    pub fn resolve_candidate_from_stack(&self, word: usize) -> Option<(usize, Descriptor)> {
        self.resolve_candidate_from(word, true)
    }

    fn resolve_candidate_from(&self, word: usize, from_stack: bool) -> Option<(usize, Descriptor)> {
        let lo = self.least_heap_addr.load(Ordering::Acquire);
        let hi = self.greatest_heap_addr.load(Ordering::Acquire);
        if word < lo || word >= hi {
            return None;
        }
        if self.blacklist.is_black_listed(word) {
            return None;
        }
        let idx = self.header_of(word)?;
        let (is_free, block, sz, obj_kind) =
            self.with_header(idx, |h| (h.is_free(), h.block, h.sz, h.obj_kind));
        if is_free || sz == 0 {
            if from_stack {
                self.blacklist.add_stack(word);
            } else {
                self.blacklist.add_normal(word);
            }
            return None;
        }
        // Interior pointers resolve to the containing object's start
        // (ALL_INTERIOR_POINTERS-equivalent semantics, spec.md §3
        // invariant 5(b)).
        let off = word - block;
        let slot = off / sz;
        let obj_start = block + slot * sz;
        let descr = self.with_header(idx, |h| h.descr);
        let _ = obj_kind;
        Some((obj_start, descr))
    }

    /// Sets the mark bit for the object starting at `obj_start`, returning
    /// whether it was newly marked (spec.md §4.D, §4.F).
    pub fn set_mark_bit(&self, obj_start: usize) -> bool {
        let idx = match self.header_of(obj_start) {
            Some(i) => i,
            None => return false,
        };
        self.with_header(idx, |h| {
            if h.sz == 0 {
                return false;
            }
            let slot = (obj_start - h.block) / h.sz;
            let newly = h.marks.set(slot);
            if newly {
                h.n_marks.fetch_add(1, Ordering::Relaxed);
            }
            newly
        })
    }

    pub fn is_marked(&self, obj_start: usize) -> bool {
        match self.header_of(obj_start) {
            None => false,
            Some(idx) => self.with_header(idx, |h| {
                if h.sz == 0 {
                    return false;
                }
                let slot = (obj_start - h.block) / h.sz;
                h.marks.is_set(slot)
            }),
        }
    }

    /// Pins `obj_start` as live regardless of what any future mark phase
    /// decides, until the process exits (spec.md §9 debug/test
    /// introspection: `Debug::keep_alive`). Never cleared by
    /// `clear_all_marks`.
    pub fn pin(&self, obj_start: usize) {
        self.pinned.lock().insert(obj_start);
    }

    pub fn is_pinned(&self, obj_start: usize) -> bool {
        self.pinned.lock().contains(&obj_start)
    }

    /// Whether `obj_start` should be treated as reachable by the reclaim
    /// phase: either the ordinary per-cycle mark bit is set, or it has been
    /// pinned via [`Heap::pin`].
    pub fn is_live(&self, obj_start: usize) -> bool {
        self.is_marked(obj_start) || self.is_pinned(obj_start)
    }

    /// Clears mark bits on every used block ahead of a new mark phase
    /// (spec.md §4.I driver: `clear_marks`). UNCOLLECTABLE blocks keep all
    /// bits set (they are never swept).
    pub fn clear_all_marks(&self) {
        let mut arena = self.headers.lock();
        for h in arena.headers.iter_mut() {
            if !h.is_free() {
                let uncollectable = self.kinds.with_kind(h.obj_kind, |k| k.uncollectable);
                if uncollectable {
                    h.marks.set_all();
                } else {
                    let n = h.hblk_objs();
                    h.marks.clear(n);
                    h.n_marks.store(0, Ordering::Relaxed);
                }
            }
        }
    }

    /// Visits every used block's header index. Used by the reclaim phase.
    /// Snapshots the index list before calling `f` so that `f` is free to
    /// call back into `with_header` (or anything else that locks the header
    /// arena) without deadlocking against this iteration's own lock.
    pub fn for_each_used_block(&self, mut f: impl FnMut(HdrIdx)) {
        let indices: Vec<HdrIdx> = {
            let arena = self.headers.lock();
            arena
                .headers
                .iter()
                .enumerate()
                .filter(|(_, h)| !h.is_free())
                .map(|(i, _)| i)
                .collect()
        };
        for i in indices {
            f(i);
        }
    }

    pub fn heap_bounds(&self) -> (usize, usize) {
        (
            self.least_heap_addr.load(Ordering::Acquire),
            self.greatest_heap_addr.load(Ordering::Acquire),
        )
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fl_index_matches_bdwgc_buckets() {
        assert_eq!(fl_index(1), 1);
        assert_eq!(fl_index(UNIQUE_THRESHOLD), UNIQUE_THRESHOLD);
        assert_eq!(fl_index(HUGE_THRESHOLD), N_HBLK_FLS);
        assert_eq!(fl_index(HUGE_THRESHOLD + 1000), N_HBLK_FLS);
    }

    #[test]
    fn fl_index_round_trips_through_its_inverse() {
        for i in 0..=N_HBLK_FLS {
            assert_eq!(fl_index(fl_index_inv(i)), i, "bucket {i} did not round-trip");
        }
    }

    #[test]
    fn allochblk_then_freehblk_round_trips_bytes() {
        let heap = Heap::new();
        let before = heap.large_free_bytes.load(Ordering::Acquire);
        let idx = heap
            .allochblk(HBLKSIZE * 2, KIND_NORMAL, AllocFlags::default(), 0)
            .expect("allocation should succeed");
        assert!(!heap.with_header(idx, |h| h.is_free()));
        heap.freehblk(idx);
        let after = heap.large_free_bytes.load(Ordering::Acquire);
        assert_eq!(before, after);
    }

    #[test]
    fn adjacent_frees_coalesce_into_one_block() {
        let heap = Heap::new();
        let a = heap
            .allochblk(HBLKSIZE, KIND_PTRFREE, AllocFlags::default(), 0)
            .unwrap();
        let b = heap
            .allochblk(HBLKSIZE, KIND_PTRFREE, AllocFlags::default(), 0)
            .unwrap();
        let (a_addr, a_span) = heap.with_header(a, |h| (h.block, h.blk_bytes));
        let (b_addr, _) = heap.with_header(b, |h| (h.block, h.blk_bytes));
        heap.freehblk(a);
        heap.freehblk(b);
        if a_addr + a_span == b_addr {
            // They were physically adjacent: verify a single merged header
            // now covers both, reachable from either original address.
            let merged = heap.header_of(a_addr).unwrap();
            let span = heap.with_header(merged, |h| h.blk_bytes);
            assert!(span >= a_span * 2);
        }
    }

    #[test]
    fn duplicate_free_is_fatal() {
        // Exercised indirectly: freehblk asserts `!already_free` and would
        // abort the process, which we cannot safely trigger inside a unit
        // test process. The classification is covered by
        // `error::tests::fatal_classification_matches_spec_table`.
    }
}
