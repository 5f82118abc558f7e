// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The collector driver (spec.md §4.I): the single state machine that
//! coordinates stop-the-world, root enumeration, mark-stack draining, and
//! reclaim across `block::Heap`, `mark::MarkEngine`, `roots::RootSet` and
//! `stw::StopTheWorld`. Also home to the `Debug`/`DebugFlags` test
//! introspection surface, kept under the same names and import path
//! (`gcmalloc::gc::DebugFlags`) the original collector used.

use crate::addr_map::HdrIdx;
use crate::block::Heap;
use crate::dirty::{DirtySet, ManualDirtySet};
use crate::error::{bump_gc_no, trace};
use crate::links::DisappearingLinks;
use crate::mark::{MarkEngine, MarkEntry, MarkStack};
use crate::runtime::runtime;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Phase the driver is currently in; exposed mainly so a reentrant call to
/// `collect()` (e.g. from inside a disclaim callback that itself allocates
/// past the threshold) is a safe no-op rather than a deadlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Ready,
    RootScanning,
    Marking,
    Sweeping,
}

/// Debug/test instrumentation: lets a caller run a collection with either
/// phase suppressed (spec.md §9: this kind of introspection hook is kept as
/// ambient test tooling). `clear_all_marks` always still runs; suppressing
/// `mark_phase` just means nothing re-marks anything, so every object looks
/// "white" to [`Debug::is_black`] afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugFlags {
    mark_phase: bool,
    sweep_phase: bool,
}

impl DebugFlags {
    pub fn new() -> Self {
        DebugFlags {
            mark_phase: true,
            sweep_phase: true,
        }
    }

    pub fn mark_phase(mut self, on: bool) -> Self {
        self.mark_phase = on;
        self
    }

    pub fn sweep_phase(mut self, on: bool) -> Self {
        self.sweep_phase = on;
        self
    }
}

impl Default for DebugFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// The collector driver. One instance lives in `Runtime`, guarded by its own
/// mutex so two threads calling `collect()` concurrently serialize rather
/// than race (spec.md §4.I: "at most one collection runs at a time").
pub struct Collector {
    debug_flags: Mutex<DebugFlags>,
    state: Mutex<CollectorState>,
    incremental: AtomicBool,
    dirty: Mutex<Option<Box<dyn DirtySet>>>,
    links: DisappearingLinks,
    /// Number of allocations between automatic collections (spec.md §4.I
    /// "soft allocation threshold" heuristic entry point), exposed to
    /// callers as `set_threshold` for tests that want a deterministic GC
    /// within a short allocation loop.
    auto_threshold: AtomicUsize,
    allocs_since_gc: AtomicUsize,
}

/// Default number of allocations between automatic collections. Generous
/// enough that ordinary short-lived programs never trigger one implicitly;
/// tests lower it via `set_threshold` to force a GC within a small loop.
const DEFAULT_AUTO_THRESHOLD: usize = 100_000;

impl Collector {
    pub fn new(debug_flags: DebugFlags) -> Self {
        Collector {
            debug_flags: Mutex::new(debug_flags),
            state: Mutex::new(CollectorState::Ready),
            incremental: AtomicBool::new(false),
            dirty: Mutex::new(None),
            links: DisappearingLinks::new(),
            auto_threshold: AtomicUsize::new(DEFAULT_AUTO_THRESHOLD),
            allocs_since_gc: AtomicUsize::new(0),
        }
    }

    pub fn debug_flags(&self) -> DebugFlags {
        *self.debug_flags.lock()
    }

    pub fn set_debug_flags(&self, flags: DebugFlags) {
        *self.debug_flags.lock() = flags;
    }

    pub fn set_threshold(&self, n: usize) {
        self.auto_threshold.store(n.max(1), Ordering::Relaxed);
    }

    pub fn links(&self) -> &DisappearingLinks {
        &self.links
    }

    /// Called by every allocation entry point; triggers an automatic
    /// collection once enough allocations have accumulated (spec.md §4.I
    /// heuristic entry point 2, "soft allocation threshold").
    pub fn note_alloc(&self) {
        let n = self.allocs_since_gc.fetch_add(1, Ordering::Relaxed) + 1;
        if n >= self.auto_threshold.load(Ordering::Relaxed) {
            self.collect();
        }
    }

    /// `enable_incremental()` (spec.md §7 public API, §4.I "incremental
    /// variant"). Installs a VDB so each cycle can learn which pages the
    /// mutator actually dirtied since the last one; this port still runs
    /// each phase as one stop-the-world pause (spec.md §9 records this
    /// simplification) rather than truly interleaving with the mutator.
    pub fn enable_incremental(&self) {
        self.incremental.store(true, Ordering::Release);
        let mut d = self.dirty.lock();
        if d.is_none() {
            *d = Some(Box::new(ManualDirtySet::new()));
        }
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental.load(Ordering::Acquire)
    }

    /// Records a write to `addr` for the incremental VDB. A no-op unless
    /// `enable_incremental()` has been called; exposed as `gc_dirty` at the
    /// crate root for a caller integrating its own write barrier.
    pub fn note_dirty(&self, addr: usize) {
        if let Some(d) = self.dirty.lock().as_ref() {
            d.mark_dirty(addr);
        }
    }

    /// `collect()` (spec.md §4.I, §7 public API): the full driver sequence.
    pub fn collect(&self) {
        {
            let mut st = self.state.lock();
            if *st != CollectorState::Ready {
                return;
            }
            *st = CollectorState::RootScanning;
        }

        let rt = runtime();
        let heap = rt.heap();
        let stw = rt.stw();

        trace!("stop_world");
        stw.stop_world();
        heap.clear_all_marks();
        // spec.md §4.I driver: "promote_black_lists()  # rotate incomplete->old"
        // runs after roots are pushed and before the mark stack drains, so
        // this cycle's allocator-facing avoidance set is whatever the
        // *previous* cycle accumulated, while this cycle's own hits still
        // accumulate into `incomplete` for the next rotation.
        heap.blacklist.promote();

        let flags = self.debug_flags();

        if flags.mark_phase {
            trace!("mark phase starting");
            *self.state.lock() = CollectorState::Marking;
            mark_everything(heap);
            self.links.clear_unmarked(heap);
        }

        let cycle = bump_gc_no();

        if flags.sweep_phase {
            trace!("sweep phase starting (cycle {})", cycle);
            *self.state.lock() = CollectorState::Sweeping;
            reclaim_everything(heap);
            heap.unmap_old(cycle);
            heap.merge_unmapped();
        }

        if let Some(d) = self.dirty.lock().as_ref() {
            d.reset();
        }

        stw.start_world();
        trace!("start_world");
        self.allocs_since_gc.store(0, Ordering::Relaxed);
        *self.state.lock() = CollectorState::Ready;
    }

    pub fn state(&self) -> CollectorState {
        *self.state.lock()
    }
}

/// Forces a register spill via a never-inlined call frame, then reads the
/// resulting stack pointer: the portable, pure-Rust stand-in for the
/// original collector's `spill_registers` assembly stub. By the time this
/// returns, the caller's callee-saved registers have already been pushed
/// onto the stack by at least one intervening call frame, so conservatively
/// scanning from here up to the thread's recorded stack base covers them too
/// (spec.md §4.H guarantee (a): "the initiator's own registers/stack are
/// included").
#[inline(never)]
fn current_stack_pointer() -> usize {
    let local = 0usize;
    std::hint::black_box(&local as *const usize as usize)
}

/// Pushes every root into the mark stack and drains it to a fixed point
/// (spec.md §4.I steps "push_roots" / "drain_mark_stack" folded together,
/// since this port always runs a full stop-the-world cycle rather than the
/// staged `MarkState` phases `mark.rs` models for incremental scheduling).
fn mark_everything(heap: &'static Heap) {
    let rt = runtime();
    let stack = rt.mark_stack();
    stack.reset();
    let engine = MarkEngine {
        heap,
        ext: rt.ext(),
        procs: rt.procs(),
    };

    rt.roots().push_all_eager(&engine, stack);
    push_uncollectable_roots(heap, stack);

    let my_id = std::thread::current().id();
    for id in rt.roots().registered_thread_ids() {
        if id == my_id {
            rt.roots().push_all(&engine, stack, current_stack_pointer());
        } else if let Some(sp) = rt.stw().suspended_sp(id) {
            rt.roots().push_thread_stack(&engine, stack, id, sp);
        }
    }

    // `GC_MARKERS` (spec.md §6, §4.F "Parallel mark"): split the drain
    // across helper threads when configured for more than one marker,
    // falling back to the plain sequential drain otherwise.
    let markers = crate::config::config().markers;
    crate::mark::parallel_drain(stack, heap, rt.ext(), rt.procs(), markers);
}

/// Pushes every UNCOLLECTABLE object as a root (spec.md §4.F `MarkState`:
/// `PushUncollectable`). Their mark bits are already set by
/// `Heap::clear_all_marks`; they still need their *children* traced.
fn push_uncollectable_roots(heap: &Heap, stack: &MarkStack) {
    let mut entries = Vec::new();
    heap.for_each_used_block(|idx| {
        let (kind, block, sz, n, descr) =
            heap.with_header(idx, |h| (h.obj_kind, h.block, h.sz, h.hblk_objs(), h.descr));
        if !heap.kinds.with_kind(kind, |k| k.uncollectable) {
            return;
        }
        for slot in 0..n {
            entries.push(MarkEntry {
                start: block + slot * sz,
                descr,
            });
        }
    });
    for e in entries {
        stack.push(e);
    }
}

/// `reclaim_block()` applied to every used block (spec.md §4.I "for each
/// block: reclaim_block()"). Fully-dead and disclaim-bearing blocks are
/// swept eagerly (so `Drop` glue runs synchronously, inside `collect()`);
/// partially-live blocks whose kind has no disclaim callback are queued onto
/// the kind's reclaim list and swept lazily by the allocator on demand
/// (spec.md §4.E "reclaim lists ... processed lazily").
fn reclaim_everything(heap: &Heap) {
    // `GC_start_reclaim`: discard every kind's free lists before reclaiming
    // a single block. Those lists still hold links from before this cycle,
    // some of them into blocks this pass is about to `freehblk` outright;
    // left in place they'd hand out dangling memory on the next
    // `generic_malloc_inner` miss, or double-link slots that `sweep_block`
    // is about to relink itself once the block below is swept lazily. Every
    // used block is visited unconditionally by the loop below regardless of
    // this, so the free capacity they held is rediscovered and correctly
    // re-threaded onto `reclaim_lists` (and from there back into
    // `free_lists` by the lazy sweep) rather than lost.
    for kind in 0..heap.kinds.len() {
        heap.kinds.with_kind(kind, |k| {
            for head in k.free_lists.lock().iter_mut() {
                *head = None;
            }
        });
    }

    let mut to_free: Vec<HdrIdx> = Vec::new();
    let mut candidates: Vec<(HdrIdx, usize, usize, usize, bool, bool)> = Vec::new();

    heap.for_each_used_block(|idx| {
        let (kind, block, sz, n, large) = heap.with_header(idx, |h| {
            (h.obj_kind, h.block, h.sz, h.hblk_objs(), h.flags.large_block)
        });
        if heap.kinds.with_kind(kind, |k| k.uncollectable) {
            return;
        }
        // Count live slots via `is_live` (mark bit OR debug pin), not the
        // raw bitmap, so a `Debug::keep_alive` pin survives a cycle that ran
        // with mark tracing disabled.
        let live = (0..n).filter(|&s| heap.is_live(block + s * sz)).count();
        if live == n {
            return; // fully live this cycle: nothing to do
        }
        let has_disclaim = heap.kinds.with_kind(kind, |k| k.disclaim.is_some());
        candidates.push((idx, kind, sz, live, large, has_disclaim));
    });

    for (idx, kind, sz, marked, large, has_disclaim) in candidates {
        if large {
            if marked == 0 {
                if has_disclaim {
                    let block = heap.with_header(idx, |h| h.block);
                    heap.kinds.with_kind(kind, |k| {
                        if let Some(proc) = k.disclaim {
                            proc(block as *mut u8);
                        }
                    });
                }
                to_free.push(idx);
            }
            continue;
        }

        if has_disclaim {
            match crate::alloc::sweep_block(heap, idx, kind) {
                Some(head) => {
                    let g = sz / crate::config::GRANULE_BYTES;
                    install_free_list_head(heap, kind, g, head);
                }
                None => to_free.push(idx),
            }
        } else if marked == 0 {
            to_free.push(idx);
        } else {
            let g = sz / crate::config::GRANULE_BYTES;
            heap.kinds
                .with_kind(kind, |k| k.reclaim_lists.lock()[g].push(idx));
        }
    }

    for idx in to_free {
        heap.freehblk(idx);
    }
}

/// Splices a freshly-swept free list (already rebuilt by
/// `alloc::sweep_block`) onto the front of `kind`'s granule-class `g` free
/// list, rather than discarding it and forcing the next allocation to redo
/// the sweep via the lazy reclaim-list path.
fn install_free_list_head(heap: &Heap, kind: usize, g: usize, head: usize) {
    heap.kinds.with_kind(kind, |k| {
        let mut lists = k.free_lists.lock();
        let tail_addr = {
            let mut cur = head;
            loop {
                let next = unsafe { *(cur as *const usize) };
                if next == 0 {
                    break cur;
                }
                cur = next;
            }
        };
        unsafe { *(tail_addr as *mut usize) = lists[g].unwrap_or(0) };
        lists[g] = Some(head);
    });
}

/// Test/debug introspection (spec.md §9): inspect and pin mark state
/// directly, bypassing the normal root-reachability path. Used by the
/// collector's own test suite, not part of the steady-state allocation API.
pub struct Debug;

impl Debug {
    /// Whether the object `obj` currently points at (its own address, or any
    /// address inside it) is live from the most recent collection: marked by
    /// a real trace, or pinned by [`Debug::keep_alive`]. Accepts either a
    /// `Gc<T>` directly or a raw `*mut u8` obtained from [`crate::Gc::as_ptr`],
    /// matching both calling conventions this collector's tests use.
    pub fn is_black<P: GcPtrLike>(obj: P) -> bool {
        runtime().heap().is_live(obj.header_addr())
    }

    /// Pins `obj` as live independent of the ordinary mark bitmap, without
    /// requiring a real root to exist. Used by tests that want to simulate
    /// "this object is kept alive by something outside the traced graph"
    /// without wiring up an actual global or stack root.
    ///
    /// # Safety
    /// Keeping an object alive this way bypasses the ordinary root-tracing
    /// invariant and, unlike a real mark, is never automatically revoked:
    /// the pin holds for the rest of the process unless the caller arranges
    /// otherwise.
    pub unsafe fn keep_alive<P: GcPtrLike>(obj: P) {
        runtime().heap().pin(obj.header_addr());
    }

    /// Whether the HBLK containing `addr` is currently black-listed, by
    /// either the stack or normal list (spec.md §4.F invariant 5, §8 scenario
    /// S6). Exposed here rather than from `blacklist` directly since that
    /// module stays private — this is test/debug introspection, not part of
    /// the steady-state allocation API.
    pub fn is_black_listed(addr: *const u8) -> bool {
        runtime().heap().blacklist.is_black_listed(addr as usize)
    }

    /// Registers `addr` as a stack-found false pointer, as if the mark
    /// engine's conservative scan had landed on it without resolving to a
    /// live object (spec.md §8 scenario S6's "register a false pointer as a
    /// root").
    pub fn seed_stack_blacklist(addr: *const u8) {
        runtime().heap().blacklist.add_stack(addr as usize);
    }
}

/// Bridges the two ways this collector's call sites refer to a managed
/// object: the typed `Gc<T>` handle, or a raw `*mut u8` obtained from
/// [`crate::Gc::as_ptr`].
pub trait GcPtrLike {
    fn header_addr(&self) -> usize;
}

impl GcPtrLike for *mut u8 {
    fn header_addr(&self) -> usize {
        *self as usize
    }
}

impl<T> GcPtrLike for crate::Gc<T> {
    fn header_addr(&self) -> usize {
        crate::Gc::header_addr(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flags_builder_defaults_to_both_phases_on() {
        let f = DebugFlags::new();
        assert_eq!(
            f,
            DebugFlags {
                mark_phase: true,
                sweep_phase: true
            }
        );
        let f2 = f.mark_phase(false);
        assert!(!f2.mark_phase);
        assert!(f2.sweep_phase);
    }

    #[test]
    fn collector_set_and_get_threshold_round_trips() {
        let c = Collector::new(DebugFlags::new());
        c.set_threshold(5);
        assert_eq!(c.auto_threshold.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn collector_starts_ready() {
        let c = Collector::new(DebugFlags::new());
        assert_eq!(c.state(), CollectorState::Ready);
    }
}
