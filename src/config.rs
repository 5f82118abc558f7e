// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tunable constants and environment-derived runtime configuration.
//!
//! Mirrors the knobs bdwgc reads once at start-of-day (`GC_init`), minus the
//! parts that are genuinely OS- or thread-library-specific.

use std::env;
use std::sync::OnceLock;

/// Size, in bytes, of a heap block (HBLK). Must be a power of two and a
/// multiple of the OS page size.
pub const HBLKSIZE: usize = 4096;

/// Minimum allocation granularity. Objects below `MAXOBJBYTES` occupy a whole
/// number of granules.
pub const GRANULE_BYTES: usize = 2 * std::mem::size_of::<usize>();

/// Largest granule count served from a size-segregated free list; anything
/// bigger is allocated as its own run of HBLKs.
pub const MAXOBJGRANULES: usize = 256;

pub const MAXOBJBYTES: usize = MAXOBJGRANULES * GRANULE_BYTES;

/// Free-block bucket layout (see spec.md §3, "Free heap block free list
/// array"). Sizes `1..UNIQUE_THRESHOLD` blocks get a dedicated bucket; sizes
/// in `[UNIQUE_THRESHOLD, HUGE_THRESHOLD)` are grouped by `FL_COMPRESSION`;
/// everything `>= HUGE_THRESHOLD` shares the final bucket.
pub const UNIQUE_THRESHOLD: usize = 32;
pub const HUGE_THRESHOLD: usize = 256;
pub const FL_COMPRESSION: usize = 8;
pub const N_HBLK_FLS: usize = (HUGE_THRESHOLD - UNIQUE_THRESHOLD) / FL_COMPRESSION + UNIQUE_THRESHOLD;

/// Maximum number of pointer-bearing slots a `DS_BITMAP` descriptor word can
/// directly encode; larger bitmaps spill into the extended-descriptor table.
pub const BITMAP_BITS: usize = (std::mem::size_of::<usize>() * 8) - 2;

/// Initial mark stack capacity, in entries. Doubled on overflow.
pub const INITIAL_MARK_STACK_SIZE: usize = HBLKSIZE / std::mem::size_of::<usize>() / 2;

/// Entries a parallel-mark helper steals from the shared stack at a time.
pub const ENTRIES_TO_GET: usize = 5;

/// Local (per-helper) mark stack capacity during parallel mark.
pub const LOCAL_MARK_STACK_SIZE: usize = HBLKSIZE / 8;

/// Tuning knob, not a contract (spec.md §9 Open Questions): of every N
/// allocation attempts that land on an entirely black-listed block, one is
/// allowed to actually drop/retry rather than settle for the blacklisted
/// region. Kept identical in spirit to bdwgc's informal "roughly 1 in 4".
pub const BLACKLISTED_DROP_RATE: usize = 4;

/// Number of full collection cycles a free block may sit idle before
/// `unmap_old` is allowed to return it to the OS.
pub const UNMAP_THRESHOLD: usize = 6;

/// Soft allocation threshold as a multiplier of the live heap size; once
/// `bytes_allocd` crosses `heap_size * GC_FREE_SPACE_DIVISOR`, the driver
/// schedules a collection.
pub const GC_FREE_SPACE_DIVISOR: usize = 4;

fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_env_i32(name: &str) -> Option<i32> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().map(|v| {
        let v = v.trim();
        !(v.is_empty() || v == "0")
    })
}

/// Configuration read once from the environment at first use, per spec.md
/// §6's "Environment variables (read once at init)".
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// `GC_NPROCS` — number of CPUs the collector should assume are
    /// available when sizing thread pools. `None` means "detect".
    pub nprocs: Option<usize>,
    /// `GC_MARKERS` — number of parallel-mark helper threads (including the
    /// initiating thread). `1` disables parallel mark.
    pub markers: usize,
    /// `GC_RETRY_SIGNALS` — how many times to re-send a stop-the-world
    /// signal to an unresponsive thread before aborting.
    pub retry_signals: u32,
    /// `GC_IGNORE_GCJ_INFO` — present for API parity with bdwgc; this core
    /// has no gcj-specific kind, so the flag only suppresses a warning that
    /// would otherwise fire if a caller registers a kind named "gcj".
    pub ignore_gcj_info: bool,
    /// `GC_LARGE_ALLOC_WARN_INTERVAL` — warn on every Nth large allocation
    /// past the first, to help diagnose accidental bulk allocation. `None`
    /// disables the warning.
    pub large_alloc_warn_interval: Option<usize>,
}

impl RuntimeConfig {
    fn from_env() -> Self {
        RuntimeConfig {
            nprocs: parse_env_usize("GC_NPROCS"),
            markers: parse_env_usize("GC_MARKERS").unwrap_or(1).max(1),
            retry_signals: parse_env_usize("GC_RETRY_SIGNALS").unwrap_or(8) as u32,
            ignore_gcj_info: parse_env_bool("GC_IGNORE_GCJ_INFO").unwrap_or(false),
            large_alloc_warn_interval: parse_env_usize("GC_LARGE_ALLOC_WARN_INTERVAL")
                .filter(|v| *v > 0),
        }
    }
}

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Returns the process-wide runtime configuration, parsing the environment
/// on first call and caching the result thereafter.
pub fn config() -> &'static RuntimeConfig {
    CONFIG.get_or_init(RuntimeConfig::from_env)
}

/// The suspend signal used for stop-the-world, settable via
/// [`crate::stw::set_suspend_signal`] before the first collection.
pub fn default_suspend_signal() -> i32 {
    parse_env_i32("GC_SUSPEND_SIGNAL").unwrap_or(libc::SIGPWR)
}

/// The restart signal used for stop-the-world, settable via
/// [`crate::stw::set_thr_restart_signal`] before the first collection.
pub fn default_restart_signal() -> i32 {
    parse_env_i32("GC_THR_RESTART_SIGNAL").unwrap_or(libc::SIGXCPU)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_layout_matches_bdwgc_constants() {
        assert_eq!(UNIQUE_THRESHOLD, 32);
        assert_eq!(HUGE_THRESHOLD, 256);
        assert_eq!(FL_COMPRESSION, 8);
        assert_eq!(N_HBLK_FLS, (256 - 32) / 8 + 32);
    }

    #[test]
    fn default_config_has_sane_fallbacks() {
        let cfg = RuntimeConfig::from_env();
        assert!(cfg.markers >= 1);
    }
}
