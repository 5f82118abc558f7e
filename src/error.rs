// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error kinds and the fatal-abort / warn hooks described in spec.md §7.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Recoverable and fatal error kinds, matching the disposition table in
/// spec.md §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcError {
    /// The OS rejected a mapping request; the allocator returns null instead
    /// of aborting.
    OutOfMemory,
    /// The mark stack overflowed; the mark state is reset to `Invalid` and a
    /// rescan is scheduled. Never visible to the client.
    MarkStackOverflow,
    /// The header scratch pool could not satisfy a header allocation. The
    /// offending block is leaked rather than corrupting collector state.
    HeaderAllocFailed,
    /// A pointer was freed twice.
    DuplicateFree,
    /// A header lookup found no valid header where one was expected.
    BadHeader,
    /// A mark descriptor failed to decode.
    BadDescriptor,
    /// Thread registration bookkeeping found inconsistent state.
    BadThreadList,
    /// Stop-the-world signals were repeatedly lost past the retry ceiling.
    SignalLost,
    /// `register_my_thread` was called twice for the same OS thread.
    ThreadAlreadyRegistered,
}

impl GcError {
    /// Whether this kind is fatal (aborts the process) or recoverable
    /// (returned to the caller), per spec.md §7.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            GcError::DuplicateFree
                | GcError::BadHeader
                | GcError::BadDescriptor
                | GcError::BadThreadList
                | GcError::SignalLost
        )
    }
}

impl std::fmt::Display for GcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            GcError::OutOfMemory => "out of memory",
            GcError::MarkStackOverflow => "mark stack overflow",
            GcError::HeaderAllocFailed => "header allocation failed",
            GcError::DuplicateFree => "duplicate free of live object",
            GcError::BadHeader => "corrupt or missing block header",
            GcError::BadDescriptor => "malformed mark descriptor",
            GcError::BadThreadList => "corrupt thread registration list",
            GcError::SignalLost => "stop-the-world signal repeatedly lost",
            GcError::ThreadAlreadyRegistered => "thread already registered",
        };
        write!(f, "{}", msg)
    }
}

/// Monotonic collection-cycle counter, included in every diagnostic so a
/// post-mortem can correlate a failure with a specific GC cycle (spec.md §7:
/// "All diagnostics include the current collection generation number").
pub(crate) static GC_NO: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn current_gc_no() -> usize {
    GC_NO.load(Ordering::Relaxed)
}

pub(crate) fn bump_gc_no() -> usize {
    GC_NO.fetch_add(1, Ordering::AcqRel) + 1
}

/// Hook signature for the client-installable fatal-abort handler. Must not
/// return.
pub type FatalAbortHook = fn(&str) -> !;

/// Hook signature for the client-installable warning handler.
pub type WarnHook = fn(&str);

fn default_fatal_abort(msg: &str) -> ! {
    eprintln!("gcmalloc: fatal: {}", msg);
    std::process::abort();
}

fn default_warn(msg: &str) {
    eprintln!("gcmalloc: warning: {}", msg);
}

static FATAL_HOOK: RwLock<FatalAbortHook> = RwLock::new(default_fatal_abort);
static WARN_HOOK: RwLock<WarnHook> = RwLock::new(default_warn);

/// Install a client-provided fatal-abort hook. The hook is invoked in place
/// of the default `eprintln!` + `abort()` whenever the collector detects
/// client-caused memory corruption (double free, bad header, ...).
pub fn set_fatal_abort_hook(hook: FatalAbortHook) {
    *FATAL_HOOK.write().unwrap() = hook;
}

/// Install a client-provided warning hook, used for recoverable but
/// noteworthy conditions (leaked header, large-allocation warnings, ...).
pub fn set_warn_hook(hook: WarnHook) {
    *WARN_HOOK.write().unwrap() = hook;
}

/// Abort the process with a descriptive, generation-tagged message. Used for
/// the fatal kinds in spec.md §7's disposition table; never used for
/// recoverable kinds.
pub(crate) fn fatal_abort(err: GcError) -> ! {
    let hook = *FATAL_HOOK.read().unwrap();
    hook(&format!("{} (gc_no={})", err, current_gc_no()))
}

/// Emit a warning through the installed hook, tagged with the current GC
/// cycle number.
pub(crate) fn warn(msg: &str) {
    let hook = *WARN_HOOK.read().unwrap();
    hook(&format!("{} (gc_no={})", msg, current_gc_no()));
}

/// Verbose phase-by-phase tracing, gated behind the `gc_trace` feature
/// (spec.md §1), mirroring bdwgc's `GC_print_stats`. A no-op build with the
/// feature off compiles away entirely rather than paying a runtime check.
#[cfg(feature = "gc_trace")]
macro_rules! trace {
    ($($arg:tt)*) => {
        eprintln!("gcmalloc: trace (gc_no={}): {}", $crate::error::current_gc_no(), format!($($arg)*))
    };
}

#[cfg(not(feature = "gc_trace"))]
macro_rules! trace {
    ($($arg:tt)*) => {
        ()
    };
}

pub(crate) use trace;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification_matches_spec_table() {
        assert!(GcError::DuplicateFree.is_fatal());
        assert!(GcError::BadHeader.is_fatal());
        assert!(!GcError::OutOfMemory.is_fatal());
        assert!(!GcError::MarkStackOverflow.is_fatal());
        assert!(!GcError::ThreadAlreadyRegistered.is_fatal());
    }

    #[test]
    fn gc_no_is_monotonic() {
        let a = bump_gc_no();
        let b = bump_gc_no();
        assert!(b > a);
    }
}
