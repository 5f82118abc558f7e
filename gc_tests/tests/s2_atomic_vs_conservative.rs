// Run-time:
//   status: success

extern crate gcmalloc;

use gcmalloc::{malloc, malloc_atomic, Debug};
use std::sync::atomic::{AtomicUsize, Ordering};

// Not a GC root: nothing ever registers this static's address range with
// `add_roots`, so stashing a heap address here is just a plain
// inter-function communication channel, not a way to keep `q` alive.
static Q_ADDR: AtomicUsize = AtomicUsize::new(0);

// Runs in its own stack frame so that, once it returns, the frame holding
// `q`'s only pointer-typed local is below main's stack pointer and therefore
// outside the conservatively-scanned range (spec.md §4.G: stacks are scanned
// from the live stack pointer up to the registered base, not end to end).
fn plant(p: *mut u8) {
    let q = malloc(64);
    assert!(!q.is_null());
    unsafe {
        let slot = p.add(2048) as *mut usize;
        slot.write_unaligned(q as usize);
    }
    Q_ADDR.store(q as usize, Ordering::Relaxed);
}

// spec.md §8 scenario S2: a pointer-looking value planted inside a PTRFREE
// block's payload must not keep the pointee alive, because PTRFREE content
// is opaque to the mark engine.
fn main() {
    let p = malloc_atomic(4096);
    assert!(!p.is_null());

    plant(p);

    gcmalloc::collect();

    let q = Q_ADDR.load(Ordering::Relaxed) as *mut u8;
    assert!(!Debug::is_black(q));
}
