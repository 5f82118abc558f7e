// Run-time:
//   status: success

extern crate gcmalloc;

use gcmalloc::{malloc, Debug};

const MARKER: u64 = 0xdead_beef_cafe_babe;

// Returns only an interior pointer 512 bytes into a 1 KiB object; the base
// pointer itself never survives past this call (spec.md §8 scenario S3).
fn plant() -> *mut u8 {
    let o = malloc(1024);
    assert!(!o.is_null());
    unsafe { (o as *mut u64).write(MARKER) };
    unsafe { o.add(512) }
}

fn main() {
    let interior = plant();

    gcmalloc::collect();

    // The object is still alive even though only an interior pointer to it
    // was retained.
    assert!(Debug::is_black(interior));

    let base = unsafe { interior.sub(512) };
    assert_eq!(unsafe { (base as *const u64).read() }, MARKER);
}
