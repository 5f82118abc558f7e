// Run-time:
//   status: success

extern crate gcmalloc;

use gcmalloc::{free, malloc, Debug};

// spec.md §8 scenario S6: a false pointer into an unused (freed, still
// mapped) HBLK-aligned region, kept visible as a root, gets black-listed by
// the second collection.
fn main() {
    // Larger than MAXOBJBYTES so this is a whole-block allocation: freeing it
    // marks its HBLKs free without unmapping them (unmapping only happens
    // after UNMAP_THRESHOLD cycles), leaving a stable "unused but still
    // addressable" region to plant the false pointer in.
    let big = malloc(8192);
    assert!(!big.is_null());
    unsafe { free(big) };

    let fake: usize = big as usize;
    std::hint::black_box(&fake);

    gcmalloc::collect();
    std::hint::black_box(&fake);
    gcmalloc::collect();

    assert!(Debug::is_black_listed(fake as *const u8));
}
