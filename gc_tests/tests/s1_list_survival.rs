// Run-time:
//   status: success

extern crate gcmalloc;

use gcmalloc::Gc;

struct Cons {
    car: usize,
    cdr: Option<Gc<Cons>>,
}

fn cons(car: usize, cdr: Option<Gc<Cons>>) -> Gc<Cons> {
    Gc::new(Cons { car, cdr })
}

// spec.md §8 scenario S1: a three-element list survives five consecutive
// collections with nothing but its own head kept on the stack.
fn main() {
    let a = cons(1, Some(cons(2, Some(cons(3, None)))));

    for _ in 0..5 {
        gcmalloc::collect();
    }

    let third = a.cdr.unwrap().cdr.unwrap();
    assert_eq!(third.car, 3);
    assert!(third.cdr.is_none());
}
