// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! spec.md §8 scenario S4: four threads each allocate a block, keep its
//! address only in a stack local, and sleep; a collection forced from the
//! main thread while they sleep must still find every block reachable
//! through the stop-the-world-suspended stack scan (spec.md §4.G/§4.H).

use gcmalloc::{malloc, Debug};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

#[test]
fn thread_stacks_are_scanned_while_suspended_mid_sleep() {
    let barrier = Arc::new(Barrier::new(5));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                let p = malloc(64);
                assert!(!p.is_null());
                seen.lock().unwrap().push(p as usize);
                barrier.wait();
                // Stored only in this stack local; the collector must find
                // it by scanning this thread's suspended stack, not through
                // any other root.
                thread::sleep(Duration::from_secs(1));
                std::hint::black_box(&p);
            })
        })
        .collect();

    barrier.wait();
    // Give every worker time to reach its own sleep before forcing a
    // collection in the middle of it.
    thread::sleep(Duration::from_millis(200));
    gcmalloc::collect();

    for h in handles {
        h.join().unwrap();
    }

    for addr in seen.lock().unwrap().iter() {
        assert!(Debug::is_black(*addr as *mut u8));
    }
}
