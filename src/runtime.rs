// Copyright (c) 2019 King's College London created by the Software Development
// Team <http://soft-dev.org/>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0>, or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, or the UPL-1.0 license
// <http://opensource.org/licenses/UPL> at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The single owning collector-state value (REDESIGN FLAGS §9: "Global
//! mutable state ... lives in a single owning 'collector' value"), plus the
//! lazily-initialized process-wide singleton.

use crate::block::Heap;
use crate::gc::Collector;
use crate::mark::{ExtendedDescriptors, MarkProcTable, MarkStack};
use crate::roots::RootSet;
use crate::stw::StopTheWorld;
use parking_lot::Mutex;
use std::sync::OnceLock;

pub struct Runtime {
    heap: Heap,
    mark_stack: MarkStack,
    ext: ExtendedDescriptors,
    procs: MarkProcTable,
    roots: RootSet,
    stw: StopTheWorld,
    collector: Mutex<Collector>,
}

impl Runtime {
    fn new() -> Self {
        Runtime {
            heap: Heap::new(),
            mark_stack: MarkStack::new(),
            ext: ExtendedDescriptors::new(),
            procs: MarkProcTable::new(),
            roots: RootSet::new(),
            stw: StopTheWorld::new(),
            collector: Mutex::new(Collector::new(crate::gc::DebugFlags::new())),
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn mark_stack(&self) -> &MarkStack {
        &self.mark_stack
    }

    pub fn ext(&self) -> &ExtendedDescriptors {
        &self.ext
    }

    pub fn procs(&self) -> &MarkProcTable {
        &self.procs
    }

    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    pub fn stw(&self) -> &StopTheWorld {
        &self.stw
    }

    pub fn collector(&self) -> &Mutex<Collector> {
        &self.collector
    }
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Returns the process-wide collector runtime, creating it on first use.
pub fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(Runtime::new)
}
