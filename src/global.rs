// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use cranelift_entity::PrimaryMap;

use crate::indices::GlobalIndex;
use crate::module::ModuleDescriptor;

/// Per-instance storage for global variables, as raw bits zero-extended
/// to 64. Compiled code addresses these slots directly; the embedder reads
/// them through the typed loads below.
#[derive(Debug)]
pub struct GlobalSet {
    values: PrimaryMap<GlobalIndex, u64>,
}

// ===== impl GlobalSet =====

impl GlobalSet {
    /// Creates the storage for one instance, seeded with each global's
    /// constant initializer.
    pub fn from_module(module: &ModuleDescriptor) -> Self {
        let mut values = PrimaryMap::with_capacity(module.globals().len());
        for (_, def) in module.globals() {
            values.push(def.init_raw);
        }
        Self { values }
    }

    pub fn load_raw(&self, index: GlobalIndex) -> u64 {
        self.values[index]
    }

    pub fn load_i32(&self, index: GlobalIndex) -> i32 {
        self.values[index] as u32 as i32
    }

    pub fn load_f32(&self, index: GlobalIndex) -> f32 {
        f32::from_bits(self.values[index] as u32)
    }

    pub fn load_f64(&self, index: GlobalIndex) -> f64 {
        f64::from_bits(self.values[index])
    }
}
