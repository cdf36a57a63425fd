// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::{Arc, Mutex};

/// A linear memory, shared between its instance and any importers.
#[derive(Clone)]
pub struct Memory(Arc<MemoryInner>);

struct MemoryInner {
    data: Mutex<Vec<u8>>,
}

// ===== impl Memory =====

impl Memory {
    /// Creates a zero-initialized memory of `initial` bytes.
    pub fn new(initial: usize) -> Self {
        Self(Arc::new(MemoryInner {
            data: Mutex::new(vec![0; initial]),
        }))
    }

    /// Current size in bytes.
    pub fn size(&self) -> usize {
        self.0.data.lock().unwrap().len()
    }

    /// Copies `buf.len()` bytes starting at `offset` into `buf`.
    ///
    /// # Panics
    ///
    /// Panics if the source range is out of bounds.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let data = self.0.data.lock().unwrap();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copies `bytes` into memory starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the destination range is out of bounds; callers bounds-check
    /// whole segments up front.
    pub fn write(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.0.data.lock().unwrap();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Identity comparison: two handles to the same underlying memory.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory").field("size", &self.size()).finish()
    }
}
