// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::{Arc, Mutex};

use crate::func::Func;

/// A funcref table: a growable array of optional function references,
/// shared between its instance and any importers.
#[derive(Clone)]
pub struct Table(Arc<TableInner>);

struct TableInner {
    elements: Mutex<Vec<Option<Func>>>,
    maximum: Option<usize>,
}

// ===== impl Table =====

impl Table {
    /// Creates a table of `initial` empty slots.
    pub fn new(initial: usize, maximum: Option<usize>) -> Self {
        Self(Arc::new(TableInner {
            elements: Mutex::new(vec![None; initial]),
            maximum,
        }))
    }

    pub fn size(&self) -> usize {
        self.0.elements.lock().unwrap().len()
    }

    pub fn maximum(&self) -> Option<usize> {
        self.0.maximum
    }

    /// Reads slot `index`. Returns `None` for out-of-bounds indices,
    /// `Some(None)` for an empty slot.
    pub fn get(&self, index: usize) -> Option<Option<Func>> {
        self.0.elements.lock().unwrap().get(index).cloned()
    }

    /// Writes slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds; callers bounds-check whole ranges
    /// up front.
    pub fn set(&self, index: usize, func: Option<Func>) {
        self.0.elements.lock().unwrap()[index] = func;
    }

    /// Identity comparison: two handles to the same underlying table.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("size", &self.size())
            .field("maximum", &self.0.maximum)
            .finish()
    }
}
