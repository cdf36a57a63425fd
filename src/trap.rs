// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::error::Error;
use core::fmt;

/// Recoverable failures raised while linking or evaluating an instance.
///
/// Conditions that upstream validation guarantees impossible (exporting a
/// table that was never realized, exporting a mutable global, ...) are *not*
/// represented here; those abort via assertions since they indicate a bug in
/// a collaborator rather than a user error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trap {
    /// A function export refers into the import index range. Re-exporting an
    /// import has to reuse the wrapper identity the import already carries,
    /// which this crate does not implement yet.
    ReexportedImport { name: String },
    /// An element segment initializes a table slot from an imported function
    /// index, which this crate does not implement yet.
    ElementSegmentFromImport { function_index: u32 },
    /// An element segment would write past the end of the table.
    ElementSegmentOutOfBounds {
        offset: u32,
        len: usize,
        table_size: usize,
    },
    /// A data segment is larger than the entire linear memory.
    DataSegmentTooBig {
        segment_size: usize,
        memory_size: usize,
        offset: u32,
    },
    /// A data segment fits in memory but not at its declared offset.
    DataSegmentOutsideMemory {
        segment_size: usize,
        memory_size: usize,
        offset: u32,
    },
    /// `link` was called on a record that is already linked.
    AlreadyLinked,
    /// `evaluate` was called on a record that was never linked.
    NotLinked,
    /// `evaluate` was called a second time.
    AlreadyEvaluated,
    /// A function (usually the start routine) raised a trap.
    UserTrap { function: Option<String> },
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trap::ReexportedImport { name } => {
                write!(f, "export `{name}` re-exports an import, which is not supported")
            }
            Trap::ElementSegmentFromImport { function_index } => write!(
                f,
                "element segment sets a table slot from imported function {function_index}, which is not supported"
            ),
            Trap::ElementSegmentOutOfBounds {
                offset,
                len,
                table_size,
            } => write!(
                f,
                "element segment of {len} entries at offset {offset} sets an out of bounds index in table of size {table_size}"
            ),
            Trap::DataSegmentTooBig {
                segment_size,
                memory_size,
                offset,
            } => write!(
                f,
                "invalid data segment initialization: segment of {segment_size} bytes, memory of {memory_size} bytes, at offset {offset}, segment is too big"
            ),
            Trap::DataSegmentOutsideMemory {
                segment_size,
                memory_size,
                offset,
            } => write!(
                f,
                "invalid data segment initialization: segment of {segment_size} bytes, memory of {memory_size} bytes, at offset {offset}, segment writes outside of memory"
            ),
            Trap::AlreadyLinked => f.write_str("module record is already linked"),
            Trap::NotLinked => f.write_str("module record has not been linked"),
            Trap::AlreadyEvaluated => f.write_str("module record has already been evaluated"),
            Trap::UserTrap { function } => match function {
                Some(name) => write!(f, "function `{name}` trapped"),
                None => f.write_str("function trapped"),
            },
        }
    }
}

impl Error for Trap {}
