// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Executable-memory management for the JIT tiers.
//!
//! Code memory is handed out as reference-counted [`ExecMemoryHandle`]s by an
//! [`ExecAllocator`]; every allocator is tracked by an [`AllocatorRegistry`]
//! that enforces the optional process-wide cap and answers aggregate queries
//! (memory pressure, crash-handler address validity).

mod alloc;
mod registry;
mod reservation;

pub use alloc::{
    CompilationEffort, ExecAllocator, ExecAllocatorLock, ExecMemoryHandle, JIT_ALLOCATION_GRANULE,
    JIT_ALLOCATOR_LARGE_ALLOC_SIZE,
};
pub use registry::AllocatorRegistry;
pub use reservation::{PageReservation, Permissions};
