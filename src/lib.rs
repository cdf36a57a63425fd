// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Executable-memory allocation and module instantiation for a scripting
//! engine's JIT tiers.
//!
//! The [`jit`] module hands out writable+executable memory to the compiler
//! through [`ExecAllocator`], with an optional process-wide cap and the
//! memory-pressure signals the tiering heuristics feed on.
//!
//! The rest of the crate takes a compiled [`ModuleDescriptor`] through
//! instantiation: a [`ModuleRecord`] is linked (realizing the
//! [`Instance`] and publishing exports) and then evaluated (running element
//! and data segment initializers and the start function). Failures surface
//! as [`anyhow::Error`]s that downcast to a typed [`Trap`].

mod func;
mod global;
mod instance;
pub mod jit;
mod linker;
mod memory;
mod module;
mod table;
mod trap;
mod utils;
mod values;

pub mod indices;

pub use func::Func;
pub use global::GlobalSet;
pub use instance::Instance;
pub use jit::{AllocatorRegistry, CompilationEffort, ExecAllocator, ExecMemoryHandle};
pub use linker::{ModuleEnvironment, ModuleRecord, RecordState};
pub use memory::Memory;
pub use module::{
    DataSegment, ElementSegment, ExportEntry, ExportKind, FuncCallee, FuncDecl, FuncSignature,
    GlobalDef, ModuleDescriptor, TranslatedModule, VMEngineCallFunction,
};
pub use table::Table;
pub use trap::Trap;
pub use values::{Mutability, Val, ValType};

pub use utils::host_page_size;

pub type Result<T> = anyhow::Result<T>;

/// The different kinds of values a linked module publishes into its
/// environment.
#[derive(Debug, Clone)]
pub enum Extern {
    Func(Func),
    Table(Table),
    Memory(Memory),
    /// An immutable global, snapshot at link time.
    Global(Val),
}

// ===== impl Extern =====

impl Extern {
    utils::owned_enum_accessors! {
        e
        (Func(Func) into_func e)
        (Table(Table) into_table e)
        (Memory(Memory) into_memory e)
        (Global(Val) into_global e)
    }
}

impl From<Func> for Extern {
    fn from(func: Func) -> Self {
        Extern::Func(func)
    }
}

impl From<Table> for Extern {
    fn from(table: Table) -> Self {
        Extern::Table(table)
    }
}

impl From<Memory> for Extern {
    fn from(memory: Memory) -> Self {
        Extern::Memory(memory)
    }
}

impl From<Val> for Extern {
    fn from(value: Val) -> Self {
        Extern::Global(value)
    }
}
