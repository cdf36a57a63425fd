// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ptr::NonNull;
use std::sync::Arc;

use cranelift_entity::PrimaryMap;

use crate::indices::{FuncIndex, GlobalIndex};
use crate::values::{Mutability, Val, ValType};

/// Signature of the engine's argument-buffer trampoline for a compiled
/// function.
///
/// `args_and_results` points to `len` value slots; arguments are read from the
/// front and the (at most one) result is written back to slot 0. A `false`
/// return signals that the function trapped.
pub type VMEngineCallFunction =
    unsafe extern "C" fn(vmctx: *mut u8, args_and_results: *mut Val, len: usize) -> bool;

/// Entry points of one compiled function.
#[derive(Debug, Clone, Copy)]
pub struct FuncCallee {
    /// Raw machine-code entry point, for calls from other compiled code.
    pub native_call: NonNull<u8>,
    /// Trampoline entry point, for calls from the embedder.
    pub engine_call: VMEngineCallFunction,
}

// Safety: both fields are plain code addresses produced by the compiler; they
// carry no interior state of their own.
unsafe impl Send for FuncCallee {}
// Safety: see above
unsafe impl Sync for FuncCallee {}

/// Parameter and result types of a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncSignature {
    pub params: Vec<ValType>,
    pub result: Option<ValType>,
}

/// One entry of the function index space: either an import to be satisfied at
/// link time, or a function the engine compiled from this module.
#[derive(Debug, Clone)]
pub enum FuncDecl {
    Imported { signature: FuncSignature },
    Defined { signature: FuncSignature, callee: FuncCallee },
}

impl FuncDecl {
    pub fn signature(&self) -> &FuncSignature {
        match self {
            FuncDecl::Imported { signature } | FuncDecl::Defined { signature, .. } => signature,
        }
    }
}

/// What kind of definition an export names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Function,
    Table,
    Memory,
    Global,
}

/// One entry of the module's export section, in declaration order.
#[derive(Debug, Clone)]
pub struct ExportEntry {
    pub name: String,
    pub kind: ExportKind,
    pub index: u32,
}

/// An element segment: function indices to splat into the table at `offset`.
#[derive(Debug, Clone)]
pub struct ElementSegment {
    pub offset: u32,
    pub function_indices: Vec<FuncIndex>,
}

/// A data segment: bytes to copy into linear memory at `offset`.
#[derive(Debug, Clone)]
pub struct DataSegment {
    pub offset: u32,
    pub bytes: Arc<[u8]>,
}

/// A module-level global variable declaration.
#[derive(Debug, Clone, Copy)]
pub struct GlobalDef {
    pub content: ValType,
    pub mutability: Mutability,
    /// The constant initializer, as raw bits zero-extended to 64.
    pub init_raw: u64,
}

impl GlobalDef {
    /// The initializer as a typed value.
    pub fn init_val(&self) -> Val {
        match self.content {
            ValType::I32 => Val::I32(self.init_raw as u32 as i32),
            ValType::I64 => Val::I64(self.init_raw as i64),
            ValType::F32 => Val::F32(self.init_raw as u32),
            ValType::F64 => Val::F64(self.init_raw),
        }
    }
}

/// Everything the compile pipeline learned about one module, in the shape the
/// linker consumes.
///
/// The fields are filled in by the translation and compilation steps; this
/// crate only reads them.
#[derive(Debug, Default)]
pub struct TranslatedModule {
    pub name: String,
    /// Imported functions occupy indices `0..num_imported_functions` of the
    /// function index space.
    pub num_imported_functions: u32,
    pub functions: PrimaryMap<FuncIndex, FuncDecl>,
    pub globals: PrimaryMap<GlobalIndex, GlobalDef>,
    pub exports: Vec<ExportEntry>,
    pub elements: Vec<ElementSegment>,
    pub data: Vec<DataSegment>,
    /// The designated start function, if the module declared one.
    pub start_func: Option<FuncIndex>,
    /// Initial size of table 0, if the module defines a table.
    pub table_initial: Option<usize>,
    /// Initial size of memory 0 in bytes, if the module defines a memory.
    pub memory_initial: Option<usize>,
}

/// Immutable handle to a compiled module, shared between every instance
/// created from it.
#[derive(Clone)]
pub struct ModuleDescriptor(Arc<TranslatedModule>);

// ===== impl ModuleDescriptor =====

impl ModuleDescriptor {
    pub fn new(translated: TranslatedModule) -> Self {
        Self(Arc::new(translated))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn exports(&self) -> &[ExportEntry] {
        &self.0.exports
    }

    pub fn elements(&self) -> &[ElementSegment] {
        &self.0.elements
    }

    pub fn data_segments(&self) -> &[DataSegment] {
        &self.0.data
    }

    pub fn start_func(&self) -> Option<FuncIndex> {
        self.0.start_func
    }

    pub fn table_initial(&self) -> Option<usize> {
        self.0.table_initial
    }

    pub fn memory_initial(&self) -> Option<usize> {
        self.0.memory_initial
    }

    /// Whether `index` falls into the imported range of the function index
    /// space.
    pub fn is_imported_function(&self, index: FuncIndex) -> bool {
        index.as_u32() < self.0.num_imported_functions
    }

    pub fn function(&self, index: FuncIndex) -> &FuncDecl {
        &self.0.functions[index]
    }

    pub fn global(&self, index: GlobalIndex) -> &GlobalDef {
        &self.0.globals[index]
    }

    pub fn globals(&self) -> &PrimaryMap<GlobalIndex, GlobalDef> {
        &self.0.globals
    }

    /// The export name of `index`, if any export names it. Used to attach
    /// names to function wrappers.
    pub fn export_name_of_function(&self, index: FuncIndex) -> Option<&str> {
        self.0
            .exports
            .iter()
            .find(|export| export.kind == ExportKind::Function && export.index == index.as_u32())
            .map(|export| export.name.as_str())
    }

    pub(crate) fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.0.name)
            .field("exports", &self.0.exports.len())
            .field("functions", &self.0.functions.len())
            .finish_non_exhaustive()
    }
}
