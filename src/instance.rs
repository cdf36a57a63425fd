// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

use crate::func::Func;
use crate::global::GlobalSet;
use crate::indices::FuncIndex;
use crate::memory::Memory;
use crate::module::{FuncDecl, ModuleDescriptor};
use crate::table::Table;

/// A live instantiation of a [`ModuleDescriptor`]: its table, its memory, its
/// global storage, and the function wrappers minted on demand.
#[derive(Clone)]
pub struct Instance(Arc<InstanceInner>);

pub(crate) struct InstanceInner {
    module: ModuleDescriptor,
    table: Option<Table>,
    memory: Option<Memory>,
    globals: GlobalSet,
    /// Wrapper cache. One `Func` per function index, so every table slot and
    /// export naming the same function shares one identity.
    wrappers: Mutex<HashMap<FuncIndex, Func>>,
}

// ===== impl Instance =====

impl Instance {
    /// Creates the runtime state for one instantiation of `module`.
    pub fn new(module: ModuleDescriptor) -> Self {
        let table = module.table_initial().map(|initial| Table::new(initial, None));
        let memory = module.memory_initial().map(Memory::new);
        let globals = GlobalSet::from_module(&module);

        Self(Arc::new(InstanceInner {
            module,
            table,
            memory,
            globals,
            wrappers: Mutex::new(HashMap::new()),
        }))
    }

    pub fn module(&self) -> &ModuleDescriptor {
        &self.0.module
    }

    /// Table 0, if the module defines a table.
    pub fn table(&self) -> Option<&Table> {
        self.0.table.as_ref()
    }

    /// Memory 0, if the module defines a memory.
    pub fn memory(&self) -> Option<&Memory> {
        self.0.memory.as_ref()
    }

    pub fn globals(&self) -> &GlobalSet {
        &self.0.globals
    }

    /// Returns the wrapper for the defined function `index`, creating it on
    /// first use. Subsequent calls for the same index return handles that
    /// compare equal through [`Func::same`].
    ///
    /// # Panics
    ///
    /// Panics if `index` names an imported function; callers filter those
    /// out before asking for a wrapper.
    pub fn func_wrapper(&self, index: FuncIndex) -> Func {
        self.func_wrapper_named(index, None)
    }

    /// Like [`func_wrapper`][Self::func_wrapper], but attaches `fallback`
    /// as the wrapper's name when no export names the function.
    pub(crate) fn func_wrapper_named(&self, index: FuncIndex, fallback: Option<&str>) -> Func {
        let mut wrappers = self.0.wrappers.lock().unwrap();
        if let Some(func) = wrappers.get(&index) {
            return func.clone();
        }

        let FuncDecl::Defined { signature, callee } = self.0.module.function(index) else {
            panic!("requested a wrapper for imported function {index:?}");
        };
        let name = self
            .0
            .module
            .export_name_of_function(index)
            .or(fallback)
            .map(str::to_owned);

        let func = Func::new(&self.0, index, name, signature.clone(), *callee);
        wrappers.insert(index, func.clone());
        func
    }

    /// Identity comparison: two handles to the same instance.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("module", &self.0.module.name())
            .finish_non_exhaustive()
    }
}
