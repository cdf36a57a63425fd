// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use anyhow::bail;
use hashbrown::HashMap;

use crate::func::Func;
use crate::indices::{FuncIndex, GlobalIndex};
use crate::instance::Instance;
use crate::module::{ExportKind, ModuleDescriptor};
use crate::trap::Trap;
use crate::values::{Mutability, Val, ValType};
use crate::Extern;

/// The namespace a linked record publishes its exports into.
#[derive(Debug, Default)]
pub struct ModuleEnvironment {
    bindings: HashMap<String, Extern>,
}

/// Where a [`ModuleRecord`] is in its one-shot lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Unlinked,
    Linked,
    Evaluated,
}

/// Drives one module through instantiation: `link` realizes the instance and
/// publishes its exports, `evaluate` runs the segment initializers and the
/// start function.
///
/// Both steps happen at most once per record. Calling either out of order
/// returns a typed [`Trap`] instead of corrupting the half-built instance,
/// and a failed `evaluate` still consumes the record: segment initialization
/// has observable side effects that must not be replayed.
pub struct ModuleRecord {
    module: ModuleDescriptor,
    state: RecordState,
    instance: Option<Instance>,
    start: Option<Func>,
    env: ModuleEnvironment,
}

// ===== impl ModuleEnvironment =====

impl ModuleEnvironment {
    fn define(&mut self, name: &str, value: Extern) {
        let previous = self.bindings.insert(name.to_owned(), value);
        assert!(previous.is_none(), "duplicate export name `{name}`");
    }

    pub fn get(&self, name: &str) -> Option<&Extern> {
        self.bindings.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

// ===== impl ModuleRecord =====

impl ModuleRecord {
    pub fn new(module: ModuleDescriptor) -> Self {
        Self {
            module,
            state: RecordState::Unlinked,
            instance: None,
            start: None,
            env: ModuleEnvironment::default(),
        }
    }

    pub fn module(&self) -> &ModuleDescriptor {
        &self.module
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    /// The realized instance. `None` until [`link`][Self::link] succeeds.
    pub fn instance(&self) -> Option<&Instance> {
        self.instance.as_ref()
    }

    /// The recorded start function. `None` until [`link`][Self::link]
    /// succeeds, or when the module has no start function.
    pub fn start_function(&self) -> Option<&Func> {
        self.start.as_ref()
    }

    pub fn environment(&self) -> &ModuleEnvironment {
        &self.env
    }

    /// Looks up a published export by name.
    pub fn get_export(&self, name: &str) -> Option<&Extern> {
        self.env.get(name)
    }

    /// Realizes the instance and publishes every export, in declaration
    /// order, into the record's environment.
    ///
    /// # Errors
    ///
    /// Returns [`Trap::AlreadyLinked`] if called twice, and
    /// [`Trap::ReexportedImport`] when a function export names an import.
    ///
    /// # Panics
    ///
    /// Panics on conditions upstream validation rules out: a table or memory
    /// export with nothing realized behind it, or a mutable or `i64` global
    /// export.
    pub fn link(&mut self) -> crate::Result<()> {
        if self.state != RecordState::Unlinked {
            bail!(Trap::AlreadyLinked);
        }

        tracing::debug!("linking module `{}`", self.module.name());
        let instance = Instance::new(self.module.clone());
        let mut env = ModuleEnvironment::default();

        for export in self.module.exports() {
            match export.kind {
                ExportKind::Function => {
                    let index = FuncIndex::from_u32(export.index);
                    if self.module.is_imported_function(index) {
                        bail!(Trap::ReexportedImport {
                            name: export.name.clone(),
                        });
                    }
                    env.define(&export.name, Extern::Func(instance.func_wrapper(index)));
                }
                ExportKind::Table => {
                    debug_assert_eq!(export.index, 0, "only table 0 can be exported");
                    let table = instance
                        .table()
                        .cloned()
                        .expect("exported table was never realized");
                    env.define(&export.name, Extern::Table(table));
                }
                ExportKind::Memory => {
                    debug_assert_eq!(export.index, 0, "only memory 0 can be exported");
                    let memory = instance
                        .memory()
                        .cloned()
                        .expect("exported memory was never realized");
                    env.define(&export.name, Extern::Memory(memory));
                }
                ExportKind::Global => {
                    let index = GlobalIndex::from_u32(export.index);
                    let def = self.module.global(index);
                    assert!(
                        def.mutability == Mutability::Const,
                        "exported global `{}` is mutable",
                        export.name,
                    );
                    let value = match def.content {
                        ValType::I32 => Val::I32(instance.globals().load_i32(index)),
                        ValType::F32 => Val::from(instance.globals().load_f32(index)),
                        ValType::F64 => Val::from(instance.globals().load_f64(index)),
                        ValType::I64 => {
                            panic!("exported global `{}` has type i64", export.name)
                        }
                    };
                    env.define(&export.name, Extern::Global(value));
                }
            }
        }

        if let Some(index) = self.module.start_func() {
            assert!(
                !self.module.is_imported_function(index),
                "start function must be defined in the module",
            );
            let start = instance.func_wrapper_named(index, Some("start"));
            debug_assert!(
                start.signature().params.is_empty() && start.signature().result.is_none(),
                "start function must take no parameters and return nothing",
            );
            self.start = Some(start);
        }

        self.instance = Some(instance);
        self.env = env;
        self.state = RecordState::Linked;
        Ok(())
    }

    /// Runs the module's initializers: element segments into the table, data
    /// segments into memory, then the start function.
    ///
    /// The record transitions to [`RecordState::Evaluated`] on entry, so a
    /// failed evaluation cannot be retried; partial segment writes are
    /// observable at that point.
    ///
    /// # Errors
    ///
    /// Returns a typed [`Trap`] when called out of order, when a segment
    /// fails its bounds check or names an imported function, or when the
    /// start function traps.
    pub fn evaluate(&mut self) -> crate::Result<()> {
        match self.state {
            RecordState::Unlinked => bail!(Trap::NotLinked),
            RecordState::Evaluated => bail!(Trap::AlreadyEvaluated),
            RecordState::Linked => {}
        }
        self.state = RecordState::Evaluated;

        tracing::debug!("evaluating module `{}`", self.module.name());
        let instance = self
            .instance
            .as_ref()
            .expect("linked record always has an instance");

        for segment in self.module.elements() {
            if segment.function_indices.is_empty() {
                continue;
            }
            let table = instance.table().expect("element segment without a table");
            let table_size = table.size();

            // Widened so `offset + len - 1` cannot wrap on 32-bit quantities.
            let last_index =
                u64::from(segment.offset) + segment.function_indices.len() as u64 - 1;
            if last_index >= table_size as u64 {
                bail!(Trap::ElementSegmentOutOfBounds {
                    offset: segment.offset,
                    len: segment.function_indices.len(),
                    table_size,
                });
            }

            for (i, func_index) in segment.function_indices.iter().enumerate() {
                if self.module.is_imported_function(*func_index) {
                    bail!(Trap::ElementSegmentFromImport {
                        function_index: func_index.as_u32(),
                    });
                }
                let func = instance.func_wrapper(*func_index);
                table.set(segment.offset as usize + i, Some(func));
            }
        }

        for segment in self.module.data_segments() {
            let segment_size = segment.bytes.len();
            // Empty segments are complete no-ops, offset included.
            if segment_size == 0 {
                continue;
            }
            let memory = instance.memory().expect("data segment without a memory");
            let memory_size = memory.size();

            if memory_size < segment_size {
                bail!(Trap::DataSegmentTooBig {
                    segment_size,
                    memory_size,
                    offset: segment.offset,
                });
            }
            if segment.offset as usize > memory_size - segment_size {
                bail!(Trap::DataSegmentOutsideMemory {
                    segment_size,
                    memory_size,
                    offset: segment.offset,
                });
            }
            memory.write(segment.offset as usize, &segment.bytes);
        }

        if let Some(start) = &self.start {
            tracing::debug!(
                "running start function of module `{}`",
                self.module.name()
            );
            start.call(&[])?;
        }

        Ok(())
    }
}

impl fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("module", &self.module.name())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::module::{
        DataSegment, ElementSegment, ExportEntry, FuncCallee, FuncDecl, FuncSignature, GlobalDef,
        TranslatedModule, VMEngineCallFunction,
    };

    unsafe extern "C" fn ret_42(_vmctx: *mut u8, args_and_results: *mut Val, len: usize) -> bool {
        assert!(len >= 1);
        unsafe { args_and_results.write(Val::I32(42)) };
        true
    }

    unsafe extern "C" fn noop(_vmctx: *mut u8, _args_and_results: *mut Val, _len: usize) -> bool {
        true
    }

    unsafe extern "C" fn trapping(
        _vmctx: *mut u8,
        _args_and_results: *mut Val,
        _len: usize,
    ) -> bool {
        false
    }

    static START_CALLS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counting_start(
        _vmctx: *mut u8,
        _args_and_results: *mut Val,
        _len: usize,
    ) -> bool {
        START_CALLS.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn sig(params: Vec<ValType>, result: Option<ValType>) -> FuncSignature {
        FuncSignature { params, result }
    }

    fn defined(signature: FuncSignature, engine_call: VMEngineCallFunction) -> FuncDecl {
        FuncDecl::Defined {
            signature,
            callee: FuncCallee {
                native_call: NonNull::dangling(),
                engine_call,
            },
        }
    }

    fn imported(signature: FuncSignature) -> FuncDecl {
        FuncDecl::Imported { signature }
    }

    fn module_with(build: impl FnOnce(&mut TranslatedModule)) -> ModuleDescriptor {
        let mut translated = TranslatedModule {
            name: "test".to_owned(),
            ..TranslatedModule::default()
        };
        build(&mut translated);
        ModuleDescriptor::new(translated)
    }

    fn func_export(name: &str, index: u32) -> ExportEntry {
        ExportEntry {
            name: name.to_owned(),
            kind: ExportKind::Function,
            index,
        }
    }

    fn downcast_trap(err: anyhow::Error) -> Trap {
        err.downcast::<Trap>().expect("expected a Trap")
    }

    #[test]
    fn link_publishes_function_exports() {
        let module = module_with(|m| {
            m.functions.push(defined(sig(vec![], Some(ValType::I32)), ret_42));
            m.exports.push(func_export("answer", 0));
        });
        let mut record = ModuleRecord::new(module);
        record.link().unwrap();
        assert_eq!(record.state(), RecordState::Linked);

        let func = record.get_export("answer").unwrap().clone().into_func().unwrap();
        let result = func.call(&[]).unwrap();
        assert_eq!(result, Some(Val::I32(42)));
    }

    #[test]
    fn link_is_one_shot() {
        let module = module_with(|_| {});
        let mut record = ModuleRecord::new(module);
        record.link().unwrap();

        let err = record.link().unwrap_err();
        assert_eq!(downcast_trap(err), Trap::AlreadyLinked);
    }

    #[test]
    fn evaluate_requires_link() {
        let module = module_with(|_| {});
        let mut record = ModuleRecord::new(module);

        let err = record.evaluate().unwrap_err();
        assert_eq!(downcast_trap(err), Trap::NotLinked);
    }

    #[test]
    fn evaluate_is_one_shot() {
        let module = module_with(|_| {});
        let mut record = ModuleRecord::new(module);
        record.link().unwrap();
        record.evaluate().unwrap();

        let err = record.evaluate().unwrap_err();
        assert_eq!(downcast_trap(err), Trap::AlreadyEvaluated);
    }

    #[test]
    fn reexporting_an_import_fails() {
        let module = module_with(|m| {
            m.num_imported_functions = 1;
            m.functions.push(imported(sig(vec![], None)));
            m.exports.push(func_export("forwarded", 0));
        });
        let mut record = ModuleRecord::new(module);

        let err = record.link().unwrap_err();
        assert_eq!(
            downcast_trap(err),
            Trap::ReexportedImport {
                name: "forwarded".to_owned()
            }
        );
    }

    #[test]
    fn exports_of_the_same_function_share_one_wrapper() {
        let module = module_with(|m| {
            m.functions.push(defined(sig(vec![], Some(ValType::I32)), ret_42));
            m.exports.push(func_export("a", 0));
            m.exports.push(func_export("b", 0));
        });
        let mut record = ModuleRecord::new(module);
        record.link().unwrap();

        let a = record.get_export("a").unwrap().clone().into_func().unwrap();
        let b = record.get_export("b").unwrap().clone().into_func().unwrap();
        assert!(a.same(&b));
    }

    #[test]
    fn immutable_globals_are_published_as_values() {
        let module = module_with(|m| {
            m.globals.push(GlobalDef {
                content: ValType::I32,
                mutability: Mutability::Const,
                init_raw: u64::from(7_u32),
            });
            m.globals.push(GlobalDef {
                content: ValType::F64,
                mutability: Mutability::Const,
                init_raw: 2.5_f64.to_bits(),
            });
            m.exports.push(ExportEntry {
                name: "seven".to_owned(),
                kind: ExportKind::Global,
                index: 0,
            });
            m.exports.push(ExportEntry {
                name: "pi-ish".to_owned(),
                kind: ExportKind::Global,
                index: 1,
            });
        });
        let mut record = ModuleRecord::new(module);
        record.link().unwrap();

        assert_eq!(
            record.get_export("seven").unwrap().clone().into_global(),
            Some(Val::I32(7))
        );
        assert_eq!(
            record.get_export("pi-ish").unwrap().clone().into_global(),
            Some(Val::from(2.5_f64))
        );
    }

    #[test]
    fn element_segment_fills_table_slots() {
        let module = module_with(|m| {
            m.table_initial = Some(8);
            let f = m.functions.push(defined(sig(vec![], Some(ValType::I32)), ret_42));
            m.exports.push(func_export("f", 0));
            m.elements.push(ElementSegment {
                offset: 5,
                function_indices: vec![f, f, f],
            });
        });
        let mut record = ModuleRecord::new(module);
        record.link().unwrap();
        record.evaluate().unwrap();

        let instance = record.instance().unwrap();
        let table = instance.table().unwrap();
        assert!(table.get(4).unwrap().is_none());
        let slot = table.get(5).unwrap().unwrap();
        assert!(table.get(7).unwrap().is_some());

        // Table slots and exports of the same function share one identity.
        let exported = record.get_export("f").unwrap().clone().into_func().unwrap();
        assert!(slot.same(&exported));
    }

    #[test]
    fn element_segment_past_the_table_end_fails() {
        let module = module_with(|m| {
            m.table_initial = Some(7);
            let f = m.functions.push(defined(sig(vec![], None), noop));
            m.elements.push(ElementSegment {
                offset: 5,
                function_indices: vec![f, f, f],
            });
        });
        let mut record = ModuleRecord::new(module);
        record.link().unwrap();

        let err = record.evaluate().unwrap_err();
        assert_eq!(
            downcast_trap(err),
            Trap::ElementSegmentOutOfBounds {
                offset: 5,
                len: 3,
                table_size: 7,
            }
        );
        // A failed evaluation still consumes the record.
        assert_eq!(record.state(), RecordState::Evaluated);
    }

    #[test]
    fn element_segment_naming_an_import_fails() {
        let module = module_with(|m| {
            m.table_initial = Some(4);
            m.num_imported_functions = 1;
            let f = m.functions.push(imported(sig(vec![], None)));
            m.elements.push(ElementSegment {
                offset: 0,
                function_indices: vec![f],
            });
        });
        let mut record = ModuleRecord::new(module);
        record.link().unwrap();

        let err = record.evaluate().unwrap_err();
        assert_eq!(
            downcast_trap(err),
            Trap::ElementSegmentFromImport { function_index: 0 }
        );
    }

    #[test]
    fn data_segment_copies_bytes() {
        let module = module_with(|m| {
            m.memory_initial = Some(20);
            m.data.push(DataSegment {
                offset: 5,
                bytes: Arc::from([0xaa_u8; 10]),
            });
        });
        let mut record = ModuleRecord::new(module);
        record.link().unwrap();
        record.evaluate().unwrap();

        let mut buf = [0_u8; 20];
        record.instance().unwrap().memory().unwrap().read(0, &mut buf);
        assert_eq!(&buf[..5], &[0; 5]);
        assert_eq!(&buf[5..15], &[0xaa; 10]);
        assert_eq!(&buf[15..], &[0; 5]);
    }

    #[test]
    fn data_segment_larger_than_memory_fails() {
        let module = module_with(|m| {
            m.memory_initial = Some(8);
            m.data.push(DataSegment {
                offset: 0,
                bytes: Arc::from([0_u8; 10]),
            });
        });
        let mut record = ModuleRecord::new(module);
        record.link().unwrap();

        let err = record.evaluate().unwrap_err();
        assert_eq!(
            downcast_trap(err),
            Trap::DataSegmentTooBig {
                segment_size: 10,
                memory_size: 8,
                offset: 0,
            }
        );
    }

    #[test]
    fn data_segment_overhanging_memory_fails() {
        let module = module_with(|m| {
            m.memory_initial = Some(12);
            m.data.push(DataSegment {
                offset: 5,
                bytes: Arc::from([0_u8; 10]),
            });
        });
        let mut record = ModuleRecord::new(module);
        record.link().unwrap();

        let err = record.evaluate().unwrap_err();
        assert_eq!(
            downcast_trap(err),
            Trap::DataSegmentOutsideMemory {
                segment_size: 10,
                memory_size: 12,
                offset: 5,
            }
        );
    }

    #[test]
    fn empty_data_segment_skips_bounds_checks() {
        let module = module_with(|m| {
            m.memory_initial = Some(4);
            m.data.push(DataSegment {
                offset: 1000,
                bytes: Arc::from([]),
            });
        });
        let mut record = ModuleRecord::new(module);
        record.link().unwrap();
        record.evaluate().unwrap();
    }

    #[test]
    fn start_function_runs_exactly_once() {
        let module = module_with(|m| {
            let f = m.functions.push(defined(sig(vec![], None), counting_start));
            m.start_func = Some(f);
        });
        let mut record = ModuleRecord::new(module);
        record.link().unwrap();

        let start = record.start_function().unwrap();
        assert_eq!(start.name(), Some("start"));

        let before = START_CALLS.load(Ordering::Relaxed);
        record.evaluate().unwrap();
        assert_eq!(START_CALLS.load(Ordering::Relaxed), before + 1);

        // A second evaluation fails without re-running the start function.
        record.evaluate().unwrap_err();
        assert_eq!(START_CALLS.load(Ordering::Relaxed), before + 1);
    }

    #[test]
    fn start_function_trap_propagates() {
        let module = module_with(|m| {
            let f = m.functions.push(defined(sig(vec![], None), trapping));
            m.start_func = Some(f);
            m.exports.push(func_export("boom", 0));
        });
        let mut record = ModuleRecord::new(module);
        record.link().unwrap();

        let err = record.evaluate().unwrap_err();
        assert_eq!(
            downcast_trap(err),
            Trap::UserTrap {
                function: Some("boom".to_owned())
            }
        );
        assert_eq!(record.state(), RecordState::Evaluated);
    }

    #[test]
    fn table_and_memory_exports_share_the_instance_state() {
        let module = module_with(|m| {
            m.table_initial = Some(2);
            m.memory_initial = Some(16);
            m.exports.push(ExportEntry {
                name: "table".to_owned(),
                kind: ExportKind::Table,
                index: 0,
            });
            m.exports.push(ExportEntry {
                name: "memory".to_owned(),
                kind: ExportKind::Memory,
                index: 0,
            });
        });
        let mut record = ModuleRecord::new(module);
        record.link().unwrap();

        let instance = record.instance().unwrap();
        let table = record.get_export("table").unwrap().clone().into_table().unwrap();
        let memory = record.get_export("memory").unwrap().clone().into_memory().unwrap();
        assert!(table.same(instance.table().unwrap()));
        assert!(memory.same(instance.memory().unwrap()));
    }
}
