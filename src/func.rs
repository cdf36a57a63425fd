// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cmp;
use core::fmt;
use std::sync::{Arc, Weak};

use anyhow::{bail, ensure, Context};
use smallvec::SmallVec;

use crate::indices::FuncIndex;
use crate::instance::InstanceInner;
use crate::module::{FuncCallee, FuncSignature};
use crate::trap::Trap;
use crate::values::Val;

/// A callable reference to one function of one instance.
///
/// `Func` is the wrapper identity the linker hands out: asking an instance
/// for the same function index twice yields handles to the same underlying
/// data, so table slots and exports that name the same function compare
/// equal through [`same`][Self::same].
#[derive(Clone)]
pub struct Func(Arc<FuncData>);

struct FuncData {
    /// Weak so that wrappers stored in the instance's own table do not keep
    /// the instance alive forever.
    instance: Weak<InstanceInner>,
    index: FuncIndex,
    name: Option<String>,
    signature: FuncSignature,
    callee: FuncCallee,
}

// ===== impl Func =====

impl Func {
    pub(crate) fn new(
        instance: &Arc<InstanceInner>,
        index: FuncIndex,
        name: Option<String>,
        signature: FuncSignature,
        callee: FuncCallee,
    ) -> Self {
        Self(Arc::new(FuncData {
            instance: Arc::downgrade(instance),
            index,
            name,
            signature,
            callee,
        }))
    }

    /// The function's export name, if it has one.
    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn index(&self) -> FuncIndex {
        self.0.index
    }

    pub fn signature(&self) -> &FuncSignature {
        &self.0.signature
    }

    /// Raw machine-code entry point, for calls from other compiled code.
    pub fn native_call(&self) -> core::ptr::NonNull<u8> {
        self.0.callee.native_call
    }

    /// Identity comparison: two handles to the same function of the same
    /// instance.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Calls the function with `args`, returning its result if the signature
    /// declares one.
    ///
    /// # Errors
    ///
    /// Returns an error on arity or type mismatch, when the owning instance
    /// has been dropped, or with a downcastable [`Trap`] when the function
    /// traps.
    pub fn call(&self, args: &[Val]) -> crate::Result<Option<Val>> {
        let signature = &self.0.signature;
        ensure!(
            args.len() == signature.params.len(),
            "expected {} arguments, got {}",
            signature.params.len(),
            args.len(),
        );
        for (arg, expected) in args.iter().zip(&signature.params) {
            ensure!(
                arg.ty() == *expected,
                "argument type mismatch: expected {expected}, got {}",
                arg.ty(),
            );
        }

        let instance = self
            .0
            .instance
            .upgrade()
            .context("instance has been dropped")?;

        // The trampoline reads arguments from and writes the result back
        // into the same buffer.
        let len = cmp::max(args.len(), usize::from(signature.result.is_some()));
        let mut storage: SmallVec<[Val; 8]> = SmallVec::with_capacity(len);
        storage.extend_from_slice(args);
        storage.resize(len, Val::I32(0));

        let vmctx = Arc::as_ptr(&instance).cast_mut().cast::<u8>();

        tracing::trace!(
            "calling function {:?} ({} args)",
            self.0.name.as_deref().unwrap_or("<anonymous>"),
            args.len(),
        );

        // Safety: the callee was produced by the compiler for exactly this
        // signature, the buffer holds `len` initialized slots, and `vmctx`
        // points to the live instance we hold an Arc to across the call.
        let ok = unsafe { (self.0.callee.engine_call)(vmctx, storage.as_mut_ptr(), len) };
        if !ok {
            bail!(Trap::UserTrap {
                function: self.0.name.clone(),
            });
        }

        Ok(signature.result.map(|_| storage[0]))
    }
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Func")
            .field("index", &self.0.index)
            .field("name", &self.0.name)
            .finish_non_exhaustive()
    }
}
