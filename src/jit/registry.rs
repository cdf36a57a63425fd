// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::{Arc, LazyLock, Mutex, Weak};

use crate::jit::alloc::AllocatorInner;

/// Process-wide set of live [`ExecAllocator`][crate::ExecAllocator]s.
///
/// The registry is used only for aggregate queries and the optional global
/// cap on executable memory; it takes no part in allocation itself. Its mutex
/// is held for O(allocators) bookkeeping only and never across a
/// page-reservation syscall, so concurrent growth of unrelated allocators is
/// never serialized here.
#[derive(Debug)]
pub struct AllocatorRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    allocators: Vec<Weak<AllocatorInner>>,
    limit: Option<usize>,
}

static GLOBAL: LazyLock<Arc<AllocatorRegistry>> = LazyLock::new(|| AllocatorRegistry::new(None));

// ===== impl AllocatorRegistry =====

impl AllocatorRegistry {
    /// Creates a fresh registry with the given executable-memory cap.
    ///
    /// Most callers want [`AllocatorRegistry::global`] instead; separate
    /// registries exist so independent embedders (and tests) can account
    /// their allocators in isolation.
    pub fn new(limit: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegistryState {
                allocators: Vec::new(),
                limit,
            }),
        })
    }

    /// Returns the process-wide default registry. No cap is configured on it
    /// unless [`set_limit`][Self::set_limit] is called.
    pub fn global() -> Arc<Self> {
        GLOBAL.clone()
    }

    /// Configures (or removes) the global executable-memory cap, in bytes.
    pub fn set_limit(&self, limit: Option<usize>) {
        self.state.lock().unwrap().limit = limit;
    }

    pub fn limit(&self) -> Option<usize> {
        self.state.lock().unwrap().limit
    }

    pub(crate) fn register(&self, allocator: Weak<AllocatorInner>) {
        let mut state = self.state.lock().unwrap();
        state.allocators.retain(|weak| weak.strong_count() > 0);
        state.allocators.push(allocator);
    }

    pub(crate) fn unregister(&self, allocator: &AllocatorInner) {
        let mut state = self.state.lock().unwrap();
        state
            .allocators
            .retain(|weak| !core::ptr::eq(weak.as_ptr(), allocator) && weak.strong_count() > 0);
    }

    /// Sum of live handle bytes across every live allocator in this registry.
    pub fn aggregate_bytes_allocated(&self) -> usize {
        self.aggregate(AllocatorInner::bytes_allocated)
    }

    /// Sum of committed page bytes across every live allocator in this
    /// registry.
    pub fn aggregate_bytes_committed(&self) -> usize {
        self.aggregate(AllocatorInner::bytes_committed)
    }

    fn aggregate(&self, count: impl Fn(&AllocatorInner) -> usize) -> usize {
        let state = self.state.lock().unwrap();
        state
            .allocators
            .iter()
            .filter_map(Weak::upgrade)
            .map(|allocator| count(&allocator))
            .sum()
    }

    /// Whether aggregate usage has crossed half of the configured cap.
    /// Always false when no cap is configured.
    pub fn under_memory_pressure(&self) -> bool {
        match self.limit() {
            Some(limit) => self.aggregate_bytes_allocated() > limit / 2,
            None => false,
        }
    }

    /// A throttling multiplier for speculative compilation.
    ///
    /// The returned value is monotonically non-decreasing in `added_bytes`
    /// and always at least 1.0. With no cap configured it is exactly 1.0;
    /// otherwise it approaches infinity as `aggregate + added_bytes`
    /// approaches the cap. Tiering heuristics multiply their estimated
    /// compile cost by this value.
    pub fn memory_pressure_multiplier(&self, added_bytes: usize) -> f64 {
        let Some(limit) = self.limit() else {
            return 1.0;
        };

        let bytes_allocated = self
            .aggregate_bytes_allocated()
            .saturating_add(added_bytes)
            .min(limit);
        if bytes_allocated >= limit {
            return f64::INFINITY;
        }

        let result = limit as f64 / (limit - bytes_allocated) as f64;
        result.max(1.0)
    }

    /// Whether aggregate usage has reached the configured cap. Growth must
    /// fail immediately while this holds.
    pub(crate) fn at_capacity(&self) -> bool {
        match self.limit() {
            Some(limit) => self.aggregate_bytes_allocated() >= limit,
            None => false,
        }
    }

    /// Returns whether `addr` points into a live allocation of any allocator
    /// in this registry.
    ///
    /// Does not allocate, so it is callable from crash/signal handlers. Lock
    /// order is registry first, then each allocator in turn; allocators never
    /// take the registry lock while holding their own.
    pub fn is_valid_executable_memory(&self, addr: usize) -> bool {
        let state = self.state.lock().unwrap();
        state
            .allocators
            .iter()
            .filter_map(Weak::upgrade)
            .any(|allocator| allocator.is_valid_executable_memory(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplier_without_limit_is_one() {
        let registry = AllocatorRegistry::new(None);
        assert_eq!(registry.memory_pressure_multiplier(0), 1.0);
        assert_eq!(registry.memory_pressure_multiplier(usize::MAX), 1.0);
        assert!(!registry.under_memory_pressure());
    }

    #[test]
    fn multiplier_is_monotonic_and_at_least_one() {
        let registry = AllocatorRegistry::new(Some(1 << 20));

        let mut previous = 0.0_f64;
        for added in [0, 1, 1 << 10, 1 << 16, 1 << 19, (1 << 20) - 1, 1 << 20] {
            let multiplier = registry.memory_pressure_multiplier(added);
            assert!(multiplier >= 1.0);
            assert!(multiplier >= previous);
            previous = multiplier;
        }

        assert_eq!(registry.memory_pressure_multiplier(1 << 20), f64::INFINITY);
    }
}
