// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ops::Range;
use core::ptr::NonNull;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::jit::registry::AllocatorRegistry;
use crate::jit::reservation::{PageReservation, Permissions};
use crate::utils::{host_page_size, round_usize_up_to, round_usize_up_to_host_pages};

/// Smallest unit of sub-allocation within a reservation.
pub const JIT_ALLOCATION_GRANULE: usize = 32;

/// Default chunk size requested from the reservation layer when the free
/// list cannot satisfy a request.
pub const JIT_ALLOCATOR_LARGE_ALLOC_SIZE: usize = 2 << 20;

/// How hard a compilation call site needs `allocate` to succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationEffort {
    /// The caller has a fallback path (e.g. staying in the interpreter) and
    /// can tolerate a failed allocation.
    CanFail,
    /// The caller has no fallback; a failed allocation aborts the process.
    MustSucceed,
}

/// Sub-allocates writable+executable memory for a JIT compiler.
///
/// One allocator is created per independent execution context. It grows by
/// reserving large page-aligned chunks from the OS, carves them into
/// granule-sized handles through an address-ordered free list, and commits
/// and decommits the underlying pages as handles come and go. Dropping the
/// allocator releases every reservation unconditionally; outstanding handles
/// become invalid by contract.
pub struct ExecAllocator {
    inner: Arc<AllocatorInner>,
    registry: Arc<AllocatorRegistry>,
    large_alloc_size: usize,
}

#[derive(Debug)]
pub(crate) struct AllocatorInner {
    bytes_allocated: AtomicUsize,
    bytes_committed: AtomicUsize,
    state: Mutex<AllocatorState>,
}

#[derive(Debug)]
struct AllocatorState {
    reservations: SmallVec<[PageReservation; 16]>,
    /// Free sub-ranges, keyed by start address, coalesced on insert.
    free: BTreeMap<usize, usize>,
    /// Count of live handles overlapping each committed page.
    page_refs: HashMap<usize, u32>,
}

/// Reference-counted view onto a sub-range of executable memory.
///
/// The range stays writable and executable for as long as any clone of the
/// handle is alive; when the last clone drops, the range returns to the
/// owning allocator's free space and fully-freed pages may be decommitted.
/// A live handle's range never aliases another live handle's range.
#[derive(Debug, Clone)]
pub struct ExecMemoryHandle(Arc<HandleInner>);

#[derive(Debug)]
struct HandleInner {
    start: usize,
    len: usize,
    owner_tag: usize,
    allocator: Weak<AllocatorInner>,
}

/// Holds the allocator's lock, for queries that must observe a consistent
/// snapshot (e.g. from a crash handler).
pub struct ExecAllocatorLock<'a> {
    state: MutexGuard<'a, AllocatorState>,
}

// ===== impl ExecAllocator =====

impl ExecAllocator {
    /// Creates a new allocator and registers it with `registry`.
    pub fn new(registry: Arc<AllocatorRegistry>) -> Self {
        Self::with_large_alloc_size(registry, JIT_ALLOCATOR_LARGE_ALLOC_SIZE)
    }

    /// Like [`ExecAllocator::new`] but with a custom growth chunk size.
    pub fn with_large_alloc_size(registry: Arc<AllocatorRegistry>, large_alloc_size: usize) -> Self {
        assert!(large_alloc_size > 0);

        let inner = Arc::new(AllocatorInner {
            bytes_allocated: AtomicUsize::new(0),
            bytes_committed: AtomicUsize::new(0),
            state: Mutex::new(AllocatorState {
                reservations: SmallVec::new(),
                free: BTreeMap::new(),
                page_refs: HashMap::new(),
            }),
        });
        registry.register(Arc::downgrade(&inner));

        Self {
            inner,
            registry,
            large_alloc_size,
        }
    }

    /// Allocates `size` bytes of writable+executable memory.
    ///
    /// Returns `None` when the address space is exhausted or the registry's
    /// global cap has been reached; callers decide whether that is fatal by
    /// way of `effort`.
    ///
    /// # Panics
    ///
    /// Aborts the process if the allocation fails and `effort` is
    /// [`CompilationEffort::MustSucceed`].
    pub fn allocate(
        &self,
        size: usize,
        owner_tag: usize,
        effort: CompilationEffort,
    ) -> Option<ExecMemoryHandle> {
        assert!(size > 0);

        let handle = self.try_allocate(size, owner_tag);
        assert!(
            handle.is_some() || effort != CompilationEffort::MustSucceed,
            "failed to allocate {size} bytes of executable memory and the caller has no fallback",
        );
        handle
    }

    fn try_allocate(&self, size: usize, owner_tag: usize) -> Option<ExecMemoryHandle> {
        let size = round_usize_up_to(size, JIT_ALLOCATION_GRANULE);

        if self.registry.at_capacity() {
            tracing::warn!("executable memory cap reached, refusing to allocate {size} bytes");
            return None;
        }

        if let Some(range) = self.inner.allocate_within(size) {
            return Some(self.handle(range, owner_tag));
        }

        // The free list is exhausted; grow by a large chunk. The reservation
        // syscall runs with no locks held.
        let chunk = round_usize_up_to_host_pages(size.div_ceil(self.large_alloc_size) * self.large_alloc_size);
        let reservation = match PageReservation::reserve(chunk) {
            Ok(reservation) => reservation,
            Err(err) => {
                tracing::warn!("executable memory growth by {chunk} bytes failed: {err:#}");
                return None;
            }
        };

        let range = self.inner.adopt_and_allocate(reservation, size)?;
        Some(self.handle(range, owner_tag))
    }

    fn handle(&self, range: Range<usize>, owner_tag: usize) -> ExecMemoryHandle {
        ExecMemoryHandle(Arc::new(HandleInner {
            start: range.start,
            len: range.end - range.start,
            owner_tag,
            allocator: Arc::downgrade(&self.inner),
        }))
    }

    /// Sum of live handle sizes, after granule rounding.
    pub fn bytes_allocated(&self) -> usize {
        self.inner.bytes_allocated()
    }

    /// Sum of committed page bytes across this allocator's reservations.
    pub fn bytes_committed(&self) -> usize {
        self.inner.bytes_committed()
    }

    /// See [`AllocatorRegistry::under_memory_pressure`].
    pub fn under_memory_pressure(&self) -> bool {
        self.registry.under_memory_pressure()
    }

    /// See [`AllocatorRegistry::memory_pressure_multiplier`].
    pub fn memory_pressure_multiplier(&self, added_bytes: usize) -> f64 {
        self.registry.memory_pressure_multiplier(added_bytes)
    }

    /// Takes the allocator's lock. Queries on the returned guard observe a
    /// consistent snapshot of the allocation state.
    pub fn lock(&self) -> ExecAllocatorLock<'_> {
        ExecAllocatorLock {
            state: self.inner.state.lock().unwrap(),
        }
    }
}

impl fmt::Debug for ExecAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecAllocator")
            .field("bytes_allocated", &self.bytes_allocated())
            .field("bytes_committed", &self.bytes_committed())
            .finish_non_exhaustive()
    }
}

impl Drop for ExecAllocator {
    fn drop(&mut self) {
        self.registry.unregister(&self.inner);
    }
}

// ===== impl AllocatorInner =====

impl AllocatorInner {
    pub(crate) fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_committed(&self) -> usize {
        self.bytes_committed.load(Ordering::Relaxed)
    }

    pub(crate) fn is_valid_executable_memory(&self, addr: usize) -> bool {
        self.state.lock().unwrap().is_live(addr)
    }

    /// Attempts to carve `size` bytes out of the existing free space.
    fn allocate_within(&self, size: usize) -> Option<Range<usize>> {
        let mut state = self.state.lock().unwrap();
        let start = state.carve(size)?;
        self.commit_pages(&mut state, start..start + size);
        self.bytes_allocated.fetch_add(size, Ordering::Relaxed);
        Some(start..start + size)
    }

    /// Extends the free space with a freshly reserved chunk and carves
    /// `size` bytes out of it. Insertion and carve happen under one lock
    /// acquisition, so the carve cannot be raced away.
    fn adopt_and_allocate(
        &self,
        reservation: PageReservation,
        size: usize,
    ) -> Option<Range<usize>> {
        let mut state = self.state.lock().unwrap();

        tracing::trace!(
            "growing executable allocator by {} bytes at {:#x}",
            reservation.len(),
            reservation.base_addr(),
        );

        state.free_insert(reservation.base_addr(), reservation.len());
        state.reservations.push(reservation);

        let start = state
            .carve(size)
            .expect("freshly grown chunk cannot satisfy the allocation that grew it");
        self.commit_pages(&mut state, start..start + size);
        self.bytes_allocated.fetch_add(size, Ordering::Relaxed);
        Some(start..start + size)
    }

    /// Bumps the live-handle count of every page overlapping `range`,
    /// committing pages on their 0→1 transition.
    fn commit_pages(&self, state: &mut AllocatorState, range: Range<usize>) {
        let page_size = host_page_size();
        let mut newly_used: SmallVec<[usize; 8]> = SmallVec::new();

        for page in pages_of(&range, page_size) {
            let count = state.page_refs.entry(page).or_insert(0);
            *count += 1;
            if *count == 1 {
                newly_used.push(page);
            }
        }

        for page in newly_used {
            let reservation = state
                .reservation_containing(page)
                .expect("allocated page outside any reservation");
            let offset = page - reservation.base_addr();
            reservation
                .commit(
                    offset..offset + page_size,
                    Permissions::READ | Permissions::WRITE | Permissions::EXECUTE,
                )
                .expect("failed to commit executable pages");
            self.bytes_committed.fetch_add(page_size, Ordering::Relaxed);
        }
    }

    /// Returns a handle's range to the free space. Called from the handle's
    /// last-reference drop.
    fn release(&self, range: Range<usize>) {
        let page_size = host_page_size();
        let mut state = self.state.lock().unwrap();

        self.bytes_allocated
            .fetch_sub(range.end - range.start, Ordering::Relaxed);

        for page in pages_of(&range, page_size) {
            let count = state
                .page_refs
                .get_mut(&page)
                .expect("freed range touches a page with no live references");
            *count -= 1;
            if *count > 0 {
                continue;
            }
            state.page_refs.remove(&page);

            let reservation = state
                .reservation_containing(page)
                .expect("freed page outside any reservation");
            let offset = page - reservation.base_addr();
            match reservation.decommit(offset..offset + page_size) {
                Ok(()) => {
                    self.bytes_committed.fetch_sub(page_size, Ordering::Relaxed);
                }
                // Decommit is a best-effort release of physical pages; the
                // address range stays reserved either way.
                Err(err) => tracing::warn!("failed to decommit freed page: {err:#}"),
            }
        }

        state.free_insert(range.start, range.end - range.start);
    }
}

// ===== impl AllocatorState =====

impl AllocatorState {
    /// First-fit carve, in address order.
    fn carve(&mut self, size: usize) -> Option<usize> {
        let (&start, &len) = self.free.iter().find(|&(_, &len)| len >= size)?;
        self.free.remove(&start);
        if len > size {
            self.free.insert(start + size, len - size);
        }
        Some(start)
    }

    /// Inserts a free range, merging with adjacent free neighbours.
    fn free_insert(&mut self, start: usize, len: usize) {
        let mut start = start;
        let mut len = len;

        if let Some(&next_len) = self.free.get(&(start + len)) {
            self.free.remove(&(start + len));
            len += next_len;
        }

        if let Some((&prev_start, &prev_len)) = self.free.range(..start).next_back() {
            debug_assert!(prev_start + prev_len <= start, "overlapping free ranges");
            if prev_start + prev_len == start {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }

        self.free.insert(start, len);
    }

    fn reservation_containing(&self, addr: usize) -> Option<&PageReservation> {
        self.reservations
            .iter()
            .find(|reservation| reservation.contains(addr))
    }

    /// Whether `addr` lies inside a live (allocated, non-free) range.
    fn is_live(&self, addr: usize) -> bool {
        if self.reservation_containing(addr).is_none() {
            return false;
        }
        match self.free.range(..=addr).next_back() {
            Some((&start, &len)) => !(addr >= start && addr < start + len),
            None => true,
        }
    }
}

fn pages_of(range: &Range<usize>, page_size: usize) -> impl Iterator<Item = usize> + use<> {
    let first = range.start & !(page_size - 1);
    let last = (range.end - 1) & !(page_size - 1);
    (first..=last).step_by(page_size)
}

// ===== impl ExecMemoryHandle =====

impl ExecMemoryHandle {
    /// Base address of the range. The compiler writes machine code through
    /// this pointer.
    #[inline]
    pub fn as_non_null(&self) -> NonNull<u8> {
        NonNull::new(self.0.start as *mut u8).unwrap()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    #[inline]
    pub fn range(&self) -> Range<usize> {
        self.0.start..self.0.start + self.0.len
    }

    #[inline]
    pub fn owner_tag(&self) -> usize {
        self.0.owner_tag
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        // The allocator may already be gone; its reservations were released
        // unconditionally in that case and there is nothing left to return.
        if let Some(allocator) = self.allocator.upgrade() {
            allocator.release(self.start..self.start + self.len);
        }
    }
}

// ===== impl ExecAllocatorLock =====

impl ExecAllocatorLock<'_> {
    /// Returns whether `addr` points into a live allocation. Does not
    /// allocate, so it is callable from crash/signal handlers.
    pub fn is_valid_executable_memory(&self, addr: usize) -> bool {
        self.state.is_live(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_allocator() -> ExecAllocator {
        ExecAllocator::new(AllocatorRegistry::new(None))
    }

    #[test]
    fn bytes_allocated_tracks_live_handles() {
        let allocator = fresh_allocator();
        assert_eq!(allocator.bytes_allocated(), 0);

        let a = allocator.allocate(64, 0, CompilationEffort::CanFail).unwrap();
        let b = allocator.allocate(128, 0, CompilationEffort::CanFail).unwrap();
        assert_eq!(allocator.bytes_allocated(), 192);

        drop(a);
        assert_eq!(allocator.bytes_allocated(), 128);
        drop(b);
        assert_eq!(allocator.bytes_allocated(), 0);
    }

    #[test]
    fn sizes_round_up_to_the_granule() {
        let allocator = fresh_allocator();
        let handle = allocator.allocate(10, 0, CompilationEffort::CanFail).unwrap();
        assert_eq!(handle.len(), JIT_ALLOCATION_GRANULE);
        assert_eq!(allocator.bytes_allocated(), JIT_ALLOCATION_GRANULE);
    }

    #[test]
    fn handles_never_alias() {
        let allocator = fresh_allocator();
        let a = allocator.allocate(96, 0, CompilationEffort::CanFail).unwrap();
        let b = allocator.allocate(96, 0, CompilationEffort::CanFail).unwrap();
        let (ra, rb) = (a.range(), b.range());
        assert!(ra.end <= rb.start || rb.end <= ra.start);
    }

    #[test]
    fn freed_ranges_are_reused() {
        let allocator = fresh_allocator();
        let first = allocator.allocate(256, 0, CompilationEffort::CanFail).unwrap();
        let addr = first.range().start;
        drop(first);

        let second = allocator.allocate(256, 0, CompilationEffort::CanFail).unwrap();
        assert_eq!(second.range().start, addr);
    }

    #[test]
    fn committed_bytes_drop_back_to_zero() {
        let allocator = fresh_allocator();
        let handle = allocator.allocate(64, 0, CompilationEffort::CanFail).unwrap();
        assert!(allocator.bytes_committed() >= host_page_size());
        drop(handle);
        assert_eq!(allocator.bytes_committed(), 0);
    }

    #[test]
    fn allocated_memory_is_writable() {
        let allocator = fresh_allocator();
        let handle = allocator.allocate(64, 0, CompilationEffort::CanFail).unwrap();

        unsafe {
            let ptr = handle.as_non_null().as_ptr();
            for i in 0..handle.len() {
                ptr.add(i).write(0x90);
            }
            assert_eq!(ptr.read(), 0x90);
        }
    }

    #[test]
    fn global_cap_fails_allocations_once_reached() {
        let registry = AllocatorRegistry::new(Some(JIT_ALLOCATION_GRANULE));
        let allocator = ExecAllocator::new(registry.clone());

        // Below the cap: must succeed.
        let handle = allocator.allocate(JIT_ALLOCATION_GRANULE, 0, CompilationEffort::CanFail);
        let handle = handle.unwrap();
        assert_eq!(registry.aggregate_bytes_allocated(), JIT_ALLOCATION_GRANULE);

        // At the cap: every allocation fails, even tiny ones the free list
        // could satisfy.
        assert!(allocator.allocate(1, 0, CompilationEffort::CanFail).is_none());
        assert!(allocator.allocate(1, 0, CompilationEffort::CanFail).is_none());

        // Releasing drops aggregate usage below the cap again.
        drop(handle);
        assert!(allocator.allocate(1, 0, CompilationEffort::CanFail).is_some());
    }

    #[test]
    fn cap_accounts_across_allocators() {
        let registry = AllocatorRegistry::new(Some(2 * JIT_ALLOCATION_GRANULE));
        let a = ExecAllocator::new(registry.clone());
        let b = ExecAllocator::new(registry.clone());

        let _x = a.allocate(JIT_ALLOCATION_GRANULE, 0, CompilationEffort::CanFail).unwrap();
        let _y = b.allocate(JIT_ALLOCATION_GRANULE, 0, CompilationEffort::CanFail).unwrap();
        assert_eq!(registry.aggregate_bytes_allocated(), 2 * JIT_ALLOCATION_GRANULE);

        assert!(a.allocate(1, 0, CompilationEffort::CanFail).is_none());
        assert!(b.allocate(1, 0, CompilationEffort::CanFail).is_none());
    }

    #[test]
    fn valid_executable_memory_queries() {
        let allocator = fresh_allocator();
        let handle = allocator.allocate(64, 0, CompilationEffort::CanFail).unwrap();
        let addr = handle.range().start;

        assert!(allocator.lock().is_valid_executable_memory(addr));
        assert!(allocator.lock().is_valid_executable_memory(addr + 63));
        assert!(!allocator.lock().is_valid_executable_memory(0x10));

        drop(handle);
        assert!(!allocator.lock().is_valid_executable_memory(addr));
    }

    #[test]
    fn registry_wide_validity_query() {
        let registry = AllocatorRegistry::new(None);
        let allocator = ExecAllocator::new(registry.clone());
        let handle = allocator.allocate(64, 0, CompilationEffort::CanFail).unwrap();

        assert!(registry.is_valid_executable_memory(handle.range().start));
        drop(allocator);
        assert!(!registry.is_valid_executable_memory(handle.range().start));
    }

    #[test]
    fn handle_may_outlive_its_allocator() {
        let allocator = fresh_allocator();
        let handle = allocator.allocate(64, 0, CompilationEffort::CanFail).unwrap();
        drop(allocator);
        // The range is gone; dropping the orphaned handle must be a no-op.
        drop(handle);
    }

    #[test]
    fn owner_tags_are_preserved() {
        let allocator = fresh_allocator();
        let handle = allocator.allocate(64, 0xbeef, CompilationEffort::CanFail).unwrap();
        assert_eq!(handle.owner_tag(), 0xbeef);
    }

    #[test]
    fn registry_counts_only_live_allocators() {
        let registry = AllocatorRegistry::new(None);
        let a = ExecAllocator::new(registry.clone());
        let _handle = a.allocate(64, 0, CompilationEffort::CanFail).unwrap();
        assert_eq!(registry.aggregate_bytes_allocated(), 64);

        drop(a);
        assert_eq!(registry.aggregate_bytes_allocated(), 0);
    }
}
