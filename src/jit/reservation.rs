// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ops::Range;
use core::ptr::NonNull;
use core::{fmt, ptr, slice};

use anyhow::Context;
use bitflags::bitflags;
use cfg_if::cfg_if;
use rustix::mm::MprotectFlags;

use crate::utils::usize_is_aligned_to_host_pages;

bitflags! {
    #[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct Permissions: u8 {
        /// Allow reads from the memory region
        const READ = 1 << 0;
        /// Allow writes to the memory region
        const WRITE = 1 << 1;
        /// Allow code execution from the memory region
        const EXECUTE = 1 << 2;
    }
}

impl From<Permissions> for MprotectFlags {
    fn from(permissions: Permissions) -> Self {
        let mut flags = MprotectFlags::empty();
        flags.set(MprotectFlags::READ, permissions.contains(Permissions::READ));
        flags.set(
            MprotectFlags::WRITE,
            permissions.contains(Permissions::WRITE),
        );
        flags.set(
            MprotectFlags::EXEC,
            permissions.contains(Permissions::EXECUTE),
        );
        flags
    }
}

/// A page-aligned, execute-capable region of reserved virtual memory.
///
/// Reserving only claims address space; individual page ranges are made
/// usable through [`commit`][Self::commit] and returned to the OS through
/// [`decommit`][Self::decommit]. The whole region is released exactly once,
/// on drop, which is why this type is neither `Clone` nor `Copy`: the owning
/// allocator keeps each reservation in exactly one place.
pub struct PageReservation {
    memory: NonNull<[u8]>,
}

// Safety: the reservation owns its mapping exclusively; all access to the
// underlying pages goes through raw pointers handed out by the allocator,
// which is responsible for synchronization.
unsafe impl Send for PageReservation {}
// Safety: see above
unsafe impl Sync for PageReservation {}

impl PageReservation {
    /// Reserves `len` bytes of address space without committing any pages.
    ///
    /// # Errors
    ///
    /// Returns an error when the address space is exhausted.
    pub fn reserve(len: usize) -> crate::Result<Self> {
        assert!(len > 0);
        let len = crate::utils::round_usize_up_to_host_pages(len);

        cfg_if! {
            if #[cfg(target_os = "linux")] {
                let flags = rustix::mm::MapFlags::PRIVATE | rustix::mm::MapFlags::NORESERVE;
            } else {
                let flags = rustix::mm::MapFlags::PRIVATE;
            }
        }

        // Safety: we pass a nullptr so the kernel will pick the placement for us.
        let ptr = unsafe {
            rustix::mm::mmap_anonymous(ptr::null_mut(), len, rustix::mm::ProtFlags::empty(), flags)
                .context("failed to reserve address space")?
        };

        // Safety: the previous call ensures the ptr is valid and u8 doesn't
        // have any alignment/validity requirements.
        let memory = unsafe { slice::from_raw_parts_mut(ptr.cast(), len) };
        let memory = NonNull::new(memory).unwrap();

        tracing::trace!(
            "reserved {len} bytes of executable address space at {:?}",
            memory.as_ptr()
        );

        Ok(Self { memory })
    }

    #[inline]
    pub fn base_addr(&self) -> usize {
        self.memory.as_ptr().cast::<u8>() as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.memory.len() == 0
    }

    /// Returns whether `addr` falls within this reservation.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base_addr();
        addr >= base && addr < base + self.len()
    }

    /// Commits the page range `range` (offsets into this reservation) with
    /// the given permissions.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS rejects the protection change.
    pub fn commit(&self, range: Range<usize>, permissions: Permissions) -> crate::Result<()> {
        let len = self.checked_page_range(&range);

        // Safety: the range assertions above keep the pointer inside our own
        // mapping.
        unsafe {
            rustix::mm::mprotect(
                self.memory.as_ptr().cast::<u8>().add(range.start).cast(),
                len,
                permissions.into(),
            )
            .context("failed to commit executable pages")?;
        }

        Ok(())
    }

    /// Returns the physical pages behind `range` (offsets into this
    /// reservation) to the OS while keeping the address range reserved.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS rejects the protection change.
    pub fn decommit(&self, range: Range<usize>) -> crate::Result<()> {
        let len = self.checked_page_range(&range);
        let ptr = self.memory.as_ptr().cast::<u8>();

        // Safety: the range assertions keep the pointer inside our own mapping.
        unsafe {
            #[cfg(target_os = "linux")]
            rustix::mm::madvise(
                ptr.add(range.start).cast(),
                len,
                rustix::mm::Advice::LinuxDontNeed,
            )
            .context("failed to decommit executable pages")?;

            rustix::mm::mprotect(
                ptr.add(range.start).cast(),
                len,
                rustix::mm::MprotectFlags::empty(),
            )
            .context("failed to decommit executable pages")?;
        }

        Ok(())
    }

    fn checked_page_range(&self, range: &Range<usize>) -> usize {
        assert!(range.start <= self.len());
        assert!(range.end <= self.len());
        assert!(
            usize_is_aligned_to_host_pages(range.start),
            "changing of protections isn't page-aligned",
        );
        range.end.checked_sub(range.start).unwrap()
    }
}

impl fmt::Debug for PageReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageReservation")
            .field("base", &self.memory.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for PageReservation {
    fn drop(&mut self) {
        // Safety: the allocator has to ensure no references to code in this
        // reservation remain after this.
        unsafe {
            let ptr = self.memory.as_ptr().cast();
            let len = self.memory.len();
            if len == 0 {
                return;
            }
            rustix::mm::munmap(ptr, len).expect("munmap failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::host_page_size;

    #[test]
    fn reserve_commit_write_decommit() {
        let page_size = host_page_size();
        let reservation = PageReservation::reserve(4 * page_size).unwrap();
        assert_eq!(reservation.len(), 4 * page_size);

        reservation
            .commit(
                0..page_size,
                Permissions::READ | Permissions::WRITE | Permissions::EXECUTE,
            )
            .unwrap();

        // Committed pages must be writable.
        unsafe {
            let ptr = reservation.base_addr() as *mut u8;
            ptr.write(0xc3);
            assert_eq!(ptr.read(), 0xc3);
        }

        reservation.decommit(0..page_size).unwrap();
    }

    #[test]
    fn contains() {
        let page_size = host_page_size();
        let reservation = PageReservation::reserve(page_size).unwrap();
        let base = reservation.base_addr();
        assert!(reservation.contains(base));
        assert!(reservation.contains(base + page_size - 1));
        assert!(!reservation.contains(base + page_size));
    }
}
