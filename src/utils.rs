// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// Helper macro to generate accessors for an enum.
macro_rules! enum_accessors {
    (@$bind:ident, $variant:ident, $ty:ty, $is:ident, $get:ident, $unwrap:ident, $cvt:expr) => {
        ///  Returns true when the enum is the correct variant.
        pub fn $is(&self) -> bool {
            matches!(self, Self::$variant(_))
        }

        ///  Returns the variant's value, returning None if it is not the correct type.
        #[inline]
        pub fn $get(&self) -> Option<$ty> {
            if let Self::$variant($bind) = self {
                Some($cvt)
            } else {
                None
            }
        }

        /// Returns the variant's value, panicking if it is not the correct type.
        ///
        /// # Panics
        ///
        /// Panics if `self` is not of the right type.
        #[inline]
        pub fn $unwrap(&self) -> $ty {
            self.$get().expect(concat!("expected ", stringify!($ty)))
        }
    };
    ($bind:ident $(($variant:ident($ty:ty) $is:ident $get:ident $unwrap:ident $cvt:expr))*) => ($(enum_accessors!{@$bind, $variant, $ty, $is, $get, $unwrap, $cvt})*)
}

/// Like `enum_accessors!`, but generated methods take ownership of `self`.
macro_rules! owned_enum_accessors {
    ($bind:ident $(($variant:ident($ty:ty) $get:ident $cvt:expr))*) => ($(
        /// Attempt to access the underlying value, returning
        /// `None` if it is not the correct type.
        #[inline]
        pub fn $get(self) -> Option<$ty> {
            if let Self::$variant($bind) = self {
                Some($cvt)
            } else {
                None
            }
        }
    )*)
}

pub(crate) use {enum_accessors, owned_enum_accessors};

/// Returns the host operating system's page size, in bytes.
#[inline]
pub fn host_page_size() -> usize {
    rustix::param::page_size()
}

/// Rounds `bytes` up to the next multiple of the host page size.
///
/// # Panics
///
/// Panics if the rounded value would overflow `usize`.
pub fn round_usize_up_to_host_pages(bytes: usize) -> usize {
    let page_size = host_page_size();
    debug_assert!(page_size.is_power_of_two());
    bytes
        .checked_add(page_size - 1)
        .expect("byte length overflows when rounded to page size")
        & !(page_size - 1)
}

/// Rounds `bytes` up to the next multiple of `align`, which must be a power
/// of two.
#[inline]
pub fn round_usize_up_to(bytes: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    bytes
        .checked_add(align - 1)
        .expect("byte length overflows when rounded up")
        & !(align - 1)
}

#[inline]
pub fn usize_is_aligned_to_host_pages(value: usize) -> bool {
    value % host_page_size() == 0
}
