//! # Internal Macros
//!
//! ## zerocopy_accessors!
//!
//! Generates getter and setter pairs for zerocopy struct fields stored as
//! little-endian wrapper types (`U16`, `U32`, `U64`). Every on-disk struct
//! in this crate (page header, branch/leaf elements, meta, bucket header)
//! keeps its fields in wire order and exposes them through these accessors:
//!
//! ```ignore
//! #[repr(C)]
//! struct PageHeader {
//!     id: U64,
//!     flags: U16,
//! }
//!
//! impl PageHeader {
//!     zerocopy_accessors! {
//!         id: u64,
//!         flags: u16,
//!     }
//! }
//!
//! // Generates:
//! // pub fn id(&self) -> u64 { self.id.get() }
//! // pub fn set_id(&mut self, val: u64) { self.id = U64::new(val); }
//! // ...
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
