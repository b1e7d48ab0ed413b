//! # Internal Macros
//!
//! Accessor generation for on-disk structs whose fields use zerocopy's
//! little-endian wrapper types. The catalog record keeps signed offsets and a
//! floating-point padding factor on disk, so the macro covers the signed and
//! float wrappers in addition to the unsigned ones.
//!
//! ```ignore
//! impl NsRecord {
//!     le_accessors! {
//!         data_size: i64,
//!         n_indexes: i32,
//!         padding_factor: f64,
//!     }
//! }
//! // expands to data_size()/set_data_size(), n_indexes()/set_n_indexes(), ...
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! le_accessors {
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
    (@impl $field:ident, i32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> i32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: i32) {
                self.$field = ::zerocopy::little_endian::I32::new(val);
            }
        }
    };
    (@impl $field:ident, i64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> i64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: i64) {
                self.$field = ::zerocopy::little_endian::I64::new(val);
            }
        }
    };
    (@impl $field:ident, f64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> f64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: f64) {
                self.$field = ::zerocopy::little_endian::F64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::le_accessors!(@impl $field, $ty);
        )*
    };
}
