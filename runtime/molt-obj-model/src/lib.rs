//! Core object representation for Molt.
//! Uses NaN-boxing to represent primitives and heap references in 64 bits.
//! Heap values live in a generation-checked [`Heap`] that reclaims them by
//! tracing from host roots.

mod heap;
pub mod ops;
mod types;

pub use heap::{CollectStats, Heap, HeapEntry, HeapError, HeapRef, ObjectKind};
pub use types::{
    FIRST_HEAP_TYPE_ID, TYPE_ID_BOOL, TYPE_ID_DICT, TYPE_ID_FLOAT, TYPE_ID_INT, TYPE_ID_LIST,
    TYPE_ID_NONE, TYPE_ID_OBJECT, TYPE_ID_STRING, TYPE_ID_TUPLE, TYPE_ID_TYPE, builtin_type_name,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MoltObject(u64);

const QNAN: u64 = 0x7ff8_0000_0000_0000;
const TAG_INT: u64 = 0x0001_0000_0000_0000;
const TAG_BOOL: u64 = 0x0002_0000_0000_0000;
const TAG_NONE: u64 = 0x0003_0000_0000_0000;
const TAG_REF: u64 = 0x0004_0000_0000_0000;
const TAG_PENDING: u64 = 0x0005_0000_0000_0000;
const TAG_MASK: u64 = 0x0007_0000_0000_0000;
const PAYLOAD_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;
const INT_SIGN_BIT: u64 = 1 << 46;
const INT_WIDTH: u64 = 47;
const INT_MASK: u64 = (1u64 << INT_WIDTH) - 1;
// Any NaN is re-encoded as a signalling pattern outside the QNAN tag space.
const CANONICAL_NAN: u64 = 0x7ff4_0000_0000_0000;

pub const INT_MIN: i64 = -(1i64 << (INT_WIDTH - 1));
pub const INT_MAX: i64 = (1i64 << (INT_WIDTH - 1)) - 1;

impl MoltObject {
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn from_float(f: f64) -> Self {
        if f.is_nan() {
            return Self(CANONICAL_NAN);
        }
        Self(f.to_bits())
    }

    /// Values outside [`INT_MIN`, `INT_MAX`] are truncated to 47 bits.
    pub fn from_int(i: i64) -> Self {
        let val = (i as u64) & INT_MASK;
        Self(QNAN | TAG_INT | val)
    }

    pub fn from_bool(b: bool) -> Self {
        let val = if b { 1 } else { 0 };
        Self(QNAN | TAG_BOOL | val)
    }

    pub fn none() -> Self {
        Self(QNAN | TAG_NONE)
    }

    pub fn pending() -> Self {
        Self(QNAN | TAG_PENDING)
    }

    pub fn from_ref(r: HeapRef) -> Self {
        Self(QNAN | TAG_REF | (r.to_bits() & PAYLOAD_MASK))
    }

    pub fn is_float(&self) -> bool {
        (self.0 & QNAN) != QNAN
    }

    pub fn as_float(&self) -> Option<f64> {
        if self.is_float() {
            Some(f64::from_bits(self.0))
        } else {
            None
        }
    }

    pub fn is_int(&self) -> bool {
        (self.0 & (QNAN | TAG_MASK)) == (QNAN | TAG_INT)
    }

    pub fn is_bool(&self) -> bool {
        (self.0 & (QNAN | TAG_MASK)) == (QNAN | TAG_BOOL)
    }

    pub fn as_bool(&self) -> Option<bool> {
        if self.is_bool() {
            Some((self.0 & 0x1) == 1)
        } else {
            None
        }
    }

    pub fn is_none(&self) -> bool {
        (self.0 & (QNAN | TAG_MASK)) == (QNAN | TAG_NONE)
    }

    pub fn is_pending(&self) -> bool {
        (self.0 & (QNAN | TAG_MASK)) == (QNAN | TAG_PENDING)
    }

    pub fn is_ref(&self) -> bool {
        (self.0 & (QNAN | TAG_MASK)) == (QNAN | TAG_REF)
    }

    pub fn as_heap_ref(&self) -> Option<HeapRef> {
        if self.is_ref() {
            HeapRef::from_bits(self.0 & PAYLOAD_MASK)
        } else {
            None
        }
    }

    /// True for values that carry no heap identity.
    pub fn is_immediate(&self) -> bool {
        !self.is_ref() && !self.is_pending()
    }

    pub fn as_int(&self) -> Option<i64> {
        if self.is_int() {
            Some(self.as_int_unchecked())
        } else {
            None
        }
    }

    pub fn as_int_unchecked(&self) -> i64 {
        let val = self.0 & INT_MASK;
        if (val & INT_SIGN_BIT) != 0 {
            (val as i64) - ((1u64 << INT_WIDTH) as i64)
        } else {
            val as i64
        }
    }

    /// Integer view used by numeric comparisons: bools count as 0/1.
    pub fn as_index(&self) -> Option<i64> {
        self.as_int()
            .or_else(|| self.as_bool().map(|b| if b { 1 } else { 0 }))
    }
}
