//! Raw field access on shadow objects.
//!
//! Callers guarantee `op` points at a live shadow with at least the prefix
//! the accessor touches.

use std::ffi::c_void;

use crate::ffi::{Py_ssize_t, PyObject, PyTupleObject, PyTypeObject, PyVarObject, SLOT_SIZE};

#[inline]
pub(crate) unsafe fn refcnt(op: *mut PyObject) -> Py_ssize_t {
    unsafe { (*op).ob_refcnt }
}

#[inline]
pub(crate) unsafe fn type_of(op: *mut PyObject) -> *mut PyTypeObject {
    unsafe { (*op).ob_type }
}

#[inline]
pub(crate) unsafe fn ob_size(op: *mut PyObject) -> Py_ssize_t {
    unsafe { (*op.cast::<PyVarObject>()).ob_size }
}

#[inline]
pub(crate) unsafe fn set_ob_size(op: *mut PyObject, size: Py_ssize_t) {
    unsafe { (*op.cast::<PyVarObject>()).ob_size = size };
}

/// Address of item slot `index`. No bounds check.
#[inline]
pub(crate) unsafe fn item_slot(op: *mut PyObject, index: Py_ssize_t) -> *mut *mut PyObject {
    unsafe {
        let items = (&raw mut (*op.cast::<PyTupleObject>()).ob_item).cast::<*mut PyObject>();
        items.offset(index)
    }
}

#[inline]
pub(crate) unsafe fn item(op: *mut PyObject, index: Py_ssize_t) -> *mut PyObject {
    unsafe { *item_slot(op, index) }
}

/// Snapshot of every item slot of a tuple shadow.
pub(crate) unsafe fn items(op: *mut PyObject) -> Vec<*mut PyObject> {
    unsafe {
        let n = ob_size(op).max(0);
        (0..n).map(|i| item(op, i)).collect()
    }
}

fn round_up_to_word(size: usize) -> usize {
    size.div_ceil(SLOT_SIZE) * SLOT_SIZE
}

/// Bytes needed for an instance of `ty` with `nitems` variable items:
/// `tp_basicsize + nitems * tp_itemsize`, word aligned.
pub(crate) unsafe fn instance_size(ty: *mut PyTypeObject, nitems: usize) -> usize {
    unsafe {
        let basic = (*ty).tp_basicsize.max(0) as usize;
        let itemsize = (*ty).tp_itemsize.max(0) as usize;
        round_up_to_word(basic + nitems * itemsize)
    }
}

/// Byte offset of the subclass extension region: directly after the item
/// array for variable-size layouts, after the built-in prefix otherwise.
pub(crate) unsafe fn extension_offset(
    ty: *mut PyTypeObject,
    prefix_size: usize,
    nitems: usize,
) -> usize {
    unsafe {
        let itemsize = (*ty).tp_itemsize.max(0) as usize;
        prefix_size + nitems * itemsize
    }
}

/// Where a member declared at `declared_offset` actually lives. Offsets
/// inside the built-in prefix are used as-is; offsets past it are moved
/// into the extension region.
pub(crate) fn relocate_member_offset(
    declared_offset: usize,
    prefix_size: usize,
    extension_offset: usize,
) -> usize {
    if declared_offset < prefix_size {
        declared_offset
    } else {
        extension_offset + (declared_offset - prefix_size)
    }
}

#[inline]
pub(crate) unsafe fn byte_offset(op: *mut PyObject, offset: usize) -> *mut c_void {
    unsafe { op.cast::<u8>().add(offset).cast::<c_void>() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::TUPLE_HEADER_SIZE;

    const TUPLE_PREFIX_SIZE: usize = TUPLE_HEADER_SIZE;

    #[test]
    fn extension_fields_follow_items() {
        // A tuple subclass with one 8-byte field declared at the end of its
        // struct: basicsize 32, so the field is declared at offset 24.
        let ext = 24 + 3 * SLOT_SIZE;
        assert_eq!(relocate_member_offset(24, TUPLE_PREFIX_SIZE, ext), 48);
        assert_eq!(relocate_member_offset(32, TUPLE_PREFIX_SIZE, ext), 56);
        assert_eq!(relocate_member_offset(16, TUPLE_PREFIX_SIZE, ext), 16);
    }

    #[test]
    fn sizes_round_to_words() {
        assert_eq!(round_up_to_word(25), 32);
        assert_eq!(round_up_to_word(24), 24);
        assert_eq!(round_up_to_word(0), 0);
    }
}
