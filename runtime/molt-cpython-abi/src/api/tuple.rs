//! `PyTuple_*` entry points.
//!
//! Checked functions validate their arguments and report failures through
//! the pending exception. The unchecked ones (`PyTuple_GET_SIZE`,
//! `PyTuple_GET_ITEM`, `PyTuple_SET_ITEM`) trust the caller, as CPython's
//! macros do.

use libc::c_int;

use crate::errors::{BAD_INTERNAL_CALL, ExceptionKind, raise_exception, raise_pending};
use crate::ffi::{Py_ssize_t, PyObject, PyTypeObject};
use crate::layout;
use crate::refcount::{Py_DecRef, Py_IncRef};
use crate::runtime::with_runtime;
use crate::slots::resolve_alloc;
use crate::types::{PyTuple_Type, is_subtype, type_name};

unsafe fn tuple_check(op: *mut PyObject) -> bool {
    !op.is_null() && unsafe { is_subtype(layout::type_of(op), PyTuple_Type.as_ptr()) }
}

/// New exact tuple with `size` NULL slots, still in its construction window.
///
/// # Safety
/// Always safe to call; `unsafe` only for the C ABI.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyTuple_New(size: Py_ssize_t) -> *mut PyObject {
    if size < 0 {
        return raise_exception(ExceptionKind::SystemError, BAD_INTERNAL_CALL);
    }
    let ty = PyTuple_Type.as_ptr();
    unsafe { resolve_alloc(ty)(ty, size) }
}

/// # Safety
/// `op` must be NULL or a live object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyTuple_Size(op: *mut PyObject) -> Py_ssize_t {
    crate::with_gil_entry!(_py, {
        if !unsafe { tuple_check(op) } {
            return raise_exception(ExceptionKind::SystemError, BAD_INTERNAL_CALL);
        }
        unsafe { layout::ob_size(op) }
    })
}

/// Reads `ob_size` with no type check.
///
/// # Safety
/// `op` must be a live object with a variable-size header.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyTuple_GET_SIZE(op: *mut PyObject) -> Py_ssize_t {
    unsafe { layout::ob_size(op) }
}

/// Borrowed reference to item `index`. Negative indices are out of range.
///
/// # Safety
/// `op` must be NULL or a live object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyTuple_GetItem(op: *mut PyObject, index: Py_ssize_t) -> *mut PyObject {
    crate::with_gil_entry!(_py, {
        if !unsafe { tuple_check(op) } {
            return raise_exception(ExceptionKind::SystemError, BAD_INTERNAL_CALL);
        }
        if index < 0 || index >= unsafe { layout::ob_size(op) } {
            return raise_exception(ExceptionKind::IndexError, "tuple index out of range");
        }
        unsafe { layout::item(op, index) }
    })
}

/// # Safety
/// `op` must be a tuple and `index` in range.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyTuple_GET_ITEM(op: *mut PyObject, index: Py_ssize_t) -> *mut PyObject {
    unsafe { layout::item(op, index) }
}

/// Stores `value` (stolen) at `index` and releases the previous occupant.
/// On failure the tuple is untouched and `value` is released.
///
/// Published tuples are not protected; mutating one that other code can
/// see is the caller's responsibility, as in CPython.
///
/// # Safety
/// `op` must be NULL or a live object; `value` NULL or owned by the caller.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyTuple_SetItem(
    op: *mut PyObject,
    index: Py_ssize_t,
    value: *mut PyObject,
) -> c_int {
    crate::with_gil_entry!(_py, {
        if !unsafe { tuple_check(op) } {
            unsafe { Py_DecRef(value) };
            return raise_exception(ExceptionKind::SystemError, BAD_INTERNAL_CALL);
        }
        if index < 0 || index >= unsafe { layout::ob_size(op) } {
            unsafe { Py_DecRef(value) };
            return raise_exception(ExceptionKind::IndexError, "tuple assignment index out of range");
        }
        let old = unsafe {
            let slot = layout::item_slot(op, index);
            std::mem::replace(&mut *slot, value)
        };
        with_runtime(_py, |rt| rt.write_through(op, index as usize, value));
        unsafe { Py_DecRef(old) };
        0
    })
}

/// Raw slot store for filling a freshly created tuple: no bounds check and
/// the previous occupant is not released.
///
/// # Safety
/// `op` must be a tuple and `index` in range.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyTuple_SET_ITEM(op: *mut PyObject, index: Py_ssize_t, value: *mut PyObject) {
    unsafe { *layout::item_slot(op, index) = value };
    crate::with_gil_entry!(_py, {
        with_runtime(_py, |rt| rt.write_through(op, index as usize, value));
    })
}

/// New exact tuple of items `[low, high)`, with both bounds clamped into
/// `[0, size]`.
///
/// # Safety
/// `op` must be NULL or a live object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyTuple_GetSlice(
    op: *mut PyObject,
    low: Py_ssize_t,
    high: Py_ssize_t,
) -> *mut PyObject {
    crate::with_gil_entry!(_py, {
        if !unsafe { tuple_check(op) } {
            return raise_exception(ExceptionKind::SystemError, BAD_INTERNAL_CALL);
        }
        let size = unsafe { layout::ob_size(op) };
        let low = low.clamp(0, size);
        let high = high.clamp(low, size);
        let items: Vec<*mut PyObject> = (low..high).map(|i| unsafe { layout::item(op, i) }).collect();
        unsafe { fill_new_tuple(&items) }
    })
}

unsafe fn fill_new_tuple(items: &[*mut PyObject]) -> *mut PyObject {
    unsafe {
        let result = PyTuple_New(items.len() as Py_ssize_t);
        if result.is_null() {
            return result;
        }
        for (i, item) in items.iter().enumerate() {
            Py_IncRef(*item);
            PyTuple_SET_ITEM(result, i as Py_ssize_t, *item);
        }
        result
    }
}

/// Array form of `PyTuple_Pack`; the tuple takes its own reference to each
/// item.
///
/// # Safety
/// `items` must point at `n` live objects.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _molt_tuple_pack_array(
    n: Py_ssize_t,
    items: *const *mut PyObject,
) -> *mut PyObject {
    if n < 0 || (n > 0 && items.is_null()) {
        return raise_exception(ExceptionKind::SystemError, BAD_INTERNAL_CALL);
    }
    crate::with_gil_entry!(_py, {
        let items = if n == 0 {
            &[][..]
        } else {
            unsafe { std::slice::from_raw_parts(items, n as usize) }
        };
        unsafe { fill_new_tuple(items) }
    })
}

/// # Safety
/// `op` must be a live object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyTuple_Check(op: *mut PyObject) -> c_int {
    unsafe { tuple_check(op) as c_int }
}

/// # Safety
/// `op` must be a live object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyTuple_CheckExact(op: *mut PyObject) -> c_int {
    (!op.is_null() && unsafe { layout::type_of(op) } == PyTuple_Type.as_ptr()) as c_int
}

/// `tp_new` of the built-in tuple type: `tuple()` or `tuple(iterable)`.
/// Allocation goes through the resolved `tp_alloc` of `ty`, so a subclass
/// forwarding here gets an instance with its own layout.
pub(crate) unsafe extern "C" fn tuple_new(
    ty: *mut PyTypeObject,
    args: *mut PyObject,
    kwargs: *mut PyObject,
) -> *mut PyObject {
    crate::with_gil_entry!(_py, {
        if !kwargs.is_null() && unsafe { layout::ob_size(kwargs) } > 0 {
            return raise_exception(ExceptionKind::TypeError, "tuple() takes no keyword arguments");
        }
        if !unsafe { tuple_check(args) } {
            return raise_exception(ExceptionKind::SystemError, BAD_INTERNAL_CALL);
        }
        let nargs = unsafe { layout::ob_size(args) };
        if nargs > 1 {
            return raise_exception(
                ExceptionKind::TypeError,
                &format!("tuple expected at most 1 argument, got {nargs}"),
            );
        }
        let source = if nargs == 0 {
            Vec::new()
        } else {
            let iterable = unsafe { layout::item(args, 0) };
            if unsafe { tuple_check(iterable) } {
                unsafe { layout::items(iterable) }
            } else {
                match with_runtime(_py, |rt| rt.sequence_items(iterable)) {
                    Ok(items) => items,
                    Err(exc) => return raise_pending(exc),
                }
            }
        };
        let result = unsafe { resolve_alloc(ty)(ty, source.len() as Py_ssize_t) };
        if result.is_null() {
            return result;
        }
        crate::config::capi_trace!(
            "tuple_new '{}' with {} items",
            unsafe { type_name(ty) },
            source.len()
        );
        for (i, item) in source.into_iter().enumerate() {
            unsafe {
                Py_IncRef(item);
                PyTuple_SET_ITEM(result, i as Py_ssize_t, item);
            }
        }
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host;
    use crate::refcount::Py_REFCNT;
    use molt_obj_model::MoltObject;

    #[test]
    fn new_tuple_starts_with_null_slots() {
        let _guard = crate::TEST_MUTEX.lock();
        unsafe {
            let t = PyTuple_New(2);
            assert!(!t.is_null());
            assert_eq!(PyTuple_Size(t), 2);
            assert!(PyTuple_GetItem(t, 0).is_null());
            assert!(crate::errors::take_exception().is_none());
            assert_eq!(Py_REFCNT(t), 1);
            Py_DecRef(t);
        }
        host::collect();
    }

    #[test]
    fn negative_size_is_a_system_error() {
        let _guard = crate::TEST_MUTEX.lock();
        assert!(unsafe { PyTuple_New(-1) }.is_null());
        let exc = crate::errors::take_exception().unwrap();
        assert_eq!(exc.kind, ExceptionKind::SystemError);
        assert_eq!(exc.message, BAD_INTERNAL_CALL);
    }

    #[test]
    fn raw_slot_store_reaches_the_host_on_publication() {
        let _guard = crate::TEST_MUTEX.lock();
        let seven = host::to_native(MoltObject::from_int(7)).unwrap();
        unsafe {
            let t = PyTuple_New(1);
            // A direct memory write, as the C macro does.
            *layout::item_slot(t, 0) = seven;
            let value = host::from_native_steal(t).unwrap();
            let items = host::with_heap(|heap| heap.tuple_items(value).map(<[_]>::to_vec)).unwrap();
            assert_eq!(items, vec![MoltObject::from_int(7)]);
            host::release(value).unwrap();
        }
        host::collect();
    }

    #[test]
    fn checked_calls_reject_non_tuples() {
        let _guard = crate::TEST_MUTEX.lock();
        let list = host::new_list(&[MoltObject::from_int(1)]);
        let op = host::to_native(list).unwrap();
        unsafe {
            assert_eq!(PyTuple_Size(op), -1);
            assert_eq!(crate::errors::take_exception().unwrap().message, BAD_INTERNAL_CALL);
            assert!(PyTuple_GetSlice(op, 0, 1).is_null());
            assert!(crate::errors::take_exception().is_some());
            // The unchecked size read trusts the caller and sees the length.
            assert_eq!(PyTuple_GET_SIZE(op), 1);
            assert_eq!(PyTuple_Check(op), 0);
            Py_DecRef(op);
        }
        host::release(list).unwrap();
        host::collect();
    }
}
