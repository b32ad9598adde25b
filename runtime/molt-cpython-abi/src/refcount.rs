//! Native reference counts over a traced host heap.
//!
//! A positive `ob_refcnt` makes the projected host value a collector root.
//! Reaching zero frees nothing by itself for heap values: the shadow is torn
//! down once the host collector finds the value unreachable. Shadows of
//! immediates have no host identity to wait for and go away at zero.

use std::fmt;

use crate::config::capi_trace;
use crate::errors::fatal_error;
use crate::ffi::{Py_ssize_t, PyObject, PyTypeObject};
use crate::gil::PyToken;
use crate::layout;
use crate::runtime::with_runtime;
use crate::slots::dealloc_shadow;

/// Counts at or above this are never changed. Built-in type objects and the
/// `None`/`True`/`False` shadows start here.
pub const IMMORTAL_REFCNT: Py_ssize_t = 1 << 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Released {
    Alive,
    Zero,
    Immortal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RefcountViolation {
    addr: usize,
    count: Py_ssize_t,
}

impl fmt::Display for RefcountViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Py_DecRef: object at {:#x} released with refcount {}",
            self.addr, self.count
        )
    }
}

#[inline]
pub(crate) unsafe fn retain(op: *mut PyObject) {
    unsafe {
        if (*op).ob_refcnt < IMMORTAL_REFCNT {
            (*op).ob_refcnt += 1;
        }
    }
}

/// Drops one native reference. A release with nothing left to release is
/// reported instead of wrapping the count.
pub(crate) unsafe fn release(op: *mut PyObject) -> Result<Released, RefcountViolation> {
    let count = unsafe { layout::refcnt(op) };
    if count >= IMMORTAL_REFCNT {
        return Ok(Released::Immortal);
    }
    if count <= 0 {
        return Err(RefcountViolation {
            addr: op as usize,
            count,
        });
    }
    unsafe { (*op).ob_refcnt = count - 1 };
    Ok(if count == 1 {
        Released::Zero
    } else {
        Released::Alive
    })
}

unsafe fn released_to_zero(_py: &PyToken<'_>, op: *mut PyObject) {
    let reclaim = with_runtime(_py, |rt| rt.on_zero(op));
    if reclaim {
        unsafe { dealloc_shadow(op) };
    }
}

/// # Safety
/// `op` must be NULL or a live object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn Py_IncRef(op: *mut PyObject) {
    if op.is_null() {
        return;
    }
    crate::with_gil_entry!(_py, {
        if crate::config::config().verify_refcnt && unsafe { layout::refcnt(op) } < IMMORTAL_REFCNT {
            let known = with_runtime(_py, |rt| rt.shadows.entry(op).is_some());
            if !known {
                fatal_error(&format!("Py_IncRef: {op:p} is not a live object"));
            }
        }
        unsafe { retain(op) };
    })
}

/// # Safety
/// `op` must be NULL or a live object owned by the caller.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn Py_DecRef(op: *mut PyObject) {
    if op.is_null() {
        return;
    }
    crate::with_gil_entry!(_py, {
        match unsafe { release(op) } {
            Ok(Released::Zero) => unsafe { released_to_zero(_py, op) },
            Ok(Released::Alive | Released::Immortal) => {}
            Err(violation) => {
                capi_trace!("{violation}");
                fatal_error(&violation.to_string())
            }
        }
    })
}

/// # Safety
/// `op` must be a live object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn Py_NewRef(op: *mut PyObject) -> *mut PyObject {
    unsafe { Py_IncRef(op) };
    op
}

/// # Safety
/// `op` must be NULL or a live object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn Py_XNewRef(op: *mut PyObject) -> *mut PyObject {
    if !op.is_null() {
        unsafe { Py_IncRef(op) };
    }
    op
}

/// # Safety
/// `op` must be a live object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn Py_REFCNT(op: *mut PyObject) -> Py_ssize_t {
    unsafe { layout::refcnt(op) }
}

/// # Safety
/// `op` must be a live object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn Py_TYPE(op: *mut PyObject) -> *mut PyTypeObject {
    unsafe { layout::type_of(op) }
}
