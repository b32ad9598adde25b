//! Construction and destruction hooks.
//!
//! A NULL hook means "inherit": resolution walks `tp_base` until a type
//! supplies one, falling back to the bridge defaults below.

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{capi_trace, config};
use crate::errors::{ExceptionKind, fatal_error, raise_exception, raise_pending};
use crate::ffi::{Py_ssize_t, PyObject, PyTypeObject, PyVarObject, allocfunc, destructor, freefunc, newfunc};
use crate::layout;
use crate::refcount::Py_DecRef;
use crate::runtime::with_runtime;

static LIVE_ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

/// Blocks handed out by `PyObject_Malloc` and not yet freed.
pub fn live_allocations() -> usize {
    LIVE_ALLOCATIONS.load(Ordering::Relaxed)
}

unsafe fn resolve<T>(
    ty: *mut PyTypeObject,
    pick: impl Fn(&PyTypeObject) -> Option<T>,
) -> Option<T> {
    let mut cur = ty;
    while !cur.is_null() {
        let cur_ref = unsafe { &*cur };
        if let Some(hook) = pick(cur_ref) {
            return Some(hook);
        }
        cur = cur_ref.tp_base;
    }
    None
}

pub(crate) unsafe fn resolve_new(ty: *mut PyTypeObject) -> Option<newfunc> {
    unsafe { resolve(ty, |t| t.tp_new) }
}

pub(crate) unsafe fn resolve_alloc(ty: *mut PyTypeObject) -> allocfunc {
    unsafe { resolve(ty, |t| t.tp_alloc).unwrap_or(PyType_GenericAlloc) }
}

pub(crate) unsafe fn resolve_free(ty: *mut PyTypeObject) -> freefunc {
    unsafe { resolve(ty, |t| t.tp_free).unwrap_or(PyObject_Free) }
}

pub(crate) unsafe fn resolve_dealloc(ty: *mut PyTypeObject) -> destructor {
    unsafe { resolve(ty, |t| t.tp_dealloc).unwrap_or(object_dealloc) }
}

/// Tears a shadow down through its type's resolved destructor. The shadow
/// must already be gone from the shadow table.
pub(crate) unsafe fn dealloc_shadow(op: *mut PyObject) {
    unsafe {
        let ty = layout::type_of(op);
        capi_trace!("dealloc {op:p} ({})", crate::types::type_name(ty));
        let dealloc = resolve_dealloc(ty);
        dealloc(op);
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn PyObject_Malloc(size: usize) -> *mut c_void {
    let ptr = unsafe { libc::malloc(size.max(1)) };
    if !ptr.is_null() {
        LIVE_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
    }
    ptr
}

#[unsafe(no_mangle)]
pub extern "C" fn PyObject_Calloc(nelem: usize, elsize: usize) -> *mut c_void {
    let ptr = unsafe { libc::calloc(nelem.max(1), elsize.max(1)) };
    if !ptr.is_null() {
        LIVE_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
    }
    ptr
}

/// # Safety
/// `ptr` must be NULL or a block from `PyObject_Malloc`/`PyObject_Calloc`
/// that has not been freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyObject_Free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    LIVE_ALLOCATIONS.fetch_sub(1, Ordering::Relaxed);
    unsafe { libc::free(ptr) };
}

/// Default `tp_alloc`: zeroed memory for `nitems` items plus any subclass
/// fields, adopted with [`PyObject_InitVar`]. Returns a new reference.
///
/// # Safety
/// `ty` must be a valid type object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyType_GenericAlloc(
    ty: *mut PyTypeObject,
    nitems: Py_ssize_t,
) -> *mut PyObject {
    if nitems < 0 {
        return raise_exception(ExceptionKind::SystemError, crate::errors::BAD_INTERNAL_CALL);
    }
    let size = unsafe { layout::instance_size(ty, nitems as usize) };
    let mem = PyObject_Calloc(1, size);
    if mem.is_null() {
        return raise_exception(ExceptionKind::MemoryError, "out of memory");
    }
    let op = unsafe { PyObject_InitVar(mem.cast(), ty, nitems) };
    if op.is_null() {
        unsafe { PyObject_Free(mem) };
        return std::ptr::null_mut();
    }
    op.cast()
}

/// Turns raw memory into a live instance of `ty`: writes the header and
/// creates the host object it projects. Custom `tp_alloc` hooks call this
/// on memory from `PyObject_Malloc`. The result holds one reference.
///
/// # Safety
/// `op` must be at least `tp_basicsize + size * tp_itemsize` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyObject_InitVar(
    op: *mut PyVarObject,
    ty: *mut PyTypeObject,
    size: Py_ssize_t,
) -> *mut PyVarObject {
    if op.is_null() || ty.is_null() || size < 0 {
        return raise_exception(ExceptionKind::SystemError, crate::errors::BAD_INTERNAL_CALL);
    }
    crate::with_gil_entry!(_py, {
        match with_runtime(_py, |rt| unsafe { rt.adopt(op.cast(), ty, size as usize) }) {
            Ok(()) => op,
            Err(exc) => raise_pending(exc),
        }
    })
}

/// Default destructor for header-only and length-only shadows.
pub(crate) unsafe extern "C" fn object_dealloc(op: *mut PyObject) {
    unsafe {
        let free = resolve_free(layout::type_of(op));
        free(op.cast());
    }
}

/// Destructor for tuple layouts: drops the item references and any object
/// members, then returns the memory through the resolved `tp_free`.
pub(crate) unsafe extern "C" fn tuple_dealloc(op: *mut PyObject) {
    crate::with_gil_entry!(_py, {
        let items = unsafe { layout::items(op) };
        let members = with_runtime(_py, |rt| {
            if config().verify_refcnt {
                if let Err(msg) = unsafe { rt.verify_teardown(op, &items) } {
                    fatal_error(&msg);
                }
            }
            unsafe { rt.object_member_values(op) }
        });
        for item in items.into_iter().chain(members) {
            unsafe { Py_DecRef(item) };
        }
        unsafe {
            let free = resolve_free(layout::type_of(op));
            free(op.cast());
        }
    })
}
