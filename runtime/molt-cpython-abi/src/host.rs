//! Host-side entry points: how the runtime (and test fixtures) hand values
//! to native code, take results back and drive collection.
//!
//! Host values returned from this module are rooted; release them with
//! [`release`] when done.

use molt_obj_model::{CollectStats, Heap, MoltObject};

use crate::config::capi_trace;
use crate::errors::{ExceptionKind, PendingException, raise_exception, take_exception};
use crate::ffi::{Py_ssize_t, PyObject, PyTypeObject};
use crate::gil::PyToken;
use crate::layout;
use crate::refcount::{Py_DecRef, retain};
use crate::runtime::with_runtime;
use crate::slots::{dealloc_shadow, resolve_new};
use crate::types::{is_subtype, type_name};

/// Runs `f` against the host heap under the GIL. `f` must not call back
/// into the C API.
pub fn with_heap<R>(f: impl FnOnce(&mut Heap) -> R) -> R {
    crate::with_gil_entry!(_py, { with_runtime(_py, |rt| f(&mut rt.heap)) })
}

pub fn retain_value(value: MoltObject) -> Result<(), PendingException> {
    with_heap(|heap| heap.retain(value)).map_err(PendingException::from)
}

pub fn release(value: MoltObject) -> Result<(), PendingException> {
    with_heap(|heap| heap.release(value)).map_err(PendingException::from)
}

/// Allocates a rooted host tuple.
pub fn new_tuple(items: &[MoltObject]) -> MoltObject {
    with_heap(|heap| {
        let value = MoltObject::from_ref(heap.alloc_tuple(items));
        // A fresh value cannot be stale.
        let _ = heap.retain(value);
        value
    })
}

pub fn new_list(items: &[MoltObject]) -> MoltObject {
    with_heap(|heap| {
        let value = MoltObject::from_ref(heap.alloc_list(items));
        let _ = heap.retain(value);
        value
    })
}

pub fn new_str(s: &str) -> MoltObject {
    with_heap(|heap| {
        let value = MoltObject::from_ref(heap.alloc_str(s));
        let _ = heap.retain(value);
        value
    })
}

/// New native reference to `value`'s shadow.
pub fn to_native(value: MoltObject) -> Result<*mut PyObject, PendingException> {
    crate::with_gil_entry!(_py, {
        with_runtime(_py, |rt| {
            let op = rt.materialize(value)?;
            // SAFETY: `op` is a live shadow.
            unsafe { retain(op) };
            Ok(op)
        })
    })
}

/// The existing shadow of `value`, without creating one.
pub fn shadow_of(value: MoltObject) -> Option<*mut PyObject> {
    crate::with_gil_entry!(_py, { with_runtime(_py, |rt| rt.shadows.lookup_value(value)) })
}

/// Native count of `value`'s shadow, if it has one.
pub fn native_refcnt(value: MoltObject) -> Option<Py_ssize_t> {
    // SAFETY: registered shadows are live.
    shadow_of(value).map(|op| unsafe { layout::refcnt(op) })
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShadowStats {
    pub live: usize,
    /// Natively created tuples that have not crossed back to the host.
    pub unpublished: usize,
}

pub fn shadow_stats() -> ShadowStats {
    crate::with_gil_entry!(_py, {
        with_runtime(_py, |rt| ShadowStats {
            live: rt.shadows.len(),
            unpublished: rt.shadows.unpublished(),
        })
    })
}

/// Borrowed arguments for one native call. Each argument holds a native
/// reference until the frame is dropped.
pub struct ArgFrame {
    ptrs: Vec<*mut PyObject>,
}

impl ArgFrame {
    pub fn as_ptrs(&self) -> &[*mut PyObject] {
        &self.ptrs
    }

    pub fn get(&self, index: usize) -> Option<*mut PyObject> {
        self.ptrs.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.ptrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ptrs.is_empty()
    }
}

impl Drop for ArgFrame {
    fn drop(&mut self) {
        crate::with_gil_entry!(_py, {
            for op in self.ptrs.drain(..) {
                // SAFETY: the frame owns one reference per pointer.
                unsafe { Py_DecRef(op) };
            }
            if with_runtime(_py, |rt| rt.should_auto_collect()) {
                collect_with(_py);
            }
        })
    }
}

pub fn to_native_borrowed(args: &[MoltObject]) -> Result<ArgFrame, PendingException> {
    let mut frame = ArgFrame {
        ptrs: Vec::with_capacity(args.len()),
    };
    for arg in args {
        frame.ptrs.push(to_native(*arg)?);
    }
    Ok(frame)
}

/// Host value behind a native pointer the caller keeps owning. Tuples still
/// in their construction window are published first.
///
/// # Safety
/// `op` must be a live object.
pub unsafe fn from_native(op: *mut PyObject) -> Result<MoltObject, PendingException> {
    crate::with_gil_entry!(_py, { unsafe { from_native_with(_py, op) } })
}

unsafe fn from_native_with(_py: &PyToken<'_>, op: *mut PyObject) -> Result<MoltObject, PendingException> {
    if op.is_null() {
        return Err(PendingException::new(
            ExceptionKind::SystemError,
            "NULL object passed to the host",
        ));
    }
    with_runtime(_py, |rt| {
        let value = unsafe { rt.publish(op)? };
        rt.heap.retain(value)?;
        Ok(value)
    })
}

/// Like [`from_native`], but consumes the caller's native reference.
///
/// # Safety
/// `op` must be a live object owned by the caller.
pub unsafe fn from_native_steal(op: *mut PyObject) -> Result<MoltObject, PendingException> {
    crate::with_gil_entry!(_py, {
        let value = unsafe { from_native_with(_py, op) };
        if !op.is_null() {
            unsafe { Py_DecRef(op) };
        }
        value
    })
}

/// Calls `ty` like a Python class: packs `args` into a tuple and runs the
/// resolved `tp_new`.
///
/// # Safety
/// `ty` must be a valid type object.
pub unsafe fn call_type(
    ty: *mut PyTypeObject,
    args: &[MoltObject],
) -> Result<MoltObject, PendingException> {
    crate::with_gil_entry!(_py, {
        let args_tuple = with_runtime(_py, |rt| -> Result<*mut PyObject, PendingException> {
            unsafe { rt.types.ready(ty)? };
            let packed = MoltObject::from_ref(rt.heap.alloc_tuple(args));
            let op = rt.materialize(packed)?;
            unsafe { retain(op) };
            Ok(op)
        })?;
        let result = unsafe {
            match resolve_new(ty) {
                Some(new) => new(ty, args_tuple, std::ptr::null_mut()),
                None => raise_exception(
                    ExceptionKind::TypeError,
                    &format!("cannot create '{}' instances", type_name(ty)),
                ),
            }
        };
        unsafe { Py_DecRef(args_tuple) };
        if result.is_null() {
            return Err(take_exception().unwrap_or_else(|| {
                PendingException::new(
                    ExceptionKind::SystemError,
                    "tp_new returned NULL without setting an exception",
                )
            }));
        }
        unsafe { from_native_steal(result) }
    })
}

/// Native type of a host value.
pub fn type_of(value: MoltObject) -> Result<*mut PyTypeObject, PendingException> {
    crate::with_gil_entry!(_py, { with_runtime(_py, |rt| rt.type_ptr_of(value)) })
}

pub fn isinstance(value: MoltObject, ty: *mut PyTypeObject) -> bool {
    match type_of(value) {
        // SAFETY: registered types are live.
        Ok(actual) => unsafe { is_subtype(actual, ty) },
        Err(_) => false,
    }
}

pub fn member_get(value: MoltObject, name: &str) -> Result<MoltObject, PendingException> {
    crate::with_gil_entry!(_py, { with_runtime(_py, |rt| rt.member_get(value, name)) })
}

pub fn member_set(value: MoltObject, name: &str, new_value: MoltObject) -> Result<(), PendingException> {
    crate::with_gil_entry!(_py, {
        let old = with_runtime(_py, |rt| rt.member_set(value, name, new_value))?;
        if let Some(old) = old {
            unsafe { Py_DecRef(old) };
        }
        Ok(())
    })
}

/// Extension region of a subclass instance, if its type declares one.
pub fn extension_fields(value: MoltObject) -> Result<Option<*mut std::ffi::c_void>, PendingException> {
    crate::with_gil_entry!(_py, {
        with_runtime(_py, |rt| {
            let op = rt.materialize(value)?;
            Ok(rt.extension_fields(op))
        })
    })
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CollectReport {
    pub passes: usize,
    pub host: CollectStats,
    pub shadows_reclaimed: usize,
}

/// Runs the host collector until a pass reclaims no shadows. Values whose
/// shadows are still referenced natively survive.
pub fn collect() -> CollectReport {
    crate::with_gil_entry!(_py, { collect_with(_py) })
}

fn collect_with(_py: &PyToken<'_>) -> CollectReport {
    let mut report = CollectReport::default();
    loop {
        let (doomed, stats) = with_runtime(_py, |rt| rt.collect_pass());
        report.passes += 1;
        report.host.marked = stats.marked;
        report.host.swept += stats.swept;
        if doomed.is_empty() {
            break;
        }
        for ptr in doomed {
            // SAFETY: the shadow left the table in this pass and has no
            // native references.
            unsafe { dealloc_shadow(ptr.0) };
            report.shadows_reclaimed += 1;
        }
    }
    capi_trace!(
        "collect done: passes={} swept={} shadows={}",
        report.passes,
        report.host.swept,
        report.shadows_reclaimed
    );
    report
}
