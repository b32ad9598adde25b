//! Built-in type objects and the registry that ties native type objects to
//! host type ids.

use std::collections::HashMap;
use std::ffi::CStr;
use std::mem::size_of;

use libc::c_int;
use molt_obj_model::{
    FIRST_HEAP_TYPE_ID, TYPE_ID_BOOL, TYPE_ID_DICT, TYPE_ID_FLOAT, TYPE_ID_INT, TYPE_ID_LIST,
    TYPE_ID_NONE, TYPE_ID_OBJECT, TYPE_ID_STRING, TYPE_ID_TUPLE, TYPE_ID_TYPE,
};

use crate::api::tuple::tuple_new;
use crate::config::capi_trace;
use crate::errors::{ExceptionKind, PendingException, raise_pending};
use crate::ffi::{
    INHERITED_SUBCLASS_FLAGS, Py_TPFLAGS_DICT_SUBCLASS, Py_TPFLAGS_LIST_SUBCLASS,
    Py_TPFLAGS_LONG_SUBCLASS, Py_TPFLAGS_READY, Py_TPFLAGS_TUPLE_SUBCLASS,
    Py_TPFLAGS_TYPE_SUBCLASS, Py_TPFLAGS_UNICODE_SUBCLASS, PyObject, PyTypeObject, PyVarObject,
    SLOT_SIZE, StaticType, TUPLE_HEADER_SIZE,
};
use crate::members::{MemberInfo, collect_members};
use crate::runtime::with_runtime;
use crate::slots::{PyObject_Free, PyType_GenericAlloc, object_dealloc, tuple_dealloc};

#[unsafe(no_mangle)]
pub static PyBaseObject_Type: StaticType = StaticType::new(PyTypeObject {
    tp_dealloc: Some(object_dealloc),
    tp_alloc: Some(PyType_GenericAlloc),
    tp_free: Some(PyObject_Free),
    ..PyTypeObject::builtin(c"object", size_of::<PyObject>(), 0, 0)
});

#[unsafe(no_mangle)]
pub static PyType_Type: StaticType = StaticType::new(PyTypeObject::builtin(
    c"type",
    size_of::<PyTypeObject>(),
    0,
    Py_TPFLAGS_TYPE_SUBCLASS,
));

#[unsafe(no_mangle)]
pub static PyTuple_Type: StaticType = StaticType::new(PyTypeObject {
    tp_dealloc: Some(tuple_dealloc),
    tp_alloc: Some(PyType_GenericAlloc),
    tp_new: Some(tuple_new),
    tp_free: Some(PyObject_Free),
    ..PyTypeObject::builtin(c"tuple", TUPLE_HEADER_SIZE, SLOT_SIZE, Py_TPFLAGS_TUPLE_SUBCLASS)
});

#[unsafe(no_mangle)]
pub static PyList_Type: StaticType = StaticType::new(PyTypeObject::builtin(
    c"list",
    size_of::<PyVarObject>(),
    0,
    Py_TPFLAGS_LIST_SUBCLASS,
));

#[unsafe(no_mangle)]
pub static PyDict_Type: StaticType = StaticType::new(PyTypeObject::builtin(
    c"dict",
    size_of::<PyVarObject>(),
    0,
    Py_TPFLAGS_DICT_SUBCLASS,
));

#[unsafe(no_mangle)]
pub static PyUnicode_Type: StaticType = StaticType::new(PyTypeObject::builtin(
    c"str",
    size_of::<PyVarObject>(),
    0,
    Py_TPFLAGS_UNICODE_SUBCLASS,
));

#[unsafe(no_mangle)]
pub static PyLong_Type: StaticType = StaticType::new(PyTypeObject::builtin(
    c"int",
    size_of::<PyObject>(),
    0,
    Py_TPFLAGS_LONG_SUBCLASS,
));

#[unsafe(no_mangle)]
pub static PyFloat_Type: StaticType =
    StaticType::new(PyTypeObject::builtin(c"float", size_of::<PyObject>(), 0, 0));

#[unsafe(no_mangle)]
pub static PyBool_Type: StaticType = StaticType::new(PyTypeObject::builtin(
    c"bool",
    size_of::<PyObject>(),
    0,
    Py_TPFLAGS_LONG_SUBCLASS,
));

#[unsafe(no_mangle)]
pub static _PyNone_Type: StaticType =
    StaticType::new(PyTypeObject::builtin(c"NoneType", size_of::<PyObject>(), 0, 0));

/// Static types in readying order, with their host ids and bases.
fn builtin_types() -> [(&'static StaticType, u32, Option<&'static StaticType>); 10] {
    [
        (&PyBaseObject_Type, TYPE_ID_OBJECT, None),
        (&PyType_Type, TYPE_ID_TYPE, Some(&PyBaseObject_Type)),
        (&PyTuple_Type, TYPE_ID_TUPLE, Some(&PyBaseObject_Type)),
        (&PyList_Type, TYPE_ID_LIST, Some(&PyBaseObject_Type)),
        (&PyDict_Type, TYPE_ID_DICT, Some(&PyBaseObject_Type)),
        (&PyUnicode_Type, TYPE_ID_STRING, Some(&PyBaseObject_Type)),
        (&PyLong_Type, TYPE_ID_INT, Some(&PyBaseObject_Type)),
        (&PyFloat_Type, TYPE_ID_FLOAT, Some(&PyBaseObject_Type)),
        (&PyBool_Type, TYPE_ID_BOOL, Some(&PyLong_Type)),
        (&_PyNone_Type, TYPE_ID_NONE, Some(&PyBaseObject_Type)),
    ]
}

pub(crate) unsafe fn type_name(ty: *mut PyTypeObject) -> String {
    unsafe {
        if ty.is_null() || (*ty).tp_name.is_null() {
            return "?".to_string();
        }
        let full = CStr::from_ptr((*ty).tp_name).to_string_lossy();
        // Dotted names report their last component, as CPython does.
        full.rsplit('.').next().unwrap_or_default().to_string()
    }
}

/// Walks `tp_base` from `a`; true when `b` is on the chain.
pub(crate) unsafe fn is_subtype(a: *mut PyTypeObject, b: *mut PyTypeObject) -> bool {
    let mut cur = a;
    while !cur.is_null() {
        if cur == b {
            return true;
        }
        cur = unsafe { (*cur).tp_base };
    }
    false
}

pub(crate) unsafe fn is_tuple_subtype(ty: *mut PyTypeObject) -> bool {
    unsafe { is_subtype(ty, PyTuple_Type.as_ptr()) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct TypePtr(pub(crate) *mut PyTypeObject);

// SAFETY: type objects are static or live for the rest of the process.
unsafe impl Send for TypePtr {}

#[derive(Debug)]
pub(crate) struct TypeInfo {
    pub(crate) host_type_id: u32,
    pub(crate) name: String,
    /// Basic size of the nearest built-in ancestor. Declared member offsets
    /// at or past this point live in the extension region.
    pub(crate) prefix_size: usize,
    pub(crate) ext_size: usize,
    pub(crate) members: Vec<MemberInfo>,
}

pub(crate) struct TypeRegistry {
    by_addr: HashMap<usize, TypeInfo>,
    by_host_id: HashMap<u32, TypePtr>,
    next_heap_id: u32,
}

impl TypeRegistry {
    pub(crate) fn with_builtins() -> Self {
        let mut registry = Self {
            by_addr: HashMap::new(),
            by_host_id: HashMap::new(),
            next_heap_id: FIRST_HEAP_TYPE_ID,
        };
        for (ty, host_id, base) in builtin_types() {
            let ptr = ty.as_ptr();
            // SAFETY: start-up runs once, under the GIL, before any native
            // code can observe these objects.
            unsafe {
                (*ptr).ob_base.ob_base.ob_type = PyType_Type.as_ptr();
                (*ptr).tp_base = base.map_or(std::ptr::null_mut(), StaticType::as_ptr);
                (*ptr).tp_flags |= Py_TPFLAGS_READY;
                registry.insert(
                    TypePtr(ptr),
                    TypeInfo {
                        host_type_id: host_id,
                        name: type_name(ptr),
                        prefix_size: (*ptr).tp_basicsize as usize,
                        ext_size: 0,
                        members: Vec::new(),
                    },
                );
            }
        }
        registry
    }

    fn insert(&mut self, ty: TypePtr, info: TypeInfo) {
        self.by_host_id.insert(info.host_type_id, ty);
        self.by_addr.insert(ty.0 as usize, info);
    }

    pub(crate) fn info(&self, ty: *mut PyTypeObject) -> Option<&TypeInfo> {
        self.by_addr.get(&(ty as usize))
    }

    pub(crate) fn type_for_id(&self, host_type_id: u32) -> Option<*mut PyTypeObject> {
        self.by_host_id.get(&host_type_id).map(|ty| ty.0)
    }

    /// Members declared along the chain from `ty` to its root, nearest first.
    pub(crate) fn chain_members(&self, ty: *mut PyTypeObject) -> Vec<(&MemberInfo, usize)> {
        let mut out = Vec::new();
        let mut cur = ty;
        while let Some(info) = self.info(cur) {
            out.extend(info.members.iter().map(|m| (m, info.prefix_size)));
            // SAFETY: registered types are live.
            cur = unsafe { (*cur).tp_base };
        }
        out
    }

    /// Prepares `ty` for use: fills in inherited fields and hooks, assigns a
    /// host type id and indexes its members. Idempotent.
    pub(crate) unsafe fn ready(&mut self, ty: *mut PyTypeObject) -> Result<(), PendingException> {
        if ty.is_null() {
            return Err(PendingException::new(
                ExceptionKind::SystemError,
                crate::errors::BAD_INTERNAL_CALL,
            ));
        }
        unsafe {
            if (*ty).tp_flags & Py_TPFLAGS_READY != 0 && self.info(ty).is_some() {
                return Ok(());
            }
            if (*ty).tp_base.is_null() && ty != PyBaseObject_Type.as_ptr() {
                (*ty).tp_base = PyBaseObject_Type.as_ptr();
            }
            let base = (*ty).tp_base;
            self.ready(base)?;
            let name = type_name(ty);

            if (*ty).tp_basicsize == 0 {
                (*ty).tp_basicsize = (*base).tp_basicsize;
            }
            if (*ty).tp_basicsize < (*base).tp_basicsize {
                return Err(PendingException::new(
                    ExceptionKind::TypeError,
                    format!(
                        "type '{name}' has tp_basicsize {} smaller than its base '{}' ({})",
                        (*ty).tp_basicsize,
                        type_name(base),
                        (*base).tp_basicsize
                    ),
                ));
            }
            if (*ty).tp_itemsize == 0 {
                (*ty).tp_itemsize = (*base).tp_itemsize;
            } else if (*base).tp_itemsize != 0 && (*ty).tp_itemsize != (*base).tp_itemsize {
                return Err(PendingException::new(
                    ExceptionKind::TypeError,
                    format!("type '{name}' changes the item size of its base"),
                ));
            }
            let members = collect_members((*ty).tp_members, &name)?;

            if (*ty).ob_base.ob_base.ob_type.is_null() {
                (*ty).ob_base.ob_base.ob_type = (*base).ob_base.ob_base.ob_type;
            }
            (*ty).tp_flags |= (*base).tp_flags & INHERITED_SUBCLASS_FLAGS;
            if (*ty).tp_dealloc.is_none() {
                (*ty).tp_dealloc = (*base).tp_dealloc;
            }
            if (*ty).tp_alloc.is_none() {
                (*ty).tp_alloc = (*base).tp_alloc;
            }
            if (*ty).tp_new.is_none() {
                (*ty).tp_new = (*base).tp_new;
            }
            if (*ty).tp_free.is_none() {
                (*ty).tp_free = (*base).tp_free;
            }

            let prefix_size = self
                .info(base)
                .map_or((*base).tp_basicsize as usize, |info| info.prefix_size);
            let ext_size = ((*ty).tp_basicsize as usize).saturating_sub(prefix_size);
            let host_type_id = self.next_heap_id;
            self.next_heap_id += 1;
            capi_trace!(
                "ready type '{name}' id={host_type_id} basicsize={} ext={ext_size} members={}",
                (*ty).tp_basicsize,
                members.len()
            );
            self.insert(
                TypePtr(ty),
                TypeInfo {
                    host_type_id,
                    name,
                    prefix_size,
                    ext_size,
                    members,
                },
            );
            (*ty).tp_flags |= Py_TPFLAGS_READY;
        }
        Ok(())
    }
}

/// # Safety
/// `ty` must point at a writable type object that outlives the process's
/// use of the bridge.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyType_Ready(ty: *mut PyTypeObject) -> c_int {
    crate::with_gil_entry!(_py, {
        match with_runtime(_py, |rt| unsafe { rt.types.ready(ty) }) {
            Ok(()) => 0,
            Err(exc) => raise_pending(exc),
        }
    })
}

/// # Safety
/// Both arguments must be valid type objects.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyType_IsSubtype(a: *mut PyTypeObject, b: *mut PyTypeObject) -> c_int {
    unsafe { is_subtype(a, b) as c_int }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::Py_TPFLAGS_HEAPTYPE;

    fn subclass_of(base: *mut PyTypeObject, name: &'static CStr, basicsize: usize) -> PyTypeObject {
        PyTypeObject {
            tp_base: base,
            tp_flags: Py_TPFLAGS_HEAPTYPE,
            ..PyTypeObject::builtin(name, basicsize, 0, 0)
        }
    }

    #[test]
    fn builtins_are_ready_with_bases() {
        let _guard = crate::TEST_MUTEX.lock();
        crate::with_gil_entry!(_py, {
            with_runtime(_py, |rt| {
                let tuple = PyTuple_Type.as_ptr();
                assert_eq!(rt.types.info(tuple).unwrap().host_type_id, TYPE_ID_TUPLE);
                assert_eq!(rt.types.type_for_id(TYPE_ID_BOOL), Some(PyBool_Type.as_ptr()));
                unsafe {
                    assert_eq!((*tuple).tp_base, PyBaseObject_Type.as_ptr());
                    assert!(is_subtype(PyBool_Type.as_ptr(), PyLong_Type.as_ptr()));
                    assert_eq!((*tuple).ob_base.ob_base.ob_type, PyType_Type.as_ptr());
                }
            });
        });
    }

    #[test]
    fn ready_inherits_layout_flags_and_hooks() {
        let _guard = crate::TEST_MUTEX.lock();
        let ty = Box::leak(Box::new(subclass_of(
            PyTuple_Type.as_ptr(),
            c"mod.Sub",
            TUPLE_HEADER_SIZE + 16,
        )));
        let ty: *mut PyTypeObject = ty;
        assert_eq!(unsafe { PyType_Ready(ty) }, 0);
        assert_eq!(unsafe { PyType_Ready(ty) }, 0);
        unsafe {
            assert_eq!((*ty).tp_itemsize as usize, SLOT_SIZE);
            assert_ne!((*ty).tp_flags & Py_TPFLAGS_TUPLE_SUBCLASS, 0);
            assert_ne!((*ty).tp_flags & Py_TPFLAGS_READY, 0);
            assert!((*ty).tp_alloc.is_some() && (*ty).tp_new.is_some());
            assert_eq!(PyType_IsSubtype(ty, PyTuple_Type.as_ptr()), 1);
            assert_eq!(PyType_IsSubtype(PyTuple_Type.as_ptr(), ty), 0);
        }
        crate::with_gil_entry!(_py, {
            with_runtime(_py, |rt| {
                let info = rt.types.info(ty).unwrap();
                assert!(info.host_type_id >= FIRST_HEAP_TYPE_ID);
                assert_eq!(info.name, "Sub");
                assert_eq!(info.prefix_size, TUPLE_HEADER_SIZE);
                assert_eq!(info.ext_size, 16);
            });
        });
    }

    #[test]
    fn ready_rejects_shrinking_basicsize() {
        let _guard = crate::TEST_MUTEX.lock();
        let ty: *mut PyTypeObject =
            Box::leak(Box::new(subclass_of(PyTuple_Type.as_ptr(), c"Small", 8)));
        assert_eq!(unsafe { PyType_Ready(ty) }, -1);
        let exc = crate::errors::take_exception().unwrap();
        assert_eq!(exc.kind, ExceptionKind::TypeError);
        assert!(exc.message.contains("smaller than its base"));
    }
}
