//! `#[repr(C)]` mirrors of the structs in `include/molt_capi.h`.
//!
//! Every shadow the bridge hands to native code starts with the same prefix
//! CPython uses, so field reads compiled against CPython headers land on the
//! right words. The offsets are pinned below at compile time.

#![allow(non_camel_case_types)]

use std::cell::UnsafeCell;
use std::ffi::{CStr, c_void};
use std::mem::{offset_of, size_of};

use libc::{c_char, c_int, c_ulong};

pub type Py_ssize_t = isize;

pub type destructor = unsafe extern "C" fn(*mut PyObject);
pub type allocfunc = unsafe extern "C" fn(*mut PyTypeObject, Py_ssize_t) -> *mut PyObject;
pub type newfunc =
    unsafe extern "C" fn(*mut PyTypeObject, *mut PyObject, *mut PyObject) -> *mut PyObject;
pub type freefunc = unsafe extern "C" fn(*mut c_void);

#[repr(C)]
#[derive(Debug)]
pub struct PyObject {
    pub ob_refcnt: Py_ssize_t,
    pub ob_type: *mut PyTypeObject,
}

#[repr(C)]
#[derive(Debug)]
pub struct PyVarObject {
    pub ob_base: PyObject,
    pub ob_size: Py_ssize_t,
}

/// Tuple layout. `ob_item` is declared with one element; instances are
/// allocated with room for `ob_size` slots followed by any subclass fields.
#[repr(C)]
#[derive(Debug)]
pub struct PyTupleObject {
    pub ob_base: PyVarObject,
    pub ob_item: [*mut PyObject; 1],
}

#[repr(C)]
#[derive(Debug)]
pub struct PyMemberDef {
    pub name: *const c_char,
    pub type_code: c_int,
    pub offset: Py_ssize_t,
    pub flags: c_int,
    pub doc: *const c_char,
}

pub const T_INT: c_int = 1;
pub const T_LONG: c_int = 2;
pub const T_DOUBLE: c_int = 4;
pub const T_OBJECT: c_int = 6;
pub const T_PYSSIZET: c_int = 19;
pub const READONLY: c_int = 1;

#[repr(C)]
#[derive(Debug)]
pub struct PyTypeObject {
    pub ob_base: PyVarObject,
    pub tp_name: *const c_char,
    pub tp_basicsize: Py_ssize_t,
    pub tp_itemsize: Py_ssize_t,
    pub tp_dealloc: Option<destructor>,
    pub tp_flags: c_ulong,
    pub tp_members: *mut PyMemberDef,
    pub tp_base: *mut PyTypeObject,
    pub tp_alloc: Option<allocfunc>,
    pub tp_new: Option<newfunc>,
    pub tp_free: Option<freefunc>,
}

pub const Py_TPFLAGS_HEAPTYPE: c_ulong = 1 << 9;
pub const Py_TPFLAGS_BASETYPE: c_ulong = 1 << 10;
pub const Py_TPFLAGS_READY: c_ulong = 1 << 12;
pub const Py_TPFLAGS_LONG_SUBCLASS: c_ulong = 1 << 24;
pub const Py_TPFLAGS_LIST_SUBCLASS: c_ulong = 1 << 25;
pub const Py_TPFLAGS_TUPLE_SUBCLASS: c_ulong = 1 << 26;
pub const Py_TPFLAGS_UNICODE_SUBCLASS: c_ulong = 1 << 28;
pub const Py_TPFLAGS_DICT_SUBCLASS: c_ulong = 1 << 29;
pub const Py_TPFLAGS_TYPE_SUBCLASS: c_ulong = 1 << 31;

/// Flags a subtype inherits from its base during `PyType_Ready`.
pub const INHERITED_SUBCLASS_FLAGS: c_ulong = Py_TPFLAGS_LONG_SUBCLASS
    | Py_TPFLAGS_LIST_SUBCLASS
    | Py_TPFLAGS_TUPLE_SUBCLASS
    | Py_TPFLAGS_UNICODE_SUBCLASS
    | Py_TPFLAGS_DICT_SUBCLASS
    | Py_TPFLAGS_TYPE_SUBCLASS;

/// Size of the fixed tuple prefix: header plus `ob_size`, before `ob_item`.
pub const TUPLE_HEADER_SIZE: usize = offset_of!(PyTupleObject, ob_item);
pub const SLOT_SIZE: usize = size_of::<*mut PyObject>();

const _: () = {
    assert!(offset_of!(PyObject, ob_refcnt) == 0);
    assert!(offset_of!(PyObject, ob_type) == size_of::<Py_ssize_t>());
    assert!(offset_of!(PyVarObject, ob_size) == 2 * size_of::<usize>());
    assert!(offset_of!(PyTupleObject, ob_item) == 3 * size_of::<usize>());
    assert!(SLOT_SIZE == size_of::<usize>());
};

impl PyTypeObject {
    /// Static type with no hooks; `ob_type` and `tp_base` are filled in when
    /// the runtime readies it.
    pub const fn builtin(
        name: &'static CStr,
        basicsize: usize,
        itemsize: usize,
        flags: c_ulong,
    ) -> Self {
        Self {
            ob_base: PyVarObject {
                ob_base: PyObject {
                    ob_refcnt: crate::refcount::IMMORTAL_REFCNT,
                    ob_type: std::ptr::null_mut(),
                },
                ob_size: 0,
            },
            tp_name: name.as_ptr(),
            tp_basicsize: basicsize as Py_ssize_t,
            tp_itemsize: itemsize as Py_ssize_t,
            tp_dealloc: None,
            tp_flags: flags | Py_TPFLAGS_BASETYPE,
            tp_members: std::ptr::null_mut(),
            tp_base: std::ptr::null_mut(),
            tp_alloc: None,
            tp_new: None,
            tp_free: None,
        }
    }
}

/// A type object exported under its CPython symbol name. Native code takes
/// its address and may read any field; the runtime writes it only while
/// readying types under the GIL.
#[repr(transparent)]
pub struct StaticType(UnsafeCell<PyTypeObject>);

// SAFETY: all mutation happens under the GIL during runtime start-up.
unsafe impl Sync for StaticType {}

impl StaticType {
    pub const fn new(ty: PyTypeObject) -> Self {
        Self(UnsafeCell::new(ty))
    }

    pub const fn as_ptr(&self) -> *mut PyTypeObject {
        self.0.get()
    }
}

/// Exported pointer variable (for `PyExc_*`).
#[repr(transparent)]
pub struct ExportedPtr(pub *mut PyObject);

// SAFETY: the pointee is a static type object that is never freed.
unsafe impl Sync for ExportedPtr {}

unsafe extern "C" {
    /// Variadic constructor compiled from `csrc/tuple_pack.c`. Each argument
    /// is a borrowed `PyObject *`; the result holds its own references.
    pub fn PyTuple_Pack(n: Py_ssize_t, ...) -> *mut PyObject;
}
