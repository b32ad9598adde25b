//! CPython binary ABI shim for Molt.
//!
//! Native extension code sees Molt tuples through *shadows*: heap blocks laid
//! out exactly like CPython's `PyTupleObject`, created lazily when a host
//! value first crosses into native code. The host value stays authoritative.
//! Native reference counts root it for the host collector, and a shadow is
//! torn down only after the collector finds its value unreachable.
//!
//! Native subclasses of `tuple` are supported: `PyType_Ready` registers them
//! with the host, construction dispatches through the `tp_new`/`tp_alloc`
//! chain, and extra struct fields live after the item array.
//!
//! Every exported function takes the bridge GIL on entry, so they may be
//! called from any thread.

// Exported items keep their C API spellings.
#![allow(non_snake_case, non_upper_case_globals)]

pub mod api;
pub mod config;
pub mod errors;
pub mod ffi;
mod gil;
pub mod host;
mod layout;
mod members;
mod refcount;
mod runtime;
mod shadow;
mod slots;
mod types;

pub use api::*;
pub use config::{AbiConfig, config};
pub use errors::{
    ExceptionKind, PendingException, PyErr_Clear, PyErr_Occurred, PyErr_SetString,
    PyExc_AttributeError, PyExc_IndexError, PyExc_MemoryError, PyExc_SystemError,
    PyExc_TypeError, PyExc_ValueError, exception_pending, take_exception,
};
pub use gil::{PyGILState_Ensure, PyGILState_Release};
pub use refcount::{
    IMMORTAL_REFCNT, Py_DecRef, Py_IncRef, Py_NewRef, Py_REFCNT, Py_TYPE, Py_XNewRef,
};
pub use slots::{
    PyObject_Calloc, PyObject_Free, PyObject_InitVar, PyObject_Malloc, PyType_GenericAlloc,
    live_allocations,
};
pub use types::{
    _PyNone_Type, PyBaseObject_Type, PyBool_Type, PyDict_Type, PyFloat_Type, PyList_Type,
    PyLong_Type, PyTuple_Type, PyType_IsSubtype, PyType_Ready, PyType_Type, PyUnicode_Type,
};

#[cfg(test)]
pub(crate) static TEST_MUTEX: parking_lot::Mutex<()> = parking_lot::Mutex::new(());
