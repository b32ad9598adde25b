//! Error channel of the C API: a thread-local pending exception plus a
//! sentinel return value, the way CPython reports failures.

use std::cell::RefCell;
use std::ffi::CStr;
use std::fmt;
use std::mem::size_of;

use libc::{c_char, c_int};
use molt_obj_model::HeapError;

use crate::config::capi_trace;
use crate::ffi::{ExportedPtr, Py_ssize_t, PyObject, PyTypeObject, StaticType};

pub(crate) const BAD_INTERNAL_CALL: &str = "bad argument to internal function";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    IndexError,
    TypeError,
    ValueError,
    SystemError,
    AttributeError,
    MemoryError,
}

impl ExceptionKind {
    pub fn name(self) -> &'static str {
        match self {
            ExceptionKind::IndexError => "IndexError",
            ExceptionKind::TypeError => "TypeError",
            ExceptionKind::ValueError => "ValueError",
            ExceptionKind::SystemError => "SystemError",
            ExceptionKind::AttributeError => "AttributeError",
            ExceptionKind::MemoryError => "MemoryError",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "IndexError" => ExceptionKind::IndexError,
            "TypeError" => ExceptionKind::TypeError,
            "ValueError" => ExceptionKind::ValueError,
            "SystemError" => ExceptionKind::SystemError,
            "AttributeError" => ExceptionKind::AttributeError,
            "MemoryError" => ExceptionKind::MemoryError,
            _ => return None,
        })
    }

    /// The exported `PyExc_*` type object for this kind.
    pub fn type_object(self) -> *mut PyObject {
        match self {
            ExceptionKind::IndexError => PyExc_IndexError.0,
            ExceptionKind::TypeError => PyExc_TypeError.0,
            ExceptionKind::ValueError => PyExc_ValueError.0,
            ExceptionKind::SystemError => PyExc_SystemError.0,
            ExceptionKind::AttributeError => PyExc_AttributeError.0,
            ExceptionKind::MemoryError => PyExc_MemoryError.0,
        }
    }

    fn from_type_object(ptr: *mut PyObject) -> Option<Self> {
        [
            ExceptionKind::IndexError,
            ExceptionKind::TypeError,
            ExceptionKind::ValueError,
            ExceptionKind::SystemError,
            ExceptionKind::AttributeError,
            ExceptionKind::MemoryError,
        ]
        .into_iter()
        .find(|kind| kind.type_object() == ptr)
    }
}

/// An exception raised by the C API and not yet consumed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingException {
    pub kind: ExceptionKind,
    pub message: String,
}

impl PendingException {
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for PendingException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.message)
    }
}

impl std::error::Error for PendingException {}

impl From<HeapError> for PendingException {
    fn from(err: HeapError) -> Self {
        let kind = ExceptionKind::from_name(err.exception_kind())
            .unwrap_or(ExceptionKind::SystemError);
        Self::new(kind, err.to_string())
    }
}

thread_local! {
    static PENDING: RefCell<Option<PendingException>> = const { RefCell::new(None) };
}

pub(crate) trait ExceptionSentinel {
    fn exception_sentinel() -> Self;
}

impl<T> ExceptionSentinel for *mut T {
    fn exception_sentinel() -> Self {
        std::ptr::null_mut()
    }
}

impl ExceptionSentinel for Py_ssize_t {
    fn exception_sentinel() -> Self {
        -1
    }
}

impl ExceptionSentinel for c_int {
    fn exception_sentinel() -> Self {
        -1
    }
}

impl<T> ExceptionSentinel for Option<T> {
    fn exception_sentinel() -> Self {
        None
    }
}

pub(crate) fn set_pending(exc: PendingException) {
    capi_trace!("raise {exc}");
    PENDING.with(|slot| *slot.borrow_mut() = Some(exc));
}

pub(crate) fn raise_exception<T: ExceptionSentinel>(kind: ExceptionKind, message: &str) -> T {
    set_pending(PendingException::new(kind, message));
    T::exception_sentinel()
}

pub(crate) fn raise_pending<T: ExceptionSentinel>(exc: PendingException) -> T {
    set_pending(exc);
    T::exception_sentinel()
}

/// Takes the current thread's pending exception, clearing it.
pub fn take_exception() -> Option<PendingException> {
    PENDING.with(|slot| slot.borrow_mut().take())
}

pub fn exception_pending() -> bool {
    PENDING.with(|slot| slot.borrow().is_some())
}

/// Reports an unrecoverable refcount contradiction and aborts.
pub(crate) fn fatal_error(message: &str) -> ! {
    eprintln!("Fatal Python error: {message}");
    std::process::abort()
}

const fn exception_type(name: &'static CStr) -> StaticType {
    StaticType::new(PyTypeObject::builtin(name, size_of::<PyObject>(), 0, 0))
}

static INDEX_ERROR_TYPE: StaticType = exception_type(c"IndexError");
static TYPE_ERROR_TYPE: StaticType = exception_type(c"TypeError");
static VALUE_ERROR_TYPE: StaticType = exception_type(c"ValueError");
static SYSTEM_ERROR_TYPE: StaticType = exception_type(c"SystemError");
static ATTRIBUTE_ERROR_TYPE: StaticType = exception_type(c"AttributeError");
static MEMORY_ERROR_TYPE: StaticType = exception_type(c"MemoryError");

#[unsafe(no_mangle)]
pub static PyExc_IndexError: ExportedPtr = ExportedPtr(&raw const INDEX_ERROR_TYPE as *mut PyObject);
#[unsafe(no_mangle)]
pub static PyExc_TypeError: ExportedPtr = ExportedPtr(&raw const TYPE_ERROR_TYPE as *mut PyObject);
#[unsafe(no_mangle)]
pub static PyExc_ValueError: ExportedPtr =
    ExportedPtr(&raw const VALUE_ERROR_TYPE as *mut PyObject);
#[unsafe(no_mangle)]
pub static PyExc_SystemError: ExportedPtr =
    ExportedPtr(&raw const SYSTEM_ERROR_TYPE as *mut PyObject);
#[unsafe(no_mangle)]
pub static PyExc_AttributeError: ExportedPtr =
    ExportedPtr(&raw const ATTRIBUTE_ERROR_TYPE as *mut PyObject);
#[unsafe(no_mangle)]
pub static PyExc_MemoryError: ExportedPtr =
    ExportedPtr(&raw const MEMORY_ERROR_TYPE as *mut PyObject);

/// Borrowed pointer to the pending exception's type, or NULL.
#[unsafe(no_mangle)]
pub extern "C" fn PyErr_Occurred() -> *mut PyObject {
    PENDING.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(std::ptr::null_mut(), |exc| exc.kind.type_object())
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn PyErr_Clear() {
    let _ = take_exception();
}

/// # Safety
/// `message` must be NULL or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn PyErr_SetString(exc_type: *mut PyObject, message: *const c_char) {
    let kind = ExceptionKind::from_type_object(exc_type).unwrap_or(ExceptionKind::SystemError);
    let message = if message.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(message) }
            .to_string_lossy()
            .into_owned()
    };
    set_pending(PendingException::new(kind, message));
}
