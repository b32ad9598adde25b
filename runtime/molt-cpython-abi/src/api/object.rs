use std::ffi::c_void;

use molt_obj_model::MoltObject;

use crate::ffi::PyObject;
use crate::runtime::with_runtime;

fn singleton(value: MoltObject) -> *mut PyObject {
    crate::with_gil_entry!(_py, {
        with_runtime(_py, |rt| rt.shadows.lookup_value(value)).unwrap_or(std::ptr::null_mut())
    })
}

/// Borrowed reference to the immortal `None` shadow.
#[unsafe(no_mangle)]
pub extern "C" fn molt_none() -> *mut PyObject {
    singleton(MoltObject::none())
}

#[unsafe(no_mangle)]
pub extern "C" fn molt_true() -> *mut PyObject {
    singleton(MoltObject::from_bool(true))
}

#[unsafe(no_mangle)]
pub extern "C" fn molt_false() -> *mut PyObject {
    singleton(MoltObject::from_bool(false))
}

/// Start of the subclass fields of `op`, which sit after its item array.
/// NULL when the type declares none.
///
/// # Safety
/// `op` must be a live object.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn molt_extension_fields(op: *mut PyObject) -> *mut c_void {
    if op.is_null() {
        return std::ptr::null_mut();
    }
    crate::with_gil_entry!(_py, {
        with_runtime(_py, |rt| rt.extension_fields(op)).unwrap_or(std::ptr::null_mut())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refcount::{IMMORTAL_REFCNT, Py_DecRef, Py_IncRef, Py_REFCNT};

    #[test]
    fn singletons_survive_any_number_of_releases() {
        let _guard = crate::TEST_MUTEX.lock();
        let none = molt_none();
        assert!(!none.is_null());
        assert_ne!(none, molt_true());
        assert_ne!(molt_true(), molt_false());
        unsafe {
            Py_IncRef(none);
            for _ in 0..3 {
                Py_DecRef(none);
            }
            assert_eq!(Py_REFCNT(none), IMMORTAL_REFCNT);
        }
    }
}
