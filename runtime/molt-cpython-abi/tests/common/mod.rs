#![allow(dead_code)]

use molt_cpython_abi::ffi::PyObject;
use molt_cpython_abi::{ExceptionKind, PendingException, host, take_exception};
use molt_obj_model::MoltObject;
use parking_lot::{Mutex, MutexGuard};

/// The bridge runtime is process-global; tests in one binary take turns.
static SERIAL: Mutex<()> = Mutex::new(());

pub fn serial() -> MutexGuard<'static, ()> {
    let guard = SERIAL.lock();
    let _ = take_exception();
    guard
}

pub fn native(value: MoltObject) -> *mut PyObject {
    host::to_native(value).unwrap()
}

pub fn native_str(s: &str) -> (MoltObject, *mut PyObject) {
    let value = host::new_str(s);
    (value, native(value))
}

pub fn expect_exception(kind: ExceptionKind) -> PendingException {
    let exc = take_exception().expect("an exception should be pending");
    assert_eq!(exc.kind, kind, "unexpected exception: {exc}");
    exc
}

pub fn host_items(value: MoltObject) -> Vec<MoltObject> {
    host::with_heap(|heap| heap.tuple_items(value).map(<[_]>::to_vec)).unwrap()
}

pub fn ints(values: &[i64]) -> Vec<MoltObject> {
    values.iter().map(|v| MoltObject::from_int(*v)).collect()
}
