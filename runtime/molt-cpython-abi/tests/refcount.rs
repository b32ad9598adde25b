mod common;

use std::process::Command;

use common::{host_items, ints, native, serial};
use molt_cpython_abi::ffi::{self, PyObject};
use molt_cpython_abi::*;
use molt_obj_model::{MoltObject, ObjectKind};

const DOUBLE_RELEASE_ENV: &str = "MOLT_ABI_TEST_DOUBLE_RELEASE";

#[test]
fn crossing_twice_reuses_the_shadow() {
    let _guard = serial();
    let t = host::new_tuple(&ints(&[1, 2]));
    let first = native(t);
    let second = native(t);
    assert_eq!(first, second);
    assert_eq!(unsafe { Py_REFCNT(first) }, 2);
    assert_eq!(host::native_refcnt(t), Some(2));
    unsafe {
        Py_DecRef(first);
        Py_DecRef(second);
    }
    host::release(t).unwrap();
    host::collect();
}

#[test]
fn native_references_keep_host_values_alive() {
    let _guard = serial();
    let t = host::new_tuple(&ints(&[5, 6]));
    let op = native(t);

    host::release(t).unwrap();
    let report = host::collect();
    assert_eq!(report.shadows_reclaimed, 0);
    assert_eq!(host::shadow_of(t), Some(op));
    assert_eq!(unsafe { PyTuple_Size(op) }, 2);
    assert_eq!(unsafe { host::from_native(op) }.unwrap(), t);
    host::release(t).unwrap();

    unsafe { Py_DecRef(op) };
    // Count zero alone does not free a heap value's shadow.
    assert_eq!(host::shadow_of(t), Some(op));
    let report = host::collect();
    assert!(report.shadows_reclaimed >= 1);
    assert!(host::shadow_of(t).is_none());
}

#[test]
fn immediate_shadows_are_freed_at_zero() {
    let _guard = serial();
    let value = MoltObject::from_int(424_242);
    let before = live_allocations();
    let op = native(value);
    assert_eq!(live_allocations(), before + 1);
    assert_eq!(unsafe { Py_TYPE(op) }, PyLong_Type.as_ptr());
    unsafe { Py_DecRef(op) };
    assert!(host::shadow_of(value).is_none());
    assert_eq!(live_allocations(), before);
}

#[test]
fn singletons_are_immortal() {
    let _guard = serial();
    let none = molt_none();
    let count = unsafe { Py_REFCNT(none) };
    assert_eq!(count, IMMORTAL_REFCNT);
    unsafe {
        for _ in 0..10 {
            Py_DecRef(none);
        }
        Py_IncRef(none);
        assert_eq!(Py_REFCNT(none), count);
    }
    assert_eq!(native(MoltObject::none()), none);
    assert_eq!(native(MoltObject::from_bool(true)), molt_true());
    assert_ne!(molt_true(), molt_false());
}

#[test]
fn new_ref_helpers_count_like_incref() {
    let _guard = serial();
    let t = host::new_tuple(&[]);
    let op = native(t);
    unsafe {
        assert_eq!(Py_NewRef(op), op);
        assert_eq!(Py_REFCNT(op), 2);
        assert_eq!(Py_XNewRef(op), op);
        assert_eq!(Py_REFCNT(op), 3);
        assert!(Py_XNewRef(std::ptr::null_mut()).is_null());
        Py_DecRef(std::ptr::null_mut());
        for _ in 0..3 {
            Py_DecRef(op);
        }
    }
    host::release(t).unwrap();
    host::collect();
}

#[test]
fn argument_frames_hold_one_reference_per_argument() {
    let _guard = serial();
    let t = host::new_tuple(&ints(&[1]));
    let big = MoltObject::from_int(515_151);
    let frame = host::to_native_borrowed(&[t, big, t]).unwrap();
    assert_eq!(frame.len(), 3);
    assert_eq!(frame.get(0), frame.get(2));
    assert_eq!(host::native_refcnt(t), Some(2));
    assert_eq!(host::native_refcnt(big), Some(1));
    let ptrs: Vec<*mut PyObject> = frame.as_ptrs().to_vec();
    assert_eq!(unsafe { PyTuple_Size(ptrs[0]) }, 1);

    drop(frame);
    assert_eq!(host::native_refcnt(t), Some(0));
    assert!(host::shadow_of(big).is_none());
    host::release(t).unwrap();
    host::collect();
    assert!(host::shadow_of(t).is_none());
}

#[test]
fn tuples_under_construction_are_unpublished() {
    let _guard = serial();
    let before = host::shadow_stats();
    unsafe {
        let t = PyTuple_New(1);
        assert_eq!(host::shadow_stats().unpublished, before.unpublished + 1);
        PyTuple_SET_ITEM(t, 0, native(MoltObject::from_int(3)));
        let value = host::from_native_steal(t).unwrap();
        assert_eq!(host::shadow_stats().unpublished, before.unpublished);
        assert_eq!(host_items(value), ints(&[3]));
        host::release(value).unwrap();
    }
    host::collect();
    assert_eq!(host::shadow_stats(), before);
}

#[test]
fn empty_slots_publish_as_none() {
    let _guard = serial();
    unsafe {
        let t = PyTuple_New(2);
        PyTuple_SET_ITEM(t, 1, native(MoltObject::from_int(8)));
        let value = host::from_native_steal(t).unwrap();
        assert_eq!(host_items(value), vec![MoltObject::none(), MoltObject::from_int(8)]);
        host::release(value).unwrap();
    }
    host::collect();
}

#[test]
fn nested_native_tuples_publish_together() {
    let _guard = serial();
    unsafe {
        let inner = PyTuple_New(1);
        PyTuple_SET_ITEM(inner, 0, native(MoltObject::from_int(1)));
        let outer = PyTuple_New(1);
        PyTuple_SET_ITEM(outer, 0, inner);
        let value = host::from_native_steal(outer).unwrap();
        let items = host_items(value);
        assert_eq!(items.len(), 1);
        assert_eq!(host_items(items[0]), ints(&[1]));
        assert_eq!(host::shadow_stats().unpublished, 0);
        host::release(value).unwrap();
    }
    host::collect();
}

#[test]
fn tuples_stored_into_published_tuples_reach_the_host() {
    let _guard = serial();
    let before = host::shadow_stats();
    let outer_value = host::new_tuple(&ints(&[1]));
    let outer = native(outer_value);
    unsafe {
        let inner = PyTuple_New(1);
        // Filled the way the C macro does it, without a bridge call.
        let slots = (&raw mut (*inner.cast::<ffi::PyTupleObject>()).ob_item).cast::<*mut PyObject>();
        *slots = native(MoltObject::from_int(5));
        assert_eq!(PyTuple_SetItem(outer, 0, inner), 0);

        assert_eq!(host::from_native(outer).unwrap(), outer_value);
        let items = host_items(outer_value);
        assert_eq!(items.len(), 1);
        assert_eq!(host_items(items[0]), ints(&[5]));
        assert_eq!(host::shadow_stats().unpublished, before.unpublished);
        Py_DecRef(outer);
    }
    host::release(outer_value).unwrap();
    host::collect();
    assert_eq!(host::shadow_stats(), before);
}

#[test]
fn dropped_native_tuples_are_reclaimed() {
    let _guard = serial();
    let before = live_allocations();
    let stats_before = host::shadow_stats();
    unsafe {
        let t = PyTuple_New(3);
        assert_eq!(live_allocations(), before + 1);
        PyTuple_SET_ITEM(t, 0, native(MoltObject::from_int(90)));
        Py_DecRef(t);
    }
    let report = host::collect();
    assert!(report.shadows_reclaimed >= 1);
    assert_eq!(live_allocations(), before);
    assert_eq!(host::shadow_stats(), stats_before);
}

#[test]
fn cycles_through_a_shadow_are_collected() {
    let _guard = serial();
    let before = host::shadow_stats();
    let list = host::new_list(&[]);
    let t = host::new_tuple(&[list]);
    host::with_heap(|heap| {
        let entry = heap.get_mut(list.as_heap_ref().unwrap()).unwrap();
        if let ObjectKind::List(items) = &mut entry.kind {
            items.push(t);
        }
    });
    let op = native(t);
    assert_eq!(host::native_refcnt(list), Some(1));
    unsafe { Py_DecRef(op) };
    host::release(t).unwrap();
    host::release(list).unwrap();

    // The list shadow is only held by the tuple's slot.
    let report = host::collect();
    assert!(report.shadows_reclaimed >= 2);
    assert!(host::shadow_of(t).is_none());
    assert!(host::shadow_of(list).is_none());
    assert_eq!(host::shadow_stats(), before);
}

#[test]
fn natively_held_cycle_members_survive() {
    let _guard = serial();
    let list = host::new_list(&[]);
    let t = host::new_tuple(&[list]);
    host::with_heap(|heap| {
        let entry = heap.get_mut(list.as_heap_ref().unwrap()).unwrap();
        if let ObjectKind::List(items) = &mut entry.kind {
            items.push(t);
        }
    });
    let op = native(t);
    let list_op = unsafe { PyTuple_GetItem(op, 0) };
    unsafe {
        Py_IncRef(list_op);
        Py_DecRef(op);
    }
    host::release(t).unwrap();
    host::release(list).unwrap();

    // An outside reference to the list keeps the whole cycle.
    let report = host::collect();
    assert_eq!(report.shadows_reclaimed, 0);
    assert_eq!(host::shadow_of(t), Some(op));
    assert_eq!(unsafe { Py_REFCNT(list_op) }, 2);

    unsafe { Py_DecRef(list_op) };
    host::collect();
    assert!(host::shadow_of(t).is_none());
    assert!(host::shadow_of(list).is_none());
}

#[test]
fn concurrent_callers_serialize_on_the_gil() {
    let _guard = serial();
    let handles: Vec<_> = (0..4)
        .map(|worker| {
            std::thread::spawn(move || {
                for round in 0..25 {
                    let base = 100_000 + worker * 1_000 + round * 2;
                    let t = host::new_tuple(&ints(&[base, base + 1]));
                    let op = native(t);
                    unsafe {
                        let slice = PyTuple_GetSlice(op, 1, 2);
                        let value = host::from_native_steal(slice).unwrap();
                        assert_eq!(host_items(value), ints(&[base + 1]));
                        host::release(value).unwrap();
                        Py_DecRef(op);
                    }
                    host::release(t).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    host::collect();
    assert_eq!(host::shadow_stats().unpublished, 0);
}

#[test]
fn gil_state_calls_nest() {
    let _guard = serial();
    let outer = PyGILState_Ensure();
    let inner = PyGILState_Ensure();
    // Exported calls re-enter the held GIL.
    let t = host::new_tuple(&[]);
    PyGILState_Release(inner);
    PyGILState_Release(outer);
    host::release(t).unwrap();
    host::collect();
}

/// Runs in a child process: a second release of a dead reference must
/// abort instead of corrupting the count.
#[test]
fn double_release_child() {
    if std::env::var_os(DOUBLE_RELEASE_ENV).is_none() {
        return;
    }
    let t = host::new_tuple(&ints(&[1]));
    let op = native(t);
    unsafe {
        Py_DecRef(op);
        Py_DecRef(op);
    }
    unreachable!("second release must abort");
}

#[test]
fn double_release_is_fatal() {
    let exe = std::env::current_exe().unwrap();
    let output = Command::new(exe)
        .args(["--exact", "double_release_child", "--nocapture", "--test-threads=1"])
        .env(DOUBLE_RELEASE_ENV, "1")
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Fatal Python error"), "stderr: {stderr}");
    assert!(stderr.contains("released with refcount 0"), "stderr: {stderr}");
}
