use std::cell::{Cell, RefCell};

use libc::c_int;
use parking_lot::{Mutex, MutexGuard};

static ABI_GIL: Mutex<()> = Mutex::new(());

thread_local! {
    static GIL_DEPTH: Cell<usize> = const { Cell::new(0) };
    static GIL_GUARD: RefCell<Option<MutexGuard<'static, ()>>> = const { RefCell::new(None) };
}

/// Reentrant hold on the bridge's interpreter lock. Only the outermost guard
/// on a thread takes the mutex.
pub(crate) struct GilGuard {
    _marker: (),
}

/// Proof that the current thread holds the GIL.
pub(crate) struct PyToken<'gil> {
    _guard: &'gil GilGuard,
}

fn acquire() {
    let needs_lock = match GIL_DEPTH.try_with(|depth| {
        let current = depth.get();
        depth.set(current + 1);
        current == 0
    }) {
        Ok(needs_lock) => needs_lock,
        Err(_) => return,
    };
    if needs_lock {
        let guard = ABI_GIL.lock();
        let stored = GIL_GUARD
            .try_with(|slot| {
                *slot.borrow_mut() = Some(guard);
            })
            .is_ok();
        if !stored {
            let _ = GIL_DEPTH.try_with(|depth| {
                depth.set(depth.get().saturating_sub(1));
            });
        }
    }
}

fn release() {
    let should_release = match GIL_DEPTH.try_with(|depth| {
        let current = depth.get();
        let next = current.saturating_sub(1);
        depth.set(next);
        current > 0 && next == 0
    }) {
        Ok(should_release) => should_release,
        Err(_) => return,
    };
    if should_release {
        let _ = GIL_GUARD.try_with(|slot| {
            let _ = slot.borrow_mut().take();
        });
    }
}

impl GilGuard {
    pub(crate) fn new() -> Self {
        acquire();
        Self { _marker: () }
    }

    pub(crate) fn token(&self) -> PyToken<'_> {
        PyToken { _guard: self }
    }
}

impl Drop for GilGuard {
    fn drop(&mut self) {
        release();
    }
}

pub(crate) fn gil_held() -> bool {
    GIL_DEPTH.try_with(|depth| depth.get() > 0).unwrap_or(false)
}

pub(crate) fn gil_assert() {
    debug_assert!(gil_held(), "GIL required for bridge state");
}

pub const PyGILState_LOCKED: c_int = 0;
pub const PyGILState_UNLOCKED: c_int = 1;

/// Lets a thread that did not enter through the bridge call the C API.
#[unsafe(no_mangle)]
pub extern "C" fn PyGILState_Ensure() -> c_int {
    let state = if gil_held() {
        PyGILState_LOCKED
    } else {
        PyGILState_UNLOCKED
    };
    acquire();
    state
}

#[unsafe(no_mangle)]
pub extern "C" fn PyGILState_Release(_state: c_int) {
    release();
}

#[macro_export]
#[doc(hidden)]
macro_rules! with_gil_entry {
    ($py:ident, $body:block) => {{
        let _gil_guard = $crate::gil::GilGuard::new();
        let $py = _gil_guard.token();
        let $py = &$py;
        $body
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gil_depth_tracks_nesting() {
        let _guard = crate::TEST_MUTEX.lock();
        let start = GIL_DEPTH.with(|depth| depth.get());
        assert_eq!(gil_held(), start > 0);
        {
            let _g1 = GilGuard::new();
            assert_eq!(GIL_DEPTH.with(|depth| depth.get()), start + 1);
            assert!(gil_held());
            {
                let _g2 = GilGuard::new();
                assert_eq!(GIL_DEPTH.with(|depth| depth.get()), start + 2);
            }
            assert_eq!(GIL_DEPTH.with(|depth| depth.get()), start + 1);
        }
        assert_eq!(GIL_DEPTH.with(|depth| depth.get()), start);
    }

    #[test]
    fn gil_state_pairs_with_guards() {
        let _guard = crate::TEST_MUTEX.lock();
        assert!(!gil_held());
        let state = PyGILState_Ensure();
        assert_eq!(state, PyGILState_UNLOCKED);
        {
            let _inner = GilGuard::new();
            assert_eq!(PyGILState_Ensure(), PyGILState_LOCKED);
            PyGILState_Release(PyGILState_LOCKED);
        }
        assert!(gil_held());
        PyGILState_Release(state);
        assert!(!gil_held());
    }

    #[test]
    fn other_threads_wait_for_the_gil() {
        let _guard = crate::TEST_MUTEX.lock();
        let held = GilGuard::new();
        let handle = std::thread::spawn(|| ABI_GIL.try_lock().is_none());
        assert!(handle.join().unwrap());
        drop(held);
        let handle = std::thread::spawn(|| ABI_GIL.try_lock().is_some());
        assert!(handle.join().unwrap());
    }
}
