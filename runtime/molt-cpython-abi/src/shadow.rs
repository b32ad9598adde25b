//! Bookkeeping for native projections of host values.
//!
//! Every shadow is indexed twice: by the host value it projects (so
//! projecting the same value again yields the same address) and by address
//! (so a pointer coming back from native code resolves to its host value).

use std::collections::HashMap;

use molt_obj_model::{HeapRef, MoltObject};

use crate::ffi::{Py_ssize_t, PyObject};
use crate::layout;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ShadowPtr(pub(crate) *mut PyObject);

// SAFETY: shadows are only touched while the GIL is held.
unsafe impl Send for ShadowPtr {}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ShadowEntry {
    pub(crate) value: MoltObject,
    /// False while a natively created tuple is still inside its constructor
    /// window; its item slots have not been copied to the host yet.
    pub(crate) published: bool,
    pub(crate) immortal: bool,
}

#[derive(Default)]
pub(crate) struct ShadowTable {
    by_value: HashMap<u64, ShadowPtr>,
    by_addr: HashMap<usize, ShadowEntry>,
}

impl ShadowTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub(crate) fn lookup_value(&self, value: MoltObject) -> Option<*mut PyObject> {
        self.by_value.get(&value.bits()).map(|ptr| ptr.0)
    }

    pub(crate) fn entry(&self, op: *mut PyObject) -> Option<&ShadowEntry> {
        self.by_addr.get(&(op as usize))
    }

    pub(crate) fn entry_mut(&mut self, op: *mut PyObject) -> Option<&mut ShadowEntry> {
        self.by_addr.get_mut(&(op as usize))
    }

    pub(crate) fn value_of(&self, op: *mut PyObject) -> Option<MoltObject> {
        self.entry(op).map(|entry| entry.value)
    }

    pub(crate) fn insert(&mut self, op: *mut PyObject, entry: ShadowEntry) {
        self.by_value.insert(entry.value.bits(), ShadowPtr(op));
        self.by_addr.insert(op as usize, entry);
    }

    /// Forgets the shadow at `op`; the memory itself is untouched.
    pub(crate) fn remove(&mut self, op: *mut PyObject) -> Option<ShadowEntry> {
        let entry = self.by_addr.remove(&(op as usize))?;
        self.by_value.remove(&entry.value.bits());
        Some(entry)
    }

    pub(crate) fn remove_value(&mut self, value: MoltObject) -> Option<ShadowPtr> {
        let ptr = self.by_value.remove(&value.bits())?;
        self.by_addr.remove(&(ptr.0 as usize));
        Some(ptr)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (*mut PyObject, &ShadowEntry)> + '_ {
        self.by_addr
            .iter()
            .map(|(addr, entry)| (*addr as *mut PyObject, entry))
    }

    /// Heap values whose shadows native code still holds references to.
    /// These are extra roots for the host collector. `internal` counts the
    /// references a shadow receives from the slots of other shadows that the
    /// host already sees as edges; those do not keep a value alive.
    pub(crate) unsafe fn retained_heap_refs(
        &self,
        internal: &HashMap<usize, Py_ssize_t>,
    ) -> Vec<HeapRef> {
        self.by_addr
            .iter()
            .filter(|(addr, entry)| {
                let held = internal.get(*addr).copied().unwrap_or(0);
                !entry.immortal && unsafe { layout::refcnt(**addr as *mut PyObject) } > held
            })
            .filter_map(|(_, entry)| entry.value.as_heap_ref())
            .collect()
    }

    pub(crate) fn unpublished(&self) -> usize {
        self.by_addr.values().filter(|entry| !entry.published).count()
    }
}
