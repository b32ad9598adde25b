//! Bridge state: the host heap, the shadow table and the type registry,
//! behind one lock that is only taken with the GIL held and never across a
//! call into native hooks.

use std::collections::{HashMap, HashSet};

use molt_obj_model::{CollectStats, Heap, MoltObject, ObjectKind, ops};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config::{capi_trace, config};
use crate::errors::{BAD_INTERNAL_CALL, ExceptionKind, PendingException};
use crate::ffi::{Py_ssize_t, PyObject, PyTypeObject, T_OBJECT};
use crate::gil::{PyToken, gil_assert};
use crate::layout;
use crate::members::{FieldValue, read_field, write_field};
use crate::refcount::{IMMORTAL_REFCNT, retain};
use crate::shadow::{ShadowEntry, ShadowPtr, ShadowTable};
use crate::slots::{PyObject_Calloc, PyObject_Free};
use crate::types::{TypeRegistry, is_tuple_subtype, type_name};

pub(crate) struct AbiRuntime {
    pub(crate) heap: Heap,
    pub(crate) shadows: ShadowTable,
    pub(crate) types: TypeRegistry,
}

static RUNTIME: Lazy<Mutex<AbiRuntime>> = Lazy::new(|| Mutex::new(AbiRuntime::new()));

pub(crate) fn with_runtime<R>(_py: &PyToken<'_>, f: impl FnOnce(&mut AbiRuntime) -> R) -> R {
    gil_assert();
    let mut rt = RUNTIME.lock();
    f(&mut rt)
}

fn not_a_shadow(op: *mut PyObject) -> PendingException {
    PendingException::new(
        ExceptionKind::SystemError,
        format!("{op:p} is not an object known to the bridge"),
    )
}

impl AbiRuntime {
    fn new() -> Self {
        let mut rt = Self {
            heap: Heap::new(),
            shadows: ShadowTable::new(),
            types: TypeRegistry::with_builtins(),
        };
        for value in [
            MoltObject::none(),
            MoltObject::from_bool(true),
            MoltObject::from_bool(false),
        ] {
            if let Ok(op) = rt.materialize(value) {
                // SAFETY: freshly materialized header.
                unsafe { (*op).ob_refcnt = IMMORTAL_REFCNT };
                if let Some(entry) = rt.shadows.entry_mut(op) {
                    entry.immortal = true;
                }
            }
        }
        rt
    }

    pub(crate) fn type_ptr_of(&self, value: MoltObject) -> Result<*mut PyTypeObject, PendingException> {
        let type_id = self.heap.type_id_of(value)?;
        self.types.type_for_id(type_id).ok_or_else(|| {
            PendingException::new(
                ExceptionKind::SystemError,
                format!("host type id {type_id} has no native type object"),
            )
        })
    }

    pub(crate) fn value_of(&self, op: *mut PyObject) -> Result<MoltObject, PendingException> {
        self.shadows.value_of(op).ok_or_else(|| not_a_shadow(op))
    }

    /// Returns the shadow for `value`, creating it on first use. The count
    /// of an existing shadow is left alone; a new one starts at zero.
    pub(crate) fn materialize(&mut self, value: MoltObject) -> Result<*mut PyObject, PendingException> {
        if value.is_pending() {
            return Err(PendingException::new(ExceptionKind::SystemError, BAD_INTERNAL_CALL));
        }
        if let Some(op) = self.shadows.lookup_value(value) {
            self.refresh_length(op, value);
            return Ok(op);
        }
        let ty = self.type_ptr_of(value)?;
        let items = match value.as_heap_ref() {
            Some(_) => match &self.heap.entry_of(value)?.kind {
                ObjectKind::Tuple(items) => Some(items.clone()),
                _ => None,
            },
            None => None,
        };
        let nitems = items.as_ref().map_or(0, Vec::len);
        let size = if items.is_some() {
            // SAFETY: registered types are live.
            unsafe { layout::instance_size(ty, nitems) }
        } else {
            // SAFETY: as above.
            unsafe { (*ty).tp_basicsize.max(0) as usize }
        };
        let op = PyObject_Calloc(1, size).cast::<PyObject>();
        if op.is_null() {
            return Err(PendingException::new(ExceptionKind::MemoryError, "out of memory"));
        }
        // SAFETY: `op` is a zeroed block of at least the type's basic size.
        unsafe {
            (*op).ob_type = ty;
            if size >= std::mem::size_of::<crate::ffi::PyVarObject>() {
                let len = match value.as_heap_ref() {
                    Some(_) => self.heap.entry_of(value)?.kind.len(),
                    None => 0,
                };
                layout::set_ob_size(op, len as Py_ssize_t);
            }
        }
        self.shadows.insert(
            op,
            ShadowEntry {
                value,
                published: true,
                immortal: false,
            },
        );
        capi_trace!(
            "materialize {:#x} as {op:p} ({}, {size} bytes)",
            value.bits(),
            // SAFETY: registered types are live.
            unsafe { type_name(ty) }
        );
        if let Some(items) = items {
            for (i, item) in items.into_iter().enumerate() {
                let item_op = match self.materialize(item) {
                    Ok(item_op) => item_op,
                    Err(err) => {
                        self.discard_partial_tuple(op, i);
                        return Err(err);
                    }
                };
                // SAFETY: slot `i` is inside the allocation; the slot owns
                // the new reference.
                unsafe {
                    retain(item_op);
                    *layout::item_slot(op, i as Py_ssize_t) = item_op;
                }
            }
        }
        Ok(op)
    }

    fn discard_partial_tuple(&mut self, op: *mut PyObject, filled: usize) {
        self.shadows.remove(op);
        // SAFETY: the first `filled` slots hold references taken above.
        unsafe {
            for i in 0..filled {
                let item = layout::item(op, i as Py_ssize_t);
                if !item.is_null() && layout::refcnt(item) < IMMORTAL_REFCNT {
                    (*item).ob_refcnt -= 1;
                }
            }
            PyObject_Free(op.cast());
        }
    }

    /// Mutable host containers can change length between crossings.
    fn refresh_length(&self, op: *mut PyObject, value: MoltObject) {
        if let Ok(entry) = self.heap.entry_of(value) {
            if matches!(entry.kind, ObjectKind::List(_) | ObjectKind::Dict(_)) {
                // SAFETY: list and dict shadows carry an `ob_size` word.
                unsafe { layout::set_ob_size(op, entry.kind.len() as Py_ssize_t) };
            }
        }
    }

    /// Registers natively allocated memory as a new, unpublished tuple of
    /// type `ty` holding `nitems` empty slots. The header gets one reference.
    pub(crate) unsafe fn adopt(
        &mut self,
        op: *mut PyObject,
        ty: *mut PyTypeObject,
        nitems: usize,
    ) -> Result<(), PendingException> {
        unsafe {
            self.types.ready(ty)?;
            if !is_tuple_subtype(ty) {
                return Err(PendingException::new(
                    ExceptionKind::SystemError,
                    format!(
                        "cannot create '{}' instances from native code",
                        type_name(ty)
                    ),
                ));
            }
            if self.shadows.entry(op).is_some() {
                return Err(PendingException::new(
                    ExceptionKind::SystemError,
                    format!("{op:p} is already a live object"),
                ));
            }
            let host_type_id = self
                .types
                .info(ty)
                .map(|info| info.host_type_id)
                .ok_or_else(|| PendingException::new(ExceptionKind::SystemError, BAD_INTERNAL_CALL))?;
            let r = self
                .heap
                .alloc(host_type_id, ObjectKind::Tuple(vec![MoltObject::none(); nitems]));
            (*op).ob_refcnt = 1;
            (*op).ob_type = ty;
            layout::set_ob_size(op, nitems as Py_ssize_t);
            self.shadows.insert(
                op,
                ShadowEntry {
                    value: MoltObject::from_ref(r),
                    published: false,
                    immortal: false,
                },
            );
            capi_trace!("adopt {op:p} as '{}' with {nitems} slots", type_name(ty));
        }
        Ok(())
    }

    /// Copies the item slots of an unpublished tuple (and of unpublished
    /// tuples reachable from it) into their host tuples.
    pub(crate) unsafe fn publish(&mut self, op: *mut PyObject) -> Result<MoltObject, PendingException> {
        let value = self.value_of(op)?;
        let mut pending = vec![op];
        while let Some(cur) = pending.pop() {
            let Some(entry) = self.shadows.entry_mut(cur) else {
                continue;
            };
            if entry.published {
                continue;
            }
            entry.published = true;
            let target = entry.value;
            let Some(r) = target.as_heap_ref() else {
                continue;
            };
            // SAFETY: unpublished shadows are tuple layouts we adopted.
            let slots = unsafe { layout::items(cur) };
            let mut flushed = Vec::with_capacity(slots.len());
            for item in slots {
                if item.is_null() {
                    flushed.push(MoltObject::none());
                    continue;
                }
                match self.shadows.entry(item) {
                    Some(item_entry) => {
                        if !item_entry.published {
                            pending.push(item);
                        }
                        flushed.push(item_entry.value);
                    }
                    None => {
                        capi_trace!("publish {cur:p}: slot holds unknown pointer {item:p}");
                        flushed.push(MoltObject::none());
                    }
                }
            }
            let host_items = self.heap.tuple_items_mut(r)?;
            let n = host_items.len().min(flushed.len());
            host_items[..n].copy_from_slice(&flushed[..n]);
            capi_trace!("publish {cur:p} ({n} slots)");
        }
        Ok(value)
    }

    /// Mirrors a slot store into the host tuple behind `op`. A tuple still
    /// under construction that lands in a published one is published with it.
    pub(crate) fn write_through(&mut self, op: *mut PyObject, index: usize, item: *mut PyObject) {
        let Some(target) = self.shadows.entry(op).copied() else {
            return;
        };
        let new_value = if item.is_null() {
            MoltObject::none()
        } else {
            match self.shadows.entry(item).copied() {
                Some(item_entry) => {
                    if target.published && !item_entry.published {
                        // SAFETY: unpublished shadows are adopted tuple layouts.
                        if let Err(err) = unsafe { self.publish(item) } {
                            capi_trace!("publish {item:p} stored into {op:p} failed: {err}");
                        }
                    }
                    item_entry.value
                }
                None => return,
            }
        };
        let target = target.value;
        if let Some(r) = target.as_heap_ref() {
            if let Ok(items) = self.heap.tuple_items_mut(r) {
                if let Some(slot) = items.get_mut(index) {
                    *slot = new_value;
                }
            }
        }
    }

    /// Returns true when the shadow should be torn down now.
    pub(crate) fn on_zero(&mut self, op: *mut PyObject) -> bool {
        let Some(entry) = self.shadows.entry(op) else {
            capi_trace!("refcount of unknown object {op:p} reached zero");
            return false;
        };
        if entry.immortal || !entry.value.is_immediate() {
            return false;
        }
        self.shadows.remove(op);
        true
    }

    /// One collector pass. Returns the shadows whose host values were swept;
    /// they are already out of the table and must be deallocated by the
    /// caller once the lock is released.
    pub(crate) fn collect_pass(&mut self) -> (Vec<ShadowPtr>, CollectStats) {
        let internal = self.internal_references();
        // SAFETY: every registered shadow is live memory.
        let roots = unsafe { self.shadows.retained_heap_refs(&internal) };
        let (swept, stats) = self.heap.collect(&roots);
        let mut doomed = Vec::new();
        for r in swept {
            if let Some(ptr) = self.shadows.remove_value(MoltObject::from_ref(r)) {
                doomed.push(ptr);
            }
        }
        // SAFETY: doomed shadows are still allocated; nothing frees them
        // before the caller does.
        unsafe { break_doomed_cycles(&doomed) };
        capi_trace!(
            "collect: roots={} marked={} swept={} shadows={}",
            roots.len(),
            stats.marked,
            stats.swept,
            doomed.len()
        );
        (doomed, stats)
    }

    /// Counts, per shadow address, the references held by slots of published
    /// tuple shadows whose host tuple holds the same value at that index.
    /// The host traces those edges itself. Unpublished slots and object
    /// members have no host edge and keep counting as native references.
    fn internal_references(&self) -> HashMap<usize, Py_ssize_t> {
        let mut internal = HashMap::new();
        for (op, entry) in self.shadows.iter() {
            if !entry.published || entry.immortal {
                continue;
            }
            let Ok(host_items) = self.heap.tuple_items(entry.value) else {
                continue;
            };
            // SAFETY: registered shadows are live and carry a type pointer.
            if !unsafe { is_tuple_subtype(layout::type_of(op)) } {
                continue;
            }
            // SAFETY: tuple shadows own `ob_size` item slots.
            let slots = unsafe { layout::items(op) };
            for (slot, host_item) in slots.iter().zip(host_items) {
                if slot.is_null() {
                    continue;
                }
                if self.shadows.value_of(*slot) == Some(*host_item) {
                    *internal.entry(*slot as usize).or_insert(0) += 1;
                }
            }
        }
        internal
    }

    /// Consistency checks run before a tuple shadow is freed.
    pub(crate) unsafe fn verify_teardown(
        &self,
        op: *mut PyObject,
        items: &[*mut PyObject],
    ) -> Result<(), String> {
        let count = unsafe { layout::refcnt(op) };
        if count != 0 {
            return Err(format!("deallocating {op:p} with refcount {count}"));
        }
        for (i, item) in items.iter().enumerate() {
            if item.is_null() {
                continue;
            }
            if self.shadows.entry(*item).is_none() || unsafe { layout::refcnt(*item) } <= 0 {
                return Err(format!(
                    "deallocating {op:p}: item {i} ({item:p}) is not a retained object"
                ));
            }
        }
        Ok(())
    }

    fn member_address(
        &self,
        op: *mut PyObject,
        name: &str,
    ) -> Result<(*mut std::ffi::c_void, libc::c_int, bool), PendingException> {
        // SAFETY: `op` is a registered shadow.
        let ty = unsafe { layout::type_of(op) };
        let nitems = unsafe { layout::ob_size(op) }.max(0) as usize;
        let found = self
            .types
            .chain_members(ty)
            .into_iter()
            .find(|(member, _)| member.name == name)
            .map(|(member, prefix)| (member.clone(), prefix));
        let Some((member, prefix)) = found else {
            return Err(PendingException::new(
                ExceptionKind::AttributeError,
                format!(
                    "'{}' object has no attribute '{name}'",
                    unsafe { type_name(ty) }
                ),
            ));
        };
        // SAFETY: offsets were validated against the type when it was readied.
        unsafe {
            let ext = layout::extension_offset(ty, prefix, nitems);
            let offset = layout::relocate_member_offset(member.declared_offset, prefix, ext);
            Ok((layout::byte_offset(op, offset), member.type_code, member.readonly))
        }
    }

    pub(crate) fn member_get(&mut self, value: MoltObject, name: &str) -> Result<MoltObject, PendingException> {
        let op = self.materialize(value)?;
        let (addr, type_code, _) = self.member_address(op, name)?;
        // SAFETY: `addr` is inside the instance.
        match unsafe { read_field(addr, type_code) } {
            FieldValue::Int(v) => Ok(MoltObject::from_int(v)),
            FieldValue::Float(v) => Ok(MoltObject::from_float(v)),
            FieldValue::Object(p) if p.is_null() => Ok(MoltObject::none()),
            FieldValue::Object(p) => self.value_of(p),
        }
    }

    /// Stores a member. For object members the previous occupant is
    /// returned; the caller releases it after dropping the lock.
    pub(crate) fn member_set(
        &mut self,
        value: MoltObject,
        name: &str,
        new_value: MoltObject,
    ) -> Result<Option<*mut PyObject>, PendingException> {
        let op = self.materialize(value)?;
        let (addr, type_code, readonly) = self.member_address(op, name)?;
        if readonly {
            return Err(PendingException::new(ExceptionKind::AttributeError, "readonly attribute"));
        }
        let field = if type_code == T_OBJECT {
            let item = self.materialize(new_value)?;
            FieldValue::Object(item)
        } else if let Some(v) = new_value.as_index() {
            FieldValue::Int(v)
        } else if let Some(v) = new_value.as_float() {
            FieldValue::Float(v)
        } else {
            return Err(PendingException::new(
                ExceptionKind::TypeError,
                format!(
                    "attribute '{name}' cannot be set to a '{}'",
                    ops::value_type_name(&self.heap, new_value)
                ),
            ));
        };
        // SAFETY: `addr` is inside the instance.
        let old = unsafe { write_field(addr, type_code, field)? };
        if let FieldValue::Object(item) = field {
            // SAFETY: the field owns a reference to its object.
            unsafe { retain(item) };
        }
        Ok(old.filter(|p| !p.is_null()))
    }

    /// Object members of a tuple shadow, read for release at teardown.
    pub(crate) unsafe fn object_member_values(&self, op: *mut PyObject) -> Vec<*mut PyObject> {
        unsafe {
            let ty = layout::type_of(op);
            let nitems = layout::ob_size(op).max(0) as usize;
            self.types
                .chain_members(ty)
                .into_iter()
                .filter(|(member, _)| member.type_code == T_OBJECT)
                .map(|(member, prefix)| {
                    let ext = layout::extension_offset(ty, prefix, nitems);
                    let offset = layout::relocate_member_offset(member.declared_offset, prefix, ext);
                    layout::byte_offset(op, offset).cast::<*mut PyObject>().read_unaligned()
                })
                .filter(|p| !p.is_null())
                .collect()
        }
    }

    /// Items of a host sequence as shadows, for constructors that copy an
    /// iterable. Tuples are read from their slots by the caller instead.
    pub(crate) fn sequence_items(&mut self, op: *mut PyObject) -> Result<Vec<*mut PyObject>, PendingException> {
        let value = self.value_of(op)?;
        let chars: Option<Vec<String>>;
        let mut values: Vec<MoltObject> = match self.heap.entry_of(value).map(|e| &e.kind) {
            Ok(ObjectKind::List(items)) | Ok(ObjectKind::Tuple(items)) => {
                chars = None;
                items.clone()
            }
            Ok(ObjectKind::Dict(pairs)) => {
                chars = None;
                pairs.iter().map(|(k, _)| *k).collect()
            }
            Ok(ObjectKind::Str(s)) => {
                chars = Some(s.chars().map(String::from).collect());
                Vec::new()
            }
            Err(_) => {
                return Err(PendingException::new(
                    ExceptionKind::TypeError,
                    format!(
                        "'{}' object is not iterable",
                        ops::value_type_name(&self.heap, value)
                    ),
                ));
            }
        };
        if let Some(chars) = chars {
            values = chars
                .iter()
                .map(|c| MoltObject::from_ref(self.heap.alloc_str(c)))
                .collect();
        }
        values.into_iter().map(|v| self.materialize(v)).collect()
    }

    pub(crate) fn extension_fields(&self, op: *mut PyObject) -> Option<*mut std::ffi::c_void> {
        // SAFETY: `op` is a live shadow.
        let ty = unsafe { layout::type_of(op) };
        let info = self.types.info(ty)?;
        if info.ext_size == 0 {
            return None;
        }
        unsafe {
            let nitems = layout::ob_size(op).max(0) as usize;
            let offset = layout::extension_offset(ty, info.prefix_size, nitems);
            Some(layout::byte_offset(op, offset))
        }
    }

    pub(crate) fn should_auto_collect(&self) -> bool {
        let threshold = config().gc_threshold;
        threshold > 0 && self.heap.allocs_since_collect() >= threshold
    }
}

/// Drops the references doomed tuple shadows hold on each other so every
/// doomed shadow reaches a zero count before it is freed. References to
/// surviving shadows are left for the normal teardown to release.
unsafe fn break_doomed_cycles(doomed: &[ShadowPtr]) {
    let addrs: HashSet<usize> = doomed.iter().map(|ptr| ptr.0 as usize).collect();
    for ptr in doomed {
        let op = ptr.0;
        unsafe {
            if !is_tuple_subtype(layout::type_of(op)) {
                continue;
            }
            for i in 0..layout::ob_size(op) {
                let slot = layout::item_slot(op, i);
                let item = *slot;
                if !item.is_null() && addrs.contains(&(item as usize)) {
                    *slot = std::ptr::null_mut();
                    (*item).ob_refcnt -= 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialize_is_idempotent() {
        let _guard = crate::TEST_MUTEX.lock();
        crate::with_gil_entry!(_py, {
            with_runtime(_py, |rt| {
                let r = rt.heap.alloc_tuple(&[MoltObject::from_int(1), MoltObject::from_int(2)]);
                rt.heap.retain(MoltObject::from_ref(r)).unwrap();
                let value = MoltObject::from_ref(r);
                let first = rt.materialize(value).unwrap();
                let second = rt.materialize(value).unwrap();
                assert_eq!(first, second);
                unsafe {
                    assert_eq!(layout::refcnt(first), 0);
                    assert_eq!(layout::ob_size(first), 2);
                    let item = layout::item(first, 1);
                    assert_eq!(layout::refcnt(item), 1);
                    assert_eq!(rt.value_of(item).unwrap(), MoltObject::from_int(2));
                }
                rt.heap.release(value).unwrap();
            });
        });
    }

    #[test]
    fn singletons_are_immortal() {
        let _guard = crate::TEST_MUTEX.lock();
        crate::with_gil_entry!(_py, {
            with_runtime(_py, |rt| {
                let none = rt.materialize(MoltObject::none()).unwrap();
                assert!(rt.shadows.entry(none).unwrap().immortal);
                assert_eq!(unsafe { layout::refcnt(none) }, IMMORTAL_REFCNT);
                assert!(!rt.on_zero(none));
            });
        });
    }

    #[test]
    fn list_shadows_track_length() {
        let _guard = crate::TEST_MUTEX.lock();
        crate::with_gil_entry!(_py, {
            with_runtime(_py, |rt| {
                let r = rt.heap.alloc_list(&[MoltObject::from_int(1)]);
                let value = MoltObject::from_ref(r);
                rt.heap.retain(value).unwrap();
                let op = rt.materialize(value).unwrap();
                assert_eq!(unsafe { layout::ob_size(op) }, 1);
                if let Ok(entry) = rt.heap.get_mut(r) {
                    if let ObjectKind::List(items) = &mut entry.kind {
                        items.push(MoltObject::from_int(2));
                    }
                }
                assert_eq!(rt.materialize(value).unwrap(), op);
                assert_eq!(unsafe { layout::ob_size(op) }, 2);
                rt.heap.release(value).unwrap();
            });
        });
    }
}
