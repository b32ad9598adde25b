use std::fmt;

use crate::{
    MoltObject, TYPE_ID_BOOL, TYPE_ID_DICT, TYPE_ID_FLOAT, TYPE_ID_INT, TYPE_ID_LIST,
    TYPE_ID_NONE, TYPE_ID_STRING, TYPE_ID_TUPLE,
};

const REF_INDEX_BITS: u64 = 32;
const REF_GEN_BITS: u64 = 16;
const REF_INDEX_MASK: u64 = (1u64 << REF_INDEX_BITS) - 1;
const REF_GEN_MASK: u64 = (1u64 << REF_GEN_BITS) - 1;

/// Generation-checked reference to a heap slot. A reference whose slot has
/// been swept and reused no longer resolves.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapRef {
    index: u32,
    generation: u16,
}

impl HeapRef {
    pub fn new(index: u32, generation: u16) -> Self {
        Self { index, generation }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u16 {
        self.generation
    }

    pub fn to_bits(self) -> u64 {
        ((self.generation as u64) << REF_INDEX_BITS) | (self.index as u64)
    }

    pub fn from_bits(bits: u64) -> Option<Self> {
        let index = (bits & REF_INDEX_MASK) as u32;
        let generation = ((bits >> REF_INDEX_BITS) & REF_GEN_MASK) as u16;
        if generation == 0 {
            return None;
        }
        Some(Self { index, generation })
    }
}

fn next_gen(generation: u16) -> u16 {
    let next = generation.wrapping_add(1);
    if next == 0 { 1 } else { next }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ObjectKind {
    Str(String),
    Tuple(Vec<MoltObject>),
    List(Vec<MoltObject>),
    Dict(Vec<(MoltObject, MoltObject)>),
}

impl ObjectKind {
    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Str(_) => "str",
            ObjectKind::Tuple(_) => "tuple",
            ObjectKind::List(_) => "list",
            ObjectKind::Dict(_) => "dict",
        }
    }

    /// Length as reported by `len()`.
    pub fn len(&self) -> usize {
        match self {
            ObjectKind::Str(s) => s.chars().count(),
            ObjectKind::Tuple(items) | ObjectKind::List(items) => items.len(),
            ObjectKind::Dict(pairs) => pairs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn for_each_child(&self, mut f: impl FnMut(MoltObject)) {
        match self {
            ObjectKind::Str(_) => {}
            ObjectKind::Tuple(items) | ObjectKind::List(items) => {
                items.iter().copied().for_each(&mut f)
            }
            ObjectKind::Dict(pairs) => {
                for (k, v) in pairs {
                    f(*k);
                    f(*v);
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct HeapEntry {
    pub type_id: u32,
    pub kind: ObjectKind,
    roots: u32,
    marked: bool,
}

impl HeapEntry {
    pub fn roots(&self) -> u32 {
        self.roots
    }
}

struct HeapSlot {
    generation: u16,
    entry: Option<HeapEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeapError {
    StaleRef(HeapRef),
    NotHeapValue(MoltObject),
    WrongKind {
        expected: &'static str,
        found: &'static str,
    },
    RootUnderflow(HeapRef),
    IndexOutOfRange {
        what: &'static str,
        index: i64,
        len: usize,
    },
    ValueNotFound(&'static str),
    Unorderable {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },
    ZeroStep,
}

impl HeapError {
    /// Name of the host exception this error surfaces as.
    pub fn exception_kind(&self) -> &'static str {
        match self {
            HeapError::IndexOutOfRange { .. } => "IndexError",
            HeapError::ValueNotFound(_) | HeapError::ZeroStep => "ValueError",
            HeapError::WrongKind { .. }
            | HeapError::NotHeapValue(_)
            | HeapError::Unorderable { .. } => "TypeError",
            HeapError::StaleRef(_) | HeapError::RootUnderflow(_) => "SystemError",
        }
    }
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::StaleRef(r) => {
                write!(f, "stale heap reference {}:{}", r.index, r.generation)
            }
            HeapError::NotHeapValue(obj) => {
                write!(f, "value {:#x} does not live on the heap", obj.bits())
            }
            HeapError::WrongKind { expected, found } => {
                write!(f, "expected {expected}, got {found}")
            }
            HeapError::RootUnderflow(r) => {
                write!(f, "release of unrooted heap value {}:{}", r.index, r.generation)
            }
            HeapError::IndexOutOfRange { what, .. } => write!(f, "{what} index out of range"),
            HeapError::ValueNotFound(what) => write!(f, "{what}(x): x not in tuple"),
            HeapError::Unorderable { op, lhs, rhs } => write!(
                f,
                "'{op}' not supported between instances of '{lhs}' and '{rhs}'"
            ),
            HeapError::ZeroStep => f.write_str("slice step cannot be zero"),
        }
    }
}

impl std::error::Error for HeapError {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CollectStats {
    pub marked: usize,
    pub swept: usize,
}

/// Host heap. Values are kept alive by root counts (host strong references)
/// or by reachability from a rooted value; everything else is reclaimed by
/// [`Heap::collect`].
pub struct Heap {
    slots: Vec<HeapSlot>,
    free: Vec<u32>,
    live: usize,
    allocs_since_collect: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            allocs_since_collect: 0,
        }
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn allocs_since_collect(&self) -> usize {
        self.allocs_since_collect
    }

    /// Allocates an unrooted value. It survives only while reachable or
    /// until the next collection.
    pub fn alloc(&mut self, type_id: u32, kind: ObjectKind) -> HeapRef {
        let entry = HeapEntry {
            type_id,
            kind,
            roots: 0,
            marked: false,
        };
        self.live += 1;
        self.allocs_since_collect += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = next_gen(slot.generation);
            slot.entry = Some(entry);
            return HeapRef::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(HeapSlot {
            generation: 1,
            entry: Some(entry),
        });
        HeapRef::new(index, 1)
    }

    pub fn alloc_str(&mut self, s: &str) -> HeapRef {
        self.alloc(TYPE_ID_STRING, ObjectKind::Str(s.to_owned()))
    }

    pub fn alloc_tuple(&mut self, items: &[MoltObject]) -> HeapRef {
        self.alloc(TYPE_ID_TUPLE, ObjectKind::Tuple(items.to_vec()))
    }

    pub fn alloc_list(&mut self, items: &[MoltObject]) -> HeapRef {
        self.alloc(TYPE_ID_LIST, ObjectKind::List(items.to_vec()))
    }

    pub fn alloc_dict(&mut self, pairs: &[(MoltObject, MoltObject)]) -> HeapRef {
        self.alloc(TYPE_ID_DICT, ObjectKind::Dict(pairs.to_vec()))
    }

    pub fn contains(&self, r: HeapRef) -> bool {
        self.get(r).is_ok()
    }

    pub fn get(&self, r: HeapRef) -> Result<&HeapEntry, HeapError> {
        let slot = self
            .slots
            .get(r.index as usize)
            .ok_or(HeapError::StaleRef(r))?;
        if slot.generation != r.generation {
            return Err(HeapError::StaleRef(r));
        }
        slot.entry.as_ref().ok_or(HeapError::StaleRef(r))
    }

    pub fn get_mut(&mut self, r: HeapRef) -> Result<&mut HeapEntry, HeapError> {
        let slot = self
            .slots
            .get_mut(r.index as usize)
            .ok_or(HeapError::StaleRef(r))?;
        if slot.generation != r.generation {
            return Err(HeapError::StaleRef(r));
        }
        slot.entry.as_mut().ok_or(HeapError::StaleRef(r))
    }

    pub fn entry_of(&self, obj: MoltObject) -> Result<&HeapEntry, HeapError> {
        let r = obj.as_heap_ref().ok_or(HeapError::NotHeapValue(obj))?;
        self.get(r)
    }

    /// Host type id of any value, immediate or heap-allocated.
    pub fn type_id_of(&self, obj: MoltObject) -> Result<u32, HeapError> {
        if obj.is_int() {
            return Ok(TYPE_ID_INT);
        }
        if obj.is_bool() {
            return Ok(TYPE_ID_BOOL);
        }
        if obj.is_none() {
            return Ok(TYPE_ID_NONE);
        }
        if obj.is_float() {
            return Ok(TYPE_ID_FLOAT);
        }
        Ok(self.entry_of(obj)?.type_id)
    }

    pub fn tuple_items(&self, obj: MoltObject) -> Result<&[MoltObject], HeapError> {
        match &self.entry_of(obj)?.kind {
            ObjectKind::Tuple(items) => Ok(items),
            other => Err(HeapError::WrongKind {
                expected: "tuple",
                found: other.name(),
            }),
        }
    }

    /// Mutable access to tuple storage. Only the native construction window
    /// and the checked slot store use this; tuples are otherwise immutable.
    pub fn tuple_items_mut(&mut self, r: HeapRef) -> Result<&mut Vec<MoltObject>, HeapError> {
        match &mut self.get_mut(r)?.kind {
            ObjectKind::Tuple(items) => Ok(items),
            other => Err(HeapError::WrongKind {
                expected: "tuple",
                found: other.name(),
            }),
        }
    }

    pub fn str_value(&self, obj: MoltObject) -> Result<&str, HeapError> {
        match &self.entry_of(obj)?.kind {
            ObjectKind::Str(s) => Ok(s),
            other => Err(HeapError::WrongKind {
                expected: "str",
                found: other.name(),
            }),
        }
    }

    /// Adds a host root. Immediates carry no heap identity and are ignored.
    pub fn retain(&mut self, obj: MoltObject) -> Result<(), HeapError> {
        let Some(r) = obj.as_heap_ref() else {
            return Ok(());
        };
        let entry = self.get_mut(r)?;
        entry.roots += 1;
        Ok(())
    }

    pub fn release(&mut self, obj: MoltObject) -> Result<(), HeapError> {
        let Some(r) = obj.as_heap_ref() else {
            return Ok(());
        };
        let entry = self.get_mut(r)?;
        if entry.roots == 0 {
            return Err(HeapError::RootUnderflow(r));
        }
        entry.roots -= 1;
        Ok(())
    }

    /// Mark-sweep collection. `extra_roots` are values held outside the host
    /// (for example by native code); stale extras are ignored. Returns the
    /// references that were reclaimed.
    pub fn collect(
        &mut self,
        extra_roots: &[HeapRef],
    ) -> (Vec<HeapRef>, CollectStats) {
        let mut stats = CollectStats::default();
        let mut worklist: Vec<HeapRef> = extra_roots
            .iter()
            .copied()
            .filter(|r| self.contains(*r))
            .collect();
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.entry.as_ref().is_some_and(|entry| entry.roots > 0) {
                worklist.push(HeapRef::new(index as u32, slot.generation));
            }
        }
        while let Some(r) = worklist.pop() {
            let Ok(entry) = self.get_mut(r) else {
                continue;
            };
            if entry.marked {
                continue;
            }
            entry.marked = true;
            stats.marked += 1;
            entry.kind.for_each_child(|child| {
                if let Some(child_ref) = child.as_heap_ref() {
                    worklist.push(child_ref);
                }
            });
        }
        let mut swept = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(entry) = slot.entry.as_mut() else {
                continue;
            };
            if entry.marked {
                entry.marked = false;
                continue;
            }
            swept.push(HeapRef::new(index as u32, slot.generation));
            slot.entry = None;
            self.free.push(index as u32);
        }
        self.live -= swept.len();
        self.allocs_since_collect = 0;
        stats.swept = swept.len();
        (swept, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_refs_do_not_resolve_after_reuse() {
        let mut heap = Heap::new();
        let first = heap.alloc_str("a");
        let (swept, _) = heap.collect(&[]);
        assert_eq!(swept, vec![first]);
        let second = heap.alloc_str("b");
        assert_eq!(first.index(), second.index());
        assert_ne!(first.generation(), second.generation());
        assert_eq!(heap.get(first).unwrap_err(), HeapError::StaleRef(first));
        assert_eq!(heap.str_value(MoltObject::from_ref(second)).unwrap(), "b");
    }

    #[test]
    fn collection_keeps_values_reachable_from_roots() {
        let mut heap = Heap::new();
        let inner = heap.alloc_str("inner");
        let outer = heap.alloc_tuple(&[MoltObject::from_ref(inner), MoltObject::from_int(1)]);
        let loose = heap.alloc_list(&[]);
        heap.retain(MoltObject::from_ref(outer)).unwrap();

        let (swept, stats) = heap.collect(&[]);
        assert_eq!(swept, vec![loose]);
        assert_eq!(stats.marked, 2);
        assert!(heap.contains(inner));
        assert_eq!(heap.live(), 2);

        heap.release(MoltObject::from_ref(outer)).unwrap();
        let (swept, _) = heap.collect(&[]);
        assert_eq!(swept.len(), 2);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn extra_roots_pin_unrooted_values() {
        let mut heap = Heap::new();
        let pinned = heap.alloc_tuple(&[]);
        let (swept, _) = heap.collect(&[pinned]);
        assert!(swept.is_empty());
        let (swept, _) = heap.collect(&[]);
        assert_eq!(swept, vec![pinned]);
    }

    #[test]
    fn release_without_root_is_an_error() {
        let mut heap = Heap::new();
        let r = heap.alloc_dict(&[]);
        let obj = MoltObject::from_ref(r);
        assert_eq!(heap.release(obj), Err(HeapError::RootUnderflow(r)));
        heap.retain(obj).unwrap();
        assert_eq!(heap.get(r).unwrap().roots(), 1);
        heap.release(obj).unwrap();
        assert!(heap.retain(MoltObject::from_int(3)).is_ok());
    }

    #[test]
    fn type_ids_cover_immediates() {
        let mut heap = Heap::new();
        let t = heap.alloc_tuple(&[]);
        assert_eq!(heap.type_id_of(MoltObject::from_int(1)).unwrap(), TYPE_ID_INT);
        assert_eq!(heap.type_id_of(MoltObject::none()).unwrap(), TYPE_ID_NONE);
        assert_eq!(heap.type_id_of(MoltObject::from_float(0.5)).unwrap(), TYPE_ID_FLOAT);
        assert_eq!(heap.type_id_of(MoltObject::from_ref(t)).unwrap(), TYPE_ID_TUPLE);
        assert!(heap.type_id_of(MoltObject::pending()).is_err());
    }
}
