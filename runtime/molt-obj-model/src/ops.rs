//! Host-level sequence protocol. These operate on any tuple-kind heap value,
//! including instances of tuple subclasses, and return exact tuples when they
//! build new ones.

use std::cmp::Ordering;

use crate::{Heap, HeapError, HeapRef, MoltObject, ObjectKind};

const REPR_MAX_DEPTH: usize = 256;

pub fn value_type_name(heap: &Heap, obj: MoltObject) -> &'static str {
    if obj.is_int() {
        return "int";
    }
    if obj.is_bool() {
        return "bool";
    }
    if obj.is_none() {
        return "NoneType";
    }
    if obj.is_float() {
        return "float";
    }
    heap.entry_of(obj)
        .map(|entry| entry.kind.name())
        .unwrap_or("object")
}

pub fn is_tuple(heap: &Heap, obj: MoltObject) -> bool {
    heap.tuple_items(obj).is_ok()
}

pub fn len(heap: &Heap, obj: MoltObject) -> Result<usize, HeapError> {
    if obj.is_immediate() {
        return Err(HeapError::WrongKind {
            expected: "sized object",
            found: value_type_name(heap, obj),
        });
    }
    Ok(heap.entry_of(obj)?.kind.len())
}

/// Item lookup with negative indices counted from the end.
pub fn tuple_getitem(heap: &Heap, obj: MoltObject, index: i64) -> Result<MoltObject, HeapError> {
    let items = heap.tuple_items(obj)?;
    let len = items.len() as i64;
    let idx = if index < 0 { index + len } else { index };
    if idx < 0 || idx >= len {
        return Err(HeapError::IndexOutOfRange {
            what: "tuple",
            index,
            len: items.len(),
        });
    }
    Ok(items[idx as usize])
}

/// Normalizes slice bounds against `len`. Returns `(start, stop, step, count)`.
pub fn adjust_slice(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<(i64, i64, i64, usize), HeapError> {
    let len = len as i64;
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(HeapError::ZeroStep);
    }
    let (lower, upper) = if step > 0 { (0, len) } else { (-1, len - 1) };
    let clamp = |value: Option<i64>, default: i64| match value {
        None => default,
        Some(v) if v < 0 => (v + len).max(lower),
        Some(v) => v.min(upper),
    };
    let start = clamp(start, if step > 0 { lower } else { upper });
    let stop = clamp(stop, if step > 0 { upper } else { lower });
    let count = if step > 0 && stop > start {
        ((stop - start - 1) / step + 1) as usize
    } else if step < 0 && start > stop {
        ((start - stop - 1) / (-step) + 1) as usize
    } else {
        0
    };
    Ok((start, stop, step, count))
}

pub fn tuple_slice(
    heap: &mut Heap,
    obj: MoltObject,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<HeapRef, HeapError> {
    let items = heap.tuple_items(obj)?;
    let (start, _, step, count) = adjust_slice(items.len(), start, stop, step)?;
    let picked: Vec<MoltObject> = (0..count as i64)
        .map(|i| items[(start + i * step) as usize])
        .collect();
    Ok(heap.alloc_tuple(&picked))
}

fn numeric_eq(a: MoltObject, b: MoltObject) -> Option<bool> {
    if let (Some(x), Some(y)) = (a.as_index(), b.as_index()) {
        return Some(x == y);
    }
    let fa = a.as_float().or_else(|| a.as_index().map(|v| v as f64))?;
    let fb = b.as_float().or_else(|| b.as_index().map(|v| v as f64))?;
    Some(fa == fb)
}

fn numeric_cmp(a: MoltObject, b: MoltObject) -> Option<Option<Ordering>> {
    if let (Some(x), Some(y)) = (a.as_index(), b.as_index()) {
        return Some(Some(x.cmp(&y)));
    }
    let fa = a.as_float().or_else(|| a.as_index().map(|v| v as f64))?;
    let fb = b.as_float().or_else(|| b.as_index().map(|v| v as f64))?;
    Some(fa.partial_cmp(&fb))
}

/// Value equality with the identity shortcut containers use.
pub fn eq(heap: &Heap, a: MoltObject, b: MoltObject) -> bool {
    if a == b && !a.as_float().is_some_and(f64::is_nan) {
        return true;
    }
    if let Some(result) = numeric_eq(a, b) {
        return result;
    }
    let (Ok(ea), Ok(eb)) = (heap.entry_of(a), heap.entry_of(b)) else {
        return false;
    };
    match (&ea.kind, &eb.kind) {
        (ObjectKind::Str(x), ObjectKind::Str(y)) => x == y,
        (ObjectKind::Tuple(x), ObjectKind::Tuple(y))
        | (ObjectKind::List(x), ObjectKind::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| eq(heap, *p, *q))
        }
        (ObjectKind::Dict(x), ObjectKind::Dict(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    y.iter()
                        .find(|(k2, _)| eq(heap, *k, *k2))
                        .is_some_and(|(_, v2)| eq(heap, *v, *v2))
                })
        }
        _ => false,
    }
}

/// Ordering used by `<`, `>`, ... `Ok(None)` means unordered (NaN).
pub fn compare(heap: &Heap, a: MoltObject, b: MoltObject) -> Result<Option<Ordering>, HeapError> {
    if let Some(result) = numeric_cmp(a, b) {
        return Ok(result);
    }
    let unorderable = || HeapError::Unorderable {
        op: "<",
        lhs: value_type_name(heap, a),
        rhs: value_type_name(heap, b),
    };
    let (Ok(ea), Ok(eb)) = (heap.entry_of(a), heap.entry_of(b)) else {
        return Err(unorderable());
    };
    match (&ea.kind, &eb.kind) {
        (ObjectKind::Str(x), ObjectKind::Str(y)) => Ok(Some(x.cmp(y))),
        (ObjectKind::Tuple(x), ObjectKind::Tuple(y))
        | (ObjectKind::List(x), ObjectKind::List(y)) => {
            for (p, q) in x.iter().zip(y) {
                if !eq(heap, *p, *q) {
                    return compare(heap, *p, *q);
                }
            }
            Ok(Some(x.len().cmp(&y.len())))
        }
        _ => Err(unorderable()),
    }
}

pub fn lt(heap: &Heap, a: MoltObject, b: MoltObject) -> Result<bool, HeapError> {
    Ok(compare(heap, a, b)? == Some(Ordering::Less))
}

pub fn gt(heap: &Heap, a: MoltObject, b: MoltObject) -> Result<bool, HeapError> {
    Ok(compare(heap, a, b)? == Some(Ordering::Greater))
}

pub fn tuple_contains(heap: &Heap, obj: MoltObject, needle: MoltObject) -> Result<bool, HeapError> {
    let items = heap.tuple_items(obj)?;
    Ok(items.iter().any(|item| eq(heap, *item, needle)))
}

pub fn tuple_concat(heap: &mut Heap, a: MoltObject, b: MoltObject) -> Result<HeapRef, HeapError> {
    let mut items = heap.tuple_items(a)?.to_vec();
    items.extend_from_slice(heap.tuple_items(b)?);
    Ok(heap.alloc_tuple(&items))
}

pub fn tuple_repeat(heap: &mut Heap, obj: MoltObject, times: i64) -> Result<HeapRef, HeapError> {
    let items = heap.tuple_items(obj)?;
    let times = times.max(0) as usize;
    let mut out = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        out.extend_from_slice(items);
    }
    Ok(heap.alloc_tuple(&out))
}

pub fn tuple_to_list(heap: &mut Heap, obj: MoltObject) -> Result<HeapRef, HeapError> {
    let items = heap.tuple_items(obj)?.to_vec();
    Ok(heap.alloc_list(&items))
}

pub fn tuple_index(heap: &Heap, obj: MoltObject, needle: MoltObject) -> Result<usize, HeapError> {
    heap.tuple_items(obj)?
        .iter()
        .position(|item| eq(heap, *item, needle))
        .ok_or(HeapError::ValueNotFound("tuple.index"))
}

pub fn tuple_count(heap: &Heap, obj: MoltObject, needle: MoltObject) -> Result<usize, HeapError> {
    Ok(heap
        .tuple_items(obj)?
        .iter()
        .filter(|item| eq(heap, **item, needle))
        .count())
}

fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f == f.trunc() && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

fn str_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn join_repr(heap: &Heap, items: &[MoltObject], depth: usize) -> Result<String, HeapError> {
    let parts = items
        .iter()
        .map(|item| repr_at(heap, *item, depth + 1))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join(", "))
}

fn repr_at(heap: &Heap, obj: MoltObject, depth: usize) -> Result<String, HeapError> {
    if depth > REPR_MAX_DEPTH {
        return Ok("...".to_string());
    }
    if let Some(i) = obj.as_int() {
        return Ok(i.to_string());
    }
    if let Some(b) = obj.as_bool() {
        return Ok(if b { "True" } else { "False" }.to_string());
    }
    if obj.is_none() {
        return Ok("None".to_string());
    }
    if let Some(f) = obj.as_float() {
        return Ok(float_repr(f));
    }
    let entry = heap.entry_of(obj)?;
    Ok(match &entry.kind {
        ObjectKind::Str(s) => str_repr(s),
        ObjectKind::Tuple(items) if items.len() == 1 => {
            format!("({},)", repr_at(heap, items[0], depth + 1)?)
        }
        ObjectKind::Tuple(items) => format!("({})", join_repr(heap, items, depth)?),
        ObjectKind::List(items) => format!("[{}]", join_repr(heap, items, depth)?),
        ObjectKind::Dict(pairs) => {
            let parts = pairs
                .iter()
                .map(|(k, v)| {
                    Ok(format!(
                        "{}: {}",
                        repr_at(heap, *k, depth + 1)?,
                        repr_at(heap, *v, depth + 1)?
                    ))
                })
                .collect::<Result<Vec<_>, HeapError>>()?;
            format!("{{{}}}", parts.join(", "))
        }
    })
}

pub fn repr(heap: &Heap, obj: MoltObject) -> Result<String, HeapError> {
    repr_at(heap, obj, 0)
}
