//! `tp_members` tables: declared native fields of a subclass.

use std::ffi::{CStr, c_void};

use libc::{c_int, c_long};

use crate::errors::{ExceptionKind, PendingException};
use crate::ffi::{
    Py_ssize_t, PyMemberDef, PyObject, READONLY, T_DOUBLE, T_INT, T_LONG, T_OBJECT, T_PYSSIZET,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MemberInfo {
    pub(crate) name: String,
    pub(crate) type_code: c_int,
    pub(crate) declared_offset: usize,
    pub(crate) readonly: bool,
}

/// A field value in native form.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum FieldValue {
    Int(i64),
    Float(f64),
    Object(*mut PyObject),
}

fn type_code_supported(code: c_int) -> bool {
    matches!(code, T_INT | T_LONG | T_DOUBLE | T_OBJECT | T_PYSSIZET)
}

/// Reads a NULL-name-terminated member table.
pub(crate) unsafe fn collect_members(
    defs: *mut PyMemberDef,
    type_name: &str,
) -> Result<Vec<MemberInfo>, PendingException> {
    let mut out = Vec::new();
    if defs.is_null() {
        return Ok(out);
    }
    let mut cur = defs;
    unsafe {
        while !(*cur).name.is_null() {
            let def = &*cur;
            let name = CStr::from_ptr(def.name).to_string_lossy().into_owned();
            if !type_code_supported(def.type_code) {
                return Err(PendingException::new(
                    ExceptionKind::SystemError,
                    format!(
                        "member '{type_name}.{name}' has unsupported type code {}",
                        def.type_code
                    ),
                ));
            }
            if def.offset < 0 {
                return Err(PendingException::new(
                    ExceptionKind::SystemError,
                    format!("member '{type_name}.{name}' has a negative offset"),
                ));
            }
            out.push(MemberInfo {
                name,
                type_code: def.type_code,
                declared_offset: def.offset as usize,
                readonly: def.flags & READONLY != 0,
            });
            cur = cur.add(1);
        }
    }
    Ok(out)
}

pub(crate) unsafe fn read_field(addr: *mut c_void, type_code: c_int) -> FieldValue {
    unsafe {
        match type_code {
            T_INT => FieldValue::Int(i64::from(addr.cast::<c_int>().read_unaligned())),
            T_LONG => FieldValue::Int(addr.cast::<c_long>().read_unaligned() as i64),
            T_PYSSIZET => FieldValue::Int(addr.cast::<Py_ssize_t>().read_unaligned() as i64),
            T_DOUBLE => FieldValue::Float(addr.cast::<f64>().read_unaligned()),
            _ => FieldValue::Object(addr.cast::<*mut PyObject>().read_unaligned()),
        }
    }
}

/// Stores `value`; for object fields returns the previous occupant, whose
/// reference the caller now owns.
pub(crate) unsafe fn write_field(
    addr: *mut c_void,
    type_code: c_int,
    value: FieldValue,
) -> Result<Option<*mut PyObject>, PendingException> {
    unsafe {
        match (type_code, value) {
            // Wider values are truncated like CPython's T_INT setter.
            (T_INT, FieldValue::Int(v)) => addr.cast::<c_int>().write_unaligned(v as c_int),
            (T_LONG, FieldValue::Int(v)) => addr.cast::<c_long>().write_unaligned(v as c_long),
            (T_PYSSIZET, FieldValue::Int(v)) => {
                addr.cast::<Py_ssize_t>().write_unaligned(v as Py_ssize_t)
            }
            (T_DOUBLE, FieldValue::Float(v)) => addr.cast::<f64>().write_unaligned(v),
            (T_DOUBLE, FieldValue::Int(v)) => addr.cast::<f64>().write_unaligned(v as f64),
            (T_OBJECT, FieldValue::Object(p)) => {
                let slot = addr.cast::<*mut PyObject>();
                let old = slot.read_unaligned();
                slot.write_unaligned(p);
                return Ok(Some(old));
            }
            _ => {
                return Err(PendingException::new(
                    ExceptionKind::TypeError,
                    "member value has the wrong type",
                ));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_table_stops_at_null_name() {
        let mut defs = [
            PyMemberDef {
                name: c"count".as_ptr(),
                type_code: T_INT,
                offset: 32,
                flags: 0,
                doc: std::ptr::null(),
            },
            PyMemberDef {
                name: c"scale".as_ptr(),
                type_code: T_DOUBLE,
                offset: 40,
                flags: READONLY,
                doc: std::ptr::null(),
            },
            PyMemberDef {
                name: std::ptr::null(),
                type_code: 0,
                offset: 0,
                flags: 0,
                doc: std::ptr::null(),
            },
        ];
        let members = unsafe { collect_members(defs.as_mut_ptr(), "T") }.unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].name, "count");
        assert!(!members[0].readonly);
        assert_eq!(members[1].declared_offset, 40);
        assert!(members[1].readonly);
    }

    #[test]
    fn unsupported_type_code_is_rejected() {
        let mut defs = [
            PyMemberDef {
                name: c"flag".as_ptr(),
                type_code: 14,
                offset: 32,
                flags: 0,
                doc: std::ptr::null(),
            },
            PyMemberDef {
                name: std::ptr::null(),
                type_code: 0,
                offset: 0,
                flags: 0,
                doc: std::ptr::null(),
            },
        ];
        let err = unsafe { collect_members(defs.as_mut_ptr(), "T") }.unwrap_err();
        assert_eq!(err.kind, ExceptionKind::SystemError);
    }

    #[test]
    fn fields_round_trip_through_storage() {
        let mut storage = [0u64; 2];
        let addr = storage.as_mut_ptr().cast::<c_void>();
        unsafe {
            write_field(addr, T_INT, FieldValue::Int(-7)).unwrap();
            assert_eq!(read_field(addr, T_INT), FieldValue::Int(-7));
            write_field(addr, T_DOUBLE, FieldValue::Int(2)).unwrap();
            assert_eq!(read_field(addr, T_DOUBLE), FieldValue::Float(2.0));
            assert!(write_field(addr, T_INT, FieldValue::Float(1.5)).is_err());
        }
    }
}
