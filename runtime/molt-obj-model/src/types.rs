//! Host type ids. Built-in ids match the runtime's `TYPE_ID_*` table;
//! ids at or above [`FIRST_HEAP_TYPE_ID`] are handed out to types created
//! at run time (e.g. native subclasses).

pub const TYPE_ID_OBJECT: u32 = 100;
pub const TYPE_ID_STRING: u32 = 200;
pub const TYPE_ID_LIST: u32 = 201;
pub const TYPE_ID_DICT: u32 = 204;
pub const TYPE_ID_TUPLE: u32 = 206;
pub const TYPE_ID_TYPE: u32 = 224;
pub const TYPE_ID_NONE: u32 = 230;
pub const TYPE_ID_BOOL: u32 = 231;
pub const TYPE_ID_INT: u32 = 232;
pub const TYPE_ID_FLOAT: u32 = 233;

pub const FIRST_HEAP_TYPE_ID: u32 = 1024;

pub fn builtin_type_name(type_id: u32) -> Option<&'static str> {
    Some(match type_id {
        TYPE_ID_OBJECT => "object",
        TYPE_ID_STRING => "str",
        TYPE_ID_LIST => "list",
        TYPE_ID_DICT => "dict",
        TYPE_ID_TUPLE => "tuple",
        TYPE_ID_TYPE => "type",
        TYPE_ID_NONE => "NoneType",
        TYPE_ID_BOOL => "bool",
        TYPE_ID_INT => "int",
        TYPE_ID_FLOAT => "float",
        _ => return None,
    })
}
