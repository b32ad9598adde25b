//! Exported C API surface.

pub mod object;
pub mod tuple;

pub use object::{molt_extension_fields, molt_false, molt_none, molt_true};
pub use tuple::{
    PyTuple_Check, PyTuple_CheckExact, PyTuple_GET_ITEM, PyTuple_GET_SIZE, PyTuple_GetItem,
    PyTuple_GetSlice, PyTuple_New, PyTuple_SET_ITEM, PyTuple_SetItem, PyTuple_Size,
    _molt_tuple_pack_array,
};
