//! Type names for error messages and the `type` builtin.

use crate::gc::*;
use crate::value::Value;

/// The Lua-visible type name of a value.
pub fn type_name(v: Value) -> &'static str {
    if v.is_none() {
        return "no value";
    }
    if v.is_nil() {
        return "nil";
    }
    if v.is_bool() {
        return "boolean";
    }
    if v.is_number() {
        return "number";
    }
    if v.is_light_userdata() {
        return "userdata";
    }
    match v.gc_sub_tag() {
        Some(GC_SUB_STRING) => "string",
        Some(GC_SUB_TABLE) => "table",
        Some(GC_SUB_CLOSURE) | Some(GC_SUB_NATIVE) => "function",
        Some(GC_SUB_USERDATA) => "userdata",
        Some(GC_SUB_THREAD) => "thread",
        _ => "userdata",
    }
}
