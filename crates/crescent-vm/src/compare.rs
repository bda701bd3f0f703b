//! Equality and ordering with Lua 5.1 raw semantics.

use crate::error::LuaError;
use crescent_core::object::type_name;
use crescent_core::string::StringPool;
use crescent_core::value::Value;

/// Raw equality: same-variant comparison, references by identity,
/// strings by interned identity.
pub fn raw_eq(a: Value, b: Value) -> bool {
    a == b
}

/// Ordering a < b: defined for number/number and string/string only.
pub fn lua_lt(a: Value, b: Value, strings: &StringPool) -> Result<bool, LuaError> {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return Ok(x < y);
    }
    if let (Some(sa), Some(sb)) = (a.as_str_id(), b.as_str_id()) {
        return Ok(strings.get_bytes(sa) < strings.get_bytes(sb));
    }
    Err(compare_error(a, b))
}

/// Ordering a <= b: same domain as lua_lt.
pub fn lua_le(a: Value, b: Value, strings: &StringPool) -> Result<bool, LuaError> {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return Ok(x <= y);
    }
    if let (Some(sa), Some(sb)) = (a.as_str_id(), b.as_str_id()) {
        return Ok(strings.get_bytes(sa) <= strings.get_bytes(sb));
    }
    Err(compare_error(a, b))
}

fn compare_error(a: Value, b: Value) -> LuaError {
    let ta = type_name(a);
    let tb = type_name(b);
    if ta == tb {
        LuaError::Runtime(format!("attempt to compare two {ta} values"))
    } else {
        LuaError::Runtime(format!("attempt to compare {ta} with {tb}"))
    }
}
