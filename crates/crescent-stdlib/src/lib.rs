//! Crescent standard libraries: base, string, table, math.
//!
//! Each library builds its table, binds it in globals under its Lua 5.1
//! name, and additionally binds every function flat under its
//! library-qualified name ("string.upper") in globals.

pub mod base_lib;
pub mod math_lib;
pub mod string_lib;
pub mod table_lib;

use crescent_core::gc::GcIdx;
use crescent_core::table::Table;
use crescent_core::value::Value;
use crescent_vm::state::CFunction;
use crescent_vm::{LuaError, State};

/// Register every standard library into the state's globals.
pub fn register_all(state: &mut State) -> Result<(), LuaError> {
    base_lib::register(state)?;
    string_lib::register(state)?;
    table_lib::register(state)?;
    math_lib::register(state)?;
    Ok(())
}

/// Bind a host function into a library table and under its qualified
/// name in globals.
pub(crate) fn register_lib_fn(
    state: &mut State,
    lib_table: GcIdx<Table>,
    lib_name: &str,
    name: &'static str,
    func: CFunction,
) -> Result<(), LuaError> {
    let id = state.alloc_native(func, name, Vec::new(), None);
    let v = Value::from_native(id);
    let key = state.intern(name.as_bytes());
    state.heap.get_table_mut(lib_table).raw_set_str(key, v);
    let qualified = format!("{lib_name}.{name}");
    state.global_set(qualified.as_bytes(), v);
    Ok(())
}

/// Bind a host function directly as a global.
pub(crate) fn register_global_fn(
    state: &mut State,
    name: &'static str,
    func: CFunction,
) -> Result<(), LuaError> {
    let id = state.alloc_native(func, name, Vec::new(), None);
    state.global_set(name.as_bytes(), Value::from_native(id));
    Ok(())
}

/// "bad argument" error in the stock Lua shape.
pub(crate) fn arg_error(fname: &str, n: usize, expected: &str, got: &'static str) -> LuaError {
    LuaError::Runtime(format!(
        "bad argument #{n} to '{fname}' ({expected} expected, got {got})"
    ))
}

/// Argument that must be a number (with string coercion).
pub(crate) fn check_number(state: &State, fname: &str, n: usize) -> Result<f64, LuaError> {
    state
        .to_number(n as i32)
        .ok_or_else(|| arg_error(fname, n, "number", state.type_name_at(n as i32)))
}

/// Optional numeric argument with a default.
pub(crate) fn opt_number(
    state: &State,
    fname: &str,
    n: usize,
    default: f64,
) -> Result<f64, LuaError> {
    if state.is_none_or_nil(n as i32) {
        Ok(default)
    } else {
        check_number(state, fname, n)
    }
}

/// Argument that must be a string (numbers coerce).
pub(crate) fn check_string(state: &mut State, fname: &str, n: usize) -> Result<Vec<u8>, LuaError> {
    match state.to_lua_string(n as i32) {
        Some(sid) => Ok(state.strings.get_bytes(sid).to_vec()),
        None => Err(arg_error(fname, n, "string", state.type_name_at(n as i32))),
    }
}

/// Argument that must be a table.
pub(crate) fn check_table(
    state: &State,
    fname: &str,
    n: usize,
) -> Result<GcIdx<Table>, LuaError> {
    state
        .to_table(n as i32)
        .ok_or_else(|| arg_error(fname, n, "table", state.type_name_at(n as i32)))
}
