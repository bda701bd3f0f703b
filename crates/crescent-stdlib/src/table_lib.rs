//! Table library: sequence manipulation over the raw table interface.

use crate::{check_number, check_string, check_table, opt_number, register_lib_fn};
use crescent_core::value::Value;
use crescent_vm::{LuaError, State};

pub fn register(state: &mut State) -> Result<(), LuaError> {
    let lib = state.heap.alloc_table(0, 8);

    register_lib_fn(state, lib, "table", "insert", native_insert)?;
    register_lib_fn(state, lib, "table", "remove", native_remove)?;
    register_lib_fn(state, lib, "table", "concat", native_concat)?;
    register_lib_fn(state, lib, "table", "maxn", native_maxn)?;

    state.global_set(b"table", Value::from_table(lib));
    Ok(())
}

fn native_insert(state: &mut State) -> Result<i32, LuaError> {
    let t = check_table(state, "insert", 1)?;
    let len = state.heap.get_table(t).length();
    let nargs = state.get_top();
    match nargs {
        2 => {
            // insert(t, v): append at the border
            let v = state.to_value(2);
            state.heap.get_table_mut(t).raw_seti(len + 1, v);
        }
        3 => {
            // insert(t, pos, v): shift the tail up
            let pos = check_number(state, "insert", 2)? as i64;
            let v = state.to_value(3);
            let table = state.heap.get_table_mut(t);
            let mut i = len;
            while i >= pos {
                let moved = table.raw_geti(i);
                table.raw_seti(i + 1, moved);
                i -= 1;
            }
            table.raw_seti(pos, v);
        }
        _ => {
            return Err(LuaError::Runtime(
                "wrong number of arguments to 'insert'".into(),
            ));
        }
    }
    Ok(0)
}

fn native_remove(state: &mut State) -> Result<i32, LuaError> {
    let t = check_table(state, "remove", 1)?;
    let len = state.heap.get_table(t).length();
    let pos = opt_number(state, "remove", 2, len as f64)? as i64;
    if len == 0 {
        state.push_nil()?;
        return Ok(1);
    }
    let table = state.heap.get_table_mut(t);
    let removed = table.raw_geti(pos);
    for i in pos..len {
        let moved = table.raw_geti(i + 1);
        table.raw_seti(i, moved);
    }
    table.raw_seti(len, Value::nil());
    state.push_value(removed)?;
    Ok(1)
}

fn native_concat(state: &mut State) -> Result<i32, LuaError> {
    let t = check_table(state, "concat", 1)?;
    let sep = if state.is_none_or_nil(2) {
        Vec::new()
    } else {
        check_string(state, "concat", 2)?
    };
    let i = opt_number(state, "concat", 3, 1.0)? as i64;
    let default_j = state.heap.get_table(t).length();
    let j = opt_number(state, "concat", 4, default_j as f64)? as i64;

    let mut out: Vec<u8> = Vec::new();
    for k in i..=j {
        if k > i {
            out.extend_from_slice(&sep);
        }
        let v = state.heap.get_table(t).raw_geti(k);
        if let Some(sid) = v.as_str_id() {
            out.extend_from_slice(state.strings.get_bytes(sid));
        } else if let Some(n) = v.as_number() {
            out.extend_from_slice(crescent_vm::coerce::number_to_string(n).as_bytes());
        } else {
            return Err(LuaError::Runtime(format!(
                "invalid value (at index {k}) in table for 'concat'"
            )));
        }
    }
    state.push_string(&out)?;
    Ok(1)
}

fn native_maxn(state: &mut State) -> Result<i32, LuaError> {
    let t = check_table(state, "maxn", 1)?;
    let mut max = 0.0f64;
    let mut key = Value::nil();
    loop {
        match state.heap.get_table(t).next(key) {
            Ok(Some((k, _))) => {
                if let Some(n) = k.as_number() {
                    if n > max {
                        max = n;
                    }
                }
                key = k;
            }
            _ => break,
        }
    }
    state.push_number(max)?;
    Ok(1)
}
