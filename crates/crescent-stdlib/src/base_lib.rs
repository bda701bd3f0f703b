//! Base library: print, type, tostring/tonumber, iteration, raw access,
//! assert/error/pcall, collectgarbage, metatable access.

use crate::{arg_error, check_number, check_table, register_global_fn};
use crescent_core::value::Value;
use crescent_vm::{LuaError, State, MULTRET};
use std::io::Write;

pub fn register(state: &mut State) -> Result<(), LuaError> {
    register_global_fn(state, "print", native_print)?;
    register_global_fn(state, "type", native_type)?;
    register_global_fn(state, "tostring", native_tostring)?;
    register_global_fn(state, "tonumber", native_tonumber)?;
    register_global_fn(state, "next", native_next)?;
    register_global_fn(state, "pairs", native_pairs)?;
    register_global_fn(state, "ipairs", native_ipairs)?;
    register_global_fn(state, "select", native_select)?;
    register_global_fn(state, "unpack", native_unpack)?;
    register_global_fn(state, "rawget", native_rawget)?;
    register_global_fn(state, "rawset", native_rawset)?;
    register_global_fn(state, "rawequal", native_rawequal)?;
    register_global_fn(state, "rawlen", native_rawlen)?;
    register_global_fn(state, "assert", native_assert)?;
    register_global_fn(state, "error", native_error)?;
    register_global_fn(state, "pcall", native_pcall)?;
    register_global_fn(state, "collectgarbage", native_collectgarbage)?;
    register_global_fn(state, "getmetatable", native_getmetatable)?;
    register_global_fn(state, "setmetatable", native_setmetatable)?;

    // The iteration helper ipairs hands out lives in the registry.
    let aux = state.alloc_native(native_ipairs_aux, "ipairs_aux", Vec::new(), None);
    let key = state.intern(b"crescent.ipairs_aux");
    let registry = state.registry;
    state
        .heap
        .get_table_mut(registry)
        .raw_set_str(key, Value::from_native(aux));

    // _G is the globals table itself; _VERSION names the language level.
    let globals = state.globals;
    state.global_set(b"_G", Value::from_table(globals));
    let version = state.intern(b"Lua 5.1");
    state.global_set(b"_VERSION", Value::from_str_id(version));
    Ok(())
}

fn native_print(state: &mut State) -> Result<i32, LuaError> {
    let nargs = state.get_top();
    let mut line = Vec::new();
    for i in 1..=nargs {
        if i > 1 {
            line.push(b'\t');
        }
        let v = state.to_value(i as i32);
        line.extend_from_slice(state.display_value(v).as_bytes());
    }
    line.push(b'\n');
    let mut out = std::io::stdout();
    out.write_all(&line)
        .and_then(|_| out.flush())
        .map_err(|e| LuaError::Runtime(format!("print: {e}")))?;
    Ok(0)
}

fn native_type(state: &mut State) -> Result<i32, LuaError> {
    if state.get_top() == 0 {
        return Err(arg_error("type", 1, "value", "no value"));
    }
    let name = state.type_name_at(1);
    state.push_string(name.as_bytes())?;
    Ok(1)
}

fn native_tostring(state: &mut State) -> Result<i32, LuaError> {
    if state.get_top() == 0 {
        return Err(arg_error("tostring", 1, "value", "no value"));
    }
    let v = state.to_value(1);
    let s = state.display_value(v);
    state.push_string(s.as_bytes())?;
    Ok(1)
}

fn native_tonumber(state: &mut State) -> Result<i32, LuaError> {
    if state.is_none_or_nil(2) {
        match state.to_number(1) {
            Some(n) => state.push_number(n)?,
            None => state.push_nil()?,
        }
        return Ok(1);
    }
    // Explicit base: the argument must be a string of digits in it.
    let base = check_number(state, "tonumber", 2)? as u32;
    if !(2..=36).contains(&base) {
        return Err(arg_error("tonumber", 2, "base out of range", "number"));
    }
    let bytes = match state.to_str_bytes(1) {
        Some(b) => b.to_vec(),
        None => return Err(arg_error("tonumber", 1, "string", state.type_name_at(1))),
    };
    let text = String::from_utf8_lossy(&bytes);
    match i64::from_str_radix(text.trim(), base) {
        Ok(n) => state.push_number(n as f64)?,
        Err(_) => state.push_nil()?,
    }
    Ok(1)
}

fn native_next(state: &mut State) -> Result<i32, LuaError> {
    let _ = check_table(state, "next", 1)?;
    state.set_top(2)?;
    if state.next(1)? {
        Ok(2)
    } else {
        state.push_nil()?;
        Ok(1)
    }
}

fn native_pairs(state: &mut State) -> Result<i32, LuaError> {
    let _ = check_table(state, "pairs", 1)?;
    state.get_global("next")?;
    let t = state.to_value(1);
    state.push_value(t)?;
    state.push_nil()?;
    Ok(3)
}

fn native_ipairs(state: &mut State) -> Result<i32, LuaError> {
    let _ = check_table(state, "ipairs", 1)?;
    let key = state.intern(b"crescent.ipairs_aux");
    let aux = state.heap.get_table(state.registry).raw_get_str(key);
    state.push_value(aux)?;
    let t = state.to_value(1);
    state.push_value(t)?;
    state.push_number(0.0)?;
    Ok(3)
}

fn native_ipairs_aux(state: &mut State) -> Result<i32, LuaError> {
    let t = check_table(state, "ipairs", 1)?;
    let i = check_number(state, "ipairs", 2)? + 1.0;
    let v = state.heap.get_table(t).raw_geti(i as i64);
    if v.is_nil() {
        state.push_nil()?;
        Ok(1)
    } else {
        state.push_number(i)?;
        state.push_value(v)?;
        Ok(2)
    }
}

fn native_select(state: &mut State) -> Result<i32, LuaError> {
    let nargs = state.get_top();
    if state.to_str_bytes(1) == Some(b"#") {
        state.push_number((nargs - 1) as f64)?;
        return Ok(1);
    }
    let n = check_number(state, "select", 1)?;
    if n < 1.0 {
        return Err(arg_error("select", 1, "index out of range", "number"));
    }
    let n = n as usize;
    if n >= nargs {
        return Ok(0);
    }
    // Arguments n+1.. are already in place on top.
    Ok((nargs - n) as i32)
}

fn native_unpack(state: &mut State) -> Result<i32, LuaError> {
    let t = check_table(state, "unpack", 1)?;
    let i = crate::opt_number(state, "unpack", 2, 1.0)? as i64;
    let default_j = state.heap.get_table(t).length();
    let j = crate::opt_number(state, "unpack", 3, default_j as f64)? as i64;
    let mut count = 0;
    for k in i..=j {
        let v = state.heap.get_table(t).raw_geti(k);
        state.push_value(v)?;
        count += 1;
    }
    Ok(count)
}

fn native_rawget(state: &mut State) -> Result<i32, LuaError> {
    let t = check_table(state, "rawget", 1)?;
    let key = state.to_value(2);
    let v = state.heap.get_table(t).raw_get(key);
    state.push_value(v)?;
    Ok(1)
}

fn native_rawset(state: &mut State) -> Result<i32, LuaError> {
    let t = check_table(state, "rawset", 1)?;
    let key = state.to_value(2);
    let value = state.to_value(3);
    state.raw_set_table(t, key, value)?;
    let tv = state.to_value(1);
    state.push_value(tv)?;
    Ok(1)
}

fn native_rawequal(state: &mut State) -> Result<i32, LuaError> {
    let eq = state.raw_equal(1, 2);
    state.push_boolean(eq)?;
    Ok(1)
}

fn native_rawlen(state: &mut State) -> Result<i32, LuaError> {
    let len = state.obj_len(1)?;
    state.push_number(len)?;
    Ok(1)
}

fn native_assert(state: &mut State) -> Result<i32, LuaError> {
    let nargs = state.get_top();
    if nargs == 0 || !state.to_boolean(1) {
        if nargs >= 2 {
            let v = state.to_value(2);
            return Err(match v.as_str_id() {
                Some(sid) => {
                    let msg = String::from_utf8_lossy(state.strings.get_bytes(sid)).into_owned();
                    LuaError::Runtime(msg)
                }
                None => LuaError::Value(v),
            });
        }
        return Err(LuaError::Runtime("assertion failed!".into()));
    }
    // Pass every argument through.
    Ok(nargs as i32)
}

fn native_error(state: &mut State) -> Result<i32, LuaError> {
    let v = state.to_value(1);
    Err(match v.as_str_id() {
        Some(sid) => {
            let msg = String::from_utf8_lossy(state.strings.get_bytes(sid)).into_owned();
            LuaError::Runtime(msg)
        }
        None if v.is_none() => LuaError::Runtime("nil".into()),
        None => LuaError::Value(v),
    })
}

fn native_pcall(state: &mut State) -> Result<i32, LuaError> {
    let nargs = state.get_top();
    if nargs == 0 {
        return Err(arg_error("pcall", 1, "value", "no value"));
    }
    match state.pcall(nargs - 1, MULTRET) {
        Ok(()) => {
            let nresults = state.get_top();
            state.push_boolean(true)?;
            state.insert(1)?;
            Ok((nresults + 1) as i32)
        }
        Err(e) => {
            state.push_boolean(false)?;
            let v = e.to_value(&mut state.strings);
            state.push_value(v)?;
            Ok(2)
        }
    }
}

fn native_collectgarbage(state: &mut State) -> Result<i32, LuaError> {
    let opt = state
        .to_str_bytes(1)
        .map(|b| b.to_vec())
        .unwrap_or_else(|| b"collect".to_vec());
    match opt.as_slice() {
        b"count" => {
            let live = state.heap.live_objects() + state.strings.live_count();
            state.push_number(live as f64)?;
        }
        // "collect" and every other option run a full cycle.
        _ => {
            state.collect_garbage();
            state.push_number(0.0)?;
        }
    }
    Ok(1)
}

fn native_getmetatable(state: &mut State) -> Result<i32, LuaError> {
    match state.to_table(1) {
        Some(t) => match state.heap.get_table(t).metatable {
            Some(mt) => state.push_table(mt)?,
            None => state.push_nil()?,
        },
        None => state.push_nil()?,
    }
    Ok(1)
}

fn native_setmetatable(state: &mut State) -> Result<i32, LuaError> {
    let t = check_table(state, "setmetatable", 1)?;
    let mt = if state.is_none_or_nil(2) {
        None
    } else {
        Some(check_table(state, "setmetatable", 2)?)
    };
    state.heap.get_table_mut(t).metatable = mt;
    let tv = state.to_value(1);
    state.push_value(tv)?;
    Ok(1)
}
