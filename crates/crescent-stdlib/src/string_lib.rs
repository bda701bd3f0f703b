//! String library: byte-oriented operations, no pattern matching.

use crate::{arg_error, check_number, check_string, opt_number, register_lib_fn};
use crescent_core::value::Value;
use crescent_vm::coerce;
use crescent_vm::{LuaError, State};

pub fn register(state: &mut State) -> Result<(), LuaError> {
    let lib = state.heap.alloc_table(0, 16);

    register_lib_fn(state, lib, "string", "len", native_len)?;
    register_lib_fn(state, lib, "string", "sub", native_sub)?;
    register_lib_fn(state, lib, "string", "upper", native_upper)?;
    register_lib_fn(state, lib, "string", "lower", native_lower)?;
    register_lib_fn(state, lib, "string", "rep", native_rep)?;
    register_lib_fn(state, lib, "string", "reverse", native_reverse)?;
    register_lib_fn(state, lib, "string", "byte", native_byte)?;
    register_lib_fn(state, lib, "string", "char", native_char)?;
    register_lib_fn(state, lib, "string", "format", native_format)?;

    state.global_set(b"string", Value::from_table(lib));
    Ok(())
}

/// Normalize a Lua string index (1-based, negative counts from the end)
/// to a 0-based offset clamped into [0, len].
fn str_index(i: f64, len: usize) -> usize {
    if i >= 1.0 {
        ((i as usize) - 1).min(len)
    } else if i < 0.0 {
        let back = (-i) as usize;
        len.saturating_sub(back)
    } else {
        0
    }
}

fn native_len(state: &mut State) -> Result<i32, LuaError> {
    let s = check_string(state, "len", 1)?;
    state.push_number(s.len() as f64)?;
    Ok(1)
}

fn native_sub(state: &mut State) -> Result<i32, LuaError> {
    let s = check_string(state, "sub", 1)?;
    let i = check_number(state, "sub", 2)?;
    let j = opt_number(state, "sub", 3, -1.0)?;
    let start = str_index(i, s.len());
    // j is inclusive; normalize to an exclusive end.
    let end = if j >= 0.0 {
        (j as usize).min(s.len())
    } else {
        let back = (-j) as usize - 1;
        s.len().saturating_sub(back)
    };
    if start >= end {
        state.push_string(b"")?;
    } else {
        let piece = s[start..end].to_vec();
        state.push_string(&piece)?;
    }
    Ok(1)
}

fn native_upper(state: &mut State) -> Result<i32, LuaError> {
    let s = check_string(state, "upper", 1)?;
    let up: Vec<u8> = s.iter().map(|b| b.to_ascii_uppercase()).collect();
    state.push_string(&up)?;
    Ok(1)
}

fn native_lower(state: &mut State) -> Result<i32, LuaError> {
    let s = check_string(state, "lower", 1)?;
    let low: Vec<u8> = s.iter().map(|b| b.to_ascii_lowercase()).collect();
    state.push_string(&low)?;
    Ok(1)
}

fn native_rep(state: &mut State) -> Result<i32, LuaError> {
    let s = check_string(state, "rep", 1)?;
    let n = check_number(state, "rep", 2)?;
    if n <= 0.0 {
        state.push_string(b"")?;
        return Ok(1);
    }
    let mut out = Vec::with_capacity(s.len() * n as usize);
    for _ in 0..n as usize {
        out.extend_from_slice(&s);
    }
    state.push_string(&out)?;
    Ok(1)
}

fn native_reverse(state: &mut State) -> Result<i32, LuaError> {
    let mut s = check_string(state, "reverse", 1)?;
    s.reverse();
    state.push_string(&s)?;
    Ok(1)
}

fn native_byte(state: &mut State) -> Result<i32, LuaError> {
    let s = check_string(state, "byte", 1)?;
    let i = opt_number(state, "byte", 2, 1.0)?;
    let j = opt_number(state, "byte", 3, i)?;
    let start = str_index(i, s.len());
    let end = if j >= 0.0 {
        (j as usize).min(s.len())
    } else {
        let back = (-j) as usize - 1;
        s.len().saturating_sub(back)
    };
    let mut count = 0;
    for &b in s.iter().take(end).skip(start) {
        state.push_number(b as f64)?;
        count += 1;
    }
    Ok(count)
}

fn native_char(state: &mut State) -> Result<i32, LuaError> {
    let nargs = state.get_top();
    let mut bytes = Vec::with_capacity(nargs);
    for i in 1..=nargs {
        let n = check_number(state, "char", i)?;
        if !(0.0..=255.0).contains(&n) {
            return Err(arg_error("char", i, "value out of range", "number"));
        }
        bytes.push(n as u8);
    }
    state.push_string(&bytes)?;
    Ok(1)
}

fn native_format(state: &mut State) -> Result<i32, LuaError> {
    let fmt = check_string(state, "format", 1)?;
    let mut out: Vec<u8> = Vec::with_capacity(fmt.len());
    let mut arg = 1usize;
    let mut it = fmt.iter().copied().peekable();
    while let Some(b) = it.next() {
        if b != b'%' {
            out.push(b);
            continue;
        }
        let spec = it
            .next()
            .ok_or_else(|| LuaError::Runtime("invalid format string to 'format'".into()))?;
        match spec {
            b'%' => out.push(b'%'),
            b'd' | b'i' => {
                arg += 1;
                let n = check_number(state, "format", arg)?;
                out.extend_from_slice(format!("{}", n as i64).as_bytes());
            }
            b'f' => {
                arg += 1;
                let n = check_number(state, "format", arg)?;
                out.extend_from_slice(format!("{:.6}", n).as_bytes());
            }
            b'g' => {
                arg += 1;
                let n = check_number(state, "format", arg)?;
                out.extend_from_slice(coerce::number_to_string(n).as_bytes());
            }
            b'x' => {
                arg += 1;
                let n = check_number(state, "format", arg)?;
                out.extend_from_slice(format!("{:x}", n as i64).as_bytes());
            }
            b'c' => {
                arg += 1;
                let n = check_number(state, "format", arg)?;
                out.push(n as u8);
            }
            b's' => {
                arg += 1;
                let v = state.to_value(arg as i32);
                out.extend_from_slice(state.display_value(v).as_bytes());
            }
            b'q' => {
                arg += 1;
                let s = check_string(state, "format", arg)?;
                out.push(b'"');
                for ch in s {
                    match ch {
                        b'"' => out.extend_from_slice(b"\\\""),
                        b'\\' => out.extend_from_slice(b"\\\\"),
                        b'\n' => out.extend_from_slice(b"\\n"),
                        b'\r' => out.extend_from_slice(b"\\r"),
                        0 => out.extend_from_slice(b"\\0"),
                        _ => out.push(ch),
                    }
                }
                out.push(b'"');
            }
            other => {
                return Err(LuaError::Runtime(format!(
                    "invalid option '%{}' to 'format'",
                    other as char
                )));
            }
        }
    }
    state.push_string(&out)?;
    Ok(1)
}
