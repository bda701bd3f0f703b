//! Math library over f64 with a thread-local xorshift PRNG.

use crate::{arg_error, check_number, opt_number, register_lib_fn};
use crescent_core::value::Value;
use crescent_vm::{LuaError, State};
use std::cell::Cell;

thread_local! {
    static RNG_STATE: Cell<u64> = const { Cell::new(0x2545F4914F6CDD1D) };
}

/// xorshift64* step.
fn next_rand() -> u64 {
    RNG_STATE.with(|cell| {
        let mut x = cell.get();
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        cell.set(x);
        x.wrapping_mul(0x2545F4914F6CDD1D)
    })
}

/// Random float in [0, 1).
fn rand_unit() -> f64 {
    (next_rand() >> 11) as f64 * (1.0 / 9007199254740992.0)
}

pub fn register(state: &mut State) -> Result<(), LuaError> {
    let lib = state.heap.alloc_table(0, 32);

    register_lib_fn(state, lib, "math", "abs", native_abs)?;
    register_lib_fn(state, lib, "math", "ceil", native_ceil)?;
    register_lib_fn(state, lib, "math", "floor", native_floor)?;
    register_lib_fn(state, lib, "math", "sqrt", native_sqrt)?;
    register_lib_fn(state, lib, "math", "sin", native_sin)?;
    register_lib_fn(state, lib, "math", "cos", native_cos)?;
    register_lib_fn(state, lib, "math", "tan", native_tan)?;
    register_lib_fn(state, lib, "math", "asin", native_asin)?;
    register_lib_fn(state, lib, "math", "acos", native_acos)?;
    register_lib_fn(state, lib, "math", "atan", native_atan)?;
    register_lib_fn(state, lib, "math", "exp", native_exp)?;
    register_lib_fn(state, lib, "math", "log", native_log)?;
    register_lib_fn(state, lib, "math", "log10", native_log10)?;
    register_lib_fn(state, lib, "math", "fmod", native_fmod)?;
    register_lib_fn(state, lib, "math", "modf", native_modf)?;
    register_lib_fn(state, lib, "math", "max", native_max)?;
    register_lib_fn(state, lib, "math", "min", native_min)?;
    register_lib_fn(state, lib, "math", "pow", native_pow)?;
    register_lib_fn(state, lib, "math", "random", native_random)?;
    register_lib_fn(state, lib, "math", "randomseed", native_randomseed)?;

    let pi = state.intern(b"pi");
    state
        .heap
        .get_table_mut(lib)
        .raw_set_str(pi, Value::from_number(std::f64::consts::PI));
    let huge = state.intern(b"huge");
    state
        .heap
        .get_table_mut(lib)
        .raw_set_str(huge, Value::from_number(f64::INFINITY));

    state.global_set(b"math", Value::from_table(lib));
    Ok(())
}

macro_rules! unary_math {
    ($fn_name:ident, $name:literal, $op:expr) => {
        fn $fn_name(state: &mut State) -> Result<i32, LuaError> {
            let x = check_number(state, $name, 1)?;
            let f: fn(f64) -> f64 = $op;
            state.push_number(f(x))?;
            Ok(1)
        }
    };
}

unary_math!(native_abs, "abs", f64::abs);
unary_math!(native_ceil, "ceil", f64::ceil);
unary_math!(native_floor, "floor", f64::floor);
unary_math!(native_sqrt, "sqrt", f64::sqrt);
unary_math!(native_sin, "sin", f64::sin);
unary_math!(native_cos, "cos", f64::cos);
unary_math!(native_tan, "tan", f64::tan);
unary_math!(native_asin, "asin", f64::asin);
unary_math!(native_acos, "acos", f64::acos);
unary_math!(native_atan, "atan", f64::atan);
unary_math!(native_exp, "exp", f64::exp);
unary_math!(native_log10, "log10", f64::log10);

fn native_log(state: &mut State) -> Result<i32, LuaError> {
    let x = check_number(state, "log", 1)?;
    state.push_number(x.ln())?;
    Ok(1)
}

fn native_fmod(state: &mut State) -> Result<i32, LuaError> {
    let a = check_number(state, "fmod", 1)?;
    let b = check_number(state, "fmod", 2)?;
    state.push_number(a % b)?;
    Ok(1)
}

fn native_modf(state: &mut State) -> Result<i32, LuaError> {
    let x = check_number(state, "modf", 1)?;
    let int = x.trunc();
    state.push_number(int)?;
    state.push_number(x - int)?;
    Ok(2)
}

fn native_max(state: &mut State) -> Result<i32, LuaError> {
    let nargs = state.get_top();
    let mut best = check_number(state, "max", 1)?;
    for i in 2..=nargs {
        let x = check_number(state, "max", i)?;
        if x > best {
            best = x;
        }
    }
    state.push_number(best)?;
    Ok(1)
}

fn native_min(state: &mut State) -> Result<i32, LuaError> {
    let nargs = state.get_top();
    let mut best = check_number(state, "min", 1)?;
    for i in 2..=nargs {
        let x = check_number(state, "min", i)?;
        if x < best {
            best = x;
        }
    }
    state.push_number(best)?;
    Ok(1)
}

fn native_pow(state: &mut State) -> Result<i32, LuaError> {
    let a = check_number(state, "pow", 1)?;
    let b = check_number(state, "pow", 2)?;
    state.push_number(a.powf(b))?;
    Ok(1)
}

fn native_random(state: &mut State) -> Result<i32, LuaError> {
    let nargs = state.get_top();
    let r = rand_unit();
    let result = match nargs {
        0 => r,
        1 => {
            let m = check_number(state, "random", 1)?;
            if m < 1.0 {
                return Err(arg_error("random", 1, "interval is empty", "number"));
            }
            (r * m).floor() + 1.0
        }
        _ => {
            let m = check_number(state, "random", 1)?;
            let n = check_number(state, "random", 2)?;
            if m > n {
                return Err(arg_error("random", 2, "interval is empty", "number"));
            }
            (r * (n - m + 1.0)).floor() + m
        }
    };
    state.push_number(result)?;
    Ok(1)
}

fn native_randomseed(state: &mut State) -> Result<i32, LuaError> {
    let seed = check_number(state, "randomseed", 1)?;
    let bits = seed.to_bits() | 1; // xorshift state must be non-zero
    RNG_STATE.with(|cell| cell.set(bits));
    Ok(0)
}
