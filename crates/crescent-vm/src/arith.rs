//! Arithmetic and concatenation with Lua 5.1 semantics.
//!
//! All arithmetic is IEEE-754 double precision. Strings that look like
//! numbers coerce in arithmetic; numbers format as strings in concat.

use crate::coerce;
use crate::error::LuaError;
use crescent_core::object::type_name;
use crescent_core::string::StringPool;
use crescent_core::value::Value;

/// Arithmetic operation selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

/// Perform a binary arithmetic operation with string coercion.
pub fn arith_op(
    op: ArithOp,
    a: Value,
    b: Value,
    strings: &StringPool,
) -> Result<Value, LuaError> {
    let fa = coerce::to_number(a, strings)
        .ok_or(LuaError::AttemptToPerformArithmetic { got: type_name(a) })?;
    let fb = coerce::to_number(b, strings)
        .ok_or(LuaError::AttemptToPerformArithmetic { got: type_name(b) })?;
    let result = match op {
        ArithOp::Add => fa + fb,
        ArithOp::Sub => fa - fb,
        ArithOp::Mul => fa * fb,
        ArithOp::Div => fa / fb,
        ArithOp::Mod => num_mod(fa, fb),
        ArithOp::Pow => fa.powf(fb),
    };
    Ok(Value::from_number(result))
}

/// Lua modulo: a - floor(a/b)*b (result takes the divisor's sign).
pub fn num_mod(a: f64, b: f64) -> f64 {
    a - (a / b).floor() * b
}

/// Unary minus with string coercion.
pub fn arith_unm(v: Value, strings: &StringPool) -> Result<Value, LuaError> {
    let f = coerce::to_number(v, strings)
        .ok_or(LuaError::AttemptToPerformArithmetic { got: type_name(v) })?;
    Ok(Value::from_number(-f))
}

/// Concatenate values into one byte buffer: strings pass through,
/// numbers format, anything else errors.
pub fn concat_bytes(values: &[Value], strings: &StringPool) -> Result<Vec<u8>, LuaError> {
    let mut out = Vec::new();
    for &v in values {
        if let Some(sid) = v.as_str_id() {
            out.extend_from_slice(strings.get_bytes(sid));
        } else if let Some(n) = v.as_number() {
            out.extend_from_slice(coerce::number_to_string(n).as_bytes());
        } else {
            return Err(LuaError::AttemptToConcatenate { got: type_name(v) });
        }
    }
    Ok(out)
}
