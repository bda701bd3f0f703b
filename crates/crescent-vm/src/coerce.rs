//! Number/string coercion helpers for Lua 5.1 semantics.

use crescent_core::string::StringPool;
use crescent_core::value::Value;

/// Try to convert a value to a number. Strings parse as decimal or hex
/// numerals (leading/trailing whitespace allowed).
pub fn to_number(v: Value, strings: &StringPool) -> Option<f64> {
    if let Some(n) = v.as_number() {
        return Some(n);
    }
    if let Some(sid) = v.as_str_id() {
        let s = std::str::from_utf8(strings.get_bytes(sid)).ok()?;
        return parse_number(s);
    }
    None
}

/// Parse a Lua numeral: decimal (with fraction/exponent) or 0x hex.
/// "inf"/"nan" words are not numerals.
pub fn parse_number(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };

    let val = if let Some(hex) = body
        .strip_prefix("0x")
        .or_else(|| body.strip_prefix("0X"))
    {
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let mut v: f64 = 0.0;
        for c in hex.chars() {
            v = v * 16.0 + c.to_digit(16)? as f64;
        }
        v
    } else {
        let lower = body.to_ascii_lowercase();
        if lower.starts_with("inf") || lower.starts_with("nan") {
            return None;
        }
        body.parse::<f64>().ok()?
    };

    Some(if neg { -val } else { val })
}

/// Format a number the way Lua 5.1 prints it (%.14g): integral values
/// have no decimal point, everything else gets up to 14 significant
/// digits.
pub fn number_to_string(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f == f.trunc() && f.abs() < 1e15 {
        // %.14g renders integral values without a fraction
        return format!("{}", f as i64);
    }
    format_g14(f)
}

/// Approximate C's `%.14g` for a finite, non-integral float.
fn format_g14(f: f64) -> String {
    let abs = f.abs();
    let exp = abs.log10().floor() as i32;
    if (-5..14).contains(&exp) {
        let decimals = (13 - exp).max(0) as usize;
        let s = format!("{:.*}", decimals, f);
        trim_trailing_zeros(&s)
    } else {
        let s = format!("{:.13e}", f);
        fix_scientific_notation(&s)
    }
}

fn trim_trailing_zeros(s: &str) -> String {
    if !s.contains('.') {
        return s.to_string();
    }
    let t = s.trim_end_matches('0');
    let t = t.strip_suffix('.').unwrap_or(t);
    t.to_string()
}

/// Rust prints "1.23e5"; C's %g prints "1.23e+05".
fn fix_scientific_notation(s: &str) -> String {
    let Some(e_pos) = s.find('e') else {
        return s.to_string();
    };
    let mantissa = trim_trailing_zeros(&s[..e_pos]);
    let exp_str = &s[e_pos + 1..];
    let (sign, digits) = match exp_str.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("+", exp_str.strip_prefix('+').unwrap_or(exp_str)),
    };
    let exp_num: i32 = digits.parse().unwrap_or(0);
    format!("{}e{}{:02}", mantissa, sign, exp_num.abs())
}
