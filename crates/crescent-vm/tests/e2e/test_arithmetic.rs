use super::helpers::*;

#[test]
fn test_basic_operations() {
    run_check_nums("return 1 + 2, 7 - 10, 6 * 7, 1 / 4", &[3.0, -3.0, 42.0, 0.25]);
}

#[test]
fn test_precedence() {
    run_check_nums("return 2 + 3 * 4, (2 + 3) * 4, 2 ^ 3 ^ 2", &[14.0, 20.0, 512.0]);
}

#[test]
fn test_mod_follows_divisor_sign() {
    run_check_nums(
        "return 5 % 3, -5 % 3, 5 % -3, -5 % -3",
        &[2.0, 1.0, -1.0, -2.0],
    );
}

#[test]
fn test_pow_and_unm() {
    run_check_nums("local x = 3 return -x, 2^-1, -2^2", &[-3.0, 0.5, -4.0]);
}

#[test]
fn test_runtime_arith_on_locals() {
    run_check_nums(
        "local a, b = 10, 4 return a + b, a - b, a * b, a / b, a % b, a ^ 2",
        &[14.0, 6.0, 40.0, 2.5, 2.0, 100.0],
    );
}

#[test]
fn test_string_number_coercion() {
    run_check_nums("return \"10\" + 5, \"2\" * \"3\"", &[15.0, 6.0]);
}

#[test]
fn test_arith_error_on_table() {
    let msg = run_lua_err("local t = {} return t + 1");
    assert!(msg.contains("perform arithmetic"), "got: {msg}");
}

#[test]
fn test_comparisons() {
    let (_, results) = run_lua(
        "local a, b = 1, 2 return a < b, a <= b, a > b, a >= b, a == b, a ~= b",
    );
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, true);
    assert_bool(&results, 2, false);
    assert_bool(&results, 3, false);
    assert_bool(&results, 4, false);
    assert_bool(&results, 5, true);
}

#[test]
fn test_string_comparison() {
    let (_, results) = run_lua("return \"abc\" < \"abd\", \"a\" <= \"a\", \"b\" > \"a\"");
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, true);
    assert_bool(&results, 2, true);
}

#[test]
fn test_mixed_comparison_errors() {
    let msg = run_lua_err("return 1 < \"2\"");
    assert!(msg.contains("compare"), "got: {msg}");
}

#[test]
fn test_equality_across_types_is_false() {
    let (_, results) = run_lua("return 1 == \"1\", nil == false, {} == {}");
    assert_bool(&results, 0, false);
    assert_bool(&results, 1, false);
    assert_bool(&results, 2, false);
}

#[test]
fn test_concat() {
    let (state, results) = run_lua("return \"x\" .. \"y\" .. \"z\", \"n=\" .. 42, 1 .. 2");
    assert_str(&state, &results, 0, "xyz");
    assert_str(&state, &results, 1, "n=42");
    assert_str(&state, &results, 2, "12");
}

#[test]
fn test_concat_binds_looser_than_add() {
    let (state, results) = run_lua("return \"v\" .. 1 + 1");
    assert_str(&state, &results, 0, "v2");
}

#[test]
fn test_concat_error() {
    let msg = run_lua_err("return \"x\" .. {}");
    assert!(msg.contains("concatenate"), "got: {msg}");
}

#[test]
fn test_and_or_values() {
    let (state, results) = run_lua(
        "return 1 and 2, nil and 2, false or \"fb\", 4 or 5, nil or false",
    );
    assert_num(&results, 0, 2.0);
    assert_nil(&results, 1);
    assert_str(&state, &results, 2, "fb");
    assert_num(&results, 3, 4.0);
    assert_bool(&results, 4, false);
}

#[test]
fn test_short_circuit_skips_side_effects() {
    run_check_nums(
        "local n = 0
         local function bump() n = n + 1 return true end
         local _ = false and bump()
         local _ = true or bump()
         return n",
        &[0.0],
    );
}

#[test]
fn test_length_operator() {
    run_check_nums("local t = {1, 2, 3} return #t, #\"hello\"", &[3.0, 5.0]);
}

#[test]
fn test_length_error() {
    let msg = run_lua_err("return #42");
    assert!(msg.contains("length"), "got: {msg}");
}

#[test]
fn test_nan_inequality() {
    let (_, results) = run_lua("local nan = 0/0 return nan == nan, nan ~= nan");
    assert_bool(&results, 0, false);
    assert_bool(&results, 1, true);
}
