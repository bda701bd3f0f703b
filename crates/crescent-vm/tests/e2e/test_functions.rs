use super::helpers::*;

#[test]
fn test_multiple_returns() {
    run_check_nums(
        "local function two() return 1, 2 end
         local a, b = two()
         return a, b",
        &[1.0, 2.0],
    );
}

#[test]
fn test_result_count_adjustment() {
    // Callers get exactly what they asked for: extra results dropped,
    // missing ones nil-padded.
    let (_, results) = run_lua(
        "local function two() return 1, 2 end
         local a, b, c = two()
         local d = two()
         return a, b, c, d",
    );
    assert_num(&results, 0, 1.0);
    assert_num(&results, 1, 2.0);
    assert_nil(&results, 2);
    assert_num(&results, 3, 1.0);
}

#[test]
fn test_open_call_count_via_select() {
    run_check_nums(
        "local function three() return 7, 8, 9 end
         return select(\"#\", three()), select(\"#\", (three()))",
        &[3.0, 1.0],
    );
}

#[test]
fn test_call_forwards_all_results() {
    run_check_nums(
        "local function pair() return 3, 4 end
         local function sum(a, b) return a + b end
         return sum(pair())",
        &[7.0],
    );
}

#[test]
fn test_mid_list_call_truncated_to_one() {
    run_check_nums(
        "local function pair() return 3, 4 end
         local function sum(a, b) return a + b end
         return sum(pair(), 10)",
        &[13.0],
    );
}

#[test]
fn test_varargs_basic() {
    run_check_nums(
        "local function count(...) return select(\"#\", ...) end
         return count(), count(1), count(1, 2, 3)",
        &[0.0, 1.0, 3.0],
    );
}

#[test]
fn test_varargs_values() {
    run_check_nums(
        "local function second(...)
           local a, b = ...
           return b
         end
         return second(10, 20, 30)",
        &[20.0],
    );
}

#[test]
fn test_varargs_after_fixed_params() {
    run_check_nums(
        "local function f(first, ...)
           return first, select(\"#\", ...)
         end
         return f(1, 2, 3, 4)",
        &[1.0, 3.0],
    );
}

#[test]
fn test_varargs_forwarding() {
    run_check_nums(
        "local function sum(a, b, c) return a + b + c end
         local function fwd(...) return sum(...) end
         return fwd(1, 2, 3)",
        &[6.0],
    );
}

#[test]
fn test_vararg_in_table_constructor() {
    run_check_nums(
        "local function pack(...) return {...} end
         local t = pack(4, 5, 6)
         return #t, t[3]",
        &[3.0, 6.0],
    );
}

#[test]
fn test_toplevel_chunk_is_vararg() {
    let (_, results) = run_lua("return select(\"#\", ...)");
    assert_num(&results, 0, 0.0);
}

#[test]
fn test_deep_tail_recursion_does_not_grow_frames() {
    run_check_nums(
        "local function loop(n)
           if n == 0 then return 0 end
           return loop(n - 1)
         end
         return loop(100000)",
        &[0.0],
    );
}

#[test]
fn test_tail_call_passes_results_through() {
    run_check_nums(
        "local function inner() return 1, 2, 3 end
         local function outer() return inner() end
         return select(\"#\", outer())",
        &[3.0],
    );
}

#[test]
fn test_tail_call_into_host_function() {
    // A TAILCALL whose target is a native: results flow to the original
    // caller through the reused frame.
    run_check_nums(
        "local function t() return tonumber(\"21\") end
         return t() * 2",
        &[42.0],
    );
}

#[test]
fn test_method_call_sugar() {
    run_check_nums(
        "local obj = {factor = 3}
         function obj:scale(n) return self.factor * n end
         return obj:scale(5), obj.scale(obj, 7)",
        &[15.0, 21.0],
    );
}

#[test]
fn test_global_function_statement() {
    run_check_nums(
        "function double(x) return 2 * x end
         return double(21)",
        &[42.0],
    );
}

#[test]
fn test_nested_table_function_names() {
    run_check_nums(
        "lib = {}
         lib.math = {}
         function lib.math.twice(x) return x + x end
         return lib.math.twice(8)",
        &[16.0],
    );
}

#[test]
fn test_call_non_function_errors() {
    let msg = run_lua_err("local x = 5 x()");
    assert!(msg.contains("call"), "got: {msg}");
}

#[test]
fn test_functions_are_first_class() {
    run_check_nums(
        "local function apply(f, x) return f(x) end
         return apply(function(n) return n * n end, 9)",
        &[81.0],
    );
}
