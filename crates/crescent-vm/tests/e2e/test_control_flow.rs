use super::helpers::*;

#[test]
fn test_if_branches() {
    run_check_nums(
        "local function pick(n)
           if n < 0 then return -1
           elseif n == 0 then return 0
           else return 1 end
         end
         return pick(-5), pick(0), pick(9)",
        &[-1.0, 0.0, 1.0],
    );
}

#[test]
fn test_if_without_else() {
    run_check_nums(
        "local x = 1
         if false then x = 2 end
         return x",
        &[1.0],
    );
}

#[test]
fn test_while_loop() {
    run_check_nums(
        "local n, sum = 0, 0
         while n < 5 do n = n + 1 sum = sum + n end
         return n, sum",
        &[5.0, 15.0],
    );
}

#[test]
fn test_while_false_never_runs() {
    run_check_nums("local n = 0 while false do n = 1 end return n", &[0.0]);
}

#[test]
fn test_repeat_runs_at_least_once() {
    run_check_nums(
        "local n = 10
         repeat n = n + 1 until true
         return n",
        &[11.0],
    );
}

#[test]
fn test_repeat_until_condition_sees_body_local() {
    run_check_nums(
        "local n = 0
         repeat
           local done = n >= 3
           n = n + 1
         until done
         return n",
        &[4.0],
    );
}

#[test]
fn test_numeric_for() {
    run_check_nums(
        "local sum = 0
         for i = 1, 10 do sum = sum + i end
         return sum",
        &[55.0],
    );
}

#[test]
fn test_numeric_for_step() {
    run_check_nums(
        "local sum = 0
         for i = 10, 1, -2 do sum = sum + i end
         return sum",
        &[30.0],
    );
}

#[test]
fn test_numeric_for_fractional_step() {
    run_check_nums(
        "local n = 0
         for i = 0, 1, 0.25 do n = n + 1 end
         return n",
        &[5.0],
    );
}

#[test]
fn test_numeric_for_empty_range() {
    run_check_nums(
        "local n = 0
         for i = 5, 1 do n = n + 1 end
         return n",
        &[0.0],
    );
}

#[test]
fn test_numeric_for_zero_step_errors() {
    let msg = run_lua_err("for i = 1, 10, 0 do end");
    assert!(msg.contains("step"), "got: {msg}");
}

#[test]
fn test_for_var_is_local_to_loop() {
    run_check_nums(
        "local i = 99
         for i = 1, 3 do end
         return i",
        &[99.0],
    );
}

#[test]
fn test_generic_for_over_ipairs() {
    run_check_nums(
        "local t = {5, 6, 7}
         local keys, vals = 0, 0
         for i, v in ipairs(t) do keys = keys + i vals = vals + v end
         return keys, vals",
        &[6.0, 18.0],
    );
}

#[test]
fn test_generic_for_multiple_vars() {
    run_check_nums(
        "local t = {x = 1, y = 2}
         local n = 0
         for k, v in pairs(t) do n = n + v end
         return n",
        &[3.0],
    );
}

#[test]
fn test_break_in_loops() {
    run_check_nums(
        "local n = 0
         while true do n = n + 1 if n == 3 then break end end
         for i = 1, 100 do n = n + 1 if i == 2 then break end end
         return n",
        &[5.0],
    );
}

#[test]
fn test_nested_loops_break_inner_only() {
    run_check_nums(
        "local n = 0
         for i = 1, 3 do
           for j = 1, 10 do
             if j == 2 then break end
             n = n + 1
           end
         end
         return n",
        &[3.0],
    );
}

#[test]
fn test_do_block_scoping() {
    run_check_nums(
        "local x = 1
         do local x = 2 end
         return x",
        &[1.0],
    );
}

#[test]
fn test_condition_on_non_boolean_values() {
    run_check_nums(
        "local n = 0
         if 0 then n = n + 1 end
         if \"\" then n = n + 10 end
         if nil then n = n + 100 end
         return n",
        &[11.0],
    );
}
