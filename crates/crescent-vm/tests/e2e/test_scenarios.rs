//! The lettered end-to-end scenarios, asserted through the print capture.

use super::helpers::*;

#[test]
fn scenario_a_hello() {
    let (mut state, _) = run_lua("print(\"hello\")");
    assert_eq!(printed_lines(&mut state), vec!["hello"]);
}

#[test]
fn scenario_b_table_length_and_index() {
    let (mut state, _) = run_lua("local t = {10,20,30}; print(#t, t[2])");
    assert_eq!(printed_lines(&mut state), vec!["3\t20"]);
}

#[test]
fn scenario_c_closure_counter() {
    let (mut state, _) = run_lua(
        "local function mk() local x=0; return function() x=x+1; return x end end
         local f=mk()
         print(f(),f(),f())",
    );
    assert_eq!(printed_lines(&mut state), vec!["1\t2\t3"]);
}

#[test]
fn scenario_d_loop_with_wrapped_print() {
    let (mut state, _) = run_lua(
        "local function io_sentinel_print(v) print(v) end
         for i=1,3 do io_sentinel_print(i*i) end",
    );
    assert_eq!(printed_lines(&mut state), vec!["1", "4", "9"]);
}

#[test]
fn scenario_e_cycle_collected() {
    let (mut state, _) = run_lua("a = {}; b = {}; a.b = b; b.a = a");
    run_in(&mut state, "collectgarbage()");
    let before = state.heap.tables.iter().filter(|t| t.is_some()).count();
    run_in(&mut state, "a = nil; b = nil; collectgarbage()");
    let after = state.heap.tables.iter().filter(|t| t.is_some()).count();
    assert!(after + 2 <= before, "{before} -> {after}");
}

#[test]
fn scenario_f_interned_string_equality() {
    let (mut state, _) = run_lua(
        "local s1=\"abc\"; local s2=\"ab\"..\"c\"; print(s1==s2, rawequal(s1,s2))",
    );
    assert_eq!(printed_lines(&mut state), vec!["true\ttrue"]);
}
