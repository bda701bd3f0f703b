use super::helpers::*;

fn live_tables(state: &crescent_vm::State) -> usize {
    state.heap.tables.iter().filter(|t| t.is_some()).count()
}

#[test]
fn test_unreachable_cycle_is_collected() {
    // Two tables referring to each other die as a unit once unreachable.
    let (mut state, _) = run_lua(
        "x = {}
         y = {}
         x.other = y
         y.other = x",
    );
    run_in(&mut state, "collectgarbage()");
    let with_cycle = live_tables(&state);
    run_in(&mut state, "x = nil y = nil collectgarbage()");
    let without_cycle = live_tables(&state);
    assert!(
        without_cycle + 2 <= with_cycle,
        "cycle survived: {with_cycle} -> {without_cycle}"
    );
}

#[test]
fn test_reachable_objects_survive_collection() {
    run_check_nums(
        "keep = {1, 2, 3}
         local held = {42}
         collectgarbage()
         collectgarbage()
         return keep[3], held[1]",
        &[3.0, 42.0],
    );
}

#[test]
fn test_collection_during_allocation_storm() {
    // Enough garbage to cross the threshold repeatedly mid-execution.
    run_check_nums(
        "local last
         for i = 1, 5000 do
           last = {i, tostring(i)}
         end
         return last[1]",
        &[5000.0],
    );
}

#[test]
fn test_closures_keep_upvalues_alive_across_gc() {
    run_check_nums(
        "local function mk()
           local secret = {payload = 77}
           return function() return secret.payload end
         end
         local f = mk()
         collectgarbage()
         collectgarbage()
         return f()",
        &[77.0],
    );
}

#[test]
fn test_strings_in_tables_survive() {
    let (state, results) = run_lua(
        "local t = {}
         t[\"the-key\"] = \"the-value\"
         collectgarbage()
         return t[\"the-key\"]",
    );
    assert_str(&state, &results, 0, "the-value");
}

#[test]
fn test_globals_are_roots() {
    run_check_nums(
        "root = {nested = {deep = {1}}}
         collectgarbage()
         return root.nested.deep[1]",
        &[1.0],
    );
}

#[test]
fn test_collectgarbage_returns_zero() {
    run_check_nums("return collectgarbage()", &[0.0]);
    run_check_nums("return collectgarbage(\"collect\")", &[0.0]);
}

#[test]
fn test_count_shrinks_after_release() {
    let (_, results) = run_lua(
        "local t = {}
         for i = 1, 500 do t[i] = {} end
         collectgarbage()
         local before = collectgarbage(\"count\")
         for i = 1, 500 do t[i] = nil end
         collectgarbage()
         local after = collectgarbage(\"count\")
         return before > after",
    );
    assert_bool(&results, 0, true);
}
