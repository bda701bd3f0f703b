use super::helpers::*;

#[test]
fn test_constructor_array() {
    run_check_nums(
        "local t = {10, 20, 30} return t[1], t[2], t[3], #t",
        &[10.0, 20.0, 30.0, 3.0],
    );
}

#[test]
fn test_constructor_hash_and_mixed() {
    let (state, results) = run_lua(
        "local t = {x = 1, [\"y\"] = 2, 10, z = 3, 20}
         return t.x, t.y, t.z, t[1], t[2]",
    );
    let _ = state;
    assert_num(&results, 0, 1.0);
    assert_num(&results, 1, 2.0);
    assert_num(&results, 2, 3.0);
    assert_num(&results, 3, 10.0);
    assert_num(&results, 4, 20.0);
}

#[test]
fn test_index_read_write() {
    run_check_nums(
        "local t = {}
         t[1] = 100
         t.name = 200
         t[\"key\"] = 300
         t[2.5] = 400
         return t[1], t.name, t[\"key\"], t[2.5]",
        &[100.0, 200.0, 300.0, 400.0],
    );
}

#[test]
fn test_missing_keys_are_nil() {
    let (_, results) = run_lua("local t = {} return t[1], t.x");
    assert_nil(&results, 0);
    assert_nil(&results, 1);
}

#[test]
fn test_set_nil_removes() {
    let (_, results) = run_lua(
        "local t = {x = 1}
         t[3] = 5
         t.x = nil
         t[3] = nil
         return t.x, t[3]",
    );
    assert_nil(&results, 0);
    assert_nil(&results, 1);
}

#[test]
fn test_nil_index_write_errors() {
    let msg = run_lua_err("local t = {} t[nil] = 1");
    assert!(msg.contains("table index is nil"), "got: {msg}");
}

#[test]
fn test_index_non_table_errors() {
    let msg = run_lua_err("local x = 5 return x.field");
    assert!(msg.contains("index"), "got: {msg}");
}

#[test]
fn test_length_is_a_border() {
    run_check_nums(
        "local t = {1, 2, 3, 4}
         t[4] = nil
         local a = #t
         t[4] = 4
         t[2] = nil
         return a, #t",
        &[3.0, 4.0],
    );
}

#[test]
fn test_length_invariant_no_holes() {
    // For every n in [1, #t], t[n] is non-nil.
    let (_, results) = run_lua(
        "local t = {}
         for i = 1, 10 do t[i] = i * i end
         local ok = true
         for i = 1, #t do if t[i] == nil then ok = false end end
         return ok, #t",
    );
    assert_bool(&results, 0, true);
    assert_num(&results, 1, 10.0);
}

#[test]
fn test_keys_past_array_threshold() {
    // Keys beyond 50 spill into the hash part but read back fine.
    run_check_nums(
        "local t = {}
         for i = 1, 80 do t[i] = i end
         return t[50], t[51], t[80]",
        &[50.0, 51.0, 80.0],
    );
}

#[test]
fn test_large_constructor_batches() {
    // More than one SETLIST flush.
    let fields: Vec<String> = (1..=120).map(|i| i.to_string()).collect();
    let src = format!(
        "local t = {{{}}} return t[1], t[50], t[51], t[120]",
        fields.join(", ")
    );
    run_check_nums(&src, &[1.0, 50.0, 51.0, 120.0]);
}

#[test]
fn test_constructor_spreads_last_call() {
    run_check_nums(
        "local function three() return 7, 8, 9 end
         local t = {1, three()}
         return #t, t[2], t[4]",
        &[4.0, 7.0, 9.0],
    );
}

#[test]
fn test_next_traversal_visits_everything_once() {
    // Property: next(t, nil) .. next == nil visits each non-nil entry
    // exactly once.
    run_check_nums(
        "local t = {10, 20, a = 1, b = 2}
         local count, sum = 0, 0
         local k, v = next(t, nil)
         while k ~= nil do
           count = count + 1
           sum = sum + v
           k, v = next(t, k)
         end
         return count, sum",
        &[4.0, 33.0],
    );
}

#[test]
fn test_pairs_iteration() {
    run_check_nums(
        "local t = {1, 2, 3, x = 10}
         local n = 0
         for k, v in pairs(t) do n = n + v end
         return n",
        &[16.0],
    );
}

#[test]
fn test_ipairs_stops_at_hole() {
    run_check_nums(
        "local t = {1, 2, 3}
         t[5] = 5
         local last = 0
         for i, v in ipairs(t) do last = i end
         return last",
        &[3.0],
    );
}

#[test]
fn test_delete_during_iteration_of_seen_key() {
    run_check_nums(
        "local t = {a = 1, b = 2, c = 3}
         local n = 0
         for k, v in pairs(t) do
           n = n + 1
           t[k] = nil
         end
         return n",
        &[3.0],
    );
}

#[test]
fn test_tables_compare_by_identity() {
    let (_, results) = run_lua(
        "local a = {}
         local b = a
         return a == b, a == {}",
    );
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, false);
}

#[test]
fn test_boolean_and_fraction_keys() {
    run_check_nums(
        "local t = {}
         t[true] = 1
         t[false] = 2
         t[0.5] = 3
         return t[true], t[false], t[0.5]",
        &[1.0, 2.0, 3.0],
    );
}

#[test]
fn test_table_as_key() {
    run_check_nums(
        "local k = {}
         local t = {}
         t[k] = 99
         return t[k]",
        &[99.0],
    );
}
