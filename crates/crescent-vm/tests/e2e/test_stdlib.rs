use super::helpers::*;

#[test]
fn test_type() {
    let (state, results) = run_lua(
        "return type(nil), type(true), type(1), type(\"s\"), type({}), type(print)",
    );
    assert_str(&state, &results, 0, "nil");
    assert_str(&state, &results, 1, "boolean");
    assert_str(&state, &results, 2, "number");
    assert_str(&state, &results, 3, "string");
    assert_str(&state, &results, 4, "table");
    assert_str(&state, &results, 5, "function");
}

#[test]
fn test_tostring() {
    let (state, results) = run_lua("return tostring(nil), tostring(12), tostring(true)");
    assert_str(&state, &results, 0, "nil");
    assert_str(&state, &results, 1, "12");
    assert_str(&state, &results, 2, "true");
}

#[test]
fn test_tonumber() {
    let (_, results) = run_lua(
        "return tonumber(\"42\"), tonumber(\"3.5\"), tonumber(\"0x10\"),
                tonumber(\"zzz\"), tonumber(\"ff\", 16), tonumber(7)",
    );
    assert_num(&results, 0, 42.0);
    assert_num(&results, 1, 3.5);
    assert_num(&results, 2, 16.0);
    assert_nil(&results, 3);
    assert_num(&results, 4, 255.0);
    assert_num(&results, 5, 7.0);
}

#[test]
fn test_globals_environment() {
    let (state, results) = run_lua("return _VERSION, _G ~= nil, _G.print == print");
    assert_str(&state, &results, 0, "Lua 5.1");
    assert_bool(&results, 1, true);
    assert_bool(&results, 2, true);
}

#[test]
fn test_qualified_flat_names_registered() {
    // Library functions are also bound flat under "lib.name" in globals.
    let (_, results) = run_lua(
        "return rawget(_G, \"string.upper\") == string.upper,
                rawget(_G, \"math.floor\") == math.floor,
                rawget(_G, \"table.insert\") == table.insert",
    );
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, true);
    assert_bool(&results, 2, true);
}

#[test]
fn test_string_functions() {
    let (state, results) = run_lua(
        "return string.upper(\"abc\"), string.lower(\"ABC\"),
                string.len(\"hello\"), string.rep(\"ab\", 3),
                string.reverse(\"abc\"), string.sub(\"hello\", 2, 4),
                string.sub(\"hello\", -3)",
    );
    assert_str(&state, &results, 0, "ABC");
    assert_str(&state, &results, 1, "abc");
    assert_num(&results, 2, 5.0);
    assert_str(&state, &results, 3, "ababab");
    assert_str(&state, &results, 4, "cba");
    assert_str(&state, &results, 5, "ell");
    assert_str(&state, &results, 6, "llo");
}

#[test]
fn test_string_byte_char() {
    let (state, results) = run_lua(
        "return string.byte(\"A\"), string.char(104, 105), string.byte(\"abc\", 2)",
    );
    assert_num(&results, 0, 65.0);
    assert_str(&state, &results, 1, "hi");
    assert_num(&results, 2, 98.0);
}

#[test]
fn test_string_format() {
    let (state, results) = run_lua(
        "return string.format(\"%d/%s/%x\", 10, \"s\", 255),
                string.format(\"%q\", \"a\\\"b\"),
                string.format(\"100%%\")",
    );
    assert_str(&state, &results, 0, "10/s/ff");
    assert_str(&state, &results, 1, "\"a\\\"b\"");
    assert_str(&state, &results, 2, "100%");
}

#[test]
fn test_table_insert_remove() {
    run_check_nums(
        "local t = {1, 2, 3}
         table.insert(t, 4)
         table.insert(t, 1, 0)
         local removed = table.remove(t, 1)
         local last = table.remove(t)
         return #t, removed, last, t[1]",
        &[3.0, 0.0, 4.0, 1.0],
    );
}

#[test]
fn test_table_concat() {
    let (state, results) = run_lua(
        "local t = {1, 2, 3}
         return table.concat(t), table.concat(t, \"-\"), table.concat(t, \",\", 2, 3)",
    );
    assert_str(&state, &results, 0, "123");
    assert_str(&state, &results, 1, "1-2-3");
    assert_str(&state, &results, 2, "2,3");
}

#[test]
fn test_table_maxn() {
    run_check_nums(
        "local t = {1, 2}
         t[10.5] = true
         return table.maxn(t)",
        &[10.5],
    );
}

#[test]
fn test_math_functions() {
    run_check_nums(
        "return math.abs(-3), math.floor(3.7), math.ceil(3.2),
                math.sqrt(16), math.max(1, 9, 4), math.min(1, 9, 4),
                math.fmod(7, 3), math.pow(2, 8)",
        &[3.0, 3.0, 4.0, 4.0, 9.0, 1.0, 1.0, 256.0],
    );
}

#[test]
fn test_math_modf() {
    run_check_nums("return math.modf(3.75)", &[3.0, 0.75]);
}

#[test]
fn test_math_constants() {
    let (_, results) = run_lua(
        "return math.pi > 3.14 and math.pi < 3.15, math.huge > 1e300",
    );
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, true);
}

#[test]
fn test_math_random_range() {
    let (_, results) = run_lua(
        "math.randomseed(7)
         local ok = true
         for i = 1, 50 do
           local r = math.random(3)
           if r < 1 or r > 3 or r ~= math.floor(r) then ok = false end
           local u = math.random()
           if u < 0 or u >= 1 then ok = false end
         end
         return ok",
    );
    assert_bool(&results, 0, true);
}

#[test]
fn test_unpack() {
    run_check_nums(
        "local t = {10, 20, 30}
         local a, b, c = unpack(t)
         return a, b, c, select(\"#\", unpack(t, 2))",
        &[10.0, 20.0, 30.0, 2.0],
    );
}

#[test]
fn test_raw_access() {
    let (_, results) = run_lua(
        "local t = {}
         rawset(t, \"k\", 5)
         return rawget(t, \"k\"), rawequal(t, t), rawequal(t, {}), rawlen({1, 2})",
    );
    assert_num(&results, 0, 5.0);
    assert_bool(&results, 1, true);
    assert_bool(&results, 2, false);
    assert_num(&results, 3, 2.0);
}

#[test]
fn test_metatable_storage() {
    let (_, results) = run_lua(
        "local t, mt = {}, {}
         setmetatable(t, mt)
         local got = getmetatable(t)
         setmetatable(t, nil)
         return got == mt, getmetatable(t) == nil",
    );
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, true);
}

#[test]
fn test_assert() {
    run_check_nums("return assert(42)", &[42.0]);
    let msg = run_lua_err("assert(false, \"custom failure\")");
    assert!(msg.contains("custom failure"), "got: {msg}");
    let msg = run_lua_err("assert(nil)");
    assert!(msg.contains("assertion failed"), "got: {msg}");
}

#[test]
fn test_select_tail() {
    run_check_nums("return select(2, 10, 20, 30)", &[20.0, 30.0]);
}

#[test]
fn test_collectgarbage_count() {
    let (_, results) = run_lua("return collectgarbage(\"count\") > 0");
    assert_bool(&results, 0, true);
}
