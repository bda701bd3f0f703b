use super::helpers::*;

#[test]
fn test_pcall_success() {
    run_check_nums(
        "local ok, a, b = pcall(function() return 1, 2 end)
         return ok and 1 or 0, a, b",
        &[1.0, 1.0, 2.0],
    );
}

#[test]
fn test_pcall_catches_type_error() {
    let (state, results) = run_lua(
        "local ok, err = pcall(function() return {} + 1 end)
         return ok, err",
    );
    assert_bool(&results, 0, false);
    let sid = results[1].as_str_id().expect("message");
    let msg = String::from_utf8_lossy(state.strings.get_bytes(sid));
    assert!(msg.contains("arithmetic"), "got: {msg}");
}

#[test]
fn test_pcall_catches_nil_index() {
    let (_, results) = run_lua(
        "local ok = pcall(function() local t t.x = 1 end)
         return ok",
    );
    assert_bool(&results, 0, false);
}

#[test]
fn test_error_with_string() {
    let (state, results) = run_lua(
        "local ok, err = pcall(function() error(\"boom\") end)
         return ok, err",
    );
    assert_bool(&results, 0, false);
    assert_str(&state, &results, 1, "boom");
}

#[test]
fn test_error_with_table_value() {
    run_check_nums(
        "local ok, err = pcall(function() error({code = 7}) end)
         return err.code",
        &[7.0],
    );
}

#[test]
fn test_error_unwinds_nested_frames() {
    run_check_nums(
        "local function level3() error(\"deep\") end
         local function level2() level3() return 1 end
         local function level1() level2() return 2 end
         local ok = pcall(level1)
         return ok and 1 or 0",
        &[0.0],
    );
}

#[test]
fn test_execution_continues_after_pcall() {
    run_check_nums(
        "local n = 0
         pcall(function() n = 1 error(\"x\") n = 2 end)
         n = n + 10
         return n",
        &[11.0],
    );
}

#[test]
fn test_nested_pcall() {
    let (state, results) = run_lua(
        "local ok1, err1 = pcall(function()
           local ok2, err2 = pcall(function() error(\"inner\") end)
           error(\"outer: \" .. tostring(err2) .. \"/\" .. tostring(ok2))
         end)
         return ok1, err1",
    );
    assert_bool(&results, 0, false);
    assert_str(&state, &results, 1, "outer: inner/false");
}

#[test]
fn test_uncaught_error_surfaces_to_host() {
    let msg = run_lua_err("error(\"unprotected\")");
    assert!(msg.contains("unprotected"), "got: {msg}");
}

#[test]
fn test_stack_overflow_is_catchable() {
    let (state, results) = run_lua(
        "local function grow(n) return 1 + grow(n + 1) end
         local ok, err = pcall(grow, 1)
         return ok, err",
    );
    assert_bool(&results, 0, false);
    let sid = results[1].as_str_id().expect("message");
    let msg = String::from_utf8_lossy(state.strings.get_bytes(sid));
    assert!(msg.contains("stack overflow"), "got: {msg}");
}

#[test]
fn test_pcall_with_arguments() {
    run_check_nums(
        "local function add(a, b) return a + b end
         local ok, sum = pcall(add, 4, 5)
         return sum",
        &[9.0],
    );
}

#[test]
fn test_upvalues_closed_on_error_unwind() {
    run_check_nums(
        "local get
         pcall(function()
           local x = 123
           get = function() return x end
           error(\"unwind\")
         end)
         collectgarbage()
         return get()",
        &[123.0],
    );
}

#[test]
fn test_compile_error_surfaces() {
    let mut state = new_state();
    let err = state.load(b"local = broken", "=test").unwrap_err();
    assert!(matches!(err, crescent_vm::LuaError::Compile(_)));
}
