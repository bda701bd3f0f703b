//! Embedding-API behavior driven from host code: registered natives,
//! re-entrant calls, c-closure upvalues, and host/script interleaving.

use super::helpers::*;
use crescent_core::value::Value;
use crescent_vm::{LuaError, State, MULTRET};

fn native_double(state: &mut State) -> Result<i32, LuaError> {
    let n = state
        .to_number(1)
        .ok_or(LuaError::Runtime("number expected".into()))?;
    state.push_number(n * 2.0)?;
    Ok(1)
}

fn native_sum_all(state: &mut State) -> Result<i32, LuaError> {
    let nargs = state.get_top();
    let mut sum = 0.0;
    for i in 1..=nargs {
        sum += state.to_number(i as i32).unwrap_or(0.0);
    }
    state.push_number(sum)?;
    Ok(1)
}

/// Calls its first argument with its second (host-to-script re-entry).
fn native_invoke(state: &mut State) -> Result<i32, LuaError> {
    let f = state.to_value(1);
    let arg = state.to_value(2);
    state.push_value(f)?;
    state.push_value(arg)?;
    state.call(1, 1)?;
    Ok(1)
}

fn native_upvalue_add(state: &mut State) -> Result<i32, LuaError> {
    let bias = state.native_upvalue(0).as_number().unwrap_or(0.0);
    let n = state.to_number(1).unwrap_or(0.0);
    state.push_number(bias + n)?;
    Ok(1)
}

#[test]
fn test_host_function_from_script() {
    let mut state = new_state();
    state.push_c_function(native_double, "double").unwrap();
    state.set_global("double").unwrap();
    let results = run_in(&mut state, "return double(21)");
    assert_num(&results, 0, 42.0);
}

#[test]
fn test_host_sees_all_arguments() {
    let mut state = new_state();
    state.push_c_function(native_sum_all, "sum_all").unwrap();
    state.set_global("sum_all").unwrap();
    let results = run_in(&mut state, "return sum_all(1, 2, 3, 4)");
    assert_num(&results, 0, 10.0);
}

#[test]
fn test_host_to_script_reentry() {
    let mut state = new_state();
    state.push_c_function(native_invoke, "invoke").unwrap();
    state.set_global("invoke").unwrap();
    let results = run_in(
        &mut state,
        "return invoke(function(x) return x * 3 end, 5)",
    );
    assert_num(&results, 0, 15.0);
}

#[test]
fn test_script_host_script_sandwich() {
    let mut state = new_state();
    state.push_c_function(native_invoke, "invoke").unwrap();
    state.set_global("invoke").unwrap();
    // Script calls host; host calls back into script, which calls host
    // again through pairs of frames on the same logical stack.
    let results = run_in(
        &mut state,
        "local function inner(n) return invoke(tostring, n) end
         return invoke(inner, 7)",
    );
    let sid = results[0].as_str_id().expect("string result");
    assert_eq!(state.strings.get_bytes(sid), b"7");
}

#[test]
fn test_c_closure_upvalues() {
    let mut state = new_state();
    state.push_number(100.0).unwrap();
    state
        .push_c_closure(native_upvalue_add, "biased_add", 1)
        .unwrap();
    state.set_global("biased_add").unwrap();
    let results = run_in(&mut state, "return biased_add(23)");
    assert_num(&results, 0, 123.0);
}

#[test]
fn test_c_closure_upvalues_survive_gc() {
    let mut state = new_state();
    state.push_string(b"anchor-me").unwrap();
    let id = state.to_value(-1).as_str_id().unwrap();
    state
        .push_c_closure(native_upvalue_add, "keeper", 1)
        .unwrap();
    state.set_global("keeper").unwrap();
    state.collect_garbage();
    // The upvalue string is still live through the native's array
    // (get panics if the entry was wrongly swept).
    assert_eq!(state.strings.get_bytes(id), b"anchor-me");
    assert_eq!(state.intern(b"anchor-me"), id);
}

#[test]
fn test_host_call_with_multret() {
    let mut state = new_state();
    run_in(
        &mut state,
        "function multi() return 1, 2, 3 end",
    );
    state.get_global("multi").unwrap();
    state.call(0, MULTRET).unwrap();
    assert_eq!(state.get_top(), 3);
    assert_eq!(state.to_number(1), Some(1.0));
    assert_eq!(state.to_number(3), Some(3.0));
    state.pop(3);
}

#[test]
fn test_host_call_pads_results() {
    let mut state = new_state();
    run_in(&mut state, "function one() return 9 end");
    state.get_global("one").unwrap();
    state.call(0, 3).unwrap();
    assert_eq!(state.get_top(), 3);
    assert_eq!(state.to_number(1), Some(9.0));
    assert!(state.is_nil(2));
    assert!(state.is_nil(3));
    state.pop(3);
}

#[test]
fn test_run_discards_results() {
    let mut state = new_state();
    state.load(b"return 1, 2, 3", "=chunk").unwrap();
    state.run().unwrap();
    assert_eq!(state.get_top(), 0);
}

#[test]
fn test_host_pcall_restores_stack() {
    let mut state = new_state();
    state.push_number(1.0).unwrap();
    state.load(b"error('kaput')", "=chunk").unwrap();
    let err = state.pcall(0, 0).unwrap_err();
    assert!(format!("{err}").contains("kaput"));
    // Only the pre-existing value remains.
    assert_eq!(state.get_top(), 1);
    assert_eq!(state.to_number(1), Some(1.0));
    state.pop(1);
}

#[test]
fn test_load_and_call_with_arguments() {
    let mut state = new_state();
    state.load(b"local a, b = ... return a + b", "=chunk").unwrap();
    state.push_number(3.0).unwrap();
    state.push_number(4.0).unwrap();
    state.call(2, 1).unwrap();
    assert_eq!(state.to_number(-1), Some(7.0));
    state.pop(1);
}

#[test]
fn test_global_roundtrip_from_host() {
    let mut state = new_state();
    state.push_string(b"from-host").unwrap();
    state.set_global("hostvar").unwrap();
    let results = run_in(&mut state, "return hostvar");
    assert_str(&state, &results, 0, "from-host");
}

#[test]
fn test_script_value_read_from_host() {
    let mut state = new_state();
    run_in(&mut state, "answer = 6 * 7");
    state.get_global("answer").unwrap();
    assert_eq!(state.to_number(-1), Some(42.0));
    state.pop(1);
}

#[test]
fn test_native_error_propagates_to_script_pcall() {
    fn native_fail(_state: &mut State) -> Result<i32, LuaError> {
        Err(LuaError::Runtime("native says no".into()))
    }
    let mut state = new_state();
    state.push_c_function(native_fail, "fail").unwrap();
    state.set_global("fail").unwrap();
    let results = run_in(
        &mut state,
        "local ok, err = pcall(fail)
         return ok, err",
    );
    assert_bool(&results, 0, false);
    let sid = results[1].as_str_id().expect("message");
    assert_eq!(state.strings.get_bytes(sid), b"native says no");
}

#[test]
fn test_field_access_roundtrip() {
    let mut state = new_state();
    run_in(&mut state, "config = {depth = 4}");
    state.get_global("config").unwrap();
    state.get_field(-1, "depth").unwrap();
    assert_eq!(state.to_number(-1), Some(4.0));
    state.pop(1);
    state.push_number(9.0).unwrap();
    state.set_field(-2, "depth").unwrap();
    state.pop(1);
    let results = run_in(&mut state, "return config.depth");
    assert_num(&results, 0, 9.0);
}

#[test]
fn test_light_userdata_identity() {
    let mut state = new_state();
    state
        .push_value(Value::from_light_userdata(0x1000))
        .unwrap();
    state
        .push_value(Value::from_light_userdata(0x1000))
        .unwrap();
    state
        .push_value(Value::from_light_userdata(0x2000))
        .unwrap();
    assert!(state.raw_equal(1, 2));
    assert!(!state.raw_equal(1, 3));
}
