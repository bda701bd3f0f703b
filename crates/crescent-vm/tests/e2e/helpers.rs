use crescent_core::value::Value;
use crescent_vm::{LuaError, State, MULTRET};

/// State with the standard libraries and a capturing `print`.
pub fn new_state() -> State {
    let mut state = State::new();
    crescent_stdlib::register_all(&mut state).expect("stdlib registration");
    install_print_capture(&mut state);
    state
}

/// Swap `print` for a sink that appends each line to a registry table,
/// so stdout scenarios can be asserted.
pub fn install_print_capture(state: &mut State) {
    let out = state.heap.alloc_table(0, 0);
    let key = state.intern(b"test.output");
    let registry = state.registry;
    state
        .heap
        .get_table_mut(registry)
        .raw_set_str(key, Value::from_table(out));
    let id = state.alloc_native(capture_print, "print", Vec::new(), None);
    state.global_set(b"print", Value::from_native(id));
}

fn capture_print(state: &mut State) -> Result<i32, LuaError> {
    let nargs = state.get_top();
    let mut line = String::new();
    for i in 1..=nargs {
        if i > 1 {
            line.push('\t');
        }
        let v = state.to_value(i as i32);
        line.push_str(&state.display_value(v));
    }
    let key = state.intern(b"test.output");
    let out = state
        .heap
        .get_table(state.registry)
        .raw_get_str(key)
        .as_table_idx()
        .expect("capture table");
    let n = state.heap.get_table(out).length();
    let sid = state.intern(line.as_bytes());
    state
        .heap
        .get_table_mut(out)
        .raw_seti(n + 1, Value::from_str_id(sid));
    Ok(0)
}

/// Lines captured from `print` so far.
pub fn printed_lines(state: &mut State) -> Vec<String> {
    let key = state.intern(b"test.output");
    let out = state
        .heap
        .get_table(state.registry)
        .raw_get_str(key)
        .as_table_idx()
        .expect("capture table");
    let len = state.heap.get_table(out).length();
    let mut lines = Vec::with_capacity(len as usize);
    for i in 1..=len {
        let v = state.heap.get_table(out).raw_geti(i);
        let sid = v.as_str_id().expect("captured line");
        lines.push(String::from_utf8_lossy(state.strings.get_bytes(sid)).into_owned());
    }
    lines
}

/// Compile and run a chunk in an existing state, returning its results.
pub fn run_in(state: &mut State, source: &str) -> Vec<Value> {
    let before = state.get_top();
    state
        .load(source.as_bytes(), "=test")
        .unwrap_or_else(|e| panic!("compile error: {e}"));
    state
        .call(0, MULTRET)
        .unwrap_or_else(|e| panic!("runtime error: {e}"));
    let n = state.get_top() - before;
    let mut results = Vec::with_capacity(n);
    for i in 0..n {
        results.push(state.to_value((before + i + 1) as i32));
    }
    state.pop(n);
    results
}

/// Compile and run a chunk in a fresh state.
pub fn run_lua(source: &str) -> (State, Vec<Value>) {
    let mut state = new_state();
    let results = run_in(&mut state, source);
    (state, results)
}

/// Run a chunk that must fail, returning the error message.
pub fn run_lua_err(source: &str) -> String {
    let mut state = new_state();
    state
        .load(source.as_bytes(), "=test")
        .unwrap_or_else(|e| panic!("compile error: {e}"));
    match state.call(0, MULTRET) {
        Err(e) => format!("{e}"),
        Ok(()) => panic!("expected a runtime error"),
    }
}

pub fn assert_num(results: &[Value], idx: usize, expected: f64) {
    let got = results[idx]
        .as_number()
        .unwrap_or_else(|| panic!("result[{idx}] = {:?}, expected number", results[idx]));
    assert!(
        (got - expected).abs() < 1e-10,
        "result[{idx}] = {got}, expected {expected}"
    );
}

pub fn assert_bool(results: &[Value], idx: usize, expected: bool) {
    let got = results[idx]
        .as_bool()
        .unwrap_or_else(|| panic!("result[{idx}] = {:?}, expected bool", results[idx]));
    assert_eq!(got, expected, "result[{idx}]");
}

pub fn assert_nil(results: &[Value], idx: usize) {
    assert!(
        results[idx].is_nil(),
        "result[{idx}] = {:?}, expected nil",
        results[idx]
    );
}

pub fn assert_str(state: &State, results: &[Value], idx: usize, expected: &str) {
    let sid = results[idx]
        .as_str_id()
        .unwrap_or_else(|| panic!("result[{idx}] = {:?}, expected string", results[idx]));
    let got = String::from_utf8_lossy(state.strings.get_bytes(sid));
    assert_eq!(got, expected, "result[{idx}]");
}

/// Run and compare against expected numbers.
pub fn run_check_nums(source: &str, expected: &[f64]) {
    let (_, results) = run_lua(source);
    assert_eq!(
        results.len(),
        expected.len(),
        "expected {} results, got {}",
        expected.len(),
        results.len()
    );
    for (i, &exp) in expected.iter().enumerate() {
        assert_num(&results, i, exp);
    }
}
