use super::helpers::*;

#[test]
fn test_return_literals() {
    let (state, results) = run_lua("return nil, true, false, 42, \"hi\"");
    assert_eq!(results.len(), 5);
    assert_nil(&results, 0);
    assert_bool(&results, 1, true);
    assert_bool(&results, 2, false);
    assert_num(&results, 3, 42.0);
    assert_str(&state, &results, 4, "hi");
}

#[test]
fn test_number_formats() {
    run_check_nums(
        "return 3, 3.5, 1e2, 0x10, .25, 2e-2",
        &[3.0, 3.5, 100.0, 16.0, 0.25, 0.02],
    );
}

#[test]
fn test_string_escapes() {
    let (state, results) = run_lua("return \"a\\nb\", 'quoted\\'', \"\\65\"");
    assert_str(&state, &results, 0, "a\nb");
    assert_str(&state, &results, 1, "quoted'");
    assert_str(&state, &results, 2, "A");
}

#[test]
fn test_long_string() {
    let (state, results) = run_lua("return [[raw ]=] text]]");
    assert_str(&state, &results, 0, "raw ]=] text");
}

#[test]
fn test_truthiness_invariant() {
    // Only nil and false are falsy.
    let (_, results) = run_lua("return not nil, not false, not 0, not \"\", not {}");
    assert_bool(&results, 0, true);
    assert_bool(&results, 1, true);
    assert_bool(&results, 2, false);
    assert_bool(&results, 3, false);
    assert_bool(&results, 4, false);
}

#[test]
fn test_empty_chunk() {
    let (_, results) = run_lua("");
    assert!(results.is_empty());
}

#[test]
fn test_comments_ignored() {
    run_check_nums("-- leading\nreturn 1 --[[ inline ]] + 2 -- trailing", &[3.0]);
}
