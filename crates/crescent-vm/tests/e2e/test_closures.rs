use super::helpers::*;

#[test]
fn test_counter_closure() {
    run_check_nums(
        "local function mk()
           local x = 0
           return function() x = x + 1 return x end
         end
         local f = mk()
         return f(), f(), f()",
        &[1.0, 2.0, 3.0],
    );
}

#[test]
fn test_two_closures_share_one_cell() {
    // Mutating through either closure is observed by the other.
    run_check_nums(
        "local function pair()
           local n = 0
           local function inc() n = n + 1 end
           local function get() return n end
           return inc, get
         end
         local inc, get = pair()
         inc()
         inc()
         return get()",
        &[2.0],
    );
}

#[test]
fn test_sharing_survives_frame_return() {
    // Close-then-share identity: after the enclosing frame returns, both
    // closures still agree on the same mutable cell.
    run_check_nums(
        "local function pair()
           local n = 10
           return function(d) n = n + d end, function() return n end
         end
         local add, read = pair()
         collectgarbage()
         add(5)
         add(7)
         return read()",
        &[22.0],
    );
}

#[test]
fn test_independent_instances() {
    run_check_nums(
        "local function mk()
           local x = 0
           return function() x = x + 1 return x end
         end
         local a, b = mk(), mk()
         a() a() a()
         b()
         return a(), b()",
        &[4.0, 2.0],
    );
}

#[test]
fn test_loop_variable_captured_per_iteration() {
    // CLOSE at the loop body end gives each iteration its own cell.
    run_check_nums(
        "local fns = {}
         for i = 1, 3 do
           local v = i * 10
           fns[i] = function() return v end
         end
         return fns[1](), fns[2](), fns[3]()",
        &[10.0, 20.0, 30.0],
    );
}

#[test]
fn test_nested_capture_through_two_levels() {
    run_check_nums(
        "local function outer()
           local x = 5
           return function()
             return function() x = x + 1 return x end
           end
         end
         local f = outer()()
         return f(), f()",
        &[6.0, 7.0],
    );
}

#[test]
fn test_upvalue_assignment_before_close() {
    // While the frame is live, the upvalue aliases the stack slot.
    run_check_nums(
        "local x = 1
         local function set(v) x = v end
         set(42)
         return x",
        &[42.0],
    );
}

#[test]
fn test_do_block_close() {
    run_check_nums(
        "local f
         do
           local hidden = 7
           f = function() return hidden end
         end
         collectgarbage()
         return f()",
        &[7.0],
    );
}

#[test]
fn test_recursive_local_function() {
    run_check_nums(
        "local function fib(n)
           if n < 2 then return n end
           return fib(n - 1) + fib(n - 2)
         end
         return fib(10)",
        &[55.0],
    );
}
