//! Main bytecode dispatch loop and call plumbing.
//!
//! A single iterative loop runs script frames: script-to-script calls
//! push a frame and continue, script-to-host calls run the native inline
//! in a host frame, and host-to-script calls re-enter `execute` with a
//! frame floor. TAILCALL rewrites the current frame in place.

use crate::arith::{self, ArithOp};
use crate::callinfo::{CallInfo, MULTRET};
use crate::compare;
use crate::coerce;
use crate::error::LuaError;
use crate::state::{State, MAX_CALL_DEPTH, STACK_CAPACITY};
use crescent_compiler::opcode::{is_k, rk_index, Instruction, OpCode, FIELDS_PER_FLUSH};
use crescent_compiler::proto::Constant;
use crescent_core::gc::{Closure, GcIdx, ProtoId};
use crescent_core::object::type_name;
use crescent_core::string::StrId;
use crescent_core::value::Value;

/// Read a constant as a runtime value.
fn k_value(state: &State, pid: ProtoId, idx: usize) -> Value {
    match &state.proto(pid).constants[idx] {
        Constant::Nil => Value::nil(),
        Constant::Boolean(b) => Value::from_bool(*b),
        Constant::Number(n) => Value::from_number(*n),
        Constant::String(sid) => Value::from_str_id(*sid),
    }
}

/// Decode an RK operand: high bit selects the constant pool, otherwise a
/// register of the current frame.
fn rk_value(state: &State, pid: ProtoId, base: usize, operand: u16) -> Value {
    if is_k(operand) {
        k_value(state, pid, rk_index(operand))
    } else {
        state.stack[base + operand as usize]
    }
}

/// A constant that must be a string (GETGLOBAL/SETGLOBAL keys).
fn k_string(state: &State, pid: ProtoId, idx: usize) -> Result<StrId, LuaError> {
    match &state.proto(pid).constants[idx] {
        Constant::String(sid) => Ok(*sid),
        _ => Err(LuaError::Runtime(
            "global name constant is not a string".into(),
        )),
    }
}

/// Call the value at `func_slot` with `nargs` arguments above it. Script
/// callees run to completion through a nested frame floor; results land
/// at `func_slot` per `nresults`.
pub fn call_value(
    state: &mut State,
    func_slot: usize,
    nargs: usize,
    nresults: i32,
) -> Result<(), LuaError> {
    let func = state.stack[func_slot];
    if func.as_closure_idx().is_some() {
        push_script_frame(state, func_slot, nargs, nresults)?;
        let floor = state.call_stack.len();
        execute(state, floor)
    } else if func.as_native_id().is_some() {
        call_native(state, func_slot, nargs, nresults)
    } else {
        Err(LuaError::AttemptToCallNonFunction {
            got: type_name(func),
        })
    }
}

/// Lay out a script frame above `func_slot`: fixed parameters land at the
/// frame base (shuffled past the varargs for vararg functions), missing
/// parameters and the register window are nil-cleared, and the stack is
/// verified against the prototype's declared max_stack_size.
/// Returns (base, vararg_base).
fn setup_frame(
    state: &mut State,
    func_slot: usize,
    nargs: usize,
    proto_id: ProtoId,
) -> Result<(usize, Option<usize>), LuaError> {
    let (num_params, is_vararg, max_stack) = {
        let p = state.proto(proto_id);
        (
            p.num_params as usize,
            p.is_vararg,
            p.max_stack_size as usize,
        )
    };
    let arg_base = func_slot + 1;

    if is_vararg {
        // Actual arguments stay below the frame base; fixed parameters
        // are copied up so VARARG can find the extras later.
        let new_base = arg_base + nargs;
        if new_base + max_stack > STACK_CAPACITY {
            return Err(LuaError::StackOverflow);
        }
        for i in 0..num_params.min(nargs) {
            let v = state.stack[arg_base + i];
            state.stack[new_base + i] = v;
        }
        for i in num_params.min(nargs)..max_stack {
            state.stack[new_base + i] = Value::nil();
        }
        state.stack_top = new_base + max_stack;
        Ok((new_base, Some(arg_base)))
    } else {
        let new_base = arg_base;
        if new_base + max_stack > STACK_CAPACITY {
            return Err(LuaError::StackOverflow);
        }
        for i in nargs..max_stack {
            state.stack[new_base + i] = Value::nil();
        }
        state.stack_top = new_base + max_stack;
        Ok((new_base, None))
    }
}

/// Push a frame for the script closure at `func_slot`.
fn push_script_frame(
    state: &mut State,
    func_slot: usize,
    nargs: usize,
    num_results: i32,
) -> Result<(), LuaError> {
    if state.call_stack.len() >= MAX_CALL_DEPTH {
        return Err(LuaError::StackOverflow);
    }
    let closure_idx = state.stack[func_slot]
        .as_closure_idx()
        .expect("callee checked");
    let proto_id = state.heap.get_closure(closure_idx).proto;
    let (base, vararg_base) = setup_frame(state, func_slot, nargs, proto_id)?;
    let mut ci = CallInfo::script(base, proto_id, closure_idx, func_slot, num_results);
    ci.vararg_base = vararg_base;
    state.call_stack.push(ci);
    Ok(())
}

/// Run the native at `func_slot` in a host frame: arguments occupy the
/// frame's indices 1..=nargs, the returned count of top values becomes
/// the results.
fn call_native(
    state: &mut State,
    func_slot: usize,
    nargs: usize,
    num_results: i32,
) -> Result<(), LuaError> {
    if state.call_stack.len() >= MAX_CALL_DEPTH {
        return Err(LuaError::StackOverflow);
    }
    let native_id = state.stack[func_slot]
        .as_native_id()
        .expect("callee checked");
    let base = func_slot + 1;
    state.stack_top = base + nargs;
    state
        .call_stack
        .push(CallInfo::host(base, native_id, func_slot, num_results));
    let func = state.native(native_id).func;
    match func(state) {
        Ok(n) => {
            let n = (n.max(0) as usize).min(state.stack_top.saturating_sub(base));
            let rstart = state.stack_top - n;
            state.call_stack.pop();
            place_results(state, func_slot, rstart, n, num_results);
            Ok(())
        }
        Err(e) => {
            state.call_stack.pop();
            Err(e)
        }
    }
}

/// Copy `actual` results down over the callee slot and adjust the top:
/// a fixed expectation nil-pads (or truncates) to exactly that many, an
/// open one keeps the actual count.
fn place_results(
    state: &mut State,
    func_slot: usize,
    rstart: usize,
    actual: usize,
    num_results: i32,
) {
    for i in 0..actual {
        let v = state.stack[rstart + i];
        state.stack[func_slot + i] = v;
    }
    if num_results < 0 {
        state.stack_top = func_slot + actual;
    } else {
        let want = num_results as usize;
        for i in actual..want {
            state.stack[func_slot + i] = Value::nil();
        }
        state.stack_top = func_slot + want;
    }
}

/// Rewrite the current frame in place for a tail call to a script
/// closure. The frame chain never grows.
fn reuse_frame_for_tail_call(
    state: &mut State,
    ci_idx: usize,
    closure_idx: GcIdx<Closure>,
    func_slot: usize,
    nargs: usize,
) -> Result<(), LuaError> {
    let proto_id = state.heap.get_closure(closure_idx).proto;
    let (base, vararg_base) = setup_frame(state, func_slot, nargs, proto_id)?;
    let ci = &mut state.call_stack[ci_idx];
    ci.base = base;
    ci.pc = 0;
    ci.proto = Some(proto_id);
    ci.closure = Some(closure_idx);
    ci.func_stack_idx = func_slot;
    ci.vararg_base = vararg_base;
    ci.tail_calls += 1;
    Ok(())
}

/// Execute script frames until the chain drops below `floor`.
pub fn execute(state: &mut State, floor: usize) -> Result<(), LuaError> {
    loop {
        state.maybe_collect();

        let ci_idx = state.call_stack.len() - 1;
        let base = state.call_stack[ci_idx].base;
        let pid = state.call_stack[ci_idx].proto.expect("script frame");
        let pc = state.call_stack[ci_idx].pc;

        // The compiler always terminates code with RETURN; a synthetic
        // one guards malformed prototypes.
        let inst = {
            let p = state.proto(pid);
            if pc < p.code.len() {
                p.code[pc]
            } else {
                Instruction::abc(OpCode::Return, 0, 1, 0)
            }
        };
        state.call_stack[ci_idx].pc = pc + 1;

        let a = inst.a() as usize;

        match inst.opcode() {
            OpCode::Move => {
                let v = state.stack[base + inst.b() as usize];
                state.stack[base + a] = v;
            }

            OpCode::LoadK => {
                let v = k_value(state, pid, inst.bx() as usize);
                state.stack[base + a] = v;
            }

            OpCode::LoadBool => {
                state.stack[base + a] = Value::from_bool(inst.b() != 0);
                if inst.c() != 0 {
                    state.call_stack[ci_idx].pc += 1;
                }
            }

            OpCode::LoadNil => {
                let b = inst.b() as usize;
                for i in a..=b {
                    state.stack[base + i] = Value::nil();
                }
            }

            OpCode::GetUpval => {
                let cl = state.call_stack[ci_idx]
                    .closure
                    .ok_or_else(|| LuaError::Runtime("no closure in frame".into()))?;
                let uv = state.heap.get_closure(cl).upvalues[inst.b() as usize];
                state.stack[base + a] = state.get_upval_value(uv);
            }

            OpCode::SetUpval => {
                let cl = state.call_stack[ci_idx]
                    .closure
                    .ok_or_else(|| LuaError::Runtime("no closure in frame".into()))?;
                let uv = state.heap.get_closure(cl).upvalues[inst.b() as usize];
                let v = state.stack[base + a];
                state.set_upval_value(uv, v);
            }

            OpCode::GetGlobal => {
                let sid = k_string(state, pid, inst.bx() as usize)?;
                let v = state.heap.get_table(state.globals).raw_get_str(sid);
                state.stack[base + a] = v;
            }

            OpCode::SetGlobal => {
                let sid = k_string(state, pid, inst.bx() as usize)?;
                let v = state.stack[base + a];
                let globals = state.globals;
                state.heap.get_table_mut(globals).raw_set_str(sid, v);
            }

            OpCode::GetTable => {
                let t_val = state.stack[base + inst.b() as usize];
                let key = rk_value(state, pid, base, inst.c());
                let t = t_val.as_table_idx().ok_or(LuaError::ExpectedTable {
                    got: type_name(t_val),
                })?;
                state.stack[base + a] = state.heap.get_table(t).raw_get(key);
            }

            OpCode::SetTable => {
                let t_val = state.stack[base + a];
                let key = rk_value(state, pid, base, inst.b());
                let val = rk_value(state, pid, base, inst.c());
                let t = t_val.as_table_idx().ok_or(LuaError::ExpectedTable {
                    got: type_name(t_val),
                })?;
                state.raw_set_table(t, key, val)?;
            }

            OpCode::NewTable => {
                let t = state
                    .heap
                    .alloc_table(inst.b() as usize, inst.c() as usize);
                state.stack[base + a] = Value::from_table(t);
            }

            OpCode::Self_ => {
                let t_val = state.stack[base + inst.b() as usize];
                let key = rk_value(state, pid, base, inst.c());
                state.stack[base + a + 1] = t_val;
                let t = t_val.as_table_idx().ok_or(LuaError::ExpectedTable {
                    got: type_name(t_val),
                })?;
                state.stack[base + a] = state.heap.get_table(t).raw_get(key);
            }

            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod | OpCode::Pow => {
                let vb = rk_value(state, pid, base, inst.b());
                let vc = rk_value(state, pid, base, inst.c());
                let op = match inst.opcode() {
                    OpCode::Add => ArithOp::Add,
                    OpCode::Sub => ArithOp::Sub,
                    OpCode::Mul => ArithOp::Mul,
                    OpCode::Div => ArithOp::Div,
                    OpCode::Mod => ArithOp::Mod,
                    _ => ArithOp::Pow,
                };
                state.stack[base + a] = arith::arith_op(op, vb, vc, &state.strings)?;
            }

            OpCode::Unm => {
                let vb = state.stack[base + inst.b() as usize];
                state.stack[base + a] = arith::arith_unm(vb, &state.strings)?;
            }

            OpCode::Not => {
                let vb = state.stack[base + inst.b() as usize];
                state.stack[base + a] = Value::from_bool(vb.is_falsy());
            }

            OpCode::Len => {
                let vb = state.stack[base + inst.b() as usize];
                let len = if let Some(sid) = vb.as_str_id() {
                    state.strings.get(sid).len() as f64
                } else if let Some(t) = vb.as_table_idx() {
                    state.heap.get_table(t).length() as f64
                } else {
                    return Err(LuaError::AttemptToGetLength { got: type_name(vb) });
                };
                state.stack[base + a] = Value::from_number(len);
            }

            OpCode::Concat => {
                let b = inst.b() as usize;
                let c = inst.c() as usize;
                let values = state.stack[base + b..=base + c].to_vec();
                let bytes = arith::concat_bytes(&values, &state.strings)?;
                let sid = state.intern(&bytes);
                state.stack[base + a] = Value::from_str_id(sid);
            }

            OpCode::Jmp => {
                let target = state.call_stack[ci_idx].pc as i64 + inst.sbx() as i64;
                state.call_stack[ci_idx].pc = target as usize;
            }

            OpCode::Eq => {
                let vb = rk_value(state, pid, base, inst.b());
                let vc = rk_value(state, pid, base, inst.c());
                let result = compare::raw_eq(vb, vc);
                if result == (a == 0) {
                    state.call_stack[ci_idx].pc += 1;
                }
            }

            OpCode::Lt => {
                let vb = rk_value(state, pid, base, inst.b());
                let vc = rk_value(state, pid, base, inst.c());
                let result = compare::lua_lt(vb, vc, &state.strings)?;
                if result == (a == 0) {
                    state.call_stack[ci_idx].pc += 1;
                }
            }

            OpCode::Le => {
                let vb = rk_value(state, pid, base, inst.b());
                let vc = rk_value(state, pid, base, inst.c());
                let result = compare::lua_le(vb, vc, &state.strings)?;
                if result == (a == 0) {
                    state.call_stack[ci_idx].pc += 1;
                }
            }

            OpCode::Test => {
                let va = state.stack[base + a];
                if va.is_truthy() == (inst.c() == 0) {
                    state.call_stack[ci_idx].pc += 1;
                }
            }

            OpCode::TestSet => {
                let vb = state.stack[base + inst.b() as usize];
                if vb.is_truthy() == (inst.c() != 0) {
                    state.stack[base + a] = vb;
                } else {
                    state.call_stack[ci_idx].pc += 1;
                }
            }

            OpCode::Call => {
                let b = inst.b() as usize;
                let c = inst.c() as usize;
                let func_slot = base + a;
                let nargs = if b == 0 {
                    state.stack_top - (func_slot + 1)
                } else {
                    b - 1
                };
                let nresults = if c == 0 { MULTRET } else { (c - 1) as i32 };
                let func = state.stack[func_slot];
                if func.as_closure_idx().is_some() {
                    push_script_frame(state, func_slot, nargs, nresults)?;
                } else if func.as_native_id().is_some() {
                    call_native(state, func_slot, nargs, nresults)?;
                } else {
                    return Err(LuaError::AttemptToCallNonFunction {
                        got: type_name(func),
                    });
                }
            }

            OpCode::TailCall => {
                let b = inst.b() as usize;
                let cur_slot = base + a;
                let nargs = if b == 0 {
                    state.stack_top - (cur_slot + 1)
                } else {
                    b - 1
                };
                let func = state.stack[cur_slot];
                state.close_upvalues(base);
                let (dest_slot, num_results) = {
                    let ci = &state.call_stack[ci_idx];
                    (ci.func_stack_idx, ci.num_results)
                };
                // Reuse the current frame's slots for the new callee.
                state.stack[dest_slot] = func;
                for i in 0..nargs {
                    let v = state.stack[cur_slot + 1 + i];
                    state.stack[dest_slot + 1 + i] = v;
                }
                state.stack_top = dest_slot + 1 + nargs;

                if let Some(cl) = func.as_closure_idx() {
                    reuse_frame_for_tail_call(state, ci_idx, cl, dest_slot, nargs)?;
                } else if func.as_native_id().is_some() {
                    // Tail call into a host function: run it, then return
                    // through the reused frame so the results land where
                    // this function's caller expects them.
                    call_native(state, dest_slot, nargs, num_results)?;
                    state.call_stack.pop();
                    if state.call_stack.len() < floor {
                        return Ok(());
                    }
                } else {
                    return Err(LuaError::AttemptToCallNonFunction {
                        got: type_name(func),
                    });
                }
            }

            OpCode::Return => {
                let b = inst.b() as usize;
                let rstart = base + a;
                let rcount = if b == 0 {
                    state.stack_top.saturating_sub(rstart)
                } else {
                    b - 1
                };
                state.close_upvalues(base);
                let ci = state.call_stack.pop().expect("frame underflow");
                place_results(state, ci.func_stack_idx, rstart, rcount, ci.num_results);
                if state.call_stack.len() < floor {
                    return Ok(());
                }
            }

            OpCode::ForPrep => {
                let init = state.stack[base + a];
                let limit = state.stack[base + a + 1];
                let step = state.stack[base + a + 2];
                let fi = coerce::to_number(init, &state.strings).ok_or_else(|| {
                    LuaError::Runtime("'for' initial value must be a number".into())
                })?;
                let fl = coerce::to_number(limit, &state.strings)
                    .ok_or_else(|| LuaError::Runtime("'for' limit must be a number".into()))?;
                let fs = coerce::to_number(step, &state.strings)
                    .ok_or_else(|| LuaError::Runtime("'for' step must be a number".into()))?;
                if fs == 0.0 {
                    return Err(LuaError::Runtime("'for' step is zero".into()));
                }
                state.stack[base + a] = Value::from_number(fi - fs);
                state.stack[base + a + 1] = Value::from_number(fl);
                state.stack[base + a + 2] = Value::from_number(fs);
                let target = state.call_stack[ci_idx].pc as i64 + inst.sbx() as i64;
                state.call_stack[ci_idx].pc = target as usize;
            }

            OpCode::ForLoop => {
                let counter = state.stack[base + a]
                    .as_number()
                    .ok_or_else(|| LuaError::Runtime("'for' counter corrupted".into()))?;
                let limit = state.stack[base + a + 1]
                    .as_number()
                    .ok_or_else(|| LuaError::Runtime("'for' limit corrupted".into()))?;
                let step = state.stack[base + a + 2]
                    .as_number()
                    .ok_or_else(|| LuaError::Runtime("'for' step corrupted".into()))?;
                let next = counter + step;
                state.stack[base + a] = Value::from_number(next);
                let in_range = if step > 0.0 {
                    next <= limit
                } else {
                    next >= limit
                };
                if in_range {
                    let target = state.call_stack[ci_idx].pc as i64 + inst.sbx() as i64;
                    state.call_stack[ci_idx].pc = target as usize;
                    state.stack[base + a + 3] = Value::from_number(next);
                }
            }

            OpCode::TForLoop => {
                let c = inst.c() as usize;
                let func = state.stack[base + a];
                let call_base = base + a + 3;
                if call_base + 3 + c > STACK_CAPACITY {
                    return Err(LuaError::StackOverflow);
                }
                state.stack[call_base] = func;
                let iter_state = state.stack[base + a + 1];
                let control = state.stack[base + a + 2];
                state.stack[call_base + 1] = iter_state;
                state.stack[call_base + 2] = control;
                state.stack_top = call_base + 3;
                call_value(state, call_base, 2, c as i32)?;
                let first = state.stack[call_base];
                if first.is_nil() {
                    // Iterator exhausted: skip the loop-back JMP.
                    state.call_stack[ci_idx].pc += 1;
                } else {
                    state.stack[base + a + 2] = first;
                }
            }

            OpCode::SetList => {
                let b = inst.b() as usize;
                let mut batch = inst.c() as u32;
                if batch == 0 {
                    // Extended batch: the next word is a raw u32 count.
                    let pc2 = state.call_stack[ci_idx].pc;
                    batch = state.proto(pid).code[pc2].as_raw();
                    state.call_stack[ci_idx].pc = pc2 + 1;
                }
                let t_val = state.stack[base + a];
                let t = t_val.as_table_idx().ok_or(LuaError::ExpectedTable {
                    got: type_name(t_val),
                })?;
                let count = if b == 0 {
                    state.stack_top - (base + a + 1)
                } else {
                    b
                };
                let offset = (batch as i64 - 1) * FIELDS_PER_FLUSH as i64;
                for i in 1..=count {
                    let v = state.stack[base + a + i];
                    state.heap.get_table_mut(t).raw_seti(offset + i as i64, v);
                }
            }

            OpCode::Close => {
                state.close_upvalues(base + a);
            }

            OpCode::Closure => {
                let child_id = state.proto(pid).children[inst.bx() as usize];
                let n_up = state.proto(child_id).num_upvalues as usize;
                let parent_closure = state.call_stack[ci_idx].closure;
                let mut upvals = Vec::with_capacity(n_up);
                let mut pc2 = state.call_stack[ci_idx].pc;
                for _ in 0..n_up {
                    let pseudo = state.proto(pid).code[pc2];
                    pc2 += 1;
                    match pseudo.opcode() {
                        OpCode::Move => {
                            let slot = base + pseudo.b() as usize;
                            let uv = state.find_or_create_open_upval(slot);
                            upvals.push(uv);
                        }
                        OpCode::GetUpval => {
                            let parent = parent_closure.ok_or_else(|| {
                                LuaError::Runtime("upvalue capture outside a closure".into())
                            })?;
                            let uv =
                                state.heap.get_closure(parent).upvalues[pseudo.b() as usize];
                            upvals.push(uv);
                        }
                        _ => {
                            return Err(LuaError::Runtime(
                                "malformed closure capture sequence".into(),
                            ))
                        }
                    }
                }
                state.call_stack[ci_idx].pc = pc2;
                let cl = state.heap.alloc_closure(child_id, upvals);
                state.stack[base + a] = Value::from_closure(cl);
            }

            OpCode::VarArg => {
                let b = inst.b() as usize;
                let vararg_base = state.call_stack[ci_idx].vararg_base;
                let num_params = state.proto(pid).num_params as usize;
                let (vstart, vcount) = match vararg_base {
                    Some(vb) => {
                        let start = vb + num_params;
                        (start, base.saturating_sub(start))
                    }
                    None => (0, 0),
                };
                let wanted = if b == 0 { vcount } else { b - 1 };
                if base + a + wanted > STACK_CAPACITY {
                    return Err(LuaError::StackOverflow);
                }
                for i in 0..wanted {
                    let v = if i < vcount {
                        state.stack[vstart + i]
                    } else {
                        Value::nil()
                    };
                    state.stack[base + a + i] = v;
                }
                if b == 0 {
                    state.stack_top = base + a + wanted;
                }
            }
        }
    }
}
