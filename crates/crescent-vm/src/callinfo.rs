//! Call frame information for the VM.

use crescent_core::gc::{Closure, GcIdx, NativeId, ProtoId};

/// Expected-result count meaning "all results".
pub const MULTRET: i32 = -1;

/// A call frame on the VM call stack.
#[derive(Clone, Debug)]
pub struct CallInfo {
    /// Stack base: register 0 of this frame. The callee value sits at
    /// base - 1 (func_stack_idx).
    pub base: usize,
    /// Saved program counter (index into the proto's code).
    pub pc: usize,
    /// Expected number of results (MULTRET = all).
    pub num_results: i32,
    /// The prototype being executed (script frames).
    pub proto: Option<ProtoId>,
    /// The closure being executed (script frames).
    pub closure: Option<GcIdx<Closure>>,
    /// The native being executed (host frames).
    pub native: Option<NativeId>,
    /// Stack slot holding the callee (result placement target).
    pub func_stack_idx: usize,
    /// Base of vararg storage for vararg functions: the slot of the
    /// first actual argument, below the shuffled frame base.
    pub vararg_base: Option<usize>,
    /// Tail calls that reused this frame (depth accounting only).
    pub tail_calls: u32,
}

impl CallInfo {
    /// Frame for a script function.
    pub fn script(
        base: usize,
        proto: ProtoId,
        closure: GcIdx<Closure>,
        func_stack_idx: usize,
        num_results: i32,
    ) -> Self {
        CallInfo {
            base,
            pc: 0,
            num_results,
            proto: Some(proto),
            closure: Some(closure),
            native: None,
            func_stack_idx,
            vararg_base: None,
            tail_calls: 0,
        }
    }

    /// Frame for a host function.
    pub fn host(base: usize, native: NativeId, func_stack_idx: usize, num_results: i32) -> Self {
        CallInfo {
            base,
            pc: 0,
            num_results,
            proto: None,
            closure: None,
            native: Some(native),
            func_stack_idx,
            vararg_base: None,
            tail_calls: 0,
        }
    }

    /// True for script frames (the interpreter loop owns them).
    pub fn is_lua(&self) -> bool {
        self.proto.is_some()
    }
}
