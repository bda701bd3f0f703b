//! The interpreter state: value stack, call frames, heap, string pool,
//! prototype and native pools, globals/registry, and the stack-based
//! embedding API.

use crate::callinfo::CallInfo;
use crate::coerce;
use crate::dispatch;
use crate::error::LuaError;
use crescent_compiler::compiler;
use crescent_compiler::opcode::Instruction;
use crescent_compiler::proto::{Constant, Proto};
use crescent_core::gc::{
    GcHeap, GcIdx, LuaThread, NativeId, ProtoId, UpVal, UpValLocation, UserData,
};
use crescent_core::object::type_name;
use crescent_core::string::{StrId, StringPool};
use crescent_core::table::{Table, TableKeyError};
use crescent_core::value::Value;

/// Fixed capacity of the value stack. Pushing past it is an error, never
/// a resize.
pub const STACK_CAPACITY: usize = 1024;

/// Maximum depth of the call-info chain.
pub const MAX_CALL_DEPTH: usize = 200;

/// Host function signature: arguments sit at indices 1..=nargs of the
/// host frame; the return value is how many results were left on top.
pub type CFunction = fn(&mut State) -> Result<i32, LuaError>;

/// A host closure: native callable plus plain-value upvalues and an
/// optional environment table.
pub struct NativeFunction {
    pub func: CFunction,
    pub name: &'static str,
    pub upvalues: Vec<Value>,
    pub env: Option<GcIdx<Table>>,
}

/// A loaded prototype: the compiler output with nested protos flattened
/// into the state's prototype arena. Constants were interned at load
/// time, so re-execution resolves the same string objects.
pub struct RuntimeProto {
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub children: Vec<ProtoId>,
    pub lines: Vec<u32>,
    pub source: Option<StrId>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    pub num_upvalues: u8,
}

/// One interpreter state: a main thread with its stack and frames, plus
/// every pool the collector traces.
pub struct State {
    /// Value stack (registers). Fixed length STACK_CAPACITY.
    pub stack: Vec<Value>,
    /// Index of the first free slot.
    pub stack_top: usize,
    /// Call frames, innermost last.
    pub call_stack: Vec<CallInfo>,
    /// GC heap (tables, closures, upvalues, userdata, threads).
    pub heap: GcHeap,
    /// String pool (all strings interned).
    pub strings: StringPool,
    /// Prototype arena; closures reference entries by ProtoId.
    pub protos: Vec<Option<RuntimeProto>>,
    proto_free: Vec<u32>,
    /// Native pool; c-closures reference entries by NativeId.
    pub natives: Vec<Option<NativeFunction>>,
    native_free: Vec<u32>,
    /// Globals table (a root).
    pub globals: GcIdx<Table>,
    /// Registry table (a root, host-reserved storage).
    pub registry: GcIdx<Table>,
    /// The main thread object.
    pub main_thread: GcIdx<LuaThread>,
    /// Open upvalues, sorted by descending stack index.
    pub open_upvals: Vec<(usize, GcIdx<UpVal>)>,
}

impl State {
    /// Create a new state with empty globals and registry.
    pub fn new() -> Self {
        let mut heap = GcHeap::new();
        let globals = heap.alloc_table(0, 64);
        let registry = heap.alloc_table(0, 16);
        let main_thread = heap.alloc_thread();
        State {
            stack: vec![Value::nil(); STACK_CAPACITY],
            stack_top: 0,
            call_stack: Vec::new(),
            heap,
            strings: StringPool::new(),
            protos: Vec::new(),
            proto_free: Vec::new(),
            natives: Vec::new(),
            native_free: Vec::new(),
            globals,
            registry,
            main_thread,
            open_upvals: Vec::new(),
        }
    }

    // ---- Interning and pools ----

    /// Intern a byte string, feeding new registrations to the GC trigger.
    pub fn intern(&mut self, bytes: &[u8]) -> StrId {
        let id = self.strings.intern(bytes);
        let fresh = self.strings.take_registered();
        self.heap.add_registered(fresh);
        id
    }

    /// Register a compiled proto tree, returning the root's id.
    pub fn register_proto(&mut self, proto: Proto) -> ProtoId {
        let children = proto
            .protos
            .into_iter()
            .map(|c| self.register_proto(c))
            .collect();
        let entry = RuntimeProto {
            code: proto.code,
            constants: proto.constants,
            children,
            lines: proto.lines,
            source: proto.source,
            num_params: proto.num_params,
            is_vararg: proto.is_vararg,
            max_stack_size: proto.max_stack_size,
            num_upvalues: proto.num_upvalues,
        };
        self.heap.add_registered(1);
        let id = if let Some(slot) = self.proto_free.pop() {
            self.protos[slot as usize] = Some(entry);
            slot
        } else {
            let slot = self.protos.len() as u32;
            self.protos.push(Some(entry));
            slot
        };
        ProtoId(id)
    }

    /// Get a loaded prototype.
    pub fn proto(&self, id: ProtoId) -> &RuntimeProto {
        self.protos[id.0 as usize]
            .as_ref()
            .expect("proto was swept")
    }

    /// Register a native function, returning its id.
    pub fn alloc_native(
        &mut self,
        func: CFunction,
        name: &'static str,
        upvalues: Vec<Value>,
        env: Option<GcIdx<Table>>,
    ) -> NativeId {
        self.heap.add_registered(1);
        let nf = NativeFunction {
            func,
            name,
            upvalues,
            env,
        };
        let id = if let Some(slot) = self.native_free.pop() {
            self.natives[slot as usize] = Some(nf);
            slot
        } else {
            let slot = self.natives.len() as u32;
            self.natives.push(Some(nf));
            slot
        };
        NativeId(id)
    }

    /// Get a native function entry.
    pub fn native(&self, id: NativeId) -> &NativeFunction {
        self.natives[id.0 as usize]
            .as_ref()
            .expect("native was swept")
    }

    /// Upvalue `i` (0-based) of the currently running host closure;
    /// none outside a host frame or past the upvalue array.
    pub fn native_upvalue(&self, i: usize) -> Value {
        match self.call_stack.last().and_then(|ci| ci.native) {
            Some(id) => self
                .native(id)
                .upvalues
                .get(i)
                .copied()
                .unwrap_or(Value::none()),
            None => Value::none(),
        }
    }

    // ---- Upvalue ledger ----

    /// Current value of an upvalue cell.
    pub fn get_upval_value(&self, uv: GcIdx<UpVal>) -> Value {
        match self.heap.get_upval(uv).location {
            UpValLocation::Open(slot) => self.stack[slot],
            UpValLocation::Closed(v) => v,
        }
    }

    /// Write through an upvalue cell.
    pub fn set_upval_value(&mut self, uv: GcIdx<UpVal>, val: Value) {
        match self.heap.get_upval(uv).location {
            UpValLocation::Open(slot) => {
                self.stack[slot] = val;
            }
            UpValLocation::Closed(_) => {
                self.heap.get_upval_mut(uv).location = UpValLocation::Closed(val);
            }
        }
    }

    /// At most one open upvalue exists per stack slot; closures sharing
    /// a slot share the cell.
    pub fn find_or_create_open_upval(&mut self, slot: usize) -> GcIdx<UpVal> {
        for &(si, uv) in &self.open_upvals {
            if si == slot {
                return uv;
            }
        }
        let uv = self.heap.alloc_upval(UpValLocation::Open(slot));
        self.open_upvals.push((slot, uv));
        self.open_upvals.sort_by(|a, b| b.0.cmp(&a.0));
        uv
    }

    /// Close every open upvalue at or above `level`: copy the stack slot
    /// into the cell and unlink it. Irreversible.
    pub fn close_upvalues(&mut self, level: usize) {
        let mut i = 0;
        while i < self.open_upvals.len() {
            let (slot, uv) = self.open_upvals[i];
            if slot >= level {
                let val = self.stack[slot];
                self.heap.get_upval_mut(uv).location = UpValLocation::Closed(val);
                self.open_upvals.remove(i);
            } else {
                i += 1;
            }
        }
    }

    // ---- Garbage collection ----

    /// Run a collection when the registration counter crossed the
    /// threshold.
    pub fn maybe_collect(&mut self) {
        let fresh = self.strings.take_registered();
        self.heap.add_registered(fresh);
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    /// Full stop-the-world mark-sweep. Returns (collected, live).
    pub fn collect_garbage(&mut self) -> (usize, usize) {
        if self.heap.gc_state.collecting {
            return (0, 0);
        }
        self.heap.gc_state.collecting = true;
        self.heap.gc_prepare_marks(
            self.strings.slot_count(),
            self.natives.len(),
            self.protos.len(),
        );

        // Roots: globals, registry, main thread, every live stack slot,
        // the open-upvalue chain, and the frame chain's embedded refs.
        let globals = self.globals;
        let registry = self.registry;
        let thread = self.main_thread;
        self.heap.gc_mark_value(Value::from_table(globals));
        self.heap.gc_mark_value(Value::from_table(registry));
        self.heap.gc_mark_value(Value::from_thread(thread));
        // The innermost script frame's register window can extend past
        // the current top (it only rises again at the next call), so the
        // scan covers it too.
        let scan_top = match self.call_stack.last() {
            Some(ci) if ci.is_lua() => {
                let max_stack = self.proto(ci.proto.expect("script frame")).max_stack_size;
                (ci.base + max_stack as usize)
                    .max(self.stack_top)
                    .min(STACK_CAPACITY)
            }
            _ => self.stack_top,
        };
        for i in 0..scan_top {
            let v = self.stack[i];
            self.heap.gc_mark_value(v);
        }
        let upvals: Vec<GcIdx<UpVal>> = self.open_upvals.iter().map(|&(_, uv)| uv).collect();
        for uv in upvals {
            self.heap.gc_mark_upval(uv);
        }
        let mut frame_refs: Vec<Value> = Vec::new();
        let mut frame_protos: Vec<ProtoId> = Vec::new();
        for ci in &self.call_stack {
            if let Some(cl) = ci.closure {
                frame_refs.push(Value::from_closure(cl));
            }
            if let Some(n) = ci.native {
                frame_refs.push(Value::from_native(n));
            }
            if let Some(p) = ci.proto {
                frame_protos.push(p);
            }
        }
        for v in frame_refs {
            self.heap.gc_mark_value(v);
        }
        for p in frame_protos {
            self.heap.gc_mark_proto(p);
        }

        // Propagate to a fixpoint across the heap arenas and the
        // state-owned proto/native pools.
        loop {
            self.heap.gc_propagate();
            let mut progressed = false;
            while let Some(pid) = self.heap.gc_state.gray_protos.pop() {
                self.mark_proto_children(pid as usize);
                progressed = true;
            }
            while let Some(nid) = self.heap.gc_state.gray_natives.pop() {
                self.mark_native_children(nid as usize);
                progressed = true;
            }
            if !progressed && self.heap.gray_is_empty() {
                break;
            }
        }

        // Sweep every pool with the marks computed above.
        let (hc, hl) = self.heap.gc_sweep();
        let string_marks = std::mem::take(&mut self.heap.gc_state.string_marks);
        let (sc, sl) = self.strings.sweep(&string_marks);
        self.heap.gc_state.string_marks = string_marks;
        let (nc, nl) = self.sweep_natives();
        let (pc, pl) = self.sweep_protos();
        self.strings.take_registered();

        let collected = hc + sc + nc + pc;
        let live = hl + sl + nl + pl;
        self.heap.gc_finish(collected, live);
        (collected, live)
    }

    fn mark_proto_children(&mut self, idx: usize) {
        if let Some(entry) = self.protos[idx].as_ref() {
            for k in &entry.constants {
                if let Constant::String(sid) = k {
                    let si = sid.0 as usize;
                    if si < self.heap.gc_state.string_marks.len() {
                        self.heap.gc_state.string_marks[si] = true;
                    }
                }
            }
            if let Some(src) = entry.source {
                let si = src.0 as usize;
                if si < self.heap.gc_state.string_marks.len() {
                    self.heap.gc_state.string_marks[si] = true;
                }
            }
            let children = entry.children.clone();
            for c in children {
                self.heap.gc_mark_proto(c);
            }
        }
    }

    fn mark_native_children(&mut self, idx: usize) {
        let (upvals, env) = match self.natives[idx].as_ref() {
            Some(n) => (n.upvalues.clone(), n.env),
            None => return,
        };
        for v in upvals {
            self.heap.gc_mark_value(v);
        }
        if let Some(env) = env {
            self.heap.gc_mark_value(Value::from_table(env));
        }
    }

    fn sweep_natives(&mut self) -> (usize, usize) {
        let mut collected = 0;
        let mut live = 0;
        for i in 0..self.natives.len() {
            if self.natives[i].is_some() {
                if !self
                    .heap
                    .gc_state
                    .native_marks
                    .get(i)
                    .copied()
                    .unwrap_or(false)
                {
                    self.natives[i] = None;
                    self.native_free.push(i as u32);
                    collected += 1;
                } else {
                    live += 1;
                }
            }
        }
        (collected, live)
    }

    fn sweep_protos(&mut self) -> (usize, usize) {
        let mut collected = 0;
        let mut live = 0;
        for i in 0..self.protos.len() {
            if self.protos[i].is_some() {
                if !self
                    .heap
                    .gc_state
                    .proto_marks
                    .get(i)
                    .copied()
                    .unwrap_or(false)
                {
                    self.protos[i] = None;
                    self.proto_free.push(i as u32);
                    collected += 1;
                } else {
                    live += 1;
                }
            }
        }
        (collected, live)
    }

    // ---- Stack index resolution ----

    /// Base of the current API frame: register 0 of the innermost call,
    /// or the stack bottom outside any call.
    pub fn api_base(&self) -> usize {
        self.call_stack.last().map(|ci| ci.base).unwrap_or(0)
    }

    /// Resolve a 1-based (or negative-from-top) index to a stack slot.
    fn abs_index(&self, idx: i32) -> Option<usize> {
        let base = self.api_base();
        if idx > 0 {
            let pos = base + idx as usize - 1;
            if pos < self.stack_top {
                Some(pos)
            } else {
                None
            }
        } else if idx < 0 {
            let back = (-idx) as usize;
            if back <= self.stack_top - base {
                Some(self.stack_top - back)
            } else {
                None
            }
        } else {
            None
        }
    }

    /// Resolve an index that must exist, for mutating operations.
    fn abs_index_checked(&self, idx: i32) -> Result<usize, LuaError> {
        self.abs_index(idx)
            .ok_or_else(|| LuaError::Runtime(format!("invalid stack index {idx}")))
    }

    // ---- Stack manipulation ----

    /// Push a value. Fails with StackOverflow at capacity.
    pub fn push_value(&mut self, v: Value) -> Result<(), LuaError> {
        if self.stack_top >= STACK_CAPACITY {
            return Err(LuaError::StackOverflow);
        }
        self.stack[self.stack_top] = v;
        self.stack_top += 1;
        Ok(())
    }

    /// Pop n values.
    pub fn pop(&mut self, n: usize) {
        let n = n.min(self.stack_top - self.api_base());
        for _ in 0..n {
            self.stack_top -= 1;
            self.stack[self.stack_top] = Value::nil();
        }
    }

    /// Number of values on the current frame's stack.
    pub fn get_top(&self) -> usize {
        self.stack_top - self.api_base()
    }

    /// Set the frame-relative top: growth nil-fills, shrink drops.
    pub fn set_top(&mut self, idx: i32) -> Result<(), LuaError> {
        let base = self.api_base();
        let new_top = if idx >= 0 {
            base + idx as usize
        } else {
            let back = (-idx) as usize - 1;
            if back > self.stack_top - base {
                return Err(LuaError::Runtime(format!("invalid stack index {idx}")));
            }
            self.stack_top - back
        };
        if new_top > STACK_CAPACITY {
            return Err(LuaError::StackOverflow);
        }
        if new_top > self.stack_top {
            for i in self.stack_top..new_top {
                self.stack[i] = Value::nil();
            }
        } else {
            for i in new_top..self.stack_top {
                self.stack[i] = Value::nil();
            }
        }
        self.stack_top = new_top;
        Ok(())
    }

    /// Rotate the top value down into position idx.
    pub fn insert(&mut self, idx: i32) -> Result<(), LuaError> {
        let pos = self.abs_index_checked(idx)?;
        let top = self.stack_top;
        if top == 0 || pos >= top {
            return Ok(());
        }
        let v = self.stack[top - 1];
        self.stack.copy_within(pos..top - 1, pos + 1);
        self.stack[pos] = v;
        Ok(())
    }

    // ---- Typed pushes ----

    pub fn push_nil(&mut self) -> Result<(), LuaError> {
        self.push_value(Value::nil())
    }

    pub fn push_boolean(&mut self, b: bool) -> Result<(), LuaError> {
        self.push_value(Value::from_bool(b))
    }

    pub fn push_number(&mut self, n: f64) -> Result<(), LuaError> {
        self.push_value(Value::from_number(n))
    }

    pub fn push_string(&mut self, bytes: &[u8]) -> Result<(), LuaError> {
        let id = self.intern(bytes);
        self.push_value(Value::from_str_id(id))
    }

    /// Push a host function with no upvalues.
    pub fn push_c_function(
        &mut self,
        func: CFunction,
        name: &'static str,
    ) -> Result<(), LuaError> {
        let id = self.alloc_native(func, name, Vec::new(), None);
        self.push_value(Value::from_native(id))
    }

    /// Push a host closure capturing the top n values as upvalues.
    pub fn push_c_closure(
        &mut self,
        func: CFunction,
        name: &'static str,
        n: usize,
    ) -> Result<(), LuaError> {
        let base = self.stack_top - n;
        let upvalues = self.stack[base..self.stack_top].to_vec();
        self.pop(n);
        let id = self.alloc_native(func, name, upvalues, None);
        self.push_value(Value::from_native(id))
    }

    /// Push an existing table reference.
    pub fn push_table(&mut self, idx: GcIdx<Table>) -> Result<(), LuaError> {
        self.push_value(Value::from_table(idx))
    }

    /// Push the main thread object.
    pub fn push_thread(&mut self) -> Result<(), LuaError> {
        let t = self.main_thread;
        self.push_value(Value::from_thread(t))
    }

    /// Create an empty table and push it, returning the reference.
    pub fn new_table(&mut self) -> Result<GcIdx<Table>, LuaError> {
        let idx = self.heap.alloc_table(0, 0);
        self.push_value(Value::from_table(idx))?;
        Ok(idx)
    }

    /// Create a userdata of the given byte size and push it.
    pub fn new_userdata(&mut self, size: usize) -> Result<GcIdx<UserData>, LuaError> {
        let idx = self.heap.alloc_userdata(size);
        self.push_value(Value::from_userdata(idx))?;
        Ok(idx)
    }

    // ---- Reads and conversions ----

    /// Read a stack slot; out-of-range reads yield the none sentinel.
    pub fn to_value(&self, idx: i32) -> Value {
        match self.abs_index(idx) {
            Some(pos) => self.stack[pos],
            None => Value::none(),
        }
    }

    /// Coerce to a number (strings parse as decimal/hex numerals).
    pub fn to_number(&self, idx: i32) -> Option<f64> {
        coerce::to_number(self.to_value(idx), &self.strings)
    }

    /// Convert to a string id: strings pass through, numbers format and
    /// intern. Other types yield None.
    pub fn to_lua_string(&mut self, idx: i32) -> Option<StrId> {
        let v = self.to_value(idx);
        if let Some(sid) = v.as_str_id() {
            return Some(sid);
        }
        if let Some(n) = v.as_number() {
            let s = coerce::number_to_string(n);
            return Some(self.intern(s.as_bytes()));
        }
        None
    }

    /// Bytes of the string at idx (no coercion).
    pub fn to_str_bytes(&self, idx: i32) -> Option<&[u8]> {
        self.to_value(idx)
            .as_str_id()
            .map(|sid| self.strings.get_bytes(sid))
    }

    /// Truthiness of the value at idx.
    pub fn to_boolean(&self, idx: i32) -> bool {
        self.to_value(idx).is_truthy()
    }

    /// Table reference at idx, if it is a table.
    pub fn to_table(&self, idx: i32) -> Option<GcIdx<Table>> {
        self.to_value(idx).as_table_idx()
    }

    // ---- Type predicates ----

    pub fn is_nil(&self, idx: i32) -> bool {
        self.to_value(idx).is_nil()
    }

    pub fn is_none(&self, idx: i32) -> bool {
        self.to_value(idx).is_none()
    }

    pub fn is_none_or_nil(&self, idx: i32) -> bool {
        self.to_value(idx).is_none_or_nil()
    }

    pub fn is_boolean(&self, idx: i32) -> bool {
        self.to_value(idx).is_bool()
    }

    pub fn is_number(&self, idx: i32) -> bool {
        self.to_value(idx).is_number()
    }

    pub fn is_string(&self, idx: i32) -> bool {
        self.to_value(idx).is_string()
    }

    pub fn is_table(&self, idx: i32) -> bool {
        self.to_value(idx).is_table()
    }

    pub fn is_function(&self, idx: i32) -> bool {
        self.to_value(idx).is_function()
    }

    /// Lua-visible type name of the value at idx.
    pub fn type_name_at(&self, idx: i32) -> &'static str {
        type_name(self.to_value(idx))
    }

    // ---- Globals and tables ----

    /// Read a global by name (internal form).
    pub fn global_get(&mut self, name: &[u8]) -> Value {
        let sid = self.intern(name);
        self.heap.get_table(self.globals).raw_get_str(sid)
    }

    /// Write a global by name (internal form).
    pub fn global_set(&mut self, name: &[u8], value: Value) {
        let sid = self.intern(name);
        let globals = self.globals;
        self.heap.get_table_mut(globals).raw_set_str(sid, value);
    }

    /// Push the value of a global.
    pub fn get_global(&mut self, name: &str) -> Result<(), LuaError> {
        let v = self.global_get(name.as_bytes());
        self.push_value(v)
    }

    /// Pop the top value into a global.
    pub fn set_global(&mut self, name: &str) -> Result<(), LuaError> {
        let v = self.to_value(-1);
        if v.is_none() {
            return Err(LuaError::Runtime("set_global on empty stack".into()));
        }
        self.pop(1);
        self.global_set(name.as_bytes(), v);
        Ok(())
    }

    /// Push t[name] for the table at idx.
    pub fn get_field(&mut self, idx: i32, name: &str) -> Result<(), LuaError> {
        let t = self.expect_table(idx)?;
        let sid = self.intern(name.as_bytes());
        let v = self.heap.get_table(t).raw_get_str(sid);
        self.push_value(v)
    }

    /// Pop a value into t[name] for the table at idx.
    pub fn set_field(&mut self, idx: i32, name: &str) -> Result<(), LuaError> {
        let t = self.expect_table(idx)?;
        let v = self.to_value(-1);
        if v.is_none() {
            return Err(LuaError::Runtime("set_field on empty stack".into()));
        }
        self.pop(1);
        let sid = self.intern(name.as_bytes());
        self.heap.get_table_mut(t).raw_set_str(sid, v);
        Ok(())
    }

    /// Pop the key, push t[key] for the table at idx.
    pub fn get_table(&mut self, idx: i32) -> Result<(), LuaError> {
        let t = self.expect_table(idx)?;
        let key = self.to_value(-1);
        self.pop(1);
        let v = self.heap.get_table(t).raw_get(key);
        self.push_value(v)
    }

    /// Pop the value then the key, storing t[key] = value.
    pub fn set_table(&mut self, idx: i32) -> Result<(), LuaError> {
        let t = self.expect_table(idx)?;
        let value = self.to_value(-1);
        let key = self.to_value(-2);
        self.pop(2);
        self.raw_set_table(t, key, value)
    }

    /// Table write with key validation mapped to error kinds.
    pub fn raw_set_table(
        &mut self,
        t: GcIdx<Table>,
        key: Value,
        value: Value,
    ) -> Result<(), LuaError> {
        self.heap
            .get_table_mut(t)
            .raw_set(key, value)
            .map_err(|e| match e {
                TableKeyError::Nil => LuaError::TableIndexIsNil,
                TableKeyError::NaN => LuaError::Runtime("table index is NaN".into()),
            })
    }

    fn expect_table(&self, idx: i32) -> Result<GcIdx<Table>, LuaError> {
        let v = self.to_value(idx);
        v.as_table_idx().ok_or(LuaError::ExpectedTable {
            got: type_name(v),
        })
    }

    /// Length of the string or table at idx.
    pub fn obj_len(&self, idx: i32) -> Result<f64, LuaError> {
        let v = self.to_value(idx);
        if let Some(sid) = v.as_str_id() {
            return Ok(self.strings.get(sid).len() as f64);
        }
        if let Some(t) = v.as_table_idx() {
            return Ok(self.heap.get_table(t).length() as f64);
        }
        Err(LuaError::AttemptToGetLength { got: type_name(v) })
    }

    /// Concatenate the top n values into one string.
    pub fn concat(&mut self, n: usize) -> Result<(), LuaError> {
        if n == 0 {
            return self.push_string(b"");
        }
        let start = self.stack_top - n;
        let values = self.stack[start..self.stack_top].to_vec();
        let bytes = crate::arith::concat_bytes(&values, &self.strings)?;
        self.pop(n);
        self.push_string(&bytes)
    }

    /// Iteration step: pops a key, pushes the next key/value pair of the
    /// table at idx. Returns false (pushing nothing) at the end.
    pub fn next(&mut self, idx: i32) -> Result<bool, LuaError> {
        let t = self.expect_table(idx)?;
        let key = self.to_value(-1);
        self.pop(1);
        match self.heap.get_table(t).next(key) {
            Ok(Some((k, v))) => {
                self.push_value(k)?;
                self.push_value(v)?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(()) => Err(LuaError::Runtime("invalid key to 'next'".into())),
        }
    }

    /// Raw (metamethod-free) equality of two stack slots.
    pub fn raw_equal(&self, i1: i32, i2: i32) -> bool {
        crate::compare::raw_eq(self.to_value(i1), self.to_value(i2))
    }

    // ---- Loading and calling ----

    /// Compile a chunk and push the resulting closure.
    pub fn load(&mut self, source: &[u8], chunk_name: &str) -> Result<(), LuaError> {
        let proto = compiler::compile_into(source, chunk_name, &mut self.strings)
            .map_err(|e| LuaError::Compile(format!("{chunk_name}:{e}")))?;
        let fresh = self.strings.take_registered();
        self.heap.add_registered(fresh);
        let pid = self.register_proto(proto);
        let cl = self.heap.alloc_closure(pid, Vec::new());
        self.push_value(Value::from_closure(cl))
    }

    /// Call the function below the top nargs values, expecting nresults
    /// (MULTRET for all). Results replace the function and arguments.
    pub fn call(&mut self, nargs: usize, nresults: i32) -> Result<(), LuaError> {
        let base = self.api_base();
        if self.stack_top < base + nargs + 1 {
            return Err(LuaError::Runtime("not enough values for call".into()));
        }
        let func_slot = self.stack_top - nargs - 1;
        dispatch::call_value(self, func_slot, nargs, nresults)
    }

    /// Protected call: on error, frames and stack are restored to the
    /// pre-call shape (function and arguments popped), open upvalues
    /// above the boundary are closed, and the error is returned.
    pub fn pcall(&mut self, nargs: usize, nresults: i32) -> Result<(), LuaError> {
        let saved_frames = self.call_stack.len();
        let func_slot = self.stack_top - nargs - 1;
        match self.call(nargs, nresults) {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.close_upvalues(func_slot);
                self.call_stack.truncate(saved_frames);
                for i in func_slot..self.stack_top.max(func_slot) {
                    if i < STACK_CAPACITY {
                        self.stack[i] = Value::nil();
                    }
                }
                self.stack_top = func_slot;
                Err(e)
            }
        }
    }

    /// Run the closure on top of the stack with no arguments and no
    /// expected results.
    pub fn run(&mut self) -> Result<(), LuaError> {
        self.call(0, 0)
    }

    // ---- Formatting ----

    /// Render a value the way print/tostring show it.
    pub fn display_value(&self, v: Value) -> String {
        if v.is_nil() {
            "nil".to_string()
        } else if v.is_none() {
            "no value".to_string()
        } else if let Some(b) = v.as_bool() {
            if b { "true" } else { "false" }.to_string()
        } else if let Some(n) = v.as_number() {
            coerce::number_to_string(n)
        } else if let Some(sid) = v.as_str_id() {
            String::from_utf8_lossy(self.strings.get_bytes(sid)).into_owned()
        } else if v.is_table() {
            format!("table: 0x{:08x}", v.gc_index().unwrap_or(0))
        } else if v.is_function() {
            format!("function: 0x{:08x}", v.gc_index().unwrap_or(0))
        } else if v.as_thread_idx().is_some() {
            format!("thread: 0x{:08x}", v.gc_index().unwrap_or(0))
        } else {
            format!("userdata: 0x{:08x}", v.gc_index().unwrap_or(0))
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}
