//! GC heap with arena-based allocation and typed indices.
//!
//! The heap owns tables, script closures, upvalues, userdata and threads.
//! Strings live in the StringPool and natives/prototypes in the State;
//! their mark bits are kept here so one mark phase covers everything, and
//! each owner sweeps its own pool with those bits.

use crate::table::{Table, TableKey};
use crate::value::Value;
use std::marker::PhantomData;

/// A typed index into an arena in the GcHeap.
#[derive(Debug)]
pub struct GcIdx<T>(pub u32, pub PhantomData<T>);

impl<T> Clone for GcIdx<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GcIdx<T> {}

impl<T> PartialEq for GcIdx<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T> Eq for GcIdx<T> {}

impl<T> std::hash::Hash for GcIdx<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> GcIdx<T> {
    pub fn new(index: u32) -> Self {
        GcIdx(index, PhantomData)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

/// Sub-tags for GC references (stored in bits 44-46 of the value payload).
pub const GC_SUB_TABLE: u64 = 0;
pub const GC_SUB_CLOSURE: u64 = 1;
pub const GC_SUB_NATIVE: u64 = 2;
pub const GC_SUB_UPVAL: u64 = 3;
pub const GC_SUB_USERDATA: u64 = 4;
pub const GC_SUB_STRING: u64 = 5;
pub const GC_SUB_THREAD: u64 = 6;

/// Bits used for sub-tag within the 47-bit payload.
pub const GC_SUB_SHIFT: u64 = 44;
pub const GC_SUB_MASK: u64 = 0x7; // 3 bits
/// Mask for the index within the payload (lower 44 bits).
pub const GC_INDEX_MASK: u64 = (1u64 << 44) - 1;

/// Id of a function prototype in the state's prototype arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProtoId(pub u32);

/// Id of a native (host) closure in the state's native pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NativeId(pub u32);

/// A script closure: a prototype plus captured upvalue cells.
#[derive(Debug)]
pub struct Closure {
    pub proto: ProtoId,
    pub upvalues: Vec<GcIdx<UpVal>>,
}

/// An upvalue: open (pointing into the stack) or closed (owning a value).
#[derive(Debug)]
pub struct UpVal {
    pub location: UpValLocation,
}

/// Where an upvalue's value lives. The Open -> Closed transition is
/// irreversible.
#[derive(Debug)]
pub enum UpValLocation {
    /// Points at a stack slot still owned by an active frame.
    Open(usize),
    /// Value captured inline after the frame was abandoned.
    Closed(Value),
}

/// A full userdata: an opaque byte payload plus an optional environment.
#[derive(Debug)]
pub struct UserData {
    pub data: Vec<u8>,
    pub env: Option<GcIdx<Table>>,
}

/// Thread run state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    Ok,
    Error,
}

/// A thread object. Coroutines are out of scope, so threads carry no
/// stack of their own; the main thread's stack lives on the State and is
/// traced as a root.
#[derive(Debug)]
pub struct LuaThread {
    pub status: ThreadStatus,
}

/// Collection floor: the threshold never drops below this many objects.
const THRESHOLD_FLOOR: usize = 1024;

/// Mark state for one collection cycle plus the trigger bookkeeping.
pub struct GcState {
    // Mark bits for heap arenas.
    pub table_marks: Vec<bool>,
    pub closure_marks: Vec<bool>,
    pub upval_marks: Vec<bool>,
    pub userdata_marks: Vec<bool>,
    pub thread_marks: Vec<bool>,
    // Mark bits for pools owned outside the heap.
    pub string_marks: Vec<bool>,
    pub native_marks: Vec<bool>,
    pub proto_marks: Vec<bool>,

    // Gray lists: marked but not yet traversed.
    pub gray_tables: Vec<u32>,
    pub gray_closures: Vec<u32>,
    pub gray_upvals: Vec<u32>,
    pub gray_userdata: Vec<u32>,
    /// Drained by the State, which owns the native pool.
    pub gray_natives: Vec<u32>,
    /// Drained by the State, which owns the prototype arena.
    pub gray_protos: Vec<u32>,

    /// Live objects after the last sweep plus registrations since.
    pub object_count: usize,
    /// Collection runs when object_count exceeds this.
    pub threshold: usize,
    /// Guard against re-entrant collection.
    pub collecting: bool,
}

impl GcState {
    pub fn new() -> Self {
        GcState {
            table_marks: Vec::new(),
            closure_marks: Vec::new(),
            upval_marks: Vec::new(),
            userdata_marks: Vec::new(),
            thread_marks: Vec::new(),
            string_marks: Vec::new(),
            native_marks: Vec::new(),
            proto_marks: Vec::new(),
            gray_tables: Vec::new(),
            gray_closures: Vec::new(),
            gray_upvals: Vec::new(),
            gray_userdata: Vec::new(),
            gray_natives: Vec::new(),
            gray_protos: Vec::new(),
            object_count: 0,
            threshold: THRESHOLD_FLOOR,
            collecting: false,
        }
    }
}

impl Default for GcState {
    fn default() -> Self {
        Self::new()
    }
}

/// Arena-based GC heap.
pub struct GcHeap {
    pub tables: Vec<Option<Table>>,
    table_free: Vec<u32>,
    pub closures: Vec<Option<Closure>>,
    closure_free: Vec<u32>,
    pub upvals: Vec<Option<UpVal>>,
    upval_free: Vec<u32>,
    pub userdata: Vec<Option<UserData>>,
    userdata_free: Vec<u32>,
    pub threads: Vec<Option<LuaThread>>,
    thread_free: Vec<u32>,
    /// Mark/trigger state for collection.
    pub gc_state: GcState,
}

impl GcHeap {
    pub fn new() -> Self {
        GcHeap {
            tables: Vec::new(),
            table_free: Vec::new(),
            closures: Vec::new(),
            closure_free: Vec::new(),
            upvals: Vec::new(),
            upval_free: Vec::new(),
            userdata: Vec::new(),
            userdata_free: Vec::new(),
            threads: Vec::new(),
            thread_free: Vec::new(),
            gc_state: GcState::new(),
        }
    }

    /// Record `n` registrations from a pool the heap does not own.
    pub fn add_registered(&mut self, n: usize) {
        self.gc_state.object_count += n;
    }

    /// True when the registration counter crossed the threshold and no
    /// collection is already running.
    pub fn should_collect(&self) -> bool {
        !self.gc_state.collecting && self.gc_state.object_count > self.gc_state.threshold
    }

    pub fn alloc_table(&mut self, array_hint: usize, hash_hint: usize) -> GcIdx<Table> {
        self.gc_state.object_count += 1;
        let table = Table::new(array_hint, hash_hint);
        if let Some(idx) = self.table_free.pop() {
            self.tables[idx as usize] = Some(table);
            GcIdx::new(idx)
        } else {
            let idx = self.tables.len() as u32;
            self.tables.push(Some(table));
            GcIdx::new(idx)
        }
    }

    pub fn get_table(&self, idx: GcIdx<Table>) -> &Table {
        self.tables[idx.0 as usize]
            .as_ref()
            .expect("table was freed")
    }

    pub fn get_table_mut(&mut self, idx: GcIdx<Table>) -> &mut Table {
        self.tables[idx.0 as usize]
            .as_mut()
            .expect("table was freed")
    }

    pub fn alloc_closure(&mut self, proto: ProtoId, upvalues: Vec<GcIdx<UpVal>>) -> GcIdx<Closure> {
        self.gc_state.object_count += 1;
        let closure = Closure { proto, upvalues };
        if let Some(idx) = self.closure_free.pop() {
            self.closures[idx as usize] = Some(closure);
            GcIdx::new(idx)
        } else {
            let idx = self.closures.len() as u32;
            self.closures.push(Some(closure));
            GcIdx::new(idx)
        }
    }

    pub fn get_closure(&self, idx: GcIdx<Closure>) -> &Closure {
        self.closures[idx.0 as usize]
            .as_ref()
            .expect("closure was freed")
    }

    pub fn alloc_upval(&mut self, location: UpValLocation) -> GcIdx<UpVal> {
        self.gc_state.object_count += 1;
        let upval = UpVal { location };
        if let Some(idx) = self.upval_free.pop() {
            self.upvals[idx as usize] = Some(upval);
            GcIdx::new(idx)
        } else {
            let idx = self.upvals.len() as u32;
            self.upvals.push(Some(upval));
            GcIdx::new(idx)
        }
    }

    pub fn get_upval(&self, idx: GcIdx<UpVal>) -> &UpVal {
        self.upvals[idx.0 as usize]
            .as_ref()
            .expect("upval was freed")
    }

    pub fn get_upval_mut(&mut self, idx: GcIdx<UpVal>) -> &mut UpVal {
        self.upvals[idx.0 as usize]
            .as_mut()
            .expect("upval was freed")
    }

    pub fn alloc_userdata(&mut self, size: usize) -> GcIdx<UserData> {
        self.gc_state.object_count += 1;
        let ud = UserData {
            data: vec![0u8; size],
            env: None,
        };
        if let Some(idx) = self.userdata_free.pop() {
            self.userdata[idx as usize] = Some(ud);
            GcIdx::new(idx)
        } else {
            let idx = self.userdata.len() as u32;
            self.userdata.push(Some(ud));
            GcIdx::new(idx)
        }
    }

    pub fn get_userdata(&self, idx: GcIdx<UserData>) -> &UserData {
        self.userdata[idx.0 as usize]
            .as_ref()
            .expect("userdata was freed")
    }

    pub fn get_userdata_mut(&mut self, idx: GcIdx<UserData>) -> &mut UserData {
        self.userdata[idx.0 as usize]
            .as_mut()
            .expect("userdata was freed")
    }

    pub fn alloc_thread(&mut self) -> GcIdx<LuaThread> {
        self.gc_state.object_count += 1;
        let thread = LuaThread {
            status: ThreadStatus::Ok,
        };
        if let Some(idx) = self.thread_free.pop() {
            self.threads[idx as usize] = Some(thread);
            GcIdx::new(idx)
        } else {
            let idx = self.threads.len() as u32;
            self.threads.push(Some(thread));
            GcIdx::new(idx)
        }
    }

    pub fn get_thread(&self, idx: GcIdx<LuaThread>) -> &LuaThread {
        self.threads[idx.0 as usize]
            .as_ref()
            .expect("thread was freed")
    }

    // ---- Mark phase ----

    /// Reset mark bits for a new cycle. Pool sizes for the externally
    /// owned strings/natives/protos come from their owners.
    pub fn gc_prepare_marks(&mut self, strings: usize, natives: usize, protos: usize) {
        let st = &mut self.gc_state;
        st.table_marks.clear();
        st.table_marks.resize(self.tables.len(), false);
        st.closure_marks.clear();
        st.closure_marks.resize(self.closures.len(), false);
        st.upval_marks.clear();
        st.upval_marks.resize(self.upvals.len(), false);
        st.userdata_marks.clear();
        st.userdata_marks.resize(self.userdata.len(), false);
        st.thread_marks.clear();
        st.thread_marks.resize(self.threads.len(), false);
        st.string_marks.clear();
        st.string_marks.resize(strings, false);
        st.native_marks.clear();
        st.native_marks.resize(natives, false);
        st.proto_marks.clear();
        st.proto_marks.resize(protos, false);
        st.gray_tables.clear();
        st.gray_closures.clear();
        st.gray_upvals.clear();
        st.gray_userdata.clear();
        st.gray_natives.clear();
        st.gray_protos.clear();
    }

    /// Mark a Value as reachable. Non-leaf objects go on a gray list.
    pub fn gc_mark_value(&mut self, val: Value) {
        let (sub, idx) = match (val.gc_sub_tag(), val.gc_index()) {
            (Some(s), Some(i)) => (s, i as usize),
            _ => return,
        };
        let st = &mut self.gc_state;
        match sub {
            GC_SUB_TABLE => {
                if idx < st.table_marks.len() && !st.table_marks[idx] {
                    st.table_marks[idx] = true;
                    st.gray_tables.push(idx as u32);
                }
            }
            GC_SUB_CLOSURE => {
                if idx < st.closure_marks.len() && !st.closure_marks[idx] {
                    st.closure_marks[idx] = true;
                    st.gray_closures.push(idx as u32);
                }
            }
            GC_SUB_UPVAL => {
                if idx < st.upval_marks.len() && !st.upval_marks[idx] {
                    st.upval_marks[idx] = true;
                    st.gray_upvals.push(idx as u32);
                }
            }
            GC_SUB_USERDATA => {
                if idx < st.userdata_marks.len() && !st.userdata_marks[idx] {
                    st.userdata_marks[idx] = true;
                    st.gray_userdata.push(idx as u32);
                }
            }
            GC_SUB_NATIVE => {
                if idx < st.native_marks.len() && !st.native_marks[idx] {
                    st.native_marks[idx] = true;
                    st.gray_natives.push(idx as u32);
                }
            }
            GC_SUB_STRING => {
                if idx < st.string_marks.len() {
                    st.string_marks[idx] = true;
                }
            }
            GC_SUB_THREAD => {
                // Leaf: the main thread's stack is traced as a root by
                // the state and no thread owns another stack.
                if idx < st.thread_marks.len() {
                    st.thread_marks[idx] = true;
                }
            }
            _ => {}
        }
    }

    /// Mark an upvalue cell reachable (open-upvalue chain roots).
    pub fn gc_mark_upval(&mut self, idx: GcIdx<UpVal>) {
        let i = idx.0 as usize;
        let st = &mut self.gc_state;
        if i < st.upval_marks.len() && !st.upval_marks[i] {
            st.upval_marks[i] = true;
            st.gray_upvals.push(idx.0);
        }
    }

    /// Mark a prototype reachable (frames reference protos directly).
    pub fn gc_mark_proto(&mut self, proto: ProtoId) {
        let i = proto.0 as usize;
        let st = &mut self.gc_state;
        if i < st.proto_marks.len() && !st.proto_marks[i] {
            st.proto_marks[i] = true;
            st.gray_protos.push(proto.0);
        }
    }

    /// Traverse the heap-owned gray lists, marking children. Gray natives
    /// and protos are left for their owner to drain. Returns the number of
    /// objects traversed.
    pub fn gc_propagate(&mut self) -> usize {
        let mut work = 0;

        while let Some(idx) = self.gc_state.gray_tables.pop() {
            let i = idx as usize;
            let mut children = Vec::new();
            let mut string_keys = Vec::new();
            if let Some(table) = &self.tables[i] {
                if let Some(mt) = table.metatable {
                    children.push(Value::from_table(mt));
                }
                for &v in table.array_values() {
                    if v.is_gc() {
                        children.push(v);
                    }
                }
                for (key, &v) in table.hash_entries() {
                    if v.is_gc() {
                        children.push(v);
                    }
                    match key {
                        TableKey::String(sid) => string_keys.push(*sid),
                        TableKey::GcRef(bits) => {
                            children.push(Value::from_raw_bits(*bits));
                        }
                        _ => {}
                    }
                }
            }
            for sid in string_keys {
                let si = sid.0 as usize;
                if si < self.gc_state.string_marks.len() {
                    self.gc_state.string_marks[si] = true;
                }
            }
            for child in children {
                self.gc_mark_value(child);
            }
            work += 1;
        }

        while let Some(idx) = self.gc_state.gray_closures.pop() {
            let i = idx as usize;
            let (upvals, proto) = match &self.closures[i] {
                Some(c) => (c.upvalues.clone(), c.proto),
                None => continue,
            };
            for uv in upvals {
                self.gc_mark_upval(uv);
            }
            self.gc_mark_proto(proto);
            work += 1;
        }

        while let Some(idx) = self.gc_state.gray_upvals.pop() {
            let i = idx as usize;
            let closed = match &self.upvals[i] {
                // Open upvalues point into the stack, which is a root.
                Some(uv) => match uv.location {
                    UpValLocation::Closed(v) => Some(v),
                    UpValLocation::Open(_) => None,
                },
                None => None,
            };
            if let Some(v) = closed {
                self.gc_mark_value(v);
            }
            work += 1;
        }

        while let Some(idx) = self.gc_state.gray_userdata.pop() {
            let i = idx as usize;
            let env = self.userdata[i].as_ref().and_then(|u| u.env);
            if let Some(env) = env {
                self.gc_mark_value(Value::from_table(env));
            }
            work += 1;
        }

        work
    }

    /// True when every heap-owned gray list has been drained.
    pub fn gray_is_empty(&self) -> bool {
        self.gc_state.gray_tables.is_empty()
            && self.gc_state.gray_closures.is_empty()
            && self.gc_state.gray_upvals.is_empty()
            && self.gc_state.gray_userdata.is_empty()
    }

    // ---- Sweep phase ----

    /// Sweep the heap arenas, freeing unmarked objects and recycling their
    /// slots. Returns (collected, live) for this heap's arenas only.
    pub fn gc_sweep(&mut self) -> (usize, usize) {
        let mut collected = 0;
        let mut live = 0;

        for i in 0..self.tables.len() {
            if self.tables[i].is_some() {
                if !self.gc_state.table_marks.get(i).copied().unwrap_or(false) {
                    self.tables[i] = None;
                    self.table_free.push(i as u32);
                    collected += 1;
                } else {
                    live += 1;
                }
            }
        }
        for i in 0..self.closures.len() {
            if self.closures[i].is_some() {
                if !self.gc_state.closure_marks.get(i).copied().unwrap_or(false) {
                    self.closures[i] = None;
                    self.closure_free.push(i as u32);
                    collected += 1;
                } else {
                    live += 1;
                }
            }
        }
        for i in 0..self.upvals.len() {
            if self.upvals[i].is_some() {
                if !self.gc_state.upval_marks.get(i).copied().unwrap_or(false) {
                    self.upvals[i] = None;
                    self.upval_free.push(i as u32);
                    collected += 1;
                } else {
                    live += 1;
                }
            }
        }
        for i in 0..self.userdata.len() {
            if self.userdata[i].is_some() {
                if !self
                    .gc_state
                    .userdata_marks
                    .get(i)
                    .copied()
                    .unwrap_or(false)
                {
                    self.userdata[i] = None;
                    self.userdata_free.push(i as u32);
                    collected += 1;
                } else {
                    live += 1;
                }
            }
        }
        for i in 0..self.threads.len() {
            if self.threads[i].is_some() {
                if !self.gc_state.thread_marks.get(i).copied().unwrap_or(false) {
                    self.threads[i] = None;
                    self.thread_free.push(i as u32);
                    collected += 1;
                } else {
                    live += 1;
                }
            }
        }

        (collected, live)
    }

    /// Close out a cycle: reset the counter to the live population and set
    /// the next threshold from sweep efficiency. A productive sweep pulls
    /// the factor toward 1.5, an unproductive one toward 3.0; the
    /// threshold never drops below the floor.
    pub fn gc_finish(&mut self, collected: usize, live: usize) {
        let efficiency = if collected + live > 0 {
            collected as f64 / (collected + live) as f64
        } else {
            0.0
        };
        let factor = 3.0 - 1.5 * efficiency;
        self.gc_state.object_count = live;
        self.gc_state.threshold = ((live as f64 * factor) as usize).max(THRESHOLD_FLOOR);
        self.gc_state.collecting = false;
    }

    /// Live objects across the heap arenas.
    pub fn live_objects(&self) -> usize {
        self.tables.iter().filter(|t| t.is_some()).count()
            + self.closures.iter().filter(|c| c.is_some()).count()
            + self.upvals.iter().filter(|u| u.is_some()).count()
            + self.userdata.iter().filter(|u| u.is_some()).count()
            + self.threads.iter().filter(|t| t.is_some()).count()
    }
}

impl Default for GcHeap {
    fn default() -> Self {
        Self::new()
    }
}
