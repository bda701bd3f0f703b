/// Scope and variable management for the compiler.
use crescent_core::string::StrId;

/// A local variable in the current function scope.
#[derive(Clone, Debug)]
pub struct LocalVarInfo {
    pub name: StrId,
    /// Register index.
    pub reg: u8,
    /// Scope depth when declared.
    pub scope_depth: usize,
    /// Whether a nested closure captured this local as an upvalue.
    /// Leaving its block must then emit CLOSE.
    pub captured: bool,
}

/// Block scope tracking.
#[derive(Clone, Debug)]
pub struct BlockScope {
    /// Number of local variables when this block started.
    pub num_locals_on_entry: usize,
    /// First register that can be freed when this block exits.
    pub first_free_reg_on_entry: u8,
    /// Whether this block is a loop (for break).
    pub is_loop: bool,
    /// Break target patch list: JMP pcs to backpatch.
    pub break_jumps: Vec<usize>,
}

/// Manages scopes and local variables for a single function.
pub struct ScopeManager {
    /// All active local variables in the current function.
    pub locals: Vec<LocalVarInfo>,
    /// Block scope stack.
    pub blocks: Vec<BlockScope>,
    /// Current scope depth.
    pub scope_depth: usize,
    /// Next available register.
    pub free_reg: u8,
    /// High-water mark for register usage.
    pub max_reg: u8,
}

impl ScopeManager {
    pub fn new() -> Self {
        ScopeManager {
            locals: Vec::new(),
            blocks: Vec::new(),
            scope_depth: 0,
            free_reg: 0,
            max_reg: 0,
        }
    }

    /// Enter a new block scope.
    pub fn enter_block(&mut self, is_loop: bool) {
        self.scope_depth += 1;
        self.blocks.push(BlockScope {
            num_locals_on_entry: self.locals.len(),
            first_free_reg_on_entry: self.free_reg,
            is_loop,
            break_jumps: Vec::new(),
        });
    }

    /// Leave the current block scope. Returns the block plus whether any
    /// local it declared was captured by a closure (needs CLOSE).
    pub fn leave_block(&mut self) -> (BlockScope, bool) {
        self.scope_depth -= 1;
        let block = self.blocks.pop().expect("mismatched block");
        let captured = self.locals[block.num_locals_on_entry..]
            .iter()
            .any(|l| l.captured);
        self.locals.truncate(block.num_locals_on_entry);
        self.free_reg = block.first_free_reg_on_entry;
        (block, captured)
    }

    /// Register a new local variable. Returns its register.
    pub fn add_local(&mut self, name: StrId) -> u8 {
        let reg = self.free_reg;
        self.locals.push(LocalVarInfo {
            name,
            reg,
            scope_depth: self.scope_depth,
            captured: false,
        });
        self.free_reg += 1;
        if self.free_reg > self.max_reg {
            self.max_reg = self.free_reg;
        }
        reg
    }

    /// Allocate a temporary register.
    pub fn alloc_reg(&mut self) -> u8 {
        let reg = self.free_reg;
        self.free_reg += 1;
        if self.free_reg > self.max_reg {
            self.max_reg = self.free_reg;
        }
        reg
    }

    /// Allocate n consecutive registers, returning the first.
    pub fn alloc_regs(&mut self, n: u8) -> u8 {
        let first = self.free_reg;
        self.free_reg += n;
        if self.free_reg > self.max_reg {
            self.max_reg = self.free_reg;
        }
        first
    }

    /// Free registers down to the given level.
    pub fn free_reg_to(&mut self, level: u8) {
        debug_assert!(level <= self.free_reg);
        self.free_reg = level;
    }

    /// Set the register level exactly: frees above it, reserves up to it.
    /// Keeps the high-water mark (frame sizing) in step.
    pub fn set_reg_level(&mut self, level: u8) {
        self.free_reg = level;
        if level > self.max_reg {
            self.max_reg = level;
        }
    }

    /// Look up a local variable by name (innermost first).
    pub fn resolve_local(&self, name: StrId) -> Option<&LocalVarInfo> {
        self.locals.iter().rev().find(|v| v.name == name)
    }

    /// Mark the local holding `reg` as captured by a closure.
    pub fn mark_captured(&mut self, reg: u8) {
        if let Some(local) = self.locals.iter_mut().rev().find(|v| v.reg == reg) {
            local.captured = true;
        }
    }

    /// True when any local declared since the innermost loop block was
    /// captured (break must then emit CLOSE before jumping out).
    pub fn loop_needs_close(&self) -> Option<u8> {
        let block = self.blocks.iter().rev().find(|b| b.is_loop)?;
        let captured = self.locals[block.num_locals_on_entry.min(self.locals.len())..]
            .iter()
            .any(|l| l.captured);
        if captured {
            Some(block.first_free_reg_on_entry)
        } else {
            None
        }
    }

    /// Find the nearest enclosing loop block.
    pub fn find_loop_block(&mut self) -> Option<&mut BlockScope> {
        self.blocks.iter_mut().rev().find(|b| b.is_loop)
    }
}

impl Default for ScopeManager {
    fn default() -> Self {
        Self::new()
    }
}
