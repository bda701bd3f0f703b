/// Single-pass Lua 5.1 compiler: source -> Proto bytecode.
pub mod expr;
pub mod scope;

use crate::lexer::{LexError, Lexer};
use crate::opcode::{
    rk_constant, Instruction, OpCode, FIELDS_PER_FLUSH, MAX_C, MAX_INDEX_RK,
};
use crate::proto::{Constant, Proto};
use crate::token::Token;
use crescent_core::string::{StrId, StringPool};
use expr::{BinOp, ExprDesc, UnOp, UNARY_PRIORITY};
use scope::ScopeManager;
use std::fmt;

/// Compiler error.
#[derive(Clone, Debug)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

impl From<LexError> for CompileError {
    fn from(e: LexError) -> Self {
        CompileError {
            message: e.message,
            line: e.line,
        }
    }
}

/// Upvalue description during compilation. The capture site is encoded as
/// a MOVE/GETUPVAL pseudo-instruction after the CLOSURE.
#[derive(Clone, Debug)]
struct UpvalInfo {
    name: StrId,
    in_stack: bool,
    index: u8,
}

/// State for a single function being compiled.
struct FuncState {
    proto: Proto,
    scope: ScopeManager,
    upvalues: Vec<UpvalInfo>,
}

impl FuncState {
    fn new() -> Self {
        FuncState {
            proto: Proto::new(),
            scope: ScopeManager::new(),
            upvalues: Vec::new(),
        }
    }

    fn emit(&mut self, inst: Instruction, line: u32) -> usize {
        self.proto.emit(inst, line)
    }

    fn current_pc(&self) -> usize {
        self.proto.code_len()
    }

    fn add_constant(&mut self, k: Constant) -> u32 {
        self.proto.add_constant(k) as u32
    }
}

/// The left operand of a binary op: literals are held back for constant
/// folding, anything else is materialized to an RK operand before the
/// right-hand side emits code (left-to-right evaluation).
enum Operand {
    Lit(ExprDesc),
    Rk(u16),
}

/// The compiler: holds the lexer and the function state stack.
pub struct Compiler<'a> {
    lexer: Lexer<'a>,
    func_stack: Vec<FuncState>,
}

impl<'a> Compiler<'a> {
    fn fs(&self) -> &FuncState {
        self.func_stack.last().unwrap()
    }

    fn fs_mut(&mut self) -> &mut FuncState {
        self.func_stack.last_mut().unwrap()
    }

    fn line(&self) -> u32 {
        self.lexer.line()
    }

    fn error(&self, msg: impl Into<String>) -> CompileError {
        CompileError {
            message: msg.into(),
            line: self.line(),
        }
    }

    // ---- Token helpers ----

    fn current_token(&self) -> Result<&Token, CompileError> {
        self.lexer
            .current()
            .map(|st| &st.token)
            .map_err(|e| CompileError {
                message: e.message.clone(),
                line: e.line,
            })
    }

    fn check(&self, expected: &Token) -> bool {
        self.current_token().map(|t| t == expected).unwrap_or(false)
    }

    fn advance(&mut self) -> Result<Token, CompileError> {
        let st = self.lexer.advance()?;
        Ok(st.token)
    }

    fn expect(&mut self, expected: &Token) -> Result<(), CompileError> {
        if self.check(expected) {
            self.advance()?;
            Ok(())
        } else {
            let found = self
                .current_token()
                .map(|t| format!("{t}"))
                .unwrap_or("error".into());
            Err(self.error(format!("'{expected}' expected near '{found}'")))
        }
    }

    fn expect_name(&mut self) -> Result<StrId, CompileError> {
        match self.current_token()?.clone() {
            Token::Name(id) => {
                self.advance()?;
                Ok(id)
            }
            other => Err(self.error(format!("<name> expected near '{other}'"))),
        }
    }

    fn test_next(&mut self, expected: &Token) -> Result<bool, CompileError> {
        if self.check(expected) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // ---- Code generation helpers ----

    fn emit(&mut self, inst: Instruction, line: u32) -> usize {
        self.fs_mut().emit(inst, line)
    }

    fn emit_abc(&mut self, op: OpCode, a: u8, b: u16, c: u16, line: u32) -> usize {
        self.emit(Instruction::abc(op, a, b, c), line)
    }

    fn emit_abx(&mut self, op: OpCode, a: u8, bx: u32, line: u32) -> usize {
        self.emit(Instruction::abx(op, a, bx), line)
    }

    fn emit_jump(&mut self, line: u32) -> usize {
        self.emit(Instruction::asbx(OpCode::Jmp, 0, 0), line) // patched later
    }

    fn patch_jump(&mut self, jump_pc: usize) {
        let target = self.fs().current_pc();
        self.patch_jump_to(jump_pc, target);
    }

    fn patch_jump_to(&mut self, jump_pc: usize, target: usize) {
        let offset = target as i32 - jump_pc as i32 - 1;
        self.fs_mut().proto.get_mut(jump_pc).set_sbx(offset);
    }

    /// Discharge an ExprDesc into a specific register.
    fn discharge_to_reg(&mut self, expr: &ExprDesc, reg: u8, line: u32) {
        match expr {
            ExprDesc::Nil => {
                self.emit_abc(OpCode::LoadNil, reg, reg as u16, 0, line);
            }
            ExprDesc::True => {
                self.emit_abc(OpCode::LoadBool, reg, 1, 0, line);
            }
            ExprDesc::False => {
                self.emit_abc(OpCode::LoadBool, reg, 0, 0, line);
            }
            ExprDesc::Number(n) => {
                let k = self.fs_mut().add_constant(Constant::Number(*n));
                self.emit_abx(OpCode::LoadK, reg, k, line);
            }
            ExprDesc::Str(id) => {
                let k = self.fs_mut().add_constant(Constant::String(*id));
                self.emit_abx(OpCode::LoadK, reg, k, line);
            }
            ExprDesc::Register(src) => {
                if *src != reg {
                    self.emit_abc(OpCode::Move, reg, *src as u16, 0, line);
                }
            }
            ExprDesc::Upvalue(idx) => {
                self.emit_abc(OpCode::GetUpval, reg, *idx as u16, 0, line);
            }
            ExprDesc::Global { name_k } => {
                self.emit_abx(OpCode::GetGlobal, reg, *name_k, line);
            }
            ExprDesc::Indexed { table, key } => {
                self.emit_abc(OpCode::GetTable, reg, *table as u16, *key, line);
            }
            ExprDesc::Jump(pc) => {
                // Materialize a comparison as a boolean. The JMP at `pc`
                // is taken when the condition is false.
                let pc = *pc;
                self.emit_abc(OpCode::LoadBool, reg, 1, 1, line); // true, skip next
                let false_pc = self.fs().current_pc();
                self.emit_abc(OpCode::LoadBool, reg, 0, 0, line); // false
                self.patch_jump_to(pc, false_pc);
            }
            ExprDesc::Call(pc) => {
                // Ask the call for exactly one result, then move it.
                let inst = &mut self.fs_mut().proto.code[*pc];
                let a = inst.a();
                inst.set_c(2);
                if a != reg {
                    self.emit_abc(OpCode::Move, reg, a as u16, 0, line);
                }
            }
            ExprDesc::Vararg(pc) => {
                let inst = &mut self.fs_mut().proto.code[*pc];
                inst.set_a(reg);
                inst.set_b(2);
            }
            ExprDesc::Void => {}
        }
    }

    /// Discharge an expression into any register, returning the register.
    fn discharge_to_any_reg(&mut self, expr: &ExprDesc, line: u32) -> u8 {
        match expr {
            ExprDesc::Register(r) => *r,
            _ => {
                let reg = self.fs_mut().scope.alloc_reg();
                self.discharge_to_reg(expr, reg, line);
                reg
            }
        }
    }

    /// Resolve an expression to an RK operand: literals become constant
    /// references when the pool index fits 8 bits, everything else lands
    /// in a register.
    fn exp_to_rk(&mut self, expr: &ExprDesc, line: u32) -> u16 {
        let k = match expr {
            ExprDesc::Nil => Some(Constant::Nil),
            ExprDesc::True => Some(Constant::Boolean(true)),
            ExprDesc::False => Some(Constant::Boolean(false)),
            ExprDesc::Number(n) => Some(Constant::Number(*n)),
            ExprDesc::Str(id) => Some(Constant::String(*id)),
            _ => None,
        };
        if let Some(k) = k {
            let idx = self.fs_mut().add_constant(k);
            if idx <= MAX_INDEX_RK {
                return rk_constant(idx);
            }
        }
        self.discharge_to_any_reg(expr, line) as u16
    }

    // ---- Expression parsing ----

    /// Parse a full expression (precedence climbing).
    pub(crate) fn expression(&mut self) -> Result<ExprDesc, CompileError> {
        self.sub_expression(0)
    }

    fn sub_expression(&mut self, min_prec: u8) -> Result<ExprDesc, CompileError> {
        let line = self.line();
        let expr = if let Some(unop) = self.check_unary_op()? {
            self.advance()?;
            let sub = self.sub_expression(UNARY_PRIORITY)?;
            self.code_unary_op(unop, sub, line)?
        } else {
            self.simple_expression()?
        };
        self.binop_loop(expr, min_prec)
    }

    /// Continue parsing binary operators after an already-parsed prefix.
    fn binop_loop(&mut self, mut expr: ExprDesc, min_prec: u8) -> Result<ExprDesc, CompileError> {
        while let Some(binop) = self.check_binary_op()? {
            let (left_prec, right_prec) = binop.priority();
            if left_prec <= min_prec {
                break;
            }
            let op_line = self.line();
            self.advance()?;

            if binop == BinOp::And || binop == BinOp::Or {
                expr = self.code_short_circuit(binop, expr, right_prec, op_line)?;
            } else if binop == BinOp::Concat {
                // Concat wants all operands in consecutive registers.
                let first_reg = self.fs_mut().scope.alloc_reg();
                self.discharge_to_reg(&expr, first_reg, op_line);
                let mut last_reg = first_reg;
                loop {
                    let operand = self.sub_expression(left_prec)?;
                    let reg = self.fs_mut().scope.alloc_reg();
                    self.discharge_to_reg(&operand, reg, op_line);
                    last_reg = reg;
                    if let Some(next_op) = self.check_binary_op()? {
                        if next_op == BinOp::Concat {
                            self.advance()?;
                            continue;
                        }
                    }
                    break;
                }
                self.emit_abc(
                    OpCode::Concat,
                    first_reg,
                    first_reg as u16,
                    last_reg as u16,
                    op_line,
                );
                self.fs_mut().scope.free_reg_to(first_reg + 1);
                expr = ExprDesc::Register(first_reg);
            } else {
                // Hold pure literals for folding; materialize everything
                // else before the right side emits code.
                let left = if expr.is_literal() {
                    Operand::Lit(expr)
                } else {
                    Operand::Rk(self.exp_to_rk(&expr, op_line))
                };
                let right = self.sub_expression(right_prec)?;
                expr = self.code_binary_op(binop, left, right, op_line)?;
            }
        }

        Ok(expr)
    }

    /// Parse a simple (non-binary-op) expression.
    fn simple_expression(&mut self) -> Result<ExprDesc, CompileError> {
        let token = self.current_token()?.clone();
        match token {
            Token::Number(n) => {
                self.advance()?;
                Ok(ExprDesc::Number(n))
            }
            Token::String(id) => {
                self.advance()?;
                Ok(ExprDesc::Str(id))
            }
            Token::Nil => {
                self.advance()?;
                Ok(ExprDesc::Nil)
            }
            Token::True => {
                self.advance()?;
                Ok(ExprDesc::True)
            }
            Token::False => {
                self.advance()?;
                Ok(ExprDesc::False)
            }
            Token::DotDotDot => {
                self.advance()?;
                if !self.fs().proto.is_vararg {
                    return Err(self.error("cannot use '...' outside a vararg function"));
                }
                let line = self.line();
                let reg = self.fs_mut().scope.alloc_reg();
                let pc = self.emit_abc(OpCode::VarArg, reg, 2, 0, line);
                Ok(ExprDesc::Vararg(pc))
            }
            Token::LBrace => self.table_constructor(),
            Token::Function => {
                self.advance()?;
                self.function_body(false)
            }
            _ => self.primary_expression(),
        }
    }

    /// Parse a primary expression (name or parenthesized) with suffixes.
    fn primary_expression(&mut self) -> Result<ExprDesc, CompileError> {
        let expr = match self.current_token()?.clone() {
            Token::Name(name) => {
                self.advance()?;
                self.resolve_name(name)?
            }
            Token::LParen => {
                self.advance()?;
                let e = self.expression()?;
                self.expect(&Token::RParen)?;
                // Parenthesized multi-value expressions collapse to one.
                match e {
                    ExprDesc::Call(_) | ExprDesc::Vararg(_) => {
                        let line = self.line();
                        let reg = self.discharge_to_any_reg(&e, line);
                        ExprDesc::Register(reg)
                    }
                    other => other,
                }
            }
            other => {
                return Err(self.error(format!("unexpected symbol near '{other}'")));
            }
        };

        self.finish_primary_expression(expr)
    }

    /// Parse suffix chain: .field, [key], :method(), call arguments.
    fn finish_primary_expression(&mut self, mut expr: ExprDesc) -> Result<ExprDesc, CompileError> {
        loop {
            match self.current_token()?.clone() {
                Token::Dot => {
                    self.advance()?;
                    let field_name = self.expect_name()?;
                    let line = self.line();
                    let table_reg = self.discharge_to_any_reg(&expr, line);
                    let key = self.string_rk(field_name, line);
                    expr = ExprDesc::Indexed {
                        table: table_reg,
                        key,
                    };
                }
                Token::LBracket => {
                    self.advance()?;
                    let line = self.line();
                    let table_reg = self.discharge_to_any_reg(&expr, line);
                    let key_expr = self.expression()?;
                    self.expect(&Token::RBracket)?;
                    let key = self.exp_to_rk(&key_expr, line);
                    expr = ExprDesc::Indexed {
                        table: table_reg,
                        key,
                    };
                }
                Token::Colon => {
                    self.advance()?;
                    let method_name = self.expect_name()?;
                    let line = self.line();
                    let table_reg = self.discharge_to_any_reg(&expr, line);
                    let key = self.string_rk(method_name, line);
                    // SELF puts the method at func_reg and the receiver
                    // at func_reg+1.
                    let func_reg = self.fs_mut().scope.alloc_reg();
                    let _self_slot = self.fs_mut().scope.alloc_reg();
                    self.emit_abc(OpCode::Self_, func_reg, table_reg as u16, key, line);
                    expr = self.call_arguments(func_reg, true, line)?;
                }
                Token::LParen | Token::LBrace | Token::String(_) => {
                    let line = self.line();
                    expr = self.function_call(expr, line)?;
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    /// RK operand for a string constant, spilling to a register when the
    /// pool index no longer fits 8 bits.
    fn string_rk(&mut self, id: StrId, line: u32) -> u16 {
        let k = self.fs_mut().add_constant(Constant::String(id));
        if k <= MAX_INDEX_RK {
            rk_constant(k)
        } else {
            let reg = self.fs_mut().scope.alloc_reg();
            self.emit_abx(OpCode::LoadK, reg, k, line);
            reg as u16
        }
    }

    /// True when `r` is the topmost temporary and safe to take over as a
    /// destination. A local's register never qualifies: writing call
    /// results or a short-circuit value there would clobber the variable.
    fn is_top_scratch(&self, r: u8) -> bool {
        r + 1 == self.fs().scope.free_reg
            && !self.fs().scope.locals.iter().any(|l| l.reg == r)
    }

    /// Parse a function call on an already-parsed callee expression.
    fn function_call(&mut self, func_expr: ExprDesc, line: u32) -> Result<ExprDesc, CompileError> {
        // Reuse the callee's register when it is the top scratch slot,
        // otherwise load it into a fresh one.
        let func_reg = match &func_expr {
            ExprDesc::Register(r) if self.is_top_scratch(*r) => *r,
            _ => {
                let reg = self.fs_mut().scope.alloc_reg();
                self.discharge_to_reg(&func_expr, reg, line);
                reg
            }
        };
        self.call_arguments(func_reg, false, line)
    }

    /// Parse call arguments and emit the CALL. With `has_self`, the
    /// receiver already occupies func_reg+1.
    fn call_arguments(
        &mut self,
        func_reg: u8,
        has_self: bool,
        line: u32,
    ) -> Result<ExprDesc, CompileError> {
        let arg_base = func_reg + 1 + has_self as u8;
        self.fs_mut().scope.free_reg_to(arg_base);
        let implicit = has_self as u16;

        let (nargs, multi) = match self.current_token()?.clone() {
            Token::LParen => {
                self.advance()?;
                if self.test_next(&Token::RParen)? {
                    (0u16, false)
                } else {
                    let (n, multi) = self.expression_list(arg_base)?;
                    self.expect(&Token::RParen)?;
                    (n as u16, multi)
                }
            }
            Token::LBrace => {
                let table = self.table_constructor()?;
                self.discharge_to_reg(&table, arg_base, line);
                (1u16, false)
            }
            Token::String(id) => {
                self.advance()?;
                self.discharge_to_reg(&ExprDesc::Str(id), arg_base, line);
                (1u16, false)
            }
            _ => {
                return Err(self.error("function arguments expected"));
            }
        };

        let b = if multi { 0 } else { nargs + implicit + 1 };
        let pc = self.emit_abc(OpCode::Call, func_reg, b, 0, line);
        self.fs_mut().scope.free_reg_to(func_reg + 1);
        Ok(ExprDesc::Call(pc))
    }

    /// Parse a comma-separated expression list into consecutive registers
    /// starting at base_reg. Returns (count, last_was_multi). When the
    /// last expression is an open call/vararg it is patched to multi
    /// return and not counted.
    fn expression_list(&mut self, base_reg: u8) -> Result<(u8, bool), CompileError> {
        let mut count = 0u8;
        loop {
            let expr = self.expression()?;
            let line = self.line();
            let slot = base_reg + count;

            if !self.check(&Token::Comma) {
                if self.set_multi_ret(&expr, slot) {
                    return Ok((count, true));
                }
                self.discharge_to_reg(&expr, slot, line);
                self.fs_mut().scope.set_reg_level(slot + 1);
                return Ok((count + 1, false));
            }

            self.discharge_to_reg(&expr, slot, line);
            self.fs_mut().scope.set_reg_level(slot + 1);
            count += 1;
            self.advance()?; // consume comma
        }
    }

    /// Like expression_list, but guarantees exactly `num_wanted` values in
    /// base_reg.., letting a trailing call/vararg fill the gap.
    fn expression_list_adjust(
        &mut self,
        base_reg: u8,
        num_wanted: u8,
    ) -> Result<u8, CompileError> {
        let mut count = 0u8;
        loop {
            let expr = self.expression()?;
            let line = self.line();
            let slot = base_reg + count;

            if !self.check(&Token::Comma) {
                let remaining = num_wanted.saturating_sub(count);
                if remaining > 1 {
                    match &expr {
                        ExprDesc::Call(pc) => {
                            let pc = *pc;
                            let a = self.fs().proto.code[pc].a();
                            self.fs_mut().proto.code[pc].set_c(remaining as u16 + 1);
                            if a != slot {
                                for i in 0..remaining {
                                    self.emit_abc(
                                        OpCode::Move,
                                        slot + i,
                                        (a + i) as u16,
                                        0,
                                        line,
                                    );
                                }
                            }
                            return Ok(num_wanted);
                        }
                        ExprDesc::Vararg(pc) => {
                            let pc = *pc;
                            let inst = &mut self.fs_mut().proto.code[pc];
                            inst.set_a(slot);
                            inst.set_b(remaining as u16 + 1);
                            return Ok(num_wanted);
                        }
                        _ => {}
                    }
                }
                self.discharge_to_reg(&expr, slot, line);
                self.fs_mut().scope.set_reg_level(slot + 1);
                return Ok(count + 1);
            }

            self.discharge_to_reg(&expr, slot, line);
            self.fs_mut().scope.set_reg_level(slot + 1);
            count += 1;
            self.advance()?;
        }
    }

    /// Patch an open call/vararg to deliver all its results at
    /// `expected_slot`. Returns false when the expression is not multi or
    /// its results land elsewhere.
    fn set_multi_ret(&mut self, expr: &ExprDesc, expected_slot: u8) -> bool {
        match expr {
            ExprDesc::Call(pc) => {
                if self.fs().proto.code[*pc].a() == expected_slot {
                    self.fs_mut().proto.code[*pc].set_c(0);
                    true
                } else {
                    false
                }
            }
            ExprDesc::Vararg(pc) => {
                let pc = *pc;
                let inst = &mut self.fs_mut().proto.code[pc];
                inst.set_a(expected_slot);
                inst.set_b(0);
                true
            }
            _ => false,
        }
    }

    /// Table constructor: { field, field, ... }
    fn table_constructor(&mut self) -> Result<ExprDesc, CompileError> {
        self.expect(&Token::LBrace)?;
        let line = self.line();
        let table_reg = self.fs_mut().scope.alloc_reg();
        let newtable_pc = self.emit_abc(OpCode::NewTable, table_reg, 0, 0, line);

        let mut array_count = 0u32; // pending, not yet flushed
        let mut total_array = 0u32;
        let mut hash_count = 0u32;
        let mut batch = 1u32;
        let mut last_multi: Option<ExprDesc> = None;

        while !self.check(&Token::RBrace) {
            last_multi = None;
            let pending_top = table_reg + 1 + array_count as u8;

            // None = a hash field was written; Some = an array element.
            let array_expr: Option<ExprDesc> = match self.current_token()?.clone() {
                Token::LBracket => {
                    self.advance()?;
                    let key = self.expression()?;
                    self.expect(&Token::RBracket)?;
                    self.expect(&Token::Assign)?;
                    let kline = self.line();
                    let key_rk = self.exp_to_rk(&key, kline);
                    let val = self.expression()?;
                    let val_rk = self.exp_to_rk(&val, kline);
                    self.emit_abc(OpCode::SetTable, table_reg, key_rk, val_rk, kline);
                    None
                }
                Token::Name(name) => {
                    self.advance()?;
                    if self.test_next(&Token::Assign)? {
                        // name = expr (hash field)
                        let kline = self.line();
                        let key_rk = self.string_rk(name, kline);
                        let val = self.expression()?;
                        let val_rk = self.exp_to_rk(&val, kline);
                        self.emit_abc(OpCode::SetTable, table_reg, key_rk, val_rk, kline);
                        None
                    } else {
                        // An array element that happens to start with a name.
                        let e = self.resolve_name(name)?;
                        let e = self.finish_primary_expression(e)?;
                        Some(self.binop_loop(e, 0)?)
                    }
                }
                _ => Some(self.expression()?),
            };

            match array_expr {
                None => {
                    self.fs_mut().scope.free_reg_to(pending_top);
                    hash_count += 1;
                }
                Some(expr) => {
                    let eline = self.line();
                    if expr.is_multi() {
                        last_multi = Some(expr.clone());
                    }
                    self.discharge_to_reg(&expr, pending_top, eline);
                    self.fs_mut().scope.set_reg_level(pending_top + 1);
                    array_count += 1;
                    total_array += 1;

                    if array_count as usize >= FIELDS_PER_FLUSH {
                        last_multi = None;
                        self.emit_setlist(table_reg, array_count as u16, batch, eline);
                        batch += 1;
                        array_count = 0;
                        self.fs_mut().scope.free_reg_to(table_reg + 1);
                    }
                }
            }

            if !self.test_next(&Token::Comma)? && !self.test_next(&Token::Semi)? {
                break;
            }
        }

        self.expect(&Token::RBrace)?;

        if array_count > 0 {
            let eline = self.line();
            let expected = table_reg + array_count as u8; // last element's slot
            let is_open_multi = last_multi
                .as_ref()
                .map(|e| {
                    // The single-result discharge is the last code emitted;
                    // drop it and reopen the call/vararg for multi return.
                    match e {
                        ExprDesc::Call(pc) => {
                            let a = self.fs().proto.code[*pc].a();
                            if a == expected {
                                self.truncate_after(*pc);
                                self.fs_mut().proto.code[*pc].set_c(0);
                                true
                            } else {
                                false
                            }
                        }
                        ExprDesc::Vararg(pc) => {
                            self.truncate_after(*pc);
                            let inst = &mut self.fs_mut().proto.code[*pc];
                            inst.set_a(expected);
                            inst.set_b(0);
                            true
                        }
                        _ => false,
                    }
                })
                .unwrap_or(false);

            if is_open_multi {
                self.emit_setlist(table_reg, 0, batch, eline);
            } else {
                self.emit_setlist(table_reg, array_count as u16, batch, eline);
            }
        }

        // Patch NEWTABLE size hints.
        let b = total_array.min(MAX_C) as u16;
        let c = hash_count.min(MAX_C) as u16;
        self.fs_mut().proto.code[newtable_pc] = Instruction::abc(OpCode::NewTable, table_reg, b, c);

        self.fs_mut().scope.free_reg_to(table_reg + 1);
        Ok(ExprDesc::Register(table_reg))
    }

    /// SETLIST with the extended-batch escape: batch numbers past the C
    /// field go into the following raw instruction word.
    fn emit_setlist(&mut self, table_reg: u8, b: u16, batch: u32, line: u32) {
        if batch <= MAX_C {
            self.emit_abc(OpCode::SetList, table_reg, b, batch as u16, line);
        } else {
            self.emit_abc(OpCode::SetList, table_reg, b, 0, line);
            self.emit(Instruction::raw(batch), line);
        }
    }

    /// Drop instructions emitted after pc (single-result moves being
    /// reopened for multi return).
    fn truncate_after(&mut self, pc: usize) {
        let proto = &mut self.fs_mut().proto;
        proto.code.truncate(pc + 1);
        proto.lines.truncate(pc + 1);
    }

    // ---- Unary/Binary operations ----

    fn check_unary_op(&self) -> Result<Option<UnOp>, CompileError> {
        Ok(match self.current_token()? {
            Token::Minus => Some(UnOp::Neg),
            Token::Not => Some(UnOp::Not),
            Token::Hash => Some(UnOp::Len),
            _ => None,
        })
    }

    fn check_binary_op(&self) -> Result<Option<BinOp>, CompileError> {
        Ok(match self.current_token()? {
            Token::Plus => Some(BinOp::Add),
            Token::Minus => Some(BinOp::Sub),
            Token::Star => Some(BinOp::Mul),
            Token::Slash => Some(BinOp::Div),
            Token::Percent => Some(BinOp::Mod),
            Token::Caret => Some(BinOp::Pow),
            Token::DotDot => Some(BinOp::Concat),
            Token::Equal => Some(BinOp::Eq),
            Token::NotEqual => Some(BinOp::NotEq),
            Token::Less => Some(BinOp::Lt),
            Token::LessEq => Some(BinOp::LtEq),
            Token::Greater => Some(BinOp::Gt),
            Token::GreaterEq => Some(BinOp::GtEq),
            Token::And => Some(BinOp::And),
            Token::Or => Some(BinOp::Or),
            _ => None,
        })
    }

    fn code_unary_op(
        &mut self,
        op: UnOp,
        expr: ExprDesc,
        line: u32,
    ) -> Result<ExprDesc, CompileError> {
        // Constant folding
        match (op, &expr) {
            (UnOp::Neg, ExprDesc::Number(n)) => return Ok(ExprDesc::Number(-n)),
            (UnOp::Not, ExprDesc::Nil | ExprDesc::False) => return Ok(ExprDesc::True),
            (
                UnOp::Not,
                ExprDesc::True | ExprDesc::Number(_) | ExprDesc::Str(_),
            ) => return Ok(ExprDesc::False),
            _ => {}
        }

        let reg = self.discharge_to_any_reg(&expr, line);
        let dest = self.fs_mut().scope.alloc_reg();
        let opcode = match op {
            UnOp::Neg => OpCode::Unm,
            UnOp::Not => OpCode::Not,
            UnOp::Len => OpCode::Len,
        };
        self.emit_abc(opcode, dest, reg as u16, 0, line);
        self.fs_mut().scope.free_reg_to(dest + 1);
        Ok(ExprDesc::Register(dest))
    }

    fn code_binary_op(
        &mut self,
        op: BinOp,
        left: Operand,
        right: ExprDesc,
        line: u32,
    ) -> Result<ExprDesc, CompileError> {
        if op.is_comparison() {
            return self.code_comparison(op, left, right, line);
        }
        debug_assert!(op.is_arith());

        // Fold number op number at compile time.
        if let (Operand::Lit(ExprDesc::Number(a)), ExprDesc::Number(b)) = (&left, &right) {
            let (a, b) = (*a, *b);
            let folded = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Mod => a - (a / b).floor() * b,
                BinOp::Pow => a.powf(b),
                _ => unreachable!(),
            };
            return Ok(ExprDesc::Number(folded));
        }

        let rkb = match left {
            Operand::Rk(rk) => rk,
            Operand::Lit(e) => self.exp_to_rk(&e, line),
        };
        let rkc = self.exp_to_rk(&right, line);

        let opcode = match op {
            BinOp::Add => OpCode::Add,
            BinOp::Sub => OpCode::Sub,
            BinOp::Mul => OpCode::Mul,
            BinOp::Div => OpCode::Div,
            BinOp::Mod => OpCode::Mod,
            BinOp::Pow => OpCode::Pow,
            _ => unreachable!(),
        };

        let dest = self.fs_mut().scope.alloc_reg();
        self.emit_abc(opcode, dest, rkb, rkc, line);
        self.fs_mut().scope.free_reg_to(dest + 1);
        Ok(ExprDesc::Register(dest))
    }

    /// Emit a comparison plus its false-branch JMP. The JMP is taken when
    /// the condition does not hold (Jump expressions materialize through
    /// a LOADBOOL skip pair).
    fn code_comparison(
        &mut self,
        op: BinOp,
        left: Operand,
        right: ExprDesc,
        line: u32,
    ) -> Result<ExprDesc, CompileError> {
        let rkb = match left {
            Operand::Rk(rk) => rk,
            Operand::Lit(e) => self.exp_to_rk(&e, line),
        };
        let rkc = self.exp_to_rk(&right, line);

        // Skip-next fires when result == (A == 0): with A=0 a true result
        // skips the JMP, so the JMP is the false branch. NotEq inverts
        // through A=1; Gt/GtEq swap operands.
        let (opcode, a, b, c) = match op {
            BinOp::Eq => (OpCode::Eq, 0, rkb, rkc),
            BinOp::NotEq => (OpCode::Eq, 1, rkb, rkc),
            BinOp::Lt => (OpCode::Lt, 0, rkb, rkc),
            BinOp::Gt => (OpCode::Lt, 0, rkc, rkb),
            BinOp::LtEq => (OpCode::Le, 0, rkb, rkc),
            BinOp::GtEq => (OpCode::Le, 0, rkc, rkb),
            _ => unreachable!(),
        };

        self.emit_abc(opcode, a, b, c, line);
        let pc = self.emit_jump(line);
        Ok(ExprDesc::Jump(pc))
    }

    fn code_short_circuit(
        &mut self,
        op: BinOp,
        left: ExprDesc,
        right_prec: u8,
        line: u32,
    ) -> Result<ExprDesc, CompileError> {
        // The result register must be a scratch slot: evaluating the right
        // side into a local's register would clobber it.
        let dest = match &left {
            ExprDesc::Register(r) if self.is_top_scratch(*r) => *r,
            _ => {
                let d = self.fs_mut().scope.alloc_reg();
                self.discharge_to_reg(&left, d, line);
                d
            }
        };

        // and: a falsy left short-circuits (assign + fall into JMP);
        // or: a truthy left does.
        let c = if op == BinOp::And { 0 } else { 1 };
        self.emit_abc(OpCode::TestSet, dest, dest as u16, c, line);
        let jump = self.emit_jump(line);

        let right = self.sub_expression(right_prec)?;
        let right_line = self.line();
        self.discharge_to_reg(&right, dest, right_line);
        if self.fs().scope.free_reg > dest + 1 {
            self.fs_mut().scope.free_reg_to(dest + 1);
        }

        self.patch_jump(jump);
        Ok(ExprDesc::Register(dest))
    }

    /// Resolve a name: local -> upvalue -> global.
    fn resolve_name(&mut self, name: StrId) -> Result<ExprDesc, CompileError> {
        if let Some(local) = self.fs().scope.resolve_local(name) {
            return Ok(ExprDesc::Register(local.reg));
        }

        if let Some(idx) = self.resolve_upvalue(self.func_stack.len() - 1, name) {
            return Ok(ExprDesc::Upvalue(idx));
        }

        let name_k = self.fs_mut().add_constant(Constant::String(name));
        Ok(ExprDesc::Global { name_k })
    }

    /// Resolve an upvalue by walking up the function state stack, marking
    /// captured parent locals so their scopes emit CLOSE.
    fn resolve_upvalue(&mut self, fs_idx: usize, name: StrId) -> Option<u8> {
        if fs_idx == 0 {
            // Outermost function: free names are globals.
            return None;
        }

        let parent_idx = fs_idx - 1;
        if let Some(local) = self.func_stack[parent_idx].scope.resolve_local(name) {
            let reg = local.reg;
            self.func_stack[parent_idx].scope.mark_captured(reg);
            return Some(self.add_upvalue(fs_idx, name, true, reg));
        }

        if let Some(parent_upval) = self.resolve_upvalue(parent_idx, name) {
            return Some(self.add_upvalue(fs_idx, name, false, parent_upval));
        }

        None
    }

    fn add_upvalue(&mut self, fs_idx: usize, name: StrId, in_stack: bool, index: u8) -> u8 {
        let fs = &mut self.func_stack[fs_idx];
        for (i, up) in fs.upvalues.iter().enumerate() {
            if up.in_stack == in_stack && up.index == index {
                return i as u8;
            }
        }
        let idx = fs.upvalues.len() as u8;
        fs.upvalues.push(UpvalInfo {
            name,
            in_stack,
            index,
        });
        idx
    }

    /// Compile a function body (after 'function') and emit the CLOSURE
    /// with its capture pseudo-instructions.
    pub(crate) fn function_body(&mut self, is_method: bool) -> Result<ExprDesc, CompileError> {
        let line = self.line();

        let mut new_fs = FuncState::new();
        new_fs.proto.source = self.fs().proto.source;
        new_fs.scope.enter_block(false);

        if is_method {
            let self_name = self.lexer.strings.intern(b"self");
            new_fs.scope.add_local(self_name);
            new_fs.proto.num_params = 1;
        }

        self.func_stack.push(new_fs);

        self.expect(&Token::LParen)?;
        if !self.check(&Token::RParen) {
            self.parse_param_list()?;
        }
        self.expect(&Token::RParen)?;

        self.block()?;
        self.expect(&Token::End)?;

        // Implicit return (no values)
        let ret_line = self.line();
        self.emit_abc(OpCode::Return, 0, 1, 0, ret_line);

        let mut child = self.func_stack.pop().unwrap();
        child.scope.leave_block();
        child.proto.max_stack_size = child.scope.max_reg.saturating_add(2);
        child.proto.num_upvalues = child.upvalues.len() as u8;
        let upvalues = child.upvalues;

        let proto_idx = self.fs().proto.protos.len();
        self.fs_mut().proto.protos.push(child.proto);

        let dest = self.fs_mut().scope.alloc_reg();
        self.emit_abx(OpCode::Closure, dest, proto_idx as u32, line);
        // Capture pseudo-instructions, one per upvalue: MOVE grabs an
        // enclosing stack slot, GETUPVAL re-shares the parent's upvalue.
        for up in &upvalues {
            let inst = if up.in_stack {
                Instruction::abc(OpCode::Move, 0, up.index as u16, 0)
            } else {
                Instruction::abc(OpCode::GetUpval, 0, up.index as u16, 0)
            };
            self.fs_mut().emit(inst, line);
        }
        Ok(ExprDesc::Register(dest))
    }

    fn parse_param_list(&mut self) -> Result<(), CompileError> {
        loop {
            match self.current_token()?.clone() {
                Token::Name(name) => {
                    self.advance()?;
                    self.fs_mut().scope.add_local(name);
                    self.fs_mut().proto.num_params += 1;
                }
                Token::DotDotDot => {
                    self.advance()?;
                    self.fs_mut().proto.is_vararg = true;
                    break;
                }
                _ => break,
            }
            if !self.test_next(&Token::Comma)? {
                break;
            }
        }
        Ok(())
    }

    // ---- Blocks and statements ----

    /// Parse a block of statements until a block-ending token.
    pub(crate) fn block(&mut self) -> Result<(), CompileError> {
        loop {
            match self.current_token()? {
                Token::End | Token::Else | Token::ElseIf | Token::Until | Token::Eof => break,
                Token::Return => {
                    // 'return' must be the last statement of a block.
                    self.stat_return()?;
                    break;
                }
                _ => {
                    self.statement()?;
                }
            }
        }
        Ok(())
    }

    fn statement(&mut self) -> Result<(), CompileError> {
        match self.current_token()?.clone() {
            Token::Semi => {
                self.advance()?;
                Ok(())
            }
            Token::Local => self.stat_local(),
            Token::If => self.stat_if(),
            Token::While => self.stat_while(),
            Token::Do => self.stat_do(),
            Token::For => self.stat_for(),
            Token::Repeat => self.stat_repeat(),
            Token::Function => self.stat_function(),
            Token::Break => self.stat_break(),
            _ => self.stat_expr_or_assign(),
        }
    }

    /// `local name {, name} ['=' explist]` / `local function name body`
    fn stat_local(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'local'
        let line = self.line();

        if self.test_next(&Token::Function)? {
            // The local is in scope inside its own body (recursion).
            let name = self.expect_name()?;
            let reg = self.fs_mut().scope.add_local(name);
            let func_expr = self.function_body(false)?;
            self.discharge_to_reg(&func_expr, reg, line);
            self.fs_mut().scope.free_reg_to(reg + 1);
            return Ok(());
        }

        let mut names = Vec::new();
        loop {
            names.push(self.expect_name()?);
            if !self.test_next(&Token::Comma)? {
                break;
            }
        }
        let num_vars = names.len() as u8;

        let base_reg = self.fs().scope.free_reg;
        if self.test_next(&Token::Assign)? {
            let num_exprs = self.expression_list_adjust(base_reg, num_vars)?;
            if num_exprs < num_vars {
                for i in num_exprs..num_vars {
                    self.discharge_to_reg(&ExprDesc::Nil, base_reg + i, line);
                }
            }
        } else {
            self.emit_abc(
                OpCode::LoadNil,
                base_reg,
                (base_reg + num_vars - 1) as u16,
                0,
                line,
            );
        }

        // Pin the locals onto the registers the values landed in.
        self.fs_mut().scope.free_reg_to(base_reg);
        for name in names {
            self.fs_mut().scope.add_local(name);
        }
        Ok(())
    }

    /// `if exp then block {elseif exp then block} [else block] end`
    fn stat_if(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'if'
        let mut escape_jumps = Vec::new();

        let cond = self.expression()?;
        self.expect(&Token::Then)?;
        let line = self.line();
        let mut false_jump = self.code_test_jump(&cond, line)?;

        self.scoped_block()?;

        while self.check(&Token::ElseIf) {
            escape_jumps.push(self.emit_jump(self.line()));
            if let Some(fj) = false_jump {
                self.patch_jump(fj);
            }

            self.advance()?; // 'elseif'
            let cond = self.expression()?;
            self.expect(&Token::Then)?;
            let cond_line = self.line();
            false_jump = self.code_test_jump(&cond, cond_line)?;

            self.scoped_block()?;
        }

        if self.test_next(&Token::Else)? {
            escape_jumps.push(self.emit_jump(self.line()));
            if let Some(fj) = false_jump {
                self.patch_jump(fj);
            }
            self.scoped_block()?;
        } else if let Some(fj) = false_jump {
            self.patch_jump(fj);
        }

        self.expect(&Token::End)?;

        for esc in escape_jumps {
            self.patch_jump(esc);
        }
        Ok(())
    }

    /// A block in its own scope, closing captured locals on exit.
    fn scoped_block(&mut self) -> Result<(), CompileError> {
        self.fs_mut().scope.enter_block(false);
        self.block()?;
        let close_line = self.line();
        let (block, captured) = self.fs_mut().scope.leave_block();
        if captured {
            self.emit_abc(
                OpCode::Close,
                block.first_free_reg_on_entry,
                0,
                0,
                close_line,
            );
        }
        Ok(())
    }

    /// `while exp do block end`
    fn stat_while(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'while'
        let loop_start = self.fs().current_pc();
        let cond = self.expression()?;
        self.expect(&Token::Do)?;
        let line = self.line();
        let exit_jump = self.code_test_jump(&cond, line)?;

        self.fs_mut().scope.enter_block(true);
        self.block()?;
        let end_line = self.line();
        let (block, captured) = self.fs_mut().scope.leave_block();
        let close_reg = block.first_free_reg_on_entry;
        if captured {
            // Per-iteration close before looping back.
            self.emit_abc(OpCode::Close, close_reg, 0, 0, end_line);
        }

        let back_jump = self.emit_jump(end_line);
        self.patch_jump_to(back_jump, loop_start);

        self.expect(&Token::End)?;

        if let Some(ej) = exit_jump {
            self.patch_jump(ej);
        }
        self.finish_loop(block.break_jumps, captured, close_reg, end_line);
        Ok(())
    }

    /// Break targets land here; a trailing CLOSE covers captured locals
    /// on the way out (a duplicate close is a no-op at runtime).
    fn finish_loop(&mut self, break_jumps: Vec<usize>, captured: bool, close_reg: u8, line: u32) {
        let target = self.fs().current_pc();
        if captured {
            self.emit_abc(OpCode::Close, close_reg, 0, 0, line);
        }
        for brk in break_jumps {
            self.patch_jump_to(brk, target);
        }
    }

    /// `do block end`
    fn stat_do(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'do'
        self.scoped_block()?;
        self.expect(&Token::End)?;
        Ok(())
    }

    /// `for name '=' exp ',' exp [',' exp] do block end`  (numeric)
    /// `for namelist in explist do block end`  (generic)
    fn stat_for(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'for'
        let name = self.expect_name()?;

        if self.check(&Token::Assign) {
            self.stat_for_numeric(name)
        } else if self.check(&Token::Comma) || self.check(&Token::In) {
            self.stat_for_generic(name)
        } else {
            Err(self.error("'=' or 'in' expected"))
        }
    }

    fn stat_for_numeric(&mut self, var_name: StrId) -> Result<(), CompileError> {
        self.advance()?; // '='
        let line = self.line();

        // Three control registers: index, limit, step; the visible loop
        // variable lives just above them.
        let base = self.fs().scope.free_reg;
        self.fs_mut().scope.alloc_regs(3);

        let init = self.expression()?;
        self.discharge_to_reg(&init, base, line);
        self.fs_mut().scope.set_reg_level(base + 3);

        self.expect(&Token::Comma)?;
        let limit = self.expression()?;
        self.discharge_to_reg(&limit, base + 1, line);
        self.fs_mut().scope.set_reg_level(base + 3);

        if self.test_next(&Token::Comma)? {
            let step = self.expression()?;
            self.discharge_to_reg(&step, base + 2, line);
        } else {
            self.discharge_to_reg(&ExprDesc::Number(1.0), base + 2, line);
        }
        self.fs_mut().scope.set_reg_level(base + 3);

        self.expect(&Token::Do)?;

        let prep_pc = self.emit(Instruction::asbx(OpCode::ForPrep, base, 0), line);

        self.fs_mut().scope.enter_block(true);
        self.fs_mut().scope.add_local(var_name); // lands at base+3

        self.block()?;
        let end_line = self.line();
        let (block, captured) = self.fs_mut().scope.leave_block();
        if captured {
            self.emit_abc(OpCode::Close, base + 3, 0, 0, end_line);
        }

        let loop_pc = self.emit(Instruction::asbx(OpCode::ForLoop, base, 0), end_line);
        let prep_offset = loop_pc as i32 - prep_pc as i32 - 1;
        self.fs_mut().proto.code[prep_pc] = Instruction::asbx(OpCode::ForPrep, base, prep_offset);
        let back_offset = (prep_pc + 1) as i32 - loop_pc as i32 - 1;
        self.fs_mut().proto.code[loop_pc] = Instruction::asbx(OpCode::ForLoop, base, back_offset);

        self.expect(&Token::End)?;

        self.finish_loop(block.break_jumps, captured, base + 3, end_line);
        self.fs_mut().scope.free_reg_to(base);
        Ok(())
    }

    fn stat_for_generic(&mut self, first_name: StrId) -> Result<(), CompileError> {
        let line = self.line();
        let base = self.fs().scope.free_reg;

        let mut names = vec![first_name];
        while self.test_next(&Token::Comma)? {
            names.push(self.expect_name()?);
        }
        self.expect(&Token::In)?;

        // Three hidden slots: iterator, state, control.
        self.fs_mut().scope.alloc_regs(3);
        let num_exprs = self.expression_list_adjust(base, 3)?;
        if num_exprs < 3 {
            for i in num_exprs..3 {
                self.discharge_to_reg(&ExprDesc::Nil, base + i, line);
            }
        }
        self.fs_mut().scope.set_reg_level(base + 3);

        self.expect(&Token::Do)?;

        // Jump straight to the iterator call at the bottom.
        let prep_jmp = self.emit_jump(line);

        self.fs_mut().scope.enter_block(true);
        for name in &names {
            self.fs_mut().scope.add_local(*name);
        }
        let body_start = self.fs().current_pc();

        self.block()?;
        let end_line = self.line();
        let (block, captured) = self.fs_mut().scope.leave_block();
        if captured {
            self.emit_abc(OpCode::Close, base + 3, 0, 0, end_line);
        }

        let tfor_pc = self.fs().current_pc();
        self.emit_abc(
            OpCode::TForLoop,
            base,
            0,
            names.len() as u16,
            end_line,
        );
        let back_jmp = self.emit_jump(end_line);
        self.patch_jump_to(back_jmp, body_start);
        self.patch_jump_to(prep_jmp, tfor_pc);

        self.expect(&Token::End)?;

        self.finish_loop(block.break_jumps, captured, base + 3, end_line);
        self.fs_mut().scope.free_reg_to(base);
        Ok(())
    }

    /// `repeat block until exp` — the condition sees the body's locals.
    fn stat_repeat(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'repeat'
        let loop_start = self.fs().current_pc();

        self.fs_mut().scope.enter_block(true);
        self.block()?;
        self.expect(&Token::Until)?;

        let cond = self.expression()?;
        let line = self.line();
        let back_jump = self.code_test_jump(&cond, line)?;

        let (block, captured) = self.fs_mut().scope.leave_block();
        let close_reg = block.first_free_reg_on_entry;

        if captured {
            if let Some(bj) = back_jump {
                // Route the looping path through a CLOSE trampoline so
                // each iteration gets fresh upvalue cells.
                let exit_jmp = self.emit_jump(line);
                let trampoline = self.fs().current_pc();
                self.emit_abc(OpCode::Close, close_reg, 0, 0, line);
                let again = self.emit_jump(line);
                self.patch_jump_to(again, loop_start);
                self.patch_jump_to(bj, trampoline);
                self.patch_jump(exit_jmp);
            }
        } else if let Some(bj) = back_jump {
            self.patch_jump_to(bj, loop_start);
        }

        self.finish_loop(block.break_jumps, captured, close_reg, line);
        Ok(())
    }

    /// `function funcname funcbody`
    fn stat_function(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'function'
        let line = self.line();
        let base = self.fs().scope.free_reg;

        let first_name = self.expect_name()?;
        let mut expr = self.resolve_name(first_name)?;
        let mut is_method = false;

        loop {
            if self.test_next(&Token::Dot)? {
                let field = self.expect_name()?;
                let table_reg = self.discharge_to_any_reg(&expr, line);
                let key = self.string_rk(field, line);
                expr = ExprDesc::Indexed {
                    table: table_reg,
                    key,
                };
            } else if self.test_next(&Token::Colon)? {
                let method = self.expect_name()?;
                let table_reg = self.discharge_to_any_reg(&expr, line);
                let key = self.string_rk(method, line);
                expr = ExprDesc::Indexed {
                    table: table_reg,
                    key,
                };
                is_method = true;
                break;
            } else {
                break;
            }
        }

        let func = self.function_body(is_method)?;
        self.code_store(&expr, &func, line)?;
        self.fs_mut().scope.free_reg_to(base);
        Ok(())
    }

    /// `return [explist] [';']`
    fn stat_return(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'return'
        let line = self.line();

        let is_end = matches!(
            self.current_token()?,
            Token::End | Token::Else | Token::ElseIf | Token::Until | Token::Eof | Token::Semi
        );
        if is_end {
            self.test_next(&Token::Semi)?;
            self.emit_abc(OpCode::Return, 0, 1, 0, line);
            return Ok(());
        }

        let base = self.fs().scope.free_reg;
        let first_expr = self.expression()?;

        if !self.check(&Token::Comma) {
            self.test_next(&Token::Semi)?;
            match &first_expr {
                ExprDesc::Call(pc) => {
                    // Tail call for `return f(...)`.
                    let pc = *pc;
                    let inst = self.fs().proto.code[pc];
                    let a = inst.a();
                    let b = inst.b();
                    self.fs_mut().proto.code[pc] = Instruction::abc(OpCode::TailCall, a, b, 0);
                    self.emit_abc(OpCode::Return, a, 0, 0, line);
                }
                ExprDesc::Vararg(pc) => {
                    let pc = *pc;
                    let inst = &mut self.fs_mut().proto.code[pc];
                    inst.set_a(base);
                    inst.set_b(0);
                    self.emit_abc(OpCode::Return, base, 0, 0, line);
                }
                _ => {
                    self.discharge_to_reg(&first_expr, base, line);
                    self.emit_abc(OpCode::Return, base, 2, 0, line);
                }
            }
            return Ok(());
        }

        // Multiple return values.
        self.discharge_to_reg(&first_expr, base, line);
        self.fs_mut().scope.set_reg_level(base + 1);
        let mut count = 1u8;
        let mut open_multi = false;
        while self.test_next(&Token::Comma)? {
            let e = self.expression()?;
            let slot = base + count;
            if !self.check(&Token::Comma) && self.set_multi_ret(&e, slot) {
                open_multi = true;
                break;
            }
            self.discharge_to_reg(&e, slot, line);
            count += 1;
            self.fs_mut().scope.set_reg_level(base + count);
        }
        self.test_next(&Token::Semi)?;
        let b = if open_multi { 0 } else { count as u16 + 1 };
        self.emit_abc(OpCode::Return, base, b, 0, line);
        Ok(())
    }

    /// `break`
    fn stat_break(&mut self) -> Result<(), CompileError> {
        self.advance()?; // 'break'
        let line = self.line();

        // Close any captured locals of the loop body before jumping out.
        if let Some(close_reg) = self.fs().scope.loop_needs_close() {
            self.emit_abc(OpCode::Close, close_reg, 0, 0, line);
        }
        let jump = self.emit_jump(line);

        match self.fs_mut().scope.find_loop_block() {
            Some(block) => {
                block.break_jumps.push(jump);
                Ok(())
            }
            None => Err(self.error("no loop to break")),
        }
    }

    /// Expression statement or assignment.
    fn stat_expr_or_assign(&mut self) -> Result<(), CompileError> {
        let base = self.fs().scope.free_reg;
        let expr = self.primary_expression()?;
        let line = self.line();

        if self.check(&Token::Assign) || self.check(&Token::Comma) {
            let mut targets = vec![expr];
            while self.test_next(&Token::Comma)? {
                targets.push(self.primary_expression()?);
            }
            self.expect(&Token::Assign)?;

            let value_base = self.fs().scope.free_reg;
            let num_rhs = self.expression_list_adjust(value_base, targets.len() as u8)?;
            for i in num_rhs..targets.len() as u8 {
                self.discharge_to_reg(&ExprDesc::Nil, value_base + i, line);
            }
            self.fs_mut()
                .scope
                .set_reg_level(value_base + targets.len() as u8);

            for (i, target) in targets.iter().enumerate() {
                let val = ExprDesc::Register(value_base + i as u8);
                self.code_store(target, &val, line)?;
            }

            self.fs_mut().scope.free_reg_to(base);
        } else {
            match expr {
                ExprDesc::Call(pc) => {
                    // Statement call: discard all results.
                    self.fs_mut().proto.code[pc].set_c(1);
                    self.fs_mut().scope.free_reg_to(base);
                }
                _ => {
                    return Err(self.error("syntax error near unexpected expression"));
                }
            }
        }
        Ok(())
    }

    // ---- Helper methods ----

    /// Emit a conditional jump taken when `cond` is falsy. Returns None
    /// when the condition is a truthy constant (never jumps).
    fn code_test_jump(&mut self, cond: &ExprDesc, line: u32) -> Result<Option<usize>, CompileError> {
        match cond {
            // A comparison already emitted its false-branch JMP.
            ExprDesc::Jump(pc) => Ok(Some(*pc)),
            ExprDesc::True | ExprDesc::Number(_) | ExprDesc::Str(_) => Ok(None),
            ExprDesc::False | ExprDesc::Nil => {
                let jump = self.emit_jump(line);
                Ok(Some(jump))
            }
            _ => {
                let reg = self.discharge_to_any_reg(cond, line);
                // TEST skips the JMP when the register is truthy.
                self.emit_abc(OpCode::Test, reg, 0, 0, line);
                let jump = self.emit_jump(line);
                Ok(Some(jump))
            }
        }
    }

    /// Store a value expression into a target expression (assignment).
    fn code_store(
        &mut self,
        target: &ExprDesc,
        value: &ExprDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        match target {
            ExprDesc::Register(reg) => {
                self.discharge_to_reg(value, *reg, line);
            }
            ExprDesc::Upvalue(idx) => {
                let idx = *idx;
                let val_reg = self.discharge_to_any_reg(value, line);
                self.emit_abc(OpCode::SetUpval, val_reg, idx as u16, 0, line);
            }
            ExprDesc::Global { name_k } => {
                let name_k = *name_k;
                let val_reg = self.discharge_to_any_reg(value, line);
                self.emit_abx(OpCode::SetGlobal, val_reg, name_k, line);
            }
            ExprDesc::Indexed { table, key } => {
                let (table, key) = (*table, *key);
                let val_rk = self.exp_to_rk(value, line);
                self.emit_abc(OpCode::SetTable, table, key, val_rk, line);
            }
            _ => {
                return Err(self.error("cannot assign to this expression"));
            }
        }
        Ok(())
    }
}

/// Compile Lua source to a Proto with a fresh string pool.
pub fn compile(source: &[u8], name: &str) -> Result<(Proto, StringPool), CompileError> {
    let mut pool = StringPool::new();
    let proto = compile_into(source, name, &mut pool)?;
    Ok((proto, pool))
}

/// Compile Lua source against an existing string pool (so constants are
/// interned into the state's pool once, at load time).
pub fn compile_into(
    source: &[u8],
    name: &str,
    pool: &mut StringPool,
) -> Result<Proto, CompileError> {
    let mut compiler = Compiler {
        lexer: Lexer::new(source, pool),
        func_stack: Vec::new(),
    };

    let mut top = FuncState::new();
    let source_name = compiler.lexer.strings.intern(name.as_bytes());
    top.proto.source = Some(source_name);
    top.proto.is_vararg = true;
    top.scope.enter_block(false);
    compiler.func_stack.push(top);

    compiler.block()?;
    compiler.expect(&Token::Eof)?;

    let line = compiler.line();
    compiler.emit_abc(OpCode::Return, 0, 1, 0, line);

    let mut fs = compiler.func_stack.pop().unwrap();
    fs.scope.leave_block();
    fs.proto.max_stack_size = fs.scope.max_reg.saturating_add(2);
    fs.proto.num_upvalues = 0;

    Ok(fs.proto)
}
