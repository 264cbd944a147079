use std::collections::HashSet;
use std::fmt;

use crate::ast::*;
use crate::bytecode::{Chunk, CompiledFunction, Constant, OpCode, Program};
use crate::scopes::{ScopeError, ScopeManager, UpvalueDesc};

#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub line: Option<usize>,
}

impl CompileError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }

    fn at(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            line: Some(line),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} at line {}", self.message, line),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for CompileError {}

/// Lowers a parsed program into bytecode. The program body compiles into a
/// synthetic arity-0 function named `$main`.
pub fn compile(statements: &[Stmt]) -> Result<Program, CompileError> {
    let mut compiler = Compiler::new();
    compiler.begin_function("$main", 0, false);
    for stmt in statements {
        compiler.gen_stmt(stmt)?;
    }
    let (main, _) = compiler.end_function(false)?;
    Ok(Program {
        functions: compiler.functions,
        main,
    })
}

#[derive(Debug, Clone, Copy)]
enum Resolved {
    Local(u8),
    Upvalue(u8),
    Global,
}

struct FunctionState {
    name: String,
    arity: u8,
    chunk: Chunk,
    scopes: ScopeManager,
}

struct Compiler {
    states: Vec<FunctionState>,
    functions: Vec<CompiledFunction>,
    /// Names that have been the target of a `DEFINE_GLOBAL` so far; used to
    /// classify `a <- b` select clauses.
    known_globals: HashSet<String>,
}

impl Compiler {
    fn new() -> Self {
        Self {
            states: Vec::new(),
            functions: Vec::new(),
            known_globals: HashSet::new(),
        }
    }

    // ---- function stack ------------------------------------------------

    fn begin_function(&mut self, name: &str, arity: u8, is_method: bool) {
        self.states.push(FunctionState {
            name: name.to_string(),
            arity,
            chunk: Chunk::new(),
            scopes: ScopeManager::new(is_method),
        });
    }

    /// Appends the implicit return, finishes the current function, and
    /// registers it in the program's function table. Returns the function
    /// index and its captured-upvalue descriptors for closure emission.
    fn end_function(&mut self, is_init: bool) -> Result<(u16, Vec<UpvalueDesc>), CompileError> {
        self.emit_return(is_init);
        let state = self.states.pop().expect("function stack underflow");
        let upvalues = state.scopes.upvalues.clone();
        if self.functions.len() >= u16::MAX as usize {
            return Err(CompileError::new("Too many functions in program"));
        }
        let index = self.functions.len() as u16;
        self.functions.push(CompiledFunction {
            name: state.name,
            arity: state.arity,
            upvalue_count: upvalues.len() as u8,
            chunk: state.chunk,
        });
        Ok((index, upvalues))
    }

    fn state(&mut self) -> &mut FunctionState {
        self.states.last_mut().expect("no function under compilation")
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.state().chunk
    }

    fn depth(&mut self) -> i32 {
        self.state().scopes.depth()
    }

    // ---- emission helpers ----------------------------------------------

    fn emit(&mut self, op: OpCode) {
        self.chunk().write_op(op);
    }

    fn emit_u8(&mut self, v: u8) {
        self.chunk().write_u8(v);
    }

    fn emit_u16(&mut self, v: u16) {
        self.chunk().write_u16(v);
    }

    fn make_constant(&mut self, constant: Constant) -> Result<u16, CompileError> {
        if self.chunk().constants.len() >= u16::MAX as usize {
            return Err(CompileError::new("Too many constants in one chunk"));
        }
        Ok(self.chunk().add_constant(constant))
    }

    fn emit_constant(&mut self, constant: Constant) -> Result<(), CompileError> {
        let idx = self.make_constant(constant)?;
        self.emit(OpCode::Const);
        self.emit_u16(idx);
        Ok(())
    }

    fn emit_iconst8(&mut self, v: i8) {
        self.emit(OpCode::IConst8);
        self.emit_u8(v as u8);
    }

    fn emit_iconst16(&mut self, v: i16) {
        self.emit(OpCode::IConst16);
        self.emit_u16(v as u16);
    }

    /// Emits an integer in its smallest encoding.
    fn emit_int(&mut self, v: i64) -> Result<(), CompileError> {
        if (i8::MIN as i64..=i8::MAX as i64).contains(&v) {
            self.emit_iconst8(v as i8);
        } else if (i16::MIN as i64..=i16::MAX as i64).contains(&v) {
            self.emit_iconst16(v as i16);
        } else {
            self.emit_constant(Constant::Int(v))?;
        }
        Ok(())
    }

    /// Implicit return: `init` methods return `self` (slot 0), everything
    /// else returns null.
    fn emit_return(&mut self, is_init: bool) {
        if is_init {
            self.emit(OpCode::LoadLocal);
            self.emit_u8(0);
        } else {
            self.emit(OpCode::Null);
        }
        self.emit(OpCode::Return);
    }

    /// Emits a jump with a placeholder offset; returns the offset position
    /// for later patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit(op);
        self.emit_u16(0xFFFF);
        self.chunk().code.len() - 2
    }

    /// Patches a forward jump to land on the next emitted byte. Offsets are
    /// relative to the byte after the two offset bytes.
    fn patch_jump(&mut self, pos: usize) -> Result<(), CompileError> {
        let off = self.chunk().code.len() as i64 - (pos as i64 + 2);
        if off > i16::MAX as i64 {
            return Err(CompileError::new("Too much code to jump over"));
        }
        let bytes = (off as i16).to_be_bytes();
        self.chunk().code[pos] = bytes[0];
        self.chunk().code[pos + 1] = bytes[1];
        Ok(())
    }

    /// Emits an unconditional backward jump to `loop_start`.
    fn emit_loop(&mut self, loop_start: usize) -> Result<(), CompileError> {
        self.emit(OpCode::Jump);
        let off = loop_start as i64 - (self.chunk().code.len() as i64 + 2);
        if off < i16::MIN as i64 {
            return Err(CompileError::new("Loop body too large"));
        }
        self.emit_u16((off as i16) as u16);
        Ok(())
    }

    // ---- variables -----------------------------------------------------

    fn declare_variable(&mut self, name: &str, line: usize) -> Result<(), CompileError> {
        self.state()
            .scopes
            .declare(name)
            .map_err(|e| scope_err(e, line))
    }

    fn mark_initialized(&mut self) {
        self.state().scopes.mark_initialized();
    }

    /// Binds the value on top of the stack to `name`: globals get a
    /// `DEFINE_GLOBAL`, locals simply claim their stack slot.
    fn define_variable(&mut self, name: &str, _line: usize) -> Result<(), CompileError> {
        if self.depth() > 0 {
            self.mark_initialized();
            return Ok(());
        }
        let idx = self.make_constant(Constant::String(name.to_string()))?;
        self.emit(OpCode::DefineGlobal);
        self.emit_u16(idx);
        self.known_globals.insert(name.to_string());
        Ok(())
    }

    fn resolve_variable(&mut self, name: &str, line: usize) -> Result<Resolved, CompileError> {
        let top = self.states.len() - 1;
        if let Some(idx) = self.states[top]
            .scopes
            .resolve_local(name)
            .map_err(|e| scope_err(e, line))?
        {
            return Ok(Resolved::Local(slot_u8(idx, line)?));
        }
        if let Some(idx) = self.resolve_upvalue(top, name, line)? {
            return Ok(Resolved::Upvalue(idx));
        }
        Ok(Resolved::Global)
    }

    /// Walks outward through enclosing functions looking for `name`,
    /// synthesizing (and deduplicating) upvalue descriptors on the way back
    /// in. Returns the upvalue index in the function at `level`.
    fn resolve_upvalue(
        &mut self,
        level: usize,
        name: &str,
        line: usize,
    ) -> Result<Option<u8>, CompileError> {
        if level == 0 {
            return Ok(None);
        }
        let parent = level - 1;

        if let Some(local_idx) = self.states[parent]
            .scopes
            .resolve_local(name)
            .map_err(|e| scope_err(e, line))?
        {
            self.states[parent].scopes.mark_captured(local_idx);
            let slot = slot_u8(local_idx, line)?;
            let idx = self.states[level]
                .scopes
                .add_upvalue(slot, true)
                .map_err(|e| scope_err(e, line))?;
            return Ok(Some(idx as u8));
        }

        if let Some(parent_up) = self.resolve_upvalue(parent, name, line)? {
            let idx = self.states[level]
                .scopes
                .add_upvalue(parent_up, false)
                .map_err(|e| scope_err(e, line))?;
            return Ok(Some(idx as u8));
        }

        Ok(None)
    }

    fn emit_load_var(&mut self, name: &str, line: usize) -> Result<(), CompileError> {
        match self.resolve_variable(name, line)? {
            Resolved::Local(slot) => {
                self.emit(OpCode::LoadLocal);
                self.emit_u8(slot);
            }
            Resolved::Upvalue(idx) => {
                self.emit(OpCode::LoadUpvalue);
                self.emit_u8(idx);
            }
            Resolved::Global => {
                let idx = self.make_constant(Constant::String(name.to_string()))?;
                self.emit(OpCode::LoadGlobal);
                self.emit_u16(idx);
            }
        }
        Ok(())
    }

    fn emit_store_var(&mut self, name: &str, line: usize) -> Result<(), CompileError> {
        match self.resolve_variable(name, line)? {
            Resolved::Local(slot) => {
                self.emit(OpCode::StoreLocal);
                self.emit_u8(slot);
            }
            Resolved::Upvalue(idx) => {
                self.emit(OpCode::StoreUpvalue);
                self.emit_u8(idx);
            }
            Resolved::Global => {
                let idx = self.make_constant(Constant::String(name.to_string()))?;
                self.emit(OpCode::StoreGlobal);
                self.emit_u16(idx);
            }
        }
        Ok(())
    }

    /// Non-mutating probe: does `name` refer to anything the compiler has
    /// seen — a local in any enclosing function or a defined global?
    fn is_known_variable(&self, name: &str) -> bool {
        self.states.iter().any(|s| s.scopes.has_local(name))
            || self.known_globals.contains(name)
    }

    fn begin_scope(&mut self) {
        self.state().scopes.begin_scope();
    }

    fn end_scope(&mut self) {
        let mut ops = Vec::new();
        self.state().scopes.end_scope(|captured| ops.push(captured));
        for captured in ops {
            self.emit(if captured {
                OpCode::CloseUpvalue
            } else {
                OpCode::Pop
            });
        }
    }

    // ---- statements ----------------------------------------------------

    fn gen_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Expr(expr) => {
                self.gen_expr(expr)?;
                self.emit(OpCode::Pop);
            }
            Stmt::Disp(expr) => {
                self.gen_expr(expr)?;
                self.emit(OpCode::Print);
            }
            Stmt::Let { name, line, init } => {
                self.declare_variable(name, *line)?;
                match init {
                    Some(expr) => self.gen_expr(expr)?,
                    None => self.emit(OpCode::Null),
                }
                self.define_variable(name, *line)?;
            }
            Stmt::Block(statements) => {
                self.begin_scope();
                for s in statements {
                    self.gen_stmt(s)?;
                }
                self.end_scope();
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.gen_expr(cond)?;
                let else_jump = self.emit_jump(OpCode::JumpIfFalse);
                self.emit(OpCode::Pop);
                self.gen_stmt(then_branch)?;
                let end_jump = self.emit_jump(OpCode::Jump);
                self.patch_jump(else_jump)?;
                self.emit(OpCode::Pop);
                if let Some(else_branch) = else_branch {
                    self.gen_stmt(else_branch)?;
                }
                self.patch_jump(end_jump)?;
            }
            Stmt::While { cond, body } => {
                let loop_start = self.chunk().code.len();
                self.gen_expr(cond)?;
                let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
                self.emit(OpCode::Pop);
                self.gen_stmt(body)?;
                self.emit_loop(loop_start)?;
                self.patch_jump(exit_jump)?;
                self.emit(OpCode::Pop);
            }
            Stmt::Function(decl) => {
                self.declare_variable(&decl.name, decl.line)?;
                self.mark_initialized();
                self.gen_function(decl, false, false)?;
                self.define_variable(&decl.name, decl.line)?;
            }
            Stmt::Return(value) => {
                match value {
                    Some(expr) => self.gen_expr(expr)?,
                    None => self.emit(OpCode::Null),
                }
                self.emit(OpCode::Return);
            }
            Stmt::Struct {
                name,
                line,
                methods,
            } => self.gen_struct(name, *line, methods)?,
            Stmt::Close(expr) => {
                self.gen_expr(expr)?;
                self.emit(OpCode::ClosePipe);
            }
            Stmt::Select { clauses, line } => self.gen_select(clauses, *line)?,
        }
        Ok(())
    }

    /// Compiles a nested function body and emits the closure in the
    /// enclosing function.
    fn gen_function(
        &mut self,
        decl: &FunctionDecl,
        is_method: bool,
        is_init: bool,
    ) -> Result<(), CompileError> {
        if decl.params.len() > 255 {
            return Err(CompileError::at("Too many parameters", decl.line));
        }
        self.begin_function(&decl.name, decl.params.len() as u8, is_method);
        self.begin_scope();
        for param in &decl.params {
            self.declare_variable(&param.name, param.line)?;
            self.mark_initialized();
        }
        for stmt in &decl.body {
            self.gen_stmt(stmt)?;
        }
        self.end_scope();
        let (func_idx, upvalues) = self.end_function(is_init)?;
        self.emit_closure(func_idx, &upvalues)
    }

    fn emit_closure(
        &mut self,
        func_idx: u16,
        upvalues: &[UpvalueDesc],
    ) -> Result<(), CompileError> {
        let const_idx = self.make_constant(Constant::Function(func_idx))?;
        self.emit(OpCode::Closure);
        self.emit_u16(const_idx);
        for upvalue in upvalues {
            self.emit_u8(if upvalue.is_local { 1 } else { 0 });
            self.emit_u8(upvalue.index);
        }
        Ok(())
    }

    fn gen_struct(
        &mut self,
        name: &str,
        line: usize,
        methods: &[FunctionDecl],
    ) -> Result<(), CompileError> {
        self.declare_variable(name, line)?;

        let name_idx = self.make_constant(Constant::String(name.to_string()))?;
        self.emit(OpCode::Struct);
        self.emit_u16(name_idx);

        // Bind the struct, then reload it to attach methods.
        if self.depth() > 0 {
            self.mark_initialized();
            let slot = slot_u8(self.state().scopes.locals.len() - 1, line)?;
            self.emit(OpCode::LoadLocal);
            self.emit_u8(slot);
        } else {
            self.emit(OpCode::DefineGlobal);
            self.emit_u16(name_idx);
            self.known_globals.insert(name.to_string());
            self.emit(OpCode::LoadGlobal);
            self.emit_u16(name_idx);
        }

        for method in methods {
            let is_init = method.name == "init";
            self.gen_function(method, true, is_init)?;
            let method_name_idx =
                self.make_constant(Constant::String(method.name.clone()))?;
            self.emit(OpCode::Method);
            self.emit_u16(method_name_idx);
        }

        self.emit(OpCode::Pop);
        Ok(())
    }

    fn gen_select(
        &mut self,
        clauses: &[SelectClause],
        line: usize,
    ) -> Result<(), CompileError> {
        self.begin_scope();

        // Classify `lhs <- rhs` heads: a bare, unknown identifier on the
        // left is a receive binding; anything else is a send.
        let mut recvs: Vec<(Option<&str>, &Expr, &Stmt)> = Vec::new();
        let mut sends: Vec<(&Expr, &Expr, &Stmt)> = Vec::new();
        let mut default_body: Option<&Stmt> = None;
        for clause in clauses {
            match clause {
                SelectClause::Arrow {
                    lhs, rhs, body, ..
                } => match lhs {
                    Expr::Variable { name, .. } if !self.is_known_variable(name) => {
                        recvs.push((Some(name.as_str()), rhs, body));
                    }
                    _ => sends.push((lhs, rhs, body)),
                },
                SelectClause::Discard { pipe, body } => recvs.push((None, pipe, body)),
                SelectClause::Default { body } => {
                    if default_body.is_some() {
                        return Err(CompileError::at(
                            "Multiple default clauses in select",
                            line,
                        ));
                    }
                    default_body = Some(body);
                }
            }
        }

        let num_cases = recvs.len() + sends.len();
        if num_cases > 255 {
            return Err(CompileError::at("Too many select cases", line));
        }
        self.emit(OpCode::SelectBegin);
        self.emit_u8(num_cases as u8);

        let mut case_jumps = Vec::new();

        // One anonymous slot per receive binding. Names attach per body so
        // sibling cases may reuse a binding name without colliding.
        let mut recv_slots: Vec<Option<usize>> = Vec::with_capacity(recvs.len());
        for (var, pipe, _) in &recvs {
            self.gen_expr(pipe)?;
            match var {
                Some(_) => {
                    let slot = self.state().scopes.declare_anonymous();
                    slot_u8(slot, line)?;
                    recv_slots.push(Some(slot));
                    case_jumps.push(self.emit_jump(OpCode::SelectRecv));
                    self.emit_u8(slot as u8);
                }
                None => {
                    recv_slots.push(None);
                    case_jumps.push(self.emit_jump(OpCode::SelectRecv));
                    self.emit_u8(0xFF);
                }
            }
        }

        for (pipe, value, _) in &sends {
            self.gen_expr(pipe)?;
            self.gen_expr(value)?;
            case_jumps.push(self.emit_jump(OpCode::SelectSend));
        }

        if default_body.is_some() {
            case_jumps.push(self.emit_jump(OpCode::SelectDefault));
        }

        self.emit(OpCode::SelectExec);

        let bodies: Vec<(Option<(&str, usize)>, &Stmt)> = recvs
            .iter()
            .zip(&recv_slots)
            .map(|((var, _, body), slot)| ((*var).zip(*slot), *body))
            .chain(sends.iter().map(|(_, _, body)| (None, *body)))
            .chain(default_body.map(|body| (None, body)))
            .collect();

        let mut end_jumps = Vec::new();
        for (i, (binding, body)) in bodies.iter().enumerate() {
            self.patch_jump(case_jumps[i])?;
            if let Some((name, slot)) = binding {
                self.state().scopes.set_local_name(*slot, name);
            }
            self.gen_stmt(body)?;
            if let Some((_, slot)) = binding {
                self.state().scopes.set_local_name(*slot, "");
            }
            if i + 1 != bodies.len() {
                end_jumps.push(self.emit_jump(OpCode::Jump));
            }
        }
        for jump in end_jumps {
            self.patch_jump(jump)?;
        }

        self.end_scope();
        Ok(())
    }

    // ---- expressions ---------------------------------------------------

    fn gen_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Literal(lit) => self.gen_literal(lit)?,
            Expr::Variable { name, line } => self.emit_load_var(name, *line)?,
            Expr::SelfExpr { line } => self.emit_load_var("self", *line)?,
            Expr::Assign {
                name,
                op,
                value,
                line,
            } => {
                if *op == AssignOp::Set {
                    self.gen_expr(value)?;
                } else {
                    self.emit_load_var(name, *line)?;
                    self.gen_expr(value)?;
                    self.emit(compound_op(*op));
                }
                self.emit_store_var(name, *line)?;
            }
            Expr::SetField {
                target,
                field,
                op,
                value,
            } => {
                self.gen_expr(target)?;
                let field_idx = self.make_constant(Constant::String(field.clone()))?;
                if *op == AssignOp::Set {
                    self.gen_expr(value)?;
                } else {
                    self.emit(OpCode::Dup);
                    self.emit(OpCode::LoadField);
                    self.emit_u16(field_idx);
                    self.gen_expr(value)?;
                    self.emit(compound_op(*op));
                }
                self.emit(OpCode::StoreField);
                self.emit_u16(field_idx);
            }
            Expr::SetIndex {
                target,
                index,
                op,
                value,
            } => {
                self.gen_expr(target)?;
                self.gen_expr(index)?;
                if *op == AssignOp::Set {
                    self.gen_expr(value)?;
                } else {
                    self.emit(OpCode::Dup2);
                    self.emit(OpCode::LoadIndex);
                    self.gen_expr(value)?;
                    self.emit(compound_op(*op));
                }
                self.emit(OpCode::StoreIndex);
            }
            Expr::Binary {
                left,
                op,
                right,
                line,
            } => self.gen_binary(left, *op, right, *line)?,
            Expr::Logical { left, op, right } => {
                self.gen_expr(left)?;
                let jump = self.emit_jump(match op {
                    LogicalOp::And => OpCode::JumpIfFalse,
                    LogicalOp::Or => OpCode::JumpIfTrue,
                });
                self.emit(OpCode::Pop);
                self.gen_expr(right)?;
                self.patch_jump(jump)?;
            }
            Expr::Unary { op, expr, line } => self.gen_unary(*op, expr, *line)?,
            Expr::Postfix { op, target, line } => self.gen_postfix(*op, target, *line)?,
            Expr::Call { callee, args, line } => {
                self.gen_expr(callee)?;
                for arg in args {
                    self.gen_expr(arg)?;
                }
                if args.len() > 255 {
                    return Err(CompileError::at("Too many arguments", *line));
                }
                self.emit(OpCode::Call);
                self.emit_u8(args.len() as u8);
            }
            Expr::Index { target, index } => {
                self.gen_expr(target)?;
                self.gen_expr(index)?;
                self.emit(OpCode::LoadIndex);
            }
            Expr::Field { target, field } => {
                self.gen_expr(target)?;
                let field_idx = self.make_constant(Constant::String(field.clone()))?;
                self.emit(OpCode::LoadField);
                self.emit_u16(field_idx);
            }
            Expr::Ternary {
                cond,
                then_branch,
                else_branch,
            } => {
                self.gen_expr(cond)?;
                let else_jump = self.emit_jump(OpCode::JumpIfFalse);
                self.emit(OpCode::Pop);
                self.gen_expr(then_branch)?;
                let end_jump = self.emit_jump(OpCode::Jump);
                self.patch_jump(else_jump)?;
                self.emit(OpCode::Pop);
                self.gen_expr(else_branch)?;
                self.patch_jump(end_jump)?;
            }
            Expr::Array(elements) => {
                for element in elements {
                    self.gen_expr(element)?;
                }
                if elements.len() > u16::MAX as usize {
                    return Err(CompileError::new("Array literal too large"));
                }
                self.emit(OpCode::MakeArray);
                self.emit_u16(elements.len() as u16);
            }
            Expr::ObjectLit(items) => {
                for (key, value) in items {
                    self.gen_expr(value)?;
                    let key_idx = self.make_constant(Constant::String(key.clone()))?;
                    self.emit(OpCode::Const);
                    self.emit_u16(key_idx);
                }
                if items.len() > u16::MAX as usize {
                    return Err(CompileError::new("Object literal too large"));
                }
                self.emit(OpCode::MakeObject);
                self.emit_u16(items.len() as u16);
            }
            Expr::Lambda { params, body } => {
                let decl = FunctionDecl {
                    name: "_".to_string(),
                    line: 0,
                    params: params.clone(),
                    body: body.clone(),
                };
                self.gen_function(&decl, false, false)?;
            }
            Expr::Spawn { count, body } => {
                let decl = FunctionDecl {
                    name: "$spawn".to_string(),
                    line: 0,
                    params: Vec::new(),
                    body: body.clone(),
                };
                self.gen_function(&decl, false, false)?;
                match count {
                    Some(count) => self.gen_expr(count)?,
                    None => self.emit_iconst8(1),
                }
                self.emit(OpCode::Spawn);
            }
            Expr::Send { pipe, value } => {
                self.gen_expr(pipe)?;
                self.gen_expr(value)?;
                self.emit(OpCode::SendPipe);
            }
            Expr::Recv(pipe) => {
                self.gen_expr(pipe)?;
                self.emit(OpCode::RecvPipe);
            }
        }
        Ok(())
    }

    fn gen_literal(&mut self, lit: &Literal) -> Result<(), CompileError> {
        match lit {
            Literal::Null => self.emit(OpCode::Null),
            Literal::Bool(true) => self.emit(OpCode::True),
            Literal::Bool(false) => self.emit(OpCode::False),
            Literal::Int(v) => self.emit_int(*v)?,
            Literal::Float(v) => self.emit_constant(Constant::Float(*v))?,
            Literal::Str(s) => self.emit_constant(Constant::String(s.clone()))?,
        }
        Ok(())
    }

    fn gen_binary(
        &mut self,
        left: &Expr,
        op: BinaryOp,
        right: &Expr,
        _line: usize,
    ) -> Result<(), CompileError> {
        // Fold literal operands at compile time. A fold that would error
        // (1/0, type mismatch) falls through to the runtime path instead.
        if let (Expr::Literal(l), Expr::Literal(r)) = (left, right) {
            if let Some(folded) = fold_binary(l, op, r) {
                return self.gen_literal(&folded);
            }
        }

        self.gen_expr(left)?;
        self.gen_expr(right)?;
        self.emit(match op {
            BinaryOp::Add => OpCode::Add,
            BinaryOp::Sub => OpCode::Sub,
            BinaryOp::Mul => OpCode::Mul,
            BinaryOp::Div => OpCode::Div,
            BinaryOp::Mod => OpCode::Mod,
            BinaryOp::Eq => OpCode::Eq,
            BinaryOp::Neq => OpCode::Neq,
            BinaryOp::Lt => OpCode::Lt,
            BinaryOp::Le => OpCode::Le,
            BinaryOp::Gt => OpCode::Gt,
            BinaryOp::Ge => OpCode::Ge,
            BinaryOp::BitOr => OpCode::BitOr,
            BinaryOp::BitAnd => OpCode::BitAnd,
            BinaryOp::BitXor => OpCode::BitXor,
            BinaryOp::Shl => OpCode::ShiftLeft,
            BinaryOp::Shr => OpCode::ShiftRight,
        });
        Ok(())
    }

    fn gen_unary(
        &mut self,
        op: UnaryOp,
        operand: &Expr,
        line: usize,
    ) -> Result<(), CompileError> {
        if let Expr::Literal(lit) = operand {
            if let Some(folded) = fold_unary(op, lit) {
                return self.gen_literal(&folded);
            }
        }

        match op {
            UnaryOp::Not => {
                self.gen_expr(operand)?;
                self.emit(OpCode::Not);
            }
            UnaryOp::Neg => {
                self.gen_expr(operand)?;
                self.emit(OpCode::Neg);
            }
            UnaryOp::BitNot => {
                self.gen_expr(operand)?;
                self.emit(OpCode::BitNot);
            }
            UnaryOp::Incr | UnaryOp::Decr => {
                let arith = if op == UnaryOp::Incr {
                    OpCode::Add
                } else {
                    OpCode::Sub
                };
                match operand {
                    Expr::Variable { name, line } => {
                        let (name, line) = (name.clone(), *line);
                        self.emit_load_var(&name, line)?;
                        self.emit_iconst8(1);
                        self.emit(arith);
                        self.emit_store_var(&name, line)?;
                    }
                    Expr::Index { target, index } => {
                        self.gen_expr(target)?;
                        self.gen_expr(index)?;
                        self.emit(OpCode::Dup2);
                        self.emit(OpCode::LoadIndex);
                        self.emit_iconst8(1);
                        self.emit(arith);
                        self.emit(OpCode::StoreIndex);
                    }
                    Expr::Field { target, field } => {
                        self.gen_expr(target)?;
                        self.emit(OpCode::Dup);
                        let field_idx =
                            self.make_constant(Constant::String(field.clone()))?;
                        self.emit(OpCode::LoadField);
                        self.emit_u16(field_idx);
                        self.emit_iconst8(1);
                        self.emit(arith);
                        self.emit(OpCode::StoreField);
                        self.emit_u16(field_idx);
                    }
                    _ => {
                        return Err(CompileError::at(
                            "Invalid target for increment/decrement",
                            line,
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Postfix `++`/`--`: the expression's value is the original. Variables
    /// use a DUP before the arithmetic; container targets re-apply the
    /// inverse operation to recover the pre-step value.
    fn gen_postfix(
        &mut self,
        op: IncDec,
        target: &Expr,
        line: usize,
    ) -> Result<(), CompileError> {
        let arith = if op == IncDec::Incr {
            OpCode::Add
        } else {
            OpCode::Sub
        };
        let inverse = if op == IncDec::Incr {
            OpCode::Sub
        } else {
            OpCode::Add
        };
        match target {
            Expr::Variable { name, line } => {
                let (name, line) = (name.clone(), *line);
                self.emit_load_var(&name, line)?;
                self.emit(OpCode::Dup);
                self.emit_iconst8(1);
                self.emit(arith);
                self.emit_store_var(&name, line)?;
                self.emit(OpCode::Pop);
            }
            Expr::Index { target, index } => {
                self.gen_expr(target)?;
                self.gen_expr(index)?;
                self.emit(OpCode::Dup2);
                self.emit(OpCode::LoadIndex);
                self.emit_iconst8(1);
                self.emit(arith);
                self.emit(OpCode::StoreIndex);
                self.emit_iconst8(1);
                self.emit(inverse);
            }
            Expr::Field { target, field } => {
                self.gen_expr(target)?;
                self.emit(OpCode::Dup);
                let field_idx = self.make_constant(Constant::String(field.clone()))?;
                self.emit(OpCode::LoadField);
                self.emit_u16(field_idx);
                self.emit_iconst8(1);
                self.emit(arith);
                self.emit(OpCode::StoreField);
                self.emit_u16(field_idx);
                self.emit_iconst8(1);
                self.emit(inverse);
            }
            _ => {
                return Err(CompileError::at(
                    "Invalid target for increment/decrement",
                    line,
                ));
            }
        }
        Ok(())
    }
}

fn compound_op(op: AssignOp) -> OpCode {
    match op {
        AssignOp::Add => OpCode::Add,
        AssignOp::Sub => OpCode::Sub,
        AssignOp::Mul => OpCode::Mul,
        AssignOp::Div => OpCode::Div,
        AssignOp::Mod => OpCode::Mod,
        AssignOp::Set => unreachable!("Set has no compound opcode"),
    }
}

fn scope_err(err: ScopeError, line: usize) -> CompileError {
    CompileError::at(err.message, line)
}

fn slot_u8(index: usize, line: usize) -> Result<u8, CompileError> {
    u8::try_from(index)
        .map_err(|_| CompileError::at("Too many local variables in function", line))
}

// ---- constant folding --------------------------------------------------

/// Folds a binary operation on two literals, mirroring runtime semantics.
/// Returns `None` when the runtime would error or the operation is not
/// foldable, so the bytecode path preserves behavior.
fn fold_binary(l: &Literal, op: BinaryOp, r: &Literal) -> Option<Literal> {
    use Literal::*;
    match op {
        BinaryOp::Add => match (l, r) {
            (Int(a), Int(b)) => Some(Int(a.wrapping_add(*b))),
            (Str(_), _) | (_, Str(_)) => {
                Some(Str(format!("{}{}", literal_text(l)?, literal_text(r)?)))
            }
            _ => {
                let (a, b) = both_floats(l, r)?;
                Some(Float(a + b))
            }
        },
        BinaryOp::Sub => fold_arith(l, r, i64::wrapping_sub, |a, b| a - b),
        BinaryOp::Mul => fold_arith(l, r, i64::wrapping_mul, |a, b| a * b),
        BinaryOp::Div => match (l, r) {
            (Int(a), Int(b)) => {
                if *b == 0 {
                    None
                } else {
                    Some(Int(a.wrapping_div(*b)))
                }
            }
            _ => {
                let (a, b) = both_floats(l, r)?;
                if b == 0.0 {
                    None
                } else {
                    Some(Float(a / b))
                }
            }
        },
        BinaryOp::Mod => match (l, r) {
            (Int(a), Int(b)) if *b != 0 => Some(Int(a.wrapping_rem(*b))),
            _ => None,
        },
        BinaryOp::Eq => Some(Bool(literal_eq(l, r))),
        BinaryOp::Neq => Some(Bool(!literal_eq(l, r))),
        BinaryOp::Lt => fold_compare(l, r, |o| o == std::cmp::Ordering::Less),
        BinaryOp::Le => fold_compare(l, r, |o| o != std::cmp::Ordering::Greater),
        BinaryOp::Gt => fold_compare(l, r, |o| o == std::cmp::Ordering::Greater),
        BinaryOp::Ge => fold_compare(l, r, |o| o != std::cmp::Ordering::Less),
        BinaryOp::BitOr => fold_bits(l, r, |a, b| a | b),
        BinaryOp::BitAnd => fold_bits(l, r, |a, b| a & b),
        BinaryOp::BitXor => fold_bits(l, r, |a, b| a ^ b),
        BinaryOp::Shl => fold_shift(l, r, |a, b| a.wrapping_shl(b)),
        BinaryOp::Shr => fold_shift(l, r, |a, b| a.wrapping_shr(b)),
    }
}

fn fold_unary(op: UnaryOp, lit: &Literal) -> Option<Literal> {
    match op {
        UnaryOp::Not => Some(Literal::Bool(!literal_truthy(lit))),
        UnaryOp::Neg => match lit {
            Literal::Int(v) => Some(Literal::Int(v.wrapping_neg())),
            Literal::Float(v) => Some(Literal::Float(-v)),
            _ => None,
        },
        UnaryOp::BitNot => match lit {
            Literal::Int(v) => Some(Literal::Int(!v)),
            _ => None,
        },
        UnaryOp::Incr | UnaryOp::Decr => None,
    }
}

fn fold_arith(
    l: &Literal,
    r: &Literal,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> Option<Literal> {
    match (l, r) {
        (Literal::Int(a), Literal::Int(b)) => Some(Literal::Int(int_op(*a, *b))),
        _ => {
            let (a, b) = both_floats(l, r)?;
            Some(Literal::Float(float_op(a, b)))
        }
    }
}

fn fold_bits(l: &Literal, r: &Literal, op: fn(i64, i64) -> i64) -> Option<Literal> {
    match (l, r) {
        (Literal::Int(a), Literal::Int(b)) => Some(Literal::Int(op(*a, *b))),
        _ => None,
    }
}

fn fold_shift(l: &Literal, r: &Literal, op: fn(i64, u32) -> i64) -> Option<Literal> {
    match (l, r) {
        (Literal::Int(a), Literal::Int(b)) if (0..64).contains(b) => {
            Some(Literal::Int(op(*a, *b as u32)))
        }
        _ => None,
    }
}

fn fold_compare(
    l: &Literal,
    r: &Literal,
    pred: fn(std::cmp::Ordering) -> bool,
) -> Option<Literal> {
    let ordering = match (l, r) {
        (Literal::Str(a), Literal::Str(b)) => a.cmp(b),
        _ => {
            let (a, b) = both_floats(l, r)?;
            a.partial_cmp(&b)?
        }
    };
    Some(Literal::Bool(pred(ordering)))
}

fn both_floats(l: &Literal, r: &Literal) -> Option<(f64, f64)> {
    Some((literal_float(l)?, literal_float(r)?))
}

fn literal_float(lit: &Literal) -> Option<f64> {
    match lit {
        Literal::Int(v) => Some(*v as f64),
        Literal::Float(v) => Some(*v),
        _ => None,
    }
}

fn literal_eq(l: &Literal, r: &Literal) -> bool {
    match (l, r) {
        (Literal::Null, Literal::Null) => true,
        (Literal::Bool(a), Literal::Bool(b)) => a == b,
        (Literal::Str(a), Literal::Str(b)) => a == b,
        _ => match both_floats(l, r) {
            Some((a, b)) => a == b,
            None => false,
        },
    }
}

fn literal_truthy(lit: &Literal) -> bool {
    match lit {
        Literal::Null => false,
        Literal::Bool(b) => *b,
        Literal::Int(v) => *v != 0,
        Literal::Float(v) => *v != 0.0,
        Literal::Str(s) => !s.is_empty(),
    }
}

fn literal_text(lit: &Literal) -> Option<String> {
    Some(match lit {
        Literal::Null => "null".to_string(),
        Literal::Bool(b) => b.to_string(),
        Literal::Int(v) => v.to_string(),
        Literal::Float(v) => v.to_string(),
        Literal::Str(s) => s.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn compile_source(source: &str) -> Program {
        let statements = parse(source).expect("parse");
        compile(&statements).expect("compile")
    }

    fn main_code(program: &Program) -> &[u8] {
        &program.functions[program.main as usize].chunk.code
    }

    #[test]
    fn folds_literal_arithmetic_to_a_single_constant() {
        let folded = compile_source("let x = 2 + 3;");
        let spelled = compile_source("let x = 5;");
        assert_eq!(main_code(&folded), main_code(&spelled));
    }

    #[test]
    fn folds_literal_comparisons_to_bool_pushes() {
        let folded = compile_source("let x = 2 < 3;");
        let spelled = compile_source("let x = true;");
        assert_eq!(main_code(&folded), main_code(&spelled));
    }

    #[test]
    fn division_by_literal_zero_is_left_for_runtime() {
        let program = compile_source("let x = 1 / 0;");
        assert!(main_code(&program).contains(&(OpCode::Div as u8)));
    }

    #[test]
    fn small_ints_use_compact_encodings() {
        let program = compile_source("7; 300; 70000;");
        let code = main_code(&program);
        assert!(code.contains(&(OpCode::IConst8 as u8)));
        assert!(code.contains(&(OpCode::IConst16 as u8)));
        assert!(code.contains(&(OpCode::Const as u8)));
    }

    #[test]
    fn top_level_let_defines_a_global() {
        let program = compile_source("let x = 1;");
        assert!(main_code(&program).contains(&(OpCode::DefineGlobal as u8)));
    }

    #[test]
    fn nested_function_captures_enclosing_local_as_upvalue() {
        let program = compile_source(
            "fn outer() { let a = 1; fn inner() { return a; } return inner; }",
        );
        let inner = program
            .functions
            .iter()
            .find(|f| f.name == "inner")
            .expect("inner compiled");
        assert_eq!(inner.upvalue_count, 1);
        assert!(inner.chunk.code.contains(&(OpCode::LoadUpvalue as u8)));

        let outer = program
            .functions
            .iter()
            .find(|f| f.name == "outer")
            .expect("outer compiled");
        // leaving outer's scope must close the captured local
        assert!(outer.chunk.code.contains(&(OpCode::CloseUpvalue as u8)));
    }

    #[test]
    fn own_initializer_read_is_a_compile_error() {
        let statements = parse("fn f() { let a = 1; { let a = a; } }").expect("parse");
        let err = compile(&statements).expect_err("should fail");
        assert!(err.message.contains("own initializer"));
    }

    #[test]
    fn duplicate_declaration_in_same_scope_is_a_compile_error() {
        let statements = parse("fn f() { let a = 1; let a = 2; }").expect("parse");
        assert!(compile(&statements).is_err());
    }

    #[test]
    fn select_emits_case_registration_then_exec() {
        let program = compile_source(
            "let a = pipe(0);\nselect { v <- a => disp v; default => disp 0; }",
        );
        let code = main_code(&program);
        assert!(code.contains(&(OpCode::SelectBegin as u8)));
        assert!(code.contains(&(OpCode::SelectRecv as u8)));
        assert!(code.contains(&(OpCode::SelectDefault as u8)));
        assert!(code.contains(&(OpCode::SelectExec as u8)));
    }

    #[test]
    fn select_send_on_known_global_is_classified_as_send() {
        let program = compile_source(
            "let ch = pipe(1);\nselect { ch <- 1 => disp 1; default => disp 0; }",
        );
        let code = main_code(&program);
        assert!(code.contains(&(OpCode::SelectSend as u8)));
        assert!(!code.contains(&(OpCode::SelectRecv as u8)));
    }
}
