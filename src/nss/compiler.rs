//! Code generation: typed program → NCS instruction list.
//!
//! Stack positions are tracked in bytes relative to the stack pointer at
//! subroutine entry. Parameters and the return slot sit below zero, locals
//! above it. Jumps are emitted against labels and resolved to instruction
//! indices once every subroutine has been emitted.

use std::collections::VecDeque;

use serde::Serialize;

use super::ast::{BinOp, Span, UnaryOp};
use super::error::CompileError;
use super::typeck::{
    Arg, FuncId, Place, TypedExpr, TypedExprKind, TypedProgram, TypedStmt, TypedStmtKind, VarRef,
};
use super::types::NssType;
use crate::ncs::{Instruction, Opcode, Operand, Program, Qualifier};

/// A unit with an entry point, ready for the codec.
#[derive(Debug, Clone)]
pub struct CompiledScript {
    pub program: Program,
    /// `StartingConditional` rather than `main`.
    pub conditional: bool,
    /// Emitted subroutines in emission order.
    pub functions: Vec<String>,
}

/// What an include-only unit declares. No code is produced for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LibrarySummary {
    pub functions: Vec<String>,
    pub globals: Vec<String>,
    pub structs: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum CompiledUnit {
    Script(CompiledScript),
    Library(LibrarySummary),
}

pub fn compile(program: &TypedProgram, allow_library: bool) -> Result<CompiledUnit, CompileError> {
    let Some(entry) = program.entry else {
        if allow_library {
            return Ok(CompiledUnit::Library(summarize(program)));
        }
        return Err(CompileError::entry_point(
            "no entry point: define 'void main()' or 'int StartingConditional()'",
            Span::default(),
        ));
    };

    let mut gen = Codegen::new(program);
    gen.emit_program(entry)?;
    let functions = gen.emitted.iter().map(|&f| program.functions[f].name.clone()).collect();
    let program_out = gen.finish()?;
    log::debug!("generated {} instructions", program_out.len());

    Ok(CompiledUnit::Script(CompiledScript {
        program: program_out,
        conditional: program.is_conditional(),
        functions,
    }))
}

fn summarize(program: &TypedProgram) -> LibrarySummary {
    LibrarySummary {
        functions: program.functions.iter().map(|f| f.name.clone()).collect(),
        globals: program.globals.iter().map(|g| g.name.clone()).collect(),
        structs: program.structs.iter().map(|(name, _)| name.clone()).collect(),
    }
}

fn bytes(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn stack(offset: i32, size: i32) -> Operand {
    Operand::Stack {
        offset,
        size: u16::try_from(size).unwrap_or(u16::MAX),
    }
}

fn binary_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::Add,
        BinOp::Sub => Opcode::Sub,
        BinOp::Mul => Opcode::Mul,
        BinOp::Div => Opcode::Div,
        BinOp::Mod => Opcode::Mod,
        BinOp::Eq => Opcode::Equal,
        BinOp::Ne => Opcode::NEqual,
        BinOp::Lt => Opcode::Lt,
        BinOp::Le => Opcode::Leq,
        BinOp::Gt => Opcode::Gt,
        BinOp::Ge => Opcode::Geq,
        BinOp::BitAnd => Opcode::BoolAnd,
        BinOp::BitOr => Opcode::IncOr,
        BinOp::BitXor => Opcode::ExcOr,
        BinOp::Shl => Opcode::ShLeft,
        BinOp::Shr => Opcode::ShRight,
        BinOp::UShr => Opcode::UShRight,
        BinOp::And => Opcode::LogAnd,
        BinOp::Or => Opcode::LogOr,
    }
}

/// Qualifier of an arithmetic or comparison instruction for its operand types.
pub fn operand_pair(left: &NssType, right: &NssType) -> Qualifier {
    match (left, right) {
        (NssType::Int, NssType::Float) => Qualifier::IntFloat,
        (NssType::Float, NssType::Int) => Qualifier::FloatInt,
        (NssType::Vector, NssType::Vector) => Qualifier::VectorVector,
        (NssType::Vector, NssType::Float) => Qualifier::VectorFloat,
        (NssType::Float, NssType::Vector) => Qualifier::FloatVector,
        (l, _) => l.pair_qualifier(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Label(usize);

struct LoopContext {
    break_label: Label,
    /// `None` for switch statements.
    continue_label: Option<Label>,
    /// Stack depth to restore before jumping out.
    depth: i32,
}

#[derive(Default)]
struct Frame {
    depth: i32,
    positions: Vec<i32>,
    local_types: Vec<NssType>,
    params_size: i32,
    return_pos: i32,
    return_size: i32,
    ret_label: Option<Label>,
    loops: Vec<LoopContext>,
    /// Emitting the globals routine: globals are SP-relative, no BP yet.
    in_globals: bool,
}

struct Codegen<'a> {
    prog: &'a TypedProgram,
    code: Vec<Instruction>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
    func_labels: Vec<Option<Label>>,
    queue: VecDeque<(FuncId, Span)>,
    emitted: Vec<FuncId>,
    globals_size: i32,
    frame: Frame,
}

impl<'a> Codegen<'a> {
    fn new(prog: &'a TypedProgram) -> Self {
        Self {
            prog,
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            func_labels: vec![None; prog.functions.len()],
            queue: VecDeque::new(),
            emitted: Vec::new(),
            globals_size: bytes(prog.globals_size()),
            frame: Frame::default(),
        }
    }

    // ── Emission helpers ──────────────────────────────────────────

    fn emit(&mut self, ins: Instruction) {
        self.code.push(ins);
    }

    fn op(&mut self, opcode: Opcode, qualifier: Qualifier, operand: Operand) {
        self.emit(Instruction::new(opcode, qualifier, operand));
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.code.len());
    }

    fn jump(&mut self, opcode: Opcode, label: Label) {
        self.fixups.push((self.code.len(), label));
        self.emit(Instruction::jump(opcode, 0));
    }

    fn movsp(&mut self, bytes: i32) {
        if bytes != 0 {
            self.op(Opcode::MovSp, Qualifier::None, Operand::Offset(bytes));
        }
    }

    fn size_of(&self, ty: &NssType) -> i32 {
        bytes(self.prog.structs.size_of(ty))
    }

    fn reserve(&mut self, ty: &NssType) {
        for cell in self.prog.structs.cells(ty) {
            let q = cell.qualifier().unwrap_or(Qualifier::Int);
            self.emit(Instruction::bare(Opcode::RsAdd, q));
            self.frame.depth += 4;
        }
    }

    fn func_label(&mut self, func: FuncId, span: Span) -> Label {
        if let Some(label) = self.func_labels[func] {
            return label;
        }
        let label = self.new_label();
        self.func_labels[func] = Some(label);
        self.queue.push_back((func, span));
        label
    }

    fn finish(self) -> Result<Program, CompileError> {
        let mut code = self.code;
        for (at, label) in self.fixups {
            let target = self.labels.get(label.0).copied().flatten().ok_or_else(|| {
                CompileError::semantic("jump to an unplaced label", Span::default())
            })?;
            code[at].set_jump_target(target);
        }
        Ok(Program::new(code))
    }

    // ── Program layout ────────────────────────────────────────────

    fn emit_program(&mut self, entry: FuncId) -> Result<(), CompileError> {
        let conditional = self.prog.is_conditional();
        let entry_label = self.func_label(entry, Span::default());

        if conditional {
            self.emit(Instruction::bare(Opcode::RsAdd, Qualifier::Int));
        }
        if self.globals_size > 0 {
            let globals = self.new_label();
            self.jump(Opcode::Jsr, globals);
            self.emit(Instruction::bare(Opcode::Retn, Qualifier::None));
            self.bind(globals);
            self.emit_globals(entry_label, conditional)?;
        } else {
            self.jump(Opcode::Jsr, entry_label);
            self.emit(Instruction::bare(Opcode::Retn, Qualifier::None));
        }

        while let Some((func, span)) = self.queue.pop_front() {
            self.emit_function(func, span)?;
        }
        Ok(())
    }

    fn emit_globals(&mut self, entry: Label, conditional: bool) -> Result<(), CompileError> {
        self.frame = Frame {
            in_globals: true,
            ..Frame::default()
        };
        let prog = self.prog;
        for g in &prog.globals {
            self.reserve(&g.ty);
            if let Some(init) = &g.init {
                let place = Place {
                    var: VarRef::Global(0),
                    offset: 0,
                    ty: g.ty.clone(),
                };
                self.compile_expr(init)?;
                let size = self.size_of(&init.ty);
                self.store_global_at(bytes(g.offset), &place, size);
                self.pop(size);
            }
        }

        let g = self.globals_size;
        self.emit(Instruction::bare(Opcode::SaveBp, Qualifier::None));
        if conditional {
            self.emit(Instruction::bare(Opcode::RsAdd, Qualifier::Int));
            self.jump(Opcode::Jsr, entry);
            self.op(Opcode::CpDownSp, Qualifier::Stack, stack(-(g + 12), 4));
            self.movsp(-4);
        } else {
            self.jump(Opcode::Jsr, entry);
        }
        self.emit(Instruction::bare(Opcode::RestoreBp, Qualifier::None));
        self.movsp(-g);
        self.emit(Instruction::bare(Opcode::Retn, Qualifier::None));
        Ok(())
    }

    fn emit_function(&mut self, id: FuncId, call_span: Span) -> Result<(), CompileError> {
        let prog = self.prog;
        let func = &prog.functions[id];
        let Some(body) = &func.body else {
            return Err(CompileError::semantic(
                format!("function '{}' is declared but never defined", func.name),
                call_span,
            ));
        };

        let mut positions = vec![0; func.locals.len()];
        let mut below = 0;
        for (i, ty) in func.params.iter().enumerate() {
            below -= self.size_of(ty);
            positions[i] = below;
        }
        let return_size = self.size_of(&func.return_type);
        let ret_label = self.new_label();
        self.frame = Frame {
            depth: 0,
            positions,
            local_types: func.locals.iter().map(|l| l.ty.clone()).collect(),
            params_size: -below,
            return_pos: below - return_size,
            return_size,
            ret_label: Some(ret_label),
            loops: Vec::new(),
            in_globals: false,
        };

        if let Some(label) = self.func_labels[id] {
            self.bind(label);
        }
        self.emitted.push(id);
        self.compile_block(body)?;
        self.bind(ret_label);
        self.movsp(below);
        self.emit(Instruction::bare(Opcode::Retn, Qualifier::None));
        Ok(())
    }

    // ── Variable access ───────────────────────────────────────────

    fn local_offset(&self, place: &Place, id: usize) -> i32 {
        self.frame.positions[id] + bytes(place.offset) - self.frame.depth
    }

    fn global_pos(&self, id: usize) -> i32 {
        bytes(self.prog.globals[id].offset)
    }

    fn bp_offset(&self, pos: i32) -> i32 {
        pos - (self.globals_size + 4)
    }

    fn load(&mut self, place: &Place) {
        let size = self.size_of(&place.ty);
        match place.var {
            VarRef::Local(id) => {
                let offset = self.local_offset(place, id);
                self.op(Opcode::CpTopSp, Qualifier::Stack, stack(offset, size));
            }
            VarRef::Global(id) => {
                let pos = self.global_pos(id) + bytes(place.offset);
                if self.frame.in_globals {
                    let offset = pos - self.frame.depth;
                    self.op(Opcode::CpTopSp, Qualifier::Stack, stack(offset, size));
                } else {
                    let offset = self.bp_offset(pos);
                    self.op(Opcode::CpTopBp, Qualifier::Stack, stack(offset, size));
                }
            }
        }
        self.frame.depth += size;
    }

    /// Copy the value on top of the stack into `place`; the value stays.
    fn store(&mut self, place: &Place) {
        let size = self.size_of(&place.ty);
        match place.var {
            VarRef::Local(id) => {
                let offset = self.local_offset(place, id);
                self.op(Opcode::CpDownSp, Qualifier::Stack, stack(offset, size));
            }
            VarRef::Global(id) => {
                let pos = self.global_pos(id);
                self.store_global_at(pos, place, size);
            }
        }
    }

    fn store_global_at(&mut self, pos: i32, place: &Place, size: i32) {
        let pos = pos + bytes(place.offset);
        if self.frame.in_globals {
            let offset = pos - self.frame.depth;
            self.op(Opcode::CpDownSp, Qualifier::Stack, stack(offset, size));
        } else {
            let offset = self.bp_offset(pos);
            self.op(Opcode::CpDownBp, Qualifier::Stack, stack(offset, size));
        }
    }

    fn pop(&mut self, size: i32) {
        self.movsp(-size);
        self.frame.depth -= size;
    }

    // ── Statements ────────────────────────────────────────────────

    fn compile_block(&mut self, stmts: &[TypedStmt]) -> Result<(), CompileError> {
        let start = self.frame.depth;
        for stmt in stmts {
            self.compile_stmt(stmt)?;
        }
        let live = self.frame.depth - start;
        self.pop(live);
        Ok(())
    }

    /// Discard the stack above `depth` without changing the tracked depth,
    /// for jumps that leave the current scope.
    fn unwind_to(&mut self, depth: i32) {
        self.movsp(depth - self.frame.depth);
    }

    fn compile_stmt(&mut self, stmt: &TypedStmt) -> Result<(), CompileError> {
        match &stmt.kind {
            TypedStmtKind::Block(stmts) => self.compile_block(stmts)?,
            TypedStmtKind::Decl { local, init } => {
                let ty = self.frame.local_types.get(*local).cloned().unwrap_or(NssType::Int);
                self.frame.positions[*local] = self.frame.depth;
                self.reserve(&ty);
                if let Some(init) = init {
                    self.compile_expr(init)?;
                    let place = Place {
                        var: VarRef::Local(*local),
                        offset: 0,
                        ty,
                    };
                    self.store(&place);
                    let size = self.size_of(&init.ty);
                    self.pop(size);
                }
            }
            TypedStmtKind::Expr(e) => self.compile_discarded(e)?,
            TypedStmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.compile_expr(cond)?;
                let else_label = self.new_label();
                self.jump(Opcode::Jz, else_label);
                self.frame.depth -= 4;
                self.compile_stmt(then_branch)?;
                match else_branch {
                    Some(else_branch) => {
                        let end = self.new_label();
                        self.jump(Opcode::Jmp, end);
                        self.bind(else_label);
                        self.compile_stmt(else_branch)?;
                        self.bind(end);
                    }
                    None => self.bind(else_label),
                }
            }
            TypedStmtKind::While { cond, body } => {
                let top = self.new_label();
                let end = self.new_label();
                self.bind(top);
                self.compile_expr(cond)?;
                self.jump(Opcode::Jz, end);
                self.frame.depth -= 4;
                self.compile_loop_body(body, end, top)?;
                self.jump(Opcode::Jmp, top);
                self.bind(end);
            }
            TypedStmtKind::DoWhile { body, cond } => {
                let top = self.new_label();
                let cont = self.new_label();
                let end = self.new_label();
                self.bind(top);
                self.compile_loop_body(body, end, cont)?;
                self.bind(cont);
                self.compile_expr(cond)?;
                self.jump(Opcode::Jnz, top);
                self.frame.depth -= 4;
                self.bind(end);
            }
            TypedStmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    self.compile_discarded(init)?;
                }
                let top = self.new_label();
                let cont = self.new_label();
                let end = self.new_label();
                self.bind(top);
                if let Some(cond) = cond {
                    self.compile_expr(cond)?;
                    self.jump(Opcode::Jz, end);
                    self.frame.depth -= 4;
                }
                self.compile_loop_body(body, end, cont)?;
                self.bind(cont);
                if let Some(step) = step {
                    self.compile_discarded(step)?;
                }
                self.jump(Opcode::Jmp, top);
                self.bind(end);
            }
            TypedStmtKind::Switch { scrutinee, cases } => {
                self.compile_expr(scrutinee)?;
                let end = self.new_label();
                let case_labels: Vec<Label> = cases.iter().map(|_| self.new_label()).collect();
                let mut default = None;
                for (case, &label) in cases.iter().zip(&case_labels) {
                    let Some(value) = case.value else {
                        default = Some(label);
                        continue;
                    };
                    self.op(Opcode::CpTopSp, Qualifier::Stack, stack(-4, 4));
                    self.op(Opcode::Const, Qualifier::Int, Operand::Int(value));
                    self.emit(Instruction::bare(Opcode::Equal, Qualifier::IntInt));
                    self.jump(Opcode::Jnz, label);
                }
                self.jump(Opcode::Jmp, default.unwrap_or(end));

                self.frame.loops.push(LoopContext {
                    break_label: end,
                    continue_label: None,
                    depth: self.frame.depth,
                });
                for (case, &label) in cases.iter().zip(&case_labels) {
                    self.bind(label);
                    let result = self.compile_block(&case.body);
                    if result.is_err() {
                        self.frame.loops.pop();
                    }
                    result?;
                }
                self.frame.loops.pop();
                self.bind(end);
                self.pop(4);
            }
            TypedStmtKind::Return(value) => {
                if let Some(value) = value {
                    self.compile_expr(value)?;
                    let offset = self.frame.return_pos - self.frame.depth;
                    let size = self.frame.return_size;
                    self.op(Opcode::CpDownSp, Qualifier::Stack, stack(offset, size));
                    self.unwind_to(0);
                    self.frame.depth -= self.size_of(&value.ty);
                } else {
                    self.unwind_to(0);
                }
                if let Some(ret) = self.frame.ret_label {
                    self.jump(Opcode::Jmp, ret);
                }
            }
            TypedStmtKind::Break => {
                if let Some(ctx) = self.frame.loops.last() {
                    let (label, depth) = (ctx.break_label, ctx.depth);
                    self.unwind_to(depth);
                    self.jump(Opcode::Jmp, label);
                }
            }
            TypedStmtKind::Continue => {
                let target = self
                    .frame
                    .loops
                    .iter()
                    .rev()
                    .find_map(|ctx| ctx.continue_label.map(|l| (l, ctx.depth)));
                if let Some((label, depth)) = target {
                    self.unwind_to(depth);
                    self.jump(Opcode::Jmp, label);
                }
            }
            TypedStmtKind::Empty => {}
        }
        Ok(())
    }

    fn compile_loop_body(&mut self, body: &TypedStmt, end: Label, cont: Label) -> Result<(), CompileError> {
        self.frame.loops.push(LoopContext {
            break_label: end,
            continue_label: Some(cont),
            depth: self.frame.depth,
        });
        let result = self.compile_stmt(body);
        self.frame.loops.pop();
        result
    }

    /// Evaluate for side effects and drop the value.
    fn compile_discarded(&mut self, e: &TypedExpr) -> Result<(), CompileError> {
        self.compile_expr(e)?;
        let size = self.size_of(&e.ty);
        self.pop(size);
        Ok(())
    }

    // ── Expressions ───────────────────────────────────────────────

    fn compile_expr(&mut self, expr: &TypedExpr) -> Result<(), CompileError> {
        match &expr.kind {
            TypedExprKind::Int(v) => {
                self.op(Opcode::Const, Qualifier::Int, Operand::Int(*v));
                self.frame.depth += 4;
            }
            TypedExprKind::Float(v) => {
                self.op(Opcode::Const, Qualifier::Float, Operand::Float(*v));
                self.frame.depth += 4;
            }
            TypedExprKind::Str(s) => {
                self.op(Opcode::Const, Qualifier::String, Operand::String(s.clone()));
                self.frame.depth += 4;
            }
            TypedExprKind::Object(v) => {
                self.op(Opcode::Const, Qualifier::Object, Operand::Object(*v));
                self.frame.depth += 4;
            }
            TypedExprKind::Load(place) => self.load(place),
            TypedExprKind::Vector(x, y, z) => {
                self.compile_expr(x)?;
                self.compile_expr(y)?;
                self.compile_expr(z)?;
            }
            TypedExprKind::Binary { op, left, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                let qualifier = operand_pair(&left.ty, &right.ty);
                let operand = if qualifier == Qualifier::StructStruct {
                    Operand::Size(u16::try_from(self.size_of(&left.ty)).unwrap_or(u16::MAX))
                } else {
                    Operand::None
                };
                self.op(binary_opcode(*op), qualifier, operand);
                self.frame.depth -= self.size_of(&left.ty) + self.size_of(&right.ty);
                self.frame.depth += self.size_of(&expr.ty);
            }
            TypedExprKind::Logical { and, left, right } => {
                self.compile_expr(left)?;
                let skip = self.new_label();
                self.op(Opcode::CpTopSp, Qualifier::Stack, stack(-4, 4));
                self.jump(if *and { Opcode::Jz } else { Opcode::Jnz }, skip);
                self.compile_expr(right)?;
                let opcode = if *and { Opcode::LogAnd } else { Opcode::LogOr };
                self.emit(Instruction::bare(opcode, Qualifier::IntInt));
                self.frame.depth -= 4;
                self.bind(skip);
            }
            TypedExprKind::Unary { op, operand } => {
                self.compile_expr(operand)?;
                let opcode = match op {
                    UnaryOp::Neg => Opcode::Neg,
                    UnaryOp::Not => Opcode::Not,
                    UnaryOp::Comp => Opcode::Comp,
                };
                let q = operand.ty.qualifier().unwrap_or(Qualifier::Int);
                self.emit(Instruction::bare(opcode, q));
            }
            TypedExprKind::IncDec {
                place,
                increment,
                prefix,
            } => self.compile_inc_dec(place, *increment, *prefix),
            TypedExprKind::Assign { place, value } => {
                self.compile_expr(value)?;
                self.store(place);
            }
            TypedExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.compile_expr(cond)?;
                let else_label = self.new_label();
                let end = self.new_label();
                self.jump(Opcode::Jz, else_label);
                self.frame.depth -= 4;
                let base = self.frame.depth;
                self.compile_expr(then_expr)?;
                self.jump(Opcode::Jmp, end);
                self.bind(else_label);
                self.frame.depth = base;
                self.compile_expr(else_expr)?;
                self.bind(end);
            }
            TypedExprKind::CallUser { func, args } => {
                let ret = self.prog.functions[*func].return_type.clone();
                self.reserve(&ret);
                for arg in args.iter().rev() {
                    self.compile_expr(arg)?;
                }
                let label = self.func_label(*func, expr.span);
                self.jump(Opcode::Jsr, label);
                let popped: i32 = args.iter().map(|a| self.size_of(&a.ty)).sum();
                self.frame.depth -= popped;
            }
            TypedExprKind::CallEngine { routine, args } => {
                let mut popped = 0;
                for arg in args.iter().rev() {
                    match arg {
                        Arg::Value(e) => {
                            self.compile_expr(e)?;
                            popped += self.size_of(&e.ty);
                        }
                        Arg::Action(e) => self.compile_closure(e)?,
                    }
                }
                self.op(
                    Opcode::Action,
                    Qualifier::None,
                    Operand::Action {
                        routine: *routine,
                        argc: u8::try_from(args.len()).unwrap_or(u8::MAX),
                    },
                );
                self.frame.depth += self.size_of(&expr.ty) - popped;
            }
            TypedExprKind::FieldOf { object, offset } => {
                self.compile_expr(object)?;
                let size = self.size_of(&object.ty);
                let keep = self.size_of(&expr.ty);
                let narrow = |n: i32| i16::try_from(n).unwrap_or(i16::MAX);
                self.op(
                    Opcode::Destruct,
                    Qualifier::Stack,
                    Operand::Destruct {
                        size: narrow(size),
                        offset: narrow(bytes(*offset)),
                        keep: narrow(keep),
                    },
                );
                self.frame.depth -= size - keep;
            }
        }
        Ok(())
    }

    fn compile_inc_dec(&mut self, place: &Place, increment: bool, prefix: bool) {
        let global_bp = matches!(place.var, VarRef::Global(_)) && !self.frame.in_globals;
        if global_bp {
            let VarRef::Global(id) = place.var else { return };
            let offset = self.bp_offset(self.global_pos(id) + bytes(place.offset));
            let opcode = if increment { Opcode::IncIBp } else { Opcode::DecIBp };
            if prefix {
                self.op(opcode, Qualifier::Int, Operand::Offset(offset));
                self.load(place);
            } else {
                self.load(place);
                self.op(opcode, Qualifier::Int, Operand::Offset(offset));
            }
            return;
        }

        let opcode = if increment { Opcode::IncISp } else { Opcode::DecISp };
        let sp_offset = |gen: &Self| match place.var {
            VarRef::Local(id) => gen.local_offset(place, id),
            VarRef::Global(id) => gen.global_pos(id) + bytes(place.offset) - gen.frame.depth,
        };
        if prefix {
            let offset = sp_offset(&*self);
            self.op(opcode, Qualifier::Int, Operand::Offset(offset));
            self.load(place);
        } else {
            self.load(place);
            let offset = sp_offset(&*self);
            self.op(opcode, Qualifier::Int, Operand::Offset(offset));
        }
    }

    /// Deferred `action` argument: saved state, a jump over the body, and
    /// the body itself as an expression statement ending in `RETN`.
    fn compile_closure(&mut self, e: &TypedExpr) -> Result<(), CompileError> {
        let over = self.new_label();
        self.op(
            Opcode::StoreState,
            Qualifier::STATE,
            Operand::StoreState {
                bp: self.globals_size,
                sp: self.frame.depth + self.frame.params_size,
            },
        );
        self.jump(Opcode::Jmp, over);
        self.compile_discarded(e)?;
        self.emit(Instruction::bare(Opcode::Retn, Qualifier::None));
        self.bind(over);
        Ok(())
    }
}
