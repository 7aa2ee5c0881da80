//! Stack simulation and control-flow structuring.
//!
//! A subroutine is walked in address order. Straight-line instructions are
//! simulated against the typed [`Frame`]; jump shapes are matched against the
//! statement forms the code generator produces:
//!
//! ```text
//! if        c; JZ else; then; [JMP end; else: ...]; end:
//! while     top: c; JZ end; body; JMP top; end:
//! for       top: c; JZ end; body; cont: step; JMP top; end:
//! do-while  top: body; cont: c; JNZ top
//! switch    s; (CPTOPSP -4,4; CONSTI k; EQUALII; JNZ case)*; JMP default|end; ...; end: MOVSP -4
//! a && b    a; CPTOPSP -4,4; JZ skip; b; LOGANDII; skip:
//! ```
//!
//! Any other jump is reported as unstructurable.

use std::collections::{HashMap, VecDeque};
use std::ops::Range;

use super::depth::{binary_result, engine_size, is_binary, operand_sizes, DepthMap};
use super::stack::{field_expr, DCase, DExpr, DStmt, Frame, Item, Slot, Types, VarId, VarKind, Vars};
use super::subroutine::{Layout, SubKind};
use super::DecompileError;
use crate::ncs::{Instruction, Opcode, Operand, Program, Qualifier};
use crate::nss::ast::{BinOp, Expr, ExprKind, UnaryOp};
use crate::nss::declarations::ConstValue;
use crate::nss::{DeclarationTable, NssType};

/// What the depth pass learned about one subroutine, plus the signature
/// its first caller implied.
#[derive(Debug, Clone)]
pub struct SubInfo {
    pub params: i32,
    pub ret: i32,
    pub depths: DepthMap,
    pub param_types: Option<Vec<NssType>>,
    pub return_type: Option<NssType>,
}

#[derive(Debug, Clone)]
pub struct FunctionIr {
    pub sub: usize,
    /// Parameter 0 first.
    pub params: Vec<VarId>,
    pub return_type: NssType,
    pub body: Vec<DStmt>,
}

/// Program-wide decompilation state.
pub struct Context<'p> {
    pub program: &'p Program,
    pub decls: &'p DeclarationTable,
    pub layout: &'p Layout,
    pub subs: Vec<SubInfo>,
    pub vars: Vars,
    pub types: Types,
    pub globals: Frame,
    pub globals_size: i32,
    pub global_decls: Vec<DStmt>,
    pub functions: Vec<FunctionIr>,
    queue: VecDeque<usize>,
    seen: Vec<bool>,
    /// Loop header → every instruction that jumps back to it.
    back_edges: HashMap<usize, Vec<usize>>,
}

impl<'p> Context<'p> {
    pub fn new(program: &'p Program, decls: &'p DeclarationTable, layout: &'p Layout, subs: Vec<SubInfo>) -> Self {
        let mut back_edges: HashMap<usize, Vec<usize>> = HashMap::new();
        for (j, ins) in program.iter().enumerate() {
            if matches!(ins.opcode, Opcode::Jmp | Opcode::Jnz | Opcode::Jz) {
                if let Some(t) = ins.jump_target().filter(|&t| t <= j) {
                    back_edges.entry(t).or_default().push(j);
                }
            }
        }
        let n = subs.len();
        Self {
            program,
            decls,
            layout,
            subs,
            vars: Vars::default(),
            types: Types::default(),
            globals: Frame::new(0),
            globals_size: 0,
            global_decls: Vec::new(),
            functions: Vec::new(),
            queue: VecDeque::new(),
            seen: vec![false; n],
            back_edges,
        }
    }

    fn enqueue(&mut self, sub: usize) {
        if let Some(seen) = self.seen.get_mut(sub) {
            if !*seen {
                *seen = true;
                self.queue.push_back(sub);
            }
        }
    }

    /// Globals first, then every subroutine in call order from the entry
    /// point, then anything only reachable from dead code.
    pub fn run(&mut self) -> Result<(), DecompileError> {
        let layout = self.layout;
        if let (Some(start), Some(save_bp)) = (layout.globals, layout.save_bp) {
            let sub = layout
                .sub_at(start)
                .ok_or_else(|| DecompileError::unsupported(start, "globals routine is not a subroutine"))?;
            self.seen[sub] = true;
            self.decompile_globals(sub, save_bp)?;
        }

        let entry = layout
            .sub_at(layout.entry)
            .ok_or_else(|| DecompileError::unsupported(layout.entry, "entry point is not a subroutine"))?;
        let info = &mut self.subs[entry];
        info.param_types = Some(Vec::new());
        info.return_type = Some(if layout.conditional { NssType::Int } else { NssType::Void });
        self.seen[entry] = true;
        self.queue.push_front(entry);

        loop {
            while let Some(sub) = self.queue.pop_front() {
                let function = Walker::function(self, sub)?;
                self.functions.push(function);
            }
            let rest = (0..self.subs.len()).find(|&s| !self.seen[s] && layout.subs[s].kind != SubKind::Globals);
            match rest {
                Some(sub) => {
                    log::debug!("subroutine at {} is never called from live code", layout.subs[sub].start());
                    self.enqueue(sub);
                }
                None => break,
            }
        }
        self.functions.sort_by_key(|f| layout.subs[f.sub].start());
        Ok(())
    }

    fn decompile_globals(&mut self, sub: usize, save_bp: usize) -> Result<(), DecompileError> {
        let range = self.layout.subs[sub].range.clone();
        let depths = self.subs[sub].depths.clone();
        let size = depths.get(save_bp).unwrap_or(0);
        let mut walker = Walker::new(self, depths, Frame::new(0), usize::MAX);
        walker.in_globals = true;
        let mut decls = Vec::new();
        walker.walk(range.start..save_bp, &mut decls)?;
        walker.flush(&mut decls)?;
        let frame = std::mem::take(&mut walker.frame);
        if let Some(bad) = decls.iter().find(|s| !matches!(s, DStmt::Decl { .. })) {
            log::debug!("globals routine holds a statement: {bad:?}");
            return Err(DecompileError::unsupported(range.start, "globals routine runs statements"));
        }
        self.globals = frame;
        self.globals_size = size;
        self.global_decls = decls;
        Ok(())
    }
}

// ── Walker ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct LoopCtx {
    brk: usize,
    /// `None` for a switch: `continue` belongs to an enclosing loop.
    cont: Option<usize>,
    /// The back-edge jump itself, which a `continue` may also target.
    cont_alt: Option<usize>,
}

enum Mode {
    Statements,
    /// Inside an expression: emitting a statement is an error.
    Expression,
    /// A deferred-action body: collects its single expression.
    Capture(Vec<DExpr>),
}

enum Exit {
    Break,
    Continue,
    Return,
}

struct Walker<'c, 'p> {
    cx: &'c mut Context<'p>,
    program: &'p Program,
    depths: DepthMap,
    frame: Frame,
    epilogue: usize,
    loops: Vec<LoopCtx>,
    mode: Mode,
    /// Deferred-action arguments waiting for their `ACTION`.
    closures: Vec<DExpr>,
    pending_return: Option<DExpr>,
    in_globals: bool,
    at: usize,
}

fn bin_op(opcode: Opcode) -> Option<BinOp> {
    Some(match opcode {
        Opcode::Add => BinOp::Add,
        Opcode::Sub => BinOp::Sub,
        Opcode::Mul => BinOp::Mul,
        Opcode::Div => BinOp::Div,
        Opcode::Mod => BinOp::Mod,
        Opcode::Equal => BinOp::Eq,
        Opcode::NEqual => BinOp::Ne,
        Opcode::Lt => BinOp::Lt,
        Opcode::Leq => BinOp::Le,
        Opcode::Gt => BinOp::Gt,
        Opcode::Geq => BinOp::Ge,
        Opcode::LogAnd => BinOp::And,
        Opcode::LogOr => BinOp::Or,
        Opcode::BoolAnd => BinOp::BitAnd,
        Opcode::IncOr => BinOp::BitOr,
        Opcode::ExcOr => BinOp::BitXor,
        Opcode::ShLeft => BinOp::Shl,
        Opcode::ShRight => BinOp::Shr,
        Opcode::UShRight => BinOp::UShr,
        _ => return None,
    })
}

fn binary_type(opcode: Opcode, q: Qualifier) -> NssType {
    if binary_result(opcode, q) == 12 {
        return NssType::Vector;
    }
    match (opcode, q) {
        (Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div, Qualifier::FloatFloat | Qualifier::IntFloat | Qualifier::FloatInt) => {
            NssType::Float
        }
        (Opcode::Add, Qualifier::StringString) => NssType::String,
        _ => NssType::Int,
    }
}

fn literal(ins: &Instruction) -> Option<(DExpr, NssType)> {
    Some(match &ins.operand {
        Operand::Int(v) => (DExpr::Int(*v), NssType::Int),
        Operand::Float(v) => (DExpr::Float(*v), NssType::Float),
        Operand::String(s) => (DExpr::Str(s.clone()), NssType::String),
        Operand::Object(v) => (DExpr::Object(*v), NssType::Object),
        _ => return None,
    })
}

fn stack_operand(ins: &Instruction) -> Option<(i32, i32)> {
    match ins.operand {
        Operand::Stack { offset, size } => Some((offset, i32::from(size))),
        _ => None,
    }
}

fn is_short_circuit_copy(ins: &Instruction) -> bool {
    ins.opcode == Opcode::CpTopSp && ins.operand == (Operand::Stack { offset: -4, size: 4 })
}

fn target_var(e: &DExpr) -> Option<VarId> {
    match e {
        DExpr::Var(v) => Some(*v),
        DExpr::Field(base, _) => target_var(base),
        _ => None,
    }
}

/// An engine default written in the declaration file, compared with the
/// argument actually pushed.
fn default_matches(default: &Expr, arg: &DExpr, decls: &DeclarationTable) -> bool {
    match (&default.kind, arg) {
        (ExprKind::IntLit(x), DExpr::Int(y)) | (ExprKind::ObjectLit(x), DExpr::Object(y)) => x == y,
        #[allow(clippy::cast_precision_loss)]
        (ExprKind::IntLit(x), DExpr::Float(y)) => (*x as f32).to_bits() == y.to_bits(),
        (ExprKind::FloatLit(x), DExpr::Float(y)) => x.to_bits() == y.to_bits(),
        (ExprKind::StringLit(x), DExpr::Str(y)) => x == y,
        (ExprKind::Vector(x, y, z), DExpr::Vector(a, b, c)) => {
            default_matches(x, a, decls) && default_matches(y, b, decls) && default_matches(z, c, decls)
        }
        (ExprKind::Ident(name), _) => match (decls.constant(name), arg) {
            (Some(ConstValue::Int(x)), DExpr::Int(y)) | (Some(ConstValue::Object(x)), DExpr::Object(y)) => x == y,
            (Some(ConstValue::Float(x)), DExpr::Float(y)) => x.to_bits() == y.to_bits(),
            (Some(ConstValue::String(x)), DExpr::Str(y)) => x == y,
            _ => false,
        },
        _ => false,
    }
}

impl<'c, 'p> Walker<'c, 'p> {
    fn new(cx: &'c mut Context<'p>, depths: DepthMap, frame: Frame, epilogue: usize) -> Self {
        let program = cx.program;
        Self {
            cx,
            program,
            depths,
            frame,
            epilogue,
            loops: Vec::new(),
            mode: Mode::Statements,
            closures: Vec::new(),
            pending_return: None,
            in_globals: false,
            at: 0,
        }
    }

    fn function(cx: &'c mut Context<'p>, sub: usize) -> Result<FunctionIr, DecompileError> {
        let program = cx.program;
        let ins = &program.instructions;
        let range = cx.layout.subs[sub].range.clone();
        let info = cx.subs[sub].clone();
        let (p, r) = (info.params, info.ret);

        let return_type = match info.return_type {
            Some(ty) if i64::from(cx.types.size_of(&ty)) == i64::from(r) => ty,
            _ => match r {
                0 => NssType::Void,
                4 => NssType::Int,
                _ => cx.types.aggregate(&vec![NssType::Int; usize::try_from(r / 4).unwrap_or(0)]),
            },
        };
        let param_types = info
            .param_types
            .filter(|types| types.iter().map(|t| i64::from(cx.types.size_of(t))).sum::<i64>() == i64::from(p))
            .unwrap_or_else(|| vec![NssType::Int; usize::try_from(p / 4).unwrap_or(0)]);

        let mut frame = Frame::new(-(p + r));
        if r > 0 {
            let v = cx.vars.add(VarKind::Return, return_type.clone());
            frame.push(r, Item::Var(v));
        }
        for ty in param_types.iter().rev() {
            let size = i32::try_from(cx.types.size_of(ty)).unwrap_or(4);
            let v = cx.vars.add(VarKind::Param, ty.clone());
            frame.push(size, Item::Var(v));
        }

        let end = range.end;
        let unwinds_params = p > 0
            && end >= range.start + 2
            && ins[end - 2].movsp_offset() == Some(-p)
            && info.depths.get(end - 2) == Some(0);
        let epilogue = if unwinds_params { end - 2 } else { end - 1 };

        let mut walker = Walker::new(cx, info.depths, frame, epilogue);
        let mut body = Vec::new();
        walker.walk(range.start..epilogue, &mut body)?;
        walker.flush(&mut body)?;

        let vars = &walker.cx.vars;
        let params = walker
            .frame
            .slots
            .iter()
            .rev()
            .filter_map(|s| match s.item {
                Item::Var(v) if vars.get(v).kind == VarKind::Param => Some(v),
                _ => None,
            })
            .collect();
        log::debug!("decompiled subroutine at {} ({} statements)", range.start, body.len());
        Ok(FunctionIr {
            sub,
            params,
            return_type,
            body,
        })
    }

    // ── Structure ─────────────────────────────────────────────────

    fn walk(&mut self, range: Range<usize>, out: &mut Vec<DStmt>) -> Result<(), DecompileError> {
        let mut i = range.start;
        while i < range.end {
            self.at = i;
            let Some(depth) = self.depths.get(i) else {
                i += 1;
                continue;
            };
            if depth != self.frame.top() {
                return Err(DecompileError::stack(
                    i,
                    format!("simulated stack holds {} bytes where {depth} are expected", self.frame.top()),
                ));
            }
            if let Some(j) = self.back_edge(i, range.end) {
                i = self.walk_loop(i, j, out)?;
                continue;
            }
            i = self.step(i, range.end, out)?;
        }
        Ok(())
    }

    /// Furthest jump back to `header` inside the current range.
    fn back_edge(&self, header: usize, end: usize) -> Option<usize> {
        self.cx
            .back_edges
            .get(&header)?
            .iter()
            .copied()
            .filter(|&j| j >= header && j < end)
            .max()
    }

    /// Walk a nested statement range; the frame is restored afterwards.
    fn block(&mut self, range: Range<usize>) -> Result<Vec<DStmt>, DecompileError> {
        let saved = self.frame.slots.clone();
        let mut out = Vec::new();
        let result = self.walk(range, &mut out);
        self.restore(saved);
        result?;
        Ok(out)
    }

    /// Evaluate a range that leaves exactly one value.
    fn eval(&mut self, range: Range<usize>) -> Result<(DExpr, NssType), DecompileError> {
        let start = range.start;
        let saved = self.frame.slots.clone();
        let mode = std::mem::replace(&mut self.mode, Mode::Expression);
        let result = self.walk(range, &mut Vec::new());
        self.mode = mode;
        let value = match (result, self.frame.slots.pop()) {
            (Err(e), _) => Err(e),
            (Ok(()), Some(Slot { item: Item::Value(e, ty), .. })) if self.frame.slots.len() >= saved.len() => Ok((e, ty)),
            _ => Err(DecompileError::stack(start, "expression does not leave a value")),
        };
        self.restore(saved);
        value
    }

    /// Walk a range holding one expression statement and return that expression.
    fn capture(&mut self, range: Range<usize>) -> Result<DExpr, DecompileError> {
        let start = range.start;
        let saved = self.frame.slots.clone();
        let mode = std::mem::replace(&mut self.mode, Mode::Capture(Vec::new()));
        let result = self.walk(range, &mut Vec::new());
        let captured = std::mem::replace(&mut self.mode, mode);
        self.restore(saved);
        result?;
        match captured {
            Mode::Capture(mut exprs) if exprs.len() == 1 => exprs.pop().ok_or_else(|| DecompileError::stack(start, "empty capture")),
            _ => Err(DecompileError::unsupported(start, "expected a single expression statement")),
        }
    }

    fn restore(&mut self, saved: Vec<Slot>) {
        self.frame.slots = saved;
        self.frame.normalize(&self.cx.vars, &self.cx.types);
    }

    fn walk_loop(&mut self, i: usize, j: usize, out: &mut Vec<DStmt>) -> Result<usize, DecompileError> {
        let program = self.program;
        let ins = &program.instructions;
        let base = self.frame.top();
        self.flush(out)?;

        let stmt = match ins[j].opcode {
            Opcode::Jmp => {
                let cond_at = (i..j).find(|&k| {
                    ins[k].opcode == Opcode::Jz
                        && ins[k].jump_target() == Some(j + 1)
                        && self.depths.get(k) == Some(base + 4)
                });
                let (cond, body_start) = match cond_at {
                    Some(k) => (Some(self.eval(i..k)?.0), k + 1),
                    None => (None, i),
                };
                let step_at = self
                    .find_step(body_start, j, base)
                    .or_else(|| self.trailing_step(body_start, j, base));
                self.loops.push(LoopCtx {
                    brk: j + 1,
                    cont: Some(step_at.unwrap_or(i)),
                    cont_alt: Some(j),
                });
                let body = self.block(body_start..step_at.unwrap_or(j));
                self.loops.pop();
                let body = body?;
                match (step_at, cond) {
                    (Some(t), cond) => {
                        let step = self.capture(t..j)?;
                        let init = match out.last() {
                            Some(DStmt::Expr(DExpr::Assign { .. })) => match out.pop() {
                                Some(DStmt::Expr(e)) => Some(e),
                                _ => None,
                            },
                            _ => None,
                        };
                        DStmt::For {
                            init,
                            cond,
                            step: Some(step),
                            body,
                        }
                    }
                    (None, Some(cond)) if !self.continues_at(body_start, j) => DStmt::While { cond, body },
                    (None, cond) => DStmt::For {
                        init: None,
                        cond,
                        step: None,
                        body,
                    },
                }
            }
            Opcode::Jnz => {
                let mut cond_start = None;
                for m in (i..j).rev() {
                    match self.depths.get(m) {
                        Some(d) if d == base => {
                            cond_start = Some(m);
                            break;
                        }
                        Some(d) if d > base => {}
                        _ => break,
                    }
                }
                let k = cond_start.ok_or(DecompileError::Unstructurable { index: j })?;
                self.loops.push(LoopCtx {
                    brk: j + 1,
                    cont: Some(k),
                    cont_alt: None,
                });
                let body = self.block(i..k);
                self.loops.pop();
                let body = body?;
                let (cond, _) = self.eval(k..j)?;
                DStmt::DoWhile { body, cond }
            }
            _ => return Err(DecompileError::Unstructurable { index: j }),
        };
        self.emit(stmt, out)?;
        Ok(j + 1)
    }

    /// Start of a `for` step: a straight-line expression statement just
    /// before the back edge that some `continue` jumps to.
    fn find_step(&self, body_start: usize, j: usize, base: i32) -> Option<usize> {
        let program = self.program;
        let ins = &program.instructions;
        let mut best: Option<usize> = None;
        for m in body_start..j {
            if ins[m].opcode != Opcode::Jmp || !self.depths.is_reachable(m) {
                continue;
            }
            let Some(t) = ins[m].jump_target() else { continue };
            if t <= m || t >= j {
                continue;
            }
            // The jump over an else branch is not a continue, unless it is
            // the whole then branch.
            let skips_else = (body_start..m.saturating_sub(1))
                .any(|k| ins[k].opcode == Opcode::Jz && ins[k].jump_target() == Some(m + 1));
            if skips_else || self.depths.get(t) != Some(base) || self.depths.get(j) != Some(base) {
                continue;
            }
            if (t..j).any(|k| ins[k].opcode.is_jump() || ins[k].opcode == Opcode::StoreState) {
                continue;
            }
            best = Some(best.map_or(t, |b| b.min(t)));
        }
        best
    }

    /// Start of a `for` step that no `continue` marks: the statement between
    /// the body's scope cleanup and the back edge. Only a `MOVSP` popping
    /// reservations counts as that cleanup; a statement after a plain
    /// expression pop stays in a `while` body.
    fn trailing_step(&self, body_start: usize, j: usize, base: i32) -> Option<usize> {
        let program = self.program;
        let ins = &program.instructions;
        if j < body_start + 2 || self.depths.get(j) != Some(base) {
            return None;
        }
        let t = (body_start + 1..j).rev().find(|&t| {
            ins[t - 1].opcode == Opcode::MovSp && self.depths.is_reachable(t - 1) && self.depths.get(t) == Some(base)
        })?;
        if (t..j).any(|k| ins[k].opcode.is_jump() || ins[k].opcode == Opcode::StoreState || !self.depths.is_reachable(k)) {
            return None;
        }
        let cleanup = t - 1;
        if cleanup == body_start || !matches!(self.depths.get(cleanup), Some(d) if d > base) {
            return None;
        }
        if ins[cleanup - 1].opcode == Opcode::Jsr {
            return None;
        }
        // where the popped bytes were first pushed
        let opened = (body_start..cleanup)
            .rev()
            .find(|&k| self.depths.is_reachable(k) && self.depths.get(k) == Some(base))?;
        (ins[opened].opcode == Opcode::RsAdd).then_some(t)
    }

    /// Some `continue` in the body jumps straight to the back edge, which only
    /// a `for` without a step produces.
    fn continues_at(&self, body_start: usize, j: usize) -> bool {
        let program = self.program;
        let ins = &program.instructions;
        (body_start..j).any(|m| {
            ins[m].opcode == Opcode::Jmp
                && ins[m].jump_target() == Some(j)
                && self.depths.is_reachable(m)
                && !(body_start..m).any(|k| ins[k].opcode == Opcode::Jz && ins[k].jump_target() == Some(m + 1))
        })
    }

    /// `target` is where a `break`, a `continue` or a `return` would land.
    fn leaves_to(&self, target: usize) -> bool {
        let cont = self.loops.iter().rev().find_map(|ctx| ctx.cont);
        self.loops.last().is_some_and(|ctx| ctx.brk == target) || cont == Some(target) || target == self.epilogue
    }

    fn classify_exit(&self, target: usize) -> Option<Exit> {
        if self.loops.last().is_some_and(|ctx| ctx.brk == target) {
            return Some(Exit::Break);
        }
        let cont = self.loops.iter().rev().find(|ctx| ctx.cont.is_some());
        if cont.is_some_and(|ctx| ctx.cont == Some(target) || ctx.cont_alt == Some(target)) {
            return Some(Exit::Continue);
        }
        if target == self.epilogue {
            return Some(Exit::Return);
        }
        None
    }

    fn exit(&mut self, i: usize, target: usize, out: &mut Vec<DStmt>) -> Result<(), DecompileError> {
        let stmt = match self.classify_exit(target) {
            Some(Exit::Break) => DStmt::Break,
            Some(Exit::Continue) => DStmt::Continue,
            Some(Exit::Return) => DStmt::Return(self.pending_return.take()),
            None => return Err(DecompileError::Unstructurable { index: i }),
        };
        self.flush(out)?;
        self.emit(stmt, out)
    }

    fn conditional(&mut self, i: usize, end: usize, out: &mut Vec<DStmt>) -> Result<usize, DecompileError> {
        let program = self.program;
        let ins = &program.instructions;
        let x = ins[i].jump_target().unwrap_or(0);
        if x <= i || x > end {
            return Err(DecompileError::Unstructurable { index: i });
        }
        let (cond, _) = self.take_top(i, 4)?;
        let base = self.frame.top();

        let skip = ins
            .get(x - 1)
            .filter(|j| j.opcode == Opcode::Jmp && x - 1 > i)
            .and_then(Instruction::jump_target)
            .filter(|&y| y >= x && y <= end);

        if let Some(y) = skip {
            if let Some(d) = self.depths.get(x - 1).filter(|&d| d > base) {
                let (then_expr, ty) = self.eval(i + 1..x - 1)?;
                let (else_expr, _) = self.eval(x..y)?;
                let value = DExpr::Ternary {
                    cond: Box::new(cond),
                    then_expr: Box::new(then_expr),
                    else_expr: Box::new(else_expr),
                };
                self.frame.push(d - base, Item::Value(value, ty));
                return Ok(y);
            }
            // A dead jump at the end of the then branch can only skip an else.
            let dead = !self.depths.is_reachable(x - 1);
            if dead || !self.leaves_to(y) {
                self.flush(out)?;
                let then_branch = self.block(i + 1..x - 1)?;
                let else_branch = self.block(x..y)?;
                self.emit(
                    DStmt::If {
                        cond,
                        then_branch,
                        else_branch: Some(else_branch),
                    },
                    out,
                )?;
                return Ok(y);
            }
        }

        self.flush(out)?;
        let then_branch = self.block(i + 1..x)?;
        self.emit(
            DStmt::If {
                cond,
                then_branch,
                else_branch: None,
            },
            out,
        )?;
        Ok(x)
    }

    fn short_circuit(&mut self, i: usize, end: usize) -> Result<Option<usize>, DecompileError> {
        let program = self.program;
        let ins = &program.instructions;
        let Some(branch) = ins.get(i + 1) else { return Ok(None) };
        let Some(x) = branch.jump_target() else { return Ok(None) };
        if !is_short_circuit_copy(&ins[i]) || x <= i + 2 || x > end {
            return Ok(None);
        }
        let op = match (branch.opcode, ins.get(x - 1).map(|c| (c.opcode, c.qualifier))) {
            (Opcode::Jz, Some((Opcode::LogAnd, Qualifier::IntInt))) => BinOp::And,
            (Opcode::Jnz, Some((Opcode::LogOr, Qualifier::IntInt))) => BinOp::Or,
            _ => return Ok(None),
        };
        let (right, _) = self.eval(i + 2..x - 1)?;
        let (left, _) = self.take_top(i, 4)?;
        let value = DExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
        self.frame.push(4, Item::Value(value, NssType::Int));
        Ok(Some(x))
    }

    fn switch(&mut self, i: usize, end: usize, out: &mut Vec<DStmt>) -> Result<Option<usize>, DecompileError> {
        let program = self.program;
        let ins = &program.instructions;
        let quad = |m: usize| -> Option<(i32, usize)> {
            let value = match (ins.get(m), ins.get(m + 1), ins.get(m + 2), ins.get(m + 3)) {
                (Some(cp), Some(k), Some(eq), Some(jnz))
                    if is_short_circuit_copy(cp)
                        && k.opcode == Opcode::Const
                        && eq.opcode == Opcode::Equal
                        && eq.qualifier == Qualifier::IntInt
                        && jnz.opcode == Opcode::Jnz =>
                {
                    match k.operand {
                        Operand::Int(v) => v,
                        _ => return None,
                    }
                }
                _ => return None,
            };
            Some((value, ins[m + 3].jump_target()?))
        };
        if i + 4 >= end || quad(i).is_none() {
            return Ok(None);
        }

        let mut cases = Vec::new();
        let mut m = i;
        while m + 4 < end {
            let Some(case) = quad(m) else { break };
            cases.push(case);
            m += 4;
        }
        let default = ins
            .get(m)
            .filter(|j| j.opcode == Opcode::Jmp && m < end)
            .and_then(Instruction::jump_target)
            .ok_or(DecompileError::Unstructurable { index: m })?;

        let (scrutinee, _) = self.take_top(i, 4)?;
        self.frame.push(4, Item::Hidden);
        let depth = self.frame.top();
        self.flush(out)?;

        let first_body = m + 1;
        let last_label = cases.iter().map(|c| c.1).chain([default]).max().unwrap_or(first_body);
        let candidates: Vec<usize> = (last_label..end)
            .filter(|&e| ins[e].movsp_offset() == Some(-4) && self.depths.get(e) == Some(depth))
            .collect();
        let jumped_to = |e: usize| (i..e).any(|k| ins[k].opcode == Opcode::Jmp && ins[k].jump_target() == Some(e));
        let returns = |e: usize| {
            ins.get(e + 1)
                .is_some_and(|n| n.opcode == Opcode::Jmp && n.jump_target() == Some(self.epilogue))
        };
        let end_at = candidates
            .iter()
            .find(|&&e| jumped_to(e))
            .or_else(|| candidates.iter().find(|&&e| !returns(e)))
            .or(candidates.first())
            .copied()
            .ok_or(DecompileError::Unstructurable { index: i })?;

        let mut labels: Vec<(Option<i32>, usize)> = cases.iter().map(|&(v, t)| (Some(v), t)).collect();
        if default != end_at {
            labels.push((None, default));
        }
        if labels.iter().any(|&(_, t)| t < first_body || t > end_at) {
            return Err(DecompileError::Unstructurable { index: i });
        }
        labels.sort_by_key(|&(_, t)| t);

        self.loops.push(LoopCtx {
            brk: end_at,
            cont: None,
            cont_alt: None,
        });
        let mut bodies = Vec::new();
        for (n, &(value, start)) in labels.iter().enumerate() {
            let stop = labels.get(n + 1).map_or(end_at, |l| l.1);
            match self.block(start..stop) {
                Ok(body) => bodies.push(DCase { value, body }),
                Err(e) => {
                    self.loops.pop();
                    return Err(e);
                }
            }
        }
        self.loops.pop();
        self.frame.slots.pop();
        self.emit(
            DStmt::Switch {
                scrutinee,
                cases: bodies,
            },
            out,
        )?;
        Ok(Some(end_at + 1))
    }

    // ── Simulation ────────────────────────────────────────────────

    fn step(&mut self, i: usize, end: usize, out: &mut Vec<DStmt>) -> Result<usize, DecompileError> {
        let program = self.program;
        let ins = &program.instructions[i];
        match ins.opcode {
            Opcode::Nop => {}
            Opcode::RsAdd => {
                let ty = NssType::from_qualifier(ins.qualifier)
                    .ok_or_else(|| DecompileError::stack(i, "RSADD without a cell type"))?;
                let kind = if self.in_globals { VarKind::Global } else { VarKind::Local };
                let v = self.cx.vars.add(kind, ty);
                self.frame.push(4, Item::Var(v));
            }
            Opcode::Const => {
                let (value, ty) = literal(ins).ok_or_else(|| DecompileError::stack(i, "constant without a value"))?;
                if let DExpr::Float(v) = &value {
                    if !v.is_finite() {
                        return Err(DecompileError::unsupported(i, format!("float constant {v} has no source literal")));
                    }
                }
                self.frame.push(4, Item::Value(value, ty));
            }
            Opcode::CpTopSp | Opcode::CpTopBp => {
                if ins.opcode == Opcode::CpTopSp {
                    if let Some(next) = self.short_circuit(i, end)? {
                        return Ok(next);
                    }
                    if let Some(next) = self.switch(i, end, out)? {
                        return Ok(next);
                    }
                }
                let (offset, size) = stack_operand(ins).ok_or_else(|| DecompileError::stack(i, "copy without a stack operand"))?;
                let (place, ty) = self.place(i, ins.opcode == Opcode::CpTopBp, offset, size)?;
                self.frame.push(size, Item::Value(place, ty));
            }
            Opcode::CpDownSp | Opcode::CpDownBp => {
                let (offset, size) = stack_operand(ins).ok_or_else(|| DecompileError::stack(i, "copy without a stack operand"))?;
                self.store(i, ins.opcode == Opcode::CpDownBp, offset, size)?;
            }
            Opcode::Action => match ins.operand {
                Operand::Action { routine, argc } => self.action(i, routine, argc, out)?,
                _ => return Err(DecompileError::stack(i, "ACTION without a routine")),
            },
            op if is_binary(op) => {
                let bin = bin_op(op).ok_or_else(|| DecompileError::stack(i, "unknown operator"))?;
                let (ls, rs) = operand_sizes(ins.qualifier, &ins.operand);
                let (right, _) = self.take_top(i, rs)?;
                let (left, _) = self.take_top(i, ls)?;
                let ty = binary_type(op, ins.qualifier);
                let value = DExpr::Binary {
                    op: bin,
                    left: Box::new(left),
                    right: Box::new(right),
                };
                self.frame.push(binary_result(op, ins.qualifier), Item::Value(value, ty));
            }
            Opcode::Neg | Opcode::Comp | Opcode::Not => {
                let op = match ins.opcode {
                    Opcode::Neg => UnaryOp::Neg,
                    Opcode::Comp => UnaryOp::Comp,
                    _ => UnaryOp::Not,
                };
                let (operand, ty) = self.take_top(i, 4)?;
                let value = DExpr::Unary {
                    op,
                    operand: Box::new(operand),
                };
                self.frame.push(4, Item::Value(value, ty));
            }
            Opcode::MovSp => {
                let n = ins.movsp_offset().unwrap_or(0);
                if n > 0 {
                    return Err(DecompileError::unsupported(i, "MOVSP grows the stack"));
                }
                self.discard(i, -n, out)?;
            }
            Opcode::Jmp => {
                let target = ins.jump_target().unwrap_or(0);
                self.exit(i, target, out)?;
            }
            Opcode::Jz => return self.conditional(i, end, out),
            Opcode::Jnz => return Err(DecompileError::Unstructurable { index: i }),
            Opcode::Jsr => {
                let target = ins.jump_target().unwrap_or(0);
                self.call(i, target, out)?;
            }
            Opcode::Destruct => match ins.operand {
                Operand::Destruct { size, offset, keep } => self.destruct(i, size, offset, keep)?,
                _ => return Err(DecompileError::stack(i, "DESTRUCT without a layout")),
            },
            Opcode::IncISp | Opcode::DecISp | Opcode::IncIBp | Opcode::DecIBp => return self.inc_dec(i, out),
            Opcode::StoreState => return self.closure(i),
            _ => return Err(DecompileError::unsupported(i, format!("unexpected {}", ins.opcode))),
        }
        Ok(i + 1)
    }

    /// Lvalue at an SP-relative (`bp == false`) or BP-relative offset.
    fn place(&mut self, i: usize, bp: bool, offset: i32, size: i32) -> Result<(DExpr, NssType), DecompileError> {
        let result = if bp {
            let pos = offset + self.cx.globals_size + 4;
            let cx = &mut *self.cx;
            cx.globals.place(pos, size, &mut cx.vars, &mut cx.types)
        } else {
            let pos = self.frame.top() + offset;
            self.frame.place(pos, size, &mut self.cx.vars, &mut self.cx.types)
        };
        result.map_err(|message| DecompileError::stack(i, message))
    }

    /// Pop `size` bytes as one value. Three separate floats form a vector.
    fn take_top(&mut self, i: usize, size: i32) -> Result<(DExpr, NssType), DecompileError> {
        let mut parts = Vec::new();
        let mut covered = 0;
        while covered < size {
            let slot = self
                .frame
                .slots
                .pop()
                .ok_or_else(|| DecompileError::stack(i, "stack underflow"))?;
            covered += slot.size;
            match slot.item {
                Item::Value(e, ty) => parts.push((e, ty)),
                Item::Var(_) => return Err(DecompileError::stack(i, "reserved variable used as an operand")),
                Item::Hidden => return Err(DecompileError::stack(i, "operand overlaps a hidden value")),
            }
        }
        if covered != size {
            return Err(DecompileError::stack(i, format!("operand of {size} bytes splits a value")));
        }
        parts.reverse();
        if parts.len() == 1 {
            return parts.pop().ok_or_else(|| DecompileError::stack(i, "stack underflow"));
        }
        if parts.len() == 3 && parts.iter().all(|(_, ty)| *ty == NssType::Float) {
            let mut it = parts.into_iter().map(|(e, _)| Box::new(e));
            if let (Some(x), Some(y), Some(z)) = (it.next(), it.next(), it.next()) {
                return Ok((DExpr::Vector(x, y, z), NssType::Vector));
            }
        }
        Err(DecompileError::stack(i, "separate values cannot form one operand"))
    }

    fn store(&mut self, i: usize, bp: bool, offset: i32, size: i32) -> Result<(), DecompileError> {
        let (target, _) = self.place(i, bp, offset, size)?;
        let (value, ty) = self.take_top(i, size)?;
        let returns = target_var(&target)
            .map(|v| self.cx.vars.root(v).0)
            .is_some_and(|root| self.cx.vars.get(root).kind == VarKind::Return);
        if returns {
            self.pending_return = Some(value);
            self.frame.push(size, Item::Hidden);
        } else {
            let assign = DExpr::Assign {
                target: Box::new(target),
                value: Box::new(value),
            };
            self.frame.push(size, Item::Value(assign, ty));
        }
        Ok(())
    }

    /// `MOVSP -n`: popped values become statements, popped reservations
    /// become declarations.
    fn discard(&mut self, i: usize, n: i32, out: &mut Vec<DStmt>) -> Result<(), DecompileError> {
        let mut popped = Vec::new();
        let mut covered = 0;
        while covered < n {
            let slot = self
                .frame
                .slots
                .pop()
                .ok_or_else(|| DecompileError::stack(i, "stack underflow"))?;
            covered += slot.size;
            popped.push(slot);
        }
        if covered != n {
            return Err(DecompileError::stack(i, format!("MOVSP -{n} splits a value")));
        }
        popped.reverse();

        if let Some((var, init)) = self.initializer(&popped) {
            self.flush_below_top(out)?;
            return self.declare(var, Some(init), out);
        }
        self.flush(out)?;
        for slot in popped {
            match slot.item {
                Item::Var(v) if !self.cx.vars.is_declared(v) => self.declare(v, None, out)?,
                Item::Var(_) | Item::Hidden => {}
                Item::Value(e, _) => self.emit(DStmt::Expr(e), out)?,
            }
        }
        Ok(())
    }

    /// `RSADD; value; CPDOWNSP; MOVSP`: an assignment into the reservation
    /// directly below is that variable's initializer.
    fn initializer(&self, popped: &[Slot]) -> Option<(VarId, DExpr)> {
        let [Slot {
            item: Item::Value(DExpr::Assign { target, value }, _),
            ..
        }] = popped
        else {
            return None;
        };
        let DExpr::Var(v) = **target else { return None };
        let var = self.cx.vars.get(v);
        let fresh = matches!(self.mode, Mode::Statements)
            && matches!(var.kind, VarKind::Local | VarKind::Global)
            && var.parent.is_none()
            && !var.declared;
        (fresh && self.frame.top_var() == Some(v)).then(|| (v, (**value).clone()))
    }

    fn declare(&mut self, var: VarId, init: Option<DExpr>, out: &mut Vec<DStmt>) -> Result<(), DecompileError> {
        self.cx.vars.mark_declared(var);
        self.emit(DStmt::Decl { var, init }, out)
    }

    fn undeclared(&self, slots: &[Slot]) -> Vec<VarId> {
        slots
            .iter()
            .filter_map(|s| match s.item {
                Item::Var(v) if !self.cx.vars.is_declared(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    /// Declare every reservation still waiting for its first statement.
    fn flush(&mut self, out: &mut Vec<DStmt>) -> Result<(), DecompileError> {
        if !matches!(self.mode, Mode::Statements) {
            return Ok(());
        }
        for v in self.undeclared(&self.frame.slots) {
            self.declare(v, None, out)?;
        }
        Ok(())
    }

    fn flush_below_top(&mut self, out: &mut Vec<DStmt>) -> Result<(), DecompileError> {
        let below = self.frame.slots.len().saturating_sub(1);
        for v in self.undeclared(&self.frame.slots[..below]) {
            self.declare(v, None, out)?;
        }
        Ok(())
    }

    fn emit(&mut self, stmt: DStmt, out: &mut Vec<DStmt>) -> Result<(), DecompileError> {
        match &mut self.mode {
            Mode::Statements => {
                out.push(stmt);
                Ok(())
            }
            Mode::Capture(exprs) => match stmt {
                DStmt::Expr(e) => {
                    exprs.push(e);
                    Ok(())
                }
                _ => Err(DecompileError::unsupported(self.at, "deferred action holds more than an expression")),
            },
            Mode::Expression => Err(DecompileError::unsupported(self.at, "statement inside an expression")),
        }
    }

    fn action(&mut self, i: usize, routine: u16, argc: u8, out: &mut Vec<DStmt>) -> Result<(), DecompileError> {
        let decls = self.cx.decls;
        let func = decls
            .by_routine(routine)
            .ok_or(DecompileError::Signature { index: i, routine })?;
        let mut args = Vec::new();
        for param in func.params.iter().take(usize::from(argc)) {
            if param.ty == NssType::Action {
                let closure = self
                    .closures
                    .pop()
                    .ok_or_else(|| DecompileError::stack(i, "action argument without a saved state"))?;
                args.push(closure);
            } else {
                let (arg, _) = self.take_top(i, engine_size(&param.ty))?;
                args.push(arg);
            }
        }
        while args.len() > func.required_params() {
            let n = args.len() - 1;
            let trailing_default = func
                .params
                .get(n)
                .and_then(|p| p.default.as_ref())
                .is_some_and(|d| default_matches(d, &args[n], decls));
            if !trailing_default {
                break;
            }
            args.pop();
        }

        let call = DExpr::CallEngine {
            name: func.name.clone(),
            args,
        };
        let size = engine_size(&func.return_type);
        if size == 0 {
            self.flush(out)?;
            return self.emit(DStmt::Expr(call), out);
        }
        self.frame.push(size, Item::Value(call, func.return_type.clone()));
        Ok(())
    }

    fn call(&mut self, i: usize, target: usize, out: &mut Vec<DStmt>) -> Result<(), DecompileError> {
        let callee = self
            .cx
            .layout
            .sub_at(target)
            .ok_or_else(|| DecompileError::unsupported(i, "call to an unknown subroutine"))?;
        let (p, r) = (self.cx.subs[callee].params, self.cx.subs[callee].ret);

        let mut args = Vec::new();
        let mut arg_types = Vec::new();
        let mut covered = 0;
        while covered < p {
            let slot = self
                .frame
                .slots
                .pop()
                .ok_or_else(|| DecompileError::stack(i, "stack underflow"))?;
            covered += slot.size;
            match slot.item {
                Item::Value(e, ty) => {
                    args.push(e);
                    arg_types.push(ty);
                }
                _ => return Err(DecompileError::stack(i, "call argument is not a value")),
            }
        }
        if covered != p {
            return Err(DecompileError::stack(i, "call arguments do not match the callee's parameters"));
        }

        let mut cells = Vec::new();
        let mut covered = 0;
        while covered < r {
            let slot = self
                .frame
                .slots
                .pop()
                .ok_or_else(|| DecompileError::stack(i, "stack underflow"))?;
            covered += slot.size;
            match slot.item {
                Item::Var(v) if !self.cx.vars.is_declared(v) => cells.push(self.cx.vars.get(v).ty.clone()),
                _ => return Err(DecompileError::stack(i, "result slot is not a fresh reservation")),
            }
        }
        if covered != r {
            return Err(DecompileError::stack(i, "result slot does not match the callee"));
        }
        cells.reverse();
        let return_type = match cells.len() {
            0 => NssType::Void,
            1 => cells.pop().unwrap_or(NssType::Int),
            _ => self.cx.types.aggregate(&cells),
        };

        let info = &mut self.cx.subs[callee];
        if info.param_types.is_none() {
            info.param_types = Some(arg_types);
        }
        if info.return_type.is_none() {
            info.return_type = Some(return_type.clone());
        }
        self.cx.enqueue(callee);

        let call = DExpr::CallUser { sub: callee, args };
        if r == 0 {
            self.flush(out)?;
            return self.emit(DStmt::Expr(call), out);
        }
        self.frame.push(r, Item::Value(call, return_type));
        Ok(())
    }

    fn destruct(&mut self, i: usize, size: i16, offset: i16, keep: i16) -> Result<(), DecompileError> {
        let (value, ty) = self.take_top(i, i32::from(size))?;
        let offset = u32::try_from(offset).map_err(|_| DecompileError::stack(i, "negative DESTRUCT offset"))?;
        let keep_bytes = u32::try_from(keep).map_err(|_| DecompileError::stack(i, "negative DESTRUCT size"))?;
        let (path, field_ty) = self
            .cx
            .types
            .field_path(&ty, offset, keep_bytes)
            .ok_or_else(|| DecompileError::stack(i, format!("no field of {ty} at offset {offset}")))?;
        self.frame.push(i32::from(keep), Item::Value(field_expr(value, path), field_ty));
        Ok(())
    }

    /// `INCISP`/`DECISP` and their BP forms, fused with the neighbouring
    /// load into a pre- or post-increment.
    fn inc_dec(&mut self, i: usize, out: &mut Vec<DStmt>) -> Result<usize, DecompileError> {
        let program = self.program;
        let ins = &program.instructions;
        let current = &ins[i];
        let increment = matches!(current.opcode, Opcode::IncISp | Opcode::IncIBp);
        let bp = matches!(current.opcode, Opcode::IncIBp | Opcode::DecIBp);
        let Operand::Offset(offset) = current.operand else {
            return Err(DecompileError::stack(i, "increment without an offset"));
        };
        let (target, _) = self.place(i, bp, offset, 4)?;
        let load = if bp { Opcode::CpTopBp } else { Opcode::CpTopSp };

        let loaded_before = i > 0 && ins[i - 1].opcode == load;
        if loaded_before {
            if let Some(Slot {
                item: Item::Value(top, _),
                ..
            }) = self.frame.slots.last_mut()
            {
                if *top == target {
                    *top = DExpr::IncDec {
                        target: Box::new(target),
                        increment,
                        prefix: false,
                    };
                    return Ok(i + 1);
                }
            }
        }

        let value = DExpr::IncDec {
            target: Box::new(target),
            increment,
            prefix: true,
        };
        let loads_after = ins
            .get(i + 1)
            .is_some_and(|n| n.opcode == load && n.operand == (Operand::Stack { offset, size: 4 }));
        if loads_after {
            self.frame.push(4, Item::Value(value, NssType::Int));
            return Ok(i + 2);
        }
        self.flush(out)?;
        self.emit(DStmt::Expr(value), out)?;
        Ok(i + 1)
    }

    /// `STORE_STATE`: simulate the deferred body as one expression and hold
    /// it for the `ACTION` that takes it.
    fn closure(&mut self, i: usize) -> Result<usize, DecompileError> {
        let closure = self
            .cx
            .layout
            .closure_at(i)
            .cloned()
            .ok_or_else(|| DecompileError::unsupported(i, "saved state without a body"))?;
        let expr = self.capture(closure.body.clone())?;
        self.closures.push(expr);
        Ok(closure.resume)
    }
}
