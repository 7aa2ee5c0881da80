use std::collections::HashMap;

use indexmap::IndexMap;

use super::ast::*;
use super::declarations::{ConstValue, DeclarationTable};
use super::error::CompileError;
use super::resolver::ResolvedUnit;
use super::types::NssType;

pub type FuncId = usize;
pub type LocalId = usize;
pub type GlobalId = usize;

pub const ENTRY_MAIN: &str = "main";
pub const ENTRY_CONDITIONAL: &str = "StartingConditional";

/// Result of type checking: every name resolved, every expression typed.
#[derive(Debug, Clone)]
pub struct TypedProgram {
    pub structs: StructTable,
    pub globals: Vec<GlobalVar>,
    pub functions: Vec<TypedFunction>,
    pub entry: Option<FuncId>,
}

impl TypedProgram {
    pub fn globals_size(&self) -> u32 {
        self.globals.iter().map(|g| self.structs.size_of(&g.ty)).sum()
    }

    pub fn is_conditional(&self) -> bool {
        self.entry
            .and_then(|id| self.functions.get(id))
            .is_some_and(|f| f.name == ENTRY_CONDITIONAL)
    }
}

#[derive(Debug, Clone)]
pub struct GlobalVar {
    pub name: String,
    pub ty: NssType,
    /// Byte position from the bottom of the globals block.
    pub offset: u32,
    pub init: Option<TypedExpr>,
}

#[derive(Debug, Clone)]
pub struct TypedFunction {
    pub name: String,
    pub return_type: NssType,
    /// Parameters occupy local ids `0..params.len()`.
    pub params: Vec<NssType>,
    pub defaults: Vec<Option<Expr>>,
    pub locals: Vec<LocalInfo>,
    pub body: Option<Vec<TypedStmt>>,
    pub span: Span,
    pub file: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LocalInfo {
    pub name: String,
    pub ty: NssType,
}

// ── Struct layouts ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct FieldLayout {
    pub name: String,
    pub ty: NssType,
    pub offset: u32,
}

#[derive(Debug, Clone, Default)]
pub struct StructTable {
    layouts: IndexMap<String, Vec<FieldLayout>>,
}

impl StructTable {
    pub fn get(&self, name: &str) -> Option<&[FieldLayout]> {
        self.layouts.get(name).map(Vec::as_slice)
    }

    /// Size in bytes; every cell is four bytes.
    pub fn size_of(&self, ty: &NssType) -> u32 {
        match ty {
            NssType::Void | NssType::Action => 0,
            NssType::Vector => 12,
            NssType::Struct(name) => self
                .get(name)
                .map_or(0, |fields| fields.iter().map(|f| self.size_of(&f.ty)).sum()),
            _ => 4,
        }
    }

    /// Cell types in stack order, flattening vectors and nested structs.
    pub fn cells(&self, ty: &NssType) -> Vec<NssType> {
        match ty {
            NssType::Void | NssType::Action => Vec::new(),
            NssType::Vector => vec![NssType::Float; 3],
            NssType::Struct(name) => self
                .get(name)
                .map(|fields| fields.iter().flat_map(|f| self.cells(&f.ty)).collect())
                .unwrap_or_default(),
            other => vec![other.clone()],
        }
    }

    /// Byte offset and type of `field` inside a value of type `ty`.
    pub fn field(&self, ty: &NssType, field: &str) -> Option<(u32, NssType)> {
        match ty {
            NssType::Vector => match field {
                "x" => Some((0, NssType::Float)),
                "y" => Some((4, NssType::Float)),
                "z" => Some((8, NssType::Float)),
                _ => None,
            },
            NssType::Struct(name) => self
                .get(name)?
                .iter()
                .find(|f| f.name == field)
                .map(|f| (f.offset, f.ty.clone())),
            _ => None,
        }
    }

    pub fn insert(&mut self, name: String, fields: Vec<FieldLayout>) {
        self.layouts.insert(name, fields);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<FieldLayout>)> {
        self.layouts.iter()
    }
}

// ── Typed tree ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TypedStmt {
    pub kind: TypedStmtKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum TypedStmtKind {
    Block(Vec<TypedStmt>),
    Decl {
        local: LocalId,
        init: Option<TypedExpr>,
    },
    If {
        cond: TypedExpr,
        then_branch: Box<TypedStmt>,
        else_branch: Option<Box<TypedStmt>>,
    },
    While {
        cond: TypedExpr,
        body: Box<TypedStmt>,
    },
    DoWhile {
        body: Box<TypedStmt>,
        cond: TypedExpr,
    },
    For {
        init: Option<TypedExpr>,
        cond: Option<TypedExpr>,
        step: Option<TypedExpr>,
        body: Box<TypedStmt>,
    },
    Switch {
        scrutinee: TypedExpr,
        cases: Vec<TypedCase>,
    },
    Return(Option<TypedExpr>),
    Break,
    Continue,
    Expr(TypedExpr),
    Empty,
}

#[derive(Debug, Clone)]
pub struct TypedCase {
    /// `None` for `default:`.
    pub value: Option<i32>,
    pub body: Vec<TypedStmt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarRef {
    Local(LocalId),
    Global(GlobalId),
}

/// A variable or a field inside one.
#[derive(Debug, Clone, PartialEq)]
pub struct Place {
    pub var: VarRef,
    pub offset: u32,
    pub ty: NssType,
}

#[derive(Debug, Clone)]
pub struct TypedExpr {
    pub kind: TypedExprKind,
    pub ty: NssType,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Arg {
    Value(TypedExpr),
    /// Deferred `action` argument, compiled as a closure.
    Action(TypedExpr),
}

#[derive(Debug, Clone)]
pub enum TypedExprKind {
    Int(i32),
    Float(f32),
    Str(String),
    Object(i32),
    Load(Place),
    Vector(Box<TypedExpr>, Box<TypedExpr>, Box<TypedExpr>),
    Binary {
        op: BinOp,
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    /// Short-circuit `&&` (`and == true`) or `||`.
    Logical {
        and: bool,
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<TypedExpr>,
    },
    IncDec {
        place: Place,
        increment: bool,
        prefix: bool,
    },
    Assign {
        place: Place,
        value: Box<TypedExpr>,
    },
    Ternary {
        cond: Box<TypedExpr>,
        then_expr: Box<TypedExpr>,
        else_expr: Box<TypedExpr>,
    },
    CallUser {
        func: FuncId,
        args: Vec<TypedExpr>,
    },
    CallEngine {
        routine: u16,
        args: Vec<Arg>,
    },
    /// Field of a temporary value.
    FieldOf {
        object: Box<TypedExpr>,
        offset: u32,
    },
}

// ── Checker ──────────────────────────────────────────────────────────

pub fn type_check(
    unit: &ResolvedUnit,
    decls: &DeclarationTable,
) -> Result<TypedProgram, CompileError> {
    let mut checker = Checker::new(decls);
    checker.check(unit)
}

struct Checker<'a> {
    decls: &'a DeclarationTable,
    structs: StructTable,
    globals: Vec<GlobalVar>,
    global_names: HashMap<String, GlobalId>,
    constants: HashMap<String, ConstValue>,
    functions: Vec<TypedFunction>,
    func_names: HashMap<String, FuncId>,
    file: Option<String>,

    // Per-function state
    scopes: Vec<IndexMap<String, LocalId>>,
    locals: Vec<LocalInfo>,
    return_type: NssType,
    loop_depth: usize,
    switch_depth: usize,
}

fn describe(ty: &NssType) -> String {
    format!("'{ty}'")
}

impl<'a> Checker<'a> {
    fn new(decls: &'a DeclarationTable) -> Self {
        Self {
            decls,
            structs: StructTable::default(),
            globals: Vec::new(),
            global_names: HashMap::new(),
            constants: HashMap::new(),
            functions: Vec::new(),
            func_names: HashMap::new(),
            file: None,
            scopes: Vec::new(),
            locals: Vec::new(),
            return_type: NssType::Void,
            loop_depth: 0,
            switch_depth: 0,
        }
    }

    fn err(&self, message: impl Into<String>, span: Span) -> CompileError {
        let e = CompileError::semantic(message, span);
        match &self.file {
            Some(f) => e.in_file(f),
            None => e,
        }
    }

    fn check(&mut self, unit: &ResolvedUnit) -> Result<TypedProgram, CompileError> {
        // Pass 1: structs and function signatures, so bodies and global
        // initializers may refer to anything declared anywhere in the unit.
        for src in &unit.units {
            self.file.clone_from(&src.name);
            for item in &src.script.items {
                match item {
                    Item::Struct(s) => self.declare_struct(s)?,
                    Item::Function(f) => self.declare_function(f)?,
                    Item::Global(_) => {}
                }
            }
        }

        // Pass 2: globals in declaration order.
        for src in &unit.units {
            self.file.clone_from(&src.name);
            for item in &src.script.items {
                if let Item::Global(decl) = item {
                    self.declare_global(decl)?;
                }
            }
        }

        // Pass 3: function bodies.
        for src in &unit.units {
            self.file.clone_from(&src.name);
            for item in &src.script.items {
                if let Item::Function(f) = item {
                    if let Some(body) = &f.body {
                        self.check_function_body(f, body)?;
                    }
                }
            }
        }

        self.file = None;
        let entry = self.find_entry()?;

        Ok(TypedProgram {
            structs: std::mem::take(&mut self.structs),
            globals: std::mem::take(&mut self.globals),
            functions: std::mem::take(&mut self.functions),
            entry,
        })
    }

    fn find_entry(&self) -> Result<Option<FuncId>, CompileError> {
        let main = self
            .func_names
            .get(ENTRY_MAIN)
            .copied()
            .filter(|id| self.functions[*id].body.is_some());
        let cond = self
            .func_names
            .get(ENTRY_CONDITIONAL)
            .copied()
            .filter(|id| self.functions[*id].body.is_some());

        match (main, cond) {
            (Some(_), Some(c)) => Err(CompileError::entry_point(
                "script defines both main and StartingConditional",
                self.functions[c].span,
            )),
            (Some(m), None) => {
                let f = &self.functions[m];
                if f.return_type != NssType::Void || !f.params.is_empty() {
                    return Err(CompileError::semantic(
                        "main must be declared 'void main()'",
                        f.span,
                    ));
                }
                Ok(Some(m))
            }
            (None, Some(c)) => {
                let f = &self.functions[c];
                if f.return_type != NssType::Int || !f.params.is_empty() {
                    return Err(CompileError::semantic(
                        "StartingConditional must be declared 'int StartingConditional()'",
                        f.span,
                    ));
                }
                Ok(Some(c))
            }
            (None, None) => Ok(None),
        }
    }

    // ── Declarations ──────────────────────────────────────────────

    fn check_type(&self, ty: &NssType, span: Span) -> Result<(), CompileError> {
        if let NssType::Struct(name) = ty {
            if self.structs.get(name).is_none() {
                return Err(self.err(format!("unknown struct '{name}'"), span));
            }
        }
        Ok(())
    }

    fn check_storable(&self, ty: &NssType, span: Span) -> Result<(), CompileError> {
        if matches!(ty, NssType::Void | NssType::Action) {
            return Err(self.err(format!("variables cannot have type {}", describe(ty)), span));
        }
        self.check_type(ty, span)
    }

    fn declare_struct(&mut self, s: &StructDef) -> Result<(), CompileError> {
        if self.structs.get(&s.name).is_some() {
            return Err(self.err(format!("struct '{}' already defined", s.name), s.span));
        }
        let mut fields: Vec<FieldLayout> = Vec::new();
        let mut offset = 0;
        for f in &s.fields {
            if f.ty == NssType::Struct(s.name.clone()) {
                return Err(self.err(format!("struct '{}' contains itself", s.name), f.span));
            }
            self.check_storable(&f.ty, f.span)?;
            if fields.iter().any(|x| x.name == f.name) {
                return Err(self.err(format!("duplicate field '{}'", f.name), f.span));
            }
            fields.push(FieldLayout {
                name: f.name.clone(),
                ty: f.ty.clone(),
                offset,
            });
            offset += self.structs.size_of(&f.ty);
        }
        self.structs.insert(s.name.clone(), fields);
        Ok(())
    }

    fn declare_function(&mut self, f: &FunctionDef) -> Result<(), CompileError> {
        if self.decls.function(&f.name).is_some() {
            return Err(self.err(
                format!("'{}' redeclares an engine function", f.name),
                f.span,
            ));
        }
        if !f.return_type.is_void() {
            self.check_storable(&f.return_type, f.span)?;
        }
        let mut seen: Vec<&str> = Vec::new();
        for p in &f.params {
            if p.ty == NssType::Action {
                return Err(self.err("script functions cannot take 'action' parameters", p.span));
            }
            self.check_storable(&p.ty, p.span)?;
            if seen.contains(&p.name.as_str()) {
                return Err(self.err(format!("duplicate parameter '{}'", p.name), p.span));
            }
            seen.push(&p.name);
        }
        let params: Vec<NssType> = f.params.iter().map(|p| p.ty.clone()).collect();

        if let Some(&id) = self.func_names.get(&f.name) {
            let existing = &self.functions[id];
            if existing.params != params || existing.return_type != f.return_type {
                return Err(self.err(
                    format!("'{}' does not match its earlier declaration", f.name),
                    f.span,
                ));
            }
            if existing.body.is_some() && f.body.is_some() {
                return Err(self.err(format!("function '{}' already defined", f.name), f.span));
            }
            if f.body.is_some() {
                let defaults: Vec<Option<Expr>> = f.params.iter().map(|p| p.default.clone()).collect();
                let existing = &mut self.functions[id];
                existing.span = f.span;
                existing.file.clone_from(&self.file);
                if defaults.iter().any(Option::is_some) {
                    existing.defaults = defaults;
                }
                // Marks the definition as present until the body is checked.
                existing.body = Some(Vec::new());
            }
            return Ok(());
        }

        let id = self.functions.len();
        self.functions.push(TypedFunction {
            name: f.name.clone(),
            return_type: f.return_type.clone(),
            params,
            defaults: f.params.iter().map(|p| p.default.clone()).collect(),
            locals: Vec::new(),
            body: f.body.as_ref().map(|_| Vec::new()),
            span: f.span,
            file: self.file.clone(),
        });
        self.func_names.insert(f.name.clone(), id);
        Ok(())
    }

    fn declare_global(&mut self, decl: &VarDecl) -> Result<(), CompileError> {
        self.check_storable(&decl.ty, decl.span)?;
        for d in &decl.declarators {
            if self.global_names.contains_key(&d.name)
                || self.constants.contains_key(&d.name)
                || self.func_names.contains_key(&d.name)
            {
                return Err(self.err(format!("'{}' is already declared", d.name), d.span));
            }
            if decl.is_const {
                let Some(init) = &d.init else {
                    return Err(self.err(format!("constant '{}' needs a value", d.name), d.span));
                };
                let typed = self.check_expr(init)?;
                self.expect_type(&decl.ty, &typed)?;
                if let Some(value) = const_of(&typed) {
                    self.constants.insert(d.name.clone(), value);
                    continue;
                }
            }
            let init = match &d.init {
                Some(e) => {
                    let typed = self.check_expr(e)?;
                    self.expect_type(&decl.ty, &typed)?;
                    Some(typed)
                }
                None => None,
            };
            let offset = self.globals.iter().map(|g| self.structs.size_of(&g.ty)).sum();
            self.global_names.insert(d.name.clone(), self.globals.len());
            self.globals.push(GlobalVar {
                name: d.name.clone(),
                ty: decl.ty.clone(),
                offset,
                init,
            });
        }
        Ok(())
    }

    fn check_function_body(&mut self, f: &FunctionDef, body: &[Stmt]) -> Result<(), CompileError> {
        let Some(&id) = self.func_names.get(&f.name) else {
            return Ok(());
        };
        self.scopes = vec![IndexMap::new()];
        self.locals = Vec::new();
        self.return_type = f.return_type.clone();
        self.loop_depth = 0;
        self.switch_depth = 0;

        for p in &f.params {
            self.declare_local(&p.name, p.ty.clone(), p.span)?;
        }
        let typed = self.check_block(body)?;
        if !f.return_type.is_void() && !always_returns(&typed) {
            return Err(self.err(
                format!("not all paths of '{}' return a value", f.name),
                f.span,
            ));
        }

        let func = &mut self.functions[id];
        func.body = Some(typed);
        func.locals = std::mem::take(&mut self.locals);
        Ok(())
    }

    fn declare_local(&mut self, name: &str, ty: NssType, span: Span) -> Result<LocalId, CompileError> {
        let Some(scope) = self.scopes.last() else {
            return Err(self.err("declaration outside a function", span));
        };
        if scope.contains_key(name) {
            return Err(self.err(format!("'{name}' is already declared in this scope"), span));
        }
        let id = self.locals.len();
        self.locals.push(LocalInfo {
            name: name.to_string(),
            ty,
        });
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), id);
        }
        Ok(id)
    }

    // ── Statements ────────────────────────────────────────────────

    fn check_block(&mut self, stmts: &[Stmt]) -> Result<Vec<TypedStmt>, CompileError> {
        self.scopes.push(IndexMap::new());
        let mut out = Vec::new();
        for stmt in stmts {
            self.check_stmt_into(stmt, &mut out)?;
        }
        self.scopes.pop();
        Ok(out)
    }

    /// Declarations expand to one statement per declarator.
    fn check_stmt_into(&mut self, stmt: &Stmt, out: &mut Vec<TypedStmt>) -> Result<(), CompileError> {
        if let StmtKind::Decl(decl) = &stmt.kind {
            if decl.is_const {
                return Err(self.err("local constants are not supported", decl.span));
            }
            self.check_storable(&decl.ty, decl.span)?;
            for d in &decl.declarators {
                // The initializer cannot see the variable it initializes.
                let init = match &d.init {
                    Some(e) => {
                        let typed = self.check_expr(e)?;
                        self.expect_type(&decl.ty, &typed)?;
                        Some(typed)
                    }
                    None => None,
                };
                let local = self.declare_local(&d.name, decl.ty.clone(), d.span)?;
                out.push(TypedStmt {
                    kind: TypedStmtKind::Decl { local, init },
                    span: d.span,
                });
            }
            return Ok(());
        }
        let typed = self.check_stmt(stmt)?;
        out.push(typed);
        Ok(())
    }

    /// A single statement in its own scope (loop bodies, branches).
    fn check_scoped(&mut self, stmt: &Stmt) -> Result<TypedStmt, CompileError> {
        if let StmtKind::Decl(_) = stmt.kind {
            let stmts = self.check_block(std::slice::from_ref(stmt))?;
            return Ok(TypedStmt {
                kind: TypedStmtKind::Block(stmts),
                span: stmt.span,
            });
        }
        self.check_stmt(stmt)
    }

    fn check_condition(&mut self, cond: &Expr) -> Result<TypedExpr, CompileError> {
        let typed = self.check_expr(cond)?;
        if typed.ty != NssType::Int {
            return Err(self.err(
                format!("condition must be 'int', found {}", describe(&typed.ty)),
                cond.span,
            ));
        }
        Ok(typed)
    }

    fn check_stmt(&mut self, stmt: &Stmt) -> Result<TypedStmt, CompileError> {
        let span = stmt.span;
        let kind = match &stmt.kind {
            StmtKind::Block(stmts) => TypedStmtKind::Block(self.check_block(stmts)?),
            StmtKind::Decl(_) => {
                let mut out = Vec::new();
                self.check_stmt_into(stmt, &mut out)?;
                TypedStmtKind::Block(out)
            }
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => TypedStmtKind::If {
                cond: self.check_condition(cond)?,
                then_branch: Box::new(self.check_scoped(then_branch)?),
                else_branch: match else_branch {
                    Some(e) => Some(Box::new(self.check_scoped(e)?)),
                    None => None,
                },
            },
            StmtKind::While { cond, body } => {
                let cond = self.check_condition(cond)?;
                self.loop_depth += 1;
                let body = self.check_scoped(body);
                self.loop_depth -= 1;
                TypedStmtKind::While {
                    cond,
                    body: Box::new(body?),
                }
            }
            StmtKind::DoWhile { body, cond } => {
                self.loop_depth += 1;
                let body = self.check_scoped(body);
                self.loop_depth -= 1;
                TypedStmtKind::DoWhile {
                    body: Box::new(body?),
                    cond: self.check_condition(cond)?,
                }
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                let init = init.as_ref().map(|e| self.check_expr(e)).transpose()?;
                let cond = cond.as_ref().map(|e| self.check_condition(e)).transpose()?;
                let step = step.as_ref().map(|e| self.check_expr(e)).transpose()?;
                self.loop_depth += 1;
                let body = self.check_scoped(body);
                self.loop_depth -= 1;
                TypedStmtKind::For {
                    init,
                    cond,
                    step,
                    body: Box::new(body?),
                }
            }
            StmtKind::Switch { scrutinee, cases } => self.check_switch(scrutinee, cases)?,
            StmtKind::Return(value) => self.check_return(value.as_ref(), span)?,
            StmtKind::Break => {
                if self.loop_depth == 0 && self.switch_depth == 0 {
                    return Err(self.err("'break' outside of a loop or switch", span));
                }
                TypedStmtKind::Break
            }
            StmtKind::Continue => {
                if self.loop_depth == 0 {
                    return Err(self.err("'continue' outside of a loop", span));
                }
                TypedStmtKind::Continue
            }
            StmtKind::Expr(e) => TypedStmtKind::Expr(self.check_expr(e)?),
            StmtKind::Empty => TypedStmtKind::Empty,
        };
        Ok(TypedStmt { kind, span })
    }

    fn check_switch(&mut self, scrutinee: &Expr, cases: &[SwitchCase]) -> Result<TypedStmtKind, CompileError> {
        let scrutinee = self.check_expr(scrutinee)?;
        if scrutinee.ty != NssType::Int {
            return Err(self.err(
                format!("switch value must be 'int', found {}", describe(&scrutinee.ty)),
                scrutinee.span,
            ));
        }
        let mut seen: Vec<Option<i32>> = Vec::new();
        let mut typed_cases = Vec::new();
        self.switch_depth += 1;
        for case in cases {
            let value = match &case.label {
                CaseLabel::Case(e) => {
                    let typed = self.check_expr(e)?;
                    match typed.kind {
                        TypedExprKind::Int(v) => Some(v),
                        _ => {
                            self.switch_depth -= 1;
                            return Err(self.err("case label must be an integer constant", e.span));
                        }
                    }
                }
                CaseLabel::Default => None,
            };
            if seen.contains(&value) {
                self.switch_depth -= 1;
                return Err(self.err("duplicate case label", case.span));
            }
            seen.push(value);
            let body = self.check_block(&case.body);
            let body = match body {
                Ok(b) => b,
                Err(e) => {
                    self.switch_depth -= 1;
                    return Err(e);
                }
            };
            typed_cases.push(TypedCase { value, body });
        }
        self.switch_depth -= 1;
        Ok(TypedStmtKind::Switch {
            scrutinee,
            cases: typed_cases,
        })
    }

    fn check_return(&mut self, value: Option<&Expr>, span: Span) -> Result<TypedStmtKind, CompileError> {
        match (value, self.return_type.is_void()) {
            (None, true) => Ok(TypedStmtKind::Return(None)),
            (None, false) => Err(self.err(
                format!("missing return value of type {}", describe(&self.return_type)),
                span,
            )),
            (Some(e), true) => Err(self.err("void function cannot return a value", e.span)),
            (Some(e), false) => {
                let typed = self.check_expr(e)?;
                let expected = self.return_type.clone();
                self.expect_type(&expected, &typed)?;
                Ok(TypedStmtKind::Return(Some(typed)))
            }
        }
    }

    fn expect_type(&self, expected: &NssType, got: &TypedExpr) -> Result<(), CompileError> {
        if &got.ty == expected {
            Ok(())
        } else {
            Err(self.err(
                format!("type mismatch: expected {}, found {}", describe(expected), describe(&got.ty)),
                got.span,
            ))
        }
    }

    // ── Expressions ───────────────────────────────────────────────

    fn lookup_local(&self, name: &str) -> Option<LocalId> {
        self.scopes.iter().rev().find_map(|s| s.get(name).copied())
    }

    fn place_of(&mut self, expr: &Expr) -> Result<Option<Place>, CompileError> {
        match &expr.kind {
            ExprKind::Ident(name) => {
                if let Some(id) = self.lookup_local(name) {
                    return Ok(Some(Place {
                        var: VarRef::Local(id),
                        offset: 0,
                        ty: self.locals[id].ty.clone(),
                    }));
                }
                if let Some(&id) = self.global_names.get(name) {
                    return Ok(Some(Place {
                        var: VarRef::Global(id),
                        offset: 0,
                        ty: self.globals[id].ty.clone(),
                    }));
                }
                Ok(None)
            }
            ExprKind::Field { object, field } => {
                let Some(base) = self.place_of(object)? else {
                    return Ok(None);
                };
                let (offset, ty) = self.structs.field(&base.ty, field).ok_or_else(|| {
                    self.err(format!("{} has no field '{field}'", describe(&base.ty)), expr.span)
                })?;
                Ok(Some(Place {
                    var: base.var,
                    offset: base.offset + offset,
                    ty,
                }))
            }
            _ => Ok(None),
        }
    }

    fn assignable_place(&mut self, expr: &Expr) -> Result<Place, CompileError> {
        match self.place_of(expr)? {
            Some(p) => Ok(p),
            None => match &expr.kind {
                ExprKind::Ident(name) if self.is_constant(name) => {
                    Err(self.err(format!("cannot assign to constant '{name}'"), expr.span))
                }
                ExprKind::Ident(name) => {
                    Err(self.err(format!("undeclared identifier '{name}'"), expr.span))
                }
                _ => Err(self.err("expression is not assignable", expr.span)),
            },
        }
    }

    fn is_constant(&self, name: &str) -> bool {
        self.constants.contains_key(name) || self.decls.constant(name).is_some()
    }

    fn check_expr(&mut self, expr: &Expr) -> Result<TypedExpr, CompileError> {
        let span = expr.span;
        let typed = |kind: TypedExprKind, ty: NssType| TypedExpr { kind, ty, span };
        match &expr.kind {
            ExprKind::IntLit(v) => Ok(typed(TypedExprKind::Int(*v), NssType::Int)),
            ExprKind::FloatLit(v) => Ok(typed(TypedExprKind::Float(*v), NssType::Float)),
            ExprKind::StringLit(s) => Ok(typed(TypedExprKind::Str(s.clone()), NssType::String)),
            ExprKind::ObjectLit(v) => Ok(typed(TypedExprKind::Object(*v), NssType::Object)),
            ExprKind::Ident(name) => {
                if let Some(place) = self.place_of(expr)? {
                    let ty = place.ty.clone();
                    return Ok(typed(TypedExprKind::Load(place), ty));
                }
                let value = self
                    .constants
                    .get(name)
                    .or_else(|| self.decls.constant(name))
                    .cloned()
                    .ok_or_else(|| self.err(format!("undeclared identifier '{name}'"), span))?;
                let ty = value.ty();
                let kind = match value {
                    ConstValue::Int(v) => TypedExprKind::Int(v),
                    ConstValue::Float(v) => TypedExprKind::Float(v),
                    ConstValue::String(s) => TypedExprKind::Str(s),
                    ConstValue::Object(v) => TypedExprKind::Object(v),
                };
                Ok(typed(kind, ty))
            }
            ExprKind::Vector(x, y, z) => {
                let mut parts = Vec::new();
                for e in [x, y, z] {
                    let t = self.check_expr(e)?;
                    self.expect_type(&NssType::Float, &t)?;
                    parts.push(Box::new(t));
                }
                let (Some(z), Some(y), Some(x)) = (parts.pop(), parts.pop(), parts.pop()) else {
                    return Err(self.err("malformed vector literal", span));
                };
                Ok(typed(TypedExprKind::Vector(x, y, z), NssType::Vector))
            }
            ExprKind::Binary { op, left, right } => {
                let l = self.check_expr(left)?;
                let r = self.check_expr(right)?;
                self.binary(*op, l, r, span)
            }
            ExprKind::Unary { op, operand } => {
                let inner = self.check_expr(operand)?;
                let ok = match op {
                    UnaryOp::Neg => matches!(inner.ty, NssType::Int | NssType::Float),
                    UnaryOp::Not | UnaryOp::Comp => inner.ty == NssType::Int,
                };
                if !ok {
                    return Err(self.err(
                        format!("operator '{}' cannot be applied to {}", op.symbol(), describe(&inner.ty)),
                        span,
                    ));
                }
                let ty = inner.ty.clone();
                Ok(typed(
                    TypedExprKind::Unary {
                        op: *op,
                        operand: Box::new(inner),
                    },
                    ty,
                ))
            }
            ExprKind::IncDec {
                increment,
                prefix,
                target,
            } => {
                let place = self.assignable_place(target)?;
                if place.ty != NssType::Int {
                    return Err(self.err(
                        format!("'++'/'--' need an 'int' variable, found {}", describe(&place.ty)),
                        span,
                    ));
                }
                Ok(typed(
                    TypedExprKind::IncDec {
                        place,
                        increment: *increment,
                        prefix: *prefix,
                    },
                    NssType::Int,
                ))
            }
            ExprKind::Assign { op, target, value } => {
                let place = self.assignable_place(target)?;
                let rhs = self.check_expr(value)?;
                let rhs = match op {
                    None => rhs,
                    Some(op) => {
                        let current = TypedExpr {
                            kind: TypedExprKind::Load(place.clone()),
                            ty: place.ty.clone(),
                            span: target.span,
                        };
                        self.binary(*op, current, rhs, span)?
                    }
                };
                self.expect_type(&place.ty, &rhs)?;
                let ty = place.ty.clone();
                Ok(typed(
                    TypedExprKind::Assign {
                        place,
                        value: Box::new(rhs),
                    },
                    ty,
                ))
            }
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                let c = self.check_condition(cond)?;
                let t = self.check_expr(then_expr)?;
                let e = self.check_expr(else_expr)?;
                self.expect_type(&t.ty, &e)?;
                let ty = t.ty.clone();
                Ok(typed(
                    TypedExprKind::Ternary {
                        cond: Box::new(c),
                        then_expr: Box::new(t),
                        else_expr: Box::new(e),
                    },
                    ty,
                ))
            }
            ExprKind::Call { name, args } => self.check_call(name, args, span),
            ExprKind::Field { object, field } => {
                if let Some(place) = self.place_of(expr)? {
                    let ty = place.ty.clone();
                    return Ok(typed(TypedExprKind::Load(place), ty));
                }
                let obj = self.check_expr(object)?;
                let (offset, ty) = self.structs.field(&obj.ty, field).ok_or_else(|| {
                    self.err(format!("{} has no field '{field}'", describe(&obj.ty)), span)
                })?;
                Ok(typed(
                    TypedExprKind::FieldOf {
                        object: Box::new(obj),
                        offset,
                    },
                    ty,
                ))
            }
        }
    }

    fn binary(&self, op: BinOp, l: TypedExpr, r: TypedExpr, span: Span) -> Result<TypedExpr, CompileError> {
        use NssType::{Float, Int, String as Str, Vector};
        let ty = match (op, &l.ty, &r.ty) {
            (BinOp::And | BinOp::Or, Int, Int) => {
                return Ok(TypedExpr {
                    kind: TypedExprKind::Logical {
                        and: op == BinOp::And,
                        left: Box::new(l),
                        right: Box::new(r),
                    },
                    ty: Int,
                    span,
                });
            }
            (BinOp::Eq | BinOp::Ne, a, b) if a == b && !matches!(a, NssType::Void | NssType::Action) => {
                Some(Int)
            }
            (BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge, Int, Int)
            | (BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge, Float, Float) => Some(Int),
            (BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div, Int, Int) => Some(Int),
            (BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div, Int | Float, Int | Float) => Some(Float),
            (BinOp::Add, Str, Str) => Some(Str),
            (BinOp::Add | BinOp::Sub, Vector, Vector) => Some(Vector),
            (BinOp::Mul | BinOp::Div, Vector, Float) => Some(Vector),
            (BinOp::Mul, Float, Vector) => Some(Vector),
            (
                BinOp::Mod | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor | BinOp::Shl | BinOp::Shr | BinOp::UShr,
                Int,
                Int,
            ) => Some(Int),
            _ => None,
        };
        let Some(ty) = ty else {
            return Err(self.err(
                format!(
                    "operator '{}' cannot be applied to {} and {}",
                    op.symbol(),
                    describe(&l.ty),
                    describe(&r.ty)
                ),
                span,
            ));
        };
        Ok(TypedExpr {
            kind: TypedExprKind::Binary {
                op,
                left: Box::new(l),
                right: Box::new(r),
            },
            ty,
            span,
        })
    }

    fn check_call(&mut self, name: &str, args: &[Expr], span: Span) -> Result<TypedExpr, CompileError> {
        if let Some(&id) = self.func_names.get(name) {
            let params = self.functions[id].params.clone();
            let defaults = self.functions[id].defaults.clone();
            let ret = self.functions[id].return_type.clone();
            let required = defaults.iter().take_while(|d| d.is_none()).count();
            if args.len() < required || args.len() > params.len() {
                return Err(self.err(
                    format!("'{name}' takes {} arguments, {} given", params.len(), args.len()),
                    span,
                ));
            }
            let mut typed_args = Vec::new();
            for (i, ty) in params.iter().enumerate() {
                let arg = match (args.get(i), defaults.get(i).and_then(Option::as_ref)) {
                    (Some(e), _) => self.check_expr(e)?,
                    (None, Some(d)) => self.check_expr(d)?,
                    (None, None) => {
                        return Err(self.err(format!("missing argument {} to '{name}'", i + 1), span))
                    }
                };
                self.expect_type(ty, &arg)?;
                typed_args.push(arg);
            }
            return Ok(TypedExpr {
                kind: TypedExprKind::CallUser {
                    func: id,
                    args: typed_args,
                },
                ty: ret,
                span,
            });
        }

        let Some(engine) = self.decls.function(name) else {
            return Err(self.err(format!("undeclared function '{name}'"), span));
        };
        if args.len() < engine.required_params() || args.len() > engine.params.len() {
            return Err(self.err(
                format!(
                    "'{name}' takes {} arguments, {} given",
                    engine.params.len(),
                    args.len()
                ),
                span,
            ));
        }
        let routine = engine.routine;
        let ret = engine.return_type.clone();
        let params = engine.params.clone();
        let mut typed_args = Vec::new();
        for (i, p) in params.iter().enumerate() {
            let source = match (args.get(i), &p.default) {
                (Some(e), _) => e,
                (None, Some(d)) => d,
                (None, None) => {
                    return Err(self.err(format!("missing argument {} to '{name}'", i + 1), span))
                }
            };
            let arg = self.check_expr(source)?;
            if p.ty == NssType::Action {
                typed_args.push(Arg::Action(arg));
            } else {
                self.expect_type(&p.ty, &arg)?;
                typed_args.push(Arg::Value(arg));
            }
        }
        Ok(TypedExpr {
            kind: TypedExprKind::CallEngine {
                routine,
                args: typed_args,
            },
            ty: ret,
            span,
        })
    }
}

fn const_of(expr: &TypedExpr) -> Option<ConstValue> {
    match &expr.kind {
        TypedExprKind::Int(v) => Some(ConstValue::Int(*v)),
        TypedExprKind::Float(v) => Some(ConstValue::Float(*v)),
        TypedExprKind::Str(s) => Some(ConstValue::String(s.clone())),
        TypedExprKind::Object(v) => Some(ConstValue::Object(*v)),
        _ => None,
    }
}

/// Conservative: a trailing `return`, or an if/else whose arms both return.
fn always_returns(stmts: &[TypedStmt]) -> bool {
    stmts.last().is_some_and(stmt_returns)
}

fn stmt_returns(stmt: &TypedStmt) -> bool {
    match &stmt.kind {
        TypedStmtKind::Return(_) => true,
        TypedStmtKind::Block(b) => always_returns(b),
        TypedStmtKind::If {
            then_branch,
            else_branch: Some(e),
            ..
        } => stmt_returns(then_branch) && stmt_returns(e),
        TypedStmtKind::Switch { cases, .. } => {
            cases.iter().any(|c| c.value.is_none())
                && cases.last().is_some_and(|c| always_returns(&c.body))
                && cases.iter().all(|c| {
                    c.body.is_empty() || always_returns(&c.body) || !contains_break(&c.body)
                })
        }
        _ => false,
    }
}

fn contains_break(stmts: &[TypedStmt]) -> bool {
    stmts.iter().any(|s| match &s.kind {
        TypedStmtKind::Break => true,
        TypedStmtKind::Block(b) => contains_break(b),
        TypedStmtKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            contains_break(std::slice::from_ref(then_branch))
                || else_branch
                    .as_ref()
                    .is_some_and(|e| contains_break(std::slice::from_ref(e)))
        }
        _ => false,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::game::GameVariant;
    use crate::nss::declarations::DeclarationCache;
    use crate::nss::error::ErrorKind;
    use crate::nss::parser::parse_source;
    use crate::nss::resolver::{resolve, LibraryTable};

    fn check_result(src: &str) -> Result<TypedProgram, CompileError> {
        let decls = DeclarationCache::builtin(GameVariant::K1).unwrap();
        let unit = resolve(parse_source(src).unwrap(), &LibraryTable::new()).unwrap();
        type_check(&unit, &decls)
    }

    fn check(src: &str) -> TypedProgram {
        check_result(src).unwrap()
    }

    fn check_err(src: &str) -> CompileError {
        check_result(src).unwrap_err()
    }

    #[test]
    fn main_is_entry() {
        let p = check("void main() { int i = 0; }");
        let entry = p.entry.unwrap();
        assert_eq!(p.functions[entry].name, "main");
        assert_eq!(p.functions[entry].locals.len(), 1);
    }

    #[test]
    fn starting_conditional_must_return_int() {
        let e = check_err("void StartingConditional() { }");
        assert_eq!(e.kind, ErrorKind::Semantic);
        assert!(check("int StartingConditional() { return 1; }").is_conditional());
    }

    #[test]
    fn both_entry_points_rejected() {
        let e = check_err("void main() {} int StartingConditional() { return 0; }");
        assert_eq!(e.kind, ErrorKind::EntryPoint);
    }

    #[test]
    fn library_without_entry_checks() {
        let p = check("int Helper(int n) { return n * 2; }");
        assert!(p.entry.is_none());
    }

    #[test]
    fn strict_assignment_types() {
        let e = check_err("void main() { float f = 1; }");
        assert!(e.message.contains("type mismatch"));
    }

    #[test]
    fn mixed_arithmetic_is_float() {
        let p = check("void main() { float f = 1 + 2.0; }");
        let body = p.functions[0].body.as_ref().unwrap();
        match &body[0].kind {
            TypedStmtKind::Decl { init: Some(e), .. } => assert_eq!(e.ty, NssType::Float),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn undeclared_identifier() {
        let e = check_err("void main() { x = 1; }");
        assert!(e.message.contains("undeclared identifier 'x'"));
    }

    #[test]
    fn redeclaration_in_same_scope() {
        let e = check_err("void main() { int a; float a; }");
        assert!(e.message.contains("already declared"));
        check("void main() { int a; { float a; } }");
    }

    #[test]
    fn engine_defaults_filled() {
        let p = check("void main() { PrintFloat(1.0); }");
        let body = p.functions[0].body.as_ref().unwrap();
        match &body[0].kind {
            TypedStmtKind::Expr(TypedExpr {
                kind: TypedExprKind::CallEngine { routine, args },
                ..
            }) => {
                assert_eq!(*routine, 2);
                assert_eq!(args.len(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn action_argument_accepts_any_call() {
        let p = check("void main() { DelayCommand(1.0, PrintString(\"x\")); }");
        let body = p.functions[0].body.as_ref().unwrap();
        match &body[0].kind {
            TypedStmtKind::Expr(TypedExpr {
                kind: TypedExprKind::CallEngine { args, .. },
                ..
            }) => assert!(matches!(args[1], Arg::Action(_))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wrong_argument_count() {
        let e = check_err("void main() { Random(); }");
        assert!(e.message.contains("takes 1 arguments"));
    }

    #[test]
    fn break_outside_loop() {
        let e = check_err("void main() { break; }");
        assert!(e.message.contains("'break'"));
        let e = check_err("void main() { switch (1) { case 1: continue; } }");
        assert!(e.message.contains("'continue'"));
    }

    #[test]
    fn missing_return_value() {
        let e = check_err("int F() { return; } void main() {}");
        assert!(e.message.contains("missing return value"));
        let e = check_err("int F() { } void main() {}");
        assert!(e.message.contains("not all paths"));
    }

    #[test]
    fn struct_fields_and_vector_components() {
        let p = check(
            "struct pair { int a; vector v; };
             void main() { struct pair p; p.v.y = 2.0; float f = GetPosition(OBJECT_SELF).z; }",
        );
        assert_eq!(p.structs.size_of(&NssType::Struct("pair".into())), 16);
        let body = p.functions[0].body.as_ref().unwrap();
        match &body[1].kind {
            TypedStmtKind::Expr(TypedExpr {
                kind: TypedExprKind::Assign { place, .. },
                ..
            }) => assert_eq!(place.offset, 8),
            other => panic!("unexpected {other:?}"),
        }
        match &body[2].kind {
            TypedStmtKind::Decl { init: Some(e), .. } => {
                assert!(matches!(e.kind, TypedExprKind::FieldOf { offset: 8, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn constants_are_inlined() {
        let p = check("const int LIMIT = 3; void main() { int i = LIMIT + TRUE; }");
        assert!(p.globals.is_empty());
        let body = p.functions[0].body.as_ref().unwrap();
        match &body[0].kind {
            TypedStmtKind::Decl { init: Some(e), .. } => match &e.kind {
                TypedExprKind::Binary { left, right, .. } => {
                    assert!(matches!(left.kind, TypedExprKind::Int(3)));
                    assert!(matches!(right.kind, TypedExprKind::Int(1)));
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn globals_get_offsets() {
        let p = check("int a; vector b; string c = \"x\"; void main() {}");
        assert_eq!(p.globals.len(), 3);
        assert_eq!(p.globals[2].offset, 16);
        assert_eq!(p.globals_size(), 20);
    }

    #[test]
    fn compound_assignment_desugars() {
        let p = check("void main() { int i; i += 2; }");
        let body = p.functions[0].body.as_ref().unwrap();
        match &body[1].kind {
            TypedStmtKind::Expr(TypedExpr {
                kind: TypedExprKind::Assign { value, .. },
                ..
            }) => assert!(matches!(value.kind, TypedExprKind::Binary { op: BinOp::Add, .. })),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn prototype_then_definition() {
        let p = check("int Twice(int n); void main() { Twice(2); } int Twice(int n) { return n + n; }");
        assert_eq!(p.functions.len(), 2);
        assert!(p.functions[0].body.is_some());
        let e = check_err("int Twice(int n); float Twice(int n) { return 1.0; } void main() {}");
        assert!(e.message.contains("does not match"));
    }

    #[test]
    fn engine_names_cannot_be_redefined() {
        let e = check_err("int Random(int n) { return 4; } void main() {}");
        assert!(e.message.contains("engine function"));
    }

    #[test]
    fn duplicate_case_rejected() {
        let e = check_err("void main() { switch (1) { case 1: break; case 1: break; } }");
        assert!(e.message.contains("duplicate case"));
    }
}
