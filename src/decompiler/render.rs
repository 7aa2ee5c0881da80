//! Recovered functions → syntax tree, with generated names.
//!
//! Globals are `nGlobal1`, `oGlobal2`, ..., parameters `nParam1` by position
//! and locals `fLocal1` counted per function, each prefixed by its type.
//! Functions other than the entry point are `sub1`, `sub2`, ... in address
//! order.

use std::collections::{HashMap, HashSet};

use super::stack::{DCase, DExpr, DStmt, VarId, VarKind};
use super::structure::{Context, FunctionIr};
use super::subroutine::SubKind;
use crate::nss::ast::*;

pub fn render(cx: &Context<'_>) -> Script {
    let mut names = Names::new(cx);
    let mut items = Vec::new();

    for (name, fields) in cx.types.structs.iter() {
        items.push(Item::Struct(StructDef {
            name: name.clone(),
            fields: fields
                .iter()
                .map(|f| Field {
                    ty: f.ty.clone(),
                    name: f.name.clone(),
                    span: Span::default(),
                })
                .collect(),
            span: Span::default(),
        }));
    }

    for f in &cx.functions {
        names.name_params(f);
    }
    for f in &cx.functions {
        if !names.is_entry(f.sub) {
            items.push(Item::Function(names.signature(f, None)));
        }
    }

    for stmt in &cx.global_decls {
        let DStmt::Decl { var, init } = stmt else { continue };
        let (root, _) = cx.vars.root(*var);
        if !names.declared.insert(root) {
            continue;
        }
        let init = if root == *var { init.as_ref().map(|e| names.expr(e)) } else { None };
        items.push(Item::Global(names.var_decl(root, init)));
    }

    for f in &cx.functions {
        names.locals = 0;
        let body = names.block(&f.body);
        items.push(Item::Function(names.signature(f, Some(body))));
    }

    Script {
        includes: Vec::new(),
        items,
    }
}

struct Names<'a, 'p> {
    cx: &'a Context<'p>,
    vars: HashMap<VarId, String>,
    subs: Vec<String>,
    globals: usize,
    locals: usize,
    declared: HashSet<VarId>,
}

impl<'a, 'p> Names<'a, 'p> {
    fn new(cx: &'a Context<'p>) -> Self {
        let mut next = 0;
        let subs = cx
            .layout
            .subs
            .iter()
            .map(|s| match s.kind {
                SubKind::Entry if cx.layout.conditional => "StartingConditional".to_string(),
                SubKind::Entry => "main".to_string(),
                SubKind::Globals => String::new(),
                SubKind::Function => {
                    next += 1;
                    format!("sub{next}")
                }
            })
            .collect();
        Self {
            cx,
            vars: HashMap::new(),
            subs,
            globals: 0,
            locals: 0,
            declared: HashSet::new(),
        }
    }

    fn is_entry(&self, sub: usize) -> bool {
        self.cx.layout.subs.get(sub).is_some_and(|s| s.kind == SubKind::Entry)
    }

    fn name_params(&mut self, f: &FunctionIr) {
        for (n, &v) in f.params.iter().enumerate() {
            let prefix = self.cx.vars.get(v).ty.name_prefix();
            self.vars.insert(v, format!("{prefix}Param{}", n + 1));
        }
    }

    fn signature(&mut self, f: &FunctionIr, body: Option<Vec<Stmt>>) -> FunctionDef {
        let params = f
            .params
            .iter()
            .map(|&v| Param {
                ty: self.cx.vars.get(v).ty.clone(),
                name: self.var_name(v),
                default: None,
                span: Span::default(),
            })
            .collect();
        FunctionDef {
            name: self.subs.get(f.sub).cloned().unwrap_or_default(),
            return_type: f.return_type.clone(),
            params,
            body,
            span: Span::default(),
        }
    }

    fn var_name(&mut self, v: VarId) -> String {
        if let Some(name) = self.vars.get(&v) {
            return name.clone();
        }
        let var = self.cx.vars.get(v);
        let prefix = var.ty.name_prefix();
        let name = match var.kind {
            VarKind::Global => {
                self.globals += 1;
                format!("{prefix}Global{}", self.globals)
            }
            VarKind::Return => "nReturn".to_string(),
            VarKind::Local | VarKind::Param => {
                self.locals += 1;
                format!("{prefix}Local{}", self.locals)
            }
        };
        self.vars.insert(v, name.clone());
        name
    }

    /// A merged cell renders as a field of its aggregate.
    fn var_expr(&mut self, v: VarId) -> Expr {
        let cx = self.cx;
        let var = cx.vars.get(v);
        let Some((parent, offset)) = var.parent else {
            return Expr::ident(self.var_name(v));
        };
        let base = self.var_expr(parent);
        let size = cx.types.size_of(&var.ty);
        match cx.types.field_path(&cx.vars.get(parent).ty, offset, size) {
            Some((path, _)) => path.into_iter().fold(base, |object, field| {
                Expr::new(ExprKind::Field {
                    object: Box::new(object),
                    field,
                })
            }),
            None => base,
        }
    }

    fn var_decl(&mut self, v: VarId, init: Option<Expr>) -> VarDecl {
        VarDecl {
            ty: self.cx.vars.get(v).ty.clone(),
            is_const: false,
            declarators: vec![Declarator {
                name: self.var_name(v),
                init,
                span: Span::default(),
            }],
            span: Span::default(),
        }
    }

    // ── Statements ────────────────────────────────────────────────

    fn block(&mut self, stmts: &[DStmt]) -> Vec<Stmt> {
        let mut out = Vec::new();
        for stmt in stmts {
            self.stmt(stmt, &mut out);
        }
        out
    }

    fn boxed_block(&mut self, stmts: &[DStmt]) -> Box<Stmt> {
        Box::new(Stmt::new(StmtKind::Block(self.block(stmts))))
    }

    fn stmt(&mut self, stmt: &DStmt, out: &mut Vec<Stmt>) {
        let kind = match stmt {
            DStmt::Decl { var, init } => {
                self.decl(*var, init.as_ref(), out);
                return;
            }
            DStmt::Expr(e) => StmtKind::Expr(self.expr(e)),
            DStmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.expr(cond);
                let then_branch = self.boxed_block(then_branch);
                let else_branch = else_branch.as_ref().map(|stmts| match stmts.as_slice() {
                    [chained @ DStmt::If { .. }] => {
                        let mut inner = Vec::new();
                        self.stmt(chained, &mut inner);
                        match inner.len() {
                            1 => Box::new(inner.remove(0)),
                            _ => Box::new(Stmt::new(StmtKind::Block(inner))),
                        }
                    }
                    _ => self.boxed_block(stmts),
                });
                StmtKind::If {
                    cond,
                    then_branch,
                    else_branch,
                }
            }
            DStmt::While { cond, body } => StmtKind::While {
                cond: self.expr(cond),
                body: self.boxed_block(body),
            },
            DStmt::DoWhile { body, cond } => StmtKind::DoWhile {
                body: self.boxed_block(body),
                cond: self.expr(cond),
            },
            DStmt::For { init, cond, step, body } => StmtKind::For {
                init: init.as_ref().map(|e| self.expr(e)),
                cond: cond.as_ref().map(|e| self.expr(e)),
                step: step.as_ref().map(|e| self.expr(e)),
                body: self.boxed_block(body),
            },
            DStmt::Switch { scrutinee, cases } => StmtKind::Switch {
                scrutinee: self.expr(scrutinee),
                cases: cases.iter().map(|c| self.case(c)).collect(),
            },
            DStmt::Return(value) => StmtKind::Return(value.as_ref().map(|e| self.expr(e))),
            DStmt::Break => StmtKind::Break,
            DStmt::Continue => StmtKind::Continue,
        };
        out.push(Stmt::new(kind));
    }

    /// Declaring a member declares its whole aggregate once; a member's
    /// initializer becomes an assignment to the field.
    fn decl(&mut self, var: VarId, init: Option<&DExpr>, out: &mut Vec<Stmt>) {
        let (root, _) = self.cx.vars.root(var);
        let first = self.declared.insert(root);
        if root == var && first {
            let init = init.map(|e| self.expr(e));
            let decl = self.var_decl(root, init);
            out.push(Stmt::new(StmtKind::Decl(decl)));
            return;
        }
        if first {
            let decl = self.var_decl(root, None);
            out.push(Stmt::new(StmtKind::Decl(decl)));
        }
        if let Some(init) = init {
            let assign = ExprKind::Assign {
                op: None,
                target: Box::new(self.var_expr(var)),
                value: Box::new(self.expr(init)),
            };
            out.push(Stmt::new(StmtKind::Expr(Expr::new(assign))));
        }
    }

    fn case(&mut self, case: &DCase) -> SwitchCase {
        SwitchCase {
            label: match case.value {
                Some(v) => CaseLabel::Case(Expr::new(ExprKind::IntLit(v))),
                None => CaseLabel::Default,
            },
            body: self.block(&case.body),
            span: Span::default(),
        }
    }

    // ── Expressions ───────────────────────────────────────────────

    fn exprs(&mut self, list: &[DExpr]) -> Vec<Expr> {
        list.iter().map(|e| self.expr(e)).collect()
    }

    fn boxed(&mut self, e: &DExpr) -> Box<Expr> {
        Box::new(self.expr(e))
    }

    fn expr(&mut self, e: &DExpr) -> Expr {
        let kind = match e {
            DExpr::Int(v) => ExprKind::IntLit(*v),
            DExpr::Float(v) => ExprKind::FloatLit(*v),
            DExpr::Str(s) => ExprKind::StringLit(s.clone()),
            DExpr::Object(v) => ExprKind::ObjectLit(*v),
            DExpr::Var(v) => return self.var_expr(*v),
            DExpr::Field(object, field) => ExprKind::Field {
                object: self.boxed(object),
                field: field.clone(),
            },
            DExpr::Vector(x, y, z) => ExprKind::Vector(self.boxed(x), self.boxed(y), self.boxed(z)),
            DExpr::Binary { op, left, right } => ExprKind::Binary {
                op: *op,
                left: self.boxed(left),
                right: self.boxed(right),
            },
            DExpr::Unary { op, operand } => ExprKind::Unary {
                op: *op,
                operand: self.boxed(operand),
            },
            DExpr::IncDec {
                target,
                increment,
                prefix,
            } => ExprKind::IncDec {
                increment: *increment,
                prefix: *prefix,
                target: self.boxed(target),
            },
            DExpr::Assign { target, value } => ExprKind::Assign {
                op: None,
                target: self.boxed(target),
                value: self.boxed(value),
            },
            DExpr::Ternary {
                cond,
                then_expr,
                else_expr,
            } => ExprKind::Ternary {
                cond: self.boxed(cond),
                then_expr: self.boxed(then_expr),
                else_expr: self.boxed(else_expr),
            },
            DExpr::CallUser { sub, args } => ExprKind::Call {
                name: self.subs.get(*sub).cloned().unwrap_or_default(),
                args: self.exprs(args),
            },
            DExpr::CallEngine { name, args } => ExprKind::Call {
                name: name.clone(),
                args: self.exprs(args),
            },
        };
        Expr::new(kind)
    }
}

