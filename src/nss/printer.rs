//! Syntax tree → NSS source text.
//!
//! Parentheses are inserted only where operator precedence requires them,
//! so printing a parsed script and parsing it again yields the same tree.

use std::fmt::Write;

use super::ast::*;

const INDENT: &str = "    ";

pub fn print_script(script: &Script) -> String {
    let mut p = Printer::default();
    for inc in &script.includes {
        p.line(&format!("#include \"{}\"", inc.name));
    }
    if !script.includes.is_empty() && !script.items.is_empty() {
        p.out.push('\n');
    }
    let mut prev: Option<&Item> = None;
    for item in &script.items {
        // Blank line between groups and around every function definition.
        let separate = match (prev, item) {
            (None, _) => false,
            (Some(Item::Function(a)), Item::Function(b)) => a.body.is_some() || b.body.is_some(),
            (Some(a), b) => std::mem::discriminant(a) != std::mem::discriminant(b) || matches!(b, Item::Struct(_)),
        };
        if separate {
            p.out.push('\n');
        }
        p.item(item);
        prev = Some(item);
    }
    p.out
}

pub fn print_expr(expr: &Expr) -> String {
    let mut p = Printer::default();
    p.expr(expr, 0);
    p.out
}

pub fn print_stmt(stmt: &Stmt) -> String {
    let mut p = Printer::default();
    p.stmt(stmt);
    p.out
}

/// Literal text for a float that always reads back as a float.
pub fn format_float(v: f32) -> String {
    if !v.is_finite() {
        return "0.0".to_string();
    }
    let mut s = v.to_string();
    if !s.contains('.') {
        s.push_str(".0");
    }
    s
}

fn format_int(v: i32) -> String {
    if v == i32::MIN {
        "0x80000000".to_string()
    } else {
        v.to_string()
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

// Precedence levels, low to high.
const PREC_ASSIGN: u8 = 1;
const PREC_TERNARY: u8 = 2;
const PREC_UNARY: u8 = 13;
const PREC_POSTFIX: u8 = 14;

fn binary_prec(op: BinOp) -> u8 {
    op.precedence() + 2
}

fn prec(expr: &Expr) -> u8 {
    match &expr.kind {
        ExprKind::Assign { .. } => PREC_ASSIGN,
        ExprKind::Ternary { .. } => PREC_TERNARY,
        ExprKind::Binary { op, .. } => binary_prec(*op),
        ExprKind::Unary { .. } | ExprKind::IncDec { prefix: true, .. } => PREC_UNARY,
        ExprKind::IntLit(v) if *v < 0 => PREC_UNARY,
        ExprKind::FloatLit(v) if v.is_sign_negative() => PREC_UNARY,
        _ => PREC_POSTFIX,
    }
}

#[derive(Default)]
struct Printer {
    out: String,
    indent: usize,
}

impl Printer {
    fn pad(&mut self) {
        for _ in 0..self.indent {
            self.out.push_str(INDENT);
        }
    }

    fn line(&mut self, text: &str) {
        self.pad();
        self.out.push_str(text);
        self.out.push('\n');
    }

    // ── Items ─────────────────────────────────────────────────────

    fn item(&mut self, item: &Item) {
        match item {
            Item::Struct(s) => {
                self.line(&format!("struct {} {{", s.name));
                self.indent += 1;
                for f in &s.fields {
                    self.line(&format!("{} {};", f.ty, f.name));
                }
                self.indent -= 1;
                self.line("};");
            }
            Item::Global(decl) => {
                self.pad();
                self.var_decl(decl);
                self.out.push('\n');
            }
            Item::Function(f) => {
                self.pad();
                let _ = write!(self.out, "{} {}(", f.return_type, f.name);
                for (i, p) in f.params.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    let _ = write!(self.out, "{} {}", p.ty, p.name);
                    if let Some(d) = &p.default {
                        self.out.push_str(" = ");
                        self.expr(d, PREC_TERNARY);
                    }
                }
                self.out.push(')');
                match &f.body {
                    None => self.out.push_str(";\n"),
                    Some(body) => {
                        self.out.push('\n');
                        self.block(body);
                    }
                }
            }
        }
    }

    fn var_decl(&mut self, decl: &VarDecl) {
        if decl.is_const {
            self.out.push_str("const ");
        }
        let _ = write!(self.out, "{} ", decl.ty);
        for (i, d) in decl.declarators.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.out.push_str(&d.name);
            if let Some(init) = &d.init {
                self.out.push_str(" = ");
                self.expr(init, PREC_ASSIGN);
            }
        }
        self.out.push(';');
    }

    // ── Statements ────────────────────────────────────────────────

    fn block(&mut self, stmts: &[Stmt]) {
        self.line("{");
        self.indent += 1;
        for s in stmts {
            self.stmt(s);
        }
        self.indent -= 1;
        self.line("}");
    }

    /// Body of a control statement: blocks keep their braces, a lone
    /// statement is indented one level.
    fn body(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Block(stmts) => self.block(stmts),
            _ => {
                self.indent += 1;
                self.stmt(stmt);
                self.indent -= 1;
            }
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Block(stmts) => self.block(stmts),
            StmtKind::Decl(decl) => {
                self.pad();
                self.var_decl(decl);
                self.out.push('\n');
            }
            StmtKind::If { .. } => {
                self.pad();
                self.if_chain(stmt);
            }
            StmtKind::While { cond, body } => {
                self.pad();
                self.out.push_str("while (");
                self.expr(cond, 0);
                self.out.push_str(")\n");
                self.body(body);
            }
            StmtKind::DoWhile { body, cond } => {
                self.line("do");
                self.body(body);
                self.pad();
                self.out.push_str("while (");
                self.expr(cond, 0);
                self.out.push_str(");\n");
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                self.pad();
                self.out.push_str("for (");
                if let Some(e) = init {
                    self.expr(e, 0);
                }
                self.out.push_str("; ");
                if let Some(e) = cond {
                    self.expr(e, 0);
                }
                self.out.push_str("; ");
                if let Some(e) = step {
                    self.expr(e, 0);
                }
                self.out.push_str(")\n");
                self.body(body);
            }
            StmtKind::Switch { scrutinee, cases } => {
                self.pad();
                self.out.push_str("switch (");
                self.expr(scrutinee, 0);
                self.out.push_str(")\n");
                self.line("{");
                self.indent += 1;
                for case in cases {
                    self.pad();
                    match &case.label {
                        CaseLabel::Case(e) => {
                            self.out.push_str("case ");
                            self.expr(e, 0);
                            self.out.push_str(":\n");
                        }
                        CaseLabel::Default => self.out.push_str("default:\n"),
                    }
                    self.indent += 1;
                    for s in &case.body {
                        self.stmt(s);
                    }
                    self.indent -= 1;
                }
                self.indent -= 1;
                self.line("}");
            }
            StmtKind::Return(None) => self.line("return;"),
            StmtKind::Return(Some(e)) => {
                self.pad();
                self.out.push_str("return ");
                self.expr(e, 0);
                self.out.push_str(";\n");
            }
            StmtKind::Break => self.line("break;"),
            StmtKind::Continue => self.line("continue;"),
            StmtKind::Expr(e) => {
                self.pad();
                self.expr(e, 0);
                self.out.push_str(";\n");
            }
            StmtKind::Empty => self.line(";"),
        }
    }

    /// `if` with `else if` chains kept flat. Assumes the indent is written.
    fn if_chain(&mut self, stmt: &Stmt) {
        let StmtKind::If {
            cond,
            then_branch,
            else_branch,
        } = &stmt.kind
        else {
            return;
        };
        self.out.push_str("if (");
        self.expr(cond, 0);
        self.out.push_str(")\n");
        self.body(then_branch);
        if let Some(e) = else_branch {
            self.pad();
            if matches!(e.kind, StmtKind::If { .. }) {
                self.out.push_str("else ");
                self.if_chain(e);
            } else {
                self.out.push_str("else\n");
                self.body(e);
            }
        }
    }

    // ── Expressions ───────────────────────────────────────────────

    fn expr(&mut self, expr: &Expr, min_prec: u8) {
        let wrap = prec(expr) < min_prec;
        if wrap {
            self.out.push('(');
        }
        self.expr_inner(expr);
        if wrap {
            self.out.push(')');
        }
    }

    fn expr_inner(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::IntLit(v) => self.out.push_str(&format_int(*v)),
            ExprKind::FloatLit(v) => self.out.push_str(&format_float(*v)),
            ExprKind::StringLit(s) => self.out.push_str(&escape(s)),
            ExprKind::ObjectLit(0) => self.out.push_str("OBJECT_SELF"),
            ExprKind::ObjectLit(_) => self.out.push_str("OBJECT_INVALID"),
            ExprKind::Ident(name) => self.out.push_str(name),
            ExprKind::Vector(x, y, z) => {
                self.out.push('[');
                self.expr(x, PREC_ASSIGN);
                self.out.push_str(", ");
                self.expr(y, PREC_ASSIGN);
                self.out.push_str(", ");
                self.expr(z, PREC_ASSIGN);
                self.out.push(']');
            }
            ExprKind::Binary { op, left, right } => {
                let p = binary_prec(*op);
                self.expr(left, p);
                let _ = write!(self.out, " {} ", op.symbol());
                self.expr(right, p + 1);
            }
            ExprKind::Unary { op, operand } => {
                self.out.push_str(op.symbol());
                // Keep `- -x` from lexing as a decrement.
                let inner = print_expr(operand);
                if *op == UnaryOp::Neg && inner.starts_with('-') {
                    let _ = write!(self.out, "({inner})");
                } else {
                    self.expr(operand, PREC_UNARY);
                }
            }
            ExprKind::IncDec {
                increment,
                prefix,
                target,
            } => {
                let sym = if *increment { "++" } else { "--" };
                if *prefix {
                    self.out.push_str(sym);
                    self.expr(target, PREC_POSTFIX);
                } else {
                    self.expr(target, PREC_POSTFIX);
                    self.out.push_str(sym);
                }
            }
            ExprKind::Assign { op, target, value } => {
                self.expr(target, PREC_POSTFIX);
                match op {
                    Some(op) => {
                        let _ = write!(self.out, " {}= ", op.symbol());
                    }
                    None => self.out.push_str(" = "),
                }
                self.expr(value, PREC_ASSIGN);
            }
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.expr(cond, PREC_TERNARY + 1);
                self.out.push_str(" ? ");
                self.expr(then_expr, PREC_TERNARY);
                self.out.push_str(" : ");
                self.expr(else_expr, PREC_TERNARY);
            }
            ExprKind::Call { name, args } => {
                self.out.push_str(name);
                self.out.push('(');
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.expr(a, PREC_ASSIGN);
                }
                self.out.push(')');
            }
            ExprKind::Field { object, field } => {
                self.expr(object, PREC_POSTFIX);
                self.out.push('.');
                self.out.push_str(field);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::nss::parser::parse_source;
    use pretty_assertions::assert_eq;

    fn reprint(src: &str) -> String {
        print_script(&parse_source(src).unwrap())
    }

    /// Printing is a fixed point after one round.
    fn assert_stable(src: &str) {
        let once = reprint(src);
        assert_eq!(reprint(&once), once);
    }

    #[test]
    fn prints_function_with_loop() {
        let out = reprint("void main(){int i=0;while(i<3){i=i+1;}}");
        assert_eq!(
            out,
            "void main()\n{\n    int i = 0;\n    while (i < 3)\n    {\n        i = i + 1;\n    }\n}\n"
        );
    }

    #[test]
    fn parentheses_only_where_needed() {
        let script = parse_source("void main() { int a = (1 + 2) * 3; int b = 1 + 2 * 3; int c = 1 - (2 - 3); }").unwrap();
        let out = print_script(&script);
        assert!(out.contains("int a = (1 + 2) * 3;"));
        assert!(out.contains("int b = 1 + 2 * 3;"));
        assert!(out.contains("int c = 1 - (2 - 3);"));
    }

    #[test]
    fn floats_always_have_a_point() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(0.5), "0.5");
        assert_eq!(format_float(-2.25), "-2.25");
        assert_eq!(format_float(1e20), "100000000000000000000.0");
    }

    #[test]
    fn strings_are_escaped() {
        let e = Expr::new(ExprKind::StringLit("a\"b\\c\n".into()));
        assert_eq!(print_expr(&e), r#""a\"b\\c\n""#);
    }

    #[test]
    fn double_negation_does_not_become_decrement() {
        let e = Expr::new(ExprKind::Unary {
            op: UnaryOp::Neg,
            operand: Box::new(Expr::new(ExprKind::IntLit(-1))),
        });
        assert_eq!(print_expr(&e), "-(-1)");
    }

    #[test]
    fn else_if_chain_stays_flat() {
        let out = reprint("void main() { int a; if (a == 1) a = 2; else if (a == 2) a = 3; else a = 4; }");
        assert!(out.contains("    else if (a == 2)\n"));
    }

    #[test]
    fn round_trips_are_stable() {
        assert_stable(
            "struct pt { float x; float y; };
             int Add(int a, int b = 2);
             void main() {
                 struct pt p; p.x = 1.5;
                 vector v = [1.0, 2.0, 3.0];
                 int i; for (i = 0; i < 10; i++) { if (i % 2) continue; }
                 do { i--; } while (i > 0 && !(i == 5));
                 switch (i) { case 1: i += 3; break; default: i = i > 2 ? 1 : 0; }
                 DelayCommand(1.0, PrintString(\"x\"));
                 float f = -v.z;
             }
             int Add(int a, int b = 2) { return a + b; }",
        );
    }
}
