use super::ast::*;
use super::error::CompileError;
use super::lexer::{SpannedToken, Token};
use super::types::NssType;

pub fn parse(tokens: Vec<SpannedToken>) -> Result<Script, Vec<CompileError>> {
    let mut parser = Parser::new(tokens);
    parser.parse_script()
}

/// Lex and parse in one step; lexer errors win.
pub fn parse_source(source: &str) -> Result<Script, Vec<CompileError>> {
    parse(super::lexer::lex(source)?)
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    errors: Vec<CompileError>,
}

fn binary_op(token: &Token) -> Option<BinOp> {
    Some(match token {
        Token::OrOr => BinOp::Or,
        Token::AndAnd => BinOp::And,
        Token::Pipe => BinOp::BitOr,
        Token::Caret => BinOp::BitXor,
        Token::Amp => BinOp::BitAnd,
        Token::EqEq => BinOp::Eq,
        Token::Ne => BinOp::Ne,
        Token::Lt => BinOp::Lt,
        Token::Le => BinOp::Le,
        Token::Gt => BinOp::Gt,
        Token::Ge => BinOp::Ge,
        Token::Shl => BinOp::Shl,
        Token::Shr => BinOp::Shr,
        Token::UShr => BinOp::UShr,
        Token::Plus => BinOp::Add,
        Token::Minus => BinOp::Sub,
        Token::Star => BinOp::Mul,
        Token::Slash => BinOp::Div,
        Token::Percent => BinOp::Mod,
        _ => return None,
    })
}

/// `None` inside means plain `=`.
fn assign_op(token: &Token) -> Option<Option<BinOp>> {
    Some(match token {
        Token::Eq => None,
        Token::PlusEq => Some(BinOp::Add),
        Token::MinusEq => Some(BinOp::Sub),
        Token::StarEq => Some(BinOp::Mul),
        Token::SlashEq => Some(BinOp::Div),
        Token::PercentEq => Some(BinOp::Mod),
        Token::AmpEq => Some(BinOp::BitAnd),
        Token::PipeEq => Some(BinOp::BitOr),
        Token::CaretEq => Some(BinOp::BitXor),
        Token::ShlEq => Some(BinOp::Shl),
        Token::ShrEq => Some(BinOp::Shr),
        Token::UShrEq => Some(BinOp::UShr),
        _ => return None,
    })
}

impl Parser {
    fn new(tokens: Vec<SpannedToken>) -> Self {
        Self {
            tokens,
            pos: 0,
            errors: Vec::new(),
        }
    }

    fn parse_script(&mut self) -> Result<Script, Vec<CompileError>> {
        let mut script = Script::default();

        while !self.at_eof() {
            match self.peek().clone() {
                Token::Include(name) => {
                    let span = self.span();
                    self.advance();
                    script.includes.push(Include { name, span });
                }
                Token::Semicolon => {
                    self.advance();
                }
                _ => match self.parse_item() {
                    Ok(item) => script.items.push(item),
                    Err(e) => {
                        self.errors.push(e);
                        self.recover_item();
                    }
                },
            }
        }

        if self.errors.is_empty() {
            Ok(script)
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).map_or(&Token::Eof, |t| &t.token)
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        self.tokens.get(self.pos + ahead).map_or(&Token::Eof, |t| &t.token)
    }

    fn span(&self) -> Span {
        self.tokens.get(self.pos).map_or(Span::new(0, 0), |t| t.span)
    }

    fn prev_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or(Span::new(0, 0), |t| t.span)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn advance(&mut self) {
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<Span, CompileError> {
        if self.peek() == expected {
            let sp = self.span();
            self.advance();
            Ok(sp)
        } else {
            Err(CompileError::parser(
                format!("expected {expected:?}, got {:?}", self.peek()),
                self.span(),
            ))
        }
    }

    fn expect_ident(&mut self) -> Result<(String, Span), CompileError> {
        if let Token::Ident(name) = self.peek().clone() {
            let sp = self.span();
            self.advance();
            Ok((name, sp))
        } else {
            Err(CompileError::parser(
                format!("expected identifier, got {:?}", self.peek()),
                self.span(),
            ))
        }
    }

    /// Skip to just past the `;` or closing `}` that ends the broken item.
    fn recover_item(&mut self) {
        let mut depth = 0usize;
        while !self.at_eof() {
            match self.peek() {
                Token::LBrace => depth += 1,
                Token::RBrace => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        self.advance();
                        self.eat(&Token::Semicolon);
                        return;
                    }
                }
                Token::Semicolon if depth == 0 => {
                    self.advance();
                    return;
                }
                _ => {}
            }
            self.advance();
        }
    }

    fn starts_type(&self) -> bool {
        matches!(self.peek(), Token::Type(_) | Token::Const)
            || (matches!(self.peek(), Token::Struct) && matches!(self.peek_at(2), Token::Ident(_)))
    }

    fn parse_type(&mut self) -> Result<NssType, CompileError> {
        match self.peek().clone() {
            Token::Type(ty) => {
                self.advance();
                Ok(ty)
            }
            Token::Struct => {
                self.advance();
                let (name, _) = self.expect_ident()?;
                Ok(NssType::Struct(name))
            }
            other => Err(CompileError::parser(
                format!("expected a type, got {other:?}"),
                self.span(),
            )),
        }
    }

    // ── Top-level items ───────────────────────────────────────────

    fn parse_item(&mut self) -> Result<Item, CompileError> {
        let start = self.span();
        if matches!(self.peek(), Token::Struct)
            && matches!(self.peek_at(1), Token::Ident(_))
            && matches!(self.peek_at(2), Token::LBrace)
        {
            return self.parse_struct_def().map(Item::Struct);
        }

        let is_const = self.eat(&Token::Const);
        let ty = self.parse_type()?;
        let (name, name_span) = self.expect_ident()?;

        if !is_const && matches!(self.peek(), Token::LParen) {
            return self.parse_function(ty, name, start).map(Item::Function);
        }

        let decl = self.parse_declarators(ty, is_const, name, name_span, start)?;
        Ok(Item::Global(decl))
    }

    fn parse_struct_def(&mut self) -> Result<StructDef, CompileError> {
        let start = self.expect(&Token::Struct)?;
        let (name, _) = self.expect_ident()?;
        self.expect(&Token::LBrace)?;
        let mut fields = Vec::new();
        while !matches!(self.peek(), Token::RBrace | Token::Eof) {
            let field_start = self.span();
            let ty = self.parse_type()?;
            loop {
                let (fname, fspan) = self.expect_ident()?;
                fields.push(Field {
                    ty: ty.clone(),
                    name: fname,
                    span: field_start.merge(fspan),
                });
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::Semicolon)?;
        }
        let end = self.expect(&Token::RBrace)?;
        self.expect(&Token::Semicolon)?;
        Ok(StructDef {
            name,
            fields,
            span: start.merge(end),
        })
    }

    fn parse_function(
        &mut self,
        return_type: NssType,
        name: String,
        start: Span,
    ) -> Result<FunctionDef, CompileError> {
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if matches!(self.peek(), Token::Type(NssType::Void)) && matches!(self.peek_at(1), Token::RParen) {
            self.advance();
        }
        if !matches!(self.peek(), Token::RParen) {
            loop {
                let pstart = self.span();
                let ty = self.parse_type()?;
                let (pname, pspan) = self.expect_ident()?;
                let default = if self.eat(&Token::Eq) {
                    Some(self.parse_ternary()?)
                } else {
                    None
                };
                params.push(Param {
                    ty,
                    name: pname,
                    default,
                    span: pstart.merge(pspan),
                });
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;

        if matches!(self.peek(), Token::Semicolon) {
            let end = self.span();
            self.advance();
            return Ok(FunctionDef {
                name,
                return_type,
                params,
                body: None,
                span: start.merge(end),
            });
        }

        let body = self.parse_block()?;
        Ok(FunctionDef {
            name,
            return_type,
            params,
            body: Some(body),
            span: start.merge(self.prev_span()),
        })
    }

    /// Continue a declaration whose type and first name are consumed.
    fn parse_declarators(
        &mut self,
        ty: NssType,
        is_const: bool,
        first: String,
        first_span: Span,
        start: Span,
    ) -> Result<VarDecl, CompileError> {
        let mut declarators = Vec::new();
        let mut name = first;
        let mut name_span = first_span;
        loop {
            let init = if self.eat(&Token::Eq) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            let span = init.as_ref().map_or(name_span, |e| name_span.merge(e.span));
            declarators.push(Declarator { name, init, span });
            if !self.eat(&Token::Comma) {
                break;
            }
            let (n, s) = self.expect_ident()?;
            name = n;
            name_span = s;
        }
        let end = self.expect(&Token::Semicolon)?;
        Ok(VarDecl {
            ty,
            is_const,
            declarators,
            span: start.merge(end),
        })
    }

    // ── Statements ────────────────────────────────────────────────

    fn parse_block(&mut self) -> Result<Vec<Stmt>, CompileError> {
        self.expect(&Token::LBrace)?;
        let mut stmts = Vec::new();
        while !matches!(self.peek(), Token::RBrace | Token::Eof) {
            stmts.push(self.parse_stmt()?);
        }
        self.expect(&Token::RBrace)?;
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, CompileError> {
        let start = self.span();
        let kind = match self.peek() {
            Token::LBrace => StmtKind::Block(self.parse_block()?),
            Token::Semicolon => {
                self.advance();
                StmtKind::Empty
            }
            Token::If => {
                self.advance();
                self.expect(&Token::LParen)?;
                let cond = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                let then_branch = Box::new(self.parse_stmt()?);
                let else_branch = if self.eat(&Token::Else) {
                    Some(Box::new(self.parse_stmt()?))
                } else {
                    None
                };
                StmtKind::If {
                    cond,
                    then_branch,
                    else_branch,
                }
            }
            Token::While => {
                self.advance();
                self.expect(&Token::LParen)?;
                let cond = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                let body = Box::new(self.parse_stmt()?);
                StmtKind::While { cond, body }
            }
            Token::Do => {
                self.advance();
                let body = Box::new(self.parse_stmt()?);
                self.expect(&Token::While)?;
                self.expect(&Token::LParen)?;
                let cond = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                self.expect(&Token::Semicolon)?;
                StmtKind::DoWhile { body, cond }
            }
            Token::For => {
                self.advance();
                self.expect(&Token::LParen)?;
                let init = self.parse_optional_expr(&Token::Semicolon)?;
                self.expect(&Token::Semicolon)?;
                let cond = self.parse_optional_expr(&Token::Semicolon)?;
                self.expect(&Token::Semicolon)?;
                let step = self.parse_optional_expr(&Token::RParen)?;
                self.expect(&Token::RParen)?;
                let body = Box::new(self.parse_stmt()?);
                StmtKind::For {
                    init,
                    cond,
                    step,
                    body,
                }
            }
            Token::Switch => self.parse_switch()?,
            Token::Return => {
                self.advance();
                let value = self.parse_optional_expr(&Token::Semicolon)?;
                self.expect(&Token::Semicolon)?;
                StmtKind::Return(value)
            }
            Token::Break => {
                self.advance();
                self.expect(&Token::Semicolon)?;
                StmtKind::Break
            }
            Token::Continue => {
                self.advance();
                self.expect(&Token::Semicolon)?;
                StmtKind::Continue
            }
            _ if self.starts_type() => {
                let is_const = self.eat(&Token::Const);
                let ty = self.parse_type()?;
                let (name, name_span) = self.expect_ident()?;
                StmtKind::Decl(self.parse_declarators(ty, is_const, name, name_span, start)?)
            }
            _ => {
                let expr = self.parse_expr()?;
                self.expect(&Token::Semicolon)?;
                StmtKind::Expr(expr)
            }
        };
        Ok(Stmt {
            kind,
            span: start.merge(self.prev_span()),
        })
    }

    fn parse_optional_expr(&mut self, terminator: &Token) -> Result<Option<Expr>, CompileError> {
        if self.peek() == terminator {
            Ok(None)
        } else {
            self.parse_expr().map(Some)
        }
    }

    fn parse_switch(&mut self) -> Result<StmtKind, CompileError> {
        self.expect(&Token::Switch)?;
        self.expect(&Token::LParen)?;
        let scrutinee = self.parse_expr()?;
        self.expect(&Token::RParen)?;
        self.expect(&Token::LBrace)?;

        let mut cases: Vec<SwitchCase> = Vec::new();
        while !matches!(self.peek(), Token::RBrace | Token::Eof) {
            let label_start = self.span();
            let label = match self.peek() {
                Token::Case => {
                    self.advance();
                    let value = self.parse_ternary()?;
                    CaseLabel::Case(value)
                }
                Token::Default => {
                    self.advance();
                    CaseLabel::Default
                }
                other => {
                    return Err(CompileError::parser(
                        format!("expected 'case' or 'default' in switch, got {other:?}"),
                        self.span(),
                    ))
                }
            };
            self.expect(&Token::Colon)?;
            let mut body = Vec::new();
            while !matches!(self.peek(), Token::Case | Token::Default | Token::RBrace | Token::Eof) {
                body.push(self.parse_stmt()?);
            }
            cases.push(SwitchCase {
                label,
                body,
                span: label_start.merge(self.prev_span()),
            });
        }
        self.expect(&Token::RBrace)?;
        Ok(StmtKind::Switch { scrutinee, cases })
    }

    // ── Expression parsing (precedence climbing) ──────────────────

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        let target = self.parse_ternary()?;
        let Some(op) = assign_op(self.peek()) else {
            return Ok(target);
        };
        if !matches!(target.kind, ExprKind::Ident(_) | ExprKind::Field { .. }) {
            return Err(CompileError::parser("invalid assignment target", target.span));
        }
        self.advance();
        let value = self.parse_expr()?;
        let span = target.span.merge(value.span);
        Ok(Expr {
            kind: ExprKind::Assign {
                op,
                target: Box::new(target),
                value: Box::new(value),
            },
            span,
        })
    }

    fn parse_ternary(&mut self) -> Result<Expr, CompileError> {
        let cond = self.parse_binary(1)?;
        if !self.eat(&Token::Question) {
            return Ok(cond);
        }
        let then_expr = self.parse_expr()?;
        self.expect(&Token::Colon)?;
        let else_expr = self.parse_ternary()?;
        let span = cond.span.merge(else_expr.span);
        Ok(Expr {
            kind: ExprKind::Ternary {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            },
            span,
        })
    }

    /// Left-associative binary operators binding at least as tight as
    /// `min_prec`.
    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, CompileError> {
        let mut left = self.parse_unary()?;
        while let Some(op) = binary_op(self.peek()) {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.advance();
            let right = self.parse_binary(prec + 1)?;
            let span = left.span.merge(right.span);
            left = Expr {
                kind: ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        let start = self.span();
        let op = match self.peek() {
            Token::Minus => UnaryOp::Neg,
            Token::Bang => UnaryOp::Not,
            Token::Tilde => UnaryOp::Comp,
            Token::PlusPlus | Token::MinusMinus => {
                let increment = matches!(self.peek(), Token::PlusPlus);
                self.advance();
                let target = self.parse_unary()?;
                let span = start.merge(target.span);
                return Ok(Expr {
                    kind: ExprKind::IncDec {
                        increment,
                        prefix: true,
                        target: Box::new(target),
                    },
                    span,
                });
            }
            _ => return self.parse_postfix(),
        };
        self.advance();

        // `-1` and `-1.0` are literals, not negations.
        if op == UnaryOp::Neg {
            match self.peek().clone() {
                Token::Int(v) if !matches!(self.peek_at(1), Token::Dot | Token::PlusPlus | Token::MinusMinus) => {
                    let span = start.merge(self.span());
                    self.advance();
                    return Ok(Expr {
                        kind: ExprKind::IntLit(v.wrapping_neg()),
                        span,
                    });
                }
                Token::Float(v) => {
                    let span = start.merge(self.span());
                    self.advance();
                    return Ok(Expr {
                        kind: ExprKind::FloatLit(-v),
                        span,
                    });
                }
                _ => {}
            }
        }

        let operand = self.parse_unary()?;
        let span = start.merge(operand.span);
        Ok(Expr {
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        })
    }

    fn parse_postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.parse_primary()?;

        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let (field, field_span) = self.expect_ident()?;
                    let span = expr.span.merge(field_span);
                    expr = Expr {
                        kind: ExprKind::Field {
                            object: Box::new(expr),
                            field,
                        },
                        span,
                    };
                }
                Token::PlusPlus | Token::MinusMinus => {
                    let increment = matches!(self.peek(), Token::PlusPlus);
                    let span = expr.span.merge(self.span());
                    self.advance();
                    expr = Expr {
                        kind: ExprKind::IncDec {
                            increment,
                            prefix: false,
                            target: Box::new(expr),
                        },
                        span,
                    };
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, CompileError> {
        let mut args = Vec::new();
        if !matches!(self.peek(), Token::RParen) {
            args.push(self.parse_expr()?);
            while self.eat(&Token::Comma) {
                args.push(self.parse_expr()?);
            }
        }
        self.expect(&Token::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let span = self.span();
        let kind = match self.peek().clone() {
            Token::Int(v) => {
                self.advance();
                ExprKind::IntLit(v)
            }
            Token::Float(v) => {
                self.advance();
                ExprKind::FloatLit(v)
            }
            Token::String(s) => {
                self.advance();
                ExprKind::StringLit(s)
            }
            Token::ObjectSelf => {
                self.advance();
                ExprKind::ObjectLit(0)
            }
            Token::ObjectInvalid => {
                self.advance();
                ExprKind::ObjectLit(1)
            }
            Token::Ident(name) => {
                self.advance();
                if self.eat(&Token::LParen) {
                    let args = self.parse_args()?;
                    return Ok(Expr {
                        kind: ExprKind::Call { name, args },
                        span: span.merge(self.prev_span()),
                    });
                }
                ExprKind::Ident(name)
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                let end = self.expect(&Token::RParen)?;
                return Ok(Expr {
                    kind: inner.kind,
                    span: span.merge(end),
                });
            }
            Token::LBracket => {
                self.advance();
                let x = self.parse_ternary()?;
                self.expect(&Token::Comma)?;
                let y = self.parse_ternary()?;
                self.expect(&Token::Comma)?;
                let z = self.parse_ternary()?;
                let end = self.expect(&Token::RBracket)?;
                return Ok(Expr {
                    kind: ExprKind::Vector(Box::new(x), Box::new(y), Box::new(z)),
                    span: span.merge(end),
                });
            }
            other => {
                return Err(CompileError::parser(
                    format!("expected expression, got {other:?}"),
                    span,
                ))
            }
        };
        Ok(Expr { kind, span })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn parse_str(s: &str) -> Script {
        parse_source(s).unwrap()
    }

    fn body_of(script: &Script, name: &str) -> Vec<Stmt> {
        script
            .items
            .iter()
            .find_map(|item| match item {
                Item::Function(f) if f.name == name => f.body.clone(),
                _ => None,
            })
            .unwrap()
    }

    fn expr_of(src: &str) -> Expr {
        let script = parse_str(&format!("void main() {{ {src}; }}"));
        match &body_of(&script, "main")[0].kind {
            StmtKind::Expr(e) => e.clone(),
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn parse_main_with_locals() {
        let script = parse_str("void main() { int i = 0, j; float f; }");
        let body = body_of(&script, "main");
        assert_eq!(body.len(), 2);
        match &body[0].kind {
            StmtKind::Decl(d) => {
                assert_eq!(d.ty, NssType::Int);
                assert_eq!(d.declarators.len(), 2);
                assert!(d.declarators[0].init.is_some());
            }
            other => panic!("expected decl, got {other:?}"),
        }
    }

    #[test]
    fn parse_prototype_and_defaults() {
        let script = parse_str("void Foo(int n, float f = 1.0, object o = OBJECT_SELF);");
        match &script.items[0] {
            Item::Function(f) => {
                assert!(f.body.is_none());
                assert_eq!(f.params.len(), 3);
                assert_eq!(
                    f.params[2].default.as_ref().unwrap().kind,
                    ExprKind::ObjectLit(0)
                );
            }
            other => panic!("expected function, got {other:?}"),
        }
    }

    #[test]
    fn parse_struct_and_struct_global() {
        let script = parse_str("struct pt { float x, y; int tag; }; struct pt gOrigin;");
        match &script.items[0] {
            Item::Struct(s) => {
                assert_eq!(s.name, "pt");
                assert_eq!(s.fields.len(), 3);
            }
            other => panic!("expected struct, got {other:?}"),
        }
        match &script.items[1] {
            Item::Global(g) => assert_eq!(g.ty, NssType::Struct("pt".into())),
            other => panic!("expected global, got {other:?}"),
        }
    }

    #[test]
    fn precedence_mul_over_add() {
        let e = expr_of("1 + 2 * 3");
        match e.kind {
            ExprKind::Binary { op: BinOp::Add, right, .. } => {
                assert!(matches!(right.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
            }
            other => panic!("expected add, got {other:?}"),
        }
    }

    #[test]
    fn logical_and_binds_tighter_than_or() {
        let e = expr_of("a || b && c");
        assert!(matches!(e.kind, ExprKind::Binary { op: BinOp::Or, .. }));
    }

    #[test]
    fn assignment_is_right_associative() {
        let e = expr_of("a = b += 2");
        match e.kind {
            ExprKind::Assign { op: None, value, .. } => {
                assert!(matches!(value.kind, ExprKind::Assign { op: Some(BinOp::Add), .. }));
            }
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn negative_literals_fold() {
        assert_eq!(expr_of("-5").kind, ExprKind::IntLit(-5));
        assert_eq!(expr_of("-2.5").kind, ExprKind::FloatLit(-2.5));
        assert!(matches!(expr_of("-x").kind, ExprKind::Unary { op: UnaryOp::Neg, .. }));
    }

    #[test]
    fn postfix_and_prefix_increment() {
        assert!(matches!(
            expr_of("i++").kind,
            ExprKind::IncDec { increment: true, prefix: false, .. }
        ));
        assert!(matches!(
            expr_of("--i").kind,
            ExprKind::IncDec { increment: false, prefix: true, .. }
        ));
    }

    #[test]
    fn vector_literal_and_field() {
        let e = expr_of("[1.0, 2.0, 3.0].x");
        match e.kind {
            ExprKind::Field { object, field } => {
                assert_eq!(field, "x");
                assert!(matches!(object.kind, ExprKind::Vector(..)));
            }
            other => panic!("expected field, got {other:?}"),
        }
    }

    #[test]
    fn ternary_parses() {
        assert!(matches!(expr_of("a ? 1 : 2").kind, ExprKind::Ternary { .. }));
    }

    #[test]
    fn parse_control_flow() {
        let script = parse_str(
            "void main() {
                int i;
                for (i = 0; i < 3; i++) { if (i == 1) continue; else break; }
                do { i--; } while (i > 0);
                switch (i) { case 1: case -2: i = 3; break; default: return; }
            }",
        );
        let body = body_of(&script, "main");
        assert!(matches!(body[1].kind, StmtKind::For { .. }));
        assert!(matches!(body[2].kind, StmtKind::DoWhile { .. }));
        match &body[3].kind {
            StmtKind::Switch { cases, .. } => {
                assert_eq!(cases.len(), 3);
                assert!(cases[0].body.is_empty());
                match &cases[1].label {
                    CaseLabel::Case(e) => assert_eq!(e.kind, ExprKind::IntLit(-2)),
                    CaseLabel::Default => panic!("expected case label"),
                }
                assert_eq!(cases[2].label, CaseLabel::Default);
            }
            other => panic!("expected switch, got {other:?}"),
        }
    }

    #[test]
    fn includes_collected() {
        let script = parse_str("#include \"k_inc_generic\"\nvoid main() {}");
        assert_eq!(script.includes.len(), 1);
        assert_eq!(script.includes[0].name, "k_inc_generic");
    }

    #[test]
    fn multiple_errors_reported() {
        let errs = parse_source("int ; void main() { } float = ;").unwrap_err();
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn invalid_assignment_target() {
        let errs = parse_source("void main() { 1 = 2; }").unwrap_err();
        assert!(errs[0].message.contains("assignment target"));
    }
}
