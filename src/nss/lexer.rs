use super::ast::Span;
use super::error::CompileError;
use super::types::NssType;
use crate::paths::normalize_include_name;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Int(i32),
    Float(f32),
    String(String),
    ObjectSelf,
    ObjectInvalid,

    // Identifiers & keywords
    Ident(String),
    Type(NssType),
    Struct,
    Const,
    If,
    Else,
    While,
    Do,
    For,
    Switch,
    Case,
    Default,
    Return,
    Break,
    Continue,

    /// `#include "name"`, already normalized.
    Include(String),

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semicolon,
    Comma,
    Dot,
    Colon,
    Question,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusPlus,
    MinusMinus,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Ne,
    AndAnd,
    OrOr,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    Shl,
    Shr,
    UShr,
    Eq,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    AmpEq,
    PipeEq,
    CaretEq,
    ShlEq,
    ShrEq,
    UShrEq,

    Eof,
}

#[derive(Debug, Clone)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

// Longest spellings first so `>>>=` wins over `>>`.
const OPERATORS: &[(&str, Token)] = &[
    (">>>=", Token::UShrEq),
    (">>>", Token::UShr),
    ("<<=", Token::ShlEq),
    (">>=", Token::ShrEq),
    ("++", Token::PlusPlus),
    ("--", Token::MinusMinus),
    ("<=", Token::Le),
    (">=", Token::Ge),
    ("==", Token::EqEq),
    ("!=", Token::Ne),
    ("&&", Token::AndAnd),
    ("||", Token::OrOr),
    ("<<", Token::Shl),
    (">>", Token::Shr),
    ("+=", Token::PlusEq),
    ("-=", Token::MinusEq),
    ("*=", Token::StarEq),
    ("/=", Token::SlashEq),
    ("%=", Token::PercentEq),
    ("&=", Token::AmpEq),
    ("|=", Token::PipeEq),
    ("^=", Token::CaretEq),
    ("(", Token::LParen),
    (")", Token::RParen),
    ("{", Token::LBrace),
    ("}", Token::RBrace),
    ("[", Token::LBracket),
    ("]", Token::RBracket),
    (";", Token::Semicolon),
    (",", Token::Comma),
    (":", Token::Colon),
    ("?", Token::Question),
    ("+", Token::Plus),
    ("-", Token::Minus),
    ("*", Token::Star),
    ("/", Token::Slash),
    ("%", Token::Percent),
    ("<", Token::Lt),
    (">", Token::Gt),
    ("&", Token::Amp),
    ("|", Token::Pipe),
    ("^", Token::Caret),
    ("~", Token::Tilde),
    ("!", Token::Bang),
    ("=", Token::Eq),
];

pub fn lex(source: &str) -> Result<Vec<SpannedToken>, Vec<CompileError>> {
    let mut lexer = Lexer::new(source);
    lexer.tokenize()
}

struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    tokens: Vec<SpannedToken>,
    errors: Vec<CompileError>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn tokenize(&mut self) -> Result<Vec<SpannedToken>, Vec<CompileError>> {
        loop {
            self.skip_whitespace_and_comments();
            let Some(ch) = self.peek() else { break };
            let start = self.pos;

            match ch {
                b'#' => self.lex_directive(start),
                b'"' => {
                    self.pos += 1;
                    self.lex_string(start);
                }
                b'0'..=b'9' => self.lex_number(start),
                b'.' if self.bytes.get(self.pos + 1).is_some_and(u8::is_ascii_digit) => {
                    self.lex_number(start);
                }
                b'.' => {
                    self.pos += 1;
                    self.push(Token::Dot, start, self.pos);
                }
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.lex_ident(start),
                _ => {
                    let rest = &self.source[self.pos..];
                    if let Some((text, token)) =
                        OPERATORS.iter().find(|(text, _)| rest.starts_with(text))
                    {
                        self.pos += text.len();
                        self.push(token.clone(), start, self.pos);
                    } else {
                        let c = rest.chars().next().unwrap_or('?');
                        self.errors.push(CompileError::lexer(
                            format!("unexpected character '{c}'"),
                            Span::new(start, start + c.len_utf8()),
                        ));
                        self.pos += c.len_utf8();
                    }
                }
            }
        }

        self.tokens.push(SpannedToken {
            token: Token::Eof,
            span: Span::new(self.pos, self.pos),
        });

        if self.errors.is_empty() {
            Ok(std::mem::take(&mut self.tokens))
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn push(&mut self, token: Token, start: usize, end: usize) {
        self.tokens.push(SpannedToken {
            token,
            span: Span::new(start, end),
        });
    }

    fn skip_whitespace_and_comments(&mut self) {
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b' ' | b'\t' | b'\n' | b'\r' => self.pos += 1,
                b'/' if self.bytes.get(self.pos + 1) == Some(&b'/') => {
                    while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                b'/' if self.bytes.get(self.pos + 1) == Some(&b'*') => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        if self.pos + 1 >= self.bytes.len() {
                            self.errors.push(CompileError::lexer(
                                "unterminated block comment",
                                Span::new(start, self.bytes.len()),
                            ));
                            self.pos = self.bytes.len();
                            break;
                        }
                        if self.bytes[self.pos] == b'*' && self.bytes[self.pos + 1] == b'/' {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn skip_blanks(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    fn skip_line(&mut self) {
        while self.peek().is_some_and(|b| b != b'\n') {
            self.pos += 1;
        }
    }

    /// `#include "x"` / `#include <x>` produce a token; `#define` lines are
    /// skipped; anything else is rejected.
    fn lex_directive(&mut self, start: usize) {
        self.pos += 1;
        let word_start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_alphabetic()) {
            self.pos += 1;
        }
        match &self.source[word_start..self.pos] {
            "include" => {
                self.skip_blanks();
                let close = match self.peek() {
                    Some(b'"') => b'"',
                    Some(b'<') => b'>',
                    _ => {
                        self.errors.push(CompileError::lexer(
                            "expected \"file\" or <file> after #include",
                            Span::new(start, self.pos),
                        ));
                        self.skip_line();
                        return;
                    }
                };
                self.pos += 1;
                let name_start = self.pos;
                while self.peek().is_some_and(|b| b != close && b != b'\n') {
                    self.pos += 1;
                }
                if self.peek() != Some(close) {
                    self.errors.push(CompileError::lexer(
                        "unterminated #include",
                        Span::new(start, self.pos),
                    ));
                    return;
                }
                let name = normalize_include_name(&self.source[name_start..self.pos]);
                self.pos += 1;
                self.push(Token::Include(name), start, self.pos);
            }
            "define" => self.skip_line(),
            other => {
                self.errors.push(CompileError::lexer(
                    format!("unsupported directive '#{other}'"),
                    Span::new(start, self.pos),
                ));
                self.skip_line();
            }
        }
    }

    fn lex_string(&mut self, start: usize) {
        let mut s = String::new();
        let mut terminated = false;
        while let Some(b) = self.peek() {
            match b {
                b'"' => {
                    self.pos += 1;
                    terminated = true;
                    break;
                }
                b'\n' => break,
                b'\\' => {
                    self.pos += 1;
                    let Some(c) = self.source[self.pos..].chars().next() else { break };
                    match c {
                        'n' => s.push('\n'),
                        't' => s.push('\t'),
                        '"' => s.push('"'),
                        '\\' => s.push('\\'),
                        other => self.errors.push(CompileError::lexer(
                            format!("unknown escape sequence '\\{other}'"),
                            Span::new(self.pos - 1, self.pos + other.len_utf8()),
                        )),
                    }
                    self.pos += c.len_utf8();
                }
                _ => {
                    let c = self.source[self.pos..].chars().next().unwrap_or('?');
                    s.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
        if !terminated {
            self.errors.push(CompileError::lexer(
                "unterminated string literal",
                Span::new(start, self.pos),
            ));
        }
        self.push(Token::String(s), start, self.pos);
    }

    fn lex_number(&mut self, start: usize) {
        if self.peek() == Some(b'0') && matches!(self.bytes.get(self.pos + 1), Some(b'x' | b'X')) {
            self.pos += 2;
            let digits_start = self.pos;
            while self.peek().is_some_and(|b| b.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            let digits = &self.source[digits_start..self.pos];
            match u32::from_str_radix(digits, 16) {
                // Hex literals cover the full 32-bit pattern.
                #[allow(clippy::cast_possible_wrap)]
                Ok(v) => self.push(Token::Int(v as i32), start, self.pos),
                Err(_) => self.errors.push(CompileError::lexer(
                    format!("invalid hex literal: {}", &self.source[start..self.pos]),
                    Span::new(start, self.pos),
                )),
            }
            return;
        }

        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        let mut is_float = false;
        if self.peek() == Some(b'.') {
            is_float = true;
            self.pos += 1;
            while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text_end = self.pos;
        if matches!(self.peek(), Some(b'f' | b'F')) {
            is_float = true;
            self.pos += 1;
        }
        let text = &self.source[start..text_end];

        if is_float {
            let normalized = if text.ends_with('.') {
                format!("{text}0")
            } else {
                text.to_string()
            };
            match normalized.parse::<f32>() {
                Ok(v) => self.push(Token::Float(v), start, self.pos),
                Err(_) => self.errors.push(CompileError::lexer(
                    format!("invalid float: {text}"),
                    Span::new(start, self.pos),
                )),
            }
        } else {
            match text.parse::<i32>() {
                Ok(v) => self.push(Token::Int(v), start, self.pos),
                Err(_) => self.errors.push(CompileError::lexer(
                    format!("integer literal out of range: {text}"),
                    Span::new(start, self.pos),
                )),
            }
        }
    }

    fn lex_ident(&mut self, start: usize) {
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            self.pos += 1;
        }
        let word = &self.source[start..self.pos];
        let token = match word {
            "struct" => Token::Struct,
            "const" => Token::Const,
            "if" => Token::If,
            "else" => Token::Else,
            "while" => Token::While,
            "do" => Token::Do,
            "for" => Token::For,
            "switch" => Token::Switch,
            "case" => Token::Case,
            "default" => Token::Default,
            "return" => Token::Return,
            "break" => Token::Break,
            "continue" => Token::Continue,
            "OBJECT_SELF" => Token::ObjectSelf,
            "OBJECT_INVALID" => Token::ObjectInvalid,
            _ => match NssType::from_keyword(word) {
                Some(ty) => Token::Type(ty),
                None => Token::Ident(word.to_string()),
            },
        };
        self.push(token, start, self.pos);
    }
}
