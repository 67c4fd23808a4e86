//! Tokenizer for candidate source.
//!
//! Produces a flat token stream with explicit `Newline`, `Indent` and
//! `Dedent` tokens, the way the language's own tokenizer does. Newlines
//! inside brackets and after a line-continuation backslash are dropped.

use super::ast::Location;
use super::SyntaxError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Number(String),
    /// String literal: lowercase prefix (`""`, `"r"`, `"f"`, `"rb"`, ...)
    /// and the raw body between the quotes.
    Str { prefix: String, body: String },
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    EndOfFile,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub loc: Location,
}

/// Operators, longest first so greedy matching picks `**=` over `**`.
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "->", ":=", "**", "//", "<<", ">>", "<=", ">=", "==", "!=",
    "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "@=", "+", "-", "*", "/", "%", "@", "&", "|",
    "^", "~", "<", ">", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "=",
];

const TAB_SIZE: usize = 8;

pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    // A lone carriage return ends a line for the interpreter, comments included.
    if source.contains('\r') {
        let normalized = source.replace("\r\n", "\n").replace('\r', "\n");
        return Lexer::new(&normalized).run();
    }
    Lexer::new(source).run()
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: usize,
    column: usize,
    depth: usize,
    indents: Vec<usize>,
    at_line_start: bool,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            column: 1,
            depth: 0,
            indents: vec![0],
            at_line_start: true,
            tokens: Vec::new(),
        }
    }

    fn loc(&self) -> Location {
        Location {
            line: self.line,
            column: self.column,
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn push(&mut self, kind: TokenKind, loc: Location) {
        self.tokens.push(Token { kind, loc });
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(message, self.loc())
    }

    fn run(mut self) -> Result<Vec<Token>, SyntaxError> {
        loop {
            if self.at_line_start && self.depth == 0 {
                self.at_line_start = false;
                if self.handle_indentation()? {
                    continue;
                }
            }

            let Some(c) = self.peek() else { break };
            match c {
                ' ' | '\t' | '\x0c' => {
                    self.bump();
                }
                '#' => self.skip_comment(),
                '\\' => {
                    self.bump();
                    match self.peek() {
                        Some('\n') => {
                            self.bump();
                        }
                        _ => return Err(self.error("unexpected character after line continuation")),
                    }
                }
                '\n' => {
                    let loc = self.loc();
                    self.bump();
                    if self.depth == 0 {
                        self.push(TokenKind::Newline, loc);
                        self.at_line_start = true;
                    }
                }
                c if c == '"' || c == '\'' => self.lex_string(String::new())?,
                c if c.is_ascii_digit() => self.lex_number(),
                '.' if self.peek_at(1).is_some_and(|n| n.is_ascii_digit()) => self.lex_number(),
                c if is_name_start(c) => self.lex_name_or_prefixed_string()?,
                _ => self.lex_operator()?,
            }
        }

        let loc = self.loc();
        if !matches!(
            self.tokens.last().map(|t| &t.kind),
            None | Some(TokenKind::Newline)
        ) {
            self.push(TokenKind::Newline, loc);
        }
        if self.depth > 0 {
            return Err(self.error("unexpected end of input inside brackets"));
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(TokenKind::Dedent, loc);
        }
        self.push(TokenKind::EndOfFile, loc);
        Ok(self.tokens)
    }

    /// Measures leading whitespace of a logical line and emits indent tokens.
    /// Returns true when the line was blank or comment-only (consumed).
    fn handle_indentation(&mut self) -> Result<bool, SyntaxError> {
        let mut width = 0;
        while let Some(c) = self.peek() {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / TAB_SIZE + 1) * TAB_SIZE,
                '\x0c' => width = 0,
                _ => break,
            }
            self.bump();
        }

        match self.peek() {
            None => return Ok(false),
            Some('#') => {
                self.skip_comment();
                if self.peek() == Some('\n') {
                    self.bump();
                }
                self.at_line_start = true;
                return Ok(true);
            }
            Some('\n') => {
                self.bump();
                self.at_line_start = true;
                return Ok(true);
            }
            _ => {}
        }

        let loc = self.loc();
        let current = *self.indents.last().unwrap_or(&0);
        if width > current {
            self.indents.push(width);
            self.push(TokenKind::Indent, loc);
        } else if width < current {
            while self.indents.last().is_some_and(|&w| w > width) {
                self.indents.pop();
                self.push(TokenKind::Dedent, loc);
            }
            if self.indents.last() != Some(&width) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        Ok(false)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn lex_name_or_prefixed_string(&mut self) -> Result<(), SyntaxError> {
        let src = self.src;
        let start = self.pos;
        let loc = self.loc();
        while self.peek().is_some_and(is_name_continue) {
            self.bump();
        }
        let word = &src[start..self.pos];
        if let Some(c) = word.chars().find(|&c| folds_under_nfkc(c)) {
            return Err(SyntaxError::new(
                format!("identifier '{word}' contains compatibility character U+{:04X}", c as u32),
                loc,
            ));
        }

        if matches!(self.peek(), Some('"') | Some('\'')) && is_string_prefix(word) {
            return self.lex_string_at(word.to_ascii_lowercase(), loc);
        }

        self.push(TokenKind::Name(word.to_string()), loc);
        Ok(())
    }

    fn lex_string(&mut self, prefix: String) -> Result<(), SyntaxError> {
        let loc = self.loc();
        self.lex_string_at(prefix, loc)
    }

    fn lex_string_at(&mut self, prefix: String, loc: Location) -> Result<(), SyntaxError> {
        let quote = self.bump().ok_or_else(|| self.error("expected string quote"))?;
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }

        let body_start = self.pos;
        loop {
            let Some(c) = self.peek() else {
                return Err(SyntaxError::new("unterminated string literal", loc));
            };
            if c == '\\' {
                self.bump();
                if self.bump().is_none() {
                    return Err(SyntaxError::new("unterminated string literal", loc));
                }
                continue;
            }
            if c == '\n' && !triple {
                return Err(SyntaxError::new("unterminated string literal", loc));
            }
            if c == quote {
                if !triple {
                    let body = self.src[body_start..self.pos].to_string();
                    self.bump();
                    self.push(TokenKind::Str { prefix, body }, loc);
                    return Ok(());
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    let body = self.src[body_start..self.pos].to_string();
                    self.bump();
                    self.bump();
                    self.bump();
                    self.push(TokenKind::Str { prefix, body }, loc);
                    return Ok(());
                }
            }
            self.bump();
        }
    }

    fn lex_number(&mut self) {
        let start = self.pos;
        let loc = self.loc();
        let mut prev = '\0';
        while let Some(c) = self.peek() {
            let exponent_sign = (c == '+' || c == '-')
                && (prev == 'e' || prev == 'E')
                && !self.src[start..self.pos].starts_with("0x")
                && !self.src[start..self.pos].starts_with("0X");
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || exponent_sign {
                prev = c;
                self.bump();
            } else {
                break;
            }
        }
        self.push(TokenKind::Number(self.src[start..self.pos].to_string()), loc);
    }

    fn lex_operator(&mut self) -> Result<(), SyntaxError> {
        let loc = self.loc();
        let rest = &self.src[self.pos..];
        let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) else {
            let c = self.peek().unwrap_or('?');
            return Err(self.error(format!("invalid character '{c}'")));
        };
        for _ in 0..op.len() {
            self.bump();
        }
        match *op {
            "(" | "[" | "{" => self.depth += 1,
            ")" | "]" | "}" => {
                if self.depth == 0 {
                    return Err(SyntaxError::new(format!("unmatched '{op}'"), loc));
                }
                self.depth -= 1;
            }
            _ => {}
        }
        self.push(TokenKind::Op(op), loc);
        Ok(())
    }
}

fn is_name_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_name_continue(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

/// Covers every identifier character whose NFKC form contains ASCII. The interpreter
/// normalizes names before lookup, so `ｅｖａｌ` names `eval`; such names are
/// refused rather than folded.
fn folds_under_nfkc(c: char) -> bool {
    matches!(
        c as u32,
        0x00AA
            | 0x00B5
            | 0x00BA
            | 0x0132..=0x0133
            | 0x013F..=0x0140
            | 0x0149
            | 0x017F
            | 0x01C4..=0x01CC
            | 0x01F1..=0x01F3
            | 0x02B0..=0x02B8
            | 0x02E0..=0x02E4
            | 0x1D2C..=0x1D6A
            | 0x1D78
            | 0x1D9B..=0x1DBF
            | 0x1E9A
            | 0x2070..=0x209C
            | 0x2100..=0x214F
            | 0x2160..=0x2188
            | 0x2460..=0x24FF
            | 0x2C7C..=0x2C7D
            | 0xA69C..=0xA69D
            | 0xA770
            | 0xA7F2..=0xA7F4
            | 0xA7F8..=0xA7F9
            | 0xAB5C..=0xAB5F
            | 0xAB69
            | 0xFB00..=0xFB06
            | 0xFE33..=0xFE34
            | 0xFE4D..=0xFE4F
            | 0xFF10..=0xFF19
            | 0xFF21..=0xFF3A
            | 0xFF3F
            | 0xFF41..=0xFF5A
            | 0x10780..=0x107BA
            | 0x1D400..=0x1D7FF
            | 0x1FBF0..=0x1FBF9
    )
}

fn is_string_prefix(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "r" | "u" | "b" | "f" | "br" | "rb" | "fr" | "rf"
    )
}
