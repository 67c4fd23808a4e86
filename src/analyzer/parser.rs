//! Recursive-descent parser producing the [`ast`](super::ast) tree.
//!
//! Covers the statement and expression grammar functions are written in:
//! decorators, async forms, comprehensions, lambdas, walrus, star-args,
//! slices and f-string replacement fields. Anything else (notably `match`
//! statements) is a syntax error, so unknown constructs never reach a worker.

use super::ast::*;
use super::lexer::{tokenize, Token, TokenKind};
use super::SyntaxError;

/// Maximum nesting of blocks and expressions. Bounds recursion in both
/// the parser and the security walk.
pub const MAX_DEPTH: usize = 64;

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue",
    "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if", "import",
    "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while",
    "with", "yield",
];

const AUGMENTED_ASSIGN: &[&str] = &[
    "+=", "-=", "*=", "/=", "//=", "%=", "**=", ">>=", "<<=", "&=", "|=", "^=", "@=",
];

type PResult<T> = Result<T, SyntaxError>;

pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

/// Parses a whole module.
pub fn parse_module(source: &str) -> PResult<Vec<Stmt>> {
    let tokens = tokenize(source)?;
    Parser::new(tokens, 0).module()
}

/// Parses a standalone expression (an f-string field). Every node is
/// reported at `origin`, the position of the enclosing string literal.
fn parse_expression_at(source: &str, origin: Location, depth: usize) -> PResult<Expr> {
    if source.trim().is_empty() {
        return Err(SyntaxError::new("f-string: empty expression not allowed", origin));
    }
    let wrapped = format!("({source})");
    let mut tokens = tokenize(&wrapped).map_err(|e| SyntaxError::new(format!("f-string: {}", e.message), origin))?;
    for token in &mut tokens {
        token.loc = origin;
    }
    let mut parser = Parser::new(tokens, depth);
    let expr = parser.testlist_star_expr()?;
    parser.expect_newline()?;
    if !parser.at_eof() {
        return Err(SyntaxError::new("f-string: invalid expression", origin));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>, depth: usize) -> Self {
        Self { tokens, pos: 0, depth }
    }

    // ── token helpers ───────────────────────────────────

    fn peek(&self) -> &Token {
        self.peek_nth(0)
    }

    fn peek_nth(&self, n: usize) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.pos + n).min(last)]
    }

    fn loc(&self) -> Location {
        self.peek().loc
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::EndOfFile
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Op(o) if *o == op)
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Name(n) if n == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> PResult<Location> {
        if self.at_op(op) {
            Ok(self.advance().loc)
        } else {
            Err(self.unexpected(&format!("'{op}'")))
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> PResult<Location> {
        if self.at_keyword(kw) {
            Ok(self.advance().loc)
        } else {
            Err(self.unexpected(&format!("'{kw}'")))
        }
    }

    fn expect_name(&mut self) -> PResult<String> {
        match &self.peek().kind {
            TokenKind::Name(n) if !is_keyword(n) => {
                let n = n.clone();
                self.advance();
                Ok(n)
            }
            _ => Err(self.unexpected("a name")),
        }
    }

    fn expect_newline(&mut self) -> PResult<()> {
        match self.peek().kind {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            _ => Err(self.unexpected("end of line")),
        }
    }

    fn peek_op_in(&self, ops: &[&'static str]) -> Option<&'static str> {
        match &self.peek().kind {
            TokenKind::Op(o) => ops.iter().copied().find(|candidate| candidate == o),
            _ => None,
        }
    }

    fn unexpected(&self, expected: &str) -> SyntaxError {
        let found = match &self.peek().kind {
            TokenKind::Name(n) => format!("'{n}'"),
            TokenKind::Number(n) => format!("'{n}'"),
            TokenKind::Str { .. } => "string literal".to_string(),
            TokenKind::Op(o) => format!("'{o}'"),
            TokenKind::Newline => "end of line".to_string(),
            TokenKind::Indent => "unexpected indent".to_string(),
            TokenKind::Dedent => "unindent".to_string(),
            TokenKind::EndOfFile => "end of input".to_string(),
        };
        SyntaxError::new(format!("invalid syntax: expected {expected}, found {found}"), self.loc())
    }

    /// Runs `f` one nesting level deeper, failing past [`MAX_DEPTH`].
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(SyntaxError::new(
                format!("nesting exceeds {MAX_DEPTH} levels"),
                self.loc(),
            ));
        }
        let result = f(self);
        self.depth -= 1;
        result
    }

    /// True if the current token can begin an expression.
    fn starts_expression(&self) -> bool {
        match &self.peek().kind {
            TokenKind::Name(n) => {
                !is_keyword(n)
                    || matches!(
                        n.as_str(),
                        "not" | "lambda" | "await" | "None" | "True" | "False" | "yield"
                    )
            }
            TokenKind::Number(_) | TokenKind::Str { .. } => true,
            TokenKind::Op(op) => matches!(*op, "(" | "[" | "{" | "-" | "+" | "~" | "*" | "..."),
            _ => false,
        }
    }

    fn at_comp_for(&self) -> bool {
        self.at_keyword("for")
            || (self.at_keyword("async")
                && matches!(&self.peek_nth(1).kind, TokenKind::Name(n) if n == "for"))
    }

    // ── statements ──────────────────────────────────────

    fn module(&mut self) -> PResult<Vec<Stmt>> {
        let mut body = Vec::new();
        while !self.at_eof() {
            if self.peek().kind == TokenKind::Newline {
                self.advance();
                continue;
            }
            body.extend(self.statement()?);
        }
        Ok(body)
    }

    fn statement(&mut self) -> PResult<Vec<Stmt>> {
        let loc = self.loc();
        let keyword = match &self.peek().kind {
            TokenKind::Op("@") => return Ok(vec![self.decorated()?]),
            TokenKind::Indent => return Err(SyntaxError::new("unexpected indent", loc)),
            TokenKind::Name(n) => n.clone(),
            _ => return self.simple_line(),
        };
        let stmt = match keyword.as_str() {
            "def" => self.function_def(Vec::new(), false, loc)?,
            "class" => self.class_def(Vec::new(), loc)?,
            "if" => self.if_stmt()?,
            "while" => self.while_stmt()?,
            "for" => self.for_stmt(false, loc)?,
            "try" => self.try_stmt()?,
            "with" => self.with_stmt(false, loc)?,
            "async" => {
                self.advance();
                if self.at_keyword("def") {
                    self.function_def(Vec::new(), true, loc)?
                } else if self.at_keyword("for") {
                    self.for_stmt(true, loc)?
                } else if self.at_keyword("with") {
                    self.with_stmt(true, loc)?
                } else {
                    return Err(self.unexpected("'def', 'for' or 'with' after 'async'"));
                }
            }
            _ => return self.simple_line(),
        };
        Ok(vec![stmt])
    }

    /// `:` followed by an indented suite or a same-line simple statement list.
    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_op(":")?;
        self.nested(|p| {
            if p.peek().kind != TokenKind::Newline {
                return p.simple_line();
            }
            p.advance();
            if p.peek().kind != TokenKind::Indent {
                return Err(SyntaxError::new("expected an indented block", p.loc()));
            }
            p.advance();
            let mut body = Vec::new();
            loop {
                match p.peek().kind {
                    TokenKind::Dedent => {
                        p.advance();
                        break;
                    }
                    TokenKind::EndOfFile => break,
                    TokenKind::Newline => {
                        p.advance();
                    }
                    _ => body.extend(p.statement()?),
                }
            }
            Ok(body)
        })
    }

    fn simple_line(&mut self) -> PResult<Vec<Stmt>> {
        let mut stmts = vec![self.simple_stmt()?];
        while self.eat_op(";") {
            if self.peek().kind == TokenKind::Newline {
                break;
            }
            stmts.push(self.simple_stmt()?);
        }
        self.expect_newline()?;
        Ok(stmts)
    }

    fn at_simple_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Newline | TokenKind::EndOfFile) || self.at_op(";")
    }

    fn simple_stmt(&mut self) -> PResult<Stmt> {
        let loc = self.loc();
        let keyword = match &self.peek().kind {
            TokenKind::Name(n) => n.clone(),
            _ => String::new(),
        };
        let kind = match keyword.as_str() {
            "pass" => {
                self.advance();
                StmtKind::Pass
            }
            "break" => {
                self.advance();
                StmtKind::Break
            }
            "continue" => {
                self.advance();
                StmtKind::Continue
            }
            "return" => {
                self.advance();
                if self.at_simple_end() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.testlist_star_expr()?))
                }
            }
            "raise" => {
                self.advance();
                if self.at_simple_end() {
                    StmtKind::Raise { exc: None, cause: None }
                } else {
                    let exc = self.test()?;
                    let cause = if self.eat_keyword("from") {
                        Some(self.test()?)
                    } else {
                        None
                    };
                    StmtKind::Raise { exc: Some(exc), cause }
                }
            }
            "global" => {
                self.advance();
                StmtKind::Global(self.name_list()?)
            }
            "nonlocal" => {
                self.advance();
                StmtKind::Nonlocal(self.name_list()?)
            }
            "del" => {
                self.advance();
                let mut targets = vec![self.target_item()?];
                while self.eat_op(",") {
                    if !self.starts_expression() {
                        break;
                    }
                    targets.push(self.target_item()?);
                }
                StmtKind::Delete(targets)
            }
            "assert" => {
                self.advance();
                let test = self.test()?;
                let msg = if self.eat_op(",") {
                    Some(self.test()?)
                } else {
                    None
                };
                StmtKind::Assert { test, msg }
            }
            "import" => self.import()?,
            "from" => self.import_from()?,
            _ => self.expr_stmt()?,
        };
        Ok(Stmt { kind, loc })
    }

    fn name_list(&mut self) -> PResult<Vec<String>> {
        let mut names = vec![self.expect_name()?];
        while self.eat_op(",") {
            names.push(self.expect_name()?);
        }
        Ok(names)
    }

    fn expr_stmt(&mut self) -> PResult<StmtKind> {
        let first = self.yield_or_testlist()?;

        if let Some(op) = self.peek_op_in(AUGMENTED_ASSIGN) {
            self.advance();
            let value = self.yield_or_testlist()?;
            return Ok(StmtKind::AugAssign { target: first, op, value });
        }

        if self.eat_op(":") {
            let annotation = self.test()?;
            let value = if self.eat_op("=") {
                Some(self.yield_or_testlist()?)
            } else {
                None
            };
            return Ok(StmtKind::AnnAssign { target: first, annotation, value });
        }

        if self.at_op("=") {
            let mut targets = vec![first];
            loop {
                self.expect_op("=")?;
                let next = self.yield_or_testlist()?;
                if self.at_op("=") {
                    targets.push(next);
                } else {
                    return Ok(StmtKind::Assign { targets, value: next });
                }
            }
        }

        Ok(StmtKind::Expr(first))
    }

    fn import(&mut self) -> PResult<StmtKind> {
        self.expect_keyword("import")?;
        let mut names = Vec::new();
        loop {
            let loc = self.loc();
            let name = self.dotted_name()?;
            let asname = if self.eat_keyword("as") {
                Some(self.expect_name()?)
            } else {
                None
            };
            names.push(Alias { name, asname, loc });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(StmtKind::Import(names))
    }

    fn import_from(&mut self) -> PResult<StmtKind> {
        self.expect_keyword("from")?;
        let mut level = 0;
        loop {
            if self.eat_op(".") {
                level += 1;
            } else if self.eat_op("...") {
                level += 3;
            } else {
                break;
            }
        }
        let module = if self.at_keyword("import") {
            None
        } else {
            Some(self.dotted_name()?)
        };
        if module.is_none() && level == 0 {
            return Err(self.unexpected("a module name"));
        }
        self.expect_keyword("import")?;

        let mut names = Vec::new();
        if self.at_op("*") {
            let loc = self.advance().loc;
            names.push(Alias { name: "*".to_string(), asname: None, loc });
        } else {
            let parenthesized = self.eat_op("(");
            loop {
                if parenthesized && self.at_op(")") {
                    break;
                }
                let loc = self.loc();
                let name = self.expect_name()?;
                let asname = if self.eat_keyword("as") {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                names.push(Alias { name, asname, loc });
                if !self.eat_op(",") {
                    break;
                }
            }
            if parenthesized {
                self.expect_op(")")?;
            }
            if names.is_empty() {
                return Err(self.unexpected("a name"));
            }
        }
        Ok(StmtKind::ImportFrom { module, names, level })
    }

    fn dotted_name(&mut self) -> PResult<String> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn decorated(&mut self) -> PResult<Stmt> {
        let mut decorators = Vec::new();
        while self.eat_op("@") {
            decorators.push(self.namedexpr_test()?);
            self.expect_newline()?;
        }
        let loc = self.loc();
        if self.at_keyword("def") {
            self.function_def(decorators, false, loc)
        } else if self.at_keyword("async") {
            self.advance();
            self.function_def(decorators, true, loc)
        } else if self.at_keyword("class") {
            self.class_def(decorators, loc)
        } else {
            Err(self.unexpected("'def' or 'class' after decorator"))
        }
    }

    fn function_def(&mut self, decorators: Vec<Expr>, is_async: bool, loc: Location) -> PResult<Stmt> {
        self.expect_keyword("def")?;
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.param_list(")", true)?;
        self.expect_op(")")?;
        let returns = if self.eat_op("->") {
            Some(self.test()?)
        } else {
            None
        };
        let body = self.block()?;
        Ok(Stmt {
            kind: StmtKind::FunctionDef { name, params, decorators, returns, body, is_async },
            loc,
        })
    }

    /// Parameters up to (not including) `close`.
    fn param_list(&mut self, close: &str, annotated: bool) -> PResult<Vec<Param>> {
        let mut params = Vec::new();
        loop {
            if self.at_op(close) {
                break;
            }
            if self.eat_op("/") {
                // positional-only marker
            } else if self.eat_op("**") {
                params.push(self.param(annotated, false)?);
            } else if self.eat_op("*") {
                if matches!(&self.peek().kind, TokenKind::Name(n) if !is_keyword(n)) {
                    params.push(self.param(annotated, false)?);
                }
            } else {
                params.push(self.param(annotated, true)?);
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    fn param(&mut self, annotated: bool, with_default: bool) -> PResult<Param> {
        let loc = self.loc();
        let name = self.expect_name()?;
        let annotation = if annotated && self.eat_op(":") {
            Some(self.test()?)
        } else {
            None
        };
        let default = if with_default && self.eat_op("=") {
            Some(self.test()?)
        } else {
            None
        };
        Ok(Param { name, annotation, default, loc })
    }

    fn class_def(&mut self, decorators: Vec<Expr>, loc: Location) -> PResult<Stmt> {
        self.expect_keyword("class")?;
        let name = self.expect_name()?;
        let (bases, keywords) = if self.eat_op("(") {
            let parts = self.arglist(")")?;
            self.expect_op(")")?;
            parts
        } else {
            (Vec::new(), Vec::new())
        };
        let body = self.block()?;
        Ok(Stmt {
            kind: StmtKind::ClassDef { name, bases, keywords, decorators, body },
            loc,
        })
    }

    /// Handles both `if` and `elif` (the latter nests into `orelse`).
    fn if_stmt(&mut self) -> PResult<Stmt> {
        let loc = self.advance().loc;
        let test = self.namedexpr_test()?;
        let body = self.block()?;
        let orelse = if self.at_keyword("elif") {
            vec![self.if_stmt()?]
        } else if self.eat_keyword("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(Stmt { kind: StmtKind::If { test, body, orelse }, loc })
    }

    fn while_stmt(&mut self) -> PResult<Stmt> {
        let loc = self.expect_keyword("while")?;
        let test = self.namedexpr_test()?;
        let body = self.block()?;
        let orelse = if self.eat_keyword("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(Stmt { kind: StmtKind::While { test, body, orelse }, loc })
    }

    fn for_stmt(&mut self, is_async: bool, loc: Location) -> PResult<Stmt> {
        self.expect_keyword("for")?;
        let target = self.target_list()?;
        self.expect_keyword("in")?;
        let iter = self.testlist_star_expr()?;
        let body = self.block()?;
        let orelse = if self.eat_keyword("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(Stmt { kind: StmtKind::For { target, iter, body, orelse, is_async }, loc })
    }

    fn try_stmt(&mut self) -> PResult<Stmt> {
        let loc = self.expect_keyword("try")?;
        let body = self.block()?;
        let mut handlers = Vec::new();
        while self.at_keyword("except") {
            let handler_loc = self.advance().loc;
            self.eat_op("*");
            let (kind, name) = if self.at_op(":") {
                (None, None)
            } else {
                let kind = self.test()?;
                let name = if self.eat_keyword("as") {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                (Some(kind), name)
            };
            let body = self.block()?;
            handlers.push(ExceptHandler { kind, name, body, loc: handler_loc });
        }
        let orelse = if self.eat_keyword("else") {
            self.block()?
        } else {
            Vec::new()
        };
        let finalbody = if self.eat_keyword("finally") {
            self.block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.unexpected("'except' or 'finally'"));
        }
        Ok(Stmt { kind: StmtKind::Try { body, handlers, orelse, finalbody }, loc })
    }

    fn with_stmt(&mut self, is_async: bool, loc: Location) -> PResult<Stmt> {
        self.expect_keyword("with")?;
        let mut items = Vec::new();
        loop {
            let context = self.test()?;
            let target = if self.eat_keyword("as") {
                Some(self.target_item()?)
            } else {
                None
            };
            items.push(WithItem { context, target });
            if !self.eat_op(",") {
                break;
            }
        }
        let body = self.block()?;
        Ok(Stmt { kind: StmtKind::With { items, body, is_async }, loc })
    }

    // ── expressions ─────────────────────────────────────

    fn yield_or_testlist(&mut self) -> PResult<Expr> {
        if self.at_keyword("yield") {
            self.yield_expr()
        } else {
            self.testlist_star_expr()
        }
    }

    fn yield_expr(&mut self) -> PResult<Expr> {
        let loc = self.expect_keyword("yield")?;
        if self.eat_keyword("from") {
            let value = self.test()?;
            return Ok(Expr::new(ExprKind::YieldFrom(Box::new(value)), loc));
        }
        let value = if self.starts_expression() {
            Some(Box::new(self.testlist_star_expr()?))
        } else {
            None
        };
        Ok(Expr::new(ExprKind::Yield(value), loc))
    }

    fn testlist_star_expr(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        let first = self.star_or_namedexpr()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expression() {
                break;
            }
            items.push(self.star_or_namedexpr()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), loc))
    }

    fn star_or_namedexpr(&mut self) -> PResult<Expr> {
        if self.at_op("*") {
            let loc = self.advance().loc;
            let value = self.bitor()?;
            return Ok(Expr::new(ExprKind::Starred(Box::new(value)), loc));
        }
        self.namedexpr_test()
    }

    fn namedexpr_test(&mut self) -> PResult<Expr> {
        let target = self.test()?;
        if self.at_op(":=") {
            self.advance();
            let loc = target.loc;
            let value = self.test()?;
            return Ok(Expr::new(
                ExprKind::NamedExpr { target: Box::new(target), value: Box::new(value) },
                loc,
            ));
        }
        Ok(target)
    }

    fn test(&mut self) -> PResult<Expr> {
        self.nested(|p| {
            if p.at_keyword("lambda") {
                return p.lambda();
            }
            let body = p.or_test()?;
            if p.at_keyword("if") {
                p.advance();
                let test = p.or_test()?;
                p.expect_keyword("else")?;
                let orelse = p.test()?;
                let loc = body.loc;
                return Ok(Expr::new(
                    ExprKind::IfExp {
                        test: Box::new(test),
                        body: Box::new(body),
                        orelse: Box::new(orelse),
                    },
                    loc,
                ));
            }
            Ok(body)
        })
    }

    fn lambda(&mut self) -> PResult<Expr> {
        let loc = self.expect_keyword("lambda")?;
        let params = self.param_list(":", false)?;
        self.expect_op(":")?;
        let body = self.test()?;
        Ok(Expr::new(ExprKind::Lambda { params, body: Box::new(body) }, loc))
    }

    fn bool_chain(&mut self, keyword: &'static str, next: fn(&mut Self) -> PResult<Expr>) -> PResult<Expr> {
        let first = next(self)?;
        if !self.at_keyword(keyword) {
            return Ok(first);
        }
        let loc = first.loc;
        let mut values = vec![first];
        while self.eat_keyword(keyword) {
            values.push(next(self)?);
        }
        Ok(Expr::new(ExprKind::BoolOp { op: keyword, values }, loc))
    }

    fn or_test(&mut self) -> PResult<Expr> {
        self.bool_chain("or", Self::and_test)
    }

    fn and_test(&mut self) -> PResult<Expr> {
        self.bool_chain("and", Self::not_test)
    }

    fn not_test(&mut self) -> PResult<Expr> {
        if self.at_keyword("not") {
            let loc = self.advance().loc;
            let operand = self.nested(Self::not_test)?;
            return Ok(Expr::new(ExprKind::UnaryOp { op: "not", operand: Box::new(operand) }, loc));
        }
        self.comparison()
    }

    fn comparison_op(&mut self) -> Option<&'static str> {
        if let Some(op) = self.peek_op_in(&["<", ">", "==", ">=", "<=", "!="]) {
            self.advance();
            return Some(op);
        }
        if self.eat_keyword("in") {
            return Some("in");
        }
        if self.at_keyword("not") && matches!(&self.peek_nth(1).kind, TokenKind::Name(n) if n == "in") {
            self.advance();
            self.advance();
            return Some("not in");
        }
        if self.eat_keyword("is") {
            return Some(if self.eat_keyword("not") { "is not" } else { "is" });
        }
        None
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let left = self.bitor()?;
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        while let Some(op) = self.comparison_op() {
            ops.push(op);
            comparators.push(self.bitor()?);
        }
        if ops.is_empty() {
            return Ok(left);
        }
        let loc = left.loc;
        Ok(Expr::new(ExprKind::Compare { left: Box::new(left), ops, comparators }, loc))
    }

    fn binary(&mut self, ops: &[&'static str], next: fn(&mut Self) -> PResult<Expr>) -> PResult<Expr> {
        let mut left = next(self)?;
        while let Some(op) = self.peek_op_in(ops) {
            self.advance();
            let right = next(self)?;
            let loc = left.loc;
            left = Expr::new(ExprKind::BinOp { left: Box::new(left), op, right: Box::new(right) }, loc);
        }
        Ok(left)
    }

    fn bitor(&mut self) -> PResult<Expr> {
        self.binary(&["|"], Self::bitxor)
    }

    fn bitxor(&mut self) -> PResult<Expr> {
        self.binary(&["^"], Self::bitand)
    }

    fn bitand(&mut self) -> PResult<Expr> {
        self.binary(&["&"], Self::shift)
    }

    fn shift(&mut self) -> PResult<Expr> {
        self.binary(&["<<", ">>"], Self::arith)
    }

    fn arith(&mut self) -> PResult<Expr> {
        self.binary(&["+", "-"], Self::term)
    }

    fn term(&mut self) -> PResult<Expr> {
        self.binary(&["*", "/", "//", "%", "@"], Self::factor)
    }

    fn factor(&mut self) -> PResult<Expr> {
        if let Some(op) = self.peek_op_in(&["+", "-", "~"]) {
            let loc = self.advance().loc;
            let operand = self.nested(Self::factor)?;
            return Ok(Expr::new(ExprKind::UnaryOp { op, operand: Box::new(operand) }, loc));
        }
        self.power()
    }

    fn power(&mut self) -> PResult<Expr> {
        let base = if self.at_keyword("await") {
            let loc = self.advance().loc;
            let value = self.primary()?;
            Expr::new(ExprKind::Await(Box::new(value)), loc)
        } else {
            self.primary()?
        };
        if self.eat_op("**") {
            let exponent = self.factor()?;
            let loc = base.loc;
            return Ok(Expr::new(
                ExprKind::BinOp { left: Box::new(base), op: "**", right: Box::new(exponent) },
                loc,
            ));
        }
        Ok(base)
    }

    fn primary(&mut self) -> PResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            let loc = expr.loc;
            if self.eat_op("(") {
                let (args, keywords) = self.arglist(")")?;
                self.expect_op(")")?;
                expr = Expr::new(ExprKind::Call { func: Box::new(expr), args, keywords }, loc);
            } else if self.eat_op("[") {
                let index = self.subscript_list()?;
                self.expect_op("]")?;
                expr = Expr::new(ExprKind::Subscript { value: Box::new(expr), index: Box::new(index) }, loc);
            } else if self.eat_op(".") {
                let attr = self.expect_name()?;
                expr = Expr::new(ExprKind::Attribute { value: Box::new(expr), attr }, loc);
            } else {
                return Ok(expr);
            }
        }
    }

    fn atom(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        match self.peek().kind.clone() {
            TokenKind::Name(n) => {
                if matches!(n.as_str(), "None" | "True" | "False") {
                    self.advance();
                    return Ok(Expr::new(ExprKind::Literal(n), loc));
                }
                if is_keyword(&n) {
                    return Err(self.unexpected("an expression"));
                }
                self.advance();
                Ok(Expr::new(ExprKind::Name(n), loc))
            }
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::new(ExprKind::Literal(n), loc))
            }
            TokenKind::Str { .. } => self.strings(),
            TokenKind::Op("...") => {
                self.advance();
                Ok(Expr::new(ExprKind::Literal("...".to_string()), loc))
            }
            TokenKind::Op("(") => {
                self.advance();
                self.paren(loc)
            }
            TokenKind::Op("[") => {
                self.advance();
                self.list(loc)
            }
            TokenKind::Op("{") => {
                self.advance();
                self.braces(loc)
            }
            _ => Err(self.unexpected("an expression")),
        }
    }

    /// Adjacent string literals, concatenated. f-string fields are parsed.
    fn strings(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        let mut text = String::new();
        let mut fields = Vec::new();
        let mut formatted = false;
        while let TokenKind::Str { prefix, body } = self.peek().kind.clone() {
            let part_loc = self.advance().loc;
            if prefix.contains('f') {
                formatted = true;
                fields.extend(self.fstring_fields(&body, part_loc)?);
            }
            text.push_str(&body);
        }
        let kind = if formatted {
            ExprKind::FString { text, fields }
        } else {
            ExprKind::Str(text)
        };
        Ok(Expr::new(kind, loc))
    }

    fn fstring_fields(&self, body: &str, loc: Location) -> PResult<Vec<Expr>> {
        let chars: Vec<char> = body.chars().collect();
        let mut fields = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '{' if chars.get(i + 1) == Some(&'{') => i += 2,
                '}' if chars.get(i + 1) == Some(&'}') => i += 2,
                '{' => {
                    let field = split_fstring_field(&chars, i + 1, loc)?;
                    fields.push(parse_expression_at(&field.expression, loc, self.depth + 1)?);
                    if let Some(spec) = field.format_spec {
                        fields.extend(self.fstring_fields(&spec, loc)?);
                    }
                    i = field.end;
                }
                _ => i += 1,
            }
        }
        Ok(fields)
    }

    fn paren(&mut self, loc: Location) -> PResult<Expr> {
        if self.eat_op(")") {
            return Ok(Expr::new(ExprKind::Tuple(Vec::new()), loc));
        }
        if self.at_keyword("yield") {
            let expr = self.yield_expr()?;
            self.expect_op(")")?;
            return Ok(expr);
        }
        let first = self.star_or_namedexpr()?;
        if self.at_comp_for() {
            let generators = self.comp_for()?;
            self.expect_op(")")?;
            return Ok(comprehension(ComprehensionKind::Generator, first, None, generators, loc));
        }
        if !self.at_op(",") {
            self.expect_op(")")?;
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op(")") {
                break;
            }
            items.push(self.star_or_namedexpr()?);
        }
        self.expect_op(")")?;
        Ok(Expr::new(ExprKind::Tuple(items), loc))
    }

    fn list(&mut self, loc: Location) -> PResult<Expr> {
        if self.eat_op("]") {
            return Ok(Expr::new(ExprKind::List(Vec::new()), loc));
        }
        let first = self.star_or_namedexpr()?;
        if self.at_comp_for() {
            let generators = self.comp_for()?;
            self.expect_op("]")?;
            return Ok(comprehension(ComprehensionKind::List, first, None, generators, loc));
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("]") {
                break;
            }
            items.push(self.star_or_namedexpr()?);
        }
        self.expect_op("]")?;
        Ok(Expr::new(ExprKind::List(items), loc))
    }

    fn braces(&mut self, loc: Location) -> PResult<Expr> {
        if self.eat_op("}") {
            return Ok(Expr::new(ExprKind::Dict(Vec::new()), loc));
        }

        if self.eat_op("**") {
            let spread = self.bitor()?;
            return self.dict_rest(vec![(None, spread)], loc);
        }

        let first = self.star_or_namedexpr()?;
        if self.eat_op(":") {
            let value = self.test()?;
            if self.at_comp_for() {
                let generators = self.comp_for()?;
                self.expect_op("}")?;
                return Ok(comprehension(ComprehensionKind::Dict, first, Some(value), generators, loc));
            }
            return self.dict_rest(vec![(Some(first), value)], loc);
        }

        if self.at_comp_for() {
            let generators = self.comp_for()?;
            self.expect_op("}")?;
            return Ok(comprehension(ComprehensionKind::Set, first, None, generators, loc));
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("}") {
                break;
            }
            items.push(self.star_or_namedexpr()?);
        }
        self.expect_op("}")?;
        Ok(Expr::new(ExprKind::Set(items), loc))
    }

    fn dict_rest(&mut self, mut entries: Vec<(Option<Expr>, Expr)>, loc: Location) -> PResult<Expr> {
        while self.eat_op(",") {
            if self.at_op("}") {
                break;
            }
            if self.eat_op("**") {
                entries.push((None, self.bitor()?));
            } else {
                let key = self.test()?;
                self.expect_op(":")?;
                let value = self.test()?;
                entries.push((Some(key), value));
            }
        }
        self.expect_op("}")?;
        Ok(Expr::new(ExprKind::Dict(entries), loc))
    }

    fn comp_for(&mut self) -> PResult<Vec<Comprehension>> {
        let mut generators = Vec::new();
        while self.at_comp_for() {
            let is_async = self.eat_keyword("async");
            self.expect_keyword("for")?;
            let target = self.target_list()?;
            self.expect_keyword("in")?;
            let iter = self.or_test()?;
            let mut ifs = Vec::new();
            while self.eat_keyword("if") {
                ifs.push(self.or_test()?);
            }
            generators.push(Comprehension { target, iter, ifs, is_async });
        }
        Ok(generators)
    }

    /// Assignment targets of `for` and comprehensions: `a`, `a, b`, `*rest`.
    fn target_list(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        let first = self.target_item()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expression() {
                break;
            }
            items.push(self.target_item()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), loc))
    }

    fn target_item(&mut self) -> PResult<Expr> {
        if self.at_op("*") {
            let loc = self.advance().loc;
            let value = self.bitor()?;
            return Ok(Expr::new(ExprKind::Starred(Box::new(value)), loc));
        }
        self.bitor()
    }

    fn arglist(&mut self, close: &str) -> PResult<(Vec<Expr>, Vec<Keyword>)> {
        let mut args = Vec::new();
        let mut keywords = Vec::new();
        loop {
            if self.at_op(close) {
                break;
            }
            if self.at_op("*") {
                let loc = self.advance().loc;
                let value = self.test()?;
                args.push(Expr::new(ExprKind::Starred(Box::new(value)), loc));
            } else if self.eat_op("**") {
                keywords.push(Keyword { arg: None, value: self.test()? });
            } else if self.at_keyword_argument() {
                let arg = self.expect_name()?;
                self.expect_op("=")?;
                keywords.push(Keyword { arg: Some(arg), value: self.test()? });
            } else {
                let loc = self.loc();
                let value = self.namedexpr_test()?;
                if self.at_comp_for() {
                    let generators = self.comp_for()?;
                    args.push(comprehension(ComprehensionKind::Generator, value, None, generators, loc));
                } else {
                    args.push(value);
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok((args, keywords))
    }

    fn at_keyword_argument(&self) -> bool {
        matches!(&self.peek().kind, TokenKind::Name(n) if !is_keyword(n))
            && matches!(self.peek_nth(1).kind, TokenKind::Op("="))
    }

    fn subscript_list(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        let first = self.subscript()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("]") {
                break;
            }
            items.push(self.subscript()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), loc))
    }

    fn subscript(&mut self) -> PResult<Expr> {
        let loc = self.loc();
        let lower = if self.at_op(":") {
            None
        } else {
            let expr = self.star_or_namedexpr()?;
            if !self.at_op(":") {
                return Ok(expr);
            }
            Some(Box::new(expr))
        };
        self.expect_op(":")?;
        let upper = if self.at_op(":") || self.at_op("]") || self.at_op(",") {
            None
        } else {
            Some(Box::new(self.test()?))
        };
        let step = if self.eat_op(":") {
            if self.at_op("]") || self.at_op(",") {
                None
            } else {
                Some(Box::new(self.test()?))
            }
        } else {
            None
        };
        Ok(Expr::new(ExprKind::Slice { lower, upper, step }, loc))
    }
}

fn comprehension(
    kind: ComprehensionKind,
    element: Expr,
    value: Option<Expr>,
    generators: Vec<Comprehension>,
    loc: Location,
) -> Expr {
    Expr::new(
        ExprKind::Comprehension {
            kind,
            element: Box::new(element),
            value: value.map(Box::new),
            generators,
        },
        loc,
    )
}

struct FStringField {
    expression: String,
    format_spec: Option<String>,
    /// Index just past the closing `}`.
    end: usize,
}

/// Splits one replacement field starting after its `{`.
fn split_fstring_field(chars: &[char], start: usize, loc: Location) -> PResult<FStringField> {
    let mut depth = 0usize;
    let mut i = start;
    let mut quote: Option<char> = None;
    let mut expr_end = None;

    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' if depth > 0 => depth -= 1,
            '}' if depth > 0 => depth -= 1,
            '}' => {
                let expression: String = chars[start..expr_end.unwrap_or(i)].iter().collect();
                return Ok(FStringField {
                    expression: strip_debug_marker(&expression),
                    format_spec: None,
                    end: i + 1,
                });
            }
            '!' if depth == 0 && chars.get(i + 1) != Some(&'=') => {
                expr_end.get_or_insert(i);
            }
            ':' if depth == 0 => {
                let expression: String = chars[start..expr_end.unwrap_or(i)].iter().collect();
                let (spec, end) = split_format_spec(chars, i + 1, loc)?;
                return Ok(FStringField {
                    expression: strip_debug_marker(&expression),
                    format_spec: Some(spec),
                    end,
                });
            }
            _ => {}
        }
        i += 1;
    }
    Err(SyntaxError::new("f-string: expecting '}'", loc))
}

/// Format spec text up to the field's closing brace (specs may nest fields).
fn split_format_spec(chars: &[char], start: usize, loc: Location) -> PResult<(String, usize)> {
    let mut depth = 0usize;
    for (offset, c) in chars[start..].iter().enumerate() {
        match c {
            '{' => depth += 1,
            '}' if depth > 0 => depth -= 1,
            '}' => {
                let spec: String = chars[start..start + offset].iter().collect();
                return Ok((spec, start + offset + 1));
            }
            _ => {}
        }
    }
    Err(SyntaxError::new("f-string: expecting '}'", loc))
}

/// `f"{x=}"` prints the expression text; the `=` is not part of it.
fn strip_debug_marker(expression: &str) -> String {
    let trimmed = expression.trim_end();
    if let Some(rest) = trimmed.strip_suffix('=') {
        if !rest.ends_with(['=', '!', '<', '>']) {
            return rest.to_string();
        }
    }
    expression.to_string()
}
