//! Static security analysis of candidate source.
//!
//! `analyze()` never executes anything: it parses the source into an owned
//! syntax tree and walks it against a [`Whitelist`], collecting violations
//! in source order. A parse failure is itself a (blocking) finding.

pub mod ast;
pub mod lexer;
pub mod parser;

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::policy::{Severity, ViolationKind, Whitelist};
use ast::{Expr, ExprKind, Location, Param, Stmt, StmtKind};

/// Sources larger than this are rejected without parsing.
pub const MAX_SOURCE_BYTES: usize = 1024 * 1024;

/// Names in the interpreter's builtin namespace. Referencing one the policy
/// does not allow (and the source does not bind) is an `UnlistedBuiltin`.
///
/// `Ellipsis`, `NotImplemented` and `__build_class__` are left out: the
/// worker always provides them.
const PYTHON_BUILTINS: &[&str] = &[
    "abs", "aiter", "all", "anext", "any", "ascii", "bin", "bool", "breakpoint", "bytearray",
    "bytes", "callable", "chr", "classmethod", "compile", "complex", "copyright", "credits",
    "delattr", "dict", "dir", "divmod", "enumerate", "eval", "exec", "exit", "filter", "float",
    "format", "frozenset", "getattr", "globals", "hasattr", "hash", "help", "hex", "id", "input",
    "int", "isinstance", "issubclass", "iter", "len", "license", "list", "locals", "map", "max",
    "memoryview", "min", "next", "object", "oct", "open", "ord", "pow", "print", "property",
    "quit", "range", "repr", "reversed", "round", "set", "setattr", "slice", "sorted",
    "staticmethod", "str", "sum", "super", "tuple", "type", "vars", "zip", "__import__",
    "BaseException", "BaseExceptionGroup", "Exception", "ExceptionGroup", "ArithmeticError",
    "AssertionError", "AttributeError", "BlockingIOError", "BrokenPipeError", "BufferError",
    "BytesWarning", "ChildProcessError", "ConnectionAbortedError", "ConnectionError",
    "ConnectionRefusedError", "ConnectionResetError", "DeprecationWarning", "EOFError",
    "EncodingWarning", "EnvironmentError", "FileExistsError", "FileNotFoundError",
    "FloatingPointError", "FutureWarning", "GeneratorExit", "IOError", "ImportError",
    "ImportWarning", "IndentationError", "IndexError", "InterruptedError", "IsADirectoryError",
    "KeyError", "KeyboardInterrupt", "LookupError", "MemoryError", "ModuleNotFoundError",
    "NameError", "NotADirectoryError", "NotImplementedError", "OSError", "OverflowError",
    "PendingDeprecationWarning", "PermissionError", "ProcessLookupError", "RecursionError",
    "ReferenceError", "ResourceWarning", "RuntimeError", "RuntimeWarning", "StopAsyncIteration",
    "StopIteration", "SyntaxError", "SyntaxWarning", "SystemError", "SystemExit", "TabError",
    "TimeoutError", "TypeError", "UnboundLocalError", "UnicodeDecodeError", "UnicodeEncodeError",
    "UnicodeError", "UnicodeTranslateError", "UnicodeWarning", "UserWarning", "ValueError",
    "Warning", "ZeroDivisionError",
];

/// Lexing or parsing failure, with the position it was detected at.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxError {
    pub message: String,
    pub location: Location,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, location: Location) -> Self {
        Self {
            message: message.into(),
            location,
        }
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (line {}, column {})",
            self.message, self.location.line, self.location.column
        )
    }
}

impl std::error::Error for SyntaxError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub identifier: String,
    pub location: Location,
    pub severity: Severity,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} '{}' at {}:{}",
            self.kind.name(),
            self.identifier,
            self.location.line,
            self.location.column
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub is_safe: bool,
    pub violations: Vec<Violation>,
    /// 1.0 for clean source, lowered per finding, floored at 0.0.
    pub security_score: f64,
}

impl AnalysisReport {
    fn from_violations(mut violations: Vec<Violation>) -> Self {
        violations.sort_by_key(|v| v.location);
        let penalty: f64 = violations.iter().map(|v| v.severity.penalty()).sum();
        Self {
            is_safe: !violations.iter().any(|v| v.severity == Severity::Blocking),
            security_score: (1.0 - penalty).clamp(0.0, 1.0),
            violations,
        }
    }

    fn syntax_failure(message: String, location: Location) -> Self {
        Self {
            is_safe: false,
            violations: vec![Violation {
                kind: ViolationKind::SyntaxViolation,
                identifier: message,
                location,
                severity: Severity::Blocking,
            }],
            security_score: 0.0,
        }
    }

    pub fn blocking_violations(&self) -> impl Iterator<Item = &Violation> {
        self.violations
            .iter()
            .filter(|v| v.severity == Severity::Blocking)
    }

    /// One line per blocking finding, for logs and error summaries.
    pub fn summary(&self) -> String {
        let lines: Vec<String> = self.blocking_violations().map(|v| v.to_string()).collect();
        if lines.is_empty() {
            "no blocking violations".to_string()
        } else {
            lines.join("; ")
        }
    }
}

/// Analyzes `source` against `whitelist`. Never executes the code.
pub fn analyze(source: &str, whitelist: &Whitelist) -> AnalysisReport {
    if source.len() > MAX_SOURCE_BYTES {
        return AnalysisReport::syntax_failure(
            format!("source is {} bytes, limit is {MAX_SOURCE_BYTES}", source.len()),
            Location { line: 1, column: 1 },
        );
    }

    let module = match parser::parse_module(source) {
        Ok(module) => module,
        Err(e) => return AnalysisReport::syntax_failure(e.message, e.location),
    };

    let mut bindings = Bindings::default();
    for stmt in &module {
        bindings.collect_stmt(stmt);
    }

    let mut visitor = Visitor {
        whitelist,
        bindings,
        violations: Vec::new(),
    };
    for stmt in &module {
        visitor.visit_stmt(stmt);
    }
    AnalysisReport::from_violations(visitor.violations)
}

// ── binding collection ──────────────────────────────────

/// Every name the source binds anywhere, plus names bound to imported modules.
#[derive(Default)]
struct Bindings {
    names: HashSet<String>,
    /// Local name → top-level module it refers to.
    module_aliases: HashMap<String, String>,
}

impl Bindings {
    fn collect_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::FunctionDef { name, params, body, .. } => {
                self.names.insert(name.clone());
                self.collect_params(params);
                self.collect_body(body);
            }
            StmtKind::ClassDef { name, body, .. } => {
                self.names.insert(name.clone());
                self.collect_body(body);
            }
            StmtKind::Assign { targets, .. } => {
                for target in targets {
                    self.collect_target(target);
                }
            }
            StmtKind::AugAssign { target, .. } | StmtKind::AnnAssign { target, .. } => {
                self.collect_target(target)
            }
            StmtKind::For { target, body, orelse, .. } => {
                self.collect_target(target);
                self.collect_body(body);
                self.collect_body(orelse);
            }
            StmtKind::While { body, orelse, .. } | StmtKind::If { body, orelse, .. } => {
                self.collect_body(body);
                self.collect_body(orelse);
            }
            StmtKind::With { items, body, .. } => {
                for item in items {
                    if let Some(target) = &item.target {
                        self.collect_target(target);
                    }
                }
                self.collect_body(body);
            }
            StmtKind::Try { body, handlers, orelse, finalbody } => {
                self.collect_body(body);
                for handler in handlers {
                    if let Some(name) = &handler.name {
                        self.names.insert(name.clone());
                    }
                    self.collect_body(&handler.body);
                }
                self.collect_body(orelse);
                self.collect_body(finalbody);
            }
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    let root = alias.name.split('.').next().unwrap_or(&alias.name);
                    let local = alias.asname.as_deref().unwrap_or(root);
                    // `import a.b as c` binds c to the submodule, not to `a`.
                    if alias.asname.is_none() || !alias.name.contains('.') {
                        self.module_aliases.insert(local.to_string(), root.to_string());
                    }
                    self.names.insert(local.to_string());
                }
            }
            StmtKind::ImportFrom { names, .. } => {
                for alias in names {
                    if alias.name != "*" {
                        let local = alias.asname.as_ref().unwrap_or(&alias.name);
                        self.names.insert(local.clone());
                    }
                }
            }
            StmtKind::Global(names) | StmtKind::Nonlocal(names) => {
                self.names.extend(names.iter().cloned());
            }
            StmtKind::Return(_)
            | StmtKind::Delete(_)
            | StmtKind::Raise { .. }
            | StmtKind::Assert { .. }
            | StmtKind::Expr(_)
            | StmtKind::Pass
            | StmtKind::Break
            | StmtKind::Continue => {}
        }
        for expr in stmt_exprs(stmt) {
            self.collect_expr(expr);
        }
    }

    fn collect_body(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.collect_stmt(stmt);
        }
    }

    fn collect_params(&mut self, params: &[Param]) {
        self.names.extend(params.iter().map(|p| p.name.clone()));
    }

    fn collect_target(&mut self, target: &Expr) {
        match &target.kind {
            ExprKind::Name(name) => {
                self.names.insert(name.clone());
            }
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                for item in items {
                    self.collect_target(item);
                }
            }
            ExprKind::Starred(inner) => self.collect_target(inner),
            _ => {}
        }
    }

    /// Bindings that live inside expressions: walrus, lambda, comprehensions.
    fn collect_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::NamedExpr { target, .. } => self.collect_target(target),
            ExprKind::Lambda { params, .. } => self.collect_params(params),
            ExprKind::Comprehension { generators, .. } => {
                for generator in generators {
                    self.collect_target(&generator.target);
                }
            }
            _ => {}
        }
        for child in expr_children(expr) {
            self.collect_expr(child);
        }
    }

    fn is_bound(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

// ── security walk ───────────────────────────────────────

struct Visitor<'a> {
    whitelist: &'a Whitelist,
    bindings: Bindings,
    violations: Vec<Violation>,
}

impl Visitor<'_> {
    fn report(&mut self, kind: ViolationKind, identifier: impl Into<String>, location: Location) {
        self.violations.push(Violation {
            kind,
            identifier: identifier.into(),
            location,
            severity: self.whitelist.severity_of(kind),
        });
    }

    fn visit_body(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.visit_stmt(stmt);
        }
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        let loc = stmt.loc;
        match &stmt.kind {
            StmtKind::FunctionDef { name, params, body, .. } => {
                self.check_binding(name, loc);
                self.check_params(params);
                self.visit_body(body);
            }
            StmtKind::ClassDef { name, body, .. } => {
                self.check_binding(name, loc);
                self.visit_body(body);
            }
            StmtKind::For { body, orelse, .. }
            | StmtKind::While { body, orelse, .. }
            | StmtKind::If { body, orelse, .. } => {
                self.visit_body(body);
                self.visit_body(orelse);
            }
            StmtKind::With { body, .. } => self.visit_body(body),
            StmtKind::Try { body, handlers, orelse, finalbody } => {
                self.visit_body(body);
                for handler in handlers {
                    if let Some(name) = &handler.name {
                        self.check_binding(name, handler.loc);
                    }
                    if let Some(kind) = &handler.kind {
                        self.visit_expr(kind);
                    }
                    self.visit_body(&handler.body);
                }
                self.visit_body(orelse);
                self.visit_body(finalbody);
            }
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    let path: Vec<&str> = alias.name.split('.').collect();
                    self.check_module_path(&path, alias.loc);
                    if let Some(asname) = &alias.asname {
                        self.check_binding(asname, alias.loc);
                    }
                }
            }
            StmtKind::ImportFrom { module, names, level } => {
                self.check_import_from(module.as_deref(), names, *level, loc)
            }
            StmtKind::Global(names) | StmtKind::Nonlocal(names) => {
                let keyword = if matches!(stmt.kind, StmtKind::Global(_)) {
                    "global"
                } else {
                    "nonlocal"
                };
                self.report(ViolationKind::DiscouragedConstruct, keyword, loc);
                for name in names {
                    self.check_binding(name, loc);
                }
            }
            _ => {}
        }
        for expr in stmt_exprs(stmt) {
            self.visit_expr(expr);
        }
    }

    fn check_import_from(
        &mut self,
        module: Option<&str>,
        names: &[ast::Alias],
        level: usize,
        loc: Location,
    ) {
        if level > 0 {
            let dots = ".".repeat(level);
            self.report(
                ViolationKind::ForbiddenImport,
                format!("{dots}{}", module.unwrap_or_default()),
                loc,
            );
            return;
        }
        let Some(module) = module else { return };
        let base: Vec<&str> = module.split('.').collect();
        if !self.check_module_path(&base, loc) {
            return;
        }
        for alias in names {
            if alias.name == "*" {
                self.report(ViolationKind::DiscouragedConstruct, format!("{module}.*"), alias.loc);
                continue;
            }
            let mut path = base.clone();
            path.push(&alias.name);
            self.check_module_path(&path, alias.loc);
            if let Some(asname) = &alias.asname {
                self.check_binding(asname, alias.loc);
            }
        }
    }

    /// Checks `root.a.b` against the whitelist. Returns false when the root
    /// module itself is not allowed.
    fn check_module_path(&mut self, path: &[&str], loc: Location) -> bool {
        let root = path[0];
        if !self.whitelist.allows_module(root) {
            self.report(ViolationKind::ForbiddenImport, path.join("."), loc);
            return false;
        }
        for (i, component) in path.iter().enumerate().skip(1) {
            let shown = path[..=i].join(".");
            if self.whitelist.is_forbidden(component) {
                self.report(ViolationKind::ForbiddenCall, *component, loc);
            } else if component.starts_with('_')
                || (i == 1 && !self.whitelist.allows_module_attribute(root, component))
            {
                self.report(ViolationKind::UnlistedAttribute, shown, loc);
            }
        }
        true
    }

    fn check_params(&mut self, params: &[Param]) {
        for param in params {
            self.check_binding(&param.name, param.loc);
        }
    }

    /// A name being bound (def, class, parameter, alias).
    fn check_binding(&mut self, name: &str, loc: Location) {
        if self.whitelist.is_forbidden(name) {
            self.report(ViolationKind::ForbiddenCall, name, loc);
        }
    }

    fn check_name(&mut self, name: &str, loc: Location) {
        if self.whitelist.is_forbidden(name) {
            self.report(ViolationKind::ForbiddenCall, name, loc);
        } else if PYTHON_BUILTINS.contains(&name)
            && !self.whitelist.allows_builtin(name)
            && !self.bindings.is_bound(name)
        {
            self.report(ViolationKind::UnlistedBuiltin, name, loc);
        }
    }

    fn check_attribute(&mut self, value: &Expr, attr: &str, loc: Location) {
        if self.whitelist.is_forbidden(attr) {
            self.report(ViolationKind::ForbiddenCall, attr, loc);
            return;
        }
        let ExprKind::Name(local) = &value.kind else {
            return;
        };
        let Some(module) = self.bindings.module_aliases.get(local).cloned() else {
            return;
        };
        if !self.whitelist.allows_module(&module) {
            // Already reported at the import.
            return;
        }
        if attr.starts_with('_') || !self.whitelist.allows_module_attribute(&module, attr) {
            self.report(ViolationKind::UnlistedAttribute, format!("{module}.{attr}"), loc);
        }
    }

    /// Flags forbidden identifiers embedded in string text, which would
    /// otherwise reach attributes through `str.format` field paths.
    fn scan_string(&mut self, text: &str, loc: Location) {
        let mut seen = HashSet::new();
        for word in text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_')) {
            if word.contains('_') && self.whitelist.is_forbidden(word) && seen.insert(word) {
                self.report(ViolationKind::ForbiddenCall, word, loc);
            }
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Name(name) => self.check_name(name, expr.loc),
            ExprKind::Attribute { value, attr } => self.check_attribute(value, attr, expr.loc),
            ExprKind::Str(text) | ExprKind::FString { text, .. } => self.scan_string(text, expr.loc),
            ExprKind::Lambda { params, .. } => self.check_params(params),
            _ => {}
        }
        for child in expr_children(expr) {
            self.visit_expr(child);
        }
    }
}

/// Expressions held directly by a statement (not by its nested bodies).
fn stmt_exprs(stmt: &Stmt) -> Vec<&Expr> {
    let mut out: Vec<&Expr> = Vec::new();
    match &stmt.kind {
        StmtKind::FunctionDef { params, decorators, returns, .. } => {
            out.extend(decorators);
            for param in params {
                out.extend(param.annotation.as_ref());
                out.extend(param.default.as_ref());
            }
            out.extend(returns.as_ref());
        }
        StmtKind::ClassDef { bases, keywords, decorators, .. } => {
            out.extend(decorators);
            out.extend(bases);
            out.extend(keywords.iter().map(|k| &k.value));
        }
        StmtKind::Return(value) => out.extend(value.as_ref()),
        StmtKind::Delete(targets) => out.extend(targets),
        StmtKind::Assign { targets, value } => {
            out.extend(targets);
            out.push(value);
        }
        StmtKind::AugAssign { target, value, .. } => {
            out.push(target);
            out.push(value);
        }
        StmtKind::AnnAssign { target, annotation, value } => {
            out.push(target);
            out.push(annotation);
            out.extend(value.as_ref());
        }
        StmtKind::For { target, iter, .. } => {
            out.push(target);
            out.push(iter);
        }
        StmtKind::While { test, .. } | StmtKind::If { test, .. } => out.push(test),
        StmtKind::With { items, .. } => {
            for item in items {
                out.push(&item.context);
                out.extend(item.target.as_ref());
            }
        }
        StmtKind::Raise { exc, cause } => {
            out.extend(exc.as_ref());
            out.extend(cause.as_ref());
        }
        StmtKind::Assert { test, msg } => {
            out.push(test);
            out.extend(msg.as_ref());
        }
        StmtKind::Expr(expr) => out.push(expr),
        StmtKind::Try { .. }
        | StmtKind::Import(_)
        | StmtKind::ImportFrom { .. }
        | StmtKind::Global(_)
        | StmtKind::Nonlocal(_)
        | StmtKind::Pass
        | StmtKind::Break
        | StmtKind::Continue => {}
    }
    out
}

/// Direct sub-expressions of `expr`.
fn expr_children(expr: &Expr) -> Vec<&Expr> {
    let mut out: Vec<&Expr> = Vec::new();
    match &expr.kind {
        ExprKind::Name(_) | ExprKind::Literal(_) | ExprKind::Str(_) => {}
        ExprKind::FString { fields, .. } => out.extend(fields),
        ExprKind::Attribute { value, .. } => out.push(value),
        ExprKind::Subscript { value, index } => {
            out.push(value);
            out.push(index);
        }
        ExprKind::Slice { lower, upper, step } => {
            out.extend([lower, upper, step].into_iter().flatten().map(|b| &**b));
        }
        ExprKind::Call { func, args, keywords } => {
            out.push(func);
            out.extend(args);
            out.extend(keywords.iter().map(|k| &k.value));
        }
        ExprKind::BinOp { left, right, .. } => {
            out.push(left);
            out.push(right);
        }
        ExprKind::UnaryOp { operand, .. } => out.push(operand),
        ExprKind::BoolOp { values, .. } => out.extend(values),
        ExprKind::Compare { left, comparators, .. } => {
            out.push(left);
            out.extend(comparators);
        }
        ExprKind::IfExp { test, body, orelse } => {
            out.push(test);
            out.push(body);
            out.push(orelse);
        }
        ExprKind::Lambda { params, body } => {
            out.extend(params.iter().filter_map(|p| p.default.as_ref()));
            out.push(body);
        }
        ExprKind::NamedExpr { target, value } => {
            out.push(target);
            out.push(value);
        }
        ExprKind::List(items) | ExprKind::Tuple(items) | ExprKind::Set(items) => out.extend(items),
        ExprKind::Dict(entries) => {
            for (key, value) in entries {
                out.extend(key.as_ref());
                out.push(value);
            }
        }
        ExprKind::Comprehension { element, value, generators, .. } => {
            out.push(element);
            out.extend(value.as_deref());
            for generator in generators {
                out.push(&generator.target);
                out.push(&generator.iter);
                out.extend(&generator.ifs);
            }
        }
        ExprKind::Starred(inner)
        | ExprKind::Await(inner)
        | ExprKind::YieldFrom(inner) => out.push(inner),
        ExprKind::Yield(value) => out.extend(value.as_deref()),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyRegistry;
    use std::sync::Arc;

    fn policy(name: &str) -> Arc<Whitelist> {
        PolicyRegistry::builtin().unwrap().resolve(name).unwrap()
    }

    fn run(source: &str) -> AnalysisReport {
        analyze(source, &policy("default"))
    }

    fn kinds(report: &AnalysisReport) -> Vec<(ViolationKind, &str)> {
        report
            .violations
            .iter()
            .map(|v| (v.kind, v.identifier.as_str()))
            .collect()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    // ── clean source ────────────────────────────────────

    #[test]
    fn test_simple_function_is_safe() {
        let report = run("def add(a, b):\n    return a + b\n");
        assert!(report.is_safe);
        assert!(report.violations.is_empty());
        assert!(approx(report.security_score, 1.0));
    }

    #[test]
    fn test_empty_source_is_safe() {
        let report = run("");
        assert!(report.is_safe);
        assert!(approx(report.security_score, 1.0));
    }

    #[test]
    fn test_realistic_function_is_safe() {
        let src = r#"
import math
from collections import Counter
from functools import reduce

def stats(values, *, precision=2):
    """Summary statistics."""
    counts = Counter(values)
    total = reduce(lambda a, b: a + b, values, 0)
    mean = total / len(values) if values else 0.0
    spread = math.sqrt(sum((v - mean) ** 2 for v in values) / max(len(values), 1))
    top = sorted(counts.items(), key=lambda kv: (-kv[1], kv[0]))[:3]
    print(f"mean={mean:.{precision}f}")
    return {"mean": round(mean, precision), "stddev": round(spread, precision), "top": top}
"#;
        let report = run(src);
        assert!(report.is_safe, "{:?}", report.violations);
        assert!(report.violations.is_empty(), "{:?}", report.violations);
    }

    #[test]
    fn test_bound_names_shadow_builtins() {
        // `callable` and `id` are not in the standard policy but are bound here.
        let report = run("def f(callable, xs):\n    id = len(xs)\n    return callable(id)\n");
        assert!(report.violations.is_empty(), "{:?}", report.violations);
    }

    // ── imports ─────────────────────────────────────────

    #[test]
    fn test_import_os_rejected() {
        let report = run("import os\n\ndef f():\n    return os.getcwd()\n");
        assert!(!report.is_safe);
        assert_eq!(kinds(&report), vec![(ViolationKind::ForbiddenImport, "os")]);
        assert_eq!(report.violations[0].location, Location { line: 1, column: 1 });
        assert!(approx(report.security_score, 0.7));
    }

    #[test]
    fn test_from_import_forbidden_module() {
        let report = run("from subprocess import run\n");
        assert_eq!(kinds(&report), vec![(ViolationKind::ForbiddenImport, "subprocess")]);
    }

    #[test]
    fn test_dotted_import_of_forbidden_root() {
        let report = run("import os.path as p\n");
        assert_eq!(kinds(&report), vec![(ViolationKind::ForbiddenImport, "os.path")]);
    }

    #[test]
    fn test_relative_import_rejected() {
        let report = run("from . import helpers\nfrom ..pkg import x\n");
        assert_eq!(
            kinds(&report),
            vec![
                (ViolationKind::ForbiddenImport, "."),
                (ViolationKind::ForbiddenImport, "..pkg"),
            ]
        );
    }

    #[test]
    fn test_unlisted_attribute_of_only_rule_module() {
        let report = run("from operator import attrgetter\n");
        assert_eq!(
            kinds(&report),
            vec![(ViolationKind::UnlistedAttribute, "operator.attrgetter")]
        );

        let report = run("import json\n\ndef f(p):\n    return json.load(p)\n");
        assert_eq!(kinds(&report), vec![(ViolationKind::UnlistedAttribute, "json.load")]);
        assert!(!report.is_safe);
    }

    #[test]
    fn test_listed_attribute_allowed() {
        let report = run("import json\n\ndef f(s):\n    return json.dumps(json.loads(s))\n");
        assert!(report.violations.is_empty(), "{:?}", report.violations);
    }

    #[test]
    fn test_private_module_attribute_rejected() {
        let report = run("import random\n\ndef f():\n    return random._os\n");
        assert_eq!(kinds(&report), vec![(ViolationKind::UnlistedAttribute, "random._os")]);

        let report = run("from random import _os\n");
        assert_eq!(kinds(&report), vec![(ViolationKind::UnlistedAttribute, "random._os")]);
    }

    #[test]
    fn test_string_and_typing_limited_to_plain_members() {
        let report = run("import string\n\ndef f():\n    return string.Formatter()\n");
        assert_eq!(
            kinds(&report),
            vec![(ViolationKind::UnlistedAttribute, "string.Formatter")]
        );
        assert!(!report.is_safe);

        let report = run("from typing import get_type_hints, ForwardRef\n");
        assert_eq!(
            kinds(&report),
            vec![
                (ViolationKind::UnlistedAttribute, "typing.get_type_hints"),
                (ViolationKind::UnlistedAttribute, "typing.ForwardRef"),
            ]
        );

        let report = run("def f(ref):\n    return ref._evaluate({}, {}, frozenset())\n");
        assert_eq!(kinds(&report), vec![(ViolationKind::ForbiddenCall, "_evaluate")]);

        let report = run(
            "import string\nfrom typing import Optional\n\ndef f(s: Optional[str]):\n    return string.capwords(s or string.digits)\n",
        );
        assert!(report.violations.is_empty(), "{:?}", report.violations);
    }

    #[test]
    fn test_aliased_module_attribute_checked() {
        let report = run("import json as j\nx = j.load\n");
        assert_eq!(kinds(&report), vec![(ViolationKind::UnlistedAttribute, "json.load")]);
    }

    #[test]
    fn test_star_import_is_discouraged() {
        let report = run("from math import *\n");
        assert_eq!(kinds(&report), vec![(ViolationKind::DiscouragedConstruct, "math.*")]);
        assert!(report.is_safe);
        assert!(approx(report.security_score, 0.95));
    }

    // ── forbidden identifiers ───────────────────────────

    #[test]
    fn test_eval_and_exec_rejected() {
        let report = run("def f(s):\n    eval(s)\n    exec(s)\n");
        assert_eq!(
            kinds(&report),
            vec![(ViolationKind::ForbiddenCall, "eval"), (ViolationKind::ForbiddenCall, "exec")]
        );
        assert_eq!(report.violations[1].location.line, 3);
    }

    #[test]
    fn test_dunder_traversal_rejected() {
        let report = run("x = ().__class__.__bases__[0].__subclasses__()\n");
        let idents: Vec<&str> = report.violations.iter().map(|v| v.identifier.as_str()).collect();
        assert!(idents.contains(&"__class__"));
        assert!(idents.contains(&"__bases__"));
        assert!(idents.contains(&"__subclasses__"));
        assert!(!report.is_safe);
    }

    #[test]
    fn test_forbidden_name_in_nested_scopes() {
        let src = "\
def outer():
    class Inner:
        def method(self):
            return [lambda: open('x') for _ in range(2)]
    return Inner
";
        let report = run(src);
        assert_eq!(kinds(&report), vec![(ViolationKind::ForbiddenCall, "open")]);
        assert_eq!(report.violations[0].location.line, 4);
    }

    #[test]
    fn test_defining_forbidden_name_rejected() {
        let report = run("def eval(x):\n    return x\n");
        assert_eq!(kinds(&report), vec![(ViolationKind::ForbiddenCall, "eval")]);
    }

    #[test]
    fn test_format_string_dunder_rejected() {
        let report = run("def f(x):\n    return '{0.__class__}'.format(x)\n");
        assert_eq!(kinds(&report), vec![(ViolationKind::ForbiddenCall, "__class__")]);
    }

    #[test]
    fn test_fstring_field_is_walked() {
        let report = run("def f(x):\n    return f'{x.__globals__!r}'\n");
        assert!(report
            .violations
            .iter()
            .any(|v| v.kind == ViolationKind::ForbiddenCall && v.identifier == "__globals__"));
    }

    #[test]
    fn test_prose_in_strings_not_flagged() {
        let report = run("MSG = 'open the file and eval the result'\n");
        assert!(report.violations.is_empty(), "{:?}", report.violations);
    }

    #[test]
    fn test_strict_forbids_print() {
        let report = analyze("def f():\n    print(1)\n", &policy("strict"));
        assert_eq!(kinds(&report), vec![(ViolationKind::ForbiddenCall, "print")]);
    }

    // ── advisory findings ───────────────────────────────

    #[test]
    fn test_unlisted_builtin_is_advisory_in_standard() {
        let report = run("def f(x):\n    return id(x)\n");
        assert_eq!(kinds(&report), vec![(ViolationKind::UnlistedBuiltin, "id")]);
        assert_eq!(report.violations[0].severity, Severity::Advisory);
        assert!(report.is_safe);
        assert!(approx(report.security_score, 0.95));
    }

    #[test]
    fn test_unlisted_builtin_is_blocking_in_strict() {
        let report = analyze("def f(x):\n    return hex(x)\n", &policy("strict"));
        assert_eq!(kinds(&report), vec![(ViolationKind::UnlistedBuiltin, "hex")]);
        assert!(!report.is_safe);
    }

    #[test]
    fn test_global_is_discouraged() {
        let report = run("counter = 0\n\ndef bump():\n    global counter\n    counter += 1\n");
        assert_eq!(kinds(&report), vec![(ViolationKind::DiscouragedConstruct, "global")]);
        assert!(report.is_safe);
    }

    // ── syntax and limits ───────────────────────────────

    #[test]
    fn test_syntax_error_is_single_violation() {
        let report = run("def broken(:\n    pass\n");
        assert!(!report.is_safe);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].kind, ViolationKind::SyntaxViolation);
        assert!(approx(report.security_score, 0.0));
    }

    #[test]
    fn test_carriage_return_ends_comment() {
        let report = run("x = 1 # c\rimport os\n");
        assert_eq!(kinds(&report), vec![(ViolationKind::ForbiddenImport, "os")]);
        assert_eq!(report.violations[0].location.line, 2);

        let report = run("def f():\n    x = 1 # note\r    return ().__class__\n");
        assert_eq!(kinds(&report), vec![(ViolationKind::ForbiddenCall, "__class__")]);
        assert!(!report.is_safe);
    }

    #[test]
    fn test_compatibility_identifier_fails_closed() {
        let report = run("def f():\n    return \u{ff45}\u{ff56}\u{ff41}\u{ff4c}('1')\n");
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].kind, ViolationKind::SyntaxViolation);
        assert!(!report.is_safe);
    }

    #[test]
    fn test_unsupported_syntax_fails_closed() {
        let report = run("match x:\n    case 1:\n        pass\n");
        assert_eq!(report.violations[0].kind, ViolationKind::SyntaxViolation);
        assert!(!report.is_safe);
    }

    #[test]
    fn test_oversized_source_rejected() {
        let src = format!("x = '{}'\n", "a".repeat(MAX_SOURCE_BYTES));
        let report = run(&src);
        assert_eq!(report.violations[0].kind, ViolationKind::SyntaxViolation);
        assert!(report.violations[0].identifier.contains("limit"));
    }

    #[test]
    fn test_deep_nesting_rejected() {
        let src = format!("x = {}1{}\n", "[".repeat(300), "]".repeat(300));
        let report = run(&src);
        assert_eq!(report.violations[0].kind, ViolationKind::SyntaxViolation);
    }

    // ── score and ordering ──────────────────────────────

    #[test]
    fn test_score_floors_at_zero() {
        let report = run("import os\nimport sys\nimport socket\nimport shutil\n");
        assert_eq!(report.violations.len(), 4);
        assert!(approx(report.security_score, 0.0));
    }

    #[test]
    fn test_score_monotonic_in_violations() {
        let one = run("import os\n");
        let two = run("import os\nimport sys\n");
        let advisory = run("import os\nx = id(1)\n");
        assert!(two.security_score < one.security_score);
        assert!(advisory.security_score < one.security_score);
        assert!(advisory.security_score > two.security_score);
    }

    #[test]
    fn test_violations_ordered_by_location() {
        let report = run("x = eval('1')\nimport os\ny = x.__dict__\n");
        let lines: Vec<usize> = report.violations.iter().map(|v| v.location.line).collect();
        assert_eq!(lines, vec![1, 2, 3]);
    }

    #[test]
    fn test_deterministic() {
        let src = "import os\nfrom json import load\nx = eval('1')\n";
        assert_eq!(run(src), run(src));
    }

    #[test]
    fn test_report_serialization() {
        let report = run("import os\n");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["is_safe"], false);
        assert_eq!(json["violations"][0]["kind"], "ForbiddenImport");
        assert_eq!(json["violations"][0]["identifier"], "os");
        assert_eq!(json["violations"][0]["severity"], "blocking");
        assert_eq!(json["violations"][0]["location"]["line"], 1);
    }

    #[test]
    fn test_summary_lists_blocking_only() {
        let report = run("import os\nx = id(1)\n");
        assert_eq!(report.summary(), "ForbiddenImport 'os' at 1:1");
    }
}
