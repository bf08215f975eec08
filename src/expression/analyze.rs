//! Static free-variable analysis.
//!
//! Reads are reported as root identifiers plus every member/index chain
//! prefix (`a`, `a.b`, `a.b[0]`). A computed index with a non-literal key ends
//! the chain at the preceding segment; the key expression is analyzed on its
//! own. Names bound by arrow parameters or block-local declarations are not
//! free.

use std::collections::{HashMap, HashSet};

use indexmap::{IndexMap, IndexSet};

use super::ast::*;
use crate::diagnostics::Diagnostics;
use crate::error::WARN_CIRCULAR_FUNCTION;
use crate::path::PathSet;
use crate::value::{format_number, Value};

/// Free-variable closure of each known function, by name.
pub type FunctionClosures = HashMap<String, PathSet>;

/// Reads of `expr`, with known function names expanded to their closures.
pub fn free_variables(expr: &Expr, functions: &FunctionClosures) -> PathSet {
    let mut collector = Collector::new(Some(functions));
    collector.expr(expr);
    collector.reads
}

/// Resolve the transitive closure of every function in `functions`.
///
/// A function absorbs the reads of every known function reachable from its
/// body, so all members of a cycle share the cycle's reads. Only the back
/// edge closing a cycle is dropped; each cycle is logged once.
pub fn resolve_closures(
    functions: &IndexMap<String, Expr>,
    diagnostics: &Diagnostics,
) -> FunctionClosures {
    let names: HashSet<&str> = functions.keys().map(String::as_str).collect();
    let mut direct: HashMap<String, (PathSet, IndexSet<String>)> = HashMap::new();
    for (name, body) in functions {
        let mut collector = Collector::new(None);
        collector.known = Some(&names);
        collector.expr(body);
        direct.insert(name.clone(), (collector.reads, collector.calls));
    }

    let mut resolver = Resolver {
        direct: &direct,
        warned: HashSet::new(),
        diagnostics,
    };
    functions
        .keys()
        .map(|name| (name.clone(), resolver.resolve(name)))
        .collect()
}

struct Resolver<'a> {
    direct: &'a HashMap<String, (PathSet, IndexSet<String>)>,
    /// Sorted member lists of cycles already reported.
    warned: HashSet<Vec<String>>,
    diagnostics: &'a Diagnostics,
}

impl Resolver<'_> {
    fn resolve(&mut self, name: &str) -> PathSet {
        let mut closure = PathSet::new();
        let mut stack = IndexSet::new();
        let mut seen = HashSet::new();
        self.visit(name, &mut closure, &mut stack, &mut seen);
        closure
    }

    fn visit(
        &mut self,
        name: &str,
        closure: &mut PathSet,
        stack: &mut IndexSet<String>,
        seen: &mut HashSet<String>,
    ) {
        if let Some(start) = stack.get_index_of(name) {
            let mut members: Vec<String> = stack.iter().skip(start).cloned().collect();
            members.sort();
            if self.warned.insert(members) {
                let chain: Vec<&str> = stack.iter().skip(start).map(String::as_str).collect();
                self.diagnostics.warn(
                    WARN_CIRCULAR_FUNCTION,
                    format!("circular function reference: {} -> {}", chain.join(" -> "), name),
                );
            }
            return;
        }
        if !seen.insert(name.to_string()) {
            return;
        }
        let direct = self.direct;
        let Some((reads, calls)) = direct.get(name) else {
            return;
        };
        closure.extend(reads.iter().cloned());
        stack.insert(name.to_string());
        for callee in calls {
            self.visit(callee, closure, stack, seen);
        }
        stack.pop();
    }
}

struct Collector<'f> {
    functions: Option<&'f FunctionClosures>,
    /// Known function names referenced by a body under resolution.
    known: Option<&'f HashSet<&'f str>>,
    locals: Vec<HashSet<String>>,
    reads: PathSet,
    calls: IndexSet<String>,
}

impl<'f> Collector<'f> {
    fn new(functions: Option<&'f FunctionClosures>) -> Self {
        Self {
            functions,
            known: None,
            locals: Vec::new(),
            reads: PathSet::new(),
            calls: IndexSet::new(),
        }
    }

    fn is_local(&self, name: &str) -> bool {
        self.locals.iter().any(|frame| frame.contains(name))
    }

    fn declare(&mut self, pattern: &Pattern) {
        let mut names = Vec::new();
        pattern.names(&mut names);
        if let Some(frame) = self.locals.last_mut() {
            frame.extend(names);
        }
        self.pattern_defaults(pattern);
    }

    fn pattern_defaults(&mut self, pattern: &Pattern) {
        match pattern {
            Pattern::Identifier(_) => {}
            Pattern::Array(items) => {
                for item in items.iter().flatten() {
                    self.pattern_defaults(item);
                }
            }
            Pattern::Object(props) => {
                for (_, p) in props {
                    self.pattern_defaults(p);
                }
            }
            Pattern::Default(inner, default) => {
                self.pattern_defaults(inner);
                self.expr(default);
            }
        }
    }

    /// Emit `root` and each chain prefix, unless the root is local.
    fn emit_chain(&mut self, root: &str, segments: &[String]) {
        if self.is_local(root) {
            return;
        }
        if let Some(known) = self.known {
            if known.contains(root) {
                self.calls.insert(root.to_string());
                return;
            }
        }
        if let Some(closure) = self.functions.and_then(|f| f.get(root)) {
            self.reads.extend(closure.iter().cloned());
            return;
        }
        let mut path = root.to_string();
        self.reads.insert(path.clone());
        for segment in segments {
            path.push_str(segment);
            self.reads.insert(path.clone());
        }
    }

    /// Walk a member expression down to its root, collecting static segments.
    fn member(&mut self, expr: &Expr) {
        let mut segments: Vec<String> = Vec::new();
        let mut current = expr;
        loop {
            match current {
                Expr::Member {
                    object, property, ..
                } => {
                    match property {
                        MemberKey::Static(name) => segments.push(format!(".{}", name)),
                        MemberKey::Computed(key) => match literal_key(key) {
                            Some(segment) => segments.push(segment),
                            None => {
                                self.expr(key);
                                segments.clear();
                            }
                        },
                    }
                    current = object;
                }
                Expr::Identifier(root) => {
                    segments.reverse();
                    self.emit_chain(root, &segments);
                    return;
                }
                other => {
                    self.expr(other);
                    return;
                }
            }
        }
    }

    fn target(&mut self, target: &Target) {
        match target {
            Target::Identifier(name) => self.emit_chain(name, &[]),
            Target::Member { object, property } => {
                let as_member = Expr::Member {
                    object: object.clone(),
                    property: property.clone(),
                    optional: false,
                };
                self.member(&as_member);
            }
        }
    }

    fn elements(&mut self, elements: &[Element]) {
        for element in elements {
            match element {
                Element::Item(e) | Element::Spread(e) => self.expr(e),
                Element::Hole => {}
            }
        }
    }

    fn statements(&mut self, statements: &[Statement]) {
        for statement in statements {
            match statement {
                Statement::Let(pattern, init) => {
                    if let Some(init) = init {
                        self.expr(init);
                    }
                    self.declare(pattern);
                }
                Statement::Expr(e) => self.expr(e),
                Statement::Return(e) => {
                    if let Some(e) = e {
                        self.expr(e);
                    }
                }
                Statement::If {
                    test,
                    consequent,
                    alternate,
                } => {
                    self.expr(test);
                    self.statements(consequent);
                    self.statements(alternate);
                }
                Statement::Block(body) => self.statements(body),
            }
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Literal(_) => {}
            Expr::Identifier(name) => self.emit_chain(name, &[]),
            Expr::Template { expressions, .. } => expressions.iter().for_each(|e| self.expr(e)),
            Expr::Array(elements) => self.elements(elements),
            Expr::Object(properties) => {
                for property in properties {
                    match property {
                        Property::Entry { key, value } => {
                            if let PropertyName::Computed(key) = key {
                                self.expr(key);
                            }
                            self.expr(value);
                        }
                        Property::Spread(e) => self.expr(e),
                    }
                }
            }
            Expr::Member { .. } => self.member(expr),
            Expr::Call {
                callee, arguments, ..
            } => {
                self.expr(callee);
                self.elements(arguments);
            }
            Expr::New { arguments, .. } => self.elements(arguments),
            Expr::Unary { argument, .. } => self.expr(argument),
            Expr::Delete(target) => self.target(target),
            Expr::Binary { left, right, .. } | Expr::Logical { left, right, .. } => {
                self.expr(left);
                self.expr(right);
            }
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                self.expr(test);
                self.expr(consequent);
                self.expr(alternate);
            }
            Expr::Assign { target, value, .. } => {
                self.target(target);
                self.expr(value);
            }
            Expr::Update { target, .. } => self.target(target),
            Expr::Sequence(items) => items.iter().for_each(|e| self.expr(e)),
            Expr::Arrow(arrow) => {
                self.locals.push(HashSet::new());
                for param in &arrow.params {
                    self.declare(param);
                }
                match &arrow.body {
                    ArrowBody::Expr(body) => self.expr(body),
                    ArrowBody::Block(body) => self.statements(body),
                }
                self.locals.pop();
            }
        }
    }
}

fn literal_key(key: &Expr) -> Option<String> {
    match key {
        Expr::Literal(Value::Number(n)) => Some(format!("[{}]", format_number(*n))),
        Expr::Literal(Value::String(s)) => Some(format!(".{}", s)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::parse_expression;

    fn reads(source: &str) -> Vec<String> {
        let expr = parse_expression(source).unwrap();
        free_variables(&expr, &FunctionClosures::new())
            .into_iter()
            .collect()
    }

    #[test]
    fn test_member_chain_prefixes() {
        assert_eq!(reads("a.b.c"), vec!["a", "a.b", "a.b.c"]);
        assert_eq!(reads("items[0].name"), vec!["items", "items[0]", "items[0].name"]);
    }

    #[test]
    fn test_dynamic_index_ends_chain() {
        assert_eq!(reads("rows[i].label"), vec!["i", "rows"]);
    }

    #[test]
    fn test_output_is_ordered_and_deduplicated() {
        assert_eq!(reads("a + b + a"), vec!["a", "b"]);
    }

    #[test]
    fn test_arrow_params_and_locals_are_bound() {
        assert_eq!(
            reads("items.filter(item => item.done && item.owner === me)"),
            vec!["items", "items.filter", "me"]
        );
        assert_eq!(reads("() => { const x = y; return x + z; }"), vec!["y", "z"]);
    }

    #[test]
    fn test_known_function_expands_to_closure() {
        let mut functions = FunctionClosures::new();
        functions.insert(
            "fullName".to_string(),
            ["user.first".to_string(), "user.last".to_string()].into_iter().collect(),
        );
        let expr = parse_expression("fullName() + suffix").unwrap();
        let found: Vec<String> = free_variables(&expr, &functions).into_iter().collect();
        assert_eq!(found, vec!["user.first", "user.last", "suffix"]);
    }

    #[test]
    fn test_resolve_closures_is_transitive_and_cycle_safe() {
        let diagnostics = Diagnostics::new();
        let mut functions = IndexMap::new();
        functions.insert("a".to_string(), parse_expression("() => b() + x").unwrap());
        functions.insert("b".to_string(), parse_expression("() => y").unwrap());
        functions.insert("ping".to_string(), parse_expression("() => pong() + p").unwrap());
        functions.insert("pong".to_string(), parse_expression("() => ping() + q").unwrap());

        let closures = resolve_closures(&functions, &diagnostics);
        let a: Vec<String> = closures["a"].iter().cloned().collect();
        assert_eq!(a, vec!["x", "y"]);
        assert!(closures["ping"].contains("p") && closures["ping"].contains("q"));
        assert_eq!(diagnostics.count(WARN_CIRCULAR_FUNCTION), 1);
    }

    fn mutual_closures(order: [&str; 2]) -> FunctionClosures {
        let mut functions = IndexMap::new();
        for name in order {
            let body = match name {
                "ping" => "(n) => n > 0 ? pong(n - 1) : p",
                _ => "(n) => n > 0 ? ping(n - 1) : q",
            };
            functions.insert(name.to_string(), parse_expression(body).unwrap());
        }
        resolve_closures(&functions, &Diagnostics::new())
    }

    #[test]
    fn test_mutual_recursion_shares_reads_in_any_order() {
        for order in [["ping", "pong"], ["pong", "ping"]] {
            let closures = mutual_closures(order);
            for name in ["ping", "pong"] {
                let mut found: Vec<String> = closures[name].iter().cloned().collect();
                found.sort();
                assert_eq!(found, vec!["p", "q"], "{:?} {}", order, name);
            }
        }
    }
}
