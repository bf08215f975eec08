//! `v-for`: keyed list reconciliation.
//!
//! The element carrying `v-for` becomes a template. It is replaced in the
//! document by an anchor comment, and each iteration record renders a clone of
//! it after the anchor, in order, with its own child scope.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use indexmap::IndexMap;
use markup5ever_rcdom::Handle;
use regex::Regex;

use super::{Directive, DomUpdater, Priority};
use crate::app::Runtime;
use crate::dom;
use crate::error::{CompileError, EvalError, EvalResult, WARN_DUPLICATE_KEY};
use crate::expression::ast::{Expr, Pattern};
use crate::expression::eval::{bind_pattern, property_key};
use crate::expression::{builtins, parse_expression, Compiled, FunctionClosures};
use crate::node::{precompile, RenderNode};
use crate::path::{child_path, is_descendant, root_of, PathSet};
use crate::scope::Scope;
use crate::value::Value;

lazy_static::lazy_static! {
    static ref FOR_RE: Regex =
        Regex::new(r"(?s)^\s*(?P<lhs>.+?)\s+(?:in|of)\s+(?P<rhs>.+?)\s*$").unwrap();
}

/// `<alias> in <collection>`, where the alias is a name, a destructuring
/// pattern, or a parenthesized list of up to three of them
/// (`(value, key, index)`).
#[derive(Debug, Clone)]
pub struct ForExpression {
    pub source: String,
    pub params: Vec<Pattern>,
    /// Every name the alias binds, in order.
    pub names: Vec<String>,
    pub collection: Compiled,
}

impl ForExpression {
    pub fn parse(value: &str, functions: &FunctionClosures) -> Result<Self, CompileError> {
        let caps = FOR_RE
            .captures(value)
            .ok_or_else(|| CompileError::InvalidFor(value.to_string()))?;
        let lhs = caps["lhs"].trim();
        let rhs = caps["rhs"].trim();

        let arrow_source = if lhs.starts_with('(') && lhs.ends_with(')') {
            format!("{} => 0", lhs)
        } else {
            format!("({}) => 0", lhs)
        };
        let params = match parse_expression(&arrow_source) {
            Ok(Expr::Arrow(arrow)) => arrow.params.clone(),
            _ => return Err(CompileError::InvalidFor(value.to_string())),
        };
        if params.is_empty() || params.len() > 3 {
            return Err(CompileError::InvalidFor(value.to_string()));
        }
        let mut names = Vec::new();
        for param in &params {
            param.names(&mut names);
        }

        Ok(Self {
            source: value.to_string(),
            params,
            names,
            collection: Compiled::new(rhs, functions)?,
        })
    }

    fn is_plain_alias(&self) -> Option<&str> {
        match self.params.first() {
            Some(Pattern::Identifier(name)) => Some(name),
            _ => None,
        }
    }
}

/// One iteration record.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Default key: structural index, or the associative key.
    pub key: String,
    pub value: Value,
    /// Associative key for map and record sources.
    pub key_value: Option<Value>,
    pub index: usize,
    /// Change path of the element, when the collection is reactive.
    pub source: Option<String>,
}

impl Entry {
    fn indexed(index: usize, value: Value, source: Option<String>) -> Self {
        Self {
            key: index.to_string(),
            value,
            key_value: None,
            index,
            source,
        }
    }

    fn arguments(&self) -> Vec<Value> {
        let index = Value::from(self.index);
        match &self.key_value {
            Some(key) => vec![self.value.clone(), key.clone(), index],
            None => vec![self.value.clone(), index],
        }
    }
}

/// Iteration records for a collection value.
pub fn entries(collection: &Value) -> EvalResult<Vec<Entry>> {
    Ok(match collection {
        Value::Undefined | Value::Null => Vec::new(),
        Value::Number(n) => {
            if !n.is_finite() || *n < 0.0 || n.fract() != 0.0 {
                return Err(EvalError::Type(format!("invalid list length {}", n)));
            }
            (0..*n as usize)
                .map(|i| Entry::indexed(i, Value::from(i + 1), None))
                .collect()
        }
        Value::Reactive(r) => match r.target() {
            Value::Array(_) => builtins::iterate(collection)?
                .into_iter()
                .enumerate()
                .map(|(i, v)| Entry::indexed(i, v, Some(child_path(r.path(), &i.to_string(), true))))
                .collect(),
            Value::Object(_) => record_entries(collection, Some(r.path())),
            Value::Map(_) => map_entries(collection)?,
            _ => builtins::iterate(collection)?
                .into_iter()
                .enumerate()
                .map(|(i, v)| Entry::indexed(i, v, None))
                .collect(),
        },
        Value::Object(_) => record_entries(collection, None),
        Value::Map(_) => map_entries(collection)?,
        Value::Array(_) | Value::Set(_) | Value::String(_) => builtins::iterate(collection)?
            .into_iter()
            .enumerate()
            .map(|(i, v)| Entry::indexed(i, v, None))
            .collect(),
        other => {
            return Err(EvalError::Type(format!(
                "cannot iterate over a value of type {}",
                other.type_of()
            )))
        }
    })
}

fn record_entries(collection: &Value, path: Option<&str>) -> Vec<Entry> {
    builtins::entries_of(collection)
        .into_iter()
        .enumerate()
        .map(|(index, (key, value))| Entry {
            source: path.map(|p| child_path(p, &key, false)),
            key_value: Some(Value::string(&key)),
            key,
            value,
            index,
        })
        .collect()
}

fn map_entries(collection: &Value) -> EvalResult<Vec<Entry>> {
    let mut out = Vec::new();
    for (index, pair) in builtins::iterate(collection)?.into_iter().enumerate() {
        let (key, value) = match &pair {
            Value::Array(items) => {
                let items = items.borrow();
                (
                    items.first().cloned().unwrap_or_default(),
                    items.get(1).cloned().unwrap_or_default(),
                )
            }
            _ => (Value::Undefined, Value::Undefined),
        };
        out.push(Entry {
            key: property_key(&key),
            value,
            key_value: Some(key),
            index,
            source: None,
        });
    }
    Ok(out)
}

/// Claim a `v-for` element. The attribute is consumed and the rest of the
/// element is compiled as the item template.
pub fn parse(runtime: &Runtime, element: &Handle) -> Result<Option<Directive>, CompileError> {
    let prefix = &runtime.config().directive_prefix;
    let attribute = format!("{}for", prefix);
    let Some(value) = dom::get_attribute(element, &attribute) else {
        return Ok(None);
    };
    let expression = ForExpression::parse(&value, runtime.functions())?;
    dom::remove_attribute(element, &attribute);

    let mut key = None;
    for name in [":key".to_string(), format!("{}bind:key", prefix)] {
        if let Some(source) = dom::get_attribute(element, &name) {
            dom::remove_attribute(element, &name);
            key = Some(Compiled::new(&source, runtime.functions())?);
        }
    }
    precompile(runtime, element)?;

    let mut reads = expression.collection.reads.clone();
    if let Some(key) = &key {
        reads.extend(
            key.reads
                .iter()
                .filter(|r| !expression.names.iter().any(|n| n == root_of(r)))
                .cloned(),
        );
    }
    let names = expression.names.clone();
    let renderer = ListRenderer {
        expression,
        key,
        reads,
        items: RefCell::new(IndexMap::new()),
        extras: RefCell::new(Vec::new()),
    };
    Ok(Some(
        Directive::new("for")
            .with_priority(Priority::List)
            .with_updater(Rc::new(renderer))
            .structural(names),
    ))
}

struct Item {
    node: Rc<RenderNode>,
    source: Option<String>,
}

struct Record {
    key: String,
    entry: Entry,
    bindings: Vec<(String, Value)>,
    unique: bool,
}

struct ListRenderer {
    expression: ForExpression,
    key: Option<Compiled>,
    reads: PathSet,
    items: RefCell<IndexMap<String, Item>>,
    /// Items whose key duplicated an earlier one. Rebuilt every run.
    extras: RefCell<Vec<Item>>,
}

impl ListRenderer {
    fn records(&self, scope: &Scope) -> EvalResult<(Vec<Record>, HashSet<String>, Option<String>)> {
        let collection = self.expression.collection.eval(scope)?;
        let mut records = Vec::new();
        let mut seen = HashSet::new();
        let mut duplicate = None;
        for entry in entries(&collection)? {
            let frame = scope.frame();
            for (param, arg) in self.expression.params.iter().zip(entry.arguments()) {
                bind_pattern(param, arg, &frame)?;
            }
            let key = match &self.key {
                Some(key) => property_key(&key.eval(&frame)?),
                None => entry.key.clone(),
            };
            let bindings = self
                .expression
                .names
                .iter()
                .map(|name| (name.clone(), frame.get(name)))
                .collect();
            let unique = seen.insert(key.clone());
            if !unique && duplicate.is_none() {
                duplicate = Some(key.clone());
            }
            records.push(Record {
                key,
                entry,
                bindings,
                unique,
            });
        }
        Ok((records, seen, duplicate))
    }

    fn remove(&self, list: &Rc<RenderNode>, item: &Item) {
        let nodes = item.node.dom_nodes();
        item.node.destroy();
        list.release_child(&item.node);
        for node in nodes {
            dom::detach(&node);
        }
    }

    fn create(&self, list: &Rc<RenderNode>, after: &Handle, record: &Record) -> EvalResult<Item> {
        let clone = dom::deep_clone(list.dom());
        if !dom::insert_after(after, &clone) {
            return Err(EvalError::Custom("list anchor is not attached".to_string()));
        }
        let scope = list.scope().child();
        for (name, value) in &record.bindings {
            scope.define(name, value.clone());
        }
        let node = match list.spawn(clone.clone(), Some(scope.clone())) {
            Ok(node) => node,
            Err(e) => {
                dom::detach(&clone);
                scope.dispose();
                return Err(EvalError::Custom(e.to_string()));
            }
        };
        node.force_update();
        Ok(Item {
            node,
            source: record.entry.source.clone(),
        })
    }

    /// Rebind a kept item. Changes at or below the element's source path are
    /// mirrored onto the alias so the item's subtree sees them.
    fn refresh(&self, item: Item, record: &Record, changes: &PathSet) -> Item {
        let scope = item.node.scope();
        for (name, value) in &record.bindings {
            scope.bind(name, value.clone());
        }
        if let Some(source) = &record.entry.source {
            for change in changes {
                if change != source && !is_descendant(change, source) {
                    continue;
                }
                match self.expression.is_plain_alias() {
                    Some(alias) => scope.touch(&format!("{}{}", alias, &change[source.len()..])),
                    None => self.expression.names.iter().for_each(|n| scope.touch(n)),
                }
            }
        }
        item.node.update();
        Item {
            node: item.node,
            source: record.entry.source.clone(),
        }
    }
}

/// Move `node`'s document nodes to directly follow `after`, unless they
/// already do.
fn position(node: &Rc<RenderNode>, after: &Handle) {
    let nodes = node.dom_nodes();
    let Some(first) = nodes.first() else {
        return;
    };
    if dom::next_sibling(after).is_some_and(|next| dom::same_node(&next, first)) {
        return;
    }
    let mut cursor = after.clone();
    for dom_node in nodes {
        dom::insert_after(&cursor, &dom_node);
        cursor = dom_node;
    }
}

impl DomUpdater for ListRenderer {
    fn dependencies(&self) -> &PathSet {
        &self.reads
    }

    fn update(&self, list: &Rc<RenderNode>, _forced: bool) -> EvalResult<()> {
        let Some(anchor) = list.anchor().cloned() else {
            return Err(EvalError::Custom("list has no anchor".to_string()));
        };
        let (records, keys, duplicate) = self.records(list.scope())?;
        if let Some(key) = duplicate {
            list.runtime().diagnostics().warn(
                WARN_DUPLICATE_KEY,
                format!("duplicate key `{}` in `{}`", key, self.expression.source),
            );
        }

        let mut previous = std::mem::take(&mut *self.items.borrow_mut());
        let extras = std::mem::take(&mut *self.extras.borrow_mut());
        previous.retain(|key, item| {
            let keep = keys.contains(key);
            if !keep {
                self.remove(list, item);
            }
            keep
        });
        for item in &extras {
            self.remove(list, item);
        }

        let changes = list.scope().changes();
        let mut next = IndexMap::new();
        let mut next_extras = Vec::new();
        let mut failure = None;
        let mut cursor = anchor;
        for record in &records {
            let kept = if record.unique {
                previous.shift_remove(&record.key)
            } else {
                None
            };
            let item = match kept {
                Some(item) => {
                    position(&item.node, &cursor);
                    self.refresh(item, record, &changes)
                }
                None => match self.create(list, &cursor, record) {
                    Ok(item) => item,
                    Err(e) => {
                        failure.get_or_insert(e);
                        continue;
                    }
                },
            };
            if let Some(last) = item.node.dom_nodes().last() {
                cursor = last.clone();
            }
            if record.unique {
                next.insert(record.key.clone(), item);
            } else {
                next_extras.push(item);
            }
        }

        *self.items.borrow_mut() = next;
        *self.extras.borrow_mut() = next_extras;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn destroy(&self, _list: &Rc<RenderNode>) -> EvalResult<()> {
        // The items are children of the list node and are torn down with it.
        self.items.borrow_mut().clear();
        self.extras.borrow_mut().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::UpdateQueue;
    use serde_json::json;

    fn parse(source: &str) -> ForExpression {
        ForExpression::parse(source, &FunctionClosures::new()).unwrap()
    }

    #[test]
    fn test_alias_forms() {
        assert_eq!(parse("item in items").names, vec!["item"]);
        assert_eq!(parse("(item, i) of items").names, vec!["item", "i"]);
        assert_eq!(parse("(value, key, index) in record").names, vec!["value", "key", "index"]);
        assert_eq!(parse("{ id, title } in todos").names, vec!["id", "title"]);
        assert_eq!(parse("[k, v] of pairs").names, vec!["k", "v"]);
        assert!(parse("item in items.filter(i => i.done)")
            .collection
            .reads
            .contains("items"));
    }

    #[test]
    fn test_malformed_expressions() {
        for source in ["items", "in items", "(a, b, c, d) in x", "1 + 2 in x", "x in (("] {
            let err = ForExpression::parse(source, &FunctionClosures::new()).unwrap_err();
            assert!(
                matches!(err.code(), crate::error::ERR_INVALID_FOR | crate::error::ERR_SYNTAX),
                "{}: {}",
                source,
                err
            );
        }
    }

    #[test]
    fn test_entries_by_source_kind() {
        let keys = |v: Value| -> Vec<String> { entries(&v).unwrap().into_iter().map(|e| e.key).collect() };
        assert_eq!(keys(Value::from(3)), vec!["0", "1", "2"]);
        let counted = entries(&Value::from(2)).unwrap();
        assert_eq!(counted[1].value.to_number(), 2.0);
        assert_eq!(keys(Value::string("ab")), vec!["0", "1"]);
        assert_eq!(keys(Value::Null), Vec::<String>::new());
        assert_eq!(keys(Value::from(json!({"x": 1, "y": 2}))), vec!["x", "y"]);
        assert_eq!(keys(Value::from(json!({"zeta": 1, "alpha": 2}))), vec!["zeta", "alpha"]);
        let map = Value::map(vec![(Value::from(7), Value::string("seven"))]);
        let record = entries(&map).unwrap().remove(0);
        assert_eq!(record.key, "7");
        assert_eq!(record.arguments().len(), 3);
        assert!(entries(&Value::Bool(true)).is_err());
        assert!(entries(&Value::from(1.5)).is_err());
    }

    #[test]
    fn test_reactive_sources_carry_paths() {
        let scope = Scope::root(UpdateQueue::new(100));
        scope.define("todos", Value::from(json!([{"t": "a"}, {"t": "b"}])));
        scope.define("user", Value::from(json!({"name": "n"})));
        let todos = entries(&scope.get("todos")).unwrap();
        assert_eq!(todos[1].source.as_deref(), Some("todos[1]"));
        let user = entries(&scope.get("user")).unwrap();
        assert_eq!(user[0].source.as_deref(), Some("user.name"));
    }
}
