//! Chained binding scopes.
//!
//! A scope is the evaluation environment of template expressions. Lookups fall
//! through to the parent; assignment to a key an ancestor owns writes through
//! to that ancestor. Container values are stored wrapped, rooted at their key,
//! so deep mutations surface as change paths in the scope that owns the key.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::node::RenderNode;
use crate::path::PathSet;
use crate::reactive::{wrap, Observer};
use crate::scheduler::UpdateQueue;
use crate::value::Value;

lazy_static::lazy_static! {
    /// Identifiers the interpreter resolves without a binding scope.
    pub static ref ENGINE_GLOBALS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("Math");
        s.insert("JSON");
        s.insert("String");
        s.insert("Number");
        s.insert("Boolean");
        s.insert("Array");
        s.insert("Object");
        s.insert("Map");
        s.insert("Set");
        s.insert("Date");
        s.insert("undefined");
        s.insert("NaN");
        s.insert("Infinity");
        s.insert("parseInt");
        s.insert("parseFloat");
        s.insert("isNaN");
        s.insert("$event"); // injected by event bindings
        s
    };
}

pub(crate) struct ScopeInner {
    parent: Option<Scope>,
    values: RefCell<IndexMap<String, Value>>,
    changes: RefCell<PathSet>,
    deferred: RefCell<PathSet>,
    lengths: RefCell<HashMap<String, usize>>,
    observer: Rc<Observer>,
    queue: Rc<UpdateQueue>,
    owner: RefCell<Option<Weak<RenderNode>>>,
    disposed: Cell<bool>,
    /// Call frames of arrow functions: own keys are stored unwrapped and never
    /// record changes.
    ephemeral: bool,
}

#[derive(Clone)]
pub struct Scope(Rc<ScopeInner>);

/// Non-owning handle kept by the scheduler to clear change sets.
#[derive(Clone)]
pub struct WeakScope(Weak<ScopeInner>);

impl WeakScope {
    pub fn upgrade(&self) -> Option<Scope> {
        self.0.upgrade().map(Scope)
    }
}

impl Scope {
    pub fn root(queue: Rc<UpdateQueue>) -> Self {
        Self::create(None, queue, false)
    }

    pub fn child(&self) -> Self {
        Self::create(Some(self.clone()), self.0.queue.clone(), false)
    }

    pub fn frame(&self) -> Self {
        Self::create(Some(self.clone()), self.0.queue.clone(), true)
    }

    fn create(parent: Option<Scope>, queue: Rc<UpdateQueue>, ephemeral: bool) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<ScopeInner>| {
            let weak = weak.clone();
            let observer = Observer::new(move |path| {
                if let Some(inner) = weak.upgrade() {
                    Scope(inner).record(path);
                }
            });
            ScopeInner {
                parent,
                values: RefCell::new(IndexMap::new()),
                changes: RefCell::new(PathSet::new()),
                deferred: RefCell::new(PathSet::new()),
                lengths: RefCell::new(HashMap::new()),
                observer,
                queue,
                owner: RefCell::new(None),
                disposed: Cell::new(false),
                ephemeral,
            }
        });
        let scope = Scope(inner);
        if !ephemeral {
            scope.0.queue.track_scope(scope.downgrade());
        }
        scope
    }

    pub fn downgrade(&self) -> WeakScope {
        WeakScope(Rc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &Scope) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn parent(&self) -> Option<&Scope> {
        self.0.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.0.parent.is_none()
    }

    pub fn queue(&self) -> &Rc<UpdateQueue> {
        &self.0.queue
    }

    pub fn observer(&self) -> &Rc<Observer> {
        &self.0.observer
    }

    pub fn set_owner(&self, owner: Weak<RenderNode>) {
        *self.0.owner.borrow_mut() = Some(owner);
    }

    pub fn get(&self, key: &str) -> Value {
        if let Some(value) = self.0.values.borrow().get(key) {
            return value.clone();
        }
        match &self.0.parent {
            Some(parent) => parent.get(key),
            None => Value::Undefined,
        }
    }

    pub fn has(&self, key: &str, recursive: bool) -> bool {
        if self.0.values.borrow().contains_key(key) {
            return true;
        }
        recursive && self.0.parent.as_ref().is_some_and(|p| p.has(key, true))
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.values.borrow().keys().cloned().collect()
    }

    /// Assign `key`, writing through to the nearest ancestor that owns it.
    pub fn set(&self, key: &str, value: Value) {
        if !self.0.values.borrow().contains_key(key) {
            if let Some(owner) = self.owning_ancestor(key) {
                owner.set_local(key, value);
                return;
            }
        }
        self.set_local(key, value);
    }

    fn owning_ancestor(&self, key: &str) -> Option<Scope> {
        let mut current = self.0.parent.clone();
        while let Some(scope) = current {
            if scope.0.values.borrow().contains_key(key) {
                return Some(scope);
            }
            current = scope.0.parent.clone();
        }
        None
    }

    fn set_local(&self, key: &str, value: Value) {
        if self.store(key, value) {
            self.record(key);
        }
    }

    /// Store without considering ancestors. Returns whether the slot changed.
    fn store(&self, key: &str, value: Value) -> bool {
        let wrapped = if self.0.ephemeral {
            value
        } else {
            wrap(value, &self.0.observer, key)
        };
        let new_len = wrapped.array_len();
        let changed = {
            let values = self.0.values.borrow();
            match values.get(key) {
                Some(old) if old.same_value(&wrapped) && same_path(old, &wrapped) => {
                    new_len.is_some() && self.0.lengths.borrow().get(key).copied() != new_len
                }
                _ => true,
            }
        };
        match new_len {
            Some(len) => {
                self.0.lengths.borrow_mut().insert(key.to_string(), len);
            }
            None => {
                self.0.lengths.borrow_mut().remove(key);
            }
        }
        if changed {
            self.0.values.borrow_mut().insert(key.to_string(), wrapped);
        }
        changed
    }

    pub fn define(&self, key: &str, value: Value) {
        self.store(key, value);
    }

    /// Engine-internal rebinding during a pass. The change lands in the
    /// current change set so the rest of the pass observes it, and no further
    /// update is requested.
    pub fn bind(&self, key: &str, value: Value) -> bool {
        let changed = self.store(key, value);
        if changed {
            self.0.changes.borrow_mut().insert(key.to_string());
        }
        changed
    }

    /// Mark `key` changed in the current change set without assigning it.
    pub fn touch(&self, key: &str) {
        self.0.changes.borrow_mut().insert(key.to_string());
    }

    /// Record a change path. While a pass is running the path is deferred to
    /// the next pass.
    pub(crate) fn record(&self, path: &str) {
        if self.0.disposed.get() || self.0.ephemeral {
            return;
        }
        let queue = &self.0.queue;
        if queue.in_pass() {
            self.0.deferred.borrow_mut().insert(path.to_string());
            queue.flag_rerun();
        } else {
            self.0.changes.borrow_mut().insert(path.to_string());
            queue.request_update();
        }
        if self.0.parent.is_some() {
            if let Some(owner) = self.0.owner.borrow().clone() {
                queue.mark_dirty(owner);
            }
        }
    }

    /// Arrays whose length moved without the wrapper seeing it (for example a
    /// raw handle mutated directly) are recorded as changed.
    pub fn sync_lengths(&self) {
        let stale: Vec<String> = {
            let values = self.0.values.borrow();
            let lengths = self.0.lengths.borrow();
            lengths
                .iter()
                .filter(|(key, len)| {
                    values.get(key.as_str()).and_then(Value::array_len) != Some(**len)
                })
                .map(|(key, _)| key.clone())
                .collect()
        };
        for key in stale {
            let len = self.0.values.borrow().get(&key).and_then(Value::array_len);
            if let Some(len) = len {
                self.0.lengths.borrow_mut().insert(key.clone(), len);
            }
            self.record(&key);
        }
    }

    /// Own change set plus every ancestor's.
    pub fn changes(&self) -> PathSet {
        let mut all = self.0.changes.borrow().clone();
        let mut current = self.0.parent.clone();
        while let Some(scope) = current {
            all.extend(scope.0.changes.borrow().iter().cloned());
            current = scope.0.parent.clone();
        }
        all
    }

    pub fn own_changes(&self) -> PathSet {
        self.0.changes.borrow().clone()
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.0.changes.borrow().is_empty()
    }

    /// Empty this scope's own change set. Paths deferred during the pass
    /// become the next pass's changes.
    pub fn clear_changes(&self) {
        let deferred = std::mem::take(&mut *self.0.deferred.borrow_mut());
        *self.0.changes.borrow_mut() = deferred;
    }

    pub fn dispose(&self) {
        self.0.disposed.set(true);
        self.0.observer.dispose();
        self.0.changes.borrow_mut().clear();
        self.0.deferred.borrow_mut().clear();
        self.0.owner.borrow_mut().take();
    }

    pub fn is_disposed(&self) -> bool {
        self.0.disposed.get()
    }
}

/// Two handles to one container reached by different paths are distinct
/// bindings: mutations through them report different change paths.
fn same_path(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Reactive(x), Value::Reactive(y)) => x.path() == y.path(),
        (Value::Reactive(_), _) | (_, Value::Reactive(_)) => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn root() -> Scope {
        Scope::root(UpdateQueue::new(100))
    }

    #[test]
    fn test_lookup_falls_through_and_writes_through() {
        let parent = root();
        parent.define("count", Value::from(1));
        let child = parent.child();

        assert_eq!(child.get("count").to_number(), 1.0);
        assert!(child.has("count", true));
        assert!(!child.has("count", false));

        child.set("count", Value::from(2));
        assert_eq!(parent.get("count").to_number(), 2.0);
        assert!(!child.has("count", false));
        assert!(parent.own_changes().contains("count"));

        child.set("fresh", Value::from(true));
        assert!(child.has("fresh", false));
        assert!(!parent.has("fresh", true));
    }

    #[test]
    fn test_changes_union_ancestors_and_clear_locally() {
        let parent = root();
        let child = parent.child();
        parent.set("a", Value::from(1));
        child.set("b", Value::from(2));

        let changes = child.changes();
        assert!(changes.contains("a") && changes.contains("b"));

        child.clear_changes();
        assert!(child.changes().contains("a"));
        assert!(!child.own_changes().contains("b"));
    }

    #[test]
    fn test_assigning_same_value_records_nothing() {
        let scope = root();
        scope.define("name", Value::from("Ada"));
        scope.set("name", Value::from("Ada"));
        assert!(!scope.has_pending_changes());
    }

    #[test]
    fn test_nested_mutation_records_rooted_path() {
        let scope = root();
        scope.define("user", Value::from(json!({ "name": "Ada" })));
        match scope.get("user") {
            Value::Reactive(user) => user.set("name", Value::from("Grace")).unwrap(),
            other => panic!("expected wrapper, got {:?}", other),
        }
        assert!(scope.own_changes().contains("user.name"));
    }

    #[test]
    fn test_length_change_on_same_reference_is_a_change() {
        let scope = root();
        let list = Value::from(json!([1, 2]));
        scope.define("list", list.clone());
        if let Value::Array(items) = &list {
            items.borrow_mut().push(Value::from(3));
        }
        scope.set("list", list);
        assert!(scope.own_changes().contains("list"));
    }

    #[test]
    fn test_sync_lengths_catches_bypassed_mutation() {
        let scope = root();
        let list = Value::from(json!([1]));
        scope.define("list", list.clone());
        if let Value::Array(items) = &list {
            items.borrow_mut().clear();
        }
        scope.sync_lengths();
        assert!(scope.own_changes().contains("list"));
    }

    #[test]
    fn test_frame_locals_do_not_record() {
        let scope = root();
        scope.define("total", Value::from(0));
        let frame = scope.frame();
        frame.define("x", Value::from(1));
        frame.set("x", Value::from(2));
        assert!(!frame.has_pending_changes());

        frame.set("total", Value::from(5));
        assert!(scope.own_changes().contains("total"));
    }

    #[test]
    fn test_changes_during_pass_are_deferred() {
        let queue = UpdateQueue::new(100);
        let scope = Scope::root(queue.clone());
        queue.begin_pass();
        scope.set("x", Value::from(1));
        assert!(!scope.own_changes().contains("x"));
        scope.bind("y", Value::from(2));
        assert!(scope.own_changes().contains("y"));
        queue.end_pass();

        scope.clear_changes();
        let changes = scope.own_changes();
        assert!(changes.contains("x") && !changes.contains("y"));
    }
}
