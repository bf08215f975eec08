//! Batched update scheduling.
//!
//! Mutations request an update; the first request in a tick queues one flush
//! microtask and later requests are no-ops until it runs. The host drains the
//! queue with [`UpdateQueue::run_microtasks`]. Mutations made while a pass is
//! running are deferred to a follow-up pass instead of extending it.

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::rc::{Rc, Weak};

use indexmap::{IndexMap, IndexSet};

use crate::diagnostics::Diagnostics;
use crate::error::{EvalResult, ERR_EVALUATION, ERR_PASS_LIMIT, WARN_CIRCULAR_COMPUTED};
use crate::expression::Compiled;
use crate::node::RenderNode;
use crate::path::{intersects, is_descendant, root_of, PathSet};
use crate::scope::{Scope, WeakScope};
use crate::value::Value;

enum Microtask {
    Flush,
    Callback(Box<dyn FnOnce()>),
}

pub struct UpdateQueue {
    max_passes: usize,
    pending: Cell<bool>,
    in_pass: Cell<bool>,
    rerun: Cell<bool>,
    pass_id: Cell<u64>,
    passes_run: Cell<u64>,
    microtasks: RefCell<VecDeque<Microtask>>,
    scopes: RefCell<Vec<WeakScope>>,
    dirty: RefCell<Vec<Weak<RenderNode>>>,
    deferred_dirty: RefCell<Vec<Weak<RenderNode>>>,
    flush: RefCell<Option<Rc<dyn Fn()>>>,
    diagnostics: Rc<Diagnostics>,
}

impl UpdateQueue {
    pub fn new(max_passes: usize) -> Rc<Self> {
        Self::with_diagnostics(max_passes, Rc::new(Diagnostics::new()))
    }

    pub fn with_diagnostics(max_passes: usize, diagnostics: Rc<Diagnostics>) -> Rc<Self> {
        Rc::new(Self {
            max_passes: max_passes.max(1),
            pending: Cell::new(false),
            in_pass: Cell::new(false),
            rerun: Cell::new(false),
            pass_id: Cell::new(0),
            passes_run: Cell::new(0),
            microtasks: RefCell::new(VecDeque::new()),
            scopes: RefCell::new(Vec::new()),
            dirty: RefCell::new(Vec::new()),
            deferred_dirty: RefCell::new(Vec::new()),
            flush: RefCell::new(None),
            diagnostics,
        })
    }

    pub fn diagnostics(&self) -> &Rc<Diagnostics> {
        &self.diagnostics
    }

    /// Install the body of a flush. Without one a flush only clears change
    /// sets.
    pub fn set_flush(&self, flush: Rc<dyn Fn()>) {
        *self.flush.borrow_mut() = Some(flush);
    }

    pub fn clear_flush(&self) {
        self.flush.borrow_mut().take();
    }

    pub fn is_pending(&self) -> bool {
        self.pending.get()
    }

    pub fn in_pass(&self) -> bool {
        self.in_pass.get()
    }

    /// Identifier of the running (or last) pass.
    pub fn pass_id(&self) -> u64 {
        self.pass_id.get()
    }

    /// Number of passes completed so far.
    pub fn passes_run(&self) -> u64 {
        self.passes_run.get()
    }

    pub fn request_update(&self) {
        if self.in_pass.get() {
            self.rerun.set(true);
            return;
        }
        if self.pending.replace(true) {
            return;
        }
        self.microtasks.borrow_mut().push_back(Microtask::Flush);
    }

    /// A change arrived during a pass: schedule one follow-up pass.
    pub fn flag_rerun(&self) {
        self.rerun.set(true);
    }

    /// Run `callback` after the pending update, or on the next microtask when
    /// nothing is pending.
    pub fn next_tick(&self, callback: impl FnOnce() + 'static) {
        self.microtasks
            .borrow_mut()
            .push_back(Microtask::Callback(Box::new(callback)));
    }

    pub fn track_scope(&self, scope: WeakScope) {
        self.scopes.borrow_mut().push(scope);
    }

    /// Queue a node whose own scope changed. Nodes marked during a pass are
    /// held for the follow-up pass.
    pub fn mark_dirty(&self, node: Weak<RenderNode>) {
        if self.in_pass.get() {
            self.deferred_dirty.borrow_mut().push(node);
        } else {
            self.dirty.borrow_mut().push(node);
        }
    }

    pub(crate) fn take_dirty(&self) -> Vec<Rc<RenderNode>> {
        std::mem::take(&mut *self.dirty.borrow_mut())
            .into_iter()
            .filter_map(|weak| weak.upgrade())
            .collect()
    }

    pub fn begin_pass(&self) {
        self.in_pass.set(true);
        self.pass_id.set(self.pass_id.get() + 1);
    }

    pub fn end_pass(&self) {
        self.in_pass.set(false);
        self.pending.set(false);
        self.passes_run.set(self.passes_run.get() + 1);
        let deferred = std::mem::take(&mut *self.deferred_dirty.borrow_mut());
        self.dirty.borrow_mut().extend(deferred);
        if self.rerun.replace(false) {
            self.request_update();
        }
    }

    /// Empty every live scope's change set, dropping handles to dead scopes.
    pub fn clear_scopes(&self) {
        let live: Vec<Scope> = {
            let mut scopes = self.scopes.borrow_mut();
            scopes.retain(|weak| weak.upgrade().is_some_and(|s| !s.is_disposed()));
            scopes.iter().filter_map(WeakScope::upgrade).collect()
        };
        for scope in live {
            scope.clear_changes();
        }
    }

    /// One complete pass: `body`, then clear all change sets.
    pub fn run_pass(&self, body: impl FnOnce()) {
        self.begin_pass();
        tracing::debug!(pass = self.pass_id.get(), "update pass started");
        body();
        self.clear_scopes();
        self.end_pass();
        tracing::debug!(pass = self.pass_id.get(), "update pass finished");
    }

    fn flush_now(&self) {
        if !self.pending.get() {
            return;
        }
        let flush = self.flush.borrow().clone();
        match flush {
            Some(flush) => flush(),
            None => self.run_pass(|| {}),
        }
    }

    /// Drain queued microtasks. At most `max_passes` flushes run per call;
    /// anything beyond that stays queued and an error is logged. Returns the
    /// number of flushes that ran.
    pub fn run_microtasks(&self) -> usize {
        let mut flushes = 0;
        loop {
            let next = self.microtasks.borrow_mut().pop_front();
            match next {
                None => break,
                Some(Microtask::Callback(callback)) => callback(),
                Some(Microtask::Flush) => {
                    if flushes == self.max_passes {
                        self.microtasks.borrow_mut().push_front(Microtask::Flush);
                        self.diagnostics.error(
                            ERR_PASS_LIMIT,
                            format!(
                                "update did not settle after {} passes; remaining work stays queued",
                                self.max_passes
                            ),
                        );
                        break;
                    }
                    flushes += 1;
                    self.flush_now();
                }
            }
        }
        flushes
    }

    pub fn has_queued_work(&self) -> bool {
        !self.microtasks.borrow().is_empty()
    }
}

/// Derived values stored in the root scope under their own names.
#[derive(Default)]
pub struct ComputedProperties {
    entries: IndexMap<String, Compiled>,
}

impl ComputedProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, compiled: Compiled) {
        self.entries.insert(name.to_string(), compiled);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Evaluate every computed property.
    pub fn initialize(&self, scope: &Scope, diagnostics: &Diagnostics) {
        let stale: IndexSet<String> = self.entries.keys().cloned().collect();
        self.run(stale, scope, diagnostics, false);
    }

    /// Recompute the properties whose reads intersect `changes`, plus every
    /// property reading one of those. Returns the names recomputed.
    pub fn recompute(&self, changes: &PathSet, scope: &Scope, diagnostics: &Diagnostics) -> Vec<String> {
        let mut stale: IndexSet<String> = self
            .entries
            .iter()
            .filter(|(_, c)| intersects(&c.reads, changes))
            .map(|(name, _)| name.clone())
            .collect();
        loop {
            let before = stale.len();
            for (name, compiled) in &self.entries {
                if !stale.contains(name) && compiled.reads.iter().any(|r| stale.contains(root_of(r))) {
                    stale.insert(name.clone());
                }
            }
            if stale.len() == before {
                break;
            }
        }
        self.run(stale, scope, diagnostics, true)
    }

    fn run(&self, stale: IndexSet<String>, scope: &Scope, diagnostics: &Diagnostics, record: bool) -> Vec<String> {
        let mut pass = Recompute {
            entries: &self.entries,
            scope,
            diagnostics,
            stale,
            done: HashSet::new(),
            in_progress: IndexSet::new(),
            order: Vec::new(),
            record,
        };
        let names: Vec<String> = pass.stale.iter().cloned().collect();
        for name in names {
            pass.resolve(&name);
        }
        pass.order
    }
}

struct Recompute<'a> {
    entries: &'a IndexMap<String, Compiled>,
    scope: &'a Scope,
    diagnostics: &'a Diagnostics,
    stale: IndexSet<String>,
    done: HashSet<String>,
    in_progress: IndexSet<String>,
    order: Vec<String>,
    record: bool,
}

impl Recompute<'_> {
    fn resolve(&mut self, name: &str) {
        if self.done.contains(name) {
            return;
        }
        if self.in_progress.contains(name) {
            let chain: Vec<&str> = self.in_progress.iter().map(String::as_str).collect();
            self.diagnostics.warn(
                WARN_CIRCULAR_COMPUTED,
                format!("circular computed property: {} -> {}", chain.join(" -> "), name),
            );
            // The cycle member keeps its prior value for this pass.
            self.done.insert(name.to_string());
            return;
        }
        let Some(compiled) = self.entries.get(name) else {
            return;
        };

        self.in_progress.insert(name.to_string());
        for read in &compiled.reads {
            let dep = root_of(read);
            if dep != name && self.stale.contains(dep) {
                let dep = dep.to_string();
                self.resolve(&dep);
            }
        }
        self.in_progress.pop();

        if self.done.insert(name.to_string()) {
            match compiled.eval(self.scope) {
                Ok(value) => {
                    if self.record {
                        self.scope.bind(name, value);
                    } else {
                        self.scope.define(name, value);
                    }
                }
                Err(e) => self.diagnostics.error(
                    ERR_EVALUATION,
                    format!("computed `{}` failed: {}", name, e),
                ),
            }
            self.order.push(name.to_string());
        }
    }
}

pub type WatchCallback = Rc<dyn Fn(&Value, &Value) -> EvalResult<()>>;

struct Watcher {
    path: String,
    deep: bool,
    getter: Compiled,
    last: RefCell<Value>,
    callback: WatchCallback,
}

/// Path watchers, fired once per pass after computed properties settle.
#[derive(Default)]
pub struct Watchers {
    entries: RefCell<Vec<Rc<Watcher>>>,
}

impl Watchers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, path: &str, deep: bool, getter: Compiled, callback: WatchCallback, initial: Value) {
        self.entries.borrow_mut().push(Rc::new(Watcher {
            path: path.to_string(),
            deep,
            getter,
            last: RefCell::new(initial),
            callback,
        }));
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Whether a change at `change` concerns a watcher on `path`.
    pub fn triggers(path: &str, deep: bool, change: &str) -> bool {
        change == path || is_descendant(path, change) || (deep && is_descendant(change, path))
    }

    /// Fire every watcher triggered by `changes`. Returns how many fired.
    pub fn fire(&self, changes: &PathSet, scope: &Scope, diagnostics: &Diagnostics) -> usize {
        let watchers: Vec<Rc<Watcher>> = self.entries.borrow().clone();
        let mut fired = 0;
        for watcher in watchers {
            if !changes
                .iter()
                .any(|change| Self::triggers(&watcher.path, watcher.deep, change))
            {
                continue;
            }
            let value = match watcher.getter.eval(scope) {
                Ok(value) => value,
                Err(e) => {
                    diagnostics.error(ERR_EVALUATION, format!("watcher `{}` failed: {}", watcher.path, e));
                    continue;
                }
            };
            let old = watcher.last.replace(value.clone());
            fired += 1;
            if let Err(e) = (watcher.callback)(&value, &old) {
                diagnostics.error(ERR_EVALUATION, format!("watcher `{}` callback failed: {}", watcher.path, e));
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::FunctionClosures;

    fn compiled(source: &str) -> Compiled {
        Compiled::new(source, &FunctionClosures::new()).unwrap()
    }

    #[test]
    fn test_requests_coalesce_into_one_flush() {
        let queue = UpdateQueue::new(10);
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        let q = Rc::downgrade(&queue);
        queue.set_flush(Rc::new(move || {
            counter.set(counter.get() + 1);
            if let Some(q) = q.upgrade() {
                q.run_pass(|| {});
            }
        }));

        queue.request_update();
        queue.request_update();
        queue.request_update();
        assert_eq!(queue.run_microtasks(), 1);
        assert_eq!(runs.get(), 1);
        assert!(!queue.is_pending());
    }

    #[test]
    fn test_next_tick_runs_after_pending_flush() {
        let queue = UpdateQueue::new(10);
        let log = Rc::new(RefCell::new(Vec::new()));
        let flush_log = log.clone();
        let q = Rc::downgrade(&queue);
        queue.set_flush(Rc::new(move || {
            flush_log.borrow_mut().push("flush");
            if let Some(q) = q.upgrade() {
                q.run_pass(|| {});
            }
        }));

        queue.request_update();
        let tick_log = log.clone();
        queue.next_tick(move || tick_log.borrow_mut().push("tick"));
        queue.run_microtasks();
        assert_eq!(*log.borrow(), vec!["flush", "tick"]);
    }

    #[test]
    fn test_change_during_pass_schedules_follow_up() {
        let queue = UpdateQueue::new(10);
        let scope = Scope::root(queue.clone());
        scope.define("n", Value::from(0));
        queue.begin_pass();
        scope.set("n", Value::from(1));
        queue.clear_scopes();
        queue.end_pass();

        assert!(queue.is_pending());
        assert!(scope.own_changes().contains("n"));
        assert_eq!(queue.run_microtasks(), 1);
        assert!(!scope.has_pending_changes());
    }

    #[test]
    fn test_pass_limit_is_reported() {
        let queue = UpdateQueue::new(3);
        let scope = Scope::root(queue.clone());
        scope.define("n", Value::from(0));
        let s = scope.downgrade();
        let q = Rc::downgrade(&queue);
        queue.set_flush(Rc::new(move || {
            let (Some(q), Some(s)) = (q.upgrade(), s.upgrade()) else { return };
            q.run_pass(|| {
                let n = s.get("n").to_number();
                s.set("n", Value::from(n + 1.0));
            });
        }));

        scope.set("n", Value::from(1));
        assert_eq!(queue.run_microtasks(), 3);
        assert_eq!(queue.diagnostics().count(ERR_PASS_LIMIT), 1);
        assert!(queue.has_queued_work());
    }

    #[test]
    fn test_computed_resolves_dependencies_first() {
        let queue = UpdateQueue::new(10);
        let scope = Scope::root(queue.clone());
        let diagnostics = Diagnostics::new();
        scope.define("price", Value::from(2));
        scope.define("qty", Value::from(3));

        let mut computed = ComputedProperties::new();
        computed.insert("total", compiled("subtotal + 1"));
        computed.insert("subtotal", compiled("price * qty"));
        computed.initialize(&scope, &diagnostics);
        assert_eq!(scope.get("total").to_number(), 7.0);

        scope.set("qty", Value::from(4));
        queue.begin_pass();
        let order = computed.recompute(&scope.changes(), &scope, &diagnostics);
        queue.end_pass();
        assert_eq!(order, vec!["subtotal", "total"]);
        assert_eq!(scope.get("total").to_number(), 9.0);
        assert!(scope.own_changes().contains("total"));
    }

    #[test]
    fn test_circular_computed_warns_once_per_pass() {
        let queue = UpdateQueue::new(10);
        let scope = Scope::root(queue.clone());
        let diagnostics = Diagnostics::new();
        scope.define("x", Value::from(1));

        let mut computed = ComputedProperties::new();
        computed.insert("a", compiled("b + x"));
        computed.insert("b", compiled("a + 1"));
        computed.initialize(&scope, &diagnostics);
        assert_eq!(diagnostics.count(WARN_CIRCULAR_COMPUTED), 1);

        scope.set("x", Value::from(2));
        computed.recompute(&scope.changes(), &scope, &diagnostics);
        assert_eq!(diagnostics.count(WARN_CIRCULAR_COMPUTED), 2);
    }

    #[test]
    fn test_watch_trigger_rules() {
        assert!(Watchers::triggers("user.roles", false, "user.roles"));
        assert!(Watchers::triggers("user.roles", false, "user"));
        assert!(!Watchers::triggers("user.roles", false, "user.roles[0]"));
        assert!(Watchers::triggers("user.roles", true, "user.roles[0]"));
        assert!(!Watchers::triggers("user.roles", true, "user.name"));
    }
}
