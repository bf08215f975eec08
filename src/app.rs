//! Application assembly: state, methods, computed properties, watchers and
//! the mounted render tree, wired to one update queue.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use markup5ever_rcdom::Handle;
use regex::Regex;

use crate::component::{ComponentFactory, ComponentRegistry};
use crate::config::AppConfig;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::directive::{DirectiveFactory, DirectiveRegistry};
use crate::dom;
use crate::error::{CompileError, EvalResult};
use crate::events::{Event, EventTable};
use crate::expression::ast::Expr;
use crate::expression::{call_function, evaluate, parse_expression, resolve_closures, Compiled, FunctionClosures};
use crate::node::RenderNode;
use crate::path::PathSet;
use crate::scheduler::{ComputedProperties, UpdateQueue, WatchCallback, Watchers};
use crate::scope::Scope;
use crate::value::Value;

/// Everything render nodes share: configuration, parsers, the queue and the
/// listener table.
pub struct Runtime {
    config: AppConfig,
    registry: DirectiveRegistry,
    components: ComponentRegistry,
    functions: FunctionClosures,
    queue: Rc<UpdateQueue>,
    diagnostics: Rc<Diagnostics>,
    events: EventTable,
    interpolation: Regex,
    global_supplies: RefCell<PathSet>,
}

impl Runtime {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &DirectiveRegistry {
        &self.registry
    }

    pub fn components(&self) -> &ComponentRegistry {
        &self.components
    }

    /// Free-variable closure of every method, by name.
    pub fn functions(&self) -> &FunctionClosures {
        &self.functions
    }

    pub fn queue(&self) -> &Rc<UpdateQueue> {
        &self.queue
    }

    pub fn diagnostics(&self) -> &Rc<Diagnostics> {
        &self.diagnostics
    }

    pub fn events(&self) -> &EventTable {
        &self.events
    }

    /// Matches one interpolation; group 1 is the expression.
    pub fn interpolation(&self) -> &Regex {
        &self.interpolation
    }

    /// Names the root node supplies: state, methods and computed properties.
    pub fn global_supplies(&self) -> PathSet {
        self.global_supplies.borrow().clone()
    }
}

fn interpolation_pattern(config: &AppConfig) -> Result<Regex, CompileError> {
    let open = &config.delimiters.open;
    let close = &config.delimiters.close;
    if open.is_empty() || close.is_empty() {
        return Err(CompileError::Config("interpolation delimiters must not be empty".to_string()));
    }
    Regex::new(&format!("(?s){}(.+?){}", regex::escape(open), regex::escape(close)))
        .map_err(|e| CompileError::Config(e.to_string()))
}

enum Method {
    Source(String),
    Native {
        reads: PathSet,
        f: Rc<dyn Fn(&[Value]) -> EvalResult<Value>>,
    },
}

struct WatchSpec {
    path: String,
    deep: bool,
    callback: WatchCallback,
}

#[derive(Default)]
pub struct AppBuilder {
    config: AppConfig,
    state: Vec<(String, Value)>,
    methods: IndexMap<String, Method>,
    computed: IndexMap<String, String>,
    watches: Vec<WatchSpec>,
    registry: DirectiveRegistry,
    components: ComponentRegistry,
    errors: Vec<CompileError>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.state.push((key.to_string(), value.into()));
        self
    }

    /// Seed state from a JSON object; each top-level key becomes a binding.
    pub fn state(mut self, state: serde_json::Value) -> Self {
        match state {
            serde_json::Value::Object(entries) => {
                for (key, value) in entries {
                    self.state.push((key, Value::from(value)));
                }
            }
            serde_json::Value::Null => {}
            _ => self
                .errors
                .push(CompileError::Config("state must be a JSON object".to_string())),
        }
        self
    }

    pub fn state_json(self, json: &str) -> Result<Self, CompileError> {
        let state = serde_json::from_str(json).map_err(|e| CompileError::Config(e.to_string()))?;
        Ok(self.state(state))
    }

    /// A method given as arrow-function source, e.g. `(n) => count += n`.
    pub fn method(mut self, name: &str, source: &str) -> Self {
        self.methods.insert(name.to_string(), Method::Source(source.to_string()));
        self
    }

    /// A Rust method. `reads` are the state paths it depends on.
    pub fn native_method(
        mut self,
        name: &str,
        reads: &[&str],
        f: impl Fn(&[Value]) -> EvalResult<Value> + 'static,
    ) -> Self {
        self.methods.insert(
            name.to_string(),
            Method::Native {
                reads: reads.iter().map(|r| r.to_string()).collect(),
                f: Rc::new(f),
            },
        );
        self
    }

    pub fn computed(mut self, name: &str, source: &str) -> Self {
        self.computed.insert(name.to_string(), source.to_string());
        self
    }

    /// Call `callback(new, old)` when `path` changes. `deep` also reacts to
    /// changes below `path`.
    pub fn watch(
        mut self,
        path: &str,
        deep: bool,
        callback: impl Fn(&Value, &Value) -> EvalResult<()> + 'static,
    ) -> Self {
        self.watches.push(WatchSpec {
            path: path.to_string(),
            deep,
            callback: Rc::new(callback),
        });
        self
    }

    pub fn directive(mut self, name: &str, factory: DirectiveFactory) -> Self {
        self.registry.register(name, factory);
        self
    }

    pub fn component(mut self, tag: &str, template: &str, factory: ComponentFactory) -> Self {
        if let Err(e) = self.components.register(tag, template, factory) {
            self.errors.push(e);
        }
        self
    }

    pub fn build(mut self) -> Result<App, CompileError> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }
        let diagnostics = Rc::new(Diagnostics::new());
        let queue = UpdateQueue::with_diagnostics(self.config.max_passes_per_flush, diagnostics.clone());
        let interpolation = interpolation_pattern(&self.config)?;

        let mut sources: IndexMap<String, Expr> = IndexMap::new();
        for (name, method) in &self.methods {
            if let Method::Source(source) = method {
                let expr = parse_expression(source)?;
                if !matches!(expr, Expr::Arrow(_)) {
                    return Err(CompileError::InvalidDirective {
                        name: name.clone(),
                        reason: "a method must be an arrow function".to_string(),
                    });
                }
                sources.insert(name.clone(), expr);
            }
        }
        let mut functions = resolve_closures(&sources, &diagnostics);
        for (name, method) in &self.methods {
            if let Method::Native { reads, .. } = method {
                functions.insert(name.clone(), reads.clone());
            }
        }

        let scope = Scope::root(queue.clone());
        for (key, value) in self.state {
            scope.define(&key, value);
        }
        for (name, method) in &self.methods {
            let value = match method {
                Method::Source(_) => match sources.get(name) {
                    Some(expr) => evaluate(expr, &scope).map_err(|e| CompileError::InvalidDirective {
                        name: name.clone(),
                        reason: e.to_string(),
                    })?,
                    None => continue,
                },
                Method::Native { f, .. } => {
                    let f = f.clone();
                    Value::function(name, move |args| f(args))
                }
            };
            value.mark_raw();
            scope.define(name, value);
        }

        let mut computed = ComputedProperties::new();
        for (name, source) in &self.computed {
            computed.insert(name, Compiled::new(source, &functions)?);
        }
        computed.initialize(&scope, &diagnostics);

        let watchers = Watchers::new();
        for watch in self.watches {
            let getter = Compiled::new(&watch.path, &functions)?;
            let initial = getter.eval(&scope).unwrap_or_default();
            watchers.add(&watch.path, watch.deep, getter, watch.callback, initial);
        }

        let runtime = Rc::new(Runtime {
            config: self.config,
            registry: self.registry,
            components: self.components,
            functions,
            queue: queue.clone(),
            diagnostics,
            events: EventTable::new(),
            interpolation,
            global_supplies: RefCell::new(PathSet::new()),
        });
        let inner = Rc::new(AppInner {
            runtime,
            scope,
            computed,
            watchers,
            root: RefCell::new(None),
            document: RefCell::new(None),
        });
        let weak: Weak<AppInner> = Rc::downgrade(&inner);
        queue.set_flush(Rc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.flush();
            }
        }));
        Ok(App { inner })
    }
}

struct AppInner {
    runtime: Rc<Runtime>,
    scope: Scope,
    computed: ComputedProperties,
    watchers: Watchers,
    root: RefCell<Option<Rc<RenderNode>>>,
    document: RefCell<Option<Handle>>,
}

impl AppInner {
    /// One update pass: computed properties, then watchers, then the render
    /// tree, then nodes whose own scope changed.
    fn flush(&self) {
        let queue = self.runtime.queue.clone();
        let diagnostics = self.runtime.diagnostics.clone();
        self.scope.sync_lengths();
        queue.run_pass(|| {
            let changes = self.scope.changes();
            let recomputed = self.computed.recompute(&changes, &self.scope, &diagnostics);
            if !recomputed.is_empty() {
                tracing::debug!(computed = ?recomputed, "recomputed");
            }
            self.watchers.fire(&self.scope.changes(), &self.scope, &diagnostics);

            let root = self.root.borrow().clone();
            if let Some(root) = root {
                root.update();
            }
            for node in queue.take_dirty() {
                if !node.is_destroyed() {
                    node.update();
                }
            }
        });
    }

    fn unmount(&self) {
        let root = self.root.borrow_mut().take();
        if let Some(root) = root {
            root.destroy();
        }
    }
}

impl Drop for AppInner {
    fn drop(&mut self) {
        self.unmount();
        self.runtime.queue.clear_flush();
    }
}

/// A built application. Cheap to clone; clones share one instance.
#[derive(Clone)]
pub struct App {
    inner: Rc<AppInner>,
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder::new()
    }

    /// Build the render tree for `target` and render it synchronously.
    pub fn mount(&self, target: Handle) -> Result<(), CompileError> {
        self.inner.unmount();
        let runtime = &self.inner.runtime;
        *runtime.global_supplies.borrow_mut() = self.inner.scope.keys().into_iter().collect();
        let root = RenderNode::build(runtime, target, None, Some(self.inner.scope.clone()), None)?;
        *self.inner.root.borrow_mut() = Some(root.clone());
        runtime.queue.run_pass(|| root.force_update());
        tracing::debug!(
            supplies = runtime.global_supplies.borrow().len(),
            "mounted application"
        );
        Ok(())
    }

    /// Parse a document and mount its `#app` element, or `<body>` when there
    /// is none.
    pub fn mount_html(&self, html: &str) -> Result<(), CompileError> {
        let document = dom::parse_html(html)?;
        let target = dom::find_by_id(&document, "app")
            .or_else(|| dom::find_element(&document, "body"))
            .ok_or_else(|| CompileError::Template("no mount target".to_string()))?;
        *self.inner.document.borrow_mut() = Some(document);
        self.mount(target)
    }

    pub fn unmount(&self) {
        self.inner.unmount();
    }

    pub fn root(&self) -> Option<Rc<RenderNode>> {
        self.inner.root.borrow().clone()
    }

    pub fn runtime(&self) -> &Rc<Runtime> {
        &self.inner.runtime
    }

    /// The root binding scope.
    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    pub fn get(&self, key: &str) -> Value {
        self.inner.scope.get(key)
    }

    /// Assign a root binding; the change is rendered on the next tick.
    pub fn set(&self, key: &str, value: impl Into<Value>) {
        self.inner.scope.set(key, value.into());
    }

    pub fn call(&self, method: &str, args: &[Value]) -> EvalResult<Value> {
        call_function(&self.inner.scope.get(method), args)
    }

    /// Drain queued updates and callbacks. Returns the number of passes run.
    pub fn tick(&self) -> usize {
        self.inner.runtime.queue.run_microtasks()
    }

    pub fn next_tick(&self, callback: impl FnOnce() + 'static) {
        self.inner.runtime.queue.next_tick(callback);
    }

    pub fn request_update(&self) {
        self.inner.runtime.queue.request_update();
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.inner.runtime.diagnostics.entries()
    }

    pub fn diagnostic_count(&self, code: &str) -> usize {
        self.inner.runtime.diagnostics.count(code)
    }

    /// Deliver an event. Returns false when a listener prevented the default.
    pub fn dispatch(&self, event: Event) -> bool {
        let event = Rc::new(event);
        self.inner
            .runtime
            .events
            .dispatch(&event, &self.inner.runtime.diagnostics)
    }

    pub fn click(&self, target: &Handle) -> bool {
        self.dispatch(Event::new("click", target))
    }

    fn set_control_value(target: &Handle, value: &str) {
        if dom::tag_name(target).as_deref() == Some("textarea") {
            dom::set_text_content(target, value);
        } else {
            dom::set_attribute(target, "value", value);
        }
    }

    /// Type `value` into a control, firing `input`.
    pub fn input(&self, target: &Handle, value: &str) -> bool {
        Self::set_control_value(target, value);
        self.dispatch(Event::new("input", target))
    }

    /// Commit `value` to a control, firing `input` then `change`.
    pub fn change(&self, target: &Handle, value: &str) -> bool {
        Self::set_control_value(target, value);
        let input = self.dispatch(Event::new("input", target));
        self.dispatch(Event::new("change", target)) && input
    }

    /// Toggle a checkbox or radio button, firing `change`.
    pub fn check(&self, target: &Handle, checked: bool) -> bool {
        if checked {
            dom::set_attribute(target, "checked", "");
        } else {
            dom::remove_attribute(target, "checked");
        }
        self.dispatch(Event::new("change", target))
    }

    /// Search the mounted document (or the mount target) by `id`.
    pub fn element_by_id(&self, id: &str) -> Option<Handle> {
        let document = self.inner.document.borrow().clone();
        let root = document.or_else(|| self.root().map(|r| r.dom().clone()))?;
        dom::find_by_id(&root, id)
    }

    /// Markup of the mount target.
    pub fn html(&self) -> String {
        self.root().map(|r| dom::outer_html(r.dom())).unwrap_or_default()
    }

    /// Markup of the parsed document when mounted through `mount_html`.
    pub fn document_html(&self) -> Option<String> {
        self.inner.document.borrow().as_ref().map(dom::outer_html)
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("state", &self.inner.scope.keys())
            .field("computed", &self.inner.computed.names().collect::<Vec<_>>())
            .field("watchers", &self.inner.watchers.len())
            .field("mounted", &self.inner.root.borrow().is_some())
            .finish()
    }
}
