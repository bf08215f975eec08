//! Render nodes and the dependency graph.
//!
//! One render node exists per live document node. A node reads a set of
//! identifiers (from its directives or its text interpolation) and may supply
//! identifiers to its descendants. At construction it registers itself with
//! every ancestor that supplies something it reads; an update pass walks those
//! registrations instead of the whole tree.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::{Rc, Weak};

use indexmap::IndexSet;
use markup5ever_rcdom::{Handle, NodeData};

use crate::app::Runtime;
use crate::directive::registry::STRUCTURAL_NAMES;
use crate::directive::{conditional, list, AttributeSyntax, Directive, HookKind};
use crate::dom;
use crate::error::{CompileError, ERR_EVALUATION, ERR_TEARDOWN, WARN_UNKNOWN_DIRECTIVE};
use crate::expression::Compiled;
use crate::path::{intersects, root_of, PathSet};
use crate::scope::{Scope, ENGINE_GLOBALS};

pub(crate) enum TextPart {
    Static(String),
    Expr(Compiled),
}

pub(crate) struct TextTemplate {
    parts: Vec<TextPart>,
    reads: PathSet,
}

impl TextTemplate {
    /// `None` when `text` holds no interpolation.
    pub(crate) fn compile(runtime: &Runtime, text: &str) -> Result<Option<Self>, CompileError> {
        let pattern = runtime.interpolation();
        if !pattern.is_match(text) {
            return Ok(None);
        }
        let mut parts = Vec::new();
        let mut reads = PathSet::new();
        let mut last = 0;
        for caps in pattern.captures_iter(text) {
            let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if whole.start() > last {
                parts.push(TextPart::Static(text[last..whole.start()].to_string()));
            }
            let compiled = Compiled::new(inner.as_str().trim(), runtime.functions())?;
            reads.extend(compiled.reads.iter().cloned());
            parts.push(TextPart::Expr(compiled));
            last = whole.end();
        }
        if last < text.len() {
            parts.push(TextPart::Static(text[last..].to_string()));
        }
        Ok(Some(Self { parts, reads }))
    }

    fn render(&self, scope: &Scope) -> Result<String, String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                TextPart::Static(s) => out.push_str(s),
                TextPart::Expr(compiled) => match compiled.eval(scope) {
                    Ok(value) => out.push_str(&value.to_display_text()),
                    Err(e) => return Err(format!("`{}`: {}", compiled.source, e)),
                },
            }
        }
        Ok(out)
    }
}

enum Content {
    Static,
    Text(TextTemplate),
    Container,
}

pub struct RenderNode {
    runtime: Rc<Runtime>,
    dom: Handle,
    parent: Option<Weak<RenderNode>>,
    scope: Scope,
    owns_scope: bool,
    content: Content,
    directives: Vec<Directive>,
    structural: bool,
    conditional: Option<Rc<conditional::Member>>,
    reads: PathSet,
    supplies: PathSet,
    anchor: Option<Handle>,
    children: RefCell<Vec<Rc<RenderNode>>>,
    dependents: RefCell<Vec<Weak<RenderNode>>>,
    closers: RefCell<Vec<Weak<RenderNode>>>,
    visited: Cell<u64>,
    mounted: Cell<bool>,
    destroyed: Cell<bool>,
}

impl RenderNode {
    /// Build the render node for `dom` and, recursively, its subtree.
    ///
    /// `local` is the node's own scope, if it has one; otherwise it uses its
    /// parent's. `previous` is the preceding element sibling, consulted by
    /// `v-else-if` / `v-else`.
    pub fn build(
        runtime: &Rc<Runtime>,
        dom: Handle,
        parent: Option<&Rc<RenderNode>>,
        local: Option<Scope>,
        previous: Option<&Rc<RenderNode>>,
    ) -> Result<Rc<RenderNode>, CompileError> {
        let mut owns_scope = local.is_some();
        let mut base = match (local, parent) {
            (Some(scope), _) => scope,
            (None, Some(parent)) => parent.scope.clone(),
            (None, None) => {
                return Err(CompileError::MissingScope(
                    dom::tag_name(&dom).unwrap_or_else(|| "#node".to_string()),
                ))
            }
        };

        let mut directives = Vec::new();
        let mut conditional_member = None;
        let content = match &dom.data {
            NodeData::Text { contents } => {
                let text = contents.borrow().to_string();
                match TextTemplate::compile(runtime, &text)? {
                    Some(template) => Content::Text(template),
                    None => Content::Static,
                }
            }
            NodeData::Element { .. } => {
                if let Some(directive) = list::parse(runtime, &dom)? {
                    directives.push(directive);
                } else if let Some((directive, member)) = conditional::parse(runtime, &dom, previous)? {
                    directives.push(directive);
                    conditional_member = Some(member);
                } else {
                    if let Some(scope) = runtime
                        .components()
                        .expand(&dom, &base, &runtime.config().directive_prefix)? {
                        base = scope;
                        owns_scope = true;
                    }
                    directives = parse_directives(runtime, &dom)?;
                }
                Content::Container
            }
            NodeData::Document => Content::Container,
            _ => Content::Static,
        };
        directives.sort_by_key(|d| d.priority);

        let structural = directives.iter().any(|d| d.structural);
        let scope = if directives.iter().any(|d| d.preparer.is_some()) {
            owns_scope = true;
            base.child()
        } else {
            base
        };

        let mut reads = PathSet::new();
        let mut supplies = PathSet::new();
        if let Content::Text(template) = &content {
            reads.extend(template.reads.iter().cloned());
        }
        for directive in &directives {
            reads.extend(directive.dependent_identifiers());
            supplies.extend(directive.supplies.iter().cloned());
        }
        if parent.is_none() {
            supplies.extend(runtime.global_supplies());
        } else if owns_scope {
            supplies.extend(scope.keys());
        }

        let anchor = if directives.iter().any(|d| d.needs_anchor) {
            let marker = dom::create_comment(&anchor_label(&directives));
            if !dom::insert_before(&dom, &marker) {
                return Err(CompileError::InvalidDirective {
                    name: anchor_label(&directives),
                    reason: "the element must have a parent node".to_string(),
                });
            }
            Some(marker)
        } else {
            None
        };

        let node = Rc::new(RenderNode {
            runtime: runtime.clone(),
            dom,
            parent: parent.map(Rc::downgrade),
            scope,
            owns_scope,
            content,
            directives,
            structural,
            conditional: conditional_member,
            reads,
            supplies,
            anchor,
            children: RefCell::new(Vec::new()),
            dependents: RefCell::new(Vec::new()),
            closers: RefCell::new(Vec::new()),
            visited: Cell::new(0),
            mounted: Cell::new(false),
            destroyed: Cell::new(false),
        });
        if node.owns_scope && parent.is_some() {
            node.scope.set_owner(Rc::downgrade(&node));
        }
        node.register_with_ancestors();

        if let Err(e) = node.finish_build() {
            node.destroy();
            return Err(e);
        }
        Ok(node)
    }

    fn finish_build(self: &Rc<Self>) -> Result<(), CompileError> {
        for directive in &self.directives {
            if let Some(updater) = &directive.updater {
                updater.attach(self)?;
            }
        }
        if self.structural {
            dom::detach(&self.dom);
            return Ok(());
        }
        if !matches!(self.content, Content::Container) {
            return Ok(());
        }

        let mut previous: Option<Rc<RenderNode>> = None;
        for child_dom in dom::children(&self.dom) {
            let child = RenderNode::build(&self.runtime, child_dom.clone(), Some(self), None, previous.as_ref())?;
            self.children.borrow_mut().push(child.clone());
            if dom::is_element(&child_dom) {
                previous = Some(child);
            } else if dom::is_text(&child_dom) && !dom::text_content(&child_dom).trim().is_empty() {
                previous = None;
            }
        }
        Ok(())
    }

    /// Record this node as a dependent of each ancestor supplying one of the
    /// identifiers it reads. The root supplies the application state and
    /// catches any identifier no nearer ancestor supplies.
    fn register_with_ancestors(self: &Rc<Self>) {
        let roots: IndexSet<&str> = self.reads.iter().map(|r| root_of(r)).collect();
        if roots.is_empty() {
            return;
        }
        let mut supplied_below: HashSet<String> = HashSet::new();
        let mut current = self.parent();
        while let Some(ancestor) = current {
            let hit = if ancestor.parent.is_none() {
                roots.iter().any(|r| {
                    !ENGINE_GLOBALS.contains(*r)
                        && (ancestor.supplies.contains(*r) || !supplied_below.contains(*r))
                })
            } else {
                roots.iter().any(|r| ancestor.supplies.contains(*r))
            };
            if hit {
                ancestor.add_dependent(self);
                self.closers.borrow_mut().push(Rc::downgrade(&ancestor));
            }
            supplied_below.extend(ancestor.supplies.iter().cloned());
            current = ancestor.parent();
        }
    }

    /// Dependents stay in document order. During the initial build nodes
    /// arrive in order; nodes materialized later are placed by position.
    fn add_dependent(&self, dependent: &Rc<RenderNode>) {
        let mut dependents = self.dependents.borrow_mut();
        if !self.mounted.get() {
            dependents.push(Rc::downgrade(dependent));
            return;
        }
        dependents.retain(|d| d.strong_count() > 0);
        let position = dependent.position();
        let mut at = dependents.len();
        while at > 0 {
            match dependents[at - 1].upgrade() {
                Some(existing) if dom::precedes(position, existing.position()) => at -= 1,
                _ => break,
            }
        }
        dependents.insert(at, Rc::downgrade(dependent));
    }

    fn position(&self) -> &Handle {
        self.anchor.as_ref().unwrap_or(&self.dom)
    }

    fn remove_dependent(&self, dependent: &Weak<RenderNode>) {
        self.dependents
            .borrow_mut()
            .retain(|d| !Weak::ptr_eq(d, dependent) && d.strong_count() > 0);
    }

    pub fn dom(&self) -> &Handle {
        &self.dom
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub(crate) fn runtime(&self) -> &Rc<Runtime> {
        &self.runtime
    }

    pub fn parent(&self) -> Option<Rc<RenderNode>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn children(&self) -> Vec<Rc<RenderNode>> {
        self.children.borrow().clone()
    }

    pub fn reads(&self) -> &PathSet {
        &self.reads
    }

    pub fn supplies(&self) -> &PathSet {
        &self.supplies
    }

    pub fn anchor(&self) -> Option<&Handle> {
        self.anchor.as_ref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.get()
    }

    pub fn directive_names(&self) -> Vec<&str> {
        self.directives.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn dependent_count(&self) -> usize {
        self.dependents
            .borrow()
            .iter()
            .filter(|d| d.strong_count() > 0)
            .count()
    }

    pub(crate) fn conditional_member(&self) -> Option<&Rc<conditional::Member>> {
        self.conditional.as_ref()
    }

    /// Live document nodes this render node occupies, in order.
    pub fn dom_nodes(&self) -> Vec<Handle> {
        let mut out = Vec::new();
        if let Some(anchor) = &self.anchor {
            out.push(anchor.clone());
        }
        if self.structural {
            for child in self.children.borrow().iter() {
                out.extend(child.dom_nodes());
            }
        } else {
            out.push(self.dom.clone());
        }
        out
    }

    /// Build a child for a clone of this node's template. The clone must
    /// already sit at its final position in the document.
    pub(crate) fn spawn(self: &Rc<Self>, dom: Handle, local: Option<Scope>) -> Result<Rc<RenderNode>, CompileError> {
        let child = RenderNode::build(&self.runtime, dom, Some(self), local, None)?;
        self.children.borrow_mut().push(child.clone());
        Ok(child)
    }

    pub(crate) fn release_child(&self, child: &Rc<RenderNode>) {
        self.children.borrow_mut().retain(|c| !Rc::ptr_eq(c, child));
    }

    pub fn update(self: &Rc<Self>) {
        self.run(false);
    }

    /// Render regardless of the change set, including the whole subtree.
    pub fn force_update(self: &Rc<Self>) {
        self.run(true);
    }

    fn run(self: &Rc<Self>, forced: bool) {
        if self.destroyed.get() {
            return;
        }
        let pass = self.runtime.queue().pass_id();
        if self.visited.replace(pass) == pass && !forced {
            return;
        }
        let first = !self.mounted.get();
        if first {
            self.hook(HookKind::Mount);
        }

        let rendered = match &self.content {
            Content::Static => false,
            Content::Text(template) => {
                let hit = forced || intersects(&template.reads, &self.scope.changes());
                if hit {
                    match template.render(&self.scope) {
                        Ok(text) => dom::set_text(&self.dom, &text),
                        Err(e) => self.runtime.diagnostics().error(ERR_EVALUATION, e),
                    }
                }
                hit
            }
            Content::Container => self.run_directives(forced, first),
        };

        if first {
            self.mounted.set(true);
            self.hook(HookKind::Mounted);
        } else if rendered {
            self.hook(HookKind::Updated);
        }

        if forced {
            if !self.structural {
                for child in self.children() {
                    child.run(true);
                }
            }
        } else {
            let dependents: Vec<Rc<RenderNode>> = self
                .dependents
                .borrow()
                .iter()
                .filter_map(Weak::upgrade)
                .collect();
            for dependent in dependents {
                if intersects(&dependent.reads, &dependent.scope.changes()) {
                    dependent.run(false);
                }
            }
        }
    }

    /// Run triggered preparers, then triggered updaters. Returns whether
    /// anything ran.
    fn run_directives(self: &Rc<Self>, forced: bool, first: bool) -> bool {
        let changes = self.scope.changes();
        let preparers: Vec<usize> = self
            .directives
            .iter()
            .enumerate()
            .filter(|(_, d)| {
                d.preparer
                    .as_ref()
                    .is_some_and(|p| forced || intersects(p.dependencies(), &changes))
            })
            .map(|(i, _)| i)
            .collect();
        let any_updater = self.directives.iter().any(|d| {
            d.updater
                .as_ref()
                .is_some_and(|u| forced || intersects(u.dependencies(), &changes))
        });
        if preparers.is_empty() && !any_updater {
            return false;
        }
        if !first {
            self.hook(HookKind::Update);
        }

        for i in &preparers {
            let directive = &self.directives[*i];
            let Some(preparer) = &directive.preparer else {
                continue;
            };
            match preparer.prepare(self.scope.parent().unwrap_or(&self.scope)) {
                Ok(bindings) => {
                    for (key, value) in bindings {
                        if forced {
                            self.scope.define(&key, value);
                        } else {
                            self.scope.bind(&key, value);
                        }
                    }
                }
                Err(e) => self.report(&directive.name, &e),
            }
        }

        let changes = if preparers.is_empty() {
            changes
        } else {
            self.scope.changes()
        };
        for directive in &self.directives {
            let Some(updater) = directive.updater.clone() else {
                continue;
            };
            if forced || intersects(updater.dependencies(), &changes) {
                if let Err(e) = updater.update(self, forced) {
                    self.report(&directive.name, &e);
                }
            }
        }
        true
    }

    fn report(&self, directive: &str, error: &dyn std::fmt::Display) {
        let tag = dom::tag_name(&self.dom).unwrap_or_default();
        self.runtime
            .diagnostics()
            .error(ERR_EVALUATION, format!("<{}> {}: {}", tag, directive, error));
    }

    fn hook(self: &Rc<Self>, kind: HookKind) {
        for directive in &self.directives {
            if let Some(hook) = directive.hooks.get(kind).cloned() {
                if let Err(e) = hook(self) {
                    let code = match kind {
                        HookKind::Unmount | HookKind::Unmounted => ERR_TEARDOWN,
                        _ => ERR_EVALUATION,
                    };
                    self.runtime
                        .diagnostics()
                        .error(code, format!("{} hook `{}` failed: {}", directive.name, kind_name(kind), e));
                }
            }
        }
    }

    /// Tear the subtree down: children first, then this node's registrations,
    /// then its directives. Each step reports its own failures and the rest
    /// continue. Does not touch the node's position in the document.
    pub fn destroy(self: &Rc<Self>) {
        if self.destroyed.replace(true) {
            return;
        }
        let mounted = self.mounted.get();
        if mounted {
            self.hook(HookKind::Unmount);
        }

        let children = std::mem::take(&mut *self.children.borrow_mut());
        for child in children {
            child.destroy();
        }

        let me = Rc::downgrade(self);
        for ancestor in std::mem::take(&mut *self.closers.borrow_mut()) {
            if let Some(ancestor) = ancestor.upgrade() {
                ancestor.remove_dependent(&me);
            }
        }
        self.dependents.borrow_mut().clear();

        for directive in &self.directives {
            if let Some(updater) = &directive.updater {
                if let Err(e) = updater.destroy(self) {
                    self.runtime.diagnostics().error(
                        ERR_TEARDOWN,
                        format!("teardown of {} failed: {}", directive.name, e),
                    );
                }
            }
        }
        if mounted {
            self.hook(HookKind::Unmounted);
        }

        self.runtime.events().remove_node(&self.dom);
        if self.owns_scope && self.parent.is_some() {
            self.scope.dispose();
        }
    }
}

impl std::fmt::Debug for RenderNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderNode")
            .field("tag", &dom::tag_name(&self.dom))
            .field("directives", &self.directive_names())
            .field("reads", &self.reads)
            .field("supplies", &self.supplies)
            .finish()
    }
}

fn kind_name(kind: HookKind) -> &'static str {
    match kind {
        HookKind::Mount => "mount",
        HookKind::Mounted => "mounted",
        HookKind::Update => "update",
        HookKind::Updated => "updated",
        HookKind::Unmount => "unmount",
        HookKind::Unmounted => "unmounted",
    }
}

fn anchor_label(directives: &[Directive]) -> String {
    directives
        .iter()
        .find(|d| d.needs_anchor)
        .map(|d| d.name.clone())
        .unwrap_or_default()
}

/// Instantiate the element's non-structural directives and strip the
/// attributes they consume.
fn parse_directives(runtime: &Runtime, element: &Handle) -> Result<Vec<Directive>, CompileError> {
    let prefix = &runtime.config().directive_prefix;
    let mut directives = Vec::new();
    for (name, value) in dom::attributes(element) {
        let Some(syntax) = AttributeSyntax::parse(&name, &value, prefix) else {
            continue;
        };
        if STRUCTURAL_NAMES.contains(&syntax.name.as_str()) {
            continue;
        }
        match runtime.registry().parse(element, &syntax, runtime.functions())? {
            Some(directive) => {
                dom::remove_attribute(element, &name);
                directives.push(directive);
            }
            None => {
                if runtime.config().warn_on_unknown_directive {
                    runtime.diagnostics().warn(
                        WARN_UNKNOWN_DIRECTIVE,
                        format!("no directive handles `{}`", name),
                    );
                }
            }
        }
    }
    Ok(directives)
}

/// Compile every expression in a template subtree without building it, so
/// malformed expressions inside list and conditional templates fail at
/// construction rather than at first render.
pub(crate) fn precompile(runtime: &Runtime, template: &Handle) -> Result<(), CompileError> {
    match &template.data {
        NodeData::Text { contents } => {
            let text = contents.borrow().to_string();
            TextTemplate::compile(runtime, &text)?;
        }
        NodeData::Element { .. } => {
            let prefix = &runtime.config().directive_prefix;
            for (name, value) in dom::attributes(template) {
                let Some(syntax) = AttributeSyntax::parse(&name, &value, prefix) else {
                    continue;
                };
                match syntax.name.as_str() {
                    "for" => {
                        list::ForExpression::parse(&value, runtime.functions())?;
                    }
                    "if" | "else-if" => {
                        Compiled::new(&value, runtime.functions())?;
                    }
                    "else" => {}
                    _ => {
                        runtime.registry().parse(template, &syntax, runtime.functions())?;
                    }
                }
            }
            for child in dom::children(template) {
                precompile(runtime, &child)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{App, AppBuilder};
    use crate::directive::{DirectiveSource, DomUpdater};
    use crate::error::EvalResult;
    use crate::value::Value;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    type Trace = Rc<RefCell<Vec<String>>>;

    struct Trail {
        label: String,
        reads: PathSet,
        trace: Trace,
    }

    impl DomUpdater for Trail {
        fn dependencies(&self) -> &PathSet {
            &self.reads
        }

        fn update(&self, _node: &Rc<RenderNode>, _forced: bool) -> EvalResult<()> {
            self.trace.borrow_mut().push(self.label.clone());
            Ok(())
        }
    }

    fn traced(builder: AppBuilder, trace: &Trace) -> AppBuilder {
        let trace = trace.clone();
        builder.directive(
            "trail",
            Rc::new(move |source: &DirectiveSource<'_>| -> Result<Directive, CompileError> {
                let compiled = source.compile_value()?;
                Ok(Directive::new("trail").with_updater(Rc::new(Trail {
                    label: source.syntax.arg.clone().unwrap_or_default(),
                    reads: compiled.reads,
                    trace: trace.clone(),
                })))
            }),
        )
    }

    #[test]
    fn test_late_items_join_dependents_in_document_order() {
        let trace = Trace::default();
        let app = traced(App::builder().state(json!({ "items": [], "tag": "a" })), &trace)
            .build()
            .unwrap();
        app.mount_html(
            "<div id=app><ul><li v-for=\"item in items\" v-trail:item=\"tag\"></li></ul>\
             <p v-trail:after=\"tag\"></p></div>",
        )
        .unwrap();
        assert_eq!(*trace.borrow(), vec!["after"]);

        app.set("items", Value::from(json!([1])));
        app.tick();
        assert_eq!(*trace.borrow(), vec!["after", "item"]);

        trace.borrow_mut().clear();
        app.set("tag", "b");
        app.tick();
        assert_eq!(*trace.borrow(), vec!["item", "after"]);
    }

    #[test]
    fn test_failing_expression_spares_siblings() {
        let app = App::builder()
            .data("label", "one")
            .data("broken", Value::Null)
            .build()
            .unwrap();
        app.mount_html(
            "<div id=app><p>{{ label + broken.x }}</p><span id=attr :title=\"label + broken.x\"></span>\
             <p id=good>{{ label }}</p></div>",
        )
        .unwrap();
        assert_eq!(app.diagnostic_count(ERR_EVALUATION), 2);

        app.set("label", "two");
        assert_eq!(app.tick(), 1);
        assert_eq!(app.diagnostic_count(ERR_EVALUATION), 4);
        assert_eq!(dom::text_content(&app.element_by_id("good").unwrap()), "two");
    }
}
