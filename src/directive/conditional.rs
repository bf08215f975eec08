//! `v-if` / `v-else-if` / `v-else` chains.
//!
//! Each element of a chain is a member of one shared group. Members keep
//! their element as a template behind an anchor comment; whenever any member
//! is triggered the group re-evaluates the chain in order and materializes at
//! most one branch.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use markup5ever_rcdom::Handle;

use super::{Directive, DomUpdater, Priority};
use crate::app::Runtime;
use crate::dom;
use crate::error::{CompileError, EvalError, EvalResult};
use crate::expression::Compiled;
use crate::node::{precompile, RenderNode};
use crate::path::PathSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    If,
    ElseIf,
    Else,
}

impl MemberKind {
    fn name(self) -> &'static str {
        match self {
            MemberKind::If => "if",
            MemberKind::ElseIf => "else-if",
            MemberKind::Else => "else",
        }
    }
}

#[derive(Default)]
pub struct ConditionalGroup {
    members: RefCell<Vec<Weak<Member>>>,
    /// Union of every member's condition reads, in chain order.
    reads: RefCell<PathSet>,
    rendered_pass: Cell<u64>,
}

impl ConditionalGroup {
    pub fn len(&self) -> usize {
        self.members.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn members(&self) -> Vec<Rc<Member>> {
        self.members.borrow().iter().filter_map(Weak::upgrade).collect()
    }

    /// Index of the first member whose condition holds.
    fn active(&self, members: &[Rc<Member>]) -> EvalResult<Option<usize>> {
        for (i, member) in members.iter().enumerate() {
            let Some(node) = member.node() else {
                continue;
            };
            if member.condition_is_met(&node)? {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Re-evaluate the chain, at most once per pass.
    fn render(&self, pass: u64) -> EvalResult<()> {
        if self.rendered_pass.replace(pass) == pass {
            return Ok(());
        }
        let members = self.members();
        let active = self.active(&members)?;
        let mut failure = None;
        for (i, member) in members.iter().enumerate() {
            if Some(i) == active {
                if let Err(e) = member.materialize() {
                    failure.get_or_insert(e);
                }
            } else {
                member.tear_down();
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub struct Member {
    kind: MemberKind,
    condition: Option<Compiled>,
    group: Rc<ConditionalGroup>,
    node: RefCell<Weak<RenderNode>>,
    branch: RefCell<Option<Rc<RenderNode>>>,
}

impl Member {
    pub fn kind(&self) -> MemberKind {
        self.kind
    }

    pub fn group(&self) -> &Rc<ConditionalGroup> {
        &self.group
    }

    /// The live branch, when this member is the active one.
    pub fn branch(&self) -> Option<Rc<RenderNode>> {
        self.branch.borrow().clone()
    }

    fn node(&self) -> Option<Rc<RenderNode>> {
        self.node.borrow().upgrade().filter(|n| !n.is_destroyed())
    }

    fn condition_is_met(&self, node: &Rc<RenderNode>) -> EvalResult<bool> {
        match &self.condition {
            Some(condition) => Ok(condition.eval(node.scope())?.is_truthy()),
            None => Ok(true),
        }
    }

    fn materialize(&self) -> EvalResult<()> {
        if self.branch.borrow().is_some() {
            return Ok(());
        }
        let Some(node) = self.node() else {
            return Ok(());
        };
        let Some(anchor) = node.anchor().cloned() else {
            return Err(EvalError::Custom("conditional has no anchor".to_string()));
        };
        let clone = dom::deep_clone(node.dom());
        if !dom::insert_after(&anchor, &clone) {
            return Err(EvalError::Custom("conditional anchor is not attached".to_string()));
        }
        let branch = node.spawn(clone.clone(), None).map_err(|e| {
            dom::detach(&clone);
            EvalError::Custom(e.to_string())
        })?;
        *self.branch.borrow_mut() = Some(branch.clone());
        branch.force_update();
        Ok(())
    }

    fn tear_down(&self) {
        let Some(branch) = self.branch.borrow_mut().take() else {
            return;
        };
        let nodes = branch.dom_nodes();
        branch.destroy();
        if let Some(node) = self.node() {
            node.release_child(&branch);
        }
        for dom_node in nodes {
            dom::detach(&dom_node);
        }
    }
}

struct ConditionalRenderer {
    member: Rc<Member>,
    reads: PathSet,
}

impl DomUpdater for ConditionalRenderer {
    fn dependencies(&self) -> &PathSet {
        &self.reads
    }

    fn attach(&self, node: &Rc<RenderNode>) -> Result<(), CompileError> {
        *self.member.node.borrow_mut() = Rc::downgrade(node);
        Ok(())
    }

    fn update(&self, node: &Rc<RenderNode>, _forced: bool) -> EvalResult<()> {
        self.member.group.render(node.runtime().queue().pass_id())
    }

    fn destroy(&self, _node: &Rc<RenderNode>) -> EvalResult<()> {
        self.member.branch.borrow_mut().take();
        Ok(())
    }
}

/// Claim a conditional element. `previous` is the render node of the
/// preceding element sibling; `v-else-if` and `v-else` join its group.
pub fn parse(
    runtime: &Runtime,
    element: &Handle,
    previous: Option<&Rc<RenderNode>>,
) -> Result<Option<(Directive, Rc<Member>)>, CompileError> {
    let prefix = &runtime.config().directive_prefix;
    let found = [MemberKind::If, MemberKind::ElseIf, MemberKind::Else]
        .into_iter()
        .find_map(|kind| {
            let attribute = format!("{}{}", prefix, kind.name());
            dom::get_attribute(element, &attribute).map(|value| (kind, attribute, value))
        });
    let Some((kind, attribute, value)) = found else {
        return Ok(None);
    };

    let group = match kind {
        MemberKind::If => Rc::new(ConditionalGroup::default()),
        MemberKind::ElseIf | MemberKind::Else => previous
            .and_then(|p| p.conditional_member())
            .filter(|m| m.kind != MemberKind::Else)
            .map(|m| m.group.clone())
            .ok_or_else(|| CompileError::OrphanConditional {
                directive: attribute.clone(),
            })?,
    };
    dom::remove_attribute(element, &attribute);

    let condition = match kind {
        MemberKind::Else => None,
        _ => Some(Compiled::new(&value, runtime.functions())?),
    };
    precompile(runtime, element)?;

    let reads = {
        let mut all = group.reads.borrow_mut();
        if let Some(condition) = &condition {
            all.extend(condition.reads.iter().cloned());
        }
        all.clone()
    };
    let member = Rc::new(Member {
        kind,
        condition,
        group: group.clone(),
        node: RefCell::new(Weak::new()),
        branch: RefCell::new(None),
    });
    group.members.borrow_mut().push(Rc::downgrade(&member));

    let directive = Directive::new(kind.name())
        .with_priority(Priority::Conditional)
        .with_updater(Rc::new(ConditionalRenderer {
            member: member.clone(),
            reads,
        }))
        .structural(Vec::new());
    Ok(Some((directive, member)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use crate::directive::DirectiveSource;
    use crate::error::ERR_TEARDOWN;
    use crate::value::Value;

    /// Updater whose teardown always fails.
    struct Fragile {
        reads: PathSet,
    }

    impl DomUpdater for Fragile {
        fn dependencies(&self) -> &PathSet {
            &self.reads
        }

        fn update(&self, _node: &Rc<RenderNode>, _forced: bool) -> EvalResult<()> {
            Ok(())
        }

        fn destroy(&self, _node: &Rc<RenderNode>) -> EvalResult<()> {
            Err(EvalError::Custom("stuck".to_string()))
        }
    }

    fn app() -> App {
        let app = App::builder()
            .data("show", true)
            .data("nothing", Value::Null)
            .data("n", 0)
            .directive(
                "fragile",
                Rc::new(|_source: &DirectiveSource<'_>| -> Result<Directive, CompileError> {
                    Ok(Directive::new("fragile").with_updater(Rc::new(Fragile {
                        reads: PathSet::new(),
                    })))
                }),
            )
            .build()
            .unwrap();
        app.mount_html(
            "<div id=app><section v-if=\"show\"><p v-unmount=\"nothing.x\" v-fragile>a</p>\
             <button id=b @click=\"n++\">b</button></section><p v-else id=empty>none</p></div>",
        )
        .unwrap();
        app
    }

    #[test]
    fn test_failed_teardown_does_not_block_siblings() {
        let app = app();
        let button = app.element_by_id("b").unwrap();
        assert_eq!(app.runtime().events().listener_count(&button), 1);

        app.set("show", false);
        app.tick();
        assert_eq!(app.diagnostic_count(ERR_TEARDOWN), 2);
        assert_eq!(app.runtime().events().listener_count(&button), 0);
        assert!(app.element_by_id("b").is_none());
        assert!(app.element_by_id("empty").is_some());
    }

    #[test]
    fn test_reshown_branch_is_rebuilt() {
        let app = app();
        let first = app.element_by_id("b").unwrap();
        app.set("show", false);
        app.tick();
        app.set("show", true);
        app.tick();

        let second = app.element_by_id("b").unwrap();
        assert!(!dom::same_node(&first, &second));
        assert_eq!(app.runtime().events().listener_count(&second), 1);
        assert!(app.element_by_id("empty").is_none());
        app.click(&second);
        app.tick();
        assert_eq!(app.get("n").to_number(), 1.0);
    }
}
