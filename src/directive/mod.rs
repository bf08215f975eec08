//! Directives: capability bundles attached to a render node by template
//! attributes.
//!
//! A directive may carry a bindings preparer (new scope bindings for the
//! node's subtree), a DOM updater (applies computed values to the live node)
//! and any of the six lifecycle hooks. The dependency graph only looks at the
//! capabilities that are present.

pub mod bind;
pub mod conditional;
pub mod event;
pub mod lifecycle;
pub mod list;
pub mod local;
pub mod model;
pub mod registry;
pub mod syntax;

use std::rc::Rc;

use crate::error::{CompileError, EvalResult};
use crate::node::RenderNode;
use crate::path::PathSet;
use crate::scope::Scope;
use crate::value::Value;

pub use registry::{DirectiveFactory, DirectiveRegistry, DirectiveSource};
pub use syntax::AttributeSyntax;

/// Resolution order within one node: lists, then conditionals and `v-show`,
/// then everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    List = 0,
    Conditional = 1,
    Normal = 2,
}

pub trait BindingsPreparer {
    fn dependencies(&self) -> &PathSet;

    /// Names this preparer introduces into the node's scope.
    fn supplies(&self) -> Vec<String>;

    fn prepare(&self, scope: &Scope) -> EvalResult<Vec<(String, Value)>>;
}

pub trait DomUpdater {
    fn dependencies(&self) -> &PathSet;

    /// Called once the owning node exists, before its first render.
    fn attach(&self, _node: &Rc<RenderNode>) -> Result<(), CompileError> {
        Ok(())
    }

    /// Apply the current value. `forced` is set on the first render of a node
    /// and when a branch or list item is materialized.
    fn update(&self, node: &Rc<RenderNode>, forced: bool) -> EvalResult<()>;

    fn destroy(&self, _node: &Rc<RenderNode>) -> EvalResult<()> {
        Ok(())
    }
}

pub type Hook = Rc<dyn Fn(&Rc<RenderNode>) -> EvalResult<()>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    Mount,
    Mounted,
    Update,
    Updated,
    Unmount,
    Unmounted,
}

impl HookKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "mount" => Self::Mount,
            "mounted" => Self::Mounted,
            "update" => Self::Update,
            "updated" => Self::Updated,
            "unmount" => Self::Unmount,
            "unmounted" => Self::Unmounted,
            _ => return None,
        })
    }
}

#[derive(Clone, Default)]
pub struct LifecycleHooks {
    pub on_mount: Option<Hook>,
    pub on_mounted: Option<Hook>,
    pub on_update: Option<Hook>,
    pub on_updated: Option<Hook>,
    pub on_unmount: Option<Hook>,
    pub on_unmounted: Option<Hook>,
}

impl LifecycleHooks {
    pub fn get(&self, kind: HookKind) -> Option<&Hook> {
        match kind {
            HookKind::Mount => self.on_mount.as_ref(),
            HookKind::Mounted => self.on_mounted.as_ref(),
            HookKind::Update => self.on_update.as_ref(),
            HookKind::Updated => self.on_updated.as_ref(),
            HookKind::Unmount => self.on_unmount.as_ref(),
            HookKind::Unmounted => self.on_unmounted.as_ref(),
        }
    }

    pub fn set(&mut self, kind: HookKind, hook: Hook) {
        let slot = match kind {
            HookKind::Mount => &mut self.on_mount,
            HookKind::Mounted => &mut self.on_mounted,
            HookKind::Update => &mut self.on_update,
            HookKind::Updated => &mut self.on_updated,
            HookKind::Unmount => &mut self.on_unmount,
            HookKind::Unmounted => &mut self.on_unmounted,
        };
        *slot = Some(hook);
    }
}

pub struct Directive {
    pub name: String,
    pub priority: Priority,
    pub needs_anchor: bool,
    /// The directive renders clones of the node instead of the node itself;
    /// the node's own children and remaining attributes are left to the clones.
    pub structural: bool,
    /// Identifiers this directive makes available to descendants.
    pub supplies: PathSet,
    pub preparer: Option<Box<dyn BindingsPreparer>>,
    pub updater: Option<Rc<dyn DomUpdater>>,
    pub hooks: LifecycleHooks,
}

impl Directive {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: Priority::Normal,
            needs_anchor: false,
            structural: false,
            supplies: PathSet::new(),
            preparer: None,
            updater: None,
            hooks: LifecycleHooks::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_updater(mut self, updater: Rc<dyn DomUpdater>) -> Self {
        self.updater = Some(updater);
        self
    }

    pub fn with_preparer(mut self, preparer: Box<dyn BindingsPreparer>) -> Self {
        self.supplies.extend(preparer.supplies());
        self.preparer = Some(preparer);
        self
    }

    pub fn with_hook(mut self, kind: HookKind, hook: Hook) -> Self {
        self.hooks.set(kind, hook);
        self
    }

    /// Structural directives replace the node with an anchor and render
    /// clones of it.
    pub fn structural(mut self, supplies: impl IntoIterator<Item = String>) -> Self {
        self.structural = true;
        self.needs_anchor = true;
        self.supplies.extend(supplies);
        self
    }

    /// Every identifier the directive's capabilities depend on.
    pub fn dependent_identifiers(&self) -> PathSet {
        let mut all = PathSet::new();
        if let Some(preparer) = &self.preparer {
            all.extend(preparer.dependencies().iter().cloned());
        }
        if let Some(updater) = &self.updater {
            all.extend(updater.dependencies().iter().cloned());
        }
        all
    }
}

impl std::fmt::Debug for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directive")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("structural", &self.structural)
            .field("dependencies", &self.dependent_identifiers())
            .finish()
    }
}
