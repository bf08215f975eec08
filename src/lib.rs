//! # Zenith Runtime
//!
//! A reactive template engine over an HTML document tree.
//!
//! ## Model
//!
//! 1. **Scopes**: state lives in a chain of binding scopes. The root scope
//!    holds application state, methods and computed properties; list items,
//!    components and `v-let` get child scopes.
//!
//! 2. **Change paths**: every write is recorded as a dotted path
//!    (`todos[0].done`, `user.name`). Reactive wrappers carry their root path
//!    so nested mutations record against the binding they came from.
//!
//! 3. **Render nodes**: each DOM node with directives or interpolations gets a
//!    render node that knows the expressions it reads. A pass updates a node
//!    only when a recorded change intersects its reads.
//!
//! 4. **Passes**: writes schedule one pass per tick. Writes made during a pass
//!    schedule exactly one follow-up pass.
//!
//! ## Directives
//!
//! `v-if`/`v-else-if`/`v-else`, keyed `v-for`, `v-show`, `v-text`,
//! `:attr`, `@event`, `v-model`, `v-let` and the lifecycle hooks are built in.
//! Custom directives register through [`AppBuilder::directive`].

pub mod app;
pub mod component;
pub mod config;
pub mod diagnostics;
pub mod directive;
pub mod dom;
pub mod error;
pub mod events;
pub mod expression;
pub mod node;
pub mod path;
pub mod reactive;
pub mod scheduler;
pub mod scope;
pub mod value;

#[cfg(test)]
mod engine_tests;

pub use app::{App, AppBuilder, Runtime};
pub use component::{ComponentFactory, Props};
pub use config::AppConfig;
pub use diagnostics::{Diagnostic, Diagnostics, Level};
pub use directive::{Directive, DirectiveFactory, DirectiveSource};
pub use error::{CompileError, EvalError, EvalResult};
pub use events::Event;
pub use node::RenderNode;
pub use scope::Scope;
pub use value::Value;
