//! Attribute parser registry.
//!
//! Maps directive names to factories. Built once per application and threaded
//! through tree construction; hosts add their own directives by name.

use std::rc::Rc;

use indexmap::IndexMap;
use markup5ever_rcdom::Handle;

use super::{bind, event, lifecycle, local, model, AttributeSyntax, Directive};
use crate::error::CompileError;
use crate::expression::{Compiled, FunctionClosures};

/// Directive names resolved by tree construction itself.
pub const STRUCTURAL_NAMES: &[&str] = &["for", "if", "else-if", "else"];

/// Everything a factory may inspect while building a directive.
pub struct DirectiveSource<'a> {
    pub element: &'a Handle,
    pub syntax: &'a AttributeSyntax,
    pub functions: &'a FunctionClosures,
}

impl DirectiveSource<'_> {
    pub fn compile(&self, source: &str) -> Result<Compiled, CompileError> {
        Compiled::new(source, self.functions)
    }

    /// Compile the attribute value.
    pub fn compile_value(&self) -> Result<Compiled, CompileError> {
        if self.syntax.value.trim().is_empty() {
            return Err(CompileError::InvalidDirective {
                name: self.syntax.attribute.clone(),
                reason: "expression is empty".to_string(),
            });
        }
        self.compile(&self.syntax.value)
    }

    pub fn invalid(&self, reason: impl Into<String>) -> CompileError {
        CompileError::InvalidDirective {
            name: self.syntax.attribute.clone(),
            reason: reason.into(),
        }
    }
}

pub type DirectiveFactory = Rc<dyn Fn(&DirectiveSource<'_>) -> Result<Directive, CompileError>>;

#[derive(Clone)]
pub struct DirectiveRegistry {
    factories: IndexMap<String, DirectiveFactory>,
}

impl Default for DirectiveRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("bind", Rc::new(bind::parse_bind));
        registry.register("text", Rc::new(bind::parse_text));
        registry.register("show", Rc::new(bind::parse_show));
        registry.register("let", Rc::new(local::parse_let));
        registry.register("model", Rc::new(model::parse_model));
        registry.register("on", Rc::new(event::parse_on));
        for hook in ["mount", "mounted", "update", "updated", "unmount", "unmounted"] {
            registry.register(hook, Rc::new(lifecycle::parse_hook));
        }
        registry
    }
}

impl DirectiveRegistry {
    pub fn empty() -> Self {
        Self {
            factories: IndexMap::new(),
        }
    }

    /// Register (or replace) the factory for `v-<name>`.
    pub fn register(&mut self, name: &str, factory: DirectiveFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build the directive for one attribute, or `None` when no factory
    /// claims it.
    pub fn parse(
        &self,
        element: &Handle,
        syntax: &AttributeSyntax,
        functions: &FunctionClosures,
    ) -> Result<Option<Directive>, CompileError> {
        let Some(factory) = self.factories.get(&syntax.name) else {
            return Ok(None);
        };
        let source = DirectiveSource {
            element,
            syntax,
            functions,
        };
        factory(&source).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom;

    #[test]
    fn test_builtins_and_custom_registration() {
        let mut registry = DirectiveRegistry::default();
        assert!(registry.contains("bind") && registry.contains("unmounted"));
        assert!(!registry.contains("focus"));

        registry.register(
            "focus",
            Rc::new(|_source: &DirectiveSource<'_>| -> Result<Directive, CompileError> {
                Ok(Directive::new("focus"))
            }),
        );
        let node = dom::parse_fragment("<input v-focus>").unwrap().remove(0);
        let syntax = AttributeSyntax::parse("v-focus", "", "v-").unwrap();
        let directive = registry
            .parse(&node, &syntax, &FunctionClosures::new())
            .unwrap()
            .unwrap();
        assert_eq!(directive.name, "focus");
    }

    #[test]
    fn test_unknown_name_is_no_match() {
        let registry = DirectiveRegistry::default();
        let node = dom::create_element("div");
        let syntax = AttributeSyntax::parse("v-unknown", "x", "v-").unwrap();
        assert!(registry
            .parse(&node, &syntax, &FunctionClosures::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_empty_expression_is_rejected() {
        let registry = DirectiveRegistry::default();
        let node = dom::create_element("div");
        let syntax = AttributeSyntax::parse("v-text", "  ", "v-").unwrap();
        let err = registry
            .parse(&node, &syntax, &FunctionClosures::new())
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ERR_INVALID_DIRECTIVE);
    }
}
