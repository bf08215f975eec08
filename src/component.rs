//! Template components.
//!
//! A component is a tag name bound to an HTML template and a factory that
//! seeds the instance scope from the host element's props. Expansion happens
//! at tree construction: the host keeps its own attributes, its children are
//! replaced by a clone of the template, and any `<slot>` in the template
//! receives the host's original children.

use std::rc::Rc;

use indexmap::IndexMap;
use markup5ever_rcdom::Handle;

use crate::directive::local::camelize;
use crate::directive::AttributeSyntax;
use crate::dom;
use crate::error::CompileError;
use crate::expression::{Compiled, FunctionClosures};
use crate::scope::Scope;
use crate::value::Value;

pub type Props = IndexMap<String, Value>;

/// Produces the instance bindings from the host's props.
pub type ComponentFactory = Rc<dyn Fn(&Props) -> Vec<(String, Value)>>;

#[derive(Clone)]
pub struct Component {
    template: Vec<Handle>,
    factory: ComponentFactory,
}

#[derive(Clone, Default)]
pub struct ComponentRegistry {
    components: IndexMap<String, Component>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tag: &str, template: &str, factory: ComponentFactory) -> Result<(), CompileError> {
        let template = dom::parse_fragment(template)?;
        self.components.insert(tag.to_ascii_lowercase(), Component { template, factory });
        Ok(())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.components.contains_key(&tag.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Expand `host` in place if its tag is registered, returning the
    /// instance scope (a child of `scope`).
    ///
    /// Props are the host's plain attributes as strings, plus `:name`
    /// attributes evaluated once against `scope`.
    pub fn expand(&self, host: &Handle, scope: &Scope, prefix: &str) -> Result<Option<Scope>, CompileError> {
        let Some(tag) = dom::tag_name(host) else {
            return Ok(None);
        };
        let Some(component) = self.components.get(&tag) else {
            return Ok(None);
        };
        let mut ancestor = dom::parent(host);
        while let Some(node) = ancestor {
            if dom::tag_name(&node).as_deref() == Some(tag.as_str()) {
                return Err(CompileError::Template(format!("<{}> cannot contain itself", tag)));
            }
            ancestor = dom::parent(&node);
        }

        let props = props_of(host, scope, prefix)?;
        let instance = scope.child();
        for (name, value) in &props {
            instance.define(name, value.clone());
        }
        for (name, value) in (component.factory)(&props) {
            instance.define(&name, value);
        }

        let slotted = dom::children(host);
        let holder = dom::create_element("template");
        for root in &component.template {
            dom::append(&holder, &dom::deep_clone(root));
        }
        fill_slots(&holder, &slotted, &mut false);
        dom::replace_children(host, &dom::children(&holder));
        Ok(Some(instance))
    }
}

fn props_of(host: &Handle, scope: &Scope, prefix: &str) -> Result<Props, CompileError> {
    let mut props = Props::new();
    for (name, value) in dom::attributes(host) {
        if let Some(bound) = name.strip_prefix(':') {
            let compiled = Compiled::new(&value, &FunctionClosures::new())?;
            let evaluated = compiled.eval(scope).map_err(|e| CompileError::InvalidDirective {
                name: name.clone(),
                reason: e.to_string(),
            })?;
            props.insert(camelize(bound), evaluated);
        } else if AttributeSyntax::parse(&name, &value, prefix).is_none() {
            props.insert(camelize(&name), Value::string(value));
        }
    }
    Ok(props)
}

/// Replace the first `<slot>` below `node` with `slotted`. A slot that
/// receives nothing keeps its fallback children.
fn fill_slots(node: &Handle, slotted: &[Handle], filled: &mut bool) {
    for child in dom::children(node) {
        if dom::tag_name(&child).as_deref() != Some("slot") {
            fill_slots(&child, slotted, filled);
            continue;
        }
        let replacement = if *filled || slotted.is_empty() {
            dom::children(&child)
        } else {
            *filled = true;
            slotted.to_vec()
        };
        let mut cursor = child.clone();
        for item in replacement {
            dom::insert_after(&cursor, &item);
            cursor = item;
        }
        dom::detach(&child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::UpdateQueue;

    fn registry() -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        registry
            .register(
                "x-card",
                "<h2>{{ title }}</h2><div class=body><slot>empty</slot></div>",
                Rc::new(|props: &Props| {
                    let upper = props.get("title").map(|t| t.to_js_string().to_uppercase());
                    vec![("shout".to_string(), Value::string(upper.unwrap_or_default()))]
                }),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_expand_with_slot_and_props() {
        let host = dom::parse_fragment("<x-card title=hi><b>inner</b></x-card>")
            .unwrap()
            .remove(0);
        let scope = Scope::root(UpdateQueue::new(10));
        let instance = registry().expand(&host, &scope, "v-").unwrap().unwrap();
        assert_eq!(instance.get("title").to_js_string(), "hi");
        assert_eq!(instance.get("shout").to_js_string(), "HI");
        assert!(!instance.is_root());
        assert_eq!(
            dom::inner_html(&host),
            "<h2>{{ title }}</h2><div class=\"body\"><b>inner</b></div>"
        );
    }

    #[test]
    fn test_empty_slot_keeps_fallback_and_bound_props() {
        let host = dom::parse_fragment("<x-card :title=\"name + '!'\"></x-card>")
            .unwrap()
            .remove(0);
        let scope = Scope::root(UpdateQueue::new(10));
        scope.define("name", Value::string("n"));
        let instance = registry().expand(&host, &scope, "v-").unwrap().unwrap();
        assert_eq!(instance.get("title").to_js_string(), "n!");
        assert!(dom::inner_html(&host).contains("<div class=\"body\">empty</div>"));
    }

    #[test]
    fn test_unregistered_and_recursive() {
        let scope = Scope::root(UpdateQueue::new(10));
        let plain = dom::create_element("div");
        assert!(registry().expand(&plain, &scope, "v-").unwrap().is_none());

        let nested = dom::parse_fragment("<x-card><x-card></x-card></x-card>")
            .unwrap()
            .remove(0);
        let inner = dom::children(&nested).remove(0);
        assert!(registry().expand(&inner, &scope, "v-").is_err());
    }
}
