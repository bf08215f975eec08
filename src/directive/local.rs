//! `v-let:name="expr"` and `v-let="{ a: expr, b: expr }"`: local bindings for
//! an element's subtree.

use super::{BindingsPreparer, Directive, DirectiveSource};
use crate::error::{CompileError, EvalResult};
use crate::expression::ast::{Expr, Property, PropertyName};
use crate::expression::{builtins, Compiled};
use crate::path::PathSet;
use crate::scope::Scope;
use crate::value::Value;

/// `full-name` -> `fullName`. Attribute names arrive lower-cased.
pub fn camelize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '-' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

struct LetBindings {
    /// `None` for the object form, whose keys are `names`.
    name: Option<String>,
    names: Vec<String>,
    expr: Compiled,
}

impl BindingsPreparer for LetBindings {
    fn dependencies(&self) -> &PathSet {
        &self.expr.reads
    }

    fn supplies(&self) -> Vec<String> {
        self.names.clone()
    }

    fn prepare(&self, scope: &Scope) -> EvalResult<Vec<(String, Value)>> {
        let value = self.expr.eval(scope)?;
        if let Some(name) = &self.name {
            return Ok(vec![(name.clone(), value)]);
        }
        let entries = builtins::entries_of(&value);
        Ok(self
            .names
            .iter()
            .map(|name| {
                let v = entries
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default();
                (name.clone(), v)
            })
            .collect())
    }
}

pub fn parse_let(source: &DirectiveSource<'_>) -> Result<Directive, CompileError> {
    let expr = source.compile_value()?;
    let (name, names) = match source.syntax.arg.as_deref() {
        Some(arg) => {
            let name = camelize(arg);
            (Some(name.clone()), vec![name])
        }
        None => {
            let Expr::Object(properties) = expr.expr.as_ref() else {
                return Err(source.invalid("expected `v-let:name` or an object literal"));
            };
            let mut names = Vec::new();
            for property in properties {
                match property {
                    Property::Entry {
                        key: PropertyName::Static(key),
                        ..
                    } => names.push(key.clone()),
                    _ => return Err(source.invalid("object keys must be static")),
                }
            }
            (None, names)
        }
    };
    Ok(Directive::new("let").with_preparer(Box::new(LetBindings { name, names, expr })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::AttributeSyntax;
    use crate::dom;
    use crate::expression::FunctionClosures;
    use crate::scheduler::UpdateQueue;
    use serde_json::json;

    fn directive(attribute: &str, value: &str) -> Result<Directive, CompileError> {
        let element = dom::create_element("div");
        let syntax = AttributeSyntax::parse(attribute, value, "v-").unwrap();
        let functions = FunctionClosures::new();
        parse_let(&DirectiveSource {
            element: &element,
            syntax: &syntax,
            functions: &functions,
        })
    }

    #[test]
    fn test_named_binding() {
        let d = directive("v-let:full-name", "first + ' ' + last").unwrap();
        assert!(d.supplies.contains("fullName"));
        let scope = Scope::root(UpdateQueue::new(10));
        scope.define("first", Value::string("Ada"));
        scope.define("last", Value::string("L"));
        let bindings = d.preparer.as_ref().unwrap().prepare(&scope).unwrap();
        assert_eq!(bindings[0].0, "fullName");
        assert_eq!(bindings[0].1.to_js_string(), "Ada L");
        assert!(d.dependent_identifiers().contains("first"));
    }

    #[test]
    fn test_object_form() {
        let d = directive("v-let", "{ total: items.length, first: items[0] }").unwrap();
        let scope = Scope::root(UpdateQueue::new(10));
        scope.define("items", Value::from(json!([4, 5])));
        let bindings = d.preparer.as_ref().unwrap().prepare(&scope).unwrap();
        let names: Vec<&str> = bindings.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["total", "first"]);
        assert_eq!(bindings[0].1.to_number(), 2.0);
        assert!(directive("v-let", "items").is_err());
    }
}
