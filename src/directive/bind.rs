//! Attribute bindings: `:attr`, `v-bind="object"`, `v-text` and `v-show`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use markup5ever_rcdom::Handle;

use super::{Directive, DirectiveSource, DomUpdater, Priority};
use crate::dom;
use crate::error::{CompileError, EvalResult};
use crate::expression::{builtins, Compiled};
use crate::node::RenderNode;
use crate::path::PathSet;
use crate::value::Value;

const BOOLEAN_ATTRIBUTES: &[&str] = &[
    "allowfullscreen",
    "async",
    "autofocus",
    "autoplay",
    "checked",
    "controls",
    "default",
    "defer",
    "disabled",
    "hidden",
    "inert",
    "loop",
    "multiple",
    "muted",
    "novalidate",
    "open",
    "readonly",
    "required",
    "reversed",
    "selected",
];

/// Whitespace-separated class tokens for a string, array or `{ name: cond }`
/// object value.
pub fn class_tokens(value: &Value, out: &mut Vec<String>) {
    match value.unwrapped() {
        Value::Undefined | Value::Null | Value::Bool(false) => {}
        Value::String(s) => out.extend(s.split_whitespace().map(str::to_string)),
        Value::Array(_) => {
            if let Ok(items) = builtins::iterate(value) {
                for item in &items {
                    class_tokens(item, out);
                }
            }
        }
        Value::Object(_) => {
            for (name, enabled) in builtins::entries_of(value) {
                if enabled.is_truthy() {
                    out.extend(name.split_whitespace().map(str::to_string));
                }
            }
        }
        other => out.push(other.to_js_string()),
    }
}

fn kebab_case(name: &str) -> String {
    if name.starts_with("--") {
        return name.to_string();
    }
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            out.push('-');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Split an inline style attribute into `(property, value)` pairs.
pub fn parse_style(style: &str) -> Vec<(String, String)> {
    style
        .split(';')
        .filter_map(|decl| {
            let (property, value) = decl.split_once(':')?;
            let property = property.trim();
            let value = value.trim();
            (!property.is_empty() && !value.is_empty())
                .then(|| (property.to_ascii_lowercase(), value.to_string()))
        })
        .collect()
}

pub fn format_style(declarations: &[(String, String)]) -> String {
    declarations
        .iter()
        .map(|(p, v)| format!("{}: {};", p, v))
        .collect::<Vec<_>>()
        .join(" ")
}

fn put(declarations: &mut Vec<(String, String)>, property: String, value: String) {
    match declarations.iter_mut().find(|(p, _)| *p == property) {
        Some(slot) => slot.1 = value,
        None => declarations.push((property, value)),
    }
}

/// Declarations for a string, array or `{ prop: value }` object value.
pub fn style_declarations(value: &Value, out: &mut Vec<(String, String)>) {
    match value.unwrapped() {
        Value::String(s) => {
            for (p, v) in parse_style(&s) {
                put(out, p, v);
            }
        }
        Value::Array(_) => {
            if let Ok(items) = builtins::iterate(value) {
                for item in &items {
                    style_declarations(item, out);
                }
            }
        }
        Value::Object(_) => {
            for (property, v) in builtins::entries_of(value) {
                if v.is_nullish() || matches!(v, Value::Bool(false)) {
                    continue;
                }
                let text = v.to_js_string();
                if !text.is_empty() {
                    put(out, kebab_case(&property), text);
                }
            }
        }
        _ => {}
    }
}

fn set_or_remove(element: &Handle, name: &str, value: &str) {
    if value.is_empty() {
        dom::remove_attribute(element, name);
    } else {
        dom::set_attribute(element, name, value);
    }
}

/// Write one plain attribute. `false`, `null` and `undefined` remove it.
pub fn apply_attribute(element: &Handle, name: &str, value: &Value) {
    match value.unwrapped() {
        Value::Undefined | Value::Null | Value::Bool(false) => {
            dom::remove_attribute(element, name);
        }
        Value::Bool(true) if BOOLEAN_ATTRIBUTES.contains(&name) => dom::set_attribute(element, name, ""),
        other => dom::set_attribute(element, name, &other.to_display_text()),
    }
}

enum Target {
    Class { fixed: Vec<String> },
    Style { fixed: Vec<(String, String)>, wrote_display: Cell<bool> },
    Attribute(String),
    /// `v-bind="{ ... }"` with no argument.
    Spread { written: RefCell<Vec<String>> },
}

struct AttributeBinding {
    target: Target,
    expr: Compiled,
}

impl DomUpdater for AttributeBinding {
    fn dependencies(&self) -> &PathSet {
        &self.expr.reads
    }

    fn update(&self, node: &Rc<RenderNode>, _forced: bool) -> EvalResult<()> {
        let value = self.expr.eval(node.scope())?;
        let element = node.dom();
        match &self.target {
            Target::Class { fixed } => {
                let mut tokens = fixed.clone();
                let mut bound = Vec::new();
                class_tokens(&value, &mut bound);
                for token in bound {
                    if !tokens.contains(&token) {
                        tokens.push(token);
                    }
                }
                set_or_remove(element, "class", &tokens.join(" "));
            }
            Target::Style { fixed, wrote_display } => {
                let mut bound = Vec::new();
                style_declarations(&value, &mut bound);
                let binds_display = bound.iter().any(|(p, _)| p == "display");
                // A `v-show` on the same element owns `display` while it hides it.
                let hidden = !binds_display
                    && !wrote_display.get()
                    && dom::get_attribute(element, "style")
                        .map(|s| parse_style(&s))
                        .is_some_and(|d| d.iter().any(|(p, v)| p == "display" && v == "none"));
                wrote_display.set(binds_display);

                let mut declarations = fixed.clone();
                for (p, v) in bound {
                    put(&mut declarations, p, v);
                }
                if hidden {
                    put(&mut declarations, "display".to_string(), "none".to_string());
                }
                set_or_remove(element, "style", &format_style(&declarations));
            }
            Target::Attribute(name) => apply_attribute(element, name, &value),
            Target::Spread { written } => {
                let entries = builtins::entries_of(&value);
                let mut now = Vec::new();
                for (name, v) in &entries {
                    let name = kebab_case(name);
                    apply_attribute(element, &name, v);
                    now.push(name);
                }
                for stale in written.borrow().iter().filter(|n| !now.contains(n)) {
                    dom::remove_attribute(element, stale);
                }
                *written.borrow_mut() = now;
            }
        }
        Ok(())
    }
}

pub fn parse_bind(source: &DirectiveSource<'_>) -> Result<Directive, CompileError> {
    let expr = source.compile_value()?;
    let element = source.element;
    let target = match source.syntax.arg.as_deref() {
        None => Target::Spread {
            written: RefCell::new(Vec::new()),
        },
        Some("class") => {
            let mut fixed = Vec::new();
            if let Some(class) = dom::get_attribute(element, "class") {
                fixed.extend(class.split_whitespace().map(str::to_string));
            }
            Target::Class { fixed }
        }
        Some("style") => Target::Style {
            fixed: dom::get_attribute(element, "style")
                .map(|s| parse_style(&s))
                .unwrap_or_default(),
            wrote_display: Cell::new(false),
        },
        Some(name) if name.is_empty() => return Err(source.invalid("missing attribute name")),
        Some(name) => Target::Attribute(name.to_string()),
    };
    Ok(Directive::new("bind").with_updater(Rc::new(AttributeBinding { target, expr })))
}

struct TextBinding {
    expr: Compiled,
}

impl DomUpdater for TextBinding {
    fn dependencies(&self) -> &PathSet {
        &self.expr.reads
    }

    fn update(&self, node: &Rc<RenderNode>, _forced: bool) -> EvalResult<()> {
        let value = self.expr.eval(node.scope())?;
        dom::set_text_content(node.dom(), &value.to_display_text());
        Ok(())
    }
}

pub fn parse_text(source: &DirectiveSource<'_>) -> Result<Directive, CompileError> {
    let expr = source.compile_value()?;
    Ok(Directive::new("text").with_updater(Rc::new(TextBinding { expr })))
}

struct ShowBinding {
    expr: Compiled,
    /// The element's own `display`, restored when shown.
    display: Option<String>,
}

impl DomUpdater for ShowBinding {
    fn dependencies(&self) -> &PathSet {
        &self.expr.reads
    }

    fn update(&self, node: &Rc<RenderNode>, _forced: bool) -> EvalResult<()> {
        let visible = self.expr.eval(node.scope())?.is_truthy();
        let element = node.dom();
        let mut declarations: Vec<(String, String)> = dom::get_attribute(element, "style")
            .map(|s| parse_style(&s))
            .unwrap_or_default()
            .into_iter()
            .filter(|(p, _)| p != "display")
            .collect();
        match (visible, &self.display) {
            (false, _) => declarations.push(("display".to_string(), "none".to_string())),
            (true, Some(display)) => declarations.push(("display".to_string(), display.clone())),
            (true, None) => {}
        }
        set_or_remove(element, "style", &format_style(&declarations));
        Ok(())
    }
}

pub fn parse_show(source: &DirectiveSource<'_>) -> Result<Directive, CompileError> {
    let expr = source.compile_value()?;
    let display = dom::get_attribute(source.element, "style").and_then(|s| {
        parse_style(&s)
            .into_iter()
            .find(|(p, v)| p == "display" && v != "none")
            .map(|(_, v)| v)
    });
    Ok(Directive::new("show")
        .with_priority(Priority::Conditional)
        .with_updater(Rc::new(ShowBinding { expr, display })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn classes(value: serde_json::Value) -> Vec<String> {
        let mut out = Vec::new();
        class_tokens(&Value::from(value), &mut out);
        out
    }

    #[test]
    fn test_class_forms() {
        assert_eq!(classes(json!("a  b")), vec!["a", "b"]);
        assert_eq!(classes(json!({"done": true, "late": false, "x y": 1})), vec!["done", "x", "y"]);
        assert_eq!(classes(json!(["a", {"b": true}, null, ["c"]])), vec!["a", "b", "c"]);
        assert!(classes(json!(null)).is_empty());
    }

    #[test]
    fn test_style_forms() {
        let mut out = parse_style("color: red; margin:0");
        style_declarations(
            &Value::from(json!({"fontSize": "12px", "color": "blue", "hidden": null})),
            &mut out,
        );
        assert_eq!(format_style(&out), "color: blue; margin: 0; font-size: 12px;");
        let mut vars = Vec::new();
        style_declarations(&Value::from(json!({"--gap": "4px"})), &mut vars);
        assert_eq!(vars, vec![("--gap".to_string(), "4px".to_string())]);
    }

    #[test]
    fn test_plain_attribute_values() {
        let input = dom::create_element("input");
        apply_attribute(&input, "disabled", &Value::Bool(true));
        assert_eq!(dom::get_attribute(&input, "disabled").as_deref(), Some(""));
        apply_attribute(&input, "disabled", &Value::Bool(false));
        assert!(!dom::has_attribute(&input, "disabled"));
        apply_attribute(&input, "aria-busy", &Value::Bool(true));
        assert_eq!(dom::get_attribute(&input, "aria-busy").as_deref(), Some("true"));
        apply_attribute(&input, "size", &Value::from(3));
        assert_eq!(dom::get_attribute(&input, "size").as_deref(), Some("3"));
        apply_attribute(&input, "size", &Value::Null);
        assert!(!dom::has_attribute(&input, "size"));
    }
}
