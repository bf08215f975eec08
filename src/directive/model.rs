//! `v-model`: two-way binding between form controls and state.

use std::cell::Cell;
use std::rc::Rc;

use markup5ever_rcdom::Handle;

use super::{Directive, DirectiveSource, DomUpdater};
use crate::error::{CompileError, EvalResult};
use crate::events::{Event, Handler, ListenerOptions};
use crate::expression::{builtins, Compiled};
use crate::node::RenderNode;
use crate::path::PathSet;
use crate::value::Value;
use crate::dom;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Text,
    TextArea,
    Checkbox,
    Radio,
    Select,
}

impl ControlKind {
    pub fn of(element: &Handle) -> Option<Self> {
        match dom::tag_name(element)?.as_str() {
            "input" => Some(
                match dom::get_attribute(element, "type")
                    .unwrap_or_default()
                    .to_ascii_lowercase()
                    .as_str()
                {
                    "checkbox" => Self::Checkbox,
                    "radio" => Self::Radio,
                    _ => Self::Text,
                },
            ),
            "textarea" => Some(Self::TextArea),
            "select" => Some(Self::Select),
            _ => None,
        }
    }
}

/// `value` attribute, falling back to text content (as `<option>` does).
fn control_value(element: &Handle) -> String {
    dom::get_attribute(element, "value").unwrap_or_else(|| dom::text_content(element).trim().to_string())
}

fn options_of(element: &Handle, out: &mut Vec<Handle>) {
    for child in dom::children(element) {
        if dom::tag_name(&child).as_deref() == Some("option") {
            out.push(child);
        } else if dom::is_element(&child) {
            options_of(&child, out);
        }
    }
}

fn set_flag(element: &Handle, name: &str, on: bool) {
    if on {
        dom::set_attribute(element, name, "");
    } else {
        dom::remove_attribute(element, name);
    }
}

/// Numeric coercion in the manner of `parseFloat`: unparsable input is kept
/// as a string.
fn to_number(text: &str) -> Value {
    let trimmed = text.trim();
    let end = trimmed
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || *c == '.' || ((*c == '-' || *c == '+') && *i == 0))
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    match trimmed[..end].parse::<f64>() {
        Ok(n) => Value::Number(n),
        Err(_) => Value::string(text),
    }
}

struct ModelBinding {
    kind: ControlKind,
    expr: Compiled,
    assign: Compiled,
    lazy: bool,
    number: bool,
    trim: bool,
    listener: Cell<Option<u64>>,
}

impl ModelBinding {
    fn event_name(&self) -> &'static str {
        match self.kind {
            ControlKind::Checkbox | ControlKind::Radio | ControlKind::Select => "change",
            _ if self.lazy => "change",
            _ => "input",
        }
    }

    fn coerce(&self, text: String) -> Value {
        let text = if self.trim { text.trim().to_string() } else { text };
        if self.number {
            to_number(&text)
        } else {
            Value::string(text)
        }
    }

    /// The value the control currently holds, as the model should see it.
    fn read(&self, element: &Handle, current: &Value) -> EvalResult<Value> {
        Ok(match self.kind {
            ControlKind::Text => self.coerce(dom::get_attribute(element, "value").unwrap_or_default()),
            ControlKind::TextArea => self.coerce(dom::text_content(element)),
            ControlKind::Radio => self.coerce(control_value(element)),
            ControlKind::Select => {
                let chosen = dom::get_attribute(element, "value").unwrap_or_else(|| {
                    let mut options = Vec::new();
                    options_of(element, &mut options);
                    options
                        .iter()
                        .find(|o| dom::has_attribute(o, "selected"))
                        .map(control_value)
                        .unwrap_or_default()
                });
                self.coerce(chosen)
            }
            ControlKind::Checkbox => {
                let checked = dom::has_attribute(element, "checked");
                if !matches!(current.unwrapped(), Value::Array(_)) {
                    return Ok(Value::Bool(checked));
                }
                let own = self.coerce(control_value(element));
                let mut items: Vec<Value> = builtins::iterate(current)?
                    .into_iter()
                    .filter(|v| !v.loose_eq(&own))
                    .collect();
                if checked {
                    items.push(own);
                }
                Value::array(items)
            }
        })
    }
}

impl DomUpdater for ModelBinding {
    fn dependencies(&self) -> &PathSet {
        &self.expr.reads
    }

    fn attach(&self, node: &Rc<RenderNode>) -> Result<(), CompileError> {
        let weak = Rc::downgrade(node);
        let binding = ModelBinding {
            kind: self.kind,
            expr: self.expr.clone(),
            assign: self.assign.clone(),
            lazy: self.lazy,
            number: self.number,
            trim: self.trim,
            listener: Cell::new(None),
        };
        let handler: Handler = Rc::new(move |event: &Rc<Event>| -> EvalResult<()> {
            let Some(node) = weak.upgrade().filter(|n| !n.is_destroyed()) else {
                return Ok(());
            };
            let current = binding.expr.eval(node.scope())?;
            let value = binding.read(event.target(), &current)?;
            let frame = node.scope().frame();
            frame.define("$value", value);
            binding.assign.eval(&frame)?;
            Ok(())
        });
        let id = node
            .runtime()
            .events()
            .add(node.dom(), self.event_name(), ListenerOptions::default(), handler);
        self.listener.set(Some(id));
        Ok(())
    }

    fn update(&self, node: &Rc<RenderNode>, _forced: bool) -> EvalResult<()> {
        let value = self.expr.eval(node.scope())?;
        let element = node.dom();
        match self.kind {
            ControlKind::Text => dom::set_attribute(element, "value", &value.to_display_text()),
            ControlKind::TextArea => dom::set_text_content(element, &value.to_display_text()),
            ControlKind::Checkbox => {
                let checked = match value.unwrapped() {
                    Value::Array(_) => {
                        let own = self.coerce(control_value(element));
                        builtins::iterate(&value)?.iter().any(|v| v.loose_eq(&own))
                    }
                    other => other.is_truthy(),
                };
                set_flag(element, "checked", checked);
            }
            ControlKind::Radio => {
                let own = self.coerce(control_value(element));
                set_flag(element, "checked", own.loose_eq(&value.unwrapped()));
            }
            ControlKind::Select => {
                let wanted = value.to_display_text();
                let mut options = Vec::new();
                options_of(element, &mut options);
                for option in &options {
                    set_flag(option, "selected", control_value(option) == wanted);
                }
                dom::remove_attribute(element, "value");
            }
        }
        Ok(())
    }

    fn destroy(&self, node: &Rc<RenderNode>) -> EvalResult<()> {
        if let Some(id) = self.listener.take() {
            node.runtime().events().remove(node.dom(), id);
        }
        Ok(())
    }
}

pub fn parse_model(source: &DirectiveSource<'_>) -> Result<Directive, CompileError> {
    let kind = ControlKind::of(source.element)
        .ok_or_else(|| source.invalid("v-model needs an input, textarea or select"))?;
    let expr = source.compile_value()?;
    let assign = source
        .compile(&format!("{} = $value", source.syntax.value.trim()))
        .map_err(|_| source.invalid(format!("`{}` is not assignable", source.syntax.value.trim())))?;
    Ok(Directive::new("model").with_updater(Rc::new(ModelBinding {
        kind,
        expr,
        assign,
        lazy: source.syntax.has_modifier("lazy"),
        number: source.syntax.has_modifier("number"),
        trim: source.syntax.has_modifier("trim"),
        listener: Cell::new(None),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::AttributeSyntax;
    use crate::error::ERR_INVALID_DIRECTIVE;
    use crate::expression::FunctionClosures;

    fn model(html: &str, attribute: &str, value: &str) -> Result<Directive, CompileError> {
        let element = dom::parse_fragment(html).unwrap().remove(0);
        let syntax = AttributeSyntax::parse(attribute, value, "v-").unwrap();
        let functions = FunctionClosures::new();
        parse_model(&DirectiveSource {
            element: &element,
            syntax: &syntax,
            functions: &functions,
        })
    }

    #[test]
    fn test_control_kinds() {
        let kind = |html: &str| ControlKind::of(&dom::parse_fragment(html).unwrap().remove(0));
        assert_eq!(kind("<input>"), Some(ControlKind::Text));
        assert_eq!(kind("<input type=CHECKBOX>"), Some(ControlKind::Checkbox));
        assert_eq!(kind("<input type=radio>"), Some(ControlKind::Radio));
        assert_eq!(kind("<select></select>"), Some(ControlKind::Select));
        assert_eq!(kind("<div></div>"), None);
    }

    #[test]
    fn test_rejects_non_controls_and_non_assignable() {
        assert_eq!(model("<div></div>", "v-model", "x").unwrap_err().code(), ERR_INVALID_DIRECTIVE);
        assert_eq!(model("<input>", "v-model", "a + b").unwrap_err().code(), ERR_INVALID_DIRECTIVE);
        assert!(model("<input>", "v-model.lazy.trim", "form.name").is_ok());
    }

    #[test]
    fn test_number_coercion() {
        assert_eq!(to_number(" 42px").to_number(), 42.0);
        assert_eq!(to_number("-1.5").to_number(), -1.5);
        assert!(matches!(to_number("abc"), Value::String(_)));
    }
}
