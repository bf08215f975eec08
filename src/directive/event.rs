//! `@event` / `v-on:event` handlers.

use std::cell::Cell;
use std::rc::Rc;

use super::{Directive, DirectiveSource, DomUpdater};
use crate::error::{CompileError, EvalResult};
use crate::events::{Event, Handler, ListenerOptions};
use crate::expression::ast::Expr;
use crate::expression::{call_function, Compiled};
use crate::node::RenderNode;
use crate::path::PathSet;
use crate::value::Value;

fn listener_options(source: &DirectiveSource<'_>) -> Result<ListenerOptions, CompileError> {
    let mut options = ListenerOptions::default();
    for modifier in &source.syntax.modifiers {
        match modifier.as_str() {
            "stop" => options.stop = true,
            "prevent" => options.prevent = true,
            "capture" => options.capture = true,
            "once" => options.once = true,
            "self" => options.self_only = true,
            "passive" => {}
            other => match ListenerOptions::key_values(other) {
                Some(keys) => options.keys.extend(keys.iter().map(|k| k.to_string())),
                None => return Err(source.invalid(format!("unknown modifier `.{}`", other))),
            },
        }
    }
    Ok(options)
}

struct EventBinding {
    kind: String,
    options: ListenerOptions,
    handler: Option<Compiled>,
    /// The expression names a function (`save`, `form.submit`, `e => ...`)
    /// to be called with `$event`, rather than being a statement.
    calls_result: bool,
    listener: Cell<Option<u64>>,
    none: PathSet,
}

impl DomUpdater for EventBinding {
    fn dependencies(&self) -> &PathSet {
        &self.none
    }

    fn attach(&self, node: &Rc<RenderNode>) -> Result<(), CompileError> {
        let weak = Rc::downgrade(node);
        let expr = self.handler.clone();
        let calls_result = self.calls_result;
        let handler: Handler = Rc::new(move |event: &Rc<Event>| -> EvalResult<()> {
            let Some(node) = weak.upgrade().filter(|n| !n.is_destroyed()) else {
                return Ok(());
            };
            let Some(expr) = &expr else {
                return Ok(());
            };
            let event_value = event.to_value();
            let frame = node.scope().frame();
            frame.define("$event", event_value.clone());
            let result = expr.eval(&frame)?;
            if calls_result && matches!(result, Value::Function(_)) {
                call_function(&result, &[event_value])?;
            }
            Ok(())
        });
        let id = node
            .runtime()
            .events()
            .add(node.dom(), &self.kind, self.options.clone(), handler);
        self.listener.set(Some(id));
        Ok(())
    }

    fn update(&self, _node: &Rc<RenderNode>, _forced: bool) -> EvalResult<()> {
        Ok(())
    }

    fn destroy(&self, node: &Rc<RenderNode>) -> EvalResult<()> {
        if let Some(id) = self.listener.take() {
            node.runtime().events().remove(node.dom(), id);
        }
        Ok(())
    }
}

pub fn parse_on(source: &DirectiveSource<'_>) -> Result<Directive, CompileError> {
    let kind = match source.syntax.arg.as_deref() {
        Some(kind) if !kind.is_empty() => kind.to_string(),
        _ => return Err(source.invalid("missing event name")),
    };
    let options = listener_options(source)?;
    // `@submit.prevent` with no handler is allowed.
    let handler = if source.syntax.value.trim().is_empty() {
        None
    } else {
        Some(source.compile_value()?)
    };
    let calls_result = handler.as_ref().is_some_and(|h| {
        matches!(
            h.expr.as_ref(),
            Expr::Identifier(_) | Expr::Member { .. } | Expr::Arrow(_)
        )
    });
    Ok(Directive::new("on").with_updater(Rc::new(EventBinding {
        kind,
        options,
        handler,
        calls_result,
        listener: Cell::new(None),
        none: PathSet::new(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::AttributeSyntax;
    use crate::dom;
    use crate::error::ERR_INVALID_DIRECTIVE;
    use crate::expression::FunctionClosures;

    fn options(attribute: &str) -> Result<ListenerOptions, CompileError> {
        let element = dom::create_element("button");
        let syntax = AttributeSyntax::parse(attribute, "go()", "v-").unwrap();
        let functions = FunctionClosures::new();
        listener_options(&DirectiveSource {
            element: &element,
            syntax: &syntax,
            functions: &functions,
        })
    }

    #[test]
    fn test_modifiers_map_to_options() {
        let o = options("@keyup.enter.stop.once").unwrap();
        assert!(o.stop && o.once && !o.capture);
        assert_eq!(o.keys, vec!["Enter"]);
        let o = options("v-on:click.capture.self.prevent").unwrap();
        assert!(o.capture && o.self_only && o.prevent);
        assert_eq!(options("@click.sideways").unwrap_err().code(), ERR_INVALID_DIRECTIVE);
    }

    #[test]
    fn test_handler_is_optional() {
        let element = dom::create_element("form");
        let syntax = AttributeSyntax::parse("@submit.prevent", "", "v-").unwrap();
        let functions = FunctionClosures::new();
        let directive = parse_on(&DirectiveSource {
            element: &element,
            syntax: &syntax,
            functions: &functions,
        })
        .unwrap();
        assert!(directive.dependent_identifiers().is_empty());
    }
}
