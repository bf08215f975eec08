//! Lifecycle bindings: `v-mount`, `v-mounted`, `v-update`, `v-updated`,
//! `v-unmount`, `v-unmounted`. A binding that evaluates to a function is
//! called with a snapshot of the element.

use std::rc::Rc;

use super::{Directive, DirectiveSource, HookKind};
use crate::error::{CompileError, EvalResult};
use crate::events::element_value;
use crate::expression::call_function;
use crate::node::RenderNode;
use crate::value::Value;

pub fn parse_hook(source: &DirectiveSource<'_>) -> Result<Directive, CompileError> {
    let kind = HookKind::from_name(&source.syntax.name)
        .ok_or_else(|| source.invalid("not a lifecycle hook"))?;
    let expr = source.compile_value()?;
    let hook = Rc::new(move |node: &Rc<RenderNode>| -> EvalResult<()> {
        let result = expr.eval(node.scope())?;
        if matches!(result, Value::Function(_)) {
            call_function(&result, &[element_value(node.dom())])?;
        }
        Ok(())
    });
    Ok(Directive::new(source.syntax.name.clone()).with_hook(kind, hook))
}
