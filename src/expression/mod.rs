//! Template expressions: parsing (oxc), static read analysis, and a
//! tree-walking interpreter over binding scopes.

pub mod analyze;
pub mod ast;
pub mod builtins;
pub mod eval;
pub mod lower;

use std::rc::Rc;

pub use analyze::{free_variables, resolve_closures, FunctionClosures};
pub use eval::{call_function, evaluate, get_member, set_member, Lambda};
pub use lower::parse_expression;

use crate::error::{CompileError, EvalResult};
use crate::path::PathSet;
use crate::scope::Scope;
use crate::value::Value;

/// A parsed expression together with the paths it reads.
#[derive(Debug, Clone)]
pub struct Compiled {
    pub source: String,
    pub expr: Rc<ast::Expr>,
    pub reads: PathSet,
}

impl Compiled {
    pub fn new(source: &str, functions: &FunctionClosures) -> Result<Self, CompileError> {
        let expr = parse_expression(source)?;
        let reads = free_variables(&expr, functions);
        Ok(Self {
            source: source.to_string(),
            expr: Rc::new(expr),
            reads,
        })
    }

    pub fn eval(&self, scope: &Scope) -> EvalResult<Value> {
        evaluate(&self.expr, scope)
    }
}
