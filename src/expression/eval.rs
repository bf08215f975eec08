//! Tree-walking interpreter over a [`Scope`].

use std::rc::Rc;

use super::ast::*;
use super::builtins;
use crate::error::{EvalError, EvalResult};
use crate::reactive::parse_index;
use crate::scope::Scope;
use crate::value::{format_number, Function, Value};

/// Arrow function closed over the scope it was evaluated in.
pub struct Lambda {
    pub(crate) arrow: Rc<Arrow>,
    pub(crate) env: Scope,
}

enum Flow {
    Normal,
    Return(Value),
}

pub fn evaluate(expr: &Expr, scope: &Scope) -> EvalResult<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Identifier(name) => Ok(lookup(name, scope)),
        Expr::Template {
            quasis,
            expressions,
        } => {
            let mut out = String::new();
            for (i, quasi) in quasis.iter().enumerate() {
                out.push_str(quasi);
                if let Some(e) = expressions.get(i) {
                    out.push_str(&evaluate(e, scope)?.to_js_string());
                }
            }
            Ok(Value::string(out))
        }
        Expr::Array(elements) => {
            let mut items = Vec::with_capacity(elements.len());
            for element in elements {
                match element {
                    Element::Item(e) => items.push(evaluate(e, scope)?.unwrapped()),
                    Element::Spread(e) => {
                        let spread = evaluate(e, scope)?;
                        items.extend(builtins::iterate(&spread)?.iter().map(Value::unwrapped));
                    }
                    Element::Hole => items.push(Value::Undefined),
                }
            }
            Ok(Value::array(items))
        }
        Expr::Object(properties) => {
            let mut entries: Vec<(String, Value)> = Vec::with_capacity(properties.len());
            let mut put = |key: String, value: Value| match entries.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = value,
                None => entries.push((key, value)),
            };
            for property in properties {
                match property {
                    Property::Entry { key, value } => {
                        let key = match key {
                            PropertyName::Static(name) => name.clone(),
                            PropertyName::Computed(e) => property_key(&evaluate(e, scope)?),
                        };
                        put(key, evaluate(value, scope)?.unwrapped());
                    }
                    Property::Spread(e) => {
                        let source = evaluate(e, scope)?;
                        for (k, v) in builtins::entries_of(&source) {
                            put(k, v.unwrapped());
                        }
                    }
                }
            }
            Ok(Value::object(entries))
        }
        Expr::Member { .. } | Expr::Call { .. } => Ok(evaluate_chain(expr, scope)?.unwrap_or_default()),
        Expr::New {
            constructor,
            arguments,
        } => {
            let args = evaluate_arguments(arguments, scope)?;
            builtins::construct(constructor, &args)
        }
        Expr::Unary { op, argument } => {
            let value = evaluate(argument, scope)?;
            Ok(match op {
                UnaryOp::Neg => Value::Number(-value.to_number()),
                UnaryOp::Plus => Value::Number(value.to_number()),
                UnaryOp::Not => Value::Bool(!value.is_truthy()),
                UnaryOp::BitNot => Value::Number(!to_int32(value.to_number()) as f64),
                UnaryOp::TypeOf => Value::string(value.type_of()),
                UnaryOp::Void => Value::Undefined,
            })
        }
        Expr::Delete(target) => match target.as_ref() {
            Target::Identifier(_) => Ok(Value::Bool(false)),
            Target::Member { object, property } => {
                let object = evaluate(object, scope)?;
                let key = member_key(property, scope)?;
                delete_member(&object, &key).map(Value::Bool)
            }
        },
        Expr::Binary { op, left, right } => {
            let left = evaluate(left, scope)?;
            let right = evaluate(right, scope)?;
            binary(*op, &left, &right)
        }
        Expr::Logical { op, left, right } => {
            let left = evaluate(left, scope)?;
            let short_circuits = match op {
                LogicalOp::And => !left.is_truthy(),
                LogicalOp::Or => left.is_truthy(),
                LogicalOp::Coalesce => !left.is_nullish(),
            };
            if short_circuits {
                Ok(left)
            } else {
                evaluate(right, scope)
            }
        }
        Expr::Conditional {
            test,
            consequent,
            alternate,
        } => {
            if evaluate(test, scope)?.is_truthy() {
                evaluate(consequent, scope)
            } else {
                evaluate(alternate, scope)
            }
        }
        Expr::Assign { op, target, value } => assign(*op, target, value, scope),
        Expr::Update {
            increment,
            prefix,
            target,
        } => {
            let old = read_target(target, scope)?.to_number();
            let new = if *increment { old + 1.0 } else { old - 1.0 };
            write_target(target, Value::Number(new), scope)?;
            Ok(Value::Number(if *prefix { new } else { old }))
        }
        Expr::Sequence(items) => {
            let mut last = Value::Undefined;
            for item in items {
                last = evaluate(item, scope)?;
            }
            Ok(last)
        }
        Expr::Arrow(arrow) => Ok(Value::Function(Function::Lambda(Rc::new(Lambda {
            arrow: arrow.clone(),
            env: scope.clone(),
        })))),
    }
}

fn lookup(name: &str, scope: &Scope) -> Value {
    if scope.has(name, true) {
        return scope.get(name);
    }
    builtins::global(name).unwrap_or_default()
}

/// Member and call evaluation with optional-chain short-circuiting: `None`
/// means an optional link met a nullish value and the whole chain yields
/// undefined.
fn evaluate_chain(expr: &Expr, scope: &Scope) -> EvalResult<Option<Value>> {
    match expr {
        Expr::Member {
            object,
            property,
            optional,
        } => {
            let Some(object) = evaluate_chain(object, scope)? else {
                return Ok(None);
            };
            if *optional && object.is_nullish() {
                return Ok(None);
            }
            let key = member_key(property, scope)?;
            get_member(&object, &key).map(Some)
        }
        Expr::Call {
            callee,
            arguments,
            optional,
        } => {
            let Some(function) = evaluate_chain(callee, scope)? else {
                return Ok(None);
            };
            if *optional && function.is_nullish() {
                return Ok(None);
            }
            if !matches!(function, Value::Function(_)) {
                return Err(EvalError::NotCallable(describe(callee)));
            }
            let args = evaluate_arguments(arguments, scope)?;
            call_function(&function, &args).map(Some)
        }
        other => evaluate(other, scope).map(Some),
    }
}

fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(name) => name.clone(),
        Expr::Member {
            object,
            property: MemberKey::Static(name),
            ..
        } => format!("{}.{}", describe(object), name),
        Expr::Member { object, .. } => format!("{}[...]", describe(object)),
        _ => "expression".to_string(),
    }
}

fn evaluate_arguments(arguments: &[Element], scope: &Scope) -> EvalResult<Vec<Value>> {
    let mut args = Vec::with_capacity(arguments.len());
    for argument in arguments {
        match argument {
            Element::Item(e) => args.push(evaluate(e, scope)?),
            Element::Spread(e) => args.extend(builtins::iterate(&evaluate(e, scope)?)?),
            Element::Hole => args.push(Value::Undefined),
        }
    }
    Ok(args)
}

fn member_key(property: &MemberKey, scope: &Scope) -> EvalResult<Value> {
    Ok(match property {
        MemberKey::Static(name) => Value::string(name),
        MemberKey::Computed(e) => evaluate(e, scope)?,
    })
}

/// Property name of a computed key.
pub fn property_key(key: &Value) -> String {
    match key.unwrapped() {
        Value::Number(n) => format_number(n),
        other => other.to_js_string(),
    }
}

pub fn get_member(object: &Value, key: &Value) -> EvalResult<Value> {
    let name = property_key(key);
    match object {
        Value::Undefined | Value::Null => Err(EvalError::Type(format!(
            "cannot read properties of {} (reading '{}')",
            object.type_of(),
            name
        ))),
        Value::Reactive(r) => {
            let own = r.get(&name);
            if !matches!(own, Value::Undefined) {
                return Ok(own);
            }
            Ok(builtins::method(object, &name).unwrap_or_default())
        }
        Value::Object(record) => Ok(record.borrow().get(&name).cloned().unwrap_or_default()),
        Value::Array(items) => {
            if name == "length" {
                return Ok(Value::from(items.borrow().len()));
            }
            if let Some(i) = parse_index(&name) {
                return Ok(items.borrow().get(i).cloned().unwrap_or_default());
            }
            Ok(builtins::method(object, &name).unwrap_or_default())
        }
        Value::String(s) => {
            if name == "length" {
                return Ok(Value::from(s.chars().count()));
            }
            if let Some(i) = parse_index(&name) {
                return Ok(s
                    .chars()
                    .nth(i)
                    .map(|c| Value::string(c.to_string()))
                    .unwrap_or_default());
            }
            Ok(builtins::method(object, &name).unwrap_or_default())
        }
        Value::Map(entries) if name == "size" => Ok(Value::from(entries.borrow().len())),
        Value::Set(items) if name == "size" => Ok(Value::from(items.borrow().len())),
        Value::RegExp(re) if name == "source" => Ok(Value::string(re.as_str())),
        Value::Error(message) if name == "message" => Ok(Value::String(message.clone())),
        Value::Function(Function::Native { name: owner, .. }) => {
            Ok(builtins::static_member(owner, &name))
        }
        other => Ok(builtins::method(other, &name).unwrap_or_default()),
    }
}

pub fn set_member(object: &Value, key: &Value, value: Value) -> EvalResult<()> {
    let name = property_key(key);
    match object {
        Value::Reactive(r) => r.set(&name, value),
        Value::Object(record) => {
            record.borrow_mut().insert(name, value.unwrapped());
            Ok(())
        }
        Value::Array(items) => {
            let index = parse_index(&name)
                .ok_or_else(|| EvalError::InvalidAssignment(format!("array index `{}`", name)))?;
            let mut items = items.borrow_mut();
            if index >= items.len() {
                items.resize(index + 1, Value::Undefined);
            }
            items[index] = value.unwrapped();
            Ok(())
        }
        other => Err(EvalError::InvalidAssignment(format!(
            "cannot set `{}` on {}",
            name,
            other.type_of()
        ))),
    }
}

fn delete_member(object: &Value, key: &Value) -> EvalResult<bool> {
    let name = property_key(key);
    match object {
        Value::Reactive(r) => Ok(r.delete(&name)),
        Value::Object(record) => Ok(record.borrow_mut().shift_remove(&name).is_some()),
        Value::Undefined | Value::Null => Err(EvalError::Type(format!(
            "cannot delete '{}' of {}",
            name,
            object.type_of()
        ))),
        _ => Ok(false),
    }
}

fn read_target(target: &Target, scope: &Scope) -> EvalResult<Value> {
    match target {
        Target::Identifier(name) => Ok(lookup(name, scope)),
        Target::Member { object, property } => {
            let object = evaluate(object, scope)?;
            let key = member_key(property, scope)?;
            get_member(&object, &key)
        }
    }
}

fn write_target(target: &Target, value: Value, scope: &Scope) -> EvalResult<()> {
    match target {
        Target::Identifier(name) => {
            scope.set(name, value);
            Ok(())
        }
        Target::Member { object, property } => {
            let object = evaluate(object, scope)?;
            let key = member_key(property, scope)?;
            set_member(&object, &key, value)
        }
    }
}

fn assign(op: AssignOp, target: &Target, value: &Expr, scope: &Scope) -> EvalResult<Value> {
    let result = match op {
        AssignOp::Assign => evaluate(value, scope)?,
        AssignOp::Compound(op) => {
            let current = read_target(target, scope)?;
            binary(op, &current, &evaluate(value, scope)?)?
        }
        AssignOp::Logical(op) => {
            let current = read_target(target, scope)?;
            let keep = match op {
                LogicalOp::And => !current.is_truthy(),
                LogicalOp::Or => current.is_truthy(),
                LogicalOp::Coalesce => !current.is_nullish(),
            };
            if keep {
                return Ok(current);
            }
            evaluate(value, scope)?
        }
    };
    write_target(target, result.clone(), scope)?;
    Ok(result)
}

fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    (n.trunc() as i64 & 0xFFFF_FFFF) as u32 as i32
}

/// Primitive form of an operand of `+` and the relational operators.
fn to_primitive(value: &Value) -> Value {
    match value.unwrapped() {
        v @ (Value::Array(_) | Value::Object(_) | Value::Map(_) | Value::Set(_) | Value::Function(_)) => {
            Value::string(v.to_js_string())
        }
        other => other,
    }
}

pub fn binary(op: BinaryOp, left: &Value, right: &Value) -> EvalResult<Value> {
    let num = |f: fn(f64, f64) -> f64| Value::Number(f(left.to_number(), right.to_number()));
    let int = |f: fn(i32, i32) -> i32| {
        Value::Number(f(to_int32(left.to_number()), to_int32(right.to_number())) as f64)
    };
    Ok(match op {
        BinaryOp::Add => {
            let (l, r) = (to_primitive(left), to_primitive(right));
            if matches!(l, Value::String(_)) || matches!(r, Value::String(_)) {
                Value::string(format!("{}{}", l.to_js_string(), r.to_js_string()))
            } else {
                Value::Number(l.to_number() + r.to_number())
            }
        }
        BinaryOp::Sub => num(|a, b| a - b),
        BinaryOp::Mul => num(|a, b| a * b),
        BinaryOp::Div => num(|a, b| a / b),
        BinaryOp::Rem => num(|a, b| a % b),
        BinaryOp::Pow => num(f64::powf),
        BinaryOp::Eq => Value::Bool(left.loose_eq(right)),
        BinaryOp::NotEq => Value::Bool(!left.loose_eq(right)),
        BinaryOp::StrictEq => Value::Bool(left.strict_eq(right)),
        BinaryOp::StrictNotEq => Value::Bool(!left.strict_eq(right)),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let (l, r) = (to_primitive(left), to_primitive(right));
            let ordering = match (&l, &r) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => l.to_number().partial_cmp(&r.to_number()),
            };
            Value::Bool(match ordering {
                None => false,
                Some(ordering) => match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::LtEq => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                },
            })
        }
        BinaryOp::BitAnd => int(|a, b| a & b),
        BinaryOp::BitOr => int(|a, b| a | b),
        BinaryOp::BitXor => int(|a, b| a ^ b),
        BinaryOp::Shl => int(|a, b| a.wrapping_shl(b as u32 & 31)),
        BinaryOp::Shr => int(|a, b| a.wrapping_shr(b as u32 & 31)),
        BinaryOp::UShr => {
            let a = to_int32(left.to_number()) as u32;
            let b = to_int32(right.to_number()) as u32 & 31;
            Value::Number((a >> b) as f64)
        }
        BinaryOp::In => Value::Bool(builtins::has_property(right, left)?),
        BinaryOp::InstanceOf => Value::Bool(builtins::instance_of(left, right)?),
    })
}

/// Invoke a function value.
pub fn call_function(callee: &Value, args: &[Value]) -> EvalResult<Value> {
    match callee {
        Value::Function(Function::Native { f, .. }) => f(args),
        Value::Function(Function::Lambda(lambda)) => {
            let frame = lambda.env.frame();
            for (i, param) in lambda.arrow.params.iter().enumerate() {
                let arg = args.get(i).cloned().unwrap_or_default();
                bind_pattern(param, arg, &frame)?;
            }
            match &lambda.arrow.body {
                ArrowBody::Expr(body) => evaluate(body, &frame),
                ArrowBody::Block(body) => match execute(body, &frame)? {
                    Flow::Return(value) => Ok(value),
                    Flow::Normal => Ok(Value::Undefined),
                },
            }
        }
        other => Err(EvalError::NotCallable(format!("{:?}", other))),
    }
}

pub(crate) fn bind_pattern(pattern: &Pattern, value: Value, frame: &Scope) -> EvalResult<()> {
    match pattern {
        Pattern::Identifier(name) => {
            frame.define(name, value);
            Ok(())
        }
        Pattern::Default(inner, default) => {
            let value = match value {
                Value::Undefined => evaluate(default, frame)?,
                other => other,
            };
            bind_pattern(inner, value, frame)
        }
        Pattern::Array(items) => {
            let elements = builtins::iterate(&value)?;
            for (i, item) in items.iter().enumerate() {
                if let Some(item) = item {
                    bind_pattern(item, elements.get(i).cloned().unwrap_or_default(), frame)?;
                }
            }
            Ok(())
        }
        Pattern::Object(props) => {
            for (key, item) in props {
                let member = get_member(&value, &Value::string(key))?;
                bind_pattern(item, member, frame)?;
            }
            Ok(())
        }
    }
}

fn execute(statements: &[Statement], frame: &Scope) -> EvalResult<Flow> {
    for statement in statements {
        match statement {
            Statement::Let(pattern, init) => {
                let value = match init {
                    Some(init) => evaluate(init, frame)?,
                    None => Value::Undefined,
                };
                bind_pattern(pattern, value, frame)?;
            }
            Statement::Expr(e) => {
                evaluate(e, frame)?;
            }
            Statement::Return(e) => {
                let value = match e {
                    Some(e) => evaluate(e, frame)?,
                    None => Value::Undefined,
                };
                return Ok(Flow::Return(value));
            }
            Statement::If {
                test,
                consequent,
                alternate,
            } => {
                let branch = if evaluate(test, frame)?.is_truthy() {
                    consequent
                } else {
                    alternate
                };
                if let Flow::Return(value) = execute(branch, frame)? {
                    return Ok(Flow::Return(value));
                }
            }
            Statement::Block(body) => {
                if let Flow::Return(value) = execute(body, frame)? {
                    return Ok(Flow::Return(value));
                }
            }
        }
    }
    Ok(Flow::Normal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::parse_expression;
    use crate::scheduler::UpdateQueue;
    use serde_json::json;

    fn scope_with(state: serde_json::Value) -> Scope {
        let scope = Scope::root(UpdateQueue::new(100));
        if let serde_json::Value::Object(map) = state {
            for (k, v) in map {
                scope.define(&k, Value::from(v));
            }
        }
        scope
    }

    fn eval(source: &str, scope: &Scope) -> Value {
        evaluate(&parse_expression(source).unwrap(), scope).unwrap()
    }

    #[test]
    fn test_arithmetic_and_strings() {
        let scope = scope_with(json!({ "a": 2, "name": "Ada" }));
        assert_eq!(eval("a * 3 + 1", &scope).to_number(), 7.0);
        assert_eq!(eval("`hi ${name}!`", &scope).to_js_string(), "hi Ada!");
        assert_eq!(eval("'n' + a", &scope).to_js_string(), "n2");
        assert_eq!(eval("a > 1 ? 'big' : 'small'", &scope).to_js_string(), "big");
        assert_eq!(eval("missing ?? 'fallback'", &scope).to_js_string(), "fallback");
    }

    #[test]
    fn test_optional_chain_short_circuits() {
        let scope = scope_with(json!({ "user": null }));
        assert!(matches!(eval("user?.profile.name", &scope), Value::Undefined));
        let err = evaluate(&parse_expression("user.profile").unwrap(), &scope).unwrap_err();
        assert!(matches!(err, EvalError::Type(_)));
    }

    #[test]
    fn test_array_builtins_with_lambdas() {
        let scope = scope_with(json!({ "todos": [{ "t": "a", "done": true }, { "t": "b", "done": false }] }));
        assert_eq!(eval("todos.filter(x => !x.done).map(x => x.t).join()", &scope).to_js_string(), "b");
        assert_eq!(eval("todos.findIndex(x => x.t === 'b')", &scope).to_number(), 1.0);
        assert_eq!(eval("todos.reduce((n, x) => n + (x.done ? 1 : 0), 0)", &scope).to_number(), 1.0);
    }

    #[test]
    fn test_assignment_through_wrapper_records_path() {
        let scope = scope_with(json!({ "todos": [{ "done": false }] }));
        eval("todos[0].done = true", &scope);
        assert!(scope.own_changes().contains("todos[0].done"));
        eval("todos.push({ done: false })", &scope);
        assert!(scope.own_changes().contains("todos"));
        assert_eq!(eval("todos.length", &scope).to_number(), 2.0);
    }

    #[test]
    fn test_block_bodied_arrow() {
        let scope = scope_with(json!({ "base": 10 }));
        let value = eval("((x, { y = 2 }) => { const z = x * y; if (z > base) { return 'over'; } return z; })(3, {})", &scope);
        assert_eq!(value.to_number(), 6.0);
    }

    #[test]
    fn test_update_and_compound_assignment() {
        let scope = scope_with(json!({ "count": 1 }));
        assert_eq!(eval("count++", &scope).to_number(), 1.0);
        assert_eq!(eval("count += 5", &scope).to_number(), 7.0);
        assert_eq!(scope.get("count").to_number(), 7.0);
    }

    #[test]
    fn test_calling_non_function_fails() {
        let scope = scope_with(json!({ "x": 1 }));
        let err = evaluate(&parse_expression("x()").unwrap(), &scope).unwrap_err();
        assert_eq!(err, EvalError::NotCallable("x".to_string()));
    }

    #[test]
    fn test_globals() {
        let scope = scope_with(json!({}));
        assert_eq!(eval("Math.max(1, 5, 3)", &scope).to_number(), 5.0);
        assert_eq!(eval("Object.keys({ a: 1, b: 2 }).length", &scope).to_number(), 2.0);
        assert!(eval("Array.isArray([1])", &scope).is_truthy());
        assert_eq!(eval("JSON.stringify({ a: [1, 'x'] })", &scope).to_js_string(), r#"{"a":[1,"x"]}"#);
        assert_eq!(eval("new Set([1, 1, 2]).size", &scope).to_number(), 2.0);
    }
}
