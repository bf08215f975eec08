//! Runtime value model.
//!
//! State is a graph of shared containers (`Rc<Container<..>>`). Each container
//! carries a process-unique id, used to key the wrapper cache, and a `raw` mark
//! that opts it out of change interception. Reading state through a
//! [`Reactive`] handle is what makes mutations observable; the containers
//! themselves are plain storage.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use regex::Regex;

use crate::error::EvalResult;
use crate::expression::Lambda;
use crate::reactive::Reactive;

static CONTAINER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_container_id() -> u64 {
    CONTAINER_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

pub struct Container<T> {
    id: u64,
    raw: Cell<bool>,
    data: RefCell<T>,
}

impl<T> Container<T> {
    pub fn new(data: T) -> Rc<Self> {
        Rc::new(Self {
            id: next_container_id(),
            raw: Cell::new(false),
            data: RefCell::new(data),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_raw(&self) -> bool {
        self.raw.get()
    }

    pub fn mark_raw(&self) {
        self.raw.set(true);
    }

    pub fn borrow(&self) -> Ref<'_, T> {
        self.data.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.data.borrow_mut()
    }
}

pub type ArrayRef = Rc<Container<Vec<Value>>>;
pub type ObjectRef = Rc<Container<IndexMap<String, Value>>>;
/// Associative map with arbitrary keys, kept in insertion order.
pub type MapRef = Rc<Container<Vec<(Value, Value)>>>;
pub type SetRef = Rc<Container<Vec<Value>>>;

pub type NativeFn = dyn Fn(&[Value]) -> EvalResult<Value>;

#[derive(Clone)]
pub enum Function {
    Native { name: Rc<str>, f: Rc<NativeFn> },
    Lambda(Rc<Lambda>),
}

impl Function {
    pub fn native(name: &str, f: impl Fn(&[Value]) -> EvalResult<Value> + 'static) -> Self {
        Function::Native {
            name: Rc::from(name),
            f: Rc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Function::Native { name, .. } => name,
            Function::Lambda(_) => "<lambda>",
        }
    }

    fn ptr_eq(&self, other: &Function) -> bool {
        match (self, other) {
            (Function::Native { f: a, .. }, Function::Native { f: b, .. }) => {
                std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
            }
            (Function::Lambda(a), Function::Lambda(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Array(ArrayRef),
    Object(ObjectRef),
    Map(MapRef),
    Set(SetRef),
    /// Milliseconds since the epoch.
    Date(f64),
    RegExp(Rc<Regex>),
    Error(Rc<str>),
    Function(Function),
    Reactive(Rc<Reactive>),
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::String(Rc::from(s.as_ref()))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Container::new(items))
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(Container::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn map(entries: Vec<(Value, Value)>) -> Self {
        Value::Map(Container::new(entries))
    }

    pub fn set(items: Vec<Value>) -> Self {
        let mut unique: Vec<Value> = Vec::new();
        for item in items {
            if !unique.iter().any(|u| u.strict_eq(&item)) {
                unique.push(item);
            }
        }
        Value::Set(Container::new(unique))
    }

    pub fn function(name: &str, f: impl Fn(&[Value]) -> EvalResult<Value> + 'static) -> Self {
        Value::Function(Function::native(name, f))
    }

    /// Strip any reactive wrapper, yielding the underlying target.
    pub fn unwrapped(&self) -> Value {
        match self {
            Value::Reactive(r) => r.target().clone(),
            other => other.clone(),
        }
    }

    pub fn is_reactive(&self) -> bool {
        matches!(self, Value::Reactive(_))
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self.unwrapped(), Value::Undefined | Value::Null)
    }

    pub fn container_id(&self) -> Option<u64> {
        match self {
            Value::Array(c) => Some(c.id()),
            Value::Object(c) => Some(c.id()),
            Value::Map(c) => Some(c.id()),
            Value::Set(c) => Some(c.id()),
            Value::Reactive(r) => r.target().container_id(),
            _ => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        match self {
            Value::Array(c) => c.is_raw(),
            Value::Object(c) => c.is_raw(),
            Value::Map(c) => c.is_raw(),
            Value::Set(c) => c.is_raw(),
            Value::Reactive(r) => r.target().is_raw(),
            _ => false,
        }
    }

    /// Opt a container out of change interception.
    pub fn mark_raw(&self) {
        match self.unwrapped() {
            Value::Array(c) => c.mark_raw(),
            Value::Object(c) => c.mark_raw(),
            Value::Map(c) => c.mark_raw(),
            Value::Set(c) => c.mark_raw(),
            _ => {}
        }
    }

    /// Number of elements for array-like values, `None` otherwise.
    pub fn array_len(&self) -> Option<usize> {
        match self.unwrapped() {
            Value::Array(a) => Some(a.borrow().len()),
            _ => None,
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Function(_) => "function",
            Value::Reactive(r) => r.target().type_of(),
            _ => "object",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => *n,
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse::<f64>().unwrap_or(f64::NAN)
                }
            }
            Value::Date(ms) => *ms,
            Value::Array(a) => {
                let items = a.borrow();
                match items.len() {
                    0 => 0.0,
                    1 => items[0].to_number(),
                    _ => f64::NAN,
                }
            }
            Value::Reactive(r) => r.target().to_number(),
            _ => f64::NAN,
        }
    }

    /// `String(value)` conversion.
    pub fn to_js_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.to_string(),
            Value::Array(a) => a
                .borrow()
                .iter()
                .map(|v| if v.is_nullish() { String::new() } else { v.to_js_string() })
                .collect::<Vec<_>>()
                .join(","),
            Value::Object(_) => "[object Object]".to_string(),
            Value::Map(_) => "[object Map]".to_string(),
            Value::Set(_) => "[object Set]".to_string(),
            Value::Date(ms) => format!("Date({})", format_number(*ms)),
            Value::RegExp(re) => format!("/{}/", re.as_str()),
            Value::Error(msg) => format!("Error: {}", msg),
            Value::Function(f) => format!("function {}", f.name()),
            Value::Reactive(r) => r.target().to_js_string(),
        }
    }

    /// Text shown for an interpolation: nullish renders empty, containers
    /// render as JSON.
    pub fn to_display_text(&self) -> String {
        match self.unwrapped() {
            Value::Undefined | Value::Null => String::new(),
            v @ (Value::Array(_) | Value::Object(_) | Value::Map(_) | Value::Set(_)) => {
                serde_json::to_string_pretty(&v.to_json()).unwrap_or_default()
            }
            v => v.to_js_string(),
        }
    }

    /// `===`: identity for containers and functions, value for primitives.
    pub fn strict_eq(&self, other: &Value) -> bool {
        match (self.unwrapped(), other.unwrapped()) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::RegExp(a), Value::RegExp(b)) => Rc::ptr_eq(&a, &b),
            (Value::Error(a), Value::Error(b)) => Rc::ptr_eq(&a, &b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(&b),
            (a, b) => match (a.container_id(), b.container_id()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }

    /// `==` with the usual primitive coercions.
    pub fn loose_eq(&self, other: &Value) -> bool {
        let (a, b) = (self.unwrapped(), other.unwrapped());
        match (&a, &b) {
            (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
            (Value::Undefined | Value::Null, _) | (_, Value::Undefined | Value::Null) => false,
            (Value::Number(_), Value::String(_))
            | (Value::String(_), Value::Number(_))
            | (Value::Bool(_), _)
            | (_, Value::Bool(_)) => a.to_number() == b.to_number(),
            _ => a.strict_eq(&b),
        }
    }

    /// Change-detection equality: like `strict_eq` but NaN equals NaN.
    pub fn same_value(&self, other: &Value) -> bool {
        match (self.unwrapped(), other.unwrapped()) {
            (Value::Number(a), Value::Number(b)) if a.is_nan() && b.is_nan() => true,
            _ => self.strict_eq(other),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Undefined | Value::Function(_) => Json::Null,
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => Json::String(s.to_string()),
            Value::Array(a) => Json::Array(a.borrow().iter().map(Value::to_json).collect()),
            Value::Set(s) => Json::Array(s.borrow().iter().map(Value::to_json).collect()),
            Value::Object(o) => Json::Object(
                o.borrow()
                    .iter()
                    .filter(|(_, v)| !matches!(v, Value::Undefined | Value::Function(_)))
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Map(m) => Json::Object(
                m.borrow()
                    .iter()
                    .map(|(k, v)| (k.to_js_string(), v.to_json()))
                    .collect(),
            ),
            Value::Date(ms) => number_to_json(*ms),
            Value::RegExp(re) => Json::Object(serde_json::Map::from_iter([(
                "source".to_string(),
                Json::String(re.as_str().to_string()),
            )])),
            Value::Error(msg) => Json::String(msg.to_string()),
            Value::Reactive(r) => r.target().to_json(),
        }
    }
}

pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == n.trunc() && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n == n.trunc() && n.abs() < 9.0e15 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Value::string(s),
            Json::Array(items) => Value::array(items.into_iter().map(Value::from).collect()),
            Json::Object(map) => Value::object(map.into_iter().map(|(k, v)| (k, Value::from(v)))),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::string(s)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Function(func) => write!(f, "[Function {}]", func.name()),
            Value::Reactive(r) => write!(f, "Reactive({}, {:?})", r.path(), r.target()),
            Value::Date(_) | Value::RegExp(_) | Value::Error(_) => {
                write!(f, "{}", self.to_js_string())
            }
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_js_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_conversion_preserves_order() {
        let value = Value::from(json!({ "b": 1, "a": [true, null, "x"] }));
        assert_eq!(value.to_json().to_string(), r#"{"b":1,"a":[true,null,"x"]}"#);
    }

    #[test]
    fn test_strict_equality_is_identity_for_containers() {
        let a = Value::array(vec![Value::from(1)]);
        let b = Value::array(vec![Value::from(1)]);
        assert!(a.strict_eq(&a.clone()));
        assert!(!a.strict_eq(&b));
        assert!(Value::from(2).strict_eq(&Value::from(2.0)));
        assert!(!Value::Number(f64::NAN).strict_eq(&Value::Number(f64::NAN)));
        assert!(Value::Number(f64::NAN).same_value(&Value::Number(f64::NAN)));
    }

    #[test]
    fn test_loose_equality_coerces() {
        assert!(Value::from("1").loose_eq(&Value::from(1)));
        assert!(Value::Null.loose_eq(&Value::Undefined));
        assert!(!Value::Null.loose_eq(&Value::from(0)));
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(1.5), "1.5");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(Value::from(-0.0).to_js_string(), "0");
    }

    #[test]
    fn test_display_text_for_nullish_and_containers() {
        assert_eq!(Value::Undefined.to_display_text(), "");
        assert_eq!(Value::from(json!([1, 2])).to_display_text(), "[\n  1,\n  2\n]");
        assert_eq!(Value::array(vec![Value::from(1), Value::Null]).to_js_string(), "1,");
    }

    #[test]
    fn test_set_dedupes() {
        let set = Value::set(vec![Value::from(1), Value::from(1), Value::from("1")]);
        match set {
            Value::Set(s) => assert_eq!(s.borrow().len(), 2),
            _ => unreachable!(),
        }
    }
}
