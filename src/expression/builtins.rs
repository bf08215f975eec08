//! Built-in globals and methods of the expression language.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

use regex::Regex;
use serde::Serialize;

use super::eval::{call_function, property_key};
use crate::error::{EvalError, EvalResult};
use crate::reactive::{apply_mutator, relative_index, ARRAY_MUTATORS};
use crate::value::{format_number, Value};

lazy_static::lazy_static! {
    static ref FLOAT_PREFIX: Regex =
        Regex::new(r"^[+-]?(Infinity|\d+\.?\d*(?:[eE][+-]?\d+)?|\.\d+(?:[eE][+-]?\d+)?)").unwrap();
}

/// Names callable as functions that also expose static members.
const CONSTRUCTORS: &[&str] = &[
    "String", "Number", "Boolean", "Array", "Object", "Map", "Set", "Date", "Error", "RegExp",
];

thread_local! {
    static GLOBALS: RefCell<HashMap<&'static str, Value>> = RefCell::new(HashMap::new());
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

/// Resolve a global identifier not found in any scope.
pub fn global(name: &str) -> Option<Value> {
    GLOBALS.with(|cache| {
        if let Some(found) = cache.borrow().get(name) {
            return Some(found.clone());
        }
        let (key, value): (&'static str, Value) = match name {
            "Math" => ("Math", math_object()),
            "JSON" => ("JSON", json_object()),
            "parseInt" => ("parseInt", Value::function("parseInt", |args| {
                Ok(Value::Number(parse_int(&arg(args, 0).to_js_string(), args.get(1))))
            })),
            "parseFloat" => ("parseFloat", Value::function("parseFloat", |args| {
                Ok(Value::Number(parse_float(&arg(args, 0).to_js_string())))
            })),
            "isNaN" => ("isNaN", Value::function("isNaN", |args| {
                Ok(Value::Bool(arg(args, 0).to_number().is_nan()))
            })),
            other => {
                let name: &'static str = CONSTRUCTORS.iter().copied().find(|c| *c == other)?;
                (name, Value::function(name, move |args| construct(name, args)))
            }
        };
        cache.borrow_mut().insert(key, value.clone());
        Some(value)
    })
}

fn math_object() -> Value {
    fn unary(name: &'static str, f: fn(f64) -> f64) -> (&'static str, Value) {
        (name, Value::function(name, move |args| Ok(Value::Number(f(arg(args, 0).to_number())))))
    }
    let entries = vec![
        ("PI", Value::Number(std::f64::consts::PI)),
        ("E", Value::Number(std::f64::consts::E)),
        unary("abs", f64::abs),
        unary("floor", f64::floor),
        unary("ceil", f64::ceil),
        unary("round", |x| (x + 0.5).floor()),
        unary("trunc", f64::trunc),
        unary("sqrt", f64::sqrt),
        unary("sign", |x| if x.is_nan() || x == 0.0 { x } else { x.signum() }),
        (
            "pow",
            Value::function("pow", |args| {
                Ok(Value::Number(arg(args, 0).to_number().powf(arg(args, 1).to_number())))
            }),
        ),
        (
            "min",
            Value::function("min", |args| {
                Ok(Value::Number(args.iter().map(Value::to_number).fold(f64::INFINITY, |a, b| {
                    if a.is_nan() || b.is_nan() { f64::NAN } else { a.min(b) }
                })))
            }),
        ),
        (
            "max",
            Value::function("max", |args| {
                Ok(Value::Number(args.iter().map(Value::to_number).fold(f64::NEG_INFINITY, |a, b| {
                    if a.is_nan() || b.is_nan() { f64::NAN } else { a.max(b) }
                })))
            }),
        ),
    ];
    let math = Value::object(entries);
    math.mark_raw();
    math
}

fn json_object() -> Value {
    let json = Value::object(vec![
        (
            "stringify",
            Value::function("stringify", |args| {
                let value = arg(args, 0);
                if matches!(value.unwrapped(), Value::Undefined | Value::Function(_)) {
                    return Ok(Value::Undefined);
                }
                let indent = match args.get(2).map(Value::unwrapped) {
                    Some(Value::Number(n)) if n >= 1.0 => " ".repeat(n.min(10.0) as usize),
                    Some(Value::String(s)) => s.chars().take(10).collect(),
                    _ => String::new(),
                };
                json_stringify(&value, &indent).map(Value::string)
            }),
        ),
        (
            "parse",
            Value::function("parse", |args| {
                let text = arg(args, 0).to_js_string();
                serde_json::from_str::<serde_json::Value>(&text)
                    .map(Value::from)
                    .map_err(|e| EvalError::Custom(format!("JSON.parse: {}", e)))
            }),
        ),
    ]);
    json.mark_raw();
    json
}

pub fn json_stringify(value: &Value, indent: &str) -> EvalResult<String> {
    let json = value.to_json();
    if indent.is_empty() {
        return serde_json::to_string(&json).map_err(|e| EvalError::Custom(e.to_string()));
    }
    let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    json.serialize(&mut serializer)
        .map_err(|e| EvalError::Custom(e.to_string()))?;
    String::from_utf8(out).map_err(|e| EvalError::Custom(e.to_string()))
}

fn parse_int(text: &str, radix: Option<&Value>) -> f64 {
    let text = text.trim();
    let (negative, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let explicit = radix.map(|r| r.to_number()).filter(|r| *r != 0.0 && !r.is_nan());
    let mut radix = explicit.unwrap_or(10.0) as u32;
    let mut digits = rest;
    if explicit.map_or(true, |r| r == 16.0) && (rest.starts_with("0x") || rest.starts_with("0X")) {
        radix = 16;
        digits = &rest[2..];
    }
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }
    let valid: String = digits.chars().take_while(|c| c.is_digit(radix)).collect();
    if valid.is_empty() {
        return f64::NAN;
    }
    let magnitude = valid
        .chars()
        .filter_map(|c| c.to_digit(radix))
        .fold(0.0, |acc, d| acc * radix as f64 + d as f64);
    if negative { -magnitude } else { magnitude }
}

fn parse_float(text: &str) -> f64 {
    match FLOAT_PREFIX.find(text.trim_start()) {
        Some(m) => {
            let matched = m.as_str();
            match matched.trim_start_matches(['+', '-']) {
                "Infinity" if matched.starts_with('-') => f64::NEG_INFINITY,
                "Infinity" => f64::INFINITY,
                _ => matched.parse().unwrap_or(f64::NAN),
            }
        }
        None => f64::NAN,
    }
}

/// Call or `new` one of [`CONSTRUCTORS`].
pub fn construct(name: &str, args: &[Value]) -> EvalResult<Value> {
    let first = arg(args, 0);
    Ok(match name {
        "String" => Value::string(if args.is_empty() { String::new() } else { first.to_js_string() }),
        "Number" => Value::Number(if args.is_empty() { 0.0 } else { first.to_number() }),
        "Boolean" => Value::Bool(first.is_truthy()),
        "Array" => match (args.len(), first.unwrapped()) {
            (1, Value::Number(n)) => Value::array(vec![Value::Undefined; n.max(0.0) as usize]),
            _ => Value::array(args.iter().map(Value::unwrapped).collect()),
        },
        "Object" => match first.unwrapped() {
            v @ (Value::Object(_) | Value::Array(_) | Value::Map(_) | Value::Set(_)) => v,
            _ => Value::object(Vec::<(String, Value)>::new()),
        },
        "Map" => {
            let mut entries: Vec<(Value, Value)> = Vec::new();
            for pair in iterate(&first)? {
                let pair = iterate(&pair)?;
                let (k, v) = (arg(&pair, 0).unwrapped(), arg(&pair, 1).unwrapped());
                match entries.iter_mut().find(|(existing, _)| existing.same_value(&k)) {
                    Some(slot) => slot.1 = v,
                    None => entries.push((k, v)),
                }
            }
            Value::map(entries)
        }
        "Set" => Value::set(iterate(&first)?.iter().map(Value::unwrapped).collect()),
        "Date" => match first.unwrapped() {
            Value::Undefined => Value::Date(0.0),
            other => Value::Date(other.to_number()),
        },
        "Error" => Value::Error(Rc::from(first.to_js_string().as_str())),
        "RegExp" => {
            let pattern = first.to_js_string();
            Value::RegExp(Rc::new(
                Regex::new(&pattern).map_err(|e| EvalError::Custom(e.to_string()))?,
            ))
        }
        other => return Err(EvalError::NotCallable(other.to_string())),
    })
}

/// `Array.isArray`, `Object.keys`, `Number.isInteger` and friends.
pub fn static_member(owner: &str, key: &str) -> Value {
    let key_owned = key.to_string();
    let found = matches!(
        (owner, key),
        ("Array", "isArray" | "from")
            | ("Object", "keys" | "values" | "entries" | "assign")
            | ("Number", "isInteger" | "isFinite" | "isNaN")
    );
    if !found {
        return Value::Undefined;
    }
    let owner = owner.to_string();
    Value::function(key, move |args| {
        let first = arg(args, 0);
        Ok(match (owner.as_str(), key_owned.as_str()) {
            ("Array", "isArray") => Value::Bool(matches!(first.unwrapped(), Value::Array(_))),
            ("Array", "from") => {
                let items = match first.unwrapped() {
                    Value::Object(record) => {
                        let len = record.borrow().get("length").map(Value::to_number).unwrap_or(0.0);
                        vec![Value::Undefined; len.max(0.0) as usize]
                    }
                    _ => iterate(&first)?,
                };
                match args.get(1) {
                    Some(mapper) => {
                        let mut mapped = Vec::with_capacity(items.len());
                        for (i, item) in items.into_iter().enumerate() {
                            mapped.push(call_function(mapper, &[item, Value::from(i)])?.unwrapped());
                        }
                        Value::array(mapped)
                    }
                    None => Value::array(items.iter().map(Value::unwrapped).collect()),
                }
            }
            ("Object", "keys") => Value::array(entries_of(&first).into_iter().map(|(k, _)| Value::string(k)).collect()),
            ("Object", "values") => Value::array(entries_of(&first).into_iter().map(|(_, v)| v.unwrapped()).collect()),
            ("Object", "entries") => Value::array(
                entries_of(&first)
                    .into_iter()
                    .map(|(k, v)| Value::array(vec![Value::string(k), v.unwrapped()]))
                    .collect(),
            ),
            ("Object", "assign") => {
                for source in args.iter().skip(1) {
                    for (k, v) in entries_of(source) {
                        super::eval::set_member(&first, &Value::string(&k), v)?;
                    }
                }
                first
            }
            ("Number", "isInteger") => Value::Bool(matches!(first, Value::Number(n) if n.is_finite() && n.fract() == 0.0)),
            ("Number", "isFinite") => Value::Bool(matches!(first, Value::Number(n) if n.is_finite())),
            ("Number", "isNaN") => Value::Bool(matches!(first, Value::Number(n) if n.is_nan())),
            _ => Value::Undefined,
        })
    })
}

/// Own enumerable entries of a record or array.
pub fn entries_of(value: &Value) -> Vec<(String, Value)> {
    match value {
        Value::Reactive(r) => match r.target() {
            Value::Object(record) => {
                let keys: Vec<String> = record.borrow().keys().cloned().collect();
                keys.into_iter().map(|k| { let v = r.get(&k); (k, v) }).collect()
            }
            Value::Array(items) => {
                let len = items.borrow().len();
                (0..len).map(|i| (i.to_string(), r.get(&i.to_string()))).collect()
            }
            _ => Vec::new(),
        },
        Value::Object(record) => record.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Value::Array(items) => items
            .borrow()
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v.clone()))
            .collect(),
        Value::String(s) => s.chars().enumerate().map(|(i, c)| (i.to_string(), Value::string(c.to_string()))).collect(),
        _ => Vec::new(),
    }
}

/// Elements produced by iterating `value`: arrays, sets, map entries and
/// string characters. Elements of wrapped containers come back wrapped.
pub fn iterate(value: &Value) -> EvalResult<Vec<Value>> {
    Ok(match value {
        Value::Undefined | Value::Null => Vec::new(),
        Value::Array(items) | Value::Set(items) => items.borrow().clone(),
        Value::Map(entries) => entries
            .borrow()
            .iter()
            .map(|(k, v)| Value::array(vec![k.clone(), v.clone()]))
            .collect(),
        Value::String(s) => s.chars().map(|c| Value::string(c.to_string())).collect(),
        Value::Reactive(r) => match r.target() {
            Value::Array(items) => {
                let len = items.borrow().len();
                (0..len).map(|i| r.get(&i.to_string())).collect()
            }
            Value::Set(items) => {
                let items = items.borrow().clone();
                items.into_iter().map(|v| r.wrap_member(v)).collect()
            }
            Value::Map(entries) => {
                let entries = entries.borrow().clone();
                entries
                    .into_iter()
                    .map(|(k, v)| Value::array(vec![k, r.wrap_member(v)]))
                    .collect()
            }
            other => return Err(not_iterable(other)),
        },
        other => return Err(not_iterable(other)),
    })
}

fn not_iterable(value: &Value) -> EvalError {
    EvalError::Type(format!("{} is not iterable", value.type_of()))
}

/// A bound method value for `receiver.name`, or `None` if `receiver` has no
/// such method.
pub fn method(receiver: &Value, name: &str) -> Option<Value> {
    let known = match receiver.unwrapped() {
        Value::Array(_) => ARRAY_METHODS.contains(&name),
        Value::String(_) => STRING_METHODS.contains(&name),
        Value::Number(_) => matches!(name, "toFixed" | "toString"),
        Value::Map(_) => MAP_METHODS.contains(&name),
        Value::Set(_) => SET_METHODS.contains(&name),
        Value::RegExp(_) => name == "test",
        Value::Date(_) => matches!(name, "getTime" | "valueOf"),
        Value::Bool(_) | Value::Error(_) => name == "toString",
        _ => false,
    };
    if !known {
        return None;
    }
    let receiver = receiver.clone();
    let method_name = name.to_string();
    Some(Value::function(name, move |args| call_method(&receiver, &method_name, args)))
}

const ARRAY_METHODS: &[&str] = &[
    "push", "pop", "shift", "unshift", "splice", "sort", "reverse", "map", "filter", "find",
    "findIndex", "some", "every", "forEach", "reduce", "includes", "indexOf", "join", "slice",
    "concat", "at", "toString",
];
const STRING_METHODS: &[&str] = &[
    "toUpperCase", "toLowerCase", "trim", "trimStart", "trimEnd", "split", "includes",
    "startsWith", "endsWith", "indexOf", "slice", "substring", "replace", "replaceAll", "repeat",
    "padStart", "padEnd", "charAt", "at", "concat", "toString",
];
const MAP_METHODS: &[&str] = &["get", "set", "has", "delete", "clear", "keys", "values", "entries", "forEach"];
const SET_METHODS: &[&str] = &["add", "has", "delete", "clear", "values", "forEach"];

pub fn call_method(receiver: &Value, name: &str, args: &[Value]) -> EvalResult<Value> {
    match receiver.unwrapped() {
        Value::Array(_) => array_method(receiver, name, args),
        Value::String(s) => string_method(&s, name, args),
        Value::Number(n) => Ok(match name {
            "toFixed" => {
                let digits = arg(args, 0).to_number();
                let digits = if digits.is_nan() { 0 } else { digits.clamp(0.0, 100.0) as usize };
                Value::string(format!("{:.*}", digits, n))
            }
            _ => Value::string(format_number(n)),
        }),
        Value::Map(_) | Value::Set(_) => collection_method(receiver, name, args),
        Value::RegExp(re) => Ok(Value::Bool(re.is_match(&arg(args, 0).to_js_string()))),
        Value::Date(ms) => Ok(Value::Number(ms)),
        other => Ok(Value::string(other.to_js_string())),
    }
}

fn callback(args: &[Value], method: &str) -> EvalResult<Value> {
    match args.first() {
        Some(f @ Value::Function(_)) => Ok(f.clone()),
        Some(other) => Err(EvalError::NotCallable(format!("{} callback {:?}", method, other))),
        None => Err(EvalError::Type(format!("{} requires a callback", method))),
    }
}

fn array_method(receiver: &Value, name: &str, args: &[Value]) -> EvalResult<Value> {
    if ARRAY_MUTATORS.contains(&name) {
        let comparator = args.first().cloned();
        let error = RefCell::new(None);
        let result = match receiver {
            Value::Reactive(r) if name == "sort" => {
                let mut sorted = raw_items(r.target());
                sort_values(&mut sorted, comparator.as_ref(), &error);
                if error.borrow().is_none() {
                    r.mutate_array(|items| *items = sorted)?;
                }
                Value::Undefined
            }
            Value::Reactive(r) => match r.call_mutator(name, args) {
                Some(result) => result?,
                None => Value::Undefined,
            },
            Value::Array(items) if name == "sort" => {
                let mut sorted = raw_items(receiver);
                sort_values(&mut sorted, comparator.as_ref(), &error);
                if error.borrow().is_none() {
                    *items.borrow_mut() = sorted;
                }
                Value::Undefined
            }
            Value::Array(items) => apply_mutator(&mut items.borrow_mut(), name, args),
            other => return Err(EvalError::Type(format!("{} is not an array", other.type_of()))),
        };
        if let Some(e) = error.into_inner() {
            return Err(e);
        }
        return Ok(if matches!(name, "sort" | "reverse") { receiver.clone() } else { result });
    }

    let items = iterate(receiver)?;
    let len = items.len() as f64;
    Ok(match name {
        "map" => {
            let f = callback(args, name)?;
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                out.push(call_function(&f, &[item.clone(), Value::from(i), receiver.clone()])?.unwrapped());
            }
            Value::array(out)
        }
        "filter" => {
            let f = callback(args, name)?;
            let mut out = Vec::new();
            for (i, item) in items.iter().enumerate() {
                if call_function(&f, &[item.clone(), Value::from(i), receiver.clone()])?.is_truthy() {
                    out.push(item.unwrapped());
                }
            }
            Value::array(out)
        }
        "find" | "findIndex" => {
            let f = callback(args, name)?;
            for (i, item) in items.iter().enumerate() {
                if call_function(&f, &[item.clone(), Value::from(i), receiver.clone()])?.is_truthy() {
                    return Ok(if name == "find" { item.clone() } else { Value::from(i) });
                }
            }
            if name == "find" { Value::Undefined } else { Value::from(-1) }
        }
        "some" | "every" => {
            let f = callback(args, name)?;
            let want = name == "some";
            for (i, item) in items.iter().enumerate() {
                if call_function(&f, &[item.clone(), Value::from(i), receiver.clone()])?.is_truthy() == want {
                    return Ok(Value::Bool(want));
                }
            }
            Value::Bool(!want)
        }
        "forEach" => {
            let f = callback(args, name)?;
            for (i, item) in items.iter().enumerate() {
                call_function(&f, &[item.clone(), Value::from(i), receiver.clone()])?;
            }
            Value::Undefined
        }
        "reduce" => {
            let f = callback(args, name)?;
            let mut iter = items.iter().enumerate();
            let mut acc = match args.get(1) {
                Some(initial) => initial.clone(),
                None => match iter.next() {
                    Some((_, first)) => first.clone(),
                    None => return Err(EvalError::Type("reduce of empty array with no initial value".into())),
                },
            };
            for (i, item) in iter {
                acc = call_function(&f, &[acc, item.clone(), Value::from(i), receiver.clone()])?;
            }
            acc
        }
        "includes" => {
            let needle = arg(args, 0);
            Value::Bool(items.iter().any(|item| item.same_value(&needle)))
        }
        "indexOf" => {
            let needle = arg(args, 0);
            match items.iter().position(|item| item.strict_eq(&needle)) {
                Some(i) => Value::from(i),
                None => Value::from(-1),
            }
        }
        "join" => {
            let separator = match args.first() {
                Some(Value::Undefined) | None => ",".to_string(),
                Some(sep) => sep.to_js_string(),
            };
            Value::string(
                items
                    .iter()
                    .map(|item| if item.is_nullish() { String::new() } else { item.to_js_string() })
                    .collect::<Vec<_>>()
                    .join(&separator),
            )
        }
        "slice" => {
            let (start, end) = slice_bounds(args, len);
            Value::array(items[start..end.max(start)].iter().map(Value::unwrapped).collect())
        }
        "concat" => {
            let mut out: Vec<Value> = items.iter().map(Value::unwrapped).collect();
            for extra in args {
                match extra.unwrapped() {
                    Value::Array(more) => out.extend(more.borrow().iter().cloned()),
                    other => out.push(other),
                }
            }
            Value::array(out)
        }
        "at" => {
            let index = arg(args, 0).to_number();
            let index = if index < 0.0 { len + index.trunc() } else { index.trunc() };
            if index >= 0.0 && index < len {
                items[index as usize].clone()
            } else {
                Value::Undefined
            }
        }
        _ => Value::string(receiver.to_js_string()),
    })
}

fn raw_items(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.borrow().clone(),
        _ => Vec::new(),
    }
}

fn slice_bounds(args: &[Value], len: f64) -> (usize, usize) {
    let start = relative_index(args.first().map(Value::to_number).unwrap_or(0.0), len);
    let end = match args.get(1) {
        Some(Value::Undefined) | None => len as usize,
        Some(end) => relative_index(end.to_number(), len),
    };
    (start, end)
}

/// Stable merge sort. User comparators need not be consistent, so no
/// ordering invariant is assumed.
fn sort_values(items: &mut Vec<Value>, comparator: Option<&Value>, error: &RefCell<Option<EvalError>>) {
    let compare = |a: &Value, b: &Value| -> Ordering {
        if error.borrow().is_some() {
            return Ordering::Equal;
        }
        match (a, b) {
            (Value::Undefined, Value::Undefined) => return Ordering::Equal,
            (Value::Undefined, _) => return Ordering::Greater,
            (_, Value::Undefined) => return Ordering::Less,
            _ => {}
        }
        match comparator {
            Some(f) => match call_function(f, &[a.clone(), b.clone()]) {
                Ok(result) => {
                    let n = result.to_number();
                    if n < 0.0 {
                        Ordering::Less
                    } else if n > 0.0 {
                        Ordering::Greater
                    } else {
                        Ordering::Equal
                    }
                }
                Err(e) => {
                    *error.borrow_mut() = Some(e);
                    Ordering::Equal
                }
            },
            None => a.to_js_string().cmp(&b.to_js_string()),
        }
    };
    let sorted = merge_sort(std::mem::take(items), &compare);
    *items = sorted;
}

fn merge_sort(items: Vec<Value>, compare: &dyn Fn(&Value, &Value) -> Ordering) -> Vec<Value> {
    if items.len() <= 1 {
        return items;
    }
    let mut left = items;
    let right = left.split_off(left.len() / 2);
    let (left, right) = (merge_sort(left, compare), merge_sort(right, compare));
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut right = right.into_iter().peekable();
    for item in left {
        while let Some(next) = right.peek() {
            if compare(next, &item) == Ordering::Less {
                merged.extend(right.next());
            } else {
                break;
            }
        }
        merged.push(item);
    }
    merged.extend(right);
    merged
}

fn string_method(s: &str, name: &str, args: &[Value]) -> EvalResult<Value> {
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len() as f64;
    let text = |i: usize| arg(args, i).to_js_string();
    Ok(match name {
        "toUpperCase" => Value::string(s.to_uppercase()),
        "toLowerCase" => Value::string(s.to_lowercase()),
        "trim" => Value::string(s.trim()),
        "trimStart" => Value::string(s.trim_start()),
        "trimEnd" => Value::string(s.trim_end()),
        "split" => match args.first().map(Value::unwrapped) {
            None | Some(Value::Undefined) => Value::array(vec![Value::string(s)]),
            Some(Value::RegExp(re)) => Value::array(re.split(s).map(Value::string).collect()),
            Some(sep) => {
                let sep = sep.to_js_string();
                if sep.is_empty() {
                    Value::array(chars.iter().map(|c| Value::string(c.to_string())).collect())
                } else {
                    Value::array(s.split(sep.as_str()).map(Value::string).collect())
                }
            }
        },
        "includes" => Value::Bool(s.contains(text(0).as_str())),
        "startsWith" => Value::Bool(s.starts_with(text(0).as_str())),
        "endsWith" => Value::Bool(s.ends_with(text(0).as_str())),
        "indexOf" => match s.find(text(0).as_str()) {
            Some(byte) => Value::from(s[..byte].chars().count()),
            None => Value::from(-1),
        },
        "slice" | "substring" => {
            let (mut start, mut end) = slice_bounds(args, len);
            if name == "substring" {
                let clamp = |v: Value| {
                    let n = v.to_number();
                    if n.is_nan() { 0 } else { n.clamp(0.0, len) as usize }
                };
                start = clamp(arg(args, 0));
                end = match args.get(1) {
                    Some(Value::Undefined) | None => chars.len(),
                    Some(v) => clamp(v.clone()),
                };
                if start > end {
                    std::mem::swap(&mut start, &mut end);
                }
            }
            Value::string(chars[start..end.max(start)].iter().collect::<String>())
        }
        "replace" | "replaceAll" => {
            let replacement = text(1);
            match arg(args, 0).unwrapped() {
                Value::RegExp(re) => {
                    if name == "replaceAll" {
                        Value::string(re.replace_all(s, replacement.as_str()))
                    } else {
                        Value::string(re.replace(s, replacement.as_str()))
                    }
                }
                pattern => {
                    let pattern = pattern.to_js_string();
                    if name == "replaceAll" {
                        Value::string(s.replace(pattern.as_str(), &replacement))
                    } else {
                        Value::string(s.replacen(pattern.as_str(), &replacement, 1))
                    }
                }
            }
        }
        "repeat" => {
            let count = arg(args, 0).to_number();
            if !(0.0..=1e6).contains(&count) {
                return Err(EvalError::Type(format!("invalid repeat count {}", format_number(count))));
            }
            Value::string(s.repeat(count as usize))
        }
        "padStart" | "padEnd" => {
            let target = arg(args, 0).to_number().max(0.0) as usize;
            let fill = match args.get(1) {
                Some(Value::Undefined) | None => " ".to_string(),
                Some(v) => v.to_js_string(),
            };
            if target <= chars.len() || fill.is_empty() {
                Value::string(s)
            } else {
                let padding: String = fill.chars().cycle().take(target - chars.len()).collect();
                if name == "padStart" {
                    Value::string(format!("{}{}", padding, s))
                } else {
                    Value::string(format!("{}{}", s, padding))
                }
            }
        }
        "charAt" | "at" => {
            let index = arg(args, 0).to_number();
            let index = if index.is_nan() { 0.0 } else { index.trunc() };
            let index = if name == "at" && index < 0.0 { len + index } else { index };
            match chars.get(index as usize) {
                Some(c) if index >= 0.0 => Value::string(c.to_string()),
                _ if name == "charAt" => Value::string(""),
                _ => Value::Undefined,
            }
        }
        "concat" => Value::string(format!(
            "{}{}",
            s,
            args.iter().map(Value::to_js_string).collect::<String>()
        )),
        _ => Value::string(s),
    })
}

fn collection_method(receiver: &Value, name: &str, args: &[Value]) -> EvalResult<Value> {
    let key = arg(args, 0);
    if let Value::Reactive(r) = receiver {
        match name {
            "set" => {
                r.map_insert(key, arg(args, 1))?;
                return Ok(receiver.clone());
            }
            "add" => {
                r.set_add(key)?;
                return Ok(receiver.clone());
            }
            "delete" => return Ok(Value::Bool(r.collection_delete(&key))),
            "clear" => {
                r.collection_clear();
                return Ok(Value::Undefined);
            }
            "get" => return Ok(r.map_get(&key)),
            _ => {}
        }
    }

    match receiver.unwrapped() {
        Value::Map(entries) => Ok(match name {
            "get" => entries
                .borrow()
                .iter()
                .find(|(k, _)| k.same_value(&key))
                .map(|(_, v)| v.clone())
                .unwrap_or_default(),
            "set" => {
                let value = arg(args, 1).unwrapped();
                let key = key.unwrapped();
                let mut entries = entries.borrow_mut();
                match entries.iter_mut().find(|(k, _)| k.same_value(&key)) {
                    Some(slot) => slot.1 = value,
                    None => entries.push((key, value)),
                }
                receiver.clone()
            }
            "has" => Value::Bool(entries.borrow().iter().any(|(k, _)| k.same_value(&key))),
            "delete" => {
                let mut entries = entries.borrow_mut();
                let before = entries.len();
                entries.retain(|(k, _)| !k.same_value(&key));
                Value::Bool(before != entries.len())
            }
            "clear" => {
                entries.borrow_mut().clear();
                Value::Undefined
            }
            "keys" => Value::array(entries.borrow().iter().map(|(k, _)| k.clone()).collect()),
            "values" => Value::array(entries.borrow().iter().map(|(_, v)| v.clone()).collect()),
            "entries" => Value::array(iterate(&receiver.unwrapped())?),
            "forEach" => {
                let f = callback(args, name)?;
                let snapshot = entries.borrow().clone();
                for (k, v) in snapshot {
                    call_function(&f, &[v, k, receiver.clone()])?;
                }
                Value::Undefined
            }
            _ => Value::Undefined,
        }),
        Value::Set(items) => Ok(match name {
            "add" => {
                let key = key.unwrapped();
                if !items.borrow().iter().any(|v| v.same_value(&key)) {
                    items.borrow_mut().push(key);
                }
                receiver.clone()
            }
            "has" => Value::Bool(items.borrow().iter().any(|v| v.same_value(&key))),
            "delete" => {
                let mut items = items.borrow_mut();
                let before = items.len();
                items.retain(|v| !v.same_value(&key));
                Value::Bool(before != items.len())
            }
            "clear" => {
                items.borrow_mut().clear();
                Value::Undefined
            }
            "values" => Value::array(items.borrow().clone()),
            "forEach" => {
                let f = callback(args, name)?;
                let snapshot = items.borrow().clone();
                for v in snapshot {
                    call_function(&f, &[v.clone(), v, receiver.clone()])?;
                }
                Value::Undefined
            }
            _ => Value::Undefined,
        }),
        _ => Ok(Value::Undefined),
    }
}

/// `key in object`.
pub fn has_property(object: &Value, key: &Value) -> EvalResult<bool> {
    let key = property_key(key);
    Ok(match object.unwrapped() {
        Value::Object(record) => record.borrow().contains_key(&key),
        Value::Array(items) => key == "length" || crate::reactive::parse_index(&key).is_some_and(|i| i < items.borrow().len()),
        Value::Map(_) | Value::Set(_) => key == "size",
        other => return Err(EvalError::Type(format!("cannot use 'in' on {}", other.type_of()))),
    })
}

/// `value instanceof Ctor` for the built-in constructors.
pub fn instance_of(value: &Value, constructor: &Value) -> EvalResult<bool> {
    let name = match constructor {
        Value::Function(f) => f.name().to_string(),
        other => return Err(EvalError::Type(format!("right-hand side of instanceof is {}", other.type_of()))),
    };
    Ok(match (name.as_str(), value.unwrapped()) {
        ("Array", Value::Array(_)) | ("Map", Value::Map(_)) | ("Set", Value::Set(_)) => true,
        ("Date", Value::Date(_)) | ("Error", Value::Error(_)) | ("RegExp", Value::RegExp(_)) => true,
        ("Object", v) => !matches!(v, Value::Undefined | Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_int_and_float() {
        assert_eq!(parse_int("42px", None), 42.0);
        assert_eq!(parse_int("-0x1f", None), -31.0);
        assert_eq!(parse_int("101", Some(&Value::from(2))), 5.0);
        assert!(parse_int("px", None).is_nan());
        assert_eq!(parse_float("3.5e2abc"), 350.0);
        assert_eq!(parse_float("-Infinity"), f64::NEG_INFINITY);
        assert!(parse_float("abc").is_nan());
    }

    #[test]
    fn test_merge_sort_is_stable() {
        let mut items: Vec<Value> = vec!["b1", "a", "b2", "c"]
            .into_iter()
            .map(Value::from)
            .collect();
        let error = RefCell::new(None);
        let by_first_char = Value::function("cmp", |args| {
            let a = arg(args, 0).to_js_string();
            let b = arg(args, 1).to_js_string();
            Ok(Value::from(a.chars().next().cmp(&b.chars().next()) as i32))
        });
        sort_values(&mut items, Some(&by_first_char), &error);
        let order: Vec<String> = items.iter().map(Value::to_js_string).collect();
        assert_eq!(order, vec!["a", "b1", "b2", "c"]);
    }

    #[test]
    fn test_string_methods() {
        let s = "Hello World";
        assert_eq!(string_method(s, "slice", &[Value::from(-5)]).unwrap().to_js_string(), "World");
        assert_eq!(string_method(s, "padStart", &[Value::from(13), Value::from("*")]).unwrap().to_js_string(), "**Hello World");
        assert_eq!(string_method(s, "indexOf", &[Value::from("World")]).unwrap().to_number(), 6.0);
        assert_eq!(string_method(s, "charAt", &[Value::from(1)]).unwrap().to_js_string(), "e");
    }

    #[test]
    fn test_json_stringify_indent() {
        let value = Value::from(serde_json::json!({ "a": [1] }));
        assert_eq!(json_stringify(&value, "").unwrap(), r#"{"a":[1]}"#);
        assert_eq!(json_stringify(&value, " ").unwrap(), "{\n \"a\": [\n  1\n ]\n}");
    }
}
