//! Mutation-interception wrapper.
//!
//! There is no transparent property interception in Rust, so state is read
//! and written through an explicit handle: [`Reactive`] pairs a raw container
//! with the path it was reached by, and every write, delete or mutating call
//! made through it reports a change path to its [`Observer`].
//!
//! Wrappers are memoized per `(container id, path)` for as long as something
//! holds them. The cache keeps weak references, drops dead entries as it
//! grows, and is cleared when the owning scope is disposed.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::error::{EvalError, EvalResult};
use crate::path::child_path;
use crate::value::{format_number, Value};

/// Array methods that mutate in place and report the array's own path.
pub const ARRAY_MUTATORS: &[&str] = &["push", "pop", "shift", "unshift", "splice", "sort", "reverse"];

const MIN_PRUNE_AT: usize = 16;

pub struct Observer {
    cache: RefCell<HashMap<(u64, String), Weak<Reactive>>>,
    /// Cache size that triggers the next sweep of dead entries.
    prune_at: Cell<usize>,
    on_change: Box<dyn Fn(&str)>,
}

impl Observer {
    pub fn new(on_change: impl Fn(&str) + 'static) -> Rc<Self> {
        Rc::new(Self {
            cache: RefCell::new(HashMap::new()),
            prune_at: Cell::new(MIN_PRUNE_AT),
            on_change: Box::new(on_change),
        })
    }

    pub fn cached_wrappers(&self) -> usize {
        self.prune();
        self.cache.borrow().len()
    }

    fn prune(&self) {
        let mut cache = self.cache.borrow_mut();
        cache.retain(|_, wrapper| wrapper.strong_count() > 0);
        self.prune_at.set((cache.len() * 2).max(MIN_PRUNE_AT));
    }

    pub fn dispose(&self) {
        self.cache.borrow_mut().clear();
    }
}

/// Wrap `value` so that mutations through it report paths below `root_path`.
///
/// Primitives, raw-marked containers, dates, regexps, errors, functions and
/// values that are already wrappers come back unchanged.
pub fn wrap(value: Value, observer: &Rc<Observer>, root_path: &str) -> Value {
    let id = match &value {
        Value::Array(_) | Value::Object(_) | Value::Map(_) | Value::Set(_) if !value.is_raw() => {
            match value.container_id() {
                Some(id) => id,
                None => return value,
            }
        }
        _ => return value,
    };

    let key = (id, root_path.to_string());
    let existing = observer.cache.borrow().get(&key).and_then(Weak::upgrade);
    if let Some(existing) = existing {
        return Value::Reactive(existing);
    }

    if observer.cache.borrow().len() >= observer.prune_at.get() {
        observer.prune();
    }
    let reactive = Rc::new(Reactive {
        target: value,
        path: root_path.to_string(),
        observer: Rc::downgrade(observer),
    });
    observer.cache.borrow_mut().insert(key, Rc::downgrade(&reactive));
    Value::Reactive(reactive)
}

pub struct Reactive {
    target: Value,
    path: String,
    observer: Weak<Observer>,
}

impl Reactive {
    pub fn target(&self) -> &Value {
        &self.target
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn notify(&self, path: &str) {
        if let Some(observer) = self.observer.upgrade() {
            (observer.on_change)(path);
        }
    }

    fn rewrap(&self, child: Value, key: &str, array_like: bool) -> Value {
        match self.observer.upgrade() {
            Some(observer) => wrap(child.unwrapped(), &observer, &child_path(&self.path, key, array_like)),
            None => child.unwrapped(),
        }
    }

    /// Read a property. Container-valued children come back wrapped at the
    /// child path.
    pub fn get(&self, key: &str) -> Value {
        match &self.target {
            Value::Array(items) => {
                if key == "length" {
                    return Value::from(items.borrow().len());
                }
                let child = match parse_index(key) {
                    Some(i) => items.borrow().get(i).cloned(),
                    None => None,
                };
                match child {
                    Some(child) => self.rewrap(child, key, true),
                    None => Value::Undefined,
                }
            }
            Value::Object(record) => {
                let child = record.borrow().get(key).cloned();
                match child {
                    Some(child) => self.rewrap(child, key, false),
                    None => Value::Undefined,
                }
            }
            Value::Map(entries) if key == "size" => Value::from(entries.borrow().len()),
            Value::Set(items) if key == "size" => Value::from(items.borrow().len()),
            _ => Value::Undefined,
        }
    }

    /// Write a property; reports the child path only when the value changed.
    pub fn set(&self, key: &str, value: Value) -> EvalResult<()> {
        let value = value.unwrapped();
        match &self.target {
            Value::Array(items) => {
                if key == "length" {
                    let new_len = value.to_number();
                    if new_len < 0.0 || new_len.fract() != 0.0 || new_len.is_nan() {
                        return Err(EvalError::Type(format!("invalid array length {}", format_number(new_len))));
                    }
                    let new_len = new_len as usize;
                    let changed = items.borrow().len() != new_len;
                    if changed {
                        items.borrow_mut().resize(new_len, Value::Undefined);
                        self.notify(&self.path);
                    }
                    return Ok(());
                }
                let index = parse_index(key).ok_or_else(|| {
                    EvalError::InvalidAssignment(format!("array index `{}`", key))
                })?;
                let changed = {
                    let mut items = items.borrow_mut();
                    if index >= items.len() {
                        items.resize(index + 1, Value::Undefined);
                        items[index] = value;
                        true
                    } else if items[index].same_value(&value) {
                        false
                    } else {
                        items[index] = value;
                        true
                    }
                };
                if changed {
                    self.notify(&child_path(&self.path, key, true));
                }
                Ok(())
            }
            Value::Object(record) => {
                let changed = {
                    let mut record = record.borrow_mut();
                    match record.get(key) {
                        Some(old) if old.same_value(&value) => false,
                        _ => {
                            record.insert(key.to_string(), value);
                            true
                        }
                    }
                };
                if changed {
                    self.notify(&child_path(&self.path, key, false));
                }
                Ok(())
            }
            other => Err(EvalError::InvalidAssignment(format!(
                "cannot set `{}` on {}",
                key,
                other.type_of()
            ))),
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = match &self.target {
            Value::Object(record) => record.borrow_mut().shift_remove(key).is_some(),
            Value::Array(items) => match parse_index(key) {
                Some(i) if i < items.borrow().len() => {
                    items.borrow_mut()[i] = Value::Undefined;
                    true
                }
                _ => false,
            },
            _ => false,
        };
        let array_like = matches!(self.target, Value::Array(_));
        self.notify(&child_path(&self.path, key, array_like));
        removed
    }

    /// Run an in-place array mutation and report the array's path.
    pub fn mutate_array<R>(&self, f: impl FnOnce(&mut Vec<Value>) -> R) -> EvalResult<R> {
        match &self.target {
            Value::Array(items) => {
                let result = f(&mut items.borrow_mut());
                self.notify(&self.path);
                Ok(result)
            }
            other => Err(EvalError::Type(format!("{} is not an array", other.type_of()))),
        }
    }

    /// Dispatch one of [`ARRAY_MUTATORS`] other than `sort`, which needs a
    /// comparator from the interpreter. Returns `None` for other names.
    pub fn call_mutator(&self, method: &str, args: &[Value]) -> Option<EvalResult<Value>> {
        if method == "sort" || !ARRAY_MUTATORS.contains(&method) {
            return None;
        }
        Some(self.mutate_array(|items| apply_mutator(items, method, args)))
    }

    /// Wrap a member of this container at the container's own path.
    pub fn wrap_member(&self, value: Value) -> Value {
        match self.observer.upgrade() {
            Some(observer) => wrap(value.unwrapped(), &observer, &self.path),
            None => value.unwrapped(),
        }
    }

    pub fn map_insert(&self, key: Value, value: Value) -> EvalResult<()> {
        let (key, value) = (key.unwrapped(), value.unwrapped());
        match &self.target {
            Value::Map(entries) => {
                let changed = {
                    let mut entries = entries.borrow_mut();
                    match entries.iter_mut().find(|(k, _)| k.same_value(&key)) {
                        Some((_, existing)) if existing.same_value(&value) => false,
                        Some((_, existing)) => {
                            *existing = value;
                            true
                        }
                        None => {
                            entries.push((key, value));
                            true
                        }
                    }
                };
                if changed {
                    self.notify(&self.path);
                }
                Ok(())
            }
            other => Err(EvalError::Type(format!("{} is not a Map", other.type_of()))),
        }
    }

    pub fn set_add(&self, value: Value) -> EvalResult<()> {
        let value = value.unwrapped();
        match &self.target {
            Value::Set(items) => {
                let added = {
                    let mut items = items.borrow_mut();
                    if items.iter().any(|v| v.same_value(&value)) {
                        false
                    } else {
                        items.push(value);
                        true
                    }
                };
                if added {
                    self.notify(&self.path);
                }
                Ok(())
            }
            other => Err(EvalError::Type(format!("{} is not a Set", other.type_of()))),
        }
    }

    pub fn collection_delete(&self, key: &Value) -> bool {
        let key = key.unwrapped();
        let removed = match &self.target {
            Value::Map(entries) => {
                let mut entries = entries.borrow_mut();
                let before = entries.len();
                entries.retain(|(k, _)| !k.same_value(&key));
                before != entries.len()
            }
            Value::Set(items) => {
                let mut items = items.borrow_mut();
                let before = items.len();
                items.retain(|v| !v.same_value(&key));
                before != items.len()
            }
            _ => false,
        };
        if removed {
            self.notify(&self.path);
        }
        removed
    }

    pub fn collection_clear(&self) {
        let cleared = match &self.target {
            Value::Map(entries) => {
                let had = !entries.borrow().is_empty();
                entries.borrow_mut().clear();
                had
            }
            Value::Set(items) => {
                let had = !items.borrow().is_empty();
                items.borrow_mut().clear();
                had
            }
            _ => false,
        };
        if cleared {
            self.notify(&self.path);
        }
    }

    /// Map values come back wrapped at the map's own path, since map entries
    /// have no property path of their own.
    pub fn map_get(&self, key: &Value) -> Value {
        let key = key.unwrapped();
        let found = match &self.target {
            Value::Map(entries) => entries
                .borrow()
                .iter()
                .find(|(k, _)| k.same_value(&key))
                .map(|(_, v)| v.clone()),
            _ => None,
        };
        match found {
            Some(v) => self.wrap_member(v),
            None => Value::Undefined,
        }
    }
}

/// In-place array mutation shared by wrapped and raw arrays. `reverse`
/// yields undefined; callers return the receiver.
pub(crate) fn apply_mutator(items: &mut Vec<Value>, method: &str, args: &[Value]) -> Value {
    let args: Vec<Value> = args.iter().map(Value::unwrapped).collect();
    match method {
        "push" => {
            items.extend(args);
            Value::from(items.len())
        }
        "pop" => items.pop().unwrap_or_default(),
        "shift" => {
            if items.is_empty() {
                Value::Undefined
            } else {
                items.remove(0)
            }
        }
        "unshift" => {
            for (offset, value) in args.into_iter().enumerate() {
                items.insert(offset, value);
            }
            Value::from(items.len())
        }
        "splice" => {
            let len = items.len() as f64;
            let start = relative_index(args.first().map(Value::to_number).unwrap_or(0.0), len);
            let delete_count = match args.get(1) {
                Some(count) => {
                    let count = count.to_number();
                    if count.is_nan() { 0 } else { count.max(0.0) as usize }
                }
                None => items.len() - start,
            };
            let end = (start + delete_count).min(items.len());
            let inserted: Vec<Value> = args.iter().skip(2).cloned().collect();
            let removed: Vec<Value> = items.splice(start..end, inserted).collect();
            Value::array(removed)
        }
        "reverse" => {
            items.reverse();
            Value::Undefined
        }
        _ => Value::Undefined,
    }
}

pub(crate) fn parse_index(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    key.parse::<usize>().ok()
}

/// Clamp a possibly negative index into `0..=len`.
pub(crate) fn relative_index(index: f64, len: f64) -> usize {
    let index = if index.is_nan() { 0.0 } else { index.trunc() };
    let resolved = if index < 0.0 { (len + index).max(0.0) } else { index.min(len) };
    resolved as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recording_observer() -> (Rc<Observer>, Rc<RefCell<Vec<String>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let observer = Observer::new(move |path| sink.borrow_mut().push(path.to_string()));
        (observer, log)
    }

    fn as_reactive(value: &Value) -> Rc<Reactive> {
        match value {
            Value::Reactive(r) => r.clone(),
            other => panic!("expected wrapper, got {:?}", other),
        }
    }

    #[test]
    fn test_wrapper_is_memoized_per_target_and_path() {
        let (observer, _) = recording_observer();
        let state = Value::from(json!({ "user": { "name": "Ada" } }));
        let a = as_reactive(&wrap(state.clone(), &observer, "state"));
        let b = as_reactive(&wrap(state.clone(), &observer, "state"));
        assert!(Rc::ptr_eq(&a, &b));

        let user_1 = as_reactive(&a.get("user"));
        let user_2 = as_reactive(&b.get("user"));
        assert!(Rc::ptr_eq(&user_1, &user_2));
        assert_eq!(user_1.path(), "state.user");

        let elsewhere = as_reactive(&wrap(state, &observer, "other"));
        assert!(!Rc::ptr_eq(&a, &elsewhere));
    }

    #[test]
    fn test_released_wrappers_leave_the_cache() {
        let (observer, _) = recording_observer();
        let kept = wrap(Value::from(json!([0])), &observer, "kept");
        for i in 0..200 {
            let replaced = wrap(Value::from(json!([{ "n": i }])), &observer, "items");
            if let Value::Reactive(r) = &replaced {
                r.get("0");
            }
        }
        assert_eq!(observer.cached_wrappers(), 1);
        drop(kept);
        assert_eq!(observer.cached_wrappers(), 0);
    }

    #[test]
    fn test_unwrappable_values_pass_through() {
        let (observer, _) = recording_observer();
        assert!(!wrap(Value::from(1), &observer, "n").is_reactive());
        assert!(!wrap(Value::Date(0.0), &observer, "d").is_reactive());

        let raw = Value::from(json!({ "a": 1 }));
        raw.mark_raw();
        assert!(!wrap(raw, &observer, "r").is_reactive());

        let wrapped = wrap(Value::from(json!([1])), &observer, "xs");
        let again = wrap(wrapped.clone(), &observer, "ys");
        assert_eq!(as_reactive(&again).path(), "xs");
    }

    #[test]
    fn test_writes_report_child_paths_only_on_change() {
        let (observer, log) = recording_observer();
        let root = as_reactive(&wrap(Value::from(json!({ "items": [{ "n": 1 }] })), &observer, "state"));
        let item = as_reactive(&as_reactive(&root.get("items")).get("0"));
        assert_eq!(item.path(), "state.items[0]");

        item.set("n", Value::from(1)).unwrap();
        assert!(log.borrow().is_empty());

        item.set("n", Value::from(2)).unwrap();
        assert_eq!(*log.borrow(), vec!["state.items[0].n".to_string()]);
    }

    #[test]
    fn test_delete_always_reports() {
        let (observer, log) = recording_observer();
        let root = as_reactive(&wrap(Value::from(json!({})), &observer, "cfg"));
        assert!(!root.delete("missing"));
        assert_eq!(*log.borrow(), vec!["cfg.missing".to_string()]);
    }

    #[test]
    fn test_array_mutators_report_the_array_path() {
        let (observer, log) = recording_observer();
        let root = as_reactive(&wrap(Value::from(json!({ "list": [1, 2] })), &observer, "state"));
        let list = as_reactive(&root.get("list"));

        let len = list.call_mutator("push", &[Value::from(3)]).unwrap().unwrap();
        assert_eq!(len.to_number(), 3.0);
        let removed = list.call_mutator("splice", &[Value::from(0), Value::from(1)]).unwrap().unwrap();
        assert_eq!(removed.to_json(), json!([1]));
        assert!(list.call_mutator("map", &[]).is_none());

        assert_eq!(*log.borrow(), vec!["state.list".to_string(), "state.list".to_string()]);
        assert_eq!(list.target().to_json(), json!([2, 3]));
    }

    #[test]
    fn test_dispose_clears_cache() {
        let (observer, _) = recording_observer();
        let held = wrap(Value::from(json!([])), &observer, "a");
        assert_eq!(observer.cached_wrappers(), 1);
        observer.dispose();
        assert_eq!(observer.cached_wrappers(), 0);
        assert!(held.is_reactive());
    }
}
