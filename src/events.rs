//! Per-application event listener table and dispatch.
//!
//! Listeners are keyed by document node. Dispatch walks capture listeners
//! from the root down to the target, then bubble listeners from the target
//! back up, honouring stop-propagation after each node.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use markup5ever_rcdom::Handle;

use crate::diagnostics::Diagnostics;
use crate::dom;
use crate::error::{EvalResult, ERR_EVALUATION};
use crate::value::Value;

pub struct Event {
    kind: String,
    target: Handle,
    key: Option<String>,
    detail: Value,
    current: RefCell<Option<Handle>>,
    stopped: Cell<bool>,
    prevented: Cell<bool>,
}

impl Event {
    pub fn new(kind: &str, target: &Handle) -> Self {
        Self {
            kind: kind.to_string(),
            target: target.clone(),
            key: None,
            detail: Value::Undefined,
            current: RefCell::new(None),
            stopped: Cell::new(false),
            prevented: Cell::new(false),
        }
    }

    /// Keyboard key, as in `KeyboardEvent.key` (`"Enter"`, `"Escape"`, ...).
    pub fn with_key(mut self, key: &str) -> Self {
        self.key = Some(key.to_string());
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn target(&self) -> &Handle {
        &self.target
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn current_target(&self) -> Option<Handle> {
        self.current.borrow().clone()
    }

    pub fn stop_propagation(&self) {
        self.stopped.set(true);
    }

    pub fn prevent_default(&self) {
        self.prevented.set(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.get()
    }

    pub fn default_prevented(&self) -> bool {
        self.prevented.get()
    }

    /// The `$event` object handed to template handlers.
    pub fn to_value(self: &Rc<Self>) -> Value {
        let target_value = element_value(&self.target);
        let prevent = self.clone();
        let stop = self.clone();
        let value = Value::object(vec![
            ("type", Value::string(&self.kind)),
            (
                "key",
                self.key.as_deref().map(Value::string).unwrap_or_default(),
            ),
            ("detail", self.detail.clone()),
            ("target", target_value),
            (
                "preventDefault",
                Value::function("preventDefault", move |_| {
                    prevent.prevent_default();
                    Ok(Value::Undefined)
                }),
            ),
            (
                "stopPropagation",
                Value::function("stopPropagation", move |_| {
                    stop.stop_propagation();
                    Ok(Value::Undefined)
                }),
            ),
        ]);
        value.mark_raw();
        value
    }
}

/// Read-only snapshot of an element, as seen by template functions.
pub fn element_value(element: &Handle) -> Value {
    let value = Value::object(vec![
        (
            "value",
            Value::string(dom::get_attribute(element, "value").unwrap_or_default()),
        ),
        ("checked", Value::Bool(dom::has_attribute(element, "checked"))),
        (
            "tagName",
            Value::string(dom::tag_name(element).unwrap_or_default().to_uppercase()),
        ),
        ("id", Value::string(dom::get_attribute(element, "id").unwrap_or_default())),
        ("textContent", Value::string(dom::text_content(element))),
    ]);
    value.mark_raw();
    value
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    pub capture: bool,
    pub once: bool,
    pub self_only: bool,
    pub stop: bool,
    pub prevent: bool,
    /// Accepted `Event::key` values; empty accepts every event.
    pub keys: Vec<String>,
}

impl ListenerOptions {
    /// Map a key modifier (`enter`, `esc`, ...) to the key values it accepts.
    pub fn key_values(modifier: &str) -> Option<&'static [&'static str]> {
        Some(match modifier {
            "enter" => &["Enter"],
            "esc" => &["Escape", "Esc"],
            "space" => &[" ", "Spacebar"],
            "tab" => &["Tab"],
            "up" => &["ArrowUp", "Up"],
            "down" => &["ArrowDown", "Down"],
            "left" => &["ArrowLeft", "Left"],
            "right" => &["ArrowRight", "Right"],
            "delete" => &["Delete", "Backspace", "Del"],
            _ => return None,
        })
    }
}

pub type Handler = Rc<dyn Fn(&Rc<Event>) -> EvalResult<()>>;

struct Listener {
    id: u64,
    kind: String,
    options: ListenerOptions,
    handler: Handler,
}

#[derive(Default)]
pub struct EventTable {
    listeners: RefCell<HashMap<usize, Vec<Rc<Listener>>>>,
    next_id: Cell<u64>,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, node: &Handle, kind: &str, options: ListenerOptions, handler: Handler) -> u64 {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        self.listeners
            .borrow_mut()
            .entry(dom::node_key(node))
            .or_default()
            .push(Rc::new(Listener {
                id,
                kind: kind.to_string(),
                options,
                handler,
            }));
        id
    }

    pub fn remove(&self, node: &Handle, id: u64) {
        let mut listeners = self.listeners.borrow_mut();
        let key = dom::node_key(node);
        if let Some(list) = listeners.get_mut(&key) {
            list.retain(|l| l.id != id);
            if list.is_empty() {
                listeners.remove(&key);
            }
        }
    }

    pub fn remove_node(&self, node: &Handle) {
        self.listeners.borrow_mut().remove(&dom::node_key(node));
    }

    pub fn listener_count(&self, node: &Handle) -> usize {
        self.listeners
            .borrow()
            .get(&dom::node_key(node))
            .map_or(0, Vec::len)
    }

    fn listeners_for(&self, node: &Handle, kind: &str, capture: bool) -> Vec<Rc<Listener>> {
        self.listeners
            .borrow()
            .get(&dom::node_key(node))
            .map(|list| {
                list.iter()
                    .filter(|l| l.kind == kind && l.options.capture == capture)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deliver `event`. Returns false when a listener prevented the default
    /// action.
    pub fn dispatch(&self, event: &Rc<Event>, diagnostics: &Diagnostics) -> bool {
        let mut path = vec![event.target.clone()];
        let mut current = dom::parent(&event.target);
        while let Some(node) = current {
            current = dom::parent(&node);
            path.push(node);
        }

        'capture: for node in path.iter().rev() {
            self.invoke(node, event, true, diagnostics);
            if event.is_stopped() {
                break 'capture;
            }
        }
        if !event.is_stopped() {
            for node in &path {
                self.invoke(node, event, false, diagnostics);
                if event.is_stopped() {
                    break;
                }
            }
        }
        event.current.borrow_mut().take();
        !event.default_prevented()
    }

    fn invoke(&self, node: &Handle, event: &Rc<Event>, capture: bool, diagnostics: &Diagnostics) {
        let listeners = self.listeners_for(node, &event.kind, capture);
        if listeners.is_empty() {
            return;
        }
        *event.current.borrow_mut() = Some(node.clone());
        for listener in listeners {
            let options = &listener.options;
            if options.self_only && !dom::same_node(node, &event.target) {
                continue;
            }
            if !options.keys.is_empty()
                && !event.key().is_some_and(|k| options.keys.iter().any(|want| want == k))
            {
                continue;
            }
            if options.prevent {
                event.prevent_default();
            }
            if options.stop {
                event.stop_propagation();
            }
            if options.once {
                self.remove(node, listener.id);
            }
            if let Err(e) = (listener.handler)(event) {
                diagnostics.error(ERR_EVALUATION, format!("`{}` handler failed: {}", event.kind, e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> (Handle, Handle, Handle) {
        let outer = dom::parse_fragment("<div><p><button>go</button></p></div>")
            .unwrap()
            .remove(0);
        let p = dom::children(&outer).remove(0);
        let button = dom::children(&p).remove(0);
        (outer, p, button)
    }

    fn recorder(log: &Rc<RefCell<Vec<String>>>, label: &str) -> Handler {
        let log = log.clone();
        let label = label.to_string();
        Rc::new(move |_event: &Rc<Event>| -> EvalResult<()> {
            log.borrow_mut().push(label.clone());
            Ok(())
        })
    }

    #[test]
    fn test_capture_then_bubble_order() {
        let (outer, p, button) = tree();
        let table = EventTable::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let capture = ListenerOptions {
            capture: true,
            ..Default::default()
        };
        table.add(&outer, "click", capture, recorder(&log, "outer-capture"));
        table.add(&outer, "click", ListenerOptions::default(), recorder(&log, "outer"));
        table.add(&p, "click", ListenerOptions::default(), recorder(&log, "p"));
        table.add(&button, "click", ListenerOptions::default(), recorder(&log, "button"));

        let event = Rc::new(Event::new("click", &button));
        assert!(table.dispatch(&event, &Diagnostics::new()));
        assert_eq!(*log.borrow(), vec!["outer-capture", "button", "p", "outer"]);
    }

    #[test]
    fn test_stop_prevent_once_and_self() {
        let (outer, p, button) = tree();
        let table = EventTable::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let stop = ListenerOptions {
            stop: true,
            prevent: true,
            ..Default::default()
        };
        table.add(&p, "click", stop, recorder(&log, "p"));
        table.add(&outer, "click", ListenerOptions::default(), recorder(&log, "outer"));
        let once_self = ListenerOptions {
            once: true,
            self_only: true,
            ..Default::default()
        };
        table.add(&button, "click", once_self, recorder(&log, "button"));

        let event = Rc::new(Event::new("click", &button));
        assert!(!table.dispatch(&event, &Diagnostics::new()));
        assert_eq!(*log.borrow(), vec!["button", "p"]);
        assert_eq!(table.listener_count(&button), 0);

        log.borrow_mut().clear();
        table.dispatch(&Rc::new(Event::new("click", &p)), &Diagnostics::new());
        assert_eq!(*log.borrow(), vec!["p"]);
    }

    #[test]
    fn test_key_filters() {
        let (_outer, _p, button) = tree();
        let table = EventTable::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let enter = ListenerOptions {
            keys: vec!["Enter".to_string()],
            ..Default::default()
        };
        table.add(&button, "keyup", enter, recorder(&log, "enter"));

        table.dispatch(&Rc::new(Event::new("keyup", &button).with_key("a")), &Diagnostics::new());
        assert!(log.borrow().is_empty());
        table.dispatch(&Rc::new(Event::new("keyup", &button).with_key("Enter")), &Diagnostics::new());
        assert_eq!(*log.borrow(), vec!["enter"]);
    }

    #[test]
    fn test_handler_errors_are_reported() {
        let (_outer, _p, button) = tree();
        let table = EventTable::new();
        let diagnostics = Diagnostics::new();
        table.add(
            &button,
            "click",
            ListenerOptions::default(),
            Rc::new(|_event: &Rc<Event>| -> EvalResult<()> {
                Err(crate::error::EvalError::Custom("boom".into()))
            }),
        );
        table.dispatch(&Rc::new(Event::new("click", &button)), &diagnostics);
        assert_eq!(diagnostics.count(ERR_EVALUATION), 1);
    }
}
