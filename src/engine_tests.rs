//! End-to-end behavior of a mounted application: batching, keyed lists,
//! conditional chains, change paths, watchers, computed cycles, events.

use std::cell::RefCell;
use std::rc::Rc;

use markup5ever_rcdom::Handle;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;

use crate::app::{App, AppBuilder};
use crate::component::Props;
use crate::directive::{Directive, DirectiveSource, DomUpdater};
use crate::dom;
use crate::error::{
    CompileError, EvalResult, ERR_ORPHAN_CONDITIONAL, WARN_CIRCULAR_COMPUTED, WARN_DUPLICATE_KEY,
};
use crate::node::RenderNode;
use crate::path::PathSet;
use crate::value::Value;

type Log = Rc<RefCell<Vec<String>>>;

/// `v-probe:name="expr"` logs `name` every time its updater runs.
struct Probe {
    name: String,
    reads: PathSet,
    log: Log,
}

impl DomUpdater for Probe {
    fn dependencies(&self) -> &PathSet {
        &self.reads
    }

    fn update(&self, _node: &Rc<RenderNode>, _forced: bool) -> EvalResult<()> {
        self.log.borrow_mut().push(self.name.clone());
        Ok(())
    }
}

fn with_probe(builder: AppBuilder, log: &Log) -> AppBuilder {
    let log = log.clone();
    builder.directive(
        "probe",
        Rc::new(move |source: &DirectiveSource<'_>| -> Result<Directive, CompileError> {
            let compiled = source.compile_value()?;
            Ok(Directive::new("probe").with_updater(Rc::new(Probe {
                name: source.syntax.arg.clone().unwrap_or_default(),
                reads: compiled.reads,
                log: log.clone(),
            })))
        }),
    )
}

fn mount(builder: AppBuilder, body: &str) -> App {
    let app = builder.build().unwrap();
    app.mount_html(&format!("<div id=app>{}</div>", body)).unwrap();
    app
}

fn element_children(node: &Handle) -> Vec<Handle> {
    dom::children(node).into_iter().filter(dom::is_element).collect()
}

fn list_root(app: &App) -> Handle {
    app.element_by_id("list").unwrap()
}

fn text(app: &App) -> String {
    app.root().map(|r| dom::text_content(r.dom())).unwrap_or_default()
}

#[test]
fn test_mutations_in_one_tick_share_one_pass() {
    let log: Log = Rc::default();
    let builder = with_probe(App::builder().data("a", 1).data("b", 2).data("c", 3), &log);
    let app = mount(builder, "<p v-probe:sum=\"a + b + c\"></p>");
    assert_eq!(*log.borrow(), vec!["sum"]);
    log.borrow_mut().clear();

    app.set("a", 10);
    app.set("b", 20);
    app.set("c", 30);
    app.set("a", 11);
    assert_eq!(app.tick(), 1);
    assert_eq!(*log.borrow(), vec!["sum"]);
    assert_eq!(app.tick(), 0);
}

#[test]
fn test_keyed_reorder_keeps_item_nodes() {
    let app = mount(
        App::builder().state(json!({ "items": [{ "id": "a" }, { "id": "b" }, { "id": "c" }] })),
        "<ul id=list><li v-for=\"item in items\" :key=\"item.id\">{{ item.id }}</li></ul>",
    );
    let before = element_children(&list_root(&app));
    assert_eq!(dom::text_content(&list_root(&app)), "abc");

    app.set(
        "items",
        Value::from(json!([{ "id": "c" }, { "id": "a" }, { "id": "b" }])),
    );
    app.tick();

    let after = element_children(&list_root(&app));
    assert_eq!(dom::text_content(&list_root(&app)), "cab");
    assert!(dom::same_node(&after[0], &before[2]));
    assert!(dom::same_node(&after[1], &before[0]));
    assert!(dom::same_node(&after[2], &before[1]));
}

#[test]
fn test_list_tracks_removal_and_insertion() {
    let app = mount(
        App::builder()
            .state(json!({ "items": ["x", "y", "z"] }))
            .method("drop_first", "() => items.shift()")
            .method("add", "(v) => items.push(v)"),
        "<ul id=list><li v-for=\"(item, i) in items\" :key=\"item\">{{ i }}{{ item }}</li></ul>",
    );
    let y = element_children(&list_root(&app)).remove(1);

    app.call("drop_first", &[]).unwrap();
    app.call("add", &[Value::string("w")]).unwrap();
    assert_eq!(app.tick(), 1);

    let items = element_children(&list_root(&app));
    assert_eq!(dom::text_content(&list_root(&app)), "0y1z2w");
    assert!(dom::same_node(&items[0], &y));
}

#[test]
fn test_item_mutation_updates_only_its_row() {
    let app = mount(
        App::builder()
            .state(json!({ "todos": [
                { "title": "a", "done": false },
                { "title": "b", "done": false }
            ] }))
            .method("finish", "(i) => todos[i].done = true"),
        "<ul id=list><li v-for=\"todo in todos\" :key=\"todo.title\">{{ todo.title }}:{{ todo.done }}</li></ul>",
    );
    assert_eq!(dom::text_content(&list_root(&app)), "a:falseb:false");
    app.call("finish", &[Value::from(1)]).unwrap();
    assert!(app.scope().changes().contains("todos[1].done"));
    app.tick();
    assert_eq!(dom::text_content(&list_root(&app)), "a:falseb:true");
}

#[test]
fn test_nested_push_records_list_path() {
    let log: Log = Rc::default();
    let builder = with_probe(
        App::builder()
            .state(json!({ "state": { "list": [1, 2], "name": "n" }, "other": 0 }))
            .method("append", "() => state.list.push(3)"),
        &log,
    );
    let app = mount(
        builder,
        concat!(
            "<p v-probe:list=\"state.list\"></p>",
            "<p v-probe:length=\"state.list.length\"></p>",
            "<p v-probe:state=\"state\"></p>",
            "<p v-probe:other=\"other\"></p>",
        ),
    );
    log.borrow_mut().clear();

    app.call("append", &[]).unwrap();
    let changes: Vec<String> = app.scope().changes().into_iter().collect();
    assert_eq!(changes, vec!["state.list"]);
    app.tick();
    assert_eq!(*log.borrow(), vec!["list", "length", "state"]);
    assert_eq!(app.get("state").to_json(), json!({ "list": [1, 2, 3], "name": "n" }));
}

#[test]
fn test_conditional_chain_renders_exactly_one_member() {
    let app = mount(
        App::builder().data("a", false).data("b", false),
        "<p v-if=\"a\">A</p><p v-else-if=\"b\">B</p><p v-else>C</p>",
    );
    assert_eq!(text(&app), "C");

    for (a, b, expected) in [
        (true, true, "A"),
        (true, false, "A"),
        (false, true, "B"),
        (false, false, "C"),
    ] {
        app.set("a", a);
        app.set("b", b);
        app.tick();
        let root = app.root().unwrap();
        assert_eq!(element_children(root.dom()).len(), 1, "a={} b={}", a, b);
        assert_eq!(text(&app), expected, "a={} b={}", a, b);
    }
}

#[test]
fn test_branch_content_stays_reactive() {
    let app = mount(
        App::builder().data("show", true).data("label", "one"),
        "<section v-if=\"show\"><b>{{ label }}</b></section><i v-else>hidden</i>",
    );
    assert_eq!(text(&app), "one");
    app.set("label", "two");
    app.tick();
    assert_eq!(text(&app), "two");
    app.set("show", false);
    app.tick();
    assert_eq!(text(&app), "hidden");
    app.set("show", true);
    app.tick();
    assert_eq!(text(&app), "two");
}

#[test]
fn test_orphan_else_fails_construction() {
    let app = App::builder().build().unwrap();
    let err = app.mount_html("<div id=app><p v-else>x</p></div>").unwrap_err();
    assert_eq!(err.code(), ERR_ORPHAN_CONDITIONAL);

    let err = app
        .mount_html("<div id=app><p v-if=\"a\"></p><p v-else></p><p v-else></p></div>")
        .unwrap_err();
    assert_eq!(err.code(), ERR_ORPHAN_CONDITIONAL);
}

#[test]
fn test_duplicate_keys_warn_once_per_run() {
    let app = mount(
        App::builder().state(json!({ "items": [{ "id": 1 }, { "id": 1 }, { "id": 2 }] })),
        "<ul id=list><li v-for=\"item in items\" :key=\"item.id\">{{ item.id }}</li></ul>",
    );
    assert_eq!(app.diagnostic_count(WARN_DUPLICATE_KEY), 1);
    assert_eq!(dom::text_content(&list_root(&app)), "112");

    app.set(
        "items",
        Value::from(json!([{ "id": 2 }, { "id": 2 }, { "id": 2 }, { "id": 3 }])),
    );
    app.tick();
    assert_eq!(app.diagnostic_count(WARN_DUPLICATE_KEY), 2);
    assert_eq!(dom::text_content(&list_root(&app)), "2223");
}

#[test]
fn test_deep_watcher_sees_in_place_element_write() {
    let seen: Log = Rc::default();
    let shallow: Log = Rc::default();
    let (deep_log, shallow_log) = (seen.clone(), shallow.clone());
    let app = App::builder()
        .state(json!({ "user": { "roles": ["guest"] } }))
        .method("promote", "() => user.roles[0] = 'admin'")
        .watch("user.roles", true, move |new, _old| {
            deep_log.borrow_mut().push(new.to_json().to_string());
            Ok(())
        })
        .watch("user.roles", false, move |new, _old| {
            shallow_log.borrow_mut().push(new.to_json().to_string());
            Ok(())
        })
        .build()
        .unwrap();

    app.call("promote", &[]).unwrap();
    app.tick();
    assert_eq!(*seen.borrow(), vec![r#"["admin"]"#]);
    assert!(shallow.borrow().is_empty());
}

#[test]
fn test_circular_computed_warns_once_per_pass() {
    let app = App::builder()
        .data("x", 1)
        .computed("a", "b + x")
        .computed("b", "a + 1")
        .build()
        .unwrap();
    assert_eq!(app.diagnostic_count(WARN_CIRCULAR_COMPUTED), 1);

    app.set("x", 2);
    assert_eq!(app.tick(), 1);
    assert_eq!(app.diagnostic_count(WARN_CIRCULAR_COMPUTED), 2);
}

#[test]
fn test_computed_is_fresh_before_render() {
    let app = mount(
        App::builder()
            .state(json!({ "items": [1, 2, 3] }))
            .computed("total", "items.reduce((s, n) => s + n, 0)")
            .computed("label", "'total ' + total")
            .method("add", "(n) => items.push(n)"),
        "<p>{{ label }}</p>",
    );
    assert_eq!(text(&app), "total 6");
    app.call("add", &[Value::from(4)]).unwrap();
    app.tick();
    assert_eq!(text(&app), "total 10");
}

#[test]
fn test_events_and_model_round_trip() {
    let app = mount(
        App::builder().data("name", "").data("count", 0),
        concat!(
            "<input id=name v-model=\"name\">",
            "<p id=out>{{ name }}</p>",
            "<button id=inc @click=\"count++\">{{ count }}</button>",
        ),
    );
    let input = app.element_by_id("name").unwrap();
    let button = app.element_by_id("inc").unwrap();

    app.input(&input, "Ada");
    app.tick();
    assert_eq!(app.get("name").to_js_string(), "Ada");
    assert_eq!(dom::text_content(&app.element_by_id("out").unwrap()), "Ada");

    app.click(&button);
    app.click(&button);
    assert_eq!(app.tick(), 1);
    assert_eq!(dom::text_content(&button), "2");

    app.set("name", "Grace");
    app.tick();
    assert_eq!(dom::get_attribute(&input, "value").as_deref(), Some("Grace"));
}

#[test]
fn test_component_renders_with_props_and_factory() {
    let app = mount(
        App::builder().data("user", "Ada").component(
            "x-greet",
            "<b>{{ greeting }}, {{ name }}</b>",
            Rc::new(|_props: &Props| vec![("greeting".to_string(), Value::string("Hi"))]),
        ),
        "<x-greet :name=\"user\"></x-greet>",
    );
    assert_eq!(text(&app), "Hi, Ada");
}

#[test]
fn test_unmount_releases_listeners() {
    let app = mount(
        App::builder().data("count", 0),
        "<button id=inc @click=\"count++\">+</button>",
    );
    let button = app.element_by_id("inc").unwrap();
    assert_eq!(app.runtime().events().listener_count(&button), 1);
    app.unmount();
    assert_eq!(app.runtime().events().listener_count(&button), 0);
    app.click(&button);
    assert_eq!(app.get("count").to_number(), 0.0);
}

#[test]
fn test_next_tick_observes_rendered_text() {
    let app = mount(App::builder().data("n", 1), "<p>{{ n }}</p>");
    let seen: Log = Rc::default();
    app.set("n", 2);
    let (sink, probe) = (seen.clone(), app.clone());
    app.next_tick(move || sink.borrow_mut().push(text(&probe)));
    app.tick();
    assert_eq!(*seen.borrow(), vec!["2"]);
}

/// `v-mirror` writes `mirror = source * 2` whenever `source` changes.
struct Mirror {
    reads: PathSet,
}

impl DomUpdater for Mirror {
    fn dependencies(&self) -> &PathSet {
        &self.reads
    }

    fn update(&self, node: &Rc<RenderNode>, _forced: bool) -> EvalResult<()> {
        let source = node.scope().get("source").to_number();
        node.scope().set("mirror", Value::from(source * 2.0));
        Ok(())
    }
}

#[test]
fn test_write_during_pass_schedules_one_follow_up() {
    let builder = App::builder().data("source", 1).data("mirror", 0).directive(
        "mirror",
        Rc::new(|source: &DirectiveSource<'_>| -> Result<Directive, CompileError> {
            let compiled = source.compile_value()?;
            Ok(Directive::new("mirror").with_updater(Rc::new(Mirror {
                reads: compiled.reads,
            })))
        }),
    );
    let app = mount(builder, "<i v-mirror=\"source\"></i><b>{{ mirror }}</b>");
    assert_eq!(app.tick(), 1);
    assert_eq!(text(&app), "2");

    app.set("source", 5);
    assert_eq!(app.tick(), 2);
    assert_eq!(text(&app), "10");
    assert_eq!(app.tick(), 0);
}

#[test]
fn test_mutually_recursive_methods_track_every_read() {
    let ping = "(n) => n > 0 ? pong(n - 1) : p";
    let pong = "(n) => n > 0 ? ping(n - 1) : q";
    for ping_first in [true, false] {
        let builder = App::builder().data("p", 1).data("q", 2);
        let builder = if ping_first {
            builder.method("ping", ping).method("pong", pong)
        } else {
            builder.method("pong", pong).method("ping", ping)
        };
        let app = mount(builder, "<p>{{ pong(1) }}</p>");
        assert_eq!(text(&app), "1");

        app.set("p", 5);
        app.tick();
        assert_eq!(text(&app), "5", "ping declared first: {}", ping_first);
    }
}

#[test]
fn test_lifecycle_function_receives_element() {
    let app = mount(
        App::builder()
            .state(json!({ "tags": [] }))
            .method("seen", "(el) => tags.push(el.tagName + '#' + el.id)"),
        "<p id=first v-mounted=\"seen\">x</p>",
    );
    app.tick();
    assert_eq!(app.get("tags").to_json(), json!(["P#first"]));
}

#[test]
fn test_replaced_state_is_released() {
    let app = mount(
        App::builder().state(json!({ "items": [] })),
        "<p v-for=\"row in items\">{{ row.n }}</p>",
    );
    for i in 0..200 {
        app.set("items", Value::from(json!([{ "n": i }])));
        app.tick();
    }
    assert_eq!(text(&app), "199");
    assert!(app.scope().observer().cached_wrappers() <= 4);
}

proptest! {
    #[test]
    fn prop_any_mutation_burst_is_one_pass(
        writes in proptest::collection::vec((0usize..3, 1i32..1000), 1..24)
    ) {
        let log: Log = Rc::default();
        let builder = with_probe(App::builder().data("a", 0).data("b", 0).data("c", 0), &log);
        let app = mount(builder, "<p v-probe:all=\"[a, b, c]\"></p>");
        log.borrow_mut().clear();

        for (key, value) in &writes {
            app.set(["a", "b", "c"][*key], *value);
        }
        prop_assert_eq!(app.tick(), 1);
        prop_assert_eq!(log.borrow().len(), 1);
        prop_assert_eq!(app.tick(), 0);
    }
}
