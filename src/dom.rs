//! Live document tree helpers over `markup5ever_rcdom`.
//!
//! The engine mutates the parsed tree in place: detaching, inserting, cloning
//! and editing attributes. Parent links are kept consistent on every move.

use std::rc::Rc;

use html5ever::serialize::{serialize, SerializeOpts, TraversalScope};
use html5ever::tendril::TendrilSink;
use html5ever::{namespace_url, ns, parse_document, Attribute, LocalName, QualName};
use markup5ever_rcdom::{Handle, Node, NodeData, RcDom, SerializableHandle};
use tendril::StrTendril;

use crate::error::CompileError;

/// Parse a full document.
pub fn parse_html(html: &str) -> Result<Handle, CompileError> {
    let dom = parse_document(RcDom::default(), Default::default())
        .from_utf8()
        .read_from(&mut html.as_bytes())
        .map_err(|e| CompileError::Template(format!("Failed to parse HTML: {}", e)))?;
    Ok(dom.document)
}

/// Parse markup meant as body content and return its top-level nodes,
/// detached from the scratch document.
pub fn parse_fragment(html: &str) -> Result<Vec<Handle>, CompileError> {
    let document = parse_html(html)?;
    let body = find_element(&document, "body")
        .ok_or_else(|| CompileError::Template("document has no <body>".to_string()))?;
    let nodes = children(&body);
    for node in &nodes {
        detach(node);
    }
    Ok(nodes)
}

/// First element named `tag` in document order.
pub fn find_element(root: &Handle, tag: &str) -> Option<Handle> {
    if tag_name(root).as_deref() == Some(tag) {
        return Some(root.clone());
    }
    let kids = root.children.borrow().clone();
    kids.iter().find_map(|child| find_element(child, tag))
}

/// Element carrying `id="..."`, searched depth first.
pub fn find_by_id(root: &Handle, id: &str) -> Option<Handle> {
    if get_attribute(root, "id").as_deref() == Some(id) {
        return Some(root.clone());
    }
    let kids = root.children.borrow().clone();
    kids.iter().find_map(|child| find_by_id(child, id))
}

pub fn create_element(tag: &str) -> Handle {
    Node::new(NodeData::Element {
        name: QualName::new(None, ns!(html), LocalName::from(tag)),
        attrs: Default::default(),
        template_contents: Default::default(),
        mathml_annotation_xml_integration_point: false,
    })
}

pub fn create_text(text: &str) -> Handle {
    Node::new(NodeData::Text {
        contents: std::cell::RefCell::new(StrTendril::from_slice(text)),
    })
}

pub fn create_comment(text: &str) -> Handle {
    Node::new(NodeData::Comment {
        contents: StrTendril::from_slice(text),
    })
}

pub fn same_node(a: &Handle, b: &Handle) -> bool {
    Rc::ptr_eq(a, b)
}

/// Stable identity of a node for side tables.
pub fn node_key(node: &Handle) -> usize {
    Rc::as_ptr(node) as usize
}

/// True when `a` comes before `b` in document order. Nodes in different
/// trees are unordered.
pub fn precedes(a: &Handle, b: &Handle) -> bool {
    fn chain(node: &Handle) -> Vec<Handle> {
        let mut out = vec![node.clone()];
        let mut current = parent(node);
        while let Some(p) = current {
            current = parent(&p);
            out.push(p);
        }
        out.reverse();
        out
    }
    let (a_chain, b_chain) = (chain(a), chain(b));
    if !same_node(&a_chain[0], &b_chain[0]) {
        return false;
    }
    let shared = a_chain
        .iter()
        .zip(&b_chain)
        .take_while(|(x, y)| same_node(x, y))
        .count();
    match (a_chain.get(shared), b_chain.get(shared)) {
        (None, Some(_)) => true,
        (Some(x), Some(y)) => {
            let siblings = children(&a_chain[shared - 1]);
            let index = |n: &Handle| siblings.iter().position(|s| same_node(s, n));
            matches!((index(x), index(y)), (Some(i), Some(j)) if i < j)
        }
        _ => false,
    }
}

pub fn parent(node: &Handle) -> Option<Handle> {
    let weak = node.parent.take();
    let parent = weak.as_ref().and_then(|w| w.upgrade());
    node.parent.set(weak);
    parent
}

pub fn children(node: &Handle) -> Vec<Handle> {
    node.children.borrow().clone()
}

fn index_in_parent(node: &Handle) -> Option<(Handle, usize)> {
    let parent = parent(node)?;
    let index = parent
        .children
        .borrow()
        .iter()
        .position(|child| Rc::ptr_eq(child, node))?;
    Some((parent, index))
}

pub fn next_sibling(node: &Handle) -> Option<Handle> {
    let (parent, index) = index_in_parent(node)?;
    let kids = parent.children.borrow();
    kids.get(index + 1).cloned()
}

pub fn previous_sibling(node: &Handle) -> Option<Handle> {
    let (parent, index) = index_in_parent(node)?;
    let kids = parent.children.borrow();
    index.checked_sub(1).and_then(|i| kids.get(i).cloned())
}

/// Remove `node` from its parent. No-op for a detached node.
pub fn detach(node: &Handle) {
    if let Some((parent, index)) = index_in_parent(node) {
        parent.children.borrow_mut().remove(index);
    }
    node.parent.set(None);
}

pub fn is_attached(node: &Handle) -> bool {
    index_in_parent(node).is_some()
}

pub fn append(parent: &Handle, child: &Handle) {
    detach(child);
    child.parent.set(Some(Rc::downgrade(parent)));
    parent.children.borrow_mut().push(child.clone());
}

/// Insert `node` directly after `reference`, which must be attached.
pub fn insert_after(reference: &Handle, node: &Handle) -> bool {
    if Rc::ptr_eq(reference, node) {
        return false;
    }
    detach(node);
    let Some((parent, index)) = index_in_parent(reference) else {
        return false;
    };
    node.parent.set(Some(Rc::downgrade(&parent)));
    parent.children.borrow_mut().insert(index + 1, node.clone());
    true
}

/// Insert `node` directly before `reference`, which must be attached.
pub fn insert_before(reference: &Handle, node: &Handle) -> bool {
    if Rc::ptr_eq(reference, node) {
        return false;
    }
    detach(node);
    let Some((parent, index)) = index_in_parent(reference) else {
        return false;
    };
    node.parent.set(Some(Rc::downgrade(&parent)));
    parent.children.borrow_mut().insert(index, node.clone());
    true
}

/// Replace the children of `parent` with `nodes`.
pub fn replace_children(parent: &Handle, nodes: &[Handle]) {
    for old in children(parent) {
        detach(&old);
    }
    for node in nodes {
        append(parent, node);
    }
}

/// Deep copy of a subtree, detached.
pub fn deep_clone(node: &Handle) -> Handle {
    let data = match &node.data {
        NodeData::Document => NodeData::Document,
        NodeData::Doctype {
            name,
            public_id,
            system_id,
        } => NodeData::Doctype {
            name: name.clone(),
            public_id: public_id.clone(),
            system_id: system_id.clone(),
        },
        NodeData::Text { contents } => NodeData::Text {
            contents: std::cell::RefCell::new(contents.borrow().clone()),
        },
        NodeData::Comment { contents } => NodeData::Comment {
            contents: contents.clone(),
        },
        NodeData::Element {
            name,
            attrs,
            template_contents,
            mathml_annotation_xml_integration_point,
        } => NodeData::Element {
            name: name.clone(),
            attrs: std::cell::RefCell::new(attrs.borrow().clone()),
            template_contents: std::cell::RefCell::new(
                template_contents.borrow().as_ref().map(deep_clone),
            ),
            mathml_annotation_xml_integration_point: *mathml_annotation_xml_integration_point,
        },
        NodeData::ProcessingInstruction { target, contents } => NodeData::ProcessingInstruction {
            target: target.clone(),
            contents: contents.clone(),
        },
    };
    let copy = Node::new(data);
    for child in node.children.borrow().iter() {
        let child_copy = deep_clone(child);
        child_copy.parent.set(Some(Rc::downgrade(&copy)));
        copy.children.borrow_mut().push(child_copy);
    }
    copy
}

pub fn is_element(node: &Handle) -> bool {
    matches!(node.data, NodeData::Element { .. })
}

pub fn is_text(node: &Handle) -> bool {
    matches!(node.data, NodeData::Text { .. })
}

pub fn is_comment(node: &Handle) -> bool {
    matches!(node.data, NodeData::Comment { .. })
}

pub fn tag_name(node: &Handle) -> Option<String> {
    match &node.data {
        NodeData::Element { name, .. } => Some(name.local.to_string()),
        _ => None,
    }
}

pub fn text(node: &Handle) -> Option<String> {
    match &node.data {
        NodeData::Text { contents } => Some(contents.borrow().to_string()),
        NodeData::Comment { contents } => Some(contents.to_string()),
        _ => None,
    }
}

pub fn set_text(node: &Handle, value: &str) {
    if let NodeData::Text { contents } = &node.data {
        *contents.borrow_mut() = StrTendril::from_slice(value);
    }
}

/// Concatenated text of every descendant text node.
pub fn text_content(node: &Handle) -> String {
    let mut out = String::new();
    collect_text(node, &mut out);
    out
}

fn collect_text(node: &Handle, out: &mut String) {
    if let NodeData::Text { contents } = &node.data {
        out.push_str(&contents.borrow());
    }
    for child in node.children.borrow().iter() {
        collect_text(child, out);
    }
}

/// Replace an element's children with one text node.
pub fn set_text_content(node: &Handle, value: &str) {
    replace_children(node, &[create_text(value)]);
}

pub fn attributes(node: &Handle) -> Vec<(String, String)> {
    match &node.data {
        NodeData::Element { attrs, .. } => attrs
            .borrow()
            .iter()
            .map(|a| (a.name.local.to_string(), a.value.to_string()))
            .collect(),
        _ => Vec::new(),
    }
}

pub fn get_attribute(node: &Handle, name: &str) -> Option<String> {
    match &node.data {
        NodeData::Element { attrs, .. } => attrs
            .borrow()
            .iter()
            .find(|a| &*a.name.local == name)
            .map(|a| a.value.to_string()),
        _ => None,
    }
}

pub fn has_attribute(node: &Handle, name: &str) -> bool {
    get_attribute(node, name).is_some()
}

pub fn set_attribute(node: &Handle, name: &str, value: &str) {
    if let NodeData::Element { attrs, .. } = &node.data {
        let mut attrs = attrs.borrow_mut();
        match attrs.iter_mut().find(|a| &*a.name.local == name) {
            Some(existing) => existing.value = StrTendril::from_slice(value),
            None => attrs.push(Attribute {
                name: QualName::new(None, ns!(), LocalName::from(name)),
                value: StrTendril::from_slice(value),
            }),
        }
    }
}

pub fn remove_attribute(node: &Handle, name: &str) -> bool {
    if let NodeData::Element { attrs, .. } = &node.data {
        let mut attrs = attrs.borrow_mut();
        let before = attrs.len();
        attrs.retain(|a| &*a.name.local != name);
        return attrs.len() != before;
    }
    false
}

fn serialize_with(node: &Handle, scope: TraversalScope) -> String {
    let mut bytes = Vec::new();
    let opts = SerializeOpts {
        traversal_scope: scope,
        ..Default::default()
    };
    let handle = SerializableHandle::from(node.clone());
    if serialize(&mut bytes, &handle, opts).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Markup of the node itself and its subtree.
pub fn outer_html(node: &Handle) -> String {
    match node.data {
        NodeData::Document => inner_html(node),
        _ => serialize_with(node, TraversalScope::IncludeNode),
    }
}

pub fn inner_html(node: &Handle) -> String {
    serialize_with(node, TraversalScope::ChildrenOnly(None))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first(html: &str) -> Handle {
        parse_fragment(html).unwrap().remove(0)
    }

    #[test]
    fn test_fragment_is_detached() {
        let nodes = parse_fragment("<p>a</p><span>b</span>").unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(parent(&nodes[0]).is_none());
        assert_eq!(tag_name(&nodes[1]).as_deref(), Some("span"));
    }

    #[test]
    fn test_insert_and_move_keep_parent_links() {
        let list = first("<ul><li>a</li><li>b</li></ul>");
        let kids = children(&list);
        insert_after(&kids[1], &kids[0]);
        assert_eq!(inner_html(&list), "<li>b</li><li>a</li>");
        assert!(same_node(&parent(&kids[0]).unwrap(), &list));
        assert!(same_node(&next_sibling(&kids[1]).unwrap(), &kids[0]));
        assert!(previous_sibling(&kids[1]).is_none());

        detach(&kids[0]);
        assert!(!is_attached(&kids[0]));
        assert_eq!(inner_html(&list), "<li>b</li>");
    }

    #[test]
    fn test_deep_clone_is_independent() {
        let original = first(r#"<div class="x"><b>hi</b></div>"#);
        let copy = deep_clone(&original);
        set_attribute(&copy, "class", "y");
        set_text_content(&copy, "changed");
        assert_eq!(outer_html(&original), r#"<div class="x"><b>hi</b></div>"#);
        assert_eq!(outer_html(&copy), r#"<div class="y">changed</div>"#);
    }

    #[test]
    fn test_attributes() {
        let node = first(r#"<input type="text">"#);
        assert_eq!(get_attribute(&node, "type").as_deref(), Some("text"));
        set_attribute(&node, "value", "1");
        assert!(remove_attribute(&node, "type"));
        assert!(!remove_attribute(&node, "type"));
        assert_eq!(attributes(&node), vec![("value".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_document_order() {
        let list = first("<ul><li><b>a</b></li><li>b</li></ul>");
        let items = children(&list);
        let bold = children(&items[0]).remove(0);
        assert!(precedes(&items[0], &items[1]));
        assert!(!precedes(&items[1], &items[0]));
        assert!(precedes(&list, &bold));
        assert!(precedes(&bold, &items[1]));
        assert!(!precedes(&items[0], &items[0]));
        assert!(!precedes(&create_element("p"), &items[0]));
    }

    #[test]
    fn test_created_nodes_serialize() {
        let section = create_element("section");
        set_attribute(&section, "data-x", "1");
        append(&section, &create_text("hi"));
        assert_eq!(outer_html(&section), r#"<section data-x="1">hi</section>"#);
    }
}
