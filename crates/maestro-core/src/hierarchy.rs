//! Page-source hierarchy parsing.
//!
//! Turns the XML snapshot returned by the automation server (or by
//! `uiautomator dump`) into a flat, pre-order list of [`ParsedElement`]s.
//! Two dump dialects are accepted: generic `<node …>` tags carrying a
//! `class` attribute, and dumps whose tag names are the UI class itself
//! (e.g. `<android.widget.Button …>`).
//!
//! Depth bookkeeping: elements directly under the `<hierarchy>` root get
//! depth 0, and every child is one deeper than its parent. The child
//! subtrees are retained on each flattened entry so containment filters
//! can see structure.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use crate::element::{Bounds, ParsedElement};

/// Errors raised while parsing a page-source document.
#[derive(Error, Debug)]
pub enum HierarchyError {
    /// The document is not well-formed XML.
    #[error("Malformed page source: {0}")]
    Malformed(String),

    /// The document contains no `<hierarchy>` root element.
    #[error("No hierarchy root found in page source")]
    NoRoot,
}

/// Parses a page-source document into a flat pre-order element list.
pub fn parse_hierarchy(xml: &str) -> Result<Vec<ParsedElement>, HierarchyError> {
    let roots = parse_tree(xml)?;
    let mut flat = Vec::new();
    flatten_into(&roots, &mut flat);
    Ok(flat)
}

/// Parses a page-source document into its root elements (children of
/// `<hierarchy>`), with `depth` already assigned throughout the tree.
pub fn parse_tree(xml: &str) -> Result<Vec<ParsedElement>, HierarchyError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut saw_hierarchy = false;
    let mut roots: Vec<ParsedElement> = Vec::new();
    // Stack of open UI elements below the hierarchy root.
    let mut stack: Vec<ParsedElement> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"hierarchy" => {
                saw_hierarchy = true;
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"hierarchy" => {}
            Ok(Event::Start(ref e)) => {
                if !saw_hierarchy {
                    return Err(HierarchyError::NoRoot);
                }
                let depth = stack.len() as i32;
                stack.push(element_from_tag(e, depth));
            }
            Ok(Event::Empty(ref e)) => {
                if e.name().as_ref() == b"hierarchy" {
                    saw_hierarchy = true;
                    continue;
                }
                if !saw_hierarchy {
                    return Err(HierarchyError::NoRoot);
                }
                let depth = stack.len() as i32;
                let element = element_from_tag(e, depth);
                attach(&mut stack, &mut roots, element);
            }
            Ok(Event::End(_)) => {
                if let Some(element) = stack.pop() {
                    attach(&mut stack, &mut roots, element);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(HierarchyError::Malformed(e.to_string())),
        }
    }

    if !saw_hierarchy {
        return Err(HierarchyError::NoRoot);
    }
    if !stack.is_empty() {
        return Err(HierarchyError::Malformed(
            "unclosed element in page source".to_string(),
        ));
    }
    Ok(roots)
}

fn attach(stack: &mut [ParsedElement], roots: &mut Vec<ParsedElement>, element: ParsedElement) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => roots.push(element),
    }
}

fn element_from_tag(tag: &BytesStart<'_>, depth: i32) -> ParsedElement {
    let tag_name = String::from_utf8_lossy(tag.name().as_ref()).to_string();
    let mut element = ParsedElement {
        // Class-named dumps carry the UI class as the tag itself; a
        // `class` attribute overrides it either way.
        class_name: if tag_name == "node" { String::new() } else { tag_name },
        enabled: true,
        displayed: true,
        depth,
        ..Default::default()
    };

    for attr in tag.attributes().filter_map(|a| a.ok()) {
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map(|v| v.to_string())
            .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).to_string());
        match key.as_str() {
            "text" => element.text = value,
            "resource-id" => element.resource_id = value,
            "content-desc" => element.content_desc = value,
            "hint" => element.hint_text = value,
            "class" => element.class_name = value,
            "bounds" => element.bounds = Bounds::parse(&value).unwrap_or_default(),
            "enabled" => element.enabled = value == "true",
            "selected" => element.selected = value == "true",
            "focused" => element.focused = value == "true",
            "displayed" => element.displayed = value == "true",
            "clickable" => element.clickable = value == "true",
            "scrollable" => element.scrollable = value == "true",
            _ => {}
        }
    }
    element
}

fn flatten_into(nodes: &[ParsedElement], out: &mut Vec<ParsedElement>) {
    for node in nodes {
        out.push(node.clone());
        flatten_into(&node.children, out);
    }
}

/// Renders a parsed element list as an indented text dump for diagnostics.
pub fn render_hierarchy(elements: &[ParsedElement]) -> String {
    let mut lines = Vec::with_capacity(elements.len());
    for e in elements {
        let mut line = format!(
            "{}{} {}",
            "  ".repeat(e.depth.max(0) as usize),
            e.class_name,
            e.bounds
        );
        if !e.text.is_empty() {
            line.push_str(&format!(" text={:?}", e.text));
        }
        if !e.resource_id.is_empty() {
            line.push_str(&format!(" id={:?}", e.resource_id));
        }
        if e.clickable {
            line.push_str(" clickable");
        }
        if e.scrollable {
            line.push_str(" scrollable");
        }
        lines.push(line);
    }
    lines.join("\n")
}
