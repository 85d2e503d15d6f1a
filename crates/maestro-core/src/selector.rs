//! Selector algebra over parsed page-source snapshots.
//!
//! A [`Selector`] is a declarative query combining primary criteria (text,
//! resource-id, css), size and state filters, an index, and positional
//! relations to anchor selectors. This module owns the pure matching logic:
//! regex-vs-literal detection, per-element checks, the relational filters,
//! and the tie-break that picks one element out of a candidate set.
//!
//! Everything here operates on immutable [`ParsedElement`] lists from a
//! single snapshot; fetching and polling live in the resolver.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::element::ParsedElement;

/// Declarative element query.
///
/// Any subset of criteria may be set. Carrier fields (`point`, `start`,
/// `end`, `repeat`, `delay`, `wait_to_settle_timeout_ms`, `optional`,
/// `label`, `timeout_ms`) do not take part in matching; the step dispatcher
/// reads them.
///
/// In YAML a selector is polymorphic: a bare scalar is shorthand for
/// `{text: scalar}`, and an `element` key aliases `text` when `text` is
/// absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub css: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focused: Option<bool>,

    /// Kept as a string so late variable substitution can fill it in;
    /// negative values count from the end of the candidate list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub below: Option<Box<Selector>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub above: Option<Box<Selector>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_of: Option<Box<Selector>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right_of: Option<Box<Selector>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_of: Option<Box<Selector>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contains_child: Option<Box<Selector>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inside_of: Option<Box<Selector>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contains_descendants: Vec<Selector>,

    // Carrier fields for the step dispatcher.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_to_settle_timeout_ms: Option<u64>,
    #[serde(rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Selector {
    /// Shorthand constructor used by the flow parser for bare scalars.
    pub fn from_text(text: impl Into<String>) -> Self {
        Selector {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// True when no matching criterion is set (carrier fields excluded).
    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.id.is_none()
            && self.css.is_none()
            && !self.has_size()
            && !self.has_state()
            && self.index.is_none()
            && !self.has_relational()
    }

    pub fn has_size(&self) -> bool {
        self.width.is_some() || self.height.is_some()
    }

    pub fn has_state(&self) -> bool {
        self.enabled.is_some()
            || self.selected.is_some()
            || self.checked.is_some()
            || self.focused.is_some()
    }

    pub fn has_relational(&self) -> bool {
        self.below.is_some()
            || self.above.is_some()
            || self.left_of.is_some()
            || self.right_of.is_some()
            || self.child_of.is_some()
            || self.contains_child.is_some()
            || self.inside_of.is_some()
            || !self.contains_descendants.is_empty()
    }

    /// True when any of `text`, `id`, or a size criterion is set; the
    /// relational branch uses this to decide whether base candidates come
    /// from filtering or from the whole snapshot.
    pub fn has_direct(&self) -> bool {
        self.text.is_some() || self.id.is_some() || self.has_size() || self.has_state()
    }

    /// Clone with all relational criteria removed.
    pub fn strip_relational(&self) -> Selector {
        Selector {
            below: None,
            above: None,
            left_of: None,
            right_of: None,
            child_of: None,
            contains_child: None,
            inside_of: None,
            contains_descendants: Vec::new(),
            ..self.clone()
        }
    }

    pub fn effective_tolerance(&self) -> i32 {
        self.tolerance.unwrap_or(5)
    }

    /// Human-readable description used in resolver timeout errors.
    pub fn description(&self) -> String {
        let mut parts = Vec::new();
        if let Some(t) = &self.text {
            parts.push(format!("text={:?}", t));
        }
        if let Some(i) = &self.id {
            parts.push(format!("id={:?}", i));
        }
        if let Some(c) = &self.css {
            parts.push(format!("css={:?}", c));
        }
        if let Some(w) = self.width {
            parts.push(format!("width={}", w));
        }
        if let Some(h) = self.height {
            parts.push(format!("height={}", h));
        }
        for (name, value) in [
            ("enabled", self.enabled),
            ("selected", self.selected),
            ("checked", self.checked),
            ("focused", self.focused),
        ] {
            if let Some(v) = value {
                parts.push(format!("{}={}", name, v));
            }
        }
        if let Some(i) = &self.index {
            parts.push(format!("index={}", i));
        }
        for (name, anchor) in [
            ("below", &self.below),
            ("above", &self.above),
            ("leftOf", &self.left_of),
            ("rightOf", &self.right_of),
            ("childOf", &self.child_of),
            ("containsChild", &self.contains_child),
            ("insideOf", &self.inside_of),
        ] {
            if let Some(a) = anchor {
                parts.push(format!("{}({})", name, a.description()));
            }
        }
        if !self.contains_descendants.is_empty() {
            let inner: Vec<String> = self
                .contains_descendants
                .iter()
                .map(|s| s.description())
                .collect();
            parts.push(format!("containsDescendants[{}]", inner.join("; ")));
        }
        if parts.is_empty() {
            "any element".to_string()
        } else {
            parts.join(", ")
        }
    }
}

// ---------------------------------------------------------------------------
// YAML deserialization (polymorphic scalar-or-mapping form)
// ---------------------------------------------------------------------------

fn scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Str(String),
        Int(i64),
        Float(f64),
        Bool(bool),
    }
    Ok(Option::<Scalar>::deserialize(deserializer)?.map(|s| match s {
        Scalar::Str(v) => v,
        Scalar::Int(v) => v.to_string(),
        Scalar::Float(v) => v.to_string(),
        Scalar::Bool(v) => v.to_string(),
    }))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawSelector {
    #[serde(deserialize_with = "scalar_string")]
    text: Option<String>,
    #[serde(deserialize_with = "scalar_string")]
    element: Option<String>,
    #[serde(deserialize_with = "scalar_string")]
    id: Option<String>,
    css: Option<String>,
    width: Option<i32>,
    height: Option<i32>,
    tolerance: Option<i32>,
    enabled: Option<bool>,
    selected: Option<bool>,
    checked: Option<bool>,
    focused: Option<bool>,
    #[serde(deserialize_with = "scalar_string")]
    index: Option<String>,
    below: Option<Box<Selector>>,
    above: Option<Box<Selector>>,
    left_of: Option<Box<Selector>>,
    right_of: Option<Box<Selector>>,
    child_of: Option<Box<Selector>>,
    contains_child: Option<Box<Selector>>,
    inside_of: Option<Box<Selector>>,
    contains_descendants: Vec<Selector>,
    point: Option<String>,
    start: Option<String>,
    end: Option<String>,
    repeat: Option<u32>,
    delay: Option<u64>,
    wait_to_settle_timeout_ms: Option<u64>,
    #[serde(rename = "timeout")]
    timeout_ms: Option<u64>,
    optional: bool,
    label: Option<String>,
}

impl From<RawSelector> for Selector {
    fn from(raw: RawSelector) -> Self {
        Selector {
            // `element` is an alias for `text` when `text` is absent.
            text: raw.text.or(raw.element),
            id: raw.id,
            css: raw.css,
            width: raw.width,
            height: raw.height,
            tolerance: raw.tolerance,
            enabled: raw.enabled,
            selected: raw.selected,
            checked: raw.checked,
            focused: raw.focused,
            index: raw.index,
            below: raw.below,
            above: raw.above,
            left_of: raw.left_of,
            right_of: raw.right_of,
            child_of: raw.child_of,
            contains_child: raw.contains_child,
            inside_of: raw.inside_of,
            contains_descendants: raw.contains_descendants,
            point: raw.point,
            start: raw.start,
            end: raw.end,
            repeat: raw.repeat,
            delay: raw.delay,
            wait_to_settle_timeout_ms: raw.wait_to_settle_timeout_ms,
            timeout_ms: raw.timeout_ms,
            optional: raw.optional,
            label: raw.label,
        }
    }
}

impl<'de> Deserialize<'de> for Selector {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Str(String),
            Int(i64),
            Float(f64),
            Full(RawSelector),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Str(s) => Selector::from_text(s),
            Repr::Int(n) => Selector::from_text(n.to_string()),
            Repr::Float(n) => Selector::from_text(n.to_string()),
            Repr::Full(raw) => raw.into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Regex detection and text matching
// ---------------------------------------------------------------------------

/// Decides whether a text pattern should be treated as a regular expression.
///
/// A pattern is regex-like iff it contains an unescaped `* + ? [ ] { } | ( )`,
/// an unescaped `.` immediately followed by `* + ?`, a `^` at position 0, or
/// an unescaped `$` at the end. Bare dots (e.g. `mastodon.social`) stay
/// literal. Changing this ruleset silently reclassifies selectors.
pub fn is_regex_like(pattern: &str) -> bool {
    let chars: Vec<char> = pattern.chars().collect();
    if chars.first() == Some(&'^') {
        return true;
    }
    let mut escaped = false;
    for (i, &c) in chars.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '*' | '+' | '?' | '[' | ']' | '{' | '}' | '|' | '(' | ')' => return true,
            '.' => {
                if matches!(chars.get(i + 1), Some('*') | Some('+') | Some('?')) {
                    return true;
                }
            }
            '$' if i == chars.len() - 1 => return true,
            _ => {}
        }
    }
    false
}

/// Checks a text pattern against one attribute value.
///
/// Regex-like patterns match the whole value case-insensitively; literal
/// patterns match as a case-insensitive substring. Both forms also try the
/// value with newlines collapsed to spaces.
pub fn text_matches(pattern: &str, value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    let collapsed = value.replace('\n', " ");
    if is_regex_like(pattern) {
        match Regex::new(&format!("(?is)^(?:{})$", pattern)) {
            Ok(re) => re.is_match(value) || re.is_match(&collapsed),
            // An undeliberate regex (e.g. a lone bracket in UI copy) falls
            // back to literal matching.
            Err(_) => literal_matches(pattern, value) || literal_matches(pattern, &collapsed),
        }
    } else {
        literal_matches(pattern, value) || literal_matches(pattern, &collapsed)
    }
}

fn literal_matches(pattern: &str, value: &str) -> bool {
    value.to_lowercase().contains(&pattern.to_lowercase())
}

/// Checks the non-relational criteria of a selector against one element.
pub fn matches_element(sel: &Selector, e: &ParsedElement) -> bool {
    if let Some(pattern) = &sel.text {
        if !e.text_candidates().iter().any(|v| text_matches(pattern, v)) {
            return false;
        }
    }
    if let Some(id) = &sel.id {
        if !e.resource_id.contains(id.as_str()) {
            return false;
        }
    }
    if let Some(css) = &sel.css {
        // Web-view selectors fall back to a class-name comparison when
        // evaluated against a native snapshot.
        if !e.class_name.contains(css.as_str()) {
            return false;
        }
    }
    let tolerance = sel.effective_tolerance();
    if let Some(w) = sel.width {
        if (e.bounds.width - w).abs() > tolerance {
            return false;
        }
    }
    if let Some(h) = sel.height {
        if (e.bounds.height - h).abs() > tolerance {
            return false;
        }
    }
    if let Some(v) = sel.enabled {
        if e.enabled != v {
            return false;
        }
    }
    if let Some(v) = sel.selected {
        if e.selected != v {
            return false;
        }
    }
    // Android reports checked widgets through the selected flag.
    if let Some(v) = sel.checked {
        if e.selected != v {
            return false;
        }
    }
    if let Some(v) = sel.focused {
        if e.focused != v {
            return false;
        }
    }
    true
}

/// Filters a snapshot by the non-relational criteria of a selector.
pub fn filter_by_selector(elements: &[ParsedElement], sel: &Selector) -> Vec<ParsedElement> {
    elements
        .iter()
        .filter(|e| matches_element(sel, e))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Relational filters
// ---------------------------------------------------------------------------

/// Elements strictly below the anchor, nearest first.
pub fn filter_below(elements: &[ParsedElement], anchor: &ParsedElement) -> Vec<ParsedElement> {
    let mut out: Vec<ParsedElement> = elements
        .iter()
        .filter(|e| *e != anchor && e.bounds.y >= anchor.bounds.bottom())
        .cloned()
        .collect();
    out.sort_by_key(|e| e.bounds.y - anchor.bounds.bottom());
    out
}

/// Elements strictly above the anchor, nearest first.
pub fn filter_above(elements: &[ParsedElement], anchor: &ParsedElement) -> Vec<ParsedElement> {
    let mut out: Vec<ParsedElement> = elements
        .iter()
        .filter(|e| *e != anchor && e.bounds.bottom() <= anchor.bounds.y)
        .cloned()
        .collect();
    out.sort_by_key(|e| anchor.bounds.y - e.bounds.bottom());
    out
}

/// Elements entirely left of the anchor, nearest first.
pub fn filter_left_of(elements: &[ParsedElement], anchor: &ParsedElement) -> Vec<ParsedElement> {
    let mut out: Vec<ParsedElement> = elements
        .iter()
        .filter(|e| *e != anchor && e.bounds.right() <= anchor.bounds.x)
        .cloned()
        .collect();
    out.sort_by_key(|e| anchor.bounds.x - e.bounds.right());
    out
}

/// Elements entirely right of the anchor, nearest first.
pub fn filter_right_of(elements: &[ParsedElement], anchor: &ParsedElement) -> Vec<ParsedElement> {
    let mut out: Vec<ParsedElement> = elements
        .iter()
        .filter(|e| *e != anchor && e.bounds.x >= anchor.bounds.right())
        .cloned()
        .collect();
    out.sort_by_key(|e| e.bounds.x - anchor.bounds.right());
    out
}

/// Elements whose bounds are fully contained in the anchor's bounds.
pub fn filter_child_of(elements: &[ParsedElement], anchor: &ParsedElement) -> Vec<ParsedElement> {
    elements
        .iter()
        .filter(|e| *e != anchor && anchor.bounds.contains(&e.bounds))
        .cloned()
        .collect()
}

/// Elements whose bounds fully contain the anchor's bounds.
pub fn filter_contains_child(
    elements: &[ParsedElement],
    anchor: &ParsedElement,
) -> Vec<ParsedElement> {
    elements
        .iter()
        .filter(|e| *e != anchor && e.bounds.contains(&anchor.bounds))
        .cloned()
        .collect()
}

/// Elements whose center point lies inside the anchor's bounds.
pub fn filter_inside_of(elements: &[ParsedElement], anchor: &ParsedElement) -> Vec<ParsedElement> {
    elements
        .iter()
        .filter(|e| *e != anchor && e.bounds.center_inside(&anchor.bounds))
        .cloned()
        .collect()
}

/// Retains candidates for which every descendant selector matches some
/// element located within the candidate's bounds.
pub fn filter_contains_descendants(
    candidates: Vec<ParsedElement>,
    snapshot: &[ParsedElement],
    descendants: &[Selector],
) -> Vec<ParsedElement> {
    candidates
        .into_iter()
        .filter(|candidate| {
            descendants.iter().all(|d| {
                snapshot.iter().any(|e| {
                    e != candidate
                        && candidate.bounds.contains(&e.bounds)
                        && matches_element(d, e)
                })
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tie-breaking
// ---------------------------------------------------------------------------

/// Picks one element out of a candidate set.
///
/// Priority chain: clickable candidates first (stable); an explicit `index`
/// selects a position in that ordering (negative counts from the end);
/// otherwise the deepest candidate in the preferred pool wins, which avoids
/// selecting container wrappers around the actual widget.
pub fn pick_candidate(candidates: &[ParsedElement], index: Option<&str>) -> Option<ParsedElement> {
    if candidates.is_empty() {
        return None;
    }
    let mut ordered: Vec<&ParsedElement> = candidates.iter().filter(|e| e.clickable).collect();
    let clickable_count = ordered.len();
    ordered.extend(candidates.iter().filter(|e| !e.clickable));

    if let Some(raw) = index {
        match raw.trim().parse::<i64>() {
            Ok(mut i) => {
                let len = ordered.len() as i64;
                if i < 0 {
                    i += len;
                }
                if i < 0 || i >= len {
                    return None;
                }
                return Some(ordered[i as usize].clone());
            }
            Err(_) => {
                tracing::debug!(index = raw, "ignoring unparseable selector index");
            }
        }
    }

    let pool = if clickable_count > 0 {
        &ordered[..clickable_count]
    } else {
        &ordered[..]
    };
    let mut best = pool[0];
    for &e in &pool[1..] {
        if e.depth > best.depth {
            best = e;
        }
    }
    Some(best.clone())
}

/// Walks up from a non-clickable element to its nearest clickable ancestor.
///
/// Returns the ancestor when one exists, otherwise the element itself.
/// Handles the leaf-text pattern where the tappable surface is a parent
/// container rather than the text node that matched.
pub fn promote_to_clickable(
    snapshot: &[ParsedElement],
    chosen: &ParsedElement,
) -> ParsedElement {
    if chosen.clickable {
        return chosen.clone();
    }
    let Some(pos) = snapshot.iter().position(|e| e == chosen) else {
        return chosen.clone();
    };
    // In a pre-order flattening the ancestor chain of an element is the
    // sequence of preceding entries with strictly decreasing depth.
    let mut want = chosen.depth;
    for e in snapshot[..pos].iter().rev() {
        if e.depth < want {
            want = e.depth;
            if e.clickable {
                return e.clone();
            }
            if want == 0 {
                break;
            }
        }
    }
    chosen.clone()
}
