//! Server-side locator generation.
//!
//! Translates a [`Selector`] into an ordered list of locator strategies for
//! the UIAutomator2 server. More specific expressions come first; the
//! resolver walks the list per polling iteration and takes the first hit.
//! No timeout is embedded here, polling is the caller's concern.

use crate::selector::{is_regex_like, Selector};

/// Locator strategies understood by the automation server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorStrategy {
    /// A `new UiSelector()…` expression chain.
    UiAutomator,
    /// A raw class-name lookup.
    ClassName,
}

impl LocatorStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocatorStrategy::UiAutomator => "-android uiautomator",
            LocatorStrategy::ClassName => "class name",
        }
    }
}

/// One `(strategy, expression)` pair for the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Locator {
    pub strategy: LocatorStrategy,
    pub expression: String,
}

impl Locator {
    fn uiautomator(chain: String) -> Self {
        Locator {
            strategy: LocatorStrategy::UiAutomator,
            expression: format!("new UiSelector(){}", chain),
        }
    }
}

/// Ordered locators for a plain (non-tap) resolve.
pub fn server_locators(sel: &Selector) -> Vec<Locator> {
    build(sel, false)
}

/// The same locators restricted to clickable elements.
///
/// The tap-preferring resolver tries these first; a hit on the plain list
/// but not here means the text exists on a non-clickable node.
pub fn clickable_locators(sel: &Selector) -> Vec<Locator> {
    build(sel, true)
}

fn build(sel: &Selector, clickable_only: bool) -> Vec<Locator> {
    let prefix = if clickable_only { ".clickable(true)" } else { "" };
    let suffix = state_suffix(sel);
    let mut out = Vec::new();

    if let Some(id) = &sel.id {
        out.push(Locator::uiautomator(format!(
            "{}.resourceIdMatches(\".*{}.*\"){}",
            prefix,
            escape_regex_literal(id),
            suffix
        )));
    }

    if let Some(text) = &sel.text {
        if is_regex_like(text) {
            let pattern = escape_quotes(text);
            out.push(Locator::uiautomator(format!(
                "{}.textMatches(\"(?is){}\"){}",
                prefix, pattern, suffix
            )));
            out.push(Locator::uiautomator(format!(
                "{}.descriptionMatches(\"(?is){}\"){}",
                prefix, pattern, suffix
            )));
        } else {
            let literal = escape_quotes(text);
            out.push(Locator::uiautomator(format!(
                "{}.textContains(\"{}\"){}",
                prefix, literal, suffix
            )));
            out.push(Locator::uiautomator(format!(
                "{}.descriptionContains(\"{}\"){}",
                prefix, literal, suffix
            )));
        }
    }

    if let Some(css) = &sel.css {
        if !clickable_only {
            out.push(Locator {
                strategy: LocatorStrategy::ClassName,
                expression: css.clone(),
            });
        }
    }

    out
}

fn state_suffix(sel: &Selector) -> String {
    let mut suffix = String::new();
    for (method, value) in [
        ("enabled", sel.enabled),
        ("selected", sel.selected),
        ("checked", sel.checked),
        ("focused", sel.focused),
    ] {
        if let Some(v) = value {
            suffix.push_str(&format!(".{}({})", method, v));
        }
    }
    suffix
}

fn escape_quotes(s: &str) -> String {
    s.replace('"', "\\\"")
}

/// Escapes regex metacharacters so a literal value can be embedded in a
/// `…Matches` expression.
fn escape_regex_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(
            c,
            '\\' | '.' | '^' | '$' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|'
        ) {
            out.push('\\');
        }
        if c == '"' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
