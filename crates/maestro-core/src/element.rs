//! Shared UI element types for the Android automation engine.
//!
//! This module defines the core data structures representing UI elements
//! from a device page-source snapshot. These types are produced by the
//! hierarchy parser and consumed by the selector algebra and the resolver;
//! they are independent of any specific automation backend.

use serde::{Deserialize, Serialize};

/// An integer rectangle in screen pixels.
///
/// Android reports element bounds as `[x1,y1][x2,y2]` corner pairs; this
/// type stores the top-left corner plus width and height.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Bounds {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// The x-coordinate of the right edge.
    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    /// The y-coordinate of the bottom edge.
    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    /// Center point of the rectangle.
    pub fn center(&self) -> (i32, i32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }

    /// Returns true if `inner` lies fully within this rectangle.
    pub fn contains(&self, inner: &Bounds) -> bool {
        inner.x >= self.x
            && inner.y >= self.y
            && inner.right() <= self.right()
            && inner.bottom() <= self.bottom()
    }

    /// Returns true if a point lies within this rectangle.
    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Returns true if this rectangle's center point lies within `outer`.
    pub fn center_inside(&self, outer: &Bounds) -> bool {
        let (cx, cy) = self.center();
        outer.contains_point(cx, cy)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Parses the Android `[x1,y1][x2,y2]` corner format.
    ///
    /// Returns `None` when the string does not follow the format; callers
    /// that tolerate malformed bounds substitute a zero rectangle.
    pub fn parse(raw: &str) -> Option<Bounds> {
        let trimmed = raw.trim();
        let inner = trimmed.strip_prefix('[')?.strip_suffix(']')?;
        let (first, second) = inner.split_once("][")?;
        let (x1, y1) = parse_point(first)?;
        let (x2, y2) = parse_point(second)?;
        Some(Bounds::new(x1, y1, x2 - x1, y2 - y1))
    }
}

fn parse_point(raw: &str) -> Option<(i32, i32)> {
    let (a, b) = raw.split_once(',')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

impl std::fmt::Display for Bounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{},{}][{},{}]",
            self.x,
            self.y,
            self.right(),
            self.bottom()
        )
    }
}

/// One node of a parsed page-source snapshot.
///
/// Elements are immutable after parsing. The `children` subtree is retained
/// so containment-based filters can reason about structure; `depth` is
/// assigned during pre-order flattening (0 for hierarchy roots, parent+1
/// below).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedElement {
    pub text: String,
    pub resource_id: String,
    pub content_desc: String,
    pub hint_text: String,
    pub class_name: String,
    pub bounds: Bounds,
    pub enabled: bool,
    pub selected: bool,
    pub focused: bool,
    pub displayed: bool,
    pub clickable: bool,
    pub scrollable: bool,
    pub children: Vec<ParsedElement>,
    pub depth: i32,
}

impl ParsedElement {
    /// The attribute values a text pattern is checked against, in order.
    pub fn text_candidates(&self) -> [&str; 3] {
        [&self.text, &self.content_desc, &self.hint_text]
    }

    /// Best human-readable label for diagnostics.
    pub fn display_label(&self) -> &str {
        if !self.text.is_empty() {
            &self.text
        } else if !self.content_desc.is_empty() {
            &self.content_desc
        } else if !self.resource_id.is_empty() {
            &self.resource_id
        } else {
            &self.class_name
        }
    }
}

/// The resolver's view of a located element.
///
/// `server_handle` is absent when the element was located exclusively via
/// page-source matching; such elements are interacted with through their
/// bounds (coordinate taps).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementInfo {
    pub server_handle: Option<String>,
    pub text: String,
    pub bounds: Bounds,
    pub visible: bool,
    pub enabled: bool,
    pub accessibility_label: String,
}

/// Snapshot of device-level state reported by the driver facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    pub serial: String,
    pub platform: String,
    pub screen_width: i32,
    pub screen_height: i32,
    pub orientation: String,
    pub foreground_app: Option<String>,
}
