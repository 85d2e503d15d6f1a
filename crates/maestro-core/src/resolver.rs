//! Deadline-bounded element resolution.
//!
//! The resolver turns a [`Selector`] into a located element. Three modes
//! exist: `Fast` answers found-or-not in one server round-trip, `Full`
//! also populates text and bounds, and `TapPreferring` biases toward
//! clickable matches with a page-source handoff for text that sits on a
//! non-clickable node.
//!
//! Dispatch by selector shape: relational criteria go to the page-source
//! relational branch (the server cannot evaluate position algebra), size
//! criteria go to the plain page-source branch, everything else polls
//! server locators with a late page-source fallback.
//!
//! Polling loops never sleep; the RPC round-trip is the natural
//! rate-limiter. Within the relational branch each iteration fetches the
//! page source exactly once, and anchor recursion reuses that snapshot.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::driver::{Driver, DriverError, ElementHandle};
use crate::element::{ElementInfo, ParsedElement};
use crate::hierarchy::parse_hierarchy;
use crate::locator::{clickable_locators, server_locators, Locator};
use crate::selector::{
    filter_above, filter_below, filter_by_selector, filter_child_of, filter_contains_child,
    filter_contains_descendants, filter_inside_of, filter_left_of, filter_right_of,
    pick_candidate, promote_to_clickable, Selector,
};

/// How much of the element the caller needs back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Found-or-not only; one round-trip. Used by visibility checks.
    Fast,
    /// Populate text and bounds; up to three round-trips.
    Full,
    /// Prefer clickable matches, with a text-exists fallback through the
    /// page source.
    TapPreferring,
}

/// Timing knobs, overridable from tests.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Resolver deadline for non-optional selectors without an explicit
    /// timeout.
    pub default_timeout_ms: u64,
    /// Resolver deadline for optional selectors.
    pub optional_timeout_ms: u64,
    /// Sleep between scroll iterations in `scrollUntilVisible`.
    pub scroll_settle_ms: u64,
    /// Per-iteration resolve deadline inside `scrollUntilVisible`.
    pub scroll_probe_timeout_ms: u64,
    /// How long a direction-only swipe looks for a scrollable container.
    pub scrollable_lookup_timeout_ms: u64,
    /// Settle time after launching an app.
    pub launch_settle_ms: u64,
    /// Ticker period for cheap polled checks (`waitUntil`).
    pub poll_tick_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 17_000,
            optional_timeout_ms: 7_000,
            scroll_settle_ms: 300,
            scroll_probe_timeout_ms: 1_000,
            scrollable_lookup_timeout_ms: 10_000,
            launch_settle_ms: 1_000,
            poll_tick_ms: 1_000,
        }
    }
}

/// A located element: the server handle when one exists, and what is known
/// about the element.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub handle: Option<ElementHandle>,
    pub info: ElementInfo,
}

/// Resolves selectors against a live device under a deadline.
pub struct Resolver<'a> {
    driver: &'a dyn Driver,
    timing: TimingConfig,
}

impl<'a> Resolver<'a> {
    pub fn new(driver: &'a dyn Driver, timing: TimingConfig) -> Self {
        Self { driver, timing }
    }

    /// Deadline selection: an explicit positive step timeout wins, then the
    /// optional default, then the standard default.
    pub fn timeout_for(&self, sel: &Selector) -> Duration {
        let ms = match sel.timeout_ms {
            Some(t) if t > 0 => t,
            _ if sel.optional => self.timing.optional_timeout_ms,
            _ => self.timing.default_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    /// Resolves with the selector-derived deadline.
    pub async fn resolve(
        &self,
        sel: &Selector,
        mode: ResolveMode,
    ) -> Result<Resolved, DriverError> {
        let deadline = Instant::now() + self.timeout_for(sel);
        self.resolve_with_deadline(sel, mode, deadline).await
    }

    /// Resolves until `deadline`.
    pub async fn resolve_with_deadline(
        &self,
        sel: &Selector,
        mode: ResolveMode,
        deadline: Instant,
    ) -> Result<Resolved, DriverError> {
        if sel.has_relational() {
            return self.relational_loop(sel, deadline).await;
        }
        if sel.has_size() || server_locators(sel).is_empty() {
            return self.page_source_loop(sel, deadline).await;
        }
        if mode == ResolveMode::TapPreferring {
            return self.tap_loop(sel, deadline).await;
        }
        self.server_loop(sel, mode, deadline).await
    }

    /// A single zero-wait resolution attempt; `Ok(None)` means cleanly not
    /// found right now. Used by `assertNotVisible` and `waitUntil`.
    pub async fn try_resolve_once(
        &self,
        sel: &Selector,
        mode: ResolveMode,
    ) -> Result<Option<Resolved>, DriverError> {
        if sel.has_relational() {
            let xml = self.driver.source().await?;
            let flat = parse_hierarchy(&xml)?;
            return Ok(self.relational_once(sel, &flat));
        }
        if sel.has_size() || server_locators(sel).is_empty() {
            return self.page_source_once(sel).await;
        }
        if let Some(handle) = self.sweep(&server_locators(sel)).await? {
            return Ok(Some(self.materialize(handle, mode).await?));
        }
        if sel.text.is_some() {
            return self.page_source_once(sel).await;
        }
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Server-locator branch
    // -----------------------------------------------------------------------

    async fn server_loop(
        &self,
        sel: &Selector,
        mode: ResolveMode,
        deadline: Instant,
    ) -> Result<Resolved, DriverError> {
        let locators = server_locators(sel);
        loop {
            if let Some(handle) = self.sweep(&locators).await? {
                return self.materialize(handle, mode).await;
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        // One page-source pass before failing: catches hint text and
        // content descriptions on elements the server rejects.
        if sel.text.is_some() || sel.id.is_some() {
            if let Some(resolved) = self.page_source_once(sel).await? {
                return Ok(resolved);
            }
        }
        Err(DriverError::ResolverTimeout(sel.description()))
    }

    async fn tap_loop(&self, sel: &Selector, deadline: Instant) -> Result<Resolved, DriverError> {
        let clickable = clickable_locators(sel);
        let plain = server_locators(sel);
        loop {
            if let Some(handle) = self.sweep(&clickable).await? {
                return self.materialize(handle, ResolveMode::Full).await;
            }
            if let Some(handle) = self.sweep(&plain).await? {
                // The text exists but is not itself clickable: one
                // page-source search picks the deepest match and walks up
                // to the nearest clickable ancestor.
                debug!(selector = %sel.description(), "match is not clickable, searching page source");
                if let Some(resolved) = self.page_source_once(sel).await? {
                    return Ok(resolved);
                }
                return self.materialize(handle, ResolveMode::Full).await;
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        if sel.text.is_some() || sel.id.is_some() {
            if let Some(resolved) = self.page_source_once(sel).await? {
                return Ok(resolved);
            }
        }
        Err(DriverError::ResolverTimeout(sel.description()))
    }

    async fn sweep(&self, locators: &[Locator]) -> Result<Option<ElementHandle>, DriverError> {
        for locator in locators {
            if let Some(handle) = self.driver.find_element(locator).await? {
                return Ok(Some(handle));
            }
        }
        Ok(None)
    }

    async fn materialize(
        &self,
        handle: ElementHandle,
        mode: ResolveMode,
    ) -> Result<Resolved, DriverError> {
        let info = match mode {
            ResolveMode::Fast => ElementInfo {
                visible: true,
                enabled: true,
                ..Default::default()
            },
            ResolveMode::Full | ResolveMode::TapPreferring => {
                let text = self.driver.element_text(&handle).await?;
                let bounds = self.driver.element_bounds(&handle).await?;
                ElementInfo {
                    server_handle: Some(handle.clone()),
                    text,
                    bounds,
                    visible: true,
                    enabled: true,
                    accessibility_label: String::new(),
                }
            }
        };
        Ok(Resolved {
            handle: Some(handle),
            info,
        })
    }

    // -----------------------------------------------------------------------
    // Page-source branch
    // -----------------------------------------------------------------------

    async fn page_source_loop(
        &self,
        sel: &Selector,
        deadline: Instant,
    ) -> Result<Resolved, DriverError> {
        loop {
            if let Some(resolved) = self.page_source_once(sel).await? {
                return Ok(resolved);
            }
            if Instant::now() >= deadline {
                return Err(DriverError::ResolverTimeout(sel.description()));
            }
        }
    }

    async fn page_source_once(&self, sel: &Selector) -> Result<Option<Resolved>, DriverError> {
        let xml = self.driver.source().await?;
        let flat = parse_hierarchy(&xml)?;
        let candidates = filter_by_selector(&flat, &sel.strip_relational());
        Ok(pick_candidate(&candidates, sel.index.as_deref())
            .map(|picked| resolved_from_snapshot(&flat, picked)))
    }

    // -----------------------------------------------------------------------
    // Relational branch
    // -----------------------------------------------------------------------

    async fn relational_loop(
        &self,
        sel: &Selector,
        deadline: Instant,
    ) -> Result<Resolved, DriverError> {
        loop {
            // Exactly one page-source fetch per iteration; all filtering in
            // this iteration, anchors included, runs off this snapshot.
            let xml = self.driver.source().await?;
            let flat = parse_hierarchy(&xml)?;
            if let Some(resolved) = self.relational_once(sel, &flat) {
                return Ok(resolved);
            }
            if Instant::now() >= deadline {
                return Err(DriverError::ResolverTimeout(sel.description()));
            }
        }
    }

    fn relational_once(&self, sel: &Selector, flat: &[ParsedElement]) -> Option<Resolved> {
        let candidates = relational_candidates(sel, flat);
        let picked = pick_candidate(&candidates, sel.index.as_deref())?;
        Some(resolved_from_snapshot(flat, picked))
    }
}

/// Applies a selector's relational criteria against one snapshot.
///
/// Anchors are resolved recursively from the same element list, never from
/// a second fetch. When several elements match an anchor selector, the
/// first anchor whose positional filter yields a non-empty set wins.
pub fn relational_candidates(sel: &Selector, flat: &[ParsedElement]) -> Vec<ParsedElement> {
    let direct = sel.strip_relational();
    let mut candidates = if direct.has_direct() {
        filter_by_selector(flat, &direct)
    } else {
        flat.to_vec()
    };

    type PositionalFilter = fn(&[ParsedElement], &ParsedElement) -> Vec<ParsedElement>;
    let positional: [(&Option<Box<Selector>>, PositionalFilter); 7] = [
        (&sel.below, filter_below),
        (&sel.above, filter_above),
        (&sel.left_of, filter_left_of),
        (&sel.right_of, filter_right_of),
        (&sel.child_of, filter_child_of),
        (&sel.contains_child, filter_contains_child),
        (&sel.inside_of, filter_inside_of),
    ];

    for (anchor_sel, filter) in positional {
        let Some(anchor_sel) = anchor_sel else {
            continue;
        };
        let anchors = anchor_candidates(anchor_sel, flat);
        let mut narrowed = Vec::new();
        for anchor in &anchors {
            let result = filter(&candidates, anchor);
            if !result.is_empty() {
                narrowed = result;
                break;
            }
        }
        candidates = narrowed;
        if candidates.is_empty() {
            return candidates;
        }
    }

    if !sel.contains_descendants.is_empty() {
        candidates = filter_contains_descendants(candidates, flat, &sel.contains_descendants);
    }
    candidates
}

fn anchor_candidates(anchor: &Selector, flat: &[ParsedElement]) -> Vec<ParsedElement> {
    if anchor.has_relational() {
        // The anchor itself is relational: re-enter on the already-parsed
        // snapshot.
        relational_candidates(anchor, flat)
    } else {
        filter_by_selector(flat, anchor)
    }
}

/// Builds element info from a page-source pick, walking up to the nearest
/// clickable ancestor for the tappable bounds while keeping the matched
/// element's text.
fn resolved_from_snapshot(flat: &[ParsedElement], picked: ParsedElement) -> Resolved {
    let promoted = promote_to_clickable(flat, &picked);
    let text = if picked.text.is_empty() {
        promoted.text.clone()
    } else {
        picked.text.clone()
    };
    Resolved {
        handle: None,
        info: ElementInfo {
            server_handle: None,
            text,
            bounds: promoted.bounds,
            visible: picked.displayed,
            enabled: picked.enabled,
            accessibility_label: picked.content_desc.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Bounds;
    use crate::testutil::FakeDriver;

    fn short(sel: Selector) -> Selector {
        Selector {
            timeout_ms: Some(60),
            ..sel
        }
    }

    const DEEP_MATCH_SOURCE: &str = r#"<hierarchy>
<node class="android.widget.FrameLayout" resource-id="com.app:id/root" bounds="[0,0][1080,1920]">
  <node class="android.widget.LinearLayout" bounds="[0,0][1080,900]">
    <node class="android.widget.Button" resource-id="com.app:id/button" text="Go" clickable="true" bounds="[100,200][300,280]"/>
  </node>
</node>
</hierarchy>"#;

    const LEAF_TEXT_SOURCE: &str = r#"<hierarchy>
<node class="android.widget.FrameLayout" bounds="[0,0][1080,1920]">
  <node class="android.view.ViewGroup" clickable="true" bounds="[0,400][1080,600]">
    <node class="android.widget.TextView" text="Submit" bounds="[100,450][400,500]"/>
  </node>
</node>
</hierarchy>"#;

    #[test]
    fn timeout_selection_order() {
        let driver = FakeDriver::new();
        let resolver = Resolver::new(&driver, TimingConfig::default());

        let explicit = Selector {
            timeout_ms: Some(1234),
            optional: true,
            ..Default::default()
        };
        assert_eq!(resolver.timeout_for(&explicit), Duration::from_millis(1234));

        let optional = Selector {
            optional: true,
            ..Default::default()
        };
        assert_eq!(resolver.timeout_for(&optional), Duration::from_millis(7000));

        assert_eq!(
            resolver.timeout_for(&Selector::default()),
            Duration::from_millis(17_000)
        );

        // A zero timeout is treated as unset.
        let zeroed = Selector {
            timeout_ms: Some(0),
            ..Default::default()
        };
        assert_eq!(resolver.timeout_for(&zeroed), Duration::from_millis(17_000));
    }

    #[tokio::test]
    async fn server_hit_returns_handle() {
        let driver = FakeDriver::new()
            .with_element("textContains(\"Login\")", "h-login")
            .with_element_text("h-login", "Login")
            .with_element_bounds("h-login", Bounds::new(10, 20, 100, 40));
        let resolver = Resolver::new(&driver, TimingConfig::default());

        let resolved = resolver
            .resolve(&short(Selector::from_text("Login")), ResolveMode::Full)
            .await
            .unwrap();
        assert_eq!(resolved.handle.as_deref(), Some("h-login"));
        assert_eq!(resolved.info.text, "Login");
        assert_eq!(resolved.info.bounds, Bounds::new(10, 20, 100, 40));
    }

    #[tokio::test]
    async fn fast_mode_skips_attribute_fetches() {
        let driver = FakeDriver::new().with_element("textContains(\"Login\")", "h-login");
        let resolver = Resolver::new(&driver, TimingConfig::default());

        let resolved = resolver
            .resolve(&short(Selector::from_text("Login")), ResolveMode::Fast)
            .await
            .unwrap();
        assert!(resolved.info.visible);
        assert_eq!(resolved.info.bounds, Bounds::default());
        assert_eq!(driver.text_fetches(), 0);
    }

    #[tokio::test]
    async fn deepest_match_wins_on_page_source() {
        let driver = FakeDriver::new().with_source(DEEP_MATCH_SOURCE);
        let resolver = Resolver::new(&driver, TimingConfig::default());

        let sel = short(Selector {
            id: Some("com.app".to_string()),
            ..Default::default()
        });
        let resolved = resolver.resolve(&sel, ResolveMode::Full).await.unwrap();
        assert!(resolved.handle.is_none());
        assert_eq!(resolved.info.bounds, Bounds::new(100, 200, 200, 80));
    }

    #[tokio::test]
    async fn tap_resolve_walks_to_clickable_ancestor() {
        // The plain locator hits (text exists) but the clickable variant
        // never does, so the resolver hands off to the page source.
        let driver = FakeDriver::new()
            .with_source(LEAF_TEXT_SOURCE)
            .with_element("new UiSelector().textContains(\"Submit\")", "h-text");
        let resolver = Resolver::new(&driver, TimingConfig::default());

        let resolved = resolver
            .resolve(
                &short(Selector::from_text("Submit")),
                ResolveMode::TapPreferring,
            )
            .await
            .unwrap();
        assert!(resolved.handle.is_none());
        assert_eq!(resolved.info.bounds, Bounds::new(0, 400, 1080, 200));
        assert_eq!(resolved.info.text, "Submit");
    }

    #[tokio::test]
    async fn clickable_server_hit_short_circuits_tap_resolve() {
        let driver = FakeDriver::new()
            .with_element("clickable(true).textContains(\"Submit\")", "h-button")
            .with_element_text("h-button", "Submit")
            .with_element_bounds("h-button", Bounds::new(0, 0, 10, 10));
        let resolver = Resolver::new(&driver, TimingConfig::default());

        let resolved = resolver
            .resolve(
                &short(Selector::from_text("Submit")),
                ResolveMode::TapPreferring,
            )
            .await
            .unwrap();
        assert_eq!(resolved.handle.as_deref(), Some("h-button"));
        assert_eq!(driver.source_fetches(), 0);
    }

    #[tokio::test]
    async fn size_selector_uses_page_source() {
        let driver = FakeDriver::new().with_source(DEEP_MATCH_SOURCE);
        let resolver = Resolver::new(&driver, TimingConfig::default());

        let sel = short(Selector {
            width: Some(200),
            height: Some(80),
            ..Default::default()
        });
        let resolved = resolver.resolve(&sel, ResolveMode::Full).await.unwrap();
        assert_eq!(resolved.info.bounds, Bounds::new(100, 200, 200, 80));
        assert_eq!(driver.find_calls(), 0);
    }

    #[tokio::test]
    async fn relational_branch_fetches_source_once_per_iteration() {
        let driver = FakeDriver::new().with_source(
            r#"<hierarchy>
<node class="a" text="Header" bounds="[0,0][1080,100]"/>
<node class="b" text="Row" bounds="[0,120][1080,200]"/>
<node class="c" text="Value" bounds="[0,220][1080,300]"/>
</hierarchy>"#,
        );
        let resolver = Resolver::new(&driver, TimingConfig::default());

        // Nested relational anchor: Value below (Row below Header).
        let sel = short(Selector {
            text: Some("Value".to_string()),
            below: Some(Box::new(Selector {
                text: Some("Row".to_string()),
                below: Some(Box::new(Selector::from_text("Header"))),
                ..Default::default()
            })),
            ..Default::default()
        });
        let resolved = resolver.resolve(&sel, ResolveMode::Full).await.unwrap();
        assert_eq!(resolved.info.text, "Value");
        assert_eq!(
            driver.source_fetches(),
            1,
            "anchor recursion must reuse the snapshot"
        );
    }

    #[tokio::test]
    async fn relational_prefers_first_productive_anchor() {
        // Two elements match the anchor text; only the second has anything
        // below it.
        let driver = FakeDriver::new().with_source(
            r#"<hierarchy>
<node class="a" text="Label" bounds="[0,1800][1080,1900]"/>
<node class="b" text="Label" bounds="[0,100][1080,160]"/>
<node class="c" text="Target" bounds="[0,200][1080,260]"/>
</hierarchy>"#,
        );
        let resolver = Resolver::new(&driver, TimingConfig::default());

        let sel = short(Selector {
            text: Some("Target".to_string()),
            below: Some(Box::new(Selector::from_text("Label"))),
            ..Default::default()
        });
        let resolved = resolver.resolve(&sel, ResolveMode::Full).await.unwrap();
        assert_eq!(resolved.info.bounds, Bounds::new(0, 200, 1080, 60));
    }

    #[tokio::test]
    async fn contains_descendants_narrows_candidates() {
        let driver = FakeDriver::new().with_source(
            r#"<hierarchy>
<node class="card" bounds="[0,0][540,300]">
  <node class="t" text="Basic" bounds="[10,10][200,50]"/>
</node>
<node class="card" bounds="[540,0][1080,300]">
  <node class="t" text="Premium" bounds="[550,10][760,50]"/>
  <node class="t" text="$9.99" bounds="[550,60][700,100]"/>
</node>
</hierarchy>"#,
        );
        let resolver = Resolver::new(&driver, TimingConfig::default());

        let sel = short(Selector {
            contains_descendants: vec![
                Selector::from_text("Premium"),
                Selector::from_text("9.99"),
            ],
            ..Default::default()
        });
        let resolved = resolver.resolve(&sel, ResolveMode::Full).await.unwrap();
        assert_eq!(resolved.info.bounds.x, 540);
    }

    #[tokio::test]
    async fn miss_times_out_with_description() {
        let driver = FakeDriver::new().with_source("<hierarchy></hierarchy>");
        let resolver = Resolver::new(&driver, TimingConfig::default());

        let err = resolver
            .resolve(&short(Selector::from_text("Ghost")), ResolveMode::Full)
            .await
            .unwrap_err();
        match err {
            DriverError::ResolverTimeout(description) => {
                assert!(description.contains("Ghost"));
            }
            other => panic!("expected ResolverTimeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn page_source_fallback_catches_hint_text() {
        // The server never matches, but the page source carries the text
        // as a hint.
        let driver = FakeDriver::new().with_source(
            r#"<hierarchy>
<node class="android.widget.EditText" hint="Email address" bounds="[100,300][900,380]"/>
</hierarchy>"#,
        );
        let resolver = Resolver::new(&driver, TimingConfig::default());

        let resolved = resolver
            .resolve(&short(Selector::from_text("Email address")), ResolveMode::Full)
            .await
            .unwrap();
        assert!(resolved.handle.is_none());
        assert_eq!(resolved.info.bounds, Bounds::new(100, 300, 800, 80));
    }

    #[tokio::test]
    async fn try_resolve_once_reports_clean_miss() {
        let driver = FakeDriver::new().with_source("<hierarchy></hierarchy>");
        let resolver = Resolver::new(&driver, TimingConfig::default());

        let outcome = resolver
            .try_resolve_once(&Selector::from_text("Ghost"), ResolveMode::Fast)
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn optional_flag_does_not_change_strategies() {
        let driver = FakeDriver::new()
            .with_element("textContains(\"Login\")", "h-login")
            .with_element_text("h-login", "Login")
            .with_element_bounds("h-login", Bounds::new(0, 0, 10, 10));
        let resolver = Resolver::new(&driver, TimingConfig::default());

        let sel = Selector {
            optional: true,
            ..Selector::from_text("Login")
        };
        let resolved = resolver.resolve(&sel, ResolveMode::Full).await.unwrap();
        assert_eq!(resolved.handle.as_deref(), Some("h-login"));
    }
}
