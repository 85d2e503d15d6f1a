//! Step execution against a live device.
//!
//! [`StepExecutor`] maps every step kind onto resolver lookups, gestures
//! and shell commands, and wraps each outcome in exactly one
//! [`CommandResult`]. Resolver timeouts on optional steps become advisory
//! successes; hard shell and RPC errors always fail the step.
//!
//! Control-flow kinds (`repeat`, `retry`, `runFlow`, …) are interpreted by
//! the flow runner; sending one here reports a failure the same way the
//! runner-owned session actions do.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::driver::{Driver, DriverError};
use crate::element::{Bounds, DeviceState, ParsedElement};
use crate::hierarchy::{parse_hierarchy, render_hierarchy};
use crate::randomdata;
use crate::resolver::{ResolveMode, Resolved, Resolver, TimingConfig};
use crate::selector::Selector;
use crate::step::{CommandResult, Direction, Orientation, Step};

const DELETE_KEYCODE: u32 = 67;
const LONG_PRESS_DEFAULT_MS: u64 = 1000;
const SCROLL_UNTIL_VISIBLE_ATTEMPTS: u32 = 10;
const WAIT_UNTIL_DEFAULT_MS: u64 = 30_000;
const RECORDING_REMOTE_DIR: &str = "/sdcard";

/// Executes steps against one device.
pub struct StepExecutor {
    driver: Arc<dyn Driver>,
    timing: TimingConfig,
    serial: Option<String>,
    recording: Mutex<Option<String>>,
}

impl StepExecutor {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            timing: TimingConfig::default(),
            serial: None,
            recording: Mutex::new(None),
        }
    }

    /// Timing injection hook for tests.
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(self.driver.as_ref(), self.timing.clone())
    }

    /// Executes one step, returning exactly one result.
    pub async fn execute(&self, step: &Step) -> CommandResult {
        let start = Instant::now();
        debug!(kind = step.kind_name(), "executing step");
        let result = match self.dispatch(step).await {
            Ok(result) => result,
            Err(e) => {
                if step.is_optional() && matches!(e, DriverError::ResolverTimeout(_)) {
                    CommandResult::success(format!(
                        "Optional step '{}' skipped: {}",
                        step.kind_name(),
                        e
                    ))
                } else {
                    CommandResult::failure(format!("{} failed", step.kind_name()), e.to_string())
                }
            }
        };
        if !result.success {
            warn!(kind = step.kind_name(), message = %result.message, "step failed");
        }
        result.with_duration(start.elapsed())
    }

    async fn dispatch(&self, step: &Step) -> Result<CommandResult, DriverError> {
        match step {
            Step::TapOn(sel) => self.tap_on(sel).await,
            Step::DoubleTapOn(sel) => self.double_tap_on(sel).await,
            Step::LongPressOn(sel) => self.long_press_on(sel).await,
            Step::TapOnPoint { x, y, point } => self.tap_on_point(*x, *y, point.as_deref()).await,
            Step::Back => {
                self.driver.back().await?;
                Ok(CommandResult::success("Pressed back"))
            }
            Step::AssertVisible(sel) => Ok(self.assert_visible(sel).await),
            Step::AssertNotVisible(sel) => self.assert_not_visible(sel).await,
            Step::AssertTrue { condition } => Ok(self.assert_true(condition)),
            Step::InputText { text, selector } => self.input_text(text, selector.as_ref()).await,
            Step::InputRandom {
                data_type,
                length,
                selector,
            } => {
                let text = randomdata::generate(*data_type, *length);
                let result = self.input_text(&text, selector.as_ref()).await?;
                Ok(result.with_data(json!({ "text": text })))
            }
            Step::EraseText { chars } => self.erase_text(*chars).await,
            Step::HideKeyboard => {
                // KEYCODE_ESCAPE dismisses the soft keyboard without
                // navigating back.
                self.driver.press_key_code(111).await?;
                Ok(CommandResult::success("Hid the keyboard"))
            }
            Step::CopyTextFrom(sel) => self.copy_text_from(sel).await,
            Step::PasteText => self.paste_text().await,
            Step::SetClipboard { text } => {
                self.driver.set_clipboard(text).await?;
                Ok(CommandResult::success("Clipboard set"))
            }
            Step::Scroll { direction } => self.scroll(*direction).await,
            Step::ScrollUntilVisible {
                selector,
                direction,
            } => self.scroll_until_visible(selector, *direction).await,
            Step::Swipe {
                direction,
                start,
                end,
                duration_ms,
            } => {
                self.swipe(*direction, start.as_deref(), end.as_deref(), *duration_ms)
                    .await
            }
            Step::LaunchApp {
                app_id,
                clear_state,
                stop_app,
                permissions,
                arguments,
            } => {
                self.launch_app(
                    app_id.as_deref(),
                    *clear_state,
                    *stop_app,
                    permissions,
                    arguments,
                )
                .await
            }
            Step::StopApp { app_id } => {
                let app = require_app_id(app_id.as_deref())?;
                self.driver.shell(&["am", "force-stop", app]).await?;
                Ok(CommandResult::success(format!("Stopped app {}", app)))
            }
            Step::KillApp { app_id } => {
                let app = require_app_id(app_id.as_deref())?;
                self.driver.shell(&["am", "kill", app]).await?;
                Ok(CommandResult::success(format!("Killed app {}", app)))
            }
            Step::ClearState { app_id } => {
                let app = require_app_id(app_id.as_deref())?;
                self.driver.shell(&["pm", "clear", app]).await?;
                Ok(CommandResult::success(format!("Cleared state of {}", app)))
            }
            Step::ClearKeychain => Ok(CommandResult::success(
                "clearKeychain has no Android counterpart; continuing",
            )),
            Step::SetPermissions {
                app_id,
                permissions,
            } => {
                let app = require_app_id(app_id.as_deref())?;
                self.apply_permissions(app, permissions).await?;
                Ok(CommandResult::success(format!(
                    "Applied {} permission rule(s) to {}",
                    permissions.len(),
                    app
                )))
            }
            Step::SetOrientation { orientation } => self.set_orientation(*orientation).await,
            Step::OpenLink {
                url,
                browser,
                auto_verify,
            } => self.open_link(url, *browser, *auto_verify).await,
            Step::SetLocation {
                latitude,
                longitude,
            } => {
                self.set_location(*latitude, *longitude).await?;
                Ok(CommandResult::success(format!(
                    "Location set to ({}, {})",
                    latitude, longitude
                )))
            }
            Step::Travel { points, speed } => self.travel(points, *speed).await,
            Step::SetAirplaneMode { enabled } => {
                self.set_airplane_mode(*enabled).await?;
                Ok(CommandResult::success(format!(
                    "Airplane mode {}",
                    if *enabled { "enabled" } else { "disabled" }
                )))
            }
            Step::ToggleAirplaneMode => self.toggle_airplane_mode().await,
            Step::WaitUntil {
                visible,
                not_visible,
                timeout_ms,
            } => {
                self.wait_until(visible.as_ref(), not_visible.as_ref(), *timeout_ms)
                    .await
            }
            Step::WaitForAnimationToEnd { .. } => Ok(CommandResult::success(
                "waitForAnimationToEnd is not implemented; continuing",
            )),
            Step::TakeScreenshot { path } => self.take_screenshot(path).await,
            Step::StartRecording { path } => self.start_recording(path).await,
            Step::StopRecording => self.stop_recording().await,
            Step::AddMedia { files } => self.add_media(files).await,
            Step::PressKey { key } => self.press_key(key).await,
            Step::DefineVariables { .. }
            | Step::Repeat { .. }
            | Step::Retry { .. }
            | Step::RunFlow { .. }
            | Step::RunScript { .. }
            | Step::EvalScript { .. } => Ok(CommandResult::failure(
                format!("{} must be handled by the flow runner", step.kind_name()),
                "control-flow step reached the dispatcher",
            )),
            Step::Unsupported { step_kind, reason } => Ok(CommandResult::success(format!(
                "Step '{}' is not supported ({}); continuing",
                step_kind, reason
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Taps
    // -----------------------------------------------------------------------

    async fn tap_on(&self, sel: &Selector) -> Result<CommandResult, DriverError> {
        if let Some(point) = &sel.point {
            if sel.is_empty() {
                let size = self.driver.screen_size().await?;
                let (x, y) = parse_point(point, size.width, size.height).ok_or_else(|| {
                    DriverError::InvalidArgument(format!("invalid point '{}'", point))
                })?;
                self.repeat_taps(sel, x, y).await?;
                return Ok(CommandResult::success(format!("Tapped at ({}, {})", x, y)));
            }
            let resolved = self.resolver().resolve(sel, ResolveMode::TapPreferring).await?;
            let b = resolved.info.bounds;
            let (dx, dy) = parse_point(point, b.width, b.height).ok_or_else(|| {
                DriverError::InvalidArgument(format!("invalid point '{}'", point))
            })?;
            let (x, y) = (b.x + dx, b.y + dy);
            self.repeat_taps(sel, x, y).await?;
            return Ok(CommandResult::success(format!(
                "Tapped {} at ({}, {})",
                sel.description(),
                x,
                y
            ))
            .with_element(resolved.info));
        }

        let resolved = self.resolver().resolve(sel, ResolveMode::TapPreferring).await?;
        let repeats = sel.repeat.unwrap_or(1).max(1);
        for i in 0..repeats {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(sel.delay.unwrap_or(100))).await;
            }
            match &resolved.handle {
                Some(handle) => self.driver.click_element(handle).await?,
                None => {
                    let (x, y) = resolved.info.bounds.center();
                    self.driver.tap(x, y).await?;
                }
            }
        }
        self.settle(sel).await;
        Ok(
            CommandResult::success(format!("Tapped on {}", sel.description()))
                .with_element(resolved.info),
        )
    }

    async fn repeat_taps(&self, sel: &Selector, x: i32, y: i32) -> Result<(), DriverError> {
        let repeats = sel.repeat.unwrap_or(1).max(1);
        for i in 0..repeats {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(sel.delay.unwrap_or(100))).await;
            }
            self.driver.tap(x, y).await?;
        }
        self.settle(sel).await;
        Ok(())
    }

    async fn settle(&self, sel: &Selector) {
        if let Some(ms) = sel.wait_to_settle_timeout_ms {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    async fn double_tap_on(&self, sel: &Selector) -> Result<CommandResult, DriverError> {
        let resolved = self.resolver().resolve(sel, ResolveMode::TapPreferring).await?;
        match tap_target(&resolved) {
            Some((x, y)) => self.driver.double_tap(x, y).await?,
            None => {
                let handle = resolved.handle.as_ref().ok_or(DriverError::NotConnected)?;
                self.driver.click_element(handle).await?;
                self.driver.click_element(handle).await?;
            }
        }
        Ok(
            CommandResult::success(format!("Double-tapped on {}", sel.description()))
                .with_element(resolved.info),
        )
    }

    async fn long_press_on(&self, sel: &Selector) -> Result<CommandResult, DriverError> {
        let resolved = self.resolver().resolve(sel, ResolveMode::TapPreferring).await?;
        let duration = sel.delay.unwrap_or(LONG_PRESS_DEFAULT_MS);
        let (x, y) = tap_target(&resolved).ok_or_else(|| {
            DriverError::InvalidArgument("long press target has no bounds".to_string())
        })?;
        self.driver.long_press(x, y, duration).await?;
        Ok(
            CommandResult::success(format!("Long-pressed on {}", sel.description()))
                .with_element(resolved.info),
        )
    }

    async fn tap_on_point(
        &self,
        x: i32,
        y: i32,
        point: Option<&str>,
    ) -> Result<CommandResult, DriverError> {
        let (x, y) = match point {
            Some(p) => {
                let size = self.driver.screen_size().await?;
                parse_point(p, size.width, size.height).ok_or_else(|| {
                    DriverError::InvalidArgument(format!("invalid point '{}'", p))
                })?
            }
            None => {
                if x == 0 && y == 0 {
                    return Err(DriverError::InvalidArgument(
                        "tapOnPoint requires coordinates or a point".to_string(),
                    ));
                }
                (x, y)
            }
        };
        self.driver.tap(x, y).await?;
        Ok(CommandResult::success(format!("Tapped at ({}, {})", x, y)))
    }

    // -----------------------------------------------------------------------
    // Assertions and waits
    // -----------------------------------------------------------------------

    async fn assert_visible(&self, sel: &Selector) -> CommandResult {
        // Resolver failure fails the assertion even on optional steps.
        match self.resolver().resolve(sel, ResolveMode::Fast).await {
            Ok(resolved) if resolved.info.visible => CommandResult::success(format!(
                "Assertion passed: {} is visible",
                sel.description()
            ))
            .with_element(resolved.info),
            Ok(_) => CommandResult::failure(
                format!("Assertion failed: {} is not visible", sel.description()),
                "element found but not visible",
            ),
            Err(e) => CommandResult::failure(
                format!("Assertion failed: {} is not visible", sel.description()),
                e.to_string(),
            ),
        }
    }

    async fn assert_not_visible(&self, sel: &Selector) -> Result<CommandResult, DriverError> {
        let deadline = Instant::now() + self.resolver().timeout_for(sel);
        loop {
            match self.resolver().try_resolve_once(sel, ResolveMode::Fast).await? {
                None => {
                    return Ok(CommandResult::success(format!(
                        "Assertion passed: {} is not visible",
                        sel.description()
                    )));
                }
                Some(_) if Instant::now() >= deadline => {
                    return Ok(CommandResult::failure(
                        format!("Assertion failed: {} is still visible", sel.description()),
                        "element did not disappear before the deadline",
                    ));
                }
                Some(_) => {}
            }
        }
    }

    fn assert_true(&self, condition: &str) -> CommandResult {
        // Conditions arrive post-substitution; anything but an explicit
        // false passes. Script evaluation is an external collaborator.
        let falsy = matches!(condition.trim(), "false" | "0" | "");
        if falsy {
            CommandResult::failure(
                format!("Assertion failed: '{}' is not true", condition),
                "condition evaluated to false",
            )
        } else {
            CommandResult::success(format!("Assertion passed: '{}'", condition))
        }
    }

    async fn wait_until(
        &self,
        visible: Option<&Selector>,
        not_visible: Option<&Selector>,
        timeout_ms: Option<u64>,
    ) -> Result<CommandResult, DriverError> {
        let timeout = timeout_ms.unwrap_or(WAIT_UNTIL_DEFAULT_MS);
        let deadline = Instant::now() + Duration::from_millis(timeout);
        loop {
            if let Some(sel) = visible {
                if self
                    .resolver()
                    .try_resolve_once(sel, ResolveMode::Fast)
                    .await?
                    .is_some()
                {
                    return Ok(CommandResult::success(format!(
                        "{} became visible",
                        sel.description()
                    )));
                }
            }
            if let Some(sel) = not_visible {
                if self
                    .resolver()
                    .try_resolve_once(sel, ResolveMode::Fast)
                    .await?
                    .is_none()
                {
                    return Ok(CommandResult::success(format!(
                        "{} disappeared",
                        sel.description()
                    )));
                }
            }
            if Instant::now() >= deadline {
                let description = visible
                    .or(not_visible)
                    .map(|s| s.description())
                    .unwrap_or_else(|| "condition".to_string());
                return Ok(CommandResult::failure(
                    format!("Timed out waiting for {}", description),
                    format!("condition not met within {} ms", timeout),
                ));
            }
            tokio::time::sleep(Duration::from_millis(self.timing.poll_tick_ms)).await;
        }
    }

    // -----------------------------------------------------------------------
    // Text input
    // -----------------------------------------------------------------------

    async fn input_text(
        &self,
        text: &str,
        selector: Option<&Selector>,
    ) -> Result<CommandResult, DriverError> {
        let mut message = format!("Entered text '{}'", text);
        if !text.is_ascii() {
            message.push_str(" (non-ASCII characters may not reach the device)");
        }

        match selector {
            Some(sel) if !sel.is_empty() => {
                let resolved = self.resolver().resolve(sel, ResolveMode::TapPreferring).await?;
                match &resolved.handle {
                    Some(handle) => self.driver.send_keys_to_element(handle, text).await?,
                    None => {
                        let (x, y) = resolved.info.bounds.center();
                        self.driver.tap(x, y).await?;
                        self.driver.send_keys(text).await?;
                    }
                }
                Ok(CommandResult::success(message).with_element(resolved.info))
            }
            _ => {
                if let Some(handle) = self.driver.active_element().await? {
                    self.driver.send_keys_to_element(&handle, text).await?;
                    return Ok(CommandResult::success(message));
                }
                // No active element reported: fall back to whatever the
                // page source says holds focus.
                let focused = Selector {
                    focused: Some(true),
                    ..Default::default()
                };
                if let Some(resolved) = self
                    .resolver()
                    .try_resolve_once(&focused, ResolveMode::Full)
                    .await?
                {
                    let (x, y) = resolved.info.bounds.center();
                    self.driver.tap(x, y).await?;
                }
                self.driver.send_keys(text).await?;
                Ok(CommandResult::success(message))
            }
        }
    }

    async fn erase_text(&self, chars: u32) -> Result<CommandResult, DriverError> {
        if let Some(handle) = self.driver.active_element().await? {
            if let Ok(current) = self.driver.element_text(&handle).await {
                if !current.is_empty() {
                    let len = current.chars().count() as u32;
                    if chars >= len {
                        self.driver.clear_element(&handle).await?;
                    } else {
                        let keep: String =
                            current.chars().take((len - chars) as usize).collect();
                        self.driver.clear_element(&handle).await?;
                        self.driver.send_keys_to_element(&handle, &keep).await?;
                    }
                    return Ok(CommandResult::success(format!(
                        "Erased {} character(s)",
                        chars.min(len)
                    )));
                }
            }
        }
        for _ in 0..chars {
            self.driver.press_key_code(DELETE_KEYCODE).await?;
        }
        Ok(CommandResult::success(format!(
            "Erased up to {} character(s) via delete key",
            chars
        )))
    }

    // -----------------------------------------------------------------------
    // Clipboard
    // -----------------------------------------------------------------------

    async fn copy_text_from(&self, sel: &Selector) -> Result<CommandResult, DriverError> {
        let resolved = self.resolver().resolve(sel, ResolveMode::Full).await?;
        let mut text = resolved.info.text.clone();
        if text.is_empty() {
            if let Some(handle) = &resolved.handle {
                text = self
                    .driver
                    .element_attribute(handle, "contentDescription")
                    .await
                    .unwrap_or_default();
            }
        }
        if text.is_empty() {
            text = resolved.info.accessibility_label.clone();
        }
        self.driver.set_clipboard(&text).await?;
        Ok(
            CommandResult::success(format!("Copied text '{}'", text))
                .with_element(resolved.info)
                .with_data(json!({ "text": text })),
        )
    }

    async fn paste_text(&self) -> Result<CommandResult, DriverError> {
        let content = self.driver.clipboard().await?;
        match self.driver.active_element().await? {
            Some(handle) => self.driver.send_keys_to_element(&handle, &content).await?,
            None => self.driver.send_keys(&content).await?,
        }
        Ok(CommandResult::success(format!("Pasted '{}'", content)))
    }

    // -----------------------------------------------------------------------
    // Scrolling and swiping
    // -----------------------------------------------------------------------

    async fn scroll(&self, direction: Direction) -> Result<CommandResult, DriverError> {
        let size = self.driver.screen_size().await?;
        // Keep off the top and bottom eighth of the screen so the gesture
        // avoids the status bar and navigation areas.
        let area = Bounds::new(0, size.height / 8, size.width, size.height * 3 / 4);
        self.driver.scroll_in_area(area, direction, 300).await?;
        Ok(CommandResult::success(format!("Scrolled {:?}", direction)))
    }

    async fn scroll_until_visible(
        &self,
        sel: &Selector,
        direction: Direction,
    ) -> Result<CommandResult, DriverError> {
        let probe = Selector {
            timeout_ms: Some(self.timing.scroll_probe_timeout_ms),
            optional: false,
            ..sel.clone()
        };
        for attempt in 0..SCROLL_UNTIL_VISIBLE_ATTEMPTS {
            match self.resolver().resolve(&probe, ResolveMode::Fast).await {
                Ok(resolved) => {
                    return Ok(CommandResult::success(format!(
                        "{} became visible after {} scroll(s)",
                        sel.description(),
                        attempt
                    ))
                    .with_element(resolved.info));
                }
                Err(DriverError::ResolverTimeout(_)) => {
                    self.scroll(direction).await?;
                    tokio::time::sleep(Duration::from_millis(self.timing.scroll_settle_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(CommandResult::failure(
            format!(
                "{} did not become visible after {} scrolls",
                sel.description(),
                SCROLL_UNTIL_VISIBLE_ATTEMPTS
            ),
            "scrollUntilVisible exhausted its attempts",
        ))
    }

    async fn swipe(
        &self,
        direction: Option<Direction>,
        start: Option<&str>,
        end: Option<&str>,
        duration_ms: u64,
    ) -> Result<CommandResult, DriverError> {
        if let (Some(start), Some(end)) = (start, end) {
            let size = self.driver.screen_size().await?;
            let (sx, sy) = parse_point(start, size.width, size.height).ok_or_else(|| {
                DriverError::InvalidArgument(format!("invalid swipe start '{}'", start))
            })?;
            let (ex, ey) = parse_point(end, size.width, size.height).ok_or_else(|| {
                DriverError::InvalidArgument(format!("invalid swipe end '{}'", end))
            })?;
            // Coordinate swipes go through the shell.
            self.driver
                .shell(&[
                    "input",
                    "swipe",
                    &sx.to_string(),
                    &sy.to_string(),
                    &ex.to_string(),
                    &ey.to_string(),
                    &duration_ms.to_string(),
                ])
                .await?;
            return Ok(CommandResult::success(format!(
                "Swiped from ({}, {}) to ({}, {})",
                sx, sy, ex, ey
            )));
        }

        let direction = direction.ok_or_else(|| {
            DriverError::InvalidArgument("swipe needs a direction or start/end points".to_string())
        })?;
        let area = match self.find_scrollable_area().await? {
            Some(area) => area,
            None => {
                let size = self.driver.screen_size().await?;
                Bounds::new(0, 0, size.width, size.height)
            }
        };
        self.driver.swipe_in_area(area, direction, duration_ms).await?;
        Ok(CommandResult::success(format!("Swiped {:?}", direction)))
    }

    /// Polls the page source for a scrollable container: a single
    /// scrollable wins outright, several pick the largest area.
    async fn find_scrollable_area(&self) -> Result<Option<Bounds>, DriverError> {
        let deadline = Instant::now()
            + Duration::from_millis(self.timing.scrollable_lookup_timeout_ms);
        loop {
            let xml = self.driver.source().await?;
            let flat = parse_hierarchy(&xml)?;
            let scrollables: Vec<&ParsedElement> = flat
                .iter()
                .filter(|e| e.scrollable && !e.bounds.is_empty())
                .collect();
            match scrollables.len() {
                0 => {}
                1 => return Ok(Some(scrollables[0].bounds)),
                _ => {
                    let largest = scrollables
                        .iter()
                        .max_by_key(|e| e.bounds.width as i64 * e.bounds.height as i64)
                        .unwrap();
                    return Ok(Some(largest.bounds));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    // -----------------------------------------------------------------------
    // App lifecycle
    // -----------------------------------------------------------------------

    async fn launch_app(
        &self,
        app_id: Option<&str>,
        clear_state: bool,
        stop_app: Option<bool>,
        permissions: &std::collections::HashMap<String, String>,
        arguments: &std::collections::HashMap<String, serde_json::Value>,
    ) -> Result<CommandResult, DriverError> {
        let app = require_app_id(app_id)?;
        if stop_app.unwrap_or(true) {
            self.driver.shell(&["am", "force-stop", app]).await?;
        }
        if clear_state {
            // A pm clear failure propagates; a half-cleared app is worse
            // than a failed step.
            self.driver.shell(&["pm", "clear", app]).await?;
        }

        let effective: std::collections::HashMap<String, String> = if permissions.is_empty() {
            [("all".to_string(), "allow".to_string())].into()
        } else {
            permissions.clone()
        };
        self.apply_permissions(app, &effective).await?;

        if arguments.is_empty() {
            self.driver
                .shell(&[
                    "monkey",
                    "-p",
                    app,
                    "-c",
                    "android.intent.category.LAUNCHER",
                    "1",
                ])
                .await?;
        } else {
            let component = format!("{}/.MainActivity", app);
            let mut args: Vec<String> = vec![
                "am".to_string(),
                "start".to_string(),
                "-n".to_string(),
                component,
            ];
            args.extend(intent_extras(arguments));
            let borrowed: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
            self.driver.shell(&borrowed).await?;
        }

        tokio::time::sleep(Duration::from_millis(self.timing.launch_settle_ms)).await;
        Ok(CommandResult::success(format!("Launched app {}", app)))
    }

    async fn apply_permissions(
        &self,
        app: &str,
        permissions: &std::collections::HashMap<String, String>,
    ) -> Result<(), DriverError> {
        for (name, value) in permissions {
            let grant = matches!(value.to_ascii_lowercase().as_str(), "allow" | "grant" | "true");
            let verb = if grant { "grant" } else { "revoke" };
            for permission in expand_permission(name) {
                // Apps do not declare every permission; individual grant
                // failures are not fatal.
                if let Err(e) = self.driver.shell(&["pm", verb, app, &permission]).await {
                    debug!(permission = %permission, error = %e, "permission change rejected");
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Device controls
    // -----------------------------------------------------------------------

    async fn set_orientation(
        &self,
        orientation: Orientation,
    ) -> Result<CommandResult, DriverError> {
        match orientation {
            Orientation::Portrait => self.driver.set_orientation("PORTRAIT").await?,
            Orientation::Landscape => self.driver.set_orientation("LANDSCAPE").await?,
            extended => {
                let rotation = match extended {
                    Orientation::LandscapeLeft => "1",
                    Orientation::UpsideDown => "2",
                    Orientation::LandscapeRight => "3",
                    _ => unreachable!(),
                };
                self.driver
                    .shell(&["settings", "put", "system", "accelerometer_rotation", "0"])
                    .await?;
                self.driver
                    .shell(&["settings", "put", "system", "user_rotation", rotation])
                    .await?;
            }
        }
        Ok(CommandResult::success(format!(
            "Orientation set to {:?}",
            orientation
        )))
    }

    async fn open_link(
        &self,
        url: &str,
        browser: bool,
        auto_verify: bool,
    ) -> Result<CommandResult, DriverError> {
        let mut args = vec!["am", "start", "-a", "android.intent.action.VIEW", "-d", url];
        if browser {
            args.extend_from_slice(&["-c", "android.intent.category.BROWSABLE"]);
        }
        self.driver.shell(&args).await?;
        if auto_verify {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        Ok(CommandResult::success(format!("Opened link {}", url)))
    }

    async fn set_location(&self, latitude: f64, longitude: f64) -> Result<(), DriverError> {
        self.driver
            .shell(&[
                "am",
                "broadcast",
                "-a",
                "android.intent.action.MOCK_LOCATION",
                "--ef",
                "latitude",
                &latitude.to_string(),
                "--ef",
                "longitude",
                &longitude.to_string(),
            ])
            .await?;
        Ok(())
    }

    async fn travel(
        &self,
        points: &[(f64, f64)],
        speed: f64,
    ) -> Result<CommandResult, DriverError> {
        if points.is_empty() {
            return Err(DriverError::InvalidArgument(
                "travel needs at least one waypoint".to_string(),
            ));
        }
        if speed <= 0.0 {
            return Err(DriverError::InvalidArgument(
                "travel speed must be positive".to_string(),
            ));
        }
        let pause = Duration::from_secs_f64(3600.0 / speed);
        for (i, (lat, lon)) in points.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(pause).await;
            }
            self.set_location(*lat, *lon).await?;
        }
        Ok(CommandResult::success(format!(
            "Travelled through {} waypoint(s)",
            points.len()
        )))
    }

    async fn set_airplane_mode(&self, enabled: bool) -> Result<(), DriverError> {
        let value = if enabled { "1" } else { "0" };
        self.driver
            .shell(&["settings", "put", "global", "airplane_mode_on", value])
            .await?;
        self.driver
            .shell(&[
                "am",
                "broadcast",
                "-a",
                "android.intent.action.AIRPLANE_MODE",
                "--ez",
                "state",
                if enabled { "true" } else { "false" },
            ])
            .await?;
        Ok(())
    }

    async fn toggle_airplane_mode(&self) -> Result<CommandResult, DriverError> {
        let current = self
            .driver
            .shell(&["settings", "get", "global", "airplane_mode_on"])
            .await?;
        let enabled = current.trim() == "1";
        self.set_airplane_mode(!enabled).await?;
        Ok(CommandResult::success(format!(
            "Airplane mode toggled {}",
            if enabled { "off" } else { "on" }
        )))
    }

    // -----------------------------------------------------------------------
    // Media
    // -----------------------------------------------------------------------

    async fn take_screenshot(&self, path: &str) -> Result<CommandResult, DriverError> {
        let bytes = self.driver.screenshot().await?;
        let path = if path.ends_with(".png") {
            path.to_string()
        } else {
            format!("{}.png", path)
        };
        tokio::fs::write(&path, bytes).await?;
        Ok(CommandResult::success(format!("Screenshot saved to {}", path))
            .with_data(json!({ "path": path })))
    }

    async fn start_recording(&self, path: &str) -> Result<CommandResult, DriverError> {
        let name = std::path::Path::new(path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("recording");
        let remote = format!("{}/{}.mp4", RECORDING_REMOTE_DIR, name);
        self.driver
            .shell(&["sh", "-c", &format!("screenrecord {} &", remote)])
            .await?;
        *self.recording.lock().await = Some(remote.clone());
        Ok(CommandResult::success(format!("Recording to {}", remote)))
    }

    async fn stop_recording(&self) -> Result<CommandResult, DriverError> {
        self.driver.shell(&["pkill", "-INT", "screenrecord"]).await?;
        let remote = self.recording.lock().await.take();
        Ok(match remote {
            Some(remote) => CommandResult::success(format!("Recording stopped, file at {}", remote))
                .with_data(json!({ "path": remote })),
            None => CommandResult::success("Recording stopped"),
        })
    }

    async fn add_media(&self, files: &[String]) -> Result<CommandResult, DriverError> {
        for file in files {
            let name = std::path::Path::new(file)
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or(file.as_str());
            self.driver
                .shell(&[
                    "am",
                    "broadcast",
                    "-a",
                    "android.intent.action.MEDIA_SCANNER_SCAN_FILE",
                    "-d",
                    &format!("file://{}/{}", RECORDING_REMOTE_DIR, name),
                ])
                .await?;
        }
        Ok(CommandResult::success(format!(
            "Registered {} media file(s)",
            files.len()
        )))
    }

    async fn press_key(&self, key: &str) -> Result<CommandResult, DriverError> {
        let code = key_code(key).ok_or_else(|| {
            DriverError::InvalidArgument(format!("unknown key '{}'", key))
        })?;
        self.driver.press_key_code(code).await?;
        Ok(CommandResult::success(format!("Pressed key '{}'", key)))
    }

    // -----------------------------------------------------------------------
    // Facade surface
    // -----------------------------------------------------------------------

    /// Raw PNG bytes of the current screen.
    pub async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.driver.screenshot().await
    }

    /// The parsed page source plus an indented text rendering.
    pub async fn hierarchy(&self) -> Result<(Vec<ParsedElement>, String), DriverError> {
        let xml = self.driver.source().await?;
        let flat = parse_hierarchy(&xml)?;
        let rendered = render_hierarchy(&flat);
        Ok((flat, rendered))
    }

    /// Current device state snapshot.
    pub async fn get_state(&self) -> Result<DeviceState, DriverError> {
        let size = self.driver.screen_size().await?;
        let orientation = self.driver.orientation().await?;
        let foreground = self
            .driver
            .shell(&["dumpsys", "activity", "activities"])
            .await
            .ok()
            .and_then(|out| parse_foreground_app(&out));
        Ok(DeviceState {
            serial: self.serial.clone().unwrap_or_default(),
            platform: "android".to_string(),
            screen_width: size.width,
            screen_height: size.height,
            orientation,
            foreground_app: foreground,
        })
    }
}

fn require_app_id(app_id: Option<&str>) -> Result<&str, DriverError> {
    app_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DriverError::InvalidArgument("no appId given".to_string()))
}

fn tap_target(resolved: &Resolved) -> Option<(i32, i32)> {
    if resolved.info.bounds.is_empty() {
        None
    } else {
        Some(resolved.info.bounds.center())
    }
}

/// Parses `"50%, 25%"` (relative to the given dimensions) or `"540, 480"`
/// (absolute). Mixed forms are allowed per axis.
pub fn parse_point(raw: &str, width: i32, height: i32) -> Option<(i32, i32)> {
    let (a, b) = raw.split_once(',')?;
    let x = parse_coordinate(a, width)?;
    let y = parse_coordinate(b, height)?;
    Some((x, y))
}

fn parse_coordinate(raw: &str, dimension: i32) -> Option<i32> {
    let trimmed = raw.trim();
    if let Some(percent) = trimmed.strip_suffix('%') {
        let value: f64 = percent.trim().parse().ok()?;
        Some((dimension as f64 * value / 100.0).round() as i32)
    } else {
        trimmed.parse().ok()
    }
}

/// Builds typed `am start` extras from a launch-argument map.
fn intent_extras(arguments: &std::collections::HashMap<String, serde_json::Value>) -> Vec<String> {
    let mut keys: Vec<&String> = arguments.keys().collect();
    keys.sort();
    let mut out = Vec::new();
    for key in keys {
        match &arguments[key] {
            serde_json::Value::Bool(b) => {
                out.extend(["--ez".to_string(), key.clone(), b.to_string()]);
            }
            serde_json::Value::Number(n) if n.is_i64() => {
                out.extend(["--ei".to_string(), key.clone(), n.to_string()]);
            }
            serde_json::Value::Number(n) => {
                out.extend(["--ef".to_string(), key.clone(), n.to_string()]);
            }
            other => {
                let value = match other {
                    serde_json::Value::String(s) => s.clone(),
                    v => v.to_string(),
                };
                out.extend(["--es".to_string(), key.clone(), value]);
            }
        }
    }
    out
}

/// Extracts the foreground package from `dumpsys activity activities`.
fn parse_foreground_app(dumpsys: &str) -> Option<String> {
    dumpsys
        .lines()
        .find(|line| line.contains("mResumedActivity") || line.contains("topResumedActivity"))
        .and_then(|line| {
            line.split_whitespace()
                .find(|token| token.contains('/'))
                .map(|component| component.split('/').next().unwrap_or("").to_string())
        })
        .filter(|pkg| !pkg.is_empty())
}

/// Maps the named keys of `pressKey` to Android key codes.
fn key_code(name: &str) -> Option<u32> {
    let normalized: String = name
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    let code = match normalized.as_str() {
        "home" => 3,
        "back" => 4,
        "volumeup" => 24,
        "volumedown" => 25,
        "power" => 26,
        "camera" => 27,
        "space" => 62,
        "tab" => 61,
        "enter" => 66,
        "backspace" => 67,
        "escape" => 111,
        "delete" => 112,
        "menu" => 82,
        "search" => 84,
        "appswitch" => 187,
        _ => return None,
    };
    Some(code)
}

/// Translates a permission shortcut (or raw permission name) to the
/// concrete `android.permission.*` constants it covers.
fn expand_permission(name: &str) -> Vec<String> {
    const PREFIX: &str = "android.permission.";
    let shortcut: &[&str] = match name.to_ascii_lowercase().as_str() {
        "location" => &["ACCESS_FINE_LOCATION", "ACCESS_COARSE_LOCATION"],
        "camera" => &["CAMERA"],
        "contacts" => &["READ_CONTACTS", "WRITE_CONTACTS"],
        "phone" => &["CALL_PHONE", "READ_PHONE_STATE"],
        "microphone" => &["RECORD_AUDIO"],
        "bluetooth" => &["BLUETOOTH_CONNECT", "BLUETOOTH_SCAN"],
        "storage" => &["READ_EXTERNAL_STORAGE", "WRITE_EXTERNAL_STORAGE"],
        "notifications" => &["POST_NOTIFICATIONS"],
        "medialibrary" => &["READ_MEDIA_IMAGES", "READ_MEDIA_VIDEO", "READ_MEDIA_AUDIO"],
        "calendar" => &["READ_CALENDAR", "WRITE_CALENDAR"],
        "sms" => &["READ_SMS", "SEND_SMS", "RECEIVE_SMS"],
        "sensors" => &["BODY_SENSORS"],
        "all" => {
            return [
                "location",
                "camera",
                "contacts",
                "phone",
                "microphone",
                "storage",
                "notifications",
                "calendar",
                "sms",
                "sensors",
            ]
            .iter()
            .flat_map(|s| expand_permission(s))
            .collect();
        }
        _ => {
            // Raw constants pass through; bare names are uppercased and
            // prefixed.
            if name.starts_with(PREFIX) {
                return vec![name.to_string()];
            }
            return vec![format!("{}{}", PREFIX, name.to_ascii_uppercase())];
        }
    };
    shortcut.iter().map(|s| format!("{}{}", PREFIX, s)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeDriver;

    fn executor(driver: &Arc<FakeDriver>) -> StepExecutor {
        let timing = TimingConfig {
            default_timeout_ms: 60,
            optional_timeout_ms: 40,
            scroll_settle_ms: 1,
            scroll_probe_timeout_ms: 20,
            scrollable_lookup_timeout_ms: 40,
            launch_settle_ms: 1,
            poll_tick_ms: 5,
        };
        StepExecutor::new(driver.clone()).with_timing(timing)
    }

    // -- Point parsing ------------------------------------------------------

    #[test]
    fn percentage_points_scale_with_screen() {
        assert_eq!(parse_point("50%, 25%", 1080, 1920), Some((540, 480)));
        assert_eq!(parse_point("100%,100%", 1080, 1920), Some((1080, 1920)));
        assert_eq!(parse_point("540, 480", 1080, 1920), Some((540, 480)));
        assert_eq!(parse_point("50%, 480", 1080, 1920), Some((540, 480)));
        assert_eq!(parse_point("garbage", 1080, 1920), None);
    }

    // -- Taps ---------------------------------------------------------------

    #[tokio::test]
    async fn tap_on_point_percentage() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let step = Step::TapOnPoint {
            x: 0,
            y: 0,
            point: Some("50%, 25%".to_string()),
        };
        let result = exec.execute(&step).await;
        assert!(result.success, "{}", result.message);
        assert_eq!(driver.recorded(), vec!["tap 540,480"]);
    }

    #[tokio::test]
    async fn tap_on_point_origin_without_point_is_an_error() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::TapOnPoint {
                x: 0,
                y: 0,
                point: None,
            })
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("coordinates"));
    }

    #[tokio::test]
    async fn tap_on_clicks_server_handle() {
        let driver = FakeDriver::new()
            .with_element("clickable(true).textContains(\"Login\")", "h-1")
            .with_element_text("h-1", "Login")
            .with_element_bounds("h-1", Bounds::new(0, 0, 100, 40));
        let driver = Arc::new(driver);
        let exec = executor(&driver);
        let result = exec.execute(&Step::TapOn(Selector::from_text("Login"))).await;
        assert!(result.success);
        assert_eq!(driver.recorded(), vec!["click_element h-1"]);
    }

    #[tokio::test]
    async fn tap_on_falls_back_to_bounds_center() {
        let driver = FakeDriver::new().with_source(
            r#"<hierarchy>
<node class="v" clickable="true" text="Login" bounds="[100,400][300,500]"/>
</hierarchy>"#,
        );
        let driver = Arc::new(driver);
        let exec = executor(&driver);
        let result = exec.execute(&Step::TapOn(Selector::from_text("Login"))).await;
        assert!(result.success, "{}", result.message);
        assert_eq!(driver.recorded(), vec!["tap 200,450"]);
    }

    #[tokio::test]
    async fn optional_tap_timeout_becomes_advisory_success() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let step = Step::TapOn(Selector {
            optional: true,
            timeout_ms: Some(20),
            ..Selector::from_text("Ghost")
        });
        let result = exec.execute(&step).await;
        assert!(result.success);
        assert!(result.message.contains("Optional step"));
    }

    #[tokio::test]
    async fn non_optional_tap_timeout_fails() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let step = Step::TapOn(Selector {
            timeout_ms: Some(20),
            ..Selector::from_text("Ghost")
        });
        let result = exec.execute(&step).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Ghost"));
    }

    #[tokio::test]
    async fn long_press_uses_default_duration() {
        let driver = FakeDriver::new().with_source(
            r#"<hierarchy>
<node class="v" clickable="true" text="Item" bounds="[0,0][100,100]"/>
</hierarchy>"#,
        );
        let driver = Arc::new(driver);
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::LongPressOn(Selector::from_text("Item")))
            .await;
        assert!(result.success);
        assert_eq!(driver.recorded(), vec!["long_press 50,50 1000"]);
    }

    // -- Assertions ---------------------------------------------------------

    #[tokio::test]
    async fn assert_visible_fails_even_when_optional() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let step = Step::AssertVisible(Selector {
            optional: true,
            timeout_ms: Some(20),
            ..Selector::from_text("Ghost")
        });
        let result = exec.execute(&step).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn assert_not_visible_succeeds_on_absence() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let step = Step::AssertNotVisible(Selector {
            timeout_ms: Some(20),
            ..Selector::from_text("Ghost")
        });
        let result = exec.execute(&step).await;
        assert!(result.success, "{}", result.message);
    }

    #[tokio::test]
    async fn assert_not_visible_fails_while_element_persists() {
        let driver = FakeDriver::new().with_source(
            r#"<hierarchy><node class="v" text="Sticky" bounds="[0,0][10,10]"/></hierarchy>"#,
        );
        let driver = Arc::new(driver);
        let exec = executor(&driver);
        let step = Step::AssertNotVisible(Selector {
            timeout_ms: Some(30),
            ..Selector::from_text("Sticky")
        });
        let result = exec.execute(&step).await;
        assert!(!result.success);
        assert!(result.message.contains("still visible"));
    }

    // -- Input --------------------------------------------------------------

    #[tokio::test]
    async fn input_text_targets_active_element() {
        let driver = FakeDriver::new().with_active_element("h-field");
        let driver = Arc::new(driver);
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::InputText {
                text: "hello".to_string(),
                selector: None,
            })
            .await;
        assert!(result.success);
        assert_eq!(
            driver.recorded(),
            vec!["send_keys_to_element h-field hello"]
        );
    }

    #[tokio::test]
    async fn input_text_warns_on_non_ascii() {
        let driver = FakeDriver::new().with_active_element("h-field");
        let driver = Arc::new(driver);
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::InputText {
                text: "héllo".to_string(),
                selector: None,
            })
            .await;
        assert!(result.success);
        assert!(result.message.contains("non-ASCII"));
    }

    #[tokio::test]
    async fn input_text_falls_back_to_focused_element() {
        let driver = FakeDriver::new().with_source(
            r#"<hierarchy>
<node class="android.widget.EditText" focused="true" bounds="[100,300][900,380]"/>
</hierarchy>"#,
        );
        let driver = Arc::new(driver);
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::InputText {
                text: "abc".to_string(),
                selector: None,
            })
            .await;
        assert!(result.success);
        let recorded = driver.recorded();
        assert_eq!(recorded, vec!["tap 500,340", "send_keys abc"]);
    }

    #[tokio::test]
    async fn erase_text_clears_whole_field() {
        let driver = FakeDriver::new()
            .with_active_element("h-field")
            .with_element_text("h-field", "short");
        let driver = Arc::new(driver);
        let exec = executor(&driver);
        let result = exec.execute(&Step::EraseText { chars: 50 }).await;
        assert!(result.success);
        assert_eq!(driver.recorded(), vec!["clear_element h-field"]);
    }

    #[tokio::test]
    async fn erase_text_keeps_prefix() {
        let driver = FakeDriver::new()
            .with_active_element("h-field")
            .with_element_text("h-field", "abcdefgh");
        let driver = Arc::new(driver);
        let exec = executor(&driver);
        let result = exec.execute(&Step::EraseText { chars: 3 }).await;
        assert!(result.success);
        assert_eq!(
            driver.recorded(),
            vec!["clear_element h-field", "send_keys_to_element h-field abcde"]
        );
    }

    #[tokio::test]
    async fn erase_text_falls_back_to_delete_presses() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let result = exec.execute(&Step::EraseText { chars: 4 }).await;
        assert!(result.success);
        assert_eq!(
            driver.recorded(),
            vec!["press_key_code 67"; 4]
        );
    }

    // -- Clipboard ----------------------------------------------------------

    #[tokio::test]
    async fn copy_text_prefers_element_text() {
        let driver = FakeDriver::new()
            .with_element("textContains(\"Code\")", "h-code")
            .with_element_text("h-code", "Code: XYZ-123")
            .with_element_bounds("h-code", Bounds::new(0, 0, 10, 10));
        let driver = Arc::new(driver);
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::CopyTextFrom(Selector::from_text("Code")))
            .await;
        assert!(result.success);
        assert_eq!(driver.clipboard_content(), "Code: XYZ-123");
    }

    #[tokio::test]
    async fn copy_text_falls_back_to_content_description() {
        let driver = FakeDriver::new()
            .with_element("textContains(\"Icon\")", "h-icon")
            .with_element_bounds("h-icon", Bounds::new(0, 0, 10, 10))
            .with_attribute("h-icon", "contentDescription", "Icon description");
        let driver = Arc::new(driver);
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::CopyTextFrom(Selector::from_text("Icon")))
            .await;
        assert!(result.success);
        assert_eq!(driver.clipboard_content(), "Icon description");
    }

    #[tokio::test]
    async fn paste_text_sends_clipboard_to_active_element() {
        let driver = FakeDriver::new()
            .with_active_element("h-field")
            .with_clipboard("copied!");
        let driver = Arc::new(driver);
        let exec = executor(&driver);
        let result = exec.execute(&Step::PasteText).await;
        assert!(result.success);
        assert_eq!(
            driver.recorded(),
            vec!["send_keys_to_element h-field copied!"]
        );
    }

    // -- Scroll and swipe ---------------------------------------------------

    #[tokio::test]
    async fn scroll_down_swipes_finger_up() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::Scroll {
                direction: Direction::Down,
            })
            .await;
        assert!(result.success);
        let recorded = driver.recorded();
        assert_eq!(recorded.len(), 1);
        // Scroll area: y in [240, 1680]; finger moves from high y to low y.
        let parts: Vec<&str> = recorded[0].split_whitespace().collect();
        assert_eq!(parts[0], "swipe");
        let start_y: i32 = parts[1].split(',').nth(1).unwrap().parse().unwrap();
        let end_y: i32 = parts[3].split(',').nth(1).unwrap().parse().unwrap();
        assert!(start_y > end_y, "scroll down must swipe the finger up");
    }

    #[tokio::test]
    async fn coordinate_swipe_goes_through_the_shell() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::Swipe {
                direction: None,
                start: Some("10%, 50%".to_string()),
                end: Some("90%, 50%".to_string()),
                duration_ms: 300,
            })
            .await;
        assert!(result.success);
        assert_eq!(
            driver.recorded(),
            vec!["shell input swipe 108 960 972 960 300"]
        );
    }

    #[tokio::test]
    async fn direction_swipe_uses_scrollable_container() {
        let driver = FakeDriver::new().with_source(
            r#"<hierarchy>
<node class="android.widget.ScrollView" scrollable="true" bounds="[0,200][1080,1800]"/>
</hierarchy>"#,
        );
        let driver = Arc::new(driver);
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::Swipe {
                direction: Some(Direction::Up),
                start: None,
                end: None,
                duration_ms: 300,
            })
            .await;
        assert!(result.success);
        let recorded = driver.recorded();
        // Swipe stays inside [200, 1800].
        let parts: Vec<&str> = recorded[0].split_whitespace().collect();
        let start_y: i32 = parts[1].split(',').nth(1).unwrap().parse().unwrap();
        assert!(start_y > 200 && start_y < 1800);
    }

    #[tokio::test]
    async fn direction_swipe_falls_back_to_whole_screen() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::Swipe {
                direction: Some(Direction::Left),
                start: None,
                end: None,
                duration_ms: 250,
            })
            .await;
        assert!(result.success);
        let recorded = driver.recorded();
        assert!(recorded[0].starts_with("swipe"));
    }

    #[tokio::test]
    async fn scroll_until_visible_stops_when_found() {
        let visible = r#"<hierarchy><node class="v" text="Row 42" bounds="[0,500][1080,560]"/></hierarchy>"#;
        let driver = FakeDriver::new()
            .with_source_sequence(&["<hierarchy></hierarchy>", "<hierarchy></hierarchy>", visible]);
        let driver = Arc::new(driver);
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::ScrollUntilVisible {
                selector: Selector::from_text("Row 42"),
                direction: Direction::Down,
            })
            .await;
        assert!(result.success, "{}", result.message);
        let scrolls = driver
            .recorded()
            .iter()
            .filter(|a| a.starts_with("swipe"))
            .count();
        assert!(scrolls >= 1, "should scroll before the element appears");
    }

    // -- App lifecycle ------------------------------------------------------

    #[tokio::test]
    async fn launch_app_runs_the_full_shell_sequence() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::LaunchApp {
                app_id: Some("com.example.app".to_string()),
                clear_state: true,
                stop_app: None,
                permissions: Default::default(),
                arguments: Default::default(),
            })
            .await;
        assert!(result.success, "{}", result.message);
        let recorded = driver.recorded();
        assert_eq!(recorded[0], "shell am force-stop com.example.app");
        assert_eq!(recorded[1], "shell pm clear com.example.app");
        assert!(recorded
            .iter()
            .any(|a| a.contains("pm grant com.example.app android.permission.CAMERA")));
        assert!(recorded
            .last()
            .unwrap()
            .contains("monkey -p com.example.app -c android.intent.category.LAUNCHER 1"));
    }

    #[tokio::test]
    async fn launch_app_clear_state_failure_propagates() {
        let driver = FakeDriver::new().with_shell_failure("pm clear");
        let driver = Arc::new(driver);
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::LaunchApp {
                app_id: Some("com.example.app".to_string()),
                clear_state: true,
                stop_app: Some(false),
                permissions: Default::default(),
                arguments: Default::default(),
            })
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn launch_app_with_arguments_uses_am_start() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let mut arguments = std::collections::HashMap::new();
        arguments.insert("user".to_string(), json!("alice"));
        arguments.insert("count".to_string(), json!(3));
        arguments.insert("ratio".to_string(), json!(0.5));
        arguments.insert("debug".to_string(), json!(true));
        let result = exec
            .execute(&Step::LaunchApp {
                app_id: Some("com.example.app".to_string()),
                clear_state: false,
                stop_app: Some(false),
                permissions: [("all".to_string(), "allow".to_string())].into(),
                arguments,
            })
            .await;
        assert!(result.success);
        let launch = driver
            .recorded()
            .into_iter()
            .find(|a| a.contains("am start"))
            .unwrap();
        assert!(launch.contains("-n com.example.app/.MainActivity"));
        assert!(launch.contains("--es user alice"));
        assert!(launch.contains("--ei count 3"));
        assert!(launch.contains("--ef ratio 0.5"));
        assert!(launch.contains("--ez debug true"));
    }

    // -- Device controls ----------------------------------------------------

    #[tokio::test]
    async fn standard_orientations_use_the_server() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::SetOrientation {
                orientation: Orientation::Landscape,
            })
            .await;
        assert!(result.success);
        assert_eq!(
            driver.recorded(),
            vec!["set_orientation LANDSCAPE"]
        );
    }

    #[tokio::test]
    async fn extended_orientations_write_user_rotation() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::SetOrientation {
                orientation: Orientation::UpsideDown,
            })
            .await;
        assert!(result.success);
        let recorded = driver.recorded();
        assert_eq!(
            recorded,
            vec![
                "shell settings put system accelerometer_rotation 0",
                "shell settings put system user_rotation 2",
            ]
        );
    }

    #[tokio::test]
    async fn open_link_browser_adds_browsable_category() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::OpenLink {
                url: "https://example.com?q=a b".to_string(),
                browser: true,
                auto_verify: false,
            })
            .await;
        assert!(result.success);
        let recorded = driver.recorded();
        assert!(recorded[0].contains("android.intent.action.VIEW"));
        assert!(recorded[0].contains("android.intent.category.BROWSABLE"));
        assert!(recorded[0].contains("https://example.com?q=a b"));
    }

    #[tokio::test]
    async fn toggle_airplane_mode_reads_before_writing() {
        let driver = FakeDriver::new().with_shell_response("settings get global airplane_mode_on", "1");
        let driver = Arc::new(driver);
        let exec = executor(&driver);
        let result = exec.execute(&Step::ToggleAirplaneMode).await;
        assert!(result.success);
        let recorded = driver.recorded();
        assert_eq!(recorded[0], "shell settings get global airplane_mode_on");
        assert!(recorded[1].contains("airplane_mode_on 0"));
    }

    #[tokio::test]
    async fn press_key_maps_names_to_codes() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::PressKey {
                key: "Volume Up".to_string(),
            })
            .await;
        assert!(result.success);
        assert_eq!(driver.recorded(), vec!["press_key_code 24"]);

        let result = exec
            .execute(&Step::PressKey {
                key: "hyperspace".to_string(),
            })
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("unknown key"));
    }

    #[tokio::test]
    async fn wait_until_visible_returns_on_match() {
        let visible = r#"<hierarchy><node class="v" text="Done" bounds="[0,0][10,10]"/></hierarchy>"#;
        let driver = FakeDriver::new().with_source_sequence(&["<hierarchy></hierarchy>", visible]);
        let driver = Arc::new(driver);
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::WaitUntil {
                visible: Some(Selector::from_text("Done")),
                not_visible: None,
                timeout_ms: Some(500),
            })
            .await;
        assert!(result.success, "{}", result.message);
    }

    #[tokio::test]
    async fn wait_until_times_out_with_description() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::WaitUntil {
                visible: Some(Selector::from_text("Never")),
                not_visible: None,
                timeout_ms: Some(15),
            })
            .await;
        assert!(!result.success);
        assert!(result.message.contains("Never"));
    }

    #[tokio::test]
    async fn unsupported_step_passes_with_warning() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::Unsupported {
                step_kind: "assertWithAI".to_string(),
                reason: "unknown step kind".to_string(),
            })
            .await;
        assert!(result.success);
        assert!(result.message.contains("not supported"));
    }

    #[tokio::test]
    async fn wait_for_animation_passes_with_warning() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::WaitForAnimationToEnd { timeout_ms: None })
            .await;
        assert!(result.success);
        assert!(result.message.contains("not implemented"));
    }

    #[tokio::test]
    async fn control_flow_steps_are_rejected() {
        let driver = Arc::new(FakeDriver::new());
        let exec = executor(&driver);
        let result = exec
            .execute(&Step::Repeat {
                times: Some("2".to_string()),
                while_visible: None,
                commands: vec![],
            })
            .await;
        assert!(!result.success);
        assert!(result.message.contains("flow runner"));
    }

    // -- Helper tables ------------------------------------------------------

    #[test]
    fn permission_shortcuts_expand() {
        assert_eq!(
            expand_permission("location"),
            vec![
                "android.permission.ACCESS_FINE_LOCATION",
                "android.permission.ACCESS_COARSE_LOCATION"
            ]
        );
        assert_eq!(
            expand_permission("android.permission.READ_SMS"),
            vec!["android.permission.READ_SMS"]
        );
        assert_eq!(
            expand_permission("write_external_storage"),
            vec!["android.permission.WRITE_EXTERNAL_STORAGE"]
        );
        let all = expand_permission("all");
        assert!(all.len() > 10);
        assert!(all.contains(&"android.permission.RECORD_AUDIO".to_string()));
    }

    #[test]
    fn foreground_app_parses_from_dumpsys() {
        let dumpsys = "  mResumedActivity: ActivityRecord{1234 u0 com.example.app/.MainActivity t42}";
        assert_eq!(
            parse_foreground_app(dumpsys).as_deref(),
            Some("com.example.app")
        );
        assert_eq!(parse_foreground_app("no activities"), None);
    }

    #[test]
    fn intent_extras_are_typed() {
        let mut args = std::collections::HashMap::new();
        args.insert("s".to_string(), json!("text"));
        args.insert("i".to_string(), json!(7));
        args.insert("f".to_string(), json!(1.5));
        args.insert("b".to_string(), json!(false));
        let extras = intent_extras(&args);
        let joined = extras.join(" ");
        assert!(joined.contains("--es s text"));
        assert!(joined.contains("--ei i 7"));
        assert!(joined.contains("--ef f 1.5"));
        assert!(joined.contains("--ez b false"));
    }
}
