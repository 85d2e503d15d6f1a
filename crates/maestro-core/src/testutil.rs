//! Scripted fake driver for resolver and dispatcher tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::driver::{Driver, DriverError, ElementHandle, ScreenSize};
use crate::element::Bounds;
use crate::locator::Locator;

/// A [`Driver`] whose answers are scripted up front.
///
/// Locator matching is by substring: a registered needle matches any
/// expression containing it. Shell responses work the same way against the
/// space-joined argv. Every interaction is recorded in `actions` so tests
/// can assert on what the dispatcher actually did.
pub struct FakeDriver {
    sources: Mutex<Vec<String>>,
    elements: Vec<(String, String)>,
    texts: Vec<(String, String)>,
    bounds: Vec<(String, Bounds)>,
    attributes: Vec<(String, String, String)>,
    shell_responses: Vec<(String, String)>,
    shell_failures: Vec<String>,
    active: Option<String>,
    screen: ScreenSize,
    clipboard: Mutex<String>,
    orientation: Mutex<String>,
    pub actions: Mutex<Vec<String>>,
    source_calls: AtomicUsize,
    find_calls: AtomicUsize,
    text_calls: AtomicUsize,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(vec!["<hierarchy></hierarchy>".to_string()]),
            elements: Vec::new(),
            texts: Vec::new(),
            bounds: Vec::new(),
            attributes: Vec::new(),
            shell_responses: Vec::new(),
            shell_failures: Vec::new(),
            active: None,
            screen: ScreenSize {
                width: 1080,
                height: 1920,
            },
            clipboard: Mutex::new(String::new()),
            orientation: Mutex::new("PORTRAIT".to_string()),
            actions: Mutex::new(Vec::new()),
            source_calls: AtomicUsize::new(0),
            find_calls: AtomicUsize::new(0),
            text_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_source(self, xml: &str) -> Self {
        *self.sources.lock().unwrap() = vec![xml.to_string()];
        self
    }

    /// Page sources served in order; the last one repeats.
    pub fn with_source_sequence(self, sources: &[&str]) -> Self {
        *self.sources.lock().unwrap() = sources.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Registers a server-side hit: any expression containing `needle`
    /// resolves to `handle`.
    pub fn with_element(mut self, needle: &str, handle: &str) -> Self {
        self.elements.push((needle.to_string(), handle.to_string()));
        self
    }

    pub fn with_element_text(mut self, handle: &str, text: &str) -> Self {
        self.texts.push((handle.to_string(), text.to_string()));
        self
    }

    pub fn with_element_bounds(mut self, handle: &str, bounds: Bounds) -> Self {
        self.bounds.push((handle.to_string(), bounds));
        self
    }

    pub fn with_attribute(mut self, handle: &str, name: &str, value: &str) -> Self {
        self.attributes
            .push((handle.to_string(), name.to_string(), value.to_string()));
        self
    }

    pub fn with_shell_response(mut self, needle: &str, response: &str) -> Self {
        self.shell_responses
            .push((needle.to_string(), response.to_string()));
        self
    }

    /// Any shell command containing `needle` fails.
    pub fn with_shell_failure(mut self, needle: &str) -> Self {
        self.shell_failures.push(needle.to_string());
        self
    }

    pub fn with_active_element(mut self, handle: &str) -> Self {
        self.active = Some(handle.to_string());
        self
    }

    pub fn with_screen(mut self, width: i32, height: i32) -> Self {
        self.screen = ScreenSize { width, height };
        self
    }

    pub fn with_clipboard(self, content: &str) -> Self {
        *self.clipboard.lock().unwrap() = content.to_string();
        self
    }

    pub fn source_fetches(&self) -> usize {
        self.source_calls.load(Ordering::SeqCst)
    }

    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    pub fn text_fetches(&self) -> usize {
        self.text_calls.load(Ordering::SeqCst)
    }

    pub fn recorded(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }

    pub fn clipboard_content(&self) -> String {
        self.clipboard.lock().unwrap().clone()
    }

    fn log(&self, entry: String) {
        self.actions.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn find_element(&self, locator: &Locator) -> Result<Option<ElementHandle>, DriverError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .elements
            .iter()
            .find(|(needle, _)| locator.expression.contains(needle.as_str()))
            .map(|(_, handle)| handle.clone()))
    }

    async fn active_element(&self) -> Result<Option<ElementHandle>, DriverError> {
        Ok(self.active.clone())
    }

    async fn element_text(&self, element: &ElementHandle) -> Result<String, DriverError> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .texts
            .iter()
            .find(|(h, _)| h == element)
            .map(|(_, t)| t.clone())
            .unwrap_or_default())
    }

    async fn element_bounds(&self, element: &ElementHandle) -> Result<Bounds, DriverError> {
        Ok(self
            .bounds
            .iter()
            .find(|(h, _)| h == element)
            .map(|(_, b)| *b)
            .unwrap_or_default())
    }

    async fn element_attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<String, DriverError> {
        Ok(self
            .attributes
            .iter()
            .find(|(h, n, _)| h == element && n == name)
            .map(|(_, _, v)| v.clone())
            .unwrap_or_default())
    }

    async fn click_element(&self, element: &ElementHandle) -> Result<(), DriverError> {
        self.log(format!("click_element {}", element));
        Ok(())
    }

    async fn clear_element(&self, element: &ElementHandle) -> Result<(), DriverError> {
        self.log(format!("clear_element {}", element));
        Ok(())
    }

    async fn send_keys_to_element(
        &self,
        element: &ElementHandle,
        text: &str,
    ) -> Result<(), DriverError> {
        self.log(format!("send_keys_to_element {} {}", element, text));
        Ok(())
    }

    async fn send_keys(&self, text: &str) -> Result<(), DriverError> {
        self.log(format!("send_keys {}", text));
        Ok(())
    }

    async fn tap(&self, x: i32, y: i32) -> Result<(), DriverError> {
        self.log(format!("tap {},{}", x, y));
        Ok(())
    }

    async fn double_tap(&self, x: i32, y: i32) -> Result<(), DriverError> {
        self.log(format!("double_tap {},{}", x, y));
        Ok(())
    }

    async fn long_press(&self, x: i32, y: i32, duration_ms: u64) -> Result<(), DriverError> {
        self.log(format!("long_press {},{} {}", x, y, duration_ms));
        Ok(())
    }

    async fn swipe(
        &self,
        start_x: i32,
        start_y: i32,
        end_x: i32,
        end_y: i32,
        duration_ms: u64,
    ) -> Result<(), DriverError> {
        self.log(format!(
            "swipe {},{} -> {},{} {}",
            start_x, start_y, end_x, end_y, duration_ms
        ));
        Ok(())
    }

    async fn back(&self) -> Result<(), DriverError> {
        self.log("back".to_string());
        Ok(())
    }

    async fn press_key_code(&self, keycode: u32) -> Result<(), DriverError> {
        self.log(format!("press_key_code {}", keycode));
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.log("screenshot".to_string());
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn source(&self) -> Result<String, DriverError> {
        self.source_calls.fetch_add(1, Ordering::SeqCst);
        let mut sources = self.sources.lock().unwrap();
        if sources.len() > 1 {
            Ok(sources.remove(0))
        } else {
            Ok(sources[0].clone())
        }
    }

    async fn orientation(&self) -> Result<String, DriverError> {
        Ok(self.orientation.lock().unwrap().clone())
    }

    async fn set_orientation(&self, orientation: &str) -> Result<(), DriverError> {
        self.log(format!("set_orientation {}", orientation));
        *self.orientation.lock().unwrap() = orientation.to_string();
        Ok(())
    }

    async fn clipboard(&self) -> Result<String, DriverError> {
        Ok(self.clipboard.lock().unwrap().clone())
    }

    async fn set_clipboard(&self, content: &str) -> Result<(), DriverError> {
        self.log(format!("set_clipboard {}", content));
        *self.clipboard.lock().unwrap() = content.to_string();
        Ok(())
    }

    async fn screen_size(&self) -> Result<ScreenSize, DriverError> {
        Ok(self.screen)
    }

    async fn shell(&self, args: &[&str]) -> Result<String, DriverError> {
        let joined = args.join(" ");
        self.log(format!("shell {}", joined));
        if self
            .shell_failures
            .iter()
            .any(|needle| joined.contains(needle.as_str()))
        {
            return Err(DriverError::Shell(crate::adb::AdbError::CommandFailed(
                format!("scripted failure for '{}'", joined),
            )));
        }
        Ok(self
            .shell_responses
            .iter()
            .find(|(needle, _)| joined.contains(needle.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_default())
    }
}
