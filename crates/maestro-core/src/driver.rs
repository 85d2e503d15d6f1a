//! Backend-agnostic automation driver trait.
//!
//! [`Driver`] is the capability set the resolver and step dispatcher work
//! against: element lookup, gestures, device queries, and shell execution.
//! [`AndroidDriver`] wires it into the UIAutomator2 server plus adb; an iOS
//! backend would wire the same surface into its own automation server.
//!
//! Area-scoped scroll and swipe come with default implementations so
//! backends only provide the primitive gesture.

use async_trait::async_trait;
use thiserror::Error;

use crate::adb::{Adb, AdbError};
use crate::element::Bounds;
use crate::hierarchy::HierarchyError;
use crate::locator::Locator;
use crate::step::Direction;
use crate::uia2::{Uia2Client, Uia2Error};

/// Port the UIAutomator2 server listens on device-side.
pub const UIA2_DEVICE_PORT: u16 = 6790;

/// Opaque server-side element reference.
pub type ElementHandle = String;

/// Errors that can occur during driver operations.
///
/// Unifies shell, RPC and resolution failures behind one type so the step
/// dispatcher can handle them uniformly.
#[derive(Error, Debug)]
pub enum DriverError {
    /// A selector was not matched before its deadline; carries the
    /// selector's description.
    #[error("Element not found before deadline: {0}")]
    ResolverTimeout(String),

    /// The device shell returned a non-zero exit or failed to run.
    #[error("Shell error: {0}")]
    Shell(#[from] AdbError),

    /// The automation server rejected or failed a request.
    #[error("RPC error: {0}")]
    Rpc(#[from] Uia2Error),

    /// The page source could not be parsed.
    #[error("Page source error: {0}")]
    Hierarchy(#[from] HierarchyError),

    /// No device/session is available.
    #[error("Not connected to a device")]
    NotConnected,

    /// A step payload was structurally valid but semantically unusable.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Screen dimensions reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenSize {
    pub width: i32,
    pub height: i32,
}

/// Capability set for UI automation backends.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Runs one server-side locator; `Ok(None)` means cleanly not found.
    async fn find_element(&self, locator: &Locator) -> Result<Option<ElementHandle>, DriverError>;

    /// The element currently holding focus, when the backend knows it.
    async fn active_element(&self) -> Result<Option<ElementHandle>, DriverError>;

    async fn element_text(&self, element: &ElementHandle) -> Result<String, DriverError>;

    async fn element_bounds(&self, element: &ElementHandle) -> Result<Bounds, DriverError>;

    async fn element_attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<String, DriverError>;

    async fn click_element(&self, element: &ElementHandle) -> Result<(), DriverError>;

    async fn clear_element(&self, element: &ElementHandle) -> Result<(), DriverError>;

    async fn send_keys_to_element(
        &self,
        element: &ElementHandle,
        text: &str,
    ) -> Result<(), DriverError>;

    /// Types into whatever currently holds focus.
    async fn send_keys(&self, text: &str) -> Result<(), DriverError>;

    async fn tap(&self, x: i32, y: i32) -> Result<(), DriverError>;

    async fn double_tap(&self, x: i32, y: i32) -> Result<(), DriverError>;

    async fn long_press(&self, x: i32, y: i32, duration_ms: u64) -> Result<(), DriverError>;

    async fn swipe(
        &self,
        start_x: i32,
        start_y: i32,
        end_x: i32,
        end_y: i32,
        duration_ms: u64,
    ) -> Result<(), DriverError>;

    async fn back(&self) -> Result<(), DriverError>;

    async fn press_key_code(&self, keycode: u32) -> Result<(), DriverError>;

    /// Raw PNG bytes of the current screen.
    async fn screenshot(&self) -> Result<Vec<u8>, DriverError>;

    /// The live XML page source.
    async fn source(&self) -> Result<String, DriverError>;

    async fn orientation(&self) -> Result<String, DriverError>;

    async fn set_orientation(&self, orientation: &str) -> Result<(), DriverError>;

    async fn clipboard(&self) -> Result<String, DriverError>;

    async fn set_clipboard(&self, content: &str) -> Result<(), DriverError>;

    async fn screen_size(&self) -> Result<ScreenSize, DriverError>;

    /// Runs a device shell command (argv form) and returns stdout.
    async fn shell(&self, args: &[&str]) -> Result<String, DriverError>;

    /// Swipes inside an area following the finger direction: vertical
    /// motion spans 70% to 30% of the area's height, horizontal motion the
    /// same share of its width, the cross axis stays centered.
    async fn swipe_in_area(
        &self,
        area: Bounds,
        direction: Direction,
        duration_ms: u64,
    ) -> Result<(), DriverError> {
        let (sx, sy, ex, ey) = swipe_coordinates(&area, direction);
        self.swipe(sx, sy, ex, ey, duration_ms).await
    }

    /// Scrolls content inside an area. Scroll direction is the inverse of
    /// the finger direction: "scroll down" reveals content below, so the
    /// finger swipes up.
    async fn scroll_in_area(
        &self,
        area: Bounds,
        direction: Direction,
        duration_ms: u64,
    ) -> Result<(), DriverError> {
        self.swipe_in_area(area, invert(direction), duration_ms)
            .await
    }
}

/// Finger direction that produces the given scroll direction.
pub fn invert(direction: Direction) -> Direction {
    match direction {
        Direction::Up => Direction::Down,
        Direction::Down => Direction::Up,
        Direction::Left => Direction::Right,
        Direction::Right => Direction::Left,
    }
}

/// Start and end points of a finger swipe inside an area.
pub fn swipe_coordinates(area: &Bounds, direction: Direction) -> (i32, i32, i32, i32) {
    let mid_x = area.x + area.width / 2;
    let mid_y = area.y + area.height / 2;
    let y_high = area.y + area.height * 7 / 10;
    let y_low = area.y + area.height * 3 / 10;
    let x_high = area.x + area.width * 7 / 10;
    let x_low = area.x + area.width * 3 / 10;
    match direction {
        Direction::Up => (mid_x, y_high, mid_x, y_low),
        Direction::Down => (mid_x, y_low, mid_x, y_high),
        Direction::Left => (x_high, mid_y, x_low, mid_y),
        Direction::Right => (x_low, mid_y, x_high, mid_y),
    }
}

/// Android backend: UIAutomator2 server for UI capabilities, adb for the
/// shell capability.
pub struct AndroidDriver {
    client: Uia2Client,
    adb: Adb,
    serial: String,
}

impl AndroidDriver {
    /// Forwards a local port to the on-device server and opens a session.
    ///
    /// `wait_for_idle_timeout_ms` is applied as the server's idle setting;
    /// 0 disables idle waiting.
    pub async fn connect(
        serial: &str,
        local_port: u16,
        wait_for_idle_timeout_ms: u64,
    ) -> Result<Self, DriverError> {
        let adb = Adb::new(serial);
        adb.forward(local_port, UIA2_DEVICE_PORT).await?;
        let mut client = Uia2Client::new(format!("http://127.0.0.1:{}/wd/hub", local_port))?;
        client.create_session(wait_for_idle_timeout_ms).await?;
        Ok(Self {
            client,
            adb,
            serial: serial.to_string(),
        })
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn adb(&self) -> &Adb {
        &self.adb
    }

    /// Ends the automation session; the adb forward is left in place.
    pub async fn disconnect(&mut self) -> Result<(), DriverError> {
        self.client.delete_session().await?;
        Ok(())
    }
}

#[async_trait]
impl Driver for AndroidDriver {
    async fn find_element(&self, locator: &Locator) -> Result<Option<ElementHandle>, DriverError> {
        Ok(self.client.find_element(locator).await?)
    }

    async fn active_element(&self) -> Result<Option<ElementHandle>, DriverError> {
        Ok(self.client.active_element().await?)
    }

    async fn element_text(&self, element: &ElementHandle) -> Result<String, DriverError> {
        Ok(self.client.element_text(element).await?)
    }

    async fn element_bounds(&self, element: &ElementHandle) -> Result<Bounds, DriverError> {
        Ok(self.client.element_rect(element).await?)
    }

    async fn element_attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<String, DriverError> {
        Ok(self.client.element_attribute(element, name).await?)
    }

    async fn click_element(&self, element: &ElementHandle) -> Result<(), DriverError> {
        Ok(self.client.click_element(element).await?)
    }

    async fn clear_element(&self, element: &ElementHandle) -> Result<(), DriverError> {
        Ok(self.client.clear_element(element).await?)
    }

    async fn send_keys_to_element(
        &self,
        element: &ElementHandle,
        text: &str,
    ) -> Result<(), DriverError> {
        Ok(self.client.send_keys_to_element(element, text).await?)
    }

    async fn send_keys(&self, text: &str) -> Result<(), DriverError> {
        Ok(self.client.send_keys(text).await?)
    }

    async fn tap(&self, x: i32, y: i32) -> Result<(), DriverError> {
        Ok(self.client.tap(x, y).await?)
    }

    async fn double_tap(&self, x: i32, y: i32) -> Result<(), DriverError> {
        Ok(self.client.double_tap(x, y).await?)
    }

    async fn long_press(&self, x: i32, y: i32, duration_ms: u64) -> Result<(), DriverError> {
        Ok(self.client.long_press(x, y, duration_ms).await?)
    }

    async fn swipe(
        &self,
        start_x: i32,
        start_y: i32,
        end_x: i32,
        end_y: i32,
        duration_ms: u64,
    ) -> Result<(), DriverError> {
        Ok(self
            .client
            .swipe(start_x, start_y, end_x, end_y, duration_ms)
            .await?)
    }

    async fn back(&self) -> Result<(), DriverError> {
        Ok(self.client.back().await?)
    }

    async fn press_key_code(&self, keycode: u32) -> Result<(), DriverError> {
        Ok(self.client.press_keycode(keycode).await?)
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        Ok(self.client.screenshot().await?)
    }

    async fn source(&self) -> Result<String, DriverError> {
        Ok(self.client.source().await?)
    }

    async fn orientation(&self) -> Result<String, DriverError> {
        Ok(self.client.orientation().await?)
    }

    async fn set_orientation(&self, orientation: &str) -> Result<(), DriverError> {
        Ok(self.client.set_orientation(orientation).await?)
    }

    async fn clipboard(&self) -> Result<String, DriverError> {
        Ok(self.client.get_clipboard().await?)
    }

    async fn set_clipboard(&self, content: &str) -> Result<(), DriverError> {
        Ok(self.client.set_clipboard(content).await?)
    }

    async fn screen_size(&self) -> Result<ScreenSize, DriverError> {
        let (width, height) = self.client.window_size().await?;
        Ok(ScreenSize { width, height })
    }

    async fn shell(&self, args: &[&str]) -> Result<String, DriverError> {
        Ok(self.adb.shell(args).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scroll_direction_inverts_finger_direction() {
        assert_eq!(invert(Direction::Down), Direction::Up);
        assert_eq!(invert(Direction::Up), Direction::Down);
        assert_eq!(invert(Direction::Left), Direction::Right);
        assert_eq!(invert(Direction::Right), Direction::Left);
    }

    #[test]
    fn vertical_swipe_spans_70_to_30_percent() {
        let area = Bounds::new(0, 0, 1080, 1920);
        let (sx, sy, ex, ey) = swipe_coordinates(&area, Direction::Up);
        assert_eq!((sx, ex), (540, 540));
        assert_eq!(sy, 1344);
        assert_eq!(ey, 576);
        assert!(sy > ey, "an up-swipe moves the finger toward smaller y");
    }

    #[test]
    fn horizontal_swipe_keeps_vertical_center() {
        let area = Bounds::new(0, 100, 1000, 800);
        let (sx, sy, ex, ey) = swipe_coordinates(&area, Direction::Left);
        assert_eq!((sy, ey), (500, 500));
        assert!(sx > ex);
    }

    #[test]
    fn swipe_respects_area_offset() {
        let area = Bounds::new(100, 900, 880, 800);
        let (_, sy, _, ey) = swipe_coordinates(&area, Direction::Down);
        assert_eq!(sy, 900 + 240);
        assert_eq!(ey, 900 + 560);
    }

    #[test]
    fn driver_error_display() {
        let err = DriverError::ResolverTimeout("text=\"Login\"".to_string());
        assert!(err.to_string().contains("Login"));
        assert!(err.to_string().contains("deadline"));

        let err = DriverError::NotConnected;
        assert!(err.to_string().contains("Not connected"));
    }
}
