//! HTTP client for the UIAutomator2 automation server.
//!
//! The server is treated as an opaque RPC capability: JSON in, JSON out,
//! W3C-style `{"value": …}` envelopes. Every request runs on a bounded
//! 30-second HTTP deadline; polling and retries are the resolver's concern,
//! never this client's.

use base64::Engine;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::element::Bounds;
use crate::locator::Locator;

const HTTP_TIMEOUT_SECS: u64 = 30;

/// Errors from the automation server transport.
#[derive(Error, Debug)]
pub enum Uia2Error {
    /// The request could not be delivered (connection refused, timeout, …).
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a 4xx/5xx.
    #[error("Automation server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// A session-scoped call was made before `create_session`.
    #[error("No active automation session")]
    NoSession,

    /// The response did not follow the expected envelope.
    #[error("Unexpected server response: {0}")]
    Protocol(String),
}

/// Client for one UIAutomator2 server session.
///
/// Owned by a single driver; the session handle is not shared across tasks.
pub struct Uia2Client {
    http: reqwest::Client,
    base_url: String,
    session_id: Option<String>,
}

impl Uia2Client {
    /// Creates a client against `base_url` (e.g. `http://127.0.0.1:8200/wd/hub`).
    pub fn new(base_url: impl Into<String>) -> Result<Self, Uia2Error> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_id: None,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.session_id.is_some()
    }

    /// Opens a session and applies the implicit-wait and idle timeouts.
    ///
    /// `wait_for_idle_timeout_ms` of 0 disables idle waiting entirely, which
    /// keeps animation-heavy apps from stalling every query.
    pub async fn create_session(
        &mut self,
        wait_for_idle_timeout_ms: u64,
    ) -> Result<(), Uia2Error> {
        let body = json!({
            "capabilities": {
                "alwaysMatch": {
                    "platformName": "android",
                    "appium:automationName": "UiAutomator2",
                    "appium:newCommandTimeout": 0,
                }
            }
        });
        let url = format!("{}/session", self.base_url);
        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status().as_u16();
        let envelope: Value = response.json().await?;
        if status >= 400 {
            return Err(server_error(status, &envelope));
        }
        let session_id = envelope
            .get("sessionId")
            .and_then(Value::as_str)
            .or_else(|| {
                envelope
                    .pointer("/value/sessionId")
                    .and_then(Value::as_str)
            })
            .ok_or_else(|| Uia2Error::Protocol("missing sessionId".to_string()))?
            .to_string();
        debug!(session_id = %session_id, "automation session created");
        self.session_id = Some(session_id);

        self.post("timeouts", &json!({"implicit": 0})).await?;
        self.post(
            "appium/settings",
            &json!({"settings": {"waitForIdleTimeout": wait_for_idle_timeout_ms}}),
        )
        .await?;
        Ok(())
    }

    /// Closes the session; best-effort, the server drops stale sessions on
    /// its own.
    pub async fn delete_session(&mut self) -> Result<(), Uia2Error> {
        if let Some(id) = self.session_id.take() {
            let url = format!("{}/session/{}", self.base_url, id);
            let _ = self.http.delete(&url).send().await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Element queries
    // -----------------------------------------------------------------------

    /// Runs one locator against the server.
    ///
    /// Returns `Ok(None)` for a clean "no such element" so the resolver can
    /// keep polling; every other failure is an error.
    pub async fn find_element(&self, locator: &Locator) -> Result<Option<String>, Uia2Error> {
        let body = json!({
            "using": locator.strategy.as_str(),
            "value": locator.expression,
        });
        match self.post("element", &body).await {
            Ok(value) => extract_element_id(&value)
                .map(Some)
                .ok_or_else(|| Uia2Error::Protocol("missing element id".to_string())),
            Err(e) if is_no_such_element(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The currently focused element, when the server reports one.
    pub async fn active_element(&self) -> Result<Option<String>, Uia2Error> {
        match self.get("element/active").await {
            Ok(value) => Ok(extract_element_id(&value)),
            Err(e) if is_no_such_element(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn element_text(&self, element_id: &str) -> Result<String, Uia2Error> {
        let value = self.get(&format!("element/{}/text", element_id)).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    pub async fn element_rect(&self, element_id: &str) -> Result<Bounds, Uia2Error> {
        let value = self.get(&format!("element/{}/rect", element_id)).await?;
        let field = |name: &str| value.get(name).and_then(Value::as_i64).unwrap_or(0) as i32;
        Ok(Bounds::new(
            field("x"),
            field("y"),
            field("width"),
            field("height"),
        ))
    }

    pub async fn element_attribute(
        &self,
        element_id: &str,
        name: &str,
    ) -> Result<String, Uia2Error> {
        let value = self
            .get(&format!("element/{}/attribute/{}", element_id, name))
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    // -----------------------------------------------------------------------
    // Gestures and input
    // -----------------------------------------------------------------------

    pub async fn click_element(&self, element_id: &str) -> Result<(), Uia2Error> {
        self.post(&format!("element/{}/click", element_id), &json!({}))
            .await?;
        Ok(())
    }

    pub async fn clear_element(&self, element_id: &str) -> Result<(), Uia2Error> {
        self.post(&format!("element/{}/clear", element_id), &json!({}))
            .await?;
        Ok(())
    }

    pub async fn send_keys_to_element(
        &self,
        element_id: &str,
        text: &str,
    ) -> Result<(), Uia2Error> {
        self.post(
            &format!("element/{}/value", element_id),
            &json!({"text": text}),
        )
        .await?;
        Ok(())
    }

    /// Types into whatever currently holds focus.
    pub async fn send_keys(&self, text: &str) -> Result<(), Uia2Error> {
        self.post("keys", &json!({"text": text})).await?;
        Ok(())
    }

    pub async fn tap(&self, x: i32, y: i32) -> Result<(), Uia2Error> {
        self.perform_actions(tap_actions(x, y, 1, 50)).await
    }

    pub async fn double_tap(&self, x: i32, y: i32) -> Result<(), Uia2Error> {
        self.perform_actions(tap_actions(x, y, 2, 50)).await
    }

    pub async fn long_press(&self, x: i32, y: i32, duration_ms: u64) -> Result<(), Uia2Error> {
        self.perform_actions(tap_actions(x, y, 1, duration_ms)).await
    }

    pub async fn swipe(
        &self,
        start_x: i32,
        start_y: i32,
        end_x: i32,
        end_y: i32,
        duration_ms: u64,
    ) -> Result<(), Uia2Error> {
        self.perform_actions(swipe_actions(start_x, start_y, end_x, end_y, duration_ms))
            .await
    }

    async fn perform_actions(&self, actions: Value) -> Result<(), Uia2Error> {
        self.post("actions", &json!({ "actions": [actions] })).await?;
        Ok(())
    }

    pub async fn back(&self) -> Result<(), Uia2Error> {
        self.post("back", &json!({})).await?;
        Ok(())
    }

    pub async fn press_keycode(&self, keycode: u32) -> Result<(), Uia2Error> {
        self.post(
            "appium/device/press_keycode",
            &json!({"keycode": keycode}),
        )
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Device state
    // -----------------------------------------------------------------------

    /// Raw PNG bytes of the current screen.
    pub async fn screenshot(&self) -> Result<Vec<u8>, Uia2Error> {
        let value = self.get("screenshot").await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| Uia2Error::Protocol("screenshot is not a string".to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| Uia2Error::Protocol(format!("invalid screenshot payload: {}", e)))
    }

    /// The live XML page source.
    pub async fn source(&self) -> Result<String, Uia2Error> {
        let value = self.get("source").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    pub async fn orientation(&self) -> Result<String, Uia2Error> {
        let value = self.get("orientation").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    pub async fn set_orientation(&self, orientation: &str) -> Result<(), Uia2Error> {
        self.post("orientation", &json!({"orientation": orientation}))
            .await?;
        Ok(())
    }

    pub async fn get_clipboard(&self) -> Result<String, Uia2Error> {
        let value = self
            .post(
                "appium/device/get_clipboard",
                &json!({"contentType": "PLAINTEXT"}),
            )
            .await?;
        let encoded = value.as_str().unwrap_or_default();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| Uia2Error::Protocol(format!("invalid clipboard payload: {}", e)))?;
        Ok(String::from_utf8_lossy(&decoded).to_string())
    }

    pub async fn set_clipboard(&self, content: &str) -> Result<(), Uia2Error> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        self.post(
            "appium/device/set_clipboard",
            &json!({"content": encoded, "contentType": "PLAINTEXT"}),
        )
        .await?;
        Ok(())
    }

    /// Window size as `(width, height)`.
    pub async fn window_size(&self) -> Result<(i32, i32), Uia2Error> {
        let value = self.get("window/rect").await?;
        let field = |name: &str| value.get(name).and_then(Value::as_i64).unwrap_or(0) as i32;
        Ok((field("width"), field("height")))
    }

    /// Raw device-info payload from the server.
    pub async fn device_info(&self) -> Result<Value, Uia2Error> {
        self.get("appium/device/info").await
    }

    // -----------------------------------------------------------------------
    // Transport plumbing
    // -----------------------------------------------------------------------

    fn session_url(&self, path: &str) -> Result<String, Uia2Error> {
        let id = self.session_id.as_ref().ok_or(Uia2Error::NoSession)?;
        Ok(format!("{}/session/{}/{}", self.base_url, id, path))
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, Uia2Error> {
        let url = self.session_url(path)?;
        let response = self.http.post(&url).json(body).send().await?;
        unwrap_envelope(response).await
    }

    async fn get(&self, path: &str) -> Result<Value, Uia2Error> {
        let url = self.session_url(path)?;
        let response = self.http.get(&url).send().await?;
        unwrap_envelope(response).await
    }
}

async fn unwrap_envelope(response: reqwest::Response) -> Result<Value, Uia2Error> {
    let status = response.status().as_u16();
    let envelope: Value = response
        .json()
        .await
        .map_err(|e| Uia2Error::Protocol(format!("non-JSON response: {}", e)))?;
    if status >= 400 {
        return Err(server_error(status, &envelope));
    }
    Ok(envelope.get("value").cloned().unwrap_or(Value::Null))
}

fn server_error(status: u16, envelope: &Value) -> Uia2Error {
    let message = envelope
        .pointer("/value/message")
        .or_else(|| envelope.pointer("/value/error"))
        .or_else(|| envelope.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("unknown server error")
        .to_string();
    Uia2Error::Server { status, message }
}

fn is_no_such_element(error: &Uia2Error) -> bool {
    match error {
        Uia2Error::Server { status, message } => {
            *status == 404
                || message.contains("no such element")
                || message.contains("could not be located")
        }
        _ => false,
    }
}

/// Pulls the element id out of a find-element response; the server uses
/// either the legacy `ELEMENT` key or the W3C element key.
fn extract_element_id(value: &Value) -> Option<String> {
    let map = value.as_object()?;
    if let Some(id) = map.get("ELEMENT").and_then(Value::as_str) {
        return Some(id.to_string());
    }
    map.iter()
        .find(|(k, _)| k.starts_with("element-"))
        .and_then(|(_, v)| v.as_str())
        .map(|s| s.to_string())
}

fn tap_actions(x: i32, y: i32, count: u32, press_ms: u64) -> Value {
    let mut actions = Vec::new();
    for i in 0..count {
        if i > 0 {
            actions.push(json!({"type": "pause", "duration": 100}));
        }
        actions.push(json!({"type": "pointerMove", "duration": 0, "x": x, "y": y}));
        actions.push(json!({"type": "pointerDown", "button": 0}));
        actions.push(json!({"type": "pause", "duration": press_ms}));
        actions.push(json!({"type": "pointerUp", "button": 0}));
    }
    json!({
        "type": "pointer",
        "id": "finger1",
        "parameters": {"pointerType": "touch"},
        "actions": actions,
    })
}

fn swipe_actions(start_x: i32, start_y: i32, end_x: i32, end_y: i32, duration_ms: u64) -> Value {
    json!({
        "type": "pointer",
        "id": "finger1",
        "parameters": {"pointerType": "touch"},
        "actions": [
            {"type": "pointerMove", "duration": 0, "x": start_x, "y": start_y},
            {"type": "pointerDown", "button": 0},
            {"type": "pointerMove", "duration": duration_ms, "x": end_x, "y": end_y},
            {"type": "pointerUp", "button": 0},
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_legacy_element_id() {
        let value = json!({"ELEMENT": "abc-123"});
        assert_eq!(extract_element_id(&value).as_deref(), Some("abc-123"));
    }

    #[test]
    fn extracts_w3c_element_id() {
        let value = json!({"element-6066-11e4-a52e-4f735466cecf": "def-456"});
        assert_eq!(extract_element_id(&value).as_deref(), Some("def-456"));
    }

    #[test]
    fn missing_element_id_is_none() {
        assert!(extract_element_id(&json!({})).is_none());
        assert!(extract_element_id(&json!("just a string")).is_none());
    }

    #[test]
    fn no_such_element_detection() {
        let not_found = Uia2Error::Server {
            status: 404,
            message: "no such element".to_string(),
        };
        assert!(is_no_such_element(&not_found));

        let hard_failure = Uia2Error::Server {
            status: 500,
            message: "instrumentation crashed".to_string(),
        };
        assert!(!is_no_such_element(&hard_failure));
    }

    #[test]
    fn swipe_actions_encode_motion() {
        let actions = swipe_actions(540, 1680, 540, 240, 300);
        let moves = actions["actions"].as_array().unwrap();
        assert_eq!(moves[0]["y"], 1680);
        assert_eq!(moves[2]["y"], 240);
        assert_eq!(moves[2]["duration"], 300);
    }

    #[test]
    fn double_tap_has_two_press_sequences() {
        let actions = tap_actions(100, 200, 2, 50);
        let downs = actions["actions"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|a| a["type"] == "pointerDown")
            .count();
        assert_eq!(downs, 2);
    }

    #[test]
    fn session_calls_require_connection() {
        let client = Uia2Client::new("http://127.0.0.1:8200/wd/hub").unwrap();
        assert!(!client.is_connected());
        assert!(matches!(
            client.session_url("source"),
            Err(Uia2Error::NoSession)
        ));
    }
}
