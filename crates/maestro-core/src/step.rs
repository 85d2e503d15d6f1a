//! Step types and execution results.
//!
//! A [`Step`] is one atomic flow action or assertion, decoded from YAML by
//! the flow parser and executed by the step dispatcher. Control-flow kinds
//! (`repeat`, `retry`, `runFlow`, …) carry nested step lists and are
//! interpreted by the runner; the dispatcher only decodes their payloads.
//!
//! Every executed step produces exactly one [`CommandResult`].

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::element::ElementInfo;
use crate::selector::Selector;

/// Swipe/scroll direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            "left" => Ok(Direction::Left),
            "right" => Ok(Direction::Right),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

/// Device orientation, including the extended rotations that bypass the
/// automation server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Orientation {
    Portrait,
    Landscape,
    LandscapeLeft,
    LandscapeRight,
    UpsideDown,
}

impl std::str::FromStr for Orientation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PORTRAIT" => Ok(Orientation::Portrait),
            "LANDSCAPE" => Ok(Orientation::Landscape),
            "LANDSCAPE_LEFT" => Ok(Orientation::LandscapeLeft),
            "LANDSCAPE_RIGHT" => Ok(Orientation::LandscapeRight),
            "UPSIDE_DOWN" => Ok(Orientation::UpsideDown),
            other => Err(format!("unknown orientation '{}'", other)),
        }
    }
}

/// Data categories for `inputRandom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RandomDataType {
    Text,
    Number,
    Email,
    PersonName,
}

impl std::str::FromStr for RandomDataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TEXT" => Ok(RandomDataType::Text),
            "NUMBER" => Ok(RandomDataType::Number),
            "EMAIL" => Ok(RandomDataType::Email),
            "PERSON_NAME" | "PERSONNAME" => Ok(RandomDataType::PersonName),
            other => Err(format!("unknown random data type '{}'", other)),
        }
    }
}

/// One atomic flow step.
///
/// Serialized with a `kind` tag so steps survive a JSON round-trip, which
/// the runner uses for late variable substitution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Step {
    TapOn(Selector),
    DoubleTapOn(Selector),
    LongPressOn(Selector),
    TapOnPoint {
        x: i32,
        y: i32,
        point: Option<String>,
    },
    Back,
    AssertVisible(Selector),
    AssertNotVisible(Selector),
    AssertTrue {
        condition: String,
    },
    InputText {
        text: String,
        selector: Option<Selector>,
    },
    InputRandom {
        data_type: RandomDataType,
        length: usize,
        selector: Option<Selector>,
    },
    EraseText {
        chars: u32,
    },
    HideKeyboard,
    CopyTextFrom(Selector),
    PasteText,
    SetClipboard {
        text: String,
    },
    Scroll {
        direction: Direction,
    },
    ScrollUntilVisible {
        selector: Selector,
        direction: Direction,
    },
    Swipe {
        direction: Option<Direction>,
        start: Option<String>,
        end: Option<String>,
        duration_ms: u64,
    },
    LaunchApp {
        app_id: Option<String>,
        clear_state: bool,
        stop_app: Option<bool>,
        permissions: HashMap<String, String>,
        arguments: HashMap<String, serde_json::Value>,
    },
    StopApp {
        app_id: Option<String>,
    },
    KillApp {
        app_id: Option<String>,
    },
    ClearState {
        app_id: Option<String>,
    },
    ClearKeychain,
    SetPermissions {
        app_id: Option<String>,
        permissions: HashMap<String, String>,
    },
    SetOrientation {
        orientation: Orientation,
    },
    OpenLink {
        url: String,
        browser: bool,
        auto_verify: bool,
    },
    SetLocation {
        latitude: f64,
        longitude: f64,
    },
    Travel {
        points: Vec<(f64, f64)>,
        speed: f64,
    },
    SetAirplaneMode {
        enabled: bool,
    },
    ToggleAirplaneMode,
    WaitUntil {
        visible: Option<Selector>,
        not_visible: Option<Selector>,
        timeout_ms: Option<u64>,
    },
    WaitForAnimationToEnd {
        timeout_ms: Option<u64>,
    },
    TakeScreenshot {
        path: String,
    },
    StartRecording {
        path: String,
    },
    StopRecording,
    AddMedia {
        files: Vec<String>,
    },
    PressKey {
        key: String,
    },
    DefineVariables {
        env: HashMap<String, String>,
    },
    Repeat {
        times: Option<String>,
        while_visible: Option<Selector>,
        commands: Vec<Step>,
    },
    Retry {
        max_retries: u32,
        file: Option<String>,
        commands: Vec<Step>,
    },
    RunFlow {
        file: Option<String>,
        env: HashMap<String, String>,
        commands: Vec<Step>,
    },
    RunScript {
        file: String,
        env: HashMap<String, String>,
    },
    EvalScript {
        script: String,
    },
    Unsupported {
        step_kind: String,
        reason: String,
    },
}

impl Step {
    /// Short static name for tracing span metadata; avoids Debug-formatting
    /// large payloads.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Step::TapOn(_) => "tapOn",
            Step::DoubleTapOn(_) => "doubleTapOn",
            Step::LongPressOn(_) => "longPressOn",
            Step::TapOnPoint { .. } => "tapOnPoint",
            Step::Back => "back",
            Step::AssertVisible(_) => "assertVisible",
            Step::AssertNotVisible(_) => "assertNotVisible",
            Step::AssertTrue { .. } => "assertTrue",
            Step::InputText { .. } => "inputText",
            Step::InputRandom { .. } => "inputRandom",
            Step::EraseText { .. } => "eraseText",
            Step::HideKeyboard => "hideKeyboard",
            Step::CopyTextFrom(_) => "copyTextFrom",
            Step::PasteText => "pasteText",
            Step::SetClipboard { .. } => "setClipboard",
            Step::Scroll { .. } => "scroll",
            Step::ScrollUntilVisible { .. } => "scrollUntilVisible",
            Step::Swipe { .. } => "swipe",
            Step::LaunchApp { .. } => "launchApp",
            Step::StopApp { .. } => "stopApp",
            Step::KillApp { .. } => "killApp",
            Step::ClearState { .. } => "clearState",
            Step::ClearKeychain => "clearKeychain",
            Step::SetPermissions { .. } => "setPermissions",
            Step::SetOrientation { .. } => "setOrientation",
            Step::OpenLink { .. } => "openLink",
            Step::SetLocation { .. } => "setLocation",
            Step::Travel { .. } => "travel",
            Step::SetAirplaneMode { .. } => "setAirplaneMode",
            Step::ToggleAirplaneMode => "toggleAirplaneMode",
            Step::WaitUntil { .. } => "extendedWaitUntil",
            Step::WaitForAnimationToEnd { .. } => "waitForAnimationToEnd",
            Step::TakeScreenshot { .. } => "takeScreenshot",
            Step::StartRecording { .. } => "startRecording",
            Step::StopRecording => "stopRecording",
            Step::AddMedia { .. } => "addMedia",
            Step::PressKey { .. } => "pressKey",
            Step::DefineVariables { .. } => "defineVariables",
            Step::Repeat { .. } => "repeat",
            Step::Retry { .. } => "retry",
            Step::RunFlow { .. } => "runFlow",
            Step::RunScript { .. } => "runScript",
            Step::EvalScript { .. } => "evalScript",
            Step::Unsupported { .. } => "unsupported",
        }
    }

    /// The primary selector of the step, when it has one.
    pub fn selector(&self) -> Option<&Selector> {
        match self {
            Step::TapOn(s)
            | Step::DoubleTapOn(s)
            | Step::LongPressOn(s)
            | Step::AssertVisible(s)
            | Step::AssertNotVisible(s)
            | Step::CopyTextFrom(s) => Some(s),
            Step::InputText { selector, .. } | Step::InputRandom { selector, .. } => {
                selector.as_ref()
            }
            Step::ScrollUntilVisible { selector, .. } => Some(selector),
            _ => None,
        }
    }

    /// Whether a resolver failure on this step is tolerated.
    pub fn is_optional(&self) -> bool {
        self.selector().map(|s| s.optional).unwrap_or(false)
    }
}

/// The outcome of executing one step.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Whether the step counts as passed.
    pub success: bool,
    /// Human-readable description of what happened.
    pub message: String,
    /// The underlying error when the step failed.
    pub error: Option<String>,
    /// The element the step acted on, when one was resolved.
    pub element: Option<ElementInfo>,
    /// Step-specific payload (copied text, screenshot path, …).
    pub data: Option<serde_json::Value>,
    /// Wall-clock execution time.
    pub duration: Duration,
}

impl CommandResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error: None,
            element: None,
            data: None,
            duration: Duration::ZERO,
        }
    }

    pub fn failure(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.into()),
            element: None,
            data: None,
            duration: Duration::ZERO,
        }
    }

    pub fn with_element(mut self, element: ElementInfo) -> Self {
        self.element = Some(element);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_parses_case_insensitively() {
        assert_eq!("down".parse::<Direction>().unwrap(), Direction::Down);
        assert_eq!("LEFT".parse::<Direction>().unwrap(), Direction::Left);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn orientation_parses_extended_rotations() {
        assert_eq!(
            "LANDSCAPE_LEFT".parse::<Orientation>().unwrap(),
            Orientation::LandscapeLeft
        );
        assert_eq!(
            "portrait".parse::<Orientation>().unwrap(),
            Orientation::Portrait
        );
        assert!("SIDEWAYS".parse::<Orientation>().is_err());
    }

    #[test]
    fn optional_rides_on_the_selector() {
        let step = Step::TapOn(Selector {
            text: Some("Maybe".to_string()),
            optional: true,
            ..Default::default()
        });
        assert!(step.is_optional());
        assert!(!Step::Back.is_optional());
    }

    #[test]
    fn kind_names_match_flow_vocabulary() {
        assert_eq!(Step::Back.kind_name(), "back");
        assert_eq!(
            Step::TapOn(Selector::from_text("x")).kind_name(),
            "tapOn"
        );
        assert_eq!(
            Step::WaitUntil {
                visible: None,
                not_visible: None,
                timeout_ms: None
            }
            .kind_name(),
            "extendedWaitUntil"
        );
    }

    #[test]
    fn steps_round_trip_through_json() {
        let step = Step::Repeat {
            times: Some("3".to_string()),
            while_visible: None,
            commands: vec![
                Step::TapOn(Selector::from_text("Next")),
                Step::Back,
            ],
        };
        let json = serde_json::to_string(&step).unwrap();
        let back: Step = serde_json::from_str(&json).unwrap();
        assert_eq!(step, back);
    }

    #[test]
    fn command_result_builders() {
        let info = ElementInfo::default();
        let result = CommandResult::success("Tapped")
            .with_element(info)
            .with_data(serde_json::json!({"x": 1}))
            .with_duration(Duration::from_millis(42));
        assert!(result.success);
        assert!(result.element.is_some());
        assert_eq!(result.duration, Duration::from_millis(42));

        let result = CommandResult::failure("Step failed", "element not found");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("element not found"));
    }
}
