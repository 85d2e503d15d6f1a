//! Flow document parsing.
//!
//! A flow file is one or two YAML documents separated by `---`: an optional
//! config header followed by a step sequence. Splitting must respect block
//! scalars, a `---` inside a `|` or `>` body is content, not a separator.
//!
//! Step entries are either a bare scalar command name (`- back`) or a
//! one-key mapping whose key is the step kind. Values are polymorphic: a
//! scalar fills the kind's primary field, a mapping is decoded field by
//! field, and the control-flow kinds carry nested `commands` sequences
//! parsed recursively. Unknown kinds become `Unsupported` steps instead of
//! parse failures so one typo does not kill a whole suite.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_yaml::Value;
use thiserror::Error;

use crate::selector::Selector;
use crate::step::{Direction, Orientation, RandomDataType, Step};

/// Errors raised while parsing a flow document.
#[derive(Error, Debug)]
pub enum FlowError {
    /// The source contains no content.
    #[error("Empty flow document")]
    Empty,

    /// The YAML itself is malformed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The YAML is well-formed but not a valid flow.
    #[error("Invalid flow: {0}")]
    Invalid(String),

    /// The flow file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Flow-level configuration from the header document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowConfig {
    pub app_id: Option<String>,
    pub url: Option<String>,
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub env: HashMap<String, String>,
    pub timeout: Option<u64>,
    pub on_flow_start: Vec<Step>,
    pub on_flow_complete: Vec<Step>,
}

/// A parsed flow: config plus an ordered step list.
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub source_path: PathBuf,
    pub config: FlowConfig,
    pub steps: Vec<Step>,
}

/// Reads and parses a flow file.
pub fn parse_flow_file(path: &Path) -> Result<Flow, FlowError> {
    let source = std::fs::read_to_string(path)?;
    parse_flow(&source, path)
}

/// Parses flow source text.
pub fn parse_flow(source: &str, path: &Path) -> Result<Flow, FlowError> {
    if source.trim().is_empty() {
        return Err(FlowError::Empty);
    }
    let docs = split_documents(source)?;
    let (config, steps_doc) = match docs.len() {
        1 => (FlowConfig::default(), &docs[0]),
        2 => {
            let header: Value = serde_yaml::from_str(&docs[0])?;
            (parse_config(&header)?, &docs[1])
        }
        n => {
            return Err(FlowError::Invalid(format!(
                "expected one or two documents, found {}",
                n
            )));
        }
    };
    if steps_doc.trim().is_empty() {
        return Err(FlowError::Empty);
    }
    let steps_value: Value = serde_yaml::from_str(steps_doc)?;
    let steps = parse_steps(&steps_value)?;
    Ok(Flow {
        source_path: path.to_path_buf(),
        config,
        steps,
    })
}

// ---------------------------------------------------------------------------
// Document splitting
// ---------------------------------------------------------------------------

/// Splits on `---` separator lines, treating lines inside a block scalar
/// body as content. A blank leading document (file starting with `---`) is
/// dropped.
fn split_documents(source: &str) -> Result<Vec<String>, FlowError> {
    let mut docs: Vec<String> = vec![String::new()];
    // Indentation of the line that opened the current block scalar.
    let mut block_indent: Option<usize> = None;

    for line in source.lines() {
        let trimmed = line.trim();
        let indent = line.len() - line.trim_start().len();

        if let Some(open_indent) = block_indent {
            if trimmed.is_empty() || indent > open_indent {
                docs.last_mut().unwrap().push_str(line);
                docs.last_mut().unwrap().push('\n');
                continue;
            }
            block_indent = None;
        }

        if trimmed == "---" {
            docs.push(String::new());
            continue;
        }

        if opens_block_scalar(trimmed) {
            block_indent = Some(indent);
        }
        docs.last_mut().unwrap().push_str(line);
        docs.last_mut().unwrap().push('\n');
    }

    if docs.len() > 1 && docs[0].trim().is_empty() {
        docs.remove(0);
    }
    if docs.iter().all(|d| d.trim().is_empty()) {
        return Err(FlowError::Empty);
    }
    Ok(docs)
}

/// True when a line ends with a block-scalar indicator (`|`, `|-`, `>`,
/// `>-`, with or without chomping modifiers).
fn opens_block_scalar(trimmed: &str) -> bool {
    let last = match trimmed.rsplit(char::is_whitespace).next() {
        Some(token) => token,
        None => return false,
    };
    matches!(last, "|" | "|-" | "|+" | ">" | ">-" | ">+")
}

// ---------------------------------------------------------------------------
// Config parsing
// ---------------------------------------------------------------------------

fn parse_config(value: &Value) -> Result<FlowConfig, FlowError> {
    if !value.is_mapping() {
        return Err(FlowError::Invalid(
            "config header must be a mapping".to_string(),
        ));
    }

    let mut config = FlowConfig {
        app_id: value.get("appId").and_then(scalar_to_string),
        url: value.get("url").and_then(scalar_to_string),
        name: value.get("name").and_then(scalar_to_string),
        timeout: value.get("timeout").and_then(Value::as_u64),
        ..Default::default()
    };
    if let Some(tags) = value.get("tags").and_then(Value::as_sequence) {
        config.tags = tags.iter().filter_map(scalar_to_string).collect();
    }
    if let Some(env) = value.get("env").and_then(Value::as_mapping) {
        config.env = string_map(env);
    }
    if let Some(steps) = value.get("onFlowStart") {
        config.on_flow_start = parse_steps(steps)?;
    }
    if let Some(steps) = value.get("onFlowComplete") {
        config.on_flow_complete = parse_steps(steps)?;
    }
    Ok(config)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_map(map: &serde_yaml::Mapping) -> HashMap<String, String> {
    map.iter()
        .filter_map(|(k, v)| Some((scalar_to_string(k)?, scalar_to_string(v)?)))
        .collect()
}

// ---------------------------------------------------------------------------
// Step parsing
// ---------------------------------------------------------------------------

/// Parses a YAML sequence into steps.
pub fn parse_steps(value: &Value) -> Result<Vec<Step>, FlowError> {
    let seq = value
        .as_sequence()
        .ok_or_else(|| FlowError::Invalid("steps must be a sequence".to_string()))?;
    seq.iter().map(parse_step_entry).collect()
}

fn parse_step_entry(entry: &Value) -> Result<Step, FlowError> {
    match entry {
        Value::String(name) => Ok(bare_step(name)),
        Value::Mapping(map) => {
            if map.len() != 1 {
                return Err(FlowError::Invalid(
                    "step entry must be a single-key mapping".to_string(),
                ));
            }
            let (key, value) = map.iter().next().unwrap();
            let kind = key.as_str().ok_or_else(|| {
                FlowError::Invalid("step kind must be a string".to_string())
            })?;
            parse_step(kind, value)
        }
        other => Err(FlowError::Invalid(format!(
            "step entry must be a scalar or mapping, found {:?}",
            other
        ))),
    }
}

/// Commands that may appear as a bare scalar entry.
fn bare_step(name: &str) -> Step {
    match name {
        "back" => Step::Back,
        "hideKeyboard" => Step::HideKeyboard,
        "pasteText" => Step::PasteText,
        "clearKeychain" => Step::ClearKeychain,
        "toggleAirplaneMode" => Step::ToggleAirplaneMode,
        "waitForAnimationToEnd" => Step::WaitForAnimationToEnd { timeout_ms: None },
        "stopRecording" => Step::StopRecording,
        "scroll" => Step::Scroll {
            direction: Direction::Down,
        },
        // Bare launchApp launches the flow's configured appId.
        "launchApp" => Step::LaunchApp {
            app_id: None,
            clear_state: false,
            stop_app: None,
            permissions: HashMap::new(),
            arguments: HashMap::new(),
        },
        "inputRandomText" => random_step(RandomDataType::Text),
        "inputRandomNumber" => random_step(RandomDataType::Number),
        "inputRandomEmail" => random_step(RandomDataType::Email),
        "inputRandomPersonName" => random_step(RandomDataType::PersonName),
        other => Step::Unsupported {
            step_kind: other.to_string(),
            reason: "unknown scalar step".to_string(),
        },
    }
}

fn parse_step(kind: &str, value: &Value) -> Result<Step, FlowError> {
    match kind {
        "tapOn" => Ok(Step::TapOn(selector_from(value)?)),
        "doubleTapOn" => Ok(Step::DoubleTapOn(selector_from(value)?)),
        "longPressOn" => Ok(Step::LongPressOn(selector_from(value)?)),
        "assertVisible" => Ok(Step::AssertVisible(selector_from(value)?)),
        "assertNotVisible" => Ok(Step::AssertNotVisible(selector_from(value)?)),
        "copyTextFrom" => Ok(Step::CopyTextFrom(selector_from(value)?)),
        "tapOnPoint" => parse_tap_on_point(value),
        "back" => Ok(Step::Back),
        "hideKeyboard" => Ok(Step::HideKeyboard),
        "pasteText" => Ok(Step::PasteText),
        "clearKeychain" => Ok(Step::ClearKeychain),
        "toggleAirplaneMode" => Ok(Step::ToggleAirplaneMode),
        "stopRecording" => Ok(Step::StopRecording),
        "assertTrue" => Ok(Step::AssertTrue {
            condition: scalar_to_string(value)
                .or_else(|| value.get("condition").and_then(scalar_to_string))
                .unwrap_or_default(),
        }),
        "inputText" => Ok(Step::InputText {
            text: scalar_to_string(value)
                .or_else(|| value.get("text").and_then(scalar_to_string))
                .ok_or_else(|| FlowError::Invalid("inputText needs text".to_string()))?,
            selector: None,
        }),
        "inputRandom" => parse_input_random(value, None),
        "inputRandomText" => parse_input_random(value, Some(RandomDataType::Text)),
        "inputRandomNumber" => parse_input_random(value, Some(RandomDataType::Number)),
        "inputRandomEmail" => parse_input_random(value, Some(RandomDataType::Email)),
        "inputRandomPersonName" => parse_input_random(value, Some(RandomDataType::PersonName)),
        "eraseText" => {
            let chars = scalar_to_string(value)
                .and_then(|s| s.parse().ok())
                .or_else(|| {
                    value
                        .get("charactersToErase")
                        .or_else(|| value.get("chars"))
                        .and_then(Value::as_u64)
                        .map(|n| n as u32)
                })
                .unwrap_or(50);
            Ok(Step::EraseText { chars })
        }
        "setClipboard" => Ok(Step::SetClipboard {
            text: scalar_to_string(value)
                .or_else(|| value.get("text").and_then(scalar_to_string))
                .unwrap_or_default(),
        }),
        "scroll" => {
            let direction = direction_from(value).unwrap_or(Direction::Down);
            Ok(Step::Scroll { direction })
        }
        "scrollUntilVisible" => {
            let selector_value = value.get("element").unwrap_or(value);
            let selector = selector_from(selector_value)?;
            let direction = value
                .get("direction")
                .and_then(scalar_to_string)
                .map(|s| Direction::from_str(&s))
                .transpose()
                .map_err(FlowError::Invalid)?
                .unwrap_or(Direction::Down);
            Ok(Step::ScrollUntilVisible {
                selector,
                direction,
            })
        }
        "swipe" => {
            let direction = direction_from(value);
            let start = value.get("start").and_then(scalar_to_string);
            let end = value.get("end").and_then(scalar_to_string);
            let duration_ms = value
                .get("duration")
                .and_then(Value::as_u64)
                .unwrap_or(300);
            if direction.is_none() && (start.is_none() || end.is_none()) {
                return Err(FlowError::Invalid(
                    "swipe needs a direction or start and end points".to_string(),
                ));
            }
            Ok(Step::Swipe {
                direction,
                start,
                end,
                duration_ms,
            })
        }
        "launchApp" => {
            let mut permissions = HashMap::new();
            let mut arguments = HashMap::new();
            if let Some(perm) = value.get("permissions").and_then(Value::as_mapping) {
                permissions = string_map(perm);
            }
            if let Some(args) = value.get("arguments").and_then(Value::as_mapping) {
                for (k, v) in args {
                    if let (Some(key), Ok(json)) =
                        (scalar_to_string(k), serde_yaml::from_value(v.clone()))
                    {
                        arguments.insert(key, json);
                    }
                }
            }
            Ok(Step::LaunchApp {
                app_id: scalar_to_string(value)
                    .or_else(|| value.get("appId").and_then(scalar_to_string)),
                clear_state: value
                    .get("clearState")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                stop_app: value.get("stopApp").and_then(Value::as_bool),
                permissions,
                arguments,
            })
        }
        "stopApp" => Ok(Step::StopApp {
            app_id: app_id_from(value),
        }),
        "killApp" => Ok(Step::KillApp {
            app_id: app_id_from(value),
        }),
        "clearState" => Ok(Step::ClearState {
            app_id: app_id_from(value),
        }),
        "setPermissions" => {
            let permissions = value
                .get("permissions")
                .and_then(Value::as_mapping)
                .map(string_map)
                .unwrap_or_default();
            Ok(Step::SetPermissions {
                app_id: app_id_from(value),
                permissions,
            })
        }
        "setOrientation" => {
            let raw = scalar_to_string(value)
                .or_else(|| value.get("orientation").and_then(scalar_to_string))
                .ok_or_else(|| FlowError::Invalid("setOrientation needs a value".to_string()))?;
            let orientation = Orientation::from_str(&raw).map_err(FlowError::Invalid)?;
            Ok(Step::SetOrientation { orientation })
        }
        "openLink" | "openBrowser" => {
            let url = scalar_to_string(value)
                .or_else(|| value.get("link").and_then(scalar_to_string))
                .or_else(|| value.get("url").and_then(scalar_to_string))
                .ok_or_else(|| FlowError::Invalid(format!("{} needs a URL", kind)))?;
            Ok(Step::OpenLink {
                url,
                browser: kind == "openBrowser"
                    || value
                        .get("browser")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                auto_verify: value
                    .get("autoVerify")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        }
        "setLocation" => {
            if let Some(raw) = scalar_to_string(value) {
                let (lat, lon) = parse_lat_lon(&raw)?;
                return Ok(Step::SetLocation {
                    latitude: lat,
                    longitude: lon,
                });
            }
            let latitude = value
                .get("latitude")
                .and_then(Value::as_f64)
                .ok_or_else(|| FlowError::Invalid("setLocation needs latitude".to_string()))?;
            let longitude = value
                .get("longitude")
                .and_then(Value::as_f64)
                .ok_or_else(|| FlowError::Invalid("setLocation needs longitude".to_string()))?;
            Ok(Step::SetLocation {
                latitude,
                longitude,
            })
        }
        "travel" => {
            let points = value
                .get("points")
                .and_then(Value::as_sequence)
                .ok_or_else(|| FlowError::Invalid("travel needs points".to_string()))?
                .iter()
                .map(|p| {
                    scalar_to_string(p)
                        .ok_or_else(|| {
                            FlowError::Invalid("travel points must be 'lat,lon' strings".to_string())
                        })
                        .and_then(|raw| parse_lat_lon(&raw))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let speed = value
                .get("speedMPS")
                .or_else(|| value.get("speed"))
                .and_then(Value::as_f64)
                .unwrap_or(3600.0);
            Ok(Step::Travel { points, speed })
        }
        "setAirplaneMode" => {
            let enabled = match value {
                Value::Bool(b) => *b,
                Value::String(s) => s.eq_ignore_ascii_case("enabled") || s == "true",
                Value::Null => true,
                _ => {
                    return Err(FlowError::Invalid(
                        "setAirplaneMode expects a boolean".to_string(),
                    ));
                }
            };
            Ok(Step::SetAirplaneMode { enabled })
        }
        "waitUntil" | "extendedWaitUntil" => {
            let visible = value
                .get("visible")
                .map(selector_from)
                .transpose()?;
            let not_visible = value
                .get("notVisible")
                .map(selector_from)
                .transpose()?;
            if visible.is_none() && not_visible.is_none() {
                return Err(FlowError::Invalid(
                    "waitUntil needs visible or notVisible".to_string(),
                ));
            }
            Ok(Step::WaitUntil {
                visible,
                not_visible,
                timeout_ms: value.get("timeout").and_then(Value::as_u64),
            })
        }
        "waitForAnimationToEnd" => Ok(Step::WaitForAnimationToEnd {
            timeout_ms: value.get("timeout").and_then(Value::as_u64),
        }),
        "takeScreenshot" => Ok(Step::TakeScreenshot {
            path: scalar_to_string(value)
                .or_else(|| value.get("path").and_then(scalar_to_string))
                .unwrap_or_else(|| "screenshot".to_string()),
        }),
        "startRecording" => Ok(Step::StartRecording {
            path: scalar_to_string(value)
                .or_else(|| value.get("path").and_then(scalar_to_string))
                .unwrap_or_else(|| "recording".to_string()),
        }),
        "addMedia" => {
            let files = match value {
                Value::String(s) => vec![s.clone()],
                Value::Sequence(seq) => seq.iter().filter_map(scalar_to_string).collect(),
                _ => {
                    return Err(FlowError::Invalid(
                        "addMedia expects a path or list of paths".to_string(),
                    ));
                }
            };
            Ok(Step::AddMedia { files })
        }
        "pressKey" => Ok(Step::PressKey {
            key: scalar_to_string(value)
                .ok_or_else(|| FlowError::Invalid("pressKey needs a key name".to_string()))?,
        }),
        "defineVariables" => {
            let env = value
                .get("env")
                .and_then(Value::as_mapping)
                .map(string_map)
                .or_else(|| value.as_mapping().map(string_map))
                .unwrap_or_default();
            Ok(Step::DefineVariables { env })
        }
        "repeat" => {
            let times = value.get("times").and_then(scalar_to_string);
            let while_visible = value
                .get("while")
                .and_then(|w| w.get("visible"))
                .map(selector_from)
                .transpose()?;
            let commands = nested_commands(value)?;
            Ok(Step::Repeat {
                times,
                while_visible,
                commands,
            })
        }
        "retry" => Ok(Step::Retry {
            max_retries: value
                .get("maxRetries")
                .and_then(Value::as_u64)
                .unwrap_or(3) as u32,
            file: value.get("file").and_then(scalar_to_string),
            commands: nested_commands(value)?,
        }),
        "runFlow" => {
            let file = scalar_to_string(value)
                .or_else(|| value.get("file").and_then(scalar_to_string));
            let env = value
                .get("env")
                .and_then(Value::as_mapping)
                .map(string_map)
                .unwrap_or_default();
            let commands = nested_commands(value)?;
            if file.is_none() && commands.is_empty() {
                return Err(FlowError::Invalid(
                    "runFlow needs a file or inline commands".to_string(),
                ));
            }
            Ok(Step::RunFlow {
                file,
                env,
                commands,
            })
        }
        "runScript" => Ok(Step::RunScript {
            file: scalar_to_string(value)
                .or_else(|| value.get("file").and_then(scalar_to_string))
                .ok_or_else(|| FlowError::Invalid("runScript needs a file".to_string()))?,
            env: value
                .get("env")
                .and_then(Value::as_mapping)
                .map(string_map)
                .unwrap_or_default(),
        }),
        "evalScript" => Ok(Step::EvalScript {
            script: scalar_to_string(value)
                .ok_or_else(|| FlowError::Invalid("evalScript needs a script".to_string()))?,
        }),
        other => Ok(Step::Unsupported {
            step_kind: other.to_string(),
            reason: "unknown step kind".to_string(),
        }),
    }
}

fn random_step(data_type: RandomDataType) -> Step {
    Step::InputRandom {
        data_type,
        length: 10,
        selector: None,
    }
}

fn parse_input_random(
    value: &Value,
    fixed_type: Option<RandomDataType>,
) -> Result<Step, FlowError> {
    let data_type = match fixed_type {
        Some(t) => t,
        None => scalar_to_string(value)
            .or_else(|| value.get("type").and_then(scalar_to_string))
            .map(|s| RandomDataType::from_str(&s))
            .transpose()
            .map_err(FlowError::Invalid)?
            .unwrap_or(RandomDataType::Text),
    };
    let length = match fixed_type {
        // For the typed shorthands a bare scalar is the length.
        Some(_) => scalar_to_string(value).and_then(|s| s.parse().ok()),
        None => None,
    }
    .or_else(|| value.get("length").and_then(Value::as_u64).map(|n| n as usize))
    .unwrap_or(10);
    Ok(Step::InputRandom {
        data_type,
        length,
        selector: None,
    })
}

fn parse_tap_on_point(value: &Value) -> Result<Step, FlowError> {
    if let Some(point) = scalar_to_string(value) {
        return Ok(Step::TapOnPoint {
            x: 0,
            y: 0,
            point: Some(point),
        });
    }
    let point = value.get("point").and_then(scalar_to_string);
    let x = value.get("x").and_then(Value::as_i64).unwrap_or(0) as i32;
    let y = value.get("y").and_then(Value::as_i64).unwrap_or(0) as i32;
    Ok(Step::TapOnPoint { x, y, point })
}

fn parse_lat_lon(raw: &str) -> Result<(f64, f64), FlowError> {
    let (lat, lon) = raw
        .split_once(',')
        .ok_or_else(|| FlowError::Invalid(format!("invalid coordinates '{}'", raw)))?;
    let lat = lat.trim().parse().map_err(|_| {
        FlowError::Invalid(format!("invalid latitude in '{}'", raw))
    })?;
    let lon = lon.trim().parse().map_err(|_| {
        FlowError::Invalid(format!("invalid longitude in '{}'", raw))
    })?;
    Ok((lat, lon))
}

fn direction_from(value: &Value) -> Option<Direction> {
    scalar_to_string(value)
        .or_else(|| value.get("direction").and_then(scalar_to_string))
        .and_then(|s| Direction::from_str(&s).ok())
}

fn app_id_from(value: &Value) -> Option<String> {
    scalar_to_string(value).or_else(|| value.get("appId").and_then(scalar_to_string))
}

fn nested_commands(value: &Value) -> Result<Vec<Step>, FlowError> {
    match value.get("commands") {
        Some(commands) => parse_steps(commands),
        None => Ok(Vec::new()),
    }
}

fn selector_from(value: &Value) -> Result<Selector, FlowError> {
    if let Some(text) = scalar_to_string(value) {
        return Ok(Selector::from_text(text));
    }
    Ok(serde_yaml::from_value(value.clone())?)
}
