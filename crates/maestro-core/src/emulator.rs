//! Android emulator lifecycle management.
//!
//! Handles toolchain discovery, console-port allocation, boot with
//! three-stage verification, and the shutdown chain. Started instances are
//! tracked in a shared map keyed by serial (`emulator-<console_port>`).
//!
//! Port allocation is process-wide mutable state behind a lock, with an
//! optional JSON persistence file under the user's home so an AVD keeps
//! its port across runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::adb::{Adb, AdbError};
use crate::config;

/// First console port to hand out; console ports are always even, the adb
/// port is console + 1.
pub const BASE_CONSOLE_PORT: u16 = 5554;

const SDK_ENV_VARS: [&str; 3] = ["ANDROID_HOME", "ANDROID_SDK_ROOT", "ANDROID_SDK_HOME"];

// ---------------------------------------------------------------------------
// Errors and status
// ---------------------------------------------------------------------------

/// Errors from emulator management.
#[derive(Error, Debug)]
pub enum EmulatorError {
    /// Neither the SDK directories nor PATH carry the requested tool.
    #[error("Android toolchain binary not found: {0}")]
    ToolchainNotFound(String),

    /// The emulator did not reach the ready state; the status names the
    /// stages that did not pass.
    #[error("Emulator '{avd}' failed to boot: {status}")]
    Boot { avd: String, status: BootStatus },

    /// Every start attempt hit a port conflict.
    #[error("No free console port found for '{avd}'")]
    PortsExhausted { avd: String },

    /// The instance survived the whole shutdown chain.
    #[error("Failed to shut down {serial}: {message}")]
    Shutdown { serial: String, message: String },

    #[error("adb error: {0}")]
    Adb(#[from] AdbError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The four boot-verification checks; fully ready iff all hold at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootStatus {
    pub state_ready: bool,
    pub boot_completed: bool,
    pub settings_ready: bool,
    pub package_manager_ready: bool,
}

impl BootStatus {
    pub fn fully_ready(&self) -> bool {
        self.state_ready && self.boot_completed && self.settings_ready && self.package_manager_ready
    }

    fn failed_stages(&self) -> Vec<&'static str> {
        [
            ("state", self.state_ready),
            ("boot_completed", self.boot_completed),
            ("settings", self.settings_ready),
            ("package_manager", self.package_manager_ready),
        ]
        .iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| *name)
        .collect()
    }
}

impl std::fmt::Display for BootStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.fully_ready() {
            write!(f, "fully ready")
        } else {
            write!(f, "stages not passed: {}", self.failed_stages().join(", "))
        }
    }
}

/// One emulator started (or adopted) by this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorInstance {
    pub avd_name: String,
    pub serial: String,
    pub console_port: u16,
    pub adb_port: u16,
    pub started_by: String,
    pub boot_start: DateTime<Utc>,
    pub boot_duration: Duration,
}

/// Timing and retry knobs; tests inject shorter values.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Total boot budget across all stages.
    pub boot_timeout: Duration,
    /// Stage 1 budget: waiting for `adb get-state` to report `device`.
    pub stage1_timeout: Duration,
    /// Budget for the cooperative part of the shutdown chain.
    pub shutdown_timeout: Duration,
    pub poll_interval: Duration,
    /// Start retries on port conflicts.
    pub max_start_attempts: u32,
    /// Whether allocations are persisted to the port-map file.
    pub persist_ports: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            boot_timeout: Duration::from_secs(180),
            stage1_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            max_start_attempts: 50,
            persist_ports: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Toolchain discovery
// ---------------------------------------------------------------------------

fn sdk_root() -> Option<PathBuf> {
    for var in SDK_ENV_VARS {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                return Some(PathBuf::from(value));
            }
        }
    }
    None
}

/// Locates the `emulator` binary: `$SDK/emulator/emulator`, then
/// `$SDK/tools/emulator`, then PATH.
pub fn find_emulator_binary() -> Result<PathBuf, EmulatorError> {
    find_tool("emulator", &["emulator/emulator", "tools/emulator"])
}

/// Locates `avdmanager` with the same layering as the emulator binary.
pub fn find_avdmanager() -> Result<PathBuf, EmulatorError> {
    find_tool(
        "avdmanager",
        &[
            "cmdline-tools/latest/bin/avdmanager",
            "tools/bin/avdmanager",
        ],
    )
}

fn find_tool(name: &str, sdk_relative: &[&str]) -> Result<PathBuf, EmulatorError> {
    if let Some(sdk) = sdk_root() {
        for rel in sdk_relative {
            let candidate = sdk.join(rel);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    find_in_path(name).ok_or_else(|| EmulatorError::ToolchainNotFound(name.to_string()))
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

// ---------------------------------------------------------------------------
// Boot probing
// ---------------------------------------------------------------------------

/// The device checks boot verification runs against; implemented by adb
/// and stubbed in tests.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    async fn get_state(&self) -> Result<String, AdbError>;
    async fn getprop(&self, name: &str) -> Result<String, AdbError>;
    async fn shell_succeeds(&self, args: &[&str]) -> bool;
}

#[async_trait]
impl DeviceProbe for Adb {
    async fn get_state(&self) -> Result<String, AdbError> {
        Adb::get_state(self).await
    }

    async fn getprop(&self, name: &str) -> Result<String, AdbError> {
        Adb::getprop(self, name).await
    }

    async fn shell_succeeds(&self, args: &[&str]) -> bool {
        self.shell(args).await.is_ok()
    }
}

/// Runs all four boot checks once.
pub async fn check_boot_status(probe: &dyn DeviceProbe) -> BootStatus {
    BootStatus {
        state_ready: probe
            .get_state()
            .await
            .map(|s| s.trim() == "device")
            .unwrap_or(false),
        boot_completed: probe
            .getprop("sys.boot_completed")
            .await
            .map(|v| v.trim() == "1")
            .unwrap_or(false),
        settings_ready: probe.shell_succeeds(&["settings", "list", "global"]).await,
        package_manager_ready: probe.shell_succeeds(&["pm", "get-max-users"]).await,
    }
}

/// Three-stage boot wait: first `get-state` alone, then all four checks
/// simultaneously until the remaining budget (at least 30 seconds) runs
/// out.
pub async fn wait_for_boot(
    probe: &dyn DeviceProbe,
    avd: &str,
    config: &EmulatorConfig,
) -> Result<BootStatus, EmulatorError> {
    let boot_start = Instant::now();

    let stage1_deadline = Instant::now() + config.stage1_timeout;
    loop {
        let state_ready = probe
            .get_state()
            .await
            .map(|s| s.trim() == "device")
            .unwrap_or(false);
        if state_ready {
            break;
        }
        if Instant::now() >= stage1_deadline {
            return Err(EmulatorError::Boot {
                avd: avd.to_string(),
                status: check_boot_status(probe).await,
            });
        }
        tokio::time::sleep(config.poll_interval).await;
    }

    let remaining = config
        .boot_timeout
        .saturating_sub(boot_start.elapsed())
        .max(Duration::from_secs(30).min(config.boot_timeout));
    let deadline = Instant::now() + remaining;
    loop {
        let status = check_boot_status(probe).await;
        if status.fully_ready() {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            return Err(EmulatorError::Boot {
                avd: avd.to_string(),
                status,
            });
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}

// ---------------------------------------------------------------------------
// Port allocation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PortAllocator {
    assigned: HashMap<String, u16>,
    persist_path: Option<PathBuf>,
}

impl PortAllocator {
    fn load(persist_path: Option<PathBuf>) -> Self {
        let assigned = persist_path
            .as_ref()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            assigned,
            persist_path,
        }
    }

    /// Reuses the AVD's remembered port, or hands out the next even port
    /// above everything seen so far.
    fn allocate(&mut self, avd: &str) -> u16 {
        if let Some(&port) = self.assigned.get(avd) {
            return port;
        }
        let port = self.next_port();
        self.assigned.insert(avd.to_string(), port);
        self.save();
        port
    }

    /// Moves the AVD past a conflicting port.
    fn bump(&mut self, avd: &str) -> u16 {
        let port = self.next_port();
        self.assigned.insert(avd.to_string(), port);
        self.save();
        port
    }

    fn next_port(&self) -> u16 {
        let highest = self.assigned.values().max().copied();
        let port = match highest {
            Some(p) => p + 2,
            None => BASE_CONSOLE_PORT,
        };
        // Console ports are always even.
        port & !1
    }

    fn save(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        // Write-then-rename keeps the map readable by concurrent runs.
        let tmp = path.with_extension("json.tmp");
        if let Ok(json) = serde_json::to_string_pretty(&self.assigned) {
            if std::fs::write(&tmp, json).is_ok() {
                let _ = std::fs::rename(&tmp, path);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Tracks started emulators and owns port allocation.
pub struct EmulatorManager {
    config: EmulatorConfig,
    instances: RwLock<HashMap<String, EmulatorInstance>>,
    ports: Mutex<PortAllocator>,
    pids: Mutex<HashMap<String, u32>>,
}

impl EmulatorManager {
    pub fn new(config: EmulatorConfig) -> Self {
        let persist_path = if config.persist_ports {
            config::emulator_port_map_path()
        } else {
            None
        };
        Self {
            config,
            instances: RwLock::new(HashMap::new()),
            ports: Mutex::new(PortAllocator::load(persist_path)),
            pids: Mutex::new(HashMap::new()),
        }
    }

    /// Manager with an explicit port-map file; tests point this at a
    /// temp directory.
    pub fn with_port_map(config: EmulatorConfig, port_map: Option<PathBuf>) -> Self {
        Self {
            config,
            instances: RwLock::new(HashMap::new()),
            ports: Mutex::new(PortAllocator::load(port_map)),
            pids: Mutex::new(HashMap::new()),
        }
    }

    /// Drops all tracked state. Test hook.
    pub async fn reset(&self) {
        self.instances.write().await.clear();
        let mut ports = self.ports.lock().unwrap();
        ports.assigned.clear();
        self.pids.lock().unwrap().clear();
    }

    pub fn allocate_port(&self, avd: &str) -> u16 {
        self.ports.lock().unwrap().allocate(avd)
    }

    fn bump_port(&self, avd: &str) -> u16 {
        self.ports.lock().unwrap().bump(avd)
    }

    pub async fn instances(&self) -> Vec<EmulatorInstance> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn instance(&self, serial: &str) -> Option<EmulatorInstance> {
        self.instances.read().await.get(serial).cloned()
    }

    /// Boots an AVD, retrying on the next even port when the console port
    /// is taken (up to `max_start_attempts`).
    pub async fn start(&self, avd: &str) -> Result<EmulatorInstance, EmulatorError> {
        let emulator_bin = find_emulator_binary()?;
        let mut port = self.allocate_port(avd);

        for attempt in 0..self.config.max_start_attempts {
            let serial = format!("emulator-{}", port);
            info!(avd, port, attempt, "starting emulator");

            let log_path = self.console_log_path(port);
            let log = std::fs::File::create(&log_path)?;
            let mut child = tokio::process::Command::new(&emulator_bin)
                .args([
                    "-avd",
                    avd,
                    "-port",
                    &port.to_string(),
                    "-netdelay",
                    "none",
                    "-netspeed",
                    "full",
                    "-no-boot-anim",
                    "-no-snapshot-load",
                ])
                .stdin(Stdio::null())
                .stdout(Stdio::from(log.try_clone()?))
                .stderr(Stdio::from(log))
                .spawn()?;

            let boot_start = Utc::now();
            let clock = Instant::now();
            let adb = Adb::new(&serial);
            match wait_for_boot(&adb, avd, &self.config).await {
                Ok(status) => {
                    debug!(serial = %serial, %status, "emulator ready");
                    let instance = EmulatorInstance {
                        avd_name: avd.to_string(),
                        serial: serial.clone(),
                        console_port: port,
                        adb_port: port + 1,
                        started_by: format!("maestro-runner:{}", std::process::id()),
                        boot_start,
                        boot_duration: clock.elapsed(),
                    };
                    if let Some(pid) = child.id() {
                        self.pids.lock().unwrap().insert(serial.clone(), pid);
                    }
                    self.instances
                        .write()
                        .await
                        .insert(serial.clone(), instance.clone());
                    return Ok(instance);
                }
                Err(e) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    let log_tail = std::fs::read_to_string(&log_path).unwrap_or_default();
                    if is_port_conflict(&log_tail) && attempt + 1 < self.config.max_start_attempts
                    {
                        warn!(port, "console port in use, trying the next one");
                        port = self.bump_port(avd);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        Err(EmulatorError::PortsExhausted {
            avd: avd.to_string(),
        })
    }

    fn console_log_path(&self, port: u16) -> PathBuf {
        let dir = config::cache_dir();
        let _ = std::fs::create_dir_all(&dir);
        dir.join(format!("emulator-{}.log", port))
    }

    /// Shutdown chain: `adb emu kill`, then poll `get-state` for the
    /// shutdown budget, then TERM and finally KILL the process found by
    /// its port pattern.
    pub async fn stop(&self, serial: &str) -> Result<(), EmulatorError> {
        let instance = self.instance(serial).await;
        let adb = Adb::new(serial);

        if let Err(e) = adb.emu_kill().await {
            debug!(serial, error = %e, "adb emu kill failed, falling back to process kill");
        }

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while Instant::now() < deadline {
            if adb.get_state().await.is_err() {
                self.forget(serial).await;
                return Ok(());
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        let port = serial
            .strip_prefix("emulator-")
            .and_then(|p| p.parse::<u16>().ok());
        let mut pids = match port {
            Some(port) => pgrep(&format!("emulator.*-port {}", port)).await,
            None => Vec::new(),
        };
        if pids.is_empty() {
            let pattern = match &instance {
                Some(i) => format!("qemu-system.*-avd {}", i.avd_name),
                None => "qemu-system.*-avd".to_string(),
            };
            pids = pgrep(&pattern).await;
        }
        if pids.is_empty() {
            // Nothing left to kill; the device just went away slowly.
            self.forget(serial).await;
            return Ok(());
        }

        for pid in &pids {
            let _ = signal(*pid, "-TERM").await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        for pid in &pids {
            let _ = signal(*pid, "-KILL").await;
        }

        if adb.get_state().await.is_ok() {
            return Err(EmulatorError::Shutdown {
                serial: serial.to_string(),
                message: "process survived TERM and KILL".to_string(),
            });
        }
        self.forget(serial).await;
        Ok(())
    }

    /// Shuts down every tracked instance in parallel, collecting errors.
    pub async fn stop_all(self: Arc<Self>) -> Vec<(String, EmulatorError)> {
        let serials: Vec<String> = self.instances.read().await.keys().cloned().collect();
        let mut handles = Vec::with_capacity(serials.len());
        for serial in serials {
            let manager = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                let result = manager.stop(&serial).await;
                (serial, result)
            }));
        }
        let mut errors = Vec::new();
        for handle in handles {
            if let Ok((serial, Err(e))) = handle.await {
                errors.push((serial, e));
            }
        }
        errors
    }

    async fn forget(&self, serial: &str) {
        self.instances.write().await.remove(serial);
        self.pids.lock().unwrap().remove(serial);
    }
}

fn is_port_conflict(log: &str) -> bool {
    let lowered = log.to_lowercase();
    lowered.contains("already in use")
        || lowered.contains("address in use")
        || lowered.contains("port is busy")
}

async fn pgrep(pattern: &str) -> Vec<u32> {
    let output = tokio::process::Command::new("pgrep")
        .args(["-f", pattern])
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect(),
        _ => Vec::new(),
    }
}

async fn signal(pid: u32, sig: &str) -> bool {
    tokio::process::Command::new("kill")
        .args([sig, &pid.to_string()])
        .output()
        .await
        .map(|out| out.status.success())
        .unwrap_or(false)
}
