//! Thin wrapper around the `adb` command-line tool.
//!
//! All device shell access goes through here. Commands are passed as argv
//! arrays rather than joined strings so intent extras and URLs survive
//! without quoting hazards. A non-zero exit maps to [`AdbError::CommandFailed`]
//! carrying stderr; stdout is returned trimmed.

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors from the adb layer.
#[derive(Error, Debug)]
pub enum AdbError {
    /// adb exited non-zero; carries stderr (or stdout when stderr is empty).
    #[error("adb command failed: {0}")]
    CommandFailed(String),

    /// adb could not be spawned or its output could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle to one device's adb endpoint.
#[derive(Debug, Clone)]
pub struct Adb {
    serial: Option<String>,
}

impl Adb {
    /// Adb bound to a specific device serial.
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: Some(serial.into()),
        }
    }

    /// Adb without a `-s` argument (single-device setups).
    pub fn unbound() -> Self {
        Self { serial: None }
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn build_args<'a>(&'a self, args: &[&'a str]) -> Vec<&'a str> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(serial) = &self.serial {
            full.push("-s");
            full.push(serial.as_str());
        }
        full.extend_from_slice(args);
        full
    }

    /// Runs `adb [-s serial] <args>` and returns trimmed stdout.
    pub async fn command(&self, args: &[&str]) -> Result<String, AdbError> {
        let full = self.build_args(args);
        debug!(args = ?full, "adb");
        let output = Command::new("adb").args(&full).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = if stderr.is_empty() {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            } else {
                stderr
            };
            return Err(AdbError::CommandFailed(detail));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Runs `adb shell <args>` on the bound device.
    pub async fn shell(&self, args: &[&str]) -> Result<String, AdbError> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push("shell");
        full.extend_from_slice(args);
        self.command(&full).await
    }

    /// `adb get-state`; returns `device` once the device is visible.
    pub async fn get_state(&self) -> Result<String, AdbError> {
        self.command(&["get-state"]).await
    }

    /// `adb shell getprop <name>`.
    pub async fn getprop(&self, name: &str) -> Result<String, AdbError> {
        self.shell(&["getprop", name]).await
    }

    /// `adb emu kill` — asks a running emulator to shut down.
    pub async fn emu_kill(&self) -> Result<String, AdbError> {
        self.command(&["emu", "kill"]).await
    }

    /// `adb forward tcp:<local> tcp:<remote>`.
    pub async fn forward(&self, local_port: u16, device_port: u16) -> Result<(), AdbError> {
        self.command(&[
            "forward",
            &format!("tcp:{}", local_port),
            &format!("tcp:{}", device_port),
        ])
        .await?;
        Ok(())
    }

    /// Lists connected devices as `(serial, state)` pairs.
    pub async fn devices() -> Result<Vec<(String, String)>, AdbError> {
        let output = Command::new("adb").args(["devices"]).output().await?;
        if !output.status.success() {
            return Err(AdbError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(parse_devices(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn parse_devices(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(serial), Some(state)) => Some((serial.to_string(), state.to_string())),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_flag_prepended() {
        let adb = Adb::new("emulator-5554");
        assert_eq!(
            adb.build_args(&["shell", "getprop"]),
            vec!["-s", "emulator-5554", "shell", "getprop"]
        );
    }

    #[test]
    fn unbound_omits_serial_flag() {
        let adb = Adb::unbound();
        assert_eq!(adb.build_args(&["devices"]), vec!["devices"]);
    }

    #[test]
    fn parses_device_listing() {
        let raw = "List of devices attached\nemulator-5554\tdevice\nemulator-5556\toffline\n\n";
        let devices = parse_devices(raw);
        assert_eq!(
            devices,
            vec![
                ("emulator-5554".to_string(), "device".to_string()),
                ("emulator-5556".to_string(), "offline".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn missing_device_surfaces_command_failure() {
        // adb may be absent entirely in CI; both the Io and CommandFailed
        // shapes are acceptable, success is not.
        let adb = Adb::new("no-such-device-000");
        assert!(adb.get_state().await.is_err());
    }
}
