//! Workspace configuration and home-directory resolution.
//!
//! A workspace may carry a `config.yaml` (or `config.yml`) next to its
//! flows; unknown keys are ignored so newer configs keep working against
//! older runners.
//!
//! The runner home is resolved once per process: `MAESTRO_RUNNER_HOME`
//! wins, then the parent of the binary when it sits in a `bin/` directory
//! (symlinks resolved), then the current working directory. `reset_home`
//! clears the cache for tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const HOME_ENV: &str = "MAESTRO_RUNNER_HOME";
const CONFIG_FILENAMES: [&str; 2] = ["config.yaml", "config.yml"];

/// Errors raised while loading a workspace config.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("YAML error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Workspace-level settings from `config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceConfig {
    /// Glob patterns selecting top-level test-case files; `"*"` when unset.
    pub flows: Vec<String>,
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub env: HashMap<String, String>,
    pub platform: Option<String>,
    pub device: Option<String>,
    pub app_id: Option<String>,
    /// Server idle timeout in milliseconds; 0 disables idle waiting.
    pub wait_for_idle_timeout: Option<u64>,
}

impl WorkspaceConfig {
    /// Loads `config.yaml`/`config.yml` from a workspace directory.
    /// Returns defaults when neither exists.
    pub fn load(workspace_dir: &Path) -> Result<Self, ConfigError> {
        for name in CONFIG_FILENAMES {
            let path = workspace_dir.join(name);
            if path.is_file() {
                let raw = std::fs::read_to_string(&path)?;
                let config = serde_yaml::from_str(&raw)
                    .map_err(|source| ConfigError::Yaml { path, source })?;
                return Ok(config);
            }
        }
        Ok(Self::default())
    }

    /// Effective flow patterns; the default is top-level files only.
    pub fn flow_patterns(&self) -> Vec<String> {
        if self.flows.is_empty() {
            vec!["*".to_string()]
        } else {
            self.flows.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Home resolution
// ---------------------------------------------------------------------------

static HOME: Mutex<Option<PathBuf>> = Mutex::new(None);

/// The runner home directory, cached for the process lifetime.
pub fn runner_home() -> PathBuf {
    let mut cached = HOME.lock().unwrap();
    if let Some(home) = cached.as_ref() {
        return home.clone();
    }
    let home = resolve_home();
    debug!(home = %home.display(), "resolved runner home");
    *cached = Some(home.clone());
    home
}

/// Clears the cached home; the next call re-resolves. Test hook.
pub fn reset_home() {
    *HOME.lock().unwrap() = None;
}

fn resolve_home() -> PathBuf {
    if let Ok(dir) = std::env::var(HOME_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Some(home) = home_from_binary() {
        return home;
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// `<prefix>` for a binary installed at `<prefix>/bin/maestro`.
fn home_from_binary() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let exe = exe.canonicalize().unwrap_or(exe);
    let bin_dir = exe.parent()?;
    if bin_dir.file_name()? == "bin" {
        bin_dir.parent().map(|p| p.to_path_buf())
    } else {
        None
    }
}

/// `<home>/cache`.
pub fn cache_dir() -> PathBuf {
    runner_home().join("cache")
}

/// `<home>/drivers/<platform>`.
pub fn drivers_dir(platform: &str) -> PathBuf {
    runner_home().join("drivers").join(platform)
}

/// Location of the persisted emulator port map, when a user home exists.
pub fn emulator_port_map_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".maestro-runner").join("emulator-ports.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_returns_defaults_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkspaceConfig::load(dir.path()).unwrap();
        assert_eq!(config, WorkspaceConfig::default());
        assert_eq!(config.flow_patterns(), vec!["*"]);
    }

    #[test]
    fn load_reads_recognised_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("config.yaml")).unwrap();
        writeln!(
            file,
            "flows:\n  - \"smoke/*\"\nincludeTags:\n  - smoke\nexcludeTags:\n  - slow\nenv:\n  BASE_URL: https://example.com\nplatform: android\nappId: com.example.app\nwaitForIdleTimeout: 0\nfutureKey: ignored\n"
        )
        .unwrap();

        let config = WorkspaceConfig::load(dir.path()).unwrap();
        assert_eq!(config.flows, vec!["smoke/*"]);
        assert_eq!(config.include_tags, vec!["smoke"]);
        assert_eq!(config.exclude_tags, vec!["slow"]);
        assert_eq!(config.env.get("BASE_URL").unwrap(), "https://example.com");
        assert_eq!(config.platform.as_deref(), Some("android"));
        assert_eq!(config.app_id.as_deref(), Some("com.example.app"));
        assert_eq!(config.wait_for_idle_timeout, Some(0));
    }

    #[test]
    fn load_accepts_yml_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yml"), "platform: android\n").unwrap();
        let config = WorkspaceConfig::load(dir.path()).unwrap();
        assert_eq!(config.platform.as_deref(), Some("android"));
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "flows: [unclosed\n").unwrap();
        assert!(matches!(
            WorkspaceConfig::load(dir.path()),
            Err(ConfigError::Yaml { .. })
        ));
    }

    // Serialises the tests that touch the process-wide home cache.
    static HOME_TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn env_override_wins_home_resolution() {
        let _guard = HOME_TEST_LOCK.lock().unwrap();
        reset_home();
        std::env::set_var(HOME_ENV, "/tmp/maestro-test-home");
        let home = runner_home();
        std::env::remove_var(HOME_ENV);
        reset_home();
        assert_eq!(home, PathBuf::from("/tmp/maestro-test-home"));
    }

    #[test]
    fn derived_paths_hang_off_home() {
        let _guard = HOME_TEST_LOCK.lock().unwrap();
        reset_home();
        std::env::set_var(HOME_ENV, "/tmp/maestro-derived");
        let cache = cache_dir();
        let drivers = drivers_dir("android");
        std::env::remove_var(HOME_ENV);
        reset_home();
        assert_eq!(cache, PathBuf::from("/tmp/maestro-derived/cache"));
        assert_eq!(
            drivers,
            PathBuf::from("/tmp/maestro-derived/drivers/android")
        );
    }
}
