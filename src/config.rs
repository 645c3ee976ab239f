//! Engine configuration.
//!
//! Lookup order for [`EngineConfig::discover`]:
//! 1. `TUPLEPIPE_CONFIG` environment variable (path to a JSON file)
//! 2. `<config dir>/tuplepipe/config.json` (XDG on Linux, Library on macOS)
//! 3. Built-in defaults
//!
//! The `HYSPIRIT` environment variable then overrides the installation root.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::process::{is_executable, CommandSpec};

/// Environment variable naming a config file.
pub const CONFIG_PATH_ENV: &str = "TUPLEPIPE_CONFIG";

/// Environment variable naming the engine installation root.
pub const HOME_ENV: &str = "HYSPIRIT";

/// Settings shared by every engine started from this configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine installation root; binaries live in `<home>/bin`.
    pub home: Option<PathBuf>,
    /// Working directory of spawned engines.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for spawned engines.
    pub env: BTreeMap<String, String>,
    /// Whitespace-separated arguments appended to every engine command.
    pub extra_args: String,
    /// Append `-- -` so engines also read program text from stdin.
    pub read_stdin: bool,
    /// Run engines under the `time` wrapper and capture its report.
    pub take_time: bool,
    pub time_binary: PathBuf,
    /// Do not copy engine stderr to our own stderr (it is still logged).
    pub suppress_stderr: bool,
    /// Number of recent engine stderr lines to keep.
    pub stderr_tail: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            home: None,
            working_dir: None,
            env: BTreeMap::new(),
            extra_args: String::new(),
            read_stdin: false,
            take_time: false,
            time_binary: PathBuf::from("/usr/bin/time"),
            suppress_stderr: false,
            stderr_tail: 64,
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            EngineError::Config(format!("invalid config {}: {}", path.display(), e))
        })?;
        debug!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Resolve the configuration from the environment and the user's config
    /// directory, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Fails only if a config file exists but is unusable.
    pub fn discover() -> EngineResult<Self> {
        let config = match Self::config_path() {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        Ok(config.with_env_overrides())
    }

    fn config_path() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var(CONFIG_PATH_ENV) {
            info!("Using engine config from {}: {}", CONFIG_PATH_ENV, env_path);
            return Some(PathBuf::from(env_path));
        }

        let user = dirs::config_dir()?.join("tuplepipe").join("config.json");
        user.exists().then_some(user)
    }

    /// Apply `HYSPIRIT` on top of the loaded values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(home) = std::env::var(HOME_ENV) {
            if !home.trim().is_empty() {
                self.home = Some(PathBuf::from(home));
            }
        }
        self
    }

    /// Write the configuration as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the file cannot be written.
    pub fn save(&self, path: &Path) -> EngineResult<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| {
            EngineError::Config(format!("cannot write {}: {}", path.display(), e))
        })
    }

    /// Location of an engine binary.
    ///
    /// Names containing a path separator are used as given. Other names are
    /// looked up in `<home>/bin` when a home is configured and left to the
    /// `PATH` search otherwise.
    pub fn binary_path(&self, name: &str) -> PathBuf {
        if name.contains(std::path::MAIN_SEPARATOR) {
            return PathBuf::from(name);
        }
        match &self.home {
            Some(home) => {
                let path = home.join("bin").join(name);
                if !is_executable(&path) {
                    warn!("Engine binary {} is not executable", path.display());
                }
                path
            }
            None => PathBuf::from(name),
        }
    }

    /// [`extra_args`](Self::extra_args) split on whitespace.
    pub fn extra_args(&self) -> Vec<String> {
        self.extra_args
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    /// Wrap a built argv with this configuration's process settings.
    pub fn command_spec(&self, argv: Vec<String>) -> CommandSpec {
        let mut spec = CommandSpec::new(argv).envs(self.env.clone());
        if let Some(dir) = &self.working_dir {
            spec = spec.working_dir(dir);
        }
        if self.take_time {
            spec = spec.timed(&self.time_binary);
        }
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.time_binary, PathBuf::from("/usr/bin/time"));
        assert_eq!(config.stderr_tail, 64);
        assert!(!config.take_time);
        assert!(config.extra_args().is_empty());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"home": "/opt/hyspirit", "extra_args": "-q  --fast", "take_time": true}"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.home, Some(PathBuf::from("/opt/hyspirit")));
        assert_eq!(config.extra_args(), vec!["-q", "--fast"]);
        assert!(config.take_time);
        assert_eq!(config.stderr_tail, 64);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = EngineConfig::default();
        config.env.insert("LANG".to_string(), "C".to_string());
        config.suppress_stderr = true;

        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            EngineConfig::load(&path),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::load(&dir.path().join("missing.json")),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_binary_path_resolution() {
        let mut config = EngineConfig::default();
        assert_eq!(config.binary_path("hyp_pd"), PathBuf::from("hyp_pd"));

        config.home = Some(PathBuf::from("/opt/hyspirit"));
        assert_eq!(
            config.binary_path("hyp_pd"),
            PathBuf::from("/opt/hyspirit/bin/hyp_pd")
        );
        assert_eq!(config.binary_path("/bin/cat"), PathBuf::from("/bin/cat"));
    }

    #[test]
    fn test_command_spec_applies_settings() {
        let config = EngineConfig {
            working_dir: Some(PathBuf::from("/tmp")),
            take_time: true,
            ..EngineConfig::default()
        };
        let spec = config.command_spec(vec!["cat".to_string()]);
        assert!(spec.is_timed());
        assert_eq!(spec.args(), ["cat".to_string()]);
        assert_eq!(spec.effective_argv()[0], "/usr/bin/time");
    }
}
