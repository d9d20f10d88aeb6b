//! Configuration for hostdeck, read from `hostdeck.toml`.
//!
//! Every field has a default, so a missing file or a partial file is fine.
//! Lookup order for the file itself: `--config`, `HOSTDECK_CONFIG`,
//! `.hostdeck/hostdeck.toml`, then built-in defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 4310
//!
//! [deploy]
//! apps_root = "/home/deploy/apps"
//! git_base_url = "https://github.com"
//! default_owner = "acme"
//! max_output_bytes = 262144
//! retained_runs = 32
//!
//! [steps]
//! install_command = "npm install"
//! build_command = "npm run build --if-present"
//! start_script = "npm"
//! start_args = "start"
//!
//! [timeouts]
//! fetch_secs = 120
//! install_secs = 600
//! build_secs = 600
//! supervisor_secs = 60
//!
//! [supervisor]
//! command = "pm2"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".hostdeck/hostdeck.toml";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "HOSTDECK_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4310
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploySection {
    /// Parent directory of every working copy; one sub-directory per slot.
    #[serde(default = "default_apps_root")]
    pub apps_root: PathBuf,
    /// Base URL used to build clone URLs for `owner/name` references.
    #[serde(default = "default_git_base_url")]
    pub git_base_url: String,
    /// Owner assumed for bare repository names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_owner: Option<String>,
    /// Retained output per step before the oldest fragments are dropped.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Finished runs kept in memory for inspection.
    #[serde(default = "default_retained_runs")]
    pub retained_runs: usize,
}

fn default_apps_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join("apps"))
        .unwrap_or_else(|| PathBuf::from("apps"))
}

fn default_git_base_url() -> String {
    "https://github.com".to_string()
}

fn default_max_output_bytes() -> usize {
    256 * 1024
}

fn default_retained_runs() -> usize {
    32
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            apps_root: default_apps_root(),
            git_base_url: default_git_base_url(),
            default_owner: None,
            max_output_bytes: default_max_output_bytes(),
            retained_runs: default_retained_runs(),
        }
    }
}

/// Project commands run by the catalog. An empty install or build command
/// removes that step from every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepsSection {
    #[serde(default = "default_install_command")]
    pub install_command: String,
    #[serde(default = "default_build_command")]
    pub build_command: String,
    /// Program the supervisor launches for a newly registered process.
    #[serde(default = "default_start_script")]
    pub start_script: String,
    /// Arguments passed to `start_script`.
    #[serde(default = "default_start_args")]
    pub start_args: String,
}

fn default_install_command() -> String {
    "npm install".to_string()
}

fn default_build_command() -> String {
    "npm run build --if-present".to_string()
}

fn default_start_script() -> String {
    "npm".to_string()
}

fn default_start_args() -> String {
    "start".to_string()
}

impl Default for StepsSection {
    fn default() -> Self {
        Self {
            install_command: default_install_command(),
            build_command: default_build_command(),
            start_script: default_start_script(),
            start_args: default_start_args(),
        }
    }
}

/// Per-step timeouts, in seconds. Each step gets its own budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_fetch_secs")]
    pub fetch_secs: u64,
    #[serde(default = "default_install_secs")]
    pub install_secs: u64,
    #[serde(default = "default_build_secs")]
    pub build_secs: u64,
    #[serde(default = "default_supervisor_secs")]
    pub supervisor_secs: u64,
}

fn default_fetch_secs() -> u64 {
    120
}

fn default_install_secs() -> u64 {
    600
}

fn default_build_secs() -> u64 {
    600
}

fn default_supervisor_secs() -> u64 {
    60
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            fetch_secs: default_fetch_secs(),
            install_secs: default_install_secs(),
            build_secs: default_build_secs(),
            supervisor_secs: default_supervisor_secs(),
        }
    }
}

impl TimeoutsSection {
    pub fn fetch(&self) -> Duration {
        Duration::from_secs(self.fetch_secs)
    }

    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install_secs)
    }

    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build_secs)
    }

    pub fn supervisor(&self) -> Duration {
        Duration::from_secs(self.supervisor_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSection {
    /// Process supervisor CLI (pm2 or a compatible wrapper).
    #[serde(default = "default_supervisor_command")]
    pub command: String,
}

fn default_supervisor_command() -> String {
    "pm2".to_string()
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            command: default_supervisor_command(),
        }
    }
}

/// The complete hostdeck.toml configuration structure.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HostdeckConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub deploy: DeploySection,
    #[serde(default)]
    pub steps: StepsSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
}

impl HostdeckConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse hostdeck.toml")
    }

    /// Resolve the config file location and load it, then apply environment
    /// overrides. An explicit path must exist; the implicit locations fall
    /// back to defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => match std::env::var_os(CONFIG_ENV) {
                Some(path) => Self::load(Path::new(&path))?,
                None => {
                    let default_path = Path::new(DEFAULT_CONFIG_PATH);
                    if default_path.exists() {
                        Self::load(default_path)?
                    } else {
                        Self::default()
                    }
                }
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `HOSTDECK_*` overrides using the given variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("HOSTDECK_APPS_ROOT").filter(|v| !v.trim().is_empty()) {
            self.deploy.apps_root = PathBuf::from(root);
        }
        if let Some(cmd) = lookup("HOSTDECK_PM2_CMD").filter(|v| !v.trim().is_empty()) {
            self.supervisor.command = cmd;
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize hostdeck.toml")
    }

    /// Save configuration to a TOML file, creating the parent directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, self.to_toml_string()?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Make sure the directory holding all working copies exists.
    pub fn ensure_apps_root(&self) -> Result<()> {
        std::fs::create_dir_all(&self.deploy.apps_root).with_context(|| {
            format!(
                "Failed to create apps root {}",
                self.deploy.apps_root.display()
            )
        })
    }
}
