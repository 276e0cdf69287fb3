//! Application configuration.
//!
//! Layered as built-in defaults, then the TOML config file, then
//! `LAUNCHPAD__SECTION__KEY` environment variables.

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::AuthConfig;
use crate::container::{ContainerRuntime, RuntimeType};
use crate::session::{ActiveScope, FamilyProfiles, SessionServiceConfig};

pub const APP_NAME: &str = "launchpad";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Affiliations users may choose from. Empty accepts any value.
    pub labs: Vec<String>,
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub workspace: WorkspaceConfig,
    pub container: ContainerConfig,
    pub admission: AdmissionConfig,
    pub reaper: ReaperConfig,
    pub families: FamilyProfiles,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level used when no verbosity flag is given.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Override the data directory (database and workspaces by default).
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Hostname used in session access URLs.
    pub public_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            public_host: "localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file. Defaults to `<data_dir>/launchpad.db`.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Directory holding per-user workspaces, as seen by this process.
    /// Defaults to `<data_dir>/workspaces`.
    pub base_dir: Option<String>,
    /// The same directory as seen by the container runtime's host, when
    /// this process runs in a container itself.
    pub host_base_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// `docker` or `podman`; auto-detected when unset.
    pub runtime: Option<RuntimeType>,
    /// Custom path to the runtime binary.
    pub binary: Option<String>,
    pub command_timeout_secs: u64,
    pub stop_grace_secs: Option<u32>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            command_timeout_secs: 60,
            stop_grace_secs: Some(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub max_concurrent_sessions: i64,
    pub active_scope: ActiveScope,
    pub max_lifetime_days: i64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 20,
            active_scope: ActiveScope::Global,
            max_lifetime_days: 14,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
        }
    }
}

impl AppConfig {
    /// Load the layered configuration. A missing file is not an error.
    pub fn load(config_file: &Path) -> Result<Self> {
        let built = Config::builder()
            .add_source(
                Config::try_from(&AppConfig::default()).context("building config defaults")?,
            )
            .add_source(
                File::from(config_file)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(&env_prefix())
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("labs")
                    .with_list_parse_key("auth.admin_emails")
                    .with_list_parse_key("auth.allowed_origins"),
            )
            .build()
            .with_context(|| format!("loading config from {}", config_file.display()))?;

        built
            .try_deserialize()
            .context("deserializing configuration")
    }

    /// Check values the server cannot run without.
    pub fn validate(&self) -> Result<()> {
        self.families.validate().map_err(|e| anyhow!(e))?;
        if self.admission.max_concurrent_sessions < 0 {
            return Err(anyhow!("admission.max_concurrent_sessions must not be negative"));
        }
        if self.admission.max_lifetime_days < 1 {
            return Err(anyhow!("admission.max_lifetime_days must be at least 1"));
        }
        if self.container.command_timeout_secs == 0 {
            return Err(anyhow!("container.command_timeout_secs must be at least 1"));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serializing config to TOML")
    }

    pub fn session_service_config(&self) -> SessionServiceConfig {
        SessionServiceConfig {
            max_concurrent_sessions: self.admission.max_concurrent_sessions,
            active_scope: self.admission.active_scope,
            max_lifetime_days: self.admission.max_lifetime_days,
            runtime_timeout: Duration::from_secs(self.container.command_timeout_secs),
            stop_grace_secs: self.container.stop_grace_secs,
            public_host: self.server.public_host.clone(),
            families: self.families.clone(),
        }
    }

    /// The configured docker/podman client.
    pub fn container_runtime(&self) -> ContainerRuntime {
        let runtime = match (self.container.runtime, self.container.binary.as_deref()) {
            (Some(kind), Some(binary)) => ContainerRuntime::with_binary(kind, binary),
            (None, Some(binary)) => ContainerRuntime::with_binary(RuntimeType::default(), binary),
            (Some(kind), None) => ContainerRuntime::with_type(kind),
            (None, None) => ContainerRuntime::new(),
        };
        // Outlasts the lifecycle's own bound on each call.
        runtime.with_command_timeout(Duration::from_secs(
            self.container.command_timeout_secs.saturating_add(5),
        ))
    }
}

/// Resolved on-disk locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
}

impl AppPaths {
    pub fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
        })
    }

    pub fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
        }
        Ok(self)
    }

    pub fn database_path(&self, cfg: &AppConfig) -> Result<PathBuf> {
        match cfg.database.path {
            Some(ref path) => expand_str_path(path),
            None => Ok(self.data_dir.join(format!("{APP_NAME}.db"))),
        }
    }

    pub fn workspace_dir(&self, cfg: &AppConfig) -> Result<PathBuf> {
        match cfg.workspace.base_dir {
            Some(ref path) => expand_str_path(path),
            None => Ok(self.data_dir.join("workspaces")),
        }
    }

    pub fn host_workspace_dir(&self, cfg: &AppConfig) -> Result<Option<PathBuf>> {
        cfg.workspace
            .host_base_dir
            .as_deref()
            .map(expand_str_path)
            .transpose()
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}",
            self.config_file.display(),
            self.data_dir.display()
        )
    }
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let mut body = format!("# Configuration for {}\n# File: {}\n\n", APP_NAME, path.display());
    body.push_str(&AppConfig::default().to_toml()?);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

pub fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionFamily;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.admission, AdmissionConfig::default());
        assert_eq!(config.families, FamilyProfiles::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_overrides_only_what_it_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
labs = ["Genomics", "Ecology"]

[admission]
max_concurrent_sessions = 2
active_scope = "per_family"

[families.jupyter]
image = "registry.local/jupyter:2024"
port_min = 9200
"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.admission.max_concurrent_sessions, 2);
        assert_eq!(config.admission.active_scope, ActiveScope::PerFamily);
        assert_eq!(config.admission.max_lifetime_days, 14);
        assert_eq!(config.labs, vec!["Genomics", "Ecology"]);

        let jupyter = config.families.get(SessionFamily::Jupyter);
        assert_eq!(jupyter.image, "registry.local/jupyter:2024");
        assert_eq!(jupyter.port_min, 9200);
        assert_eq!(jupyter.port_max, 9100);
        assert_eq!(jupyter.secret_env, "JUPYTER_TOKEN");
        // port_min above port_max
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        write_default_config(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# Configuration for launchpad"));
        let loaded = AppConfig::load(&path).unwrap();
        let defaults = AppConfig::default();
        assert_eq!(loaded.server, defaults.server);
        assert_eq!(loaded.container, defaults.container);
        assert_eq!(loaded.reaper, defaults.reaper);
        assert_eq!(loaded.families.rstudio.image, defaults.families.rstudio.image);
        assert_eq!(loaded.families.jupyter.port_max, 9100);
    }

    #[test]
    fn derived_paths_follow_data_dir() {
        let paths = AppPaths {
            config_file: PathBuf::from("/etc/launchpad/config.toml"),
            data_dir: PathBuf::from("/var/lib/launchpad"),
        };
        let mut config = AppConfig::default();
        assert_eq!(
            paths.database_path(&config).unwrap(),
            PathBuf::from("/var/lib/launchpad/launchpad.db")
        );
        assert_eq!(
            paths.workspace_dir(&config).unwrap(),
            PathBuf::from("/var/lib/launchpad/workspaces")
        );
        assert_eq!(paths.host_workspace_dir(&config).unwrap(), None);

        config.workspace.host_base_dir = Some("/srv/userdata".to_string());
        assert_eq!(
            paths.host_workspace_dir(&config).unwrap(),
            Some(PathBuf::from("/srv/userdata"))
        );
    }

    #[test]
    fn service_config_carries_admission_settings() {
        let mut config = AppConfig::default();
        config.admission.max_concurrent_sessions = 3;
        config.container.command_timeout_secs = 15;
        let service = config.session_service_config();
        assert_eq!(service.max_concurrent_sessions, 3);
        assert_eq!(service.runtime_timeout, Duration::from_secs(15));
        assert_eq!(service.public_host, "localhost");
    }
}
