//! Container launch specification and input validation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::error::{ContainerError, ContainerResult};

/// Port mapping configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port in the container.
    pub container_port: u16,
}

impl PortMapping {
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
        }
    }
}

/// Everything the runtime needs to start one session container.
///
/// Environment values carry the session secret, so `Debug` only prints
/// the variable names.
#[derive(Clone, Default)]
pub struct LaunchSpec {
    /// Container name, unique per session.
    pub name: String,
    /// Docker/OCI image to use.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Port mappings.
    pub ports: Vec<PortMapping>,
    /// Volume mounts (host_path -> container_path).
    pub volumes: Vec<(String, String)>,
    /// Memory limit passed through verbatim (e.g. "16g").
    pub memory: Option<String>,
    /// CPU limit passed through verbatim (e.g. "2.0").
    pub cpus: Option<String>,
    /// Writable layer size limit (e.g. "200G").
    pub storage_limit: Option<String>,
    /// Remove the container once it exits.
    pub auto_remove: bool,
    /// Labels for the container.
    pub labels: BTreeMap<String, String>,
}

impl fmt::Debug for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchSpec")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("ports", &self.ports)
            .field("volumes", &self.volumes)
            .field("memory", &self.memory)
            .field("cpus", &self.cpus)
            .field("storage_limit", &self.storage_limit)
            .field("auto_remove", &self.auto_remove)
            .field("labels", &self.labels)
            .finish()
    }
}

impl LaunchSpec {
    /// Create a detached, auto-removing container spec.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            auto_remove: true,
            ..Default::default()
        }
    }

    /// Validate all fields before they reach the runtime command line.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;
        validate_container_name(&self.name)?;

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        for (host_path, container_path) in &self.volumes {
            validate_volume_path(host_path, "host")?;
            validate_volume_path(container_path, "container")?;
            validate_container_path(container_path)?;
        }

        for (field, value) in [
            ("memory", &self.memory),
            ("cpus", &self.cpus),
            ("storage", &self.storage_limit),
        ] {
            if let Some(value) = value {
                validate_resource_value(field, value)?;
            }
        }

        for key in self.labels.keys() {
            validate_label_key(key)?;
        }

        Ok(())
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortMapping::new(host_port, container_port));
        self
    }

    pub fn volume(
        mut self,
        host_path: impl Into<String>,
        container_path: impl Into<String>,
    ) -> Self {
        self.volumes.push((host_path.into(), container_path.into()));
        self
    }

    pub fn memory(mut self, limit: impl Into<String>) -> Self {
        self.memory = Some(limit.into());
        self
    }

    pub fn cpus(mut self, limit: impl Into<String>) -> Self {
        self.cpus = Some(limit.into());
        self
    }

    /// Set the storage limit; blank values are ignored.
    pub fn storage_limit(mut self, limit: Option<impl Into<String>>) -> Self {
        self.storage_limit = limit
            .map(Into::into)
            .filter(|value: &String| !value.trim().is_empty());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Result of asking the runtime to stop a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The runtime stopped the container.
    Stopped,
    /// The runtime has no container with that name.
    NotFound,
    /// Another stop or removal is already underway.
    InProgress,
}

impl fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopOutcome::Stopped => write!(f, "stopped"),
            StopOutcome::NotFound => write!(f, "not found"),
            StopOutcome::InProgress => write!(f, "in progress"),
        }
    }
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container name or ID.
///
/// Names must start with an alphanumeric character or underscore and may
/// contain only alphanumerics, hyphens, and underscores.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    let Some(first_char) = name.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    };

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters",
            name
        )));
    }

    Ok(())
}

/// Validate an environment variable key (POSIX style).
fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    let Some(first_char) = key.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    };

    if key.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "environment variable key exceeds maximum length of 256 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '_';
    if !key.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters",
            key
        )));
    }

    Ok(())
}

/// Validate a volume path (host or container side).
fn validate_volume_path(path: &str, side: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path cannot be empty",
            side
        )));
    }

    if path.len() > 4096 {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path exceeds maximum length of 4096 characters",
            side
        )));
    }

    if path.contains('\0') {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path cannot contain null bytes",
            side
        )));
    }

    // ':' would be read as the mount separator.
    let dangerous_chars = [
        '$', '`', '!', '&', '|', ';', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?', '\\', '"',
        '\'', '\n', '\r', ':',
    ];
    if let Some(c) = dangerous_chars.iter().find(|c| path.contains(**c)) {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path contains dangerous character '{}'",
            side, c
        )));
    }

    Ok(())
}

/// Validate a container-internal path.
fn validate_container_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(
            "container path must be absolute (start with '/')".to_string(),
        ));
    }

    Ok(())
}

/// Validate a resource limit such as "16g", "2.0" or "200G".
fn validate_resource_value(field: &str, value: &str) -> ContainerResult<()> {
    if value.is_empty() || value.len() > 32 {
        return Err(ContainerError::InvalidInput(format!(
            "{} limit must be between 1 and 32 characters",
            field
        )));
    }

    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '.') {
        return Err(ContainerError::InvalidInput(format!(
            "{} limit '{}' contains invalid characters",
            field, value
        )));
    }

    Ok(())
}

fn validate_label_key(key: &str) -> ContainerResult<()> {
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_';
    if key.is_empty() || !key.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "label key '{}' is invalid",
            key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[test]
    fn test_validate_image_name_valid() {
        assert!(validate_image_name("rocker/rstudio:latest").is_ok());
        assert!(validate_image_name("jupyter/datascience-notebook:latest").is_ok());
        assert!(validate_image_name("myregistry.io/myimage:v1.0").is_ok());
        assert!(validate_image_name("gcr.io/project/image@sha256:abc123").is_ok());
    }

    #[test]
    fn test_validate_image_name_invalid() {
        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("image with spaces").is_err());
        assert!(validate_image_name("image;rm -rf /").is_err());
        assert!(validate_image_name("image$(whoami)").is_err());
        assert!(validate_image_name("../../../etc/passwd").is_err());
    }

    #[test]
    fn test_validate_container_name() {
        assert!(validate_container_name("rstudio-alice-0a1b2c3d").is_ok());
        assert!(validate_container_name("_private").is_ok());
        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("-starts-with-dash").is_err());
        assert!(validate_container_name("has.dot").is_err());
        assert!(validate_container_name("$(whoami)").is_err());
    }

    #[test]
    fn test_validate_env_var_key() {
        assert!(validate_env_var_key("PASSWORD").is_ok());
        assert!(validate_env_var_key("JUPYTER_TOKEN").is_ok());
        assert!(validate_env_var_key("123VAR").is_err());
        assert!(validate_env_var_key("MY-VAR").is_err());
    }

    #[test]
    fn test_validate_volume_paths() {
        assert!(validate_volume_path("/srv/user_data/alice", "host").is_ok());
        assert!(validate_volume_path("/path;rm -rf /", "host").is_err());
        assert!(validate_volume_path("/path:/etc", "host").is_err());
        assert!(validate_container_path("/home/rstudio").is_ok());
        assert!(validate_container_path("home/rstudio").is_err());
    }

    #[test]
    fn test_validate_resource_value() {
        assert!(validate_resource_value("memory", "16g").is_ok());
        assert!(validate_resource_value("cpus", "2.0").is_ok());
        assert!(validate_resource_value("memory", "").is_err());
        assert!(validate_resource_value("memory", "16g --privileged").is_err());
    }

    #[test]
    fn launch_spec_validate_rejects_bad_fields() {
        let spec = LaunchSpec::new("rstudio-alice-0a1b2c3d", "rocker/rstudio:latest")
            .env("PASSWORD", "secret")
            .volume("/srv/data/alice", "/home/rstudio")
            .memory("16g")
            .cpus("2.0");
        assert!(spec.validate().is_ok());

        let bad_name = LaunchSpec::new("bad;name", "rocker/rstudio:latest");
        assert!(bad_name.validate().is_err());

        let bad_env = LaunchSpec::new("ok", "rocker/rstudio:latest").env("BAD-KEY", "x");
        assert!(bad_env.validate().is_err());
    }

    #[test]
    fn launch_spec_debug_hides_env_values() {
        let spec = LaunchSpec::new("rstudio-alice-0a1b2c3d", "rocker/rstudio:latest")
            .env("PASSWORD", "hunter2-super-secret");
        let rendered = format!("{spec:?}");
        assert!(rendered.contains("PASSWORD"));
        assert!(!rendered.contains("hunter2-super-secret"));
    }

    #[test]
    fn blank_storage_limit_is_dropped() {
        let spec = LaunchSpec::new("n", "img").storage_limit(Some("  "));
        assert!(spec.storage_limit.is_none());
        let spec = LaunchSpec::new("n", "img").storage_limit(Some("200G"));
        assert_eq!(spec.storage_limit.as_deref(), Some("200G"));
    }
}
