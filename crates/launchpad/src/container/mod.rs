//! Container runtime management module.
//!
//! Drives session containers through the Docker or Podman CLI. The runtime
//! is auto-detected or can be configured explicitly.

mod container;
mod error;

pub use container::{LaunchSpec, PortMapping, StopOutcome};
pub use error::{ContainerError, ContainerResult};

use container::validate_container_name;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Docker,
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether this runtime requires SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        match self {
            RuntimeType::Docker => false,
            RuntimeType::Podman => true,
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.default_binary())
    }
}

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Start a detached container and return its short id.
    async fn launch(&self, spec: &LaunchSpec) -> ContainerResult<String>;

    /// Stop a container by name, waiting at most `grace_seconds` before killing it.
    async fn stop(&self, name: &str, grace_seconds: Option<u32>) -> ContainerResult<StopOutcome>;
}

/// Container runtime client backed by the docker/podman binary.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
    command_timeout: Duration,
}

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Length of the short container id the runtime prints in listings.
pub const SHORT_ID_LEN: usize = 12;

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Docker, falls back to Podman.
    pub fn new() -> Self {
        let runtime_type = if Self::is_binary_available("docker") {
            RuntimeType::Docker
        } else if Self::is_binary_available("podman") {
            RuntimeType::Podman
        } else {
            // Fails at first use with RuntimeUnavailable.
            RuntimeType::Docker
        };
        Self::with_type(runtime_type)
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Bound every runtime invocation by `timeout`.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let output = self.run("version", &["version".to_string()]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure("version", output.status.code(), &stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run the runtime binary with a bounded wait.
    async fn run(&self, command: &str, args: &[String]) -> ContainerResult<Output> {
        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.command_timeout, child).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => Err(
                    ContainerError::RuntimeUnavailable(format!("{}: {}", self.binary, e)),
                ),
                _ => Err(ContainerError::CommandFailed {
                    command: command.to_string(),
                    exit_code: None,
                    message: e.to_string(),
                }),
            },
            Err(_) => Err(ContainerError::Timeout {
                command: command.to_string(),
                seconds: self.command_timeout.as_secs(),
            }),
        }
    }

    /// Create and start a new container.
    ///
    /// The launch spec is validated before anything reaches the command line.
    pub async fn launch(&self, spec: &LaunchSpec) -> ContainerResult<String> {
        spec.validate()?;

        let args = build_run_args(spec, self.runtime_type);
        log::debug!(
            "launching container {} from {} via {}",
            spec.name,
            spec.image,
            self.binary
        );

        let output = self.run("run", &args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure("run", output.status.code(), &stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| ContainerError::CommandFailed {
                command: "run".to_string(),
                exit_code: output.status.code(),
                message: "runtime did not report a container id".to_string(),
            })?;

        Ok(short_id(id))
    }

    /// Stop a container by name.
    pub async fn stop(&self, name: &str, grace_seconds: Option<u32>) -> ContainerResult<StopOutcome> {
        validate_container_name(name)?;

        let mut args = vec!["stop".to_string()];
        if let Some(t) = grace_seconds {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        args.push(name.to_string());

        let output = self.run("stop", &args).await?;
        if output.status.success() {
            return Ok(StopOutcome::Stopped);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if let Some(outcome) = classify_stop_stderr(&stderr) {
            log::debug!("container {} stop reported {}", name, outcome);
            return Ok(outcome);
        }

        Err(classify_failure("stop", output.status.code(), &stderr))
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> ContainerResult<String> {
        self.launch(spec).await
    }

    async fn stop(&self, name: &str, grace_seconds: Option<u32>) -> ContainerResult<StopOutcome> {
        self.stop(name, grace_seconds).await
    }
}

/// Build the `run` argument list for a launch spec.
pub fn build_run_args(spec: &LaunchSpec, runtime_type: RuntimeType) -> Vec<String> {
    let mut args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

    if spec.auto_remove {
        args.push("--rm".to_string());
    }

    args.push("--name".to_string());
    args.push(spec.name.clone());

    if let Some(ref memory) = spec.memory {
        args.push("--memory".to_string());
        args.push(memory.clone());
    }

    if let Some(ref cpus) = spec.cpus {
        args.push("--cpus".to_string());
        args.push(cpus.clone());
    }

    if let Some(ref storage) = spec.storage_limit {
        args.push("--storage-opt".to_string());
        args.push(format!("size={}", storage));
    }

    for port in &spec.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}", port.host_port, port.container_port));
    }

    for (host, container) in &spec.volumes {
        args.push("-v".to_string());
        if runtime_type.needs_selinux_labels() {
            args.push(format!("{}:{}:Z", host, container));
        } else {
            args.push(format!("{}:{}", host, container));
        }
    }

    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(spec.image.clone());
    args
}

/// Truncate a full container id to the short form.
pub fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}

/// Stop failures that still mean the container is gone or going.
fn classify_stop_stderr(stderr: &str) -> Option<StopOutcome> {
    let lower = stderr.to_lowercase();
    if lower.contains("no such container") || lower.contains("no container with name or id") {
        Some(StopOutcome::NotFound)
    } else if lower.contains("already in progress") {
        Some(StopOutcome::InProgress)
    } else {
        None
    }
}

fn classify_failure(command: &str, exit_code: Option<i32>, stderr: &str) -> ContainerError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();

    if lower.contains("is already in use") {
        return ContainerError::NameConflict(message);
    }

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("permission denied while trying to connect")
    {
        return ContainerError::RuntimeUnavailable(message);
    }

    ContainerError::CommandFailed {
        command: command.to_string(),
        exit_code,
        message,
    }
}
