//! Per-family launch settings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::models::{ResourceEnvelope, SessionFamily};
use super::ports::PortRange;
use crate::workspace::WorkspaceOwner;

/// How sessions of one family are launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyProfile {
    pub image: String,
    pub port_min: u16,
    pub port_max: u16,
    /// Port the service listens on inside the container.
    pub container_port: u16,
    pub memory: String,
    pub cpus: String,
    #[serde(default)]
    pub storage_limit: Option<String>,
    pub lifetime_days: i64,
    /// Where the workspace is mounted inside the container.
    pub mount_path: String,
    /// Environment variable that receives the access secret.
    pub secret_env: String,
    /// Owner the workspace is chowned to, matching the container's user.
    #[serde(default)]
    pub container_uid: Option<u32>,
    #[serde(default)]
    pub container_gid: Option<u32>,
    /// Additional environment passed to every container of this family.
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
}

impl FamilyProfile {
    pub fn rstudio() -> Self {
        Self {
            image: "rocker/rstudio:latest".to_string(),
            port_min: 9002,
            port_max: 9050,
            container_port: 8787,
            memory: "16g".to_string(),
            cpus: "2.0".to_string(),
            storage_limit: Some("200G".to_string()),
            lifetime_days: 7,
            mount_path: "/home/rstudio".to_string(),
            secret_env: "PASSWORD".to_string(),
            container_uid: Some(1000),
            container_gid: Some(1000),
            extra_env: BTreeMap::from([("USER".to_string(), "rstudio".to_string())]),
        }
    }

    pub fn jupyter() -> Self {
        Self {
            image: "jupyter/datascience-notebook:latest".to_string(),
            port_min: 9051,
            port_max: 9100,
            container_port: 8888,
            memory: "16g".to_string(),
            cpus: "2.0".to_string(),
            storage_limit: None,
            lifetime_days: 7,
            mount_path: "/home/jovyan/work".to_string(),
            secret_env: "JUPYTER_TOKEN".to_string(),
            container_uid: Some(1000),
            container_gid: Some(100),
            extra_env: BTreeMap::new(),
        }
    }

    pub fn defaults_for(family: SessionFamily) -> Self {
        match family {
            SessionFamily::Rstudio => Self::rstudio(),
            SessionFamily::Jupyter => Self::jupyter(),
        }
    }

    pub fn port_range(&self) -> PortRange {
        PortRange::new(self.port_min, self.port_max)
    }

    pub fn owner(&self) -> Option<WorkspaceOwner> {
        match (self.container_uid, self.container_gid) {
            (Some(uid), Some(gid)) => Some(WorkspaceOwner { uid, gid }),
            (Some(uid), None) => Some(WorkspaceOwner { uid, gid: uid }),
            _ => None,
        }
    }

    /// Envelope for a new session with the given lifetime.
    pub fn envelope(&self, lifetime_days: i64) -> ResourceEnvelope {
        ResourceEnvelope {
            memory_limit: self.memory.clone(),
            cpu_limit: self.cpus.clone(),
            storage_limit: self
                .storage_limit
                .clone()
                .filter(|limit| !limit.trim().is_empty()),
            lifetime_days,
        }
    }

    /// Check the settings are usable.
    pub fn validate(&self, family: SessionFamily) -> Result<(), String> {
        if self.port_min > self.port_max {
            return Err(format!(
                "{} port range {}-{} is empty",
                family, self.port_min, self.port_max
            ));
        }
        if self.lifetime_days < 1 {
            return Err(format!("{} lifetime_days must be at least 1", family));
        }
        if !self.mount_path.starts_with('/') {
            return Err(format!("{} mount_path must be absolute", family));
        }
        if self.secret_env.is_empty() {
            return Err(format!("{} secret_env must not be empty", family));
        }
        Ok(())
    }
}

/// Profiles for every family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyProfiles {
    pub rstudio: FamilyProfile,
    pub jupyter: FamilyProfile,
}

impl Default for FamilyProfiles {
    fn default() -> Self {
        Self {
            rstudio: FamilyProfile::rstudio(),
            jupyter: FamilyProfile::jupyter(),
        }
    }
}

impl FamilyProfiles {
    pub fn get(&self, family: SessionFamily) -> &FamilyProfile {
        match family {
            SessionFamily::Rstudio => &self.rstudio,
            SessionFamily::Jupyter => &self.jupyter,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for family in SessionFamily::ALL {
            self.get(family).validate(family)?;
        }
        let (r, j) = (self.rstudio.port_range(), self.jupyter.port_range());
        if r.min <= j.max && j.min <= r.max {
            log::warn!(
                "rstudio ports {} overlap jupyter ports {}; families will compete for ports",
                r,
                j
            );
        }
        Ok(())
    }
}
