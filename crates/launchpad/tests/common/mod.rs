//! Test utilities and common setup.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;

use launchpad::container::{
    ContainerError, ContainerResult, ContainerRuntimeApi, LaunchSpec, StopOutcome,
};
use launchpad::db::Database;
use launchpad::session::{SessionService, SessionServiceConfig, SessionStore};
use launchpad::user::{User, UserRepository};
use launchpad::workspace::WorkspaceProvisioner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchBehaviour {
    Succeed,
    /// Fails with a diagnostic that echoes the container's environment.
    Fail,
    Hang,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBehaviour {
    Succeed,
    NotFound,
    Fail,
}

/// In-memory stand-in for docker/podman.
#[derive(Debug)]
pub struct FakeRuntime {
    launch_behaviour: Mutex<LaunchBehaviour>,
    stop_behaviour: Mutex<StopBehaviour>,
    /// Container names whose stop fails regardless of `stop_behaviour`.
    failing_stops: Mutex<HashSet<String>>,
    launches: Mutex<Vec<LaunchSpec>>,
    stops: Mutex<Vec<String>>,
    counter: AtomicUsize,
    /// Closed while the next launch is in flight, so the store write after it fails.
    close_on_launch: Mutex<Option<SqlitePool>>,
    /// Closed while the next stop is in flight.
    close_on_stop: Mutex<Option<SqlitePool>>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            launch_behaviour: Mutex::new(LaunchBehaviour::Succeed),
            stop_behaviour: Mutex::new(StopBehaviour::Succeed),
            failing_stops: Mutex::new(HashSet::new()),
            launches: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
            close_on_launch: Mutex::new(None),
            close_on_stop: Mutex::new(None),
        }
    }
}

impl FakeRuntime {
    pub fn set_launch(&self, behaviour: LaunchBehaviour) {
        *self.launch_behaviour.lock().unwrap() = behaviour;
    }

    pub fn set_stop(&self, behaviour: StopBehaviour) {
        *self.stop_behaviour.lock().unwrap() = behaviour;
    }

    pub fn fail_stop_of(&self, container_name: &str) {
        self.failing_stops
            .lock()
            .unwrap()
            .insert(container_name.to_string());
    }

    pub fn clear_stop_failures(&self) {
        self.failing_stops.lock().unwrap().clear();
    }

    pub fn close_pool_during_launch(&self, pool: SqlitePool) {
        *self.close_on_launch.lock().unwrap() = Some(pool);
    }

    pub fn close_pool_during_stop(&self, pool: SqlitePool) {
        *self.close_on_stop.lock().unwrap() = Some(pool);
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().unwrap().clone()
    }

    pub fn stops(&self) -> Vec<String> {
        self.stops.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> ContainerResult<String> {
        self.launches.lock().unwrap().push(spec.clone());
        let pool = self.close_on_launch.lock().unwrap().take();
        if let Some(pool) = pool {
            pool.close().await;
        }
        let behaviour = *self.launch_behaviour.lock().unwrap();
        match behaviour {
            LaunchBehaviour::Succeed => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(format!("{:064x}", n))
            }
            LaunchBehaviour::Fail => {
                let env: Vec<String> = spec
                    .env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                let mounts: Vec<String> = spec.volumes.iter().map(|(h, _)| h.clone()).collect();
                Err(ContainerError::CommandFailed {
                    command: "run".to_string(),
                    exit_code: Some(125),
                    message: format!(
                        "image pull failed for {} with {} mounting {}",
                        spec.image,
                        env.join(" "),
                        mounts.join(",")
                    ),
                })
            }
            LaunchBehaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok("late".to_string())
            }
        }
    }

    async fn stop(&self, name: &str, _grace_seconds: Option<u32>) -> ContainerResult<StopOutcome> {
        self.stops.lock().unwrap().push(name.to_string());
        let pool = self.close_on_stop.lock().unwrap().take();
        if let Some(pool) = pool {
            pool.close().await;
        }
        if self.failing_stops.lock().unwrap().contains(name) {
            return Err(ContainerError::CommandFailed {
                command: "stop".to_string(),
                exit_code: Some(1),
                message: format!("cannot stop container {}: device busy", name),
            });
        }
        let behaviour = *self.stop_behaviour.lock().unwrap();
        match behaviour {
            StopBehaviour::Succeed => Ok(StopOutcome::Stopped),
            StopBehaviour::NotFound => Ok(StopOutcome::NotFound),
            StopBehaviour::Fail => Err(ContainerError::CommandFailed {
                command: "stop".to_string(),
                exit_code: Some(1),
                message: "daemon refused".to_string(),
            }),
        }
    }
}

/// Service configuration used by the integration tests.
///
/// Workspaces are not chowned and runtime calls are bounded tightly.
pub fn test_config() -> SessionServiceConfig {
    let mut config = SessionServiceConfig {
        runtime_timeout: Duration::from_millis(200),
        public_host: "lab.example.org".to_string(),
        ..SessionServiceConfig::default()
    };
    for profile in [&mut config.families.rstudio, &mut config.families.jupyter] {
        profile.container_uid = None;
        profile.container_gid = None;
    }
    config
}

pub struct Harness {
    pub service: Arc<SessionService>,
    pub runtime: Arc<FakeRuntime>,
    pub users: UserRepository,
    pub store: SessionStore,
    pub db: Database,
    pub workspace_root: TempDir,
}

impl Harness {
    pub async fn new(config: SessionServiceConfig) -> Self {
        let workspace_root = tempfile::tempdir().unwrap();
        let workspaces = WorkspaceProvisioner::new(workspace_root.path().join("users"), None);
        Self::with_workspaces(config, workspaces, workspace_root).await
    }

    pub async fn with_workspaces(
        config: SessionServiceConfig,
        workspaces: WorkspaceProvisioner,
        workspace_root: TempDir,
    ) -> Self {
        let db = Database::in_memory().await.unwrap();
        let store = SessionStore::new(db.pool().clone());
        let runtime = Arc::new(FakeRuntime::default());
        let runtime_api: Arc<dyn ContainerRuntimeApi> = runtime.clone();
        let service = Arc::new(SessionService::new(
            store.clone(),
            runtime_api,
            workspaces,
            config,
        ));

        Self {
            service,
            runtime,
            users: UserRepository::new(db.pool().clone()),
            store,
            db,
            workspace_root,
        }
    }

    pub async fn user(&self, id: &str, email: &str) -> User {
        self.users.upsert_login(id, email, false).await.unwrap()
    }

    pub async fn admin(&self, id: &str, email: &str) -> User {
        self.users.upsert_login(id, email, true).await.unwrap()
    }
}
