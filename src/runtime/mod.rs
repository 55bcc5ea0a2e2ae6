//! Sandboxed execution containers for worker agents.
//!
//! [`ContainerRuntime`] abstracts the container engine so the scheduler can
//! be driven by a [`MockRuntime`] in tests. The real implementation,
//! [`DockerRuntime`], talks to the Docker daemon over its unix socket via
//! bollard.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::errors::RuntimeError;

/// Prefix for every worker container name; used to find and reap strays.
pub const CONTAINER_PREFIX: &str = "shipyard-worker-";

/// One bind mount of the container filesystem.
#[derive(Debug, Clone)]
pub struct Bind {
    pub host: String,
    pub container: String,
    pub read_only: bool,
}

impl Bind {
    pub fn rw(host: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }

    pub fn ro(host: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }

    fn render(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", self.host, self.container, mode)
    }
}

/// Everything needed to launch one worker container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub binds: Vec<Bind>,
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container; a leftover container with the same name
    /// is force-removed first.
    async fn start(&self, spec: ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    /// Block until the container exits; returns the exit code. Cancellable.
    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError>;

    /// SIGTERM, then SIGKILL after `grace`.
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError>;

    /// Follow the container's combined stdout/stderr as raw bytes.
    async fn logs(&self, handle: &ContainerHandle)
        -> Result<BoxStream<'static, Vec<u8>>, RuntimeError>;

    /// Names of running containers whose name starts with `prefix`.
    async fn list_alive(&self, prefix: &str) -> Result<Vec<String>, RuntimeError>;

    /// Force-remove containers (any state) whose name starts with `prefix`.
    /// Returns how many were removed.
    async fn remove_stale(&self, prefix: &str) -> Result<usize, RuntimeError>;
}

// ── Docker implementation ─────────────────────────────────────────────

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect via the unix socket and verify the daemon answers. Returns
    /// None when Docker is unavailable so the caller can refuse to start.
    pub async fn connect() -> Option<Self> {
        let docker = Docker::connect_with_socket_defaults().ok()?;
        if docker.ping().await.is_err() {
            return None;
        }
        Some(Self { docker })
    }

    pub async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn force_remove(&self, name: &str) {
        let _ = self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, spec: ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        self.force_remove(&spec.name).await;

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let binds: Vec<String> = spec.binds.iter().map(Bind::render).collect();

        let host_config = HostConfig {
            binds: Some(binds),
            auto_remove: Some(true),
            memory: spec.memory_bytes,
            nano_cpus: spec.nano_cpus,
            // Lets the container reach the engine's callback URL from inside
            // the bridge network.
            extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| RuntimeError::StartFailed {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;

        self.docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::StartFailed {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;

        Ok(ContainerHandle {
            id: created.id,
            name: spec.name,
        })
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        let mut stream = self
            .docker
            .wait_container(&handle.name, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Container already gone (auto-remove raced the wait): treat as a
            // clean exit, the status callback is authoritative anyway.
            Some(Err(e)) if is_not_found(&e) => Ok(0),
            Some(Err(e)) => Err(RuntimeError::Other(anyhow::anyhow!(
                "wait for {} failed: {}",
                handle.name,
                e
            ))),
            None => Ok(0),
        }
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError> {
        let result = self
            .docker
            .stop_container(
                &handle.name,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(RuntimeError::Other(anyhow::anyhow!(
                "stop {} failed: {}",
                handle.name,
                e
            ))),
        }
    }

    async fn logs(
        &self,
        handle: &ContainerHandle,
    ) -> Result<BoxStream<'static, Vec<u8>>, RuntimeError> {
        let stream = self
            .docker
            .logs(
                &handle.name,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            )
            .filter_map(|item| async move {
                match item {
                    Ok(output) => Some(output.into_bytes().to_vec()),
                    Err(_) => None,
                }
            });
        Ok(stream.boxed())
    }

    async fn list_alive(&self, prefix: &str) -> Result<Vec<String>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![prefix.to_string()]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| RuntimeError::Other(anyhow::anyhow!("list containers: {}", e)))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| c.names)
            .flatten()
            .map(|n| n.trim_start_matches('/').to_string())
            .filter(|n| n.starts_with(prefix))
            .collect())
    }

    async fn remove_stale(&self, prefix: &str) -> Result<usize, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![prefix.to_string()]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| RuntimeError::Other(anyhow::anyhow!("list containers: {}", e)))?;

        let mut removed = 0;
        for container in containers {
            let Some(name) = container
                .names
                .into_iter()
                .flatten()
                .map(|n| n.trim_start_matches('/').to_string())
                .find(|n| n.starts_with(prefix))
            else {
                continue;
            };
            eprintln!("[runtime] removing stale container {}", name);
            self.force_remove(&name).await;
            removed += 1;
        }
        Ok(removed)
    }
}

// ── Test double ───────────────────────────────────────────────────────

/// Scripted runtime for scheduler and supervisor tests. Exit codes are
/// consumed in start order; log bytes can be staged per container name.
#[derive(Default)]
pub struct MockRuntime {
    exit_codes: std::sync::Mutex<std::collections::VecDeque<i64>>,
    logs: std::sync::Mutex<HashMap<String, Vec<u8>>>,
    pub started: std::sync::Mutex<Vec<ContainerSpec>>,
    pub stopped: std::sync::Mutex<Vec<String>>,
    fail_next_start: std::sync::Mutex<u32>,
    wait_delay: std::sync::Mutex<Duration>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_exit_code(&self, code: i64) {
        self.exit_codes.lock().unwrap().push_back(code);
    }

    pub fn stage_logs(&self, name: &str, bytes: Vec<u8>) {
        self.logs.lock().unwrap().insert(name.to_string(), bytes);
    }

    pub fn fail_next_starts(&self, count: u32) {
        *self.fail_next_start.lock().unwrap() = count;
    }

    pub fn set_wait_delay(&self, delay: Duration) {
        *self.wait_delay.lock().unwrap() = delay;
    }

    pub fn started_names(&self) -> Vec<String> {
        self.started.lock().unwrap().iter().map(|s| s.name.clone()).collect()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn start(&self, spec: ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        {
            let mut failures = self.fail_next_start.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(RuntimeError::StartFailed {
                    name: spec.name.clone(),
                    reason: "mock start failure".to_string(),
                });
            }
        }
        let handle = ContainerHandle {
            id: format!("mock-{}", spec.name),
            name: spec.name.clone(),
        };
        self.started.lock().unwrap().push(spec);
        Ok(handle)
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        let delay = *self.wait_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let _ = handle;
        Ok(self.exit_codes.lock().unwrap().pop_front().unwrap_or(0))
    }

    async fn stop(&self, handle: &ContainerHandle, _grace: Duration) -> Result<(), RuntimeError> {
        self.stopped.lock().unwrap().push(handle.name.clone());
        Ok(())
    }

    async fn logs(
        &self,
        handle: &ContainerHandle,
    ) -> Result<BoxStream<'static, Vec<u8>>, RuntimeError> {
        let bytes = self
            .logs
            .lock()
            .unwrap()
            .get(&handle.name)
            .cloned()
            .unwrap_or_default();
        Ok(futures_util::stream::iter(vec![bytes]).boxed())
    }

    async fn list_alive(&self, _prefix: &str) -> Result<Vec<String>, RuntimeError> {
        Ok(Vec::new())
    }

    async fn remove_stale(&self, _prefix: &str) -> Result<usize, RuntimeError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "shipyard-worker:latest".to_string(),
            env: vec![("TASK_ID".to_string(), "t-000001".to_string())],
            binds: vec![
                Bind::rw("/data/wt", "/workspace"),
                Bind::ro("/data/wt/.git", "/workspace/.git"),
            ],
            memory_bytes: None,
            nano_cpus: None,
        }
    }

    #[test]
    fn test_bind_render() {
        assert_eq!(Bind::rw("/a", "/b").render(), "/a:/b:rw");
        assert_eq!(Bind::ro("/a/.git", "/b/.git").render(), "/a/.git:/b/.git:ro");
    }

    #[tokio::test]
    async fn test_mock_runtime_scripted_exits() {
        let runtime = MockRuntime::new();
        runtime.push_exit_code(0);
        runtime.push_exit_code(2);

        let h1 = runtime.start(spec("shipyard-worker-worker-1-t-000001")).await.unwrap();
        let h2 = runtime.start(spec("shipyard-worker-worker-2-t-000002")).await.unwrap();
        assert_eq!(runtime.wait(&h1).await.unwrap(), 0);
        assert_eq!(runtime.wait(&h2).await.unwrap(), 2);
        // Exhausted script defaults to success.
        assert_eq!(runtime.wait(&h1).await.unwrap(), 0);
        assert_eq!(runtime.started_names().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_runtime_start_failures() {
        let runtime = MockRuntime::new();
        runtime.fail_next_starts(1);
        let err = runtime.start(spec("c1")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::StartFailed { .. }));
        // Second attempt succeeds, mirroring the engine's one retry.
        assert!(runtime.start(spec("c1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_runtime_logs_stream() {
        let runtime = MockRuntime::new();
        runtime.stage_logs("c1", b"{\"type\":\"result\",\"num_turns\":1}\n".to_vec());
        let handle = runtime.start(spec("c1")).await.unwrap();
        let mut stream = runtime.logs(&handle).await.unwrap();
        let chunk = stream.next().await.unwrap();
        assert!(chunk.starts_with(b"{\"type\":\"result\""));
    }

    #[tokio::test]
    async fn test_mock_runtime_stop_records() {
        let runtime = MockRuntime::new();
        let handle = runtime.start(spec("c9")).await.unwrap();
        runtime.stop(&handle, Duration::from_secs(15)).await.unwrap();
        assert_eq!(runtime.stopped.lock().unwrap().as_slice(), ["c9"]);
    }
}
