//! Container backend adapter.
//!
//! A narrow capability interface over the local container runtime, plus a
//! mock implementation for tests and development and a thin HTTP client
//! for a real backend. Only `Unreachable` errors are considered transient.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use hive_cell_api::{Resources, RootFs};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::model::{
    Container, ContainerState, ExitResult, Tags, HEALTHCHECK_TAG, HEALTHCHECK_TAG_VALUE,
};

/// Backend errors, by retry class.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Network or transport failure; the only class retried automatically.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unreachable(_))
    }
}

/// Raw node capacity as the backend reports it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackendCapacity {
    pub memory_in_bytes: u64,
    pub disk_in_bytes: u64,
    pub max_containers: u64,
}

impl BackendCapacity {
    pub fn to_resources(&self) -> Resources {
        Resources {
            memory_mb: self.memory_in_bytes / (1024 * 1024),
            disk_mb: self.disk_in_bytes / (1024 * 1024),
            containers: self.max_containers,
        }
    }
}

/// Tag-based container selection.
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    /// Containers must carry every tag in this map.
    pub tags: Tags,
    /// Drop healthcheck-tagged containers from the result. Everything
    /// except the watchdog filters them out.
    pub exclude_healthcheck: bool,
}

impl ContainerFilter {
    /// All workload containers, healthchecks excluded.
    pub fn workloads() -> Self {
        Self {
            tags: Tags::new(),
            exclude_healthcheck: true,
        }
    }

    /// Only the watchdog's probe containers.
    pub fn healthchecks() -> Self {
        let mut tags = Tags::new();
        tags.insert(
            HEALTHCHECK_TAG.to_string(),
            HEALTHCHECK_TAG_VALUE.to_string(),
        );
        Self {
            tags,
            exclude_healthcheck: false,
        }
    }

    pub fn matches(&self, container: &Container) -> bool {
        if self.exclude_healthcheck && container.is_healthcheck() {
            return false;
        }
        self.tags
            .iter()
            .all(|(k, v)| container.tags.get(k) == Some(v))
    }
}

/// Specification for a new container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub handle: String,
    pub tags: Tags,
    pub rootfs: RootFs,
    pub resources: Resources,
}

/// A process to run inside a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Batched per-container detail.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub state: ContainerState,
    pub exit_result: Option<ExitResult>,
}

/// Capability interface over the container runtime.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> Result<(), BackendError>;

    /// Total node capacity.
    async fn capacity(&self) -> Result<BackendCapacity, BackendError>;

    async fn list(&self, filter: ContainerFilter) -> Result<Vec<Container>, BackendError>;

    /// Batched read, amortising round-trips. Unknown handles are omitted.
    async fn bulk_info(
        &self,
        handles: &[String],
    ) -> Result<HashMap<String, ContainerInfo>, BackendError>;

    async fn create(&self, spec: ContainerSpec) -> Result<String, BackendError>;

    async fn destroy(&self, handle: &str) -> Result<(), BackendError>;

    /// Run a process to completion, returning its exit code.
    async fn run(&self, handle: &str, process: ProcessSpec) -> Result<i32, BackendError>;
}

// =============================================================================
// Mock backend
// =============================================================================

#[derive(Default)]
struct MockInner {
    containers: HashMap<String, Container>,
    capacity: Option<BackendCapacity>,
    unreachable: bool,
    fail_creates: bool,
    hang_destroys: bool,
    hang_lists: bool,
    run_exit_code: i32,
    destroyed: Vec<String>,
}

/// In-memory backend for tests and development.
pub struct MockBackend {
    inner: Mutex<MockInner>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockInner {
                capacity: Some(BackendCapacity {
                    memory_in_bytes: 1024 * 1024 * 1024,
                    disk_in_bytes: 2048 * 1024 * 1024,
                    max_containers: 4,
                }),
                ..MockInner::default()
            }),
        }
    }

    pub fn set_capacity(&self, capacity: BackendCapacity) {
        self.inner.lock().unwrap().capacity = Some(capacity);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unwrap().unreachable = unreachable;
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.inner.lock().unwrap().fail_creates = fail;
    }

    /// Make every destroy block forever, simulating a wedged runtime.
    pub fn set_hang_destroys(&self, hang: bool) {
        self.inner.lock().unwrap().hang_destroys = hang;
    }

    /// Make every list block forever, simulating a slow runtime.
    pub fn set_hang_lists(&self, hang: bool) {
        self.inner.lock().unwrap().hang_lists = hang;
    }

    pub fn set_run_exit_code(&self, code: i32) {
        self.inner.lock().unwrap().run_exit_code = code;
    }

    /// Place a container directly, as if it predated the agent.
    pub fn seed_container(&self, handle: &str, tags: Tags, resources: Resources) {
        self.inner.lock().unwrap().containers.insert(
            handle.to_string(),
            Container {
                handle: handle.to_string(),
                tags,
                resources,
                state: ContainerState::Running,
                exit_result: None,
            },
        );
    }

    /// Mark a container's main process as exited.
    pub fn finish_container(&self, handle: &str, exit_code: i32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(container) = inner.containers.get_mut(handle) {
            container.state = ContainerState::Stopped;
            container.exit_result = Some(ExitResult { exit_code });
        }
    }

    /// Handles destroyed so far, in order.
    pub fn destroyed(&self) -> Vec<String> {
        self.inner.lock().unwrap().destroyed.clone()
    }

    pub fn handles(&self) -> Vec<String> {
        self.inner.lock().unwrap().containers.keys().cloned().collect()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerBackend for MockBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        let inner = self.inner.lock().unwrap();
        if inner.unreachable {
            return Err(BackendError::Unreachable("mock is down".to_string()));
        }
        Ok(())
    }

    async fn capacity(&self) -> Result<BackendCapacity, BackendError> {
        let inner = self.inner.lock().unwrap();
        if inner.unreachable {
            return Err(BackendError::Unreachable("mock is down".to_string()));
        }
        inner
            .capacity
            .ok_or_else(|| BackendError::Backend("no capacity configured".to_string()))
    }

    async fn list(&self, filter: ContainerFilter) -> Result<Vec<Container>, BackendError> {
        let hang = {
            let inner = self.inner.lock().unwrap();
            if inner.unreachable {
                return Err(BackendError::Unreachable("mock is down".to_string()));
            }
            inner.hang_lists
        };
        if hang {
            std::future::pending::<()>().await;
        }
        let inner = self.inner.lock().unwrap();
        let mut containers: Vec<Container> = inner
            .containers
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        containers.sort_by(|a, b| a.handle.cmp(&b.handle));
        Ok(containers)
    }

    async fn bulk_info(
        &self,
        handles: &[String],
    ) -> Result<HashMap<String, ContainerInfo>, BackendError> {
        let inner = self.inner.lock().unwrap();
        if inner.unreachable {
            return Err(BackendError::Unreachable("mock is down".to_string()));
        }
        let mut infos = HashMap::new();
        for handle in handles {
            if let Some(container) = inner.containers.get(handle) {
                infos.insert(
                    handle.clone(),
                    ContainerInfo {
                        state: container.state,
                        exit_result: container.exit_result,
                    },
                );
            }
        }
        Ok(infos)
    }

    async fn create(&self, spec: ContainerSpec) -> Result<String, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unreachable {
            return Err(BackendError::Unreachable("mock is down".to_string()));
        }
        if inner.fail_creates {
            return Err(BackendError::Backend("mock create failure".to_string()));
        }
        if inner.containers.contains_key(&spec.handle) {
            return Err(BackendError::Conflict(spec.handle));
        }
        debug!(handle = %spec.handle, "mock create");
        inner.containers.insert(
            spec.handle.clone(),
            Container {
                handle: spec.handle.clone(),
                tags: spec.tags,
                resources: spec.resources,
                state: ContainerState::Created,
                exit_result: None,
            },
        );
        Ok(spec.handle)
    }

    async fn destroy(&self, handle: &str) -> Result<(), BackendError> {
        let hang = {
            let inner = self.inner.lock().unwrap();
            if inner.unreachable {
                return Err(BackendError::Unreachable("mock is down".to_string()));
            }
            inner.hang_destroys
        };
        if hang {
            std::future::pending::<()>().await;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.containers.remove(handle).is_none() {
            return Err(BackendError::NotFound(handle.to_string()));
        }
        debug!(handle = %handle, "mock destroy");
        inner.destroyed.push(handle.to_string());
        Ok(())
    }

    async fn run(&self, handle: &str, _process: ProcessSpec) -> Result<i32, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unreachable {
            return Err(BackendError::Unreachable("mock is down".to_string()));
        }
        match inner.containers.get_mut(handle) {
            Some(container) => {
                container.state = ContainerState::Running;
                Ok(inner.run_exit_code)
            }
            None => Err(BackendError::NotFound(handle.to_string())),
        }
    }
}

// =============================================================================
// Thin HTTP backend client
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct ContainerJson {
    handle: String,
    #[serde(default)]
    tags: Tags,
    #[serde(default)]
    resources: Resources,
    state: String,
    #[serde(default)]
    exit_code: Option<i32>,
}

impl ContainerJson {
    fn into_container(self) -> Container {
        Container {
            handle: self.handle,
            tags: self.tags,
            resources: self.resources,
            state: parse_state(&self.state),
            exit_result: self.exit_code.map(|exit_code| ExitResult { exit_code }),
        }
    }
}

fn parse_state(s: &str) -> ContainerState {
    match s {
        "created" => ContainerState::Created,
        "stopped" => ContainerState::Stopped,
        _ => ContainerState::Running,
    }
}

/// HTTP client for a real container backend. Glue only: every capability
/// maps onto one endpoint.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn classify(err: reqwest::Error) -> BackendError {
    if err.is_connect() || err.is_timeout() {
        BackendError::Unreachable(err.to_string())
    } else {
        BackendError::Backend(err.to_string())
    }
}

fn classify_status(status: reqwest::StatusCode, context: &str) -> BackendError {
    match status {
        reqwest::StatusCode::NOT_FOUND => BackendError::NotFound(context.to_string()),
        reqwest::StatusCode::CONFLICT => BackendError::Conflict(context.to_string()),
        _ => BackendError::Backend(format!("{context}: status {status}")),
    }
}

#[async_trait]
impl ContainerBackend for HttpBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        let response = self
            .client
            .get(self.url("/ping"))
            .send()
            .await
            .map_err(classify)?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), "ping"));
        }
        Ok(())
    }

    async fn capacity(&self) -> Result<BackendCapacity, BackendError> {
        let response = self
            .client
            .get(self.url("/capacity"))
            .send()
            .await
            .map_err(classify)?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), "capacity"));
        }
        response.json().await.map_err(classify)
    }

    async fn list(&self, filter: ContainerFilter) -> Result<Vec<Container>, BackendError> {
        let mut request = self.client.get(self.url("/containers"));
        for (k, v) in &filter.tags {
            request = request.query(&[(k.as_str(), v.as_str())]);
        }
        let response = request.send().await.map_err(classify)?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), "list"));
        }
        let containers: Vec<ContainerJson> = response.json().await.map_err(classify)?;
        Ok(containers
            .into_iter()
            .map(ContainerJson::into_container)
            .filter(|c| !(filter.exclude_healthcheck && c.is_healthcheck()))
            .collect())
    }

    async fn bulk_info(
        &self,
        handles: &[String],
    ) -> Result<HashMap<String, ContainerInfo>, BackendError> {
        let response = self
            .client
            .get(self.url("/containers/bulk_info"))
            .query(&[("handles", handles.join(","))])
            .send()
            .await
            .map_err(classify)?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), "bulk_info"));
        }
        let raw: HashMap<String, ContainerJson> = response.json().await.map_err(classify)?;
        Ok(raw
            .into_iter()
            .map(|(handle, json)| {
                let container = json.into_container();
                (
                    handle,
                    ContainerInfo {
                        state: container.state,
                        exit_result: container.exit_result,
                    },
                )
            })
            .collect())
    }

    async fn create(&self, spec: ContainerSpec) -> Result<String, BackendError> {
        let response = self
            .client
            .post(self.url("/containers"))
            .json(&spec)
            .send()
            .await
            .map_err(classify)?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), &spec.handle));
        }
        #[derive(Deserialize)]
        struct CreateResponse {
            handle: String,
        }
        let body: CreateResponse = response.json().await.map_err(classify)?;
        Ok(body.handle)
    }

    async fn destroy(&self, handle: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .delete(self.url(&format!("/containers/{handle}")))
            .send()
            .await
            .map_err(classify)?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), handle));
        }
        Ok(())
    }

    async fn run(&self, handle: &str, process: ProcessSpec) -> Result<i32, BackendError> {
        let response = self
            .client
            .post(self.url(&format!("/containers/{handle}/processes")))
            .json(&process)
            .send()
            .await
            .map_err(classify)?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), handle));
        }
        #[derive(Deserialize)]
        struct RunResponse {
            exit_code: i32,
        }
        let body: RunResponse = response.json().await.map_err(classify)?;
        Ok(body.exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_converts_to_mb() {
        let capacity = BackendCapacity {
            memory_in_bytes: 1024 * 1024 * 1024,
            disk_in_bytes: 2048 * 1024 * 1024,
            max_containers: 4,
        };
        assert_eq!(capacity.to_resources(), Resources::new(1024, 2048, 4));
    }

    #[tokio::test]
    async fn workload_filter_excludes_healthchecks() {
        let backend = MockBackend::new();
        backend.seed_container("app-1", Tags::new(), Resources::new(10, 10, 1));
        let mut hc_tags = Tags::new();
        hc_tags.insert(
            HEALTHCHECK_TAG.to_string(),
            HEALTHCHECK_TAG_VALUE.to_string(),
        );
        backend.seed_container("executor-healthcheck-1", hc_tags, Resources::ZERO);

        let workloads = backend.list(ContainerFilter::workloads()).await.unwrap();
        assert_eq!(workloads.len(), 1);
        assert_eq!(workloads[0].handle, "app-1");

        let healthchecks = backend.list(ContainerFilter::healthchecks()).await.unwrap();
        assert_eq!(healthchecks.len(), 1);
        assert_eq!(healthchecks[0].handle, "executor-healthcheck-1");
    }

    #[tokio::test]
    async fn unreachable_is_the_only_retryable_class() {
        let backend = MockBackend::new();
        backend.set_unreachable(true);
        let err = backend.ping().await.unwrap_err();
        assert!(err.is_retryable());

        backend.set_unreachable(false);
        let err = backend.destroy("missing").await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn create_then_destroy_round_trip() {
        let backend = MockBackend::new();
        let handle = backend
            .create(ContainerSpec {
                handle: "c-1".to_string(),
                tags: Tags::new(),
                rootfs: RootFs::new("preloaded:trusty"),
                resources: Resources::new(10, 10, 1),
            })
            .await
            .unwrap();
        assert_eq!(handle, "c-1");

        let err = backend
            .create(ContainerSpec {
                handle: "c-1".to_string(),
                tags: Tags::new(),
                rootfs: RootFs::new("preloaded:trusty"),
                resources: Resources::new(10, 10, 1),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Conflict(_)));

        backend.destroy("c-1").await.unwrap();
        assert_eq!(backend.destroyed(), vec!["c-1".to_string()]);
    }
}
