//! Record-store adapter.
//!
//! Narrow interface over the cluster's desired/actual-state database plus
//! the coordination storage that carries cell presence. Writes are
//! idempotent on `{key, cell_id}`; a CAS loss comes back as a typed
//! conflict that callers treat as success-after-loss.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hive_cell_api::{CellPresence, Resources, RootFs};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Record-store errors, by retry class.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store unreachable: {0}")]
    Unreachable(String),

    /// Compare-and-swap loss: another writer got there first. Callers
    /// treat this as success-after-loss.
    #[error("cas conflict: {0}")]
    CasConflict(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unreachable(_))
    }
}

/// Collapse a CAS loss into success; the record is already where another
/// writer wanted it.
pub fn allow_conflict(result: Result<(), StoreError>) -> Result<(), StoreError> {
    match result {
        Err(StoreError::CasConflict(_)) => Ok(()),
        other => other,
    }
}

/// Identity of one LRP instance slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActualLrpKey {
    pub process_guid: String,
    pub index: i32,
}

/// Which cell (and which instance incarnation) holds a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualLrpInstanceKey {
    pub instance_guid: String,
    pub cell_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrpState {
    Unclaimed,
    Claimed,
    Running,
}

/// One actual-LRP record as the store sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActualLrp {
    #[serde(flatten)]
    pub key: ActualLrpKey,
    #[serde(default)]
    pub instance_key: Option<ActualLrpInstanceKey>,
    pub state: LrpState,
    #[serde(default)]
    pub crash_reason: Option<String>,
}

/// The instance record and, during evacuation, the doomed copy kept for
/// routing until a replacement lands elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActualLrpGroup {
    #[serde(default)]
    pub instance: Option<ActualLrp>,
    #[serde(default)]
    pub evacuating: Option<ActualLrp>,
}

#[derive(Debug, Clone, Default)]
pub struct ActualLrpFilter {
    pub cell_id: Option<String>,
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_guid: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub cell_id: Option<String>,
    pub state: TaskState,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub cell_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredLrp {
    pub process_guid: String,
    pub domain: String,
    pub instances: i32,
    pub rootfs: RootFs,
    pub resources: Resources,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_guid: String,
    pub domain: String,
    pub rootfs: RootFs,
    pub resources: Resources,
}

/// Capability interface over cluster state.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn desire_lrp(&self, desired: &DesiredLrp) -> Result<(), StoreError>;

    async fn desire_task(&self, task: &TaskDefinition) -> Result<(), StoreError>;

    async fn cells(&self) -> Result<Vec<CellPresence>, StoreError>;

    async fn actual_lrp_groups(
        &self,
        filter: &ActualLrpFilter,
    ) -> Result<Vec<ActualLrpGroup>, StoreError>;

    async fn tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError>;

    async fn claim_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), StoreError>;

    async fn start_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), StoreError>;

    async fn crash_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        reason: &str,
    ) -> Result<(), StoreError>;

    async fn remove_actual_lrp(&self, key: &ActualLrpKey) -> Result<(), StoreError>;

    async fn start_task(&self, task_guid: &str, cell_id: &str) -> Result<(), StoreError>;

    async fn complete_task(
        &self,
        task_guid: &str,
        cell_id: &str,
        failed: bool,
        failure_reason: &str,
    ) -> Result<(), StoreError>;

    async fn fail_task(&self, task_guid: &str, reason: &str) -> Result<(), StoreError>;

    async fn evacuate_claimed_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), StoreError>;

    async fn evacuate_running_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), StoreError>;

    async fn remove_evacuating_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), StoreError>;

    /// Write this cell's presence lease with a TTL.
    async fn set_cell_presence(
        &self,
        presence: &CellPresence,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Best-effort lease release.
    async fn remove_cell_presence(&self, cell_id: &str) -> Result<(), StoreError>;
}

// =============================================================================
// In-memory record store
// =============================================================================

#[derive(Default)]
struct InMemState {
    desired_lrps: HashMap<String, DesiredLrp>,
    groups: HashMap<(String, i32), ActualLrpGroup>,
    tasks: HashMap<String, TaskRecord>,
    cells: HashMap<String, (CellPresence, Instant)>,
    unreachable: bool,
}

/// In-memory store for tests and development. Backs both the record store
/// and the coordination storage that holds presences.
pub struct InMemoryRecordStore {
    state: Mutex<InMemState>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InMemState::default()),
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    fn check_reachable(state: &InMemState) -> Result<(), StoreError> {
        if state.unreachable {
            Err(StoreError::Unreachable("in-memory store is down".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn desire_lrp(&self, desired: &DesiredLrp) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        state
            .desired_lrps
            .insert(desired.process_guid.clone(), desired.clone());
        Ok(())
    }

    async fn desire_task(&self, task: &TaskDefinition) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        state.tasks.insert(
            task.task_guid.clone(),
            TaskRecord {
                task_guid: task.task_guid.clone(),
                domain: task.domain.clone(),
                cell_id: None,
                state: TaskState::Pending,
                failed: false,
                failure_reason: None,
            },
        );
        Ok(())
    }

    async fn cells(&self) -> Result<Vec<CellPresence>, StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        let now = Instant::now();
        state.cells.retain(|_, (_, deadline)| *deadline > now);
        let mut cells: Vec<CellPresence> =
            state.cells.values().map(|(p, _)| p.clone()).collect();
        cells.sort_by(|a, b| a.cell_id.cmp(&b.cell_id));
        Ok(cells)
    }

    async fn actual_lrp_groups(
        &self,
        filter: &ActualLrpFilter,
    ) -> Result<Vec<ActualLrpGroup>, StoreError> {
        let state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        let matches_cell = |lrp: &Option<ActualLrp>| match (&filter.cell_id, lrp) {
            (None, _) => true,
            (Some(cell_id), Some(lrp)) => lrp
                .instance_key
                .as_ref()
                .map(|k| &k.cell_id == cell_id)
                .unwrap_or(false),
            (Some(_), None) => false,
        };
        let mut groups: Vec<ActualLrpGroup> = state
            .groups
            .values()
            .filter(|g| matches_cell(&g.instance) || matches_cell(&g.evacuating))
            .cloned()
            .collect();
        groups.sort_by(|a, b| {
            let ka = a.instance.as_ref().or(a.evacuating.as_ref()).map(|l| &l.key);
            let kb = b.instance.as_ref().or(b.evacuating.as_ref()).map(|l| &l.key);
            ka.map(|k| (k.process_guid.clone(), k.index))
                .cmp(&kb.map(|k| (k.process_guid.clone(), k.index)))
        });
        Ok(groups)
    }

    async fn tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError> {
        let state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        let mut tasks: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|t| match &filter.cell_id {
                None => true,
                Some(cell_id) => t.cell_id.as_deref() == Some(cell_id.as_str()),
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.task_guid.cmp(&b.task_guid));
        Ok(tasks)
    }

    async fn claim_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        let group = state
            .groups
            .entry((key.process_guid.clone(), key.index))
            .or_default();
        match &group.instance {
            Some(existing)
                if existing.state != LrpState::Unclaimed
                    && existing.instance_key.as_ref() != Some(instance_key) =>
            {
                Err(StoreError::CasConflict(format!(
                    "{}/{} already claimed",
                    key.process_guid, key.index
                )))
            }
            _ => {
                group.instance = Some(ActualLrp {
                    key: key.clone(),
                    instance_key: Some(instance_key.clone()),
                    state: LrpState::Claimed,
                    crash_reason: None,
                });
                Ok(())
            }
        }
    }

    async fn start_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        let group = state
            .groups
            .entry((key.process_guid.clone(), key.index))
            .or_default();
        match &group.instance {
            Some(existing)
                if existing.instance_key.is_some()
                    && existing.instance_key.as_ref() != Some(instance_key) =>
            {
                Err(StoreError::CasConflict(format!(
                    "{}/{} held elsewhere",
                    key.process_guid, key.index
                )))
            }
            _ => {
                group.instance = Some(ActualLrp {
                    key: key.clone(),
                    instance_key: Some(instance_key.clone()),
                    state: LrpState::Running,
                    crash_reason: None,
                });
                Ok(())
            }
        }
    }

    async fn crash_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        reason: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        let group = state
            .groups
            .get_mut(&(key.process_guid.clone(), key.index))
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", key.process_guid, key.index)))?;
        match &group.instance {
            Some(existing) if existing.instance_key.as_ref() == Some(instance_key) => {
                group.instance = Some(ActualLrp {
                    key: key.clone(),
                    instance_key: None,
                    state: LrpState::Unclaimed,
                    crash_reason: Some(reason.to_string()),
                });
                Ok(())
            }
            _ => Err(StoreError::CasConflict(format!(
                "{}/{} not held by {}",
                key.process_guid, key.index, instance_key.cell_id
            ))),
        }
    }

    async fn remove_actual_lrp(&self, key: &ActualLrpKey) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        let entry = (key.process_guid.clone(), key.index);
        let Some(group) = state.groups.get_mut(&entry) else {
            return Err(StoreError::NotFound(format!(
                "{}/{}",
                key.process_guid, key.index
            )));
        };
        group.instance = None;
        if group.evacuating.is_none() {
            state.groups.remove(&entry);
        }
        Ok(())
    }

    async fn start_task(&self, task_guid: &str, cell_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        let task = state
            .tasks
            .get_mut(task_guid)
            .ok_or_else(|| StoreError::NotFound(task_guid.to_string()))?;
        match task.state {
            TaskState::Pending => {
                task.state = TaskState::Running;
                task.cell_id = Some(cell_id.to_string());
                Ok(())
            }
            TaskState::Running if task.cell_id.as_deref() == Some(cell_id) => Ok(()),
            _ => Err(StoreError::CasConflict(task_guid.to_string())),
        }
    }

    async fn complete_task(
        &self,
        task_guid: &str,
        cell_id: &str,
        failed: bool,
        failure_reason: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        let task = state
            .tasks
            .get_mut(task_guid)
            .ok_or_else(|| StoreError::NotFound(task_guid.to_string()))?;
        if task.state == TaskState::Completed {
            return Ok(());
        }
        if task.cell_id.as_deref() != Some(cell_id) {
            return Err(StoreError::CasConflict(task_guid.to_string()));
        }
        task.state = TaskState::Completed;
        task.failed = failed;
        task.failure_reason = if failure_reason.is_empty() {
            None
        } else {
            Some(failure_reason.to_string())
        };
        Ok(())
    }

    async fn fail_task(&self, task_guid: &str, reason: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        let task = state
            .tasks
            .get_mut(task_guid)
            .ok_or_else(|| StoreError::NotFound(task_guid.to_string()))?;
        if task.state == TaskState::Completed {
            return Ok(());
        }
        task.state = TaskState::Completed;
        task.failed = true;
        task.failure_reason = Some(reason.to_string());
        Ok(())
    }

    async fn evacuate_claimed_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        let group = state
            .groups
            .get_mut(&(key.process_guid.clone(), key.index))
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", key.process_guid, key.index)))?;
        match &group.instance {
            Some(existing) if existing.instance_key.as_ref() == Some(instance_key) => {
                group.instance = Some(ActualLrp {
                    key: key.clone(),
                    instance_key: None,
                    state: LrpState::Unclaimed,
                    crash_reason: None,
                });
                Ok(())
            }
            _ => Err(StoreError::CasConflict(format!(
                "{}/{} not held by {}",
                key.process_guid, key.index, instance_key.cell_id
            ))),
        }
    }

    async fn evacuate_running_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        let group = state
            .groups
            .entry((key.process_guid.clone(), key.index))
            .or_default();
        match &group.instance {
            Some(existing)
                if existing.instance_key.is_some()
                    && existing.instance_key.as_ref() != Some(instance_key) =>
            {
                Err(StoreError::CasConflict(format!(
                    "{}/{} held elsewhere",
                    key.process_guid, key.index
                )))
            }
            _ => {
                // Keep the doomed copy routable while the auctioneer places
                // a replacement.
                group.evacuating = Some(ActualLrp {
                    key: key.clone(),
                    instance_key: Some(instance_key.clone()),
                    state: LrpState::Running,
                    crash_reason: None,
                });
                group.instance = Some(ActualLrp {
                    key: key.clone(),
                    instance_key: None,
                    state: LrpState::Unclaimed,
                    crash_reason: None,
                });
                Ok(())
            }
        }
    }

    async fn remove_evacuating_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        let entry = (key.process_guid.clone(), key.index);
        let Some(group) = state.groups.get_mut(&entry) else {
            return Err(StoreError::NotFound(format!(
                "{}/{}",
                key.process_guid, key.index
            )));
        };
        if let Some(evacuating) = &group.evacuating {
            if evacuating.instance_key.as_ref() == Some(instance_key) {
                group.evacuating = None;
            }
        }
        let instance_unclaimed = matches!(
            &group.instance,
            None | Some(ActualLrp {
                state: LrpState::Unclaimed,
                ..
            })
        );
        if group.evacuating.is_none() && instance_unclaimed {
            state.groups.remove(&entry);
        }
        Ok(())
    }

    async fn set_cell_presence(
        &self,
        presence: &CellPresence,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        debug!(cell_id = %presence.cell_id, ttl_ms = ttl.as_millis() as u64, "presence set");
        state.cells.insert(
            presence.cell_id.clone(),
            (presence.clone(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn remove_cell_presence(&self, cell_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        state.cells.remove(cell_id);
        Ok(())
    }
}

// =============================================================================
// Thin HTTP record-store client
// =============================================================================

/// HTTP client for the real record store. Glue: every capability is one
/// POST/GET with a JSON body.
pub struct HttpRecordStore {
    client: reqwest::Client,
    base_url: String,
    coordination_url: String,
}

impl HttpRecordStore {
    pub fn new(client: reqwest::Client, base_url: &str, coordination_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            coordination_url: coordination_url.trim_end_matches('/').to_string(),
        }
    }

    fn classify(err: reqwest::Error) -> StoreError {
        if err.is_connect() || err.is_timeout() {
            StoreError::Unreachable(err.to_string())
        } else {
            StoreError::Store(err.to_string())
        }
    }

    fn classify_status(status: reqwest::StatusCode, context: &str) -> StoreError {
        match status {
            reqwest::StatusCode::CONFLICT => StoreError::CasConflict(context.to_string()),
            reqwest::StatusCode::NOT_FOUND => StoreError::NotFound(context.to_string()),
            _ => StoreError::Store(format!("{context}: status {status}")),
        }
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<(), StoreError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(Self::classify)?;
        if !response.status().is_success() {
            return Err(Self::classify_status(response.status(), path));
        }
        Ok(())
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, url: String) -> Result<T, StoreError> {
        let response = self.client.get(&url).send().await.map_err(Self::classify)?;
        if !response.status().is_success() {
            return Err(Self::classify_status(response.status(), &url));
        }
        response.json().await.map_err(Self::classify)
    }
}

#[derive(Serialize)]
struct LrpChange<'a> {
    key: &'a ActualLrpKey,
    instance_key: &'a ActualLrpInstanceKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn desire_lrp(&self, desired: &DesiredLrp) -> Result<(), StoreError> {
        self.post("/v1/desired_lrps", desired).await
    }

    async fn desire_task(&self, task: &TaskDefinition) -> Result<(), StoreError> {
        self.post("/v1/tasks", task).await
    }

    async fn cells(&self) -> Result<Vec<CellPresence>, StoreError> {
        self.get(format!("{}/v1/cells", self.coordination_url)).await
    }

    async fn actual_lrp_groups(
        &self,
        filter: &ActualLrpFilter,
    ) -> Result<Vec<ActualLrpGroup>, StoreError> {
        let mut url = format!("{}/v1/actual_lrp_groups", self.base_url);
        if let Some(cell_id) = &filter.cell_id {
            url = format!("{url}?cell_id={cell_id}");
        }
        self.get(url).await
    }

    async fn tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError> {
        let mut url = format!("{}/v1/tasks", self.base_url);
        if let Some(cell_id) = &filter.cell_id {
            url = format!("{url}?cell_id={cell_id}");
        }
        self.get(url).await
    }

    async fn claim_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), StoreError> {
        self.post(
            "/v1/actual_lrps/claim",
            &LrpChange {
                key,
                instance_key,
                reason: None,
            },
        )
        .await
    }

    async fn start_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), StoreError> {
        self.post(
            "/v1/actual_lrps/start",
            &LrpChange {
                key,
                instance_key,
                reason: None,
            },
        )
        .await
    }

    async fn crash_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        reason: &str,
    ) -> Result<(), StoreError> {
        self.post(
            "/v1/actual_lrps/crash",
            &LrpChange {
                key,
                instance_key,
                reason: Some(reason),
            },
        )
        .await
    }

    async fn remove_actual_lrp(&self, key: &ActualLrpKey) -> Result<(), StoreError> {
        self.post("/v1/actual_lrps/remove", key).await
    }

    async fn start_task(&self, task_guid: &str, cell_id: &str) -> Result<(), StoreError> {
        self.post(
            &format!("/v1/tasks/{task_guid}/start"),
            &serde_json::json!({ "cell_id": cell_id }),
        )
        .await
    }

    async fn complete_task(
        &self,
        task_guid: &str,
        cell_id: &str,
        failed: bool,
        failure_reason: &str,
    ) -> Result<(), StoreError> {
        self.post(
            &format!("/v1/tasks/{task_guid}/complete"),
            &serde_json::json!({
                "cell_id": cell_id,
                "failed": failed,
                "failure_reason": failure_reason,
            }),
        )
        .await
    }

    async fn fail_task(&self, task_guid: &str, reason: &str) -> Result<(), StoreError> {
        self.post(
            &format!("/v1/tasks/{task_guid}/fail"),
            &serde_json::json!({ "failure_reason": reason }),
        )
        .await
    }

    async fn evacuate_claimed_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), StoreError> {
        self.post(
            "/v1/actual_lrps/evacuate_claimed",
            &LrpChange {
                key,
                instance_key,
                reason: None,
            },
        )
        .await
    }

    async fn evacuate_running_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), StoreError> {
        self.post(
            "/v1/actual_lrps/evacuate_running",
            &LrpChange {
                key,
                instance_key,
                reason: None,
            },
        )
        .await
    }

    async fn remove_evacuating_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), StoreError> {
        self.post(
            "/v1/actual_lrps/remove_evacuating",
            &LrpChange {
                key,
                instance_key,
                reason: None,
            },
        )
        .await
    }

    async fn set_cell_presence(
        &self,
        presence: &CellPresence,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let url = format!(
            "{}/v1/cells/{}?ttl_ms={}",
            self.coordination_url,
            presence.cell_id,
            ttl.as_millis()
        );
        let response = self
            .client
            .put(&url)
            .json(presence)
            .send()
            .await
            .map_err(Self::classify)?;
        if !response.status().is_success() {
            return Err(Self::classify_status(response.status(), "set_cell_presence"));
        }
        Ok(())
    }

    async fn remove_cell_presence(&self, cell_id: &str) -> Result<(), StoreError> {
        let url = format!("{}/v1/cells/{}", self.coordination_url, cell_id);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(Self::classify)?;
        if !response.status().is_success() {
            return Err(Self::classify_status(response.status(), "remove_cell_presence"));
        }
        Ok(())
    }
}
