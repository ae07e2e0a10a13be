use crate::domain::ledger::{Charge, ChargeOutcome, LedgerRecord};
use crate::domain::ports::{
    EmailMessage, EmailSender, LedgerStore, ObjectStorage, SecretStore, TextDetector,
    WorkflowStore,
};
use crate::domain::toll_event::{ObjectMetadata, TextDetection};
use crate::domain::workflow::{PendingTask, RunId, TaskToken, WorkflowRun};
use crate::error::{Result, TollError};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Default)]
struct LedgerState {
    records: HashMap<String, LedgerRecord>,
    applied_keys: HashSet<String>,
}

/// A thread-safe in-memory ledger.
///
/// The conditional charge runs entirely under the write lock, which is the
/// store's isolation boundary: concurrent charges against the same plate are
/// serialized here and nowhere else.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    state: Arc<RwLock<LedgerState>>,
    reads: Arc<AtomicUsize>,
    charge_attempts: Arc<AtomicUsize>,
    failures: Arc<AtomicU32>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` operations fail as if the store were unreachable.
    pub fn fail_next_operations(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn charge_attempts(&self) -> usize {
        self.charge_attempts.load(Ordering::SeqCst)
    }

    fn injected_failure(&self) -> Result<()> {
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(TollError::Storage("Ledger store unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get(&self, plate: &str) -> Result<Option<LedgerRecord>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        let state = self.state.read().await;
        Ok(state.records.get(plate).cloned())
    }

    async fn upsert(&self, record: LedgerRecord) -> Result<()> {
        let mut state = self.state.write().await;
        state.records.insert(record.plate.clone(), record);
        Ok(())
    }

    async fn charge_if_sufficient(
        &self,
        plate: &str,
        charge: Charge,
        idempotency_key: &str,
    ) -> Result<ChargeOutcome> {
        self.charge_attempts.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        let mut state = self.state.write().await;
        let LedgerState {
            records,
            applied_keys,
        } = &mut *state;

        let Some(record) = records.get_mut(plate) else {
            return Ok(ChargeOutcome::NotFound);
        };
        if applied_keys.contains(idempotency_key) {
            return Ok(ChargeOutcome::AlreadyApplied {
                credit: record.credit,
            });
        }
        match record.try_charge(charge) {
            Ok(credit) => {
                applied_keys.insert(idempotency_key.to_string());
                Ok(ChargeOutcome::Applied { credit })
            }
            Err(credit) => Ok(ChargeOutcome::PreconditionFailed { credit }),
        }
    }

    async fn all_records(&self) -> Result<Vec<LedgerRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<_> = state.records.values().cloned().collect();
        records.sort_by(|a, b| a.plate.cmp(&b.plate));
        Ok(records)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TaskStatus {
    Queued,
    Leased { until: Instant },
    Dispatched,
}

struct TaskEntry {
    task: PendingTask,
    queue: String,
    status: TaskStatus,
}

#[derive(Default)]
struct WorkflowState {
    runs: HashMap<RunId, WorkflowRun>,
    tasks: HashMap<TaskToken, TaskEntry>,
    queues: HashMap<String, VecDeque<TaskToken>>,
}

/// In-memory workflow runs and human-task queues.
#[derive(Default, Clone)]
pub struct InMemoryWorkflowStore {
    state: Arc<RwLock<WorkflowState>>,
    failures: Arc<AtomicU32>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` run writes (`save_run`, `suspend`, `consume_task`)
    /// fail without touching the stored state.
    pub fn fail_next_writes(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> Result<()> {
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(TollError::Storage("Workflow store unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn insert_run(&self, run: &WorkflowRun) -> Result<()> {
        let mut state = self.state.write().await;
        if state.runs.contains_key(&run.run_id) {
            return Err(TollError::Storage(format!(
                "Run {} already exists",
                run.run_id
            )));
        }
        state.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<WorkflowRun>> {
        let state = self.state.read().await;
        Ok(state.runs.get(&run_id).cloned())
    }

    async fn save_run(&self, run: &WorkflowRun) -> Result<()> {
        self.injected_failure()?;
        let mut state = self.state.write().await;
        state.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn list_runs(&self) -> Result<Vec<WorkflowRun>> {
        let state = self.state.read().await;
        let mut runs: Vec<_> = state.runs.values().cloned().collect();
        runs.sort_by_key(|run| run.created_at);
        Ok(runs)
    }

    async fn suspend(&self, run: &WorkflowRun, queue: &str, task: PendingTask) -> Result<()> {
        self.injected_failure()?;
        let mut state = self.state.write().await;
        let token = task.token.clone();
        state.runs.insert(run.run_id, run.clone());
        state.tasks.insert(
            token.clone(),
            TaskEntry {
                task,
                queue: queue.to_string(),
                status: TaskStatus::Queued,
            },
        );
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(token);
        Ok(())
    }

    async fn next_task(&self, queue: &str, lease: Duration) -> Result<Option<PendingTask>> {
        let mut state = self.state.write().await;
        let WorkflowState { tasks, queues, .. } = &mut *state;
        let now = Instant::now();
        let pending = queues.entry(queue.to_string()).or_default();

        // Leases that ran out go back to the end of the queue.
        for (token, entry) in tasks.iter_mut() {
            if entry.queue == queue
                && let TaskStatus::Leased { until } = entry.status
                && until <= now
            {
                entry.status = TaskStatus::Queued;
                pending.push_back(token.clone());
            }
        }

        while let Some(token) = pending.pop_front() {
            let Some(entry) = tasks.get_mut(&token) else {
                continue;
            };
            if entry.status != TaskStatus::Queued {
                continue;
            }
            if entry.task.is_expired(Utc::now()) {
                warn!(queue, run_id = %entry.task.run_id, "Dropping expired task");
                tasks.remove(&token);
                continue;
            }
            entry.status = TaskStatus::Leased { until: now + lease };
            return Ok(Some(entry.task.clone()));
        }
        Ok(None)
    }

    async fn complete_dispatch(&self, token: &TaskToken) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(entry) = state.tasks.get_mut(token) {
            entry.status = TaskStatus::Dispatched;
        }
        Ok(())
    }

    async fn release_task(&self, token: &TaskToken) -> Result<()> {
        let mut state = self.state.write().await;
        let WorkflowState { tasks, queues, .. } = &mut *state;
        if let Some(entry) = tasks.get_mut(token)
            && matches!(entry.status, TaskStatus::Leased { .. })
        {
            entry.status = TaskStatus::Queued;
            queues
                .entry(entry.queue.clone())
                .or_default()
                .push_back(token.clone());
        }
        Ok(())
    }

    async fn get_task(&self, token: &TaskToken) -> Result<Option<PendingTask>> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .get(token)
            .map(|entry| entry.task.clone())
            .filter(|task| !task.is_expired(Utc::now())))
    }

    async fn consume_task(
        &self,
        token: &TaskToken,
        resumed: &WorkflowRun,
    ) -> Result<Option<PendingTask>> {
        self.injected_failure()?;
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .remove(token)
            .map(|entry| entry.task)
            .filter(|task| !task.is_expired(Utc::now()));
        if task.is_some() {
            state.runs.insert(resumed.run_id, resumed.clone());
        }
        Ok(task)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Secret property bags held in memory.
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: Mutex<HashMap<String, Map<String, Value>>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_property(&self, secret_id: &str, name: &str, value: impl Into<Value>) {
        lock(&self.secrets)
            .entry(secret_id.to_string())
            .or_default()
            .insert(name.to_string(), value.into());
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn property_bag(&self, secret_id: &str) -> Result<Map<String, Value>> {
        lock(&self.secrets)
            .get(secret_id)
            .cloned()
            .ok_or_else(|| TollError::Config(format!("The requested secret {} was not found", secret_id)))
    }
}

/// Object metadata held in memory; links use a `memory://` scheme.
#[derive(Default)]
pub struct InMemoryObjectStorage {
    objects: Mutex<HashMap<(String, String), ObjectMetadata>>,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_object(&self, bucket: &str, key: &str, content_type: &str, content_length: u64) {
        lock(&self.objects).insert(
            (bucket.to_string(), key.to_string()),
            ObjectMetadata {
                content_type: content_type.to_string(),
                content_length,
            },
        );
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        lock(&self.objects)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| TollError::Storage(format!("NotFound: {}/{}", bucket, key)))
    }

    async fn presigned_get(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String> {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires = Utc::now().timestamp().saturating_add(ttl);
        Ok(format!("memory://{}/{}?expires={}", bucket, key, expires))
    }
}

/// Canned text detections per object.
#[derive(Default)]
pub struct InMemoryTextDetector {
    detections: Mutex<HashMap<(String, String), Vec<TextDetection>>>,
    calls: AtomicUsize,
}

impl InMemoryTextDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_detections(&self, bucket: &str, key: &str, detections: Vec<TextDetection>) {
        lock(&self.detections).insert((bucket.to_string(), key.to_string()), detections);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextDetector for InMemoryTextDetector {
    async fn detect_text(&self, bucket: &str, key: &str) -> Result<Vec<TextDetection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.detections)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| TollError::Storage(format!("No image at {}/{}", bucket, key)))
    }
}

/// Keeps every message it is asked to send.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<EmailMessage>>,
    failing: AtomicBool,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl EmailSender for RecordingMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TollError::Storage("Mail transport unavailable".to_string()));
        }
        lock(&self.sent).push(message.clone());
        Ok(())
    }
}
