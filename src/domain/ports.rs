use super::ledger::{Charge, ChargeOutcome, LedgerRecord};
use super::toll_event::{ObjectMetadata, TextDetection};
use super::workflow::{PendingTask, RunId, TaskToken, WorkflowRun};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata>;
    /// A read link for the object that stops working after `ttl`.
    async fn presigned_get(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String>;
}

#[async_trait]
pub trait TextDetector: Send + Sync {
    /// Detected lines and words, in the order the detector reports them.
    async fn detect_text(&self, bucket: &str, key: &str) -> Result<Vec<TextDetection>>;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn property_bag(&self, secret_id: &str) -> Result<Map<String, Value>>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get(&self, plate: &str) -> Result<Option<LedgerRecord>>;
    /// Administrative insert/replace (seeding, top-ups).
    async fn upsert(&self, record: LedgerRecord) -> Result<()>;
    /// Decrements `credit` by `charge` only if `credit >= charge` at write
    /// time, as one indivisible operation. `idempotency_key` makes repeated
    /// delivery of the same charge a no-op.
    async fn charge_if_sufficient(
        &self,
        plate: &str,
        charge: Charge,
        idempotency_key: &str,
    ) -> Result<ChargeOutcome>;
    async fn all_records(&self) -> Result<Vec<LedgerRecord>>;
}

/// Durable home of workflow runs and the human-task queues.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn insert_run(&self, run: &WorkflowRun) -> Result<()>;
    async fn get_run(&self, run_id: RunId) -> Result<Option<WorkflowRun>>;
    async fn save_run(&self, run: &WorkflowRun) -> Result<()>;
    async fn list_runs(&self) -> Result<Vec<WorkflowRun>>;
    /// Persists the suspended run and enqueues its task on `queue` together.
    async fn suspend(&self, run: &WorkflowRun, queue: &str, task: PendingTask) -> Result<()>;
    /// Leases the next pending task on `queue` for `lease`. Tasks whose lease
    /// ran out are handed out again.
    async fn next_task(&self, queue: &str, lease: Duration) -> Result<Option<PendingTask>>;
    /// The task was delivered; stop handing it out but keep it resumable.
    async fn complete_dispatch(&self, token: &TaskToken) -> Result<()>;
    /// Delivery failed; make the task available to the next poll.
    async fn release_task(&self, token: &TaskToken) -> Result<()>;
    async fn get_task(&self, token: &TaskToken) -> Result<Option<PendingTask>>;
    /// Removes the task and saves `resumed` in one write. At most one caller
    /// ever gets `Some`; if the task is gone or expired, `resumed` is not
    /// written. A failed write leaves both the task and the stored run as
    /// they were.
    async fn consume_task(
        &self,
        token: &TaskToken,
        resumed: &WorkflowRun,
    ) -> Result<Option<PendingTask>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub from: Option<String>,
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

pub type ObjectStorageHandle = Arc<dyn ObjectStorage>;
pub type TextDetectorHandle = Arc<dyn TextDetector>;
pub type SecretStoreHandle = Arc<dyn SecretStore>;
pub type LedgerStoreHandle = Arc<dyn LedgerStore>;
pub type WorkflowStoreHandle = Arc<dyn WorkflowStore>;
pub type EmailSenderHandle = Arc<dyn EmailSender>;
