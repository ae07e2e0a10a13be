use crate::domain::ledger::{Charge, ChargeOutcome, LedgerRecord};
use crate::domain::ports::{LedgerStore, WorkflowStore};
use crate::domain::workflow::{PendingTask, RunId, TaskToken, WorkflowRun};
use crate::error::{Result, TollError};
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, ErrorKind, IteratorMode, OptimisticTransactionDB,
    Options, Transaction,
};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Column Family for workflow runs, keyed by run id.
pub const CF_RUNS: &str = "runs";
/// Column Family for pending human tasks, keyed by task token.
pub const CF_TASKS: &str = "tasks";
/// Column Family recording which charges were applied, keyed by idempotency key.
pub const CF_APPLIED_CHARGES: &str = "applied_charges";

const MAX_TXN_ATTEMPTS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
enum StoredStatus {
    Queued,
    Leased { until_ms: i64 },
    Dispatched,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTask {
    queue: String,
    status: StoredStatus,
    task: PendingTask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AppliedCharge {
    plate: String,
    charge: Charge,
}

/// A persistent store implementation using RocksDB.
///
/// The ledger lives in its own Column Family, named after the configured
/// ledger table; runs, tasks and applied-charge markers get one each. Every
/// read-modify-write goes through an optimistic transaction, so the
/// conditional charge and single-use task tokens hold across concurrent
/// callers sharing the database.
///
/// `Clone` shares the underlying `Arc<OptimisticTransactionDB>`.
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<OptimisticTransactionDB>,
    ledger_cf: String,
}

impl RocksDBStore {
    /// Opens or creates the database at `path`, creating missing Column
    /// Families.
    pub fn open<P: AsRef<Path>>(path: P, ledger_table: &str) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [ledger_table, CF_RUNS, CF_TASKS, CF_APPLIED_CHARGES]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = OptimisticTransactionDB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self {
            db: Arc::new(db),
            ledger_cf: ledger_table.to_string(),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| TollError::Storage(format!("Column family {} not found", name)))
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<(Vec<u8>, T)>> {
        let mut items = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            let (key, value) = item?;
            items.push((key.to_vec(), serde_json::from_slice(&value)?));
        }
        Ok(items)
    }

    /// Runs `body` in an optimistic transaction, re-running it when the
    /// commit loses a write conflict.
    fn transact<T>(
        &self,
        mut body: impl FnMut(&Transaction<'_, OptimisticTransactionDB>) -> Result<T>,
    ) -> Result<T> {
        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let txn = self.db.transaction();
            let value = body(&txn)?;
            match txn.commit() {
                Ok(()) => return Ok(value),
                Err(e) if matches!(e.kind(), ErrorKind::Busy | ErrorKind::TryAgain) => {
                    debug!(attempt, error = %e, "Transaction conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(TollError::Storage(format!(
            "Transaction still conflicting after {} attempts",
            MAX_TXN_ATTEMPTS
        )))
    }

    fn locked<T: DeserializeOwned>(
        txn: &Transaction<'_, OptimisticTransactionDB>,
        cf: &ColumnFamily,
        key: &[u8],
    ) -> Result<Option<T>> {
        match txn.get_for_update_cf(cf, key, true)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Moves a task to a new status if it is still in the task Column Family.
    fn set_status(
        &self,
        token: &TaskToken,
        update: impl Fn(StoredStatus) -> Option<StoredStatus>,
    ) -> Result<()> {
        let tasks = self.cf(CF_TASKS)?;
        self.transact(|txn| {
            let Some(mut stored) = Self::locked::<StoredTask>(txn, tasks, token.as_str().as_bytes())?
            else {
                return Ok(());
            };
            if let Some(status) = update(stored.status) {
                stored.status = status;
                txn.put_cf(tasks, token.as_str(), serde_json::to_vec(&stored)?)?;
            }
            Ok(())
        })
    }
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn get(&self, plate: &str) -> Result<Option<LedgerRecord>> {
        self.read(&self.ledger_cf, plate.as_bytes())
    }

    async fn upsert(&self, record: LedgerRecord) -> Result<()> {
        let value = serde_json::to_vec(&record)?;
        self.db
            .put_cf(self.cf(&self.ledger_cf)?, record.plate.as_bytes(), value)?;
        Ok(())
    }

    async fn charge_if_sufficient(
        &self,
        plate: &str,
        charge: Charge,
        idempotency_key: &str,
    ) -> Result<ChargeOutcome> {
        let ledger = self.cf(&self.ledger_cf)?;
        let applied = self.cf(CF_APPLIED_CHARGES)?;

        self.transact(|txn| {
            let Some(mut record) = Self::locked::<LedgerRecord>(txn, ledger, plate.as_bytes())? else {
                return Ok(ChargeOutcome::NotFound);
            };
            if txn
                .get_for_update_cf(applied, idempotency_key.as_bytes(), true)?
                .is_some()
            {
                return Ok(ChargeOutcome::AlreadyApplied {
                    credit: record.credit,
                });
            }
            match record.try_charge(charge) {
                Ok(credit) => {
                    txn.put_cf(ledger, plate.as_bytes(), serde_json::to_vec(&record)?)?;
                    let marker = AppliedCharge {
                        plate: plate.to_string(),
                        charge,
                    };
                    txn.put_cf(applied, idempotency_key.as_bytes(), serde_json::to_vec(&marker)?)?;
                    Ok(ChargeOutcome::Applied { credit })
                }
                Err(credit) => Ok(ChargeOutcome::PreconditionFailed { credit }),
            }
        })
    }

    async fn all_records(&self) -> Result<Vec<LedgerRecord>> {
        // Keys are plates, so iteration order is already by plate.
        Ok(self
            .scan::<LedgerRecord>(&self.ledger_cf)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }
}

#[async_trait]
impl WorkflowStore for RocksDBStore {
    async fn insert_run(&self, run: &WorkflowRun) -> Result<()> {
        let runs = self.cf(CF_RUNS)?;
        let key = run.run_id.to_string();
        self.transact(|txn| {
            if txn.get_for_update_cf(runs, key.as_bytes(), true)?.is_some() {
                return Err(TollError::Storage(format!(
                    "Run {} already exists",
                    run.run_id
                )));
            }
            txn.put_cf(runs, key.as_bytes(), serde_json::to_vec(run)?)?;
            Ok(())
        })
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<WorkflowRun>> {
        self.read(CF_RUNS, run_id.to_string().as_bytes())
    }

    async fn save_run(&self, run: &WorkflowRun) -> Result<()> {
        let value = serde_json::to_vec(run)?;
        self.db
            .put_cf(self.cf(CF_RUNS)?, run.run_id.to_string().as_bytes(), value)?;
        Ok(())
    }

    async fn list_runs(&self) -> Result<Vec<WorkflowRun>> {
        let mut runs: Vec<WorkflowRun> = self
            .scan::<WorkflowRun>(CF_RUNS)?
            .into_iter()
            .map(|(_, run)| run)
            .collect();
        runs.sort_by_key(|run| run.created_at);
        Ok(runs)
    }

    async fn suspend(&self, run: &WorkflowRun, queue: &str, task: PendingTask) -> Result<()> {
        let runs = self.cf(CF_RUNS)?;
        let tasks = self.cf(CF_TASKS)?;
        let stored = StoredTask {
            queue: queue.to_string(),
            status: StoredStatus::Queued,
            task,
        };
        let run_value = serde_json::to_vec(run)?;
        let task_value = serde_json::to_vec(&stored)?;

        self.transact(|txn| {
            txn.put_cf(runs, run.run_id.to_string().as_bytes(), &run_value)?;
            txn.put_cf(tasks, stored.task.token.as_str().as_bytes(), &task_value)?;
            Ok(())
        })
    }

    async fn next_task(&self, queue: &str, lease: Duration) -> Result<Option<PendingTask>> {
        let tasks = self.cf(CF_TASKS)?;
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);

        let mut candidates: Vec<StoredTask> = self
            .scan::<StoredTask>(CF_TASKS)?
            .into_iter()
            .map(|(_, stored)| stored)
            .filter(|stored| stored.queue == queue)
            .filter(|stored| match stored.status {
                StoredStatus::Queued => true,
                StoredStatus::Leased { until_ms } => until_ms <= now_ms,
                StoredStatus::Dispatched => false,
            })
            .collect();
        candidates.sort_by_key(|stored| stored.task.created_at);

        for candidate in candidates {
            let key = candidate.task.token.as_str().as_bytes().to_vec();
            if candidate.task.is_expired(now) {
                warn!(queue, run_id = %candidate.task.run_id, "Dropping expired task");
                self.db.delete_cf(tasks, &key)?;
                continue;
            }

            // Another poller may have leased it since the scan.
            let leased = self.transact(|txn| {
                let Some(mut stored) = Self::locked::<StoredTask>(txn, tasks, &key)? else {
                    return Ok(None);
                };
                let available = match stored.status {
                    StoredStatus::Queued => true,
                    StoredStatus::Leased { until_ms } => until_ms <= now_ms,
                    StoredStatus::Dispatched => false,
                };
                if !available {
                    return Ok(None);
                }
                stored.status = StoredStatus::Leased {
                    until_ms: now_ms.saturating_add(lease_ms),
                };
                txn.put_cf(tasks, &key, serde_json::to_vec(&stored)?)?;
                Ok(Some(stored.task))
            })?;
            if leased.is_some() {
                return Ok(leased);
            }
        }
        Ok(None)
    }

    async fn complete_dispatch(&self, token: &TaskToken) -> Result<()> {
        self.set_status(token, |_| Some(StoredStatus::Dispatched))
    }

    async fn release_task(&self, token: &TaskToken) -> Result<()> {
        self.set_status(token, |status| match status {
            StoredStatus::Leased { .. } => Some(StoredStatus::Queued),
            _ => None,
        })
    }

    async fn get_task(&self, token: &TaskToken) -> Result<Option<PendingTask>> {
        let stored: Option<StoredTask> = self.read(CF_TASKS, token.as_str().as_bytes())?;
        Ok(stored
            .map(|stored| stored.task)
            .filter(|task| !task.is_expired(Utc::now())))
    }

    async fn consume_task(
        &self,
        token: &TaskToken,
        resumed: &WorkflowRun,
    ) -> Result<Option<PendingTask>> {
        let runs = self.cf(CF_RUNS)?;
        let tasks = self.cf(CF_TASKS)?;
        let key = token.as_str().as_bytes();
        let run_key = resumed.run_id.to_string();
        let run_value = serde_json::to_vec(resumed)?;
        let now = Utc::now();

        self.transact(|txn| {
            let Some(stored) = Self::locked::<StoredTask>(txn, tasks, key)? else {
                return Ok(None);
            };
            txn.delete_cf(tasks, key)?;
            if stored.task.is_expired(now) {
                return Ok(None);
            }
            txn.put_cf(runs, run_key.as_bytes(), &run_value)?;
            Ok(Some(stored.task))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ledger::Charge;
    use crate::domain::toll_event::{ObjectMetadata, ObjectRef, PlateDetection, TollEvent, TollRequest};
    use crate::domain::workflow::{ActivityCategory, Stage};
    use tempfile::tempdir;

    fn request() -> TollRequest {
        TollRequest {
            object: ObjectRef::new("gantry", "a.jpg"),
            charge: Charge::new(5).unwrap(),
        }
    }

    fn suspended_run() -> (WorkflowRun, PendingTask) {
        let request = request();
        let mut run = WorkflowRun::new(request.clone());
        let event = TollEvent::new(
            &request,
            ObjectMetadata {
                content_type: "image/jpeg".into(),
                content_length: 1,
            },
            PlateDetection::not_detected(".*"),
        );
        run.event = Some(event.clone());
        run.stage = Stage::AwaitingManualPlateReview;
        let token = TaskToken::generate();
        run.pending_task_token = Some(token.clone());
        let task = PendingTask {
            token,
            run_id: run.run_id,
            category: ActivityCategory::ManualPlateInspection,
            plate: event.plate.clone(),
            event,
            charge: run.charge,
            created_at: Utc::now(),
            expires_at: None,
        };
        (run, task)
    }

    #[tokio::test]
    async fn test_conditional_charge() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path(), "NumberPlates").unwrap();
        store.upsert(LedgerRecord::new("ABC123", 7)).await.unwrap();
        let five = Charge::new(5).unwrap();

        assert_eq!(
            store.charge_if_sufficient("ABC123", five, "run-1").await.unwrap(),
            ChargeOutcome::Applied { credit: 2 }
        );
        assert_eq!(
            store.charge_if_sufficient("ABC123", five, "run-1").await.unwrap(),
            ChargeOutcome::AlreadyApplied { credit: 2 }
        );
        assert_eq!(
            store.charge_if_sufficient("ABC123", five, "run-2").await.unwrap(),
            ChargeOutcome::PreconditionFailed { credit: 2 }
        );
        assert_eq!(
            store.charge_if_sufficient("NOPE01", five, "run-3").await.unwrap(),
            ChargeOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let (run, task) = suspended_run();
        let token = task.token.clone();
        {
            let store = RocksDBStore::open(dir.path(), "NumberPlates").unwrap();
            store.upsert(LedgerRecord::new("ABC123", 10)).await.unwrap();
            store.insert_run(&run).await.unwrap();
            store
                .suspend(&run, "ManualPlateInspection", task)
                .await
                .unwrap();
        }

        let store = RocksDBStore::open(dir.path(), "NumberPlates").unwrap();
        assert_eq!(store.get("ABC123").await.unwrap().unwrap().credit, 10);
        let stored = store.get_run(run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.stage, Stage::AwaitingManualPlateReview);
        assert_eq!(stored.pending_task_token, Some(token.clone()));

        let leased = store
            .next_task("ManualPlateInspection", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(leased.map(|t| t.token), Some(token.clone()));
        assert!(
            store
                .next_task("ManualPlateInspection", Duration::from_secs(60))
                .await
                .unwrap()
                .is_none()
        );

        let mut resumed = stored.clone();
        resumed.pending_task_token = None;
        resumed.stage = Stage::Deciding;
        assert!(store.consume_task(&token, &resumed).await.unwrap().is_some());
        assert!(store.consume_task(&token, &resumed).await.unwrap().is_none());
        assert_eq!(
            store.get_run(run.run_id).await.unwrap().unwrap().stage,
            Stage::Deciding
        );
    }

    #[tokio::test]
    async fn test_released_lease_is_redelivered() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path(), "NumberPlates").unwrap();
        let (run, task) = suspended_run();
        let token = task.token.clone();
        store.suspend(&run, "q", task).await.unwrap();

        let lease = Duration::from_secs(60);
        assert!(store.next_task("q", lease).await.unwrap().is_some());
        store.release_task(&token).await.unwrap();
        assert!(store.next_task("q", lease).await.unwrap().is_some());
        store.complete_dispatch(&token).await.unwrap();
        assert!(store.next_task("q", lease).await.unwrap().is_none());
        assert!(store.get_task(&token).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_charges_on_exact_balance() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path(), "NumberPlates").unwrap();
        let five = Charge::new(5).unwrap();

        for round in 0..20 {
            let plate = format!("RACE{:02}", round);
            store.upsert(LedgerRecord::new(&plate, 5)).await.unwrap();
            let barrier = Arc::new(tokio::sync::Barrier::new(2));

            let handles: Vec<_> = (0..2)
                .map(|i| {
                    let store = store.clone();
                    let barrier = barrier.clone();
                    let plate = plate.clone();
                    tokio::spawn(async move {
                        barrier.wait().await;
                        store
                            .charge_if_sufficient(&plate, five, &format!("{}-run-{}", plate, i))
                            .await
                            .unwrap()
                    })
                })
                .collect();

            let mut outcomes = Vec::new();
            for handle in handles {
                outcomes.push(handle.await.unwrap());
            }
            let applied = outcomes
                .iter()
                .filter(|o| matches!(o, ChargeOutcome::Applied { credit: 0 }))
                .count();
            let rejected = outcomes
                .iter()
                .filter(|o| matches!(o, ChargeOutcome::PreconditionFailed { credit: 0 }))
                .count();
            assert_eq!((applied, rejected), (1, 1), "round {}: {:?}", round, outcomes);
            assert_eq!(store.get(&plate).await.unwrap().unwrap().credit, 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_consumers_share_one_token() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path(), "NumberPlates").unwrap();

        for round in 0..20 {
            let (run, task) = suspended_run();
            let token = task.token.clone();
            store.insert_run(&run).await.unwrap();
            store.suspend(&run, "q", task).await.unwrap();
            let barrier = Arc::new(tokio::sync::Barrier::new(2));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let store = store.clone();
                    let barrier = barrier.clone();
                    let token = token.clone();
                    let mut resumed = run.clone();
                    resumed.pending_task_token = None;
                    resumed.stage = Stage::Deciding;
                    tokio::spawn(async move {
                        barrier.wait().await;
                        store.consume_task(&token, &resumed).await.unwrap()
                    })
                })
                .collect();

            let mut winners = 0;
            for handle in handles {
                if handle.await.unwrap().is_some() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1, "round {}", round);
            assert!(store.get_task(&token).await.unwrap().is_none());
            assert_eq!(
                store.get_run(run.run_id).await.unwrap().unwrap().stage,
                Stage::Deciding
            );
        }
    }
}
