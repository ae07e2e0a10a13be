use super::notification::{
    InsufficientCreditHandler, LinkSettings, NotificationHandler, UnknownPlateHandler,
};
use super::orchestrator::Collaborators;
use crate::config::Config;
use crate::domain::ports::WorkflowStoreHandle;
use crate::domain::workflow::{ActivityCategory, RunId, TaskToken};
use crate::error::{Result, TollError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The queue had nothing to hand out.
    Idle,
    Notified {
        run_id: RunId,
        token: TaskToken,
        recipient: String,
    },
}

#[derive(Debug)]
pub struct CategoryPoll {
    pub category: ActivityCategory,
    pub queue: String,
    pub result: Result<PollOutcome>,
}

/// Result of one poll cycle, one entry per registered handler.
#[derive(Debug, Default)]
pub struct PollReport {
    pub polls: Vec<CategoryPoll>,
}

impl PollReport {
    pub fn notified(&self) -> usize {
        self.polls
            .iter()
            .filter(|poll| matches!(poll.result, Ok(PollOutcome::Notified { .. })))
            .count()
    }

    pub fn errors(&self) -> impl Iterator<Item = &TollError> {
        self.polls.iter().filter_map(|poll| poll.result.as_ref().err())
    }

    pub fn is_ok(&self) -> bool {
        self.errors().next().is_none()
    }
}

struct Registration {
    queue: String,
    handler: Arc<dyn NotificationHandler>,
}

/// Hands suspended work to the notification handlers.
///
/// Each cycle asks every registered queue for at most one task. Queues are
/// polled concurrently and independently: a failing handler leaves its task
/// queued for the next cycle without holding up the others.
pub struct ActivityPoller {
    runs: WorkflowStoreHandle,
    registrations: Vec<Registration>,
    lease: Duration,
    running: Arc<RwLock<bool>>,
}

impl ActivityPoller {
    pub fn new(runs: WorkflowStoreHandle, lease: Duration) -> Self {
        Self {
            runs,
            registrations: Vec::new(),
            lease,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// A poller with both notification handlers registered on their
    /// configured queues.
    pub fn from_config(collaborators: &Collaborators, config: &Config) -> Self {
        let links = LinkSettings::from(config);
        let unknown_plate = UnknownPlateHandler::new(
            collaborators.storage.clone(),
            collaborators.mailer.clone(),
            config.operator_email.clone(),
            links.clone(),
        );
        let insufficient_credit = InsufficientCreditHandler::new(
            collaborators.storage.clone(),
            collaborators.ledger.clone(),
            collaborators.mailer.clone(),
            links,
        );
        Self::new(collaborators.runs.clone(), config.task_lease)
            .with_handler(
                config.queue_for(ActivityCategory::ManualPlateInspection),
                Arc::new(unknown_plate),
            )
            .with_handler(
                config.queue_for(ActivityCategory::InsufficientCredit),
                Arc::new(insufficient_credit),
            )
    }

    pub fn with_handler(
        mut self,
        queue: impl Into<String>,
        handler: Arc<dyn NotificationHandler>,
    ) -> Self {
        self.registrations.push(Registration {
            queue: queue.into(),
            handler,
        });
        self
    }

    pub async fn poll_cycle(&self) -> PollReport {
        let mut set = JoinSet::new();
        for (index, registration) in self.registrations.iter().enumerate() {
            let runs = self.runs.clone();
            let queue = registration.queue.clone();
            let handler = registration.handler.clone();
            let lease = self.lease;
            set.spawn(async move { (index, poll_queue(runs, &queue, handler, lease).await) });
        }

        let mut results: Vec<Option<Result<PollOutcome>>> =
            self.registrations.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => error!(error = %e, "Poll task aborted"),
            }
        }

        let polls = self
            .registrations
            .iter()
            .zip(results)
            .map(|(registration, result)| CategoryPoll {
                category: registration.handler.category(),
                queue: registration.queue.clone(),
                result: result.unwrap_or_else(|| {
                    Err(TollError::Storage(format!(
                        "Poll of queue {} did not complete",
                        registration.queue
                    )))
                }),
            })
            .collect();
        PollReport { polls }
    }

    /// Starts polling every `every` on a background task. Returns `None` if
    /// this poller is already running.
    pub async fn start(self: &Arc<Self>, every: Duration) -> Option<JoinHandle<()>> {
        {
            let mut running = self.running.write().await;
            if *running {
                return None;
            }
            *running = true;
        }

        info!(
            queues = self.registrations.len(),
            interval_secs = every.as_secs(),
            "Starting activity poller"
        );
        let poller = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if !*poller.running.read().await {
                    break;
                }
                let report = poller.poll_cycle().await;
                debug!(notified = report.notified(), "Poll cycle finished");
            }
            info!("Activity poller stopped");
        }))
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

async fn poll_queue(
    runs: WorkflowStoreHandle,
    queue: &str,
    handler: Arc<dyn NotificationHandler>,
    lease: Duration,
) -> Result<PollOutcome> {
    let Some(task) = runs.next_task(queue, lease).await? else {
        debug!(queue, "No pending tasks");
        return Ok(PollOutcome::Idle);
    };

    if task.category != handler.category() {
        runs.release_task(&task.token).await?;
        return Err(TollError::Storage(format!(
            "Queue {} holds a {} task but its handler expects {}",
            queue,
            task.category,
            handler.category()
        )));
    }

    info!(queue, run_id = %task.run_id, category = %task.category, "Dispatching pending task");
    match handler.handle(&task).await {
        Ok(receipt) => {
            runs.complete_dispatch(&task.token).await?;
            info!(
                queue,
                run_id = %task.run_id,
                recipient = %receipt.recipient,
                "Notification sent"
            );
            Ok(PollOutcome::Notified {
                run_id: task.run_id,
                token: task.token,
                recipient: receipt.recipient,
            })
        }
        Err(e) => {
            error!(queue, run_id = %task.run_id, error = %e, "Notification failed, task released");
            runs.release_task(&task.token).await?;
            Err(e.into())
        }
    }
}
