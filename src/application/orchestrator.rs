use super::charging::{ChargeResult, ConditionalLedgerUpdate};
use super::decision::{ChargeDecision, ChargeDecisionStage, FaultInjector};
use super::extraction::PlateExtractionStage;
use super::plate_pattern::PlatePatternProvider;
use super::retry::RetryPolicy;
use crate::config::Config;
use crate::domain::ports::{
    EmailSenderHandle, LedgerStoreHandle, ObjectStorageHandle, TextDetectorHandle,
    WorkflowStoreHandle,
};
use crate::domain::toll_event::{PlateDetection, TollEvent, TollRequest};
use crate::domain::workflow::{
    ActivityCategory, PendingTask, ResumeInput, RunId, Stage, TaskToken, WorkflowRun,
};
use crate::error::{Result, StageError, TollError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// The external services a deployment wires in.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: ObjectStorageHandle,
    pub detector: TextDetectorHandle,
    pub ledger: LedgerStoreHandle,
    pub runs: WorkflowStoreHandle,
    pub mailer: EmailSenderHandle,
}

/// What a stage asks the state machine to do next.
enum Step {
    Advance(Stage),
    /// A business outcome a human has to resolve.
    Suspend(StageError),
}

/// The durable billing state machine.
///
/// Every transition is written to the [`WorkflowStore`](crate::domain::ports::WorkflowStore)
/// before the next stage runs. A suspended run lives only in the store:
/// nothing is held in memory while a human decides, and any process with
/// the same store can resume it from its task token.
pub struct TollWorkflow {
    extraction: PlateExtractionStage,
    decision: ChargeDecisionStage,
    charging: ConditionalLedgerUpdate,
    runs: WorkflowStoreHandle,
    patterns: Arc<PlatePatternProvider>,
    extraction_retry: RetryPolicy,
    decision_retry: RetryPolicy,
    charging_retry: RetryPolicy,
    manual_review_queue: String,
    insufficient_credit_queue: String,
    task_token_ttl: Option<Duration>,
}

impl TollWorkflow {
    pub fn new(
        collaborators: &Collaborators,
        patterns: Arc<PlatePatternProvider>,
        config: &Config,
    ) -> Self {
        Self {
            extraction: PlateExtractionStage::new(
                collaborators.storage.clone(),
                collaborators.detector.clone(),
                config.min_confidence,
            ),
            decision: ChargeDecisionStage::new(
                collaborators.ledger.clone(),
                FaultInjector::new(config.random_failure_probability),
            ),
            charging: ConditionalLedgerUpdate::new(collaborators.ledger.clone()),
            runs: collaborators.runs.clone(),
            patterns,
            extraction_retry: RetryPolicy::once(),
            decision_retry: config.retry,
            charging_retry: config.retry,
            manual_review_queue: config.manual_review_queue.clone(),
            insufficient_credit_queue: config.insufficient_credit_queue.clone(),
            task_token_ttl: config.task_token_ttl,
        }
    }

    pub fn store(&self) -> &WorkflowStoreHandle {
        &self.runs
    }

    fn queue_for(&self, category: ActivityCategory) -> &str {
        match category {
            ActivityCategory::ManualPlateInspection => &self.manual_review_queue,
            ActivityCategory::InsufficientCredit => &self.insufficient_credit_queue,
        }
    }

    /// Starts a run for an inbound image and drives it until it finishes or
    /// waits on a human.
    pub async fn start(&self, request: TollRequest) -> Result<WorkflowRun> {
        let run = WorkflowRun::new(request);
        self.runs.insert_run(&run).await?;
        info!(
            run_id = %run.run_id,
            object = %run.request.object,
            charge = run.charge.value(),
            "Workflow run started"
        );
        self.drive(run).await
    }

    /// Resumes a suspended run with a human's answer.
    ///
    /// The token is consumed exactly once. Unknown, reused or expired tokens
    /// are rejected before the ledger is touched.
    pub async fn resume(&self, token: &TaskToken, input: ResumeInput) -> Result<WorkflowRun> {
        let task = self.runs.get_task(token).await?.ok_or_else(|| {
            TollError::TaskTokenRejected("unknown, already used or expired".to_string())
        })?;
        if task.category != input.category() {
            return Err(TollError::InvalidResume(format!(
                "Run {} is waiting on {}, not {}",
                task.run_id,
                task.category,
                input.category()
            )));
        }
        if let ResumeInput::PlateReviewed { plate, .. } = &input
            && plate.trim().is_empty()
        {
            return Err(TollError::InvalidResume(
                "A reviewed number plate must not be empty".to_string(),
            ));
        }

        let mut run = self
            .runs
            .get_run(task.run_id)
            .await?
            .ok_or_else(|| TollError::Storage(format!("Run {} not found", task.run_id)))?;
        if run.pending_task_token.as_ref() != Some(token) || run.stage.awaiting() != Some(task.category) {
            return Err(TollError::TaskTokenRejected(format!(
                "Run {} is not waiting on this token",
                run.run_id
            )));
        }

        match input {
            ResumeInput::PlateReviewed { plate, charge } => {
                run.corrections.push(PlateDetection::manual(plate.trim()));
                if let Some(charge) = charge {
                    run.charge = charge;
                }
            }
            ResumeInput::CreditToppedUp => {}
        }
        run.pending_task_token = None;
        run.transition(task.category.resume_stage())?;

        // The token is spent and the resumed run stored in one write.
        self.runs
            .consume_task(token, &run)
            .await?
            .ok_or_else(|| TollError::TaskTokenRejected("already used".to_string()))?;
        info!(
            run_id = %run.run_id,
            category = %task.category,
            plate = run.current_plate().map(|p| p.plate.as_str()).unwrap_or_default(),
            charge = run.charge.value(),
            "Workflow run resumed"
        );
        self.drive(run).await
    }

    /// Re-drives runs left in an active stage, e.g. after a crash. Call once
    /// at startup, before new runs are accepted. A run that cannot be
    /// re-driven is logged and left for the next recovery.
    pub async fn recover(&self) -> Result<Vec<WorkflowRun>> {
        let mut recovered = Vec::new();
        for run in self.runs.list_runs().await? {
            if !run.stage.is_active() {
                continue;
            }
            let run_id = run.run_id;
            warn!(run_id = %run_id, stage = %run.stage, "Re-driving interrupted run");
            match self.drive(run).await {
                Ok(run) => recovered.push(run),
                Err(e) => error!(run_id = %run_id, error = %e, "Error re-driving run"),
            }
        }
        Ok(recovered)
    }

    pub async fn run(&self, run_id: RunId) -> Result<Option<WorkflowRun>> {
        self.runs.get_run(run_id).await
    }

    async fn drive(&self, mut run: WorkflowRun) -> Result<WorkflowRun> {
        while run.stage.is_active() {
            let step = match run.stage {
                Stage::Extracting => self.extract(&mut run).await,
                Stage::Deciding => self.decide(&run).await,
                Stage::Charging => self.charge(&mut run).await,
                _ => break,
            };
            let applied = step.and_then(|step| match step {
                Step::Advance(next) => run.transition(next).map(|_| None),
                Step::Suspend(cause) => match cause.awaiting() {
                    Some(category) => run
                        .transition(category.awaiting_stage())
                        .map(|_| Some((category, cause))),
                    None => Err(cause),
                },
            });

            match applied {
                Ok(None) => self.runs.save_run(&run).await?,
                Ok(Some((category, cause))) => self.suspend(&mut run, category, &cause).await?,
                Err(e) => {
                    error!(
                        run_id = %run.run_id,
                        stage = %run.stage,
                        error = %e,
                        "Workflow run failed"
                    );
                    run.fail(e.to_string());
                    self.runs.save_run(&run).await?;
                }
            }
        }

        match run.stage {
            Stage::Succeeded => info!(
                run_id = %run.run_id,
                credit = run.final_credit,
                "Workflow run succeeded"
            ),
            Stage::Failed => {}
            stage => info!(run_id = %run.run_id, stage = %stage, "Workflow run suspended"),
        }
        Ok(run)
    }

    async fn extract(&self, run: &mut WorkflowRun) -> std::result::Result<Step, StageError> {
        let pattern = self.patterns.for_run().await;
        let object = &run.request.object;
        let (metadata, plate) = self
            .extraction_retry
            .run("Extracting", || self.extraction.extract(object, &pattern))
            .await?;
        run.event = Some(TollEvent::new(&run.request, metadata, plate));
        Ok(Step::Advance(Stage::Deciding))
    }

    async fn decide(&self, run: &WorkflowRun) -> std::result::Result<Step, StageError> {
        let plate = run.current_plate().ok_or_else(|| {
            StageError::GenericProcessing(format!("Run {} has no plate reading", run.run_id))
        })?;
        let charge = run.charge;
        let decision = self
            .decision_retry
            .run("Deciding", || self.decision.decide(plate, charge))
            .await?;

        Ok(match decision {
            ChargeDecision::ChargeApproved => Step::Advance(Stage::Charging),
            ChargeDecision::InsufficientCredit { credit } => {
                Step::Suspend(StageError::InsufficientCredit {
                    plate: plate.plate.clone(),
                    credit,
                    charge: charge.value(),
                })
            }
            ChargeDecision::UnknownPlate if plate.detected => {
                Step::Suspend(StageError::UnknownNumberPlate(plate.plate.clone()))
            }
            ChargeDecision::UnknownPlate => Step::Suspend(StageError::UnknownNumberPlate(format!(
                "no plate read from {}",
                run.request.object
            ))),
        })
    }

    async fn charge(&self, run: &mut WorkflowRun) -> std::result::Result<Step, StageError> {
        let plate = match run.current_plate() {
            Some(plate) if plate.detected => plate.plate.clone(),
            _ => {
                return Err(StageError::GenericProcessing(format!(
                    "Run {} reached charging without a number plate",
                    run.run_id
                )));
            }
        };
        let (charge, run_id) = (run.charge, run.run_id);
        let result = self
            .charging_retry
            .run("Charging", || self.charging.apply(&plate, charge, run_id))
            .await?;

        Ok(match result {
            ChargeResult::Charged { credit } => {
                run.final_credit = Some(credit);
                Step::Advance(Stage::Succeeded)
            }
            ChargeResult::PreconditionFailed { credit } => {
                Step::Suspend(StageError::InsufficientCredit {
                    plate,
                    credit,
                    charge: charge.value(),
                })
            }
        })
    }

    async fn suspend(
        &self,
        run: &mut WorkflowRun,
        category: ActivityCategory,
        cause: &StageError,
    ) -> Result<()> {
        let event = run.event.clone().ok_or_else(|| {
            TollError::Stage(StageError::GenericProcessing(format!(
                "Run {} suspended before extraction",
                run.run_id
            )))
        })?;
        let plate = run
            .current_plate()
            .cloned()
            .unwrap_or_else(|| event.plate.clone());
        let now = Utc::now();
        let expires_at = self
            .task_token_ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl));
        let token = TaskToken::generate();

        let task = PendingTask {
            token: token.clone(),
            run_id: run.run_id,
            category,
            event,
            plate,
            charge: run.charge,
            created_at: now,
            expires_at,
        };
        run.pending_task_token = Some(token);
        let queue = self.queue_for(category);
        self.runs.suspend(run, queue, task).await?;
        info!(
            run_id = %run.run_id,
            queue,
            category = %category,
            reason = %cause,
            "Workflow waiting on human activity"
        );
        Ok(())
    }
}
