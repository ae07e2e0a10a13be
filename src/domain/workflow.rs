use super::ledger::Charge;
use super::toll_event::{PlateDetection, TollEvent, TollRequest};
use crate::error::StageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Opaque capability to resume one suspended run, once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskToken(String);

impl TaskToken {
    pub fn generate() -> Self {
        Self(format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The kinds of human work a run can be suspended on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityCategory {
    ManualPlateInspection,
    InsufficientCredit,
}

impl ActivityCategory {
    pub const ALL: [ActivityCategory; 2] = [
        ActivityCategory::ManualPlateInspection,
        ActivityCategory::InsufficientCredit,
    ];

    /// The stage a run sits in while waiting on this category.
    pub fn awaiting_stage(self) -> Stage {
        match self {
            ActivityCategory::ManualPlateInspection => Stage::AwaitingManualPlateReview,
            ActivityCategory::InsufficientCredit => Stage::AwaitingCreditTopUp,
        }
    }

    /// The stage a run re-enters once the human has answered.
    pub fn resume_stage(self) -> Stage {
        match self {
            ActivityCategory::ManualPlateInspection => Stage::Deciding,
            ActivityCategory::InsufficientCredit => Stage::Charging,
        }
    }
}

impl fmt::Display for ActivityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityCategory::ManualPlateInspection => f.write_str("ManualPlateInspection"),
            ActivityCategory::InsufficientCredit => f.write_str("InsufficientCredit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Extracting,
    Deciding,
    Charging,
    Succeeded,
    AwaitingCreditTopUp,
    AwaitingManualPlateReview,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Succeeded | Stage::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Stage::Extracting | Stage::Deciding | Stage::Charging)
    }

    pub fn awaiting(self) -> Option<ActivityCategory> {
        match self {
            Stage::AwaitingManualPlateReview => Some(ActivityCategory::ManualPlateInspection),
            Stage::AwaitingCreditTopUp => Some(ActivityCategory::InsufficientCredit),
            _ => None,
        }
    }

    /// The transition table of the billing state machine.
    pub fn can_transition_to(self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (Extracting, Deciding) => true,
            (Deciding, Charging) => true,
            (Deciding, AwaitingManualPlateReview) => true,
            (Deciding, AwaitingCreditTopUp) => true,
            (Charging, Succeeded) => true,
            (Charging, AwaitingCreditTopUp) => true,
            (AwaitingCreditTopUp, Charging) => true,
            (AwaitingManualPlateReview, Deciding) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A human's answer to a suspended run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResumeInput {
    /// The reviewer read the plate; optionally overrides the proposed charge.
    PlateReviewed {
        plate: String,
        charge: Option<Charge>,
    },
    /// The owner has added credit; the charge should be attempted again.
    CreditToppedUp,
}

impl ResumeInput {
    pub fn category(&self) -> ActivityCategory {
        match self {
            ResumeInput::PlateReviewed { .. } => ActivityCategory::ManualPlateInspection,
            ResumeInput::CreditToppedUp => ActivityCategory::InsufficientCredit,
        }
    }
}

/// Work waiting for a human, as handed to the notification handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTask {
    pub token: TaskToken,
    pub run_id: RunId,
    pub category: ActivityCategory,
    pub event: TollEvent,
    /// The reading the run was deciding on when it suspended.
    pub plate: PlateDetection,
    pub charge: Charge,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PendingTask {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// Durable state of one billing workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: RunId,
    pub stage: Stage,
    pub request: TollRequest,
    /// Set once extraction has completed.
    pub event: Option<TollEvent>,
    /// Reviewer corrections, oldest first.
    pub corrections: Vec<PlateDetection>,
    pub charge: Charge,
    pub pending_task_token: Option<TaskToken>,
    pub final_credit: Option<u64>,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(request: TollRequest) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::new(),
            stage: Stage::Extracting,
            charge: request.charge,
            request,
            event: None,
            corrections: Vec::new(),
            pending_task_token: None,
            final_credit: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The reading billing currently relies on: the latest correction, else
    /// the machine reading.
    pub fn current_plate(&self) -> Option<&PlateDetection> {
        self.corrections
            .last()
            .or_else(|| self.event.as_ref().map(|event| &event.plate))
    }

    pub fn transition(&mut self, next: Stage) -> Result<(), StageError> {
        if !self.stage.can_transition_to(next) {
            return Err(StageError::GenericProcessing(format!(
                "Illegal transition {} -> {} for run {}",
                self.stage, next, self.run_id
            )));
        }
        self.stage = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.stage = Stage::Failed;
        self.failure = Some(reason.into());
        self.pending_task_token = None;
        self.updated_at = Utc::now();
    }
}
