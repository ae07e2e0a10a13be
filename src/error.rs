use crate::domain::workflow::ActivityCategory;
use thiserror::Error;

/// Failures a workflow stage can raise.
///
/// `InsufficientCredit` and `UnknownNumberPlate` are business outcomes that
/// route a run to a human; `DatabaseAccess` and `RandomProcessing` are
/// transient and retried by the stage's retry policy; everything else fails
/// the run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error("Extraction failure: {0}")]
    ExtractionFailure(String),
    #[error("Processing error: {0}")]
    GenericProcessing(String),
    #[error("Database access error: {0}")]
    DatabaseAccess(String),
    #[error("Insufficient credit for {plate}: credit {credit}, charge {charge}")]
    InsufficientCredit { plate: String, credit: u64, charge: u64 },
    #[error("Unknown number plate: {0}")]
    UnknownNumberPlate(String),
    #[error("Random processing error: {0}")]
    RandomProcessing(String),
    #[error("Ledger inconsistency: {0}")]
    InconsistentLedger(String),
}

impl StageError {
    /// Whether the orchestrator should re-invoke the stage.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StageError::DatabaseAccess(_) | StageError::RandomProcessing(_)
        )
    }

    /// The human activity that resolves a business outcome. `None` for
    /// faults.
    pub fn awaiting(&self) -> Option<ActivityCategory> {
        match self {
            StageError::InsufficientCredit { .. } => Some(ActivityCategory::InsufficientCredit),
            StageError::UnknownNumberPlate(_) => Some(ActivityCategory::ManualPlateInspection),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NotificationError {
    #[error("No email recipient configured: {0}")]
    NoRecipient(String),
    #[error("Internal Error: The email could not be sent: {0}")]
    SendFailed(String),
    #[error("No ledger record for number plate {0}")]
    RecordMissing(String),
    #[error("Lookup failed: {0}")]
    LookupFailed(String),
}

#[derive(Error, Debug)]
pub enum TollError {
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Notification(#[from] NotificationError),
    #[error("Task token rejected: {0}")]
    TaskTokenRejected(String),
    #[error("Invalid resume request: {0}")]
    InvalidResume(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDB(#[from] rocksdb::Error),
}

pub type Result<T> = std::result::Result<T, TollError>;
