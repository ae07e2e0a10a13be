use crate::domain::ledger::{Charge, ChargeOutcome};
use crate::domain::ports::LedgerStoreHandle;
use crate::domain::workflow::RunId;
use crate::error::StageError;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeResult {
    /// The balance now reads `credit`.
    Charged { credit: u64 },
    /// Balance could not cover the charge at write time. Retrying without a
    /// top-up fails the same way.
    PreconditionFailed { credit: u64 },
}

/// Applies a toll through the ledger's conditional write.
///
/// The run id doubles as the idempotency key, so a charge re-delivered
/// after a crash is recognised rather than applied twice.
pub struct ConditionalLedgerUpdate {
    ledger: LedgerStoreHandle,
}

impl ConditionalLedgerUpdate {
    pub fn new(ledger: LedgerStoreHandle) -> Self {
        Self { ledger }
    }

    pub async fn apply(
        &self,
        plate: &str,
        charge: Charge,
        run_id: RunId,
    ) -> Result<ChargeResult, StageError> {
        let key = run_id.to_string();
        let outcome = self
            .ledger
            .charge_if_sufficient(plate, charge, &key)
            .await
            .map_err(|e| {
                StageError::DatabaseAccess(format!(
                    "An error occurred while updating account for number plate {}: {}",
                    plate, e
                ))
            })?;

        match outcome {
            ChargeOutcome::Applied { credit } => {
                info!(
                    plate,
                    charge = charge.value(),
                    credit,
                    "Charge deducted from credit"
                );
                Ok(ChargeResult::Charged { credit })
            }
            ChargeOutcome::AlreadyApplied { credit } => {
                info!(plate, run_id = %run_id, credit, "Charge already applied for this run");
                Ok(ChargeResult::Charged { credit })
            }
            ChargeOutcome::PreconditionFailed { credit } => {
                warn!(
                    plate,
                    charge = charge.value(),
                    credit,
                    "Conditional charge rejected, credit exhausted"
                );
                Ok(ChargeResult::PreconditionFailed { credit })
            }
            ChargeOutcome::NotFound => Err(StageError::InconsistentLedger(format!(
                "Number plate {} disappeared from the ledger after it was found",
                plate
            ))),
        }
    }
}
