use crate::domain::ledger::Charge;
use crate::domain::ports::LedgerStoreHandle;
use crate::domain::toll_event::PlateDetection;
use crate::error::StageError;
use rand::Rng;
use tracing::info;

/// What the read-side check concluded. The charge itself is re-validated
/// atomically when it is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeDecision {
    ChargeApproved,
    /// The balance read does not exceed the charge.
    InsufficientCredit { credit: u64 },
    /// Nothing was read, or the plate is not registered.
    UnknownPlate,
}

/// Deliberate transient failures used to exercise stage retry policies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultInjector {
    probability: f64,
}

impl FaultInjector {
    pub fn new(probability: f64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0.0)
    }

    pub fn check(&self) -> Result<(), StageError> {
        if self.probability > 0.0 && rand::thread_rng().gen_bool(self.probability) {
            Err(StageError::RandomProcessing(
                "Congratulations! A random processing error occurred!".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

pub struct ChargeDecisionStage {
    ledger: LedgerStoreHandle,
    faults: FaultInjector,
}

impl ChargeDecisionStage {
    pub fn new(ledger: LedgerStoreHandle, faults: FaultInjector) -> Self {
        Self { ledger, faults }
    }

    pub async fn decide(
        &self,
        plate: &PlateDetection,
        charge: Charge,
    ) -> Result<ChargeDecision, StageError> {
        self.faults.check()?;

        if !plate.detected {
            return Ok(ChargeDecision::UnknownPlate);
        }

        let record = self
            .ledger
            .get(&plate.plate)
            .await
            .map_err(|e| {
                StageError::DatabaseAccess(format!(
                    "An error occurred while accessing the database for number plate {}: {}",
                    plate.plate, e
                ))
            })?;

        let Some(record) = record else {
            info!(plate = %plate.plate, "Number plate not registered, manual resolution required");
            return Ok(ChargeDecision::UnknownPlate);
        };

        if record.credit > charge.value() {
            info!(
                plate = %record.plate,
                owner = %record.owner_name(),
                credit = record.credit,
                "Number plate found with sufficient credit"
            );
            Ok(ChargeDecision::ChargeApproved)
        } else {
            info!(
                plate = %record.plate,
                owner = %record.owner_name(),
                credit = record.credit,
                charge = charge.value(),
                "Insufficient credit"
            );
            Ok(ChargeDecision::InsufficientCredit {
                credit: record.credit,
            })
        }
    }
}
