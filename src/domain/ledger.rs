use crate::error::TollError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A positive toll amount.
///
/// Charges are whole currency units; a zero charge is rejected so that a
/// misconfigured gantry can never "succeed" without billing anyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Charge(u64);

/// The gantry's standard toll when none is configured.
pub const DEFAULT_CHARGE: Charge = Charge(5);

impl Charge {
    pub fn new(value: u64) -> Result<Self, TollError> {
        if value > 0 {
            Ok(Self(value))
        } else {
            Err(TollError::Config("Charge must be positive".to_string()))
        }
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl TryFrom<u64> for Charge {
    type Error = TollError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Charge> for u64 {
    fn from(charge: Charge) -> Self {
        charge.0
    }
}

impl fmt::Display for Charge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An owner's prepaid account, keyed by number plate.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct LedgerRecord {
    pub plate: String,
    #[serde(rename = "first_name")]
    pub owner_first_name: String,
    #[serde(rename = "last_name")]
    pub owner_last_name: String,
    #[serde(rename = "email")]
    pub owner_email: String,
    pub credit: u64,
}

impl LedgerRecord {
    pub fn new(plate: impl Into<String>, credit: u64) -> Self {
        Self {
            plate: plate.into(),
            owner_first_name: String::new(),
            owner_last_name: String::new(),
            owner_email: String::new(),
            credit,
        }
    }

    pub fn with_owner(
        mut self,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        self.owner_first_name = first_name.into();
        self.owner_last_name = last_name.into();
        self.owner_email = email.into();
        self
    }

    pub fn owner_name(&self) -> String {
        format!("{} {}", self.owner_first_name, self.owner_last_name)
            .trim()
            .to_string()
    }

    /// Applies `charge` if the balance covers it.
    ///
    /// This is the in-record half of the conditional update. Stores call it
    /// while holding whatever isolation they provide, never on a copy that
    /// was read earlier.
    pub fn try_charge(&mut self, charge: Charge) -> Result<u64, u64> {
        if self.credit >= charge.value() {
            self.credit -= charge.value();
            Ok(self.credit)
        } else {
            Err(self.credit)
        }
    }
}

/// Result of a conditional decrement against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargeOutcome {
    /// The charge was applied; `credit` is the post-update balance.
    Applied { credit: u64 },
    /// This idempotency key was already applied; nothing changed.
    AlreadyApplied { credit: u64 },
    /// `credit >= charge` did not hold at write time; nothing changed.
    PreconditionFailed { credit: u64 },
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_validation() {
        assert!(Charge::new(5).is_ok());
        assert!(matches!(Charge::new(0), Err(TollError::Config(_))));
    }

    #[test]
    fn test_try_charge_exact_balance() {
        let mut record = LedgerRecord::new("ABC123", 5);
        assert_eq!(record.try_charge(Charge::new(5).unwrap()), Ok(0));
        assert_eq!(record.credit, 0);
    }

    #[test]
    fn test_try_charge_insufficient_leaves_balance() {
        let mut record = LedgerRecord::new("ABC123", 3);
        assert_eq!(record.try_charge(Charge::new(5).unwrap()), Err(3));
        assert_eq!(record.credit, 3);
    }

    #[test]
    fn test_owner_name() {
        let record = LedgerRecord::new("ABC123", 3).with_owner("Jane", "Doe", "jane@example.com");
        assert_eq!(record.owner_name(), "Jane Doe");
        assert_eq!(LedgerRecord::new("X", 0).owner_name(), "");
    }
}
