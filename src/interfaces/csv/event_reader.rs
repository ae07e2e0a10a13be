use crate::domain::ledger::Charge;
use crate::domain::toll_event::{ObjectRef, TollRequest};
use crate::error::{Result, TollError};
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize)]
struct EventRow {
    bucket: String,
    key: String,
    #[serde(default)]
    charge: Option<u64>,
}

/// Reads inbound image events (`bucket,key[,charge]`) from a CSV source.
pub struct EventReader<R: Read> {
    reader: csv::Reader<R>,
    default_charge: Charge,
}

impl<R: Read> EventReader<R> {
    /// Rows without a charge are billed `default_charge`.
    pub fn new(source: R, default_charge: Charge) -> Self {
        Self {
            reader: super::reader_builder().from_reader(source),
            default_charge,
        }
    }

    pub fn requests(self) -> impl Iterator<Item = Result<TollRequest>> {
        let default_charge = self.default_charge;
        self.reader.into_deserialize().map(move |row| {
            let row: EventRow = row?;
            if row.bucket.is_empty() || row.key.is_empty() {
                return Err(TollError::Config(
                    "Event rows need both a bucket and a key".to_string(),
                ));
            }
            let charge = match row.charge {
                Some(value) => Charge::new(value)?,
                None => default_charge,
            };
            Ok(TollRequest {
                object: ObjectRef::new(row.bucket, row.key),
                charge,
            })
        })
    }
}
