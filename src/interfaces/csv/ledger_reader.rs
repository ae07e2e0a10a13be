use crate::domain::ledger::LedgerRecord;
use crate::error::{Result, TollError};
use std::io::Read;

/// Reads ledger records (`plate,first_name,last_name,email,credit`) from a
/// CSV source.
pub struct LedgerReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> LedgerReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            reader: super::reader_builder().from_reader(source),
        }
    }

    /// Lazily deserializes one record per row.
    pub fn records(self) -> impl Iterator<Item = Result<LedgerRecord>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(TollError::from))
    }
}
