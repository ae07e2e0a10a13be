//! CSV formats used by the command line: ledger seeds, inbound image events
//! and the run/ledger reports written to stdout.

pub mod event_reader;
pub mod ledger_reader;
pub mod writer;

fn reader_builder() -> csv::ReaderBuilder {
    let mut builder = csv::ReaderBuilder::new();
    builder.trim(csv::Trim::All).flexible(true);
    builder
}
