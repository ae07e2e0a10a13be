use crate::application::poller::{PollOutcome, PollReport};
use crate::domain::ledger::LedgerRecord;
use crate::domain::workflow::WorkflowRun;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Serialize)]
struct RunRow<'a> {
    run_id: String,
    bucket: &'a str,
    key: &'a str,
    plate: &'a str,
    stage: String,
    charge: u64,
    credit: Option<u64>,
    failure: &'a str,
}

impl<'a> From<&'a WorkflowRun> for RunRow<'a> {
    fn from(run: &'a WorkflowRun) -> Self {
        let plate = run
            .current_plate()
            .filter(|plate| plate.detected)
            .map(|plate| plate.plate.as_str())
            .unwrap_or("");
        Self {
            run_id: run.run_id.to_string(),
            bucket: &run.request.object.bucket,
            key: &run.request.object.key,
            plate,
            stage: run.stage.to_string(),
            charge: run.charge.value(),
            credit: run.final_credit,
            failure: run.failure.as_deref().unwrap_or(""),
        }
    }
}

/// Writes workflow run summaries as
/// `run_id,bucket,key,plate,stage,charge,credit,failure`.
pub struct RunWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> RunWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_runs<'a>(&mut self, runs: impl IntoIterator<Item = &'a WorkflowRun>) -> Result<()> {
        for run in runs {
            self.writer.serialize(RunRow::from(run))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// Writes ledger records in the same layout the ledger reader accepts.
pub struct LedgerWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> LedgerWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_records(&mut self, records: impl IntoIterator<Item = LedgerRecord>) -> Result<()> {
        for record in records {
            self.writer.serialize(record)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct PollRow<'a> {
    queue: &'a str,
    outcome: &'static str,
    run_id: String,
    detail: String,
}

/// Writes one `queue,outcome,run_id,detail` row per polled queue.
pub struct PollWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> PollWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_report(&mut self, report: &PollReport) -> Result<()> {
        for poll in &report.polls {
            let row = match &poll.result {
                Ok(PollOutcome::Idle) => PollRow {
                    queue: &poll.queue,
                    outcome: "idle",
                    run_id: String::new(),
                    detail: String::new(),
                },
                Ok(PollOutcome::Notified {
                    run_id, recipient, ..
                }) => PollRow {
                    queue: &poll.queue,
                    outcome: "notified",
                    run_id: run_id.to_string(),
                    detail: recipient.clone(),
                },
                Err(e) => PollRow {
                    queue: &poll.queue,
                    outcome: "error",
                    run_id: String::new(),
                    detail: e.to_string(),
                },
            };
            self.writer.serialize(row)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
