mod common;

use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

fn tollgantry(data_dir: &std::path::Path) -> Command {
    let mut cmd = Command::new(cargo_bin!("tollgantry"));
    cmd.env_remove("RUST_LOG")
        .env("TOLL_OPERATOR_EMAIL", "ops@example.com")
        .env("TOLL_RETRY_INTERVAL_MS", "0")
        .arg("--data-dir")
        .arg(data_dir);
    cmd
}

#[test]
fn test_cli_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let dir = common::data_dir();
    let root = dir.path();

    tollgantry(root)
        .arg("process")
        .arg(root.join("events.csv"))
        .arg("--ledger")
        .arg(root.join("ledger.csv"))
        .assert()
        .success()
        .stdout(predicate::str::starts_with(
            "run_id,bucket,key,plate,stage,charge,credit,failure\n",
        ))
        .stdout(predicate::str::contains(
            ",gantry,cam1/0001.jpg,ABC123,Succeeded,5,15,\n",
        ))
        .stdout(predicate::str::contains(
            ",gantry,cam1/0002.jpg,,AwaitingManualPlateReview,5,,\n",
        ))
        .stdout(predicate::str::contains(
            ",gantry,cam1/0003.jpg,XYZ789,AwaitingCreditTopUp,5,,\n",
        ))
        .stdout(predicate::str::contains(",gantry,cam1/0004.jpg,,Failed,5,,"))
        .stdout(predicate::str::contains("Extraction failure"));

    let sent = common::outbox(root);
    assert_eq!(sent.len(), 2);
    let mut recipients: Vec<_> = sent.iter().map(|m| m.to.as_str()).collect();
    recipients.sort();
    assert_eq!(recipients, ["john@example.com", "ops@example.com"]);

    Ok(())
}

#[test]
fn test_malformed_event_rows_are_skipped() {
    let dir = common::data_dir();
    let root = dir.path();
    std::fs::write(
        root.join("events.csv"),
        "bucket,key,charge\ngantry,cam1/0001.jpg,0\ngantry,cam1/0001.jpg,lots\ngantry,cam1/0001.jpg,7\n",
    )
    .unwrap();

    tollgantry(root)
        .arg("process")
        .arg(root.join("events.csv"))
        .arg("--ledger")
        .arg(root.join("ledger.csv"))
        .assert()
        .success()
        .stderr(predicate::str::contains("Error reading event"))
        .stdout(predicate::str::contains(",ABC123,Succeeded,7,13,"));
}

#[test]
fn test_missing_secrets_file_is_an_error() {
    let dir = common::data_dir();
    let root = dir.path();
    std::fs::remove_file(root.join("secrets.json")).unwrap();

    tollgantry(root)
        .arg("process")
        .arg(root.join("events.csv"))
        .assert()
        .failure();
}

#[test]
fn test_unknown_task_token_is_rejected() {
    let dir = common::data_dir();

    tollgantry(dir.path())
        .args(["resume", "deadbeef", "--topped-up"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Task token rejected"));
}

#[test]
fn test_resume_requires_an_answer() {
    let dir = common::data_dir();

    tollgantry(dir.path())
        .args(["resume", "deadbeef"])
        .assert()
        .failure();
    tollgantry(dir.path())
        .args(["resume", "deadbeef", "--plate", "ABC123", "--topped-up"])
        .assert()
        .failure();
}

#[test]
fn test_poll_once_on_empty_queues() {
    let dir = common::data_dir();

    tollgantry(dir.path())
        .args(["poll", "--once"])
        .assert()
        .success()
        .stdout(predicate::str::diff(
            "queue,outcome,run_id,detail\nManualPlateInspection,idle,,\nInsufficientCredit,idle,,\n",
        ));
}

#[test]
fn test_seed_reports_progress() {
    let dir = common::data_dir();
    let root = dir.path();

    tollgantry(root)
        .arg("seed")
        .arg(root.join("ledger.csv"))
        .assert()
        .success()
        .stderr(predicate::str::contains("Ledger seeded"));
}
