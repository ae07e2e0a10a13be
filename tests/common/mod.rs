#![allow(dead_code)]

use std::sync::Arc;
use tollgantry::application::orchestrator::{Collaborators, TollWorkflow};
use tollgantry::application::plate_pattern::PlatePatternProvider;
use tollgantry::application::poller::ActivityPoller;
use tollgantry::application::retry::RetryPolicy;
use tollgantry::config::Config;
use tollgantry::domain::ledger::{Charge, LedgerRecord};
use tollgantry::domain::plate_pattern::PLATE_PATTERN_PROPERTY;
use tollgantry::domain::ports::LedgerStore;
use tollgantry::domain::toll_event::{ObjectRef, TextDetection, TollRequest};
use tollgantry::infrastructure::in_memory::{
    InMemoryLedgerStore, InMemoryObjectStorage, InMemorySecretStore, InMemoryTextDetector,
    InMemoryWorkflowStore, RecordingMailer,
};

pub const PLATE_REGEX: &str = r"([A-Z]{3})[ -]?([0-9]{3})";
pub const OPERATOR: &str = "operator@example.com";
pub const BUCKET: &str = "gantry";

/// A whole deployment wired to in-memory adapters.
pub struct Harness {
    pub workflow: Arc<TollWorkflow>,
    pub poller: ActivityPoller,
    pub storage: Arc<InMemoryObjectStorage>,
    pub detector: Arc<InMemoryTextDetector>,
    pub ledger: Arc<InMemoryLedgerStore>,
    pub runs: Arc<InMemoryWorkflowStore>,
    pub mailer: Arc<RecordingMailer>,
    pub config: Config,
}

/// Defaults with an operator address and retries that do not sleep.
pub fn test_config() -> Config {
    Config {
        operator_email: Some(OPERATOR.to_string()),
        retry: RetryPolicy::immediate(3),
        ..Config::default()
    }
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

async fn patterns(config: &Config) -> Arc<PlatePatternProvider> {
    let secrets = Arc::new(InMemorySecretStore::new());
    secrets.set_property(&config.secret_id, PLATE_PATTERN_PROPERTY, PLATE_REGEX);
    let provider = PlatePatternProvider::load(
        secrets,
        config.secret_id.clone(),
        config.pattern_refresh_runs,
    )
    .await
    .unwrap();
    Arc::new(provider)
}

pub async fn harness_with(config: Config) -> Harness {
    let storage = Arc::new(InMemoryObjectStorage::new());
    let detector = Arc::new(InMemoryTextDetector::new());
    let ledger = Arc::new(InMemoryLedgerStore::new());
    let runs = Arc::new(InMemoryWorkflowStore::new());
    let mailer = Arc::new(RecordingMailer::new());
    let collaborators = Collaborators {
        storage: storage.clone(),
        detector: detector.clone(),
        ledger: ledger.clone(),
        runs: runs.clone(),
        mailer: mailer.clone(),
    };

    Harness {
        workflow: Arc::new(TollWorkflow::new(
            &collaborators,
            patterns(&config).await,
            &config,
        )),
        poller: ActivityPoller::from_config(&collaborators, &config),
        storage,
        detector,
        ledger,
        runs,
        mailer,
        config,
    }
}

impl Harness {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            storage: self.storage.clone(),
            detector: self.detector.clone(),
            ledger: self.ledger.clone(),
            runs: self.runs.clone(),
            mailer: self.mailer.clone(),
        }
    }

    /// A second workflow instance over the same stores, as another process
    /// would build it.
    pub async fn fresh_workflow(&self) -> TollWorkflow {
        TollWorkflow::new(&self.collaborators(), patterns(&self.config).await, &self.config)
    }

    pub async fn register(&self, plate: &str, credit: u64) {
        let record = LedgerRecord::new(plate, credit).with_owner(
            "Jane",
            "Doe",
            format!("{}@owners.example.com", plate.to_lowercase()),
        );
        self.ledger.upsert(record).await.unwrap();
    }

    pub async fn credit(&self, plate: &str) -> u64 {
        self.ledger.get(plate).await.unwrap().unwrap().credit
    }

    /// Stores an image whose detector output is `lines`.
    pub fn capture(&self, key: &str, lines: Vec<TextDetection>) -> TollRequest {
        self.storage.put_object(BUCKET, key, "image/jpeg", 2048);
        self.detector.set_detections(BUCKET, key, lines);
        TollRequest {
            object: ObjectRef::new(BUCKET, key),
            charge: Charge::new(5).unwrap(),
        }
    }

    /// An image with one clearly readable plate line.
    pub fn capture_plate(&self, key: &str, text: &str) -> TollRequest {
        self.capture(key, vec![TextDetection::line(text, 98.5)])
    }
}

/// A data directory laid out for the command line: one bucket of images with
/// detection sidecars, a secrets file, a ledger and an events file.
///
/// | image            | detections          | ledger credit |
/// |------------------|---------------------|---------------|
/// | `cam1/0001.jpg`  | `ABC 123` at 99%    | 20            |
/// | `cam1/0002.jpg`  | nothing readable    |               |
/// | `cam1/0003.jpg`  | `XYZ-789` at 97%    | 3             |
/// | `cam1/0004.jpg`  | image missing       |               |
pub fn data_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let bucket = root.join(BUCKET).join("cam1");
    std::fs::create_dir_all(&bucket).unwrap();

    let images: [(&str, &str); 3] = [
        ("0001.jpg", r#"[{"text": "ABC 123", "type": "LINE", "confidence": 99.0}]"#),
        ("0002.jpg", r#"[{"text": "TOLL", "type": "LINE", "confidence": 99.0}]"#),
        ("0003.jpg", r#"[{"text": "XYZ-789", "type": "LINE", "confidence": 97.0}]"#),
    ];
    for (name, detections) in images {
        std::fs::write(bucket.join(name), [0xFFu8, 0xD8, 0xFF]).unwrap();
        std::fs::write(bucket.join(format!("{}.detections.json", name)), detections).unwrap();
    }

    std::fs::write(
        root.join("secrets.json"),
        serde_json::json!({
            "/Staging/tollgantry/Metadata": { "NumberPlateRegEx": PLATE_REGEX }
        })
        .to_string(),
    )
    .unwrap();
    std::fs::write(
        root.join("ledger.csv"),
        "plate,first_name,last_name,email,credit\n\
         ABC123,Jane,Doe,jane@example.com,20\n\
         XYZ789,John,Roe,john@example.com,3\n",
    )
    .unwrap();
    std::fs::write(
        root.join("events.csv"),
        "bucket,key,charge\n\
         gantry,cam1/0001.jpg,\n\
         gantry,cam1/0002.jpg,\n\
         gantry,cam1/0003.jpg,\n\
         gantry,cam1/0004.jpg,\n",
    )
    .unwrap();
    dir
}

/// Emails written to the outbox, oldest first.
pub fn outbox(root: &std::path::Path) -> Vec<tollgantry::domain::ports::EmailMessage> {
    let Ok(entries) = std::fs::read_dir(root.join("outbox")) else {
        return Vec::new();
    };
    let mut paths: Vec<_> = entries.map(|e| e.unwrap().path()).collect();
    paths.sort();
    paths
        .into_iter()
        .map(|p| serde_json::from_slice(&std::fs::read(p).unwrap()).unwrap())
        .collect()
}

/// Pulls the task token out of a resumption link in an email body.
pub fn task_token(html: &str) -> String {
    let start = html.find("taskToken=").unwrap() + "taskToken=".len();
    html[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Writes an events file billing the same readable image `rows` times.
pub fn generate_events(path: &std::path::Path, rows: usize) -> Result<(), std::io::Error> {
    let mut wtr = csv::WriterBuilder::new().from_path(path)?;
    wtr.write_record(["bucket", "key", "charge"])?;
    for _ in 0..rows {
        wtr.write_record([BUCKET, "cam1/0001.jpg", "1"])?;
    }
    wtr.flush()?;
    Ok(())
}
