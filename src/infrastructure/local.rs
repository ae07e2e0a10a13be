//! Filesystem-backed adapters for running the workflow on one machine.
//!
//! Buckets are directories under a data root. An image's text detections are
//! read from a JSON sidecar next to it, and outgoing mail is written to an
//! outbox directory instead of being sent.

use crate::domain::ports::{EmailMessage, EmailSender, ObjectStorage, SecretStore, TextDetector};
use crate::domain::toll_event::{ObjectMetadata, TextDetection};
use crate::error::{Result, TollError};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Suffix of the detection sidecar written next to an image.
pub const DETECTIONS_SUFFIX: &str = ".detections.json";

fn object_path(root: &Path, bucket: &str, key: &str) -> Result<PathBuf> {
    let relative = Path::new(bucket).join(key);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if bucket.is_empty() || key.is_empty() || escapes {
        return Err(TollError::Storage(format!(
            "Invalid object location {}/{}",
            bucket, key
        )));
    }
    Ok(root.join(relative))
}

fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        _ => "application/octet-stream",
    }
}

fn not_found(what: &str, path: &Path) -> TollError {
    TollError::Storage(format!("NotFound: {} {}", what, path.display()))
}

#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        let path = object_path(&self.root, bucket, key)?;
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => not_found("object", &path),
            _ => TollError::Io(e),
        })?;
        if !metadata.is_file() {
            return Err(not_found("object", &path));
        }
        Ok(ObjectMetadata {
            content_type: content_type_for(&path).to_string(),
            content_length: metadata.len(),
        })
    }

    async fn presigned_get(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String> {
        let path = object_path(&self.root, bucket, key)?;
        let path = tokio::fs::canonicalize(&path).await.unwrap_or(path);
        let expires = Utc::now().timestamp().saturating_add(ttl.as_secs() as i64);
        Ok(format!("file://{}?expires={}", path.display(), expires))
    }
}

/// Reads pre-computed detections from `<key>.detections.json`.
#[derive(Debug, Clone)]
pub struct SidecarTextDetector {
    root: PathBuf,
}

impl SidecarTextDetector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl TextDetector for SidecarTextDetector {
    async fn detect_text(&self, bucket: &str, key: &str) -> Result<Vec<TextDetection>> {
        let sidecar = format!("{}{}", key, DETECTIONS_SUFFIX);
        let path = object_path(&self.root, bucket, &sidecar)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => not_found("detections", &path),
            _ => TollError::Io(e),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Secrets from a JSON file: `{ "<secret id>": { "<property>": <value> } }`.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn property_bag(&self, secret_id: &str) -> Result<Map<String, Value>> {
        let bytes = tokio::fs::read(&self.path).await?;
        let mut secrets: Map<String, Value> = serde_json::from_slice(&bytes)?;
        match secrets.remove(secret_id) {
            Some(Value::Object(bag)) => Ok(bag),
            Some(_) => Err(TollError::Config(format!(
                "Secret {} is not a property bag",
                secret_id
            ))),
            None => Err(TollError::Config(format!(
                "Secret {} not found in {}",
                secret_id,
                self.path.display()
            ))),
        }
    }
}

/// Writes each message as a JSON file into an outbox directory.
#[derive(Debug, Clone)]
pub struct OutboxMailer {
    dir: PathBuf,
}

impl OutboxMailer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl EmailSender for OutboxMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let name = format!(
            "{}-{}.json",
            Utc::now().format("%Y%m%dT%H%M%S%3f"),
            Uuid::new_v4().simple()
        );
        let path = self.dir.join(name);
        tokio::fs::write(&path, serde_json::to_vec_pretty(message)?).await?;
        info!(to = %message.to, subject = %message.subject, path = %path.display(), "Email written to outbox");
        Ok(())
    }
}
