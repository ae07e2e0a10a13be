use crate::domain::plate_pattern::{PLATE_PATTERN_PROPERTY, PlatePattern};
use crate::domain::ports::SecretStoreHandle;
use crate::error::{Result, TollError};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

struct Loaded {
    pattern: Arc<PlatePattern>,
    runs_since_load: u32,
}

/// Hands out the plate pattern held in the secret store.
///
/// The pattern is loaded explicitly by [`PlatePatternProvider::load`] and
/// handed to each run as an immutable snapshot. It is reloaded after
/// `refresh_every` runs when set, or on [`PlatePatternProvider::refresh`].
/// A failed reload keeps serving the previous pattern.
pub struct PlatePatternProvider {
    secrets: SecretStoreHandle,
    secret_id: String,
    refresh_every: Option<u32>,
    current: RwLock<Loaded>,
}

impl PlatePatternProvider {
    pub async fn load(
        secrets: SecretStoreHandle,
        secret_id: impl Into<String>,
        refresh_every: Option<u32>,
    ) -> Result<Self> {
        let secret_id = secret_id.into();
        let pattern = fetch(&secrets, &secret_id).await?;
        info!(secret_id = %secret_id, pattern = pattern.as_str(), "Loaded plate pattern");
        Ok(Self {
            secrets,
            secret_id,
            refresh_every,
            current: RwLock::new(Loaded {
                pattern: Arc::new(pattern),
                runs_since_load: 0,
            }),
        })
    }

    /// Snapshot for one run. Counts towards the refresh interval.
    pub async fn for_run(&self) -> Arc<PlatePattern> {
        let due = {
            let mut current = self.current.write().await;
            current.runs_since_load += 1;
            self.refresh_every
                .is_some_and(|every| every > 0 && current.runs_since_load > every)
        };
        if due && let Err(e) = self.refresh().await {
            warn!(error = %e, "Plate pattern refresh failed, keeping previous pattern");
            self.current.write().await.runs_since_load = 1;
        }
        self.current.read().await.pattern.clone()
    }

    pub async fn current(&self) -> Arc<PlatePattern> {
        self.current.read().await.pattern.clone()
    }

    pub async fn refresh(&self) -> Result<Arc<PlatePattern>> {
        let pattern = Arc::new(fetch(&self.secrets, &self.secret_id).await?);
        let mut current = self.current.write().await;
        if current.pattern.as_str() != pattern.as_str() {
            info!(
                previous = current.pattern.as_str(),
                pattern = pattern.as_str(),
                "Plate pattern changed"
            );
        }
        current.pattern = pattern.clone();
        current.runs_since_load = 1;
        Ok(pattern)
    }
}

async fn fetch(secrets: &SecretStoreHandle, secret_id: &str) -> Result<PlatePattern> {
    let bag = secrets.property_bag(secret_id).await?;
    let source = bag
        .get(PLATE_PATTERN_PROPERTY)
        .and_then(|value| value.as_str())
        .ok_or_else(|| {
            TollError::Config(format!(
                "Secret '{}' has no string property '{}'",
                secret_id, PLATE_PATTERN_PROPERTY
            ))
        })?;
    PlatePattern::new(source)
}
