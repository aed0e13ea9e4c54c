use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;

use crate::attribution::store::{AttributionStore, AttributionStoreError};
use crate::attribution::types::AttributionRecord;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttributionError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl AttributionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::Storage(_) => "storage_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::InvalidRequest(message)
            | Self::StorageUnavailable(message)
            | Self::Storage(message) => message.clone(),
        }
    }
}

impl From<AttributionStoreError> for AttributionError {
    fn from(error: AttributionStoreError) -> Self {
        match error {
            AttributionStoreError::StorageUnavailable(message) => {
                Self::StorageUnavailable(message)
            }
            AttributionStoreError::Storage(message) => Self::Storage(message),
        }
    }
}

#[derive(Clone)]
pub struct AttributionService {
    store: Arc<dyn AttributionStore>,
    allowed_variants: HashSet<String>,
    default_device_type: String,
}

impl AttributionService {
    pub fn new(
        store: Arc<dyn AttributionStore>,
        allowed_variants: HashSet<String>,
        default_device_type: String,
    ) -> Self {
        Self {
            store,
            allowed_variants: allowed_variants
                .into_iter()
                .map(|variant| normalize_tag(&variant))
                .filter(|variant| !variant.is_empty())
                .collect(),
            default_device_type,
        }
    }

    pub fn driver_name(&self) -> &'static str {
        self.store.driver_name()
    }

    /// Records the campaign variant shown to `device_key`, replacing any
    /// pending attribution for the same device.
    pub async fn record_visit(
        &self,
        device_key: &str,
        variant: &str,
        deadline: Instant,
    ) -> Result<AttributionRecord, AttributionError> {
        let device_key = require_device_key(device_key)?;
        let variant = self.require_known_variant(variant)?;
        self.write(AttributionRecord::new(device_key, variant), deadline)
            .await
    }

    /// Records an "app not installed" visit. The in-app target doubles as the
    /// variant so the app can route on it after install.
    pub async fn record_app_visit(
        &self,
        device_key: &str,
        target: &str,
        device_type: Option<&str>,
        deadline: Instant,
    ) -> Result<AttributionRecord, AttributionError> {
        let device_key = require_device_key(device_key)?;
        let target = target.trim();
        if target.is_empty() {
            return Err(AttributionError::InvalidRequest(
                "target is required".to_string(),
            ));
        }
        let device_type = device_type
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(self.default_device_type.as_str());

        let record = AttributionRecord::new(device_key, target)
            .with_target(Some(target.to_string()))
            .with_device_type(Some(device_type.to_string()));
        self.write(record, deadline).await
    }

    pub async fn resolve_visit(
        &self,
        device_key: &str,
        deadline: Instant,
    ) -> Result<Option<AttributionRecord>, AttributionError> {
        let device_key = require_device_key(device_key)?;
        bounded(deadline, self.store.resolve_visit(device_key)).await
    }

    pub async fn ping(&self, deadline: Instant) -> Result<(), AttributionError> {
        bounded(deadline, self.store.ping()).await
    }

    async fn write(
        &self,
        record: AttributionRecord,
        deadline: Instant,
    ) -> Result<AttributionRecord, AttributionError> {
        bounded(deadline, self.store.record_visit(record.clone())).await?;
        Ok(record)
    }

    fn require_known_variant(&self, variant: &str) -> Result<String, AttributionError> {
        let variant = normalize_tag(variant);
        if variant.is_empty() {
            return Err(AttributionError::InvalidRequest(
                "pill is required".to_string(),
            ));
        }
        if !self.allowed_variants.contains(&variant) {
            return Err(AttributionError::InvalidRequest(format!(
                "unknown pill {variant:?}"
            )));
        }
        Ok(variant)
    }
}

fn require_device_key(device_key: &str) -> Result<&str, AttributionError> {
    let device_key = device_key.trim();
    if device_key.is_empty() {
        return Err(AttributionError::InvalidRequest(
            "device key is required".to_string(),
        ));
    }
    Ok(device_key)
}

fn normalize_tag(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

// An expired deadline never reaches storage; an in-flight call that outlives
// it is dropped and reported as unavailable.
async fn bounded<T>(
    deadline: Instant,
    call: impl Future<Output = Result<T, AttributionStoreError>>,
) -> Result<T, AttributionError> {
    if Instant::now() >= deadline {
        return Err(AttributionError::StorageUnavailable(
            "request deadline exceeded before storage call".to_string(),
        ));
    }
    match tokio::time::timeout_at(deadline, call).await {
        Ok(result) => result.map_err(AttributionError::from),
        Err(_) => Err(AttributionError::StorageUnavailable(
            "request deadline exceeded during storage call".to_string(),
        )),
    }
}
