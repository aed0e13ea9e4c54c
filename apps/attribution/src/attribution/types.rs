use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The pending attribution for one device. At most one exists per
/// `device_key`; a newer visit replaces every column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionRecord {
    pub device_key: String,
    pub variant: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AttributionRecord {
    pub fn new(device_key: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            device_key: device_key.into(),
            variant: variant.into(),
            target: None,
            device_type: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_target(mut self, target: Option<String>) -> Self {
        self.target = target;
        self
    }

    pub fn with_device_type(mut self, device_type: Option<String>) -> Self {
        self.device_type = device_type;
        self
    }
}

/// Service-to-service record request (`POST /deferDeepLink`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeferDeepLinkRequest {
    #[serde(alias = "user_ip")]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordVisitResponse {
    pub status: String,
    pub device_key: String,
    pub variant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl RecordVisitResponse {
    pub fn recorded(record: &AttributionRecord) -> Self {
        Self {
            status: "recorded".to_string(),
            device_key: record.device_key.clone(),
            variant: record.variant.clone(),
            target: record.target.clone(),
        }
    }
}

/// Lookup result. `variant` is `None` when no attribution is pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveVisitResponse {
    pub device_key: String,
    pub variant: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ResolveVisitResponse {
    pub fn from_lookup(device_key: String, record: Option<AttributionRecord>) -> Self {
        match record {
            Some(record) => Self {
                device_key: record.device_key,
                variant: Some(record.variant),
                target: record.target,
                device_type: record.device_type,
                updated_at: Some(record.updated_at),
            },
            None => Self {
                device_key,
                variant: None,
                target: None,
                device_type: None,
                updated_at: None,
            },
        }
    }
}
