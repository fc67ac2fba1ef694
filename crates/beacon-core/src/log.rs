// ABOUTME: Telemetry record types shipped by the delivery channel: Log, Device, and LogContainer.
// ABOUTME: Records serialize as flat JSON objects with their free-form properties inlined.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

/// A single telemetry record (event, error report, crash report).
///
/// Identity is the `id`; two records with identical content are still
/// distinct records. The channel fills `timestamp` and `device` when the
/// producer leaves them unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    pub id: Ulid,
    #[serde(rename = "type")]
    pub log_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl Log {
    /// Create a record of the given type with a fresh id and no metadata.
    pub fn new(log_type: impl Into<String>) -> Self {
        Self {
            id: Ulid::new(),
            log_type: log_type.into(),
            timestamp: None,
            device: None,
            properties: Map::new(),
        }
    }

    /// Builder-style helper to attach a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Device and application description attached to every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub sdk_name: String,
    pub sdk_version: String,
    pub os_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub locale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

impl Device {
    /// Describe the current process using compile-time and environment facts.
    pub fn current(app_version: Option<String>) -> Self {
        let locale = std::env::var("LC_ALL")
            .or_else(|_| std::env::var("LANG"))
            .ok()
            .and_then(|l| l.split('.').next().map(str::to_string))
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| "en_US".to_string());

        Self {
            sdk_name: "beacon.rust".to_string(),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            os_name: std::env::consts::OS.to_string(),
            os_version: None,
            model: Some(std::env::consts::ARCH.to_string()),
            locale,
            app_version,
        }
    }
}

/// Request body for one batch: `{"logs": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogContainer {
    pub logs: Vec<Log>,
}

impl LogContainer {
    pub fn new(logs: Vec<Log>) -> Self {
        Self { logs }
    }
}
