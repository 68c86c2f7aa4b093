use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Event name (or category) that marks a custom event as an identify call.
pub const IDENTIFY_EVENT: &str = "identify";

/// Device, browser and geo attributes captured by the ingestion boundary.
///
/// Copied onto the session when it is created; later rows never overwrite it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_type: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub country: Option<String>,
}

/// Identity signals an identify-class event may carry.
///
/// A fixed shape instead of an open JSON map so signal extraction stays typed.
/// Stored as a JSON string in the `data` column of the events table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySignals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl IdentitySignals {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.user_id.is_none() && self.phone.is_none()
    }

    /// Parse the stored JSON form. Unknown or malformed payloads yield no signals.
    pub fn from_json(raw: Option<&str>) -> Self {
        raw.and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }

    pub fn to_json(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            serde_json::to_string(self).ok()
        }
    }

    /// Fold `other` into `self`, keeping values already present.
    pub fn fill_from(&mut self, other: &IdentitySignals) {
        if self.email.is_none() {
            self.email = other.email.clone();
        }
        if self.user_id.is_none() {
            self.user_id = other.user_id.clone();
        }
        if self.phone.is_none() {
            self.phone = other.phone.clone();
        }
    }
}

/// Payload of one raw tracking row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackingPayload {
    Pageview {
        url: String,
        referrer: Option<String>,
    },
    Event {
        /// Page the event fired on.
        url: String,
        name: String,
        category: Option<String>,
        action: Option<String>,
        label: Option<String>,
        value: Option<f64>,
        #[serde(default)]
        data: IdentitySignals,
    },
}

/// An already-validated, site-attributed row handed over by the ingestion boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingRow {
    pub site_id: i64,
    pub fingerprint: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub device: DeviceInfo,
    pub payload: TrackingPayload,
}

impl TrackingRow {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.fingerprint.trim().is_empty() {
            return Err(EngineError::Validation("fingerprint is required".into()));
        }
        match &self.payload {
            TrackingPayload::Pageview { url, .. } if url.trim().is_empty() => {
                Err(EngineError::Validation("pageview url is required".into()))
            }
            TrackingPayload::Event { url, .. } if url.trim().is_empty() => {
                Err(EngineError::Validation("event url is required".into()))
            }
            TrackingPayload::Event { name, .. } if name.trim().is_empty() => {
                Err(EngineError::Validation("event name is required".into()))
            }
            _ => Ok(()),
        }
    }

    /// The page this row happened on.
    pub fn url(&self) -> &str {
        match &self.payload {
            TrackingPayload::Pageview { url, .. } | TrackingPayload::Event { url, .. } => url,
        }
    }

    pub fn is_pageview(&self) -> bool {
        matches!(self.payload, TrackingPayload::Pageview { .. })
    }
}

/// A stored pageview, tied to exactly one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageviewEvent {
    pub id: String,
    pub session_id: String,
    pub site_id: i64,
    pub url: String,
    pub referrer: Option<String>,
    /// Fingerprint this row was re-owned from by a merge, if any.
    pub merged_from: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A stored custom event, tied to exactly one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomEvent {
    pub id: String,
    pub session_id: String,
    pub site_id: i64,
    pub url: String,
    pub name: String,
    pub category: Option<String>,
    pub action: Option<String>,
    pub label: Option<String>,
    pub value: Option<f64>,
    pub data: IdentitySignals,
    pub merged_from: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CustomEvent {
    pub fn is_identify(&self) -> bool {
        self.name.eq_ignore_ascii_case(IDENTIFY_EVENT)
            || self
                .category
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(IDENTIFY_EVENT))
    }
}
