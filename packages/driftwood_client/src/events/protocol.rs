//! Update-channel event types.
//!
//! The server pushes SSE frames; the `event:` field names the payload kind,
//! the `id:` field carries the ordinal resumption cursor, and `data:` is a
//! JSON payload. [`UpdateEvent`] is the parsed envelope handed to
//! subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire names of the event kinds the client consumes.
pub const EVENT_PRESENCE: &str = "presence";
pub const EVENT_ITEM_UPDATED: &str = "item-updated";
pub const EVENT_METRICS_UPDATED: &str = "metrics-updated";

/// One event from the update channel: the resumption cursor (when the frame
/// carried an `id:` line) plus the typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub cursor: Option<String>,
    #[serde(flatten)]
    pub payload: UpdatePayload,
}

/// Typed payloads for the event kinds the client consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UpdatePayload {
    /// Who is currently viewing/editing a gallery.
    #[serde(rename = "presence")]
    Presence(PresenceUpdate),
    /// An item's metadata changed.
    #[serde(rename = "item-updated")]
    ItemUpdated(ItemUpdate),
    /// An item's metrics were recomputed without a metadata edit.
    #[serde(rename = "metrics-updated")]
    MetricsUpdated(MetricsUpdate),
}

/// Presence roster for one gallery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub gallery_id: String,
    #[serde(default)]
    pub viewing: Vec<String>,
    #[serde(default)]
    pub editing: Vec<String>,
}

/// Metadata change for a single item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemUpdate {
    pub path: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Star rating 0..=5.
    #[serde(default)]
    pub star: Option<u8>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
    /// Server-computed metrics, passed through opaquely to the UI.
    #[serde(default)]
    pub metrics: serde_json::Value,
}

/// Metrics recomputation for a single item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsUpdate {
    pub path: String,
    pub metrics: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl UpdateEvent {
    /// Parse a raw SSE frame into an event. Returns `None` for event kinds
    /// the client does not consume (heartbeats, future additions) or for
    /// payloads that fail to parse; the channel stays up either way.
    pub fn from_wire(event_name: &str, cursor: Option<String>, data: &str) -> Option<Self> {
        let payload = match event_name {
            EVENT_PRESENCE => UpdatePayload::Presence(parse_data(event_name, data)?),
            EVENT_ITEM_UPDATED => UpdatePayload::ItemUpdated(parse_data(event_name, data)?),
            EVENT_METRICS_UPDATED => UpdatePayload::MetricsUpdated(parse_data(event_name, data)?),
            other => {
                tracing::debug!(event = %other, "ignoring unknown event kind");
                return None;
            }
        };
        Some(Self { cursor, payload })
    }
}

fn parse_data<T: for<'de> Deserialize<'de>>(event_name: &str, data: &str) -> Option<T> {
    match serde_json::from_str(data) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            tracing::debug!(event = %event_name, error = %err, "dropping unparseable event payload");
            None
        }
    }
}
