use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One failed attempt recorded against a DLQ item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub attempt: u32,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqMetadata {
    pub added_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub next_retry: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub error_history: Vec<ErrorRecord>,
    /// Caller-supplied metadata, kept apart from the fields above.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

/// A failed operation waiting for re-delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqItem {
    pub id: String,
    pub data: Value,
    pub metadata: DlqMetadata,
}

impl DlqItem {
    /// Build a fresh item for `queue`. `metadata["source"]` becomes the
    /// item source; every other key is kept verbatim in `context`.
    pub fn new(queue: &str, data: Value, mut metadata: Map<String, Value>) -> Self {
        let now = Utc::now();
        let source = match metadata.remove("source") {
            Some(Value::String(s)) => s,
            _ => "unknown".to_string(),
        };
        Self {
            id: generate_id(queue),
            data,
            metadata: DlqMetadata {
                added_at: now,
                attempts: 0,
                last_attempt: None,
                next_retry: now,
                source,
                error_history: Vec::new(),
                context: metadata,
            },
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.metadata.error_history.last().map(|r| r.error.as_str())
    }
}

/// Filename prefix shared by every item of `queue`.
pub fn id_prefix(queue: &str) -> String {
    format!("DLQ_{queue}_")
}

/// `DLQ_<queue>_<millis>_<suffix>`
fn generate_id(queue: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}{}_{}",
        id_prefix(queue),
        Utc::now().timestamp_millis(),
        &suffix[..9]
    )
}

/// Whether `id` was generated for exactly this queue (and not for a queue
/// whose name merely starts with the same characters).
pub fn belongs_to_queue(id: &str, queue: &str) -> bool {
    let Some(rest) = id.strip_prefix(&id_prefix(queue)) else {
        return false;
    };
    match rest.split_once('_') {
        Some((millis, suffix)) => {
            !millis.is_empty()
                && millis.bytes().all(|b| b.is_ascii_digit())
                && !suffix.is_empty()
                && suffix.bytes().all(|b| b.is_ascii_alphanumeric())
        }
        None => false,
    }
}

/// Queue name encoded in an item id.
pub fn queue_of(id: &str) -> Option<&str> {
    let rest = id.strip_prefix("DLQ_")?;
    let mut parts = rest.rsplitn(3, '_');
    let _suffix = parts.next()?;
    let _millis = parts.next()?;
    parts.next().filter(|queue| belongs_to_queue(id, queue))
}

/// Lifecycle transition recorded for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistAction {
    Added,
    RetryFailed,
    Processed,
    PermanentFailure,
    Overflow,
}

impl PersistAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::RetryFailed => "retry_failed",
            Self::Processed => "processed",
            Self::PermanentFailure => "permanent_failure",
            Self::Overflow => "overflow",
        }
    }

    /// Whether the item left the queue with this transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::PermanentFailure | Self::Overflow)
    }

    pub const ALL: [PersistAction; 5] = [
        Self::Added,
        Self::RetryFailed,
        Self::Processed,
        Self::PermanentFailure,
        Self::Overflow,
    ];
}

impl std::fmt::Display for PersistAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-disk audit record: the full item plus when and why it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    #[serde(flatten)]
    pub item: DlqItem,
    pub persisted_at: DateTime<Utc>,
    pub action: PersistAction,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_item_is_due_immediately() {
        let mut meta = Map::new();
        meta.insert("source".into(), json!("metrics-collector"));
        meta.insert("route".into(), json!("/api/system"));
        let item = DlqItem::new("api", json!({ "url": "http://x" }), meta);

        assert_eq!(item.metadata.attempts, 0);
        assert_eq!(item.metadata.next_retry, item.metadata.added_at);
        assert_eq!(item.metadata.source, "metrics-collector");
        assert_eq!(item.metadata.context["route"], "/api/system");
        assert!(item.id.starts_with("DLQ_api_"));
        assert!(belongs_to_queue(&item.id, "api"));
    }

    #[test]
    fn ids_do_not_leak_across_prefix_sharing_queues() {
        let item = DlqItem::new("api_v2", json!(null), Map::new());
        assert!(belongs_to_queue(&item.id, "api_v2"));
        assert!(!belongs_to_queue(&item.id, "api"));
        assert!(!belongs_to_queue("DLQ_api_", "api"));
        assert_eq!(queue_of(&item.id), Some("api_v2"));
        assert_eq!(queue_of("DLQ_api_"), None);
        assert_eq!(queue_of("notes.json"), None);
    }

    #[test]
    fn caller_keys_cannot_shadow_item_fields() {
        let mut meta = Map::new();
        meta.insert("attempts".into(), json!(3));
        meta.insert("nextRetry".into(), json!("tomorrow"));
        let item = DlqItem::new("db", json!(null), meta);

        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["metadata"]["attempts"], 0);
        assert_eq!(json["metadata"]["context"]["attempts"], 3);

        let back: DlqItem = serde_json::from_str(&serde_json::to_string(&item).unwrap()).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn record_layout_is_flat_camel_case() {
        let item = DlqItem::new("db", json!({ "query": "SELECT 1" }), Map::new());
        let record = PersistedRecord {
            item,
            persisted_at: Utc::now(),
            action: PersistAction::RetryFailed,
        };
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["action"], "retry_failed");
        assert!(json["persistedAt"].is_string());
        assert!(json["metadata"]["nextRetry"].is_string());
        assert_eq!(json["data"]["query"], "SELECT 1");
        assert!(json["metadata"].get("context").is_none());

        let back: PersistedRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
