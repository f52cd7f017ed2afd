use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use timbel_types::{Result, TimbelError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::dlq_item::{belongs_to_queue, DlqItem, PersistAction, PersistedRecord};

/// Durable audit log for dead letter queue transitions.
#[async_trait]
pub trait DlqStore: Send + Sync {
    /// Record one lifecycle transition of `item`.
    async fn persist(&self, item: &DlqItem, action: PersistAction) -> Result<()>;

    /// Items recorded as `added` for `queue` that have no terminal record
    /// (`processed`, `permanent_failure`, `overflow`), deduplicated by id.
    async fn recover(&self, queue: &str) -> Result<Vec<DlqItem>>;
}

/// One JSON file per transition, named `<itemId>_<action>.json`.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, item_id: &str, action: PersistAction) -> PathBuf {
        self.dir.join(format!("{item_id}_{action}.json"))
    }

    /// Every readable record in the directory, in filename order.
    pub async fn list_records(&self) -> Result<Vec<PersistedRecord>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".json") {
                names.push(name);
            }
        }
        names.sort();

        let mut records = Vec::with_capacity(names.len());
        for name in names {
            if let Some(record) = self.read_record(&name).await {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn read_record(&self, file_name: &str) -> Option<PersistedRecord> {
        let path = self.dir.join(file_name);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Failed to read DLQ record");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Skipping malformed DLQ record");
                None
            }
        }
    }
}

#[async_trait]
impl DlqStore for FileStore {
    async fn persist(&self, item: &DlqItem, action: PersistAction) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            TimbelError::Persistence(format!(
                "Failed to create {}: {e}",
                self.dir.display()
            ))
        })?;

        let record = PersistedRecord {
            item: item.clone(),
            persisted_at: Utc::now(),
            action,
        };
        let path = self.path_for(&item.id, action);
        let body = serde_json::to_vec_pretty(&record)?;
        tokio::fs::write(&path, body).await.map_err(|e| {
            TimbelError::Persistence(format!("Failed to write {}: {e}", path.display()))
        })?;

        debug!(item = %item.id, %action, "DLQ item persisted");
        Ok(())
    }

    async fn recover(&self, queue: &str) -> Result<Vec<DlqItem>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut added = Vec::new();
        let mut settled = HashSet::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some((id, action)) = split_file_name(&name) else {
                continue;
            };
            if !belongs_to_queue(id, queue) {
                continue;
            }
            if action == PersistAction::Added {
                added.push(name.clone());
            } else if action.is_terminal() {
                settled.insert(id.to_string());
            }
        }
        added.sort();

        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for name in added {
            if let Some(record) = self.read_record(&name).await {
                if !settled.contains(&record.item.id) && seen.insert(record.item.id.clone()) {
                    items.push(record.item);
                }
            }
        }
        Ok(items)
    }
}

/// Split `<itemId>_<action>.json` into its parts.
fn split_file_name(name: &str) -> Option<(&str, PersistAction)> {
    let stem = name.strip_suffix(".json")?;
    PersistAction::ALL.into_iter().find_map(|action| {
        stem.strip_suffix(action.as_str())
            .and_then(|rest| rest.strip_suffix('_'))
            .map(|id| (id, action))
    })
}

/// In-memory store, mostly for tests and ephemeral queues.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<PersistedRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<PersistedRecord> {
        self.records.lock().await.clone()
    }

    /// Actions recorded for one item, oldest first.
    pub async fn actions_for(&self, item_id: &str) -> Vec<PersistAction> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.item.id == item_id)
            .map(|r| r.action)
            .collect()
    }
}

#[async_trait]
impl DlqStore for MemoryStore {
    async fn persist(&self, item: &DlqItem, action: PersistAction) -> Result<()> {
        self.records.lock().await.push(PersistedRecord {
            item: item.clone(),
            persisted_at: Utc::now(),
            action,
        });
        Ok(())
    }

    async fn recover(&self, queue: &str) -> Result<Vec<DlqItem>> {
        let records = self.records.lock().await;
        let settled: HashSet<&str> = records
            .iter()
            .filter(|r| r.action.is_terminal())
            .map(|r| r.item.id.as_str())
            .collect();
        let mut seen = HashSet::new();
        Ok(records
            .iter()
            .filter(|r| r.action == PersistAction::Added && belongs_to_queue(&r.item.id, queue))
            .filter(|r| !settled.contains(r.item.id.as_str()))
            .filter(|r| seen.insert(r.item.id.clone()))
            .map(|r| r.item.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[tokio::test]
    async fn file_store_writes_one_file_per_action() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path().join("dlq"));
        let item = DlqItem::new("orders", json!({ "id": 7 }), Map::new());

        store.persist(&item, PersistAction::Added).await.unwrap();
        store.persist(&item, PersistAction::RetryFailed).await.unwrap();

        let added = tmp.path().join("dlq").join(format!("{}_added.json", item.id));
        let failed = tmp.path().join("dlq").join(format!("{}_retry_failed.json", item.id));
        assert!(added.exists());
        assert!(failed.exists());

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(added).unwrap()).unwrap();
        assert_eq!(raw["action"], "added");
        assert_eq!(raw["id"], item.id.as_str());

        assert_eq!(store.list_records().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn file_store_recovers_only_added_records_of_queue() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path());
        let mine = DlqItem::new("orders", json!(1), Map::new());
        let other = DlqItem::new("orders_archive", json!(2), Map::new());

        store.persist(&mine, PersistAction::Added).await.unwrap();
        store.persist(&mine, PersistAction::RetryFailed).await.unwrap();
        store.persist(&other, PersistAction::Added).await.unwrap();
        std::fs::write(tmp.path().join("DLQ_orders_1_bad_added.json"), "{").unwrap();
        std::fs::write(tmp.path().join("DLQ_orders_123_abcdef012_added.json"), "not json").unwrap();

        let recovered = store.recover("orders").await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, mine.id);
    }

    #[tokio::test]
    async fn file_store_recovers_item_with_reserved_metadata_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path());
        let mut meta = Map::new();
        meta.insert("source".into(), json!("bug-reports"));
        meta.insert("attempts".into(), json!(3));
        meta.insert("errorHistory".into(), json!(["RETRY_EXHAUSTED"]));
        let item = DlqItem::new("bugs", json!({ "x": 1 }), meta);

        store.persist(&item, PersistAction::Added).await.unwrap();

        let recovered = store.recover("bugs").await.unwrap();
        assert_eq!(recovered, vec![item]);
        assert_eq!(recovered[0].metadata.attempts, 0);
        assert_eq!(recovered[0].metadata.context["attempts"], 3);
    }

    #[tokio::test]
    async fn settled_items_are_not_recovered() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path());
        let memory = MemoryStore::new();
        let delivered = DlqItem::new("jobs", json!(1), Map::new());
        let given_up = DlqItem::new("jobs", json!(2), Map::new());
        let pending = DlqItem::new("jobs", json!(3), Map::new());

        let backends: [&dyn DlqStore; 2] = [&store, &memory];
        for backend in backends {
            backend.persist(&delivered, PersistAction::Added).await.unwrap();
            backend.persist(&delivered, PersistAction::Processed).await.unwrap();
            backend.persist(&given_up, PersistAction::Added).await.unwrap();
            backend.persist(&given_up, PersistAction::PermanentFailure).await.unwrap();
            backend.persist(&pending, PersistAction::Added).await.unwrap();
            backend.persist(&pending, PersistAction::RetryFailed).await.unwrap();

            let ids: Vec<String> = backend
                .recover("jobs")
                .await
                .unwrap()
                .into_iter()
                .map(|item| item.id)
                .collect();
            assert_eq!(ids, vec![pending.id.clone()]);
        }
    }

    #[test]
    fn file_names_split_into_id_and_action() {
        assert_eq!(
            split_file_name("DLQ_q_1_abc_permanent_failure.json"),
            Some(("DLQ_q_1_abc", PersistAction::PermanentFailure))
        );
        assert_eq!(
            split_file_name("DLQ_q_1_abc_retry_failed.json"),
            Some(("DLQ_q_1_abc", PersistAction::RetryFailed))
        );
        assert_eq!(split_file_name("DLQ_q_1_abc_added.txt"), None);
        assert_eq!(split_file_name("notes.json"), None);
    }

    #[tokio::test]
    async fn file_store_missing_dir_recovers_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path().join("absent"));
        assert!(store.recover("orders").await.unwrap().is_empty());
        assert!(store.list_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_dedups_by_id() {
        let store = MemoryStore::new();
        let item = DlqItem::new("q", json!(null), Map::new());
        store.persist(&item, PersistAction::Added).await.unwrap();
        store.persist(&item, PersistAction::Added).await.unwrap();
        store.persist(&item, PersistAction::Overflow).await.unwrap();

        assert_eq!(store.recover("q").await.unwrap().len(), 1);
        assert_eq!(
            store.actions_for(&item.id).await,
            vec![PersistAction::Added, PersistAction::Added, PersistAction::Overflow]
        );
    }
}
