//! Remote durable document store.
//!
//! Usage totals are mirrored to a document store shared by every install
//! logged into the same account. The [`RemoteStore`] trait is the narrow
//! surface the session manager needs: point reads, merge writes, field
//! deletes, a combined atomic update, collection appends and change
//! listeners.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryStore`] - in-process, with failure injection for tests
//! - [`JsonFileStore`] - [`MemoryStore`] persisted as JSON files on disk

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::types::HardwareAddress;

/// A document's fields.
pub type Fields = serde_json::Map<String, Value>;

/// Capacity of each per-document listener channel.
const LISTENER_CAPACITY: usize = 32;

/// Errors returned by a [`RemoteStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A document key contained an empty or relative segment.
    #[error("Invalid document key: '{0}'")]
    InvalidKey(String),

    /// Reading or writing a persisted document failed.
    #[error("Failed to access {}: {source}", path.display())]
    Io {
        /// File that was being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A persisted document could not be (de)serialized.
    #[error("Failed to serialize document: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Slash-separated path of a document, e.g. `users/alice/deviceTimers/01:02:03:04:05:06`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey(String);

impl DocumentKey {
    /// Build a key from a path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidKey`] if any segment is empty, `.` or `..`.
    pub fn new(path: impl Into<String>) -> Result<Self, StoreError> {
        let path = path.into();
        if path
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(StoreError::InvalidKey(path));
        }
        Ok(Self(path))
    }

    /// Duration document of one sensor within an account.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidKey`] if the account id is not a valid
    /// path segment.
    pub fn device_timer(account_id: &str, address: &HardwareAddress) -> Result<Self, StoreError> {
        Self::new(format!("users/{account_id}/deviceTimers/{address}"))
    }

    /// The key as a path string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments of the key.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collection that receives averaged sample uploads for an account.
#[must_use]
pub fn sensor_data_collection(account_id: &str) -> String {
    format!("users/{account_id}/sensorData")
}

/// One change inside an atomic [`RemoteStore::update_fields`] write.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    /// Set a field to a value.
    Set(String, Value),
    /// Remove a field.
    Delete(String),
}

/// A live listener on one document.
///
/// Yields the document as it was when the listener was registered, then
/// every subsequent version (`None` once the document is gone). Dropping the
/// subscription cancels it.
pub struct Subscription {
    initial: Option<Option<Fields>>,
    receiver: broadcast::Receiver<Option<Fields>>,
}

impl Subscription {
    /// Wait for the next document snapshot. Returns `None` when the store
    /// side of the listener has gone away.
    pub async fn next(&mut self) -> Option<Option<Fields>> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.receiver.recv().await {
                Ok(fields) => return Some(fields),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Document listener lagged, skipping to latest");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Cancel the listener.
    pub fn cancel(self) {
        drop(self);
    }
}

/// Document store shared across installs of the same account.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read a document. `Ok(None)` if it does not exist.
    async fn get_document(&self, key: &DocumentKey) -> Result<Option<Fields>, StoreError>;

    /// Write fields. With `merge`, existing fields not named are kept;
    /// without it the document is replaced.
    async fn set_fields(&self, key: &DocumentKey, fields: Fields, merge: bool)
        -> Result<(), StoreError>;

    /// Apply several sets and deletes as a single write. Creates the
    /// document if it is missing.
    async fn update_fields(
        &self,
        key: &DocumentKey,
        updates: Vec<FieldUpdate>,
    ) -> Result<(), StoreError>;

    /// Remove one field from a document.
    async fn delete_field(&self, key: &DocumentKey, field: &str) -> Result<(), StoreError> {
        self.update_fields(key, vec![FieldUpdate::Delete(field.to_string())])
            .await
    }

    /// Append a document with a generated id to a collection.
    async fn add_document(&self, collection: &str, fields: Fields)
        -> Result<DocumentKey, StoreError>;

    /// Listen to a document's changes.
    async fn listen(&self, key: &DocumentKey) -> Result<Subscription, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    documents: HashMap<DocumentKey, Fields>,
    listeners: HashMap<DocumentKey, broadcast::Sender<Option<Fields>>>,
}

impl MemoryInner {
    fn notify(&mut self, key: &DocumentKey) {
        let current = self.documents.get(key).cloned();
        if let Some(sender) = self.listeners.get(key) {
            if sender.send(current).is_err() {
                self.listeners.remove(key);
            }
        }
    }
}

/// In-process document store.
///
/// Clones share the same documents. Writes and reads can be made to fail a
/// given number of times to exercise persistence error paths.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
    failing_writes: Arc<AtomicUsize>,
    failing_reads: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` reads fail with [`StoreError::Unavailable`].
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Every stored document.
    pub async fn documents(&self) -> Vec<(DocumentKey, Fields)> {
        let inner = self.inner.lock().await;
        let mut documents: Vec<_> = inner
            .documents
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        documents.sort_by(|a, b| a.0.cmp(&b.0));
        documents
    }

    async fn insert_loaded(&self, key: DocumentKey, fields: Fields) {
        self.inner.lock().await.documents.insert(key, fields);
    }

    fn check(counter: &AtomicUsize, operation: &str) -> Result<(), StoreError> {
        let injected = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable(format!("injected {operation} failure")));
        }
        Ok(())
    }

    async fn write<F>(&self, key: &DocumentKey, apply: F) -> Result<Option<Fields>, StoreError>
    where
        F: FnOnce(&mut HashMap<DocumentKey, Fields>) + Send,
    {
        Self::check(&self.failing_writes, "write")?;
        let mut inner = self.inner.lock().await;
        apply(&mut inner.documents);
        inner.notify(key);
        Ok(inner.documents.get(key).cloned())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get_document(&self, key: &DocumentKey) -> Result<Option<Fields>, StoreError> {
        Self::check(&self.failing_reads, "read")?;
        Ok(self.inner.lock().await.documents.get(key).cloned())
    }

    async fn set_fields(
        &self,
        key: &DocumentKey,
        fields: Fields,
        merge: bool,
    ) -> Result<(), StoreError> {
        self.write(key, |documents| {
            if merge {
                documents.entry(key.clone()).or_default().extend(fields);
            } else {
                documents.insert(key.clone(), fields);
            }
        })
        .await
        .map(drop)
    }

    async fn update_fields(
        &self,
        key: &DocumentKey,
        updates: Vec<FieldUpdate>,
    ) -> Result<(), StoreError> {
        self.write(key, |documents| {
            let document = documents.entry(key.clone()).or_default();
            for update in updates {
                match update {
                    FieldUpdate::Set(name, value) => {
                        document.insert(name, value);
                    }
                    FieldUpdate::Delete(name) => {
                        document.remove(&name);
                    }
                }
            }
        })
        .await
        .map(drop)
    }

    async fn add_document(
        &self,
        collection: &str,
        fields: Fields,
    ) -> Result<DocumentKey, StoreError> {
        let key = DocumentKey::new(format!("{collection}/{}", uuid::Uuid::new_v4()))?;
        self.set_fields(&key, fields, false).await?;
        Ok(key)
    }

    async fn listen(&self, key: &DocumentKey) -> Result<Subscription, StoreError> {
        Self::check(&self.failing_reads, "listen")?;
        let mut inner = self.inner.lock().await;
        let initial = inner.documents.get(key).cloned();
        let receiver = inner
            .listeners
            .entry(key.clone())
            .or_insert_with(|| broadcast::channel(LISTENER_CAPACITY).0)
            .subscribe();
        Ok(Subscription {
            initial: Some(initial),
            receiver,
        })
    }
}

/// On-disk representation of one document.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDocument {
    key: DocumentKey,
    fields: Fields,
}

/// Document store persisted as one JSON file per document.
///
/// Files live under `<data_dir>/documents/`, mirroring the key's path.
/// Everything is loaded into memory on open; every write is flushed to disk
/// before it is acknowledged. Files are replaced by rename, so a reader
/// never sees a half-written document.
#[derive(Clone)]
pub struct JsonFileStore {
    root: PathBuf,
    memory: MemoryStore,
    writes: Arc<Mutex<()>>,
}

impl JsonFileStore {
    /// Open (or create) a store rooted at `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed.
    /// Documents that cannot be read or parsed are logged and skipped.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = data_dir.as_ref().join("documents");
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| StoreError::Io {
                path: root.clone(),
                source,
            })?;

        let memory = MemoryStore::new();
        let mut pending = vec![root.clone()];
        let mut loaded = 0usize;
        let mut skipped = 0usize;
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|source| StoreError::Io {
                    path: dir.clone(),
                    source,
                })?;
            while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })? {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == "json") {
                    match load_document(&path).await {
                        Ok(document) => {
                            memory.insert_loaded(document.key, document.fields).await;
                            loaded += 1;
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Skipping unreadable document");
                            skipped += 1;
                        }
                    }
                }
            }
        }
        debug!(root = %root.display(), loaded, skipped, "Opened document store");

        Ok(Self {
            root,
            memory,
            writes: Arc::new(Mutex::new(())),
        })
    }

    fn document_path(&self, key: &DocumentKey) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.segments() {
            path.push(segment.replace(':', "-"));
        }
        path.set_extension("json");
        path
    }

    async fn persist(&self, key: &DocumentKey) -> Result<(), StoreError> {
        let path = self.document_path(key);
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };
        match self.memory.get_document(key).await? {
            Some(fields) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
                }
                let content = serde_json::to_string_pretty(&StoredDocument {
                    key: key.clone(),
                    fields,
                })?;
                let staging = path.with_extension("json.tmp");
                tokio::fs::write(&staging, content)
                    .await
                    .map_err(|source| StoreError::Io {
                        path: staging.clone(),
                        source,
                    })?;
                tokio::fs::rename(&staging, &path).await.map_err(io_err)
            }
            None => match tokio::fs::remove_file(&path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(io_err(e)),
                _ => Ok(()),
            },
        }
    }
}

#[async_trait]
impl RemoteStore for JsonFileStore {
    async fn get_document(&self, key: &DocumentKey) -> Result<Option<Fields>, StoreError> {
        self.memory.get_document(key).await
    }

    async fn set_fields(
        &self,
        key: &DocumentKey,
        fields: Fields,
        merge: bool,
    ) -> Result<(), StoreError> {
        let _guard = self.writes.lock().await;
        self.memory.set_fields(key, fields, merge).await?;
        self.persist(key).await
    }

    async fn update_fields(
        &self,
        key: &DocumentKey,
        updates: Vec<FieldUpdate>,
    ) -> Result<(), StoreError> {
        let _guard = self.writes.lock().await;
        self.memory.update_fields(key, updates).await?;
        self.persist(key).await
    }

    async fn add_document(
        &self,
        collection: &str,
        fields: Fields,
    ) -> Result<DocumentKey, StoreError> {
        let _guard = self.writes.lock().await;
        let key = self.memory.add_document(collection, fields).await?;
        if let Err(e) = self.persist(&key).await {
            warn!(key = %key, error = %e, "Failed to persist appended document");
            return Err(e);
        }
        Ok(key)
    }

    async fn listen(&self, key: &DocumentKey) -> Result<Subscription, StoreError> {
        self.memory.listen(key).await
    }
}

async fn load_document(path: &Path) -> Result<StoredDocument, StoreError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(serde_json::from_str(&content)?)
}

/// Default location for the on-disk document store.
///
/// On Linux: `/var/lib/xhale/`
/// Elsewhere: the platform data directory for `xhale`.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib/xhale")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "xhale")
            .map_or_else(|| PathBuf::from("./data"), |dirs| dirs.data_dir().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::new(path).unwrap()
    }

    #[test]
    fn test_document_key_validation() {
        assert!(DocumentKey::new("users/a/deviceTimers/x").is_ok());
        assert!(DocumentKey::new("users//x").is_err());
        assert!(DocumentKey::new("users/../x").is_err());
        assert!(DocumentKey::new("").is_err());

        let addr = HardwareAddress::new([1, 2, 3, 4, 5, 6]);
        let key = DocumentKey::device_timer("alice", &addr).unwrap();
        assert_eq!(key.as_str(), "users/alice/deviceTimers/01:02:03:04:05:06");
        assert!(DocumentKey::device_timer("", &addr).is_err());
    }

    #[tokio::test]
    async fn test_set_fields_merge_and_replace() {
        let store = MemoryStore::new();
        let k = key("docs/a");

        store
            .set_fields(&k, fields(json!({"a": 1, "b": 2})), false)
            .await
            .unwrap();
        store
            .set_fields(&k, fields(json!({"b": 3})), true)
            .await
            .unwrap();
        assert_eq!(
            store.get_document(&k).await.unwrap(),
            Some(fields(json!({"a": 1, "b": 3})))
        );

        store
            .set_fields(&k, fields(json!({"c": 4})), false)
            .await
            .unwrap();
        assert_eq!(
            store.get_document(&k).await.unwrap(),
            Some(fields(json!({"c": 4})))
        );
    }

    #[tokio::test]
    async fn test_update_fields_sets_and_deletes_in_one_write() {
        let store = MemoryStore::new();
        let k = key("docs/a");
        store
            .set_fields(&k, fields(json!({"total": 1.0, "marker": "x"})), false)
            .await
            .unwrap();

        let mut subscription = store.listen(&k).await.unwrap();
        assert!(subscription.next().await.unwrap().is_some());

        store
            .update_fields(
                &k,
                vec![
                    FieldUpdate::Set("total".into(), json!(5.0)),
                    FieldUpdate::Delete("marker".into()),
                ],
            )
            .await
            .unwrap();

        // Exactly one notification carrying both changes.
        let snapshot = subscription.next().await.unwrap().unwrap();
        assert_eq!(snapshot, fields(json!({"total": 5.0})));

        store.delete_field(&k, "total").await.unwrap();
        assert_eq!(
            subscription.next().await.unwrap(),
            Some(Fields::new())
        );
    }

    #[tokio::test]
    async fn test_listen_delivers_missing_document_first() {
        let store = MemoryStore::new();
        let k = key("docs/missing");
        let mut subscription = store.listen(&k).await.unwrap();
        assert_eq!(subscription.next().await, Some(None));

        store
            .set_fields(&k, fields(json!({"v": 1})), true)
            .await
            .unwrap();
        assert_eq!(
            subscription.next().await,
            Some(Some(fields(json!({"v": 1}))))
        );
        subscription.cancel();

        // Writes after cancellation still succeed.
        store
            .set_fields(&k, fields(json!({"v": 2})), true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStore::new();
        let k = key("docs/a");

        store.fail_next_writes(1);
        assert!(matches!(
            store.set_fields(&k, Fields::new(), true).await,
            Err(StoreError::Unavailable(_))
        ));
        tokio_test::assert_ok!(store.set_fields(&k, Fields::new(), true).await);

        store.fail_next_reads(2);
        assert!(store.get_document(&k).await.is_err());
        assert!(store.get_document(&k).await.is_err());
        assert!(store.get_document(&k).await.is_ok());
    }

    #[tokio::test]
    async fn test_add_document_generates_key_in_collection() {
        let store = MemoryStore::new();
        let collection = sensor_data_collection("alice");
        let key = store
            .add_document(&collection, fields(json!({"co": 3.0})))
            .await
            .unwrap();
        assert!(key.as_str().starts_with("users/alice/sensorData/"));
        assert_eq!(store.documents().await.len(), 1);
    }

    #[tokio::test]
    async fn test_json_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let addr = HardwareAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let k = DocumentKey::device_timer("alice", &addr).unwrap();

        {
            let store = JsonFileStore::open(dir.path()).await.unwrap();
            store
                .set_fields(&k, fields(json!({"cumulativeDuration": 42.5})), true)
                .await
                .unwrap();
            store
                .add_document("users/alice/sensorData", fields(json!({"co": 1.0})))
                .await
                .unwrap();
        }

        let reopened = JsonFileStore::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.get_document(&k).await.unwrap(),
            Some(fields(json!({"cumulativeDuration": 42.5})))
        );
        assert_eq!(reopened.memory.documents().await.len(), 2);
    }

    #[tokio::test]
    async fn test_json_file_store_skips_truncated_document() {
        let dir = tempfile::tempdir().unwrap();
        let good = key("users/alice/deviceTimers/good");
        let torn = key("users/alice/deviceTimers/torn");

        let path = {
            let store = JsonFileStore::open(dir.path()).await.unwrap();
            store
                .set_fields(&good, fields(json!({"cumulativeDuration": 1.0})), true)
                .await
                .unwrap();
            store
                .set_fields(&torn, fields(json!({"cumulativeDuration": 2.0})), true)
                .await
                .unwrap();
            store.document_path(&torn)
        };
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, &content[..content.len() / 2]).unwrap();

        let reopened = JsonFileStore::open(dir.path()).await.unwrap();
        assert!(reopened.get_document(&good).await.unwrap().is_some());
        assert_eq!(reopened.get_document(&torn).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_json_file_store_leaves_no_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        let k = key("users/alice/deviceTimers/a");

        let writes: Vec<_> = (0..8)
            .map(|n| {
                let store = store.clone();
                let k = k.clone();
                tokio::spawn(async move {
                    store
                        .set_fields(&k, fields(json!({ "n": n })), true)
                        .await
                        .unwrap();
                })
            })
            .collect();
        for write in writes {
            write.await.unwrap();
        }

        let parent = store.document_path(&k).parent().unwrap().to_path_buf();
        let names: Vec<String> = std::fs::read_dir(parent)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.json".to_string()]);

        let on_disk: StoredDocument =
            serde_json::from_str(&std::fs::read_to_string(store.document_path(&k)).unwrap())
                .unwrap();
        assert_eq!(Some(on_disk.fields), store.get_document(&k).await.unwrap());
    }

    #[tokio::test]
    async fn test_json_file_store_path_avoids_colons() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        let addr = HardwareAddress::new([1, 2, 3, 4, 5, 6]);
        let k = DocumentKey::device_timer("alice", &addr).unwrap();

        let path = store.document_path(&k);
        assert!(path.ends_with("users/alice/deviceTimers/01-02-03-04-05-06.json"));
    }
}
