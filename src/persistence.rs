//! Document metadata store with bincode snapshots and background persistence.
//!
//! Records live in a `DashMap` behind the [`DocumentStore`] trait. Snapshots
//! are written to `<data-dir>/documents.bin` through a temp file and an
//! atomic rename, on an interval and once more at shutdown.

use crate::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentRecord {
    pub id: String,
    pub owner_id: String,
    pub filename: String,
    pub content_type: String,
    /// Set once the bytes are durably on disk.
    pub file_size: Option<u64>,
    /// Cached upstream session handle.
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DocumentRecord {
    pub fn new(owner_id: &str, filename: &str, content_type: &str) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            owner_id: owner_id.to_string(),
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            file_size: None,
            session_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Metadata persistence used by the gateway. Every lookup is owner-scoped.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert(&self, record: DocumentRecord) -> GatewayResult<()>;
    async fn find(&self, owner_id: &str, id: &str) -> GatewayResult<Option<DocumentRecord>>;
    async fn set_file_size(&self, id: &str, size: u64) -> GatewayResult<()>;
    async fn set_session(&self, id: &str, session_id: Option<String>) -> GatewayResult<()>;
    /// Returns whether a record owned by `owner_id` was removed.
    async fn delete(&self, owner_id: &str, id: &str) -> GatewayResult<bool>;
    /// Newest first.
    async fn list(&self, owner_id: &str) -> GatewayResult<Vec<DocumentRecord>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    documents: Vec<DocumentRecord>,
    version: u32,
    saved_at: i64,
}

const PERSISTENCE_VERSION: u32 = 1;
const SNAPSHOT_FILE: &str = "documents.bin";

#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: DashMap<String, DocumentRecord>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn save_to_path(&self, path: &Path) -> GatewayResult<()> {
        let start = std::time::Instant::now();
        let state = PersistedState {
            documents: self.documents.iter().map(|e| e.value().clone()).collect(),
            version: PERSISTENCE_VERSION,
            saved_at: Utc::now().timestamp(),
        };

        let data = bincode::serialize(&state)
            .map_err(|e| GatewayError::internal(format!("snapshot encode failed: {}", e)))?;

        let temp_path = path.with_extension("bin.tmp");
        fs::write(&temp_path, &data)?;
        fs::rename(&temp_path, path)?;

        info!(
            "Saved {} document records to {:?} in {:?} ({} bytes)",
            state.documents.len(),
            path,
            start.elapsed(),
            data.len()
        );
        Ok(())
    }

    pub fn load_from_path(path: &Path) -> GatewayResult<Self> {
        let data = fs::read(path)?;
        let state: PersistedState = bincode::deserialize(&data)
            .map_err(|e| GatewayError::internal(format!("corrupt snapshot {:?}: {}", path, e)))?;

        info!(
            "Loaded {} document records from snapshot (version: {}, saved: {})",
            state.documents.len(),
            state.version,
            state.saved_at
        );

        let documents = DashMap::new();
        for record in state.documents {
            documents.insert(record.id.clone(), record);
        }
        Ok(Self { documents })
    }

    fn update(&self, id: &str, apply: impl FnOnce(&mut DocumentRecord)) -> GatewayResult<()> {
        match self.documents.get_mut(id) {
            Some(mut record) => {
                apply(record.value_mut());
                Ok(())
            }
            None => Err(GatewayError::NotFoundOrForbidden),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert(&self, record: DocumentRecord) -> GatewayResult<()> {
        match self.documents.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(GatewayError::AlreadyExists(record.id)),
            Entry::Vacant(slot) => {
                debug!("Inserted document record {}", record.id);
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn find(&self, owner_id: &str, id: &str) -> GatewayResult<Option<DocumentRecord>> {
        Ok(self
            .documents
            .get(id)
            .filter(|r| r.owner_id == owner_id)
            .map(|r| r.value().clone()))
    }

    async fn set_file_size(&self, id: &str, size: u64) -> GatewayResult<()> {
        self.update(id, |r| r.file_size = Some(size))
    }

    async fn set_session(&self, id: &str, session_id: Option<String>) -> GatewayResult<()> {
        self.update(id, |r| r.session_id = session_id)
    }

    async fn delete(&self, owner_id: &str, id: &str) -> GatewayResult<bool> {
        Ok(self
            .documents
            .remove_if(id, |_, r| r.owner_id == owner_id)
            .is_some())
    }

    async fn list(&self, owner_id: &str) -> GatewayResult<Vec<DocumentRecord>> {
        let mut records: Vec<DocumentRecord> = self
            .documents
            .iter()
            .filter(|e| e.owner_id == owner_id)
            .map(|e| e.value().clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }
}

#[derive(Clone)]
pub struct PersistenceManager {
    data_dir: PathBuf,
    snapshot_interval: Duration,
}

impl PersistenceManager {
    pub fn new(data_dir: impl AsRef<Path>, snapshot_interval_secs: u64) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();

        if let Err(e) = fs::create_dir_all(&data_dir) {
            error!("Failed to create data directory {:?}: {}", data_dir, e);
        }

        Self {
            data_dir,
            snapshot_interval: Duration::from_secs(snapshot_interval_secs.max(1)),
        }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILE)
    }

    /// Load the last snapshot, or start empty when none exists yet.
    pub fn load_store(&self) -> GatewayResult<MemoryDocumentStore> {
        let path = self.snapshot_path();
        if !path.exists() {
            info!("No snapshot at {:?}, starting with an empty document store", path);
            return Ok(MemoryDocumentStore::new());
        }
        MemoryDocumentStore::load_from_path(&path)
    }

    pub fn save_state(&self, store: &MemoryDocumentStore) -> GatewayResult<()> {
        store.save_to_path(&self.snapshot_path())
    }

    pub fn start_background_snapshots(
        &self,
        store: Arc<MemoryDocumentStore>,
    ) -> tokio::task::JoinHandle<()> {
        let persistence = self.clone();

        tokio::spawn(async move {
            let mut interval = interval(persistence.snapshot_interval);
            // First tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;

                if let Err(e) = persistence.save_state(&store) {
                    error!("Background snapshot failed: {}", e);
                } else {
                    debug!("Background snapshot completed");
                }
            }
        })
    }
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to create SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down gracefully..."),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully..."),
    }
}
