//! Document gateway: ties metadata, stored files, the per-user queue and the
//! upstream AI client together.
//!
//! Every AI operation checks ownership first, then runs activation and the
//! upstream call as one unit of work in the owner's queue, so a session
//! handle created by one call is visible to the next one for the same user.

use crate::config::{SessionCacheMode, ALLOWED_CONTENT_TYPES};
use crate::error::{GatewayError, GatewayResult};
use crate::file_store::FileStore;
use crate::persistence::{DocumentRecord, DocumentStore};
use crate::queue::UserQueues;
use crate::upstream::{AskPayload, SummaryPayload, UpstreamClient, UpstreamHealth};
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Quiz question with the correct answer resolved to an option index.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QuizQuestion {
    pub question: String,
    pub options: Vec<String>,
    pub correct_answer: usize,
    pub explanation: String,
}

/// Index of `correct` in `options`: exact match, then case-insensitive
/// trimmed match, else 0.
pub fn answer_index(options: &[String], correct: &str) -> usize {
    options
        .iter()
        .position(|o| o == correct)
        .or_else(|| {
            let wanted = correct.trim().to_lowercase();
            options.iter().position(|o| o.trim().to_lowercase() == wanted)
        })
        .unwrap_or(0)
}

fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Upstream statuses meaning the cached session is gone.
fn is_stale_session(err: &GatewayError) -> bool {
    matches!(err, GatewayError::UpstreamError { status: 404 | 410, .. })
}

#[derive(Clone)]
pub struct DocumentGateway {
    store: Arc<dyn DocumentStore>,
    files: Arc<FileStore>,
    upstream: Arc<UpstreamClient>,
    queue: Arc<UserQueues>,
    session_cache: SessionCacheMode,
}

impl DocumentGateway {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        files: Arc<FileStore>,
        upstream: Arc<UpstreamClient>,
        queue: Arc<UserQueues>,
    ) -> Self {
        Self {
            store,
            files,
            upstream,
            queue,
            session_cache: SessionCacheMode::default(),
        }
    }

    pub fn with_session_cache(mut self, mode: SessionCacheMode) -> Self {
        self.session_cache = mode;
        self
    }

    pub fn queue(&self) -> &Arc<UserQueues> {
        &self.queue
    }

    pub fn files(&self) -> &Arc<FileStore> {
        &self.files
    }

    /// Store an uploaded document. Metadata goes in first; any later failure
    /// removes it again so no record without bytes survives.
    pub async fn upload<S, E>(
        &self,
        owner_id: &str,
        filename: &str,
        content_type: &str,
        body: S,
    ) -> GatewayResult<DocumentRecord>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let filename = filename.trim();
        if filename.is_empty() {
            return Err(GatewayError::InvalidRequest("filename is required".into()));
        }
        let content_type = media_type(content_type);
        if !ALLOWED_CONTENT_TYPES.contains(&content_type.as_str()) {
            return Err(GatewayError::InvalidRequest(format!(
                "unsupported file type '{}', only PDF, DOCX and PPTX are accepted",
                content_type
            )));
        }

        let mut record = DocumentRecord::new(owner_id, filename, &content_type);
        self.store.insert(record.clone()).await?;

        let saved = match self.files.save(&record.id, body).await {
            Ok(saved) => saved,
            Err(e) => {
                warn!("Upload of {} failed, rolling back record: {}", record.id, e);
                self.rollback_record(owner_id, &record.id).await;
                return Err(e);
            }
        };

        if let Err(e) = self.store.set_file_size(&record.id, saved.size).await {
            warn!("Recording size for {} failed, rolling back: {}", record.id, e);
            if let Err(cleanup) = self.files.delete(&record.id).await {
                warn!("Failed to remove file {} during rollback: {}", record.id, cleanup);
            }
            self.rollback_record(owner_id, &record.id).await;
            return Err(e);
        }

        record.file_size = Some(saved.size);
        info!(
            "📄 Stored {} for user {} as {} ({} bytes)",
            record.filename, owner_id, record.id, saved.size
        );
        Ok(record)
    }

    async fn rollback_record(&self, owner_id: &str, id: &str) {
        if let Err(e) = self.store.delete(owner_id, id).await {
            warn!("Failed to roll back record {}: {}", id, e);
        }
    }

    pub async fn list(&self, owner_id: &str) -> GatewayResult<Vec<DocumentRecord>> {
        self.store.list(owner_id).await
    }

    pub async fn summarize(&self, owner_id: &str, id: &str) -> GatewayResult<SummaryPayload> {
        self.run_ai(owner_id, id, "summarize", |upstream, session| async move {
            upstream.summarize(&session).await
        })
        .await
    }

    pub async fn generate_quiz(&self, owner_id: &str, id: &str) -> GatewayResult<Vec<QuizQuestion>> {
        let payload = self
            .run_ai(owner_id, id, "quiz", |upstream, session| async move {
                upstream.quiz(&session).await
            })
            .await?;

        Ok(payload
            .quiz
            .into_iter()
            .map(|q| QuizQuestion {
                correct_answer: answer_index(&q.options, &q.correct_answer),
                question: q.question,
                options: q.options,
                explanation: q.explanation,
            })
            .collect())
    }

    pub async fn ask(&self, owner_id: &str, id: &str, question: &str) -> GatewayResult<AskPayload> {
        let question = question.trim().to_string();
        if question.is_empty() {
            return Err(GatewayError::InvalidRequest("question must not be empty".into()));
        }

        self.run_ai(owner_id, id, "ask", move |upstream, session| {
            let question = question.clone();
            async move { upstream.ask(&session, &question).await }
        })
        .await
    }

    /// Remove metadata first, then the bytes. A failure removing the file is
    /// only logged; metadata is authoritative.
    pub async fn delete(&self, owner_id: &str, id: &str) -> GatewayResult<()> {
        if self.store.find(owner_id, id).await?.is_none() {
            return Err(GatewayError::NotFoundOrForbidden);
        }

        match self.store.delete(owner_id, id).await {
            Ok(true) => {}
            Ok(false) => return Err(GatewayError::NotFoundOrForbidden),
            Err(e) => {
                return Err(GatewayError::internal(format!("failed to delete record {}: {}", id, e)))
            }
        }

        match self.files.delete(id).await {
            Ok(true) => debug!("Removed stored file {}", id),
            Ok(false) => warn!("Stored file {} was already gone", id),
            Err(e) => warn!("Failed to remove stored file {}: {}", id, e),
        }

        info!("🗑️  Deleted document {} for user {}", id, owner_id);
        Ok(())
    }

    pub async fn health(&self) -> UpstreamHealth {
        self.upstream.health().await
    }

    pub fn queue_size(&self, owner_id: &str) -> usize {
        self.queue.queue_size(owner_id)
    }

    async fn run_ai<T, F, Fut>(&self, owner_id: &str, id: &str, label: &'static str, call: F) -> GatewayResult<T>
    where
        T: Send + 'static,
        F: Fn(Arc<UpstreamClient>, String) -> Fut + Send + 'static,
        Fut: Future<Output = GatewayResult<T>> + Send + 'static,
    {
        if self.store.find(owner_id, id).await?.is_none() {
            return Err(GatewayError::NotFoundOrForbidden);
        }

        let gateway = self.clone();
        let owner = owner_id.to_string();
        let id = id.to_string();

        self.queue
            .enqueue(owner_id, async move {
                let (session, cached) = gateway.activate(&owner, &id).await?;
                debug!("Running {} for {} with session {}", label, id, session);

                match call(gateway.upstream.clone(), session).await {
                    Err(e) if cached && is_stale_session(&e) => {
                        info!("Cached session for {} expired upstream, re-uploading", id);
                        gateway.store.set_session(&id, None).await?;
                        let (fresh, _) = gateway.activate(&owner, &id).await?;
                        call(gateway.upstream.clone(), fresh).await
                    }
                    other => other,
                }
            })
            .await
    }

    /// Resolve the upstream session for a document, uploading it when there
    /// is no reusable handle. Returns the handle and whether it came from cache.
    async fn activate(&self, owner_id: &str, id: &str) -> GatewayResult<(String, bool)> {
        let record = self
            .store
            .find(owner_id, id)
            .await?
            .ok_or(GatewayError::NotFoundOrForbidden)?;

        if self.session_cache == SessionCacheMode::Enabled {
            if let Some(session) = record.session_id.clone() {
                return Ok((session, true));
            }
        }

        let data = self
            .files
            .read(id)
            .await?
            .ok_or_else(|| GatewayError::internal(format!("stored file for {} is missing", id)))?;

        let session = self
            .upstream
            .upload(&record.filename, &record.content_type, data)
            .await?;
        self.store.set_session(id, Some(session.clone())).await?;
        Ok((session, false))
    }
}
