//! Batch ingestion ("training") of uploaded documents.
//!
//! [`TrainingOrchestrator::handle_upload`] is the request pipeline:
//! development lookup, per-tenant `train` rate limit, batch validation, then
//! [`TrainingOrchestrator::train`].
//!
//! `train` runs valid files in batches of `max_concurrent`. Each file of a
//! batch is a spawned task; the batch is joined before the next one starts.
//! A file that errors, times out or panics fails on its own and the rest of
//! the batch is unaffected. Per file:
//!
//! ```text
//! job (processing) → blob put → extract → classify → discipline → chunk
//!     → replace document + chunks → job (completed | failed)
//! ```
//!
//! `[upload].file_timeout_secs` bounds everything up to the store write.
//! The write itself is not cut short, so a file reported as failed never
//! has a stored document, and its blob is removed again.
//!
//! Text extraction problems are not failures: the document is stored with
//! no chunks and classified from its file name.
//!
//! [`IngestOptions`] carry operator metadata for a whole upload: a unit to
//! pin the documents to (unit-specific overrides), an explicit document kind
//! and tags.

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::error::Elapsed;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::chunk::chunk_text;
use crate::classify::{infer_discipline, DrawingClassifier};
use crate::config::UploadConfig;
use crate::error::{TrainError, ValidationError};
use crate::extract::{essence, extract_text};
use crate::models::{Chunk, DocumentMetadata, JobStatus, TrainingJob, UploadFile};
use crate::rate_limit::{rate_limit_key, RateLimitDecision, RateLimiter};
use crate::store::Store;
use crate::validate::{FileValidator, UploadConstraints};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedFile {
    pub name: String,
    pub error: String,
}

/// Aggregated result of one [`TrainingOrchestrator::train`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainReport {
    /// Input order.
    pub successful_files: Vec<String>,
    /// Input order.
    pub failed_files: Vec<FailedFile>,
    pub total_chunks: usize,
    pub total_inserted: usize,
    /// One per processed file, input order.
    pub job_ids: Vec<String>,
}

impl TrainReport {
    pub fn any_succeeded(&self) -> bool {
        !self.successful_files.is_empty()
    }
}

/// Everything `handle_upload` learned about one request.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub total_files: usize,
    pub valid_files: usize,
    pub validation_errors: Vec<String>,
    pub report: TrainReport,
    pub rate_limit: RateLimitDecision,
}

/// JSON body of an ingestion response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_ids: Option<Vec<String>>,
    pub total_files: usize,
    pub valid_files: usize,
    pub successful_files: usize,
    pub failed_files: usize,
    pub total_chunks: usize,
    pub total_inserted: usize,
    pub successful_file_names: Vec<String>,
    pub failed_file_details: Vec<FailedFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_errors: Option<Vec<String>>,
}

impl UploadOutcome {
    /// At least one file made it.
    pub fn success(&self) -> bool {
        self.report.any_succeeded()
    }

    pub fn to_response(&self) -> IngestionResponse {
        let r = &self.report;
        let (job_id, job_ids) = match r.job_ids.as_slice() {
            [] => (None, None),
            [only] => (Some(only.clone()), None),
            many => (None, Some(many.to_vec())),
        };
        IngestionResponse {
            success: self.success(),
            job_id,
            job_ids,
            total_files: self.total_files,
            valid_files: self.valid_files,
            successful_files: r.successful_files.len(),
            failed_files: r.failed_files.len(),
            total_chunks: r.total_chunks,
            total_inserted: r.total_inserted,
            successful_file_names: r.successful_files.clone(),
            failed_file_details: r.failed_files.clone(),
            validation_errors: (!self.validation_errors.is_empty())
                .then(|| self.validation_errors.clone()),
        }
    }
}

/// Operator-supplied metadata applied to every file of an upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestOptions {
    /// Pins the documents to one unit of the development.
    pub unit_id: Option<String>,
    /// Explicit document kind, e.g. `floor_plan`.
    pub doc_kind: Option<String>,
    pub tags: Vec<String>,
}

impl IngestOptions {
    /// Trims every value and drops empty ones.
    pub fn normalized(self) -> Self {
        fn clean(value: Option<String>) -> Option<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }
        Self {
            unit_id: clean(self.unit_id),
            doc_kind: clean(self.doc_kind),
            tags: self
                .tags
                .into_iter()
                .filter_map(|t| clean(Some(t)))
                .collect(),
        }
    }
}

/// Blob key of an uploaded file: `<development>/<millis>_<job id>_<name>`.
/// The job id keeps keys unique when the same name is uploaded twice in
/// one millisecond.
pub fn blob_path(development_id: &str, job_id: &str, file_name: &str) -> String {
    format!(
        "{}/{}_{}_{}",
        development_id,
        Utc::now().timestamp_millis(),
        job_id,
        sanitize_file_name(file_name)
    )
}

/// Keeps `[A-Za-z0-9._-]` of the final path segment; everything else
/// becomes `_`.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

fn title_from_file_name(name: &str) -> String {
    match name.rfind('.') {
        Some(pos) if pos > 0 => name[..pos].to_string(),
        _ => name.to_string(),
    }
}

struct FileDone {
    chunks: usize,
    inserted: usize,
}

/// A file that went through every step except the store write.
struct PreparedFile {
    doc: DocumentMetadata,
    chunks: Vec<Chunk>,
}

/// Where one file of a batch goes; known before its task starts.
struct PendingFile {
    name: String,
    job_id: String,
    storage_path: String,
}

/// Per-file pipeline; shared by the spawned tasks of a batch.
struct FileWorker {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    classifier: DrawingClassifier,
    max_tokens: usize,
}

impl FileWorker {
    async fn prepare(
        &self,
        file: UploadFile,
        target: &PendingFile,
        tenant_id: &str,
        development_id: &str,
        options: &IngestOptions,
    ) -> Result<PreparedFile> {
        self.store
            .insert_job(&TrainingJob {
                id: target.job_id.clone(),
                tenant_id: tenant_id.to_string(),
                development_id: development_id.to_string(),
                file_name: file.name.clone(),
                status: JobStatus::Processing,
                chunks: 0,
                error: None,
                created_at: Utc::now().timestamp_millis(),
                finished_at: None,
            })
            .await
            .context("Failed to create training job")?;

        let mime_type = essence(&file.content_type);
        let size_bytes = i64::try_from(file.bytes.len())?;
        let file_url = self
            .blobs
            .put(&target.storage_path, file.bytes.clone(), &mime_type)
            .await
            .with_context(|| format!("Failed to upload {}", file.name))?;

        let text = extract_or_skip(&file.name, file.bytes, mime_type.clone()).await;

        let classification = self
            .classifier
            .classify(&file.name, None, (!text.is_empty()).then_some(text.as_str()))
            .await;
        let discipline = infer_discipline(&file.name);
        tracing::debug!(
            file = %file.name,
            confidence = ?classification.confidence,
            "file classified"
        );

        let document_id = Uuid::new_v4().to_string();
        let chunks = chunk_text(&document_id, &text, self.max_tokens);

        let doc = DocumentMetadata {
            id: document_id,
            development_id: development_id.to_string(),
            file_name: file.name.clone(),
            title: title_from_file_name(&file.name),
            file_url,
            storage_path: target.storage_path.clone(),
            mime_type,
            size_bytes,
            discipline: discipline.to_string(),
            drawing_type: Some(classification.drawing_type),
            doc_kind: options.doc_kind.clone(),
            house_type_code: classification.house_type_code,
            unit_id: options.unit_id.clone(),
            tags: options.tags.clone(),
            description: classification.description,
            created_at: Utc::now().timestamp_millis(),
        };
        Ok(PreparedFile { doc, chunks })
    }

    /// Writes the document. Once this returns `Ok` the file counts as
    /// ingested; a failure to close the job is only logged.
    async fn commit(&self, prepared: PreparedFile, job_id: &str) -> Result<FileDone> {
        let PreparedFile { doc, chunks } = prepared;
        let inserted = self
            .store
            .replace_document(&doc, &chunks)
            .await
            .with_context(|| format!("Failed to store {}", doc.file_name))?;

        let finished = self
            .store
            .finish_job(
                job_id,
                JobStatus::Completed,
                i64::try_from(chunks.len()).unwrap_or(i64::MAX),
                None,
                Utc::now().timestamp_millis(),
            )
            .await;
        if let Err(e) = finished {
            tracing::warn!(job_id, error = %e, "could not mark training job completed");
        }

        tracing::info!(
            file = %doc.file_name,
            house_type = ?doc.house_type_code,
            drawing_type = ?doc.drawing_type,
            discipline = %doc.discipline,
            unit_id = ?doc.unit_id,
            chunks = chunks.len(),
            "file ingested"
        );

        Ok(FileDone {
            chunks: chunks.len(),
            inserted,
        })
    }
}

/// Extraction is CPU-bound and runs on the blocking pool. Errors and
/// panics yield empty text.
async fn extract_or_skip(file_name: &str, bytes: Vec<u8>, mime_type: String) -> String {
    match tokio::task::spawn_blocking(move || extract_text(&bytes, &mime_type)).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            tracing::warn!(file = file_name, error = %e, "text extraction skipped");
            String::new()
        }
        Err(e) => {
            tracing::warn!(file = file_name, error = %e, "text extraction panicked, skipped");
            String::new()
        }
    }
}

pub struct TrainingOrchestrator {
    worker: Arc<FileWorker>,
    store: Arc<dyn Store>,
    validator: FileValidator,
    limiter: RateLimiter,
    max_concurrent: usize,
    file_timeout: Duration,
}

impl TrainingOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        classifier: DrawingClassifier,
        limiter: RateLimiter,
        upload: &UploadConfig,
        max_tokens: usize,
    ) -> Self {
        Self {
            worker: Arc::new(FileWorker {
                store: store.clone(),
                blobs,
                classifier,
                max_tokens,
            }),
            store,
            validator: FileValidator::new(UploadConstraints::from(upload)),
            limiter,
            max_concurrent: upload.max_concurrent.max(1),
            file_timeout: Duration::from_secs(upload.file_timeout_secs),
        }
    }

    pub fn with_file_timeout(mut self, timeout: Duration) -> Self {
        self.file_timeout = timeout;
        self
    }

    /// Full request pipeline for one upload.
    pub async fn handle_upload(
        &self,
        development_id: &str,
        files: Vec<UploadFile>,
    ) -> Result<UploadOutcome, TrainError> {
        self.handle_upload_with(development_id, files, IngestOptions::default())
            .await
    }

    /// [`handle_upload`](Self::handle_upload) with operator metadata. A
    /// `unit_id` must name a unit of the development.
    pub async fn handle_upload_with(
        &self,
        development_id: &str,
        files: Vec<UploadFile>,
        options: IngestOptions,
    ) -> Result<UploadOutcome, TrainError> {
        let development_id = development_id.trim();
        if development_id.is_empty() {
            return Err(TrainError::MissingDevelopment);
        }

        let development = self
            .store
            .development(development_id)
            .await?
            .ok_or_else(|| TrainError::DevelopmentNotFound(development_id.to_string()))?;
        let tenant_id = development
            .tenant_id
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| TrainError::NoTenant(development_id.to_string()))?;

        let options = options.normalized();
        if let Some(unit_id) = &options.unit_id {
            let unit = self.store.unit_identity(unit_id).await?;
            if !unit.is_some_and(|u| u.development_id == development_id) {
                return Err(TrainError::UnitNotInDevelopment(unit_id.clone()));
            }
        }

        let decision = self
            .limiter
            .check(&rate_limit_key(&tenant_id, "train"))
            .await;
        if !decision.allowed {
            tracing::warn!(tenant_id = %tenant_id, "training rate limit exceeded");
            return Err(TrainError::RateLimited {
                decision,
                max_requests: self.limiter.max_requests(),
            });
        }

        let total_files = files.len();
        let validated = self.validator.validate(files)?;
        if validated.valid_files.is_empty() {
            return Err(ValidationError::NoValidFiles {
                errors: validated.errors,
            }
            .into());
        }
        let valid_files = validated.valid_files.len();

        let report = self
            .train_with(validated.valid_files, &tenant_id, development_id, &options)
            .await;

        Ok(UploadOutcome {
            total_files,
            valid_files,
            validation_errors: validated.errors,
            report,
            rate_limit: decision,
        })
    }

    /// Processes `files` in sequential batches of `max_concurrent`.
    pub async fn train(
        &self,
        files: Vec<UploadFile>,
        tenant_id: &str,
        development_id: &str,
    ) -> TrainReport {
        self.train_with(files, tenant_id, development_id, &IngestOptions::default())
            .await
    }

    pub async fn train_with(
        &self,
        files: Vec<UploadFile>,
        tenant_id: &str,
        development_id: &str,
        options: &IngestOptions,
    ) -> TrainReport {
        tracing::info!(
            tenant_id,
            development_id,
            files = files.len(),
            max_concurrent = self.max_concurrent,
            unit_id = ?options.unit_id,
            "training started"
        );

        let mut report = TrainReport::default();
        let mut remaining = files;

        while !remaining.is_empty() {
            let rest = remaining.split_off(remaining.len().min(self.max_concurrent));
            let batch = std::mem::replace(&mut remaining, rest);

            let mut pending = Vec::with_capacity(batch.len());
            let mut handles = Vec::with_capacity(batch.len());
            for file in batch {
                let job_id = Uuid::new_v4().to_string();
                let target = Arc::new(PendingFile {
                    storage_path: blob_path(development_id, &job_id, &file.name),
                    name: file.name.clone(),
                    job_id,
                });
                pending.push(target.clone());

                let worker = self.worker.clone();
                let timeout = self.file_timeout;
                let tenant_id = tenant_id.to_string();
                let development_id = development_id.to_string();
                let options = options.clone();
                handles.push(tokio::spawn(async move {
                    let prepared = tokio::time::timeout(
                        timeout,
                        worker.prepare(file, &target, &tenant_id, &development_id, &options),
                    )
                    .await?;
                    Ok::<_, Elapsed>(match prepared {
                        Ok(prepared) => worker.commit(prepared, &target.job_id).await,
                        Err(e) => Err(e),
                    })
                }));
            }

            let outcomes = join_all(handles).await;

            for (target, outcome) in pending.into_iter().zip(outcomes) {
                report.job_ids.push(target.job_id.clone());
                let failure = match outcome {
                    Ok(Ok(Ok(done))) => {
                        report.total_chunks += done.chunks;
                        report.total_inserted += done.inserted;
                        report.successful_files.push(target.name.clone());
                        continue;
                    }
                    Ok(Ok(Err(e))) => format!("{:#}", e),
                    Ok(Err(_)) => format!(
                        "Processing timed out after {}s",
                        self.file_timeout.as_secs_f64()
                    ),
                    Err(e) if e.is_panic() => "Processing panicked".to_string(),
                    Err(e) => format!("Processing aborted: {}", e),
                };

                tracing::error!(file = %target.name, error = %failure, "file failed");
                self.mark_failed(&target.job_id, &failure).await;
                self.discard_blob(development_id, &target.storage_path).await;
                report.failed_files.push(FailedFile {
                    name: target.name.clone(),
                    error: failure,
                });
            }
        }

        tracing::info!(
            tenant_id,
            development_id,
            succeeded = report.successful_files.len(),
            failed = report.failed_files.len(),
            chunks = report.total_chunks,
            "training finished"
        );
        report
    }

    async fn mark_failed(&self, job_id: &str, error: &str) {
        if let Err(e) = self
            .store
            .finish_job(
                job_id,
                JobStatus::Failed,
                0,
                Some(error),
                Utc::now().timestamp_millis(),
            )
            .await
        {
            tracing::warn!(job_id, error = %e, "could not mark training job failed");
        }
    }

    /// Best-effort removal of a failed file's blob. Kept when a stored
    /// document still points at it.
    async fn discard_blob(&self, development_id: &str, storage_path: &str) {
        match self.store.project_documents(development_id).await {
            Ok(docs) if docs.iter().any(|d| d.storage_path == storage_path) => {
                tracing::warn!(storage_path, "failed file has a stored document, blob kept");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(storage_path, error = %e, "could not check blob references, blob kept");
                return;
            }
        }
        if let Err(e) = self.worker.blobs.delete(storage_path).await {
            tracing::warn!(storage_path, error = %e, "could not remove blob of failed file");
        }
    }
}
