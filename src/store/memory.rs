//! In-memory [`Store`] for tests.
//!
//! `HashMap`s and `Vec`s behind `std::sync::RwLock`; no guard is held across
//! an await. [`MemoryStore::fail_documents`] makes document queries
//! error, to exercise the "store unavailable" paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::Store;
use crate::models::{Chunk, Development, DocumentMetadata, JobStatus, TrainingJob, UnitIdentity};

#[derive(Default)]
pub struct MemoryStore {
    developments: RwLock<HashMap<String, Development>>,
    units: RwLock<HashMap<String, UnitIdentity>>,
    documents: RwLock<Vec<DocumentMetadata>>,
    chunks: RwLock<HashMap<String, Vec<Chunk>>>,
    jobs: RwLock<Vec<TrainingJob>>,
    fail_documents: AtomicBool,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every document query fails.
    pub fn fail_documents(&self, fail: bool) {
        self.fail_documents.store(fail, Ordering::SeqCst);
    }

    pub fn chunks_for(&self, document_id: &str) -> Vec<Chunk> {
        read(&self.chunks)
            .map(|c| c.get(document_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<()> {
        if self.fail_documents.load(Ordering::SeqCst) {
            bail!("document store unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add_development(&self, development: &Development) -> Result<()> {
        write(&self.developments)?.insert(development.id.clone(), development.clone());
        Ok(())
    }

    async fn development(&self, id: &str) -> Result<Option<Development>> {
        Ok(read(&self.developments)?.get(id).cloned())
    }

    async fn add_unit(&self, unit: &UnitIdentity) -> Result<()> {
        write(&self.units)?.insert(unit.unit_id.clone(), unit.clone());
        Ok(())
    }

    async fn unit_identity(&self, unit_id: &str) -> Result<Option<UnitIdentity>> {
        Ok(read(&self.units)?.get(unit_id).cloned())
    }

    async fn replace_document(&self, doc: &DocumentMetadata, chunks: &[Chunk]) -> Result<usize> {
        self.check_available()?;
        let replaced: Vec<String> = {
            let mut docs = write(&self.documents)?;
            let old = docs
                .iter()
                .filter(|d| d.development_id == doc.development_id && d.file_name == doc.file_name)
                .map(|d| d.id.clone())
                .collect();
            docs.retain(|d| !(d.development_id == doc.development_id && d.file_name == doc.file_name));
            docs.push(doc.clone());
            old
        };

        let mut stored = write(&self.chunks)?;
        for id in replaced {
            stored.remove(&id);
        }
        stored.insert(doc.id.clone(), chunks.to_vec());
        Ok(chunks.len())
    }

    async fn project_documents(&self, development_id: &str) -> Result<Vec<DocumentMetadata>> {
        self.check_available()?;
        Ok(read(&self.documents)?
            .iter()
            .filter(|d| d.development_id == development_id)
            .cloned()
            .collect())
    }

    async fn insert_job(&self, job: &TrainingJob) -> Result<()> {
        write(&self.jobs)?.push(job.clone());
        Ok(())
    }

    async fn finish_job(
        &self,
        job_id: &str,
        status: JobStatus,
        chunks: i64,
        error: Option<&str>,
        finished_at: i64,
    ) -> Result<()> {
        let mut jobs = write(&self.jobs)?;
        let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) else {
            bail!("unknown training job: {}", job_id);
        };
        job.status = status;
        job.chunks = chunks;
        job.error = error.map(|e| e.to_string());
        job.finished_at = Some(finished_at);
        Ok(())
    }

    async fn jobs_for(
        &self,
        tenant_id: &str,
        development_id: &str,
        limit: i64,
    ) -> Result<Vec<TrainingJob>> {
        let mut jobs: Vec<TrainingJob> = read(&self.jobs)?
            .iter()
            .filter(|j| j.tenant_id == tenant_id && j.development_id == development_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(jobs)
    }
}
