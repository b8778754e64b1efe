//! SQLite [`Store`] backend over the schema created by [`crate::migrate`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use super::Store;
use crate::models::{
    Chunk, Development, DocumentMetadata, DrawingType, JobStatus, TrainingJob, UnitIdentity,
};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const DOCUMENT_COLUMNS: &str = "id, development_id, file_name, title, file_url, storage_path, \
     mime_type, size_bytes, discipline, drawing_type, doc_kind, house_type_code, unit_id, \
     tags_json, description, created_at";

fn document_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DocumentMetadata> {
    let drawing_type: Option<String> = row.try_get("drawing_type")?;
    let tags_json: String = row.try_get("tags_json")?;
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();

    Ok(DocumentMetadata {
        id: row.try_get("id")?,
        development_id: row.try_get("development_id")?,
        file_name: row.try_get("file_name")?,
        title: row.try_get("title")?,
        file_url: row.try_get("file_url")?,
        storage_path: row.try_get("storage_path")?,
        mime_type: row.try_get("mime_type")?,
        size_bytes: row.try_get("size_bytes")?,
        discipline: row.try_get("discipline")?,
        drawing_type: drawing_type.as_deref().and_then(DrawingType::parse),
        doc_kind: row.try_get("doc_kind")?,
        house_type_code: row.try_get("house_type_code")?,
        unit_id: row.try_get("unit_id")?,
        tags,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TrainingJob> {
    let status: String = row.try_get("status")?;
    Ok(TrainingJob {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        development_id: row.try_get("development_id")?,
        file_name: row.try_get("file_name")?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("unknown job status: {}", status))?,
        chunks: row.try_get("chunks")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn add_development(&self, development: &Development) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO developments (id, tenant_id, name) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET tenant_id = excluded.tenant_id, name = excluded.name
            "#,
        )
        .bind(&development.id)
        .bind(&development.tenant_id)
        .bind(&development.name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn development(&self, id: &str) -> Result<Option<Development>> {
        let row = sqlx::query("SELECT id, tenant_id, name FROM developments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> Result<Development> {
            Ok(Development {
                id: r.try_get("id")?,
                tenant_id: r.try_get("tenant_id")?,
                name: r.try_get("name")?,
            })
        })
        .transpose()
    }

    async fn add_unit(&self, unit: &UnitIdentity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO units (id, development_id, house_type_code) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                development_id = excluded.development_id,
                house_type_code = excluded.house_type_code
            "#,
        )
        .bind(&unit.unit_id)
        .bind(&unit.development_id)
        .bind(&unit.house_type_code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unit_identity(&self, unit_id: &str) -> Result<Option<UnitIdentity>> {
        let row = sqlx::query("SELECT id, development_id, house_type_code FROM units WHERE id = ?")
            .bind(unit_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> Result<UnitIdentity> {
            Ok(UnitIdentity {
                unit_id: r.try_get("id")?,
                development_id: r.try_get("development_id")?,
                house_type_code: r.try_get("house_type_code")?,
            })
        })
        .transpose()
    }

    async fn replace_document(&self, doc: &DocumentMetadata, chunks: &[Chunk]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        let existing: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM documents WHERE development_id = ? AND file_name = ?",
        )
        .bind(&doc.development_id)
        .bind(&doc.file_name)
        .fetch_all(&mut *tx)
        .await?;

        for old_id in &existing {
            sqlx::query("DELETE FROM doc_chunks WHERE document_id = ?")
                .bind(old_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM documents WHERE id = ?")
                .bind(old_id)
                .execute(&mut *tx)
                .await?;
        }

        let tags_json = serde_json::to_string(&doc.tags)?;
        sqlx::query(&format!(
            "INSERT INTO documents ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            DOCUMENT_COLUMNS
        ))
        .bind(&doc.id)
        .bind(&doc.development_id)
        .bind(&doc.file_name)
        .bind(&doc.title)
        .bind(&doc.file_url)
        .bind(&doc.storage_path)
        .bind(&doc.mime_type)
        .bind(doc.size_bytes)
        .bind(&doc.discipline)
        .bind(doc.drawing_type.map(|t| t.as_str()))
        .bind(&doc.doc_kind)
        .bind(&doc.house_type_code)
        .bind(&doc.unit_id)
        .bind(&tags_json)
        .bind(&doc.description)
        .bind(doc.created_at)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to insert document {}", doc.file_name))?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO doc_chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&doc.id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(chunks.len())
    }

    async fn project_documents(&self, development_id: &str) -> Result<Vec<DocumentMetadata>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE development_id = ? ORDER BY created_at ASC, file_name ASC",
            DOCUMENT_COLUMNS
        ))
        .bind(development_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn insert_job(&self, job: &TrainingJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO training_jobs
                (id, tenant_id, development_id, file_name, status, chunks, error, created_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.tenant_id)
        .bind(&job.development_id)
        .bind(&job.file_name)
        .bind(job.status.as_str())
        .bind(job.chunks)
        .bind(&job.error)
        .bind(job.created_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await?;
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
        sqlx::query(
            "UPDATE training_jobs SET status = ?, chunks = ?, error = ?, finished_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(chunks)
        .bind(error)
        .bind(finished_at)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn jobs_for(
        &self,
        tenant_id: &str,
        development_id: &str,
        limit: i64,
    ) -> Result<Vec<TrainingJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, development_id, file_name, status, chunks, error, created_at, finished_at
            FROM training_jobs
            WHERE tenant_id = ? AND development_id = ?
            ORDER BY created_at DESC, id ASC
            LIMIT ?
            "#,
        )
        .bind(tenant_id)
        .bind(development_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }
}
