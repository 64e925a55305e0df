//! Document indexing pipeline.
//!
//! Orchestrates loader → chunker → embedder → index insertion and tracks
//! per-document status. The chunk set and the INDEXED status flip are
//! committed in one transaction, so the retriever either sees a document's
//! full chunk set or nothing — a failed or cancelled run leaves whatever was
//! committed before it started.

use sqlx::Row;
use std::path::Path;
use tracing::{error, info};
use uuid::Uuid;

use crate::chunk::chunk_text;
use crate::config::ChunkingConfig;
use crate::db::Store;
use crate::embedding::{vec_to_blob, Embedder};
use crate::error::{PipelineError, Result};
use crate::jobs::JobTracker;
use crate::loader::load_text;
use crate::models::{Document, DocumentStatus, ProjectStatus};

/// Register a document for indexing. Validates that the source is a readable
/// file before accepting; the heavy extraction happens in the worker.
pub async fn register_document(store: &Store, name: &str, source_path: &str) -> Result<Document> {
    if name.trim().is_empty() {
        return Err(PipelineError::invalid("doc_name must not be empty"));
    }
    if !Path::new(source_path).is_file() {
        return Err(PipelineError::invalid(format!(
            "file_path is not a readable file: {}",
            source_path
        )));
    }

    let now = chrono::Utc::now().timestamp();
    let doc = Document {
        id: format!("doc_{}", Uuid::new_v4()),
        name: name.to_string(),
        source_path: source_path.to_string(),
        status: DocumentStatus::Pending,
        chunk_count: 0,
        error: None,
        created_at: now,
        indexed_at: None,
    };

    sqlx::query(
        r#"
        INSERT INTO documents (id, name, source_path, status, chunk_count, error, created_at, indexed_at)
        VALUES (?, ?, ?, ?, 0, NULL, ?, NULL)
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.name)
    .bind(&doc.source_path)
    .bind(doc.status.as_str())
    .bind(doc.created_at)
    .execute(store.pool())
    .await?;

    Ok(doc)
}

/// The indexing worker body. Runs on its own task; all outcomes are recorded
/// on the job and the document row.
pub async fn run_index_job(
    store: &Store,
    embedder: &dyn Embedder,
    chunking: &ChunkingConfig,
    tracker: &JobTracker,
    job_id: &str,
    document_id: &str,
) {
    let result = index_document(store, embedder, chunking, tracker, job_id, document_id).await;
    match result {
        Ok(IndexOutcome::Indexed { chunk_count }) => {
            info!(document_id, chunk_count, "document indexed");
            let _ = tracker
                .complete(job_id, &format!("Indexed {} chunks.", chunk_count))
                .await;
        }
        Ok(IndexOutcome::Cancelled) => {
            info!(document_id, "indexing cancelled");
            let _ = tracker.fail_cancelled(job_id).await;
        }
        Err(e) => {
            error!(document_id, error = %e, "indexing failed");
            let _ = mark_document_failed(store, document_id, &e.to_string()).await;
            let _ = tracker.fail(job_id, &e).await;
        }
    }
}

enum IndexOutcome {
    Indexed { chunk_count: usize },
    Cancelled,
}

async fn index_document(
    store: &Store,
    embedder: &dyn Embedder,
    chunking: &ChunkingConfig,
    tracker: &JobTracker,
    job_id: &str,
    document_id: &str,
) -> Result<IndexOutcome> {
    let doc = get_document(store, document_id).await?;
    let prior_status = doc.status;

    tracker.start(job_id, "Loading document text...").await?;
    set_document_status(store, document_id, DocumentStatus::Indexing).await?;

    // Extraction is blocking CPU work; keep it off the async runtime.
    let source_path = std::path::PathBuf::from(&doc.source_path);
    let text = tokio::task::spawn_blocking(move || load_text(&source_path))
        .await
        .map_err(|e| PipelineError::Consistency(format!("loader task panicked: {}", e)))??;

    tracker.update(job_id, 0.2, "Chunking...").await?;
    let chunks = chunk_text(document_id, &text, chunking.chunk_chars, chunking.overlap_chars);
    if chunks.is_empty() {
        return Err(PipelineError::invalid(format!(
            "document {} is empty after extraction",
            doc.name
        )));
    }

    // Embed batch by batch, checking for cooperative cancellation between
    // batches. Nothing is written until every vector is in hand.
    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
    let batch_size = 64usize;
    let total_batches = chunks.len().div_ceil(batch_size);

    for (i, batch) in chunks.chunks(batch_size).enumerate() {
        if tracker.cancel_requested(job_id).await? {
            set_document_status(store, document_id, prior_status).await?;
            return Ok(IndexOutcome::Cancelled);
        }

        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let batch_vectors = embedder.embed(&texts).await?;
        if batch_vectors.len() != batch.len() {
            return Err(PipelineError::Consistency(format!(
                "embedder returned {} vectors for {} chunks",
                batch_vectors.len(),
                batch.len()
            )));
        }
        vectors.extend(batch_vectors);

        let progress = 0.2 + 0.6 * ((i + 1) as f64 / total_batches as f64);
        tracker
            .update(
                job_id,
                progress,
                &format!("Embedding chunks ({}/{} batches)...", i + 1, total_batches),
            )
            .await?;
    }

    if tracker.cancel_requested(job_id).await? {
        set_document_status(store, document_id, prior_status).await?;
        return Ok(IndexOutcome::Cancelled);
    }

    tracker.update(job_id, 0.9, "Committing index...").await?;

    // Atomic visibility: replace the chunk set and flip the status in one
    // transaction.
    let now = chrono::Utc::now().timestamp();
    let mut tx = store.pool().begin().await?;

    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
        sqlx::query("INSERT INTO chunks (id, document_id, ordinal, text) VALUES (?, ?, ?, ?)")
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.ordinal)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO chunk_vectors (chunk_id, document_id, dims, embedding) VALUES (?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(embedder.dims() as i64)
        .bind(vec_to_blob(vector))
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        "UPDATE documents SET status = ?, chunk_count = ?, error = NULL, indexed_at = ? WHERE id = ?",
    )
    .bind(DocumentStatus::Indexed.as_str())
    .bind(chunks.len() as i64)
    .bind(now)
    .bind(document_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    mark_scoped_projects_outdated(store, document_id).await?;

    Ok(IndexOutcome::Indexed {
        chunk_count: chunks.len(),
    })
}

/// COMPLETED projects whose scope covers a freshly indexed document are no
/// longer up to date.
async fn mark_scoped_projects_outdated(store: &Store, document_id: &str) -> Result<()> {
    let rows = sqlx::query("SELECT id, document_scope FROM projects WHERE status = 'COMPLETED'")
        .fetch_all(store.pool())
        .await?;

    let now = chrono::Utc::now().timestamp();
    for row in rows {
        let project_id: String = row.get("id");
        let scope = crate::models::DocumentScope::from_db_string(&row.get::<String, _>("document_scope"));
        if scope.contains(document_id) {
            sqlx::query("UPDATE projects SET status = ?, updated_at = ? WHERE id = ?")
                .bind(ProjectStatus::Outdated.as_str())
                .bind(now)
                .bind(&project_id)
                .execute(store.pool())
                .await?;
            info!(%project_id, %document_id, "project marked OUTDATED");
        }
    }
    Ok(())
}

async fn set_document_status(store: &Store, document_id: &str, status: DocumentStatus) -> Result<()> {
    sqlx::query("UPDATE documents SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(document_id)
        .execute(store.pool())
        .await?;
    Ok(())
}

async fn mark_document_failed(store: &Store, document_id: &str, message: &str) -> Result<()> {
    sqlx::query("UPDATE documents SET status = ?, error = ? WHERE id = ?")
        .bind(DocumentStatus::Failed.as_str())
        .bind(message)
        .bind(document_id)
        .execute(store.pool())
        .await?;
    Ok(())
}

pub async fn get_document(store: &Store, document_id: &str) -> Result<Document> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_optional(store.pool())
        .await?
        .ok_or_else(|| PipelineError::not_found("document", document_id))?;
    Ok(row_to_document(&row))
}

/// All registered documents, oldest first (registration order).
pub async fn list_documents(store: &Store) -> Result<Vec<Document>> {
    let rows = sqlx::query("SELECT * FROM documents ORDER BY created_at ASC, id ASC")
        .fetch_all(store.pool())
        .await?;
    Ok(rows.iter().map(row_to_document).collect())
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Document {
    let status: String = row.get("status");
    Document {
        id: row.get("id"),
        name: row.get("name"),
        source_path: row.get("source_path"),
        status: DocumentStatus::parse(&status).unwrap_or(DocumentStatus::Failed),
        chunk_count: row.get("chunk_count"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        indexed_at: row.get("indexed_at"),
    }
}
