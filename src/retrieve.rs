//! Scoped vector retrieval.
//!
//! Embeds the question, scans the stored vectors of INDEXED documents inside
//! the requested scope, and returns the top-K chunks by cosine similarity
//! mapped to [0, 1]. Ties break by document registration order then chunk
//! ordinal, so identical corpora always retrieve identically.
//!
//! An empty index (or an empty scope) yields an empty list, never an error —
//! generation handles the evidence-free path.

use sqlx::Row;

use crate::db::Store;
use crate::embedding::{blob_to_vec, embed_query, similarity_score, Embedder};
use crate::error::Result;
use crate::models::DocumentScope;

/// A retrieved chunk with its similarity to the question.
#[derive(Debug, Clone)]
pub struct Evidence {
    pub chunk_id: String,
    pub document_id: String,
    pub document_name: String,
    pub ordinal: i64,
    pub text: String,
    /// Similarity in [0, 1].
    pub score: f64,
}

/// Return the top-`k` most similar chunks within `scope`, best first.
pub async fn retrieve(
    store: &Store,
    embedder: &dyn Embedder,
    question: &str,
    scope: &DocumentScope,
    k: usize,
) -> Result<Vec<Evidence>> {
    if k == 0 || question.trim().is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        r#"
        SELECT cv.chunk_id, cv.document_id, cv.embedding,
               c.ordinal, c.text,
               d.name AS document_name, d.created_at AS doc_created_at
        FROM chunk_vectors cv
        JOIN chunks c ON c.id = cv.chunk_id
        JOIN documents d ON d.id = cv.document_id
        WHERE d.status = 'INDEXED'
        "#,
    )
    .fetch_all(store.pool())
    .await?;

    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let query_vec = embed_query(embedder, question).await?;

    struct Scored {
        evidence: Evidence,
        doc_created_at: i64,
    }

    let mut scored: Vec<Scored> = rows
        .iter()
        .filter(|row| {
            let document_id: String = row.get("document_id");
            scope.contains(&document_id)
        })
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let vec = blob_to_vec(&blob);
            Scored {
                evidence: Evidence {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    document_name: row.get("document_name"),
                    ordinal: row.get("ordinal"),
                    text: row.get("text"),
                    score: similarity_score(&query_vec, &vec),
                },
                doc_created_at: row.get("doc_created_at"),
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.evidence
            .score
            .partial_cmp(&a.evidence.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.doc_created_at.cmp(&b.doc_created_at))
            .then(a.evidence.document_id.cmp(&b.evidence.document_id))
            .then(a.evidence.ordinal.cmp(&b.evidence.ordinal))
    });
    scored.truncate(k);

    Ok(scored.into_iter().map(|s| s.evidence).collect())
}
