//! Answer evaluation against ground truth.
//!
//! Scores are semantic: both texts go through the same embedder used for
//! retrieval, and the score is their cosine similarity mapped to [0, 1].
//! Identical text scores 1.0; unrelated text scores strictly lower regardless
//! of surface overlap. Entries are processed independently — an unknown
//! question key fails that entry and the rest continue.

use std::collections::BTreeMap;

use serde::Serialize;
use sqlx::Row;
use tracing::info;

use crate::db::Store;
use crate::embedding::{embed_query, similarity_score, Embedder};
use crate::error::{PipelineError, Result};
use crate::generate::answer_for_question;
use crate::project::{load_project, project_questions};

/// Per-question outcome of an evaluation run.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    /// question id → evaluation score in [0, 1].
    pub scores: BTreeMap<String, f64>,
    /// question id → why that entry could not be scored.
    pub failures: BTreeMap<String, String>,
    /// Mean over all scored answers in the project, after this run.
    pub average_score: Option<f64>,
}

/// Evaluate a project's answers against `ground_truth` (question id → text).
pub async fn evaluate_project(
    store: &Store,
    embedder: &dyn Embedder,
    project_id: &str,
    ground_truth: &BTreeMap<String, String>,
) -> Result<EvaluationReport> {
    if ground_truth.is_empty() {
        return Err(PipelineError::invalid("ground_truth_map must not be empty"));
    }

    // Project must exist; individual bad keys are per-entry failures.
    load_project(store, project_id).await?;
    let known: Vec<String> = project_questions(store, project_id)
        .await?
        .into_iter()
        .map(|q| q.id)
        .collect();

    let mut scores = BTreeMap::new();
    let mut failures = BTreeMap::new();

    for (question_id, truth) in ground_truth {
        if !known.iter().any(|id| id == question_id) {
            failures.insert(
                question_id.clone(),
                format!("unknown question in project {}", project_id),
            );
            continue;
        }

        let Some(answer) = answer_for_question(store, question_id).await? else {
            failures.insert(question_id.clone(), "question has no answer yet".to_string());
            continue;
        };

        if truth.trim().is_empty() || answer.answer_text.trim().is_empty() {
            failures.insert(
                question_id.clone(),
                "answer or ground truth is empty".to_string(),
            );
            continue;
        }

        let answer_vec = embed_query(embedder, &answer.answer_text).await?;
        let truth_vec = embed_query(embedder, truth).await?;
        let score = similarity_score(&answer_vec, &truth_vec);

        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE answers SET evaluation_score = ?, ground_truth = ?, updated_at = ? WHERE id = ?",
        )
        .bind(score)
        .bind(truth)
        .bind(now)
        .bind(&answer.id)
        .execute(store.pool())
        .await?;

        scores.insert(question_id.clone(), score);
    }

    let average_score = recompute_average(store, project_id).await?;
    info!(
        project_id,
        scored = scores.len(),
        failed = failures.len(),
        "evaluation run finished"
    );

    Ok(EvaluationReport {
        scores,
        failures,
        average_score,
    })
}

/// Arithmetic mean over all scored answers, written back onto the project.
async fn recompute_average(store: &Store, project_id: &str) -> Result<Option<f64>> {
    let row = sqlx::query(
        "SELECT AVG(evaluation_score) AS avg_score FROM answers
         WHERE project_id = ? AND evaluation_score IS NOT NULL",
    )
    .bind(project_id)
    .fetch_one(store.pool())
    .await?;
    let average: Option<f64> = row.get("avg_score");

    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE projects SET average_evaluation_score = ?, updated_at = ? WHERE id = ?")
        .bind(average)
        .bind(now)
        .bind(project_id)
        .execute(store.pool())
        .await?;

    Ok(average)
}
