//! Answer generation.
//!
//! Retrieves top-K evidence for a question, asks the oracle for an answer
//! grounded in it, and persists the resulting [`Answer`] with citations.
//! Confidence is the oracle's self-reported certainty capped by evidence
//! quality: weak or absent evidence caps the score no matter how sure the
//! oracle claims to be.

use sqlx::Row;
use uuid::Uuid;

use crate::db::Store;
use crate::embedding::Embedder;
use crate::error::{PipelineError, Result};
use crate::models::{Answer, Citation, DocumentScope, Question, QuestionStatus};
use crate::oracle::Oracle;
use crate::retrieve::{retrieve, Evidence};

/// Confidence ceiling when no evidence was retrieved. Sits below
/// [`crate::oracle::BASELINE_CERTAINTY`] so evidence-free answers are always
/// visibly less trustworthy than the oracle's own baseline.
const EMPTY_EVIDENCE_CAP: f64 = 0.3;

/// Characters of chunk text quoted in a citation snippet.
const SNIPPET_CHARS: usize = 200;

/// Generate (or regenerate) the answer for one question and persist it.
///
/// `force` is the explicit override for human-edited questions: without it a
/// MANUAL_UPDATED question is left untouched.
pub async fn generate_answer(
    store: &Store,
    embedder: &dyn Embedder,
    oracle: &dyn Oracle,
    top_k: usize,
    question: &Question,
    scope: &DocumentScope,
    force: bool,
) -> Result<Answer> {
    if question.status == QuestionStatus::ManualUpdated && !force {
        return Err(PipelineError::invalid(format!(
            "question {} was manually edited; pass force to regenerate",
            question.id
        )));
    }

    let evidence = retrieve(store, embedder, &question.text, scope, top_k).await?;
    let evidence_texts: Vec<String> = evidence.iter().map(|e| e.text.clone()).collect();

    let completion = oracle.answer(&question.text, &evidence_texts).await?;

    let confidence = completion
        .certainty
        .min(confidence_cap(&evidence))
        .clamp(0.0, 1.0);

    let citations: Vec<Citation> = evidence.iter().map(to_citation).collect();

    upsert_answer(
        store,
        &question.project_id,
        &question.id,
        &completion.text,
        confidence,
        &citations,
    )
    .await?;

    set_question_status(store, &question.id, QuestionStatus::AiGenerated).await?;

    answer_for_question(store, &question.id)
        .await?
        .ok_or_else(|| {
            PipelineError::Consistency(format!("answer for question {} vanished", question.id))
        })
}

/// The top retrieved similarity bounds how confident an answer may claim to
/// be; no evidence bounds it hardest.
fn confidence_cap(evidence: &[Evidence]) -> f64 {
    match evidence.first() {
        None => EMPTY_EVIDENCE_CAP,
        Some(top) => 0.4 + 0.6 * top.score,
    }
}

fn to_citation(evidence: &Evidence) -> Citation {
    let snippet: String = evidence.text.chars().take(SNIPPET_CHARS).collect();
    let snippet = if evidence.text.chars().count() > SNIPPET_CHARS {
        format!("{}...", snippet)
    } else {
        snippet
    };

    Citation {
        document_name: evidence.document_name.clone(),
        text_snippet: snippet,
        page_number: None,
        score: evidence.score,
    }
}

/// Insert or replace the single live answer for a question. Regeneration
/// resets any prior evaluation — the score referred to text that no longer
/// exists.
async fn upsert_answer(
    store: &Store,
    project_id: &str,
    question_id: &str,
    answer_text: &str,
    confidence: f64,
    citations: &[Citation],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let citations_json =
        serde_json::to_string(citations).unwrap_or_else(|_| "[]".to_string());

    sqlx::query(
        r#"
        INSERT INTO answers (id, project_id, question_id, answer_text, confidence_score,
                             citations_json, evaluation_score, ground_truth, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?)
        ON CONFLICT(question_id) DO UPDATE SET
            answer_text = excluded.answer_text,
            confidence_score = excluded.confidence_score,
            citations_json = excluded.citations_json,
            evaluation_score = NULL,
            ground_truth = NULL,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(format!("ans_{}", Uuid::new_v4()))
    .bind(project_id)
    .bind(question_id)
    .bind(answer_text)
    .bind(confidence)
    .bind(citations_json)
    .bind(now)
    .bind(now)
    .execute(store.pool())
    .await?;

    Ok(())
}

pub(crate) async fn set_question_status(
    store: &Store,
    question_id: &str,
    status: QuestionStatus,
) -> Result<()> {
    sqlx::query("UPDATE questions SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(question_id)
        .execute(store.pool())
        .await?;
    Ok(())
}

pub async fn answer_for_question(store: &Store, question_id: &str) -> Result<Option<Answer>> {
    let row = sqlx::query("SELECT * FROM answers WHERE question_id = ?")
        .bind(question_id)
        .fetch_optional(store.pool())
        .await?;
    Ok(row.map(|r| row_to_answer(&r)))
}

pub(crate) fn row_to_answer(row: &sqlx::sqlite::SqliteRow) -> Answer {
    let citations_json: String = row.get("citations_json");
    Answer {
        id: row.get("id"),
        project_id: row.get("project_id"),
        question_id: row.get("question_id"),
        answer_text: row.get("answer_text"),
        confidence_score: row.get("confidence_score"),
        citations: serde_json::from_str(&citations_json).unwrap_or_default(),
        evaluation_score: row.get("evaluation_score"),
        ground_truth: row.get("ground_truth"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieve::Evidence;

    fn evidence(score: f64) -> Evidence {
        Evidence {
            chunk_id: "c1".into(),
            document_id: "d1".into(),
            document_name: "Fund Overview".into(),
            ordinal: 0,
            text: "x".repeat(300),
            score,
        }
    }

    #[test]
    fn empty_evidence_caps_below_baseline() {
        assert!(confidence_cap(&[]) < crate::oracle::BASELINE_CERTAINTY);
    }

    #[test]
    fn cap_scales_with_top_similarity() {
        let weak = confidence_cap(&[evidence(0.2)]);
        let strong = confidence_cap(&[evidence(0.95)]);
        assert!(strong > weak);
        assert!(strong <= 1.0);
    }

    #[test]
    fn snippet_is_truncated_with_ellipsis() {
        let citation = to_citation(&evidence(0.8));
        assert!(citation.text_snippet.ends_with("..."));
        assert_eq!(citation.text_snippet.chars().count(), SNIPPET_CHARS + 3);
        assert_eq!(citation.document_name, "Fund Overview");
    }

    #[test]
    fn short_text_is_not_truncated() {
        let mut e = evidence(0.8);
        e.text = "short snippet".into();
        let citation = to_citation(&e);
        assert_eq!(citation.text_snippet, "short snippet");
    }
}
