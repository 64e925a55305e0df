//! Project orchestration: lifecycle state machine and generation fan-out.
//!
//! Owns every Project status transition:
//!
//! ```text
//! PROCESSING ──► COMPLETED ──► OUTDATED ─┐
//!     ▲  ▲           ▲                   │ resume/regenerate
//!     │  └───────────┴───────────────────┘
//!     │ resume
//!  FAILED ◄── any state, on the first task error
//! ```
//!
//! Creation parses the questionnaire into ordered questions and fans out one
//! generation task per question with bounded parallelism; resume re-fans-out
//! only for questions lacking an answer (or all of them with `force`).
//! Generation stops at the first error: committed answers stay, the failing
//! question gets no partial answer, and the error is recorded as
//! `last_error`.

use sqlx::Row;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::Store;
use crate::embedding::Embedder;
use crate::error::{PipelineError, Result};
use crate::flight::FlightGuard;
use crate::generate::{self, generate_answer, row_to_answer};
use crate::jobs::JobTracker;
use crate::models::{
    Answer, DocumentScope, Project, ProjectStatus, Question, QuestionStatus,
};
use crate::oracle::Oracle;

/// Everything a generation worker needs; cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct GenerationCtx {
    pub store: Store,
    pub embedder: Arc<dyn Embedder>,
    pub oracle: Arc<dyn Oracle>,
    pub tracker: JobTracker,
    pub flights: FlightGuard,
    /// Evidence chunks retrieved per question.
    pub top_k: usize,
    /// Concurrent per-question generation bound within one project.
    pub concurrency: usize,
}

// ============ Creation ============

/// Insert a new PROCESSING project with its ordered questions.
pub async fn create_project(
    store: &Store,
    name: &str,
    questionnaire_source: &str,
    scope: DocumentScope,
    question_texts: &[String],
) -> Result<Project> {
    if name.trim().is_empty() {
        return Err(PipelineError::invalid("project name must not be empty"));
    }
    if question_texts.is_empty() {
        return Err(PipelineError::invalid(
            "questionnaire contains no questions",
        ));
    }

    let now = chrono::Utc::now().timestamp();
    let project_id = format!("proj_{}", Uuid::new_v4());

    let mut tx = store.pool().begin().await?;

    sqlx::query(
        r#"
        INSERT INTO projects (id, name, questionnaire_source, document_scope, status,
                              question_count, average_evaluation_score, last_error,
                              created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?)
        "#,
    )
    .bind(&project_id)
    .bind(name)
    .bind(questionnaire_source)
    .bind(scope.to_db_string())
    .bind(ProjectStatus::Processing.as_str())
    .bind(question_texts.len() as i64)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    for (i, text) in question_texts.iter().enumerate() {
        let order = (i + 1) as i64;
        sqlx::query(
            "INSERT INTO questions (id, project_id, text, ord, status) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(format!("{}_q_{}", project_id, order))
        .bind(&project_id)
        .bind(text)
        .bind(order)
        .bind(QuestionStatus::Pending.as_str())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    load_project(store, &project_id).await
}

// ============ Generation workers ============

/// Worker body for PROJECT_CREATION and BULK_ANSWER jobs.
pub async fn run_generation_job(ctx: GenerationCtx, job_id: String, project_id: String, force: bool) {
    match generate_project_answers(&ctx, &job_id, &project_id, force).await {
        Ok(RunOutcome::Done { generated, skipped }) => {
            let status = match finalize_project(&ctx.store, &project_id).await {
                Ok(s) => s,
                Err(e) => {
                    error!(%project_id, error = %e, "finalize failed");
                    let _ = ctx.tracker.fail(&job_id, &e).await;
                    return;
                }
            };
            info!(%project_id, generated, skipped, status = status.as_str(), "generation finished");
            let _ = ctx
                .tracker
                .complete(
                    &job_id,
                    &format!("Generated {} answers ({} skipped).", generated, skipped),
                )
                .await;
        }
        Ok(RunOutcome::Cancelled) => {
            warn!(%project_id, "generation cancelled");
            let _ = finalize_project(&ctx.store, &project_id).await;
            let _ = ctx.tracker.fail_cancelled(&job_id).await;
        }
        Err(e) => {
            error!(%project_id, error = %e, "generation failed");
            let _ = set_project_failed(&ctx.store, &project_id, &e.to_string()).await;
            let _ = ctx.tracker.fail(&job_id, &e).await;
        }
    }
}

/// Worker body for SINGLE_ANSWER jobs. An explicit per-question request
/// overrides manual-edit protection.
pub async fn run_single_answer_job(
    ctx: GenerationCtx,
    job_id: String,
    project_id: String,
    question_id: String,
) {
    let result = async {
        ctx.tracker
            .start(&job_id, &format!("Generating answer for {}...", question_id))
            .await?;

        let project = load_project(&ctx.store, &project_id).await?;
        let question = load_question(&ctx.store, &project_id, &question_id).await?;

        let _permit = ctx.flights.try_acquire(&question.id).ok_or_else(|| {
            PipelineError::busy(format!("generation already in flight for {}", question.id))
        })?;

        generate_answer(
            &ctx.store,
            ctx.embedder.as_ref(),
            ctx.oracle.as_ref(),
            ctx.top_k,
            &question,
            &project.document_scope,
            true,
        )
        .await?;

        finalize_project(&ctx.store, &project_id).await?;
        Ok::<(), PipelineError>(())
    }
    .await;

    match result {
        Ok(()) => {
            let _ = ctx.tracker.complete(&job_id, "Answer generated.").await;
        }
        Err(e) => {
            error!(%project_id, %question_id, error = %e, "single answer generation failed");
            let _ = ctx.tracker.fail(&job_id, &e).await;
        }
    }
}

enum RunOutcome {
    Done { generated: usize, skipped: usize },
    Cancelled,
}

enum TaskOutcome {
    Generated,
    /// Another request holds the question's flight permit; its writer will
    /// produce the answer.
    Busy,
    /// The task observed the abort flag or a cancel request and did nothing.
    Aborted,
    CancelNoticed,
}

async fn generate_project_answers(
    ctx: &GenerationCtx,
    job_id: &str,
    project_id: &str,
    force: bool,
) -> Result<RunOutcome> {
    ctx.tracker.start(job_id, "Generating answers...").await?;

    // Entering generation always moves the project to PROCESSING and clears
    // the previous failure.
    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE projects SET status = ?, last_error = NULL, updated_at = ? WHERE id = ?")
        .bind(ProjectStatus::Processing.as_str())
        .bind(now)
        .bind(project_id)
        .execute(ctx.store.pool())
        .await?;

    let project = load_project(&ctx.store, project_id).await?;
    let questions = project_questions(&ctx.store, project_id).await?;

    let mut targets = Vec::new();
    for question in questions {
        if force {
            targets.push(question);
            continue;
        }
        // Resume: unanswered questions only, and never a human edit. An
        // evidence-free answer (empty citations) counts as missing — it was a
        // placeholder produced before any document covered the question.
        if question.status == QuestionStatus::ManualUpdated {
            continue;
        }
        match generate::answer_for_question(&ctx.store, &question.id).await? {
            None => targets.push(question),
            Some(answer) if answer.citations.is_empty() => targets.push(question),
            Some(_) => {}
        }
    }

    let total = targets.len();
    if total == 0 {
        return Ok(RunOutcome::Done {
            generated: 0,
            skipped: 0,
        });
    }

    let semaphore = Arc::new(Semaphore::new(ctx.concurrency));
    let abort = Arc::new(AtomicBool::new(false));
    let mut join_set: JoinSet<std::result::Result<TaskOutcome, (String, PipelineError)>> =
        JoinSet::new();

    for question in targets {
        let ctx = ctx.clone();
        let job_id = job_id.to_string();
        let scope = project.document_scope.clone();
        let semaphore = Arc::clone(&semaphore);
        let abort = Arc::clone(&abort);

        join_set.spawn(async move {
            let _slot = semaphore
                .acquire_owned()
                .await
                .map_err(|_| (question.id.clone(), PipelineError::busy("worker pool closed")))?;

            if abort.load(Ordering::SeqCst) {
                return Ok(TaskOutcome::Aborted);
            }
            match ctx.tracker.cancel_requested(&job_id).await {
                Ok(true) => return Ok(TaskOutcome::CancelNoticed),
                Ok(false) => {}
                Err(e) => return Err((question.id.clone(), e)),
            }

            let Some(_permit) = ctx.flights.try_acquire(&question.id) else {
                return Ok(TaskOutcome::Busy);
            };

            // One bounded in-worker retry for transient oracle failures, on
            // top of the HTTP-level backoff inside the providers.
            let mut attempts = 0u32;
            loop {
                match generate_answer(
                    &ctx.store,
                    ctx.embedder.as_ref(),
                    ctx.oracle.as_ref(),
                    ctx.top_k,
                    &question,
                    &scope,
                    force,
                )
                .await
                {
                    Ok(_) => return Ok(TaskOutcome::Generated),
                    Err(e) if e.is_retryable() && attempts < 1 => {
                        attempts += 1;
                        warn!(question_id = %question.id, error = %e, "retrying generation");
                        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                    }
                    Err(e) => return Err((question.id.clone(), e)),
                }
            }
        });
    }

    let mut generated = 0usize;
    let mut skipped = 0usize;
    let mut cancelled = false;
    let mut first_error: Option<(String, PipelineError)> = None;

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(TaskOutcome::Generated)) => {
                generated += 1;
                let progress = 0.1 + 0.9 * (generated as f64 / total as f64);
                let _ = ctx
                    .tracker
                    .update(
                        job_id,
                        progress,
                        &format!("Generating answer {}/{}...", generated, total),
                    )
                    .await;
            }
            Ok(Ok(TaskOutcome::Busy)) => skipped += 1,
            Ok(Ok(TaskOutcome::Aborted)) => {}
            Ok(Ok(TaskOutcome::CancelNoticed)) => {
                cancelled = true;
                abort.store(true, Ordering::SeqCst);
            }
            Ok(Err((question_id, e))) => {
                if first_error.is_none() {
                    abort.store(true, Ordering::SeqCst);
                    first_error = Some((question_id, e));
                }
            }
            Err(join_err) => {
                if first_error.is_none() {
                    abort.store(true, Ordering::SeqCst);
                    first_error = Some((
                        String::new(),
                        PipelineError::Consistency(format!("generation task panicked: {}", join_err)),
                    ));
                }
            }
        }
    }

    if let Some((question_id, e)) = first_error {
        return Err(decorate_error(&question_id, e));
    }

    if cancelled {
        return Ok(RunOutcome::Cancelled);
    }

    Ok(RunOutcome::Done { generated, skipped })
}

/// Prefix the failing question onto the error message, keeping the variant
/// (a retryable upstream error must stay retryable for the job record).
fn decorate_error(question_id: &str, e: PipelineError) -> PipelineError {
    if question_id.is_empty() {
        return e;
    }
    let message = format!("question {}: {}", question_id, e);
    match e {
        PipelineError::Upstream { retryable, .. } => PipelineError::Upstream { message, retryable },
        PipelineError::InvalidInput(_) => PipelineError::InvalidInput(message),
        PipelineError::ResourceBusy(_) => PipelineError::ResourceBusy(message),
        PipelineError::Consistency(_) => PipelineError::Consistency(message),
        other => other,
    }
}

// ============ State transitions ============

/// Flip the project to COMPLETED exactly when every question has an answer.
/// Incomplete projects keep their current (PROCESSING) status.
pub async fn finalize_project(store: &Store, project_id: &str) -> Result<ProjectStatus> {
    let project = load_project(store, project_id).await?;
    if project.answered_count >= project.question_count {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE projects SET status = ?, last_error = NULL, updated_at = ? WHERE id = ?")
            .bind(ProjectStatus::Completed.as_str())
            .bind(now)
            .bind(project_id)
            .execute(store.pool())
            .await?;
        return Ok(ProjectStatus::Completed);
    }
    Ok(project.status)
}

pub async fn set_project_failed(store: &Store, project_id: &str, message: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE projects SET status = ?, last_error = ?, updated_at = ? WHERE id = ?")
        .bind(ProjectStatus::Failed.as_str())
        .bind(message)
        .bind(now)
        .bind(project_id)
        .execute(store.pool())
        .await?;
    Ok(())
}

// ============ Manual review actions ============

/// How an `update-answer` request addresses its target.
pub enum AnswerRef {
    ById(String),
    ByQuestion(String),
}

/// Apply a human edit to an answer. New text marks the question
/// MANUAL_UPDATED; an explicit status (CONFIRMED, REJECTED, ...) overrides
/// that.
pub async fn update_answer_manual(
    store: &Store,
    answer_ref: AnswerRef,
    new_text: Option<&str>,
    new_status: Option<QuestionStatus>,
) -> Result<Answer> {
    let answer = match &answer_ref {
        AnswerRef::ById(id) => {
            let row = sqlx::query("SELECT * FROM answers WHERE id = ?")
                .bind(id)
                .fetch_optional(store.pool())
                .await?
                .ok_or_else(|| PipelineError::not_found("answer", id.clone()))?;
            row_to_answer(&row)
        }
        AnswerRef::ByQuestion(question_id) => generate::answer_for_question(store, question_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("answer", question_id.clone()))?,
    };

    if new_text.is_none() && new_status.is_none() {
        return Err(PipelineError::invalid(
            "update-answer requires answer_text or status",
        ));
    }

    let now = chrono::Utc::now().timestamp();
    if let Some(text) = new_text {
        if text.trim().is_empty() {
            return Err(PipelineError::invalid("answer_text must not be empty"));
        }
        sqlx::query("UPDATE answers SET answer_text = ?, updated_at = ? WHERE id = ?")
            .bind(text)
            .bind(now)
            .bind(&answer.id)
            .execute(store.pool())
            .await?;
        generate::set_question_status(store, &answer.question_id, QuestionStatus::ManualUpdated)
            .await?;
    }

    if let Some(status) = new_status {
        generate::set_question_status(store, &answer.question_id, status).await?;
    }

    let row = sqlx::query("SELECT * FROM answers WHERE id = ?")
        .bind(&answer.id)
        .fetch_one(store.pool())
        .await?;
    Ok(row_to_answer(&row))
}

// ============ Queries ============

pub async fn load_project(store: &Store, project_id: &str) -> Result<Project> {
    let row = sqlx::query(
        r#"
        SELECT p.*, (SELECT COUNT(*) FROM answers a WHERE a.project_id = p.id) AS answered_count
        FROM projects p WHERE p.id = ?
        "#,
    )
    .bind(project_id)
    .fetch_optional(store.pool())
    .await?
    .ok_or_else(|| PipelineError::not_found("project", project_id))?;
    Ok(row_to_project(&row))
}

/// All projects, most recently updated first.
pub async fn list_projects(store: &Store) -> Result<Vec<Project>> {
    let rows = sqlx::query(
        r#"
        SELECT p.*, (SELECT COUNT(*) FROM answers a WHERE a.project_id = p.id) AS answered_count
        FROM projects p ORDER BY p.updated_at DESC, p.id ASC
        "#,
    )
    .fetch_all(store.pool())
    .await?;
    Ok(rows.iter().map(row_to_project).collect())
}

/// A project's questions in questionnaire order.
pub async fn project_questions(store: &Store, project_id: &str) -> Result<Vec<Question>> {
    let rows = sqlx::query("SELECT * FROM questions WHERE project_id = ? ORDER BY ord ASC")
        .bind(project_id)
        .fetch_all(store.pool())
        .await?;
    Ok(rows.iter().map(row_to_question).collect())
}

pub async fn load_question(store: &Store, project_id: &str, question_id: &str) -> Result<Question> {
    let row = sqlx::query("SELECT * FROM questions WHERE id = ? AND project_id = ?")
        .bind(question_id)
        .bind(project_id)
        .fetch_optional(store.pool())
        .await?
        .ok_or_else(|| PipelineError::not_found("question", question_id))?;
    Ok(row_to_question(&row))
}

pub async fn project_answers(store: &Store, project_id: &str) -> Result<Vec<Answer>> {
    let rows = sqlx::query(
        r#"
        SELECT a.* FROM answers a
        JOIN questions q ON q.id = a.question_id
        WHERE a.project_id = ?
        ORDER BY q.ord ASC
        "#,
    )
    .bind(project_id)
    .fetch_all(store.pool())
    .await?;
    Ok(rows.iter().map(row_to_answer).collect())
}

fn row_to_project(row: &sqlx::sqlite::SqliteRow) -> Project {
    let status: String = row.get("status");
    let scope: String = row.get("document_scope");
    Project {
        id: row.get("id"),
        name: row.get("name"),
        questionnaire_source: row.get("questionnaire_source"),
        document_scope: DocumentScope::from_db_string(&scope),
        status: ProjectStatus::parse(&status).unwrap_or(ProjectStatus::Failed),
        question_count: row.get("question_count"),
        answered_count: row.get("answered_count"),
        average_evaluation_score: row.get("average_evaluation_score"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_question(row: &sqlx::sqlite::SqliteRow) -> Question {
    let status: String = row.get("status");
    Question {
        id: row.get("id"),
        project_id: row.get("project_id"),
        text: row.get("text"),
        order: row.get("ord"),
        status: QuestionStatus::parse(&status).unwrap_or(QuestionStatus::Pending),
    }
}
