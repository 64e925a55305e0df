//! HTTP API for the answering pipeline.
//!
//! Every multi-step operation is dispatched to a worker and tracked as a job;
//! handlers return a `job_id` immediately and clients poll
//! `/get-request-status/{job_id}` or `/jobs/active`. Read endpoints serve the
//! latest committed rows.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/create-project-async` | Create a project, fan out generation |
//! | `GET`  | `/get-project-info/{id}` | Project with questions and answers |
//! | `GET`  | `/get-project-status/{id}` | Status-only poll |
//! | `GET`  | `/projects` | All projects |
//! | `GET`  | `/documents` | All registered documents |
//! | `GET`  | `/list-files` | Indexable source files |
//! | `POST` | `/index-document-async` | Index a document |
//! | `POST` | `/generate-single-answer` | Regenerate one answer |
//! | `POST` | `/generate-all-answers` | Generate all missing answers |
//! | `POST` | `/update-answer` | Apply a human edit or review status |
//! | `POST` | `/resume-project-generation/{id}` | Resume / regenerate (`?force=`) |
//! | `POST` | `/evaluate-project` | Score answers against ground truth |
//! | `GET`  | `/jobs/active` | PENDING and RUNNING jobs |
//! | `GET`  | `/get-request-status/{job_id}` | One job |
//! | `POST` | `/cancel-job/{job_id}` | Request cooperative cancellation |
//! | `GET`  | `/health` | Store connectivity check |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "resource_busy", "message": "generation already in flight for q_3" } }
//! ```
//!
//! Codes: `bad_request` (400), `not_found` (404), `resource_busy` (409),
//! `upstream` (502), `internal` (500).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::db::Store;
use crate::engine::Engine;
use crate::error::PipelineError;
use crate::files::{list_files, SourceFile};
use crate::indexer;
use crate::models::{Answer, Document, DocumentScope, Job, Project, Question, QuestionStatus};
use crate::project::{self, AnswerRef};

/// Start the HTTP server and run until the process is terminated.
pub async fn run_server(config: &Config, store: Store) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let engine = Arc::new(Engine::new(config.clone(), store)?);

    // Retention sweep for terminal jobs.
    let gc_engine = Arc::clone(&engine);
    let retention_secs = config.jobs.retention_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60 * 10));
        loop {
            ticker.tick().await;
            match gc_engine.tracker().gc(retention_secs).await {
                Ok(0) => {}
                Ok(n) => info!(removed = n, "job gc sweep"),
                Err(e) => tracing::warn!(error = %e, "job gc sweep failed"),
            }
        }
    });

    let app = build_router(engine);

    info!("listening on http://{}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Assemble the router. Exposed separately so tests can serve it on an
/// ephemeral port.
pub fn build_router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/create-project-async", post(handle_create_project))
        .route("/get-project-info/{id}", get(handle_project_info))
        .route("/get-project-status/{id}", get(handle_project_status))
        .route("/projects", get(handle_list_projects))
        .route("/documents", get(handle_list_documents))
        .route("/list-files", get(handle_list_files))
        .route("/index-document-async", post(handle_index_document))
        .route("/generate-single-answer", post(handle_generate_single))
        .route("/generate-all-answers", post(handle_generate_all))
        .route("/update-answer", post(handle_update_answer))
        .route(
            "/resume-project-generation/{id}",
            post(handle_resume_project),
        )
        .route("/evaluate-project", post(handle_evaluate_project))
        .route("/jobs/active", get(handle_active_jobs))
        .route("/get-request-status/{job_id}", get(handle_job_status))
        .route("/cancel-job/{job_id}", post(handle_cancel_job))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(engine)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(e: PipelineError) -> Self {
        let (status, code) = match &e {
            PipelineError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            PipelineError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            PipelineError::ResourceBusy(_) => (StatusCode::CONFLICT, "resource_busy"),
            PipelineError::Upstream { .. } => (StatusCode::BAD_GATEWAY, "upstream"),
            PipelineError::Consistency(_)
            | PipelineError::Storage(_)
            | PipelineError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError {
            status,
            code,
            message: e.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

// ============ Projects ============

#[derive(Deserialize)]
struct CreateProjectPayload {
    name: Option<String>,
    questionnaire_path: Option<String>,
    #[serde(default)]
    scope: Option<DocumentScope>,
}

#[derive(Serialize)]
struct CreateProjectResponse {
    project_id: String,
    job_id: String,
    status: crate::models::JobStatus,
}

async fn handle_create_project(
    State(engine): State<Arc<Engine>>,
    Json(payload): Json<CreateProjectPayload>,
) -> Result<Json<CreateProjectResponse>, AppError> {
    let name = payload
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| bad_request("name is required"))?;
    let path = payload
        .questionnaire_path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| bad_request("questionnaire_path is required"))?;
    let scope = payload.scope.unwrap_or_default();

    let (project, job) = engine.create_project_async(&name, &path, scope).await?;
    Ok(Json(CreateProjectResponse {
        project_id: project.id,
        job_id: job.id,
        status: job.status,
    }))
}

#[derive(Serialize)]
struct ProjectInfoResponse {
    project: Project,
    questions: Vec<Question>,
    answers: Vec<Answer>,
}

async fn handle_project_info(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<ProjectInfoResponse>, AppError> {
    let store = engine.store();
    let project = project::load_project(store, &id).await?;
    let questions = project::project_questions(store, &id).await?;
    let answers = project::project_answers(store, &id).await?;
    Ok(Json(ProjectInfoResponse {
        project,
        questions,
        answers,
    }))
}

#[derive(Serialize)]
struct ProjectStatusResponse {
    id: String,
    status: crate::models::ProjectStatus,
    answered_count: i64,
    question_count: i64,
}

async fn handle_project_status(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<ProjectStatusResponse>, AppError> {
    let project = project::load_project(engine.store(), &id).await?;
    Ok(Json(ProjectStatusResponse {
        id: project.id,
        status: project.status,
        answered_count: project.answered_count,
        question_count: project.question_count,
    }))
}

async fn handle_list_projects(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<Vec<Project>>, AppError> {
    Ok(Json(project::list_projects(engine.store()).await?))
}

// ============ Documents & files ============

async fn handle_list_documents(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<Vec<Document>>, AppError> {
    Ok(Json(indexer::list_documents(engine.store()).await?))
}

async fn handle_list_files(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<Vec<SourceFile>>, AppError> {
    Ok(Json(list_files(&engine.config().files)?))
}

#[derive(Deserialize)]
struct IndexDocumentPayload {
    file_path: Option<String>,
    doc_name: Option<String>,
}

#[derive(Serialize)]
struct JobAcceptedResponse {
    job_id: String,
    status: crate::models::JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    document_id: Option<String>,
}

async fn handle_index_document(
    State(engine): State<Arc<Engine>>,
    Json(payload): Json<IndexDocumentPayload>,
) -> Result<Json<JobAcceptedResponse>, AppError> {
    let file_path = payload
        .file_path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| bad_request("file_path is required"))?;
    let doc_name = payload
        .doc_name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| bad_request("doc_name is required"))?;

    let (document, job) = engine.index_document_async(&file_path, &doc_name).await?;
    Ok(Json(JobAcceptedResponse {
        job_id: job.id,
        status: job.status,
        document_id: Some(document.id),
    }))
}

// ============ Generation ============

#[derive(Deserialize)]
struct GenerateSinglePayload {
    project_id: Option<String>,
    question_id: Option<String>,
}

async fn handle_generate_single(
    State(engine): State<Arc<Engine>>,
    Json(payload): Json<GenerateSinglePayload>,
) -> Result<Json<JobAcceptedResponse>, AppError> {
    let project_id = payload
        .project_id
        .ok_or_else(|| bad_request("project_id is required"))?;
    let question_id = payload
        .question_id
        .ok_or_else(|| bad_request("question_id is required"))?;

    let job = engine.generate_single_async(&project_id, &question_id).await?;
    Ok(Json(JobAcceptedResponse {
        job_id: job.id,
        status: job.status,
        document_id: None,
    }))
}

#[derive(Deserialize)]
struct GenerateAllPayload {
    project_id: Option<String>,
}

async fn handle_generate_all(
    State(engine): State<Arc<Engine>>,
    Json(payload): Json<GenerateAllPayload>,
) -> Result<Json<JobAcceptedResponse>, AppError> {
    let project_id = payload
        .project_id
        .ok_or_else(|| bad_request("project_id is required"))?;

    let job = engine.resume_project_async(&project_id, false).await?;
    Ok(Json(JobAcceptedResponse {
        job_id: job.id,
        status: job.status,
        document_id: None,
    }))
}

#[derive(Deserialize)]
struct ResumeParams {
    #[serde(default)]
    force: bool,
}

async fn handle_resume_project(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Query(params): Query<ResumeParams>,
) -> Result<Json<JobAcceptedResponse>, AppError> {
    let job = engine.resume_project_async(&id, params.force).await?;
    Ok(Json(JobAcceptedResponse {
        job_id: job.id,
        status: job.status,
        document_id: None,
    }))
}

// ============ Answers ============

#[derive(Deserialize)]
struct UpdateAnswerPayload {
    answer_id: Option<String>,
    question_id: Option<String>,
    answer_text: Option<String>,
    status: Option<QuestionStatus>,
}

async fn handle_update_answer(
    State(engine): State<Arc<Engine>>,
    Json(payload): Json<UpdateAnswerPayload>,
) -> Result<Json<Answer>, AppError> {
    let answer_ref = match (payload.answer_id, payload.question_id) {
        (Some(answer_id), _) => AnswerRef::ById(answer_id),
        (None, Some(question_id)) => AnswerRef::ByQuestion(question_id),
        (None, None) => return Err(bad_request("answer_id or question_id is required")),
    };

    let answer = project::update_answer_manual(
        engine.store(),
        answer_ref,
        payload.answer_text.as_deref(),
        payload.status,
    )
    .await?;
    Ok(Json(answer))
}

// ============ Evaluation ============

#[derive(Deserialize)]
struct EvaluatePayload {
    project_id: Option<String>,
    ground_truth_map: Option<BTreeMap<String, String>>,
}

#[derive(Serialize)]
struct EvaluateResponse {
    job_id: String,
    scores: BTreeMap<String, f64>,
    failures: BTreeMap<String, String>,
    average_score: Option<f64>,
}

async fn handle_evaluate_project(
    State(engine): State<Arc<Engine>>,
    Json(payload): Json<EvaluatePayload>,
) -> Result<Json<EvaluateResponse>, AppError> {
    let project_id = payload
        .project_id
        .ok_or_else(|| bad_request("project_id is required"))?;
    let ground_truth = payload
        .ground_truth_map
        .ok_or_else(|| bad_request("ground_truth_map is required"))?;

    let (report, job) = engine.evaluate_project(&project_id, &ground_truth).await?;
    Ok(Json(EvaluateResponse {
        job_id: job.id,
        scores: report.scores,
        failures: report.failures,
        average_score: report.average_score,
    }))
}

// ============ Jobs ============

async fn handle_active_jobs(
    State(engine): State<Arc<Engine>>,
) -> Result<Json<Vec<Job>>, AppError> {
    Ok(Json(engine.tracker().list_active().await?))
}

async fn handle_job_status(
    State(engine): State<Arc<Engine>>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, AppError> {
    Ok(Json(engine.tracker().get(&job_id).await?))
}

async fn handle_cancel_job(
    State(engine): State<Arc<Engine>>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, AppError> {
    Ok(Json(engine.tracker().request_cancel(&job_id).await?))
}

// ============ Health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health(State(engine): State<Arc<Engine>>) -> Result<Json<HealthResponse>, AppError> {
    engine.store().ping().await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}
