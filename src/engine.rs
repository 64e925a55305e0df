//! Service wiring and async operation dispatch.
//!
//! The [`Engine`] owns the store handle, the embedding and oracle providers,
//! the job tracker, the keyed single-flight guard, and the bounded worker
//! pool. HTTP handlers (and tests) call its `*_async` methods, which validate
//! the request, register a PENDING job, spawn the worker, and return — no
//! multi-step work ever runs on the request path.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::config::Config;
use crate::db::Store;
use crate::embedding::{create_embedder, Embedder};
use crate::error::{PipelineError, Result};
use crate::evaluate::{evaluate_project, EvaluationReport};
use crate::flight::FlightGuard;
use crate::indexer;
use crate::jobs::JobTracker;
use crate::loader::load_text;
use crate::models::{Document, DocumentScope, Job, JobType, Project};
use crate::oracle::{create_oracle, Oracle};
use crate::project::{self, GenerationCtx};
use crate::questionnaire::parse_questionnaire;

pub struct Engine {
    store: Store,
    config: Arc<Config>,
    embedder: Arc<dyn Embedder>,
    oracle: Arc<dyn Oracle>,
    tracker: JobTracker,
    flights: FlightGuard,
    worker_slots: Arc<Semaphore>,
}

impl Engine {
    /// Build an engine with the providers named in the configuration.
    pub fn new(config: Config, store: Store) -> Result<Self> {
        let embedder: Arc<dyn Embedder> = Arc::from(create_embedder(&config.embedding)?);
        let oracle: Arc<dyn Oracle> = Arc::from(create_oracle(&config.oracle)?);
        Ok(Self::with_providers(config, store, embedder, oracle))
    }

    /// Build an engine around injected providers. Tests use this to swap in
    /// failing or scripted oracles.
    pub fn with_providers(
        config: Config,
        store: Store,
        embedder: Arc<dyn Embedder>,
        oracle: Arc<dyn Oracle>,
    ) -> Self {
        let tracker = JobTracker::new(store.clone());
        let worker_slots = Arc::new(Semaphore::new(config.workers.max_concurrent_jobs));
        Self {
            store,
            config: Arc::new(config),
            embedder,
            oracle,
            tracker,
            flights: FlightGuard::new(),
            worker_slots,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    pub async fn close(&self) {
        self.store.close().await;
    }

    fn generation_ctx(&self) -> GenerationCtx {
        GenerationCtx {
            store: self.store.clone(),
            embedder: Arc::clone(&self.embedder),
            oracle: Arc::clone(&self.oracle),
            tracker: self.tracker.clone(),
            flights: self.flights.clone(),
            top_k: self.config.retrieval.top_k,
            concurrency: self.config.workers.generation_concurrency,
        }
    }

    // ============ Indexing ============

    /// Accept a document for asynchronous indexing.
    pub async fn index_document_async(&self, file_path: &str, doc_name: &str) -> Result<(Document, Job)> {
        let document = indexer::register_document(&self.store, doc_name, file_path).await?;
        let job = self
            .tracker
            .create(JobType::Indexing, &document.id, "Indexing queued.")
            .await?;

        let store = self.store.clone();
        let embedder = Arc::clone(&self.embedder);
        let chunking = self.config.chunking.clone();
        let tracker = self.tracker.clone();
        let flights = self.flights.clone();
        let slots = Arc::clone(&self.worker_slots);
        let job_id = job.id.clone();
        let document_id = document.id.clone();

        tokio::spawn(async move {
            let Ok(_slot) = slots.acquire_owned().await else {
                return;
            };
            // Writes for a single document are serialized.
            let Some(_permit) = flights.try_acquire(&document_id) else {
                let e = PipelineError::busy(format!("document {} is already indexing", document_id));
                warn!(%document_id, "{}", e);
                let _ = tracker.fail(&job_id, &e).await;
                return;
            };
            indexer::run_index_job(&store, embedder.as_ref(), &chunking, &tracker, &job_id, &document_id)
                .await;
        });

        Ok((document, job))
    }

    // ============ Project lifecycle ============

    /// Create a project from a questionnaire file and fan out generation.
    /// The questionnaire is parsed up front so the caller gets the project id
    /// (and a fast `InvalidInput` on an unusable questionnaire).
    pub async fn create_project_async(
        &self,
        name: &str,
        questionnaire_path: &str,
        scope: DocumentScope,
    ) -> Result<(Project, Job)> {
        let path = Path::new(questionnaire_path).to_path_buf();
        let text = tokio::task::spawn_blocking(move || load_text(&path))
            .await
            .map_err(|e| PipelineError::Consistency(format!("loader task panicked: {}", e)))??;
        let question_texts = parse_questionnaire(&text)?;

        let project =
            project::create_project(&self.store, name, questionnaire_path, scope, &question_texts)
                .await?;

        let job = self
            .tracker
            .create(JobType::ProjectCreation, &project.id, "Project created; generation queued.")
            .await?;

        self.spawn_generation(job.id.clone(), project.id.clone(), false);
        Ok((project, job))
    }

    /// Re-fan-out generation for a project: unanswered questions only, or
    /// every question when `force` is set. Used for FAILED recovery and
    /// OUTDATED regeneration.
    pub async fn resume_project_async(&self, project_id: &str, force: bool) -> Result<Job> {
        let project = project::load_project(&self.store, project_id).await?;
        let message = if force {
            "Regenerating all answers..."
        } else {
            "Resuming generation..."
        };
        let job = self
            .tracker
            .create(JobType::BulkAnswer, &project.id, message)
            .await?;
        self.spawn_generation(job.id.clone(), project.id.clone(), force);
        Ok(job)
    }

    /// Generate one answer. Rejected up front with `ResourceBusy` when a
    /// generation for the question is already in flight.
    pub async fn generate_single_async(&self, project_id: &str, question_id: &str) -> Result<Job> {
        project::load_project(&self.store, project_id).await?;
        let question = project::load_question(&self.store, project_id, question_id).await?;

        if self.flights.is_held(&question.id) {
            return Err(PipelineError::busy(format!(
                "generation already in flight for question {}",
                question.id
            )));
        }

        let job = self
            .tracker
            .create(JobType::SingleAnswer, question_id, "Answer generation queued.")
            .await?;

        let ctx = self.generation_ctx();
        let slots = Arc::clone(&self.worker_slots);
        let job_id = job.id.clone();
        let project_id = project_id.to_string();
        let question_id = question_id.to_string();

        tokio::spawn(async move {
            let Ok(_slot) = slots.acquire_owned().await else {
                return;
            };
            project::run_single_answer_job(ctx, job_id, project_id, question_id).await;
        });

        Ok(job)
    }

    fn spawn_generation(&self, job_id: String, project_id: String, force: bool) {
        let ctx = self.generation_ctx();
        let slots = Arc::clone(&self.worker_slots);
        tokio::spawn(async move {
            let Ok(_slot) = slots.acquire_owned().await else {
                return;
            };
            project::run_generation_job(ctx, job_id, project_id, force).await;
        });
    }

    // ============ Evaluation ============

    /// Score a project's answers against ground truth. Runs on the calling
    /// task (scores go back in the response) but is still recorded as an
    /// EVALUATION job for the activity feed.
    pub async fn evaluate_project(
        &self,
        project_id: &str,
        ground_truth: &std::collections::BTreeMap<String, String>,
    ) -> Result<(EvaluationReport, Job)> {
        let job = self
            .tracker
            .create(JobType::Evaluation, project_id, "Evaluating answers...")
            .await?;
        self.tracker.start(&job.id, "Evaluating answers...").await?;

        match evaluate_project(&self.store, self.embedder.as_ref(), project_id, ground_truth).await
        {
            Ok(report) => {
                self.tracker
                    .complete(
                        &job.id,
                        &format!(
                            "Evaluated {} answers ({} failures).",
                            report.scores.len(),
                            report.failures.len()
                        ),
                    )
                    .await?;
                let job = self.tracker.get(&job.id).await?;
                Ok((report, job))
            }
            Err(e) => {
                self.tracker.fail(&job.id, &e).await?;
                Err(e)
            }
        }
    }
}
