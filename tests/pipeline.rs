//! End-to-end pipeline scenarios: project lifecycle, indexing atomicity,
//! resume/force semantics, evaluation ordering, single-flight generation,
//! and cooperative cancellation — all against a temp SQLite store with the
//! deterministic hash embedder and extractive oracle.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use dossier::config::{
    ChunkingConfig, Config, DbConfig, EmbeddingConfig, FilesConfig, JobsConfig, OracleConfig,
    RetrievalConfig, ServerConfig, WorkersConfig,
};
use dossier::db::Store;
use dossier::embedding::{Embedder, HashEmbedder};
use dossier::engine::Engine;
use dossier::error::{PipelineError, Result as PipelineResult};
use dossier::generate::answer_for_question;
use dossier::indexer;
use dossier::jobs::JobTracker;
use dossier::migrate::run_migrations;
use dossier::models::{
    DocumentScope, DocumentStatus, JobStatus, JobType, ProjectStatus, QuestionStatus,
};
use dossier::oracle::{Completion, ExtractiveOracle, Oracle};
use dossier::project::{self, AnswerRef};

// ============ Harness ============

fn test_config(root: PathBuf) -> Config {
    Config {
        db: DbConfig {
            path: root.join("data").join("test.sqlite"),
        },
        chunking: ChunkingConfig::default(),
        retrieval: RetrievalConfig::default(),
        embedding: EmbeddingConfig::default(),
        oracle: OracleConfig::default(),
        workers: WorkersConfig::default(),
        jobs: JobsConfig::default(),
        files: FilesConfig {
            root: root.clone(),
            include_globs: vec!["**/*.txt".to_string()],
            exclude_globs: Vec::new(),
        },
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
    }
}

async fn open_store(config: &Config) -> Store {
    let store = Store::open(config).await.unwrap();
    run_migrations(&store).await.unwrap();
    store
}

async fn default_engine(tmp: &TempDir) -> Engine {
    let config = test_config(tmp.path().to_path_buf());
    let store = open_store(&config).await;
    Engine::new(config, store).unwrap()
}

fn write_questionnaire(tmp: &TempDir) -> PathBuf {
    let path = tmp.path().join("questionnaire.txt");
    std::fs::write(
        &path,
        "1. General\n\
         1.1 What is the legal name of the entity?\n\
         1.2 Describe the investment strategy.\n\
         1.3 How is compliance monitored at the firm?\n",
    )
    .unwrap();
    path
}

fn write_reference_doc(tmp: &TempDir) -> PathBuf {
    let path = tmp.path().join("fund-overview.txt");
    std::fs::write(
        &path,
        "The legal name of the entity is Meridian Growth Partners LP. \
         The firm was formed in 2019 in Delaware.\n\n\
         The investment strategy focuses on late-stage growth equity in \
         enterprise software companies across North America.\n\n\
         Compliance at the firm is monitored by a dedicated compliance \
         officer. Compliance reviews run quarterly and findings are reported \
         to the operating committee.\n",
    )
    .unwrap();
    path
}

async fn wait_for_job(engine: &Engine, job_id: &str) -> dossier::models::Job {
    for _ in 0..500 {
        let job = engine.tracker().get(job_id).await.unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {} did not reach a terminal state", job_id);
}

// ============ Scripted providers ============

/// Always fails like a generation timeout.
struct TimeoutOracle;

#[async_trait]
impl Oracle for TimeoutOracle {
    fn model_name(&self) -> &str {
        "timeout"
    }

    async fn answer(&self, _question: &str, _evidence: &[String]) -> PipelineResult<Completion> {
        Err(PipelineError::upstream("generation oracle timed out", true))
    }
}

/// Signals when `answer` is entered, then blocks until the test releases it.
struct GatedOracle {
    started_tx: tokio::sync::mpsc::UnboundedSender<()>,
    gate: Arc<tokio::sync::Semaphore>,
}

#[async_trait]
impl Oracle for GatedOracle {
    fn model_name(&self) -> &str {
        "gated"
    }

    async fn answer(&self, _question: &str, _evidence: &[String]) -> PipelineResult<Completion> {
        let _ = self.started_tx.send(());
        let _permit = self.gate.acquire().await;
        Ok(Completion {
            text: "gated answer".to_string(),
            certainty: 0.6,
        })
    }
}

/// Hash embeddings, but the first batch blocks until released — lets tests
/// land a cancel request mid-indexing deterministically.
struct GatedEmbedder {
    inner: HashEmbedder,
    started_tx: tokio::sync::mpsc::UnboundedSender<()>,
    gate: Arc<tokio::sync::Semaphore>,
}

#[async_trait]
impl Embedder for GatedEmbedder {
    fn model_name(&self) -> &str {
        "gated-hash"
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> PipelineResult<Vec<Vec<f32>>> {
        let _ = self.started_tx.send(());
        let _permit = self.gate.acquire().await;
        self.inner.embed(texts).await
    }
}

// ============ Scenarios ============

#[tokio::test]
async fn project_without_documents_completes_then_resume_cites_new_document() {
    let tmp = TempDir::new().unwrap();
    let engine = default_engine(&tmp).await;
    let questionnaire = write_questionnaire(&tmp);

    // Create with nothing indexed: answers exist but carry no evidence.
    let (created, job) = engine
        .create_project_async("DDQ Run", &questionnaire.to_string_lossy(), DocumentScope::ALL)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(created.status, ProjectStatus::Processing);
    assert_eq!(created.question_count, 3);

    // The job row is pollable before the worker finishes.
    engine.tracker().get(&job.id).await.unwrap();

    let job = wait_for_job(&engine, &job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert!((job.progress - 1.0).abs() < 1e-9);

    let store = engine.store();
    let proj = project::load_project(store, &created.id).await.unwrap();
    assert_eq!(proj.status, ProjectStatus::Completed);
    assert_eq!(proj.answered_count, 3);
    assert_eq!(proj.answered_count, proj.question_count);

    let answers = project::project_answers(store, &created.id).await.unwrap();
    assert_eq!(answers.len(), 3);
    for answer in &answers {
        assert!(answer.citations.is_empty());
        // Evidence-free answers stay below the oracle's baseline certainty.
        assert!(answer.confidence_score < 0.5);
    }
    for question in project::project_questions(store, &created.id).await.unwrap() {
        assert_eq!(question.status, QuestionStatus::AiGenerated);
    }

    // Index a reference document: the completed project goes stale.
    let doc_path = write_reference_doc(&tmp);
    let (document, index_job) = engine
        .index_document_async(&doc_path.to_string_lossy(), "Fund Overview")
        .await
        .unwrap();
    let index_job = wait_for_job(&engine, &index_job.id).await;
    assert_eq!(index_job.status, JobStatus::Completed);

    let document = indexer::get_document(store, &document.id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::Indexed);
    assert!(document.chunk_count >= 1);

    let proj = project::load_project(store, &created.id).await.unwrap();
    assert_eq!(proj.status, ProjectStatus::Outdated);

    // Resume without force: evidence-free answers are replaced with cited
    // ones and the project completes again.
    let resume_job = engine.resume_project_async(&created.id, false).await.unwrap();
    assert_eq!(resume_job.job_type, JobType::BulkAnswer);
    let resume_job = wait_for_job(&engine, &resume_job.id).await;
    assert_eq!(resume_job.status, JobStatus::Completed);

    let proj = project::load_project(store, &created.id).await.unwrap();
    assert_eq!(proj.status, ProjectStatus::Completed);
    assert_eq!(proj.answered_count, 3);

    let answers = project::project_answers(store, &created.id).await.unwrap();
    for answer in &answers {
        assert!(!answer.citations.is_empty(), "resumed answer lacks citations");
        assert_eq!(answer.citations[0].document_name, "Fund Overview");
        assert!(answer.citations[0].score >= 0.0 && answer.citations[0].score <= 1.0);
    }

    engine.close().await;
}

#[tokio::test]
async fn oracle_timeout_fails_project_without_partial_answers() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path().to_path_buf());
    let store = open_store(&config).await;
    let engine = Engine::with_providers(
        config.clone(),
        store.clone(),
        Arc::new(HashEmbedder::new(64)),
        Arc::new(TimeoutOracle),
    );

    let questionnaire = write_questionnaire(&tmp);
    let (created, job) = engine
        .create_project_async("Doomed Run", &questionnaire.to_string_lossy(), DocumentScope::ALL)
        .await
        .unwrap();

    let job = wait_for_job(&engine, &job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind.as_deref(), Some("upstream"));
    assert!(job.error.is_some());

    let proj = project::load_project(&store, &created.id).await.unwrap();
    assert_eq!(proj.status, ProjectStatus::Failed);
    assert!(proj.last_error.is_some());
    assert_eq!(proj.answered_count, 0, "no partial answer may be persisted");

    // FAILED → PROCESSING → COMPLETED once the oracle recovers.
    let healthy = Engine::with_providers(
        config,
        store.clone(),
        Arc::new(HashEmbedder::new(64)),
        Arc::new(ExtractiveOracle),
    );
    let resume_job = healthy.resume_project_async(&created.id, false).await.unwrap();
    let resume_job = wait_for_job(&healthy, &resume_job.id).await;
    assert_eq!(resume_job.status, JobStatus::Completed);

    let proj = project::load_project(&store, &created.id).await.unwrap();
    assert_eq!(proj.status, ProjectStatus::Completed);
    assert_eq!(proj.answered_count, 3);

    store.close().await;
}

#[tokio::test]
async fn resume_preserves_manual_edits_unless_forced() {
    let tmp = TempDir::new().unwrap();
    let engine = default_engine(&tmp).await;
    let questionnaire = write_questionnaire(&tmp);

    let (created, job) = engine
        .create_project_async("Review Run", &questionnaire.to_string_lossy(), DocumentScope::ALL)
        .await
        .unwrap();
    wait_for_job(&engine, &job.id).await;

    let store = engine.store();
    let questions = project::project_questions(store, &created.id).await.unwrap();
    let first = &questions[0];

    let edited = project::update_answer_manual(
        store,
        AnswerRef::ByQuestion(first.id.clone()),
        Some("Hand-written answer from counsel."),
        None,
    )
    .await
    .unwrap();
    assert_eq!(edited.answer_text, "Hand-written answer from counsel.");

    let first_after = project::load_question(store, &created.id, &first.id).await.unwrap();
    assert_eq!(first_after.status, QuestionStatus::ManualUpdated);

    // force=false: the manual edit survives while the other evidence-free
    // answers regenerate.
    let job = engine.resume_project_async(&created.id, false).await.unwrap();
    wait_for_job(&engine, &job.id).await;

    let answer = answer_for_question(store, &first.id).await.unwrap().unwrap();
    assert_eq!(answer.answer_text, "Hand-written answer from counsel.");
    let q = project::load_question(store, &created.id, &first.id).await.unwrap();
    assert_eq!(q.status, QuestionStatus::ManualUpdated);

    // force=true: the explicit override regenerates everything.
    let job = engine.resume_project_async(&created.id, true).await.unwrap();
    wait_for_job(&engine, &job.id).await;

    let answer = answer_for_question(store, &first.id).await.unwrap().unwrap();
    assert_ne!(answer.answer_text, "Hand-written answer from counsel.");
    let q = project::load_question(store, &created.id, &first.id).await.unwrap();
    assert_eq!(q.status, QuestionStatus::AiGenerated);

    engine.close().await;
}

#[tokio::test]
async fn single_answer_generation_is_single_flight() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path().to_path_buf());
    let store = open_store(&config).await;

    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let engine = Engine::with_providers(
        config,
        store.clone(),
        Arc::new(HashEmbedder::new(64)),
        Arc::new(GatedOracle {
            started_tx,
            gate: Arc::clone(&gate),
        }),
    );

    let created = project::create_project(
        &store,
        "Flight Test",
        "inline",
        DocumentScope::ALL,
        &["What is the fund's legal name?".to_string()],
    )
    .await
    .unwrap();
    let questions = project::project_questions(&store, &created.id).await.unwrap();
    let question = &questions[0];

    let first_job = engine
        .generate_single_async(&created.id, &question.id)
        .await
        .unwrap();

    // The worker is now inside the oracle and holds the flight permit.
    tokio::time::timeout(Duration::from_secs(5), started_rx.recv())
        .await
        .expect("oracle never started")
        .unwrap();

    let second = engine.generate_single_async(&created.id, &question.id).await;
    assert!(matches!(second, Err(PipelineError::ResourceBusy(_))));

    gate.add_permits(1);
    let first_job = wait_for_job(&engine, &first_job.id).await;
    assert_eq!(first_job.status, JobStatus::Completed);
    assert!(answer_for_question(&store, &question.id)
        .await
        .unwrap()
        .is_some());

    store.close().await;
}

#[tokio::test]
async fn concurrent_indexing_leaves_exactly_one_chunk_set() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path().to_path_buf());
    let store = open_store(&config).await;
    let embedder = HashEmbedder::new(64);
    let tracker = JobTracker::new(store.clone());

    let doc_path = write_reference_doc(&tmp);
    let document = indexer::register_document(&store, "Fund Overview", &doc_path.to_string_lossy())
        .await
        .unwrap();

    let job_a = tracker
        .create(JobType::Indexing, &document.id, "Indexing...")
        .await
        .unwrap();
    let job_b = tracker
        .create(JobType::Indexing, &document.id, "Indexing...")
        .await
        .unwrap();

    tokio::join!(
        indexer::run_index_job(&store, &embedder, &config.chunking, &tracker, &job_a.id, &document.id),
        indexer::run_index_job(&store, &embedder, &config.chunking, &tracker, &job_b.id, &document.id),
    );

    let document = indexer::get_document(&store, &document.id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::Indexed);

    let chunk_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
            .bind(&document.id)
            .fetch_one(store.pool())
            .await
            .unwrap();
    let distinct_ordinals: i64 =
        sqlx::query_scalar("SELECT COUNT(DISTINCT ordinal) FROM chunks WHERE document_id = ?")
            .bind(&document.id)
            .fetch_one(store.pool())
            .await
            .unwrap();
    let vector_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE document_id = ?")
            .bind(&document.id)
            .fetch_one(store.pool())
            .await
            .unwrap();

    assert_eq!(chunk_count, document.chunk_count, "partial or duplicate chunk set");
    assert_eq!(distinct_ordinals, chunk_count);
    assert_eq!(vector_count, chunk_count);

    store.close().await;
}

#[tokio::test]
async fn evaluation_orders_matching_above_unrelated_and_tolerates_bad_keys() {
    let tmp = TempDir::new().unwrap();
    let engine = default_engine(&tmp).await;
    let questionnaire = write_questionnaire(&tmp);
    let doc_path = write_reference_doc(&tmp);

    let (_, index_job) = engine
        .index_document_async(&doc_path.to_string_lossy(), "Fund Overview")
        .await
        .unwrap();
    wait_for_job(&engine, &index_job.id).await;

    let (created, job) = engine
        .create_project_async("Eval Run", &questionnaire.to_string_lossy(), DocumentScope::ALL)
        .await
        .unwrap();
    wait_for_job(&engine, &job.id).await;

    let store = engine.store();
    let questions = project::project_questions(store, &created.id).await.unwrap();
    let q1 = &questions[0];
    let q2 = &questions[1];
    let a1 = answer_for_question(store, &q1.id).await.unwrap().unwrap();

    let mut ground_truth = BTreeMap::new();
    // Exact text of the stored answer: semantic match must be ~1.0.
    ground_truth.insert(q1.id.clone(), a1.answer_text.clone());
    ground_truth.insert(
        q2.id.clone(),
        "Bananas ripen faster in paper bags on the moon.".to_string(),
    );
    ground_truth.insert("bogus_question".to_string(), "whatever".to_string());

    let (report, eval_job) = engine.evaluate_project(&created.id, &ground_truth).await.unwrap();
    assert_eq!(eval_job.status, JobStatus::Completed);

    let s1 = report.scores[&q1.id];
    let s2 = report.scores[&q2.id];
    assert!(s1 >= 0.95, "identical ground truth scored {}", s1);
    assert!(s2 < s1, "unrelated ground truth must score below matching");
    assert!(report.failures.contains_key("bogus_question"));

    let a1 = answer_for_question(store, &q1.id).await.unwrap().unwrap();
    assert_eq!(a1.evaluation_score, Some(s1));
    assert_eq!(a1.ground_truth.as_deref(), Some(a1.answer_text.as_str()));

    let proj = project::load_project(store, &created.id).await.unwrap();
    let expected_avg = (s1 + s2) / 2.0;
    assert!((proj.average_evaluation_score.unwrap() - expected_avg).abs() < 1e-9);

    engine.close().await;
}

#[tokio::test]
async fn cancelled_indexing_leaves_document_in_prior_state() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path().to_path_buf());
    let store = open_store(&config).await;

    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let engine = Engine::with_providers(
        config,
        store.clone(),
        Arc::new(GatedEmbedder {
            inner: HashEmbedder::new(64),
            started_tx,
            gate: Arc::clone(&gate),
        }),
        Arc::new(ExtractiveOracle),
    );

    let doc_path = write_reference_doc(&tmp);
    let (document, job) = engine
        .index_document_async(&doc_path.to_string_lossy(), "Fund Overview")
        .await
        .unwrap();

    // Cancel while the worker sits inside the embedder.
    tokio::time::timeout(Duration::from_secs(5), started_rx.recv())
        .await
        .expect("embedder never started")
        .unwrap();
    engine.tracker().request_cancel(&job.id).await.unwrap();
    gate.add_permits(64);

    let job = wait_for_job(&engine, &job.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind.as_deref(), Some("cancelled"));

    let document = indexer::get_document(&store, &document.id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::Pending);

    let chunk_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
            .bind(&document.id)
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(chunk_count, 0, "cancelled run must not leave chunks behind");

    store.close().await;
}

#[tokio::test]
async fn scoped_projects_only_go_outdated_for_their_documents() {
    let tmp = TempDir::new().unwrap();
    let engine = default_engine(&tmp).await;
    let questionnaire = write_questionnaire(&tmp);
    let store = engine.store();

    // Project scoped to a document that exists up front.
    let doc_path = write_reference_doc(&tmp);
    let (scoped_doc, job) = engine
        .index_document_async(&doc_path.to_string_lossy(), "Fund Overview")
        .await
        .unwrap();
    wait_for_job(&engine, &job.id).await;

    let (scoped_project, job) = engine
        .create_project_async(
            "Scoped Run",
            &questionnaire.to_string_lossy(),
            DocumentScope::Documents(vec![scoped_doc.id.clone()]),
        )
        .await
        .unwrap();
    wait_for_job(&engine, &job.id).await;
    assert_eq!(
        project::load_project(store, &scoped_project.id).await.unwrap().status,
        ProjectStatus::Completed
    );

    // A new, out-of-scope document must not invalidate it.
    let other_path = tmp.path().join("other.txt");
    std::fs::write(&other_path, "Entirely different reference material about logistics.").unwrap();
    let (_, job) = engine
        .index_document_async(&other_path.to_string_lossy(), "Logistics")
        .await
        .unwrap();
    wait_for_job(&engine, &job.id).await;

    let proj = project::load_project(store, &scoped_project.id).await.unwrap();
    assert_eq!(proj.status, ProjectStatus::Completed, "out-of-scope index must not outdate");

    // Re-indexing the in-scope document itself does invalidate it.
    let tracker = JobTracker::new(store.clone());
    let reindex_job = tracker
        .create(JobType::Indexing, &scoped_doc.id, "Re-indexing...")
        .await
        .unwrap();
    let embedder = HashEmbedder::new(384);
    indexer::run_index_job(
        store,
        &embedder,
        &engine.config().chunking,
        &tracker,
        &reindex_job.id,
        &scoped_doc.id,
    )
    .await;

    let proj = project::load_project(store, &scoped_project.id).await.unwrap();
    assert_eq!(proj.status, ProjectStatus::Outdated);

    engine.close().await;
}

#[tokio::test]
async fn job_progress_is_monotone_and_terminal_jobs_are_collected() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path().to_path_buf());
    let store = open_store(&config).await;
    let tracker = JobTracker::new(store.clone());

    let job = tracker
        .create(JobType::Indexing, "doc_x", "queued")
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    tracker.start(&job.id, "running").await.unwrap();
    tracker.update(&job.id, 0.5, "halfway").await.unwrap();
    // A stale lower report must not move progress backwards.
    tracker.update(&job.id, 0.3, "stale").await.unwrap();
    let fetched = tracker.get(&job.id).await.unwrap();
    assert!((fetched.progress - 0.5).abs() < 1e-9);
    assert_eq!(fetched.message, "stale");

    tracker.complete(&job.id, "done").await.unwrap();
    let fetched = tracker.get(&job.id).await.unwrap();
    assert_eq!(fetched.status, JobStatus::Completed);
    assert!((fetched.progress - 1.0).abs() < 1e-9);
    assert!(tracker.list_active().await.unwrap().is_empty());

    // Terminal jobs outlive completion until the retention sweep.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let removed = tracker.gc(0).await.unwrap();
    assert_eq!(removed, 1);
    assert!(matches!(
        tracker.get(&job.id).await,
        Err(PipelineError::NotFound { .. })
    ));

    store.close().await;
}

#[tokio::test]
async fn invalid_questionnaire_and_missing_files_are_rejected() {
    let tmp = TempDir::new().unwrap();
    let engine = default_engine(&tmp).await;

    // Missing questionnaire file.
    let result = engine
        .create_project_async("Broken", "/nonexistent/questionnaire.txt", DocumentScope::ALL)
        .await;
    assert!(matches!(result, Err(PipelineError::InvalidInput(_))));

    // Questionnaire with no recognizable questions.
    let prose = tmp.path().join("prose.txt");
    std::fs::write(&prose, "Only prose. Nothing numbered. No questions here.").unwrap();
    let result = engine
        .create_project_async("Broken", &prose.to_string_lossy(), DocumentScope::ALL)
        .await;
    assert!(matches!(result, Err(PipelineError::InvalidInput(_))));

    // Missing document file.
    let result = engine
        .index_document_async("/nonexistent/doc.pdf", "Ghost")
        .await;
    assert!(matches!(result, Err(PipelineError::InvalidInput(_))));

    // No jobs should have been registered for rejected requests.
    assert!(engine.tracker().list_active().await.unwrap().is_empty());

    engine.close().await;
}
