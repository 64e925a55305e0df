//! Core data models for the answering pipeline.
//!
//! These types represent the documents, chunks, projects, questions, answers,
//! and jobs that flow through indexing, retrieval, generation, and evaluation.
//! All statuses are stored as their SCREAMING_CASE string form so the rows
//! read the same from `sqlite3` as from the API.

use serde::{Deserialize, Serialize};

// ============ Documents ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Indexing,
    Indexed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::Indexing => "INDEXING",
            DocumentStatus::Indexed => "INDEXED",
            DocumentStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(DocumentStatus::Pending),
            "INDEXING" => Some(DocumentStatus::Indexing),
            "INDEXED" => Some(DocumentStatus::Indexed),
            "FAILED" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

/// A reference document registered for indexing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub source_path: String,
    pub status: DocumentStatus,
    pub chunk_count: i64,
    /// Human-readable failure message when `status == Failed`.
    pub error: Option<String>,
    pub created_at: i64,
    pub indexed_at: Option<i64>,
}

/// A bounded slice of a document's extracted text — the unit of embedding
/// and retrieval. Immutable once its document is INDEXED.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: i64,
    pub text: String,
}

// ============ Projects ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    Processing,
    Completed,
    Outdated,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Processing => "PROCESSING",
            ProjectStatus::Completed => "COMPLETED",
            ProjectStatus::Outdated => "OUTDATED",
            ProjectStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROCESSING" => Some(ProjectStatus::Processing),
            "COMPLETED" => Some(ProjectStatus::Completed),
            "OUTDATED" => Some(ProjectStatus::Outdated),
            "FAILED" => Some(ProjectStatus::Failed),
            _ => None,
        }
    }
}

/// The set of documents a project's retrieval is restricted to.
///
/// Serializes as the string `"ALL_DOCS"` or an explicit array of document
/// ids, matching what clients send in `create-project` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentScope {
    All(AllDocs),
    Documents(Vec<String>),
}

/// Marker for the `"ALL_DOCS"` scope literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllDocs {
    #[serde(rename = "ALL_DOCS")]
    AllDocs,
}

impl DocumentScope {
    pub const ALL: DocumentScope = DocumentScope::All(AllDocs::AllDocs);

    pub fn is_all(&self) -> bool {
        matches!(self, DocumentScope::All(_))
    }

    /// Whether a document id falls inside this scope.
    pub fn contains(&self, document_id: &str) -> bool {
        match self {
            DocumentScope::All(_) => true,
            DocumentScope::Documents(ids) => ids.iter().any(|id| id == document_id),
        }
    }

    /// Stored TEXT form: `ALL_DOCS` or a JSON array of ids.
    pub fn to_db_string(&self) -> String {
        match self {
            DocumentScope::All(_) => "ALL_DOCS".to_string(),
            DocumentScope::Documents(ids) => {
                serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
            }
        }
    }

    pub fn from_db_string(s: &str) -> Self {
        if s == "ALL_DOCS" {
            return DocumentScope::ALL;
        }
        match serde_json::from_str::<Vec<String>>(s) {
            Ok(ids) => DocumentScope::Documents(ids),
            Err(_) => DocumentScope::ALL,
        }
    }
}

impl Default for DocumentScope {
    fn default() -> Self {
        DocumentScope::ALL
    }
}

/// A questionnaire run: ordered questions, generated answers, lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub questionnaire_source: String,
    pub document_scope: DocumentScope,
    pub status: ProjectStatus,
    pub question_count: i64,
    /// Derived: number of questions with a live answer. Never exceeds
    /// `question_count`.
    pub answered_count: i64,
    pub average_evaluation_score: Option<f64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

// ============ Questions & Answers ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionStatus {
    /// Parsed from the questionnaire, no answer generated yet.
    Pending,
    AiGenerated,
    ManualUpdated,
    Confirmed,
    Rejected,
}

impl QuestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionStatus::Pending => "PENDING",
            QuestionStatus::AiGenerated => "AI_GENERATED",
            QuestionStatus::ManualUpdated => "MANUAL_UPDATED",
            QuestionStatus::Confirmed => "CONFIRMED",
            QuestionStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(QuestionStatus::Pending),
            "AI_GENERATED" => Some(QuestionStatus::AiGenerated),
            "MANUAL_UPDATED" => Some(QuestionStatus::ManualUpdated),
            "CONFIRMED" => Some(QuestionStatus::Confirmed),
            "REJECTED" => Some(QuestionStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub project_id: String,
    pub text: String,
    /// 1-based position in the questionnaire. Never changes after creation.
    pub order: i64,
    pub status: QuestionStatus,
}

/// Evidence record linking an answer to the source chunk that justified it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub document_name: String,
    pub text_snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<i64>,
    /// Similarity of the cited chunk to the question, in [0, 1].
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub id: String,
    pub project_id: String,
    pub question_id: String,
    pub answer_text: String,
    pub confidence_score: f64,
    pub citations: Vec<Citation>,
    pub evaluation_score: Option<f64>,
    pub ground_truth: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

// ============ Jobs ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Indexing,
    ProjectCreation,
    SingleAnswer,
    BulkAnswer,
    Evaluation,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Indexing => "INDEXING",
            JobType::ProjectCreation => "PROJECT_CREATION",
            JobType::SingleAnswer => "SINGLE_ANSWER",
            JobType::BulkAnswer => "BULK_ANSWER",
            JobType::Evaluation => "EVALUATION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INDEXING" => Some(JobType::Indexing),
            "PROJECT_CREATION" => Some(JobType::ProjectCreation),
            "SINGLE_ANSWER" => Some(JobType::SingleAnswer),
            "BULK_ANSWER" => Some(JobType::BulkAnswer),
            "EVALUATION" => Some(JobType::Evaluation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "RUNNING" => Some(JobStatus::Running),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// A tracked asynchronous unit of work. Visible to polling clients the
/// instant it is created, retained after completion until garbage-collected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    /// Monotone non-decreasing within the job's lifetime.
    pub progress: f64,
    pub message: String,
    pub error: Option<String>,
    /// Taxonomy tag of the failure (`upstream`, `invalid_input`, ...).
    pub error_kind: Option<String>,
    /// Project or document id the job operates on.
    pub target_id: String,
    pub cancel_requested: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_all_docs_roundtrip() {
        let scope = DocumentScope::ALL;
        assert_eq!(scope.to_db_string(), "ALL_DOCS");
        assert_eq!(DocumentScope::from_db_string("ALL_DOCS"), scope);
        assert!(scope.contains("anything"));
    }

    #[test]
    fn scope_explicit_roundtrip() {
        let scope = DocumentScope::Documents(vec!["d1".into(), "d2".into()]);
        let stored = scope.to_db_string();
        assert_eq!(DocumentScope::from_db_string(&stored), scope);
        assert!(scope.contains("d1"));
        assert!(!scope.contains("d3"));
    }

    #[test]
    fn scope_json_wire_forms() {
        let all: DocumentScope = serde_json::from_str("\"ALL_DOCS\"").unwrap();
        assert!(all.is_all());

        let explicit: DocumentScope = serde_json::from_str("[\"d1\"]").unwrap();
        assert_eq!(explicit, DocumentScope::Documents(vec!["d1".into()]));
    }

    #[test]
    fn status_strings_roundtrip() {
        for s in [
            ProjectStatus::Processing,
            ProjectStatus::Completed,
            ProjectStatus::Outdated,
            ProjectStatus::Failed,
        ] {
            assert_eq!(ProjectStatus::parse(s.as_str()), Some(s));
        }
        for s in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
