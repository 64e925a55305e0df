//! Generation oracle abstraction and implementations.
//!
//! The oracle turns a question plus retrieved evidence into answer text and a
//! self-reported certainty. Three backends:
//! - **[`ExtractiveOracle`]** — deterministic local synthesis straight from
//!   the evidence; no network. The default, and what the test suite uses.
//! - **[`OpenAiOracle`]** — chat completions with the structured
//!   `Answer:` / `Confidence:` response format.
//! - **[`OllamaOracle`]** — a local Ollama instance's `/api/generate`.
//!
//! Remote failures surface as `Upstream` errors; timeouts and 5xx are marked
//! retryable so workers can back off and retry before failing the job.

use async_trait::async_trait;

use crate::config::OracleConfig;
use crate::embedding::{http_client, post_with_backoff};
use crate::error::{PipelineError, Result};

/// Certainty an oracle reports when it cannot judge its own answer.
pub const BASELINE_CERTAINTY: f64 = 0.5;

/// Oracle output: answer text plus self-reported certainty in [0, 1].
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub certainty: f64,
}

/// A text-generation backend that answers a question from evidence snippets.
#[async_trait]
pub trait Oracle: Send + Sync {
    fn model_name(&self) -> &str;
    /// Produce an answer grounded in `evidence` (may be empty).
    async fn answer(&self, question: &str, evidence: &[String]) -> Result<Completion>;
}

/// Build the oracle named by the configuration.
pub fn create_oracle(config: &OracleConfig) -> Result<Box<dyn Oracle>> {
    match config.provider.as_str() {
        "extractive" => Ok(Box::new(ExtractiveOracle)),
        "openai" => Ok(Box::new(OpenAiOracle::new(config)?)),
        "ollama" => Ok(Box::new(OllamaOracle::new(config)?)),
        other => Err(PipelineError::invalid(format!(
            "unknown oracle provider: {}",
            other
        ))),
    }
}

/// Prompt shared by the remote providers. The structured response format is
/// what [`parse_structured_response`] expects back.
fn build_prompt(question: &str, evidence: &[String]) -> String {
    let context = if evidence.is_empty() {
        "(no relevant documents found)".to_string()
    } else {
        evidence.join("\n---\n")
    };

    format!(
        "You are a due diligence expert. Answer the following question based ONLY on the provided context.\n\
         If the answer is not in the context, state that it is not possible to answer.\n\n\
         Question: {}\n\n\
         Context:\n{}\n\n\
         Format your response as follows:\n\
         Answer: [brief, factual answer]\n\
         Confidence: [0.0 to 1.0]\n",
        question, context
    )
}

/// Parse the `Answer:` / `Confidence:` lines out of a model response.
/// Falls back to the whole response text and [`BASELINE_CERTAINTY`] when the
/// model ignored the format.
fn parse_structured_response(content: &str) -> Completion {
    let mut answer_text = String::new();
    let mut certainty = BASELINE_CERTAINTY;

    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Answer:") {
            answer_text = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("Confidence:") {
            if let Ok(v) = rest.trim().parse::<f64>() {
                certainty = v.clamp(0.0, 1.0);
            }
        }
    }

    if answer_text.is_empty() {
        answer_text = content.trim().to_string();
    }

    Completion {
        text: answer_text,
        certainty,
    }
}

// ============ Extractive oracle ============

/// Deterministic offline oracle: answers with the leading sentences of the
/// best evidence snippet, or a fixed "not possible to answer" statement when
/// no evidence was retrieved.
pub struct ExtractiveOracle;

/// Sentences taken from the top evidence snippet.
const EXTRACT_SENTENCES: usize = 2;

#[async_trait]
impl Oracle for ExtractiveOracle {
    fn model_name(&self) -> &str {
        "extractive"
    }

    async fn answer(&self, question: &str, evidence: &[String]) -> Result<Completion> {
        let Some(top) = evidence.first() else {
            return Ok(Completion {
                text: format!(
                    "It is not possible to answer \"{}\" from the indexed documents.",
                    question.trim()
                ),
                certainty: BASELINE_CERTAINTY,
            });
        };

        let mut text: String = top
            .split_inclusive(['.', '?', '!'])
            .take(EXTRACT_SENTENCES)
            .collect::<String>()
            .trim()
            .to_string();
        if text.is_empty() {
            text = top.trim().to_string();
        }

        Ok(Completion {
            text,
            certainty: 0.7,
        })
    }
}

// ============ OpenAI oracle ============

/// Generation via the OpenAI chat completions API.
///
/// Requires `OPENAI_API_KEY` in the environment and `oracle.model` in config.
pub struct OpenAiOracle {
    model: String,
    max_retries: u32,
    timeout_secs: u64,
}

impl OpenAiOracle {
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| PipelineError::invalid("oracle.model required for openai provider"))?;
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(PipelineError::invalid(
                "OPENAI_API_KEY environment variable not set",
            ));
        }
        Ok(Self {
            model,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl Oracle for OpenAiOracle {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn answer(&self, question: &str, evidence: &[String]) -> Result<Completion> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| PipelineError::invalid("OPENAI_API_KEY not set"))?;

        let client = http_client(self.timeout_secs)?;
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "user", "content": build_prompt(question, evidence) }
            ],
        });

        let json = post_with_backoff(
            &client,
            "https://api.openai.com/v1/chat/completions",
            Some(&api_key),
            &body,
            self.max_retries,
            "OpenAI completion",
        )
        .await?;

        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| {
                PipelineError::upstream("invalid OpenAI response: missing content", false)
            })?;

        Ok(parse_structured_response(content))
    }
}

// ============ Ollama oracle ============

/// Generation via a local Ollama instance (`POST /api/generate`).
pub struct OllamaOracle {
    model: String,
    url: String,
    max_retries: u32,
    timeout_secs: u64,
}

impl OllamaOracle {
    pub fn new(config: &OracleConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| PipelineError::invalid("oracle.model required for ollama provider"))?;
        Ok(Self {
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl Oracle for OllamaOracle {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn answer(&self, question: &str, evidence: &[String]) -> Result<Completion> {
        let client = http_client(self.timeout_secs)?;
        let body = serde_json::json!({
            "model": self.model,
            "prompt": build_prompt(question, evidence),
            "stream": false,
        });

        let json = post_with_backoff(
            &client,
            &format!("{}/api/generate", self.url),
            None,
            &body,
            self.max_retries,
            "Ollama completion",
        )
        .await?;

        let content = json
            .get("response")
            .and_then(|r| r.as_str())
            .ok_or_else(|| {
                PipelineError::upstream("invalid Ollama response: missing response field", false)
            })?;

        Ok(parse_structured_response(content))
    }
}
