use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub files: FilesConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Fixed chunk window in characters.
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    /// Characters carried over between adjacent chunks so evidence is not
    /// split across a hard boundary.
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_chunk_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Number of evidence chunks fed to the oracle per question.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hash` (deterministic local), `openai`, or `ollama`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: default_dims(),
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    /// `extractive` (deterministic local), `openai`, or `ollama`.
    #[serde(default = "default_oracle_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_oracle_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: default_oracle_provider(),
            model: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_oracle_timeout_secs(),
        }
    }
}

fn default_oracle_provider() -> String {
    "extractive".to_string()
}
fn default_oracle_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkersConfig {
    /// Upper bound on concurrently running jobs.
    #[serde(default = "default_max_jobs")]
    pub max_concurrent_jobs: usize,
    /// Upper bound on concurrent per-question generation inside one project.
    #[serde(default = "default_generation_concurrency")]
    pub generation_concurrency: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_jobs(),
            generation_concurrency: default_generation_concurrency(),
        }
    }
}

fn default_max_jobs() -> usize {
    4
}
fn default_generation_concurrency() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    /// Terminal jobs older than this are garbage-collected.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: i64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
        }
    }
}

fn default_retention_secs() -> i64 {
    24 * 60 * 60
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesConfig {
    /// Root directory the `/list-files` collaborator exposes.
    #[serde(default = "default_files_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            root: default_files_root(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_files_root() -> PathBuf {
    PathBuf::from("./files")
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.pdf".to_string(),
        "**/*.docx".to_string(),
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_chars == 0 {
        anyhow::bail!("chunking.chunk_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.chunk_chars {
        anyhow::bail!("chunking.overlap_chars must be < chunking.chunk_chars");
    }
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    match config.embedding.provider.as_str() {
        "hash" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, or ollama.",
            other
        ),
    }
    if config.embedding.provider != "hash" && config.embedding.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }
    match config.oracle.provider.as_str() {
        "extractive" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown oracle provider: '{}'. Must be extractive, openai, or ollama.",
            other
        ),
    }
    if config.oracle.provider != "extractive" && config.oracle.model.is_none() {
        anyhow::bail!(
            "oracle.model must be specified when provider is '{}'",
            config.oracle.provider
        );
    }
    if config.workers.max_concurrent_jobs == 0 {
        anyhow::bail!("workers.max_concurrent_jobs must be >= 1");
    }
    if config.workers.generation_concurrency == 0 {
        anyhow::bail!("workers.generation_concurrency must be >= 1");
    }
    if config.jobs.retention_secs <= 0 {
        anyhow::bail!("jobs.retention_secs must be > 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> String {
        r#"
[db]
path = "/tmp/dossier.sqlite"

[server]
bind = "127.0.0.1:8000"
"#
        .to_string()
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(&minimal_toml()).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.chunking.chunk_chars, 1000);
        assert_eq!(config.chunking.overlap_chars, 100);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.oracle.provider, "extractive");
        assert_eq!(config.workers.max_concurrent_jobs, 4);
    }

    #[test]
    fn remote_provider_requires_model() {
        let mut toml_str = minimal_toml();
        toml_str.push_str("\n[embedding]\nprovider = \"openai\"\n");
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn overlap_must_be_smaller_than_window() {
        let mut toml_str = minimal_toml();
        toml_str.push_str("\n[chunking]\nchunk_chars = 100\noverlap_chars = 100\n");
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(validate(&config).is_err());
    }
}
