//! TOML configuration for the harness.
//!
//! Every section is optional; an empty file yields a working local setup
//! (hash embeddings, Ollama on localhost, prototypes under `./prototypes`).
//! A few deployment knobs can be overridden from the environment, see
//! [`apply_env_overrides`].

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub clients: ClientsConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Directory holding one JSON file per pending or unread task.
    #[serde(default = "default_tasks_dir")]
    pub tasks_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            tasks_dir: default_tasks_dir(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}
fn default_tasks_dir() -> PathBuf {
    PathBuf::from("tasks")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientsConfig {
    /// Directory containing one sub-directory per client, each with a `config.json`.
    #[serde(default = "default_clients_root")]
    pub root: PathBuf,
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            root: default_clients_root(),
        }
    }
}

fn default_clients_root() -> PathBuf {
    PathBuf::from("prototypes")
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Overrides `<clients.root>/<client>/source_documents`.
    #[serde(default)]
    pub source_dir: Option<PathBuf>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Loader worker count. `0` means one per available processing unit.
    #[serde(default)]
    pub workers: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            source_dir: None,
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            workers: 0,
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}

impl IngestConfig {
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Overrides `<clients.root>/<client>/db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_batch_size: default_max_batch_size(),
        }
    }
}

/// SQLite bound-parameter limit divided by the columns written per chunk.
fn default_max_batch_size() -> usize {
    5461
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: default_ollama_url(),
            model: default_llm_model(),
            temperature: 0.0,
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_llm_model() -> String {
    "llama2".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_target_source_chunks")]
    pub target_source_chunks: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            target_source_chunks: default_target_source_chunks(),
        }
    }
}

fn default_target_source_chunks() -> usize {
    4
}

impl Config {
    pub fn client_dir(&self, client: &str) -> PathBuf {
        self.clients.root.join(client)
    }

    /// Directory of the persisted vector index for `client`.
    pub fn store_path(&self, client: &str) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.client_dir(client).join("db"))
    }

    /// Root of the corpus ingested for `client`.
    pub fn source_dir(&self, client: &str) -> PathBuf {
        self.ingest
            .source_dir
            .clone()
            .unwrap_or_else(|| self.client_dir(client).join("source_documents"))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Environment variables take precedence over the file:
/// `PERSIST_DIRECTORY`, `SOURCE_DIRECTORY`, `OLLAMA_URL`, `MODEL_NAME`,
/// `TARGET_SOURCE_CHUNKS`.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("PERSIST_DIRECTORY") {
        config.store.path = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("SOURCE_DIRECTORY") {
        config.ingest.source_dir = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("OLLAMA_URL") {
        config.llm.url = v;
    }
    if let Ok(v) = std::env::var("MODEL_NAME") {
        config.llm.model = v;
    }
    if let Some(n) = std::env::var("TARGET_SOURCE_CHUNKS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
    {
        config.retrieval.target_source_chunks = n;
    }
}

pub fn validate(config: &Config) -> Result<()> {
    if config.ingest.chunk_size == 0 {
        bail!("ingest.chunk_size must be > 0");
    }
    if config.ingest.chunk_overlap >= config.ingest.chunk_size {
        bail!(
            "ingest.chunk_overlap ({}) must be smaller than ingest.chunk_size ({})",
            config.ingest.chunk_overlap,
            config.ingest.chunk_size
        );
    }
    if config.store.max_batch_size == 0 {
        bail!("store.max_batch_size must be > 0");
    }
    if config.retrieval.target_source_chunks == 0 {
        bail!("retrieval.target_source_chunks must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "hash" => {}
        "ollama" => {
            if config.embedding.model.is_none() {
                bail!("embedding.model must be specified when provider is 'ollama'");
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash or ollama.",
            other
        ),
    }
    if config.embedding.dims == 0 {
        bail!("embedding.dims must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<Config> {
        let config: Config = toml::from_str(s)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.ingest.chunk_size, 500);
        assert_eq!(config.ingest.chunk_overlap, 50);
        assert_eq!(config.retrieval.target_source_chunks, 4);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.server.bind, "127.0.0.1:5000");
    }

    #[test]
    fn client_paths_derive_from_root() {
        let config = parse("[clients]\nroot = \"/srv/protos\"\n").unwrap();
        assert_eq!(config.store_path("demo"), PathBuf::from("/srv/protos/demo/db"));
        assert_eq!(
            config.source_dir("demo"),
            PathBuf::from("/srv/protos/demo/source_documents")
        );
    }

    #[test]
    fn explicit_store_path_wins() {
        let config = parse("[store]\npath = \"/tmp/index\"\n").unwrap();
        assert_eq!(config.store_path("any"), PathBuf::from("/tmp/index"));
    }

    #[test]
    fn rejects_overlap_not_smaller_than_chunk() {
        let err = parse("[ingest]\nchunk_size = 50\nchunk_overlap = 50\n").unwrap_err();
        assert!(err.to_string().contains("chunk_overlap"));
    }

    #[test]
    fn rejects_unknown_provider() {
        let err = parse("[embedding]\nprovider = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn ollama_embeddings_need_model() {
        assert!(parse("[embedding]\nprovider = \"ollama\"\n").is_err());
        assert!(parse("[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"\n").is_ok());
    }
}
