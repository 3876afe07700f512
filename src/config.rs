use serde::Deserialize;
use std::env;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the knowledge ingestion service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// PostgreSQL connection string for the metadata store.
    pub database_url: String,
    /// Upper bound on pooled metadata connections.
    pub database_max_connections: u32,
    /// Base URL of the S3-compatible object store (path-style addressing).
    pub s3_endpoint: String,
    /// Signing region passed to SigV4.
    pub s3_region: String,
    /// Access key used to sign object-store requests.
    pub s3_access_key: String,
    /// Secret key used to sign object-store requests.
    pub s3_secret_key: String,
    /// Bucket holding every uploaded knowledge file.
    pub s3_bucket: String,
    /// Lifetime of presigned upload URLs, in seconds.
    pub upload_url_ttl_secs: u64,
    /// Lifetime of presigned download URLs handed to the embedding service, in seconds.
    pub download_url_ttl_secs: u64,
    /// Largest part count accepted for a multipart negotiation.
    pub max_part_count: u32,
    /// Base URL of the Qdrant instance that stores embeddings.
    pub qdrant_url: String,
    /// Name of the Qdrant collection used for knowledge vectors.
    pub qdrant_collection_name: String,
    /// Optional API key required to access Qdrant.
    pub qdrant_api_key: Option<String>,
    /// Embedding provider used to generate vector representations.
    pub embedding_provider: EmbeddingProvider,
    /// Base URL of the OpenAI-compatible text embedding API.
    pub embedding_api_url: Option<String>,
    /// Bearer token for the embedding APIs.
    pub embedding_api_key: Option<String>,
    /// Text embedding model identifier passed to the provider.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors; fixed for the collection.
    pub embedding_dimension: usize,
    /// Endpoint of the multimodal (image) embedding API.
    pub multimodal_embedding_url: Option<String>,
    /// Model identifier used for image embeddings.
    pub multimodal_embedding_model: String,
    /// Timeout applied to every outbound HTTP call, in seconds.
    pub http_timeout_secs: u64,
    /// Target chunk size in characters.
    pub text_splitter_chunk_size: usize,
    /// Characters shared between neighbouring chunks.
    pub text_splitter_chunk_overlap: usize,
    /// Hard ceiling on chunk length; longer chunks are truncated.
    pub chunk_max_chars: usize,
    /// Whether enriched extraction may shell out to an OCR engine.
    pub ocr_enabled: bool,
    /// Tesseract language set used for OCR (e.g. `chi_sim+eng`).
    pub ocr_languages: String,
    /// Path to the tesseract executable.
    pub tesseract_path: String,
    /// Enforce the client-supplied SHA-256 content hash against downloaded bytes.
    pub verify_content_hash: bool,
    /// Largest stored document the pipeline will download into memory.
    pub max_object_bytes: u64,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

/// Supported embedding backends for the ingestion pipeline.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// OpenAI-compatible HTTP embeddings plus a multimodal endpoint for images.
    OpenAI,
    /// Deterministic local hashing embeddings (development and tests).
    Hash,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let embedding_provider: EmbeddingProvider = load_env_or("EMBEDDING_PROVIDER", "openai")
            .parse()
            .map_err(|()| ConfigError::InvalidValue("EMBEDDING_PROVIDER".to_string()))?;

        let config = Self {
            database_url: load_env("DATABASE_URL")?,
            database_max_connections: parse_env_or("DATABASE_MAX_CONNECTIONS", 5)?,
            s3_endpoint: load_env("S3_ENDPOINT")?,
            s3_region: load_env_or("S3_REGION", "us-east-1"),
            s3_access_key: load_env("S3_ACCESS_KEY")?,
            s3_secret_key: load_env("S3_SECRET_KEY")?,
            s3_bucket: load_env("S3_BUCKET")?,
            upload_url_ttl_secs: parse_env_or("UPLOAD_URL_TTL_SECS", 20 * 60)?,
            download_url_ttl_secs: parse_env_or("DOWNLOAD_URL_TTL_SECS", 10 * 60)?,
            max_part_count: parse_env_or("MAX_PART_COUNT", 10_000)?,
            qdrant_url: load_env("QDRANT_URL")?,
            qdrant_collection_name: load_env_or("QDRANT_COLLECTION_NAME", "health_documents"),
            qdrant_api_key: load_env_optional("QDRANT_API_KEY"),
            embedding_provider,
            embedding_api_url: load_env_optional("EMBEDDING_API_URL"),
            embedding_api_key: load_env_optional("EMBEDDING_API_KEY"),
            embedding_model: load_env_or("EMBEDDING_MODEL", "text-embedding-v4"),
            embedding_dimension: parse_env_or("EMBEDDING_DIMENSION", 1024)?,
            multimodal_embedding_url: load_env_optional("MULTIMODAL_EMBEDDING_URL"),
            multimodal_embedding_model: load_env_or(
                "MULTIMODAL_EMBEDDING_MODEL",
                "multimodal-embedding-v1",
            ),
            http_timeout_secs: parse_env_or("HTTP_TIMEOUT_SECS", 60)?,
            text_splitter_chunk_size: parse_env_or("TEXT_SPLITTER_CHUNK_SIZE", 1000)?,
            text_splitter_chunk_overlap: parse_env_or("TEXT_SPLITTER_CHUNK_OVERLAP", 200)?,
            chunk_max_chars: parse_env_or("CHUNK_MAX_CHARS", 10_000)?,
            ocr_enabled: parse_bool_or("OCR_ENABLED", true)?,
            ocr_languages: load_env_or("OCR_LANGUAGES", "chi_sim+eng"),
            tesseract_path: load_env_or("TESSERACT_PATH", "tesseract"),
            verify_content_hash: parse_bool_or("VERIFY_CONTENT_HASH", false)?,
            max_object_bytes: parse_env_or("MAX_OBJECT_BYTES", 200 * 1024 * 1024)?,
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
        };

        if config.embedding_dimension == 0 {
            return Err(ConfigError::InvalidValue("EMBEDDING_DIMENSION".into()));
        }
        if config.text_splitter_chunk_size == 0
            || config.text_splitter_chunk_overlap >= config.text_splitter_chunk_size
        {
            return Err(ConfigError::InvalidValue(
                "TEXT_SPLITTER_CHUNK_OVERLAP".into(),
            ));
        }
        if config.embedding_provider == EmbeddingProvider::OpenAI
            && config.embedding_api_url.is_none()
        {
            return Err(ConfigError::MissingVariable("EMBEDDING_API_URL".into()));
        }

        Ok(config)
    }

    /// Lifetime of presigned upload URLs.
    pub fn upload_url_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_url_ttl_secs)
    }

    /// Lifetime of presigned download URLs.
    pub fn download_url_ttl(&self) -> Duration {
        Duration::from_secs(self.download_url_ttl_secs)
    }

    /// Timeout for outbound HTTP requests.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    load_env_optional(key).ok_or_else(|| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn load_env_or(key: &str, default: &str) -> String {
    load_env_optional(key).unwrap_or_else(|| default.to_string())
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

fn parse_bool_or(key: &str, default: bool) -> Result<bool, ConfigError> {
    match load_env_optional(key) {
        Some(value) => parse_flag(&value).ok_or_else(|| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" | "dashscope" => Ok(Self::OpenAI),
            "hash" | "local" => Ok(Self::Hash),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    tracing::debug!(
        s3_endpoint = %config.s3_endpoint,
        bucket = %config.s3_bucket,
        qdrant_url = %config.qdrant_url,
        collection = %config.qdrant_collection_name,
        embedding_provider = ?config.embedding_provider,
        embedding_dimension = config.embedding_dimension,
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}
