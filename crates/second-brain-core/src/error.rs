//! Domain error taxonomy.
//!
//! Every failure that crosses a component boundary is a [`BrainError`]: a
//! stable machine-readable `code`, a human message, a structured `context`
//! map, and a `retry_hint` telling callers whether the same request may
//! succeed later. The [`ErrorKind`] fixes the default code and retry hint:
//!
//! | Kind | Default code | Retryable |
//! |------|--------------|-----------|
//! | `Provider` | `PROVIDER_ERROR` | yes |
//! | `Configuration` | `CONFIGURATION_ERROR` | no |
//! | `Ingestion` | `INGESTION_ERROR` | no |
//! | `Retrieval` | `RETRIEVAL_ERROR` | yes |
//! | `Schema` | `SCHEMA_ERROR` | no |
//! | `InvalidRequest` | `INVALID_REQUEST` | no |
//! | `Knowledge` | `KNOWLEDGE_ERROR` | no |
//! | `Transaction` | `TRANSACTION_ERROR` | no |
//!
//! Provider errors never reach the caller of a search: the memory facade
//! converts them into fallback results. Schema and configuration errors
//! are fatal for the operation that raised them.

use serde_json::{Map, Value};

/// Stable error codes carried in [`BrainError::code`].
pub mod codes {
    pub const PROVIDER_ERROR: &str = "PROVIDER_ERROR";
    pub const CONFIGURATION_ERROR: &str = "CONFIGURATION_ERROR";
    pub const INGESTION_ERROR: &str = "INGESTION_ERROR";
    pub const RETRIEVAL_ERROR: &str = "RETRIEVAL_ERROR";
    pub const SCHEMA_ERROR: &str = "SCHEMA_ERROR";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const KNOWLEDGE_ERROR: &str = "KNOWLEDGE_ERROR";
    pub const TRANSACTION_ERROR: &str = "TRANSACTION_ERROR";

    pub const SCHEMA_DRIFT: &str = "SCHEMA_DRIFT";
    pub const DUPLICATE_VERSION: &str = "DUPLICATE_VERSION";
    pub const MIGRATIONS_DIR_UNREADABLE: &str = "MIGRATIONS_DIR_UNREADABLE";
    pub const NO_MIGRATIONS: &str = "NO_MIGRATIONS";
    pub const NO_ROLLBACK_SQL: &str = "NO_ROLLBACK_SQL";
    pub const MIGRATION_FILE_NOT_FOUND: &str = "MIGRATION_FILE_NOT_FOUND";

    pub const EMBEDDING_DIMENSION_MISMATCH: &str = "EMBEDDING_DIMENSION_MISMATCH";
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";

    pub const CHUNK_NOT_FOUND: &str = "CHUNK_NOT_FOUND";
    pub const NO_OP_TRANSITION: &str = "NO_OP_TRANSITION";
    pub const INVALID_TRANSITION: &str = "INVALID_TRANSITION";
    pub const STALE_VERSION: &str = "STALE_VERSION";
    pub const DEDUPLICATION_ERROR: &str = "DEDUPLICATION_ERROR";
    pub const CONCURRENT_WRITE_ERROR: &str = "CONCURRENT_WRITE_ERROR";
}

/// Broad category of a [`BrainError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Provider,
    Configuration,
    Ingestion,
    Retrieval,
    Schema,
    InvalidRequest,
    Knowledge,
    Transaction,
}

impl ErrorKind {
    pub fn default_code(self) -> &'static str {
        match self {
            ErrorKind::Provider => codes::PROVIDER_ERROR,
            ErrorKind::Configuration => codes::CONFIGURATION_ERROR,
            ErrorKind::Ingestion => codes::INGESTION_ERROR,
            ErrorKind::Retrieval => codes::RETRIEVAL_ERROR,
            ErrorKind::Schema => codes::SCHEMA_ERROR,
            ErrorKind::InvalidRequest => codes::INVALID_REQUEST,
            ErrorKind::Knowledge => codes::KNOWLEDGE_ERROR,
            ErrorKind::Transaction => codes::TRANSACTION_ERROR,
        }
    }

    pub fn default_retry_hint(self) -> bool {
        matches!(self, ErrorKind::Provider | ErrorKind::Retrieval)
    }

    /// Type name recorded in traces and error context (`error_type`).
    pub fn type_name(self) -> &'static str {
        match self {
            ErrorKind::Provider => "ProviderError",
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Ingestion => "IngestionError",
            ErrorKind::Retrieval => "RetrievalError",
            ErrorKind::Schema => "SchemaError",
            ErrorKind::InvalidRequest => "InvalidRequestError",
            ErrorKind::Knowledge => "KnowledgeError",
            ErrorKind::Transaction => "TransactionError",
        }
    }
}

/// A domain error with a stable code and structured context.
#[derive(Debug, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct BrainError {
    kind: ErrorKind,
    code: String,
    message: String,
    context: Map<String, Value>,
    retry_hint: bool,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

pub type Result<T> = std::result::Result<T, BrainError>;

impl BrainError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.default_code().to_string(),
            message: message.into(),
            context: Map::new(),
            retry_hint: kind.default_retry_hint(),
            source: None,
        }
    }

    /// Provider failure; `provider` is recorded in the context.
    pub fn provider(provider: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Provider, message).with_context("provider", provider)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn ingestion(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Ingestion, message)
    }

    pub fn retrieval(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Retrieval, message)
    }

    pub fn schema(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Schema, message).with_code(code)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    /// Chunk store failure with a specific code (`CHUNK_NOT_FOUND`, ...).
    pub fn knowledge(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Knowledge, message).with_code(code)
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transaction, message)
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = code.to_string();
        self
    }

    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn with_retry_hint(mut self, retry_hint: bool) -> Self {
        self.retry_hint = retry_hint;
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }

    pub fn retry_hint(&self) -> bool {
        self.retry_hint
    }

    /// Serializable form returned to API callers.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "error_type": self.kind.type_name(),
            "code": self.code,
            "message": self.message,
            "context": self.context,
            "retry_hint": self.retry_hint,
        })
    }
}
