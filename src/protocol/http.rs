//! HTTP REST API Protocol
//!
//! JSON bodies exchanged with the embedding server:
//! - `POST /embed` with `{"text": "..."}` returns `{"embedding": [...], "dimension": n}`
//! - `POST /embed` with `{"texts": [...]}` returns `{"embeddings": [...], "dimension": n}`,
//!   where each item is either `{"embedding": [...]}` or an error object
//! - Errors are `{"error": "...", "code": "...", "details": "..."}`

use serde::{Deserialize, Serialize};

use crate::models::{Embedding, EmbeddingError, ErrorKind};
use crate::service::{HealthStatus, ServiceStats, WorkerStatus};

/// Upper bound on texts in one batch request
pub const MAX_BATCH_TEXTS: usize = 256;

/// HTTP Embedding Request
///
/// Exactly one of `text` and `texts` must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpEmbedRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub texts: Option<Vec<String>>,
}

/// A validated embedding request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbedInput {
    Single(String),
    Batch(Vec<String>),
}

impl HttpEmbedRequest {
    pub fn single(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            texts: None,
        }
    }

    pub fn batch(texts: Vec<String>) -> Self {
        Self {
            text: None,
            texts: Some(texts),
        }
    }

    /// Validate the request shape. Empty strings pass through; the engine
    /// reports them as empty input.
    pub fn into_input(self) -> Result<EmbedInput, HttpErrorResponse> {
        match (self.text, self.texts) {
            (Some(text), None) => Ok(EmbedInput::Single(text)),
            (None, Some(texts)) => {
                if texts.is_empty() {
                    Err(HttpErrorResponse::new("texts must contain at least one entry")
                        .with_code("EMPTY_BATCH"))
                } else if texts.len() > MAX_BATCH_TEXTS {
                    Err(HttpErrorResponse::batch_too_large(texts.len()))
                } else {
                    Ok(EmbedInput::Batch(texts))
                }
            }
            (Some(_), Some(_)) => Err(HttpErrorResponse::new(
                "Provide either 'text' or 'texts', not both",
            )
            .with_code("AMBIGUOUS_REQUEST")),
            (None, None) => Err(HttpErrorResponse::missing_fields(&["text", "texts"])),
        }
    }
}

/// HTTP Embedding Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpEmbedResponse {
    pub embedding: Embedding,
    pub dimension: usize,
}

impl HttpEmbedResponse {
    pub fn new(embedding: Embedding) -> Self {
        Self {
            dimension: embedding.len(),
            embedding,
        }
    }
}

/// One entry of a batch response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HttpBatchItem {
    Embedding { embedding: Embedding },
    Error(HttpErrorResponse),
}

/// Batch response, entries in request order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpBatchEmbedResponse {
    pub embeddings: Vec<HttpBatchItem>,
    pub dimension: usize,
}

impl HttpBatchEmbedResponse {
    pub fn new(results: Vec<Result<Embedding, EmbeddingError>>, dimension: usize) -> Self {
        let embeddings = results
            .into_iter()
            .map(|result| match result {
                Ok(embedding) => HttpBatchItem::Embedding { embedding },
                Err(e) => HttpBatchItem::Error(HttpErrorResponse::from_error(&e)),
            })
            .collect();
        Self { embeddings, dimension }
    }

    pub fn failed(&self) -> usize {
        self.embeddings
            .iter()
            .filter(|item| matches!(item, HttpBatchItem::Error(_)))
            .count()
    }
}

/// HTTP Error Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpErrorResponse {
    /// Error message
    pub error: String,

    /// Error code (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Additional details (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl HttpErrorResponse {
    /// Create a new error response
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
            details: None,
        }
    }

    /// Create error with code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Create error with details
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Create missing fields error
    pub fn missing_fields(fields: &[&str]) -> Self {
        Self::new(format!("Missing required fields: {}", fields.join(" or ")))
            .with_code("MISSING_REQUIRED_FIELDS")
    }

    pub fn invalid_json(details: impl Into<String>) -> Self {
        Self::new("Invalid JSON")
            .with_code("INVALID_JSON")
            .with_details(details)
    }

    pub fn batch_too_large(count: usize) -> Self {
        Self::new(format!(
            "Batch exceeds maximum of {} texts (got {})",
            MAX_BATCH_TEXTS, count
        ))
        .with_code("BATCH_TOO_LARGE")
    }

    pub fn not_found() -> Self {
        Self::new("Not Found").with_code("NOT_FOUND")
    }

    /// Map a service error to its wire form
    pub fn from_error(error: &EmbeddingError) -> Self {
        let (message, code) = match error.kind() {
            ErrorKind::EmptyInput => ("Input text produced no tokens", "EMPTY_INPUT"),
            ErrorKind::Timeout => ("Embedding request timed out", "TIMEOUT"),
            ErrorKind::WorkerUnavailable => {
                ("Embedding worker is unavailable, please try again later", "WORKER_UNAVAILABLE")
            }
            ErrorKind::ModelLoad => ("Embedding model could not be loaded", "MODEL_LOAD_FAILED"),
            ErrorKind::Compute => (
                "Internal server error occurred during embedding generation",
                "COMPUTE_ERROR",
            ),
            ErrorKind::Configuration => ("Server configuration error", "CONFIGURATION_ERROR"),
        };
        Self::new(message)
            .with_code(code)
            .with_details(error.to_string())
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub model: String,
    pub version: String,
    pub dimension: usize,
    pub worker: WorkerStatus,
    pub queue_depth: usize,
    pub queue_capacity: usize,
}

impl HealthResponse {
    pub fn new(
        status: HealthStatus,
        model: impl Into<String>,
        dimension: usize,
        worker: WorkerStatus,
        queue_depth: usize,
        queue_capacity: usize,
    ) -> Self {
        Self {
            status,
            model: model.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            dimension,
            worker,
            queue_depth,
            queue_capacity,
        }
    }

    /// A degraded service still accepts requests
    pub fn is_serving(&self) -> bool {
        self.status != HealthStatus::Unavailable
    }
}

/// Stats endpoint response
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub version: &'static str,
    #[serde(flatten)]
    pub stats: ServiceStats,
}

impl StatsResponse {
    pub fn new(stats: ServiceStats) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            stats,
        }
    }
}
