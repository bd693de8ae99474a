//! Error taxonomy for the search pipeline.
//!
//! "No results" is not an error: an empty [`SearchResponse`](crate::models::SearchResponse)
//! is a valid answer. These variants are reserved for requests that are
//! malformed or for searches that could not be carried out.

pub type Result<T, E = SearchError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// Malformed query, weights that do not sum to 1.0, invalid facet shape.
    #[error("Bad request: {message}")]
    BadRequest { message: String },
    /// An external collaborator (embedding, lexical index, metadata store) failed.
    #[error("Service unavailable: {service}: {message}")]
    ServiceUnavailable { service: String, message: String },
    /// Programming error inside local computation (fusion, scoring).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SearchError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn unavailable(service: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            message: format!("{err:#}"),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable machine-readable kind, used in HTTP error bodies and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "bad_request",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Local stores report failures through `anyhow`; surface them as an unavailable backend.
impl From<anyhow::Error> for SearchError {
    fn from(err: anyhow::Error) -> Self {
        SearchError::unavailable("storage", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(SearchError::bad_request("x").kind(), "bad_request");
        assert_eq!(
            SearchError::unavailable("embedding", "timeout").kind(),
            "service_unavailable"
        );
        assert_eq!(SearchError::internal("nan").kind(), "internal");
    }

    #[test]
    fn test_unavailable_keeps_anyhow_chain() {
        let err = anyhow::anyhow!("connection refused").context("Failed to call Ollama embed API");
        let e = SearchError::unavailable("embedding", err);
        let msg = e.to_string();
        assert!(msg.contains("embedding"));
        assert!(msg.contains("Failed to call Ollama embed API"));
        assert!(msg.contains("connection refused"));
    }
}
