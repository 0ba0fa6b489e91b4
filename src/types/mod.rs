use serde::{Deserialize, Serialize};

// ============= Error Types =============

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("LLM error: {0}")]
    LLM(String),

    /// The decision service answered, but not with something we can use.
    #[error("Decision service error at {call_site}: {message}")]
    Decision { call_site: String, message: String },

    #[error("Source error ({source_name}): {message}")]
    Source {
        source_name: String,
        message: String,
    },

    #[error("Source rate limited: {0}")]
    RateLimited(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Shorthand for a decision-service failure at a named call site.
    pub fn decision(call_site: &str, message: impl Into<String>) -> Self {
        AppError::Decision {
            call_site: call_site.to_string(),
            message: message.into(),
        }
    }

    /// Shorthand for a source integration failure.
    pub fn source(source_name: &str, message: impl Into<String>) -> Self {
        AppError::Source {
            source_name: source_name.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

// ============= Shared Value Types =============

/// Continue/stop verdict shared by the relevance judgment and coverage assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Continue,
    Stop,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Continue => write!(f, "continue"),
            Decision::Stop => write!(f, "stop"),
        }
    }
}
