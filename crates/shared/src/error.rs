use thiserror::Error;

/// Failure reported by the document backend, already split into the two
/// shapes the UI cares about: a structured message from the server, or a
/// transport-level failure with no usable message.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("{message}")]
    Api { message: String },
    #[error("transport failure: {message}")]
    Transport { message: String },
}

impl BackendError {
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// The text shown to the user: the server's message when it sent one,
    /// otherwise the flow-specific fallback.
    pub fn user_message(&self, fallback: &str) -> String {
        match self {
            Self::Api { message } => message.clone(),
            Self::Transport { .. } => fallback.to_string(),
        }
    }
}
