use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandkitError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Request validation errors
    #[error("Invalid request: {field} {reason}")]
    InvalidRequest { field: &'static str, reason: String },

    #[error("Code exceeds maximum length of {max} characters (got {actual})")]
    CodeTooLarge { max: usize, actual: usize },

    // Environment errors
    #[error("Failed to start isolated environment: {0}")]
    EnvironmentSpawn(String),

    #[error("Isolated environment {id} is no longer available")]
    EnvironmentGone { id: u64 },

    // Session errors
    #[error("Session has been disposed: {id}")]
    SessionDisposed { id: String },

    #[error("Global '{name}' could not be transferred: {reason}")]
    GlobalTransfer { name: String, reason: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SandkitError {
    /// Errors caused by the shape of the caller's request rather than by the sandbox.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidRequest { .. } | Self::CodeTooLarge { .. })
    }
}

pub type Result<T> = std::result::Result<T, SandkitError>;
