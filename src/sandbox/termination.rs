use serde::{Deserialize, Serialize};

/// Reason why a sandboxed run did not complete normally.
///
/// Carried on a failed [`ExecutionResult`](crate::sandbox::ExecutionResult)
/// so callers can branch on the failure category without parsing messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TerminationReason {
    // === Resource limits ===
    /// Run exceeded its time budget
    WallClockTimeout { timeout_ms: u64 },

    /// Run pushed the environment heap past its ceiling
    MemoryLimit { limit_mb: u32 },

    // === JS errors (userland) ===
    /// Sandboxed code threw
    Exception(String),

    /// Sandboxed code failed to parse
    CompileError(String),

    // === Engine errors (Rust-side) ===
    /// Environment or context could not be created
    InitializationError(String),

    /// Environment went away before answering
    Terminated,

    /// Unexpected engine error
    Other(String),
}

impl TerminationReason {
    /// Returns true if this represents a resource limit violation
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, Self::WallClockTimeout { .. } | Self::MemoryLimit { .. })
    }

    /// Returns true if this is a JS userland error
    pub fn is_js_error(&self) -> bool {
        matches!(self, Self::Exception(_) | Self::CompileError(_))
    }

    /// Returns true if this is an engine (Rust-side) error
    pub fn is_runtime_error(&self) -> bool {
        matches!(
            self,
            Self::InitializationError(_) | Self::Terminated | Self::Other(_)
        )
    }

    /// Whether the environment that produced this outcome must be torn down
    /// instead of being returned to the pool.
    pub fn poisons_environment(&self) -> bool {
        self.is_limit_exceeded() || self.is_runtime_error()
    }

    /// Get a human-readable description
    pub fn message(&self) -> String {
        match self {
            Self::WallClockTimeout { timeout_ms } => {
                format!("Script execution timed out after {} ms", timeout_ms)
            }
            Self::MemoryLimit { limit_mb } => {
                format!("Script exceeded memory limit of {} MB", limit_mb)
            }
            Self::Exception(msg) => msg.clone(),
            Self::CompileError(msg) => format!("SyntaxError: {}", msg),
            Self::InitializationError(msg) => format!("Sandbox initialization failed: {}", msg),
            Self::Terminated => "Isolated environment was terminated".to_string(),
            Self::Other(msg) => msg.clone(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for TerminationReason {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let timeout = TerminationReason::WallClockTimeout { timeout_ms: 100 };
        assert!(timeout.is_limit_exceeded());
        assert!(timeout.poisons_environment());

        let thrown = TerminationReason::Exception("x".into());
        assert!(thrown.is_js_error());
        assert!(!thrown.poisons_environment());
        assert_eq!(thrown.message(), "x");

        assert!(TerminationReason::Terminated.is_runtime_error());
        assert!(TerminationReason::Terminated.poisons_environment());
        assert!(!TerminationReason::CompileError("bad".into()).poisons_environment());
    }
}
