use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::sandbox::ExecutionResult;

/// Information about a running sandbox backend
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    /// Backend type identifier
    pub backend_type: String,
    /// Instance identifier (session ID for caller-owned sandboxes)
    pub instance_id: Option<String>,
    /// Whether the backend still accepts code
    pub running: bool,
    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Anything that can run a snippet of code and hand back an [`ExecutionResult`].
///
/// Implemented by the pooled [`ExecutionEngine`](crate::sandbox::ExecutionEngine)
/// and by caller-owned [`SandboxSession`](crate::session::SandboxSession)s so
/// front ends can drive either one.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Returns the backend name (e.g., "pooled", "session")
    fn name(&self) -> &str;

    /// Run `code`, optionally with a time budget other than the default
    async fn run(&self, code: &str, timeout_ms: Option<u64>) -> Result<ExecutionResult>;

    /// Get information about the backend instance
    fn info(&self) -> SandboxInfo;

    /// Release the backend's environments.
    /// Default implementation is a no-op.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Check if the backend is healthy and ready to accept code.
    /// Default implementation runs a trivial expression.
    async fn health_check(&self) -> Result<bool> {
        match self.run("1 + 1", None).await {
            Ok(result) => Ok(result.success),
            Err(_) => Ok(false),
        }
    }
}
