pub mod analysis;
pub mod cli;
pub mod config;
pub mod error;
pub mod sandbox;
pub mod session;

pub use analysis::{analyze, RiskLevel, SecurityAnalysisReport, SecurityFinding, Severity};
pub use error::{Result, SandkitError};
pub use sandbox::{ExecutionEngine, ExecutionRequest, ExecutionResult, Language};
pub use session::{SandboxSession, SessionOptions, SessionStats};

// Environment heaps are metered per thread through the global allocator.
#[cfg(feature = "metered-heap")]
#[global_allocator]
static ALLOCATOR: sandbox::MeteredAllocator = sandbox::MeteredAllocator;
