//! Sandboxed execution: isolated environments, their pool, the per-run
//! context and the engine that ties them together.

mod context;
mod engine;
pub mod heap;
pub(crate) mod isolate;
pub mod limits;
mod log;
mod pool;
mod termination;
mod traits;
pub(crate) mod types;
mod validator;

pub use engine::ExecutionEngine;
pub use heap::MeteredAllocator;
pub use isolate::IsolatedEnvironment;
pub use log::{LogEntry, LogLevel};
pub use pool::{IsolatePool, PoolStats};
pub use termination::TerminationReason;
pub use traits::{SandboxBackend, SandboxInfo};
pub use types::{ExecutionRequest, ExecutionResult, Language, ValidatedRequest, RESERVED_GLOBALS};
pub use validator::{FieldTypeValidator, JsonType, Validator};
