use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::limits::{
    MAX_CODE_CHARS, MAX_MEMORY_LIMIT_MB, MAX_TIMEOUT_MS, MIN_MEMORY_LIMIT_MB, MIN_TIMEOUT_MS,
};
use super::log::LogEntry;
use super::termination::TerminationReason;
use crate::config::EngineConfig;
use crate::error::{Result, SandkitError};

/// Global names owned by the sandbox itself; callers cannot inject over them.
pub const RESERVED_GLOBALS: [&str; 3] = ["console", "global", "globalThis"];

/// Source language of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Javascript,
    /// The code text is a JSON document, parsed inside the sandbox
    Json,
}

impl FromStr for Language {
    type Err = SandkitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "javascript" | "js" => Ok(Language::Javascript),
            "json" => Ok(Language::Json),
            other => Err(SandkitError::InvalidRequest {
                field: "language",
                reason: format!("'{}' is not supported (expected javascript or json)", other),
            }),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::Javascript => write!(f, "javascript"),
            Language::Json => write!(f, "json"),
        }
    }
}

/// A single run as submitted by a caller.
///
/// Unset limits fall back to the engine configuration when the request is
/// validated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    #[serde(default)]
    pub language: Language,
    #[serde(default)]
    pub memory_limit_mb: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub globals: BTreeMap<String, Value>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    pub fn memory_limit_mb(mut self, mb: u32) -> Self {
        self.memory_limit_mb = Some(mb);
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }

    /// Check the request against the enforced bounds and resolve defaults.
    ///
    /// Nothing here touches an environment, so a rejected request costs
    /// nothing beyond the check itself.
    pub fn validate(self, defaults: &EngineConfig) -> Result<ValidatedRequest> {
        validate_code(&self.code)?;

        let memory_limit_mb = match self.memory_limit_mb {
            Some(mb) => check_memory_limit(mb)?,
            None => defaults.default_memory_limit_mb,
        };
        let timeout_ms = match self.timeout_ms {
            Some(ms) => check_timeout(ms)?,
            None => defaults.default_timeout_ms,
        };

        for name in self.globals.keys() {
            check_global_name(name)?;
        }

        Ok(ValidatedRequest {
            code: self.code,
            language: self.language,
            memory_limit_mb: memory_limit_mb.clamp(MIN_MEMORY_LIMIT_MB, MAX_MEMORY_LIMIT_MB),
            timeout_ms: timeout_ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS),
            globals: self.globals,
        })
    }
}

/// A request whose limits are resolved and inside the enforced bounds.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub code: String,
    pub language: Language,
    pub memory_limit_mb: u32,
    pub timeout_ms: u64,
    pub globals: BTreeMap<String, Value>,
}

/// Size bound only. Blank code is not rejected here; it runs and fails like
/// any other code that does not compile.
pub(crate) fn validate_code(code: &str) -> Result<()> {
    let chars = code.chars().count();
    if chars > MAX_CODE_CHARS {
        return Err(SandkitError::CodeTooLarge {
            max: MAX_CODE_CHARS,
            actual: chars,
        });
    }
    Ok(())
}

pub(crate) fn check_memory_limit(mb: u32) -> Result<u32> {
    if !(MIN_MEMORY_LIMIT_MB..=MAX_MEMORY_LIMIT_MB).contains(&mb) {
        return Err(SandkitError::InvalidRequest {
            field: "memory_limit_mb",
            reason: format!(
                "must be between {} and {} (got {})",
                MIN_MEMORY_LIMIT_MB, MAX_MEMORY_LIMIT_MB, mb
            ),
        });
    }
    Ok(mb)
}

pub(crate) fn check_timeout(ms: u64) -> Result<u64> {
    if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&ms) {
        return Err(SandkitError::InvalidRequest {
            field: "timeout_ms",
            reason: format!(
                "must be between {} and {} (got {})",
                MIN_TIMEOUT_MS, MAX_TIMEOUT_MS, ms
            ),
        });
    }
    Ok(ms)
}

pub(crate) fn check_global_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SandkitError::InvalidRequest {
            field: "globals",
            reason: "global names must not be empty".to_string(),
        });
    }
    if RESERVED_GLOBALS.contains(&name) {
        return Err(SandkitError::InvalidRequest {
            field: "globals",
            reason: format!("'{}' is reserved by the sandbox", name),
        });
    }
    Ok(())
}

/// Outcome of one run, as handed back to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Present only on success
    pub result: Option<Value>,
    /// Present only on failure
    pub error: Option<String>,
    pub logs: Vec<LogEntry>,
    pub execution_time_ms: u64,
    /// Heap bytes in use by the environment after the run
    pub memory_used: usize,
    /// Heap ceiling in effect, in bytes
    pub memory_limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<TerminationReason>,
}

impl ExecutionResult {
    pub fn completed(
        value: Value,
        logs: Vec<LogEntry>,
        elapsed: Duration,
        memory_used: usize,
        memory_limit: usize,
    ) -> Self {
        Self {
            success: true,
            result: Some(value),
            error: None,
            logs,
            execution_time_ms: elapsed.as_millis() as u64,
            memory_used,
            memory_limit,
            termination: None,
        }
    }

    /// The sandboxed code itself failed; the environment stayed healthy.
    pub fn user_failure(
        reason: TerminationReason,
        logs: Vec<LogEntry>,
        elapsed: Duration,
        memory_used: usize,
        memory_limit: usize,
    ) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(reason.message()),
            logs,
            execution_time_ms: elapsed.as_millis() as u64,
            memory_used,
            memory_limit,
            termination: Some(reason),
        }
    }

    /// The engine had to abandon the run. Memory telemetry is zeroed.
    pub fn engine_failure(reason: TerminationReason, logs: Vec<LogEntry>, elapsed: Duration) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(reason.message()),
            logs,
            execution_time_ms: elapsed.as_millis() as u64,
            memory_used: 0,
            memory_limit: 0,
            termination: Some(reason),
        }
    }

    /// Turn a successful result into a failure carrying `message`.
    pub fn reject(mut self, message: String) -> Self {
        self.success = false;
        self.result = None;
        self.error = Some(message);
        self
    }
}
