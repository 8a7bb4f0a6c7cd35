use std::collections::{BTreeMap, HashMap};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedSemaphorePermit};
use tracing::{info, warn};

use crate::error::{Result, SandkitError};
use crate::sandbox::isolate::IsolatedEnvironment;
use crate::sandbox::types::{check_global_name, check_timeout, validate_code};
use crate::sandbox::{ExecutionResult, SandboxBackend, SandboxInfo};

/// Settings for a caller-owned session
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Memory ceiling for the session's environment (MB)
    pub memory_limit_mb: Option<u32>,
    /// Time budget for runs that do not set one (ms)
    pub default_timeout_ms: Option<u64>,
    /// Globals copied into the session before the first run
    pub globals: BTreeMap<String, Value>,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory_limit_mb(mut self, mb: u32) -> Self {
        self.memory_limit_mb = Some(mb);
        self
    }

    pub fn default_timeout_ms(mut self, ms: u64) -> Self {
        self.default_timeout_ms = Some(ms);
        self
    }

    pub fn global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub runs: u64,
    /// Heap bytes in use after the most recent operation
    pub heap_used: usize,
    /// Heap ceiling, in bytes
    pub memory_limit: usize,
    pub created_at: DateTime<Utc>,
    pub disposed: bool,
}

struct SessionState {
    env: Option<IsolatedEnvironment>,
    slot: Option<OwnedSemaphorePermit>,
    runs: u64,
    heap_used: usize,
}

impl SessionState {
    fn dispose(&mut self) -> bool {
        let was_live = self.env.is_some();
        if let Some(mut env) = self.env.take() {
            if let Some(slot) = self.slot.take() {
                env.hold_until_exit(slot);
            }
            env.dispose();
        }
        self.slot.take();
        was_live
    }
}

/// A sandbox checked out for one caller across many runs.
///
/// Unlike pooled execution, globals and `var` declarations persist from one
/// run to the next. The environment is never returned to the pool; call
/// [`dispose`](Self::dispose) when done. A run that breaches the time or
/// memory ceiling disposes the session, and every later call fails with
/// [`SandkitError::SessionDisposed`].
pub struct SandboxSession {
    id: String,
    memory_limit: usize,
    default_timeout_ms: u64,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

impl SandboxSession {
    pub(crate) fn new(
        env: IsolatedEnvironment,
        slot: OwnedSemaphorePermit,
        default_timeout_ms: u64,
    ) -> Self {
        Self {
            id: generate_session_id(),
            memory_limit: env.memory_limit_bytes(),
            default_timeout_ms,
            created_at: Utc::now(),
            state: Mutex::new(SessionState {
                env: Some(env),
                slot: Some(slot),
                runs: 0,
                heap_used: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn disposed_error(&self) -> SandkitError {
        SandkitError::SessionDisposed {
            id: self.id.clone(),
        }
    }

    /// Run code against the session's persistent global scope.
    pub async fn run(&self, code: &str, timeout_ms: Option<u64>) -> Result<ExecutionResult> {
        let started = Instant::now();
        validate_code(code)?;
        let timeout_ms = match timeout_ms {
            Some(ms) => check_timeout(ms)?,
            None => self.default_timeout_ms,
        };

        let mut state = self.state.lock().await;
        let env = state.env.as_mut().ok_or_else(|| self.disposed_error())?;
        let outcome = env.run_in_session(code.to_string(), timeout_ms).await;
        state.runs += 1;

        let elapsed = started.elapsed();
        Ok(match outcome.value {
            Ok(value) => {
                state.heap_used = outcome.heap_used;
                ExecutionResult::completed(
                    value,
                    outcome.logs,
                    elapsed,
                    outcome.heap_used,
                    self.memory_limit,
                )
            }
            Err(reason) if reason.poisons_environment() => {
                warn!(session_id = %self.id, reason = %reason, "session run terminated, disposing session");
                state.dispose();
                ExecutionResult::engine_failure(reason, outcome.logs, elapsed)
            }
            Err(reason) => {
                state.heap_used = outcome.heap_used;
                ExecutionResult::user_failure(
                    reason,
                    outcome.logs,
                    elapsed,
                    outcome.heap_used,
                    self.memory_limit,
                )
            }
        })
    }

    /// Copy `value` into the session as the global `name`.
    pub async fn set_global(&self, name: &str, value: Value) -> Result<()> {
        check_global_name(name)?;
        let mut state = self.state.lock().await;
        let env = state.env.as_mut().ok_or_else(|| self.disposed_error())?;
        match env.set_global(name, value).await {
            Ok(heap_used) => {
                state.heap_used = heap_used;
                Ok(())
            }
            Err(e @ SandkitError::EnvironmentGone { .. }) => {
                state.dispose();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Copy the global `name` out of the session, if it exists.
    pub async fn get_global(&self, name: &str) -> Result<Option<Value>> {
        let mut state = self.state.lock().await;
        let env = state.env.as_mut().ok_or_else(|| self.disposed_error())?;
        let value = env.get_global(name).await;
        if value.is_err() {
            state.dispose();
        }
        value
    }

    pub async fn stats(&self) -> SessionStats {
        let state = self.state.lock().await;
        SessionStats {
            runs: state.runs,
            heap_used: state.heap_used,
            memory_limit: self.memory_limit,
            created_at: self.created_at,
            disposed: state.env.is_none(),
        }
    }

    pub async fn is_disposed(&self) -> bool {
        self.state.lock().await.env.is_none()
    }

    /// Tear down the session's environment. Safe to call more than once.
    pub async fn dispose(&self) {
        let mut state = self.state.lock().await;
        if state.dispose() {
            info!(session_id = %self.id, runs = state.runs, "disposed sandbox session");
        }
    }
}

#[async_trait]
impl SandboxBackend for SandboxSession {
    fn name(&self) -> &str {
        "session"
    }

    async fn run(&self, code: &str, timeout_ms: Option<u64>) -> Result<ExecutionResult> {
        SandboxSession::run(self, code, timeout_ms).await
    }

    fn info(&self) -> SandboxInfo {
        // a held lock means a run is in flight, so the session is live
        let running = self
            .state
            .try_lock()
            .map(|state| state.env.is_some())
            .unwrap_or(true);
        let mut metadata = HashMap::new();
        metadata.insert("memory_limit".to_string(), self.memory_limit.to_string());
        metadata.insert("created_at".to_string(), self.created_at.to_rfc3339());
        SandboxInfo {
            backend_type: "session".to_string(),
            instance_id: Some(self.id.clone()),
            running,
            metadata,
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.dispose().await;
        Ok(())
    }
}

/// Generate a short unique session ID
pub(crate) fn generate_session_id() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);

    // low 24 bits of the timestamp, low 8 bits of the counter
    let combined = (timestamp & 0xFFFFFF) << 8 | (counter as u64 & 0xFF);
    format_base36(combined)
}

/// Format a number as base36 string
fn format_base36(mut n: u64) -> String {
    const CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if n == 0 {
        return "0".to_string();
    }

    let mut result = Vec::new();
    while n > 0 {
        result.push(CHARS[(n % 36) as usize]);
        n /= 36;
    }
    result.reverse();
    String::from_utf8(result).unwrap_or_else(|_| "error".to_string())
}
