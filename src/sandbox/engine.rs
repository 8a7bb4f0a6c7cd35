use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::heap;
use super::isolate::{IsolatedEnvironment, RunOutcome};
use super::limits::{ContextLimits, PARSE_TIMEOUT_MS};
use super::pool::{IsolatePool, PoolStats};
use super::termination::TerminationReason;
use super::traits::{SandboxBackend, SandboxInfo};
use super::types::{
    check_global_name, check_memory_limit, check_timeout, ExecutionRequest, ExecutionResult,
    Language,
};
use super::validator::Validator;
use crate::analysis::{self, SecurityAnalysisReport};
use crate::config::EngineConfig;
use crate::error::{Result, SandkitError};
use crate::session::{SandboxSession, SessionOptions};

/// Runs untrusted snippets in pooled isolated environments.
///
/// The engine owns its pool outright; dropping the engine drains it.
/// Concurrently checked-out environments (runs in flight plus open
/// sessions) are capped by `max_live_environments`; callers beyond the cap
/// wait for a slot.
pub struct ExecutionEngine {
    config: EngineConfig,
    pool: IsolatePool,
    slots: Arc<Semaphore>,
    shut_down: AtomicBool,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig) -> Self {
        let config = config.normalized();
        info!(
            default_memory_limit_mb = config.default_memory_limit_mb,
            default_timeout_ms = config.default_timeout_ms,
            max_live_environments = config.max_live_environments,
            "starting execution engine"
        );
        Self {
            slots: Arc::new(Semaphore::new(config.max_live_environments)),
            pool: IsolatePool::new(ContextLimits::default()),
            shut_down: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one request to completion, timeout or failure.
    ///
    /// Only a malformed request is an `Err`. Everything the sandboxed code
    /// does, including throwing, hanging or exhausting its heap, comes back as
    /// an [`ExecutionResult`] with `success: false`.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let started = Instant::now();
        let request = request.validate(&self.config)?;

        let slot = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| SandkitError::Other(anyhow::anyhow!(e)))?;

        let memory_limit = heap::mb_to_bytes(request.memory_limit_mb);
        let mut env = match self.pool.acquire(request.memory_limit_mb) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "could not provide an isolated environment");
                return Ok(ExecutionResult::engine_failure(
                    TerminationReason::InitializationError(e.to_string()),
                    Vec::new(),
                    started.elapsed(),
                ));
            }
        };

        let outcome = env.execute(request).await;
        Ok(self.settle(env, slot, outcome, started, memory_limit))
    }

    /// Turn an environment's answer into a result and decide where the
    /// environment goes next. A disposed environment keeps `slot` until its
    /// thread has exited.
    fn settle(
        &self,
        mut env: IsolatedEnvironment,
        slot: OwnedSemaphorePermit,
        outcome: RunOutcome,
        started: Instant,
        memory_limit: usize,
    ) -> ExecutionResult {
        let elapsed = started.elapsed();
        match outcome.value {
            Ok(value) => {
                self.pool.release(env);
                ExecutionResult::completed(
                    value,
                    outcome.logs,
                    elapsed,
                    outcome.heap_used,
                    memory_limit,
                )
            }
            Err(reason) if reason.poisons_environment() => {
                warn!(
                    isolate_id = env.id(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    reason = %reason,
                    "run terminated, disposing environment"
                );
                env.hold_until_exit(slot);
                self.pool.dispose(env);
                ExecutionResult::engine_failure(reason, outcome.logs, elapsed)
            }
            Err(reason) => {
                debug!(isolate_id = env.id(), reason = %reason, "sandboxed code failed");
                self.pool.release(env);
                ExecutionResult::user_failure(
                    reason,
                    outcome.logs,
                    elapsed,
                    outcome.heap_used,
                    memory_limit,
                )
            }
        }
    }

    /// Parse `text` as JSON inside the sandbox under the fixed parse budget,
    /// then apply `validator` to the parsed value.
    pub async fn execute_parsed_data(
        &self,
        text: &str,
        validator: Option<&dyn Validator>,
    ) -> Result<ExecutionResult> {
        let request = ExecutionRequest::new(text)
            .language(Language::Json)
            .timeout_ms(PARSE_TIMEOUT_MS);
        let result = self.execute(request).await?;

        let rejection = match (&result.result, validator) {
            (Some(value), Some(validator)) if result.success => validator.validate(value).err(),
            _ => None,
        };
        Ok(match rejection {
            Some(reason) => result.reject(format!("Validation failed: {}", reason)),
            None => result,
        })
    }

    /// Score `code` for dangerous constructs. No environment is involved.
    pub fn analyze(&self, code: &str, language: Option<&str>) -> SecurityAnalysisReport {
        analysis::analyze(code, language.unwrap_or(analysis::DEFAULT_LANGUAGE))
    }

    /// Check out a dedicated environment for multi-run use by the caller.
    ///
    /// The environment never returns to the pool; it lives until the session
    /// is disposed or dropped.
    pub async fn open_session(&self, options: SessionOptions) -> Result<SandboxSession> {
        let memory_limit_mb = match options.memory_limit_mb {
            Some(mb) => check_memory_limit(mb)?,
            None => self.config.default_memory_limit_mb,
        };
        for name in options.globals.keys() {
            check_global_name(name)?;
        }
        let default_timeout_ms = match options.default_timeout_ms {
            Some(ms) => check_timeout(ms)?,
            None => self.config.default_timeout_ms,
        };

        let slot = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| SandkitError::Other(anyhow::anyhow!(e)))?;
        let env = self.pool.create(memory_limit_mb)?;
        let session = SandboxSession::new(env, slot, default_timeout_ms);

        for (name, value) in options.globals {
            session.set_global(&name, value).await?;
        }

        info!(session_id = %session.id(), memory_limit_mb, "opened sandbox session");
        Ok(session)
    }

    /// Drain the pool. Safe to call more than once.
    pub fn shutdown(&self) -> usize {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            info!("shutting down execution engine");
        }
        self.pool.drain_all()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

#[async_trait]
impl SandboxBackend for ExecutionEngine {
    fn name(&self) -> &str {
        "pooled"
    }

    async fn run(&self, code: &str, timeout_ms: Option<u64>) -> Result<ExecutionResult> {
        let mut request = ExecutionRequest::new(code);
        if let Some(ms) = timeout_ms {
            request = request.timeout_ms(ms);
        }
        self.execute(request).await
    }

    fn info(&self) -> SandboxInfo {
        let stats = self.pool_stats();
        let mut metadata = HashMap::new();
        metadata.insert("pooled".to_string(), stats.pooled.to_string());
        metadata.insert("created".to_string(), stats.created.to_string());
        metadata.insert("reused".to_string(), stats.reused.to_string());
        metadata.insert("disposed".to_string(), stats.disposed.to_string());
        metadata.insert(
            "available_slots".to_string(),
            self.slots.available_permits().to_string(),
        );
        SandboxInfo {
            backend_type: "pooled".to_string(),
            instance_id: None,
            running: !self.shut_down.load(Ordering::Acquire),
            metadata,
        }
    }

    async fn shutdown(&self) -> Result<()> {
        ExecutionEngine::shutdown(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::limits::{HOST_GRACE_MS, MAX_POOL_SIZE};
    use crate::sandbox::log::LogLevel;
    use crate::sandbox::validator::{FieldTypeValidator, JsonType};
    use serde_json::{json, Value};
    use std::time::Duration;

    #[tokio::test]
    async fn test_simple_expression() {
        let engine = ExecutionEngine::default();
        let result = engine.execute(ExecutionRequest::new("2+2")).await.unwrap();
        assert!(result.success);
        assert_eq!(result.result, Some(json!(4)));
        assert!(result.error.is_none());
        assert_eq!(result.memory_limit, 128 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_thrown_error_becomes_result() {
        let engine = ExecutionEngine::default();
        let result = engine
            .execute(ExecutionRequest::new("throw new Error(\"x\")"))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("x"));
        assert_eq!(result.result, None);
        assert!(matches!(
            result.termination,
            Some(TerminationReason::Exception(_))
        ));

        // user failures keep the environment
        assert_eq!(engine.pool_stats().pooled, 1);
    }

    #[tokio::test]
    async fn test_logs_do_not_leak_between_runs() {
        let engine = ExecutionEngine::default();
        let first = engine
            .execute(ExecutionRequest::new("console.log('run A'); 1"))
            .await
            .unwrap();
        let second = engine
            .execute(ExecutionRequest::new("console.info('run B'); 2"))
            .await
            .unwrap();

        assert_eq!(first.logs.len(), 1);
        assert_eq!(first.logs[0].message, "run A");
        assert_eq!(second.logs.len(), 1);
        assert_eq!(second.logs[0].message, "run B");
        assert_eq!(second.logs[0].level, LogLevel::Info);
        assert_eq!(engine.pool_stats().reused, 1);
    }

    #[tokio::test]
    async fn test_state_does_not_leak_between_runs() {
        let engine = ExecutionEngine::default();
        engine
            .execute(ExecutionRequest::new("global.leaked = 42; var alsoLeaked = 1"))
            .await
            .unwrap();
        let result = engine
            .execute(ExecutionRequest::new("[typeof leaked, typeof alsoLeaked]"))
            .await
            .unwrap();
        assert_eq!(result.result, Some(json!(["undefined", "undefined"])));
    }

    #[tokio::test]
    async fn test_partial_logs_survive_failure() {
        let engine = ExecutionEngine::default();
        let result = engine
            .execute(ExecutionRequest::new("console.log('step 1'); throw 'boom'"))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert_eq!(result.logs.len(), 1);
    }

    #[tokio::test]
    async fn test_globals_are_injected_by_copy() {
        let engine = ExecutionEngine::default();
        let input = json!({"values": [1, 2, 3]});
        let result = engine
            .execute(
                ExecutionRequest::new("input.values.push(4); input.values.length")
                    .global("input", input.clone()),
            )
            .await
            .unwrap();
        assert_eq!(result.result, Some(json!(4)));
        assert_eq!(input, json!({"values": [1, 2, 3]}));
    }

    #[tokio::test]
    async fn test_dynamic_code_is_unavailable() {
        let engine = ExecutionEngine::default();
        let result = engine
            .execute(ExecutionRequest::new("eval('1 + 1')"))
            .await
            .unwrap();
        assert!(!result.success);

        let result = engine
            .execute(ExecutionRequest::new("(() => {}).constructor('return 1')()"))
            .await
            .unwrap();
        assert!(!result.success);

        let result = engine
            .execute(ExecutionRequest::new(
                "[typeof Function, typeof require, typeof process, typeof fetch]",
            ))
            .await
            .unwrap();
        assert_eq!(
            result.result,
            Some(json!(["undefined", "undefined", "undefined", "undefined"]))
        );
    }

    #[tokio::test]
    async fn test_validation_rejected_before_any_environment() {
        let engine = ExecutionEngine::default();
        let err = engine
            .execute(ExecutionRequest::new("1").timeout_ms(50))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = engine
            .execute(ExecutionRequest::new("1").memory_limit_mb(1024))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        assert_eq!(engine.pool_stats().created, 0);
    }

    #[tokio::test]
    async fn test_timeout_is_enforced() {
        let engine = ExecutionEngine::default();
        let started = Instant::now();
        let result = engine
            .execute(ExecutionRequest::new("while (true) {}").timeout_ms(200))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(
            result.termination,
            Some(TerminationReason::WallClockTimeout { timeout_ms: 200 })
        );
        assert_eq!(result.memory_used, 0);
        assert_eq!(result.memory_limit, 0);
        assert!(started.elapsed() < Duration::from_millis(200 + HOST_GRACE_MS + 500));

        let stats = engine.pool_stats();
        assert_eq!(stats.pooled, 0);
        assert_eq!(stats.disposed, 1);
    }

    #[cfg(feature = "metered-heap")]
    #[tokio::test]
    async fn test_memory_ceiling_is_enforced() {
        let engine = ExecutionEngine::default();
        let result = engine
            .execute(
                ExecutionRequest::new(
                    "var keep = []; while (true) { keep.push('x'.repeat(4096) + keep.length); }",
                )
                .memory_limit_mb(16)
                .timeout_ms(10_000),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(
            result.termination,
            Some(TerminationReason::MemoryLimit { limit_mb: 16 })
        );
        assert_eq!(result.memory_used, 0);
        assert_eq!(engine.pool_stats().pooled, 0);

        // the next run is unaffected
        let next = engine.execute(ExecutionRequest::new("1 + 1")).await.unwrap();
        assert_eq!(next.result, Some(json!(2)));
    }

    #[cfg(feature = "metered-heap")]
    #[tokio::test]
    async fn test_memory_ceiling_applies_inside_callbacks() {
        let engine = ExecutionEngine::default();
        let result = engine
            .execute(
                ExecutionRequest::new(
                    "[1].forEach(function () { var a = []; \
                     for (var i = 0; i < 20000; i++) { a.push('x'.repeat(1000) + i); } }); 'done'",
                )
                .memory_limit_mb(8),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.result, None);
        assert_eq!(
            result.termination,
            Some(TerminationReason::MemoryLimit { limit_mb: 8 })
        );
        assert_eq!(result.memory_used, 0);
    }

    #[tokio::test]
    async fn test_runaway_callback_is_stopped_and_slot_returned() {
        let engine = ExecutionEngine::new(EngineConfig {
            max_live_environments: 1,
            ..Default::default()
        });
        let result = engine
            .execute(
                ExecutionRequest::new("[1].forEach(function () { while (true) {} }); 'never'")
                    .timeout_ms(200),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(
            result.termination,
            Some(TerminationReason::WallClockTimeout { timeout_ms: 200 })
        );

        // the only slot comes back once the environment thread has stopped
        let next = tokio::time::timeout(
            Duration::from_secs(20),
            engine.execute(ExecutionRequest::new("1 + 1")),
        )
        .await
        .expect("slot was never returned")
        .unwrap();
        assert_eq!(next.result, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_brackets_inside_literals_do_not_count_as_nesting() {
        let engine = ExecutionEngine::default();
        let code = format!("var s = \"{}\"; s.length", "(".repeat(1_001));
        let result = engine.execute(ExecutionRequest::new(code)).await.unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result, Some(json!(1_001)));

        let result = engine
            .execute(ExecutionRequest::new(format!(
                "/* {} */ 'ok'",
                "{".repeat(1_001)
            )))
            .await
            .unwrap();
        assert_eq!(result.result, Some(json!("ok")));

        let result = engine
            .execute(ExecutionRequest::new(format!("{}1{}", "(".repeat(1_001), ")".repeat(1_001))))
            .await
            .unwrap();
        assert!(matches!(
            result.termination,
            Some(TerminationReason::CompileError(_))
        ));
    }

    #[tokio::test]
    async fn test_blank_code_is_a_failed_result() {
        let engine = ExecutionEngine::default();
        for code in ["", "   \n\t"] {
            let result = engine.execute(ExecutionRequest::new(code)).await.unwrap();
            assert!(!result.success);
            assert_eq!(result.result, None);
            assert!(matches!(
                result.termination,
                Some(TerminationReason::CompileError(_))
            ));
        }
        assert_eq!(engine.pool_stats().disposed, 0);
    }

    #[tokio::test]
    async fn test_parse_without_validator() {
        let engine = ExecutionEngine::default();
        let result = engine.execute_parsed_data(r#"{"a":1}"#, None).await.unwrap();
        assert!(result.success);
        assert_eq!(result.result, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_parse_with_failing_validator() {
        let engine = ExecutionEngine::default();
        let validator = FieldTypeValidator::new().require("a", JsonType::String);
        let result = engine
            .execute_parsed_data(r#"{"a":1}"#, Some(&validator))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.result, None);
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .starts_with("Validation failed:"));
    }

    #[tokio::test]
    async fn test_parse_with_closure_validator() {
        let engine = ExecutionEngine::default();
        let has_id = |value: &Value| {
            if value.get("id").is_some() {
                Ok(())
            } else {
                Err("id is required".to_string())
            }
        };
        let result = engine
            .execute_parsed_data(r#"{"id": 7}"#, Some(&has_id))
            .await
            .unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_parse_string_of_brackets() {
        let engine = ExecutionEngine::default();
        let payload = "[".repeat(1_001);
        let text = format!("{{\"payload\":\"{}\"}}", payload);
        let result = engine.execute_parsed_data(&text, None).await.unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result, Some(json!({ "payload": payload })));
    }

    #[tokio::test]
    async fn test_parse_invalid_json_fails() {
        let engine = ExecutionEngine::default();
        let result = engine.execute_parsed_data("{not json", None).await.unwrap();
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_runs_respect_pool_bound() {
        let engine = Arc::new(ExecutionEngine::default());
        let mut handles = Vec::new();
        for i in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .execute(ExecutionRequest::new(format!("{} * 2", i)))
                    .await
                    .unwrap()
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.await.unwrap();
            assert_eq!(result.result, Some(json!(i * 2)));
        }
        assert!(engine.pool_stats().pooled <= MAX_POOL_SIZE);
    }

    #[tokio::test]
    async fn test_shutdown_drains_pool() {
        let engine = ExecutionEngine::default();
        engine.execute(ExecutionRequest::new("1")).await.unwrap();
        assert_eq!(engine.pool_stats().pooled, 1);

        assert_eq!(engine.shutdown(), 1);
        assert_eq!(engine.shutdown(), 0);
        assert_eq!(engine.pool_stats().pooled, 0);
        assert!(!engine.info().running);
    }

    #[tokio::test]
    async fn test_backend_health_check() {
        let engine = ExecutionEngine::default();
        assert_eq!(engine.name(), "pooled");
        assert!(engine.health_check().await.unwrap());
    }
}
