//! Isolated environments.
//!
//! Each [`IsolatedEnvironment`] is a dedicated OS thread with its own heap
//! meter and a current-thread tokio runtime used to drive budgeted script
//! evaluation. The host talks to it through a job channel and waits for
//! replies on oneshot channels, never sharing engine state across threads.

use std::future::Future;
use std::pin::Pin;
use std::sync::mpsc;
use std::task::{Context as TaskContext, Poll};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use boa_engine::{JsResult, JsValue};
use serde_json::Value;
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tracing::{debug, warn};

use super::context::{sentinel_key, wrap_source, SandboxContext};
use super::heap;
use super::limits::{ContextLimits, HARD_CEILING_FACTOR, HOST_GRACE_MS, MAX_NESTING_DEPTH};
use super::log::LogEntry;
use super::termination::TerminationReason;
use super::types::{Language, ValidatedRequest};
use crate::error::{Result, SandkitError};

/// Native stack reserved for each environment thread
const ENVIRONMENT_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Wait applied to global get/set round trips
const GLOBAL_TRANSFER_WAIT_MS: u64 = 2_000;

enum Job {
    /// One-shot run in a context built for this job alone
    Execute {
        request: ValidatedRequest,
        reply: oneshot::Sender<RunOutcome>,
    },
    /// Run in the environment's persistent session context
    SessionRun {
        code: String,
        timeout_ms: u64,
        reply: oneshot::Sender<RunOutcome>,
    },
    SetGlobal {
        name: String,
        value: Value,
        reply: oneshot::Sender<std::result::Result<usize, String>>,
    },
    GetGlobal {
        name: String,
        reply: oneshot::Sender<Option<Value>>,
    },
}

/// What an environment reports back for a run.
#[derive(Debug)]
pub struct RunOutcome {
    pub value: std::result::Result<Value, TerminationReason>,
    pub logs: Vec<LogEntry>,
    /// Live heap bytes of the environment when the run finished
    pub heap_used: usize,
}

impl RunOutcome {
    fn failed(reason: TerminationReason) -> Self {
        Self {
            value: Err(reason),
            logs: Vec::new(),
            heap_used: 0,
        }
    }
}

enum Abandoned {
    /// The thread is gone
    Gone,
    /// The thread did not answer in time
    Unresponsive,
}

/// Handle to one isolated environment.
///
/// Owned by exactly one holder at a time: the pool while idle, a run or a
/// session while checked out.
pub struct IsolatedEnvironment {
    id: u64,
    memory_limit_mb: u32,
    jobs: Option<mpsc::Sender<Job>>,
    thread: Option<JoinHandle<()>>,
    /// Capacity slot released only once the thread has really exited
    exit_slot: Option<OwnedSemaphorePermit>,
    /// A job was given up on while the thread was still running it
    abandoned_job: bool,
    runs: u64,
}

impl IsolatedEnvironment {
    pub fn spawn(id: u64, memory_limit_mb: u32, limits: ContextLimits) -> Result<Self> {
        let (jobs, inbox) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name(format!("sandkit-env-{}", id))
            .stack_size(ENVIRONMENT_STACK_SIZE)
            .spawn(move || worker_main(id, memory_limit_mb, limits, inbox))
            .map_err(|e| SandkitError::EnvironmentSpawn(e.to_string()))?;

        debug!(isolate_id = id, memory_limit_mb, "spawned isolated environment");

        Ok(Self {
            id,
            memory_limit_mb,
            jobs: Some(jobs),
            thread: Some(thread),
            exit_slot: None,
            abandoned_job: false,
            runs: 0,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn memory_limit_mb(&self) -> u32 {
        self.memory_limit_mb
    }

    pub fn memory_limit_bytes(&self) -> usize {
        heap::mb_to_bytes(self.memory_limit_mb)
    }

    /// Number of jobs this environment has been handed
    pub fn runs(&self) -> u64 {
        self.runs
    }

    pub fn is_disposed(&self) -> bool {
        self.jobs.is_none()
    }

    /// Run a request in a context built just for it.
    pub async fn execute(&mut self, request: ValidatedRequest) -> RunOutcome {
        let timeout_ms = request.timeout_ms;
        let (reply, answer) = oneshot::channel();
        let job = Job::Execute { request, reply };
        self.await_run(job, answer, timeout_ms).await
    }

    /// Run code in the persistent session context, creating it on first use.
    pub async fn run_in_session(&mut self, code: String, timeout_ms: u64) -> RunOutcome {
        let (reply, answer) = oneshot::channel();
        let job = Job::SessionRun {
            code,
            timeout_ms,
            reply,
        };
        self.await_run(job, answer, timeout_ms).await
    }

    /// Copy `value` into the session context. Returns live heap bytes afterwards.
    pub async fn set_global(&mut self, name: &str, value: Value) -> Result<usize> {
        let (reply, answer) = oneshot::channel();
        let job = Job::SetGlobal {
            name: name.to_string(),
            value,
            reply,
        };
        match self
            .round_trip(job, answer, Duration::from_millis(GLOBAL_TRANSFER_WAIT_MS))
            .await
        {
            Ok(Ok(heap_used)) => Ok(heap_used),
            Ok(Err(reason)) => Err(SandkitError::GlobalTransfer {
                name: name.to_string(),
                reason,
            }),
            Err(_) => Err(SandkitError::EnvironmentGone { id: self.id }),
        }
    }

    /// Copy a global out of the session context.
    pub async fn get_global(&mut self, name: &str) -> Result<Option<Value>> {
        let (reply, answer) = oneshot::channel();
        let job = Job::GetGlobal {
            name: name.to_string(),
            reply,
        };
        self.round_trip(job, answer, Duration::from_millis(GLOBAL_TRANSFER_WAIT_MS))
            .await
            .map_err(|_| SandkitError::EnvironmentGone { id: self.id })
    }

    async fn await_run(
        &mut self,
        job: Job,
        answer: oneshot::Receiver<RunOutcome>,
        timeout_ms: u64,
    ) -> RunOutcome {
        self.runs += 1;
        let wait = Duration::from_millis(timeout_ms + HOST_GRACE_MS);
        match self.round_trip(job, answer, wait).await {
            Ok(outcome) => outcome,
            Err(Abandoned::Gone) => RunOutcome::failed(TerminationReason::Terminated),
            Err(Abandoned::Unresponsive) => {
                RunOutcome::failed(TerminationReason::WallClockTimeout { timeout_ms })
            }
        }
    }

    async fn round_trip<T>(
        &mut self,
        job: Job,
        answer: oneshot::Receiver<T>,
        wait: Duration,
    ) -> std::result::Result<T, Abandoned> {
        let Some(jobs) = &self.jobs else {
            return Err(Abandoned::Gone);
        };
        if jobs.send(job).is_err() {
            warn!(isolate_id = self.id, "environment thread is gone");
            self.close_jobs();
            return Err(Abandoned::Gone);
        }

        match tokio::time::timeout(wait, answer).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => {
                warn!(isolate_id = self.id, "environment stopped without replying");
                self.close_jobs();
                Err(Abandoned::Gone)
            }
            Err(_) => {
                warn!(
                    isolate_id = self.id,
                    wait_ms = wait.as_millis() as u64,
                    "environment unresponsive, abandoning it"
                );
                self.abandoned_job = true;
                self.close_jobs();
                Err(Abandoned::Unresponsive)
            }
        }
    }

    /// Keep `slot` checked out until the environment thread has exited,
    /// even if the environment is disposed while a job is still running.
    pub fn hold_until_exit(&mut self, slot: OwnedSemaphorePermit) {
        self.exit_slot = Some(slot);
    }

    /// Tear the environment down. Safe to call more than once.
    ///
    /// The thread exits once it finishes its current job; it is not waited
    /// for. A slot handed to [`hold_until_exit`](Self::hold_until_exit) is
    /// released when that happens if a job was abandoned mid-run, otherwise
    /// right away.
    pub fn dispose(&mut self) {
        self.close_jobs();
        let thread = self.thread.take();
        let Some(slot) = self.exit_slot.take() else {
            return;
        };
        let Some(thread) = thread.filter(|thread| self.abandoned_job && !thread.is_finished())
        else {
            return;
        };

        let id = self.id;
        debug!(isolate_id = id, "environment still busy, holding its slot until it exits");
        let watcher = std::thread::Builder::new()
            .name(format!("sandkit-env-{}-exit", id))
            .spawn(move || {
                if thread.join().is_err() {
                    warn!(isolate_id = id, "environment thread panicked");
                }
                drop(slot);
                debug!(isolate_id = id, "environment thread exited, slot released");
            });
        if let Err(e) = watcher {
            warn!(
                isolate_id = id,
                error = %e,
                "could not watch environment thread, releasing its slot"
            );
        }
    }

    /// Tear down an idle environment and wait for its thread to exit.
    pub fn dispose_and_join(&mut self) {
        self.close_jobs();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(isolate_id = self.id, "environment thread panicked");
            }
        }
        self.exit_slot.take();
    }

    fn close_jobs(&mut self) {
        if self.jobs.take().is_some() {
            debug!(isolate_id = self.id, runs = self.runs, "disposed isolated environment");
        }
    }
}

impl Drop for IsolatedEnvironment {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for IsolatedEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedEnvironment")
            .field("id", &self.id)
            .field("memory_limit_mb", &self.memory_limit_mb)
            .field("runs", &self.runs)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Environment thread
// ---------------------------------------------------------------------------

struct Worker {
    id: u64,
    memory_limit_mb: u32,
    heap_ceiling: usize,
    limits: ContextLimits,
    runtime: Option<tokio::runtime::Runtime>,
    session: Option<SandboxContext>,
}

fn worker_main(id: u64, memory_limit_mb: u32, limits: ContextLimits, inbox: mpsc::Receiver<Job>) {
    heap::enable_metering();

    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => Some(runtime),
        Err(e) => {
            warn!(isolate_id = id, error = %e, "failed to build environment runtime");
            None
        }
    };

    let mut worker = Worker {
        id,
        memory_limit_mb,
        heap_ceiling: heap::mb_to_bytes(memory_limit_mb),
        limits,
        runtime,
        session: None,
    };

    while let Ok(job) = inbox.recv() {
        worker.handle(job);
    }

    debug!(isolate_id = id, "environment thread exiting");
}

impl Worker {
    fn handle(&mut self, job: Job) {
        match job {
            Job::Execute { request, reply } => {
                let outcome = self.execute(request);
                let _ = reply.send(outcome);
            }
            Job::SessionRun {
                code,
                timeout_ms,
                reply,
            } => {
                let outcome = self.session_run(&code, timeout_ms);
                let _ = reply.send(outcome);
            }
            Job::SetGlobal { name, value, reply } => {
                let result = match self.session() {
                    Ok(sandbox) => sandbox
                        .inject_global(&name, &value)
                        .map(|()| heap::live_bytes())
                        .map_err(|e| e.to_string()),
                    Err(reason) => Err(reason.message()),
                };
                let _ = reply.send(result);
            }
            Job::GetGlobal { name, reply } => {
                let value = self
                    .session()
                    .ok()
                    .and_then(|sandbox| sandbox.read_global(&name));
                let _ = reply.send(value);
            }
        }
    }

    fn execute(&mut self, request: ValidatedRequest) -> RunOutcome {
        boa_gc::force_collect();

        let mut sandbox = match SandboxContext::build(&self.limits) {
            Ok(sandbox) => sandbox,
            Err(e) => {
                return RunOutcome::failed(TerminationReason::InitializationError(e.to_string()))
            }
        };

        for (name, value) in &request.globals {
            if let Err(e) = sandbox.inject_global(name, value) {
                return RunOutcome::failed(TerminationReason::InitializationError(format!(
                    "global '{}' could not be injected: {}",
                    name, e
                )));
            }
        }

        let value = self.run(
            &mut sandbox,
            &request.code,
            request.language,
            request.timeout_ms,
        );
        let logs = sandbox.take_logs();
        let heap_used = heap::live_bytes();

        drop(sandbox);
        boa_gc::force_collect();

        RunOutcome {
            value,
            logs,
            heap_used,
        }
    }

    fn session(&mut self) -> std::result::Result<&mut SandboxContext, TerminationReason> {
        if self.session.is_none() {
            let sandbox = SandboxContext::build(&self.limits)
                .map_err(|e| TerminationReason::InitializationError(e.to_string()))?;
            self.session = Some(sandbox);
        }
        self.session
            .as_mut()
            .ok_or_else(|| TerminationReason::Other("session context missing".to_string()))
    }

    fn session_run(&mut self, code: &str, timeout_ms: u64) -> RunOutcome {
        let mut sandbox = match self.session.take() {
            Some(sandbox) => sandbox,
            None => match SandboxContext::build(&self.limits) {
                Ok(sandbox) => sandbox,
                Err(e) => {
                    return RunOutcome::failed(TerminationReason::InitializationError(
                        e.to_string(),
                    ))
                }
            },
        };

        let value = self.run(&mut sandbox, code, Language::Javascript, timeout_ms);
        let logs = sandbox.take_logs();
        let heap_used = heap::live_bytes();

        // an aborted evaluation leaves the context mid-frame
        match &value {
            Err(reason) if reason.poisons_environment() => drop(sandbox),
            _ => self.session = Some(sandbox),
        }

        RunOutcome {
            value,
            logs,
            heap_used,
        }
    }

    fn run(
        &self,
        sandbox: &mut SandboxContext,
        code: &str,
        language: Language,
        timeout_ms: u64,
    ) -> std::result::Result<Value, TerminationReason> {
        let runtime = self.runtime.as_ref().ok_or_else(|| {
            TerminationReason::InitializationError("environment runtime unavailable".to_string())
        })?;

        if code.trim().is_empty() {
            return Err(TerminationReason::CompileError(
                "code must not be empty".to_string(),
            ));
        }

        // JSON.parse validates with serde_json first, whose recursion limit
        // already guards the parser
        if language == Language::Javascript && nesting_depth(code) > MAX_NESTING_DEPTH {
            return Err(TerminationReason::CompileError(format!(
                "code nests deeper than {} levels",
                MAX_NESTING_DEPTH
            )));
        }

        let sentinel = sentinel_key();
        let source = wrap_source(code, language, &sentinel);
        let script = sandbox.compile(&source).map_err(|e| {
            let message = e.to_string();
            TerminationReason::CompileError(
                message
                    .strip_prefix("SyntaxError: ")
                    .unwrap_or(&message)
                    .to_string(),
            )
        })?;

        heap::arm_ceiling(self.heap_ceiling.saturating_mul(HARD_CEILING_FACTOR));
        sandbox
            .context_mut()
            .runtime_limits_mut()
            .set_loop_iteration_limit(self.limits.loop_budget(timeout_ms));

        let started = Instant::now();
        let watchdog = Watchdog {
            evaluation: Box::pin(
                script.evaluate_async_with_budget(sandbox.context_mut(), self.limits.slice_budget),
            ),
            deadline: started + Duration::from_millis(timeout_ms),
            timeout_ms,
            heap_ceiling: self.heap_ceiling,
            memory_limit_mb: self.memory_limit_mb,
        };
        let completion = runtime.block_on(watchdog);
        sandbox
            .context_mut()
            .runtime_limits_mut()
            .disable_loop_iteration_limit();

        if let Err(reason) = &completion {
            debug!(
                isolate_id = self.id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                reason = %reason,
                "run aborted"
            );
        }

        let evaluated = completion?;
        // callbacks run by native builtins are invisible to the watchdog
        self.check_heap()?;
        let value = evaluated.map_err(|e| {
            let loop_budget_spent = e.as_native().is_some_and(|native| {
                native.is_runtime_limit() && native.message().contains("loop")
            });
            if loop_budget_spent {
                TerminationReason::WallClockTimeout { timeout_ms }
            } else {
                TerminationReason::Exception(e.to_string())
            }
        })?;

        if let Some(caught) = sandbox.caught_error(&value, &sentinel) {
            if !caught.stack.is_empty() {
                debug!(isolate_id = self.id, stack = %caught.stack, "sandboxed code threw");
            }
            return Err(TerminationReason::Exception(caught.message));
        }

        Ok(sandbox.to_host(&value))
    }

    /// Memory check applied once evaluation has returned control.
    fn check_heap(&self) -> std::result::Result<(), TerminationReason> {
        if !heap::is_metering() {
            return Ok(());
        }
        let over = heap::ceiling_breached() || {
            if heap::live_bytes() > self.heap_ceiling {
                boa_gc::force_collect();
            }
            heap::live_bytes() > self.heap_ceiling
        };
        if over {
            return Err(TerminationReason::MemoryLimit {
                limit_mb: self.memory_limit_mb,
            });
        }
        Ok(())
    }
}

/// Deepest bracket nesting in JavaScript source. Brackets inside strings,
/// template text, regex literals and comments are not counted; template
/// substitutions are. Where `/` could be division or a regex, it is read as
/// division so the brackets after it are counted.
fn nesting_depth(code: &str) -> usize {
    let chars: Vec<char> = code.chars().collect();
    let mut depth: usize = 0;
    let mut deepest = 0;
    // depth opened by each unclosed `${`
    let mut substitutions: Vec<usize> = Vec::new();
    let mut previous: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();
        i += 1;
        match ch {
            c if c.is_whitespace() => continue,
            '/' if next == Some('/') => {
                i = skip_line(&chars, i);
                continue;
            }
            '/' if next == Some('*') => {
                i = skip_block_comment(&chars, i + 1);
                continue;
            }
            '/' if starts_regex(previous) => i = skip_regex(&chars, i),
            '"' | '\'' => i = skip_quoted(&chars, i, ch),
            '`' => {
                let (end, opened) = scan_template(&chars, i);
                i = end;
                if opened {
                    depth += 1;
                    deepest = deepest.max(depth);
                    substitutions.push(depth);
                }
            }
            '}' if substitutions.last() == Some(&depth) => {
                substitutions.pop();
                depth -= 1;
                let (end, opened) = scan_template(&chars, i);
                i = end;
                if opened {
                    depth += 1;
                    deepest = deepest.max(depth);
                    substitutions.push(depth);
                }
            }
            '(' | '[' | '{' => {
                depth += 1;
                deepest = deepest.max(depth);
            }
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
        previous = Some(ch);
    }
    deepest
}

/// Only punctuators after which `/` cannot be division.
fn starts_regex(previous: Option<char>) -> bool {
    previous.map_or(true, |c| "(,=:[!&|?{};~*%<>^".contains(c))
}

fn skip_line(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i] != '\n' {
        i += 1;
    }
    i
}

fn skip_block_comment(chars: &[char], mut i: usize) -> usize {
    while i + 1 < chars.len() {
        if chars[i] == '*' && chars[i + 1] == '/' {
            return i + 2;
        }
        i += 1;
    }
    chars.len()
}

/// String literals end at their quote or, unterminated, at a line break.
fn skip_quoted(chars: &[char], mut i: usize, quote: char) -> usize {
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        if c == '\\' {
            i += 1;
        } else if c == quote || c == '\n' {
            break;
        }
    }
    i
}

fn skip_regex(chars: &[char], mut i: usize) -> usize {
    let mut in_class = false;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        match c {
            '\\' => i += 1,
            '\n' => break,
            '[' => in_class = true,
            ']' => in_class = false,
            '/' if !in_class => break,
            _ => {}
        }
    }
    i
}

/// Walk template text. Returns where scanning resumes and whether it stopped
/// at a `${` rather than the closing backtick.
fn scan_template(chars: &[char], mut i: usize) -> (usize, bool) {
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '`' => return (i + 1, false),
            '$' if chars.get(i + 1) == Some(&'{') => return (i + 2, true),
            _ => i += 1,
        }
    }
    (chars.len(), false)
}

/// Polls a budgeted evaluation and abandons it once the deadline passes, the
/// hard ceiling has been crossed at any point, or the thread's heap stays
/// above the ceiling after a collection.
struct Watchdog<'a> {
    evaluation: Pin<Box<dyn Future<Output = JsResult<JsValue>> + 'a>>,
    deadline: Instant,
    timeout_ms: u64,
    heap_ceiling: usize,
    memory_limit_mb: u32,
}

impl Future for Watchdog<'_> {
    type Output = std::result::Result<JsResult<JsValue>, TerminationReason>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        if Instant::now() >= self.deadline {
            return Poll::Ready(Err(TerminationReason::WallClockTimeout {
                timeout_ms: self.timeout_ms,
            }));
        }

        if heap::is_metering() && heap::ceiling_breached() {
            return Poll::Ready(Err(TerminationReason::MemoryLimit {
                limit_mb: self.memory_limit_mb,
            }));
        }

        if heap::is_metering() && heap::live_bytes() > self.heap_ceiling {
            boa_gc::force_collect();
            if heap::live_bytes() > self.heap_ceiling {
                return Poll::Ready(Err(TerminationReason::MemoryLimit {
                    limit_mb: self.memory_limit_mb,
                }));
            }
        }

        self.evaluation.as_mut().poll(cx).map(Ok)
    }
}
