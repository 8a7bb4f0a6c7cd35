//! Sandbox context construction and the marshaling boundary.
//!
//! A [`SandboxContext`] is the global scope user code runs in. It exposes a
//! reduced standard library, a `global` self-reference and a `console` whose
//! only effect is appending [`LogEntry`] values to a run-scoped sink. Values
//! only ever cross the boundary as JSON copies: [`SandboxContext::inject_global`]
//! on the way in and [`SandboxContext::to_host`] on the way out.

use std::cell::RefCell;
use std::rc::Rc;

use boa_engine::object::ObjectInitializer;
use boa_engine::property::Attribute;
use boa_engine::{
    js_string, Context, Finalize, JsObject, JsResult, JsString, JsValue, NativeFunction, Script,
    Source, Trace,
};
use serde_json::Value;

use super::limits::ContextLimits;
use super::log::{LogEntry, LogLevel};
use super::types::Language;

/// Globals removed from every context: dynamic code loading, reflection
/// hooks and shared or raw memory.
const DENIED_GLOBALS: &[&str] = &[
    "eval",
    "Function",
    "Proxy",
    "Reflect",
    "ArrayBuffer",
    "SharedArrayBuffer",
    "DataView",
    "Int8Array",
    "Uint8Array",
    "Uint8ClampedArray",
    "Int16Array",
    "Uint16Array",
    "Int32Array",
    "Uint32Array",
    "Float32Array",
    "Float64Array",
    "BigInt64Array",
    "BigUint64Array",
    "Atomics",
    "WeakRef",
    "FinalizationRegistry",
    "escape",
    "unescape",
];

/// Function constructors stay reachable through `.constructor` even with the
/// `Function` global gone, so their prototypes are locked first.
const LOCKDOWN_SCRIPT: &str = r#"
(function () {
  var lock = function (proto) {
    if (proto) {
      Object.defineProperty(proto, "constructor", {
        value: undefined,
        writable: false,
        enumerable: false,
        configurable: false
      });
    }
  };
  lock(Object.getPrototypeOf(function () {}));
  lock(Object.getPrototypeOf(async function () {}));
  lock(Object.getPrototypeOf(function* () {}));
  lock(Object.getPrototypeOf(async function* () {}));
})();
"#;

/// Loop iterations a single loop may run while the host is serializing a
/// value (user `toJSON` hooks and getters).
const MARSHAL_LOOP_LIMIT: u64 = 100_000;

type LogSink = Rc<RefCell<Vec<LogEntry>>>;

#[derive(Trace, Finalize)]
struct ConsoleCapture {
    stringify: JsObject,
    #[unsafe_ignore_trace]
    sink: LogSink,
    #[unsafe_ignore_trace]
    level: LogLevel,
}

/// Error raised inside the sandbox and caught by the run wrapper.
#[derive(Debug, Clone, PartialEq)]
pub struct CaughtError {
    pub message: String,
    pub stack: String,
}

pub struct SandboxContext {
    context: Context,
    /// `JSON.stringify` as it was before any user code ran
    stringify: JsObject,
    logs: LogSink,
}

impl SandboxContext {
    /// Build a fresh context on the calling thread.
    pub fn build(limits: &ContextLimits) -> JsResult<Self> {
        let mut context = Context::builder().build()?;

        let runtime_limits = context.runtime_limits_mut();
        runtime_limits.set_recursion_limit(limits.recursion_limit);
        runtime_limits.set_stack_size_limit(limits.stack_size_limit);

        let json = context.intrinsics().objects().json();
        let stringify = json
            .get(js_string!("stringify"), &mut context)?
            .as_callable()
            .cloned()
            .ok_or_else(|| {
                boa_engine::JsNativeError::typ().with_message("JSON.stringify is not callable")
            })?;

        context.eval(Source::from_bytes(LOCKDOWN_SCRIPT))?;

        let global = context.global_object();
        for name in DENIED_GLOBALS {
            global.delete_property_or_throw(JsString::from(*name), &mut context)?;
        }

        context.register_global_property(
            js_string!("global"),
            global.clone(),
            Attribute::WRITABLE | Attribute::CONFIGURABLE,
        )?;

        let logs: LogSink = Rc::new(RefCell::new(Vec::new()));
        let mut console = ObjectInitializer::new(&mut context);
        for (method, level) in LogLevel::CONSOLE_METHODS {
            console.function(
                NativeFunction::from_copy_closure_with_captures(
                    console_method,
                    ConsoleCapture {
                        stringify: stringify.clone(),
                        sink: logs.clone(),
                        level,
                    },
                ),
                JsString::from(method),
                0,
            );
        }
        let console = console.build();
        context.register_global_property(
            js_string!("console"),
            console,
            Attribute::WRITABLE | Attribute::CONFIGURABLE,
        )?;

        Ok(Self {
            context,
            stringify,
            logs,
        })
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Compile source text against this context.
    pub fn compile(&mut self, source: &str) -> JsResult<Script> {
        Script::parse(Source::from_bytes(source), None, &mut self.context)
    }

    /// Define `name` on the global object as a deep copy of `value`.
    pub fn inject_global(&mut self, name: &str, value: &Value) -> JsResult<()> {
        let value = JsValue::from_json(value, &mut self.context)?;
        self.context
            .global_object()
            .create_data_property_or_throw(JsString::from(name), value, &mut self.context)?;
        Ok(())
    }

    /// Copy the global `name` out of the sandbox. Missing globals read as `None`.
    pub fn read_global(&mut self, name: &str) -> Option<Value> {
        let global = self.context.global_object();
        let key = JsString::from(name);
        if !global.has_own_property(key.clone(), &mut self.context).ok()? {
            return None;
        }
        let value = global.get(key, &mut self.context).ok()?;
        Some(self.to_host(&value))
    }

    /// Serialize a sandbox value into a host value.
    ///
    /// Anything `JSON.stringify` rejects or maps to `undefined` (functions,
    /// symbols, cycles, BigInt) comes out as `null`.
    pub fn to_host(&mut self, value: &JsValue) -> Value {
        if value.is_undefined() {
            return Value::Null;
        }
        let text = with_marshal_limits(&mut self.context, |ctx| {
            self.stringify
                .call(&JsValue::undefined(), &[value.clone()], ctx)
        });
        text.ok()
            .and_then(|text| {
                text.as_string()
                    .map(|s| s.to_std_string_escaped())
            })
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or(Value::Null)
    }

    /// Inspect a completion value for the error sentinel planted by
    /// [`wrap_source`].
    pub fn caught_error(&mut self, value: &JsValue, sentinel: &str) -> Option<CaughtError> {
        let object = value.as_object()?;
        if !object
            .has_own_property(JsString::from(sentinel), &mut self.context)
            .unwrap_or(false)
        {
            return None;
        }
        let read = |key: JsString, context: &mut Context| {
            object
                .get(key, context)
                .ok()
                .and_then(|v| v.as_string().map(|s| s.to_std_string_escaped()))
                .unwrap_or_default()
        };
        Some(CaughtError {
            message: read(js_string!("message"), &mut self.context),
            stack: read(js_string!("stack"), &mut self.context),
        })
    }

    /// Logs captured since the last call.
    pub fn take_logs(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.logs.borrow_mut())
    }
}

fn with_marshal_limits<T>(context: &mut Context, f: impl FnOnce(&mut Context) -> T) -> T {
    let saved = context.runtime_limits();
    context
        .runtime_limits_mut()
        .set_loop_iteration_limit(MARSHAL_LOOP_LIMIT);
    let out = f(context);
    context.set_runtime_limits(saved);
    out
}

fn console_method(
    _this: &JsValue,
    args: &[JsValue],
    capture: &ConsoleCapture,
    context: &mut Context,
) -> JsResult<JsValue> {
    let message = args
        .iter()
        .map(|arg| render_log_arg(arg, &capture.stringify, context))
        .collect::<Vec<_>>()
        .join(" ");
    capture
        .sink
        .borrow_mut()
        .push(LogEntry::new(capture.level, message));
    Ok(JsValue::undefined())
}

fn render_log_arg(arg: &JsValue, stringify: &JsObject, context: &mut Context) -> String {
    if let Some(s) = arg.as_string() {
        return s.to_std_string_escaped();
    }
    let json = with_marshal_limits(context, |ctx| {
        stringify.call(&JsValue::undefined(), &[arg.clone()], ctx)
    });
    match json {
        Ok(text) => match text.as_string() {
            Some(s) => s.to_std_string_escaped(),
            None => arg.display().to_string(),
        },
        Err(_) => arg.display().to_string(),
    }
}

/// Fresh, unguessable property name marking a caught error.
pub fn sentinel_key() -> String {
    format!("__sandkit_error_{}", uuid::Uuid::new_v4().simple())
}

/// Wrap user code so a throw completes with a sentinel object instead of
/// escaping. The script's completion value carries the result either way.
pub fn wrap_source(code: &str, language: Language, sentinel: &str) -> String {
    let body = match language {
        Language::Javascript => code.to_string(),
        Language::Json => format!(
            "JSON.parse({})",
            serde_json::to_string(code).unwrap_or_else(|_| "\"\"".to_string())
        ),
    };
    format!(
        "try {{\n{body}\n}} catch (__err) {{\n({{ \"{sentinel}\": true, \
         message: (__err !== null && typeof __err === \"object\" && \"message\" in __err) \
         ? String(__err.message) : String(__err), \
         stack: (__err !== null && typeof __err === \"object\" && __err.stack) \
         ? String(__err.stack) : \"\" }})\n}}"
    )
}
