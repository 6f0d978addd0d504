use anyhow::{Context as AnyhowContext, Result};
use rquickjs::{Context, Ctx, Error as JsError, Function, Runtime, Value};

/// JavaScript runtime backed by QuickJS.
///
/// The engine owns the QuickJS runtime and the host realm. Isolated realms are
/// created from the same runtime with [`QuickJsEngine::new_realm`] so values can
/// travel between them. Every realm gets a `console` that forwards to tracing.
pub struct QuickJsEngine {
    context: Context,
    runtime: Runtime,
}

impl QuickJsEngine {
    pub fn new() -> Result<Self> {
        let runtime = Runtime::new().context("failed to create QuickJS runtime")?;
        let context = Context::full(&runtime).context("failed to create QuickJS context")?;
        init_console(&context)?;
        Ok(Self { context, runtime })
    }

    /// Create another realm (separate global object) on the same runtime.
    pub fn new_realm(&self) -> Result<Context> {
        let realm = Context::full(&self.runtime).context("failed to create QuickJS realm")?;
        init_console(&realm)?;
        Ok(realm)
    }

    pub fn host_realm(&self) -> &Context {
        &self.context
    }

    /// Evaluate a script in the host realm and discard the result.
    pub fn eval(&self, source: &str, filename: &str) -> Result<()> {
        self.eval_with::<()>(source, filename)
    }

    /// Evaluate a script in the host realm and convert the result into `V`.
    pub fn eval_with<V>(&self, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        self.eval_in(&self.context, source, filename)
    }

    /// Evaluate a script in `realm`, then drain pending promise jobs.
    pub fn eval_in<V>(&self, realm: &Context, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        let script = with_source_url(source, filename);
        let value = realm.with(|ctx| match ctx.eval::<V, _>(script) {
            Ok(value) => Ok(value),
            Err(JsError::Exception) => Err(anyhow::anyhow!(
                capture_exception_message(&ctx).unwrap_or_else(|| "QuickJS exception".to_string())
            )),
            Err(err) => Err(anyhow::Error::from(err)),
        })?;

        self.drain_jobs()?;
        Ok(value)
    }

    /// Run `f` inside the host realm.
    pub fn with_context<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> rquickjs::Result<T>,
    {
        self.with_realm(&self.context, f)
    }

    /// Run `f` inside `realm`, translating a pending JS exception into its message.
    pub fn with_realm<T, F>(&self, realm: &Context, f: F) -> Result<T>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> rquickjs::Result<T>,
    {
        realm.with(|ctx| match f(ctx.clone()) {
            Ok(value) => Ok(value),
            Err(JsError::Exception) => Err(anyhow::anyhow!(
                capture_exception_message(&ctx).unwrap_or_else(|| "QuickJS exception".to_string())
            )),
            Err(err) => Err(anyhow::Error::from(err)),
        })
    }

    /// Execute all pending jobs in the QuickJS job queue.
    ///
    /// Must not be called from inside a realm callback; the runtime lock is not
    /// re-entrant.
    pub fn drain_jobs(&self) -> Result<bool> {
        let mut job_count = 0;
        const MAX_JOBS: usize = 1000;

        while self.runtime.is_job_pending() {
            match self.runtime.execute_pending_job() {
                Ok(true) => {
                    job_count += 1;
                    if job_count >= MAX_JOBS {
                        tracing::warn!(
                            target: "quickjs",
                            "Stopped processing jobs after {} iterations (possible infinite loop)",
                            MAX_JOBS
                        );
                        break;
                    }
                }
                Ok(false) => break,
                Err(job_exception) => {
                    tracing::error!(
                        target: "quickjs",
                        "Job execution error: {:?}",
                        job_exception
                    );
                    break;
                }
            }
        }

        if job_count > 0 {
            tracing::debug!(target: "quickjs", "Executed {} pending jobs", job_count);
        }

        Ok(job_count > 0)
    }
}

fn init_console(realm: &Context) -> Result<()> {
    realm
        .with(|ctx| {
            let global = ctx.globals();
            let log_fn = Function::new(ctx.clone(), log_from_js)?.with_name("__enclave_log")?;
            global.set("__enclave_log", log_fn)?;
            ctx.eval::<(), _>(CONSOLE_BOOTSTRAP.as_bytes())
        })
        .map_err(anyhow::Error::from)
}

pub(crate) fn with_source_url(source: &str, filename: &str) -> Vec<u8> {
    let mut script = String::with_capacity(source.len() + filename.len() + 32);
    script.push_str(source);
    if !source.ends_with('\n') {
        script.push('\n');
    }
    script.push_str("//# sourceURL=");
    script.push_str(filename);
    script.push('\n');
    script.into_bytes()
}

fn log_from_js(level: String, message: String) -> rquickjs::Result<()> {
    match level.as_str() {
        "error" => tracing::error!(target: "quickjs", message = %message),
        "warn" => tracing::warn!(target: "quickjs", message = %message),
        "debug" => tracing::debug!(target: "quickjs", message = %message),
        _ => tracing::info!(target: "quickjs", message = %message),
    }
    Ok(())
}

/// Take the pending exception off `ctx` and render it as text.
pub fn capture_exception_message(ctx: &Ctx<'_>) -> Option<String> {
    let exception: Value = ctx.catch();
    Some(describe_value(&exception))
}

pub fn describe_value(value: &Value<'_>) -> String {
    if let Some(obj) = value.as_object() {
        if let Ok(message) = obj.get::<_, String>("message") {
            if let Ok(stack) = obj.get::<_, String>("stack") {
                if !stack.is_empty() {
                    return format!("Error: {}\nStack: {}", message, stack);
                }
            }
            return format!("Error: {}", message);
        }
    }

    if let Some(text) = value.as_string().and_then(|s| s.to_string().ok()) {
        return text;
    }

    format!("{:?}", value)
}

const CONSOLE_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    const stringify = (value) => {
        try {
            if (typeof value === 'string') {
                return value;
            }
            if (value === undefined) {
                return 'undefined';
            }
            if (value === null) {
                return 'null';
            }
            if (value instanceof Error) {
                return value.name + ': ' + value.message;
            }
            return String(value);
        } catch (err) {
            return '[unprintable]';
        }
    };

    const logAt = (level) => (...args) => {
        try {
            global.__enclave_log(level, args.map(stringify).join(' '));
        } catch (err) {
            // console must never throw
        }
    };

    if (typeof global.console !== 'object' || global.console === null) {
        global.console = {};
    }

    global.console.log = logAt('info');
    global.console.info = logAt('info');
    global.console.debug = logAt('debug');
    global.console.warn = logAt('warn');
    global.console.error = logAt('error');
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_inline_script() {
        let engine = QuickJsEngine::new().expect("engine");
        let result: i32 = engine
            .eval_with(
                "(() => { console.log('hello from test'); return 40 + 2; })()",
                "runtime_test.js",
            )
            .expect("script result");
        assert_eq!(result, 42);
    }

    #[test]
    fn realms_have_separate_globals() {
        let engine = QuickJsEngine::new().expect("engine");
        let realm = engine.new_realm().expect("realm");
        engine
            .eval("globalThis.marker = 'host';", "host.js")
            .expect("host eval");
        let seen: String = engine
            .eval_in(&realm, "typeof globalThis.marker", "realm.js")
            .expect("realm eval");
        assert_eq!(seen, "undefined");
    }

    #[test]
    fn exceptions_carry_messages() {
        let engine = QuickJsEngine::new().expect("engine");
        let err = engine
            .eval("throw new Error('kaboom')", "throw.js")
            .unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }
}
