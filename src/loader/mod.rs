//! Bundle loader: fetches bundles, waits for them to call the global hook and
//! keeps the registry of defined modules.
//!
//! A bundle is wrapped at build time as
//! `HOOK(id, function (require, module, exports, scope) { ... })`. Loading
//! one creates a record keyed by id; concurrent requests for the same id share
//! the record's promise until the hook settles it.

mod error;
mod hook;
mod module;
mod record;

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use futures_util::future::FutureExt;
use url::Url;
use uuid::Uuid;

use crate::context::IsolatedContext;
use crate::frame::FrameId;
use crate::host::HostPage;
use crate::net::resolve_url;

pub use error::LoadError;
pub use module::{DepValue, ModuleExports};
pub use record::{LoadPromise, RecordKey, RecordKind, RecordState};

use hook::LoaderHook;
use module::ModuleRegistry;
use record::{LoadRecord, RecordStore};

/// How the bundle text reaches the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// A `<script src>` in the host `<head>`; the bundle calls the hook itself.
    #[default]
    ScriptTag,
    /// Fetch the text, wrap it in a hook call and evaluate it.
    Text,
}

pub type SourceTransform = Rc<dyn Fn(&str) -> String>;

/// One request to load a bundle.
#[derive(Clone)]
pub struct BundleRequest {
    pub id: String,
    pub url: String,
    pub context: Option<FrameId>,
    pub deps: Vec<(String, DepValue)>,
    pub transform: Option<SourceTransform>,
    pub no_cache: bool,
    pub transport: Transport,
}

impl fmt::Debug for BundleRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleRequest")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("context", &self.context)
            .field("deps", &self.deps.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .field("no_cache", &self.no_cache)
            .field("transport", &self.transport)
            .finish()
    }
}

impl BundleRequest {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            context: None,
            deps: Vec::new(),
            transform: None,
            no_cache: false,
            transport: Transport::ScriptTag,
        }
    }

    /// Run the bundle against an isolated context's globals.
    pub fn with_context(mut self, context: &IsolatedContext) -> Self {
        self.context = Some(context.frame());
        self
    }

    pub fn with_dep(mut self, name: impl Into<String>, exports: ModuleExports) -> Self {
        self.deps.push((name.into(), DepValue::Exports(exports)));
        self
    }

    pub fn with_dep_value(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.deps.push((name.into(), DepValue::Json(value)));
        self
    }

    pub fn with_transform(mut self, transform: impl Fn(&str) -> String + 'static) -> Self {
        self.transform = Some(Rc::new(transform));
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    pub fn text_mode(mut self) -> Self {
        self.transport = Transport::Text;
        self
    }
}

pub(crate) struct LoaderInner {
    pub records: RefCell<RecordStore>,
    pub modules: RefCell<ModuleRegistry>,
    pub host: HostPage,
}

/// Loads bundles into a [`HostPage`]. Clones share the same registry.
#[derive(Clone)]
pub struct ModuleLoader {
    inner: Rc<LoaderInner>,
}

impl ModuleLoader {
    /// Create a loader and claim the host's global hook.
    pub fn new(host: &HostPage) -> Result<Self, LoadError> {
        let inner = Rc::new(LoaderInner {
            records: RefCell::new(RecordStore::default()),
            modules: RefCell::new(ModuleRegistry::default()),
            host: host.clone(),
        });
        host.register_hook(
            FrameId::TOP,
            Rc::new(LoaderHook::new(Rc::downgrade(&inner))),
        )?;
        Ok(Self { inner })
    }

    pub fn host(&self) -> &HostPage {
        &self.inner.host
    }

    /// Load `request.id` unless it is already defined, and return its exports.
    ///
    /// A defined module requested with a context runs its factory again
    /// against that context; the cached exports stay untouched.
    pub async fn require_ensure(&self, request: BundleRequest) -> Result<ModuleExports, LoadError> {
        if !request.no_cache && self.is_resolved(&request.id) {
            return match request.context {
                Some(frame) => self.require_isolated(&request.id, frame),
                None => self.require(&request.id),
            };
        }

        let key = RecordKey::module(&request.id);
        self.await_record(key, &request).await?;
        self.require(&request.id)
    }

    /// Load a plain script wrapped for a context. Nothing is exported.
    pub async fn load_script(&self, request: BundleRequest) -> Result<(), LoadError> {
        let key = RecordKey::script(&request.id);
        self.await_record(key, &request).await
    }

    async fn await_record(&self, key: RecordKey, request: &BundleRequest) -> Result<(), LoadError> {
        let pending = if request.no_cache {
            None
        } else {
            self.inner.records.borrow().pending_promise(&key)
        };
        let promise = match pending {
            Some(promise) => {
                tracing::debug!(target: "loader", id = %request.id, "joining pending load");
                promise
            }
            None => self.start(key, request)?,
        };
        promise.await
    }

    fn start(&self, key: RecordKey, request: &BundleRequest) -> Result<LoadPromise, LoadError> {
        let url = resolve_url(&request.url, self.inner.host.base_url()).map_err(|err| {
            LoadError::Failed {
                id: request.id.clone(),
                url: request.url.clone(),
                reason: err.to_string(),
            }
        })?;
        let uuid = Uuid::new_v4().to_string();
        let timeout = self.inner.host.config().script_timeout();
        tracing::info!(target: "loader", id = %request.id, %url, transport = ?request.transport, "loading bundle");

        let transfer = transfer(
            Rc::downgrade(&self.inner),
            request.clone(),
            url.clone(),
            uuid.clone(),
        );
        let weak = Rc::downgrade(&self.inner);
        let id = request.id.clone();
        let settle_key = key.clone();
        let settle_uuid = uuid.clone();
        let promise = async move {
            let outcome = match tokio::time::timeout(timeout, transfer).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(target: "loader", %id, %url, ?timeout, "bundle load timed out");
                    Err(LoadError::Timeout {
                        id,
                        url: url.to_string(),
                        timeout,
                    })
                }
            };
            settle(&weak, &settle_key, &settle_uuid, outcome)
        }
        .boxed_local()
        .shared();

        let replaced = self.inner.records.borrow_mut().insert(LoadRecord {
            key,
            uuid,
            context: request.context,
            deps: request.deps.clone(),
            state: RecordState::Pending,
            promise: promise.clone(),
        });
        drop(replaced);
        Ok(promise)
    }

    /// Exports of a defined module.
    pub fn require(&self, id: &str) -> Result<ModuleExports, LoadError> {
        module::require(&self.inner, id)?.ok_or_else(|| LoadError::NotFound { id: id.to_string() })
    }

    /// Run a defined module's factory again with `frame`'s globals.
    pub fn require_isolated(&self, id: &str, frame: FrameId) -> Result<ModuleExports, LoadError> {
        match module::require_isolated(&self.inner, id, frame)? {
            Some(Ok(exports)) => Ok(exports),
            Some(Err(message)) => Err(LoadError::Factory {
                id: id.to_string(),
                message,
            }),
            None => Err(LoadError::NotFound { id: id.to_string() }),
        }
    }

    pub fn is_resolved(&self, id: &str) -> bool {
        self.inner.modules.borrow().is_resolved(id)
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.inner.records.borrow().is_pending(id)
    }

    pub fn record_count(&self) -> usize {
        self.inner.records.borrow().len()
    }

    /// uuid of the current load record of `key`.
    pub fn record_uuid(&self, key: &RecordKey) -> Option<String> {
        self.inner
            .records
            .borrow()
            .get(key)
            .map(|record| record.uuid.clone())
    }
}

/// Move the bundle text into the engine. Resolves once the bundle has run;
/// whether it reached the hook is decided by [`settle`].
async fn transfer(
    loader: Weak<LoaderInner>,
    request: BundleRequest,
    url: Url,
    uuid: String,
) -> Result<(), LoadError> {
    let host = loader
        .upgrade()
        .map(|loader| loader.host.clone())
        .ok_or_else(|| LoadError::Engine("module loader was dropped".to_string()))?;
    let failed = |reason: String| LoadError::Failed {
        id: request.id.clone(),
        url: url.to_string(),
        reason,
    };

    match request.transport {
        Transport::ScriptTag => {
            let script = host.append_script_tag(&url, Some(&uuid))?;
            let source = host
                .fetch(&url)
                .await
                .map_err(|err| failed(err.to_string()))?;
            host.run_script_tag(script, &source, url.as_str())?;
        }
        Transport::Text => {
            let source = host
                .fetch(&url)
                .await
                .map_err(|err| failed(err.to_string()))?;
            let source = match &request.transform {
                Some(transform) => transform(&source),
                None => source,
            };
            let wrapped = wrap_text_bundle(
                &host.config().hook_name,
                &request.id,
                &source,
                &host.injected_names(),
            );
            let frame = request.context.unwrap_or(FrameId::TOP);
            if let Err(err) = host.eval_in_frame(frame, &wrapped, url.as_str()) {
                tracing::error!(target: "loader", id = %request.id, %url, error = %err, "bundle text threw during evaluation");
            }
        }
    }
    Ok(())
}

/// Wrap fetched bundle text so it registers itself through the hook with the
/// context's globals bound as locals.
fn wrap_text_bundle(hook_name: &str, id: &str, source: &str, injected: &[String]) -> String {
    let id = serde_json::Value::String(id.to_string()).to_string();
    let mut params = String::from("window, location, history, document");
    let mut args =
        String::from("__scope.window, __scope.window, __scope.location, __scope.history, __scope.document");
    for name in injected {
        params.push_str(", ");
        params.push_str(name);
        args.push_str(", __scope.");
        args.push_str(name);
    }
    format!(
        "{hook_name}({id}, function (require, module, exports, __scope) {{\n\
         return (function ({params}) {{\n{source}\n}}).call({args});\n\
         }});\n"
    )
}

fn settle(
    loader: &Weak<LoaderInner>,
    key: &RecordKey,
    uuid: &str,
    outcome: Result<(), LoadError>,
) -> Result<(), LoadError> {
    let Some(loader) = loader.upgrade() else {
        return Err(LoadError::Engine("module loader was dropped".to_string()));
    };
    let mut records = loader.records.borrow_mut();
    let state = records
        .get(key)
        .filter(|record| record.uuid == uuid)
        .map(|record| record.state.clone());
    let Some(state) = state else {
        return Err(LoadError::HookResolution {
            id: key.id.clone(),
            reason: "superseded by a newer load".to_string(),
        });
    };

    let (result, remove) = match (outcome, state) {
        (Err(err), _) => (Err(err), true),
        (Ok(()), RecordState::Loaded) => (Ok(()), key.kind == RecordKind::Script),
        (Ok(()), RecordState::Failed(err)) => (Err(err), true),
        (Ok(()), RecordState::Pending) => (
            Err(LoadError::HookResolution {
                id: key.id.clone(),
                reason: "bundle never called the global hook".to_string(),
            }),
            true,
        ),
    };
    let removed = if remove { records.remove(key) } else { None };
    drop(records);
    drop(removed);

    match &result {
        Ok(()) => tracing::debug!(target: "loader", id = %key.id, kind = ?key.kind, "load settled"),
        Err(err) => tracing::warn!(target: "loader", id = %key.id, kind = ?key.kind, error = %err, "load failed"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_bundles_bind_injected_globals() {
        let wrapped = wrap_text_bundle(
            "__HOOK__",
            "app\"1",
            "module.exports = config;",
            &["config".to_string()],
        );
        assert!(wrapped.starts_with("__HOOK__(\"app\\\"1\", function (require, module, exports, __scope)"));
        assert!(wrapped.contains("(function (window, location, history, document, config)"));
        assert!(wrapped.contains(".call(__scope.window, __scope.window, __scope.location, __scope.history, __scope.document, __scope.config)"));
        assert!(wrapped.contains("module.exports = config;"));
    }

    #[test]
    fn requests_default_to_script_tags() {
        let request = BundleRequest::new("app", "/app.js");
        assert_eq!(request.transport, Transport::ScriptTag);
        assert!(!request.no_cache);
        let request = request.text_mode().no_cache();
        assert_eq!(request.transport, Transport::Text);
        assert!(request.no_cache);
    }
}
