//! Isolated execution contexts.
//!
//! A context is a frame with its own realm, document, location and history,
//! backed by an `<iframe>` in the host body. Code evaluated through
//! [`IsolatedContext::eval_script`] sees only the frame's globals plus the
//! host's injected names.

use std::cell::{Cell, RefCell};

use regex::Regex;
use rquickjs::{Ctx, Function};
use thiserror::Error;
use url::Url;

use crate::frame::{FrameId, NodeHandle};
use crate::host::{self, EventTarget, HostInner, HostPage};
use crate::js::dom::DocumentTree;
use crate::js::events::BindingTarget;
use crate::js::runtime::{capture_exception_message, with_source_url};
use crate::net::{resolve_url, FetchError};

const BLANK_URL: &str = "about:blank";

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("frame navigation failed: {0}")]
    Navigation(String),
    #[error("engine error: {0}")]
    Engine(String),
    #[error("context was removed")]
    Removed,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid resource pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl From<anyhow::Error> for ContextError {
    fn from(err: anyhow::Error) -> Self {
        ContextError::Engine(format!("{err:#}"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    /// Document the frame navigates to. `None` and `about:blank` use an
    /// empty document without waiting.
    pub url: Option<String>,
    pub id: Option<String>,
    /// Script URLs matching any of these run in the host page instead.
    pub allow_resources: Vec<String>,
    /// Mount into the host `<body>` instead of a fresh element.
    pub disable_body: bool,
    pub body: Option<NodeHandle>,
    /// Context to nest under; defaults to the host page.
    pub parent: Option<FrameId>,
}

impl ContextOptions {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn allow_resource(mut self, pattern: impl Into<String>) -> Self {
        self.allow_resources.push(pattern.into());
        self
    }

    pub fn nested_in(mut self, parent: &IsolatedContext) -> Self {
        self.parent = Some(parent.frame());
        self
    }
}

pub struct IsolatedContext {
    frame: FrameId,
    id: Option<String>,
    allow_resources: Vec<Regex>,
    body: RefCell<Option<NodeHandle>>,
    removed: Cell<bool>,
    host: HostPage,
}

impl IsolatedContext {
    pub async fn create(host: &HostPage, options: ContextOptions) -> Result<Self, ContextError> {
        let allow_resources = options
            .allow_resources
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        let target = match options.url.as_deref() {
            None | Some("") | Some(BLANK_URL) => None,
            Some(raw) => Some(resolve_url(raw, host.base_url())?),
        };
        let parent = options.parent.unwrap_or(FrameId::TOP);

        let src = match &target {
            Some(url) => url.clone(),
            None => Url::parse(BLANK_URL).map_err(|err| ContextError::Navigation(err.to_string()))?,
        };
        let iframe = host.append_frame_element(&src, options.id.as_deref())?;

        let (document, url) = match target {
            None => (DocumentTree::empty(), host.base_url().clone()),
            Some(url) => match host.fetch(&url).await {
                Ok(html) => (DocumentTree::parse(&html), url),
                Err(err) => {
                    tracing::warn!(target: "sandbox", %url, error = %err, "frame navigation failed");
                    detach(host, iframe);
                    return Err(ContextError::Navigation(err.to_string()));
                }
            },
        };

        let frame = match host.create_frame(parent, document, url) {
            Ok(frame) => frame,
            Err(err) => {
                detach(host, iframe);
                return Err(err.into());
            }
        };
        host.inner().frames.borrow_mut().frame_mut(frame)?.frame_element = Some(iframe);

        let context = Self {
            frame,
            id: options.id,
            allow_resources,
            body: RefCell::new(None),
            removed: Cell::new(false),
            host: host.clone(),
        };
        let body = if options.disable_body {
            host.body()?
        } else if let Some(body) = options.body {
            body
        } else {
            let root = host.document_element()?;
            let mut frames = host.inner().frames.borrow_mut();
            let div = frames.create_element(FrameId::TOP, "div")?;
            frames.append_child(root, div)?;
            div
        };
        context.body.replace(Some(body));

        tracing::info!(target: "sandbox", %frame, id = ?context.id, "isolated context ready");
        Ok(context)
    }

    pub fn frame(&self) -> FrameId {
        self.frame
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn host(&self) -> &HostPage {
        &self.host
    }

    /// Element the application mounts into.
    pub fn body(&self) -> Option<NodeHandle> {
        *self.body.borrow()
    }

    /// Replace the mount element. Passing `None` only clears a context that
    /// has no body yet.
    pub fn update_body(&self, body: Option<NodeHandle>) {
        if body.is_none() && self.body.borrow().is_some() {
            return;
        }
        self.body.replace(body);
    }

    pub fn allows_resource(&self, url: &str) -> bool {
        self.allow_resources.iter().any(|pattern| pattern.is_match(url))
    }

    fn ensure_live(&self) -> Result<(), ContextError> {
        if self.removed.get() {
            return Err(ContextError::Removed);
        }
        Ok(())
    }

    /// Evaluate an expression in the frame's realm.
    pub fn eval_with<V>(&self, source: &str, filename: &str) -> Result<V, ContextError>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        self.ensure_live()?;
        let realm = self.host.inner().realm(self.frame)?;
        Ok(self.host.engine().eval_in(&realm, source, filename)?)
    }

    /// Run `code` with the frame's globals and the host's injected names in
    /// scope. `document.currentScript` reports `script`, or a detached
    /// `<script src=url>` when none is given. Whatever the code throws is
    /// logged, not returned.
    pub fn eval_script(
        &self,
        code: &str,
        url: &str,
        script: Option<NodeHandle>,
    ) -> Result<(), ContextError> {
        self.ensure_live()?;
        let script = match script {
            Some(script) => script,
            None => {
                let mut frames = self.host.inner().frames.borrow_mut();
                let script = frames.create_element(self.frame, "script")?;
                frames.set_attribute(script, "src", url)?;
                script
            }
        };
        let inner = self.host.inner().clone();
        let frame = self.frame;
        let realm = inner.realm(frame)?;
        let thrown = self
            .host
            .engine()
            .with_realm(&realm, |ctx| run_scoped(&ctx, &inner, frame, code, url, script))?;
        if let Some(message) = thrown {
            tracing::error!(target: "sandbox", frame = %self.frame, url, error = %message, "sandboxed script failed");
        }
        self.host.engine().drain_jobs()?;
        Ok(())
    }

    /// Fetch a script and run it in this context. URLs matching
    /// `allow_resources` are handed to the host page instead.
    pub async fn load_script(&self, url: &str, script: Option<NodeHandle>) -> Result<(), ContextError> {
        self.ensure_live()?;
        let resolved = resolve_url(url, self.host.base_url())?;
        if self.allows_resource(resolved.as_str()) {
            tracing::debug!(target: "sandbox", frame = %self.frame, url = %resolved, "allowed resource runs in the host page");
            let tag = self.host.append_script_tag(&resolved, None)?;
            let source = self.host.fetch(&resolved).await?;
            self.host.run_script_tag(tag, &source, resolved.as_str())?;
            return Ok(());
        }

        let source = self.host.fetch(&resolved).await?;
        self.eval_script(&source, resolved.as_str(), script)
    }

    /// Execute `<script src>` elements the sandboxed code appended to its own
    /// document, in order. Returns how many ran.
    pub async fn run_pending_scripts(&self) -> Result<usize, ContextError> {
        let mut ran = 0;
        loop {
            self.ensure_live()?;
            let next = self
                .host
                .inner()
                .frames
                .borrow_mut()
                .get_mut(self.frame)
                .and_then(|state| state.pending_scripts.pop_front());
            let Some(pending) = next else {
                return Ok(ran);
            };
            let event_type = match self.load_script(&pending.url, Some(pending.script)).await {
                Ok(()) => {
                    ran += 1;
                    "load"
                }
                Err(ContextError::Removed) => return Err(ContextError::Removed),
                Err(err) => {
                    tracing::warn!(target: "sandbox", frame = %self.frame, url = %pending.url, error = %err, "pending script failed to load");
                    "error"
                }
            };
            self.fire_script_event(pending.script, event_type)?;
        }
    }

    /// Deliver `load` or `error` to a script element's `on<type>` handler and
    /// listeners.
    fn fire_script_event(&self, script: NodeHandle, event_type: &str) -> Result<(), ContextError> {
        self.ensure_live()?;
        let source = format!(
            "__enclave_script_event({}, {})",
            serde_json::Value::String(script.to_string()),
            serde_json::Value::String(event_type.to_string()),
        );
        let delivered: bool = self.eval_with(&source, "script-event.js")?;
        if !delivered {
            tracing::debug!(target: "sandbox", frame = %self.frame, %script, event_type, "script element is gone");
        }
        self.host.engine().drain_jobs()?;
        Ok(())
    }

    /// Listeners this context added through its window, wherever they are bound.
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.host
            .inner()
            .frames
            .borrow()
            .get(self.frame)
            .map(|state| state.listener_map.count(event_type))
            .unwrap_or(0)
    }

    /// Listeners bound on the frame's own window.
    pub fn frame_listener_count(&self, event_type: &str) -> usize {
        self.host
            .inner()
            .frames
            .borrow()
            .get(self.frame)
            .map(|state| state.events.count(event_type))
            .unwrap_or(0)
    }

    pub fn document_listener_count(&self, event_type: &str) -> usize {
        self.host
            .inner()
            .frames
            .borrow()
            .get(self.frame)
            .map(|state| state.document_events.count(event_type))
            .unwrap_or(0)
    }

    /// Fire a plain event at the frame's window. Returns the listener count.
    pub fn dispatch_event(&self, event_type: &str) -> Result<usize, ContextError> {
        self.ensure_live()?;
        Ok(self
            .host
            .dispatch_event(self.frame, EventTarget::Window, event_type)?)
    }

    pub fn dispatch_document_event(&self, event_type: &str) -> Result<usize, ContextError> {
        self.ensure_live()?;
        Ok(self
            .host
            .dispatch_event(self.frame, EventTarget::Document, event_type)?)
    }

    pub fn location_href(&self) -> Option<String> {
        self.host
            .inner()
            .frames
            .borrow()
            .get(self.frame)
            .map(|state| state.location.url().to_string())
    }

    pub fn history_length(&self) -> usize {
        self.host
            .inner()
            .frames
            .borrow()
            .get(self.frame)
            .map(|state| state.history.len())
            .unwrap_or(0)
    }

    /// The `<iframe>` standing for this context in the host document.
    pub fn frame_element(&self) -> Option<NodeHandle> {
        self.host
            .inner()
            .frames
            .borrow()
            .get(self.frame)
            .and_then(|state| state.frame_element)
    }

    pub fn frame_html(&self) -> Option<String> {
        self.host
            .inner()
            .frames
            .borrow()
            .get(self.frame)
            .map(|state| state.document.to_html())
    }

    pub fn is_removed(&self) -> bool {
        self.removed.get()
    }

    /// Tear the context down: drop document listeners, unbind listeners it
    /// put on the host window, detach the backing `<iframe>` and release the
    /// realm. Calling it again does nothing.
    pub fn remove(&self) {
        if self.removed.replace(true) {
            return;
        }
        let host = self.host.inner();
        let (iframe, released) = {
            let mut frames = host.frames.borrow_mut();
            let Some(state) = frames.get_mut(self.frame) else {
                return;
            };
            let mut released = Vec::new();
            let document_listeners = state.document_events.clear();
            let bound = state.listener_map.drain();
            let frame_listeners = state.events.clear();
            let iframe = state.frame_element.take();
            tracing::debug!(
                target: "sandbox",
                frame = %self.frame,
                document_listeners,
                frame_listeners,
                "clearing context listeners"
            );

            if let Some(top) = frames.get_mut(FrameId::TOP) {
                for (event_type, listener) in bound {
                    if listener.target == BindingTarget::HostWindow
                        && top.events.remove(&event_type, listener.id, listener.capture)
                    {
                        released.push(event_type);
                    }
                }
            }
            (iframe, released)
        };
        if !released.is_empty() {
            tracing::debug!(target: "sandbox", frame = %self.frame, events = ?released, "unbound ambient listeners from host window");
        }

        if let Some(iframe) = iframe {
            detach(&self.host, iframe);
        }
        self.host.destroy_frame(self.frame);
        tracing::info!(target: "sandbox", frame = %self.frame, "isolated context removed");
    }
}

impl Drop for IsolatedContext {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Remove the `<iframe>` from its parent, or point it at an empty document
/// when it is not attached anywhere.
fn detach(host: &HostPage, iframe: NodeHandle) {
    let mut frames = host.inner().frames.borrow_mut();
    let outcome = match frames.parent(iframe) {
        Ok(Some(parent)) => frames.remove_child(parent, iframe),
        Ok(None) => frames.set_attribute(iframe, "src", BLANK_URL),
        Err(err) => Err(err),
    };
    if let Err(err) = outcome {
        tracing::warn!(target: "sandbox", %iframe, error = %err, "failed to detach frame element");
    }
}

/// Run `code` in `frame` through [`scoped_wrapper`] with `script` as
/// `document.currentScript`. Returns the message of an uncaught exception.
pub(crate) fn run_scoped<'js>(
    ctx: &Ctx<'js>,
    host: &HostInner,
    frame: FrameId,
    code: &str,
    url: &str,
    script: NodeHandle,
) -> rquickjs::Result<Option<String>> {
    let wrapper = with_source_url(&scoped_wrapper(code, &host.injected_names()), url);
    let scope = host.snapshot(ctx, frame)?;
    scope.set("__current_script__", host::element(ctx, script)?)?;
    let outcome = ctx
        .eval::<Function, _>(wrapper)
        .and_then(|resolver| resolver.call::<_, ()>((scope,)));
    match outcome {
        Ok(()) => Ok(None),
        Err(rquickjs::Error::Exception) => Ok(Some(
            capture_exception_message(ctx).unwrap_or_else(|| "script threw".to_string()),
        )),
        Err(err) => Err(err),
    }
}

/// JS source evaluating to `function (scope)` that runs `code` with the
/// scope's globals as locals. `document` is replaced by a view whose
/// `currentScript` is the originating script; `window.document` returns that
/// view too.
fn scoped_wrapper(code: &str, injected: &[String]) -> String {
    let mut params = String::from("window, location, history, document, globalThis");
    let mut args = String::from(
        "__window, __window, __scope.location, __scope.history, __document, __window",
    );
    for name in injected {
        params.push_str(", ");
        params.push_str(name);
        args.push_str(", __scope.");
        args.push_str(name);
    }
    format!(
        "(function (__scope) {{\n\
         var __document = Object.create(__scope.document, {{\n\
             currentScript: {{ value: __scope.__current_script__, enumerable: true }},\n\
         }});\n\
         var __window = new Proxy(__scope.window, {{\n\
             get: function (target, prop) {{\n\
                 return prop === 'document' ? __document : target[prop];\n\
             }},\n\
         }});\n\
         return (function ({params}) {{\n\
             try {{\n{code}\n}} catch (e) {{\n console.error(e);\n }}\n\
         }}).call({args});\n\
         }})\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_passes_injected_names_as_parameters() {
        let wrapper = scoped_wrapper("run();", &["appConfig".to_string()]);
        assert!(wrapper.contains("(function (window, location, history, document, globalThis, appConfig)"));
        assert!(wrapper.contains("__scope.appConfig"));
        assert!(wrapper.contains("run();"));
    }

    #[test]
    fn options_builder_collects_patterns() {
        let options = ContextOptions::default()
            .with_url("/frame.html")
            .with_id("app")
            .allow_resource("^https://cdn\\.");
        assert_eq!(options.url.as_deref(), Some("/frame.html"));
        assert_eq!(options.id.as_deref(), Some("app"));
        assert_eq!(options.allow_resources.len(), 1);
    }
}
