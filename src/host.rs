use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::OnceLock;

use anyhow::{anyhow, bail, Result};
use regex::Regex;
use rquickjs::{Context, Ctx, Exception, Function, Object, Persistent, Value};
use url::Url;

use crate::config::LoaderConfig;
use crate::frame::{FrameArena, FrameId, FrameState, NodeHandle};
use crate::hook::{self, HookHandler, PreviousHook};
use crate::js::bindings;
use crate::js::convert::json_to_js;
use crate::js::dom::DocumentTree;
use crate::js::events::invoke_listeners;
use crate::js::runtime::{capture_exception_message, with_source_url, QuickJsEngine};
use crate::loader::ModuleExports;
use crate::net::{BundleFetcher, Credentials, FetchFuture, FetchRequest};

/// Names the scoped wrappers already bind; injected globals may not reuse them.
const RESERVED_NAMES: &[&str] = &[
    "window",
    "location",
    "history",
    "document",
    "globalThis",
    "require",
    "module",
    "exports",
    "__scope",
];

/// Words a JS function parameter list rejects.
const JS_RESERVED_WORDS: &[&str] = &[
    "arguments", "await", "break", "case", "catch", "class", "const", "continue", "debugger",
    "default", "delete", "do", "else", "enum", "eval", "export", "extends", "false", "finally",
    "for", "function", "if", "implements", "import", "in", "instanceof", "interface", "let",
    "new", "null", "package", "private", "protected", "public", "return", "static", "super",
    "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield",
];

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("identifier regex"))
}

pub(crate) fn is_valid_global_name(name: &str) -> bool {
    identifier_pattern().is_match(name)
        && !RESERVED_NAMES.contains(&name)
        && !JS_RESERVED_WORDS.contains(&name)
}

/// Which event target of a frame to dispatch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    Window,
    Document,
}

pub(crate) struct InjectedGlobal {
    pub name: String,
    pub value: Persistent<Value<'static>>,
}

pub(crate) struct HostInner {
    pub frames: RefCell<FrameArena>,
    pub hooks: RefCell<HashMap<FrameId, Vec<Rc<dyn HookHandler>>>>,
    pub injected: RefCell<Vec<InjectedGlobal>>,
    pub realms: RefCell<HashMap<FrameId, Context>>,
    pub config: LoaderConfig,
    pub base_url: Url,
    pub fetcher: Rc<dyn BundleFetcher>,
    pub engine: QuickJsEngine,
}

impl HostInner {
    /// `{window, location, history, document, ...injected}` of `frame`, built
    /// in the calling realm.
    pub fn snapshot<'js>(&self, ctx: &Ctx<'js>, frame: FrameId) -> rquickjs::Result<Object<'js>> {
        let handles = self
            .frames
            .borrow()
            .get(frame)
            .and_then(|state| state.realm.clone());
        let Some(handles) = handles else {
            return Err(Exception::throw_message(
                ctx,
                &format!("frame {frame} has no realm"),
            ));
        };
        let injected: Vec<(String, Persistent<Value<'static>>)> = self
            .injected
            .borrow()
            .iter()
            .map(|global| (global.name.clone(), global.value.clone()))
            .collect();

        let snapshot = Object::new(ctx.clone())?;
        snapshot.set("window", handles.window.restore(ctx)?)?;
        snapshot.set("location", handles.location.restore(ctx)?)?;
        snapshot.set("history", handles.history.restore(ctx)?)?;
        snapshot.set("document", handles.document.restore(ctx)?)?;
        for (name, value) in injected {
            snapshot.set(name, value.restore(ctx)?)?;
        }
        Ok(snapshot)
    }

    pub fn injected_names(&self) -> Vec<String> {
        self.injected
            .borrow()
            .iter()
            .map(|global| global.name.clone())
            .collect()
    }

    pub fn realm(&self, frame: FrameId) -> Result<Context> {
        if frame.is_top() {
            return Ok(self.engine.host_realm().clone());
        }
        self.realms
            .borrow()
            .get(&frame)
            .cloned()
            .ok_or_else(|| anyhow!("frame {frame} has no realm"))
    }
}

/// JS wrapper object for `handle`, created by the realm's bootstrap.
pub(crate) fn element<'js>(ctx: &Ctx<'js>, handle: NodeHandle) -> rquickjs::Result<Value<'js>> {
    let wrap: Function = ctx.globals().get("__enclave_element")?;
    wrap.call((handle.to_string(),))
}

/// The host page: one QuickJS runtime, the top-level realm and document, and
/// every isolated frame created under it. Clones share the same page.
#[derive(Clone)]
pub struct HostPage {
    inner: Rc<HostInner>,
}

impl HostPage {
    pub fn new(config: LoaderConfig, fetcher: Rc<dyn BundleFetcher>) -> Result<Self> {
        let base_url = config.base_url()?;
        let engine = QuickJsEngine::new()?;
        let top = FrameState::new(None, DocumentTree::empty(), base_url.clone());

        let page = Self {
            inner: Rc::new(HostInner {
                frames: RefCell::new(FrameArena::new(top)),
                hooks: RefCell::new(HashMap::new()),
                injected: RefCell::new(Vec::new()),
                realms: RefCell::new(HashMap::new()),
                config,
                base_url,
                fetcher,
                engine,
            }),
        };
        page.setup_realm(FrameId::TOP)?;
        tracing::debug!(target: "loader", base_url = %page.inner.base_url, "host page ready");
        Ok(page)
    }

    pub(crate) fn inner(&self) -> &Rc<HostInner> {
        &self.inner
    }

    pub(crate) fn weak(&self) -> Weak<HostInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn engine(&self) -> &QuickJsEngine {
        &self.inner.engine
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    fn setup_realm(&self, frame: FrameId) -> Result<()> {
        let realm = self.inner.realm(frame)?;
        let parent = self.inner.frames.borrow().parent_of(frame);
        let parent_window = parent
            .and_then(|parent| self.inner.frames.borrow().get(parent)?.realm.clone())
            .map(|handles| handles.window);
        let top_window = self
            .inner
            .frames
            .borrow()
            .get(FrameId::TOP)
            .and_then(|state| state.realm.clone())
            .map(|handles| handles.window);
        let weak = self.weak();
        let hook_name = self.inner.config.hook_name.clone();
        let vars_name = self.inner.config.global_vars_name.clone();

        let handles = self.inner.engine.with_realm(&realm, |ctx| {
            let handles = bindings::install(&ctx, weak.clone(), frame)?;
            hook::install_dispatcher(&ctx, weak, frame, &hook_name)?;
            let globals = ctx.globals();
            if frame.is_top() {
                globals.set(vars_name.as_str(), Object::new(ctx.clone())?)?;
            } else {
                globals.set("__ENCLAVE_CONTEXT__", true)?;
                if let Some(window) = parent_window {
                    globals.set("parent", window.restore(&ctx)?)?;
                }
                if let Some(window) = top_window {
                    globals.set("top", window.restore(&ctx)?)?;
                }
            }
            Ok(handles)
        })?;

        self.inner.frames.borrow_mut().frame_mut(frame)?.realm = Some(handles);
        Ok(())
    }

    /// Allocate a frame with its own realm under `parent`.
    pub(crate) fn create_frame(
        &self,
        parent: FrameId,
        document: DocumentTree,
        url: Url,
    ) -> Result<FrameId> {
        if !self.inner.frames.borrow().contains(parent) {
            bail!("parent frame {parent} is gone");
        }
        let frame = self
            .inner
            .frames
            .borrow_mut()
            .allocate(FrameState::new(Some(parent), document, url));
        let realm = self.inner.engine.new_realm()?;
        self.inner.realms.borrow_mut().insert(frame, realm);

        if let Err(err) = self.setup_realm(frame) {
            self.destroy_frame(frame);
            return Err(err);
        }
        Ok(frame)
    }

    /// Drop a frame, its hook chain and its realm.
    pub(crate) fn destroy_frame(&self, frame: FrameId) {
        let chain = self.inner.hooks.borrow_mut().remove(&frame);
        let state = self.inner.frames.borrow_mut().remove(frame);
        let realm = self.inner.realms.borrow_mut().remove(&frame);
        drop(chain);
        drop(state);
        drop(realm);
    }

    pub fn frame_count(&self) -> usize {
        self.inner.realms.borrow().len() + 1
    }

    pub fn eval(&self, source: &str, filename: &str) -> Result<()> {
        self.inner.engine.eval(source, filename)
    }

    pub fn eval_with<V>(&self, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        self.inner.engine.eval_with(source, filename)
    }

    pub(crate) fn eval_in_frame(&self, frame: FrameId, source: &str, filename: &str) -> Result<()> {
        let realm = self.inner.realm(frame)?;
        self.inner.engine.eval_in::<()>(&realm, source, filename)
    }

    /// Add a handler to the front of `frame`'s hook chain. If a script
    /// replaced the global hook with its own function, that function is kept
    /// as the oldest handler of the chain.
    pub fn register_hook(&self, frame: FrameId, handler: Rc<dyn HookHandler>) -> Result<()> {
        let realm = self.inner.realm(frame)?;
        let weak = self.weak();
        let hook_name = self.inner.config.hook_name.clone();
        let previous = self.inner.engine.with_realm(&realm, |ctx| {
            hook::install_dispatcher(&ctx, weak, frame, &hook_name)
        })?;

        let mut hooks = self.inner.hooks.borrow_mut();
        let chain = hooks.entry(frame).or_default();
        if let Some(previous) = previous {
            tracing::debug!(target: "hook", %frame, "keeping previously installed global hook");
            chain.insert(0, Rc::new(PreviousHook::new(previous)));
        }
        chain.push(handler);
        Ok(())
    }

    pub fn hook_chain_len(&self, frame: FrameId) -> usize {
        self.inner
            .hooks
            .borrow()
            .get(&frame)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn inject_global(&self, name: &str, value: &serde_json::Value) -> Result<()> {
        self.ensure_injectable(name)?;
        let persistent = self
            .inner
            .engine
            .with_context(|ctx| Ok(Persistent::save(&ctx, json_to_js(&ctx, value)?)))?;
        self.store_global(name, persistent)
    }

    pub fn inject_exports(&self, name: &str, exports: &ModuleExports) -> Result<()> {
        self.ensure_injectable(name)?;
        let persistent = self
            .inner
            .engine
            .with_context(|ctx| Ok(Persistent::save(&ctx, exports.restore(&ctx)?)))?;
        self.store_global(name, persistent)
    }

    pub fn remove_global(&self, name: &str) -> bool {
        let removed = {
            let mut injected = self.inner.injected.borrow_mut();
            let index = injected.iter().position(|global| global.name == name);
            index.map(|index| injected.remove(index))
        };
        if removed.is_none() {
            return false;
        }
        let vars_name = self.inner.config.global_vars_name.clone();
        let cleared = self.inner.engine.with_context(|ctx| {
            let bag: Object = ctx.globals().get(vars_name.as_str())?;
            bag.remove(name)
        });
        if let Err(err) = cleared {
            tracing::warn!(target: "loader", name, error = %err, "failed to clear injected global");
        }
        true
    }

    pub fn injected_names(&self) -> Vec<String> {
        self.inner.injected_names()
    }

    fn ensure_injectable(&self, name: &str) -> Result<()> {
        if !is_valid_global_name(name) {
            bail!("`{name}` cannot be injected as a global name");
        }
        Ok(())
    }

    fn store_global(&self, name: &str, value: Persistent<Value<'static>>) -> Result<()> {
        let vars_name = self.inner.config.global_vars_name.clone();
        let mirrored = value.clone();
        self.inner.engine.with_context(|ctx| {
            let bag: Object = ctx.globals().get(vars_name.as_str())?;
            bag.set(name, mirrored.restore(&ctx)?)
        })?;

        let mut injected = self.inner.injected.borrow_mut();
        let replaced = match injected.iter_mut().find(|global| global.name == name) {
            Some(existing) => Some(std::mem::replace(&mut existing.value, value)),
            None => {
                injected.push(crate::host::InjectedGlobal {
                    name: name.to_string(),
                    value,
                });
                None
            }
        };
        drop(injected);
        drop(replaced);
        tracing::debug!(target: "loader", name, "injected global");
        Ok(())
    }

    pub fn head(&self) -> Result<NodeHandle> {
        let head = self.inner.frames.borrow_mut().tree(FrameId::TOP)?.head();
        head.map(|node| NodeHandle::new(FrameId::TOP, node))
            .ok_or_else(|| anyhow!("host document has no <head>"))
    }

    pub fn body(&self) -> Result<NodeHandle> {
        let body = self.inner.frames.borrow_mut().tree(FrameId::TOP)?.body();
        body.map(|node| NodeHandle::new(FrameId::TOP, node))
            .ok_or_else(|| anyhow!("host document has no <body>"))
    }

    pub fn document_element(&self) -> Result<NodeHandle> {
        let root = self
            .inner
            .frames
            .borrow_mut()
            .tree(FrameId::TOP)?
            .document_element();
        root.map(|node| NodeHandle::new(FrameId::TOP, node))
            .ok_or_else(|| anyhow!("host document has no root element"))
    }

    pub fn parent_of(&self, handle: NodeHandle) -> Result<Option<NodeHandle>> {
        self.inner.frames.borrow_mut().parent(handle)
    }

    /// Whether `handle` is attached to its document.
    pub fn is_connected(&self, handle: NodeHandle) -> Result<bool> {
        self.inner.frames.borrow_mut().is_connected(handle)
    }

    pub fn get_attribute(&self, handle: NodeHandle, name: &str) -> Result<Option<String>> {
        self.inner.frames.borrow_mut().get_attribute(handle, name)
    }

    pub fn document_html(&self) -> String {
        self.inner
            .frames
            .borrow()
            .get(FrameId::TOP)
            .map(|state| state.document.to_html())
            .unwrap_or_default()
    }

    /// Script elements in the host document whose `src` resolves to `src`.
    pub fn script_tags(&self, src: &str) -> Vec<NodeHandle> {
        let Ok(wanted) = crate::net::resolve_url(src, &self.inner.base_url) else {
            return Vec::new();
        };
        let mut frames = self.inner.frames.borrow_mut();
        let Ok(tree) = frames.tree(FrameId::TOP) else {
            return Vec::new();
        };
        let Ok(scripts) = tree.query_all("script") else {
            return Vec::new();
        };
        scripts
            .into_iter()
            .filter(|node| {
                tree.get_attribute(*node, "src").ok().flatten().as_deref() == Some(wanted.as_str())
            })
            .map(|node| NodeHandle::new(FrameId::TOP, node))
            .collect()
    }

    pub fn window_listener_count(&self, event_type: &str) -> usize {
        self.inner
            .frames
            .borrow()
            .get(FrameId::TOP)
            .map(|state| state.events.count(event_type))
            .unwrap_or(0)
    }

    pub fn dispatch_window_event(&self, event_type: &str) -> Result<usize> {
        self.dispatch_event(FrameId::TOP, EventTarget::Window, event_type)
    }

    /// Fire a plain `{type}` event at a frame's window or document.
    pub(crate) fn dispatch_event(
        &self,
        frame: FrameId,
        target: EventTarget,
        event_type: &str,
    ) -> Result<usize> {
        let callbacks = {
            let frames = self.inner.frames.borrow();
            let state = frames.frame(frame)?;
            match target {
                EventTarget::Window => state.events.callbacks(event_type),
                EventTarget::Document => state.document_events.callbacks(event_type),
            }
        };
        let realm = self.inner.realm(frame)?;
        let invoked = self.inner.engine.with_realm(&realm, |ctx| {
            let event = Object::new(ctx.clone())?;
            event.set("type", event_type)?;
            event.set("defaultPrevented", false)?;
            invoke_listeners(&ctx, event_type, callbacks, &event)
        })?;
        self.inner.engine.drain_jobs()?;
        Ok(invoked)
    }

    pub(crate) fn fetch(&self, url: &Url) -> FetchFuture {
        let credentials = Credentials::for_url(
            url,
            &self.inner.base_url,
            &self.inner.config.credential_hosts,
        );
        tracing::debug!(target: "fetch", %url, ?credentials, "requesting");
        self.inner.fetcher.fetch(FetchRequest {
            url: url.clone(),
            credentials,
        })
    }

    /// Append a `<script src>` to the host `<head>`.
    pub(crate) fn append_script_tag(&self, url: &Url, uuid: Option<&str>) -> Result<NodeHandle> {
        let head = self.head()?;
        let mut frames = self.inner.frames.borrow_mut();
        let script = frames.create_element(FrameId::TOP, "script")?;
        frames.set_attribute(script, "src", url.as_str())?;
        frames.set_attribute(script, "charset", "utf-8")?;
        frames.set_attribute(script, "nonce", "")?;
        frames.set_attribute(script, "data-from", "enclave")?;
        if let Some(uuid) = uuid {
            frames.set_attribute(script, "data-uuid", uuid)?;
        }
        frames.append_child(head, script)?;
        Ok(script)
    }

    /// Evaluate `source` in the host realm as the body of `script`, with
    /// `document.currentScript` pointing at it. A throwing body is logged;
    /// like a browser, the script still counts as loaded.
    pub(crate) fn run_script_tag(&self, script: NodeHandle, source: &str, url: &str) -> Result<()> {
        let code = with_source_url(source, url);
        let thrown = self.inner.engine.with_context(|ctx| {
            let document: Object = ctx.globals().get("document")?;
            document.set("currentScript", element(&ctx, script)?)?;
            let outcome = ctx.eval::<(), _>(code);
            document.set("currentScript", Value::new_null(ctx.clone()))?;
            match outcome {
                Ok(()) => Ok(None),
                Err(rquickjs::Error::Exception) => Ok(Some(
                    capture_exception_message(&ctx).unwrap_or_else(|| "script threw".to_string()),
                )),
                Err(err) => Err(err),
            }
        })?;
        if let Some(message) = thrown {
            tracing::error!(target: "loader", url, error = %message, "script threw during evaluation");
        }
        self.inner.engine.drain_jobs()?;
        Ok(())
    }

    /// Create the `<iframe>` standing for an isolated frame in the host body.
    pub(crate) fn append_frame_element(&self, url: &Url, id: Option<&str>) -> Result<NodeHandle> {
        let body = self.body()?;
        let mut frames = self.inner.frames.borrow_mut();
        let iframe = frames.create_element(FrameId::TOP, "iframe")?;
        frames.set_attribute(iframe, "src", url.as_str())?;
        frames.set_attribute(iframe, "style", &self.inner.config.frame_style)?;
        if let Some(id) = id {
            frames.set_attribute(iframe, "data-id", id)?;
        }
        frames.append_child(body, iframe)?;
        Ok(iframe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::StaticFetcher;

    fn page() -> HostPage {
        HostPage::new(LoaderConfig::default(), Rc::new(StaticFetcher::new())).expect("host page")
    }

    #[test]
    fn global_names_must_be_identifiers() {
        assert!(is_valid_global_name("appConfig"));
        assert!(is_valid_global_name("$store"));
        assert!(!is_valid_global_name("9lives"));
        assert!(!is_valid_global_name("a-b"));
        assert!(!is_valid_global_name("window"));
        for word in ["default", "class", "if", "let", "new", "eval", "arguments"] {
            assert!(!is_valid_global_name(word), "{word}");
        }
    }

    #[test]
    fn reserved_words_are_refused_and_leave_the_bag_untouched() {
        let host = page();
        assert!(host.inject_global("default", &serde_json::json!(1)).is_err());
        assert!(host.injected_names().is_empty());
        let kind: String = host
            .eval_with("typeof __ENCLAVE_GLOBAL_VARS__['default']", "bag.js")
            .expect("bag lookup");
        assert_eq!(kind, "undefined");
    }

    #[test]
    fn injected_globals_are_mirrored_in_the_host_bag() {
        let host = page();
        host.inject_global("appConfig", &serde_json::json!({"region": "eu"}))
            .expect("inject");
        let region: String = host
            .eval_with("__ENCLAVE_GLOBAL_VARS__.appConfig.region", "bag.js")
            .expect("bag lookup");
        assert_eq!(region, "eu");

        assert!(host.remove_global("appConfig"));
        assert!(!host.remove_global("appConfig"));
        let kind: String = host
            .eval_with("typeof __ENCLAVE_GLOBAL_VARS__.appConfig", "bag.js")
            .expect("bag lookup");
        assert_eq!(kind, "undefined");
    }

    #[test]
    fn script_tags_carry_loader_attributes() {
        let host = page();
        let url = Url::parse("http://localhost/a.js").unwrap();
        let script = host.append_script_tag(&url, Some("u-1")).expect("append");
        assert_eq!(host.script_tags("/a.js"), vec![script]);
        assert_eq!(
            host.get_attribute(script, "data-from").unwrap().as_deref(),
            Some("enclave")
        );
        assert_eq!(host.parent_of(script).unwrap(), Some(host.head().unwrap()));
    }

    #[test]
    fn current_script_is_set_only_while_running() {
        let host = page();
        let url = Url::parse("http://localhost/cs.js").unwrap();
        let script = host.append_script_tag(&url, Some("u-2")).expect("append");
        host.run_script_tag(
            script,
            "globalThis.__seen = document.currentScript.getAttribute('data-uuid');",
            url.as_str(),
        )
        .expect("run");
        let seen: String = host.eval_with("globalThis.__seen", "check.js").unwrap();
        assert_eq!(seen, "u-2");
        let after: bool = host
            .eval_with("document.currentScript === null", "check.js")
            .unwrap();
        assert!(after);
    }

    #[test]
    fn throwing_scripts_are_logged_not_returned() {
        let host = page();
        let url = Url::parse("http://localhost/bad.js").unwrap();
        let script = host.append_script_tag(&url, None).expect("append");
        host.run_script_tag(script, "throw new Error('bad')", url.as_str())
            .expect("throw is swallowed");
    }

    #[test]
    fn window_events_reach_host_listeners() {
        let host = page();
        host.eval(
            "globalThis.__hits = 0; window.addEventListener('resize', () => { globalThis.__hits += 1; });",
            "listen.js",
        )
        .unwrap();
        assert_eq!(host.window_listener_count("resize"), 1);
        assert_eq!(host.dispatch_window_event("resize").unwrap(), 1);
        let hits: i32 = host.eval_with("globalThis.__hits", "hits.js").unwrap();
        assert_eq!(hits, 1);
    }
}
