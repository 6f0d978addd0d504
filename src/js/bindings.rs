use std::rc::{Rc, Weak};

use rquickjs::{Ctx, Exception, Function, Object, Persistent};

use crate::context::run_scoped;
use crate::frame::{FrameId, NodeHandle, PendingScript, RealmHandles};
use crate::host::HostInner;
use crate::js::events::{invoke_listeners, BindingTarget, ListenerEntry, ListenerId, VirtualListener};

fn host_or_throw(ctx: &Ctx<'_>, host: &Weak<HostInner>) -> rquickjs::Result<Rc<HostInner>> {
    host.upgrade()
        .ok_or_else(|| Exception::throw_message(ctx, "host page was dropped"))
}

fn handle_or_throw(ctx: &Ctx<'_>, raw: &str) -> rquickjs::Result<NodeHandle> {
    NodeHandle::parse(raw)
        .ok_or_else(|| Exception::throw_message(ctx, &format!("invalid node handle `{raw}`")))
}

fn dom_error<T>(ctx: &Ctx<'_>, err: anyhow::Error) -> rquickjs::Result<T> {
    tracing::debug!(target: "sandbox", "DOM operation failed: {err}");
    Err(Exception::throw_message(ctx, &format!("DOM operation failed: {err}")))
}

/// Install the native helpers for `frame` into the realm of `ctx`, run the
/// bootstrap, and return the objects it created.
pub(crate) fn install<'js>(
    ctx: &Ctx<'js>,
    host: Weak<HostInner>,
    frame: FrameId,
) -> rquickjs::Result<RealmHandles> {
    let global = ctx.globals();

    // Document structure
    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, tag: String| -> rquickjs::Result<String> {
                let host = host_or_throw(&ctx, &host)?;
                let created = host.frames.borrow_mut().create_element(frame, &tag);
                match created {
                    Ok(handle) => Ok(handle.to_string()),
                    Err(err) => dom_error(&ctx, err),
                }
            },
        )?
        .with_name("__enclave_create_element")?;
        global.set("__enclave_create_element", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, part: String| -> rquickjs::Result<Option<String>> {
                let host = host_or_throw(&ctx, &host)?;
                let mut frames = host.frames.borrow_mut();
                let tree = match frames.tree(frame) {
                    Ok(tree) => tree,
                    Err(err) => return dom_error(&ctx, err),
                };
                let node = match part.as_str() {
                    "head" => tree.head(),
                    "body" => tree.body(),
                    "documentElement" => tree.document_element(),
                    _ => None,
                };
                Ok(node.map(|node| NodeHandle::new(frame, node).to_string()))
            },
        )?
        .with_name("__enclave_document_part")?;
        global.set("__enclave_document_part", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, id: String| -> rquickjs::Result<Option<String>> {
                let host = host_or_throw(&ctx, &host)?;
                let mut frames = host.frames.borrow_mut();
                match frames.tree(frame) {
                    Ok(tree) => Ok(tree
                        .element_by_id(&id)
                        .map(|node| NodeHandle::new(frame, node).to_string())),
                    Err(err) => dom_error(&ctx, err),
                }
            },
        )?
        .with_name("__enclave_element_by_id")?;
        global.set("__enclave_element_by_id", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, selector: String| -> rquickjs::Result<Vec<String>> {
                let host = host_or_throw(&ctx, &host)?;
                let found = host
                    .frames
                    .borrow_mut()
                    .tree(frame)
                    .and_then(|tree| Ok(tree.query_all(&selector)?));
                match found {
                    Ok(nodes) => Ok(nodes
                        .into_iter()
                        .map(|node| NodeHandle::new(frame, node).to_string())
                        .collect()),
                    Err(err) => dom_error(&ctx, err),
                }
            },
        )?
        .with_name("__enclave_query_all")?;
        global.set("__enclave_query_all", func)?;
    }

    // Element accessors
    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, handle: String, name: String| -> rquickjs::Result<Option<String>> {
                let host = host_or_throw(&ctx, &host)?;
                let handle = handle_or_throw(&ctx, &handle)?;
                let value = host.frames.borrow_mut().get_attribute(handle, &name);
                match value {
                    Ok(value) => Ok(value),
                    Err(err) => dom_error(&ctx, err),
                }
            },
        )?
        .with_name("__enclave_get_attribute")?;
        global.set("__enclave_get_attribute", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  handle: String,
                  name: String,
                  value: String|
                  -> rquickjs::Result<()> {
                let host = host_or_throw(&ctx, &host)?;
                let handle = handle_or_throw(&ctx, &handle)?;
                let result = host.frames.borrow_mut().set_attribute(handle, &name, &value);
                match result {
                    Ok(()) => Ok(()),
                    Err(err) => dom_error(&ctx, err),
                }
            },
        )?
        .with_name("__enclave_set_attribute")?;
        global.set("__enclave_set_attribute", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, handle: String, name: String| -> rquickjs::Result<()> {
                let host = host_or_throw(&ctx, &host)?;
                let handle = handle_or_throw(&ctx, &handle)?;
                let result = host.frames.borrow_mut().remove_attribute(handle, &name);
                match result {
                    Ok(()) => Ok(()),
                    Err(err) => dom_error(&ctx, err),
                }
            },
        )?
        .with_name("__enclave_remove_attribute")?;
        global.set("__enclave_remove_attribute", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  parent: String,
                  child: String,
                  start: bool|
                  -> rquickjs::Result<String> {
                let host = host_or_throw(&ctx, &host)?;
                let parent = handle_or_throw(&ctx, &parent)?;
                let child = handle_or_throw(&ctx, &child)?;
                let mut frames = host.frames.borrow_mut();
                if let Err(err) = frames.append_child(parent, child) {
                    drop(frames);
                    return dom_error(&ctx, err);
                }
                if frame.is_top() || !start {
                    return Ok(String::new());
                }

                // Scripts the sandbox attaches run inside the sandbox: inline
                // text right away, `src` scripts once the context fetches them.
                let is_script = frames
                    .tag_name(child)
                    .map(|tag| tag == "SCRIPT")
                    .unwrap_or(false);
                if !is_script || !frames.is_connected(child).unwrap_or(false) {
                    return Ok(String::new());
                }
                match frames.get_attribute(child, "src").ok().flatten() {
                    Some(url) => {
                        if let Some(state) = frames.get_mut(frame) {
                            tracing::debug!(target: "sandbox", %frame, url = %url, "queued sandboxed script");
                            state.pending_scripts.push_back(PendingScript { url, script: child });
                        }
                        Ok("queued".to_string())
                    }
                    None => Ok("inline".to_string()),
                }
            },
        )?
        .with_name("__enclave_append_child")?;
        global.set("__enclave_append_child", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, handle: String| -> rquickjs::Result<()> {
                let host = host_or_throw(&ctx, &host)?;
                let script = handle_or_throw(&ctx, &handle)?;
                let (code, url) = {
                    let mut frames = host.frames.borrow_mut();
                    let code = match frames.text_content(script) {
                        Ok(code) => code,
                        Err(err) => {
                            drop(frames);
                            return dom_error(&ctx, err);
                        }
                    };
                    let url = frames
                        .get(frame)
                        .and_then(|state| state.location.part("href"))
                        .unwrap_or_default();
                    (code, url)
                };
                if code.trim().is_empty() {
                    return Ok(());
                }
                if let Some(message) = run_scoped(&ctx, &host, frame, &code, &url, script)? {
                    tracing::error!(target: "sandbox", %frame, error = %message, "inline script failed");
                }
                Ok(())
            },
        )?
        .with_name("__enclave_run_inline")?;
        global.set("__enclave_run_inline", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, parent: String, child: String| -> rquickjs::Result<()> {
                let host = host_or_throw(&ctx, &host)?;
                let parent = handle_or_throw(&ctx, &parent)?;
                let child = handle_or_throw(&ctx, &child)?;
                let result = host.frames.borrow_mut().remove_child(parent, child);
                match result {
                    Ok(()) => Ok(()),
                    Err(err) => dom_error(&ctx, err),
                }
            },
        )?
        .with_name("__enclave_remove_child")?;
        global.set("__enclave_remove_child", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, handle: String| -> rquickjs::Result<Option<String>> {
                let host = host_or_throw(&ctx, &host)?;
                let handle = handle_or_throw(&ctx, &handle)?;
                let parent = host.frames.borrow_mut().parent(handle);
                match parent {
                    Ok(parent) => Ok(parent.map(|parent| parent.to_string())),
                    Err(err) => dom_error(&ctx, err),
                }
            },
        )?
        .with_name("__enclave_parent")?;
        global.set("__enclave_parent", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, handle: String| -> rquickjs::Result<String> {
                let host = host_or_throw(&ctx, &host)?;
                let handle = handle_or_throw(&ctx, &handle)?;
                let tag = host.frames.borrow_mut().tag_name(handle);
                match tag {
                    Ok(tag) => Ok(tag),
                    Err(err) => dom_error(&ctx, err),
                }
            },
        )?
        .with_name("__enclave_tag_name")?;
        global.set("__enclave_tag_name", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, handle: String| -> rquickjs::Result<String> {
                let host = host_or_throw(&ctx, &host)?;
                let handle = handle_or_throw(&ctx, &handle)?;
                let text = host.frames.borrow_mut().text_content(handle);
                match text {
                    Ok(text) => Ok(text),
                    Err(err) => dom_error(&ctx, err),
                }
            },
        )?
        .with_name("__enclave_text")?;
        global.set("__enclave_text", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, handle: String, text: String| -> rquickjs::Result<()> {
                let host = host_or_throw(&ctx, &host)?;
                let handle = handle_or_throw(&ctx, &handle)?;
                let result = host.frames.borrow_mut().set_text_content(handle, &text);
                match result {
                    Ok(()) => Ok(()),
                    Err(err) => dom_error(&ctx, err),
                }
            },
        )?
        .with_name("__enclave_set_text")?;
        global.set("__enclave_set_text", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, handle: String| -> rquickjs::Result<String> {
                let host = host_or_throw(&ctx, &host)?;
                let handle = handle_or_throw(&ctx, &handle)?;
                let html = host.frames.borrow_mut().inner_html(handle);
                match html {
                    Ok(html) => Ok(html),
                    Err(err) => dom_error(&ctx, err),
                }
            },
        )?
        .with_name("__enclave_inner_html")?;
        global.set("__enclave_inner_html", func)?;
    }

    // Location and history
    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, part: String| -> rquickjs::Result<Option<String>> {
                let host = host_or_throw(&ctx, &host)?;
                let frames = host.frames.borrow();
                match frames.frame(frame) {
                    Ok(state) => Ok(state.location.part(&part)),
                    Err(err) => dom_error(&ctx, err),
                }
            },
        )?
        .with_name("__enclave_location_part")?;
        global.set("__enclave_location_part", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, target: String, replace: bool| -> rquickjs::Result<()> {
                let host = host_or_throw(&ctx, &host)?;
                let mut frames = host.frames.borrow_mut();
                let state = match frames.frame_mut(frame) {
                    Ok(state) => state,
                    Err(err) => return dom_error(&ctx, err),
                };
                let url = match state.location.resolve(&target) {
                    Ok(url) => url,
                    Err(err) => {
                        return Err(Exception::throw_message(
                            &ctx,
                            &format!("invalid URL `{target}`: {err}"),
                        ))
                    }
                };
                tracing::debug!(target: "sandbox", %frame, url = %url, replace, "location change");
                state.push_history(url, None, replace);
                Ok(())
            },
        )?
        .with_name("__enclave_location_set")?;
        global.set("__enclave_location_set", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  state_json: Option<String>,
                  target: Option<String>,
                  replace: bool|
                  -> rquickjs::Result<()> {
                let host = host_or_throw(&ctx, &host)?;
                let mut frames = host.frames.borrow_mut();
                let state = match frames.frame_mut(frame) {
                    Ok(state) => state,
                    Err(err) => return dom_error(&ctx, err),
                };
                let url = match target {
                    Some(target) => match state.location.resolve(&target) {
                        Ok(url) => url,
                        Err(err) => {
                            return Err(Exception::throw_message(
                                &ctx,
                                &format!("invalid history URL `{target}`: {err}"),
                            ))
                        }
                    },
                    None => state.location.url().clone(),
                };
                state.push_history(url, state_json, replace);
                Ok(())
            },
        )?
        .with_name("__enclave_history_push")?;
        global.set("__enclave_history_push", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, delta: f64| -> rquickjs::Result<bool> {
                let host = host_or_throw(&ctx, &host)?;
                let mut frames = host.frames.borrow_mut();
                match frames.frame_mut(frame) {
                    Ok(state) => Ok(state.traverse_history(delta as i32)),
                    Err(err) => dom_error(&ctx, err),
                }
            },
        )?
        .with_name("__enclave_history_go")?;
        global.set("__enclave_history_go", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>| -> rquickjs::Result<u32> {
                let host = host_or_throw(&ctx, &host)?;
                let frames = host.frames.borrow();
                match frames.frame(frame) {
                    Ok(state) => Ok(state.history.len() as u32),
                    Err(err) => dom_error(&ctx, err),
                }
            },
        )?
        .with_name("__enclave_history_length")?;
        global.set("__enclave_history_length", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>| -> rquickjs::Result<Option<String>> {
                let host = host_or_throw(&ctx, &host)?;
                let frames = host.frames.borrow();
                match frames.frame(frame) {
                    Ok(state) => Ok(state.history.current().state.clone()),
                    Err(err) => dom_error(&ctx, err),
                }
            },
        )?
        .with_name("__enclave_history_state")?;
        global.set("__enclave_history_state", func)?;
    }

    // Window listeners. Isolated frames bind ambient event types on the host
    // window and everything else on their own window.
    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  event_type: String,
                  local: u32,
                  callback: Function<'js>,
                  capture: bool|
                  -> rquickjs::Result<()> {
                let host = host_or_throw(&ctx, &host)?;
                let id = ListenerId { frame, local };
                let entry = ListenerEntry {
                    id,
                    capture,
                    callback: Persistent::save(&ctx, callback),
                };
                let target = if !frame.is_top() && host.config.is_ambient_event(&event_type) {
                    BindingTarget::HostWindow
                } else {
                    BindingTarget::Frame
                };
                let registry_frame = match target {
                    BindingTarget::HostWindow => FrameId::TOP,
                    BindingTarget::Frame => frame,
                };

                let mut frames = host.frames.borrow_mut();
                match frames.frame_mut(registry_frame) {
                    Ok(state) => {
                        state.events.add(&event_type, entry);
                    }
                    Err(err) => {
                        drop(frames);
                        return dom_error(&ctx, err);
                    }
                }
                if !frame.is_top() {
                    if let Some(state) = frames.get_mut(frame) {
                        state.listener_map.record(
                            &event_type,
                            VirtualListener {
                                id,
                                capture,
                                target,
                            },
                        );
                    }
                }
                tracing::trace!(target: "sandbox", %frame, event_type, ?target, "listener added");
                Ok(())
            },
        )?
        .with_name("__enclave_listen")?;
        global.set("__enclave_listen", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, event_type: String, local: u32, capture: bool| -> rquickjs::Result<bool> {
                let host = host_or_throw(&ctx, &host)?;
                let id = ListenerId { frame, local };
                let mut frames = host.frames.borrow_mut();
                let target = if frame.is_top() {
                    BindingTarget::Frame
                } else {
                    frames
                        .get_mut(frame)
                        .and_then(|state| state.listener_map.take(&event_type, id, capture))
                        .map(|listener| listener.target)
                        .unwrap_or(BindingTarget::Frame)
                };
                let registry_frame = match target {
                    BindingTarget::HostWindow => FrameId::TOP,
                    BindingTarget::Frame => frame,
                };
                let removed = frames
                    .get_mut(registry_frame)
                    .map(|state| state.events.remove(&event_type, id, capture))
                    .unwrap_or(false);
                Ok(removed)
            },
        )?
        .with_name("__enclave_unlisten")?;
        global.set("__enclave_unlisten", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, event_type: String, event: Object<'js>| -> rquickjs::Result<u32> {
                let host = host_or_throw(&ctx, &host)?;
                let callbacks = host
                    .frames
                    .borrow()
                    .get(frame)
                    .map(|state| state.events.callbacks(&event_type))
                    .unwrap_or_default();
                let invoked = invoke_listeners(&ctx, &event_type, callbacks, &event)?;
                Ok(invoked as u32)
            },
        )?
        .with_name("__enclave_dispatch")?;
        global.set("__enclave_dispatch", func)?;
    }

    // Document listeners
    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  event_type: String,
                  local: u32,
                  callback: Function<'js>,
                  capture: bool|
                  -> rquickjs::Result<()> {
                let host = host_or_throw(&ctx, &host)?;
                let entry = ListenerEntry {
                    id: ListenerId { frame, local },
                    capture,
                    callback: Persistent::save(&ctx, callback),
                };
                let mut frames = host.frames.borrow_mut();
                match frames.frame_mut(frame) {
                    Ok(state) => {
                        state.document_events.add(&event_type, entry);
                        Ok(())
                    }
                    Err(err) => {
                        drop(frames);
                        dom_error(&ctx, err)
                    }
                }
            },
        )?
        .with_name("__enclave_document_listen")?;
        global.set("__enclave_document_listen", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, event_type: String, local: u32, capture: bool| -> rquickjs::Result<bool> {
                let host = host_or_throw(&ctx, &host)?;
                let id = ListenerId { frame, local };
                let removed = host
                    .frames
                    .borrow_mut()
                    .get_mut(frame)
                    .map(|state| state.document_events.remove(&event_type, id, capture))
                    .unwrap_or(false);
                Ok(removed)
            },
        )?
        .with_name("__enclave_document_unlisten")?;
        global.set("__enclave_document_unlisten", func)?;
    }

    {
        let host = host.clone();
        let func = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, event_type: String, event: Object<'js>| -> rquickjs::Result<u32> {
                let host = host_or_throw(&ctx, &host)?;
                let callbacks = host
                    .frames
                    .borrow()
                    .get(frame)
                    .map(|state| state.document_events.callbacks(&event_type))
                    .unwrap_or_default();
                let invoked = invoke_listeners(&ctx, &event_type, callbacks, &event)?;
                Ok(invoked as u32)
            },
        )?
        .with_name("__enclave_document_dispatch")?;
        global.set("__enclave_document_dispatch", func)?;
    }

    ctx.eval::<(), _>(FRAME_BOOTSTRAP.as_bytes())?;

    let document: Object = global.get("document")?;
    let location: Object = global.get("location")?;
    let history: Object = global.get("history")?;
    Ok(RealmHandles {
        window: Persistent::save(ctx, global),
        document: Persistent::save(ctx, document),
        location: Persistent::save(ctx, location),
        history: Persistent::save(ctx, history),
    })
}

const FRAME_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    // Wrappers are cached weakly so identity holds while script keeps a
    // reference. Scripts waiting for their load event stay pinned.
    const weak = typeof WeakRef === 'function' && typeof FinalizationRegistry === 'function';
    const elements = new Map();
    const pinned = new Map();
    const released = weak
        ? new FinalizationRegistry((handle) => {
            const entry = elements.get(handle);
            if (entry && entry.deref() === undefined) {
                elements.delete(handle);
            }
        })
        : null;
    const listenerIds = new WeakMap();
    let nextListenerId = 1;

    const listenerId = (fn) => {
        let id = listenerIds.get(fn);
        if (id === undefined) {
            id = nextListenerId++;
            listenerIds.set(fn, id);
        }
        return id;
    };
    const captureFlag = (options) =>
        typeof options === 'boolean' ? options : !!(options && options.capture);
    const orNull = (value) => (value === undefined || value === null ? null : value);

    class Element {
        constructor(handle) {
            Object.defineProperty(this, '__handle', { value: handle });
            Object.defineProperty(this, '__listeners', { value: new Map() });
            Object.defineProperty(this, '__started', { value: false, writable: true });
            this.onload = null;
            this.onerror = null;
        }
        get tagName() { return __enclave_tag_name(this.__handle); }
        get nodeName() { return this.tagName; }
        get parentNode() { return wrap(__enclave_parent(this.__handle)); }
        get id() { return this.getAttribute('id') || ''; }
        set id(value) { this.setAttribute('id', value); }
        get src() { return this.getAttribute('src') || ''; }
        set src(value) { this.setAttribute('src', value); }
        get textContent() { return __enclave_text(this.__handle); }
        set textContent(value) { __enclave_set_text(this.__handle, String(value)); }
        get text() { return this.textContent; }
        set text(value) { this.textContent = value; }
        get innerText() { return this.textContent; }
        set innerText(value) { this.textContent = value; }
        get innerHTML() { return __enclave_inner_html(this.__handle); }
        set innerHTML(value) { this.textContent = value; }
        getAttribute(name) { return orNull(__enclave_get_attribute(this.__handle, String(name))); }
        setAttribute(name, value) { __enclave_set_attribute(this.__handle, String(name), String(value)); }
        removeAttribute(name) { __enclave_remove_attribute(this.__handle, String(name)); }
        hasAttribute(name) { return this.getAttribute(name) !== null; }
        appendChild(child) {
            remember(child);
            const outcome = __enclave_append_child(this.__handle, child.__handle, !child.__started);
            if (outcome === 'queued') {
                child.__started = true;
                pinned.set(child.__handle, child);
            } else if (outcome === 'inline') {
                child.__started = true;
                __enclave_run_inline(child.__handle);
            }
            return child;
        }
        removeChild(child) {
            __enclave_remove_child(this.__handle, child.__handle);
            if (!weak) {
                elements.delete(child.__handle);
            }
            return child;
        }
        remove() {
            const parent = this.parentNode;
            if (parent) {
                parent.removeChild(this);
            }
        }
        addEventListener(type, listener) {
            if (typeof listener !== 'function') {
                return;
            }
            const key = String(type);
            let listeners = this.__listeners.get(key);
            if (!listeners) {
                listeners = [];
                this.__listeners.set(key, listeners);
            }
            if (!listeners.includes(listener)) {
                listeners.push(listener);
            }
        }
        removeEventListener(type, listener) {
            const listeners = this.__listeners.get(String(type));
            const index = listeners ? listeners.indexOf(listener) : -1;
            if (index >= 0) {
                listeners.splice(index, 1);
            }
        }
        dispatchEvent(event) {
            const listeners = (this.__listeners.get(String(event.type)) || []).slice();
            const handler = this['on' + event.type];
            if (typeof handler === 'function') {
                listeners.unshift(handler);
            }
            for (const listener of listeners) {
                try {
                    listener.call(this, event);
                } catch (e) {
                    console.error(e);
                }
            }
            return !event.defaultPrevented;
        }
    }

    const cached = (handle) => {
        const entry = elements.get(handle);
        if (entry === undefined) {
            return undefined;
        }
        return weak ? entry.deref() : entry;
    };
    const remember = (element) => {
        if (cached(element.__handle) === element) {
            return;
        }
        elements.set(element.__handle, weak ? new WeakRef(element) : element);
        if (released) {
            released.register(element, element.__handle);
        }
    };
    const wrap = (handle) => {
        if (handle === undefined || handle === null) {
            return null;
        }
        let element = pinned.get(handle) || cached(handle);
        if (!element) {
            element = new Element(handle);
            remember(element);
        }
        return element;
    };
    global.__enclave_element = wrap;
    global.__enclave_script_event = (handle, type) => {
        const element = pinned.get(handle) || cached(handle);
        pinned.delete(handle);
        if (!element) {
            return false;
        }
        element.dispatchEvent({
            type,
            target: element,
            currentTarget: element,
            defaultPrevented: false,
            preventDefault() { this.defaultPrevented = true; },
        });
        return true;
    };

    const document = {
        currentScript: null,
        get documentElement() { return wrap(__enclave_document_part('documentElement')); },
        get head() { return wrap(__enclave_document_part('head')); },
        get body() { return wrap(__enclave_document_part('body')); },
        createElement: (tag) => wrap(__enclave_create_element(String(tag))),
        getElementById: (id) => wrap(__enclave_element_by_id(String(id))),
        querySelectorAll: (selector) => __enclave_query_all(String(selector)).map(wrap),
        querySelector: (selector) => {
            const found = __enclave_query_all(String(selector));
            return found.length > 0 ? wrap(found[0]) : null;
        },
        getElementsByTagName: (tag) => __enclave_query_all(String(tag)).map(wrap),
        addEventListener: (type, listener, options) => {
            if (typeof listener !== 'function') {
                return;
            }
            __enclave_document_listen(String(type), listenerId(listener), listener, captureFlag(options));
        },
        removeEventListener: (type, listener, options) => {
            const id = typeof listener === 'function' ? listenerIds.get(listener) : undefined;
            if (id !== undefined) {
                __enclave_document_unlisten(String(type), id, captureFlag(options));
            }
        },
        dispatchEvent: (event) => {
            __enclave_document_dispatch(String(event.type), event);
            return !event.defaultPrevented;
        },
    };

    const location = {
        assign: (url) => __enclave_location_set(String(url), false),
        replace: (url) => __enclave_location_set(String(url), true),
        reload: () => console.debug('location.reload() is ignored'),
        toString: () => __enclave_location_part('href'),
    };
    for (const part of ['origin', 'protocol', 'host', 'hostname', 'port', 'pathname', 'search', 'hash']) {
        Object.defineProperty(location, part, {
            get: () => __enclave_location_part(part),
            enumerable: true,
        });
    }
    Object.defineProperty(location, 'href', {
        get: () => __enclave_location_part('href'),
        set: (url) => __enclave_location_set(String(url), false),
        enumerable: true,
    });

    const readState = () => {
        const json = __enclave_history_state();
        return json === undefined || json === null ? null : JSON.parse(json);
    };
    const writeState = (state, url, replace) => {
        const json = JSON.stringify(state === undefined ? null : state);
        __enclave_history_push(json, url === undefined || url === null ? null : String(url), replace);
    };
    const history = {
        get length() { return __enclave_history_length(); },
        get state() { return readState(); },
        pushState: (state, title, url) => writeState(state, url, false),
        replaceState: (state, title, url) => writeState(state, url, true),
        go: (delta) => {
            if (__enclave_history_go(Number(delta) || 0)) {
                global.dispatchEvent({ type: 'popstate', state: readState() });
            }
        },
        back: () => history.go(-1),
        forward: () => history.go(1),
    };

    global.window = global;
    global.self = global;
    global.document = document;
    global.location = location;
    global.history = history;
    global.addEventListener = (type, listener, options) => {
        if (typeof listener !== 'function') {
            return;
        }
        __enclave_listen(String(type), listenerId(listener), listener, captureFlag(options));
    };
    global.removeEventListener = (type, listener, options) => {
        const id = typeof listener === 'function' ? listenerIds.get(listener) : undefined;
        if (id !== undefined) {
            __enclave_unlisten(String(type), id, captureFlag(options));
        }
    };
    global.dispatchEvent = (event) => {
        __enclave_dispatch(String(event.type), event);
        return !event.defaultPrevented;
    };
})();
"#;
