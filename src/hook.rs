//! The global hook a bundle calls to hand its factory to the loader.
//!
//! Every realm gets a dispatcher function under the configured hook name.
//! When a bundle calls `hook(id, resolver, script?)`, the calling frame's
//! handler chain runs newest first; if every handler declines, the parent
//! frame's chain is tried, and finally the resolver runs with nothing but the
//! calling realm's ambient globals.

use std::rc::{Rc, Weak};

use rquickjs::function::{Opt, This};
use rquickjs::{Ctx, Function, Object, Persistent, Value};

use crate::frame::FrameId;
use crate::host::HostInner;
use crate::js::runtime::describe_value;

const DISPATCHER_MARK: &str = "__enclave_dispatcher";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Handled,
    Declined,
}

/// One invocation of the global hook.
pub struct HookCall<'js> {
    /// Frame whose realm made the call.
    pub frame: FrameId,
    pub id: String,
    pub resolver: Function<'js>,
    pub script: Option<Object<'js>>,
    /// `data-uuid` of the originating script, when it has one.
    pub uuid: Option<String>,
}

pub trait HookHandler {
    fn handle<'js>(&self, ctx: &Ctx<'js>, call: &HookCall<'js>) -> rquickjs::Result<HookOutcome>;
}

/// A JS function that occupied the global hook slot before the host claimed
/// it. It sits at the bottom of the chain and handles everything it sees.
pub struct PreviousHook {
    function: Persistent<Function<'static>>,
}

impl PreviousHook {
    pub fn new(function: Persistent<Function<'static>>) -> Self {
        Self { function }
    }
}

impl HookHandler for PreviousHook {
    fn handle<'js>(&self, ctx: &Ctx<'js>, call: &HookCall<'js>) -> rquickjs::Result<HookOutcome> {
        let function = self.function.clone().restore(ctx)?;
        let script = match &call.script {
            Some(script) => script.clone().into_value(),
            None => Value::new_undefined(ctx.clone()),
        };
        function.call::<_, ()>((call.id.clone(), call.resolver.clone(), script))?;
        Ok(HookOutcome::Handled)
    }
}

/// Put the dispatcher for `frame` into the global hook slot of `ctx`'s realm.
/// Returns the foreign function that was there, if any.
pub(crate) fn install_dispatcher<'js>(
    ctx: &Ctx<'js>,
    host: Weak<HostInner>,
    frame: FrameId,
    hook_name: &str,
) -> rquickjs::Result<Option<Persistent<Function<'static>>>> {
    let globals = ctx.globals();
    let existing: Value<'js> = globals.get(hook_name)?;
    let mut previous = None;
    if let Some(existing) = existing.as_function() {
        let ours = existing
            .get::<_, Option<bool>>(DISPATCHER_MARK)?
            .unwrap_or(false);
        if ours {
            return Ok(None);
        }
        previous = Some(Persistent::save(ctx, existing.clone()));
    }

    let dispatcher = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>,
              id: Opt<Value<'js>>,
              resolver: Opt<Value<'js>>,
              script: Opt<Value<'js>>|
              -> rquickjs::Result<()> {
            let Some(host) = host.upgrade() else {
                return Ok(());
            };
            let id = id
                .0
                .and_then(|id| id.as_string().and_then(|id| id.to_string().ok()))
                .filter(|id| !id.is_empty());
            let resolver = resolver.0.and_then(|resolver| resolver.into_function());
            let (Some(id), Some(resolver)) = (id, resolver) else {
                tracing::debug!(target: "hook", %frame, "ignoring hook call without id or resolver");
                return Ok(());
            };
            let script = script.0.and_then(|script| script.into_object());
            dispatch(&ctx, &host, frame, id, resolver, script)
        },
    )?
    .with_name(hook_name)?;
    dispatcher.set(DISPATCHER_MARK, true)?;
    globals.set(hook_name, dispatcher)?;
    Ok(previous)
}

/// `script.getAttribute('data-uuid')`, tolerating objects without it.
fn read_uuid<'js>(script: &Object<'js>) -> rquickjs::Result<Option<String>> {
    let getter: Value<'js> = script.get("getAttribute")?;
    let Some(getter) = getter.as_function() else {
        return Ok(None);
    };
    let uuid: Value<'js> = getter.call((This(script.clone()), "data-uuid"))?;
    Ok(uuid.as_string().and_then(|uuid| uuid.to_string().ok()))
}

pub(crate) fn dispatch<'js>(
    ctx: &Ctx<'js>,
    host: &Rc<HostInner>,
    frame: FrameId,
    id: String,
    resolver: Function<'js>,
    script: Option<Object<'js>>,
) -> rquickjs::Result<()> {
    let uuid = match &script {
        Some(script) => read_uuid(script)?,
        None => None,
    };
    let call = HookCall {
        frame,
        id,
        resolver,
        script,
        uuid,
    };

    let mut current = Some(frame);
    while let Some(owner) = current {
        let chain = host.hooks.borrow().get(&owner).cloned().unwrap_or_default();
        for handler in chain.iter().rev() {
            if handler.handle(ctx, &call)? == HookOutcome::Handled {
                tracing::trace!(target: "hook", id = %call.id, %owner, "hook handled");
                return Ok(());
            }
        }
        current = host.frames.borrow().parent_of(owner);
    }

    fallback(ctx, host, &call)
}

/// Run the resolver with only the calling realm's ambient globals.
fn fallback<'js>(ctx: &Ctx<'js>, host: &HostInner, call: &HookCall<'js>) -> rquickjs::Result<()> {
    tracing::debug!(target: "hook", id = %call.id, frame = %call.frame, "no record for bundle; resolving with ambient globals");
    let snapshot = host.snapshot(ctx, call.frame)?;
    let undefined = Value::new_undefined(ctx.clone());
    let outcome = call.resolver.call::<_, ()>((
        undefined.clone(),
        undefined.clone(),
        undefined,
        snapshot,
    ));
    match outcome {
        Ok(()) => Ok(()),
        Err(rquickjs::Error::Exception) => {
            let exception = ctx.catch();
            tracing::error!(
                target: "hook",
                id = %call.id,
                error = %describe_value(&exception),
                "fallback resolver threw"
            );
            Err(ctx.throw(exception))
        }
        Err(err) => Err(err),
    }
}
