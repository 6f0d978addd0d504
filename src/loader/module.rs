use std::collections::HashMap;
use std::rc::{Rc, Weak};

use anyhow::Result;
use rquickjs::{Ctx, Exception, Function, Object, Persistent, Value};

use crate::frame::FrameId;
use crate::host::HostPage;
use crate::js::convert::{js_to_json, json_to_js};
use crate::js::runtime::capture_exception_message;
use crate::loader::LoaderInner;

/// Handle to a module's exports. Keeps the host page alive.
#[derive(Clone)]
pub struct ModuleExports {
    value: Persistent<Value<'static>>,
    host: HostPage,
}

impl std::fmt::Debug for ModuleExports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleExports").finish_non_exhaustive()
    }
}

impl ModuleExports {
    pub(crate) fn new(value: Persistent<Value<'static>>, host: HostPage) -> Self {
        Self { value, host }
    }

    pub(crate) fn restore<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        self.value.clone().restore(ctx)
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        let value = self.value.clone();
        self.host
            .engine()
            .with_context(|ctx| js_to_json(&value.restore(&ctx)?))
    }

    /// JSON of one exported property.
    pub fn get_json(&self, key: &str) -> Result<serde_json::Value> {
        let value = self.value.clone();
        self.host.engine().with_context(|ctx| {
            let exports = value.restore(&ctx)?;
            match exports.as_object() {
                Some(object) => js_to_json(&object.get::<_, Value>(key)?),
                None => Ok(serde_json::Value::Null),
            }
        })
    }

    /// Call an exported function with JSON arguments.
    pub fn call(&self, name: &str, args: &[serde_json::Value]) -> Result<serde_json::Value> {
        let value = self.value.clone();
        let result = self.host.engine().with_context(|ctx| {
            let exports = value.restore(&ctx)?;
            let Some(object) = exports.as_object() else {
                return Err(Exception::throw_message(&ctx, "exports are not an object"));
            };
            let function: Function = object.get(name)?;
            let mut call_args = rquickjs::function::Args::new(ctx.clone(), args.len());
            call_args.this(object.clone())?;
            for arg in args {
                call_args.push_arg(json_to_js(&ctx, arg)?)?;
            }
            let returned: Value = function.call_arg(call_args)?;
            js_to_json(&returned)
        })?;
        self.host.engine().drain_jobs()?;
        Ok(result)
    }

    /// Whether both handles refer to the same JS value (`Object.is`).
    pub fn same_value(&self, other: &ModuleExports) -> bool {
        let left = self.value.clone();
        let right = other.value.clone();
        self.host
            .engine()
            .with_context(|ctx| {
                let is: Function = ctx.eval("Object.is")?;
                is.call((left.restore(&ctx)?, right.restore(&ctx)?))
            })
            .unwrap_or(false)
    }
}

/// A pre-resolved dependency spliced into a module before its factory runs.
#[derive(Clone)]
pub enum DepValue {
    Exports(ModuleExports),
    Json(serde_json::Value),
}

impl DepValue {
    pub(crate) fn restore<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        match self {
            DepValue::Exports(exports) => exports.restore(ctx),
            DepValue::Json(value) => json_to_js(ctx, value),
        }
    }

    pub(crate) fn is_missing(&self) -> bool {
        matches!(self, DepValue::Json(serde_json::Value::Null))
    }
}

pub(crate) struct ModuleEntry {
    pub module: Persistent<Object<'static>>,
    pub resolver: Persistent<Function<'static>>,
    pub deps: Vec<(String, DepValue)>,
    pub loaded: bool,
}

#[derive(Default)]
pub(crate) struct ModuleRegistry {
    entries: HashMap<String, ModuleEntry>,
}

impl ModuleRegistry {
    pub fn is_resolved(&self, id: &str) -> bool {
        self.entries.get(id).map(|entry| entry.loaded).unwrap_or(false)
    }

    pub fn get(&self, id: &str) -> Option<&ModuleEntry> {
        self.entries.get(id)
    }

    pub fn insert(&mut self, id: &str, entry: ModuleEntry) -> Option<ModuleEntry> {
        self.entries.insert(id.to_string(), entry)
    }

    pub fn remove(&mut self, id: &str) -> Option<ModuleEntry> {
        self.entries.remove(id)
    }

    pub fn set_loaded(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.loaded = true;
        }
    }

    fn dependency(&self, owner: &str, name: &str) -> Option<DepValue> {
        self.entries
            .get(owner)?
            .deps
            .iter()
            .find(|(dep, _)| dep == name)
            .map(|(_, value)| value.clone())
    }
}

fn new_module_object<'js>(
    ctx: &Ctx<'js>,
    id: &str,
    require: &Function<'js>,
) -> rquickjs::Result<Object<'js>> {
    let module = Object::new(ctx.clone())?;
    module.set("id", id)?;
    module.set("exports", Object::new(ctx.clone())?)?;
    module.set("loaded", false)?;
    module.set("require", require.clone())?;
    Ok(module)
}

/// `require` handed to the factory of `owner`: the module's own deps first,
/// then every defined module.
fn require_function<'js>(
    ctx: &Ctx<'js>,
    loader: Weak<LoaderInner>,
    owner: &str,
) -> rquickjs::Result<Function<'js>> {
    let owner = owner.to_string();
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, name: String| -> rquickjs::Result<Value<'js>> {
            let Some(loader) = loader.upgrade() else {
                return Err(Exception::throw_message(&ctx, "module loader was dropped"));
            };
            let dependency = loader.modules.borrow().dependency(&owner, &name);
            if let Some(dependency) = dependency {
                return dependency.restore(&ctx);
            }
            let module = loader
                .modules
                .borrow()
                .get(&name)
                .map(|entry| entry.module.clone());
            match module {
                Some(module) => module.restore(&ctx)?.get("exports"),
                None => Err(Exception::throw_message(
                    &ctx,
                    &format!("module not found: {name}"),
                )),
            }
        },
    )?
    .with_name("require")
}

/// Register `id` and run its factory. A factory that throws leaves no module
/// behind; its message is returned as the inner error.
pub(crate) fn define<'js>(
    ctx: &Ctx<'js>,
    loader: &Rc<LoaderInner>,
    id: &str,
    resolver: &Function<'js>,
    deps: &[(String, DepValue)],
    context: Option<FrameId>,
) -> rquickjs::Result<Result<(), String>> {
    for (name, value) in deps {
        if value.is_missing() {
            tracing::warn!(
                target: "loader",
                module = id,
                dependency = %name,
                "dependency is null or undefined; check the import statement"
            );
        }
    }

    let require = require_function(ctx, Rc::downgrade(loader), id)?;
    let module = new_module_object(ctx, id, &require)?;
    let exports: Value = module.get("exports")?;
    let replaced = loader.modules.borrow_mut().insert(
        id,
        ModuleEntry {
            module: Persistent::save(ctx, module.clone()),
            resolver: Persistent::save(ctx, resolver.clone()),
            deps: deps.to_vec(),
            loaded: false,
        },
    );
    drop(replaced);

    let outcome = loader
        .host
        .inner()
        .snapshot(ctx, context.unwrap_or(FrameId::TOP))
        .and_then(|snapshot| resolver.call::<_, ()>((require, module.clone(), exports, snapshot)));
    match outcome {
        Ok(()) => {
            module.set("loaded", true)?;
            loader.modules.borrow_mut().set_loaded(id);
            tracing::debug!(target: "loader", module = id, "module defined");
            Ok(Ok(()))
        }
        Err(rquickjs::Error::Exception) => {
            let message = capture_exception_message(ctx)
                .unwrap_or_else(|| "factory threw".to_string());
            let removed = loader.modules.borrow_mut().remove(id);
            drop(removed);
            Ok(Err(message))
        }
        Err(err) => {
            let removed = loader.modules.borrow_mut().remove(id);
            drop(removed);
            Err(err)
        }
    }
}

/// Exports of a defined module.
pub(crate) fn require(loader: &LoaderInner, id: &str) -> Result<Option<ModuleExports>> {
    let module = loader
        .modules
        .borrow()
        .get(id)
        .filter(|entry| entry.loaded)
        .map(|entry| entry.module.clone());
    let Some(module) = module else {
        return Ok(None);
    };
    let exports = loader.host.engine().with_context(|ctx| {
        let module = module.restore(&ctx)?;
        let exports: Value = module.get("exports")?;
        Ok(Persistent::save(&ctx, exports))
    })?;
    Ok(Some(ModuleExports::new(exports, loader.host.clone())))
}

/// Run the cached factory of `id` again against `frame`'s globals. The
/// registry keeps its original exports.
pub(crate) fn require_isolated(
    loader: &Rc<LoaderInner>,
    id: &str,
    frame: FrameId,
) -> Result<Option<Result<ModuleExports, String>>> {
    let resolver = loader
        .modules
        .borrow()
        .get(id)
        .filter(|entry| entry.loaded)
        .map(|entry| entry.resolver.clone());
    let Some(resolver) = resolver else {
        return Ok(None);
    };

    let weak = Rc::downgrade(loader);
    let host = loader.host.inner().clone();
    let owner = id.to_string();
    let outcome = loader.host.engine().with_context(|ctx| {
        let resolver = resolver.restore(&ctx)?;
        let require = require_function(&ctx, weak, &owner)?;
        let module = new_module_object(&ctx, &owner, &require)?;
        let exports: Value = module.get("exports")?;
        let snapshot = host.snapshot(&ctx, frame)?;
        match resolver.call::<_, ()>((require, module.clone(), exports, snapshot)) {
            Ok(()) => {
                module.set("loaded", true)?;
                let exports: Value = module.get("exports")?;
                Ok(Ok(Persistent::save(&ctx, exports)))
            }
            Err(rquickjs::Error::Exception) => Ok(Err(capture_exception_message(&ctx)
                .unwrap_or_else(|| "factory threw".to_string()))),
            Err(err) => Err(err),
        }
    })?;
    loader.host.engine().drain_jobs()?;

    Ok(Some(
        outcome.map(|exports| ModuleExports::new(exports, loader.host.clone())),
    ))
}
