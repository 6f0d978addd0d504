use std::rc::Weak;

use rquickjs::function::This;
use rquickjs::{Ctx, Value};

use crate::frame::FrameId;
use crate::hook::{HookCall, HookHandler, HookOutcome};
use crate::js::runtime::capture_exception_message;
use crate::loader::module::define;
use crate::loader::record::{RecordKey, RecordState, RecordView};
use crate::loader::{LoadError, LoaderInner};

/// Hook handler that settles the loader's pending records.
pub(crate) struct LoaderHook {
    loader: Weak<LoaderInner>,
}

impl LoaderHook {
    pub fn new(loader: Weak<LoaderInner>) -> Self {
        Self { loader }
    }
}

impl HookHandler for LoaderHook {
    fn handle<'js>(&self, ctx: &Ctx<'js>, call: &HookCall<'js>) -> rquickjs::Result<HookOutcome> {
        let Some(loader) = self.loader.upgrade() else {
            return Ok(HookOutcome::Declined);
        };
        let module_key = RecordKey::module(&call.id);
        let script_key = RecordKey::script(&call.id);
        let (module, script) = {
            let records = loader.records.borrow();
            (
                records.get(&module_key).map(RecordView::from),
                records.get(&script_key).map(RecordView::from),
            )
        };

        if module.is_none() && script.is_none() {
            return Ok(HookOutcome::Declined);
        }
        if let Some(uuid) = &call.uuid {
            let stale = [&module, &script]
                .into_iter()
                .flatten()
                .any(|record| &record.uuid != uuid);
            if stale {
                tracing::debug!(target: "loader", id = %call.id, %uuid, "script uuid does not match the pending load");
                return Ok(HookOutcome::Declined);
            }
        }

        if let Some(record) = script {
            let snapshot = loader
                .host
                .inner()
                .snapshot(ctx, record.context.unwrap_or(FrameId::TOP))?;
            let window: Value = snapshot.get("window")?;
            let undefined = Value::new_undefined(ctx.clone());
            let outcome = call.resolver.call::<_, ()>((
                This(window),
                undefined.clone(),
                undefined.clone(),
                undefined,
                snapshot,
            ));
            let state = match outcome {
                Ok(()) => RecordState::Loaded,
                Err(rquickjs::Error::Exception) => RecordState::Failed(LoadError::Factory {
                    id: call.id.clone(),
                    message: capture_exception_message(ctx)
                        .unwrap_or_else(|| "script threw".to_string()),
                }),
                Err(err) => return Err(err),
            };
            loader
                .records
                .borrow_mut()
                .mark(&script_key, &record.uuid, state);
            return Ok(HookOutcome::Handled);
        }

        let Some(record) = module else {
            return Ok(HookOutcome::Declined);
        };
        let state = match define(
            ctx,
            &loader,
            &call.id,
            &call.resolver,
            &record.deps,
            record.context,
        )? {
            Ok(()) => RecordState::Loaded,
            Err(message) => {
                tracing::error!(target: "loader", id = %call.id, error = %message, "module factory threw");
                RecordState::Failed(LoadError::Factory {
                    id: call.id.clone(),
                    message,
                })
            }
        };
        loader
            .records
            .borrow_mut()
            .mark(&module_key, &record.uuid, state);
        Ok(HookOutcome::Handled)
    }
}
