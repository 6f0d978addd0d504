use std::collections::HashMap;

use rquickjs::{Ctx, Function, Object, Persistent};

use crate::frame::FrameId;

/// Identity of a listener registered from a realm. `local` is assigned by the
/// realm's bootstrap and is stable for one function object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId {
    pub frame: FrameId,
    pub local: u32,
}

pub struct ListenerEntry {
    pub id: ListenerId,
    pub capture: bool,
    pub callback: Persistent<Function<'static>>,
}

/// Listeners of one event target (a window or a document), keyed by type.
#[derive(Default)]
pub struct EventTargetRegistry {
    listeners: HashMap<String, Vec<ListenerEntry>>,
}

impl EventTargetRegistry {
    /// Returns `false` when the same listener is already registered for this
    /// type and phase.
    pub fn add(&mut self, event_type: &str, entry: ListenerEntry) -> bool {
        let bucket = self.listeners.entry(event_type.to_string()).or_default();
        if bucket
            .iter()
            .any(|existing| existing.id == entry.id && existing.capture == entry.capture)
        {
            return false;
        }
        bucket.push(entry);
        true
    }

    pub fn remove(&mut self, event_type: &str, id: ListenerId, capture: bool) -> bool {
        let Some(bucket) = self.listeners.get_mut(event_type) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|entry| !(entry.id == id && entry.capture == capture));
        let removed = bucket.len() != before;
        if bucket.is_empty() {
            self.listeners.remove(event_type);
        }
        removed
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.listeners.get(event_type).map(Vec::len).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.listeners.values().map(Vec::len).sum()
    }

    /// Capture listeners first, then bubble listeners, each in registration order.
    pub fn callbacks(&self, event_type: &str) -> Vec<Persistent<Function<'static>>> {
        let Some(bucket) = self.listeners.get(event_type) else {
            return Vec::new();
        };
        let capture = bucket.iter().filter(|entry| entry.capture);
        let bubble = bucket.iter().filter(|entry| !entry.capture);
        capture
            .chain(bubble)
            .map(|entry| entry.callback.clone())
            .collect()
    }

    pub fn clear(&mut self) -> usize {
        let total = self.total();
        self.listeners.clear();
        total
    }
}

/// Where an isolated frame's listener was actually bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingTarget {
    HostWindow,
    Frame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualListener {
    pub id: ListenerId,
    pub capture: bool,
    pub target: BindingTarget,
}

/// Record of the listeners an isolated frame registered, so teardown can
/// unbind the ones that live outside the frame.
#[derive(Debug, Default)]
pub struct ListenerMap {
    entries: HashMap<String, Vec<VirtualListener>>,
}

impl ListenerMap {
    pub fn record(&mut self, event_type: &str, listener: VirtualListener) {
        let bucket = self.entries.entry(event_type.to_string()).or_default();
        if !bucket
            .iter()
            .any(|known| known.id == listener.id && known.capture == listener.capture)
        {
            bucket.push(listener);
        }
    }

    pub fn take(&mut self, event_type: &str, id: ListenerId, capture: bool) -> Option<VirtualListener> {
        let bucket = self.entries.get_mut(event_type)?;
        let index = bucket
            .iter()
            .position(|known| known.id == id && known.capture == capture)?;
        let listener = bucket.remove(index);
        if bucket.is_empty() {
            self.entries.remove(event_type);
        }
        Some(listener)
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.entries.get(event_type).map(Vec::len).unwrap_or(0)
    }

    pub fn drain(&mut self) -> Vec<(String, VirtualListener)> {
        self.entries
            .drain()
            .flat_map(|(event_type, listeners)| {
                listeners
                    .into_iter()
                    .map(move |listener| (event_type.clone(), listener))
            })
            .collect()
    }
}

/// Call each listener with `event`. A throwing listener is logged and the
/// remaining listeners still run. Returns how many listeners were invoked.
pub fn invoke_listeners<'js>(
    ctx: &Ctx<'js>,
    event_type: &str,
    callbacks: Vec<Persistent<Function<'static>>>,
    event: &Object<'js>,
) -> rquickjs::Result<usize> {
    let mut invoked = 0;
    for callback in callbacks {
        let callback = callback.restore(ctx)?;
        invoked += 1;
        match callback.call::<_, ()>((event.clone(),)) {
            Ok(()) => {}
            Err(rquickjs::Error::Exception) => {
                let message = crate::js::runtime::capture_exception_message(ctx)
                    .unwrap_or_else(|| "listener threw".to_string());
                tracing::error!(target: "quickjs", event_type, error = %message, "listener failure");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(invoked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener(frame: u32, local: u32) -> ListenerId {
        ListenerId {
            frame: FrameId(frame),
            local,
        }
    }

    #[test]
    fn listener_map_takes_matching_phase_only() {
        let mut map = ListenerMap::default();
        let id = listener(1, 7);
        map.record(
            "resize",
            VirtualListener {
                id,
                capture: false,
                target: BindingTarget::HostWindow,
            },
        );
        assert!(map.take("resize", id, true).is_none());
        let taken = map.take("resize", id, false).unwrap();
        assert_eq!(taken.target, BindingTarget::HostWindow);
        assert_eq!(map.count("resize"), 0);
    }

    #[test]
    fn listener_map_drain_flattens_types() {
        let mut map = ListenerMap::default();
        for (event_type, local) in [("click", 1), ("click", 2), ("scroll", 3)] {
            map.record(
                event_type,
                VirtualListener {
                    id: listener(2, local),
                    capture: false,
                    target: BindingTarget::Frame,
                },
            );
        }
        let mut drained = map.drain();
        drained.sort_by_key(|(_, listener)| listener.id.local);
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[2].0, "scroll");
        assert_eq!(map.count("click"), 0);
    }
}
