use std::collections::HashMap;

use futures_util::future::{LocalBoxFuture, Shared};

use crate::frame::FrameId;
use crate::loader::{DepValue, LoadError};

/// What a record will produce once its bundle calls back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// A bundle that registers module exports.
    Module,
    /// A plain script wrapped for a sandbox; nothing is exported.
    Script,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub id: String,
    pub kind: RecordKind,
}

impl RecordKey {
    pub fn module(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: RecordKind::Module,
        }
    }

    pub fn script(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: RecordKind::Script,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordState {
    Pending,
    Loaded,
    Failed(LoadError),
}

/// Awaitable outcome of one load attempt. Every waiter holds a clone; the
/// first one to poll drives the fetch.
pub type LoadPromise = Shared<LocalBoxFuture<'static, Result<(), LoadError>>>;

pub struct LoadRecord {
    pub key: RecordKey,
    pub uuid: String,
    pub context: Option<FrameId>,
    pub deps: Vec<(String, DepValue)>,
    pub state: RecordState,
    pub promise: LoadPromise,
}

/// Parts of a record the hook needs, copied out so no borrow is held while
/// JS runs.
#[derive(Clone)]
pub struct RecordView {
    pub uuid: String,
    pub context: Option<FrameId>,
    pub deps: Vec<(String, DepValue)>,
}

impl From<&LoadRecord> for RecordView {
    fn from(record: &LoadRecord) -> Self {
        Self {
            uuid: record.uuid.clone(),
            context: record.context,
            deps: record.deps.clone(),
        }
    }
}

#[derive(Default)]
pub struct RecordStore {
    records: HashMap<RecordKey, LoadRecord>,
}

impl RecordStore {
    pub fn get(&self, key: &RecordKey) -> Option<&LoadRecord> {
        self.records.get(key)
    }

    /// Store `record`, returning the one it replaces.
    pub fn insert(&mut self, record: LoadRecord) -> Option<LoadRecord> {
        self.records.insert(record.key.clone(), record)
    }

    pub fn remove(&mut self, key: &RecordKey) -> Option<LoadRecord> {
        self.records.remove(key)
    }

    /// The promise of a record that is still loading.
    pub fn pending_promise(&self, key: &RecordKey) -> Option<LoadPromise> {
        self.records
            .get(key)
            .filter(|record| record.state == RecordState::Pending)
            .map(|record| record.promise.clone())
    }

    /// Update the state of the record for `key` if it still belongs to the
    /// load identified by `uuid`.
    pub fn mark(&mut self, key: &RecordKey, uuid: &str, state: RecordState) -> bool {
        match self.records.get_mut(key) {
            Some(record) if record.uuid == uuid => {
                record.state = state;
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self, id: &str) -> bool {
        [RecordKey::module(id), RecordKey::script(id)]
            .iter()
            .filter_map(|key| self.records.get(key))
            .any(|record| record.state == RecordState::Pending)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::{self, FutureExt};

    fn record(id: &str, kind: RecordKind, uuid: &str) -> LoadRecord {
        LoadRecord {
            key: RecordKey {
                id: id.to_string(),
                kind,
            },
            uuid: uuid.to_string(),
            context: None,
            deps: Vec::new(),
            state: RecordState::Pending,
            promise: future::ready(Ok(())).boxed_local().shared(),
        }
    }

    #[test]
    fn module_and_script_records_do_not_collide() {
        let mut store = RecordStore::default();
        store.insert(record("app", RecordKind::Module, "u-1"));
        store.insert(record("app", RecordKind::Script, "u-2"));
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&RecordKey::module("app")).unwrap().uuid, "u-1");
        assert_eq!(store.get(&RecordKey::script("app")).unwrap().uuid, "u-2");
    }

    #[test]
    fn mark_requires_matching_uuid() {
        let mut store = RecordStore::default();
        store.insert(record("app", RecordKind::Module, "u-1"));
        let key = RecordKey::module("app");
        assert!(!store.mark(&key, "other", RecordState::Loaded));
        assert!(store.is_pending("app"));
        assert!(store.mark(&key, "u-1", RecordState::Loaded));
        assert!(!store.is_pending("app"));
        assert!(store.pending_promise(&key).is_none());
    }

    #[test]
    fn replacing_a_record_returns_the_old_one() {
        let mut store = RecordStore::default();
        store.insert(record("app", RecordKind::Module, "u-1"));
        let old = store.insert(record("app", RecordKind::Module, "u-2")).unwrap();
        assert_eq!(old.uuid, "u-1");
        assert_eq!(store.len(), 1);
    }
}
