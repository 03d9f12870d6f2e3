use super::{CommitKind, RecordState};
use crate::core::{Attributes, EntityType, Result, StoreError, ValidationErrors};
use crate::identity::{ClientId, RecordId};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared handle to a materialized record. Identity is pointer identity.
pub type RecordRef = Arc<Record>;

#[derive(Debug, Default)]
struct RecordData {
    id: Option<RecordId>,
    state: RecordState,
    /// Last state acknowledged by the backend
    data: Attributes,
    /// Snapshot handed to the adapter by the current commit
    in_flight: Attributes,
    /// Local edits not yet handed to the adapter
    changes: Attributes,
    errors: ValidationErrors,
    /// In-flight attributes not yet acknowledged one by one
    outstanding: BTreeSet<String>,
    unloaded: bool,
    reloading: bool,
}

impl RecordData {
    fn guard_state(&self, action: &str) -> StoreError {
        StoreError::InvalidState(format!("cannot {} while in state {}", action, self.state))
    }

    /// Put the in-flight snapshot back under the local changes.
    fn fold_in_flight(&mut self) {
        let in_flight = std::mem::take(&mut self.in_flight);
        for (key, value) in in_flight {
            self.changes.entry(key).or_insert(value);
        }
        self.outstanding.clear();
    }

    fn finish_commit(&mut self, kind: CommitKind) {
        let in_flight = std::mem::take(&mut self.in_flight);
        self.data.extend(in_flight);
        self.outstanding.clear();
        self.errors.clear();
        self.state = if kind == CommitKind::Delete {
            self.changes.clear();
            RecordState::Deleted
        } else if self.changes.is_empty() {
            RecordState::Clean
        } else {
            RecordState::Dirty(CommitKind::Update)
        };
    }
}

/// One materialized entity instance.
///
/// The record owns its attribute storage; the store drives its lifecycle
/// through the `loading_data`/`setup_data`/`adapter_*` transitions.
pub struct Record {
    entity_type: EntityType,
    client_id: ClientId,
    inner: Mutex<RecordData>,
}

impl Record {
    pub(crate) fn new(entity_type: EntityType, client_id: ClientId, id: Option<RecordId>) -> Self {
        Self {
            entity_type,
            client_id,
            inner: Mutex::new(RecordData {
                id,
                ..RecordData::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecordData> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn id(&self) -> Option<RecordId> {
        self.lock().id.clone()
    }

    pub fn state(&self) -> RecordState {
        self.lock().state
    }

    pub fn is_empty(&self) -> bool {
        self.state().is_empty()
    }

    pub fn is_loading(&self) -> bool {
        self.state().is_loading()
    }

    pub fn is_loaded(&self) -> bool {
        self.state().is_loaded()
    }

    pub fn is_dirty(&self) -> bool {
        self.state().is_dirty()
    }

    pub fn is_new(&self) -> bool {
        self.state().is_new()
    }

    pub fn is_deleted(&self) -> bool {
        self.state().is_deleted()
    }

    pub fn is_valid(&self) -> bool {
        self.state().is_valid()
    }

    pub fn is_error(&self) -> bool {
        self.state().is_error()
    }

    pub fn is_unloaded(&self) -> bool {
        self.lock().unloaded
    }

    pub fn is_reloading(&self) -> bool {
        self.lock().reloading
    }

    /// Current value of an attribute: local change, then in-flight, then saved.
    pub fn get(&self, name: &str) -> Option<Value> {
        let inner = self.lock();
        inner
            .changes
            .get(name)
            .or_else(|| inner.in_flight.get(name))
            .or_else(|| inner.data.get(name))
            .cloned()
    }

    /// Merged view of every attribute as the application currently sees it.
    pub fn attributes(&self) -> Attributes {
        let inner = self.lock();
        let mut merged = inner.data.clone();
        merged.extend(inner.in_flight.clone());
        merged.extend(inner.changes.clone());
        merged
    }

    pub fn canonical_data(&self) -> Attributes {
        self.lock().data.clone()
    }

    pub fn changed_attributes(&self) -> Attributes {
        self.lock().changes.clone()
    }

    pub fn in_flight_attributes(&self) -> Attributes {
        self.lock().in_flight.clone()
    }

    pub fn errors(&self) -> ValidationErrors {
        self.lock().errors.clone()
    }

    pub fn outstanding_attributes(&self) -> Vec<String> {
        self.lock().outstanding.iter().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Lifecycle transitions driven by the store
    // ------------------------------------------------------------------

    pub(crate) fn assign_id(&self, id: RecordId) {
        self.lock().id = Some(id);
    }

    pub(crate) fn mark_unloaded(&self) {
        self.lock().unloaded = true;
    }

    pub(crate) fn set_reloading(&self, reloading: bool) {
        self.lock().reloading = reloading;
    }

    pub(crate) fn loading_data(&self) -> Result<()> {
        let mut inner = self.lock();
        if !inner.state.is_empty() {
            return Err(inner.guard_state("start loading"));
        }
        inner.state = RecordState::Loading;
        Ok(())
    }

    /// A fetch failed; an unloaded record is fetchable again.
    pub(crate) fn fetch_did_fail(&self) {
        let mut inner = self.lock();
        inner.reloading = false;
        if inner.state.is_loading() {
            inner.state = RecordState::Empty;
        }
    }

    /// The record was created locally and has never been saved.
    pub(crate) fn loaded_data(&self, properties: Attributes) -> Result<()> {
        let mut inner = self.lock();
        if !inner.state.is_empty() {
            return Err(inner.guard_state("initialize a new record"));
        }
        inner.changes = properties;
        inner.state = RecordState::Dirty(CommitKind::Create);
        Ok(())
    }

    /// Ingest a full payload.
    pub(crate) fn setup_data(&self, data: Attributes) {
        let mut inner = self.lock();
        inner.reloading = false;
        match inner.state {
            RecordState::Empty | RecordState::Loading | RecordState::Clean => {
                inner.data = data;
                inner.state = RecordState::Clean;
            }
            RecordState::Deleted => {}
            _ => inner.data.extend(data),
        }
    }

    /// Merge a partial payload into the saved state.
    pub(crate) fn merge_data(&self, data: Attributes) {
        let mut inner = self.lock();
        match inner.state {
            RecordState::Empty | RecordState::Loading => {
                inner.data.extend(data);
                inner.state = RecordState::Clean;
            }
            RecordState::Deleted => {}
            _ => inner.data.extend(data),
        }
    }

    /// Record a local attribute change. Returns false when the value did not change.
    pub(crate) fn set(&self, name: &str, value: Value) -> Result<bool> {
        let mut inner = self.lock();
        match inner.state {
            RecordState::Empty | RecordState::Loading | RecordState::Deleted => {
                return Err(inner.guard_state(&format!("set '{}'", name)));
            }
            state if state.is_deleted() => {
                return Err(inner.guard_state(&format!("set '{}'", name)));
            }
            _ => {}
        }

        let current = inner
            .changes
            .get(name)
            .or_else(|| inner.in_flight.get(name))
            .or_else(|| inner.data.get(name));
        if current == Some(&value) {
            return Ok(false);
        }

        inner.changes.insert(name.to_string(), value);
        match inner.state {
            RecordState::Clean => inner.state = RecordState::Dirty(CommitKind::Update),
            RecordState::Invalid(kind) => {
                inner.errors.remove(name);
                if inner.errors.is_empty() {
                    inner.state = RecordState::Dirty(kind);
                }
            }
            _ => {}
        }
        Ok(true)
    }

    /// Returns true when the record now waits for a delete commit.
    pub(crate) fn delete_record(&self) -> Result<bool> {
        let mut inner = self.lock();
        match inner.state {
            RecordState::Clean
            | RecordState::Dirty(CommitKind::Update)
            | RecordState::Invalid(CommitKind::Update)
            | RecordState::Error(CommitKind::Update) => {
                inner.changes.clear();
                inner.errors.clear();
                inner.state = RecordState::Dirty(CommitKind::Delete);
                Ok(true)
            }
            RecordState::Dirty(CommitKind::Create)
            | RecordState::Invalid(CommitKind::Create)
            | RecordState::Error(CommitKind::Create) => {
                inner.changes.clear();
                inner.errors.clear();
                inner.state = RecordState::Deleted;
                Ok(false)
            }
            state if state.is_deleted() && !state.is_in_flight() => Ok(false),
            _ => Err(inner.guard_state("delete")),
        }
    }

    pub(crate) fn rollback(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            RecordState::Clean | RecordState::Deleted => Ok(()),
            RecordState::Dirty(CommitKind::Create)
            | RecordState::Invalid(CommitKind::Create)
            | RecordState::Error(CommitKind::Create) => {
                inner.changes.clear();
                inner.errors.clear();
                inner.state = RecordState::Deleted;
                Ok(())
            }
            RecordState::Dirty(_) | RecordState::Invalid(_) | RecordState::Error(_) => {
                inner.changes.clear();
                inner.errors.clear();
                inner.state = RecordState::Clean;
                Ok(())
            }
            _ => Err(inner.guard_state("roll back")),
        }
    }

    /// Freeze local changes as the in-flight snapshot.
    pub(crate) fn adapter_will_commit(&self) -> Result<CommitKind> {
        let mut inner = self.lock();
        let kind = match inner.state {
            RecordState::Clean => CommitKind::Update,
            RecordState::Dirty(kind) | RecordState::Error(kind) => kind,
            _ => return Err(inner.guard_state("commit")),
        };
        let changes = std::mem::take(&mut inner.changes);
        inner.in_flight.extend(changes);
        inner.outstanding = inner.in_flight.keys().cloned().collect();
        inner.state = RecordState::InFlight(kind);
        Ok(kind)
    }

    /// Server-side data, when present, wins over local edits.
    pub(crate) fn adapter_did_commit(&self, data: Option<Attributes>) -> Result<CommitKind> {
        let mut inner = self.lock();
        let RecordState::InFlight(kind) = inner.state else {
            return Err(inner.guard_state("acknowledge a commit"));
        };
        inner.finish_commit(kind);
        if let Some(data) = data {
            inner.data.extend(data);
            inner.changes.clear();
            if kind != CommitKind::Delete {
                inner.state = RecordState::Clean;
            }
        }
        Ok(kind)
    }

    pub(crate) fn adapter_did_invalidate(&self, errors: ValidationErrors) -> Result<CommitKind> {
        let mut inner = self.lock();
        let RecordState::InFlight(kind) = inner.state else {
            return Err(inner.guard_state("invalidate"));
        };
        inner.fold_in_flight();
        inner.state = if errors.is_empty() {
            RecordState::Dirty(kind)
        } else {
            RecordState::Invalid(kind)
        };
        inner.errors = errors;
        Ok(kind)
    }

    pub(crate) fn adapter_did_error(&self) -> Result<CommitKind> {
        let mut inner = self.lock();
        let RecordState::InFlight(kind) = inner.state else {
            return Err(inner.guard_state("report a commit error"));
        };
        inner.fold_in_flight();
        inner.state = RecordState::Error(kind);
        Ok(kind)
    }

    /// Acknowledge one attribute. Returns true once nothing is outstanding.
    pub(crate) fn adapter_did_update_attribute(
        &self,
        name: &str,
        value: Option<Value>,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let kind = match inner.state {
            RecordState::InFlight(kind) if kind != CommitKind::Delete => kind,
            _ => return Err(inner.guard_state(&format!("acknowledge attribute '{}'", name))),
        };
        let flighted = inner.in_flight.remove(name);
        if let Some(value) = value.or(flighted) {
            inner.data.insert(name.to_string(), value);
        }
        inner.outstanding.remove(name);
        if inner.outstanding.is_empty() {
            inner.finish_commit(kind);
            return Ok(true);
        }
        Ok(false)
    }

    /// Another record's change made this one dirty.
    pub(crate) fn adapter_did_dirty(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == RecordState::Clean {
            inner.state = RecordState::Dirty(CommitKind::Update);
            return true;
        }
        false
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Record")
            .field("type", &self.entity_type)
            .field("client_id", &self.client_id)
            .field("id", &inner.id)
            .field("state", &inner.state)
            .finish()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{}:{}", self.entity_type, id),
            None => write!(f, "{}:{}", self.entity_type, self.client_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    fn loaded(data: Value) -> Record {
        let record = Record::new("widget".into(), ClientId(1), Some(RecordId::from("1")));
        record.setup_data(attrs(data));
        record
    }

    #[test]
    fn test_fetch_failure_returns_to_empty() {
        let record = Record::new("widget".into(), ClientId(1), Some(RecordId::from("1")));
        record.loading_data().unwrap();
        assert!(record.is_loading());
        assert!(record.loading_data().is_err());

        record.fetch_did_fail();
        assert!(record.is_empty());
        record.loading_data().unwrap();
    }

    #[test]
    fn test_set_marks_dirty_only_on_change() {
        let record = loaded(json!({"name": "Foo"}));
        assert!(!record.set("name", json!("Foo")).unwrap());
        assert_eq!(record.state(), RecordState::Clean);

        assert!(record.set("name", json!("Bar")).unwrap());
        assert_eq!(record.state(), RecordState::Dirty(CommitKind::Update));
        assert_eq!(record.get("name"), Some(json!("Bar")));
        assert_eq!(record.canonical_data().get("name"), Some(&json!("Foo")));
    }

    #[test]
    fn test_commit_without_data_keeps_later_changes() {
        let record = loaded(json!({"name": "Foo"}));
        record.set("name", json!("Bar")).unwrap();
        assert_eq!(record.adapter_will_commit().unwrap(), CommitKind::Update);

        record.set("color", json!("red")).unwrap();
        record.adapter_did_commit(None).unwrap();

        assert_eq!(record.canonical_data().get("name"), Some(&json!("Bar")));
        assert_eq!(record.state(), RecordState::Dirty(CommitKind::Update));
        assert_eq!(record.get("color"), Some(json!("red")));
    }

    #[test]
    fn test_commit_with_data_discards_later_changes() {
        let record = loaded(json!({"name": "Foo"}));
        record.set("name", json!("Bar")).unwrap();
        record.adapter_will_commit().unwrap();
        record.set("color", json!("red")).unwrap();

        record
            .adapter_did_commit(Some(attrs(json!({"name": "Server"}))))
            .unwrap();

        assert_eq!(record.state(), RecordState::Clean);
        assert_eq!(record.get("name"), Some(json!("Server")));
        assert_eq!(record.get("color"), None);
    }

    #[test]
    fn test_invalid_recovers_after_all_fields_change() {
        let record = loaded(json!({"name": "Foo", "size": 1}));
        record.set("name", json!("")).unwrap();
        record.set("size", json!(-1)).unwrap();
        record.adapter_will_commit().unwrap();

        let mut errors = ValidationErrors::new();
        errors.insert("name".into(), "can't be blank".into());
        errors.insert("size".into(), "must be positive".into());
        record.adapter_did_invalidate(errors).unwrap();
        assert_eq!(record.state(), RecordState::Invalid(CommitKind::Update));
        assert_eq!(record.get("name"), Some(json!("")));

        record.set("name", json!("Fixed")).unwrap();
        assert!(!record.is_valid());
        record.set("size", json!(2)).unwrap();
        assert_eq!(record.state(), RecordState::Dirty(CommitKind::Update));
        assert!(record.errors().is_empty());
    }

    #[test]
    fn test_fine_grained_acknowledgement() {
        let record = loaded(json!({"a": 1, "b": 2}));
        record.set("a", json!(10)).unwrap();
        record.set("b", json!(20)).unwrap();
        record.adapter_will_commit().unwrap();

        assert!(!record.adapter_did_update_attribute("a", None).unwrap());
        assert!(record.is_dirty());
        assert_eq!(record.outstanding_attributes(), vec!["b".to_string()]);

        assert!(record.adapter_did_update_attribute("b", Some(json!(21))).unwrap());
        assert_eq!(record.state(), RecordState::Clean);
        assert_eq!(record.get("b"), Some(json!(21)));
    }

    #[test]
    fn test_delete_new_record_skips_commit() {
        let record = Record::new("widget".into(), ClientId(3), None);
        record.loaded_data(attrs(json!({"name": "tmp"}))).unwrap();
        assert!(!record.delete_record().unwrap());
        assert_eq!(record.state(), RecordState::Deleted);
    }

    #[test]
    fn test_rollback_rules() {
        let record = loaded(json!({"name": "Foo"}));
        record.set("name", json!("Bar")).unwrap();
        record.rollback().unwrap();
        assert_eq!(record.state(), RecordState::Clean);
        assert_eq!(record.get("name"), Some(json!("Foo")));

        record.set("name", json!("Baz")).unwrap();
        record.adapter_will_commit().unwrap();
        assert!(record.rollback().is_err());

        record.adapter_did_error().unwrap();
        assert_eq!(record.state(), RecordState::Error(CommitKind::Update));
        assert_eq!(record.get("name"), Some(json!("Baz")));
    }
}
