use crate::core::{EntityType, StoreError};
use crate::identity::ClientId;
use crate::record::RecordRef;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

pub type RecordArrayRef = Arc<RecordArray>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordArrayKind {
    /// Every loaded, non-deleted record of a type; one per type
    All,
    /// Membership decided by a predicate
    Filtered,
    /// Membership set by an adapter response
    AdapterPopulated,
    /// Backing collection of a to-many relationship
    Many,
}

#[derive(Debug, Default)]
struct ArrayState {
    content: im::Vector<RecordRef>,
    members: HashSet<ClientId>,
    is_loaded: bool,
    is_updating: bool,
    /// Members of a many-array whose data has not landed yet
    pending: HashSet<ClientId>,
    load_notifications: usize,
    error: Option<StoreError>,
}

/// Ordered, live view over records of one entity type.
pub struct RecordArray {
    id: u64,
    entity_type: EntityType,
    kind: RecordArrayKind,
    query: Option<Value>,
    owner: Option<RecordRef>,
    link: Option<String>,
    inner: Mutex<ArrayState>,
    loaded_tx: watch::Sender<bool>,
}

impl RecordArray {
    pub(crate) fn new(id: u64, entity_type: EntityType, kind: RecordArrayKind) -> Self {
        let (loaded_tx, _) = watch::channel(false);
        Self {
            id,
            entity_type,
            kind,
            query: None,
            owner: None,
            link: None,
            inner: Mutex::new(ArrayState::default()),
            loaded_tx,
        }
    }

    pub(crate) fn with_query(mut self, query: Value) -> Self {
        self.query = Some(query);
        self
    }

    pub(crate) fn with_owner(mut self, owner: Option<RecordRef>, link: Option<String>) -> Self {
        self.owner = owner;
        self.link = link;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ArrayState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn array_id(&self) -> u64 {
        self.id
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn kind(&self) -> RecordArrayKind {
        self.kind
    }

    pub fn query(&self) -> Option<&Value> {
        self.query.as_ref()
    }

    pub fn owner(&self) -> Option<&RecordRef> {
        self.owner.as_ref()
    }

    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    pub fn len(&self) -> usize {
        self.lock().content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().content.is_empty()
    }

    /// Cheap snapshot of the current membership.
    pub fn content(&self) -> im::Vector<RecordRef> {
        self.lock().content.clone()
    }

    pub fn get(&self, index: usize) -> Option<RecordRef> {
        self.lock().content.get(index).cloned()
    }

    pub fn contains(&self, record: &RecordRef) -> bool {
        self.lock().members.contains(&record.client_id())
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().is_loaded
    }

    pub fn is_updating(&self) -> bool {
        self.lock().is_updating
    }

    pub fn load_notifications(&self) -> usize {
        self.lock().load_notifications
    }

    pub fn error(&self) -> Option<StoreError> {
        self.lock().error.clone()
    }

    /// Resolves once the array is loaded.
    pub async fn loaded(&self) {
        let mut rx = self.loaded_tx.subscribe();
        let _ = rx.wait_for(|loaded| *loaded).await;
    }

    /// Append when absent. Existing members never move.
    pub(crate) fn add(&self, record: &RecordRef) -> bool {
        let mut state = self.lock();
        if !state.members.insert(record.client_id()) {
            return false;
        }
        state.content.push_back(record.clone());
        true
    }

    pub(crate) fn remove(&self, record: &RecordRef) -> bool {
        let notify = {
            let mut state = self.lock();
            if !state.members.remove(&record.client_id()) {
                return false;
            }
            state.content.retain(|member| !Arc::ptr_eq(member, record));
            state.pending.remove(&record.client_id()) && state.pending.is_empty()
        };
        if notify {
            self.mark_loaded();
        }
        true
    }

    pub(crate) fn replace_content(&self, records: Vec<RecordRef>) {
        let mut state = self.lock();
        state.members = records.iter().map(|r| r.client_id()).collect();
        state.content = records.into_iter().collect();
    }

    pub(crate) fn set_updating(&self, updating: bool) {
        self.lock().is_updating = updating;
    }

    pub(crate) fn set_error(&self, error: Option<StoreError>) {
        self.lock().error = error;
    }

    pub(crate) fn set_pending(&self, pending: HashSet<ClientId>) {
        self.lock().pending = pending;
    }

    /// Flip to loaded. Only the first call notifies.
    pub(crate) fn mark_loaded(&self) -> bool {
        {
            let mut state = self.lock();
            if state.is_loaded {
                return false;
            }
            state.is_loaded = true;
            state.load_notifications += 1;
        }
        self.loaded_tx.send_replace(true);
        true
    }

    /// A pending member received data. Returns true if that completed the array.
    pub(crate) fn member_loaded(&self, client_id: ClientId) -> bool {
        let complete = {
            let mut state = self.lock();
            state.pending.remove(&client_id) && state.pending.is_empty()
        };
        complete && self.mark_loaded()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}

impl fmt::Debug for RecordArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("RecordArray")
            .field("id", &self.id)
            .field("type", &self.entity_type)
            .field("kind", &self.kind)
            .field("len", &state.content.len())
            .field("is_loaded", &state.is_loaded)
            .field("is_updating", &state.is_updating)
            .finish()
    }
}
