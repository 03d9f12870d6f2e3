// ============================================================================
// Adapter Boundary
// ============================================================================
//
// An Adapter performs the actual I/O for one or more entity types. Reads
// are async and return data; commits are fire-and-forget and report back
// through the store's acknowledgement calls (`did_save_record`,
// `record_was_invalid`, `record_was_error`, `did_receive_id`, ...).
//
// Optional hooks are declared up front through `AdapterCapabilities`,
// read once when the adapter is registered.
//
// ============================================================================

pub mod memory;

use crate::core::{Attributes, EntityType, RelationshipDescriptor, Result, StoreError};
use crate::identity::{ClientId, RecordId};
use crate::record::RecordRef;
use crate::record_array::RecordArrayRef;
use crate::relationship::RelationshipChange;
use crate::store::Store;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

pub use memory::{AdapterCallLog, CommitOutcome, MemoryAdapter};

/// Multi-record adapter response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterPayload {
    pub records: Vec<Value>,
    /// Merged into the type's metadata (e.g. a new `since` token)
    pub meta: Option<Attributes>,
}

impl AdapterPayload {
    pub fn new(records: Vec<Value>) -> Self {
        Self {
            records,
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: Attributes) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Optional adapter behaviour, declared once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterCapabilities {
    pub generates_ids: bool,
    pub finds_belongs_to: bool,
    pub dirties_on_attribute_change: bool,
    pub dirties_on_belongs_to_change: bool,
    pub dirties_on_has_many_change: bool,
}

impl AdapterCapabilities {
    pub fn generates_ids(mut self) -> Self {
        self.generates_ids = true;
        self
    }

    pub fn finds_belongs_to(mut self) -> Self {
        self.finds_belongs_to = true;
        self
    }

    pub fn dirties_on_attribute_change(mut self) -> Self {
        self.dirties_on_attribute_change = true;
        self
    }

    pub fn dirties_on_belongs_to_change(mut self) -> Self {
        self.dirties_on_belongs_to_change = true;
        self
    }

    pub fn dirties_on_has_many_change(mut self) -> Self {
        self.dirties_on_has_many_change = true;
        self
    }
}

/// Records an adapter hook wants marked dirty. Deduplicated by client id.
#[derive(Debug, Default)]
pub struct DirtySet {
    records: Vec<RecordRef>,
    seen: HashSet<ClientId>,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: &RecordRef) -> bool {
        if !self.seen.insert(record.client_id()) {
            return false;
        }
        self.records.push(record.clone());
        true
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<RecordRef> {
        self.records
    }
}

#[async_trait]
pub trait Adapter: Send + Sync {
    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
    }

    async fn find(&self, store: &Store, entity_type: &EntityType, id: &RecordId) -> Result<Value>;

    async fn find_many(
        &self,
        store: &Store,
        entity_type: &EntityType,
        ids: &[RecordId],
        owner: Option<&RecordRef>,
    ) -> Result<AdapterPayload>;

    async fn find_all(
        &self,
        store: &Store,
        entity_type: &EntityType,
        since: Option<&Value>,
    ) -> Result<AdapterPayload>;

    /// `query` is passed through untouched.
    async fn find_query(
        &self,
        store: &Store,
        entity_type: &EntityType,
        query: &Value,
    ) -> Result<AdapterPayload>;

    async fn find_belongs_to(
        &self,
        _store: &Store,
        owner: &RecordRef,
        link: &str,
        relationship: &RelationshipDescriptor,
    ) -> Result<Value> {
        Err(StoreError::FetchFailed(format!(
            "adapter cannot follow link '{}' for {}.{}",
            link, owner, relationship.name
        )))
    }

    /// Fill `array` later through `Store::load_has_many`.
    fn find_has_many(
        &self,
        store: &Store,
        owner: &RecordRef,
        link: &str,
        relationship: &RelationshipDescriptor,
        array: &RecordArrayRef,
    );

    fn create_record(&self, store: &Store, entity_type: &EntityType, record: &RecordRef);

    fn update_record(&self, store: &Store, entity_type: &EntityType, record: &RecordRef);

    fn delete_record(&self, store: &Store, entity_type: &EntityType, record: &RecordRef);

    /// Only consulted when `capabilities().generates_ids` is set.
    fn generate_id_for_record(&self, _store: &Store, _entity_type: &EntityType) -> Option<RecordId> {
        None
    }

    fn dirty_records_for_attribute_change(
        &self,
        _store: &Store,
        _dirty: &mut DirtySet,
        _record: &RecordRef,
        _attribute: &str,
    ) {
    }

    fn dirty_records_for_belongs_to_change(
        &self,
        _store: &Store,
        _dirty: &mut DirtySet,
        _child: &RecordRef,
        _change: &RelationshipChange,
    ) {
    }

    fn dirty_records_for_has_many_change(
        &self,
        _store: &Store,
        _dirty: &mut DirtySet,
        _parent: &RecordRef,
        _change: &RelationshipChange,
    ) {
    }
}

/// An adapter together with the capabilities it declared at registration.
#[derive(Clone)]
pub struct RegisteredAdapter {
    adapter: Arc<dyn Adapter>,
    capabilities: AdapterCapabilities,
}

impl RegisteredAdapter {
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        let capabilities = adapter.capabilities();
        Self {
            adapter,
            capabilities,
        }
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    pub fn capabilities(&self) -> AdapterCapabilities {
        self.capabilities
    }
}
