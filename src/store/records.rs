use super::{Store, StoreState};
use crate::adapter::DirtySet;
use crate::core::{Attributes, EntityType, RelationshipKind, Result, StoreError};
use crate::identity::{AsIdentifier, ClientId, RecordId, coerce};
use crate::record::{Record, RecordRef};
use crate::record_array::{RecordArrayKind, RecordArrayRef};
use crate::relationship::{ChangeKind, RelationKey, RelationshipChange};
use crate::scheduler::TickTask;
use crate::serializer::{ID_KEY, SerializeOptions};
use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;

fn ensure_live(record: &RecordRef) -> Result<()> {
    if record.is_unloaded() {
        return Err(StoreError::Unloaded(record.to_string()));
    }
    Ok(())
}

fn into_attributes(entity_type: &EntityType, value: Value) -> Result<Attributes> {
    match value {
        Value::Object(object) => Ok(object),
        Value::Null => Ok(Attributes::new()),
        other => Err(StoreError::InvalidPayload(format!(
            "{} properties must be an object, got {}",
            entity_type, other
        ))),
    }
}

fn take_id(entity_type: &EntityType, data: &mut Attributes) -> Result<RecordId> {
    data.remove(ID_KEY).and_then(coerce).ok_or_else(|| {
        StoreError::InvalidPayload(format!("{} data has no usable '{}'", entity_type, ID_KEY))
    })
}

impl Store {
    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// The one record for (type, id); an empty shell is materialized on a miss.
    pub fn record_for_id(
        &self,
        entity_type: impl Into<EntityType>,
        id: impl AsIdentifier,
    ) -> Result<RecordRef> {
        let entity_type = entity_type.into();
        let id = id.coerce().ok_or_else(|| {
            StoreError::InvalidPayload(format!("no usable identifier for {}", entity_type))
        })?;
        let mut state = self.state()?;
        state.ensure_type(&entity_type)?;
        Ok(state.record_for_id(&entity_type, id))
    }

    /// Cache-only lookup; never materializes.
    pub fn get_by_id(
        &self,
        entity_type: impl Into<EntityType>,
        id: impl AsIdentifier,
    ) -> Result<Option<RecordRef>> {
        let entity_type = entity_type.into();
        let state = self.state()?;
        state.ensure_type(&entity_type)?;
        Ok(id.coerce().and_then(|id| state.lookup(&entity_type, &id)))
    }

    pub fn has_record_for_id(
        &self,
        entity_type: impl Into<EntityType>,
        id: impl AsIdentifier,
    ) -> Result<bool> {
        Ok(self.get_by_id(entity_type, id)?.is_some())
    }

    /// True only when the record is mapped and has data.
    pub fn record_is_loaded(
        &self,
        entity_type: impl Into<EntityType>,
        id: impl AsIdentifier,
    ) -> Result<bool> {
        Ok(self
            .get_by_id(entity_type, id)?
            .is_some_and(|record| record.is_loaded()))
    }

    pub fn record_for_client_id(&self, client_id: ClientId) -> Result<Option<RecordRef>> {
        Ok(self.state()?.identity.record_for_client_id(client_id).cloned())
    }

    /// Every materialized record of a type, in creation order.
    pub fn records_of(&self, entity_type: impl Into<EntityType>) -> Result<Vec<RecordRef>> {
        let entity_type = entity_type.into();
        let state = self.state()?;
        state.ensure_type(&entity_type)?;
        Ok(state
            .type_maps
            .get(&entity_type)
            .map(|map| map.records().to_vec())
            .unwrap_or_default())
    }

    // ------------------------------------------------------------------
    // Local changes
    // ------------------------------------------------------------------

    /// Materialize a new, unsaved record.
    ///
    /// The id comes from `properties["id"]`, else from the adapter when it
    /// generates ids, else stays unassigned until the backend supplies one.
    pub fn create_record(
        &self,
        entity_type: impl Into<EntityType>,
        properties: Value,
    ) -> Result<RecordRef> {
        let entity_type = entity_type.into();
        self.state()?.ensure_type(&entity_type)?;
        let mut properties = into_attributes(&entity_type, properties)?;

        let mut id = properties.remove(ID_KEY).and_then(coerce);
        if id.is_none() {
            if let Ok(registered) = self.adapter_for(&entity_type) {
                if registered.capabilities().generates_ids {
                    id = registered
                        .adapter()
                        .generate_id_for_record(self, &entity_type);
                }
            }
        }

        let mut state = self.state()?;
        if let Some(id) = &id {
            if state.lookup(&entity_type, id).is_some() {
                return Err(StoreError::IdentityConflict(format!(
                    "{} '{}' already exists",
                    entity_type, id
                )));
            }
        }
        let record = state.materialize(&entity_type, id);
        record.loaded_data(properties)?;
        self.queue_change(&mut state, &record);
        debug!("created {}", record);
        Ok(record)
    }

    pub fn set_attribute(&self, record: &RecordRef, name: &str, value: Value) -> Result<()> {
        ensure_live(record)?;
        if !record.set(name, value)? {
            return Ok(());
        }

        let mut dirty = DirtySet::new();
        if let Ok(registered) = self.adapter_for(record.entity_type()) {
            if registered.capabilities().dirties_on_attribute_change {
                registered
                    .adapter()
                    .dirty_records_for_attribute_change(self, &mut dirty, record, name);
            }
        }

        let mut state = self.state()?;
        for other in dirty.into_records() {
            if !other.is_unloaded() {
                other.adapter_did_dirty();
                self.queue_change(&mut state, &other);
            }
        }
        self.queue_change(&mut state, record);
        Ok(())
    }

    /// Mark a record deleted. Saving it afterwards commits the deletion.
    pub fn delete_record(&self, record: &RecordRef) -> Result<()> {
        ensure_live(record)?;
        let needs_commit = record.delete_record()?;
        if !needs_commit {
            debug!("{} deleted before it was ever saved", record);
        }
        let mut state = self.state()?;
        self.queue_change(&mut state, record);
        Ok(())
    }

    pub fn rollback(&self, record: &RecordRef) -> Result<()> {
        ensure_live(record)?;
        record.rollback()?;
        let mut state = self.state()?;
        self.queue_change(&mut state, record);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dematerialization
    // ------------------------------------------------------------------

    /// Remove a record from the store entirely.
    ///
    /// Arrays are updated before the identity entries go away; a fetch
    /// still in flight for the record resolves with `Unloaded`.
    pub fn unload_record(&self, record: &RecordRef) -> Result<()> {
        let mut guard = self.state()?;
        if record.is_unloaded() {
            return Ok(());
        }
        let state = &mut *guard;
        let client_id = record.client_id();

        state.arrays.remove_from_all(record);
        if let Some(map) = state.type_maps.get_mut(record.entity_type()) {
            map.remove_record(record);
        }
        if let Some(id) = record.id() {
            state
                .fetches
                .forget(&(record.entity_type().clone(), id), client_id);
        }
        state
            .scheduler
            .cancel(client_id, StoreError::Unloaded(record.to_string()));
        state.ledger.take_changes_for(client_id);
        state.identity.forget(client_id);
        record.mark_unloaded();
        debug!("unloaded {}", record);
        Ok(())
    }

    /// Unload every record of a type. Returns how many were unloaded.
    pub fn unload_all(&self, entity_type: impl Into<EntityType>) -> Result<usize> {
        let records = self.records_of(entity_type)?;
        for record in &records {
            self.unload_record(record)?;
        }
        Ok(records.len())
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Apply a full payload and fan the change out to arrays.
    pub(super) fn load_into(&self, state: &mut StoreState, record: &RecordRef, data: Attributes) {
        record.setup_data(data);
        state.arrays.record_loaded(record);
        self.queue_change(state, record);
    }

    /// Ingest normalized data carrying an `id`.
    pub fn load(&self, entity_type: impl Into<EntityType>, mut data: Attributes) -> Result<RecordRef> {
        let entity_type = entity_type.into();
        let id = take_id(&entity_type, &mut data)?;
        let mut state = self.state()?;
        state.ensure_type(&entity_type)?;
        let record = state.record_for_id(&entity_type, id);
        self.load_into(&mut state, &record, data);
        Ok(record)
    }

    pub fn load_many(
        &self,
        entity_type: impl Into<EntityType>,
        data: Vec<Attributes>,
    ) -> Result<Vec<RecordRef>> {
        let entity_type = entity_type.into();
        data.into_iter()
            .map(|item| self.load(&entity_type, item))
            .collect()
    }

    /// Ingest a wire payload through the type's serializer.
    pub fn push(&self, entity_type: impl Into<EntityType>, raw: Value) -> Result<RecordRef> {
        let entity_type = entity_type.into();
        let data = self.serializer_for(&entity_type)?.deserialize(&entity_type, raw)?;
        self.load(entity_type, data)
    }

    pub fn push_many(
        &self,
        entity_type: impl Into<EntityType>,
        raws: Vec<Value>,
    ) -> Result<Vec<RecordRef>> {
        let entity_type = entity_type.into();
        let serializer = self.serializer_for(&entity_type)?;
        let data = raws
            .into_iter()
            .map(|raw| serializer.deserialize(&entity_type, raw))
            .collect::<Result<Vec<_>>>()?;
        self.load_many(entity_type, data)
    }

    /// Merge a partial wire payload into the record it identifies.
    pub fn update(&self, entity_type: impl Into<EntityType>, raw: Value) -> Result<RecordRef> {
        let entity_type = entity_type.into();
        let mut data = self.serializer_for(&entity_type)?.deserialize(&entity_type, raw)?;
        let id = take_id(&entity_type, &mut data)?;
        let mut state = self.state()?;
        let record = state.record_for_id(&entity_type, id);
        record.merge_data(data);
        state.arrays.record_loaded(&record);
        self.queue_change(&mut state, &record);
        Ok(record)
    }

    pub fn metadata_for(&self, entity_type: impl Into<EntityType>) -> Result<Attributes> {
        let entity_type = entity_type.into();
        let mut state = self.state()?;
        state.ensure_type(&entity_type)?;
        Ok(state.type_map_mut(&entity_type).metadata().clone())
    }

    pub fn set_metadata_for(&self, entity_type: impl Into<EntityType>, meta: Attributes) -> Result<()> {
        let entity_type = entity_type.into();
        let mut state = self.state()?;
        state.ensure_type(&entity_type)?;
        state.type_map_mut(&entity_type).merge_metadata(meta);
        Ok(())
    }

    pub fn serialize(&self, record: &RecordRef, options: &SerializeOptions) -> Result<Value> {
        let serializer = self.serializer_for(record.entity_type())?;
        Ok(serializer.serialize(record, options))
    }

    // ------------------------------------------------------------------
    // Live arrays
    // ------------------------------------------------------------------

    /// The type's "all" array: every loaded, non-deleted record. Created once.
    pub fn all(&self, entity_type: impl Into<EntityType>) -> Result<RecordArrayRef> {
        let entity_type = entity_type.into();
        let mut guard = self.state()?;
        guard.ensure_type(&entity_type)?;
        let state = &mut *guard;

        let type_map = state.type_map_mut(&entity_type);
        if let Some(array) = type_map.record_array() {
            return Ok(array.clone());
        }
        let records = type_map.records().to_vec();

        let array = state.arrays.create_filtered(&entity_type, RecordArrayKind::All);
        state.arrays.register_filtered(array.clone(), &records, None);
        state.type_map_mut(&entity_type).set_record_array(array.clone());
        Ok(array)
    }

    /// A live array of the records matching `predicate`.
    ///
    /// The predicate runs at tick boundaries while the store is locked and
    /// must not call back into the store.
    pub fn filter<F>(&self, entity_type: impl Into<EntityType>, predicate: F) -> Result<RecordArrayRef>
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        let entity_type = entity_type.into();
        let mut guard = self.state()?;
        guard.ensure_type(&entity_type)?;
        let state = &mut *guard;

        let records = state.type_map_mut(&entity_type).records().to_vec();
        let array = state
            .arrays
            .create_filtered(&entity_type, RecordArrayKind::Filtered);
        state
            .arrays
            .register_filtered(array.clone(), &records, Some(Arc::new(predicate)));
        Ok(array)
    }

    /// Queue a membership re-evaluation for the next tick.
    pub fn record_did_change(&self, record: &RecordRef) -> Result<()> {
        let mut state = self.state()?;
        self.queue_change(&mut state, record);
        Ok(())
    }

    pub(super) fn queue_change(&self, state: &mut StoreState, record: &RecordRef) {
        if record.is_unloaded() {
            return;
        }
        if state.arrays.record_did_change(record) {
            self.schedule(state, TickTask::RecordChanges);
        }
    }

    // ------------------------------------------------------------------
    // Relationship changes
    // ------------------------------------------------------------------

    /// Index a relationship change and dirty the records it affects.
    pub fn register_relationship_change(&self, change: RelationshipChange) -> Result<()> {
        let (child, parent) = {
            let state = self.state()?;
            let child = state
                .identity
                .record_for_client_id(change.child)
                .cloned()
                .ok_or_else(|| {
                    StoreError::InvalidState(format!("no record for {}", change.child))
                })?;
            let parent = change
                .parent
                .and_then(|parent| state.identity.record_for_client_id(parent).cloned());
            (child, parent)
        };

        let mut dirty = DirtySet::new();
        dirty.insert(&child);
        match change.relationship {
            RelationshipKind::BelongsTo => {
                if let Ok(registered) = self.adapter_for(child.entity_type()) {
                    if registered.capabilities().dirties_on_belongs_to_change {
                        registered.adapter().dirty_records_for_belongs_to_change(
                            self, &mut dirty, &child, &change,
                        );
                    }
                }
            }
            RelationshipKind::HasMany => {
                if let Some(parent) = &parent {
                    if let Ok(registered) = self.adapter_for(parent.entity_type()) {
                        if registered.capabilities().dirties_on_has_many_change {
                            registered.adapter().dirty_records_for_has_many_change(
                                self, &mut dirty, parent, &change,
                            );
                        }
                    }
                }
            }
        }

        let mut state = self.state()?;
        if let Some(replaced) = state.ledger.record(change) {
            debug!("replaced pending relationship change on {}", replaced.key.name);
        }
        for record in dirty.into_records() {
            if record.is_unloaded() {
                warn!("skipping unloaded {} while propagating dirtiness", record);
                continue;
            }
            record.adapter_did_dirty();
            self.queue_change(&mut state, &record);
        }
        Ok(())
    }

    pub fn remove_relationship_change(
        &self,
        child: ClientId,
        parent: Option<ClientId>,
        key: &RelationKey,
        kind: ChangeKind,
    ) -> Result<Option<RelationshipChange>> {
        Ok(self.state()?.ledger.remove(child, parent, key, kind))
    }

    pub fn relationship_changes_for(&self, record: &RecordRef) -> Result<Vec<RelationshipChange>> {
        Ok(self.state()?.ledger.changes_for(record.client_id()))
    }
}
