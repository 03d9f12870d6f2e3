// Read side of the store.
//
// Every outstanding single-record fetch is a shared future keyed by
// (type, id). A second request for the same record while the first is in
// flight gets a clone of that future, so the adapter is asked once.

use super::Store;
use crate::adapter::{AdapterPayload, RegisteredAdapter};
use crate::core::{EntityType, RelationshipDescriptor, Result, StoreError};
use crate::identity::{AsIdentifier, ClientId, RecordId, coerce};
use crate::record::{Record, RecordRef};
use crate::record_array::RecordArrayRef;
use crate::serializer::ID_KEY;
use futures::FutureExt;
use futures::future::{self, BoxFuture, Shared};
use log::{debug, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use tokio::runtime::Handle;

/// Resolves to the record once its data is loaded. Clone freely.
pub type RecordFuture = Shared<BoxFuture<'static, Result<RecordRef>>>;

type BatchFuture = Shared<BoxFuture<'static, Result<Vec<RecordRef>>>>;

type FetchKey = (EntityType, RecordId);

/// Outstanding fetches, tagged with the client id they were started for so
/// a record materialized later under the same id never inherits a stale one.
#[derive(Default)]
pub(crate) struct InFlightFetches {
    entries: HashMap<FetchKey, (ClientId, RecordFuture)>,
}

impl InFlightFetches {
    pub(crate) fn get(&self, key: &FetchKey, client_id: ClientId) -> Option<RecordFuture> {
        self.entries
            .get(key)
            .filter(|(owner, _)| *owner == client_id)
            .map(|(_, future)| future.clone())
    }

    pub(crate) fn insert(&mut self, key: FetchKey, client_id: ClientId, future: RecordFuture) {
        self.entries.insert(key, (client_id, future));
    }

    /// Drop the entry if it still belongs to `client_id`.
    pub(crate) fn forget(&mut self, key: &FetchKey, client_id: ClientId) -> bool {
        let owned = self
            .entries
            .get(key)
            .is_some_and(|(owner, _)| *owner == client_id);
        if owned {
            self.entries.remove(key);
        }
        owned
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

fn ready(result: Result<RecordRef>) -> RecordFuture {
    future::ready(result).boxed().shared()
}

fn require_runtime(operation: &str) -> Result<Handle> {
    Handle::try_current()
        .map_err(|_| StoreError::NoRuntime(format!("{} needs a Tokio runtime", operation)))
}

/// Poll a future to completion in the background when a runtime is present.
fn drive<F>(future: F) -> bool
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
            true
        }
        Err(_) => false,
    }
}

impl Store {
    // ------------------------------------------------------------------
    // Single records
    // ------------------------------------------------------------------

    /// Fetch one record, returning the cached record when it is loaded.
    ///
    /// Concurrent calls for the same unloaded record share one adapter
    /// request. Without a runtime the fetch runs when the future is polled.
    pub fn find_by_id(
        &self,
        entity_type: impl Into<EntityType>,
        id: impl AsIdentifier,
    ) -> Result<RecordFuture> {
        let entity_type = entity_type.into();
        let id = id.coerce().ok_or_else(|| {
            StoreError::InvalidPayload(format!("find_by_id on {} without an identifier", entity_type))
        })?;
        let registered = self.adapter_for(&entity_type)?;

        let mut state = self.state()?;
        let record = state.record_for_id(&entity_type, id.clone());
        if record.is_loaded() {
            return Ok(ready(Ok(record)));
        }
        let key = (entity_type.clone(), id.clone());
        if let Some(existing) = state.fetches.get(&key, record.client_id()) {
            return Ok(existing);
        }

        record.loading_data()?;
        let future = self.fetch_record(registered, record.clone(), entity_type, id);
        state.fetches.insert(key, record.client_id(), future.clone());
        drop(state);

        drive(future.clone());
        Ok(future)
    }

    fn fetch_record(
        &self,
        registered: RegisteredAdapter,
        record: RecordRef,
        entity_type: EntityType,
        id: RecordId,
    ) -> RecordFuture {
        let store = self.clone();
        async move {
            let result = registered.adapter().find(&store, &entity_type, &id).await;
            store.finish_fetch(&entity_type, &id, &record, result)
        }
        .boxed()
        .shared()
    }

    fn finish_fetch(
        &self,
        entity_type: &EntityType,
        id: &RecordId,
        record: &RecordRef,
        result: Result<Value>,
    ) -> Result<RecordRef> {
        let serializer = self.serializer_for(entity_type);
        let mut state = self.state()?;
        state
            .fetches
            .forget(&(entity_type.clone(), id.clone()), record.client_id());

        if record.is_unloaded() {
            debug!("discarding fetched data for unloaded {}", record);
            return Err(StoreError::Unloaded(record.to_string()));
        }

        let data = result
            .and_then(|raw| serializer?.deserialize(entity_type, raw))
            .map_err(|err| {
                record.fetch_did_fail();
                warn!("fetching {} failed: {}", record, err);
                err.into_fetch_failure()
            })?;

        let mut data = data;
        data.remove(ID_KEY);
        self.load_into(&mut state, record, data);
        Ok(record.clone())
    }

    /// Re-fetch a loaded, clean record. Shares an existing in-flight fetch.
    pub fn reload_record(&self, record: &RecordRef) -> Result<RecordFuture> {
        if record.is_unloaded() {
            return Err(StoreError::Unloaded(record.to_string()));
        }
        if !record.is_loaded() || record.is_dirty() {
            return Err(StoreError::InvalidState(format!(
                "cannot reload {} while in state {}",
                record,
                record.state()
            )));
        }
        let id = record.id().ok_or_else(|| {
            StoreError::InvalidState(format!("cannot reload {} without an id", record))
        })?;
        let entity_type = record.entity_type().clone();
        let registered = self.adapter_for(&entity_type)?;

        let mut state = self.state()?;
        let key = (entity_type.clone(), id.clone());
        if let Some(existing) = state.fetches.get(&key, record.client_id()) {
            return Ok(existing);
        }
        record.set_reloading(true);
        let future = self.fetch_record(registered, record.clone(), entity_type, id);
        state.fetches.insert(key, record.client_id(), future.clone());
        drop(state);

        drive(future.clone());
        Ok(future)
    }

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    /// Load every empty record in `records`, one adapter call per type.
    ///
    /// Each fetched record also gets its own shared future, so a
    /// `find_by_id` issued meanwhile joins the batch instead of
    /// refetching. Resolves in input order.
    pub fn find_many(
        &self,
        records: &[RecordRef],
        owner: Option<&RecordRef>,
    ) -> Result<BoxFuture<'static, Result<Vec<RecordRef>>>> {
        if records.is_empty() {
            return Ok(future::ready(Ok(Vec::new())).boxed());
        }

        let mut adapters: HashMap<EntityType, RegisteredAdapter> = HashMap::new();
        for record in records {
            let entity_type = record.entity_type();
            if !adapters.contains_key(entity_type) {
                adapters.insert(entity_type.clone(), self.adapter_for(entity_type)?);
            }
        }

        // No record leaves Empty unless every one of them can be fetched.
        if let Some(record) = records.iter().find(|r| r.is_empty() && r.id().is_none()) {
            return Err(StoreError::InvalidState(format!(
                "cannot fetch {} without an id",
                record
            )));
        }

        let mut state = self.state()?;
        let mut slots: Vec<Option<RecordFuture>> = vec![None; records.len()];
        let mut groups: Vec<(EntityType, Vec<(usize, RecordRef)>)> = Vec::new();

        for (index, record) in records.iter().enumerate() {
            if record.is_unloaded() {
                slots[index] = Some(ready(Err(StoreError::Unloaded(record.to_string()))));
                continue;
            }
            let Some(id) = record.id() else {
                slots[index] = Some(ready(Ok(record.clone())));
                continue;
            };
            let key = (record.entity_type().clone(), id);
            let grouped = groups
                .iter_mut()
                .find(|(ty, _)| ty == record.entity_type())
                .filter(|(_, members)| {
                    members.iter().any(|(_, m)| m.client_id() == record.client_id())
                });

            if let Some(existing) = state.fetches.get(&key, record.client_id()) {
                slots[index] = Some(existing);
            } else if let Some((_, members)) = grouped {
                // listed twice: share the first slot's batch
                members.push((index, record.clone()));
            } else if record.is_empty() {
                record.loading_data()?;
                match groups.iter_mut().find(|(ty, _)| ty == record.entity_type()) {
                    Some((_, members)) => members.push((index, record.clone())),
                    None => groups.push((record.entity_type().clone(), vec![(index, record.clone())])),
                }
            } else {
                slots[index] = Some(ready(Ok(record.clone())));
            }
        }

        let mut batches = Vec::with_capacity(groups.len());
        for (entity_type, members) in groups {
            let Some(registered) = adapters.get(&entity_type).cloned() else {
                continue;
            };
            let mut batch_records: Vec<RecordRef> = Vec::with_capacity(members.len());
            for (_, record) in &members {
                if !batch_records.iter().any(|r| r.client_id() == record.client_id()) {
                    batch_records.push(record.clone());
                }
            }
            let batch = self.fetch_batch(registered, entity_type.clone(), batch_records, owner.cloned());

            for (index, record) in members {
                let member = record.clone();
                let per_record: RecordFuture = batch
                    .clone()
                    .map(move |result| {
                        result?;
                        if member.is_unloaded() {
                            Err(StoreError::Unloaded(member.to_string()))
                        } else if member.is_loaded() {
                            Ok(member)
                        } else {
                            Err(StoreError::FetchFailed(format!(
                                "{} was not returned by the adapter",
                                member
                            )))
                        }
                    })
                    .boxed()
                    .shared();
                if let Some(id) = record.id() {
                    state
                        .fetches
                        .insert((entity_type.clone(), id), record.client_id(), per_record.clone());
                }
                slots[index] = Some(per_record);
            }
            batches.push(batch);
        }
        drop(state);

        for batch in batches {
            drive(batch);
        }

        let waits: Vec<RecordFuture> = slots.into_iter().flatten().collect();
        Ok(future::try_join_all(waits).boxed())
    }

    fn fetch_batch(
        &self,
        registered: RegisteredAdapter,
        entity_type: EntityType,
        members: Vec<RecordRef>,
        owner: Option<RecordRef>,
    ) -> BatchFuture {
        let store = self.clone();
        async move {
            let ids: Vec<RecordId> = members.iter().filter_map(|record| record.id()).collect();
            debug!("batch fetching {} {} records", ids.len(), entity_type);
            let result = registered
                .adapter()
                .find_many(&store, &entity_type, &ids, owner.as_ref())
                .await;
            store.finish_batch(&entity_type, &members, result)
        }
        .boxed()
        .shared()
    }

    fn finish_batch(
        &self,
        entity_type: &EntityType,
        members: &[RecordRef],
        result: Result<AdapterPayload>,
    ) -> Result<Vec<RecordRef>> {
        let serializer = self.serializer_for(entity_type);
        let mut state = self.state()?;
        for member in members {
            if let Some(id) = member.id() {
                state
                    .fetches
                    .forget(&(entity_type.clone(), id), member.client_id());
            }
        }

        let (payload, serializer) = match result.and_then(|payload| Ok((payload, serializer?))) {
            Ok(pair) => pair,
            Err(err) => {
                warn!("batch fetch of {} failed: {}", entity_type, err);
                for member in members {
                    member.fetch_did_fail();
                }
                return Err(err.into_fetch_failure());
            }
        };

        if let Some(meta) = payload.meta {
            state.type_map_mut(entity_type).merge_metadata(meta);
        }

        let by_id: HashMap<RecordId, &RecordRef> = members
            .iter()
            .filter_map(|member| member.id().map(|id| (id, member)))
            .collect();
        let mut loaded = Vec::new();
        for raw in payload.records {
            let mut data = match serializer.deserialize(entity_type, raw) {
                Ok(data) => data,
                Err(err) => {
                    warn!("skipping malformed {} in batch: {}", entity_type, err);
                    continue;
                }
            };
            let Some(id) = data.remove(ID_KEY).and_then(coerce) else {
                continue;
            };
            match by_id.get(&id) {
                Some(member) if member.is_unloaded() => {
                    debug!("discarding batch data for unloaded {}", member);
                }
                Some(member) => {
                    self.load_into(&mut state, member, data);
                    loaded.push((*member).clone());
                }
                None => {
                    let record = state.record_for_id(entity_type, id);
                    self.load_into(&mut state, &record, data);
                }
            }
        }

        for member in members {
            if member.is_loading() {
                member.fetch_did_fail();
            }
        }
        Ok(loaded)
    }

    /// Many-array over `ids`, loaded once every member has data.
    pub fn find_many_by_ids<I>(
        &self,
        entity_type: impl Into<EntityType>,
        ids: I,
        owner: Option<&RecordRef>,
    ) -> Result<RecordArrayRef>
    where
        I: IntoIterator,
        I::Item: AsIdentifier,
    {
        let entity_type = entity_type.into();
        require_runtime("find_many_by_ids")?;
        self.adapter_for(&entity_type)?;

        let (array, records) = {
            let mut guard = self.state()?;
            let state = &mut *guard;
            let records: Vec<RecordRef> = ids
                .into_iter()
                .filter_map(|id| id.coerce())
                .map(|id| state.record_for_id(&entity_type, id))
                .collect();
            let array =
                state
                    .arrays
                    .create_many_array(&entity_type, records.clone(), owner.cloned(), None);
            (array, records)
        };

        let fetch = self.find_many(&records, owner)?;
        let tracked = array.clone();
        drive(async move {
            if let Err(err) = fetch.await {
                warn!("loading many-array {} failed: {}", tracked.array_id(), err);
                tracked.set_error(Some(err));
            }
        });
        Ok(array)
    }

    // ------------------------------------------------------------------
    // Relationships
    // ------------------------------------------------------------------

    /// Follow a to-many link. The adapter fills the array via `load_has_many`.
    pub fn find_has_many(
        &self,
        owner: &RecordRef,
        link: &str,
        relationship: &RelationshipDescriptor,
    ) -> Result<RecordArrayRef> {
        self.state()?.ensure_type(&relationship.target)?;
        let registered = self.adapter_for(owner.entity_type())?;
        let array = self.state()?.arrays.create_link_array(
            &relationship.target,
            owner.clone(),
            link.to_string(),
        );
        registered
            .adapter()
            .find_has_many(self, owner, link, relationship, &array);
        Ok(array)
    }

    /// Fill a link array with the adapter's response and mark it loaded.
    pub fn load_has_many(
        &self,
        array: &RecordArrayRef,
        payload: AdapterPayload,
    ) -> Result<Vec<RecordRef>> {
        let entity_type = array.entity_type().clone();
        if let Some(meta) = payload.meta {
            self.set_metadata_for(&entity_type, meta)?;
        }
        let records = self.push_many(&entity_type, payload.records)?;
        array.replace_content(records.clone());
        array.set_error(None);
        array.mark_loaded();
        Ok(records)
    }

    /// Record a failed link fetch on the array.
    pub fn has_many_did_fail(&self, array: &RecordArrayRef, error: StoreError) {
        warn!("link fetch for array {} failed: {}", array.array_id(), error);
        array.set_error(Some(error.into_fetch_failure()));
    }

    /// Follow a to-one link; requires an adapter that declares `finds_belongs_to`.
    pub fn find_belongs_to(
        &self,
        owner: &RecordRef,
        link: &str,
        relationship: &RelationshipDescriptor,
    ) -> Result<RecordFuture> {
        self.state()?.ensure_type(&relationship.target)?;
        let registered = self.adapter_for(owner.entity_type())?;
        if !registered.capabilities().finds_belongs_to {
            return Ok(ready(Err(StoreError::FetchFailed(format!(
                "adapter for {} does not follow belongs-to links",
                owner.entity_type()
            )))));
        }

        let store = self.clone();
        let owner = owner.clone();
        let link = link.to_string();
        let relationship = relationship.clone();
        let future: RecordFuture = async move {
            let raw = registered
                .adapter()
                .find_belongs_to(&store, &owner, &link, &relationship)
                .await
                .map_err(StoreError::into_fetch_failure)?;
            store.push(&relationship.target, raw)
        }
        .boxed()
        .shared();

        drive(future.clone());
        Ok(future)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Adapter-populated array for an opaque query.
    pub fn find_query(&self, entity_type: impl Into<EntityType>, query: Value) -> Result<RecordArrayRef> {
        let entity_type = entity_type.into();
        let handle = require_runtime("find_query")?;
        let registered = self.adapter_for(&entity_type)?;
        let array = self
            .state()?
            .arrays
            .create_adapter_populated(&entity_type, query.clone());

        let store = self.clone();
        let target = array.clone();
        handle.spawn(async move {
            let result = registered
                .adapter()
                .find_query(&store, &entity_type, &query)
                .await;
            store.finish_query(&entity_type, &target, result);
        });
        Ok(array)
    }

    fn finish_query(&self, entity_type: &EntityType, array: &RecordArrayRef, result: Result<AdapterPayload>) {
        let loaded = result.and_then(|payload| {
            if let Some(meta) = payload.meta {
                self.set_metadata_for(entity_type, meta)?;
            }
            self.push_many(entity_type, payload.records)
        });
        match loaded {
            Ok(records) => {
                array.replace_content(records);
                array.mark_loaded();
            }
            Err(err) => {
                warn!("query on {} failed: {}", entity_type, err);
                array.set_error(Some(err.into_fetch_failure()));
            }
        }
    }

    /// Live filtered array, plus a query asking the backend for matches.
    pub fn filter_query<F>(
        &self,
        entity_type: impl Into<EntityType>,
        query: Value,
        predicate: F,
    ) -> Result<RecordArrayRef>
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        let entity_type = entity_type.into();
        require_runtime("filter_query")?;
        let array = self.filter(&entity_type, predicate)?;
        self.find_query(entity_type, query)?;
        Ok(array)
    }

    /// Refresh the type's "all" array from the adapter.
    ///
    /// Returns the array right away; a refresh already running is not
    /// started twice.
    pub fn find_all(&self, entity_type: impl Into<EntityType>) -> Result<RecordArrayRef> {
        let entity_type = entity_type.into();
        let handle = require_runtime("find_all")?;
        let registered = self.adapter_for(&entity_type)?;
        let array = self.all(&entity_type)?;

        let since = {
            let mut state = self.state()?;
            if array.is_updating() {
                return Ok(array);
            }
            array.set_updating(true);
            state.type_map_mut(&entity_type).since_token()
        };

        let store = self.clone();
        handle.spawn(async move {
            let result = registered
                .adapter()
                .find_all(&store, &entity_type, since.as_ref())
                .await;
            store.finish_find_all(&entity_type, result);
        });
        Ok(array)
    }

    fn finish_find_all(&self, entity_type: &EntityType, result: Result<AdapterPayload>) {
        let loaded = result.and_then(|payload| {
            if let Some(meta) = payload.meta {
                self.set_metadata_for(entity_type, meta)?;
            }
            self.push_many(entity_type, payload.records)
        });
        if let Err(err) = &loaded {
            warn!("find_all on {} failed: {}", entity_type, err);
            if let Ok(array) = self.all(entity_type) {
                array.set_error(Some(err.clone().into_fetch_failure()));
            }
        }
        if let Err(err) = self.did_update_all(entity_type) {
            debug!("could not settle find_all on {}: {}", entity_type, err);
        }
    }

    /// Clear the "all" array's updating flag.
    pub fn did_update_all(&self, entity_type: impl Into<EntityType>) -> Result<()> {
        let array = self.all(entity_type)?;
        array.set_updating(false);
        Ok(())
    }

    /// Number of outstanding single-record fetches.
    pub fn pending_fetches(&self) -> Result<usize> {
        Ok(self.state()?.fetches.len())
    }
}
