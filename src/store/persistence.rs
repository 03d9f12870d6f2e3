// Write side of the store.
//
// `schedule_save` freezes a record's changes and queues it; the queue is
// flushed once per tick, bucketed into creates, updates and deletes. The
// adapter reports back through the acknowledgement calls below, which may
// happen synchronously inside the commit hook or at any later point.
// Acknowledgements for records that have since been unloaded are ignored.

use super::{Store, StoreState};
use crate::core::{Attributes, Result, StoreError, ValidationErrors};
use crate::identity::{AsIdentifier, RecordId, coerce};
use crate::record::{CommitKind, RecordRef};
use crate::scheduler::{SaveBuckets, SaveFuture, TickTask};
use crate::serializer::ID_KEY;
use crate::type_map::TypeMap;
use log::{debug, warn};
use serde_json::Value;
use tracing::{Level, event, info_span};

fn ack_data(record: &RecordRef, data: Value) -> Result<Attributes> {
    match data {
        Value::Object(object) => Ok(object),
        other => Err(StoreError::InvalidPayload(format!(
            "acknowledgement for {} must be an object, got {}",
            record, other
        ))),
    }
}

impl Store {
    /// Queue a record for the next flush.
    ///
    /// Scheduling the same record again before the flush returns the same
    /// future; the record is handed to the adapter once.
    pub fn schedule_save(&self, record: &RecordRef) -> Result<SaveFuture> {
        if record.is_unloaded() {
            return Err(StoreError::Unloaded(record.to_string()));
        }
        self.adapter_for(record.entity_type())?;

        let mut state = self.state()?;
        if let Some(existing) = state.scheduler.queued_future(record.client_id()) {
            return Ok(existing);
        }
        let kind = record.adapter_will_commit()?;
        let future = state.scheduler.enqueue(record.clone(), kind);
        self.schedule(&mut state, TickTask::FlushSaves);
        self.queue_change(&mut state, record);
        debug!("scheduled {} of {}", kind, record);
        Ok(future)
    }

    /// Alias of `schedule_save`.
    pub fn save(&self, record: &RecordRef) -> Result<SaveFuture> {
        self.schedule_save(record)
    }

    /// Hand every queued record to its adapter. Returns the number flushed.
    pub(crate) fn flush_pending_saves(&self) -> Result<usize> {
        let saves = self.state()?.scheduler.take_queue();
        if saves.is_empty() {
            return Ok(0);
        }
        let buckets = SaveBuckets::partition(saves);
        let span = info_span!(
            "flush_pending_saves",
            created = buckets.created.len(),
            updated = buckets.updated.len(),
            deleted = buckets.deleted.len()
        );
        let _entered = span.enter();
        let total = buckets.len();

        let SaveBuckets {
            created,
            updated,
            deleted,
        } = buckets;
        for (kind, records) in [
            (CommitKind::Create, created),
            (CommitKind::Update, updated),
            (CommitKind::Delete, deleted),
        ] {
            for record in records {
                if record.is_unloaded() {
                    continue;
                }
                self.commit(kind, &record)?;
            }
        }

        event!(Level::DEBUG, total, "pending saves flushed");
        Ok(total)
    }

    fn commit(&self, kind: CommitKind, record: &RecordRef) -> Result<()> {
        let entity_type = record.entity_type();
        match self.adapter_for(entity_type) {
            Ok(registered) => {
                let adapter = registered.adapter();
                match kind {
                    CommitKind::Create => adapter.create_record(self, entity_type, record),
                    CommitKind::Update => adapter.update_record(self, entity_type, record),
                    CommitKind::Delete => adapter.delete_record(self, entity_type, record),
                }
                Ok(())
            }
            Err(StoreError::Destroyed) => Err(StoreError::Destroyed),
            Err(err) => {
                warn!("cannot commit {}: {}", record, err);
                let mut state = self.state()?;
                record.adapter_did_error()?;
                state.scheduler.resolve(record.client_id(), Err(err));
                self.queue_change(&mut state, record);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Acknowledgements
    // ------------------------------------------------------------------

    /// Whether an acknowledgement should be applied to `record`.
    fn acknowledgeable(&self, record: &RecordRef, action: &str) -> bool {
        if record.is_unloaded() {
            debug!("ignoring {} for unloaded {}", action, record);
            return false;
        }
        true
    }

    /// Assign a backend id inside an already-held state lock.
    fn assign_id(&self, state: &mut StoreState, record: &RecordRef, id: RecordId) -> Result<()> {
        let entity_type = record.entity_type();
        let type_map = state
            .type_maps
            .get_or_insert_with(entity_type, || TypeMap::new(entity_type.clone()));
        state.identity.resolve_assigned_id(type_map, record, id)
    }

    /// The backend accepted the commit.
    ///
    /// `data` is normalized (canonical `id` key) and, when given, becomes
    /// the record's saved state; it may carry the id of a newly created
    /// record.
    pub fn did_save_record(&self, record: &RecordRef, data: Option<Value>) -> Result<()> {
        if !self.acknowledgeable(record, "did_save_record") {
            return Ok(());
        }
        let mut data = data.map(|value| ack_data(record, value)).transpose()?;
        let id = data
            .as_mut()
            .and_then(|data| data.remove(ID_KEY))
            .and_then(coerce);

        let mut state = self.state()?;
        if !record.state().is_in_flight() {
            return Err(StoreError::InvalidState(format!(
                "{} has no commit in flight (state {})",
                record,
                record.state()
            )));
        }
        if let Some(id) = id {
            self.assign_id(&mut state, record, id)?;
        }
        let kind = record.adapter_did_commit(data)?;
        if kind == CommitKind::Create && record.id().is_none() {
            warn!("{} was created without receiving an id", record);
        }
        self.commit_finished(&mut state, record);
        debug!("{} {}", record, kind);
        Ok(())
    }

    /// Acknowledge several commits at once, pairing `data` by position.
    ///
    /// Every record is processed; the first failure is returned afterwards.
    pub fn did_save_records(&self, records: &[RecordRef], data: Option<Vec<Value>>) -> Result<()> {
        let data: Vec<Option<Value>> = match data {
            Some(data) if data.len() != records.len() => {
                return Err(StoreError::InvalidPayload(format!(
                    "{} acknowledgements for {} records",
                    data.len(),
                    records.len()
                )));
            }
            Some(data) => data.into_iter().map(Some).collect(),
            None => vec![None; records.len()],
        };

        let mut first_error = None;
        for (record, item) in records.iter().zip(data) {
            if let Err(err) = self.did_save_record(record, item) {
                warn!("acknowledging {} failed: {}", record, err);
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// The backend rejected the commit with per-field errors.
    pub fn record_was_invalid(&self, record: &RecordRef, errors: ValidationErrors) -> Result<()> {
        if !self.acknowledgeable(record, "record_was_invalid") {
            return Ok(());
        }
        let mut state = self.state()?;
        record.adapter_did_invalidate(errors.clone())?;
        state
            .scheduler
            .resolve(record.client_id(), Err(StoreError::ValidationRejected(errors)));
        self.queue_change(&mut state, record);
        debug!("{} rejected as invalid", record);
        Ok(())
    }

    /// The commit failed for a reason other than validation.
    pub fn record_was_error(&self, record: &RecordRef) -> Result<()> {
        if !self.acknowledgeable(record, "record_was_error") {
            return Ok(());
        }
        let mut state = self.state()?;
        let kind = record.adapter_did_error()?;
        state.scheduler.resolve(
            record.client_id(),
            Err(StoreError::CommitFailed(format!("{} of {} failed", kind, record))),
        );
        self.queue_change(&mut state, record);
        Ok(())
    }

    /// Acknowledge a single attribute of an update.
    ///
    /// The save completes once every in-flight attribute is acknowledged.
    pub fn did_update_attribute(
        &self,
        record: &RecordRef,
        name: &str,
        value: Option<Value>,
    ) -> Result<()> {
        if !self.acknowledgeable(record, "did_update_attribute") {
            return Ok(());
        }
        let mut state = self.state()?;
        if record.adapter_did_update_attribute(name, value)? {
            self.commit_finished(&mut state, record);
        }
        Ok(())
    }

    /// Acknowledge every outstanding attribute with its in-flight value.
    pub fn did_update_attributes(&self, record: &RecordRef) -> Result<()> {
        if !self.acknowledgeable(record, "did_update_attributes") {
            return Ok(());
        }
        let outstanding = record.outstanding_attributes();
        if outstanding.is_empty() {
            let mut state = self.state()?;
            record.adapter_did_commit(None)?;
            self.commit_finished(&mut state, record);
            return Ok(());
        }
        for name in outstanding {
            self.did_update_attribute(record, &name, None)?;
        }
        Ok(())
    }

    /// The backend assigned an id to a newly created record.
    pub fn did_receive_id(&self, record: &RecordRef, id: impl AsIdentifier) -> Result<()> {
        if !self.acknowledgeable(record, "did_receive_id") {
            return Ok(());
        }
        let id = id.coerce().ok_or_else(|| {
            StoreError::InvalidPayload(format!("unusable id received for {}", record))
        })?;
        let mut state = self.state()?;
        self.assign_id(&mut state, record, id)
    }

    /// Shared tail of every successful acknowledgement.
    fn commit_finished(&self, state: &mut StoreState, record: &RecordRef) {
        let settled = state.ledger.take_changes_for(record.client_id());
        if !settled.is_empty() {
            debug!("{} settled {} relationship changes", record, settled.len());
        }
        state.scheduler.resolve(record.client_id(), Ok(record.clone()));
        self.queue_change(state, record);
    }

    /// Records handed to the adapter and still waiting for acknowledgement.
    pub fn is_awaiting_ack(&self, record: &RecordRef) -> Result<bool> {
        let state = self.state()?;
        Ok(record.state().is_in_flight() && state.scheduler.is_awaiting_ack(record.client_id()))
    }

    /// Records queued for the next flush.
    pub fn pending_saves(&self) -> Result<usize> {
        Ok(self.state()?.scheduler.len())
    }
}
