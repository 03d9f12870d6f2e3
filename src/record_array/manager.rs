use super::{RecordArray, RecordArrayKind, RecordArrayRef};
use crate::core::EntityType;
use crate::identity::ClientId;
use crate::record::{Record, RecordRef};
use crate::type_map::TypeRegistry;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

/// Membership test for filtered arrays.
pub type Predicate = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// Loaded and not deleted.
pub fn default_predicate() -> Predicate {
    Arc::new(|record: &Record| record.is_loaded() && !record.is_deleted())
}

struct FilteredEntry {
    array: RecordArrayRef,
    predicate: Predicate,
}

/// Keeps every live array consistent with record state.
///
/// Change notifications are queued per record and applied in one pass per
/// tick, so a record edited ten times in a tick is evaluated once.
#[derive(Default)]
pub struct RecordArrayManager {
    next_array_id: u64,
    filtered: TypeRegistry<Vec<FilteredEntry>>,
    /// Adapter-populated and many arrays; they live as long as their callers hold them
    populated: TypeRegistry<Vec<Weak<RecordArray>>>,
    waiting: HashMap<ClientId, Vec<Weak<RecordArray>>>,
    changed: Vec<RecordRef>,
    changed_ids: HashSet<ClientId>,
}

impl RecordArrayManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self, entity_type: &EntityType, kind: RecordArrayKind) -> RecordArray {
        self.next_array_id += 1;
        RecordArray::new(self.next_array_id, entity_type.clone(), kind)
    }

    /// Build an array that membership will be computed for.
    pub fn create_filtered(&mut self, entity_type: &EntityType, kind: RecordArrayKind) -> RecordArrayRef {
        let array = Arc::new(self.allocate(entity_type, kind));
        array.mark_loaded();
        array
    }

    /// Subscribe the array to change events for its type and seed it once.
    pub fn register_filtered(
        &mut self,
        array: RecordArrayRef,
        records: &[RecordRef],
        predicate: Option<Predicate>,
    ) {
        let predicate = predicate.unwrap_or_else(default_predicate);
        for record in records {
            if !record.is_unloaded() && predicate(record) {
                array.add(record);
            }
        }
        let entity_type = array.entity_type().clone();
        self.filtered
            .get_or_insert_with(&entity_type, Vec::new)
            .push(FilteredEntry { array, predicate });
    }

    pub fn create_adapter_populated(&mut self, entity_type: &EntityType, query: Value) -> RecordArrayRef {
        let array = Arc::new(
            self.allocate(entity_type, RecordArrayKind::AdapterPopulated)
                .with_query(query),
        );
        self.track_populated(&array);
        array
    }

    /// Backing array of a to-many relationship.
    ///
    /// Members without data are counted as outstanding; the array becomes
    /// loaded, and notifies once, when the last of them lands.
    pub fn create_many_array(
        &mut self,
        entity_type: &EntityType,
        records: Vec<RecordRef>,
        owner: Option<RecordRef>,
        link: Option<String>,
    ) -> RecordArrayRef {
        let array = Arc::new(
            self.allocate(entity_type, RecordArrayKind::Many)
                .with_owner(owner, link),
        );
        let pending: HashSet<ClientId> = records
            .iter()
            .filter(|record| !record.is_loaded())
            .map(|record| record.client_id())
            .collect();
        array.replace_content(records);

        if pending.is_empty() {
            array.mark_loaded();
        } else {
            for client_id in &pending {
                self.waiting
                    .entry(*client_id)
                    .or_default()
                    .push(Arc::downgrade(&array));
            }
            array.set_pending(pending);
        }
        self.track_populated(&array);
        array
    }

    /// Many-array for a link fetch: empty until the adapter fills it.
    pub fn create_link_array(
        &mut self,
        entity_type: &EntityType,
        owner: RecordRef,
        link: String,
    ) -> RecordArrayRef {
        let array = Arc::new(
            self.allocate(entity_type, RecordArrayKind::Many)
                .with_owner(Some(owner), Some(link)),
        );
        self.track_populated(&array);
        array
    }

    fn track_populated(&mut self, array: &RecordArrayRef) {
        let entries = self
            .populated
            .get_or_insert_with(array.entity_type(), Vec::new);
        entries.retain(|weak| weak.strong_count() > 0);
        entries.push(Arc::downgrade(array));
    }

    /// Queue a re-evaluation. Returns true the first time in a tick.
    pub fn record_did_change(&mut self, record: &RecordRef) -> bool {
        if !self.changed_ids.insert(record.client_id()) {
            return false;
        }
        self.changed.push(record.clone());
        true
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    /// Apply every queued change. Returns the number of records evaluated.
    pub fn flush_changes(&mut self) -> usize {
        let changed = std::mem::take(&mut self.changed);
        self.changed_ids.clear();
        let mut evaluated = 0;
        for record in &changed {
            if record.is_unloaded() {
                continue;
            }
            self.update_record_arrays(record);
            evaluated += 1;
        }
        evaluated
    }

    fn update_record_arrays(&self, record: &RecordRef) {
        let Some(entries) = self.filtered.get(record.entity_type()) else {
            return;
        };
        for entry in entries {
            if (entry.predicate)(record) {
                entry.array.add(record);
            } else {
                entry.array.remove(record);
            }
        }
    }

    /// Data landed for a record; settle many-arrays waiting on it.
    pub fn record_loaded(&mut self, record: &RecordRef) {
        if let Some(arrays) = self.waiting.remove(&record.client_id()) {
            for array in arrays.iter().filter_map(Weak::upgrade) {
                array.member_loaded(record.client_id());
            }
        }
    }

    /// Remove a dematerializing record from every array that holds it.
    pub fn remove_from_all(&mut self, record: &RecordRef) {
        let entity_type = record.entity_type();
        if let Some(entries) = self.filtered.get(entity_type) {
            for entry in entries {
                entry.array.remove(record);
            }
        }
        if let Some(entries) = self.populated.get_mut(entity_type) {
            entries.retain(|weak| weak.strong_count() > 0);
            for array in entries.iter().filter_map(Weak::upgrade) {
                array.remove(record);
            }
        }
        self.waiting.remove(&record.client_id());
        if self.changed_ids.remove(&record.client_id()) {
            self.changed
                .retain(|queued| queued.client_id() != record.client_id());
        }
    }

    pub fn filtered_count(&self, entity_type: &EntityType) -> usize {
        self.filtered.get(entity_type).map_or(0, Vec::len)
    }

    pub fn clear(&mut self) {
        self.filtered.clear();
        self.populated.clear();
        self.waiting.clear();
        self.changed.clear();
        self.changed_ids.clear();
    }
}
