// ============================================================================
// Per-Type Index Structures
// ============================================================================
//
// TypeRegistry<T> is the one type-keyed lookup used everywhere the store
// needs "something per entity type" (type maps, schemas, adapters,
// serializers). TypeMap is the identity map for a single type.
//
// ============================================================================

use crate::core::{Attributes, EntityType};
use crate::identity::RecordId;
use crate::record::RecordRef;
use crate::record_array::RecordArrayRef;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Type-keyed map with an optional fallback entry.
#[derive(Debug, Clone)]
pub struct TypeRegistry<T> {
    entries: HashMap<EntityType, T>,
    fallback: Option<T>,
}

impl<T> Default for TypeRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TypeRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            fallback: None,
        }
    }

    pub fn insert(&mut self, entity_type: EntityType, value: T) -> Option<T> {
        self.entries.insert(entity_type, value)
    }

    pub fn get(&self, entity_type: &EntityType) -> Option<&T> {
        self.entries.get(entity_type)
    }

    pub fn get_mut(&mut self, entity_type: &EntityType) -> Option<&mut T> {
        self.entries.get_mut(entity_type)
    }

    pub fn get_or_insert_with(&mut self, entity_type: &EntityType, init: impl FnOnce() -> T) -> &mut T {
        self.entries.entry(entity_type.clone()).or_insert_with(init)
    }

    /// Entry for the type, else the fallback.
    pub fn resolve(&self, entity_type: &EntityType) -> Option<&T> {
        self.entries.get(entity_type).or(self.fallback.as_ref())
    }

    pub fn set_fallback(&mut self, value: T) -> Option<T> {
        self.fallback.replace(value)
    }

    pub fn contains(&self, entity_type: &EntityType) -> bool {
        self.entries.contains_key(entity_type)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.values_mut()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.fallback = None;
    }
}

/// Identity map and bookkeeping for every record of one entity type.
#[derive(Debug)]
pub struct TypeMap {
    entity_type: EntityType,
    id_to_record: HashMap<RecordId, RecordRef>,
    /// Creation order
    records: Vec<RecordRef>,
    metadata: Attributes,
    record_array: Option<RecordArrayRef>,
}

impl TypeMap {
    pub const SINCE_KEY: &'static str = "since";

    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            id_to_record: HashMap::new(),
            records: Vec::new(),
            metadata: Attributes::new(),
            record_array: None,
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn get(&self, id: &RecordId) -> Option<&RecordRef> {
        self.id_to_record.get(id)
    }

    pub fn contains_id(&self, id: &RecordId) -> bool {
        self.id_to_record.contains_key(id)
    }

    pub(crate) fn index_id(&mut self, id: RecordId, record: RecordRef) {
        self.id_to_record.insert(id, record);
    }

    /// Append a freshly materialized record, indexing its id when it has one.
    pub(crate) fn insert_record(&mut self, record: RecordRef) {
        if let Some(id) = record.id() {
            self.id_to_record.insert(id, record.clone());
        }
        self.records.push(record);
    }

    /// Free the id slot and splice the record out of the ordered list.
    pub(crate) fn remove_record(&mut self, record: &RecordRef) -> bool {
        if let Some(id) = record.id() {
            let same = self
                .id_to_record
                .get(&id)
                .is_some_and(|mapped| Arc::ptr_eq(mapped, record));
            if same {
                self.id_to_record.remove(&id);
            }
        }
        let before = self.records.len();
        self.records.retain(|candidate| !Arc::ptr_eq(candidate, record));
        before != self.records.len()
    }

    pub fn records(&self) -> &[RecordRef] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn metadata(&self) -> &Attributes {
        &self.metadata
    }

    pub fn merge_metadata(&mut self, meta: Attributes) {
        self.metadata.extend(meta);
    }

    /// Incremental sync token passed to `find_all`.
    pub fn since_token(&self) -> Option<Value> {
        self.metadata
            .get(Self::SINCE_KEY)
            .filter(|value| !value.is_null())
            .cloned()
    }

    pub fn record_array(&self) -> Option<&RecordArrayRef> {
        self.record_array.as_ref()
    }

    pub(crate) fn set_record_array(&mut self, array: RecordArrayRef) {
        self.record_array = Some(array);
    }

    pub(crate) fn drain_records(&mut self) -> Vec<RecordRef> {
        self.id_to_record.clear();
        std::mem::take(&mut self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ClientId;
    use crate::record::Record;
    use serde_json::json;

    fn record(client: u64, id: Option<&str>) -> RecordRef {
        Arc::new(Record::new("widget".into(), ClientId(client), id.map(RecordId::from)))
    }

    #[test]
    fn test_registry_fallback() {
        let mut registry: TypeRegistry<&str> = TypeRegistry::new();
        let post = EntityType::new("post");
        let user = EntityType::new("user");

        assert!(registry.resolve(&post).is_none());
        registry.set_fallback("default");
        registry.insert(post.clone(), "posts");

        assert_eq!(registry.resolve(&post), Some(&"posts"));
        assert_eq!(registry.resolve(&user), Some(&"default"));
        assert!(registry.get(&user).is_none());
    }

    #[test]
    fn test_insert_and_remove_keep_order() {
        let mut map = TypeMap::new("widget".into());
        let a = record(1, Some("1"));
        let b = record(2, None);
        let c = record(3, Some("3"));
        map.insert_record(a.clone());
        map.insert_record(b.clone());
        map.insert_record(c.clone());

        assert!(map.contains_id(&RecordId::from("1")));
        assert!(map.remove_record(&b));
        assert!(!map.remove_record(&b));

        let order: Vec<u64> = map.records().iter().map(|r| r.client_id().0).collect();
        assert_eq!(order, vec![1, 3]);

        map.remove_record(&a);
        assert!(!map.contains_id(&RecordId::from("1")));
        assert!(map.contains_id(&RecordId::from("3")));
    }

    #[test]
    fn test_remove_does_not_free_slot_owned_by_other_record() {
        let mut map = TypeMap::new("widget".into());
        let stale = record(1, Some("7"));
        let fresh = record(2, Some("7"));
        map.insert_record(stale.clone());
        map.index_id(RecordId::from("7"), fresh.clone());

        map.remove_record(&stale);
        assert!(Arc::ptr_eq(map.get(&RecordId::from("7")).unwrap(), &fresh));
    }

    #[test]
    fn test_since_token() {
        let mut map = TypeMap::new("widget".into());
        assert!(map.since_token().is_none());

        let mut meta = Attributes::new();
        meta.insert("since".into(), json!("abc"));
        meta.insert("total".into(), json!(3));
        map.merge_metadata(meta);

        assert_eq!(map.since_token(), Some(json!("abc")));
        assert_eq!(map.metadata().get("total"), Some(&json!(3)));
    }
}
