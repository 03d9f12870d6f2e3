use super::{Adapter, AdapterCapabilities, AdapterPayload};
use crate::core::{Attributes, EntityType, RelationshipDescriptor, Result, StoreError, ValidationErrors};
use crate::identity::{RecordId, coerce};
use crate::record::RecordRef;
use crate::record_array::RecordArrayRef;
use crate::serializer::ID_KEY;
use crate::store::Store;
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use uuid::Uuid;

/// How the adapter answers commits.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum CommitOutcome {
    #[default]
    Accept,
    Invalid(ValidationErrors),
    Error,
}

/// Per-hook call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterCallLog {
    pub find: usize,
    pub find_many: usize,
    pub find_all: usize,
    pub find_query: usize,
    pub find_belongs_to: usize,
    pub find_has_many: usize,
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    /// Ids requested through `find_many`, one entry per call
    pub batches: Vec<Vec<String>>,
}

#[derive(Default)]
struct Tables {
    rows: HashMap<EntityType, BTreeMap<String, Attributes>>,
    links: HashMap<String, Vec<Value>>,
    next_id: u64,
    sync_version: u64,
}

/// Adapter backed by in-process tables.
///
/// Commits are acknowledged inline unless a latency is configured, in which
/// case the acknowledgement is sent from a spawned task.
pub struct MemoryAdapter {
    tables: Mutex<Tables>,
    calls: Mutex<AdapterCallLog>,
    outcome: Mutex<CommitOutcome>,
    latency: Option<Duration>,
    client_ids: bool,
    failing: AtomicBool,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            calls: Mutex::new(AdapterCallLog::default()),
            outcome: Mutex::new(CommitOutcome::Accept),
            latency: None,
            client_ids: false,
            failing: AtomicBool::new(false),
        }
    }

    /// Delay every read and acknowledgement.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Generate UUIDs for new records instead of sequential server ids.
    pub fn with_client_ids(mut self) -> Self {
        self.client_ids = true;
        self
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log(&self) -> MutexGuard<'_, AdapterCallLog> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace a row. The row must carry an `id`.
    pub fn seed(&self, entity_type: impl Into<EntityType>, row: Value) -> Result<()> {
        let entity_type = entity_type.into();
        let Value::Object(mut row) = row else {
            return Err(StoreError::InvalidPayload("seed rows must be objects".into()));
        };
        let id = row
            .get(ID_KEY)
            .cloned()
            .and_then(coerce)
            .ok_or_else(|| StoreError::InvalidPayload("seed row has no id".into()))?;
        row.insert(ID_KEY.to_string(), id.clone().into());
        let mut tables = self.tables();
        tables.sync_version += 1;
        tables
            .rows
            .entry(entity_type)
            .or_default()
            .insert(id.to_string(), row);
        Ok(())
    }

    /// Rows returned when `link` is followed.
    pub fn seed_link(&self, link: impl Into<String>, rows: Vec<Value>) {
        self.tables().links.insert(link.into(), rows);
    }

    pub fn row(&self, entity_type: impl Into<EntityType>, id: &str) -> Option<Value> {
        let entity_type = entity_type.into();
        self.tables()
            .rows
            .get(&entity_type)
            .and_then(|table| table.get(id))
            .cloned()
            .map(Value::Object)
    }

    pub fn row_count(&self, entity_type: impl Into<EntityType>) -> usize {
        let entity_type = entity_type.into();
        self.tables().rows.get(&entity_type).map_or(0, BTreeMap::len)
    }

    /// Make every read fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_commit_outcome(&self, outcome: CommitOutcome) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = outcome;
    }

    pub fn calls(&self) -> AdapterCallLog {
        self.log().clone()
    }

    async fn read_delay(&self) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::FetchFailed("memory adapter is failing".into()));
        }
        Ok(())
    }

    fn rows_of(&self, entity_type: &EntityType) -> Vec<Value> {
        self.tables()
            .rows
            .get(entity_type)
            .map(|table| table.values().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }

    /// Persist the record's merged attributes and answer with the configured outcome.
    fn commit(&self, store: &Store, entity_type: &EntityType, record: &RecordRef, delete: bool) {
        let outcome = self
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let ack = match &outcome {
            CommitOutcome::Accept => {
                let mut tables = self.tables();
                let id = match record.id() {
                    Some(id) => id,
                    None => {
                        tables.next_id += 1;
                        RecordId::from(tables.next_id.to_string())
                    }
                };
                let table = tables.rows.entry(entity_type.clone()).or_default();
                if delete {
                    table.remove(id.as_str());
                    None
                } else {
                    let mut row = table.remove(id.as_str()).unwrap_or_default();
                    row.extend(record.attributes());
                    row.insert(ID_KEY.to_string(), id.clone().into());
                    table.insert(id.to_string(), row.clone());
                    Some(Value::Object(row))
                }
            }
            _ => None,
        };

        let store = store.clone();
        let record = record.clone();
        let acknowledge = move || {
            let result = match outcome {
                CommitOutcome::Accept => store.did_save_record(&record, ack),
                CommitOutcome::Invalid(errors) => store.record_was_invalid(&record, errors),
                CommitOutcome::Error => store.record_was_error(&record),
            };
            if let Err(err) = result {
                warn!("memory adapter could not acknowledge {}: {}", record, err);
            }
        };

        match (self.latency, Handle::try_current()) {
            (Some(latency), Ok(handle)) => {
                handle.spawn(async move {
                    tokio::time::sleep(latency).await;
                    acknowledge();
                });
            }
            _ => acknowledge(),
        }
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn capabilities(&self) -> AdapterCapabilities {
        let capabilities = AdapterCapabilities::default().finds_belongs_to();
        if self.client_ids {
            capabilities.generates_ids()
        } else {
            capabilities
        }
    }

    async fn find(&self, _store: &Store, entity_type: &EntityType, id: &RecordId) -> Result<Value> {
        self.log().find += 1;
        self.read_delay().await?;
        self.row(entity_type, id.as_str()).ok_or_else(|| {
            StoreError::FetchFailed(format!("{} '{}' not found", entity_type, id))
        })
    }

    async fn find_many(
        &self,
        _store: &Store,
        entity_type: &EntityType,
        ids: &[RecordId],
        _owner: Option<&RecordRef>,
    ) -> Result<AdapterPayload> {
        {
            let mut log = self.log();
            log.find_many += 1;
            log.batches
                .push(ids.iter().map(|id| id.to_string()).collect());
        }
        self.read_delay().await?;
        let records = ids
            .iter()
            .filter_map(|id| self.row(entity_type, id.as_str()))
            .collect();
        Ok(AdapterPayload::new(records))
    }

    async fn find_all(
        &self,
        _store: &Store,
        entity_type: &EntityType,
        since: Option<&Value>,
    ) -> Result<AdapterPayload> {
        self.log().find_all += 1;
        self.read_delay().await?;
        debug!("memory find_all {} since {:?}", entity_type, since);

        let version = self.tables().sync_version;
        let mut meta = Attributes::new();
        meta.insert("since".into(), json!(version));
        Ok(AdapterPayload::new(self.rows_of(entity_type)).with_meta(meta))
    }

    /// Object queries match rows whose fields equal every query field.
    async fn find_query(
        &self,
        _store: &Store,
        entity_type: &EntityType,
        query: &Value,
    ) -> Result<AdapterPayload> {
        self.log().find_query += 1;
        self.read_delay().await?;

        let rows = self.rows_of(entity_type);
        let records = match query.as_object() {
            Some(conditions) => rows
                .into_iter()
                .filter(|row| {
                    conditions
                        .iter()
                        .all(|(field, expected)| row.get(field) == Some(expected))
                })
                .collect(),
            None => rows,
        };
        Ok(AdapterPayload::new(records))
    }

    async fn find_belongs_to(
        &self,
        _store: &Store,
        owner: &RecordRef,
        link: &str,
        relationship: &RelationshipDescriptor,
    ) -> Result<Value> {
        self.log().find_belongs_to += 1;
        self.read_delay().await?;
        let linked = self.tables().links.get(link).and_then(|rows| rows.first().cloned());
        linked.ok_or_else(|| {
            StoreError::FetchFailed(format!(
                "link '{}' for {}.{} has no row",
                link, owner, relationship.name
            ))
        })
    }

    fn find_has_many(
        &self,
        store: &Store,
        _owner: &RecordRef,
        link: &str,
        _relationship: &RelationshipDescriptor,
        array: &RecordArrayRef,
    ) {
        self.log().find_has_many += 1;
        let rows = self.tables().links.get(link).cloned();
        let store = store.clone();
        let array = array.clone();
        let link = link.to_string();
        let latency = self.latency;

        let fill = move || match rows {
            Some(rows) => {
                if let Err(err) = store.load_has_many(&array, AdapterPayload::new(rows)) {
                    store.has_many_did_fail(&array, err);
                }
            }
            None => store.has_many_did_fail(
                &array,
                StoreError::FetchFailed(format!("unknown link '{}'", link)),
            ),
        };

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(latency) = latency {
                        tokio::time::sleep(latency).await;
                    }
                    fill();
                });
            }
            Err(_) => fill(),
        }
    }

    fn create_record(&self, store: &Store, entity_type: &EntityType, record: &RecordRef) {
        self.log().create += 1;
        self.commit(store, entity_type, record, false);
    }

    fn update_record(&self, store: &Store, entity_type: &EntityType, record: &RecordRef) {
        self.log().update += 1;
        self.commit(store, entity_type, record, false);
    }

    fn delete_record(&self, store: &Store, entity_type: &EntityType, record: &RecordRef) {
        self.log().delete += 1;
        self.commit(store, entity_type, record, true);
    }

    fn generate_id_for_record(&self, _store: &Store, _entity_type: &EntityType) -> Option<RecordId> {
        self.client_ids
            .then(|| RecordId::from(Uuid::new_v4().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seeded_rows_are_found() {
        let adapter = MemoryAdapter::new();
        adapter
            .seed("widget", json!({"id": 1, "name": "Foo"}))
            .unwrap();
        let store = Store::default();
        let ty = EntityType::new("widget");

        let row = adapter.find(&store, &ty, &RecordId::from("1")).await.unwrap();
        assert_eq!(row["name"], json!("Foo"));
        assert!(adapter.find(&store, &ty, &RecordId::from("2")).await.is_err());
        assert_eq!(adapter.calls().find, 2);
    }

    #[tokio::test]
    async fn test_query_matches_fields() {
        let adapter = MemoryAdapter::new();
        adapter.seed("widget", json!({"id": 1, "color": "red"})).unwrap();
        adapter.seed("widget", json!({"id": 2, "color": "blue"})).unwrap();
        let store = Store::default();

        let payload = adapter
            .find_query(&store, &EntityType::new("widget"), &json!({"color": "blue"}))
            .await
            .unwrap();
        assert_eq!(payload.records.len(), 1);
        assert_eq!(payload.records[0]["id"], json!("2"));
    }

    #[tokio::test]
    async fn test_failing_switch() {
        let adapter = MemoryAdapter::new();
        adapter.set_failing(true);
        let store = Store::default();
        let result = adapter
            .find_all(&store, &EntityType::new("widget"), None)
            .await;
        assert!(matches!(result, Err(StoreError::FetchFailed(_))));
    }

    #[test]
    fn test_client_ids_declare_capability() {
        let adapter = MemoryAdapter::new().with_client_ids();
        assert!(adapter.capabilities().generates_ids);
        let id = adapter
            .generate_id_for_record(&Store::default(), &EntityType::new("widget"))
            .unwrap();
        assert!(Uuid::parse_str(id.as_str()).is_ok());
        assert!(!MemoryAdapter::new().capabilities().generates_ids);
    }
}
