#![allow(dead_code)]

use async_trait::async_trait;
use recordstore::{
    Adapter, AdapterCapabilities, AdapterPayload, ClientId, CommitKind, DirtySet, EntitySchema,
    EntityType, RecordArrayRef, RecordId, RecordRef, RelationshipChange, RelationshipDescriptor,
    Result, Store, StoreConfig, StoreError,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub type CommitHook = Box<dyn Fn(&Store, CommitKind, &RecordRef) + Send + Sync>;

/// Adapter whose reads can be held back and whose commits are scripted.
///
/// Commits are only recorded unless a hook is installed; tests acknowledge
/// them by hand.
pub struct ScriptedAdapter {
    rows: Mutex<HashMap<(String, String), Value>>,
    gate: watch::Sender<bool>,
    failing: AtomicBool,
    capabilities: AdapterCapabilities,
    finds: AtomicUsize,
    batches: Mutex<Vec<(String, Vec<String>)>>,
    find_alls: Mutex<Vec<Option<Value>>>,
    queries: Mutex<Vec<Value>>,
    commits: Mutex<Vec<(CommitKind, RecordRef)>>,
    on_commit: Mutex<Option<CommitHook>>,
    dependents: Mutex<HashMap<ClientId, Vec<RecordRef>>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            rows: Mutex::new(HashMap::new()),
            gate,
            failing: AtomicBool::new(false),
            capabilities: AdapterCapabilities::default(),
            finds: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
            find_alls: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            commits: Mutex::new(Vec::new()),
            on_commit: Mutex::new(None),
            dependents: Mutex::new(HashMap::new()),
        }
    }

    /// Reads wait until `open` is called.
    pub fn gated() -> Self {
        let adapter = Self::new();
        adapter.gate.send_replace(false);
        adapter
    }

    pub fn with_capabilities(mut self, capabilities: AdapterCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn insert(&self, entity_type: &str, row: Value) {
        let id = match &row["id"] {
            Value::String(id) => id.clone(),
            other => other.to_string(),
        };
        self.rows
            .lock()
            .unwrap()
            .insert((entity_type.to_string(), id), row);
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn on_commit(&self, hook: impl Fn(&Store, CommitKind, &RecordRef) + Send + Sync + 'static) {
        *self.on_commit.lock().unwrap() = Some(Box::new(hook));
    }

    /// Changing `record` dirties `dependent` (attribute and belongs-to hooks).
    pub fn link_dependent(&self, record: &RecordRef, dependent: &RecordRef) {
        self.dependents
            .lock()
            .unwrap()
            .entry(record.client_id())
            .or_default()
            .push(dependent.clone());
    }

    pub fn find_count(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<(String, Vec<String>)> {
        self.batches.lock().unwrap().clone()
    }

    pub fn find_all_tokens(&self) -> Vec<Option<Value>> {
        self.find_alls.lock().unwrap().clone()
    }

    pub fn queries(&self) -> Vec<Value> {
        self.queries.lock().unwrap().clone()
    }

    pub fn commits(&self) -> Vec<(CommitKind, ClientId)> {
        self.commits
            .lock()
            .unwrap()
            .iter()
            .map(|(kind, record)| (*kind, record.client_id()))
            .collect()
    }

    async fn pass_gate(&self) -> Result<()> {
        let mut rx = self.gate.subscribe();
        let _ = rx.wait_for(|open| *open).await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::FetchFailed("scripted failure".into()));
        }
        Ok(())
    }

    fn rows_of(&self, entity_type: &EntityType) -> Vec<Value> {
        let rows = self.rows.lock().unwrap();
        let mut matching: Vec<(&(String, String), &Value)> = rows
            .iter()
            .filter(|((ty, _), _)| ty == entity_type.name())
            .collect();
        matching.sort_by(|a, b| a.0.1.cmp(&b.0.1));
        matching.into_iter().map(|(_, row)| row.clone()).collect()
    }

    fn row(&self, entity_type: &EntityType, id: &RecordId) -> Option<Value> {
        self.rows
            .lock()
            .unwrap()
            .get(&(entity_type.name().to_string(), id.to_string()))
            .cloned()
    }

    fn commit(&self, store: &Store, kind: CommitKind, record: &RecordRef) {
        self.commits.lock().unwrap().push((kind, record.clone()));
        if let Some(hook) = self.on_commit.lock().unwrap().as_ref() {
            hook(store, kind, record);
        }
    }

    fn add_dependents(&self, dirty: &mut DirtySet, record: &RecordRef) {
        if let Some(dependents) = self.dependents.lock().unwrap().get(&record.client_id()) {
            for dependent in dependents {
                dirty.insert(dependent);
            }
        }
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    fn capabilities(&self) -> AdapterCapabilities {
        self.capabilities
    }

    async fn find(&self, _store: &Store, entity_type: &EntityType, id: &RecordId) -> Result<Value> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await?;
        self.row(entity_type, id)
            .ok_or_else(|| StoreError::FetchFailed(format!("{} {} missing", entity_type, id)))
    }

    async fn find_many(
        &self,
        _store: &Store,
        entity_type: &EntityType,
        ids: &[RecordId],
        _owner: Option<&RecordRef>,
    ) -> Result<AdapterPayload> {
        self.batches.lock().unwrap().push((
            entity_type.to_string(),
            ids.iter().map(|id| id.to_string()).collect(),
        ));
        self.pass_gate().await?;
        Ok(AdapterPayload::new(
            ids.iter().filter_map(|id| self.row(entity_type, id)).collect(),
        ))
    }

    async fn find_all(
        &self,
        _store: &Store,
        entity_type: &EntityType,
        since: Option<&Value>,
    ) -> Result<AdapterPayload> {
        let call = {
            let mut calls = self.find_alls.lock().unwrap();
            calls.push(since.cloned());
            calls.len()
        };
        self.pass_gate().await?;
        let mut meta = recordstore::Attributes::new();
        meta.insert("since".into(), json!(format!("v{}", call)));
        Ok(AdapterPayload::new(self.rows_of(entity_type)).with_meta(meta))
    }

    async fn find_query(
        &self,
        _store: &Store,
        entity_type: &EntityType,
        query: &Value,
    ) -> Result<AdapterPayload> {
        self.queries.lock().unwrap().push(query.clone());
        self.pass_gate().await?;
        let conditions = query.as_object().cloned().unwrap_or_default();
        Ok(AdapterPayload::new(
            self.rows_of(entity_type)
                .into_iter()
                .filter(|row| conditions.iter().all(|(k, v)| row.get(k) == Some(v)))
                .collect(),
        ))
    }

    fn find_has_many(
        &self,
        _store: &Store,
        _owner: &RecordRef,
        _link: &str,
        _relationship: &RelationshipDescriptor,
        _array: &RecordArrayRef,
    ) {
    }

    fn create_record(&self, store: &Store, _entity_type: &EntityType, record: &RecordRef) {
        self.commit(store, CommitKind::Create, record);
    }

    fn update_record(&self, store: &Store, _entity_type: &EntityType, record: &RecordRef) {
        self.commit(store, CommitKind::Update, record);
    }

    fn delete_record(&self, store: &Store, _entity_type: &EntityType, record: &RecordRef) {
        self.commit(store, CommitKind::Delete, record);
    }

    fn dirty_records_for_attribute_change(
        &self,
        _store: &Store,
        dirty: &mut DirtySet,
        record: &RecordRef,
        _attribute: &str,
    ) {
        self.add_dependents(dirty, record);
    }

    fn dirty_records_for_belongs_to_change(
        &self,
        store: &Store,
        dirty: &mut DirtySet,
        child: &RecordRef,
        change: &RelationshipChange,
    ) {
        self.add_dependents(dirty, child);
        if let Some(parent) = change
            .parent
            .and_then(|parent| store.record_for_client_id(parent).ok().flatten())
        {
            dirty.insert(&parent);
        }
    }

    fn dirty_records_for_has_many_change(
        &self,
        _store: &Store,
        dirty: &mut DirtySet,
        parent: &RecordRef,
        _change: &RelationshipChange,
    ) {
        self.add_dependents(dirty, parent);
    }
}

/// A manual-tick store with `types` defined and served by `adapter`.
pub fn store_with(adapter: Arc<ScriptedAdapter>, types: &[&str]) -> Store {
    store_with_config(StoreConfig::default(), adapter, types)
}

pub fn store_with_config(config: StoreConfig, adapter: Arc<ScriptedAdapter>, types: &[&str]) -> Store {
    let store = Store::new(config);
    for ty in types {
        store.define_type(EntitySchema::new(*ty)).unwrap();
    }
    store.set_default_adapter(adapter).unwrap();
    store
}

/// Yield to the runtime until `done` holds.
pub async fn settle(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition did not settle");
}
