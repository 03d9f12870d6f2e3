// ============================================================================
// Store
// ============================================================================
//
// The store is a cheap-to-clone handle over one independent instance:
// identity maps, in-flight fetches, the pending-save queue, live arrays
// and the relationship ledger. Its behaviour is split by concern:
//
// - records.rs:     materialization, ingestion, local edits, unload
// - fetch.rs:       deduplicated adapter reads
// - persistence.rs: batched commits and their acknowledgements
// - worker.rs:      optional periodic tick driver
//
// No lock is held across an `.await` or a call into an adapter.
//
// ============================================================================

pub mod config;
mod fetch;
mod persistence;
mod records;
pub mod worker;

pub use config::{StoreConfig, TickMode};
pub use fetch::RecordFuture;
pub use worker::TickWorker;

use crate::adapter::{Adapter, RegisteredAdapter};
use crate::core::{EntitySchema, EntityType, Result, StoreError};
use crate::identity::{IdentityResolver, RecordId};
use crate::record::{Record, RecordRef};
use crate::record_array::RecordArrayManager;
use crate::relationship::RelationshipChangeLedger;
use crate::scheduler::{PersistenceScheduler, TickQueue, TickTask};
use crate::serializer::{JsonSerializer, Serializer};
use crate::type_map::{TypeMap, TypeRegistry};
use fetch::InFlightFetches;
use log::{debug, trace, warn};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::runtime::Handle;
use tracing::info_span;

/// Everything mutated by store operations, behind one lock.
pub(crate) struct StoreState {
    destroyed: bool,
    schemas: TypeRegistry<EntitySchema>,
    type_maps: TypeRegistry<TypeMap>,
    identity: IdentityResolver,
    fetches: InFlightFetches,
    scheduler: PersistenceScheduler,
    arrays: RecordArrayManager,
    ledger: RelationshipChangeLedger,
    ticks: TickQueue,
}

impl StoreState {
    fn new() -> Self {
        Self {
            destroyed: false,
            schemas: TypeRegistry::new(),
            type_maps: TypeRegistry::new(),
            identity: IdentityResolver::new(),
            fetches: InFlightFetches::default(),
            scheduler: PersistenceScheduler::new(),
            arrays: RecordArrayManager::new(),
            ledger: RelationshipChangeLedger::new(),
            ticks: TickQueue::new(),
        }
    }

    fn ensure_type(&self, entity_type: &EntityType) -> Result<()> {
        if self.schemas.contains(entity_type) {
            Ok(())
        } else {
            Err(StoreError::UnknownType(entity_type.to_string()))
        }
    }

    fn type_map_mut(&mut self, entity_type: &EntityType) -> &mut TypeMap {
        self.type_maps
            .get_or_insert_with(entity_type, || TypeMap::new(entity_type.clone()))
    }

    fn lookup(&self, entity_type: &EntityType, id: &RecordId) -> Option<RecordRef> {
        self.type_maps.get(entity_type)?.get(id).cloned()
    }

    fn materialize(&mut self, entity_type: &EntityType, id: Option<RecordId>) -> RecordRef {
        let client_id = self.identity.generate_client_id();
        let record = Arc::new(Record::new(entity_type.clone(), client_id, id));
        self.type_map_mut(entity_type).insert_record(record.clone());
        self.identity.register(&record);
        trace!("materialized {} as {}", record, client_id);
        record
    }

    /// The one record for (type, id), materializing an empty shell if needed.
    fn record_for_id(&mut self, entity_type: &EntityType, id: RecordId) -> RecordRef {
        match self.lookup(entity_type, &id) {
            Some(record) => record,
            None => self.materialize(entity_type, Some(id)),
        }
    }
}

struct StoreShared {
    config: StoreConfig,
    state: Mutex<StoreState>,
    adapters: RwLock<TypeRegistry<RegisteredAdapter>>,
    serializers: RwLock<TypeRegistry<Arc<dyn Serializer>>>,
}

/// Outcome of one drained tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Records handed to adapter commit hooks
    pub flushed: usize,
    /// Records re-evaluated against filtered arrays
    pub records_changed: usize,
}

/// Identity-mapped record store.
///
/// # Examples
///
/// ```
/// use recordstore::{EntitySchema, Store, StoreConfig};
/// use serde_json::json;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = Store::new(StoreConfig::default());
/// store.define_type(EntitySchema::new("widget").attribute("name"))?;
///
/// let loaded = store.push("widget", json!({"id": 1, "name": "Foo"}))?;
/// let same = store.get_by_id("widget", "1")?.unwrap();
/// assert!(std::sync::Arc::ptr_eq(&loaded, &same));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Store {
    shared: Arc<StoreShared>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        let mut serializers: TypeRegistry<Arc<dyn Serializer>> = TypeRegistry::new();
        serializers.set_fallback(Arc::new(JsonSerializer::new(config.primary_key.clone())));

        Self {
            shared: Arc::new(StoreShared {
                config,
                state: Mutex::new(StoreState::new()),
                adapters: RwLock::new(TypeRegistry::new()),
                serializers: RwLock::new(serializers),
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// Whether two handles point at the same store instance.
    pub fn ptr_eq(&self, other: &Store) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn state(&self) -> Result<MutexGuard<'_, StoreState>> {
        let state = self.shared.state.lock()?;
        if state.destroyed {
            return Err(StoreError::Destroyed);
        }
        Ok(state)
    }

    // ------------------------------------------------------------------
    // Types, adapters, serializers
    // ------------------------------------------------------------------

    pub fn define_type(&self, schema: EntitySchema) -> Result<()> {
        let mut state = self.state()?;
        let entity_type = schema.entity_type().clone();
        state.type_map_mut(&entity_type);
        state.schemas.insert(entity_type, schema);
        Ok(())
    }

    pub fn schema_for(&self, entity_type: impl Into<EntityType>) -> Result<EntitySchema> {
        let entity_type = entity_type.into();
        let state = self.state()?;
        state
            .schemas
            .get(&entity_type)
            .cloned()
            .ok_or_else(|| StoreError::UnknownType(entity_type.to_string()))
    }

    pub fn is_defined(&self, entity_type: impl Into<EntityType>) -> bool {
        let entity_type = entity_type.into();
        self.state()
            .map(|state| state.schemas.contains(&entity_type))
            .unwrap_or(false)
    }

    /// Register the adapter for one type. Capabilities are read here, once.
    pub fn register_adapter(
        &self,
        entity_type: impl Into<EntityType>,
        adapter: Arc<dyn Adapter>,
    ) -> Result<()> {
        let entity_type = entity_type.into();
        self.state()?.ensure_type(&entity_type)?;
        let registered = RegisteredAdapter::new(adapter);
        debug!(
            "registered adapter for {} with {:?}",
            entity_type,
            registered.capabilities()
        );
        self.shared.adapters.write()?.insert(entity_type, registered);
        Ok(())
    }

    /// Adapter used for types without their own.
    pub fn set_default_adapter(&self, adapter: Arc<dyn Adapter>) -> Result<()> {
        self.state()?;
        self.shared
            .adapters
            .write()?
            .set_fallback(RegisteredAdapter::new(adapter));
        Ok(())
    }

    pub fn adapter_for(&self, entity_type: &EntityType) -> Result<RegisteredAdapter> {
        self.state()?.ensure_type(entity_type)?;
        self.shared
            .adapters
            .read()?
            .resolve(entity_type)
            .cloned()
            .ok_or_else(|| {
                StoreError::UnknownType(format!("no adapter registered for '{}'", entity_type))
            })
    }

    pub fn register_serializer(
        &self,
        entity_type: impl Into<EntityType>,
        serializer: Arc<dyn Serializer>,
    ) -> Result<()> {
        let entity_type = entity_type.into();
        self.state()?.ensure_type(&entity_type)?;
        self.shared
            .serializers
            .write()?
            .insert(entity_type, serializer);
        Ok(())
    }

    pub fn serializer_for(&self, entity_type: &EntityType) -> Result<Arc<dyn Serializer>> {
        self.state()?.ensure_type(entity_type)?;
        self.shared
            .serializers
            .read()?
            .resolve(entity_type)
            .cloned()
            .ok_or_else(|| {
                StoreError::UnknownType(format!("no serializer registered for '{}'", entity_type))
            })
    }

    // ------------------------------------------------------------------
    // Ticks
    // ------------------------------------------------------------------

    /// Schedule tick work; in auto mode the first task of a tick spawns the drain.
    fn schedule(&self, state: &mut StoreState, task: TickTask) {
        if !state.ticks.schedule(task) {
            return;
        }
        if self.shared.config.tick_mode != TickMode::Auto || !state.ticks.claim_drain() {
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                let store = self.clone();
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    if let Err(err) = store.run_tick() {
                        if err != StoreError::Destroyed {
                            warn!("scheduled tick failed: {}", err);
                        }
                    }
                });
            }
            Err(_) => {
                state.ticks.release_drain();
                debug!("no runtime for automatic tick; work waits for run_tick");
            }
        }
    }

    /// Drain one tick: flush pending saves at most once, then apply
    /// coalesced record changes to filtered arrays.
    pub fn run_tick(&self) -> Result<TickReport> {
        let tasks = {
            let mut state = self.state()?;
            state.ticks.release_drain();
            state.ticks.take()
        };
        let span = info_span!("tick", tasks = tasks.len());
        let _entered = span.enter();

        let mut report = TickReport::default();
        if tasks.contains(&TickTask::FlushSaves) {
            report.flushed = self.flush_pending_saves()?;
        }

        // acknowledgements made during the flush are applied in this tick
        let mut state = self.state()?;
        state.ticks.unschedule(TickTask::RecordChanges);
        report.records_changed = state.arrays.flush_changes();
        Ok(report)
    }

    /// True when a tick would have something to do.
    pub fn has_pending_work(&self) -> Result<bool> {
        let state = self.state()?;
        Ok(!state.ticks.is_idle() || !state.scheduler.is_empty() || state.arrays.has_pending_changes())
    }

    /// Start the periodic tick worker configured by `tick_interval_ms`.
    pub fn spawn_tick_worker(&self) -> Result<TickWorker> {
        let interval = self.shared.config.interval().ok_or_else(|| {
            StoreError::InvalidState(
                "tick_interval_ms must be configured to start the tick worker".to_string(),
            )
        })?;
        worker::spawn_tick_worker(self.clone(), interval)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Tear the store down. Pending saves fail with `Destroyed`; every
    /// record is dematerialized; later calls return `Destroyed`.
    pub fn will_destroy(&self) -> Result<()> {
        let records = {
            let mut state = self.shared.state.lock()?;
            if state.destroyed {
                return Ok(());
            }
            state.destroyed = true;
            state.scheduler.cancel_all(StoreError::Destroyed);
            state.fetches.clear();
            state.arrays.clear();
            state.ledger.clear();
            state.identity.clear();
            state.ticks.take();
            let mut records = Vec::new();
            for type_map in state.type_maps.values_mut() {
                records.extend(type_map.drain_records());
            }
            state.type_maps.clear();
            state.schemas.clear();
            records
        };
        for record in &records {
            record.mark_unloaded();
        }
        self.shared.adapters.write()?.clear();
        self.shared.serializers.write()?.clear();
        debug!("store destroyed, {} records dematerialized", records.len());
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared
            .state
            .lock()
            .map(|state| state.destroyed)
            .unwrap_or(true)
    }
}
