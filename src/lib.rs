// ============================================================================
// recordstore Library
// ============================================================================
//
// An identity-mapped, client-side record store. Records are materialized at
// most once per (type, id), fetched through deduplicated futures, saved in
// batched per-tick flushes and observed through live record arrays.
//
// ============================================================================

pub mod adapter;
pub mod core;
pub mod identity;
pub mod record;
pub mod record_array;
pub mod relationship;
pub mod scheduler;
pub mod serializer;
pub mod store;
pub mod type_map;

pub use adapter::{
    Adapter, AdapterCallLog, AdapterCapabilities, AdapterPayload, CommitOutcome, DirtySet,
    MemoryAdapter, RegisteredAdapter,
};
pub use self::core::{
    Attributes, EntitySchema, EntityType, RelationshipDescriptor, RelationshipKind, Result,
    StoreError, ValidationErrors,
};
pub use identity::{AsIdentifier, ClientId, RecordId, coerce};
pub use record::{CommitKind, Record, RecordRef, RecordState};
pub use record_array::{RecordArray, RecordArrayKind, RecordArrayRef};
pub use relationship::{ChangeKind, RelationKey, RelationshipChange};
pub use scheduler::SaveFuture;
pub use serializer::{JsonSerializer, SerializeOptions, Serializer};
pub use store::{RecordFuture, Store, StoreConfig, TickMode, TickReport, TickWorker};
