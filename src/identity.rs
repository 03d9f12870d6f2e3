// ============================================================================
// Identity Resolution
// ============================================================================
//
// Server identifiers are canonicalized to strings so that `1` and `"1"`
// never name two different records. Before a server identifier exists a
// record is tracked by its client id, handed out monotonically per store.
//
// ============================================================================

use crate::core::{Result, StoreError};
use crate::record::RecordRef;
use crate::type_map::TypeMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Canonical (string) server identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<RecordId> for Value {
    fn from(id: RecordId) -> Self {
        Value::String(id.0)
    }
}

/// Store-local identifier assigned at materialization. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client_{}", self.0)
    }
}

/// Anything that can name a record. Only null/absent means "no identifier".
pub trait AsIdentifier {
    fn coerce(self) -> Option<RecordId>;
}

/// Canonicalize an identifier; `None` only for null or absent input.
pub fn coerce(id: impl AsIdentifier) -> Option<RecordId> {
    id.coerce()
}

impl AsIdentifier for RecordId {
    fn coerce(self) -> Option<RecordId> {
        Some(self)
    }
}

impl AsIdentifier for &RecordId {
    fn coerce(self) -> Option<RecordId> {
        Some(self.clone())
    }
}

impl AsIdentifier for &str {
    fn coerce(self) -> Option<RecordId> {
        Some(RecordId::from(self))
    }
}

impl AsIdentifier for String {
    fn coerce(self) -> Option<RecordId> {
        Some(RecordId(self))
    }
}

impl AsIdentifier for &String {
    fn coerce(self) -> Option<RecordId> {
        Some(RecordId(self.clone()))
    }
}

macro_rules! integer_identifier {
    ($($ty:ty),*) => {
        $(
            impl AsIdentifier for $ty {
                fn coerce(self) -> Option<RecordId> {
                    Some(RecordId(self.to_string()))
                }
            }
        )*
    };
}

integer_identifier!(i32, i64, u32, u64, usize);

impl AsIdentifier for &Value {
    fn coerce(self) -> Option<RecordId> {
        match self {
            Value::Null => None,
            Value::String(s) => Some(RecordId(s.clone())),
            Value::Number(n) => {
                // 1.0 and 1 must agree
                let text = match n.as_f64() {
                    Some(f) if n.is_f64() && f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => {
                        format!("{}", f as i64)
                    }
                    _ => n.to_string(),
                };
                Some(RecordId(text))
            }
            Value::Bool(b) => Some(RecordId(b.to_string())),
            other => Some(RecordId(other.to_string())),
        }
    }
}

impl AsIdentifier for Value {
    fn coerce(self) -> Option<RecordId> {
        (&self).coerce()
    }
}

impl<T: AsIdentifier> AsIdentifier for Option<T> {
    fn coerce(self) -> Option<RecordId> {
        self.and_then(AsIdentifier::coerce)
    }
}

/// Per-store monotonically increasing client id source.
#[derive(Debug)]
pub struct ClientIdGenerator {
    next: AtomicU64,
}

impl Default for ClientIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn generate(&self) -> ClientId {
        ClientId(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

/// Client id bookkeeping and server id reconciliation.
#[derive(Debug, Default)]
pub struct IdentityResolver {
    generator: ClientIdGenerator,
    records: HashMap<ClientId, RecordRef>,
    assigned: HashMap<ClientId, RecordId>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate_client_id(&self) -> ClientId {
        self.generator.generate()
    }

    pub(crate) fn register(&mut self, record: &RecordRef) {
        if let Some(id) = record.id() {
            self.assigned.insert(record.client_id(), id);
        }
        self.records.insert(record.client_id(), record.clone());
    }

    pub(crate) fn forget(&mut self, client_id: ClientId) {
        self.records.remove(&client_id);
        self.assigned.remove(&client_id);
    }

    pub fn record_for_client_id(&self, client_id: ClientId) -> Option<&RecordRef> {
        self.records.get(&client_id)
    }

    pub fn id_for_client_id(&self, client_id: ClientId) -> Option<&RecordId> {
        self.assigned.get(&client_id)
    }

    /// Reconcile a backend-assigned id with a record.
    ///
    /// A backend must never re-identify a record, and an id already owned by
    /// another record of the same type cannot be taken over.
    pub fn resolve_assigned_id(
        &mut self,
        type_map: &mut TypeMap,
        record: &RecordRef,
        id: RecordId,
    ) -> Result<()> {
        if let Some(existing) = record.id() {
            if existing != id {
                return Err(StoreError::IdentityConflict(format!(
                    "{} already has id '{}', cannot assign '{}'",
                    record.entity_type(),
                    existing,
                    id
                )));
            }
        }

        if let Some(owner) = type_map.get(&id) {
            if !Arc::ptr_eq(owner, record) {
                return Err(StoreError::IdentityConflict(format!(
                    "{} id '{}' already belongs to {}",
                    record.entity_type(),
                    id,
                    owner.client_id()
                )));
            }
        }

        record.assign_id(id.clone());
        type_map.index_id(id.clone(), record.clone());
        self.assigned.insert(record.client_id(), id);
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
        self.assigned.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use serde_json::json;

    #[test]
    fn test_coercion_is_string_based() {
        assert_eq!(coerce(1), coerce("1"));
        assert_eq!(coerce(json!(1)), coerce("1"));
        assert_eq!(coerce(json!(1.0)), coerce("1"));
        assert_eq!(coerce(json!(2.5)), coerce("2.5"));
        assert_eq!(coerce(json!(null)), None);
        assert_eq!(coerce(None::<&str>), None);
    }

    #[test]
    fn test_falsy_values_are_identifiers() {
        assert_eq!(coerce(0), Some(RecordId::from("0")));
        assert_eq!(coerce(""), Some(RecordId::from("")));
        assert_eq!(coerce(json!(false)), Some(RecordId::from("false")));
    }

    #[test]
    fn test_client_ids_start_above_zero() {
        let generator = ClientIdGenerator::new();
        let first = generator.generate();
        let second = generator.generate();
        assert!(first.0 > 0);
        assert!(second > first);

        // a second generator is independent
        assert_eq!(ClientIdGenerator::new().generate(), first);
    }

    #[test]
    fn test_resolve_assigned_id() {
        let mut resolver = IdentityResolver::new();
        let mut map = TypeMap::new("widget".into());
        let record = Arc::new(Record::new(
            "widget".into(),
            resolver.generate_client_id(),
            None,
        ));
        map.insert_record(record.clone());
        resolver.register(&record);

        resolver
            .resolve_assigned_id(&mut map, &record, RecordId::from("42"))
            .unwrap();
        assert_eq!(record.id(), Some(RecordId::from("42")));
        assert_eq!(
            resolver.id_for_client_id(record.client_id()),
            Some(&RecordId::from("42"))
        );

        // same id again is fine
        resolver
            .resolve_assigned_id(&mut map, &record, RecordId::from("42"))
            .unwrap();

        let err = resolver
            .resolve_assigned_id(&mut map, &record, RecordId::from("43"))
            .unwrap_err();
        assert!(matches!(err, StoreError::IdentityConflict(_)));
        assert_eq!(record.id(), Some(RecordId::from("42")));
    }

    #[test]
    fn test_id_taken_by_other_record() {
        let mut resolver = IdentityResolver::new();
        let mut map = TypeMap::new("widget".into());
        let owner = Arc::new(Record::new(
            "widget".into(),
            resolver.generate_client_id(),
            Some(RecordId::from("1")),
        ));
        let other = Arc::new(Record::new("widget".into(), resolver.generate_client_id(), None));
        map.insert_record(owner);
        map.insert_record(other.clone());

        let err = resolver
            .resolve_assigned_id(&mut map, &other, RecordId::from("1"))
            .unwrap_err();
        assert!(matches!(err, StoreError::IdentityConflict(_)));
        assert_eq!(other.id(), None);
    }
}
