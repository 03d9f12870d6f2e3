use crate::core::{Attributes, EntityType, Result, StoreError};
use crate::identity::coerce;
use crate::record::Record;
use serde_json::Value;

/// Key carrying the canonical identifier in normalized data.
pub const ID_KEY: &str = "id";

#[derive(Debug, Clone, Default)]
pub struct SerializeOptions {
    pub include_id: bool,
}

impl SerializeOptions {
    pub fn include_id() -> Self {
        Self { include_id: true }
    }
}

/// Wire format <-> normalized data.
///
/// `deserialize` must produce an object with a canonical `id` entry.
pub trait Serializer: Send + Sync {
    fn serialize(&self, record: &Record, options: &SerializeOptions) -> Value;

    fn deserialize(&self, entity_type: &EntityType, raw: Value) -> Result<Attributes>;
}

/// Plain JSON objects, with a configurable primary key name.
#[derive(Debug, Clone)]
pub struct JsonSerializer {
    primary_key: String,
}

impl Default for JsonSerializer {
    fn default() -> Self {
        Self::new(ID_KEY)
    }
}

impl JsonSerializer {
    pub fn new(primary_key: impl Into<String>) -> Self {
        Self {
            primary_key: primary_key.into(),
        }
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }
}

impl Serializer for JsonSerializer {
    fn serialize(&self, record: &Record, options: &SerializeOptions) -> Value {
        let mut object = record.attributes();
        if options.include_id {
            if let Some(id) = record.id() {
                object.insert(self.primary_key.clone(), id.into());
            }
        }
        Value::Object(object)
    }

    fn deserialize(&self, entity_type: &EntityType, raw: Value) -> Result<Attributes> {
        let Value::Object(mut object) = raw else {
            return Err(StoreError::InvalidPayload(format!(
                "{} payload must be an object",
                entity_type
            )));
        };
        let id = object
            .remove(&self.primary_key)
            .and_then(coerce)
            .ok_or_else(|| {
                StoreError::InvalidPayload(format!(
                    "{} payload has no '{}'",
                    entity_type, self.primary_key
                ))
            })?;
        object.insert(ID_KEY.to_string(), id.into());
        Ok(object)
    }
}
