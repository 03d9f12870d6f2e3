pub mod error;
pub mod types;

pub use error::{Result, StoreError, ValidationErrors};
pub use types::{Attributes, EntitySchema, EntityType, RelationshipDescriptor, RelationshipKind};
