use std::fmt;
use std::sync::Arc;

/// Attribute bag used for canonical data, local changes and payloads.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Name of an entity type. Cheap to clone, compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityType(Arc<str>);

impl EntityType {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EntityType {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<&EntityType> for EntityType {
    fn from(ty: &EntityType) -> Self {
        ty.clone()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationshipKind {
    BelongsTo,
    HasMany,
}

/// Describes one relationship declared on an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDescriptor {
    pub name: String,
    pub kind: RelationshipKind,
    pub target: EntityType,
    pub inverse: Option<String>,
}

impl RelationshipDescriptor {
    pub fn belongs_to(name: impl Into<String>, target: impl Into<EntityType>) -> Self {
        Self {
            name: name.into(),
            kind: RelationshipKind::BelongsTo,
            target: target.into(),
            inverse: None,
        }
    }

    pub fn has_many(name: impl Into<String>, target: impl Into<EntityType>) -> Self {
        Self {
            name: name.into(),
            kind: RelationshipKind::HasMany,
            target: target.into(),
            inverse: None,
        }
    }

    pub fn inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self
    }
}

/// Schema descriptor of an entity type.
///
/// The store treats it as an opaque key plus the declared attribute and
/// relationship names; it never validates attribute values.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    entity_type: EntityType,
    attributes: Vec<String>,
    relationships: Vec<RelationshipDescriptor>,
}

impl EntitySchema {
    pub fn new(entity_type: impl Into<EntityType>) -> Self {
        Self {
            entity_type: entity_type.into(),
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn attribute(mut self, name: impl Into<String>) -> Self {
        self.attributes.push(name.into());
        self
    }

    pub fn relationship(mut self, descriptor: RelationshipDescriptor) -> Self {
        self.relationships.push(descriptor);
        self
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    pub fn relationships(&self) -> &[RelationshipDescriptor] {
        &self.relationships
    }

    pub fn find_relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|rel| rel.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_equality_by_name() {
        let a = EntityType::new("widget");
        let b: EntityType = String::from("widget").into();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "widget");
    }

    #[test]
    fn test_schema_lookup() {
        let schema = EntitySchema::new("post")
            .attribute("title")
            .relationship(RelationshipDescriptor::has_many("comments", "comment").inverse("post"));

        assert_eq!(schema.attributes(), ["title".to_string()]);
        let rel = schema.find_relationship("comments").unwrap();
        assert_eq!(rel.kind, RelationshipKind::HasMany);
        assert_eq!(rel.target, EntityType::new("comment"));
        assert_eq!(rel.inverse.as_deref(), Some("post"));
        assert!(schema.find_relationship("author").is_none());
    }
}
