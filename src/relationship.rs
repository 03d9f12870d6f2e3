// ============================================================================
// Relationship Change Ledger
// ============================================================================
//
// Pending relationship mutations indexed by
// (child, parent, relation key, change kind). Only the latest change per
// key is kept; commit acknowledgement drains a child's slot.
//
// ============================================================================

use crate::core::RelationshipKind;
use crate::identity::ClientId;
use std::collections::HashMap;

/// Both sides of a relationship: the child's key and the parent's inverse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationKey {
    pub name: String,
    pub inverse: Option<String>,
}

impl RelationKey {
    pub fn new(name: impl Into<String>, inverse: Option<String>) -> Self {
        Self {
            name: name.into(),
            inverse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Add,
    Remove,
}

/// One pending relationship mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipChange {
    pub child: ClientId,
    pub parent: Option<ClientId>,
    pub key: RelationKey,
    pub kind: ChangeKind,
    pub relationship: RelationshipKind,
}

impl RelationshipChange {
    pub fn new(
        child: ClientId,
        parent: Option<ClientId>,
        key: RelationKey,
        kind: ChangeKind,
        relationship: RelationshipKind,
    ) -> Self {
        Self {
            child,
            parent,
            key,
            kind,
            relationship,
        }
    }
}

type SlotKey = (Option<ClientId>, RelationKey, ChangeKind);

#[derive(Debug, Default)]
pub struct RelationshipChangeLedger {
    by_child: HashMap<ClientId, HashMap<SlotKey, RelationshipChange>>,
}

impl RelationshipChangeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a change, replacing any change with the same key.
    pub fn record(&mut self, change: RelationshipChange) -> Option<RelationshipChange> {
        let slot = (change.parent, change.key.clone(), change.kind);
        self.by_child
            .entry(change.child)
            .or_default()
            .insert(slot, change)
    }

    pub fn remove(
        &mut self,
        child: ClientId,
        parent: Option<ClientId>,
        key: &RelationKey,
        kind: ChangeKind,
    ) -> Option<RelationshipChange> {
        let slots = self.by_child.get_mut(&child)?;
        let removed = slots.remove(&(parent, key.clone(), kind));
        if slots.is_empty() {
            self.by_child.remove(&child);
        }
        removed
    }

    /// Every change indexed under the child, in no particular order.
    pub fn changes_for(&self, child: ClientId) -> Vec<RelationshipChange> {
        self.by_child
            .get(&child)
            .map(|slots| slots.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove and return the child's changes.
    pub fn take_changes_for(&mut self, child: ClientId) -> Vec<RelationshipChange> {
        self.by_child
            .remove(&child)
            .map(|slots| slots.into_values().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_child.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_child.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_child.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(child: u64, parent: Option<u64>, kind: ChangeKind) -> RelationshipChange {
        RelationshipChange::new(
            ClientId(child),
            parent.map(ClientId),
            RelationKey::new("post", Some("comments".into())),
            kind,
            RelationshipKind::BelongsTo,
        )
    }

    #[test]
    fn test_same_key_overwrites() {
        let mut ledger = RelationshipChangeLedger::new();
        assert!(ledger.record(change(1, Some(2), ChangeKind::Add)).is_none());
        assert!(ledger.record(change(1, Some(2), ChangeKind::Add)).is_some());
        assert_eq!(ledger.len(), 1);

        ledger.record(change(1, Some(2), ChangeKind::Remove));
        ledger.record(change(1, None, ChangeKind::Add));
        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.changes_for(ClientId(1)).len(), 3);
        assert!(ledger.changes_for(ClientId(2)).is_empty());
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut ledger = RelationshipChangeLedger::new();
        let key = RelationKey::new("post", None);
        assert!(ledger.remove(ClientId(9), None, &key, ChangeKind::Add).is_none());

        ledger.record(change(1, Some(2), ChangeKind::Add));
        let key = RelationKey::new("post", Some("comments".into()));
        assert!(ledger.remove(ClientId(1), Some(ClientId(2)), &key, ChangeKind::Add).is_some());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_take_changes_for_drains_slot() {
        let mut ledger = RelationshipChangeLedger::new();
        ledger.record(change(1, Some(2), ChangeKind::Add));
        ledger.record(change(3, Some(2), ChangeKind::Add));

        let taken = ledger.take_changes_for(ClientId(1));
        assert_eq!(taken.len(), 1);
        assert!(ledger.changes_for(ClientId(1)).is_empty());
        assert_eq!(ledger.len(), 1);
    }
}
