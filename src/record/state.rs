// ============================================================================
// Record Lifecycle State
// ============================================================================
//
// Every materialized record moves through a small state machine:
//
//   Empty ──loading──> Loading ──data──> Clean
//     │                   │
//     └──create──> Dirty(Create)          └──fetch failed──> Empty
//
//   Clean ──set──> Dirty(Update) ──commit──> InFlight(Update) ──ack──> Clean
//   Clean ──delete──> Dirty(Delete) ──commit──> InFlight(Delete) ──ack──> Deleted
//   InFlight(k) ──invalid──> Invalid(k) ──fix all fields──> Dirty(k)
//   InFlight(k) ──error──> Error(k) ──commit again──> InFlight(k)
//
// ============================================================================

use std::fmt;

/// Which adapter hook a pending commit is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for CommitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitKind::Create => write!(f, "created"),
            CommitKind::Update => write!(f, "updated"),
            CommitKind::Delete => write!(f, "deleted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordState {
    /// Referenced by id but no data yet
    #[default]
    Empty,

    /// A fetch for the record is outstanding
    Loading,

    /// Loaded with no local changes
    Clean,

    /// Local changes not yet handed to the adapter
    Dirty(CommitKind),

    /// Handed to the adapter, waiting for acknowledgement
    InFlight(CommitKind),

    /// Backend rejected one or more attributes
    Invalid(CommitKind),

    /// Backend failed without attribute detail; still dirty
    Error(CommitKind),

    /// Deletion acknowledged, or a never-saved record was deleted
    Deleted,
}

impl RecordState {
    /// The commit kind carried by the state, if any.
    pub fn commit_kind(&self) -> Option<CommitKind> {
        match self {
            RecordState::Dirty(kind)
            | RecordState::InFlight(kind)
            | RecordState::Invalid(kind)
            | RecordState::Error(kind) => Some(*kind),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RecordState::Empty)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, RecordState::Loading)
    }

    pub fn is_loaded(&self) -> bool {
        !matches!(self, RecordState::Empty | RecordState::Loading)
    }

    pub fn is_dirty(&self) -> bool {
        self.commit_kind().is_some()
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, RecordState::InFlight(_))
    }

    pub fn is_new(&self) -> bool {
        self.commit_kind() == Some(CommitKind::Create)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, RecordState::Deleted) || self.commit_kind() == Some(CommitKind::Delete)
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, RecordState::Invalid(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RecordState::Error(_))
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordState::Empty => write!(f, "root.empty"),
            RecordState::Loading => write!(f, "root.loading"),
            RecordState::Clean => write!(f, "root.loaded.saved"),
            RecordState::Dirty(kind) => write!(f, "root.loaded.{}.uncommitted", kind),
            RecordState::InFlight(kind) => write!(f, "root.loaded.{}.inFlight", kind),
            RecordState::Invalid(kind) => write!(f, "root.loaded.{}.invalid", kind),
            RecordState::Error(kind) => write!(f, "root.loaded.{}.error", kind),
            RecordState::Deleted => write!(f, "root.deleted.saved"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(RecordState::Empty.is_empty());
        assert!(!RecordState::Loading.is_loaded());
        assert!(RecordState::Clean.is_loaded());
        assert!(!RecordState::Clean.is_dirty());

        let created = RecordState::Dirty(CommitKind::Create);
        assert!(created.is_new());
        assert!(created.is_dirty());
        assert!(!created.is_deleted());

        assert!(RecordState::InFlight(CommitKind::Delete).is_deleted());
        assert!(RecordState::Deleted.is_deleted());
        assert!(!RecordState::Deleted.is_dirty());
        assert!(!RecordState::Invalid(CommitKind::Update).is_valid());
        assert!(RecordState::Error(CommitKind::Update).is_dirty());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(RecordState::Clean.to_string(), "root.loaded.saved");
        assert_eq!(
            RecordState::InFlight(CommitKind::Create).to_string(),
            "root.loaded.created.inFlight"
        );
        assert_eq!(RecordState::Deleted.to_string(), "root.deleted.saved");
    }
}
