// ============================================================================
// Records
// ============================================================================
//
// A Record is the single in-memory object for one (type, id) pair. The
// store owns the identity map around it and drives its state machine;
// the record owns its attribute storage.
//
// ============================================================================

#[allow(clippy::module_inception)]
pub mod record;
pub mod state;

pub use record::{Record, RecordRef};
pub use state::{CommitKind, RecordState};
