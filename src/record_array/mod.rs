// ============================================================================
// Record Arrays
// ============================================================================
//
// Live collections over records of one type: the per-type "all" array,
// predicate-filtered arrays, adapter-populated query results and the
// backing arrays of to-many relationships.
//
// ============================================================================

pub mod array;
pub mod manager;

pub use array::{RecordArray, RecordArrayKind, RecordArrayRef};
pub use manager::{Predicate, RecordArrayManager, default_predicate};
