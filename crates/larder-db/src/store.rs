use larder_common::{MigrationRecord, Result};

/// Durable, append-only record of completed migration identifiers.
///
/// Implementations must read through to the database on every call:
/// separate processes may be running against the same store.
pub trait MigrationStore {
    /// Create the backing table if it is missing. Repeat calls are no-ops.
    fn ensure_initialized(&self) -> Result<()>;

    fn has_applied(&self, identifier: &str) -> Result<bool>;

    /// Insert a record for `identifier` unless one already exists.
    ///
    /// Returns `false` when another writer got there first. That case is
    /// not an error.
    fn mark_applied(&self, identifier: &str) -> Result<bool>;

    /// All records, oldest first.
    fn applied(&self) -> Result<Vec<MigrationRecord>>;
}
