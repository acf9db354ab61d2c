//! redb table definitions for the edit log.
//!
//! Records are keyed by a monotonically increasing `u64` sequence number
//! and stored as JSON-serialized `&[u8]` values.

use redb::TableDefinition;

/// Replica add/update/delete records keyed by sequence number.
pub const REPLICA_JOURNAL: TableDefinition<u64, &[u8]> = TableDefinition::new("replica_journal");
