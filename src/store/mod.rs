//! Audit & tally store: the only authoritative persistent state in the
//! pipeline. Audit rows are written by validation workers, tally rows by
//! the aggregator; readers project over tallies only and never join
//! against the audit log.

mod audit;
mod sqlite;
mod tally;

pub use audit::{AuditRecord, AuditRow, AuditStore};
pub use sqlite::{open_pool, StoreError};
pub use tally::{
    Election, ElectionDelta, ElectionTallyRow, LawDelta, LawTallyRow, ReconciliationReport,
    TallyStore,
};
