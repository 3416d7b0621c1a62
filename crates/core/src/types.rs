/// Jobs are identified by random v4 UUIDs, allocated by the ledger.
pub type JobId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
