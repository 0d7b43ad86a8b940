use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub executable: String,
    pub hostname: String,
    pub pid: i32,
    pub thread_id: u64,
    pub updated_at: DateTime<Utc>,
}

/// A worker's derived slice of hash-partitioned work, handed out by the
/// Heartbeat Service (§4.5). Must not be cached across loop iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub assigned_shard: u32,
    pub total_shards: u32,
}
