//! Heartbeat Service (§4.5): a process-liveness registry workers use to
//! derive a dense `(assigned_shard, total_shards)` numbering from their live
//! peers. Workers must not cache the result across loop iterations — peer
//! count changes as processes start, die, or go stale.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grid_models::ShardAssignment;

pub const DEFAULT_STALE_AFTER: std::time::Duration = std::time::Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct HeartbeatId {
    pub executable: String,
    pub hostname: String,
    pub pid: i32,
    pub thread_id: u64,
}

#[async_trait]
pub trait HeartbeatService: Send + Sync {
    /// Removes entries for `executable` on `hostname` that are older than
    /// the stale threshold.
    async fn sanity_check(&self, executable: &str, hostname: &str);

    /// Atomically upserts the caller's heartbeat, then returns a
    /// deterministic dense numbering of currently-live peers sharing the
    /// same executable, ordered by `(hostname, pid, thread_id)`.
    async fn live(&self, id: &HeartbeatId) -> ShardAssignment;

    async fn die(&self, id: &HeartbeatId);
}

/// Pure numbering function shared by both backends: given the full set of
/// live peer ids (already stale-filtered) and the caller's own id, returns
/// its dense ordinal and the peer count.
pub fn assign_shard(mut peers: Vec<(String, i32, u64)>, self_key: (String, i32, u64)) -> ShardAssignment {
    if !peers.contains(&self_key) {
        peers.push(self_key.clone());
    }
    peers.sort();
    peers.dedup();
    let total_shards = peers.len() as u32;
    let assigned_shard = peers
        .iter()
        .position(|p| *p == self_key)
        .expect("self_key was just inserted") as u32;
    ShardAssignment {
        assigned_shard,
        total_shards,
    }
}

pub fn is_stale(updated_at: DateTime<Utc>, now: DateTime<Utc>, stale_after: std::time::Duration) -> bool {
    let age = now - updated_at;
    age > chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_shard_orders_by_host_pid_thread() {
        let peers = vec![
            ("host-a".to_string(), 100, 1u64),
            ("host-b".to_string(), 50, 1u64),
        ];
        let assignment = assign_shard(peers, ("host-a".to_string(), 100, 1));
        assert_eq!(assignment.total_shards, 2);
        assert_eq!(assignment.assigned_shard, 0);
    }

    #[test]
    fn stale_threshold_is_exclusive_at_the_boundary() {
        let now = Utc::now();
        let updated_at = now - chrono::Duration::seconds(3600);
        assert!(!is_stale(updated_at, now, DEFAULT_STALE_AFTER));
        let updated_at = now - chrono::Duration::seconds(3601);
        assert!(is_stale(updated_at, now, DEFAULT_STALE_AFTER));
    }
}
