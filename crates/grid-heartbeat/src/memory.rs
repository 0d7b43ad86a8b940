//! An in-memory heartbeat registry for worker-loop tests that need multiple
//! simulated peers without a database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use grid_models::{Heartbeat, ShardAssignment};

use crate::{assign_shard, is_stale, HeartbeatId, HeartbeatService, DEFAULT_STALE_AFTER};

#[derive(Default)]
pub struct MemoryHeartbeatService {
    entries: Mutex<HashMap<(String, String, i32, u64), Heartbeat>>,
}

impl MemoryHeartbeatService {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(id: &HeartbeatId) -> (String, String, i32, u64) {
        (
            id.executable.clone(),
            id.hostname.clone(),
            id.pid,
            id.thread_id,
        )
    }
}

#[async_trait]
impl HeartbeatService for MemoryHeartbeatService {
    async fn sanity_check(&self, executable: &str, hostname: &str) {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|(exe, host, _, _), hb| {
            !(exe == executable && host == hostname) || !is_stale(hb.updated_at, now, DEFAULT_STALE_AFTER)
        });
    }

    async fn live(&self, id: &HeartbeatId) -> ShardAssignment {
        let mut entries = self.entries.lock().unwrap();
        let now = Utc::now();
        entries.insert(
            Self::key(id),
            Heartbeat {
                executable: id.executable.clone(),
                hostname: id.hostname.clone(),
                pid: id.pid,
                thread_id: id.thread_id,
                updated_at: now,
            },
        );

        let peers: Vec<(String, i32, u64)> = entries
            .values()
            .filter(|hb| hb.executable == id.executable && !is_stale(hb.updated_at, now, DEFAULT_STALE_AFTER))
            .map(|hb| (hb.hostname.clone(), hb.pid, hb.thread_id))
            .collect();

        assign_shard(peers, (id.hostname.clone(), id.pid, id.thread_id))
    }

    async fn die(&self, id: &HeartbeatId) {
        self.entries.lock().unwrap().remove(&Self::key(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(host: &str, pid: i32) -> HeartbeatId {
        HeartbeatId {
            executable: "reaper".to_string(),
            hostname: host.to_string(),
            pid,
            thread_id: 0,
        }
    }

    #[tokio::test]
    async fn two_live_peers_get_distinct_dense_shards() {
        let svc = MemoryHeartbeatService::new();
        let a = svc.live(&id("host-a", 1)).await;
        let b = svc.live(&id("host-b", 2)).await;
        assert_eq!(a.total_shards, 2);
        assert_eq!(b.total_shards, 2);
        assert_ne!(a.assigned_shard, b.assigned_shard);
    }

    #[tokio::test]
    async fn die_shrinks_the_peer_set_seen_by_survivors() {
        let svc = MemoryHeartbeatService::new();
        let a = id("host-a", 1);
        let b = id("host-b", 2);
        svc.live(&a).await;
        svc.live(&b).await;
        svc.die(&a).await;
        let reassigned = svc.live(&b).await;
        assert_eq!(reassigned.total_shards, 1);
        assert_eq!(reassigned.assigned_shard, 0);
    }
}
