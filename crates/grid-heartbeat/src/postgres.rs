//! Postgres-backed heartbeat registry. Table shape assumed:
//! `heartbeats(executable, hostname, pid, thread_id, updated_at)`, primary
//! key `(executable, hostname, pid, thread_id)`.

use async_trait::async_trait;
use grid_models::ShardAssignment;
use sqlx::Row;

use crate::{assign_shard, HeartbeatId, HeartbeatService, DEFAULT_STALE_AFTER};

pub struct PostgresHeartbeatService {
    pool: sqlx::PgPool,
    stale_after: std::time::Duration,
}

impl PostgresHeartbeatService {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: std::time::Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

#[async_trait]
impl HeartbeatService for PostgresHeartbeatService {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn sanity_check(&self, executable: &str, hostname: &str) {
        let stale_seconds = self.stale_after.as_secs() as f64;
        if let Err(err) = sqlx::query(
            r#"delete from heartbeats
               where executable = $1 and hostname = $2
                 and updated_at < now() - make_interval(secs => $3)"#,
        )
        .bind(executable)
        .bind(hostname)
        .bind(stale_seconds)
        .execute(&self.pool)
        .await
        {
            tracing::warn!(?err, executable, hostname, "heartbeat sanity_check failed");
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn live(&self, id: &HeartbeatId) -> ShardAssignment {
        let stale_seconds = self.stale_after.as_secs() as f64;
        let upsert = sqlx::query(
            r#"insert into heartbeats (executable, hostname, pid, thread_id, updated_at)
               values ($1, $2, $3, $4, now())
               on conflict (executable, hostname, pid, thread_id)
               do update set updated_at = excluded.updated_at"#,
        )
        .bind(&id.executable)
        .bind(&id.hostname)
        .bind(id.pid)
        .bind(id.thread_id as i64)
        .execute(&self.pool)
        .await;

        if let Err(err) = upsert {
            tracing::error!(?err, "failed to upsert heartbeat; assuming sole worker");
            return ShardAssignment {
                assigned_shard: 0,
                total_shards: 1,
            };
        }

        let rows = sqlx::query(
            r#"select hostname, pid, thread_id from heartbeats
               where executable = $1 and updated_at >= now() - make_interval(secs => $2)
               order by hostname, pid, thread_id"#,
        )
        .bind(&id.executable)
        .bind(stale_seconds)
        .fetch_all(&self.pool)
        .await;

        let peers: Vec<(String, i32, u64)> = match rows {
            Ok(rows) => rows
                .into_iter()
                .map(|row| {
                    (
                        row.get::<String, _>("hostname"),
                        row.get::<i32, _>("pid"),
                        row.get::<i64, _>("thread_id") as u64,
                    )
                })
                .collect(),
            Err(err) => {
                tracing::error!(?err, "failed to list live heartbeats; assuming sole worker");
                Vec::new()
            }
        };

        assign_shard(peers, (id.hostname.clone(), id.pid, id.thread_id))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn die(&self, id: &HeartbeatId) {
        if let Err(err) = sqlx::query(
            "delete from heartbeats where executable = $1 and hostname = $2 and pid = $3 and thread_id = $4",
        )
        .bind(&id.executable)
        .bind(&id.hostname)
        .bind(id.pid)
        .bind(id.thread_id as i64)
        .execute(&self.pool)
        .await
        {
            tracing::warn!(?err, "failed to remove heartbeat on die");
        }
    }
}
