//! Supervisor (§4.8): spawns workers, partitions work, relays a graceful
//! stop signal, joins. Shared by the `transmogrifier` and `reaper` binaries.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Notify;

/// A cancellation token set exactly once, by `SIGINT` or `SIGTERM`, and
/// cheaply cloneable so every spawned worker can observe it independently.
#[derive(Clone)]
pub struct StopToken {
    notify: Arc<Notify>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            stopped: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Resolves once `stop` has been called; a no-op wait if already
    /// stopped, so late subscribers don't block forever.
    pub async fn stopped(&self) {
        if self.is_stopped() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Listens for `SIGINT` and `SIGTERM` (on unix) and sets `token` on the
/// first of either. Intended to be spawned once at process start.
#[cfg(unix)]
pub async fn watch_signals(token: StopToken) {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(?err, "failed to install SIGTERM handler");
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("caught SIGINT; stopping"),
        _ = sigterm.recv() => tracing::info!("caught SIGTERM; stopping"),
    }
    token.stop();
}

#[cfg(not(unix))]
pub async fn watch_signals(token: StopToken) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("caught ctrl-c; stopping");
    token.stop();
}

/// Spawns `count` workers built by `make_worker(shard, total)`, then joins
/// them, waking every ~3 seconds so a stop signal is observed promptly
/// (§4.8). Returns once every worker has exited.
pub async fn run_sharded_workers<F, Fut>(count: u32, make_worker: F)
where
    F: Fn(u32, u32) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut handles = Vec::with_capacity(count as usize);
    for shard in 0..count {
        handles.push(tokio::spawn(make_worker(shard, count)));
    }
    join_with_heartbeat(handles).await;
}

/// Spawns one worker per partition returned by [`partition`], joining the
/// same way as [`run_sharded_workers`].
pub async fn run_partitioned_workers<T, F, Fut>(partitions: Vec<Vec<T>>, make_worker: F)
where
    T: Send + 'static,
    F: Fn(Vec<T>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut handles = Vec::with_capacity(partitions.len());
    for part in partitions {
        handles.push(tokio::spawn(make_worker(part)));
    }
    join_with_heartbeat(handles).await;
}

async fn join_with_heartbeat(mut handles: Vec<tokio::task::JoinHandle<()>>) {
    while !handles.is_empty() {
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        let mut still_running = Vec::with_capacity(handles.len());
        for handle in handles {
            if handle.is_finished() {
                if let Err(err) = handle.await {
                    tracing::error!(?err, "worker task panicked");
                }
            } else {
                still_running.push(handle);
            }
        }
        handles = still_running;
    }
}

/// Splits `items` into `total_workers` partitions of `ceil(len/total)` size,
/// assigning the tail remainder to the last partition rather than leaving
/// `len % total_workers` items unassigned (§9 open question decision).
pub fn partition<T: Clone>(items: &[T], total_workers: u32) -> Vec<Vec<T>> {
    if total_workers == 0 || items.is_empty() {
        return Vec::new();
    }
    let len = items.len() as u32;
    let chunk_size = ((len + total_workers - 1) / total_workers) as usize;
    let mut out: Vec<Vec<T>> = items.chunks(chunk_size.max(1)).map(|c| c.to_vec()).collect();
    // div_ceil sizing already guarantees every item is covered; but if
    // total_workers exceeds the item count, pad with empty partitions so
    // callers always get exactly `total_workers` shards.
    while out.len() < total_workers as usize {
        out.push(Vec::new());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use grid_models::{Protocol, Rse, RseLimits};
    use std::collections::HashMap;

    fn rse(name: &str) -> Rse {
        Rse {
            id: uuid::Uuid::new_v4(),
            name: name.to_string(),
            attributes: HashMap::new(),
            protocols: vec![Protocol {
                scheme: "gsiftp".into(),
                r#impl: "gfal.Default".into(),
                hostname: format!("{name}.example.org"),
                port: 0,
                prefix: "/data".into(),
                extended_attributes: Default::default(),
            }],
            limits: RseLimits::default(),
            usage: Default::default(),
            availability_delete: true,
            availability_write: true,
            blacklisted: false,
            weight: None,
        }
    }

    #[test]
    fn partition_assigns_every_rse_including_the_remainder() {
        let rses: Vec<Rse> = (0..7).map(|i| rse(&format!("RSE_{i}"))).collect();
        let parts = partition(&rses, 3);
        assert_eq!(parts.len(), 3);
        let total: usize = parts.iter().map(|p| p.len()).sum();
        assert_eq!(total, 7);
    }

    #[test]
    fn partition_pads_when_workers_exceed_items() {
        let rses: Vec<Rse> = (0..2).map(|i| rse(&format!("RSE_{i}"))).collect();
        let parts = partition(&rses, 5);
        assert_eq!(parts.len(), 5);
        let total: usize = parts.iter().map(|p| p.len()).sum();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn stop_token_resolves_stopped_waiters_immediately_after_stop() {
        let token = StopToken::new();
        token.stop();
        assert!(token.is_stopped());
        token.stopped().await;
    }
}
