//! Reaper Worker (§4.7): consumes a partition of RSEs, computes deletion
//! budgets, deletes expired replicas through the storage protocol driver.

pub mod budget;

use std::collections::HashMap;
use std::time::Instant;

use grid_catalog::{CatalogGateway, ReplicaBatchUpdate};
use grid_models::{DidKey, EventType, ReplicaState, Rse, StorageError};
use grid_storage::{DriverRegistry, Lfn};

const DEFAULT_LIST_LIMIT: i64 = 10000;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub chunk_size: usize,
    pub greedy: bool,
    /// When set, only RSE protocols of this scheme are considered.
    pub scheme: Option<String>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            greedy: false,
            scheme: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct IterationCounters {
    pub deletion_being_deleted: u64,
    pub deletion_done: u64,
    pub deletion_failed: u64,
    pub rses_skipped_unavailable: u64,
    pub rses_skipped_no_protocol: u64,
    pub job_error: u64,
}

impl IterationCounters {
    pub fn emit(&self) {
        tracing::info!(
            deletion_being_deleted = self.deletion_being_deleted,
            deletion_done = self.deletion_done,
            deletion_failed = self.deletion_failed,
            rses_skipped_unavailable = self.rses_skipped_unavailable,
            rses_skipped_no_protocol = self.rses_skipped_no_protocol,
            job_error = self.job_error,
            "reaper iteration counters"
        );
    }
}

/// Runs one full worker iteration (§4.7 step 1) over `rses`, the caller's
/// assigned partition.
pub async fn run_iteration(
    catalog: &dyn CatalogGateway,
    registry: &DriverRegistry,
    rses: &[Rse],
    config: &ReaperConfig,
) -> IterationCounters {
    let mut counters = IterationCounters::default();
    for rse in rses {
        process_rse(catalog, registry, rse, config, &mut counters).await;
    }
    counters.emit();
    counters
}

async fn process_rse(
    catalog: &dyn CatalogGateway,
    registry: &DriverRegistry,
    rse: &Rse,
    config: &ReaperConfig,
    counters: &mut IterationCounters,
) {
    if !rse.availability_delete {
        counters.rses_skipped_unavailable += 1;
        return;
    }

    let protocols = match catalog.get_rse_protocols(&rse.name).await {
        Ok(protocols) => protocols,
        Err(err) => {
            tracing::error!(?err, rse = %rse.name, "failed to fetch RSE protocols");
            counters.job_error += 1;
            return;
        }
    };

    let Some(protocol) = protocols
        .iter()
        .find(|p| config.scheme.as_deref().map_or(true, |scheme| p.scheme == scheme))
    else {
        counters.rses_skipped_no_protocol += 1;
        return;
    };

    let (max_being_deleted_files, needed_free_space) = if config.greedy {
        (None, None)
    } else {
        let limits = match catalog.get_rse_limits(&rse.name).await {
            Ok(limits) => limits,
            Err(err) => {
                tracing::error!(?err, rse = %rse.name, "failed to fetch RSE limits");
                counters.job_error += 1;
                return;
            }
        };
        let usage = match catalog.get_rse_usage(&rse.name, "srm").await {
            Ok(usage) => usage,
            Err(err) => {
                tracing::error!(?err, rse = %rse.name, "failed to fetch RSE usage");
                counters.job_error += 1;
                return;
            }
        };
        let counter = match catalog.get_rse_counter(&rse.name).await {
            Ok(counter) => counter,
            Err(err) => {
                tracing::error!(?err, rse = %rse.name, "failed to fetch RSE counter");
                counters.job_error += 1;
                return;
            }
        };
        let b = budget::compute_budget(rse.limits, usage, counter);
        (b.max_being_deleted_files, b.needed_free_space)
    };

    let limit = max_being_deleted_files.unwrap_or(DEFAULT_LIST_LIMIT).max(0) as u32;
    let replicas = match catalog
        .list_unlocked_replicas(&rse.name, needed_free_space, limit)
        .await
    {
        Ok(replicas) => replicas,
        Err(err) => {
            tracing::error!(?err, rse = %rse.name, "failed to list unlocked replicas");
            counters.job_error += 1;
            return;
        }
    };

    for chunk in replicas.chunks(config.chunk_size.max(1)) {
        let updates: Vec<ReplicaBatchUpdate> = chunk
            .iter()
            .map(|r| ReplicaBatchUpdate {
                scope: r.scope.clone(),
                name: r.name.clone(),
                state: ReplicaState::BeingDeleted,
            })
            .collect();
        if let Err(err) = catalog.update_replicas_states(&rse.name, &updates).await {
            tracing::error!(?err, rse = %rse.name, "failed to mark chunk BEING_DELETED");
            counters.job_error += 1;
            continue;
        }
        counters.deletion_being_deleted += chunk.len() as u64;

        let lfns: Vec<Lfn> = chunk
            .iter()
            .map(|r| Lfn {
                scope: r.scope.clone(),
                name: r.name.clone(),
                path: r.path.clone(),
                bytes: r.bytes,
            })
            .collect();

        let mut driver = match registry.driver_for(protocol) {
            Ok(driver) => driver,
            Err(err) => {
                tracing::error!(?err, rse = %rse.name, "no driver for RSE protocol");
                counters.job_error += 1;
                continue;
            }
        };
        let pfns = driver.lfns2pfns(&lfns);

        for lfn in &lfns {
            let url = pfns.get(&lfn.key());
            let payload = serde_json::json!({
                "scope": lfn.scope,
                "name": lfn.name,
                "file-size": lfn.bytes,
                "url": url,
                "rse": rse.name,
            });
            if let Err(err) = catalog.add_message(EventType::DeletionPlanned, payload).await {
                tracing::warn!(?err, "failed to emit deletion-planned message");
            }
        }

        if let Err(err) = driver.connect().await {
            tracing::error!(?err, rse = %rse.name, "failed to connect storage driver");
            counters.job_error += 1;
            continue;
        }

        let mut deleted_files = Vec::new();
        for lfn in &lfns {
            let Some(pfn) = pfns.get(&lfn.key()) else {
                tracing::error!(key = %lfn.key(), "driver produced no PFN for LFN");
                continue;
            };
            let start = Instant::now();
            match driver.delete(pfn).await {
                Ok(()) => {
                    let duration = start.elapsed().as_secs_f64();
                    deleted_files.push(DidKey::new(lfn.scope.clone(), lfn.name.clone()));
                    counters.deletion_done += 1;
                    let payload = serde_json::json!({
                        "scope": lfn.scope,
                        "name": lfn.name,
                        "rse": rse.name,
                        "file-size": lfn.bytes,
                        "url": pfn,
                        "duration": duration,
                    });
                    if let Err(err) = catalog.add_message(EventType::DeletionDone, payload).await {
                        tracing::warn!(?err, "failed to emit deletion-done message");
                    }
                }
                Err(StorageError::SourceNotFound(_)) => {
                    counters.deletion_failed += 1;
                    emit_deletion_failed(catalog, &rse.name, lfn, pfn, "not found (already deleted?)").await;
                }
                Err(StorageError::ServiceUnavailable(reason)) => {
                    counters.deletion_failed += 1;
                    emit_deletion_failed(catalog, &rse.name, lfn, pfn, &reason).await;
                }
                Err(err) => {
                    tracing::error!(?err, rse = %rse.name, scope = %lfn.scope, name = %lfn.name, "unclassified delete failure; leaving replica BEING_DELETED");
                }
            }
        }

        if let Err(err) = driver.close().await {
            tracing::warn!(?err, rse = %rse.name, "failed to close storage driver");
        }

        if !deleted_files.is_empty() {
            if let Err(err) = catalog.delete_replicas(&rse.name, &deleted_files).await {
                tracing::error!(?err, rse = %rse.name, "failed to finalize deleted replicas");
                counters.job_error += 1;
            }
        }
    }
}

async fn emit_deletion_failed(
    catalog: &dyn CatalogGateway,
    rse: &str,
    lfn: &Lfn,
    url: &str,
    reason: &str,
) {
    let payload = serde_json::json!({
        "scope": lfn.scope,
        "name": lfn.name,
        "rse": rse,
        "file-size": lfn.bytes,
        "url": url,
        "reason": reason,
    });
    if let Err(err) = catalog.add_message(EventType::DeletionFailed, payload).await {
        tracing::warn!(?err, "failed to emit deletion-failed message");
    }
}

/// Partitions `rses` across `total_workers`, per §4.8.
pub fn partition_rses(rses: &[Rse], total_workers: u32) -> Vec<Vec<Rse>> {
    grid_supervisor::partition(rses, total_workers)
}

/// Filters `universe` down to the RSE names in `names`, preserving none of
/// the `--rses` entries that don't exist in the catalog (logged, not fatal).
pub fn select_rses(universe: Vec<Rse>, names: &[String]) -> Vec<Rse> {
    if names.is_empty() {
        return universe;
    }
    let wanted: HashMap<&str, ()> = names.iter().map(|n| (n.as_str(), ())).collect();
    universe
        .into_iter()
        .filter(|rse| wanted.contains_key(rse.name.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use grid_catalog::memory::MemoryCatalogGateway;
    use grid_models::{AttributeValue, Protocol, Replica, RseLimits};
    use std::collections::HashMap as StdHashMap;

    fn rse_with_protocol(name: &str, availability_delete: bool) -> Rse {
        Rse {
            id: uuid::Uuid::new_v4(),
            name: name.to_string(),
            attributes: StdHashMap::<String, AttributeValue>::new(),
            protocols: vec![Protocol {
                scheme: "mock".into(),
                r#impl: "mock.Default".into(),
                hostname: format!("{name}.example.org"),
                port: 0,
                prefix: "/data".into(),
                extended_attributes: Default::default(),
            }],
            limits: RseLimits::default(),
            usage: StdHashMap::new(),
            availability_delete,
            availability_write: true,
            blacklisted: false,
            weight: None,
        }
    }

    fn registry() -> DriverRegistry {
        let mut reg = DriverRegistry::new(true);
        reg.register_mock("mock", "mock.Default");
        reg
    }

    /// A registry whose mock driver already believes `pfn` exists remotely,
    /// so a delete attempt against it succeeds.
    fn registry_with_present(pfn: String) -> DriverRegistry {
        use grid_storage::mock::{MockProtocolConfig, MockProtocolDriver};
        use std::sync::Arc;
        let factory: grid_storage::DriverFactory = Arc::new(move |protocol| {
            Box::new(
                MockProtocolDriver::new(MockProtocolConfig {
                    scheme: protocol.scheme.clone(),
                    hostname: protocol.hostname.clone(),
                    port: protocol.port,
                    web_service_path: String::new(),
                    prefix: protocol.prefix.clone(),
                })
                .with_present([pfn.clone()]),
            ) as Box<dyn grid_storage::ProtocolDriver>
        });
        let mut reg = DriverRegistry::new(true);
        reg.register("mock", "mock.Default", factory);
        reg
    }

    #[tokio::test]
    async fn unavailable_rse_is_skipped() {
        let catalog = MemoryCatalogGateway::default();
        let reg = registry();
        let rse = rse_with_protocol("RSE1", false);
        let counters = run_iteration(&catalog, &reg, &[rse], &ReaperConfig::default()).await;
        assert_eq!(counters.rses_skipped_unavailable, 1);
        assert_eq!(counters.deletion_done, 0);
    }

    #[tokio::test]
    async fn greedy_mode_deletes_every_reapable_replica() {
        let catalog = MemoryCatalogGateway::default();
        let rse = rse_with_protocol("RSE1", true);
        catalog.seed_rse(rse.clone());
        let now = chrono::Utc::now();
        catalog.seed_replica(
            Replica {
                scope: "mc16".into(),
                name: "file001".into(),
                rse_id: rse.id,
                bytes: 1024,
                state: ReplicaState::Available,
                tombstone: Some(now - chrono::Duration::seconds(1)),
                locked_count: 0,
                path: None,
            },
            &rse.name,
        );
        let pfn = format!("mock://{}.example.org/data/mc16/file001", rse.name);
        let reg = registry_with_present(pfn);
        let config = ReaperConfig {
            greedy: true,
            ..ReaperConfig::default()
        };
        let counters = run_iteration(&catalog, &reg, &[rse], &config).await;
        assert_eq!(counters.deletion_done, 1);
        assert_eq!(counters.deletion_being_deleted, 1);
    }

    #[tokio::test]
    async fn source_not_found_is_reported_as_deletion_failed_without_blocking_finalization() {
        let catalog = MemoryCatalogGateway::default();
        let rse = rse_with_protocol("RSE1", true);
        catalog.seed_rse(rse.clone());
        let now = chrono::Utc::now();
        catalog.seed_replica(
            Replica {
                scope: "mc16".into(),
                name: "file002".into(),
                rse_id: rse.id,
                bytes: 512,
                state: ReplicaState::Available,
                tombstone: Some(now - chrono::Duration::seconds(1)),
                locked_count: 0,
                path: None,
            },
            &rse.name,
        );
        let reg = registry();
        let config = ReaperConfig {
            greedy: true,
            ..ReaperConfig::default()
        };
        let counters = run_iteration(&catalog, &reg, &[rse.clone()], &config).await;
        assert_eq!(counters.deletion_failed, 1);
        assert_eq!(counters.deletion_done, 0);
        // replica stays in BEING_DELETED for out-of-band reconciliation, not re-deleted.
        let replicas = catalog.replicas_for(&rse.name);
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].state, ReplicaState::BeingDeleted);
    }

    #[test]
    fn select_rses_filters_to_named_subset() {
        let universe = vec![rse_with_protocol("A", true), rse_with_protocol("B", true)];
        let chosen = select_rses(universe, &["B".to_string()]);
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].name, "B");
    }
}
