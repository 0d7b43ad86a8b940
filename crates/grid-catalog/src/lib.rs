//! Catalog Gateway (§4.1): the one interface through which workers read and
//! mutate shared state. Every operation is synchronous from the caller's
//! viewpoint and participates in exactly one transaction.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use grid_models::{
    CatalogError, DataIdentifier, DidKey, DidType, MetadataValue, Replica, ReplicaState, Rse,
    RseLimits, Rule, RuleTemplate,
};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RuleFilter {
    pub account: Option<String>,
    pub scope: Option<String>,
    pub name: Option<String>,
    pub subscription_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionFilter {
    pub account: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct RseUsage {
    pub total: i64,
    pub used: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RseCounter {
    pub bytes: i64,
}

#[derive(Debug, Clone)]
pub struct ReplicaBatchUpdate {
    pub scope: String,
    pub name: String,
    pub state: ReplicaState,
}

/// The full operation set of §4.1, as a trait so the worker crates can be
/// exercised against [`memory::MemoryCatalogGateway`] without a database.
#[async_trait]
pub trait CatalogGateway: Send + Sync {
    async fn list_new_dids(
        &self,
        shard: u32,
        total_shards: u32,
        limit: u32,
    ) -> Result<Vec<DidKey>, CatalogError>;

    async fn get_metadata(
        &self,
        scope: &str,
        name: &str,
    ) -> Result<DataIdentifier, CatalogError>;

    async fn set_new_dids_flag(&self, dids: &[DidKey], new: bool) -> Result<(), CatalogError>;

    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<grid_models::Subscription>, CatalogError>;

    async fn list_rules(&self, filter: &RuleFilter) -> Result<Vec<Rule>, CatalogError>;

    async fn add_rule(
        &self,
        did: &DidKey,
        account: &str,
        subscription_id: Option<Uuid>,
        template: &RuleTemplate,
        rse_expression_override: Option<&str>,
    ) -> Result<Rule, CatalogError>;

    async fn list_unlocked_replicas(
        &self,
        rse: &str,
        max_bytes: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Replica>, CatalogError>;

    async fn update_replicas_states(
        &self,
        rse: &str,
        batch: &[ReplicaBatchUpdate],
    ) -> Result<(), CatalogError>;

    async fn delete_replicas(&self, rse: &str, files: &[DidKey]) -> Result<(), CatalogError>;

    async fn get_rse_limits(&self, rse: &str) -> Result<RseLimits, CatalogError>;

    async fn get_rse_usage(&self, rse: &str, source: &str) -> Result<Option<RseUsage>, CatalogError>;

    async fn get_rse_counter(&self, rse: &str) -> Result<Option<RseCounter>, CatalogError>;

    async fn get_rse_protocols(&self, rse: &str) -> Result<Vec<grid_models::Protocol>, CatalogError>;

    async fn list_rses(&self) -> Result<Vec<Rse>, CatalogError>;

    async fn add_message(
        &self,
        event_type: grid_models::EventType,
        payload: serde_json::Value,
    ) -> Result<(), CatalogError>;
}

/// `hash(scope,name) mod total_shards == shard` (§4.1 guarantee).
pub fn shard_of(did: &DidKey, total_shards: u32) -> u32 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    did.scope.hash(&mut hasher);
    did.name.hash(&mut hasher);
    (hasher.finish() % total_shards as u64) as u32
}

/// Evaluates whether `did`'s metadata satisfies `did_type == DATASET |
/// CONTAINER` and is not hidden, per §4.6 step 3.
pub fn is_evaluable(did: &DataIdentifier) -> bool {
    matches!(did.did_type, DidType::Dataset | DidType::Container) && !did.hidden
}

pub fn metadata_value_as_string(value: &MetadataValue) -> String {
    value.to_string()
}

/// Remaining free bytes on an RSE given total/used counters (§4.7.1).
pub fn free_bytes(usage: RseUsage) -> i64 {
    usage.total - usage.used
}
