//! An in-process fake standing in for the catalog in worker-loop tests,
//! grounded on the same operation set the Postgres implementation exposes.
//! Not a toy: it enforces the same invariants (DID uniqueness, at-most-one
//! rule per `(did, subscription, rse)`) so tests exercise real semantics.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use grid_models::{
    CatalogError, DataIdentifier, DidKey, Message, Protocol, Replica, ReplicaState, Rse,
    RseLimits, Rule, RuleTemplate, Subscription,
};
use uuid::Uuid;

use crate::{
    shard_of, CatalogGateway, ReplicaBatchUpdate, RseCounter, RseUsage, RuleFilter,
    SubscriptionFilter,
};

#[derive(Default)]
struct State {
    dids: HashMap<(String, String), (DataIdentifier, bool)>,
    subscriptions: Vec<Subscription>,
    rules: Vec<Rule>,
    replicas: HashMap<(String, String), Replica>,
    rses: HashMap<String, Rse>,
    messages: Vec<Message>,
}

/// An in-memory [`CatalogGateway`]. Cheaply cloneable; clones share state.
#[derive(Default)]
pub struct MemoryCatalogGateway {
    state: Mutex<State>,
}

impl MemoryCatalogGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_did(&self, did: DataIdentifier, is_new: bool) {
        let mut state = self.state.lock().unwrap();
        state
            .dids
            .insert((did.scope.clone(), did.name.clone()), (did, is_new));
    }

    pub fn seed_subscription(&self, subscription: Subscription) {
        self.state.lock().unwrap().subscriptions.push(subscription);
    }

    pub fn seed_rse(&self, rse: Rse) {
        self.state.lock().unwrap().rses.insert(rse.name.clone(), rse);
    }

    pub fn seed_replica(&self, replica: Replica, rse_name: &str) {
        self.state
            .lock()
            .unwrap()
            .replicas
            .insert((rse_name.to_string(), replica.name.clone()), replica);
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.state.lock().unwrap().rules.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().unwrap().messages.clone()
    }

    pub fn replicas_for(&self, rse_name: &str) -> Vec<Replica> {
        self.state
            .lock()
            .unwrap()
            .replicas
            .iter()
            .filter(|((rse, _), _)| rse == rse_name)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl CatalogGateway for MemoryCatalogGateway {
    async fn list_new_dids(
        &self,
        shard: u32,
        total_shards: u32,
        limit: u32,
    ) -> Result<Vec<DidKey>, CatalogError> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<DidKey> = state
            .dids
            .values()
            .filter(|(_, is_new)| *is_new)
            .map(|(did, _)| did.key())
            .filter(|key| shard_of(key, total_shards) == shard)
            .collect();
        out.sort_by(|a, b| (a.scope.as_str(), a.name.as_str()).cmp(&(b.scope.as_str(), b.name.as_str())));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn get_metadata(&self, scope: &str, name: &str) -> Result<DataIdentifier, CatalogError> {
        let state = self.state.lock().unwrap();
        state
            .dids
            .get(&(scope.to_string(), name.to_string()))
            .map(|(did, _)| did.clone())
            .ok_or_else(|| CatalogError::DataIdentifierNotFound {
                scope: scope.to_string(),
                name: name.to_string(),
            })
    }

    async fn set_new_dids_flag(&self, dids: &[DidKey], new: bool) -> Result<(), CatalogError> {
        let mut state = self.state.lock().unwrap();
        for did in dids {
            if let Some(entry) = state
                .dids
                .get_mut(&(did.scope.clone(), did.name.clone()))
            {
                entry.1 = new;
            }
        }
        Ok(())
    }

    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<Subscription>, CatalogError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| filter.account.as_deref().map_or(true, |a| a == s.account))
            .filter(|s| filter.name.as_deref().map_or(true, |n| n == s.name))
            .cloned()
            .collect())
    }

    async fn list_rules(&self, filter: &RuleFilter) -> Result<Vec<Rule>, CatalogError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .rules
            .iter()
            .filter(|r| filter.account.as_deref().map_or(true, |a| a == r.account))
            .filter(|r| filter.scope.as_deref().map_or(true, |s| s == r.did.scope))
            .filter(|r| filter.name.as_deref().map_or(true, |n| n == r.did.name))
            .filter(|r| {
                filter
                    .subscription_id
                    .map_or(true, |id| r.subscription_id == Some(id))
            })
            .cloned()
            .collect())
    }

    async fn add_rule(
        &self,
        did: &DidKey,
        account: &str,
        subscription_id: Option<Uuid>,
        template: &RuleTemplate,
        rse_expression_override: Option<&str>,
    ) -> Result<Rule, CatalogError> {
        let mut state = self.state.lock().unwrap();
        let rse_expression = rse_expression_override
            .map(str::to_string)
            .unwrap_or_else(|| template.rse_expression.clone());

        let duplicate = state.rules.iter().any(|r| {
            r.did == *did
                && r.subscription_id == subscription_id
                && r.rse_expression == rse_expression
        });
        if duplicate {
            return Err(CatalogError::DuplicateRule);
        }
        if template.copies == 0 {
            return Err(CatalogError::InvalidReplicationRule(
                "copies must be >= 1".to_string(),
            ));
        }

        let rule = Rule {
            id: Uuid::new_v4(),
            did: did.clone(),
            account: account.to_string(),
            subscription_id,
            child_rule_id: None,
            copies: template.copies,
            rse_expression,
            grouping: template.grouping,
            lifetime: template.lifetime,
            weight: template.weight.clone(),
            locked: template.locked,
            source_replica_expression: template.source_replica_expression.clone(),
            activity: template.activity.clone(),
            purge_replicas: template.purge_replicas,
            ignore_availability: template.ignore_availability,
            comments: None,
        };
        state.rules.push(rule.clone());
        Ok(rule)
    }

    async fn list_unlocked_replicas(
        &self,
        rse: &str,
        max_bytes: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Replica>, CatalogError> {
        let state = self.state.lock().unwrap();
        let now = Utc::now();
        let mut candidates: Vec<Replica> = state
            .replicas
            .iter()
            .filter(|((r, _), _)| r == rse)
            .map(|(_, replica)| replica.clone())
            .filter(|replica| replica.is_reapable(now))
            .collect();
        candidates.sort_by(|a, b| a.name.cmp(&b.name));

        let mut out = Vec::new();
        let mut bytes_collected = 0i64;
        for replica in candidates {
            if out.len() as u32 >= limit {
                break;
            }
            if let Some(target) = max_bytes {
                if target > 0 && bytes_collected >= target {
                    break;
                }
            }
            bytes_collected += replica.bytes;
            out.push(replica);
        }
        Ok(out)
    }

    async fn update_replicas_states(
        &self,
        rse: &str,
        batch: &[ReplicaBatchUpdate],
    ) -> Result<(), CatalogError> {
        let mut state = self.state.lock().unwrap();
        for update in batch {
            if let Some(replica) = state
                .replicas
                .get_mut(&(rse.to_string(), update.name.clone()))
            {
                replica.state = update.state;
            }
        }
        Ok(())
    }

    async fn delete_replicas(&self, rse: &str, files: &[DidKey]) -> Result<(), CatalogError> {
        let mut state = self.state.lock().unwrap();
        for file in files {
            state.replicas.remove(&(rse.to_string(), file.name.clone()));
        }
        Ok(())
    }

    async fn get_rse_limits(&self, rse: &str) -> Result<RseLimits, CatalogError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .rses
            .get(rse)
            .map(|r| r.limits)
            .unwrap_or_default())
    }

    async fn get_rse_usage(&self, rse: &str, _source: &str) -> Result<Option<RseUsage>, CatalogError> {
        let state = self.state.lock().unwrap();
        Ok(state.rses.get(rse).and_then(|r| {
            let total = r.usage.get("total").copied();
            let used = r.usage.get("used").copied();
            match (total, used) {
                (Some(total), Some(used)) => Some(RseUsage {
                    total: total as i64,
                    used: used as i64,
                }),
                _ => None,
            }
        }))
    }

    async fn get_rse_counter(&self, rse: &str) -> Result<Option<RseCounter>, CatalogError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .rses
            .get(rse)
            .and_then(|r| r.usage.get("used").map(|bytes| RseCounter { bytes: *bytes as i64 })))
    }

    async fn get_rse_protocols(&self, rse: &str) -> Result<Vec<Protocol>, CatalogError> {
        let state = self.state.lock().unwrap();
        state
            .rses
            .get(rse)
            .map(|r| r.protocols.clone())
            .ok_or_else(|| CatalogError::GatewayException(format!("unknown RSE {rse}")))
    }

    async fn list_rses(&self) -> Result<Vec<Rse>, CatalogError> {
        let state = self.state.lock().unwrap();
        let mut rses: Vec<Rse> = state.rses.values().cloned().collect();
        rses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rses)
    }

    async fn add_message(
        &self,
        event_type: grid_models::EventType,
        payload: serde_json::Value,
    ) -> Result<(), CatalogError> {
        let mut state = self.state.lock().unwrap();
        state.messages.push(Message {
            id: Uuid::new_v4(),
            event_type,
            payload,
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grid_models::{DidType, Grouping};

    fn did(scope: &str, name: &str) -> DataIdentifier {
        DataIdentifier {
            scope: scope.to_string(),
            name: name.to_string(),
            did_type: DidType::Dataset,
            hidden: false,
            metadata: Default::default(),
        }
    }

    fn template() -> RuleTemplate {
        RuleTemplate {
            copies: 2,
            rse_expression: "tier=1".to_string(),
            grouping: Grouping::Dataset,
            lifetime: None,
            weight: None,
            locked: false,
            source_replica_expression: None,
            activity: None,
            purge_replicas: false,
            ignore_availability: None,
        }
    }

    #[tokio::test]
    async fn add_rule_twice_is_duplicate() {
        let gw = MemoryCatalogGateway::new();
        let d = did("mc16", "dataset001");
        gw.seed_did(d.clone(), true);
        let key = d.key();
        gw.add_rule(&key, "acct", None, &template(), None).await.unwrap();
        let err = gw.add_rule(&key, "acct", None, &template(), None).await.unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateRule));
        assert_eq!(gw.rules().len(), 1);
    }

    #[tokio::test]
    async fn list_new_dids_only_returns_flagged_entries() {
        let gw = MemoryCatalogGateway::new();
        gw.seed_did(did("mc16", "a"), true);
        gw.seed_did(did("mc16", "b"), false);
        let shards: Vec<_> = (0..4)
            .map(|s| gw.list_new_dids(s, 4, 100))
            .collect();
        let results = futures::future::join_all(shards).await;
        let total: usize = results.iter().map(|r| r.as_ref().unwrap().len()).sum();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn get_metadata_on_unknown_did_is_not_found() {
        let gw = MemoryCatalogGateway::new();
        let err = gw.get_metadata("mc16", "missing").await.unwrap_err();
        assert!(matches!(err, CatalogError::DataIdentifierNotFound { .. }));
    }
}
