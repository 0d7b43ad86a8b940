//! Transmogrifier Worker (§4.6): consumes a shard of new DIDs, matches
//! subscriptions, builds rules.

pub mod matching;
pub mod normalize;

use std::collections::HashMap;

use grid_catalog::{CatalogGateway, RuleFilter, SubscriptionFilter};
use grid_models::{classify, CatalogError, Classification, DidKey, DidType, RuleTemplate, Subscription};
use grid_rse::{parse_expression, RseSelector, RseStatus};

/// Counters emitted at the end of an iteration (§4.6 step 8).
#[derive(Debug, Default, Clone)]
pub struct IterationCounters {
    pub did_processed_file: u64,
    pub did_processed_dataset: u64,
    pub did_processed_container: u64,
    pub did_processed: u64,
    pub addnewrule_done: u64,
    pub addnewrule_activity: HashMap<String, u64>,
    pub addnewrule_errortype: HashMap<String, u64>,
    pub job_done: u64,
    pub job_error: u64,
}

impl IterationCounters {
    fn record_errortype(&mut self, kind: &str) {
        *self.addnewrule_errortype.entry(kind.to_string()).or_insert(0) += 1;
    }

    fn record_activity(&mut self, activity: &str) {
        *self.addnewrule_activity.entry(activity.to_string()).or_insert(0) += 1;
    }

    /// Logs every counter as a structured tracing event; there is no
    /// separate metrics sink in this build.
    pub fn emit(&self) {
        tracing::info!(
            did_processed_file = self.did_processed_file,
            did_processed_dataset = self.did_processed_dataset,
            did_processed_container = self.did_processed_container,
            did_processed = self.did_processed,
            addnewrule_done = self.addnewrule_done,
            addnewrule_activity = ?self.addnewrule_activity,
            addnewrule_errortype = ?self.addnewrule_errortype,
            job_done = self.job_done,
            job_error = self.job_error,
            "transmogrifier iteration counters"
        );
    }
}

const MAX_ATTEMPTS: u32 = 5;

/// Runs one full worker iteration (§4.6 steps 2-7) against `shard` of
/// `total_shards`. The caller is responsible for the heartbeat call (step
/// 1) and the inter-iteration floor sleep.
pub async fn run_iteration(
    catalog: &dyn CatalogGateway,
    shard: u32,
    total_shards: u32,
    bulk: u32,
) -> IterationCounters {
    let mut counters = IterationCounters::default();

    let new_dids = match catalog.list_new_dids(shard, total_shards, bulk).await {
        Ok(dids) => dids,
        Err(err) => {
            tracing::error!(?err, "failed to list new DIDs");
            counters.job_error += 1;
            return counters;
        }
    };

    let subscriptions = match catalog
        .list_subscriptions(&SubscriptionFilter {
            account: None,
            name: None,
        })
        .await
    {
        Ok(subs) => subs.into_iter().filter(|s| s.state.is_evaluated()).collect::<Vec<_>>(),
        Err(err) => {
            tracing::error!(?err, "failed to list subscriptions");
            counters.job_error += 1;
            return counters;
        }
    };

    let universe = match catalog.list_rses().await {
        Ok(rses) => rses,
        Err(err) => {
            tracing::error!(?err, "failed to list RSEs");
            counters.job_error += 1;
            return counters;
        }
    };

    let mut processed = Vec::new();

    for did_key in &new_dids {
        let outcome = process_did(catalog, did_key, &subscriptions, &universe, &mut counters).await;
        match outcome {
            DidOutcome::Done => processed.push(did_key.clone()),
            DidOutcome::Vanished => {
                tracing::warn!(scope = %did_key.scope, name = %did_key.name, "DID vanished during processing");
                processed.push(did_key.clone());
            }
        }
    }

    mark_processed(catalog, &processed, &mut counters).await;
    counters.job_done += 1;
    counters.emit();
    counters
}

enum DidOutcome {
    Done,
    Vanished,
}

async fn process_did(
    catalog: &dyn CatalogGateway,
    did_key: &DidKey,
    subscriptions: &[Subscription],
    universe: &[grid_models::Rse],
    counters: &mut IterationCounters,
) -> DidOutcome {
    let metadata = match catalog.get_metadata(&did_key.scope, &did_key.name).await {
        Ok(did) => did,
        Err(CatalogError::DataIdentifierNotFound { .. }) => return DidOutcome::Vanished,
        Err(err) => {
            tracing::error!(?err, scope = %did_key.scope, name = %did_key.name, "metadata lookup failed");
            return DidOutcome::Vanished;
        }
    };

    match metadata.did_type {
        DidType::File => {
            counters.did_processed_file += 1;
            counters.did_processed += 1;
            return DidOutcome::Done;
        }
        DidType::Dataset => counters.did_processed_dataset += 1,
        DidType::Container => counters.did_processed_container += 1,
    }
    counters.did_processed += 1;

    if metadata.hidden {
        return DidOutcome::Done;
    }

    for subscription in subscriptions {
        if !matching::is_matching(&subscription.filter, &metadata) {
            continue;
        }
        for template in &subscription.replication_rules {
            apply_template(
                catalog,
                did_key,
                subscription,
                template,
                universe,
                counters,
            )
            .await;
        }
    }

    DidOutcome::Done
}

async fn apply_template(
    catalog: &dyn CatalogGateway,
    did_key: &DidKey,
    subscription: &Subscription,
    template: &RuleTemplate,
    universe: &[grid_models::Rse],
    counters: &mut IterationCounters,
) {
    let activity = normalize::normalize_activity(template.activity.as_deref());
    if !subscription.filter.split_rule {
        let outcome = add_rule_with_retry(
            catalog,
            did_key,
            &subscription.account,
            Some(subscription.id),
            template,
            None,
            counters,
        )
        .await;
        if outcome {
            counters.record_activity(&activity);
        }
        return;
    }

    let candidates = match parse_expression(&template.rse_expression, universe) {
        Ok(candidates) => candidates,
        Err(err) => {
            tracing::warn!(?err, rse_expression = %template.rse_expression, "invalid RSE expression");
            counters.record_errortype("InvalidRseExpression");
            return;
        }
    };

    let existing_rules = match catalog
        .list_rules(&RuleFilter {
            account: None,
            scope: Some(did_key.scope.clone()),
            name: Some(did_key.name.clone()),
            subscription_id: Some(subscription.id),
        })
        .await
    {
        Ok(rules) => rules,
        Err(err) => {
            tracing::error!(?err, "failed to list existing rules for split-rule check");
            return;
        }
    };

    let name_to_id: HashMap<&str, uuid::Uuid> =
        candidates.iter().map(|rse| (rse.name.as_str(), rse.id)).collect();
    let preferred_rse_ids: Vec<uuid::Uuid> = existing_rules
        .iter()
        .filter_map(|rule| name_to_id.get(rule.rse_expression.as_str()).copied())
        .collect();

    let selector = RseSelector::new(rand::random());
    let placement = match selector.select(
        &candidates,
        template.copies,
        &preferred_rse_ids,
        &subscription.account,
        |_rse, _account| true,
    ) {
        Ok(placement) => placement,
        Err(grid_rse::SelectorError::InsufficientTargetRSEs { needed, available }) => {
            tracing::warn!(needed, available, "insufficient target RSEs for split rule");
            counters.record_errortype("InsufficientTargetRSEs");
            return;
        }
        Err(grid_rse::SelectorError::InsufficientAccountLimit { account }) => {
            tracing::warn!(%account, "insufficient account limit for split rule");
            counters.record_errortype("InsufficientAccountLimit");
            return;
        }
    };

    let id_to_name: HashMap<uuid::Uuid, &str> =
        candidates.iter().map(|rse| (rse.id, rse.name.as_str())).collect();

    for (rse_id, status) in placement {
        if status != RseStatus::New {
            continue;
        }
        let Some(rse_name) = id_to_name.get(&rse_id) else {
            continue;
        };
        let single_copy_template = RuleTemplate {
            copies: 1,
            ..template.clone()
        };
        let outcome = add_rule_with_retry(
            catalog,
            did_key,
            &subscription.account,
            Some(subscription.id),
            &single_copy_template,
            Some(rse_name),
            counters,
        )
        .await;
        if outcome {
            counters.record_activity(&activity);
        }
    }
}

/// Up to [`MAX_ATTEMPTS`], no intra-attempt sleep (§4.6 step 5). Returns
/// `true` iff the attempt loop produced a rule or a non-retryable outcome
/// the caller should count as `addnewrule.done`.
async fn add_rule_with_retry(
    catalog: &dyn CatalogGateway,
    did_key: &DidKey,
    account: &str,
    subscription_id: Option<uuid::Uuid>,
    template: &RuleTemplate,
    rse_expression_override: Option<&str>,
    counters: &mut IterationCounters,
) -> bool {
    for attempt in 1..=MAX_ATTEMPTS {
        match catalog
            .add_rule(did_key, account, subscription_id, template, rse_expression_override)
            .await
        {
            Ok(_) => {
                counters.addnewrule_done += 1;
                return true;
            }
            Err(err) => match classify(&err) {
                Classification::Retryable => {
                    counters.record_errortype(retryable_kind_name(&err));
                    if attempt == MAX_ATTEMPTS {
                        tracing::warn!(?err, attempt, "rule creation exhausted retries");
                        return false;
                    }
                }
                Classification::TerminalSuccess => {
                    // DuplicateRule and friends: at-most-one semantics hold.
                    counters.addnewrule_done += 1;
                    return true;
                }
                Classification::TerminalFailure => {
                    tracing::warn!(?err, "rule creation failed definitively");
                    return false;
                }
                Classification::Unknown => {
                    tracing::error!(?err, "unclassified error creating rule");
                    counters.record_errortype("unknown");
                    return false;
                }
            },
        }
    }
    false
}

fn retryable_kind_name(err: &CatalogError) -> &'static str {
    match err {
        CatalogError::ReplicationRuleCreationTemporaryFailed(_) => "ReplicationRuleCreationTemporaryFailed",
        CatalogError::InsufficientTargetRSEs { .. } => "InsufficientTargetRSEs",
        CatalogError::InsufficientAccountLimit { .. } => "InsufficientAccountLimit",
        CatalogError::RSEBlacklisted { .. } => "RSEBlacklisted",
        CatalogError::DatabaseException(_) => "DatabaseException",
        _ => "unknown",
    }
}

/// Marks all DIDs of the iteration as not-new in chunks of 100, via a
/// retrying wrapper with `e^k` backoff between attempts, giving up once the
/// next delay would exceed 600s (§4.6 step 7). `DataIdentifierNotFound`
/// short-circuits to success since a vanished DID needs no further
/// flagging.
async fn mark_processed(catalog: &dyn CatalogGateway, dids: &[DidKey], counters: &mut IterationCounters) {
    const CHUNK: usize = 100;
    const MAX_DELAY_SECS: f64 = 600.0;

    for chunk in dids.chunks(CHUNK) {
        let mut attempt: u32 = 0;
        loop {
            match catalog.set_new_dids_flag(chunk, false).await {
                Ok(()) => break,
                Err(CatalogError::DataIdentifierNotFound { .. }) => break,
                Err(err) => {
                    let delay_secs = (attempt as f64).exp();
                    if delay_secs > MAX_DELAY_SECS {
                        tracing::error!(?err, "giving up marking DIDs processed");
                        counters.job_error += 1;
                        break;
                    }
                    tracing::warn!(?err, delay_secs, "retrying set_new_dids_flag");
                    tokio::time::sleep(std::time::Duration::from_secs_f64(delay_secs)).await;
                    attempt += 1;
                }
            }
        }
    }
}
