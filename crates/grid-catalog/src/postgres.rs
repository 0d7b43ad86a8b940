//! Postgres-backed [`CatalogGateway`]. Uses runtime-checked `sqlx::query`/
//! `query_as` rather than the compile-time `query_as!` macro the rest of the
//! workspace favors: the schema this binds to is illustrative, not the
//! focal part of this crate, and compile-time checking would require
//! shipping a `sqlx-data.json` against a schema nobody owns here.
//!
//! Table shapes assumed (DDL is out of scope, §1 Non-goals):
//! `dids(scope, name, did_type, hidden, metadata jsonb, is_new)`,
//! `subscriptions(id, account, name, state, filter jsonb, replication_rules jsonb, comments)`,
//! `rules(id, scope, name, account, subscription_id, child_rule_id, copies,
//!   rse_expression, grouping, lifetime, weight, locked,
//!   source_replica_expression, activity, purge_replicas, ignore_availability)`,
//! `replicas(scope, name, rse, bytes, state, tombstone, locked_count, path)`,
//! `rses(name, id, attributes jsonb, protocols jsonb, limits jsonb, usage jsonb,
//!   availability_delete, availability_write, blacklisted, weight)`,
//! `messages(id, event_type, payload jsonb, created_at)`.

use async_trait::async_trait;
use grid_models::{
    CatalogError, DataIdentifier, DidKey, DidType, Protocol, Replica, Rse, RseLimits, Rule,
    RuleTemplate, Subscription,
};
use sqlx::Row;
use uuid::Uuid;

use crate::{CatalogGateway, ReplicaBatchUpdate, RseCounter, RseUsage, RuleFilter, SubscriptionFilter};

pub struct PostgresCatalogGateway {
    pool: sqlx::PgPool,
}

impl PostgresCatalogGateway {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(err: sqlx::Error) -> CatalogError {
    CatalogError::DatabaseException(err.to_string())
}

#[async_trait]
impl CatalogGateway for PostgresCatalogGateway {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_new_dids(
        &self,
        shard: u32,
        total_shards: u32,
        limit: u32,
    ) -> Result<Vec<DidKey>, CatalogError> {
        let rows = sqlx::query(
            r#"select scope, name from dids
               where is_new and mod(('x' || md5(scope || ':' || name))::bit(32)::int, $1) = $2
               order by scope, name
               limit $3"#,
        )
        .bind(total_shards as i32)
        .bind(shard as i32)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| DidKey::new(row.get::<String, _>("scope"), row.get::<String, _>("name")))
            .collect())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_metadata(&self, scope: &str, name: &str) -> Result<DataIdentifier, CatalogError> {
        let row = sqlx::query(
            r#"select scope, name, did_type, hidden, metadata from dids
               where scope = $1 and name = $2"#,
        )
        .bind(scope)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| CatalogError::DataIdentifierNotFound {
            scope: scope.to_string(),
            name: name.to_string(),
        })?;

        let did_type: String = row.get("did_type");
        let metadata: serde_json::Value = row.get("metadata");
        Ok(DataIdentifier {
            scope: row.get("scope"),
            name: row.get("name"),
            did_type: match did_type.as_str() {
                "FILE" => DidType::File,
                "CONTAINER" => DidType::Container,
                _ => DidType::Dataset,
            },
            hidden: row.get("hidden"),
            metadata: serde_json::from_value(metadata).unwrap_or_default(),
        })
    }

    #[tracing::instrument(level = "debug", skip(self, dids))]
    async fn set_new_dids_flag(&self, dids: &[DidKey], new: bool) -> Result<(), CatalogError> {
        let mut txn = self.pool.begin().await.map_err(db_err)?;
        for did in dids {
            sqlx::query("update dids set is_new = $1 where scope = $2 and name = $3")
                .bind(new)
                .bind(&did.scope)
                .bind(&did.name)
                .execute(&mut *txn)
                .await
                .map_err(db_err)?;
        }
        txn.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<Subscription>, CatalogError> {
        let rows = sqlx::query(
            r#"select id, account, name, state, filter, replication_rules, comments
               from subscriptions
               where state in ('ACTIVE', 'UPDATED')
                 and ($1::text is null or account = $1)
                 and ($2::text is null or name = $2)"#,
        )
        .bind(&filter.account)
        .bind(&filter.name)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|row| {
                let filter_json: serde_json::Value = row.get("filter");
                let rules_json: serde_json::Value = row.get("replication_rules");
                let state_str: String = row.get("state");
                Ok(Subscription {
                    id: row.get("id"),
                    account: row.get("account"),
                    name: row.get("name"),
                    state: serde_json::from_value(serde_json::Value::String(state_str))
                        .map_err(|e| CatalogError::GatewayException(e.to_string()))?,
                    filter: serde_json::from_value(filter_json)
                        .map_err(|e| CatalogError::GatewayException(e.to_string()))?,
                    replication_rules: serde_json::from_value(rules_json)
                        .map_err(|e| CatalogError::GatewayException(e.to_string()))?,
                    comments: row.get("comments"),
                })
            })
            .collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_rules(&self, filter: &RuleFilter) -> Result<Vec<Rule>, CatalogError> {
        let rows = sqlx::query(
            r#"select id, scope, name, account, subscription_id, child_rule_id, copies,
                      rse_expression, grouping, lifetime, weight, locked,
                      source_replica_expression, activity, purge_replicas, ignore_availability,
                      comments
               from rules
               where ($1::text is null or account = $1)
                 and ($2::text is null or scope = $2)
                 and ($3::text is null or name = $3)
                 and ($4::uuid is null or subscription_id = $4)"#,
        )
        .bind(&filter.account)
        .bind(&filter.scope)
        .bind(&filter.name)
        .bind(filter.subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|row| {
                let grouping_str: String = row.get("grouping");
                Ok(Rule {
                    id: row.get("id"),
                    did: DidKey::new(row.get::<String, _>("scope"), row.get::<String, _>("name")),
                    account: row.get("account"),
                    subscription_id: row.get("subscription_id"),
                    child_rule_id: row.get("child_rule_id"),
                    copies: row.get::<i32, _>("copies") as u32,
                    rse_expression: row.get("rse_expression"),
                    grouping: serde_json::from_value(serde_json::Value::String(grouping_str))
                        .map_err(|e| CatalogError::GatewayException(e.to_string()))?,
                    lifetime: row.get("lifetime"),
                    weight: row.get("weight"),
                    locked: row.get("locked"),
                    source_replica_expression: row.get("source_replica_expression"),
                    activity: row.get("activity"),
                    purge_replicas: row.get("purge_replicas"),
                    ignore_availability: row.get("ignore_availability"),
                    comments: row.get("comments"),
                })
            })
            .collect()
    }

    #[tracing::instrument(level = "debug", skip(self, template))]
    async fn add_rule(
        &self,
        did: &DidKey,
        account: &str,
        subscription_id: Option<Uuid>,
        template: &RuleTemplate,
        rse_expression_override: Option<&str>,
    ) -> Result<Rule, CatalogError> {
        if template.copies == 0 {
            return Err(CatalogError::InvalidReplicationRule(
                "copies must be >= 1".to_string(),
            ));
        }
        let rse_expression = rse_expression_override.unwrap_or(&template.rse_expression);
        let id = Uuid::new_v4();

        let existing = sqlx::query(
            r#"select 1 from rules
               where scope = $1 and name = $2 and subscription_id is not distinct from $3
                 and rse_expression = $4"#,
        )
        .bind(&did.scope)
        .bind(&did.name)
        .bind(subscription_id)
        .bind(rse_expression)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        if existing.is_some() {
            return Err(CatalogError::DuplicateRule);
        }

        let grouping = serde_json::to_value(template.grouping)
            .map_err(|e| CatalogError::GatewayException(e.to_string()))?;
        let grouping_str = grouping.as_str().unwrap_or("DATASET");

        sqlx::query(
            r#"insert into rules
               (id, scope, name, account, subscription_id, child_rule_id, copies,
                rse_expression, grouping, lifetime, weight, locked,
                source_replica_expression, activity, purge_replicas, ignore_availability)
               values ($1, $2, $3, $4, $5, null, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"#,
        )
        .bind(id)
        .bind(&did.scope)
        .bind(&did.name)
        .bind(account)
        .bind(subscription_id)
        .bind(template.copies as i32)
        .bind(rse_expression)
        .bind(grouping_str)
        .bind(template.lifetime)
        .bind(&template.weight)
        .bind(template.locked)
        .bind(&template.source_replica_expression)
        .bind(&template.activity)
        .bind(template.purge_replicas)
        .bind(template.ignore_availability)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(Rule {
            id,
            did: did.clone(),
            account: account.to_string(),
            subscription_id,
            child_rule_id: None,
            copies: template.copies,
            rse_expression: rse_expression.to_string(),
            grouping: template.grouping,
            lifetime: template.lifetime,
            weight: template.weight.clone(),
            locked: template.locked,
            source_replica_expression: template.source_replica_expression.clone(),
            activity: template.activity.clone(),
            purge_replicas: template.purge_replicas,
            ignore_availability: template.ignore_availability,
            comments: None,
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_unlocked_replicas(
        &self,
        rse: &str,
        max_bytes: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Replica>, CatalogError> {
        let effective_limit = limit.min(10_000);
        let rows = sqlx::query(
            r#"select scope, name, rse_id, bytes, state, tombstone, locked_count, path
               from replicas
               where rse = $1 and locked_count = 0 and tombstone is not null and tombstone <= now()
               order by tombstone asc
               limit $2"#,
        )
        .bind(rse)
        .bind(effective_limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut out = Vec::new();
        let mut collected = 0i64;
        for row in rows {
            if let Some(target) = max_bytes {
                if target > 0 && collected >= target {
                    break;
                }
            }
            let state_str: String = row.get("state");
            let bytes: i64 = row.get("bytes");
            collected += bytes;
            out.push(Replica {
                scope: row.get("scope"),
                name: row.get("name"),
                rse_id: row.get("rse_id"),
                bytes,
                state: serde_json::from_value(serde_json::Value::String(state_str))
                    .map_err(|e| CatalogError::GatewayException(e.to_string()))?,
                tombstone: row.get("tombstone"),
                locked_count: row.get("locked_count"),
                path: row.get("path"),
            });
        }
        Ok(out)
    }

    #[tracing::instrument(level = "debug", skip(self, batch))]
    async fn update_replicas_states(
        &self,
        rse: &str,
        batch: &[ReplicaBatchUpdate],
    ) -> Result<(), CatalogError> {
        let mut txn = self.pool.begin().await.map_err(db_err)?;
        for update in batch {
            let state = serde_json::to_value(update.state)
                .map_err(|e| CatalogError::GatewayException(e.to_string()))?;
            sqlx::query("update replicas set state = $1 where rse = $2 and scope = $3 and name = $4")
                .bind(state.as_str().unwrap_or("BEING_DELETED"))
                .bind(rse)
                .bind(&update.scope)
                .bind(&update.name)
                .execute(&mut *txn)
                .await
                .map_err(db_err)?;
        }
        txn.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, files))]
    async fn delete_replicas(&self, rse: &str, files: &[DidKey]) -> Result<(), CatalogError> {
        let mut txn = self.pool.begin().await.map_err(db_err)?;
        for file in files {
            sqlx::query("delete from replicas where rse = $1 and scope = $2 and name = $3")
                .bind(rse)
                .bind(&file.scope)
                .bind(&file.name)
                .execute(&mut *txn)
                .await
                .map_err(db_err)?;
        }
        txn.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_rse_limits(&self, rse: &str) -> Result<RseLimits, CatalogError> {
        let row = sqlx::query("select limits from rses where name = $1")
            .bind(rse)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => {
                let limits: serde_json::Value = row.get("limits");
                Ok(serde_json::from_value(limits).unwrap_or_default())
            }
            None => Ok(RseLimits::default()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_rse_usage(&self, rse: &str, source: &str) -> Result<Option<RseUsage>, CatalogError> {
        let row = sqlx::query("select usage from rses where name = $1")
            .bind(rse)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(row) = row else { return Ok(None) };
        let usage: serde_json::Value = row.get("usage");
        let Some(entry) = usage.get(source) else {
            return Ok(None);
        };
        let total = entry.get("total").and_then(|v| v.as_i64());
        let used = entry.get("used").and_then(|v| v.as_i64());
        Ok(match (total, used) {
            (Some(total), Some(used)) => Some(RseUsage { total, used }),
            _ => None,
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_rse_counter(&self, rse: &str) -> Result<Option<RseCounter>, CatalogError> {
        let row = sqlx::query("select usage from rses where name = $1")
            .bind(rse)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(row) = row else { return Ok(None) };
        let usage: serde_json::Value = row.get("usage");
        Ok(usage
            .get("counter")
            .and_then(|v| v.as_i64())
            .map(|bytes| RseCounter { bytes }))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_rse_protocols(&self, rse: &str) -> Result<Vec<Protocol>, CatalogError> {
        let row = sqlx::query("select protocols from rses where name = $1")
            .bind(rse)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| CatalogError::GatewayException(format!("unknown RSE {rse}")))?;
        let protocols: serde_json::Value = row.get("protocols");
        serde_json::from_value(protocols).map_err(|e| CatalogError::GatewayException(e.to_string()))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_rses(&self) -> Result<Vec<Rse>, CatalogError> {
        let rows = sqlx::query(
            r#"select id, name, attributes, protocols, limits, usage,
                      availability_delete, availability_write, blacklisted, weight
               from rses order by name"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|row| {
                let attributes: serde_json::Value = row.get("attributes");
                let protocols: serde_json::Value = row.get("protocols");
                let limits: serde_json::Value = row.get("limits");
                let usage_json: serde_json::Value = row.get("usage");
                Ok(Rse {
                    id: row.get("id"),
                    name: row.get("name"),
                    attributes: serde_json::from_value(attributes).unwrap_or_default(),
                    protocols: serde_json::from_value(protocols).unwrap_or_default(),
                    limits: serde_json::from_value(limits).unwrap_or_default(),
                    usage: flat_u64_map(&usage_json),
                    availability_delete: row.get("availability_delete"),
                    availability_write: row.get("availability_write"),
                    blacklisted: row.get("blacklisted"),
                    weight: row.get("weight"),
                })
            })
            .collect()
    }

    #[tracing::instrument(level = "debug", skip(self, payload))]
    async fn add_message(
        &self,
        event_type: grid_models::EventType,
        payload: serde_json::Value,
    ) -> Result<(), CatalogError> {
        let event_type_value = serde_json::to_value(event_type)
            .map_err(|e| CatalogError::GatewayException(e.to_string()))?;
        sqlx::query("insert into messages (id, event_type, payload, created_at) values ($1, $2, $3, now())")
            .bind(Uuid::new_v4())
            .bind(event_type_value.as_str().unwrap_or("deletion-planned"))
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

fn flat_u64_map(value: &serde_json::Value) -> std::collections::HashMap<String, u64> {
    value
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_u64().map(|n| (k.clone(), n)))
                .collect()
        })
        .unwrap_or_default()
}
