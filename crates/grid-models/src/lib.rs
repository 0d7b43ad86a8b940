//! Shared data model for the data-grid control plane: data identifiers,
//! subscriptions, rules, storage endpoints, replicas and the outbox message
//! shape. Mirrors the entity definitions the catalog gateway and workers
//! operate on; the catalog's own schema is not specified here (see
//! `grid-catalog`).

pub mod did;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod replica;
pub mod rse;
pub mod rule;
pub mod subscription;

pub use did::{DataIdentifier, DidKey, DidType, MetadataValue};
pub use error::{CatalogError, Classification, StorageError, classify};
pub use heartbeat::{Heartbeat, ShardAssignment};
pub use message::{EventType, Message};
pub use replica::{Replica, ReplicaState};
pub use rse::{AttributeValue, Protocol, Rse, RseLimits};
pub use rule::{Grouping, Rule, RuleTemplate};
pub use subscription::{Filter, MetadataMatcher, Subscription, SubscriptionState};
