use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::rule::RuleTemplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionState {
    Active,
    Inactive,
    Updated,
    Broken,
}

impl SubscriptionState {
    /// Only these states are considered by the Transmogrifier (§3).
    pub fn is_evaluated(self) -> bool {
        matches!(self, SubscriptionState::Active | SubscriptionState::Updated)
    }
}

/// A single metadata-key matcher: one regex, or a list where any match
/// succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataMatcher {
    One(String),
    Many(Vec<String>),
}

impl MetadataMatcher {
    pub fn patterns(&self) -> &[String] {
        match self {
            MetadataMatcher::One(s) => std::slice::from_ref(s),
            MetadataMatcher::Many(v) => v.as_slice(),
        }
    }
}

/// The structured filter document attached to a subscription (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    pub pattern: Option<String>,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub split_rule: bool,
    /// Any key other than `pattern`/`scope`/`split_rule` is matched against
    /// DID metadata of the same name.
    #[serde(flatten)]
    pub metadata: HashMap<String, MetadataMatcher>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: uuid::Uuid,
    pub account: String,
    pub name: String,
    pub state: SubscriptionState,
    pub filter: Filter,
    pub replication_rules: Vec<RuleTemplate>,
    pub comments: Option<String>,
}
