use serde::{Deserialize, Deserializer, Serialize};

use crate::did::DidKey;

/// Rule-template booleans sometimes arrive as the string `"True"` rather
/// than a real JSON boolean (§9 "loose typing"); normalize at the
/// deserialization boundary so downstream code only sees `bool`.
#[derive(Deserialize)]
#[serde(untagged)]
enum LooseBool {
    Bool(bool),
    Str(String),
}

impl From<LooseBool> for bool {
    fn from(value: LooseBool) -> Self {
        match value {
            LooseBool::Bool(b) => b,
            LooseBool::Str(s) => s == "True",
        }
    }
}

fn deserialize_loose_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(LooseBool::deserialize(deserializer)?.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Grouping {
    All,
    Dataset,
    None,
}

impl Default for Grouping {
    fn default() -> Self {
        Grouping::Dataset
    }
}

/// An unbound rule template, as carried by a subscription's
/// `replication_rules` list (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTemplate {
    pub copies: u32,
    pub rse_expression: String,
    #[serde(default)]
    pub grouping: Grouping,
    pub lifetime: Option<i64>,
    pub weight: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_bool")]
    pub locked: bool,
    pub source_replica_expression: Option<String>,
    pub activity: Option<String>,
    #[serde(default, deserialize_with = "deserialize_loose_bool")]
    pub purge_replicas: bool,
    pub ignore_availability: Option<bool>,
}

/// The materialized form of a `RuleTemplate` bound to a DID (§3). Never
/// created with `copies == 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: uuid::Uuid,
    pub did: DidKey,
    pub account: String,
    pub subscription_id: Option<uuid::Uuid>,
    /// Weak reference to a rule that superseded this one.
    pub child_rule_id: Option<uuid::Uuid>,
    pub copies: u32,
    pub rse_expression: String,
    pub grouping: Grouping,
    pub lifetime: Option<i64>,
    pub weight: Option<String>,
    pub locked: bool,
    pub source_replica_expression: Option<String>,
    pub activity: Option<String>,
    pub purge_replicas: bool,
    pub ignore_availability: Option<bool>,
    pub comments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_accepts_the_stringy_true_literal() {
        let json = r#"{"copies":1,"rse_expression":"tier=1","locked":"True","purge_replicas":"False"}"#;
        let template: RuleTemplate = serde_json::from_str(json).unwrap();
        assert!(template.locked);
        assert!(!template.purge_replicas);
    }

    #[test]
    fn locked_accepts_a_real_json_boolean() {
        let json = r#"{"copies":1,"rse_expression":"tier=1","locked":true}"#;
        let template: RuleTemplate = serde_json::from_str(json).unwrap();
        assert!(template.locked);
    }

    #[test]
    fn lowercase_true_string_is_not_truthy() {
        let json = r#"{"copies":1,"rse_expression":"tier=1","locked":"true"}"#;
        let template: RuleTemplate = serde_json::from_str(json).unwrap();
        assert!(!template.locked);
    }
}
