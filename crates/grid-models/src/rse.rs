use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl std::fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{b}"),
            AttributeValue::Number(n) => write!(f, "{n}"),
            AttributeValue::String(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Protocol {
    pub scheme: String,
    /// Fully-qualified driver implementation name, e.g. `"srm.Default"`.
    pub r#impl: String,
    pub hostname: String,
    pub port: u16,
    pub prefix: String,
    #[serde(default)]
    pub extended_attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RseLimits {
    pub min_free_space: Option<i64>,
    pub max_being_deleted_files: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rse {
    pub id: uuid::Uuid,
    pub name: String,
    pub attributes: HashMap<String, AttributeValue>,
    pub protocols: Vec<Protocol>,
    pub limits: RseLimits,
    /// Usage counters keyed by source, e.g. `"srm"`.
    pub usage: HashMap<String, u64>,
    pub availability_delete: bool,
    pub availability_write: bool,
    pub blacklisted: bool,
    pub weight: Option<f64>,
}

impl Rse {
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }
}
