use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// `(scope, name)` uniquely identifies a DataIdentifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DidKey {
    pub scope: String,
    pub name: String,
}

impl DidKey {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for DidKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum DidType {
    File,
    Dataset,
    Container,
}

/// A scalar or string DID metadata value. Filters match loosely against its
/// string representation rather than requiring type-exact comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    String(String),
    Number(f64),
    Bool(bool),
}

impl std::fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataValue::String(s) => write!(f, "{s}"),
            MetadataValue::Number(n) => write!(f, "{n}"),
            MetadataValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataIdentifier {
    pub scope: String,
    pub name: String,
    pub did_type: DidType,
    pub hidden: bool,
    pub metadata: HashMap<String, MetadataValue>,
}

impl DataIdentifier {
    pub fn key(&self) -> DidKey {
        DidKey::new(self.scope.clone(), self.name.clone())
    }
}
