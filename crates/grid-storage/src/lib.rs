//! Storage Protocol Driver (§4.4, §6): a pluggable per-scheme driver exposing
//! `connect / delete / exists / close` plus LFN→PFN translation. The core
//! interacts with storage only through this interface.

pub mod mock;
pub mod registry;

use async_trait::async_trait;
use grid_models::StorageError;

/// A logical file name: `(scope, name)` plus an optional catalog-recorded
/// path override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lfn {
    pub scope: String,
    pub name: String,
    pub path: Option<String>,
    pub bytes: i64,
}

impl Lfn {
    pub fn key(&self) -> String {
        format!("{}:{}", self.scope, self.name)
    }
}

/// Capability set the core consumes from a storage endpoint (§4.4, §6).
#[async_trait]
pub trait ProtocolDriver: Send {
    /// Idempotent; may open a long-lived session.
    async fn connect(&mut self) -> Result<(), StorageError>;

    /// A single blocking call; fails with `SourceNotFound` or
    /// `ServiceUnavailable`.
    async fn delete(&mut self, pfn: &str) -> Result<(), StorageError>;

    async fn exists(&self, pfn: &str) -> Result<bool, StorageError>;

    async fn close(&mut self) -> Result<(), StorageError>;

    /// A pure function of RSE attributes: bit-identical for the same
    /// inputs. Returns `"scope:name" -> pfn`.
    fn lfns2pfns(&self, lfns: &[Lfn]) -> std::collections::HashMap<String, String>;

    /// Inverse of `lfns2pfns`, recovering `(scope, name)` from a PFN this
    /// driver produced.
    fn parse_pfn(&self, pfn: &str) -> Result<(String, String), StorageError>;
}

pub use registry::{DriverFactory, DriverRegistry};
