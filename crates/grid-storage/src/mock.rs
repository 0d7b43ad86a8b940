//! A reference driver building PFNs per the grammar in §6:
//! `<scheme>://<host>[:<port>]<web_service_path><prefix>/<path>`.
//! `lfns2pfns` is a pure function of RSE attributes; `parse_pfn` is its
//! inverse.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use grid_models::StorageError;

use crate::{Lfn, ProtocolDriver};

#[derive(Debug, Clone)]
pub struct MockProtocolConfig {
    pub scheme: String,
    pub hostname: String,
    pub port: u16,
    pub web_service_path: String,
    pub prefix: String,
}

impl MockProtocolConfig {
    fn normalized_prefix(&self) -> String {
        let mut prefix = self.prefix.clone();
        if !prefix.starts_with('/') {
            prefix = format!("/{prefix}");
        }
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        prefix
    }

    fn authority(&self) -> String {
        if self.port == 0 {
            self.hostname.clone()
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }
}

/// An in-process driver for tests and for RSEs that don't require a native
/// client library.
pub struct MockProtocolDriver {
    config: MockProtocolConfig,
    connected: bool,
    /// PFNs considered present on the "remote". Deletes against a PFN not
    /// in this set fail with `SourceNotFound`.
    present: Mutex<HashSet<String>>,
    fail_unavailable: bool,
}

impl MockProtocolDriver {
    pub fn new(config: MockProtocolConfig) -> Self {
        Self {
            config,
            connected: false,
            present: Mutex::new(HashSet::new()),
            fail_unavailable: false,
        }
    }

    /// Seed the driver's view of which PFNs currently exist remotely.
    pub fn with_present(self, pfns: impl IntoIterator<Item = String>) -> Self {
        *self.present.lock().unwrap() = pfns.into_iter().collect();
        self
    }

    /// Make every subsequent `delete` fail with `ServiceUnavailable`.
    pub fn failing(mut self) -> Self {
        self.fail_unavailable = true;
        self
    }

    fn path_for(&self, lfn: &Lfn) -> String {
        let mut path = lfn
            .path
            .clone()
            .unwrap_or_else(|| format!("/{}/{}", lfn.scope, lfn.name));
        if let Some(stripped) = path.strip_prefix('/') {
            path = stripped.to_string();
        }
        path
    }
}

#[async_trait]
impl ProtocolDriver for MockProtocolDriver {
    async fn connect(&mut self) -> Result<(), StorageError> {
        self.connected = true;
        Ok(())
    }

    async fn delete(&mut self, pfn: &str) -> Result<(), StorageError> {
        if self.fail_unavailable {
            return Err(StorageError::ServiceUnavailable(format!(
                "storage endpoint unavailable for {pfn}"
            )));
        }
        let mut present = self.present.lock().unwrap();
        if !present.remove(pfn) {
            return Err(StorageError::SourceNotFound(pfn.to_string()));
        }
        Ok(())
    }

    async fn exists(&self, pfn: &str) -> Result<bool, StorageError> {
        Ok(self.present.lock().unwrap().contains(pfn))
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        self.connected = false;
        Ok(())
    }

    fn lfns2pfns(&self, lfns: &[Lfn]) -> HashMap<String, String> {
        let prefix = self.config.normalized_prefix();
        lfns.iter()
            .map(|lfn| {
                let path = self.path_for(lfn);
                let pfn = format!(
                    "{}://{}{}{}{}",
                    self.config.scheme,
                    self.config.authority(),
                    self.config.web_service_path,
                    prefix,
                    path
                );
                (lfn.key(), pfn)
            })
            .collect()
    }

    fn parse_pfn(&self, pfn: &str) -> Result<(String, String), StorageError> {
        let prefix = self.config.normalized_prefix();
        let authority_and_path = pfn
            .strip_prefix(&format!("{}://", self.config.scheme))
            .ok_or_else(|| StorageError::RSEFileNameNotSupported(pfn.to_string()))?;
        let without_authority = authority_and_path
            .strip_prefix(&self.config.authority())
            .ok_or_else(|| StorageError::RSEFileNameNotSupported(pfn.to_string()))?;
        let without_web_service = without_authority
            .strip_prefix(&self.config.web_service_path)
            .ok_or_else(|| StorageError::RSEFileNameNotSupported(pfn.to_string()))?;
        let path = without_web_service
            .strip_prefix(&prefix)
            .ok_or_else(|| StorageError::RSEFileNameNotSupported(pfn.to_string()))?;
        let mut parts = path.splitn(2, '/');
        let scope = parts
            .next()
            .ok_or_else(|| StorageError::RSEFileNameNotSupported(pfn.to_string()))?;
        let name = parts
            .next()
            .ok_or_else(|| StorageError::RSEFileNameNotSupported(pfn.to_string()))?;
        Ok((scope.to_string(), name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> MockProtocolDriver {
        MockProtocolDriver::new(MockProtocolConfig {
            scheme: "gsiftp".into(),
            hostname: "storage.example.org".into(),
            port: 0,
            web_service_path: String::new(),
            prefix: "data".into(),
        })
    }

    #[test]
    fn prefix_is_normalized_to_start_and_end_with_slash() {
        let d = driver();
        let lfns = vec![Lfn {
            scope: "mc16".into(),
            name: "file001".into(),
            path: None,
            bytes: 1024,
        }];
        let pfns = d.lfns2pfns(&lfns);
        assert_eq!(
            pfns["mc16:file001"],
            "gsiftp://storage.example.org/data/mc16/file001"
        );
    }

    #[test]
    fn port_is_included_when_nonzero() {
        let mut config = driver().config;
        config.port = 2811;
        let d = MockProtocolDriver::new(config);
        let lfns = vec![Lfn {
            scope: "mc16".into(),
            name: "file001".into(),
            path: None,
            bytes: 1024,
        }];
        let pfns = d.lfns2pfns(&lfns);
        assert_eq!(
            pfns["mc16:file001"],
            "gsiftp://storage.example.org:2811/data/mc16/file001"
        );
    }

    #[test]
    fn lfns2pfns_then_parse_pfn_round_trips() {
        let d = driver();
        let lfns = vec![Lfn {
            scope: "mc16".into(),
            name: "file001".into(),
            path: None,
            bytes: 1024,
        }];
        let pfns = d.lfns2pfns(&lfns);
        let pfn = &pfns["mc16:file001"];
        let (scope, name) = d.parse_pfn(pfn).unwrap();
        assert_eq!((scope.as_str(), name.as_str()), ("mc16", "file001"));
    }

    #[tokio::test]
    async fn delete_of_absent_pfn_fails_source_not_found() {
        let mut d = driver().with_present(["gsiftp://storage.example.org/data/a/b".to_string()]);
        d.connect().await.unwrap();
        assert!(matches!(
            d.delete("gsiftp://storage.example.org/data/x/y").await,
            Err(StorageError::SourceNotFound(_))
        ));
        d.delete("gsiftp://storage.example.org/data/a/b")
            .await
            .unwrap();
        assert!(!d.exists("gsiftp://storage.example.org/data/a/b").await.unwrap());
    }

    #[tokio::test]
    async fn failing_driver_reports_service_unavailable() {
        let mut d = driver().failing();
        d.connect().await.unwrap();
        assert!(matches!(
            d.delete("gsiftp://storage.example.org/data/a/b").await,
            Err(StorageError::ServiceUnavailable(_))
        ));
    }
}
