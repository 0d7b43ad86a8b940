//! Dynamic dispatch over storage protocols (§9): a driver is looked up by
//! `(scheme, impl)` rather than matched in a hardcoded `if/else` chain, so
//! adding a protocol means registering a factory, not touching the core.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use grid_models::{Protocol, StorageError};

use crate::mock::{MockProtocolConfig, MockProtocolDriver};
use crate::ProtocolDriver;

/// Builds a driver instance from an RSE's protocol declaration.
pub type DriverFactory = Arc<dyn Fn(&Protocol) -> Box<dyn ProtocolDriver> + Send + Sync>;

/// Maps `(scheme, impl)` to the factory that can drive it, with an
/// `impl`-name rewrite applied first: e.g. RSEs still declaring
/// `"srm.Default"` are served by the `gfal.Default` driver.
pub struct DriverRegistry {
    factories: HashMap<(String, String), DriverFactory>,
    impl_overrides: HashMap<String, String>,
    mock_keys: HashSet<(String, String)>,
    native_protocol_libs: bool,
}

impl DriverRegistry {
    /// When `false`, only drivers registered via [`Self::register_mock`]
    /// resolve; a process without native client libraries installed falls
    /// back to the in-process stand-in.
    pub fn new(native_protocol_libs: bool) -> Self {
        let mut overrides = HashMap::new();
        overrides.insert("srm.Default".to_string(), "gfal.Default".to_string());
        Self {
            factories: HashMap::new(),
            impl_overrides: overrides,
            mock_keys: HashSet::new(),
            native_protocol_libs,
        }
    }

    pub fn override_impl(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.impl_overrides.insert(from.into(), to.into());
    }

    pub fn register(
        &mut self,
        scheme: impl Into<String>,
        r#impl: impl Into<String>,
        factory: DriverFactory,
    ) {
        self.factories.insert((scheme.into(), r#impl.into()), factory);
    }

    /// Registers a [`MockProtocolDriver`] factory for `(scheme, impl)`,
    /// usable regardless of `native_protocol_libs`.
    pub fn register_mock(&mut self, scheme: impl Into<String>, r#impl: impl Into<String>) {
        let factory: DriverFactory = Arc::new(|protocol: &Protocol| {
            Box::new(MockProtocolDriver::new(MockProtocolConfig {
                scheme: protocol.scheme.clone(),
                hostname: protocol.hostname.clone(),
                port: protocol.port,
                web_service_path: protocol
                    .extended_attributes
                    .get("web_service_path")
                    .cloned()
                    .unwrap_or_default(),
                prefix: protocol.prefix.clone(),
            })) as Box<dyn ProtocolDriver>
        });
        let scheme = scheme.into();
        let r#impl = r#impl.into();
        self.mock_keys.insert((scheme.clone(), r#impl.clone()));
        self.register(scheme, r#impl, factory);
    }

    fn resolved_impl<'a>(&self, r#impl: &'a str) -> &'a str {
        // Only a single hop: the override map is seeded with one entry and
        // isn't expected to form chains.
        self.impl_overrides
            .get(r#impl)
            .map(|s| s.as_str())
            .unwrap_or(r#impl)
    }

    pub fn driver_for(&self, protocol: &Protocol) -> Result<Box<dyn ProtocolDriver>, StorageError> {
        let resolved = self.resolved_impl(&protocol.r#impl);
        let key = (protocol.scheme.clone(), resolved.to_string());
        let factory = self.factories.get(&key).ok_or_else(|| {
            StorageError::RSEFileNameNotSupported(format!(
                "no driver registered for scheme={} impl={} (resolved from {})",
                protocol.scheme, resolved, protocol.r#impl
            ))
        })?;
        if !self.native_protocol_libs && !self.is_mock_key(&key) {
            return Err(StorageError::GatewayException(format!(
                "native protocol libraries disabled; cannot drive scheme={} impl={}",
                protocol.scheme, resolved
            )));
        }
        Ok(factory(protocol))
    }

    fn is_mock_key(&self, key: &(String, String)) -> bool {
        self.mock_keys.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn protocol(scheme: &str, r#impl: &str) -> Protocol {
        Protocol {
            scheme: scheme.to_string(),
            r#impl: r#impl.to_string(),
            hostname: "storage.example.org".to_string(),
            port: 0,
            prefix: "/data".to_string(),
            extended_attributes: StdHashMap::new(),
        }
    }

    #[test]
    fn srm_default_resolves_via_the_gfal_override() {
        let mut registry = DriverRegistry::new(true);
        registry.register_mock("gsiftp", "gfal.Default");
        let driver = registry.driver_for(&protocol("gsiftp", "srm.Default"));
        assert!(driver.is_ok());
    }

    #[test]
    fn unregistered_impl_is_rse_file_name_not_supported() {
        let registry = DriverRegistry::new(true);
        let err = registry.driver_for(&protocol("gsiftp", "unknown.Driver")).unwrap_err();
        assert!(matches!(err, StorageError::RSEFileNameNotSupported(_)));
    }

    #[test]
    fn native_libs_disabled_rejects_non_mock_driver() {
        let mut registry = DriverRegistry::new(false);
        let factory: DriverFactory = Arc::new(|protocol: &Protocol| {
            Box::new(MockProtocolDriver::new(MockProtocolConfig {
                scheme: protocol.scheme.clone(),
                hostname: protocol.hostname.clone(),
                port: protocol.port,
                web_service_path: String::new(),
                prefix: protocol.prefix.clone(),
            })) as Box<dyn ProtocolDriver>
        });
        registry.register("gsiftp", "gfal.Default", factory);
        let err = registry.driver_for(&protocol("gsiftp", "gfal.Default")).unwrap_err();
        assert!(matches!(err, StorageError::GatewayException(_)));
    }
}
