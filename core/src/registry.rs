use std::collections::HashMap;
use std::sync::Arc;

use url::Url;

use crate::backend::{HttpBackend, M3u8Backend, TransferBackend};
use crate::config::JobOptions;
use crate::driver::{ManifestDriver, SiteDriver};
use crate::error::{CoreError, CoreResult};
use crate::net::{NetClient, ReqwestNetClient};
use crate::throttle::Throttle;

/// Site drivers, transfer backends and the default transfer-type remap
/// table for one process or test.
#[derive(Default)]
pub struct Registry {
    drivers: HashMap<String, Arc<dyn SiteDriver>>,
    routes: HashMap<String, String>,
    backends: HashMap<String, Arc<dyn TransferBackend>>,
    default_remap: HashMap<String, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `http`, `m3u8` and the manifest driver over a reqwest client built
    /// from `options`.
    pub fn with_builtins(options: &JobOptions) -> CoreResult<Self> {
        let net: Arc<dyn NetClient> = Arc::new(ReqwestNetClient::new(options)?);
        Ok(Self::with_net(net, options))
    }

    pub fn with_net(net: Arc<dyn NetClient>, options: &JobOptions) -> Self {
        let throttle = Throttle::new(options.speed_limit_bytes_per_sec);
        let mut registry = Self::new();
        registry.register_backend(Arc::new(HttpBackend::new(net.clone(), throttle.clone())));
        registry.register_backend(Arc::new(M3u8Backend::new(net, throttle)));
        registry.set_default_remap("https", HttpBackend::TYPE);
        registry.register_driver(Arc::new(ManifestDriver));
        registry
    }

    pub fn register_driver(&mut self, driver: Arc<dyn SiteDriver>) {
        let id = driver.id().to_string();
        for key in driver.supports() {
            self.routes.insert(key.to_uppercase(), id.clone());
        }
        self.drivers.insert(id, driver);
    }

    pub fn register_backend(&mut self, backend: Arc<dyn TransferBackend>) {
        self.backends
            .insert(backend.transfer_type().to_string(), backend);
    }

    pub fn set_default_remap(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.default_remap.insert(from.into(), to.into());
    }

    pub fn default_remap(&self) -> &HashMap<String, String> {
        &self.default_remap
    }

    pub fn backend(&self, transfer_type: &str) -> Option<Arc<dyn TransferBackend>> {
        self.backends.get(transfer_type).cloned()
    }

    pub fn driver(&self, id: &str) -> Option<Arc<dyn SiteDriver>> {
        self.drivers.get(id).cloned()
    }

    /// Picks a driver by explicit id, or by the URL's route key.
    pub fn site_driver_for(&self, url: &str, driver_id: Option<&str>) -> CoreResult<Arc<dyn SiteDriver>> {
        if let Some(id) = driver_id {
            return self
                .driver(id)
                .ok_or_else(|| CoreError::Driver(format!("unknown site driver [{}]", id)));
        }
        let key = route_key(url)?;
        self.routes
            .get(&key)
            .and_then(|id| self.drivers.get(id))
            .cloned()
            .ok_or_else(|| CoreError::Driver(format!("no site driver supports [{}]", key)))
    }

    /// `(driver id, route keys)` sorted by id.
    pub fn supported_sites(&self) -> Vec<(String, Vec<String>)> {
        let mut sites: Vec<(String, Vec<String>)> = self
            .drivers
            .iter()
            .map(|(id, driver)| (id.clone(), driver.supports()))
            .collect();
        sites.sort_by(|a, b| a.0.cmp(&b.0));
        sites
    }

    pub fn backend_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.backends.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Upper-cased host, or `SCHEME://` when the URL has no host.
pub fn route_key(url: &str) -> CoreResult<String> {
    let parsed = Url::parse(url).map_err(|err| CoreError::Driver(format!("bad url {}: {}", url, err)))?;
    Ok(match parsed.host_str() {
        Some(host) if !host.is_empty() => host.to_uppercase(),
        _ => format!("{}://", parsed.scheme().to_uppercase()),
    })
}
