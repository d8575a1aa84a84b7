//! Offline asset cache policy.
//!
//! Models the installable app's cache lifecycle: a named cache generation
//! is filled on install, requests are answered network-first or cache-first
//! depending on the resource, and activation drops every generation that is
//! not the current one. The generation name must be bumped on each deploy
//! that changes cached assets.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

/// Current cache generation. Bump on every deploy that changes assets.
pub const CACHE_GENERATION: &str = "geoportal-v98";

/// Assets stored on install.
pub const PRECACHE_ASSETS: [&str; 3] = ["./", "./style.css", "./img/logo/logo.png"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub path: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("network request for {path} failed: {reason}")]
    Network { path: String, reason: String },

    #[error("{path} is neither reachable nor cached")]
    Unavailable { path: String },

    #[error("precache of generation {generation} failed: {source}")]
    Install {
        generation: String,
        #[source]
        source: Box<CacheError>,
    },
}

/// Where assets come from when the cache is bypassed or empty.
pub trait Network {
    fn fetch(&mut self, path: &str) -> Result<Asset, CacheError>;
}

/// Serves assets from a built site directory. `./` maps to `index.html`.
#[derive(Debug, Clone)]
pub struct SiteDir {
    root: PathBuf,
}

impl SiteDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Network for SiteDir {
    fn fetch(&mut self, path: &str) -> Result<Asset, CacheError> {
        let relative = path.trim_start_matches("./").trim_start_matches('/');
        let relative = if relative.is_empty() { "index.html" } else { relative };
        std::fs::read(self.root.join(relative))
            .map(|body| Asset {
                path: path.to_string(),
                body,
            })
            .map_err(|e| CacheError::Network {
                path: path.to_string(),
                reason: e.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    /// Try the network, refresh the cache, fall back to the cached copy.
    NetworkFirst,
    /// Serve the cached copy, go to the network only on a miss.
    CacheFirst,
}

impl FetchStrategy {
    /// The main document and raw GeoJSON data always prefer fresh copies.
    pub fn for_path(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        if path.ends_with("index.html") || path.ends_with("Index.html") || path.ends_with(".geojson")
        {
            FetchStrategy::NetworkFirst
        } else {
            FetchStrategy::CacheFirst
        }
    }
}

#[derive(Debug, Default)]
pub struct AssetCache {
    current: String,
    generations: BTreeMap<String, HashMap<String, Asset>>,
    clients_claimed: bool,
}

impl AssetCache {
    pub fn new(generation: impl Into<String>) -> Self {
        Self {
            current: generation.into(),
            generations: BTreeMap::new(),
            clients_claimed: false,
        }
    }

    pub fn generation(&self) -> &str {
        &self.current
    }

    /// Generation names currently stored, in name order.
    pub fn generations(&self) -> Vec<&str> {
        self.generations.keys().map(String::as_str).collect()
    }

    pub fn clients_claimed(&self) -> bool {
        self.clients_claimed
    }

    /// Seed a generation directly (e.g. left over from a previous deploy).
    pub fn insert(&mut self, generation: &str, asset: Asset) {
        self.generations
            .entry(generation.to_string())
            .or_default()
            .insert(asset.path.clone(), asset);
    }

    pub fn cached(&self, path: &str) -> Option<&Asset> {
        self.generations.get(&self.current)?.get(path)
    }

    /// Fill the current generation with [`PRECACHE_ASSETS`]. Nothing is
    /// stored unless every asset was fetched.
    pub fn install(&mut self, network: &mut dyn Network) -> Result<(), CacheError> {
        let mut fetched = Vec::with_capacity(PRECACHE_ASSETS.len());
        for path in PRECACHE_ASSETS {
            let asset = network.fetch(path).map_err(|e| CacheError::Install {
                generation: self.current.clone(),
                source: Box::new(e),
            })?;
            fetched.push(asset);
        }
        let store = self.generations.entry(self.current.clone()).or_default();
        for asset in fetched {
            store.insert(asset.path.clone(), asset);
        }
        info!(generation = %self.current, assets = PRECACHE_ASSETS.len(), "asset cache installed");
        Ok(())
    }

    /// Drop every generation except the current one and take control of all
    /// clients. Returns the names of the deleted generations.
    pub fn activate(&mut self) -> Vec<String> {
        let stale: Vec<String> = self
            .generations
            .keys()
            .filter(|name| **name != self.current)
            .cloned()
            .collect();
        for name in &stale {
            info!(generation = %name, "deleting stale asset cache");
            self.generations.remove(name);
        }
        self.clients_claimed = true;
        stale
    }

    pub fn fetch(&mut self, path: &str, network: &mut dyn Network) -> Result<Asset, CacheError> {
        match FetchStrategy::for_path(path) {
            FetchStrategy::NetworkFirst => match network.fetch(path) {
                Ok(asset) => {
                    let generation = self.current.clone();
                    self.insert(&generation, asset.clone());
                    Ok(asset)
                }
                Err(e) => {
                    debug!(path, error = %e, "network failed, trying cache");
                    self.cached(path).cloned().ok_or_else(|| CacheError::Unavailable {
                        path: path.to_string(),
                    })
                }
            },
            FetchStrategy::CacheFirst => match self.cached(path) {
                Some(asset) => Ok(asset.clone()),
                None => network.fetch(path),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeNetwork {
        online: bool,
        version: u8,
        calls: Vec<String>,
    }

    impl Network for FakeNetwork {
        fn fetch(&mut self, path: &str) -> Result<Asset, CacheError> {
            self.calls.push(path.to_string());
            if self.online {
                Ok(asset(path, self.version))
            } else {
                Err(CacheError::Network {
                    path: path.to_string(),
                    reason: "offline".to_string(),
                })
            }
        }
    }

    fn asset(path: &str, version: u8) -> Asset {
        Asset {
            path: path.to_string(),
            body: vec![version],
        }
    }

    fn online(version: u8) -> FakeNetwork {
        FakeNetwork {
            online: true,
            version,
            calls: Vec::new(),
        }
    }

    #[test]
    fn strategy_by_path() {
        assert_eq!(FetchStrategy::for_path("/app/index.html"), FetchStrategy::NetworkFirst);
        assert_eq!(FetchStrategy::for_path("/Index.html?v=3"), FetchStrategy::NetworkFirst);
        assert_eq!(
            FetchStrategy::for_path("/archivos/Solicitudes.geojson#x"),
            FetchStrategy::NetworkFirst
        );
        assert_eq!(FetchStrategy::for_path("/style.css"), FetchStrategy::CacheFirst);
        assert_eq!(FetchStrategy::for_path("/data.geojson.bak"), FetchStrategy::CacheFirst);
    }

    #[test]
    fn install_precaches_root_assets() {
        let mut cache = AssetCache::new(CACHE_GENERATION);
        cache.install(&mut online(1)).unwrap();
        for path in PRECACHE_ASSETS {
            assert_eq!(cache.cached(path), Some(&asset(path, 1)));
        }
    }

    #[test]
    fn failed_install_stores_nothing() {
        let mut cache = AssetCache::new(CACHE_GENERATION);
        let err = cache.install(&mut FakeNetwork::default()).unwrap_err();
        assert!(matches!(err, CacheError::Install { .. }));
        assert!(cache.generations().is_empty());
    }

    #[test]
    fn cache_first_skips_network_on_hit() {
        let mut cache = AssetCache::new(CACHE_GENERATION);
        cache.install(&mut online(1)).unwrap();

        let mut net = online(2);
        assert_eq!(cache.fetch("./style.css", &mut net).unwrap(), asset("./style.css", 1));
        assert!(net.calls.is_empty());

        assert_eq!(cache.fetch("./app.js", &mut net).unwrap(), asset("./app.js", 2));
        assert_eq!(net.calls, vec!["./app.js"]);
        // Cache-first misses are not stored.
        assert!(cache.cached("./app.js").is_none());
    }

    #[test]
    fn network_first_refreshes_and_falls_back() {
        let mut cache = AssetCache::new(CACHE_GENERATION);
        let path = "./archivos/Solicitudes.geojson";

        assert_eq!(cache.fetch(path, &mut online(1)).unwrap(), asset(path, 1));
        assert_eq!(cache.fetch(path, &mut online(2)).unwrap(), asset(path, 2));

        let mut offline = FakeNetwork::default();
        assert_eq!(cache.fetch(path, &mut offline).unwrap(), asset(path, 2));
        assert_eq!(
            cache.fetch("./index.html", &mut offline),
            Err(CacheError::Unavailable {
                path: "./index.html".to_string()
            })
        );
    }

    #[test]
    fn activate_deletes_stale_generations_and_claims_clients() {
        let mut cache = AssetCache::new(CACHE_GENERATION);
        cache.insert("geoportal-v97", asset("./style.css", 0));
        cache.insert("geoportal-v96", asset("./style.css", 0));
        cache.install(&mut online(1)).unwrap();
        assert!(!cache.clients_claimed());

        let deleted = cache.activate();
        assert_eq!(deleted, vec!["geoportal-v96", "geoportal-v97"]);
        assert_eq!(cache.generations(), vec![CACHE_GENERATION]);
        assert!(cache.clients_claimed());
    }

    #[test]
    fn site_dir_serves_root_as_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>").unwrap();
        std::fs::write(dir.path().join("style.css"), "body{}").unwrap();

        let mut site = SiteDir::new(dir.path());
        assert_eq!(site.fetch("./").unwrap().body, b"<html>".to_vec());
        assert_eq!(site.fetch("./style.css").unwrap().body, b"body{}".to_vec());

        let mut cache = AssetCache::new(CACHE_GENERATION);
        let err = cache.install(&mut site).unwrap_err();
        assert!(matches!(err, CacheError::Install { .. }));
        assert!(cache.cached("./").is_none());
    }
}
