//! Site to storage-element mapping used for proximity decisions.
//!
//! Site names follow the `<grid>.<site>.<country>` convention, so the country
//! code of a site is its last dot-separated component.

use std::collections::BTreeMap;

use crate::error::{DmError, DmResult};
use crate::types::BackendId;

/// Directory of which storage elements belong to which site.
pub trait SiteDirectory: Send + Sync {
    /// Storage elements local to `site`, in directory order.
    fn backends_for_site(&self, site: &str) -> DmResult<Vec<BackendId>>;

    /// Storage elements of every site in `country`.
    fn backends_for_country(&self, country: &str) -> DmResult<Vec<BackendId>>;

    /// Returns true if both storage elements belong to a common site.
    fn is_same_site(&self, a: &str, b: &str) -> DmResult<bool>;
}

/// Country code of a site name (`LCG.CERN.ch` → `ch`).
pub fn country_of(site: &str) -> &str {
    site.rsplit('.').next().unwrap_or(site)
}

/// Site directory backed by a static table, usually loaded from config.
#[derive(Debug, Clone, Default)]
pub struct StaticSiteDirectory {
    sites: BTreeMap<String, Vec<BackendId>>,
}

impl StaticSiteDirectory {
    /// Create a directory from a site → backends table.
    pub fn new(sites: BTreeMap<String, Vec<BackendId>>) -> Self {
        Self { sites }
    }

    /// Add or replace a site.
    pub fn upsert_site(&mut self, site: &str, backends: Vec<BackendId>) {
        self.sites.insert(site.to_string(), backends);
    }

    /// Sites hosting `backend`.
    pub fn sites_of(&self, backend: &str) -> Vec<&str> {
        self.sites
            .iter()
            .filter(|(_, backends)| backends.iter().any(|b| b == backend))
            .map(|(site, _)| site.as_str())
            .collect()
    }
}

impl SiteDirectory for StaticSiteDirectory {
    fn backends_for_site(&self, site: &str) -> DmResult<Vec<BackendId>> {
        self.sites.get(site).cloned().ok_or_else(|| DmError::NotFound {
            what: format!("site {}", site),
        })
    }

    fn backends_for_country(&self, country: &str) -> DmResult<Vec<BackendId>> {
        let mut backends: Vec<BackendId> = Vec::new();
        for (site, site_backends) in &self.sites {
            if country_of(site) != country {
                continue;
            }
            for backend in site_backends {
                if !backends.contains(backend) {
                    backends.push(backend.clone());
                }
            }
        }
        Ok(backends)
    }

    fn is_same_site(&self, a: &str, b: &str) -> DmResult<bool> {
        let sites_a = self.sites_of(a);
        if sites_a.is_empty() {
            return Err(DmError::NotFound {
                what: format!("site for storage element {}", a),
            });
        }
        Ok(self.sites_of(b).iter().any(|s| sites_a.contains(s)))
    }
}
