//! Configuration for the data manager.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DmError, DmResult};
use crate::topology::StaticSiteDirectory;
use crate::types::BackendId;

/// Data manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DmConfig {
    /// Name of the site this process runs at (e.g. `LCG.CERN.ch`).
    pub local_site: String,
    /// User recorded in accounting records.
    pub actor: String,
    /// Default for tolerating files missing from the catalog on removal.
    pub ignore_missing_in_catalog: bool,
    /// Protocols usable for direct storage-to-storage transfers, in preference order.
    pub third_party_protocols: Vec<String>,
    /// Protocols used to canonicalize locators before registration, in preference order.
    pub registration_protocols: Vec<String>,
    /// Storage elements cleared by bulk directory removal.
    pub cleaning_backends: Vec<BackendId>,
    /// Scratch root for replication through the local disk.
    pub local_cache_dir: Option<PathBuf>,
    /// Maximum number of storage elements contacted at once during removal.
    pub removal_concurrency: usize,
    /// Name of the marker file every catalog directory carries.
    pub directory_marker: String,
    /// Site name → storage elements at that site, in preference order.
    pub sites: BTreeMap<String, Vec<BackendId>>,
    /// Filesystem-backed storage elements: name → root directory.
    pub storage_roots: BTreeMap<BackendId, PathBuf>,
    /// JSON-lines file accounting records are appended to; records are
    /// discarded when unset.
    pub accounting_log: Option<PathBuf>,
}

impl Default for DmConfig {
    fn default() -> Self {
        Self {
            local_site: String::from("local"),
            actor: String::from("system"),
            ignore_missing_in_catalog: false,
            third_party_protocols: vec!["srm".into(), "dip".into(), "file".into()],
            registration_protocols: vec!["srm".into(), "dip".into(), "file".into()],
            cleaning_backends: Vec::new(),
            local_cache_dir: None,
            removal_concurrency: 4,
            directory_marker: String::from(".cfs_directory"),
            sites: BTreeMap::new(),
            storage_roots: BTreeMap::new(),
            accounting_log: None,
        }
    }
}

impl DmConfig {
    /// Load a configuration file; the format is chosen by extension
    /// (`.toml` or `.json`).
    pub fn from_file(path: &Path) -> DmResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: DmConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| DmError::Config {
                msg: format!("{}: {}", path.display(), e),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| DmError::Config {
                msg: format!("{}: {}", path.display(), e),
            })?,
            _ => {
                return Err(DmError::Config {
                    msg: format!("Unsupported config file extension: {}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> DmResult<()> {
        if self.local_site.is_empty() {
            return Err(DmError::Config {
                msg: "local_site must not be empty".to_string(),
            });
        }
        if self.removal_concurrency == 0 {
            return Err(DmError::Config {
                msg: "removal_concurrency must be at least 1".to_string(),
            });
        }
        if self.directory_marker.is_empty() || self.directory_marker.contains('/') {
            return Err(DmError::Config {
                msg: format!("invalid directory_marker: {:?}", self.directory_marker),
            });
        }
        if self.registration_protocols.is_empty() {
            return Err(DmError::Config {
                msg: "registration_protocols must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Cleaning backends in the order they are processed.
    pub fn sorted_cleaning_backends(&self) -> Vec<BackendId> {
        let mut backends = self.cleaning_backends.clone();
        backends.sort();
        backends.dedup();
        backends
    }

    /// Scratch root for local-disk replication.
    pub fn cache_root(&self) -> PathBuf {
        self.local_cache_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Build a site directory from the `sites` table.
    pub fn site_directory(&self) -> StaticSiteDirectory {
        StaticSiteDirectory::new(self.sites.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::SiteDirectory;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = DmConfig::default();
        assert_eq!(config.actor, "system");
        assert!(!config.ignore_missing_in_catalog);
        assert_eq!(config.removal_concurrency, 4);
        assert!(config.cleaning_backends.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
local_site = "LCG.CERN.ch"
actor = "prod"
ignore_missing_in_catalog = true
cleaning_backends = ["RAL-DST", "CERN-DST"]
removal_concurrency = 2

[storage_roots]
"CERN-DISK" = "/srv/dm/cern"

[sites]
"LCG.CERN.ch" = ["CERN-DST", "CERN-USER"]
"LCG.RAL.uk" = ["RAL-DST"]
            "#
        )
        .unwrap();

        let config = DmConfig::from_file(file.path()).unwrap();
        assert_eq!(config.local_site, "LCG.CERN.ch");
        assert_eq!(config.actor, "prod");
        assert!(config.ignore_missing_in_catalog);
        assert_eq!(config.removal_concurrency, 2);
        assert_eq!(
            config.sorted_cleaning_backends(),
            vec!["CERN-DST".to_string(), "RAL-DST".to_string()]
        );
        assert_eq!(config.directory_marker, ".cfs_directory");
        assert_eq!(
            config.storage_roots.get("CERN-DISK"),
            Some(&PathBuf::from("/srv/dm/cern"))
        );
        let sites = config.site_directory();
        assert_eq!(sites.backends_for_site("LCG.RAL.uk").unwrap(), vec!["RAL-DST".to_string()]);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "local_site": "LCG.RAL.uk",
                "third_party_protocols": ["file"],
                "local_cache_dir": "/scratch/dm"
            }}"#
        )
        .unwrap();

        let config = DmConfig::from_file(file.path()).unwrap();
        assert_eq!(config.local_site, "LCG.RAL.uk");
        assert_eq!(config.third_party_protocols, vec!["file".to_string()]);
        assert_eq!(config.cache_root(), PathBuf::from("/scratch/dm"));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(
            DmConfig::from_file(file.path()),
            Err(DmError::Config { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = DmConfig {
            removal_concurrency: 0,
            ..DmConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_marker_with_slash() {
        let config = DmConfig {
            directory_marker: "a/b".to_string(),
            ..DmConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
