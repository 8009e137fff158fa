#![warn(missing_docs)]

//! `cfs-dm`: preflight check of a data manager configuration.
//!
//! Loads and validates the configuration, then verifies that every
//! filesystem storage element is usable and that the accounting log can be
//! appended to. Exits non-zero if any check fails.

use anyhow::{bail, Result};
use claudefs_dm::accounting::RecordCommitter;
use claudefs_dm::{DmConfig, JsonLinesCommitter, LocalStorageElement, StorageElement};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!("ClaudeFS data manager preflight starting...");

    let config_path = std::env::var("CFS_DM_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/claudefs/dm.toml"));
    let config = if config_path.exists() {
        DmConfig::from_file(&config_path)?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", config_path.display());
        DmConfig::default()
    };
    config.validate()?;

    let mut unusable = Vec::new();
    for (name, root) in &config.storage_roots {
        let element = LocalStorageElement::new(name, root);
        match element.is_valid().await {
            Ok(()) => tracing::info!(backend = %name, root = %root.display(), "storage element usable"),
            Err(e) => {
                tracing::error!(backend = %name, error = %e, "storage element not usable");
                unusable.push(name.clone());
            }
        }
    }

    for backend in config.sorted_cleaning_backends() {
        if !config.storage_roots.contains_key(&backend) {
            tracing::warn!(backend = %backend, "cleaning backend has no configured storage root");
        }
    }

    if let Some(path) = &config.accounting_log {
        JsonLinesCommitter::new(path.clone()).commit(&[]).await?;
        tracing::info!("Accounting records appended to {}", path.display());
    }

    if !unusable.is_empty() {
        bail!("unusable storage elements: {}", unusable.join(", "));
    }
    tracing::info!(
        site = %config.local_site,
        storage_elements = config.storage_roots.len(),
        "preflight passed"
    );
    Ok(())
}
