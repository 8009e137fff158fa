//! Operations over catalog directory trees.

use std::collections::{BTreeMap, VecDeque};

use chrono::{Duration as ChronoDuration, Utc};
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::batch::BatchResult;
use crate::error::{DmError, DmResult};
use crate::manager::DataManager;
use crate::types::{join_path, Lfn, ReplicaSet};

/// Translate a shell glob (`*`, `?`, `[..]`, `[!..]`) into an anchored regex.
/// `*` also matches `/`.
pub fn glob_to_regex(pattern: &str) -> DmResult<Regex> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => match class_end(&chars, i) {
                Some(close) => {
                    let mut body = &chars[i + 1..close];
                    out.push('[');
                    if body.first() == Some(&'!') {
                        out.push('^');
                        body = &body[1..];
                    }
                    for &c in body {
                        if matches!(c, '\\' | '[' | ']' | '^' | '&' | '~') {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                    out.push(']');
                    i = close;
                }
                None => out.push_str("\\["),
            },
            c => out.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
        i += 1;
    }
    out.push('$');
    Regex::new(&out).map_err(|e| DmError::InvalidInput {
        msg: format!("invalid wildcard {:?}: {}", pattern, e),
    })
}

/// Index of the `]` closing the class opened at `open`. A `]` right after
/// the opening (or after `!`) is a literal member.
fn class_end(chars: &[char], open: usize) -> Option<usize> {
    let mut j = open + 1;
    if chars.get(j) == Some(&'!') {
        j += 1;
    }
    if chars.get(j) == Some(&']') {
        j += 1;
    }
    chars[j.min(chars.len())..]
        .iter()
        .position(|&c| c == ']')
        .map(|offset| j + offset)
}

impl DataManager {
    /// Every file below `dir`, walking sub-directories breadth first.
    pub(crate) async fn catalog_directory_contents(&self, dir: &str) -> DmResult<Vec<Lfn>> {
        let mut files = Vec::new();
        let mut pending = VecDeque::from([dir.to_string()]);
        while let Some(current) = pending.pop_front() {
            let listing = self.catalog.list_directory(&current, false).await?;
            files.extend(listing.files.into_keys());
            pending.extend(listing.sub_dirs.into_keys());
        }
        Ok(files)
    }

    /// Replica sets of every file below each directory.
    pub async fn get_replicas_from_directory(
        &self,
        dirs: &[String],
    ) -> DmResult<BTreeMap<Lfn, ReplicaSet>> {
        let mut replicas = BTreeMap::new();
        for dir in dirs {
            let mut pending = VecDeque::from([dir.clone()]);
            while let Some(current) = pending.pop_front() {
                let listing = self.catalog.list_directory(&current, false).await?;
                for (lfn, file) in listing.files {
                    replicas.insert(lfn, file.replicas);
                }
                pending.extend(listing.sub_dirs.into_keys());
            }
        }
        Ok(replicas)
    }

    /// Files below each directory whose full name matches `wildcard`.
    ///
    /// With `days > 0`, only files and sub-directories created more than
    /// `days` days ago are returned or followed.
    pub async fn get_files_from_directory(
        &self,
        dirs: &[String],
        days: u32,
        wildcard: &str,
    ) -> DmResult<Vec<Lfn>> {
        let matcher = glob_to_regex(wildcard)?;
        let cutoff = (days > 0).then(|| Utc::now() - ChronoDuration::days(i64::from(days)));
        let mut found = Vec::new();
        for dir in dirs {
            let mut pending = VecDeque::from([dir.clone()]);
            while let Some(current) = pending.pop_front() {
                let listing = self.catalog.list_directory(&current, true).await?;
                for (sub, info) in listing.sub_dirs {
                    let old_enough = match (cutoff, info.creation_date) {
                        (None, _) => true,
                        (Some(cutoff), Some(created)) => created < cutoff,
                        (Some(_), None) => false,
                    };
                    if old_enough {
                        pending.push_back(sub);
                    }
                }
                for (lfn, file) in listing.files {
                    let old_enough = match (cutoff, file.metadata.as_ref()) {
                        (None, _) => true,
                        (Some(cutoff), Some(meta)) => meta.creation_date < cutoff,
                        (Some(_), None) => false,
                    };
                    if old_enough && matcher.is_match(&lfn) {
                        found.push(lfn);
                    }
                }
            }
        }
        debug!(dirs = dirs.len(), files = found.len(), "files listed from directories");
        Ok(found)
    }

    /// Remove every file below each directory, clear the directory at the
    /// cleaning storage elements and finally remove it from the catalog.
    ///
    /// The catalog directory survives if any cleaning storage element fails.
    pub async fn clean_logical_directory(&self, dirs: &[String]) -> DmResult<BatchResult<String, ()>> {
        let mut result = BatchResult::new();
        for dir in dirs {
            match self.clean_one_directory(dir).await {
                Ok(()) => result.succeed(dir.clone(), ()),
                Err(e) if e.is_hard() => return Err(e),
                Err(e) => {
                    error!(dir = %dir, error = %e, "failed to clean directory");
                    result.fail(dir.clone(), e);
                }
            }
        }
        Ok(result)
    }

    async fn clean_one_directory(&self, dir: &str) -> DmResult<()> {
        self.verify_write_permission("cleanLogicalDirectory", &[dir.to_string()])
            .await?;
        let mut files = self.catalog_directory_contents(dir).await?;
        files.push(join_path(dir, &self.config.directory_marker));
        info!(dir = %dir, files = files.len(), "removing directory contents");

        let removed = self.remove_file(&files, Some(true)).await?;
        self.log_failures("cleanLogicalDirectory", &removed);

        let mut failed = false;
        for backend in self.config.sorted_cleaning_backends() {
            if let Err(e) = self.clean_storage_directory(dir, &backend).await {
                error!(dir = %dir, backend = %backend, error = %e, "failed to clean storage directory");
                failed = true;
            }
        }
        if failed {
            return Err(DmError::CleaningFailed {
                path: dir.to_string(),
            });
        }
        // a directory the catalog refuses to drop fails only this item
        self.catalog
            .remove_directory(dir, true)
            .await
            .map_err(|e| DmError::Message(e.to_string()))?;
        info!(dir = %dir, "directory cleaned");
        Ok(())
    }

    async fn clean_storage_directory(&self, dir: &str, backend: &str) -> DmResult<()> {
        let element = self.valid_element(backend).await?;
        if !element.exists(dir).await? {
            debug!(dir = %dir, backend = %backend, "nothing to clean");
            return Ok(());
        }
        let removed = element.remove_directory(dir, true).await?;
        if removed > 0 {
            warn!(dir = %dir, backend = %backend, removed, "removed files left behind at storage element");
        }
        Ok(())
    }
}
