//! Static policy bootstrap.
//!
//! A directory of YAML documents with the FULL event schema, applied once at
//! startup before consumption begins. Unreadable or invalid files are skipped.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use regowall_core::{PolicyEvent, RegowallError, Result};

use crate::policy::PolicyStore;

/// Valid policy events found in `dir`, in file name order.
pub fn load_static_policies(dir: &Path) -> Result<Vec<PolicyEvent>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        RegowallError::Config(format!("read static policy dir {}: {e}", dir.display()))
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext == "yaml" || ext == "yml")
        })
        .collect();
    paths.sort();

    let mut events = Vec::with_capacity(paths.len());
    for path in paths {
        match load_file(&path) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "skipping static policy");
            }
        }
    }
    tracing::info!(dir = %dir.display(), policies = events.len(), "static policies loaded");
    Ok(events)
}

fn load_file(path: &Path) -> Result<PolicyEvent> {
    let raw = fs::read_to_string(path)
        .map_err(|e| RegowallError::Config(format!("read {}: {e}", path.display())))?;
    let event: PolicyEvent = serde_yaml::from_str(&raw)
        .map_err(|e| RegowallError::Validation(format!("invalid yaml: {e}")))?;
    event.validate()?;
    Ok(event)
}

/// Apply bootstrap events to `store`. Returns how many were accepted.
pub fn apply_static(store: &PolicyStore, events: &[PolicyEvent], now: DateTime<Utc>) -> usize {
    events
        .iter()
        .filter(|event| match store.apply(event, now) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(policy = %event.name, error = %e, "static policy rejected");
                false
            }
        })
        .count()
}
