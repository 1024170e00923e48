//! Picking VPN configurations and deriving backend names from them.

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::path::Path;
use tracing::warn;

use crate::error::{FleetError, Result};

/// Derive a container name from a VPN config file name.
///
/// The first two `.`-separated segments are joined with `_`, lowercased, and
/// every character that is not ASCII alphanumeric or `_` is dropped:
/// `"UK.TCP Strict.ovpn"` becomes `<prefix>uk_tcpstrict`.
pub fn backend_name(prefix: &str, file_name: &str) -> String {
    let stem: String = file_name
        .split('.')
        .take(2)
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();

    let stem = stem.trim_matches('_');
    let stem = if stem.is_empty() { "proxy" } else { stem };
    format!("{}{}", prefix, stem)
}

/// Suffix repeated names with their position so a batch never reuses one.
pub fn dedupe_names(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let mut candidate = name.clone();
            let mut suffix = i;
            while !seen.insert(candidate.clone()) {
                candidate = format!("{}_{}", name, suffix);
                suffix += 1;
            }
            candidate
        })
        .collect()
}

/// Regular files in `dir`, sorted by name.
pub fn list_candidates(dir: &Path) -> Result<Vec<String>> {
    let io_err = |source| FleetError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if !entry.file_type().map_err(io_err)?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            files.push(name.to_string());
        }
    }
    files.sort();
    Ok(files)
}

/// Pick up to `limit` distinct candidates.
pub fn sample_candidates<R: Rng + ?Sized>(
    candidates: &[String],
    limit: usize,
    rng: &mut R,
) -> Vec<String> {
    if limit > candidates.len() {
        warn!(
            limit,
            available = candidates.len(),
            "Fewer candidates than requested"
        );
    }
    candidates
        .choose_multiple(rng, limit)
        .cloned()
        .collect()
}
