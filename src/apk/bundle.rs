//! Merging a bundle of split archives into a single application archive.

use crate::apk::zip::{ApkFile, ApkZipError};
use rayon::prelude::*;

const ARCHIVE_SUFFIX: &str = ".apk";
const SIGNATURE_DIR_PREFIX: &str = "META-INF/";

/// Result alias for bundle operations.
pub type BundleResult<T> = Result<T, BundleError>;

/// Errors surfaced by the bundle merger.
#[derive(Debug)]
pub enum BundleError {
    /// The container holds no nested application archives.
    EmptyBundle,
    Zip(ApkZipError),
}

impl std::fmt::Display for BundleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BundleError::EmptyBundle => write!(f, "Bundle contains no application archives"),
            BundleError::Zip(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for BundleError {}

impl From<ApkZipError> for BundleError {
    fn from(value: ApkZipError) -> Self {
        BundleError::Zip(value)
    }
}

/// True when the archive's top level carries nested application archives.
pub fn looks_like_bundle(container: &ApkFile) -> bool {
    container
        .entries()
        .any(|(name, is_dir)| !is_dir && has_archive_suffix(name))
}

fn has_archive_suffix(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(ARCHIVE_SUFFIX)
}

/// Pick the base archive name: exact `base.apk` first, then any name
/// containing `base`, then `universal`, then the first nested archive.
fn select_base(names: &[&str]) -> usize {
    let lowered: Vec<String> = names.iter().map(|n| n.to_ascii_lowercase()).collect();
    if let Some(idx) = lowered.iter().position(|n| n == "base.apk") {
        return idx;
    }
    if let Some(idx) = lowered.iter().position(|n| n.contains("base")) {
        return idx;
    }
    if let Some(idx) = lowered.iter().position(|n| n.contains("universal")) {
        return idx;
    }
    0
}

/// Union the splits of a bundle under base-wins precedence.
///
/// Splits are read in parallel; the merge itself walks them in enumeration
/// order so collisions resolve the same way on every run. Split entries
/// under `META-INF/` never survive the merge.
pub fn merge_bundle(container: &ApkFile) -> BundleResult<ApkFile> {
    let names: Vec<&str> = container
        .entries()
        .filter(|(name, is_dir)| !is_dir && has_archive_suffix(name))
        .map(|(name, _)| name)
        .collect();
    if names.is_empty() {
        return Err(BundleError::EmptyBundle);
    }

    let loaded: Vec<ApkFile> = names
        .par_iter()
        .map(|name| {
            let bytes = container.read_entry(name)?;
            ApkFile::from_bytes(bytes)
        })
        .collect::<Result<_, ApkZipError>>()?;

    let base_idx = select_base(&names);
    let mut archives: Vec<Option<ApkFile>> = loaded.into_iter().map(Some).collect();
    let mut merged = archives[base_idx]
        .take()
        .expect("base archive was just loaded");

    for split in archives.into_iter().flatten() {
        let additions: Vec<String> = split
            .entries()
            .filter(|(name, is_dir)| {
                !is_dir && !name.starts_with(SIGNATURE_DIR_PREFIX) && !merged.contains(name)
            })
            .map(|(name, _)| name.to_string())
            .collect();
        for name in additions {
            let data = split.read_entry(&name)?.to_vec();
            merged.put_entry(name, data)?;
        }
    }
    Ok(merged)
}
