//! Versioned output directories: `<base>/v<N>-<YYYYMMDD-HHMMSS>`.

use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use tracing::debug;

/// One more than the highest `v<k>-*` entry under `dir`, or 0 when there is
/// none (or `dir` does not exist yet).
pub fn next_version(dir: &Path) -> u32 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| parse_version(&e.file_name().to_string_lossy()))
        .max()
        .map_or(0, |v| v + 1)
}

fn parse_version(name: &str) -> Option<u32> {
    let rest = name.strip_prefix('v')?;
    let (digits, _) = rest.split_once('-')?;
    digits.parse().ok()
}

/// Append a fresh `v<N>-<timestamp>` component to `dir`.
pub fn add_version_to_work_dir(dir: &Path) -> PathBuf {
    add_version_at(dir, Local::now().naive_local())
}

pub fn add_version_at(dir: &Path, now: NaiveDateTime) -> PathBuf {
    let version = next_version(dir);
    let versioned = dir.join(format!("v{version}-{}", now.format("%Y%m%d-%H%M%S")));
    debug!(path = %versioned.display(), "Versioned output directory");
    versioned
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap().and_hms_opt(3, 4, 5).unwrap()
    }

    #[test]
    fn test_first_version_is_zero() {
        let dir = TempDir::new().unwrap();
        let out = add_version_at(dir.path(), at());
        assert_eq!(out, dir.path().join("v0-20240102-030405"));
        assert_eq!(next_version(&dir.path().join("missing")), 0);
    }

    #[test]
    fn test_version_follows_highest_existing() {
        let dir = TempDir::new().unwrap();
        for name in ["v0-20230101-000000", "v7-20230101-000000", "v3-x", "vx-1", "notes"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        assert_eq!(next_version(dir.path()), 8);
    }
}
