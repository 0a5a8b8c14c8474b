//! Migration script discovery.
//!
//! Scripts live directly in one directory and are named
//! `<version>_<name>.up.sql`, with an optional `<version>_<name>.down.sql`.
//! Subdirectories and files without a `.sql` extension are ignored.

use super::MigrationError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One migration version with its scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    pub version: i64,
    pub name: String,
    pub up: PathBuf,
    pub down: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

/// Parse `<version>_<name>.(up|down).sql`.
fn parse_file_name(file_name: &str) -> Option<(i64, String, Direction)> {
    let (stem, direction) = if let Some(stem) = file_name.strip_suffix(".up.sql") {
        (stem, Direction::Up)
    } else if let Some(stem) = file_name.strip_suffix(".down.sql") {
        (stem, Direction::Down)
    } else {
        return None;
    };

    let (version, name) = stem.split_once('_')?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) || name.is_empty() {
        return None;
    }
    let version: i64 = version.parse().ok()?;
    (version > 0).then(|| (version, name.to_string(), direction))
}

/// Collect the scripts in `dir`, ordered by version.
///
/// A missing directory yields no scripts.
pub fn discover(dir: &Path) -> Result<Vec<MigrationScript>, MigrationError> {
    if !dir.exists() {
        debug!(dir = %dir.display(), "Migrations directory does not exist");
        return Ok(Vec::new());
    }

    let discovery_error = |source| MigrationError::Discovery {
        path: dir.to_path_buf(),
        source,
    };

    let mut ups: BTreeMap<i64, (String, PathBuf)> = BTreeMap::new();
    let mut downs: BTreeMap<i64, PathBuf> = BTreeMap::new();

    for entry in std::fs::read_dir(dir).map_err(discovery_error)? {
        let entry = entry.map_err(discovery_error)?;
        if !entry.file_type().map_err(discovery_error)?.is_file() {
            continue;
        }

        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("sql") {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let (version, name, direction) = parse_file_name(&file_name)
            .ok_or_else(|| MigrationError::InvalidFileName(file_name.clone()))?;

        let duplicate = match direction {
            Direction::Up => ups.insert(version, (name, path)).is_some(),
            Direction::Down => downs.insert(version, path).is_some(),
        };
        if duplicate {
            return Err(MigrationError::DuplicateVersion(version));
        }
    }

    if let Some(version) = downs.keys().find(|version| !ups.contains_key(version)) {
        return Err(MigrationError::MissingUp(*version));
    }

    let scripts: Vec<MigrationScript> = ups
        .into_iter()
        .map(|(version, (name, up))| MigrationScript {
            version,
            name,
            up,
            down: downs.remove(&version),
        })
        .collect();

    debug!(dir = %dir.display(), count = scripts.len(), "Discovered migrations");
    Ok(scripts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), "SELECT 1;").unwrap();
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(
            parse_file_name("1_create_users.up.sql"),
            Some((1, "create_users".to_string(), Direction::Up))
        );
        assert_eq!(
            parse_file_name("0042_add_index.down.sql"),
            Some((42, "add_index".to_string(), Direction::Down))
        );
        assert_eq!(parse_file_name("0_zero.up.sql"), None);
        assert_eq!(parse_file_name("create_users.up.sql"), None);
        assert_eq!(parse_file_name("1_users.sql"), None);
        assert_eq!(parse_file_name("1_.up.sql"), None);
        assert_eq!(parse_file_name("-1_neg.up.sql"), None);
    }

    #[test]
    fn test_discover_orders_and_pairs() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "10_third.up.sql");
        touch(dir.path(), "2_second.up.sql");
        touch(dir.path(), "2_second.down.sql");
        touch(dir.path(), "1_first.up.sql");
        touch(dir.path(), "README.md");
        fs::create_dir(dir.path().join("archive")).unwrap();
        touch(&dir.path().join("archive"), "3_ignored.up.sql");

        let scripts = discover(dir.path()).unwrap();
        let versions: Vec<i64> = scripts.iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![1, 2, 10]);
        assert!(scripts[0].down.is_none());
        assert!(scripts[1].down.is_some());
        assert_eq!(scripts[2].name, "third");
    }

    #[test]
    fn test_discover_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = discover(&dir.path().join("nope")).unwrap();
        assert!(scripts.is_empty());
    }

    #[test]
    fn test_discover_rejects_bad_names() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "init.sql");
        assert!(matches!(
            discover(dir.path()),
            Err(MigrationError::InvalidFileName(name)) if name == "init.sql"
        ));
    }

    #[test]
    fn test_discover_rejects_duplicate_versions() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "1_a.up.sql");
        touch(dir.path(), "01_b.up.sql");
        assert!(matches!(
            discover(dir.path()),
            Err(MigrationError::DuplicateVersion(1))
        ));
    }

    #[test]
    fn test_discover_rejects_orphan_down() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "1_a.up.sql");
        touch(dir.path(), "2_b.down.sql");
        assert!(matches!(
            discover(dir.path()),
            Err(MigrationError::MissingUp(2))
        ));
    }
}
