//! Migration discovery and schema drift validation.
//!
//! A [`SchemaManager`] owns one migrations directory. Files named
//! `NNN_description.sql` (digits, underscore, lower-case snake case) are
//! migrations; anything else is skipped with a debug log. Each file is
//! checksummed with SHA-256, read in 4 KiB blocks.
//!
//! [`SchemaManager::validate_schema_integrity`] compares the directory
//! against applied records and fails with `SCHEMA_DRIFT` when a migration
//! was modified after it was applied, or when an applied migration has no
//! file any more. Pending migrations are only logged.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use second_brain_core::drift::{detect_drift, partition_critical, MigrationInfo, MigrationRecord};
use second_brain_core::error::{codes, BrainError};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

static MIGRATION_FILENAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(\d+)_[a-z0-9_]+\.sql$").ok());

const CHECKSUM_BLOCK_SIZE: usize = 4096;

/// Parse the version out of a migration filename, or `None` if the name
/// does not follow the `NNN_description.sql` convention.
pub fn parse_version(filename: &str) -> Option<u32> {
    let re = (*MIGRATION_FILENAME).as_ref()?;
    let caps = re.captures(filename)?;
    caps.get(1)?.as_str().parse().ok()
}

/// Lower-case hex SHA-256 of the file at `path`.
pub fn file_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHECKSUM_BLOCK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub struct SchemaManager {
    migrations_dir: PathBuf,
}

impl SchemaManager {
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
        }
    }

    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    /// Migrations on disk, ascending by version.
    ///
    /// Two files mapping to the same version are a `DUPLICATE_VERSION`
    /// error. Subdirectories are not searched.
    pub fn scan_migrations(&self) -> Result<Vec<MigrationInfo>, BrainError> {
        let entries = std::fs::read_dir(&self.migrations_dir).map_err(|e| {
            BrainError::schema(
                codes::MIGRATIONS_DIR_UNREADABLE,
                format!(
                    "Cannot read migrations directory {}",
                    self.migrations_dir.display()
                ),
            )
            .with_context("migrations_dir", self.migrations_dir.display().to_string())
            .with_source(e)
        })?;

        let mut by_version: HashMap<u32, String> = HashMap::new();
        let mut migrations = Vec::new();

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "sql"))
            .collect();
        paths.sort();

        for path in paths {
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(version) = parse_version(filename) else {
                debug!(filename, "skipping file that does not match migration naming");
                continue;
            };

            if let Some(existing) = by_version.get(&version) {
                return Err(BrainError::schema(
                    codes::DUPLICATE_VERSION,
                    format!(
                        "Duplicate version detected: both '{}' and '{}' map to version {}",
                        existing, filename, version
                    ),
                )
                .with_context("version", version)
                .with_context("files", vec![existing.clone(), filename.to_string()]));
            }
            by_version.insert(version, filename.to_string());

            let checksum = file_checksum(&path).map_err(|e| {
                BrainError::schema(
                    codes::SCHEMA_ERROR,
                    format!("Failed to checksum migration {}", filename),
                )
                .with_context("filename", filename)
                .with_source(e)
            })?;

            migrations.push(MigrationInfo {
                version,
                filename: filename.to_string(),
                checksum,
            });
        }

        migrations.sort_by_key(|m| m.version);
        Ok(migrations)
    }

    /// Fail with `SCHEMA_DRIFT` if any applied migration was modified or
    /// has disappeared from disk.
    pub fn validate_schema_integrity(&self, applied: &[MigrationRecord]) -> Result<(), BrainError> {
        let expected = self.scan_migrations()?;
        let items = detect_drift(&expected, applied);
        let total = items.len();
        let (critical, pending) = partition_critical(items);
        let dir = self.migrations_dir.display().to_string();

        if !critical.is_empty() {
            return Err(BrainError::schema(
                codes::SCHEMA_DRIFT,
                format!("Schema drift detected: {} issue(s)", critical.len()),
            )
            .with_context("drift_count", critical.len())
            .with_context("drift_items", to_json_list(&critical))
            .with_context("total_drift_count", total)
            .with_context("pending_migrations", to_json_list(&pending))
            .with_context("migrations_dir", dir));
        }

        if !pending.is_empty() {
            let names: Vec<&str> = pending.iter().map(|p| p.filename.as_str()).collect();
            info!(
                migrations_dir = %dir,
                pending_count = pending.len(),
                pending = ?names,
                "pending migrations detected"
            );
        }

        info!(
            migrations_dir = %dir,
            expected_count = expected.len(),
            applied_count = applied.len(),
            "schema integrity validated"
        );
        Ok(())
    }
}

fn to_json_list<T: serde::Serialize>(items: &[T]) -> serde_json::Value {
    serde_json::to_value(items).unwrap_or(serde_json::Value::Null)
}
