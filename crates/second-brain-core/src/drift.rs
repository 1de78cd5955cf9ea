//! Migration drift detection.
//!
//! Compares the migrations found on disk ([`MigrationInfo`]) with the
//! records of applied migrations ([`MigrationRecord`]) and classifies each
//! version:
//!
//! | Drift type | On disk | Applied | Severity |
//! |------------|---------|---------|----------|
//! | `modified` | yes | yes, checksum differs | critical |
//! | `unexpected` | no | yes | critical |
//! | `missing` | yes | no | pending, informational |
//!
//! The categories are disjoint and each version yields at most one item.
//! Output order is fixed: all `modified`, then `unexpected`, then
//! `missing`, each ascending by version.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A migration file discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationInfo {
    pub version: u32,
    pub filename: String,
    /// Lower-case hex SHA-256 of the file bytes.
    pub checksum: String,
}

/// A persisted record of an applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: u32,
    pub filename: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    pub execution_time_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftType {
    Modified,
    Unexpected,
    Missing,
}

impl DriftType {
    pub fn is_critical(self) -> bool {
        matches!(self, DriftType::Modified | DriftType::Unexpected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftItem {
    pub version: u32,
    pub filename: String,
    pub drift_type: DriftType,
    pub expected_checksum: Option<String>,
    pub actual_checksum: Option<String>,
    pub message: String,
}

/// Classify every version present on either side.
pub fn detect_drift(expected: &[MigrationInfo], applied: &[MigrationRecord]) -> Vec<DriftItem> {
    let expected_by_version: BTreeMap<u32, &MigrationInfo> =
        expected.iter().map(|m| (m.version, m)).collect();
    let applied_by_version: BTreeMap<u32, &MigrationRecord> =
        applied.iter().map(|r| (r.version, r)).collect();

    let mut items = Vec::new();

    for (version, info) in &expected_by_version {
        if let Some(record) = applied_by_version.get(version) {
            if info.checksum != record.checksum {
                items.push(DriftItem {
                    version: *version,
                    filename: info.filename.clone(),
                    drift_type: DriftType::Modified,
                    expected_checksum: Some(info.checksum.clone()),
                    actual_checksum: Some(record.checksum.clone()),
                    message: format!(
                        "Migration {} checksum differs. Expected: {}, found in DB: {}",
                        info.filename, info.checksum, record.checksum
                    ),
                });
            }
        }
    }

    for (version, record) in &applied_by_version {
        if !expected_by_version.contains_key(version) {
            items.push(DriftItem {
                version: *version,
                filename: record.filename.clone(),
                drift_type: DriftType::Unexpected,
                expected_checksum: None,
                actual_checksum: Some(record.checksum.clone()),
                message: format!(
                    "Migration {} found in schema_versions table but no corresponding file in migrations directory",
                    record.filename
                ),
            });
        }
    }

    for (version, info) in &expected_by_version {
        if !applied_by_version.contains_key(version) {
            items.push(DriftItem {
                version: *version,
                filename: info.filename.clone(),
                drift_type: DriftType::Missing,
                expected_checksum: Some(info.checksum.clone()),
                actual_checksum: None,
                message: format!(
                    "Migration {} exists in migrations directory but not found in schema_versions table (pending migration)",
                    info.filename
                ),
            });
        }
    }

    items
}

/// Split drift items into (critical, pending).
pub fn partition_critical(items: Vec<DriftItem>) -> (Vec<DriftItem>, Vec<DriftItem>) {
    items.into_iter().partition(|item| item.drift_type.is_critical())
}

/// Expected migrations with no applied record, ascending by version.
pub fn pending_migrations(
    expected: &[MigrationInfo],
    applied: &[MigrationRecord],
) -> Vec<MigrationInfo> {
    let mut pending: Vec<MigrationInfo> = expected
        .iter()
        .filter(|m| !applied.iter().any(|r| r.version == m.version))
        .cloned()
        .collect();
    pending.sort_by_key(|m| m.version);
    pending
}
