//! Schema migrations for the storage index
//!
//! Each registered migration brings the persisted record up to one version.
//! Migrations are idempotent: running one twice leaves the store unchanged.
//! They end by persisting a record whose `version` is the migration's own
//! version, which [`MigrationRegistry::migrate_to_version`] checks after each
//! step.
//!
//! ## Versions
//!
//! - **1.0**: creates the index (and the blob directory) or fills in missing
//!   top-level fields of an older record
//! - **1.1**: fills missing per-snapshot fields, repairs aggregates and
//!   missing index entries, and rejects records whose index lists unknown or
//!   misfiled ids
//!
//! A store without a record is at version `0.0`.

use crate::content::OBJECTS_DIR;
use crate::error::{HistoryError, Result};
use crate::index::{StorageIndex, INDEX_KEY};
use crate::kv::KeyValueStore;
use crate::utils::now_millis;
use crate::version::SchemaVersion;
use serde_json::{json, Map, Value};
use std::path::Path;
use tracing::{debug, info, warn};

/// Version the code expects the persisted record to be at
pub const CURRENT_SCHEMA_VERSION: &str = "1.1";

/// Version of a store that holds no record
pub const INITIAL_VERSION: &str = "0.0";

/// Signature of a migration step
pub type MigrationFn = fn(&dyn KeyValueStore, &Path) -> Result<()>;

/// One registered migration
#[derive(Clone)]
pub struct Migration {
    /// Version the step migrates to
    pub version: SchemaVersion,
    /// The step itself
    pub apply: MigrationFn,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration").field("version", &self.version.as_str()).finish()
    }
}

/// Migrations sorted by version
#[derive(Debug, Clone)]
pub struct MigrationRegistry {
    migrations: Vec<Migration>,
}

impl MigrationRegistry {
    /// Build a registry from `(version, step)` pairs in any order
    pub fn new(entries: Vec<(&str, MigrationFn)>) -> Result<Self> {
        let mut migrations = entries
            .into_iter()
            .map(|(version, apply)| {
                Ok(Migration {
                    version: version.parse()?,
                    apply,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        migrations.sort_by(|a, b| a.version.cmp(&b.version));

        if let Some(pair) = migrations.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(HistoryError::migration(format!(
                "migration {} registered twice",
                pair[1].version
            )));
        }
        Ok(Self { migrations })
    }

    /// The built-in migrations
    pub fn builtin() -> Result<Self> {
        Self::new(vec![("1.1", migrate_1_1 as MigrationFn), ("1.0", migrate_1_0 as MigrationFn)])
    }

    /// Registered versions in ascending order
    pub fn versions(&self) -> Vec<&str> {
        self.migrations.iter().map(|m| m.version.as_str()).collect()
    }

    /// Apply every migration in `(current, target]` in ascending order
    ///
    /// The path is checked before anything runs, so an impossible migration
    /// leaves the store untouched.
    pub fn migrate_to_version(
        &self,
        store: &dyn KeyValueStore,
        storage_path: &Path,
        current: &str,
        target: &str,
    ) -> Result<()> {
        let from: SchemaVersion = current.parse()?;
        let to: SchemaVersion = target.parse()?;

        if from == to {
            debug!("Schema already at version {}", current);
            return Ok(());
        }
        if from > to {
            return Err(HistoryError::migration(format!(
                "cannot migrate to older version: {} -> {}",
                current, target
            )));
        }

        let steps: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| m.version > from && m.version <= to)
            .collect();
        if steps.last().map_or(true, |last| last.version != to) {
            return Err(HistoryError::migration(format!(
                "no migration path from {} to {}",
                current, target
            )));
        }

        for step in steps {
            info!("Migrating storage index to version {}", step.version);
            (step.apply)(store, storage_path)?;

            let persisted = get_current_version(store, INDEX_KEY)?;
            if persisted.as_deref() != Some(step.version.as_str()) {
                return Err(HistoryError::migration(format!(
                    "migration to {} finished but the stored version is {}",
                    step.version,
                    persisted.as_deref().unwrap_or("missing")
                )));
            }
        }

        info!("Storage index migrated from {} to {}", current, target);
        Ok(())
    }
}

/// Migrate with the built-in registry
pub fn migrate_to_version(store: &dyn KeyValueStore, storage_path: &Path, current: &str, target: &str) -> Result<()> {
    MigrationRegistry::builtin()?.migrate_to_version(store, storage_path, current, target)
}

/// Persisted version of the record under `key`
///
/// `None` when no record exists. A record without a version field predates
/// versioning and reports [`INITIAL_VERSION`].
pub fn get_current_version(store: &dyn KeyValueStore, key: &str) -> Result<Option<String>> {
    let Some(record) = store.get(key)? else {
        return Ok(None);
    };
    match record.get("version") {
        None | Some(Value::Null) => Ok(Some(INITIAL_VERSION.to_string())),
        Some(Value::String(version)) => Ok(Some(version.clone())),
        Some(other) => Err(HistoryError::corruption(format!(
            "storage index version is not a string: {}",
            other
        ))),
    }
}

/// Bring the store at `storage_path` to [`CURRENT_SCHEMA_VERSION`]
///
/// Returns the version the store was at before migrating.
pub fn ensure_current_schema(store: &dyn KeyValueStore, storage_path: &Path) -> Result<String> {
    let current = get_current_version(store, INDEX_KEY)?.unwrap_or_else(|| INITIAL_VERSION.to_string());
    migrate_to_version(store, storage_path, &current, CURRENT_SCHEMA_VERSION)?;
    Ok(current)
}

/// Version 1.0: create the record or fill its top-level fields
pub fn migrate_1_0(store: &dyn KeyValueStore, storage_path: &Path) -> Result<()> {
    std::fs::create_dir_all(storage_path.join(OBJECTS_DIR))?;
    let now = now_millis();

    let record = match store.get(INDEX_KEY)? {
        None => {
            debug!("Creating empty storage index");
            serde_json::to_value(StorageIndex::empty("1.0", now))?
        }
        Some(Value::Object(mut map)) => {
            fill_top_level(&mut map, now);
            Value::Object(map)
        }
        Some(_) => return Err(HistoryError::corruption("storage index record is not an object")),
    };

    store.update(INDEX_KEY, record)
}

fn fill_top_level(map: &mut Map<String, Value>, now: i64) {
    let snapshots = map.entry("snapshots").or_insert_with(|| json!([]));
    if !snapshots.is_array() {
        *snapshots = json!([]);
    }
    let (count, size) = snapshot_totals(snapshots);

    let index = map.entry("index").or_insert_with(|| json!({}));
    if !index.is_object() {
        *index = json!({});
    }

    let metadata = map.entry("metadata").or_insert_with(|| json!({}));
    if !metadata.is_object() {
        *metadata = json!({});
    }
    if let Some(meta) = metadata.as_object_mut() {
        let created = meta.entry("created").or_insert_with(|| json!(now)).clone();
        meta.entry("lastCleanup").or_insert(created);
        meta.entry("totalSnapshots").or_insert_with(|| json!(count));
        meta.entry("totalSize").or_insert_with(|| json!(size));
        meta.insert("version".to_string(), json!("1.0"));
    }

    map.insert("version".to_string(), json!("1.0"));
}

fn snapshot_totals(snapshots: &Value) -> (usize, u64) {
    let Some(list) = snapshots.as_array() else {
        return (0, 0);
    };
    let size = list
        .iter()
        .filter(|s| !s.pointer("/metadata/deleted").and_then(Value::as_bool).unwrap_or(false))
        .filter_map(|s| s.pointer("/metadata/size").and_then(Value::as_u64))
        .sum();
    (list.len(), size)
}

/// Version 1.1: per-snapshot defaults and index repair
pub fn migrate_1_1(store: &dyn KeyValueStore, _storage_path: &Path) -> Result<()> {
    let mut record = store
        .get(INDEX_KEY)?
        .ok_or_else(|| HistoryError::migration("no storage index to migrate to 1.1"))?;

    if let Some(snapshots) = record.get_mut("snapshots").and_then(Value::as_array_mut) {
        for snapshot in snapshots.iter_mut().filter_map(Value::as_object_mut) {
            fill_snapshot_fields(snapshot);
        }
    }

    let mut index: StorageIndex = serde_json::from_value(record)
        .map_err(|e| HistoryError::corruption(format!("storage index cannot be migrated to 1.1: {}", e)))?;

    let errors = index.consistency_errors();
    if !errors.is_empty() {
        return Err(HistoryError::corruption(format!(
            "storage index is inconsistent: {}",
            errors.join("; ")
        )));
    }

    let missing: Vec<(String, String)> = index
        .unindexed_snapshots()
        .into_iter()
        .map(|s| (s.file_uri.clone(), s.id.clone()))
        .collect();
    for (uri, id) in missing {
        warn!("Adding missing index entry for snapshot {} of {}", id, uri);
        index.index.entry(uri).or_default().push(id);
    }

    if !index.aggregates_consistent() {
        warn!(
            "Repairing storage aggregates (recorded {} snapshots / {} bytes)",
            index.metadata.total_snapshots, index.metadata.total_size
        );
    }
    index.recompute_aggregates();
    index.version = "1.1".to_string();
    index.metadata.version = "1.1".to_string();
    index.save(store)
}

fn fill_snapshot_fields(snapshot: &mut Map<String, Value>) {
    let accepted = snapshot
        .entry("accepted")
        .or_insert(Value::Bool(false))
        .as_bool()
        .unwrap_or(false);
    if !accepted {
        snapshot.remove("acceptedTimestamp");
    }

    let metadata = snapshot.entry("metadata").or_insert_with(|| json!({}));
    if let Some(meta) = metadata.as_object_mut() {
        meta.entry("compressed").or_insert(Value::Bool(false));
        meta.entry("deleted").or_insert(Value::Bool(false));
        meta.entry("encoding").or_insert_with(|| json!("utf8"));
    }
}
