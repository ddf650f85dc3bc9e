//! Durable store of named monitoring sessions.
//!
//! Layout under the base directory:
//!
//! ```text
//! index.json            roster + name -> [id] map
//! index.lock            held while the index is rewritten
//! profiles/<id>.json    one full profile per file
//! ```
//!
//! Every index mutation is a read-modify-write performed under an in-process
//! mutex and the `index.lock` file, so concurrent writers (threads or
//! processes) cannot lose each other's entries. Records are replaced by
//! rename, so readers never take the lock.

use serde::{Deserialize, Serialize};
use time::macros::format_description;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::{
    Clock, Config, FileLock, LockOptions, MemorySnapshot, MemoryStats, MemtrendError,
    MemtrendResult, Metadata, SECONDS_PER_DAY, SystemClock, read_json_optional, write_json_atomic,
};

const INDEX_FILE: &str = "index.json";
const LOCK_FILE: &str = "index.lock";
const PROFILES_DIR: &str = "profiles";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryProfile {
    pub id: String,
    pub name: String,
    pub timestamp: f64,
    pub stats: MemoryStats,
    pub snapshots: Vec<MemorySnapshot>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileIndexEntry {
    pub id: String,
    pub name: String,
    pub timestamp: f64,
    /// Record location relative to the store root.
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileIndex {
    #[serde(default)]
    pub profiles: Vec<ProfileIndexEntry>,
    #[serde(default)]
    pub by_name: BTreeMap<String, Vec<String>>,
}

impl ProfileIndex {
    fn entry(&self, id: &str) -> Option<&ProfileIndexEntry> {
        self.profiles.iter().find(|e| e.id == id)
    }

    fn insert(&mut self, entry: ProfileIndexEntry) {
        self.by_name
            .entry(entry.name.clone())
            .or_default()
            .push(entry.id.clone());
        self.profiles.push(entry);
    }

    fn remove(&mut self, id: &str) -> Option<ProfileIndexEntry> {
        let pos = self.profiles.iter().position(|e| e.id == id)?;
        let entry = self.profiles.remove(pos);
        if let Some(ids) = self.by_name.get_mut(&entry.name) {
            ids.retain(|i| i != id);
            if ids.is_empty() {
                self.by_name.remove(&entry.name);
            }
        }
        Some(entry)
    }
}

/// Identity and headline numbers of a profile, without its snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryProfileSummary {
    pub id: String,
    pub name: String,
    pub timestamp: f64,
    pub mean_rss_mb: f64,
    pub max_rss_mb: f64,
    pub total_snapshots: usize,
}

impl From<&MemoryProfile> for MemoryProfileSummary {
    fn from(p: &MemoryProfile) -> Self {
        Self {
            id: p.id.clone(),
            name: p.name.clone(),
            timestamp: p.timestamp,
            mean_rss_mb: p.stats.mean_rss_mb,
            max_rss_mb: p.stats.max_rss_mb,
            total_snapshots: p.stats.total_snapshots,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileComparison {
    pub profile_a: MemoryProfileSummary,
    pub profile_b: MemoryProfileSummary,
    pub mean_rss_delta_mb: f64,
    pub mean_rss_delta_percent: f64,
    pub max_rss_delta_mb: f64,
    pub max_rss_delta_percent: f64,
    pub regression_detected: bool,
}

#[derive(Debug)]
pub struct ProfileStore {
    base_dir: PathBuf,
    clock: Arc<dyn Clock>,
    lock_options: LockOptions,
    writer: Mutex<()>,
}

impl ProfileStore {
    pub fn new(base_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            base_dir: base_dir.into(),
            clock,
            lock_options: LockOptions::default(),
            writer: Mutex::new(()),
        }
    }

    pub fn open(config: &Config) -> Self {
        Self::new(config.base_dir.clone(), Arc::new(SystemClock))
    }

    pub fn with_lock_options(mut self, lock_options: LockOptions) -> Self {
        self.lock_options = lock_options;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn index(&self) -> MemtrendResult<ProfileIndex> {
        Ok(read_json_optional(&self.base_dir.join(INDEX_FILE))?.unwrap_or_default())
    }

    /// Persists a session and returns its new id.
    pub fn save_profile(
        &self,
        name: &str,
        snapshots: &[MemorySnapshot],
        stats: &MemoryStats,
        metadata: Metadata,
    ) -> MemtrendResult<String> {
        if name.trim().is_empty() {
            return Err(MemtrendError::InvalidArgument(
                "profile name must not be empty".to_string(),
            ));
        }
        let timestamp = self.clock.now();
        let profile = self.update_index(|store, index| {
            let id = store.unique_id(index, name, timestamp)?;
            let rel_path = format!("{PROFILES_DIR}/{id}.json");
            let profile = MemoryProfile {
                id: id.clone(),
                name: name.to_string(),
                timestamp,
                stats: stats.clone(),
                snapshots: snapshots.to_vec(),
                metadata,
            };
            write_json_atomic(&store.base_dir.join(&rel_path), &profile)?;
            index.insert(ProfileIndexEntry {
                id,
                name: name.to_string(),
                timestamp,
                path: rel_path,
            });
            Ok(profile)
        })?;
        tracing::debug!(
            id = %profile.id,
            snapshots = profile.snapshots.len(),
            "saved profile"
        );
        Ok(profile.id)
    }

    /// Loads a profile; `Ok(None)` when the id is unknown.
    pub fn get_profile(&self, id: &str) -> MemtrendResult<Option<MemoryProfile>> {
        let index = self.index()?;
        let Some(entry) = index.entry(id) else {
            return Ok(None);
        };
        let profile = read_json_optional(&self.base_dir.join(&entry.path))?;
        if profile.is_none() {
            tracing::warn!(id, path = %entry.path, "indexed profile record is missing");
        }
        Ok(profile)
    }

    /// Profiles saved under `name`, most recent first.
    pub fn profiles_by_name(
        &self,
        name: &str,
        limit: Option<usize>,
    ) -> MemtrendResult<Vec<MemoryProfile>> {
        let index = self.index()?;
        let Some(ids) = index.by_name.get(name) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<&ProfileIndexEntry> =
            ids.iter().filter_map(|id| index.entry(id)).collect();
        sort_recent_first(&mut entries);

        let mut out = Vec::new();
        for entry in entries.into_iter().take(limit.unwrap_or(usize::MAX)) {
            if let Some(profile) = read_json_optional(&self.base_dir.join(&entry.path))? {
                out.push(profile);
            }
        }
        Ok(out)
    }

    /// Index entries across all names, most recent first.
    pub fn list_profiles(&self, limit: Option<usize>) -> MemtrendResult<Vec<ProfileIndexEntry>> {
        let index = self.index()?;
        let mut entries: Vec<&ProfileIndexEntry> = index.profiles.iter().collect();
        sort_recent_first(&mut entries);
        Ok(entries
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    /// Deltas are `b - a`; percentages are relative to `a`.
    pub fn compare_profiles(
        &self,
        id_a: &str,
        id_b: &str,
    ) -> MemtrendResult<Option<ProfileComparison>> {
        let (Some(a), Some(b)) = (self.get_profile(id_a)?, self.get_profile(id_b)?) else {
            return Ok(None);
        };
        let mean_delta = b.stats.mean_rss_mb - a.stats.mean_rss_mb;
        let max_delta = b.stats.max_rss_mb - a.stats.max_rss_mb;
        Ok(Some(ProfileComparison {
            mean_rss_delta_mb: mean_delta,
            mean_rss_delta_percent: percent_of(mean_delta, a.stats.mean_rss_mb),
            max_rss_delta_mb: max_delta,
            max_rss_delta_percent: percent_of(max_delta, a.stats.max_rss_mb),
            regression_detected: mean_delta > 0.0 || max_delta > 0.0,
            profile_a: MemoryProfileSummary::from(&a),
            profile_b: MemoryProfileSummary::from(&b),
        }))
    }

    /// Deletes profiles saved more than `age_days` ago. Returns how many.
    ///
    /// The pruned index is written before any record is deleted; a record
    /// that cannot be deleted is left behind as an unindexed orphan.
    pub fn cleanup_old_profiles(&self, age_days: f64) -> MemtrendResult<usize> {
        if !age_days.is_finite() || age_days < 0.0 {
            return Err(MemtrendError::InvalidArgument(format!(
                "cleanup age must be a non-negative number of days, got {age_days}"
            )));
        }
        let cutoff = self.clock.now() - age_days * SECONDS_PER_DAY;
        let expired = self.update_index(|_, index| {
            let ids: Vec<String> = index
                .profiles
                .iter()
                .filter(|e| e.timestamp < cutoff)
                .map(|e| e.id.clone())
                .collect();
            Ok(ids
                .iter()
                .filter_map(|id| index.remove(id))
                .collect::<Vec<_>>())
        })?;

        for entry in &expired {
            match std::fs::remove_file(self.base_dir.join(&entry.path)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(id = %entry.id, path = %entry.path, "orphaned profile record: {err}");
                }
            }
        }
        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), age_days, "removed old profiles");
        }
        Ok(expired.len())
    }

    fn update_index<T>(
        &self,
        f: impl FnOnce(&Self, &mut ProfileIndex) -> MemtrendResult<T>,
    ) -> MemtrendResult<T> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let _lock = FileLock::acquire(&self.base_dir.join(LOCK_FILE), self.lock_options)?;
        let mut index = self.index()?;
        let out = f(self, &mut index)?;
        write_json_atomic(&self.base_dir.join(INDEX_FILE), &index)?;
        Ok(out)
    }

    fn unique_id(&self, index: &ProfileIndex, name: &str, timestamp: f64) -> MemtrendResult<String> {
        let base = profile_id(name, timestamp)?;
        let mut id = base.clone();
        let mut n = 1u32;
        while index.entry(&id).is_some()
            || self
                .base_dir
                .join(PROFILES_DIR)
                .join(format!("{id}.json"))
                .exists()
        {
            id = format!("{base}-{n}");
            n += 1;
        }
        Ok(id)
    }
}

/// `<slug>_<YYYYMMDD_HHMMSS>_<hash8>`, derived from name and save time.
pub fn profile_id(name: &str, timestamp: f64) -> MemtrendResult<String> {
    let slug: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(48)
        .collect();
    let when = time::OffsetDateTime::from_unix_timestamp(timestamp.floor() as i64)
        .map_err(|e| MemtrendError::InvalidArgument(format!("timestamp {timestamp}: {e}")))?;
    let stamp = when.format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(name.as_bytes());
    hasher.update(&timestamp.to_bits().to_le_bytes());
    let hash = hasher.finalize().to_hex();
    Ok(format!("{slug}_{stamp}_{}", &hash.as_str()[..8]))
}

fn sort_recent_first(entries: &mut [&ProfileIndexEntry]) {
    entries.sort_by(|a, b| {
        b.timestamp
            .total_cmp(&a.timestamp)
            .then_with(|| b.id.cmp(&a.id))
    });
}

fn percent_of(delta: f64, base: f64) -> f64 {
    if base.abs() < f64::EPSILON {
        0.0
    } else {
        delta / base * 100.0
    }
}
