use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::CacheConfig;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("guid `{0}` is shorter than 4 characters")]
    GuidTooShort(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One indexed artifact. The file at `path` exists for as long as the
/// entry does; the converse does not hold (unindexed files are repaired
/// on the next download or collected by the pressure sweep).
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub guid: String,
    pub path: PathBuf,
    pub last_access: DateTime<Utc>,
}

/// Disk-backed artifact cache for one class (droplet, package or
/// buildpack cache). Files live under
/// `<base>/<class_dir>/<g[0..2]>/<g[2..4]>/<guid>`; the in-memory index
/// is rebuilt lazily after a restart.
///
/// The index mutex is never held across file or network I/O.
pub struct ArtifactCache {
    label: &'static str,
    base_dir: PathBuf,
    class_dir: String,
    ttl: Duration,
    disk_max_used_percent: u64,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ArtifactCache {
    pub fn from_config(label: &'static str, cfg: &CacheConfig) -> Self {
        Self {
            label,
            base_dir: PathBuf::from(&cfg.cache_base_dir),
            class_dir: cfg.cache_directory.clone(),
            ttl: Duration::from_secs(cfg.cache_time_out_secs),
            disk_max_used_percent: cfg.disk_max_used_percent,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn class_root(&self) -> PathBuf {
        self.base_dir.join(&self.class_dir)
    }

    /// Canonical on-disk location for a guid; pure derivation, no
    /// directory creation.
    pub fn canonical_path(&self, guid: &str) -> Result<PathBuf, CacheError> {
        let chars: Vec<char> = guid.chars().collect();
        if chars.len() < 4 {
            return Err(CacheError::GuidTooShort(guid.to_string()));
        }
        let first: String = chars[0..2].iter().collect();
        let second: String = chars[2..4].iter().collect();
        Ok(self.class_root().join(first).join(second).join(guid))
    }

    /// Canonical location with the sharded directories created (0777,
    /// matching what the fleet's unprivileged writers expect).
    pub fn ensure_path(&self, guid: &str) -> Result<PathBuf, CacheError> {
        let path = self.canonical_path(guid)?;
        if let Some(parent) = path.parent() {
            let mut builder = fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            std::os::unix::fs::DirBuilderExt::mode(&mut builder, 0o777);
            builder.create(parent)?;
        }
        Ok(path)
    }

    /// Register (or refresh) the index entry for a file already on disk.
    pub fn register(&self, guid: &str, path: PathBuf) {
        info!(class = self.label, guid = %guid, path = %path.display(), "registering cache entry");
        let mut entries = self.entries.lock().unwrap();
        entries.remove(guid);
        entries.insert(
            guid.to_string(),
            CacheEntry {
                guid: guid.to_string(),
                path,
                last_access: Utc::now(),
            },
        );
    }

    pub fn unregister(&self, guid: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(guid);
    }

    /// Index lookup. A hit removes and reinserts the entry with a fresh
    /// `last_access`; an entry whose file has vanished stays removed and
    /// the lookup reports a miss.
    pub fn lookup(&self, guid: &str) -> Option<PathBuf> {
        let mut entries = self.entries.lock().unwrap();
        let mut entry = entries.remove(guid)?;
        if entry.path.exists() {
            let path = entry.path.clone();
            entry.last_access = Utc::now();
            entries.insert(guid.to_string(), entry);
            return Some(path);
        }
        warn!(class = self.label, guid = %guid, "indexed file missing on disk, dropping entry");
        None
    }

    /// Remove the local file and index entry for a guid, best-effort.
    pub fn destroy(&self, guid: &str) {
        info!(class = self.label, guid = %guid, "destroying cached artifact");
        let path = match self.lookup(guid) {
            Some(path) => path,
            None => match self.canonical_path(guid) {
                Ok(path) => path,
                Err(e) => {
                    warn!(class = self.label, guid = %guid, error = %e, "cannot derive cache path");
                    return;
                }
            },
        };
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(class = self.label, guid = %guid, error = %e, "failed to remove cached file");
            }
        }
        self.unregister(guid);
    }

    /// Index dump for the HTTP surface.
    pub fn snapshot(&self) -> BTreeMap<String, CacheEntry> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .map(|(guid, entry)| (guid.clone(), entry.clone()))
            .collect()
    }

    /// TTL sweep: drop every entry not accessed within the TTL, deleting
    /// its file. A failed delete leaves the entry for the next tick.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let cutoff = now - self.ttl;
        let expired: Vec<(String, PathBuf)> = {
            let entries = self.entries.lock().unwrap();
            entries
                .values()
                .filter(|e| e.last_access < cutoff)
                .map(|e| (e.guid.clone(), e.path.clone()))
                .collect()
        };

        for (guid, path) in expired {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(class = self.label, guid = %guid, error = %e, "sweep delete failed, will retry next tick");
                    continue;
                }
            }
            info!(class = self.label, guid = %guid, "expired cache entry removed");
            self.unregister(&guid);
        }
    }

    /// Disk-pressure sweep. When the cache volume's used share reaches
    /// the configured threshold, walk the whole class tree and delete
    /// every regular file older than the TTL by modification time. This
    /// is index-independent: it reclaims files that were never indexed.
    pub fn pressure_sweep(&self, now: DateTime<Utc>) {
        let used = disk_used_percent(&self.base_dir);
        if used < self.disk_max_used_percent {
            return;
        }
        info!(
            class = self.label,
            used_percent = used,
            threshold = self.disk_max_used_percent,
            "disk pressure, walking cache tree"
        );

        let cutoff = now - self.ttl;
        walk_files(&self.class_root(), &mut |path, modified| {
            let modified: DateTime<Utc> = modified.into();
            if modified < cutoff {
                match fs::remove_file(path) {
                    Ok(()) => info!(class = self.label, path = %path.display(), "aged file reclaimed"),
                    Err(e) => warn!(class = self.label, path = %path.display(), error = %e, "failed to reclaim file"),
                }
            }
        });
    }
}

/// Used share of the filesystem holding `path`, in whole percent.
/// Unknown volumes report 0, which never triggers the pressure walk.
fn disk_used_percent(path: &Path) -> u64 {
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let best = disks
        .list()
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len());
    match best {
        Some(disk) if disk.total_space() > 0 => {
            let used = disk.total_space() - disk.available_space();
            used * 100 / disk.total_space()
        }
        _ => {
            warn!(path = %path.display(), "no disk stats for cache volume");
            0
        }
    }
}

fn walk_files(dir: &Path, visit: &mut impl FnMut(&Path, SystemTime)) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %e, "cache walk failed");
            }
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            walk_files(&path, visit);
        } else if file_type.is_file() {
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                visit(&path, modified);
            }
        }
    }
}
