//! Crash-safe state persistence
//!
//! ## Overview
//!
//! The state manager provides:
//! 1. Versioned JSON snapshots, superseded atomically (write temp, rename)
//! 2. Rotating timestamped backups with FIFO retention
//! 3. A periodic autosave task fed by a caller-supplied state producer
//!
//! A crash mid-write never corrupts the previous snapshot: data only
//! replaces the live file through `rename`, and the stored document is
//! sanitized before serialization so it stays safe to feed to the other
//! tooling that reads these files.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::types::{Result, WardenError};

/// Current snapshot format version
pub const STATE_VERSION: u32 = 2;

const STATE_FILE: &str = "state.json";
const BACKUP_DIR: &str = "backups";
const BACKUP_PREFIX: &str = "state-";
const BACKUP_SUFFIX: &str = ".json";

/// Object keys stripped from any persisted document. The snapshot files are
/// shared with external tooling that merges them into live objects, so
/// these must never survive a save or a load.
const DANGEROUS_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Versioned envelope wrapping every snapshot on disk
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    timestamp: DateTime<Utc>,
    state: Value,
}

/// One backup file on disk
#[derive(Debug, Clone)]
pub struct BackupInfo {
    /// Timestamp id, e.g. `20260807T120000123`
    pub id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

struct AutosaveTask {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Atomic snapshot persistence plus rotating backups
pub struct StateManager {
    state_path: PathBuf,
    backup_dir: PathBuf,
    max_backups: usize,
    /// Last issued backup timestamp (ms), kept monotonic so ids are unique
    last_backup_ms: AtomicI64,
    autosave: Mutex<Option<AutosaveTask>>,
}

impl StateManager {
    /// Create a manager rooted at `data_dir`, creating it if needed
    pub fn new(data_dir: &Path, max_backups: usize) -> Result<Self> {
        let backup_dir = data_dir.join(BACKUP_DIR);
        fs::create_dir_all(&backup_dir)?;

        Ok(Self {
            state_path: data_dir.join(STATE_FILE),
            backup_dir,
            max_backups,
            last_backup_ms: AtomicI64::new(0),
            autosave: Mutex::new(None),
        })
    }

    /// Path of the live snapshot file
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Persist a snapshot of `state`.
    ///
    /// The document is sanitized, wrapped in a versioned envelope, written
    /// to a temp file, and renamed over the live snapshot. On error the
    /// previous snapshot is untouched.
    pub fn save_state(&self, state: &Value) -> Result<()> {
        let snapshot = Snapshot {
            version: STATE_VERSION,
            timestamp: Utc::now(),
            state: sanitize(state),
        };

        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        write_atomic(&self.state_path, &bytes)?;
        debug!(bytes = bytes.len(), "State snapshot saved");
        Ok(())
    }

    /// Load the persisted snapshot, migrating older versions.
    ///
    /// Returns `Ok(None)` when no snapshot exists yet.
    pub fn load_state(&self) -> Result<Option<Value>> {
        if !self.state_path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&self.state_path)?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;

        let state = if snapshot.version == STATE_VERSION {
            snapshot.state
        } else {
            info!(
                from = snapshot.version,
                to = STATE_VERSION,
                "Migrating state snapshot"
            );
            migrate(snapshot.version, snapshot.state)?
        };

        Ok(Some(sanitize(&state)))
    }

    /// Copy the live snapshot into the backup directory.
    ///
    /// Returns the backup id, or `None` when there is no snapshot to back
    /// up. Retention is enforced afterwards.
    pub fn create_backup(&self) -> Result<Option<String>> {
        if !self.state_path.exists() {
            warn!("No state snapshot exists; skipping backup");
            return Ok(None);
        }

        let id = self.next_backup_id();
        let path = self.backup_path(&id);
        fs::copy(&self.state_path, &path)?;
        info!(backup = %id, "Created state backup");

        self.cleanup_backups()?;
        Ok(Some(id))
    }

    /// Replace the live snapshot with a backup's contents (atomically)
    pub fn restore_backup(&self, id: &str) -> Result<()> {
        let path = self.backup_path(id);
        if !path.exists() {
            return Err(WardenError::Config(format!("unknown backup id: {id}")));
        }

        let bytes = fs::read(&path)?;
        // Validate before clobbering the live snapshot
        let _: Snapshot = serde_json::from_slice(&bytes)?;
        write_atomic(&self.state_path, &bytes)?;
        info!(backup = %id, "Restored state from backup");
        Ok(())
    }

    /// All backups, newest first
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.backup_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(id) = name
                .strip_prefix(BACKUP_PREFIX)
                .and_then(|n| n.strip_suffix(BACKUP_SUFFIX))
            else {
                continue;
            };
            backups.push(BackupInfo {
                id: id.to_string(),
                path: entry.path(),
                size_bytes: entry.metadata()?.len(),
            });
        }

        // Ids are zero-padded timestamps, so lexicographic order is
        // chronological order.
        backups.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(backups)
    }

    /// Delete oldest backups until at most `max_backups` remain
    pub fn cleanup_backups(&self) -> Result<usize> {
        let backups = self.list_backups()?;
        if backups.len() <= self.max_backups {
            return Ok(0);
        }

        let mut removed = 0;
        for backup in backups.iter().rev().take(backups.len() - self.max_backups) {
            fs::remove_file(&backup.path)?;
            debug!(backup = %backup.id, "Evicted old backup");
            removed += 1;
        }
        Ok(removed)
    }

    /// Start (or restart) the periodic autosave task.
    ///
    /// `producer` is called on every tick to obtain the state to persist.
    /// Calling this again replaces the previous task; there is never more
    /// than one timer running.
    pub async fn enable_autosave<F>(self: &Arc<Self>, interval: Duration, producer: F)
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        let mut guard = self.autosave.lock().await;
        if let Some(task) = guard.take() {
            let _ = task.shutdown_tx.send(()).await;
            let _ = task.handle.await;
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick of an interval fires immediately; skip it so
            // the first save happens one full interval after enabling.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let state = producer();
                        if let Err(e) = manager.save_state(&state) {
                            error!(error = %e, "Autosave failed; previous snapshot remains authoritative");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        *guard = Some(AutosaveTask {
            shutdown_tx,
            handle,
        });
        info!(interval_secs = interval.as_secs(), "Autosave enabled");
    }

    /// Stop the autosave task if one is running
    pub async fn disable_autosave(&self) {
        let mut guard = self.autosave.lock().await;
        if let Some(task) = guard.take() {
            let _ = task.shutdown_tx.send(()).await;
            let _ = task.handle.await;
            info!("Autosave disabled");
        }
    }

    fn backup_path(&self, id: &str) -> PathBuf {
        self.backup_dir
            .join(format!("{BACKUP_PREFIX}{id}{BACKUP_SUFFIX}"))
    }

    /// Timestamp-derived backup id, forced monotonic so that two backups
    /// within the same millisecond still get distinct names.
    fn next_backup_id(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let ms = self
            .last_backup_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .map(|last| now.max(last + 1))
            .unwrap_or(now);

        let stamp = DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now);
        stamp.format("%Y%m%dT%H%M%S%3f").to_string()
    }
}

/// Write `bytes` to a temp file, fsync, then rename over `path`
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    Ok(())
}

/// Recursively rebuild a JSON document without dangerous object keys
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut clean = serde_json::Map::new();
            for (key, val) in map {
                if DANGEROUS_KEYS.contains(&key.as_str()) {
                    warn!(key = %key, "Stripped dangerous key from state document");
                    continue;
                }
                clean.insert(key.clone(), sanitize(val));
            }
            Value::Object(clean)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

/// Version-aware snapshot migration.
///
/// v1 snapshots stored the session table under `accounts` and carried no
/// counters object; both are patched in place.
fn migrate(version: u32, mut state: Value) -> Result<Value> {
    match version {
        1 => {
            if let Some(map) = state.as_object_mut() {
                if let Some(sessions) = map.remove("accounts") {
                    map.insert("sessions".to_string(), sessions);
                }
                map.entry("counters")
                    .or_insert_with(|| serde_json::json!({ "errors": 0 }));
            }
            Ok(state)
        }
        other if other > STATE_VERSION => Err(WardenError::Config(format!(
            "snapshot version {other} is newer than this build supports ({STATE_VERSION})"
        ))),
        other => Err(WardenError::Config(format!(
            "no migration path from snapshot version {other}"
        ))),
    }
}
