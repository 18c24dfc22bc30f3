//! Durable, crash-safe persistence for the monitor document.
//!
//! A single dedicated writer task owns the authoritative in-memory document
//! and pulls mutations from a FIFO queue; every mutation is applied to a
//! working copy, shadow-written to `<db>.tmp`, fsynced, and atomically
//! renamed over `<db>`. A failed write rolls the working copy back and
//! reports the error to exactly its submitter; the file is never observable
//! in a partially-written state.
//!
//! Schema migrations run once at load: the current file is backed up to
//! `<db>.backup_YYYYMMDD_HHMMSS` (keeping the newest five), migrated
//! value-by-value, and written back; a failed migration restores the backup.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::WatchError;
use crate::types::{Database, SCHEMA_VERSION};

/// Minimum free space at the database directory for a write to proceed.
pub const DISK_GUARD_BYTES: u64 = 100 * 1024 * 1024;

/// How many pre-migration backups are retained.
pub const BACKUP_RETENTION: usize = 5;

type Mutator = Box<dyn FnOnce(&mut Database) + Send>;

struct WriteJob {
    mutate: Mutator,
    done: oneshot::Sender<Result<()>>,
}

/// Handle to the single-writer store.
///
/// Cheap to share behind an `Arc`; all mutation goes through
/// [`AtomicStore::submit_write`], all reading through
/// [`AtomicStore::snapshot`].
pub struct AtomicStore {
    tx: Mutex<Option<mpsc::UnboundedSender<WriteJob>>>,
    snapshot_rx: watch::Receiver<Arc<Database>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    path: PathBuf,
}

impl AtomicStore {
    /// Load (migrating if needed) and start the writer task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(path: PathBuf) -> Result<Self> {
        let db = load(&path)?;
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(db.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_path = path.clone();
        let writer = tokio::spawn(run_writer(writer_path, db, rx, snapshot_tx));
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            snapshot_rx,
            writer: Mutex::new(Some(writer)),
            path,
        })
    }

    /// The database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A read-only view of the current state. Never blocks the writer.
    pub fn snapshot(&self) -> Arc<Database> {
        self.snapshot_rx.borrow().clone()
    }

    /// Enqueue a mutation; resolves once it is durably on disk.
    ///
    /// Mutations execute strictly in submission order. A failed write leaves
    /// the in-memory document untouched and reports only to this caller.
    pub async fn submit_write<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Database) + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job = WriteJob {
            mutate: Box::new(mutate),
            done: done_tx,
        };
        {
            let tx = self.tx.lock().expect("store sender mutex");
            let tx = tx.as_ref().ok_or_else(|| anyhow!("store is closed"))?;
            tx.send(job).map_err(|_| anyhow!("store writer stopped"))?;
        }
        done_rx
            .await
            .context("store writer dropped the completion handle")?
    }

    /// Stop accepting writes, drain the queue, and join the writer.
    pub async fn close(&self) -> Result<()> {
        let sender = self.tx.lock().expect("store sender mutex").take();
        drop(sender);
        let handle = self.writer.lock().expect("store writer mutex").take();
        if let Some(handle) = handle {
            handle.await.context("store writer panicked")?;
        }
        Ok(())
    }
}

async fn run_writer(
    path: PathBuf,
    mut db: Database,
    mut rx: mpsc::UnboundedReceiver<WriteJob>,
    snapshot_tx: watch::Sender<Arc<Database>>,
) {
    while let Some(job) = rx.recv().await {
        let mut next = db.clone();
        (job.mutate)(&mut next);
        match persist(&path, &next) {
            Ok(()) => {
                db = next;
                let _ = snapshot_tx.send(Arc::new(db.clone()));
                let _ = job.done.send(Ok(()));
            }
            Err(err) => {
                tracing::warn!(error = %err, "store write failed; state rolled back");
                let _ = job.done.send(Err(err));
            }
        }
    }
    tracing::debug!("store writer stopped");
}

/// Load the document, creating an empty one when the file does not exist
/// and migrating older schema versions forward.
pub fn load(path: &Path) -> Result<Database> {
    if !path.exists() {
        return Ok(Database::empty());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read database {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse database JSON {}", path.display()))?;

    let version = value
        .get("schema_version")
        .and_then(|v| v.as_str())
        .unwrap_or("1.0")
        .to_string();
    validate_schema_version(&version)?;

    if version == SCHEMA_VERSION {
        return serde_json::from_value(value)
            .with_context(|| format!("failed to deserialize database {}", path.display()));
    }

    tracing::info!(from = %version, to = SCHEMA_VERSION, "migrating database schema");
    let backup = create_backup(path, Utc::now())?;
    prune_backups(path)?;

    match migrate(value, &version).and_then(|db| persist(path, &db).map(|()| db)) {
        Ok(db) => Ok(db),
        Err(err) => {
            // Put the pre-migration file back before surfacing the failure.
            if let Err(restore_err) = fs::copy(&backup, path) {
                tracing::error!(error = %restore_err, "failed to restore pre-migration backup");
            }
            Err(WatchError::MigrationFailed(format!("{err:#}")).into())
        }
    }
}

/// Validate a document schema version against the supported window.
pub fn validate_schema_version(version: &str) -> Result<()> {
    let (major, minor) = parse_schema_version(version)
        .with_context(|| format!("invalid schema version format: {version}"))?;
    let minimum = parse_schema_version(crate::types::MINIMUM_SUPPORTED_SCHEMA)
        .context("invalid minimum schema version")?;
    let current = parse_schema_version(SCHEMA_VERSION).context("invalid current schema version")?;

    if (major, minor) < minimum {
        anyhow::bail!(
            "schema version {} is too old. Minimum supported version is {}",
            version,
            crate::types::MINIMUM_SUPPORTED_SCHEMA
        );
    }
    if (major, minor) > current {
        anyhow::bail!(
            "schema version {} is newer than this build supports ({})",
            version,
            SCHEMA_VERSION
        );
    }
    Ok(())
}

/// Parse a `"major.minor"` schema version string.
fn parse_schema_version(version: &str) -> Result<(u32, u32)> {
    let (major, minor) = version
        .split_once('.')
        .with_context(|| format!("invalid schema version format: {version}"))?;
    Ok((
        major
            .parse()
            .with_context(|| format!("invalid major version in: {version}"))?,
        minor
            .parse()
            .with_context(|| format!("invalid minor version in: {version}"))?,
    ))
}

/// Migrate an older document to the current schema, value-by-value.
///
/// Migrations are append-only: each step fills in the fields its target
/// version introduced and must yield a fully valid document.
fn migrate(value: Value, from: &str) -> Result<Database> {
    let migrated = match from {
        "1.0" => migrate_v1_to_v2(value)?,
        other => anyhow::bail!("no migration path from schema version {other}"),
    };
    serde_json::from_value(migrated).context("migrated document failed validation")
}

/// v1 documents predate normalized URLs, breaker persistence, and forensic
/// snapshots; fill those in with defaults.
fn migrate_v1_to_v2(mut value: Value) -> Result<Value> {
    let root = value
        .as_object_mut()
        .context("database root is not an object")?;
    root.insert(
        "schema_version".to_string(),
        Value::String(SCHEMA_VERSION.to_string()),
    );

    for (chat_id, user) in root.iter_mut() {
        if chat_id == "schema_version" {
            continue;
        }
        let user = user
            .as_object_mut()
            .with_context(|| format!("user record {chat_id} is not an object"))?;
        user.entry("user_config").or_insert_with(|| {
            serde_json::to_value(crate::types::UserConfig::default()).unwrap_or(Value::Null)
        });
        let monitors = user
            .entry("monitors")
            .or_insert_with(|| Value::Array(Vec::new()));
        for monitor in monitors
            .as_array_mut()
            .with_context(|| format!("monitors of {chat_id} is not an array"))?
        {
            let monitor = monitor
                .as_object_mut()
                .with_context(|| format!("monitor of {chat_id} is not an object"))?;
            if !monitor.contains_key("normalized_url") {
                let normalized = monitor
                    .get("url")
                    .and_then(|u| u.as_str())
                    .map(|u| {
                        crate::request::normalize_url(u)
                            .unwrap_or_else(|_| u.to_string())
                    })
                    .unwrap_or_default();
                monitor.insert("normalized_url".to_string(), Value::String(normalized));
            }
            monitor
                .entry("forensic_snapshots")
                .or_insert_with(|| Value::Array(Vec::new()));
            monitor
                .entry("history")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Some(metadata) = monitor.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                metadata
                    .entry("circuit_breaker_state")
                    .or_insert_with(|| Value::String("closed".to_string()));
                metadata.entry("circuit_opened_at").or_insert(Value::Null);
                metadata.entry("paused").or_insert(Value::Bool(false));
            }
        }
    }
    Ok(value)
}

/// Serialize, normalise timestamps, and atomically replace the database file.
fn persist(path: &Path, db: &Database) -> Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create database dir {}", dir.display()))?;
    check_disk_space(dir)?;

    let mut value = serde_json::to_value(db).context("failed to serialize database")?;
    normalize_timestamps(&mut value, Utc::now());
    atomic_write_value(path, &value)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Boot-time variant of the disk guard: refuse to start at all when the
/// database directory is under the write threshold.
pub fn startup_disk_guard(db_path: &Path) -> Result<()> {
    check_disk_space(parent_dir(db_path))
}

/// Refuse to write when the target directory has under [`DISK_GUARD_BYTES`]
/// free. An unanswerable query passes the guard rather than wedging writes.
fn check_disk_space(dir: &Path) -> Result<()> {
    match fs2::available_space(dir) {
        Ok(free) if free < DISK_GUARD_BYTES => Err(WatchError::InsufficientStorage {
            available_mb: free / (1024 * 1024),
            required_mb: DISK_GUARD_BYTES / (1024 * 1024),
        }
        .into()),
        Ok(_) => Ok(()),
        Err(err) => {
            tracing::warn!(error = %err, dir = %dir.display(), "free-space query failed");
            Ok(())
        }
    }
}

fn atomic_write_value(path: &Path, value: &Value) -> Result<()> {
    let tmp = sibling(path, ".tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;

    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all()
            .with_context(|| format!("failed to sync tmp file {}", tmp.display()))?;
    }

    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to rename tmp file {} to {}",
            tmp.display(),
            path.display()
        )
    })?;

    fsync_parent_dir(path);
    Ok(())
}

/// Best-effort fsync of the parent directory after a rename, ensuring the
/// directory entry update is durable on crash. Errors are ignored because
/// not all platforms support opening a directory for sync.
fn fsync_parent_dir(path: &Path) {
    if let Ok(dir) = fs::File::open(parent_dir(path)) {
        let _ = dir.sync_all();
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn create_backup(path: &Path, now: DateTime<Utc>) -> Result<PathBuf> {
    let backup = sibling(path, &format!(".backup_{}", now.format("%Y%m%d_%H%M%S")));
    fs::copy(path, &backup)
        .with_context(|| format!("failed to back up database to {}", backup.display()))?;
    Ok(backup)
}

/// Drop the oldest pre-migration backups beyond [`BACKUP_RETENTION`]. The
/// timestamp suffix sorts lexicographically, so name order is age order.
fn prune_backups(path: &Path) -> Result<()> {
    let prefix = match sibling(path, ".backup_").file_name().map(|n| n.to_os_string()) {
        Some(p) => p.to_string_lossy().into_owned(),
        None => return Ok(()),
    };
    let mut backups: Vec<PathBuf> = fs::read_dir(parent_dir(path))
        .with_context(|| format!("failed to list {}", parent_dir(path).display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with(&prefix))
                .unwrap_or(false)
        })
        .collect();
    backups.sort();
    while backups.len() > BACKUP_RETENTION {
        let oldest = backups.remove(0);
        if let Err(err) = fs::remove_file(&oldest) {
            tracing::warn!(error = %err, path = %oldest.display(), "failed to prune backup");
        }
    }
    Ok(())
}

/// Recursively normalise every field whose key ends in `_at`, `_time`, or
/// equals `timestamp` to ISO-8601 UTC with a `Z` suffix. Values that fail
/// parsing are replaced with `now`; nulls stay null.
pub(crate) fn normalize_timestamps(value: &mut Value, now: DateTime<Utc>) {
    match value {
        Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                if is_timestamp_key(key) {
                    normalize_timestamp_field(key, field, now);
                } else {
                    normalize_timestamps(field, now);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                normalize_timestamps(item, now);
            }
        }
        _ => {}
    }
}

fn is_timestamp_key(key: &str) -> bool {
    key.ends_with("_at") || key.ends_with("_time") || key == "timestamp"
}

fn normalize_timestamp_field(key: &str, field: &mut Value, now: DateTime<Utc>) {
    if field.is_null() {
        return;
    }
    let normalized = field
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    match normalized {
        Some(dt) => *field = Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true)),
        None => {
            tracing::warn!(field = key, "unparseable timestamp replaced with current UTC");
            *field = Value::String(now.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::types::Monitor;

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().expect("timestamp")
    }

    #[test]
    fn load_returns_empty_database_when_file_missing() {
        let td = tempdir().expect("tempdir");
        let db = load(&td.path().join("watch.json")).expect("load");
        assert_eq!(db.schema_version, SCHEMA_VERSION);
        assert!(db.users.is_empty());
    }

    #[test]
    fn load_fails_on_invalid_json() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("watch.json");
        fs::write(&path, "{not-json").expect("write");
        let err = load(&path).expect_err("must fail");
        assert!(format!("{err:#}").contains("failed to parse database JSON"));
    }

    #[test]
    fn load_rejects_future_schema() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("watch.json");
        fs::write(&path, r#"{"schema_version": "9.0"}"#).expect("write");
        let err = load(&path).expect_err("must fail");
        assert!(format!("{err:#}").contains("newer than this build supports"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn submit_write_persists_and_updates_snapshot() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("watch.json");
        let store = AtomicStore::open(path.clone()).expect("open");

        store
            .submit_write(|db| {
                db.user_mut(11).monitors.push(Monitor::new(
                    "https://example.com/a".into(),
                    "https://example.com/a".into(),
                    Utc::now(),
                ));
            })
            .await
            .expect("write");

        assert_eq!(store.snapshot().monitor_count(), 1);

        // A fresh load sees the same document.
        let reloaded = load(&path).expect("reload");
        assert_eq!(reloaded.monitor_count(), 1);
        store.close().await.expect("close");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writes_apply_in_submission_order() {
        let td = tempdir().expect("tempdir");
        let store = Arc::new(AtomicStore::open(td.path().join("watch.json")).expect("open"));

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .submit_write(move |db| {
                        let user = db.user_mut(1);
                        user.monitors.push(Monitor::new(
                            format!("https://example.com/{i}"),
                            format!("https://example.com/{i}"),
                            Utc::now(),
                        ));
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("write");
        }

        let snapshot = store.snapshot();
        let urls: Vec<_> = snapshot.user(1).expect("user").monitors.iter().map(|m| m.url.clone()).collect();
        let expected: Vec<_> = (0..8).map(|i| format!("https://example.com/{i}")).collect();
        assert_eq!(urls, expected);
        store.close().await.expect("close");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_write_rolls_back_and_reports_to_submitter_only() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("watch.json");
        let store = AtomicStore::open(path.clone()).expect("open");
        store
            .submit_write(|db| {
                db.user_mut(1);
            })
            .await
            .expect("seed write");

        // Force `rename(tmp, db)` to fail by replacing the db with a directory.
        fs::remove_file(&path).expect("remove");
        fs::create_dir_all(&path).expect("conflicting dir");

        let err = store
            .submit_write(|db| {
                db.user_mut(2);
            })
            .await
            .expect_err("must fail");
        assert!(format!("{err:#}").contains("failed to rename tmp file"));

        // The failed mutation is not visible in memory.
        assert!(store.snapshot().user(2).is_none());
        assert!(store.snapshot().user(1).is_some());

        // Later writes succeed again once the obstruction is gone.
        fs::remove_dir(&path).expect("clear obstruction");
        store
            .submit_write(|db| {
                db.user_mut(3);
            })
            .await
            .expect("write after recovery");
        assert!(store.snapshot().user(3).is_some());
        store.close().await.expect("close");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stray_tmp_file_from_a_crash_is_ignored_on_reload() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("watch.json");
        let store = AtomicStore::open(path.clone()).expect("open");
        store
            .submit_write(|db| {
                db.user_mut(5);
            })
            .await
            .expect("write");
        store.close().await.expect("close");

        // Simulate a crash between the tmp fsync and the rename.
        fs::write(sibling(&path, ".tmp"), b"{\"half\": \"written").expect("stray tmp");

        let reloaded = load(&path).expect("reload");
        assert!(reloaded.user(5).is_some());
    }

    #[test]
    fn migrates_v1_document_and_creates_backup() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("watch.json");
        let v1 = serde_json::json!({
            "schema_version": "1.0",
            "42": {
                "monitors": [{
                    "url": "https://Example.com/page?utm_source=x",
                    "metadata": {
                        "created_at": "2026-01-01T00:00:00Z",
                        "last_check_at": null,
                        "check_count": 3,
                        "consecutive_failures": 0,
                        "snooze_until": null,
                        "last_status": "ok"
                    }
                }]
            }
        });
        fs::write(&path, serde_json::to_vec_pretty(&v1).expect("json")).expect("write");

        let db = load(&path).expect("load migrates");
        assert_eq!(db.schema_version, SCHEMA_VERSION);
        let monitor = &db.user(42).expect("user").monitors[0];
        assert_eq!(monitor.normalized_url, "https://example.com/page");
        assert!(monitor.forensic_snapshots.is_empty());

        let backups: Vec<_> = fs::read_dir(td.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".backup_"))
            .collect();
        assert_eq!(backups.len(), 1);

        // The rewritten file is already at the current schema.
        let reloaded = load(&path).expect("reload");
        assert_eq!(reloaded.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn failed_migration_restores_the_backup() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("watch.json");
        // monitors-as-string survives no migration.
        let original = r#"{"schema_version": "1.0", "42": {"monitors": "broken"}}"#;
        fs::write(&path, original).expect("write");

        let err = load(&path).expect_err("must fail");
        assert!(format!("{err:#}").contains("migration failed"));
        assert_eq!(fs::read_to_string(&path).expect("read"), original);
    }

    #[test]
    fn prune_keeps_only_newest_five_backups() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("watch.json");
        fs::write(&path, "{}").expect("db");
        for hour in 0..7 {
            let name = format!("watch.json.backup_20260101_0{hour}0000");
            fs::write(td.path().join(name), "{}").expect("backup");
        }

        prune_backups(&path).expect("prune");

        let mut backups: Vec<_> = fs::read_dir(td.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(".backup_"))
            .collect();
        backups.sort();
        assert_eq!(backups.len(), BACKUP_RETENTION);
        // The two oldest are gone.
        assert_eq!(backups[0], "watch.json.backup_20260101_020000");
    }

    #[test]
    fn normalize_rewrites_valid_timestamps_to_utc_z() {
        let mut value = serde_json::json!({
            "created_at": "2026-03-01T12:30:45+02:00",
            "nested": { "boot_time": "2026-03-01T00:00:00Z" },
        });
        normalize_timestamps(&mut value, t("2026-06-01T00:00:00Z"));
        assert_eq!(value["created_at"], "2026-03-01T10:30:45Z");
        assert_eq!(value["nested"]["boot_time"], "2026-03-01T00:00:00Z");
    }

    #[test]
    fn normalize_replaces_unparseable_timestamps_with_now() {
        let now = t("2026-06-01T00:00:00Z");
        let mut value = serde_json::json!({
            "last_check_at": "yesterday-ish",
            "timestamp": 12345,
        });
        normalize_timestamps(&mut value, now);
        assert_eq!(value["last_check_at"], "2026-06-01T00:00:00Z");
        assert_eq!(value["timestamp"], "2026-06-01T00:00:00Z");
    }

    #[test]
    fn normalize_leaves_nulls_and_plain_fields_alone() {
        let mut value = serde_json::json!({
            "snooze_until": null,
            "url": "https://example.com/2026-01-01",
            "items": [{"timestamp": "2026-01-02T03:04:05Z"}],
        });
        normalize_timestamps(&mut value, t("2026-06-01T00:00:00Z"));
        assert_eq!(value["snooze_until"], Value::Null);
        assert_eq!(value["url"], "https://example.com/2026-01-01");
        assert_eq!(value["items"][0]["timestamp"], "2026-01-02T03:04:05Z");
    }

    #[test]
    fn sibling_appends_suffix_to_file_name() {
        let path = Path::new("/data/watch.json");
        assert_eq!(sibling(path, ".tmp"), Path::new("/data/watch.json.tmp"));
        assert_eq!(
            sibling(path, ".backup_20260101_000000"),
            Path::new("/data/watch.json.backup_20260101_000000")
        );
    }
}
