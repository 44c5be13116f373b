//! karchive persistence: the `ResourceWriter` capability and a SQLite-backed
//! archive that stores the raw payload of every archived object.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use karchive_core::ResourceView;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Destination for archived resources.
#[async_trait::async_trait]
pub trait ResourceWriter: Send + Sync {
    async fn write_resource(&self, resource: &ResourceView, raw: &[u8]) -> Result<()>;
}

/// One archived row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchivedResource {
    pub key: String,
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub resource_version: String,
    pub created_ts: String,
    pub updated_ts: String,
    pub data: String,
}

/// Row key: the object's uid, or `gvk/namespace/name` when it carries none.
pub fn archive_key(resource: &ResourceView) -> String {
    if resource.uid().is_empty() {
        format!("{}/{}/{}", resource.gvk(), resource.namespace(), resource.name())
    } else {
        resource.uid().to_string()
    }
}

/// SQLite-backed archive. Writes run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteStore {
    /// Open `path`, or `archive.db` under `$HOME/.karchive` when none is given.
    pub fn open_or_default(path: Option<&str>) -> Result<Self> {
        match path {
            Some(p) => Self::open(p),
            None => {
                let p = default_db_path(std::env::var_os("HOME").map(PathBuf::from));
                if let Some(dir) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
                }
                Self::open(&p.to_string_lossy())
            }
        }
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS resources (
                key              TEXT PRIMARY KEY,
                api_version      TEXT NOT NULL,
                kind             TEXT NOT NULL,
                name             TEXT NOT NULL,
                namespace        TEXT NOT NULL,
                resource_version TEXT NOT NULL,
                created_ts       TEXT NOT NULL,
                updated_ts       TEXT NOT NULL,
                data             TEXT NOT NULL
            )",
            [],
        )
        .context("creating resources table")?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_resources_kind_ns ON resources(kind, namespace, name)",
            [],
        )
        .ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Arc::new(Mutex::new(db)) })
    }

    fn upsert(&self, row: ArchivedResource) -> Result<()> {
        let db = self.db.lock().map_err(|_| anyhow!("archive db lock poisoned"))?;
        db.execute(
            "INSERT INTO resources(key, api_version, kind, name, namespace, resource_version, created_ts, updated_ts, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(key) DO UPDATE SET
                api_version = excluded.api_version,
                resource_version = excluded.resource_version,
                updated_ts = excluded.updated_ts,
                data = excluded.data",
            (
                &row.key,
                &row.api_version,
                &row.kind,
                &row.name,
                &row.namespace,
                &row.resource_version,
                &row.created_ts,
                &row.updated_ts,
                &row.data,
            ),
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<ArchivedResource>> {
        let db = self.db.lock().map_err(|_| anyhow!("archive db lock poisoned"))?;
        let mut stmt = db.prepare(
            "SELECT key, api_version, kind, name, namespace, resource_version, created_ts, updated_ts, data
             FROM resources WHERE key = ?1",
        )?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(ArchivedResource {
                key: row.get(0)?,
                api_version: row.get(1)?,
                kind: row.get(2)?,
                name: row.get(3)?,
                namespace: row.get(4)?,
                resource_version: row.get(5)?,
                created_ts: row.get(6)?,
                updated_ts: row.get(7)?,
                data: row.get(8)?,
            })),
            None => Ok(None),
        }
    }

    pub fn count(&self) -> Result<u64> {
        let db = self.db.lock().map_err(|_| anyhow!("archive db lock poisoned"))?;
        let n: i64 = db.query_row("SELECT COUNT(*) FROM resources", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

#[async_trait::async_trait]
impl ResourceWriter for SqliteStore {
    async fn write_resource(&self, resource: &ResourceView, raw: &[u8]) -> Result<()> {
        let started = std::time::Instant::now();
        let now = chrono::Utc::now().to_rfc3339();
        let id = resource.identity();
        let row = ArchivedResource {
            key: archive_key(resource),
            api_version: id.gvk.api_version(),
            kind: id.gvk.kind.clone(),
            name: id.name.clone(),
            namespace: id.namespace.clone(),
            resource_version: id.resource_version.clone(),
            created_ts: now.clone(),
            updated_ts: now,
            data: String::from_utf8_lossy(raw).to_string(),
        };
        let key = row.key.clone();
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.upsert(row))
            .await
            .context("archive write task failed")??;
        histogram!("persist_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_write_total", 1u64);
        debug!(key = %key, "resource archived");
        Ok(())
    }
}

fn default_db_path(home: Option<PathBuf>) -> PathBuf {
    match home {
        Some(home) => home.join(".karchive").join("archive.db"),
        None => PathBuf::from("archive.db"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(uid: &str, rv: &str) -> (ResourceView, Vec<u8>) {
        let raw = serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "j", "namespace": "ns", "uid": uid, "resourceVersion": rv}
        });
        let bytes = serde_json::to_vec(&raw).unwrap();
        (ResourceView::from_value(raw).unwrap(), bytes)
    }

    #[tokio::test]
    async fn write_then_update_keeps_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.db");
        let s = SqliteStore::open(path.to_str().unwrap()).unwrap();

        let (r1, raw1) = resource("u-1", "1");
        s.write_resource(&r1, &raw1).await.unwrap();
        let first = s.get("u-1").unwrap().expect("row");
        assert_eq!(first.api_version, "batch/v1");
        assert_eq!(first.kind, "Job");
        assert_eq!(first.namespace, "ns");
        assert_eq!(first.resource_version, "1");

        let (r2, raw2) = resource("u-1", "2");
        s.write_resource(&r2, &raw2).await.unwrap();
        let second = s.get("u-1").unwrap().expect("row");
        assert_eq!(second.resource_version, "2");
        assert_eq!(second.created_ts, first.created_ts);
        assert!(second.data.contains("\"resourceVersion\":\"2\""));
        assert_eq!(s.count().unwrap(), 1);
    }

    #[test]
    fn default_path_lives_under_home() {
        assert_eq!(default_db_path(Some(PathBuf::from("/home/a"))), PathBuf::from("/home/a/.karchive/archive.db"));
        assert_eq!(default_db_path(None), PathBuf::from("archive.db"));
    }

    #[test]
    fn explicit_path_is_used_as_given() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("given.db");
        let s = SqliteStore::open_or_default(path.to_str()).unwrap();
        assert_eq!(s.count().unwrap(), 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn missing_uid_falls_back_to_name_key() {
        let dir = tempfile::tempdir().unwrap();
        let s = SqliteStore::open(dir.path().join("a.db").to_str().unwrap()).unwrap();
        let (r, raw) = resource("", "1");
        assert_eq!(archive_key(&r), "batch/v1/Job/ns/j");
        s.write_resource(&r, &raw).await.unwrap();
        assert!(s.get("batch/v1/Job/ns/j").unwrap().is_some());
        assert!(s.get("nope").unwrap().is_none());
    }
}
