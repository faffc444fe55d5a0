//! Per-domain registration records, one JSON file per domain
//!
//! `<configs_dir>/<domain>.json` holds the tunnel token, domain, local port
//! and the path of the generated ingress file. Callers take the per-domain
//! lock around any sequence that reads and then writes a record.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{ConsoleError, Result};
use crate::persist;

const RECORD_FILE_MODE: u32 = 0o600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRecord {
    /// Tunnel token passed to `cloudflared tunnel run --token`
    pub api_token: String,
    pub domain: String,
    pub local_port: String,
    pub yml_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<f64>,
}

pub struct DomainStore {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DomainStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: DashMap::new(),
        }
    }

    /// Serialize work on one domain (register, delete, run, stop)
    pub async fn lock(&self, domain: &str) -> OwnedMutexGuard<()> {
        // Only the map holds an idle lock; holders and waiters own a clone
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);

        let lock = self
            .locks
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Domain must already be validated; it is used as a file name
    pub fn record_path(&self, domain: &str) -> PathBuf {
        self.dir.join(format!("{}.json", domain))
    }

    pub fn get(&self, domain: &str) -> Result<Option<DomainRecord>> {
        let path = self.record_path(domain);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&content).map(Some).map_err(|e| {
            ConsoleError::Internal(format!("corrupt record for {}: {}", domain, e))
        })
    }

    pub fn save(&self, record: &DomainRecord) -> Result<()> {
        persist::write_json_atomic(
            &self.record_path(&record.domain),
            record,
            RECORD_FILE_MODE,
        )?;
        Ok(())
    }

    /// Returns whether a record existed
    pub fn remove(&self, domain: &str) -> Result<bool> {
        Ok(persist::remove_if_exists(&self.record_path(domain))?)
    }

    /// All readable records, sorted by domain. Unreadable files are skipped.
    pub fn list(&self) -> Vec<DomainRecord> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Cannot read {}: {}", self.dir.display(), e);
                return Vec::new();
            }
        };

        let mut records: Vec<DomainRecord> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                let parsed = std::fs::read_to_string(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|content| {
                        serde_json::from_str::<DomainRecord>(&content).map_err(|e| e.to_string())
                    });
                match parsed {
                    Ok(record) => Some(record),
                    Err(e) => {
                        tracing::debug!("Skipping {}: {}", path.display(), e);
                        None
                    }
                }
            })
            .collect();

        records.sort_by(|a, b| a.domain.cmp(&b.domain));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(domain: &str, token: &str) -> DomainRecord {
        DomainRecord {
            api_token: token.to_string(),
            domain: domain.to_string(),
            local_port: "8080".to_string(),
            yml_path: format!("/etc/burrow/yml/{}.yml", domain),
            tunnel_id: Some("c1744f8b-faa1-48a4-9e5c-02ac921467fa".to_string()),
            account_id: None,
            service: Some("http".to_string()),
            created: None,
        }
    }

    #[test]
    fn test_empty_store_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = DomainStore::new(dir.path());
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_save_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = DomainStore::new(dir.path());

        store.save(&record("app.example.com", "tok-1")).unwrap();
        let loaded = store.get("app.example.com").unwrap().unwrap();
        assert_eq!(loaded.api_token, "tok-1");

        assert!(store.remove("app.example.com").unwrap());
        assert!(store.get("app.example.com").unwrap().is_none());
        assert!(!store.remove("app.example.com").unwrap());
    }

    #[test]
    fn test_save_overwrites_same_domain() {
        let dir = tempfile::tempdir().unwrap();
        let store = DomainStore::new(dir.path());

        store.save(&record("app.example.com", "tok-1")).unwrap();
        store.save(&record("app.example.com", "tok-2")).unwrap();

        let records = store.list();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].api_token, "tok-2");
    }

    #[test]
    fn test_list_skips_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DomainStore::new(dir.path());

        store.save(&record("b.example.com", "tok-b")).unwrap();
        store.save(&record("a.example.com", "tok-a")).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("other.json"), r#"{"unrelated": true}"#).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let domains: Vec<String> = store.list().into_iter().map(|r| r.domain).collect();
        assert_eq!(domains, vec!["a.example.com", "b.example.com"]);
    }

    #[test]
    fn test_reads_records_without_supplemental_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = DomainStore::new(dir.path());
        std::fs::write(
            store.record_path("legacy.example.com"),
            r#"{"api_token":"tok","domain":"legacy.example.com","local_port":"3000","yml_path":"/etc/cf_pro/yml/legacy.example.com.yml"}"#,
        )
        .unwrap();

        let loaded = store.get("legacy.example.com").unwrap().unwrap();
        assert_eq!(loaded.local_port, "3000");
        assert!(loaded.tunnel_id.is_none());
    }

    #[tokio::test]
    async fn test_lock_serializes_same_domain() {
        let dir = tempfile::tempdir().unwrap();
        let store = DomainStore::new(dir.path());

        let guard = store.lock("app.example.com").await;
        // A different domain is independent
        let _other = store.lock("other.example.com").await;

        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            store.lock("app.example.com"),
        )
        .await;
        assert!(pending.is_err());

        drop(guard);
        let _again = store.lock("app.example.com").await;
    }

    #[tokio::test]
    async fn test_idle_locks_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = DomainStore::new(dir.path());

        for n in 0..10 {
            let _guard = store.lock(&format!("d{}.example.com", n)).await;
        }
        let held = store.lock("held.example.com").await;
        assert_eq!(store.locks.len(), 1);

        let _other = store.lock("other.example.com").await;
        assert_eq!(store.locks.len(), 2);
        assert!(store.locks.contains_key("held.example.com"));
        drop(held);
    }
}
