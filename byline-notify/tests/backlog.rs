//! Backlog behavior that must hold for both store backends.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use byline_notify::db::SqliteBacklog;
use byline_notify::offline::{BacklogStore, MemoryBacklog, OfflineStore, StoreError};
use byline_notify::stats::HubStats;
use byline_notify::types::UserId;
use byline_notify::Envelope;

fn backends() -> Vec<(&'static str, Arc<dyn BacklogStore>)> {
    vec![
        ("memory", Arc::new(MemoryBacklog::new())),
        (
            "sqlite",
            Arc::new(SqliteBacklog::open_memory().expect("open sqlite")),
        ),
    ]
}

fn offline_store(
    backend: Arc<dyn BacklogStore>,
    cap: usize,
    ttl: Duration,
) -> (OfflineStore, Arc<HubStats>) {
    let stats = Arc::new(HubStats::default());
    (OfflineStore::new(backend, cap, ttl, stats.clone()), stats)
}

fn envelope(n: u64) -> Envelope {
    Envelope::notification(json!({"n": n}), Some(format!("m{n}")))
}

#[test]
fn reads_come_back_newest_first() {
    for (name, backend) in backends() {
        backend.append("k", "v1").unwrap();
        backend.append("k", "v2").unwrap();
        backend.append("k", "v3").unwrap();
        let all = backend.read_all("k").unwrap();
        assert_eq!(all, vec!["v3", "v2", "v1"], "backend {name}");
    }
}

#[test]
fn trim_keeps_only_the_newest() {
    for (name, backend) in backends() {
        for n in 1..=5 {
            backend.append("k", &format!("v{n}")).unwrap();
        }
        backend.trim_to_length("k", 2).unwrap();
        let all = backend.read_all("k").unwrap();
        assert_eq!(all, vec!["v5", "v4"], "backend {name}");
    }
}

#[test]
fn keys_do_not_bleed_into_each_other() {
    for (name, backend) in backends() {
        backend.append("a", "for-a").unwrap();
        backend.append("b", "for-b").unwrap();
        backend.delete("a").unwrap();
        assert!(backend.read_all("a").unwrap().is_empty(), "backend {name}");
        assert_eq!(backend.read_all("b").unwrap(), vec!["for-b"], "backend {name}");
    }
}

#[test]
fn the_store_caps_each_user_at_the_limit() {
    for (name, backend) in backends() {
        let (store, _stats) = offline_store(backend.clone(), 100, Duration::from_secs(3600));
        for n in 1..=150 {
            store.store(UserId(1), &envelope(n));
        }
        let all = backend.read_all(&OfflineStore::key(UserId(1))).unwrap();
        assert_eq!(all.len(), 100, "backend {name}");
        assert!(all[0].contains("\"m150\""), "backend {name}");
        assert!(all[99].contains("\"m51\""), "backend {name}");
    }
}

#[test]
fn entries_expire_after_the_ttl() {
    for (name, backend) in backends() {
        let (store, _stats) = offline_store(backend.clone(), 100, Duration::from_millis(50));
        store.store(UserId(1), &envelope(1));
        std::thread::sleep(Duration::from_millis(120));
        let all = backend.read_all(&OfflineStore::key(UserId(1))).unwrap();
        assert!(all.is_empty(), "backend {name} kept {} entries", all.len());
    }
}

#[test]
fn later_stores_keep_earlier_entries() {
    for (name, backend) in backends() {
        let (store, _stats) = offline_store(backend.clone(), 100, Duration::from_secs(3600));
        store.store(UserId(1), &envelope(1));
        std::thread::sleep(Duration::from_millis(20));
        store.store(UserId(1), &envelope(2));
        let all = backend.read_all(&OfflineStore::key(UserId(1))).unwrap();
        assert_eq!(all.len(), 2, "backend {name}");
    }
}

#[test]
fn sqlite_backlog_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backlog.db");
    {
        let store = SqliteBacklog::open(&path).unwrap();
        store.append("k", "persisted").unwrap();
        store.expire("k", Duration::from_secs(3600)).unwrap();
    }
    let store = SqliteBacklog::open(&path).unwrap();
    assert_eq!(store.read_all("k").unwrap(), vec!["persisted"]);
}

struct DeadStore;

impl BacklogStore for DeadStore {
    fn append(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("dead".into()))
    }
    fn trim_to_length(&self, _key: &str, _n: usize) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("dead".into()))
    }
    fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("dead".into()))
    }
    fn read_all(&self, _key: &str) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unavailable("dead".into()))
    }
    fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("dead".into()))
    }
}

#[test]
fn a_dead_backend_does_not_poison_the_send_path() {
    let (store, stats) = offline_store(Arc::new(DeadStore), 100, Duration::from_secs(3600));
    store.store(UserId(1), &envelope(1));
    store.store(UserId(1), &envelope(2));
    assert_eq!(stats.snapshot(0).messages_sent, 0);
}
