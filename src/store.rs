//! 사용자 프로필 저장소
//!
//! 방 할당/메시징의 정확성과는 무관하다. 실패해도 로그만 남긴다.

use crate::error::{ChatError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// identity 기준 프로필 레코드
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub identity: String,
    pub ip: String,
    pub port: String,
    pub first_seen: u64,
    pub last_seen: u64,
    pub visits: u64,
}

impl UserRecord {
    pub fn new(identity: &str, now: u64) -> Self {
        let (ip, port) = identity.rsplit_once(':').unwrap_or((identity, ""));
        Self {
            identity: identity.to_string(),
            ip: ip.to_string(),
            port: port.to_string(),
            first_seen: now,
            last_seen: now,
            visits: 0,
        }
    }
}

pub trait UserStore: Send + Sync {
    fn load(&self, identity: &str) -> Result<Option<UserRecord>>;
    fn save(&self, record: &UserRecord) -> Result<()>;

    /// 방문 기록 갱신 (없으면 새로 생성)
    fn touch(&self, identity: &str) -> Result<UserRecord> {
        let now = unix_now();
        let mut record = self
            .load(identity)?
            .unwrap_or_else(|| UserRecord::new(identity, now));
        record.last_seen = now;
        record.visits += 1;
        self.save(&record)?;
        Ok(record)
    }
}

/// 메모리 저장소
#[derive(Default)]
pub struct MemoryUserStore {
    records: DashMap<String, UserRecord>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserStore for MemoryUserStore {
    fn load(&self, identity: &str) -> Result<Option<UserRecord>> {
        Ok(self.records.get(identity).map(|r| r.value().clone()))
    }

    fn save(&self, record: &UserRecord) -> Result<()> {
        self.records.insert(record.identity.clone(), record.clone());
        Ok(())
    }
}

/// JSON 파일 저장소. 저장할 때마다 파일 전체를 다시 씀
pub struct JsonFileUserStore {
    path: PathBuf,
    records: Mutex<HashMap<String, UserRecord>>,
}

impl JsonFileUserStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => HashMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::info!(path = %path.display(), users = records.len(), "User store opened");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }
}

impl UserStore for JsonFileUserStore {
    fn load(&self, identity: &str) -> Result<Option<UserRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| ChatError::Store("user store lock poisoned".to_string()))?;
        Ok(records.get(identity).cloned())
    }

    fn save(&self, record: &UserRecord) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| ChatError::Store("user store lock poisoned".to_string()))?;
        records.insert(record.identity.clone(), record.clone());
        let json = serde_json::to_vec_pretty(&*records)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_counts_visits() {
        let store = MemoryUserStore::new();
        let first = store.touch("10.0.0.5:51000").unwrap();
        assert_eq!(first.visits, 1);
        assert_eq!(first.ip, "10.0.0.5");
        assert_eq!(first.port, "51000");

        let second = store.touch("10.0.0.5:51000").unwrap();
        assert_eq!(second.visits, 2);
        assert_eq!(second.first_seen, first.first_seen);
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");

        {
            let store = JsonFileUserStore::open(&path).unwrap();
            store.touch("a:1").unwrap();
            store.touch("a:1").unwrap();
            store.touch("b:2").unwrap();
        }

        let store = JsonFileUserStore::open(&path).unwrap();
        assert_eq!(store.load("a:1").unwrap().unwrap().visits, 2);
        assert_eq!(store.load("b:2").unwrap().unwrap().visits, 1);
        assert!(store.load("c:3").unwrap().is_none());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            JsonFileUserStore::open(&path),
            Err(ChatError::Json(_))
        ));
    }
}
