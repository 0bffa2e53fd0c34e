//! 접속자 디렉터리 (identity -> Session)

use crate::error::{ChatError, Result};
use crate::session::Session;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// 동시성 안전한 접속자 맵
///
/// `DashMap`의 `len()`은 모든 샤드를 훑기 때문에 삽입/삭제와 함께
/// 별도 카운터를 유지한다. 실제로 삽입/삭제된 경우에만 카운터가 움직인다.
#[derive(Default)]
pub struct UserDirectory {
    sessions: DashMap<String, Arc<Session>>,
    count: AtomicUsize,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 없으면 `factory`로 만들어 삽입. 두 번째 값은 새로 만들었는지 여부
    pub fn get_or_create<F>(&self, identity: &str, factory: F) -> (Arc<Session>, bool)
    where
        F: FnOnce() -> Arc<Session>,
    {
        match self.sessions.entry(identity.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let session = factory();
                entry.insert(session.clone());
                self.count.fetch_add(1, Ordering::AcqRel);
                (session, true)
            }
        }
    }

    pub fn get(&self, identity: &str) -> Option<Arc<Session>> {
        self.sessions.get(identity).map(|s| s.value().clone())
    }

    pub fn remove(&self, identity: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(identity)?;
        self.count.fetch_sub(1, Ordering::AcqRel);
        Some(session)
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&str, &Arc<Session>),
    {
        for entry in self.sessions.iter() {
            visitor(entry.key(), entry.value());
        }
    }

    /// 대상 세션의 메일박스로 귓속말 적재
    pub fn send_private(&self, from: &str, target: &str, body: &str) -> Result<()> {
        let session = self
            .get(target)
            .ok_or_else(|| ChatError::UnknownTarget(target.to_string()))?;
        session.push_private(format!("[{from}] {body}\n"))?;
        tracing::debug!(from = %from, to = %target, "Queued private message");
        Ok(())
    }
}
