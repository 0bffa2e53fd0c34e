//! 용량 제한이 있는 채팅방

use crate::config::RoomConfig;
use crate::directory::UserDirectory;
use crate::error::{ChatError, Result};
use crate::protocol::{help_text, reply, Command, MAX_RECORD_LEN};
use crate::replay::ReplayBuffer;
use crate::session::Session;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender};

/// 방 수명 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    Active,
    /// 인원 0, 삭제 확인 대기
    Empty,
    /// 할당기에서 제거됨. 다시 Active로 돌아가지 않음
    Deleted,
}

struct Members {
    sessions: HashMap<String, Arc<Session>>,
    state: RoomState,
}

/// `/stats`용 방 요약
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub id: u64,
    pub members: usize,
    pub capacity: usize,
    pub state: RoomState,
}

/// 연결 루프 제어
enum Flow {
    Continue,
    Quit,
}

/// 채팅방
///
/// 멤버 맵과 상태는 하나의 `Mutex` 아래에서만 바뀐다. `TryJoin`/`Leave`/삭제
/// 확인이 모두 같은 락을 잡으므로 용량 검사와 삽입 사이에 끼어들 수 없다.
pub struct Room {
    id: u64,
    config: RoomConfig,
    members: Mutex<Members>,
    /// 멤버 맵과 별도로 유지하는 실시간 인원 수
    count: AtomicUsize,
    broadcast_tx: UnboundedSender<String>,
    empty_tx: Sender<()>,
    replay: Mutex<ReplayBuffer>,
    directory: Arc<UserDirectory>,
}

impl Room {
    /// 방을 만들고 팬아웃 워커를 띄움. 반환된 수신기로 "비었음" 신호를 받음
    pub fn spawn(
        id: u64,
        config: RoomConfig,
        directory: Arc<UserDirectory>,
    ) -> (Arc<Room>, Receiver<()>) {
        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
        // 대기 중인 신호는 최대 하나만 유지
        let (empty_tx, empty_rx) = mpsc::channel(1);

        let room = Arc::new(Room {
            id,
            replay: Mutex::new(ReplayBuffer::new(config.replay_capacity)),
            config,
            members: Mutex::new(Members {
                sessions: HashMap::new(),
                state: RoomState::Active,
            }),
            count: AtomicUsize::new(0),
            broadcast_tx,
            empty_tx,
            directory,
        });

        tokio::spawn(run_fanout(Arc::downgrade(&room), broadcast_rx));
        (room, empty_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn state(&self) -> RoomState {
        self.lock_members().state
    }

    fn lock_members(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_replay(&self) -> MutexGuard<'_, ReplayBuffer> {
        self.replay.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 자리가 있으면 원자적으로 입장
    pub fn try_join(&self, session: &Arc<Session>) -> bool {
        let mut members = self.lock_members();
        if members.state == RoomState::Deleted {
            return false;
        }
        if members.sessions.contains_key(session.identity()) {
            return true;
        }
        if self.count.load(Ordering::Acquire) >= self.config.capacity {
            return false;
        }

        members
            .sessions
            .insert(session.identity().to_string(), session.clone());
        self.count.fetch_add(1, Ordering::AcqRel);
        members.state = RoomState::Active;
        session.set_room_id(Some(self.id));
        true
    }

    /// 멤버 제거. 마지막 멤버였다면 "비었음" 신호를 보냄
    pub fn leave(&self, identity: &str) -> bool {
        let became_empty = {
            let mut members = self.lock_members();
            let Some(session) = members.sessions.remove(identity) else {
                return false;
            };
            session.set_room_id(None);
            let remaining = self.count.fetch_sub(1, Ordering::AcqRel) - 1;
            if remaining == 0 {
                members.state = RoomState::Empty;
            }
            remaining == 0
        };

        tracing::info!(room_id = self.id, identity = %identity, "User left room");

        if became_empty {
            // 이미 신호가 대기 중이면 하나로 충분
            let _ = self.empty_tx.try_send(());
        }
        true
    }

    /// 인원이 여전히 0이면 삭제 상태로 전환. 입장과 같은 락 아래에서 확인
    pub fn mark_deleted(&self) -> bool {
        let mut members = self.lock_members();
        if members.state == RoomState::Deleted || self.count.load(Ordering::Acquire) != 0 {
            return false;
        }
        members.state = RoomState::Deleted;
        true
    }

    pub fn members(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.lock_members().sessions.keys().cloned().collect();
        identities.sort();
        identities
    }

    fn member_sessions(&self) -> Vec<Arc<Session>> {
        self.lock_members().sessions.values().cloned().collect()
    }

    /// 기록 버퍼에 쓰고 팬아웃 큐에 넣음. 두 작업의 순서를 맞추기 위해 같은 락 아래에서 수행
    pub fn broadcast(&self, body: &str) -> Result<()> {
        let mut replay = self.lock_replay();
        replay.append(body);
        self.broadcast_tx
            .send(body.to_string())
            .map_err(|_| ChatError::InvariantViolation(format!("room {} fan-out worker stopped", self.id)))
    }

    pub fn history(&self) -> Result<Vec<String>> {
        self.lock_replay().history()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        let state = self.state();
        RoomSnapshot {
            id: self.id,
            members: self.len(),
            capacity: self.config.capacity,
            state,
        }
    }

    /// 연결별 읽기 루프. 종료 시 방과 디렉터리에서 빼고 연결을 닫음
    pub async fn handle_connection<R>(self: &Arc<Self>, session: Arc<Session>, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        if let Err(e) = self.welcome(&session).await {
            tracing::warn!(identity = %session.identity(), error = %e, "Failed to greet member");
        }

        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        // 너무 긴 레코드의 나머지를 다음 줄바꿈까지 버리는 중
        let mut skipping = false;
        loop {
            buf.clear();
            let read = (&mut reader)
                .take(MAX_RECORD_LEN as u64 + 1)
                .read_until(b'\n', &mut buf)
                .await;
            match read {
                Ok(0) => {
                    tracing::info!(identity = %session.identity(), "User went offline");
                    break;
                }
                Ok(_) => {
                    let complete = buf.last() == Some(&b'\n');
                    if skipping {
                        skipping = !complete;
                        continue;
                    }
                    if !complete && buf.len() > MAX_RECORD_LEN {
                        tracing::warn!(
                            identity = %session.identity(),
                            limit = MAX_RECORD_LEN,
                            "Record too long"
                        );
                        if let Err(e) = session.send(&help_text()).await {
                            tracing::warn!(identity = %session.identity(), error = %e, "Connection write failed");
                            break;
                        }
                        skipping = true;
                        continue;
                    }

                    let record = String::from_utf8_lossy(&buf);
                    match self.handle_record(&session, &record).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Quit) => break,
                        Err(e) if e.is_fatal() => {
                            tracing::error!(
                                room_id = self.id,
                                identity = %session.identity(),
                                error = %e,
                                "Aborting connection"
                            );
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(identity = %session.identity(), error = %e, "Connection write failed");
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(identity = %session.identity(), error = %e, "Read failed");
                    break;
                }
            }
        }

        self.terminate(&session).await;
    }

    async fn welcome(&self, session: &Session) -> Result<()> {
        session.send(&reply::assigned(self.id)).await?;
        if !self.config.replay_on_join {
            return Ok(());
        }

        match self.history() {
            Ok(history) if !history.is_empty() => {
                let mut text = String::new();
                for message in history {
                    text.push_str(&message);
                    text.push('\n');
                }
                session.send(&text).await
            }
            Ok(_) => Ok(()),
            Err(e) => {
                // 기록만 생략하고 연결은 유지
                tracing::error!(room_id = self.id, error = %e, "Replay read failed");
                Ok(())
            }
        }
    }

    async fn handle_record(&self, session: &Session, record: &str) -> Result<Flow> {
        let command = match Command::parse(record) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!(identity = %session.identity(), error = %e, "Malformed record");
                session.send(&help_text()).await?;
                return Ok(Flow::Continue);
            }
        };

        match command {
            Command::PrivateMessage { target, body } => {
                match self.directory.send_private(session.identity(), &target, &body) {
                    Ok(()) => {}
                    Err(ChatError::UnknownTarget(target)) => {
                        tracing::warn!(from = %session.identity(), to = %target, "Private message target not found");
                        session.send(&reply::unknown_target(&target)).await?;
                    }
                    Err(ChatError::ConnectionClosed(target)) => {
                        tracing::warn!(from = %session.identity(), to = %target, "Private message target closed");
                    }
                    Err(e) => return Err(e),
                }
            }
            Command::Broadcast { body } => {
                self.broadcast(&body)?;
                tracing::debug!(room_id = self.id, from = %session.identity(), "Queued broadcast");
            }
            Command::ListMembers => {
                session.send(&reply::members(&self.members())).await?;
            }
            Command::WhoAmI => {
                session.send(&reply::who_am_i(session.identity())).await?;
            }
            Command::Quit => {
                tracing::info!(identity = %session.identity(), "Quit requested");
                session.send(&reply::farewell(session.identity())).await?;
                return Ok(Flow::Quit);
            }
        }
        Ok(Flow::Continue)
    }

    async fn terminate(&self, session: &Session) {
        self.leave(session.identity());
        self.directory.remove(session.identity());
        session.close().await;
        tracing::info!(
            room_id = self.id,
            identity = %session.identity(),
            connected_secs = session.connected_at.elapsed().as_secs(),
            "Session ended"
        );
    }
}

/// 방 하나당 하나. 큐에서 꺼낸 메시지를 현재 멤버 모두에게 기록
async fn run_fanout(room: Weak<Room>, mut queue: UnboundedReceiver<String>) {
    while let Some(message) = queue.recv().await {
        let Some(room) = room.upgrade() else {
            break;
        };
        let line = format!("{message}\n");
        let attempts = room.config.write_retry_attempts.max(1);
        let delay = room.config.write_retry_delay;
        let members = room.member_sessions();

        let deliveries = members
            .iter()
            .map(|session| deliver_with_retry(session, &line, attempts, delay));
        futures::future::join_all(deliveries).await;
    }
}

async fn deliver_with_retry(session: &Session, line: &str, attempts: u32, delay: Duration) {
    for attempt in 1..=attempts {
        match session.send(line).await {
            Ok(()) => return,
            // 닫힌 연결은 자기 읽기 루프가 정리함
            Err(ChatError::ConnectionClosed(_)) => return,
            Err(e) => {
                tracing::debug!(identity = %session.identity(), attempt, error = %e, "Broadcast write failed");
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    tracing::warn!(identity = %session.identity(), attempts, "Giving up on broadcast delivery");
}
