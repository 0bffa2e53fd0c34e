//! 방 할당기
//!
//! 입장은 두 단계로 처리한다.
//!
//! 1. 확률 샘플링: 임의의 방을 골라 `try_join`을 최대 `max_retries`번 시도
//! 2. 단일 실행 확인: 샘플링이 실패하면 티켓(크기 1 세마포어)을 잡은 호출자
//!    하나만 모든 방을 순서대로 훑고, 빈 자리가 없으면 방을 하나 만든다.
//!    티켓을 못 잡은 호출자는 대기 큐에 세션을 넘기고 바로 돌아간다.
//!
//! 티켓 보유자는 작업을 마치면 티켓을 놓고 대기 큐를 비우며 각 세션을 다시 배치한다.

use crate::config::{AllocatorConfig, RoomConfig};
use crate::directory::UserDirectory;
use crate::error::{ChatError, Result};
use crate::room::{Room, RoomSnapshot};
use crate::session::Session;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::mpsc::{self, Receiver};
use tokio::sync::{oneshot, Mutex, Semaphore};

/// `assign` 결과
pub enum Assignment {
    /// 바로 배치됨
    Placed(Arc<Room>),
    /// 확인 작업이 진행 중이라 대기 큐에 들어감. 배치되면 결과가 전달됨
    Queued(oneshot::Receiver<Result<Arc<Room>>>),
}

enum Placement {
    Sampled(Arc<Room>),
    /// 티켓을 잡고 전수 확인을 수행함
    Confirmed(Result<Arc<Room>>),
    /// 다른 호출자가 티켓을 보유 중
    Busy(Arc<Session>),
}

struct PendingJoin {
    session: Arc<Session>,
    reply: oneshot::Sender<Result<Arc<Room>>>,
}

struct WaitQueue {
    inbox: Receiver<PendingJoin>,
    /// 재배치 중 티켓이 점유되어 다음 비우기로 미룬 세션
    deferred: VecDeque<PendingJoin>,
}

/// 전체 방 목록과 배치 정책
pub struct RoomAllocator {
    config: AllocatorConfig,
    room_config: RoomConfig,
    directory: Arc<UserDirectory>,
    /// 추가/삭제는 쓰기 락으로 직렬화, 샘플링은 읽기 락으로 잠깐만 조회
    rooms: RwLock<Vec<Arc<Room>>>,
    next_room_id: AtomicU64,
    ticket: Arc<Semaphore>,
    waiting_tx: mpsc::Sender<PendingJoin>,
    waiting: Mutex<WaitQueue>,
    scans_in_flight: AtomicUsize,
    peak_scans: AtomicUsize,
}

impl RoomAllocator {
    pub fn new(
        config: AllocatorConfig,
        room_config: RoomConfig,
        directory: Arc<UserDirectory>,
    ) -> Arc<Self> {
        let (waiting_tx, inbox) = mpsc::channel(config.wait_queue_size.max(1));

        Arc::new(Self {
            config,
            room_config,
            directory,
            rooms: RwLock::new(Vec::new()),
            next_room_id: AtomicU64::new(1),
            ticket: Arc::new(Semaphore::new(1)),
            waiting_tx,
            waiting: Mutex::new(WaitQueue {
                inbox,
                deferred: VecDeque::new(),
            }),
            scans_in_flight: AtomicUsize::new(0),
            peak_scans: AtomicUsize::new(0),
        })
    }

    fn read_rooms(&self) -> RwLockReadGuard<'_, Vec<Arc<Room>>> {
        self.rooms.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_rooms(&self) -> RwLockWriteGuard<'_, Vec<Arc<Room>>> {
        self.rooms.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn room_count(&self) -> usize {
        self.read_rooms().len()
    }

    pub fn room(&self, room_id: u64) -> Option<Arc<Room>> {
        self.read_rooms().iter().find(|r| r.id() == room_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<RoomSnapshot> {
        self.read_rooms().iter().map(|r| r.snapshot()).collect()
    }

    /// 동시에 관측된 전수 확인 작업 수의 최댓값 (항상 1 이하여야 함)
    pub fn peak_concurrent_scans(&self) -> usize {
        self.peak_scans.load(Ordering::Acquire)
    }

    /// 세션을 방에 배치
    ///
    /// 방 개수가 이미 상한이면 바로 `AllocationExhausted`. 재시도하지 않는다.
    pub async fn assign(self: &Arc<Self>, session: Arc<Session>) -> Result<Assignment> {
        match self.place(session)? {
            Placement::Sampled(room) => Ok(Assignment::Placed(room)),
            Placement::Confirmed(result) => {
                self.spawn_drain();
                result.map(Assignment::Placed)
            }
            Placement::Busy(session) => {
                let identity = session.identity().to_string();
                let (reply, receiver) = oneshot::channel();
                // 큐가 가득 차면 여기서 대기 (유일한 배압 지점)
                self.waiting_tx
                    .send(PendingJoin { session, reply })
                    .await
                    .map_err(|_| ChatError::InvariantViolation("wait queue closed".to_string()))?;
                tracing::debug!(identity = %identity, "Session queued behind room confirmation");

                // 보유자가 이미 비우기를 끝냈다면 직접 비우기를 시작
                if self.ticket.available_permits() > 0 {
                    self.spawn_drain();
                }
                Ok(Assignment::Queued(receiver))
            }
        }
    }

    fn place(self: &Arc<Self>, session: Arc<Session>) -> Result<Placement> {
        let rooms = self.room_count();
        if rooms >= self.config.max_room_count {
            tracing::warn!(rooms, max = self.config.max_room_count, "Room allocation exhausted");
            return Err(ChatError::AllocationExhausted {
                rooms,
                max: self.config.max_room_count,
            });
        }

        if let Some(room) = self.sample(&session) {
            return Ok(Placement::Sampled(room));
        }

        let Ok(permit) = self.ticket.clone().try_acquire_owned() else {
            return Ok(Placement::Busy(session));
        };
        let result = self.confirm(&session);
        drop(permit);
        Ok(Placement::Confirmed(result))
    }

    /// 1단계: 임의의 방에 입장 시도
    fn sample(&self, session: &Arc<Session>) -> Option<Arc<Room>> {
        let mut rng = rand::thread_rng();
        for _ in 0..self.config.max_retries {
            let room = {
                let rooms = self.read_rooms();
                if rooms.is_empty() {
                    return None;
                }
                rooms[rng.gen_range(0..rooms.len())].clone()
            };
            // 샘플링 도중 삭제된 방은 try_join이 거절함
            if room.try_join(session) {
                tracing::info!(identity = %session.identity(), room_id = room.id(), "Assigned room by sampling");
                return Some(room);
            }
        }
        None
    }

    /// 2단계: 티켓 보유자만 호출
    fn confirm(self: &Arc<Self>, session: &Arc<Session>) -> Result<Arc<Room>> {
        let in_flight = self.scans_in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_scans.fetch_max(in_flight, Ordering::AcqRel);

        let result = self.exact_scan(session);

        self.scans_in_flight.fetch_sub(1, Ordering::AcqRel);
        result
    }

    fn exact_scan(self: &Arc<Self>, session: &Arc<Session>) -> Result<Arc<Room>> {
        let rooms: Vec<Arc<Room>> = self.read_rooms().clone();
        for room in rooms {
            if room.try_join(session) {
                tracing::info!(identity = %session.identity(), room_id = room.id(), "Assigned room by exact scan");
                return Ok(room);
            }
        }
        self.create_room(session)
    }

    /// 새 방을 만들고 첫 멤버를 넣은 뒤에 목록에 공개
    fn create_room(self: &Arc<Self>, first: &Arc<Session>) -> Result<Arc<Room>> {
        let mut rooms = self.write_rooms();
        if rooms.len() >= self.config.max_room_count {
            return Err(ChatError::AllocationExhausted {
                rooms: rooms.len(),
                max: self.config.max_room_count,
            });
        }

        let id = self.next_room_id.fetch_add(1, Ordering::AcqRel);
        let (room, empty) = Room::spawn(id, self.room_config.clone(), self.directory.clone());
        if !room.try_join(first) {
            return Err(ChatError::InvariantViolation(format!(
                "new room {id} rejected its first member (capacity {})",
                room.capacity()
            )));
        }
        rooms.push(room.clone());
        let total = rooms.len();
        drop(rooms);

        self.spawn_empty_watcher(room.clone(), empty);
        tracing::info!(room_id = id, identity = %first.identity(), total_rooms = total, "Room created");
        Ok(room)
    }

    pub fn remove_room(&self, room_id: u64) -> bool {
        let mut rooms = self.write_rooms();
        let before = rooms.len();
        rooms.retain(|r| r.id() != room_id);
        let removed = rooms.len() != before;
        if removed {
            tracing::info!(room_id, remaining_rooms = rooms.len(), "Room deleted");
        } else {
            tracing::warn!(room_id, "Room to delete does not exist");
        }
        removed
    }

    /// 방마다 하나. "비었음" 신호를 받으면 다시 확인하고 삭제
    fn spawn_empty_watcher(self: &Arc<Self>, room: Arc<Room>, mut empty: Receiver<()>) {
        let allocator: Weak<RoomAllocator> = Arc::downgrade(self);
        tokio::spawn(async move {
            while empty.recv().await.is_some() {
                if !room.mark_deleted() {
                    tracing::debug!(room_id = room.id(), "Room refilled before deletion");
                    continue;
                }
                if let Some(allocator) = allocator.upgrade() {
                    allocator.remove_room(room.id());
                }
                break;
            }
        });
    }

    fn spawn_drain(self: &Arc<Self>) {
        let allocator = self.clone();
        tokio::spawn(async move { allocator.drain_waiting().await });
    }

    /// 대기 큐를 한 묶음 꺼내 다시 배치
    async fn drain_waiting(self: &Arc<Self>) {
        let mut queue = self.waiting.lock().await;
        let mut batch: Vec<PendingJoin> = queue.deferred.drain(..).collect();
        while let Ok(pending) = queue.inbox.try_recv() {
            batch.push(pending);
        }
        if batch.is_empty() {
            return;
        }
        tracing::debug!(waiting = batch.len(), "Draining wait queue");

        let mut held_ticket = false;
        for PendingJoin { session, reply } in batch {
            let outcome = match self.place(session.clone()) {
                Ok(Placement::Sampled(room)) => Ok(room),
                Ok(Placement::Confirmed(result)) => {
                    held_ticket = true;
                    result
                }
                Ok(Placement::Busy(session)) => {
                    queue.deferred.push_back(PendingJoin { session, reply });
                    continue;
                }
                Err(e) => Err(e),
            };

            if let Err(Ok(room)) = reply.send(outcome) {
                // 기다리던 연결이 사라짐
                room.leave(session.identity());
            }
        }
        drop(queue);

        if held_ticket {
            self.spawn_drain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::duplex_session;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::time::timeout;

    fn allocator(max_room_count: usize, capacity: usize) -> Arc<RoomAllocator> {
        RoomAllocator::new(
            AllocatorConfig {
                max_room_count,
                max_retries: 100,
                wait_queue_size: 1024,
            },
            RoomConfig {
                capacity,
                replay_capacity: 8,
                replay_on_join: false,
                write_retry_attempts: 1,
                write_retry_delay: Duration::from_millis(1),
            },
            Arc::new(UserDirectory::new()),
        )
    }

    async fn resolve(assignment: Assignment) -> Result<Arc<Room>> {
        match assignment {
            Assignment::Placed(room) => Ok(room),
            Assignment::Queued(receiver) => timeout(Duration::from_secs(10), receiver)
                .await
                .expect("queued session never placed")
                .expect("reply dropped"),
        }
    }

    #[tokio::test]
    async fn third_session_opens_second_room() {
        let allocator = allocator(10, 2);
        let (a, _ca, _ra) = duplex_session("a:1");
        let (b, _cb, _rb) = duplex_session("b:1");
        let (c, _cc, _rc) = duplex_session("c:1");

        let room_a = resolve(allocator.assign(a).await.unwrap()).await.unwrap();
        let room_b = resolve(allocator.assign(b).await.unwrap()).await.unwrap();
        assert_eq!(room_a.id(), room_b.id());
        assert_eq!(allocator.room_count(), 1);

        let room_c = resolve(allocator.assign(c.clone()).await.unwrap()).await.unwrap();
        assert_ne!(room_c.id(), room_a.id());
        assert_eq!(allocator.room_count(), 2);
        assert_eq!(c.room_id(), Some(room_c.id()));
    }

    #[tokio::test]
    async fn room_ceiling_fails_fast() {
        let allocator = allocator(1, 1);
        let (a, _ca, _ra) = duplex_session("a:1");
        let (b, _cb, _rb) = duplex_session("b:1");

        resolve(allocator.assign(a).await.unwrap()).await.unwrap();
        let err = allocator.assign(b.clone()).await.err().unwrap();
        assert!(matches!(err, ChatError::AllocationExhausted { rooms: 1, max: 1 }));
        assert_eq!(b.room_id(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_assign_creates_exactly_needed_rooms() {
        const SESSIONS: usize = 60;
        const CAPACITY: usize = 7;

        let allocator = allocator(100, CAPACITY);
        let mut handles = Vec::new();
        let mut sessions = Vec::new();
        for i in 0..SESSIONS {
            let (session, client, reader) = duplex_session(&format!("10.0.0.2:{i}"));
            sessions.push((session.clone(), client, reader));
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                let assignment = allocator.assign(session).await.unwrap();
                resolve(assignment).await.unwrap().id()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let expected_rooms = SESSIONS.div_ceil(CAPACITY);
        assert_eq!(allocator.room_count(), expected_rooms);

        let mut seen = HashSet::new();
        let mut total = 0;
        for snapshot in allocator.snapshot() {
            let room = allocator.room(snapshot.id).unwrap();
            for identity in room.members() {
                assert!(seen.insert(identity), "session seated twice");
            }
            total += room.len();
        }
        assert_eq!(total, SESSIONS);
        for (session, _, _) in &sessions {
            assert!(session.room_id().is_some());
        }
        assert!(allocator.peak_concurrent_scans() <= 1);
    }

    #[tokio::test]
    async fn waiting_session_is_placed_after_ticket_release() {
        let allocator = allocator(10, 2);
        let permit = allocator.ticket.clone().try_acquire_owned().unwrap();

        let (a, _ca, _ra) = duplex_session("a:1");
        let receiver = match allocator.assign(a.clone()).await.unwrap() {
            Assignment::Queued(receiver) => receiver,
            Assignment::Placed(_) => panic!("no room exists, session should wait"),
        };
        assert_eq!(allocator.room_count(), 0);

        drop(permit);
        allocator.spawn_drain();

        let room = timeout(Duration::from_secs(5), receiver)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(a.room_id(), Some(room.id()));
        assert_eq!(allocator.room_count(), 1);
    }

    #[tokio::test]
    async fn abandoned_wait_releases_seat() {
        let allocator = allocator(10, 2);
        let permit = allocator.ticket.clone().try_acquire_owned().unwrap();

        let (a, _ca, _ra) = duplex_session("a:1");
        let assignment = allocator.assign(a.clone()).await.unwrap();
        drop(assignment);

        drop(permit);
        allocator.drain_waiting().await;

        assert_eq!(a.room_id(), None);
    }

    #[tokio::test]
    async fn quit_empties_room_and_allocator_removes_it() {
        let allocator = allocator(10, 3);
        let directory = allocator.directory.clone();
        let (a, client, reader) = duplex_session("a:1");
        directory.get_or_create("a:1", || a.clone());

        let room = resolve(allocator.assign(a.clone()).await.unwrap()).await.unwrap();
        assert_eq!(allocator.room_count(), 1);

        let (client_read, mut client_write) = tokio::io::split(client);
        let task = {
            let room = room.clone();
            tokio::spawn(async move { room.handle_connection(a, reader).await })
        };
        client_write.write_all(b"4\n").await.unwrap();

        let mut lines = BufReader::new(client_read).lines();
        loop {
            let line = timeout(Duration::from_secs(5), lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if line.starts_with("Bye~") {
                break;
            }
        }
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        timeout(Duration::from_secs(5), async {
            while allocator.room_count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("empty room was not removed");
        assert_eq!(directory.count(), 0);

        // 삭제된 방은 다시 받지 않음. 새 세션은 새 방으로
        let (b, _cb, _rb) = duplex_session("b:1");
        assert!(!room.try_join(&b));
        let fresh = resolve(allocator.assign(b).await.unwrap()).await.unwrap();
        assert_ne!(fresh.id(), room.id());
    }
}
