//! 접속한 참가자 세션과 연결 핸들

use crate::error::{ChatError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 쓰기/종료가 가능한 연결 핸들
pub struct Connection {
    identity: String,
    writer: Mutex<BoxedWriter>,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(identity: impl Into<String>, writer: BoxedWriter) -> Self {
        Self {
            identity: identity.into(),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }

    /// TCP 스트림을 읽기 절반과 연결 핸들로 분리
    pub fn from_tcp(stream: TcpStream) -> Result<(BoxedReader, Connection)> {
        let identity = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        Ok((Box::new(reader), Connection::new(identity, Box::new(writer))))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn send(&self, text: &str) -> Result<()> {
        if self.is_closed() {
            return Err(ChatError::ConnectionClosed(self.identity.clone()));
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(text.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// 한 번만 실제로 종료
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(identity = %self.identity, error = %e, "Shutdown after close failed");
        }
    }
}

/// 접속한 참가자 한 명
pub struct Session {
    identity: String,
    connection: Arc<Connection>,
    mailbox: UnboundedSender<String>,
    /// 0이면 아직 방이 없음
    room_id: AtomicU64,
    pub connected_at: Instant,
}

impl Session {
    /// 세션을 만들고 귓속말 전달 루프를 띄움
    pub fn new(connection: Connection) -> Arc<Self> {
        let connection = Arc::new(connection);
        let (mailbox, inbox) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_private(connection.clone(), inbox));

        Arc::new(Self {
            identity: connection.identity().to_string(),
            connection,
            mailbox,
            room_id: AtomicU64::new(0),
            connected_at: Instant::now(),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub async fn send(&self, text: &str) -> Result<()> {
        self.connection.send(text).await
    }

    /// 메일박스에 귓속말 적재 (도착 순서대로 전달됨)
    pub fn push_private(&self, payload: String) -> Result<()> {
        self.mailbox
            .send(payload)
            .map_err(|_| ChatError::ConnectionClosed(self.identity.clone()))
    }

    pub fn room_id(&self) -> Option<u64> {
        match self.room_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn set_room_id(&self, room_id: Option<u64>) {
        self.room_id.store(room_id.unwrap_or(0), Ordering::Release);
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }
}

/// 메일박스를 비우며 연결에 순서대로 기록
async fn dispatch_private(connection: Arc<Connection>, mut inbox: UnboundedReceiver<String>) {
    while let Some(payload) = inbox.recv().await {
        if let Err(e) = connection.send(&payload).await {
            // 발신자에게 알리지 않고 버림
            tracing::warn!(
                identity = %connection.identity(),
                error = %e,
                "Dropped private message"
            );
        }
    }
    tracing::debug!(identity = %connection.identity(), "Private dispatch loop finished");
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tokio::io::{DuplexStream, ReadHalf};

    /// 테스트용 세션: (세션, 클라이언트 쪽 스트림, 서버 쪽 읽기 절반)
    pub fn duplex_session(identity: &str) -> (Arc<Session>, DuplexStream, ReadHalf<DuplexStream>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server);
        let session = Session::new(Connection::new(identity, Box::new(writer)));
        (session, client, reader)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::duplex_session;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn private_messages_arrive_in_order() {
        let (session, client, _reader) = duplex_session("10.0.0.5:51000");
        for i in 0..5 {
            session.push_private(format!("msg {i}\n")).unwrap();
        }

        let mut lines = BufReader::new(client).lines();
        for i in 0..5 {
            assert_eq!(lines.next_line().await.unwrap().unwrap(), format!("msg {i}"));
        }
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let (session, _client, _reader) = duplex_session("10.0.0.5:51001");
        session.close().await;
        assert!(session.is_closed());
        assert!(session.send("late\n").await.is_err());
    }

    #[tokio::test]
    async fn room_id_roundtrip() {
        let (session, _client, _reader) = duplex_session("10.0.0.5:51002");
        assert_eq!(session.room_id(), None);
        session.set_room_id(Some(3));
        assert_eq!(session.room_id(), Some(3));
        session.set_room_id(None);
        assert_eq!(session.room_id(), None);
    }
}
