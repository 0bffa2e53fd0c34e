//! 연결 핸들러

use crate::allocator::Assignment;
use crate::error::ChatError;
use crate::protocol::reply;
use crate::session::{BoxedReader, Connection, Session};
use crate::state::AppState;
use std::sync::Arc;
use tokio::net::TcpStream;

/// 새 TCP 연결 처리
pub async fn handle_tcp(state: Arc<AppState>, stream: TcpStream) {
    match Connection::from_tcp(stream) {
        Ok((reader, connection)) => handle_connection(state, connection, reader).await,
        Err(e) => tracing::warn!(error = %e, "Could not resolve peer address"),
    }
}

/// 세션 등록 → 방 배치 → 방의 읽기 루프 실행
pub async fn handle_connection(state: Arc<AppState>, connection: Connection, reader: BoxedReader) {
    let identity = connection.identity().to_string();

    if state.directory.get(&identity).is_some() {
        tracing::warn!(identity = %identity, "Rejected duplicate identity");
        let _ = connection.send(&reply::duplicate_identity(&identity)).await;
        connection.close().await;
        return;
    }

    let (session, created) = state
        .directory
        .get_or_create(&identity, move || Session::new(connection));
    if !created {
        tracing::warn!(identity = %identity, "Lost race for identity, dropping connection");
        return;
    }

    tracing::info!(identity = %identity, online = state.directory.count(), "New connection established");
    let _ = session.send(&reply::greeting(&identity)).await;
    record_visit(&state, &identity);

    let room = match state.allocator.assign(session.clone()).await {
        Ok(Assignment::Placed(room)) => Ok(room),
        Ok(Assignment::Queued(receiver)) => match receiver.await {
            Ok(result) => result,
            Err(_) => Err(ChatError::InvariantViolation(
                "allocator dropped a queued session".to_string(),
            )),
        },
        Err(e) => Err(e),
    };

    match room {
        Ok(room) => room.handle_connection(session, reader).await,
        Err(e) => reject(&state, &session, e).await,
    }
}

/// 배치 실패: 알리고 연결을 닫음
async fn reject(state: &AppState, session: &Session, error: ChatError) {
    match &error {
        ChatError::AllocationExhausted { .. } => {
            tracing::warn!(identity = %session.identity(), error = %error, "Service full");
            let _ = session.send(&reply::service_full()).await;
        }
        _ => {
            tracing::error!(identity = %session.identity(), error = %error, "Room assignment failed");
        }
    }
    handle_disconnect(state, session).await;
}

/// 연결 해제 처리
pub async fn handle_disconnect(state: &AppState, session: &Session) {
    if let Some(room_id) = session.room_id() {
        if let Some(room) = state.allocator.room(room_id) {
            room.leave(session.identity());
        }
    }
    state.directory.remove(session.identity());
    session.close().await;
    tracing::info!(identity = %session.identity(), "Connection closed");
}

fn record_visit(state: &AppState, identity: &str) {
    match state.user_store.touch(identity) {
        Ok(record) => {
            tracing::debug!(identity = %identity, visits = record.visits, "User record updated")
        }
        Err(e) => tracing::warn!(identity = %identity, error = %e, "User store update failed"),
    }
}
