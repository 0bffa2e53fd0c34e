//! 에러 타입 정의

use thiserror::Error;

/// 채팅 서버 에러
#[derive(Debug, Error)]
pub enum ChatError {
    /// 잘못된 형식의 레코드. 도움말로 응답하고 연결은 유지
    #[error("protocol error: {0}")]
    Protocol(String),

    /// 귓속말 대상이 디렉터리에 없음
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    /// 시스템 전체 방 개수 상한 도달
    #[error("allocation exhausted: {rooms} rooms allocated (max {max})")]
    AllocationExhausted { rooms: usize, max: usize },

    /// 내부 불변식 위반 (프로그래머 오류)
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("user store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ChatError {
    /// 해당 작업을 중단해야 하는 에러인지 여부
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChatError::InvariantViolation(_))
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
