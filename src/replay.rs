//! 방별 최근 메시지 순환 버퍼

use crate::error::{ChatError, Result};

/// 고정 크기 순환 로그
///
/// 아직 가득 차지 않은 상태에서는 `cursor <= write` 범위만 읽을 수 있고,
/// 한 바퀴 돈 뒤에는 모든 슬롯이 유효하므로 커서가 감싸서 읽을 수 있다.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    slots: Vec<String>,
    write: usize,
    full: bool,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![String::new(); capacity],
            write: 0,
            full: false,
        }
    }

    #[allow(dead_code)]
    pub fn write_cursor(&self) -> usize {
        self.write
    }

    #[allow(dead_code)]
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// 가장 오래된 유효 메시지의 커서
    pub fn oldest_cursor(&self) -> usize {
        if self.full {
            self.write
        } else {
            0
        }
    }

    /// 쓰기 커서 위치를 덮어쓰고 커서를 전진
    pub fn append(&mut self, message: impl Into<String>) {
        let capacity = self.slots.len();
        if capacity == 0 {
            return;
        }
        self.slots[self.write] = message.into();
        self.write = (self.write + 1) % capacity;
        if self.write == 0 {
            self.full = true;
        }
    }

    /// `cursor`부터 쓰기 커서 직전까지의 메시지를 순서대로 반환
    ///
    /// 가득 찬 버퍼에서 `cursor == write`는 가장 오래된 슬롯을 뜻하므로
    /// 전체 창을 돌려준다.
    pub fn read_from(&self, cursor: usize) -> Result<Vec<String>> {
        let capacity = self.slots.len();
        if capacity == 0 {
            return Ok(Vec::new());
        }
        if cursor >= capacity {
            return Err(ChatError::InvariantViolation(format!(
                "replay cursor {cursor} outside capacity {capacity}"
            )));
        }

        if self.full && cursor >= self.write {
            let mut messages = self.slots[cursor..].to_vec();
            messages.extend_from_slice(&self.slots[..self.write]);
            return Ok(messages);
        }
        if cursor <= self.write {
            return Ok(self.slots[cursor..self.write].to_vec());
        }

        Err(ChatError::InvariantViolation(format!(
            "replay cursor {cursor} ahead of write cursor {} in a buffer that has not wrapped",
            self.write
        )))
    }

    /// 보관 중인 전체 기록
    pub fn history(&self) -> Result<Vec<String>> {
        self.read_from(self.oldest_cursor())
    }
}
