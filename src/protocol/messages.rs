//! 텍스트 와이어 프로토콜: `opcode|field1|field2`

use crate::error::{ChatError, Result};

/// 레코드당 최대 필드 수
pub const MAX_FIELDS: usize = 3;

/// 레코드 한 줄의 최대 바이트 수 (줄바꿈 제외)
pub const MAX_RECORD_LEN: usize = 512;

/// 클라이언트 → 서버 명령
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    PrivateMessage { target: String, body: String },
    Broadcast { body: String },
    ListMembers,
    WhoAmI,
    Quit,
}

/// 명령 식별자
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    PrivateMessage = 0,
    Broadcast = 1,
    ListMembers = 2,
    WhoAmI = 3,
    Quit = 4,
}

impl TryFrom<u8> for Opcode {
    type Error = ChatError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Opcode::PrivateMessage),
            1 => Ok(Opcode::Broadcast),
            2 => Ok(Opcode::ListMembers),
            3 => Ok(Opcode::WhoAmI),
            4 => Ok(Opcode::Quit),
            other => Err(ChatError::Protocol(format!("unknown opcode {other}"))),
        }
    }
}

impl Command {
    /// 레코드 한 줄을 명령으로 해석
    pub fn parse(record: &str) -> Result<Self> {
        let record = record.trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = record.split('|').collect();
        if fields.len() > MAX_FIELDS {
            return Err(ChatError::Protocol(format!(
                "expected at most {MAX_FIELDS} fields, got {}",
                fields.len()
            )));
        }

        let raw = fields[0].trim();
        let code: u8 = raw
            .parse()
            .map_err(|_| ChatError::Protocol(format!("opcode '{raw}' is not a number")))?;

        match Opcode::try_from(code)? {
            Opcode::PrivateMessage => match fields.get(1).map(|t| t.trim()) {
                // 본문이 없으면 빈 메시지
                Some(target) if !target.is_empty() => Ok(Command::PrivateMessage {
                    target: target.to_string(),
                    body: fields.get(2).copied().unwrap_or_default().to_string(),
                }),
                _ => Err(ChatError::Protocol(
                    "private message needs a target".to_string(),
                )),
            },
            // 구분자 뒤 필드는 모두 본문으로 이어 붙임
            Opcode::Broadcast => Ok(Command::Broadcast {
                body: fields[1..].concat(),
            }),
            Opcode::ListMembers => Ok(Command::ListMembers),
            Opcode::WhoAmI => Ok(Command::WhoAmI),
            Opcode::Quit => Ok(Command::Quit),
        }
    }
}

/// 형식이 틀렸을 때 돌려주는 도움말
pub fn help_text() -> String {
    format!(
        "Supported commands: private message, broadcast, list members, who am i, quit.\n \
         e.g. private: {}|<identity>|<body>\n \
         e.g. broadcast: {}|<body>\n \
         e.g. list members: {}\n \
         e.g. who am i: {}\n \
         e.g. quit: {}\n\
         Please try again\n",
        Opcode::PrivateMessage as u8,
        Opcode::Broadcast as u8,
        Opcode::ListMembers as u8,
        Opcode::WhoAmI as u8,
        Opcode::Quit as u8,
    )
}

/// 서버 → 클라이언트 응답 문구
pub mod reply {
    pub fn greeting(identity: &str) -> String {
        format!("Hello, {identity}\n")
    }

    pub fn assigned(room_id: u64) -> String {
        format!("You have been assigned to room {room_id}\n")
    }

    pub fn who_am_i(identity: &str) -> String {
        format!("Your identity is: {identity}\n")
    }

    pub fn farewell(identity: &str) -> String {
        format!("Bye~ {identity}\n")
    }

    pub fn unknown_target(target: &str) -> String {
        format!("User {target} does not exist\n")
    }

    pub fn service_full() -> String {
        "The chat service is full, please try again later\n".to_string()
    }

    pub fn duplicate_identity(identity: &str) -> String {
        format!("{identity} is already connected\n")
    }

    pub fn members(identities: &[String]) -> String {
        let mut text = String::new();
        for identity in identities {
            text.push_str(identity);
            text.push('\n');
        }
        text
    }
}
