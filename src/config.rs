//! 환경 변수 기반 설정 관리

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// 서버 설정
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// 0이면 HTTP 상태 서버를 띄우지 않음
    pub http_port: u16,
    pub room: RoomConfig,
    pub allocator: AllocatorConfig,
    pub stats_interval_secs: u64,
    pub user_store_path: Option<String>,
    pub log_level: String,
}

/// 방 설정
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub capacity: usize,
    pub replay_capacity: usize,
    pub replay_on_join: bool,
    pub write_retry_attempts: u32,
    pub write_retry_delay: Duration,
}

/// 방 할당기 설정
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub max_room_count: usize,
    pub max_retries: usize,
    pub wait_queue_size: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            replay_capacity: 64,
            replay_on_join: true,
            write_retry_attempts: 10,
            write_retry_delay: Duration::from_millis(1000),
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_room_count: 100,
            max_retries: 100,
            wait_queue_size: 10000,
        }
    }
}

impl Config {
    /// 환경 변수에서 설정 로드
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let room_defaults = RoomConfig::default();
        let allocator_defaults = AllocatorConfig::default();

        Self {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_var("PORT", 4096),
            http_port: parse_var("HTTP_PORT", 4097),
            room: RoomConfig {
                // 0이면 아무도 방에 들어갈 수 없음
                capacity: parse_var("ROOM_CAPACITY", room_defaults.capacity).max(1),
                replay_capacity: parse_var("REPLAY_CAPACITY", room_defaults.replay_capacity),
                replay_on_join: env::var("REPLAY_ON_JOIN")
                    .map(|v| v != "false")
                    .unwrap_or(room_defaults.replay_on_join),
                write_retry_attempts: parse_var(
                    "WRITE_RETRY_ATTEMPTS",
                    room_defaults.write_retry_attempts,
                ),
                write_retry_delay: Duration::from_millis(parse_var(
                    "WRITE_RETRY_DELAY_MS",
                    room_defaults.write_retry_delay.as_millis() as u64,
                )),
            },
            allocator: AllocatorConfig {
                max_room_count: parse_var("MAX_ROOM_COUNT", allocator_defaults.max_room_count),
                max_retries: parse_var("MAX_RETRIES", allocator_defaults.max_retries),
                wait_queue_size: parse_var("WAIT_QUEUE_SIZE", allocator_defaults.wait_queue_size),
            },
            stats_interval_secs: parse_var("STATS_INTERVAL_SECS", 60),
            user_store_path: env::var("USER_STORE_PATH")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

/// 값이 없거나 파싱에 실패하면 기본값 사용
fn parse_var<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
