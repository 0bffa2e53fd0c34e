//! 애플리케이션 상태 관리

use crate::allocator::RoomAllocator;
use crate::config::Config;
use crate::directory::UserDirectory;
use crate::store::UserStore;
use std::sync::Arc;
use std::time::Instant;

/// 전역 애플리케이션 상태
pub struct AppState {
    /// 접속자 (identity -> Session)
    pub directory: Arc<UserDirectory>,
    /// 방 목록과 배치
    pub allocator: Arc<RoomAllocator>,
    /// 외부 프로필 저장소
    pub user_store: Arc<dyn UserStore>,
    /// 설정
    pub config: Arc<Config>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config, user_store: Arc<dyn UserStore>) -> Self {
        let directory = Arc::new(UserDirectory::new());
        let allocator = RoomAllocator::new(
            config.allocator.clone(),
            config.room.clone(),
            directory.clone(),
        );
        Self {
            directory,
            allocator,
            user_store,
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}
