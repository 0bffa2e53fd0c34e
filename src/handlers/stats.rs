//! 상태 조회 핸들러

use crate::room::RoomSnapshot;
use crate::state::AppState;
use axum::{
    extract::State,
    response::{Html, Json},
};
use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// `/stats` 응답
#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub online_users: usize,
    /// 접속했지만 아직 방이 없는 세션 수
    pub waiting_users: usize,
    pub room_count: usize,
    pub max_room_count: usize,
    pub peak_concurrent_scans: usize,
    pub uptime_secs: u64,
    pub rooms: Vec<RoomSnapshot>,
}

pub fn collect_stats(state: &AppState) -> StatsReport {
    let rooms = state.allocator.snapshot();
    let mut waiting_users = 0;
    state.directory.for_each(|_, session| {
        if session.room_id().is_none() && !session.is_closed() {
            waiting_users += 1;
        }
    });
    StatsReport {
        online_users: state.directory.count(),
        waiting_users,
        room_count: rooms.len(),
        max_room_count: state.config.allocator.max_room_count,
        peak_concurrent_scans: state.allocator.peak_concurrent_scans(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        rooms,
    }
}

pub async fn index_handler() -> Html<&'static str> {
    Html("<h1>Chatroom Server</h1><p>Stats endpoint: /stats</p>")
}

pub async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "server": "chatroom-rs",
        "timestamp": SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }))
}

pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<StatsReport> {
    Json(collect_stats(&state))
}

/// 주기적으로 방 할당 현황을 로그로 남김
pub fn log_allocation(state: &AppState) {
    let report = collect_stats(state);
    tracing::info!(
        rooms = report.room_count,
        online_users = report.online_users,
        waiting_users = report.waiting_users,
        "Current room allocation"
    );
    for room in &report.rooms {
        tracing::debug!(
            room_id = room.id,
            members = room.members,
            capacity = room.capacity,
            state = ?room.state,
            "Room occupancy"
        );
    }
}
