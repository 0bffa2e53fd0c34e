//! 핸들러 모듈

pub mod connection;
pub mod stats;

pub use connection::*;
pub use stats::*;
