// src/config.rs

use dotenvy::dotenv;
use std::env;

/// Synthetic history entries pushed at session start so a back/forward
/// gesture is absorbed without actually leaving the exam route.
pub const HISTORY_BUFFER_DEPTH: usize = 20;

/// Ticks shown before a fresh (non-resumed) session becomes answerable.
pub const COUNTDOWN_TICKS: u32 = 3;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub rust_log: String,
    pub bind_addr: String,

    /// Length of the penalty window issued per violation, in seconds.
    pub block_duration_seconds: i64,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");

        let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let block_duration_seconds = env::var("BLOCK_DURATION_SECONDS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(120);

        Self {
            database_url,
            rust_log,
            bind_addr,
            block_duration_seconds,
        }
    }
}
