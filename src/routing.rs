// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routing Conventions
//!
//! Exchange names, routing keys and shared payload records used by the game
//! server and clients that sit on top of this crate.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Direct exchange carrying pause/resume broadcasts
pub const EXCHANGE_PERIL_DIRECT: &str = "peril_direct";
/// Topic exchange carrying per-player traffic
pub const EXCHANGE_PERIL_TOPIC: &str = "peril_topic";
/// Dead letter exchange referenced by every declared queue
pub const EXCHANGE_PERIL_DLX: &str = "peril_dlx";

pub const PAUSE_KEY: &str = "pause";
pub const ARMY_MOVES_PREFIX: &str = "army_moves";
pub const WAR_RECOGNITIONS_PREFIX: &str = "war";
pub const GAME_LOG_SLUG: &str = "game_logs";

/// Per-player routing key, e.g. `army_moves.alice`.
pub fn player_key(prefix: &str, username: &str) -> String {
    format!("{}.{}", prefix, username)
}

/// Binding pattern matching every player under `prefix`, e.g. `army_moves.*`.
pub fn wildcard(prefix: &str) -> String {
    format!("{}.*", prefix)
}

/// Pause/resume broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayingState {
    #[serde(rename = "isPaused")]
    pub is_paused: bool,
}

/// A game log entry, published with the binary codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameLog {
    pub current_time: SystemTime,
    pub message: String,
    pub username: String,
}
