//! General helper functions for time, ids and URL/network plumbing.

pub mod net;

use chrono::Utc;

/// Current Unix time in seconds.
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Opaque hex id for sessions and tokens.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
