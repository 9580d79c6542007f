//! Web-dashboard client bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies a single connected web client for the lifetime of its
/// websocket. Stamped into outgoing client -> gateway messages as `src` and
/// used as the `dst` selector when a gateway replies only to this client.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    pub fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Monotonically increasing sequence number, used only for log correlation.
pub fn next_seq() -> u64 {
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed)
}
