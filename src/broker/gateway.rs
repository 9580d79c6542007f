//! Per-connection gateway bookkeeping on the broker side.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a single connected gateway websocket for the lifetime of its
/// connection. Unlike [`super::client::ClientId`] this never goes out on the
/// wire; it only keys the broker's internal tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GatewayId(u64);

impl GatewayId {
    pub fn fresh() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for GatewayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gw-{}", self.0)
    }
}

/// The set of node uids a gateway has announced to the broker. Used to
/// decide which `out` notifications to broadcast when the gateway's
/// websocket closes.
#[derive(Default, Debug)]
pub struct OwnedNodes(HashSet<String>);

impl OwnedNodes {
    pub fn insert(&mut self, uid: impl Into<String>) {
        self.0.insert(uid.into());
    }

    pub fn remove(&mut self, uid: &str) {
        self.0.remove(uid);
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.0.contains(uid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }
}
