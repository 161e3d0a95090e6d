//! Dialer registry: process-scoped table of live dialers by id.
//!
//! The pickup handler resolves the `dialer` query parameter here. The
//! registry is an explicit value passed to constructors, never a process
//! global, so independent instances (one per test, one per embedded server)
//! cannot observe each other.

use crate::dialer::Dialer;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Registry of live dialers indexed by their opaque id.
#[derive(Clone, Default)]
pub struct DialerRegistry {
    dialers: Arc<RwLock<HashMap<String, Dialer>>>,
}

impl DialerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a fresh id, build the dialer for it via `make`, and insert it,
    /// all under one write lock so the id cannot be taken in between.
    pub(crate) async fn register_with<F>(&self, make: F) -> Dialer
    where
        F: FnOnce(String) -> Dialer,
    {
        let mut dialers = self.dialers.write().await;
        let id = loop {
            let candidate = random_id();
            if !dialers.contains_key(&candidate) {
                break candidate;
            }
        };
        let dialer = make(id.clone());
        dialers.insert(id.clone(), dialer.clone());
        debug!(dialer = %id, "dialer registered");
        dialer
    }

    /// Resolve an id to its dialer, if still registered.
    pub async fn lookup(&self, id: &str) -> Option<Dialer> {
        self.dialers.read().await.get(id).cloned()
    }

    /// Drop the entry for `id`. Called during dialer teardown.
    pub(crate) async fn unregister(&self, id: &str) {
        if self.dialers.write().await.remove(id).is_some() {
            debug!(dialer = %id, "dialer unregistered");
        }
    }

    /// Ids of all currently registered dialers.
    pub async fn ids(&self) -> Vec<String> {
        self.dialers.read().await.keys().cloned().collect()
    }

    /// Number of registered dialers.
    pub async fn len(&self) -> usize {
        self.dialers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.dialers.read().await.is_empty()
    }
}

/// 16 hex chars of randomness. Collisions are re-drawn at registration.
fn random_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    hex::encode(bytes)
}
