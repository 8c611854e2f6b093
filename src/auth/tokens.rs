//! In-memory session token store.
//!
//! Tokens are opaque 256-bit random values handed out at login and resolved
//! on every request. The mapping lives only in process memory, so a restart
//! logs everyone out. A background sweeper evicts expired entries to bound
//! memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;

/// Why a token failed to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    /// The token existed but its lifetime ran out.
    Expired,
    /// Never issued, or already revoked.
    Unknown,
}

#[derive(Debug, Clone)]
struct TokenEntry {
    username: String,
    expires_at: DateTime<Utc>,
}

/// Token store with absolute expiry.
#[derive(Debug)]
pub struct TokenStore {
    ttl: chrono::Duration,
    entries: Mutex<HashMap<String, TokenEntry>>,
}

impl TokenStore {
    /// Create a store whose tokens live for `ttl_hours`.
    pub fn new(ttl_hours: u64) -> Self {
        Self {
            ttl: chrono::Duration::hours(ttl_hours as i64),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a fresh token for `username`.
    pub fn mint(&self, username: &str) -> String {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);

        let mut entries = self.entries.lock().expect("token store lock poisoned");
        entries.insert(
            token.clone(),
            TokenEntry {
                username: username.to_string(),
                expires_at: Utc::now() + self.ttl,
            },
        );
        log::info!("session token created for user '{}'", username);
        token
    }

    /// Resolve a token to its username. Expired tokens are removed on
    /// the way out.
    pub fn resolve(&self, token: &str) -> Result<String, TokenError> {
        let mut entries = self.entries.lock().expect("token store lock poisoned");
        let Some(entry) = entries.get(token) else {
            return Err(TokenError::Unknown);
        };
        if entry.expires_at <= Utc::now() {
            entries.remove(token);
            return Err(TokenError::Expired);
        }
        Ok(entry.username.clone())
    }

    /// Drop a token (logout). Unknown tokens are ignored.
    pub fn revoke(&self, token: &str) {
        self.entries
            .lock()
            .expect("token store lock poisoned")
            .remove(token);
    }

    /// Remove all expired tokens; returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.lock().expect("token store lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Token lifetime in seconds, for cookie max-age.
    pub fn ttl_secs(&self) -> i64 {
        self.ttl.num_seconds()
    }
}

/// Run the expiry sweeper until the process exits.
pub fn spawn_sweeper(store: Arc<TokenStore>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = store.sweep();
            if removed > 0 {
                log::info!("swept {} expired session token(s)", removed);
            }
        }
    });
}
