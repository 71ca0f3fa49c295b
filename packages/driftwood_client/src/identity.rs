//! Client identity: a stable token scoped to one browsing window.
//!
//! Presence labels and channel resumption state are tagged with this token.
//! Each window resolves its identity once, from the window-scoped store;
//! older single-window builds kept the token in a shared location, so the
//! first window to resolve adopts (and consumes) that legacy value. The
//! resolved token is written to the window store only, never back to the
//! legacy one, so a second window generates its own.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};
use uuid::Uuid;

/// Key-value slot holding at most one identity token.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Option<String>;
    fn store(&self, token: &str);
    fn clear(&self);
}

/// Window-scoped store: lives exactly as long as the window.
#[derive(Default)]
pub struct WindowTokenStore {
    slot: Mutex<Option<String>>,
}

impl WindowTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<String>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TokenStore for WindowTokenStore {
    fn load(&self) -> Option<String> {
        self.lock().clone()
    }

    fn store(&self, token: &str) {
        *self.lock() = Some(token.to_string());
    }

    fn clear(&self) {
        *self.lock() = None;
    }
}

/// Shared legacy token file from single-window builds,
/// `<data_dir>/client_token`. Read once for migration, then removed.
pub struct LegacyTokenFile {
    path: PathBuf,
}

const LEGACY_TOKEN_FILE: &str = "client_token";

impl LegacyTokenFile {
    pub fn new(data_dir: &std::path::Path) -> Self {
        Self {
            path: data_dir.join(LEGACY_TOKEN_FILE),
        }
    }
}

impl TokenStore for LegacyTokenFile {
    fn load(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let token = contents.trim();
                if token.is_empty() {
                    None
                } else {
                    Some(token.to_string())
                }
            }
            Err(_) => None,
        }
    }

    fn store(&self, token: &str) {
        if let Err(err) = std::fs::write(&self.path, token) {
            debug!(path = %self.path.display(), error = %err, "failed to write token file");
        }
    }

    fn clear(&self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %err, "failed to remove token file");
            }
        }
    }
}

/// Resolves and caches this window's identity token.
pub struct ClientIdentity {
    window: Box<dyn TokenStore>,
    legacy: Option<Box<dyn TokenStore>>,
    cached: Mutex<Option<String>>,
}

impl ClientIdentity {
    pub fn new(window: Box<dyn TokenStore>, legacy: Option<Box<dyn TokenStore>>) -> Self {
        Self {
            window,
            legacy,
            cached: Mutex::new(None),
        }
    }

    /// The identity token for this window. Resolution order on first read:
    /// window store, else the legacy shared value (consumed so other
    /// windows do not adopt it too), else a fresh random token. The result
    /// is persisted to the window store only.
    pub fn token(&self) -> String {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = cached.as_ref() {
            return token.clone();
        }

        let token = if let Some(token) = self.window.load() {
            token
        } else if let Some(token) = self.migrate_legacy() {
            token
        } else {
            let token = Uuid::new_v4().to_string();
            info!(client_id = %token, "generated new client identity");
            token
        };

        self.window.store(&token);
        *cached = Some(token.clone());
        token
    }

    fn migrate_legacy(&self) -> Option<String> {
        let legacy = self.legacy.as_ref()?;
        let token = legacy.load()?;
        legacy.clear();
        info!(client_id = %token, "adopted legacy client identity");
        Some(token)
    }

    /// Drop the in-memory cache. The window store is the source of truth,
    /// so the next read returns the same token.
    pub fn reset_cache(&self) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
