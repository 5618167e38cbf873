//! Process-wide holder of the current session

use super::storage::{MemoryStorage, SessionStorage, keys};
use chrono::{DateTime, Utc};
use farmreg_core::{Session, UserProfile};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

/// Snapshot published to subscribers
///
/// `generation` increases on every `set` and `clear`, so a holder of an old
/// value can tell that the session it started with is gone even if an equal
/// one took its place. Access-token refreshes keep the generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub session: Option<Session>,
    pub generation: u64,
}

/// Current session, change notification and persistence
pub struct TokenStore {
    state: watch::Sender<SessionState>,
    storage: Arc<dyn SessionStorage>,
    // Serializes mutate + persist so storage follows the in-memory order.
    write_lock: Mutex<()>,
}

impl TokenStore {
    /// Create a store over `storage`, restoring any persisted session
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        let session = restore(storage.as_ref());
        if session.is_some() {
            info!("Restored persisted session");
        }

        let (state, _) = watch::channel(SessionState {
            session,
            generation: 0,
        });

        Self {
            state,
            storage,
            write_lock: Mutex::new(()),
        }
    }

    /// Store backed by process memory only
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    pub fn get(&self) -> Option<Session> {
        self.state.borrow().session.clone()
    }

    /// Current access token, if logged in
    pub fn access_token(&self) -> Option<String> {
        self.state
            .borrow()
            .session
            .as_ref()
            .map(|s| s.access_token.clone())
    }

    pub fn generation(&self) -> u64 {
        self.state.borrow().generation
    }

    /// Current session together with its generation, read atomically
    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().session.is_some()
    }

    /// Receive every subsequent change
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Replace the session wholesale
    pub fn set(&self, session: Session) {
        let _guard = self.write_lock.lock();
        self.state.send_modify(|state| {
            state.generation += 1;
            state.session = Some(session.clone());
        });
        persist(self.storage.as_ref(), &session);
    }

    /// Drop the session and its persisted keys
    pub fn clear(&self) {
        let _guard = self.write_lock.lock();
        self.state.send_modify(|state| {
            state.generation += 1;
            state.session = None;
        });
        erase(self.storage.as_ref());
    }

    /// Clear only if the session is still the one from `generation`.
    ///
    /// Returns whether the store was cleared.
    pub fn clear_if_current(&self, generation: u64) -> bool {
        let _guard = self.write_lock.lock();
        let cleared = self.state.send_if_modified(|state| {
            if state.generation != generation || state.session.is_none() {
                return false;
            }
            state.generation += 1;
            state.session = None;
            true
        });
        if cleared {
            erase(self.storage.as_ref());
        }
        cleared
    }

    /// Swap in a refreshed access token if the session from `generation` is
    /// still current. Returns the updated session on success.
    pub fn replace_access_token(&self, generation: u64, access_token: &str) -> Option<Session> {
        let _guard = self.write_lock.lock();
        let mut updated = None;
        self.state.send_if_modified(|state| {
            if state.generation != generation {
                return false;
            }
            let Some(current) = state.session.as_ref() else {
                return false;
            };
            let refreshed = current.with_access_token(access_token);
            state.session = Some(refreshed.clone());
            updated = Some(refreshed);
            true
        });

        if let Some(session) = &updated {
            store_item(self.storage.as_ref(), keys::ACCESS_TOKEN, &session.access_token);
            store_item(
                self.storage.as_ref(),
                keys::ISSUED_AT,
                &session.issued_at.to_rfc3339(),
            );
        }
        updated
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn restore(storage: &dyn SessionStorage) -> Option<Session> {
    let read = |key: &str| match storage.get_item(key) {
        Ok(value) => value,
        Err(e) => {
            warn!(key, error = %e, "Failed to read persisted session item");
            None
        }
    };

    let access_token = read(keys::ACCESS_TOKEN).filter(|t| !t.is_empty() && t != "null")?;
    let refresh_token = read(keys::REFRESH_TOKEN).filter(|t| !t.is_empty() && t != "null");

    let user = read(keys::USER).and_then(|raw| {
        serde_json::from_str::<UserProfile>(&raw)
            .inspect_err(|e| warn!(error = %e, "Discarding unreadable persisted user profile"))
            .ok()
    });

    let issued_at = read(keys::ISSUED_AT)
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map_or_else(Utc::now, |ts| ts.with_timezone(&Utc));

    Some(Session {
        access_token,
        refresh_token,
        user,
        issued_at,
    })
}

fn persist(storage: &dyn SessionStorage, session: &Session) {
    store_item(storage, keys::ACCESS_TOKEN, &session.access_token);

    match &session.refresh_token {
        Some(token) => store_item(storage, keys::REFRESH_TOKEN, token),
        None => remove_item(storage, keys::REFRESH_TOKEN),
    }

    match session.user.as_ref().map(serde_json::to_string) {
        Some(Ok(user)) => store_item(storage, keys::USER, &user),
        Some(Err(e)) => warn!(error = %e, "Failed to encode user profile"),
        None => remove_item(storage, keys::USER),
    }

    store_item(storage, keys::ISSUED_AT, &session.issued_at.to_rfc3339());
}

fn erase(storage: &dyn SessionStorage) {
    for key in keys::ALL {
        remove_item(storage, key);
    }
}

// Persistence is best effort: the in-memory session stays authoritative and
// a failed write only costs the session on the next start.
fn store_item(storage: &dyn SessionStorage, key: &str, value: &str) {
    if let Err(e) = storage.set_item(key, value) {
        warn!(key, error = %e, "Failed to persist session item");
    }
}

fn remove_item(storage: &dyn SessionStorage, key: &str) {
    if let Err(e) = storage.remove_item(key) {
        warn!(key, error = %e, "Failed to remove persisted session item");
    }
}
