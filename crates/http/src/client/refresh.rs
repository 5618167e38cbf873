//! Single-flight refresh of the access token
//!
//! The first request rejected with 401 starts a refresh cycle; requests that
//! are rejected while the cycle runs join its queue. When the one refresh
//! exchange settles every queued request receives the same outcome: the new
//! access token to replay with, or `SessionExpired`.

use super::dispatcher::ApiRequest;
use super::error::ClientError;
use super::store::{SessionState, TokenStore};
use super::transport::Transport;
use crate::types::{RefreshRequest, RefreshResponse};
use farmreg_core::Session;
use parking_lot::Mutex;
use reqwest::Method;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Why a refresh cycle ended without a new token
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("no refresh token in the current session")]
    MissingRefreshToken,

    #[error("refresh rejected with status {0}")]
    Rejected(u16),

    #[error("refresh request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("refresh timed out after {0:?}")]
    TimedOut(Duration),

    #[error("refresh cancelled")]
    Cancelled,

    #[error("session was cleared or replaced during refresh")]
    SessionEnded,
}

/// A rejected request handed back with the token to replay it with
#[derive(Debug, Clone)]
pub struct Replay {
    pub request: ApiRequest,
    pub access_token: String,
    /// Store generation the token belongs to
    pub generation: u64,
}

/// Request waiting on the outcome of the current cycle
struct PendingRequest {
    request: ApiRequest,
    completion: oneshot::Sender<Result<Replay, ClientError>>,
}

enum CycleState {
    Idle,
    Refreshing {
        queue: Vec<PendingRequest>,
        cancel: CancellationToken,
    },
}

/// Serializes refresh-token exchanges
pub struct RefreshCoordinator {
    transport: Transport,
    store: Arc<TokenStore>,
    refresh_path: String,
    timeout: Duration,
    state: Mutex<CycleState>,
    exchanges: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Transport,
        store: Arc<TokenStore>,
        refresh_path: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            store,
            refresh_path: refresh_path.into(),
            timeout,
            state: Mutex::new(CycleState::Idle),
            exchanges: AtomicU64::new(0),
        }
    }

    /// Number of refresh exchanges issued so far
    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.state.lock(), CycleState::Refreshing { .. })
    }

    /// Cancel the in-flight cycle, if any; its queue is rejected with
    /// `SessionExpired`. Later rejections start a fresh cycle as usual.
    pub fn shutdown(&self) {
        if let CycleState::Refreshing { cancel, .. } = &*self.state.lock() {
            cancel.cancel();
        }
    }

    /// Hand over a request the backend rejected with 401.
    ///
    /// `rejected_token` is the access token the request carried. If the store
    /// already holds a different token the request is released right away
    /// with that token instead of starting another cycle.
    ///
    /// # Errors
    ///
    /// Returns `SessionExpired` when the cycle fails for any reason.
    pub async fn enqueue(
        self: &Arc<Self>,
        request: ApiRequest,
        rejected_token: Option<&str>,
    ) -> Result<Replay, ClientError> {
        let (completion, outcome) = oneshot::channel();
        let pending = PendingRequest {
            request,
            completion,
        };

        let start = {
            let mut state = self.state.lock();
            if let CycleState::Refreshing { queue, .. } = &mut *state {
                debug!(queued = queue.len() + 1, "Joining in-flight token refresh");
                queue.push(pending);
                None
            } else {
                let snapshot = self.store.snapshot();

                if let Some(access_token) = newer_token(snapshot.session.as_ref(), rejected_token) {
                    debug!("Rejected token is stale, replaying with current token");
                    return Ok(Replay {
                        request: pending.request,
                        access_token,
                        generation: snapshot.generation,
                    });
                }

                let refresh_token = snapshot
                    .session
                    .as_ref()
                    .and_then(|session| session.refresh_token.clone());
                let Some(refresh_token) = refresh_token else {
                    drop(state);
                    self.fail(snapshot.generation, &RefreshError::MissingRefreshToken);
                    return Err(ClientError::SessionExpired);
                };

                let cancel = CancellationToken::new();
                *state = CycleState::Refreshing {
                    queue: vec![pending],
                    cancel: cancel.clone(),
                };
                Some((refresh_token, snapshot.generation, cancel))
            }
        };

        if let Some((refresh_token, generation, cancel)) = start {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                coordinator.run_cycle(refresh_token, generation, cancel).await;
            });
        }

        // A dropped sender means the cycle task died; treat it as a failed refresh.
        outcome.await.unwrap_or(Err(ClientError::SessionExpired))
    }

    /// Expire the session from `generation`, e.g. after its replay is still
    /// unauthorized. A session that replaced it in the meantime is kept.
    pub fn expire_session(&self, generation: u64) {
        if self.store.clear_if_current(generation) {
            info!("Session expired, cleared token store");
        } else {
            debug!(generation, "Expired session was already replaced");
        }
    }

    async fn run_cycle(&self, refresh_token: String, generation: u64, cancel: CancellationToken) {
        let outcome = self.exchange(refresh_token, generation, cancel).await;

        // Publish to the store before leaving Refreshing so that a 401 arriving
        // after this point sees the new token as current.
        let outcome = match outcome {
            Ok(token) => match self.store.replace_access_token(generation, &token) {
                Some(_) => {
                    info!("Access token refreshed");
                    Ok(token)
                }
                None => Err(RefreshError::SessionEnded),
            },
            Err(reason) => Err(reason),
        };

        if let Err(reason) = &outcome {
            self.fail(generation, reason);
        }

        let queue = match std::mem::replace(&mut *self.state.lock(), CycleState::Idle) {
            CycleState::Refreshing { queue, .. } => queue,
            CycleState::Idle => Vec::new(),
        };

        debug!(released = queue.len(), success = outcome.is_ok(), "Refresh cycle settled");
        for pending in queue {
            let result = match &outcome {
                Ok(token) => Ok(Replay {
                    request: pending.request,
                    access_token: token.clone(),
                    generation,
                }),
                Err(_) => Err(ClientError::SessionExpired),
            };
            // The waiter may have gone away; nothing to deliver then.
            let _ = pending.completion.send(result);
        }
    }

    async fn exchange(
        &self,
        refresh_token: String,
        generation: u64,
        cancel: CancellationToken,
    ) -> Result<String, RefreshError> {
        let mut changes = self.store.subscribe();
        if changes.borrow().generation != generation {
            return Err(RefreshError::SessionEnded);
        }

        let request = self
            .transport
            .request(Method::POST, &self.refresh_path)
            .json(&RefreshRequest { refresh_token });

        let call = async {
            self.exchanges.fetch_add(1, Ordering::Relaxed);
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(RefreshError::Rejected(status.as_u16()));
            }
            let body: RefreshResponse = response.json().await?;
            if body.access_token.is_empty() {
                return Err(RefreshError::Rejected(status.as_u16()));
            }
            Ok(body.access_token)
        };

        // Cancellation is checked first so a cycle cancelled before it starts
        // never reaches the wire.
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(RefreshError::Cancelled),
            () = session_replaced(&mut changes, generation) => Err(RefreshError::SessionEnded),
            result = tokio::time::timeout(self.timeout, call) => {
                result.unwrap_or_else(|_| Err(RefreshError::TimedOut(self.timeout)))
            }
        }
    }

    fn fail(&self, generation: u64, reason: &RefreshError) {
        warn!(error = %reason, "Token refresh failed");
        if self.store.clear_if_current(generation) {
            info!("Session expired, cleared token store");
        }
    }
}

/// Current access token when it differs from the one the backend rejected
fn newer_token(current: Option<&Session>, rejected_token: Option<&str>) -> Option<String> {
    current
        .filter(|session| rejected_token != Some(session.access_token.as_str()))
        .map(|session| session.access_token.clone())
}

/// Resolves once the store moves past `generation` (logout or re-login)
async fn session_replaced(
    changes: &mut watch::Receiver<SessionState>,
    generation: u64,
) {
    while changes.changed().await.is_ok() {
        if changes.borrow_and_update().generation != generation {
            return;
        }
    }
    std::future::pending::<()>().await;
}
