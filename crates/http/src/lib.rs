//! farmreg HTTP session client
//!
//! Wraps the registry REST API behind a single dispatcher that attaches the
//! current access token, refreshes it when the backend rejects it, and replays
//! the rejected calls once a fresh token is available.

#[macro_use]
extern crate tracing;

pub mod client;
pub mod types;

pub use client::{
    FarmRegClient, FarmRegClientBuilder,
    auth::{AuthEndpoints, Authenticator, Credentials},
    dispatcher::{ApiRequest, ApiResponse, CallOptions, Dispatcher},
    error::ClientError,
    refresh::{RefreshCoordinator, RefreshError, Replay},
    storage::{FileStorage, MemoryStorage, SessionStorage},
    store::{SessionState, TokenStore},
    transport::Transport,
};
pub use farmreg_core::{Session, UserProfile, roles};
pub use reqwest::{Method, StatusCode};
