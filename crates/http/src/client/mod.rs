//! farmreg HTTP client

pub mod auth;
pub mod dispatcher;
pub mod error;
pub mod refresh;
pub mod storage;
pub mod store;
pub mod transport;

use auth::{AuthEndpoints, Authenticator, Credentials};
use dispatcher::{ApiResponse, CallOptions, Dispatcher};
use error::ClientError;
use farmreg_core::{ClientConfig, CoreResult, Session, UserProfile};
use refresh::RefreshCoordinator;
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use storage::{FileStorage, MemoryStorage, SessionStorage};
use store::{SessionState, TokenStore};
use tokio::sync::watch;
use transport::Transport;

/// Registry API client
///
/// Owns one of each session component, wired together at construction.
/// Cloning is cheap and every clone shares the same session.
#[derive(Clone)]
pub struct FarmRegClient {
    store: Arc<TokenStore>,
    authenticator: Arc<Authenticator>,
    coordinator: Arc<RefreshCoordinator>,
    dispatcher: Dispatcher,
}

impl FarmRegClient {
    /// Create a new client with default configuration
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        Self::builder().base_url(base_url).build()
    }

    /// Create a client from loaded configuration
    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        Self::builder().config(config).build()
    }

    /// Create a new client builder
    pub fn builder() -> FarmRegClientBuilder {
        FarmRegClientBuilder::default()
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.authenticator
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Current session, if any
    pub fn session(&self) -> Option<Session> {
        self.store.get()
    }

    /// Watch session changes (login, refresh, logout)
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.store.subscribe()
    }

    /// Log in with an identifier and password
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<Session, ClientError> {
        self.authenticator.login(identifier, secret).await
    }

    /// Log in with any supported credential kind
    pub async fn login_with(&self, credentials: Credentials) -> Result<Session, ClientError> {
        self.authenticator.login_with(credentials).await
    }

    /// Clear the session and notify the backend (best effort)
    pub async fn logout(&self) {
        self.authenticator.logout().await;
    }

    /// Check the current session against role-gated access
    pub fn authorize(&self, required: &[&str]) -> CoreResult<UserProfile> {
        let session = self
            .store
            .get()
            .ok_or_else(|| farmreg_core::CoreError::access_denied("not logged in"))?;
        session.authorize(required).cloned()
    }

    /// Issue an authenticated call
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        options: CallOptions,
    ) -> Result<ApiResponse, ClientError> {
        self.dispatcher.call(method, path, body, options).await
    }

    /// Issue an authenticated call and decode its JSON body
    pub async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, ClientError> {
        self.dispatcher
            .call_json(method, path, body, CallOptions::default())
            .await
    }

    /// Fetch the current user from the backend
    pub async fn me(&self) -> Result<UserProfile, ClientError> {
        let path = self.authenticator.endpoints().me.clone();
        let user: crate::types::BackendUser = self.call_json(Method::GET, &path, None).await?;
        user.into_profile()
            .ok_or_else(|| ClientError::Validation {
                status: 200,
                message: "user response carried no identifier".into(),
            })
    }
}

/// Builder for FarmRegClient
#[derive(Default)]
pub struct FarmRegClientBuilder {
    base_url: Option<String>,
    auth_path: Option<String>,
    timeout: Option<Duration>,
    refresh_timeout: Option<Duration>,
    user_agent: Option<String>,
    storage: Option<Arc<dyn SessionStorage>>,
}

impl FarmRegClientBuilder {
    /// Take every setting from `config`
    pub fn config(mut self, config: &ClientConfig) -> Self {
        self.base_url = Some(config.normalized_base_url());
        self.auth_path = Some(config.normalized_auth_path());
        self.timeout = config.request_timeout();
        self.refresh_timeout = Some(config.refresh_timeout());
        self.user_agent = Some(config.user_agent.clone());
        if let Some(path) = &config.storage_path {
            self.storage = Some(Arc::new(FileStorage::new(path)));
        }
        self
    }

    /// Set the base URL
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set the prefix of the auth routes (default `/auth`)
    pub fn auth_path(mut self, path: impl Into<String>) -> Self {
        self.auth_path = Some(path.into());
        self
    }

    /// Set the request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the upper bound on a refresh exchange
    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = Some(timeout);
        self
    }

    /// Set the user agent
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Persist the session in `storage` (in-memory by default)
    pub fn storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Build the client
    pub fn build(self) -> Result<FarmRegClient, ClientError> {
        let defaults = ClientConfig::default();

        let base_url = self
            .base_url
            .ok_or_else(|| ClientError::Configuration("base_url is required".into()))?;
        let user_agent = self.user_agent.unwrap_or(defaults.user_agent.clone());
        let transport = Transport::new(base_url, self.timeout, &user_agent)?;

        let endpoints = AuthEndpoints::with_prefix(
            self.auth_path
                .as_deref()
                .unwrap_or(&defaults.normalized_auth_path()),
        );

        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let store = Arc::new(TokenStore::new(storage));

        let authenticator = Arc::new(Authenticator::new(
            transport.clone(),
            Arc::clone(&store),
            endpoints.clone(),
        ));
        let coordinator = Arc::new(RefreshCoordinator::new(
            transport.clone(),
            Arc::clone(&store),
            endpoints.refresh,
            self.refresh_timeout.unwrap_or(defaults.refresh_timeout()),
        ));
        let dispatcher = Dispatcher::new(transport, Arc::clone(&store), Arc::clone(&coordinator));

        Ok(FarmRegClient {
            store,
            authenticator,
            coordinator,
            dispatcher,
        })
    }
}
