//! Single chokepoint for outgoing API calls

use super::error::{ClientError, error_message};
use super::refresh::{RefreshCoordinator, Replay};
use super::store::TokenStore;
use super::transport::Transport;
use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Everything needed to issue a call again
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub headers: HeaderMap,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: HeaderMap::new(),
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Per-call knobs
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub headers: HeaderMap,
    /// Send without the session token and never attempt a refresh
    pub skip_auth: bool,
}

impl CallOptions {
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn without_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }
}

/// Successful (2xx) response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Attaches the access token and applies the refresh-and-replay policy
#[derive(Clone)]
pub struct Dispatcher {
    transport: Transport,
    store: Arc<TokenStore>,
    coordinator: Arc<RefreshCoordinator>,
}

impl Dispatcher {
    pub fn new(
        transport: Transport,
        store: Arc<TokenStore>,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            transport,
            store,
            coordinator,
        }
    }

    /// Issue a call and return its 2xx response.
    ///
    /// A 401 is handed to the refresh coordinator and the call is replayed
    /// exactly once with the token it delivers. Every other failure is
    /// returned as is.
    ///
    /// # Errors
    ///
    /// `SessionExpired` when the refresh fails or the replay is rejected
    /// again; `Validation`, `Server` or `Request` for other failures.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        options: CallOptions,
    ) -> Result<ApiResponse, ClientError> {
        let request = ApiRequest {
            method,
            path: path.to_string(),
            body,
            headers: options.headers,
        };

        if options.skip_auth {
            let response = self.send(&request, None).await?;
            return into_result(response).await;
        }

        self.dispatch(request).await
    }

    /// `call` and decode the JSON body
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::call`], plus `Serialization` if the body does not decode.
    pub async fn call_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        options: CallOptions,
    ) -> Result<T, ClientError> {
        self.call(method, path, body, options).await?.json()
    }

    async fn dispatch(&self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        let token = self.store.access_token();
        let response = self.send(&request, token.as_deref()).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return into_result(response).await;
        }

        debug!(method = %request.method, path = %request.path, "Access token rejected");
        let replay = self.coordinator.enqueue(request, token.as_deref()).await?;

        // Logged out or replaced while waiting: never replay with a token that
        // no longer belongs to the current session.
        if !self.is_current(&replay) {
            debug!(path = %replay.request.path, "Session ended before replay");
            return Err(ClientError::SessionExpired);
        }

        let response = self
            .send(&replay.request, Some(&replay.access_token))
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(path = %replay.request.path, "Replayed request still unauthorized");
            self.coordinator.expire_session(replay.generation);
            return Err(ClientError::SessionExpired);
        }

        into_result(response).await
    }

    fn is_current(&self, replay: &Replay) -> bool {
        let snapshot = self.store.snapshot();
        snapshot.generation == replay.generation
            && snapshot
                .session
                .is_some_and(|session| session.access_token == replay.access_token)
    }

    async fn send(
        &self,
        request: &ApiRequest,
        access_token: Option<&str>,
    ) -> Result<reqwest::Response, ClientError> {
        let mut builder = self
            .transport
            .request(request.method.clone(), &request.path)
            .headers(request.headers.clone());

        if let Some(token) = access_token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        trace!(method = %request.method, path = %request.path, "Sending request");
        Ok(builder.send().await?)
    }
}

async fn into_result(response: reqwest::Response) -> Result<ApiResponse, ClientError> {
    let status = response.status();

    if status.is_success() {
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    } else {
        let message = error_message(response).await;
        Err(ClientError::from_status(status, message))
    }
}
