//! Credential exchange and logout

use super::error::{ClientError, error_message};
use super::store::TokenStore;
use super::transport::Transport;
use crate::types::{FarmerLoginForm, LoginRequest, LoginResponse};
use farmreg_core::Session;
use reqwest::{Method, header};
use std::sync::Arc;

/// Auth route paths relative to the base URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEndpoints {
    pub login: String,
    pub operator_login: String,
    pub farmer_login: String,
    pub refresh: String,
    pub logout: String,
    pub me: String,
}

impl AuthEndpoints {
    /// Build the routes under `prefix` (e.g. `/auth`)
    pub fn with_prefix(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            login: format!("{prefix}/login"),
            operator_login: format!("{prefix}/operator-login"),
            farmer_login: format!("{prefix}/farmer-login"),
            refresh: format!("{prefix}/refresh"),
            logout: format!("{prefix}/logout"),
            me: format!("{prefix}/me"),
        }
    }
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self::with_prefix("/auth")
    }
}

/// Ways a user can sign in
#[derive(Clone)]
pub enum Credentials {
    /// Administrator (and generic) email/password login
    Password { username: String, password: String },
    /// Extension officer login, sent form-encoded
    Operator { username: String, password: String },
    /// Farmer login with national registration card number and date of birth
    Farmer { nrc: String, date_of_birth: String },
}

impl Credentials {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Password {
            username: username.into(),
            password: password.into(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::Operator { .. } => "operator",
            Self::Farmer { .. } => "farmer",
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password { username, .. } | Self::Operator { username, .. } => f
                .debug_struct(self.kind())
                .field("username", username)
                .finish_non_exhaustive(),
            Self::Farmer { nrc, .. } => f
                .debug_struct(self.kind())
                .field("nrc", nrc)
                .finish_non_exhaustive(),
        }
    }
}

/// Exchanges credentials for a session and ends sessions
pub struct Authenticator {
    transport: Transport,
    store: Arc<TokenStore>,
    endpoints: AuthEndpoints,
}

impl Authenticator {
    pub fn new(transport: Transport, store: Arc<TokenStore>, endpoints: AuthEndpoints) -> Self {
        Self {
            transport,
            store,
            endpoints,
        }
    }

    pub fn endpoints(&self) -> &AuthEndpoints {
        &self.endpoints
    }

    /// Log in with an identifier (email or username) and password
    ///
    /// # Errors
    ///
    /// `InvalidCredentials` on a 4xx, `BackendUnavailable` on network
    /// failure, 5xx, or a success response without an access token.
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<Session, ClientError> {
        self.login_with(Credentials::password(identifier, secret))
            .await
    }

    /// Log in through the route matching `credentials`
    ///
    /// # Errors
    ///
    /// Same as [`Authenticator::login`].
    pub async fn login_with(&self, credentials: Credentials) -> Result<Session, ClientError> {
        let kind = credentials.kind();
        let request = match credentials {
            Credentials::Password { username, password } => self
                .transport
                .request(Method::POST, &self.endpoints.login)
                .json(&LoginRequest { username, password }),
            Credentials::Operator { username, password } => self
                .transport
                .request(Method::POST, &self.endpoints.operator_login)
                .form(&LoginRequest { username, password }),
            Credentials::Farmer { nrc, date_of_birth } => self
                .transport
                .request(Method::POST, &self.endpoints.farmer_login)
                .form(&FarmerLoginForm {
                    nrc,
                    dob: date_of_birth,
                }),
        };

        let response = request.send().await.map_err(|e| {
            warn!(kind, error = %e, "Login request failed");
            ClientError::BackendUnavailable(e.to_string())
        })?;

        let status = response.status();
        if status.is_client_error() {
            let message = error_message(response).await;
            info!(kind, status = status.as_u16(), "Login rejected");
            return Err(ClientError::InvalidCredentials(message));
        }
        if !status.is_success() {
            let message = error_message(response).await;
            warn!(kind, status = status.as_u16(), "Login failed on the backend");
            return Err(ClientError::BackendUnavailable(format!("{status}: {message}")));
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| ClientError::BackendUnavailable(format!("malformed login response: {e}")))?;

        let access_token = body
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                ClientError::BackendUnavailable("login response carried no access token".into())
            })?;

        // Roles are taken as given; an empty list is left empty.
        let user = body.user.and_then(crate::types::BackendUser::into_profile);
        let session = Session::new(access_token, body.refresh_token, user);

        self.store.set(session.clone());
        info!(
            kind,
            user = session.user.as_ref().map_or("<unknown>", |u| u.id.as_str()),
            roles = ?session.roles(),
            "Logged in"
        );
        Ok(session)
    }

    /// End the local session, then tell the backend if possible.
    ///
    /// The store is cleared before any network traffic; a failure to reach the
    /// backend is logged and otherwise ignored.
    pub async fn logout(&self) {
        let previous = self.store.get();
        self.store.clear();
        info!("Logged out");

        let Some(session) = previous else {
            return;
        };

        let result = self
            .transport
            .request(Method::POST, &self.endpoints.logout)
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", session.access_token),
            )
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!("Backend acknowledged logout");
            }
            Ok(response) => {
                warn!(status = response.status().as_u16(), "Backend logout not acknowledged");
            }
            Err(e) => warn!(error = %e, "Could not notify backend of logout"),
        }
    }
}
