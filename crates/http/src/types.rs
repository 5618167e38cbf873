//! Wire types exchanged with the registry auth routes

use farmreg_core::UserProfile;
use serde::{Deserialize, Serialize};

/// Password login body: JSON for `/auth/login`, form-encoded for `/auth/operator-login`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Form body for `/auth/farmer-login`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmerLoginForm {
    pub nrc: String,
    pub dob: String,
}

/// Successful login payload
///
/// The access token is optional here so that a 2xx without one can be
/// reported instead of failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub user: Option<BackendUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// User object as returned by `/auth/login` and `/auth/me`
///
/// Different backend revisions identify users by `id`, `email` or `username`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendUser {
    #[serde(default, alias = "_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, alias = "full_name")]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl BackendUser {
    /// Convert into a profile; `None` when no identifier is present at all
    pub fn into_profile(self) -> Option<UserProfile> {
        let id = self
            .id
            .or_else(|| self.email.clone())
            .or_else(|| self.username.clone())?;
        let display_name = self
            .name
            .or(self.email)
            .or(self.username)
            .unwrap_or_else(|| id.clone());

        Some(UserProfile {
            id,
            display_name,
            roles: self.roles,
        })
    }
}

/// Error body shapes used by the backend (`{"detail": ...}` or `{"message": ...}`)
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorBody {
    pub fn into_message(self) -> Option<String> {
        match self.detail {
            Some(serde_json::Value::String(detail)) => Some(detail),
            Some(other) => Some(other.to_string()),
            None => self.message,
        }
    }
}
