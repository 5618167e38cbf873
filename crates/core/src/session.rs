//! Authenticated session state held by the client

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role names issued by the registry backend
pub mod roles {
    pub const ADMIN: &str = "ADMIN";
    pub const OPERATOR: &str = "OPERATOR";
    pub const FARMER: &str = "FARMER";
}

/// Identity of the logged-in user
///
/// Roles are kept in the order the backend returned them. The first entry is
/// treated as the primary role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl UserProfile {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        roles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    /// First role in the list, if any
    pub fn primary_role(&self) -> Option<&str> {
        self.roles.first().map(String::as_str)
    }

    /// Case-insensitive role membership
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    /// Whether the user holds at least one of `required`
    pub fn has_any_role(&self, required: &[&str]) -> bool {
        required.iter().any(|role| self.has_role(role))
    }
}

/// Tokens and identity for the current login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user: Option<UserProfile>,
    pub issued_at: DateTime<Utc>,
}

impl Session {
    /// Create a session issued now
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        user: Option<UserProfile>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            user,
            issued_at: Utc::now(),
        }
    }

    /// Copy of this session carrying a freshly minted access token
    #[must_use]
    pub fn with_access_token(&self, access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: self.refresh_token.clone(),
            user: self.user.clone(),
            issued_at: Utc::now(),
        }
    }

    /// Roles of the session user, empty when no profile is attached
    pub fn roles(&self) -> &[String] {
        self.user
            .as_ref()
            .map(|user| user.roles.as_slice())
            .unwrap_or_default()
    }

    /// Check that the session user holds one of `required`.
    ///
    /// There is no fallback role: a session without a profile or with an
    /// empty role list is denied for every role-gated view.
    pub fn authorize(&self, required: &[&str]) -> CoreResult<&UserProfile> {
        let user = self
            .user
            .as_ref()
            .ok_or_else(|| CoreError::access_denied("session has no user profile"))?;

        if user.roles.is_empty() {
            return Err(CoreError::access_denied(format!(
                "user {} has no roles assigned",
                user.id
            )));
        }

        if user.has_any_role(required) {
            Ok(user)
        } else {
            Err(CoreError::access_denied(format!(
                "user {} requires one of [{}]",
                user.id,
                required.join(", ")
            )))
        }
    }
}
