//! Bearer-token handling for outgoing calls.
//!
//! # Architecture
//!
//! - [`AuthGateway`]: owns the [`Credentials`] and the single-flight refresh
//!   state. Construct one per process and share it behind an `Arc`.
//! - [`TokenRefresher`]: how a new access token is obtained. The HTTP
//!   implementation, [`HttpTokenRefresher`], talks to the identity service.
//! - [`CredentialListener`]: notified when tokens rotate or the session ends,
//!   so the credential store / UI can react to a logout.

pub mod gateway;
pub mod refresh;

pub use gateway::{AuthGateway, CredentialListener};
pub use refresh::{HttpTokenRefresher, RefreshedTokens, TokenRefresher};

/// Tokens for the logged-in user.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user_id: Option<String>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            ..Default::default()
        }
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't leak the actual tokens in debug output
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("user_id", &self.user_id)
            .finish()
    }
}
