//! Obtaining a new access token.

use crate::config::ClientConfig;
use crate::envelope;
use crate::error::AtelierError;
use crate::outbound::HttpTransport;
use crate::request::ApiRequest;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

/// Result of a successful refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedTokens {
    pub access_token: String,
    /// Present only when the identity service rotates the refresh token too.
    pub refresh_token: Option<String>,
}

/// Trait for obtaining a fresh access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// `refresh_token` is `None` when the identity service tracks the refresh
    /// token itself (cookie based).
    async fn refresh(&self, refresh_token: Option<&str>) -> Result<RefreshedTokens, AtelierError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResult {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

/// Refresher for the identity service's `GET .../auth/refresh-token`.
///
/// Talks to the transport directly; it must never go through the
/// [`AuthGateway`](super::AuthGateway) it is refreshing for.
pub struct HttpTokenRefresher {
    transport: Arc<dyn HttpTransport>,
    url: String,
    token_in_path: bool,
}

impl HttpTokenRefresher {
    pub fn new(transport: Arc<dyn HttpTransport>, url: impl Into<String>) -> Self {
        Self {
            transport,
            url: url.into(),
            token_in_path: false,
        }
    }

    pub fn from_config(transport: Arc<dyn HttpTransport>, config: &ClientConfig) -> Self {
        Self {
            transport,
            url: config.refresh_url(),
            token_in_path: config.refresh_token_in_path,
        }
    }

    /// Send the refresh token as the last path segment.
    pub fn token_in_path(mut self, enabled: bool) -> Self {
        self.token_in_path = enabled;
        self
    }

    fn endpoint(&self, refresh_token: Option<&str>) -> String {
        match refresh_token {
            Some(token) if self.token_in_path => {
                format!("{}/{}", self.url.trim_end_matches('/'), token)
            }
            _ => self.url.clone(),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: Option<&str>) -> Result<RefreshedTokens, AtelierError> {
        let req = ApiRequest::get(self.endpoint(refresh_token)).to_http(None)?;
        let resp = self
            .transport
            .send(req)
            .await
            .map_err(|e| AtelierError::RefreshFailed(format!("{:#}", e)))?;

        if !resp.status().is_success() {
            return Err(AtelierError::RefreshFailed(format!(
                "refresh endpoint returned {}",
                resp.status()
            )));
        }

        let env = envelope::parse::<RefreshResult>(&resp)
            .map_err(|e| AtelierError::RefreshFailed(e.to_string()))?;

        if env.code != Some(envelope::CODE_OK) {
            return Err(AtelierError::RefreshFailed(
                env.message
                    .unwrap_or_else(|| format!("unexpected code {:?}", env.code)),
            ));
        }

        let result = env.result.ok_or_else(|| {
            AtelierError::RefreshFailed("refresh response carried no result".into())
        })?;

        match result.access_token {
            Some(access_token) if !access_token.is_empty() => Ok(RefreshedTokens {
                access_token,
                refresh_token: result.refresh_token,
            }),
            _ => Err(AtelierError::RefreshFailed(
                "refresh response carried no access token".into(),
            )),
        }
    }
}
