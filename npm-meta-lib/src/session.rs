//! Credential relay
//!
//! Login is forwarded to NPM; the resulting token is held in an explicit
//! `Session` value that callers pass into every reconciliation call. Nothing
//! here keeps global state.

use crate::error::{MetaError, Result};
use crate::upstream::StreamApi;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// An authenticated NPM session.
#[derive(Clone)]
pub struct Session {
    identity: String,
    token: String,
    upstream_expires: Option<String>,
    created_at: DateTime<Utc>,
}

impl Session {
    /// Wrap a token obtained elsewhere (e.g. service credentials or tests)
    pub fn from_token(identity: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            token: token.into(),
            upstream_expires: None,
            created_at: Utc::now(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Bearer token for upstream calls
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Expiry reported by NPM, verbatim
    pub fn upstream_expires(&self) -> Option<&str> {
        self.upstream_expires.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

// Keep the token out of logs.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("token", &"<redacted>")
            .field("upstream_expires", &self.upstream_expires)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Forwards login to NPM and hands back a `Session`.
pub struct CredentialRelay {
    api: Arc<dyn StreamApi>,
}

impl CredentialRelay {
    pub fn new(api: Arc<dyn StreamApi>) -> Self {
        Self { api }
    }

    pub async fn login(&self, identity: &str, secret: &str) -> Result<Session> {
        if identity.trim().is_empty() || secret.is_empty() {
            return Err(MetaError::invalid_input("username and password are required"));
        }

        let token = self.api.login(identity, secret).await.map_err(|e| {
            tracing::warn!(identity, error = %e, "NPM login failed");
            e
        })?;
        tracing::info!(identity, "NPM login succeeded");

        Ok(Session {
            identity: identity.to_string(),
            token: token.token,
            upstream_expires: token.expires,
            created_at: Utc::now(),
        })
    }

    /// End a session. NPM has no revocation endpoint, so the token is dropped.
    pub fn logout(&self, session: Session) {
        let age = Utc::now() - session.created_at();
        tracing::info!(
            identity = %session.identity,
            age_secs = age.num_seconds(),
            "Session closed"
        );
        drop(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ForwardingRule, RuleId, RuleSpec};
    use crate::upstream::UpstreamToken;
    use async_trait::async_trait;

    struct FixedLogin;

    #[async_trait]
    impl StreamApi for FixedLogin {
        async fn login(&self, identity: &str, secret: &str) -> Result<UpstreamToken> {
            if identity == "admin@example.com" && secret == "changeme" {
                Ok(UpstreamToken {
                    token: "npm-token".to_string(),
                    expires: Some("2030-01-01T00:00:00.000Z".to_string()),
                })
            } else {
                Err(MetaError::auth("Invalid email or password"))
            }
        }

        async fn list_streams(&self, _token: &str) -> Result<Vec<ForwardingRule>> {
            Ok(Vec::new())
        }

        async fn create_stream(&self, _token: &str, _spec: &RuleSpec) -> Result<ForwardingRule> {
            Err(MetaError::unavailable("not used"))
        }

        async fn delete_stream(&self, _token: &str, _id: RuleId) -> Result<()> {
            Ok(())
        }
    }

    fn relay() -> CredentialRelay {
        CredentialRelay::new(Arc::new(FixedLogin))
    }

    #[tokio::test]
    async fn test_login_returns_session() {
        let session = relay().login("admin@example.com", "changeme").await.unwrap();
        assert_eq!(session.identity(), "admin@example.com");
        assert_eq!(session.token(), "npm-token");
        assert_eq!(session.upstream_expires(), Some("2030-01-01T00:00:00.000Z"));
    }

    #[tokio::test]
    async fn test_login_bad_credentials() {
        let err = relay().login("admin@example.com", "wrong").await.unwrap_err();
        assert!(matches!(err, MetaError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn test_login_requires_both_fields() {
        let err = relay().login("", "changeme").await.unwrap_err();
        assert!(matches!(err, MetaError::InvalidInput(_)));

        let err = relay().login("admin@example.com", "").await.unwrap_err();
        assert!(matches!(err, MetaError::InvalidInput(_)));
    }

    #[test]
    fn test_debug_redacts_token() {
        let session = Session::from_token("admin", "secret-token");
        let rendered = format!("{:?}", session);
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("<redacted>"));
    }
}
