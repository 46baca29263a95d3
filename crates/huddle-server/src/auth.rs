//! Connection authentication.
//!
//! Clients present an opaque token as a `?token=` query parameter on the
//! WebSocket upgrade. The verifier maps it to a user profile before the
//! upgrade completes; a failed lookup rejects the upgrade with 401.

use crate::config::AuthConfig;
use async_trait::async_trait;
use huddle_core::UserProfile;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
}

/// Maps upgrade tokens to user identities.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<UserProfile, AuthError>;
}

/// Token table built from the `[auth]` config section.
pub struct StaticTokenVerifier {
    tokens: HashMap<String, UserProfile>,
}

impl StaticTokenVerifier {
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        let tokens = config
            .users
            .iter()
            .map(|u| {
                (
                    u.token.clone(),
                    UserProfile {
                        id: u.id.clone(),
                        name: u.name.clone(),
                        avatar_url: u.avatar_url.clone(),
                    },
                )
            })
            .collect();
        Self { tokens }
    }

    /// The provisioned profiles, used to seed the store at startup.
    #[must_use]
    pub fn profiles(&self) -> Vec<UserProfile> {
        self.tokens.values().cloned().collect()
    }
}

#[async_trait]
impl AuthVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<UserProfile, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthUser;

    fn verifier() -> StaticTokenVerifier {
        StaticTokenVerifier::from_config(&AuthConfig {
            users: vec![AuthUser {
                token: "t-alice".to_string(),
                id: "alice".to_string(),
                name: "Alice".to_string(),
                avatar_url: None,
            }],
        })
    }

    #[tokio::test]
    async fn test_valid_token() {
        let profile = verifier().verify("t-alice").await.unwrap();
        assert_eq!(profile.id, "alice");
    }

    #[tokio::test]
    async fn test_invalid_token() {
        assert!(matches!(
            verifier().verify("nope").await.unwrap_err(),
            AuthError::InvalidToken
        ));
        assert!(matches!(
            verifier().verify("").await.unwrap_err(),
            AuthError::MissingToken
        ));
    }
}
