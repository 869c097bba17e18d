use async_trait::async_trait;

use super::SignalingError;

/// Source of the credential presented in the `identify` frame.
///
/// Called once per connection epoch, so implementations may hand out a fresh
/// token each time.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn mint_token(&self) -> Result<String, SignalingError>;
}

/// Presents the same pre-issued token on every connect.
#[derive(Clone)]
pub struct StaticCredentials {
    token: String,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn mint_token(&self) -> Result<String, SignalingError> {
        if self.token.is_empty() {
            return Err(SignalingError::Credentials("no token configured".into()));
        }
        Ok(self.token.clone())
    }
}
