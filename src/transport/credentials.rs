//! Short-lived access credentials

use crate::error::{CallError, CallResult};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::time::Duration;

/// An access token for the service. Never printed.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credential {
    token: String,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// No credential; the proxy supplies its own
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn secret(&self) -> &str {
        &self.token
    }

    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.token.is_empty() {
            write!(f, "Credential(<none>)")
        } else {
            write!(f, "Credential(<redacted>)")
        }
    }
}

/// Where credentials come from. Called once per connection attempt.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn acquire(&self) -> CallResult<Credential>;
}

/// A fixed token supplied on the command line
pub struct StaticToken(pub String);

#[async_trait]
impl CredentialSource for StaticToken {
    async fn acquire(&self) -> CallResult<Credential> {
        if self.0.trim().is_empty() {
            return Err(CallError::SetupFailed("empty access token".to_string()));
        }
        Ok(Credential::new(self.0.trim()))
    }
}

/// A token read from an environment variable at acquisition time
pub struct EnvToken {
    pub var: String,
}

#[async_trait]
impl CredentialSource for EnvToken {
    async fn acquire(&self) -> CallResult<Credential> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => Ok(Credential::new(token.trim())),
            _ => Err(CallError::SetupFailed(format!(
                "environment variable {} is not set",
                self.var
            ))),
        }
    }
}

/// A trusted HTTP endpoint minting short-lived tokens
pub struct TokenEndpoint {
    url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TokenReply {
    token: Option<String>,
    access_token: Option<String>,
    /// Ephemeral tokens are sometimes returned as a resource name
    name: Option<String>,
}

impl TokenEndpoint {
    pub fn new(url: impl Into<String>) -> CallResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CallError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl CredentialSource for TokenEndpoint {
    async fn acquire(&self) -> CallResult<Credential> {
        debug!("Requesting access token from {}", self.url);
        let reply: TokenReply = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        reply
            .token
            .or(reply.access_token)
            .or(reply.name)
            .filter(|t| !t.is_empty())
            .map(Credential::new)
            .ok_or_else(|| CallError::SetupFailed("token endpoint returned no token".to_string()))
    }
}

/// No credential at all, for a proxy that injects its own
pub struct Anonymous;

#[async_trait]
impl CredentialSource for Anonymous {
    async fn acquire(&self) -> CallResult<Credential> {
        Ok(Credential::anonymous())
    }
}
