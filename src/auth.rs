//! Credential handling / two-factor prompts boundary. Out of scope per
//! SPEC_FULL.md §1: the interactive 2FA/2SA exchange the original system
//! drives over a TTY (`icloud/authenticate.py`'s `_handle_2fa`/`_handle_2sa`)
//! is not implemented here. `Authenticator` is the trait the daemon
//! programs against; `NonInteractiveAuthenticator` declines any challenge
//! rather than blocking on stdin, which is the right behavior for a
//! long-running daemon with no attached terminal.

use anyhow::{anyhow, Result};
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
    pub cookie_directory: String,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session>;
}

/// Declines any interactive challenge; suitable for a daemon process. A
/// real authenticator would additionally exchange a 2FA/2SA code here.
pub struct NonInteractiveAuthenticator;

#[async_trait]
impl Authenticator for NonInteractiveAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session> {
        let password = credentials
            .password
            .as_ref()
            .ok_or_else(|| anyhow!("no stored password available for {} and not a TTY", credentials.username))?;
        if password.is_empty() {
            return Err(anyhow!("empty password for {}", credentials.username));
        }
        Ok(Session { token: format!("session-for-{}", credentials.username) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn authenticates_with_a_password() {
        let auth = NonInteractiveAuthenticator;
        let creds = Credentials {
            username: "jane@example.com".to_string(),
            password: Some("hunter2".to_string()),
            cookie_directory: "/tmp/cookies".to_string(),
        };
        let session = auth.authenticate(&creds).await.unwrap();
        assert!(session.token.contains("jane@example.com"));
    }

    #[tokio::test]
    async fn declines_without_a_password() {
        let auth = NonInteractiveAuthenticator;
        let creds = Credentials {
            username: "jane@example.com".to_string(),
            password: None,
            cookie_directory: "/tmp/cookies".to_string(),
        };
        assert!(auth.authenticate(&creds).await.is_err());
    }
}
