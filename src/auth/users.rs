//! Local user accounts and the identity verifier.
//!
//! Local users live in a TOML auth file on disk: a bcrypt hash, an admin
//! flag, and a creation stamp per user. The file also carries the optional
//! directory-service section; when a username has no local entry the
//! verifier falls through to the directory path.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::directory::{self, DirectoryConfig};

/// Default token lifetime in hours.
pub const DEFAULT_SESSION_TIMEOUT_HOURS: u64 = 24;

/// A local user record.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalUser {
    /// bcrypt hash of the password.
    pub password_hash: String,
    /// Whether this user may use the admin listing.
    #[serde(default)]
    pub admin: bool,
    /// When the account was created.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Parsed auth file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthFile {
    /// Token lifetime in hours.
    pub session_timeout_hours: Option<u64>,
    /// Local accounts, keyed by username.
    pub users: HashMap<String, LocalUser>,
    /// Directory-service settings.
    pub directory: Option<DirectoryConfig>,
}

impl AuthFile {
    /// Load and validate the auth file. Directory configuration with
    /// malformed filter templates is rejected here so a broken group check
    /// can never be silently skipped at login time.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading auth file {}", path.display()))?;
        let parsed: AuthFile = toml::from_str(&raw)
            .with_context(|| format!("parsing auth file {}", path.display()))?;

        if let Some(ref dir) = parsed.directory {
            dir.validate()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("invalid [directory] section in {}", path.display()))?;
        }

        log::info!(
            "authentication enabled - {} local user(s) configured",
            parsed.users.len()
        );
        if let Some(ref dir) = parsed.directory {
            if dir.enabled {
                log::info!("directory authentication enabled - server {}", dir.url);
            }
        }

        Ok(parsed)
    }

    /// Token lifetime from the file, or the default.
    pub fn session_timeout_hours(&self) -> u64 {
        self.session_timeout_hours
            .unwrap_or(DEFAULT_SESSION_TIMEOUT_HOURS)
    }
}

/// Outcome of a failed credential check.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Final: the pair is wrong.
    #[error("invalid username or password")]
    InvalidCredentials,
    /// Transient: the directory service could not be consulted.
    #[error("identity backend unavailable: {0}")]
    Unavailable(String),
}

/// Validates a credential pair against local users, then the directory.
#[derive(Debug)]
pub struct IdentityVerifier {
    users: HashMap<String, LocalUser>,
    directory: Option<DirectoryConfig>,
}

impl IdentityVerifier {
    pub fn new(users: HashMap<String, LocalUser>, directory: Option<DirectoryConfig>) -> Self {
        Self { users, directory }
    }

    /// Check a credential pair. Local users win; the directory is only
    /// consulted for usernames with no local entry, and only when enabled.
    pub async fn verify(&self, username: &str, password: &str) -> Result<String, VerifyError> {
        if username.is_empty() || password.is_empty() {
            return Err(VerifyError::InvalidCredentials);
        }

        if let Some(user) = self.users.get(username) {
            return match bcrypt::verify(password, &user.password_hash) {
                Ok(true) => Ok(username.to_string()),
                Ok(false) => Err(VerifyError::InvalidCredentials),
                Err(e) => {
                    log::warn!("invalid password hash for local user '{}': {}", username, e);
                    Err(VerifyError::InvalidCredentials)
                }
            };
        }

        if let Some(ref dir) = self.directory {
            if dir.enabled {
                directory::authenticate(dir, username, password).await?;
                return Ok(username.to_string());
            }
        }

        Err(VerifyError::InvalidCredentials)
    }

    /// Whether the username carries the admin flag in the local user file.
    pub fn is_admin(&self, username: &str) -> bool {
        self.users.get(username).map(|u| u.admin).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier_with(username: &str, password: &str, admin: bool) -> IdentityVerifier {
        let hash = bcrypt::hash(password, 4).unwrap();
        let mut users = HashMap::new();
        users.insert(
            username.to_string(),
            LocalUser {
                password_hash: hash,
                admin,
                created_at: None,
            },
        );
        IdentityVerifier::new(users, None)
    }

    #[tokio::test]
    async fn test_local_user_verify() {
        let verifier = verifier_with("alice", "hunter2secret", false);

        let name = verifier.verify("alice", "hunter2secret").await.unwrap();
        assert_eq!(name, "alice");

        let err = verifier.verify("alice", "wrong").await.unwrap_err();
        assert!(matches!(err, VerifyError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_unknown_user_without_directory() {
        let verifier = verifier_with("alice", "hunter2secret", false);
        let err = verifier.verify("mallory", "anything").await.unwrap_err();
        assert!(matches!(err, VerifyError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_empty_credentials_rejected() {
        let verifier = verifier_with("alice", "hunter2secret", false);
        assert!(verifier.verify("", "x").await.is_err());
        assert!(verifier.verify("alice", "").await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_hash_rejected() {
        let mut users = HashMap::new();
        users.insert(
            "broken".to_string(),
            LocalUser {
                password_hash: "not-a-bcrypt-hash".to_string(),
                admin: false,
                created_at: None,
            },
        );
        let verifier = IdentityVerifier::new(users, None);
        let err = verifier.verify("broken", "whatever").await.unwrap_err();
        assert!(matches!(err, VerifyError::InvalidCredentials));
    }

    #[test]
    fn test_admin_flag() {
        let verifier = verifier_with("root", "s3cretss3crets", true);
        assert!(verifier.is_admin("root"));
        assert!(!verifier.is_admin("alice"));
    }

    #[test]
    fn test_auth_file_parse() {
        let raw = r#"
            session_timeout_hours = 12

            [users.alice]
            password_hash = "$2b$12$abcdefghijklmnopqrstuv"
            admin = true
        "#;
        let parsed: AuthFile = toml::from_str(raw).unwrap();
        assert_eq!(parsed.session_timeout_hours(), 12);
        assert!(parsed.users.get("alice").unwrap().admin);
        assert!(parsed.directory.is_none());
    }
}
