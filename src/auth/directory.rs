//! Directory-service authentication (bind, search, optional group check,
//! bind as the user).

use std::time::Duration;

use ldap3::{drive, ldap_escape, LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use serde::Deserialize;

use super::users::VerifyError;

/// Directory-service connection and search settings, from the auth file's
/// `[directory]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Whether the directory path is consulted at all.
    pub enabled: bool,
    /// Server URL (`ldap://` or `ldaps://`).
    pub url: String,
    /// Service account DN used for the initial bind.
    pub bind_dn: String,
    /// Service account password.
    pub bind_password: String,
    /// Base DN for the user search.
    pub search_base: String,
    /// User search filter; must contain exactly one `{username}`.
    pub search_filter: String,
    /// When non-empty, membership in this group is required.
    pub required_group_dn: String,
    /// Base DN for the group search; falls back to `search_base`.
    pub group_search_base: String,
    /// Group filter; must contain exactly one `{user_dn}`.
    pub group_search_filter: String,
    /// Timeout applied to each network step.
    pub timeout_secs: u64,
    /// Upgrade plain connections with StartTLS.
    pub starttls: bool,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            bind_dn: String::new(),
            bind_password: String::new(),
            search_base: String::new(),
            search_filter: "(uid={username})".to_string(),
            required_group_dn: String::new(),
            group_search_base: String::new(),
            group_search_filter: "(&(objectClass=groupOfNames)(member={user_dn}))".to_string(),
            timeout_secs: 10,
            starttls: false,
        }
    }
}

impl DirectoryConfig {
    /// Reject filter templates with a missing or repeated placeholder. A
    /// filter without the placeholder would match the same entry for every
    /// username; a group filter without `{user_dn}` would make the group
    /// check vacuous.
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        if self.url.is_empty() {
            return Err("directory.url is required".to_string());
        }

        let user_subs = self.search_filter.matches("{username}").count();
        if user_subs != 1 {
            return Err(format!(
                "search_filter must contain exactly one {{username}} placeholder, found {}",
                user_subs
            ));
        }

        if !self.required_group_dn.is_empty() {
            let dn_subs = self.group_search_filter.matches("{user_dn}").count();
            if dn_subs != 1 {
                return Err(format!(
                    "group_search_filter must contain exactly one {{user_dn}} placeholder, found {}",
                    dn_subs
                ));
            }
        }

        Ok(())
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    fn settings(&self) -> LdapConnSettings {
        LdapConnSettings::new()
            .set_conn_timeout(self.timeout())
            .set_starttls(self.starttls)
    }
}

/// Authenticate `username`/`password` via the directory.
///
/// Connection and service-bind failures are `Unavailable` (the caller may
/// retry); a missing user, failed group check, or failed user bind is
/// `InvalidCredentials` (final).
pub async fn authenticate(
    cfg: &DirectoryConfig,
    username: &str,
    password: &str,
) -> Result<(), VerifyError> {
    let unavailable = |step: &str, e: ldap3::LdapError| {
        VerifyError::Unavailable(format!("{}: {}", step, e))
    };

    let (conn, mut ldap) = LdapConnAsync::with_settings(cfg.settings(), &cfg.url)
        .await
        .map_err(|e| unavailable("connect", e))?;
    drive!(conn);

    ldap.with_timeout(cfg.timeout())
        .simple_bind(&cfg.bind_dn, &cfg.bind_password)
        .await
        .map_err(|e| unavailable("service bind", e))?
        .success()
        .map_err(|e| unavailable("service bind", e))?;

    let filter = cfg
        .search_filter
        .replace("{username}", &ldap_escape(username));
    let (entries, _) = ldap
        .with_timeout(cfg.timeout())
        .search(&cfg.search_base, Scope::Subtree, &filter, vec!["dn"])
        .await
        .map_err(|e| unavailable("user search", e))?
        .success()
        .map_err(|e| unavailable("user search", e))?;

    let count = entries.len();
    let mut entries = entries.into_iter();
    let user_dn = match (entries.next(), count) {
        (Some(entry), 1) => SearchEntry::construct(entry).dn,
        _ => {
            log::info!(
                "directory lookup for '{}' matched {} entries",
                username,
                count
            );
            let _ = ldap.unbind().await;
            return Err(VerifyError::InvalidCredentials);
        }
    };

    if !cfg.required_group_dn.is_empty() {
        let group_base = if cfg.group_search_base.is_empty() {
            &cfg.search_base
        } else {
            &cfg.group_search_base
        };
        let group_filter = cfg
            .group_search_filter
            .replace("{user_dn}", &ldap_escape(&user_dn));

        let (groups, _) = ldap
            .with_timeout(cfg.timeout())
            .search(group_base, Scope::Subtree, &group_filter, vec!["dn"])
            .await
            .map_err(|e| unavailable("group search", e))?
            .success()
            .map_err(|e| unavailable("group search", e))?;

        if groups.is_empty() {
            log::info!(
                "directory user '{}' is not a member of required group '{}'",
                username,
                cfg.required_group_dn
            );
            let _ = ldap.unbind().await;
            return Err(VerifyError::InvalidCredentials);
        }
    }

    let _ = ldap.unbind().await;

    // Fresh connection for the user bind so the service bind cannot leak
    // into it.
    let (conn, mut user_ldap) = LdapConnAsync::with_settings(cfg.settings(), &cfg.url)
        .await
        .map_err(|e| unavailable("connect", e))?;
    drive!(conn);

    let bind = user_ldap
        .with_timeout(cfg.timeout())
        .simple_bind(&user_dn, password)
        .await
        .map_err(|e| unavailable("user bind", e))?;
    let _ = user_ldap.unbind().await;

    match bind.success() {
        Ok(_) => {
            log::info!("directory authentication successful for '{}'", username);
            Ok(())
        }
        Err(_) => {
            log::info!("directory authentication failed for '{}'", username);
            Err(VerifyError::InvalidCredentials)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_config() -> DirectoryConfig {
        DirectoryConfig {
            enabled: true,
            url: "ldaps://directory.example.com".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_filters_validate() {
        let cfg = enabled_config();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_disabled_config_skips_validation() {
        let cfg = DirectoryConfig {
            search_filter: "(uid=*)".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_filter_without_placeholder_rejected() {
        let cfg = DirectoryConfig {
            search_filter: "(uid=admin)".to_string(),
            ..enabled_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_filter_with_repeated_placeholder_rejected() {
        let cfg = DirectoryConfig {
            search_filter: "(|(uid={username})(cn={username}))".to_string(),
            ..enabled_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_group_filter_validated_only_with_required_group() {
        let mut cfg = DirectoryConfig {
            group_search_filter: "(member=someone)".to_string(),
            ..enabled_config()
        };
        assert!(cfg.validate().is_ok());

        cfg.required_group_dn = "cn=terminal-users,ou=groups".to_string();
        assert!(cfg.validate().is_err());
    }
}
