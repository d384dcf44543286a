//! Application configuration settings.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::identity::AdminHint;
use crate::auth::oidc::{ensure_default_scopes, OidcConfig};
use crate::auth::store::DEFAULT_PROFILE;
use crate::error::{OrbitError, Result};

/// Main configuration for orbit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrbitConfig {
    /// Authentication settings shared by all profiles.
    pub auth: AuthSettings,
    /// Per-profile identity provider settings.
    pub profiles: BTreeMap<String, ProfileAuth>,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Profile used when none is given on the command line.
    pub default_profile: String,
    /// Skip the OS keyring and keep tokens in the token directory.
    pub disable_keyring: bool,
    /// Local port the login callback listener binds.
    pub callback_port: u16,
    /// Path the identity provider redirects to.
    pub callback_path: String,
    /// How long to wait for the browser redirect, in seconds.
    pub login_timeout_secs: u64,
    /// Timeout for identity provider requests, in seconds.
    pub http_timeout_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            default_profile: DEFAULT_PROFILE.to_string(),
            disable_keyring: false,
            callback_port: 8000,
            callback_path: "/callback".to_string(),
            login_timeout_secs: 300,
            http_timeout_secs: 30,
        }
    }
}

impl AuthSettings {
    /// Redirect URL registered with the identity provider.
    pub fn redirect_url(&self) -> String {
        format!(
            "http://localhost:{}{}",
            self.callback_port, self.callback_path
        )
    }

    pub const fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub const fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Identity provider settings for one profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProfileAuth {
    /// OIDC issuer URL.
    pub issuer: Option<String>,
    /// OAuth client ID.
    pub client_id: Option<String>,
    /// Client secret, for confidential clients only.
    pub client_secret: Option<String>,
    /// API audience requested alongside the scopes.
    pub audience: Option<String>,
    /// Requested scopes. `openid profile email` are always included.
    pub scopes: Vec<String>,
    /// Group claim that marks administrators.
    pub admin_group: Option<String>,
    /// Comma-separated administrator emails.
    pub admin_emails: Option<String>,
}

impl ProfileAuth {
    /// Checks the settings and produces the client configuration.
    ///
    /// Fails before any network call when the issuer or client ID is missing.
    pub fn oidc_config(&self, settings: &AuthSettings) -> Result<OidcConfig> {
        let issuer = non_empty(self.issuer.as_deref()).ok_or_else(|| {
            OrbitError::Config(
                "OIDC issuer is not configured. Set 'issuer' for the profile or ORBIT_OIDC_ISSUER."
                    .to_string(),
            )
        })?;
        Url::parse(issuer)
            .map_err(|e| OrbitError::Config(format!("Invalid OIDC issuer '{issuer}': {e}")))?;
        let client_id = non_empty(self.client_id.as_deref()).ok_or_else(|| {
            OrbitError::Config(
                "OIDC client ID is not configured. Set 'client_id' for the profile or ORBIT_OIDC_CLIENT_ID."
                    .to_string(),
            )
        })?;

        Ok(OidcConfig {
            issuer: issuer.to_string(),
            client_id: client_id.to_string(),
            client_secret: non_empty(self.client_secret.as_deref()).map(String::from),
            audience: non_empty(self.audience.as_deref()).map(String::from),
            redirect_url: settings.redirect_url(),
            scopes: ensure_default_scopes(&self.scopes),
            admin: self.admin_hint(),
        })
    }

    /// Rule for the administrator display flag.
    pub fn admin_hint(&self) -> AdminHint {
        AdminHint::new(
            self.admin_group.clone(),
            self.admin_emails.as_deref().unwrap_or_default(),
        )
    }
}

/// Environment variables that can override configuration.
pub mod env {
    pub const PROFILE: &str = "ORBIT_PROFILE";
    pub const DISABLE_KEYRING: &str = "ORBIT_DISABLE_KEYRING";
    pub const OIDC_ISSUER: &str = "ORBIT_OIDC_ISSUER";
    pub const OIDC_CLIENT_ID: &str = "ORBIT_OIDC_CLIENT_ID";
    pub const OIDC_CLIENT_SECRET: &str = "ORBIT_OIDC_CLIENT_SECRET";
    pub const OIDC_AUDIENCE: &str = "ORBIT_OIDC_AUDIENCE";
    pub const ADMIN_EMAILS: &str = "ORBIT_ADMIN_EMAILS";
    pub const ADMIN_GROUP: &str = "ORBIT_ADMIN_GROUP";
    pub const LOG_LEVEL: &str = "ORBIT_LOG";
}

impl OrbitConfig {
    /// Apply environment variable overrides to the configuration.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    #[must_use]
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(profile) = lookup(env::PROFILE).filter(|p| !p.is_empty()) {
            self.auth.default_profile = profile;
        }

        if let Some(disabled) = lookup(env::DISABLE_KEYRING) {
            let disabled = disabled.trim().to_lowercase();
            self.auth.disable_keyring = disabled == "1" || disabled == "true";
        }

        let name = self.auth.default_profile.clone();
        let overrides = [
            env::OIDC_ISSUER,
            env::OIDC_CLIENT_ID,
            env::OIDC_CLIENT_SECRET,
            env::OIDC_AUDIENCE,
            env::ADMIN_EMAILS,
            env::ADMIN_GROUP,
        ]
        .map(|key| lookup(key).filter(|v| !v.is_empty()));
        if overrides.iter().all(Option::is_none) {
            return self;
        }

        let [issuer, client_id, client_secret, audience, admin_emails, admin_group] = overrides;
        let profile = self.profiles.entry(name).or_default();
        if issuer.is_some() {
            profile.issuer = issuer;
        }
        if client_id.is_some() {
            profile.client_id = client_id;
        }
        if client_secret.is_some() {
            profile.client_secret = client_secret;
        }
        if audience.is_some() {
            profile.audience = audience;
        }
        if admin_emails.is_some() {
            profile.admin_emails = admin_emails;
        }
        if admin_group.is_some() {
            profile.admin_group = admin_group;
        }

        self
    }

    /// Resolves the profile name to operate on.
    pub fn profile_name(&self, flag: Option<&str>) -> String {
        match flag.filter(|p| !p.is_empty()) {
            Some(name) => name.to_string(),
            None if self.auth.default_profile.is_empty() => DEFAULT_PROFILE.to_string(),
            None => self.auth.default_profile.clone(),
        }
    }

    /// Identity provider settings for `name`; empty when not configured.
    pub fn profile(&self, name: &str) -> ProfileAuth {
        self.profiles.get(name).cloned().unwrap_or_default()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = AuthSettings::default();
        assert_eq!(settings.redirect_url(), "http://localhost:8000/callback");
        assert_eq!(settings.login_timeout(), Duration::from_secs(300));
        assert!(!settings.disable_keyring);
    }

    #[test]
    fn parses_profiles_from_toml() {
        let config: OrbitConfig = toml::from_str(
            r#"
            [auth]
            default_profile = "staging"
            callback_port = 9123

            [profiles.staging]
            issuer = "https://idp.example.com/"
            client_id = "orbit-cli"
            scopes = ["offline_access"]
            admin_emails = "ops@example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.profile_name(None), "staging");
        assert_eq!(config.profile_name(Some("prod")), "prod");
        let profile = config.profile("staging");
        assert_eq!(profile.client_id.as_deref(), Some("orbit-cli"));

        let oidc = profile.oidc_config(&config.auth).unwrap();
        assert_eq!(oidc.redirect_url, "http://localhost:9123/callback");
        assert_eq!(
            oidc.scopes,
            vec!["openid", "profile", "email", "offline_access"]
        );
    }

    #[test]
    fn missing_issuer_or_client_is_a_config_error() {
        let settings = AuthSettings::default();
        let no_issuer = ProfileAuth {
            client_id: Some("cli".to_string()),
            ..ProfileAuth::default()
        };
        assert!(matches!(
            no_issuer.oidc_config(&settings),
            Err(OrbitError::Config(_))
        ));

        let no_client = ProfileAuth {
            issuer: Some("https://idp.example.com".to_string()),
            client_id: Some("  ".to_string()),
            ..ProfileAuth::default()
        };
        assert!(matches!(
            no_client.oidc_config(&settings),
            Err(OrbitError::Config(_))
        ));

        let bad_issuer = ProfileAuth {
            issuer: Some("not a url".to_string()),
            client_id: Some("cli".to_string()),
            ..ProfileAuth::default()
        };
        assert!(matches!(
            bad_issuer.oidc_config(&settings),
            Err(OrbitError::Config(_))
        ));
    }

    #[test]
    fn env_overrides_target_active_profile() {
        let config = OrbitConfig::default().apply_overrides(lookup(&[
            (env::PROFILE, "ci"),
            (env::OIDC_ISSUER, "https://idp.example.com"),
            (env::OIDC_CLIENT_ID, "orbit"),
            (env::DISABLE_KEYRING, "TRUE"),
        ]));

        assert_eq!(config.auth.default_profile, "ci");
        assert!(config.auth.disable_keyring);
        let profile = config.profile("ci");
        assert_eq!(profile.issuer.as_deref(), Some("https://idp.example.com"));
        assert_eq!(profile.client_id.as_deref(), Some("orbit"));
        assert!(config.profiles.get(DEFAULT_PROFILE).is_none());
    }

    #[test]
    fn env_overrides_keep_unset_fields() {
        let mut config = OrbitConfig::default();
        config.profiles.insert(
            DEFAULT_PROFILE.to_string(),
            ProfileAuth {
                issuer: Some("https://file.example.com".to_string()),
                client_id: Some("from-file".to_string()),
                ..ProfileAuth::default()
            },
        );

        let config = config.apply_overrides(lookup(&[(env::OIDC_CLIENT_ID, "from-env")]));
        let profile = config.profile(DEFAULT_PROFILE);
        assert_eq!(profile.issuer.as_deref(), Some("https://file.example.com"));
        assert_eq!(profile.client_id.as_deref(), Some("from-env"));
    }

    #[test]
    fn no_overrides_leave_profiles_alone() {
        let config = OrbitConfig::default().apply_overrides(|_| None);
        assert!(config.profiles.is_empty());
        assert_eq!(config.profile_name(None), DEFAULT_PROFILE);
    }
}
