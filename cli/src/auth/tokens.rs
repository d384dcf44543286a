//! Token types for authentication.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrbitError, Result};

/// Slack applied when deciding whether a cached access token is still usable.
pub fn token_expiry_slack() -> Duration {
    Duration::minutes(2)
}

/// The persisted credential unit for one profile.
///
/// Besides the tokens themselves, a record carries the provenance of the
/// exchange (issuer, client, endpoints) so it can be refreshed later without
/// re-running discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    /// The access token.
    pub access_token: String,
    /// The refresh token, when the flow issued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Token type (usually "Bearer").
    pub token_type: String,
    /// When the access token expires. `None` means it does not expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    /// Granted scopes, in the order the provider reported them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    /// OIDC ID token. Only used to derive display identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_endpoint: Option<String>,
}

impl TokenData {
    /// Creates a record with just an access token and type.
    pub fn new(access_token: impl Into<String>, token_type: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: token_type.into(),
            expiry: None,
            scopes: Vec::new(),
            id_token: None,
            issuer: None,
            client_id: None,
            audience: None,
            token_endpoint: None,
            device_endpoint: None,
        }
    }

    /// Sets the expiry from a relative lifetime in seconds, as reported by
    /// `expires_in`. Zero lifetimes, and lifetimes too large to represent as
    /// a timestamp, leave the expiry unset.
    #[must_use]
    pub fn expiring_in(mut self, expires_in: Option<u64>) -> Self {
        self.expiry = expires_in
            .filter(|secs| *secs > 0)
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime));
        self
    }

    /// Serializes the record as indented JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses a record previously written by [`to_json`](Self::to_json).
    ///
    /// Unparseable data is reported as [`OrbitError::InvalidCredentials`].
    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| {
            tracing::debug!(error = %e, "stored token record is not valid JSON");
            OrbitError::InvalidCredentials
        })
    }

    /// Check if the access token is expired, treating it as expired `slack`
    /// before the stored expiry. Records without an expiry never expire.
    #[must_use]
    pub fn is_expired(&self, slack: Duration) -> bool {
        self.is_expired_at(Utc::now(), slack)
    }

    /// Same as [`is_expired`](Self::is_expired) against a fixed `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>, slack: Duration) -> bool {
        self.expiry.is_some_and(|exp| now + slack > exp)
    }

    /// Check if the token can be refreshed.
    #[must_use]
    pub fn has_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Minimal sanity check before persisting.
    pub fn validate(&self) -> Result<()> {
        if self.access_token.is_empty() {
            return Err(OrbitError::InvalidToken("access token is empty".to_string()));
        }
        if self.token_type.is_empty() {
            return Err(OrbitError::InvalidToken("token type is empty".to_string()));
        }
        if self.refresh_token.as_deref() == Some("") {
            return Err(OrbitError::InvalidToken("refresh token is empty".to_string()));
        }
        Ok(())
    }
}

/// Splits a space-delimited `scope` value into an ordered list.
pub fn split_scopes(scope: &str) -> Vec<String> {
    scope.split_whitespace().map(String::from).collect()
}
