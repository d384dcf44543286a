//! Display identity derived from ID token claims or the userinfo endpoint.
//!
//! Nothing here is an authorization decision. The ID token signature is not
//! verified because the claims are only shown to the operator.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{OrbitError, Result};

/// Who the stored token belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(rename = "sub", default)]
    pub subject: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    /// Computed from [`AdminHint`], never read from the provider.
    #[serde(skip)]
    pub is_admin: bool,
}

impl UserInfo {
    /// Best human-readable label: email, then name, then subject.
    pub fn display_name(&self) -> &str {
        [&self.email, &self.name, &self.subject]
            .into_iter()
            .find(|v| !v.is_empty())
            .map_or("unknown user", String::as_str)
    }

    /// Whether enough claims were present to identify the user.
    pub fn is_known(&self) -> bool {
        !self.subject.is_empty() || !self.email.is_empty()
    }
}

/// Claims as they appear on the wire. `nickname` fills in for a missing name.
#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    email_verified: EmailVerified,
    #[serde(default)]
    name: String,
    #[serde(default)]
    nickname: String,
    #[serde(default)]
    groups: Vec<String>,
}

/// Some providers send `email_verified` as the string `"true"`.
#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum EmailVerified {
    Bool(bool),
    Text(String),
    #[default]
    Missing,
}

impl EmailVerified {
    fn as_bool(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Text(s) => s.eq_ignore_ascii_case("true"),
            Self::Missing => false,
        }
    }
}

impl From<Claims> for UserInfo {
    fn from(claims: Claims) -> Self {
        Self {
            subject: claims.sub,
            email: claims.email,
            email_verified: claims.email_verified.as_bool(),
            name: if claims.name.is_empty() {
                claims.nickname
            } else {
                claims.name
            },
            groups: claims.groups,
            is_admin: false,
        }
    }
}

/// Decodes the payload segment of a compact JWT.
pub fn decode_id_token(id_token: &str) -> Result<UserInfo> {
    let mut segments = id_token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_)) => payload,
        _ => {
            return Err(OrbitError::InvalidToken(
                "ID token is not a compact JWT".to_string(),
            ))
        },
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| OrbitError::InvalidToken(format!("ID token payload is not base64url: {e}")))?;
    let claims: Claims = serde_json::from_slice(&bytes)
        .map_err(|e| OrbitError::InvalidToken(format!("ID token payload is not JSON: {e}")))?;
    Ok(claims.into())
}

/// Parses a userinfo endpoint response body.
pub fn parse_userinfo(body: &[u8]) -> Result<UserInfo> {
    let claims: Claims = serde_json::from_slice(body)?;
    Ok(claims.into())
}

/// Rule for showing the administrator flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminHint {
    group: Option<String>,
    emails: Vec<String>,
}

impl AdminHint {
    /// `emails` is a comma-separated allow-list.
    pub fn new(group: Option<String>, emails: &str) -> Self {
        Self {
            group: group.filter(|g| !g.trim().is_empty()),
            emails: emails
                .split(',')
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn is_admin(&self, user: &UserInfo) -> bool {
        let in_group = self
            .group
            .as_deref()
            .is_some_and(|group| user.groups.iter().any(|g| g == group));
        let email = user.email.trim().to_lowercase();
        in_group || (!email.is_empty() && self.emails.contains(&email))
    }

    /// Sets `user.is_admin` according to this hint.
    pub fn apply(&self, mut user: UserInfo) -> UserInfo {
        user.is_admin = self.is_admin(&user);
        user
    }
}

#[cfg(test)]
pub(crate) fn encode_test_id_token(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.signature")
}
