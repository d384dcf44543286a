//! Error types and result aliases for orbit.
//!
//! This module provides the error taxonomy for the authentication core:
//! - Configuration errors, reported before any network call
//! - Protocol errors from the identity provider, never retried automatically
//! - Terminal flow outcomes (expired device code, denied access, CSRF mismatch)
//! - Storage errors, with a distinguished not-found kind
//! - Cancellation, kept apart so callers can suppress error chrome

use thiserror::Error;

/// Main error type for orbit operations.
///
/// Each variant includes a user-friendly message with actionable recovery steps.
/// Use [`requires_reauth`](Self::requires_reauth), [`is_retriable`](Self::is_retriable)
/// and [`is_cancelled`](Self::is_cancelled) to decide how to report a failure.
#[derive(Error, Debug)]
pub enum OrbitError {
    /// No token record is stored for the profile.
    #[error("Not logged in to profile '{profile}'. Run 'orbit auth login' to authenticate.")]
    TokenNotFound {
        /// The profile that was looked up.
        profile: String,
    },

    /// The access token expired and cannot be refreshed silently.
    #[error("Your session has expired. Run 'orbit auth login' to re-authenticate.")]
    AuthenticationRequired,

    /// Stored credentials are malformed or corrupted.
    #[error("Invalid credentials. Your stored credentials may be corrupted. Try 'orbit auth logout' then 'orbit auth login'.")]
    InvalidCredentials,

    /// A token record failed validation before being persisted.
    #[error("Refusing to store invalid token: {0}")]
    InvalidToken(String),

    /// The identity provider reported an error on the authorization redirect.
    #[error("Authorization failed: {0}. Run 'orbit auth login' to try again.")]
    AuthorizationFailed(String),

    /// Token refresh request failed.
    #[error("Token refresh failed. Run 'orbit auth login' to re-authenticate. Details: {0}")]
    TokenRefreshFailed(String),

    /// Device authorization code expired before user completed authentication.
    #[error("Device code expired before approval. Please run 'orbit auth login' again and complete authorization within the time limit.")]
    DeviceAuthorizationExpired,

    /// User denied the authorization request.
    #[error(
        "Authorization was denied. If this was unintentional, run 'orbit auth login' to try again."
    )]
    AccessDenied,

    /// The `state` echoed on the redirect did not match the one we generated.
    #[error("Login response did not match this login attempt (state mismatch). Run 'orbit auth login' to start over.")]
    StateMismatch,

    /// No redirect arrived at the local callback listener in time.
    #[error("Timed out waiting for the browser to complete login. Run 'orbit auth login' to try again.")]
    CallbackTimeout,

    /// The fixed callback port is already bound.
    #[error("Cannot listen on localhost:{port}; another login may be in progress.")]
    CallbackPortInUse {
        /// The port that could not be bound.
        port: u16,
    },

    /// The identity provider answered with something we could not use.
    #[error("Identity provider error at {endpoint}: {message}")]
    Protocol {
        /// The endpoint that produced the response.
        endpoint: String,
        /// What was wrong with it.
        message: String,
    },

    /// Request timed out.
    #[error("Request timed out. The identity provider may be slow or unreachable. Try again later.")]
    Timeout,

    /// Network error during HTTP request.
    #[error("Network error: {0}. Check your internet connection.")]
    Network(String),

    /// Failed to access the OS keyring.
    #[error("Failed to access credential storage: {0}. Ensure your system keyring is unlocked.")]
    CredentialStorage(String),

    /// General configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to read configuration file.
    #[error("Failed to read configuration file: {0}. Check file permissions and format.")]
    ConfigRead(String),

    /// The operator interrupted the flow.
    #[error("Login cancelled.")]
    Cancelled,

    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON or TOML serialization/deserialization failed.
    #[error("Data serialization error: {0}. This may indicate corrupted data.")]
    Serialization(String),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl OrbitError {
    /// Builds a [`OrbitError::Protocol`] for the given endpoint.
    pub fn protocol(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Checks if this error can be resolved by re-authenticating.
    ///
    /// Returns `true` for errors related to missing, expired, or invalid credentials,
    /// and for terminal login outcomes that require restarting `orbit auth login`.
    #[must_use]
    pub const fn requires_reauth(&self) -> bool {
        matches!(
            self,
            Self::TokenNotFound { .. }
                | Self::AuthenticationRequired
                | Self::InvalidCredentials
                | Self::TokenRefreshFailed(_)
                | Self::DeviceAuthorizationExpired
                | Self::AccessDenied
                | Self::StateMismatch
        )
    }

    /// Checks if this error is transient and the operation might succeed on retry.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }

    /// Checks if the operator interrupted the operation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Checks if no token is stored for the requested profile.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::TokenNotFound { .. })
    }
}

/// Result type alias using [`OrbitError`].
pub type Result<T> = std::result::Result<T, OrbitError>;

impl From<serde_json::Error> for OrbitError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {err}"))
    }
}

impl From<toml::de::Error> for OrbitError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigRead(format!("TOML parse error: {err}"))
    }
}

impl From<keyring::Error> for OrbitError {
    fn from(err: keyring::Error) -> Self {
        Self::CredentialStorage(err.to_string())
    }
}

impl From<reqwest::Error> for OrbitError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Network(format!("connection failed: {err}"))
        } else {
            Self::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_outcomes_tell_operator_to_restart_login() {
        for err in [
            OrbitError::DeviceAuthorizationExpired,
            OrbitError::AccessDenied,
            OrbitError::StateMismatch,
            OrbitError::CallbackTimeout,
            OrbitError::AuthenticationRequired,
        ] {
            assert!(
                err.to_string().contains("orbit auth login"),
                "missing recovery hint: {err}"
            );
        }
    }

    #[test]
    fn device_expiry_message_is_actionable() {
        let msg = OrbitError::DeviceAuthorizationExpired.to_string();
        assert!(msg.contains("expired before approval"));
    }

    #[test]
    fn protocol_error_includes_endpoint_and_message() {
        let err = OrbitError::protocol("https://idp.example.com/token", "unexpected status 500");
        let msg = err.to_string();
        assert!(msg.contains("https://idp.example.com/token"));
        assert!(msg.contains("unexpected status 500"));
    }

    #[test]
    fn requires_reauth_identifies_auth_errors() {
        assert!(OrbitError::TokenNotFound {
            profile: "default".to_string()
        }
        .requires_reauth());
        assert!(OrbitError::AuthenticationRequired.requires_reauth());
        assert!(OrbitError::InvalidCredentials.requires_reauth());
        assert!(OrbitError::AccessDenied.requires_reauth());
        assert!(OrbitError::StateMismatch.requires_reauth());

        assert!(!OrbitError::Timeout.requires_reauth());
        assert!(!OrbitError::Cancelled.requires_reauth());
        assert!(!OrbitError::Network("test".to_string()).requires_reauth());
    }

    #[test]
    fn is_retriable_identifies_transient_errors() {
        assert!(OrbitError::Timeout.is_retriable());
        assert!(OrbitError::Network("test".to_string()).is_retriable());

        assert!(!OrbitError::AuthenticationRequired.is_retriable());
        assert!(!OrbitError::protocol("token", "bad").is_retriable());
        assert!(!OrbitError::Cancelled.is_retriable());
    }

    #[test]
    fn cancellation_is_distinguished() {
        assert!(OrbitError::Cancelled.is_cancelled());
        assert!(!OrbitError::CallbackTimeout.is_cancelled());
        assert!(!OrbitError::DeviceAuthorizationExpired.is_cancelled());
    }

    #[test]
    fn not_found_is_distinguished_from_storage_failure() {
        let missing = OrbitError::TokenNotFound {
            profile: "ci".to_string(),
        };
        assert!(missing.is_not_found());
        assert!(missing.to_string().contains("'ci'"));
        assert!(!OrbitError::CredentialStorage("locked".to_string()).is_not_found());
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: OrbitError = json_err.into();
        assert!(matches!(err, OrbitError::Serialization(_)));
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: OrbitError = io_err.into();
        assert!(matches!(err, OrbitError::Io(_)));
    }

    #[test]
    fn from_url_parse_error() {
        let url_err = url::Url::parse("not a url").unwrap_err();
        let err: OrbitError = url_err.into();
        assert!(matches!(err, OrbitError::InvalidUrl(_)));
    }
}
