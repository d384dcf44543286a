//! OAuth device authorization flow implementation (RFC 8628).
//!
//! Polling is an explicit state machine. Each token endpoint response is
//! classified into a [`PollResponse`], and [`transition`] maps the current
//! interval and that response to the next [`PollState`]. Time goes through a
//! [`PollClock`] so the backoff schedule can be tested without sleeping.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::oidc::{OidcConfig, ProviderMetadata};
use crate::auth::tokens::{split_scopes, TokenData};
use crate::error::{OrbitError, Result};

/// Grant type for exchanging a device code.
pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Polling interval used when the provider does not suggest one.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Added to the interval on every `slow_down`.
pub const SLOW_DOWN_INCREMENT: Duration = Duration::from_secs(5);

/// Upper bound on how long polling honours a device code, whatever
/// `expires_in` the provider reports.
pub const MAX_DEVICE_CODE_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Scope that asks the provider for a refresh token.
const OFFLINE_ACCESS: &str = "offline_access";

/// Endpoints and identifiers the device flow needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFlowConfig {
    pub client_id: String,
    pub audience: Option<String>,
    pub scopes: Vec<String>,
    pub device_endpoint: String,
    pub token_endpoint: String,
    pub issuer: Option<String>,
}

impl DeviceFlowConfig {
    /// Combines profile settings with discovered endpoints.
    ///
    /// Fails when the provider does not advertise a device authorization
    /// endpoint.
    pub fn from_provider(config: &OidcConfig, metadata: &ProviderMetadata) -> Result<Self> {
        let device_endpoint = metadata.device_authorization_endpoint.clone().ok_or_else(|| {
            OrbitError::Config(format!(
                "{} does not support the device authorization grant. Run 'orbit auth login' without --device.",
                config.issuer
            ))
        })?;

        let mut scopes = config.scopes.clone();
        if !scopes.iter().any(|s| s == OFFLINE_ACCESS) {
            scopes.push(OFFLINE_ACCESS.to_string());
        }

        Ok(Self {
            client_id: config.client_id.clone(),
            audience: config.audience.clone(),
            scopes,
            device_endpoint,
            token_endpoint: metadata.token_endpoint.clone(),
            issuer: Some(metadata.issuer.clone()),
        })
    }

    fn require_client(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(OrbitError::Config(
                "OIDC client ID is not configured.".to_string(),
            ));
        }
        Ok(())
    }

    fn scope_param(&self) -> Option<String> {
        (!self.scopes.is_empty()).then(|| self.scopes.join(" "))
    }
}

/// Response from initiating device authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCode {
    pub device_code: String,
    /// Code for the user to enter.
    pub user_code: String,
    /// URL for the user to visit.
    pub verification_uri: String,
    /// Complete URL with code (if available).
    pub verification_uri_complete: Option<String>,
    /// How long until the code expires.
    pub expires_in: Duration,
    /// Initial polling interval.
    pub interval: Duration,
}

impl DeviceCode {
    /// The URL to show or open, preferring the one with the code embedded.
    pub fn browser_url(&self) -> &str {
        self.verification_uri_complete
            .as_deref()
            .unwrap_or(&self.verification_uri)
    }
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    #[serde(alias = "verification_url")]
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    #[serde(default)]
    expires_in: i64,
    #[serde(default)]
    interval: Option<i64>,
}

/// Successful token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn lifetime(&self) -> Option<u64> {
        self.expires_in.and_then(|secs| u64::try_from(secs).ok())
    }

    fn token_type(&self) -> String {
        self.token_type
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Bearer".to_string())
    }
}

/// Error body from the token endpoint (RFC 6749 section 5.2).
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// One classified answer from the token endpoint.
#[derive(Debug)]
pub enum PollResponse {
    Granted(TokenData),
    Pending,
    SlowDown,
    Expired,
    Denied,
    /// Any other error code or an unusable response.
    Failed(OrbitError),
    /// The request never got an answer.
    Unreachable(String),
}

/// Where the poll loop stands after a response.
#[derive(Debug)]
pub enum PollState {
    Pending { interval: Duration },
    SlowDown { interval: Duration },
    Approved(TokenData),
    Denied,
    Expired,
    Failed(OrbitError),
}

/// Computes the next state from the current interval and a response.
pub fn transition(interval: Duration, response: PollResponse) -> PollState {
    match response {
        PollResponse::Pending => PollState::Pending { interval },
        PollResponse::Unreachable(reason) => {
            tracing::warn!(%reason, "device token request failed; retrying");
            PollState::Pending { interval }
        },
        PollResponse::SlowDown => PollState::SlowDown {
            interval: interval.saturating_add(SLOW_DOWN_INCREMENT),
        },
        PollResponse::Granted(token) => PollState::Approved(token),
        PollResponse::Expired => PollState::Expired,
        PollResponse::Denied => PollState::Denied,
        PollResponse::Failed(err) => PollState::Failed(err),
    }
}

/// Time source for the poll loop.
#[async_trait]
pub trait PollClock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation backed by tokio timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl PollClock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Client for the device authorization grant.
pub struct DeviceFlowClient {
    http: reqwest::Client,
    config: DeviceFlowConfig,
}

impl DeviceFlowClient {
    pub fn new(http: reqwest::Client, config: DeviceFlowConfig) -> Self {
        Self { http, config }
    }

    /// Start the device authorization flow.
    ///
    /// Returns the verification URL and user code for the user to complete
    /// authentication.
    pub async fn start_device_authorization(&self) -> Result<DeviceCode> {
        self.config.require_client()?;
        let endpoint = &self.config.device_endpoint;
        if endpoint.is_empty() {
            return Err(OrbitError::Config(
                "Device authorization endpoint is not configured.".to_string(),
            ));
        }

        let mut form = vec![("client_id", self.config.client_id.clone())];
        if let Some(scope) = self.config.scope_param() {
            form.push(("scope", scope));
        }
        if let Some(audience) = &self.config.audience {
            form.push(("audience", audience.clone()));
        }

        let response = self.http.post(endpoint).form(&form).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(OrbitError::protocol(endpoint, error_snippet(status, &body)));
        }

        let parsed: DeviceCodeResponse = serde_json::from_str(&body).map_err(|e| {
            OrbitError::protocol(endpoint, format!("malformed device authorization response: {e}"))
        })?;

        let interval = parsed
            .interval
            .and_then(|secs| u64::try_from(secs).ok())
            .filter(|secs| *secs > 0)
            .map_or(DEFAULT_INTERVAL, Duration::from_secs);
        let code = DeviceCode {
            device_code: parsed.device_code,
            user_code: parsed.user_code,
            verification_uri: parsed.verification_uri,
            verification_uri_complete: parsed.verification_uri_complete.filter(|u| !u.is_empty()),
            expires_in: Duration::from_secs(u64::try_from(parsed.expires_in).unwrap_or(0)),
            interval,
        };
        tracing::debug!(
            expires_in = code.expires_in.as_secs(),
            interval = code.interval.as_secs(),
            "device authorization started"
        );
        Ok(code)
    }

    /// Poll for token completion.
    ///
    /// Sleeps the current interval between attempts until the user approves
    /// or denies the request, the device code expires, or `cancel` fires.
    pub async fn poll_token(
        &self,
        code: &DeviceCode,
        clock: &dyn PollClock,
        cancel: &CancellationToken,
    ) -> Result<TokenData> {
        self.config.require_client()?;
        if self.config.token_endpoint.is_empty() {
            return Err(OrbitError::Config(
                "Token endpoint is not configured.".to_string(),
            ));
        }

        let lifetime = code.expires_in.min(MAX_DEVICE_CODE_LIFETIME);
        let deadline = clock
            .now()
            .checked_add(lifetime)
            .ok_or(OrbitError::DeviceAuthorizationExpired)?;
        let mut interval = if code.interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            code.interval
        };

        loop {
            if clock.now() >= deadline {
                tracing::debug!("device code expired while polling");
                return Err(OrbitError::DeviceAuthorizationExpired);
            }

            let response = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(OrbitError::Cancelled),
                response = self.exchange_device_code(&code.device_code) => response,
            };

            match transition(interval, response) {
                PollState::Pending { interval: next } => interval = next,
                PollState::SlowDown { interval: next } => {
                    tracing::debug!(interval = next.as_secs(), "provider asked to slow down");
                    interval = next;
                },
                PollState::Approved(token) => return Ok(self.stamp(token)),
                PollState::Denied => return Err(OrbitError::AccessDenied),
                PollState::Expired => return Err(OrbitError::DeviceAuthorizationExpired),
                PollState::Failed(err) => return Err(err),
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(OrbitError::Cancelled),
                () = clock.sleep(interval) => {},
            }
        }
    }

    async fn exchange_device_code(&self, device_code: &str) -> PollResponse {
        let endpoint = &self.config.token_endpoint;
        let mut form = vec![
            ("grant_type", DEVICE_CODE_GRANT.to_string()),
            ("device_code", device_code.to_string()),
            ("client_id", self.config.client_id.clone()),
        ];
        if let Some(audience) = &self.config.audience {
            form.push(("audience", audience.clone()));
        }
        if let Some(scope) = self.config.scope_param() {
            form.push(("scope", scope));
        }

        let response = match self.http.post(endpoint).form(&form).send().await {
            Ok(response) => response,
            Err(e) => return PollResponse::Unreachable(e.to_string()),
        };
        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return PollResponse::Unreachable(e.to_string()),
        };

        if status.is_success() {
            return match serde_json::from_str::<TokenResponse>(&body) {
                Ok(token) => PollResponse::Granted(token_data(token)),
                Err(e) => PollResponse::Failed(OrbitError::protocol(
                    endpoint,
                    format!("malformed token response: {e}"),
                )),
            };
        }

        let Ok(error) = serde_json::from_str::<TokenErrorResponse>(&body) else {
            return PollResponse::Failed(OrbitError::protocol(
                endpoint,
                format!("unexpected token error: {status}"),
            ));
        };
        match error.error.as_str() {
            "authorization_pending" => PollResponse::Pending,
            "slow_down" => PollResponse::SlowDown,
            "expired_token" => PollResponse::Expired,
            "access_denied" => PollResponse::Denied,
            _ => {
                let message = error
                    .error_description
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty())
                    .unwrap_or(error.error);
                PollResponse::Failed(OrbitError::protocol(endpoint, message))
            },
        }
    }

    fn stamp(&self, mut token: TokenData) -> TokenData {
        token.device_endpoint = Some(self.config.device_endpoint.clone());
        token.token_endpoint = Some(self.config.token_endpoint.clone());
        token.client_id = Some(self.config.client_id.clone());
        token.audience.clone_from(&self.config.audience);
        token.issuer.clone_from(&self.config.issuer);
        if token.scopes.is_empty() {
            token.scopes.clone_from(&self.config.scopes);
        }
        token
    }
}

/// Exchanges the refresh token on `current` using the endpoint and client
/// recorded when it was issued.
///
/// A refresh token or ID token the provider does not rotate is kept.
pub async fn refresh_token(http: &reqwest::Client, current: &TokenData) -> Result<TokenData> {
    let endpoint = current
        .token_endpoint
        .as_deref()
        .filter(|e| !e.is_empty())
        .ok_or_else(|| OrbitError::TokenRefreshFailed("token endpoint is not recorded".to_string()))?;
    let refresh = current
        .refresh_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or(OrbitError::AuthenticationRequired)?;
    let client_id = current
        .client_id
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| OrbitError::TokenRefreshFailed("client ID is not recorded".to_string()))?;

    let mut form = vec![
        ("grant_type", "refresh_token".to_string()),
        ("refresh_token", refresh.to_string()),
        ("client_id", client_id.to_string()),
    ];
    if let Some(audience) = current.audience.as_deref().filter(|a| !a.is_empty()) {
        form.push(("audience", audience.to_string()));
    }
    if !current.scopes.is_empty() {
        form.push(("scope", current.scopes.join(" ")));
    }

    let response = http.post(endpoint).form(&form).send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(OrbitError::protocol(endpoint, error_snippet(status, &body)));
    }
    let parsed: TokenResponse = serde_json::from_str(&body)
        .map_err(|e| OrbitError::protocol(endpoint, format!("malformed refresh response: {e}")))?;

    let mut updated = current.clone().expiring_in(parsed.lifetime());
    updated.token_type = parsed.token_type();
    updated.access_token = parsed.access_token;
    if let Some(refresh) = parsed.refresh_token.filter(|t| !t.is_empty()) {
        updated.refresh_token = Some(refresh);
    }
    if let Some(id_token) = parsed.id_token.filter(|t| !t.is_empty()) {
        updated.id_token = Some(id_token);
    }
    if let Some(scope) = parsed.scope.filter(|s| !s.trim().is_empty()) {
        updated.scopes = split_scopes(&scope);
    }
    Ok(updated)
}

fn token_data(response: TokenResponse) -> TokenData {
    let lifetime = response.lifetime();
    let token_type = response.token_type();
    let mut token = TokenData::new(response.access_token, token_type).expiring_in(lifetime);
    token.refresh_token = response.refresh_token.filter(|t| !t.is_empty());
    token.id_token = response.id_token.filter(|t| !t.is_empty());
    token.scopes = response
        .scope
        .as_deref()
        .map(split_scopes)
        .unwrap_or_default();
    token
}

fn error_snippet(status: reqwest::StatusCode, body: &str) -> String {
    let snippet = body.trim();
    if snippet.is_empty() {
        status.to_string()
    } else {
        snippet.chars().take(512).collect()
    }
}
