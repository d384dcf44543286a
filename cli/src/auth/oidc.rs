//! OpenID Connect discovery and the authorization code + PKCE client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use oauth2::basic::{
    BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse,
    BasicTokenType,
};
use oauth2::http::header::{HeaderName, HeaderValue};
use oauth2::http::{HeaderMap, StatusCode};
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, Client, ClientId, ClientSecret, CsrfToken,
    ExtraTokenFields, HttpRequest, HttpResponse, PkceCodeVerifier, RedirectUrl, RefreshToken, RequestTokenError, Scope,
    StandardRevocableToken, StandardTokenResponse, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::callback::CallbackResult;
use crate::auth::identity::{decode_id_token, parse_userinfo, AdminHint, UserInfo};
use crate::auth::manager::TokenManager;
use crate::auth::pkce::PkcePair;
use crate::auth::tokens::TokenData;
use crate::error::{OrbitError, Result};

/// Scopes every login requests.
pub const DEFAULT_SCOPES: [&str; 3] = ["openid", "profile", "email"];

/// Returns `scopes` with the default OIDC scopes first and duplicates removed.
pub fn ensure_default_scopes(scopes: &[String]) -> Vec<String> {
    let mut out: Vec<String> = DEFAULT_SCOPES.iter().map(ToString::to_string).collect();
    for scope in scopes.iter().flat_map(|s| s.split_whitespace()) {
        if !out.iter().any(|s| s == scope) {
            out.push(scope.to_string());
        }
    }
    out
}

/// Builds the HTTP client used for identity provider calls.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(format!("orbit/{}", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()?)
}

/// Identity provider settings for one profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcConfig {
    pub issuer: String,
    pub client_id: String,
    /// Only for confidential clients.
    pub client_secret: Option<String>,
    pub audience: Option<String>,
    pub redirect_url: String,
    pub scopes: Vec<String>,
    pub admin: AdminHint,
}

/// Subset of the OpenID Provider Metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub device_authorization_endpoint: Option<String>,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
}

impl ProviderMetadata {
    /// Location of the discovery document for `issuer`.
    pub fn discovery_url(issuer: &str) -> String {
        format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        )
    }

    /// Fetches and parses the discovery document.
    pub async fn discover(http: &reqwest::Client, issuer: &str) -> Result<Self> {
        let url = Self::discovery_url(issuer);
        tracing::debug!(%url, "fetching provider metadata");

        let response = http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(OrbitError::protocol(
                &url,
                format!("discovery failed with status {status}"),
            ));
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| OrbitError::protocol(&url, format!("malformed provider metadata: {e}")))
    }

    pub const fn supports_device_flow(&self) -> bool {
        self.device_authorization_endpoint.is_some()
    }

    /// Userinfo endpoint, falling back to `<issuer>/userinfo`.
    pub fn userinfo_url(&self) -> String {
        self.userinfo_endpoint.clone().unwrap_or_else(|| {
            format!("{}/userinfo", self.issuer.trim_end_matches('/'))
        })
    }
}

/// `id_token` carried next to the standard token response fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdTokenFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl ExtraTokenFields for IdTokenFields {}

type OidcTokenResponse = StandardTokenResponse<IdTokenFields, BasicTokenType>;

type OAuthClient = Client<
    BasicErrorResponse,
    OidcTokenResponse,
    BasicTokenType,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
>;

/// Progress of one browser login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Idle,
    AwaitingCallback,
    Exchanging,
    Authenticated,
    Failed,
}

/// Authorization code + PKCE client bound to one profile.
pub struct AuthCodeClient {
    config: OidcConfig,
    metadata: ProviderMetadata,
    oauth: OAuthClient,
    http: reqwest::Client,
    manager: Arc<TokenManager>,
    profile: String,
    state: LoginState,
}

impl AuthCodeClient {
    pub fn new(
        config: OidcConfig,
        metadata: ProviderMetadata,
        http: reqwest::Client,
        manager: Arc<TokenManager>,
        profile: impl Into<String>,
    ) -> Result<Self> {
        let oauth = OAuthClient::new(
            ClientId::new(config.client_id.clone()),
            config.client_secret.clone().map(ClientSecret::new),
            AuthUrl::new(metadata.authorization_endpoint.clone())?,
            Some(TokenUrl::new(metadata.token_endpoint.clone())?),
        )
        .set_auth_type(AuthType::RequestBody)
        .set_redirect_uri(RedirectUrl::new(config.redirect_url.clone())?);

        Ok(Self {
            config,
            metadata,
            oauth,
            http,
            manager,
            profile: profile.into(),
            state: LoginState::Idle,
        })
    }

    pub const fn state(&self) -> LoginState {
        self.state
    }

    /// Builds the authorization URL for a fresh PKCE pair and the caller's
    /// anti-CSRF `state`.
    pub fn get_auth_url(&mut self, state: &str) -> (Url, PkcePair) {
        let pkce = PkcePair::generate();
        let csrf = state.to_string();

        let mut request = self
            .oauth
            .authorize_url(move || CsrfToken::new(csrf))
            .set_pkce_challenge(pkce.code_challenge());
        for scope in &self.config.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        if let Some(audience) = &self.config.audience {
            request = request.add_extra_param("audience", audience.clone());
        }
        let (url, _) = request.url();
        tracing::debug!(
            method = pkce.method,
            challenge = %pkce.challenge,
            "authorization URL built"
        );

        self.state = LoginState::AwaitingCallback;
        (url, pkce)
    }

    /// Checks the redirect against the `state` this attempt generated, then
    /// exchanges the code. A mismatch aborts before any token request.
    pub async fn complete_login(
        &mut self,
        expected_state: &str,
        callback: CallbackResult,
        verifier: &str,
    ) -> Result<UserInfo> {
        if let Some(error) = callback.error {
            self.state = LoginState::Failed;
            return Err(OrbitError::AuthorizationFailed(error));
        }
        if !states_match(&callback.state, expected_state) {
            tracing::warn!("authorization redirect carried an unexpected state");
            self.state = LoginState::Failed;
            return Err(OrbitError::StateMismatch);
        }
        self.handle_callback(&callback.code, verifier).await
    }

    /// Exchanges the authorization code, stores the tokens for this profile
    /// and resolves who logged in.
    pub async fn handle_callback(&mut self, code: &str, verifier: &str) -> Result<UserInfo> {
        self.state = LoginState::Exchanging;
        match self.exchange(code, verifier).await {
            Ok(user) => {
                self.state = LoginState::Authenticated;
                Ok(user)
            },
            Err(e) => {
                self.state = LoginState::Failed;
                Err(e)
            },
        }
    }

    async fn exchange(&self, code: &str, verifier: &str) -> Result<UserInfo> {
        let response = self
            .oauth
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(verifier.to_string()))
            .request_async(|request| send_token_request(&self.http, request))
            .await
            .map_err(|e| token_error(&self.metadata.token_endpoint, e))?;

        let token = self.token_data(&response);
        self.manager.save(&self.profile, &token)?;
        tracing::info!(profile = %self.profile, "authorization code exchanged");

        self.user_info(&token).await
    }

    /// Resolves who owns `token`, applying the profile's admin rule.
    pub async fn user_info(&self, token: &TokenData) -> Result<UserInfo> {
        resolve_identity(&self.http, &self.metadata, &self.config.admin, token).await
    }

    /// Whether a usable (possibly refreshed) token is stored.
    pub async fn is_authenticated(&self) -> bool {
        self.get_valid_token().await.is_ok()
    }

    /// Identity of the stored token's owner, refreshing it first if needed.
    pub async fn get_current_user(&self) -> Result<UserInfo> {
        let token = self
            .manager
            .valid_token(&self.profile, |current| self.refresh(current))
            .await?;
        self.user_info(&token).await
    }

    /// A bearer token for API calls, refreshed when expired.
    pub async fn get_valid_token(&self) -> Result<String> {
        self.manager
            .access_token(&self.profile, |current| self.refresh(current))
            .await
    }

    /// Exchanges the refresh token on `current` at this provider.
    ///
    /// Refresh and ID tokens the provider does not rotate are kept.
    pub async fn refresh(&self, current: TokenData) -> Result<TokenData> {
        let secret = current
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or(OrbitError::AuthenticationRequired)?;
        let refresh = RefreshToken::new(secret);

        let mut request = self.oauth.exchange_refresh_token(&refresh);
        if let Some(audience) = &self.config.audience {
            request = request.add_extra_param("audience", audience.clone());
        }
        let response = request
            .request_async(|request| send_token_request(&self.http, request))
            .await
            .map_err(|e| token_error(&self.metadata.token_endpoint, e))?;

        let mut updated = self.token_data(&response);
        if updated.refresh_token.is_none() {
            updated.refresh_token = current.refresh_token;
        }
        if updated.id_token.is_none() {
            updated.id_token = current.id_token;
        }
        Ok(updated)
    }

    /// Ends the provider session when possible and removes the stored token.
    ///
    /// Provider-side failures are logged and do not stop the local removal.
    pub async fn logout(&self) -> Result<()> {
        match self.manager.load(&self.profile) {
            Ok(token) => self.end_session(&token).await,
            Err(e) if e.is_not_found() => {},
            Err(e) => tracing::warn!(error = %e, "could not read stored token before logout"),
        }
        self.manager.delete(&self.profile)
    }

    async fn end_session(&self, token: &TokenData) {
        let Some(endpoint) = self.metadata.end_session_endpoint.as_deref() else {
            return;
        };

        let mut query = HashMap::from([
            ("client_id", self.config.client_id.as_str()),
            ("post_logout_redirect_uri", self.config.redirect_url.as_str()),
        ]);
        if let Some(id_token) = token.id_token.as_deref() {
            query.insert("id_token_hint", id_token);
        }

        match self.http.get(endpoint).query(&query).send().await {
            Ok(response) if response.status().is_success() || response.status().is_redirection() => {
                tracing::debug!("provider session ended");
            },
            Ok(response) => {
                tracing::warn!(status = %response.status(), "provider logout was rejected");
            },
            Err(e) => tracing::warn!(error = %e, "provider logout failed"),
        }
    }

    fn token_data(&self, response: &OidcTokenResponse) -> TokenData {
        let token_type = match response.token_type() {
            BasicTokenType::Bearer => "Bearer".to_string(),
            other => other.as_ref().to_string(),
        };
        let mut token = TokenData::new(response.access_token().secret().clone(), token_type)
            .expiring_in(response.expires_in().map(|d| d.as_secs()));
        token.refresh_token = response
            .refresh_token()
            .map(|t| t.secret().clone())
            .filter(|t| !t.is_empty());
        token.id_token = response.extra_fields().id_token.clone().filter(|t| !t.is_empty());
        token.scopes = response.scopes().map_or_else(
            || self.config.scopes.clone(),
            |scopes| scopes.iter().map(|s| s.as_str().to_string()).collect(),
        );
        token.issuer = Some(self.metadata.issuer.clone());
        token.client_id = Some(self.config.client_id.clone());
        token.audience.clone_from(&self.config.audience);
        token.token_endpoint = Some(self.metadata.token_endpoint.clone());
        token
    }
}

/// Resolves identity from the ID token, or the userinfo endpoint when the
/// token carries none.
pub async fn resolve_identity(
    http: &reqwest::Client,
    metadata: &ProviderMetadata,
    admin: &AdminHint,
    token: &TokenData,
) -> Result<UserInfo> {
    let from_id_token = token
        .id_token
        .as_deref()
        .and_then(|id| match decode_id_token(id) {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::debug!(error = %e, "ignoring undecodable ID token");
                None
            },
        })
        .filter(UserInfo::is_known);

    let user = match from_id_token {
        Some(user) => user,
        None => fetch_userinfo(http, &metadata.userinfo_url(), &token.access_token).await?,
    };
    Ok(admin.apply(user))
}

/// Calls the userinfo endpoint with `access_token`.
pub async fn fetch_userinfo(
    http: &reqwest::Client,
    url: &str,
    access_token: &str,
) -> Result<UserInfo> {
    let response = http.get(url).bearer_auth(access_token).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(OrbitError::protocol(
            url,
            format!("userinfo request failed with status {status}"),
        ));
    }
    let body = response.bytes().await?;
    parse_userinfo(&body)
        .map_err(|e| OrbitError::protocol(url, format!("malformed userinfo response: {e}")))
}

/// Compares two `state` values without short-circuiting on the first
/// differing byte.
fn states_match(received: &str, expected: &str) -> bool {
    let (a, b) = (received.as_bytes(), expected.as_bytes());
    if a.len() != b.len() || a.is_empty() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Sends an oauth2 token request through `http`, so token calls share the
/// timeout and user agent of every other provider call.
async fn send_token_request(
    http: &reqwest::Client,
    request: HttpRequest,
) -> std::result::Result<HttpResponse, reqwest::Error> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::POST);
    let mut builder = http.request(method, request.url.as_str()).body(request.body);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    let response = builder.send().await?;

    let status_code =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = HeaderMap::new();
    for (name, value) in response.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }
    let body = response.bytes().await?.to_vec();

    Ok(HttpResponse {
        status_code,
        headers,
        body,
    })
}

fn token_error(
    endpoint: &str,
    err: RequestTokenError<reqwest::Error, BasicErrorResponse>,
) -> OrbitError {
    match err {
        RequestTokenError::ServerResponse(response) => {
            OrbitError::protocol(endpoint, response.to_string())
        },
        RequestTokenError::Request(e) => e.into(),
        RequestTokenError::Parse(e, _) => {
            OrbitError::protocol(endpoint, format!("malformed token response: {e}"))
        },
        RequestTokenError::Other(message) => OrbitError::protocol(endpoint, message),
    }
}
