//! Authentication command handlers.

use std::sync::Arc;

use oauth2::CsrfToken;
use tokio_util::sync::CancellationToken;

use crate::auth::device_flow::{self, DeviceFlowClient, DeviceFlowConfig, TokioClock};
use crate::auth::identity::{decode_id_token, UserInfo};
use crate::auth::oidc::resolve_identity;
use crate::auth::tokens::token_expiry_slack;
use crate::auth::{
    build_http_client, open_browser, until_cancelled, AuthCodeClient, CallbackServer, OidcConfig,
    ProviderMetadata, TokenData, TokenManager,
};
use crate::config::{load_config, OrbitConfig, ProfileAuth};
use crate::error::Result;

/// Everything a command needs to act on one profile.
pub struct AuthContext {
    config: OrbitConfig,
    profile: String,
    manager: Arc<TokenManager>,
    http: reqwest::Client,
}

impl AuthContext {
    /// Loads configuration and opens token storage for the selected profile.
    pub fn load(profile: Option<&str>) -> Result<Self> {
        let config = load_config()?;
        let profile = config.profile_name(profile);
        let manager = Arc::new(TokenManager::from_settings(&config.auth)?);
        let http = build_http_client(config.auth.http_timeout())?;
        tracing::debug!(%profile, backend = %manager.backend(), "auth context ready");

        Ok(Self {
            config,
            profile,
            manager,
            http,
        })
    }

    fn profile_auth(&self) -> ProfileAuth {
        self.config.profile(&self.profile)
    }

    fn oidc_config(&self) -> Result<OidcConfig> {
        self.profile_auth().oidc_config(&self.config.auth)
    }

    async fn auth_code_client(&self) -> Result<AuthCodeClient> {
        let oidc = self.oidc_config()?;
        let metadata = ProviderMetadata::discover(&self.http, &oidc.issuer).await?;
        self.client_for(oidc, metadata)
    }

    fn client_for(&self, oidc: OidcConfig, metadata: ProviderMetadata) -> Result<AuthCodeClient> {
        AuthCodeClient::new(
            oidc,
            metadata,
            self.http.clone(),
            Arc::clone(&self.manager),
            self.profile.clone(),
        )
    }

    /// Refreshes `current` with the protocol client that issued it.
    async fn refresh(&self, current: TokenData) -> Result<TokenData> {
        if current.device_endpoint.is_some() {
            device_flow::refresh_token(&self.http, &current).await
        } else {
            self.auth_code_client().await?.refresh(current).await
        }
    }

    async fn valid_token(&self) -> Result<TokenData> {
        self.manager
            .valid_token(&self.profile, |current| self.refresh(current))
            .await
    }
}

/// Which login strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Browser,
    Device,
}

fn choose_strategy(
    device_requested: bool,
    browser_available: bool,
    supports_device: bool,
) -> Strategy {
    if device_requested || (!browser_available && supports_device) {
        Strategy::Device
    } else {
        Strategy::Browser
    }
}

/// Best guess whether a browser on this machine can reach the local
/// callback listener.
fn browser_available(var_set: impl Fn(&str) -> bool) -> bool {
    if var_set("SSH_CONNECTION") || var_set("SSH_TTY") {
        return false;
    }
    if cfg!(target_os = "linux") {
        return var_set("DISPLAY") || var_set("WAYLAND_DISPLAY");
    }
    true
}

/// Handle the `orbit auth login` command.
pub async fn handle_login(
    ctx: &AuthContext,
    device: bool,
    no_browser: bool,
    force: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    // Fail on missing configuration before touching the network.
    let oidc = ctx.oidc_config()?;
    let metadata =
        until_cancelled(cancel, ProviderMetadata::discover(&ctx.http, &oidc.issuer)).await?;
    let mut client = ctx.client_for(oidc.clone(), metadata.clone())?;

    if !force && until_cancelled(cancel, report_existing_session(ctx, &client)).await? {
        return Ok(());
    }

    let strategy = choose_strategy(
        device,
        browser_available(|name| std::env::var_os(name).is_some()),
        metadata.supports_device_flow(),
    );
    tracing::debug!(?strategy, "selected login strategy");

    let user = match strategy {
        Strategy::Browser => browser_login(ctx, &mut client, no_browser, cancel).await?,
        Strategy::Device => device_login(ctx, &oidc, &metadata, no_browser, cancel).await?,
    };

    println!();
    println!("Successfully logged in to profile '{}'.", ctx.profile);
    print_identity(&user);
    Ok(())
}

/// Prints the stored session and returns `true` when the profile is already
/// logged in with a usable (possibly refreshed) token.
async fn report_existing_session(ctx: &AuthContext, client: &AuthCodeClient) -> Result<bool> {
    let stored = match ctx.manager.load(&ctx.profile) {
        Ok(token) => token,
        Err(e) if e.is_not_found() => return Ok(false),
        Err(e) => {
            tracing::warn!(error = %e, "could not check stored token; starting login");
            return Ok(false);
        },
    };

    let user = if stored.device_endpoint.is_some() {
        match ctx.valid_token().await {
            Ok(token) => display_identity(&token, &ctx.profile_auth()),
            Err(e) => {
                tracing::debug!(error = %e, "no usable stored token; starting login");
                return Ok(false);
            },
        }
    } else {
        if !client.is_authenticated().await {
            tracing::debug!("no usable stored token; starting login");
            return Ok(false);
        }
        match client.get_current_user().await {
            Ok(user) => Some(user),
            Err(e) => {
                tracing::debug!(error = %e, "could not resolve identity");
                None
            },
        }
    };

    println!("Already logged in to profile '{}'.", ctx.profile);
    if let Some(user) = user {
        print_identity(&user);
    }
    println!();
    println!("Use --force to log in again.");
    Ok(true)
}

async fn browser_login(
    ctx: &AuthContext,
    client: &mut AuthCodeClient,
    no_browser: bool,
    cancel: &CancellationToken,
) -> Result<UserInfo> {
    let settings = &ctx.config.auth;
    let mut server = CallbackServer::start(settings.callback_port, &settings.callback_path).await?;
    tracing::debug!(
        addr = %server.local_addr(),
        ipv6 = ?server.ipv6_addr(),
        "waiting for the authorization redirect"
    );

    let state = CsrfToken::new_random().secret().clone();
    let (url, pkce) = client.get_auth_url(&state);

    println!("To authenticate, please visit:");
    println!();
    println!("  {url}");
    println!();
    if !no_browser {
        if open_browser(url.as_str()) {
            println!("Browser opened automatically.");
        } else {
            println!("Could not open browser. Please visit the URL manually.");
        }
        println!();
    }
    println!("Waiting for the browser to complete login...");

    let received = server
        .wait_for_callback(settings.login_timeout(), cancel)
        .await;
    let released = server.shutdown().await;
    let callback = received?;
    released?;

    let outcome = until_cancelled(
        cancel,
        client.complete_login(&state, callback, &pkce.verifier),
    )
    .await;
    tracing::debug!(state = ?client.state(), "browser login finished");
    outcome
}

async fn device_login(
    ctx: &AuthContext,
    oidc: &OidcConfig,
    metadata: &ProviderMetadata,
    no_browser: bool,
    cancel: &CancellationToken,
) -> Result<UserInfo> {
    let client = DeviceFlowClient::new(
        ctx.http.clone(),
        DeviceFlowConfig::from_provider(oidc, metadata)?,
    );
    let code = until_cancelled(cancel, client.start_device_authorization()).await?;

    println!("To authenticate, please visit:");
    println!();
    println!("  {}", code.verification_uri);
    println!();
    println!("And enter code: {}", code.user_code);
    println!();
    if !no_browser {
        if open_browser(code.browser_url()) {
            println!("Browser opened automatically.");
        } else {
            println!("Could not open browser. Please visit the URL manually.");
        }
        println!();
    }

    println!("Waiting for authorization...");
    let token = client.poll_token(&code, &TokioClock, cancel).await?;
    ctx.manager.save(&ctx.profile, &token)?;
    println!("Authorization received!");

    until_cancelled(cancel, resolve_identity(&ctx.http, metadata, &oidc.admin, &token)).await
}

/// Handle the `orbit auth logout` command.
pub async fn handle_logout(ctx: &AuthContext) -> Result<()> {
    match ctx.manager.load(&ctx.profile) {
        Ok(_) => {},
        Err(e) if e.is_not_found() => {
            println!("Not currently logged in to profile '{}'.", ctx.profile);
            return Ok(());
        },
        Err(e) => return Err(e),
    }

    match ctx.auth_code_client().await {
        Ok(client) => client.logout().await?,
        Err(e) => {
            tracing::warn!(error = %e, "skipping provider logout");
            ctx.manager.delete(&ctx.profile)?;
        },
    }

    println!("Successfully logged out of profile '{}'.", ctx.profile);
    Ok(())
}

/// Handle the `orbit auth status` command.
pub fn handle_status(ctx: &AuthContext) -> Result<()> {
    let token = match ctx.manager.load(&ctx.profile) {
        Ok(token) => token,
        Err(e) if e.is_not_found() => {
            println!("Not logged in to profile '{}'", ctx.profile);
            println!();
            println!("Run 'orbit auth login' to authenticate.");
            return Ok(());
        },
        Err(e) => return Err(e),
    };

    println!("Logged in");
    println!();
    println!("  Profile:    {}", ctx.profile);
    println!("  Storage:    {}", ctx.manager.backend());
    if let Some(issuer) = &token.issuer {
        println!("  Issuer:     {issuer}");
    }
    if let Some(user) = display_identity(&token, &ctx.profile_auth()) {
        print_identity(&user);
    }
    match token.expiry {
        Some(expiry) => println!("  Expires:    {}", expiry.to_rfc3339()),
        None => println!("  Expires:    never"),
    }
    println!(
        "  Refresh:    {}",
        if token.has_refresh() { "available" } else { "none" }
    );

    if token.is_expired(token_expiry_slack()) {
        println!();
        if token.has_refresh() {
            println!("  Access token has expired and will be refreshed on next use.");
        } else {
            println!("  Warning: access token has expired. Please run 'orbit auth login' again.");
        }
    }

    Ok(())
}

/// Handle the `orbit auth token` command.
///
/// An unexpired token is printed without network access. An expired one is
/// refreshed by the client that issued it.
pub async fn handle_token(ctx: &AuthContext, cancel: &CancellationToken) -> Result<()> {
    let stored = ctx.manager.load(&ctx.profile)?;
    let access = if stored.device_endpoint.is_some() || !stored.is_expired(token_expiry_slack()) {
        until_cancelled(
            cancel,
            ctx.manager
                .access_token(&ctx.profile, |current| ctx.refresh(current)),
        )
        .await?
    } else {
        let client = until_cancelled(cancel, ctx.auth_code_client()).await?;
        until_cancelled(cancel, client.get_valid_token()).await?
    };
    println!("{access}");
    Ok(())
}

/// Identity from the stored ID token, without network access.
fn display_identity(token: &TokenData, profile: &ProfileAuth) -> Option<UserInfo> {
    let user = decode_id_token(token.id_token.as_deref()?).ok()?;
    Some(profile.admin_hint().apply(user))
}

fn print_identity(user: &UserInfo) {
    println!("  User:       {}", user.display_name());
    if !user.subject.is_empty() {
        println!("  Subject:    {}", user.subject);
    }
    if user.is_admin {
        println!("  Role:       administrator");
    }
    if !user.groups.is_empty() {
        println!("  Groups:     {}", user.groups.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::auth::store::FileStore;

    const PROFILE: &str = "staging";

    fn context(server: &MockServer, tmp: &TempDir) -> AuthContext {
        let mut config = OrbitConfig::default();
        config.profiles.insert(
            PROFILE.to_string(),
            ProfileAuth {
                issuer: Some(format!("{}/", server.uri())),
                client_id: Some("orbit-cli".to_string()),
                ..ProfileAuth::default()
            },
        );
        AuthContext {
            config,
            profile: PROFILE.to_string(),
            manager: Arc::new(TokenManager::new(Box::new(
                FileStore::new(tmp.path()).unwrap(),
            ))),
            http: reqwest::Client::new(),
        }
    }

    async fn mount_discovery(server: &MockServer, times: u64) {
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": format!("{}/", server.uri()),
                "authorization_endpoint": format!("{}/authorize", server.uri()),
                "token_endpoint": format!("{}/oauth/token", server.uri()),
            })))
            .expect(times)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn expired_browser_token_is_refreshed_by_auth_code_client() {
        let server = MockServer::start().await;
        mount_discovery(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-access",
                "token_type": "Bearer",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;
        let tmp = TempDir::new().unwrap();
        let ctx = context(&server, &tmp);

        let mut stale = TokenData::new("old-access", "Bearer");
        stale.expiry = Some(Utc::now() - ChronoDuration::minutes(1));
        stale.refresh_token = Some("refresh".to_string());
        ctx.manager.save(PROFILE, &stale).unwrap();

        handle_token(&ctx, &CancellationToken::new()).await.unwrap();
        let stored = ctx.manager.load(PROFILE).unwrap();
        assert_eq!(stored.access_token, "new-access");
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh"));
    }

    #[tokio::test]
    async fn fresh_token_needs_no_discovery() {
        let server = MockServer::start().await;
        mount_discovery(&server, 0).await;
        let tmp = TempDir::new().unwrap();
        let ctx = context(&server, &tmp);
        ctx.manager
            .save(PROFILE, &TokenData::new("access", "Bearer").expiring_in(Some(3600)))
            .unwrap();

        handle_token(&ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(ctx.manager.load(PROFILE).unwrap().access_token, "access");
    }

    #[tokio::test]
    async fn interrupted_login_stops_before_discovery() {
        let server = MockServer::start().await;
        mount_discovery(&server, 0).await;
        let tmp = TempDir::new().unwrap();
        let ctx = context(&server, &tmp);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = handle_login(&ctx, false, true, false, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn device_flag_always_selects_device_flow() {
        assert_eq!(choose_strategy(true, true, true), Strategy::Device);
        assert_eq!(choose_strategy(true, true, false), Strategy::Device);
    }

    #[test]
    fn headless_hosts_fall_back_to_device_flow_when_supported() {
        assert_eq!(choose_strategy(false, false, true), Strategy::Device);
        assert_eq!(choose_strategy(false, false, false), Strategy::Browser);
        assert_eq!(choose_strategy(false, true, true), Strategy::Browser);
    }

    #[test]
    fn ssh_sessions_have_no_browser() {
        assert!(!browser_available(|name| name == "SSH_CONNECTION"));
        assert!(!browser_available(|name| name == "SSH_TTY" || name == "DISPLAY"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_needs_a_display() {
        assert!(!browser_available(|_| false));
        assert!(browser_available(|name| name == "WAYLAND_DISPLAY"));
    }

    #[test]
    fn display_identity_reads_id_token() {
        let mut token = TokenData::new("access", "Bearer");
        assert!(display_identity(&token, &ProfileAuth::default()).is_none());

        token.id_token = Some(crate::auth::identity::encode_test_id_token(
            &serde_json::json!({ "sub": "u1", "email": "root@example.com" }),
        ));
        let profile = ProfileAuth {
            admin_emails: Some("root@example.com".to_string()),
            ..ProfileAuth::default()
        };
        let user = display_identity(&token, &profile).unwrap();
        assert_eq!(user.display_name(), "root@example.com");
        assert!(user.is_admin);
    }
}
