//! Authentication module for orbit.
//!
//! This module provides OIDC login through two interchangeable strategies,
//! the authorization code flow with PKCE and a local callback listener, and
//! the device authorization grant. Both store their tokens through the
//! profile-scoped [`TokenManager`].

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{OrbitError, Result};

pub mod callback;
pub mod device_flow;
pub mod identity;
pub mod manager;
pub mod oidc;
pub mod pkce;
pub mod store;
pub mod tokens;

pub use callback::{CallbackResult, CallbackServer};
pub use device_flow::{DeviceCode, DeviceFlowClient, DeviceFlowConfig, TokioClock};
pub use identity::{decode_id_token, UserInfo};
pub use manager::TokenManager;
pub use oidc::{build_http_client, AuthCodeClient, OidcConfig, ProviderMetadata};
pub use tokens::TokenData;

/// Runs `work` unless `cancel` fires first, in which case `work` is dropped
/// and the result is [`OrbitError::Cancelled`].
pub async fn until_cancelled<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(OrbitError::Cancelled),
        outcome = work => outcome,
    }
}

/// Open a URL in the default browser.
///
/// Returns `true` if the browser was opened successfully, `false` otherwise.
pub fn open_browser(url: &str) -> bool {
    match open::that(url) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "could not open browser");
            false
        },
    }
}
