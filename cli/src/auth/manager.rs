//! Token lifecycle on top of a [`TokenStore`].
//!
//! The manager is the only component that touches persisted tokens. It picks
//! a storage backend once, at construction, and serializes refreshes per
//! profile so concurrent readers never race each other's exchange.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use crate::auth::store::{FileStore, KeyringStore, TokenStore};
use crate::auth::tokens::{token_expiry_slack, TokenData};
use crate::config::{paths, AuthSettings};
use crate::error::{OrbitError, Result};

/// Profile name used to check whether the keyring answers at all.
const PROBE_PROFILE: &str = "__orbit_probe__";

/// Which backend a manager ended up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Keyring,
    File,
    Custom,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Keyring => write!(f, "system keyring"),
            Self::File => write!(f, "token file"),
            Self::Custom => write!(f, "custom store"),
        }
    }
}

/// Owns one token store and adds validation and auto-refresh.
pub struct TokenManager {
    store: Box<dyn TokenStore>,
    backend: StorageBackend,
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenManager {
    /// Wraps an explicit store.
    #[allow(dead_code)]
    pub fn new(store: Box<dyn TokenStore>) -> Self {
        Self::with_backend(store, StorageBackend::Custom)
    }

    fn with_backend(store: Box<dyn TokenStore>, backend: StorageBackend) -> Self {
        Self {
            store,
            backend,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Builds the default manager: OS keyring, or the token directory when
    /// the keyring is disabled or unavailable.
    pub fn from_settings(settings: &AuthSettings) -> Result<Self> {
        let dir = paths::tokens_dir()?;
        Self::with_fallback(
            Box::new(KeyringStore::default()),
            &dir,
            settings.disable_keyring,
        )
    }

    /// Selects `keyring` unless it is disabled or fails a probe read, in which
    /// case a [`FileStore`] rooted at `fallback_dir` is used instead.
    pub fn with_fallback(
        keyring: Box<dyn TokenStore>,
        fallback_dir: &Path,
        disable_keyring: bool,
    ) -> Result<Self> {
        if disable_keyring {
            tracing::debug!(dir = %fallback_dir.display(), "keyring disabled by configuration");
            return Ok(Self::with_backend(
                Box::new(FileStore::new(fallback_dir)?),
                StorageBackend::File,
            ));
        }

        match keyring.load(PROBE_PROFILE) {
            Ok(_) | Err(OrbitError::TokenNotFound { .. } | OrbitError::InvalidCredentials) => {
                Ok(Self::with_backend(keyring, StorageBackend::Keyring))
            },
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    dir = %fallback_dir.display(),
                    "system keyring unavailable; storing tokens on disk"
                );
                Ok(Self::with_backend(
                    Box::new(FileStore::new(fallback_dir)?),
                    StorageBackend::File,
                ))
            },
        }
    }

    /// The backend selected at construction.
    pub const fn backend(&self) -> StorageBackend {
        self.backend
    }

    /// Validates and persists a record for `profile`.
    pub fn save(&self, profile: &str, data: &TokenData) -> Result<()> {
        data.validate()?;
        self.store
            .save(profile, data)
            .map_err(|e| with_profile(e, profile))
    }

    /// Loads the record for `profile`.
    pub fn load(&self, profile: &str) -> Result<TokenData> {
        self.store.load(profile).map_err(|e| with_profile(e, profile))
    }

    /// Deletes the record for `profile`, succeeding if none exists.
    pub fn delete(&self, profile: &str) -> Result<()> {
        self.store
            .delete(profile)
            .map_err(|e| with_profile(e, profile))
    }

    /// Returns a usable bearer token for `profile`, refreshing it first when
    /// it has expired.
    ///
    /// `refresh` receives the stale record and must return its replacement;
    /// it is only invoked when the record carries a refresh token.
    pub async fn access_token<F, Fut>(&self, profile: &str, refresh: F) -> Result<String>
    where
        F: FnOnce(TokenData) -> Fut,
        Fut: Future<Output = Result<TokenData>>,
    {
        Ok(self.valid_token(profile, refresh).await?.access_token)
    }

    /// Like [`access_token`](Self::access_token) but returns the full record.
    pub async fn valid_token<F, Fut>(&self, profile: &str, refresh: F) -> Result<TokenData>
    where
        F: FnOnce(TokenData) -> Fut,
        Fut: Future<Output = Result<TokenData>>,
    {
        let lock = self.refresh_lock(profile);
        let _guard = lock.lock().await;

        let data = self.load(profile)?;
        if !data.is_expired(token_expiry_slack()) {
            return Ok(data);
        }
        if !data.has_refresh() {
            tracing::debug!(profile, "access token expired and no refresh token is stored");
            return Err(OrbitError::AuthenticationRequired);
        }

        tracing::debug!(profile, "access token expired; refreshing");
        let refreshed = refresh(data).await.map_err(|e| match e {
            OrbitError::Cancelled | OrbitError::TokenRefreshFailed(_) => e,
            other => OrbitError::TokenRefreshFailed(other.to_string()),
        })?;
        self.save(profile, &refreshed)?;
        tracing::info!(profile, "access token refreshed");

        Ok(refreshed)
    }

    fn refresh_lock(&self, profile: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .refresh_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(profile.to_string()).or_default())
    }
}

fn with_profile(err: OrbitError, profile: &str) -> OrbitError {
    match err {
        OrbitError::CredentialStorage(msg) => {
            OrbitError::CredentialStorage(format!("profile '{profile}': {msg}"))
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    use super::*;
    use crate::auth::store::MockTokenStore;

    fn file_manager(tmp: &TempDir) -> TokenManager {
        TokenManager::new(Box::new(FileStore::new(tmp.path()).unwrap()))
    }

    fn expired_token(refresh: Option<&str>) -> TokenData {
        let mut data = TokenData::new("stale", "Bearer");
        data.expiry = Some(Utc::now() - Duration::minutes(5));
        data.refresh_token = refresh.map(String::from);
        data
    }

    async fn no_refresh(_: TokenData) -> Result<TokenData> {
        panic!("refresh must not run")
    }

    fn refreshed(mut current: TokenData) -> TokenData {
        current.access_token = "fresh".to_string();
        current.expiry = Some(Utc::now() + Duration::hours(1));
        current
    }

    #[test]
    fn save_rejects_invalid_records() {
        let tmp = TempDir::new().unwrap();
        let manager = file_manager(&tmp);

        let err = manager.save("p", &TokenData::new("", "Bearer")).unwrap_err();
        assert!(matches!(err, OrbitError::InvalidToken(_)));
        assert!(manager.load("p").unwrap_err().is_not_found());
    }

    #[test]
    fn falls_back_to_file_store_when_keyring_fails() {
        let tmp = TempDir::new().unwrap();
        let mut keyring = MockTokenStore::new();
        keyring
            .expect_load()
            .returning(|_| Err(OrbitError::CredentialStorage("no secret service".to_string())));
        keyring.expect_save().never();
        keyring.expect_delete().never();

        let manager = TokenManager::with_fallback(Box::new(keyring), tmp.path(), false).unwrap();
        assert_eq!(manager.backend(), StorageBackend::File);

        let token = TokenData::new("abc", "Bearer");
        manager.save("test", &token).unwrap();
        assert_eq!(manager.load("test").unwrap(), token);
        manager.delete("test").unwrap();
        assert!(manager.load("test").unwrap_err().is_not_found());
    }

    #[test]
    fn disabled_keyring_is_never_probed() {
        let tmp = TempDir::new().unwrap();
        let mut keyring = MockTokenStore::new();
        keyring.expect_load().never();

        let manager = TokenManager::with_fallback(Box::new(keyring), tmp.path(), true).unwrap();
        assert_eq!(manager.backend(), StorageBackend::File);
    }

    #[test]
    fn working_keyring_is_preferred() {
        let tmp = TempDir::new().unwrap();
        let mut keyring = MockTokenStore::new();
        keyring.expect_load().returning(|profile| {
            Err(OrbitError::TokenNotFound {
                profile: profile.to_string(),
            })
        });
        keyring
            .expect_save()
            .withf(|profile, data| profile.to_string() == "work" && data.access_token == "abc")
            .times(1)
            .returning(|_, _| Ok(()));

        let manager = TokenManager::with_fallback(Box::new(keyring), tmp.path(), false).unwrap();
        assert_eq!(manager.backend(), StorageBackend::Keyring);
        manager.save("work", &TokenData::new("abc", "Bearer")).unwrap();
    }

    #[test]
    fn storage_errors_name_the_profile() {
        let mut store = MockTokenStore::new();
        store
            .expect_load()
            .returning(|_| Err(OrbitError::CredentialStorage("locked".to_string())));
        let manager = TokenManager::new(Box::new(store));

        let msg = manager.load("ci").unwrap_err().to_string();
        assert!(msg.contains("profile 'ci'"), "{msg}");
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let tmp = TempDir::new().unwrap();
        let manager = file_manager(&tmp);
        let mut token = TokenData::new("current", "Bearer");
        token.expiry = Some(Utc::now() + Duration::hours(1));
        token.refresh_token = Some("r".to_string());
        manager.save("p", &token).unwrap();

        let access = manager
            .access_token("p", no_refresh)
            .await
            .unwrap();
        assert_eq!(access, "current");
    }

    #[tokio::test]
    async fn missing_profile_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let manager = file_manager(&tmp);

        let err = manager
            .access_token("nobody", |t| async move { Ok(t) })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn expired_without_refresh_token_requires_login() {
        let tmp = TempDir::new().unwrap();
        let manager = file_manager(&tmp);
        manager.save("p", &expired_token(None)).unwrap();

        let err = manager
            .access_token("p", no_refresh)
            .await
            .unwrap_err();
        assert!(matches!(err, OrbitError::AuthenticationRequired));
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_persisted() {
        let tmp = TempDir::new().unwrap();
        let manager = file_manager(&tmp);
        manager.save("p", &expired_token(Some("r"))).unwrap();

        let access = manager
            .access_token("p", |current| async move {
                assert_eq!(current.refresh_token.as_deref(), Some("r"));
                Ok(refreshed(current))
            })
            .await
            .unwrap();

        assert_eq!(access, "fresh");
        assert_eq!(manager.load("p").unwrap().access_token, "fresh");
    }

    #[tokio::test]
    async fn failed_refresh_leaves_record_untouched() {
        let tmp = TempDir::new().unwrap();
        let manager = file_manager(&tmp);
        let stale = expired_token(Some("r"));
        manager.save("p", &stale).unwrap();

        let err = manager
            .access_token("p", |_| async {
                Err(OrbitError::protocol("https://idp/token", "invalid_grant"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, OrbitError::TokenRefreshFailed(_)));
        assert!(err.to_string().contains("invalid_grant"));
        assert_eq!(manager.load("p").unwrap(), stale);
    }

    #[tokio::test]
    async fn concurrent_readers_share_one_refresh() {
        let tmp = TempDir::new().unwrap();
        let manager = Arc::new(file_manager(&tmp));
        manager.save("p", &expired_token(Some("r"))).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = Arc::clone(&manager);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                manager
                    .access_token("p", move |current| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(StdDuration::from_millis(50)).await;
                        Ok(refreshed(current))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "fresh");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
