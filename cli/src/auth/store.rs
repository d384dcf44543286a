//! Profile-scoped token persistence.
//!
//! Two interchangeable backends implement [`TokenStore`]:
//! - [`KeyringStore`]: the operating system keyring
//!   (macOS Keychain, Linux Secret Service, Windows Credential Manager)
//! - [`FileStore`]: one owner-only JSON file per profile, for hosts without a
//!   usable keyring (headless CI containers, minimal SSH boxes)
//!
//! Stores never fall back to each other. Choosing a backend is the job of
//! [`TokenManager`](crate::auth::TokenManager).

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use keyring::Entry;

use crate::auth::tokens::TokenData;
use crate::error::{OrbitError, Result};

/// Keyring service identifier all entries are scoped under.
pub const SERVICE_NAME: &str = "orbit-cli";

/// Profile name used when the operator does not pick one.
pub const DEFAULT_PROFILE: &str = "default";

/// Keyring key used by single-profile installations.
const LEGACY_KEYRING_KEY: &str = "token";

/// Capability contract shared by the storage backends.
#[cfg_attr(test, mockall::automock)]
pub trait TokenStore: Send + Sync {
    /// Writes the record for `profile`, replacing any previous one.
    fn save(&self, profile: &str, data: &TokenData) -> Result<()>;

    /// Reads the record for `profile`.
    ///
    /// Fails with [`OrbitError::TokenNotFound`] when nothing is stored.
    fn load(&self, profile: &str) -> Result<TokenData>;

    /// Removes the record for `profile`. Deleting an absent record succeeds.
    fn delete(&self, profile: &str) -> Result<()>;
}

/// Returns `true` for the unnamed profile and its explicit alias.
pub fn is_default_profile(profile: &str) -> bool {
    profile.is_empty() || profile == DEFAULT_PROFILE
}

/// Keyring account name for a profile.
pub fn keyring_key(profile: &str) -> String {
    if is_default_profile(profile) {
        LEGACY_KEYRING_KEY.to_string()
    } else {
        format!("profile:{profile}")
    }
}

/// File name (without directory) for a profile.
///
/// Path separators and `%` are percent-encoded, so distinct profile names
/// always map to distinct files.
pub fn file_name(profile: &str) -> String {
    if is_default_profile(profile) {
        return format!("{DEFAULT_PROFILE}.json");
    }
    let mut name = String::with_capacity(profile.len() + 5);
    for c in profile.chars() {
        match c {
            '%' => name.push_str("%25"),
            '/' => name.push_str("%2F"),
            '\\' => name.push_str("%5C"),
            c => name.push(c),
        }
    }
    name.push_str(".json");
    name
}

/// Token storage backed by the OS keyring.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    /// Creates a store scoped under `service`.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, profile: &str) -> Result<Entry> {
        Entry::new(&self.service, &keyring_key(profile))
            .map_err(|e| OrbitError::CredentialStorage(e.to_string()))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(SERVICE_NAME)
    }
}

impl TokenStore for KeyringStore {
    fn save(&self, profile: &str, data: &TokenData) -> Result<()> {
        let json = data.to_json()?;
        self.entry(profile)?
            .set_password(&json)
            .map_err(|e| OrbitError::CredentialStorage(e.to_string()))
    }

    fn load(&self, profile: &str) -> Result<TokenData> {
        match self.entry(profile)?.get_password() {
            Ok(json) => TokenData::from_json(&json),
            Err(keyring::Error::NoEntry) => Err(OrbitError::TokenNotFound {
                profile: profile.to_string(),
            }),
            Err(e) => Err(OrbitError::CredentialStorage(e.to_string())),
        }
    }

    fn delete(&self, profile: &str) -> Result<()> {
        match self.entry(profile)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(OrbitError::CredentialStorage(e.to_string())),
        }
    }
}

/// Token storage in a private directory, one JSON file per profile.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens (creating if needed) the token directory with owner-only access.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        create_private_dir(&dir)?;
        Ok(Self { dir })
    }

    /// Full path of the file backing `profile`.
    pub fn path_for(&self, profile: &str) -> PathBuf {
        self.dir.join(file_name(profile))
    }
}

impl TokenStore for FileStore {
    fn save(&self, profile: &str, data: &TokenData) -> Result<()> {
        let json = data.to_json()?;
        let path = self.path_for(profile);
        let tmp = path.with_extension("json.tmp");

        // Mode only applies on creation, so never reuse a leftover temp file.
        match fs::remove_file(&tmp) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }
        write_private(&tmp, json.as_bytes())?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, profile: &str) -> Result<TokenData> {
        match fs::read_to_string(self.path_for(profile)) {
            Ok(json) => TokenData::from_json(&json),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(OrbitError::TokenNotFound {
                profile: profile.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, profile: &str) -> Result<()> {
        match fs::remove_file(self.path_for(profile)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    Ok(())
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn sample() -> TokenData {
        let mut data = TokenData::new("abc", "Bearer");
        data.refresh_token = Some("refresh".to_string());
        data.scopes = vec!["openid".to_string()];
        data
    }

    #[test]
    fn keyring_keys_are_deterministic() {
        assert_eq!(keyring_key("staging"), "profile:staging");
        assert_eq!(keyring_key("staging"), keyring_key("staging"));
    }

    #[test]
    fn default_profile_keeps_legacy_keys() {
        assert_eq!(keyring_key(""), "token");
        assert_eq!(keyring_key(DEFAULT_PROFILE), "token");
        assert_eq!(file_name(""), "default.json");
        assert_eq!(file_name(DEFAULT_PROFILE), "default.json");
    }

    #[test]
    fn file_names_contain_no_separators() {
        assert_eq!(file_name("foo/bar"), "foo%2Fbar.json");
        assert_eq!(file_name("a\\b/c"), "a%5Cb%2Fc.json");
        assert_eq!(file_name("100%"), "100%25.json");
    }

    #[test]
    fn similar_profile_names_get_distinct_files() {
        let names = ["foo/bar", "foo_bar", "foo%2Fbar", "foo\\bar"];
        let files: std::collections::HashSet<_> = names.iter().map(|n| file_name(n)).collect();
        assert_eq!(files.len(), names.len());

        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();
        for name in names {
            store.save(name, &TokenData::new(name, "Bearer")).unwrap();
        }
        for name in names {
            assert_eq!(store.load(name).unwrap().access_token, name);
        }
    }

    #[test]
    fn file_store_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path().join("tokens")).unwrap();

        store.save("staging", &sample()).unwrap();
        assert_eq!(store.load("staging").unwrap(), sample());
    }

    #[test]
    fn file_store_sanitizes_profile_names() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();

        store.save("foo/bar", &sample()).unwrap();

        let entries: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec!["foo%2Fbar.json".to_string()]);
        assert!(!tmp.path().join("foo").exists());
        assert_eq!(store.load("foo/bar").unwrap(), sample());
    }

    #[test]
    fn file_store_load_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();

        let err = store.load("never-saved").unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {err:?}");
    }

    #[test]
    fn file_store_delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();

        store.save("staging", &sample()).unwrap();
        store.delete("staging").unwrap();
        store.delete("staging").unwrap();
        assert!(store.load("staging").unwrap_err().is_not_found());
    }

    #[test]
    fn file_store_save_replaces_record() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();

        store.save("staging", &sample()).unwrap();
        let replacement = TokenData::new("new-token", "Bearer");
        store.save("staging", &replacement).unwrap();

        assert_eq!(store.load("staging").unwrap(), replacement);
        assert!(!store.path_for("staging").with_extension("json.tmp").exists());
    }

    #[test]
    fn file_store_reports_corruption() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path()).unwrap();
        fs::write(store.path_for("staging"), "not json").unwrap();

        assert!(matches!(
            store.load("staging"),
            Err(OrbitError::InvalidCredentials)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn file_store_uses_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("tokens");
        let store = FileStore::new(&dir).unwrap();
        store.save("staging", &sample()).unwrap();

        let dir_mode = fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        let file_mode = fs::metadata(store.path_for("staging"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
        assert_eq!(file_mode, 0o600);
    }

    #[test]
    fn keyring_store_missing_entry_is_not_found() {
        keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        let store = KeyringStore::default();

        assert!(store.load("staging").unwrap_err().is_not_found());
        store.delete("staging").unwrap();
    }
}
