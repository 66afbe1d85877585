//! On-disk token cache, readable by the owning user only.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use mist_core::CredentialError;
use serde::{Deserialize, Serialize};
use tracing::debug;

const STORE_DIR: &str = ".secure_store";

/// Seconds before expiry at which a cached access token is treated as stale.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix timestamp, seconds.
    pub expires_at: Option<i64>,
}

impl StoredToken {
    pub fn is_fresh(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - EXPIRY_SKEW_SECS > Utc::now().timestamp(),
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    /// Tokens live in `<user_data_dir>/.secure_store/`. Nothing is created
    /// until the first `save`.
    pub fn new(user_data_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: user_data_dir.as_ref().join(STORE_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load(&self, account_key: &str) -> Result<Option<StoredToken>, CredentialError> {
        let path = self.token_path(account_key);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(CredentialError::io(path, err)),
        };
        let token = serde_json::from_str(&data).map_err(|err| CredentialError::Serialization {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        Ok(Some(token))
    }

    pub fn save(&self, account_key: &str, token: &StoredToken) -> Result<(), CredentialError> {
        self.ensure_dir()?;
        let path = self.token_path(account_key);
        let data = serde_json::to_vec_pretty(token).map_err(|err| CredentialError::Serialization {
            path: path.clone(),
            reason: err.to_string(),
        })?;

        let tmp = path.with_extension("json.tmp");
        write_private(&tmp, &data).map_err(|err| CredentialError::io(&tmp, err))?;
        fs::rename(&tmp, &path).map_err(|err| CredentialError::io(&path, err))?;
        debug!(path = %path.display(), "token saved");
        Ok(())
    }

    /// One file per account; the key is base64url-encoded, so distinct keys
    /// never share a file and no key can name a path outside the store.
    fn token_path(&self, account_key: &str) -> PathBuf {
        self.dir
            .join(format!("token-{}.json", URL_SAFE_NO_PAD.encode(account_key.as_bytes())))
    }

    /// The directory is restricted before anything is written into it.
    fn ensure_dir(&self) -> Result<(), CredentialError> {
        if let Some(parent) = self.dir.parent() {
            fs::create_dir_all(parent).map_err(|err| CredentialError::io(parent, err))?;
        }
        create_private_dir(&self.dir).map_err(|err| CredentialError::io(&self.dir, err))
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    match fs::DirBuilder::new().mode(0o700).create(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
        Err(err) => return Err(err),
    }
    // The umask may have narrowed the creation mode; pin it.
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(access: &str) -> StoredToken {
        StoredToken {
            access_token: access.into(),
            refresh_token: Some("refresh-1".into()),
            expires_at: Some(Utc::now().timestamp() + 3600),
        }
    }

    #[test]
    fn load_before_first_save_is_absent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CredentialStore::new(dir.path());
        assert_eq!(store.load("bambi@toontown.example")?, None);
        assert!(!store.dir().exists());
        Ok(())
    }

    #[test]
    fn saved_token_loads_back() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CredentialStore::new(dir.path().join("data"));
        store.save("bambi@toontown.example", &token("access-1"))?;
        store.save("bambi@toontown.example", &token("access-2"))?;
        store.save("thumper@toontown.example", &token("access-3"))?;

        let loaded = store.load("bambi@toontown.example")?;
        assert_eq!(loaded.map(|t| t.access_token).as_deref(), Some("access-2"));
        Ok(())
    }

    #[test]
    fn malformed_token_file_is_reported() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CredentialStore::new(dir.path());
        store.save("key", &token("a"))?;
        fs::write(store.token_path("key"), "not json")?;
        assert!(matches!(
            store.load("key"),
            Err(CredentialError::Serialization { .. })
        ));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn store_is_private_to_owner() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let store = CredentialStore::new(dir.path());
        store.save("bambi@toontown.example", &token("access"))?;

        let dir_mode = fs::metadata(store.dir())?.permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        let file_mode = fs::metadata(store.token_path("bambi@toontown.example"))?
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(file_mode, 0o600);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn existing_loose_directory_is_tightened() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let store = CredentialStore::new(dir.path());
        fs::create_dir(store.dir())?;
        fs::set_permissions(store.dir(), fs::Permissions::from_mode(0o755))?;

        store.save("key", &token("access"))?;
        let mode = fs::metadata(store.dir())?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
        Ok(())
    }

    #[test]
    fn keys_cannot_escape_the_store() {
        let store = CredentialStore::new("/data");
        for key in ["../../etc/passwd", "bambi@toontown.example", "", "a/b"] {
            let path = store.token_path(key);
            assert_eq!(path.parent(), Some(store.dir()), "{}", key);
        }
    }

    #[test]
    fn similar_keys_keep_separate_tokens() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CredentialStore::new(dir.path());
        store.save("a/b", &token("slash"))?;
        store.save("a_b", &token("underscore"))?;
        store.save("A_B", &token("upper"))?;

        let access = |key: &str| -> anyhow::Result<Option<String>> {
            Ok(store.load(key)?.map(|t| t.access_token))
        };
        assert_eq!(access("a/b")?.as_deref(), Some("slash"));
        assert_eq!(access("a_b")?.as_deref(), Some("underscore"));
        assert_eq!(access("A_B")?.as_deref(), Some("upper"));
        Ok(())
    }

    #[test]
    fn freshness_honours_skew() {
        let now = Utc::now().timestamp();
        let mut t = token("a");
        assert!(t.is_fresh());
        t.expires_at = Some(now + 30);
        assert!(!t.is_fresh());
        t.expires_at = None;
        assert!(!t.is_fresh());
    }
}
