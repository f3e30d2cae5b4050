//! Credential storage backends

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::TokenPair;

/// Key-value storage for the credential pair.
///
/// Implementations use interior mutability so a single store can be shared
/// between the refresher and any number of in-flight requests.
pub trait TokenStore: Send + Sync {
    fn access_token(&self) -> Option<String>;
    fn refresh_token(&self) -> Option<String>;
    fn set_tokens(&self, tokens: &TokenPair);
    fn clear_tokens(&self);

    /// Both tokens, if both are present.
    fn tokens(&self) -> Option<TokenPair> {
        Some(TokenPair::new(self.access_token()?, self.refresh_token()?))
    }
}

/// On-disk layout: two optional string values.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredCredentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
}

impl StoredCredentials {
    fn set(&mut self, tokens: &TokenPair) {
        self.access_token = Some(tokens.access_token.clone());
        self.refresh_token = Some(tokens.refresh_token.clone());
    }
}

/// Process-local store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    inner: Mutex<StoredCredentials>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: &TokenPair) -> Self {
        let store = Self::new();
        store.set_tokens(tokens);
        store
    }

    #[cfg(test)]
    pub(crate) fn set_access_only(&self, access_token: &str) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = StoredCredentials {
            access_token: Some(access_token.to_string()),
            refresh_token: None,
        };
    }
}

impl TokenStore for MemoryTokenStore {
    fn access_token(&self) -> Option<String> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.access_token.clone()
    }

    fn refresh_token(&self) -> Option<String> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.refresh_token.clone()
    }

    fn set_tokens(&self, tokens: &TokenPair) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.set(tokens);
    }

    fn clear_tokens(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = StoredCredentials::default();
    }
}

/// Store backed by a TOML file, cached in memory.
///
/// The cached copy is authoritative for this process. A failed write is
/// logged and does not fail the caller; the next successful write catches
/// the file up.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    cache: Mutex<StoredCredentials>,
}

impl FileTokenStore {
    /// Open the store at `path`, loading existing credentials if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cache = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            StoredCredentials::default()
        };

        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    /// Open the store in the platform data directory.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::config::data_dir()?.join("credentials.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, creds: &StoredCredentials) {
        if let Err(e) = write_credentials(&self.path, creds) {
            tracing::warn!("Failed to persist credentials: {:#}", e);
        }
    }
}

fn write_credentials(path: &Path, creds: &StoredCredentials) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).context("Failed to create credentials directory")?;
    }

    let content = toml::to_string_pretty(creds).context("Failed to serialize credentials")?;
    fs::write(path, content).context("Failed to write credentials file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms).context("Failed to set credentials permissions")?;
    }

    Ok(())
}

impl TokenStore for FileTokenStore {
    fn access_token(&self) -> Option<String> {
        let guard = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        guard.access_token.clone()
    }

    fn refresh_token(&self) -> Option<String> {
        let guard = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        guard.refresh_token.clone()
    }

    fn set_tokens(&self, tokens: &TokenPair) {
        let snapshot = {
            let mut guard = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            guard.set(tokens);
            guard.clone()
        };
        self.persist(&snapshot);
    }

    fn clear_tokens(&self) {
        {
            let mut guard = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            *guard = StoredCredentials::default();
        }
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}
