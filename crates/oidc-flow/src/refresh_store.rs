//! Refresh-token persistence keyed by user id
//!
//! The engine only consumes the `RefreshTokenStore` contract: `save`
//! overwrites, `load` of an unknown user is `None` rather than an error so
//! credential construction can always proceed (the credential just cannot
//! renew). Two implementations ship: a process-local map and a JSON file
//! written atomically.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use common::Secret;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::BoxFuture;
use crate::error::StoreError;

/// Thread-safe refresh-token storage shared by every session.
pub trait RefreshTokenStore: Send + Sync {
    fn save<'a>(
        &'a self,
        user_id: &'a str,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn load<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Option<Secret<String>>>;
}

/// Refresh tokens held in memory only; lost on restart.
#[derive(Default)]
pub struct InMemoryRefreshTokenStore {
    tokens: Mutex<HashMap<String, Secret<String>>>,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RefreshTokenStore for InMemoryRefreshTokenStore {
    fn save<'a>(
        &'a self,
        user_id: &'a str,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut tokens = self.tokens.lock().await;
            tokens.insert(user_id.to_owned(), Secret::from(refresh_token));
            debug!(user_id, "stored refresh token");
            Ok(())
        })
    }

    fn load<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Option<Secret<String>>> {
        Box::pin(async move {
            let tokens = self.tokens.lock().await;
            let token = tokens.get(user_id).cloned();
            debug!(user_id, found = token.is_some(), "loaded refresh token");
            token
        })
    }
}

/// Refresh tokens in a JSON object file (`{"<user id>": "<token>"}`).
///
/// The file is the source of truth across restarts; the mutex serializes
/// writers, and every write goes through temp-file + rename so a crash
/// never leaves a half-written file.
pub struct FileRefreshTokenStore {
    path: PathBuf,
    state: Mutex<HashMap<String, String>>,
}

impl FileRefreshTokenStore {
    /// Open the store, creating an empty `{}` file on cold start.
    pub async fn open(path: PathBuf) -> Result<Self, StoreError> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| StoreError::Io(format!("reading refresh token file: {e}")))?;
            let tokens: HashMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| StoreError::Parse(format!("parsing refresh token file: {e}")))?;
            info!(path = %path.display(), users = tokens.len(), "loaded refresh tokens");
            tokens
        } else {
            info!(path = %path.display(), "refresh token file not found, starting empty");
            let tokens = HashMap::new();
            write_atomic(&path, &tokens).await?;
            tokens
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl RefreshTokenStore for FileRefreshTokenStore {
    fn save<'a>(
        &'a self,
        user_id: &'a str,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut next = state.clone();
            next.insert(user_id.to_owned(), refresh_token.to_owned());
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!(user_id, "stored refresh token");
            Ok(())
        })
    }

    fn load<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Option<Secret<String>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            state.get(user_id).cloned().map(Secret::new)
        })
    }
}

/// Replace `path` with `data` via a sibling temp file and rename.
/// Owner-only permissions on unix: the file holds long-lived credentials.
async fn write_atomic(path: &Path, data: &HashMap<String, String>) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| StoreError::Parse(format!("serializing refresh tokens: {e}")))?;

    let tmp_path = temp_path(path)?;

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| StoreError::Io(format!("writing temp refresh token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| StoreError::Io(format!("setting refresh token file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| StoreError::Io(format!("renaming temp refresh token file: {e}")))?;

    debug!(path = %path.display(), "persisted refresh tokens");
    Ok(())
}

/// `.<file name>.tmp.<pid>` next to `path`, so stores in one directory
/// never share a temp file.
fn temp_path(path: &Path) -> Result<PathBuf, StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Io("refresh token path has no parent directory".into()))?;
    let name = path
        .file_name()
        .ok_or_else(|| StoreError::Io("refresh token path has no file name".into()))?;
    Ok(dir.join(format!(
        ".{}.tmp.{}",
        name.to_string_lossy(),
        std::process::id()
    )))
}
