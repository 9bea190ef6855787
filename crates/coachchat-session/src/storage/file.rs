//! JSON file credential storage.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use coachchat_core::{CredentialStore, Session, StoreError, StoredCredentials, UserId};
use serde::{Deserialize, Serialize};

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct CredentialFile {
    version: u32,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    user_id: Option<UserId>,
}

/// Credentials persisted as a small JSON document.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// crash mid-write leaves either the old pair or the new pair on disk.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// Store credentials at `path`. The file need not exist yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the credentials file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<StoredCredentials, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StoredCredentials::default()),
            Err(e) => return Err(e.into()),
        };

        let file: CredentialFile =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        if file.version != FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported format version {}",
                file.version
            )));
        }

        Ok(StoredCredentials {
            token: file.token,
            user_id: file.user_id,
        })
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = CredentialFile {
            version: FORMAT_VERSION,
            token: Some(session.token.clone()),
            user_id: Some(session.user_id.clone()),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|e| StoreError::Internal(e.to_string()))?;

        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await?;
        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        tracing::debug!(path = %self.path.display(), "Credentials saved");
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Credentials cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
