//! Ephemeral audio artifacts on local storage.
//!
//! Every artifact gets a fresh `<prefix>_<uuid8>_<unixtime>.<ext>` name so
//! rapid-fire deliveries never share a path.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::debug;

use crate::config::ArtifactConfig;
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub id: String,
    pub local_path: PathBuf,
    pub created_at: DateTime<Local>,
}

impl Artifact {
    pub fn file_name(&self) -> String {
        self.local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

pub trait ArtifactStore: Send + Sync {
    /// Write `content` to a freshly named file.
    fn create(&self, content: &[u8], name_hint: &str) -> Result<Artifact, StoreError>;

    /// Remove the artifact's file. Deleting an already-deleted artifact is a no-op.
    fn delete(&self, artifact: &Artifact) -> Result<(), StoreError>;
}

pub struct LocalArtifactStore {
    dir: PathBuf,
    prefix: String,
    extension: String,
}

impl LocalArtifactStore {
    pub fn new(config: &ArtifactConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            prefix: config.prefix.clone(),
            extension: config.extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name_for(&self, token: &str, hint: &str, created_at: &DateTime<Local>) -> String {
        let hint = sanitize(hint);
        let prefix = if hint.is_empty() { self.prefix.as_str() } else { hint.as_str() };
        format!("{prefix}_{token}_{}.{}", created_at.timestamp(), self.extension)
    }
}

impl ArtifactStore for LocalArtifactStore {
    fn create(&self, content: &[u8], name_hint: &str) -> Result<Artifact, StoreError> {
        if content.is_empty() {
            return Err(StoreError::EmptyContent);
        }

        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let token: String = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let created_at = Local::now();
        let local_path = self.dir.join(self.file_name_for(&token, name_hint, &created_at));

        // create_new: a clash means the token was not fresh, never overwrite
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&local_path)
            .map_err(|source| StoreError::Io {
                path: local_path.clone(),
                source,
            })?;
        write_or_discard(&mut file, &local_path, content)?;

        debug!("Created artifact {} ({} bytes)", local_path.display(), content.len());

        Ok(Artifact {
            id: token,
            local_path,
            created_at,
        })
    }

    fn delete(&self, artifact: &Artifact) -> Result<(), StoreError> {
        match fs::remove_file(&artifact.local_path) {
            Ok(()) => {
                debug!("Deleted artifact {}", artifact.local_path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                path: artifact.local_path.clone(),
                source,
            }),
        }
    }
}

/// Write `content`, removing the half-written file at `path` on failure.
fn write_or_discard(file: &mut impl Write, path: &Path, content: &[u8]) -> Result<(), StoreError> {
    file.write_all(content).and_then(|()| file.flush()).map_err(|source| {
        if let Err(e) = fs::remove_file(path) {
            debug!("Could not remove partial artifact {}: {e}", path.display());
        }
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

fn sanitize(hint: &str) -> String {
    hint.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}
