//! Staged uploads.

use std::path::{Path, PathBuf};

use reel_core::paths::validate_segment;
use reel_core::{AssetKey, EntityId, Error, MediaKind, Result};

/// A file the API layer has already written to disk, plus what it is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedUpload {
    pub key: AssetKey,
    pub path: PathBuf,
    pub mime_type: String,
}

impl StagedUpload {
    pub fn new(
        entity: EntityId,
        kind: MediaKind,
        path: impl Into<PathBuf>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            key: AssetKey::new(entity, kind),
            path: path.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Stage `file_name` from `upload_dir`. Names that would leave the
    /// directory are rejected.
    pub fn in_upload_dir(
        upload_dir: &Path,
        file_name: &str,
        entity: EntityId,
        kind: MediaKind,
        mime_type: impl Into<String>,
    ) -> Result<Self> {
        validate_segment(file_name)
            .map_err(|_| Error::Validation(format!("invalid upload file name {file_name:?}")))?;
        Ok(Self::new(entity, kind, upload_dir.join(file_name), mime_type))
    }

    pub fn entity(&self) -> &EntityId {
        &self.key.entity
    }

    pub fn kind(&self) -> MediaKind {
        self.key.kind
    }

    /// The declared type without parameters, lowercased.
    pub fn essence(&self) -> String {
        mime_essence(&self.mime_type)
    }
}

/// `type/subtype` of a MIME string, without parameters, lowercased.
pub fn mime_essence(raw: &str) -> String {
    raw.split(';').next().unwrap_or("").trim().to_ascii_lowercase()
}
