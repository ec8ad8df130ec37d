//! Mapping between entity identifiers, storage paths and public URLs.
//!
//! A [`PathResolver`] owns one storage root and the public prefix it is
//! served under. Every storage path it hands out lives under
//! `root/<entity>/` and [`PathResolver::strip_to_public_path`] maps it back
//! to `prefix/<entity>/...`, so the two are exact inverses.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};
use crate::ids::EntityId;

/// Resolves storage and public locations for one media root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    root: PathBuf,
    public_prefix: String,
}

impl PathResolver {
    /// `public_prefix` is normalised to have no trailing slash; an empty
    /// prefix yields root-relative URLs such as `/clip/master.m3u8`.
    pub fn new(root: impl Into<PathBuf>, public_prefix: impl AsRef<str>) -> Self {
        Self {
            root: root.into(),
            public_prefix: public_prefix.as_ref().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn public_prefix(&self) -> &str {
        &self.public_prefix
    }

    /// Directory exclusively owned by `id`.
    pub fn entity_dir(&self, id: &EntityId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// `root/<id>/<segments...>`.
    pub fn resolve_media_path(&self, id: &EntityId, segments: &[&str]) -> Result<PathBuf> {
        let mut path = self.entity_dir(id);
        for segment in segments {
            validate_segment(segment)?;
            path.push(segment);
        }
        Ok(path)
    }

    /// `root/<id>/<category>/<filename>`.
    pub fn resolve_derivative_path(
        &self,
        id: &EntityId,
        category: &str,
        filename: &str,
    ) -> Result<PathBuf> {
        self.resolve_media_path(id, &[category, filename])
    }

    /// Public URL of a path produced by this resolver.
    ///
    /// Fails for paths outside the root or containing non-normal
    /// components, which is how a caller learns it was handed a path this
    /// resolver never produced.
    pub fn strip_to_public_path(&self, path: &Path) -> Result<String> {
        let relative = path.strip_prefix(&self.root).map_err(|_| {
            Error::InvalidIdentifier(format!(
                "{} is outside media root {}",
                path.display(),
                self.root.display()
            ))
        })?;

        let mut url = self.public_prefix.clone();
        let mut segments = 0usize;
        for component in relative.components() {
            let Component::Normal(raw) = component else {
                return Err(Error::InvalidIdentifier(format!(
                    "unexpected component in {}",
                    path.display()
                )));
            };
            let segment = raw.to_str().ok_or_else(|| {
                Error::InvalidIdentifier(format!("non UTF-8 path {}", path.display()))
            })?;
            url.push('/');
            url.push_str(segment);
            segments += 1;
        }

        if segments == 0 {
            return Err(Error::InvalidIdentifier(format!(
                "{} is the media root itself",
                path.display()
            )));
        }
        Ok(url)
    }
}

/// Reject anything that could escape or alias the entity directory.
pub fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() || segment == "." || segment == ".." {
        return Err(Error::InvalidIdentifier(format!(
            "invalid path segment {segment:?}"
        )));
    }
    if segment.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidIdentifier(format!(
            "path segment {segment:?} contains a separator or NUL"
        )));
    }
    Ok(())
}
