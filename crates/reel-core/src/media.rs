//! Media-domain types: asset kinds and statuses, ladder rungs, derivative
//! specs, and the records the pipeline publishes.
//!
//! Status values serialize in uppercase (`PENDING`, `READY`, ...) to match
//! what the consuming backend stores; the other enums are lowercase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::ids::EntityId;

// ---------------------------------------------------------------------------
// MediaStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of one asset.
///
/// ```text
/// PENDING --> PROCESSING --> READY
///                  \-------> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MediaStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl MediaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Ready => "READY",
            Self::Failed => "FAILED",
        }
    }

    /// Whether a new handoff may move this asset into PROCESSING.
    pub fn accepts_upload(&self) -> bool {
        !matches!(self, Self::Processing)
    }
}

impl fmt::Display for MediaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "READY" => Ok(Self::Ready),
            "FAILED" => Ok(Self::Failed),
            other => Err(Error::Validation(format!("unknown media status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// MediaKind / AssetKey
// ---------------------------------------------------------------------------

/// What an asset is. Each kind of one entity has its own status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Adaptive stream of an uploaded video.
    Video,
    /// Derivatives of a video's cover image.
    Thumbnail,
    /// Derivatives of a user's profile picture.
    ProfilePicture,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Thumbnail => "thumbnail",
            Self::ProfilePicture => "profile_picture",
        }
    }

    /// Subdirectory under the entity directory that holds this kind's
    /// derivative files. Videos write straight into the entity directory.
    pub fn category(&self) -> Option<&'static str> {
        match self {
            Self::Video => None,
            Self::Thumbnail => Some("thumbnails"),
            Self::ProfilePicture => Some("avatars"),
        }
    }

    /// Filename label of derivative files (`<label>-<width>p.webp`).
    pub fn label(&self) -> &'static str {
        match self {
            Self::Video => "stream",
            Self::Thumbnail => "thumbnail",
            Self::ProfilePicture => "avatar",
        }
    }

    pub fn is_image(&self) -> bool {
        !matches!(self, Self::Video)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(Self::Video),
            "thumbnail" => Ok(Self::Thumbnail),
            "profile_picture" => Ok(Self::ProfilePicture),
            other => Err(Error::Validation(format!("unknown media kind: {other}"))),
        }
    }
}

/// The unit of status tracking and mutual exclusion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetKey {
    pub entity: EntityId,
    pub kind: MediaKind,
}

impl AssetKey {
    pub fn new(entity: EntityId, kind: MediaKind) -> Self {
        Self { entity, kind }
    }

    pub fn video(entity: EntityId) -> Self {
        Self::new(entity, MediaKind::Video)
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.entity)
    }
}

// ---------------------------------------------------------------------------
// Ladder configuration
// ---------------------------------------------------------------------------

/// One configured rung of the resolution/bitrate ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityRung {
    pub height: u32,
    /// Explicit width; derived from the source aspect ratio when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    pub bitrate_kbps: u32,
}

impl QualityRung {
    pub const fn new(height: u32, bitrate_kbps: u32) -> Self {
        Self {
            height,
            width: None,
            bitrate_kbps,
        }
    }

    /// Audio bitrate paired with this rung: `height / 7.5` kbps, rounded.
    pub fn audio_bitrate_kbps(&self) -> u32 {
        (f64::from(self.height) / 7.5).round() as u32
    }
}

// ---------------------------------------------------------------------------
// Image derivative configuration
// ---------------------------------------------------------------------------

/// How a derivative is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivativeKind {
    /// Tiny preview returned as a data URI.
    Inline,
    /// Resized file written to disk.
    File,
}

impl DerivativeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::File => "file",
        }
    }
}

impl FromStr for DerivativeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline" => Ok(Self::Inline),
            "file" => Ok(Self::File),
            other => Err(Error::Validation(format!("unknown derivative kind: {other}"))),
        }
    }
}

/// Resize policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fit {
    /// Fit inside the box, letterboxing the remainder. Never crops.
    #[default]
    Contain,
    /// Fill the box, cropping the overflow around the centre.
    Cover,
}

/// One requested image derivative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDerivativeSpec {
    pub kind: DerivativeKind,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub fit: Fit,
}

impl ImageDerivativeSpec {
    pub const fn file(width: u32, height: u32, fit: Fit) -> Self {
        Self {
            kind: DerivativeKind::File,
            width,
            height,
            fit,
        }
    }

    pub const fn inline(width: u32, height: u32, fit: Fit) -> Self {
        Self {
            kind: DerivativeKind::Inline,
            width,
            height,
            fit,
        }
    }
}

impl fmt::Display for ImageDerivativeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}x{}", self.kind.as_str(), self.width, self.height)
    }
}

// ---------------------------------------------------------------------------
// Published records
// ---------------------------------------------------------------------------

/// A produced derivative. `locator` is a public path for FILE derivatives
/// and a data URI for INLINE ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Derivative {
    pub height: u32,
    pub width: u32,
    pub kind: DerivativeKind,
    pub locator: String,
}

/// One published stream variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    /// Public path of the variant playlist.
    pub locator: String,
}

/// What the pipeline persists on a successful video run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedStream {
    /// Public path of the master playlist.
    pub master_locator: String,
    pub variants: Vec<VariantRecord>,
    pub duration_secs: Option<f64>,
    pub source_width: u32,
    pub source_height: u32,
}

/// Persisted state of one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub key: AssetKey,
    pub status: MediaStatus,
    pub diagnostic: Option<String>,
    pub master_locator: Option<String>,
    pub duration_secs: Option<f64>,
    pub source_width: Option<u32>,
    pub source_height: Option<u32>,
    pub variants: Vec<VariantRecord>,
    pub derivatives: Vec<Derivative>,
    pub updated_at: DateTime<Utc>,
}

impl AssetRecord {
    /// A fresh record in PENDING.
    pub fn pending(key: AssetKey) -> Self {
        Self {
            key,
            status: MediaStatus::Pending,
            diagnostic: None,
            master_locator: None,
            duration_secs: None,
            source_width: None,
            source_height: None,
            variants: Vec::new(),
            derivatives: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// The playable stream URL, exposed only once the asset is READY.
    pub fn stream_url(&self) -> Option<&str> {
        match self.status {
            MediaStatus::Ready => self.master_locator.as_deref(),
            _ => None,
        }
    }
}
