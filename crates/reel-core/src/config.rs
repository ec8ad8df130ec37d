//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs for the server, media roots, tools, the quality ladder and
//! image derivative sets. Every section defaults sensibly so a completely
//! empty `{}` file is valid. Deployment-specific values can be overridden
//! from the environment with [`Config::apply_env_overrides`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::media::{Fit, ImageDerivativeSpec, QualityRung};
use crate::paths::PathResolver;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub tools: ToolsConfig,
    pub transcode: TranscodeConfig,
    pub images: ImagesConfig,
    pub auth: AuthConfig,
    pub backend: BackendConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Apply `MEDIA_DIR`, `UPLOAD_DIR`, `TRANSCODER_SECRET` and
    /// `BACKEND_URL` from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup.
    ///
    /// `MEDIA_DIR` relocates both media roots (`videos/` and `users/`
    /// beneath it). `BACKEND_URL` is the backend's base URL; the status
    /// callback path is appended.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = lookup("MEDIA_DIR") {
            let dir = PathBuf::from(dir);
            self.media.videos_root = dir.join("videos");
            self.media.users_root = dir.join("users");
        }
        if let Some(dir) = lookup("UPLOAD_DIR") {
            self.media.upload_dir = PathBuf::from(dir);
        }
        if let Some(secret) = lookup("TRANSCODER_SECRET") {
            self.auth.transcoder_secret = Some(secret.clone());
            self.backend.secret = Some(secret);
        }
        if let Some(url) = lookup("BACKEND_URL") {
            self.backend.status_url = Some(format!(
                "{}/transcoder/update-status",
                url.trim_end_matches('/')
            ));
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be assigned".into());
        }
        if self.server.lease_secs == 0 {
            warnings.push("server.lease_secs is 0; treated as 1".into());
        }

        let rungs = &self.transcode.qualities;
        if rungs.is_empty() {
            warnings.push("transcode.qualities is empty; video uploads will fail".into());
        }
        for pair in rungs.windows(2) {
            if pair[1].height >= pair[0].height {
                warnings.push(format!(
                    "transcode.qualities is not strictly descending ({} then {})",
                    pair[0].height, pair[1].height
                ));
            }
        }
        for (i, rung) in rungs.iter().enumerate() {
            if rung.height == 0 || rung.bitrate_kbps == 0 {
                warnings.push(format!("transcode.qualities[{i}] has a zero height or bitrate"));
            }
            if rung.height % 2 != 0 {
                warnings.push(format!(
                    "transcode.qualities[{i}].height {} is odd; video uploads will be rejected",
                    rung.height
                ));
            }
            if let Some(w) = rung.width.filter(|w| w % 2 != 0) {
                warnings.push(format!(
                    "transcode.qualities[{i}].width {w} is odd and will be rounded up"
                ));
            }
        }
        if self.transcode.segment_secs == 0 {
            warnings.push("transcode.segment_secs is 0".into());
        }
        if self.transcode.max_concurrent_jobs == Some(0) {
            warnings.push("transcode.max_concurrent_jobs is 0; treated as 1".into());
        }

        for (name, set) in [
            ("images.thumbnails", &self.images.thumbnails),
            ("images.avatars", &self.images.avatars),
        ] {
            if set.is_empty() {
                warnings.push(format!("{name} is empty; no derivatives will be produced"));
            }
            for (i, spec) in set.iter().enumerate() {
                if spec.width == 0 || spec.height == 0 {
                    warnings.push(format!("{name}[{i}] has a zero dimension"));
                }
            }
        }
        if !(0.0..=100.0).contains(&self.images.webp_quality) {
            warnings.push(format!(
                "images.webp_quality {} is outside 0..=100",
                self.images.webp_quality
            ));
        }

        if self.backend.status_url.is_some() && self.backend.secret.is_none() {
            warnings.push("backend.status_url is set but backend.secret is missing".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Stable id of this instance in the shared database. A restart with
    /// the same id reclaims the rows its previous life left PROCESSING.
    /// Random per process when unset.
    pub instance_id: Option<String>,
    /// Lifetime of a PROCESSING claim between renewals.
    pub lease_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 1338,
            db_path: PathBuf::from("./data/reeler.db"),
            instance_id: None,
            lease_secs: 60,
        }
    }
}

/// Storage roots, public prefixes and accepted upload types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub videos_root: PathBuf,
    pub videos_public_prefix: String,
    pub users_root: PathBuf,
    pub users_public_prefix: String,
    /// Directory the API layer stages uploads into.
    pub upload_dir: PathBuf,
    pub video_mime_types: Vec<String>,
    pub image_mime_types: Vec<String>,
}

impl MediaConfig {
    pub fn video_paths(&self) -> PathResolver {
        PathResolver::new(&self.videos_root, &self.videos_public_prefix)
    }

    pub fn user_paths(&self) -> PathResolver {
        PathResolver::new(&self.users_root, &self.users_public_prefix)
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            videos_root: PathBuf::from("./media/videos"),
            videos_public_prefix: "/media/videos".into(),
            users_root: PathBuf::from("./media/users"),
            users_public_prefix: "/media/users".into(),
            upload_dir: PathBuf::from("./uploads"),
            video_mime_types: ["video/mp4", "video/quicktime", "video/webm", "video/x-matroska"]
                .map(String::from)
                .to_vec(),
            image_mime_types: ["image/jpeg", "image/png", "image/webp", "image/gif"]
                .map(String::from)
                .to_vec(),
        }
    }
}

/// Paths to external CLI tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

/// Ladder and encoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Configured rungs, highest resolution first.
    pub qualities: Vec<QualityRung>,
    pub segment_secs: u32,
    pub keyframe_interval: u32,
    pub video_preset: String,
    pub probe_timeout_secs: u64,
    pub transcode_timeout_secs: u64,
    /// Upper bound on concurrently running pipelines. Defaults to the
    /// number of CPU cores.
    pub max_concurrent_jobs: Option<usize>,
}

/// The stock ladder, 2160p down to 240p.
pub fn default_qualities() -> Vec<QualityRung> {
    vec![
        QualityRung::new(2160, 34000),
        QualityRung::new(1440, 13000),
        QualityRung::new(1080, 6000),
        QualityRung::new(720, 4000),
        QualityRung::new(480, 2000),
        QualityRung::new(360, 1000),
        QualityRung::new(240, 700),
    ]
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            qualities: default_qualities(),
            segment_secs: 2,
            keyframe_interval: 48,
            video_preset: "slow".into(),
            probe_timeout_secs: 30,
            transcode_timeout_secs: 24 * 60 * 60,
            max_concurrent_jobs: None,
        }
    }
}

/// Image derivative sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    pub thumbnails: Vec<ImageDerivativeSpec>,
    pub avatars: Vec<ImageDerivativeSpec>,
    /// Lossy WebP quality for FILE derivatives, 0 to 100.
    pub webp_quality: f32,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            thumbnails: vec![
                ImageDerivativeSpec::inline(32, 18, Fit::Contain),
                ImageDerivativeSpec::file(426, 240, Fit::Contain),
                ImageDerivativeSpec::file(640, 360, Fit::Contain),
                ImageDerivativeSpec::file(854, 480, Fit::Contain),
                ImageDerivativeSpec::file(1280, 720, Fit::Contain),
                ImageDerivativeSpec::file(1920, 1080, Fit::Contain),
            ],
            avatars: vec![
                ImageDerivativeSpec::inline(16, 16, Fit::Cover),
                ImageDerivativeSpec::file(48, 48, Fit::Cover),
                ImageDerivativeSpec::file(96, 96, Fit::Cover),
                ImageDerivativeSpec::file(256, 256, Fit::Cover),
            ],
            webp_quality: 80.0,
        }
    }
}

/// Handoff surface authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret expected in `X-Transcoder-Secret`. When unset the
    /// surface is open.
    pub transcoder_secret: Option<String>,
}

/// Status callback to the owning backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub status_url: Option<String>,
    pub secret: Option<String>,
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            status_url: None,
            secret: None,
            timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 1338);
        assert_eq!(cfg.transcode.qualities.len(), 7);
        assert_eq!(cfg.transcode.qualities[0].height, 2160);
        assert_eq!(cfg.transcode.keyframe_interval, 48);
        assert_eq!(cfg.transcode.segment_secs, 2);
        assert_eq!(cfg.images.webp_quality, 80.0);
        assert_eq!(cfg.media.videos_public_prefix, "/media/videos");
    }

    #[test]
    fn default_config_no_warnings() {
        let warnings = Config::default().validate();
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
    }

    #[test]
    fn parse_empty_json_uses_defaults() {
        let cfg = Config::from_json("{}").unwrap();
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.images.avatars.len(), 4);
    }

    #[test]
    fn parse_custom_ladder() {
        let json = r#"{"transcode": {"qualities": [
            {"height": 720, "bitrate_kbps": 4000},
            {"height": 360, "width": 480, "bitrate_kbps": 1000}
        ]}}"#;
        let cfg = Config::from_json(json).unwrap();
        assert_eq!(cfg.transcode.qualities.len(), 2);
        assert_eq!(cfg.transcode.qualities[1].width, Some(480));
        assert_eq!(cfg.transcode.video_preset, "slow");
    }

    #[test]
    fn invalid_json_is_validation_error() {
        let err = Config::from_json("{not json").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn load_or_default_with_missing_file() {
        let cfg = Config::load_or_default(Some(Path::new("/nonexistent/reeler.json")));
        assert_eq!(cfg.server.port, 1338);
    }

    #[test]
    fn load_or_default_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reeler.json");
        std::fs::write(&path, r#"{"server": {"port": 9090}}"#).unwrap();
        let cfg = Config::load_or_default(Some(&path));
        assert_eq!(cfg.server.port, 9090);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("MEDIA_DIR", "/data/media"),
            ("UPLOAD_DIR", "/data/uploads"),
            ("TRANSCODER_SECRET", "s3cret"),
            ("BACKEND_URL", "http://backend:1337/"),
        ]
        .into_iter()
        .collect();

        let mut cfg = Config::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.media.videos_root, PathBuf::from("/data/media/videos"));
        assert_eq!(cfg.media.users_root, PathBuf::from("/data/media/users"));
        assert_eq!(cfg.media.upload_dir, PathBuf::from("/data/uploads"));
        assert_eq!(cfg.auth.transcoder_secret.as_deref(), Some("s3cret"));
        assert_eq!(
            cfg.backend.status_url.as_deref(),
            Some("http://backend:1337/transcoder/update-status")
        );
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let mut cfg = Config::default();
        cfg.apply_overrides(|_| Some("  ".into()));
        assert_eq!(cfg.media.upload_dir, PathBuf::from("./uploads"));
        assert!(cfg.auth.transcoder_secret.is_none());
    }

    #[test]
    fn non_descending_ladder_warns() {
        let mut cfg = Config::default();
        cfg.transcode.qualities = vec![QualityRung::new(480, 2000), QualityRung::new(720, 4000)];
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.contains("descending")));
    }

    #[test]
    fn odd_dimensions_warn() {
        let mut cfg = Config::default();
        cfg.transcode.qualities = vec![QualityRung {
            height: 721,
            width: Some(1279),
            bitrate_kbps: 4000,
        }];
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.contains("height 721 is odd")));
        assert!(warnings.iter().any(|w| w.contains("width 1279 is odd")));
    }

    #[test]
    fn empty_ladder_warns() {
        let mut cfg = Config::default();
        cfg.transcode.qualities.clear();
        assert!(cfg.validate().iter().any(|w| w.contains("qualities is empty")));
    }

    #[test]
    fn backend_without_secret_warns() {
        let mut cfg = Config::default();
        cfg.backend.status_url = Some("http://backend/transcoder/update-status".into());
        assert!(cfg.validate().iter().any(|w| w.contains("backend.secret")));
    }

    #[test]
    fn resolvers_follow_media_config() {
        let cfg = Config::default();
        assert_eq!(cfg.media.video_paths().public_prefix(), "/media/videos");
        assert_eq!(cfg.media.user_paths().root(), Path::new("./media/users"));
    }
}
