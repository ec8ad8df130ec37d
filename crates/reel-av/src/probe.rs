//! Source inspection via `ffprobe`.
//!
//! Only the facts the ladder and transcoder need are extracted: the
//! dominant video stream's display dimensions, whether an audio stream
//! exists, and the container duration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reel_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::command::ToolCommand;
use crate::ladder::Dimensions;
use crate::tools::ToolRegistry;

/// What the pipeline learns about a source video.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub duration_secs: Option<f64>,
    pub has_audio: bool,
}

impl SourceInfo {
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }
}

/// A backend that can inspect a media file.
#[async_trait]
pub trait Prober: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inspect `path`. Fails with [`Error::Probe`] when the file cannot be
    /// opened or has no video stream.
    async fn probe(&self, path: &Path, cancel: &CancellationToken) -> Result<SourceInfo>;
}

/// A prober backed by the `ffprobe` CLI.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe_path: PathBuf,
    timeout: Duration,
}

impl FfprobeProber {
    pub fn new(ffprobe_path: PathBuf, timeout: Duration) -> Self {
        Self {
            ffprobe_path,
            timeout,
        }
    }

    pub fn from_registry(tools: &ToolRegistry, timeout: Duration) -> Result<Self> {
        let ffprobe = tools.require("ffprobe")?;
        Ok(Self::new(ffprobe.path.clone(), timeout))
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    fn name(&self) -> &'static str {
        "ffprobe"
    }

    async fn probe(&self, path: &Path, cancel: &CancellationToken) -> Result<SourceInfo> {
        if !path.is_file() {
            return Err(Error::Probe(format!("cannot open {}", path.display())));
        }

        let mut cmd = ToolCommand::new(self.ffprobe_path.clone());
        cmd.args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ]);
        cmd.arg(path.to_string_lossy().as_ref());
        cmd.timeout(self.timeout).cancel_on(cancel.clone());

        let output = cmd.execute().await.map_err(|e| match e {
            Error::Tool { message, .. } => {
                Error::Probe(format!("ffprobe failed on {}: {message}", path.display()))
            }
            other => other,
        })?;

        let info = parse_ffprobe_output(&output.stdout)?;
        tracing::debug!(
            source = %path.display(),
            width = info.width,
            height = info.height,
            has_audio = info.has_audio,
            "Probed source"
        );
        Ok(info)
    }
}

// ---------------------------------------------------------------------------
// JSON structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    disposition: FfprobeDisposition,
    #[serde(default)]
    tags: FfprobeTags,
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeDisposition {
    #[serde(default)]
    attached_pic: u8,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeTags {
    rotate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeSideData {
    rotation: Option<i32>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Extract [`SourceInfo`] from ffprobe's JSON.
///
/// Max height wins among real video streams (cover art and zero-sized
/// streams are ignored); the first stream wins a tie. Streams rotated a
/// quarter turn report their display dimensions, since that is what the
/// decoder hands the scaler.
pub fn parse_ffprobe_output(json: &str) -> Result<SourceInfo> {
    let output: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| Error::Probe(format!("ffprobe JSON parse error: {e}")))?;

    let mut best: Option<Dimensions> = None;
    let mut has_audio = false;

    for stream in &output.streams {
        match stream.codec_type.as_deref() {
            Some("audio") => has_audio = true,
            Some("video") => {
                if stream.disposition.attached_pic == 1 {
                    continue;
                }
                let (Some(width), Some(height)) = (stream.width, stream.height) else {
                    continue;
                };
                if width == 0 || height == 0 {
                    continue;
                }
                let dims = if is_quarter_turn(stream) {
                    Dimensions::new(height, width)
                } else {
                    Dimensions::new(width, height)
                };
                if best.map_or(true, |b| dims.height > b.height) {
                    best = Some(dims);
                }
            }
            _ => {}
        }
    }

    let dims = best.ok_or_else(|| Error::Probe("no video stream found".into()))?;
    let duration_secs = output
        .format
        .duration
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0);

    Ok(SourceInfo {
        width: dims.width,
        height: dims.height,
        duration_secs,
        has_audio,
    })
}

fn is_quarter_turn(stream: &FfprobeStream) -> bool {
    let rotation = stream
        .side_data_list
        .iter()
        .find_map(|sd| sd.rotation)
        .or_else(|| stream.tags.rotate.as_deref().and_then(|r| r.parse().ok()))
        .unwrap_or(0);
    rotation.rem_euclid(180) == 90
}
