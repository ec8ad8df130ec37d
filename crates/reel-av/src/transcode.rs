//! HLS ladder transcoding.
//!
//! One ffmpeg invocation decodes the source once, splits the video into one
//! scaled branch per rung and muxes every variant into
//! `stream_<n>/stream.m3u8` + `stream_<n>/data<NN>.ts`. All variants use
//! constant bitrate and the same fixed GOP so their keyframes line up.
//!
//! The master playlist is not produced by ffmpeg. [`StreamTranscoder`]
//! writes it after the encoder exits cleanly and every variant playlist
//! exists, through a temp file and an atomic rename, so a failed or
//! cancelled run never leaves a master playlist behind.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reel_core::config::TranscodeConfig;
use reel_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::command::ToolCommand;
use crate::ladder::{LadderRung, SelectedLadder};
use crate::tools::ToolRegistry;

/// File name of the master playlist inside the destination directory.
pub const MASTER_PLAYLIST: &str = "master.m3u8";
/// File name of each variant playlist inside its `stream_<n>` directory.
pub const VARIANT_PLAYLIST: &str = "stream.m3u8";

/// Encoder knobs shared by every job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeSettings {
    pub segment_secs: u32,
    pub keyframe_interval: u32,
    pub preset: String,
    pub timeout: Duration,
}

impl From<&TranscodeConfig> for TranscodeSettings {
    fn from(cfg: &TranscodeConfig) -> Self {
        Self {
            segment_secs: cfg.segment_secs.max(1),
            keyframe_interval: cfg.keyframe_interval.max(1),
            preset: cfg.video_preset.clone(),
            timeout: Duration::from_secs(cfg.transcode_timeout_secs),
        }
    }
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self::from(&TranscodeConfig::default())
    }
}

/// Everything needed for one encode.
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub ladder: SelectedLadder,
    pub has_audio: bool,
    pub settings: TranscodeSettings,
}

impl TranscodeJob {
    pub fn variant_dir(&self, index: usize) -> PathBuf {
        self.destination.join(format!("stream_{index}"))
    }

    pub fn variant_playlist(&self, index: usize) -> PathBuf {
        self.variant_dir(index).join(VARIANT_PLAYLIST)
    }

    pub fn master_playlist(&self) -> PathBuf {
        self.destination.join(MASTER_PLAYLIST)
    }

    /// The full ffmpeg argument list for this job.
    pub fn ffmpeg_args(&self) -> Vec<String> {
        let rungs = self.ladder.rungs();
        let s = &self.settings;
        let mut args: Vec<String> = Vec::new();
        let mut push = |items: &[&str]| args.extend(items.iter().map(|a| a.to_string()));

        push(&["-hide_banner", "-nostats", "-nostdin", "-y", "-i"]);
        push(&[&self.source.to_string_lossy()]);
        push(&["-filter_complex", &filter_graph(rungs)]);

        for (i, rung) in rungs.iter().enumerate() {
            let bitrate = format!("{}k", rung.bitrate_kbps);
            push(&[
                "-map",
                &format!("[v{i}out]"),
                &format!("-c:v:{i}"),
                "libx264",
                &format!("-b:v:{i}"),
                &bitrate,
                &format!("-maxrate:v:{i}"),
                &bitrate,
                &format!("-minrate:v:{i}"),
                &bitrate,
                &format!("-bufsize:v:{i}"),
                &bitrate,
            ]);
        }

        if self.has_audio {
            for (i, rung) in rungs.iter().enumerate() {
                push(&[
                    "-map",
                    "0:a:0",
                    &format!("-c:a:{i}"),
                    "aac",
                    &format!("-b:a:{i}"),
                    &format!("{}k", rung.audio_bitrate_kbps),
                    "-ac",
                    "2",
                ]);
            }
        }

        let gop = s.keyframe_interval.to_string();
        push(&[
            "-x264-params",
            "nal-hrd=cbr:force-cfr=1",
            "-pix_fmt",
            "yuv420p",
            "-preset",
            &s.preset,
            "-g",
            &gop,
            "-keyint_min",
            &gop,
            "-sc_threshold",
            "0",
        ]);

        let segments = self.destination.join("stream_%v").join("data%02d.ts");
        let playlists = self.destination.join("stream_%v").join(VARIANT_PLAYLIST);
        push(&[
            "-f",
            "hls",
            "-hls_time",
            &s.segment_secs.to_string(),
            "-hls_playlist_type",
            "vod",
            "-hls_flags",
            "independent_segments",
            "-hls_segment_type",
            "mpegts",
            "-hls_segment_filename",
            &segments.to_string_lossy(),
            "-var_stream_map",
            &var_stream_map(rungs.len(), self.has_audio),
            &playlists.to_string_lossy(),
        ]);

        args
    }
}

/// `[0:v]split=N[v0]..;[v0]scale=w=W:h=H[v0out];..`
fn filter_graph(rungs: &[LadderRung]) -> String {
    let mut graph = format!("[0:v]split={}", rungs.len());
    for i in 0..rungs.len() {
        let _ = write!(graph, "[v{i}]");
    }
    for (i, rung) in rungs.iter().enumerate() {
        let _ = write!(
            graph,
            ";[v{i}]scale=w={}:h={}[v{i}out]",
            rung.width, rung.height
        );
    }
    graph
}

/// `v:0,a:0 v:1,a:1 ..` (video only when the source has no audio).
fn var_stream_map(count: usize, has_audio: bool) -> String {
    (0..count)
        .map(|i| {
            if has_audio {
                format!("v:{i},a:{i}")
            } else {
                format!("v:{i}")
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs the actual encode for a job.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Encode `job`. On success every variant playlist must exist. A
    /// failure is [`Error::Transcode`] carrying the encoder's diagnostic
    /// output, or [`Error::Cancelled`].
    async fn encode(&self, job: &TranscodeJob, cancel: &CancellationToken) -> Result<()>;
}

/// [`Encoder`] backed by the ffmpeg CLI.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg_path: PathBuf,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg_path: PathBuf) -> Self {
        Self { ffmpeg_path }
    }

    pub fn from_registry(tools: &ToolRegistry) -> Result<Self> {
        Ok(Self::new(tools.require("ffmpeg")?.path.clone()))
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(&self, job: &TranscodeJob, cancel: &CancellationToken) -> Result<()> {
        let mut cmd = ToolCommand::new(self.ffmpeg_path.clone());
        cmd.args(job.ffmpeg_args());
        cmd.timeout(job.settings.timeout).cancel_on(cancel.clone());

        tracing::debug!(command = %cmd.display(), "Starting encoder");

        let output = cmd.output().await.map_err(|e| match e {
            Error::Tool { tool, message } => Error::transcode(format!("{tool} {message}"), ""),
            other => other,
        })?;

        if !output.status.success() {
            return Err(Error::transcode(
                format!("ffmpeg exited with status {}", output.status),
                output.stderr_tail(),
            ));
        }
        Ok(())
    }
}

/// One published variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamVariant {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub audio_bitrate_kbps: Option<u32>,
    pub playlist: PathBuf,
}

impl StreamVariant {
    /// Declared peak bandwidth in bits per second.
    pub fn bandwidth(&self) -> u64 {
        (u64::from(self.bitrate_kbps) + u64::from(self.audio_bitrate_kbps.unwrap_or(0))) * 1000
    }
}

/// Result of a successful transcode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamManifest {
    pub master_playlist: PathBuf,
    pub variants: Vec<StreamVariant>,
}

/// Drives an [`Encoder`] and publishes the master playlist.
#[derive(Clone)]
pub struct StreamTranscoder {
    encoder: Arc<dyn Encoder>,
}

impl StreamTranscoder {
    pub fn new(encoder: Arc<dyn Encoder>) -> Self {
        Self { encoder }
    }

    /// Transcode `job.source` into `job.destination`.
    ///
    /// Output of an earlier run (master playlist and `stream_*`
    /// directories) is removed first. On failure the destination is left
    /// as the encoder left it.
    pub async fn transcode(
        &self,
        job: &TranscodeJob,
        cancel: &CancellationToken,
    ) -> Result<StreamManifest> {
        if job.ladder.is_empty() {
            return Err(Error::transcode("ladder has no rungs", ""));
        }
        if !job.source.is_file() {
            return Err(Error::transcode(
                format!("source {} does not exist", job.source.display()),
                "",
            ));
        }

        std::fs::create_dir_all(&job.destination)?;
        clear_previous_output(&job.destination)?;
        for i in 0..job.ladder.len() {
            std::fs::create_dir_all(job.variant_dir(i))?;
        }

        tracing::info!(
            source = %job.source.display(),
            destination = %job.destination.display(),
            rungs = ?job.ladder.heights(),
            "Transcoding"
        );

        self.encoder.encode(job, cancel).await?;

        let variants = job
            .ladder
            .iter()
            .enumerate()
            .map(|(i, rung)| StreamVariant {
                index: i as u32,
                width: rung.width,
                height: rung.height,
                bitrate_kbps: rung.bitrate_kbps,
                audio_bitrate_kbps: job.has_audio.then_some(rung.audio_bitrate_kbps),
                playlist: job.variant_playlist(i),
            })
            .collect::<Vec<_>>();

        for variant in &variants {
            let present = std::fs::metadata(&variant.playlist)
                .map(|m| m.len() > 0)
                .unwrap_or(false);
            if !present {
                return Err(Error::transcode(
                    format!(
                        "encoder finished but {} is missing or empty",
                        variant.playlist.display()
                    ),
                    "",
                ));
            }
        }

        let master = job.master_playlist();
        write_master_playlist(&job.destination, &master, &variants)?;

        Ok(StreamManifest {
            master_playlist: master,
            variants,
        })
    }
}

/// Render the master playlist. Variant URIs are relative to the master.
pub fn render_master_playlist(variants: &[StreamVariant]) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-INDEPENDENT-SEGMENTS\n");
    for v in variants {
        let _ = writeln!(
            out,
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}",
            v.bandwidth(),
            v.width,
            v.height
        );
        let _ = writeln!(out, "stream_{}/{}", v.index, VARIANT_PLAYLIST);
    }
    out
}

fn write_master_playlist(dir: &Path, master: &Path, variants: &[StreamVariant]) -> Result<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".master")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(render_master_playlist(variants).as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(master).map_err(|e| Error::from(e.error))?;
    Ok(())
}

/// Remove a master playlist and `stream_<n>` directories left by an
/// earlier run. Anything else in the directory is untouched.
fn clear_previous_output(dir: &Path) -> Result<()> {
    match std::fs::remove_file(dir.join(MASTER_PLAYLIST)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let is_variant = name
            .strip_prefix("stream_")
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
        if is_variant && entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}
