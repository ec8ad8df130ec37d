//! # reel-av
//!
//! Video side of the pipeline.
//!
//! - **Tool discovery** ([`ToolRegistry`]) finds ffmpeg and ffprobe.
//! - **Command execution** ([`ToolCommand`]) runs a tool in its own process
//!   group with a timeout and optional cancellation, killing the whole
//!   group when either fires.
//! - **Probe** ([`Prober`], [`FfprobeProber`]) finds the dominant video
//!   stream of a source.
//! - **Ladder selection** ([`select_ladder`]) bounds the configured rungs by
//!   the source resolution.
//! - **Stream transcoding** ([`StreamTranscoder`]) runs one multi-output
//!   encode and publishes the HLS master playlist.

pub mod command;
pub mod ladder;
pub mod probe;
pub mod tools;
pub mod transcode;

pub use command::{ToolCommand, ToolOutput};
pub use ladder::{select_ladder, Dimensions, LadderRung, QualityLadder, SelectedLadder};
pub use probe::{FfprobeProber, Prober, SourceInfo};
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
pub use transcode::{
    Encoder, FfmpegEncoder, StreamManifest, StreamTranscoder, StreamVariant, TranscodeJob,
    TranscodeSettings,
};
