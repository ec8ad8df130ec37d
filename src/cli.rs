use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "reeler")]
#[command(author, version, about = "Media transcoding pipeline: HLS ladders and image derivatives")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP handoff server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Transcode one video into an HLS ladder under the videos root
    Transcode {
        /// Video identifier
        entity: String,

        /// Source video file (copied before processing, never deleted)
        file: PathBuf,
    },

    /// Generate image derivatives under the media roots
    Derivatives {
        /// Video or user identifier
        entity: String,

        /// Source image (copied before processing, never deleted)
        image: PathBuf,

        /// Treat the image as a profile picture instead of a video thumbnail
        #[arg(long)]
        avatar: bool,
    },

    /// Probe a video file and display what the pipeline would use
    Probe {
        /// File to probe
        #[arg(required = true)]
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the quality ladder selected for a source resolution
    Ladder {
        /// Source height in pixels
        height: u32,

        /// Source width in pixels (defaults to 16:9)
        #[arg(long)]
        width: Option<u32>,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses --config if not specified)
        config: Option<PathBuf>,
    },
}
