mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use reel_av::{
    select_ladder, Dimensions, FfmpegEncoder, FfprobeProber, Prober, ToolRegistry,
};
use reel_core::config::Config;
use reel_core::events::EventBus;
use reel_core::{EntityId, MediaKind};
use reel_pipeline::{Backends, JobOutcome, MediaController, MemoryStore, StagedUpload};
use tokio_util::sync::CancellationToken;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "reeler=trace,reel_pipeline=trace,reel_av=trace,reel_image=debug,reel_db=debug,reel_server=debug,tower_http=debug".to_string()
        } else {
            "reeler=info,reel_pipeline=info,reel_av=info,reel_image=info,reel_db=info,reel_server=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Serve { host, port } => {
            let mut config = load_config(cli.config.as_deref());
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(reel_server::start(config))?;
            Ok(())
        }
        Commands::Transcode { entity, file } => {
            let config = load_config(cli.config.as_deref());
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_once(config, &entity, &file, MediaKind::Video))
        }
        Commands::Derivatives {
            entity,
            image,
            avatar,
        } => {
            let config = load_config(cli.config.as_deref());
            let kind = if avatar {
                MediaKind::ProfilePicture
            } else {
                MediaKind::Thumbnail
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_once(config, &entity, &image, kind))
        }
        Commands::Probe { file, json } => {
            let config = load_config(cli.config.as_deref());
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(probe_file(&config, &file, json))
        }
        Commands::Ladder { height, width } => {
            let config = load_config(cli.config.as_deref());
            show_ladder(&config, height, width)
        }
        Commands::CheckTools => {
            let config = load_config(cli.config.as_deref());
            check_tools(&config)
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
    }
}

fn load_config(path: Option<&Path>) -> Config {
    let mut config = Config::load_or_default(path);
    config.apply_env_overrides();
    config
}

/// Guess the MIME type the API layer would have declared.
fn guess_mime(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    Some(match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => return None,
    })
}

/// Run one upload through the pipeline against an in-memory store.
async fn run_once(config: Config, entity: &str, source: &Path, kind: MediaKind) -> Result<()> {
    let entity = EntityId::parse(entity)?;
    if !source.is_file() {
        anyhow::bail!("File does not exist: {}", source.display());
    }
    let mime = guess_mime(source)
        .with_context(|| format!("cannot guess a MIME type for {}", source.display()))?;

    // The controller consumes its input on success; stage a copy.
    let staging = tempfile::tempdir()?;
    let file_name = source
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("upload"));
    let staged_path = staging.path().join(file_name);
    tokio::fs::copy(source, &staged_path)
        .await
        .with_context(|| format!("failed to stage {}", source.display()))?;

    let tools = ToolRegistry::discover(&config.tools);
    let backends = Backends {
        store: Arc::new(MemoryStore::new()),
        prober: Arc::new(FfprobeProber::from_registry(
            &tools,
            Duration::from_secs(config.transcode.probe_timeout_secs),
        )?),
        encoder: Arc::new(FfmpegEncoder::from_registry(&tools)?),
    };
    let controller = MediaController::new(&config, backends, Arc::new(EventBus::default()));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling job");
            ctrl_c.cancel();
        }
    });

    tracing::info!(entity = %entity, kind = %kind, source = %source.display(), "Running one-shot job");
    let upload = StagedUpload::new(entity, kind, staged_path, mime);
    let outcome = controller.handle_upload(upload, &cancel).await?;

    match outcome {
        JobOutcome::Stream(stream) => {
            println!("Master: {}", stream.master_locator);
            if let Some(d) = stream.duration_secs {
                println!("Duration: {d:.2}s");
            }
            println!("Source: {}x{}", stream.source_width, stream.source_height);
            for v in &stream.variants {
                println!(
                    "  [{}] {}x{} @ {}k - {}",
                    v.index, v.width, v.height, v.bitrate_kbps, v.locator
                );
            }
        }
        JobOutcome::Images {
            derivatives,
            failures,
        } => {
            for d in &derivatives {
                let mut locator: String = d.locator.chars().take(72).collect();
                if locator.len() < d.locator.len() {
                    locator.push_str("...");
                }
                println!("  {} {}x{} - {}", d.kind.as_str(), d.width, d.height, locator);
            }
            for f in &failures {
                println!("  failed: {f}");
            }
        }
    }

    Ok(())
}

async fn probe_file(config: &Config, file: &Path, json: bool) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {}", file.display());
    }

    let tools = ToolRegistry::discover(&config.tools);
    let prober = FfprobeProber::from_registry(
        &tools,
        Duration::from_secs(config.transcode.probe_timeout_secs),
    )?;
    let info = prober.probe(file, &CancellationToken::new()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("File: {}", file.display());
        println!("Video: {}x{}", info.width, info.height);
        match info.duration_secs {
            Some(secs) => {
                let secs = secs.round() as u64;
                println!(
                    "Duration: {:02}:{:02}:{:02}",
                    secs / 3600,
                    (secs / 60) % 60,
                    secs % 60
                );
            }
            None => println!("Duration: unknown"),
        }
        println!("Audio: {}", if info.has_audio { "yes" } else { "no" });
    }

    Ok(())
}

fn show_ladder(config: &Config, height: u32, width: Option<u32>) -> Result<()> {
    let width = width.unwrap_or_else(|| reel_av::ladder::derive_width(height, Dimensions::new(16, 9)));
    let ladder = select_ladder(Dimensions::new(width, height), &config.transcode.qualities)?;

    println!("Source: {width}x{height}");
    if ladder.upscaled {
        println!("Source is shorter than every rung; the smallest rung is used.");
    }
    for (i, rung) in ladder.iter().enumerate() {
        println!(
            "  stream_{i}: {}x{} video {}k audio {}k",
            rung.width, rung.height, rung.bitrate_kbps, rung.audio_bitrate_kbps
        );
    }
    Ok(())
}

fn check_tools(config: &Config) -> Result<()> {
    println!("Checking external tools...\n");

    let tools = ToolRegistry::discover(&config.tools);
    let mut all_ok = true;

    for tool in tools.check_all() {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Video uploads will fail until they are installed.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            let contents = std::fs::read_to_string(p)
                .with_context(|| format!("failed to read {}", p.display()))?;
            Config::from_json(&contents)?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("✓ Configuration is valid");
    } else {
        for w in &warnings {
            println!("! {w}");
        }
    }
    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!("  Videos: {}", config.media.videos_root.display());
    println!("  Users: {}", config.media.users_root.display());
    println!("  Uploads: {}", config.media.upload_dir.display());
    let heights: Vec<String> = config
        .transcode
        .qualities
        .iter()
        .map(|q| format!("{}p", q.height))
        .collect();
    println!("  Ladder: {}", heights.join(", "));
    println!(
        "  Derivatives: {} thumbnail, {} avatar",
        config.images.thumbnails.len(),
        config.images.avatars.len()
    );
    println!(
        "  Auth: {}",
        if config.auth.transcoder_secret.is_some() {
            "shared secret"
        } else {
            "open"
        }
    );

    Ok(())
}
