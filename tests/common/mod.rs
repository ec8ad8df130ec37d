//! Shared test harness for integration tests.
//!
//! [`TestHarness`] builds a [`MediaController`] over temporary media roots
//! with a scripted prober and encoder. [`TestHarness::serve`] starts the
//! full Axum router on a random port for HTTP-level testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use reel_av::{Encoder, Prober, SourceInfo, ToolRegistry, TranscodeJob};
use reel_core::config::Config;
use reel_core::events::EventBus;
use reel_core::{EntityId, Error, MediaKind, Result};
use reel_pipeline::{Backends, MediaController, MediaStore, MemoryStore, SqliteStore, StagedUpload};
use reel_server::context::AppContext;
use reel_server::router::build_router;

// ---------------------------------------------------------------------------
// Scripted prober
// ---------------------------------------------------------------------------

/// Prober returning a fixed answer.
pub struct ScriptedProber {
    answer: Mutex<std::result::Result<SourceInfo, String>>,
}

impl ScriptedProber {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            answer: Mutex::new(Ok(SourceInfo {
                width,
                height,
                duration_secs: Some(42.0),
                has_audio: true,
            })),
        }
    }

    pub fn set_source(&self, width: u32, height: u32) {
        *self.answer.lock().unwrap() = Ok(SourceInfo {
            width,
            height,
            duration_secs: Some(42.0),
            has_audio: true,
        });
    }

    pub fn fail_with(&self, message: &str) {
        *self.answer.lock().unwrap() = Err(message.to_string());
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn probe(&self, path: &Path, _cancel: &CancellationToken) -> Result<SourceInfo> {
        if !path.is_file() {
            return Err(Error::Probe(format!("cannot open {}", path.display())));
        }
        self.answer.lock().unwrap().clone().map_err(Error::Probe)
    }
}

// ---------------------------------------------------------------------------
// Scripted encoder
// ---------------------------------------------------------------------------

/// Encoder that writes stub variant playlists.
///
/// With `hold(true)` each encode blocks until [`ScriptedEncoder::release`]
/// or cancellation; with `fail(true)` it exits like a failed ffmpeg.
pub struct ScriptedEncoder {
    hold: AtomicBool,
    fail: AtomicBool,
    release: Semaphore,
    started: Semaphore,
    calls: AtomicUsize,
}

impl ScriptedEncoder {
    pub fn new() -> Self {
        Self {
            hold: AtomicBool::new(false),
            fail: AtomicBool::new(false),
            release: Semaphore::new(0),
            started: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn hold(&self, on: bool) {
        self.hold.store(on, Ordering::SeqCst);
    }

    pub fn fail(&self, on: bool) {
        self.fail.store(on, Ordering::SeqCst);
    }

    /// Let one held encode finish.
    pub fn release(&self) {
        self.release.add_permits(1);
    }

    /// Wait until an encode has started.
    pub async fn wait_started(&self) {
        self.started.acquire().await.unwrap().forget();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Encoder for ScriptedEncoder {
    async fn encode(&self, job: &TranscodeJob, cancel: &CancellationToken) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.add_permits(1);

        if self.hold.load(Ordering::SeqCst) {
            tokio::select! {
                permit = self.release.acquire() => permit.unwrap().forget(),
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled("encoder cancelled".into()));
                }
            }
        }

        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::transcode(
                "ffmpeg exited with status exit status: 1",
                "Invalid data found when processing input",
            ));
        }

        for i in 0..job.ladder.len() {
            std::fs::write(
                job.variant_playlist(i),
                "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:2.0,\nseg_000.ts\n#EXT-X-ENDLIST\n",
            )?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct TestHarness {
    pub dir: TempDir,
    pub config: Config,
    pub prober: Arc<ScriptedProber>,
    pub encoder: Arc<ScriptedEncoder>,
    pub store: Arc<dyn MediaStore>,
    pub controller: MediaController,
    pub ctx: AppContext,
}

impl TestHarness {
    /// Harness over an in-memory store with a 1440p source.
    pub fn new() -> Self {
        Self::build(|_| {}, Arc::new(MemoryStore::new()))
    }

    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        Self::build(tweak, Arc::new(MemoryStore::new()))
    }

    /// Harness over an in-memory SQLite database.
    pub fn with_sqlite() -> Self {
        let pool = reel_db::init_memory_pool().expect("failed to create in-memory pool");
        Self::build(|_| {}, Arc::new(SqliteStore::new(pool)))
    }

    fn build(tweak: impl FnOnce(&mut Config), store: Arc<dyn MediaStore>) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut config = Config::default();
        config.media.videos_root = dir.path().join("media/videos");
        config.media.users_root = dir.path().join("media/users");
        config.media.upload_dir = dir.path().join("uploads");
        config.transcode.max_concurrent_jobs = Some(4);
        tweak(&mut config);
        std::fs::create_dir_all(&config.media.upload_dir).unwrap();

        let prober = Arc::new(ScriptedProber::new(2560, 1440));
        let encoder = Arc::new(ScriptedEncoder::new());
        let backends = Backends {
            store: Arc::clone(&store),
            prober: prober.clone(),
            encoder: encoder.clone(),
        };
        let controller = MediaController::new(&config, backends, Arc::new(EventBus::default()));
        let ctx = AppContext::new(
            Arc::new(config.clone()),
            controller.clone(),
            Arc::new(ToolRegistry::default()),
        );

        Self {
            dir,
            config,
            prober,
            encoder,
            store,
            controller,
            ctx,
        }
    }

    /// Start the Axum router on a random port.
    pub async fn serve(&self) -> SocketAddr {
        let app = build_router(self.ctx.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        addr
    }

    pub fn upload_dir(&self) -> &Path {
        &self.config.media.upload_dir
    }

    pub fn video_dir(&self, id: &str) -> PathBuf {
        self.config.media.videos_root.join(id)
    }

    /// Write a fake video into the upload directory.
    pub fn stage_file(&self, name: &str) -> PathBuf {
        let path = self.upload_dir().join(name);
        std::fs::write(&path, b"\x00\x00\x00\x18ftypmp42 not really a video").unwrap();
        path
    }

    /// Write a real PNG into the upload directory.
    pub fn stage_image(&self, name: &str, width: u32, height: u32) -> PathBuf {
        let path = self.upload_dir().join(name);
        let img = image::RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([(x % 255) as u8, (y % 255) as u8, 128, 255])
        });
        img.save(&path).unwrap();
        path
    }

    pub fn video_upload(&self, id: &str, file: &str) -> StagedUpload {
        let path = self.stage_file(file);
        StagedUpload::new(EntityId::parse(id).unwrap(), MediaKind::Video, path, "video/mp4")
    }

    pub fn image_upload(&self, id: &str, kind: MediaKind, file: &str) -> StagedUpload {
        let path = self.stage_image(file, 640, 480);
        StagedUpload::new(EntityId::parse(id).unwrap(), kind, path, "image/png")
    }
}

pub fn id(raw: &str) -> EntityId {
    EntityId::parse(raw).unwrap()
}
