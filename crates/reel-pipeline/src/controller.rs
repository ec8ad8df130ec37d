//! Upload handoff and status controller.
//!
//! Per asset the lifecycle is
//!
//! ```text
//! PENDING --(admitted)--> PROCESSING --(pipeline ok)----> READY
//!                                   \--(pipeline error)--> FAILED
//! ```
//!
//! Admission validates the upload, claims the in-memory guard and then the
//! store's PROCESSING transition. A key that is already processing is
//! rejected with [`Error::ConcurrentUpload`], never queued. After admission
//! the job waits for a worker permit and runs its pipeline; the staged
//! input is deleted only once a successful outcome has been persisted.

use std::sync::Arc;

use reel_av::{
    select_ladder, Encoder, Prober, StreamManifest, StreamTranscoder, TranscodeJob,
    TranscodeSettings,
};
use reel_core::config::Config;
use reel_core::events::{EventBus, EventCategory, EventPayload};
use reel_core::{
    AssetKey, Derivative, Error, ImageDerivativeSpec, JobId, MediaKind, MediaStatus,
    PathResolver, PublishedStream, QualityRung, Result, VariantRecord,
};
use reel_image::{DerivativeGenerator, DerivativeOutput, DerivativeReport, DerivativeTarget};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::guard::{InFlightGuard, InFlightToken};
use crate::store::MediaStore;
use crate::upload::{mime_essence, StagedUpload};

/// External collaborators the controller drives.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn MediaStore>,
    pub prober: Arc<dyn Prober>,
    pub encoder: Arc<dyn Encoder>,
}

/// What a successful job published.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Stream(PublishedStream),
    Images {
        derivatives: Vec<Derivative>,
        /// `"<spec>: <error>"` for every derivative that failed.
        failures: Vec<String>,
    },
}

/// An admitted upload, holding its key until dropped.
struct Admitted {
    upload: StagedUpload,
    job_id: JobId,
    cancel: CancellationToken,
    _token: InFlightToken,
}

struct Inner {
    backends: Backends,
    transcoder: StreamTranscoder,
    derivatives: DerivativeGenerator,
    qualities: Vec<QualityRung>,
    settings: TranscodeSettings,
    videos: PathResolver,
    users: PathResolver,
    thumbnails: Vec<ImageDerivativeSpec>,
    avatars: Vec<ImageDerivativeSpec>,
    video_mime_types: Vec<String>,
    image_mime_types: Vec<String>,
    in_flight: InFlightGuard,
    permits: Semaphore,
    events: Arc<EventBus>,
    shutdown: CancellationToken,
}

/// Orchestrates uploads. Cheap to clone.
#[derive(Clone)]
pub struct MediaController {
    inner: Arc<Inner>,
}

impl MediaController {
    pub fn new(config: &Config, backends: Backends, events: Arc<EventBus>) -> Self {
        let workers = config
            .transcode
            .max_concurrent_jobs
            .unwrap_or_else(num_cpus::get)
            .max(1);
        let lower = |v: &[String]| v.iter().map(|m| mime_essence(m)).collect::<Vec<_>>();

        tracing::debug!(workers, "Media controller configured");

        let transcoder = StreamTranscoder::new(Arc::clone(&backends.encoder));
        Self {
            inner: Arc::new(Inner {
                backends,
                transcoder,
                derivatives: DerivativeGenerator::new(config.images.webp_quality),
                qualities: config.transcode.qualities.clone(),
                settings: TranscodeSettings::from(&config.transcode),
                videos: config.media.video_paths(),
                users: config.media.user_paths(),
                thumbnails: config.images.thumbnails.clone(),
                avatars: config.images.avatars.clone(),
                video_mime_types: lower(&config.media.video_mime_types),
                image_mime_types: lower(&config.media.image_mime_types),
                in_flight: InFlightGuard::new(),
                permits: Semaphore::new(workers),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn MediaStore> {
        &self.inner.backends.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn video_paths(&self) -> &PathResolver {
        &self.inner.videos
    }

    pub fn user_paths(&self) -> &PathResolver {
        &self.inner.users
    }

    pub fn is_in_flight(&self, key: &AssetKey) -> bool {
        self.inner.in_flight.is_running(key)
    }

    /// Number of admitted jobs that have not finished.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Cancel the job running for `key`. Returns `false` if there is none.
    pub fn cancel(&self, key: &AssetKey) -> bool {
        let cancelled = self.inner.in_flight.cancel(key);
        if cancelled {
            tracing::info!(asset = %key, "Cancellation requested");
        }
        cancelled
    }

    /// Cancel every running job. Each becomes FAILED.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Admit `upload` and run it to completion on the current task.
    ///
    /// `cancel` stops this job in addition to [`MediaController::cancel`]
    /// and [`MediaController::shutdown`].
    pub async fn handle_upload(
        &self,
        upload: StagedUpload,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome> {
        let admitted = self.admit(upload).await?;

        let job_cancel = admitted.cancel.clone();
        let external = cancel.clone();
        let forward = tokio::spawn(async move {
            external.cancelled().await;
            job_cancel.cancel();
        });

        let result = self.execute(admitted).await;
        forward.abort();
        result
    }

    /// Admit `upload` and run it on a spawned task.
    ///
    /// Rejection (bad MIME type, missing file, asset already processing) is
    /// reported here, before anything is spawned.
    pub async fn submit(&self, upload: StagedUpload) -> Result<(JobId, JoinHandle<Result<JobOutcome>>)> {
        let admitted = self.admit(upload).await?;
        let job_id = admitted.job_id;
        let this = self.clone();
        let handle = tokio::spawn(async move { this.execute(admitted).await });
        Ok((job_id, handle))
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    async fn admit(&self, upload: StagedUpload) -> Result<Admitted> {
        let key = upload.key.clone();

        if let Err(e) = self.check_upload(&upload) {
            self.reject(&key, &e);
            return Err(e);
        }

        let job_id = JobId::new();
        let cancel = self.inner.shutdown.child_token();
        let Some(token) = self.inner.in_flight.try_acquire(&key, job_id, cancel.clone()) else {
            let e = Error::concurrent_upload(&key);
            self.reject(&key, &e);
            return Err(e);
        };

        match self.inner.backends.store.begin_processing(&key, job_id).await {
            Ok(true) => {}
            Ok(false) => {
                let e = Error::concurrent_upload(&key);
                self.reject(&key, &e);
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        tracing::info!(asset = %key, job_id = %job_id, source = %upload.path.display(), "Upload accepted");
        self.inner.events.broadcast(
            EventCategory::Pipeline,
            EventPayload::UploadAccepted {
                entity: key.entity.clone(),
                kind: key.kind,
                job_id,
            },
        );
        self.status_changed(&key, job_id, MediaStatus::Processing, None, None);

        Ok(Admitted {
            upload,
            job_id,
            cancel,
            _token: token,
        })
    }

    fn check_upload(&self, upload: &StagedUpload) -> Result<()> {
        let essence = upload.essence();
        let allowed = match upload.kind() {
            MediaKind::Video => &self.inner.video_mime_types,
            MediaKind::Thumbnail | MediaKind::ProfilePicture => &self.inner.image_mime_types,
        };
        if !allowed.contains(&essence) {
            return Err(Error::Validation(format!(
                "MIME type {:?} is not accepted for {} uploads",
                upload.mime_type,
                upload.kind()
            )));
        }
        if !upload.path.is_file() {
            return Err(Error::Validation(format!(
                "staged file {} does not exist",
                upload.path.display()
            )));
        }
        Ok(())
    }

    fn reject(&self, key: &AssetKey, error: &Error) {
        tracing::warn!(asset = %key, "Upload rejected: {error}");
        self.inner.events.broadcast(
            EventCategory::Pipeline,
            EventPayload::UploadRejected {
                entity: key.entity.clone(),
                kind: key.kind,
                reason: error.to_string(),
            },
        );
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    async fn execute(&self, admitted: Admitted) -> Result<JobOutcome> {
        let Admitted {
            upload,
            job_id,
            cancel,
            _token,
        } = admitted;
        let key = upload.key.clone();

        let result = match self.run_pipeline(&upload, job_id, &cancel).await {
            Ok(outcome) => self.persist(&key, job_id, outcome).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) => {
                if let Err(e) = tokio::fs::remove_file(&upload.path).await {
                    tracing::warn!(
                        source = %upload.path.display(),
                        "Failed to remove staged input: {e}"
                    );
                }
                let duration = match &outcome {
                    JobOutcome::Stream(s) => s.duration_secs,
                    JobOutcome::Images { .. } => None,
                };
                tracing::info!(asset = %key, job_id = %job_id, "Job completed");
                self.status_changed(&key, job_id, MediaStatus::Ready, duration, None);
                Ok(outcome)
            }
            Err(e) => {
                let diagnostic = e.diagnostic();
                tracing::error!(
                    asset = %key,
                    job_id = %job_id,
                    source = %upload.path.display(),
                    "Job failed: {e}"
                );
                if let Err(store_err) = self
                    .inner
                    .backends
                    .store
                    .fail(&key, job_id, diagnostic.clone())
                    .await
                {
                    tracing::error!(asset = %key, "Failed to record failure: {store_err}");
                }
                self.status_changed(&key, job_id, MediaStatus::Failed, None, Some(diagnostic));
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        upload: &StagedUpload,
        job_id: JobId,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome> {
        let _permit = tokio::select! {
            permit = self.inner.permits.acquire() => {
                permit.map_err(|e| Error::Internal(format!("worker pool closed: {e}")))?
            }
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled(format!("{} cancelled while queued", upload.key)));
            }
        };

        match upload.kind() {
            MediaKind::Video => self.run_video(upload, cancel).await.map(JobOutcome::Stream),
            MediaKind::Thumbnail | MediaKind::ProfilePicture => {
                self.run_images(upload, job_id, cancel).await
            }
        }
    }

    async fn run_video(
        &self,
        upload: &StagedUpload,
        cancel: &CancellationToken,
    ) -> Result<PublishedStream> {
        let inner = &self.inner;
        let info = inner.backends.prober.probe(&upload.path, cancel).await?;
        let ladder = select_ladder(info.dimensions(), &inner.qualities)?;
        if ladder.upscaled {
            tracing::info!(
                asset = %upload.key,
                source_height = info.height,
                "Source is shorter than every rung; using the smallest"
            );
        }

        let job = TranscodeJob {
            source: upload.path.clone(),
            destination: inner.videos.entity_dir(upload.entity()),
            ladder,
            has_audio: info.has_audio,
            settings: inner.settings.clone(),
        };
        let manifest = inner.transcoder.transcode(&job, cancel).await?;

        Ok(PublishedStream {
            master_locator: inner.videos.strip_to_public_path(&manifest.master_playlist)?,
            variants: self.variant_records(&manifest)?,
            duration_secs: info.duration_secs,
            source_width: info.width,
            source_height: info.height,
        })
    }

    fn variant_records(&self, manifest: &StreamManifest) -> Result<Vec<VariantRecord>> {
        manifest
            .variants
            .iter()
            .map(|v| {
                Ok(VariantRecord {
                    index: v.index,
                    width: v.width,
                    height: v.height,
                    bitrate_kbps: v.bitrate_kbps,
                    locator: self.inner.videos.strip_to_public_path(&v.playlist)?,
                })
            })
            .collect()
    }

    async fn run_images(
        &self,
        upload: &StagedUpload,
        job_id: JobId,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome> {
        let kind = upload.kind();
        let (paths, specs) = match kind {
            MediaKind::ProfilePicture => (&self.inner.users, &self.inner.avatars),
            _ => (&self.inner.videos, &self.inner.thumbnails),
        };
        let target = DerivativeTarget {
            paths,
            entity: upload.entity(),
            category: kind.category().unwrap_or("images"),
            label: kind.label(),
        };

        let report = self
            .inner
            .derivatives
            .generate(&upload.path, target, specs, cancel)
            .await
            .map_err(|e| match e {
                Error::Cancelled(_) => Error::Cancelled(format!("{} cancelled", upload.key)),
                other => other,
            })?;

        let failures = self.report_failures(&upload.key, job_id, &report);
        let derivatives = published_derivatives(paths, &report)?;
        Ok(JobOutcome::Images {
            derivatives,
            failures,
        })
    }

    fn report_failures(
        &self,
        key: &AssetKey,
        job_id: JobId,
        report: &DerivativeReport,
    ) -> Vec<String> {
        report
            .failed()
            .map(|(spec, error)| {
                self.inner.events.broadcast(
                    EventCategory::Pipeline,
                    EventPayload::DerivativeFailed {
                        entity: key.entity.clone(),
                        kind: key.kind,
                        job_id,
                        spec: spec.to_string(),
                        error: error.to_string(),
                    },
                );
                format!("{spec}: {error}")
            })
            .collect()
    }

    async fn persist(&self, key: &AssetKey, job_id: JobId, outcome: JobOutcome) -> Result<JobOutcome> {
        let store = &self.inner.backends.store;
        match &outcome {
            JobOutcome::Stream(stream) => {
                store.complete_stream(key, job_id, stream.clone()).await?;
            }
            JobOutcome::Images {
                derivatives,
                failures,
            } => {
                let diagnostic = (!failures.is_empty()).then(|| failures.join("; "));
                store
                    .complete_images(key, job_id, derivatives.clone(), diagnostic)
                    .await?;
            }
        }
        Ok(outcome)
    }

    fn status_changed(
        &self,
        key: &AssetKey,
        job_id: JobId,
        status: MediaStatus,
        duration_secs: Option<f64>,
        diagnostic: Option<String>,
    ) {
        self.inner.events.broadcast(
            EventCategory::Status,
            EventPayload::StatusChanged {
                entity: key.entity.clone(),
                kind: key.kind,
                job_id,
                status,
                duration_secs,
                diagnostic,
            },
        );
    }
}

fn published_derivatives(paths: &PathResolver, report: &DerivativeReport) -> Result<Vec<Derivative>> {
    report
        .outcomes
        .iter()
        .filter_map(|o| o.result.as_ref().ok().map(|g| (o.spec.kind, g)))
        .map(|(kind, generated)| {
            let locator = match &generated.output {
                DerivativeOutput::File(path) => paths.strip_to_public_path(path)?,
                DerivativeOutput::Inline(uri) => uri.clone(),
            };
            Ok(Derivative {
                height: generated.height,
                width: generated.width,
                kind,
                locator,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use reel_av::SourceInfo;
    use reel_core::EntityId;
    use std::path::Path;

    struct FixedProber(SourceInfo);

    #[async_trait]
    impl Prober for FixedProber {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn probe(&self, _path: &Path, _cancel: &CancellationToken) -> Result<SourceInfo> {
            Ok(self.0)
        }
    }

    struct PlaylistEncoder;

    #[async_trait]
    impl Encoder for PlaylistEncoder {
        async fn encode(&self, job: &TranscodeJob, _cancel: &CancellationToken) -> Result<()> {
            for i in 0..job.ladder.len() {
                std::fs::write(job.variant_playlist(i), "#EXTM3U\n#EXT-X-ENDLIST\n")?;
            }
            Ok(())
        }
    }

    fn controller(root: &Path) -> (MediaController, Arc<MemoryStore>) {
        let mut config = Config::default();
        config.media.videos_root = root.join("videos");
        config.media.users_root = root.join("users");
        let store = Arc::new(MemoryStore::new());
        let backends = Backends {
            store: store.clone(),
            prober: Arc::new(FixedProber(SourceInfo {
                width: 1280,
                height: 720,
                duration_secs: Some(10.0),
                has_audio: true,
            })),
            encoder: Arc::new(PlaylistEncoder),
        };
        (
            MediaController::new(&config, backends, Arc::new(EventBus::default())),
            store,
        )
    }

    fn staged(dir: &Path, kind: MediaKind, mime: &str) -> StagedUpload {
        let path = dir.join("input.bin");
        std::fs::write(&path, b"data").unwrap();
        StagedUpload::new(EntityId::parse("clip").unwrap(), kind, path, mime)
    }

    #[tokio::test]
    async fn video_upload_publishes_stream() {
        let dir = tempfile::tempdir().unwrap();
        let (ctl, store) = controller(dir.path());
        let upload = staged(dir.path(), MediaKind::Video, "video/mp4");
        let input = upload.path.clone();

        let outcome = ctl
            .handle_upload(upload, &CancellationToken::new())
            .await
            .unwrap();

        let JobOutcome::Stream(stream) = outcome else {
            panic!("expected a stream outcome");
        };
        assert_eq!(stream.master_locator, "/media/videos/clip/master.m3u8");
        assert_eq!(stream.variants.len(), 4);
        assert!(!input.exists());

        let record = store
            .get(&AssetKey::video(EntityId::parse("clip").unwrap()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, MediaStatus::Ready);
    }

    #[tokio::test]
    async fn wrong_mime_is_rejected_before_any_state_change() {
        let dir = tempfile::tempdir().unwrap();
        let (ctl, store) = controller(dir.path());
        let upload = staged(dir.path(), MediaKind::Video, "image/png");
        let key = upload.key.clone();

        let err = ctl
            .handle_upload(upload, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_staged_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (ctl, _store) = controller(dir.path());
        let upload = StagedUpload::new(
            EntityId::parse("clip").unwrap(),
            MediaKind::Video,
            dir.path().join("gone.mp4"),
            "video/mp4",
        );
        let err = ctl
            .handle_upload(upload, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn cancel_without_job_reports_false() {
        let dir = tempfile::tempdir().unwrap();
        let (ctl, _store) = controller(dir.path());
        assert!(!ctl.cancel(&AssetKey::video(EntityId::parse("clip").unwrap())));
    }
}
