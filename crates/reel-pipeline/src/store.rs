//! Persistence seam between the controller and whoever owns asset status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use reel_core::{
    AssetKey, AssetRecord, Derivative, Error, JobId, MediaStatus, PublishedStream, Result,
};
use reel_db::queries::assets::{self, Lease};
use reel_db::{DbPool, PooledConnection};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Where asset status and published locators are recorded.
///
/// Completing writes (`complete_*`, `fail`) only apply while the asset is
/// still PROCESSING under the given job id.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Move `key` into PROCESSING for `job_id`, clearing anything
    /// previously published. Returns `false` if it is already PROCESSING.
    async fn begin_processing(&self, key: &AssetKey, job_id: JobId) -> Result<bool>;

    async fn complete_stream(
        &self,
        key: &AssetKey,
        job_id: JobId,
        stream: PublishedStream,
    ) -> Result<()>;

    async fn complete_images(
        &self,
        key: &AssetKey,
        job_id: JobId,
        derivatives: Vec<Derivative>,
        diagnostic: Option<String>,
    ) -> Result<()>;

    async fn fail(&self, key: &AssetKey, job_id: JobId, diagnostic: String) -> Result<()>;

    async fn get(&self, key: &AssetKey) -> Result<Option<AssetRecord>>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Slot {
    job_id: Option<JobId>,
    record: AssetRecord,
}

/// Process-local store. Used by the CLI and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    assets: DashMap<AssetKey, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record.
    pub fn records(&self) -> Vec<AssetRecord> {
        let mut out: Vec<_> = self.assets.iter().map(|s| s.record.clone()).collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    fn update<F>(&self, key: &AssetKey, job_id: JobId, f: F) -> Result<()>
    where
        F: FnOnce(&mut AssetRecord),
    {
        let mut slot = self
            .assets
            .get_mut(key)
            .filter(|s| s.job_id == Some(job_id) && s.record.status == MediaStatus::Processing)
            .ok_or_else(|| Error::Internal(format!("{key} is no longer processing job {job_id}")))?;
        f(&mut slot.record);
        slot.record.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl MediaStore for MemoryStore {
    async fn begin_processing(&self, key: &AssetKey, job_id: JobId) -> Result<bool> {
        let mut slot = self.assets.entry(key.clone()).or_insert_with(|| Slot {
            job_id: None,
            record: AssetRecord::pending(key.clone()),
        });
        if !slot.record.status.accepts_upload() {
            return Ok(false);
        }
        slot.job_id = Some(job_id);
        slot.record = AssetRecord {
            status: MediaStatus::Processing,
            ..AssetRecord::pending(key.clone())
        };
        Ok(true)
    }

    async fn complete_stream(
        &self,
        key: &AssetKey,
        job_id: JobId,
        stream: PublishedStream,
    ) -> Result<()> {
        self.update(key, job_id, |r| {
            r.status = MediaStatus::Ready;
            r.diagnostic = None;
            r.master_locator = Some(stream.master_locator);
            r.duration_secs = stream.duration_secs;
            r.source_width = Some(stream.source_width);
            r.source_height = Some(stream.source_height);
            r.variants = stream.variants;
        })
    }

    async fn complete_images(
        &self,
        key: &AssetKey,
        job_id: JobId,
        derivatives: Vec<Derivative>,
        diagnostic: Option<String>,
    ) -> Result<()> {
        self.update(key, job_id, |r| {
            r.status = MediaStatus::Ready;
            r.diagnostic = diagnostic;
            r.derivatives = derivatives;
        })
    }

    async fn fail(&self, key: &AssetKey, job_id: JobId, diagnostic: String) -> Result<()> {
        self.update(key, job_id, |r| {
            r.status = MediaStatus::Failed;
            r.diagnostic = Some(diagnostic);
        })
    }

    async fn get(&self, key: &AssetKey) -> Result<Option<AssetRecord>> {
        Ok(self.assets.get(key).map(|s| s.record.clone()))
    }
}

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

/// How long a PROCESSING claim survives without renewal.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

/// Store backed by the reel-db SQLite schema. Every call runs on the
/// blocking pool.
///
/// Claims are taken under this store's [`Lease`]. Keep them alive with
/// [`SqliteStore::spawn_lease_renewal`] while jobs run, otherwise another
/// instance sharing the database may reclaim them once they lapse.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
    lease: Arc<Lease>,
}

impl SqliteStore {
    /// Store with a fresh random owner id and [`DEFAULT_LEASE_TTL`].
    pub fn new(pool: DbPool) -> Self {
        Self::with_lease(pool, Lease::new(Uuid::new_v4().to_string(), DEFAULT_LEASE_TTL))
    }

    pub fn with_lease(pool: DbPool, lease: Lease) -> Self {
        Self {
            pool,
            lease: Arc::new(lease),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    /// Extend every claim this store holds. Returns how many were renewed.
    pub async fn renew_leases(&self) -> Result<usize> {
        let lease = Arc::clone(&self.lease);
        self.with_conn(move |conn| assets::renew_leases(conn, &lease))
            .await
    }

    /// Renew this store's claims every third of the lease TTL until
    /// `cancel` fires.
    pub fn spawn_lease_renewal(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        let period = (self.lease.ttl / 3).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.renew_leases().await {
                            tracing::warn!(owner = %store.lease.owner, "Lease renewal failed: {e}");
                        }
                    }
                }
            }
            tracing::debug!(owner = %store.lease.owner, "Lease renewal stopped");
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&PooledConnection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = reel_db::get_conn(&pool)?;
            f(&conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("database task failed: {e}")))?
    }
}

#[async_trait]
impl MediaStore for SqliteStore {
    async fn begin_processing(&self, key: &AssetKey, job_id: JobId) -> Result<bool> {
        let key = key.clone();
        let lease = Arc::clone(&self.lease);
        self.with_conn(move |conn| assets::begin_processing(conn, &key, job_id, &lease))
            .await
    }

    async fn complete_stream(
        &self,
        key: &AssetKey,
        job_id: JobId,
        stream: PublishedStream,
    ) -> Result<()> {
        let key = key.clone();
        self.with_conn(move |conn| assets::complete_stream(conn, &key, job_id, &stream))
            .await
    }

    async fn complete_images(
        &self,
        key: &AssetKey,
        job_id: JobId,
        derivatives: Vec<Derivative>,
        diagnostic: Option<String>,
    ) -> Result<()> {
        let key = key.clone();
        self.with_conn(move |conn| {
            assets::complete_images(conn, &key, job_id, &derivatives, diagnostic.as_deref())
        })
        .await
    }

    async fn fail(&self, key: &AssetKey, job_id: JobId, diagnostic: String) -> Result<()> {
        let key = key.clone();
        self.with_conn(move |conn| assets::fail_asset(conn, &key, job_id, &diagnostic))
            .await
    }

    async fn get(&self, key: &AssetKey) -> Result<Option<AssetRecord>> {
        let key = key.clone();
        self.with_conn(move |conn| assets::get_asset(conn, &key)).await
    }
}
