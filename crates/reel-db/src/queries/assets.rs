//! Asset status transitions and lookups.
//!
//! Every completing write is conditioned on the asset still being
//! PROCESSING under the caller's job id, so a job that lost its claim (for
//! example after `reset_orphaned`) can never overwrite a newer state.
//!
//! A PROCESSING row also carries a [`Lease`]: the owning instance and an
//! expiry it keeps pushing forward with [`renew_leases`]. Rows whose lease
//! lapsed have no live process behind them and may be reclaimed.

use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use reel_core::{AssetKey, AssetRecord, Derivative, Error, JobId, PublishedStream, Result};

use crate::models::{derivative_from_row, variant_from_row, AssetRow};

const COLS: &str = "entity_id, kind, status, job_id, diagnostic, master_locator,
    duration_secs, source_width, source_height, created_at, updated_at";

fn db_err(e: rusqlite::Error) -> Error {
    Error::database(e.to_string())
}

/// The claim an instance holds on the rows it moved into PROCESSING.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub owner: String,
    pub ttl: Duration,
}

impl Lease {
    pub fn new(owner: impl Into<String>, ttl: Duration) -> Self {
        Self {
            owner: owner.into(),
            ttl,
        }
    }

    fn expires_at(&self, now_ms: i64) -> i64 {
        now_ms.saturating_add(i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX))
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Atomically move `key` into PROCESSING for `job_id` under `lease`.
///
/// Returns `false` when the asset is already PROCESSING under a lease that
/// has not expired. Previously published locators, variants and
/// derivatives are cleared in the same transaction.
pub fn begin_processing(
    conn: &Connection,
    key: &AssetKey,
    job_id: JobId,
    lease: &Lease,
) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let now_ms = now_millis();
    let tx = conn.unchecked_transaction().map_err(db_err)?;

    let changed = tx
        .execute(
            "INSERT INTO media_assets
                 (entity_id, kind, status, job_id, owner_id, lease_expires_at, created_at, updated_at)
             VALUES (?1, ?2, 'PROCESSING', ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(entity_id, kind) DO UPDATE SET
                 status = 'PROCESSING',
                 job_id = excluded.job_id,
                 owner_id = excluded.owner_id,
                 lease_expires_at = excluded.lease_expires_at,
                 diagnostic = NULL,
                 master_locator = NULL,
                 duration_secs = NULL,
                 source_width = NULL,
                 source_height = NULL,
                 updated_at = excluded.updated_at
             WHERE media_assets.status != 'PROCESSING'
                OR media_assets.lease_expires_at IS NULL
                OR media_assets.lease_expires_at <= ?7",
            rusqlite::params![
                key.entity.as_str(),
                key.kind.as_str(),
                job_id.to_string(),
                &lease.owner,
                lease.expires_at(now_ms),
                &now,
                now_ms,
            ],
        )
        .map_err(db_err)?;

    if changed == 0 {
        return Ok(false);
    }

    for table in ["stream_variants", "derivatives"] {
        tx.execute(
            &format!("DELETE FROM {table} WHERE entity_id = ?1 AND kind = ?2"),
            rusqlite::params![key.entity.as_str(), key.kind.as_str()],
        )
        .map_err(db_err)?;
    }

    tx.commit().map_err(db_err)?;
    Ok(true)
}

/// PROCESSING -> READY for a video, with its stream manifest.
pub fn complete_stream(
    conn: &Connection,
    key: &AssetKey,
    job_id: JobId,
    stream: &PublishedStream,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let tx = conn.unchecked_transaction().map_err(db_err)?;

    let changed = tx
        .execute(
            "UPDATE media_assets SET status = 'READY', diagnostic = NULL,
                 owner_id = NULL, lease_expires_at = NULL, master_locator = ?4, duration_secs = ?5, source_width = ?6,
                 source_height = ?7, updated_at = ?8
             WHERE entity_id = ?1 AND kind = ?2 AND job_id = ?3 AND status = 'PROCESSING'",
            rusqlite::params![
                key.entity.as_str(),
                key.kind.as_str(),
                job_id.to_string(),
                &stream.master_locator,
                stream.duration_secs,
                stream.source_width,
                stream.source_height,
                &now,
            ],
        )
        .map_err(db_err)?;
    ensure_claimed(changed, key, job_id)?;

    for v in &stream.variants {
        tx.execute(
            "INSERT INTO stream_variants
                 (entity_id, kind, variant_index, width, height, bitrate_kbps, locator)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                key.entity.as_str(),
                key.kind.as_str(),
                v.index,
                v.width,
                v.height,
                v.bitrate_kbps,
                &v.locator,
            ],
        )
        .map_err(db_err)?;
    }

    tx.commit().map_err(db_err)?;
    Ok(())
}

/// PROCESSING -> READY for an image asset, with its derivatives.
///
/// `diagnostic` records per-derivative failures of a partial success.
pub fn complete_images(
    conn: &Connection,
    key: &AssetKey,
    job_id: JobId,
    derivatives: &[Derivative],
    diagnostic: Option<&str>,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let tx = conn.unchecked_transaction().map_err(db_err)?;

    let changed = tx
        .execute(
            "UPDATE media_assets SET status = 'READY', diagnostic = ?4, updated_at = ?5,
                 owner_id = NULL, lease_expires_at = NULL
             WHERE entity_id = ?1 AND kind = ?2 AND job_id = ?3 AND status = 'PROCESSING'",
            rusqlite::params![
                key.entity.as_str(),
                key.kind.as_str(),
                job_id.to_string(),
                diagnostic,
                &now,
            ],
        )
        .map_err(db_err)?;
    ensure_claimed(changed, key, job_id)?;

    for (position, d) in derivatives.iter().enumerate() {
        tx.execute(
            "INSERT INTO derivatives
                 (entity_id, kind, position, width, height, derivative_kind, locator)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                key.entity.as_str(),
                key.kind.as_str(),
                position as i64,
                d.width,
                d.height,
                d.kind.as_str(),
                &d.locator,
            ],
        )
        .map_err(db_err)?;
    }

    tx.commit().map_err(db_err)?;
    Ok(())
}

/// PROCESSING -> FAILED with a diagnostic.
pub fn fail_asset(conn: &Connection, key: &AssetKey, job_id: JobId, diagnostic: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let changed = conn
        .execute(
            "UPDATE media_assets SET status = 'FAILED', diagnostic = ?4, updated_at = ?5,
                 owner_id = NULL, lease_expires_at = NULL
             WHERE entity_id = ?1 AND kind = ?2 AND job_id = ?3 AND status = 'PROCESSING'",
            rusqlite::params![
                key.entity.as_str(),
                key.kind.as_str(),
                job_id.to_string(),
                diagnostic,
                &now,
            ],
        )
        .map_err(db_err)?;
    ensure_claimed(changed, key, job_id)
}

fn ensure_claimed(changed: usize, key: &AssetKey, job_id: JobId) -> Result<()> {
    if changed == 0 {
        return Err(Error::Internal(format!(
            "{key} is no longer processing job {job_id}"
        )));
    }
    Ok(())
}

/// Load the full record for `key`.
pub fn get_asset(conn: &Connection, key: &AssetKey) -> Result<Option<AssetRecord>> {
    let q = format!("SELECT {COLS} FROM media_assets WHERE entity_id = ?1 AND kind = ?2");
    let row = conn
        .query_row(
            &q,
            rusqlite::params![key.entity.as_str(), key.kind.as_str()],
            AssetRow::from_row,
        )
        .optional()
        .map_err(db_err)?;

    let Some(row) = row else {
        return Ok(None);
    };

    let variants = list_variants(conn, key)?;
    let derivatives = list_derivatives(conn, key)?;

    Ok(Some(AssetRecord {
        key: AssetKey::new(row.entity_id, row.kind),
        status: row.status,
        diagnostic: row.diagnostic,
        master_locator: row.master_locator,
        duration_secs: row.duration_secs,
        source_width: row.source_width,
        source_height: row.source_height,
        variants,
        derivatives,
        updated_at: row.updated_at,
    }))
}

/// Variants of `key`, in ladder order.
pub fn list_variants(conn: &Connection, key: &AssetKey) -> Result<Vec<reel_core::VariantRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT variant_index, width, height, bitrate_kbps, locator FROM stream_variants
             WHERE entity_id = ?1 AND kind = ?2 ORDER BY variant_index",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(
            rusqlite::params![key.entity.as_str(), key.kind.as_str()],
            variant_from_row,
        )
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(rows)
}

/// Derivatives of `key`, in spec order.
pub fn list_derivatives(conn: &Connection, key: &AssetKey) -> Result<Vec<Derivative>> {
    let mut stmt = conn
        .prepare(
            "SELECT width, height, derivative_kind, locator FROM derivatives
             WHERE entity_id = ?1 AND kind = ?2 ORDER BY position",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(
            rusqlite::params![key.entity.as_str(), key.kind.as_str()],
            derivative_from_row,
        )
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(rows)
}

/// Push the expiry of every PROCESSING row `lease.owner` holds to
/// `lease.ttl` from now. Returns how many rows were renewed.
pub fn renew_leases(conn: &Connection, lease: &Lease) -> Result<usize> {
    conn.execute(
        "UPDATE media_assets SET lease_expires_at = ?2
         WHERE owner_id = ?1 AND status = 'PROCESSING'",
        rusqlite::params![&lease.owner, lease.expires_at(now_millis())],
    )
    .map_err(db_err)
}

/// Mark FAILED the PROCESSING rows with no live process behind them:
/// rows `owner` holds (a previous life of this instance) and rows whose
/// lease is missing or expired. Rows leased by other live instances are
/// left alone.
pub fn reset_orphaned(conn: &Connection, owner: &str, diagnostic: &str) -> Result<usize> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE media_assets SET status = 'FAILED', diagnostic = ?2, updated_at = ?3,
             owner_id = NULL, lease_expires_at = NULL
         WHERE status = 'PROCESSING'
           AND (owner_id IS NULL OR owner_id = ?1
                OR lease_expires_at IS NULL OR lease_expires_at <= ?4)",
        rusqlite::params![owner, diagnostic, &now, now_millis()],
    )
    .map_err(db_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{get_conn, init_memory_pool};
    use reel_core::{DerivativeKind, EntityId, MediaKind, MediaStatus, VariantRecord};

    fn live(owner: &str) -> Lease {
        Lease::new(owner, Duration::from_secs(60))
    }

    fn lapsed(owner: &str) -> Lease {
        Lease::new(owner, Duration::ZERO)
    }

    fn key(kind: MediaKind) -> AssetKey {
        AssetKey::new(EntityId::parse("clip").unwrap(), kind)
    }

    fn stream() -> PublishedStream {
        PublishedStream {
            master_locator: "/media/videos/clip/master.m3u8".into(),
            variants: vec![
                VariantRecord {
                    index: 0,
                    width: 1280,
                    height: 720,
                    bitrate_kbps: 4000,
                    locator: "/media/videos/clip/stream_0/stream.m3u8".into(),
                },
                VariantRecord {
                    index: 1,
                    width: 854,
                    height: 480,
                    bitrate_kbps: 2000,
                    locator: "/media/videos/clip/stream_1/stream.m3u8".into(),
                },
            ],
            duration_secs: Some(42.0),
            source_width: 1280,
            source_height: 720,
        }
    }

    #[test]
    fn begin_processing_is_exclusive() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let k = key(MediaKind::Video);

        assert!(begin_processing(&conn, &k, JobId::new(), &live("a")).unwrap());
        assert!(!begin_processing(&conn, &k, JobId::new(), &live("a")).unwrap());
        let record = get_asset(&conn, &k).unwrap().unwrap();
        assert_eq!(record.status, MediaStatus::Processing);
    }

    #[test]
    fn kinds_are_independent() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();

        let lease = live("a");
        assert!(begin_processing(&conn, &key(MediaKind::Video), JobId::new(), &lease).unwrap());
        assert!(begin_processing(&conn, &key(MediaKind::Thumbnail), JobId::new(), &lease).unwrap());
    }

    #[test]
    fn complete_stream_publishes_variants() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let k = key(MediaKind::Video);
        let job = JobId::new();

        begin_processing(&conn, &k, job, &live("a")).unwrap();
        complete_stream(&conn, &k, job, &stream()).unwrap();

        let record = get_asset(&conn, &k).unwrap().unwrap();
        assert_eq!(record.status, MediaStatus::Ready);
        assert_eq!(record.stream_url(), Some("/media/videos/clip/master.m3u8"));
        assert_eq!(record.variants.len(), 2);
        assert_eq!(record.variants[1].height, 480);
        assert_eq!(record.duration_secs, Some(42.0));
    }

    #[test]
    fn reprocessing_clears_published_state() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let k = key(MediaKind::Video);
        let first = JobId::new();

        begin_processing(&conn, &k, first, &live("a")).unwrap();
        complete_stream(&conn, &k, first, &stream()).unwrap();
        assert!(begin_processing(&conn, &k, JobId::new(), &live("a")).unwrap());

        let record = get_asset(&conn, &k).unwrap().unwrap();
        assert_eq!(record.status, MediaStatus::Processing);
        assert!(record.master_locator.is_none());
        assert!(record.variants.is_empty());
    }

    #[test]
    fn stale_job_cannot_complete() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let k = key(MediaKind::Video);

        begin_processing(&conn, &k, JobId::new(), &live("a")).unwrap();
        let err = complete_stream(&conn, &k, JobId::new(), &stream()).unwrap_err();
        assert!(err.to_string().contains("no longer processing"));
        let record = get_asset(&conn, &k).unwrap().unwrap();
        assert_eq!(record.status, MediaStatus::Processing);
    }

    #[test]
    fn complete_images_stores_derivatives_in_order() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let k = key(MediaKind::Thumbnail);
        let job = JobId::new();
        let derivatives = vec![
            Derivative {
                height: 18,
                width: 32,
                kind: DerivativeKind::Inline,
                locator: "data:image/png;base64,AAAA".into(),
            },
            Derivative {
                height: 360,
                width: 640,
                kind: DerivativeKind::File,
                locator: "/media/videos/clip/thumbnails/thumbnail-640p.webp".into(),
            },
        ];

        begin_processing(&conn, &k, job, &live("a")).unwrap();
        complete_images(&conn, &k, job, &derivatives, Some("file 20000x20000: too big")).unwrap();

        let record = get_asset(&conn, &k).unwrap().unwrap();
        assert_eq!(record.status, MediaStatus::Ready);
        assert_eq!(record.derivatives, derivatives);
        assert!(record.diagnostic.as_ref().unwrap().contains("too big"));
        assert_eq!(record.stream_url(), None);
    }

    #[test]
    fn fail_records_diagnostic() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let k = key(MediaKind::Video);
        let job = JobId::new();

        begin_processing(&conn, &k, job, &live("a")).unwrap();
        fail_asset(&conn, &k, job, "ffmpeg exited with status 1").unwrap();

        let record = get_asset(&conn, &k).unwrap().unwrap();
        assert_eq!(record.status, MediaStatus::Failed);
        assert_eq!(record.diagnostic.as_deref(), Some("ffmpeg exited with status 1"));
        assert!(begin_processing(&conn, &k, JobId::new(), &live("a")).unwrap());
    }

    #[test]
    fn reset_orphaned_fails_own_and_lapsed_rows() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let mine = key(MediaKind::Video);
        let lapsed_key = key(MediaKind::Thumbnail);
        let theirs = key(MediaKind::ProfilePicture);

        begin_processing(&conn, &mine, JobId::new(), &live("a")).unwrap();
        begin_processing(&conn, &lapsed_key, JobId::new(), &lapsed("c")).unwrap();
        begin_processing(&conn, &theirs, JobId::new(), &live("b")).unwrap();

        assert_eq!(reset_orphaned(&conn, "a", "interrupted by restart").unwrap(), 2);
        for k in [&mine, &lapsed_key] {
            let record = get_asset(&conn, k).unwrap().unwrap();
            assert_eq!(record.status, MediaStatus::Failed);
            assert_eq!(record.diagnostic.as_deref(), Some("interrupted by restart"));
        }
        let untouched = get_asset(&conn, &theirs).unwrap().unwrap();
        assert_eq!(untouched.status, MediaStatus::Processing);
    }

    #[test]
    fn reset_orphaned_spares_rows_of_another_live_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let pool_a = crate::pool::init_pool(&path).unwrap();
        let pool_b = crate::pool::init_pool(&path).unwrap();
        let conn_a = get_conn(&pool_a).unwrap();
        let conn_b = get_conn(&pool_b).unwrap();
        let k = key(MediaKind::Video);
        let job = JobId::new();

        assert!(begin_processing(&conn_a, &k, job, &live("a")).unwrap());

        assert_eq!(reset_orphaned(&conn_b, "b", "interrupted by restart").unwrap(), 0);
        assert!(!begin_processing(&conn_b, &k, JobId::new(), &live("b")).unwrap());

        complete_stream(&conn_a, &k, job, &stream()).unwrap();
        let record = get_asset(&conn_b, &k).unwrap().unwrap();
        assert_eq!(record.status, MediaStatus::Ready);
    }

    #[test]
    fn lapsed_lease_can_be_taken_over() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let k = key(MediaKind::Video);
        let abandoned = JobId::new();

        assert!(begin_processing(&conn, &k, abandoned, &lapsed("a")).unwrap());
        let takeover = JobId::new();
        assert!(begin_processing(&conn, &k, takeover, &live("b")).unwrap());

        let err = fail_asset(&conn, &k, abandoned, "late").unwrap_err();
        assert!(err.to_string().contains("no longer processing"));
        complete_stream(&conn, &k, takeover, &stream()).unwrap();
    }

    #[test]
    fn renew_extends_only_the_owners_rows() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let video = key(MediaKind::Video);
        let thumb = key(MediaKind::Thumbnail);

        begin_processing(&conn, &video, JobId::new(), &lapsed("a")).unwrap();
        begin_processing(&conn, &thumb, JobId::new(), &lapsed("c")).unwrap();

        assert_eq!(renew_leases(&conn, &live("a")).unwrap(), 1);
        assert!(!begin_processing(&conn, &video, JobId::new(), &live("b")).unwrap());
        assert!(begin_processing(&conn, &thumb, JobId::new(), &live("b")).unwrap());
    }

    #[test]
    fn finished_rows_are_not_renewed() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let k = key(MediaKind::Video);
        let job = JobId::new();

        begin_processing(&conn, &k, job, &live("a")).unwrap();
        fail_asset(&conn, &k, job, "boom").unwrap();
        assert_eq!(renew_leases(&conn, &live("a")).unwrap(), 0);
        assert_eq!(reset_orphaned(&conn, "a", "restart").unwrap(), 0);
    }
}
