//! Row models.
//!
//! Each model implements `from_row` for constructing itself from a
//! `rusqlite::Row`, in the column order of the matching `COLS` constant
//! in [`crate::queries`].

use std::str::FromStr;

use chrono::{DateTime, Utc};
use reel_core::{Derivative, DerivativeKind, EntityId, JobId, MediaKind, MediaStatus, VariantRecord};
use rusqlite::types::Type;

fn parse_text<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: String = row.get(idx)?;
    s.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_timestamp(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// ---------------------------------------------------------------------------
// AssetRow
// ---------------------------------------------------------------------------

/// One `media_assets` row.
#[derive(Debug, Clone)]
pub struct AssetRow {
    pub entity_id: EntityId,
    pub kind: MediaKind,
    pub status: MediaStatus,
    pub job_id: Option<JobId>,
    pub diagnostic: Option<String>,
    pub master_locator: Option<String>,
    pub duration_secs: Option<f64>,
    pub source_width: Option<u32>,
    pub source_height: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AssetRow {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let job_id: Option<String> = row.get(3)?;
        let job_id = job_id
            .map(|s| s.parse::<JobId>())
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
        Ok(Self {
            entity_id: parse_text(row, 0)?,
            kind: parse_text(row, 1)?,
            status: parse_text(row, 2)?,
            job_id,
            diagnostic: row.get(4)?,
            master_locator: row.get(5)?,
            duration_secs: row.get(6)?,
            source_width: row.get(7)?,
            source_height: row.get(8)?,
            created_at: parse_timestamp(row, 9)?,
            updated_at: parse_timestamp(row, 10)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Variants and derivatives
// ---------------------------------------------------------------------------

/// Build a [`VariantRecord`] from a `stream_variants` row
/// (`variant_index, width, height, bitrate_kbps, locator`).
pub fn variant_from_row(row: &rusqlite::Row) -> rusqlite::Result<VariantRecord> {
    Ok(VariantRecord {
        index: row.get(0)?,
        width: row.get(1)?,
        height: row.get(2)?,
        bitrate_kbps: row.get(3)?,
        locator: row.get(4)?,
    })
}

/// Build a [`Derivative`] from a `derivatives` row
/// (`width, height, derivative_kind, locator`).
pub fn derivative_from_row(row: &rusqlite::Row) -> rusqlite::Result<Derivative> {
    let kind: DerivativeKind = parse_text(row, 2)?;
    Ok(Derivative {
        width: row.get(0)?,
        height: row.get(1)?,
        kind,
        locator: row.get(3)?,
    })
}
