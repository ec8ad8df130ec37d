//! Quality ladder selection.
//!
//! The configured ladder is a strictly descending list of rungs. For a
//! given source, the selected ladder is every rung no taller than the
//! source, in configured order. A source shorter than every rung gets the
//! single smallest rung (upscaled) rather than an empty ladder.

use reel_core::{Error, QualityRung, Result};
use serde::{Deserialize, Serialize};

/// Pixel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// A rung resolved against a concrete source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LadderRung {
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

/// The source-bounded, ordered subset of the configured ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedLadder {
    rungs: Vec<LadderRung>,
    /// True when the source was shorter than every configured rung.
    pub upscaled: bool,
}

impl SelectedLadder {
    pub fn rungs(&self) -> &[LadderRung] {
        &self.rungs
    }

    /// Never zero.
    pub fn len(&self) -> usize {
        self.rungs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rungs.is_empty()
    }

    pub fn heights(&self) -> Vec<u32> {
        self.rungs.iter().map(|r| r.height).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LadderRung> {
        self.rungs.iter()
    }
}

impl<'a> IntoIterator for &'a SelectedLadder {
    type Item = &'a LadderRung;
    type IntoIter = std::slice::Iter<'a, LadderRung>;

    fn into_iter(self) -> Self::IntoIter {
        self.rungs.iter()
    }
}

/// A validated configured ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityLadder {
    rungs: Vec<QualityRung>,
}

impl QualityLadder {
    /// Reject empty, unordered, zero-valued or odd-height ladders.
    ///
    /// Heights are used verbatim as encoder output sizes, which must be
    /// even. Odd explicit widths are rounded up instead.
    pub fn new(rungs: Vec<QualityRung>) -> Result<Self> {
        if rungs.is_empty() {
            return Err(Error::Validation("quality ladder is empty".into()));
        }
        if let Some(rung) = rungs.iter().find(|r| r.height == 0 || r.bitrate_kbps == 0) {
            return Err(Error::Validation(format!(
                "quality rung {}p @ {}k has a zero height or bitrate",
                rung.height, rung.bitrate_kbps
            )));
        }
        if let Some(rung) = rungs.iter().find(|r| r.height % 2 != 0) {
            return Err(Error::Validation(format!(
                "quality rung {}p has an odd height",
                rung.height
            )));
        }
        if let Some(pair) = rungs.windows(2).find(|p| p[1].height >= p[0].height) {
            return Err(Error::Validation(format!(
                "quality ladder must be strictly descending, found {}p before {}p",
                pair[0].height, pair[1].height
            )));
        }
        Ok(Self { rungs })
    }

    pub fn rungs(&self) -> &[QualityRung] {
        &self.rungs
    }

    /// Bound the ladder by `source`.
    pub fn select(&self, source: Dimensions) -> Result<SelectedLadder> {
        if source.width == 0 || source.height == 0 {
            return Err(Error::Validation(format!(
                "source has invalid dimensions {}x{}",
                source.width, source.height
            )));
        }

        let mut rungs: Vec<LadderRung> = self
            .rungs
            .iter()
            .filter(|r| r.height <= source.height)
            .map(|r| resolve(r, source))
            .collect();

        let upscaled = rungs.is_empty();
        if upscaled {
            // Non-empty by construction.
            if let Some(smallest) = self.rungs.last() {
                rungs.push(resolve(smallest, source));
            }
        }

        Ok(SelectedLadder { rungs, upscaled })
    }
}

/// Convenience wrapper: validate `configured` and select against `source`.
pub fn select_ladder(source: Dimensions, configured: &[QualityRung]) -> Result<SelectedLadder> {
    QualityLadder::new(configured.to_vec())?.select(source)
}

fn resolve(rung: &QualityRung, source: Dimensions) -> LadderRung {
    let width = match rung.width {
        Some(w) => round_up_even(w),
        None => derive_width(rung.height, source),
    };
    LadderRung {
        width,
        height: rung.height,
        bitrate_kbps: rung.bitrate_kbps,
        audio_bitrate_kbps: rung.audio_bitrate_kbps(),
    }
}

/// `height * source_width / source_height`, rounded to the nearest even
/// integer and never below 2.
pub fn derive_width(height: u32, source: Dimensions) -> u32 {
    let num = u64::from(height) * u64::from(source.width);
    let den = u64::from(source.height);
    let halves = (num + den) / (2 * den);
    let width = u32::try_from(halves * 2).unwrap_or(u32::MAX - 1);
    width.max(2)
}

fn round_up_even(w: u32) -> u32 {
    if w % 2 == 0 {
        w.max(2)
    } else {
        w.saturating_add(1)
    }
}
