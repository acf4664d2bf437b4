//! What a refresh hands to the renderer.

use serde::Serialize;
use strum::Display;

use crate::fixed::Fixed;
use crate::window::{Chunk, SeriesEntry, Window};

/// Owned copy of a [`Chunk`]'s aggregates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkPoint {
    pub label: String,
    pub first_block: u64,
    pub last_block: u64,
    pub entries: usize,
    pub avg_d_instant: Fixed,
    pub avg_d_star: Fixed,
    pub avg_delta_k: Fixed,
}

impl From<&Chunk<'_>> for ChunkPoint {
    fn from(chunk: &Chunk<'_>) -> Self {
        Self {
            label: chunk.label(),
            first_block: chunk.first_block,
            last_block: chunk.last_block,
            entries: chunk.entries.len(),
            avg_d_instant: chunk.avg_d_instant,
            avg_d_star: chunk.avg_d_star,
            avg_delta_k: chunk.avg_delta_k,
        }
    }
}

/// Which side of the Qi/Quai market the latest ratio favors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum Stance {
    /// d* > d
    #[strum(serialize = "pro-Qi")]
    #[serde(rename = "pro-Qi")]
    ProQi,
    /// d* < d
    #[strum(serialize = "pro-Quai")]
    #[serde(rename = "pro-Quai")]
    ProQuai,
    #[strum(serialize = "neutral")]
    #[serde(rename = "neutral")]
    Neutral,
}

impl Stance {
    pub fn from_ratio(ratio: Fixed) -> Self {
        match ratio.cmp(&Fixed::ONE) {
            std::cmp::Ordering::Greater => Stance::ProQi,
            std::cmp::Ordering::Less => Stance::ProQuai,
            std::cmp::Ordering::Equal => Stance::Neutral,
        }
    }

    pub fn summary(&self) -> &'static str {
        match self {
            Stance::ProQi => "d* > d, more Quai per 1 Qi",
            Stance::ProQuai => "d* < d, less Quai per 1 Qi",
            Stance::Neutral => "d* = d",
        }
    }
}

/// Chunked series plus the newest entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub chunk_size: usize,
    pub entries: usize,
    pub chunks: Vec<ChunkPoint>,
    pub latest: Option<SeriesEntry>,
    pub stance: Stance,
    /// Entries whose data was partly lost to failed batch slices
    pub lost_entries: usize,
    /// True when `lost_entries` is nonzero
    pub degraded: bool,
}

impl Report {
    pub fn build(window: &Window, chunk_size: usize) -> Self {
        let latest = window.latest().cloned();
        let stance = latest
            .as_ref()
            .map_or(Stance::Neutral, |e| Stance::from_ratio(e.ratio));
        let lost_entries = window.lost_entries();
        Self {
            chunk_size: chunk_size.max(1),
            entries: window.len(),
            chunks: window.chunks(chunk_size).map(|c| ChunkPoint::from(&c)).collect(),
            latest,
            stance,
            lost_entries,
            degraded: lost_entries > 0,
        }
    }
}
