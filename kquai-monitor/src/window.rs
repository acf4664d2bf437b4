//! Bounded series of per-block entries.
//!
//! A [`Window`] holds at most `capacity` entries, ascending and unique by
//! block number. It is built in one go by [`Window::rebuild`] and then kept
//! current with [`Window::append_latest`], which evicts from the head. The
//! display projection, [`Window::chunks`], is recomputed on every call.

use serde::Serialize;

use crate::error::{Error, Result};
use crate::fixed::Fixed;
use crate::node::{Header, RawBlock};
use crate::ratio::{parse_difficulty, Difficulty, RatioEngine};

/// One observed block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesEntry {
    pub block_number: u64,
    pub header: Option<Header>,
    /// `d`, absent if the node had none
    pub miner_difficulty: Option<Difficulty>,
    /// `d*`, absent if the node had none
    pub best_difficulty: Option<Difficulty>,
    /// `d*/d`, exactly 1 when either difficulty is missing
    pub ratio: Fixed,
    /// ΔkQuai/kQuai, exactly 0 when either difficulty is missing
    pub delta_k: Fixed,
    pub exchange_rate_raw: Option<String>,
    /// Part of this block's data was in a failed batch slice, so a neutral
    /// ratio here says nothing about the chain
    pub lost: bool,
}

impl SeriesEntry {
    pub fn from_raw(raw: RawBlock, engine: &RatioEngine) -> Self {
        let miner = raw.miner_difficulty.as_deref().and_then(parse_difficulty);
        let best = raw.best_difficulty.as_deref().and_then(parse_difficulty);
        let controller = engine.compute(best, miner);
        let exchange_rate_raw = raw
            .header
            .as_ref()
            .and_then(|h| h.exchange_rate.clone())
            .filter(|rate| !rate.is_empty());

        Self {
            block_number: raw.number,
            header: raw.header,
            miner_difficulty: miner,
            best_difficulty: best,
            ratio: controller.ratio,
            delta_k: controller.delta_k,
            exchange_rate_raw,
            lost: false,
        }
    }

    /// Miner difficulty as a fixed-point value, zero when missing.
    pub fn d_instant(&self) -> Fixed {
        self.miner_difficulty
            .map(Fixed::from_integer)
            .unwrap_or(Fixed::ZERO)
    }

    /// Best difficulty as a fixed-point value, zero when missing.
    pub fn d_star(&self) -> Fixed {
        self.best_difficulty
            .map(Fixed::from_integer)
            .unwrap_or(Fixed::ZERO)
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.header.as_ref().and_then(Header::timestamp)
    }
}

/// Entry counts changed by an append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    pub appended: usize,
    pub evicted: usize,
    /// Appended entries whose data was partly lost
    pub lost: usize,
}

impl AppendOutcome {
    pub fn is_noop(&self) -> bool {
        self.appended == 0
    }
}

/// Ordered, bounded buffer of [`SeriesEntry`].
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    entries: Vec<SeriesEntry>,
    capacity: usize,
}

impl Window {
    /// Build a window over `start..=end` from raw block data.
    ///
    /// Blocks outside the range are ignored, duplicates collapse to the
    /// first occurrence, and only the newest `capacity` entries are kept.
    pub fn rebuild(
        start: u64,
        end: u64,
        blocks: Vec<RawBlock>,
        capacity: usize,
        engine: &RatioEngine,
    ) -> Result<Window> {
        let mut blocks: Vec<RawBlock> = blocks
            .into_iter()
            .filter(|b| (start..=end).contains(&b.number))
            .collect();
        blocks.sort_by_key(|b| b.number);
        blocks.dedup_by_key(|b| b.number);

        let capacity = capacity.max(1);
        let skip = blocks.len().saturating_sub(capacity);
        let entries: Vec<SeriesEntry> = blocks
            .into_iter()
            .skip(skip)
            .map(|raw| SeriesEntry::from_raw(raw, engine))
            .collect();

        if entries.is_empty() {
            return Err(Error::EmptyWindow { start, end });
        }
        Ok(Window { entries, capacity })
    }

    /// Append blocks newer than the tail in ascending order, then evict from
    /// the head down to capacity.
    pub fn append_latest(&mut self, blocks: Vec<RawBlock>, engine: &RatioEngine) -> AppendOutcome {
        let tail = self.tail_block();
        let mut fresh: Vec<RawBlock> = blocks
            .into_iter()
            .filter(|b| tail.map_or(true, |t| b.number > t))
            .collect();
        if fresh.is_empty() {
            return AppendOutcome::default();
        }
        fresh.sort_by_key(|b| b.number);
        fresh.dedup_by_key(|b| b.number);

        let appended = fresh.len();
        self.entries
            .extend(fresh.into_iter().map(|raw| SeriesEntry::from_raw(raw, engine)));
        let evicted = self.entries.len().saturating_sub(self.capacity);
        self.entries.drain(..evicted);

        AppendOutcome {
            appended,
            evicted,
            lost: 0,
        }
    }

    /// Flag the entries for `numbers` as lost. Returns how many were found.
    pub fn mark_lost(&mut self, numbers: &[u64]) -> usize {
        let mut marked = 0;
        for entry in &mut self.entries {
            if numbers.contains(&entry.block_number) {
                entry.lost = true;
                marked += 1;
            }
        }
        marked
    }

    /// Entries currently flagged as lost.
    pub fn lost_entries(&self) -> usize {
        self.entries.iter().filter(|e| e.lost).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entries(&self) -> &[SeriesEntry] {
        &self.entries
    }

    pub fn latest(&self) -> Option<&SeriesEntry> {
        self.entries.last()
    }

    pub fn tail_block(&self) -> Option<u64> {
        self.latest().map(|e| e.block_number)
    }

    /// Contiguous groups of at most `chunk_size` entries; 0 counts as 1.
    pub fn chunks(&self, chunk_size: usize) -> Chunks<'_> {
        Chunks {
            inner: self.entries.chunks(chunk_size.max(1)),
        }
    }
}

/// Averages over a contiguous run of entries.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk<'a> {
    pub entries: &'a [SeriesEntry],
    pub first_block: u64,
    pub last_block: u64,
    pub avg_d_instant: Fixed,
    pub avg_d_star: Fixed,
    pub avg_delta_k: Fixed,
}

impl<'a> Chunk<'a> {
    // `entries` is never empty; slice::Chunks does not yield empty slices.
    fn new(entries: &'a [SeriesEntry]) -> Self {
        let first_block = entries.first().map_or(0, |e| e.block_number);
        let last_block = entries.last().map_or(0, |e| e.block_number);
        Self {
            entries,
            first_block,
            last_block,
            avg_d_instant: Fixed::mean(entries.iter().map(SeriesEntry::d_instant)),
            avg_d_star: Fixed::mean(entries.iter().map(SeriesEntry::d_star)),
            avg_delta_k: Fixed::mean(entries.iter().map(|e| e.delta_k)),
        }
    }

    /// Inclusive block range, `first–last`.
    pub fn label(&self) -> String {
        format!("{}–{}", self.first_block, self.last_block)
    }
}

/// Iterator returned by [`Window::chunks`].
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    inner: std::slice::Chunks<'a, SeriesEntry>,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Chunk<'a>> {
        self.inner.next().map(Chunk::new)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Chunks<'_> {}
