// src/models.rs

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An inclusive byte span `[start, end]` of the target resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DownloadRange {
    pub start: u64,
    pub end: u64,
}

impl DownloadRange {
    /// Creates a range. Returns `None` when `start > end`.
    pub fn new(start: u64, end: u64) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Number of bytes covered by the range. Never zero.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// The sub-range left over once `delivered` bytes from the start are done.
    /// `None` means the range is fully covered.
    pub fn remaining_after(&self, delivered: u64) -> Option<Self> {
        let next = self.start.checked_add(delivered)?;
        Self::new(next, self.end)
    }

    /// The already-delivered prefix of this range.
    pub fn delivered_prefix(&self, delivered: u64) -> Option<Self> {
        if delivered == 0 {
            return None;
        }
        Some(Self {
            start: self.start,
            end: self.start + delivered.min(self.len()) - 1,
        })
    }

    /// `Range` header value for this span.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for DownloadRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Splits `[0, total_size)` into `parts` contiguous ranges of near-equal size.
/// The last range absorbs the remainder of the integer division.
pub fn split_evenly(total_size: u64, parts: usize) -> Vec<DownloadRange> {
    if total_size == 0 {
        return Vec::new();
    }
    let parts = (parts.max(1) as u64).min(total_size);
    let part_size = total_size / parts;

    (0..parts)
        .map(|i| {
            let start = i * part_size;
            let end = if i == parts - 1 {
                total_size - 1
            } else {
                (i + 1) * part_size - 1
            };
            DownloadRange { start, end }
        })
        .collect()
}

/// Sorts and coalesces overlapping or adjacent ranges.
pub fn merge_ranges(ranges: &[DownloadRange]) -> Vec<DownloadRange> {
    let mut sorted = ranges.to_vec();
    sorted.sort();

    let mut merged: Vec<DownloadRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Drops ranges lying past the end of the resource and trims the ones
/// reaching beyond it.
pub fn clamp_ranges(total_size: u64, ranges: &[DownloadRange]) -> Vec<DownloadRange> {
    if total_size == 0 {
        return Vec::new();
    }
    let last = total_size - 1;
    ranges
        .iter()
        .filter(|r| r.start <= last)
        .map(|r| DownloadRange {
            start: r.start,
            end: r.end.min(last),
        })
        .collect()
}

/// Returns the gaps of `[0, total_size)` not covered by `done`.
pub fn residual_ranges(total_size: u64, done: &[DownloadRange]) -> Vec<DownloadRange> {
    if total_size == 0 {
        return Vec::new();
    }
    let last = total_size - 1;

    let mut gaps = Vec::new();
    let mut cursor = 0u64;
    for range in merge_ranges(&clamp_ranges(total_size, done)) {
        if range.start > cursor {
            gaps.push(DownloadRange {
                start: cursor,
                end: range.start - 1,
            });
        }
        cursor = range.end.saturating_add(1);
    }
    if cursor <= last {
        gaps.push(DownloadRange {
            start: cursor,
            end: last,
        });
    }
    gaps
}

/// Total number of bytes covered by a set of ranges, counting overlaps once.
pub fn covered_bytes(ranges: &[DownloadRange]) -> u64 {
    merge_ranges(ranges).iter().map(DownloadRange::len).sum()
}

/// Lifecycle of a single part.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PartStatus {
    Pending,
    InProgress,
    Stalled,
    Completed,
    Failed,
}

/// Orchestrator-owned state of one part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartState {
    pub range: DownloadRange,
    /// Bytes confirmed from `range.start` onwards.
    pub bytes_delivered: u64,
    /// Attempts issued across all restarts of this part.
    pub attempts: u32,
    /// Whole-part restarts used after the resuming layer gave up.
    pub restarts: u32,
    pub status: PartStatus,
}

impl PartState {
    pub fn new(range: DownloadRange) -> Self {
        Self {
            range,
            bytes_delivered: 0,
            attempts: 0,
            restarts: 0,
            status: PartStatus::Pending,
        }
    }

    /// What still has to be fetched for this part.
    pub fn remaining(&self) -> Option<DownloadRange> {
        self.range.remaining_after(self.bytes_delivered)
    }

    pub fn is_complete(&self) -> bool {
        self.status == PartStatus::Completed
    }
}

/// Overall state of a download session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionStatus {
    Created,
    Running,
    Completed,
    Cancelled,
    Stopped,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Stopped
        )
    }
}

/// Immutable copy of a session's state, handed to callers and lifecycle
/// listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub url: String,
    pub total_size: u64,
    pub supports_ranges: bool,
    pub status: SessionStatus,
    pub parts: Vec<PartState>,
    pub previously_downloaded: Vec<DownloadRange>,
}

impl SessionSnapshot {
    /// Bytes present for the resource: resumed ranges plus confirmed part bytes.
    pub fn downloaded_bytes(&self) -> u64 {
        covered_bytes(&self.previously_downloaded)
            + self.parts.iter().map(|p| p.bytes_delivered).sum::<u64>()
    }
}

/// One slice of bytes delivered by a part, addressed by absolute file offset.
#[derive(Debug, Clone)]
pub struct ByteChunkEvent {
    pub offset: u64,
    pub data: Bytes,
    pub part_index: usize,
}

impl ByteChunkEvent {
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }
}
