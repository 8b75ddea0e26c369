use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::index::{depth_key, Direction, IndexType};

/// ChunkRange is the half-open key interval `[start, end)` a chunk owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub start: i64,
    pub end: i64,
}

impl ChunkRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, key: i64) -> bool {
        self.start <= key && key < self.end
    }

    /// overlaps returns true if the chunk intersects the inclusive range [min, max].
    pub fn overlaps(&self, min: i64, max: i64) -> bool {
        self.start <= max && self.end > min
    }

    /// within returns true if the whole chunk lies inside the inclusive range [min, max].
    pub fn within(&self, min: i64, max: i64) -> bool {
        min <= self.start && self.end - 1 <= max
    }
}

/// Partitioner maps index keys onto fixed-width chunks.
///
/// An increasing log buckets keys as `[k*w, (k+1)*w)` and names the chunk by
/// its lower edge; a decreasing log buckets keys as `((k-1)*w, k*w]` and names
/// the chunk by its upper edge, the edge first reached in travel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    width: i64,
    direction: Direction,
}

impl Partitioner {
    pub fn new(width: i64, direction: Direction) -> Self {
        Self {
            width: width.max(1),
            direction,
        }
    }

    /// for_log derives the chunk width of a log from the live configuration.
    /// A log keeps the depth scale it was created with, so the configured
    /// depth width is checked again at that scale.
    pub fn for_log(
        config: &EngineConfig,
        index_type: IndexType,
        direction: Direction,
        depth_scale: u32,
    ) -> Result<Self> {
        let width = match index_type {
            IndexType::Depth => depth_key(config.depth_chunk_size, depth_scale),
            IndexType::Time => Some(config.time_chunk_size),
        };
        match width {
            Some(width) if width >= 1 => Ok(Self::new(width, direction)),
            _ => Err(Error::InvalidConfig(format!(
                "no usable {} chunk width at scale {}",
                index_type, depth_scale
            ))),
        }
    }

    pub fn width(&self) -> i64 {
        self.width
    }

    pub fn chunk_id_for(&self, key: i64) -> i64 {
        match self.direction {
            Direction::Increasing => key.div_euclid(self.width) * self.width,
            Direction::Decreasing => -((-key).div_euclid(self.width) * self.width),
        }
    }

    pub fn range_of(&self, chunk_id: i64) -> ChunkRange {
        match self.direction {
            Direction::Increasing => ChunkRange::new(chunk_id, chunk_id + self.width),
            Direction::Decreasing => ChunkRange::new(chunk_id - self.width + 1, chunk_id + 1),
        }
    }

    /// affected_chunks walks every chunk id covering the inclusive key range
    /// between `a` and `b`, including ids that hold no data yet, in ascending
    /// key order.
    pub fn affected_chunks(&self, a: i64, b: i64) -> AffectedChunks {
        let (min, max) = (a.min(b), a.max(b));
        AffectedChunks {
            next: Some(self.chunk_id_for(min)),
            last: self.chunk_id_for(max),
            width: self.width,
        }
    }

    /// affected_chunk_ids lists the chunk ids between two keys in travel order.
    pub fn affected_chunk_ids(&self, a: i64, b: i64) -> Vec<i64> {
        let mut ids: Vec<i64> = self.affected_chunks(a, b).collect();
        if self.direction == Direction::Decreasing {
            ids.reverse();
        }
        ids
    }

    /// place returns the range a new row at `key` is stored in.
    ///
    /// A key inside an existing chunk always lands there. Otherwise the key's
    /// bucket is clipped against its neighbours, so chunks written under an
    /// earlier width never overlap chunks written under the current one.
    pub fn place<V>(&self, key: i64, directory: &BTreeMap<i64, V>, end_of: impl Fn(&V) -> i64) -> ChunkRange {
        let prev = directory.range(..=key).next_back();
        if let Some((&start, v)) = prev {
            let end = end_of(v);
            if key < end {
                return ChunkRange::new(start, end);
            }
        }

        let mut range = self.range_of(self.chunk_id_for(key));
        if let Some((_, v)) = prev {
            range.start = range.start.max(end_of(v));
        }
        if let Some((&next_start, _)) = directory.range(key + 1..).next() {
            range.end = range.end.min(next_start);
        }
        range
    }
}

pub struct AffectedChunks {
    next: Option<i64>,
    last: i64,
    width: i64,
}

impl Iterator for AffectedChunks {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        let id = self.next?;
        self.next = if id < self.last {
            Some(id + self.width)
        } else {
            None
        };
        Some(id)
    }
}
