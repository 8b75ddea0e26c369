use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::channel::ChannelValue;
use crate::partition::ChunkRange;

pub mod codec;
pub mod store;

pub use store::ChunkStore;

/// Row is one index key plus one cell per data column of its chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub index: i64,
    pub values: Vec<Option<ChannelValue>>,
}

impl Row {
    pub fn new(index: i64, values: Vec<Option<ChannelValue>>) -> Self {
        Self { index, values }
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(|v| v.is_none())
    }
}

/// ChunkSummary is what the log metadata remembers about a stored chunk, so
/// ranges can be recomputed without reading untouched chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub end: i64,
    pub rows: usize,
    pub min_index: i64,
    pub max_index: i64,
    /// channel mnemonic -> (min, max) key over non-null cells
    pub channels: BTreeMap<String, (i64, i64)>,
}

/// ChannelDataChunk holds the rows whose index falls in one [`ChunkRange`].
///
/// Rows are sorted ascending by index with no duplicate index, whatever the
/// direction of the log. `columns` names the data channels (index excluded)
/// in the order the row cells are laid out.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDataChunk {
    pub range: ChunkRange,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl ChannelDataChunk {
    pub fn empty(range: ChunkRange, columns: Vec<String>) -> Self {
        Self {
            range,
            columns,
            rows: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_position(&self, mnemonic: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == mnemonic)
    }

    /// project re-lays every row onto `columns`: cells are matched by
    /// mnemonic, channels missing from the chunk become null and channels not
    /// in `columns` are dropped.
    pub fn project(&mut self, columns: &[String]) {
        if self.columns.as_slice() == columns {
            return;
        }

        let from: HashMap<&str, usize> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_str(), i))
            .collect();
        let mapping: Vec<Option<usize>> = columns.iter().map(|c| from.get(c.as_str()).copied()).collect();

        for row in self.rows.iter_mut() {
            let mut old = std::mem::take(&mut row.values);
            row.values = mapping
                .iter()
                .map(|m| m.and_then(|i| old.get_mut(i).and_then(|v| v.take())))
                .collect();
        }
        self.columns = columns.to_vec();
    }

    /// delete_column removes a column from every row. Rows that held a value
    /// for it and are left with no value at all are pruned. Returns whether
    /// the column existed.
    pub fn delete_column(&mut self, mnemonic: &str) -> bool {
        let pos = match self.column_position(mnemonic) {
            Some(pos) => pos,
            None => return false,
        };

        self.columns.remove(pos);
        self.rows.retain_mut(|row| {
            let had_value = row.values.remove(pos).is_some();
            !(had_value && row.is_empty())
        });
        true
    }

    /// delete_rows drops every row whose index falls in [min, max] and returns
    /// how many were dropped.
    pub fn delete_rows(&mut self, min: i64, max: i64) -> usize {
        let before = self.rows.len();
        self.rows.retain(|row| row.index < min || row.index > max);
        before - self.rows.len()
    }

    /// clear_column nulls one column over [min, max]. Rows that lose their
    /// last value this way are pruned. Returns how many cells were cleared.
    pub fn clear_column(&mut self, pos: usize, min: i64, max: i64) -> usize {
        let mut cleared = 0;
        self.rows.retain_mut(|row| {
            if row.index < min || row.index > max {
                return true;
            }
            match row.values.get_mut(pos).and_then(|v| v.take()) {
                Some(_) => {
                    cleared += 1;
                    !row.is_empty()
                }
                None => true,
            }
        });
        cleared
    }

    pub fn summary(&self) -> Option<ChunkSummary> {
        let first = self.rows.first()?;
        let last = self.rows.last()?;

        let mut channels = BTreeMap::new();
        for (i, column) in self.columns.iter().enumerate() {
            let mut cells = self
                .rows
                .iter()
                .filter(|row| matches!(row.values.get(i), Some(Some(_))))
                .map(|row| row.index);
            if let Some(min) = cells.next() {
                let max = cells.last().unwrap_or(min);
                channels.insert(column.clone(), (min, max));
            }
        }

        Some(ChunkSummary {
            end: self.range.end,
            rows: self.rows.len(),
            min_index: first.index,
            max_index: last.index,
            channels,
        })
    }
}
