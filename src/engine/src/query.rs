use common_base::iterator::AsyncIterator;

use crate::channel::LogId;
use crate::chunk::{ChannelDataChunk, ChunkStore, Row};
use crate::engine::ChannelDataEngine;
use crate::error::{Error, Result};
use crate::index::{Direction, IndexArg, IndexValue};
use crate::metadata::LogMetadata;
use crate::partition::ChunkRange;

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub log_id: LogId,
    /// Channels to return; empty selects every channel. Unknown mnemonics are
    /// ignored and the index channel is always returned first.
    pub mnemonics: Vec<String>,
    pub start: Option<IndexArg>,
    pub end: Option<IndexArg>,
    /// Keep, per channel, only this many values nearest the log end.
    pub max_latest_values: Option<usize>,
}

impl QueryRequest {
    pub fn new(log_id: LogId) -> Self {
        Self {
            log_id,
            mnemonics: Vec::new(),
            start: None,
            end: None,
            max_latest_values: None,
        }
    }

    pub fn with_mnemonics(mut self, mnemonics: Vec<String>) -> Self {
        self.mnemonics = mnemonics;
        self
    }

    pub fn with_range(mut self, start: Option<IndexArg>, end: Option<IndexArg>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn with_latest_values(mut self, n: usize) -> Self {
        self.max_latest_values = Some(n);
        self
    }
}

/// QueryResult carries rows serialized with the log's delimiter and null
/// indicator, in log direction order.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub log_id: LogId,
    pub columns: Vec<String>,
    pub units: Vec<String>,
    pub delimiter: char,
    pub null_value: String,
    pub rows: Vec<String>,
    pub start: Option<IndexValue>,
    pub end: Option<IndexValue>,
    /// Set when the data node or data point ceiling cut the result short.
    pub truncated: bool,
}

/// ChunkScanner loads, one at a time, the stored chunks of a log that hold
/// rows inside an inclusive key range.
pub struct ChunkScanner {
    chunks: ChunkStore,
    log: LogId,
    columns: Vec<String>,
    ranges: std::vec::IntoIter<ChunkRange>,
}

impl ChunkScanner {
    pub fn new(
        chunks: ChunkStore,
        meta: &LogMetadata,
        columns: Vec<String>,
        min: i64,
        max: i64,
        ascending: bool,
    ) -> Self {
        let mut ranges: Vec<ChunkRange> = meta
            .chunks
            .iter()
            .filter(|(_, s)| s.min_index <= max && s.max_index >= min)
            .map(|(&start, s)| ChunkRange::new(start, s.end))
            .collect();
        if !ascending {
            ranges.reverse();
        }

        Self {
            chunks,
            log: meta.id.clone(),
            columns,
            ranges: ranges.into_iter(),
        }
    }
}

#[async_trait]
impl AsyncIterator for ChunkScanner {
    type Item = ChannelDataChunk;
    type Error = Error;

    async fn try_next(&mut self) -> Result<Option<ChannelDataChunk>> {
        match self.ranges.next() {
            Some(range) => self.chunks.load(&self.log, range, &self.columns).await.map(Some),
            None => Ok(None),
        }
    }
}

impl ChannelDataEngine {
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResult> {
        let config = self.config().snapshot();
        let id = &request.log_id;

        let guard = self.locks.read(id, config.lock_timeout).await?;
        let (_guard, meta) = self.require_locked(id, guard).await?;

        let resolve = |arg: &Option<IndexArg>| -> Result<Option<i64>> {
            arg.as_ref()
                .map(|a| a.resolve(meta.index_type, meta.depth_scale))
                .transpose()
        };
        let (min, max) = meta.direction.bounds(resolve(&request.start)?, resolve(&request.end)?);

        let selected: Vec<String> = meta
            .data_columns()
            .into_iter()
            .filter(|c| request.mnemonics.is_empty() || request.mnemonics.contains(c))
            .collect();

        // latest values are collected walking back from the log end
        let forward = meta.direction == Direction::Increasing;
        let ascending = match request.max_latest_values {
            Some(_) => !forward,
            None => forward,
        };
        let mut scanner = ChunkScanner::new(self.chunks.clone(), &meta, selected.clone(), min, max, ascending);

        let width = selected.len() + 1;
        let mut counts = vec![0usize; selected.len()];
        let mut out: Vec<Row> = Vec::new();
        let mut truncated = false;

        'scan: while let Some(chunk) = scanner.try_next().await? {
            let mut rows = chunk.rows;
            if !ascending {
                rows.reverse();
            }

            for mut row in rows {
                if row.index < min || row.index > max {
                    continue;
                }

                if let Some(n) = request.max_latest_values {
                    if counts.iter().all(|c| *c >= n) {
                        break 'scan;
                    }
                    for (value, count) in row.values.iter_mut().zip(counts.iter_mut()) {
                        if value.is_some() {
                            if *count < n {
                                *count += 1;
                            } else {
                                *value = None;
                            }
                        }
                    }
                }

                if !selected.is_empty() && row.is_empty() {
                    continue;
                }

                if out.len() >= config.max_data_nodes || (out.len() + 1) * width > config.max_data_points {
                    truncated = true;
                    break 'scan;
                }
                out.push(row);
            }
        }
        if request.max_latest_values.is_some() {
            out.reverse();
        }

        let mut columns = vec![meta.index_mnemonic().to_string()];
        columns.extend(selected.iter().cloned());
        let units = columns
            .iter()
            .map(|c| meta.channel(c).map(|ch| ch.unit.clone()).unwrap_or_default())
            .collect();

        Ok(QueryResult {
            log_id: id.clone(),
            columns,
            units,
            delimiter: meta.delimiter,
            null_value: meta.null_value.clone(),
            start: out.first().map(|r| IndexValue::from_key(meta.index_type, r.index)),
            end: out.last().map(|r| IndexValue::from_key(meta.index_type, r.index)),
            rows: out.iter().map(|r| serialize_row(&meta, r)).collect(),
            truncated,
        })
    }
}

fn serialize_row(meta: &LogMetadata, row: &Row) -> String {
    let mut line = meta.format_key(row.index);
    for value in &row.values {
        line.push(meta.delimiter);
        match value {
            Some(v) => line.push_str(&v.to_string()),
            None => line.push_str(&meta.null_value),
        }
    }
    line
}
