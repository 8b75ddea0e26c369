//! Merging delimited rows into a log.
//!
//! A request is validated and parsed completely before the log is locked.
//! Under the lock the parsed rows are walked in ascending index order, grouped
//! by the chunk that owns them, and folded into those chunks cell by cell:
//! a channel named by the request overwrites the stored cell (a null clears
//! it), every other cell of an existing row is kept. All touched chunks, the
//! recomputed metadata and the growing record go out in one batch.

use std::collections::HashSet;

use tracing::{debug, info};
use wellstore_storage::WriteBatch;

use crate::channel::{
    validate_channel_count, validate_delimiter, validate_mnemonic, ChannelDefinition, ChannelValue,
    DataType, LogId,
};
use crate::chunk::{ChannelDataChunk, Row};
use crate::config::EngineConfig;
use crate::engine::ChannelDataEngine;
use crate::error::{Error, Result};
use crate::index::{Direction, IndexType, IndexValue};
use crate::metadata::{ChannelMetadata, GrowingRecord, LogMetadata};
use crate::partition::Partitioner;

#[derive(Debug, Clone, PartialEq)]
pub struct MergeRequest {
    pub log_id: LogId,
    /// Must match the log when given.
    pub direction: Option<Direction>,
    /// Must match the log when given.
    pub index_type: Option<IndexType>,
    /// Mnemonics of the row columns, index channel first.
    pub columns: Vec<String>,
    /// Units parallel to `columns`; may be left empty when no new channel is
    /// introduced.
    pub units: Vec<String>,
    pub rows: Vec<String>,
    /// Overrides the log's null indicator for this request.
    pub null_value: Option<String>,
    /// Overrides the log's delimiter for this request.
    pub delimiter: Option<char>,
}

impl MergeRequest {
    pub fn new(log_id: LogId, columns: Vec<String>, rows: Vec<String>) -> Self {
        Self {
            log_id,
            direction: None,
            index_type: None,
            columns,
            units: Vec::new(),
            rows,
            null_value: None,
            delimiter: None,
        }
    }

    pub fn with_units(mut self, units: Vec<String>) -> Self {
        self.units = units;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn with_index_type(mut self, index_type: IndexType) -> Self {
        self.index_type = Some(index_type);
        self
    }

    pub fn with_null_value(mut self, null_value: impl Into<String>) -> Self {
        self.null_value = Some(null_value.into());
        self
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = Some(delimiter);
        self
    }
}

/// ChannelRange is the (min, max) index over the non-null cells of a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRange {
    pub mnemonic: String,
    pub min: Option<IndexValue>,
    pub max: Option<IndexValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub log_id: LogId,
    pub rows_merged: usize,
    pub chunks_written: usize,
    pub start: Option<IndexValue>,
    pub end: Option<IndexValue>,
    pub channels: Vec<ChannelRange>,
    pub is_growing: bool,
}

impl MergeResult {
    fn new(meta: &LogMetadata, rows_merged: usize, chunks_written: usize, is_growing: bool) -> Self {
        let value = |k: Option<i64>| k.map(|k| IndexValue::from_key(meta.index_type, k));
        Self {
            log_id: meta.id.clone(),
            rows_merged,
            chunks_written,
            start: meta.start(),
            end: meta.end(),
            channels: meta
                .channels
                .iter()
                .map(|c| ChannelRange {
                    mnemonic: c.mnemonic.clone(),
                    min: value(c.min_index),
                    max: value(c.max_index),
                })
                .collect(),
            is_growing,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IncomingRow {
    pub index: i64,
    /// one cell per data column of the request
    pub values: Vec<Option<ChannelValue>>,
}

/// PreparedMerge is a request checked against one version of the log.
#[derive(Debug)]
pub(crate) struct PreparedMerge {
    pub version: u64,
    pub columns: Vec<String>,
    pub new_channels: Vec<ChannelMetadata>,
    /// sorted ascending by index, no duplicates
    pub rows: Vec<IncomingRow>,
}

pub(crate) fn prepare(meta: &LogMetadata, request: &MergeRequest, config: &EngineConfig) -> Result<PreparedMerge> {
    if let Some(direction) = request.direction {
        if direction != meta.direction {
            return Err(Error::DirectionMismatch {
                requested: direction.to_string(),
                actual: meta.direction.to_string(),
            });
        }
    }
    if let Some(index_type) = request.index_type {
        if index_type != meta.index_type {
            return Err(Error::MixedIndexTypes {
                value: index_type.to_string(),
                expected: meta.index_type.to_string(),
            });
        }
    }

    let delimiter = request.delimiter.unwrap_or(meta.delimiter);
    let null_value = request.null_value.as_deref().unwrap_or(&meta.null_value);
    validate_delimiter(delimiter, null_value)?;

    let mut seen = HashSet::new();
    for column in &request.columns {
        validate_mnemonic(column, delimiter)?;
        if !seen.insert(column.as_str()) {
            return Err(Error::DuplicateColumnIdentifier(column.clone()));
        }
    }

    let index = meta.index_mnemonic();
    match request.columns.iter().position(|c| c == index) {
        Some(0) => {}
        Some(_) => return Err(Error::IndexNotFirstColumn(index.to_string())),
        None => return Err(Error::IndexColumnMissing(index.to_string())),
    }

    if !request.units.is_empty() && request.units.len() != request.columns.len() {
        return Err(Error::UnitCountMismatch {
            units: request.units.len(),
            columns: request.columns.len(),
        });
    }

    let columns = request.columns[1..].to_vec();
    let mut new_channels = Vec::new();
    let mut types = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        match meta.channel(column) {
            Some(channel) => types.push(channel.data_type),
            None => {
                let unit = request.units.get(i + 1).map(|u| u.trim()).unwrap_or_default();
                if unit.is_empty() {
                    return Err(Error::MissingUnitForChannel(column.clone()));
                }
                let def = ChannelDefinition::new(column.as_str(), unit, DataType::Double);
                new_channels.push(ChannelMetadata::from_definition(&def));
                types.push(DataType::Double);
            }
        }
    }

    validate_channel_count(meta.channels.len() + new_channels.len())?;

    let nodes = request.rows.len();
    if nodes > config.max_data_nodes {
        return Err(Error::MaxNodesExceeded {
            nodes,
            limit: config.max_data_nodes,
        });
    }
    let points = nodes.saturating_mul(request.columns.len());
    if points > config.max_data_points {
        return Err(Error::MaxPointsExceeded {
            points,
            limit: config.max_data_points,
        });
    }

    let mut rows = Vec::with_capacity(nodes);
    for (i, line) in request.rows.iter().enumerate() {
        let tokens: Vec<&str> = line.split(delimiter).collect();
        if tokens.len() != request.columns.len() {
            return Err(Error::RowShapeMismatch {
                row: i,
                expected: request.columns.len(),
                actual: tokens.len(),
            });
        }

        let token = tokens[0].trim();
        if token.is_empty() || token == null_value {
            return Err(Error::RequiredFieldEmpty(format!("index value of row {}", i)));
        }
        let index = IndexValue::parse(token, meta.index_type, meta.depth_scale)?;

        let values = tokens[1..]
            .iter()
            .zip(columns.iter().zip(&types))
            .map(|(token, (column, data_type))| ChannelValue::parse(token, *data_type, null_value, column))
            .collect::<Result<Vec<_>>>()?;

        rows.push(IncomingRow {
            index: index.key(),
            values,
        });
    }

    rows.sort_by_key(|r| r.index);
    if let Some(pair) = rows.windows(2).find(|w| w[0].index == w[1].index) {
        return Err(Error::DuplicateIndexInBatch(meta.format_key(pair[0].index)));
    }

    Ok(PreparedMerge {
        version: meta.version,
        columns,
        new_channels,
        rows,
    })
}

/// merge_rows folds sorted incoming rows into a chunk. `positions[j]` is the
/// chunk column receiving incoming value `j`.
pub(crate) fn merge_rows(chunk: &mut ChannelDataChunk, positions: &[usize], incoming: &[IncomingRow]) {
    let width = chunk.columns.len();
    let existing = std::mem::take(&mut chunk.rows);
    let mut merged = Vec::with_capacity(existing.len() + incoming.len());
    let mut existing = existing.into_iter().peekable();

    for row in incoming {
        while let Some(e) = existing.next_if(|e| e.index < row.index) {
            merged.push(e);
        }

        let mut target = existing
            .next_if(|e| e.index == row.index)
            .unwrap_or_else(|| Row::new(row.index, vec![None; width]));
        for (value, &pos) in row.values.iter().zip(positions) {
            target.values[pos] = value.clone();
        }
        merged.push(target);
    }

    merged.extend(existing);
    chunk.rows = merged;
}

impl ChannelDataEngine {
    /// merge upserts the rows of the request into the log.
    pub async fn merge(&self, request: MergeRequest) -> Result<MergeResult> {
        let config = self.config().snapshot();
        let id = &request.log_id;

        let meta = self.metadata.require(id).await?;
        let mut prepared = prepare(&meta, &request, &config)?;

        let guard = self.locks.write(id, config.lock_timeout).await?;
        let (_guard, meta) = self.require_locked(id, guard).await?;
        if meta.version != prepared.version {
            prepared = prepare(&meta, &request, &config)?;
        }

        let mut next = (*meta).clone();
        next.channels.extend(prepared.new_channels.iter().cloned());
        let columns = next.data_columns();
        let positions: Vec<usize> = prepared
            .columns
            .iter()
            .filter_map(|c| columns.iter().position(|x| x == c))
            .collect();

        let partitioner = Partitioner::for_log(&config, next.index_type, next.direction, next.depth_scale)?;
        if let (Some(first), Some(last)) = (prepared.rows.first(), prepared.rows.last()) {
            debug!(
                log = %id,
                rows = prepared.rows.len(),
                spanned = partitioner.affected_chunk_ids(first.index, last.index).len(),
                "merging"
            );
        }

        let mut batch = WriteBatch::new();
        let mut chunks_written = 0;
        let mut rest = prepared.rows.as_slice();
        while let Some(first) = rest.first() {
            let range = partitioner.place(first.index, &next.chunks, |s| s.end);
            let n = rest.iter().take_while(|r| range.contains(r.index)).count();
            let (group, tail) = rest.split_at(n);

            let mut chunk = self.chunks.load(id, range, &columns).await?;
            merge_rows(&mut chunk, &positions, group);
            self.chunks.save(&mut batch, id, &chunk);
            next.apply_chunk(&chunk);

            chunks_written += 1;
            rest = tail;
        }
        next.recompute_ranges();

        let now = self.now_micros();
        let appended = match (meta.end_key(), next.end_key()) {
            (Some(before), Some(after)) => next.direction.beyond(after, before),
            _ => false,
        };
        let current = self.metadata.get_growing(id).await?;
        let record = if appended {
            Some(GrowingRecord {
                is_growing: true,
                last_append_micros: now,
            })
        } else if current.is_none() && next.has_data() {
            Some(GrowingRecord {
                is_growing: false,
                last_append_micros: now,
            })
        } else {
            None
        };
        if let Some(record) = &record {
            self.metadata.stage_growing(&mut batch, id, record)?;
        }
        let is_growing = record.or(current).map(|r| r.is_growing).unwrap_or(false);

        next.version += 1;
        next.updated_micros = now;
        self.metadata.stage_put(&mut batch, &next)?;
        self.commit(id, batch).await?;

        if appended && !current.map(|r| r.is_growing).unwrap_or(false) {
            info!(log = %id, end = ?next.end_key(), "log is growing");
        }
        debug!(log = %id, rows = prepared.rows.len(), chunks = chunks_written, "merge committed");

        let result = MergeResult::new(&next, prepared.rows.len(), chunks_written, is_growing);
        self.metadata.publish(next);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use quickcheck::{QuickCheck, TestResult};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    use crate::channel::{ChannelDefinition, ChannelValue, DataType, LogHeader, LogId};
    use crate::chunk::{ChannelDataChunk, Row};
    use crate::config::EngineConfig;
    use crate::engine::tests::{depth_header, engine};
    use crate::error::ErrorKind;
    use crate::index::{Direction, IndexType};
    use crate::merge::{merge_rows, prepare, IncomingRow, MergeRequest};
    use crate::metadata::LogMetadata;
    use crate::partition::ChunkRange;
    use crate::query::QueryRequest;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn meta() -> LogMetadata {
        LogMetadata::from_header(&depth_header("m", Direction::Increasing, &["A", "B"]), 3, 0)
    }

    fn request(columns: &[&str], rows: &[&str]) -> MergeRequest {
        MergeRequest::new(LogId::new("w1", "wb1", "m"), strings(columns), strings(rows))
    }

    #[test]
    fn test_prepare_shape_errors() {
        let meta = meta();
        let config = EngineConfig::default();
        let kind = |r: MergeRequest| prepare(&meta, &r, &config).unwrap_err().kind();

        assert_eq!(kind(request(&["DEPTH", "A"], &["1,2,3"])), ErrorKind::RowShapeMismatch);
        assert_eq!(kind(request(&["DEPTH", "A", "A"], &["1,2,3"])), ErrorKind::DuplicateColumnIdentifier);
        assert_eq!(kind(request(&["DEPTH", "A<"], &["1,2"])), ErrorKind::BadColumnIdentifier);
        let long = "A".repeat(65_536);
        assert_eq!(
            kind(request(&["DEPTH", long.as_str()], &["1,2"]).with_units(strings(&["m", "api"]))),
            ErrorKind::BadColumnIdentifier
        );
        assert_eq!(kind(request(&["A", "B"], &["1,2"])), ErrorKind::IndexColumnMissing);
        assert_eq!(kind(request(&["A", "DEPTH"], &["1,2"])), ErrorKind::IndexNotFirstColumn);
        assert_eq!(kind(request(&["DEPTH", "A"], &["15,1", "15.0001,2"])), ErrorKind::DuplicateIndexInBatch);
        assert_eq!(
            kind(request(&["DEPTH", "A"], &["2024-01-01T00:00:00Z,1"])),
            ErrorKind::MixedIndexTypes
        );
        assert_eq!(
            kind(request(&["DEPTH", "A"], &["1,2"]).with_index_type(IndexType::Time)),
            ErrorKind::MixedIndexTypes
        );
        assert_eq!(
            kind(request(&["DEPTH", "A"], &["1,2"]).with_direction(Direction::Decreasing)),
            ErrorKind::DirectionMismatch
        );
        assert_eq!(kind(request(&["DEPTH", "NEW"], &["1,2"])), ErrorKind::MissingUnitForChannel);
        assert_eq!(
            kind(request(&["DEPTH", "A"], &["1,2"]).with_units(strings(&["m"]))),
            ErrorKind::UnitCountMismatch
        );
        assert_eq!(kind(request(&["DEPTH", "A"], &[",2"])), ErrorKind::RequiredFieldEmpty);
        assert_eq!(kind(request(&["DEPTH", "A"], &["1,abc"])), ErrorKind::InvalidChannelValue);
    }

    #[test]
    fn test_prepare_time_resolution() {
        let header = LogHeader::new(LogId::new("w1", "wb1", "t"), IndexType::Time, Direction::Increasing)
            .with_channel(ChannelDefinition::new("TIME", "s", DataType::Double))
            .with_channel(ChannelDefinition::new("A", "api", DataType::Double));
        let meta = LogMetadata::from_header(&header, 3, 0);
        let config = EngineConfig::default();

        // 100ns apart lands on one microsecond key
        let r = MergeRequest::new(
            header.id.clone(),
            strings(&["TIME", "A"]),
            strings(&["2024-01-01T00:00:00.0000001Z,1", "2024-01-01T00:00:00.0000002Z,2"]),
        );
        let e = prepare(&meta, &r, &config).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::DuplicateIndexInBatch);
        assert!(e.to_string().contains("2024-01-01T00:00:00Z"));

        let r = MergeRequest::new(
            header.id.clone(),
            strings(&["TIME", "A"]),
            strings(&["2024-01-01T00:00:00.000001Z,1", "2024-01-01T00:00:00.000002Z,2"]),
        );
        let prepared = prepare(&meta, &r, &config).unwrap();
        let idx: Vec<i64> = prepared.rows.iter().map(|r| r.index).collect();
        assert_eq!(idx[1] - idx[0], 1);
    }

    #[test]
    fn test_prepare_ceilings() {
        let meta = meta();
        let mut config = EngineConfig::default();
        config.max_data_nodes = 2;
        let r = request(&["DEPTH", "A"], &["1,1", "2,2", "3,3"]);
        assert_eq!(prepare(&meta, &r, &config).unwrap_err().kind(), ErrorKind::MaxNodesExceeded);

        let mut config = EngineConfig::default();
        config.max_data_points = 5;
        assert_eq!(prepare(&meta, &r, &config).unwrap_err().kind(), ErrorKind::MaxPointsExceeded);
    }

    #[test]
    fn test_prepare_sorts_and_introduces_channels() {
        let meta = meta();
        let r = request(&["DEPTH", "B", "C"], &["3,,1", "1,0.5,"])
            .with_units(strings(&["m", "api", "ohm"]));
        let prepared = prepare(&meta, &r, &EngineConfig::default()).unwrap();

        assert_eq!(prepared.columns, strings(&["B", "C"]));
        assert_eq!(prepared.new_channels.len(), 1);
        assert_eq!(prepared.new_channels[0].unit, "ohm");
        let idx: Vec<i64> = prepared.rows.iter().map(|r| r.index).collect();
        assert_eq!(idx, vec![1000, 3000]);
        assert_eq!(prepared.rows[1].values, vec![None, Some(ChannelValue::Double(1.0))]);
    }

    #[test]
    fn test_merge_rows_column_upsert() {
        let d = |v: f64| Some(ChannelValue::Double(v));
        let mut chunk = ChannelDataChunk::empty(ChunkRange::new(0, 100), strings(&["A", "B", "C"]));
        chunk.rows = vec![
            Row::new(13, vec![d(13.1), None, None]),
            Row::new(15, vec![d(15.1), d(15.2), None]),
        ];

        // only C named; B cleared at 15 by an explicit null
        let incoming = vec![
            IncomingRow { index: 14, values: vec![d(14.3), None] },
            IncomingRow { index: 15, values: vec![d(15.0), None] },
        ];
        merge_rows(&mut chunk, &[2, 1], &incoming);

        assert_eq!(chunk.rows.len(), 3);
        assert_eq!(chunk.rows[1], Row::new(14, vec![None, None, d(14.3)]));
        assert_eq!(chunk.rows[2], Row::new(15, vec![d(15.1), None, d(15.0)]));
        assert_eq!(chunk.rows[0], Row::new(13, vec![d(13.1), None, None]));
    }

    #[tokio::test]
    async fn test_merge_spans_chunks_and_sets_ranges() {
        let mut config = EngineConfig::default();
        config.depth_chunk_size = 10.0;
        let engine = engine(config);
        let header = depth_header("log", Direction::Increasing, &["A", "B"]);
        engine.create_log(header.clone()).await.unwrap();

        let r = MergeRequest::new(
            header.id.clone(),
            strings(&["DEPTH", "A", "B"]),
            strings(&["25,1,", "5,2,", "15,,3"]),
        );
        let result = engine.merge(r).await.unwrap();

        assert_eq!(result.rows_merged, 3);
        assert_eq!(result.chunks_written, 3);
        assert_eq!(result.start.unwrap().format(3), "5");
        assert_eq!(result.end.unwrap().format(3), "25");
        assert_eq!(result.channels[2].min.unwrap().format(3), "15");
        assert_eq!(result.channels[2].max.unwrap().format(3), "15");
        assert!(!result.is_growing);

        let meta = engine.log_metadata(&header.id).await.unwrap();
        assert_eq!(meta.chunks.keys().copied().collect::<Vec<_>>(), vec![0, 10_000, 20_000]);
    }

    fn final_rows(entries: &BTreeMap<u16, i32>, order: Vec<String>, twice: bool) -> Vec<String> {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut config = EngineConfig::default();
            config.depth_chunk_size = 50.0;
            let engine = engine(config);
            let header = depth_header("prop", Direction::Increasing, &["A"]);
            engine.create_log(header.clone()).await.unwrap();

            let r = MergeRequest::new(header.id.clone(), strings(&["DEPTH", "A"]), order);
            engine.merge(r.clone()).await.unwrap();
            if twice {
                engine.merge(r).await.unwrap();
            }

            let rows = engine
                .query(QueryRequest::new(header.id.clone()))
                .await
                .unwrap()
                .rows;
            assert_eq!(rows.len(), entries.len());
            rows
        })
    }

    #[test]
    fn test_order_independence_and_idempotence() {
        fn prop(input: Vec<(u16, i32)>, seed: u64) -> TestResult {
            let entries: BTreeMap<u16, i32> = input.into_iter().collect();
            if entries.is_empty() {
                return TestResult::discard();
            }
            let sorted: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("{}.{},{}", k / 10, k % 10, v))
                .collect();
            let mut shuffled = sorted.clone();
            shuffled.shuffle(&mut StdRng::seed_from_u64(seed));

            let expected = final_rows(&entries, sorted.clone(), false);
            TestResult::from_bool(
                final_rows(&entries, shuffled, false) == expected
                    && final_rows(&entries, sorted, true) == expected,
            )
        }

        QuickCheck::new()
            .tests(25)
            .quickcheck(prop as fn(Vec<(u16, i32)>, u64) -> TestResult);
    }
}
