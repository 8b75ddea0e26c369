//! Binary layout of a stored chunk.
//!
//! ```text
//! | version (1B) | start (8B) | end (8B) | column count (2B) | (len (2B) | mnemonic)* |
//! | row count (4B) | row* |
//! row:  | index (8B) | cell * column count |
//! cell: | tag (1B) | payload |   tag 0 null, 1 f64, 2 i64, 3 len (4B) + utf8
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::channel::ChannelValue;
use crate::chunk::{ChannelDataChunk, Row};
use crate::partition::ChunkRange;

const CHUNK_VERSION: u8 = 1;

const CELL_NULL: u8 = 0;
const CELL_DOUBLE: u8 = 1;
const CELL_LONG: u8 = 2;
const CELL_TEXT: u8 = 3;

pub fn encode_chunk(chunk: &ChannelDataChunk) -> Bytes {
    let mut buf = BytesMut::with_capacity(32 + chunk.rows.len() * (8 + 9 * chunk.columns.len()));

    buf.put_u8(CHUNK_VERSION);
    buf.put_i64(chunk.range.start);
    buf.put_i64(chunk.range.end);

    buf.put_u16(chunk.columns.len() as u16);
    for column in &chunk.columns {
        buf.put_u16(column.len() as u16);
        buf.put_slice(column.as_bytes());
    }

    buf.put_u32(chunk.rows.len() as u32);
    for row in &chunk.rows {
        buf.put_i64(row.index);
        for i in 0..chunk.columns.len() {
            match row.values.get(i).and_then(|v| v.as_ref()) {
                None => buf.put_u8(CELL_NULL),
                Some(ChannelValue::Double(v)) => {
                    buf.put_u8(CELL_DOUBLE);
                    buf.put_f64(*v);
                }
                Some(ChannelValue::Long(v)) => {
                    buf.put_u8(CELL_LONG);
                    buf.put_i64(*v);
                }
                Some(ChannelValue::Text(v)) => {
                    buf.put_u8(CELL_TEXT);
                    buf.put_u32(v.len() as u32);
                    buf.put_slice(v.as_bytes());
                }
            }
        }
    }

    buf.freeze()
}

pub fn decode_chunk(mut data: &[u8]) -> Result<ChannelDataChunk, String> {
    need(data, 1 + 8 + 8 + 2)?;
    let version = data.get_u8();
    if version != CHUNK_VERSION {
        return Err(format!("unsupported chunk version {}", version));
    }
    let start = data.get_i64();
    let end = data.get_i64();

    let n = data.get_u16() as usize;
    let mut columns = Vec::with_capacity(n);
    for _ in 0..n {
        need(data, 2)?;
        let len = data.get_u16() as usize;
        columns.push(read_string(&mut data, len)?);
    }

    need(data, 4)?;
    let n = data.get_u32() as usize;
    let mut rows = Vec::with_capacity(n.min(1 << 16));
    for _ in 0..n {
        need(data, 8)?;
        let index = data.get_i64();
        let mut values = Vec::with_capacity(columns.len());
        for _ in 0..columns.len() {
            need(data, 1)?;
            let v = match data.get_u8() {
                CELL_NULL => None,
                CELL_DOUBLE => {
                    need(data, 8)?;
                    Some(ChannelValue::Double(data.get_f64()))
                }
                CELL_LONG => {
                    need(data, 8)?;
                    Some(ChannelValue::Long(data.get_i64()))
                }
                CELL_TEXT => {
                    need(data, 4)?;
                    let len = data.get_u32() as usize;
                    Some(ChannelValue::Text(read_string(&mut data, len)?))
                }
                tag => return Err(format!("unknown cell tag {}", tag)),
            };
            values.push(v);
        }
        rows.push(Row::new(index, values));
    }

    if data.has_remaining() {
        return Err(format!("{} trailing bytes", data.remaining()));
    }

    Ok(ChannelDataChunk {
        range: ChunkRange::new(start, end),
        columns,
        rows,
    })
}

fn need(data: &[u8], n: usize) -> Result<(), String> {
    if data.remaining() < n {
        return Err(format!("truncated chunk: want {} bytes, have {}", n, data.remaining()));
    }
    Ok(())
}

fn read_string(data: &mut &[u8], len: usize) -> Result<String, String> {
    need(*data, len)?;
    let s = String::from_utf8((*data)[..len].to_vec()).map_err(|e| e.to_string())?;
    data.advance(len);
    Ok(s)
}
