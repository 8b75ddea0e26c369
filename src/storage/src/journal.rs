//! Binary journal record for a [`WriteBatch`].
//!
//! ```text
//! | magic "WSJ1" (4B) | op count (4B) | op ... | crc32 (4B) |
//! op: | flag (1B) | key len (2B) | key | value len (4B) | value |   (put)
//!     | flag (1B) | key len (2B) | key |                           (delete)
//! ```
//!
//! The checksum covers every byte before it. A record that fails the checksum
//! was torn while being written and none of its operations were applied.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::batch::{BatchOp, WriteBatch};

const JOURNAL_MAGIC: &[u8; 4] = b"WSJ1";

const OP_PUT_FLAG: u8 = 0x01;
const OP_DELETE_FLAG: u8 = 0x02;

/// max length of a key in a journal op
const MAX_KEY_LENGTH: usize = u16::MAX as usize;

pub fn encode_batch(batch: &WriteBatch) -> Result<Bytes, String> {
    let size: usize = batch
        .ops()
        .iter()
        .map(|op| match op {
            BatchOp::Put { key, value } => 1 + 2 + key.len() + 4 + value.len(),
            BatchOp::Delete { key } => 1 + 2 + key.len(),
        })
        .sum();

    let mut buf = BytesMut::with_capacity(4 + 4 + size + 4);
    buf.put_slice(JOURNAL_MAGIC);
    buf.put_u32(batch.len() as u32);

    for op in batch.ops() {
        let key = op.key();
        if key.len() > MAX_KEY_LENGTH {
            return Err(format!("key too long: {} bytes", key.len()));
        }

        match op {
            BatchOp::Put { key, value } => {
                buf.put_u8(OP_PUT_FLAG);
                buf.put_u16(key.len() as u16);
                buf.put_slice(key.as_bytes());
                buf.put_u32(value.len() as u32);
                buf.put_slice(value);
            }
            BatchOp::Delete { key } => {
                buf.put_u8(OP_DELETE_FLAG);
                buf.put_u16(key.len() as u16);
                buf.put_slice(key.as_bytes());
            }
        }
    }

    let crc = crc32fast::hash(&buf);
    buf.put_u32(crc);

    Ok(buf.freeze())
}

pub fn decode_batch(data: &[u8]) -> Result<WriteBatch, String> {
    if data.len() < 4 + 4 + 4 {
        return Err(format!("journal too short: {} bytes", data.len()));
    }

    let (body, mut tail) = data.split_at(data.len() - 4);
    let expected = tail.get_u32();
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(format!(
            "checksum mismatch: expected {:#010x}, got {:#010x}",
            expected, actual
        ));
    }

    let mut r = body;
    if &r[..4] != JOURNAL_MAGIC {
        return Err("invalid journal magic".to_string());
    }
    r.advance(4);

    let count = r.get_u32() as usize;
    let mut ops = Vec::with_capacity(count);
    for _ in 0..count {
        if r.remaining() < 3 {
            return Err("truncated op header".to_string());
        }
        let flag = r.get_u8();
        let key = read_slice(&mut r, |r| r.get_u16() as usize, 2)?;
        let key = String::from_utf8(key.to_vec()).map_err(|e| e.to_string())?;

        let op = match flag {
            OP_PUT_FLAG => {
                let value = read_slice(&mut r, |r| r.get_u32() as usize, 4)?;
                BatchOp::Put {
                    key,
                    value: Bytes::copy_from_slice(value),
                }
            }
            OP_DELETE_FLAG => BatchOp::Delete { key },
            _ => return Err(format!("unknown journal op flag: {}", flag)),
        };
        ops.push(op);
    }

    if r.has_remaining() {
        return Err(format!("{} trailing bytes", r.remaining()));
    }

    Ok(WriteBatch::from(ops))
}

fn read_slice<'a>(
    r: &mut &'a [u8],
    read_len: impl Fn(&mut &'a [u8]) -> usize,
    len_size: usize,
) -> Result<&'a [u8], String> {
    if r.remaining() < len_size {
        return Err("truncated length".to_string());
    }
    let n = read_len(r);
    if r.remaining() < n {
        return Err(format!("truncated field: want {} bytes, have {}", n, r.remaining()));
    }
    let s: &'a [u8] = *r;
    let (v, rest) = s.split_at(n);
    *r = rest;
    Ok(v)
}
