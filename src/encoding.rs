//! Chunk block encoding: fixed-width values, delta-varint timestamps, CRC32 over the payload.
//!
//! Layout:
//!
//! ```text
//! magic (8) | data type (1) | point count (u32) | payload len (u32) | payload crc32 (u32)
//! payload = values (count * width, LE) | base timestamp (i64 LE) | (count - 1) varint deltas
//! ```
//!
//! Values come first so a cursor can decode one point at a time without scanning ahead.

use crate::types::{DataType, Point, Timestamp, Value};

use crc32fast::Hasher as Crc32;

/// Chunk block magic bytes.
pub const CHUNK_BLOCK_MAGIC: &[u8; 8] = b"CMCHNK01";

const HEADER_LEN: usize = 8 + 1 + 4 + 4 + 4;

/// Hard cap on a single block payload.
const MAX_PAYLOAD_LEN: usize = 512 * 1024 * 1024;

/// Failure while decoding a block. Mapped to a typed `DbError` by the chunk reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BlockError {
    /// The bytes do not form a valid block.
    Corrupt(String),
    /// The block is well-formed but two consecutive timestamps are not strictly increasing.
    NonMonotonic { previous: Timestamp, next: Timestamp },
}

/// Parsed, checksum-verified block header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockHeader {
    pub(crate) data_type: DataType,
    pub(crate) count: usize,
    values_start: usize,
    timestamps_start: usize,
    payload_end: usize,
}

/// Encodes `points` (already validated: non-empty, strictly increasing, one data type).
pub(crate) fn encode_block(data_type: DataType, points: &[Point]) -> Result<Vec<u8>, BlockError> {
    if points.is_empty() {
        return Err(BlockError::Corrupt("Refusing to encode an empty block".to_string()));
    }
    if points.len() > u32::MAX as usize {
        return Err(BlockError::Corrupt("Block too large".to_string()));
    }

    let mut payload = Vec::with_capacity(points.len() * (data_type.width() + 2) + 8);
    for p in points {
        write_value(&mut payload, data_type, &p.value)?;
    }

    let base = points[0].timestamp;
    payload.extend_from_slice(&base.to_le_bytes());
    let mut prev = base;
    for p in &points[1..] {
        if p.timestamp <= prev {
            return Err(BlockError::NonMonotonic {
                previous: prev,
                next: p.timestamp,
            });
        }
        // Strictly increasing i64 values always differ by a positive amount that fits in u64.
        let delta = (p.timestamp as i128 - prev as i128) as u64;
        write_var_u64(&mut payload, delta);
        prev = p.timestamp;
    }

    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(BlockError::Corrupt("Block payload too large".to_string()));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(CHUNK_BLOCK_MAGIC);
    buf.push(data_type.code());
    write_u32(&mut buf, points.len() as u32);
    write_u32(&mut buf, payload.len() as u32);
    write_u32(&mut buf, crc32(&payload));
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Parses the header and verifies the payload checksum.
pub(crate) fn read_header(block: &[u8]) -> Result<BlockHeader, BlockError> {
    if block.len() < HEADER_LEN {
        return Err(BlockError::Corrupt(format!(
            "Truncated block header: {} bytes",
            block.len()
        )));
    }
    if &block[..8] != CHUNK_BLOCK_MAGIC {
        return Err(BlockError::Corrupt("Bad chunk block magic".to_string()));
    }
    let data_type = DataType::from_code(block[8])
        .ok_or_else(|| BlockError::Corrupt(format!("Unknown data type code {}", block[8])))?;
    let count = read_u32(block, 9) as usize;
    let payload_len = read_u32(block, 13) as usize;
    let expected_crc = read_u32(block, 17);

    if count == 0 {
        return Err(BlockError::Corrupt("Empty chunk block".to_string()));
    }
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(BlockError::Corrupt(
            "Refusing to read oversized chunk block".to_string(),
        ));
    }
    let payload_end = HEADER_LEN + payload_len;
    if payload_end > block.len() {
        return Err(BlockError::Corrupt(format!(
            "Truncated block payload: declared {} bytes, found {}",
            payload_len,
            block.len() - HEADER_LEN
        )));
    }
    if payload_end != block.len() {
        return Err(BlockError::Corrupt(format!(
            "Block size mismatch: {} trailing bytes after payload",
            block.len() - payload_end
        )));
    }
    let actual_crc = crc32(&block[HEADER_LEN..payload_end]);
    if actual_crc != expected_crc {
        return Err(BlockError::Corrupt("Chunk block payload CRC mismatch".to_string()));
    }

    let values_len = count
        .checked_mul(data_type.width())
        .ok_or_else(|| BlockError::Corrupt("Point count overflow".to_string()))?;
    let timestamps_start = HEADER_LEN + values_len;
    // Base timestamp plus at least one byte per remaining delta.
    let min_ts_len = 8 + (count - 1);
    if timestamps_start + min_ts_len > payload_end {
        return Err(BlockError::Corrupt(format!(
            "Block of {} points cannot fit in {} payload bytes",
            count, payload_len
        )));
    }

    Ok(BlockHeader {
        data_type,
        count,
        values_start: HEADER_LEN,
        timestamps_start,
        payload_end,
    })
}

/// Forward-only position inside a block. Holds offsets, not the bytes, so the owner can keep
/// the block alive independently.
#[derive(Debug, Clone)]
pub(crate) struct BlockCursor {
    header: BlockHeader,
    next_index: usize,
    ts_pos: usize,
    prev: Option<Timestamp>,
}

impl BlockCursor {
    pub(crate) fn new(header: BlockHeader) -> Self {
        Self {
            header,
            next_index: 0,
            ts_pos: header.timestamps_start,
            prev: None,
        }
    }

    /// Decodes the next point, or returns `None` after validating that the block was consumed
    /// exactly.
    pub(crate) fn next_point(&mut self, block: &[u8]) -> Result<Option<Point>, BlockError> {
        if self.next_index >= self.header.count {
            if self.ts_pos != self.header.payload_end {
                return Err(BlockError::Corrupt(format!(
                    "{} unread bytes after last timestamp",
                    self.header.payload_end - self.ts_pos
                )));
            }
            return Ok(None);
        }

        let ts = match self.prev {
            None => {
                let b = slice(block, self.ts_pos, 8, self.header.payload_end)?;
                self.ts_pos += 8;
                i64::from_le_bytes(to_array(b))
            }
            Some(prev) => {
                let delta = read_var_u64(block, &mut self.ts_pos, self.header.payload_end)
                    .map_err(BlockError::Corrupt)?;
                if delta == 0 {
                    return Err(BlockError::NonMonotonic {
                        previous: prev,
                        next: prev,
                    });
                }
                let next = prev as i128 + delta as i128;
                if next > Timestamp::MAX as i128 {
                    return Err(BlockError::Corrupt("Timestamp delta overflow".to_string()));
                }
                next as Timestamp
            }
        };

        let width = self.header.data_type.width();
        let off = self.header.values_start + self.next_index * width;
        let raw = slice(block, off, width, self.header.timestamps_start)?;
        let value = read_value(self.header.data_type, raw)?;

        self.prev = Some(ts);
        self.next_index += 1;
        Ok(Some(Point::new(ts, value)))
    }

    pub(crate) fn remaining(&self) -> usize {
        self.header.count - self.next_index
    }
}

// --- Helpers (binary, varint) ---

fn write_value(buf: &mut Vec<u8>, data_type: DataType, value: &Value) -> Result<(), BlockError> {
    match (data_type, value) {
        (DataType::Boolean, Value::Boolean(v)) => buf.push(*v as u8),
        (DataType::Int32, Value::Int32(v)) => buf.extend_from_slice(&v.to_le_bytes()),
        (DataType::Int64, Value::Int64(v)) => buf.extend_from_slice(&v.to_le_bytes()),
        (DataType::Float, Value::Float(v)) => buf.extend_from_slice(&v.to_le_bytes()),
        (DataType::Double, Value::Double(v)) => buf.extend_from_slice(&v.to_le_bytes()),
        (dt, v) => {
            return Err(BlockError::Corrupt(format!(
                "Value {:?} does not match block type {:?}",
                v, dt
            )))
        }
    }
    Ok(())
}

fn read_value(data_type: DataType, raw: &[u8]) -> Result<Value, BlockError> {
    Ok(match data_type {
        DataType::Boolean => match raw[0] {
            0 => Value::Boolean(false),
            1 => Value::Boolean(true),
            other => {
                return Err(BlockError::Corrupt(format!(
                    "Invalid boolean byte {}",
                    other
                )))
            }
        },
        DataType::Int32 => Value::Int32(i32::from_le_bytes(to_array(raw))),
        DataType::Int64 => Value::Int64(i64::from_le_bytes(to_array(raw))),
        DataType::Float => Value::Float(f32::from_le_bytes(to_array(raw))),
        DataType::Double => Value::Double(f64::from_le_bytes(to_array(raw))),
    })
}

fn slice(block: &[u8], off: usize, len: usize, limit: usize) -> Result<&[u8], BlockError> {
    match off.checked_add(len) {
        Some(end) if end <= limit && end <= block.len() => Ok(&block[off..end]),
        _ => Err(BlockError::Corrupt(format!(
            "Read of {} bytes at offset {} past end of section",
            len, off
        ))),
    }
}

fn to_array<const N: usize>(b: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&b[..N]);
    out
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn read_u32(block: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(to_array(&block[off..off + 4]))
}

#[inline]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

fn write_var_u64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn read_var_u64(block: &[u8], pos: &mut usize, limit: usize) -> Result<u64, String> {
    let mut out: u64 = 0;
    let mut shift: u32 = 0;
    for _ in 0..10 {
        if *pos >= limit {
            return Err("Truncated varint".to_string());
        }
        let byte = block[*pos];
        *pos += 1;
        out |= ((byte & 0x7F) as u64) << shift;
        if (byte & 0x80) == 0 {
            return Ok(out);
        }
        shift = shift.saturating_add(7);
    }
    Err("Varint too long".to_string())
}
