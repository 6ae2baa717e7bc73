//! The container byte format.
//!
//! A file is the 8-byte signature, a format version byte, three reserved
//! bytes, the recursively serialized root group, and a trailing 32-bit
//! checksum over everything before it. All integers are little-endian.
//!
//! Group body: attribute count, attribute records, child count, child
//! records, both in name order so serialization is deterministic. A child
//! record is its name, a node tag (group or dataset) and the node body. A
//! dataset body is a filter tag, the rank, the dims, and the payload bytes;
//! with the `deflate` feature large payloads are byte-shuffled and
//! zlib-compressed.
//!
//! Parsing validates every length against the remaining input, rejects
//! unknown tags and caps group nesting, so truncated or corrupt input
//! fails with an error instead of panicking or over-allocating.

use std::collections::BTreeMap;

use crate::error::CodecError;
use crate::store::{valid_name, AttrValue, DatasetNode, GroupNode, Node};

/// Container signature, same shape as other binary container magics:
/// a non-ASCII guard byte, the format name, CR LF, EOF, LF.
pub(crate) const SIGNATURE: [u8; 8] = [0x89, b'B', b'F', b'D', 0x0d, 0x0a, 0x1a, 0x0a];

const VERSION: u8 = 1;
const MAX_DEPTH: usize = 64;

const NODE_GROUP: u8 = 0;
const NODE_DATASET: u8 = 1;

const ATTR_F64: u8 = 0;
const ATTR_I64: u8 = 1;
const ATTR_STRING: u8 = 2;
const ATTR_F64_ARRAY: u8 = 3;
const ATTR_I64_ARRAY: u8 = 4;

const FILTER_RAW: u8 = 0;
const FILTER_SHUFFLE_DEFLATE: u8 = 1;

/// Payloads below this size are stored raw even with `deflate` enabled.
#[cfg(feature = "deflate")]
const DEFLATE_MIN_BYTES: usize = 4096;

// ---------------------------------------------------------------------------
// Checksum
// ---------------------------------------------------------------------------

/// Fletcher-family checksum over 16-bit little-endian words, both running
/// sums reduced modulo 65535. An odd trailing byte is treated as the high
/// byte of a final word.
fn checksum(data: &[u8]) -> u32 {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    let mut words = data.chunks_exact(2);
    for w in &mut words {
        let word = u16::from_le_bytes([w[0], w[1]]) as u32;
        sum1 = (sum1 + word) % 65535;
        sum2 = (sum2 + sum1) % 65535;
    }
    if let [last] = words.remainder() {
        sum1 = (sum1 + ((*last as u32) << 8)) % 65535;
        sum2 = (sum2 + sum1) % 65535;
    }
    (sum2 << 16) | sum1
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Serialize a tree into container bytes, checksum included.
pub(crate) fn serialize(root: &GroupNode) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&SIGNATURE);
    out.push(VERSION);
    out.extend_from_slice(&[0; 3]);
    write_group(&mut out, root);
    let sum = checksum(&out);
    out.extend_from_slice(&sum.to_le_bytes());
    out
}

fn write_group(out: &mut Vec<u8>, group: &GroupNode) {
    out.extend_from_slice(&(group.attrs.len() as u32).to_le_bytes());
    for (name, value) in &group.attrs {
        write_name(out, name);
        write_attr(out, value);
    }
    out.extend_from_slice(&(group.children.len() as u32).to_le_bytes());
    for (name, node) in &group.children {
        write_name(out, name);
        match node {
            Node::Group(g) => {
                out.push(NODE_GROUP);
                write_group(out, g);
            }
            Node::Dataset(ds) => {
                out.push(NODE_DATASET);
                write_dataset(out, ds);
            }
        }
    }
}

fn write_name(out: &mut Vec<u8>, name: &str) {
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
}

fn write_attr(out: &mut Vec<u8>, value: &AttrValue) {
    match value {
        AttrValue::F64(v) => {
            out.push(ATTR_F64);
            out.extend_from_slice(&v.to_le_bytes());
        }
        AttrValue::I64(v) => {
            out.push(ATTR_I64);
            out.extend_from_slice(&v.to_le_bytes());
        }
        AttrValue::String(s) => {
            out.push(ATTR_STRING);
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        AttrValue::F64Array(v) => {
            out.push(ATTR_F64_ARRAY);
            out.extend_from_slice(&(v.len() as u64).to_le_bytes());
            for x in v {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
        AttrValue::I64Array(v) => {
            out.push(ATTR_I64_ARRAY);
            out.extend_from_slice(&(v.len() as u64).to_le_bytes());
            for x in v {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
    }
}

fn write_dataset(out: &mut Vec<u8>, ds: &DatasetNode) {
    let mut raw = Vec::with_capacity(ds.data.len() * 8);
    for v in &ds.data {
        raw.extend_from_slice(&v.to_le_bytes());
    }

    let (filter, payload) = encode_payload(raw);
    out.push(filter);
    out.push(ds.dims.len() as u8);
    for d in &ds.dims {
        out.extend_from_slice(&d.to_le_bytes());
    }
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&payload);
}

#[cfg(feature = "deflate")]
fn encode_payload(raw: Vec<u8>) -> (u8, Vec<u8>) {
    use std::io::Write;
    if raw.len() < DEFLATE_MIN_BYTES {
        return (FILTER_RAW, raw);
    }
    let shuffled = shuffle(&raw);
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    let compressed = encoder
        .write_all(&shuffled)
        .and_then(|_| encoder.finish())
        .ok();
    match compressed {
        // Keep the filter only when it actually pays off.
        Some(c) if c.len() < raw.len() => (FILTER_SHUFFLE_DEFLATE, c),
        _ => (FILTER_RAW, raw),
    }
}

#[cfg(not(feature = "deflate"))]
fn encode_payload(raw: Vec<u8>) -> (u8, Vec<u8>) {
    (FILTER_RAW, raw)
}

/// Group bytes by position within each 8-byte element: all byte 0s, then
/// all byte 1s, and so on. Exposes the slowly-varying exponent bytes of
/// f64 data to the compressor.
#[cfg(feature = "deflate")]
fn shuffle(data: &[u8]) -> Vec<u8> {
    let n = data.len() / 8;
    let mut out = vec![0u8; data.len()];
    for i in 0..n {
        for b in 0..8 {
            out[b * n + i] = data[i * 8 + b];
        }
    }
    out
}

#[cfg(feature = "deflate")]
fn unshuffle(data: &[u8]) -> Vec<u8> {
    let n = data.len() / 8;
    let mut out = vec![0u8; data.len()];
    for i in 0..n {
        for b in 0..8 {
            out[i * 8 + b] = data[b * n + i];
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let available = self.data.len().saturating_sub(self.pos);
        if n > available {
            return Err(CodecError::UnexpectedEof {
                expected: n,
                available,
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(self.u64()? as i64)
    }

    fn f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_bits(self.u64()?))
    }
}

/// Parse container bytes back into a tree.
pub(crate) fn parse(bytes: &[u8]) -> Result<GroupNode, CodecError> {
    if bytes.len() < SIGNATURE.len() {
        return Err(CodecError::BadSignature);
    }
    if bytes[..SIGNATURE.len()] != SIGNATURE {
        return Err(CodecError::BadSignature);
    }

    let mut cur = Cursor {
        data: bytes,
        pos: SIGNATURE.len(),
    };
    let version = cur.u8()?;
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    cur.take(3)?;

    let body_len = bytes.len().checked_sub(4).ok_or(CodecError::UnexpectedEof {
        expected: 4,
        available: bytes.len(),
    })?;
    let stored = u32::from_le_bytes([
        bytes[body_len],
        bytes[body_len + 1],
        bytes[body_len + 2],
        bytes[body_len + 3],
    ]);
    let computed = checksum(&bytes[..body_len]);
    if stored != computed {
        return Err(CodecError::ChecksumMismatch {
            expected: stored,
            computed,
        });
    }

    cur.data = &bytes[..body_len];
    parse_group(&mut cur, 0)
}

fn parse_group(cur: &mut Cursor<'_>, depth: usize) -> Result<GroupNode, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::NestingTooDeep(MAX_DEPTH));
    }

    let mut attrs = BTreeMap::new();
    let attr_count = cur.u32()?;
    for _ in 0..attr_count {
        let name = parse_name(cur)?;
        let value = parse_attr(cur)?;
        attrs.insert(name, value);
    }

    let mut children = BTreeMap::new();
    let child_count = cur.u32()?;
    for _ in 0..child_count {
        let name = parse_name(cur)?;
        let node = match cur.u8()? {
            NODE_GROUP => Node::Group(parse_group(cur, depth + 1)?),
            NODE_DATASET => Node::Dataset(parse_dataset(cur)?),
            other => return Err(CodecError::BadNodeTag(other)),
        };
        children.insert(name, node);
    }

    Ok(GroupNode { children, attrs })
}

fn parse_name(cur: &mut Cursor<'_>) -> Result<String, CodecError> {
    let len = cur.u16()? as usize;
    let bytes = cur.take(len)?;
    let name = std::str::from_utf8(bytes).map_err(|_| CodecError::BadName)?;
    if !valid_name(name) {
        return Err(CodecError::BadName);
    }
    Ok(name.to_string())
}

fn parse_attr(cur: &mut Cursor<'_>) -> Result<AttrValue, CodecError> {
    match cur.u8()? {
        ATTR_F64 => Ok(AttrValue::F64(cur.f64()?)),
        ATTR_I64 => Ok(AttrValue::I64(cur.i64()?)),
        ATTR_STRING => {
            let len = cur.u32()? as usize;
            let bytes = cur.take(len)?;
            let s = std::str::from_utf8(bytes).map_err(|_| CodecError::BadName)?;
            Ok(AttrValue::String(s.to_string()))
        }
        ATTR_F64_ARRAY => {
            let count = cur.u64()? as usize;
            // Bounds-check the whole array up front so a huge claimed
            // count fails before any allocation.
            let bytes = cur.take(count.saturating_mul(8))?;
            let v = bytes
                .chunks_exact(8)
                .map(|b| {
                    f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
                })
                .collect();
            Ok(AttrValue::F64Array(v))
        }
        ATTR_I64_ARRAY => {
            let count = cur.u64()? as usize;
            let bytes = cur.take(count.saturating_mul(8))?;
            let v = bytes
                .chunks_exact(8)
                .map(|b| {
                    i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
                })
                .collect();
            Ok(AttrValue::I64Array(v))
        }
        other => Err(CodecError::BadAttrTag(other)),
    }
}

fn parse_dataset(cur: &mut Cursor<'_>) -> Result<DatasetNode, CodecError> {
    let filter = cur.u8()?;
    let rank = cur.u8()? as usize;
    let mut dims = Vec::with_capacity(rank);
    for _ in 0..rank {
        dims.push(cur.u64()?);
    }
    let payload_len = cur.u64()? as usize;
    let payload = cur.take(payload_len)?;

    let expected = dims
        .iter()
        .try_fold(8u64, |acc, &d| acc.checked_mul(d))
        .ok_or(CodecError::PayloadSize {
            expected: usize::MAX,
            actual: payload.len(),
        })? as usize;

    let raw = match filter {
        FILTER_RAW => {
            if payload.len() != expected {
                return Err(CodecError::PayloadSize {
                    expected,
                    actual: payload.len(),
                });
            }
            payload.to_vec()
        }
        FILTER_SHUFFLE_DEFLATE => decode_deflate(payload, expected)?,
        other => return Err(CodecError::BadFilterTag(other)),
    };

    let data = raw
        .chunks_exact(8)
        .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .collect();
    Ok(DatasetNode { dims, data })
}

#[cfg(feature = "deflate")]
fn decode_deflate(payload: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
    use std::io::Read;
    let mut decoder = flate2::read::ZlibDecoder::new(payload);
    let mut shuffled = Vec::new();
    decoder
        .read_to_end(&mut shuffled)
        .map_err(|e| CodecError::Decompress(e.to_string()))?;
    if shuffled.len() != expected {
        return Err(CodecError::PayloadSize {
            expected,
            actual: shuffled.len(),
        });
    }
    Ok(unshuffle(&shuffled))
}

#[cfg(not(feature = "deflate"))]
fn decode_deflate(_payload: &[u8], _expected: usize) -> Result<Vec<u8>, CodecError> {
    Err(CodecError::FilterUnavailable("deflate"))
}
