//! WAL record encoding and decoding.
//!
//! Two interchangeable encoders share the [`WalEncoder`] contract. The
//! encoder is picked once at database construction and used for every write,
//! the open-time scan, and recovery.
//!
//! # Binary format (canonical)
//!
//! All integers big-endian:
//!
//! ```text
//! Size      Type     Description
//! ─────────────────────────────────────────────
//! 4         u32      payload length (excludes this field and the checksum)
//! 8         u64      log id
//! 1         u8       operation (0 = insert, 1 = delete)
//! 8         u64      vector id
//! 4         u32      dim
//! dim*4     [f32]    vector data (IEEE-754 bits)
//! 4         u32      doc length
//! doc_len   bytes    doc JSON
//! 4         u32      attributes length
//! attr_len  bytes    attributes JSON
//! 4         u32      CRC-32 (IEEE) over log id .. attributes JSON
//! ```
//!
//! # Text format (debug)
//!
//! One JSON object per line, no checksum; a corrupt line surfaces as a JSON
//! parse error. Human-readable, not an on-disk compatibility surface.

use std::io::{self, BufRead, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{DocMap, EncoderKind};

/// Headroom guard against decoding a garbage length prefix as a huge
/// allocation. No legitimate record approaches this.
const MAX_RECORD_BYTES: u32 = 64 * 1024 * 1024;

/// Fixed-width portion of a binary payload: log id + op + vector id + dim +
/// doc length + attributes length.
const MIN_PAYLOAD_BYTES: u32 = 8 + 1 + 8 + 4 + 4 + 4;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("truncated record while reading {context}")]
    Truncated { context: &'static str },

    #[error("record length {len} out of bounds")]
    BadRecordLength { len: u32 },

    #[error("unknown operation byte {0}")]
    UnknownOperation(u8),

    #[error("malformed record payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Mutation kind carried by a WAL record.
///
/// The current write path only produces inserts; deletes are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalOp {
    Insert,
    Delete,
}

impl WalOp {
    fn as_byte(self) -> u8 {
        match self {
            WalOp::Insert => 0,
            WalOp::Delete => 1,
        }
    }

    fn from_byte(b: u8) -> Result<Self, EncoderError> {
        match b {
            0 => Ok(WalOp::Insert),
            1 => Ok(WalOp::Delete),
            other => Err(EncoderError::UnknownOperation(other)),
        }
    }
}

/// A single durable mutation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    pub log_id: u64,
    pub version: String,
    pub op: WalOp,
    pub vector_id: u64,
    pub vector: Vec<f32>,
    pub doc: DocMap,
    pub attributes: DocMap,
}

/// Contract shared by the binary and text encoders.
///
/// `decode` returns `Ok(None)` on clean end-of-stream at a record boundary;
/// any mid-record EOF, checksum failure, or parse failure is an error. The
/// caller stops reading further records on the first error.
pub trait WalEncoder: Send + Sync {
    fn encode(&self, writer: &mut dyn Write, record: &WalRecord) -> Result<(), EncoderError>;

    fn decode(&self, reader: &mut dyn BufRead) -> Result<Option<WalRecord>, EncoderError>;

    fn name(&self) -> &'static str;
}

/// Build the encoder for a configured kind. Binary is the default for
/// anything unrecognized upstream (see [`EncoderKind`]).
pub fn encoder_for(kind: EncoderKind, version: &str) -> Box<dyn WalEncoder> {
    match kind {
        EncoderKind::Text => Box::new(TextWalEncoder::new(version)),
        EncoderKind::Binary => Box::new(BinaryWalEncoder::new(version)),
    }
}

/// Big-endian, length-prefixed, CRC-checked encoder. Production format.
pub struct BinaryWalEncoder {
    version: String,
}

impl BinaryWalEncoder {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
        }
    }
}

impl WalEncoder for BinaryWalEncoder {
    fn encode(&self, writer: &mut dyn Write, record: &WalRecord) -> Result<(), EncoderError> {
        let doc_bytes = serde_json::to_vec(&record.doc)?;
        let attr_bytes = serde_json::to_vec(&record.attributes)?;

        let payload_len =
            MIN_PAYLOAD_BYTES as usize + record.vector.len() * 4 + doc_bytes.len() + attr_bytes.len();
        let mut payload = Vec::with_capacity(payload_len);

        payload.extend_from_slice(&record.log_id.to_be_bytes());
        payload.push(record.op.as_byte());
        payload.extend_from_slice(&record.vector_id.to_be_bytes());
        payload.extend_from_slice(&(record.vector.len() as u32).to_be_bytes());
        for &val in &record.vector {
            payload.extend_from_slice(&val.to_bits().to_be_bytes());
        }
        payload.extend_from_slice(&(doc_bytes.len() as u32).to_be_bytes());
        payload.extend_from_slice(&doc_bytes);
        payload.extend_from_slice(&(attr_bytes.len() as u32).to_be_bytes());
        payload.extend_from_slice(&attr_bytes);

        let checksum = crc32fast::hash(&payload);

        writer.write_all(&(payload_len as u32).to_be_bytes())?;
        writer.write_all(&payload)?;
        writer.write_all(&checksum.to_be_bytes())?;
        Ok(())
    }

    fn decode(&self, reader: &mut dyn BufRead) -> Result<Option<WalRecord>, EncoderError> {
        let mut len_buf = [0u8; 4];
        let n = reader.read(&mut len_buf)?;
        if n == 0 {
            return Ok(None);
        }
        reader
            .read_exact(&mut len_buf[n..])
            .map_err(|_| EncoderError::Truncated {
                context: "length prefix",
            })?;

        let payload_len = u32::from_be_bytes(len_buf);
        if payload_len < MIN_PAYLOAD_BYTES || payload_len > MAX_RECORD_BYTES {
            return Err(EncoderError::BadRecordLength { len: payload_len });
        }

        let mut payload = vec![0u8; payload_len as usize];
        reader
            .read_exact(&mut payload)
            .map_err(|_| EncoderError::Truncated { context: "payload" })?;

        let mut checksum_buf = [0u8; 4];
        reader
            .read_exact(&mut checksum_buf)
            .map_err(|_| EncoderError::Truncated {
                context: "checksum",
            })?;

        let expected = u32::from_be_bytes(checksum_buf);
        let actual = crc32fast::hash(&payload);
        if expected != actual {
            return Err(EncoderError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = PayloadCursor::new(&payload);
        let log_id = cursor.take_u64("log id")?;
        let op = WalOp::from_byte(cursor.take_u8("operation")?)?;
        let vector_id = cursor.take_u64("vector id")?;

        let dim = cursor.take_u32("dim")? as usize;
        let vector_bytes = cursor.take_bytes(dim * 4, "vector data")?;
        let mut vector = Vec::with_capacity(dim);
        for chunk in vector_bytes.chunks_exact(4) {
            vector.push(f32::from_bits(u32::from_be_bytes(chunk.try_into().unwrap())));
        }

        let doc_len = cursor.take_u32("doc length")? as usize;
        let doc: DocMap = serde_json::from_slice(cursor.take_bytes(doc_len, "doc JSON")?)?;

        let attr_len = cursor.take_u32("attributes length")? as usize;
        let attributes: DocMap =
            serde_json::from_slice(cursor.take_bytes(attr_len, "attributes JSON")?)?;

        Ok(Some(WalRecord {
            log_id,
            version: self.version.clone(),
            op,
            vector_id,
            vector,
            doc,
            attributes,
        }))
    }

    fn name(&self) -> &'static str {
        "binary"
    }
}

/// Bounds-checked reader over a decoded payload.
struct PayloadCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> PayloadCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take_bytes(&mut self, n: usize, context: &'static str) -> Result<&'a [u8], EncoderError> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(EncoderError::Truncated { context })?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn take_u8(&mut self, context: &'static str) -> Result<u8, EncoderError> {
        Ok(self.take_bytes(1, context)?[0])
    }

    fn take_u32(&mut self, context: &'static str) -> Result<u32, EncoderError> {
        Ok(u32::from_be_bytes(
            self.take_bytes(4, context)?.try_into().unwrap(),
        ))
    }

    fn take_u64(&mut self, context: &'static str) -> Result<u64, EncoderError> {
        Ok(u64::from_be_bytes(
            self.take_bytes(8, context)?.try_into().unwrap(),
        ))
    }
}

/// Human-readable JSON-lines encoder, for debugging a WAL by eye. No
/// checksum; corruption is caught by the JSON parser.
pub struct TextWalEncoder {
    version: String,
}

impl TextWalEncoder {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
        }
    }
}

impl WalEncoder for TextWalEncoder {
    fn encode(&self, writer: &mut dyn Write, record: &WalRecord) -> Result<(), EncoderError> {
        let line = serde_json::to_vec(record)?;
        writer.write_all(&line)?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn decode(&self, reader: &mut dyn BufRead) -> Result<Option<WalRecord>, EncoderError> {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 || line.trim().is_empty() {
            return Ok(None);
        }
        let record: WalRecord = serde_json::from_str(line.trim_end())?;
        Ok(Some(record))
    }

    fn name(&self) -> &'static str {
        "text"
    }
}
