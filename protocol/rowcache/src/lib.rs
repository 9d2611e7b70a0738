//! Wire messages for the row cache service.
//!
//! Three messages cross the service's internal seams:
//!
//! - [`RowHeader`]: first part of every ingested row, declaring the row id
//!   and the byte size of each data column that follows
//! - [`BatchDescriptor`]: produced by fetch preparation, one locator per
//!   requested row plus the owning connection id
//! - [`FetchSubRequest`]: one per-row fetch dispatched to a worker queue
//!
//! All integers are little-endian. Source locations travel as opaque pool
//! handles and destinations as byte offsets into the caller's fetch buffer;
//! raw addresses never appear on the wire.

use bytes::{Buf, BufMut};
use row_store::{ArenaRef, DataLocator, RowId};

/// Upper bound on declared columns per row, as a decode sanity check.
pub const MAX_COLUMNS: usize = 1 << 20;

/// Upper bound on rows per batch descriptor, as a decode sanity check.
pub const MAX_BATCH_ROWS: usize = 1 << 24;

/// Wire decode error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    /// Need more data to complete parsing.
    #[error("incomplete")]
    Incomplete,
    /// Structurally invalid message.
    #[error("invalid message: {0}")]
    Invalid(&'static str),
}

/// Header part of an ingested row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowHeader {
    /// Row id. Ignored by services that generate their own ids.
    pub row_id: RowId,
    /// Byte size of each data column following the header.
    pub column_sizes: Vec<u64>,
}

impl RowHeader {
    /// Returns the encoded length of this header.
    pub fn encoded_len(&self) -> usize {
        8 + 4 + 8 * self.column_sizes.len()
    }

    /// Encode the header into the buffer.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i64_le(self.row_id);
        buf.put_u32_le(self.column_sizes.len() as u32);
        for &size in &self.column_sizes {
            buf.put_u64_le(size);
        }
    }

    /// Parse a header from the buffer.
    ///
    /// Returns the parsed header and the number of bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), ParseError> {
        let mut buf = data;
        if buf.remaining() < 12 {
            return Err(ParseError::Incomplete);
        }
        let row_id = buf.get_i64_le();
        let columns = buf.get_u32_le() as usize;
        if columns > MAX_COLUMNS {
            return Err(ParseError::Invalid("column count too large"));
        }
        if buf.remaining() < 8 * columns {
            return Err(ParseError::Incomplete);
        }
        let mut column_sizes = Vec::with_capacity(columns);
        for _ in 0..columns {
            column_sizes.push(buf.get_u64_le());
        }
        let consumed = data.len() - buf.remaining();
        Ok((
            Self {
                row_id,
                column_sizes,
            },
            consumed,
        ))
    }
}

/// Batch descriptor: where each requested row currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDescriptor {
    /// Connection that asked for the batch.
    pub connection_id: u64,
    /// One locator per requested row, in request order.
    pub rows: Vec<DataLocator>,
}

impl BatchDescriptor {
    /// Returns the encoded length of this descriptor.
    pub fn encoded_len(&self) -> usize {
        8 + 4
            + self
                .rows
                .iter()
                .map(|r| 8 + 4 + 8 + source_encoded_len(&r.source))
                .sum::<usize>()
    }

    /// Encode the descriptor into the buffer.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.connection_id);
        buf.put_u32_le(self.rows.len() as u32);
        for row in &self.rows {
            buf.put_i64_le(row.key);
            buf.put_u32_le(row.node_id);
            buf.put_u64_le(row.size);
            encode_source(&row.source, buf);
        }
    }

    /// Parse a descriptor from the buffer.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), ParseError> {
        let mut buf = data;
        if buf.remaining() < 12 {
            return Err(ParseError::Incomplete);
        }
        let connection_id = buf.get_u64_le();
        let count = buf.get_u32_le() as usize;
        if count > MAX_BATCH_ROWS {
            return Err(ParseError::Invalid("row count too large"));
        }
        let mut rows = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 20 {
                return Err(ParseError::Incomplete);
            }
            let key = buf.get_i64_le();
            let node_id = buf.get_u32_le();
            let size = buf.get_u64_le();
            let source = parse_source(&mut buf)?;
            rows.push(DataLocator {
                key,
                node_id,
                size,
                source,
            });
        }
        let consumed = data.len() - buf.remaining();
        Ok((
            Self {
                connection_id,
                rows,
            },
            consumed,
        ))
    }
}

/// One per-row fetch handed to a worker queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSubRequest {
    /// Row key, used for the re-read path when no source handle is present.
    pub key: RowId,
    /// Expected row size in bytes.
    pub size: u64,
    /// Pool handle when the row was memory-resident at preparation time.
    pub source: Option<ArenaRef>,
    /// Byte offset of the row's region in the destination buffer.
    pub dest_offset: u64,
}

impl FetchSubRequest {
    /// Returns the encoded length of this request.
    pub fn encoded_len(&self) -> usize {
        8 + 8 + 8 + source_encoded_len(&self.source)
    }

    /// Encode the request into the buffer.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i64_le(self.key);
        buf.put_u64_le(self.size);
        buf.put_u64_le(self.dest_offset);
        encode_source(&self.source, buf);
    }

    /// Parse a request from the buffer.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), ParseError> {
        let mut buf = data;
        if buf.remaining() < 25 {
            return Err(ParseError::Incomplete);
        }
        let key = buf.get_i64_le();
        let size = buf.get_u64_le();
        let dest_offset = buf.get_u64_le();
        let source = parse_source(&mut buf)?;
        let consumed = data.len() - buf.remaining();
        Ok((
            Self {
                key,
                size,
                source,
                dest_offset,
            },
            consumed,
        ))
    }
}

fn source_encoded_len(source: &Option<ArenaRef>) -> usize {
    match source {
        Some(_) => 1 + 4 + 8 + 8,
        None => 1,
    }
}

fn encode_source<B: BufMut>(source: &Option<ArenaRef>, buf: &mut B) {
    match source {
        Some(r) => {
            buf.put_u8(1);
            buf.put_u32_le(r.node);
            buf.put_u64_le(r.offset);
            buf.put_u64_le(r.len);
        }
        None => buf.put_u8(0),
    }
}

fn parse_source(buf: &mut &[u8]) -> Result<Option<ArenaRef>, ParseError> {
    if buf.remaining() < 1 {
        return Err(ParseError::Incomplete);
    }
    match buf.get_u8() {
        0 => Ok(None),
        1 => {
            if buf.remaining() < 20 {
                return Err(ParseError::Incomplete);
            }
            let node = buf.get_u32_le();
            let offset = buf.get_u64_le();
            let len = buf.get_u64_le();
            Ok(Some(ArenaRef { node, offset, len }))
        }
        _ => Err(ParseError::Invalid("bad source flag")),
    }
}
