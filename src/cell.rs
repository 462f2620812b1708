//! Cell codec
//!
//! Typed, sequenced, stream-bearing records framed on the wire.
//!
//! # Cell Format
//!
//! ```text
//! +----------+-------------+----------+--------+--------+------------+---------+---------+---------+
//! | Total(4) | PayloadLen(4) | Stream(4) | Seq(4) | UUID(4) | Instance(4) | Type(1) | Payload | Padding |
//! +----------+-------------+----------+--------+--------+------------+---------+---------+---------+
//! |<------------------------------- Total bytes, big-endian ------------------------------------->|
//! ```
//!
//! `Total` covers the entire record. Padding is zero bytes sized so that the
//! record hits the target size chosen by the caller, typically the FTE
//! plaintext capacity of the current transition. A cell is self-describing:
//! a truncated read is always detectable from the leading length field.

use crate::error::{Error, Result};
use crate::{CELL_HEADER_LEN, MAX_CELL_LENGTH};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Cell types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellType {
    /// Carries stream payload (possibly empty, as cover traffic)
    Normal = 1,
    /// Half-closes the stream it is sent on
    EndOfStream = 2,
}

impl TryFrom<u8> for CellType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(CellType::Normal),
            2 => Ok(CellType::EndOfStream),
            _ => Err(Error::BadFrame(format!("unknown cell type: {value}"))),
        }
    }
}

/// A marionette cell
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    /// Cell type
    pub cell_type: CellType,
    /// Stream ID (0 = control; no stream attached)
    pub stream_id: u32,
    /// Monotonic within a stream, starting at 1
    pub sequence_id: u32,
    /// Document UUID of the sender
    pub uuid: u32,
    /// Instance ID of the session; carries the seed to the peer
    pub instance_id: u32,
    /// Payload data
    pub payload: Bytes,
}

impl Cell {
    /// Create a new cell
    pub fn new(cell_type: CellType, stream_id: u32, sequence_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            cell_type,
            stream_id,
            sequence_id,
            uuid: 0,
            instance_id: 0,
            payload: payload.into(),
        }
    }

    /// Empty cover cell on the control stream
    pub fn cover() -> Self {
        Self::new(CellType::Normal, 0, 0, Bytes::new())
    }

    /// Check if this cell carries no application data
    pub fn is_cover(&self) -> bool {
        self.stream_id == 0
    }

    /// Encode to exactly `target_size` bytes, zero-padding after the payload
    pub fn encode(&self, target_size: usize) -> Result<Bytes> {
        let need = CELL_HEADER_LEN + self.payload.len();
        if need > target_size {
            return Err(Error::PayloadTooLarge(
                self.payload.len(),
                target_size.saturating_sub(CELL_HEADER_LEN),
            ));
        }
        if target_size > MAX_CELL_LENGTH {
            return Err(Error::BadFrame(format!("cell size {target_size} exceeds maximum")));
        }

        let mut buf = BytesMut::with_capacity(target_size);
        buf.put_u32(target_size as u32);
        buf.put_u32(self.payload.len() as u32);
        buf.put_u32(self.stream_id);
        buf.put_u32(self.sequence_id);
        buf.put_u32(self.uuid);
        buf.put_u32(self.instance_id);
        buf.put_u8(self.cell_type as u8);
        buf.put_slice(&self.payload);
        buf.put_bytes(0, target_size - need);

        Ok(buf.freeze())
    }

    /// Decode one cell from the front of `data`.
    ///
    /// Returns the cell and the number of bytes consumed. Trailing bytes are
    /// left for the caller.
    pub fn decode(data: &[u8]) -> Result<(Cell, usize)> {
        if data.len() < 4 {
            return Err(Error::ShortRead);
        }

        let total = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if total < CELL_HEADER_LEN || total > MAX_CELL_LENGTH {
            return Err(Error::BadFrame(format!("total length {total} out of bounds")));
        }
        if data.len() < total {
            return Err(Error::ShortRead);
        }

        let mut buf = &data[4..total];
        let payload_len = buf.get_u32() as usize;
        if payload_len > total - CELL_HEADER_LEN {
            return Err(Error::BadFrame(format!(
                "payload length {payload_len} exceeds record size {total}"
            )));
        }
        let stream_id = buf.get_u32();
        let sequence_id = buf.get_u32();
        let uuid = buf.get_u32();
        let instance_id = buf.get_u32();
        let cell_type = CellType::try_from(buf.get_u8())?;
        let payload = Bytes::copy_from_slice(&buf[..payload_len]);

        Ok((
            Cell { cell_type, stream_id, sequence_id, uuid, instance_id, payload },
            total,
        ))
    }
}
