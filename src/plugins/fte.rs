//! FTE send/recv plugins
//!
//! `fte.send(regex, msg_len)` frames one cell from the stream set, encrypts
//! it, and writes the covertext. `fte.recv(regex, msg_len)` does the
//! inverse, reporting a soft failure until a full covertext is buffered.

use crate::cell::Cell;
use crate::conn::Context;
use crate::error::{Error, Result};
use crate::fsm::Fsm;
use crate::mar::Value;
use crate::CELL_HEADER_LEN;
use tracing::trace;

fn parse_args(args: &[Value]) -> Result<(String, usize)> {
    let regex = args
        .first()
        .ok_or_else(|| Error::InvalidDocument("fte: missing regex argument".into()))?
        .as_str()?
        .to_string();
    let msg_len = args
        .get(1)
        .ok_or_else(|| Error::InvalidDocument("fte: missing msg_len argument".into()))?
        .as_int()?;
    if msg_len <= 0 {
        return Err(Error::InvalidDocument(format!("fte: bad msg_len {msg_len}")));
    }
    Ok((regex, msg_len as usize))
}

/// `fte.send`: always emits a covertext; an empty cover cell stands in
/// when no stream has data, preserving the traffic shape.
pub fn send(fsm: &mut Fsm, ctx: &Context, args: &[Value]) -> Result<bool> {
    send_inner(fsm, ctx, args, true)
}

/// `fte.send_async`: emits only when a stream has data queued.
pub fn send_async(fsm: &mut Fsm, ctx: &Context, args: &[Value]) -> Result<bool> {
    send_inner(fsm, ctx, args, false)
}

fn send_inner(fsm: &mut Fsm, _ctx: &Context, args: &[Value], cover: bool) -> Result<bool> {
    let (regex, msg_len) = parse_args(args)?;
    let cipher = fsm.cipher(&regex, msg_len)?;

    let capacity = cipher.capacity();
    if capacity <= CELL_HEADER_LEN {
        return Err(Error::CapacityTooSmall { regex, msg_len });
    }

    let mut cell = match fsm.stream_set().dequeue(capacity - CELL_HEADER_LEN) {
        Some(cell) => cell,
        None if cover => Cell::cover(),
        None => return Ok(true),
    };
    cell.uuid = fsm.uuid();
    cell.instance_id = fsm.instance_id();

    let plaintext = cell.encode(capacity)?;
    let covertext = cipher.encrypt(&plaintext)?;
    fsm.conn_mut()?.write(&covertext)?;

    trace!(
        party = %fsm.party(),
        stream = cell.stream_id,
        seq = cell.sequence_id,
        payload = cell.payload.len(),
        covertext = covertext.len(),
        "fte.send"
    );
    Ok(true)
}

/// `fte.recv`: decrypts one covertext into one cell and routes it to its
/// stream. Soft-fails until `msg_len` bytes are buffered.
pub fn recv(fsm: &mut Fsm, ctx: &Context, args: &[Value]) -> Result<bool> {
    let (regex, msg_len) = parse_args(args)?;
    let cipher = fsm.cipher(&regex, msg_len)?;

    let buffered = fsm.conn_mut()?.peek(-1, ctx)?;
    if buffered.len() < msg_len {
        return Ok(false);
    }

    let (plaintext, _remainder) = cipher.decrypt(&buffered)?;
    fsm.conn_mut()?.read_full(msg_len, ctx)?;

    let (cell, _) = Cell::decode(&plaintext)?;
    if cell.uuid != fsm.uuid() {
        return Err(Error::UuidMismatch { expected: fsm.uuid(), got: cell.uuid });
    }
    if fsm.instance_id() == 0 && cell.instance_id != 0 {
        fsm.set_instance_id(cell.instance_id);
    }

    trace!(
        party = %fsm.party(),
        stream = cell.stream_id,
        seq = cell.sequence_id,
        payload = cell.payload.len(),
        "fte.recv"
    );
    fsm.stream_set().enqueue(cell)?;
    Ok(true)
}
