//! Literal byte-string plugins
//!
//! `io.puts(literal)` writes a fixed byte string; `io.gets(literal)`
//! consumes the same, soft-failing until enough bytes are buffered and
//! failing hard if the wire carries something else.

use crate::conn::Context;
use crate::error::{Error, Result};
use crate::fsm::Fsm;
use crate::mar::Value;

pub fn puts(fsm: &mut Fsm, _ctx: &Context, args: &[Value]) -> Result<bool> {
    let data = args
        .first()
        .ok_or_else(|| Error::InvalidDocument("io.puts: missing argument".into()))?
        .as_str()?
        .to_string();
    fsm.conn_mut()?.write(data.as_bytes())?;
    Ok(true)
}

pub fn gets(fsm: &mut Fsm, ctx: &Context, args: &[Value]) -> Result<bool> {
    let expected = args
        .first()
        .ok_or_else(|| Error::InvalidDocument("io.gets: missing argument".into()))?
        .as_str()?
        .as_bytes()
        .to_vec();

    let buffered = fsm.conn_mut()?.peek(-1, ctx)?;
    if buffered.len() < expected.len() {
        return Ok(false);
    }
    if !buffered.starts_with(&expected) {
        return Err(Error::Malformed("unexpected bytes on wire".into()));
    }
    fsm.conn_mut()?.read_full(expected.len(), ctx)?;
    Ok(true)
}
