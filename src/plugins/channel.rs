//! Channel plugin
//!
//! `channel.bind(name)` binds a fresh listening port and records it in the
//! variable map under `name`, so a spawned sub-protocol can resolve its
//! named port against it.

use crate::conn::Context;
use crate::error::{Error, Result};
use crate::fsm::Fsm;
use crate::mar::Value;

pub fn bind(fsm: &mut Fsm, _ctx: &Context, args: &[Value]) -> Result<bool> {
    let name = args
        .first()
        .ok_or_else(|| Error::InvalidDocument("channel.bind: missing channel name".into()))?
        .as_str()?
        .to_string();

    // Rebinding an already-bound channel is a no-op.
    if fsm.var(&name).is_some() {
        return Ok(true);
    }

    let port = fsm.listen()?;
    fsm.set_var(&name, Value::Int(port as i64));
    Ok(true)
}
