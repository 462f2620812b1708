//! Marionette: programmable traffic shaping
//!
//! A client/server proxy core that disguises arbitrary TCP traffic as a
//! chosen cover protocol by driving a per-connection probabilistic
//! finite-state machine (PFSM) whose transitions emit and consume bytes
//! shaped to match a regular language.
//!
//! # Architecture
//!
//! The engine is built out of several layers:
//!
//! 1. **Ranker Layer** - bijective map between integers and strings of a
//!    regular language, via DFA counting
//! 2. **FTE Layer** - format-transforming encryption: AEAD ciphertext
//!    re-encoded as a ranked string of the cover regex
//! 3. **Cell Layer** - typed, sequenced, stream-bearing records padded to a
//!    per-transition target size
//! 4. **Stream Layer** - multiplexed TCP streams reassembled by sequence
//!    number over one underlying connection
//! 5. **PFSM Layer** - deterministic transition engine driven by a MAR
//!    document and a shared instance-ID seed
//!
//! # Key Concepts
//!
//! - **Document**: parsed description of a cover protocol (states,
//!   transitions, action blocks)
//! - **Cell**: the unit of application data framed on the wire
//! - **Covertext**: a length-`n` string in the cover regex carrying one
//!   encrypted cell
//! - **Instance ID**: 31-bit per-session seed generated by the first sender,
//!   synchronising the two parties' PRNGs
//! - **Party**: endpoint role; both parties execute the same document but
//!   evaluate only actions tagged with their own party
//!
//! # Example
//!
//! ```ignore
//! use marionette::prelude::*;
//!
//! let doc = marionette::mar::format("dummy", None)?;
//! let streams = StreamSet::new();
//! let dialer = Dialer::new(doc, "127.0.0.1", streams.clone())?;
//!
//! // Each local connection becomes one multiplexed stream.
//! let stream = dialer.dial();
//! stream.write(b"GET / HTTP/1.1\r\n\r\n")?;
//! ```

pub mod cell;
pub mod config;
pub mod conn;
pub mod dialer;
pub mod error;
pub mod fsm;
pub mod fte;
pub mod listener;
pub mod mar;
pub mod plugins;
pub mod proxy;
pub mod stream;

pub use cell::{Cell, CellType};
pub use config::Config;
pub use conn::{BufferedConn, Context};
pub use dialer::Dialer;
pub use error::{Error, Result};
pub use fsm::Fsm;
pub use listener::Listener;
pub use mar::{Document, Party};
pub use proxy::{ClientProxy, ServerProxy};
pub use stream::{Stream, StreamSet};

/// Prelude for common imports
pub mod prelude {
    pub use crate::{
        BufferedConn, Cell, CellType, ClientProxy, Config, Context, Dialer, Document, Error, Fsm,
        Listener, Party, Result, ServerProxy, Stream, StreamSet,
    };
}

/// Maximum serialised cell size accepted on the wire
pub const MAX_CELL_LENGTH: usize = 32768;

/// Serialised cell header size (six u32 fields plus one type byte)
pub const CELL_HEADER_LEN: usize = 25;

/// Environment variable overriding the ephemeral port used by `channel.bind`
pub const CHANNEL_BIND_PORT_ENV: &str = "MARIONETTE_CHANNEL_BIND_PORT";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(CELL_HEADER_LEN, 4 * 6 + 1);
        assert!(MAX_CELL_LENGTH > CELL_HEADER_LEN);
    }
}
