//! Format-transforming encryption
//!
//! Turns opaque ciphertext into strings matching a cover regex, and back.
//! The split between the pieces matters for cost: DFA construction and the
//! word-count table are expensive, so [`Cache`] amortises them per
//! `(regex, length)` pair across the whole PFSM lifetime, while
//! [`FteCipher`] composes the AEAD layer on top of a cached [`Dfa`].

mod cache;
mod cipher;
mod dfa;

pub use cache::Cache;
pub use cipher::{FteCipher, FTE_OVERHEAD, FTE_VERSION};
pub use dfa::Dfa;
