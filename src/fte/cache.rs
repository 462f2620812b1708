//! Cipher and DFA cache
//!
//! DFA construction is the expensive part of FTE, so ciphers and rankers are
//! cached per `(regex, msg_len)` for the lifetime of the PFSM that owns the
//! cache (and any PFSMs cloned from it). Entries are immutable once built
//! and safe to share across threads.
//!
//! Lookup takes the map lock only long enough to fetch the entry's slot; the
//! build itself runs under the slot's own lock, so concurrent callers of the
//! same key wait for one build while other keys proceed.

use crate::error::Result;
use crate::fte::{Dfa, FteCipher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

type Key = (String, usize);
type Slot<T> = Arc<Mutex<Option<Arc<T>>>>;

/// Shared cache of ciphers and rankers, keyed by `(regex, msg_len)`
pub struct Cache {
    key_material: Vec<u8>,
    ciphers: Mutex<HashMap<Key, Slot<FteCipher>>>,
    dfas: Mutex<HashMap<Key, Slot<Dfa>>>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("ciphers", &self.ciphers.lock().len())
            .field("dfas", &self.dfas.lock().len())
            .finish()
    }
}

impl Cache {
    /// Create a cache keyed from the document UUID
    pub fn new(uuid: u32) -> Self {
        Self {
            key_material: uuid.to_be_bytes().to_vec(),
            ciphers: Mutex::new(HashMap::new()),
            dfas: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch or build the cipher for `(regex, msg_len)`
    pub fn cipher(&self, regex: &str, msg_len: usize) -> Result<Arc<FteCipher>> {
        let slot = Self::slot(&self.ciphers, regex, msg_len);
        let mut entry = slot.lock();
        if let Some(cipher) = entry.as_ref() {
            return Ok(cipher.clone());
        }
        let built = Arc::new(FteCipher::new(regex, msg_len, &self.key_material)?);
        *entry = Some(built.clone());
        Ok(built)
    }

    /// Fetch or build the bare ranker for `(regex, msg_len)`
    pub fn dfa(&self, regex: &str, msg_len: usize) -> Result<Arc<Dfa>> {
        let slot = Self::slot(&self.dfas, regex, msg_len);
        let mut entry = slot.lock();
        if let Some(dfa) = entry.as_ref() {
            return Ok(dfa.clone());
        }
        let built = Arc::new(Dfa::new(regex, msg_len)?);
        *entry = Some(built.clone());
        Ok(built)
    }

    fn slot<T>(map: &Mutex<HashMap<Key, Slot<T>>>, regex: &str, msg_len: usize) -> Slot<T> {
        map.lock()
            .entry((regex.to_string(), msg_len))
            .or_default()
            .clone()
    }
}
