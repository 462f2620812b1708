//! Plugin registry
//!
//! Process-wide mapping from `(module, method)` to a side-effect function
//! invoked from transitions. Plugins are the only place side effects happen;
//! the PFSM core never touches the wire directly.
//!
//! A plugin returns `Ok(true)` to complete its transition, `Ok(false)` to
//! signal a soft failure (not enough bytes buffered yet; the PFSM retries),
//! or an error, which the PFSM classifies as retryable or fatal.
//!
//! Built-ins register on first lookup. Registration is one-shot per key;
//! registering a duplicate is a programming error and panics.

use crate::conn::Context;
use crate::error::Result;
use crate::fsm::Fsm;
use crate::mar::Value;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::LazyLock;

pub mod channel;
pub mod fte;
pub mod io;
pub mod model;
pub mod tg;

/// A plugin in the MAR language
pub type PluginFunc = fn(&mut Fsm, &Context, &[Value]) -> Result<bool>;

const BUILTINS: &[(&str, &str, PluginFunc)] = &[
    ("channel", "bind", channel::bind),
    ("fte", "send", fte::send),
    ("fte", "send_async", fte::send_async),
    ("fte", "recv", fte::recv),
    ("fte", "recv_async", fte::recv),
    ("io", "puts", io::puts),
    ("io", "gets", io::gets),
    ("model", "sleep", model::sleep),
    ("model", "spawn", model::spawn),
    ("tg", "send", tg::send),
    ("tg", "recv", tg::recv),
];

static REGISTRY: LazyLock<RwLock<HashMap<(String, String), PluginFunc>>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    for (module, method, func) in BUILTINS {
        map.insert((module.to_string(), method.to_string()), *func);
    }
    RwLock::new(map)
});

/// Look up a plugin function by module and method
pub fn find(module: &str, method: &str) -> Option<PluginFunc> {
    REGISTRY.read().get(&(module.to_string(), method.to_string())).copied()
}

/// Add a plugin to the registry. Panics on duplicate registration.
pub fn register(module: &str, method: &str, func: PluginFunc) {
    let key = (module.to_string(), method.to_string());
    let mut map = REGISTRY.write();
    if map.contains_key(&key) {
        panic!("plugin already registered: {module}.{method}");
    }
    map.insert(key, func);
}
