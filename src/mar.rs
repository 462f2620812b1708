//! MAR document model
//!
//! In-memory representation of a cover-protocol description: states,
//! transitions, action blocks, and metadata. The MAR text parser is an
//! external collaborator; documents here are constructed programmatically
//! through [`DocumentBuilder`] and a small registry of built-in formats
//! feeds the CLI.
//!
//! # Determinism
//!
//! Both parties must agree on the document byte-for-byte, so the UUID is a
//! hash of the document's canonical text form. Transition selection is a
//! single weighted draw against the shared PRNG; the iteration order of
//! transitions is the declaration order and must never be shuffled.

use crate::error::{Error, Result};
use crate::fsm::Fsm;
use rand::Rng;
use rand_xoshiro::Xoshiro256StarStar;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, LazyLock};

/// Endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Party {
    /// Initiates the connection
    Client,
    /// Accepts the connection
    Server,
}

impl Party {
    /// The opposite role
    pub fn peer(&self) -> Party {
        match self {
            Party::Client => Party::Server,
            Party::Server => Party::Client,
        }
    }

    /// Role name as it appears in MAR documents
    pub fn as_str(&self) -> &'static str {
        match self {
            Party::Client => "client",
            Party::Server => "server",
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Party {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "client" => Ok(Party::Client),
            "server" => Ok(Party::Server),
            other => Err(Error::InvalidDocument(format!("unknown party: {other:?}"))),
        }
    }
}

/// Transport declared by a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

/// Transition probability: a weight in `[0, 1]`, or the `error` marker
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Probability {
    Weighted(f64),
    Error,
}

impl Probability {
    pub fn is_error(&self) -> bool {
        matches!(self, Probability::Error)
    }

    /// Weight for sampling; error transitions never participate
    pub fn weight(&self) -> f64 {
        match self {
            Probability::Weighted(p) => *p,
            Probability::Error => 0.0,
        }
    }
}

/// A single edge of the PFSM
#[derive(Debug, Clone)]
pub struct Transition {
    /// Source state name
    pub source: String,
    /// Destination state name
    pub destination: String,
    /// Action block to run, or `None` for a NULL transition
    pub action_block: Option<String>,
    /// Selection probability
    pub probability: Probability,
}

/// Evaluated action argument
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(Error::InvalidDocument(format!(
                "expected string argument, got {other:?}"
            ))),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(Error::InvalidDocument(format!(
                "expected integer argument, got {other:?}"
            ))),
        }
    }
}

/// Unevaluated action argument
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Literal string
    Str(String),
    /// Literal integer
    Int(i64),
    /// Reference into the PFSM variable map
    Var(String),
}

impl Arg {
    /// Evaluate against the PFSM variable store
    pub fn eval(&self, fsm: &Fsm) -> Result<Value> {
        match self {
            Arg::Str(s) => Ok(Value::Str(s.clone())),
            Arg::Int(v) => Ok(Value::Int(*v)),
            Arg::Var(name) => fsm
                .var(name)
                .ok_or_else(|| Error::InvalidDocument(format!("variable not set: {name:?}"))),
        }
    }
}

/// One plugin invocation inside an action block
#[derive(Debug, Clone)]
pub struct Action {
    /// Party that executes this action
    pub party: Party,
    /// Plugin module, e.g. `fte`
    pub module: String,
    /// Plugin method, e.g. `send`
    pub method: String,
    /// Arguments passed to the plugin
    pub args: Vec<Arg>,
    /// Optional guard: the action only runs if the peeked input buffer
    /// matches this pattern
    pub regex_guard: Option<String>,
}

impl Action {
    pub fn new(party: Party, module: &str, method: &str) -> Self {
        Self {
            party,
            module: module.into(),
            method: method.into(),
            args: Vec::new(),
            regex_guard: None,
        }
    }

    pub fn arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn guard(mut self, regex: &str) -> Self {
        self.regex_guard = Some(regex.into());
        self
    }

    /// Fully-qualified plugin name, `module.method`
    pub fn name(&self) -> String {
        format!("{}.{}", self.module, self.method)
    }
}

/// Named, ordered sequence of actions
#[derive(Debug, Clone)]
pub struct ActionBlock {
    pub name: String,
    pub actions: Vec<Action>,
}

/// A parsed MAR document
#[derive(Debug, Clone)]
pub struct Document {
    /// Format name
    pub name: String,
    /// Format version
    pub version: String,
    /// Hash of the canonical document text; both parties must agree
    pub uuid: u32,
    /// Declared transport
    pub transport: Transport,
    /// Port as written: a literal integer or a variable name
    pub port: String,
    /// Party that speaks first on the wire
    pub first_sender: Party,
    /// Transitions in declaration order
    pub transitions: Vec<Transition>,
    /// Action blocks in declaration order
    pub action_blocks: Vec<ActionBlock>,
}

impl Document {
    pub fn builder(name: &str, version: &str) -> DocumentBuilder {
        DocumentBuilder::new(name, version)
    }

    /// Look up an action block by name
    pub fn action_block(&self, name: &str) -> Option<&ActionBlock> {
        self.action_blocks.iter().find(|b| b.name == name)
    }

    /// Party that sends the first cell, and with it the instance ID
    pub fn first_sender(&self) -> Party {
        self.first_sender
    }

    /// Canonical text form; the UUID is a hash of this
    fn canonical(&self) -> String {
        let mut out = format!(
            "{}:{}\nconnection({}, {}):\n",
            self.name,
            self.version,
            self.transport.as_str(),
            self.port
        );
        for t in &self.transitions {
            let block = t.action_block.as_deref().unwrap_or("NULL");
            let prob = match t.probability {
                Probability::Weighted(p) => format!("{p}"),
                Probability::Error => "error".into(),
            };
            out.push_str(&format!("  {} {} {} {}\n", t.source, t.destination, block, prob));
        }
        for b in &self.action_blocks {
            out.push_str(&format!("action {}:\n", b.name));
            for a in &b.actions {
                out.push_str(&format!("  {} {}({:?})", a.party, a.name(), a.args));
                if let Some(g) = &a.regex_guard {
                    out.push_str(&format!(" if match({g})"));
                }
                out.push('\n');
            }
        }
        out
    }
}

/// Builder for programmatic document construction
#[derive(Debug)]
pub struct DocumentBuilder {
    name: String,
    version: String,
    transport: Transport,
    port: String,
    first_sender: Party,
    transitions: Vec<Transition>,
    action_blocks: Vec<ActionBlock>,
}

impl DocumentBuilder {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            transport: Transport::Tcp,
            port: "0".into(),
            first_sender: Party::Client,
            transitions: Vec::new(),
            action_blocks: Vec::new(),
        }
    }

    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn port(mut self, port: &str) -> Self {
        self.port = port.into();
        self
    }

    pub fn first_sender(mut self, party: Party) -> Self {
        self.first_sender = party;
        self
    }

    pub fn transition(
        mut self,
        source: &str,
        destination: &str,
        action_block: Option<&str>,
        probability: Probability,
    ) -> Self {
        self.transitions.push(Transition {
            source: source.into(),
            destination: destination.into(),
            action_block: action_block.map(Into::into),
            probability,
        });
        self
    }

    pub fn action_block(mut self, name: &str, actions: Vec<Action>) -> Self {
        self.action_blocks.push(ActionBlock { name: name.into(), actions });
        self
    }

    /// Validate the document and compute its UUID
    pub fn build(self) -> Result<Document> {
        let mut doc = Document {
            name: self.name,
            version: self.version,
            uuid: 0,
            transport: self.transport,
            port: self.port,
            first_sender: self.first_sender,
            transitions: self.transitions,
            action_blocks: self.action_blocks,
        };

        if !doc.transitions.iter().any(|t| t.source == "start") {
            return Err(Error::InvalidDocument("no transitions from start".into()));
        }

        // Per-source non-error probabilities must sum to 1.
        let mut sources: Vec<&str> = doc.transitions.iter().map(|t| t.source.as_str()).collect();
        sources.sort_unstable();
        sources.dedup();
        for source in sources {
            let total: f64 = doc
                .transitions
                .iter()
                .filter(|t| t.source == source && !t.probability.is_error())
                .map(|t| t.probability.weight())
                .sum();
            if (total - 1.0).abs() > 1e-6 {
                return Err(Error::InvalidDocument(format!(
                    "probabilities from {source:?} sum to {total}, expected 1"
                )));
            }
        }

        // Referenced action blocks must exist.
        for t in &doc.transitions {
            if let Some(name) = &t.action_block {
                if doc.action_block(name).is_none() {
                    return Err(Error::InvalidDocument(format!(
                        "action block not found: {name:?}"
                    )));
                }
            }
        }

        let digest = Sha256::digest(doc.canonical().as_bytes());
        doc.uuid = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) & 0x7fff_ffff;
        Ok(doc)
    }
}

// ========== Filter helpers ==========

/// Transitions leaving `source`, in declaration order
pub fn filter_transitions_by_source<'a>(
    transitions: &'a [Transition],
    source: &str,
) -> Vec<&'a Transition> {
    transitions.iter().filter(|t| t.source == source).collect()
}

/// Only `error` transitions
pub fn filter_error_transitions<'a>(transitions: &[&'a Transition]) -> Vec<&'a Transition> {
    transitions.iter().filter(|t| t.probability.is_error()).copied().collect()
}

/// Only non-`error` transitions
pub fn filter_non_error_transitions<'a>(transitions: &[&'a Transition]) -> Vec<&'a Transition> {
    transitions.iter().filter(|t| !t.probability.is_error()).copied().collect()
}

/// Weighted transition choice.
///
/// With a PRNG, performs a single weighted sample and returns a singleton;
/// without one (instance ID not yet known) all candidates are returned so
/// the caller can attempt them in order.
pub fn choose_transitions<'a>(
    transitions: Vec<&'a Transition>,
    rng: Option<&mut Xoshiro256StarStar>,
) -> Vec<&'a Transition> {
    let Some(rng) = rng else {
        return transitions;
    };
    if transitions.is_empty() {
        return transitions;
    }

    let coin: f64 = rng.random();
    let mut cumulative = 0.0;
    for t in &transitions {
        cumulative += t.probability.weight();
        if coin < cumulative {
            return vec![t];
        }
    }
    // Rounding left the coin past the last bucket.
    vec![transitions[transitions.len() - 1]]
}

/// Actions belonging to `party`, preserving order
pub fn filter_actions_by_party(actions: &[Action], party: Party) -> Vec<&Action> {
    actions.iter().filter(|a| a.party == party).collect()
}

// ========== Built-in formats ==========

static FORMATS: LazyLock<Vec<Arc<Document>>> = LazyLock::new(|| {
    vec![Arc::new(build_dummy()), Arc::new(build_http_simple())]
});

/// All built-in documents
pub fn formats() -> &'static [Arc<Document>] {
    &FORMATS
}

/// Look up a built-in document by name and optional version
pub fn format(name: &str, version: Option<&str>) -> Result<Arc<Document>> {
    FORMATS
        .iter()
        .find(|d| d.name == name && version.map_or(true, |v| d.version == v))
        .cloned()
        .ok_or_else(|| Error::FormatNotFound(name.into()))
}

/// Split a `NAME[:VERSION]` CLI argument
pub fn split_format(s: &str) -> (&str, Option<&str>) {
    match s.split_once(':') {
        Some((name, version)) => (name, Some(version)),
        None => (s, None),
    }
}

/// Generate a fresh 31-bit nonzero instance ID
pub fn generate_instance_id() -> u32 {
    rand::rng().random_range(1..=0x7fff_ffffu32)
}

const DUMMY_REGEX: &str = "^(a|b)+$";
const DUMMY_MSG_LEN: i64 = 2048;

fn fte_pair(block: &str, sender: Party) -> (String, Vec<Action>) {
    let send = Action::new(sender, "fte", "send")
        .arg(Arg::Str(DUMMY_REGEX.into()))
        .arg(Arg::Int(DUMMY_MSG_LEN));
    let recv = Action::new(sender.peer(), "fte", "recv")
        .arg(Arg::Str(DUMMY_REGEX.into()))
        .arg(Arg::Int(DUMMY_MSG_LEN));
    (block.into(), vec![send, recv])
}

/// Plain format: alternating fixed-size FTE covertexts, client first.
fn build_dummy() -> Document {
    let (up_name, up_actions) = fte_pair("upstream", Party::Client);
    let (down_name, down_actions) = fte_pair("downstream", Party::Server);
    Document::builder("dummy", "20250701")
        .port("8081")
        .first_sender(Party::Client)
        .transition("start", "uplink", Some("upstream"), Probability::Weighted(1.0))
        .transition("uplink", "downlink", Some("downstream"), Probability::Weighted(1.0))
        .transition("downlink", "uplink", Some("upstream"), Probability::Weighted(1.0))
        .action_block(&up_name, up_actions)
        .action_block(&down_name, down_actions)
        .build()
        .expect("built-in dummy format is valid")
}

/// HTTP-shaped format using template grammars, with a probabilistic
/// keep-alive loop.
fn build_http_simple() -> Document {
    let request = vec![
        Action::new(Party::Client, "tg", "send").arg(Arg::Str("http_request_keep_alive".into())),
        Action::new(Party::Server, "tg", "recv").arg(Arg::Str("http_request_keep_alive".into())),
    ];
    let response = vec![
        Action::new(Party::Server, "tg", "send").arg(Arg::Str("http_response_keep_alive".into())),
        Action::new(Party::Client, "tg", "recv").arg(Arg::Str("http_response_keep_alive".into())),
    ];
    Document::builder("http_simple", "20250701")
        .port("8082")
        .first_sender(Party::Client)
        .transition("start", "request", Some("http_request"), Probability::Weighted(1.0))
        .transition("request", "response", Some("http_response"), Probability::Weighted(1.0))
        .transition("response", "request", Some("http_request"), Probability::Weighted(0.9))
        .transition("response", "dead", None, Probability::Weighted(0.1))
        .action_block("http_request", request)
        .action_block("http_response", response)
        .build()
        .expect("built-in http_simple format is valid")
}
