//! PFSM engine
//!
//! Drives transitions over a MAR document. Both parties run the same
//! document; determinism comes from seeding the PRNG with the instance ID
//! generated by the first sender, so that at equal step counts both sample
//! identical transitions.
//!
//! A party that has not yet observed the instance ID evaluates transitions
//! without consuming PRNG draws. Upon learning the ID (from the first
//! decrypted cell) it replays all prior steps from `start` with side effects
//! disabled, aligning its step count and PRNG position with the sender.

use crate::conn::{BufferedConn, Context};
use crate::error::{Error, Result};
use crate::fte::{Cache, Dfa, FteCipher};
use crate::mar::{self, Document, Party, Value};
use crate::plugins;
use crate::stream::StreamSet;
use crate::CHANNEL_BIND_PORT_ENV;
use parking_lot::Mutex;
use rand_xoshiro::rand_core::SeedableRng;
use rand_xoshiro::Xoshiro256StarStar;
use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Terminal state name
pub const STATE_DEAD: &str = "dead";

/// Initial state name
pub const STATE_START: &str = "start";

type ListenerMap = Arc<Mutex<HashMap<u16, Arc<TcpListener>>>>;

/// Per-connection probabilistic finite-state machine
pub struct Fsm {
    doc: Arc<Document>,
    host: String,
    party: Party,
    fte_cache: Arc<Cache>,

    conn: Option<BufferedConn>,
    owned_conn: bool,
    stream_set: StreamSet,
    listeners: ListenerMap,
    owned_ports: Vec<u16>,

    state: String,
    step_n: usize,
    rng: Option<Xoshiro256StarStar>,

    vars: HashMap<String, Value>,

    /// Set by the first sender, learned by the peer from its first cell
    instance_id: u32,
}

impl std::fmt::Debug for Fsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fsm")
            .field("party", &self.party)
            .field("state", &self.state)
            .field("step_n", &self.step_n)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl Fsm {
    /// Create a new FSM. If `party` is the document's first sender, the
    /// instance ID is generated and the PRNG is seeded immediately.
    pub fn new(
        doc: Arc<Document>,
        host: &str,
        party: Party,
        conn: Option<BufferedConn>,
        stream_set: StreamSet,
    ) -> Self {
        let fte_cache = Arc::new(Cache::new(doc.uuid));
        let mut fsm = Self {
            doc,
            host: host.into(),
            party,
            fte_cache,
            conn,
            owned_conn: false,
            stream_set,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            owned_ports: Vec::new(),
            state: STATE_START.into(),
            step_n: 0,
            rng: None,
            vars: HashMap::new(),
            instance_id: 0,
        };
        fsm.init_first_sender();
        fsm
    }

    fn init_first_sender(&mut self) {
        if self.party != self.doc.first_sender() {
            return;
        }
        self.instance_id = mar::generate_instance_id();
        self.rng = Some(Xoshiro256StarStar::seed_from_u64(self.instance_id as u64));
    }

    // ========== Accessors ==========

    /// Computed MAR document UUID
    pub fn uuid(&self) -> u32 {
        self.doc.uuid
    }

    /// Instance ID for this session (0 = not yet known)
    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    /// Record the instance ID learned from the peer. The PRNG is built and
    /// prior steps replayed on the next call to [`Fsm::next`].
    pub fn set_instance_id(&mut self, id: u32) {
        self.instance_id = id;
    }

    pub fn party(&self) -> Party {
        self.party
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn doc(&self) -> &Arc<Document> {
        &self.doc
    }

    /// Current state name
    pub fn state(&self) -> &str {
        &self.state
    }

    /// True once the terminal state is reached
    pub fn dead(&self) -> bool {
        self.state == STATE_DEAD
    }

    /// Number of completed steps
    pub fn step_n(&self) -> usize {
        self.step_n
    }

    /// Resolve the document port: a literal integer, or a named variable.
    pub fn port(&self) -> Result<u16> {
        if let Ok(port) = self.doc.port.parse::<u16>() {
            return Ok(port);
        }
        match self.var(&self.doc.port) {
            Some(Value::Int(v)) if (1..=65535).contains(&v) => Ok(v as u16),
            _ => Err(Error::PortUnresolved(self.doc.port.clone())),
        }
    }

    /// Stream set shared with the dialer/listener that spawned this FSM
    pub fn stream_set(&self) -> &StreamSet {
        &self.stream_set
    }

    /// The buffered connection, once established
    pub fn conn_mut(&mut self) -> Result<&mut BufferedConn> {
        self.conn.as_mut().ok_or(Error::ConnectionClosed)
    }

    pub(crate) fn rng_mut(&mut self) -> Option<&mut Xoshiro256StarStar> {
        self.rng.as_mut()
    }

    /// Cipher from the shared cache, built on first use
    pub fn cipher(&self, regex: &str, msg_len: usize) -> Result<Arc<FteCipher>> {
        self.fte_cache.cipher(regex, msg_len)
    }

    /// Bare ranker from the shared cache, built on first use
    pub fn dfa(&self, regex: &str, msg_len: usize) -> Result<Arc<Dfa>> {
        self.fte_cache.dfa(regex, msg_len)
    }

    // ========== Variables ==========

    /// Read a variable. `model_instance_id`, `model_uuid` and `party` are
    /// virtual accessors, never stored.
    pub fn var(&self, key: &str) -> Option<Value> {
        match key {
            "model_instance_id" => Some(Value::Int(self.instance_id as i64)),
            "model_uuid" => Some(Value::Int(self.doc.uuid as i64)),
            "party" => Some(Value::Str(self.party.to_string())),
            _ => self.vars.get(key).cloned(),
        }
    }

    pub fn set_var(&mut self, key: &str, value: Value) {
        self.vars.insert(key.into(), value);
    }

    // ========== Stepping ==========

    /// Run to completion, swallowing retryable errors.
    pub fn execute(&mut self, ctx: &Context) -> Result<()> {
        self.ensure_conn(ctx)?;

        while !self.dead() {
            match self.next(ctx) {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    tracing::trace!(party = %self.party, state = %self.state, "retry transition");
                    if ctx.is_cancelled() {
                        self.reset();
                        return Err(Error::Cancelled);
                    }
                }
                Err(Error::Cancelled) => {
                    self.reset();
                    return Err(Error::Cancelled);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Move to the next state, or fail with `NoTransitions` /
    /// `RetryTransition`.
    pub fn next(&mut self, ctx: &Context) -> Result<()> {
        // Build the PRNG once the instance ID is known.
        self.init()?;

        let next_state = self.advance(ctx, true)?;
        self.step_n += 1;
        debug!(party = %self.party, from = %self.state, to = %next_state, step = self.step_n, "transition");
        self.state = next_state;
        Ok(())
    }

    // One selection round. With `eval` unset, actions are not fired; used
    // for deterministic replay.
    fn advance(&mut self, ctx: &Context, eval: bool) -> Result<String> {
        let doc = self.doc.clone();

        let all = mar::filter_transitions_by_source(&doc.transitions, &self.state);
        if all.is_empty() {
            return Err(Error::NoTransitions(self.state.clone()));
        }
        let error_transitions = mar::filter_error_transitions(&all);

        // A single weighted sample when the PRNG is available; otherwise
        // every normal transition stays a candidate.
        let normal = mar::filter_non_error_transitions(&all);
        let mut candidates = mar::choose_transitions(normal, self.rng.as_mut());
        candidates.extend(error_transitions);
        if candidates.is_empty() {
            return Err(Error::NoTransitions(self.state.clone()));
        }

        let mut soft_failure = false;
        for transition in candidates {
            // A NULL action block always succeeds.
            let Some(block_name) = &transition.action_block else {
                return Ok(transition.destination.clone());
            };

            let block = doc.action_block(block_name).ok_or_else(|| {
                Error::InvalidDocument(format!("action block not found: {block_name:?}"))
            })?;
            let actions = mar::filter_actions_by_party(&block.actions, self.party);
            if !eval || actions.is_empty() {
                return Ok(transition.destination.clone());
            }

            match self.eval_actions(ctx, &actions) {
                Ok(true) => return Ok(transition.destination.clone()),
                Ok(false) => {
                    soft_failure = true;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        if soft_failure {
            Err(Error::RetryTransition)
        } else {
            Err(Error::NoTransitions(self.state.clone()))
        }
    }

    // Fire the first action whose guard matches; its outcome is the
    // transition's outcome. No guard matching anything is a soft failure
    // (the expected bytes have not arrived yet).
    fn eval_actions(&mut self, ctx: &Context, actions: &[&mar::Action]) -> Result<bool> {
        for action in actions {
            if let Some(pattern) = &action.regex_guard {
                let re = regex::bytes::Regex::new(pattern).map_err(|e| {
                    Error::InvalidDocument(format!("bad guard regex {pattern:?}: {e}"))
                })?;
                let buffered = self.conn_mut()?.peek(-1, ctx)?;
                if !re.is_match(&buffered) {
                    continue;
                }
            }

            let plugin = plugins::find(&action.module, &action.method)
                .ok_or_else(|| Error::PluginNotFound(action.name()))?;
            let args = action
                .args
                .iter()
                .map(|a| a.eval(self))
                .collect::<Result<Vec<Value>>>()?;
            return plugin(self, ctx, &args);
        }
        Ok(false)
    }

    // Build the PRNG once an instance ID is available, then replay all
    // prior steps without side effects to align the PRNG position.
    fn init(&mut self) -> Result<()> {
        if self.rng.is_some() || self.instance_id == 0 {
            return Ok(());
        }

        self.rng = Some(Xoshiro256StarStar::seed_from_u64(self.instance_id as u64));
        debug!(
            party = %self.party,
            instance_id = self.instance_id,
            steps = self.step_n,
            "instance id learned, replaying"
        );

        self.state = STATE_START.into();
        let ctx = Context::new();
        for _ in 0..self.step_n {
            self.state = self.advance(&ctx, false)?;
        }
        Ok(())
    }

    // ========== Lifecycle ==========

    /// Restart the FSM so it can be reused, releasing scoped resources in
    /// reverse order of acquisition.
    pub fn reset(&mut self) {
        self.state = STATE_START.into();
        self.vars.clear();

        let mut listeners = self.listeners.lock();
        for port in self.owned_ports.drain(..).rev() {
            listeners.remove(&port);
        }
        drop(listeners);

        if self.owned_conn {
            if let Some(mut conn) = self.conn.take() {
                if let Err(e) = conn.close() {
                    debug!(party = %self.party, error = %e, "close error");
                }
            }
            self.owned_conn = false;
        }
    }

    /// Sibling FSM over a different document, sharing the cipher cache,
    /// stream set and listener map; fresh state, step counter and PRNG.
    /// Used by plugins that spawn a sub-protocol.
    pub fn clone_with(&self, doc: Arc<Document>) -> Fsm {
        let mut other = Fsm {
            doc,
            host: self.host.clone(),
            party: self.party,
            fte_cache: self.fte_cache.clone(),
            conn: None,
            owned_conn: false,
            stream_set: self.stream_set.clone(),
            listeners: self.listeners.clone(),
            owned_ports: Vec::new(),
            state: STATE_START.into(),
            step_n: 0,
            rng: None,
            vars: self.vars.clone(),
            instance_id: 0,
        };
        other.init_first_sender();
        other
    }

    // ========== Networking ==========

    /// Bind a fresh listener on this FSM's host and register it in the
    /// shared listener map. `MARIONETTE_CHANNEL_BIND_PORT` overrides the
    /// ephemeral port.
    pub fn listen(&mut self) -> Result<u16> {
        let addr = match std::env::var(CHANNEL_BIND_PORT_ENV) {
            Ok(port) if !port.is_empty() => format!("{}:{}", self.host, port),
            _ => format!("{}:0", self.host),
        };

        let listener = TcpListener::bind(&addr).map_err(|e| Error::Io(e.to_string()))?;
        let port = listener.local_addr().map_err(|e| Error::Io(e.to_string()))?.port();
        listener.set_nonblocking(true).map_err(|e| Error::Io(e.to_string()))?;

        debug!(party = %self.party, port, "listener bound");
        self.listeners.lock().insert(port, Arc::new(listener));
        self.owned_ports.push(port);
        Ok(port)
    }

    // Establish the connection on first Execute. This happens when an FSM
    // is spawned rather than handed a connection.
    fn ensure_conn(&mut self, ctx: &Context) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        match self.party {
            Party::Client => self.ensure_client_conn(ctx),
            Party::Server => self.ensure_server_conn(ctx),
        }
    }

    fn ensure_client_conn(&mut self, _ctx: &Context) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port()?);
        debug!(party = %self.party, addr = %addr, "dialing");
        let sock = TcpStream::connect(&addr)?;
        self.conn = Some(BufferedConn::new(sock));
        self.owned_conn = true;
        Ok(())
    }

    fn ensure_server_conn(&mut self, ctx: &Context) -> Result<()> {
        let port = self.port()?;
        let listener = self
            .listeners
            .lock()
            .get(&port)
            .cloned()
            .ok_or_else(|| Error::Io(format!("no listener on port {port}")))?;

        loop {
            ctx.check()?;
            match listener.accept() {
                Ok((sock, peer)) => {
                    debug!(party = %self.party, peer = %peer, "accepted");
                    sock.set_nonblocking(false).map_err(|e| Error::Io(e.to_string()))?;
                    self.conn = Some(BufferedConn::new(sock));
                    self.owned_conn = true;
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::pipe;
    use crate::mar::{Document, Probability};

    fn null_doc() -> Arc<Document> {
        Arc::new(
            Document::builder("null", "1")
                .port("8079")
                .transition("start", "dead", None, Probability::Weighted(1.0))
                .build()
                .unwrap(),
        )
    }

    // A branching ring with no terminal state, NULL blocks only.
    fn ring_doc() -> Arc<Document> {
        Arc::new(
            Document::builder("ring", "1")
                .port("8079")
                .transition("start", "n1", None, Probability::Weighted(1.0))
                .transition("n1", "n2", None, Probability::Weighted(0.5))
                .transition("n1", "n3", None, Probability::Weighted(0.5))
                .transition("n2", "n1", None, Probability::Weighted(0.3))
                .transition("n2", "n3", None, Probability::Weighted(0.7))
                .transition("n3", "n1", None, Probability::Weighted(0.6))
                .transition("n3", "n2", None, Probability::Weighted(0.4))
                .build()
                .unwrap(),
        )
    }

    // Returns the peer half alongside the FSM so it stays open for the
    // duration of the test.
    fn piped_fsm(doc: Arc<Document>, party: Party) -> (Fsm, crate::conn::Pipe) {
        let (local, remote) = pipe();
        let fsm = Fsm::new(doc, "127.0.0.1", party, Some(BufferedConn::new(local)), StreamSet::new());
        (fsm, remote)
    }

    #[test]
    fn test_minimal_document_executes_to_dead() {
        let ctx = Context::new();
        let (mut fsm, _peer) = piped_fsm(null_doc(), Party::Client);
        fsm.execute(&ctx).unwrap();
        assert!(fsm.dead());
        assert_eq!(fsm.step_n(), 1);
    }

    #[test]
    fn test_first_sender_has_instance_id() {
        let (fsm, _peer) = piped_fsm(null_doc(), Party::Client);
        assert!(fsm.instance_id() >= 1);
        assert!(fsm.instance_id() <= 0x7fff_ffff);

        let (fsm, _peer) = piped_fsm(null_doc(), Party::Server);
        assert_eq!(fsm.instance_id(), 0);
    }

    #[test]
    fn test_no_transitions_is_fatal() {
        let doc = Arc::new(
            Document::builder("stub", "1")
                .port("8079")
                .transition("start", "limbo", None, Probability::Weighted(1.0))
                .build()
                .unwrap(),
        );
        let ctx = Context::new();
        let (mut fsm, _peer) = piped_fsm(doc, Party::Client);
        fsm.next(&ctx).unwrap();
        assert_eq!(fsm.state(), "limbo");
        assert!(matches!(fsm.next(&ctx), Err(Error::NoTransitions(_))));
    }

    #[test]
    fn test_plugin_not_found_is_fatal() {
        let doc = Arc::new(
            Document::builder("stub", "1")
                .port("8079")
                .transition("start", "dead", Some("blk"), Probability::Weighted(1.0))
                .action_block(
                    "blk",
                    vec![mar::Action::new(Party::Client, "nope", "nothing")],
                )
                .build()
                .unwrap(),
        );
        let ctx = Context::new();

        // The server has no actions in the block, so it advances...
        let (mut server, _peer) = piped_fsm(doc.clone(), Party::Server);
        server.next(&ctx).unwrap();
        assert!(server.dead());

        // ...while the client hits the unregistered plugin.
        let (mut client, _peer2) = piped_fsm(doc, Party::Client);
        assert!(matches!(client.next(&ctx), Err(Error::PluginNotFound(_))));
    }

    #[test]
    fn test_same_seed_same_walk() {
        let ctx = Context::new();
        let doc = ring_doc();

        // Server party: no auto-generated ID, inject the same seed into both.
        let (mut a, _peer_a) = piped_fsm(doc.clone(), Party::Server);
        let (mut b, _peer_b) = piped_fsm(doc, Party::Server);
        a.set_instance_id(777);
        b.set_instance_id(777);

        for _ in 0..64 {
            a.next(&ctx).unwrap();
            b.next(&ctx).unwrap();
            assert_eq!(a.state(), b.state());
        }
    }

    #[test]
    fn test_replay_convergence() {
        let ctx = Context::new();
        let doc = ring_doc();

        // Reference peer knows the ID from step 0.
        let (mut reference, _peer_a) = piped_fsm(doc.clone(), Party::Server);
        reference.set_instance_id(4242);

        // Late peer steps blind, then learns the ID.
        let (mut late, _peer_b) = piped_fsm(doc, Party::Server);
        let k = 5;
        for _ in 0..k {
            late.next(&ctx).unwrap();
        }
        late.set_instance_id(4242);

        for _ in 0..k {
            reference.next(&ctx).unwrap();
        }

        // The next step triggers the replay; from here the walks agree.
        for _ in 0..32 {
            reference.next(&ctx).unwrap();
            late.next(&ctx).unwrap();
            assert_eq!(reference.state(), late.state());
        }
        assert_eq!(reference.step_n(), late.step_n());
    }

    #[test]
    fn test_virtual_variables() {
        let (mut fsm, _peer) = piped_fsm(null_doc(), Party::Client);
        assert_eq!(fsm.var("party"), Some(Value::Str("client".into())));
        assert_eq!(fsm.var("model_uuid"), Some(Value::Int(fsm.uuid() as i64)));
        assert_eq!(
            fsm.var("model_instance_id"),
            Some(Value::Int(fsm.instance_id() as i64))
        );
        assert_eq!(fsm.var("missing"), None);

        fsm.set_var("x", Value::Int(9));
        assert_eq!(fsm.var("x"), Some(Value::Int(9)));
    }

    #[test]
    fn test_port_resolution() {
        let (fsm, _peer) = piped_fsm(null_doc(), Party::Client);
        assert_eq!(fsm.port().unwrap(), 8079);

        let doc = Arc::new(
            Document::builder("named", "1")
                .port("ftp_data_port")
                .transition("start", "dead", None, Probability::Weighted(1.0))
                .build()
                .unwrap(),
        );
        let (mut named, _peer2) = piped_fsm(doc, Party::Client);
        assert!(matches!(named.port(), Err(Error::PortUnresolved(_))));

        named.set_var("ftp_data_port", Value::Int(6060));
        assert_eq!(named.port().unwrap(), 6060);
    }

    #[test]
    fn test_arg_evaluation() {
        use crate::mar::{Arg, Value};

        let (mut fsm, _peer) = piped_fsm(null_doc(), Party::Client);
        fsm.set_var("msg_len", Value::Int(512));

        assert_eq!(Arg::Int(4).eval(&fsm).unwrap(), Value::Int(4));
        assert_eq!(Arg::Str("^a+$".into()).eval(&fsm).unwrap(), Value::Str("^a+$".into()));
        assert_eq!(Arg::Var("msg_len".into()).eval(&fsm).unwrap(), Value::Int(512));
        assert_eq!(
            Arg::Var("party".into()).eval(&fsm).unwrap(),
            Value::Str("client".into())
        );
        assert!(Arg::Var("missing".into()).eval(&fsm).is_err());
    }

    #[test]
    fn test_reset_clears_state_and_vars() {
        let ctx = Context::new();
        let (mut fsm, _peer) = piped_fsm(null_doc(), Party::Client);
        fsm.set_var("k", Value::Str("v".into()));
        fsm.next(&ctx).unwrap();
        assert!(fsm.dead());

        fsm.reset();
        assert_eq!(fsm.state(), STATE_START);
        assert_eq!(fsm.var("k"), None);
    }

    #[test]
    fn test_clone_shares_cache_but_not_state() {
        let ctx = Context::new();
        let (mut fsm, _peer) = piped_fsm(ring_doc(), Party::Server);
        fsm.set_instance_id(1);
        fsm.set_var("shared", Value::Int(3));
        fsm.next(&ctx).unwrap();

        let sibling = fsm.clone_with(null_doc());
        assert_eq!(sibling.state(), STATE_START);
        assert_eq!(sibling.step_n(), 0);
        assert_eq!(sibling.var("shared"), Some(Value::Int(3)));
        // The sibling is not the null doc's first sender: fresh session, no seed.
        assert_eq!(sibling.instance_id(), 0);
    }
}
