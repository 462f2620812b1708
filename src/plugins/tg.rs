//! Template-grammar plugins
//!
//! `tg.send(grammar)` renders one of the grammar's templates, encoding a
//! cell into the data placeholder with the DFA ranker directly (no AEAD
//! layer; the placeholder regex at a fixed length is the whole codec).
//! `tg.recv(grammar)` matches the buffered bytes against the grammar's
//! templates, ranks the captured placeholder back into cell bytes, and
//! routes the cell.
//!
//! Template choice is cosmetic and deliberately drawn from a local RNG, not
//! the shared PFSM PRNG: the receiver matches any template, and the shared
//! PRNG positions of the two parties must stay aligned.

use crate::cell::Cell;
use crate::conn::Context;
use crate::error::{Error, Result};
use crate::fsm::Fsm;
use crate::mar::Value;
use crate::CELL_HEADER_LEN;
use num_bigint::BigUint;
use rand::Rng;
use tracing::trace;

const PLACEHOLDER: &str = "%%DATA%%";

struct Grammar {
    name: &'static str,
    /// Anchored regex for the data placeholder, fed to the ranker
    placeholder_regex: &'static str,
    /// Character class the placeholder regex accepts, for template matching
    placeholder_class: &'static str,
    /// Placeholder length in covertext bytes
    msg_len: usize,
    templates: &'static [&'static str],
}

static GRAMMARS: &[Grammar] = &[
    Grammar {
        name: "http_request_keep_alive",
        placeholder_regex: "^[a-zA-Z0-9]+$",
        placeholder_class: "[a-zA-Z0-9]",
        msg_len: 128,
        templates: &[
            "GET /%%DATA%% HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\n\r\n",
            "GET /%%DATA%% HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\nConnection: keep-alive\r\n\r\n",
        ],
    },
    Grammar {
        name: "http_response_keep_alive",
        placeholder_regex: "^[a-zA-Z0-9]+$",
        placeholder_class: "[a-zA-Z0-9]",
        msg_len: 128,
        templates: &[
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nConnection: keep-alive\r\nSet-Cookie: id=%%DATA%%\r\n\r\n",
        ],
    },
];

fn lookup(args: &[Value]) -> Result<&'static Grammar> {
    let name = args
        .first()
        .ok_or_else(|| Error::InvalidDocument("tg: missing grammar argument".into()))?
        .as_str()?;
    GRAMMARS
        .iter()
        .find(|g| g.name == name)
        .ok_or_else(|| Error::GrammarNotFound(name.into()))
}

// Cell bytes carried per covertext: the ranker capacity rounded down to
// whole bytes.
fn cell_capacity(fsm: &Fsm, grammar: &Grammar) -> Result<usize> {
    let dfa = fsm.dfa(grammar.placeholder_regex, grammar.msg_len)?;
    let capacity = dfa.capacity()? / 8;
    if capacity <= CELL_HEADER_LEN {
        return Err(Error::CapacityTooSmall {
            regex: grammar.placeholder_regex.into(),
            msg_len: grammar.msg_len,
        });
    }
    Ok(capacity)
}

// Anchored matcher for one rendered template, with the placeholder as a
// named capture.
fn template_matcher(template: &str, grammar: &Grammar) -> regex::bytes::Regex {
    let escaped = regex::escape(template);
    let capture = format!("(?P<data>{}{{{}}})", grammar.placeholder_class, grammar.msg_len);
    let pattern = format!("^{}", escaped.replace(PLACEHOLDER, &capture));
    regex::bytes::Regex::new(&pattern).expect("grammar templates are valid patterns")
}

pub fn send(fsm: &mut Fsm, _ctx: &Context, args: &[Value]) -> Result<bool> {
    let grammar = lookup(args)?;
    let capacity = cell_capacity(fsm, grammar)?;
    let dfa = fsm.dfa(grammar.placeholder_regex, grammar.msg_len)?;

    let mut cell = fsm
        .stream_set()
        .dequeue(capacity - CELL_HEADER_LEN)
        .unwrap_or_else(Cell::cover);
    cell.uuid = fsm.uuid();
    cell.instance_id = fsm.instance_id();

    let plaintext = cell.encode(capacity)?;
    let covertext = dfa.unrank(&BigUint::from_bytes_be(&plaintext))?;
    let covertext = String::from_utf8(covertext)
        .map_err(|_| Error::Malformed("placeholder covertext is not ascii".into()))?;

    let template = grammar.templates[rand::rng().random_range(0..grammar.templates.len())];
    let rendered = template.replace(PLACEHOLDER, &covertext);
    fsm.conn_mut()?.write(rendered.as_bytes())?;

    trace!(
        party = %fsm.party(),
        grammar = grammar.name,
        stream = cell.stream_id,
        bytes = rendered.len(),
        "tg.send"
    );
    Ok(true)
}

pub fn recv(fsm: &mut Fsm, ctx: &Context, args: &[Value]) -> Result<bool> {
    let grammar = lookup(args)?;
    let capacity = cell_capacity(fsm, grammar)?;
    let dfa = fsm.dfa(grammar.placeholder_regex, grammar.msg_len)?;

    let buffered = fsm.conn_mut()?.peek(-1, ctx)?;
    for template in grammar.templates {
        let matcher = template_matcher(template, grammar);
        let Some(caps) = matcher.captures(&buffered) else {
            continue;
        };
        let consumed = caps.get(0).map(|m| m.end()).unwrap_or_default();
        let data = caps.name("data").map(|m| m.as_bytes()).unwrap_or_default();

        let raw = dfa.rank(data)?.to_bytes_be();
        if raw.len() > capacity {
            return Err(Error::Malformed("ranked placeholder wider than capacity".into()));
        }
        let mut plaintext = vec![0u8; capacity - raw.len()];
        plaintext.extend_from_slice(&raw);

        let (cell, _) = Cell::decode(&plaintext)?;
        if cell.uuid != fsm.uuid() {
            return Err(Error::UuidMismatch { expected: fsm.uuid(), got: cell.uuid });
        }
        if fsm.instance_id() == 0 && cell.instance_id != 0 {
            fsm.set_instance_id(cell.instance_id);
        }

        fsm.conn_mut()?.read_full(consumed, ctx)?;
        trace!(
            party = %fsm.party(),
            grammar = grammar.name,
            stream = cell.stream_id,
            consumed,
            "tg.recv"
        );
        fsm.stream_set().enqueue(cell)?;
        return Ok(true);
    }

    // No template matches yet; more bytes may still be in flight.
    Ok(false)
}
