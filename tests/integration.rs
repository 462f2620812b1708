//! End-to-end scenarios: cipher round-trips, PFSM sessions over in-memory
//! pipes, and a full client/server exchange over loopback TCP.

use marionette::conn::{pipe, BufferedConn, Context};
use marionette::fte::{Cache, FteCipher};
use marionette::mar::{Action, Arg, Document, Party, Probability};
use marionette::{Cell, CellType, ClientProxy, Dialer, Error, Fsm, Listener, StreamSet};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

const COVER_REGEX: &str = "^(a|b|c)+$";
const COVER_LEN: usize = 512;

fn fte_doc(port: &str) -> Arc<Document> {
    let request = vec![
        Action::new(Party::Client, "fte", "send")
            .arg(Arg::Str(COVER_REGEX.into()))
            .arg(Arg::Int(COVER_LEN as i64)),
        Action::new(Party::Server, "fte", "recv")
            .arg(Arg::Str(COVER_REGEX.into()))
            .arg(Arg::Int(COVER_LEN as i64)),
    ];
    let response = vec![
        Action::new(Party::Server, "fte", "send")
            .arg(Arg::Str(COVER_REGEX.into()))
            .arg(Arg::Int(COVER_LEN as i64)),
        Action::new(Party::Client, "fte", "recv")
            .arg(Arg::Str(COVER_REGEX.into()))
            .arg(Arg::Int(COVER_LEN as i64)),
    ];
    Arc::new(
        Document::builder("fte_pair", "1")
            .port(port)
            .first_sender(Party::Client)
            .transition("start", "reply", Some("request"), Probability::Weighted(1.0))
            .transition("reply", "dead", Some("response"), Probability::Weighted(1.0))
            .action_block("request", request)
            .action_block("response", response)
            .build()
            .unwrap(),
    )
}

// ========== Cipher ==========

#[test]
fn cipher_round_trip() {
    let cipher = FteCipher::new(COVER_REGEX, COVER_LEN, b"key").unwrap();

    let covertext = cipher.encrypt(b"test").unwrap();
    let (plaintext, remainder) = cipher.decrypt(&covertext).unwrap();
    assert_eq!(plaintext, b"test");
    assert!(remainder.is_empty());

    let covertext = cipher.encrypt(b"foo bar").unwrap();
    let (plaintext, remainder) = cipher.decrypt(&covertext).unwrap();
    assert_eq!(plaintext, b"foo bar");
    assert!(remainder.is_empty());
}

#[test]
fn ranker_counts() {
    let cache = Cache::new(1);
    let dfa = cache.dfa("^(a|b)+$", 3).unwrap();

    assert_eq!(dfa.num_words_in_slice(3).unwrap(), 8u32.into());
    assert_eq!(dfa.unrank(&0u32.into()).unwrap(), b"aaa");
    assert_eq!(dfa.unrank(&7u32.into()).unwrap(), b"bbb");
    assert!(matches!(dfa.unrank(&8u32.into()), Err(Error::RankOutOfRange)));
}

// ========== PFSM over in-memory pipes ==========

#[test]
fn minimal_document_executes_in_one_step() {
    let doc = Arc::new(
        Document::builder("minimal", "1")
            .port("8079")
            .transition("start", "dead", None, Probability::Weighted(1.0))
            .build()
            .unwrap(),
    );

    let (local, _peer) = pipe();
    let ctx = Context::new();
    let mut fsm = Fsm::new(doc, "127.0.0.1", Party::Client, Some(BufferedConn::new(local)), StreamSet::new());
    fsm.execute(&ctx).unwrap();
    assert!(fsm.dead());
    assert_eq!(fsm.step_n(), 1);
}

#[test]
fn puts_plugin_writes_to_the_wire() {
    let doc = Arc::new(
        Document::builder("hello", "1")
            .port("8079")
            .transition("start", "s1", Some("greet"), Probability::Weighted(1.0))
            .transition("s1", "dead", None, Probability::Weighted(1.0))
            .action_block(
                "greet",
                vec![Action::new(Party::Client, "io", "puts").arg(Arg::Str("HELLO".into()))],
            )
            .build()
            .unwrap(),
    );

    let (local, mut peer) = pipe();
    let ctx = Context::new();
    let mut fsm = Fsm::new(doc, "127.0.0.1", Party::Client, Some(BufferedConn::new(local)), StreamSet::new());
    fsm.execute(&ctx).unwrap();
    assert!(fsm.dead());

    let mut buf = [0u8; 5];
    peer.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"HELLO");
}

#[test]
fn recv_retries_until_covertext_complete() {
    let recv_only = Arc::new(
        Document::builder("recv_only", "1")
            .port("8079")
            .transition("start", "dead", Some("take"), Probability::Weighted(1.0))
            .action_block(
                "take",
                vec![Action::new(Party::Server, "fte", "recv")
                    .arg(Arg::Str(COVER_REGEX.into()))
                    .arg(Arg::Int(COVER_LEN as i64))],
            )
            .build()
            .unwrap(),
    );

    let (local, mut peer) = pipe();
    let ctx = Context::new();
    let mut fsm = Fsm::new(
        recv_only.clone(),
        "127.0.0.1",
        Party::Server,
        Some(BufferedConn::new(local)),
        StreamSet::new(),
    );

    // Encrypt one cell the way the sending party would.
    let cipher = FteCipher::new(COVER_REGEX, COVER_LEN, &recv_only.uuid.to_be_bytes()).unwrap();
    let mut cell = Cell::new(CellType::Normal, 0, 0, Vec::new());
    cell.uuid = recv_only.uuid;
    cell.instance_id = 777;
    let plaintext = cell.encode(cipher.capacity()).unwrap();
    let covertext = cipher.encrypt(&plaintext).unwrap();

    // A covertext prefix is not enough: the transition soft-fails.
    peer.write_all(&covertext[..100]).unwrap();
    assert!(matches!(fsm.next(&ctx), Err(Error::RetryTransition)));
    assert_eq!(fsm.state(), "start");

    // Once the rest arrives, the same transition succeeds and the
    // receiver learns the instance ID from the cell.
    peer.write_all(&covertext[100..]).unwrap();
    fsm.next(&ctx).unwrap();
    assert!(fsm.dead());
    assert_eq!(fsm.instance_id(), 777);
}

#[test]
fn regex_guard_selects_action() {
    // FTP-style dispatch: two guarded actions in one block, and the wire
    // decides which one runs.
    let doc = Arc::new(
        Document::builder("guarded", "1")
            .port("8079")
            .transition("start", "dead", Some("dispatch"), Probability::Weighted(1.0))
            .action_block(
                "dispatch",
                vec![
                    Action::new(Party::Client, "io", "gets")
                        .arg(Arg::Str("HELLO".into()))
                        .guard("^HELLO"),
                    Action::new(Party::Client, "io", "gets")
                        .arg(Arg::Str("WORLD".into()))
                        .guard("^WORLD"),
                ],
            )
            .build()
            .unwrap(),
    );

    let (local, mut peer) = pipe();
    let ctx = Context::new();
    let mut fsm = Fsm::new(doc, "127.0.0.1", Party::Client, Some(BufferedConn::new(local)), StreamSet::new());

    peer.write_all(b"WORLD").unwrap();
    fsm.next(&ctx).unwrap();
    assert!(fsm.dead());
}

#[test]
fn channel_bind_records_port_variable() {
    let doc = Arc::new(
        Document::builder("bind", "1")
            .port("8079")
            .transition("start", "dead", Some("setup"), Probability::Weighted(1.0))
            .action_block(
                "setup",
                vec![Action::new(Party::Server, "channel", "bind").arg(Arg::Str("chan".into()))],
            )
            .build()
            .unwrap(),
    );

    let (local, _peer) = pipe();
    let ctx = Context::new();
    let mut fsm = Fsm::new(doc, "127.0.0.1", Party::Server, Some(BufferedConn::new(local)), StreamSet::new());
    fsm.next(&ctx).unwrap();
    assert!(fsm.dead());

    match fsm.var("chan") {
        Some(marionette::mar::Value::Int(port)) => assert!(port > 0),
        other => panic!("channel variable not set: {other:?}"),
    }
}

#[test]
fn uuid_mismatch_is_fatal() {
    let recv_only = Arc::new(
        Document::builder("recv_only", "1")
            .port("8079")
            .transition("start", "dead", Some("take"), Probability::Weighted(1.0))
            .action_block(
                "take",
                vec![Action::new(Party::Server, "fte", "recv")
                    .arg(Arg::Str(COVER_REGEX.into()))
                    .arg(Arg::Int(COVER_LEN as i64))],
            )
            .build()
            .unwrap(),
    );

    let (local, mut peer) = pipe();
    let ctx = Context::new();
    let mut fsm = Fsm::new(
        recv_only.clone(),
        "127.0.0.1",
        Party::Server,
        Some(BufferedConn::new(local)),
        StreamSet::new(),
    );

    // Same key, wrong document UUID stamped into the cell.
    let cipher = FteCipher::new(COVER_REGEX, COVER_LEN, &recv_only.uuid.to_be_bytes()).unwrap();
    let mut cell = Cell::new(CellType::Normal, 0, 0, Vec::new());
    cell.uuid = recv_only.uuid ^ 0x1234;
    cell.instance_id = 5;
    let plaintext = cell.encode(cipher.capacity()).unwrap();
    let covertext = cipher.encrypt(&plaintext).unwrap();
    peer.write_all(&covertext).unwrap();

    assert!(matches!(fsm.next(&ctx), Err(Error::UuidMismatch { .. })));
}

#[test]
fn fte_session_carries_stream_data() {
    let doc = fte_doc("8079");
    let (client_end, server_end) = pipe();
    let ctx = Context::new();

    let client_set = StreamSet::new();
    let server_set = StreamSet::new();

    // Queue application bytes before the session starts.
    let client_stream = client_set.create();
    client_stream.write(b"hello marionette").unwrap();

    let mut client = Fsm::new(
        doc.clone(),
        "127.0.0.1",
        Party::Client,
        Some(BufferedConn::new(client_end)),
        client_set.clone(),
    );
    let mut server = Fsm::new(
        doc,
        "127.0.0.1",
        Party::Server,
        Some(BufferedConn::new(server_end)),
        server_set.clone(),
    );

    let client_ctx = ctx.clone();
    let handle = std::thread::spawn(move || {
        client.execute(&client_ctx).map(|_| client)
    });
    server.execute(&ctx).unwrap();
    let client = handle.join().unwrap().unwrap();

    assert!(server.dead());
    assert!(client.dead());
    // The server learned the client's generated seed from the first cell.
    assert_eq!(server.instance_id(), client.instance_id());

    // The client's stream surfaced on the server side with its bytes intact.
    let surfaced = server_set.accept(&ctx).unwrap();
    let mut buf = [0u8; 64];
    let n = surfaced.read(&mut buf, &ctx).unwrap();
    assert_eq!(&buf[..n], b"hello marionette");
}

// ========== Full proxy stack over loopback TCP ==========

#[test]
fn proxied_stream_reaches_echo_server() {
    // Plain TCP echo server standing in for the protected application.
    let echo = TcpListener::bind("127.0.0.1:0").unwrap();
    let echo_addr = echo.local_addr().unwrap();
    std::thread::spawn(move || {
        if let Ok((mut sock, _)) = echo.accept() {
            let mut buf = [0u8; 4096];
            while let Ok(n) = sock.read(&mut buf) {
                if n == 0 || sock.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    });

    // An endlessly-looping exchange document, as a live proxy would use.
    let request = vec![
        Action::new(Party::Client, "fte", "send")
            .arg(Arg::Str(COVER_REGEX.into()))
            .arg(Arg::Int(COVER_LEN as i64)),
        Action::new(Party::Server, "fte", "recv")
            .arg(Arg::Str(COVER_REGEX.into()))
            .arg(Arg::Int(COVER_LEN as i64)),
    ];
    let response = vec![
        Action::new(Party::Server, "fte", "send")
            .arg(Arg::Str(COVER_REGEX.into()))
            .arg(Arg::Int(COVER_LEN as i64)),
        Action::new(Party::Client, "fte", "recv")
            .arg(Arg::Str(COVER_REGEX.into()))
            .arg(Arg::Int(COVER_LEN as i64)),
    ];

    // Bind the covert listener first to learn its port, then build the
    // document around it.
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    let covert_port = probe.local_addr().unwrap().port();
    drop(probe);

    let doc = Arc::new(
        Document::builder("echo_loop", "1")
            .port(&covert_port.to_string())
            .first_sender(Party::Client)
            .transition("start", "uplink", Some("request"), Probability::Weighted(1.0))
            .transition("uplink", "downlink", Some("response"), Probability::Weighted(1.0))
            .transition("downlink", "uplink", Some("request"), Probability::Weighted(1.0))
            .action_block("request", request)
            .action_block("response", response)
            .build()
            .unwrap(),
    );

    let mut listener = Listener::new(
        doc.clone(),
        &format!("127.0.0.1:{covert_port}"),
        &echo_addr.to_string(),
    )
    .unwrap();

    let stream_set = StreamSet::new();
    let dialer = Arc::new(Dialer::new(doc, "127.0.0.1", stream_set).unwrap());

    // Full client path: plain TCP in, covert session out.
    let local = TcpListener::bind("127.0.0.1:0").unwrap();
    let local_addr = local.local_addr().unwrap();
    let mut proxy = ClientProxy::new(local, dialer).unwrap();
    proxy.open().unwrap();

    let mut app = TcpStream::connect(local_addr).unwrap();
    app.set_read_timeout(Some(Duration::from_secs(30))).unwrap();
    app.write_all(b"ping over cover traffic").unwrap();

    let mut got = vec![0u8; b"ping over cover traffic".len()];
    app.read_exact(&mut got).unwrap();
    assert_eq!(got, b"ping over cover traffic");

    drop(app);
    proxy.close();
    listener.close();
}
