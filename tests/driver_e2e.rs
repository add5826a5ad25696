//! End-to-end tests against a scripted in-process server.
//!
//! The server speaks the real wire protocol over TCP, including the full
//! SCRAM-SHA-256 handshake (it verifies the client proof it receives), and
//! answers query frames from a per-test script.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use riptide::{AsyncConnection, ConnectOptions, Connection, Datum, Error, OptArgs, RunResult, Term};

type HmacSha256 = Hmac<Sha256>;

const VERSION_V1_0: u32 = 0x34c2_bdc3;
const SALT: &[u8] = b"pepper";
const ITERATIONS: u32 = 32;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("any key size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn read_null_terminated(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if stream.read(&mut byte)? == 0 {
            anyhow::bail!("eof during handshake");
        }
        if byte[0] == 0 {
            return Ok(out);
        }
        out.push(byte[0]);
    }
}

fn write_null(stream: &mut TcpStream, body: &Value) -> Result<()> {
    stream.write_all(serde_json::to_string(body)?.as_bytes())?;
    stream.write_all(&[0])?;
    Ok(())
}

/// Server side of the SCRAM handshake, verifying the client proof.
fn serve_handshake(stream: &mut TcpStream, password: &str) -> Result<()> {
    let mut version = [0u8; 4];
    stream.read_exact(&mut version)?;
    assert_eq!(u32::from_le_bytes(version), VERSION_V1_0);

    let first: Value = serde_json::from_slice(&read_null_terminated(stream)?)?;
    assert_eq!(first["protocol_version"], 0);
    assert_eq!(first["authentication_method"], "SCRAM-SHA-256");
    let auth = first["authentication"].as_str().unwrap().to_string();
    let client_first_bare = auth.strip_prefix("n,,").unwrap().to_string();
    let client_nonce = client_first_bare.split_once(",r=").unwrap().1.to_string();

    write_null(
        stream,
        &json!({"success": true, "min_protocol_version": 0, "max_protocol_version": 0}),
    )?;

    let server_nonce = format!("{client_nonce}SRV");
    let server_first = format!(
        "r={},s={},i={}",
        server_nonce,
        BASE64.encode(SALT),
        ITERATIONS
    );
    write_null(stream, &json!({"success": true, "authentication": server_first}))?;

    let final_message: Value = serde_json::from_slice(&read_null_terminated(stream)?)?;
    let auth = final_message["authentication"].as_str().unwrap().to_string();
    let (without_proof, proof_b64) = auth.rsplit_once(",p=").unwrap();
    assert_eq!(without_proof, format!("c=biws,r={server_nonce}"));

    let mut salted = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), SALT, ITERATIONS, &mut salted);
    let auth_message = format!("{client_first_bare},{server_first},{without_proof}");

    let client_key = hmac_sha256(&salted, b"Client Key");
    let stored_key = Sha256::digest(&client_key);
    let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
    let expected_proof: Vec<u8> = client_key
        .iter()
        .zip(client_signature.iter())
        .map(|(k, s)| k ^ s)
        .collect();
    assert_eq!(
        BASE64.decode(proof_b64)?,
        expected_proof,
        "client proof mismatch"
    );

    let server_key = hmac_sha256(&salted, b"Server Key");
    let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());
    write_null(
        stream,
        &json!({
            "success": true,
            "authentication": format!("v={}", BASE64.encode(&server_signature)),
        }),
    )?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> Result<Option<(u64, Value)>> {
    let mut header = [0u8; 12];
    let mut got = 0;
    while got < header.len() {
        let read = match stream.read(&mut header[got..]) {
            Ok(read) => read,
            Err(_) => return Ok(None),
        };
        if read == 0 {
            return Ok(None);
        }
        got += read;
    }
    let token = u64::from_le_bytes(header[0..8].try_into().unwrap());
    let length = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload)?;
    Ok(Some((token, serde_json::from_slice(&payload)?)))
}

fn write_frame(stream: &mut TcpStream, token: u64, body: &Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    stream.write_all(&token.to_le_bytes())?;
    stream.write_all(&(payload.len() as u32).to_le_bytes())?;
    stream.write_all(&payload)?;
    Ok(())
}

/// Spawn a scripted server on an ephemeral port. `sessions` connections are
/// served in order; each query frame goes to `handler`, which answers on the
/// stream and returns false to drop the connection. Joining the handle
/// yields every token the server saw, in arrival order.
fn spawn_server<F>(sessions: usize, mut handler: F) -> (u16, thread::JoinHandle<Vec<u64>>)
where
    F: FnMut(&mut TcpStream, u64, &Value) -> Result<bool> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let mut tokens = Vec::new();
        for _ in 0..sessions {
            let mut stream = match listener.accept() {
                Ok((stream, _)) => stream,
                Err(_) => break,
            };
            if serve_handshake(&mut stream, "").is_err() {
                continue;
            }
            loop {
                match read_frame(&mut stream) {
                    Ok(Some((token, query))) => {
                        tokens.push(token);
                        match handler(&mut stream, token, &query) {
                            Ok(true) => {}
                            _ => break,
                        }
                    }
                    _ => break,
                }
            }
        }
        tokens
    });
    (port, handle)
}

fn options_for(port: u16) -> ConnectOptions {
    ConnectOptions::new()
        .host("127.0.0.1")
        .port(port)
        .timeout(Duration::from_secs(5))
}

fn connect(port: u16) -> Connection {
    Connection::connect(options_for(port)).unwrap()
}

fn add_term() -> Term {
    Term::op(24, vec![Term::datum(1), Term::datum(2)])
}

fn query_type(query: &Value) -> u64 {
    query[0].as_u64().unwrap()
}

fn wait_until_closed(conn: &Connection) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while conn.is_open() {
        assert!(Instant::now() < deadline, "connection never noticed failure");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn sync_run_returns_atoms_and_tokens_restart_on_reconnect() -> Result<()> {
    init_logging();
    let (port, server) = spawn_server(2, |stream, token, query| {
        assert_eq!(query_type(query), 1);
        write_frame(stream, token, &json!({"t": 1, "r": [42]}))?;
        Ok(true)
    });

    let conn = connect(port);
    for _ in 0..3 {
        match conn.run(&add_term(), OptArgs::new())? {
            RunResult::Atom(Datum::Int(42)) => {}
            other => panic!("expected atom 42, got {other:?}"),
        }
    }

    conn.reconnect()?;
    match conn.run(&add_term(), OptArgs::new())? {
        RunResult::Atom(Datum::Int(42)) => {}
        other => panic!("expected atom 42, got {other:?}"),
    }
    drop(conn);

    // Strictly increasing from zero, restarting after reconnect.
    assert_eq!(server.join().unwrap(), vec![0, 1, 2, 0]);
    Ok(())
}

#[test]
fn sync_cursor_streams_batches_lazily() -> Result<()> {
    init_logging();
    let mut continues = 0;
    let (port, _server) = spawn_server(1, move |stream, token, query| {
        match query_type(query) {
            1 => write_frame(stream, token, &json!({"t": 3, "r": [1, 2]}))?,
            2 => {
                continues += 1;
                if continues == 1 {
                    write_frame(stream, token, &json!({"t": 3, "r": [3]}))?;
                } else {
                    write_frame(stream, token, &json!({"t": 2, "r": [4]}))?;
                }
            }
            other => panic!("unexpected query type {other}"),
        }
        Ok(true)
    });

    let conn = connect(port);
    let mut cursor = match conn.run(&add_term(), OptArgs::new())? {
        RunResult::Cursor(cursor) => cursor,
        other => panic!("expected cursor, got {other:?}"),
    };

    let timeout = Some(Duration::from_secs(5));
    assert_eq!(cursor.next(timeout)?, Some(Datum::Int(1)));
    assert_eq!(cursor.next(timeout)?, Some(Datum::Int(2)));

    // Drain the rest through the iterator adaptor.
    let rest = cursor.iter().collect::<riptide::Result<Vec<_>>>()?;
    assert_eq!(rest, vec![Datum::Int(3), Datum::Int(4)]);
    assert_eq!(cursor.next(timeout)?, None);
    cursor.close()?;
    Ok(())
}

#[test]
fn sync_cursor_drains_buffer_before_surfacing_error() -> Result<()> {
    init_logging();
    let (port, _server) = spawn_server(1, |stream, token, query| {
        assert_eq!(query_type(query), 1);
        write_frame(stream, token, &json!({"t": 3, "r": [1, 2, 3, 4, 5]}))?;
        // Drop the connection with the batch buffered client-side.
        Ok(false)
    });

    let conn = connect(port);
    let mut cursor = match conn.run(&add_term(), OptArgs::new())? {
        RunResult::Cursor(cursor) => cursor,
        other => panic!("expected cursor, got {other:?}"),
    };
    wait_until_closed(&conn);

    for expected in 1..=5i64 {
        assert_eq!(
            cursor.next(Some(Duration::from_secs(5)))?,
            Some(Datum::Int(expected))
        );
    }
    let err = cursor.next(Some(Duration::from_secs(5))).unwrap_err();
    assert!(
        err.to_string().contains("Connection is closed"),
        "unexpected error: {err}"
    );
    Ok(())
}

#[test]
fn sync_transport_failure_fans_out_to_every_caller() -> Result<()> {
    init_logging();
    let mut starts = 0;
    let (port, _server) = spawn_server(1, move |stream, token, query| {
        assert_eq!(query_type(query), 1);
        starts += 1;
        match starts {
            1..=3 => {
                write_frame(stream, token, &json!({"t": 3, "r": [starts * 10]}))?;
                Ok(true)
            }
            // Two single-shot calls stay pending, then the transport dies.
            4 => Ok(true),
            _ => Ok(false),
        }
    });

    let conn = Arc::new(connect(port));
    let mut cursors = Vec::new();
    for _ in 0..3 {
        match conn.run(&add_term(), OptArgs::new())? {
            RunResult::Cursor(cursor) => cursors.push(cursor),
            other => panic!("expected cursor, got {other:?}"),
        }
    }

    let pending: Vec<_> = (0..2)
        .map(|_| {
            let conn = conn.clone();
            thread::spawn(move || conn.run(&add_term(), OptArgs::new()))
        })
        .collect();

    for waiter in pending {
        let result = waiter.join().unwrap();
        let err = result.unwrap_err();
        assert!(
            err.to_string().contains("Connection is closed"),
            "unexpected error: {err}"
        );
    }
    wait_until_closed(&conn);

    for mut cursor in cursors {
        // The buffered item drains first, then the stored error surfaces.
        assert!(matches!(
            cursor.next(Some(Duration::from_secs(5)))?,
            Some(Datum::Int(_))
        ));
        let err = cursor.next(Some(Duration::from_secs(5))).unwrap_err();
        assert!(err.to_string().contains("Connection is closed"));
    }
    Ok(())
}

#[test]
fn sync_close_with_noreply_wait_drains_the_server() -> Result<()> {
    init_logging();
    let (port, server) = spawn_server(1, |stream, token, query| match query_type(query) {
        1 => {
            write_frame(stream, token, &json!({"t": 1, "r": [1]}))?;
            Ok(true)
        }
        4 => {
            write_frame(stream, token, &json!({"t": 4, "r": []}))?;
            Ok(true)
        }
        other => panic!("unexpected query type {other}"),
    });

    let conn = connect(port);
    conn.run(&add_term(), OptArgs::new())?;
    conn.close(true)?;
    assert!(!conn.is_open());
    drop(conn);

    assert_eq!(server.join().unwrap(), vec![0, 1]);
    Ok(())
}

#[test]
fn sync_unknown_token_is_a_protocol_violation() -> Result<()> {
    init_logging();
    let (port, _server) = spawn_server(1, |stream, token, query| {
        assert_eq!(query_type(query), 1);
        write_frame(stream, token + 999, &json!({"t": 1, "r": [1]}))?;
        Ok(true)
    });

    let conn = connect(port);
    let err = conn.run(&add_term(), OptArgs::new()).unwrap_err();
    assert!(
        err.to_string().contains("Unexpected response received"),
        "unexpected error: {err}"
    );
    wait_until_closed(&conn);
    Ok(())
}

#[test]
fn sync_rejected_credentials_surface_as_auth_error() -> Result<()> {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let _server = thread::spawn(move || -> Result<()> {
        let (mut stream, _) = listener.accept()?;
        let mut version = [0u8; 4];
        stream.read_exact(&mut version)?;
        read_null_terminated(&mut stream)?;
        write_null(
            &mut stream,
            &json!({"success": false, "error": "Wrong password", "error_code": 12}),
        )?;
        Ok(())
    });

    let err = match Connection::connect(options_for(port)) {
        Ok(_) => panic!("connecting with rejected credentials should fail"),
        Err(err) => err,
    };
    match err {
        Error::Auth(message) => assert!(message.contains("Wrong password")),
        other => panic!("expected auth error, got {other}"),
    }
    Ok(())
}

#[test]
fn sync_binary_format_option_controls_decoding() -> Result<()> {
    init_logging();
    let data = BASE64.encode([0u8, 1, 2]);
    let (port, _server) = spawn_server(1, move |stream, token, _query| {
        write_frame(
            stream,
            token,
            &json!({"t": 1, "r": [{"$reql_type$": "BINARY", "data": data}]}),
        )?;
        Ok(true)
    });

    let conn = connect(port);

    match conn.run(&add_term(), OptArgs::new())? {
        RunResult::Atom(Datum::Binary(bytes)) => assert_eq!(bytes, vec![0, 1, 2]),
        other => panic!("expected binary, got {other:?}"),
    }

    match conn.run(&add_term(), OptArgs::new().set("binary_format", "raw"))? {
        RunResult::Atom(Datum::Object(map)) => {
            assert_eq!(
                map.get("$reql_type$"),
                Some(&Datum::String("BINARY".to_string()))
            );
        }
        other => panic!("expected raw object, got {other:?}"),
    }

    // Rejected locally, before anything reaches the wire.
    let err = conn
        .run(&add_term(), OptArgs::new().set("binary_format", "compact"))
        .unwrap_err();
    assert!(err.to_string().contains("binary_format"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_cursor_fetch_next_and_close() -> Result<()> {
    init_logging();
    let (port, server) = spawn_server(1, |stream, token, query| match query_type(query) {
        1 => {
            write_frame(stream, token, &json!({"t": 3, "r": [1]}))?;
            Ok(true)
        }
        2 => {
            write_frame(stream, token, &json!({"t": 2, "r": [2]}))?;
            Ok(true)
        }
        4 => {
            write_frame(stream, token, &json!({"t": 4, "r": []}))?;
            Ok(true)
        }
        other => panic!("unexpected query type {other}"),
    });

    let conn = AsyncConnection::connect(options_for(port)).await?;
    let mut cursor = match conn.run(&add_term(), OptArgs::new()).await? {
        RunResult::Cursor(cursor) => cursor,
        other => panic!("expected cursor, got {other:?}"),
    };

    let timeout = Some(Duration::from_secs(5));
    assert!(cursor.fetch_next(timeout).await?);
    assert_eq!(cursor.next(timeout).await?, Some(Datum::Int(1)));
    assert_eq!(cursor.next(timeout).await?, Some(Datum::Int(2)));
    assert_eq!(cursor.next(timeout).await?, None);
    assert!(!cursor.fetch_next(timeout).await?);
    cursor.close().await?;

    conn.close(true).await?;
    assert!(!conn.is_open().await);
    drop(conn);

    assert_eq!(server.join().unwrap(), vec![0, 0, 1]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_transport_failure_resolves_pending_calls() -> Result<()> {
    init_logging();
    let (port, _server) = spawn_server(1, |_stream, _token, query| {
        assert_eq!(query_type(query), 1);
        Ok(false)
    });

    let conn = AsyncConnection::connect(options_for(port)).await?;
    let err = conn.run(&add_term(), OptArgs::new()).await.unwrap_err();
    assert!(
        err.to_string().contains("Connection is closed"),
        "unexpected error: {err}"
    );
    assert!(!conn.is_open().await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_atom_run_with_profile() -> Result<()> {
    init_logging();
    let (port, _server) = spawn_server(1, |stream, token, _query| {
        write_frame(stream, token, &json!({"t": 1, "r": [7], "p": {"took": 1}}))?;
        Ok(true)
    });

    let conn = AsyncConnection::connect(options_for(port)).await?;
    match conn.run(&add_term(), OptArgs::new()).await? {
        RunResult::Atom(Datum::Object(map)) => {
            assert_eq!(map.get("value"), Some(&Datum::Int(7)));
            assert!(map.contains_key("profile"));
        }
        other => panic!("expected profiled atom, got {other:?}"),
    }
    Ok(())
}
