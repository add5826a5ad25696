//! SCRAM-SHA-256 connection handshake (protocol V1_0).
//!
//! The server speaks SCRAM as specified in RFC 7677 / RFC 5802, with its own
//! error reporting instead of the `e=` field and no channel binding. The
//! state machine here is pure: `next_message` turns the previous server
//! message into the next client message, and the caller does all I/O.
//!
//! Message sequence on the wire:
//! 1. client: `[4-byte version LE][JSON]\0` with the client-first-message
//! 2. server: version negotiation JSON (client sends nothing back)
//! 3. server: server-first-message; client answers with its proof
//! 4. server: server-final-message; client verifies the server signature

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::errors::{Error, Result};
use crate::protocol::{auth_error_code, PROTOCOL_VERSION, VERSION_V1_0};

type HmacSha256 = Hmac<Sha256>;

/// Upper bound on the server-supplied PBKDF2 iteration count. The protocol
/// itself has no limit; a hostile server must not be able to pin the client
/// CPU during auth.
const MAX_PBKDF2_ITERATIONS: u32 = 1 << 24;

/// Number of random bytes behind the client nonce.
const NONCE_BYTES: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    InitialConnection,
    InitialResponse,
    AuthRequest,
    AuthResponse,
}

#[derive(Serialize)]
struct ClientFirstMessage<'a> {
    protocol_version: u64,
    authentication_method: &'static str,
    authentication: &'a str,
}

#[derive(Serialize)]
struct ClientFinalMessage<'a> {
    authentication: &'a str,
}

#[derive(Debug, Deserialize)]
struct ServerMessage {
    success: bool,
    error: Option<String>,
    error_code: Option<i64>,
    min_protocol_version: Option<i64>,
    max_protocol_version: Option<i64>,
    authentication: Option<String>,
}

/// The V1_0 handshake state machine for one connection attempt.
pub struct Handshake {
    host: String,
    port: u16,
    username: String,
    password: String,
    state: HandshakeState,
    nonce: String,
    first_client_message: String,
    server_signature: Vec<u8>,
}

impl Handshake {
    pub fn new(host: &str, port: u16, username: &str, password: &str) -> Handshake {
        // SASL-escape the username; '=' and ',' are structural in the
        // client-first-message.
        let username = username.replace('=', "=3D").replace(',', "=2C");
        Handshake {
            host: host.to_string(),
            port,
            username,
            password: password.to_string(),
            state: HandshakeState::InitialConnection,
            nonce: String::new(),
            first_client_message: String::new(),
            server_signature: Vec::new(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Reset to the initial state, clearing nonce and signature material.
    /// Called before each physical reconnect attempt.
    pub fn reset(&mut self) {
        self.state = HandshakeState::InitialConnection;
        self.nonce.clear();
        self.first_client_message.clear();
        self.server_signature.clear();
    }

    /// Advance the state machine one step. Returns the next message to send:
    /// `Some(non-empty)` to send bytes, `Some(empty)` to send nothing but
    /// keep reading, and `None` exactly once when the handshake completed.
    pub fn next_message(&mut self, response: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        match self.state {
            HandshakeState::InitialConnection => {
                if response.is_some() {
                    return Err(Error::driver("Unexpected response"));
                }
                let message = self.initialize_connection()?;
                self.next_state()?;
                Ok(Some(message))
            }
            HandshakeState::InitialResponse => {
                self.read_response(self.decode_utf8(response)?.as_str())?;
                self.next_state()?;
                // Empty bytes tell the caller to send nothing but keep
                // reading; only None ends the handshake.
                Ok(Some(Vec::new()))
            }
            HandshakeState::AuthRequest => {
                let message = self.prepare_auth_request(self.decode_utf8(response)?.as_str())?;
                self.next_state()?;
                Ok(Some(message))
            }
            HandshakeState::AuthResponse => {
                self.read_auth_response(self.decode_utf8(response)?.as_str())?;
                Ok(None)
            }
        }
    }

    fn next_state(&mut self) -> Result<()> {
        self.state = match self.state {
            HandshakeState::InitialConnection => HandshakeState::InitialResponse,
            HandshakeState::InitialResponse => HandshakeState::AuthRequest,
            HandshakeState::AuthRequest => HandshakeState::AuthResponse,
            HandshakeState::AuthResponse => {
                return Err(Error::InvalidHandshakeState(
                    "No handshake state beyond AUTH_RESPONSE".to_string(),
                ))
            }
        };
        Ok(())
    }

    fn decode_utf8(&self, response: Option<&[u8]>) -> Result<String> {
        let bytes = response.ok_or_else(|| {
            Error::InvalidHandshakeState("Expected a server response in this state".to_string())
        })?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::driver(format!("Handshake response is not valid UTF-8: {e}")))
    }

    fn endpoint(&self) -> Option<(&str, u16)> {
        Some((self.host.as_str(), self.port))
    }

    /// Parse a server JSON message, mapping reported failures to the right
    /// error kind by error code.
    fn decode_server_message(&self, response: &str) -> Result<ServerMessage> {
        let message: ServerMessage = serde_json::from_str(response)
            .map_err(|e| Error::driver(format!("Could not decode handshake response: {e}")))?;
        if !message.success {
            let reason = message.error.as_deref().unwrap_or("Unknown handshake error");
            let code = message.error_code.unwrap_or(-1);
            if (auth_error_code::MIN..=auth_error_code::MAX).contains(&code) {
                return Err(Error::auth(reason, self.endpoint()));
            }
            return Err(Error::driver(reason));
        }
        Ok(message)
    }

    fn initialize_connection(&mut self) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_BYTES];
        rand::rng().fill(&mut nonce_bytes[..]);
        self.start_with_nonce(BASE64.encode(nonce_bytes))
    }

    /// Build the version-prefixed first message for a fixed nonce. Split out
    /// from `initialize_connection` so the transcript is reproducible.
    fn start_with_nonce(&mut self, nonce: String) -> Result<Vec<u8>> {
        self.nonce = nonce;
        self.first_client_message = format!("n={},r={}", self.username, self.nonce);

        let authentication = format!("n,,{}", self.first_client_message);
        let json = serde_json::to_vec(&ClientFirstMessage {
            protocol_version: PROTOCOL_VERSION,
            authentication_method: "SCRAM-SHA-256",
            authentication: &authentication,
        })
        .map_err(|e| Error::driver(format!("Could not serialize handshake message: {e}")))?;

        let mut message = Vec::with_capacity(4 + json.len() + 1);
        message.extend_from_slice(&VERSION_V1_0.to_le_bytes());
        message.extend_from_slice(&json);
        message.push(0);
        Ok(message)
    }

    fn read_response(&self, response: &str) -> Result<()> {
        let message = self.decode_server_message(response)?;
        let min = message.min_protocol_version.unwrap_or(i64::MIN);
        let max = message.max_protocol_version.unwrap_or(i64::MAX);
        let ours = PROTOCOL_VERSION as i64;
        if !(min <= ours && ours <= max) {
            return Err(Error::driver(format!(
                "Unsupported protocol version {ours}, expected between {min} and {max}"
            )));
        }
        Ok(())
    }

    fn prepare_auth_request(&mut self, response: &str) -> Result<Vec<u8>> {
        let message = self.decode_server_message(response)?;
        let server_first = message
            .authentication
            .ok_or_else(|| Error::driver("Handshake response is missing authentication data"))?;
        let fields = split_auth_fields(&server_first)?;

        let server_nonce = fields
            .get("r")
            .ok_or_else(|| Error::driver("server-first-message is missing its nonce"))?;
        // Anti-replay: the server must echo our nonce as a prefix of its own.
        if !server_nonce.starts_with(&self.nonce) {
            return Err(Error::auth("Invalid nonce from server", self.endpoint()));
        }

        let salt = BASE64
            .decode(
                fields
                    .get("s")
                    .ok_or_else(|| Error::driver("server-first-message is missing its salt"))?,
            )
            .map_err(|e| Error::driver(format!("Invalid salt encoding: {e}")))?;
        let iterations: u32 = fields
            .get("i")
            .ok_or_else(|| Error::driver("server-first-message is missing its iteration count"))?
            .parse()
            .map_err(|e| Error::driver(format!("Invalid iteration count: {e}")))?;
        if iterations == 0 || iterations > MAX_PBKDF2_ITERATIONS {
            return Err(Error::driver(format!(
                "Iteration count {iterations} is outside the accepted range \
                 1..={MAX_PBKDF2_ITERATIONS}"
            )));
        }

        let mut salted_password = [0u8; 32];
        pbkdf2_hmac::<Sha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );

        let message_without_proof = format!("c=biws,r={server_nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.first_client_message, server_first, message_without_proof
        );

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        self.server_signature = hmac_sha256(&server_key, auth_message.as_bytes());

        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(&client_key);
        let client_signature = hmac_sha256(stored_key.as_slice(), auth_message.as_bytes());
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let authentication = format!(
            "{},p={}",
            message_without_proof,
            BASE64.encode(&client_proof)
        );
        let mut message = serde_json::to_vec(&ClientFinalMessage {
            authentication: &authentication,
        })
        .map_err(|e| Error::driver(format!("Could not serialize handshake message: {e}")))?;
        message.push(0);
        Ok(message)
    }

    fn read_auth_response(&self, response: &str) -> Result<()> {
        let message = self.decode_server_message(response)?;
        let authentication = message
            .authentication
            .ok_or_else(|| Error::driver("Handshake response is missing authentication data"))?;
        let fields = split_auth_fields(&authentication)?;
        let signature = BASE64
            .decode(
                fields
                    .get("v")
                    .ok_or_else(|| Error::driver("server-final-message is missing its signature"))?,
            )
            .map_err(|e| Error::driver(format!("Invalid signature encoding: {e}")))?;

        if !constant_time_eq(&signature, &self.server_signature) {
            return Err(Error::auth("Invalid server signature", self.endpoint()));
        }
        Ok(())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Parse a comma-separated `key=value` SCRAM attribute list. Values may
/// themselves contain '=' (base64), so only the first '=' splits.
fn split_auth_fields(message: &str) -> Result<HashMap<String, String>> {
    let mut fields = HashMap::new();
    for part in message.split(',') {
        let (key, value) = part.split_once('=').ok_or_else(|| {
            Error::driver(format!("Malformed authentication field {part:?}"))
        })?;
        fields.insert(key.to_string(), value.to_string());
    }
    Ok(fields)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
