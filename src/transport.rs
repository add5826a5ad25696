//! Blocking byte-stream transport: TCP, optionally TLS-wrapped.
//!
//! Reads go through an internal buffer so a timed-out `recv_exact` never
//! loses partial progress; the next call resumes exactly where the stream
//! left off. This is what lets the dispatch loop poll with short deadlines
//! while writers interleave on the same connection.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use rustls::{ClientConnection, StreamOwned};

use crate::errors::{Error, Result};
use crate::tls::{self, TlsOptions};

enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    fn socket(&self) -> &TcpStream {
        match self {
            Stream::Plain(s) => s,
            Stream::Tls(s) => &s.sock,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf),
            Stream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.write(buf),
            Stream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => s.flush(),
            Stream::Tls(s) => s.flush(),
        }
    }
}

pub struct Transport {
    stream: Option<Stream>,
    read_buffer: Vec<u8>,
    host: String,
    port: u16,
}

impl Transport {
    /// Connect, optionally wrapping the socket in TLS. The timeout covers
    /// the TCP connect only; the handshake caller applies its own deadline.
    pub fn connect(
        host: &str,
        port: u16,
        tls: Option<&TlsOptions>,
        timeout: Duration,
    ) -> Result<Transport> {
        let connect_err = |e: &dyn std::fmt::Display| {
            Error::driver(format!("Could not connect to {host}:{port}. Error: {e}"))
        };

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| connect_err(&e))?
            .collect();
        let mut stream = None;
        let mut last_error: Option<std::io::Error> = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }
        let stream = match (stream, last_error) {
            (Some(s), _) => s,
            (None, Some(e)) => return Err(connect_err(&e)),
            (None, None) => return Err(connect_err(&"no addresses resolved")),
        };
        stream.set_nodelay(true).ok();

        let stream = match tls {
            None => Stream::Plain(stream),
            Some(opts) => {
                let config = tls::client_config(opts)?;
                let name = tls::server_name_for(host)?;
                let conn = ClientConnection::new(Arc::new(config), name)
                    .map_err(|e| Error::driver(format!("Could not start TLS session: {e}")))?;
                Stream::Tls(Box::new(StreamOwned::new(conn, stream)))
            }
        };

        debug!("connected to {host}:{port}");
        Ok(Transport {
            stream: Some(stream),
            read_buffer: Vec::new(),
            host: host.to_string(),
            port,
        })
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream
            .as_ref()
            .and_then(|s| s.socket().local_addr().ok())
    }

    /// Close the stream. Idempotent; after this `is_open` is permanently
    /// false and reads/writes fail with "Connection is closed.".
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.socket().shutdown(Shutdown::Both);
        }
    }

    fn closed_error() -> Error {
        Error::driver("Connection is closed.")
    }

    /// Read exactly `n` bytes, or fail. A deadline of `None` blocks until
    /// the bytes arrive or the peer closes. On timeout, bytes read so far
    /// stay buffered and the next call resumes from them.
    pub fn recv_exact(&mut self, n: usize, deadline: Option<Instant>) -> Result<Vec<u8>> {
        loop {
            if self.read_buffer.len() >= n {
                let rest = self.read_buffer.split_off(n);
                return Ok(std::mem::replace(&mut self.read_buffer, rest));
            }
            self.fill_some(deadline)?;
        }
    }

    /// Read up to and including the next NUL byte, returning the bytes
    /// before it. Used for the handshake's null-terminated JSON messages.
    pub fn recv_until_null(&mut self, deadline: Option<Instant>) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.read_buffer.iter().position(|&b| b == 0) {
                let rest = self.read_buffer.split_off(pos + 1);
                let mut message = std::mem::replace(&mut self.read_buffer, rest);
                message.pop();
                return Ok(message);
            }
            self.fill_some(deadline)?;
        }
    }

    fn fill_some(&mut self, deadline: Option<Instant>) -> Result<()> {
        let timeout = match deadline {
            None => None,
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => {
                    Some(remaining.max(Duration::from_millis(1)))
                }
                _ => return Err(Error::timeout(Some((self.host.as_str(), self.port)))),
            },
        };

        let mut chunk = [0u8; 8192];
        let result = {
            let stream = self.stream.as_mut().ok_or_else(Self::closed_error)?;
            stream
                .socket()
                .set_read_timeout(timeout)
                .map_err(|e| Error::driver(format!("Could not arm read timeout: {e}")))?;
            stream.read(&mut chunk)
        };

        match result {
            Ok(0) => {
                self.close();
                Err(Self::closed_error())
            }
            Ok(read) => {
                self.read_buffer.extend_from_slice(&chunk[..read]);
                Ok(())
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                // Partial progress stays in read_buffer for the retry.
                Err(Error::timeout(Some((self.host.as_str(), self.port))))
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(()),
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                self.close();
                Err(Self::closed_error())
            }
            Err(e) => {
                self.close();
                Err(Error::driver(format!(
                    "Error receiving from {}:{} - {e}",
                    self.host, self.port
                )))
            }
        }
    }

    /// Write the full buffer or fail; any I/O error closes the transport.
    pub fn send_all(&mut self, data: &[u8]) -> Result<()> {
        let result = {
            let stream = self.stream.as_mut().ok_or_else(Self::closed_error)?;
            stream.write_all(data).and_then(|_| stream.flush())
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                self.close();
                Err(Self::closed_error())
            }
            Err(e) => {
                self.close();
                Err(Error::driver(format!(
                    "Error sending to {}:{} - {e}",
                    self.host, self.port
                )))
            }
        }
    }
}
