//! Riptide - RethinkDB client driver
//!
//! Transport, authentication, and response-multiplexing machinery for the
//! ReQL wire protocol, with both a blocking connection and a Tokio-based
//! async connection sharing one protocol core.

pub mod cursor;
pub mod errors;
pub mod handshake;
pub mod net;
pub mod net_async;
pub mod protocol;
pub mod protocol_core;
pub mod repl;
pub mod term;
pub mod tls;
pub mod transport;

pub use cursor::Cursor;
pub use errors::{Error, Result, RuntimeErrorKind, ServerError};
pub use net::{ConnectOptions, Connection};
pub use net_async::{AsyncConnection, AsyncCursor};
pub use protocol_core::{OptArgs, RunResult};
pub use term::{Datum, GroupKey, Term};
pub use tls::TlsOptions;
