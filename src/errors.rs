//! Error taxonomy for the driver.
//!
//! Local faults (`Driver`, `Timeout`, `Auth`, handshake-state violations) are
//! kept apart from server-reported query failures (`Compile` and the
//! `Runtime` family). Server errors carry the offending term and the
//! backtrace frames the server returned so the failing sub-expression can be
//! rendered with carets.

use std::fmt;

use thiserror::Error;

use crate::protocol::{error_type, term_type};
use crate::term::{Datum, Term};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Local client-side fault: malformed response, closed connection,
    /// protocol violation, bad configuration.
    #[error("{0}")]
    Driver(String),

    /// The handshake failed to authenticate: bad nonce, bad signature, or
    /// rejected credentials. Fatal to the connection attempt.
    #[error("{0}")]
    Auth(String),

    /// A deadline elapsed waiting on I/O or a response. Surfaced only to the
    /// waiting caller; the connection stays usable.
    #[error("{0}")]
    Timeout(String),

    /// The handshake state machine was driven outside its linear order.
    #[error("{0}")]
    InvalidHandshakeState(String),

    /// The server rejected the shape of the query.
    #[error("{0}")]
    Compile(ServerError),

    /// The query executed on the server and failed there.
    #[error("{0}")]
    Runtime(RuntimeError),
}

impl Error {
    pub fn driver(message: impl Into<String>) -> Error {
        Error::Driver(message.into())
    }

    pub fn auth(message: &str, endpoint: Option<(&str, u16)>) -> Error {
        match endpoint {
            Some((host, port)) => {
                Error::Auth(format!("Could not connect to {host}:{port}, {message}"))
            }
            None => Error::Auth(message.to_string()),
        }
    }

    pub fn timeout(endpoint: Option<(&str, u16)>) -> Error {
        match endpoint {
            Some((host, port)) => Error::Timeout(format!(
                "Could not connect to {host}:{port}, Operation timed out."
            )),
            None => Error::Timeout("Operation timed out.".to_string()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

/// Kind selector for the runtime error family, chosen by the response's
/// error-type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    Internal,
    ResourceLimit,
    QueryLogic,
    NonExistence,
    OpFailed,
    OpIndeterminate,
    Permission,
    User,
    /// Unrecognized or absent error-type field.
    Generic,
}

impl RuntimeErrorKind {
    pub fn from_wire(value: Option<u64>) -> RuntimeErrorKind {
        match value {
            Some(error_type::INTERNAL) => RuntimeErrorKind::Internal,
            Some(error_type::RESOURCE_LIMIT) => RuntimeErrorKind::ResourceLimit,
            Some(error_type::QUERY_LOGIC) => RuntimeErrorKind::QueryLogic,
            Some(error_type::NON_EXISTENCE) => RuntimeErrorKind::NonExistence,
            Some(error_type::OP_FAILED) => RuntimeErrorKind::OpFailed,
            Some(error_type::OP_INDETERMINATE) => RuntimeErrorKind::OpIndeterminate,
            Some(error_type::USER) => RuntimeErrorKind::User,
            Some(error_type::PERMISSION_ERROR) => RuntimeErrorKind::Permission,
            _ => RuntimeErrorKind::Generic,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub error: ServerError,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

/// A server-reported failure with enough context to point at the failing
/// sub-expression.
#[derive(Debug, Clone)]
pub struct ServerError {
    pub message: String,
    pub term: Option<Term>,
    pub frames: Option<Vec<i64>>,
}

impl ServerError {
    pub fn new(message: String, term: Option<Term>, frames: Option<Vec<i64>>) -> ServerError {
        ServerError {
            message,
            term,
            frames,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.term, &self.frames) {
            (Some(term), Some(frames)) => {
                let printer = QueryPrinter::new(term, frames);
                write!(
                    f,
                    "{} in:\n{}\n{}",
                    self.message.trim_end_matches('.'),
                    printer.query(),
                    printer.carets()
                )
            }
            _ => f.write_str(&self.message),
        }
    }
}

/// Renders a failed query with a caret line underneath pointing at the
/// sub-term the backtrace frames select.
pub struct QueryPrinter<'a> {
    term: &'a Term,
    frames: &'a [i64],
}

impl<'a> QueryPrinter<'a> {
    pub fn new(term: &'a Term, frames: &'a [i64]) -> QueryPrinter<'a> {
        QueryPrinter { term, frames }
    }

    pub fn query(&self) -> String {
        compose_term(self.term)
    }

    pub fn carets(&self) -> String {
        compose_carets(self.term, self.frames)
    }
}

fn datum_repr(datum: &Datum) -> String {
    match datum {
        Datum::Null => "null".to_string(),
        Datum::Bool(b) => b.to_string(),
        Datum::Int(i) => i.to_string(),
        Datum::Float(v) => v.to_string(),
        Datum::String(s) => format!("{s:?}"),
        Datum::Array(items) => {
            let inner: Vec<String> = items.iter().map(datum_repr).collect();
            format!("[{}]", inner.join(", "))
        }
        Datum::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{k:?}: {}", datum_repr(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
        Datum::Binary(bytes) => format!("<binary, {} bytes>", bytes.len()),
        Datum::Time(t) => format!("r.iso8601({:?})", t.to_rfc3339()),
        Datum::Grouped(_) => "<grouped data>".to_string(),
    }
}

fn op_name(tag: u32) -> String {
    match tag {
        term_type::MAKE_ARRAY => "r.expr".to_string(),
        term_type::DB => "r.db".to_string(),
        term_type::ADD => "r.add".to_string(),
        _ => format!("r.op_{tag}"),
    }
}

/// Compose a printable form of the term. A single match over the term enum,
/// applied recursively; the query builder's per-operation pretty names are
/// out of scope here.
fn compose_term(term: &Term) -> String {
    match term {
        Term::Datum(d) => datum_repr(d),
        Term::Op { tag, args, opts } => {
            let mut parts: Vec<String> = args.iter().map(compose_term).collect();
            for (k, v) in opts {
                parts.push(format!("{k}={}", compose_term(v)));
            }
            format!("{}({})", op_name(*tag), parts.join(", "))
        }
    }
}

fn compose_carets(term: &Term, frames: &[i64]) -> String {
    if frames.is_empty() {
        return "^".repeat(compose_term(term).chars().count());
    }

    match term {
        // A datum cannot be descended into; the remaining frames point past
        // the printable tree, so underline the whole value.
        Term::Datum(_) => "^".repeat(compose_term(term).chars().count()),
        Term::Op { tag, args, opts } => {
            let current = frames[0];
            let mut parts: Vec<String> = Vec::with_capacity(args.len() + opts.len());
            for (i, arg) in args.iter().enumerate() {
                if i as i64 == current {
                    parts.push(compose_carets(arg, &frames[1..]));
                } else {
                    parts.push(blank_of(arg));
                }
            }
            for (k, v) in opts {
                parts.push(" ".repeat(k.chars().count() + 1) + &blank_of(v));
            }
            let head = " ".repeat(op_name(*tag).chars().count() + 1);
            format!("{}{}", head, parts.join("  "))
                .trim_end()
                .to_string()
        }
    }
}

fn blank_of(term: &Term) -> String {
    " ".repeat(compose_term(term).chars().count())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_term() -> Term {
        Term::op(
            term_type::ADD,
            vec![Term::datum(1), Term::datum("two")],
        )
    }

    #[test]
    fn server_error_without_context_is_plain() {
        let err = ServerError::new("boom.".to_string(), None, None);
        assert_eq!(err.to_string(), "boom.");
    }

    #[test]
    fn server_error_renders_query_and_carets() {
        let err = ServerError::new(
            "Expected type NUMBER but found STRING.".to_string(),
            Some(add_term()),
            Some(vec![1]),
        );
        let rendered = err.to_string();
        assert!(rendered.contains("in:\n"));
        assert!(rendered.contains("r.add(1, \"two\")"));
        assert!(rendered.lines().last().unwrap().contains("^^^^^"));
    }

    #[test]
    fn carets_cover_whole_query_when_no_frames() {
        let printer_term = add_term();
        let printer = QueryPrinter::new(&printer_term, &[]);
        assert_eq!(printer.query().chars().count(), printer.carets().chars().count());
        assert!(printer.carets().chars().all(|c| c == '^'));
    }

    #[test]
    fn runtime_kind_mapping() {
        assert_eq!(
            RuntimeErrorKind::from_wire(Some(error_type::NON_EXISTENCE)),
            RuntimeErrorKind::NonExistence
        );
        assert_eq!(RuntimeErrorKind::from_wire(None), RuntimeErrorKind::Generic);
        assert_eq!(
            RuntimeErrorKind::from_wire(Some(42)),
            RuntimeErrorKind::Generic
        );
    }

    #[test]
    fn timeout_formatting() {
        assert_eq!(
            Error::timeout(None).to_string(),
            "Operation timed out."
        );
        assert_eq!(
            Error::timeout(Some(("localhost", 28015))).to_string(),
            "Could not connect to localhost:28015, Operation timed out."
        );
    }
}
