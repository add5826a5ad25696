//! Shared protocol logic for the blocking and async network implementations.
//!
//! Everything here is pure computation over bytes and values: frame headers,
//! query envelope serialization, response envelope parsing, and the
//! pseudo-type conversions that map wire JSON to native values. Both net.rs
//! and net_async.rs drive these functions; neither duplicates codec logic.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, FixedOffset, Utc};
use serde_json::{Map, Number, Value};

use crate::errors::{Error, Result, RuntimeError, RuntimeErrorKind, ServerError};
use crate::protocol::{query_type, response_type, term_type, HEADER_SIZE, MAX_RESPONSE_SIZE};
use crate::term::{Datum, GroupKey, Term};

pub const REQL_TYPE_KEY: &str = "$reql_type$";

/// Build a request/response frame header: 8-byte token LE + 4-byte length LE.
pub fn build_header(token: u64, payload_len: u32) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..8].copy_from_slice(&token.to_le_bytes());
    header[8..12].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse a frame header. Returns (token, payload length).
pub fn parse_header(header: &[u8; HEADER_SIZE]) -> Result<(u64, usize)> {
    let token = u64::from_le_bytes(header[0..8].try_into().expect("fixed slice"));
    let len = u32::from_le_bytes(header[8..12].try_into().expect("fixed slice")) as usize;
    if len > MAX_RESPONSE_SIZE {
        return Err(Error::driver(format!(
            "Response payload too large: {len} bytes (max: {MAX_RESPONSE_SIZE})"
        )));
    }
    Ok((token, len))
}

/// Named query options, as terms. Scalar option values (format options, the
/// noreply flag) are datum terms; the default database is a DB op term.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptArgs(BTreeMap<String, Term>);

impl OptArgs {
    pub fn new() -> OptArgs {
        OptArgs(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Term) {
        self.0.insert(key.into(), value);
    }

    /// Builder-style insert of a scalar option value.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Datum>) -> OptArgs {
        self.0.insert(key.into(), Term::Datum(value.into()));
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: Term) -> OptArgs {
        self.0.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Term> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(Term::Datum(Datum::String(s))) => Some(s),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key) {
            Some(Term::Datum(Datum::Bool(b))) => Some(*b),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Term)> {
        self.0.iter()
    }
}

/// How a pseudo-type is surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PseudoFormat {
    /// Convert to the native value (default).
    #[default]
    Native,
    /// Leave the wire representation untouched.
    Raw,
}

/// Per-pseudo-type format selection, extracted from a query's options.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FormatOptions {
    pub binary: PseudoFormat,
    pub time: PseudoFormat,
    pub group: PseudoFormat,
    pub geometry: PseudoFormat,
}

impl FormatOptions {
    pub fn from_opt_args(opts: &OptArgs) -> Result<FormatOptions> {
        Ok(FormatOptions {
            binary: Self::extract(opts, "binary_format")?,
            time: Self::extract(opts, "time_format")?,
            group: Self::extract(opts, "group_format")?,
            geometry: Self::extract(opts, "geometry_format")?,
        })
    }

    fn extract(opts: &OptArgs, name: &str) -> Result<PseudoFormat> {
        match opts.get(name) {
            None => Ok(PseudoFormat::Native),
            Some(Term::Datum(Datum::String(s))) if s == "native" => Ok(PseudoFormat::Native),
            Some(Term::Datum(Datum::String(s))) if s == "raw" => Ok(PseudoFormat::Raw),
            Some(Term::Datum(Datum::String(s))) => Err(Error::driver(format!(
                "Unknown {name} run option {s:?}."
            ))),
            Some(other) => Err(Error::driver(format!(
                "Unknown {name} run option {:?}.",
                other
            ))),
        }
    }
}

fn number_from_f64(value: f64) -> Result<Number> {
    Number::from_f64(value)
        .ok_or_else(|| Error::driver(format!("Cannot serialize non-finite number: {value}")))
}

fn parse_timezone(tz: &str) -> Result<FixedOffset> {
    let bad = || Error::driver(format!("Invalid timezone string {tz:?}."));
    let (sign, rest) = match tz.as_bytes().first() {
        Some(b'+') => (1i32, &tz[1..]),
        Some(b'-') => (-1i32, &tz[1..]),
        _ => return Err(bad()),
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(bad)?;
    let hours: i32 = hours.parse().map_err(|_| bad())?;
    let minutes: i32 = minutes.parse().map_err(|_| bad())?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(bad)
}

fn format_timezone(offset: &FixedOffset) -> String {
    let secs = offset.local_minus_utc();
    let sign = if secs < 0 { '-' } else { '+' };
    let abs = secs.abs();
    format!("{}{:02}:{:02}", sign, abs / 3600, (abs % 3600) / 60)
}

fn time_from_epoch(epoch: f64, offset: FixedOffset) -> Result<DateTime<FixedOffset>> {
    let secs = epoch.div_euclid(1.0);
    let nanos = (epoch.rem_euclid(1.0) * 1e9).round() as u32;
    DateTime::<Utc>::from_timestamp(secs as i64, nanos.min(999_999_999))
        .map(|dt| dt.with_timezone(&offset))
        .ok_or_else(|| Error::driver(format!("Invalid epoch time {epoch}.")))
}

fn epoch_from_time(time: &DateTime<FixedOffset>) -> f64 {
    time.timestamp() as f64 + f64::from(time.timestamp_subsec_nanos()) / 1e9
}

/// Encode a datum into its wire JSON form, spelling pseudo-type values as
/// tagged objects. Rejects NaN and infinities.
pub fn datum_to_wire(datum: &Datum) -> Result<Value> {
    Ok(match datum {
        Datum::Null => Value::Null,
        Datum::Bool(b) => Value::Bool(*b),
        Datum::Int(i) => Value::Number(Number::from(*i)),
        Datum::Float(f) => Value::Number(number_from_f64(*f)?),
        Datum::String(s) => Value::String(s.clone()),
        Datum::Array(items) => {
            Value::Array(items.iter().map(datum_to_wire).collect::<Result<_>>()?)
        }
        Datum::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), datum_to_wire(v)?);
            }
            Value::Object(out)
        }
        Datum::Binary(bytes) => {
            let mut out = Map::new();
            out.insert(REQL_TYPE_KEY.to_string(), Value::String("BINARY".to_string()));
            out.insert("data".to_string(), Value::String(BASE64.encode(bytes)));
            Value::Object(out)
        }
        Datum::Time(time) => {
            let mut out = Map::new();
            out.insert(REQL_TYPE_KEY.to_string(), Value::String("TIME".to_string()));
            out.insert(
                "epoch_time".to_string(),
                Value::Number(number_from_f64(epoch_from_time(time))?),
            );
            out.insert(
                "timezone".to_string(),
                Value::String(format_timezone(time.offset())),
            );
            Value::Object(out)
        }
        Datum::Grouped(groups) => {
            let mut data = Vec::with_capacity(groups.len());
            for (k, v) in groups {
                data.push(Value::Array(vec![
                    datum_to_wire(&k.to_datum())?,
                    datum_to_wire(v)?,
                ]));
            }
            let mut out = Map::new();
            out.insert(
                REQL_TYPE_KEY.to_string(),
                Value::String("GROUPED_DATA".to_string()),
            );
            out.insert("data".to_string(), Value::Array(data));
            Value::Object(out)
        }
    })
}

/// Encode a term into its wire JSON form: `[tag, [args...], {opts...}]` for
/// operations, the raw value for datum leaves (arrays become MAKE_ARRAY ops
/// so the server never mistakes data for a term).
pub fn term_to_wire(term: &Term) -> Result<Value> {
    match term {
        Term::Datum(Datum::Array(items)) => {
            let args: Vec<Value> = items
                .iter()
                .map(|d| term_to_wire(&Term::Datum(d.clone())))
                .collect::<Result<_>>()?;
            Ok(Value::Array(vec![
                Value::Number(Number::from(term_type::MAKE_ARRAY)),
                Value::Array(args),
            ]))
        }
        Term::Datum(Datum::Object(map)) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), term_to_wire(&Term::Datum(v.clone()))?);
            }
            Ok(Value::Object(out))
        }
        Term::Datum(datum) => datum_to_wire(datum),
        Term::Op { tag, args, opts } => {
            let wire_args: Vec<Value> = args.iter().map(term_to_wire).collect::<Result<_>>()?;
            let mut wire_opts = Map::new();
            for (k, v) in opts {
                wire_opts.insert(k.clone(), term_to_wire(v)?);
            }
            Ok(Value::Array(vec![
                Value::Number(Number::from(*tag)),
                Value::Array(wire_args),
                Value::Object(wire_opts),
            ]))
        }
    }
}

/// Decode a wire JSON value into a datum, reconstructing pseudo-types
/// according to the query's format options. Conversion is bottom-up: children
/// are decoded before the enclosing object's pseudo-type tag is considered.
pub fn wire_to_datum(value: &Value, fmt: &FormatOptions) -> Result<Datum> {
    Ok(match value {
        Value::Null => Datum::Null,
        Value::Bool(b) => Datum::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Datum::Int(i)
            } else {
                Datum::Float(n.as_f64().ok_or_else(|| {
                    Error::driver(format!("Cannot decode number {n} in a response."))
                })?)
            }
        }
        Value::String(s) => Datum::String(s.clone()),
        Value::Array(items) => Datum::Array(
            items
                .iter()
                .map(|v| wire_to_datum(v, fmt))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => {
            let mut children = BTreeMap::new();
            for (k, v) in map {
                children.insert(k.clone(), wire_to_datum(v, fmt)?);
            }
            match map.get(REQL_TYPE_KEY) {
                None => Datum::Object(children),
                Some(tag) => convert_pseudo_type(value, tag, children, fmt)?,
            }
        }
    })
}

fn convert_pseudo_type(
    raw: &Value,
    tag: &Value,
    children: BTreeMap<String, Datum>,
    fmt: &FormatOptions,
) -> Result<Datum> {
    let tag = match tag.as_str() {
        Some(tag) => tag,
        None => {
            return Err(Error::driver(format!("Unknown pseudo-type {tag:?}.")));
        }
    };
    match tag {
        "BINARY" => match fmt.binary {
            PseudoFormat::Raw => Ok(Datum::Object(children)),
            PseudoFormat::Native => match children.get("data") {
                Some(Datum::String(data)) => BASE64
                    .decode(data.as_bytes())
                    .map(Datum::Binary)
                    .map_err(|e| Error::driver(format!("Invalid base64 in BINARY object: {e}"))),
                _ => Err(Error::driver(format!(
                    "pseudo-type BINARY object {raw} does not have the expected field \"data\"."
                ))),
            },
        },
        "TIME" => match fmt.time {
            PseudoFormat::Raw => Ok(Datum::Object(children)),
            PseudoFormat::Native => {
                let epoch = match children.get("epoch_time") {
                    Some(Datum::Int(i)) => *i as f64,
                    Some(Datum::Float(f)) => *f,
                    _ => {
                        return Err(Error::driver(format!(
                            "pseudo-type TIME object {raw} does not have expected field \
                             \"epoch_time\"."
                        )))
                    }
                };
                let offset = match children.get("timezone") {
                    Some(Datum::String(tz)) => parse_timezone(tz)?,
                    _ => FixedOffset::east_opt(0).expect("zero offset"),
                };
                Ok(Datum::Time(time_from_epoch(epoch, offset)?))
            }
        },
        "GROUPED_DATA" => match fmt.group {
            PseudoFormat::Raw => Ok(Datum::Object(children)),
            PseudoFormat::Native => match children.get("data") {
                Some(Datum::Array(pairs)) => {
                    let mut groups = BTreeMap::new();
                    for pair in pairs {
                        match pair {
                            Datum::Array(kv) if kv.len() == 2 => {
                                groups.insert(GroupKey::from_datum(&kv[0]), kv[1].clone());
                            }
                            _ => {
                                return Err(Error::driver(
                                    "Malformed GROUPED_DATA entry in a response.".to_string(),
                                ))
                            }
                        }
                    }
                    Ok(Datum::Grouped(groups))
                }
                _ => Err(Error::driver(format!(
                    "pseudo-type GROUPED_DATA object {raw} does not have the expected field \
                     \"data\"."
                ))),
            },
        },
        // Geometry has no richer native form; both formats keep the object,
        // but an invalid format option must still have been rejected upstream.
        "GEOMETRY" => Ok(Datum::Object(children)),
        other => Err(Error::driver(format!("Unknown pseudo-type {other:?}."))),
    }
}

/// A query envelope, serialized immediately after construction.
#[derive(Debug, Clone)]
pub struct Query {
    pub query_type: u64,
    pub token: u64,
    pub term: Option<Term>,
    pub options: OptArgs,
}

impl Query {
    pub fn start(token: u64, term: Term, options: OptArgs) -> Query {
        Query {
            query_type: query_type::START,
            token,
            term: Some(term),
            options,
        }
    }

    pub fn continue_(token: u64) -> Query {
        Query::control(query_type::CONTINUE, token)
    }

    pub fn stop(token: u64) -> Query {
        Query::control(query_type::STOP, token)
    }

    pub fn noreply_wait(token: u64) -> Query {
        Query::control(query_type::NOREPLY_WAIT, token)
    }

    pub fn server_info(token: u64) -> Query {
        Query::control(query_type::SERVER_INFO, token)
    }

    fn control(query_type: u64, token: u64) -> Query {
        Query {
            query_type,
            token,
            term: None,
            options: OptArgs::new(),
        }
    }

    /// Serialize to the framed wire form. Empty options and a missing term
    /// are omitted from the JSON payload.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut parts = vec![Value::Number(Number::from(self.query_type))];
        if let Some(term) = &self.term {
            parts.push(term_to_wire(term)?);
        }
        if !self.options.is_empty() {
            let mut opts = Map::new();
            for (k, v) in self.options.iter() {
                opts.insert(k.clone(), term_to_wire(v)?);
            }
            parts.push(Value::Object(opts));
        }
        let payload = serde_json::to_vec(&Value::Array(parts))
            .map_err(|e| Error::driver(format!("Could not serialize query: {e}")))?;
        let mut message = Vec::with_capacity(HEADER_SIZE + payload.len());
        message.extend_from_slice(&build_header(self.token, payload.len() as u32));
        message.extend_from_slice(&payload);
        Ok(message)
    }
}

/// A response envelope, parsed from one frame and consumed by the router.
#[derive(Debug, Clone)]
pub struct Response {
    pub token: u64,
    pub response_type: u64,
    pub data: Vec<Datum>,
    pub backtrace: Option<Vec<i64>>,
    pub profile: Option<Datum>,
    pub error_type: Option<u64>,
}

impl Response {
    pub fn parse(token: u64, payload: &[u8], fmt: &FormatOptions) -> Result<Response> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| Error::driver(format!("Could not decode response: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| Error::driver("Response is not a JSON object.".to_string()))?;
        let response_type = obj
            .get("t")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::driver("Response is missing its type field.".to_string()))?;
        let data = obj
            .get("r")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::driver("Response is missing its data field.".to_string()))?
            .iter()
            .map(|v| wire_to_datum(v, fmt))
            .collect::<Result<Vec<_>>>()?;
        let backtrace = match obj.get("b") {
            Some(Value::Array(frames)) => Some(
                frames
                    .iter()
                    .map(|f| {
                        f.as_i64().ok_or_else(|| {
                            Error::driver("Response backtrace frame is not an integer.".to_string())
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            _ => None,
        };
        let profile = match obj.get("p") {
            Some(p) => Some(wire_to_datum(p, fmt)?),
            None => None,
        };
        let error_type = obj.get("e").and_then(Value::as_u64);
        Ok(Response {
            token,
            response_type,
            data,
            backtrace,
            profile,
            error_type,
        })
    }

}

/// Compose a typed error from an error response. The error-type field is
/// only consulted to pick the runtime kind; client and compile errors never
/// carry one.
pub fn make_error(res: &Response, term: Option<&Term>) -> Error {
    let message = res
        .data
        .first()
        .and_then(Datum::as_str)
        .unwrap_or("Unknown error")
        .to_string();
    let context = ServerError::new(message, term.cloned(), res.backtrace.clone());
    match res.response_type {
        response_type::CLIENT_ERROR => Error::Driver(context.to_string()),
        response_type::COMPILE_ERROR => Error::Compile(context),
        response_type::RUNTIME_ERROR => Error::Runtime(RuntimeError {
            kind: RuntimeErrorKind::from_wire(res.error_type),
            error: context,
        }),
        other => Error::driver(format!(
            "Unknown Response type {other} encountered in a response."
        )),
    }
}

/// What a completed single-shot query resolved to.
#[derive(Debug)]
pub enum Outcome {
    Atom(Datum),
    Feed(Response),
    ServerInfo(Datum),
    WaitComplete,
}

/// Classify a response for the caller of run. Error responses become typed
/// errors carrying the original term.
pub fn classify(mut res: Response, term: Option<&Term>) -> Result<Outcome> {
    match res.response_type {
        response_type::SUCCESS_ATOM => {
            if res.data.is_empty() {
                return Err(Error::driver(
                    "SUCCESS_ATOM response carried no data.".to_string(),
                ));
            }
            Ok(Outcome::Atom(res.data.remove(0)))
        }
        response_type::SUCCESS_SEQUENCE | response_type::SUCCESS_PARTIAL => Ok(Outcome::Feed(res)),
        response_type::SERVER_INFO => {
            if res.data.is_empty() {
                return Err(Error::driver(
                    "SERVER_INFO response carried no data.".to_string(),
                ));
            }
            Ok(Outcome::ServerInfo(res.data.remove(0)))
        }
        response_type::WAIT_COMPLETE => Ok(Outcome::WaitComplete),
        _ => Err(make_error(&res, term)),
    }
}

/// Wrap a value with its profiling data when the server attached any.
pub fn maybe_profile(value: Datum, profile: Option<Datum>) -> Datum {
    match profile {
        Some(profile) => {
            let mut out = BTreeMap::new();
            out.insert("value".to_string(), value);
            out.insert("profile".to_string(), profile);
            Datum::Object(out)
        }
        None => value,
    }
}

/// Result of running a term: a single value, a streamed cursor, or nothing
/// (noreply runs and wait-complete acknowledgements).
#[derive(Debug)]
pub enum RunResult<C> {
    Atom(Datum),
    Cursor(C),
    Done,
}

impl<C> RunResult<C> {
    pub fn into_atom(self) -> Option<Datum> {
        match self {
            RunResult::Atom(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_cursor(self) -> Option<C> {
        match self {
            RunResult::Cursor(c) => Some(c),
            _ => None,
        }
    }
}
