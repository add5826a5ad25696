//! Lazy, pull-based result streaming.
//!
//! `CursorBuf` is the scheduler-agnostic core: a buffer of decoded items, the
//! count of in-flight CONTINUE requests, the prefetch threshold, and a sticky
//! stop marker. Both the blocking cursor here and the async cursor in
//! net_async drive the same struct; only the waiting primitive differs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::errors::{Error, Result};
use crate::net::InstanceShared;
use crate::protocol::response_type;
use crate::protocol_core::{make_error, FormatOptions, Response};
use crate::term::{Datum, Term};

/// Why a cursor stopped. Exhaustion is an expected terminal state, kept
/// statically distinct from real failure so iteration termination and errors
/// can never be confused.
#[derive(Debug)]
pub(crate) enum CursorStop {
    Exhausted,
    Failed(Error),
}

/// Shared cursor state. The stop marker transitions from `None` to `Some`
/// exactly once and never back; buffered items drain before it surfaces.
#[derive(Debug)]
pub(crate) struct CursorBuf {
    pub items: VecDeque<Datum>,
    pub outstanding_requests: u32,
    pub threshold: usize,
    pub stop: Option<CursorStop>,
}

impl CursorBuf {
    pub fn new() -> CursorBuf {
        CursorBuf {
            items: VecDeque::new(),
            outstanding_requests: 0,
            threshold: 1,
            stop: None,
        }
    }

    /// Fold one response batch into the buffer. The threshold tracks the
    /// just-received batch size (floored at one so an empty changefeed batch
    /// still triggers the next prefetch).
    pub fn extend(&mut self, res: Response, term: Option<&Term>) {
        self.threshold = res.data.len().max(1);
        if self.stop.is_none() {
            match res.response_type {
                response_type::SUCCESS_PARTIAL => {
                    self.items.extend(res.data);
                }
                response_type::SUCCESS_SEQUENCE => {
                    self.items.extend(res.data);
                    self.stop = Some(CursorStop::Exhausted);
                }
                _ => {
                    self.stop = Some(CursorStop::Failed(make_error(&res, term)));
                }
            }
        }
    }

    /// Record a failure; first stop state wins.
    pub fn fail(&mut self, error: Error) {
        if self.stop.is_none() {
            self.stop = Some(CursorStop::Failed(error));
        }
    }

    /// Mark the cursor exhausted; returns whether this call changed state.
    pub fn mark_exhausted(&mut self) -> bool {
        if self.stop.is_none() {
            self.stop = Some(CursorStop::Exhausted);
            true
        } else {
            false
        }
    }

    /// Whether a CONTINUE should be issued now. At most one request is ever
    /// outstanding per cursor.
    pub fn should_fetch(&self) -> bool {
        self.stop.is_none() && self.items.len() < self.threshold && self.outstanding_requests == 0
    }

    /// Pop the next outcome if one is ready: a buffered item, the end of the
    /// sequence, or the stored error. `None` means the caller must wait.
    pub fn next_ready(&mut self) -> Option<Result<Option<Datum>>> {
        if let Some(item) = self.items.pop_front() {
            return Some(Ok(Some(item)));
        }
        match &self.stop {
            Some(CursorStop::Exhausted) => Some(Ok(None)),
            Some(CursorStop::Failed(error)) => Some(Err(error.clone())),
            None => None,
        }
    }

    /// Whether the routing-table entry can be dropped.
    pub fn finished(&self) -> bool {
        self.outstanding_requests == 0 && self.stop.is_some()
    }

    /// Whether `next` would yield an item or a real error (used by the async
    /// cursor's fetch_next).
    pub fn has_pending(&self) -> bool {
        !self.items.is_empty() || matches!(self.stop, Some(CursorStop::Failed(_)))
    }
}

/// Cursor state shared between the dispatch loop and the caller's handle.
pub(crate) struct CursorShared {
    pub buf: Mutex<CursorBuf>,
    pub cond: Condvar,
    pub fmt: FormatOptions,
    pub term: Option<Term>,
}

impl CursorShared {
    pub fn new(fmt: FormatOptions, term: Option<Term>) -> CursorShared {
        CursorShared {
            buf: Mutex::new(CursorBuf::new()),
            cond: Condvar::new(),
            fmt,
            term,
        }
    }
}

/// A blocking, pull-based stream of results.
///
/// Finite cursors end with `Ok(None)`; changefeeds never do. Dropping the
/// cursor sends a best-effort STOP so the server can release the stream.
pub struct Cursor {
    shared: Arc<CursorShared>,
    conn: Arc<InstanceShared>,
    token: u64,
    profile: Option<Datum>,
}

impl Cursor {
    /// Register the cursor and fold in the first response. Runs before any
    /// CONTINUE can be sent, so no frame for this token can race the
    /// registration.
    pub(crate) fn create(
        conn: Arc<InstanceShared>,
        token: u64,
        fmt: FormatOptions,
        term: Option<Term>,
        first_response: Response,
        profile: Option<Datum>,
    ) -> Cursor {
        let shared = Arc::new(CursorShared::new(fmt, term));
        conn.register_cursor(token, shared.clone());
        let finished = {
            let mut buf = shared.buf.lock();
            buf.extend(first_response, shared.term.as_ref());
            buf.finished()
        };
        if finished {
            conn.unregister_cursor(token);
        }
        Cursor {
            shared,
            conn,
            token,
            profile,
        }
    }

    /// Profiling data from the response that opened this cursor, if the
    /// query ran with `profile: true`.
    pub fn profile(&self) -> Option<&Datum> {
        self.profile.as_ref()
    }

    /// Pull the next item, waiting up to `timeout` (forever when `None`).
    /// Returns `Ok(None)` once the sequence is exhausted.
    pub fn next(&mut self, timeout: Option<Duration>) -> Result<Option<Datum>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let mut buf = self.shared.buf.lock();
            if let Some(outcome) = buf.next_ready() {
                return outcome;
            }

            if buf.should_fetch() {
                buf.outstanding_requests += 1;
                drop(buf);
                if let Err(error) = self.conn.send_continue(self.token) {
                    let mut buf = self.shared.buf.lock();
                    buf.outstanding_requests -= 1;
                    buf.fail(error);
                }
                continue;
            }

            match deadline {
                None => self.shared.cond.wait(&mut buf),
                Some(deadline) => {
                    if self.shared.cond.wait_until(&mut buf, deadline).timed_out() {
                        if let Some(outcome) = buf.next_ready() {
                            return outcome;
                        }
                        return Err(Error::timeout(None));
                    }
                }
            }
        }
    }

    /// Close the cursor. Idempotent. Only a cursor that was still streaming
    /// sends a STOP; its acknowledgement flows through the normal dispatch
    /// path and clears the routing entry.
    pub fn close(&mut self) -> Result<()> {
        let send_stop = {
            let mut buf = self.shared.buf.lock();
            if buf.mark_exhausted() && self.conn.is_open() {
                buf.outstanding_requests += 1;
                true
            } else {
                false
            }
        };
        if send_stop {
            if let Err(error) = self.conn.send_stop(self.token) {
                let mut buf = self.shared.buf.lock();
                buf.outstanding_requests -= 1;
                return Err(error);
            }
        }
        Ok(())
    }

    /// Iterator adaptor; yields items until exhaustion, surfacing a stored
    /// error as a final `Err` item.
    pub fn iter(&mut self) -> CursorIter<'_> {
        CursorIter {
            cursor: self,
            done: false,
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buf = self.shared.buf.lock();
        let status = match &buf.stop {
            None => "streaming".to_string(),
            Some(CursorStop::Exhausted) => "done streaming".to_string(),
            Some(CursorStop::Failed(error)) => format!("error: {error}"),
        };
        f.debug_struct("Cursor")
            .field("token", &self.token)
            .field("buffered", &buf.items.len())
            .field("status", &status)
            .finish()
    }
}

pub struct CursorIter<'a> {
    cursor: &'a mut Cursor,
    done: bool,
}

impl Iterator for CursorIter<'_> {
    type Item = Result<Datum>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.cursor.next(None) {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(error) => {
                self.done = true;
                Some(Err(error))
            }
        }
    }
}
