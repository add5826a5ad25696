//! Async (Tokio) connection implementation.
//!
//! The same dispatch state machine as net.rs under a cooperative scheduler:
//! a reader task owns the read half of the stream and routes frames by token
//! to oneshot waiters or cursor buffers; callers suspend instead of blocking.
//! All cursor buffering logic is the shared `CursorBuf` core.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::Mutex;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use crate::cursor::CursorBuf;
use crate::errors::{Error, Result};
use crate::handshake::Handshake;
use crate::net::ConnectOptions;
use crate::protocol::HEADER_SIZE;
use crate::protocol_core::{
    classify, maybe_profile, parse_header, FormatOptions, OptArgs, Outcome, Query, Response,
    RunResult,
};
use crate::term::{Datum, Term};
use crate::tls;

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;
type FrameReader = BufReader<ReadHalf<BoxedStream>>;

struct AsyncWaiter {
    fmt: FormatOptions,
    tx: oneshot::Sender<Result<Response>>,
}

/// Cursor state shared between the reader task and cursor handles. Same
/// buffer core as the blocking side; wakeups go through a Notify instead of
/// a condvar.
struct AsyncCursorShared {
    buf: Mutex<CursorBuf>,
    notify: Notify,
    fmt: FormatOptions,
    term: Option<Term>,
}

impl AsyncCursorShared {
    fn new(fmt: FormatOptions, term: Option<Term>) -> AsyncCursorShared {
        AsyncCursorShared {
            buf: Mutex::new(CursorBuf::new()),
            notify: Notify::new(),
            fmt,
            term,
        }
    }
}

struct AsyncInstanceShared {
    writer: AsyncMutex<WriteHalf<BoxedStream>>,
    waiters: Mutex<HashMap<u64, AsyncWaiter>>,
    cursors: Mutex<HashMap<u64, Arc<AsyncCursorShared>>>,
    closing: AtomicBool,
    host: String,
    port: u16,
}

impl AsyncInstanceShared {
    fn is_open(&self) -> bool {
        !self.closing.load(Ordering::SeqCst)
    }

    async fn send_bytes(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        result.map_err(|e| {
            self.closing.store(true, Ordering::SeqCst);
            Error::driver(format!("Error sending to {}:{} - {e}", self.host, self.port))
        })
    }

    async fn send_continue(&self, token: u64) -> Result<()> {
        self.send_bytes(&Query::continue_(token).serialize()?).await
    }

    async fn send_stop(&self, token: u64) -> Result<()> {
        self.send_bytes(&Query::stop(token).serialize()?).await
    }

    async fn run_query(
        &self,
        query: Query,
        fmt: FormatOptions,
        noreply: bool,
    ) -> Result<Option<Response>> {
        let token = query.token;
        let bytes = query.serialize()?;
        if noreply {
            self.send_bytes(&bytes).await?;
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(token, AsyncWaiter { fmt, tx });
        if let Err(error) = self.send_bytes(&bytes).await {
            self.waiters.lock().remove(&token);
            return Err(error);
        }
        match rx.await {
            Ok(result) => result.map(Some),
            Err(_) => Err(Error::driver("Connection is closed.")),
        }
    }

    fn fan_out(&self, error: &Error) {
        let waiters: Vec<AsyncWaiter> = self.waiters.lock().drain().map(|(_, w)| w).collect();
        for waiter in waiters {
            let _ = waiter.tx.send(Err(error.clone()));
        }
        let cursors: Vec<Arc<AsyncCursorShared>> =
            self.cursors.lock().drain().map(|(_, c)| c).collect();
        for cursor in cursors {
            cursor.buf.lock().fail(error.clone());
            cursor.notify.notify_waiters();
        }
    }

    /// Kill the connection from the reader task: resolve everything
    /// outstanding with the failure, then tear down the write half.
    async fn fatal(&self, error: Error) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            warn!("connection failed: {error}");
        }
        let fan_out_error = match &error {
            Error::Driver(message) if message.as_str() == "Connection is closed." => error.clone(),
            other => Error::driver(format!("Connection is closed ({other}).")),
        };
        self.fan_out(&fan_out_error);
        let _ = self.writer.lock().await.shutdown().await;
    }

    /// Orderly close, mirroring the blocking implementation. The closing
    /// flag goes up first so in-flight reads for already-resolved tokens
    /// are not mistaken for protocol violations.
    async fn close(&self, noreply_wait: bool, token: u64) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.fan_out(&Error::driver("Connection is closed."));

        let mut result = Ok(());
        if noreply_wait {
            result = self
                .run_query(Query::noreply_wait(token), FormatOptions::default(), false)
                .await
                .map(|_| ());
        }
        let _ = self.writer.lock().await.shutdown().await;
        result
    }

    async fn dispatch(&self, token: u64, payload: Vec<u8>) -> Result<()> {
        trace!("frame token={token} len={}", payload.len());

        let cursor = self.cursors.lock().get(&token).cloned();
        if let Some(cursor) = cursor {
            let response = Response::parse(token, &payload, &cursor.fmt)?;
            let (finished, fetch) = {
                let mut buf = cursor.buf.lock();
                buf.outstanding_requests = buf.outstanding_requests.saturating_sub(1);
                buf.extend(response, cursor.term.as_ref());
                let fetch = buf.should_fetch();
                if fetch {
                    buf.outstanding_requests += 1;
                }
                (buf.finished(), fetch)
            };
            if fetch {
                if let Err(error) = self.send_continue(token).await {
                    let mut buf = cursor.buf.lock();
                    buf.outstanding_requests -= 1;
                    buf.fail(error);
                }
            }
            if finished {
                self.cursors.lock().remove(&token);
            }
            cursor.notify.notify_waiters();
            return Ok(());
        }

        let fmt = self.waiters.lock().get(&token).map(|w| w.fmt);
        match fmt {
            Some(fmt) => {
                let response = Response::parse(token, &payload, &fmt)?;
                if let Some(waiter) = self.waiters.lock().remove(&token) {
                    let _ = waiter.tx.send(Ok(response));
                }
                Ok(())
            }
            None => {
                if self.closing.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err(Error::driver("Unexpected response received."))
                }
            }
        }
    }

    /// The reader task: forwards every frame to the matching waiter or
    /// cursor until the stream ends or the protocol desynchronizes.
    async fn reader_loop(self: Arc<Self>, mut reader: FrameReader) {
        loop {
            let mut header = [0u8; HEADER_SIZE];
            if let Err(e) = reader.read_exact(&mut header).await {
                if !self.closing.load(Ordering::SeqCst) {
                    self.fatal(Error::driver(e.to_string())).await;
                }
                return;
            }
            let frame = async {
                let (token, length) = parse_header(&header)?;
                let mut payload = vec![0u8; length];
                reader
                    .read_exact(&mut payload)
                    .await
                    .map_err(|e| Error::driver(e.to_string()))?;
                Ok::<_, Error>((token, payload))
            }
            .await;
            let (token, payload) = match frame {
                Ok(frame) => frame,
                Err(error) => {
                    if !self.closing.load(Ordering::SeqCst) {
                        self.fatal(error).await;
                    }
                    return;
                }
            };
            if let Err(error) = self.dispatch(token, payload).await {
                self.fatal(error).await;
                return;
            }
        }
    }
}

struct AsyncInstance {
    shared: Arc<AsyncInstanceShared>,
    reader: Option<JoinHandle<()>>,
}

impl AsyncInstance {
    async fn connect(options: &ConnectOptions, handshake: &mut Handshake) -> Result<AsyncInstance> {
        let endpoint = (options.host.as_str(), options.port);
        match tokio::time::timeout(options.timeout, Self::connect_inner(options, handshake)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(Some(endpoint))),
        }
    }

    async fn connect_inner(
        options: &ConnectOptions,
        handshake: &mut Handshake,
    ) -> Result<AsyncInstance> {
        let connect_err = |e: &dyn std::fmt::Display| {
            Error::driver(format!(
                "Could not connect to {}:{}. Error: {e}",
                options.host, options.port
            ))
        };

        let tcp = TcpStream::connect((options.host.as_str(), options.port))
            .await
            .map_err(|e| connect_err(&e))?;
        tcp.set_nodelay(true).ok();

        let stream: BoxedStream = match &options.tls {
            None => Box::new(tcp),
            Some(opts) => {
                let config = tls::client_config(opts)?;
                let name = tls::server_name_for(&options.host)?;
                let connector = TlsConnector::from(Arc::new(config));
                let tls_stream = connector
                    .connect(name, tcp)
                    .await
                    .map_err(|e| Error::driver(format!("TLS handshake failed: {e}")))?;
                Box::new(tls_stream)
            }
        };
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        handshake.reset();
        let mut response: Option<Vec<u8>> = None;
        loop {
            match handshake.next_message(response.as_deref())? {
                None => break,
                Some(message) => {
                    if !message.is_empty() {
                        writer.write_all(&message).await.map_err(|e| connect_err(&e))?;
                        writer.flush().await.map_err(|e| connect_err(&e))?;
                    }
                    let mut buf = Vec::new();
                    let read = reader
                        .read_until(0, &mut buf)
                        .await
                        .map_err(|e| connect_err(&e))?;
                    if read == 0 || buf.pop() != Some(0) {
                        return Err(Error::driver("Connection is closed."));
                    }
                    response = Some(buf);
                }
            }
        }
        debug!(
            "handshake with {}:{} complete",
            options.host, options.port
        );

        let shared = Arc::new(AsyncInstanceShared {
            writer: AsyncMutex::new(writer),
            waiters: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
            host: options.host.clone(),
            port: options.port,
        });
        let reader_task = tokio::spawn(shared.clone().reader_loop(reader));
        Ok(AsyncInstance {
            shared,
            reader: Some(reader_task),
        })
    }
}

impl Drop for AsyncInstance {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Async user-facing connection handle.
///
/// Methods take `&self`; tasks may share one connection (in an `Arc`) and
/// issue queries concurrently, exactly as the blocking handle allows.
pub struct AsyncConnection {
    options: ConnectOptions,
    db: Mutex<Option<String>>,
    handshake: AsyncMutex<Handshake>,
    instance: AsyncMutex<Option<AsyncInstance>>,
    next_token: AtomicU64,
}

impl AsyncConnection {
    /// Connect and authenticate.
    pub async fn connect(options: ConnectOptions) -> Result<AsyncConnection> {
        let handshake = Handshake::new(
            &options.host,
            options.port,
            &options.user,
            &options.password,
        );
        let connection = AsyncConnection {
            db: Mutex::new(options.db.clone()),
            options,
            handshake: AsyncMutex::new(handshake),
            instance: AsyncMutex::new(None),
            next_token: AtomicU64::new(0),
        };
        connection.open_instance().await?;
        Ok(connection)
    }

    async fn open_instance(&self) -> Result<()> {
        let mut handshake = self.handshake.lock().await;
        let instance = AsyncInstance::connect(&self.options, &mut handshake).await?;
        *self.instance.lock().await = Some(instance);
        self.next_token.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Close any existing instance, then establish a fresh one.
    pub async fn reconnect(&self) -> Result<()> {
        if let Err(error) = self.close(false).await {
            debug!("discarding close error during reconnect: {error}");
        }
        self.open_instance().await
    }

    pub async fn close(&self, noreply_wait: bool) -> Result<()> {
        match self.instance.lock().await.take() {
            None => Ok(()),
            Some(mut instance) => {
                let token = self.new_token();
                let result = instance.shared.close(noreply_wait, token).await;
                if let Some(reader) = instance.reader.take() {
                    // Everything outstanding is already resolved; the reader
                    // has nothing left to deliver.
                    reader.abort();
                    let _ = reader.await;
                }
                self.next_token.store(0, Ordering::SeqCst);
                result
            }
        }
    }

    pub async fn is_open(&self) -> bool {
        self.instance
            .lock()
            .await
            .as_ref()
            .map(|i| i.shared.is_open())
            .unwrap_or(false)
    }

    /// The current instance's shared state, or a closed-connection error.
    async fn open_shared(&self) -> Result<Arc<AsyncInstanceShared>> {
        match self.instance.lock().await.as_ref() {
            Some(instance) if instance.shared.is_open() => Ok(instance.shared.clone()),
            _ => Err(Error::driver("Connection is closed.")),
        }
    }

    pub fn use_db(&self, db: impl Into<String>) {
        *self.db.lock() = Some(db.into());
    }

    fn new_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::SeqCst)
    }

    /// Run a term against the server.
    pub async fn run(&self, term: &Term, options: OptArgs) -> Result<RunResult<AsyncCursor>> {
        let shared = self.open_shared().await?;
        let token = self.new_token();
        let options = crate::net::inject_db(options, self.db.lock().clone().as_deref());
        let noreply = options.get_bool("noreply").unwrap_or(false);
        let fmt = FormatOptions::from_opt_args(&options)?;
        let query = Query::start(token, term.clone(), options);

        match shared.run_query(query, fmt, noreply).await? {
            None => Ok(RunResult::Done),
            Some(response) => {
                let profile = response.profile.clone();
                match classify(response, Some(term))? {
                    Outcome::Atom(datum) => Ok(RunResult::Atom(maybe_profile(datum, profile))),
                    Outcome::ServerInfo(datum) => Ok(RunResult::Atom(datum)),
                    Outcome::WaitComplete => Ok(RunResult::Done),
                    Outcome::Feed(response) => {
                        let cursor = AsyncCursor::create(
                            shared,
                            token,
                            fmt,
                            Some(term.clone()),
                            response,
                            profile,
                        );
                        Ok(RunResult::Cursor(cursor))
                    }
                }
            }
        }
    }

    /// Ask the server to describe itself.
    pub async fn server_info(&self) -> Result<Datum> {
        let shared = self.open_shared().await?;
        let token = self.new_token();
        let response = shared
            .run_query(Query::server_info(token), FormatOptions::default(), false)
            .await?
            .expect("reply expected");
        match classify(response, None)? {
            Outcome::ServerInfo(datum) | Outcome::Atom(datum) => Ok(datum),
            _ => Err(Error::driver("Unexpected response to SERVER_INFO.")),
        }
    }

    /// Wait until every noreply query sent so far has completed.
    pub async fn noreply_wait(&self) -> Result<()> {
        let shared = self.open_shared().await?;
        let token = self.new_token();
        let response = shared
            .run_query(Query::noreply_wait(token), FormatOptions::default(), false)
            .await?
            .expect("reply expected");
        match classify(response, None)? {
            Outcome::WaitComplete => Ok(()),
            _ => Err(Error::driver("Unexpected response to NOREPLY_WAIT.")),
        }
    }
}

/// An async pull-based stream of results, sharing the blocking cursor's
/// buffering and prefetch core.
pub struct AsyncCursor {
    shared: Arc<AsyncCursorShared>,
    conn: Arc<AsyncInstanceShared>,
    token: u64,
    profile: Option<Datum>,
}

enum NextStep {
    Ready(Result<Option<Datum>>),
    Fetch,
    Wait,
}

impl AsyncCursor {
    fn create(
        conn: Arc<AsyncInstanceShared>,
        token: u64,
        fmt: FormatOptions,
        term: Option<Term>,
        first_response: Response,
        profile: Option<Datum>,
    ) -> AsyncCursor {
        let shared = Arc::new(AsyncCursorShared::new(fmt, term));
        conn.cursors.lock().insert(token, shared.clone());
        let finished = {
            let mut buf = shared.buf.lock();
            buf.extend(first_response, shared.term.as_ref());
            buf.finished()
        };
        if finished {
            conn.cursors.lock().remove(&token);
        }
        AsyncCursor {
            shared,
            conn,
            token,
            profile,
        }
    }

    /// Profiling data from the response that opened this cursor, if any.
    pub fn profile(&self) -> Option<&Datum> {
        self.profile.as_ref()
    }

    /// Pull the next item. Returns `Ok(None)` once the sequence ends.
    pub async fn next(&mut self, timeout: Option<Duration>) -> Result<Option<Datum>> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut buf = self.shared.buf.lock();
                if let Some(outcome) = buf.next_ready() {
                    NextStep::Ready(outcome)
                } else if buf.should_fetch() {
                    buf.outstanding_requests += 1;
                    NextStep::Fetch
                } else {
                    NextStep::Wait
                }
            };

            match step {
                NextStep::Ready(outcome) => return outcome,
                NextStep::Fetch => {
                    if let Err(error) = self.conn.send_continue(self.token).await {
                        let mut buf = self.shared.buf.lock();
                        buf.outstanding_requests -= 1;
                        buf.fail(error);
                    }
                }
                NextStep::Wait => match deadline {
                    None => notified.await,
                    Some(deadline) => {
                        if tokio::time::timeout_at(deadline, notified).await.is_err() {
                            let mut buf = self.shared.buf.lock();
                            if let Some(outcome) = buf.next_ready() {
                                return outcome;
                            }
                            return Err(Error::timeout(None));
                        }
                    }
                },
            }
        }
    }

    /// Wait until `next` would yield without consuming anything. Returns
    /// false exactly when the cursor is exhausted, so callers can loop
    /// without catching an end-of-sequence condition.
    pub async fn fetch_next(&mut self, timeout: Option<Duration>) -> Result<bool> {
        enum FetchStep {
            Ready(bool),
            Fetch,
            Wait,
        }

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut buf = self.shared.buf.lock();
                if !buf.items.is_empty() || buf.stop.is_some() {
                    FetchStep::Ready(buf.has_pending())
                } else if buf.should_fetch() {
                    buf.outstanding_requests += 1;
                    FetchStep::Fetch
                } else {
                    FetchStep::Wait
                }
            };

            match step {
                FetchStep::Ready(pending) => return Ok(pending),
                FetchStep::Fetch => {
                    if let Err(error) = self.conn.send_continue(self.token).await {
                        let mut buf = self.shared.buf.lock();
                        buf.outstanding_requests -= 1;
                        buf.fail(error);
                    }
                }
                FetchStep::Wait => match deadline {
                    None => notified.await,
                    Some(deadline) => {
                        if tokio::time::timeout_at(deadline, notified).await.is_err() {
                            return Err(Error::timeout(None));
                        }
                    }
                },
            }
        }
    }

    /// Close the cursor, sending a STOP if it was still streaming.
    pub async fn close(&mut self) -> Result<()> {
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
            if let Err(error) = self.conn.send_stop(self.token).await {
                let mut buf = self.shared.buf.lock();
                buf.outstanding_requests -= 1;
                return Err(error);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for AsyncCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buf = self.shared.buf.lock();
        let status = match &buf.stop {
            None => "streaming".to_string(),
            Some(crate::cursor::CursorStop::Exhausted) => "done streaming".to_string(),
            Some(crate::cursor::CursorStop::Failed(error)) => format!("error: {error}"),
        };
        f.debug_struct("AsyncCursor")
            .field("token", &self.token)
            .field("buffered", &buf.items.len())
            .field("status", &status)
            .finish()
    }
}
