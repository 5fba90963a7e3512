//! # LDAP Connection
//!
//! One connection multiplexes any number of concurrent operations over a
//! single stream:
//!
//! - Writes go through one `FramedWrite` behind an async mutex, so frames
//!   never interleave.
//! - A background reader decodes frames and hands each to the
//!   [`Dispatcher`], which routes it by message ID. The reader also sweeps
//!   overdue requests.
//! - Bind, StartTLS and unbind take an exclusive permit on the connection.
//!   Every ordinary operation holds a shared permit until its response
//!   stream finishes, so a transition never runs while a request is in flight.
//!
//! Codec and transport failures close the connection and fail every pending
//! request. Non-success result codes only fail the operation that got them.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, Stream, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedRwLockReadGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{ClientConfig, LdapConfig};
use crate::core::codec::LdapCodec;
use crate::error::{constants, LdapError, Result};
use crate::protocol::controls::ControlRegistry;
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::message::{
    oids, AddRequest, BindRequest, BindResponse, CompareRequest, Control, ExtendedRequest,
    ExtendedResponse, LdapMessage, LdapResult, ModifyDnRequest, ModifyRequest, ProtocolOp,
    ResultCode, SearchRequest, SearchResultEntry,
};
use crate::sasl::{SaslClient, SaslRegistry, SaslRequest};
use crate::service::poller::EventPoller;
use crate::service::response::{PendingResponse, ResponseStream};
use crate::transport::{LdapStream, TlsClientConfig};
use crate::utils::metrics::{Metrics, Timer};
use crate::utils::timeout::{deadline_after, with_timeout_error};

type Reader = FramedRead<ReadHalf<LdapStream>, LdapCodec>;
type Writer = FramedWrite<WriteHalf<LdapStream>, LdapCodec>;

/// Lifecycle of a connection.
///
/// `NegotiatingTls` and `Bound` are entered from `Connected`; `Closed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    NegotiatingTls,
    Bound,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::NegotiatingTls => "negotiating-tls",
            ConnectionState::Bound => "bound",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Collected result of a search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResults {
    pub entries: Vec<SearchResultEntry>,
    /// Continuation references, in arrival order
    pub references: Vec<String>,
    pub result: LdapResult,
    /// Controls on the searchResultDone message
    pub controls: Vec<Control>,
}

/// State shared with the reader task
struct Shared {
    dispatcher: Arc<Dispatcher>,
    writer: AsyncMutex<Option<Writer>>,
    state: Mutex<ConnectionState>,
    metrics: Arc<Metrics>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed)
    }

    /// Move to `next` unless already closed; returns the previous state
    fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let Ok(mut state) = self.state.lock() else {
            return ConnectionState::Closed;
        };
        let previous = *state;
        if previous != ConnectionState::Closed && previous != next {
            *state = next;
            debug!(from = %previous, to = %next, "Connection state changed");
        }
        previous
    }

    /// Mark the connection closed and fail every pending request
    fn close<F>(&self, make_error: F)
    where
        F: Fn() -> LdapError,
    {
        let previous = self.set_state(ConnectionState::Closed);
        // A sender mid-write still owns the writer; it fails on its own
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        let failed = self.dispatcher.fail_all(make_error);
        if previous != ConnectionState::Closed {
            info!(pending_failed = failed, "Connection closed");
        }
    }
}

struct ReaderTask {
    cancel: CancellationToken,
    handle: JoinHandle<Option<Reader>>,
}

struct Inner {
    shared: Arc<Shared>,
    config: ClientConfig,
    gate: Arc<RwLock<()>>,
    reader: Mutex<Option<ReaderTask>>,
    tls_active: AtomicBool,
    sasl: SaslRegistry,
    controls: ControlRegistry,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(task) = reader.take() {
                task.cancel.cancel();
            }
        }
        self.shared.close(|| LdapError::ConnectionClosed);
    }
}

/// An LDAP client connection. Cloning shares the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("tls", &self.is_tls())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Connection {
    /// Dial `client.host:client.port`, with LDAPS when `client.use_tls` is set
    #[instrument(skip(config), fields(host = %config.client.host, port = config.client.port))]
    pub async fn connect(config: &LdapConfig) -> Result<Self> {
        let client = &config.client;
        let address = client.address();
        debug!(state = %ConnectionState::Connecting, "Dialing directory server");

        let tcp = with_timeout_error(
            async { TcpStream::connect(&address).await.map_err(LdapError::from) },
            client.connection_timeout,
        )
        .await?;
        tcp.set_nodelay(true)?;

        let mut stream = LdapStream::Plain(tcp);
        if client.use_tls {
            let tls = config.tls_client_config();
            stream = with_timeout_error(stream.upgrade(&tls), client.connection_timeout).await?;
        }

        info!(address = %address, tls = stream.is_tls(), "Connected");
        Self::from_stream(stream, client.clone())
    }

    /// Plain connection to `host:port` with default settings
    pub async fn connect_to(host: &str, port: u16) -> Result<Self> {
        let config = LdapConfig::default_with_overrides(|c| {
            c.client.host = host.to_string();
            c.client.port = port;
        });
        Self::connect(&config).await
    }

    /// Run a connection over an already established stream.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_stream(stream: LdapStream, config: ClientConfig) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Arc::new(Dispatcher::new(
            config.notification_capacity,
            Arc::clone(&metrics),
        ));
        let tls_active = stream.is_tls();
        let (frames, writer) = split(stream, config.max_message_size);

        let shared = Arc::new(Shared {
            dispatcher,
            writer: AsyncMutex::new(Some(writer)),
            state: Mutex::new(ConnectionState::Connecting),
            metrics,
        });

        let connection = Self {
            inner: Arc::new(Inner {
                shared,
                config,
                gate: Arc::new(RwLock::new(())),
                reader: Mutex::new(None),
                tls_active: AtomicBool::new(tls_active),
                sasl: SaslRegistry::new(),
                controls: ControlRegistry::new(),
            }),
        };
        connection.spawn_reader(frames)?;
        connection.inner.shared.set_state(ConnectionState::Connected);
        Ok(connection)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state()
    }

    pub fn is_tls(&self) -> bool {
        self.inner.tls_active.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.shared.metrics
    }

    /// Requests awaiting a terminal response
    pub fn pending_count(&self) -> usize {
        self.inner.shared.dispatcher.pending_count()
    }

    /// SASL mechanisms available to [`sasl_bind`](Self::sasl_bind)
    pub fn sasl_registry(&self) -> &SaslRegistry {
        &self.inner.sasl
    }

    /// Decoders for controls returned by the server
    pub fn control_registry(&self) -> &ControlRegistry {
        &self.inner.controls
    }

    /// Receive unsolicited notifications (message ID 0)
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<LdapMessage> {
        self.inner.shared.dispatcher.subscribe_notifications()
    }

    /// Unsolicited notifications as a stream; a lagging consumer skips what it missed
    pub fn notification_stream(&self) -> impl Stream<Item = LdapMessage> + Send + Unpin {
        tokio_stream::StreamExt::filter_map(
            BroadcastStream::new(self.subscribe_notifications()),
            |item| match item {
                Ok(msg) => Some(msg),
                Err(err @ BroadcastStreamRecvError::Lagged(_)) => {
                    warn!(%err, "Notification stream lagged");
                    None
                }
            },
        )
    }

    // ---- generic request shapes ----

    /// Send a request and wait for its terminal response.
    ///
    /// The response is returned whatever its result code; typed operations
    /// check it.
    pub async fn issue(&self, op: ProtocolOp, controls: Vec<Control>) -> Result<LdapMessage> {
        let mut stream = self.issue_stream(op, controls).await?;
        stream.terminal().await
    }

    /// Send a request and stream every response message
    pub async fn issue_stream(
        &self,
        op: ProtocolOp,
        controls: Vec<Control>,
    ) -> Result<ResponseStream> {
        check_issuable(&op)?;
        let permit = Arc::clone(&self.inner.gate).read_owned().await;
        self.dispatch(op, controls, Some(permit)).await
    }

    /// Send a request without waiting; collect the response later
    pub async fn begin(&self, op: ProtocolOp, controls: Vec<Control>) -> Result<PendingResponse> {
        Ok(PendingResponse::new(self.issue_stream(op, controls).await?))
    }

    /// Start a long-lived search whose fragments are fanned out to subscribers
    pub async fn event_poller(
        &self,
        request: SearchRequest,
        controls: Vec<Control>,
    ) -> Result<EventPoller> {
        let stream = self
            .issue_stream(ProtocolOp::SearchRequest(request), controls)
            .await?;
        Ok(EventPoller::new(
            stream,
            self.inner.config.poll_interval,
            self.inner.config.notification_capacity,
        ))
    }

    // ---- typed operations ----

    /// Simple bind; an empty password is an anonymous or unauthenticated bind
    #[instrument(skip(self, password))]
    pub async fn simple_bind(&self, dn: &str, password: impl Into<Vec<u8>>) -> Result<LdapResult> {
        let _transition = self.inner.gate.write().await;
        self.ensure_open()?;
        let _timer = Timer::start("bind");
        self.inner.shared.metrics.bind_attempt();

        let outcome = self
            .bind_exchange(BindRequest::simple(dn, password))
            .await
            .and_then(|response| response.result.check());
        self.finish_bind("SIMPLE", outcome)
    }

    /// SASL bind, running the mechanism's challenge/response rounds
    #[instrument(skip(self, request), fields(mechanism = %request.mechanism))]
    pub async fn sasl_bind(&self, request: &SaslRequest) -> Result<LdapResult> {
        let _transition = self.inner.gate.write().await;
        self.ensure_open()?;

        let mut client = self
            .inner
            .sasl
            .create(request)
            .ok_or_else(|| LdapError::MechanismUnsupported(request.mechanism.clone()))?;
        let mechanism = client.mechanism_name().to_string();

        let _timer = Timer::start("bind");
        self.inner.shared.metrics.bind_attempt();
        let outcome = self.sasl_exchange(client.as_mut(), &mechanism).await;
        client.dispose();
        self.finish_bind(&mechanism, outcome)
    }

    async fn sasl_exchange(&self, client: &mut dyn SaslClient, mechanism: &str) -> Result<LdapResult> {
        let mut credentials = if client.has_initial_response() {
            Some(client.evaluate_challenge(&[])?)
        } else {
            None
        };

        loop {
            let response = self
                .bind_exchange(BindRequest::sasl("", mechanism, credentials.take()))
                .await?;
            let server_creds = response.server_sasl_creds.unwrap_or_default();

            match response.result.code {
                ResultCode::SaslBindInProgress => {
                    trace!(mechanism, challenge_len = server_creds.len(), "SASL challenge");
                    credentials = Some(client.evaluate_challenge(&server_creds)?);
                }
                ResultCode::Success => {
                    // Final server data (confirmation or rspauth) rides on the success
                    if !client.is_complete() {
                        client.evaluate_challenge(&server_creds)?;
                    }
                    if !client.is_complete() {
                        return Err(LdapError::InvalidState(format!(
                            "{mechanism} exchange ended in state {}",
                            client.state()
                        )));
                    }
                    return Ok(response.result);
                }
                _ => return Err(response.result.to_error()),
            }
        }
    }

    async fn bind_exchange(&self, request: BindRequest) -> Result<BindResponse> {
        let mut stream = self
            .dispatch(ProtocolOp::BindRequest(request), Vec::new(), None)
            .await?;
        match stream.terminal().await?.op {
            ProtocolOp::BindResponse(response) => Ok(response),
            other => Err(unexpected("bindResponse", &other)),
        }
    }

    fn finish_bind(&self, mechanism: &str, outcome: Result<LdapResult>) -> Result<LdapResult> {
        let shared = &self.inner.shared;
        match outcome {
            Ok(result) => {
                shared.metrics.bind_success();
                shared.set_state(ConnectionState::Bound);
                info!(mechanism, "Bind succeeded");
                Ok(result)
            }
            Err(e) => {
                shared.metrics.bind_failed();
                // A failed bind leaves the connection anonymous
                if !e.is_fatal() {
                    shared.set_state(ConnectionState::Connected);
                }
                warn!(
                    mechanism,
                    result_code = e.result_code().map(ResultCode::code),
                    error = %e,
                    "Bind failed"
                );
                Err(e)
            }
        }
    }

    /// Search and collect every entry and reference
    #[instrument(skip(self, request), fields(base = %request.base_dn))]
    pub async fn search(&self, request: SearchRequest) -> Result<SearchResults> {
        let _timer = Timer::start("search");
        let mut stream = self.search_stream(request).await?;
        let mut entries = Vec::new();
        let mut references = Vec::new();

        while let Some(item) = stream.next().await {
            let LdapMessage { op, controls, .. } = item?;
            match op {
                ProtocolOp::SearchResultEntry(entry) => entries.push(entry),
                ProtocolOp::SearchResultReference(uris) => references.extend(uris),
                ProtocolOp::IntermediateResponse(_) => {
                    trace!("Ignoring intermediate response during search");
                }
                ProtocolOp::SearchResultDone(result) => {
                    let result = result.check()?;
                    debug!(entries = entries.len(), references = references.len(), "Search complete");
                    return Ok(SearchResults {
                        entries,
                        references,
                        result,
                        controls,
                    });
                }
                other => return Err(unexpected("searchResultDone", &other)),
            }
        }
        Err(LdapError::ConnectionClosed)
    }

    /// Search, yielding entries as they arrive
    pub async fn search_stream(&self, request: SearchRequest) -> Result<ResponseStream> {
        self.issue_stream(ProtocolOp::SearchRequest(request), Vec::new())
            .await
    }

    #[instrument(skip(self, request), fields(dn = %request.dn))]
    pub async fn add(&self, request: AddRequest) -> Result<LdapResult> {
        let _timer = Timer::start("add");
        match self.issue(ProtocolOp::AddRequest(request), Vec::new()).await?.op {
            ProtocolOp::AddResponse(result) => result.check(),
            other => Err(unexpected("addResponse", &other)),
        }
    }

    #[instrument(skip(self, request), fields(dn = %request.dn))]
    pub async fn modify(&self, request: ModifyRequest) -> Result<LdapResult> {
        let _timer = Timer::start("modify");
        match self.issue(ProtocolOp::ModifyRequest(request), Vec::new()).await?.op {
            ProtocolOp::ModifyResponse(result) => result.check(),
            other => Err(unexpected("modifyResponse", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, dn: &str) -> Result<LdapResult> {
        let _timer = Timer::start("delete");
        match self.issue(ProtocolOp::DelRequest(dn.to_string()), Vec::new()).await?.op {
            ProtocolOp::DelResponse(result) => result.check(),
            other => Err(unexpected("delResponse", &other)),
        }
    }

    #[instrument(skip(self, request), fields(dn = %request.dn))]
    pub async fn modify_dn(&self, request: ModifyDnRequest) -> Result<LdapResult> {
        let _timer = Timer::start("modify_dn");
        match self.issue(ProtocolOp::ModifyDnRequest(request), Vec::new()).await?.op {
            ProtocolOp::ModifyDnResponse(result) => result.check(),
            other => Err(unexpected("modDNResponse", &other)),
        }
    }

    /// Whether the entry at `dn` holds `value` for `attribute`
    #[instrument(skip(self, value))]
    pub async fn compare(
        &self,
        dn: &str,
        attribute: &str,
        value: impl Into<Vec<u8>>,
    ) -> Result<bool> {
        let request = CompareRequest {
            dn: dn.to_string(),
            attribute: attribute.to_string(),
            value: value.into(),
        };
        match self.issue(ProtocolOp::CompareRequest(request), Vec::new()).await?.op {
            ProtocolOp::CompareResponse(result) => match result.code {
                ResultCode::CompareTrue => Ok(true),
                ResultCode::CompareFalse => Ok(false),
                _ => Err(result.to_error()),
            },
            other => Err(unexpected("compareResponse", &other)),
        }
    }

    /// Extended operation; the request and response values are opaque
    #[instrument(skip(self, request), fields(oid = %request.name))]
    pub async fn extended(&self, request: ExtendedRequest) -> Result<ExtendedResponse> {
        match self.issue(ProtocolOp::ExtendedRequest(request), Vec::new()).await?.op {
            ProtocolOp::ExtendedResponse(response) => {
                response.result.clone().check()?;
                Ok(response)
            }
            other => Err(unexpected("extendedResp", &other)),
        }
    }

    /// The authorization identity of this connection (RFC 4532)
    pub async fn who_am_i(&self) -> Result<String> {
        let response = self
            .extended(ExtendedRequest::new(oids::WHO_AM_I, None))
            .await?;
        Ok(response
            .value
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .unwrap_or_default())
    }

    /// Upgrade this connection to TLS in place (RFC 4511 §4.14)
    #[instrument(skip(self, tls))]
    pub async fn start_tls(&self, tls: &TlsClientConfig) -> Result<()> {
        let _transition = self.inner.gate.write().await;
        self.ensure_open()?;
        if self.is_tls() {
            return Err(LdapError::InvalidState(constants::ERR_TLS_ALREADY_ACTIVE.into()));
        }

        let previous = self.inner.shared.set_state(ConnectionState::NegotiatingTls);
        match self.negotiate_tls(tls).await {
            Ok(()) => {
                self.inner.tls_active.store(true, Ordering::Release);
                self.inner.shared.set_state(previous);
                info!("StartTLS complete");
                Ok(())
            }
            Err(e) => {
                if e.is_fatal() {
                    error!(error = %e, "StartTLS failed; closing connection");
                    self.teardown().await;
                } else {
                    warn!(error = %e, "StartTLS rejected");
                    self.inner.shared.set_state(previous);
                }
                Err(e)
            }
        }
    }

    async fn negotiate_tls(&self, tls: &TlsClientConfig) -> Result<()> {
        let request = ExtendedRequest::new(oids::START_TLS, None);
        let mut stream = self
            .dispatch(ProtocolOp::ExtendedRequest(request), Vec::new(), None)
            .await?;
        match stream.terminal().await?.op {
            ProtocolOp::ExtendedResponse(response) => {
                response.result.check()?;
            }
            other => return Err(unexpected("extendedResp", &other)),
        }
        drop(stream);

        let frames = self
            .stop_reader()
            .await?
            .ok_or_else(|| LdapError::TlsError(constants::ERR_READER_UNAVAILABLE.into()))?;
        if !frames.read_buffer().is_empty() {
            return Err(LdapError::TlsError(
                "Server sent data before the TLS handshake".into(),
            ));
        }
        let writer = self
            .inner
            .shared
            .writer
            .lock()
            .await
            .take()
            .ok_or_else(|| LdapError::TlsError(constants::ERR_WRITER_UNAVAILABLE.into()))?;

        let plain = frames.into_inner().unsplit(writer.into_inner());
        // The plaintext halves are gone, so every failure from here on is fatal
        let upgraded = with_timeout_error(plain.upgrade(tls), self.inner.config.connection_timeout)
            .await
            .map_err(|e| match e {
                LdapError::Timeout => LdapError::TlsError("TLS handshake timed out".into()),
                other => other,
            })?;

        let (frames, writer) = split(upgraded, self.inner.config.max_message_size);
        *self.inner.shared.writer.lock().await = Some(writer);
        self.spawn_reader(frames)
    }

    /// Abandon an outstanding request.
    ///
    /// The local entry is removed at once and its waiter fails with
    /// [`LdapError::Abandoned`]. The Abandon request is fire-and-forget.
    /// Unknown or already completed IDs are a no-op returning `false`.
    #[instrument(skip(self))]
    pub async fn abandon(&self, message_id: i32) -> Result<bool> {
        let shared = &self.inner.shared;
        if !shared.dispatcher.abandon(message_id)? {
            debug!("Nothing to abandon");
            return Ok(false);
        }
        shared.metrics.abandon_sent();

        let sent = match shared.dispatcher.allocate_id() {
            Ok(id) => {
                self.send(&LdapMessage::new(id, ProtocolOp::AbandonRequest(message_id)))
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(error = %e, "Abandon request not sent");
        }
        Ok(true)
    }

    /// Send an Unbind and close the connection
    #[instrument(skip(self))]
    pub async fn unbind(&self) -> Result<()> {
        let _transition = self.inner.gate.write().await;
        if self.state() == ConnectionState::Closed {
            return Ok(());
        }

        let sent = match self.inner.shared.dispatcher.allocate_id() {
            Ok(id) => self.send(&LdapMessage::new(id, ProtocolOp::UnbindRequest)).await,
            Err(e) => Err(e),
        };
        self.teardown().await;
        sent
    }

    /// Close the connection without an Unbind; pending requests fail
    pub async fn disconnect(&self) {
        if self.state() != ConnectionState::Closed {
            self.teardown().await;
        }
    }

    // ---- plumbing ----

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Closed => Err(LdapError::ConnectionClosed),
            ConnectionState::Disconnected | ConnectionState::Connecting => Err(
                LdapError::InvalidState(format!("connection is {}", self.state())),
            ),
            _ => Ok(()),
        }
    }

    /// Register, then write, one request
    async fn dispatch(
        &self,
        op: ProtocolOp,
        controls: Vec<Control>,
        permit: Option<OwnedRwLockReadGuard<()>>,
    ) -> Result<ResponseStream> {
        self.ensure_open()?;
        let shared = &self.inner.shared;
        let deadline: Option<Instant> = deadline_after(self.inner.config.operation_timeout);
        let (id, receiver) = shared.dispatcher.register(op.name(), deadline)?;
        // Dropping the stream on any error below releases the entry
        let stream = ResponseStream::new(
            id,
            receiver,
            Arc::clone(&shared.dispatcher),
            deadline,
            permit,
        );

        // Closed between the check and the registration: fail_all may have missed it
        if shared.state() == ConnectionState::Closed {
            return Err(LdapError::ConnectionClosed);
        }

        self.send(&LdapMessage::new(id, op).with_controls(controls))
            .await?;
        Ok(stream)
    }

    /// Write one frame under the writer lock
    async fn send(&self, msg: &LdapMessage) -> Result<()> {
        let shared = &self.inner.shared;
        let mut guard = shared.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(match shared.state() {
                ConnectionState::Closed => LdapError::ConnectionClosed,
                _ => LdapError::InvalidState(constants::ERR_WRITER_UNAVAILABLE.into()),
            });
        };

        if let Err(e) = writer.feed(msg).await {
            // Encoding failures leave the stream intact
            return match e {
                LdapError::Io(_) => {
                    drop(guard);
                    self.fail_transport(e)
                }
                other => Err(other),
            };
        }
        let frame_len = writer.write_buffer().len();
        if let Err(e) = SinkExt::<&LdapMessage>::flush(writer).await {
            drop(guard);
            return self.fail_transport(e);
        }

        shared.metrics.operation_issued(frame_len as u64);
        trace!(
            message_id = msg.message_id,
            op = msg.op.name(),
            frame_len,
            "Sent request"
        );
        Ok(())
    }

    fn fail_transport(&self, e: LdapError) -> Result<()> {
        error!(error = %e, "Write failed; closing connection");
        self.inner.shared.close(|| replicate(&e));
        Err(e)
    }

    fn spawn_reader(&self, frames: Reader) -> Result<()> {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(read_loop(
            frames,
            Arc::clone(&self.inner.shared),
            self.inner.config.timeout_sweep_interval,
            cancel.clone(),
        ));
        let mut slot = self
            .inner
            .reader
            .lock()
            .map_err(|_| LdapError::Custom(constants::ERR_STATE_LOCK.to_string()))?;
        *slot = Some(ReaderTask { cancel, handle });
        Ok(())
    }

    /// Stop the reader and take back its half of the stream.
    ///
    /// `None` when the reader already ended because the connection closed.
    async fn stop_reader(&self) -> Result<Option<Reader>> {
        let task = self
            .inner
            .reader
            .lock()
            .map_err(|_| LdapError::Custom(constants::ERR_STATE_LOCK.to_string()))?
            .take();
        let Some(task) = task else {
            return Ok(None);
        };
        task.cancel.cancel();
        task.handle
            .await
            .map_err(|e| LdapError::TransportError(format!("Reader task failed: {e}")))
    }

    async fn teardown(&self) {
        if let Err(e) = self.stop_reader().await {
            debug!(error = %e, "Reader did not stop cleanly");
        }
        let writer = self.inner.shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = SinkExt::<&LdapMessage>::close(&mut writer).await {
                debug!(error = %e, "Error shutting down stream");
            }
        }
        self.inner.shared.close(|| LdapError::ConnectionClosed);
    }
}

fn split(stream: LdapStream, max_message_size: usize) -> (Reader, Writer) {
    let (read, write) = tokio::io::split(stream);
    (
        FramedRead::new(read, LdapCodec::new(max_message_size)),
        FramedWrite::new(write, LdapCodec::new(max_message_size)),
    )
}

/// Bind, unbind and abandon change connection state; they have dedicated methods
fn check_issuable(op: &ProtocolOp) -> Result<()> {
    let reserved = match op {
        ProtocolOp::BindRequest(_) => Some("simple_bind or sasl_bind"),
        ProtocolOp::UnbindRequest => Some("unbind"),
        ProtocolOp::AbandonRequest(_) => Some("abandon"),
        ProtocolOp::ExtendedRequest(req) if req.name == oids::START_TLS => Some("start_tls"),
        _ => None,
    };
    match reserved {
        Some(method) => Err(LdapError::InvalidState(format!(
            "{} must be sent with {method}",
            op.name()
        ))),
        None => Ok(()),
    }
}

fn unexpected(expected: &str, op: &ProtocolOp) -> LdapError {
    LdapError::UnexpectedMessage(format!("expected {expected}, got {}", op.name()))
}

/// A copy of a connection-level error for each failed waiter
fn replicate(err: &LdapError) -> LdapError {
    match err {
        LdapError::Decoding(e) => LdapError::Decoding(e.clone()),
        LdapError::OversizedMessage(len) => LdapError::OversizedMessage(*len),
        LdapError::Io(e) => LdapError::Io(std::io::Error::new(e.kind(), e.to_string())),
        LdapError::ConnectionClosed => LdapError::ConnectionClosed,
        other => LdapError::TransportError(other.to_string()),
    }
}

async fn read_loop(
    mut frames: Reader,
    shared: Arc<Shared>,
    sweep_interval: Duration,
    cancel: CancellationToken,
) -> Option<Reader> {
    let mut sweep = tokio::time::interval(sweep_interval.max(Duration::from_millis(1)));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Reader stopped");
                return Some(frames);
            }

            _ = sweep.tick() => {
                if let Err(e) = shared.dispatcher.expire_overdue(Instant::now()) {
                    warn!(error = %e, "Timeout sweep failed");
                }
            }

            frame = frames.next() => match frame {
                Some(Ok(msg)) => {
                    let notice = msg.is_notice_of_disconnection();
                    if let Err(e) = shared.dispatcher.route(msg) {
                        warn!(error = %e, "Failed to route response");
                    }
                    if notice {
                        warn!("{}", constants::ERR_NOTICE_OF_DISCONNECTION);
                        shared.close(|| LdapError::ConnectionClosed);
                        return None;
                    }
                }
                Some(Err(e)) => {
                    if matches!(e, LdapError::Decoding(_) | LdapError::OversizedMessage(_)) {
                        shared.metrics.decode_error();
                    }
                    error!(error = %e, "Read failed; closing connection");
                    shared.close(|| replicate(&e));
                    return None;
                }
                None => {
                    info!("Server closed the stream");
                    shared.close(|| LdapError::ConnectionClosed);
                    return None;
                }
            }
        }
    }
}
