//! One bidirectional channel to a peer.
//!
//! A [`Connection`] is a cheap handle; clones address the same channel.
//! Its lifecycle is inactive → active → canceled and never goes back. Once
//! canceled, every pending two-way send resolves with the cancel reason and
//! every new send fails with it.
//!
//! The channel is driven by two tasks spawned on activation: a writer that
//! drains the outbound queue, and a reader that resolves replies and spawns
//! one dispatch task per inbound message. Dropping the last handle does not
//! close an active channel; call [`Connection::cancel`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xpckit_frame::{
    kind_name, Frame, FrameError, XpcCodec, DEFAULT_MAX_PAYLOAD, MESSAGE, NO_REPLY_PORT, REPLY,
};
use xpckit_object::{from_object, to_object, wire, Endpoint, TransferClaims, XpcObject};
use xpckit_transport::namespace::validate_service_name;
use xpckit_transport::{
    CodeIdentity, PeerCredentials, ServiceNamespace, TransportError, UnixDomainSocket,
};

use crate::error::{Result, XpcError};
use crate::handler::HandlerTable;
use crate::handshake::{handshake_client, HandshakeConfig};
use crate::protocol;
use crate::requirement::CodeRequirement;

/// Callback receiving failures that have no caller to return to.
pub type ErrorHandler = Arc<dyn Fn(XpcError) + Send + Sync>;

/// Error handler slot shared by a listener with the connections it accepts.
pub(crate) type ErrorSlot = Arc<RwLock<Option<ErrorHandler>>>;

type ReplySlot = oneshot::Sender<Result<XpcObject>>;

/// How a connection reaches its peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Connect to a named service in the namespace.
    Service { name: String, privileged: bool },
    /// Connect through an endpoint handed over by another process.
    Endpoint(Endpoint),
    /// Accepted by a listener.
    Accepted,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Service { name, .. } => write!(f, "service {name}"),
            ConnectionKind::Endpoint(endpoint) => {
                write!(f, "endpoint {}", endpoint.socket_path().display())
            }
            ConnectionKind::Accepted => f.write_str("accepted peer"),
        }
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Inactive,
    Active,
    Canceled,
}

#[derive(Debug, Clone)]
pub(crate) enum CancelReason {
    Invalid(String),
    Forbidden(String),
}

impl CancelReason {
    fn to_error(&self) -> XpcError {
        match self {
            CancelReason::Invalid(reason) => XpcError::ConnectionInvalid(reason.clone()),
            CancelReason::Forbidden(reason) => XpcError::PeerForbidden(reason.clone()),
        }
    }

    fn from_error(err: &XpcError) -> Self {
        match err {
            XpcError::PeerForbidden(reason) => CancelReason::Forbidden(reason.clone()),
            XpcError::ConnectionInvalid(reason) => CancelReason::Invalid(reason.clone()),
            other => CancelReason::Invalid(other.to_string()),
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Invalid(reason) => f.write_str(reason),
            CancelReason::Forbidden(reason) => write!(f, "forbidden: {reason}"),
        }
    }
}

enum State {
    Inactive,
    Active,
    Canceled(CancelReason),
}

enum Refusal {
    NotActivated,
    Canceled(CancelReason),
}

impl Refusal {
    fn to_error(&self) -> XpcError {
        match self {
            Refusal::NotActivated => XpcError::NotActivated,
            Refusal::Canceled(reason) => reason.to_error(),
        }
    }
}

enum Outbound {
    // Surfaces in the frame are handed back if it is dropped unwritten.
    Frame(Frame, TransferClaims),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
struct ConnectConfig {
    namespace: ServiceNamespace,
    handshake: HandshakeConfig,
}

struct Shared {
    state: State,
    // Ports with a caller waiting; drained exactly once on invalidation.
    pending: HashMap<u64, ReplySlot>,
    next_port: u64,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    stream: Option<Framed<UnixStream, XpcCodec>>,
    identity: Option<PeerCredentials>,
    config: ConnectConfig,
}

impl Shared {
    fn refusal(&self) -> Option<Refusal> {
        match &self.state {
            State::Inactive => Some(Refusal::NotActivated),
            State::Active => None,
            State::Canceled(reason) => Some(Refusal::Canceled(reason.clone())),
        }
    }

    fn allocate_port(&mut self) -> u64 {
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1).max(NO_REPLY_PORT + 1);
        port
    }

    fn enqueue(&self, item: Outbound) -> std::result::Result<(), Refusal> {
        if let Some(refusal) = self.refusal() {
            return Err(refusal);
        }
        let outbound = self.outbound.as_ref().ok_or_else(|| {
            Refusal::Canceled(CancelReason::Invalid("outbound queue closed".to_string()))
        })?;
        outbound.send(item).map_err(|_| {
            Refusal::Canceled(CancelReason::Invalid("outbound queue closed".to_string()))
        })
    }
}

struct Inner {
    kind: ConnectionKind,
    requirement: Option<CodeRequirement>,
    handlers: Arc<HandlerTable>,
    error_handler: RwLock<Option<ErrorHandler>>,
    inherited_error_handler: Option<ErrorSlot>,
    token: CancellationToken,
    shared: Mutex<Shared>,
}

/// A typed, bidirectional message channel to one peer.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Connection to the service registered under `name`.
    ///
    /// `requirement` is checked against the service once connected. An
    /// invalid requirement fails here, before any connection attempt.
    pub fn to_service(name: &str, privileged: bool, requirement: Option<&str>) -> Result<Self> {
        let requirement = requirement.map(CodeRequirement::parse).transpose()?;
        validate_service_name(name)?;
        Ok(Self::new(
            ConnectionKind::Service {
                name: name.to_string(),
                privileged,
            },
            requirement,
        ))
    }

    /// Connection to the anonymous listener that produced `endpoint`.
    pub fn from_endpoint(endpoint: &Endpoint, requirement: Option<&str>) -> Result<Self> {
        let requirement = requirement.map(CodeRequirement::parse).transpose()?;
        Ok(Self::new(ConnectionKind::Endpoint(endpoint.clone()), requirement))
    }

    fn new(kind: ConnectionKind, requirement: Option<CodeRequirement>) -> Self {
        Self::build(
            kind,
            requirement,
            Arc::new(HandlerTable::new()),
            None,
            CancellationToken::new(),
            Shared {
                state: State::Inactive,
                pending: HashMap::new(),
                next_port: 1,
                outbound: None,
                stream: None,
                identity: None,
                config: ConnectConfig {
                    namespace: ServiceNamespace::from_env(),
                    handshake: HandshakeConfig::default(),
                },
            },
        )
    }

    /// Connection for a peer a listener has already admitted.
    pub(crate) fn accepted(
        framed: Framed<UnixStream, XpcCodec>,
        credentials: PeerCredentials,
        handlers: Arc<HandlerTable>,
        errors: ErrorSlot,
        token: CancellationToken,
    ) -> Self {
        Self::build(
            ConnectionKind::Accepted,
            None,
            handlers,
            Some(errors),
            token,
            Shared {
                state: State::Inactive,
                pending: HashMap::new(),
                next_port: 1,
                outbound: None,
                stream: Some(framed),
                identity: Some(credentials),
                config: ConnectConfig {
                    namespace: ServiceNamespace::from_env(),
                    handshake: HandshakeConfig::default(),
                },
            },
        )
    }

    /// A never-connected handle for exercising handlers directly.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::new(ConnectionKind::Accepted, None)
    }

    fn build(
        kind: ConnectionKind,
        requirement: Option<CodeRequirement>,
        handlers: Arc<HandlerTable>,
        inherited_error_handler: Option<ErrorSlot>,
        token: CancellationToken,
        shared: Shared,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                requirement,
                handlers,
                error_handler: RwLock::new(None),
                inherited_error_handler,
                token,
                shared: Mutex::new(shared),
            }),
        }
    }

    /// Resolve service names in `namespace` instead of the environment's.
    pub fn with_namespace(self, namespace: ServiceNamespace) -> Self {
        self.lock().config.namespace = namespace;
        self
    }

    /// Override handshake config.
    pub fn with_handshake_config(self, config: HandshakeConfig) -> Self {
        self.lock().config.handshake = config;
        self
    }

    pub fn kind(&self) -> &ConnectionKind {
        &self.inner.kind
    }

    pub fn requirement(&self) -> Option<&CodeRequirement> {
        self.inner.requirement.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        match self.lock().state {
            State::Inactive => ConnectionState::Inactive,
            State::Active => ConnectionState::Active,
            State::Canceled(_) => ConnectionState::Canceled,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn is_canceled(&self) -> bool {
        self.state() == ConnectionState::Canceled
    }

    /// Start sending and receiving.
    ///
    /// Must be called from within a tokio runtime. A client connection
    /// connects and handshakes in the background; sends issued meanwhile are
    /// queued and go out once the peer is admitted. Activating an active
    /// connection does nothing; activating a canceled one fails.
    pub fn activate(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| TransportError::NoRuntime(err.to_string()))?;

        let (stream, config, rx) = {
            let mut shared = self.lock();
            match &shared.state {
                State::Inactive => {}
                State::Active => return Ok(()),
                State::Canceled(reason) => return Err(reason.to_error()),
            }
            let (tx, rx) = mpsc::unbounded_channel();
            shared.outbound = Some(tx);
            shared.state = State::Active;
            (shared.stream.take(), shared.config.clone(), rx)
        };

        debug!(connection = %self.inner.kind, "activating connection");
        let conn = self.clone();
        runtime.spawn(async move { conn.run(stream, config, rx).await });
        Ok(())
    }

    /// Cancel the connection immediately.
    ///
    /// In-flight handlers keep running, but pending two-way sends resolve
    /// with [`XpcError::ConnectionInvalid`] and later sends fail.
    pub fn cancel(&self) {
        self.invalidate(CancelReason::Invalid("connection canceled".to_string()));
    }

    /// Install the error handler for failures with no caller to return to.
    ///
    /// On an accepted connection this overrides the listener's handler.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(XpcError) + Send + Sync + 'static,
    {
        *self
            .inner
            .error_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Handler table consulted for inbound messages.
    ///
    /// For an accepted connection this is the listener's table.
    pub fn handlers(&self) -> &Arc<HandlerTable> {
        &self.inner.handlers
    }

    /// Register a typed handler. See [`HandlerTable::handle`].
    pub fn handle<Req, Resp, F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        self.inner.handlers.handle(name, handler);
    }

    /// Register a typed handler that also receives the calling connection.
    pub fn handle_with_peer<Req, Resp, F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        self.inner.handlers.handle_with_peer(name, handler);
    }

    /// Register a handler over the raw object tree.
    pub fn handle_raw<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(XpcObject, Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<XpcObject>> + Send + 'static,
    {
        self.inner.handlers.handle_raw(name, handler);
    }

    /// Send a two-way message and wait for the decoded reply.
    ///
    /// The request is encoded and queued before this returns; an encode
    /// failure means nothing was sent. The future resolves exactly once: with
    /// the reply value, the handler's error, or the reason the connection
    /// was invalidated.
    pub fn send_message<Req, Resp>(
        &self,
        name: &str,
        request: &Req,
    ) -> impl Future<Output = Result<Resp>> + Send + 'static
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned + Send + 'static,
    {
        let started = self
            .refuse_two_way()
            .and_then(|()| to_object(request).map_err(XpcError::from))
            .and_then(|payload| self.start_request(name, payload));
        async move {
            let (_port, reply) = started?;
            let value = await_reply(reply).await?;
            Ok(from_object(value)?)
        }
    }

    /// Like [`Self::send_message`], but gives up after `timeout`.
    ///
    /// A reply arriving after the timeout is dropped.
    pub fn send_message_with_timeout<Req, Resp>(
        &self,
        name: &str,
        request: &Req,
        timeout: Duration,
    ) -> impl Future<Output = Result<Resp>> + Send + 'static
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned + Send + 'static,
    {
        let started = self
            .refuse_two_way()
            .and_then(|()| to_object(request).map_err(XpcError::from))
            .and_then(|payload| self.start_request(name, payload));
        let conn = self.clone();
        async move {
            let (port, reply) = started?;
            match tokio::time::timeout(timeout, await_reply(reply)).await {
                Ok(value) => Ok(from_object(value?)?),
                Err(_) => {
                    conn.lock().pending.remove(&port);
                    debug!(port, ?timeout, "request timed out");
                    Err(XpcError::Timeout(timeout))
                }
            }
        }
    }

    /// Send a two-way message carrying a raw object tree.
    pub fn send_raw_message(
        &self,
        name: &str,
        payload: XpcObject,
    ) -> impl Future<Output = Result<XpcObject>> + Send + 'static {
        let started = self
            .refuse_two_way()
            .and_then(|()| self.start_request(name, payload));
        async move {
            let (_port, reply) = started?;
            await_reply(reply).await
        }
    }

    /// Send a oneway message. Returns once the message is queued.
    ///
    /// Failures of the remote handler never come back to the sender. Sending
    /// on an inactive or canceled connection fails; the failure is also
    /// passed to the error handler.
    pub fn send_oneway_message<Req>(&self, name: &str, request: &Req) -> Result<()>
    where
        Req: Serialize + ?Sized,
    {
        let payload = to_object(request)?;
        self.send_raw_oneway_message(name, payload)
    }

    /// Send a oneway message carrying a raw object tree.
    pub fn send_raw_oneway_message(&self, name: &str, payload: XpcObject) -> Result<()> {
        let refusal = self.lock().refusal();
        if let Some(refusal) = refusal {
            return Err(self.refuse_oneway(refusal));
        }

        let (bytes, claims) = encode_body(&protocol::message(name, payload))?;
        let queued = self.lock().enqueue(Outbound::Frame(
            Frame::new(MESSAGE, NO_REPLY_PORT, bytes),
            claims,
        ));
        match queued {
            Ok(()) => {
                debug!(message = name, "queued oneway message");
                Ok(())
            }
            Err(refusal) => Err(self.refuse_oneway(refusal)),
        }
    }

    /// Wait until everything queued so far has been written to the socket.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let queued = self.lock().enqueue(Outbound::Flush(tx));
        queued.map_err(|refusal| refusal.to_error())?;
        if rx.await.is_ok() {
            return Ok(());
        }
        let refusal = self.lock().refusal();
        Err(refusal.map(|refusal| refusal.to_error()).unwrap_or_else(|| {
            XpcError::ConnectionInvalid("connection closed before flush completed".to_string())
        }))
    }

    /// Kernel credentials of the peer, once connected.
    pub fn peer_credentials(&self) -> Option<PeerCredentials> {
        self.lock().identity
    }

    pub fn process_id(&self) -> Option<i32> {
        self.peer_credentials().and_then(|creds| creds.pid)
    }

    pub fn effective_user_id(&self) -> Option<u32> {
        self.peer_credentials().map(|creds| creds.euid)
    }

    pub fn effective_group_id(&self) -> Option<u32> {
        self.peer_credentials().map(|creds| creds.egid)
    }

    pub fn audit_session_id(&self) -> Option<i32> {
        self.peer_credentials().and_then(|creds| creds.asid)
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn refuse_two_way(&self) -> Result<()> {
        let refusal = self.lock().refusal();
        match refusal {
            Some(refusal) => Err(refusal.to_error()),
            None => Ok(()),
        }
    }

    fn refuse_oneway(&self, refusal: Refusal) -> XpcError {
        self.report(refusal.to_error());
        refusal.to_error()
    }

    fn start_request(
        &self,
        name: &str,
        payload: XpcObject,
    ) -> Result<(u64, oneshot::Receiver<Result<XpcObject>>)> {
        let (bytes, claims) = encode_body(&protocol::message(name, payload))?;
        let (tx, rx) = oneshot::channel();

        let mut shared = self.lock();
        if let Some(refusal) = shared.refusal() {
            return Err(refusal.to_error());
        }
        let port = shared.allocate_port();
        shared
            .enqueue(Outbound::Frame(Frame::new(MESSAGE, port, bytes), claims))
            .map_err(|refusal| refusal.to_error())?;
        shared.pending.insert(port, tx);
        drop(shared);

        debug!(message = name, port, "sent two-way message");
        Ok((port, rx))
    }

    /// Move to the canceled state. Only the first call has any effect.
    pub(crate) fn invalidate(&self, reason: CancelReason) {
        let pending = {
            let mut shared = self.lock();
            if matches!(shared.state, State::Canceled(_)) {
                return;
            }
            shared.state = State::Canceled(reason.clone());
            shared.outbound = None;
            shared.stream = None;
            std::mem::take(&mut shared.pending)
        };
        self.inner.token.cancel();

        info!(connection = %self.inner.kind, %reason, pending = pending.len(), "connection invalidated");
        for (_, slot) in pending {
            let _ = slot.send(Err(reason.to_error()));
        }
        self.report(reason.to_error());
    }

    fn report(&self, err: XpcError) {
        let own = self
            .inner
            .error_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let handler = own.or_else(|| {
            self.inner
                .inherited_error_handler
                .as_ref()
                .and_then(|slot| slot.read().unwrap_or_else(PoisonError::into_inner).clone())
        });
        match handler {
            Some(handler) => handler(err),
            None => debug!(connection = %self.inner.kind, error = %err, "unhandled connection error"),
        }
    }

    async fn run(
        self,
        stream: Option<Framed<UnixStream, XpcCodec>>,
        config: ConnectConfig,
        rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let framed = match stream {
            Some(framed) => framed,
            None => {
                let token = self.inner.token.clone();
                let established = tokio::select! {
                    _ = token.cancelled() => return,
                    established = self.establish(&config) => established,
                };
                match established {
                    Ok(framed) => framed,
                    Err(err) => {
                        warn!(connection = %self.inner.kind, error = %err, "connection failed");
                        self.invalidate(CancelReason::from_error(&err));
                        return;
                    }
                }
            }
        };
        self.drive(framed, rx).await;
    }

    async fn establish(&self, config: &ConnectConfig) -> Result<Framed<UnixStream, XpcCodec>> {
        let path = match &self.inner.kind {
            ConnectionKind::Service { name, privileged } => {
                config.namespace.service_path(name, *privileged)?
            }
            ConnectionKind::Endpoint(endpoint) => endpoint.socket_path().to_path_buf(),
            ConnectionKind::Accepted => {
                return Err(XpcError::ConnectionInvalid(
                    "accepted connection has no stream".to_string(),
                ))
            }
        };

        let (stream, credentials) = UnixDomainSocket::connect(&path).await?;
        let mut framed = Framed::new(stream, XpcCodec::default());
        handshake_client(&mut framed, &config.handshake).await?;

        if let Some(requirement) = &self.inner.requirement {
            let identity = CodeIdentity::of_peer(&credentials);
            if !requirement.is_satisfied_by(&identity) {
                return Err(XpcError::PeerForbidden(format!(
                    "service does not satisfy requirement '{requirement}'"
                )));
            }
        }

        self.lock().identity = Some(credentials);
        info!(connection = %self.inner.kind, pid = ?credentials.pid, "connection established");
        Ok(framed)
    }

    async fn drive(
        &self,
        framed: Framed<UnixStream, XpcCodec>,
        mut rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let (mut sink, mut stream) = framed.split();
        let token = self.inner.token.clone();

        let writer_token = token.clone();
        let writer_conn = self.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = writer_token.cancelled() => break,
                    next = rx.recv() => next,
                };
                match next {
                    Some(Outbound::Frame(frame, claims)) => {
                        if let Err(err) = sink.send(frame).await {
                            writer_conn.invalidate(CancelReason::Invalid(format!(
                                "write failed: {err}"
                            )));
                            break;
                        }
                        claims.commit();
                    }
                    Some(Outbound::Flush(done)) => {
                        let _ = done.send(());
                    }
                    None => break,
                }
            }
        });

        let reason = loop {
            let next = tokio::select! {
                _ = token.cancelled() => break "connection canceled".to_string(),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(frame)) => self.handle_frame(frame),
                Some(Err(FrameError::ConnectionClosed)) | None => {
                    break "peer closed the connection".to_string()
                }
                Some(Err(err)) => break format!("frame error: {err}"),
            }
        };
        self.invalidate(CancelReason::Invalid(reason));
    }

    fn handle_frame(&self, frame: Frame) {
        match frame.kind {
            REPLY => self.resolve_reply(frame),
            MESSAGE => {
                let conn = self.clone();
                tokio::spawn(async move { conn.dispatch(frame).await });
            }
            other => debug!(kind = kind_name(other), "ignoring frame"),
        }
    }

    fn resolve_reply(&self, frame: Frame) {
        let slot = self.lock().pending.remove(&frame.port);
        let Some(slot) = slot else {
            debug!(port = frame.port, "dropping reply with no waiting request");
            return;
        };
        let reply = wire::decode(&frame.payload)
            .map_err(XpcError::from)
            .and_then(protocol::parse_reply);
        let _ = slot.send(reply);
    }

    async fn dispatch(self, frame: Frame) {
        let wants_reply = frame.wants_reply();
        let port = frame.port;

        let message = wire::decode(&frame.payload)
            .map_err(XpcError::from)
            .and_then(protocol::parse_message);
        let result = match message {
            Ok((name, payload)) => match self.inner.handlers.get(&name) {
                Some(handler) => {
                    debug!(message = %name, port, "dispatching message");
                    let peer = self.clone();
                    AssertUnwindSafe(async move { handler(payload, peer).await })
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            Err(XpcError::unknown(format!("handler for '{name}' panicked")))
                        })
                }
                None => {
                    warn!(message = %name, "no handler registered");
                    self.report(XpcError::DispatchMissingHandler(name.clone()));
                    if !wants_reply {
                        return;
                    }
                    Err(XpcError::DispatchMissingHandler(name))
                }
            },
            Err(err) => Err(err),
        };

        if !wants_reply {
            if let Err(err) = result {
                self.report(err);
            }
            return;
        }

        let (payload, claims) = encode_reply(result);
        let queued = self
            .lock()
            .enqueue(Outbound::Frame(Frame::new(REPLY, port, payload), claims));
        if queued.is_err() {
            debug!(port, "connection gone before reply could be sent");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.inner.kind)
            .field("requirement", &self.inner.requirement)
            .field("state", &self.state())
            .field("peer", &self.peer_credentials())
            .finish()
    }
}

async fn await_reply(reply: oneshot::Receiver<Result<XpcObject>>) -> Result<XpcObject> {
    reply.await.unwrap_or_else(|_| {
        Err(XpcError::ConnectionInvalid(
            "connection dropped the request".to_string(),
        ))
    })
}

/// Encode a message or reply body. Bodies too large for one frame fail
/// here, before anything is queued.
fn encode_body(object: &XpcObject) -> Result<(Bytes, TransferClaims)> {
    let (bytes, claims) = wire::encode_claimed(object)?;
    if bytes.len() > DEFAULT_MAX_PAYLOAD {
        return Err(XpcError::EncodingUnsupported(format!(
            "encoded payload of {} bytes exceeds the {DEFAULT_MAX_PAYLOAD} byte frame limit",
            bytes.len()
        )));
    }
    Ok((bytes, claims))
}

fn encode_reply(result: Result<XpcObject>) -> (Bytes, TransferClaims) {
    let reply = match result {
        Ok(value) => protocol::value_reply(value),
        Err(err) => {
            debug!(error = %err, "replying with error");
            protocol::error_reply(&err)
        }
    };
    match encode_body(&reply) {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!(error = %err, "reply could not be encoded; replying with the encode failure");
            let bytes = wire::encode(&protocol::error_reply(&err)).unwrap_or_default();
            (bytes, TransferClaims::default())
        }
    }
}
