use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xpckit_frame::XpcCodec;
use xpckit_object::{Endpoint, XpcObject};
use xpckit_transport::{
    CodeIdentity, PeerCredentials, ServiceNamespace, TransportError, UnixDomainSocket,
};

use crate::connection::{CancelReason, Connection, ErrorSlot};
use crate::error::{Result, XpcError};
use crate::handler::HandlerTable;
use crate::handshake::{handshake_server, HandshakeConfig};
use crate::requirement::CodeRequirement;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// What a listener is reachable as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerKind {
    /// Registered under a service name in the namespace.
    NamedService { name: String, privileged: bool },
    /// Reachable only through its [`Endpoint`].
    Anonymous,
}

#[derive(Default)]
struct Tracked {
    activated: bool,
    canceled: bool,
    connections: Vec<Connection>,
}

struct ListenerInner {
    kind: ListenerKind,
    requirement: Option<CodeRequirement>,
    socket: UnixDomainSocket,
    endpoint: Option<Endpoint>,
    handlers: Arc<HandlerTable>,
    errors: ErrorSlot,
    token: CancellationToken,
    handshake: RwLock<HandshakeConfig>,
    tracked: Mutex<Tracked>,
}

/// Accepts peers and turns each admitted one into a [`Connection`].
///
/// Every accepted connection shares this listener's handler table and
/// error handler. The socket is bound on construction; nothing is accepted
/// until [`Listener::activate`]. An active listener runs until
/// [`Listener::cancel`], which also cancels every connection it accepted.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    /// Bind a listener in the namespace configured by the environment.
    pub fn new(kind: ListenerKind, requirement: Option<&str>) -> Result<Self> {
        Self::new_in(kind, requirement, &ServiceNamespace::from_env())
    }

    /// Bind a listener in `namespace`.
    ///
    /// An invalid requirement fails before anything is bound.
    pub fn new_in(
        kind: ListenerKind,
        requirement: Option<&str>,
        namespace: &ServiceNamespace,
    ) -> Result<Self> {
        let requirement = requirement.map(CodeRequirement::parse).transpose()?;
        let path = match &kind {
            ListenerKind::NamedService { name, privileged } => {
                namespace.service_path(name, *privileged)?
            }
            ListenerKind::Anonymous => namespace.allocate_anonymous_path()?,
        };
        namespace.prepare_socket_dir(&path)?;
        let socket = UnixDomainSocket::bind(&path)?;
        let endpoint =
            matches!(kind, ListenerKind::Anonymous).then(|| Endpoint::from_socket_path(&path));

        info!(path = ?path, kind = ?kind, "listener bound");
        Ok(Self {
            inner: Arc::new(ListenerInner {
                kind,
                requirement,
                socket,
                endpoint,
                handlers: Arc::new(HandlerTable::new()),
                errors: Arc::new(RwLock::new(None)),
                token: CancellationToken::new(),
                handshake: RwLock::new(HandshakeConfig::default()),
                tracked: Mutex::new(Tracked::default()),
            }),
        })
    }

    /// Override handshake config.
    pub fn with_handshake_config(self, config: HandshakeConfig) -> Self {
        *self
            .inner
            .handshake
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config;
        self
    }

    pub fn kind(&self) -> &ListenerKind {
        &self.inner.kind
    }

    pub fn requirement(&self) -> Option<&CodeRequirement> {
        self.inner.requirement.as_ref()
    }

    /// Bound socket path.
    pub fn path(&self) -> &Path {
        self.inner.socket.path()
    }

    /// Endpoint other processes can use to connect. Anonymous listeners only.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.endpoint.clone()
    }

    pub fn is_active(&self) -> bool {
        let tracked = self.tracked();
        tracked.activated && !tracked.canceled
    }

    pub fn is_canceled(&self) -> bool {
        self.tracked().canceled
    }

    /// Live connections accepted so far.
    pub fn connections(&self) -> Vec<Connection> {
        let mut tracked = self.tracked();
        tracked.connections.retain(|conn| !conn.is_canceled());
        tracked.connections.clone()
    }

    /// Handler table shared with every accepted connection.
    pub fn handlers(&self) -> &Arc<HandlerTable> {
        &self.inner.handlers
    }

    /// Register a typed handler. See [`HandlerTable::handle`].
    pub fn handle<Req, Resp, F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Resp>> + Send + 'static,
    {
        self.inner.handlers.handle(name, handler);
    }

    /// Register a typed handler that also receives the calling connection.
    pub fn handle_with_peer<Req, Resp, F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req, Connection) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Resp>> + Send + 'static,
    {
        self.inner.handlers.handle_with_peer(name, handler);
    }

    /// Register a handler over the raw object tree.
    pub fn handle_raw<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(XpcObject, Connection) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<XpcObject>> + Send + 'static,
    {
        self.inner.handlers.handle_raw(name, handler);
    }

    /// Install the error handler inherited by accepted connections.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(XpcError) + Send + Sync + 'static,
    {
        *self
            .inner
            .errors
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Start accepting peers. Must be called from within a tokio runtime.
    pub fn activate(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| TransportError::NoRuntime(err.to_string()))?;
        {
            let mut tracked = self.tracked();
            if tracked.canceled {
                return Err(XpcError::ConnectionInvalid("listener canceled".to_string()));
            }
            if tracked.activated {
                return Ok(());
            }
            tracked.activated = true;
        }

        let listener = self.inner.socket.listener()?;
        info!(path = ?self.path(), "listener activated");
        let this = self.clone();
        runtime.spawn(async move { this.accept_loop(listener).await });
        Ok(())
    }

    /// Stop accepting, cancel every accepted connection and remove the socket.
    pub fn cancel(&self) {
        let connections = {
            let mut tracked = self.tracked();
            if tracked.canceled {
                return;
            }
            tracked.canceled = true;
            std::mem::take(&mut tracked.connections)
        };

        for conn in &connections {
            conn.invalidate(CancelReason::Invalid("listener canceled".to_string()));
        }
        self.inner.token.cancel();
        self.inner.socket.unlink();
        info!(path = ?self.path(), connections = connections.len(), "listener canceled");
    }

    fn tracked(&self) -> MutexGuard<'_, Tracked> {
        self.inner
            .tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn handshake_config(&self) -> HandshakeConfig {
        self.inner
            .handshake
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn report(&self, err: XpcError) {
        let handler = self
            .inner
            .errors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler(err),
            None => debug!(path = ?self.path(), error = %err, "unhandled listener error"),
        }
    }

    async fn accept_loop(self, listener: UnixListener) {
        let token = self.inner.token.clone();
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = UnixDomainSocket::accept(&listener) => accepted,
            };
            match accepted {
                Ok((stream, credentials)) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.admit(stream, credentials).await });
                }
                Err(err) => {
                    warn!(path = ?self.path(), error = %err, "accept failed");
                    self.report(err.into());
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        debug!(path = ?self.path(), "accept loop stopped");
    }

    async fn admit(&self, stream: UnixStream, credentials: PeerCredentials) {
        let admission = match &self.inner.requirement {
            Some(requirement) if !requirement.is_satisfied_by(&CodeIdentity::of_peer(&credentials)) => {
                Err(format!("peer does not satisfy requirement '{requirement}'"))
            }
            _ => Ok(()),
        };

        let config = self.handshake_config();
        let mut framed = Framed::new(stream, XpcCodec::default());
        let token = self.inner.token.clone();
        let handshake = tokio::select! {
            _ = token.cancelled() => return,
            handshake = handshake_server(&mut framed, &config, admission) => handshake,
        };
        match handshake {
            Ok(_) => {}
            Err(XpcError::PeerForbidden(reason)) => {
                info!(pid = ?credentials.pid, uid = credentials.euid, %reason, "peer refused");
                return;
            }
            Err(err) => {
                warn!(pid = ?credentials.pid, error = %err, "handshake failed");
                return;
            }
        }

        let conn = Connection::accepted(
            framed,
            credentials,
            self.inner.handlers.clone(),
            self.inner.errors.clone(),
            self.inner.token.child_token(),
        );
        {
            let mut tracked = self.tracked();
            if tracked.canceled {
                drop(tracked);
                conn.invalidate(CancelReason::Invalid("listener canceled".to_string()));
                return;
            }
            tracked.connections.retain(|live| !live.is_canceled());
            tracked.connections.push(conn.clone());
        }

        info!(pid = ?credentials.pid, uid = credentials.euid, "peer admitted");
        if let Err(err) = conn.activate() {
            warn!(error = %err, "accepted connection failed to activate");
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("kind", &self.inner.kind)
            .field("path", &self.path())
            .field("requirement", &self.inner.requirement)
            .field("handlers", &self.inner.handlers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn make_namespace(tag: &str) -> (ServiceNamespace, PathBuf) {
        let dir = PathBuf::from(format!(
            "/tmp/xk-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        (ServiceNamespace::new(&dir), dir)
    }

    #[test]
    fn anonymous_listeners_vend_an_endpoint_before_activation() {
        let (namespace, dir) = make_namespace("anon");
        let listener = Listener::new_in(ListenerKind::Anonymous, None, &namespace)
            .expect("listener should bind");

        let endpoint = listener.endpoint().expect("anonymous listener has an endpoint");
        assert_eq!(endpoint.socket_path(), listener.path());
        assert!(listener.path().exists());
        assert!(!listener.is_active());

        listener.cancel();
        assert!(!listener.path().exists());
        assert!(listener.is_canceled());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn named_listeners_have_no_endpoint() {
        let (namespace, dir) = make_namespace("named");
        let listener = Listener::new_in(
            ListenerKind::NamedService {
                name: "com.example.named".into(),
                privileged: false,
            },
            None,
            &namespace,
        )
        .expect("listener should bind");

        assert!(listener.endpoint().is_none());
        assert_eq!(listener.path(), dir.join("com.example.named.sock"));
        drop(listener);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn invalid_requirement_fails_before_binding() {
        let (namespace, dir) = make_namespace("badreq");
        let err = Listener::new_in(ListenerKind::Anonymous, Some("anchor"), &namespace)
            .expect_err("requirement should not parse");
        assert!(matches!(
            err,
            XpcError::InvalidCodeSignatureRequirement { .. }
        ));
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn canceled_listeners_cannot_be_activated() {
        let (namespace, dir) = make_namespace("cancel");
        let listener = Listener::new_in(ListenerKind::Anonymous, None, &namespace)
            .expect("listener should bind");
        listener.activate().expect("listener should activate");
        assert!(listener.is_active());

        listener.cancel();
        assert!(matches!(
            listener.activate(),
            Err(XpcError::ConnectionInvalid(_))
        ));
        let _ = std::fs::remove_dir_all(dir);
    }
}
