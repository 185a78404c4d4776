//! Demo service served by `xpckit serve`.
//!
//! Each handler exercises one part of the messaging layer, so the service
//! doubles as the helper process for cross-process tests.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use xpckit_object::{Endpoint, SharedMemory};
use xpckit_peer::{
    register_domain, Connection, ErrorDomain, Listener, ListenerKind, Result, ServiceNamespace,
    XpcError,
};

pub const CAPITALIZE: &str = "capitalize";
pub const PAUSE: &str = "pause";
pub const FAIL: &str = "fail";
pub const FAIL_OPAQUE: &str = "fail-opaque";
pub const VEND_ENDPOINT: &str = "vend-endpoint";
pub const FILL_SURFACE: &str = "fill-surface";
pub const IDENTITY: &str = "identity";

/// Most anonymous listeners kept alive at once; vending more cancels the oldest.
pub const MAX_VENDED: usize = 16;

/// Message names served by the demo service, in registration order.
pub const MESSAGES: &[&str] = &[
    CAPITALIZE,
    PAUSE,
    FAIL,
    FAIL_OPAQUE,
    VEND_ENDPOINT,
    FILL_SURFACE,
    IDENTITY,
];

/// Structured failure raised by `fail`. Registered by the service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("demo failure {code}: {reason}")]
pub struct DemoFailure {
    pub code: i64,
    pub reason: String,
}

impl ErrorDomain for DemoFailure {
    const DOMAIN: &'static str = "dev.xpckit.demo";

    fn code(&self) -> i64 {
        self.code
    }
}

/// Failure raised by `fail-opaque`. Never registered, so it crosses opaque.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
#[error("unregistered failure: {reason}")]
pub struct UnregisteredFailure {
    pub reason: String,
}

impl ErrorDomain for UnregisteredFailure {
    const DOMAIN: &'static str = "dev.xpckit.demo.unregistered";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pause {
    pub seconds: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailRequest {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRequest {
    pub len: usize,
    pub byte: u8,
}

/// The caller as the service sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub pid: Option<i32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub asid: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct DemoOptions {
    /// Namespace for vended endpoints and surfaces.
    pub namespace: ServiceNamespace,
    /// Length of one `pause` second.
    pub pause_unit: Duration,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            namespace: ServiceNamespace::from_env(),
            pause_unit: Duration::from_secs(1),
        }
    }
}

/// Handle to the listeners the demo service vends at runtime.
#[derive(Debug, Clone, Default)]
pub struct DemoService {
    vended: Arc<Mutex<Vec<Listener>>>,
}

impl DemoService {
    /// Number of anonymous listeners vended so far.
    pub fn vended(&self) -> usize {
        self.vended
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Cancel every vended listener.
    pub fn shutdown(&self) {
        let vended =
            std::mem::take(&mut *self.vended.lock().unwrap_or_else(PoisonError::into_inner));
        for listener in vended {
            listener.cancel();
        }
    }
}

/// Register the demo handlers on `listener`.
pub fn install(listener: &Listener, options: DemoOptions) -> DemoService {
    register_domain::<DemoFailure>();
    let service = DemoService::default();

    listener.handle(CAPITALIZE, capitalize);

    let unit = options.pause_unit;
    listener.handle(PAUSE, move |req: Pause| async move {
        let duration = unit.mul_f64(req.seconds.max(0.0));
        debug!(?duration, "pausing");
        tokio::time::sleep(duration).await;
        Ok(())
    });

    listener.handle(FAIL, |req: Option<FailRequest>| async move {
        let req = req.unwrap_or_default();
        Err::<(), _>(XpcError::domain(DemoFailure {
            code: req.code.unwrap_or(1),
            reason: req.reason.unwrap_or_else(|| "requested failure".to_string()),
        }))
    });

    listener.handle(FAIL_OPAQUE, |reason: Option<String>| async move {
        Err::<(), _>(XpcError::domain(UnregisteredFailure {
            reason: reason.unwrap_or_else(|| "requested failure".to_string()),
        }))
    });

    let vend_namespace = options.namespace.clone();
    let vended = service.vended.clone();
    listener.handle(VEND_ENDPOINT, move |_: ()| {
        let namespace = vend_namespace.clone();
        let vended = vended.clone();
        async move { vend_endpoint(&namespace, &vended) }
    });

    let surfaces = options.namespace.surfaces_dir();
    listener.handle(FILL_SURFACE, move |req: FillRequest| {
        let surface = SharedMemory::create_in(&surfaces, req.len)
            .map(|surface| {
                surface.fill(req.byte);
                surface
            })
            .map_err(|err| XpcError::unknown(format!("surface allocation failed: {err}")));
        async move { surface }
    });

    listener.handle_with_peer(IDENTITY, |_: (), peer: Connection| async move {
        Ok(PeerIdentity {
            pid: peer.process_id(),
            uid: peer.effective_user_id(),
            gid: peer.effective_group_id(),
            asid: peer.audit_session_id(),
        })
    });

    service
}

async fn capitalize(text: String) -> Result<String> {
    Ok(text.to_uppercase())
}

fn vend_endpoint(namespace: &ServiceNamespace, vended: &Mutex<Vec<Listener>>) -> Result<Endpoint> {
    let listener = Listener::new_in(ListenerKind::Anonymous, None, namespace)?;
    listener.handle(CAPITALIZE, capitalize);
    listener.activate()?;
    let endpoint = listener
        .endpoint()
        .ok_or_else(|| XpcError::unknown("anonymous listener has no endpoint"))?;

    info!(path = ?endpoint.socket_path(), "vended endpoint");
    let mut vended = vended.lock().unwrap_or_else(PoisonError::into_inner);
    vended.retain(|listener| !listener.is_canceled());
    while vended.len() >= MAX_VENDED {
        let oldest = vended.remove(0);
        debug!(path = ?oldest.path(), "retiring oldest vended endpoint");
        oldest.cancel();
    }
    vended.push(listener);
    Ok(endpoint)
}
