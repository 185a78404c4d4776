use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use xpckit_peer::{
    register_domain, Connection, Dictionary, Endpoint, ErrorDomain, Listener, ListenerKind,
    PeerCredentials, ServiceNamespace, SharedMemory, XpcError, XpcObject, SURFACE_KEY,
};

#[derive(Debug, Serialize, Deserialize)]
struct Pause {
    seconds: f64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Text {
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Fill {
    len: usize,
    byte: u8,
}

#[derive(Debug, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("quota exceeded: {used}/{limit}")]
struct QuotaExceeded {
    used: u64,
    limit: u64,
}

impl ErrorDomain for QuotaExceeded {
    const DOMAIN: &'static str = "test.peer.quota";

    fn code(&self) -> i64 {
        42
    }
}

#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
#[error("opaque failure: {detail}")]
struct NeverRegistered {
    detail: String,
}

impl ErrorDomain for NeverRegistered {
    const DOMAIN: &'static str = "test.peer.never-registered";
}

struct Fixture {
    listener: Listener,
    namespace: ServiceNamespace,
    name: String,
    dir: PathBuf,
}

impl Fixture {
    fn new(tag: &str, requirement: Option<&str>) -> Self {
        let dir = PathBuf::from(format!(
            "/tmp/xk-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        let namespace = ServiceNamespace::new(&dir);
        let name = format!("com.xpckit.test.{tag}");
        let listener = Listener::new_in(
            ListenerKind::NamedService {
                name: name.clone(),
                privileged: false,
            },
            requirement,
            &namespace,
        )
        .expect("listener should bind");
        install_handlers(&listener, &namespace);
        listener.activate().expect("listener should activate");
        Self {
            listener,
            namespace,
            name,
            dir,
        }
    }

    fn connect(&self, requirement: Option<&str>) -> Connection {
        let conn = self.unactivated(requirement);
        conn.activate().expect("connection should activate");
        conn
    }

    fn unactivated(&self, requirement: Option<&str>) -> Connection {
        Connection::to_service(&self.name, false, requirement)
            .expect("connection should construct")
            .with_namespace(self.namespace.clone())
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.listener.cancel();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn install_handlers(listener: &Listener, namespace: &ServiceNamespace) {
    listener.handle("capitalize", |text: String| async move {
        Ok(text.to_uppercase())
    });
    listener.handle("pause", |req: Pause| async move {
        tokio::time::sleep(Duration::from_secs_f64(req.seconds)).await;
        Ok(())
    });
    listener.handle("fail", |_: ()| async move {
        Err::<(), _>(XpcError::domain(QuotaExceeded { used: 9, limit: 5 }))
    });
    listener.handle("fail-opaque", |_: ()| async move {
        Err::<(), _>(XpcError::domain(NeverRegistered {
            detail: "disk on fire".into(),
        }))
    });
    listener.handle_with_peer("who", |_: (), peer: Connection| async move {
        Ok(peer.process_id())
    });
    listener.handle_with_peer("call-back", |_: (), peer: Connection| async move {
        peer.send_message::<str, String>("greet", "server").await
    });

    let anonymous_ns = namespace.clone();
    listener.handle("vend", move |_: ()| {
        let namespace = anonymous_ns.clone();
        async move {
            let anonymous = Listener::new_in(ListenerKind::Anonymous, None, &namespace)?;
            anonymous.handle("whoami", |_: ()| async move { Ok("anonymous".to_string()) });
            anonymous.activate()?;
            anonymous
                .endpoint()
                .ok_or_else(|| XpcError::unknown("anonymous listener has no endpoint"))
        }
    });

    let surfaces = namespace.surfaces_dir();
    listener.handle("fill", move |req: Fill| {
        let dir = surfaces.clone();
        async move {
            let surface = SharedMemory::create_in(&dir, req.len)
                .map_err(|err| XpcError::unknown(err.to_string()))?;
            surface.fill(req.byte);
            Ok::<_, XpcError>(surface)
        }
    });
}

fn collect_errors() -> (Arc<Mutex<Vec<String>>>, impl Fn(XpcError) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |err: XpcError| {
        sink.lock().expect("lock").push(err.to_string())
    })
}

async fn wait_for(seen: &Arc<Mutex<Vec<String>>>, needle: &str) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if seen.lock().expect("lock").iter().any(|e| e.contains(needle)) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn typed_round_trip() {
    let fixture = Fixture::new("typed", None);
    let conn = fixture.connect(None);

    let upper: String = conn
        .send_message("capitalize", "hello")
        .await
        .expect("reply should arrive");
    assert_eq!(upper, "HELLO");
    assert!(conn.is_active());
}

#[tokio::test(flavor = "multi_thread")]
async fn oneway_returns_before_the_handler_finishes() {
    let fixture = Fixture::new("oneway", None);
    let conn = fixture.connect(None);
    let _: String = conn.send_message("capitalize", "warm").await.unwrap();

    let started = Instant::now();
    conn.send_oneway_message("pause", &Pause { seconds: 1.0 })
        .expect("oneway send should queue");
    assert!(started.elapsed() < Duration::from_millis(500));

    let started = Instant::now();
    conn.send_message::<Pause, ()>("pause", &Pause { seconds: 1.0 })
        .await
        .expect("two-way pause should reply");
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_resolves_pending_and_refuses_new_sends() {
    let fixture = Fixture::new("cancel", None);
    let conn = fixture.connect(None);
    let (seen, handler) = collect_errors();
    conn.set_error_handler(handler);

    let before: String = conn.send_message("capitalize", "done").await.unwrap();
    assert_eq!(before, "DONE");

    let pending = tokio::spawn(conn.send_message::<Pause, ()>("pause", &Pause { seconds: 5.0 }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    conn.cancel();

    let resolved = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("pending send should resolve promptly")
        .expect("task should not panic");
    assert!(matches!(resolved, Err(XpcError::ConnectionInvalid(_))));

    let after: Result<String, _> = conn.send_message("capitalize", "late").await;
    assert!(matches!(after, Err(XpcError::ConnectionInvalid(_))));
    assert!(conn.send_oneway_message("capitalize", "late").is_err());

    let reported = seen.lock().unwrap().clone();
    assert!(reported.len() >= 2, "reported: {reported:?}");
    assert!(reported.iter().all(|e| e.contains("connection invalid")));
}

#[tokio::test(flavor = "multi_thread")]
async fn listener_requirement_refuses_peers() {
    let fixture = Fixture::new("refuse", Some("never"));
    let conn = fixture.connect(None);

    let reply: Result<String, _> = conn.send_message("capitalize", "x").await;
    assert!(matches!(reply, Err(XpcError::PeerForbidden(_))), "{reply:?}");
    assert!(conn.is_canceled());
    assert!(fixture.listener.connections().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn client_requirement_refuses_services() {
    let fixture = Fixture::new("clientreq", None);
    let conn = fixture.connect(Some("never"));

    let reply: Result<String, _> = conn.send_message("capitalize", "x").await;
    assert!(matches!(reply, Err(XpcError::PeerForbidden(_))), "{reply:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn satisfied_requirements_admit_the_peer() {
    let uid = PeerCredentials::current().euid;
    let requirement = format!("anchor self and uid {uid}");
    let fixture = Fixture::new("admit", Some(&requirement));
    let conn = fixture.connect(Some(&requirement));

    let upper: String = conn.send_message("capitalize", "ok").await.unwrap();
    assert_eq!(upper, "OK");
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_requirement_fails_at_construction() {
    let err = Connection::to_service("com.xpckit.test.never", false, Some("identifier = "))
        .expect_err("requirement should not parse");
    assert!(matches!(
        err,
        XpcError::InvalidCodeSignatureRequirement { .. }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn registered_domain_errors_keep_their_type() {
    register_domain::<QuotaExceeded>();
    let fixture = Fixture::new("domain", None);
    let conn = fixture.connect(None);

    let err = conn
        .send_message::<(), ()>("fail", &())
        .await
        .expect_err("handler fails");
    assert_eq!(
        err.downcast_ref::<QuotaExceeded>(),
        Some(&QuotaExceeded { used: 9, limit: 5 })
    );
    match err {
        XpcError::Domain(domain) => assert_eq!(domain.code(), 42),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unregistered_domain_errors_arrive_opaque() {
    let fixture = Fixture::new("opaque", None);
    let conn = fixture.connect(None);

    let err = conn
        .send_message::<(), ()>("fail-opaque", &())
        .await
        .expect_err("handler fails");
    match err {
        XpcError::Unknown { description } => {
            assert_eq!(description, "opaque failure: disk on fire")
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_handlers_are_replied_and_reported() {
    let fixture = Fixture::new("missing", None);
    let (seen, handler) = collect_errors();
    fixture.listener.set_error_handler(handler);
    let conn = fixture.connect(None);

    let err = conn
        .send_message::<(), ()>("nope", &())
        .await
        .expect_err("no handler");
    assert!(matches!(err, XpcError::DispatchMissingHandler(ref name) if name == "nope"));
    assert!(wait_for(&seen, "nope").await);

    conn.send_oneway_message("also-nope", &()).unwrap();
    assert!(wait_for(&seen, "also-nope").await);
}

#[tokio::test(flavor = "multi_thread")]
async fn oneway_handler_failures_reach_the_listener_error_handler() {
    let fixture = Fixture::new("onewayerr", None);
    let (seen, handler) = collect_errors();
    fixture.listener.set_error_handler(handler);
    let conn = fixture.connect(None);

    conn.send_oneway_message("fail-opaque", &()).unwrap();
    assert!(wait_for(&seen, "disk on fire").await);
}

#[tokio::test(flavor = "multi_thread")]
async fn endpoints_hand_off_a_direct_connection() {
    let fixture = Fixture::new("endpoint", None);
    let conn = fixture.connect(None);

    let endpoint: Endpoint = conn.send_message("vend", &()).await.unwrap();
    let direct = Connection::from_endpoint(&endpoint, None).unwrap();
    direct.activate().unwrap();

    let answer: String = direct.send_message("whoami", &()).await.unwrap();
    assert_eq!(answer, "anonymous");

    // The named service does not serve the anonymous listener's messages.
    let err = conn
        .send_message::<(), String>("whoami", &())
        .await
        .expect_err("named service has no whoami");
    assert!(matches!(err, XpcError::DispatchMissingHandler(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn shared_memory_travels_as_a_mapping() {
    let fixture = Fixture::new("surface", None);
    let conn = fixture.connect(None);

    let surface: SharedMemory = conn
        .send_message("fill", &Fill { len: 4096, byte: 0xAB })
        .await
        .unwrap();
    assert_eq!(surface.len(), 4096);
    assert!(surface.to_vec().iter().all(|b| *b == 0xAB));
    assert!(!surface.backing_path().exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn raw_replies_carry_a_surface_under_the_well_known_key() {
    let fixture = Fixture::new("rawsurface", None);
    let surfaces = fixture.namespace.surfaces_dir();
    fixture.listener.handle_raw("raw-fill", move |_payload, _peer| {
        let dir = surfaces.clone();
        async move {
            let surface = SharedMemory::create_in(&dir, 64)
                .map_err(|err| XpcError::unknown(err.to_string()))?;
            surface.fill(0x11);
            let mut reply = Dictionary::new();
            reply.set_shared_memory(SURFACE_KEY, surface);
            reply.set_uint64("len", 64);
            Ok(XpcObject::Dictionary(reply))
        }
    });
    let conn = fixture.connect(None);

    let reply = conn
        .send_raw_message("raw-fill", XpcObject::Null)
        .await
        .expect("raw reply should arrive");
    let dict = reply.as_dictionary().expect("dictionary reply");
    assert_eq!(dict.get_uint64("len"), Some(64));
    let surface = dict
        .get_shared_memory(SURFACE_KEY)
        .expect("surface under the well-known key");
    assert_eq!(surface.to_vec(), vec![0x11; 64]);
}

#[tokio::test(flavor = "multi_thread")]
async fn undelivered_surfaces_are_not_left_on_disk() {
    let fixture = Fixture::new("undelivered", Some("never"));
    let surface = SharedMemory::create_in(&fixture.namespace.surfaces_dir(), 256).unwrap();
    let path = surface.backing_path().to_path_buf();
    let conn = fixture.connect(None);

    let mut message = Dictionary::new();
    message.set_shared_memory(SURFACE_KEY, surface.clone());
    let _ = conn.send_raw_oneway_message("capitalize", XpcObject::Dictionary(message));

    let deadline = Instant::now() + Duration::from_secs(3);
    while !conn.is_canceled() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(conn.is_canceled());

    drop(surface);
    let deadline = Instant::now() + Duration::from_secs(3);
    while path.exists() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!path.exists(), "backing file outlived the refused message");
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_payloads_fail_locally_and_leave_the_connection_usable() {
    let fixture = Fixture::new("oversize", None);
    let conn = fixture.connect(None);
    let _: String = conn.send_message("capitalize", "warm").await.unwrap();

    let huge = XpcObject::Data(vec![0u8; 17 * 1024 * 1024].into());
    let err = conn
        .send_raw_message("capitalize", huge.clone())
        .await
        .expect_err("oversized two-way send should fail");
    assert!(matches!(err, XpcError::EncodingUnsupported(_)), "{err:?}");
    let err = conn
        .send_raw_oneway_message("capitalize", huge)
        .expect_err("oversized oneway send should fail");
    assert!(matches!(err, XpcError::EncodingUnsupported(_)), "{err:?}");

    assert!(conn.is_active());
    let upper: String = conn.send_message("capitalize", "after").await.unwrap();
    assert_eq!(upper, "AFTER");
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_replies_become_error_replies() {
    let fixture = Fixture::new("bigreply", None);
    fixture.listener.handle_raw("flood", |_payload, _peer| async move {
        Ok(XpcObject::Data(vec![7u8; 17 * 1024 * 1024].into()))
    });
    let conn = fixture.connect(None);

    let err = conn
        .send_raw_message("flood", XpcObject::Null)
        .await
        .expect_err("oversized reply should come back as an error");
    assert!(matches!(err, XpcError::EncodingUnsupported(_)), "{err:?}");

    assert!(conn.is_active());
    let upper: String = conn.send_message("capitalize", "still").await.unwrap();
    assert_eq!(upper, "STILL");
}

#[tokio::test(flavor = "multi_thread")]
async fn raw_and_typed_handlers_share_a_name() {
    let fixture = Fixture::new("rawtyped", None);
    fixture
        .listener
        .handle_raw("echo", |payload, _peer| async move { Ok(payload) });
    let conn = fixture.connect(None);

    let typed: Text = conn
        .send_message(
            "echo",
            &Text {
                text: "same".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(typed.text, "same");

    let mut dict = Dictionary::new();
    dict.set_string("text", "raw");
    let raw = conn
        .send_raw_message("echo", XpcObject::Dictionary(dict.clone()))
        .await
        .unwrap();
    assert_eq!(raw, XpcObject::Dictionary(dict.clone()));

    fixture.listener.handle("echo", |req: Text| async move {
        Ok(Text {
            text: req.text.to_uppercase(),
        })
    });
    let raw = conn
        .send_raw_message("echo", XpcObject::Dictionary(dict))
        .await
        .unwrap();
    assert_eq!(
        raw.as_dictionary().and_then(|d| d.get_string("text")),
        Some("RAW")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn timed_out_requests_leave_the_connection_usable() {
    let fixture = Fixture::new("timeout", None);
    let conn = fixture.connect(None);

    let err = conn
        .send_message_with_timeout::<Pause, ()>(
            "pause",
            &Pause { seconds: 1.0 },
            Duration::from_millis(100),
        )
        .await
        .expect_err("should time out");
    assert!(matches!(err, XpcError::Timeout(_)));

    let upper: String = conn.send_message("capitalize", "still").await.unwrap();
    assert_eq!(upper, "STILL");
}

#[tokio::test(flavor = "multi_thread")]
async fn identity_comes_from_the_kernel() {
    let fixture = Fixture::new("identity", None);
    let conn = fixture.connect(None);

    let seen_by_service: Option<i32> = conn.send_message("who", &()).await.unwrap();
    let me = PeerCredentials::current();
    assert_eq!(seen_by_service, me.pid);
    assert_eq!(conn.process_id(), me.pid);
    assert_eq!(conn.effective_user_id(), Some(me.euid));
    assert_eq!(conn.effective_group_id(), Some(me.egid));
}

#[tokio::test(flavor = "multi_thread")]
async fn services_can_call_back_into_clients() {
    let fixture = Fixture::new("callback", None);
    let conn = fixture.unactivated(None);
    conn.handle("greet", |name: String| async move { Ok(format!("hello {name}")) });
    conn.activate().unwrap();

    let greeting: String = conn.send_message("call-back", &()).await.unwrap();
    assert_eq!(greeting, "hello server");
}

#[tokio::test(flavor = "multi_thread")]
async fn listener_cancel_cascades_to_connections() {
    let fixture = Fixture::new("cascade", None);
    let conn = fixture.connect(None);
    let _: String = conn.send_message("capitalize", "up").await.unwrap();
    assert_eq!(fixture.listener.connections().len(), 1);

    let pending = tokio::spawn(conn.send_message::<Pause, ()>("pause", &Pause { seconds: 5.0 }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    fixture.listener.cancel();

    let resolved = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("pending send should resolve promptly")
        .expect("task should not panic");
    assert!(matches!(resolved, Err(XpcError::ConnectionInvalid(_))));
    assert!(fixture.listener.connections().is_empty());
    assert!(!fixture.listener.path().exists());
}
