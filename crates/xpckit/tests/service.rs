#![cfg(all(unix, feature = "cli"))]

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

use xpckit::demo::{DemoFailure, FailRequest, FillRequest, Pause, PeerIdentity};
use xpckit::peer::{
    register_domain, Connection, Endpoint, ServiceNamespace, SharedMemory, XpcError,
};

const PAUSE_UNIT_MS: u64 = 100;

fn unique_temp_dir(tag: &str) -> PathBuf {
    PathBuf::from(format!(
        "/tmp/xkcli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ))
}

/// A `xpckit serve` child process with its own namespace directory.
struct Service {
    child: Child,
    _stdout: BufReader<ChildStdout>,
    name: String,
    dir: PathBuf,
}

impl Service {
    fn start(tag: &str, extra: &[&str]) -> Self {
        let dir = unique_temp_dir(tag);
        let name = format!("dev.xpckit.test.{tag}");
        let mut child = Command::new(env!("CARGO_BIN_EXE_xpckit"))
            .arg("--log-level")
            .arg("error")
            .arg("serve")
            .arg(&name)
            .arg("--pause-unit-ms")
            .arg(PAUSE_UNIT_MS.to_string())
            .args(extra)
            .env("XPCKIT_NAMESPACE_DIR", &dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("serve command should start");

        let mut stdout = BufReader::new(child.stdout.take().expect("stdout should be piped"));
        let mut line = String::new();
        stdout
            .read_line(&mut line)
            .expect("serve should write to stdout");
        assert_eq!(line.trim(), "ready", "serve did not come up");

        Self {
            child,
            _stdout: stdout,
            name,
            dir,
        }
    }

    fn namespace(&self) -> ServiceNamespace {
        ServiceNamespace::new(&self.dir)
    }

    fn connect(&self, requirement: Option<&str>) -> Connection {
        let conn = Connection::to_service(&self.name, false, requirement)
            .expect("connection should construct")
            .with_namespace(self.namespace());
        conn.activate().expect("connection should activate");
        conn
    }

    fn cli(&self, args: &[&str]) -> std::process::Output {
        Command::new(env!("CARGO_BIN_EXE_xpckit"))
            .arg("--log-level")
            .arg("error")
            .args(args)
            .env("XPCKIT_NAMESPACE_DIR", &self.dir)
            .output()
            .expect("cli should run")
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn capitalize_across_processes() {
    let service = Service::start("capitalize", &[]);
    let conn = service.connect(None);

    let reply: String = conn
        .send_message("capitalize", "hello, world")
        .await
        .expect("capitalize should succeed");
    assert_eq!(reply, "HELLO, WORLD");
    conn.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn both_sides_see_kernel_identity() {
    let service = Service::start("identity", &[]);
    let conn = service.connect(None);

    let seen: PeerIdentity = conn
        .send_message("identity", &())
        .await
        .expect("identity should succeed");
    assert_eq!(seen.pid, Some(std::process::id() as i32));
    assert_eq!(seen.uid, conn.effective_user_id());

    assert_eq!(conn.process_id(), Some(service.child.id() as i32));
}

#[tokio::test(flavor = "multi_thread")]
async fn oneway_returns_before_the_handler_finishes() {
    let service = Service::start("oneway", &[]);
    let conn = service.connect(None);
    let pause = Pause { seconds: 5.0 };

    let started = Instant::now();
    conn.send_oneway_message("pause", &pause)
        .expect("oneway should queue");
    conn.flush().await.expect("flush should succeed");
    assert!(started.elapsed() < Duration::from_millis(400));

    let started = Instant::now();
    let () = conn
        .send_message("pause", &pause)
        .await
        .expect("two-way pause should succeed");
    assert!(started.elapsed() >= Duration::from_millis(5 * PAUSE_UNIT_MS));
}

#[tokio::test(flavor = "multi_thread")]
async fn registered_domain_error_arrives_typed() {
    register_domain::<DemoFailure>();
    let service = Service::start("domain", &[]);
    let conn = service.connect(None);

    let err = conn
        .send_message::<_, ()>(
            "fail",
            &FailRequest {
                code: Some(7),
                reason: Some("quota".into()),
            },
        )
        .await
        .expect_err("fail should fail");
    assert_eq!(
        err.downcast_ref::<DemoFailure>(),
        Some(&DemoFailure {
            code: 7,
            reason: "quota".into(),
        })
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unregistered_domain_error_arrives_opaque() {
    let service = Service::start("opaque", &[]);
    let conn = service.connect(None);

    let err = conn
        .send_message::<_, ()>("fail-opaque", "gone")
        .await
        .expect_err("fail-opaque should fail");
    match err {
        XpcError::Unknown { description } => {
            assert_eq!(description, "unregistered failure: gone");
        }
        other => panic!("expected opaque error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn service_requirement_refuses_other_executables() {
    let service = Service::start("anchor", &["--requirement", "anchor self"]);
    let conn = service.connect(None);

    let err = conn
        .send_message::<_, String>("capitalize", "hi")
        .await
        .expect_err("test binary is not the service executable");
    assert!(matches!(err, XpcError::PeerForbidden(_)), "got {err:?}");
    assert!(conn.is_canceled());
}

#[tokio::test(flavor = "multi_thread")]
async fn client_requirement_checks_the_service_identifier() {
    let service = Service::start("client-req", &[]);

    let trusted = service.connect(Some("identifier \"xpckit\""));
    let reply: String = trusted
        .send_message("capitalize", "ok")
        .await
        .expect("service binary should satisfy its identifier");
    assert_eq!(reply, "OK");

    let suspicious = service.connect(Some("identifier \"not-xpckit\""));
    let err = suspicious
        .send_message::<_, String>("capitalize", "no")
        .await
        .expect_err("identifier mismatch should be forbidden");
    assert!(matches!(err, XpcError::PeerForbidden(_)), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn vended_endpoint_is_reachable_from_another_process() {
    let service = Service::start("endpoint", &[]);
    let conn = service.connect(None);

    let endpoint: Endpoint = conn
        .send_message("vend-endpoint", &())
        .await
        .expect("vend-endpoint should succeed");
    assert!(endpoint.socket_path().starts_with(&service.dir));

    let side = Connection::from_endpoint(&endpoint, None).expect("endpoint connection");
    side.activate().expect("endpoint connection should activate");
    let reply: String = side
        .send_message("capitalize", "side channel")
        .await
        .expect("anonymous listener should answer");
    assert_eq!(reply, "SIDE CHANNEL");
}

#[tokio::test(flavor = "multi_thread")]
async fn surface_is_mapped_into_the_caller() {
    let service = Service::start("surface", &[]);
    let conn = service.connect(None);

    let surface: SharedMemory = conn
        .send_message("fill-surface", &FillRequest { len: 8192, byte: 0x5a })
        .await
        .expect("fill-surface should succeed");
    assert_eq!(surface.len(), 8192);
    assert!(surface.to_vec().iter().all(|&byte| byte == 0x5a));

    surface.write_at(0, b"xy").expect("surface should be writable");
    let mut head = [0u8; 3];
    surface.read_at(0, &mut head).expect("surface should be readable");
    assert_eq!(&head, b"xyZ");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_message_names_fail_the_call() {
    let service = Service::start("missing", &[]);
    let conn = service.connect(None);

    let err = conn
        .send_message::<_, ()>("no-such-message", &())
        .await
        .expect_err("missing handler should fail");
    assert!(
        matches!(&err, XpcError::DispatchMissingHandler(name) if name == "no-such-message"),
        "got {err:?}"
    );
    assert!(conn.is_active());
}

#[tokio::test(flavor = "multi_thread")]
async fn service_exit_invalidates_pending_sends() {
    let mut service = Service::start("exit", &[]);
    let conn = service.connect(None);

    let pending = conn.send_message::<_, ()>("pause", &Pause { seconds: 100.0 });
    let waiter = tokio::spawn(pending);
    tokio::time::sleep(Duration::from_millis(300)).await;
    service.child.kill().expect("child should be killable");

    let err = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("pending send should resolve")
        .expect("task should not panic")
        .expect_err("pending send should fail");
    assert!(matches!(err, XpcError::ConnectionInvalid(_)), "got {err:?}");
}

#[test]
fn send_command_prints_the_reply() {
    let service = Service::start("cli-send", &[]);
    let output = service.cli(&[
        "--format",
        "json",
        "send",
        &service.name,
        "capitalize",
        "--json",
        "\"hi\"",
    ]);

    assert!(output.status.success(), "send failed: {output:?}");
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "\"HI\"");
}

#[test]
fn send_command_exits_nonzero_on_domain_error() {
    let service = Service::start("cli-fail", &[]);
    let output = service.cli(&["send", &service.name, "fail"]);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("demo failure 1"), "stderr: {stderr}");
}

#[test]
fn send_command_reports_a_missing_service() {
    let dir = unique_temp_dir("cli-missing");
    let output = Command::new(env!("CARGO_BIN_EXE_xpckit"))
        .args(["--log-level", "error", "send", "dev.xpckit.test.absent", "capitalize"])
        .env("XPCKIT_NAMESPACE_DIR", &dir)
        .output()
        .expect("cli should run");

    assert_eq!(output.status.code(), Some(3));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn oneway_send_command_does_not_wait_for_the_handler() {
    let service = Service::start("cli-oneway", &[]);
    let started = Instant::now();
    let output = service.cli(&[
        "send",
        &service.name,
        "pause",
        "--json",
        r#"{"seconds": 50}"#,
        "--oneway",
    ]);

    assert!(output.status.success(), "send failed: {output:?}");
    assert!(output.stdout.is_empty());
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn version_command_prints_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_xpckit"))
        .arg("version")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        format!("xpckit {}", env!("CARGO_PKG_VERSION"))
    );
}
