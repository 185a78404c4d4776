use std::io::Write;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};
use xpckit::demo::{self, DemoOptions};
use xpckit_peer::{Listener, ListenerKind, ServiceNamespace};

use crate::cmd::{runtime, ServeArgs};
use crate::exit::{io_error, xpc_error, CliError, CliResult, INTERNAL, SUCCESS};

pub fn run(args: ServeArgs) -> CliResult<i32> {
    runtime()?.block_on(serve(args))
}

async fn serve(args: ServeArgs) -> CliResult<i32> {
    let namespace = ServiceNamespace::from_env();
    let kind = ListenerKind::NamedService {
        name: args.name.clone(),
        privileged: args.privileged,
    };
    let listener = Listener::new_in(kind, args.requirement.as_deref(), &namespace)
        .map_err(|err| xpc_error("listen failed", err))?;

    let service = demo::install(
        &listener,
        DemoOptions {
            namespace,
            pause_unit: Duration::from_millis(args.pause_unit_ms),
        },
    );
    listener.set_error_handler(|err| warn!(error = %err, "connection error"));

    let (stop_tx, mut stop_rx) = watch::channel(false);
    install_ctrlc_handler(stop_tx)?;

    listener
        .activate()
        .map_err(|err| xpc_error("activate failed", err))?;
    info!(service = %args.name, path = ?listener.path(), "serving demo service");

    // Test harnesses wait for this line before connecting.
    let mut stdout = std::io::stdout();
    writeln!(stdout, "ready")
        .and_then(|()| stdout.flush())
        .map_err(|err| io_error("write failed", err))?;

    let _ = stop_rx.wait_for(|stop| *stop).await;

    info!(
        service = %args.name,
        connections = listener.connections().len(),
        vended = service.vended(),
        "shutting down"
    );
    service.shutdown();
    listener.cancel();
    Ok(SUCCESS)
}

fn install_ctrlc_handler(stop: watch::Sender<bool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        let _ = stop.send(true);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
