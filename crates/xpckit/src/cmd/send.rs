use std::time::Duration;

use tracing::debug;
use xpckit_peer::{Connection, XpcObject};

use crate::cmd::{parse_duration, runtime, SendArgs};
use crate::exit::{xpc_error, CliError, CliResult, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_reply, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let payload = resolve_payload(args.json.as_deref())?;
    runtime()?.block_on(send(args, payload, timeout, format))
}

async fn send(
    args: SendArgs,
    payload: XpcObject,
    timeout: Duration,
    format: OutputFormat,
) -> CliResult<i32> {
    let conn = Connection::to_service(&args.service, args.privileged, args.requirement.as_deref())
        .map_err(|err| xpc_error("connect failed", err))?;
    conn.activate()
        .map_err(|err| xpc_error("connect failed", err))?;

    let result = if args.oneway {
        send_oneway(&conn, &args.message, payload, timeout).await
    } else {
        send_two_way(&conn, &args.message, payload, timeout, format).await
    };
    conn.cancel();
    result
}

async fn send_oneway(
    conn: &Connection,
    message: &str,
    payload: XpcObject,
    timeout: Duration,
) -> CliResult<i32> {
    conn.send_raw_oneway_message(message, payload)
        .map_err(|err| xpc_error("send failed", err))?;
    match tokio::time::timeout(timeout, conn.flush()).await {
        Ok(flushed) => flushed.map_err(|err| xpc_error("send failed", err))?,
        Err(_) => return Err(timed_out(timeout)),
    }
    debug!(message, "oneway message written");
    Ok(SUCCESS)
}

async fn send_two_way(
    conn: &Connection,
    message: &str,
    payload: XpcObject,
    timeout: Duration,
    format: OutputFormat,
) -> CliResult<i32> {
    let reply = match tokio::time::timeout(timeout, conn.send_raw_message(message, payload)).await
    {
        Ok(reply) => reply.map_err(|err| xpc_error("send failed", err))?,
        Err(_) => return Err(timed_out(timeout)),
    };
    print_reply(message, &reply, format);
    Ok(SUCCESS)
}

fn timed_out(timeout: Duration) -> CliError {
    CliError::new(TIMEOUT, format!("no reply within {timeout:?}"))
}

fn resolve_payload(json: Option<&str>) -> CliResult<XpcObject> {
    match json {
        Some(text) => serde_json::from_str::<XpcObject>(text)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}"))),
        None => Ok(XpcObject::Null),
    }
}
