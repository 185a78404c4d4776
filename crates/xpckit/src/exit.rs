use std::fmt;
use std::io;

use xpckit_frame::FrameError;
use xpckit_peer::XpcError;
use xpckit_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidServiceName(_) => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn xpc_error(context: &str, err: XpcError) -> CliError {
    let code = match err {
        XpcError::Transport(inner) => return transport_error(context, inner),
        XpcError::PeerForbidden(_) => PERMISSION_DENIED,
        XpcError::Timeout(_) => TIMEOUT,
        XpcError::ConnectionInvalid(_) | XpcError::HandshakeFailed(_) => TRANSPORT_ERROR,
        XpcError::Frame(FrameError::PayloadTooLarge { .. })
        | XpcError::EncodingUnsupported(_)
        | XpcError::DecodingMismatch { .. }
        | XpcError::Bridge(_)
        | XpcError::Wire(_) => DATA_INVALID,
        XpcError::Frame(_) => TRANSPORT_ERROR,
        XpcError::InvalidCodeSignatureRequirement { .. } | XpcError::DispatchMissingHandler(_) => {
            USAGE
        }
        XpcError::Domain(_) | XpcError::Unknown { .. } => FAILURE,
        XpcError::NotActivated => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn xpc_errors_map_to_exit_codes() {
        let cases = [
            (XpcError::PeerForbidden("no".into()), PERMISSION_DENIED),
            (XpcError::Timeout(Duration::from_secs(1)), TIMEOUT),
            (XpcError::ConnectionInvalid("gone".into()), TRANSPORT_ERROR),
            (XpcError::DispatchMissingHandler("x".into()), USAGE),
            (XpcError::unknown("boom"), FAILURE),
        ];
        for (err, code) in cases {
            assert_eq!(xpc_error("send failed", err).code, code);
        }
    }

    #[test]
    fn missing_service_socket_is_a_transport_error() {
        let err = XpcError::Transport(TransportError::Connect {
            path: "/tmp/missing.sock".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        });
        let mapped = xpc_error("connect failed", err);
        assert_eq!(mapped.code, TRANSPORT_ERROR);
        assert!(mapped.message.starts_with("connect failed: "));
    }
}
