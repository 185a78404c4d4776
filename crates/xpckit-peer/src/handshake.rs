use std::fmt;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use xpckit_frame::{kind_name, Frame, FrameError, XpcCodec, CONTROL, DEFAULT_MAX_PAYLOAD, NO_REPLY_PORT};

use crate::error::{Result, XpcError};

const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;
const MAX_REASON_LEN: usize = 1024;

/// Client handshake request sent in a CONTROL frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Protocol name. Must be `xpckit` by default.
    pub protocol: String,
    /// Protocol version string.
    pub version: String,
}

/// Whether the server admits the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accepted,
    Forbidden,
}

/// Server handshake response sent in a CONTROL frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Protocol name. Must match request protocol.
    pub protocol: String,
    /// Server protocol version.
    pub version: String,
    /// Admission decision for this client.
    pub verdict: Verdict,
    /// Why the client was refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Configuration for handshake negotiation.
#[derive(Clone)]
pub struct HandshakeConfig {
    /// Timeout for each handshake step.
    pub timeout: Duration,
    /// Expected protocol name.
    pub protocol_name: String,
    /// Local protocol version.
    pub protocol_version: String,
    /// Maximum handshake frame payload size in bytes.
    pub max_handshake_payload: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: "xpckit".to_string(),
            protocol_version: "1.0".to_string(),
            max_handshake_payload: 16 * 1024,
        }
    }
}

impl fmt::Debug for HandshakeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeConfig")
            .field("timeout", &self.timeout)
            .field("protocol_name", &self.protocol_name)
            .field("protocol_version", &self.protocol_version)
            .field("max_handshake_payload", &self.max_handshake_payload)
            .finish()
    }
}

/// Run the client side of the handshake.
///
/// A `forbidden` verdict comes back as [`XpcError::PeerForbidden`].
pub async fn handshake_client<T>(
    framed: &mut Framed<T, XpcCodec>,
    config: &HandshakeConfig,
) -> Result<HandshakeResponse>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;

    framed
        .codec_mut()
        .set_max_payload_size(config.max_handshake_payload);

    let req = HandshakeRequest {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
    };
    send_control_json(framed, &req, config.timeout).await?;

    let payload = recv_control_payload(framed, config).await?;
    let resp: HandshakeResponse = serde_json::from_slice(&payload)
        .map_err(|err| XpcError::HandshakeFailed(format!("invalid response: {err}")))?;

    validate_protocol_name(&resp.protocol)?;
    validate_version(&resp.version)?;

    if resp.protocol != config.protocol_name {
        return Err(XpcError::HandshakeFailed(format!(
            "unknown protocol '{}' (expected '{}')",
            resp.protocol, config.protocol_name
        )));
    }

    if !is_version_compatible(&config.protocol_version, &resp.version)? {
        return Err(XpcError::HandshakeFailed(format!(
            "incompatible version '{}' (local '{}')",
            resp.version, config.protocol_version
        )));
    }

    if resp.verdict == Verdict::Forbidden {
        let reason = resp
            .reason
            .clone()
            .unwrap_or_else(|| "refused by listener".to_string());
        return Err(XpcError::PeerForbidden(reason));
    }

    // Handshake uses a tighter pre-auth payload budget; restore runtime defaults after auth.
    framed.codec_mut().set_max_payload_size(DEFAULT_MAX_PAYLOAD);
    Ok(resp)
}

/// Run the server side of the handshake.
///
/// `admission` is the listener's decision about this peer. A refused peer
/// still gets a response naming the reason, then this returns
/// [`XpcError::PeerForbidden`] so the caller drops the stream.
pub async fn handshake_server<T>(
    framed: &mut Framed<T, XpcCodec>,
    config: &HandshakeConfig,
    admission: std::result::Result<(), String>,
) -> Result<HandshakeRequest>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;

    framed
        .codec_mut()
        .set_max_payload_size(config.max_handshake_payload);

    let payload = recv_control_payload(framed, config).await?;
    let req: HandshakeRequest = serde_json::from_slice(&payload)
        .map_err(|err| XpcError::HandshakeFailed(format!("invalid request: {err}")))?;

    validate_protocol_name(&req.protocol)?;
    validate_version(&req.version)?;

    if req.protocol != config.protocol_name {
        return Err(XpcError::HandshakeFailed(format!(
            "unknown protocol '{}' (expected '{}')",
            req.protocol, config.protocol_name
        )));
    }

    if !is_version_compatible(&req.version, &config.protocol_version)? {
        return Err(XpcError::HandshakeFailed(format!(
            "incompatible version '{}' (server '{}')",
            req.version, config.protocol_version
        )));
    }

    let (verdict, reason) = match &admission {
        Ok(()) => (Verdict::Accepted, None),
        Err(reason) => (Verdict::Forbidden, Some(truncate(reason))),
    };
    let resp = HandshakeResponse {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        verdict,
        reason,
    };
    send_control_json(framed, &resp, config.timeout).await?;

    if let Err(reason) = admission {
        return Err(XpcError::PeerForbidden(reason));
    }

    framed.codec_mut().set_max_payload_size(DEFAULT_MAX_PAYLOAD);
    Ok(req)
}

async fn send_control_json<T, V>(
    framed: &mut Framed<T, XpcCodec>,
    value: &V,
    timeout: Duration,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    V: Serialize,
{
    let payload = serde_json::to_vec(value)
        .map_err(|err| XpcError::HandshakeFailed(format!("encode failed: {err}")))?;
    tokio::time::timeout(timeout, framed.send(Frame::new(CONTROL, NO_REPLY_PORT, payload)))
        .await
        .map_err(|_| XpcError::Timeout(timeout))??;
    Ok(())
}

async fn recv_control_payload<T>(
    framed: &mut Framed<T, XpcCodec>,
    config: &HandshakeConfig,
) -> Result<bytes::Bytes>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let next = tokio::time::timeout(config.timeout, framed.next())
        .await
        .map_err(|_| XpcError::Timeout(config.timeout))?;
    match next {
        Some(Ok(frame)) if frame.kind == CONTROL => Ok(frame.payload),
        Some(Ok(frame)) => Err(XpcError::HandshakeFailed(format!(
            "expected CONTROL frame, got {}",
            kind_name(frame.kind)
        ))),
        Some(Err(FrameError::PayloadTooLarge { size, max })) => Err(XpcError::HandshakeFailed(
            format!("handshake payload too large: {size} (max {max})"),
        )),
        Some(Err(FrameError::ConnectionClosed)) | None => Err(XpcError::ConnectionInvalid(
            "connection closed during handshake".to_string(),
        )),
        Some(Err(err)) => Err(XpcError::Frame(err)),
    }
}

fn truncate(reason: &str) -> String {
    if reason.len() <= MAX_REASON_LEN {
        return reason.to_string();
    }
    let mut end = MAX_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

fn validate_protocol_name(protocol: &str) -> Result<()> {
    if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
        return Err(XpcError::HandshakeFailed(format!(
            "invalid protocol name length: {}",
            protocol.len()
        )));
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(XpcError::HandshakeFailed(format!(
            "invalid protocol version length: {}",
            version.len()
        )));
    }
    let _ = parse_version(version)?;
    Ok(())
}

fn is_version_compatible(client_version: &str, server_version: &str) -> Result<bool> {
    let (client_major, client_minor) = parse_version(client_version)?;
    let (server_major, server_minor) = parse_version(server_version)?;

    Ok(client_major == server_major && client_minor >= server_minor)
}

fn parse_version(version: &str) -> Result<(u16, u16)> {
    let invalid = |why: &str| XpcError::HandshakeFailed(format!("invalid version '{version}': {why}"));
    let (major, minor) = version
        .split_once('.')
        .ok_or_else(|| invalid("expected '<major>.<minor>'"))?;
    let major = major.parse::<u16>().map_err(|_| invalid("non-numeric major"))?;
    let minor = minor.parse::<u16>().map_err(|_| invalid("non-numeric minor"))?;
    Ok((major, minor))
}
