use std::path::{Path, PathBuf};

use tokio::net::UnixStream;

use crate::error::{Result, TransportError};

/// Kernel-reported identity of the process on the other end of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Process id, when the platform reports it.
    pub pid: Option<i32>,
    /// Effective user id.
    pub euid: u32,
    /// Effective group id.
    pub egid: u32,
    /// Audit session id (the peer's session id on this platform).
    pub asid: Option<i32>,
}

impl PeerCredentials {
    /// Read credentials of the peer connected to `stream`.
    pub fn from_stream(stream: &UnixStream) -> Result<Self> {
        let cred = stream.peer_cred().map_err(TransportError::Credentials)?;
        let pid = cred.pid();
        Ok(Self {
            pid,
            euid: cred.uid(),
            egid: cred.gid(),
            asid: pid.and_then(session_of),
        })
    }

    /// Credentials of the calling process.
    pub fn current() -> Self {
        // SAFETY: these calls take no arguments and cannot fail.
        let (pid, euid, egid) = unsafe { (libc::getpid(), libc::geteuid(), libc::getegid()) };
        Self {
            pid: Some(pid),
            euid,
            egid,
            asid: session_of(pid),
        }
    }
}

fn session_of(pid: i32) -> Option<i32> {
    // SAFETY: getsid only reads kernel process tables.
    let sid = unsafe { libc::getsid(pid) };
    (sid >= 0).then_some(sid)
}

/// Code identity of a process, evaluated by code signing requirements.
///
/// Every field is sourced from the kernel, never from the peer itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeIdentity {
    /// Absolute path of the running executable.
    pub path: Option<PathBuf>,
    /// Signing identifier: the executable's file name.
    pub identifier: Option<String>,
    /// Effective user id.
    pub uid: u32,
    /// Effective group id.
    pub gid: u32,
}

impl CodeIdentity {
    /// Resolve the code identity behind a set of peer credentials.
    pub fn of_peer(credentials: &PeerCredentials) -> Self {
        let path = credentials.pid.and_then(executable_path);
        Self::from_parts(path, credentials.euid, credentials.egid)
    }

    /// Code identity of the calling process.
    pub fn current() -> Self {
        let creds = PeerCredentials::current();
        let path = std::env::current_exe()
            .ok()
            .map(|p| std::fs::canonicalize(&p).unwrap_or(p));
        Self::from_parts(path, creds.euid, creds.egid)
    }

    /// Build an identity from explicit parts.
    pub fn from_parts(path: Option<PathBuf>, uid: u32, gid: u32) -> Self {
        let identifier = path.as_deref().and_then(identifier_of);
        Self {
            path,
            identifier,
            uid,
            gid,
        }
    }
}

fn identifier_of(path: &Path) -> Option<String> {
    path.file_name().map(|name| name.to_string_lossy().into_owned())
}

#[cfg(target_os = "linux")]
fn executable_path(pid: i32) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/{pid}/exe")).ok()
}

#[cfg(target_os = "macos")]
fn executable_path(pid: i32) -> Option<PathBuf> {
    use std::os::unix::ffi::OsStrExt;

    let mut buf = vec![0u8; libc::PROC_PIDPATHINFO_MAXSIZE as usize];
    // SAFETY: buf is a writable buffer of the declared size.
    let len = unsafe {
        libc::proc_pidpath(
            pid,
            buf.as_mut_ptr().cast::<libc::c_void>(),
            buf.len() as u32,
        )
    };
    if len <= 0 {
        return None;
    }
    buf.truncate(len as usize);
    Some(PathBuf::from(std::ffi::OsStr::from_bytes(&buf)))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn executable_path(_pid: i32) -> Option<PathBuf> {
    None
}
