use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

use crate::credentials::PeerCredentials;
use crate::error::{Result, TransportError};

/// Unix domain socket listening endpoint.
///
/// The socket is bound eagerly so its path exists as soon as the value does,
/// but accepting needs a tokio runtime and is deferred to [`Self::listener`].
/// The socket file is removed on `Drop` unless it was replaced meanwhile.
pub struct UnixDomainSocket {
    listener: StdUnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
}

impl UnixDomainSocket {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind a filesystem-path Unix domain socket.
    ///
    /// If `path` already exists and is a socket, it is removed first (stale
    /// socket cleanup). Any other kind of file makes the bind fail.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind a filesystem-path Unix domain socket with explicit mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        check_path_len(&path)?;

        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(|e| bind_err(&path, e))?;
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(|e| bind_err(&path, e))?;
            } else {
                return Err(bind_err(
                    &path,
                    std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                ));
            }
        }

        let listener = StdUnixListener::bind(&path).map_err(|e| bind_err(&path, e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| bind_err(&path, e))?;

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| bind_err(&path, e))?;
        let created = std::fs::symlink_metadata(&path).map_err(|e| bind_err(&path, e))?;

        info!(?path, "bound unix domain socket");

        Ok(Self {
            listener,
            path,
            created_inode: Some((created.dev(), created.ino())),
        })
    }

    /// Hand out an async listener sharing this socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn listener(&self) -> Result<UnixListener> {
        tokio::runtime::Handle::try_current()
            .map_err(|err| TransportError::NoRuntime(err.to_string()))?;
        let cloned = self.listener.try_clone()?;
        UnixListener::from_std(cloned).map_err(TransportError::Io)
    }

    /// Accept one connection and read its kernel credentials.
    pub async fn accept(listener: &UnixListener) -> Result<(UnixStream, PeerCredentials)> {
        let (stream, _addr) = listener.accept().await.map_err(TransportError::Accept)?;
        let credentials = PeerCredentials::from_stream(&stream)?;
        debug!(pid = ?credentials.pid, uid = credentials.euid, "accepted connection");
        Ok((stream, credentials))
    }

    /// Connect to a listening Unix domain socket.
    pub async fn connect(path: impl AsRef<Path>) -> Result<(UnixStream, PeerCredentials)> {
        let path = path.as_ref();
        check_path_len(path)?;
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| TransportError::Connect {
                path: path.to_path_buf(),
                source: e,
            })?;
        let credentials = PeerCredentials::from_stream(&stream)?;
        debug!(?path, pid = ?credentials.pid, "connected to unix domain socket");
        Ok((stream, credentials))
    }

    /// The path this socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the socket file so no new peer can find it.
    ///
    /// Skipped when the path now names a different file. Already-accepted
    /// streams are unaffected.
    pub fn unlink(&self) {
        let Some((expected_dev, expected_ino)) = self.created_inode else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
            }
        }
    }
}

impl std::fmt::Debug for UnixDomainSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixDomainSocket")
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        self.unlink();
    }
}

fn check_path_len(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    if len >= UnixDomainSocket::MAX_PATH_LEN {
        return Err(TransportError::PathTooLong {
            path: path.to_path_buf(),
            len,
            max: UnixDomainSocket::MAX_PATH_LEN,
        });
    }
    Ok(())
}

fn bind_err(path: &Path, source: std::io::Error) -> TransportError {
    TransportError::Bind {
        path: path.to_path_buf(),
        source,
    }
}
