use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::error::{Result, TransportError};

/// Environment variable overriding the per-user namespace directory.
pub const NAMESPACE_DIR_ENV: &str = "XPCKIT_NAMESPACE_DIR";
/// Environment variable overriding the privileged (system) namespace directory.
pub const SYSTEM_NAMESPACE_DIR_ENV: &str = "XPCKIT_SYSTEM_NAMESPACE_DIR";

/// Maximum length of a service name in bytes.
pub const MAX_SERVICE_NAME_LEN: usize = 128;

const DEFAULT_SYSTEM_DIR: &str = "/var/run/xpckit";
const ANONYMOUS_SUBDIR: &str = "anonymous";
const SURFACES_SUBDIR: &str = "surfaces";

static NEXT_ANONYMOUS: AtomicU64 = AtomicU64::new(1);

/// Maps service names to socket paths.
///
/// Services that need privileged installation live in the system directory;
/// everything else lives in the per-user directory, which also holds
/// anonymous listener sockets and shared-memory surfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNamespace {
    user_dir: PathBuf,
    system_dir: PathBuf,
}

impl ServiceNamespace {
    /// Namespace rooted at `user_dir`, with the default system directory.
    pub fn new(user_dir: impl Into<PathBuf>) -> Self {
        Self {
            user_dir: user_dir.into(),
            system_dir: PathBuf::from(DEFAULT_SYSTEM_DIR),
        }
    }

    /// Namespace configured from `XPCKIT_NAMESPACE_DIR` and
    /// `XPCKIT_SYSTEM_NAMESPACE_DIR`, falling back to defaults.
    pub fn from_env() -> Self {
        let user_dir = std::env::var_os(NAMESPACE_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(default_user_dir);
        let system_dir = std::env::var_os(SYSTEM_NAMESPACE_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SYSTEM_DIR));
        Self {
            user_dir,
            system_dir,
        }
    }

    /// Override the privileged service directory.
    pub fn with_system_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.system_dir = dir.into();
        self
    }

    /// Per-user namespace directory.
    pub fn user_dir(&self) -> &Path {
        &self.user_dir
    }

    /// Privileged service directory.
    pub fn system_dir(&self) -> &Path {
        &self.system_dir
    }

    /// Directory holding shared-memory surface backing files.
    pub fn surfaces_dir(&self) -> PathBuf {
        self.user_dir.join(SURFACES_SUBDIR)
    }

    /// Socket path for a named service.
    pub fn service_path(&self, name: &str, privileged: bool) -> Result<PathBuf> {
        validate_service_name(name)?;
        let dir = if privileged {
            &self.system_dir
        } else {
            &self.user_dir
        };
        Ok(dir.join(format!("{name}.sock")))
    }

    /// Fresh, unique socket path for an anonymous listener.
    ///
    /// Creates the anonymous directory if needed.
    pub fn allocate_anonymous_path(&self) -> Result<PathBuf> {
        let dir = self.user_dir.join(ANONYMOUS_SUBDIR);
        ensure_private_dir(&dir)?;
        let seq = NEXT_ANONYMOUS.fetch_add(1, Ordering::Relaxed);
        Ok(dir.join(format!("{}-{seq}.sock", std::process::id())))
    }

    /// Create the directory that will hold a socket, owner-only.
    pub fn prepare_socket_dir(&self, socket_path: &Path) -> Result<()> {
        match socket_path.parent() {
            Some(parent) => ensure_private_dir(parent),
            None => Ok(()),
        }
    }
}

impl Default for ServiceNamespace {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Validate a reverse-DNS style service name.
pub fn validate_service_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_SERVICE_NAME_LEN
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'));
    if valid {
        Ok(())
    } else {
        Err(TransportError::InvalidServiceName(name.to_string()))
    }
}

/// Create `dir` (and parents) and restrict it to the owner.
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).map_err(|e| TransportError::Bind {
        path: dir.to_path_buf(),
        source: e,
    })?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).map_err(|e| {
        TransportError::Bind {
            path: dir.to_path_buf(),
            source: e,
        }
    })?;
    debug!(?dir, "created namespace directory");
    Ok(())
}

fn default_user_dir() -> PathBuf {
    // SAFETY: geteuid takes no arguments and cannot fail.
    let uid = unsafe { libc::geteuid() };
    std::env::temp_dir().join(format!("xpckit-{uid}"))
}
