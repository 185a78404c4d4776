use std::cell::RefCell;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Error as _;
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, warn};
use xpckit_transport::namespace::ensure_private_dir;
use xpckit_transport::ServiceNamespace;

use crate::error::SurfaceError;
use crate::token;

/// Well-known dictionary key for a surface carried in a raw message.
pub const SURFACE_KEY: &str = "surface";

const SURFACE_EXTENSION: &str = "surface";

static NEXT_SURFACE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Hands the live surface across a serde newtype boundary.
    static IN_FLIGHT: RefCell<Option<SharedMemory>> = const { RefCell::new(None) };
}

/// Zero-copy memory region that can be sent to another process.
///
/// The region is a `MAP_SHARED` mapping of a backing file. Sending it moves
/// the capability: the receiver maps the same file and removes its name, so
/// both sides then address the same memory and nothing is left behind on
/// disk. A surface can be transferred once; encoding it again fails.
///
/// Equality is identity of the backing memory, not content.
#[derive(Clone)]
pub struct SharedMemory {
    mapping: Arc<Mapping>,
}

struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    path: PathBuf,
    identity: (u64, u64),
    // True while the backing file still has a name this process must clean up.
    published: AtomicBool,
    _file: File,
}

// SAFETY: the mapping is plain shared memory; all access goes through
// bounds-checked copies and the pointer is never handed out mutably.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl SharedMemory {
    /// Create a zero-filled surface of `len` bytes in the default namespace.
    pub fn create(len: usize) -> Result<Self, SurfaceError> {
        Self::create_in(&ServiceNamespace::from_env().surfaces_dir(), len)
    }

    /// Create a zero-filled surface of `len` bytes backed by a file in `dir`.
    pub fn create_in(dir: &Path, len: usize) -> Result<Self, SurfaceError> {
        if len == 0 {
            return Err(SurfaceError::InvalidLength(len));
        }
        ensure_private_dir(dir).map_err(|err| SurfaceError::Io {
            path: dir.to_path_buf(),
            source: std::io::Error::other(err.to_string()),
        })?;

        let seq = NEXT_SURFACE.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("{}-{seq}.{SURFACE_EXTENSION}", std::process::id()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|source| io_err(&path, source))?;
        file.set_len(len as u64)
            .map_err(|source| io_err(&path, source))?;

        let mapping = Mapping::map(file, path, len, true)?;
        debug!(path = ?mapping.path, len, "created shared memory surface");
        Ok(Self {
            mapping: Arc::new(mapping),
        })
    }

    /// Map a surface that another process transferred to us.
    ///
    /// Only owner-private `.surface` regular files are accepted. The name
    /// is removed once mapped.
    pub fn receive(path: &Path, len: usize) -> Result<Self, SurfaceError> {
        if len == 0 {
            return Err(SurfaceError::InvalidLength(len));
        }
        validate_received_path(path)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| io_err(path, source))?;
        let size = file
            .metadata()
            .map_err(|source| io_err(path, source))?
            .len();
        if size < len as u64 {
            return Err(SurfaceError::Untrusted {
                path: path.to_path_buf(),
                reason: format!("backing file holds {size} bytes, {len} announced"),
            });
        }

        let mapping = Mapping::map(file, path.to_path_buf(), len, false)?;
        if let Err(err) = std::fs::remove_file(path) {
            warn!(?path, error = %err, "failed removing received surface name");
        }
        debug!(?path, len, "received shared memory surface");
        Ok(Self {
            mapping: Arc::new(mapping),
        })
    }

    /// Claim the backing name for a transfer.
    ///
    /// Returns the path and length to put on the wire. Fails when the
    /// surface was already transferred or was itself received.
    pub fn take_for_transfer(&self) -> Result<(PathBuf, usize), SurfaceError> {
        if self.mapping.published.swap(false, Ordering::AcqRel) {
            Ok((self.mapping.path.clone(), self.mapping.len))
        } else {
            Err(SurfaceError::AlreadyTransferred(self.mapping.path.clone()))
        }
    }

    // Hand a claimed name back, so the last handle removes it again.
    fn restore_name(&self) {
        self.mapping.published.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.mapping.len
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.len == 0
    }

    /// Path of the backing file (removed once transferred).
    pub fn backing_path(&self) -> &Path {
        &self.mapping.path
    }

    /// Whether both handles address the same backing memory.
    pub fn same_memory(&self, other: &SharedMemory) -> bool {
        self.mapping.identity == other.mapping.identity
    }

    /// Copy bytes out of the surface starting at `offset`.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), SurfaceError> {
        self.check_bounds(offset, buf.len())?;
        // SAFETY: bounds were checked against the mapped length and `buf` is
        // a distinct allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.mapping.ptr.as_ptr().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Copy `data` into the surface starting at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), SurfaceError> {
        self.check_bounds(offset, data.len())?;
        // SAFETY: bounds were checked against the mapped length and `data`
        // is a distinct allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.mapping.ptr.as_ptr().add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    /// Set every byte of the surface to `byte`.
    pub fn fill(&self, byte: u8) {
        // SAFETY: writes exactly the mapped length.
        unsafe {
            std::ptr::write_bytes(self.mapping.ptr.as_ptr(), byte, self.mapping.len);
        }
    }

    /// Copy the whole surface into a vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.mapping.len];
        // SAFETY: `out` has exactly the mapped length.
        unsafe {
            std::ptr::copy_nonoverlapping(self.mapping.ptr.as_ptr(), out.as_mut_ptr(), out.len());
        }
        out
    }

    /// Raw pointer to the mapped region, for handing to GPU or CPU APIs.
    ///
    /// The memory is shared with other processes; callers synchronize
    /// access themselves.
    pub fn as_ptr(&self) -> *mut u8 {
        self.mapping.ptr.as_ptr()
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), SurfaceError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.mapping.len => Ok(()),
            _ => Err(SurfaceError::OutOfBounds {
                offset,
                len,
                size: self.mapping.len,
            }),
        }
    }
}

/// Surfaces claimed by an encode whose bytes have not reached the peer.
///
/// Dropping the claims hands every backing name back to its surface, so a
/// message that is never written leaves nothing behind on disk. Call
/// [`TransferClaims::commit`] once the bytes are written.
#[derive(Debug, Default)]
#[must_use = "dropping the claims undoes the transfer"]
pub struct TransferClaims {
    surfaces: Vec<SharedMemory>,
}

impl TransferClaims {
    pub(crate) fn push(&mut self, surface: SharedMemory) {
        self.surfaces.push(surface);
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    /// The bytes reached the peer; the peer now owns the backing names.
    pub fn commit(mut self) {
        self.surfaces.clear();
    }
}

impl Drop for TransferClaims {
    fn drop(&mut self) {
        for surface in self.surfaces.drain(..) {
            debug!(path = ?surface.mapping.path, "surface was not delivered; reclaiming name");
            surface.restore_name();
        }
    }
}

impl Mapping {
    fn map(file: File, path: PathBuf, len: usize, published: bool) -> Result<Self, SurfaceError> {
        let metadata = file.metadata().map_err(|source| io_err(&path, source))?;
        // SAFETY: fd is open read/write for at least `len` bytes; a null hint
        // lets the kernel choose the address.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io_err(&path, std::io::Error::last_os_error()));
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io_err(&path, std::io::Error::other("mmap returned null")))?;
        Ok(Self {
            ptr,
            len,
            identity: (metadata.dev(), metadata.ino()),
            path,
            published: AtomicBool::new(published),
            _file: file,
        })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe a mapping created in `Mapping::map`.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.len);
        }
        if self.published.load(Ordering::Acquire) {
            debug!(path = ?self.path, "removing untransferred surface");
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl PartialEq for SharedMemory {
    fn eq(&self, other: &Self) -> bool {
        self.same_memory(other)
    }
}

impl Eq for SharedMemory {}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("path", &self.mapping.path)
            .field("len", &self.mapping.len)
            .finish()
    }
}

impl Serialize for SharedMemory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let path = self
            .mapping
            .path
            .to_str()
            .ok_or_else(|| S::Error::custom("surface path is not valid UTF-8"))?;
        IN_FLIGHT.with(|slot| *slot.borrow_mut() = Some(self.clone()));
        let result = serializer.serialize_newtype_struct(token::SURFACE, path);
        IN_FLIGHT.with(|slot| slot.borrow_mut().take());
        result
    }
}

impl<'de> Deserialize<'de> for SharedMemory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_newtype_struct(token::SURFACE, SurfaceVisitor)
    }
}

struct SurfaceVisitor;

impl<'de> Visitor<'de> for SurfaceVisitor {
    type Value = SharedMemory;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a shared memory surface")
    }

    fn visit_newtype_struct<D: Deserializer<'de>>(self, d: D) -> Result<SharedMemory, D::Error> {
        let _path = String::deserialize(d)?;
        take_in_flight().ok_or_else(|| de::Error::custom(SurfaceError::NotNative))
    }
}

/// Park a surface for the bridge while a serde newtype is in progress.
pub(crate) fn park_in_flight(surface: SharedMemory) {
    IN_FLIGHT.with(|slot| *slot.borrow_mut() = Some(surface));
}

/// Take the surface parked by [`park_in_flight`] or `SharedMemory::serialize`.
pub(crate) fn take_in_flight() -> Option<SharedMemory> {
    IN_FLIGHT.with(|slot| slot.borrow_mut().take())
}

fn validate_received_path(path: &Path) -> Result<(), SurfaceError> {
    let untrusted = |reason: &str| SurfaceError::Untrusted {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if path.extension().and_then(|ext| ext.to_str()) != Some(SURFACE_EXTENSION) {
        return Err(untrusted("not a surface file"));
    }
    let metadata = std::fs::symlink_metadata(path).map_err(|source| io_err(path, source))?;
    if !metadata.file_type().is_file() {
        return Err(untrusted("not a regular file"));
    }
    // SAFETY: geteuid takes no arguments and cannot fail.
    if metadata.uid() != unsafe { libc::geteuid() } {
        return Err(untrusted("owned by another user"));
    }
    if metadata.mode() & 0o077 != 0 {
        return Err(untrusted("accessible to other users"));
    }
    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> SurfaceError {
    SurfaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "xpckit-surf-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ))
    }

    #[test]
    fn transfer_shares_memory_and_consumes_name() {
        let dir = temp_dir("transfer");
        let sender = SharedMemory::create_in(&dir, 64).unwrap();
        sender.fill(0xAB);

        let (path, len) = sender.take_for_transfer().unwrap();
        let receiver = SharedMemory::receive(&path, len).unwrap();
        assert!(!path.exists(), "receiver consumes the backing name");
        assert_eq!(receiver, sender);
        assert_eq!(receiver.to_vec(), vec![0xAB; 64]);

        receiver.write_at(0, b"zero-copy").unwrap();
        let mut buf = [0u8; 9];
        sender.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"zero-copy");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn surfaces_move_only_once() {
        let dir = temp_dir("once");
        let surface = SharedMemory::create_in(&dir, 8).unwrap();
        surface.take_for_transfer().unwrap();
        assert!(matches!(
            surface.take_for_transfer(),
            Err(SurfaceError::AlreadyTransferred(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn untransferred_surface_is_removed_on_drop() {
        let dir = temp_dir("drop");
        let surface = SharedMemory::create_in(&dir, 16).unwrap();
        let path = surface.backing_path().to_path_buf();
        assert!(path.exists());
        drop(surface);
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn dropped_claims_give_the_name_back() {
        let dir = temp_dir("claims");
        let surface = SharedMemory::create_in(&dir, 32).unwrap();
        let path = surface.backing_path().to_path_buf();

        let mut claims = TransferClaims::default();
        surface.take_for_transfer().unwrap();
        claims.push(surface.clone());
        drop(claims);

        // Reclaimed: it can be sent again, and the last handle removes it.
        let mut claims = TransferClaims::default();
        surface.take_for_transfer().unwrap();
        claims.push(surface.clone());
        drop(surface);
        assert!(path.exists());
        drop(claims);
        assert!(!path.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn committed_claims_keep_the_name_for_the_peer() {
        let dir = temp_dir("commit");
        let surface = SharedMemory::create_in(&dir, 32).unwrap();
        let path = surface.backing_path().to_path_buf();

        let mut claims = TransferClaims::default();
        let (claimed, _) = surface.take_for_transfer().unwrap();
        claims.push(surface.clone());
        claims.commit();
        drop(surface);
        assert!(path.exists());
        assert_eq!(claimed, path);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bounds_and_lengths_are_checked() {
        let dir = temp_dir("bounds");
        assert!(matches!(
            SharedMemory::create_in(&dir, 0),
            Err(SurfaceError::InvalidLength(0))
        ));
        let surface = SharedMemory::create_in(&dir, 4).unwrap();
        assert!(matches!(
            surface.write_at(2, b"abc"),
            Err(SurfaceError::OutOfBounds { .. })
        ));
        assert!(surface.write_at(usize::MAX, b"a").is_err());
        drop(surface);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn receive_refuses_foreign_paths() {
        let dir = temp_dir("refuse");
        std::fs::create_dir_all(&dir).unwrap();
        let plain = dir.join("notes.txt");
        std::fs::write(&plain, b"keep me").unwrap();
        assert!(matches!(
            SharedMemory::receive(&plain, 4),
            Err(SurfaceError::Untrusted { .. })
        ));
        assert!(plain.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
