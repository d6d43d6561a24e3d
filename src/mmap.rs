//! Anonymous shared-memory file creation and sizing.
//!
//! Two peers exchange a file descriptor out-of-band (typically an
//! `SCM_RIGHTS` ancillary message over a UDS, which is out of scope here)
//! and both `mmap` it `MAP_SHARED`. The file itself comes from
//! `memfd_create`, so nothing ever touches a path on disk.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use memmap2::MmapRaw;

use crate::arena::header::ArenaHeader;

/// Create an anonymous in-memory file sized to hold an [`ArenaHeader`]
/// followed by `buffer_size` bytes (the allocator header plus the block
/// region).
///
/// Returns the owned file descriptor; the caller is responsible for
/// `mmap`-ing it locally and for handing a duplicate to the peer.
pub fn create_mapping(name: &str, buffer_size: u64) -> io::Result<OwnedFd> {
    let fd = memfd_create(name)?;
    let total = (core::mem::size_of::<ArenaHeader>() as u64)
        .checked_add(buffer_size)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "mapping size overflow"))?;
    // SAFETY: fd was just created by memfd_create and is owned exclusively here.
    let rc = unsafe { libc::ftruncate(fd.as_raw_fd(), total as libc::off_t) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// `fstat`s `fd` and returns the buffer size a peer should assume, i.e. the
/// mapping's total length minus the fixed [`ArenaHeader`] prefix.
pub fn get_mapping_size(fd: RawFd) -> io::Result<u64> {
    // SAFETY: borrow only, the fd is not closed on drop of this File.
    let file = unsafe { File::from_raw_fd(fd) };
    let total = file.metadata()?.len();
    // Don't let File::drop close a fd we don't own.
    std::mem::forget(file);
    total
        .checked_sub(core::mem::size_of::<ArenaHeader>() as u64)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "mapping smaller than ArenaHeader",
            )
        })
}

/// Memory-map `fd` read/write, shared between processes.
pub fn map_shared(fd: RawFd) -> io::Result<MmapRaw> {
    // SAFETY: borrow only, matching `get_mapping_size` above.
    let file = unsafe { File::from_raw_fd(fd) };
    let result = MmapRaw::map_raw(&file);
    std::mem::forget(file);
    result
}

#[cfg(target_os = "linux")]
fn memfd_create(name: &str) -> io::Result<OwnedFd> {
    let c_name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_name is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: rc is a freshly created, owned file descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(rc) })
}

#[cfg(not(target_os = "linux"))]
fn memfd_create(_name: &str) -> io::Result<OwnedFd> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "anonymous shared memory requires memfd_create, which is Linux-only",
    ))
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;

    #[test]
    fn create_and_size_roundtrip() {
        let fd = create_mapping("peerlink-test", 4096).unwrap();
        let raw = fd.into_raw_fd();
        assert_eq!(get_mapping_size(raw).unwrap(), 4096);
        unsafe { libc::close(raw) };
    }

    #[test]
    fn mapping_is_writable_and_shared_by_fd() {
        let fd = create_mapping("peerlink-test-rw", 8192).unwrap();
        let raw = fd.into_raw_fd();
        let mut map = map_shared(raw).unwrap();
        unsafe {
            *map.as_mut_ptr() = 0xAB;
        }
        let map2 = map_shared(raw).unwrap();
        assert_eq!(unsafe { *map2.as_ptr() }, 0xAB);
        unsafe { libc::close(raw) };
    }
}
