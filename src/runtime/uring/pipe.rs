//! Kernel pipes used as the zero-copy relay's intermediate buffers.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// A unidirectional pipe sized to hold at least one block.
pub struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    /// Create a pipe that can buffer at least `capacity` bytes.
    ///
    /// Both ends stay blocking: io_uring runs splice and tee from its worker
    /// pool, where a blocking pipe lets a duplicate wait for its drain.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];

        // SAFETY: `fds` has room for the two descriptors pipe2 writes.
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: pipe2 succeeded, so both descriptors are open and unowned.
        let pipe = unsafe {
            Self {
                read: OwnedFd::from_raw_fd(fds[0]),
                write: OwnedFd::from_raw_fd(fds[1]),
            }
        };

        if pipe.capacity()? < capacity {
            pipe.set_capacity(capacity)?;
        }
        Ok(pipe)
    }

    #[inline]
    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    #[inline]
    pub fn write_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    /// Current kernel buffer size in bytes.
    pub fn capacity(&self) -> io::Result<usize> {
        // SAFETY: F_GETPIPE_SZ only reads state of a descriptor we own.
        let ret = unsafe { libc::fcntl(self.write_fd(), libc::F_GETPIPE_SZ) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    fn set_capacity(&self, capacity: usize) -> io::Result<usize> {
        let requested = libc::c_int::try_from(capacity)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: F_SETPIPE_SZ on a descriptor we own; the kernel validates size.
        let ret = unsafe { libc::fcntl(self.write_fd(), libc::F_SETPIPE_SZ, requested) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }
}
