//! Cross-thread wake-up channel for the consumer's blocking wait.
//!
//! Producers posting from another thread must be able to interrupt the
//! consumer while it sits in `poll(2)`. The channel is an `eventfd` on Linux
//! and a non-blocking self-pipe elsewhere on Unix; either way it is just a
//! file descriptor the consumer includes in every poll set.
//!
//! Wakes coalesce: any number of `wake` calls between two `clear` calls
//! produce a single readable edge, which is exactly what the run loop wants.

use std::io;
use std::os::unix::io::RawFd;

use tracing::error;

pub(crate) struct WakeChannel {
    read_fd: RawFd,
    /// Equal to `read_fd` when backed by an eventfd.
    write_fd: RawFd,
}

impl WakeChannel {
    #[cfg(target_os = "linux")]
    pub fn new() -> io::Result<WakeChannel> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(WakeChannel {
            read_fd: fd,
            write_fd: fd,
        })
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    pub fn new() -> io::Result<WakeChannel> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            if flags < 0
                || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
                || unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0
            {
                let err = io::Error::last_os_error();
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(err);
            }
        }
        Ok(WakeChannel {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// The descriptor the consumer polls for readability.
    #[inline]
    pub fn poll_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Makes `poll_fd` readable. Callable from any thread; never blocks.
    pub fn wake(&self) {
        let value: u64 = 1;
        loop {
            let written = unsafe {
                libc::write(
                    self.write_fd,
                    &value as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if written >= 0 {
                return;
            }
            match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                // Counter saturated / pipe full: a wake is already pending.
                Some(libc::EAGAIN) => return,
                _ => {
                    let err = io::Error::last_os_error();
                    error!(%err, "wake channel write failed");
                    panic!("wake channel write failed: {err}");
                }
            }
        }
    }

    /// Drains all pending wakes. Consumer thread only, and never from inside
    /// user callbacks.
    pub fn clear(&self) {
        let mut buf = [0u8; 64];
        loop {
            let read = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if read > 0 {
                continue;
            }
            if read == 0 {
                return;
            }
            match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return,
                _ => {
                    let err = io::Error::last_os_error();
                    error!(%err, "wake channel read failed");
                    panic!("wake channel read failed: {err}");
                }
            }
        }
    }
}

impl Drop for WakeChannel {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            if self.write_fd != self.read_fd {
                libc::close(self.write_fd);
            }
        }
    }
}
