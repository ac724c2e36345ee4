//! Thin wrapper over the OS readiness primitive.
//!
//! This is the single platform seam of the crate: "block until any of these
//! descriptors is ready, or the timeout elapses, or a wake arrives" — the
//! wake channel being just another descriptor in the set. Implemented with
//! `poll(2)`; `EINTR` is retried, every other failure is fatal because the
//! loop cannot make forward progress without its readiness primitive.

use std::io;
use std::time::Duration;

use tracing::error;

/// Blocks until at least one descriptor in `fds` is ready or `timeout`
/// elapses (`None` blocks indefinitely). Returns the number of ready
/// descriptors; their `revents` fields are filled in.
pub(crate) fn wait(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> usize {
    let timeout_ms = match timeout {
        None => -1,
        Some(duration) => {
            // Round up so a timer due in 0.4ms does not spin through a
            // zero-timeout poll before its deadline.
            let mut ms = duration.as_millis();
            if duration.subsec_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(i32::MAX as u128) as i32
        }
    };

    loop {
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ready >= 0 {
            return ready as usize;
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        error!(%err, "poll failed");
        panic!("poll failed: {err}");
    }
}
