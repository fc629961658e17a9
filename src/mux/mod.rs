//! Readiness multiplexer over the platform's native polling primitive.
//!
//! One `Mux` per event loop. Registrations are edge-triggered by default on
//! platforms that support it; a file descriptor can opt into level-triggered
//! delivery with [`Mode::LEVEL_TRIGGERED`]. One-shot registrations disarm
//! after a single event batch and have to be re-added.

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "macos")]
mod kqueue;

#[cfg(target_os = "linux")]
pub(crate) use epoll::Mux;
#[cfg(target_os = "macos")]
pub(crate) use kqueue::Mux;

use std::os::unix::io::RawFd;

bitflags::bitflags! {
    /// Interest and event bits for a registered file descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mode: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const ONE_SHOT = 0x4;
        const ERROR = 0x8;
        const LEVEL_TRIGGERED = 0x10;
    }
}

/// One fired readiness event, as handed back by [`Mux::wait`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct MuxEvent {
    pub(crate) fd: RawFd,
    pub(crate) mode: Mode,
}

/// Clamp an optional wait duration to the millisecond timeout the native
/// primitives take. Sub-millisecond waits round up so a pending timer is not
/// spun on.
pub(crate) fn timeout_ms(timeout: Option<std::time::Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(t) => {
            let ms = t.as_millis();
            if ms == 0 && !t.is_zero() {
                1
            } else {
                ms.min(i32::MAX as u128) as i32
            }
        }
    }
}
