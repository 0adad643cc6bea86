//! Serial link seams.
//!
//! The protocol client never touches hardware directly. It talks to three
//! small abstractions:
//!
//! - [`Clock`]: a 32-bit millisecond counter that wraps like a board `millis()`
//! - [`ByteStream`]: the UART, with a non-blocking `available` count on top of
//!   the `embedded-io` read/write traits
//! - `embedded_hal::delay::DelayNs`: the sleep used between polls
//!
//! `poller` waits for a reply of known size on top of these.

pub mod poller;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use poller::{wait_for_bytes, TimeBudget, Timeout};

/// Monotonic millisecond counter that wraps back to zero after `u32::MAX`.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }
}

/// Clock backed by the embassy time driver, truncated to 32 bits.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbassyClock;

impl Clock for EmbassyClock {
    fn now_ms(&self) -> u32 {
        // Truncation is the wraparound.
        embassy_time::Instant::now().as_millis() as u32
    }
}

/// Inbound/outbound byte channel to the controller board.
///
/// `read` must only be called for bytes already reported by `available`, so it
/// never blocks.
pub trait ByteStream: embedded_io::Read + embedded_io::Write {
    /// Number of inbound bytes that can be read without blocking.
    fn available(&mut self) -> usize;

    /// Drop every inbound byte currently buffered and return how many there were.
    ///
    /// Called before each request so a late or partial reply from a previous
    /// exchange can never be mistaken for the next one.
    fn clear_buffer(&mut self) -> Result<usize, Self::Error> {
        let mut scratch = [0u8; 16];
        let mut cleared = 0;
        loop {
            let pending = self.available().min(scratch.len());
            if pending == 0 {
                break;
            }
            let read = self.read(&mut scratch[..pending])?;
            if read == 0 {
                break;
            }
            cleared += read;
        }
        Ok(cleared)
    }
}

impl<T: ByteStream + ?Sized> ByteStream for &mut T {
    fn available(&mut self) -> usize {
        (**self).available()
    }

    fn clear_buffer(&mut self) -> Result<usize, Self::Error> {
        (**self).clear_buffer()
    }
}
