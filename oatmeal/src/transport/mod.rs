//! Byte-stream transports.
//!
//! The protocol core reaches hardware through the narrow [`Transport`]
//! trait: poll how much is readable, read it, write frames, and ask the
//! time. Implementations must never block in `read`; `write` may accept
//! fewer bytes than offered when the line is saturated, and the senders in
//! [`port`](crate::port) retry until the frame is fully handed over.

use std::io;

pub mod serial;

#[cfg(test)]
pub(crate) mod mock;

pub use serial::{Parity, SerialConfig, SerialError, SerialTransport};

/// Default symbol rate for serial links.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// A non-blocking bidirectional byte stream with a millisecond clock.
pub trait Transport {
    /// Number of bytes ready to read right now.
    fn available(&mut self) -> usize;

    /// Read whatever is pending, up to `buf.len()` bytes.
    ///
    /// Returns `Ok(0)` when nothing is waiting; never blocks.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write up to `buf.len()` bytes, returning how many were accepted.
    ///
    /// `Ok(0)` means the device cannot take more right now.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Monotonic milliseconds since an arbitrary epoch; wraps at
    /// `u32::MAX`.
    fn millis(&self) -> u32;
}
