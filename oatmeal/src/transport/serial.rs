//! POSIX serial port transport.
//!
//! The device is opened with `O_NONBLOCK` and configured for raw binary
//! I/O via termios, so reads return whatever the kernel has buffered and
//! writes hand back however much the output queue accepted. That matches
//! the poll-driven contract of [`Transport`]: the port state machine calls
//! in from a super-loop and must never be parked on a file descriptor.

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::time::Instant;

use rustix::fs::{open, Mode, OFlags};
use rustix::termios::{tcdrain, tcgetattr, tcsetattr, ControlModes, OptionalActions};

use super::{Transport, DEFAULT_BAUD_RATE};

/// Parity configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Serial line configuration.
#[derive(Debug, Clone, Copy)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

/// Serial port error types.
#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Failed to open serial port: {0}")]
    OpenError(#[source] io::Error),

    #[error("Configuration failed: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

/// Apply raw-mode termios settings for a serial line.
fn apply_serial_config<Fd: AsFd>(fd: &Fd, config: &SerialConfig) -> Result<(), SerialError> {
    let mut termios = tcgetattr(fd)
        .map_err(|e| SerialError::ConfigError(format!("Failed to get termios: {e}")))?;

    // Raw mode for binary communication.
    termios.make_raw();

    termios
        .set_speed(config.baud_rate)
        .map_err(|e| SerialError::ConfigError(format!("Failed to set baud rate: {e}")))?;

    termios.control_modes &= !ControlModes::CSIZE;
    match config.data_bits {
        5 => termios.control_modes |= ControlModes::CS5,
        6 => termios.control_modes |= ControlModes::CS6,
        7 => termios.control_modes |= ControlModes::CS7,
        8 => termios.control_modes |= ControlModes::CS8,
        _ => {
            return Err(SerialError::ConfigError(format!(
                "Invalid data bits: {}",
                config.data_bits
            )));
        }
    }

    match config.parity {
        Parity::None => {
            termios.control_modes &= !ControlModes::PARENB;
        }
        Parity::Odd => {
            termios.control_modes |= ControlModes::PARENB | ControlModes::PARODD;
        }
        Parity::Even => {
            termios.control_modes |= ControlModes::PARENB;
            termios.control_modes &= !ControlModes::PARODD;
        }
    }

    match config.stop_bits {
        1 => termios.control_modes &= !ControlModes::CSTOPB,
        2 => termios.control_modes |= ControlModes::CSTOPB,
        _ => {
            return Err(SerialError::ConfigError(format!(
                "Invalid stop bits: {}",
                config.stop_bits
            )));
        }
    }

    tcsetattr(fd, OptionalActions::Now, &termios)
        .map_err(|e| SerialError::ConfigError(format!("Failed to apply termios: {e}")))?;

    Ok(())
}

/// A serial device speaking the [`Transport`] contract.
pub struct SerialTransport {
    fd: OwnedFd,
    epoch: Instant,
    bytes_read: u64,
    bytes_written: u64,
}

impl SerialTransport {
    /// Open a serial device at the given baud rate with 8N1 framing.
    ///
    /// `path` is the device node, e.g. `/dev/ttyUSB0` on Linux or
    /// `/dev/cu.usbserial` on macOS.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, SerialError> {
        let config = SerialConfig {
            baud_rate,
            ..Default::default()
        };
        Self::with_config(path, config)
    }

    /// Open a serial device with an explicit line configuration.
    pub fn with_config(path: &str, config: SerialConfig) -> Result<Self, SerialError> {
        let fd = open(
            path,
            OFlags::RDWR | OFlags::NOCTTY | OFlags::NONBLOCK,
            Mode::empty(),
        )
        .map_err(|e| SerialError::OpenError(e.into()))?;

        apply_serial_config(&fd, &config)?;

        Ok(Self::from_owned_fd(fd))
    }

    fn from_owned_fd(fd: OwnedFd) -> Self {
        Self {
            fd,
            epoch: Instant::now(),
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    /// Wrap an existing descriptor, applying the configuration.
    ///
    /// Used by tests to drive the transport over a pty pair.
    #[cfg(test)]
    pub(crate) fn from_fd(fd: OwnedFd, config: SerialConfig) -> Result<Self, SerialError> {
        use rustix::fs::{fcntl_getfl, fcntl_setfl};

        apply_serial_config(&fd, &config)?;
        let flags = fcntl_getfl(&fd)
            .map_err(|e| SerialError::ConfigError(format!("Failed to get fd flags: {e}")))?;
        fcntl_setfl(&fd, flags | OFlags::NONBLOCK)
            .map_err(|e| SerialError::ConfigError(format!("Failed to set fd flags: {e}")))?;

        Ok(Self::from_owned_fd(fd))
    }

    /// Total bytes read since the port was opened.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Total bytes written since the port was opened.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl Transport for SerialTransport {
    fn available(&mut self) -> usize {
        rustix::io::ioctl_fionread(&self.fd)
            .map(|n| n as usize)
            .unwrap_or(0)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match rustix::io::read(&self.fd, buf) {
            Ok(n) => {
                self.bytes_read += n as u64;
                Ok(n)
            }
            Err(rustix::io::Errno::AGAIN) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match rustix::io::write(&self.fd, buf) {
            Ok(n) => {
                self.bytes_written += n as u64;
                Ok(n)
            }
            Err(rustix::io::Errno::AGAIN) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn millis(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        // Let pending output reach the line before the descriptor closes.
        let _ = tcdrain(&self.fd);
    }
}
