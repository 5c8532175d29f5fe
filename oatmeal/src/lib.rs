//! Framed serial messaging between a host and embedded microcontrollers.
//!
//! Oatmeal is a line-oriented protocol for reliable bidirectional messaging
//! over a byte-stream transport, typically a UART. Each message travels as a
//! self-delimited frame with a fixed header and a typed, comma-separated
//! argument payload:
//!
//! ```text
//! <CMDRxy[1,2,3],2>LJ
//!
//! '<'           start of frame
//! "CMD"         command
//! 'R'           flag
//! "xy"          token
//! "[1,2,3],2"   args
//! '>'           end of frame
//! 'L'           length check byte
//! 'J'           content check byte
//! ```
//!
//! The crate is organised around four pieces:
//!
//! - [`Message`]: a fixed-capacity frame buffer with an incremental builder
//!   and read accessors. Building never allocates and surfaces overflow as a
//!   zero return rather than a panic, so the same code runs comfortably on
//!   deeply memory-constrained devices.
//! - [`ArgParser`]: a backtracking cursor over a received payload. Every
//!   `parse_*` either consumes a whole token or leaves the parser untouched,
//!   so callers can retry with a different type.
//! - [`Port`]: a non-blocking receive state machine over a [`Transport`],
//!   with error counters and automatic replies to the protocol's built-in
//!   discovery/heartbeat/logging requests.
//! - [`transport::serial::SerialTransport`]: a POSIX serial port opened
//!   non-blocking and configured for raw 8N1 I/O.
//!
//! # Example
//!
//! ```
//! use oatmeal::{ArgParser, Flag, Message};
//!
//! let mut msg = Message::new();
//! msg.start(b"RUN", Flag::Request, b"aa");
//! msg.append(1.23);
//! msg.append(true);
//! msg.append("Hi!");
//! msg.finish();
//! assert!(msg.validate());
//!
//! let mut parser = ArgParser::from_msg(&msg);
//! assert_eq!(parser.parse::<f32>(), Some(1.23));
//! assert_eq!(parser.parse::<bool>(), Some(true));
//! let mut text = [0u8; 16];
//! assert_eq!(parser.parse_str(&mut text), Some(3));
//! assert!(parser.finished());
//! ```

pub mod args;
pub mod codec;
pub mod message;
pub mod port;
pub mod transport;

pub use args::ArgParser;
pub use codec::value::{Blob, Decode, Encode, Real};
pub use codec::{MAX_MSG_LEN, MIN_MSG_LEN};
pub use message::{Flag, Message};
pub use port::{HeartbeatStatus, Identity, Port, Stats};
pub use transport::Transport;

/// Protocol version, incremented on incompatible wire changes.
pub const PROTOCOL_VERSION_MAJOR: u8 = 1;
/// Protocol version, incremented on backwards-compatible additions.
pub const PROTOCOL_VERSION_MINOR: u8 = 0;
