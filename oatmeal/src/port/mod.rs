//! Serial port message pump.
//!
//! [`Port`] owns a transport and turns its byte stream into validated
//! [`Message`]s. Receiving is a four-state machine fed one byte at a time:
//! hunt for `<`, hunt for `>`, then take the two check bytes and judge the
//! candidate frame. Corruption never surfaces to the caller: bad frames
//! are dropped and counted in [`Stats`], which ride out-of-band in the next
//! heartbeat.
//!
//! The port also answers the protocol's built-in requests (discovery,
//! heartbeat toggle, logging toggle) so application code only ever sees its
//! own traffic. Everything here is poll-driven: `recv` does at most one
//! transport read and returns promptly, and the caller decides how often to
//! spin the loop.

use std::io;

use tracing::{debug, trace};

use crate::args::ArgParser;
use crate::codec::{checksum, END_BYTE, MAX_MSG_LEN, MIN_MSG_LEN, START_BYTE, TOKEN_CHARS};
use crate::message::{Flag, Message};
use crate::transport::Transport;

mod stream;

pub use stream::StreamMsg;

/// Discovery request, answered automatically with [`DISCOVERY_ACK`].
pub const DISCOVERY_REQUEST: &[u8; 4] = b"DISR";
/// Discovery reply: role, instance index, hardware id, version.
pub const DISCOVERY_ACK: &[u8; 4] = b"DISA";
/// Heartbeat toggle request, answered automatically.
pub const HEARTBEAT_REQUEST: &[u8; 4] = b"HRTR";
/// Heartbeat toggle acknowledgement.
pub const HEARTBEAT_ACK: &[u8; 4] = b"HRTA";
/// Unsolicited heartbeat carrying the status dict.
pub const HEARTBEAT_BG: &[u8; 4] = b"HRTB";
/// Logging toggle request, answered automatically.
pub const LOGGING_REQUEST: &[u8; 4] = b"LOGR";
/// Logging toggle acknowledgement.
pub const LOGGING_ACK: &[u8; 4] = b"LOGA";
/// Unsolicited log record: level, text.
pub const LOG_BG: &[u8; 4] = b"LOGB";
/// Halt request. Reserved but application-handled: the port passes it
/// through to the caller.
pub const HALT_REQUEST: &[u8; 4] = b"HALR";
/// Halt acknowledgement.
pub const HALT_ACK: &[u8; 4] = b"HALA";

/// Identity reported in discovery replies.
///
/// The strings must outlive the port; string literals are the usual
/// source. `instance_idx` tells apart boards sharing a role, typically set
/// by jumpers or a selector switch.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub role: &'static str,
    pub instance_idx: u32,
    pub hardware_id: &'static str,
    pub version: &'static str,
}

/// Counters describing traffic and trouble on one port.
///
/// The receive path maintains everything except `unknown_opcode` and
/// `bad_message`, which belong to the caller (the port cannot know which
/// opcodes an application understands). All error counters are reported
/// and reset by the next status heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub frame_too_short: u32,
    pub frame_too_long: u32,
    pub missing_start: u32,
    pub missing_end: u32,
    pub bad_checksum: u32,
    pub illegal_char: u32,

    pub bytes_read: u32,
    pub good_frames: u32,
    pub frames_written: u32,

    pub unknown_opcode: u32,
    pub bad_message: u32,
}

impl Stats {
    /// Total errors of every kind.
    pub fn total_errors(&self) -> u32 {
        self.frame_too_short
            + self.frame_too_long
            + self.missing_start
            + self.missing_end
            + self.bad_checksum
            + self.illegal_char
            + self.unknown_opcode
            + self.bad_message
    }

    /// Reset every counter.
    pub fn reset(&mut self) {
        *self = Stats::default();
    }

    /// Append the error trailer to a heartbeat under construction.
    ///
    /// Writes `oatmeal_errs=<total>` followed by one short `key=count`
    /// entry per non-zero counter, or nothing at all when the port has been
    /// clean. Returns the number of bytes appended.
    pub fn format_stats(&self, msg: &mut Message) -> usize {
        let errs = self.total_errors();
        if errs == 0 {
            return 0;
        }
        let orig_len = msg.len();
        msg.append_dict_key_value("oatmeal_errs", errs);
        let entries = [
            ("sh", self.frame_too_short),
            ("lg", self.frame_too_long),
            ("ms", self.missing_start),
            ("me", self.missing_end),
            ("bc", self.bad_checksum),
            ("bb", self.illegal_char),
            ("uo", self.unknown_opcode),
            ("bm", self.bad_message),
        ];
        for (key, count) in entries {
            if count != 0 {
                msg.append_dict_key_value(key, count);
            }
        }
        msg.len() - orig_len
    }
}

/// Platform readings carried in a status heartbeat.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatStatus {
    /// Longest main-loop iteration since the previous heartbeat.
    pub max_loop_ms: u32,
    /// Estimated free RAM, where the platform can tell.
    pub avail_ram_kb: Option<i32>,
    /// Uptime in minutes, where a real-time clock exists.
    pub uptime_mins: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    WaitStart,
    WaitEnd,
    WaitLen,
    WaitSum,
}

/// Padding beyond the longest frame so a whole frame plus some leading
/// noise fits in the receive buffer.
const RX_PAD: usize = 8;

/// One protocol endpoint bound to one transport.
pub struct Port<T: Transport> {
    transport: T,
    identity: Identity,

    /// Traffic counters; `unknown_opcode` and `bad_message` are the
    /// caller's to bump.
    pub stats: Stats,

    state: RxState,
    /// Bytes `b_start..b_mid` belong to the frame under consideration;
    /// `b_mid..b_end` are unprocessed. The live region is shifted back to
    /// offset zero before each read so frames never wrap.
    buf: [u8; MAX_MSG_LEN + RX_PAD],
    b_start: usize,
    b_mid: usize,
    b_end: usize,

    token: u16,

    send_logging: bool,
    send_heartbeats: bool,
    last_heartbeat_ms: u32,
    heartbeat_period_ms: u32,
}

impl<T: Transport> Port<T> {
    /// Create a port over `transport`, identifying as `identity` in
    /// discovery replies.
    pub fn new(transport: T, identity: Identity) -> Self {
        Self {
            transport,
            identity,
            stats: Stats::default(),
            state: RxState::WaitStart,
            buf: [0; MAX_MSG_LEN + RX_PAD],
            b_start: 0,
            b_mid: 0,
            b_end: 0,
            token: 0,
            send_logging: false,
            send_heartbeats: true,
            last_heartbeat_ms: 0,
            heartbeat_period_ms: 0,
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Replace the discovery identity.
    pub fn set_identity(&mut self, identity: Identity) {
        self.identity = identity;
    }

    /// The next token in the cycle. Not reentrant; a port used from
    /// several execution contexts needs external serialization anyway.
    pub fn next_token(&mut self) -> [u8; 2] {
        let n = TOKEN_CHARS.len() as u16;
        self.token = (self.token + 1) % (n * n);
        [
            TOKEN_CHARS[(self.token / n) as usize],
            TOKEN_CHARS[(self.token % n) as usize],
        ]
    }

    /* -- sending -- */

    pub(crate) fn write_all(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            let n = self.transport.write(bytes)?;
            bytes = &bytes[n..];
        }
        Ok(())
    }

    /// Send a finished message, newline-terminated on the wire.
    pub fn send(&mut self, msg: &Message) -> io::Result<()> {
        self.write_all(msg.frame())?;
        self.write_all(b"\n")?;
        self.stats.frames_written += 1;
        trace!(len = msg.len(), opcode = ?msg.opcode(), "frame sent");
        Ok(())
    }

    /// Send an argument-less message with a fresh token.
    pub fn send_simple(&mut self, cmd: &[u8; 3], flag: Flag) -> io::Result<()> {
        let token = self.next_token();
        let mut msg = Message::new();
        msg.start(cmd, flag, &token);
        msg.finish();
        self.send(&msg)
    }

    /// Send an argument-less reply echoing `msg`'s command and token.
    pub fn send_response(&mut self, msg: &Message, flag: Flag) -> io::Result<()> {
        let mut reply = Message::new();
        reply.start(&msg.cmd(), flag, &msg.token());
        reply.finish();
        self.send(&reply)
    }

    /// Acknowledge `msg`.
    pub fn send_ack(&mut self, msg: &Message) -> io::Result<()> {
        self.send_response(msg, Flag::Ack)
    }

    /// Report `msg`'s request as completed.
    pub fn send_done(&mut self, msg: &Message) -> io::Result<()> {
        self.send_response(msg, Flag::Done)
    }

    /// Report `msg`'s request as failed.
    pub fn send_failed(&mut self, msg: &Message) -> io::Result<()> {
        self.send_response(msg, Flag::Failed)
    }

    /// Start a message that streams straight to the transport.
    ///
    /// Checksums are maintained incrementally, so nothing needs to be
    /// buffered; see [`StreamMsg`].
    pub fn stream_start(
        &mut self,
        cmd: &[u8; 3],
        flag: Flag,
        token: &[u8; 2],
    ) -> io::Result<StreamMsg<'_, T>> {
        StreamMsg::start(self, cmd, flag, token)
    }

    /* -- receiving -- */

    /// Pull the next validated frame, if one is ready.
    ///
    /// Consumes already-buffered bytes first, then performs at most one
    /// non-blocking transport read. Corrupted frames are counted and
    /// dropped; partial frames stay buffered for the next call. Never
    /// blocks.
    pub fn recv(&mut self) -> io::Result<Option<Message>> {
        if let Some(msg) = self.consume_from_buffer() {
            return Ok(Some(msg));
        }
        if self.read_transport_data()? {
            if let Some(msg) = self.consume_from_buffer() {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    /// Like [`recv`](Self::recv), but answer built-in requests first.
    ///
    /// Discovery, heartbeat-toggle, and logging-toggle messages are
    /// handled and acknowledged internally; only messages the application
    /// must act on (including `HALR`) are returned.
    pub fn check_for_msgs(&mut self) -> io::Result<Option<Message>> {
        while let Some(msg) = self.recv()? {
            if !self.handle_builtin(&msg)? {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    /// Non-blocking read into the receive buffer.
    ///
    /// Returns whether unprocessed bytes are waiting afterwards.
    fn read_transport_data(&mut self) -> io::Result<bool> {
        // An in-progress frame that already spans the maximum length can
        // never complete; abandon it.
        if self.b_mid - self.b_start >= MAX_MSG_LEN {
            self.b_start = self.b_mid;
            self.state = RxState::WaitStart;
            self.stats.frame_too_long += 1;
        }
        // Shift the live region back to the buffer start.
        if self.b_start == self.b_end {
            self.b_start = 0;
            self.b_mid = 0;
            self.b_end = 0;
        } else if self.b_start > 0 {
            self.buf.copy_within(self.b_start..self.b_end, 0);
            self.b_mid -= self.b_start;
            self.b_end -= self.b_start;
            self.b_start = 0;
        }
        let want = (self.buf.len() - self.b_end).min(self.transport.available());
        if want > 0 {
            let n = self.transport.read(&mut self.buf[self.b_end..self.b_end + want])?;
            self.b_end += n;
            self.stats.bytes_read += n as u32;
        }
        Ok(self.b_mid < self.b_end)
    }

    /// Advance the state machine over buffered bytes until a frame
    /// validates or the bytes run out.
    fn consume_from_buffer(&mut self) -> Option<Message> {
        while self.b_mid < self.b_end {
            let b = self.buf[self.b_mid];
            if b == 0 {
                // NUL can never occur in a frame.
                self.b_start = self.b_mid;
                self.state = RxState::WaitStart;
                self.stats.illegal_char += 1;
            } else if b == START_BYTE {
                // A start byte begins a frame no matter the state.
                if self.state != RxState::WaitStart {
                    self.stats.missing_end += 1;
                }
                self.b_start = self.b_mid;
                self.state = RxState::WaitEnd;
            } else {
                match self.state {
                    RxState::WaitStart => {
                        self.b_start = self.b_mid;
                        if b == END_BYTE {
                            self.stats.missing_start += 1;
                        }
                    }
                    RxState::WaitEnd => {
                        if b == END_BYTE {
                            self.state = RxState::WaitLen;
                        }
                    }
                    RxState::WaitLen => {
                        // Any byte is acceptable as the length check byte.
                        self.state = RxState::WaitSum;
                    }
                    RxState::WaitSum => {
                        let frame_start = self.b_start;
                        let n = self.b_mid + 1 - frame_start;
                        self.b_start = self.b_mid + 1;
                        self.state = RxState::WaitStart;
                        if n < MIN_MSG_LEN {
                            self.stats.frame_too_short += 1;
                        } else if n > MAX_MSG_LEN {
                            self.stats.frame_too_long += 1;
                        } else if !checksum::validate_frame(&self.buf[frame_start..frame_start + n])
                        {
                            self.stats.bad_checksum += 1;
                        } else if let Some(msg) =
                            Message::from_frame(&self.buf[frame_start..frame_start + n])
                        {
                            self.stats.good_frames += 1;
                            self.b_mid += 1;
                            trace!(len = n, opcode = ?msg.opcode(), "frame received");
                            return Some(msg);
                        }
                    }
                }
            }
            self.b_mid += 1;
        }
        None
    }

    /// Answer a built-in request, returning whether `msg` was consumed.
    fn handle_builtin(&mut self, msg: &Message) -> io::Result<bool> {
        if msg.is_opcode(DISCOVERY_REQUEST) {
            // Discovery requests carry no arguments worth checking.
            debug!(role = self.identity.role, "answering discovery request");
            self.send_discovery_ack(&msg.token())?;
            return Ok(true);
        }
        if msg.is_opcode(HEARTBEAT_REQUEST) {
            let mut parser = ArgParser::from_msg(msg);
            if let Some(on) = parser.parse::<bool>() {
                if parser.finished() {
                    self.send_heartbeats = on;
                    debug!(on, "heartbeats toggled by peer");
                    self.send_ack(msg)?;
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        if msg.is_opcode(LOGGING_REQUEST) {
            let mut parser = ArgParser::from_msg(msg);
            if let Some(on) = parser.parse::<bool>() {
                if parser.finished() {
                    self.send_logging = on;
                    debug!(on, "logging toggled by peer");
                    self.send_ack(msg)?;
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        Ok(false)
    }

    /// Reply to a discovery request: role, instance index, hardware id,
    /// version, echoing the request's token.
    fn send_discovery_ack(&mut self, token: &[u8; 2]) -> io::Result<()> {
        let mut msg = Message::new();
        msg.start(b"DIS", Flag::Ack, token);
        msg.append(self.identity.role);
        msg.append(self.identity.instance_idx);
        msg.append(self.identity.hardware_id);
        msg.append(self.identity.version);
        msg.finish();
        self.send(&msg)
    }

    /* -- logging -- */

    /// Turn [`log`](Self::log) emission on or off.
    pub fn set_logging_on(&mut self, on: bool) {
        self.send_logging = on;
    }

    /// Emit a `LOGB` record, if logging is on.
    ///
    /// Levels are free-form; `DEBUG`, `INFO`, `WARNING`, `ERROR`, and
    /// `CRITICAL` are conventional.
    pub fn log(&mut self, level: &str, text: &str) -> io::Result<()> {
        if !self.send_logging {
            return Ok(());
        }
        let token = self.next_token();
        let mut msg = Message::new();
        msg.start(b"LOG", Flag::Background, &token);
        msg.append(level);
        msg.append(text);
        msg.finish();
        self.send(&msg)
    }

    pub fn log_debug(&mut self, text: &str) -> io::Result<()> {
        self.log("DEBUG", text)
    }

    pub fn log_info(&mut self, text: &str) -> io::Result<()> {
        self.log("INFO", text)
    }

    pub fn log_warning(&mut self, text: &str) -> io::Result<()> {
        self.log("WARNING", text)
    }

    pub fn log_error(&mut self, text: &str) -> io::Result<()> {
        self.log("ERROR", text)
    }

    /* -- heartbeats -- */

    /// Enable or disable heartbeat emission.
    pub fn set_heartbeats_on(&mut self, on: bool) {
        self.send_heartbeats = on;
    }

    /// Minimum spacing between heartbeats.
    pub fn set_heartbeat_period_ms(&mut self, period_ms: u32) {
        self.heartbeat_period_ms = period_ms;
    }

    /// Whether a heartbeat should be sent now.
    ///
    /// True at most once per period; asking marks the heartbeat as sent.
    pub fn heartbeat_due(&mut self) -> bool {
        let now = self.transport.millis();
        self.heartbeat_due_at(now)
    }

    /// [`heartbeat_due`](Self::heartbeat_due) against an explicit clock
    /// reading. Wrap-safe on the 32-bit millisecond clock.
    pub fn heartbeat_due_at(&mut self, now_ms: u32) -> bool {
        if self.send_heartbeats
            && now_ms.wrapping_sub(self.last_heartbeat_ms) >= self.heartbeat_period_ms
        {
            self.last_heartbeat_ms = now_ms;
            true
        } else {
            false
        }
    }

    /// Build a complete `HRTB` status heartbeat into `msg`.
    ///
    /// The body is a dict starting with the error trailer (see
    /// [`Stats::format_stats`]) followed by the platform readings in
    /// `status`. The error counters reset once reported.
    pub fn build_status_heartbeat(&mut self, msg: &mut Message, status: &HeartbeatStatus) {
        let token = self.next_token();
        msg.start(b"HRT", Flag::Background, &token);
        msg.append_dict_start();
        self.stats.format_stats(msg);
        self.stats.reset();
        msg.append_dict_key_value("loop_ms", status.max_loop_ms);
        if let Some(kb) = status.avail_ram_kb {
            msg.append_dict_key_value("avail_kb", kb);
        }
        if let Some(mins) = status.uptime_mins {
            msg.append_dict_key_value("uptime", mins);
        }
        msg.append_dict_end();
        msg.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    const TEST_IDENTITY: Identity = Identity {
        role: "ValveCluster",
        instance_idx: 0,
        hardware_id: "HW123",
        version: "1.0.0",
    };

    fn test_port() -> Port<MockTransport> {
        Port::new(MockTransport::new(), TEST_IDENTITY)
    }

    /// A finished frame plus the on-wire newline.
    fn wire_frame(cmd: &[u8; 3], flag: Flag, token: &[u8; 2], args: &[i32]) -> Vec<u8> {
        let mut msg = Message::new();
        msg.start(cmd, flag, token);
        for &a in args {
            msg.append(a);
        }
        msg.finish();
        let mut bytes = msg.frame().to_vec();
        bytes.push(b'\n');
        bytes
    }

    #[test]
    fn receives_a_discovery_request() {
        let mut port = test_port();
        port.transport_mut().push_rx(b"<DISRXY>i_\n");
        let msg = port.recv().unwrap().expect("frame expected");
        assert_eq!(msg.cmd(), *b"DIS");
        assert_eq!(msg.flag(), b'R');
        assert_eq!(msg.token(), *b"XY");
        assert!(msg.args().is_empty());
        assert!(msg.validate());
        assert_eq!(port.stats.good_frames, 1);
        // The newline between frames is not an error.
        assert!(port.recv().unwrap().is_none());
        assert_eq!(port.stats.total_errors(), 0);
    }

    #[test]
    fn discovery_is_answered_automatically() {
        let mut port = test_port();
        port.transport_mut().push_rx(b"<DISRXY>i_\n");
        assert!(port.check_for_msgs().unwrap().is_none());

        let tx = port.transport_mut().take_tx();
        assert_eq!(tx.last(), Some(&b'\n'));
        let reply = Message::from_frame(&tx[..tx.len() - 1]).unwrap();
        assert!(reply.validate());
        assert!(reply.is_opcode(DISCOVERY_ACK));
        assert_eq!(reply.token(), *b"XY");

        let mut parser = ArgParser::from_msg(&reply);
        let role = parser.parse_string::<16>().unwrap();
        assert_eq!(role.as_str(), "ValveCluster");
        assert_eq!(parser.parse::<u32>(), Some(0));
        let hw = parser.parse_string::<16>().unwrap();
        assert_eq!(hw.as_str(), "HW123");
        let version = parser.parse_string::<16>().unwrap();
        assert_eq!(version.as_str(), "1.0.0");
        assert!(parser.finished());
        assert_eq!(port.stats.frames_written, 1);
    }

    #[test]
    fn heartbeat_toggle_is_acked_and_applied() {
        let mut port = test_port();
        let mut req = Message::new();
        req.start(b"HRT", Flag::Request, b"ab");
        req.append(false);
        req.finish();
        port.transport_mut().push_rx(req.frame());
        port.transport_mut().push_rx(b"\n");

        assert!(port.check_for_msgs().unwrap().is_none());
        assert!(!port.send_heartbeats);

        let tx = port.transport_mut().take_tx();
        let reply = Message::from_frame(&tx[..tx.len() - 1]).unwrap();
        assert!(reply.is_opcode(HEARTBEAT_ACK));
        assert_eq!(reply.token(), *b"ab");
    }

    #[test]
    fn logging_toggle_is_acked_and_applied() {
        let mut port = test_port();
        let mut req = Message::new();
        req.start(b"LOG", Flag::Request, b"cd");
        req.append(true);
        req.finish();
        port.transport_mut().push_rx(req.frame());

        assert!(port.check_for_msgs().unwrap().is_none());
        assert!(port.send_logging);
        let tx = port.transport_mut().take_tx();
        let reply = Message::from_frame(&tx[..tx.len() - 1]).unwrap();
        assert!(reply.is_opcode(LOGGING_ACK));
    }

    #[test]
    fn malformed_builtin_reaches_the_caller() {
        let mut port = test_port();
        // A heartbeat toggle with no arguments is not handled internally.
        let mut req = Message::new();
        req.start(b"HRT", Flag::Request, b"ab");
        req.finish();
        port.transport_mut().push_rx(req.frame());

        let msg = port.check_for_msgs().unwrap().expect("passed through");
        assert!(msg.is_opcode(HEARTBEAT_REQUEST));
        assert!(port.transport_mut().tx_data().is_empty());
    }

    #[test]
    fn halt_request_reaches_the_caller() {
        let mut port = test_port();
        let mut req = Message::new();
        req.start(b"HAL", Flag::Request, b"xy");
        req.finish();
        port.transport_mut().push_rx(req.frame());
        let msg = port.check_for_msgs().unwrap().expect("passed through");
        assert!(msg.is_opcode(HALT_REQUEST));
    }

    #[test]
    fn frames_survive_surrounding_noise() {
        let mut port = test_port();
        let mut bytes = b"garbage!!".to_vec();
        bytes.extend_from_slice(&wire_frame(b"AAA", Flag::Request, b"01", &[1]));
        bytes.extend_from_slice(b"more noise");
        bytes.extend_from_slice(&wire_frame(b"BBB", Flag::Request, b"02", &[2]));
        port.transport_mut().push_rx(&bytes);

        let first = port.recv().unwrap().expect("first frame");
        assert!(first.is_command(b"AAA"));
        let second = port.recv().unwrap().expect("second frame");
        assert!(second.is_command(b"BBB"));
        assert!(port.recv().unwrap().is_none());
        assert_eq!(port.stats.good_frames, 2);
        assert_eq!(port.stats.bad_checksum, 0);
    }

    #[test]
    fn truncated_frame_counts_one_missing_end() {
        let mut port = test_port();
        let full = wire_frame(b"CCC", Flag::Request, b"03", &[7]);
        // Cut the first frame short, then follow with a complete one.
        let mut bytes = full[..5].to_vec();
        bytes.extend_from_slice(&wire_frame(b"DDD", Flag::Request, b"04", &[8]));
        port.transport_mut().push_rx(&bytes);

        let msg = port.recv().unwrap().expect("second frame");
        assert!(msg.is_command(b"DDD"));
        assert_eq!(port.stats.missing_end, 1);
    }

    #[test]
    fn extra_start_byte_discards_the_frame() {
        let mut port = test_port();
        let mut corrupted = wire_frame(b"EEE", Flag::Request, b"05", &[9]);
        corrupted.insert(4, b'<');
        corrupted.extend_from_slice(&wire_frame(b"FFF", Flag::Request, b"06", &[10]));
        port.transport_mut().push_rx(&corrupted);

        let msg = port.recv().unwrap().expect("clean frame");
        assert!(msg.is_command(b"FFF"));
        assert!(port.stats.missing_end >= 1);
        assert_eq!(port.stats.good_frames, 1);
    }

    #[test]
    fn corrupted_frame_is_counted_and_dropped() {
        let mut port = test_port();
        let mut bytes = wire_frame(b"GGG", Flag::Request, b"07", &[1, 2, 3]);
        bytes[9] ^= 0x01;
        port.transport_mut().push_rx(&bytes);
        assert!(port.recv().unwrap().is_none());
        assert_eq!(port.stats.bad_checksum, 1);
    }

    #[test]
    fn short_candidate_counts_frame_too_short() {
        let mut port = test_port();
        port.transport_mut().push_rx(b"<AB>LC");
        assert!(port.recv().unwrap().is_none());
        assert_eq!(port.stats.frame_too_short, 1);
    }

    #[test]
    fn nul_byte_counts_illegal_char() {
        let mut port = test_port();
        let mut bytes = b"<AAA".to_vec();
        bytes.push(0);
        bytes.extend_from_slice(&wire_frame(b"HHH", Flag::Request, b"08", &[4]));
        port.transport_mut().push_rx(&bytes);
        let msg = port.recv().unwrap().expect("clean frame");
        assert!(msg.is_command(b"HHH"));
        assert_eq!(port.stats.illegal_char, 1);
    }

    #[test]
    fn overlong_candidate_is_abandoned() {
        let mut port = test_port();
        let mut bytes = vec![b'<'];
        bytes.extend(std::iter::repeat(b'x').take(MAX_MSG_LEN + RX_PAD));
        bytes.extend_from_slice(&wire_frame(b"III", Flag::Request, b"09", &[5]));
        port.transport_mut().push_rx(&bytes);

        let mut msg = None;
        for _ in 0..8 {
            if let Some(m) = port.recv().unwrap() {
                msg = Some(m);
                break;
            }
        }
        let msg = msg.expect("frame after abandoned run");
        assert!(msg.is_command(b"III"));
        assert!(port.stats.frame_too_long >= 1);
    }

    #[test]
    fn a_frame_split_across_reads_is_assembled() {
        let mut port = test_port();
        let bytes = wire_frame(b"JJJ", Flag::Request, b"10", &[6]);
        let (head, tail) = bytes.split_at(6);
        port.transport_mut().push_rx(head);
        assert!(port.recv().unwrap().is_none());
        port.transport_mut().push_rx(tail);
        let msg = port.recv().unwrap().expect("assembled frame");
        assert!(msg.is_command(b"JJJ"));
    }

    #[test]
    fn bytes_read_is_tracked() {
        let mut port = test_port();
        let bytes = wire_frame(b"KKK", Flag::Request, b"11", &[]);
        port.transport_mut().push_rx(&bytes);
        port.recv().unwrap();
        assert_eq!(port.stats.bytes_read as usize, bytes.len());
    }

    #[test]
    fn send_writes_frame_and_newline() {
        let mut port = test_port();
        let mut msg = Message::new();
        msg.start(b"RUN", Flag::Request, b"aa");
        msg.append_real(1.23, 3);
        msg.append(true);
        msg.append("Hi!");
        msg.append_list_start();
        msg.append(1);
        msg.append(2);
        msg.append_list_end();
        msg.finish();
        port.send(&msg).unwrap();
        assert_eq!(
            port.transport_mut().tx_data(),
            b"<RUNRaa1.23,T,\"Hi!\",[1,2]>-b\n"
        );
        assert_eq!(port.stats.frames_written, 1);
    }

    #[test]
    fn responses_echo_command_and_token() {
        let mut port = test_port();
        let mut req = Message::new();
        req.start(b"RUN", Flag::Request, b"zz");
        req.finish();

        port.send_ack(&req).unwrap();
        port.send_done(&req).unwrap();
        port.send_failed(&req).unwrap();

        let tx = port.transport_mut().take_tx();
        let frames: Vec<&[u8]> = tx.split(|&b| b == b'\n').filter(|f| !f.is_empty()).collect();
        assert_eq!(frames.len(), 3);
        for (frame, flag) in frames.iter().zip([b'A', b'D', b'F']) {
            let msg = Message::from_frame(frame).unwrap();
            assert!(msg.validate());
            assert!(msg.is_command(b"RUN"));
            assert_eq!(msg.flag(), flag);
            assert_eq!(msg.token(), *b"zz");
        }
    }

    #[test]
    fn token_cycling_walks_the_alphabet() {
        let mut port = test_port();
        assert_eq!(port.next_token(), *b"01");
        assert_eq!(port.next_token(), *b"02");
        for _ in 0..59 {
            port.next_token();
        }
        assert_eq!(port.next_token(), *b"10");
        // Every generated token stays inside the alphabet.
        for _ in 0..5000 {
            let t = port.next_token();
            assert!(TOKEN_CHARS.contains(&t[0]));
            assert!(TOKEN_CHARS.contains(&t[1]));
        }
    }

    #[test]
    fn logging_only_emits_when_enabled() {
        let mut port = test_port();
        port.log_info("quiet").unwrap();
        assert!(port.transport_mut().tx_data().is_empty());

        port.set_logging_on(true);
        port.log_warning("pressure high").unwrap();
        let tx = port.transport_mut().take_tx();
        let msg = Message::from_frame(&tx[..tx.len() - 1]).unwrap();
        assert!(msg.is_opcode(LOG_BG));
        let mut parser = ArgParser::from_msg(&msg);
        assert_eq!(parser.parse_string::<16>().unwrap().as_str(), "WARNING");
        assert_eq!(
            parser.parse_string::<32>().unwrap().as_str(),
            "pressure high"
        );
        assert!(parser.finished());
    }

    #[test]
    fn heartbeat_timing_respects_period_and_toggle() {
        let mut port = test_port();
        port.set_heartbeat_period_ms(1000);
        port.transport_mut().advance_ms(1500);
        assert!(port.heartbeat_due());
        // Too soon for another.
        port.transport_mut().advance_ms(100);
        assert!(!port.heartbeat_due());
        port.transport_mut().advance_ms(1000);
        assert!(port.heartbeat_due());

        port.set_heartbeats_on(false);
        port.transport_mut().advance_ms(5000);
        assert!(!port.heartbeat_due());
    }

    #[test]
    fn heartbeat_timing_survives_clock_wrap() {
        let mut port = test_port();
        port.set_heartbeat_period_ms(1000);
        assert!(port.heartbeat_due_at(u32::MAX - 200));
        assert!(!port.heartbeat_due_at(u32::MAX - 100));
        // 1100 ms later, across the wrap.
        assert!(port.heartbeat_due_at(899));
    }

    #[test]
    fn status_heartbeat_carries_and_resets_error_counters() {
        let mut port = test_port();
        port.stats.frame_too_short = 1;
        port.stats.bad_checksum = 2;

        let mut msg = Message::new();
        let status = HeartbeatStatus {
            max_loop_ms: 5,
            avail_ram_kb: Some(247),
            uptime_mins: Some(16),
        };
        port.build_status_heartbeat(&mut msg, &status);

        assert!(msg.validate());
        assert!(msg.is_opcode(HEARTBEAT_BG));
        assert!(msg.args().starts_with(b"{oatmeal_errs=3,sh=1,bc=2,"));
        assert_eq!(port.stats, Stats::default());

        let mut parser = ArgParser::from_msg(&msg);
        assert!(parser.parse_dict_start());
        assert_eq!(parser.parse_dict_key_value::<u32>(), Some(("oatmeal_errs", 3)));
        assert_eq!(parser.parse_dict_key_value::<u32>(), Some(("sh", 1)));
        assert_eq!(parser.parse_dict_key_value::<u32>(), Some(("bc", 2)));
        assert_eq!(parser.parse_dict_key_value::<u32>(), Some(("loop_ms", 5)));
        assert_eq!(parser.parse_dict_key_value::<i32>(), Some(("avail_kb", 247)));
        assert_eq!(parser.parse_dict_key_value::<u32>(), Some(("uptime", 16)));
        assert!(parser.parse_dict_end());
        assert!(parser.finished());
    }

    #[test]
    fn clean_port_heartbeat_has_no_error_trailer() {
        let mut port = test_port();
        let mut msg = Message::new();
        port.build_status_heartbeat(&mut msg, &HeartbeatStatus::default());
        assert!(msg.validate());
        assert!(msg.args().starts_with(b"{loop_ms=0"));
    }

    #[test]
    fn caller_counters_feed_the_trailer() {
        let mut port = test_port();
        port.stats.unknown_opcode = 2;
        port.stats.bad_message = 1;
        let mut msg = Message::new();
        port.build_status_heartbeat(&mut msg, &HeartbeatStatus::default());
        assert!(msg.args().starts_with(b"{oatmeal_errs=3,uo=2,bm=1,"));
    }
}
