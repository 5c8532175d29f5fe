//! Message construction and inspection.
//!
//! A [`Message`] owns one frame's worth of buffer and doubles as the
//! incremental builder: `start()` writes the header, the `append_*` family
//! adds arguments with automatic separator accounting, and `finish()` seals
//! the frame with the end byte and both check bytes. Every append returns
//! the number of bytes written, with zero meaning the value did not fit; in
//! that case the cursor is rolled back so a partially written argument never
//! reaches the wire.

use core::fmt;

use crate::codec::{
    checksum,
    value::{self, Encode, Real},
    ARGS_OFFSET, ARG_SEP, CHECKSUM_LEN, CMD_LEN, CMD_OFFSET, DICT_END, DICT_KV_SEP, DICT_START,
    END_BYTE, FLAG_OFFSET, LIST_END, LIST_START, MAX_FRAME_END_OFFSET, MAX_MSG_LEN, MIN_MSG_LEN,
    START_BYTE, TOKEN_LEN, TOKEN_OFFSET,
};

/// The role a message plays in an exchange, carried in the flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Flag {
    /// A new request, expecting a reply with the same token.
    Request = b'R',
    /// The request was received and acted on.
    Ack = b'A',
    /// A long-running request completed.
    Done = b'D',
    /// The request failed.
    Failed = b'F',
    /// Unsolicited broadcast; never acknowledged.
    Background = b'B',
}

impl Flag {
    /// Interpret a wire flag byte, if it is one of the defined flags.
    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            b'R' => Some(Self::Request),
            b'A' => Some(Self::Ack),
            b'D' => Some(Self::Done),
            b'F' => Some(Self::Failed),
            b'B' => Some(Self::Background),
            _ => None,
        }
    }
}

/// One protocol message and the frame bytes that represent it.
///
/// The buffer is fixed at [`MAX_MSG_LEN`] bytes and lives inline, so a
/// `Message` can sit on the stack of a small device and is cheap to copy
/// out of a receive buffer.
#[derive(Clone, Copy)]
pub struct Message {
    buf: [u8; MAX_MSG_LEN],
    len: usize,
}

impl Message {
    /// An empty message; call [`start`](Self::start) before appending.
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_MSG_LEN],
            len: 0,
        }
    }

    /// Copy a received frame into an owned message.
    ///
    /// Fails only when `frame` exceeds [`MAX_MSG_LEN`]. No validation is
    /// performed; pair with [`validate`](Self::validate) for untrusted
    /// bytes.
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        if frame.len() > MAX_MSG_LEN {
            return None;
        }
        let mut msg = Self::new();
        msg.buf[..frame.len()].copy_from_slice(frame);
        msg.len = frame.len();
        Some(msg)
    }

    /* -- inspection -- */

    /// The raw frame bytes written so far.
    pub fn frame(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Frame length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The 4-byte opcode: command plus flag.
    pub fn opcode(&self) -> [u8; 4] {
        [self.buf[1], self.buf[2], self.buf[3], self.buf[4]]
    }

    /// The 3-byte command.
    pub fn cmd(&self) -> [u8; CMD_LEN] {
        [
            self.buf[CMD_OFFSET],
            self.buf[CMD_OFFSET + 1],
            self.buf[CMD_OFFSET + 2],
        ]
    }

    /// The raw flag byte. See [`Flag::from_wire`] for interpretation.
    pub fn flag(&self) -> u8 {
        self.buf[FLAG_OFFSET]
    }

    /// The 2-byte token correlating a request with its reply.
    pub fn token(&self) -> [u8; TOKEN_LEN] {
        [self.buf[TOKEN_OFFSET], self.buf[TOKEN_OFFSET + 1]]
    }

    /// Whether this message carries the given command + flag.
    pub fn is_opcode(&self, opcode: &[u8; 4]) -> bool {
        self.opcode() == *opcode
    }

    /// Whether this message carries the given command, any flag.
    pub fn is_command(&self, cmd: &[u8; CMD_LEN]) -> bool {
        self.cmd() == *cmd
    }

    /// The argument payload of a complete frame.
    pub fn args(&self) -> &[u8] {
        if self.len < MIN_MSG_LEN {
            return &[];
        }
        &self.buf[ARGS_OFFSET..self.len - CHECKSUM_LEN - 1]
    }

    /// Run the frame checks over the current contents.
    pub fn validate(&self) -> bool {
        checksum::validate_frame(self.frame())
    }

    /* -- construction -- */

    /// Reset the message and write the header.
    ///
    /// The command and token bytes must come from the token alphabet (any
    /// printable ASCII except space, `<`, `>`); this is not checked here.
    pub fn start(&mut self, cmd: &[u8; CMD_LEN], flag: Flag, token: &[u8; TOKEN_LEN]) {
        self.buf[0] = START_BYTE;
        self.buf[CMD_OFFSET..CMD_OFFSET + CMD_LEN].copy_from_slice(cmd);
        self.buf[FLAG_OFFSET] = flag as u8;
        self.buf[TOKEN_OFFSET..TOKEN_OFFSET + TOKEN_LEN].copy_from_slice(token);
        self.len = ARGS_OFFSET;
    }

    /// Seal the frame: end byte, length check byte, content check byte.
    ///
    /// No arguments can be appended afterwards.
    pub fn finish(&mut self) {
        // The length check covers the finished frame, three bytes from now.
        let checklen = checksum::length_checksum(self.len + 3);
        self.buf[self.len] = END_BYTE;
        self.len += 1;
        self.buf[self.len] = checklen;
        self.len += 1;
        self.buf[self.len] = checksum::content_checksum(&self.buf[..self.len]);
        self.len += 1;
    }

    fn rollback(&mut self, orig_len: usize) -> usize {
        self.len = orig_len;
        0
    }

    /// Append one raw byte, bounded so the frame tail still fits.
    pub fn write_byte(&mut self, b: u8) -> usize {
        if self.len < MAX_FRAME_END_OFFSET {
            self.buf[self.len] = b;
            self.len += 1;
            1
        } else {
            0
        }
    }

    /// Append raw bytes, all or nothing.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> usize {
        if self.len + bytes.len() > MAX_FRAME_END_OFFSET {
            return 0;
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        bytes.len()
    }

    /// Append payload bytes with escape coding but no surrounding quotes.
    pub fn write_encoded(&mut self, bytes: &[u8]) -> usize {
        let n = value::encode_bytes(&mut self.buf[self.len..MAX_FRAME_END_OFFSET], bytes);
        if n == 0 && !bytes.is_empty() {
            return 0;
        }
        self.len += n;
        n
    }

    /// Append `val` as exactly eight uppercase hex digits.
    pub fn write_hex(&mut self, val: u32) -> usize {
        self.write_bytes(&value::u32_to_hex(val))
    }

    /// Append an argument separator unconditionally.
    pub fn separator(&mut self) -> usize {
        self.write_byte(ARG_SEP)
    }

    /// Append a separator iff the previous byte ends a value.
    ///
    /// No separator follows the header, an opening delimiter, a dict `=`,
    /// or another separator; this one rule keeps containers free of leading
    /// and doubled commas.
    pub fn separator_if_needed(&mut self) -> usize {
        if self.len > ARGS_OFFSET
            && !matches!(
                self.buf[self.len - 1],
                LIST_START | DICT_START | DICT_KV_SEP | ARG_SEP
            )
        {
            self.separator()
        } else {
            0
        }
    }

    /// Append a value as the next argument, with separator accounting.
    ///
    /// Accepts integers, reals ([`Real`] for explicit precision), booleans,
    /// `&str`, [`Blob`](crate::Blob), and `Option` of any of these (where
    /// `None` encodes the null marker).
    pub fn append<V: Encode>(&mut self, val: V) -> usize {
        let orig_len = self.len;
        self.separator_if_needed();
        let n = val.encode(&mut self.buf[self.len..MAX_FRAME_END_OFFSET]);
        if n == 0 {
            return self.rollback(orig_len);
        }
        self.len += n;
        self.len - orig_len
    }

    /// Append a real with an explicit significant-figures budget.
    pub fn append_real(&mut self, val: f64, sig_figs: u8) -> usize {
        self.append(Real(val, sig_figs))
    }

    /// Append a byte blob (`0"…"`).
    pub fn append_bytes(&mut self, data: &[u8]) -> usize {
        self.append(value::Blob(data))
    }

    /// Append the null marker.
    pub fn append_none(&mut self) -> usize {
        let orig_len = self.len;
        self.separator_if_needed();
        if self.write_byte(b'N') == 0 {
            return self.rollback(orig_len);
        }
        self.len - orig_len
    }

    /// Open a list argument.
    pub fn append_list_start(&mut self) -> usize {
        let orig_len = self.len;
        self.separator_if_needed();
        if self.write_byte(LIST_START) == 0 {
            return self.rollback(orig_len);
        }
        self.len - orig_len
    }

    /// Close a list argument.
    pub fn append_list_end(&mut self) -> usize {
        self.write_byte(LIST_END)
    }

    /// Open a dict argument.
    pub fn append_dict_start(&mut self) -> usize {
        let orig_len = self.len;
        self.separator_if_needed();
        if self.write_byte(DICT_START) == 0 {
            return self.rollback(orig_len);
        }
        self.len - orig_len
    }

    /// Close a dict argument.
    pub fn append_dict_end(&mut self) -> usize {
        self.write_byte(DICT_END)
    }

    /// Append a dict key and its `=`; follow with an `append` for the value.
    pub fn append_dict_key(&mut self, key: &str) -> usize {
        let orig_len = self.len;
        self.separator_if_needed();
        if self.write_bytes(key.as_bytes()) == 0 || self.write_byte(DICT_KV_SEP) == 0 {
            return self.rollback(orig_len);
        }
        self.len - orig_len
    }

    /// Append a `key=value` dict entry atomically.
    pub fn append_dict_key_value<V: Encode>(&mut self, key: &str, val: V) -> usize {
        let orig_len = self.len;
        if self.append_dict_key(key) == 0 || self.append(val) == 0 {
            return self.rollback(orig_len);
        }
        self.len - orig_len
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.frame() == other.frame()
    }
}

impl Eq for Message {}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message({:?})", String::from_utf8_lossy(self.frame()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::value::Blob;

    fn frame_str(msg: &Message) -> &str {
        core::str::from_utf8(msg.frame()).unwrap()
    }

    #[test]
    fn empty_args_frame() {
        let mut msg = Message::new();
        msg.start(b"DIS", Flag::Request, b"XY");
        msg.finish();
        assert_eq!(frame_str(&msg), "<DISRXY>i_");
        assert!(msg.validate());
        assert_eq!(msg.cmd(), *b"DIS");
        assert_eq!(msg.flag(), b'R');
        assert_eq!(msg.token(), *b"XY");
        assert!(msg.args().is_empty());
        assert!(msg.is_opcode(b"DISR"));
        assert!(msg.is_command(b"DIS"));
        assert!(!msg.is_opcode(b"DISA"));
    }

    #[test]
    fn mixed_type_payload() {
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
        assert_eq!(frame_str(&msg), "<RUNRaa1.23,T,\"Hi!\",[1,2]>-b");
        assert!(msg.validate());
    }

    #[test]
    fn small_ints_with_list() {
        let mut msg = Message::new();
        msg.start(b"XYZ", Flag::Ack, b"zZ");
        msg.append(101);
        msg.append_list_start();
        msg.append(0);
        msg.append(42);
        msg.append_list_end();
        msg.finish();
        assert_eq!(frame_str(&msg), "<XYZAzZ101,[0,42]>SH");
        assert!(msg.validate());
    }

    #[test]
    fn real_and_bool() {
        let mut msg = Message::new();
        msg.start(b"LOL", Flag::Request, b"Oh");
        msg.append(123);
        msg.append(true);
        msg.append_real(99.9, 3);
        msg.finish();
        assert_eq!(frame_str(&msg), "<LOLROh123,T,99.9>SS");
        assert!(msg.validate());
    }

    #[test]
    fn dict_heartbeat_body() {
        let mut msg = Message::new();
        msg.start(b"HRT", Flag::Background, b"VU");
        msg.append_dict_start();
        msg.append_dict_key_value("a", 5.1);
        msg.append_dict_key_value("avail_kb", 247);
        msg.append_dict_key_value("b", "hi");
        msg.append_dict_key_value("loop_ms", 1);
        msg.append_dict_key_value("uptime", 16);
        msg.append_dict_end();
        msg.finish();
        assert_eq!(
            frame_str(&msg),
            "<HRTBVU{a=5.1,avail_kb=247,b=\"hi\",loop_ms=1,uptime=16}>BH"
        );
        assert!(msg.validate());
    }

    #[test]
    fn long_dict_of_booleans() {
        let mut msg = Message::new();
        msg.start(b"HRT", Flag::Background, b"0E");
        msg.append_dict_start();
        msg.append_dict_key_value("Itotal", Real(0.372172, 6));
        msg.append_dict_key_value("v1", false);
        msg.append_dict_key_value("v10", false);
        msg.append_dict_key_value("v2", false);
        msg.append_dict_key_value("v3", false);
        msg.append_dict_key_value("v4", false);
        msg.append_dict_key_value("v5", false);
        msg.append_dict_key_value("v6", false);
        msg.append_dict_key_value("v7", false);
        msg.append_dict_key_value("v8", false);
        msg.append_dict_key_value("v9", false);
        msg.append_dict_end();
        msg.finish();
        assert_eq!(
            frame_str(&msg),
            "<HRTB0E{Itotal=0.372172,v1=F,v10=F,v2=F,v3=F,v4=F,v5=F,v6=F,v7=F,v8=F,v9=F}>yI"
        );
        assert!(msg.validate());
    }

    #[test]
    fn discovery_reply_strings() {
        let mut msg = Message::new();
        msg.start(b"DIS", Flag::Ack, b"ea");
        msg.append("ValveCluster");
        msg.append(0);
        msg.append("0031FFFFFFFFFFFF4E45356740010017");
        msg.append("e5938cd");
        msg.finish();
        assert_eq!(
            frame_str(&msg),
            "<DISAea\"ValveCluster\",0,\"0031FFFFFFFFFFFF4E45356740010017\",\"e5938cd\">Hg"
        );
        assert!(msg.validate());
    }

    #[test]
    fn separator_accounting_in_nested_containers() {
        let mut msg = Message::new();
        msg.start(b"TST", Flag::Request, b"ab");
        msg.append(1);
        msg.append_list_start();
        msg.append(1);
        msg.append_dict_start();
        msg.append_dict_key("a");
        msg.append(2);
        msg.append_dict_end();
        msg.append_list_end();
        msg.finish();
        assert_eq!(msg.args(), b"1,[1,{a=2}]");
        assert!(msg.validate());
    }

    #[test]
    fn empty_containers_and_empty_string() {
        let mut msg = Message::new();
        msg.start(b"TST", Flag::Request, b"XY");
        msg.append("");
        msg.append_dict_start();
        msg.append_dict_end();
        msg.append_list_start();
        msg.append_list_end();
        msg.finish();
        assert_eq!(msg.args(), b"\"\",{},[]");
        assert!(msg.validate());
    }

    #[test]
    fn none_and_option_arguments() {
        let mut msg = Message::new();
        msg.start(b"TST", Flag::Request, b"ab");
        msg.append_none();
        msg.append(None::<u8>);
        msg.append(Some(7u8));
        msg.finish();
        assert_eq!(msg.args(), b"N,N,7");
        assert!(msg.validate());
    }

    #[test]
    fn blob_argument() {
        let mut msg = Message::new();
        msg.start(b"TST", Flag::Request, b"ab");
        msg.append_bytes(b"123");
        msg.append(Blob(b"a\"b"));
        msg.finish();
        assert_eq!(msg.args(), b"0\"123\",0\"a\\\"b\"");
        assert!(msg.validate());
    }

    #[test]
    fn write_hex_pads_and_stops_at_capacity() {
        let mut msg = Message::new();
        msg.start(b"TST", Flag::Request, b"ab");
        assert_eq!(msg.write_hex(0x12345678), 8);
        assert_eq!(msg.write_hex(0x90ABCDEF), 8);
        msg.finish();
        assert_eq!(msg.args(), b"1234567890ABCDEF");

        msg.start(b"TST", Flag::Request, b"ab");
        assert_eq!(msg.write_hex(0x123), 8);
        assert_eq!(msg.write_hex(0xABC), 8);
        msg.finish();
        assert_eq!(msg.args(), b"0000012300000ABC");

        msg.start(b"TST", Flag::Request, b"ab");
        for _ in 0..200 {
            msg.write_hex(0x1234ABCD);
        }
        assert_eq!(msg.write_hex(0x1234ABCD), 0);
    }

    #[test]
    fn overflow_returns_zero_and_rolls_back() {
        let mut msg = Message::new();
        msg.start(b"TST", Flag::Request, b"ab");
        // Fill most of the frame, then confirm an oversized append is a
        // clean no-op.
        while msg.append(9) != 0 {}
        let len_before = msg.len();
        assert_eq!(msg.append("this string will not fit in what remains"), 0);
        assert_eq!(msg.len(), len_before);
        assert_eq!(msg.append_dict_key_value("some_key", 12345), 0);
        assert_eq!(msg.len(), len_before);
        msg.finish();
        assert!(msg.validate());
        assert_eq!(msg.len(), MAX_MSG_LEN);
    }

    #[test]
    fn atomic_dict_entry_rolls_back_key_when_value_fails() {
        let mut msg = Message::new();
        msg.start(b"TST", Flag::Request, b"ab");
        // Leave just enough room for the key but not the value.
        while msg.len() < MAX_FRAME_END_OFFSET - 3 {
            msg.write_byte(b'x');
        }
        let len_before = msg.len();
        assert_eq!(msg.append_dict_key_value("k", 123456), 0);
        assert_eq!(msg.len(), len_before);
    }

    #[test]
    fn builder_output_always_validates() {
        // Messages of varying argument shapes all pass the frame checks.
        let mut msg = Message::new();
        for i in 0..20u8 {
            msg.start(b"CHK", Flag::Request, b"01");
            msg.append(i);
            msg.append_list_start();
            for j in 0..i % 5 {
                msg.append(j);
            }
            msg.append_list_end();
            msg.finish();
            assert!(msg.validate(), "iteration {i}");
        }
    }

    #[test]
    fn from_frame_copies_and_bounds() {
        let mut msg = Message::new();
        msg.start(b"DIS", Flag::Request, b"XY");
        msg.finish();
        let copy = Message::from_frame(msg.frame()).unwrap();
        assert_eq!(copy, msg);
        assert!(Message::from_frame(&[0u8; MAX_MSG_LEN + 1]).is_none());
    }

    #[test]
    fn flag_wire_mapping() {
        for flag in [
            Flag::Request,
            Flag::Ack,
            Flag::Done,
            Flag::Failed,
            Flag::Background,
        ] {
            assert_eq!(Flag::from_wire(flag as u8), Some(flag));
        }
        assert_eq!(Flag::from_wire(b'x'), None);
    }
}
