//! Streaming message construction.
//!
//! [`StreamMsg`] mirrors the [`Message`](crate::Message) builder API but
//! pushes every byte straight through the port's transport, keeping the
//! length and content checksums incrementally so the frame never needs to
//! be buffered. Useful on devices where even one frame of RAM is dear.
//!
//! Unlike the buffered builder there is no rollback: once a byte is on the
//! wire it stays there, so callers should know their arguments fit the
//! frame cap. Dropping the builder without [`finish`](StreamMsg::finish)
//! leaves an unterminated frame on the line, which the peer will discard
//! when the next frame starts.

use std::io;

use crate::codec::{
    checksum,
    value::{self, ScalarArg, SCALAR_BUF_LEN},
    ARGS_OFFSET, ARG_SEP, DICT_END, DICT_KV_SEP, DICT_START, END_BYTE, LIST_END, LIST_START,
    START_BYTE,
};
use crate::message::Flag;
use crate::transport::Transport;

use super::Port;

/// A message being written straight to the transport.
pub struct StreamMsg<'p, T: Transport> {
    port: &'p mut Port<T>,
    len: usize,
    acc: u8,
    last: u8,
}

impl<'p, T: Transport> StreamMsg<'p, T> {
    pub(super) fn start(
        port: &'p mut Port<T>,
        cmd: &[u8; 3],
        flag: Flag,
        token: &[u8; 2],
    ) -> io::Result<Self> {
        let mut msg = Self {
            port,
            len: 0,
            acc: 0,
            last: 0,
        };
        msg.write_byte(START_BYTE)?;
        msg.write_bytes(cmd)?;
        msg.write_byte(flag as u8)?;
        msg.write_bytes(token)?;
        Ok(msg)
    }

    /// Write one raw byte, folding it into the running checksum.
    pub fn write_byte(&mut self, b: u8) -> io::Result<()> {
        self.acc = checksum::accumulate(self.acc, b);
        self.len += 1;
        self.last = b;
        self.port.write_all(&[b])
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        for &b in bytes {
            self.write_byte(b)?;
        }
        Ok(())
    }

    /// Write payload bytes with escape coding, no surrounding quotes.
    pub fn write_encoded(&mut self, bytes: &[u8]) -> io::Result<()> {
        for &b in bytes {
            match value::escaped(b) {
                Some(pair) => self.write_bytes(&pair)?,
                None => self.write_byte(b)?,
            }
        }
        Ok(())
    }

    /// Write `val` as exactly eight uppercase hex digits.
    pub fn write_hex(&mut self, val: u32) -> io::Result<()> {
        self.write_bytes(&value::u32_to_hex(val))
    }

    /// Write an argument separator unconditionally.
    pub fn separator(&mut self) -> io::Result<()> {
        self.write_byte(ARG_SEP)
    }

    fn separator_if_needed(&mut self) -> io::Result<()> {
        if self.len > ARGS_OFFSET
            && !matches!(self.last, LIST_START | DICT_START | DICT_KV_SEP | ARG_SEP)
        {
            self.separator()?;
        }
        Ok(())
    }

    /// Append a scalar argument, with separator accounting.
    pub fn append<V: ScalarArg>(&mut self, val: V) -> io::Result<()> {
        self.separator_if_needed()?;
        let mut tmp = [0u8; SCALAR_BUF_LEN];
        let n = val.encode(&mut tmp);
        self.write_bytes(&tmp[..n])
    }

    /// Append a real with an explicit significant-figures budget.
    pub fn append_real(&mut self, val: f64, sig_figs: u8) -> io::Result<()> {
        self.append(value::Real(val, sig_figs))
    }

    /// Append a string argument.
    pub fn append_str(&mut self, s: &str) -> io::Result<()> {
        self.separator_if_needed()?;
        self.write_byte(b'"')?;
        self.write_encoded(s.as_bytes())?;
        self.write_byte(b'"')
    }

    /// Append a byte-blob argument (`0"…"`).
    pub fn append_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.separator_if_needed()?;
        self.write_bytes(b"0\"")?;
        self.write_encoded(data)?;
        self.write_byte(b'"')
    }

    /// Append the null marker.
    pub fn append_none(&mut self) -> io::Result<()> {
        self.separator_if_needed()?;
        self.write_byte(b'N')
    }

    /// Open a list argument.
    pub fn append_list_start(&mut self) -> io::Result<()> {
        self.separator_if_needed()?;
        self.write_byte(LIST_START)
    }

    /// Close a list argument.
    pub fn append_list_end(&mut self) -> io::Result<()> {
        self.write_byte(LIST_END)
    }

    /// Open a dict argument.
    pub fn append_dict_start(&mut self) -> io::Result<()> {
        self.separator_if_needed()?;
        self.write_byte(DICT_START)
    }

    /// Close a dict argument.
    pub fn append_dict_end(&mut self) -> io::Result<()> {
        self.write_byte(DICT_END)
    }

    /// Append a dict key and its `=`; follow with an `append` for the
    /// value.
    pub fn append_dict_key(&mut self, key: &str) -> io::Result<()> {
        self.separator_if_needed()?;
        self.write_bytes(key.as_bytes())?;
        self.write_byte(DICT_KV_SEP)
    }

    /// Append a `key=value` dict entry.
    pub fn append_dict_key_value<V: ScalarArg>(&mut self, key: &str, val: V) -> io::Result<()> {
        self.append_dict_key(key)?;
        self.append(val)
    }

    /// Seal the frame and terminate the line.
    ///
    /// The length check byte is derived from the final frame length, the
    /// content check from the running accumulator, so no second pass over
    /// the frame happens.
    pub fn finish(mut self) -> io::Result<()> {
        let checklen = checksum::length_checksum(self.len + 3);
        self.write_byte(END_BYTE)?;
        self.write_byte(checklen)?;
        let content = checksum::check_byte(u16::from(self.acc));
        self.write_byte(content)?;
        self.port.write_all(b"\n")?;
        self.port.stats.frames_written += 1;
        Ok(())
    }
}
