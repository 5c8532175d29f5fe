//! Backtracking argument parsing.
//!
//! [`ArgParser`] walks a received payload token by token. Every `parse_*`
//! method is atomic: it either consumes a complete token (including any
//! pending separator) and advances, or it fails and leaves the parser in
//! exactly its prior state. That makes speculative parsing cheap: try a
//! narrow integer, fall back to a wider one, fall back to a string, with
//! no bookkeeping on the caller's side.
//!
//! The parser tracks separator debt and container depth but not container
//! kind: a dict key at the top level is accepted syntactically, so callers
//! are responsible for sequencing `parse_dict_start` → `parse_dict_key` →
//! value → `parse_dict_end`. Keeping the parser oblivious to that keeps it
//! a single flat cursor.

use heapless::{String, Vec};

use crate::codec::{
    value::{self, Decode},
    ARG_SEP, DICT_END, DICT_KV_SEP, DICT_START, LIST_END, LIST_START,
};
use crate::message::Message;

/// Cursor over one message's argument payload.
///
/// `Copy` so callers (and the convenience methods here) can snapshot the
/// whole parser state and restore it on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgParser<'a> {
    rem: &'a [u8],
    /// The next value must be preceded by a separator.
    need_sep: bool,
    /// At least one value was parsed at the current nesting level.
    args_parsed: bool,
    depth: u8,
}

impl<'a> ArgParser<'a> {
    /// Parse the given payload bytes.
    pub fn new(args: &'a [u8]) -> Self {
        Self {
            rem: args,
            need_sep: false,
            args_parsed: false,
            depth: 0,
        }
    }

    /// Parse the argument payload of a complete message.
    pub fn from_msg(msg: &'a Message) -> Self {
        Self::new(msg.args())
    }

    /// Parse `msg`'s payload only if it carries the given opcode.
    pub fn start(msg: &'a Message, opcode: &[u8; 4]) -> Option<Self> {
        if msg.is_opcode(opcode) {
            Some(Self::from_msg(msg))
        } else {
            None
        }
    }

    /// The unconsumed payload bytes.
    pub fn remaining(&self) -> &'a [u8] {
        self.rem
    }

    /// Whether the whole payload was consumed cleanly: no bytes left, all
    /// containers closed, and no dangling separator.
    pub fn finished(&self) -> bool {
        self.rem.is_empty() && self.depth == 0 && (!self.args_parsed || self.need_sep)
    }

    fn can_start_arg(&self) -> bool {
        !self.need_sep || self.rem.first() == Some(&ARG_SEP)
    }

    fn chomp(&mut self, n: usize) {
        self.rem = &self.rem[n..];
    }

    /// Consume an expected separator explicitly.
    ///
    /// Optional: every value parser also consumes a pending separator on
    /// its own.
    pub fn parse_sep(&mut self) -> bool {
        if self.need_sep && self.rem.first() == Some(&ARG_SEP) {
            self.chomp(1);
            self.need_sep = false;
            true
        } else {
            false
        }
    }

    /// Parse a scalar argument of type `T`.
    ///
    /// `T` may be any integer width, `f32`/`f64`, or `bool`. Out-of-range
    /// values fail without consuming anything, so a wider retry is safe.
    pub fn parse<T: Decode>(&mut self) -> Option<T> {
        if !self.can_start_arg() {
            return None;
        }
        let sep = self.need_sep as usize;
        let (val, n) = T::decode(&self.rem[sep..])?;
        self.chomp(sep + n);
        self.args_parsed = true;
        self.need_sep = true;
        Some(val)
    }

    /// Parse the null marker `N`.
    pub fn parse_null(&mut self) -> bool {
        if !self.can_start_arg() {
            return false;
        }
        let sep = self.need_sep as usize;
        if self.rem.get(sep) != Some(&b'N') {
            return false;
        }
        self.chomp(sep + 1);
        self.args_parsed = true;
        self.need_sep = true;
        true
    }

    /// Parse a string argument, decoding escapes into `dst`.
    ///
    /// Returns the decoded length. Fails (leaving the parser unchanged)
    /// when `dst` is too small; retry with a bigger buffer.
    pub fn parse_str(&mut self, dst: &mut [u8]) -> Option<usize> {
        if !self.can_start_arg() {
            return None;
        }
        let sep = self.need_sep as usize;
        let (consumed, produced) = value::parse_quoted(&self.rem[sep..], dst)?;
        self.chomp(sep + consumed);
        self.args_parsed = true;
        self.need_sep = true;
        Some(produced)
    }

    /// Parse a byte-blob argument (`0"…"`) into `dst`.
    pub fn parse_bytes(&mut self, dst: &mut [u8]) -> Option<usize> {
        if !self.can_start_arg() {
            return None;
        }
        let sep = self.need_sep as usize;
        let (consumed, produced) = value::parse_blob(&self.rem[sep..], dst)?;
        self.chomp(sep + consumed);
        self.args_parsed = true;
        self.need_sep = true;
        Some(produced)
    }

    /// Parse a string argument into an owned fixed-capacity string.
    pub fn parse_string<const N: usize>(&mut self) -> Option<String<N>> {
        let mut probe = *self;
        let mut buf = [0u8; N];
        let n = probe.parse_str(&mut buf)?;
        let text = core::str::from_utf8(&buf[..n]).ok()?;
        let mut out = String::new();
        out.push_str(text).ok()?;
        *self = probe;
        Some(out)
    }

    fn parse_collection_start(&mut self, open: u8) -> bool {
        if !self.can_start_arg() {
            return false;
        }
        let sep = self.need_sep as usize;
        if self.rem.get(sep) != Some(&open) {
            return false;
        }
        self.chomp(sep + 1);
        self.depth += 1;
        self.args_parsed = false;
        self.need_sep = false;
        true
    }

    fn parse_collection_end(&mut self, close: u8) -> bool {
        // A value was opened but the separator debt is clear, meaning a
        // separator was just consumed: `[1,2,]` must not close here.
        if self.rem.is_empty() || (self.args_parsed && !self.need_sep) {
            return false;
        }
        if self.depth == 0 || self.rem[0] != close {
            return false;
        }
        self.chomp(1);
        self.depth -= 1;
        self.args_parsed = true;
        self.need_sep = true;
        true
    }

    /// Parse a list opening `[` (and any pending separator).
    pub fn parse_list_start(&mut self) -> bool {
        self.parse_collection_start(LIST_START)
    }

    /// Parse a list closing `]`.
    pub fn parse_list_end(&mut self) -> bool {
        self.parse_collection_end(LIST_END)
    }

    /// Parse a dict opening `{` (and any pending separator).
    pub fn parse_dict_start(&mut self) -> bool {
        self.parse_collection_start(DICT_START)
    }

    /// Parse a dict closing `}`.
    pub fn parse_dict_end(&mut self) -> bool {
        self.parse_collection_end(DICT_END)
    }

    /// Parse a dict key and its `=`, returning the key.
    ///
    /// Succeeds only between [`parse_dict_start`](Self::parse_dict_start)
    /// and [`parse_dict_end`](Self::parse_dict_end) in a well-formed
    /// payload; the key is a borrow of the payload itself.
    pub fn parse_dict_key(&mut self) -> Option<&'a str> {
        if !self.can_start_arg() {
            return None;
        }
        let rem = self.rem;
        let sep = self.need_sep as usize;
        let body = &rem[sep..];
        let key_len = value::dict_key_len(body);
        if key_len == 0 || body.get(key_len) != Some(&DICT_KV_SEP) {
            return None;
        }
        // A value must follow the '='.
        if body.len() < key_len + 2 {
            return None;
        }
        let key = core::str::from_utf8(&body[..key_len]).ok()?;
        self.chomp(sep + key_len + 1);
        self.args_parsed = true;
        // The '=' stands in for the separator before the value.
        self.need_sep = false;
        Some(key)
    }

    /// Parse a `key=value` dict entry with a scalar value, atomically.
    pub fn parse_dict_key_value<T: Decode>(&mut self) -> Option<(&'a str, T)> {
        let mut probe = *self;
        let key = probe.parse_dict_key()?;
        let val = probe.parse::<T>()?;
        *self = probe;
        Some((key, val))
    }

    /// Parse a whole list of scalars into a fixed-capacity vector.
    ///
    /// Fails without consuming anything if the list holds more than `N`
    /// items or any item is not a `T`.
    pub fn parse_list<T: Decode, const N: usize>(&mut self) -> Option<Vec<T, N>> {
        let mut probe = *self;
        if !probe.parse_list_start() {
            return None;
        }
        let mut items: Vec<T, N> = Vec::new();
        while let Some(v) = probe.parse::<T>() {
            // A full vector fails the whole list rather than truncating it.
            items.push(v).ok()?;
        }
        if !probe.parse_list_end() {
            return None;
        }
        *self = probe;
        Some(items)
    }

    /// Parse a whole list of strings into fixed-capacity strings.
    pub fn parse_list_of_strs<const S: usize, const N: usize>(
        &mut self,
    ) -> Option<Vec<String<S>, N>> {
        let mut probe = *self;
        if !probe.parse_list_start() {
            return None;
        }
        let mut items: Vec<String<S>, N> = Vec::new();
        while let Some(s) = probe.parse_string::<S>() {
            items.push(s).ok()?;
        }
        if !probe.parse_list_end() {
            return None;
        }
        *self = probe;
        Some(items)
    }
}
