//! JDWP transport-level packet layout.
//!
//! Every packet after the handshake carries an 11-byte header: a 4-byte
//! big-endian length (covering the header itself), a 4-byte id, a flags byte,
//! and either `command_set`/`command` (commands) or a 2-byte error code
//! (replies). The session core is agnostic to packet bodies; this module only
//! knows the header and the handshake magic.

use crate::{JdwpError, Result};

/// The 14 ASCII bytes both peers exchange when a session starts.
pub const HANDSHAKE: &[u8; 14] = b"JDWP-Handshake";

pub const HEADER_LEN: usize = 11;
pub const FLAG_REPLY: u8 = 0x80;

pub(crate) fn get4_be(buf: &[u8]) -> u32 {
    debug_assert!(buf.len() >= 4);
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// A read-only view of one framed packet at the front of the input buffer.
///
/// The view borrows the session's input buffer; the worker consumes
/// [`Request::total_length`] bytes from the buffer once the packet has been
/// dispatched and answered.
#[derive(Debug)]
pub struct Request<'a> {
    buf: &'a [u8],
    length: usize,
}

impl<'a> Request<'a> {
    /// Parse the packet header at the front of `buf`.
    ///
    /// `buf` is the valid prefix of the input buffer and must contain at
    /// least one complete packet (the framing check has already passed).
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(JdwpError::Protocol(format!(
                "packet shorter than header: {} bytes",
                buf.len()
            )));
        }
        let length = get4_be(buf) as usize;
        if length < HEADER_LEN {
            return Err(JdwpError::Protocol(format!("invalid packet length {length}")));
        }
        if length > buf.len() {
            return Err(JdwpError::Protocol(format!(
                "packet length {length} exceeds buffered {} bytes",
                buf.len()
            )));
        }
        Ok(Self { buf, length })
    }

    /// Total packet length, header included.
    pub fn total_length(&self) -> usize {
        self.length
    }

    pub fn id(&self) -> u32 {
        u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
    }

    pub fn flags(&self) -> u8 {
        self.buf[8]
    }

    pub fn is_reply(&self) -> bool {
        self.flags() & FLAG_REPLY != 0
    }

    pub fn command_set(&self) -> u8 {
        self.buf[9]
    }

    pub fn command(&self) -> u8 {
        self.buf[10]
    }

    /// Packet body after the header.
    pub fn payload(&self) -> &'a [u8] {
        &self.buf[HEADER_LEN..self.length]
    }
}

/// An expandable packet buffer for replies and outbound requests.
///
/// Writers fill the body with the `write_*` helpers; `finish` patches the
/// length field once the body is complete.
#[derive(Debug, Default)]
pub struct PacketBuf {
    data: Vec<u8>,
}

impl PacketBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a reply packet to the command with the given id.
    pub fn begin_reply(&mut self, id: u32, error_code: u16) {
        debug_assert!(self.data.is_empty());
        self.data.extend_from_slice(&0u32.to_be_bytes());
        self.data.extend_from_slice(&id.to_be_bytes());
        self.data.push(FLAG_REPLY);
        self.data.extend_from_slice(&error_code.to_be_bytes());
    }

    /// Start a command packet (requests and events emitted by the runtime).
    pub fn begin_command(&mut self, id: u32, command_set: u8, command: u8) {
        debug_assert!(self.data.is_empty());
        self.data.extend_from_slice(&0u32.to_be_bytes());
        self.data.extend_from_slice(&id.to_be_bytes());
        self.data.push(0);
        self.data.push(command_set);
        self.data.push(command);
    }

    /// Patch the length field to cover everything written so far.
    pub fn finish(&mut self) {
        debug_assert!(self.data.len() >= HEADER_LEN);
        let length = self.data.len() as u32;
        self.data[..4].copy_from_slice(&length.to_be_bytes());
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// JDWP string: 4-byte big-endian length followed by UTF-8 bytes.
    pub fn write_string(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.data.extend_from_slice(value.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}
