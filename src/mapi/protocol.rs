//! MAPI wire protocol constants and block framing.
//!
//! A logical message travels as one or more blocks. Every block starts with
//! a 2-byte little-endian header holding `(payload_len << 1) | last`, where
//! `last` marks the final block of the message.

use std::io::{Read, Write};

use bytes::{BufMut, BytesMut};
use tracing::trace;

use super::error::{MapiError, MapiResult};

// ============================================================================
// Protocol Constants
// ============================================================================

/// Largest payload a single block may carry.
pub const MAX_BLOCK_PAYLOAD: usize = 8 * 1024 - 2;

/// Size of the block header.
pub const BLOCK_HEADER_LEN: usize = 2;

/// Prefix of every SQL command sent to the server.
pub const COMMAND_LEADER: &str = "s";

/// Terminator appended to every SQL command.
pub const COMMAND_TERMINATOR: &str = ";";

/// Prefix of session control commands.
pub const CONTROL_LEADER: &str = "X";

/// Leading markers of response lines.
pub mod marker {
    pub const PROMPT: &str = "";
    pub const INFO: &str = "#";
    pub const ERROR: &str = "!";
    pub const TABLE: &str = "&1";
    pub const UPDATE: &str = "&2";
    pub const SCHEMA: &str = "&3";
    pub const TRANSACTION: &str = "&4";
    pub const PREPARE: &str = "&5";
    pub const BLOCK: &str = "&6";
    pub const HEADER: &str = "%";
    pub const TUPLE: &str = "[";
    pub const REDIRECT: &str = "^";
}

/// Wrap a SQL operation in the command leader and terminator.
pub fn command(operation: &str) -> String {
    format!("{}{}{}", COMMAND_LEADER, operation, COMMAND_TERMINATOR)
}

/// Build a session control command such as `Xreply_size -1`.
pub fn control(name: &str, arg: impl std::fmt::Display) -> String {
    format!("{}{} {}", CONTROL_LEADER, name, arg)
}

// ============================================================================
// Block Header
// ============================================================================

/// Descriptor preceding each block payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub len: usize,
    pub last: bool,
}

impl BlockHeader {
    pub fn encode(self) -> [u8; BLOCK_HEADER_LEN] {
        let raw = ((self.len as u16) << 1) | u16::from(self.last);
        raw.to_le_bytes()
    }

    pub fn decode(raw: [u8; BLOCK_HEADER_LEN]) -> MapiResult<Self> {
        let raw = u16::from_le_bytes(raw);
        let len = (raw >> 1) as usize;
        if len > MAX_BLOCK_PAYLOAD {
            return Err(MapiError::Protocol(format!(
                "block length {} exceeds maximum of {}",
                len, MAX_BLOCK_PAYLOAD
            )));
        }
        Ok(Self {
            len,
            last: raw & 1 == 1,
        })
    }
}

/// Frame a logical message into blocks.
///
/// An empty message still produces one (empty) final block.
pub fn frame_message(msg: &[u8]) -> BytesMut {
    let blocks = msg.len().div_ceil(MAX_BLOCK_PAYLOAD).max(1);
    let mut buf = BytesMut::with_capacity(msg.len() + blocks * BLOCK_HEADER_LEN);

    let mut chunks = msg.chunks(MAX_BLOCK_PAYLOAD).peekable();
    if chunks.peek().is_none() {
        buf.put_slice(&BlockHeader { len: 0, last: true }.encode());
        return buf;
    }

    while let Some(chunk) = chunks.next() {
        let header = BlockHeader {
            len: chunk.len(),
            last: chunks.peek().is_none(),
        };
        buf.put_slice(&header.encode());
        buf.put_slice(chunk);
    }

    buf
}

// ============================================================================
// Block Stream
// ============================================================================

/// Reads and writes logical messages over a byte stream.
///
/// This is the only path between a server session and its socket. It does
/// not look at payload contents.
#[derive(Debug)]
pub struct BlockStream<S> {
    stream: S,
    read_buffer: BytesMut,
}

impl<S: Read + Write> BlockStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buffer: BytesMut::with_capacity(MAX_BLOCK_PAYLOAD),
        }
    }

    /// Send one logical message, split into as many blocks as needed.
    pub fn write_message(&mut self, msg: &str) -> MapiResult<()> {
        let framed = frame_message(msg.as_bytes());
        trace!(bytes = msg.len(), "sending message");
        self.stream.write_all(&framed)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Receive one logical message, reading blocks until the final one.
    pub fn read_message(&mut self) -> MapiResult<String> {
        self.read_buffer.clear();

        loop {
            let mut raw = [0u8; BLOCK_HEADER_LEN];
            self.stream.read_exact(&mut raw)?;
            let header = BlockHeader::decode(raw)?;

            let start = self.read_buffer.len();
            self.read_buffer.resize(start + header.len, 0);
            self.stream.read_exact(&mut self.read_buffer[start..])?;

            if header.last {
                break;
            }
        }

        trace!(bytes = self.read_buffer.len(), "received message");
        let payload = self.read_buffer.split().freeze();
        String::from_utf8(payload.to_vec())
            .map_err(|e| MapiError::Protocol(format!("message is not valid UTF-8: {}", e)))
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
