//! Wire codec for messages between the server and its clients
//!
//! Frame layout (big-endian):
//! ```text
//! [len:u32][msgid:u64][flags:u8][method_len:u16][method][nargs:u32][arg]*
//! ```
//! `len` counts everything after itself. Each argument is a one-byte tag
//! followed by its value; byte strings, text and lists carry a u32 length.
//!
//! Server-initiated notifications use `msgid == 0` with the `ASYNC` flag and
//! one of the reserved method names below.

use std::collections::VecDeque;

use tidestore_core::{Oid, Tid};

use crate::error::{ClientError, ClientResult};

/// Largest accepted value of the length prefix: 64 MiB.
pub const MAX_FRAME: u32 = 64 * 1024 * 1024;

/// Fixed part of a frame after the length prefix: msgid, flags, method
/// length, argument count.
const FRAME_FIXED: usize = 8 + 1 + 2 + 4;

/// No reply is expected
pub const FLAG_ASYNC: u8 = 0x01;
/// The message answers the request with the same msgid
pub const FLAG_REPLY: u8 = 0x02;
/// The reply carries an error description instead of a result
pub const FLAG_ERROR: u8 = 0x04;

pub const METHOD_INVALIDATE_TRANSACTION: &str = "invalidateTransaction";
pub const METHOD_INFO: &str = "info";

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_U64: u8 = 2;
const TAG_BYTES: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_LIST: u8 = 5;

/// One message argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Null,
    Bool(bool),
    U64(u64),
    Bytes(Vec<u8>),
    Str(String),
    List(Vec<Arg>),
}

impl Arg {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Arg::Null => buf.push(TAG_NULL),
            Arg::Bool(value) => {
                buf.push(TAG_BOOL);
                buf.push(u8::from(*value));
            }
            Arg::U64(value) => {
                buf.push(TAG_U64);
                buf.extend_from_slice(&value.to_be_bytes());
            }
            Arg::Bytes(bytes) => {
                buf.push(TAG_BYTES);
                buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                buf.extend_from_slice(bytes);
            }
            Arg::Str(text) => {
                buf.push(TAG_STR);
                buf.extend_from_slice(&(text.len() as u32).to_be_bytes());
                buf.extend_from_slice(text.as_bytes());
            }
            Arg::List(items) => {
                buf.push(TAG_LIST);
                buf.extend_from_slice(&(items.len() as u32).to_be_bytes());
                for item in items {
                    item.encode_into(buf);
                }
            }
        }
    }

    fn decode(reader: &mut Reader<'_>) -> ClientResult<Arg> {
        match reader.u8()? {
            TAG_NULL => Ok(Arg::Null),
            TAG_BOOL => Ok(Arg::Bool(reader.u8()? != 0)),
            TAG_U64 => Ok(Arg::U64(reader.u64()?)),
            TAG_BYTES => {
                let len = reader.u32()? as usize;
                Ok(Arg::Bytes(reader.take(len)?.to_vec()))
            }
            TAG_STR => {
                let len = reader.u32()? as usize;
                let text = String::from_utf8(reader.take(len)?.to_vec())
                    .map_err(|_| ClientError::protocol("string argument is not UTF-8"))?;
                Ok(Arg::Str(text))
            }
            TAG_LIST => {
                let count = reader.u32()? as usize;
                // Every item takes at least its tag byte.
                if count > reader.remaining() {
                    return Err(ClientError::protocol(format!("list of {} items in {} bytes", count, reader.remaining())));
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(Arg::decode(reader)?);
                }
                Ok(Arg::List(items))
            }
            tag => Err(ClientError::protocol(format!("unknown argument tag {}", tag))),
        }
    }

    pub fn as_u64(&self) -> ClientResult<u64> {
        match self {
            Arg::U64(value) => Ok(*value),
            other => Err(ClientError::protocol(format!("expected integer, got {:?}", other))),
        }
    }

    pub fn as_str(&self) -> ClientResult<&str> {
        match self {
            Arg::Str(text) => Ok(text),
            other => Err(ClientError::protocol(format!("expected string, got {:?}", other))),
        }
    }

    pub fn as_list(&self) -> ClientResult<&[Arg]> {
        match self {
            Arg::List(items) => Ok(items),
            other => Err(ClientError::protocol(format!("expected list, got {:?}", other))),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msgid: u64,
    pub flags: u8,
    pub method: String,
    pub args: Vec<Arg>,
}

impl Message {
    /// Server-initiated message that expects no reply.
    pub fn notification(method: &str, args: Vec<Arg>) -> Self {
        Self { msgid: 0, flags: FLAG_ASYNC, method: method.to_string(), args }
    }

    pub fn is_async(&self) -> bool {
        self.flags & FLAG_ASYNC != 0
    }

    /// Encode as a complete frame, length prefix included.
    pub fn encode(&self) -> ClientResult<Vec<u8>> {
        let method_len = u16::try_from(self.method.len())
            .map_err(|_| ClientError::protocol(format!("method name of {} bytes", self.method.len())))?;
        let mut body = Vec::with_capacity(FRAME_FIXED + self.method.len());
        body.extend_from_slice(&self.msgid.to_be_bytes());
        body.push(self.flags);
        body.extend_from_slice(&method_len.to_be_bytes());
        body.extend_from_slice(self.method.as_bytes());
        body.extend_from_slice(&(self.args.len() as u32).to_be_bytes());
        for arg in &self.args {
            arg.encode_into(&mut body);
        }

        let len = u32::try_from(body.len()).ok().filter(|len| *len <= MAX_FRAME).ok_or_else(|| {
            ClientError::protocol(format!("frame of {} bytes exceeds {}", body.len(), MAX_FRAME))
        })?;
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a frame body (the bytes after the length prefix).
    pub fn decode(body: &[u8]) -> ClientResult<Self> {
        let mut reader = Reader::new(body);
        let msgid = reader.u64()?;
        let flags = reader.u8()?;
        let method_len = reader.u16()? as usize;
        let method = String::from_utf8(reader.take(method_len)?.to_vec())
            .map_err(|_| ClientError::protocol("method name is not UTF-8"))?;
        let nargs = reader.u32()? as usize;
        if nargs > reader.remaining() {
            return Err(ClientError::protocol(format!("{} arguments in {} bytes", nargs, reader.remaining())));
        }
        let mut args = Vec::with_capacity(nargs);
        for _ in 0..nargs {
            args.push(Arg::decode(&mut reader)?);
        }
        if reader.remaining() != 0 {
            return Err(ClientError::protocol(format!("{} trailing bytes after arguments", reader.remaining())));
        }
        Ok(Self { msgid, flags, method, args })
    }
}

/// Reassembles frames from a byte stream delivered in arbitrary chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: VecDeque<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend(bytes);
    }

    /// Bytes received but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next complete message, or `None` until more bytes arrive.
    pub fn next_message(&mut self) -> ClientResult<Option<Message>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let mut prefix = [0u8; 4];
        for (i, byte) in self.buf.iter().take(4).enumerate() {
            prefix[i] = *byte;
        }
        let len = u32::from_be_bytes(prefix);
        if len > MAX_FRAME {
            return Err(ClientError::protocol(format!("frame length {} exceeds {}", len, MAX_FRAME)));
        }
        if (len as usize) < FRAME_FIXED {
            return Err(ClientError::protocol(format!("frame length {} below minimum {}", len, FRAME_FIXED)));
        }
        if self.buf.len() < 4 + len as usize {
            return Ok(None);
        }
        self.buf.drain(..4);
        let body: Vec<u8> = self.buf.drain(..len as usize).collect();
        Message::decode(&body).map(Some)
    }
}

/// Messages the server pushes to its clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// `oids` changed in committed transaction `tid`
    InvalidateTransaction { tid: Tid, oids: Vec<Oid> },
    /// Server identity and state, sent when a connection opens
    Info { name: String, last_tid: Tid, size: u64 },
}

impl Notification {
    pub fn to_message(&self) -> Message {
        match self {
            Notification::InvalidateTransaction { tid, oids } => Message::notification(
                METHOD_INVALIDATE_TRANSACTION,
                vec![Arg::U64(tid.0), oid_list(oids)],
            ),
            Notification::Info { name, last_tid, size } => Message::notification(
                METHOD_INFO,
                vec![Arg::Str(name.clone()), Arg::U64(last_tid.0), Arg::U64(*size)],
            ),
        }
    }

    pub fn from_message(message: &Message) -> ClientResult<Self> {
        if !message.is_async() || message.msgid != 0 {
            return Err(ClientError::protocol(format!("{} is not a notification", message.method)));
        }
        let args = &message.args;
        match (message.method.as_str(), args.len()) {
            (METHOD_INVALIDATE_TRANSACTION, 2) => Ok(Notification::InvalidateTransaction {
                tid: Tid(args[0].as_u64()?),
                oids: parse_oids(&args[1])?,
            }),
            (METHOD_INFO, 3) => Ok(Notification::Info {
                name: args[0].as_str()?.to_string(),
                last_tid: Tid(args[1].as_u64()?),
                size: args[2].as_u64()?,
            }),
            (method, n) => Err(ClientError::protocol(format!("unexpected notification {} with {} arguments", method, n))),
        }
    }

    pub fn encode(&self) -> ClientResult<Vec<u8>> {
        self.to_message().encode()
    }
}

fn oid_list(oids: &[Oid]) -> Arg {
    Arg::List(oids.iter().map(|oid| Arg::U64(oid.0)).collect())
}

fn parse_oids(arg: &Arg) -> ClientResult<Vec<Oid>> {
    arg.as_list()?.iter().map(|item| item.as_u64().map(Oid)).collect()
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> ClientResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(ClientError::protocol(format!("need {} bytes at {}, have {}", n, self.pos, self.remaining())));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> ClientResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> ClientResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> ClientResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> ClientResult<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(bytes))
    }
}
