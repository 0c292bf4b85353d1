//! Binary codec: 1-byte type tag + 4-byte reply port, then type-specific fields.
//!
//! Integers are fixed-width big-endian. Strings are a 4-byte length (`-1` for null) followed by
//! UTF-8 bytes. Payloads are a 4-byte buffer count, one 4-byte length per buffer, then the buffers
//! themselves, which stay separate `Bytes` in the encoded [`Frame`] so they are never copied.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::key::Key;
use crate::protocol::{
    Envelope, Fault, Message, MessageKind, Modes, Query, RejectCode, TraceCode,
};

pub const HEADER_LEN: usize = 1 + 4;
/// Encoded `Key`: id + IPv4 + port + boot time.
pub const KEY_LEN: usize = 8 + 4 + 4 + 8;
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024; // 16 MiB

/// An encoded message as a list of buffers: the fixed-field head, then any payload buffers.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    buffers: Vec<Bytes>,
}

impl Frame {
    pub fn buffers(&self) -> &[Bytes] {
        &self.buffers
    }

    pub fn len(&self) -> usize {
        self.buffers.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten into one contiguous buffer.
    pub fn into_bytes(self) -> Bytes {
        flatten(self.buffers)
    }
}

/// Join scatter/gather buffers. Free when there is at most one buffer.
pub fn flatten(mut buffers: Vec<Bytes>) -> Bytes {
    if buffers.len() <= 1 {
        return buffers.pop().unwrap_or_default();
    }
    let mut out = BytesMut::with_capacity(buffers.iter().map(Bytes::len).sum());
    for b in &buffers {
        out.extend_from_slice(b);
    }
    out.freeze()
}

/// Error encoding a message.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),
}

/// Error decoding a message. Fatal for that message only.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated message")]
    Truncated,
    #[error("unknown message type tag {0}")]
    UnknownTag(u8),
    #[error("reply port out of range: {0}")]
    InvalidPort(i32),
    #[error("invalid length {0}")]
    InvalidLength(i32),
    #[error("unknown reject code {0}")]
    UnknownRejectCode(u8),
    #[error("unknown trace code {0}")]
    UnknownTraceCode(i32),
    #[error("invalid node id flag {0}")]
    InvalidNodeIdFlag(u8),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),
}

/// Encode `msg` with the port the sender listens on for replies.
pub fn encode(msg: &Message, reply_port: u16) -> Result<Frame, EncodeError> {
    let mut head = BytesMut::with_capacity(64);
    head.put_u8(msg.kind().tag());
    head.put_i32(i32::from(reply_port));
    let mut tail: &[Bytes] = &[];
    match msg {
        Message::Accept { instance } => put_key(&mut head, instance),
        Message::Reject { instance, code } => {
            put_key(&mut head, instance);
            head.put_u8(code.to_byte());
        }
        Message::Fault(Fault { seed, message }) => {
            put_key(&mut head, seed);
            put_string(&mut head, message.as_deref())?;
        }
        Message::Ping { client } => put_key(&mut head, client),
        Message::Pong { key, query_key_ids } => {
            put_key(&mut head, key);
            head.put_i32(len_i32(query_key_ids.len())?);
            for id in query_key_ids {
                head.put_i64(*id);
            }
        }
        Message::Query(q) => {
            head.put_i32(q.query_type);
            head.put_i32(q.generation);
            put_key(&mut head, &q.seed);
            put_key(&mut head, &q.instance);
            head.put_u8(q.modes.bits());
            match q.node_id {
                Some(id) => {
                    head.put_u8(1);
                    head.put_i64(id);
                }
                None => head.put_u8(0),
            }
            put_buffer_lengths(&mut head, &q.payload)?;
            tail = &q.payload;
        }
        Message::Result { seed, data } => {
            put_key(&mut head, seed);
            put_buffer_lengths(&mut head, data)?;
            tail = data;
        }
        Message::Trace {
            seed,
            instance,
            code,
        } => {
            put_key(&mut head, seed);
            put_key(&mut head, instance);
            head.put_i32(code.ordinal());
        }
    }
    let mut buffers = Vec::with_capacity(1 + tail.len());
    buffers.push(head.freeze());
    buffers.extend(tail.iter().filter(|b| !b.is_empty()).cloned());
    let frame = Frame { buffers };
    if frame.len() > MAX_FRAME_LEN {
        return Err(EncodeError::TooLarge(frame.len()));
    }
    Ok(frame)
}

/// Decode one complete message. `remote_ip` is the peer address the bytes arrived from; the
/// sender's reply address is that IP with the reply port carried in the header.
pub fn decode(mut buf: Bytes, remote_ip: Ipv4Addr) -> Result<Envelope, DecodeError> {
    if buf.len() > MAX_FRAME_LEN {
        return Err(DecodeError::TooLarge(buf.len()));
    }
    need(&buf, HEADER_LEN)?;
    let tag = buf.get_u8();
    let kind = MessageKind::from_tag(tag).ok_or(DecodeError::UnknownTag(tag))?;
    let port = buf.get_i32();
    let port = u16::try_from(port).map_err(|_| DecodeError::InvalidPort(port))?;

    let message = match kind {
        MessageKind::Accept => Message::Accept {
            instance: get_key(&mut buf)?,
        },
        MessageKind::Reject => {
            let instance = get_key(&mut buf)?;
            need(&buf, 1)?;
            let b = buf.get_u8();
            let code = RejectCode::from_byte(b).ok_or(DecodeError::UnknownRejectCode(b))?;
            Message::Reject { instance, code }
        }
        MessageKind::Fault => {
            let seed = get_key(&mut buf)?;
            let message = get_string(&mut buf)?;
            Message::Fault(Fault { seed, message })
        }
        MessageKind::Ping => Message::Ping {
            client: get_key(&mut buf)?,
        },
        MessageKind::Pong => {
            let key = get_key(&mut buf)?;
            let count = get_len(&mut buf)?;
            need(&buf, count.saturating_mul(8))?;
            let query_key_ids = (0..count).map(|_| buf.get_i64()).collect();
            Message::Pong { key, query_key_ids }
        }
        MessageKind::Query => {
            need(&buf, 8)?;
            let query_type = buf.get_i32();
            let generation = buf.get_i32();
            let seed = get_key(&mut buf)?;
            let instance = get_key(&mut buf)?;
            need(&buf, 2)?;
            let modes = Modes::from_bits(buf.get_u8());
            let node_id = match buf.get_u8() {
                0 => None,
                1 => {
                    need(&buf, 8)?;
                    Some(buf.get_i64())
                }
                other => return Err(DecodeError::InvalidNodeIdFlag(other)),
            };
            let payload = get_buffers(&mut buf)?;
            Message::Query(Query {
                seed,
                instance,
                generation,
                query_type,
                payload,
                modes,
                node_id,
            })
        }
        MessageKind::Result => {
            let seed = get_key(&mut buf)?;
            let data = get_buffers(&mut buf)?;
            Message::Result { seed, data }
        }
        MessageKind::Trace => {
            let seed = get_key(&mut buf)?;
            let instance = get_key(&mut buf)?;
            need(&buf, 4)?;
            let v = buf.get_i32();
            let code = TraceCode::from_ordinal(v).ok_or(DecodeError::UnknownTraceCode(v))?;
            Message::Trace {
                seed,
                instance,
                code,
            }
        }
    };
    if buf.has_remaining() {
        return Err(DecodeError::TrailingBytes(buf.remaining()));
    }
    Ok(Envelope {
        sender: SocketAddrV4::new(remote_ip, port),
        message,
    })
}

fn need(buf: &Bytes, n: usize) -> Result<(), DecodeError> {
    if buf.remaining() < n {
        return Err(DecodeError::Truncated);
    }
    Ok(())
}

fn len_i32(n: usize) -> Result<i32, EncodeError> {
    i32::try_from(n).map_err(|_| EncodeError::TooLarge(n))
}

fn put_key(out: &mut BytesMut, key: &Key) {
    out.put_i64(key.id);
    out.put_slice(&key.host.ip().octets());
    out.put_i32(i32::from(key.host.port()));
    out.put_i64(key.boot_time);
}

fn get_key(buf: &mut Bytes) -> Result<Key, DecodeError> {
    need(buf, KEY_LEN)?;
    let id = buf.get_i64();
    let ip = Ipv4Addr::from(buf.get_u32());
    let port = buf.get_i32();
    let port = u16::try_from(port).map_err(|_| DecodeError::InvalidPort(port))?;
    let boot_time = buf.get_i64();
    Ok(Key::new(id, SocketAddrV4::new(ip, port), boot_time))
}

fn put_string(out: &mut BytesMut, s: Option<&str>) -> Result<(), EncodeError> {
    match s {
        None => out.put_i32(-1),
        Some(s) => {
            out.put_i32(len_i32(s.len())?);
            out.put_slice(s.as_bytes());
        }
    }
    Ok(())
}

fn get_string(buf: &mut Bytes) -> Result<Option<String>, DecodeError> {
    need(buf, 4)?;
    let len = buf.get_i32();
    if len == -1 {
        return Ok(None);
    }
    let len = usize::try_from(len).map_err(|_| DecodeError::InvalidLength(len))?;
    need(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map(Some)
        .map_err(|_| DecodeError::InvalidUtf8)
}

/// Non-negative collection length.
fn get_len(buf: &mut Bytes) -> Result<usize, DecodeError> {
    need(buf, 4)?;
    let len = buf.get_i32();
    usize::try_from(len).map_err(|_| DecodeError::InvalidLength(len))
}

fn put_buffer_lengths(out: &mut BytesMut, buffers: &[Bytes]) -> Result<(), EncodeError> {
    out.put_i32(len_i32(buffers.len())?);
    for b in buffers {
        out.put_i32(len_i32(b.len())?);
    }
    Ok(())
}

fn get_buffers(buf: &mut Bytes) -> Result<Vec<Bytes>, DecodeError> {
    let count = get_len(buf)?;
    need(buf, count.saturating_mul(4))?;
    let mut lens = Vec::with_capacity(count);
    for _ in 0..count {
        let len = buf.get_i32();
        lens.push(usize::try_from(len).map_err(|_| DecodeError::InvalidLength(len))?);
    }
    let mut out = Vec::with_capacity(count);
    for len in lens {
        need(buf, len)?;
        out.push(buf.split_to(len));
    }
    Ok(out)
}
