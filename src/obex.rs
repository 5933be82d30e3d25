//! OBEX packet framing for the vendor dialect spoken by the
//! dictionaries.
//!
//! The dialect is a narrow subset of OBEX: five opcodes, four response
//! codes, plain headers plus two vendor tags, and command selectors
//! smuggled through NAME headers as UTF-16BE pseudo-names of the form
//! `_Cap`, `_List`, and so on.  Requests and responses both use the
//! FINAL bit for continuation; bodies may span several packets and are
//! reassembled here into one logical body.

use log::trace;

use crate::error::{Error, Result};
use crate::transport::Transport;

pub const OBEX_FINAL: u8 = 0x80;

// request opcodes; the FINAL bit is applied during framing
pub const CMD_CONNECT: u8 = 0x80;
pub const CMD_DISCONNECT: u8 = 0x81;
pub const CMD_PUT: u8 = 0x02;
pub const CMD_GET: u8 = 0x03;
pub const CMD_SETPATH: u8 = 0x85;

// response codes, FINAL bit stripped
pub const RSP_CONTINUE: u8 = 0x10;
pub const RSP_SUCCESS: u8 = 0x20;
pub const RSP_FORBIDDEN: u8 = 0x43;
pub const RSP_NOT_FOUND: u8 = 0x44;
pub const RSP_INTERNAL_SERVER_ERROR: u8 = 0x50;

// header tags; the high two bits select the wire class
pub const HDR_NAME: u8 = 0x01;
pub const HDR_LENGTH: u8 = 0xc3;
pub const HDR_BODY: u8 = 0x48;
pub const HDR_BODY_END: u8 = 0x49;
// vendor tags, user-defined byte-sequence space
pub const HDR_CRYPTKEY: u8 = 0x70;
pub const HDR_AUTHINFO: u8 = 0x71;

/// Largest packet either side may send; advertised in CONNECT.
pub const MAX_PACKET: usize = 0x8000;

// cap on a reassembled response body
const MAX_BODY: usize = 64 << 20;

pub const NAME_MODEL: &[u8] = &[0, b'_', 0, b'M', 0, b'o', 0, b'd', 0, b'e', 0, b'l', 0, 0];
pub const NAME_LIST: &[u8] = &[0, b'_', 0, b'L', 0, b'i', 0, b's', 0, b't', 0, 0];
pub const NAME_REMOVE: &[u8] =
    &[0, b'_', 0, b'R', 0, b'e', 0, b'm', 0, b'o', 0, b'v', 0, b'e', 0, 0];
pub const NAME_CAP: &[u8] = &[0, b'_', 0, b'C', 0, b'a', 0, b'p', 0, 0];
pub const NAME_SDFORMAT: &[u8] =
    &[0, b'_', 0, b'S', 0, b'd', 0, b'F', 0, b'o', 0, b'r', 0, b'm', 0, b'a', 0, b't', 0, 0];
pub const NAME_USERID: &[u8] =
    &[0, b'_', 0, b'U', 0, b's', 0, b'e', 0, b'r', 0, b'I', 0, b'd', 0, 0];
pub const NAME_UNLOCK: &[u8] =
    &[0, b'_', 0, b'U', 0, b'n', 0, b'l', 0, b'o', 0, b'c', 0, b'k', 0, 0];
pub const NAME_LOCK: &[u8] = &[0, b'_', 0, b'L', 0, b'o', 0, b'c', 0, b'k', 0, 0];
pub const NAME_CNAME: &[u8] = &[0, b'_', 0, b'C', 0, b'N', 0, b'a', 0, b'm', 0, b'e', 0, 0];
pub const NAME_CRYPTKEY: &[u8] =
    &[0, b'_', 0, b'C', 0, b'r', 0, b'y', 0, b'p', 0, b't', 0, b'K', 0, b'e', 0, b'y', 0, 0];
pub const NAME_AUTHCHALLENGE: &[u8] = &[
    0, b'_', 0, b'A', 0, b'u', 0, b't', 0, b'h', 0, b'C', 0, b'h', 0, b'a', 0, b'l', 0, b'l',
    0, b'e', 0, b'n', 0, b'g', 0, b'e', 0, 0,
];
pub const NAME_AUTHINFO: &[u8] =
    &[0, b'_', 0, b'A', 0, b'u', 0, b't', 0, b'h', 0, b'I', 0, b'n', 0, b'f', 0, b'o', 0, 0];

/// A NAME payload selects a command iff it byte-matches a table entry
/// at one of the fixed lengths.
pub fn is_command(name: &[u8]) -> bool {
    match name.len() {
        10 => name == NAME_CAP,
        12 => name == NAME_LIST || name == NAME_LOCK,
        14 => name == NAME_MODEL || name == NAME_CNAME,
        16 => name == NAME_REMOVE || name == NAME_USERID || name == NAME_UNLOCK,
        20 => name == NAME_SDFORMAT || name == NAME_CRYPTKEY || name == NAME_AUTHINFO,
        30 => name == NAME_AUTHCHALLENGE,
        _ => false,
    }
}

/// Value carried by one OBEX header.
///
/// `Bytes` covers the unicode and byte-sequence classes (length-framed
/// on the wire); `U32` covers the bq4 class (implicit four bytes).
#[derive(Debug, Clone)]
pub enum HeaderValue {
    Bytes(Vec<u8>),
    U32(u32),
}

/// An outgoing request under construction.
#[derive(Debug, Clone)]
pub struct Request {
    opcode: u8,
    non_header: Vec<u8>,
    headers: Vec<(u8, HeaderValue)>,
}

impl Request {
    pub fn new(opcode: u8) -> Request {
        Request {
            opcode,
            non_header: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    /// Bytes placed between the packet header and the first header.
    /// SETPATH carries its create-if-missing flags here and CONNECT its
    /// version, locale, and max packet size.
    pub fn set_non_header(&mut self, data: &[u8]) {
        self.non_header = data.to_vec();
    }

    pub fn add_header(&mut self, tag: u8, value: HeaderValue) {
        self.headers.push((tag, value));
    }

    pub fn add_bytes(&mut self, tag: u8, data: impl Into<Vec<u8>>) {
        self.add_header(tag, HeaderValue::Bytes(data.into()));
    }

    pub fn add_u32(&mut self, tag: u8, value: u32) {
        self.add_header(tag, HeaderValue::U32(value));
    }

    pub(crate) fn find_bytes(&self, tag: u8) -> Option<&[u8]> {
        self.headers.iter().find(|(t, _)| *t == tag).and_then(|(_, v)| match v {
            HeaderValue::Bytes(b) => Some(b.as_slice()),
            HeaderValue::U32(_) => None,
        })
    }

    pub(crate) fn find_u32(&self, tag: u8) -> Option<u32> {
        self.headers.iter().find(|(t, _)| *t == tag).and_then(|(_, v)| match v {
            HeaderValue::U32(v) => Some(*v),
            HeaderValue::Bytes(_) => None,
        })
    }

    /// Serialize into wire frames no larger than `max`.  A body that
    /// does not fit is split: intermediate frames carry BODY with the
    /// FINAL bit clear, the last frame carries BODY_END.
    fn frames(&self, max: usize) -> Result<Vec<Frame>> {
        let mut head = Vec::new();
        let mut body = Vec::new();
        let mut has_body = false;
        for (tag, value) in &self.headers {
            match (*tag, value) {
                (HDR_BODY, HeaderValue::Bytes(b)) => {
                    has_body = true;
                    body.extend_from_slice(b);
                }
                (_, value) => encode_header(&mut head, *tag, value)?,
            }
        }

        let overhead = 3 + self.non_header.len();
        let body_overhead = 3; // tag plus framed length
        let mut frames = Vec::new();

        let single = overhead + head.len() + if has_body { body_overhead + body.len() } else { 0 };
        if single <= max {
            let mut bytes = packet_start(self.opcode | OBEX_FINAL, &self.non_header);
            bytes.extend_from_slice(&head);
            if has_body {
                encode_chunk(&mut bytes, HDR_BODY, &body)?;
            }
            patch_len(&mut bytes);
            let body_bytes = body.len();
            frames.push(Frame { bytes, body_bytes });
            return Ok(frames);
        }
        if !has_body {
            return Err(Error::NoMem);
        }

        let mut remaining: &[u8] = &body;
        let mut first = true;
        loop {
            let head_len = if first { head.len() } else { 0 };
            let room = max
                .checked_sub(overhead + head_len + body_overhead)
                .filter(|r| *r > 0)
                .ok_or(Error::NoMem)?;
            let take = remaining.len().min(room);
            let last = take == remaining.len();
            let opcode = if last { self.opcode | OBEX_FINAL } else { self.opcode & !OBEX_FINAL };
            let non_header: &[u8] = if first { &self.non_header } else { &[] };
            let mut bytes = packet_start(opcode, non_header);
            if first {
                bytes.extend_from_slice(&head);
            }
            encode_chunk(&mut bytes, if last { HDR_BODY_END } else { HDR_BODY }, &remaining[..take])?;
            patch_len(&mut bytes);
            frames.push(Frame { bytes, body_bytes: take });
            remaining = &remaining[take..];
            first = false;
            if last {
                return Ok(frames);
            }
        }
    }
}

struct Frame {
    bytes: Vec<u8>,
    body_bytes: usize,
}

fn packet_start(opcode: u8, non_header: &[u8]) -> Vec<u8> {
    let mut bytes = vec![opcode, 0, 0];
    bytes.extend_from_slice(non_header);
    bytes
}

fn patch_len(bytes: &mut Vec<u8>) {
    let len = (bytes.len() as u16).to_be_bytes();
    bytes[1] = len[0];
    bytes[2] = len[1];
}

fn encode_header(out: &mut Vec<u8>, tag: u8, value: &HeaderValue) -> Result<()> {
    match value {
        HeaderValue::U32(v) => {
            out.push(tag);
            out.extend_from_slice(&v.to_be_bytes());
            Ok(())
        }
        HeaderValue::Bytes(data) => encode_chunk(out, tag, data),
    }
}

fn encode_chunk(out: &mut Vec<u8>, tag: u8, data: &[u8]) -> Result<()> {
    let framed = data.len() + 3;
    if framed > u16::MAX as usize {
        return Err(Error::NoMem);
    }
    out.push(tag);
    out.extend_from_slice(&(framed as u16).to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

/// A fully reassembled response.
#[derive(Debug)]
pub struct Response {
    code: u8,
    headers: Vec<(u8, Vec<u8>)>,
    body: Vec<u8>,
}

impl Response {
    /// Final response code with the FINAL bit stripped.
    pub fn code(&self) -> u8 {
        self.code & !OBEX_FINAL
    }

    /// Non-body headers in arrival order.
    pub fn headers(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.headers.iter().map(|(tag, value)| (*tag, value.as_slice()))
    }

    pub fn find(&self, tag: u8) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, value)| value.as_slice())
    }

    /// Value of the LENGTH header, if present.
    pub fn length(&self) -> Option<u32> {
        self.find(HDR_LENGTH)
            .filter(|value| value.len() == 4)
            .map(|value| u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
    }

    /// Concatenated BODY/BODY_END payload.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

/// Decode a header list, handing each `{tag, payload}` to `sink`.
pub fn parse_headers(data: &[u8], mut sink: impl FnMut(u8, &[u8])) -> Result<()> {
    let mut off = 0;
    while off < data.len() {
        let tag = data[off];
        match tag & 0xc0 {
            0x80 => {
                if off + 2 > data.len() {
                    return Err(Error::invalid_data("truncated header"));
                }
                sink(tag, &data[off + 1..off + 2]);
                off += 2;
            }
            0xc0 => {
                if off + 5 > data.len() {
                    return Err(Error::invalid_data("truncated header"));
                }
                sink(tag, &data[off + 1..off + 5]);
                off += 5;
            }
            _ => {
                if off + 3 > data.len() {
                    return Err(Error::invalid_data("truncated header"));
                }
                let framed = u16::from_be_bytes([data[off + 1], data[off + 2]]) as usize;
                if framed < 3 || off + framed > data.len() {
                    return Err(Error::invalid_data("bad header length"));
                }
                sink(tag, &data[off + 3..off + framed]);
                off += framed;
            }
        }
    }
    Ok(())
}

/// Live file-transfer context for progress reporting.  The framer hands
/// observers the decoded filename and byte counts only, never its
/// packet buffers.
pub(crate) struct TransferObserver<'a> {
    pub name: String,
    pub total: u32,
    pub notify: &'a mut dyn FnMut(&str, u32, u32),
}

/// Transmit a request and reassemble the full response, following
/// continuation in both directions.
pub(crate) fn exchange<T: Transport>(
    transport: &mut T,
    req: &Request,
    mut observer: Option<&mut TransferObserver<'_>>,
) -> Result<Response> {
    let frames = req.frames(MAX_PACKET)?;
    let rsp_skip = if req.opcode() == CMD_CONNECT { 4 } else { 0 };
    let is_put = req.opcode() == CMD_PUT;
    let is_get = req.opcode() == CMD_GET;
    let mut sent = 0u32;
    let last = frames.len() - 1;
    let mut response = Response { code: 0, headers: Vec::new(), body: Vec::new() };

    for (i, frame) in frames.iter().enumerate() {
        trace!("tx {:#04x}, {} bytes", frame.bytes[0], frame.bytes.len());
        transport.write(&frame.bytes)?;
        if is_put && frame.body_bytes > 0 {
            sent += frame.body_bytes as u32;
            if let Some(obs) = observer.as_mut() {
                (obs.notify)(&obs.name, sent, obs.total);
            }
        }
        let packet = read_packet(transport)?;
        trace!("rx {:#04x}, {} bytes", packet.code, packet.data.len());
        response.code = packet.code;
        if i < last {
            if packet.code & !OBEX_FINAL != RSP_CONTINUE {
                // device aborted the transfer mid-stream
                absorb(&mut response, &packet.data, 0, is_get, &mut observer)?;
                return Ok(response);
            }
            continue;
        }
        absorb(&mut response, &packet.data, rsp_skip, is_get, &mut observer)?;
    }

    while response.code & OBEX_FINAL == 0 {
        transport.write(&[req.opcode() | OBEX_FINAL, 0x00, 0x03])?;
        let packet = read_packet(transport)?;
        trace!("rx {:#04x} (continuation), {} bytes", packet.code, packet.data.len());
        response.code = packet.code;
        absorb(&mut response, &packet.data, 0, is_get, &mut observer)?;
    }
    Ok(response)
}

fn absorb(
    response: &mut Response,
    data: &[u8],
    skip: usize,
    is_get: bool,
    observer: &mut Option<&mut TransferObserver<'_>>,
) -> Result<()> {
    let data = data.get(skip..).unwrap_or(&[]);
    let before = response.body.len();
    let mut overflow = false;
    {
        let Response { headers, body, .. } = response;
        parse_headers(data, |tag, value| match tag {
            HDR_BODY | HDR_BODY_END => {
                if body.len() + value.len() > MAX_BODY {
                    overflow = true;
                } else {
                    body.extend_from_slice(value);
                }
            }
            _ => headers.push((tag, value.to_vec())),
        })?;
    }
    if overflow {
        return Err(Error::NoMem);
    }
    if is_get && response.body.len() > before {
        if let Some(obs) = observer.as_mut() {
            let total = response.length().unwrap_or(obs.total);
            (obs.notify)(&obs.name, response.body.len() as u32, total);
        }
    }
    Ok(())
}

struct RawPacket {
    code: u8,
    data: Vec<u8>,
}

fn read_packet<T: Transport>(transport: &mut T) -> Result<RawPacket> {
    let mut buf = vec![0u8; MAX_PACKET];
    let mut have = 0usize;
    while have < 3 {
        let n = transport.read(&mut buf[have..])?;
        if n == 0 {
            return Err(Error::invalid_data("short response"));
        }
        have += n;
    }
    let advertised = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    if advertised < 3 {
        return Err(Error::invalid_data("runt packet"));
    }
    if advertised > MAX_PACKET {
        return Err(Error::NoMem);
    }
    while have < advertised {
        let n = transport.read(&mut buf[have..])?;
        if n == 0 {
            return Err(Error::invalid_data("truncated packet"));
        }
        have += n;
    }
    let code = buf[0];
    buf.truncate(advertised);
    buf.drain(..3);
    Ok(RawPacket { code, data: buf })
}
