//! CoAP (RFC 7252) client for the line follower's controller
//!
//! Message layout:
//! - Header: [Ver|T|TKL][Code][Message ID (BE)]
//! - Token: 0-8 bytes
//! - Options: [Delta|Length][ext delta][ext length][value], sorted by number
//! - Payload: 0xFF marker followed by at least one byte
//!
//! Requests are sent confirmable and retransmitted with exponential backoff
//! until acknowledged or the caller's timeout elapses. Both piggybacked and
//! separate responses are accepted; separate confirmable responses are
//! acknowledged with an empty ACK.

use crate::services::device::{DeviceClient, DeviceError};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, warn};

// Protocol constants
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4;
const MAX_TOKEN_LEN: usize = 8;
const PAYLOAD_MARKER: u8 = 0xFF;
/// Recommended upper bound for a datagram without path MTU knowledge
pub const MAX_MESSAGE_SIZE: usize = 1152;

pub const OPTION_URI_PATH: u16 = 11;

// Codes (class << 5 | detail)
pub const CODE_EMPTY: u8 = 0x00;
pub const CODE_GET: u8 = 0x01;
pub const CODE_PUT: u8 = 0x03;
pub const CODE_CHANGED: u8 = 0x44;
pub const CODE_CONTENT: u8 = 0x45;
pub const CODE_BAD_REQUEST: u8 = 0x80;
pub const CODE_NOT_FOUND: u8 = 0x84;

// Transmission parameters (RFC 7252 section 4.8)
const ACK_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_RETRANSMIT: u32 = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoapError {
    #[error("message shorter than header")]
    TooShort,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid token length {0}")]
    InvalidTokenLength(usize),
    #[error("reserved option nibble")]
    ReservedOptionNibble,
    #[error("option value too long ({0} bytes)")]
    OptionTooLong(usize),
    #[error("message truncated")]
    Truncated,
    #[error("payload marker without payload")]
    EmptyPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

/// Dotted form of a code, e.g. `2.04`
pub fn code_string(code: u8) -> String {
    format!("{}.{:02}", code >> 5, code & 0x1F)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub mtype: MessageType,
    pub code: u8,
    pub message_id: u16,
    pub token: Vec<u8>,
    /// (number, value) pairs; encoded in ascending number order
    pub options: Vec<(u16, Vec<u8>)>,
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a request for a slash-separated resource path
    pub fn request(
        mtype: MessageType,
        code: u8,
        message_id: u16,
        token: &[u8],
        path: &str,
        payload: &[u8],
    ) -> Self {
        let options = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| (OPTION_URI_PATH, segment.as_bytes().to_vec()))
            .collect();
        Self {
            mtype,
            code,
            message_id,
            token: token.to_vec(),
            options,
            payload: payload.to_vec(),
        }
    }

    /// Piggybacked response to `request`
    pub fn ack_response(request: &Message, code: u8, payload: &[u8]) -> Self {
        Self {
            mtype: MessageType::Acknowledgement,
            code,
            message_id: request.message_id,
            token: request.token.clone(),
            options: Vec::new(),
            payload: payload.to_vec(),
        }
    }

    /// Empty message (ACK or RST) for `message_id`
    pub fn empty(mtype: MessageType, message_id: u16) -> Self {
        Self {
            mtype,
            code: CODE_EMPTY,
            message_id,
            token: Vec::new(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Uri-Path options joined with `/`
    pub fn uri_path(&self) -> String {
        self.options
            .iter()
            .filter(|(number, _)| *number == OPTION_URI_PATH)
            .map(|(_, value)| String::from_utf8_lossy(value).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn is_success(&self) -> bool {
        self.code >> 5 == 2
    }

    pub fn encode(&self) -> Result<Bytes, CoapError> {
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(CoapError::InvalidTokenLength(self.token.len()));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.token.len() + 32 + self.payload.len());
        buf.put_u8((VERSION << 6) | (self.mtype.bits() << 4) | self.token.len() as u8);
        buf.put_u8(self.code);
        buf.put_u16(self.message_id);
        buf.put_slice(&self.token);

        let mut options: Vec<&(u16, Vec<u8>)> = self.options.iter().collect();
        options.sort_by_key(|(number, _)| *number);

        let mut previous = 0u16;
        for (number, value) in options {
            let delta = number - previous;
            previous = *number;
            if value.len() > 65804 {
                return Err(CoapError::OptionTooLong(value.len()));
            }
            let (delta_nibble, delta_ext) = split_option_field(delta as usize);
            let (len_nibble, len_ext) = split_option_field(value.len());
            buf.put_u8((delta_nibble << 4) | len_nibble);
            put_option_ext(&mut buf, delta_ext);
            put_option_ext(&mut buf, len_ext);
            buf.put_slice(value);
        }

        if !self.payload.is_empty() {
            buf.put_u8(PAYLOAD_MARKER);
            buf.put_slice(&self.payload);
        }

        Ok(buf.freeze())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CoapError> {
        if buf.len() < HEADER_LEN {
            return Err(CoapError::TooShort);
        }

        let version = buf[0] >> 6;
        if version != VERSION {
            return Err(CoapError::UnsupportedVersion(version));
        }
        let mtype = MessageType::from_bits(buf[0] >> 4);
        let token_len = (buf[0] & 0x0F) as usize;
        if token_len > MAX_TOKEN_LEN {
            return Err(CoapError::InvalidTokenLength(token_len));
        }
        let code = buf[1];
        let message_id = u16::from_be_bytes([buf[2], buf[3]]);

        let mut pos = HEADER_LEN;
        let token = buf.get(pos..pos + token_len).ok_or(CoapError::Truncated)?.to_vec();
        pos += token_len;

        let mut options = Vec::new();
        let mut number = 0u16;
        let mut payload = Vec::new();

        while pos < buf.len() {
            let byte = buf[pos];
            pos += 1;
            if byte == PAYLOAD_MARKER {
                if pos == buf.len() {
                    return Err(CoapError::EmptyPayload);
                }
                payload = buf[pos..].to_vec();
                break;
            }

            let delta = read_option_ext(buf, &mut pos, byte >> 4)?;
            let len = read_option_ext(buf, &mut pos, byte & 0x0F)?;
            number = number
                .checked_add(u16::try_from(delta).map_err(|_| CoapError::Truncated)?)
                .ok_or(CoapError::Truncated)?;
            let value = buf.get(pos..pos + len).ok_or(CoapError::Truncated)?.to_vec();
            pos += len;
            options.push((number, value));
        }

        Ok(Self { mtype, code, message_id, token, options, payload })
    }
}

/// Split an option delta or length into its 4-bit nibble and extension
#[inline]
fn split_option_field(value: usize) -> (u8, Option<OptionExt>) {
    match value {
        0..=12 => (value as u8, None),
        13..=268 => (13, Some(OptionExt::One((value - 13) as u8))),
        _ => (14, Some(OptionExt::Two((value - 269) as u16))),
    }
}

#[derive(Debug, Clone, Copy)]
enum OptionExt {
    One(u8),
    Two(u16),
}

fn put_option_ext(buf: &mut BytesMut, ext: Option<OptionExt>) {
    match ext {
        Some(OptionExt::One(b)) => buf.put_u8(b),
        Some(OptionExt::Two(w)) => buf.put_u16(w),
        None => {}
    }
}

fn read_option_ext(buf: &[u8], pos: &mut usize, nibble: u8) -> Result<usize, CoapError> {
    match nibble {
        0..=12 => Ok(nibble as usize),
        13 => {
            let b = *buf.get(*pos).ok_or(CoapError::Truncated)?;
            *pos += 1;
            Ok(b as usize + 13)
        }
        14 => {
            let bytes = buf.get(*pos..*pos + 2).ok_or(CoapError::Truncated)?;
            *pos += 2;
            Ok(u16::from_be_bytes([bytes[0], bytes[1]]) as usize + 269)
        }
        _ => Err(CoapError::ReservedOptionNibble),
    }
}

/// What a received datagram means for an outstanding request
#[derive(Debug, PartialEq, Eq)]
enum Exchange {
    /// Final response for our token
    Response(Message),
    /// Empty ACK: the response will follow separately
    Acknowledged,
    /// Peer reset our request
    Reset,
    /// Not related to this request
    Unrelated,
}

fn classify(msg: Message, message_id: u16, token: &[u8]) -> Exchange {
    match msg.mtype {
        MessageType::Reset if msg.message_id == message_id => Exchange::Reset,
        MessageType::Acknowledgement if msg.message_id == message_id => {
            if msg.code == CODE_EMPTY {
                Exchange::Acknowledged
            } else if msg.token == token {
                Exchange::Response(msg)
            } else {
                Exchange::Unrelated
            }
        }
        MessageType::Confirmable | MessageType::NonConfirmable
            if msg.code != CODE_EMPTY && msg.token == token =>
        {
            Exchange::Response(msg)
        }
        _ => Exchange::Unrelated,
    }
}

/// Seed for message ids and tokens so restarts do not reuse recent values
fn clock_seed() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.subsec_nanos()).unwrap_or(0)
}

/// Confirmable-request CoAP client bound to one device address
pub struct CoapDeviceClient {
    addr: String,
    next_message_id: AtomicU16,
    next_token: AtomicU32,
}

impl CoapDeviceClient {
    /// `addr` is `host:port`, resolved on every request
    pub fn new(addr: impl Into<String>) -> Self {
        let seed = clock_seed();
        Self {
            addr: addr.into(),
            next_message_id: AtomicU16::new(seed as u16),
            next_token: AtomicU32::new(seed.rotate_left(16)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Read a resource (the controller exposes `status`)
    pub async fn get(&self, path: &str, timeout: Duration) -> Result<Bytes, DeviceError> {
        self.request(CODE_GET, path, &[], timeout).await
    }

    /// Issue one confirmable request and wait for its response
    pub async fn request(
        &self,
        code: u8,
        path: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Bytes, DeviceError> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed).to_be_bytes();
        let request =
            Message::request(MessageType::Confirmable, code, message_id, &token, path, payload);
        let frame = request.encode().map_err(|e| DeviceError::Protocol(e.to_string()))?;

        match tokio::time::timeout(timeout, self.exchange(&frame, message_id, &token, path)).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout(timeout)),
        }
    }

    async fn exchange(
        &self,
        frame: &[u8],
        message_id: u16,
        token: &[u8],
        path: &str,
    ) -> Result<Bytes, DeviceError> {
        let started = Instant::now();
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(self.addr.as_str()).await?;
        socket.send(frame).await?;
        debug!(addr = %self.addr, path = %path, message_id = %message_id, "coap_request_sent");

        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let mut ack_timeout = ACK_TIMEOUT;
        let mut retransmits = 0u32;
        let mut acknowledged = false;

        loop {
            let received = if acknowledged {
                socket.recv(&mut buf).await
            } else {
                match tokio::time::timeout(ack_timeout, socket.recv(&mut buf)).await {
                    Ok(received) => received,
                    Err(_) => {
                        if retransmits >= MAX_RETRANSMIT {
                            return Err(DeviceError::Timeout(started.elapsed()));
                        }
                        retransmits += 1;
                        ack_timeout *= 2;
                        socket.send(frame).await?;
                        debug!(path = %path, attempt = %retransmits, "coap_retransmit");
                        continue;
                    }
                }
            };
            let len = received?;

            let msg = match Message::decode(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, bytes = %hex::encode(&buf[..len]), "coap_decode_error");
                    continue;
                }
            };

            match classify(msg, message_id, token) {
                Exchange::Response(response) => {
                    if response.mtype == MessageType::Confirmable {
                        let ack = Message::empty(MessageType::Acknowledgement, response.message_id);
                        if let Ok(ack) = ack.encode() {
                            socket.send(&ack).await?;
                        }
                    }
                    return into_result(response);
                }
                Exchange::Acknowledged => {
                    debug!(path = %path, "coap_separate_response_pending");
                    acknowledged = true;
                }
                Exchange::Reset => {
                    return Err(DeviceError::Protocol("request reset by device".to_string()));
                }
                Exchange::Unrelated => {
                    debug!(path = %path, "coap_unrelated_message");
                }
            }
        }
    }
}

fn into_result(response: Message) -> Result<Bytes, DeviceError> {
    if response.is_success() {
        Ok(Bytes::from(response.payload))
    } else {
        let body = String::from_utf8_lossy(&response.payload);
        Err(DeviceError::Rejected(format!("{} {}", code_string(response.code), body.trim())))
    }
}

#[async_trait]
impl DeviceClient for CoapDeviceClient {
    async fn put(
        &self,
        path: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Bytes, DeviceError> {
        self.request(CODE_PUT, path, payload, timeout).await
    }
}
