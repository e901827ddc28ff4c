//! The message taxonomy and datagram framing.
//!
//! A [`Message`] is header + body; an [`Envelope`] annotates it with the
//! remote peer.  Bodies form a closed enum keyed by [`MessageTag`]; there is
//! no extension point.  On the wire a message is: magic · header(seqn,
//! timestamp) · tag(step, type) · body fields.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;
use crate::notif::NotifMessage;
use crate::username::Username;
use crate::wire::{WireDecode, WireEncode, WireError, WireReader, WireWriter};

/// First field of every datagram; anything else is out-of-protocol noise.
pub const WIRE_MAGIC: u64 = 0xFEED_FACE_0BAD_F00D;

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

/// Whether a message is a request or the response to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageStep {
    Req = 0,
    Resp = 1,
}

impl MessageStep {
    fn from_code(code: u16) -> Result<Self, WireError> {
        match code {
            0 => Ok(MessageStep::Req),
            1 => Ok(MessageStep::Resp),
            other => Err(WireError::InvalidValue(format!(
                "invalid message step code: {other}"
            ))),
        }
    }
}

/// The operation a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageType {
    Connect = 0,
    Disconnect = 1,
    Follow = 2,
    Notify = 3,
    Deliver = 4,
    Error = 5,
    Ping = 6,
    ServerConn = 7,
}

impl MessageType {
    fn from_code(code: u16) -> Result<Self, WireError> {
        match code {
            0 => Ok(MessageType::Connect),
            1 => Ok(MessageType::Disconnect),
            2 => Ok(MessageType::Follow),
            3 => Ok(MessageType::Notify),
            4 => Ok(MessageType::Deliver),
            5 => Ok(MessageType::Error),
            6 => Ok(MessageType::Ping),
            7 => Ok(MessageType::ServerConn),
            other => Err(WireError::InvalidValue(format!(
                "invalid message type code: {other}"
            ))),
        }
    }
}

/// (step, type) pair identifying a message's position in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageTag {
    pub step: MessageStep,
    pub r#type: MessageType,
}

impl MessageTag {
    pub const fn new(step: MessageStep, r#type: MessageType) -> Self {
        MessageTag { step, r#type }
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.step, self.r#type)
    }
}

impl WireEncode for MessageTag {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u16(self.step as u16);
        w.put_u16(self.r#type as u16);
    }
}

impl WireDecode for MessageTag {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let step = MessageStep::from_code(r.take_u16()?)?;
        let r#type = MessageType::from_code(r.take_u16()?)?;
        Ok(MessageTag::new(step, r#type))
    }
}

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// Failure codes carried by `Resp/Error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    InternalErr = 0,
    NoConnection = 1,
    OutdatedSeqn = 2,
    BadUsername = 3,
    TooManySessions = 4,
    UnknownUsername = 5,
    CannotFollowSelf = 6,
    Bad = 7,
    MissedResp = 8,
}

impl ErrorKind {
    fn from_code(code: u16) -> Result<Self, WireError> {
        match code {
            0 => Ok(ErrorKind::InternalErr),
            1 => Ok(ErrorKind::NoConnection),
            2 => Ok(ErrorKind::OutdatedSeqn),
            3 => Ok(ErrorKind::BadUsername),
            4 => Ok(ErrorKind::TooManySessions),
            5 => Ok(ErrorKind::UnknownUsername),
            6 => Ok(ErrorKind::CannotFollowSelf),
            7 => Ok(ErrorKind::Bad),
            8 => Ok(ErrorKind::MissedResp),
            other => Err(WireError::InvalidValue(format!(
                "invalid message error code: {other}"
            ))),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InternalErr => "INTERNAL_ERR",
            ErrorKind::NoConnection => "NO_CONNECTION",
            ErrorKind::OutdatedSeqn => "OUTDATED_SEQN",
            ErrorKind::BadUsername => "BAD_USERNAME",
            ErrorKind::TooManySessions => "TOO_MANY_SESSIONS",
            ErrorKind::UnknownUsername => "UNKNOWN_USERNAME",
            ErrorKind::CannotFollowSelf => "CANNOT_FOLLOW_SELF",
            ErrorKind::Bad => "BAD",
            ErrorKind::MissedResp => "MISSED_RESP",
        };
        f.write_str(name)
    }
}

impl WireEncode for ErrorKind {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u16(*self as u16);
    }
}

impl WireDecode for ErrorKind {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        ErrorKind::from_code(r.take_u16()?)
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Process-wide request sequence counter.  Fetch-add, never reset, so a
/// seqn is never reused within a process lifetime.
static SEQN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Wall-clock seconds since the Unix epoch.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Sequence number and send timestamp of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub seqn: u64,
    pub timestamp: i64,
}

impl MessageHeader {
    /// Header for a fresh request: next process-wide seqn, current time.
    pub fn for_request() -> Self {
        MessageHeader {
            seqn: SEQN_COUNTER.fetch_add(1, Ordering::Relaxed),
            timestamp: now_timestamp(),
        }
    }

    /// Header for the response to a request: same seqn, fresh timestamp.
    pub fn for_response(req_seqn: u64) -> Self {
        MessageHeader {
            seqn: req_seqn,
            timestamp: now_timestamp(),
        }
    }
}

impl WireEncode for MessageHeader {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u64(self.seqn);
        w.put_i64(self.timestamp);
    }
}

impl WireDecode for MessageHeader {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let seqn = r.take_u64()?;
        let timestamp = r.take_i64()?;
        Ok(MessageHeader { seqn, timestamp })
    }
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

/// Every payload the protocol knows.  The tag is implied by the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    ConnectReq { username: Username },
    ConnectResp,
    DisconnectReq,
    DisconnectResp,
    FollowReq { username: Username },
    FollowResp,
    NotifyReq { message: NotifMessage },
    NotifyResp,
    DeliverReq { sender: Username, message: NotifMessage, sent_at: i64 },
    DeliverResp,
    PingReq,
    PingResp,
    ServerConnReq,
    ServerConnResp,
    ErrorReq { kind: ErrorKind },
    ErrorResp { kind: ErrorKind },
}

impl MessageBody {
    pub fn tag(&self) -> MessageTag {
        use MessageStep::{Req, Resp};
        use MessageType as T;
        let (step, r#type) = match self {
            MessageBody::ConnectReq { .. } => (Req, T::Connect),
            MessageBody::ConnectResp => (Resp, T::Connect),
            MessageBody::DisconnectReq => (Req, T::Disconnect),
            MessageBody::DisconnectResp => (Resp, T::Disconnect),
            MessageBody::FollowReq { .. } => (Req, T::Follow),
            MessageBody::FollowResp => (Resp, T::Follow),
            MessageBody::NotifyReq { .. } => (Req, T::Notify),
            MessageBody::NotifyResp => (Resp, T::Notify),
            MessageBody::DeliverReq { .. } => (Req, T::Deliver),
            MessageBody::DeliverResp => (Resp, T::Deliver),
            MessageBody::PingReq => (Req, T::Ping),
            MessageBody::PingResp => (Resp, T::Ping),
            MessageBody::ServerConnReq => (Req, T::ServerConn),
            MessageBody::ServerConnResp => (Resp, T::ServerConn),
            MessageBody::ErrorReq { .. } => (Req, T::Error),
            MessageBody::ErrorResp { .. } => (Resp, T::Error),
        };
        MessageTag::new(step, r#type)
    }

    pub fn step(&self) -> MessageStep {
        self.tag().step
    }

    pub fn is_req(&self) -> bool {
        self.step() == MessageStep::Req
    }

    fn encode_fields(&self, w: &mut WireWriter) {
        match self {
            MessageBody::ConnectReq { username } | MessageBody::FollowReq { username } => {
                username.encode(w);
            }
            MessageBody::NotifyReq { message } => message.encode(w),
            MessageBody::DeliverReq { sender, message, sent_at } => {
                sender.encode(w);
                message.encode(w);
                w.put_i64(*sent_at);
            }
            MessageBody::ErrorReq { kind } | MessageBody::ErrorResp { kind } => kind.encode(w),
            MessageBody::ConnectResp
            | MessageBody::DisconnectReq
            | MessageBody::DisconnectResp
            | MessageBody::FollowResp
            | MessageBody::NotifyResp
            | MessageBody::DeliverResp
            | MessageBody::PingReq
            | MessageBody::PingResp
            | MessageBody::ServerConnReq
            | MessageBody::ServerConnResp => {}
        }
    }

    fn decode_fields(tag: MessageTag, r: &mut WireReader<'_>) -> Result<Self, WireError> {
        use MessageStep::{Req, Resp};
        use MessageType as T;
        let body = match (tag.step, tag.r#type) {
            (Req, T::Connect) => MessageBody::ConnectReq { username: Username::decode(r)? },
            (Resp, T::Connect) => MessageBody::ConnectResp,
            (Req, T::Disconnect) => MessageBody::DisconnectReq,
            (Resp, T::Disconnect) => MessageBody::DisconnectResp,
            (Req, T::Follow) => MessageBody::FollowReq { username: Username::decode(r)? },
            (Resp, T::Follow) => MessageBody::FollowResp,
            (Req, T::Notify) => MessageBody::NotifyReq { message: NotifMessage::decode(r)? },
            (Resp, T::Notify) => MessageBody::NotifyResp,
            (Req, T::Deliver) => MessageBody::DeliverReq {
                sender: Username::decode(r)?,
                message: NotifMessage::decode(r)?,
                sent_at: r.take_i64()?,
            },
            (Resp, T::Deliver) => MessageBody::DeliverResp,
            (Req, T::Ping) => MessageBody::PingReq,
            (Resp, T::Ping) => MessageBody::PingResp,
            (Req, T::ServerConn) => MessageBody::ServerConnReq,
            (Resp, T::ServerConn) => MessageBody::ServerConnResp,
            (Req, T::Error) => MessageBody::ErrorReq { kind: ErrorKind::decode(r)? },
            (Resp, T::Error) => MessageBody::ErrorResp { kind: ErrorKind::decode(r)? },
        };
        Ok(body)
    }

    /// Check that this body is the expected response type.
    ///
    /// `Resp/Error` turns into a typed error carrying the kind; any other
    /// mismatch reports the offending tag.
    pub fn expect_resp(&self, expected: MessageType) -> Result<(), RespError> {
        match self {
            MessageBody::ErrorResp { kind } => Err(RespError::Error(*kind)),
            body if body.tag() == MessageTag::new(MessageStep::Resp, expected) => Ok(()),
            body => Err(RespError::Unexpected {
                expected: MessageTag::new(MessageStep::Resp, expected),
                got: body.tag(),
            }),
        }
    }
}

/// A response was not what the requester expected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RespError {
    #[error("peer answered with error: {0}")]
    Error(ErrorKind),
    #[error("expected {expected}, got {got}")]
    Unexpected { expected: MessageTag, got: MessageTag },
}

// ---------------------------------------------------------------------------
// Message and Envelope
// ---------------------------------------------------------------------------

/// A framed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl Message {
    /// A fresh request around `body`.
    pub fn request(body: MessageBody) -> Self {
        debug_assert!(body.is_req());
        Message { header: MessageHeader::for_request(), body }
    }

    /// The response to the request with header `req`, around `body`.
    pub fn response(req_seqn: u64, body: MessageBody) -> Self {
        debug_assert!(!body.is_req());
        Message { header: MessageHeader::for_response(req_seqn), body }
    }
}

impl WireEncode for Message {
    fn encode(&self, w: &mut WireWriter) {
        w.put_u64(WIRE_MAGIC);
        self.header.encode(w);
        self.body.tag().encode(w);
        self.body.encode_fields(w);
    }
}

impl WireDecode for Message {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        // A datagram that does not lead with the magic number is noise from
        // outside the protocol, whatever else is wrong with it.
        match r.take_u64() {
            Ok(magic) if magic == WIRE_MAGIC => {}
            Ok(_) | Err(WireError::UnexpectedEof) | Err(WireError::InvalidInt { .. }) => {
                return Err(WireError::OutOfProtocol);
            }
            Err(err) => return Err(err),
        }
        let header = MessageHeader::decode(r)?;
        let tag = MessageTag::decode(r)?;
        let body = MessageBody::decode_fields(tag, r)?;
        Ok(Message { header, body })
    }
}

/// A message annotated with the peer it came from or goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub remote: Address,
    pub message: Message,
}

impl Envelope {
    pub fn new(remote: Address, message: Message) -> Self {
        Envelope { remote, message }
    }

    pub fn tag(&self) -> MessageTag {
        self.message.body.tag()
    }

    pub fn seqn(&self) -> u64 {
        self.message.header.seqn
    }
}
