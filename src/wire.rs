//! # TCPCLv4 wire codec
//!
//! Big-endian, length-prefixed binary framing for the seven TCPCLv4 message
//! kinds plus the Contact Header. Every variant owns a `marshal`/`unmarshal`
//! pair; [`read_message`] is the single dispatch point that peeks the
//! leading octet of the stream, picks the matching variant, and lets that
//! variant's `unmarshal` consume (and re-validate) its own code byte.
//!
//! Session Extension Items and Transfer Extension Items are parsed as a
//! length-prefixed blob and discarded (spec.md §9 Open Question): we always
//! *encode* a zero-length extension, so round-trip byte-equality only holds
//! for messages built with an empty extension to start with.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::eid::EndpointId;
use crate::error::CoreError;

/// TCPCLv4 magic: the ASCII bytes `dtn!`.
pub const MAGIC: [u8; 4] = *b"dtn!";
/// The only version this crate speaks.
pub const VERSION: u8 = 4;

const TYPE_XFER_SEGMENT: u8 = 0x01;
const TYPE_XFER_ACK: u8 = 0x02;
const TYPE_XFER_REFUSE: u8 = 0x03;
const TYPE_KEEPALIVE: u8 = 0x04;
const TYPE_SESS_TERM: u8 = 0x05;
const TYPE_MSG_REJECT: u8 = 0x06;
const TYPE_SESS_INIT: u8 = 0x07;
/// First byte of a Contact Header happens to equal the first byte of the
/// `dtn!` magic; it never collides with the type codes above.
const TYPE_CONTACT_HEADER: u8 = MAGIC[0];

/// Contact-header capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContactFlags(u8);

impl ContactFlags {
    pub const CAN_TLS: u8 = 0x01;

    pub fn empty() -> Self {
        ContactFlags(0)
    }

    pub fn from_bits(bits: u8) -> Self {
        ContactFlags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn can_tls(self) -> bool {
        self.0 & Self::CAN_TLS != 0
    }

    pub fn with_can_tls(mut self, v: bool) -> Self {
        if v {
            self.0 |= Self::CAN_TLS;
        } else {
            self.0 &= !Self::CAN_TLS;
        }
        self
    }
}

/// XFER_SEGMENT / XFER_ACK flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentFlags(u8);

impl SegmentFlags {
    pub const END: u8 = 0x01;
    pub const START: u8 = 0x02;

    pub fn empty() -> Self {
        SegmentFlags(0)
    }

    pub fn from_bits(bits: u8) -> Self {
        SegmentFlags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_end(self) -> bool {
        self.0 & Self::END != 0
    }

    pub fn is_start(self) -> bool {
        self.0 & Self::START != 0
    }

    pub fn with_end(mut self, v: bool) -> Self {
        if v {
            self.0 |= Self::END;
        } else {
            self.0 &= !Self::END;
        }
        self
    }

    pub fn with_start(mut self, v: bool) -> Self {
        if v {
            self.0 |= Self::START;
        } else {
            self.0 &= !Self::START;
        }
        self
    }
}

/// SESS_TERM flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessTermFlags(u8);

impl SessTermFlags {
    pub const REPLY: u8 = 0x01;

    pub fn empty() -> Self {
        SessTermFlags(0)
    }

    pub fn from_bits(bits: u8) -> Self {
        SessTermFlags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_reply(self) -> bool {
        self.0 & Self::REPLY != 0
    }

    pub fn with_reply(mut self, v: bool) -> Self {
        if v {
            self.0 |= Self::REPLY;
        } else {
            self.0 &= !Self::REPLY;
        }
        self
    }
}

/// XFER_REFUSE reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusalReasonCode {
    Unknown = 0,
    Completed = 1,
    NoResources = 2,
    Retransmit = 3,
}

impl RefusalReasonCode {
    fn from_u8(b: u8) -> Result<Self, CoreError> {
        match b {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Completed),
            2 => Ok(Self::NoResources),
            3 => Ok(Self::Retransmit),
            other => Err(CoreError::Protocol(format!(
                "unknown XFER_REFUSE reason code {other}"
            ))),
        }
    }
}

/// SESS_TERM reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessTermReasonCode {
    Unknown = 0,
    IdleTimeout = 1,
    VersionMismatch = 2,
    Busy = 3,
    ContactFailure = 4,
    ResourceExhaustion = 5,
}

impl SessTermReasonCode {
    fn from_u8(b: u8) -> Result<Self, CoreError> {
        match b {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::IdleTimeout),
            2 => Ok(Self::VersionMismatch),
            3 => Ok(Self::Busy),
            4 => Ok(Self::ContactFailure),
            5 => Ok(Self::ResourceExhaustion),
            other => Err(CoreError::Protocol(format!(
                "unknown SESS_TERM reason code {other}"
            ))),
        }
    }
}

/// MSG_REJECT reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReasonCode {
    TypeUnknown = 1,
    Unsupported = 2,
    Unexpected = 3,
}

impl RejectReasonCode {
    fn from_u8(b: u8) -> Result<Self, CoreError> {
        match b {
            1 => Ok(Self::TypeUnknown),
            2 => Ok(Self::Unsupported),
            3 => Ok(Self::Unexpected),
            other => Err(CoreError::Protocol(format!(
                "unknown MSG_REJECT reason code {other}"
            ))),
        }
    }
}

/// The one-octet TCPCLv4 Contact Header: `dtn!` + version + flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactHeader {
    pub flags: ContactFlags,
}

impl ContactHeader {
    pub fn new(flags: ContactFlags) -> Self {
        ContactHeader { flags }
    }

    pub async fn marshal<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), CoreError> {
        w.write_all(&MAGIC).await?;
        w.write_u8(VERSION).await?;
        w.write_u8(self.flags.bits()).await?;
        Ok(())
    }

    pub async fn unmarshal<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, CoreError> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).await?;
        let version = r.read_u8().await?;
        if magic != MAGIC || version != VERSION {
            return Err(CoreError::BadMagic);
        }
        let flags = r.read_u8().await?;
        Ok(ContactHeader {
            flags: ContactFlags::from_bits(flags),
        })
    }
}

/// SESS_INIT: keepalive interval, MRUs, local node-id, and an (ignored)
/// session extension blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessInit {
    pub keepalive: u16,
    pub segment_mru: u64,
    pub transfer_mru: u64,
    pub node_id: EndpointId,
}

impl SessInit {
    pub async fn marshal<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), CoreError> {
        w.write_u8(TYPE_SESS_INIT).await?;
        w.write_u16(self.keepalive).await?;
        w.write_u64(self.segment_mru).await?;
        w.write_u64(self.transfer_mru).await?;
        self.node_id.write_u16_prefixed(w).await?;
        // Always emit an empty session extension blob.
        w.write_u32(0).await?;
        Ok(())
    }

    pub async fn unmarshal<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, CoreError> {
        let ty = r.read_u8().await?;
        if ty != TYPE_SESS_INIT {
            return Err(CoreError::Decode(format!(
                "expected SESS_INIT code {TYPE_SESS_INIT:#x}, got {ty:#x}"
            )));
        }
        let keepalive = r.read_u16().await?;
        let segment_mru = r.read_u64().await?;
        let transfer_mru = r.read_u64().await?;
        let node_id = EndpointId::read_u16_prefixed(r).await?;
        let ext_len = r.read_u32().await?;
        skip(r, ext_len as u64).await?;
        Ok(SessInit {
            keepalive,
            segment_mru,
            transfer_mru,
            node_id,
        })
    }
}

/// SESS_TERM: flags plus a reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessTerm {
    pub flags: SessTermFlags,
    pub reason: SessTermReasonCode,
}

impl SessTerm {
    pub async fn marshal<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), CoreError> {
        w.write_u8(TYPE_SESS_TERM).await?;
        w.write_u8(self.flags.bits()).await?;
        w.write_u8(self.reason as u8).await?;
        Ok(())
    }

    pub async fn unmarshal<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, CoreError> {
        let ty = r.read_u8().await?;
        if ty != TYPE_SESS_TERM {
            return Err(CoreError::Decode(format!(
                "expected SESS_TERM code {TYPE_SESS_TERM:#x}, got {ty:#x}"
            )));
        }
        let flags = SessTermFlags::from_bits(r.read_u8().await?);
        let reason = SessTermReasonCode::from_u8(r.read_u8().await?)?;
        Ok(SessTerm { flags, reason })
    }
}

/// XFER_SEGMENT: one chunk of a bundle in flight, plus an (ignored)
/// transfer extension blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XferSegment {
    pub flags: SegmentFlags,
    pub transfer_id: u64,
    pub data: Vec<u8>,
}

impl XferSegment {
    pub async fn marshal<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), CoreError> {
        w.write_u8(TYPE_XFER_SEGMENT).await?;
        w.write_u8(self.flags.bits()).await?;
        w.write_u64(self.transfer_id).await?;
        // Always emit an empty transfer extension blob.
        w.write_u32(0).await?;
        w.write_u64(self.data.len() as u64).await?;
        w.write_all(&self.data).await?;
        Ok(())
    }

    pub async fn unmarshal<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, CoreError> {
        let ty = r.read_u8().await?;
        if ty != TYPE_XFER_SEGMENT {
            return Err(CoreError::Decode(format!(
                "expected XFER_SEGMENT code {TYPE_XFER_SEGMENT:#x}, got {ty:#x}"
            )));
        }
        let flags = SegmentFlags::from_bits(r.read_u8().await?);
        let transfer_id = r.read_u64().await?;
        let ext_len = r.read_u32().await?;
        skip(r, ext_len as u64).await?;
        let data_len = r.read_u64().await?;
        let mut data = vec![0u8; data_len as usize];
        r.read_exact(&mut data).await?;
        Ok(XferSegment {
            flags,
            transfer_id,
            data,
        })
    }
}

/// XFER_ACK: cumulative bytes acknowledged for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XferAck {
    pub flags: SegmentFlags,
    pub transfer_id: u64,
    pub ack_length: u64,
}

impl XferAck {
    pub async fn marshal<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), CoreError> {
        w.write_u8(TYPE_XFER_ACK).await?;
        w.write_u8(self.flags.bits()).await?;
        w.write_u64(self.transfer_id).await?;
        w.write_u64(self.ack_length).await?;
        Ok(())
    }

    pub async fn unmarshal<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, CoreError> {
        let ty = r.read_u8().await?;
        if ty != TYPE_XFER_ACK {
            return Err(CoreError::Decode(format!(
                "expected XFER_ACK code {TYPE_XFER_ACK:#x}, got {ty:#x}"
            )));
        }
        let flags = SegmentFlags::from_bits(r.read_u8().await?);
        let transfer_id = r.read_u64().await?;
        let ack_length = r.read_u64().await?;
        Ok(XferAck {
            flags,
            transfer_id,
            ack_length,
        })
    }
}

/// XFER_REFUSE: peer declines to continue receiving a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XferRefuse {
    pub reason: RefusalReasonCode,
    pub transfer_id: u64,
}

impl XferRefuse {
    pub async fn marshal<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), CoreError> {
        w.write_u8(TYPE_XFER_REFUSE).await?;
        w.write_u8(self.reason as u8).await?;
        w.write_u64(self.transfer_id).await?;
        Ok(())
    }

    pub async fn unmarshal<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, CoreError> {
        let ty = r.read_u8().await?;
        if ty != TYPE_XFER_REFUSE {
            return Err(CoreError::Decode(format!(
                "expected XFER_REFUSE code {TYPE_XFER_REFUSE:#x}, got {ty:#x}"
            )));
        }
        let reason = RefusalReasonCode::from_u8(r.read_u8().await?)?;
        let transfer_id = r.read_u64().await?;
        Ok(XferRefuse {
            reason,
            transfer_id,
        })
    }
}

/// KEEPALIVE: a bare type byte, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive;

impl Keepalive {
    pub async fn marshal<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), CoreError> {
        w.write_u8(TYPE_KEEPALIVE).await?;
        Ok(())
    }

    pub async fn unmarshal<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, CoreError> {
        let ty = r.read_u8().await?;
        if ty != TYPE_KEEPALIVE {
            return Err(CoreError::Decode(format!(
                "expected KEEPALIVE code {TYPE_KEEPALIVE:#x}, got {ty:#x}"
            )));
        }
        Ok(Keepalive)
    }
}

/// MSG_REJECT: a complaint about a message this node couldn't process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgReject {
    pub reason: RejectReasonCode,
    pub rejected_header: u8,
}

impl MsgReject {
    pub async fn marshal<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), CoreError> {
        w.write_u8(TYPE_MSG_REJECT).await?;
        w.write_u8(self.reason as u8).await?;
        w.write_u8(self.rejected_header).await?;
        Ok(())
    }

    pub async fn unmarshal<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, CoreError> {
        let ty = r.read_u8().await?;
        if ty != TYPE_MSG_REJECT {
            return Err(CoreError::Decode(format!(
                "expected MSG_REJECT code {TYPE_MSG_REJECT:#x}, got {ty:#x}"
            )));
        }
        let reason = RejectReasonCode::from_u8(r.read_u8().await?)?;
        let rejected_header = r.read_u8().await?;
        Ok(MsgReject {
            reason,
            rejected_header,
        })
    }
}

/// The discriminated union over all message kinds, including the Contact
/// Header (which is only ever sent/received during `ContactStage`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ContactHeader(ContactHeader),
    SessInit(SessInit),
    SessTerm(SessTerm),
    XferSegment(XferSegment),
    XferAck(XferAck),
    XferRefuse(XferRefuse),
    Keepalive(Keepalive),
    MsgReject(MsgReject),
}

impl Message {
    /// A short name for logging; does not reflect wire content.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ContactHeader(_) => "ContactHeader",
            Message::SessInit(_) => "SessInit",
            Message::SessTerm(_) => "SessTerm",
            Message::XferSegment(_) => "XferSegment",
            Message::XferAck(_) => "XferAck",
            Message::XferRefuse(_) => "XferRefuse",
            Message::Keepalive(_) => "Keepalive",
            Message::MsgReject(_) => "MsgReject",
        }
    }

    /// The wire type code this message would reject-report as, for
    /// MSG_REJECT(UNEXPECTED) purposes. Contact Header has no single-byte
    /// code in the protocol sense; callers should not reach this path
    /// for it (ContactStage rejects out-of-band, not via MSG_REJECT).
    pub fn type_code(&self) -> u8 {
        match self {
            Message::ContactHeader(_) => TYPE_CONTACT_HEADER,
            Message::SessInit(_) => TYPE_SESS_INIT,
            Message::SessTerm(_) => TYPE_SESS_TERM,
            Message::XferSegment(_) => TYPE_XFER_SEGMENT,
            Message::XferAck(_) => TYPE_XFER_ACK,
            Message::XferRefuse(_) => TYPE_XFER_REFUSE,
            Message::Keepalive(_) => TYPE_KEEPALIVE,
            Message::MsgReject(_) => TYPE_MSG_REJECT,
        }
    }

    pub async fn marshal<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), CoreError> {
        match self {
            Message::ContactHeader(m) => m.marshal(w).await,
            Message::SessInit(m) => m.marshal(w).await,
            Message::SessTerm(m) => m.marshal(w).await,
            Message::XferSegment(m) => m.marshal(w).await,
            Message::XferAck(m) => m.marshal(w).await,
            Message::XferRefuse(m) => m.marshal(w).await,
            Message::Keepalive(m) => m.marshal(w).await,
            Message::MsgReject(m) => m.marshal(w).await,
        }
    }
}

/// Peek the leading octet of `r` and dispatch to the matching variant's
/// `unmarshal`. Returns `Err(CoreError::Decode)` carrying the unknown code
/// for a type byte that matches none of the seven kinds; the caller (the
/// Established stage) turns that into a MSG_REJECT(TYPE_UNKNOWN).
pub async fn read_message<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Message, CoreError> {
    let buf = r.fill_buf().await?;
    if buf.is_empty() {
        return Err(CoreError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stream closed before a message could be read",
        )));
    }
    let code = buf[0];
    match code {
        TYPE_CONTACT_HEADER => Ok(Message::ContactHeader(ContactHeader::unmarshal(r).await?)),
        TYPE_SESS_INIT => Ok(Message::SessInit(SessInit::unmarshal(r).await?)),
        TYPE_SESS_TERM => Ok(Message::SessTerm(SessTerm::unmarshal(r).await?)),
        TYPE_XFER_SEGMENT => Ok(Message::XferSegment(XferSegment::unmarshal(r).await?)),
        TYPE_XFER_ACK => Ok(Message::XferAck(XferAck::unmarshal(r).await?)),
        TYPE_XFER_REFUSE => Ok(Message::XferRefuse(XferRefuse::unmarshal(r).await?)),
        TYPE_KEEPALIVE => Ok(Message::Keepalive(Keepalive::unmarshal(r).await?)),
        TYPE_MSG_REJECT => Ok(Message::MsgReject(MsgReject::unmarshal(r).await?)),
        other => Err(CoreError::UnknownMessageType(other)),
    }
}

/// The unknown-type-code carried by a [`read_message`] decode failure, if
/// that's what failed. Used by the Established stage to build the
/// MSG_REJECT(TYPE_UNKNOWN) response.
pub fn unknown_type_code(err: &CoreError) -> Option<u8> {
    match err {
        CoreError::UnknownMessageType(code) => Some(*code),
        _ => None,
    }
}

async fn skip<R: AsyncRead + Unpin>(r: &mut R, mut n: u64) -> Result<(), CoreError> {
    let mut buf = [0u8; 256];
    while n > 0 {
        let chunk = n.min(buf.len() as u64) as usize;
        r.read_exact(&mut buf[..chunk]).await?;
        n -= chunk as u64;
    }
    Ok(())
}
