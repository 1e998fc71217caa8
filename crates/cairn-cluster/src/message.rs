//! Binary wire format for membership and messaging frames.
//!
//! Every datagram is one frame:
//!
//! ```text
//! [version: u8][domain: str16][kind: u8][body...]
//! ```
//!
//! Strings are a little-endian u16 length followed by UTF-8 bytes. Byte
//! payloads use a u32 length. All integers are little-endian. Decoding never
//! panics on truncated or hostile input; it returns `io::Error`.

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::member::{Member, MemberId, MAX_MEMBER_ID_LEN};

/// Frame format version. Frames with another version are rejected.
pub const WIRE_VERSION: u8 = 1;

/// Upper bound on members or properties in one frame.
const MAX_COLLECTION_COUNT: usize = 1024;

/// Upper bound on an application payload.
pub const MAX_PAYLOAD_LEN: usize = 8 * 1024 * 1024;

const KIND_ANNOUNCE: u8 = 1;
const KIND_JOIN_REQUEST: u8 = 2;
const KIND_JOIN_RESPONSE: u8 = 3;
const KIND_HEARTBEAT: u8 = 4;
const KIND_LEAVE: u8 = 5;
const KIND_DEPARTED: u8 = 6;
const KIND_DATA: u8 = 7;
const KIND_DATA_ACK: u8 = 8;
const KIND_REPLY: u8 = 9;

const FLAG_EXPECTS_REPLY: u8 = 0x01;

/// An application message travelling through the group.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterMessage {
    pub sender_id: MemberId,
    /// Incarnation of the sender when it assigned `sequence_number`.
    pub sender_incarnation: u64,
    pub sequence_number: u64,
    pub payload: Bytes,
    /// Empty for a broadcast to the whole group.
    pub target_ids: Vec<MemberId>,
    pub expects_reply: bool,
}

/// Frames exchanged between members.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// "I exist." Multicast discovery, WKA self-announcement, refutation.
    Announce {
        member: Member,
        /// Asks the receiver to answer with its own announcement.
        reply_requested: bool,
    },

    /// Opens a WKA handshake. Answered with a `JoinResponse`.
    JoinRequest { nonce: u64, member: Member },

    /// The responder's view of the group, including itself.
    JoinResponse {
        nonce: u64,
        responder: MemberId,
        members: Vec<Member>,
    },

    /// Periodic liveness signal.
    Heartbeat { member: Member },

    /// Graceful departure.
    Leave { id: MemberId, incarnation: u64 },

    /// Tells a member that the sender has declared `incarnation` of it
    /// departed. The receiver rejoins with a higher incarnation.
    Departed { id: MemberId, incarnation: u64 },

    /// An application message.
    Data(ClusterMessage),

    /// Receipt for a `Data` frame.
    DataAck { acker: MemberId, sequence: u64 },

    /// Answer to a `Data` frame that expected a reply.
    Reply {
        responder: MemberId,
        sequence: u64,
        payload: Bytes,
    },
}

impl WireMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Announce { .. } => "announce",
            WireMessage::JoinRequest { .. } => "join-request",
            WireMessage::JoinResponse { .. } => "join-response",
            WireMessage::Heartbeat { .. } => "heartbeat",
            WireMessage::Leave { .. } => "leave",
            WireMessage::Departed { .. } => "departed",
            WireMessage::Data(_) => "data",
            WireMessage::DataAck { .. } => "data-ack",
            WireMessage::Reply { .. } => "reply",
        }
    }
}

/// A frame: message plus the cluster domain it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub domain: String,
    pub message: WireMessage,
}

impl Envelope {
    pub fn new(domain: impl Into<String>, message: WireMessage) -> Self {
        Self {
            domain: domain.into(),
            message,
        }
    }

    /// Serializes the frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Serializes the frame into an existing buffer.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(WIRE_VERSION);
        put_str(buf, &self.domain);
        match &self.message {
            WireMessage::Announce {
                member,
                reply_requested,
            } => {
                buf.put_u8(KIND_ANNOUNCE);
                put_member(buf, member);
                buf.put_u8(u8::from(*reply_requested));
            }
            WireMessage::JoinRequest { nonce, member } => {
                buf.put_u8(KIND_JOIN_REQUEST);
                buf.put_u64_le(*nonce);
                put_member(buf, member);
            }
            WireMessage::JoinResponse {
                nonce,
                responder,
                members,
            } => {
                buf.put_u8(KIND_JOIN_RESPONSE);
                buf.put_u64_le(*nonce);
                put_str(buf, responder.as_str());
                let count = members.len().min(MAX_COLLECTION_COUNT);
                if count < members.len() {
                    warn!(
                        "join response lists {} members; sending the first {}",
                        members.len(),
                        count
                    );
                }
                buf.put_u16_le(count as u16);
                for member in &members[..count] {
                    put_member(buf, member);
                }
            }
            WireMessage::Heartbeat { member } => {
                buf.put_u8(KIND_HEARTBEAT);
                put_member(buf, member);
            }
            WireMessage::Leave { id, incarnation } => {
                buf.put_u8(KIND_LEAVE);
                put_str(buf, id.as_str());
                buf.put_u64_le(*incarnation);
            }
            WireMessage::Departed { id, incarnation } => {
                buf.put_u8(KIND_DEPARTED);
                put_str(buf, id.as_str());
                buf.put_u64_le(*incarnation);
            }
            WireMessage::Data(msg) => {
                buf.put_u8(KIND_DATA);
                put_str(buf, msg.sender_id.as_str());
                buf.put_u64_le(msg.sender_incarnation);
                buf.put_u64_le(msg.sequence_number);
                let flags = if msg.expects_reply {
                    FLAG_EXPECTS_REPLY
                } else {
                    0
                };
                buf.put_u8(flags);
                let count = msg.target_ids.len().min(MAX_COLLECTION_COUNT);
                buf.put_u16_le(count as u16);
                for target in &msg.target_ids[..count] {
                    put_str(buf, target.as_str());
                }
                put_bytes(buf, &msg.payload);
            }
            WireMessage::DataAck { acker, sequence } => {
                buf.put_u8(KIND_DATA_ACK);
                put_str(buf, acker.as_str());
                buf.put_u64_le(*sequence);
            }
            WireMessage::Reply {
                responder,
                sequence,
                payload,
            } => {
                buf.put_u8(KIND_REPLY);
                put_str(buf, responder.as_str());
                buf.put_u64_le(*sequence);
                put_bytes(buf, payload);
            }
        }
    }

    /// Parses a frame.
    pub fn decode(frame: &[u8]) -> io::Result<Self> {
        let mut r = Reader(frame);
        let version = r.u8()?;
        if version != WIRE_VERSION {
            return Err(invalid(format!("unsupported wire version {version}")));
        }
        let domain = r.string()?;
        let kind = r.u8()?;
        let message = match kind {
            KIND_ANNOUNCE => {
                let member = r.member()?;
                let reply_requested = r.u8()? != 0;
                WireMessage::Announce {
                    member,
                    reply_requested,
                }
            }
            KIND_JOIN_REQUEST => {
                let nonce = r.u64()?;
                let member = r.member()?;
                WireMessage::JoinRequest { nonce, member }
            }
            KIND_JOIN_RESPONSE => {
                let nonce = r.u64()?;
                let responder = r.member_id()?;
                let count = r.count()?;
                let mut members = Vec::with_capacity(count);
                for _ in 0..count {
                    members.push(r.member()?);
                }
                WireMessage::JoinResponse {
                    nonce,
                    responder,
                    members,
                }
            }
            KIND_HEARTBEAT => WireMessage::Heartbeat {
                member: r.member()?,
            },
            KIND_LEAVE => WireMessage::Leave {
                id: r.member_id()?,
                incarnation: r.u64()?,
            },
            KIND_DEPARTED => WireMessage::Departed {
                id: r.member_id()?,
                incarnation: r.u64()?,
            },
            KIND_DATA => {
                let sender_id = r.member_id()?;
                let sender_incarnation = r.u64()?;
                let sequence_number = r.u64()?;
                let flags = r.u8()?;
                let count = r.count()?;
                let mut target_ids = Vec::with_capacity(count);
                for _ in 0..count {
                    target_ids.push(r.member_id()?);
                }
                let payload = r.bytes()?;
                WireMessage::Data(ClusterMessage {
                    sender_id,
                    sender_incarnation,
                    sequence_number,
                    payload,
                    target_ids,
                    expects_reply: flags & FLAG_EXPECTS_REPLY != 0,
                })
            }
            KIND_DATA_ACK => WireMessage::DataAck {
                acker: r.member_id()?,
                sequence: r.u64()?,
            },
            KIND_REPLY => WireMessage::Reply {
                responder: r.member_id()?,
                sequence: r.u64()?,
                payload: r.bytes()?,
            },
            other => return Err(invalid(format!("unknown frame kind {other}"))),
        };
        Ok(Envelope { domain, message })
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn put_str(buf: &mut BytesMut, s: &str) {
    let len = s.len().min(u16::MAX as usize);
    buf.put_u16_le(len as u16);
    buf.put_slice(&s.as_bytes()[..len]);
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

fn put_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16_le(addr.port());
}

/// Keeps the longest prefix of `members` that encodes within `budget` bytes
/// and fits one frame's member count. Returns how many were cut.
pub(crate) fn fit_members(members: &mut Vec<Member>, budget: usize) -> usize {
    let mut scratch = BytesMut::new();
    let mut used = 0;
    let mut keep = 0;
    for member in members.iter().take(MAX_COLLECTION_COUNT) {
        scratch.clear();
        put_member(&mut scratch, member);
        if used + scratch.len() > budget {
            break;
        }
        used += scratch.len();
        keep += 1;
    }
    let cut = members.len() - keep;
    members.truncate(keep);
    cut
}

fn put_member(buf: &mut BytesMut, member: &Member) {
    put_str(buf, member.id().as_str());
    put_addr(buf, &member.addr());
    buf.put_u64_le(member.incarnation());
    let count = member.properties().len().min(MAX_COLLECTION_COUNT);
    buf.put_u16_le(count as u16);
    for (key, value) in member.properties().iter().take(count) {
        put_str(buf, key);
        put_str(buf, value);
    }
}

/// Cursor over an incoming frame with bounds-checked reads.
struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn need(&self, n: usize) -> io::Result<()> {
        if self.0.len() < n {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("need {n} bytes, have {}", self.0.len()),
            ));
        }
        Ok(())
    }

    fn u8(&mut self) -> io::Result<u8> {
        self.need(1)?;
        Ok(self.0.get_u8())
    }

    fn u16(&mut self) -> io::Result<u16> {
        self.need(2)?;
        Ok(self.0.get_u16_le())
    }

    fn u32(&mut self) -> io::Result<u32> {
        self.need(4)?;
        Ok(self.0.get_u32_le())
    }

    fn u64(&mut self) -> io::Result<u64> {
        self.need(8)?;
        Ok(self.0.get_u64_le())
    }

    fn count(&mut self) -> io::Result<usize> {
        let count = self.u16()? as usize;
        if count > MAX_COLLECTION_COUNT {
            return Err(invalid(format!("collection of {count} exceeds limit")));
        }
        Ok(count)
    }

    fn slice(&mut self, len: usize) -> io::Result<&'a [u8]> {
        self.need(len)?;
        let (head, tail) = self.0.split_at(len);
        self.0 = tail;
        Ok(head)
    }

    fn string(&mut self) -> io::Result<String> {
        let len = self.u16()? as usize;
        let raw = self.slice(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| invalid("string is not utf-8"))
    }

    fn bytes(&mut self) -> io::Result<Bytes> {
        let len = self.u32()? as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(invalid(format!("payload of {len} bytes exceeds limit")));
        }
        Ok(Bytes::copy_from_slice(self.slice(len)?))
    }

    fn member_id(&mut self) -> io::Result<MemberId> {
        let id = self.string()?;
        if id.is_empty() || id.len() > MAX_MEMBER_ID_LEN {
            return Err(invalid(format!("member id of {} bytes", id.len())));
        }
        Ok(MemberId::new(id))
    }

    fn addr(&mut self) -> io::Result<SocketAddr> {
        let ip = match self.u8()? {
            4 => {
                let o = self.slice(4)?;
                IpAddr::V4(Ipv4Addr::new(o[0], o[1], o[2], o[3]))
            }
            6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(self.slice(16)?);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            tag => return Err(invalid(format!("unknown address family {tag}"))),
        };
        Ok(SocketAddr::new(ip, self.u16()?))
    }

    fn member(&mut self) -> io::Result<Member> {
        let id = self.member_id()?;
        let addr = self.addr()?;
        let incarnation = self.u64()?;
        let count = self.count()?;
        let mut properties = BTreeMap::new();
        for _ in 0..count {
            let key = self.string()?;
            let value = self.string()?;
            properties.insert(key, value);
        }
        Ok(Member::new(id, addr)
            .with_incarnation(incarnation)
            .with_properties(properties))
    }
}
