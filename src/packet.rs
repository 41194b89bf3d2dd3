//! # Wire Codec
//!
//! Fixed binary packet format, one packet per UDP datagram. All multi-byte
//! fields are network byte order; variable-length bodies carry an explicit
//! count so decoding is never ambiguous.
//!
//! ## Header (36 bytes)
//!
//! ```text
//! type(1) hop_count(1) payload_len(2)
//! src_loc(8) src_id(8) dst_loc(8) dst_id(8)
//! ```
//!
//! ## Bodies
//!
//! | type | body |
//! |------|------|
//! | 1 Data          | raw payload bytes |
//! | 2 LocatorUpdate | count(1) + count x locator(8) |
//! | 3 RouteRequest  | request_id(2) + count(1) + count x locator(8) |
//! | 4 RouteReply    | request_id(2) + count(1) + count x locator(8) |
//!
//! The hop count starts at 0 and increments by exactly one per forwarding
//! node; enforcement against the hop limit happens in the routing engine,
//! not here.
//!
//! Round-trip law: `Packet::decode(&p.encode()) == Ok(p)` for every
//! well-formed packet `p`.

use crate::identity::{Address, Identifier, Locator};

/// Header size on the wire.
pub const HEADER_SIZE: usize = 36;

/// Payload length field is 16 bits.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Locator lists are count-prefixed with a single byte.
pub const MAX_LOCATOR_LIST: usize = u8::MAX as usize;

const TYPE_DATA: u8 = 1;
const TYPE_LOCATOR_UPDATE: u8 = 2;
const TYPE_ROUTE_REQUEST: u8 = 3;
const TYPE_ROUTE_REPLY: u8 = 4;

/// Decode failure. The offending datagram is dropped and the dispatch loop
/// carries on.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("truncated packet: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unknown packet type tag {0}")]
    UnknownType(u8),
    #[error("length field says {declared} payload bytes, datagram carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("payload exceeds 16-bit length field: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("locator list exceeds 8-bit count field: {0} entries")]
    LocatorListTooLarge(usize),
}

/// Type-specific packet body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PacketBody {
    /// Application payload, delivered to the destination (or its sink log).
    Data(Vec<u8>),
    /// The sender's complete replacement locator set.
    LocatorUpdate(Vec<Locator>),
    /// On-demand route discovery: the locators visited so far.
    RouteRequest { request_id: u16, visited: Vec<Locator> },
    /// Discovered path from requester towards the destination.
    RouteReply { request_id: u16, path: Vec<Locator> },
}

impl PacketBody {
    fn type_tag(&self) -> u8 {
        match self {
            PacketBody::Data(_) => TYPE_DATA,
            PacketBody::LocatorUpdate(_) => TYPE_LOCATOR_UPDATE,
            PacketBody::RouteRequest { .. } => TYPE_ROUTE_REQUEST,
            PacketBody::RouteReply { .. } => TYPE_ROUTE_REPLY,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            PacketBody::Data(bytes) => bytes.len(),
            PacketBody::LocatorUpdate(locs) => 1 + locs.len() * 8,
            PacketBody::RouteRequest { visited, .. } => 2 + 1 + visited.len() * 8,
            PacketBody::RouteReply { path, .. } => 2 + 1 + path.len() * 8,
        }
    }
}

/// A protocol packet: header fields plus a type-specific body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub src: Address,
    pub dst: Address,
    pub hop_count: u8,
    pub body: PacketBody,
}

impl Packet {
    pub fn new(src: Address, dst: Address, body: PacketBody) -> Self {
        Self {
            src,
            dst,
            hop_count: 0,
            body,
        }
    }

    /// Control packets steer routing; data packets carry payload.
    pub fn is_control(&self) -> bool {
        !matches!(self.body, PacketBody::Data(_))
    }

    /// Serializes to the fixed wire format.
    ///
    /// Fails only when a field cannot be represented on the wire (payload
    /// over 64 KiB or a locator list over 255 entries); those packets must
    /// not be constructed by well-behaved callers.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let body_len = self.body.encoded_len();
        if body_len > MAX_PAYLOAD_SIZE {
            return Err(PacketError::PayloadTooLarge(body_len));
        }
        if let PacketBody::Data(_) = self.body {
        } else if let Some(n) = self.locator_list_len() {
            if n > MAX_LOCATOR_LIST {
                return Err(PacketError::LocatorListTooLarge(n));
            }
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
        buf.push(self.body.type_tag());
        buf.push(self.hop_count);
        buf.extend_from_slice(&(body_len as u16).to_be_bytes());
        buf.extend_from_slice(&self.src.loc.0.to_be_bytes());
        buf.extend_from_slice(&self.src.id.0.to_be_bytes());
        buf.extend_from_slice(&self.dst.loc.0.to_be_bytes());
        buf.extend_from_slice(&self.dst.id.0.to_be_bytes());

        match &self.body {
            PacketBody::Data(bytes) => buf.extend_from_slice(bytes),
            PacketBody::LocatorUpdate(locs) => {
                buf.push(locs.len() as u8);
                for loc in locs {
                    buf.extend_from_slice(&loc.0.to_be_bytes());
                }
            }
            PacketBody::RouteRequest { request_id, visited } => {
                buf.extend_from_slice(&request_id.to_be_bytes());
                buf.push(visited.len() as u8);
                for loc in visited {
                    buf.extend_from_slice(&loc.0.to_be_bytes());
                }
            }
            PacketBody::RouteReply { request_id, path } => {
                buf.extend_from_slice(&request_id.to_be_bytes());
                buf.push(path.len() as u8);
                for loc in path {
                    buf.extend_from_slice(&loc.0.to_be_bytes());
                }
            }
        }

        Ok(buf)
    }

    /// Parses one datagram. Every field is validated against the actual
    /// byte count before any allocation is sized from it.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::Truncated {
                need: HEADER_SIZE,
                have: bytes.len(),
            });
        }

        let type_tag = bytes[0];
        let hop_count = bytes[1];
        let declared = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let src = Address::new(
            Locator(read_u64(&bytes[4..12])),
            Identifier(read_u64(&bytes[12..20])),
        );
        let dst = Address::new(
            Locator(read_u64(&bytes[20..28])),
            Identifier(read_u64(&bytes[28..36])),
        );

        let payload = &bytes[HEADER_SIZE..];
        if payload.len() != declared {
            return Err(PacketError::LengthMismatch {
                declared,
                actual: payload.len(),
            });
        }

        let body = match type_tag {
            TYPE_DATA => PacketBody::Data(payload.to_vec()),
            TYPE_LOCATOR_UPDATE => {
                let locs = decode_locator_list(payload, 0)?;
                PacketBody::LocatorUpdate(locs)
            }
            TYPE_ROUTE_REQUEST => {
                let request_id = read_request_id(payload)?;
                let visited = decode_locator_list(payload, 2)?;
                PacketBody::RouteRequest { request_id, visited }
            }
            TYPE_ROUTE_REPLY => {
                let request_id = read_request_id(payload)?;
                let path = decode_locator_list(payload, 2)?;
                PacketBody::RouteReply { request_id, path }
            }
            other => return Err(PacketError::UnknownType(other)),
        };

        Ok(Packet {
            src,
            dst,
            hop_count,
            body,
        })
    }

    fn locator_list_len(&self) -> Option<usize> {
        match &self.body {
            PacketBody::Data(_) => None,
            PacketBody::LocatorUpdate(locs) => Some(locs.len()),
            PacketBody::RouteRequest { visited, .. } => Some(visited.len()),
            PacketBody::RouteReply { path, .. } => Some(path.len()),
        }
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    u64::from_be_bytes(arr)
}

fn read_request_id(payload: &[u8]) -> Result<u16, PacketError> {
    if payload.len() < 2 {
        return Err(PacketError::Truncated {
            need: 2,
            have: payload.len(),
        });
    }
    Ok(u16::from_be_bytes([payload[0], payload[1]]))
}

/// Decodes `count(1) + count x locator(8)` starting at `offset`, requiring
/// the list to consume the remainder of the payload exactly.
fn decode_locator_list(payload: &[u8], offset: usize) -> Result<Vec<Locator>, PacketError> {
    let rest = payload.get(offset..).ok_or(PacketError::Truncated {
        need: offset,
        have: payload.len(),
    })?;
    if rest.is_empty() {
        return Err(PacketError::Truncated {
            need: offset + 1,
            have: payload.len(),
        });
    }
    let count = rest[0] as usize;
    let list_bytes = &rest[1..];
    if list_bytes.len() != count * 8 {
        return Err(PacketError::LengthMismatch {
            declared: count * 8,
            actual: list_bytes.len(),
        });
    }
    Ok(list_bytes
        .chunks_exact(8)
        .map(|chunk| Locator(read_u64(chunk)))
        .collect())
}
