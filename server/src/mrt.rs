//! MRT record framing and BGP message decoding.
//!
//! An MRT stream is a sequence of framed records, each starting with a 12-byte
//! common header whose first 4 bytes are a big-endian UNIX timestamp in
//! seconds. [`RecordReader`] splits complete records out of any byte stream;
//! [`parse_body`] decodes BGP4MP / BGP4MP_ET bodies down to the BGP UPDATE
//! fields the stats engine aggregates. Everything else is passed through as
//! [`MrtBody::Other`].

use chrono::{DateTime, TimeZone, Utc};
use std::io::Read;

use crate::error::ArchiveError;

// ---------------------------------------------------------------------------
// Wire constants
// ---------------------------------------------------------------------------

pub const COMMON_HEADER_LEN: usize = 12;

/// MRT record types carrying BGP messages.
pub const BGP4MP: u16 = 16;
/// BGP4MP with an extended (microsecond) timestamp prefix on the body.
pub const BGP4MP_ET: u16 = 17;

/// BGP4MP subtypes that contain a full BGP message.
pub const BGP4MP_MESSAGE: u16 = 1;
pub const BGP4MP_MESSAGE_AS4: u16 = 4;

const BGP_HEADER_LEN: usize = 19;
pub const BGP_UPDATE: u8 = 2;

/// Path attribute type codes tallied by the stats engine.
pub const MP_REACH_NLRI: u8 = 14;
pub const MP_UNREACH_NLRI: u8 = 15;

// ---------------------------------------------------------------------------
// Common header
// ---------------------------------------------------------------------------

/// The fixed 12-byte header every MRT record begins with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub timestamp: u32,
    pub mrt_type: u16,
    pub subtype: u16,
    pub length: u32,
}

impl CommonHeader {
    /// Decode the common header from the front of a record.
    pub fn parse(record: &[u8]) -> Result<Self, ArchiveError> {
        if record.len() < COMMON_HEADER_LEN {
            return Err(ArchiveError::Decode(format!(
                "record too short for common header: {} bytes",
                record.len()
            )));
        }
        Ok(Self {
            timestamp: u32::from_be_bytes([record[0], record[1], record[2], record[3]]),
            mrt_type: u16::from_be_bytes([record[4], record[5]]),
            subtype: u16::from_be_bytes([record[6], record[7]]),
            length: u32::from_be_bytes([record[8], record[9], record[10], record[11]]),
        })
    }

    /// The embedded timestamp as a UTC instant (second precision).
    pub fn time(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(i64::from(self.timestamp), 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

// ---------------------------------------------------------------------------
// Record splitter
// ---------------------------------------------------------------------------

/// Yields complete records (header + body) from a byte stream.
///
/// The returned slice borrows the reader's internal buffer and is only valid
/// until the next call; callers that keep record bytes must copy them.
pub struct RecordReader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: u64,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, buf: Vec::new(), pos: 0 }
    }

    /// Cumulative byte offset past the end of the last record returned.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// The next complete record, or `None` at a clean end of stream.
    pub fn next_record(&mut self) -> Result<Option<&[u8]>, ArchiveError> {
        self.buf.resize(COMMON_HEADER_LEN, 0);
        let n = read_full(&mut self.inner, &mut self.buf)?;
        if n == 0 {
            return Ok(None);
        }
        if n < COMMON_HEADER_LEN {
            return Err(ArchiveError::Decode(format!("truncated header: {n} bytes at end of stream")));
        }

        let body_len =
            u32::from_be_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]]) as usize;
        self.buf.resize(COMMON_HEADER_LEN + body_len, 0);
        let m = read_full(&mut self.inner, &mut self.buf[COMMON_HEADER_LEN..])?;
        if m < body_len {
            return Err(ArchiveError::Decode(format!(
                "truncated record body: expected {body_len} bytes, got {m}"
            )));
        }

        self.pos += (COMMON_HEADER_LEN + body_len) as u64;
        Ok(Some(&self.buf))
    }
}

/// Read until the buffer is full or the stream ends. Returns bytes read.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        let k = r.read(&mut buf[n..])?;
        if k == 0 {
            break;
        }
        n += k;
    }
    Ok(n)
}

// ---------------------------------------------------------------------------
// Body decoding
// ---------------------------------------------------------------------------

/// Decoded MRT record body. Only BGP4MP message subtypes are parsed in depth.
#[derive(Debug)]
pub enum MrtBody {
    Bgp4mp(Bgp4mp),
    Other { mrt_type: u16, subtype: u16 },
}

#[derive(Debug)]
pub struct Bgp4mp {
    pub peer_as: u32,
    pub local_as: u32,
    pub interface: u16,
    pub afi: u16,
    pub message: BgpMessage,
}

#[derive(Debug)]
pub enum BgpMessage {
    Update(BgpUpdate),
    /// Any non-UPDATE BGP message, carrying its type octet.
    Other(u8),
}

#[derive(Debug, Default)]
pub struct BgpUpdate {
    pub withdrawn_routes: Vec<Prefix>,
    pub nlri: Vec<Prefix>,
    pub path_attributes: Vec<PathAttribute>,
}

/// An NLRI prefix: bit length plus the minimum octets that cover it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    pub bits: u8,
    pub octets: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathAttribute {
    pub flags: u8,
    pub type_code: u8,
    pub value: Vec<u8>,
}

const ATTR_FLAG_EXTENDED_LENGTH: u8 = 0x10;

/// Decode a record's body. `record` is the full record including the header.
pub fn parse_body(header: &CommonHeader, record: &[u8]) -> Result<MrtBody, ArchiveError> {
    if header.mrt_type != BGP4MP && header.mrt_type != BGP4MP_ET {
        return Ok(MrtBody::Other { mrt_type: header.mrt_type, subtype: header.subtype });
    }
    if header.subtype != BGP4MP_MESSAGE && header.subtype != BGP4MP_MESSAGE_AS4 {
        // State changes and other subtypes carry no BGP message.
        return Ok(MrtBody::Other { mrt_type: header.mrt_type, subtype: header.subtype });
    }

    let end = COMMON_HEADER_LEN + header.length as usize;
    if record.len() < end {
        return Err(ArchiveError::Decode(format!(
            "body shorter than declared length: {} < {}",
            record.len() - COMMON_HEADER_LEN,
            header.length
        )));
    }
    let mut r = ByteReader::new(&record[COMMON_HEADER_LEN..end]);

    // BGP4MP_ET prefixes the body with 4 bytes of microseconds.
    if header.mrt_type == BGP4MP_ET {
        r.take(4)?;
    }

    let as_width = if header.subtype == BGP4MP_MESSAGE_AS4 { 4 } else { 2 };
    let peer_as = r.asn(as_width)?;
    let local_as = r.asn(as_width)?;
    let interface = r.u16_be()?;
    let afi = r.u16_be()?;
    let addr_len = match afi {
        1 => 4,
        2 => 16,
        other => {
            return Err(ArchiveError::Decode(format!("unknown AFI {other} in BGP4MP body")));
        }
    };
    r.take(addr_len)?; // peer address
    r.take(addr_len)?; // local address

    let message = parse_bgp_message(&mut r)?;
    Ok(MrtBody::Bgp4mp(Bgp4mp { peer_as, local_as, interface, afi, message }))
}

fn parse_bgp_message(r: &mut ByteReader<'_>) -> Result<BgpMessage, ArchiveError> {
    r.take(16)?; // marker
    let msg_len = r.u16_be()? as usize;
    let msg_type = r.u8()?;
    if msg_len < BGP_HEADER_LEN {
        return Err(ArchiveError::Decode(format!("BGP message length {msg_len} below header size")));
    }
    let payload = r.take(msg_len - BGP_HEADER_LEN)?;
    if msg_type != BGP_UPDATE {
        return Ok(BgpMessage::Other(msg_type));
    }

    let mut u = ByteReader::new(payload);
    let mut update = BgpUpdate::default();

    let withdrawn_len = u.u16_be()? as usize;
    let mut w = ByteReader::new(u.take(withdrawn_len)?);
    while !w.is_empty() {
        update.withdrawn_routes.push(w.prefix()?);
    }

    let attrs_len = u.u16_be()? as usize;
    let mut a = ByteReader::new(u.take(attrs_len)?);
    while !a.is_empty() {
        let flags = a.u8()?;
        let type_code = a.u8()?;
        let len = if flags & ATTR_FLAG_EXTENDED_LENGTH != 0 {
            a.u16_be()? as usize
        } else {
            a.u8()? as usize
        };
        let value = a.take(len)?.to_vec();
        update.path_attributes.push(PathAttribute { flags, type_code, value });
    }

    // NLRI fills the rest of the UPDATE.
    while !u.is_empty() {
        update.nlri.push(u.prefix()?);
    }

    Ok(BgpMessage::Update(update))
}

// ---------------------------------------------------------------------------
// Bounds-checked byte cursor
// ---------------------------------------------------------------------------

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ArchiveError> {
        if self.pos + n > self.buf.len() {
            return Err(ArchiveError::Decode(format!(
                "unexpected end of data: wanted {n} bytes, {} left",
                self.buf.len() - self.pos
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ArchiveError> {
        Ok(self.take(1)?[0])
    }

    fn u16_be(&mut self) -> Result<u16, ArchiveError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32_be(&mut self) -> Result<u32, ArchiveError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// An AS number of the given wire width (2 for classic, 4 for AS4).
    fn asn(&mut self, width: usize) -> Result<u32, ArchiveError> {
        if width == 4 {
            self.u32_be()
        } else {
            Ok(u32::from(self.u16_be()?))
        }
    }

    /// An NLRI-encoded prefix: bit length, then ceil(bits/8) octets.
    fn prefix(&mut self) -> Result<Prefix, ArchiveError> {
        let bits = self.u8()?;
        if bits > 128 {
            return Err(ArchiveError::Decode(format!("prefix length {bits} out of range")));
        }
        let octets = self.take((usize::from(bits) + 7) / 8)?.to_vec();
        Ok(Prefix { bits, octets })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
