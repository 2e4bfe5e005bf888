//! OpenPGP packet framing (RFC 4880 §4)
//!
//! Reads old- and new-format headers, including partial body lengths and
//! old-format indeterminate lengths. Always writes new-format headers with
//! definite lengths.

use crate::error::PgpError;

/// Packet tag
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Tag {
    PublicKeyEncryptedSessionKey,
    Signature,
    OnePassSignature,
    SecretKey,
    PublicKey,
    SecretSubkey,
    CompressedData,
    SymmetricallyEncryptedData,
    Marker,
    LiteralData,
    Trust,
    UserId,
    PublicSubkey,
    UserAttribute,
    SymEncryptedIntegrityProtectedData,
    ModificationDetectionCode,
    Unknown(u8),
}

impl From<u8> for Tag {
    fn from(value: u8) -> Self {
        match value {
            1 => Tag::PublicKeyEncryptedSessionKey,
            2 => Tag::Signature,
            4 => Tag::OnePassSignature,
            5 => Tag::SecretKey,
            6 => Tag::PublicKey,
            7 => Tag::SecretSubkey,
            8 => Tag::CompressedData,
            9 => Tag::SymmetricallyEncryptedData,
            10 => Tag::Marker,
            11 => Tag::LiteralData,
            12 => Tag::Trust,
            13 => Tag::UserId,
            14 => Tag::PublicSubkey,
            17 => Tag::UserAttribute,
            18 => Tag::SymEncryptedIntegrityProtectedData,
            19 => Tag::ModificationDetectionCode,
            other => Tag::Unknown(other),
        }
    }
}

impl Tag {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Tag::PublicKeyEncryptedSessionKey => 1,
            Tag::Signature => 2,
            Tag::OnePassSignature => 4,
            Tag::SecretKey => 5,
            Tag::PublicKey => 6,
            Tag::SecretSubkey => 7,
            Tag::CompressedData => 8,
            Tag::SymmetricallyEncryptedData => 9,
            Tag::Marker => 10,
            Tag::LiteralData => 11,
            Tag::Trust => 12,
            Tag::UserId => 13,
            Tag::PublicSubkey => 14,
            Tag::UserAttribute => 17,
            Tag::SymEncryptedIntegrityProtectedData => 18,
            Tag::ModificationDetectionCode => 19,
            Tag::Unknown(other) => other,
        }
    }
}

/// A packet with its body reassembled
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Packet {
    pub tag: Tag,
    pub body: Vec<u8>,
}

impl Packet {
    pub(crate) fn new(tag: Tag, body: Vec<u8>) -> Self {
        Self { tag, body }
    }

    /// Serialize with a new-format header
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 6);
        self.write_to(&mut out);
        out
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        out.push(0xC0 | (self.tag.to_u8() & 0x3F));
        write_new_length(out, self.body.len());
        out.extend_from_slice(&self.body);
    }
}

fn write_new_length(out: &mut Vec<u8>, len: usize) {
    if len < 192 {
        out.push(len as u8);
    } else if len < 8384 {
        let v = len - 192;
        out.push(((v >> 8) as u8) + 192);
        out.push((v & 0xFF) as u8);
    } else {
        out.push(0xFF);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
}

/// Split a byte buffer into packets
pub(crate) fn read_packets(data: &[u8]) -> Result<Vec<Packet>, PgpError> {
    let mut reader = Reader::new(data);
    let mut packets = Vec::new();
    while !reader.is_empty() {
        packets.push(read_packet(&mut reader)?);
    }
    Ok(packets)
}

/// Serialize a packet sequence
pub(crate) fn write_packets(packets: &[Packet]) -> Vec<u8> {
    let mut out = Vec::new();
    for packet in packets {
        packet.write_to(&mut out);
    }
    out
}

fn read_packet(reader: &mut Reader<'_>) -> Result<Packet, PgpError> {
    let header = reader.u8()?;
    if header & 0x80 == 0 {
        return Err(PgpError::MalformedPacket(format!(
            "invalid packet header byte {header:#04x}"
        )));
    }

    if header & 0x40 != 0 {
        let tag = Tag::from(header & 0x3F);
        let body = read_new_format_body(reader)?;
        return Ok(Packet { tag, body });
    }

    let tag = Tag::from((header >> 2) & 0x0F);
    let body = match header & 0x03 {
        0 => {
            let len = reader.u8()? as usize;
            reader.take(len)?.to_vec()
        }
        1 => {
            let len = reader.u16()? as usize;
            reader.take(len)?.to_vec()
        }
        2 => {
            let len = reader.u32()? as usize;
            reader.take(len)?.to_vec()
        }
        _ => reader.rest().to_vec(),
    };
    Ok(Packet { tag, body })
}

fn read_new_format_body(reader: &mut Reader<'_>) -> Result<Vec<u8>, PgpError> {
    let mut body = Vec::new();
    loop {
        let first = reader.u8()?;
        match first {
            0..=191 => {
                body.extend_from_slice(reader.take(first as usize)?);
                return Ok(body);
            }
            192..=223 => {
                let second = reader.u8()?;
                let len = ((first as usize - 192) << 8) + second as usize + 192;
                body.extend_from_slice(reader.take(len)?);
                return Ok(body);
            }
            255 => {
                let len = reader.u32()? as usize;
                body.extend_from_slice(reader.take(len)?);
                return Ok(body);
            }
            // Partial body length: more chunks follow
            _ => {
                let len = 1usize << (first & 0x1F);
                body.extend_from_slice(reader.take(len)?);
            }
        }
    }
}

/// Bounds-checked cursor over a byte slice
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], PgpError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                PgpError::MalformedPacket(format!(
                    "unexpected end of data: wanted {n} bytes at offset {}",
                    self.pos
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        slice
    }

    pub(crate) fn u8(&mut self) -> Result<u8, PgpError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, PgpError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, PgpError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], PgpError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Multiprecision integer: 16-bit bit count then big-endian magnitude
    pub(crate) fn mpi(&mut self) -> Result<&'a [u8], PgpError> {
        let bits = self.u16()? as usize;
        self.take(bits.div_ceil(8))
    }
}

/// Append an MPI, stripping leading zero bytes
pub(crate) fn write_mpi(out: &mut Vec<u8>, value: &[u8]) {
    let start = value.iter().position(|b| *b != 0).unwrap_or(value.len());
    let value = &value[start..];
    let bits = match value.first() {
        Some(first) => (value.len() - 1) * 8 + (8 - first.leading_zeros() as usize),
        None => 0,
    };
    out.extend_from_slice(&(bits as u16).to_be_bytes());
    out.extend_from_slice(value);
}

/// Left-pad `value` with zeros to `len` bytes
pub(crate) fn left_pad(value: &[u8], len: usize) -> Vec<u8> {
    if value.len() >= len {
        return value.to_vec();
    }
    let mut out = vec![0u8; len - value.len()];
    out.extend_from_slice(value);
    out
}

/// 16-bit sum of all bytes, used by session keys and unprotected secret keys
pub(crate) fn checksum16(data: &[u8]) -> u16 {
    data.iter()
        .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)))
}
