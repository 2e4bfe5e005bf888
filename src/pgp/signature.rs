//! Version 4 signatures and one-pass signature headers (RFC 4880 §5.2, §5.4)

use super::crypto::{HashAlgorithm, Hasher};
use super::key::{Fingerprint, KeyId, PublicKey, UnlockedKey};
use super::packet::{Packet, Reader, Tag, write_mpi};
use crate::error::PgpError;

/// Signature of a binary document
pub(crate) const SIG_BINARY: u8 = 0x00;
/// Signature of a canonical text document
pub(crate) const SIG_TEXT: u8 = 0x01;
/// Positive certification of a user ID
pub(crate) const SIG_POSITIVE_CERT: u8 = 0x13;
/// Subkey binding
pub(crate) const SIG_SUBKEY_BINDING: u8 = 0x18;
/// Signature directly on a key
pub(crate) const SIG_DIRECT_KEY: u8 = 0x1F;

const SUB_CREATION_TIME: u8 = 2;
const SUB_PREFERRED_SYMMETRIC: u8 = 11;
const SUB_ISSUER: u8 = 16;
const SUB_PREFERRED_HASH: u8 = 21;
const SUB_PREFERRED_COMPRESSION: u8 = 22;
const SUB_KEY_FLAGS: u8 = 27;
const SUB_ISSUER_FINGERPRINT: u8 = 33;

/// Signature subpacket we know how to write
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Subpacket {
    CreationTime(u32),
    Issuer(KeyId),
    IssuerFingerprint(Fingerprint),
    KeyFlags(u8),
    PreferredSymmetric(Vec<u8>),
    PreferredHash(Vec<u8>),
    PreferredCompression(Vec<u8>),
}

impl Subpacket {
    fn write_to(&self, out: &mut Vec<u8>) {
        let (kind, data): (u8, Vec<u8>) = match self {
            Subpacket::CreationTime(t) => (SUB_CREATION_TIME, t.to_be_bytes().to_vec()),
            Subpacket::Issuer(id) => (SUB_ISSUER, id.0.to_vec()),
            Subpacket::IssuerFingerprint(fp) => {
                let mut data = vec![4];
                data.extend_from_slice(&fp.0);
                (SUB_ISSUER_FINGERPRINT, data)
            }
            Subpacket::KeyFlags(flags) => (SUB_KEY_FLAGS, vec![*flags]),
            Subpacket::PreferredSymmetric(ids) => (SUB_PREFERRED_SYMMETRIC, ids.clone()),
            Subpacket::PreferredHash(ids) => (SUB_PREFERRED_HASH, ids.clone()),
            Subpacket::PreferredCompression(ids) => (SUB_PREFERRED_COMPRESSION, ids.clone()),
        };
        let len = data.len() + 1;
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
        out.push(kind);
        out.extend_from_slice(&data);
    }
}

fn encode_area(subpackets: &[Subpacket]) -> Vec<u8> {
    let mut out = Vec::new();
    for sp in subpackets {
        sp.write_to(&mut out);
    }
    out
}

/// Walk a subpacket area yielding (type, data)
fn subpackets(area: &[u8]) -> Result<Vec<(u8, &[u8])>, PgpError> {
    let mut reader = Reader::new(area);
    let mut out = Vec::new();
    while !reader.is_empty() {
        let first = reader.u8()?;
        let len = match first {
            0..=191 => usize::from(first),
            192..=254 => ((usize::from(first) - 192) << 8) + usize::from(reader.u8()?) + 192,
            255 => reader.u32()? as usize,
        };
        if len == 0 {
            return Err(PgpError::MalformedPacket("empty signature subpacket".into()));
        }
        let kind = reader.u8()? & 0x7F;
        out.push((kind, reader.take(len - 1)?));
    }
    Ok(out)
}

/// A parsed version 4 signature packet
#[derive(Clone, Debug)]
pub(crate) struct SignaturePacket {
    pub sig_type: u8,
    pub pk_algorithm: u8,
    pub hash_id: u8,
    hashed_area: Vec<u8>,
    unhashed_area: Vec<u8>,
    pub left16: [u8; 2],
    pub mpi: Vec<u8>,
}

impl SignaturePacket {
    pub(crate) fn parse(body: &[u8]) -> Result<Self, PgpError> {
        let mut reader = Reader::new(body);
        let version = reader.u8()?;
        if version != 4 {
            return Err(PgpError::MalformedPacket(format!(
                "unsupported signature version {version}"
            )));
        }
        let sig_type = reader.u8()?;
        let pk_algorithm = reader.u8()?;
        let hash_id = reader.u8()?;
        let hashed_len = usize::from(reader.u16()?);
        let hashed_area = reader.take(hashed_len)?.to_vec();
        let unhashed_len = usize::from(reader.u16()?);
        let unhashed_area = reader.take(unhashed_len)?.to_vec();
        let left16 = reader.array()?;
        let mpi = reader.mpi()?.to_vec();

        Ok(Self {
            sig_type,
            pk_algorithm,
            hash_id,
            hashed_area,
            unhashed_area,
            left16,
            mpi,
        })
    }

    pub(crate) fn to_packet(&self) -> Packet {
        let mut body = self.hashed_prefix();
        body.extend_from_slice(&(self.unhashed_area.len() as u16).to_be_bytes());
        body.extend_from_slice(&self.unhashed_area);
        body.extend_from_slice(&self.left16);
        write_mpi(&mut body, &self.mpi);
        Packet::new(Tag::Signature, body)
    }

    /// Version through hashed subpackets: the part covered by the hash
    fn hashed_prefix(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.hashed_area.len());
        out.extend_from_slice(&[4, self.sig_type, self.pk_algorithm, self.hash_id]);
        out.extend_from_slice(&(self.hashed_area.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.hashed_area);
        out
    }

    fn finish_hash(&self, mut hasher: Hasher) -> Vec<u8> {
        let prefix = self.hashed_prefix();
        hasher.update(&prefix);
        hasher.update(&[0x04, 0xFF]);
        hasher.update(&(prefix.len() as u32).to_be_bytes());
        hasher.finalize()
    }

    /// Create a signature over whatever `content` feeds the hasher
    pub(crate) fn sign(
        signer: &UnlockedKey,
        sig_type: u8,
        hash: HashAlgorithm,
        created: u32,
        extra_hashed: &[Subpacket],
        content: impl FnOnce(&mut Hasher),
    ) -> Result<Self, PgpError> {
        let public = signer.public();
        let mut hashed = vec![
            Subpacket::CreationTime(created),
            Subpacket::IssuerFingerprint(public.fingerprint()),
        ];
        hashed.extend_from_slice(extra_hashed);

        let mut sig = Self {
            sig_type,
            pk_algorithm: public.algorithm(),
            hash_id: hash.id(),
            hashed_area: encode_area(&hashed),
            unhashed_area: encode_area(&[Subpacket::Issuer(public.key_id())]),
            left16: [0, 0],
            mpi: Vec::new(),
        };

        let mut hasher = hash.hasher();
        content(&mut hasher);
        let digest = sig.finish_hash(hasher);
        sig.left16 = [digest[0], digest[1]];
        sig.mpi = signer.sign_digest(hash, &digest)?;
        Ok(sig)
    }

    /// Check the signature against `key` over whatever `content` feeds the hasher
    pub(crate) fn verify(
        &self,
        key: &PublicKey,
        content: impl FnOnce(&mut Hasher),
    ) -> Result<bool, PgpError> {
        let hash = HashAlgorithm::from_id(self.hash_id)?;
        let mut hasher = hash.hasher();
        content(&mut hasher);
        let digest = self.finish_hash(hasher);
        if digest[..2] != self.left16 {
            return Ok(false);
        }
        key.verify_digest(hash, &digest, &self.mpi)
    }

    /// Hash a document for this signature's type
    pub(crate) fn hash_document(&self, hasher: &mut Hasher, data: &[u8]) -> Result<(), PgpError> {
        match self.sig_type {
            SIG_BINARY => {
                hasher.update(data);
                Ok(())
            }
            SIG_TEXT => {
                hasher.update(&canonical_text(data));
                Ok(())
            }
            other => Err(PgpError::MalformedEnvelope(format!(
                "signature type {other:#04x} does not sign a document"
            ))),
        }
    }

    fn find(&self, kind: u8, hashed_only: bool) -> Result<Option<Vec<u8>>, PgpError> {
        for (k, data) in subpackets(&self.hashed_area)? {
            if k == kind {
                return Ok(Some(data.to_vec()));
            }
        }
        if !hashed_only {
            for (k, data) in subpackets(&self.unhashed_area)? {
                if k == kind {
                    return Ok(Some(data.to_vec()));
                }
            }
        }
        Ok(None)
    }

    /// Issuer key ID from the issuer or issuer fingerprint subpacket
    pub(crate) fn issuer(&self) -> Option<KeyId> {
        if let Ok(Some(data)) = self.find(SUB_ISSUER, false)
            && let Ok(id) = <[u8; 8]>::try_from(data.as_slice())
        {
            return Some(KeyId(id));
        }
        if let Ok(Some(data)) = self.find(SUB_ISSUER_FINGERPRINT, false)
            && data.len() == 21
            && data[0] == 4
        {
            let mut id = [0u8; 8];
            id.copy_from_slice(&data[13..21]);
            return Some(KeyId(id));
        }
        None
    }

    pub(crate) fn created(&self) -> Option<u32> {
        let data = self.find(SUB_CREATION_TIME, true).ok()??;
        let bytes = <[u8; 4]>::try_from(data.as_slice()).ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub(crate) fn key_flags(&self) -> Option<u8> {
        let data = self.find(SUB_KEY_FLAGS, true).ok()??;
        data.first().copied()
    }
}

/// Convert line endings to CRLF
fn canonical_text(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 32);
    let mut prev = 0u8;
    for &b in data {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

/// One-pass signature header preceding the signed content
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct OnePassSignature {
    pub sig_type: u8,
    pub hash_id: u8,
    pub pk_algorithm: u8,
    pub issuer: KeyId,
    pub last: bool,
}

impl OnePassSignature {
    pub(crate) fn for_signature(sig: &SignaturePacket, issuer: KeyId) -> Self {
        Self {
            sig_type: sig.sig_type,
            hash_id: sig.hash_id,
            pk_algorithm: sig.pk_algorithm,
            issuer,
            last: true,
        }
    }

    pub(crate) fn parse(body: &[u8]) -> Result<Self, PgpError> {
        let mut reader = Reader::new(body);
        let version = reader.u8()?;
        if version != 3 {
            return Err(PgpError::MalformedPacket(format!(
                "unsupported one-pass signature version {version}"
            )));
        }
        Ok(Self {
            sig_type: reader.u8()?,
            hash_id: reader.u8()?,
            pk_algorithm: reader.u8()?,
            issuer: KeyId(reader.array()?),
            last: reader.u8()? != 0,
        })
    }

    pub(crate) fn to_packet(&self) -> Packet {
        let mut body = vec![3, self.sig_type, self.hash_id, self.pk_algorithm];
        body.extend_from_slice(&self.issuer.0);
        body.push(u8::from(self.last));
        Packet::new(Tag::OnePassSignature, body)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_text_adds_cr_once() {
        assert_eq!(canonical_text(b"a\nb\r\nc"), b"a\r\nb\r\nc".to_vec());
        assert_eq!(canonical_text(b""), Vec::<u8>::new());
    }

    #[test]
    fn subpacket_area_round_trips() {
        let area = encode_area(&[
            Subpacket::CreationTime(0x0102_0304),
            Subpacket::Issuer(KeyId([1, 2, 3, 4, 5, 6, 7, 8])),
            Subpacket::KeyFlags(0x03),
        ]);
        let parsed = subpackets(&area).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0], (SUB_CREATION_TIME, &[1u8, 2, 3, 4][..]));
        assert_eq!(parsed[1].0, SUB_ISSUER);
        assert_eq!(parsed[2], (SUB_KEY_FLAGS, &[0x03u8][..]));
    }

    #[test]
    fn critical_bit_is_ignored_when_reading_types() {
        let area = [2u8, 0x80 | SUB_KEY_FLAGS, 0x0C];
        assert_eq!(subpackets(&area).unwrap(), vec![(SUB_KEY_FLAGS, &[0x0Cu8][..])]);
    }

    #[test]
    fn one_pass_header_round_trips() {
        let ops = OnePassSignature {
            sig_type: SIG_BINARY,
            hash_id: 8,
            pk_algorithm: 1,
            issuer: KeyId([9; 8]),
            last: true,
        };
        let packet = ops.to_packet();
        assert_eq!(packet.tag, Tag::OnePassSignature);
        assert_eq!(OnePassSignature::parse(&packet.body).unwrap(), ops);
    }

    #[test]
    fn signature_packet_fields_survive_serialization() {
        let sig = SignaturePacket {
            sig_type: SIG_BINARY,
            pk_algorithm: 1,
            hash_id: 8,
            hashed_area: encode_area(&[Subpacket::CreationTime(42)]),
            unhashed_area: encode_area(&[Subpacket::Issuer(KeyId([7; 8]))]),
            left16: [0xAB, 0xCD],
            mpi: vec![0x01, 0x02, 0x03],
        };
        let parsed = SignaturePacket::parse(&sig.to_packet().body).unwrap();
        assert_eq!(parsed.created(), Some(42));
        assert_eq!(parsed.issuer(), Some(KeyId([7; 8])));
        assert_eq!(parsed.left16, [0xAB, 0xCD]);
        assert_eq!(parsed.mpi, vec![0x01, 0x02, 0x03]);
        assert_eq!(parsed.key_flags(), None);
    }

    #[test]
    fn version_3_signatures_are_rejected() {
        assert!(matches!(
            SignaturePacket::parse(&[3, 0, 0, 0]),
            Err(PgpError::MalformedPacket(_))
        ));
    }
}
