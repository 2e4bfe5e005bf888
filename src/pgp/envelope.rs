//! Message layers and the packets that carry them
//!
//! A message is read one layer at a time: [`Layer::parse`] looks at a packet
//! sequence and says which layer it is; the engine peels that layer and
//! parses whatever it contained.

use super::crypto::{CompressionAlgorithm, SymmetricAlgorithm};
use super::key::{KeyId, PublicKey};
use super::packet::{Packet, Reader, Tag, write_mpi};
use super::signature::{OnePassSignature, SignaturePacket};
use crate::error::PgpError;
use flate2::Compression;
use flate2::read::{DeflateDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, ZlibEncoder};
use rand::RngCore;
use sha1::Sha1;
use sha2::Digest;
use std::io::{Read, Write};

const SEIPD_VERSION: u8 = 1;
const MDC_HEADER: [u8; 2] = [0xD3, 0x14];
const MDC_LEN: usize = 22;

/// Public-key encrypted session key (version 3)
#[derive(Clone, Debug)]
pub(crate) struct Pkesk {
    pub recipient: KeyId,
    pub algorithm: u8,
    pub wrapped: Vec<u8>,
}

impl Pkesk {
    pub(crate) fn parse(body: &[u8]) -> Result<Self, PgpError> {
        let mut reader = Reader::new(body);
        let version = reader.u8()?;
        if version != 3 {
            return Err(PgpError::MalformedPacket(format!(
                "unsupported session key packet version {version}"
            )));
        }
        let recipient = KeyId(reader.array()?);
        let algorithm = reader.u8()?;
        let wrapped = match algorithm {
            1..=3 => reader.mpi()?.to_vec(),
            // Kept opaque; no key we hold can open it
            _ => reader.rest().to_vec(),
        };
        Ok(Self {
            recipient,
            algorithm,
            wrapped,
        })
    }

    pub(crate) fn for_recipient(
        recipient: &PublicKey,
        cipher: SymmetricAlgorithm,
        session_key: &[u8],
    ) -> Result<Packet, PgpError> {
        let wrapped = recipient.encrypt_session_key(cipher, session_key)?;
        let mut body = vec![3];
        body.extend_from_slice(&recipient.key_id().0);
        body.push(recipient.algorithm());
        write_mpi(&mut body, &wrapped);
        Ok(Packet::new(Tag::PublicKeyEncryptedSessionKey, body))
    }
}

/// Literal data packet contents
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct LiteralData {
    pub format: u8,
    pub file_name: String,
    pub modified: u32,
    pub data: Vec<u8>,
}

impl LiteralData {
    pub(crate) fn binary(data: &[u8], file_name: &str, modified: u32) -> Self {
        // The name field is length-prefixed by a single byte
        let mut end = file_name.len().min(255);
        while !file_name.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            format: b'b',
            file_name: file_name[..end].to_string(),
            modified,
            data: data.to_vec(),
        }
    }

    pub(crate) fn parse(body: &[u8]) -> Result<Self, PgpError> {
        let mut reader = Reader::new(body);
        let format = reader.u8()?;
        let name_len = usize::from(reader.u8()?);
        let file_name = String::from_utf8_lossy(reader.take(name_len)?).into_owned();
        let modified = reader.u32()?;
        Ok(Self {
            format,
            file_name,
            modified,
            data: reader.rest().to_vec(),
        })
    }

    pub(crate) fn to_packet(&self) -> Packet {
        let mut body = Vec::with_capacity(self.data.len() + self.file_name.len() + 6);
        body.push(self.format);
        body.push(self.file_name.len() as u8);
        body.extend_from_slice(self.file_name.as_bytes());
        body.extend_from_slice(&self.modified.to_be_bytes());
        body.extend_from_slice(&self.data);
        Packet::new(Tag::LiteralData, body)
    }
}

/// The outermost layer of a packet sequence
#[derive(Debug)]
pub(crate) enum Layer {
    /// Obsolete marker packet in front of the real message
    Marker { rest: Vec<Packet> },
    /// Session key packets followed by one encrypted data packet
    Encrypted {
        recipients: Vec<Pkesk>,
        integrity_protected: bool,
        body: Vec<u8>,
    },
    /// Compressed data packet; the body still carries the algorithm byte
    Compressed { body: Vec<u8> },
    /// Signature layer around literal data
    Signed {
        one_pass: Option<OnePassSignature>,
        signature: Box<SignaturePacket>,
        literal: LiteralData,
    },
    /// Bare literal data
    Literal(LiteralData),
}

impl Layer {
    pub(crate) fn parse(packets: Vec<Packet>) -> Result<Self, PgpError> {
        let first = packets
            .first()
            .map(|p| p.tag)
            .ok_or_else(|| PgpError::MalformedEnvelope("empty message".into()))?;

        match first {
            Tag::Marker => Ok(Layer::Marker {
                rest: packets.into_iter().skip(1).collect(),
            }),
            // Tag 3 is a passphrase-encrypted session key
            Tag::PublicKeyEncryptedSessionKey | Tag::Unknown(3) => parse_encrypted(packets),
            Tag::SymEncryptedIntegrityProtectedData | Tag::SymmetricallyEncryptedData => Err(
                PgpError::MalformedEnvelope("encrypted data without a session key packet".into()),
            ),
            Tag::CompressedData => {
                let packet = single(packets, "compressed data")?;
                Ok(Layer::Compressed { body: packet.body })
            }
            Tag::OnePassSignature => parse_one_pass_signed(packets),
            Tag::Signature => parse_prefix_signed(packets),
            Tag::LiteralData => {
                let packet = single(packets, "literal data")?;
                Ok(Layer::Literal(LiteralData::parse(&packet.body)?))
            }
            other => Err(PgpError::MalformedEnvelope(format!(
                "unexpected {other:?} packet at start of message"
            ))),
        }
    }
}

fn single(packets: Vec<Packet>, what: &str) -> Result<Packet, PgpError> {
    let count = packets.len();
    let mut iter = packets.into_iter();
    match (iter.next(), count) {
        (Some(packet), 1) => Ok(packet),
        _ => Err(PgpError::MalformedEnvelope(format!(
            "{what} packet followed by {} more packets",
            count.saturating_sub(1)
        ))),
    }
}

fn parse_encrypted(packets: Vec<Packet>) -> Result<Layer, PgpError> {
    let mut recipients = Vec::new();
    let mut data: Option<Packet> = None;

    for packet in packets {
        match packet.tag {
            Tag::PublicKeyEncryptedSessionKey if data.is_none() => {
                recipients.push(Pkesk::parse(&packet.body)?)
            }
            Tag::Unknown(3) if data.is_none() => {}
            Tag::SymEncryptedIntegrityProtectedData | Tag::SymmetricallyEncryptedData
                if data.is_none() =>
            {
                data = Some(packet)
            }
            other => {
                return Err(PgpError::MalformedEnvelope(format!(
                    "unexpected {other:?} packet in encrypted message"
                )));
            }
        }
    }

    let data = data.ok_or_else(|| {
        PgpError::MalformedEnvelope("session key packets without encrypted data".into())
    })?;
    Ok(Layer::Encrypted {
        recipients,
        integrity_protected: data.tag == Tag::SymEncryptedIntegrityProtectedData,
        body: data.body,
    })
}

fn parse_one_pass_signed(packets: Vec<Packet>) -> Result<Layer, PgpError> {
    let mut headers = Vec::new();
    let mut literal = None;
    let mut signatures = Vec::new();

    for packet in packets {
        match (packet.tag, literal.is_some()) {
            (Tag::OnePassSignature, false) => headers.push(OnePassSignature::parse(&packet.body)?),
            (Tag::LiteralData, false) => literal = Some(LiteralData::parse(&packet.body)?),
            (Tag::Signature, true) => signatures.push(SignaturePacket::parse(&packet.body)?),
            (other, _) => {
                return Err(PgpError::MalformedEnvelope(format!(
                    "unexpected {other:?} packet in signed message"
                )));
            }
        }
    }

    let literal =
        literal.ok_or_else(|| PgpError::MalformedEnvelope("signed message has no literal data".into()))?;
    if signatures.len() != headers.len() {
        return Err(PgpError::MalformedEnvelope(format!(
            "{} one-pass signature headers but {} signatures",
            headers.len(),
            signatures.len()
        )));
    }
    // Headers and signatures nest: the last header pairs with the first signature
    let one_pass = headers.pop();
    let signature = signatures
        .into_iter()
        .next()
        .ok_or_else(|| PgpError::MalformedEnvelope("signed message has no signature".into()))?;

    Ok(Layer::Signed {
        one_pass,
        signature: Box::new(signature),
        literal,
    })
}

fn parse_prefix_signed(packets: Vec<Packet>) -> Result<Layer, PgpError> {
    let mut signatures = Vec::new();
    let mut literal = None;

    for packet in packets {
        match (packet.tag, literal.is_some()) {
            (Tag::Signature, false) => signatures.push(SignaturePacket::parse(&packet.body)?),
            (Tag::LiteralData, false) => literal = Some(LiteralData::parse(&packet.body)?),
            (other, _) => {
                return Err(PgpError::MalformedEnvelope(format!(
                    "unexpected {other:?} packet in signed message"
                )));
            }
        }
    }

    let literal =
        literal.ok_or_else(|| PgpError::MalformedEnvelope("signed message has no literal data".into()))?;
    let signature = signatures
        .into_iter()
        .next()
        .ok_or_else(|| PgpError::MalformedEnvelope("signed message has no signature".into()))?;

    Ok(Layer::Signed {
        one_pass: None,
        signature: Box::new(signature),
        literal,
    })
}

/// Random prefix whose last two bytes are repeated as the quick check
fn random_prefix(block_size: usize) -> Vec<u8> {
    let mut prefix = vec![0u8; block_size + 2];
    rand::thread_rng().fill_bytes(&mut prefix[..block_size]);
    prefix[block_size] = prefix[block_size - 2];
    prefix[block_size + 1] = prefix[block_size - 1];
    prefix
}

/// Integrity protected data packet: CFB over `prefix || data || MDC`
pub(crate) fn seal_protected(
    cipher: SymmetricAlgorithm,
    key: &[u8],
    plaintext: &[u8],
) -> Result<Packet, PgpError> {
    let bs = cipher.block_size();
    let mut buf = random_prefix(bs);
    buf.reserve(plaintext.len() + MDC_LEN);
    buf.extend_from_slice(plaintext);
    buf.extend_from_slice(&MDC_HEADER);
    let mdc = Sha1::digest(&buf);
    buf.extend_from_slice(&mdc);

    cipher.cfb_encrypt(key, &vec![0u8; bs], &mut buf)?;

    let mut body = Vec::with_capacity(buf.len() + 1);
    body.push(SEIPD_VERSION);
    body.extend_from_slice(&buf);
    Ok(Packet::new(Tag::SymEncryptedIntegrityProtectedData, body))
}

/// Decrypt an integrity protected data packet body
///
/// The modification detection code is checked before any of the content is
/// returned. Every failure past the version byte is an integrity failure.
pub(crate) fn open_protected(
    cipher: SymmetricAlgorithm,
    key: &[u8],
    body: &[u8],
) -> Result<Vec<u8>, PgpError> {
    let (&version, ciphertext) = body
        .split_first()
        .ok_or_else(|| PgpError::MalformedPacket("empty encrypted data packet".into()))?;
    if version != SEIPD_VERSION {
        return Err(PgpError::MalformedPacket(format!(
            "unsupported encrypted data version {version}"
        )));
    }

    let bs = cipher.block_size();
    if ciphertext.len() < bs + 2 + MDC_LEN {
        return Err(PgpError::IntegrityCheckFailed);
    }

    let mut buf = ciphertext.to_vec();
    cipher.cfb_decrypt(key, &vec![0u8; bs], &mut buf)?;

    if buf[bs - 2..bs] != buf[bs..bs + 2] {
        return Err(PgpError::IntegrityCheckFailed);
    }
    let hash_at = buf.len() - 20;
    if buf[hash_at - 2..hash_at] != MDC_HEADER {
        return Err(PgpError::IntegrityCheckFailed);
    }
    if Sha1::digest(&buf[..hash_at]).as_slice() != &buf[hash_at..] {
        return Err(PgpError::IntegrityCheckFailed);
    }

    buf.truncate(hash_at - 2);
    buf.drain(..bs + 2);
    Ok(buf)
}

/// Legacy encrypted data packet without integrity protection
pub(crate) fn seal_legacy(
    cipher: SymmetricAlgorithm,
    key: &[u8],
    plaintext: &[u8],
) -> Result<Packet, PgpError> {
    let mut buf = random_prefix(cipher.block_size());
    buf.extend_from_slice(plaintext);
    cipher.cfb_resync_encrypt(key, &mut buf)?;
    Ok(Packet::new(Tag::SymmetricallyEncryptedData, buf))
}

pub(crate) fn open_legacy(
    cipher: SymmetricAlgorithm,
    key: &[u8],
    body: &[u8],
) -> Result<Vec<u8>, PgpError> {
    let bs = cipher.block_size();
    let mut buf = body.to_vec();
    cipher.cfb_resync_decrypt(key, &mut buf)?;
    if buf[bs - 2..bs] != buf[bs..bs + 2] {
        return Err(PgpError::Crypto(
            "session key quick check failed on unprotected data".into(),
        ));
    }
    buf.drain(..bs + 2);
    Ok(buf)
}

/// Wrap serialized packets in a compressed data packet
pub(crate) fn compress(algorithm: CompressionAlgorithm, data: &[u8]) -> Result<Packet, PgpError> {
    let io_err = |e: std::io::Error| PgpError::Decompression(format!("compression failed: {e}"));
    let mut body = vec![algorithm.id()];
    match algorithm {
        CompressionAlgorithm::Uncompressed => body.extend_from_slice(data),
        CompressionAlgorithm::Zip => {
            let mut encoder = DeflateEncoder::new(body, Compression::default());
            encoder.write_all(data).map_err(io_err)?;
            body = encoder.finish().map_err(io_err)?;
        }
        CompressionAlgorithm::Zlib => {
            let mut encoder = ZlibEncoder::new(body, Compression::default());
            encoder.write_all(data).map_err(io_err)?;
            body = encoder.finish().map_err(io_err)?;
        }
    }
    Ok(Packet::new(Tag::CompressedData, body))
}

/// Inflate a compressed data packet body, refusing output past `limit` bytes
pub(crate) fn decompress(body: &[u8], limit: u64) -> Result<Vec<u8>, PgpError> {
    let (&id, data) = body
        .split_first()
        .ok_or_else(|| PgpError::MalformedPacket("empty compressed data packet".into()))?;
    let algorithm = CompressionAlgorithm::from_id(id)?;
    let reader: Box<dyn Read + '_> = match algorithm {
        CompressionAlgorithm::Uncompressed => Box::new(data),
        CompressionAlgorithm::Zip => Box::new(DeflateDecoder::new(data)),
        CompressionAlgorithm::Zlib => Box::new(ZlibDecoder::new(data)),
    };

    let mut out = Vec::new();
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| PgpError::Decompression(e.to_string()))?;
    if out.len() as u64 > limit {
        return Err(PgpError::DecompressionLimit { limit });
    }
    Ok(out)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protected_data_opens_with_the_same_key() {
        let cipher = SymmetricAlgorithm::Aes128;
        let key = cipher.random_key();
        let packet = seal_protected(cipher, &key, b"hello, world").unwrap();
        assert_eq!(packet.tag, Tag::SymEncryptedIntegrityProtectedData);
        assert_eq!(open_protected(cipher, &key, &packet.body).unwrap(), b"hello, world");
    }

    #[test]
    fn protected_data_detects_every_flipped_byte() {
        let cipher = SymmetricAlgorithm::Aes256;
        let key = cipher.random_key();
        let packet = seal_protected(cipher, &key, b"col1,col2\n1,2\n").unwrap();

        for i in 1..packet.body.len() {
            let mut body = packet.body.clone();
            body[i] ^= 0x01;
            assert!(
                matches!(
                    open_protected(cipher, &key, &body),
                    Err(PgpError::IntegrityCheckFailed)
                ),
                "flip at offset {i} went undetected"
            );
        }
    }

    #[test]
    fn truncated_protected_data_fails_integrity() {
        let cipher = SymmetricAlgorithm::Aes256;
        let key = cipher.random_key();
        let packet = seal_protected(cipher, &key, b"data").unwrap();
        let short = &packet.body[..packet.body.len() - 5];
        assert!(matches!(
            open_protected(cipher, &key, short),
            Err(PgpError::IntegrityCheckFailed)
        ));
    }

    #[test]
    fn legacy_data_round_trips_and_rejects_wrong_key() {
        let cipher = SymmetricAlgorithm::Aes256;
        let key = cipher.random_key();
        let packet = seal_legacy(cipher, &key, b"no mdc here").unwrap();
        assert_eq!(open_legacy(cipher, &key, &packet.body).unwrap(), b"no mdc here");

        // A wrong key passes the two-byte quick check once in 65536 tries
        let other = cipher.random_key();
        let result = open_legacy(cipher, &other, &packet.body);
        assert!(result.is_err() || result.unwrap() != b"no mdc here");
    }

    #[test]
    fn compression_round_trips_for_each_algorithm() {
        let data = b"abcabcabcabcabcabcabcabcabcabc".repeat(100);
        for algorithm in [
            CompressionAlgorithm::Uncompressed,
            CompressionAlgorithm::Zip,
            CompressionAlgorithm::Zlib,
        ] {
            let packet = compress(algorithm, &data).unwrap();
            assert_eq!(packet.body[0], algorithm.id());
            assert_eq!(decompress(&packet.body, 1 << 20).unwrap(), data, "{algorithm:?}");
        }
    }

    #[test]
    fn decompression_stops_at_the_limit() {
        let bomb = vec![0u8; 100_000];
        let packet = compress(CompressionAlgorithm::Zip, &bomb).unwrap();
        assert!(packet.body.len() < 1_000);
        assert!(matches!(
            decompress(&packet.body, 10_000),
            Err(PgpError::DecompressionLimit { limit: 10_000 })
        ));
        assert_eq!(decompress(&packet.body, 100_000).unwrap().len(), 100_000);
    }

    #[test]
    fn literal_packet_round_trips_and_truncates_long_names() {
        let literal = LiteralData::binary(b"payload", "report.csv", 1_700_000_000);
        let parsed = LiteralData::parse(&literal.to_packet().body).unwrap();
        assert_eq!(parsed, literal);

        let long = "x".repeat(300);
        assert_eq!(LiteralData::binary(b"", &long, 0).file_name.len(), 255);
    }

    #[test]
    fn layer_shapes() {
        let literal = LiteralData::binary(b"x", "", 0).to_packet();
        let marker = Packet::new(Tag::Marker, b"PGP".to_vec());

        assert!(matches!(
            Layer::parse(vec![literal.clone()]).unwrap(),
            Layer::Literal(_)
        ));
        match Layer::parse(vec![marker, literal.clone()]).unwrap() {
            Layer::Marker { rest } => assert_eq!(rest, vec![literal.clone()]),
            other => panic!("expected marker layer, got {other:?}"),
        }
        assert!(matches!(
            Layer::parse(vec![]),
            Err(PgpError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            Layer::parse(vec![literal.clone(), literal.clone()]),
            Err(PgpError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            Layer::parse(vec![Packet::new(Tag::UserId, b"uid".to_vec())]),
            Err(PgpError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            Layer::parse(vec![Packet::new(
                Tag::SymEncryptedIntegrityProtectedData,
                vec![1, 2, 3]
            )]),
            Err(PgpError::MalformedEnvelope(_))
        ));
    }
}
