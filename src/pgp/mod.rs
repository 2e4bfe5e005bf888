//! OpenPGP engine
//!
//! A pure transform over byte buffers and key material, covering the RFC 4880
//! subset the pipeline needs: RSA keys, AES session keys, integrity protected
//! data, ZIP/ZLIB compression and version 4 signatures.
//!
//! The engine holds only its algorithm choices. Keys are passed in on every
//! call, so one [`PgpEngine`] can be shared freely between workers.
//!
//! ```no_run
//! use secure_ingest::pgp::{EncryptOptions, KeyPair, PgpEngine};
//!
//! # fn main() -> Result<(), secure_ingest::PgpError> {
//! let recipient = KeyPair::generate("Recipient <r@example.com>", 2048, "secret")?;
//! let ring = recipient.secret_ring()?;
//! let public = ring.encryption_key(None)?;
//!
//! let engine = PgpEngine::default();
//! let envelope = engine.sign_and_encrypt(b"hello", public, None, &EncryptOptions::default())?;
//! let decrypted = engine.decrypt(&envelope, &ring, "secret")?;
//! # Ok(())
//! # }
//! ```

pub mod armor;
mod crypto;
mod envelope;
mod key;
mod packet;
mod signature;

pub use crypto::{CompressionAlgorithm, HashAlgorithm, SymmetricAlgorithm};
pub use key::{
    Fingerprint, KeyEntry, KeyFlags, KeyId, KeyPair, KeyRing, PublicKey, SecretKey, UnlockedKey,
};

use crate::config::KeyConfig;
use crate::error::PgpError;
use crate::types::Verification;
use armor::ArmorKind;
use chrono::{DateTime, Utc};
use envelope::{Layer, LiteralData, Pkesk};
use packet::{read_packets, write_packets};
use signature::{OnePassSignature, SIG_BINARY, SignaturePacket};
use zeroize::Zeroizing;

/// Algorithm choices and safety limits
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Cipher for new session keys (default: AES-256)
    pub symmetric: SymmetricAlgorithm,
    /// Compression for outgoing messages (default: ZIP)
    pub compression: CompressionAlgorithm,
    /// Signature digest (default: SHA-256)
    pub hash: HashAlgorithm,
    /// Ceiling on decompressed output per compressed layer (default: 1 GiB)
    pub max_decompressed_bytes: u64,
    /// Maximum number of nested layers (default: 8)
    pub max_depth: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            symmetric: SymmetricAlgorithm::Aes256,
            compression: CompressionAlgorithm::Zip,
            hash: HashAlgorithm::Sha256,
            max_decompressed_bytes: 1024 * 1024 * 1024,
            max_depth: 8,
        }
    }
}

impl EngineOptions {
    /// Defaults with the decompression ceiling from configuration
    pub fn from_config(config: &KeyConfig) -> Self {
        Self {
            max_decompressed_bytes: config.max_decompressed_bytes,
            ..Self::default()
        }
    }
}

/// Per-message options for producing envelopes
#[derive(Clone, Debug)]
pub struct EncryptOptions {
    /// Wrap the output in ASCII armor (default: false)
    pub armor: bool,
    /// Append a modification detection code (default: true)
    pub with_integrity: bool,
    /// File name recorded in the literal data packet (default: empty)
    pub file_name: String,
    /// Timestamp recorded in the literal data packet (default: now)
    pub modified: Option<DateTime<Utc>>,
}

impl Default for EncryptOptions {
    fn default() -> Self {
        Self {
            armor: false,
            with_integrity: true,
            file_name: String::new(),
            modified: None,
        }
    }
}

/// Literal data metadata carried alongside the payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiteralMetadata {
    /// File name recorded by the sender (may be empty)
    pub file_name: String,
    /// Modification time recorded by the sender; `None` when zero
    pub modified: Option<DateTime<Utc>>,
    /// Format octet: `b` binary, `t` text, `u` UTF-8
    pub format: char,
}

/// A successfully decrypted message
#[derive(Clone, Debug)]
pub struct DecryptResult {
    /// Literal payload
    pub plaintext: Vec<u8>,
    /// Signature outcome
    pub verification: Verification,
    /// Issuer of the signature, when the message was signed
    pub signer: Option<KeyId>,
    /// Key that unlocked the session key
    pub recipient: KeyId,
    /// Literal data metadata
    pub literal: LiteralMetadata,
    /// Whether the payload carried a modification detection code
    pub integrity_protected: bool,
}

/// Outcome of [`PgpEngine::decrypt`]
#[derive(Clone, Debug)]
pub enum Decrypted {
    /// The message was decrypted
    Message(DecryptResult),
    /// None of the session key packets targets a key in the ring
    NoMatchingKey {
        /// Key IDs the message was addressed to
        recipients: Vec<KeyId>,
    },
}

impl Decrypted {
    /// Turn a missing key into the crate-level error
    pub fn into_result(self) -> crate::Result<DecryptResult> {
        match self {
            Decrypted::Message(result) => Ok(result),
            Decrypted::NoMatchingKey { recipients } => Err(crate::Error::NoMatchingKey {
                recipients: recipients.iter().map(ToString::to_string).collect(),
            }),
        }
    }
}

/// OpenPGP sign, encrypt, decrypt and verify
#[derive(Clone, Debug, Default)]
pub struct PgpEngine {
    options: EngineOptions,
}

impl PgpEngine {
    /// Create an engine with the given algorithm choices
    pub fn new(options: EngineOptions) -> Self {
        Self { options }
    }

    /// Algorithm choices in effect
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Build `PKESK, SEIPD(Compressed(OPS, Literal, Signature))`
    ///
    /// Without a signer the signature packets are left out. Without
    /// `with_integrity` the legacy unprotected data packet is used.
    pub fn sign_and_encrypt(
        &self,
        plaintext: &[u8],
        recipient: &PublicKey,
        signer: Option<&UnlockedKey>,
        options: &EncryptOptions,
    ) -> Result<Vec<u8>, PgpError> {
        let content = self.signed_content(plaintext, signer, options)?;
        let content = self.compressed(&content)?;

        let cipher = self.options.symmetric;
        let session_key = cipher.random_key();
        let pkesk = Pkesk::for_recipient(recipient, cipher, &session_key)?;
        let data = if options.with_integrity {
            envelope::seal_protected(cipher, &session_key, &content)?
        } else {
            envelope::seal_legacy(cipher, &session_key, &content)?
        };

        Ok(finish(write_packets(&[pkesk, data]), options.armor))
    }

    /// Build a compressed one-pass-signed message without encryption
    pub fn sign(
        &self,
        plaintext: &[u8],
        signer: &UnlockedKey,
        options: &EncryptOptions,
    ) -> Result<Vec<u8>, PgpError> {
        let content = self.signed_content(plaintext, Some(signer), options)?;
        Ok(finish(self.compressed(&content)?, options.armor))
    }

    fn signed_content(
        &self,
        plaintext: &[u8],
        signer: Option<&UnlockedKey>,
        options: &EncryptOptions,
    ) -> Result<Vec<u8>, PgpError> {
        let now = Utc::now();
        let modified = options.modified.unwrap_or(now);
        let literal = LiteralData::binary(
            plaintext,
            &options.file_name,
            u32::try_from(modified.timestamp()).unwrap_or(0),
        );

        let Some(signer) = signer else {
            return Ok(literal.to_packet().to_bytes());
        };

        let created = u32::try_from(now.timestamp()).unwrap_or(0);
        let sig = SignaturePacket::sign(signer, SIG_BINARY, self.options.hash, created, &[], |h| {
            h.update(&literal.data)
        })?;
        let ops = OnePassSignature::for_signature(&sig, signer.key_id());
        Ok(write_packets(&[
            ops.to_packet(),
            literal.to_packet(),
            sig.to_packet(),
        ]))
    }

    fn compressed(&self, content: &[u8]) -> Result<Vec<u8>, PgpError> {
        match self.options.compression {
            CompressionAlgorithm::Uncompressed => Ok(content.to_vec()),
            algorithm => Ok(envelope::compress(algorithm, content)?.to_bytes()),
        }
    }

    /// Decrypt a message and verify any signature inside it
    ///
    /// A message addressed only to keys missing from `ring` yields
    /// [`Decrypted::NoMatchingKey`] rather than an error. Tampering is
    /// reported as [`PgpError::IntegrityCheckFailed`], distinct from every
    /// parse error.
    pub fn decrypt(
        &self,
        message: &[u8],
        ring: &KeyRing,
        passphrase: &str,
    ) -> Result<Decrypted, PgpError> {
        let data = armor::dearmor(message)?;
        let mut packets = read_packets(&data)?;
        let mut session: Option<(KeyId, bool)> = None;

        for _ in 0..self.options.max_depth {
            match Layer::parse(packets)? {
                Layer::Marker { rest } => packets = rest,
                Layer::Encrypted {
                    recipients,
                    integrity_protected,
                    body,
                } => {
                    if session.is_some() {
                        return Err(PgpError::MalformedEnvelope(
                            "nested encryption layer".into(),
                        ));
                    }
                    let Some((recipient, cipher, key)) =
                        open_session_key(&recipients, ring, passphrase)?
                    else {
                        return Ok(Decrypted::NoMatchingKey {
                            recipients: recipients.iter().map(|p| p.recipient).collect(),
                        });
                    };
                    let content = if integrity_protected {
                        envelope::open_protected(cipher, &key, &body)?
                    } else {
                        tracing::warn!(
                            recipient = %recipient,
                            "message has no integrity protection; tampering cannot be detected"
                        );
                        envelope::open_legacy(cipher, &key, &body)?
                    };
                    session = Some((recipient, integrity_protected));
                    packets = read_packets(&content)?;
                }
                Layer::Compressed { body } => {
                    require_encrypted(session)?;
                    let content = envelope::decompress(&body, self.options.max_decompressed_bytes)?;
                    packets = read_packets(&content)?;
                }
                Layer::Signed {
                    one_pass,
                    signature,
                    literal,
                } => {
                    let (recipient, integrity_protected) = require_encrypted(session)?;
                    let (verification, signer) =
                        check_signature(&signature, one_pass.as_ref(), &literal, ring)?;
                    return Ok(Decrypted::Message(result(
                        literal,
                        verification,
                        signer,
                        recipient,
                        integrity_protected,
                    )));
                }
                Layer::Literal(literal) => {
                    let (recipient, integrity_protected) = require_encrypted(session)?;
                    return Ok(Decrypted::Message(result(
                        literal,
                        Verification::Unsigned,
                        None,
                        recipient,
                        integrity_protected,
                    )));
                }
            }
        }

        Err(PgpError::MalformedEnvelope(format!(
            "message nests deeper than {} layers",
            self.options.max_depth
        )))
    }

    /// Check a signed (not encrypted) message against one public key
    ///
    /// Returns `false` when the signature does not match or was issued by a
    /// different key. A message with no signature layer is malformed.
    pub fn verify(&self, message: &[u8], public_key: &PublicKey) -> Result<bool, PgpError> {
        let data = armor::dearmor(message)?;
        let mut packets = read_packets(&data)?;

        for _ in 0..self.options.max_depth {
            match Layer::parse(packets)? {
                Layer::Marker { rest } => packets = rest,
                Layer::Compressed { body } => {
                    let content = envelope::decompress(&body, self.options.max_decompressed_bytes)?;
                    packets = read_packets(&content)?;
                }
                Layer::Signed {
                    one_pass,
                    signature,
                    literal,
                } => {
                    let issuer = signature.issuer().or(one_pass.map(|o| o.issuer));
                    if issuer.is_some_and(|id| id != public_key.key_id()) {
                        return Ok(false);
                    }
                    return verify_literal(&signature, public_key, &literal);
                }
                Layer::Literal(_) => {
                    return Err(PgpError::MalformedEnvelope("message is not signed".into()));
                }
                Layer::Encrypted { .. } => {
                    return Err(PgpError::MalformedEnvelope(
                        "message is encrypted; decrypt it before verifying".into(),
                    ));
                }
            }
        }

        Err(PgpError::MalformedEnvelope(format!(
            "message nests deeper than {} layers",
            self.options.max_depth
        )))
    }
}

fn finish(data: Vec<u8>, armored: bool) -> Vec<u8> {
    if armored {
        armor::encode(ArmorKind::Message, &data).into_bytes()
    } else {
        data
    }
}

fn require_encrypted(session: Option<(KeyId, bool)>) -> Result<(KeyId, bool), PgpError> {
    session.ok_or_else(|| PgpError::MalformedEnvelope("message is not encrypted".into()))
}

fn result(
    literal: LiteralData,
    verification: Verification,
    signer: Option<KeyId>,
    recipient: KeyId,
    integrity_protected: bool,
) -> DecryptResult {
    DecryptResult {
        literal: LiteralMetadata {
            file_name: literal.file_name,
            modified: match literal.modified {
                0 => None,
                secs => DateTime::from_timestamp(i64::from(secs), 0),
            },
            format: char::from(literal.format),
        },
        plaintext: literal.data,
        verification,
        signer,
        recipient,
        integrity_protected,
    }
}

/// First session key packet addressed to a secret key in the ring
///
/// Wildcard recipients are tried against every decryption key; a key that
/// unlocks but cannot open the session key is passed over.
fn open_session_key(
    recipients: &[Pkesk],
    ring: &KeyRing,
    passphrase: &str,
) -> Result<Option<(KeyId, SymmetricAlgorithm, Zeroizing<Vec<u8>>)>, PgpError> {
    for pkesk in recipients {
        if pkesk.recipient.is_wildcard() {
            for secret in ring.decryption_keys() {
                let unlocked = secret.unlock(passphrase)?;
                if let Ok((cipher, key)) = unlocked.decrypt_session_key(&pkesk.wrapped) {
                    return Ok(Some((secret.key_id(), cipher, key)));
                }
            }
            continue;
        }
        if let Some(secret) = ring.secret_key(&pkesk.recipient) {
            let unlocked = secret.unlock(passphrase)?;
            let (cipher, key) = unlocked.decrypt_session_key(&pkesk.wrapped)?;
            return Ok(Some((pkesk.recipient, cipher, key)));
        }
    }
    Ok(None)
}

fn check_signature(
    signature: &SignaturePacket,
    one_pass: Option<&OnePassSignature>,
    literal: &LiteralData,
    ring: &KeyRing,
) -> Result<(Verification, Option<KeyId>), PgpError> {
    let Some(issuer) = signature.issuer().or(one_pass.map(|o| o.issuer)) else {
        return Ok((Verification::NoMatchingKey, None));
    };
    let Some(key) = ring.public_key(&issuer) else {
        return Ok((Verification::NoMatchingKey, Some(issuer)));
    };
    let verification = if verify_literal(signature, key, literal)? {
        Verification::Verified
    } else {
        Verification::SignatureMismatch
    };
    Ok((verification, Some(issuer)))
}

fn verify_literal(
    signature: &SignaturePacket,
    key: &PublicKey,
    literal: &LiteralData,
) -> Result<bool, PgpError> {
    let mut hash_result = Ok(());
    let valid = signature.verify(key, |h| {
        hash_result = signature.hash_document(h, &literal.data);
    })?;
    hash_result?;
    Ok(valid)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod tests;
