//! Key material: public and secret keys, key rings and key generation
//!
//! Only RSA keys are understood. Keys with other algorithms are skipped with a
//! warning when a ring is loaded so a ring exported from a mixed keychain still
//! yields its RSA keys.

use super::armor::{self, ArmorKind};
use super::crypto::{HashAlgorithm, Hasher, S2k, SymmetricAlgorithm};
use super::packet::{
    Packet, Reader, Tag, checksum16, left_pad, read_packets, write_mpi, write_packets,
};
use super::signature::{
    SIG_DIRECT_KEY, SIG_POSITIVE_CERT, SIG_SUBKEY_BINDING, SignaturePacket, Subpacket,
};
use crate::error::{Error, PgpError, Result};
use rand::RngCore;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::Digest;
use std::collections::HashMap;
use std::path::Path;
use zeroize::Zeroizing;

const RSA_ENCRYPT_SIGN: u8 = 1;
const RSA_ENCRYPT_ONLY: u8 = 2;
const RSA_SIGN_ONLY: u8 = 3;
const MAX_RSA_BITS: usize = 16384;

/// S2K count byte used when exporting protected keys (524288 octets)
const EXPORT_S2K_COUNT: u8 = 0x90;

/// 64-bit key identifier: the low 8 bytes of the v4 fingerprint
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(pub [u8; 8]);

impl KeyId {
    /// All-zero ID used by anonymous recipients
    pub const WILDCARD: KeyId = KeyId([0; 8]);

    /// True for the anonymous-recipient ID
    pub fn is_wildcard(&self) -> bool {
        *self == Self::WILDCARD
    }
}

impl std::fmt::Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write_hex(f, &self.0)
    }
}

impl std::fmt::Debug for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyId({self})")
    }
}

impl std::str::FromStr for KeyId {
    type Err = PgpError;

    /// Accepts a 16-digit key ID or a 40-digit fingerprint, with optional
    /// `0x` prefix and embedded spaces
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let hex: String = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes =
            decode_hex(&hex).ok_or_else(|| PgpError::KeyNotFound(format!("'{s}' is not a hex key ID")))?;
        let tail = match bytes.len() {
            8 => &bytes[..],
            20 => &bytes[12..],
            _ => {
                return Err(PgpError::KeyNotFound(format!(
                    "'{s}' is neither a key ID nor a fingerprint"
                )));
            }
        };
        let mut id = [0u8; 8];
        id.copy_from_slice(tail);
        Ok(KeyId(id))
    }
}

/// v4 fingerprint: SHA-1 over the framed public key body
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 20]);

impl Fingerprint {
    /// Key ID derived from this fingerprint
    pub fn key_id(&self) -> KeyId {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.0[12..]);
        KeyId(id)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write_hex(f, &self.0)
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

fn write_hex(f: &mut std::fmt::Formatter<'_>, bytes: &[u8]) -> std::fmt::Result {
    for b in bytes {
        write!(f, "{b:02X}")?;
    }
    Ok(())
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Key usage flags (RFC 4880 §5.2.3.21)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct KeyFlags(u8);

impl KeyFlags {
    /// May certify other keys
    pub const CERTIFY: u8 = 0x01;
    /// May sign data
    pub const SIGN: u8 = 0x02;
    /// May encrypt communications
    pub const ENCRYPT_COMMUNICATIONS: u8 = 0x04;
    /// May encrypt storage
    pub const ENCRYPT_STORAGE: u8 = 0x08;

    /// Wrap raw flag bits
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw flag bits
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Key may produce data signatures
    pub fn can_sign(self) -> bool {
        self.0 & Self::SIGN != 0
    }

    /// Key may receive encrypted session keys
    pub fn can_encrypt(self) -> bool {
        self.0 & (Self::ENCRYPT_COMMUNICATIONS | Self::ENCRYPT_STORAGE) != 0
    }

    /// Usage implied by the algorithm when no self-signature says otherwise
    fn for_algorithm(algorithm: u8) -> Self {
        match algorithm {
            RSA_ENCRYPT_ONLY => Self(Self::ENCRYPT_COMMUNICATIONS | Self::ENCRYPT_STORAGE),
            RSA_SIGN_ONLY => Self(Self::CERTIFY | Self::SIGN),
            _ => Self(
                Self::CERTIFY | Self::SIGN | Self::ENCRYPT_COMMUNICATIONS | Self::ENCRYPT_STORAGE,
            ),
        }
    }
}

/// An RSA public key or subkey
#[derive(Clone, Debug)]
pub struct PublicKey {
    created: u32,
    algorithm: u8,
    key: RsaPublicKey,
    body: Vec<u8>,
    fingerprint: Fingerprint,
    key_id: KeyId,
}

impl PublicKey {
    fn from_rsa(key: RsaPublicKey, created: u32, algorithm: u8) -> Self {
        let mut body = vec![4];
        body.extend_from_slice(&created.to_be_bytes());
        body.push(algorithm);
        write_mpi(&mut body, &key.n().to_bytes_be());
        write_mpi(&mut body, &key.e().to_bytes_be());
        Self::with_body(key, created, algorithm, body)
    }

    fn with_body(key: RsaPublicKey, created: u32, algorithm: u8, body: Vec<u8>) -> Self {
        let mut hasher = Sha1::new();
        hasher.update([0x99]);
        hasher.update((body.len() as u16).to_be_bytes());
        hasher.update(&body);
        let mut fp = [0u8; 20];
        fp.copy_from_slice(&hasher.finalize());
        let fingerprint = Fingerprint(fp);

        Self {
            created,
            algorithm,
            key,
            body,
            key_id: fingerprint.key_id(),
            fingerprint,
        }
    }

    /// Parse the public part at the start of a key packet body, returning the
    /// number of bytes it occupied
    pub(crate) fn parse_prefix(body: &[u8]) -> std::result::Result<(Self, usize), PgpError> {
        let mut reader = Reader::new(body);
        let version = reader.u8()?;
        if version != 4 {
            return Err(PgpError::UnsupportedAlgorithm {
                kind: "key version",
                id: version,
            });
        }
        let created = reader.u32()?;
        let algorithm = reader.u8()?;
        if !matches!(algorithm, RSA_ENCRYPT_SIGN | RSA_ENCRYPT_ONLY | RSA_SIGN_ONLY) {
            return Err(PgpError::UnsupportedAlgorithm {
                kind: "public-key",
                id: algorithm,
            });
        }
        let n = BigUint::from_bytes_be(reader.mpi()?);
        let e = BigUint::from_bytes_be(reader.mpi()?);
        let key = RsaPublicKey::new_with_max_size(n, e, MAX_RSA_BITS)
            .map_err(|e| PgpError::MalformedPacket(format!("invalid RSA public key: {e}")))?;
        let used = reader.position();
        Ok((Self::with_body(key, created, algorithm, body[..used].to_vec()), used))
    }

    pub(crate) fn parse(body: &[u8]) -> std::result::Result<Self, PgpError> {
        let (key, used) = Self::parse_prefix(body)?;
        if used != body.len() {
            return Err(PgpError::MalformedPacket(
                "trailing data after public key".into(),
            ));
        }
        Ok(key)
    }

    /// 64-bit key ID
    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// v4 fingerprint
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Creation time as seconds since the epoch
    pub fn created(&self) -> u32 {
        self.created
    }

    /// Modulus size in bits
    pub fn bits(&self) -> usize {
        self.key.n().bits()
    }

    pub(crate) fn algorithm(&self) -> u8 {
        self.algorithm
    }

    /// Feed the key into a certification or binding hash
    pub(crate) fn hash_key(&self, hasher: &mut Hasher) {
        hasher.update(&[0x99]);
        hasher.update(&(self.body.len() as u16).to_be_bytes());
        hasher.update(&self.body);
    }

    /// PKCS#1 v1.5 wrap of `algo || key || checksum16`
    pub(crate) fn encrypt_session_key(
        &self,
        cipher: SymmetricAlgorithm,
        session_key: &[u8],
    ) -> std::result::Result<Vec<u8>, PgpError> {
        if self.algorithm == RSA_SIGN_ONLY {
            return Err(PgpError::NoEncryptionKey(self.key_id.to_string()));
        }
        let mut message = Zeroizing::new(Vec::with_capacity(session_key.len() + 3));
        message.push(cipher.id());
        message.extend_from_slice(session_key);
        message.extend_from_slice(&checksum16(session_key).to_be_bytes());

        self.key
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, &message)
            .map_err(|e| PgpError::Crypto(format!("session key encryption failed: {e}")))
    }

    pub(crate) fn verify_digest(
        &self,
        hash: HashAlgorithm,
        digest: &[u8],
        signature: &[u8],
    ) -> std::result::Result<bool, PgpError> {
        let signature = left_pad(signature, self.key.size());
        Ok(self
            .key
            .verify(hash.pkcs1_scheme(), digest, &signature)
            .is_ok())
    }
}

#[derive(Clone)]
enum Protection {
    None,
    Encrypted {
        cipher: SymmetricAlgorithm,
        s2k: S2k,
        iv: Vec<u8>,
        sha1_check: bool,
    },
}

/// A secret key as stored: public half plus possibly passphrase-protected
/// private material
#[derive(Clone)]
pub struct SecretKey {
    public: PublicKey,
    protection: Protection,
    data: Vec<u8>,
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("key_id", &self.public.key_id)
            .field("protected", &self.is_protected())
            .finish()
    }
}

impl SecretKey {
    pub(crate) fn parse(body: &[u8]) -> std::result::Result<Self, PgpError> {
        let (public, used) = PublicKey::parse_prefix(body)?;
        let mut reader = Reader::new(&body[used..]);
        let usage = reader.u8()?;
        let protection = match usage {
            0 => Protection::None,
            254 | 255 => {
                let cipher = SymmetricAlgorithm::from_id(reader.u8()?)?;
                let s2k = S2k::parse(&mut reader)?;
                let iv = reader.take(cipher.block_size())?.to_vec();
                Protection::Encrypted {
                    cipher,
                    s2k,
                    iv,
                    sha1_check: usage == 254,
                }
            }
            other => {
                return Err(PgpError::UnsupportedAlgorithm {
                    kind: "S2K usage",
                    id: other,
                });
            }
        };
        Ok(Self {
            public,
            protection,
            data: reader.rest().to_vec(),
        })
    }

    /// Public half
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// 64-bit key ID
    pub fn key_id(&self) -> KeyId {
        self.public.key_id
    }

    /// Whether a passphrase is needed to unlock the key
    pub fn is_protected(&self) -> bool {
        matches!(self.protection, Protection::Encrypted { .. })
    }

    /// Decrypt the private material with `passphrase`
    ///
    /// Unprotected keys ignore the passphrase. A wrong passphrase fails with
    /// [`PgpError::KeyExtraction`].
    pub fn unlock(&self, passphrase: &str) -> std::result::Result<UnlockedKey, PgpError> {
        let key_id = self.public.key_id;
        let fail = |reason: &str| PgpError::KeyExtraction {
            key_id: key_id.to_string(),
            reason: reason.to_string(),
        };

        let plain: Zeroizing<Vec<u8>> = match &self.protection {
            Protection::None => {
                if self.data.len() < 2 {
                    return Err(fail("secret key material truncated"));
                }
                let (mpis, sum) = self.data.split_at(self.data.len() - 2);
                if checksum16(mpis).to_be_bytes() != sum {
                    return Err(fail("secret key checksum mismatch"));
                }
                Zeroizing::new(mpis.to_vec())
            }
            Protection::Encrypted {
                cipher,
                s2k,
                iv,
                sha1_check,
            } => {
                let key = s2k.derive(passphrase.as_bytes(), cipher.key_size());
                let mut buf = Zeroizing::new(self.data.clone());
                cipher.cfb_decrypt(&key, iv, &mut buf)?;

                let check_len = if *sha1_check { 20 } else { 2 };
                if buf.len() < check_len {
                    return Err(fail("secret key material truncated"));
                }
                let split = buf.len() - check_len;
                let intact = if *sha1_check {
                    Sha1::digest(&buf[..split]).as_slice() == &buf[split..]
                } else {
                    checksum16(&buf[..split]).to_be_bytes() == buf[split..]
                };
                if !intact {
                    return Err(fail("wrong passphrase or corrupted key"));
                }
                Zeroizing::new(buf[..split].to_vec())
            }
        };

        let mut reader = Reader::new(&plain);
        let mut next = || -> std::result::Result<BigUint, PgpError> {
            Ok(BigUint::from_bytes_be(reader.mpi()?))
        };
        let d = next().map_err(|_| fail("secret key material truncated"))?;
        let p = next().map_err(|_| fail("secret key material truncated"))?;
        let q = next().map_err(|_| fail("secret key material truncated"))?;

        let private = RsaPrivateKey::from_components(
            self.public.key.n().clone(),
            self.public.key.e().clone(),
            d,
            vec![p, q],
        )
        .map_err(|e| fail(&format!("invalid RSA key material: {e}")))?;
        private
            .validate()
            .map_err(|e| fail(&format!("invalid RSA key material: {e}")))?;

        Ok(UnlockedKey {
            public: self.public.clone(),
            private,
        })
    }
}

/// A secret key with its private material decrypted
pub struct UnlockedKey {
    public: PublicKey,
    private: RsaPrivateKey,
}

impl std::fmt::Debug for UnlockedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockedKey")
            .field("key_id", &self.public.key_id)
            .finish_non_exhaustive()
    }
}

impl UnlockedKey {
    /// Public half
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// 64-bit key ID
    pub fn key_id(&self) -> KeyId {
        self.public.key_id
    }

    pub(crate) fn sign_digest(
        &self,
        hash: HashAlgorithm,
        digest: &[u8],
    ) -> std::result::Result<Vec<u8>, PgpError> {
        if self.public.algorithm == RSA_ENCRYPT_ONLY {
            return Err(PgpError::NoSigningKey);
        }
        self.private
            .sign(hash.pkcs1_scheme(), digest)
            .map_err(|e| PgpError::Crypto(format!("signing failed: {e}")))
    }

    /// Recover `(cipher, session key)` from an RSA-wrapped session key
    pub(crate) fn decrypt_session_key(
        &self,
        wrapped: &[u8],
    ) -> std::result::Result<(SymmetricAlgorithm, Zeroizing<Vec<u8>>), PgpError> {
        let ciphertext = left_pad(wrapped, self.private.size());
        let message = Zeroizing::new(
            self.private
                .decrypt(Pkcs1v15Encrypt, &ciphertext)
                .map_err(|e| PgpError::Crypto(format!("session key decryption failed: {e}")))?,
        );
        if message.len() < 3 {
            return Err(PgpError::Crypto("session key too short".into()));
        }
        let cipher = SymmetricAlgorithm::from_id(message[0])?;
        let (key, sum) = message[1..].split_at(message.len() - 3);
        if key.len() != cipher.key_size() {
            return Err(PgpError::Crypto(
                "session key length does not match its cipher".into(),
            ));
        }
        if checksum16(key).to_be_bytes() != sum {
            return Err(PgpError::Crypto("session key checksum mismatch".into()));
        }
        Ok((cipher, Zeroizing::new(key.to_vec())))
    }

    /// Secret key packet body, protected with `passphrase` unless it is empty
    fn secret_packet_body(&self, passphrase: &str) -> std::result::Result<Vec<u8>, PgpError> {
        let primes = self.private.primes();
        if primes.len() != 2 {
            return Err(PgpError::Crypto(
                "only two-prime RSA keys can be exported".into(),
            ));
        }
        // OpenPGP stores u = p^-1 mod q; the rsa crate keeps q^-1 mod p, so
        // the primes are swapped on export
        let (p, q) = (&primes[1], &primes[0]);
        let u = self
            .private
            .crt_coefficient()
            .ok_or_else(|| PgpError::Crypto("missing CRT coefficient".into()))?;

        let mut mpis = Zeroizing::new(Vec::new());
        write_mpi(&mut mpis, &self.private.d().to_bytes_be());
        write_mpi(&mut mpis, &p.to_bytes_be());
        write_mpi(&mut mpis, &q.to_bytes_be());
        write_mpi(&mut mpis, &u.to_bytes_be());

        let mut body = self.public.body.clone();
        if passphrase.is_empty() {
            body.push(0);
            body.extend_from_slice(&mpis);
            body.extend_from_slice(&checksum16(&mpis).to_be_bytes());
            return Ok(body);
        }

        let cipher = SymmetricAlgorithm::Aes256;
        let s2k = S2k::new_iterated(HashAlgorithm::Sha256, EXPORT_S2K_COUNT);
        let mut iv = vec![0u8; cipher.block_size()];
        rand::thread_rng().fill_bytes(&mut iv);
        let key = s2k.derive(passphrase.as_bytes(), cipher.key_size());

        let mut data = Zeroizing::new(mpis.to_vec());
        data.extend_from_slice(&Sha1::digest(&mpis[..]));
        cipher.cfb_encrypt(&key, &iv, &mut data)?;

        body.push(254);
        body.push(cipher.id());
        s2k.write_to(&mut body);
        body.extend_from_slice(&iv);
        body.extend_from_slice(&data);
        Ok(body)
    }
}

/// One key (primary or subkey) in a ring
#[derive(Clone, Debug)]
pub struct KeyEntry {
    public: PublicKey,
    secret: Option<SecretKey>,
    flags: KeyFlags,
    user_ids: Vec<String>,
    primary: Option<KeyId>,
}

impl KeyEntry {
    /// Public key
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Secret key, when the ring holds one
    pub fn secret(&self) -> Option<&SecretKey> {
        self.secret.as_ref()
    }

    /// Usage flags from the latest self-signature, or implied by the algorithm
    pub fn flags(&self) -> KeyFlags {
        self.flags
    }

    /// User IDs bound to a primary key (empty for subkeys)
    pub fn user_ids(&self) -> &[String] {
        &self.user_ids
    }

    /// Primary key of a subkey; `None` for primary keys
    pub fn primary(&self) -> Option<KeyId> {
        self.primary
    }
}

/// Ordered collection of keys indexed by key ID
///
/// Insertion order is preserved: [`KeyRing::signing_key`] picks the first
/// signing-capable secret key in that order.
#[derive(Clone, Debug, Default)]
pub struct KeyRing {
    entries: Vec<KeyEntry>,
    index: HashMap<KeyId, usize>,
}

impl KeyRing {
    /// Empty ring
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse armored or binary transferable keys
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, PgpError> {
        let mut ring = Self::new();
        ring.add_bytes(data)?;
        Ok(ring)
    }

    /// Read key ring files in order and merge them
    ///
    /// A file that cannot be read is a configuration error.
    pub async fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut ring = Self::new();
        for path in paths {
            let path = path.as_ref();
            let data = tokio::fs::read(path).await.map_err(|e| Error::Config {
                message: format!("failed to read key ring {}: {}", path.display(), e),
                key: Some("keys.key_ring_paths".to_string()),
            })?;
            let added = ring.add_bytes(&data)?;
            tracing::debug!(path = %path.display(), keys = added, "loaded key ring");
        }
        Ok(ring)
    }

    /// Add every key found in `data`, returning how many new keys were added
    pub fn add_bytes(&mut self, data: &[u8]) -> std::result::Result<usize, PgpError> {
        let before = self.entries.len();
        if armor::is_armored(data) {
            for (kind, block) in armor::decode_all(data)? {
                match kind {
                    ArmorKind::PublicKey | ArmorKind::PrivateKey => {
                        self.add_packets(read_packets(&block)?)?
                    }
                    other => {
                        return Err(PgpError::Armor(format!(
                            "expected a key block, found {other:?}"
                        )));
                    }
                }
            }
        } else {
            self.add_packets(read_packets(data)?)?;
        }
        Ok(self.entries.len() - before)
    }

    /// Merge another ring; secret halves fill in public-only entries
    pub fn merge(&mut self, other: KeyRing) {
        for entry in other.entries {
            let id = entry.public.key_id;
            match self.index.get(&id) {
                Some(&idx) => {
                    let existing = &mut self.entries[idx];
                    if existing.secret.is_none() {
                        existing.secret = entry.secret;
                    }
                    for uid in entry.user_ids {
                        if !existing.user_ids.contains(&uid) {
                            existing.user_ids.push(uid);
                        }
                    }
                }
                None => {
                    self.index.insert(id, self.entries.len());
                    self.entries.push(entry);
                }
            }
        }
    }

    fn add_packets(&mut self, packets: Vec<Packet>) -> std::result::Result<(), PgpError> {
        // Primary key currently being read; None while skipping an unsupported one
        let mut primary: Option<KeyId> = None;
        // Key the next signature packet binds to
        let mut current: Option<KeyId> = None;

        for packet in packets {
            match packet.tag {
                Tag::PublicKey | Tag::SecretKey => {
                    primary = None;
                    current = None;
                    if let Some((public, secret)) = parse_key(&packet)? {
                        let id = public.key_id;
                        self.insert(public, secret, None);
                        primary = Some(id);
                        current = Some(id);
                    }
                }
                Tag::PublicSubkey | Tag::SecretSubkey => {
                    current = None;
                    let Some(primary_id) = primary else {
                        continue;
                    };
                    if let Some((public, secret)) = parse_key(&packet)? {
                        let id = public.key_id;
                        self.insert(public, secret, Some(primary_id));
                        current = Some(id);
                    }
                }
                Tag::UserId => {
                    let Some(id) = primary else {
                        continue;
                    };
                    let uid = String::from_utf8_lossy(&packet.body).into_owned();
                    if let Some(&idx) = self.index.get(&id)
                        && !self.entries[idx].user_ids.contains(&uid)
                    {
                        self.entries[idx].user_ids.push(uid);
                    }
                    current = Some(id);
                }
                Tag::UserAttribute => current = None,
                Tag::Signature => {
                    let Some(target) = current else {
                        continue;
                    };
                    let sig = match SignaturePacket::parse(&packet.body) {
                        Ok(sig) => sig,
                        Err(e) => {
                            tracing::debug!(key_id = %target, error = %e, "skipping unreadable key signature");
                            continue;
                        }
                    };
                    self.apply_self_signature(target, primary, &sig);
                }
                Tag::Trust | Tag::Marker | Tag::Unknown(_) => {}
                other => {
                    return Err(PgpError::MalformedPacket(format!(
                        "unexpected {other:?} packet in key ring"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Take key flags from a self-certification or subkey binding
    fn apply_self_signature(&mut self, target: KeyId, primary: Option<KeyId>, sig: &SignaturePacket) {
        let is_primary = Some(target) == primary;
        let binds = match sig.sig_type {
            0x10..=0x13 | SIG_DIRECT_KEY => is_primary,
            SIG_SUBKEY_BINDING => !is_primary,
            _ => false,
        };
        let self_issued = sig.issuer().is_none_or(|issuer| Some(issuer) == primary);
        if !binds || !self_issued {
            return;
        }
        if let Some(bits) = sig.key_flags()
            && let Some(&idx) = self.index.get(&target)
        {
            self.entries[idx].flags = KeyFlags(bits);
        }
    }

    fn insert(&mut self, public: PublicKey, secret: Option<SecretKey>, primary: Option<KeyId>) {
        let id = public.key_id;
        if let Some(&idx) = self.index.get(&id) {
            let entry = &mut self.entries[idx];
            if entry.secret.is_none() {
                entry.secret = secret;
            }
            return;
        }
        let flags = KeyFlags::for_algorithm(public.algorithm);
        self.index.insert(id, self.entries.len());
        self.entries.push(KeyEntry {
            public,
            secret,
            flags,
            user_ids: Vec::new(),
            primary,
        });
    }

    /// Number of keys, subkeys included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the ring holds no keys
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &KeyEntry> {
        self.entries.iter()
    }

    /// Entry for a key ID
    pub fn get(&self, id: &KeyId) -> Option<&KeyEntry> {
        self.index.get(id).map(|&idx| &self.entries[idx])
    }

    /// Public key for a key ID
    pub fn public_key(&self, id: &KeyId) -> Option<&PublicKey> {
        self.get(id).map(|entry| &entry.public)
    }

    /// Secret key for a key ID
    pub fn secret_key(&self, id: &KeyId) -> Option<&SecretKey> {
        self.get(id).and_then(|entry| entry.secret.as_ref())
    }

    /// Secret keys that can decrypt, in ring order
    pub(crate) fn decryption_keys(&self) -> impl Iterator<Item = &SecretKey> {
        self.entries
            .iter()
            .filter(|e| e.flags.can_encrypt())
            .filter_map(|e| e.secret.as_ref())
    }

    /// Signing key selection
    ///
    /// With an explicit ID that key must be present, signing-capable and
    /// secret. Without one, the first signing-capable secret key wins.
    pub fn signing_key(&self, id: Option<&KeyId>) -> std::result::Result<&SecretKey, PgpError> {
        match id {
            Some(id) => {
                let entry = self
                    .get(id)
                    .ok_or_else(|| PgpError::KeyNotFound(id.to_string()))?;
                if !entry.flags.can_sign() {
                    return Err(PgpError::NoSigningKey);
                }
                entry
                    .secret
                    .as_ref()
                    .ok_or_else(|| PgpError::KeyNotFound(format!("{id} (public key only)")))
            }
            None => self
                .entries
                .iter()
                .filter(|e| e.flags.can_sign())
                .find_map(|e| e.secret.as_ref())
                .ok_or(PgpError::NoSigningKey),
        }
    }

    /// Encryption key selection
    ///
    /// A primary key that cannot encrypt resolves to its first
    /// encryption-capable subkey.
    pub fn encryption_key(&self, id: Option<&KeyId>) -> std::result::Result<&PublicKey, PgpError> {
        match id {
            Some(id) => {
                let entry = self
                    .get(id)
                    .ok_or_else(|| PgpError::KeyNotFound(id.to_string()))?;
                if entry.flags.can_encrypt() {
                    return Ok(&entry.public);
                }
                self.entries
                    .iter()
                    .find(|e| e.primary == Some(*id) && e.flags.can_encrypt())
                    .map(|e| &e.public)
                    .ok_or_else(|| PgpError::NoEncryptionKey(id.to_string()))
            }
            None => self
                .entries
                .iter()
                .find(|e| e.flags.can_encrypt())
                .map(|e| &e.public)
                .ok_or_else(|| PgpError::NoEncryptionKey("(none in key ring)".to_string())),
        }
    }
}

/// Parse a key packet; `Ok(None)` for keys we cannot use
fn parse_key(
    packet: &Packet,
) -> std::result::Result<Option<(PublicKey, Option<SecretKey>)>, PgpError> {
    let secret = matches!(packet.tag, Tag::SecretKey | Tag::SecretSubkey);
    let parsed = if secret {
        SecretKey::parse(&packet.body).map(|s| (s.public.clone(), Some(s)))
    } else {
        PublicKey::parse(&packet.body).map(|p| (p, None))
    };

    match parsed {
        Ok(key) => Ok(Some(key)),
        Err(PgpError::UnsupportedAlgorithm { kind, id }) => {
            if secret && let Ok((public, _)) = PublicKey::parse_prefix(&packet.body) {
                tracing::warn!(
                    key_id = %public.key_id,
                    kind,
                    id,
                    "secret key protection not supported, keeping public half only"
                );
                return Ok(Some((public, None)));
            }
            tracing::warn!(kind, id, "skipping key with unsupported algorithm");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Freshly generated RSA key with a user ID and self-certification
pub struct KeyPair {
    fingerprint: Fingerprint,
    public_packets: Vec<u8>,
    secret_packets: Vec<u8>,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate an RSA key usable for signing and encryption
    ///
    /// The secret half is protected with `passphrase` (AES-256, iterated and
    /// salted SHA-256 S2K); an empty passphrase exports it unprotected.
    pub fn generate(
        user_id: &str,
        bits: usize,
        passphrase: &str,
    ) -> std::result::Result<Self, PgpError> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| PgpError::Crypto(format!("RSA key generation failed: {e}")))?;
        let created = u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(u32::MAX);
        let public = PublicKey::from_rsa(private.to_public_key(), created, RSA_ENCRYPT_SIGN);
        let unlocked = UnlockedKey {
            public: public.clone(),
            private,
        };

        let uid = user_id.as_bytes();
        let certification = SignaturePacket::sign(
            &unlocked,
            SIG_POSITIVE_CERT,
            HashAlgorithm::Sha256,
            created,
            &[
                Subpacket::KeyFlags(
                    KeyFlags::CERTIFY
                        | KeyFlags::SIGN
                        | KeyFlags::ENCRYPT_COMMUNICATIONS
                        | KeyFlags::ENCRYPT_STORAGE,
                ),
                Subpacket::PreferredSymmetric(vec![9, 8, 7]),
                Subpacket::PreferredHash(vec![8, 10, 9]),
                Subpacket::PreferredCompression(vec![1, 2, 0]),
            ],
            |h| hash_user_id(h, &public, uid),
        )?
        .to_packet();
        let uid_packet = Packet::new(Tag::UserId, uid.to_vec());

        let public_packets = write_packets(&[
            Packet::new(Tag::PublicKey, public.body.clone()),
            uid_packet.clone(),
            certification.clone(),
        ]);
        let secret_packets = write_packets(&[
            Packet::new(Tag::SecretKey, unlocked.secret_packet_body(passphrase)?),
            uid_packet,
            certification,
        ]);

        Ok(Self {
            fingerprint: public.fingerprint,
            public_packets,
            secret_packets,
        })
    }

    /// 64-bit key ID
    pub fn key_id(&self) -> KeyId {
        self.fingerprint.key_id()
    }

    /// v4 fingerprint
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Binary transferable public key
    pub fn public_bytes(&self) -> &[u8] {
        &self.public_packets
    }

    /// Binary transferable secret key
    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret_packets
    }

    /// `PGP PUBLIC KEY BLOCK`
    pub fn armored_public(&self) -> String {
        armor::encode(ArmorKind::PublicKey, &self.public_packets)
    }

    /// `PGP PRIVATE KEY BLOCK`
    pub fn armored_secret(&self) -> String {
        armor::encode(ArmorKind::PrivateKey, &self.secret_packets)
    }

    /// Ring holding only the public key
    pub fn public_ring(&self) -> std::result::Result<KeyRing, PgpError> {
        KeyRing::from_bytes(&self.public_packets)
    }

    /// Ring holding the secret key
    pub fn secret_ring(&self) -> std::result::Result<KeyRing, PgpError> {
        KeyRing::from_bytes(&self.secret_packets)
    }
}

/// Certification hash input for a user ID: key, then `0xB4 || len32 || uid`
pub(crate) fn hash_user_id(hasher: &mut Hasher, key: &PublicKey, uid: &[u8]) {
    key.hash_key(hasher);
    hasher.update(&[0xB4]);
    hasher.update(&(uid.len() as u32).to_be_bytes());
    hasher.update(uid);
}
