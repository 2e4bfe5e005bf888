//! Algorithm identifiers and symmetric primitives
//!
//! OpenPGP CFB comes in two flavours: the plain mode used by integrity
//! protected data and secret keys, and the resynchronising mode used by the
//! legacy symmetrically encrypted data packet.

use crate::error::PgpError;
use cfb_mode::cipher::{AsyncStreamCipher, BlockCipher, BlockEncryptMut, KeyInit, KeyIvInit};
use rand::RngCore;
use rsa::Pkcs1v15Sign;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

/// Symmetric cipher
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymmetricAlgorithm {
    /// AES with a 128-bit key
    Aes128,
    /// AES with a 192-bit key
    Aes192,
    /// AES with a 256-bit key
    Aes256,
}

impl SymmetricAlgorithm {
    pub(crate) fn from_id(id: u8) -> Result<Self, PgpError> {
        match id {
            7 => Ok(SymmetricAlgorithm::Aes128),
            8 => Ok(SymmetricAlgorithm::Aes192),
            9 => Ok(SymmetricAlgorithm::Aes256),
            other => Err(PgpError::UnsupportedAlgorithm {
                kind: "symmetric",
                id: other,
            }),
        }
    }

    pub(crate) fn id(self) -> u8 {
        match self {
            SymmetricAlgorithm::Aes128 => 7,
            SymmetricAlgorithm::Aes192 => 8,
            SymmetricAlgorithm::Aes256 => 9,
        }
    }

    pub(crate) fn key_size(self) -> usize {
        match self {
            SymmetricAlgorithm::Aes128 => 16,
            SymmetricAlgorithm::Aes192 => 24,
            SymmetricAlgorithm::Aes256 => 32,
        }
    }

    pub(crate) fn block_size(self) -> usize {
        16
    }

    /// Fresh random session key
    pub(crate) fn random_key(self) -> Zeroizing<Vec<u8>> {
        let mut key = Zeroizing::new(vec![0u8; self.key_size()]);
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    /// Plain CFB encryption in place
    pub(crate) fn cfb_encrypt(self, key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), PgpError> {
        match self {
            SymmetricAlgorithm::Aes128 => cfb::<aes::Aes128>(key, iv, buf, true),
            SymmetricAlgorithm::Aes192 => cfb::<aes::Aes192>(key, iv, buf, true),
            SymmetricAlgorithm::Aes256 => cfb::<aes::Aes256>(key, iv, buf, true),
        }
    }

    /// Plain CFB decryption in place
    pub(crate) fn cfb_decrypt(self, key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), PgpError> {
        match self {
            SymmetricAlgorithm::Aes128 => cfb::<aes::Aes128>(key, iv, buf, false),
            SymmetricAlgorithm::Aes192 => cfb::<aes::Aes192>(key, iv, buf, false),
            SymmetricAlgorithm::Aes256 => cfb::<aes::Aes256>(key, iv, buf, false),
        }
    }

    /// Resynchronising CFB encryption of `prefix || data` (RFC 4880 §13.9)
    ///
    /// The first `bs + 2` bytes are encrypted with a zero IV, then the cipher
    /// restarts with the last `bs` ciphertext bytes as IV.
    pub(crate) fn cfb_resync_encrypt(self, key: &[u8], buf: &mut [u8]) -> Result<(), PgpError> {
        let bs = self.block_size();
        if buf.len() < bs + 2 {
            return Err(PgpError::Crypto("resync buffer shorter than prefix".into()));
        }
        let zero_iv = vec![0u8; bs];
        let (head, tail) = buf.split_at_mut(bs + 2);
        self.cfb_encrypt(key, &zero_iv, head)?;
        self.cfb_encrypt(key, &head[2..], tail)
    }

    /// Inverse of [`cfb_resync_encrypt`](Self::cfb_resync_encrypt)
    pub(crate) fn cfb_resync_decrypt(self, key: &[u8], buf: &mut [u8]) -> Result<(), PgpError> {
        let bs = self.block_size();
        if buf.len() < bs + 2 {
            return Err(PgpError::MalformedPacket(
                "encrypted data shorter than its prefix".into(),
            ));
        }
        let zero_iv = vec![0u8; bs];
        let (head, tail) = buf.split_at_mut(bs + 2);
        let iv = head[2..].to_vec();
        self.cfb_decrypt(key, &zero_iv, head)?;
        self.cfb_decrypt(key, &iv, tail)
    }
}

fn cfb<C>(key: &[u8], iv: &[u8], buf: &mut [u8], encrypt: bool) -> Result<(), PgpError>
where
    C: BlockEncryptMut + BlockCipher + KeyInit,
{
    if encrypt {
        cfb_mode::Encryptor::<C>::new_from_slices(key, iv)
            .map_err(|e| PgpError::Crypto(format!("invalid key or IV length: {e}")))?
            .encrypt(buf);
    } else {
        cfb_mode::Decryptor::<C>::new_from_slices(key, iv)
            .map_err(|e| PgpError::Crypto(format!("invalid key or IV length: {e}")))?
            .decrypt(buf);
    }
    Ok(())
}

/// Hash algorithm
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1 (fingerprints, MDC, S2K only)
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl HashAlgorithm {
    pub(crate) fn from_id(id: u8) -> Result<Self, PgpError> {
        match id {
            2 => Ok(HashAlgorithm::Sha1),
            8 => Ok(HashAlgorithm::Sha256),
            9 => Ok(HashAlgorithm::Sha384),
            10 => Ok(HashAlgorithm::Sha512),
            other => Err(PgpError::UnsupportedAlgorithm {
                kind: "hash",
                id: other,
            }),
        }
    }

    pub(crate) fn id(self) -> u8 {
        match self {
            HashAlgorithm::Sha1 => 2,
            HashAlgorithm::Sha256 => 8,
            HashAlgorithm::Sha384 => 9,
            HashAlgorithm::Sha512 => 10,
        }
    }

    pub(crate) fn hasher(self) -> Hasher {
        match self {
            HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha384 => Hasher::Sha384(Sha384::new()),
            HashAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    /// PKCS#1 v1.5 signature scheme with this hash's DigestInfo prefix
    pub(crate) fn pkcs1_scheme(self) -> Pkcs1v15Sign {
        match self {
            HashAlgorithm::Sha1 => Pkcs1v15Sign::new::<Sha1>(),
            HashAlgorithm::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
            HashAlgorithm::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
            HashAlgorithm::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
        }
    }
}

/// Incremental hash over any supported algorithm
#[derive(Clone)]
pub(crate) enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    pub(crate) fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub(crate) fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha384(h) => h.finalize().to_vec(),
            Hasher::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// Compression algorithm
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// No compression layer
    Uncompressed,
    /// Raw DEFLATE (RFC 1951)
    Zip,
    /// DEFLATE with zlib framing (RFC 1950)
    Zlib,
}

impl CompressionAlgorithm {
    pub(crate) fn from_id(id: u8) -> Result<Self, PgpError> {
        match id {
            0 => Ok(CompressionAlgorithm::Uncompressed),
            1 => Ok(CompressionAlgorithm::Zip),
            2 => Ok(CompressionAlgorithm::Zlib),
            other => Err(PgpError::UnsupportedAlgorithm {
                kind: "compression",
                id: other,
            }),
        }
    }

    pub(crate) fn id(self) -> u8 {
        match self {
            CompressionAlgorithm::Uncompressed => 0,
            CompressionAlgorithm::Zip => 1,
            CompressionAlgorithm::Zlib => 2,
        }
    }
}

/// String-to-key specifier (RFC 4880 §3.7)
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum S2k {
    Simple {
        hash: HashAlgorithm,
    },
    Salted {
        hash: HashAlgorithm,
        salt: [u8; 8],
    },
    IteratedSalted {
        hash: HashAlgorithm,
        salt: [u8; 8],
        count: u8,
    },
}

impl S2k {
    /// Iterated and salted with a fresh salt
    pub(crate) fn new_iterated(hash: HashAlgorithm, count: u8) -> Self {
        let mut salt = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut salt);
        S2k::IteratedSalted { hash, salt, count }
    }

    pub(crate) fn parse(reader: &mut super::packet::Reader<'_>) -> Result<Self, PgpError> {
        let kind = reader.u8()?;
        match kind {
            0 => Ok(S2k::Simple {
                hash: HashAlgorithm::from_id(reader.u8()?)?,
            }),
            1 => Ok(S2k::Salted {
                hash: HashAlgorithm::from_id(reader.u8()?)?,
                salt: reader.array()?,
            }),
            3 => Ok(S2k::IteratedSalted {
                hash: HashAlgorithm::from_id(reader.u8()?)?,
                salt: reader.array()?,
                count: reader.u8()?,
            }),
            other => Err(PgpError::UnsupportedAlgorithm {
                kind: "S2K",
                id: other,
            }),
        }
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            S2k::Simple { hash } => out.extend_from_slice(&[0, hash.id()]),
            S2k::Salted { hash, salt } => {
                out.extend_from_slice(&[1, hash.id()]);
                out.extend_from_slice(salt);
            }
            S2k::IteratedSalted { hash, salt, count } => {
                out.extend_from_slice(&[3, hash.id()]);
                out.extend_from_slice(salt);
                out.push(*count);
            }
        }
    }

    /// Derive `key_len` bytes from a passphrase
    pub(crate) fn derive(&self, passphrase: &[u8], key_len: usize) -> Zeroizing<Vec<u8>> {
        let (hash, salt, count): (HashAlgorithm, &[u8], usize) = match self {
            S2k::Simple { hash } => (*hash, &[][..], 0),
            S2k::Salted { hash, salt } => (*hash, salt.as_slice(), 0),
            S2k::IteratedSalted { hash, salt, count } => {
                let c = usize::from(*count);
                (*hash, salt.as_slice(), (16 + (c & 15)) << ((c >> 4) + 6))
            }
        };

        let mut input = Zeroizing::new(Vec::with_capacity(salt.len() + passphrase.len()));
        input.extend_from_slice(salt);
        input.extend_from_slice(passphrase);

        let mut out = Zeroizing::new(Vec::with_capacity(key_len + 64));
        let mut preload = 0usize;
        while out.len() < key_len {
            let mut hasher = hash.hasher();
            hasher.update(&vec![0u8; preload]);
            if !input.is_empty() {
                let mut remaining = count.max(input.len());
                while remaining >= input.len() {
                    hasher.update(&input);
                    remaining -= input.len();
                }
                hasher.update(&input[..remaining]);
            }
            out.extend_from_slice(&hasher.finalize());
            preload += 1;
        }
        out.truncate(key_len);
        out
    }
}
