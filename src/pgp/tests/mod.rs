use super::crypto::{HashAlgorithm, SymmetricAlgorithm};
use super::envelope::{self, LiteralData, Pkesk};
use super::packet::write_packets;
use super::signature::{OnePassSignature, SIG_BINARY, SignaturePacket};
use super::{KeyPair, PublicKey, UnlockedKey};
use std::sync::LazyLock;

mod keys;

pub(super) const ALICE_PASSPHRASE: &str = "correct horse battery staple";
pub(super) const BOB_PASSPHRASE: &str = "bob's passphrase";

// Small keys keep generation fast; the code paths are size independent
pub(super) static ALICE: LazyLock<KeyPair> = LazyLock::new(|| {
    KeyPair::generate("Alice <alice@example.com>", 1024, ALICE_PASSPHRASE).unwrap()
});

pub(super) static BOB: LazyLock<KeyPair> = LazyLock::new(|| {
    KeyPair::generate("Bob <bob@example.com>", 1024, BOB_PASSPHRASE).unwrap()
});

/// Unprotected secret key
pub(super) static MALLORY: LazyLock<KeyPair> =
    LazyLock::new(|| KeyPair::generate("Mallory <mallory@example.com>", 1024, "").unwrap());

/// Signed, encrypted envelope whose literal data is not what `signer` signed
///
/// Decrypts cleanly and carries a signature from a known key, so it verifies
/// as `SignatureMismatch`.
pub(crate) fn mismatched_signature_envelope(
    signer: &UnlockedKey,
    recipient: &PublicKey,
    signed: &[u8],
    delivered: &[u8],
    file_name: &str,
) -> Vec<u8> {
    let sig = SignaturePacket::sign(signer, SIG_BINARY, HashAlgorithm::Sha256, 0, &[], |h| {
        h.update(signed)
    })
    .unwrap();
    let content = write_packets(&[
        OnePassSignature::for_signature(&sig, signer.key_id()).to_packet(),
        LiteralData::binary(delivered, file_name, 0).to_packet(),
        sig.to_packet(),
    ]);

    let cipher = SymmetricAlgorithm::Aes256;
    let key = cipher.random_key();
    write_packets(&[
        Pkesk::for_recipient(recipient, cipher, &key).unwrap(),
        envelope::seal_protected(cipher, &key, &content).unwrap(),
    ])
}
