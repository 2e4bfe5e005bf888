use super::{ALICE, ALICE_PASSPHRASE, BOB, BOB_PASSPHRASE, MALLORY};
use crate::error::PgpError;
use crate::pgp::crypto::{HashAlgorithm, SymmetricAlgorithm};
use crate::pgp::key::hash_user_id;
use crate::pgp::packet::{Packet, Tag, read_packets, write_packets};
use crate::pgp::signature::{SIG_POSITIVE_CERT, SignaturePacket, Subpacket};
use crate::pgp::{KeyFlags, KeyId, KeyRing, armor};
use std::str::FromStr;

#[test]
fn test_key_id_display_and_parse() {
    let id = KeyId([0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF]);
    assert_eq!(id.to_string(), "0123456789ABCDEF");
    assert_eq!(KeyId::from_str("0123456789abcdef").unwrap(), id);
    assert_eq!(KeyId::from_str("0x0123456789ABCDEF").unwrap(), id);
    assert_eq!(KeyId::from_str("0123 4567 89AB CDEF").unwrap(), id);
    assert!(KeyId::from_str("0123").is_err());
    assert!(KeyId::from_str("not hex at all!!").is_err());

    let fingerprint = ALICE.fingerprint().to_string();
    assert_eq!(fingerprint.len(), 40);
    assert_eq!(KeyId::from_str(&fingerprint).unwrap(), ALICE.key_id());
}

#[test]
fn test_generated_key_survives_armor() {
    let ring = KeyRing::from_bytes(ALICE.armored_secret().as_bytes()).unwrap();
    assert_eq!(ring.len(), 1);

    let entry = ring.get(&ALICE.key_id()).unwrap();
    assert_eq!(entry.user_ids().to_vec(), vec!["Alice <alice@example.com>".to_string()]);
    assert!(entry.flags().can_sign());
    assert!(entry.flags().can_encrypt());
    assert_eq!(entry.primary(), None);
    assert_eq!(entry.public().bits(), 1024);

    let secret = entry.secret().unwrap();
    assert!(secret.is_protected());
    assert_eq!(secret.key_id(), ALICE.key_id());
}

#[test]
fn test_unlock_needs_the_right_passphrase() {
    let ring = ALICE.secret_ring().unwrap();
    let secret = ring.secret_key(&ALICE.key_id()).unwrap();

    let unlocked = secret.unlock(ALICE_PASSPHRASE).unwrap();
    assert_eq!(unlocked.key_id(), ALICE.key_id());

    match secret.unlock("wrong passphrase") {
        Err(PgpError::KeyExtraction { key_id, .. }) => {
            assert_eq!(key_id, ALICE.key_id().to_string());
        }
        other => panic!("expected KeyExtraction, got {other:?}"),
    }
}

#[test]
fn test_unprotected_key_ignores_passphrase() {
    let ring = MALLORY.secret_ring().unwrap();
    let secret = ring.secret_key(&MALLORY.key_id()).unwrap();
    assert!(!secret.is_protected());
    assert!(secret.unlock("").is_ok());
    assert!(secret.unlock("anything").is_ok());
}

#[test]
fn test_self_certification_verifies() {
    let packets = read_packets(ALICE.public_bytes()).unwrap();
    assert_eq!(packets.len(), 3);
    assert_eq!(packets[0].tag, Tag::PublicKey);
    assert_eq!(packets[1].tag, Tag::UserId);

    let ring = ALICE.public_ring().unwrap();
    let public = ring.public_key(&ALICE.key_id()).unwrap();
    let sig = SignaturePacket::parse(&packets[2].body).unwrap();
    assert_eq!(sig.sig_type, SIG_POSITIVE_CERT);
    assert_eq!(sig.issuer(), Some(ALICE.key_id()));
    assert_eq!(
        sig.key_flags(),
        Some(
            KeyFlags::CERTIFY
                | KeyFlags::SIGN
                | KeyFlags::ENCRYPT_COMMUNICATIONS
                | KeyFlags::ENCRYPT_STORAGE
        )
    );

    let uid = packets[1].body.clone();
    assert!(sig.verify(public, |h| hash_user_id(h, public, &uid)).unwrap());
    assert!(
        !sig.verify(public, |h| hash_user_id(h, public, b"Eve <eve@example.com>"))
            .unwrap()
    );
}

#[test]
fn test_merge_attaches_secret_to_public_entry() {
    let mut ring = ALICE.public_ring().unwrap();
    assert!(ring.secret_key(&ALICE.key_id()).is_none());

    ring.merge(ALICE.secret_ring().unwrap());
    ring.merge(BOB.public_ring().unwrap());

    assert_eq!(ring.len(), 2);
    assert!(ring.secret_key(&ALICE.key_id()).is_some());
    assert!(ring.secret_key(&BOB.key_id()).is_none());
    assert_eq!(
        ring.iter().map(|e| e.public().key_id()).collect::<Vec<_>>(),
        vec![ALICE.key_id(), BOB.key_id()]
    );
}

#[test]
fn test_add_bytes_reads_concatenated_armored_blocks() {
    let mut text = BOB.armored_public();
    text.push_str(&ALICE.armored_secret());
    let mut ring = KeyRing::new();
    assert_eq!(ring.add_bytes(text.as_bytes()).unwrap(), 2);
    // Adding the same keys again adds nothing
    assert_eq!(ring.add_bytes(text.as_bytes()).unwrap(), 0);
}

#[test]
fn test_signing_key_selection() {
    let mut ring = BOB.public_ring().unwrap();
    ring.merge(ALICE.secret_ring().unwrap());
    ring.merge(MALLORY.secret_ring().unwrap());

    // First signing-capable secret key in ring order
    assert_eq!(ring.signing_key(None).unwrap().key_id(), ALICE.key_id());
    assert_eq!(
        ring.signing_key(Some(&MALLORY.key_id())).unwrap().key_id(),
        MALLORY.key_id()
    );
    assert!(matches!(
        ring.signing_key(Some(&BOB.key_id())),
        Err(PgpError::KeyNotFound(_))
    ));
    assert!(matches!(
        ring.signing_key(Some(&KeyId([0xEE; 8]))),
        Err(PgpError::KeyNotFound(_))
    ));

    let public_only = BOB.public_ring().unwrap();
    assert!(matches!(
        public_only.signing_key(None),
        Err(PgpError::NoSigningKey)
    ));
    assert!(matches!(
        KeyRing::new().signing_key(None),
        Err(PgpError::NoSigningKey)
    ));
}

#[test]
fn test_key_flags_come_from_self_signature() {
    // Re-certify Bob's key as sign-only
    let secret_ring = BOB.secret_ring().unwrap();
    let unlocked = secret_ring
        .secret_key(&BOB.key_id())
        .unwrap()
        .unlock(BOB_PASSPHRASE)
        .unwrap();
    let public = unlocked.public().clone();
    let uid = b"Bob signing only".to_vec();
    let sig = SignaturePacket::sign(
        &unlocked,
        SIG_POSITIVE_CERT,
        HashAlgorithm::Sha256,
        public.created(),
        &[Subpacket::KeyFlags(KeyFlags::CERTIFY | KeyFlags::SIGN)],
        |h| hash_user_id(h, &public, &uid),
    )
    .unwrap();

    let original = read_packets(BOB.public_bytes()).unwrap();
    let bytes = write_packets(&[
        original[0].clone(),
        Packet::new(Tag::UserId, uid.clone()),
        sig.to_packet(),
    ]);
    let ring = KeyRing::from_bytes(&bytes).unwrap();

    let entry = ring.get(&BOB.key_id()).unwrap();
    assert!(entry.flags().can_sign());
    assert!(!entry.flags().can_encrypt());
    assert!(matches!(
        ring.encryption_key(None),
        Err(PgpError::NoEncryptionKey(_))
    ));
    assert!(matches!(
        ring.encryption_key(Some(&BOB.key_id())),
        Err(PgpError::NoEncryptionKey(_))
    ));
}

#[test]
fn test_unsupported_algorithms_are_skipped() {
    // Version 4 EdDSA (22) key: rejected on the algorithm byte
    let eddsa = Packet::new(Tag::PublicKey, vec![4, 0, 0, 0, 0, 22, 0x09, 0x2B, 0x06]);
    let uid = Packet::new(Tag::UserId, b"Ed <ed@example.com>".to_vec());
    let mut bytes = write_packets(&[eddsa, uid]);
    bytes.extend_from_slice(ALICE.public_bytes());

    let ring = KeyRing::from_bytes(&bytes).unwrap();
    assert_eq!(ring.len(), 1);
    let entry = ring.get(&ALICE.key_id()).unwrap();
    assert_eq!(entry.user_ids().len(), 1, "Ed's user ID must not attach to Alice");
}

#[test]
fn test_key_ring_rejects_message_armor() {
    let text = armor::encode(armor::ArmorKind::Message, b"\xC0\x00");
    assert!(matches!(
        KeyRing::from_bytes(text.as_bytes()),
        Err(PgpError::Armor(_))
    ));
}

#[test]
fn test_session_key_wrap_and_unwrap() {
    let ring = ALICE.secret_ring().unwrap();
    let secret = ring.secret_key(&ALICE.key_id()).unwrap();
    let unlocked = secret.unlock(ALICE_PASSPHRASE).unwrap();

    let cipher = SymmetricAlgorithm::Aes192;
    let session_key = cipher.random_key();
    let wrapped = secret
        .public()
        .encrypt_session_key(cipher, &session_key)
        .unwrap();
    let (recovered_cipher, recovered) = unlocked.decrypt_session_key(&wrapped).unwrap();
    assert_eq!(recovered_cipher, cipher);
    assert_eq!(*recovered, *session_key);

    // Someone else's key cannot open it
    let bob_ring = BOB.secret_ring().unwrap();
    let bob = bob_ring
        .secret_key(&BOB.key_id())
        .unwrap()
        .unlock(BOB_PASSPHRASE)
        .unwrap();
    assert!(bob.decrypt_session_key(&wrapped).is_err());
}

#[tokio::test]
async fn test_load_merges_files_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let public = dir.path().join("bob.asc");
    let secret = dir.path().join("alice.key");
    tokio::fs::write(&public, BOB.armored_public()).await.unwrap();
    tokio::fs::write(&secret, ALICE.secret_bytes()).await.unwrap();

    let ring = KeyRing::load(&[&public, &secret]).await.unwrap();
    assert_eq!(ring.len(), 2);
    assert_eq!(ring.iter().next().unwrap().public().key_id(), BOB.key_id());
    assert_eq!(ring.signing_key(None).unwrap().key_id(), ALICE.key_id());

    let missing = dir.path().join("missing.asc");
    let err = KeyRing::load(&[missing]).await.unwrap_err();
    assert!(err.is_run_fatal(), "unreadable key ring is a configuration error");
}
