//! Key material, envelopes and a recording sink

use async_trait::async_trait;
use secure_ingest::{
    DeliveryMetadata, EncryptOptions, KeyPair, KeyRing, PgpEngine, Sink, SinkError,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{LazyLock, Mutex};

/// Passphrase protecting the receiver's secret key
pub const RECEIVER_PASSPHRASE: &str = "receiver passphrase";

/// Passphrase protecting the partner's signing key
pub const PARTNER_PASSPHRASE: &str = "partner passphrase";

/// The CSV payload counterparties send in these tests
pub const REPORT_CSV: &[u8] = b"col1,col2\n1,2\n";

/// Our key: envelopes are encrypted to it
pub static RECEIVER: LazyLock<KeyPair> = LazyLock::new(|| {
    KeyPair::generate("Receiver <ingest@example.com>", 1024, RECEIVER_PASSPHRASE).unwrap()
});

/// The counterparty: signs what it sends, public key is in our ring
pub static PARTNER: LazyLock<KeyPair> = LazyLock::new(|| {
    KeyPair::generate("Partner <files@partner.example>", 1024, PARTNER_PASSPHRASE).unwrap()
});

/// Write the receiver's secret key and the partner's public key as armored files
///
/// Returns the paths in the order `keys.key_ring_paths` expects them.
pub fn write_key_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::create_dir_all(dir).unwrap();
    let secret = dir.join("receiver.sec.asc");
    let partner = dir.join("partner.pub.asc");
    std::fs::write(&secret, RECEIVER.armored_secret()).unwrap();
    std::fs::write(&partner, PARTNER.armored_public()).unwrap();
    vec![secret, partner]
}

/// In-memory equivalent of [`write_key_files`]
pub fn receiver_ring() -> KeyRing {
    let mut ring = RECEIVER.secret_ring().unwrap();
    ring.merge(PARTNER.public_ring().unwrap());
    ring
}

/// Envelope the partner would upload: signed, compressed by default, integrity protected
pub fn partner_envelope(plaintext: &[u8], file_name: &str) -> Vec<u8> {
    let recipient_ring = RECEIVER.public_ring().unwrap();
    let recipient = recipient_ring.encryption_key(None).unwrap();
    let signer = PARTNER
        .secret_ring()
        .unwrap()
        .signing_key(None)
        .unwrap()
        .unlock(PARTNER_PASSPHRASE)
        .unwrap();
    let options = EncryptOptions {
        file_name: file_name.to_string(),
        ..Default::default()
    };
    PgpEngine::default()
        .sign_and_encrypt(plaintext, recipient, Some(&signer), &options)
        .unwrap()
}

/// Sink that keeps every delivery and can be told to fail the next `n`
#[derive(Default)]
pub struct RecordingSink {
    deliveries: Mutex<Vec<(Vec<u8>, DeliveryMetadata)>>,
    failures_left: AtomicU32,
}

impl RecordingSink {
    /// Fail the next `n` forwards with [`SinkError::Unavailable`]
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Everything delivered so far
    pub fn deliveries(&self) -> Vec<(Vec<u8>, DeliveryMetadata)> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn forward(&self, plaintext: &[u8], metadata: &DeliveryMetadata) -> Result<(), SinkError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SinkError::Unavailable("downstream offline".into()));
        }
        self.deliveries
            .lock()
            .unwrap()
            .push((plaintext.to_vec(), metadata.clone()));
        Ok(())
    }
}
