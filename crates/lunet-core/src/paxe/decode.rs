//! PAXE packet decryption (spec §4.8).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chacha20::cipher::generic_array::GenericArray;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;

use lunet_sdk::LunetError;

use super::keystore::Keystore;
use super::{
    FailurePolicy, PaxeHeader, DEK_LEN_FIELD_LEN, DEK_NONCE_LEN, DEK_OVERHEAD, HEADER_LEN,
    KEK_NONCE_LEN, NONCE_LEN, STANDARD_OVERHEAD, WRAPPED_DEK_LEN,
};

/// Index into [`PaxeCounters`]' failure slots; order matches spec §4.8's
/// failure-class list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
enum FailureReason {
    TooShort = 0,
    ReservedNonZero = 1,
    LengthMismatch = 2,
    DekLengthMismatch = 3,
    KeyNotFound = 4,
    AuthFailed = 5,
}

const FAILURE_COUNT: usize = 6;

/// Per-reason rejection counters plus the running success count, with a
/// per-reason "have we logged this once already" bitmap for
/// [`FailurePolicy::LogOnce`].
#[derive(Debug, Default)]
pub struct PaxeCounters {
    pub rx_ok: AtomicU64,
    too_short: AtomicU64,
    reserved_nonzero: AtomicU64,
    length_mismatch: AtomicU64,
    dek_length_mismatch: AtomicU64,
    key_not_found: AtomicU64,
    auth_fail: AtomicU64,
    logged_once: [AtomicBool; FAILURE_COUNT],
}

impl PaxeCounters {
    fn counter(&self, reason: FailureReason) -> &AtomicU64 {
        match reason {
            FailureReason::TooShort => &self.too_short,
            FailureReason::ReservedNonZero => &self.reserved_nonzero,
            FailureReason::LengthMismatch => &self.length_mismatch,
            FailureReason::DekLengthMismatch => &self.dek_length_mismatch,
            FailureReason::KeyNotFound => &self.key_not_found,
            FailureReason::AuthFailed => &self.auth_fail,
        }
    }

    pub fn rx_auth_fail(&self) -> u64 {
        self.auth_fail.load(Ordering::Relaxed)
    }

    pub fn rx_too_short(&self) -> u64 {
        self.too_short.load(Ordering::Relaxed)
    }

    pub fn rx_key_not_found(&self) -> u64 {
        self.key_not_found.load(Ordering::Relaxed)
    }

    fn record(&self, reason: FailureReason, policy: FailurePolicy, message: &str) {
        self.counter(reason).fetch_add(1, Ordering::Relaxed);
        match policy {
            FailurePolicy::Drop => {}
            FailurePolicy::Verbose => tracing::warn!(reason = ?reason, "{message}"),
            FailurePolicy::LogOnce => {
                let already = self.logged_once[reason as usize].swap(true, Ordering::Relaxed);
                if !already {
                    tracing::warn!(reason = ?reason, "{message} (further occurrences suppressed)");
                }
            }
        }
    }
}

/// Fields recovered from a frame that decrypted successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaxeOutcome {
    pub key_id: u32,
    pub flags: u8,
    pub plaintext_len: usize,
}

/// Decrypts PAXE frames in place.
pub struct PaxeDecoder {
    keystore: Arc<Keystore>,
    kek: [u8; 32],
    policy: FailurePolicy,
    counters: PaxeCounters,
}

impl PaxeDecoder {
    pub fn new(keystore: Arc<Keystore>, kek: [u8; 32], policy: FailurePolicy) -> Self {
        PaxeDecoder {
            keystore,
            kek,
            policy,
            counters: PaxeCounters::default(),
        }
    }

    pub fn counters(&self) -> &PaxeCounters {
        &self.counters
    }

    fn reject(&self, reason: FailureReason, message: &str) -> LunetError {
        self.counters.record(reason, self.policy, message);
        LunetError::ProtocolError(message.to_string())
    }

    /// Decrypt `buf` in place. On success the plaintext occupies
    /// `buf[0..outcome.plaintext_len]`; on error `buf` must be discarded by
    /// the caller (its trailing bytes may have been scratched by the AEAD
    /// implementation).
    pub fn try_decrypt(&self, buf: &mut [u8]) -> Result<PaxeOutcome, LunetError> {
        if buf.len() < STANDARD_OVERHEAD {
            return Err(self.reject(FailureReason::TooShort, "paxe: packet too short"));
        }
        let header = PaxeHeader::from_bytes(buf)
            .ok_or_else(|| self.reject(FailureReason::ReservedNonZero, "paxe: reserved byte set"))?;

        if header.is_dek_mode() {
            self.decrypt_dek(buf, header)
        } else {
            self.decrypt_standard(buf, header)
        }
    }

    fn decrypt_standard(
        &self,
        buf: &mut [u8],
        header: PaxeHeader,
    ) -> Result<PaxeOutcome, LunetError> {
        let declared_len = header.declared_len as usize;
        let expected_len = declared_len
            .checked_add(STANDARD_OVERHEAD)
            .ok_or_else(|| self.reject(FailureReason::LengthMismatch, "paxe: length overflow"))?;
        if buf.len() != expected_len {
            return Err(self.reject(FailureReason::LengthMismatch, "paxe: length mismatch"));
        }

        let key_bytes = self.keystore.lookup(header.key_id).ok_or_else(|| {
            self.reject(FailureReason::KeyNotFound, "paxe: key not found")
        })?;

        let nonce_bytes = buf[HEADER_LEN..HEADER_LEN + NONCE_LEN].to_vec();
        let aad = buf[0..HEADER_LEN].to_vec();
        let ciphertext = buf[HEADER_LEN + NONCE_LEN..].to_vec();

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| self.reject(FailureReason::AuthFailed, "paxe: authentication failed"))?;

        buf[0..plaintext.len()].copy_from_slice(&plaintext);
        self.counters.rx_ok.fetch_add(1, Ordering::Relaxed);
        Ok(PaxeOutcome {
            key_id: header.key_id,
            flags: header.flags,
            plaintext_len: plaintext.len(),
        })
    }

    fn decrypt_dek(&self, buf: &mut [u8], header: PaxeHeader) -> Result<PaxeOutcome, LunetError> {
        let declared_len = header.declared_len as usize;
        let expected_len = declared_len
            .checked_add(DEK_OVERHEAD)
            .ok_or_else(|| self.reject(FailureReason::LengthMismatch, "paxe: length overflow"))?;
        if buf.len() != expected_len {
            return Err(self.reject(FailureReason::LengthMismatch, "paxe: length mismatch"));
        }

        let aad = buf[0..HEADER_LEN].to_vec();
        let kek_nonce = buf[HEADER_LEN..HEADER_LEN + KEK_NONCE_LEN].to_vec();
        let wrapped_start = HEADER_LEN + KEK_NONCE_LEN;
        let wrapped_len = WRAPPED_DEK_LEN + DEK_LEN_FIELD_LEN;
        let mut wrapped = buf[wrapped_start..wrapped_start + wrapped_len].to_vec();

        let mut stream = ChaCha20::new(
            GenericArray::from_slice(&self.kek),
            GenericArray::from_slice(&kek_nonce),
        );
        stream.apply_keystream(&mut wrapped);

        let mut dek = [0u8; 32];
        dek.copy_from_slice(&wrapped[0..WRAPPED_DEK_LEN]);
        let inner_len = u16::from_be_bytes([wrapped[32], wrapped[33]]) as usize;
        wrapped.fill(0); // clear the transient copy of the unwrapped DEK

        if inner_len != declared_len {
            dek.fill(0);
            return Err(self.reject(
                FailureReason::DekLengthMismatch,
                "paxe: inner dek length mismatch",
            ));
        }

        let dek_nonce_start = wrapped_start + wrapped_len;
        let dek_nonce = buf[dek_nonce_start..dek_nonce_start + DEK_NONCE_LEN].to_vec();
        let ciphertext = buf[dek_nonce_start + DEK_NONCE_LEN..].to_vec();

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&dek));
        let nonce = Nonce::from_slice(&dek_nonce);
        let result = cipher.decrypt(
            nonce,
            Payload {
                msg: &ciphertext,
                aad: &aad,
            },
        );
        dek.fill(0);

        let plaintext =
            result.map_err(|_| self.reject(FailureReason::AuthFailed, "paxe: authentication failed"))?;

        buf[0..plaintext.len()].copy_from_slice(&plaintext);
        self.counters.rx_ok.fetch_add(1, Ordering::Relaxed);
        Ok(PaxeOutcome {
            key_id: header.key_id,
            flags: header.flags,
            plaintext_len: plaintext.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxe::encode::PaxeEncoder;

    fn keystore_with(key_id: u32, key: [u8; 32]) -> Arc<Keystore> {
        let ks = Arc::new(Keystore::new());
        ks.insert(key_id, key);
        ks
    }

    #[test]
    fn round_trips_standard_mode() {
        let keystore = keystore_with(7, [0x42u8; 32]);
        let encoder = PaxeEncoder::new(Arc::clone(&keystore));
        let mut packet = encoder.encrypt_standard(b"hello paxe", 7).unwrap().into_bytes();

        let decoder = PaxeDecoder::new(keystore, [0u8; 32], FailurePolicy::Drop);
        let outcome = decoder.try_decrypt(&mut packet).unwrap();
        assert_eq!(outcome.key_id, 7);
        assert_eq!(&packet[0..outcome.plaintext_len], b"hello paxe");
        assert_eq!(decoder.counters().rx_ok.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn bad_tag_is_rejected_without_leaking_plaintext_boundary() {
        let keystore = keystore_with(7, [0x11u8; 32]);
        let encoder = PaxeEncoder::new(Arc::clone(&keystore));
        let mut packet = encoder
            .encrypt_standard(&vec![0xAAu8; 100], 7)
            .unwrap()
            .into_bytes();
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;

        let decoder = PaxeDecoder::new(keystore, [0u8; 32], FailurePolicy::Drop);
        let err = decoder.try_decrypt(&mut packet).unwrap_err();
        assert!(matches!(err, LunetError::ProtocolError(_)));
        assert_eq!(decoder.counters().rx_auth_fail(), 1);
    }

    #[test]
    fn unknown_key_id_is_rejected() {
        let keystore = Arc::new(Keystore::new());
        let decoder = PaxeDecoder::new(keystore, [0u8; 32], FailurePolicy::Drop);
        let mut buf = vec![0u8; STANDARD_OVERHEAD];
        buf[4..8].copy_from_slice(&0u32.to_be_bytes());
        let err = decoder.try_decrypt(&mut buf).unwrap_err();
        assert!(matches!(err, LunetError::ProtocolError(_)));
        assert_eq!(decoder.counters().rx_key_not_found(), 1);
    }

    #[test]
    fn too_short_packet_is_rejected() {
        let keystore = Arc::new(Keystore::new());
        let decoder = PaxeDecoder::new(keystore, [0u8; 32], FailurePolicy::Drop);
        let mut buf = vec![0u8; STANDARD_OVERHEAD - 1];
        let err = decoder.try_decrypt(&mut buf).unwrap_err();
        assert!(matches!(err, LunetError::ProtocolError(_)));
        assert_eq!(decoder.counters().rx_too_short(), 1);
    }

    #[test]
    fn reserved_byte_set_is_rejected() {
        let keystore = Arc::new(Keystore::new());
        let decoder = PaxeDecoder::new(keystore, [0u8; 32], FailurePolicy::Drop);
        let mut buf = vec![0u8; STANDARD_OVERHEAD];
        buf[3] = 1;
        assert!(decoder.try_decrypt(&mut buf).is_err());
    }

    #[test]
    fn round_trips_dek_mode() {
        let keystore = Arc::new(Keystore::new());
        let kek = [0x77u8; 32];
        let encoder = PaxeEncoder::new(Arc::clone(&keystore));
        let mut packet = encoder
            .encrypt_dek(b"dek mode payload", kek, [0x22u8; 32])
            .unwrap()
            .into_bytes();

        let decoder = PaxeDecoder::new(keystore, kek, FailurePolicy::Drop);
        let outcome = decoder.try_decrypt(&mut packet).unwrap();
        assert_eq!(&packet[0..outcome.plaintext_len], b"dek mode payload");
    }
}
