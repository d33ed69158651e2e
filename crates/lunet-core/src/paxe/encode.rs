//! PAXE packet construction, the encrypting counterpart to [`super::decode`]
//! used by tests and by any caller originating PAXE traffic.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chacha20::cipher::generic_array::GenericArray;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use rand::RngCore;

use lunet_sdk::LunetError;

use super::keystore::Keystore;
use super::{
    PaxeHeader, PaxePacket, DEK_LEN_FIELD_LEN, DEK_NONCE_LEN, HEADER_LEN, KEK_NONCE_LEN,
    NONCE_LEN, WRAPPED_DEK_LEN,
};

/// Builds PAXE frames sealed with keys drawn from a [`Keystore`].
pub struct PaxeEncoder {
    keystore: Arc<Keystore>,
}

impl PaxeEncoder {
    pub fn new(keystore: Arc<Keystore>) -> Self {
        PaxeEncoder { keystore }
    }

    /// Seal `plaintext` under the key registered for `key_id`.
    pub fn encrypt_standard(
        &self,
        plaintext: &[u8],
        key_id: u32,
    ) -> Result<PaxePacket, LunetError> {
        let key_bytes = self
            .keystore
            .lookup(key_id)
            .ok_or_else(|| LunetError::ArgumentError("paxe: unknown key id".into()))?;

        let declared_len = u16::try_from(plaintext.len())
            .map_err(|_| LunetError::ArgumentError("paxe: plaintext too long".into()))?;
        let header = PaxeHeader {
            flags: 0,
            key_id,
            declared_len,
        };
        let header_bytes = header.to_bytes();

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &header_bytes,
                },
            )
            .map_err(|_| LunetError::ProtocolError("paxe: encryption failed".into()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(PaxePacket(out))
    }

    /// Seal `plaintext` under a fresh per-message `dek`, itself wrapped
    /// under `kek` (DEK mode, spec §4.8 step 6).
    pub fn encrypt_dek(
        &self,
        plaintext: &[u8],
        kek: [u8; 32],
        dek: [u8; 32],
    ) -> Result<PaxePacket, LunetError> {
        let declared_len = u16::try_from(plaintext.len())
            .map_err(|_| LunetError::ArgumentError("paxe: plaintext too long".into()))?;
        let header = PaxeHeader {
            flags: super::FLAG_DEK,
            key_id: 0,
            declared_len,
        };
        let header_bytes = header.to_bytes();

        let mut kek_nonce = [0u8; KEK_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut kek_nonce);

        let mut wrapped = [0u8; WRAPPED_DEK_LEN + DEK_LEN_FIELD_LEN];
        wrapped[0..WRAPPED_DEK_LEN].copy_from_slice(&dek);
        wrapped[WRAPPED_DEK_LEN..].copy_from_slice(&declared_len.to_be_bytes());
        let mut stream = ChaCha20::new(
            GenericArray::from_slice(&kek),
            GenericArray::from_slice(&kek_nonce),
        );
        stream.apply_keystream(&mut wrapped);

        let mut dek_nonce = [0u8; DEK_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut dek_nonce);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&dek));
        let nonce = Nonce::from_slice(&dek_nonce);
        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &header_bytes,
                },
            )
            .map_err(|_| LunetError::ProtocolError("paxe: encryption failed".into()))?;

        let mut out = Vec::with_capacity(
            HEADER_LEN + KEK_NONCE_LEN + wrapped.len() + DEK_NONCE_LEN + ciphertext.len(),
        );
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&kek_nonce);
        out.extend_from_slice(&wrapped);
        out.extend_from_slice(&dek_nonce);
        out.extend_from_slice(&ciphertext);
        Ok(PaxePacket(out))
    }
}
