//! PAXE: authenticated UDP packet encryption (spec §4.8).
//!
//! A PAXE frame carries an 8-byte header (mode flag, key id, declared
//! plaintext length) followed by either a standard AEAD-sealed payload or a
//! DEK-wrapped one. [`PaxeDecoder::try_decrypt`] turns a received datagram
//! back into plaintext in place; [`PaxeEncoder`] is its counterpart for
//! tests and for any caller originating PAXE traffic rather than just
//! receiving it.

mod decode;
mod encode;
mod keystore;

pub use decode::{PaxeCounters, PaxeDecoder, PaxeOutcome};
pub use encode::PaxeEncoder;
pub use keystore::Keystore;

/// Bytes in the fixed header: a 2-byte declared plaintext length, 1 flags
/// byte, 1 reserved byte, and a 4-byte key id.
pub const HEADER_LEN: usize = 8;
/// AEAD nonce length (AES-256-GCM, also used as the DEK's own nonce).
pub const NONCE_LEN: usize = 12;
/// AEAD authentication tag length.
pub const TAG_LEN: usize = 16;
/// Overhead of a standard-mode frame beyond the plaintext.
pub const STANDARD_OVERHEAD: usize = HEADER_LEN + NONCE_LEN + TAG_LEN;

/// Length of the KEK nonce used to stream-cipher the wrapped DEK.
pub const KEK_NONCE_LEN: usize = 12;
/// Length of a wrapped (still-encrypted) data-encryption key.
pub const WRAPPED_DEK_LEN: usize = 32;
/// Length of the inner declared-length field carried alongside the wrapped
/// DEK, checked against the outer declared length (spec §9 open question:
/// kept as a distinct failure reason rather than collapsed).
pub const DEK_LEN_FIELD_LEN: usize = 2;
/// Length of the DEK's own AEAD nonce.
pub const DEK_NONCE_LEN: usize = 12;
/// Overhead of a DEK-mode frame beyond the plaintext.
pub const DEK_OVERHEAD: usize =
    HEADER_LEN + KEK_NONCE_LEN + WRAPPED_DEK_LEN + DEK_LEN_FIELD_LEN + DEK_NONCE_LEN + TAG_LEN;

const FLAG_DEK: u8 = 0x01;

/// Parsed form of the 8-byte PAXE header: `declared_len(u16 BE) | flags |
/// reserved | key_id(u32 BE)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaxeHeader {
    pub flags: u8,
    pub key_id: u32,
    pub declared_len: u16,
}

impl PaxeHeader {
    pub fn is_dek_mode(&self) -> bool {
        self.flags & FLAG_DEK != 0
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&self.declared_len.to_be_bytes());
        out[2] = self.flags;
        out[3] = 0; // reserved
        out[4..8].copy_from_slice(&self.key_id.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<PaxeHeader> {
        if bytes.len() < HEADER_LEN || bytes[3] != 0 {
            return None;
        }
        Some(PaxeHeader {
            declared_len: u16::from_be_bytes([bytes[0], bytes[1]]),
            flags: bytes[2],
            key_id: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}

/// How a decoder reacts to a rejected frame (CLI `--paxe-fail-policy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Drop silently, only incrementing the counter.
    Drop,
    /// Log the first occurrence of each failure reason, then go quiet.
    #[default]
    LogOnce,
    /// Log every occurrence.
    Verbose,
}

/// One PAXE frame's sealed payload, returned by [`PaxeEncoder`] for tests
/// and for any caller that originates PAXE traffic.
#[derive(Debug, Clone)]
pub struct PaxePacket(pub Vec<u8>);

impl PaxePacket {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}
