//! Cipher providers for transport encryption.
//!
//! A [`Cipher`] is selected once per task from its [`SecurityMode`] and then
//! used for every frame the engine puts on the wire: ACKs, size indicators,
//! length fields and payloads. Each provider declares a constant size
//! overhead, which is what lets the receiver know exactly how many bytes an
//! encrypted 1-byte ACK occupies.
//!
//! | mode | overhead | layout |
//! |------|----------|--------|
//! | `None` | 0 | plaintext |
//! | `*Low` | 16 | AES-GCM-SIV `ciphertext ‖ tag`, nonce derived from the key |
//! | `*High` | 28 | ChaCha20-Poly1305 `nonce(12) ‖ ciphertext ‖ tag`, random nonce |
//!
//! Low modes are deterministic: identical plaintexts produce identical
//! frames. GCM-SIV derives its keystream from the plaintext as well as the
//! nonce, so a fixed nonce reveals only that two frames are equal. High modes
//! are fully randomised.

use std::fmt;
use std::sync::Arc;

use aes_gcm_siv::{Aes128GcmSiv, Aes256GcmSiv};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::config::{SecurityMode, MIN_PASSPHRASE_LEN};
use crate::error::{constants, ProtocolError, Result};

/// AEAD tag length
pub const TAG_LEN: usize = 16;

/// Nonce length for ChaCha20-Poly1305
pub const NONCE_LEN: usize = 12;

/// Encrypts and decrypts wire frames with a fixed size overhead
pub trait Cipher: Send + Sync + fmt::Debug {
    /// The mode this provider implements
    fn mode(&self) -> SecurityMode;

    /// Bytes added to every encrypted frame
    fn overhead(&self) -> usize {
        self.mode().overhead()
    }

    /// Encrypt a frame
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a frame produced by [`Cipher::encrypt`]
    fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through provider for [`SecurityMode::None`]
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainCipher;

impl Cipher for PlainCipher {
    fn mode(&self) -> SecurityMode {
        SecurityMode::None
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>> {
        Ok(frame.to_vec())
    }
}

/// Keyed AEAD behind a symmetric mode
enum Sealer {
    /// 128-bit low mode, fixed nonce
    Siv128(Box<Aes128GcmSiv>, [u8; NONCE_LEN]),
    /// 256-bit low mode, fixed nonce
    Siv256(Box<Aes256GcmSiv>, [u8; NONCE_LEN]),
    /// High modes, random nonce per frame
    ChaCha(Box<ChaCha20Poly1305>),
}

/// AEAD provider for the symmetric modes
pub struct SealedCipher {
    mode: SecurityMode,
    sealer: Sealer,
}

impl fmt::Debug for SealedCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedCipher")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl SealedCipher {
    /// Build a provider for a symmetric `mode` keyed from `passphrase`
    pub fn new(mode: SecurityMode, passphrase: &str) -> Result<Self> {
        if !mode.is_symmetric() {
            return Err(ProtocolError::ConfigError(format!(
                "{mode:?} is not a symmetric security mode"
            )));
        }
        if passphrase.chars().count() < MIN_PASSPHRASE_LEN {
            return Err(ProtocolError::ConfigError(
                constants::ERR_PASSPHRASE_REQUIRED.into(),
            ));
        }

        let mut key = derive_key(mode, passphrase);
        let sealer = if mode.is_high() {
            ChaCha20Poly1305::new_from_slice(&key).map(|aead| Sealer::ChaCha(Box::new(aead)))
        } else if mode.key_bits() == 128 {
            Aes128GcmSiv::new_from_slice(&key[..16])
                .map(|aead| Sealer::Siv128(Box::new(aead), derive_nonce(&key)))
        } else {
            Aes256GcmSiv::new_from_slice(&key)
                .map(|aead| Sealer::Siv256(Box::new(aead), derive_nonce(&key)))
        };
        key.zeroize();

        Ok(Self {
            mode,
            sealer: sealer.map_err(|_| ProtocolError::EncryptionFailure)?,
        })
    }

    fn generate_nonce() -> Result<[u8; NONCE_LEN]> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::fill(&mut nonce).map_err(|_| ProtocolError::EncryptionFailure)?;
        Ok(nonce)
    }
}

impl Cipher for SealedCipher {
    fn mode(&self) -> SecurityMode {
        self.mode
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = match &self.sealer {
            Sealer::Siv128(aead, nonce) => aead.encrypt(Nonce::from_slice(nonce), plaintext),
            Sealer::Siv256(aead, nonce) => aead.encrypt(Nonce::from_slice(nonce), plaintext),
            Sealer::ChaCha(aead) => {
                let mut nonce = Self::generate_nonce()?;
                let sealed = aead
                    .encrypt(Nonce::from_slice(&nonce), plaintext)
                    .map_err(|_| ProtocolError::EncryptionFailure)?;
                let mut frame = Vec::with_capacity(NONCE_LEN + sealed.len());
                frame.extend_from_slice(&nonce);
                frame.extend_from_slice(&sealed);
                nonce.zeroize();
                return Ok(frame);
            }
        };
        sealed.map_err(|_| ProtocolError::EncryptionFailure)
    }

    fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < self.overhead() {
            return Err(ProtocolError::DecryptionFailure);
        }
        let opened = match &self.sealer {
            Sealer::Siv128(aead, nonce) => aead.decrypt(Nonce::from_slice(nonce), frame),
            Sealer::Siv256(aead, nonce) => aead.decrypt(Nonce::from_slice(nonce), frame),
            Sealer::ChaCha(aead) => {
                let (nonce, sealed) = frame.split_at(NONCE_LEN);
                aead.decrypt(Nonce::from_slice(nonce), sealed)
            }
        };
        opened.map_err(|_| ProtocolError::DecryptionFailure)
    }
}

/// Select the provider for `mode`.
///
/// Symmetric modes require a passphrase of at least
/// [`MIN_PASSPHRASE_LEN`] characters.
pub fn cipher_for(mode: SecurityMode, passphrase: Option<&str>) -> Result<Arc<dyn Cipher>> {
    if !mode.is_symmetric() {
        return Ok(Arc::new(PlainCipher));
    }
    let passphrase = passphrase
        .ok_or_else(|| ProtocolError::ConfigError(constants::ERR_PASSPHRASE_REQUIRED.into()))?;
    Ok(Arc::new(SealedCipher::new(mode, passphrase)?))
}

/// Derive the AEAD key for a mode.
///
/// 128-bit modes hash the passphrase down to 16 bytes of material before
/// stretching it to the 32-byte key the AEAD needs.
fn derive_key(mode: SecurityMode, passphrase: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"socket-engine/key");
    hasher.update(passphrase.as_bytes());
    let mut digest: [u8; 32] = hasher.finalize().into();

    if mode.key_bits() == 128 {
        let mut expand = Sha256::new();
        expand.update(b"socket-engine/key128");
        expand.update(&digest[..16]);
        digest.zeroize();
        return expand.finalize().into();
    }
    digest
}

fn derive_nonce(key: &[u8; 32]) -> [u8; NONCE_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(b"socket-engine/nonce");
    hasher.update(key);
    let digest = hasher.finalize();
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&digest[..NONCE_LEN]);
    nonce
}
