//! Cryptographic primitives for Vaultline.
//!
//! Provides two things:
//!   1. RSA key exchange. The client's RSA key wraps the session AES key
//!   2. AES-256-CBC for bulk encryption of file contents
//!
//! Protocol constants, not recommendations: RSA modulus is 1024 bits and the
//! CBC IV is all zeroes. Both are part of the wire contract with existing
//! peers. See DESIGN.md before changing either.
//!
//! AES key material derives ZeroizeOnDrop. There is no unsafe code here.

use std::fmt;

use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::Oaep;
pub use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// RSA modulus size in bits.
pub const RSA_KEY_BITS: usize = 1024;

/// AES-256 key length in bytes.
pub const AES_KEY_LEN: usize = 32;

/// AES block size in bytes.
pub const AES_BLOCK_LEN: usize = 16;

/// Fixed CBC initialisation vector.
const ZERO_IV: [u8; AES_BLOCK_LEN] = [0u8; AES_BLOCK_LEN];

// ── AES ──────────────────────────────────────────────────────────────────────

/// A 32-byte AES-256 session key. Wiped from memory when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AesKey([u8; AES_KEY_LEN]);

impl AesKey {
    /// Generate a fresh random session key.
    pub fn generate() -> Self {
        let mut key = [0u8; AES_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Build a key from raw bytes. Anything but exactly 32 bytes is refused.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; AES_KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeySize {
                    expected: AES_KEY_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; AES_KEY_LEN] {
        &self.0
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(&self.0.into(), &ZERO_IV.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_LEN != 0 {
            return Err(CryptoError::InvalidCiphertextLength(ciphertext.len()));
        }
        Aes256CbcDec::new(&self.0.into(), &ZERO_IV.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::BadPadding)
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(..)")
    }
}

/// AES-256-CBC encrypt with PKCS7 padding and the fixed zero IV.
///
/// `key` must be exactly 32 bytes; a short key never reaches the cipher.
pub fn aes_encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Ok(AesKey::from_slice(key)?.encrypt(plaintext))
}

/// Inverse of [`aes_encrypt`]. Invalid padding is [`CryptoError::BadPadding`].
pub fn aes_decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    AesKey::from_slice(key)?.decrypt(ciphertext)
}

// ── RSA ──────────────────────────────────────────────────────────────────────

fn oaep() -> Oaep {
    Oaep::new::<Sha256>()
}

/// Generate a fresh RSA key pair of [`RSA_KEY_BITS`] bits.
pub fn generate_keypair() -> Result<(RsaPublicKey, RsaPrivateKey), CryptoError> {
    let private = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    let public = RsaPublicKey::from(&private);
    Ok((public, private))
}

/// RSA-OAEP encrypt. Only ever used to wrap session keys, never bulk data.
pub fn rsa_encrypt(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Ok(key.encrypt(&mut OsRng, oaep(), data)?)
}

/// RSA-OAEP decrypt.
pub fn rsa_decrypt(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Ok(key.decrypt(oaep(), data)?)
}

/// Wrap a session key for transport under the peer's public key.
pub fn wrap_aes_key(key: &RsaPublicKey, aes: &AesKey) -> Result<Vec<u8>, CryptoError> {
    rsa_encrypt(key, aes.as_bytes())
}

/// Unwrap a session key. The plaintext must be exactly 32 bytes.
pub fn unwrap_aes_key(key: &RsaPrivateKey, wrapped: &[u8]) -> Result<AesKey, CryptoError> {
    let raw = Zeroizing::new(rsa_decrypt(key, wrapped)?);
    AesKey::from_slice(&raw)
}

/// Serialize a public key as DER SubjectPublicKeyInfo.
pub fn public_key_to_der(key: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
    key.to_public_key_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| CryptoError::Encoding(e.to_string()))
}

/// Parse a DER SubjectPublicKeyInfo. Keys below [`RSA_KEY_BITS`] are refused.
pub fn public_key_from_der(der: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    let key = RsaPublicKey::from_public_key_der(der)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    let modulus_bytes = key.size();
    if modulus_bytes * 8 < RSA_KEY_BITS {
        return Err(CryptoError::InvalidKeySize {
            expected: RSA_KEY_BITS / 8,
            actual: modulus_bytes,
        });
    }
    Ok(key)
}

// ── Keypair ──────────────────────────────────────────────────────────────────

/// A client's RSA key pair. The private half never leaves this struct
/// except through [`RsaKeypair::private_der`].
pub struct RsaKeypair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl RsaKeypair {
    pub fn generate() -> Result<Self, CryptoError> {
        let (public, private) = generate_keypair()?;
        Ok(Self { private, public })
    }

    /// Reconstruct from PKCS#8 DER. The public key is derived from the private key.
    pub fn from_private_der(der: &[u8]) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self { private, public })
    }

    /// Serialize the private key as PKCS#8 DER for external storage.
    pub fn private_der(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        self.private
            .to_pkcs8_der()
            .map(|doc| Zeroizing::new(doc.as_bytes().to_vec()))
            .map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    pub fn public_der(&self) -> Result<Vec<u8>, CryptoError> {
        public_key_to_der(&self.public)
    }

    pub fn public(&self) -> &RsaPublicKey {
        &self.public
    }

    pub fn unwrap_aes_key(&self, wrapped: &[u8]) -> Result<AesKey, CryptoError> {
        unwrap_aes_key(&self.private, wrapped)
    }
}

impl fmt::Debug for RsaKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKeypair")
            .field("bits", &(self.public.size() * 8))
            .finish_non_exhaustive()
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("RSA key generation failed: {0}")]
    KeyGeneration(String),

    #[error("RSA operation failed: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("invalid RSA public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid RSA private key: {0}")]
    InvalidPrivateKey(String),

    #[error("key encoding failed: {0}")]
    Encoding(String),

    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    #[error("bad PKCS7 padding")]
    BadPadding,

    #[error("ciphertext length {0} is not a positive multiple of the block size")]
    InvalidCiphertextLength(usize),
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::cipher::block_padding::NoPadding;

    // ── AES ──────────────────────────────────────────────────────────────────

    #[test]
    fn aes_round_trip_across_lengths() {
        let key = AesKey::generate();
        for len in [0usize, 1, 15, 16, 17, 31, 32, 1000] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let ciphertext = aes_encrypt(key.as_bytes(), &plaintext).unwrap();
            assert_eq!(ciphertext.len() % AES_BLOCK_LEN, 0);
            assert!(ciphertext.len() > plaintext.len(), "PKCS7 always pads");
            let recovered = aes_decrypt(key.as_bytes(), &ciphertext).unwrap();
            assert_eq!(recovered, plaintext, "length {len}");
        }
    }

    #[test]
    fn fixed_iv_makes_encryption_deterministic() {
        // Documented protocol contract: same key + same plaintext = same ciphertext.
        let key = AesKey::generate();
        assert_eq!(key.encrypt(b"backup me"), key.encrypt(b"backup me"));
    }

    #[test]
    fn short_key_is_refused() {
        let err = aes_encrypt(&[0u8; 16], b"data").unwrap_err();
        assert!(matches!(
            err,
            CryptoError::InvalidKeySize {
                expected: 32,
                actual: 16
            }
        ));
        assert!(aes_decrypt(&[0u8; 31], &[0u8; 16]).is_err());
    }

    #[test]
    fn invalid_padding_is_reported() {
        let key = AesKey::generate();
        // One block whose plaintext ends in 0x00, which is never valid PKCS7.
        let block = Aes256CbcEnc::new(&(*key.as_bytes()).into(), &ZERO_IV.into())
            .encrypt_padded_vec_mut::<NoPadding>(&[0u8; AES_BLOCK_LEN]);
        let err = key.decrypt(&block).unwrap_err();
        assert!(matches!(err, CryptoError::BadPadding));
    }

    #[test]
    fn misaligned_ciphertext_is_rejected() {
        let key = AesKey::generate();
        assert!(matches!(
            key.decrypt(&[0u8; 17]),
            Err(CryptoError::InvalidCiphertextLength(17))
        ));
        assert!(matches!(
            key.decrypt(&[]),
            Err(CryptoError::InvalidCiphertextLength(0))
        ));
    }

    #[test]
    fn wrong_key_does_not_recover_plaintext() {
        let a = AesKey::generate();
        let b = AesKey::generate();
        let ciphertext = a.encrypt(b"secret contents of a file");
        match b.decrypt(&ciphertext) {
            Ok(pt) => assert_ne!(pt, b"secret contents of a file"),
            Err(e) => assert!(matches!(e, CryptoError::BadPadding)),
        }
    }

    #[test]
    fn aes_key_debug_is_redacted() {
        let key = AesKey::from_slice(&[0xab; 32]).unwrap();
        assert_eq!(format!("{key:?}"), "AesKey(..)");
    }

    // ── RSA ──────────────────────────────────────────────────────────────────

    #[test]
    fn rsa_wraps_and_unwraps_session_key() {
        let (public, private) = generate_keypair().unwrap();
        let aes = AesKey::generate();
        let wrapped = wrap_aes_key(&public, &aes).unwrap();
        assert_eq!(wrapped.len(), RSA_KEY_BITS / 8);
        assert_eq!(unwrap_aes_key(&private, &wrapped).unwrap(), aes);
    }

    #[test]
    fn unwrap_rejects_wrong_length_key() {
        let (public, private) = generate_keypair().unwrap();
        let wrapped = rsa_encrypt(&public, &[1u8; 16]).unwrap();
        assert!(matches!(
            unwrap_aes_key(&private, &wrapped),
            Err(CryptoError::InvalidKeySize {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn public_key_der_round_trip() {
        let pair = RsaKeypair::generate().unwrap();
        let der = pair.public_der().unwrap();
        let parsed = public_key_from_der(&der).unwrap();
        assert_eq!(&parsed, pair.public());
    }

    #[test]
    fn garbage_public_key_is_rejected() {
        assert!(matches!(
            public_key_from_der(b"definitely not DER"),
            Err(CryptoError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn undersized_public_key_is_rejected() {
        let small = RsaPrivateKey::new(&mut OsRng, 512).unwrap();
        let der = public_key_to_der(&RsaPublicKey::from(&small)).unwrap();
        assert!(matches!(
            public_key_from_der(&der),
            Err(CryptoError::InvalidKeySize { .. })
        ));
    }

    #[test]
    fn keypair_survives_private_der_round_trip() {
        let pair = RsaKeypair::generate().unwrap();
        let der = pair.private_der().unwrap();
        let restored = RsaKeypair::from_private_der(&der).unwrap();
        assert_eq!(restored.public(), pair.public());

        let aes = AesKey::generate();
        let wrapped = wrap_aes_key(pair.public(), &aes).unwrap();
        assert_eq!(restored.unwrap_aes_key(&wrapped).unwrap(), aes);
    }
}
