//! Client-side key material for one process lifetime.

use vaultline_core::crypto::{AesKey, CryptoError, RsaKeypair};

/// The client's RSA key pair and, after key exchange, the session AES key.
///
/// Nothing here is written to disk; callers that want a stable identity
/// persist the private key themselves via [`RsaKeypair::private_der`].
#[derive(Debug)]
pub struct CryptoContext {
    keypair: RsaKeypair,
    session_key: Option<AesKey>,
}

impl CryptoContext {
    /// Fresh key pair, no session key.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self::from_keypair(RsaKeypair::generate()?))
    }

    pub fn from_keypair(keypair: RsaKeypair) -> Self {
        Self {
            keypair,
            session_key: None,
        }
    }

    pub fn keypair(&self) -> &RsaKeypair {
        &self.keypair
    }

    pub fn public_der(&self) -> Result<Vec<u8>, CryptoError> {
        self.keypair.public_der()
    }

    /// Unwrap a session key sent by the server and keep it, replacing any
    /// previous one.
    pub fn install_wrapped_key(&mut self, wrapped: &[u8]) -> Result<(), CryptoError> {
        let key = self.keypair.unwrap_aes_key(wrapped)?;
        self.session_key = Some(key);
        Ok(())
    }

    pub fn session_key(&self) -> Option<&AesKey> {
        self.session_key.as_ref()
    }
}
