//! Ed25519 signing and verification of content digests.

use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::path::Path;

use crate::digest::ContentDigest;
use crate::error::{ProvenanceError, Result};

/// Length of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// A digest given either as raw bytes or as hex text.
#[derive(Debug, Clone, Copy)]
pub enum DigestInput<'a> {
    Raw(&'a [u8]),
    Hex(&'a str),
}

impl DigestInput<'_> {
    /// Normalize to the raw bytes that get signed.
    fn to_bytes(self) -> Result<Vec<u8>> {
        match self {
            Self::Raw(bytes) => Ok(bytes.to_vec()),
            Self::Hex(text) => {
                let text = text.trim();
                let text = text.strip_prefix("0x").unwrap_or(text);
                hex::decode(text).map_err(|e| {
                    ProvenanceError::InvalidDigest(format!("Hex decode failed: {}", e))
                })
            }
        }
    }
}

impl<'a> From<&'a ContentDigest> for DigestInput<'a> {
    fn from(digest: &'a ContentDigest) -> Self {
        Self::Raw(digest.as_bytes())
    }
}

impl<'a> From<&'a [u8]> for DigestInput<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        Self::Raw(bytes)
    }
}

impl<'a> From<&'a str> for DigestInput<'a> {
    fn from(text: &'a str) -> Self {
        Self::Hex(text)
    }
}

impl<'a> From<&'a String> for DigestInput<'a> {
    fn from(text: &'a String) -> Self {
        Self::Hex(text)
    }
}

/// Device-held signing key.
pub struct DeviceKey {
    inner: SigningKey,
}

impl DeviceKey {
    /// Generate a fresh key from the operating system RNG.
    pub fn generate() -> Self {
        Self {
            inner: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            inner: SigningKey::from_bytes(seed),
        }
    }

    /// Load a password-less PKCS#8 PEM private key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let inner = SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| ProvenanceError::KeyLoad(format!("Invalid PKCS#8 PEM: {}", e)))?;
        Ok(Self { inner })
    }

    pub fn from_pem_file(path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path)?;
        Self::from_pem(&pem)
    }

    pub fn to_pem(&self) -> Result<String> {
        self.inner
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.as_str().to_owned())
            .map_err(|e| ProvenanceError::KeyLoad(format!("PEM encoding failed: {}", e)))
    }

    /// Raw 32-byte Ed25519 public key, as published to the registry.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.inner.verifying_key().to_bytes()
    }

    /// Sign the raw digest bytes and return the 64-byte signature.
    ///
    /// Fails only when a hex digest does not decode.
    pub fn sign<'a>(&self, digest: impl Into<DigestInput<'a>>) -> Result<Vec<u8>> {
        let message = digest.into().to_bytes()?;
        Ok(self.inner.sign(&message).to_bytes().to_vec())
    }
}

impl std::fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKey")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// Sign a digest with a PEM-encoded private key.
pub fn sign_with_pem<'a>(pem: &str, digest: impl Into<DigestInput<'a>>) -> Result<Vec<u8>> {
    DeviceKey::from_pem(pem)?.sign(digest)
}

/// Check `signature` over `digest` against `public_key`.
///
/// Returns `false` for anything that does not verify, including keys and
/// signatures of the wrong length and digests that are not valid hex.
pub fn verify<'a>(public_key: &[u8], digest: impl Into<DigestInput<'a>>, signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; PUBLIC_KEY_LEN]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    let Ok(message) = digest.into().to_bytes() else {
        return false;
    };

    verifying_key.verify(&message, &signature).is_ok()
}
