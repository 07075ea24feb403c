//! Ed25519 signatures over the directory file.
//!
//! The signature covers every byte of the directory file before the
//! signature section and is stored together with the public key that
//! produced it.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use tracing::debug;
use vpkstore_common::{BinaryReader, BinaryWriter};

use crate::{Error, Result};

/// Ed25519 key length in bytes, for both halves.
pub const KEY_SIZE: usize = 32;

/// Encoded size of a signature section written by [`SigningKeys`].
pub(crate) const SIGNATURE_SECTION_SIZE: usize = 8 + KEY_SIZE + ed25519_dalek::SIGNATURE_LENGTH;

/// Outcome of a signature check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    /// The directory carries no signature.
    NotSigned,
    /// Signed, but not by the key the caller expected.
    WrongKey,
    /// The signed bytes could not be read back, or the key is unusable.
    Failed,
    /// The signature does not match the signed bytes.
    InvalidSignature,
    /// Signature verified.
    ValidSignature,
}

impl SignatureCheck {
    pub fn is_valid(self) -> bool {
        self == Self::ValidSignature
    }
}

/// Key pair used when writing a signed directory.
#[derive(Clone)]
pub struct SigningKeys {
    signing: SigningKey,
}

impl std::fmt::Debug for SigningKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeys")
            .field("public", &hex_prefix(&self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

impl SigningKeys {
    /// Build from a 32-byte private seed and its 32-byte public key.
    ///
    /// The public key must be the one derived from the seed.
    pub fn from_bytes(private_key: &[u8], public_key: &[u8]) -> Result<Self> {
        let seed: [u8; KEY_SIZE] = private_key.try_into().map_err(|_| {
            Error::InvalidKey(format!(
                "private key must be {KEY_SIZE} bytes, got {}",
                private_key.len()
            ))
        })?;
        let keys = Self::from_seed(seed);
        if keys.public_key_bytes().as_slice() != public_key {
            return Err(Error::InvalidKey(
                "public key does not belong to the private key".to_string(),
            ));
        }
        Ok(keys)
    }

    /// Build from a private seed, deriving the public key.
    pub fn from_seed(seed: [u8; KEY_SIZE]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn private_key_bytes(&self) -> [u8; KEY_SIZE] {
        self.signing.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; KEY_SIZE] {
        self.signing.verifying_key().to_bytes()
    }

    pub(crate) fn sign(&self, data: &[u8]) -> SignatureBlock {
        let signature = self.signing.sign(data);
        SignatureBlock {
            public_key: self.public_key_bytes().to_vec(),
            signature: signature.to_bytes().to_vec(),
        }
    }
}

/// Serialized signature section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SignatureBlock {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignatureBlock {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = BinaryReader::new(data);
        let key_len = reader.read_u32()? as usize;
        let public_key = reader.read_bytes(key_len)?.to_vec();
        let sig_len = reader.read_u32()? as usize;
        let signature = reader.read_bytes(sig_len)?.to_vec();

        if !reader.is_empty() {
            return Err(Error::MalformedDirectory(format!(
                "{} trailing bytes after signature",
                reader.remaining()
            )));
        }
        Ok(Self {
            public_key,
            signature,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut writer =
            BinaryWriter::new(Vec::with_capacity(8 + self.public_key.len() + self.signature.len()));
        writer.write_u32(self.public_key.len() as u32)?;
        writer.write_bytes(&self.public_key)?;
        writer.write_u32(self.signature.len() as u32)?;
        writer.write_bytes(&self.signature)?;
        Ok(writer.into_inner())
    }

    /// Whether the block was made by `expected`. `None` accepts any key.
    pub fn accepts_key(&self, expected: Option<&[u8]>) -> bool {
        expected.map_or(true, |key| key == self.public_key.as_slice())
    }

    /// Check `signed` against this block.
    pub fn verify(&self, signed: &[u8], expected_public_key: Option<&[u8]>) -> SignatureCheck {
        if !self.accepts_key(expected_public_key) {
            return SignatureCheck::WrongKey;
        }

        let Ok(key_bytes) = <[u8; KEY_SIZE]>::try_from(self.public_key.as_slice()) else {
            debug!(len = self.public_key.len(), "stored public key has wrong length");
            return SignatureCheck::Failed;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            debug!("stored public key is not a valid point");
            return SignatureCheck::Failed;
        };
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return SignatureCheck::InvalidSignature;
        };

        match key.verify(signed, &signature) {
            Ok(()) => SignatureCheck::ValidSignature,
            Err(_) => SignatureCheck::InvalidSignature,
        }
    }
}
