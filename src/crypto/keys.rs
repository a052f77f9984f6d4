/* This file is part of Retro
 *
 * Copyright (C) 2023-2026 Dyne.org foundation
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Identity key pairs.
//!
//! A user identity consists of two keys: an RSA-2048 key used to encrypt
//! message headers towards the owner, and an Ed25519 key used to sign
//! message bodies and handshake nonces. Both halves are serialized as two
//! concatenated PKCS#8 PEM blocks, RSA first, separated by a newline.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use pkcs8::{
    spki::{DecodePublicKey, EncodePublicKey},
    DecodePrivateKey, EncodePrivateKey, LineEnding,
};
use rand::rngs::OsRng;
use rsa::{sha2::Sha256, Oaep, RsaPrivateKey, RsaPublicKey};

use super::hash_sha512;
use crate::{protocol::ED_SIG_SIZE, Error, Result};

/// RSA modulus size in bits
const RSA_BITS: usize = 2048;

/// Number of symbols in a key fingerprint
const FINGERPRINT_LEN: usize = 16;

/// A user's private identity key pair.
pub struct IdentityPrivateKey {
    rsa: RsaPrivateKey,
    ec: SigningKey,
}

impl IdentityPrivateKey {
    /// Generate a fresh RSA-2048 (e=65537) and Ed25519 key pair.
    pub fn generate() -> Result<Self> {
        let rsa = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
            .map_err(|e| Error::OperationFailed(format!("RSA keygen: {}", e)))?;
        let ec = SigningKey::generate(&mut OsRng);
        Ok(Self { rsa, ec })
    }

    /// Sign data with the Ed25519 key. Returns the 64-byte signature.
    pub fn sign(&self, data: &[u8]) -> [u8; ED_SIG_SIZE] {
        self.ec.sign(data).to_bytes()
    }

    /// Decrypt an RSA-OAEP-SHA256 ciphertext.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.rsa.decrypt(Oaep::new::<Sha256>(), ciphertext).map_err(|_| Error::InvalidPadding)
    }

    /// Return the public half of this identity.
    pub fn public(&self) -> IdentityPublicKey {
        IdentityPublicKey { rsa: RsaPublicKey::from(&self.rsa), ec: self.ec.verifying_key() }
    }

    /// Serialize both private keys as two concatenated PEM blocks.
    pub fn to_pem(&self) -> Result<String> {
        let rsa_pem = self
            .rsa
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::InvalidPem(e.to_string()))?;
        let ec_pem =
            self.ec.to_pkcs8_pem(LineEnding::LF).map_err(|e| Error::InvalidPem(e.to_string()))?;
        Ok(format!("{}\n{}", rsa_pem.as_str(), ec_pem.as_str()))
    }

    /// Serialize the private keys as separate PEM strings `(rsa, ec)`.
    pub fn to_pem_strings(&self) -> Result<(String, String)> {
        let rsa_pem = self
            .rsa
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::InvalidPem(e.to_string()))?;
        let ec_pem =
            self.ec.to_pkcs8_pem(LineEnding::LF).map_err(|e| Error::InvalidPem(e.to_string()))?;
        Ok((rsa_pem.to_string(), ec_pem.to_string()))
    }

    /// Parse a private key pair from two concatenated PEM blocks.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let (rsa_pem, ec_pem) = split_pem_blocks(pem)?;
        Self::from_pem_strings(&rsa_pem, &ec_pem)
    }

    /// Parse a private key pair from separate PEM strings.
    pub fn from_pem_strings(rsa_pem: &str, ec_pem: &str) -> Result<Self> {
        let rsa = RsaPrivateKey::from_pkcs8_pem(rsa_pem)
            .map_err(|e| Error::InvalidPem(format!("rsa: {}", e)))?;
        let ec = SigningKey::from_pkcs8_pem(ec_pem)
            .map_err(|e| Error::InvalidPem(format!("ed25519: {}", e)))?;
        Ok(Self { rsa, ec })
    }
}

/// A user's public identity key pair.
#[derive(Clone)]
pub struct IdentityPublicKey {
    rsa: RsaPublicKey,
    ec: VerifyingKey,
}

impl IdentityPublicKey {
    /// Encrypt data towards this identity with RSA-OAEP-SHA256.
    ///
    /// The ciphertext is exactly 256 bytes for inputs of up to 190 bytes.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.rsa
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), data)
            .map_err(|e| Error::EncryptionFailed(e.to_string()))
    }

    /// Verify an Ed25519 signature over `data`.
    pub fn verify(&self, signature: &[u8], data: &[u8]) -> bool {
        let Ok(sig_bytes) = <[u8; ED_SIG_SIZE]>::try_from(signature) else { return false };
        let sig = Signature::from_bytes(&sig_bytes);
        self.ec.verify(data, &sig).is_ok()
    }

    /// Serialize both public keys as two concatenated PEM blocks.
    pub fn to_pem(&self) -> Result<String> {
        let (rsa_pem, ec_pem) = self.to_pem_strings()?;
        Ok(format!("{}\n{}", rsa_pem, ec_pem))
    }

    /// Serialize the public keys as separate PEM strings `(rsa, ec)`.
    pub fn to_pem_strings(&self) -> Result<(String, String)> {
        let rsa_pem = self
            .rsa
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::InvalidPem(e.to_string()))?;
        let ec_pem = self
            .ec
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::InvalidPem(e.to_string()))?;
        Ok((rsa_pem, ec_pem))
    }

    /// Parse a public key pair from two concatenated PEM blocks.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let (rsa_pem, ec_pem) = split_pem_blocks(pem)?;
        Self::from_pem_strings(&rsa_pem, &ec_pem)
    }

    /// Parse a public key pair from separate PEM strings.
    pub fn from_pem_strings(rsa_pem: &str, ec_pem: &str) -> Result<Self> {
        let rsa = RsaPublicKey::from_public_key_pem(rsa_pem)
            .map_err(|e| Error::InvalidPem(format!("rsa: {}", e)))?;
        let ec = VerifyingKey::from_public_key_pem(ec_pem)
            .map_err(|e| Error::InvalidPem(format!("ed25519: {}", e)))?;
        Ok(Self { rsa, ec })
    }

    /// Return the DER encodings of both public keys `(rsa, ec)`.
    pub fn to_der(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let rsa_der = self
            .rsa
            .to_public_key_der()
            .map_err(|e| Error::InvalidPem(e.to_string()))?
            .as_bytes()
            .to_vec();
        let ec_der = self
            .ec
            .to_public_key_der()
            .map_err(|e| Error::InvalidPem(e.to_string()))?
            .as_bytes()
            .to_vec();
        Ok((rsa_der, ec_der))
    }

    /// Return the stable 16-symbol fingerprint of this identity.
    ///
    /// Computed as SHA-512 over the concatenated DER encodings, sampling
    /// one byte every 8 bytes of the digest. This is a human verification
    /// tag, not a user id (those are server-assigned).
    pub fn fingerprint(&self) -> Result<String> {
        let (rsa_der, ec_der) = self.to_der()?;

        let mut buf = rsa_der;
        buf.extend_from_slice(&ec_der);
        let digest = hash_sha512(&buf);

        let sampled: Vec<u8> = digest.iter().step_by(8).copied().collect();
        let mut tag = hex::encode(sampled);
        tag.truncate(FINGERPRINT_LEN);
        Ok(tag)
    }
}

/// Split a buffer holding two concatenated PEM blocks.
///
/// Locates the two `-----BEGIN` markers in order and splits between them.
fn split_pem_blocks(pem: &str) -> Result<(String, String)> {
    const MARKER: &str = "-----BEGIN";

    let first = pem.find(MARKER).ok_or_else(|| Error::InvalidPem("no PEM block".to_string()))?;
    let second = pem[first + 1..]
        .find(MARKER)
        .map(|i| first + 1 + i)
        .ok_or_else(|| Error::InvalidPem("missing second PEM block".to_string()))?;

    Ok((pem[first..second].trim().to_string(), pem[second..].trim().to_string()))
}
