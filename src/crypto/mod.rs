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

//! Crypto primitives used by the messenger core.

use std::{
    fs::File,
    io::{Read, Write},
    path::Path,
};

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

use crate::{
    protocol::{HMAC_SIZE, IV_SIZE},
    Error, Result,
};

/// Identity key pairs and PEM serialization
pub mod keys;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Block size the protocol's PKCS#7 padding is applied over.
/// This is 256 bits, twice the AES block size, fixed by the wire format.
const PAD_BLOCK_SIZE: usize = 32;

/// Return `n` random bytes from the OS RNG.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Return a random lowercase hex string of `n` symbols (`n` must be even).
pub fn random_hex(n: usize) -> String {
    hex::encode(random_bytes(n / 2))
}

/// SHA-256 digest
pub fn hash_sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-512 digest
pub fn hash_sha512(data: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(data);
    let mut out = [0u8; 64];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// HMAC-SHA256 tag over `data` with `key`
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; HMAC_SIZE] {
    // HMAC accepts keys of any length, this cannot fail
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac key");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time comparison of two HMAC tags.
pub fn hmac_verify(expected: &[u8], actual: &[u8]) -> bool {
    expected.ct_eq(actual).into()
}

/// Derive a key from a passphrase and salt.
///
/// This is the messenger's bespoke KDF, kept bit-compatible with existing
/// accounts: the state is seeded with `passphrase ‖ salt` and hashed with
/// SHA-512 for `iterations` rounds, then truncated to `out_len` bytes.
///
/// NOTE: This construction is weaker than PBKDF2/scrypt/argon2 since it
/// has no memory hardness and a cheap per-round cost. New account schemas
/// should move to a standard KDF behind a version flag.
pub fn derive_key(passphrase: &[u8], salt: &[u8], out_len: usize, iterations: u32) -> Vec<u8> {
    let mut state = Vec::with_capacity(passphrase.len() + salt.len());
    state.extend_from_slice(passphrase);
    state.extend_from_slice(salt);

    let mut digest = hash_sha512(&state);
    for _ in 1..iterations {
        digest = hash_sha512(&digest);
    }

    digest[..out_len].to_vec()
}

/// Number of KDF rounds for the account-open key
pub const KDF_ITER_DEFAULT: u32 = 10_000;
/// Number of KDF rounds for per-conversation subkeys
pub const KDF_ITER_CONVERSATION: u32 = 100_000;
/// Number of KDF rounds for the session master key re-stretch
pub const KDF_ITER_SESSION: u32 = 200_000;

/// Apply PKCS#7 padding over [`PAD_BLOCK_SIZE`] blocks.
fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad = PAD_BLOCK_SIZE - (data.len() % PAD_BLOCK_SIZE);
    let mut padded = Vec::with_capacity(data.len() + pad);
    padded.extend_from_slice(data);
    padded.resize(data.len() + pad, pad as u8);
    padded
}

/// Strip PKCS#7 padding over [`PAD_BLOCK_SIZE`] blocks.
fn pkcs7_unpad(data: &[u8]) -> Result<&[u8]> {
    if data.is_empty() || data.len() % PAD_BLOCK_SIZE != 0 {
        return Err(Error::InvalidPadding)
    }

    let pad = data[data.len() - 1] as usize;
    if pad == 0 || pad > PAD_BLOCK_SIZE || pad > data.len() {
        return Err(Error::InvalidPadding)
    }

    if !data[data.len() - pad..].iter().all(|&b| b == pad as u8) {
        return Err(Error::InvalidPadding)
    }

    Ok(&data[..data.len() - pad])
}

/// Encrypt data with AES-256-CBC under a fresh random IV.
///
/// Returns `(ciphertext, iv)`.
pub fn aes_encrypt(key: &[u8; 32], data: &[u8]) -> (Vec<u8>, [u8; IV_SIZE]) {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let padded = pkcs7_pad(data);
    let ct = Aes256CbcEnc::new(key.into(), &iv.into()).encrypt_padded_vec_mut::<NoPadding>(&padded);

    (ct, iv)
}

/// Decrypt AES-256-CBC data and strip the padding.
pub fn aes_decrypt(key: &[u8; 32], data: &[u8], iv: &[u8; IV_SIZE]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % 16 != 0 {
        return Err(Error::InvalidPadding)
    }

    let padded = Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<NoPadding>(data)
        .map_err(|_| Error::InvalidPadding)?;

    Ok(pkcs7_unpad(&padded)?.to_vec())
}

/// Compress and encrypt a file into a transfer blob.
///
/// The blob layout is `iv:16 ‖ hmac:32 ‖ ciphertext`, where the plaintext
/// is zlib-compressed before encryption and the HMAC is computed over the
/// ciphertext with the file key itself.
pub fn aes_encrypt_from_file(key: &[u8; 32], filepath: &Path) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    File::open(filepath)?.read_to_end(&mut data)?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&data)?;
    let compressed = encoder.finish()?;

    let (ct, iv) = aes_encrypt(key, &compressed);
    let tag = hmac_sha256(key, &ct);

    let mut blob = Vec::with_capacity(IV_SIZE + HMAC_SIZE + ct.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&tag);
    blob.extend_from_slice(&ct);

    Ok(blob)
}

/// Verify, decrypt and decompress a transfer blob into a file.
///
/// The HMAC is checked before any decryption or decompression happens.
pub fn aes_decrypt_to_file(key: &[u8; 32], blob: &[u8], filepath: &Path) -> Result<()> {
    if blob.len() < IV_SIZE + HMAC_SIZE {
        return Err(Error::Truncated)
    }

    let iv: [u8; IV_SIZE] = blob[..IV_SIZE].try_into().unwrap();
    let tag = &blob[IV_SIZE..IV_SIZE + HMAC_SIZE];
    let ct = &blob[IV_SIZE + HMAC_SIZE..];

    if !hmac_verify(&hmac_sha256(key, ct), tag) {
        return Err(Error::HmacMismatch)
    }

    let compressed = aes_decrypt(key, ct, &iv)?;

    let mut data = Vec::new();
    ZlibDecoder::new(&compressed[..]).read_to_end(&mut data)?;

    File::create(filepath)?.write_all(&data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_deterministic() {
        let k0 = derive_key(b"hunter2", b"salt", 16, 1000);
        let k1 = derive_key(b"hunter2", b"salt", 16, 1000);
        assert_eq!(k0, k1);
        assert_eq!(k0.len(), 16);

        // Any input change must change the output
        assert_ne!(k0, derive_key(b"hunter3", b"salt", 16, 1000));
        assert_ne!(k0, derive_key(b"hunter2", b"pepper", 16, 1000));
        assert_ne!(k0, derive_key(b"hunter2", b"salt", 16, 1001));
    }

    #[test]
    fn test_pkcs7_pad_block_size() {
        // Padding is always applied over 32-byte blocks
        assert_eq!(pkcs7_pad(b"").len(), 32);
        assert_eq!(pkcs7_pad(&[0u8; 31]).len(), 32);
        assert_eq!(pkcs7_pad(&[0u8; 32]).len(), 64);

        let padded = pkcs7_pad(b"hello");
        assert_eq!(pkcs7_unpad(&padded).unwrap(), b"hello");
    }

    #[test]
    fn test_pkcs7_unpad_rejects_garbage() {
        assert!(pkcs7_unpad(&[]).is_err());
        assert!(pkcs7_unpad(&[0u8; 32]).is_err());
        assert!(pkcs7_unpad(&[33u8; 32]).is_err());

        let mut padded = pkcs7_pad(b"hello");
        let n = padded.len();
        padded[n - 2] ^= 0xff;
        assert!(pkcs7_unpad(&padded).is_err());
    }

    #[test]
    fn test_aes_roundtrip() {
        let key: [u8; 32] = random_bytes(32).try_into().unwrap();
        let (ct, iv) = aes_encrypt(&key, b"the quick brown fox");
        assert_eq!(ct.len() % 32, 0);
        assert_eq!(aes_decrypt(&key, &ct, &iv).unwrap(), b"the quick brown fox");
    }

    #[test]
    fn test_aes_wrong_key_fails() {
        let key: [u8; 32] = random_bytes(32).try_into().unwrap();
        let mut other = key;
        other[0] ^= 1;

        let (ct, iv) = aes_encrypt(&key, b"some plaintext data here");
        let res = aes_decrypt(&other, &ct, &iv);
        // Either the padding check catches it, or in the unlikely case the
        // padding survives, the plaintext must differ.
        if let Ok(pt) = res {
            assert_ne!(pt, b"some plaintext data here");
        }
    }

    #[test]
    fn test_hmac_verify() {
        let tag = hmac_sha256(b"key", b"data");
        assert!(hmac_verify(&tag, &hmac_sha256(b"key", b"data")));
        assert!(!hmac_verify(&tag, &hmac_sha256(b"key", b"datb")));
        assert!(!hmac_verify(&tag, &hmac_sha256(b"kez", b"data")));
    }

    #[test]
    fn test_file_blob_roundtrip() {
        let dir = std::env::temp_dir();
        let src = dir.join("retro_crypto_test_src");
        let dst = dir.join("retro_crypto_test_dst");

        let content = random_bytes(4096);
        std::fs::write(&src, &content).unwrap();

        let key: [u8; 32] = random_bytes(32).try_into().unwrap();
        let blob = aes_encrypt_from_file(&key, &src).unwrap();
        aes_decrypt_to_file(&key, &blob, &dst).unwrap();

        assert_eq!(std::fs::read(&dst).unwrap(), content);

        let _ = std::fs::remove_file(&src);
        let _ = std::fs::remove_file(&dst);
    }

    #[test]
    fn test_file_blob_tamper_detected() {
        let dir = std::env::temp_dir();
        let src = dir.join("retro_crypto_tamper_src");
        let dst = dir.join("retro_crypto_tamper_dst");

        std::fs::write(&src, b"attack at dawn").unwrap();

        let key: [u8; 32] = random_bytes(32).try_into().unwrap();
        let mut blob = aes_encrypt_from_file(&key, &src).unwrap();
        let n = blob.len();
        blob[n - 1] ^= 0x01;

        assert!(matches!(
            aes_decrypt_to_file(&key, &blob, &dst),
            Err(Error::HmacMismatch)
        ));

        let _ = std::fs::remove_file(&src);
    }
}
