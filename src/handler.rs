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

//! End-to-end message envelopes.
//!
//! Wire layout of a `T_CHATMSG`/`T_FILEMSG` payload:
//!
//! ```text
//! from_id:8 | to_id:8 | header:256 | signature:64 | body:var
//! ```
//!
//! where the header is the RSA-OAEP encryption (towards the recipient) of
//! `kM:32 ‖ iv:16 ‖ hmac:32 ‖ sent_time:14` and the body is the
//! AES-256-CBC ciphertext of the message text. `kM` is a fresh random
//! master key per message; its SHA-512 digest splits into the encryption
//! key `kE` and the HMAC key `kS`. The signature is Ed25519 over the
//! body with the sender's identity key.

use chrono::Local;
use log::warn;
use zeroize::Zeroizing;

use crate::{
    account::Account,
    crypto::{aes_decrypt, aes_encrypt, hash_sha512, hmac_sha256, hmac_verify, random_bytes},
    friend::Friend,
    message::{ChatMessage, FileInfo, FileMessage, Message, UserId},
    protocol::{unpack_fields, PacketType, AES_KEY_SIZE, HMAC_SIZE, IV_SIZE, RSA_SIZE, UNPACK_T_E2EMSG},
    Error, Result,
};

/// Time format of the envelope timestamp (14 ASCII bytes)
const TIME_FORMAT: &str = "%y-%m-%d %H:%M";

/// Layout of the decrypted envelope header
const UNPACK_HEADER: [Option<usize>; 4] =
    [Some(AES_KEY_SIZE), Some(IV_SIZE), Some(HMAC_SIZE), None];

/// Build an end-to-end encrypted chat message for `friend`.
///
/// Returns the plaintext message (for local persistence) and the
/// envelope bytes (for the wire).
pub fn make_msg(account: &Account, friend: &Friend, text: &str) -> Result<(Message, Vec<u8>)> {
    let (envelope, time) = seal(account, friend, text.as_bytes())?;

    let msg = Message::Chat(ChatMessage {
        from: account.name.clone(),
        to: friend.name.clone(),
        time,
        text: text.to_string(),
        unseen: false,
    });

    Ok((msg, envelope))
}

/// Build an end-to-end encrypted file message for `friend`.
///
/// The envelope body is the UTF-8 JSON serialization of the file
/// descriptor; the local plaintext message carries the file fields with
/// an empty text.
pub fn make_file_msg(
    account: &Account,
    friend: &Friend,
    info: &FileInfo,
) -> Result<(Message, Vec<u8>)> {
    let body = serde_json::to_string(info)?;
    let (envelope, time) = seal(account, friend, body.as_bytes())?;

    let msg = Message::File(FileMessage {
        from: account.name.clone(),
        to: friend.name.clone(),
        time,
        info: info.clone(),
        unseen: false,
    });

    Ok((msg, envelope))
}

/// Verify and decrypt a received envelope.
///
/// Returns the sender's user id along with the plaintext message. The
/// sender must be a known friend, the body signature must verify, and
/// the recomputed HMAC must match in constant time, in that order.
pub fn decrypt_msg(
    account: &Account,
    msg_type: PacketType,
    envelope: &[u8],
) -> Result<(UserId, Message)> {
    let fields = unpack_fields(envelope, &UNPACK_T_E2EMSG)?;
    let (from, _to, header, signature, body) =
        (fields[0], fields[1], fields[2], fields[3], fields[4]);

    // The sender must map to an existing friend
    let from_id = UserId::from_bytes(from)?;
    let Some(friend) = account.friends.get(&from_id) else {
        return Err(Error::UnknownSender(from_id.to_hex()))
    };

    // Signature over the body, with the sender's identity key
    if !friend.pubkey.verify(signature, body) {
        warn!(target: "retro::handler", "Invalid message signature from {}", from_id);
        return Err(Error::BadSignature)
    }

    // Open the header with our private key
    let header_plain = Zeroizing::new(account.privkey.decrypt(header)?);
    let header_fields = unpack_fields(&header_plain, &UNPACK_HEADER)?;
    let (master_key, iv, tag, time_ascii) =
        (header_fields[0], header_fields[1], header_fields[2], header_fields[3]);

    // Recompute the keys and the HMAC over iv ‖ body
    let key_hash = Zeroizing::new(hash_sha512(master_key));
    let enc_key: [u8; 32] = key_hash[..32].try_into().unwrap();
    let sig_key = &key_hash[32..];

    let mut mac_input = Vec::with_capacity(iv.len() + body.len());
    mac_input.extend_from_slice(iv);
    mac_input.extend_from_slice(body);
    if !hmac_verify(&hmac_sha256(sig_key, &mac_input), tag) {
        warn!(target: "retro::handler", "HMAC mismatch on message from {}", from_id);
        return Err(Error::HmacMismatch)
    }

    // Decrypt and decode the body
    let iv_arr: [u8; IV_SIZE] = iv.try_into().unwrap();
    let plaintext = aes_decrypt(&enc_key, body, &iv_arr)?;
    let text = String::from_utf8(plaintext)
        .map_err(|_| Error::MalformedMessage("body is not valid UTF-8".to_string()))?;

    let time = String::from_utf8(time_ascii.to_vec())
        .map_err(|_| Error::MalformedMessage("timestamp is not valid UTF-8".to_string()))?;

    let msg = match msg_type {
        PacketType::FileMsg => {
            let mut info: FileInfo = serde_json::from_str(&text)?;
            info.downloaded = false;
            Message::File(FileMessage {
                from: friend.name.clone(),
                to: account.name.clone(),
                time,
                info,
                unseen: true,
            })
        }
        _ => Message::Chat(ChatMessage {
            from: friend.name.clone(),
            to: account.name.clone(),
            time,
            text,
            unseen: true,
        }),
    };

    Ok((from_id, msg))
}

/// Encrypt `plaintext` into an envelope towards `friend`.
/// Returns the envelope and the embedded timestamp.
fn seal(account: &Account, friend: &Friend, plaintext: &[u8]) -> Result<(Vec<u8>, String)> {
    // Fresh message master key, hashed and split into kE and kS
    let master_key = Zeroizing::new(random_bytes(AES_KEY_SIZE));
    let key_hash = Zeroizing::new(hash_sha512(&master_key));
    let enc_key: [u8; 32] = key_hash[..32].try_into().unwrap();
    let sig_key = &key_hash[32..];

    // Encrypt the body and authenticate iv ‖ body
    let (body, iv) = aes_encrypt(&enc_key, plaintext);
    let mut mac_input = Vec::with_capacity(iv.len() + body.len());
    mac_input.extend_from_slice(&iv);
    mac_input.extend_from_slice(&body);
    let tag = hmac_sha256(sig_key, &mac_input);

    let time = Local::now().format(TIME_FORMAT).to_string();

    // Header: kM ‖ iv ‖ hmac ‖ timestamp, sealed towards the recipient
    let mut header_plain = Zeroizing::new(Vec::with_capacity(94));
    header_plain.extend_from_slice(&master_key);
    header_plain.extend_from_slice(&iv);
    header_plain.extend_from_slice(&tag);
    header_plain.extend_from_slice(time.as_bytes());
    let header = friend.pubkey.encrypt(&header_plain)?;

    if header.len() != RSA_SIZE {
        return Err(Error::EncryptionFailed(format!(
            "unexpected header length {}",
            header.len()
        )))
    }

    // Sign the body with our identity key
    let signature = account.privkey.sign(&body);

    let mut envelope =
        Vec::with_capacity(2 * 8 + RSA_SIZE + signature.len() + body.len());
    envelope.extend_from_slice(account.id.as_bytes());
    envelope.extend_from_slice(friend.id.as_bytes());
    envelope.extend_from_slice(&header);
    envelope.extend_from_slice(&signature);
    envelope.extend_from_slice(&body);

    Ok((envelope, time))
}
