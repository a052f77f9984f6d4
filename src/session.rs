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

//! Client↔server session handshakes.
//!
//! Login:
//!
//! ```text
//! CLIENT                           SERVER
//!   |-- T_HELLO ------------------->|
//!   |   userid(8) nonce(32) sig(64) |
//!   |<-- T_SUCCESS -----------------|
//! ```
//!
//! Registration:
//!
//! ```text
//!   |-- T_REGISTER --------------->|
//!   |   regkey(32)                 |
//!   |<-- T_SUCCESS ----------------|
//!   |   userid(8)                  |
//!   |-- T_PUBKEY ----------------->|
//!   |   pem_concat                 |
//!   |<-- T_SUCCESS ----------------|
//! ```
//!
//! Any non-success response aborts the handshake; registration removes
//! partially created local state before returning the failure.

use std::{fs, path::Path, time::Duration};

use log::{error, info};

use crate::{
    account::{validate_password, validate_username, Account},
    config::Config,
    crypto::{keys::IdentityPrivateKey, random_bytes},
    message::UserId,
    net::{NetClient, RecvEvent},
    protocol::{unpack_fields, PacketType, NONCE_SIZE, REGKEY_SIZE, USERID_SIZE},
    Error, Result,
};

/// A one-shot 32-byte registration token, issued out-of-band.
pub struct Regkey([u8; REGKEY_SIZE]);

impl Regkey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; REGKEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::OperationFailed(format!("invalid regkey length {}", bytes.len())))?;
        Ok(Self(key))
    }

    /// Read a registration key from a file. Accepts the raw 32 bytes or
    /// their 64-symbol hex rendering.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;

        if data.len() == REGKEY_SIZE {
            return Self::from_bytes(&data)
        }

        let text = String::from_utf8_lossy(&data);
        let text = text.trim();
        if text.len() == 2 * REGKEY_SIZE {
            if let Ok(raw) = hex::decode(text) {
                return Self::from_bytes(&raw)
            }
        }

        Err(Error::OperationFailed(format!("invalid regkey file {:?}", path)))
    }

    pub fn as_bytes(&self) -> &[u8; REGKEY_SIZE] {
        &self.0
    }
}

/// Authenticate an existing account on an open connection.
///
/// Sends `T_HELLO` with a freshly signed random nonce and accepts only a
/// `T_SUCCESS` answer within `timeout`.
pub fn login(conn: &NetClient, account: &Account, timeout: Duration) -> Result<()> {
    let nonce = random_bytes(NONCE_SIZE);
    let signature = account.privkey.sign(&nonce);

    conn.send_packet(PacketType::Hello, &[account.id.as_bytes(), &nonce, &signature])?;

    expect_success(conn, timeout)?;
    info!(target: "retro::session", "Logged in as '{}' ({})", account.name, account.id);
    Ok(())
}

/// Register a new account against the relay server.
///
/// On success the local account exists on disk and is returned loaded.
/// On failure the connection is closed and no local state remains.
pub fn register(
    conf: &Config,
    conn: &NetClient,
    regkey: &Regkey,
    username: &str,
    password: &str,
    is_bot: bool,
) -> Result<Account> {
    validate_username(username)?;
    validate_password(password)?;

    let res = register_inner(conf, conn, regkey, username, password, is_bot);
    if let Err(e) = &res {
        error!(target: "retro::session", "Registration failed: {}", e);
        conn.close();
    }
    res
}

fn register_inner(
    conf: &Config,
    conn: &NetClient,
    regkey: &Regkey,
    username: &str,
    password: &str,
    is_bot: bool,
) -> Result<Account> {
    // Step 1: present the registration token, receive our user id
    conn.send_packet(PacketType::Register, &[regkey.as_bytes()])?;
    let payload = expect_success(conn, Duration::from_secs(conf.recv_timeout))?;
    let fields = unpack_fields(&payload, &[Some(USERID_SIZE)])?;
    let user_id = UserId::from_bytes(fields[0])?;
    info!(target: "retro::session", "Handshake done, userid={}", user_id);

    // Step 2: generate the identity and upload the public half
    let privkey = IdentityPrivateKey::generate()?;
    let pub_pem = privkey.public().to_pem()?;
    conn.send_packet(PacketType::Pubkey, &[pub_pem.as_bytes()])?;
    expect_success(conn, Duration::from_secs(conf.recv_timeout))?;

    // Step 3: persist the account locally. `Account::create` removes any
    // partial on-disk state itself if this fails.
    Account::create(conf, user_id, username, password, privkey, is_bot)
}

/// Request the public key of a user from the server.
///
/// The `T_PUBKEY` answer carries `user_id:8 ‖ pem_concat`; the id must
/// match the requested one.
pub fn fetch_pubkey(conn: &NetClient, user_id: &UserId, timeout: Duration) -> Result<String> {
    conn.send_packet(PacketType::GetPubkey, &[user_id.as_bytes()])?;

    let payload = match conn.recv_packet(timeout)? {
        RecvEvent::Packet(PacketType::Pubkey, payload) => payload,
        RecvEvent::Packet(PacketType::Error, reason) => {
            return Err(Error::ServerError(String::from_utf8_lossy(&reason).to_string()))
        }
        RecvEvent::Packet(_, _) => return Err(Error::BadHandshake),
        RecvEvent::Timeout => return Err(Error::Timeout),
        RecvEvent::Closed => return Err(Error::PeerClosed),
    };

    let fields = unpack_fields(&payload, &[Some(USERID_SIZE), None])?;
    let got_id = UserId::from_bytes(fields[0])?;
    if got_id != *user_id {
        return Err(Error::OperationFailed(format!(
            "wanted key of user {}, got key of user {}",
            user_id, got_id
        )))
    }

    Ok(String::from_utf8_lossy(fields[1]).to_string())
}

/// Await a single `T_SUCCESS` packet and return its payload.
///
/// `T_ERROR` surfaces the server reason, any other packet is a broken
/// handshake, timeouts and closes map to their error kinds.
pub fn expect_success(conn: &NetClient, timeout: Duration) -> Result<Vec<u8>> {
    match conn.recv_packet(timeout)? {
        RecvEvent::Packet(PacketType::Success, payload) => Ok(payload),
        RecvEvent::Packet(PacketType::Error, reason) => {
            Err(Error::ServerError(String::from_utf8_lossy(&reason).to_string()))
        }
        RecvEvent::Packet(pckt_type, _) => {
            error!(target: "retro::session", "Expected T_SUCCESS, got {}", pckt_type);
            Err(Error::BadHandshake)
        }
        RecvEvent::Timeout => Err(Error::Timeout),
        RecvEvent::Closed => Err(Error::PeerClosed),
    }
}
