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

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// General crate errors, grouped by domain.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // ==============
    // Network errors
    // ==============
    #[error("I/O error: {0}")]
    Io(std::io::ErrorKind),

    #[error("Read timed out")]
    Timeout,

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Connection truncated mid-packet")]
    IoTruncated,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid certificate file: {0}")]
    InvalidCertificate(String),

    // ===============
    // Protocol errors
    // ===============
    #[error("Protocol version mismatch (got {0:#06x})")]
    ProtocolVersionMismatch(u16),

    #[error("Malformed packet header: {0}")]
    MalformedHeader(String),

    #[error("Packet buffer too small to unpack")]
    Truncated,

    #[error("Unexpected packet during handshake")]
    BadHandshake,

    #[error("Server error: {0}")]
    ServerError(String),

    // =============
    // Crypto errors
    // =============
    #[error("Invalid PEM data: {0}")]
    InvalidPem(String),

    #[error("Invalid padding")]
    InvalidPadding,

    #[error("Invalid message signature")]
    BadSignature,

    #[error("HMAC mismatch")]
    HmacMismatch,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    // ==============
    // Account errors
    // ==============
    #[error("No such account: {0}")]
    AccountNotFound(String),

    #[error("Account authentication failed")]
    AccountAuthFailed,

    #[error("Account corrupt: {0}")]
    AccountCorrupt(String),

    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    #[error("Insecure password: {0}")]
    InsecurePassword(String),

    // ==========================
    // Friend and message errors
    // ==========================
    #[error("Unknown message sender: {0}")]
    UnknownSender(String),

    #[error("No such friend: {0}")]
    NoSuchFriend(String),

    #[error("No free message database name")]
    NameExhaustion,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    // ==============
    // Storage errors
    // ==============
    #[error("Database error: {0}")]
    Database(String),

    // ====================
    // File transfer errors
    // ====================
    #[error("File transfer failed: {0}")]
    FileTransferFailed(String),

    // ====
    // Misc
    // ====
    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Invalid user id: {0}")]
    InvalidUserId(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.kind())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedMessage(err.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Self::InvalidUserId(err.to_string())
    }
}
