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

//! Plaintext message model.

use serde::{Deserialize, Serialize};

use crate::{
    protocol::{PacketType, USERID_SIZE},
    Error, Result,
};

/// Opaque 8-byte user identifier, assigned by the server at registration.
///
/// Carried raw on the wire and as BLOB in storage, rendered as hex for
/// humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId([u8; USERID_SIZE]);

impl UserId {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let id: [u8; USERID_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidUserId(format!("invalid length {}", bytes.len())))?;
        Ok(Self(id))
    }

    /// Parse a user id from its 16-symbol hex rendering.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 2 * USERID_SIZE {
            return Err(Error::InvalidUserId(format!("invalid length {}", s.len())))
        }
        Self::from_bytes(&hex::decode(s)?)
    }

    pub fn as_bytes(&self) -> &[u8; USERID_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// File metadata carried inside a file message.
///
/// The serialized form is the UTF-8 JSON body of a `T_FILEMSG` envelope
/// and must stay bit-compatible, so the wire names are fixed here. The
/// `downloaded` flag is local state and never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    /// File id as 32 hex symbols
    #[serde(rename = "fileid")]
    pub file_id: String,
    /// Original file name (not a path)
    pub filename: String,
    /// Size of the plaintext file in bytes
    pub size: u64,
    /// Base64-encoded 32-byte file key
    pub key: String,
    #[serde(skip)]
    pub downloaded: bool,
}

/// A plaintext chat message.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Sender name
    pub from: String,
    /// Receiver name
    pub to: String,
    /// Sent time, `YY-MM-DD HH:MM`
    pub time: String,
    /// Message text
    pub text: String,
    /// Not yet seen by the user
    pub unseen: bool,
}

/// A plaintext file message: a chat message whose content is a file
/// reference instead of text.
#[derive(Debug, Clone)]
pub struct FileMessage {
    pub from: String,
    pub to: String,
    pub time: String,
    pub info: FileInfo,
    pub unseen: bool,
}

/// A decrypted message, tagged by kind.
#[derive(Debug, Clone)]
pub enum Message {
    Chat(ChatMessage),
    File(FileMessage),
}

impl Message {
    pub fn from_name(&self) -> &str {
        match self {
            Self::Chat(m) => &m.from,
            Self::File(m) => &m.from,
        }
    }

    pub fn to_name(&self) -> &str {
        match self {
            Self::Chat(m) => &m.to,
            Self::File(m) => &m.to,
        }
    }

    pub fn time(&self) -> &str {
        match self {
            Self::Chat(m) => &m.time,
            Self::File(m) => &m.time,
        }
    }

    pub fn unseen(&self) -> bool {
        match self {
            Self::Chat(m) => m.unseen,
            Self::File(m) => m.unseen,
        }
    }

    /// The wire packet type this message travels as.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Chat(_) => PacketType::ChatMsg,
            Self::File(_) => PacketType::FileMsg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_userid_hex_roundtrip() {
        let id = UserId::from_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(id.to_hex(), "0102030405060708");
        assert_eq!(UserId::from_hex("0102030405060708").unwrap(), id);

        assert!(UserId::from_bytes(&[1, 2, 3]).is_err());
        assert!(UserId::from_hex("01020304050607").is_err());
        assert!(UserId::from_hex("010203040506070z").is_err());
    }

    #[test]
    fn test_fileinfo_wire_json() {
        let info = FileInfo {
            file_id: "aa".repeat(16),
            filename: "x.bin".to_string(),
            size: 1048576,
            key: "a2V5".to_string(),
            downloaded: true,
        };

        let json = serde_json::to_string(&info).unwrap();
        // The local flag must not leak onto the wire
        assert!(!json.contains("downloaded"));
        assert!(json.contains("\"fileid\""));

        let back: FileInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.filename, "x.bin");
        assert_eq!(back.size, 1048576);
        assert!(!back.downloaded);
    }
}
