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

//! Binary wire protocol framing.
//!
//! Every packet starts with an 8 byte header:
//!
//! ```text
//!  0       2       4               8
//!  +-------+-------+---------------+----------
//!  |   V   |   T   |       S       | payload
//!  +-------+-------+---------------+----------
//!
//!  V = Protocol version (u16, big-endian)
//!  T = Packet type      (u16, big-endian)
//!  S = Payload size     (i32, big-endian)
//! ```
//!
//! The codec frames and slices packets, it performs no schema validation
//! of payloads. That belongs to the consumer.

use crate::{Error, Result};

/// Protocol version, major part
pub const PROTOCOL_VERSION_MAJOR: u8 = 0x00;
/// Protocol version, minor part
pub const PROTOCOL_VERSION_MINOR: u8 = 0x01;
/// Combined major/minor protocol version as sent on the wire
pub const PROTOCOL_VERSION: u16 =
    ((PROTOCOL_VERSION_MAJOR as u16) << 8) | PROTOCOL_VERSION_MINOR as u16;

/// Size of the packet header in bytes
pub const HDR_SIZE: usize = 8;

/// Size of a user id
pub const USERID_SIZE: usize = 8;
/// Size of a file id
pub const FILEID_SIZE: usize = 16;
/// Size of a registration key
pub const REGKEY_SIZE: usize = 32;
/// Size of the per-message AES master key
pub const AES_KEY_SIZE: usize = 32;
/// Size of an AES-CBC initialization vector
pub const IV_SIZE: usize = 16;
/// Size of an HMAC-SHA256 tag
pub const HMAC_SIZE: usize = 32;
/// Size of an RSA-2048 ciphertext block (the envelope header)
pub const RSA_SIZE: usize = 256;
/// Size of an Ed25519 signature
pub const ED_SIG_SIZE: usize = 64;
/// Size of a handshake nonce
pub const NONCE_SIZE: usize = 32;

/// Packet types known to the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    Success = 1,
    Error = 2,
    Hello = 3,
    Goodbye = 4,
    Register = 5,
    Pubkey = 6,
    GetPubkey = 7,

    ChatMsg = 10,
    FileMsg = 11,

    Friends = 20,
    FriendOnline = 21,
    FriendOffline = 22,
    FriendUnknown = 23,

    FileUpload = 31,
    FileDownload = 32,
}

impl TryFrom<u16> for PacketType {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Self::Success),
            2 => Ok(Self::Error),
            3 => Ok(Self::Hello),
            4 => Ok(Self::Goodbye),
            5 => Ok(Self::Register),
            6 => Ok(Self::Pubkey),
            7 => Ok(Self::GetPubkey),
            10 => Ok(Self::ChatMsg),
            11 => Ok(Self::FileMsg),
            20 => Ok(Self::Friends),
            21 => Ok(Self::FriendOnline),
            22 => Ok(Self::FriendOffline),
            23 => Ok(Self::FriendUnknown),
            31 => Ok(Self::FileUpload),
            32 => Ok(Self::FileDownload),
            x => Err(Error::MalformedHeader(format!("unknown packet type {}", x))),
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Unpacked field layout of a T_HELLO payload
pub const UNPACK_T_HELLO: [Option<usize>; 3] =
    [Some(USERID_SIZE), Some(NONCE_SIZE), Some(ED_SIG_SIZE)];

/// Unpacked field layout of an end-to-end message payload
pub const UNPACK_T_E2EMSG: [Option<usize>; 5] =
    [Some(USERID_SIZE), Some(USERID_SIZE), Some(RSA_SIZE), Some(ED_SIG_SIZE), None];

/// Pack a packet header from a raw type value and payload size.
pub fn pack_header(pckt_type: u16, size: i32) -> [u8; HDR_SIZE] {
    let mut hdr = [0u8; HDR_SIZE];
    hdr[0..2].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    hdr[2..4].copy_from_slice(&pckt_type.to_be_bytes());
    hdr[4..8].copy_from_slice(&size.to_be_bytes());
    hdr
}

/// Unpack a packet header buffer.
///
/// Returns `(version, type, payload_size)`. Rejects any version other
/// than [`PROTOCOL_VERSION`] and negative payload sizes.
pub fn unpack_header(hdr: &[u8; HDR_SIZE]) -> Result<(u16, u16, i32)> {
    let version = u16::from_be_bytes([hdr[0], hdr[1]]);
    let pckt_type = u16::from_be_bytes([hdr[2], hdr[3]]);
    let size = i32::from_be_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);

    if version != PROTOCOL_VERSION {
        return Err(Error::ProtocolVersionMismatch(version))
    }

    if size < 0 {
        return Err(Error::MalformedHeader(format!("negative payload size {}", size)))
    }

    Ok((version, pckt_type, size))
}

/// Pack a full packet from a type and payload parts.
///
/// The parts are concatenated into the payload; the header carries the
/// total payload length.
pub fn pack_packet(pckt_type: PacketType, parts: &[&[u8]]) -> Vec<u8> {
    let payload_len: usize = parts.iter().map(|p| p.len()).sum();
    let mut pckt = Vec::with_capacity(HDR_SIZE + payload_len);
    pckt.extend_from_slice(&pack_header(pckt_type as u16, payload_len as i32));
    for part in parts {
        pckt.extend_from_slice(part);
    }
    pckt
}

/// Slice a packet payload into fields of the given fixed sizes.
///
/// A trailing `None` captures the remainder of the buffer (which may be
/// empty). Fails with [`Error::Truncated`] if the buffer is shorter than
/// the fixed prefix.
pub fn unpack_fields<'a>(buf: &'a [u8], sizes: &[Option<usize>]) -> Result<Vec<&'a [u8]>> {
    let mut fields = Vec::with_capacity(sizes.len());
    let mut i = 0;

    for size in sizes {
        match size {
            Some(n) => {
                if i + n > buf.len() {
                    return Err(Error::Truncated)
                }
                fields.push(&buf[i..i + n]);
                i += n;
            }
            None => {
                fields.push(&buf[i..]);
                i = buf.len();
            }
        }
    }

    Ok(fields)
}

/// Return the human readable name of a friend status packet type.
pub fn friend_status_str(status: PacketType) -> &'static str {
    match status {
        PacketType::FriendOnline => "online",
        PacketType::FriendOffline => "offline",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        for pckt_type in [0u16, 1, 10, 32, 0xffff] {
            for size in [0i32, 1, 256, i32::MAX] {
                let hdr = pack_header(pckt_type, size);
                let (v, t, s) = unpack_header(&hdr).unwrap();
                assert_eq!(v, 1);
                assert_eq!(t, pckt_type);
                assert_eq!(s, size);
            }
        }
    }

    #[test]
    fn test_header_rejects_bad_version() {
        let mut hdr = pack_header(10, 4);
        hdr[0] = 0x00;
        hdr[1] = 0x02;
        assert!(matches!(
            unpack_header(&hdr),
            Err(Error::ProtocolVersionMismatch(0x0002))
        ));
    }

    #[test]
    fn test_header_rejects_negative_size() {
        let mut hdr = pack_header(10, 0);
        hdr[4..8].copy_from_slice(&(-1i32).to_be_bytes());
        assert!(matches!(unpack_header(&hdr), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn test_pack_packet_concatenates() {
        let pckt = pack_packet(PacketType::Hello, &[b"abc", b"", b"de"]);
        assert_eq!(pckt.len(), HDR_SIZE + 5);
        let (_, t, s) = unpack_header(pckt[..HDR_SIZE].try_into().unwrap()).unwrap();
        assert_eq!(t, PacketType::Hello as u16);
        assert_eq!(s, 5);
        assert_eq!(&pckt[HDR_SIZE..], b"abcde");
    }

    #[test]
    fn test_unpack_fields() {
        let buf = b"aabbbbrest";
        let fields = unpack_fields(buf, &[Some(2), Some(4), None]).unwrap();
        assert_eq!(fields, vec![&b"aa"[..], &b"bbbb"[..], &b"rest"[..]]);

        // Trailing rest may be empty
        let fields = unpack_fields(b"aabbbb", &[Some(2), Some(4), None]).unwrap();
        assert_eq!(fields[2], b"");

        // Fixed prefix longer than the buffer
        assert!(matches!(
            unpack_fields(b"aab", &[Some(2), Some(4)]),
            Err(Error::Truncated)
        ));
    }
}
