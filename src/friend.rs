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

use crate::{crypto::keys::IdentityPublicKey, message::UserId, protocol::PacketType};

/// Last-known presence of a friend, updated by server pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FriendStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl FriendStatus {
    /// Map a `T_FRIEND_*` status push to a status value.
    pub fn from_packet_type(pckt_type: PacketType) -> Option<Self> {
        match pckt_type {
            PacketType::FriendOnline => Some(Self::Online),
            PacketType::FriendOffline => Some(Self::Offline),
            PacketType::FriendUnknown => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for FriendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Another peer of whom we know the user id, name and public key.
#[derive(Clone)]
pub struct Friend {
    /// Server-assigned user id
    pub id: UserId,
    /// Username of the friend
    pub name: String,
    /// The friend's public identity key
    pub pubkey: IdentityPublicKey,
    /// Name of the conversation database file (16 random hex symbols)
    pub msgdb_name: String,
    /// Current presence
    pub status: FriendStatus,
    /// Counter of unseen messages, for UI purposes
    pub unseen_count: u32,
}

impl Friend {
    pub fn new(id: UserId, name: String, pubkey: IdentityPublicKey, msgdb_name: String) -> Self {
        Self { id, name, pubkey, msgdb_name, status: FriendStatus::default(), unseen_count: 0 }
    }
}

impl std::fmt::Debug for Friend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Friend")
            .field("id", &self.id.to_hex())
            .field("name", &self.name)
            .field("msgdb_name", &self.msgdb_name)
            .field("status", &self.status)
            .finish()
    }
}
