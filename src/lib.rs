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

//! retro: client-side core of an end-to-end encrypted peer messenger.
//!
//! Users register against a central relay server, exchange chat messages
//! and file references with authenticated friends, and persist both
//! identity material and message history locally under passphrase-derived
//! encryption.

/// Crate error types
pub mod error;
pub use error::{Error, Result};

/// Crypto primitives and identity keys
pub mod crypto;

/// Binary wire protocol framing
pub mod protocol;

/// Blocking TCP/TLS packet streams
pub mod net;

/// Client configuration
pub mod config;

/// Plaintext message model
pub mod message;

/// Friends and presence
pub mod friend;

/// Account lifecycle and encrypted account storage
pub mod account;

/// Encrypted friend table and conversation databases
pub mod store;

/// End-to-end message envelopes
pub mod handler;

/// Login and registration handshakes
pub mod session;

/// File transfer choreography
pub mod transfer;

/// Client facade
pub mod client;

/// Filesystem helpers
pub mod util;
