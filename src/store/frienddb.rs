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

//! Encrypted friend table.
//!
//! ```text
//! +-----------------------------------------------+
//! | friends                                       |
//! +-----------+--------+------+------+------------+
//! | _id       | _name  | _rsa | _ec  | _msgdbname |
//! | BLOB (PK) | TEXT   | TEXT | TEXT | TEXT       |
//! +-----------+--------+------+------+------------+
//! ```
//!
//! The database key is derived from the session master key with the
//! account's own user id as salt, binding it to both the passphrase and
//! the account identity.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use log::debug;
use rusqlite::Connection;

use crate::{
    crypto::{derive_key, keys::IdentityPublicKey, random_hex, KDF_ITER_DEFAULT},
    friend::Friend,
    message::UserId,
    Error, Result,
};

/// Filename of the friend database inside the account directory
pub const FRIEND_DB_NAME: &str = "friends.db";

const CREATE_TABLE_FRIENDS: &str = "CREATE TABLE IF NOT EXISTS friends (
        _id BLOB PRIMARY KEY NOT NULL,
        _name TEXT NOT NULL,
        _rsa TEXT NOT NULL,
        _ec TEXT NOT NULL,
        _msgdbname TEXT NOT NULL);";

/// Upper bound of draws for a fresh conversation database name.
/// A collision is already vanishingly unlikely on the first try.
const MAX_NAME_ATTEMPTS: usize = 16;

/// Handle on an account's encrypted friend database.
pub struct FriendDb {
    path: PathBuf,
    key_hex: String,
}

impl FriendDb {
    /// Set up the handle. The pragma key is derived here once.
    pub fn new(account_path: &Path, master_key: &[u8], account_id: &UserId) -> Self {
        let key = derive_key(master_key, account_id.as_bytes(), 16, KDF_ITER_DEFAULT);
        Self { path: account_path.join(FRIEND_DB_NAME), key_hex: hex::encode(key) }
    }

    /// Insert a friend. Fails with a database error if the user id
    /// already exists.
    pub fn add(&self, friend: &Friend) -> Result<()> {
        let (rsa_pem, ec_pem) = friend.pubkey.to_pem_strings()?;
        let db = self.open()?;
        db.execute(
            "INSERT INTO friends VALUES (?1, ?2, ?3, ?4, ?5);",
            rusqlite::params![
                &friend.id.as_bytes()[..],
                friend.name,
                rsa_pem,
                ec_pem,
                friend.msgdb_name
            ],
        )?;
        Ok(())
    }

    /// Delete a friend row by user id.
    pub fn delete_by_id(&self, id: &UserId) -> Result<()> {
        let db = self.open()?;
        db.execute("DELETE FROM friends WHERE _id = ?1;", rusqlite::params![&id.as_bytes()[..]])?;
        Ok(())
    }

    /// Load all friends into a map keyed by user id.
    pub fn load_all(&self) -> Result<HashMap<UserId, Friend>> {
        let db = self.open()?;
        let mut stmt =
            db.prepare("SELECT _id, _name, _rsa, _ec, _msgdbname FROM friends;")?;
        let mut rows = stmt.query(rusqlite::params![])?;

        let mut friends = HashMap::new();
        while let Some(row) = rows.next()? {
            let id_blob: Vec<u8> = row.get(0)?;
            let id = UserId::from_bytes(&id_blob)
                .map_err(|_| Error::Database("invalid friend id".to_string()))?;
            let name: String = row.get(1)?;
            let rsa_pem: String = row.get(2)?;
            let ec_pem: String = row.get(3)?;
            let msgdb_name: String = row.get(4)?;

            debug!(target: "retro::store::frienddb", "Loading friend '{}' ...", name);
            let pubkey = IdentityPublicKey::from_pem_strings(&rsa_pem, &ec_pem)?;
            friends.insert(id, Friend::new(id, name, pubkey, msgdb_name));
        }

        Ok(friends)
    }

    fn open(&self) -> Result<Connection> {
        let db = Connection::open(&self.path)?;
        db.pragma_update(None, "key", &self.key_hex)?;
        db.execute_batch(CREATE_TABLE_FRIENDS)
            .map_err(crate::account::db::auth_or_db_error)?;
        Ok(db)
    }
}

/// Draw a random 16-hex-symbol name for a conversation database that does
/// not yet exist in the message directory.
pub fn random_msgdb_name(msg_dir: &Path) -> Result<String> {
    for _ in 0..MAX_NAME_ATTEMPTS {
        let name = random_hex(16);
        if !msg_dir.join(&name).exists() {
            return Ok(name)
        }
    }
    Err(Error::NameExhaustion)
}
