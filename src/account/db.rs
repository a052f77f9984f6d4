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

//! Encrypted one-row database holding the account identity.
//!
//! ```text
//! +----------------------------+
//! | account                    |
//! +------+-------+------+------+
//! | _id  | _name | _rsa | _ec  |
//! | BLOB | TEXT  | TEXT | TEXT |
//! +------+-------+------+------+
//! ```
//!
//! The private key PEMs are stored unencrypted inside the already
//! encrypted database row.

use std::path::{Path, PathBuf};

use log::{debug, error};
use rusqlite::Connection;

use crate::{crypto::keys::IdentityPrivateKey, message::UserId, Error, Result};

/// Filename of the account database inside the account directory
pub const ACCOUNT_DB_NAME: &str = "account.db";

const CREATE_TABLE_ACCOUNT: &str = "CREATE TABLE IF NOT EXISTS account (
        _id BLOB,
        _name TEXT,
        _rsa TEXT,
        _ec TEXT);";

/// Handle on an account's encrypted single-row database.
pub struct AccountDb {
    db_path: PathBuf,
}

impl AccountDb {
    pub fn new(account_path: &Path) -> Self {
        Self { db_path: account_path.join(ACCOUNT_DB_NAME) }
    }

    /// Create the database and insert the one and only row.
    pub fn create(&self, key_hex: &str, account: &AccountRow) -> Result<()> {
        let conn = self.open(key_hex)?;
        conn.execute(
            "INSERT INTO account VALUES (?1, ?2, ?3, ?4);",
            rusqlite::params![
                &account.id.as_bytes()[..],
                account.name,
                account.rsa_pem,
                account.ec_pem
            ],
        )?;
        debug!(target: "retro::account::db", "Created account db at {:?}", self.db_path);
        Ok(())
    }

    /// Load the account row.
    pub fn select(&self, key_hex: &str) -> Result<AccountRow> {
        let conn = self.open(key_hex)?;
        let mut stmt = conn.prepare("SELECT _id, _name, _rsa, _ec FROM account;")?;
        let mut rows = stmt.query(rusqlite::params![])?;

        let Some(row) = rows.next()? else {
            return Err(Error::AccountCorrupt("account row missing".to_string()))
        };

        let id: Vec<u8> = row.get(0)?;
        Ok(AccountRow {
            id: UserId::from_bytes(&id)
                .map_err(|_| Error::AccountCorrupt("invalid user id in account row".to_string()))?,
            name: row.get(1)?,
            rsa_pem: row.get(2)?,
            ec_pem: row.get(3)?,
        })
    }

    fn open(&self, key_hex: &str) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "key", key_hex)?;
        if let Err(e) = conn.execute_batch(CREATE_TABLE_ACCOUNT) {
            error!(target: "retro::account::db", "Failed to open account db: {}", e);
            return Err(auth_or_db_error(e))
        }
        Ok(conn)
    }
}

/// The single row of the account database.
pub struct AccountRow {
    pub id: UserId,
    pub name: String,
    pub rsa_pem: String,
    pub ec_pem: String,
}

impl AccountRow {
    /// Reconstruct the private identity key from the stored PEMs.
    pub fn private_key(&self) -> Result<IdentityPrivateKey> {
        IdentityPrivateKey::from_pem_strings(&self.rsa_pem, &self.ec_pem)
            .map_err(|e| Error::AccountCorrupt(format!("private key: {}", e)))
    }
}

/// A failure on the first statement against an encrypted database with
/// the wrong passphrase surfaces as a cipher/corruption error from the
/// storage layer. Translate that into an authentication failure.
pub(crate) fn auth_or_db_error(e: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = &e {
        if matches!(
            ffi_err.code,
            rusqlite::ErrorCode::NotADatabase | rusqlite::ErrorCode::DatabaseCorrupt
        ) {
            return Error::AccountAuthFailed
        }
    }
    e.into()
}
