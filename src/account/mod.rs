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

//! User account lifecycle.
//!
//! On-disk layout of a single account:
//!
//! ```text
//! <accounts>/<username>/
//!   .salt            # 32 random bytes
//!   account.db       # encrypted one-row table (id, name, rsa_pem, ec_pem)
//!   friends.db       # encrypted friend table
//!   msg/<16 hex>     # one encrypted database per friend
//! ```
//!
//! Opening an account derives the database key from the passphrase and
//! salt, then immediately re-stretches it into the session master key
//! used for all further subkey derivation. The open key is zeroized, so
//! the database passphrase itself does not stay in live memory.

use std::{collections::HashMap, fs, path::PathBuf};

use log::{debug, info, warn};
use zeroize::Zeroizing;

use crate::{
    config::Config,
    crypto::{derive_key, keys::IdentityPrivateKey, random_bytes, KDF_ITER_DEFAULT, KDF_ITER_SESSION},
    friend::Friend,
    message::UserId,
    store::{
        frienddb::random_msgdb_name,
        msgstore::{DEFAULT_IDLE_TIMEOUT, MSG_DIR_NAME},
        FriendDb, MsgStore,
    },
    util::path::ensure_dir,
    Error, Result,
};

/// Encrypted account database
pub mod db;

use db::{AccountDb, AccountRow};

/// Name of the salt file inside an account directory
pub const SALT_FILE_NAME: &str = ".salt";
/// Exact size of the salt file
pub const SALT_SIZE: usize = 32;

/// Size of the derived master key
const MASTER_KEY_SIZE: usize = 16;

/// A loaded user account.
///
/// The account owns the friend map and the message store; both the
/// message store and the handler functions borrow what they need per
/// operation instead of keeping back-references.
pub struct Account {
    /// Server-assigned user id
    pub id: UserId,
    /// Account username
    pub name: String,
    /// Whether this account is driven by a bot
    pub is_bot: bool,
    /// Private identity key
    pub privkey: IdentityPrivateKey,
    /// Public half of the identity key
    pub pubkey: crate::crypto::keys::IdentityPublicKey,
    /// Account directory
    pub path: PathBuf,
    /// All known friends, keyed by user id
    pub friends: HashMap<UserId, Friend>,
    /// Per-friend conversation store
    pub msg_store: MsgStore,

    salt: [u8; SALT_SIZE],
    master_key: Zeroizing<[u8; MASTER_KEY_SIZE]>,
    friend_db: FriendDb,
}

impl Account {
    /// Create a fresh account on disk. Used by the registration flow
    /// after the server assigned a user id.
    ///
    /// Any partially created state is removed again on failure.
    pub fn create(
        conf: &Config,
        id: UserId,
        username: &str,
        password: &str,
        privkey: IdentityPrivateKey,
        is_bot: bool,
    ) -> Result<Self> {
        validate_username(username)?;

        let path = conf.account_dir(username);
        if path.exists() {
            return Err(Error::OperationFailed(format!("account '{}' already exists", username)))
        }

        let res = Self::create_inner(conf, id, username, password, privkey, is_bot, &path);
        if res.is_err() && path.exists() {
            warn!(target: "retro::account", "Cleaning up partial account at {:?}", path);
            let _ = fs::remove_dir_all(&path);
        }
        res
    }

    fn create_inner(
        _conf: &Config,
        id: UserId,
        username: &str,
        password: &str,
        privkey: IdentityPrivateKey,
        is_bot: bool,
        path: &PathBuf,
    ) -> Result<Self> {
        ensure_dir(path)?;
        ensure_dir(&path.join(MSG_DIR_NAME))?;

        // Salt file
        let salt: [u8; SALT_SIZE] = random_bytes(SALT_SIZE).try_into().unwrap();
        let salt_path = path.join(SALT_FILE_NAME);
        fs::write(&salt_path, salt)?;
        restrict_mode(&salt_path);

        // Database key and account row
        let open_key = Zeroizing::new(derive_key(
            password.as_bytes(),
            &salt,
            MASTER_KEY_SIZE,
            KDF_ITER_DEFAULT,
        ));
        let (rsa_pem, ec_pem) = privkey.to_pem_strings()?;
        let row = AccountRow { id, name: username.to_string(), rsa_pem, ec_pem };
        AccountDb::new(path).create(&hex::encode(open_key.as_slice()), &row)?;

        let master_key = stretch_session_key(&open_key, &salt);
        let friend_db = FriendDb::new(path, master_key.as_slice(), &id);
        let msg_store = MsgStore::new(path.join(MSG_DIR_NAME), DEFAULT_IDLE_TIMEOUT);

        info!(target: "retro::account", "Created account '{}' ({})", username, id);

        Ok(Self {
            id,
            name: username.to_string(),
            is_bot,
            pubkey: privkey.public(),
            privkey,
            path: path.clone(),
            friends: HashMap::new(),
            msg_store,
            salt,
            master_key,
            friend_db,
        })
    }

    /// Load an existing account.
    pub fn load(conf: &Config, username: &str, password: &str, is_bot: bool) -> Result<Self> {
        info!(target: "retro::account", "Loading account '{}' ...", username);

        let path = conf.account_dir(username);
        if !path.is_dir() {
            return Err(Error::AccountNotFound(username.to_string()))
        }

        if path.join("key.pem").exists() && !path.join(db::ACCOUNT_DB_NAME).exists() {
            return Err(Error::AccountCorrupt(
                "legacy key.pem account layout is not supported".to_string(),
            ))
        }

        // Salt
        let salt_buf = fs::read(path.join(SALT_FILE_NAME))
            .map_err(|_| Error::AccountCorrupt("missing salt file".to_string()))?;
        let salt: [u8; SALT_SIZE] = salt_buf
            .try_into()
            .map_err(|_| Error::AccountCorrupt("salt file has wrong length".to_string()))?;

        // Open the account database and rebuild the identity
        let open_key = Zeroizing::new(derive_key(
            password.as_bytes(),
            &salt,
            MASTER_KEY_SIZE,
            KDF_ITER_DEFAULT,
        ));
        let row = AccountDb::new(&path).select(&hex::encode(open_key.as_slice()))?;
        let privkey = row.private_key()?;

        let master_key = stretch_session_key(&open_key, &salt);

        // Friends
        let friend_db = FriendDb::new(&path, master_key.as_slice(), &row.id);
        let friends = friend_db.load_all()?;
        debug!(target: "retro::account", "Loaded {} friends", friends.len());

        let msg_dir = path.join(MSG_DIR_NAME);
        ensure_dir(&msg_dir)?;
        let msg_store = MsgStore::new(msg_dir, DEFAULT_IDLE_TIMEOUT);

        Ok(Self {
            id: row.id,
            name: row.name,
            is_bot,
            pubkey: privkey.public(),
            privkey,
            path,
            friends,
            msg_store,
            salt,
            master_key,
            friend_db,
        })
    }

    /// The session master key used for subkey derivation.
    pub fn master_key(&self) -> &[u8] {
        self.master_key.as_slice()
    }

    /// The account salt.
    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }

    /// Add a new friend from a concatenated public-key PEM buffer.
    pub fn add_friend(&mut self, id: UserId, name: &str, pem: &str) -> Result<&Friend> {
        let pubkey = crate::crypto::keys::IdentityPublicKey::from_pem(pem)?;
        let msgdb_name = random_msgdb_name(&self.path.join(MSG_DIR_NAME))?;

        let friend = Friend::new(id, name.to_string(), pubkey, msgdb_name);
        self.friend_db.add(&friend)?;

        info!(target: "retro::account", "Added new friend name={} id={}", friend.name, friend.id);
        Ok(self.friends.entry(id).or_insert(friend))
    }

    /// Delete a friend, removing its database row and conversation file.
    pub fn delete_friend(&mut self, id: &UserId) -> Result<()> {
        let Some(friend) = self.friends.remove(id) else {
            return Err(Error::NoSuchFriend(id.to_hex()))
        };

        self.friend_db.delete_by_id(id)?;

        let msgdb_path = self.path.join(MSG_DIR_NAME).join(&friend.msgdb_name);
        if let Err(e) = fs::remove_file(&msgdb_path) {
            debug!(target: "retro::account", "Could not remove {:?}: {}", msgdb_path, e);
        }

        info!(target: "retro::account", "Deleted friend '{}' ({})", friend.name, id);
        Ok(())
    }

    pub fn friend_by_id(&self, id: &UserId) -> Option<&Friend> {
        self.friends.get(id)
    }

    pub fn friend_by_name(&self, name: &str) -> Option<&Friend> {
        self.friends.values().find(|f| f.name == name)
    }

    /// Tear the account down: close all conversations and zeroize the
    /// session key material.
    pub fn logout(&mut self) {
        self.msg_store.close_all();
        self.friends.clear();
        *self.master_key = [0u8; MASTER_KEY_SIZE];
        info!(target: "retro::account", "Logged out '{}'", self.name);
    }
}

/// Re-stretch the database open key into the session master key and
/// leave the open key to be zeroized by its guard.
fn stretch_session_key(
    open_key: &Zeroizing<Vec<u8>>,
    salt: &[u8; SALT_SIZE],
) -> Zeroizing<[u8; MASTER_KEY_SIZE]> {
    let stretched = derive_key(open_key.as_slice(), salt, MASTER_KEY_SIZE, KDF_ITER_SESSION);
    let mut key = Zeroizing::new([0u8; MASTER_KEY_SIZE]);
    key.copy_from_slice(&stretched);
    key
}

#[cfg(unix)]
fn restrict_mode(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_mode(_path: &std::path::Path) {}

/// Validate a username: 4 to 16 characters, starting with an alphabetic
/// character, ending with an alphanumeric one, with only alphanumerics,
/// `-` and `_` in between.
pub fn validate_username(username: &str) -> Result<()> {
    let n = username.chars().count();
    if !(4..=16).contains(&n) {
        return Err(Error::InvalidUsername(format!("invalid length {} (min=4 max=16)", n)))
    }

    let first = username.chars().next().unwrap();
    if !first.is_ascii_alphabetic() {
        return Err(Error::InvalidUsername(
            "username must start with an alphabetic character".to_string(),
        ))
    }

    let last = username.chars().last().unwrap();
    if !last.is_ascii_alphanumeric() {
        return Err(Error::InvalidUsername(
            "username must end with an alphanumeric character".to_string(),
        ))
    }

    for c in username.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            return Err(Error::InvalidUsername(format!("invalid character '{}'", c)))
        }
    }

    Ok(())
}

/// Validate password strength: at least 8 characters and 2 distinct
/// characters from each class (lowercase, uppercase, numeric, special).
pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < 8 {
        return Err(Error::InsecurePassword("password too short (min=8)".to_string()))
    }

    let mut lowercase = std::collections::HashSet::new();
    let mut uppercase = std::collections::HashSet::new();
    let mut numeric = std::collections::HashSet::new();
    let mut special = std::collections::HashSet::new();

    for c in password.chars() {
        if c.is_alphabetic() && c.is_lowercase() {
            lowercase.insert(c);
        } else if c.is_alphabetic() && c.is_uppercase() {
            uppercase.insert(c);
        } else if c.is_numeric() {
            numeric.insert(c);
        } else {
            special.insert(c);
        }
    }

    for (class, chars) in [
        ("lowercase", &lowercase),
        ("uppercase", &uppercase),
        ("numeric", &numeric),
        ("special", &special),
    ] {
        if chars.len() < 2 {
            return Err(Error::InsecurePassword(format!(
                "password needs at least 2 different {} characters",
                class
            )))
        }
    }

    Ok(())
}

/// List the names of all local accounts.
pub fn list_accounts(conf: &Config) -> Result<Vec<String>> {
    let mut accounts = vec![];

    if !conf.accounts_dir.is_dir() {
        return Ok(accounts)
    }

    for entry in fs::read_dir(&conf.accounts_dir)? {
        let entry = entry?;
        if entry.path().is_dir() {
            accounts.push(entry.file_name().to_string_lossy().to_string());
        }
    }

    accounts.sort();
    Ok(accounts)
}
