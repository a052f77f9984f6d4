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

//! Cached per-friend message storage.
//!
//! Every conversation with a friend lives in its own encrypted database
//! under `<account>/msg/<msgdb_name>`, keyed by a subkey derived from the
//! session master key with the friend's user id as salt. Conversations
//! are opened lazily on first use and swept shut once idle for longer
//! than the configured timeout. Shutdown is explicit via
//! [`MsgStore::close_all`], there is no finalizer magic.
//!
//! Database layout per conversation:
//!
//! ```text
//! msg  (_id PK, _type CHAR(1), _from, _to, _time, _msg, _unseen)
//! files(_msgid FK, _fileid, _filename, _size, _key, _downloaded)
//! ```
//!
//! `_type` is 'm' for chat messages and 'f' for file messages. The
//! `files` cascade is maintained manually, no database-level FK action
//! is assumed.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, Instant},
};

use log::{debug, warn};
use rusqlite::Connection;

use crate::{
    crypto::{derive_key, KDF_ITER_CONVERSATION},
    friend::Friend,
    message::{ChatMessage, FileInfo, FileMessage, Message},
    Error, Result,
};

/// Name of the message directory inside an account directory
pub const MSG_DIR_NAME: &str = "msg";

/// Default idle time after which a conversation database is closed
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

const CREATE_TABLE_MSG: &str = "CREATE TABLE IF NOT EXISTS msg (
        _id INTEGER PRIMARY KEY,
        _type CHAR(1),
        _from TEXT NOT NULL,
        _to TEXT NOT NULL,
        _time TEXT NOT NULL,
        _msg TEXT NOT NULL,
        _unseen INTEGER);";

const CREATE_TABLE_FILES: &str = "CREATE TABLE IF NOT EXISTS files (
        _msgid INTEGER,
        _fileid TEXT,
        _filename TEXT,
        _size INTEGER,
        _key TEXT,
        _downloaded INTEGER,
        FOREIGN KEY (_msgid) REFERENCES msg(_id));";

/// Select only one kind of message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgFilter {
    Chat,
    File,
}

impl MsgFilter {
    fn type_char(&self) -> &'static str {
        match self {
            Self::Chat => "m",
            Self::File => "f",
        }
    }
}

/// A message together with its storage row id.
#[derive(Debug, Clone)]
pub struct StoredMsg {
    pub id: i64,
    pub msg: Message,
}

/// The lazily opened, idle-evicted conversation cache.
pub struct MsgStore {
    msg_dir: PathBuf,
    idle_timeout: Duration,
    /// Open conversations, keyed by friend name
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl MsgStore {
    pub fn new(msg_dir: PathBuf, idle_timeout: Duration) -> Self {
        Self { msg_dir, idle_timeout, conversations: Mutex::new(HashMap::new()) }
    }

    /// Store a message in the conversation with `friend`.
    /// Returns the row id of the inserted message.
    pub fn add_msg(&self, master_key: &[u8], friend: &Friend, msg: &Message) -> Result<i64> {
        self.with_conversation(master_key, friend, |conv| conv.add_msg(msg))
    }

    /// Get messages of the conversation with `friend`, sorted by time
    /// ascending and tail-truncated to `last_n` if given.
    pub fn get_msgs(
        &self,
        master_key: &[u8],
        friend: &Friend,
        last_n: Option<usize>,
        filter: Option<MsgFilter>,
    ) -> Result<Vec<StoredMsg>> {
        self.with_conversation(master_key, friend, |conv| conv.get_msgs(last_n, filter))
    }

    /// Get all file messages whose file has not been downloaded yet.
    pub fn not_downloaded_files(
        &self,
        master_key: &[u8],
        friend: &Friend,
        last_n: Option<usize>,
    ) -> Result<Vec<StoredMsg>> {
        self.with_conversation(master_key, friend, |conv| conv.not_downloaded_files(last_n))
    }

    /// Mark every message of the conversation as seen. Idempotent.
    pub fn set_all_seen(&self, master_key: &[u8], friend: &Friend) -> Result<()> {
        self.with_conversation(master_key, friend, |conv| conv.set_all_seen())
    }

    /// Number of unseen messages in the conversation.
    pub fn num_unseen(&self, master_key: &[u8], friend: &Friend) -> Result<u32> {
        self.with_conversation(master_key, friend, |conv| conv.num_unseen())
    }

    /// Mark the file with the given hex id as downloaded. Idempotent.
    pub fn set_file_downloaded(&self, master_key: &[u8], friend: &Friend, file_id: &str) -> Result<()> {
        self.with_conversation(master_key, friend, |conv| conv.set_file_downloaded(file_id))
    }

    /// Delete a message row, cascading into the `files` table.
    pub fn delete_msg(&self, master_key: &[u8], friend: &Friend, msg_id: i64) -> Result<()> {
        self.with_conversation(master_key, friend, |conv| conv.delete_msg(msg_id))
    }

    /// Close conversations idle at `now`. Called internally after every
    /// operation; exposed for explicit sweeps and tests.
    pub fn sweep_idle(&self, now: Instant) {
        let mut conversations = self.conversations.lock().unwrap();
        conversations.retain(|name, conv| {
            let keep = now.duration_since(conv.last_action) <= self.idle_timeout;
            if !keep {
                debug!(target: "retro::store::msgstore", "Closing idle conversation with '{}'", name);
            }
            keep
        });
    }

    /// Close all open conversations. Called on account teardown.
    pub fn close_all(&self) {
        self.conversations.lock().unwrap().clear();
    }

    /// Whether the conversation with the given friend name is currently
    /// open. Mostly useful for eviction tests.
    pub fn is_open(&self, friend_name: &str) -> bool {
        self.conversations.lock().unwrap().contains_key(friend_name)
    }

    /// Run `op` on the (possibly freshly opened) conversation with
    /// `friend`, touch its activity timestamp and sweep idle entries.
    fn with_conversation<T>(
        &self,
        master_key: &[u8],
        friend: &Friend,
        op: impl FnOnce(&mut Conversation) -> Result<T>,
    ) -> Result<T> {
        let mut conversations = self.conversations.lock().unwrap();

        if !conversations.contains_key(&friend.name) {
            let conv = Conversation::open(&self.msg_dir, master_key, friend)?;
            conversations.insert(friend.name.clone(), conv);
        }

        let conv = conversations.get_mut(&friend.name).expect("conversation exists");
        let res = op(conv);
        conv.last_action = Instant::now();
        drop(conversations);

        self.sweep_idle(Instant::now());
        res
    }
}

/// A single open conversation database.
struct Conversation {
    db: Connection,
    last_action: Instant,
}

impl Conversation {
    /// Open (or create) the conversation database for `friend`.
    fn open(msg_dir: &Path, master_key: &[u8], friend: &Friend) -> Result<Self> {
        let path = msg_dir.join(&friend.msgdb_name);
        debug!(target: "retro::store::msgstore", "Opening conversation db {:?}", path);

        let key = derive_key(master_key, friend.id.as_bytes(), 16, KDF_ITER_CONVERSATION);

        let db = Connection::open(&path)?;
        db.pragma_update(None, "key", hex::encode(key))?;
        db.execute_batch(CREATE_TABLE_MSG).map_err(crate::account::db::auth_or_db_error)?;
        db.execute_batch(CREATE_TABLE_FILES)?;

        Ok(Self { db, last_action: Instant::now() })
    }

    fn add_msg(&mut self, msg: &Message) -> Result<i64> {
        let type_char = match msg {
            Message::Chat(_) => "m",
            Message::File(_) => "f",
        };
        let text = match msg {
            Message::Chat(m) => m.text.as_str(),
            Message::File(_) => "",
        };

        self.db.execute(
            "INSERT INTO msg (_type, _from, _to, _time, _msg, _unseen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            rusqlite::params![
                type_char,
                msg.from_name(),
                msg.to_name(),
                msg.time(),
                text,
                msg.unseen() as i64
            ],
        )?;
        let msg_id = self.db.last_insert_rowid();

        if let Message::File(m) = msg {
            self.db.execute(
                "INSERT INTO files VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
                rusqlite::params![
                    msg_id,
                    m.info.file_id,
                    m.info.filename,
                    m.info.size as i64,
                    m.info.key,
                    m.info.downloaded as i64
                ],
            )?;
        }

        Ok(msg_id)
    }

    fn get_msgs(&mut self, last_n: Option<usize>, filter: Option<MsgFilter>) -> Result<Vec<StoredMsg>> {
        let rows = match filter {
            Some(f) => self.select_msg_rows(
                "SELECT _id, _type, _from, _to, _time, _msg, _unseen FROM msg
                 WHERE _type = ?1 ORDER BY _time;",
                rusqlite::params![f.type_char()],
            )?,
            None => self.select_msg_rows(
                "SELECT _id, _type, _from, _to, _time, _msg, _unseen FROM msg ORDER BY _time;",
                rusqlite::params![],
            )?,
        };

        let mut msgs = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(msg) = self.row_to_msg(row, None)? {
                msgs.push(msg);
            }
        }

        if let Some(n) = last_n {
            let skip = msgs.len().saturating_sub(n);
            msgs.drain(..skip);
        }
        Ok(msgs)
    }

    fn not_downloaded_files(&mut self, last_n: Option<usize>) -> Result<Vec<StoredMsg>> {
        let rows = self.select_msg_rows(
            "SELECT _id, _type, _from, _to, _time, _msg, _unseen FROM msg
             WHERE _type = 'f' ORDER BY _time;",
            rusqlite::params![],
        )?;

        let mut msgs = Vec::new();
        for row in rows {
            if let Some(msg) = self.row_to_msg(row, Some(false))? {
                msgs.push(msg);
            }
        }

        if let Some(n) = last_n {
            let skip = msgs.len().saturating_sub(n);
            msgs.drain(..skip);
        }
        Ok(msgs)
    }

    fn set_all_seen(&mut self) -> Result<()> {
        self.db.execute("UPDATE msg SET _unseen = 0;", rusqlite::params![])?;
        Ok(())
    }

    fn num_unseen(&mut self) -> Result<u32> {
        let n: u32 =
            self.db.query_row("SELECT count(*) FROM msg WHERE _unseen = 1;", rusqlite::params![], |row| row.get(0))?;
        Ok(n)
    }

    fn set_file_downloaded(&mut self, file_id: &str) -> Result<()> {
        self.db.execute("UPDATE files SET _downloaded = 1 WHERE _fileid = ?1;", rusqlite::params![file_id])?;
        Ok(())
    }

    fn delete_msg(&mut self, msg_id: i64) -> Result<()> {
        self.db.execute("DELETE FROM files WHERE _msgid = ?1;", rusqlite::params![msg_id])?;
        self.db.execute("DELETE FROM msg WHERE _id = ?1;", rusqlite::params![msg_id])?;
        Ok(())
    }

    fn select_msg_rows<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<MsgRow>> {
        let mut stmt = self.db.prepare(sql)?;
        let mut rows = stmt.query(params)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(MsgRow {
                id: row.get(0)?,
                type_char: row.get(1)?,
                from: row.get(2)?,
                to: row.get(3)?,
                time: row.get(4)?,
                text: row.get(5)?,
                unseen: row.get::<_, i64>(6)? != 0,
            });
        }
        Ok(out)
    }

    /// Turn a `msg` row into a message, joining the `files` row for file
    /// messages. `downloaded_filter` restricts file messages to the given
    /// downloaded state. Returns `None` for file rows without a files
    /// entry; those are skipped.
    fn row_to_msg(&self, row: MsgRow, downloaded_filter: Option<bool>) -> Result<Option<StoredMsg>> {
        if row.type_char != "f" {
            return Ok(Some(StoredMsg {
                id: row.id,
                msg: Message::Chat(ChatMessage {
                    from: row.from,
                    to: row.to,
                    time: row.time,
                    text: row.text,
                    unseen: row.unseen,
                }),
            }))
        }

        let sql = match downloaded_filter {
            None => {
                "SELECT _fileid, _filename, _size, _key, _downloaded FROM files WHERE _msgid = ?1;"
            }
            Some(false) => {
                "SELECT _fileid, _filename, _size, _key, _downloaded FROM files
                 WHERE _msgid = ?1 AND _downloaded = 0;"
            }
            Some(true) => {
                "SELECT _fileid, _filename, _size, _key, _downloaded FROM files
                 WHERE _msgid = ?1 AND _downloaded = 1;"
            }
        };

        let mut stmt = self.db.prepare(sql)?;
        let mut rows = stmt.query(rusqlite::params![row.id])?;

        let Some(file_row) = rows.next()? else {
            if downloaded_filter.is_none() {
                warn!(target: "retro::store::msgstore", "File message {} has no files row, skipping", row.id);
            }
            return Ok(None)
        };

        let info = FileInfo {
            file_id: file_row.get(0)?,
            filename: file_row.get(1)?,
            size: file_row.get::<_, i64>(2)? as u64,
            key: file_row.get(3)?,
            downloaded: file_row.get::<_, i64>(4)? != 0,
        };

        Ok(Some(StoredMsg {
            id: row.id,
            msg: Message::File(FileMessage {
                from: row.from,
                to: row.to,
                time: row.time,
                info,
                unseen: row.unseen,
            }),
        }))
    }
}

struct MsgRow {
    id: i64,
    type_char: String,
    from: String,
    to: String,
    time: String,
    text: String,
    unseen: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::keys::IdentityPrivateKey,
        message::{ChatMessage, UserId},
    };

    fn test_friend(name: &str, dbname: &str) -> Friend {
        let key = IdentityPrivateKey::generate().unwrap();
        Friend::new(
            UserId::from_bytes(&[9, 9, 9, 9, 9, 9, 9, 9]).unwrap(),
            name.to_string(),
            key.public(),
            dbname.to_string(),
        )
    }

    fn chat(from: &str, to: &str, time: &str, text: &str) -> Message {
        Message::Chat(ChatMessage {
            from: from.to_string(),
            to: to.to_string(),
            time: time.to_string(),
            text: text.to_string(),
            unseen: true,
        })
    }

    #[test]
    fn test_msgstore_roundtrip_and_eviction() {
        let tmp = std::env::temp_dir().join(format!("retro_msgstore_{}", std::process::id()));
        std::fs::create_dir_all(&tmp).unwrap();

        let store = MsgStore::new(tmp.clone(), Duration::from_secs(60));
        let friend = test_friend("alice", "00aa00aa00aa00aa");
        let mk = [7u8; 16];

        store.add_msg(&mk, &friend, &chat("alice", "bob", "24-01-01 10:00", "hello")).unwrap();
        store.add_msg(&mk, &friend, &chat("bob", "alice", "24-01-01 10:01", "hi")).unwrap();
        assert!(store.is_open("alice"));

        // Synthetic clock advance: the conversation must be swept
        store.sweep_idle(Instant::now() + Duration::from_secs(120));
        assert!(!store.is_open("alice"));

        // ... and transparently reopened with no data loss
        let msgs = store.get_msgs(&mk, &friend, None, None).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].msg.time(), "24-01-01 10:00");
        assert_eq!(msgs[1].msg.time(), "24-01-01 10:01");

        // set_all_seen is idempotent
        assert_eq!(store.num_unseen(&mk, &friend).unwrap(), 2);
        store.set_all_seen(&mk, &friend).unwrap();
        store.set_all_seen(&mk, &friend).unwrap();
        assert_eq!(store.num_unseen(&mk, &friend).unwrap(), 0);

        store.close_all();
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn test_file_msg_join_and_delete() {
        let tmp = std::env::temp_dir().join(format!("retro_msgstore_f_{}", std::process::id()));
        std::fs::create_dir_all(&tmp).unwrap();

        let store = MsgStore::new(tmp.clone(), DEFAULT_IDLE_TIMEOUT);
        let friend = test_friend("carol", "11bb11bb11bb11bb");
        let mk = [3u8; 16];

        let msg = Message::File(FileMessage {
            from: "carol".to_string(),
            to: "dave".to_string(),
            time: "24-02-02 12:00".to_string(),
            info: FileInfo {
                file_id: "ab".repeat(16),
                filename: "x.bin".to_string(),
                size: 1048576,
                key: "a2V5a2V5".to_string(),
                downloaded: false,
            },
            unseen: true,
        });
        let msg_id = store.add_msg(&mk, &friend, &msg).unwrap();

        let msgs = store.get_msgs(&mk, &friend, None, Some(MsgFilter::File)).unwrap();
        assert_eq!(msgs.len(), 1);
        let Message::File(fm) = &msgs[0].msg else { panic!("expected file message") };
        assert_eq!(fm.info.filename, "x.bin");
        assert_eq!(fm.info.size, 1048576);
        assert!(!fm.info.downloaded);

        assert_eq!(store.not_downloaded_files(&mk, &friend, None).unwrap().len(), 1);
        store.set_file_downloaded(&mk, &friend, &fm.info.file_id).unwrap();
        assert!(store.not_downloaded_files(&mk, &friend, None).unwrap().is_empty());

        store.delete_msg(&mk, &friend, msg_id).unwrap();
        assert!(store.get_msgs(&mk, &friend, None, None).unwrap().is_empty());

        store.close_all();
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn test_last_n_truncation() {
        let tmp = std::env::temp_dir().join(format!("retro_msgstore_n_{}", std::process::id()));
        std::fs::create_dir_all(&tmp).unwrap();

        let store = MsgStore::new(tmp.clone(), DEFAULT_IDLE_TIMEOUT);
        let friend = test_friend("erin", "22cc22cc22cc22cc");
        let mk = [1u8; 16];

        for i in 0..5 {
            let time = format!("24-01-01 10:0{}", i);
            store.add_msg(&mk, &friend, &chat("erin", "bob", &time, "m")).unwrap();
        }

        let msgs = store.get_msgs(&mk, &friend, Some(2), None).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].msg.time(), "24-01-01 10:03");
        assert_eq!(msgs[1].msg.time(), "24-01-01 10:04");

        store.close_all();
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
