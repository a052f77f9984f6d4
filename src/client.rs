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

//! Client facade.
//!
//! [`RetroClient`] ties the pieces together: configuration, account,
//! relay connection and packet dispatch. A typical embedding runs a main
//! thread issuing sends and local store operations, plus a receive
//! thread looping on [`RetroClient::recv_packet`] and feeding packets
//! into [`RetroClient::handle_packet`].

use std::{fs::File, path::{Path, PathBuf}, sync::Once, time::Duration};

use log::{debug, info, warn};
use simplelog::WriteLogger;

use crate::{
    account::Account,
    config::Config,
    friend::FriendStatus,
    handler,
    message::{Message, UserId},
    net::{NetClient, RecvEvent},
    protocol::{unpack_fields, PacketType, USERID_SIZE},
    session::{self, Regkey},
    transfer,
    Error, Result,
};

/// The logger is process-wide state, initialized exactly once.
/// Subsequent `load()` calls never reinitialize handlers.
static LOG_INIT: Once = Once::new();

/// Something the dispatch loop wants the embedder to know about.
#[derive(Debug)]
pub enum ClientEvent {
    /// A chat or file message arrived, was verified and persisted
    Message { from: UserId, msg_id: i64, msg: Message },
    /// A friend's presence changed
    FriendStatus { id: UserId, status: FriendStatus },
    /// The server reported an error
    ServerError(String),
}

/// A messenger client bound to one account.
pub struct RetroClient {
    /// Client configuration
    pub conf: Config,
    /// The loaded account, if any
    pub account: Option<Account>,
    conn: Option<NetClient>,
}

impl RetroClient {
    /// Create a client with configs read from the default base directory
    /// (`~/.retro`), or the given one.
    pub fn new(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut conf = Config::new(base_dir)?;
        conf.load()?;
        Ok(Self { conf, account: None, conn: None })
    }

    /// Load an account. Call this before anything else.
    /// Also initializes the process-wide logger on first use.
    pub fn load(&mut self, username: &str, password: &str, is_bot: bool) -> Result<()> {
        init_logging(&self.conf, is_bot);
        self.account = Some(Account::load(&self.conf, username, password, is_bot)?);
        Ok(())
    }

    /// Register a fresh account with a registration key file and load it.
    pub fn register(
        &mut self,
        regkey_file: &Path,
        username: &str,
        password: &str,
        is_bot: bool,
    ) -> Result<()> {
        init_logging(&self.conf, is_bot);

        let regkey = Regkey::from_file(regkey_file)?;
        let conn = self.connect_main()?;
        let account = session::register(&self.conf, &conn, &regkey, username, password, is_bot)?;
        conn.close();

        self.account = Some(account);
        Ok(())
    }

    /// Connect to the relay and authenticate.
    ///
    /// After login the friend list is announced so the server pushes
    /// presence updates. A failed handshake terminates the connection.
    pub fn connect(&mut self) -> Result<()> {
        let account = self.account.as_ref().ok_or_else(not_loaded)?;
        let conn = self.connect_main()?;

        if let Err(e) = session::login(&conn, account, Duration::from_secs(self.conf.recv_timeout))
        {
            conn.close();
            return Err(e)
        }

        if !account.friends.is_empty() {
            let ids: Vec<u8> =
                account.friends.keys().flat_map(|id| id.as_bytes().to_vec()).collect();
            conn.send_packet(PacketType::Friends, &[&ids])?;
        }

        self.conn = Some(conn);
        Ok(())
    }

    /// Say goodbye and drop the connection.
    pub fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.send_packet(PacketType::Goodbye, &[]);
            conn.close();
        }
    }

    /// Tear down the session: disconnect, close all conversation
    /// databases and zeroize the key material.
    pub fn logout(&mut self) {
        self.disconnect();
        if let Some(mut account) = self.account.take() {
            account.logout();
        }
    }

    /// The active relay connection.
    pub fn conn(&self) -> Result<&NetClient> {
        self.conn.as_ref().ok_or(Error::PeerClosed)
    }

    /// Send a packet over the main session.
    pub fn send_packet(&self, pckt_type: PacketType, parts: &[&[u8]]) -> Result<()> {
        self.conn()?.send_packet(pckt_type, parts)
    }

    /// Receive one packet from the main session.
    pub fn recv_packet(&self, timeout: Duration) -> Result<RecvEvent> {
        self.conn()?.recv_packet(timeout)
    }

    /// Receive and dispatch a single packet.
    ///
    /// Returns `Ok(None)` on a timeout or on packets that need no
    /// embedder attention. A peer close is a hard error, the session is
    /// over.
    pub fn run_once(&mut self, timeout: Duration) -> Result<Option<ClientEvent>> {
        match self.recv_packet(timeout)? {
            RecvEvent::Packet(pckt_type, payload) => self.handle_packet(pckt_type, &payload),
            RecvEvent::Timeout => Ok(None),
            RecvEvent::Closed => Err(Error::PeerClosed),
        }
    }

    /// Dispatch one received packet.
    ///
    /// Crypto verification failures are fatal to the offending message
    /// only: it is discarded and logged, the session continues.
    pub fn handle_packet(
        &mut self,
        pckt_type: PacketType,
        payload: &[u8],
    ) -> Result<Option<ClientEvent>> {
        match pckt_type {
            PacketType::ChatMsg | PacketType::FileMsg => self.handle_e2e_msg(pckt_type, payload),

            PacketType::FriendOnline | PacketType::FriendOffline | PacketType::FriendUnknown => {
                let account = self.account.as_mut().ok_or_else(not_loaded)?;
                let fields = unpack_fields(payload, &[Some(USERID_SIZE)])?;
                let id = UserId::from_bytes(fields[0])?;
                let status = FriendStatus::from_packet_type(pckt_type).expect("status packet");

                let Some(friend) = account.friends.get_mut(&id) else {
                    debug!(target: "retro::client", "Status push for unknown user {}", id);
                    return Ok(None)
                };
                friend.status = status;
                debug!(target: "retro::client", "Friend '{}' is now {}", friend.name, status);
                Ok(Some(ClientEvent::FriendStatus { id, status }))
            }

            PacketType::Error => {
                let reason = String::from_utf8_lossy(payload).to_string();
                warn!(target: "retro::client", "Server error: {}", reason);
                Ok(Some(ClientEvent::ServerError(reason)))
            }

            PacketType::Goodbye => {
                info!(target: "retro::client", "Server said goodbye");
                Ok(None)
            }

            other => {
                warn!(target: "retro::client", "Unhandled packet type {}", other);
                Ok(None)
            }
        }
    }

    /// Build, send and locally persist a chat message to a friend.
    pub fn send_chat_msg(&self, friend_name: &str, text: &str) -> Result<Message> {
        let account = self.account.as_ref().ok_or_else(not_loaded)?;
        let friend = account
            .friend_by_name(friend_name)
            .ok_or_else(|| Error::NoSuchFriend(friend_name.to_string()))?;

        let (msg, envelope) = handler::make_msg(account, friend, text)?;
        self.send_packet(PacketType::ChatMsg, &[&envelope])?;
        account.msg_store.add_msg(account.master_key(), friend, &msg)?;

        Ok(msg)
    }

    /// Encrypt and upload a file to a friend, sending the file message
    /// over the main session. The message is persisted locally.
    pub fn upload_file(&self, friend_name: &str, filepath: &Path) -> Result<Message> {
        let account = self.account.as_ref().ok_or_else(not_loaded)?;
        let friend = account
            .friend_by_name(friend_name)
            .ok_or_else(|| Error::NoSuchFriend(friend_name.to_string()))?;

        let (msg, _, _) = transfer::upload_file(&self.conf, self.conn()?, account, friend, filepath)?;
        account.msg_store.add_msg(account.master_key(), friend, &msg)?;

        Ok(msg)
    }

    /// Download the file referenced by a received file message and mark
    /// it as downloaded in the conversation store.
    pub fn download_file(
        &self,
        friend_name: &str,
        file_id: &str,
        filename: &str,
        key_b64: &str,
    ) -> Result<PathBuf> {
        let account = self.account.as_ref().ok_or_else(not_loaded)?;
        let friend = account
            .friend_by_name(friend_name)
            .ok_or_else(|| Error::NoSuchFriend(friend_name.to_string()))?;

        let (path, _) = transfer::download_file(&self.conf, file_id, filename, key_b64)?;
        account.msg_store.set_file_downloaded(account.master_key(), friend, file_id)?;

        Ok(path)
    }

    /// Fetch a user's public key from the server and add them as friend.
    pub fn add_friend(&mut self, username: &str, id: UserId) -> Result<()> {
        let timeout = Duration::from_secs(self.conf.recv_timeout);
        let pem = session::fetch_pubkey(self.conn()?, &id, timeout)?;

        let account = self.account.as_mut().ok_or_else(not_loaded)?;
        account.add_friend(id, username, &pem)?;
        Ok(())
    }

    /// The server address as `host:port`.
    pub fn hoststr(&self) -> String {
        format!("{}:{}", self.conf.server_address, self.conf.server_port)
    }

    fn handle_e2e_msg(
        &mut self,
        pckt_type: PacketType,
        payload: &[u8],
    ) -> Result<Option<ClientEvent>> {
        let account = self.account.as_mut().ok_or_else(not_loaded)?;

        let (from, msg) = match handler::decrypt_msg(account, pckt_type, payload) {
            Ok(res) => res,
            // A broken message is dropped, the session continues
            Err(
                e @ (Error::UnknownSender(_) |
                Error::BadSignature |
                Error::HmacMismatch |
                Error::InvalidPadding |
                Error::MalformedMessage(_) |
                Error::Truncated),
            ) => {
                warn!(target: "retro::client", "Dropping invalid message: {}", e);
                return Ok(None)
            }
            Err(e) => return Err(e),
        };

        let friend = account.friend_by_id(&from).expect("sender verified as friend");
        let msg_id = account.msg_store.add_msg(account.master_key(), friend, &msg)?;

        if let Some(friend) = account.friends.get_mut(&from) {
            friend.unseen_count += 1;
        }

        Ok(Some(ClientEvent::Message { from, msg_id, msg }))
    }

    fn connect_main(&self) -> Result<NetClient> {
        NetClient::connect(
            &self.conf.server_address,
            self.conf.server_port,
            &self.conf.server_hostname,
            &self.conf.server_certfile,
        )
    }
}

fn not_loaded() -> Error {
    Error::OperationFailed("no account loaded".to_string())
}

/// Initialize the file logger once per process.
///
/// Bot accounts log to a separate file next to the configured one, so an
/// interactive client and a bot can share a base directory.
fn init_logging(conf: &Config, is_bot: bool) {
    LOG_INIT.call_once(|| {
        let mut logfile = conf.logfile.clone();
        if is_bot {
            let name = format!(
                "{}.bot.txt",
                logfile.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default()
            );
            logfile = logfile.with_file_name(name);
        }

        if let Ok(file) = File::create(&logfile) {
            let _ = WriteLogger::init(conf.loglevel, build_log_config(&conf.logformat), file);
        }
    });
}

/// Translate the configured printf-style `logformat` into the logger
/// configuration.
///
/// The backend renders records with a fixed field order, so each format
/// token only switches its record field on or off: `%(asctime)s` the
/// timestamp, `%(levelname)s` the level tag, `%(name)s` (or
/// `%(module)s`) the log target, `%(threadName)s` the thread id. The
/// message itself is always rendered.
fn build_log_config(logformat: &str) -> simplelog::Config {
    // A field is rendered for records at its configured level and above,
    // so Error means "always" and Off means "never".
    let toggle = |token: &str| {
        if logformat.contains(token) {
            log::LevelFilter::Error
        } else {
            log::LevelFilter::Off
        }
    };

    let target = if logformat.contains("%(name)s") || logformat.contains("%(module)s") {
        log::LevelFilter::Error
    } else {
        log::LevelFilter::Off
    };

    simplelog::ConfigBuilder::new()
        .set_time_level(toggle("%(asctime)s"))
        .set_max_level(toggle("%(levelname)s"))
        .set_target_level(target)
        .set_thread_level(toggle("%(threadName)s"))
        .build()
}
