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

//! Account and store lifecycle over real encrypted databases.

use std::time::{Duration, Instant};

use tempdir::TempDir;

use retro::{
    account::Account,
    config::Config,
    crypto::keys::IdentityPrivateKey,
    message::{ChatMessage, Message, UserId},
    Error,
};

const PASSWORD: &str = "pa55w0rd!X";

fn scratch_config() -> (TempDir, Config) {
    let tmp = TempDir::new("retro_store").unwrap();
    let conf = Config::new(Some(tmp.path().to_path_buf())).unwrap();
    (tmp, conf)
}

fn new_account(conf: &Config, username: &str, id: u8) -> Account {
    let key = IdentityPrivateKey::generate().unwrap();
    let user_id = UserId::from_bytes(&[id; 8]).unwrap();
    Account::create(conf, user_id, username, PASSWORD, key, false).unwrap()
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
fn account_create_load_roundtrip() {
    let (_tmp, conf) = scratch_config();

    let created = new_account(&conf, "alice", 1);
    let created_id = created.id;
    drop(created);

    let loaded = Account::load(&conf, "alice", PASSWORD, false).unwrap();
    assert_eq!(loaded.id, created_id);
    assert_eq!(loaded.name, "alice");
    assert!(loaded.friends.is_empty());

    // Key material survives the roundtrip: decrypt what the stored
    // public key encrypts
    let ct = loaded.pubkey.encrypt(b"probe").unwrap();
    assert_eq!(loaded.privkey.decrypt(&ct).unwrap(), b"probe");
}

#[test]
fn wrong_passphrase_fails_cleanly() {
    let (_tmp, conf) = scratch_config();
    drop(new_account(&conf, "alice", 1));

    match Account::load(&conf, "alice", "not-the-password", false) {
        Err(Error::AccountAuthFailed) => {}
        other => panic!("expected auth failure, got {:?}", other.err()),
    }

    // The account is untouched and still opens with the right passphrase
    assert!(Account::load(&conf, "alice", PASSWORD, false).is_ok());
}

#[test]
fn unknown_account_and_bad_salt() {
    let (_tmp, conf) = scratch_config();

    match Account::load(&conf, "nobody", PASSWORD, false) {
        Err(Error::AccountNotFound(_)) => {}
        other => panic!("expected not found, got {:?}", other.err()),
    }

    drop(new_account(&conf, "alice", 1));
    std::fs::write(conf.account_dir("alice").join(".salt"), b"short").unwrap();
    match Account::load(&conf, "alice", PASSWORD, false) {
        Err(Error::AccountCorrupt(_)) => {}
        other => panic!("expected corrupt, got {:?}", other.err()),
    }
}

#[test]
fn friends_persist_and_ids_are_unique() {
    let (_tmp, conf) = scratch_config();
    let mut alice = new_account(&conf, "alice", 1);

    let bobby_key = IdentityPrivateKey::generate().unwrap();
    let bobby_pem = bobby_key.public().to_pem().unwrap();
    let bobby_id = UserId::from_bytes(&[2; 8]).unwrap();

    alice.add_friend(bobby_id, "bobby", &bobby_pem).unwrap();

    // Same user id again violates the UNIQUE constraint
    match alice.add_friend(bobby_id, "bobby2", &bobby_pem) {
        Err(Error::Database(_)) => {}
        other => panic!("expected db error, got {:?}", other.err()),
    }

    drop(alice);

    // Friends are reloaded from the encrypted table
    let alice = Account::load(&conf, "alice", PASSWORD, false).unwrap();
    let friend = alice.friend_by_id(&bobby_id).unwrap();
    assert_eq!(friend.name, "bobby");
    assert_eq!(friend.msgdb_name.len(), 16);

    // The reloaded public key still verifies bobby's signatures
    let sig = bobby_key.sign(b"hello");
    assert!(friend.pubkey.verify(&sig, b"hello"));
}

#[test]
fn delete_friend_removes_conversation() {
    let (_tmp, conf) = scratch_config();
    let mut alice = new_account(&conf, "alice", 1);

    let bobby_key = IdentityPrivateKey::generate().unwrap();
    let bobby_id = UserId::from_bytes(&[2; 8]).unwrap();
    alice.add_friend(bobby_id, "bobby", &bobby_key.public().to_pem().unwrap()).unwrap();

    let friend = alice.friend_by_id(&bobby_id).unwrap().clone();
    alice
        .msg_store
        .add_msg(alice.master_key(), &friend, &chat("bobby", "alice", "24-01-01 10:00", "hi"))
        .unwrap();
    alice.msg_store.close_all();

    let dbfile = alice.path.join("msg").join(&friend.msgdb_name);
    assert!(dbfile.exists());

    alice.delete_friend(&bobby_id).unwrap();
    assert!(alice.friend_by_id(&bobby_id).is_none());
    assert!(!dbfile.exists());
}

#[test]
fn conversation_survives_idle_eviction() {
    let (_tmp, conf) = scratch_config();
    let mut alice = new_account(&conf, "alice", 1);

    let bobby_key = IdentityPrivateKey::generate().unwrap();
    let bobby_id = UserId::from_bytes(&[2; 8]).unwrap();
    alice.add_friend(bobby_id, "bobby", &bobby_key.public().to_pem().unwrap()).unwrap();
    let friend = alice.friend_by_id(&bobby_id).unwrap().clone();

    let mk = alice.master_key().to_vec();
    alice.msg_store.add_msg(&mk, &friend, &chat("alice", "bobby", "24-01-01 10:00", "one")).unwrap();
    assert!(alice.msg_store.is_open("bobby"));

    // Advance a synthetic clock past the idle timeout
    alice.msg_store.sweep_idle(Instant::now() + Duration::from_secs(21 * 60));
    assert!(!alice.msg_store.is_open("bobby"));

    // The next operation transparently reopens; nothing is lost
    let msgs = alice.msg_store.get_msgs(&mk, &friend, None, None).unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].msg.from_name(), "alice");

    // Unseen bookkeeping and idempotent set_all_seen
    assert_eq!(alice.msg_store.num_unseen(&mk, &friend).unwrap(), 1);
    alice.msg_store.set_all_seen(&mk, &friend).unwrap();
    alice.msg_store.set_all_seen(&mk, &friend).unwrap();
    assert_eq!(alice.msg_store.num_unseen(&mk, &friend).unwrap(), 0);
}

#[test]
fn logout_zeroizes_and_closes() {
    let (_tmp, conf) = scratch_config();
    let mut alice = new_account(&conf, "alice", 1);

    let bobby_key = IdentityPrivateKey::generate().unwrap();
    let bobby_id = UserId::from_bytes(&[2; 8]).unwrap();
    alice.add_friend(bobby_id, "bobby", &bobby_key.public().to_pem().unwrap()).unwrap();
    let friend = alice.friend_by_id(&bobby_id).unwrap().clone();

    let mk = alice.master_key().to_vec();
    alice.msg_store.add_msg(&mk, &friend, &chat("alice", "bobby", "24-01-01 10:00", "x")).unwrap();

    alice.logout();
    assert!(!alice.msg_store.is_open("bobby"));
    assert!(alice.friends.is_empty());
    assert!(alice.master_key().iter().all(|&b| b == 0));
}
