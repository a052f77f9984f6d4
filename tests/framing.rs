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

//! Wire framing properties over a loopback connection pair.

use std::{
    net::{TcpListener, TcpStream},
    thread,
    time::Duration,
};

use retro::{
    net::{NetClient, RecvEvent},
    protocol::{pack_header, unpack_header, PacketType},
    Error,
};

fn loopback_pair() -> (NetClient, NetClient) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();

    (NetClient::from_tcp(client).unwrap(), NetClient::from_tcp(server).unwrap())
}

#[test]
fn header_codec_roundtrip_domain() {
    // Walk the type domain in coarse steps plus the edges
    let types: Vec<u16> =
        (0..=u16::MAX).step_by(257).chain([u16::MAX]).collect();
    let sizes = [0i32, 1, 7, 255, 65536, i32::MAX];

    for &t in &types {
        for &n in &sizes {
            let (v, t2, n2) = unpack_header(&pack_header(t, n)).unwrap();
            assert_eq!((v, t2, n2), (1, t, n));
        }
    }
}

#[test]
fn packet_framing_preserves_type_and_payload() {
    let (alice, bobby) = loopback_pair();

    let parts: [&[u8]; 3] = [b"from....", b"to......", &[0xde, 0xad, 0xbe, 0xef]];
    let expect: Vec<u8> = parts.concat();

    let sender = thread::spawn(move || {
        alice.send_packet(PacketType::ChatMsg, &parts).unwrap();
        alice
    });

    match bobby.recv_packet(Duration::from_secs(2)).unwrap() {
        RecvEvent::Packet(t, payload) => {
            assert_eq!(t, PacketType::ChatMsg);
            assert_eq!(payload, expect);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    sender.join().unwrap();
}

#[test]
fn large_payload_crosses_intact() {
    let (alice, bobby) = loopback_pair();

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    let expect = payload.clone();

    let sender = thread::spawn(move || {
        alice.send_packet(PacketType::FileMsg, &[&payload]).unwrap();
    });

    match bobby.recv_packet(Duration::from_secs(5)).unwrap() {
        RecvEvent::Packet(t, got) => {
            assert_eq!(t, PacketType::FileMsg);
            assert_eq!(got, expect);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    sender.join().unwrap();
}

#[test]
fn version_mismatch_closes_the_session() {
    let (alice, bobby) = loopback_pair();

    // A packet claiming protocol version 0x0002
    let mut pckt = pack_header(PacketType::ChatMsg as u16, 0).to_vec();
    pckt[1] = 0x02;
    alice.send_raw(&pckt).unwrap();

    match bobby.recv_packet(Duration::from_secs(1)) {
        Err(Error::ProtocolVersionMismatch(0x0002)) => {}
        other => panic!("expected version mismatch, got {:?}", other),
    }

    // The connection is closed in response; the peer sees EOF
    bobby.close();
    match alice.recv_packet(Duration::from_secs(1)).unwrap() {
        RecvEvent::Closed => {}
        other => panic!("expected close, got {:?}", other),
    }
}

#[test]
fn concurrent_send_and_recv_do_not_interleave() {
    let (alice, bobby) = loopback_pair();

    // One thread floods packets while another drains them; every packet
    // must arrive with its framing intact.
    let sender = thread::spawn(move || {
        for i in 0..100u32 {
            let body = i.to_be_bytes();
            alice.send_packet(PacketType::ChatMsg, &[&body]).unwrap();
        }
        alice
    });

    for i in 0..100u32 {
        match bobby.recv_packet(Duration::from_secs(2)).unwrap() {
            RecvEvent::Packet(t, payload) => {
                assert_eq!(t, PacketType::ChatMsg);
                assert_eq!(payload, i.to_be_bytes());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    sender.join().unwrap();
}
