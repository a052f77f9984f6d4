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

//! Blocking network client.
//!
//! [`NetClient`] wraps a TCP or TLS stream and speaks the packet framing
//! of [`crate::protocol`]. Reads are bounded by an explicit timeout via a
//! poll-based readiness wait; a timeout before the first byte of a packet
//! and a clean close by the peer are reported as typed events, not errors.
//!
//! Send and receive paths are guarded by independent locks, so one reader
//! thread and one writer thread can share a connection without
//! interleaving byte streams.

use std::{
    fs::File,
    io::{BufReader, Read, Write},
    net::{Shutdown, TcpStream},
    os::fd::{AsRawFd, RawFd},
    path::Path,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use log::{debug, error, info};
use rustls::{pki_types::ServerName, ClientConfig, ClientConnection, RootCertStore, StreamOwned};

use crate::{
    protocol::{pack_packet, unpack_header, PacketType, HDR_SIZE},
    Error, Result,
};

/// Outcome of a bounded receive.
#[derive(Debug)]
pub enum RecvEvent {
    /// A full packet was read
    Packet(PacketType, Vec<u8>),
    /// The timeout expired before any byte arrived
    Timeout,
    /// The peer closed the connection cleanly before a packet started
    Closed,
}

/// Outcome of a bounded exact-length raw read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// The buffer was filled completely
    Done,
    /// The timeout expired before any byte arrived
    Timeout,
    /// The peer closed the connection before any byte arrived
    Closed,
}

enum Stream {
    Tcp(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    fn sock(&self) -> &TcpStream {
        match self {
            Self::Tcp(s) => s,
            Self::Tls(t) => &t.sock,
        }
    }

    /// Whether the TLS layer holds decrypted bytes that a poll on the
    /// underlying socket would not see.
    fn has_buffered_plaintext(&mut self) -> bool {
        match self {
            Self::Tcp(_) => false,
            Self::Tls(t) => match t.conn.process_new_packets() {
                Ok(io_state) => io_state.plaintext_bytes_to_read() > 0,
                Err(_) => false,
            },
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Tls(t) => t.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Tls(t) => t.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Tls(t) => t.flush(),
        }
    }
}

/// Blocking packet-framed connection to a relay or file server.
pub struct NetClient {
    stream: Mutex<Stream>,
    /// Second handle on the socket, used for readiness polls without
    /// holding the stream lock.
    sock: TcpStream,
    rlock: Mutex<()>,
    wlock: Mutex<()>,
    peer: String,
}

impl NetClient {
    /// Connect with TLS. The certificate file pins the server; `hostname`
    /// is used for SNI and verification.
    pub fn connect(address: &str, port: u16, hostname: &str, cert_file: &Path) -> Result<Self> {
        info!(target: "retro::net", "Connecting to {}:{} ...", address, port);

        let tcp = TcpStream::connect((address, port))?;
        let _ = tcp.set_nodelay(true);
        let sock = tcp.try_clone()?;

        let tls_config = tls_client_config(cert_file)?;
        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|e| Error::Tls(format!("invalid server name '{}': {}", hostname, e)))?;
        let conn = ClientConnection::new(Arc::new(tls_config), server_name)?;

        Ok(Self {
            stream: Mutex::new(Stream::Tls(Box::new(StreamOwned::new(conn, tcp)))),
            sock,
            rlock: Mutex::new(()),
            wlock: Mutex::new(()),
            peer: format!("{}:{}", address, port),
        })
    }

    /// Connect without TLS.
    pub fn connect_plain(address: &str, port: u16) -> Result<Self> {
        info!(target: "retro::net", "Connecting to {}:{} (plaintext) ...", address, port);
        let tcp = TcpStream::connect((address, port))?;
        let _ = tcp.set_nodelay(true);
        Self::from_tcp(tcp)
    }

    /// Wrap an already connected plain TCP stream.
    pub fn from_tcp(tcp: TcpStream) -> Result<Self> {
        let peer = match tcp.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "<unknown>".to_string(),
        };
        let sock = tcp.try_clone()?;

        Ok(Self {
            stream: Mutex::new(Stream::Tcp(tcp)),
            sock,
            rlock: Mutex::new(()),
            wlock: Mutex::new(()),
            peer,
        })
    }

    /// The remote address as `host:port`.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send a packet with the given type and payload parts.
    pub fn send_packet(&self, pckt_type: PacketType, parts: &[&[u8]]) -> Result<()> {
        let pckt = pack_packet(pckt_type, parts);
        debug!(target: "retro::net", "Send {} ({} bytes) to {}", pckt_type, pckt.len(), self.peer);
        self.send_raw(&pckt)
    }

    /// Send raw bytes with send-all semantics (no packet framing).
    pub fn send_raw(&self, data: &[u8]) -> Result<()> {
        let _w = self.wlock.lock().unwrap();
        let mut stream = self.stream.lock().unwrap();
        stream.write_all(data)?;
        stream.flush()?;
        Ok(())
    }

    /// Receive one packet, waiting at most `timeout` for it to start.
    ///
    /// A timeout before the first header byte yields [`RecvEvent::Timeout`],
    /// a clean close before the header yields [`RecvEvent::Closed`]. A
    /// truncation mid-packet is a hard [`Error::IoTruncated`].
    pub fn recv_packet(&self, timeout: Duration) -> Result<RecvEvent> {
        let _r = self.rlock.lock().unwrap();

        let mut hdr = [0u8; HDR_SIZE];
        match self.read_exact_bounded(&mut hdr, timeout)? {
            ReadStatus::Done => {}
            ReadStatus::Timeout => return Ok(RecvEvent::Timeout),
            ReadStatus::Closed => return Ok(RecvEvent::Closed),
        }

        let (_, pckt_type, size) = unpack_header(&hdr)?;
        let pckt_type = PacketType::try_from(pckt_type)?;

        let mut payload = vec![0u8; size as usize];
        if size > 0 {
            match self.read_exact_bounded(&mut payload, timeout)? {
                ReadStatus::Done => {}
                _ => return Err(Error::IoTruncated),
            }
        }

        debug!(target: "retro::net", "Recv {} ({} bytes) from {}", pckt_type, payload.len(), self.peer);
        Ok(RecvEvent::Packet(pckt_type, payload))
    }

    /// Fill `buf` exactly from the raw stream (no packet framing).
    ///
    /// `timeout` bounds each wait for more data, not the total transfer.
    pub fn recv_exact(&self, buf: &mut [u8], timeout: Duration) -> Result<ReadStatus> {
        let _r = self.rlock.lock().unwrap();
        self.read_exact_bounded(buf, timeout)
    }

    /// Shut the connection down. Pending reads fail promptly.
    pub fn close(&self) {
        let _ = self.sock.shutdown(Shutdown::Both);
    }

    /// Read exactly `buf.len()` bytes. The deadline is refreshed whenever
    /// progress is made, so `timeout` bounds each individual wait.
    ///
    /// Caller must hold `rlock`.
    fn read_exact_bounded(&self, buf: &mut [u8], timeout: Duration) -> Result<ReadStatus> {
        let mut nread = 0;
        let mut deadline = Instant::now() + timeout;

        while nread < buf.len() {
            // Readiness wait, without holding the stream lock so that
            // concurrent writers are not starved by an idle reader.
            let buffered = self.stream.lock().unwrap().has_buffered_plaintext();
            if !buffered {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() || !wait_readable(self.sock.as_raw_fd(), remaining)? {
                    return if nread == 0 { Ok(ReadStatus::Timeout) } else { Err(Error::IoTruncated) }
                }
            }

            let mut stream = self.stream.lock().unwrap();
            let remaining = deadline.saturating_duration_since(Instant::now());
            let _ = stream.sock().set_read_timeout(Some(remaining.max(Duration::from_millis(1))));

            match stream.read(&mut buf[nread..]) {
                Ok(0) => {
                    return if nread == 0 { Ok(ReadStatus::Closed) } else { Err(Error::IoTruncated) }
                }
                Ok(n) => {
                    nread += n;
                    deadline = Instant::now() + timeout;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock |
                            std::io::ErrorKind::TimedOut |
                            std::io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    error!(target: "retro::net", "Read from {} failed: {}", self.peer, e);
                    return Err(e.into())
                }
            }
        }

        Ok(ReadStatus::Done)
    }
}

/// Wait until the socket is readable or the timeout expires.
fn wait_readable(fd: RawFd, timeout: Duration) -> Result<bool> {
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false)
        }

        let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
        let millis = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;

        let rc = unsafe { libc::poll(&mut pfd, 1, millis.max(1)) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue
            }
            error!(target: "retro::net", "poll failed: {}", err);
            return Err(err.into())
        }

        return Ok(rc > 0)
    }
}

/// Build a TLS client config trusting exactly the given certificate file.
fn tls_client_config(cert_file: &Path) -> Result<ClientConfig> {
    let file = File::open(cert_file)
        .map_err(|e| Error::InvalidCertificate(format!("{:?}: {}", cert_file, e)))?;
    let mut reader = BufReader::new(file);

    let mut roots = RootCertStore::empty();
    let mut found = 0;
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| Error::InvalidCertificate(e.to_string()))?;
        roots.add(cert).map_err(|e| Error::InvalidCertificate(e.to_string()))?;
        found += 1;
    }

    if found == 0 {
        return Err(Error::InvalidCertificate(format!("no certificate in {:?}", cert_file)))
    }

    Ok(ClientConfig::builder().with_root_certificates(roots).with_no_client_auth())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn loopback_pair() -> (NetClient, NetClient) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        (NetClient::from_tcp(client).unwrap(), NetClient::from_tcp(server).unwrap())
    }

    #[test]
    fn test_packet_roundtrip() {
        let (alice, bob) = loopback_pair();

        alice.send_packet(PacketType::Hello, &[b"user", b"nonce"]).unwrap();
        match bob.recv_packet(Duration::from_secs(1)).unwrap() {
            RecvEvent::Packet(t, payload) => {
                assert_eq!(t, PacketType::Hello);
                assert_eq!(payload, b"usernonce");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_empty_payload() {
        let (alice, bob) = loopback_pair();

        alice.send_packet(PacketType::Goodbye, &[]).unwrap();
        match bob.recv_packet(Duration::from_secs(1)).unwrap() {
            RecvEvent::Packet(t, payload) => {
                assert_eq!(t, PacketType::Goodbye);
                assert!(payload.is_empty());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_timeout_is_not_an_error() {
        let (_alice, bob) = loopback_pair();

        match bob.recv_packet(Duration::from_millis(50)).unwrap() {
            RecvEvent::Timeout => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_peer_close_is_reported() {
        let (alice, bob) = loopback_pair();

        alice.close();
        match bob.recv_packet(Duration::from_secs(1)).unwrap() {
            RecvEvent::Closed => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let (alice, bob) = loopback_pair();

        // A header claiming protocol version 2
        let hdr: [u8; 8] = [0x00, 0x02, 0x00, 0x0a, 0x00, 0x00, 0x00, 0x00];
        alice.send_raw(&hdr).unwrap();

        assert!(matches!(
            bob.recv_packet(Duration::from_secs(1)),
            Err(Error::ProtocolVersionMismatch(0x0002))
        ));
    }
}
