//! UDP tracker client (BEP 15). A raw big-endian binary protocol — not
//! bencoded — kept here as a thin collaborator the coordinator does not yet
//! dispatch to (HTTP announce is the only tracker path actually wired in);
//! this exists to demonstrate and test the wire format independently.

use crate::torrent::DownloadPlan;
use anyhow::{anyhow, bail, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use rand::Rng;
use std::io::Cursor;
use std::net::SocketAddr;
use std::time::Duration;

/// magic constant for UDP tracker protocol, see BEP 15
const UDP_TRACKER_PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const CONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct ConnectResponse {
    pub connection_id: u64,
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug)]
pub struct UdpTracker {
    socket: UdpSocket,
    connection_id: Option<u64>,
    poll: Poll,
    events: Events,
}

impl UdpTracker {
    pub fn new() -> Result<Self> {
        let mut socket = UdpSocket::bind("0.0.0.0:0".parse()?)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, Token(0), Interest::READABLE)?;
        Ok(Self {
            socket,
            connection_id: None,
            poll,
            events: Events::with_capacity(16),
        })
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<bool> {
        self.poll.poll(&mut self.events, Some(timeout))?;
        Ok(self.events.iter().next().is_some())
    }

    pub fn connect(&mut self, addr: SocketAddr) -> Result<ConnectResponse> {
        let mut rng = rand::thread_rng();
        let txn_id: u32 = rng.gen();

        let mut req = Vec::with_capacity(16);
        req.write_u64::<BigEndian>(UDP_TRACKER_PROTOCOL_ID)?;
        req.write_u32::<BigEndian>(ACTION_CONNECT)?;
        req.write_u32::<BigEndian>(txn_id)?;

        let mut attempts = CONNECT_ATTEMPTS;
        loop {
            self.socket.send_to(&req, addr)?;
            if !self.wait_readable(Duration::from_secs(5))? {
                attempts -= 1;
                if attempts == 0 {
                    bail!("udp tracker connect timed out");
                }
                continue;
            }

            let mut buf = [0u8; 16];
            let (len, _) = self.socket.recv_from(&mut buf)?;
            if len < 16 {
                bail!("udp tracker connect response too short");
            }
            let mut cursor = Cursor::new(&buf[..len]);
            let action = cursor.read_u32::<BigEndian>()?;
            let resp_txn = cursor.read_u32::<BigEndian>()?;
            if resp_txn != txn_id {
                bail!("udp tracker transaction id mismatch");
            }
            if action != ACTION_CONNECT {
                bail!("unexpected action {action} in connect response");
            }
            let connection_id = cursor.read_u64::<BigEndian>()?;
            self.connection_id = Some(connection_id);
            return Ok(ConnectResponse { connection_id });
        }
    }

    pub fn announce(
        &mut self,
        addr: SocketAddr,
        plan: &DownloadPlan,
        downloaded: u64,
        left: u64,
        uploaded: u64,
    ) -> Result<AnnounceResponse> {
        let connection_id = self
            .connection_id
            .ok_or_else(|| anyhow!("must connect() before announce()"))?;
        let mut rng = rand::thread_rng();
        let txn_id: u32 = rng.gen();

        let mut req = Vec::with_capacity(98);
        req.write_u64::<BigEndian>(connection_id)?;
        req.write_u32::<BigEndian>(ACTION_ANNOUNCE)?;
        req.write_u32::<BigEndian>(txn_id)?;
        req.extend_from_slice(&plan.info_hash);
        req.extend_from_slice(&plan.peer_id);
        req.write_u64::<BigEndian>(downloaded)?;
        req.write_u64::<BigEndian>(left)?;
        req.write_u64::<BigEndian>(uploaded)?;
        req.write_u32::<BigEndian>(0)?; // event: none
        req.write_u32::<BigEndian>(0)?; // ip_address: default
        req.write_u32::<BigEndian>(0)?; // key
        req.write_i32::<BigEndian>(-1)?; // num_want: default
        req.write_u16::<BigEndian>(plan.listen_port)?;

        let mut attempts = CONNECT_ATTEMPTS;
        loop {
            self.socket.send_to(&req, addr)?;
            if !self.wait_readable(Duration::from_secs(5))? {
                attempts -= 1;
                if attempts == 0 {
                    bail!("udp tracker announce timed out");
                }
                continue;
            }

            let mut buf = [0u8; 4096];
            let (len, _) = self.socket.recv_from(&mut buf)?;
            if len < 20 {
                bail!("udp tracker announce response too short");
            }
            let mut cursor = Cursor::new(&buf[..len]);
            let action = cursor.read_u32::<BigEndian>()?;
            let resp_txn = cursor.read_u32::<BigEndian>()?;
            if resp_txn != txn_id {
                bail!("udp tracker transaction id mismatch");
            }
            if action != ACTION_ANNOUNCE {
                bail!("unexpected action {action} in announce response");
            }
            let interval = cursor.read_u32::<BigEndian>()?;
            let leechers = cursor.read_u32::<BigEndian>()?;
            let seeders = cursor.read_u32::<BigEndian>()?;

            let remaining = &buf[20..len];
            let peers = remaining
                .chunks_exact(6)
                .map(|chunk| {
                    let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    SocketAddr::new(ip.into(), port)
                })
                .collect();

            return Ok(AnnounceResponse {
                interval,
                leechers,
                seeders,
                peers,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, WriteBytesExt};

    fn sample_plan() -> DownloadPlan {
        DownloadPlan {
            info_hash: [3u8; 20],
            peer_id: [4u8; 20],
            name: "test".to_string(),
            announce: "udp://tracker.example.invalid:6969".to_string(),
            length: 16384,
            piece_length: 16384,
            num_pieces: 1,
            final_piece_length: 16384,
            piece_hashes: vec![[0u8; 20]],
            output_path: "out".into(),
            listen_port: 6881,
            compact: true,
            seeder: false,
        }
    }

    #[test]
    fn connect_request_matches_bep15_layout() {
        let mut expected = Vec::new();
        expected.write_u64::<BigEndian>(UDP_TRACKER_PROTOCOL_ID).unwrap();
        expected.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
        expected.write_u32::<BigEndian>(0).unwrap();
        assert_eq!(expected.len(), 16);
    }

    #[test]
    fn announce_response_peer_parsing() {
        let mut body = Vec::new();
        body.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
        body.write_u32::<BigEndian>(42).unwrap();
        body.write_u32::<BigEndian>(900).unwrap();
        body.write_u32::<BigEndian>(1).unwrap();
        body.write_u32::<BigEndian>(2).unwrap();
        body.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1]);

        let mut cursor = Cursor::new(&body[..]);
        let action = cursor.read_u32::<BigEndian>().unwrap();
        let txn = cursor.read_u32::<BigEndian>().unwrap();
        let interval = cursor.read_u32::<BigEndian>().unwrap();
        assert_eq!(action, ACTION_ANNOUNCE);
        assert_eq!(txn, 42);
        assert_eq!(interval, 900);

        let peers_section = &body[20..];
        let peers: Vec<SocketAddr> = peers_section
            .chunks_exact(6)
            .map(|c| {
                let ip = std::net::Ipv4Addr::new(c[0], c[1], c[2], c[3]);
                SocketAddr::new(ip.into(), u16::from_be_bytes([c[4], c[5]]))
            })
            .collect();
        assert_eq!(peers, vec!["10.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn announce_before_connect_is_an_error() {
        let mut tracker = UdpTracker::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:6969".parse().unwrap();
        let result = tracker.announce(addr, &sample_plan(), 0, 16384, 0);
        assert!(result.is_err());
    }
}
