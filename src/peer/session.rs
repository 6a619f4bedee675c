//! Per-peer connection state machine: handshake, choke/interest flags,
//! remote bitfield, framing. A session owns nothing but its own socket and
//! buffers — the coordinator owns the single `mio::Poll` all sessions are
//! registered on, and drives every state transition here.

use crate::bitfield::BitField;
use crate::peer::handshake::{Handshake, HANDSHAKE_LEN};
use crate::peer::message::Message;
use crate::storage::PieceStore;
use crate::BLOCK_LEN;
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::Token;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Outbound TCP connect in progress.
    Connecting,
    /// Handshake sent, waiting to read the remote's 68 bytes.
    Handshaking,
    /// Accepted inbound, waiting for the peer's first message to be their
    /// handshake.
    AcceptedPending,
    Established,
    Closed,
}

/// The result of draining and decoding as much as the socket currently
/// offers, during `Established`.
pub enum FrameStatus {
    /// No complete frame is buffered yet; keep the session open.
    Pending,
    /// The peer closed the connection (a zero-length read).
    Closed,
    Ready(Message),
}

pub struct PeerSession {
    pub token: Token,
    pub stream: TcpStream,
    pub addr: SocketAddr,
    pub state: SessionState,
    pub peer_id: Option<[u8; 20]>,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub bitfield: BitField,
    pub last_seen: Instant,
    /// When a keep-alive was last sent to this peer, so the coordinator's
    /// liveness sweep can throttle re-pings to the post-first-ping cadence.
    pub last_keepalive_sent: Option<Instant>,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl PeerSession {
    /// A session for a non-blocking outbound connect already in flight.
    pub fn outbound(token: Token, stream: TcpStream, addr: SocketAddr, num_pieces: usize) -> PeerSession {
        PeerSession::new(token, stream, addr, num_pieces, SessionState::Connecting)
    }

    /// A session for a socket just accepted from the listener.
    pub fn inbound(token: Token, stream: TcpStream, addr: SocketAddr, num_pieces: usize) -> PeerSession {
        PeerSession::new(token, stream, addr, num_pieces, SessionState::AcceptedPending)
    }

    fn new(
        token: Token,
        stream: TcpStream,
        addr: SocketAddr,
        num_pieces: usize,
        state: SessionState,
    ) -> PeerSession {
        PeerSession {
            token,
            stream,
            addr,
            state,
            peer_id: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: BitField::new(num_pieces),
            last_seen: Instant::now(),
            last_keepalive_sent: None,
            read_buf: BytesMut::with_capacity(1 << 15),
            write_buf: BytesMut::new(),
        }
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Whether the underlying connection still has a valid remote endpoint.
    pub fn is_open(&self) -> bool {
        self.stream.peer_addr().is_ok()
    }

    pub fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.state = SessionState::Closed;
    }

    /// Queues a message for sending and attempts to flush immediately.
    pub fn send(&mut self, msg: &Message) -> io::Result<()> {
        self.write_buf.extend_from_slice(&msg.encode());
        self.flush_writes()
    }

    /// Writes as much of the pending buffer as the socket accepts right
    /// now without blocking.
    pub fn flush_writes(&mut self) -> io::Result<()> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "peer closed on write")),
                Ok(n) => self.write_buf.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Drains the socket into the read buffer until it would block.
    /// Returns `Ok(true)` if the peer closed the connection.
    fn drain_socket(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Call when `state == Connecting` and the socket became writable;
    /// checks whether the connect actually succeeded.
    pub fn connect_completed(&self) -> io::Result<()> {
        match self.stream.take_error()? {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Sends our handshake and transitions to `Handshaking`.
    pub fn send_handshake(&mut self, info_hash: [u8; 20], my_id: [u8; 20]) -> io::Result<()> {
        let handshake = Handshake::new(info_hash, my_id);
        self.stream.write_all(&handshake.to_bytes())?;
        self.state = SessionState::Handshaking;
        Ok(())
    }

    /// Attempts to read a 68-byte handshake. Returns `Ok(None)` if not
    /// enough data has arrived yet.
    pub fn try_read_handshake(&mut self) -> io::Result<Option<Handshake>> {
        let closed = self.drain_socket()?;
        if self.read_buf.len() < HANDSHAKE_LEN {
            if closed {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "peer closed during handshake"));
            }
            return Ok(None);
        }
        let bytes = self.read_buf.split_to(HANDSHAKE_LEN);
        let handshake = Handshake::from_bytes(&bytes)?;
        self.last_seen = Instant::now();
        Ok(Some(handshake))
    }

    /// Promotes an `AcceptedPending`/`Handshaking` session to `Established`
    /// once a valid handshake has been exchanged.
    pub fn mark_established(&mut self, peer_id: [u8; 20]) {
        self.peer_id = Some(peer_id);
        self.state = SessionState::Established;
    }

    /// Drains the socket and decodes every complete frame currently
    /// buffered. mio's edge-triggered readiness means a socket must be
    /// fully drained on each wakeup, so more than one message may become
    /// available per dispatch even though each logical request corresponds
    /// to "one framed message" in the protocol's own terms.
    pub fn try_read_frame(&mut self) -> io::Result<FrameStatus> {
        let closed = self.drain_socket()?;
        if self.read_buf.len() < 4 {
            return Ok(if closed { FrameStatus::Closed } else { FrameStatus::Pending });
        }
        let len = u32::from_be_bytes(self.read_buf[0..4].try_into().unwrap());
        if self.read_buf.len() < 4 + len as usize {
            return Ok(if closed { FrameStatus::Closed } else { FrameStatus::Pending });
        }
        self.read_buf.advance(4);
        let body = self.read_buf.split_to(len as usize);
        let msg = Message::decode(len, &body)?;
        self.last_seen = Instant::now();
        Ok(FrameStatus::Ready(msg))
    }

    pub fn on_choke(&mut self) {
        self.peer_choking = true;
    }

    pub fn on_unchoke(&mut self) {
        self.peer_choking = false;
    }

    /// Returns the reply to send (we always unchoke an interested peer —
    /// no upload rate limiting or tit-for-tat policy).
    pub fn on_interested(&mut self) -> Message {
        self.peer_interested = true;
        self.am_choking = false;
        Message::Unchoke
    }

    pub fn on_not_interested(&mut self) -> Message {
        self.peer_interested = false;
        self.am_choking = true;
        Message::Choke
    }

    /// Sets the remote bitfield bit and, if we lacked that piece, returns
    /// an `Interested` reply to send.
    pub fn on_have(&mut self, index: u32, local: &BitField) -> Option<Message> {
        self.bitfield.set(index as usize);
        if !local.is_set(index as usize) && !self.am_interested {
            self.am_interested = true;
            return Some(Message::Interested);
        }
        None
    }

    /// Replaces the remote bitfield. Errors (and the peer must be dropped)
    /// if the padded length doesn't match ours.
    pub fn on_bitfield(&mut self, payload: &[u8], local: &BitField) -> io::Result<Option<Message>> {
        self.bitfield.replace_from_payload(payload)?;
        if self.wants_any(local) && !self.am_interested {
            self.am_interested = true;
            return Ok(Some(Message::Interested));
        }
        Ok(None)
    }

    pub fn wants_any(&self, local: &BitField) -> bool {
        (0..local.num_pieces()).any(|i| self.bitfield.is_set(i) && !local.is_set(i))
    }

    /// Recomputes our interest in this peer after our own bitfield changed
    /// (a piece just completed). Only ever produces `NotInterested` — a
    /// newly completed piece can only reduce what we still want, never
    /// increase it.
    pub fn recompute_interest_after_local_update(&mut self, local: &BitField) -> Option<Message> {
        if self.am_interested && !self.wants_any(local) {
            self.am_interested = false;
            return Some(Message::NotInterested);
        }
        None
    }

    /// Builds the `piece` reply for a `request`, or `None` if we don't hold
    /// the piece or the requested length is unreasonable.
    pub fn handle_request(
        &self,
        index: u32,
        begin: u32,
        length: u32,
        store: &PieceStore,
    ) -> Option<Message> {
        if length > BLOCK_LEN || !store.bitfield().is_set(index as usize) {
            return None;
        }
        store
            .read_block_for_request(index, begin, length)
            .ok()
            .map(|data| Message::Piece(index, begin, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitfield::BitField;

    fn fresh_flags() -> PeerSession {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        PeerSession::new(Token(1), stream, addr, 8, SessionState::Established)
    }

    #[test]
    fn initial_flags_match_protocol_defaults() {
        let session = fresh_flags();
        assert!(session.am_choking);
        assert!(!session.am_interested);
        assert!(session.peer_choking);
        assert!(!session.peer_interested);
    }

    #[test]
    fn interested_triggers_unchoke_policy() {
        let mut session = fresh_flags();
        let reply = session.on_interested();
        assert!(session.peer_interested);
        assert!(!session.am_choking);
        assert!(matches!(reply, Message::Unchoke));
    }

    #[test]
    fn have_sets_bit_and_signals_interest_only_when_new() {
        let mut session = fresh_flags();
        let local = BitField::new(8);
        let reply = session.on_have(2, &local);
        assert!(session.bitfield.is_set(2));
        assert!(matches!(reply, Some(Message::Interested)));

        // already interested: no duplicate Interested message
        let reply2 = session.on_have(3, &local);
        assert!(reply2.is_none());
    }

    #[test]
    fn bitfield_length_mismatch_is_an_error() {
        let mut session = fresh_flags();
        let local = BitField::new(8);
        let err = session.on_bitfield(&[0u8; 2], &local).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn recompute_interest_only_ever_turns_off() {
        let mut session = fresh_flags();
        session.am_interested = true;
        let mut local = BitField::new(8);
        local.set(0);
        local.set(1);
        session.bitfield.set(0); // peer has piece 0, which we now also have
        let reply = session.recompute_interest_after_local_update(&local);
        assert!(matches!(reply, Some(Message::NotInterested)));
        assert!(!session.am_interested);
    }
}
