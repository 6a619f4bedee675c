//! The single-threaded download/upload coordinator. Owns the one `mio::Poll`
//! every peer socket and the listener are registered on, the piece store,
//! and the block-request scheduler. Nothing in this crate spawns a thread;
//! every state transition happens on `run()`'s call stack.

use crate::bitfield::BitField;
use crate::peer::message::Message;
use crate::peer::session::{FrameStatus, PeerSession, SessionState};
use crate::storage::PieceStore;
use crate::torrent::DownloadPlan;
use crate::tracker::http;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const LISTENER_TOKEN: Token = Token(0);
const FIRST_PEER_TOKEN: usize = 1;

/// Cap on blocks outstanding (requested, not yet gathered) at any time.
const WINDOW_CAP: usize = 50;
/// A requested block with no reply after this long is released back to the
/// scheduler for reassignment.
const BLOCK_REASSIGN_TIMEOUT: Duration = Duration::from_secs(10);
/// A peer silent (no bytes in either direction) longer than this is dropped.
const PEER_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
/// First keep-alive goes out after this much silence on a connection.
const KEEPALIVE_INITIAL: Duration = Duration::from_secs(60);
/// After the first keep-alive, subsequent ones go out on this shorter cadence.
const KEEPALIVE_AFTER: Duration = Duration::from_secs(5);
/// Outbound TCP connect attempts that haven't resolved in this long are
/// abandoned.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
/// A single readiness dispatch taking longer than this is logged as slow.
const SLOW_HANDLER_THRESHOLD: Duration = Duration::from_millis(1000);
/// A handshake not completed within this long after connect is abandoned.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll tick: bounds how promptly the scheduler/liveness sweeps run even
/// with no socket readiness at all.
const POLL_TICK: Duration = Duration::from_millis(200);

/// The number of leading blocks of a piece assigned to the piece's first
/// peer pick; the remainder go to the second pick (or back to the first if
/// only one peer holds the piece).
const FIRST_PICK_BLOCK_SHARE: usize = 25;

pub struct Coordinator {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    sessions: HashMap<Token, PeerSession>,
    connect_started: HashMap<Token, Instant>,
    handshake_started: HashMap<Token, Instant>,
    next_token: usize,
    store: PieceStore,
    plan: DownloadPlan,
    pending_drops: Vec<Token>,
    outstanding: usize,
    last_tracker_announce: Instant,
    tracker_interval: Duration,
    uploaded: u64,
    downloaded: u64,
}

impl Coordinator {
    pub fn bootstrap(plan: DownloadPlan, mut store: PieceStore) -> anyhow::Result<Coordinator> {
        if plan.seeder {
            store.mark_all_owned();
        }

        let listen_addr: SocketAddr = ([0, 0, 0, 0], plan.listen_port).into();
        let mut listener = TcpListener::bind(listen_addr)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let announce = http::announce_event(&plan, store.bitfield(), 0, 0, http::Event::Started)
            .unwrap_or_else(|e| {
                log::warn!("initial tracker announce failed: {e:#}");
                http::AnnounceResult::default()
            });

        let mut coordinator = Coordinator {
            poll,
            events: Events::with_capacity(1024),
            listener,
            sessions: HashMap::new(),
            connect_started: HashMap::new(),
            handshake_started: HashMap::new(),
            next_token: FIRST_PEER_TOKEN,
            store,
            plan,
            pending_drops: Vec::new(),
            outstanding: 0,
            last_tracker_announce: Instant::now(),
            tracker_interval: Duration::from_secs(announce.interval.max(1)),
            uploaded: 0,
            downloaded: 0,
        };

        for addr in announce.peers {
            if let Err(e) = coordinator.connect_to(addr) {
                log::debug!("connect to {addr} failed immediately: {e}");
            }
        }

        Ok(coordinator)
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn connect_to(&mut self, addr: SocketAddr) -> io::Result<()> {
        if self.sessions.values().any(|s| s.addr == addr) {
            return Ok(());
        }
        let mut stream = TcpStream::connect(addr)?;
        let token = self.alloc_token();
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
        let session = PeerSession::outbound(token, stream, addr, self.store.num_pieces());
        self.sessions.insert(token, session);
        self.connect_started.insert(token, Instant::now());
        Ok(())
    }

    /// Runs until every piece is verified and persisted (leecher mode), or
    /// forever while serving requests (seeder mode).
    pub fn run(&mut self) -> anyhow::Result<()> {
        loop {
            self.poll.poll(&mut self.events, Some(POLL_TICK))?;

            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();

            for (token, readable, writable) in ready {
                if token == LISTENER_TOKEN {
                    self.accept_inbound();
                    continue;
                }
                let started = Instant::now();
                self.handle_readiness(token, readable, writable);
                let elapsed = started.elapsed();
                if elapsed > SLOW_HANDLER_THRESHOLD {
                    log::warn!("session {token:?} dispatch took {elapsed:?}");
                }
            }

            self.run_scheduler();
            self.handle_deadlines();
            self.liveness_sweep();
            self.maybe_reannounce();
            self.flush_drops();

            if !self.plan.seeder && self.store.is_complete() {
                log::info!("download complete: {}", self.plan.name);
                let _ = http::announce_event(
                    &self.plan,
                    self.store.bitfield(),
                    self.uploaded,
                    self.downloaded,
                    http::Event::Completed,
                );
                return Ok(());
            }
        }
    }

    fn accept_inbound(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let token = self.alloc_token();
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        log::warn!("failed to register inbound peer {addr}: {e}");
                        continue;
                    }
                    let session = PeerSession::inbound(token, stream, addr, self.store.num_pieces());
                    self.handshake_started.insert(token, Instant::now());
                    self.sessions.insert(token, session);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn handle_readiness(&mut self, token: Token, readable: bool, writable: bool) {
        let result = self.dispatch_session_event(token, readable, writable);
        if let Err(e) = result {
            log::debug!("dropping peer {token:?}: {e}");
            self.pending_drops.push(token);
        }
    }

    fn dispatch_session_event(&mut self, token: Token, readable: bool, writable: bool) -> io::Result<()> {
        let state = match self.sessions.get(&token) {
            Some(s) => s.state,
            None => return Ok(()),
        };

        match state {
            SessionState::Connecting => {
                if writable {
                    let session = self.sessions.get_mut(&token).unwrap();
                    session.connect_completed()?;
                    self.connect_started.remove(&token);
                    let session = self.sessions.get_mut(&token).unwrap();
                    session.send_handshake(self.plan.info_hash, self.plan.peer_id)?;
                    self.handshake_started.insert(token, Instant::now());
                }
            }
            SessionState::Handshaking => {
                if readable {
                    self.drive_handshake(token)?;
                }
            }
            SessionState::AcceptedPending => {
                if readable {
                    self.drive_handshake(token)?;
                }
            }
            SessionState::Established => {
                if writable {
                    let session = self.sessions.get_mut(&token).unwrap();
                    session.flush_writes()?;
                }
                if readable {
                    self.drain_messages(token)?;
                }
            }
            SessionState::Closed => {}
        }
        Ok(())
    }

    fn drive_handshake(&mut self, token: Token) -> io::Result<()> {
        let session = self.sessions.get_mut(&token).unwrap();
        let maybe_hs = session.try_read_handshake()?;
        let handshake = match maybe_hs {
            None => return Ok(()),
            Some(hs) => hs,
        };

        if !handshake.check(&self.plan.info_hash) {
            return Err(io::Error::new(ErrorKind::InvalidData, "handshake info_hash mismatch"));
        }

        let was_inbound = session.state == SessionState::AcceptedPending;
        session.mark_established(handshake.peer_id);
        self.handshake_started.remove(&token);

        if was_inbound {
            let session = self.sessions.get_mut(&token).unwrap();
            session.send_handshake(self.plan.info_hash, self.plan.peer_id)?;
            session.state = SessionState::Established;
        }

        if self.store.bitfield().pieces().len() > 0 {
            let bitfield = self.store.bitfield().as_bytes().to_vec();
            let session = self.sessions.get_mut(&token).unwrap();
            session.send(&Message::Bitfield(bitfield))?;
        }

        // Startup step 4 (spec §4.5): every peer we establish a session with
        // is proactively unchoked — this client never rate-limits uploads or
        // applies a tit-for-tat choking policy.
        let session = self.sessions.get_mut(&token).unwrap();
        session.am_choking = false;
        session.send(&Message::Unchoke)?;
        Ok(())
    }

    fn drain_messages(&mut self, token: Token) -> io::Result<()> {
        loop {
            let session = self.sessions.get_mut(&token).unwrap();
            let status = match session.try_read_frame() {
                Ok(s) => s,
                Err(e) if e.kind() == ErrorKind::Unsupported => {
                    log::debug!("peer {token:?} sent an unsupported message id, ignoring");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match status {
                FrameStatus::Pending => return Ok(()),
                FrameStatus::Closed => {
                    return Err(io::Error::new(ErrorKind::UnexpectedEof, "peer closed connection"))
                }
                FrameStatus::Ready(msg) => self.apply_message(token, msg)?,
            }
        }
    }

    fn apply_message(&mut self, token: Token, msg: Message) -> io::Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                self.sessions.get_mut(&token).unwrap().on_choke();
            }
            Message::Unchoke => {
                self.sessions.get_mut(&token).unwrap().on_unchoke();
            }
            Message::Interested => {
                let reply = self.sessions.get_mut(&token).unwrap().on_interested();
                self.send(token, &reply)?;
            }
            Message::NotInterested => {
                let reply = self.sessions.get_mut(&token).unwrap().on_not_interested();
                self.send(token, &reply)?;
            }
            Message::Have(index) => {
                let local = self.store.bitfield().clone();
                if let Some(reply) = self.sessions.get_mut(&token).unwrap().on_have(index, &local) {
                    self.send(token, &reply)?;
                }
            }
            Message::Bitfield(payload) => {
                let local = self.store.bitfield().clone();
                let reply = self
                    .sessions
                    .get_mut(&token)
                    .unwrap()
                    .on_bitfield(&payload, &local)?;
                if let Some(reply) = reply {
                    self.send(token, &reply)?;
                }
            }
            Message::Request(index, begin, length) => {
                let reply = self
                    .sessions
                    .get(&token)
                    .and_then(|s| s.handle_request(index, begin, length, &self.store));
                if let Some(reply) = reply {
                    self.uploaded += length as u64;
                    self.send(token, &reply)?;
                }
            }
            Message::Piece(index, begin, data) => {
                self.downloaded += data.len() as u64;
                self.release_block(index, begin);
                let finished = self.store.ingest_block(index, begin, &data)?;
                self.outstanding = self.outstanding.saturating_sub(1);
                if finished {
                    self.finish_piece(index)?;
                }
            }
            Message::Cancel(_, _, _) => {
                // We answer requests synchronously within one dispatch, so
                // there is never a queued response left to cancel.
            }
        }
        Ok(())
    }

    fn finish_piece(&mut self, index: u32) -> io::Result<()> {
        let verified = self.store.verify_and_persist(index as usize)?;
        if !verified {
            log::warn!("piece {index} failed hash verification, re-requesting");
            return Ok(());
        }

        let local = self.store.bitfield().clone();
        let mut follow_ups: Vec<(Token, Message)> = Vec::new();
        for (token, session) in self.sessions.iter_mut() {
            if !session.is_established() {
                continue;
            }
            follow_ups.push((*token, Message::Have(index)));
            if let Some(reply) = session.recompute_interest_after_local_update(&local) {
                follow_ups.push((*token, reply));
            }
        }
        for (token, msg) in follow_ups {
            self.send(token, &msg)?;
        }
        Ok(())
    }

    fn release_block(&mut self, index: u32, begin: u32) {
        if let Some(piece) = self.store.pieces_mut().get_mut(index as usize) {
            if let Some(block) = piece.blocks.iter_mut().find(|b| b.begin == begin) {
                block.sent_to = None;
                block.requested_at = None;
            }
        }
    }

    /// Assigns requests for outstanding blocks up to the window cap. For
    /// each unfinished piece (in index order) up to two peers holding that
    /// piece are picked at random; the piece's first
    /// `FIRST_PICK_BLOCK_SHARE` still-needed blocks go to the first pick,
    /// the rest to the second (or back to the first if only one peer has
    /// the piece).
    fn run_scheduler(&mut self) {
        if self.plan.seeder {
            return;
        }
        let mut budget = WINDOW_CAP.saturating_sub(self.outstanding);
        if budget == 0 {
            return;
        }

        let num_pieces = self.store.num_pieces();
        let mut rng = rand::thread_rng();
        let mut to_request: Vec<(Token, u32, u32, u32)> = Vec::new();

        for piece_index in 0..num_pieces {
            if budget == 0 {
                break;
            }
            let store = &mut self.store;
            if store.piece(piece_index).finished {
                continue;
            }

            let eligible: Vec<Token> = self
                .sessions
                .iter()
                .filter(|(_, s)| {
                    s.is_established() && !s.peer_choking && s.bitfield.is_set(piece_index)
                })
                .map(|(t, _)| *t)
                .collect();
            if eligible.is_empty() {
                continue;
            }
            // Each pick is drawn independently (with replacement): the same
            // peer may land in both slots, matching the spec's "sampling is
            // independent per piece" tie-break rule.
            let pick0 = eligible.choose(&mut rng).copied();
            let pick1 = eligible.choose(&mut rng).copied();

            let piece = &mut self.store.pieces_mut()[piece_index];
            let needed: Vec<usize> = piece
                .blocks
                .iter()
                .enumerate()
                .filter(|(_, b)| !b.gathered && b.sent_to.is_none())
                .map(|(i, _)| i)
                .collect();

            for (slot, block_idx) in needed.into_iter().enumerate() {
                if budget == 0 {
                    break;
                }
                let peer = if slot < FIRST_PICK_BLOCK_SHARE { pick0 } else { pick1 };
                let peer = match peer {
                    Some(p) => p,
                    None => continue,
                };
                let block = &mut piece.blocks[block_idx];
                block.sent_to = Some(peer);
                block.requested_at = Some(Instant::now());
                log::trace!(
                    "requesting piece {} block {} from peer {peer:?}",
                    piece.index,
                    block.begin
                );
                to_request.push((peer, piece.index, block.begin, block.length));
                budget -= 1;
            }
        }

        for (peer, index, begin, length) in to_request {
            self.outstanding += 1;
            let _ = self.send(peer, &Message::Request(index, begin, length));
        }
    }

    /// Releases any block whose request has gone unanswered past
    /// `BLOCK_REASSIGN_TIMEOUT` so the scheduler can reassign it next pass.
    fn handle_deadlines(&mut self) {
        let now = Instant::now();
        let mut released = 0usize;
        for piece in self.store.pieces_mut() {
            if piece.finished {
                continue;
            }
            for block in piece.blocks.iter_mut() {
                if let Some(requested_at) = block.requested_at {
                    if !block.gathered && now.duration_since(requested_at) > BLOCK_REASSIGN_TIMEOUT {
                        block.sent_to = None;
                        block.requested_at = None;
                        released += 1;
                    }
                }
            }
        }
        self.outstanding = self.outstanding.saturating_sub(released);

        let timed_out: Vec<Token> = self
            .connect_started
            .iter()
            .filter(|(_, started)| now.duration_since(**started) > CONNECT_TIMEOUT)
            .map(|(t, _)| *t)
            .chain(
                self.handshake_started
                    .iter()
                    .filter(|(_, started)| now.duration_since(**started) > HANDSHAKE_TIMEOUT)
                    .map(|(t, _)| *t),
            )
            .collect();
        for token in timed_out {
            self.pending_drops.push(token);
        }
    }

    /// Drops peers that have been silent too long or whose socket no longer
    /// has a valid remote endpoint; sends a keep-alive to peers approaching
    /// silence so the connection isn't mistaken as dead by the remote side
    /// either. Once the first keep-alive has gone out, re-pings are
    /// throttled to the `KEEPALIVE_AFTER` cadence rather than firing on
    /// every poll tick.
    fn liveness_sweep(&mut self) {
        let now = Instant::now();
        let mut to_ping = Vec::new();
        let mut to_drop = Vec::new();
        for (token, session) in self.sessions.iter() {
            if !session.is_established() {
                continue;
            }
            if !session.is_open() {
                to_drop.push(*token);
                continue;
            }
            let silence = now.duration_since(session.last_seen);
            if silence > PEER_IDLE_TIMEOUT {
                to_drop.push(*token);
                continue;
            }
            if silence > KEEPALIVE_INITIAL {
                let due = match session.last_keepalive_sent {
                    None => true,
                    Some(sent) => now.duration_since(sent) > KEEPALIVE_AFTER,
                };
                if due {
                    to_ping.push(*token);
                }
            }
        }
        for token in to_ping {
            if self.send(token, &Message::KeepAlive).is_ok() {
                if let Some(session) = self.sessions.get_mut(&token) {
                    session.last_keepalive_sent = Some(now);
                }
            }
        }
        for token in to_drop {
            self.pending_drops.push(token);
        }
    }

    fn maybe_reannounce(&mut self) {
        if self.last_tracker_announce.elapsed() < self.tracker_interval {
            return;
        }
        match http::announce_event(
            &self.plan,
            self.store.bitfield(),
            self.uploaded,
            self.downloaded,
            http::Event::Empty,
        ) {
            Ok(result) => {
                self.tracker_interval = Duration::from_secs(result.interval.max(1));
                for addr in result.peers {
                    if let Err(e) = self.connect_to(addr) {
                        log::debug!("re-announce connect to {addr} failed: {e}");
                    }
                }
            }
            Err(e) => log::warn!("re-announce failed: {e:#}"),
        }
        self.last_tracker_announce = Instant::now();
    }

    fn send(&mut self, token: Token, msg: &Message) -> io::Result<()> {
        match self.sessions.get_mut(&token) {
            Some(session) => session.send(msg),
            None => Ok(()),
        }
    }

    /// Deferred removal: sessions flagged for drop during event processing
    /// are only removed here, after iteration over `self.sessions` has
    /// fully ended, so a drop triggered mid-dispatch never invalidates an
    /// iterator the dispatch loop is still walking.
    fn flush_drops(&mut self) {
        let tokens = std::mem::take(&mut self.pending_drops);
        for token in tokens {
            self.connect_started.remove(&token);
            self.handshake_started.remove(&token);
            if let Some(mut session) = self.sessions.remove(&token) {
                for piece in self.store.pieces_mut() {
                    for block in piece.blocks.iter_mut() {
                        if block.sent_to == Some(token) {
                            block.sent_to = None;
                            block.requested_at = None;
                            self.outstanding = self.outstanding.saturating_sub(1);
                        }
                    }
                }
                let _ = self.poll.registry().deregister(&mut session.stream);
                session.close();
            }
        }
    }

    pub fn bitfield(&self) -> &BitField {
        self.store.bitfield()
    }
}
