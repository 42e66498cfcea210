use super::error::PeerError;
use super::fast::{generate_allowed_fast_set, FastState, ALLOWED_FAST_SET_SIZE};
use super::message::{Handshake, Message};
use super::peer_id::PeerId;
use super::registry::{PeerCommand, PeerHandle, PeerRegistry};
use super::transport::{receive_handshake, send_handshake, MessageReader, MessageWriter};
use crate::config::Config;
use crate::pieces::{ChunkKey, PieceSet};
use crate::scheduler::{ChunkRegistry, ChunkRequestOutcome};
use crate::storage::{FileDirectory, Layout, StorageError};
use crate::torrent::TorrentShared;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Side effects a state transition asks the session task to carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write a message to the remote.
    Send(Message),
    /// Persist a delivered chunk, then record the durable write.
    Store { key: ChunkKey, data: Bytes },
    /// Fan endgame cancels out to the peers still assigned the chunk.
    CancelPeers(Vec<(PeerId, ChunkKey)>),
}

/// Everything a session task needs from its torrent.
#[derive(Clone)]
pub struct SessionParams {
    pub info_hash: [u8; 20],
    pub local_peer_id: PeerId,
    pub config: Arc<Config>,
    pub layout: Arc<Layout>,
    pub shared: Arc<TorrentShared>,
    pub registry: Arc<ChunkRegistry>,
    pub directory: Arc<FileDirectory>,
    pub peers: Arc<PeerRegistry>,
    pub committer: mpsc::UnboundedSender<u32>,
}

/// The per-peer protocol state machine.
///
/// Pure with respect to I/O: every handler mutates the session's own state,
/// talks to the chunk registry, and returns the [`Action`]s the driving
/// task must perform. Message preconditions that fail terminate the
/// session by returning an error.
pub struct SessionState {
    peer_id: PeerId,
    addr: SocketAddr,
    info_hash: [u8; 20],
    /// Fast extension negotiated on both sides.
    fast: bool,
    /// Extension protocol negotiated on both sides.
    extended: bool,
    /// The remote is choking us. Initial per protocol: true.
    remote_choked: bool,
    /// We are choking the remote. Initial per protocol: true.
    local_choking: bool,
    local_interested: bool,
    remote_interested: bool,
    /// Unknown until the first bitfield, HAVE, or HAVE_ALL/HAVE_NONE.
    remote_pieces: Option<PieceSet>,
    /// Pieces the remote still lacks; zero marks a seeder.
    pieces_left: usize,
    seeder: bool,
    /// Chunks we have requested and not yet seen answered.
    ///
    /// Invariant: a key is here iff the chunk registry holds an
    /// assignment of that chunk to this peer.
    inflight: HashSet<ChunkKey>,
    /// Remote requests waiting to be read from disk and sent.
    serve_queue: VecDeque<ChunkKey>,
    fast_state: FastState,
    config: Arc<Config>,
    layout: Arc<Layout>,
    shared: Arc<TorrentShared>,
    registry: Arc<ChunkRegistry>,
}

impl SessionState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer_id: PeerId,
        addr: SocketAddr,
        fast: bool,
        extended: bool,
        info_hash: [u8; 20],
        config: Arc<Config>,
        layout: Arc<Layout>,
        shared: Arc<TorrentShared>,
        registry: Arc<ChunkRegistry>,
    ) -> Self {
        Self {
            peer_id,
            addr,
            info_hash,
            fast,
            extended,
            remote_choked: true,
            local_choking: true,
            local_interested: false,
            remote_interested: false,
            remote_pieces: None,
            pieces_left: 0,
            seeder: false,
            inflight: HashSet::new(),
            serve_queue: VecDeque::new(),
            fast_state: FastState::new(),
            config,
            layout,
            shared,
            registry,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn is_seeder(&self) -> bool {
        self.seeder
    }

    pub fn is_local_interested(&self) -> bool {
        self.local_interested
    }

    pub fn is_remote_interested(&self) -> bool {
        self.remote_interested
    }

    pub fn is_remote_choking(&self) -> bool {
        self.remote_choked
    }

    pub fn in_flight(&self) -> &HashSet<ChunkKey> {
        &self.inflight
    }

    pub fn remote_pieces(&self) -> Option<&PieceSet> {
        self.remote_pieces.as_ref()
    }

    pub fn serve_queue_len(&self) -> usize {
        self.serve_queue.len()
    }

    /// Messages sent right after the handshake: our bitfield (or the fast
    /// shortcuts), the extended handshake, and our allowed-fast grants.
    pub fn startup(&mut self) -> Vec<Action> {
        let ours = self.shared.bitfield();
        let mut actions = Vec::new();

        if self.fast && ours.is_full() {
            actions.push(Action::Send(Message::HaveAll));
        } else if self.fast && ours.is_empty() {
            actions.push(Action::Send(Message::HaveNone));
        } else {
            actions.push(Action::Send(Message::Bitfield(ours.serialize())));
        }

        if self.extended {
            actions.push(Action::Send(Message::Extended {
                id: 0,
                payload: Bytes::new(),
            }));
        }

        if self.fast {
            let grants = generate_allowed_fast_set(
                &self.info_hash,
                self.addr.ip(),
                self.shared.num_pieces() as u32,
                ALLOWED_FAST_SET_SIZE,
            );
            for piece in grants {
                self.fast_state.allowed_outgoing.insert(piece);
                actions.push(Action::Send(Message::AllowedFast { piece }));
            }
        }

        actions
    }

    /// Applies one message from the remote. An error terminates the
    /// session.
    pub fn on_message(&mut self, msg: Message) -> Result<Vec<Action>, PeerError> {
        let mut actions = Vec::new();
        match msg {
            Message::KeepAlive => {}
            Message::Choke => self.on_choke(),
            Message::Unchoke => {
                self.remote_choked = false;
                self.try_fill(&mut actions);
            }
            Message::Interested => self.remote_interested = true,
            Message::NotInterested => self.remote_interested = false,
            Message::Have { piece } => self.on_have(piece, &mut actions)?,
            Message::Bitfield(bytes) => self.on_bitfield(&bytes, &mut actions)?,
            Message::HaveAll => self.on_have_shortcut(true, &mut actions)?,
            Message::HaveNone => self.on_have_shortcut(false, &mut actions)?,
            Message::Request {
                index,
                offset,
                length,
            } => self.on_request(index, offset, length, &mut actions)?,
            Message::Cancel {
                index,
                offset,
                length,
            } => {
                let key = ChunkKey::new(index, offset, length);
                self.serve_queue.retain(|queued| *queued != key);
            }
            Message::Piece {
                index,
                offset,
                data,
            } => self.on_piece(index, offset, data, &mut actions),
            Message::Suggest { piece } => {
                if !self.fast {
                    return Err(PeerError::FastNotNegotiated);
                }
                if (piece as usize) < self.shared.num_pieces() {
                    self.fast_state.add_suggested(piece);
                }
            }
            Message::Reject {
                index,
                offset,
                length,
            } => {
                if !self.fast {
                    return Err(PeerError::FastNotNegotiated);
                }
                let key = ChunkKey::new(index, offset, length);
                if self.inflight.remove(&key) {
                    self.registry.mark_dropped(key, self.peer_id);
                }
                self.try_fill(&mut actions);
            }
            Message::AllowedFast { piece } => {
                if !self.fast {
                    return Err(PeerError::FastNotNegotiated);
                }
                if (piece as usize) < self.shared.num_pieces() {
                    self.fast_state.add_allowed_incoming(piece);
                    self.try_fill(&mut actions);
                }
            }
            Message::Port(_) => {}
            Message::Extended { .. } => {
                if !self.extended {
                    return Err(PeerError::ExtendedNotNegotiated);
                }
                // Negotiated but unused; payloads are ignored.
            }
        }
        Ok(actions)
    }

    /// The torrent committed `piece`. Sends HAVE unless the remote already
    /// has it, and re-evaluates interest.
    pub fn on_have_broadcast(&mut self, piece: u32) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.remote_pieces.as_mut() {
            Some(remote) if remote.contains(piece as usize) => {
                // Both sides have it now; stop tracking it for interest.
                remote.remove(piece as usize);
                self.registry.forget_have(piece);
            }
            _ => actions.push(Action::Send(Message::Have { piece })),
        }

        if self.local_interested {
            if let Some(remote) = &self.remote_pieces {
                if !self.shared.check_interest(remote) {
                    self.local_interested = false;
                    actions.push(Action::Send(Message::NotInterested));
                }
            }
        }
        actions
    }

    /// Another peer delivered this chunk first.
    pub fn on_cancel_chunk(&mut self, key: ChunkKey) -> Vec<Action> {
        if self.inflight.remove(&key) {
            vec![Action::Send(Message::Cancel {
                index: key.piece,
                offset: key.offset,
                length: key.length,
            })]
        } else {
            Vec::new()
        }
    }

    /// Choke-policy decision about the remote.
    pub fn on_set_choke(&mut self, choke: bool) -> Vec<Action> {
        if choke == self.local_choking {
            return Vec::new();
        }
        self.local_choking = choke;
        let mut actions = vec![Action::Send(if choke {
            Message::Choke
        } else {
            Message::Unchoke
        })];

        if choke {
            while let Some(key) = self.serve_queue.pop_front() {
                if self.fast {
                    actions.push(Action::Send(Message::Reject {
                        index: key.piece,
                        offset: key.offset,
                        length: key.length,
                    }));
                }
            }
        }
        actions
    }

    /// Next queued remote request, if any.
    pub fn next_serve(&mut self) -> Option<ChunkKey> {
        self.serve_queue.pop_front()
    }

    /// Releases everything this session holds in the shared tables.
    pub fn teardown(&self) {
        self.registry.mark_all_dropped(self.peer_id);
        if let Some(remote) = &self.remote_pieces {
            self.registry.forget_piece_set(remote);
        }
    }

    fn on_choke(&mut self) {
        self.remote_choked = true;
        if !self.fast {
            // Without the fast extension nothing in flight will be
            // answered; with it the peer settles each request with
            // REJECT or PIECE.
            self.registry.mark_all_dropped(self.peer_id);
            self.inflight.clear();
        }
    }

    fn on_have(&mut self, piece: u32, actions: &mut Vec<Action>) -> Result<(), PeerError> {
        let n = self.shared.num_pieces();
        if piece as usize >= n {
            return Err(PeerError::InvalidPieceIndex(piece));
        }

        if self.remote_pieces.is_none() {
            self.remote_pieces = Some(PieceSet::empty(n));
            self.pieces_left = n;
        }
        let newly_added = match self.remote_pieces.as_mut() {
            Some(remote) => remote.insert(piece as usize),
            None => false,
        };
        if newly_added {
            self.registry.record_have(piece);
            self.pieces_left -= 1;
            if self.pieces_left == 0 {
                self.seeder = true;
            }
        }

        if !self.shared.has_piece(piece) && !self.local_interested {
            self.local_interested = true;
            actions.push(Action::Send(Message::Interested));
        }
        self.try_fill(actions);
        Ok(())
    }

    fn on_bitfield(&mut self, bytes: &[u8], actions: &mut Vec<Action>) -> Result<(), PeerError> {
        if self.remote_pieces.is_some() {
            return Err(PeerError::BitfieldAfterPieceSet);
        }
        let n = self.shared.num_pieces();
        let remote = PieceSet::parse(bytes, n)?;
        self.adopt_piece_set(remote, actions);
        Ok(())
    }

    fn on_have_shortcut(&mut self, all: bool, actions: &mut Vec<Action>) -> Result<(), PeerError> {
        if !self.fast {
            return Err(PeerError::FastNotNegotiated);
        }
        if self.remote_pieces.is_some() {
            return Err(PeerError::BitfieldAfterPieceSet);
        }
        let n = self.shared.num_pieces();
        let remote = if all {
            PieceSet::full(n)
        } else {
            PieceSet::empty(n)
        };
        self.adopt_piece_set(remote, actions);
        Ok(())
    }

    fn adopt_piece_set(&mut self, remote: PieceSet, actions: &mut Vec<Action>) {
        let n = self.shared.num_pieces();
        self.registry.record_piece_set(&remote);
        self.pieces_left = n - remote.len();
        self.seeder = self.pieces_left == 0;

        let interesting = self.shared.check_interest(&remote);
        self.remote_pieces = Some(remote);

        if interesting && !self.local_interested {
            self.local_interested = true;
            actions.push(Action::Send(Message::Interested));
        }
        self.try_fill(actions);
    }

    fn on_request(
        &mut self,
        index: u32,
        offset: u32,
        length: u32,
        actions: &mut Vec<Action>,
    ) -> Result<(), PeerError> {
        if index as usize >= self.shared.num_pieces() {
            return Err(PeerError::InvalidPieceIndex(index));
        }
        let key = ChunkKey::new(index, offset, length);
        let in_range = length > 0
            && offset as u64 + length as u64 <= self.layout.piece_length(index) as u64;
        let servable = in_range && self.shared.has_piece(index);

        let allowed = if self.local_choking {
            self.fast && servable && self.fast_state.should_serve_choked(index)
        } else {
            servable
        };

        if allowed {
            self.serve_queue.push_back(key);
        } else if self.fast {
            actions.push(Action::Send(Message::Reject {
                index,
                offset,
                length,
            }));
        }
        // Without the fast extension an unserved request is dropped
        // silently.
        Ok(())
    }

    fn on_piece(&mut self, index: u32, offset: u32, data: Bytes, actions: &mut Vec<Action>) {
        let key = ChunkKey::new(index, offset, data.len() as u32);
        if !self.inflight.remove(&key) {
            // Stray data we never asked for (or already canceled).
            tracing::trace!(peer = %self.peer_id, chunk = %key, "stray piece dropped");
            return;
        }

        self.shared.add_downloaded(data.len() as u64);
        let cancels = self.registry.mark_fetched(key, self.peer_id);
        actions.push(Action::Store { key, data });
        if !cancels.is_empty() {
            actions.push(Action::CancelPeers(cancels));
        }
        self.try_fill(actions);
    }

    /// Refills the request queue up to the high watermark when it has
    /// drained past the low one.
    fn try_fill(&mut self, actions: &mut Vec<Action>) {
        let Some(remote) = &self.remote_pieces else {
            return;
        };
        if self.inflight.len() > self.config.low_watermark {
            return;
        }
        let want = self.config.high_watermark.saturating_sub(self.inflight.len());
        if want == 0 {
            return;
        }

        // While choked we may only request allowed-fast pieces.
        let mut restricted = false;
        let request_set = if self.remote_choked {
            if !self.fast || self.fast_state.allowed_incoming.is_empty() {
                return;
            }
            let mut set = PieceSet::empty(remote.capacity());
            for &piece in &self.fast_state.allowed_incoming {
                if remote.contains(piece as usize) {
                    set.insert(piece as usize);
                }
            }
            if set.is_empty() {
                return;
            }
            restricted = true;
            set
        } else {
            remote.clone()
        };

        match self
            .registry
            .request_chunks(self.peer_id, &request_set, want)
        {
            ChunkRequestOutcome::Assigned(chunks) => {
                for key in chunks {
                    self.inflight.insert(key);
                    actions.push(Action::Send(Message::Request {
                        index: key.piece,
                        offset: key.offset,
                        length: key.length,
                    }));
                }
            }
            ChunkRequestOutcome::NotInterested => {
                if !restricted && self.local_interested {
                    self.local_interested = false;
                    actions.push(Action::Send(Message::NotInterested));
                }
            }
            ChunkRequestOutcome::NoneAvailable => {}
        }
    }
}

/// Dials a peer, handshakes, and runs the session until it ends.
pub(crate) async fn run_outgoing(
    params: SessionParams,
    addr: SocketAddr,
) -> Result<(), PeerError> {
    let mut stream = TcpStream::connect(addr).await?;
    let ours = Handshake::new(params.info_hash, params.local_peer_id.0);
    send_handshake(&mut stream, &ours, params.config.handshake_timeout).await?;
    let theirs = receive_handshake(&mut stream, params.config.handshake_timeout).await?;
    run_session(params, stream, theirs, addr).await
}

/// Runs a session for a connection the listener accepted. The listener
/// already consumed the remote handshake for capability detection; we
/// complete the exchange by sending ours.
pub(crate) async fn run_incoming(
    params: SessionParams,
    mut stream: TcpStream,
    theirs: Handshake,
) -> Result<(), PeerError> {
    let addr = stream.peer_addr()?;
    let ours = Handshake::new(params.info_hash, params.local_peer_id.0);
    send_handshake(&mut stream, &ours, params.config.handshake_timeout).await?;
    run_session(params, stream, theirs, addr).await
}

async fn run_session(
    params: SessionParams,
    stream: TcpStream,
    theirs: Handshake,
    addr: SocketAddr,
) -> Result<(), PeerError> {
    if theirs.info_hash != params.info_hash {
        return Err(PeerError::InfoHashMismatch);
    }

    let peer_id = PeerId(theirs.peer_id);
    let ours = Handshake::new(params.info_hash, params.local_peer_id.0);
    let fast = ours.supports_fast() && theirs.supports_fast();
    let extended = ours.supports_extended() && theirs.supports_extended();

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    params
        .peers
        .register(PeerHandle::new(peer_id, addr, cmd_tx))?;

    let (read_half, write_half) = stream.into_split();
    let mut reader = MessageReader::new(read_half, params.config.keep_alive_interval);
    let mut writer = MessageWriter::new(write_half);

    let mut state = SessionState::new(
        peer_id,
        addr,
        fast,
        extended,
        params.info_hash,
        params.config.clone(),
        params.layout.clone(),
        params.shared.clone(),
        params.registry.clone(),
    );

    tracing::debug!(peer = %peer_id, %addr, fast, extended, "session established");

    let result = drive(&mut state, &mut reader, &mut writer, &mut cmd_rx, &params).await;

    state.teardown();
    params.peers.deregister(peer_id);
    if let Err(err) = &result {
        tracing::debug!(peer = %peer_id, %addr, error = %err, "session terminated");
        params.peers.enter_bad(addr, peer_id);
    }
    result
}

async fn drive(
    state: &mut SessionState,
    reader: &mut MessageReader,
    writer: &mut MessageWriter,
    cmd_rx: &mut mpsc::UnboundedReceiver<PeerCommand>,
    params: &SessionParams,
) -> Result<(), PeerError> {
    let startup = state.startup();
    perform(writer, params, startup).await?;

    let mut keep_alive = tokio::time::interval(params.config.keep_alive_interval);
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keep_alive.tick().await;

    loop {
        tokio::select! {
            msg = reader.receive() => {
                let actions = state.on_message(msg?)?;
                perform(writer, params, actions).await?;
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { return Ok(()) };
                let actions = match cmd {
                    PeerCommand::Have(piece) => state.on_have_broadcast(piece),
                    PeerCommand::Cancel(key) => state.on_cancel_chunk(key),
                    PeerCommand::SetChoke(choke) => state.on_set_choke(choke),
                    PeerCommand::Shutdown => return Ok(()),
                };
                perform(writer, params, actions).await?;
            }
            _ = keep_alive.tick() => {
                writer.send(&Message::KeepAlive).await?;
            }
        }
        serve_pending(state, writer, params).await?;
    }
}

async fn perform(
    writer: &mut MessageWriter,
    params: &SessionParams,
    actions: Vec<Action>,
) -> Result<(), PeerError> {
    for action in actions {
        match action {
            Action::Send(msg) => writer.send(&msg).await?,
            Action::Store { key, data } => store_chunk(params, key, data).await,
            Action::CancelPeers(cancels) => {
                for (peer, key) in cancels {
                    params.peers.send_cancel(peer, key);
                }
            }
        }
    }
    Ok(())
}

/// Writes a delivered chunk through the file directory and records the
/// durable store. A failed write is a transient piece failure: the piece
/// goes back to the pool and is re-fetched lazily.
async fn store_chunk(params: &SessionParams, key: ChunkKey, data: Bytes) {
    let spans = match params.layout.chunk_spans(key.piece, key.offset, key.length) {
        Ok(spans) => spans,
        Err(err) => {
            tracing::warn!(chunk = %key, error = %err, "chunk does not map to disk");
            params.registry.release_piece(key.piece);
            return;
        }
    };

    let mut cursor = 0usize;
    for span in spans {
        let part = data.slice(cursor..cursor + span.length as usize);
        if let Err(err) = params.directory.write(span.file, span.offset, part).await {
            tracing::warn!(chunk = %key, error = %err, "chunk write failed");
            params.registry.release_piece(key.piece);
            return;
        }
        cursor += span.length as usize;
    }

    if let Some(piece) = params.registry.mark_stored(key) {
        let _ = params.committer.send(piece);
    }
}

async fn serve_pending(
    state: &mut SessionState,
    writer: &mut MessageWriter,
    params: &SessionParams,
) -> Result<(), PeerError> {
    while let Some(key) = state.next_serve() {
        match read_chunk(params, key).await {
            Ok(data) => {
                writer
                    .send(&Message::Piece {
                        index: key.piece,
                        offset: key.offset,
                        data,
                    })
                    .await?;
                params.shared.add_uploaded(key.length as u64);
            }
            Err(err) => {
                tracing::warn!(chunk = %key, error = %err, "serve read failed");
            }
        }
    }
    Ok(())
}

async fn read_chunk(params: &SessionParams, key: ChunkKey) -> Result<Bytes, StorageError> {
    let spans = params.layout.chunk_spans(key.piece, key.offset, key.length)?;
    let mut out = BytesMut::with_capacity(key.length as usize);
    for span in spans {
        let part = params
            .directory
            .read(span.file, span.offset, span.length as u32)
            .await?;
        out.put_slice(&part);
    }
    Ok(out.freeze())
}
