//! Host-driven transfer engine: publish, fetch, cancel.
//!
//! The host feeds peer events, inbound messages and ticks; the engine answers through the
//! injected collaborators (transport, store, signer, notifier) and never does I/O itself.
//! All state is behind `&mut self`; a host shares the engine across tasks with one lock.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::bitfield::Bitfield;
use crate::choke::BandwidthAllocator;
use crate::config::EngineConfig;
use crate::content::{self, ContentHash, Piece, Prepared, Torrent};
use crate::error::TransferError;
use crate::fountain::{self, EncodedUnit, FountainDecoder};
use crate::host::{Notifier, Signer, Transport};
use crate::identity::PeerId;
use crate::protocol::{self, Message};
use crate::scheduler;
use crate::store::{PieceStore, StoreError};
use crate::swarm::SwarmState;

/// Everything the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub signer: Arc<dyn Signer>,
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn PieceStore>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    /// Waiting for a peer to supply the torrent.
    Resolving,
    FetchingPieces,
    Reconstructing,
    Complete,
    Cancelled,
    Failed,
}

impl DownloadPhase {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadPhase::Complete | DownloadPhase::Cancelled | DownloadPhase::Failed
        )
    }
}

/// Outcome of `fetch`. `Pending` completes later through the notifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    Complete(Vec<u8>),
    Pending,
}

/// Content we serve to others.
#[derive(Debug, Clone)]
pub struct UploadState {
    pub torrent: Torrent,
    pub uploaded_bytes: u64,
    pub served_peers: BTreeSet<PeerId>,
}

struct Fetching {
    torrent: Torrent,
    have: Bitfield,
    swarm: SwarmState,
    decoder: Option<FountainDecoder>,
    stalled_since: Option<u64>,
    units_requested_at: Option<u64>,
    storage_failures: u32,
}

struct Download {
    content_hash: ContentHash,
    phase: DownloadPhase,
    started_at: u64,
    last_progress_at: u64,
    metadata_requested_at: u64,
    fetching: Option<Fetching>,
}

pub struct Engine {
    config: EngineConfig,
    signer: Arc<dyn Signer>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn PieceStore>,
    notifier: Arc<dyn Notifier>,
    peers: BTreeSet<PeerId>,
    allocator: BandwidthAllocator,
    downloads: BTreeMap<ContentHash, Download>,
    uploads: BTreeMap<ContentHash, UploadState>,
    /// Requests from peers we choke, served when they are next unchoked.
    queued: HashMap<PeerId, VecDeque<(ContentHash, u32)>>,
    /// (content, peer) pairs whose announce we already answered.
    heard: HashSet<(ContentHash, PeerId)>,
    tick_count: u64,
    last_choke_at: Option<u64>,
    rng: StdRng,
}

impl Engine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            allocator: BandwidthAllocator::new(config.unchoke_slots, config.rate_decay),
            config,
            signer: collaborators.signer,
            transport: collaborators.transport,
            store: collaborators.store,
            notifier: collaborators.notifier,
            peers: BTreeSet::new(),
            downloads: BTreeMap::new(),
            uploads: BTreeMap::new(),
            queued: HashMap::new(),
            heard: HashSet::new(),
            tick_count: 0,
            last_choke_at: None,
            rng,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    // ----- publish / fetch / cancel -----

    /// Split, hash and persist `bytes`, then start seeding them.
    pub fn publish(
        &mut self,
        bytes: &[u8],
        metadata: BTreeMap<String, String>,
    ) -> Result<ContentHash, TransferError> {
        self.check_size(bytes.len() as u64)?;
        let prepared = content::prepare(bytes, self.config.piece_size, metadata);
        self.publish_prepared(prepared)
    }

    /// Publish content already run through `content::prepare` (hosts do that off-thread).
    pub fn publish_prepared(&mut self, prepared: Prepared) -> Result<ContentHash, TransferError> {
        let Prepared { torrent, pieces } = prepared;
        self.check_size(torrent.total_size)?;
        torrent.verify()?;
        let h = torrent.content_hash;
        if pieces.len() != torrent.piece_count as usize {
            return Err(TransferError::validation(format!(
                "{} pieces supplied for a torrent of {}",
                pieces.len(),
                torrent.piece_count
            )));
        }
        for piece in &pieces {
            let expected = torrent.piece_hashes.get(piece.index as usize);
            if piece.content_hash != h || !expected.is_some_and(|e| content::verify_piece(&piece.bytes, e)) {
                return Err(TransferError::Integrity {
                    content_hash: h,
                    piece: Some(piece.index),
                    reason: "piece does not match torrent".to_string(),
                });
            }
        }

        for piece in &pieces {
            self.put_with_retry(piece)
                .map_err(|e| TransferError::storage(h, Some(piece.index), e))?;
        }
        self.store
            .put_torrent(&torrent)
            .map_err(|e| TransferError::storage(h, None, e))?;

        info!(
            content = %h,
            size = torrent.total_size,
            pieces = torrent.piece_count,
            "Published content"
        );
        if let Some(mut dl) = self.downloads.remove(&h) {
            // Every piece is now in the store, so a running download completes on rescan.
            if let Err(e) = self.begin_fetching(&mut dl, torrent.clone()) {
                if dl.phase != DownloadPhase::Failed {
                    self.fail(&mut dl, e);
                }
            }
            self.settle(dl);
        }
        self.open_upload(torrent);
        if let Some(held) = self.held_bitfield(&h) {
            for peer in &self.peers {
                self.send_announce(peer, &h, &held);
            }
        }
        Ok(h)
    }

    /// Start downloading `content_hash`. `torrent` may be supplied by the caller; otherwise
    /// the store and then connected peers are asked for it.
    pub fn fetch(
        &mut self,
        content_hash: ContentHash,
        torrent: Option<Torrent>,
    ) -> Result<FetchStatus, TransferError> {
        let h = content_hash;
        if let Some(t) = &torrent {
            if t.content_hash != h {
                return Err(TransferError::validation("torrent is for different content"));
            }
            t.verify()?;
        }
        if self.downloads.contains_key(&h) {
            return Err(TransferError::validation(format!("{h} is already being fetched")));
        }
        if let Some(upload) = self.uploads.get(&h) {
            let torrent = upload.torrent.clone();
            debug!(content = %h, "Fetching locally seeded content");
            return self.reassemble(&torrent).map(FetchStatus::Complete);
        }
        let active = self
            .downloads
            .values()
            .filter(|d| !d.phase.is_terminal())
            .count();
        if active >= self.config.max_concurrent_downloads {
            return Err(TransferError::Resource {
                limit: self.config.max_concurrent_downloads,
            });
        }

        let torrent = match torrent {
            Some(t) => Some(t),
            None => self.stored_torrent(&h)?,
        };
        let now = self.tick_count;
        let mut dl = Download {
            content_hash: h,
            phase: DownloadPhase::Resolving,
            started_at: now,
            last_progress_at: now,
            metadata_requested_at: now,
            fetching: None,
        };
        match torrent {
            Some(t) => {
                if let Some(bytes) = self.begin_fetching(&mut dl, t)? {
                    return Ok(FetchStatus::Complete(bytes));
                }
            }
            None => {
                info!(content = %h, peers = self.peers.len(), "Resolving torrent from peers");
                self.broadcast(&Message::MetadataRequest { content_hash: h });
            }
        }
        self.downloads.insert(h, dl);
        Ok(FetchStatus::Pending)
    }

    /// Abort a download. Late responses for it are discarded.
    pub fn cancel(&mut self, content_hash: &ContentHash) -> Result<(), TransferError> {
        let h = *content_hash;
        let Some(mut dl) = self.downloads.remove(&h) else {
            return Err(TransferError::NotFound { content_hash: h });
        };
        dl.phase = DownloadPhase::Cancelled;
        if let Some(f) = dl.fetching.as_mut() {
            f.swarm.clear_in_flight();
        }
        self.heard.retain(|(c, _)| *c != h);
        self.broadcast(&Message::Cancel { content_hash: h });
        info!(content = %h, "Download cancelled");
        self.notifier
            .on_failed(&h, &TransferError::Cancelled { content_hash: h });
        Ok(())
    }

    /// Re-open uploads for every complete torrent in the store. Returns how many.
    pub fn resume_seeding(&mut self) -> Result<usize, StoreError> {
        let mut resumed = 0;
        for h in self.store.list_torrents()? {
            if self.uploads.contains_key(&h) || self.downloads.contains_key(&h) {
                continue;
            }
            let Some(torrent) = self.store.get_torrent(&h)? else {
                continue;
            };
            if let Err(e) = torrent.verify() {
                warn!(content = %h, error = %e, "Skipping stored torrent");
                continue;
            }
            let held = self.store.list_indices(&h)?;
            if held.len() != torrent.piece_count as usize {
                debug!(content = %h, held = held.len(), pieces = torrent.piece_count, "Stored content is partial");
                continue;
            }
            self.open_upload(torrent);
            resumed += 1;
        }
        if resumed > 0 {
            info!(count = resumed, "Resumed seeding");
        }
        Ok(resumed)
    }

    // ----- peer events -----

    pub fn on_peer_connected(&mut self, peer: PeerId) {
        if !self.peers.insert(peer) {
            return;
        }
        let optimistic = self.allocator.on_peer_connected(peer);
        debug!(peer = %peer, optimistic, "Peer connected");

        let mut resolving = Vec::new();
        for dl in self.downloads.values_mut() {
            match dl.fetching.as_mut() {
                Some(f) => f.swarm.on_peer_connected(peer),
                None => resolving.push(dl.content_hash),
            }
        }
        for h in resolving {
            self.transport
                .send(&peer, Message::MetadataRequest { content_hash: h });
        }
        for (h, bitfield) in self.held_bitfields() {
            self.send_announce(&peer, &h, &bitfield);
        }
    }

    pub fn on_peer_disconnected(&mut self, peer: &PeerId) {
        if !self.peers.remove(peer) {
            return;
        }
        self.allocator.on_peer_disconnected(peer);
        self.queued.remove(peer);
        self.heard.retain(|(_, p)| p != peer);
        for dl in self.downloads.values_mut() {
            if let Some(f) = dl.fetching.as_mut() {
                let freed = f.swarm.on_peer_disconnected(peer);
                if !freed.is_empty() {
                    debug!(content = %dl.content_hash, peer = %peer, freed = freed.len(), "Freed in-flight requests");
                }
            }
        }
        debug!(peer = %peer, "Peer disconnected");
    }

    /// Handle one inbound message. Messages from unconnected peers are dropped.
    pub fn on_message(&mut self, peer: PeerId, message: Message) {
        if !self.peers.contains(&peer) {
            debug!(peer = %peer, "Ignoring message from unconnected peer");
            return;
        }
        match message {
            Message::Announce {
                content_hash,
                bitfield,
                signature,
            } => self.handle_announce(peer, content_hash, bitfield, &signature),
            Message::PieceRequest {
                content_hash,
                piece_index,
            } => self.handle_piece_request(peer, content_hash, piece_index),
            Message::PieceData {
                content_hash,
                piece_index,
                payload,
                piece_hash,
            } => {
                let Some(mut dl) = self.downloads.remove(&content_hash) else {
                    debug!(content = %content_hash, piece = piece_index, "Discarding piece for inactive download");
                    return;
                };
                self.receive_piece(&mut dl, peer, piece_index, &payload, piece_hash);
                self.settle(dl);
            }
            Message::EncodedUnit {
                content_hash,
                degree,
                indices,
                xor_bytes,
            } => {
                let Some(mut dl) = self.downloads.remove(&content_hash) else {
                    debug!(content = %content_hash, "Discarding unit for inactive download");
                    return;
                };
                if degree as usize != indices.len() {
                    warn!(content = %content_hash, peer = %peer, "Dropping unit with inconsistent degree");
                } else {
                    self.receive_unit(&mut dl, peer, EncodedUnit { indices, xor_bytes });
                }
                self.settle(dl);
            }
            Message::MetadataRequest { content_hash } => {
                if let Some(torrent) = self.known_torrent(&content_hash) {
                    self.transport.send(&peer, Message::Metadata { torrent });
                }
            }
            Message::Metadata { torrent } => self.handle_metadata(peer, torrent),
            Message::UnitsRequest { content_hash } => self.handle_units_request(peer, content_hash),
            Message::Cancel { content_hash } => {
                if let Some(q) = self.queued.get_mut(&peer) {
                    q.retain(|(c, _)| *c != content_hash);
                }
                self.heard.remove(&(content_hash, peer));
            }
        }
    }

    /// Advance time by one tick: allocator cycle, timeouts, scheduling, fountain fallback.
    pub fn tick(&mut self) {
        self.tick_count += 1;
        let now = self.tick_count;
        let due = self
            .last_choke_at
            .map_or(true, |t| now.saturating_sub(t) >= self.config.choke_interval_ticks);
        if due {
            self.run_choke();
            self.last_choke_at = Some(now);
        }

        let hashes: Vec<ContentHash> = self.downloads.keys().copied().collect();
        for h in hashes {
            let Some(mut dl) = self.downloads.remove(&h) else {
                continue;
            };
            match dl.phase {
                DownloadPhase::Resolving => self.drive_resolving(&mut dl),
                DownloadPhase::FetchingPieces => self.drive_fetching(&mut dl),
                _ => {}
            }
            self.settle(dl);
        }
    }

    // ----- queries -----

    pub fn phase(&self, content_hash: &ContentHash) -> Option<DownloadPhase> {
        self.downloads.get(content_hash).map(|d| d.phase)
    }

    /// Fraction of pieces held, in [0, 1]. Seeded content reports 1.
    pub fn progress(&self, content_hash: &ContentHash) -> Option<f64> {
        if self.uploads.contains_key(content_hash) {
            return Some(1.0);
        }
        let dl = self.downloads.get(content_hash)?;
        Some(match &dl.fetching {
            Some(f) => f.have.count_ones() as f64 / f.torrent.piece_count as f64,
            None => 0.0,
        })
    }

    pub fn in_flight(&self, content_hash: &ContentHash) -> usize {
        self.fetching(content_hash)
            .map_or(0, |f| f.swarm.in_flight_len())
    }

    pub fn availability(&self, content_hash: &ContentHash, index: u32) -> usize {
        self.fetching(content_hash)
            .map_or(0, |f| f.swarm.availability(index, self.tick_count))
    }

    pub fn unreliability(&self, content_hash: &ContentHash, peer: &PeerId) -> u32 {
        self.fetching(content_hash)
            .map_or(0, |f| f.swarm.unreliability(peer))
    }

    pub fn is_seeding(&self, content_hash: &ContentHash) -> bool {
        self.uploads.contains_key(content_hash)
    }

    pub fn upload(&self, content_hash: &ContentHash) -> Option<&UploadState> {
        self.uploads.get(content_hash)
    }

    pub fn seeding(&self) -> impl Iterator<Item = &ContentHash> {
        self.uploads.keys()
    }

    pub fn is_unchoked(&self, peer: &PeerId) -> bool {
        self.allocator.is_unchoked(peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.iter()
    }

    // ----- message handlers -----

    fn handle_announce(
        &mut self,
        peer: PeerId,
        h: ContentHash,
        bitfield: Bitfield,
        signature: &[u8],
    ) {
        let signed = protocol::announce_bytes(&h, &bitfield);
        if !self.signer.verify(&signed, signature, &peer) {
            warn!(content = %h, peer = %peer, "Dropping announce with bad signature");
            return;
        }
        if !self.downloads.contains_key(&h) && !self.uploads.contains_key(&h) {
            return;
        }
        if let Some(f) = self
            .downloads
            .get_mut(&h)
            .and_then(|d| d.fetching.as_mut())
        {
            match f.swarm.on_peer_announced(peer, &bitfield) {
                Ok(()) => debug!(content = %h, peer = %peer, pieces = bitfield.count_ones(), "Peer announced"),
                Err(e) => warn!(content = %h, peer = %peer, error = %e, "Ignoring announce"),
            }
        }
        if self.heard.insert((h, peer)) {
            if let Some(ours) = self.held_bitfield(&h) {
                self.send_announce(&peer, &h, &ours);
            }
        }
    }

    fn handle_piece_request(&mut self, peer: PeerId, h: ContentHash, index: u32) {
        if !self.holds_piece(&h, index) {
            debug!(content = %h, piece = index, peer = %peer, "Request for a piece we do not hold");
            return;
        }
        if self.allocator.is_unchoked(&peer) {
            self.serve_piece(peer, h, index);
            return;
        }
        let limit = self.config.max_queued_requests;
        let q = self.queued.entry(peer).or_default();
        if q.len() < limit && !q.contains(&(h, index)) {
            q.push_back((h, index));
            debug!(content = %h, piece = index, peer = %peer, "Queued request from choked peer");
        }
    }

    fn handle_metadata(&mut self, peer: PeerId, torrent: Torrent) {
        let h = torrent.content_hash;
        let Some(mut dl) = self.downloads.remove(&h) else {
            return;
        };
        if dl.phase == DownloadPhase::Resolving {
            match torrent.verify() {
                Ok(()) => {
                    debug!(content = %h, peer = %peer, "Torrent resolved");
                    if let Err(e) = self.begin_fetching(&mut dl, torrent) {
                        if dl.phase != DownloadPhase::Failed {
                            self.fail(&mut dl, e);
                        }
                    }
                }
                Err(e) => warn!(content = %h, peer = %peer, error = %e, "Rejected torrent"),
            }
        }
        self.settle(dl);
    }

    fn handle_units_request(&mut self, peer: PeerId, h: ContentHash) {
        if !self.allocator.is_unchoked(&peer) {
            debug!(content = %h, peer = %peer, "Ignoring unit request from choked peer");
            return;
        }
        let Some(torrent) = self.known_torrent(&h) else {
            return;
        };
        let held: Vec<u32> = match self.fetching(&h) {
            Some(f) => f.have.iter_ones().collect(),
            None => match self.store.list_indices(&h) {
                Ok(held) => held,
                Err(e) => {
                    warn!(content = %h, error = %e, "Could not list pieces for encoding");
                    return;
                }
            },
        };
        let piece_size = torrent.piece_size as usize;
        let mut sent = 0u64;
        for _ in 0..self.config.fountain_batch {
            let indices = fountain::pick_indices(&held, self.config.fountain_max_degree, &mut self.rng);
            if indices.is_empty() {
                break;
            }
            let mut pieces = Vec::with_capacity(indices.len());
            for &i in &indices {
                match self.store.get(&h, i) {
                    Ok(Some(p)) => pieces.push(p.bytes),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(content = %h, piece = i, error = %e, "Could not load piece for encoding");
                        break;
                    }
                }
            }
            if pieces.len() != indices.len() {
                continue;
            }
            let refs: Vec<&[u8]> = pieces.iter().map(Vec::as_slice).collect();
            let unit = fountain::combine(indices, &refs, piece_size);
            sent += unit.xor_bytes.len() as u64;
            self.transport.send(
                &peer,
                Message::EncodedUnit {
                    content_hash: h,
                    degree: unit.degree() as u8,
                    indices: unit.indices,
                    xor_bytes: unit.xor_bytes,
                },
            );
        }
        if sent > 0 {
            self.allocator.record_uploaded(&peer, sent);
            debug!(content = %h, peer = %peer, bytes = sent, "Sent encoded units");
        }
    }

    // ----- download internals -----

    fn begin_fetching(
        &mut self,
        dl: &mut Download,
        torrent: Torrent,
    ) -> Result<Option<Vec<u8>>, TransferError> {
        let h = dl.content_hash;
        self.store
            .put_torrent(&torrent)
            .map_err(|e| TransferError::storage(h, None, e))?;
        let have = self.scan_held(&torrent)?;
        let mut swarm = SwarmState::new(torrent.piece_count);
        for peer in &self.peers {
            swarm.on_peer_connected(*peer);
        }
        info!(
            content = %h,
            held = have.count_ones(),
            pieces = torrent.piece_count,
            "Fetching pieces"
        );
        let complete = have.is_full();
        for peer in &self.peers {
            self.send_announce(peer, &h, &have);
        }
        dl.phase = DownloadPhase::FetchingPieces;
        dl.last_progress_at = self.tick_count;
        dl.fetching = Some(Fetching {
            torrent,
            have,
            swarm,
            decoder: None,
            stalled_since: None,
            units_requested_at: None,
            storage_failures: 0,
        });
        if complete {
            return self.finish(dl).map(Some);
        }
        Ok(None)
    }

    /// Verified pieces already in the store. Corrupt records are deleted.
    fn scan_held(&self, torrent: &Torrent) -> Result<Bitfield, TransferError> {
        let h = torrent.content_hash;
        let mut have = Bitfield::new(torrent.piece_count);
        let indices = self
            .store
            .list_indices(&h)
            .map_err(|e| TransferError::storage(h, None, e))?;
        for i in indices {
            let Some(expected) = torrent.piece_hashes.get(i as usize) else {
                continue;
            };
            match self.store.get(&h, i) {
                Ok(Some(p)) if content::verify_piece(&p.bytes, expected) => have.set(i),
                Ok(Some(_)) => {
                    warn!(content = %h, piece = i, "Dropping corrupt stored piece");
                    if let Err(e) = self.store.delete(&h, i) {
                        warn!(content = %h, piece = i, error = %e, "Could not delete corrupt piece");
                    }
                }
                Ok(None) => {}
                Err(e) => return Err(TransferError::storage(h, Some(i), e)),
            }
        }
        Ok(have)
    }

    fn receive_piece(
        &mut self,
        dl: &mut Download,
        peer: PeerId,
        index: u32,
        payload: &[u8],
        piece_hash: ContentHash,
    ) {
        let now = self.tick_count;
        let h = dl.content_hash;
        let cooldown = self.config.unreliable_cooldown_ticks;
        let Some(f) = dl.fetching.as_mut() else {
            return;
        };
        if index >= f.torrent.piece_count || f.have.get(index) {
            debug!(content = %h, piece = index, "Discarding duplicate piece");
            return;
        }
        if f.swarm.in_flight(index).map(|r| r.peer) != Some(peer) {
            debug!(content = %h, piece = index, peer = %peer, "Discarding unrequested piece");
            return;
        }
        let bytes = match self.signer.decrypt(payload, &peer) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(content = %h, piece = index, peer = %peer, error = %e, "Piece payload failed to decrypt");
                f.swarm.penalize(peer, index, now, cooldown);
                return;
            }
        };
        let expected = f.torrent.piece_hashes[index as usize];
        if piece_hash != expected || !content::verify_piece(&bytes, &expected) {
            warn!(content = %h, piece = index, peer = %peer, "Rejected piece failing verification");
            f.swarm.penalize(peer, index, now, cooldown);
            return;
        }
        f.swarm.mark_received(index);
        self.allocator.record_downloaded(&peer, bytes.len() as u64);
        self.accept_piece(dl, index, bytes);
    }

    fn receive_unit(&mut self, dl: &mut Download, peer: PeerId, unit: EncodedUnit) {
        let h = dl.content_hash;
        let Some(f) = dl.fetching.as_mut() else {
            return;
        };
        if f.units_requested_at.is_none() {
            debug!(content = %h, peer = %peer, "Discarding unrequested unit");
            return;
        }
        if f.decoder.is_none() {
            f.decoder = Some(self.new_decoder(&f.torrent, &f.have));
        }
        let Some(decoder) = f.decoder.as_mut() else {
            return;
        };
        if let Err(e) = decoder.add_unit(unit) {
            warn!(content = %h, peer = %peer, error = %e, "Dropping malformed unit");
            return;
        }
        self.accept_decoded(dl);
    }

    /// Persist a verified piece, then anything the decoder solved because of it.
    fn accept_piece(&mut self, dl: &mut Download, index: u32, bytes: Vec<u8>) {
        self.store_piece(dl, index, bytes);
        self.accept_decoded(dl);
    }

    /// Accept every piece the decoder holds that we do not, until no more progress is made.
    fn accept_decoded(&mut self, dl: &mut Download) {
        let h = dl.content_hash;
        loop {
            let Some(before) = dl.fetching.as_ref().map(|f| f.have.count_ones()) else {
                return;
            };
            let decoded = Self::take_decoded(dl);
            if decoded.is_empty() {
                return;
            }
            for (i, bytes) in decoded {
                if let Some(f) = dl.fetching.as_mut() {
                    f.swarm.clear_request(i);
                }
                debug!(content = %h, piece = i, "Recovered piece from encoded units");
                self.store_piece(dl, i, bytes);
                if dl.phase.is_terminal() {
                    return;
                }
            }
            if dl.fetching.as_ref().map(|f| f.have.count_ones()) == Some(before) {
                return;
            }
        }
    }

    /// Verified pieces the decoder has solved but the download does not hold yet.
    /// A decoded piece failing verification discards everything learned from units.
    fn take_decoded(dl: &mut Download) -> Vec<(u32, Vec<u8>)> {
        let h = dl.content_hash;
        let Some(f) = dl.fetching.as_mut() else {
            return Vec::new();
        };
        let Some(decoder) = f.decoder.as_mut() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for i in 0..f.torrent.piece_count {
            if f.have.get(i) {
                continue;
            }
            let Some(bytes) = decoder.piece(i) else {
                continue;
            };
            if content::verify_piece(bytes, &f.torrent.piece_hashes[i as usize]) {
                out.push((i, bytes.to_vec()));
            } else {
                warn!(content = %h, piece = i, "Decoded piece failed verification; discarding units");
                let known: BTreeSet<u32> = f.have.iter_ones().collect();
                decoder.reset_units(&known);
                break;
            }
        }
        out
    }

    fn store_piece(&mut self, dl: &mut Download, index: u32, bytes: Vec<u8>) {
        let h = dl.content_hash;
        let Some(f) = dl.fetching.as_mut() else {
            return;
        };
        if f.have.get(index) {
            return;
        }
        let piece = Piece::new(h, index, bytes);
        if let Err(e) = self.store.put(&piece) {
            f.storage_failures += 1;
            warn!(content = %h, piece = index, failures = f.storage_failures, error = %e, "Failed to persist piece");
            if f.storage_failures > self.config.max_storage_failures {
                self.fail(dl, TransferError::storage(h, Some(index), e));
            }
            return;
        }
        f.have.set(index);
        if let Some(decoder) = f.decoder.as_mut() {
            decoder.add_known(index, &piece.bytes);
        }
        f.stalled_since = None;
        let fraction = f.have.count_ones() as f64 / f.torrent.piece_count as f64;
        let have = f.have.clone();
        dl.last_progress_at = self.tick_count;
        debug!(content = %h, piece = index, progress = fraction, "Stored piece");
        self.notifier.on_progress(&h, fraction);
        for peer in &self.peers {
            self.send_announce(peer, &h, &have);
        }
        if have.is_full() {
            if let Err(e) = self.finish(dl) {
                debug!(content = %h, error = %e, "Completed download did not verify");
            }
        }
    }

    /// Reassemble, verify and hand the content to the notifier; the download becomes seeding.
    fn finish(&mut self, dl: &mut Download) -> Result<Vec<u8>, TransferError> {
        let h = dl.content_hash;
        let Some(torrent) = dl.fetching.as_ref().map(|f| f.torrent.clone()) else {
            return Err(TransferError::validation("download has no torrent"));
        };
        dl.phase = DownloadPhase::Reconstructing;
        match self.reassemble(&torrent) {
            Ok(bytes) => {
                dl.phase = DownloadPhase::Complete;
                info!(content = %h, size = bytes.len(), "Download complete");
                self.notifier.on_complete(&h, &bytes);
                self.open_upload(torrent);
                Ok(bytes)
            }
            Err(e) => {
                if matches!(e, TransferError::Integrity { .. }) {
                    self.purge(&torrent);
                }
                self.fail(dl, e.clone());
                Err(e)
            }
        }
    }

    /// Forget a torrent and its pieces after the assembled content failed verification,
    /// so a later fetch resolves the torrent again instead of trusting the stored one.
    fn purge(&self, torrent: &Torrent) {
        let h = torrent.content_hash;
        warn!(content = %h, "Discarding torrent and pieces that failed final verification");
        if let Err(e) = self.store.delete_torrent(&h) {
            warn!(content = %h, error = %e, "Could not delete torrent");
        }
        let indices = match self.store.list_indices(&h) {
            Ok(indices) => indices,
            Err(e) => {
                warn!(content = %h, error = %e, "Could not list pieces to delete");
                return;
            }
        };
        for i in indices {
            if let Err(e) = self.store.delete(&h, i) {
                warn!(content = %h, piece = i, error = %e, "Could not delete piece");
            }
        }
    }

    /// Read every piece back in index order and check the Merkle root and content hash.
    fn reassemble(&self, torrent: &Torrent) -> Result<Vec<u8>, TransferError> {
        let h = torrent.content_hash;
        let integrity = |piece: Option<u32>, reason: &str| TransferError::Integrity {
            content_hash: h,
            piece,
            reason: reason.to_string(),
        };
        let mut out = Vec::with_capacity(torrent.total_size as usize);
        let mut hashes = Vec::with_capacity(torrent.piece_count as usize);
        for i in 0..torrent.piece_count {
            let piece = self
                .store
                .get(&h, i)
                .map_err(|e| TransferError::storage(h, Some(i), e))?
                .ok_or_else(|| integrity(Some(i), "piece missing from store"))?;
            if piece.bytes.len() != torrent.piece_len(i) {
                return Err(integrity(Some(i), "stored piece has wrong length"));
            }
            hashes.push(content::hash(&piece.bytes));
            out.extend_from_slice(&piece.bytes);
        }
        if content::build_merkle(&hashes).root() != torrent.merkle_root {
            return Err(integrity(None, "merkle root mismatch"));
        }
        if content::hash(&out) != h {
            return Err(integrity(None, "content hash mismatch"));
        }
        Ok(out)
    }

    fn fail(&mut self, dl: &mut Download, error: TransferError) {
        let h = dl.content_hash;
        dl.phase = DownloadPhase::Failed;
        if let Some(f) = dl.fetching.as_mut() {
            f.swarm.clear_in_flight();
        }
        self.heard.retain(|(c, _)| *c != h);
        self.broadcast(&Message::Cancel { content_hash: h });
        warn!(content = %h, error = %error, "Download failed");
        self.notifier.on_failed(&h, &error);
    }

    fn drive_resolving(&mut self, dl: &mut Download) {
        let now = self.tick_count;
        let h = dl.content_hash;
        if now.saturating_sub(dl.started_at) >= self.config.metadata_timeout_ticks {
            self.fail(dl, TransferError::NotFound { content_hash: h });
            return;
        }
        if now.saturating_sub(dl.metadata_requested_at) >= self.config.metadata_retry_ticks {
            dl.metadata_requested_at = now;
            self.broadcast(&Message::MetadataRequest { content_hash: h });
        }
    }

    fn drive_fetching(&mut self, dl: &mut Download) {
        let now = self.tick_count;
        let h = dl.content_hash;
        // Decoded pieces whose write failed earlier are retried here.
        self.accept_decoded(dl);
        if dl.phase.is_terminal() {
            return;
        }
        if now.saturating_sub(dl.last_progress_at) >= self.config.download_timeout_ticks {
            self.fail(
                dl,
                TransferError::Timeout {
                    content_hash: h,
                    piece: None,
                },
            );
            return;
        }
        let Some(f) = dl.fetching.as_mut() else {
            return;
        };
        for (index, peer) in f.swarm.expire(now, self.config.request_timeout_ticks) {
            warn!(content = %h, piece = index, peer = %peer, "Piece request timed out");
        }

        let slots = self
            .config
            .max_in_flight
            .saturating_sub(f.swarm.in_flight_len());
        let allocator = &self.allocator;
        let picks = scheduler::select_requests(
            &f.swarm,
            &f.have,
            slots,
            now,
            &|p: &PeerId| allocator.is_unchoked(p),
            &mut self.rng,
        );
        for &(index, peer) in &picks {
            if f.swarm.mark_requested(index, peer, now) {
                self.transport.send(
                    &peer,
                    Message::PieceRequest {
                        content_hash: h,
                        piece_index: index,
                    },
                );
            }
        }
        if !picks.is_empty() {
            debug!(content = %h, requests = picks.len(), in_flight = f.swarm.in_flight_len(), "Scheduled requests");
        }

        if !picks.is_empty() || f.swarm.in_flight_len() > 0 || f.have.is_full() {
            f.stalled_since = None;
            return;
        }
        let stall = self.config.stall_ticks_before_fountain;
        let since = *f.stalled_since.get_or_insert(now);
        let ask_again = f
            .units_requested_at
            .map_or(true, |t| now.saturating_sub(t) >= stall);
        if now.saturating_sub(since) < stall || !ask_again || self.peers.is_empty() {
            return;
        }
        f.units_requested_at = Some(now);
        if f.decoder.is_none() {
            f.decoder = Some(self.new_decoder(&f.torrent, &f.have));
        }
        info!(
            content = %h,
            missing = f.torrent.piece_count - f.have.count_ones(),
            "Direct exchange stalled; requesting encoded units"
        );
        for peer in &self.peers {
            self.transport
                .send(peer, Message::UnitsRequest { content_hash: h });
        }
    }

    fn new_decoder(&self, torrent: &Torrent, have: &Bitfield) -> FountainDecoder {
        let lens = (0..torrent.piece_count).map(|i| torrent.piece_len(i)).collect();
        let mut decoder = FountainDecoder::new(torrent.piece_size as usize, lens);
        for i in have.iter_ones() {
            if let Ok(Some(p)) = self.store.get(&torrent.content_hash, i) {
                decoder.add_known(i, &p.bytes);
            }
        }
        decoder
    }

    fn settle(&mut self, dl: Download) {
        if !dl.phase.is_terminal() {
            self.downloads.insert(dl.content_hash, dl);
        }
    }

    // ----- upload internals -----

    fn run_choke(&mut self) {
        let decision = self.allocator.recompute(&mut self.rng);
        debug!(
            regular = decision.regular.len(),
            optimistic = ?decision.optimistic,
            "Recomputed unchoke set"
        );
        for peer in decision.newly_unchoked {
            if let Some(q) = self.queued.remove(&peer) {
                for (h, index) in q {
                    if self.holds_piece(&h, index) {
                        self.serve_piece(peer, h, index);
                    }
                }
            }
        }
    }

    fn serve_piece(&mut self, peer: PeerId, h: ContentHash, index: u32) {
        let piece = match self.store.get(&h, index) {
            Ok(Some(p)) => p,
            Ok(None) => {
                debug!(content = %h, piece = index, "Requested piece missing from store");
                return;
            }
            Err(e) => {
                warn!(content = %h, piece = index, error = %e, "Could not load requested piece");
                return;
            }
        };
        let payload = match self.signer.encrypt(&piece.bytes, &peer) {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Could not encrypt piece");
                return;
            }
        };
        let len = piece.bytes.len() as u64;
        self.transport.send(
            &peer,
            Message::PieceData {
                content_hash: h,
                piece_index: index,
                payload,
                piece_hash: piece.hash,
            },
        );
        self.allocator.record_uploaded(&peer, len);
        if let Some(upload) = self.uploads.get_mut(&h) {
            upload.uploaded_bytes += len;
            upload.served_peers.insert(peer);
        }
    }

    fn open_upload(&mut self, torrent: Torrent) {
        self.uploads
            .entry(torrent.content_hash)
            .or_insert_with(|| UploadState {
                torrent,
                uploaded_bytes: 0,
                served_peers: BTreeSet::new(),
            });
    }

    fn holds_piece(&self, h: &ContentHash, index: u32) -> bool {
        if let Some(upload) = self.uploads.get(h) {
            return index < upload.torrent.piece_count;
        }
        self.fetching(h).is_some_and(|f| f.have.get(index))
    }

    fn put_with_retry(&self, piece: &Piece) -> Result<(), StoreError> {
        let mut attempt = 0;
        loop {
            match self.store.put(piece) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.max_storage_failures => {
                    attempt += 1;
                    warn!(content = %piece.content_hash, piece = piece.index, attempt, error = %e, "Retrying piece write");
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ----- helpers -----

    fn check_size(&self, len: u64) -> Result<(), TransferError> {
        if len == 0 {
            return Err(TransferError::validation("content is empty"));
        }
        if len > self.config.max_content_size {
            return Err(TransferError::validation(format!(
                "content is {len} bytes, limit is {}",
                self.config.max_content_size
            )));
        }
        Ok(())
    }

    fn stored_torrent(&self, h: &ContentHash) -> Result<Option<Torrent>, TransferError> {
        let stored = self
            .store
            .get_torrent(h)
            .map_err(|e| TransferError::storage(*h, None, e))?;
        Ok(stored.filter(|t| match t.verify() {
            Ok(()) => true,
            Err(e) => {
                warn!(content = %h, error = %e, "Ignoring stored torrent");
                false
            }
        }))
    }

    fn fetching(&self, h: &ContentHash) -> Option<&Fetching> {
        self.downloads.get(h).and_then(|d| d.fetching.as_ref())
    }

    fn known_torrent(&self, h: &ContentHash) -> Option<Torrent> {
        self.uploads
            .get(h)
            .map(|u| u.torrent.clone())
            .or_else(|| self.fetching(h).map(|f| f.torrent.clone()))
    }

    /// Pieces we can serve for `h`, if we take part in its swarm at all.
    fn held_bitfield(&self, h: &ContentHash) -> Option<Bitfield> {
        if let Some(upload) = self.uploads.get(h) {
            return match self.store.list_indices(h) {
                Ok(held) => Some(Bitfield::from_indices(upload.torrent.piece_count, held)),
                Err(e) => {
                    warn!(content = %h, error = %e, "Could not list seeded pieces");
                    None
                }
            };
        }
        self.fetching(h).map(|f| f.have.clone())
    }

    fn held_bitfields(&self) -> Vec<(ContentHash, Bitfield)> {
        self.uploads
            .keys()
            .chain(self.downloads.keys())
            .filter_map(|h| self.held_bitfield(h).map(|b| (*h, b)))
            .collect()
    }

    fn send_announce(&self, peer: &PeerId, h: &ContentHash, bitfield: &Bitfield) {
        let signed = protocol::announce_bytes(h, bitfield);
        match self.signer.sign(&signed, peer) {
            Ok(signature) => self.transport.send(
                peer,
                Message::Announce {
                    content_hash: *h,
                    bitfield: bitfield.clone(),
                    signature,
                },
            ),
            Err(e) => warn!(peer = %peer, error = %e, "Could not sign announce"),
        }
    }

    fn broadcast(&self, message: &Message) {
        for peer in &self.peers {
            self.transport.send(peer, message.clone());
        }
    }
}
