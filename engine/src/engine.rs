//! Engine glue: binds the storage wrapper, picker, choker and per-peer
//! downloader/uploader into one owner, and drives peer-connection lifecycle
//! (design §4.10, §5, §6).
//!
//! Adapted from the teacher's `torrent::Torrent`/`TorrentContext` split, but
//! collapsed into a single owner instead of an `Arc<TorrentContext>` shared
//! across per-peer tokio tasks behind `RwLock`s: the design requires "no
//! locks ... in the core", so here `Engine` holds every piece of core state
//! directly and peer tasks are reduced to byte-pumps that forward already
//! decoded `Message`s in and `OutEvent`s out over channels, the way the
//! teacher's `torrent_tx`/`peer_tx` channels already separate "what a peer
//! task asks of the torrent" from "what the torrent owns". `Engine` itself
//! does not touch the network; transport is a collaborator exactly like the
//! design's §6 says, and the embedder (a thin tokio task per connection)
//! performs the actual IO that `OutEvent`s describe.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;

use crate::bitfield::PieceBitfield;
use crate::block::{BlockData, BlockInfo};
use crate::choker::{Choker, PeerChokeInfo};
use crate::config::EngineConfig;
use crate::downloader::PeerDownloader;
use crate::picker::PiecePicker;
use crate::rate::RateMeter;
use crate::reactor::Scheduler;
use crate::store::{PieceOutcome, PieceStore};
use crate::uploader::PeerUploader;
use crate::wire::Message;

/// Opaque, never-reused connection identity. The design notes suggest
/// backing the peer set with a generational slab index; monotonically
/// increasing ids achieve the same "a stale handle can never alias a new
/// connection" property without needing slot reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    #[cfg(test)]
    pub fn for_test(n: u64) -> Self {
        PeerId(n)
    }
}

/// Side effects the embedder must carry out: sends over the transport,
/// connection teardown, or a torrent-fatal failure to surface.
#[derive(Debug, Clone, PartialEq)]
pub enum OutEvent {
    Send(PeerId, Message),
    Broadcast(Message),
    Disconnect(PeerId),
    Finished,
    Failed(String),
}

struct PeerConn {
    downloader: PeerDownloader,
    uploader: PeerUploader,
}

pub struct Engine {
    config: EngineConfig,
    store: PieceStore,
    picker: PiecePicker,
    choker: Choker,
    peers: HashMap<PeerId, PeerConn>,
    next_id: u64,
    upload_meter: RateMeter,
    rate_capped: bool,
    scheduler: Arc<dyn Scheduler>,
}

/// A handle callers clone to talk to an `Engine` running on another task.
/// Kept intentionally thin; the design's "no locks in the core" is about
/// `Engine`'s own state, not about how an embedder schedules access to it.
pub type EngineHandle = Arc<tokio::sync::Mutex<Engine>>;

impl Engine {
    pub fn new(store: PieceStore, num_pieces: usize, config: EngineConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        let picker = PiecePicker::new(num_pieces);
        let choker = Choker::new(config.clone());
        Self {
            config,
            store,
            picker,
            choker,
            peers: HashMap::new(),
            next_id: 0,
            upload_meter: RateMeter::default(),
            rate_capped: false,
            scheduler,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.store.have().len()
    }

    pub fn have(&self) -> &PieceBitfield {
        self.store.have()
    }

    fn seeding(&self) -> bool {
        self.picker.am_i_complete()
    }

    pub fn connection_made(&mut self) -> PeerId {
        let id = PeerId(self.next_id);
        self.next_id += 1;
        let now = self.scheduler.now();
        self.peers.insert(
            id,
            PeerConn {
                downloader: PeerDownloader::new(self.num_pieces(), self.config.rate_window, now),
                uploader: PeerUploader::new(self.config.rate_window),
            },
        );
        let mut rng = rand::thread_rng();
        self.choker.connection_made(id, None, &mut rng);
        id
    }

    pub fn connection_lost(&mut self, id: PeerId) -> Vec<OutEvent> {
        let Some(conn) = self.peers.remove(&id) else { return Vec::new() };
        for block in conn.downloader.active_requests {
            self.store.request_lost(block);
        }
        for piece in conn.downloader.have_bits.iter_ones() {
            self.picker.lost_have(piece);
        }
        let choke_view = self.choke_view();
        let decisions = self.choker.connection_lost(id, &choke_view);
        let mut events = Vec::new();
        self.apply_choke_decisions(decisions, &mut events);
        events
    }

    fn choke_view(&self) -> HashMap<PeerId, PeerChokeInfo> {
        self.peers
            .iter()
            .map(|(id, c)| {
                (
                    *id,
                    PeerChokeInfo {
                        interested: c.uploader.peer_interested,
                        choked: c.uploader.choked,
                        snubbed: c.downloader.is_snubbed(self.scheduler.now(), self.config.snub_time, self.seeding()),
                        rate: if self.seeding() { c.uploader.get_rate() } else { c.downloader.rate.rate() },
                    },
                )
            })
            .collect()
    }

    fn apply_choke_decisions(&mut self, decisions: Vec<(PeerId, bool)>, events: &mut Vec<OutEvent>) {
        for (id, new_choked) in decisions {
            if let Some(conn) = self.peers.get_mut(&id) {
                conn.uploader.set_choked(new_choked);
                let msg = if new_choked { Message::Choke } else { Message::Unchoke };
                events.push(OutEvent::Send(id, msg));
            }
        }
    }

    /// Periodic choker tick (design: every 10s).
    pub fn choke_tick(&mut self) -> Vec<OutEvent> {
        let view = self.choke_view();
        let decisions = self.choker.tick(&view);
        let mut events = Vec::new();
        self.apply_choke_decisions(decisions, &mut events);
        events
    }

    fn set_interest(&mut self, id: PeerId, should: bool, events: &mut Vec<OutEvent>) {
        let Some(conn) = self.peers.get_mut(&id) else { return };
        if should && !conn.downloader.we_are_interested {
            conn.downloader.we_are_interested = true;
            events.push(OutEvent::Send(id, Message::Interested));
        } else if !should && conn.downloader.we_are_interested {
            conn.downloader.we_are_interested = false;
            events.push(OutEvent::Send(id, Message::NotInterested));
        }
    }

    fn all_active_requests(&self) -> HashSet<BlockInfo> {
        self.peers.values().flat_map(|c| c.downloader.active_requests.iter().copied()).collect()
    }

    /// `_request_more` (design §4.6): top up one peer's backlog.
    fn refill_one(&mut self, id: PeerId, now: f64) -> Vec<OutEvent> {
        let mut events = Vec::new();
        if !self.peers.contains_key(&id) {
            return events;
        }
        let seeding = self.seeding();
        let peer_choked = self.peers[&id].downloader.choked_by_peer;

        if self.store.endgame() {
            let endgame_events = self.endgame_fixer(id, now);
            events.extend(endgame_events);
            return events;
        }

        if peer_choked {
            let wants_anything = {
                let store = &self.store;
                let peer = &self.peers[&id].downloader;
                self.picker.next(|p| peer.have_bits.get(p) && store.has_outstanding_blocks(p), seeding).is_some()
            };
            self.set_interest(id, wants_anything, &mut events);
            return events;
        }

        loop {
            let active_len = self.peers[&id].downloader.active_requests.len();
            if active_len >= self.config.backlog {
                break;
            }
            let piece = {
                let store = &self.store;
                let peer = &self.peers[&id].downloader;
                self.picker.next(|p| peer.have_bits.get(p) && store.has_outstanding_blocks(p), seeding)
            };
            let Some(piece) = piece else { break };
            let Some(block) = self.store.new_request(piece) else { break };
            self.picker.requested(piece, seeding);
            let conn = self.peers.get_mut(&id).unwrap();
            conn.downloader.register_request(block);
            events.push(OutEvent::Send(id, Message::Request(block)));
        }

        let active_len = self.peers[&id].downloader.active_requests.len();
        self.set_interest(id, active_len > 0, &mut events);
        events
    }

    /// Endgame fixer (design §4.6).
    fn endgame_fixer(&mut self, id: PeerId, _now: f64) -> Vec<OutEvent> {
        let mut events = Vec::new();
        let all = self.all_active_requests();
        let (mut want, we_interested, active_empty, choked): (Vec<BlockInfo>, bool, bool, bool) = {
            let peer = &self.peers[&id].downloader;
            let want = all
                .into_iter()
                .filter(|r| peer.have_bits.get(r.piece_idx) && !peer.active_requests.contains(r))
                .collect();
            (want, peer.we_are_interested, peer.active_requests.is_empty(), peer.choked_by_peer)
        };

        if we_interested && active_empty && want.is_empty() {
            self.set_interest(id, false, &mut events);
        } else if !we_interested && !want.is_empty() {
            self.set_interest(id, true, &mut events);
        }

        if !choked {
            let mut rng = rand::thread_rng();
            want.shuffle(&mut rng);
            let remaining = self.config.backlog.saturating_sub(self.peers[&id].downloader.active_requests.len());
            for block in want.into_iter().take(remaining) {
                let conn = self.peers.get_mut(&id).unwrap();
                conn.downloader.register_request(block);
                events.push(OutEvent::Send(id, Message::Request(block)));
            }
        }
        events
    }

    /// Dispatches an already-decoded wire message from peer `id`.
    pub fn got_message(&mut self, id: PeerId, msg: Message, now: f64) -> Vec<OutEvent> {
        let mut events = Vec::new();
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                let Some(conn) = self.peers.get_mut(&id) else { return events };
                let released = conn.downloader.got_choke();
                for block in released {
                    self.store.request_lost(block);
                }
                // Redistribution: give every currently-unchoked peer a chance
                // to pick up the freed work, shuffled for fairness.
                let mut unchoked: Vec<PeerId> = self
                    .peers
                    .iter()
                    .filter(|(_, c)| !c.downloader.choked_by_peer)
                    .map(|(pid, _)| *pid)
                    .collect();
                unchoked.shuffle(&mut rand::thread_rng());
                for pid in unchoked {
                    events.extend(self.refill_one(pid, now));
                }
            }
            Message::Unchoke => {
                if let Some(conn) = self.peers.get_mut(&id) {
                    conn.downloader.got_unchoke();
                }
                events.extend(self.refill_one(id, now));
            }
            Message::Interested => {
                if let Some(conn) = self.peers.get_mut(&id) {
                    conn.uploader.peer_interested = true;
                }
                let view = self.choke_view();
                let decisions = self.choker.interest_changed(id, &view);
                self.apply_choke_decisions(decisions, &mut events);
            }
            Message::NotInterested => {
                if let Some(conn) = self.peers.get_mut(&id) {
                    conn.uploader.peer_interested = false;
                }
                let view = self.choke_view();
                let decisions = self.choker.interest_changed(id, &view);
                self.apply_choke_decisions(decisions, &mut events);
            }
            Message::Have { index } => {
                let index = index as usize;
                if let Some(conn) = self.peers.get_mut(&id) {
                    conn.downloader.got_have(index);
                }
                self.picker.got_have(index);
                events.extend(self.refill_one(id, now));
            }
            Message::Bitfield(bf) => {
                for i in bf.iter_ones() {
                    self.picker.got_have(i);
                }
                if let Some(conn) = self.peers.get_mut(&id) {
                    conn.downloader.set_bitfield(bf);
                }
                events.extend(self.refill_one(id, now));
            }
            Message::Request(block) => {
                if let Some(conn) = self.peers.get_mut(&id) {
                    conn.uploader.got_request(block);
                }
            }
            Message::Cancel(block) => {
                if let Some(conn) = self.peers.get_mut(&id) {
                    conn.uploader.got_cancel(&block);
                }
            }
            Message::Piece(data) => {
                events.extend(self.handle_piece(id, data, now));
            }
        }
        events
    }

    fn handle_piece(&mut self, id: PeerId, data: BlockData, now: f64) -> Vec<OutEvent> {
        let mut events = Vec::new();
        let block = BlockInfo { piece_idx: data.piece_idx, begin: data.begin, length: data.data.len() };

        let had_request = match self.peers.get_mut(&id) {
            Some(conn) => conn.downloader.record_piece_received(&block, now),
            None => return events,
        };
        if !had_request {
            // Late/cancelled arrival: advisory only, ignore.
            return events;
        }

        let piece = block.piece_idx;
        match self.store.piece_came_in(&block, &data.data) {
            Ok(PieceOutcome::Pending) => {}
            Ok(PieceOutcome::Completed) => {
                self.picker.complete(piece);
                events.push(OutEvent::Broadcast(Message::Have { index: piece as u32 }));
                if self.store.amount_left() == 0 {
                    events.push(OutEvent::Finished);
                }
            }
            Ok(PieceOutcome::Failed) => {
                self.picker.bump(piece);
                let mut unchoked: Vec<PeerId> = self
                    .peers
                    .iter()
                    .filter(|(_, c)| !c.downloader.choked_by_peer)
                    .map(|(pid, _)| *pid)
                    .collect();
                unchoked.shuffle(&mut rand::thread_rng());
                for pid in unchoked {
                    events.extend(self.refill_one(pid, now));
                }
            }
            Err(e) => {
                events.push(OutEvent::Failed(e.to_string()));
                return events;
            }
        }

        if self.store.endgame() {
            let others: Vec<PeerId> = self
                .peers
                .iter()
                .filter(|(pid, c)| **pid != id && c.downloader.active_requests.contains(&block))
                .map(|(pid, _)| *pid)
                .collect();
            for pid in others {
                if let Some(conn) = self.peers.get_mut(&pid) {
                    conn.downloader.active_requests.remove(&block);
                }
                events.push(OutEvent::Send(pid, Message::Cancel(block)));
                events.extend(self.refill_one(pid, now));
            }
        }

        events.extend(self.refill_one(id, now));
        events
    }

    /// Called by the embedder when peer `id`'s socket has drained (design
    /// §4.7, §4.10): consults the global rate cap before serving.
    pub fn connection_flushed(&mut self, id: PeerId, now: f64) -> Option<OutEvent> {
        let conn = self.peers.get_mut(&id)?;
        let block_info = conn.uploader.flushed(self.rate_capped, now)?;
        self.record_upload(block_info.length as u64, now);
        Some(OutEvent::Send(id, Message::Piece(BlockData {
            piece_idx: block_info.piece_idx,
            begin: block_info.begin,
            data: Vec::new(), // payload is filled in by the embedder's disk read
        })))
    }

    fn record_upload(&mut self, bytes: u64, now: f64) {
        self.upload_meter.update(bytes, now);
        if let Some(max) = self.config.max_upload_rate {
            if self.upload_meter.rate() > max {
                self.rate_capped = true;
            }
        }
    }

    /// Fires once the scheduled `_uncap` timer elapses.
    pub fn uncap(&mut self, now: f64) -> Vec<OutEvent> {
        self.rate_capped = false;
        let mut events = Vec::new();
        let mut candidates: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, c)| !c.uploader.is_choked() && c.uploader.has_queries())
            .map(|(id, _)| *id)
            .collect();
        candidates.sort_by(|a, b| {
            self.peers[a].uploader.get_rate().partial_cmp(&self.peers[b].uploader.get_rate()).unwrap_or(std::cmp::Ordering::Equal)
        });
        for id in candidates {
            if self.rate_capped {
                break;
            }
            if let Some(event) = self.connection_flushed(id, now) {
                events.push(event);
            }
        }
        events
    }

    pub fn is_rate_capped(&self) -> bool {
        self.rate_capped
    }

    pub fn time_until_uncap(&self, now: f64) -> Option<Duration> {
        let max = self.config.max_upload_rate?;
        Some(Duration::from_secs_f64(self.upload_meter.time_until(max, now).max(0.0)))
    }

    /// Design §6: adjusts the preferred-slot count the choker ranks by rate
    /// and rechokes immediately so the new limit takes effect without
    /// waiting for the next tick.
    pub fn change_max_uploads(&mut self, n: usize) -> Vec<OutEvent> {
        self.config.max_uploads = n;
        self.choker.set_config(self.config.clone());
        self.choke_tick()
    }

    /// Design §6 / §4.10: adjusts the global upload cap; clears
    /// `rate_capped` immediately if the new limit (or its removal) means the
    /// current rate no longer exceeds it.
    pub fn change_max_upload_rate(&mut self, bps: Option<f64>) {
        self.config.max_upload_rate = bps;
        if let Some(max) = bps {
            if self.upload_meter.rate() <= max {
                self.rate_capped = false;
            }
        } else {
            self.rate_capped = false;
        }
    }

    pub fn how_many_connections(&self) -> usize {
        self.peers.len()
    }
}
