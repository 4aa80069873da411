//! Per-peer downloader: interest state, block backlog, request bookkeeping
//! (design §4.6). Cross-peer coordination (redistribution on choke,
//! endgame cancellation) lives in `engine::Engine`, which is the only thing
//! that can see every peer's state at once; this module holds exactly what
//! one connection's request flow needs.
//!
//! Adapted from the teacher's `p2p::session::PeerSession` fields
//! (`choked_by_peer` analogue, per-peer bitfield, request tracking) and
//! `p2p::state::SessionState`, split out into its own per-peer record the
//! way the design's component table treats the downloader as a standalone
//! 15%-share piece rather than folded into one monolithic session actor.

use std::collections::HashSet;
use std::time::Duration;

use crate::bitfield::PieceBitfield;
use crate::block::BlockInfo;
use crate::rate::RateMeter;

#[derive(Debug)]
pub struct PeerDownloader {
    pub choked_by_peer: bool,
    pub we_are_interested: bool,
    pub have_bits: PieceBitfield,
    pub active_requests: HashSet<BlockInfo>,
    pub last_receive_time: f64,
    pub rate: RateMeter,
    /// The piece this peer was last told we're interested because of, so
    /// refill can re-evaluate interest without re-scanning from scratch.
    pub example_interest: Option<usize>,
}

impl PeerDownloader {
    pub fn new(num_pieces: usize, rate_window: Duration, now: f64) -> Self {
        Self {
            choked_by_peer: true,
            we_are_interested: false,
            have_bits: PieceBitfield::new(num_pieces),
            active_requests: HashSet::new(),
            last_receive_time: now,
            rate: RateMeter::new(rate_window),
            example_interest: None,
        }
    }

    pub fn got_have(&mut self, index: usize) {
        self.have_bits.set(index, true);
    }

    pub fn set_bitfield(&mut self, bf: PieceBitfield) {
        self.have_bits = bf;
    }

    pub fn got_unchoke(&mut self) {
        self.choked_by_peer = false;
    }

    /// Returns the requests that were in flight, to be released back to the
    /// store by the caller.
    pub fn got_choke(&mut self) -> Vec<BlockInfo> {
        self.choked_by_peer = true;
        self.active_requests.drain().collect()
    }

    pub fn record_piece_received(&mut self, block: &BlockInfo, now: f64) -> bool {
        self.last_receive_time = now;
        self.rate.update(block.length as u64, now);
        self.active_requests.remove(block)
    }

    pub fn is_snubbed(&self, now: f64, snub_time: Duration, seeding: bool) -> bool {
        !seeding && (now - self.last_receive_time) > snub_time.as_secs_f64()
    }

    pub fn register_request(&mut self, block: BlockInfo) {
        self.active_requests.insert(block);
    }
}
