//! Per-peer uploader: request queue, choke state, send path (design §4.7).
//!
//! Adapted from the teacher's `fs::mod::CommandToDisk::ReadBlock` dispatch
//! (which serves a single queued read per request with no choke/backlog
//! concept at all) generalized into a real FIFO with choke gating and the
//! rate-cap consultation the design requires of `flushed()`.

use std::collections::VecDeque;
use std::time::Duration;

use crate::block::BlockInfo;
use crate::rate::RateMeter;

#[derive(Debug)]
pub struct PeerUploader {
    pub peer_interested: bool,
    pub choked: bool,
    queue: VecDeque<BlockInfo>,
    pub rate: RateMeter,
}

impl PeerUploader {
    pub fn new(rate_window: Duration) -> Self {
        Self {
            peer_interested: false,
            choked: true,
            queue: VecDeque::new(),
            rate: RateMeter::new(rate_window),
        }
    }

    /// Enqueues a REQUEST unless we're currently choking this peer.
    pub fn got_request(&mut self, block: BlockInfo) {
        if !self.choked {
            self.queue.push_back(block);
        }
    }

    pub fn got_cancel(&mut self, block: &BlockInfo) {
        self.queue.retain(|b| b != block);
    }

    pub fn has_queries(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn is_interested(&self) -> bool {
        self.peer_interested
    }

    pub fn get_rate(&self) -> f64 {
        self.rate.rate()
    }

    /// Sets our choke state toward this peer; choking drops the queue (a
    /// choked peer's pending requests are no longer honoured).
    pub fn set_choked(&mut self, choked: bool) {
        self.choked = choked;
        if choked {
            self.queue.clear();
        }
    }

    /// Called when the socket has drained. Serves the next queued block
    /// unless we're choking the peer or the engine's global upload cap is
    /// currently tripped.
    pub fn flushed(&mut self, rate_capped: bool, now: f64) -> Option<BlockInfo> {
        if self.choked || rate_capped {
            return None;
        }
        let block = self.queue.pop_front()?;
        self.rate.update(block.length as u64, now);
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(n: usize) -> BlockInfo {
        BlockInfo { piece_idx: 0, begin: n * 10, length: 10 }
    }

    #[test]
    fn choking_drops_the_queue_and_rejects_new_requests() {
        let mut u = PeerUploader::new(Duration::from_secs(20));
        u.set_choked(false);
        u.got_request(block(0));
        assert!(u.has_queries());
        u.set_choked(true);
        assert!(!u.has_queries());
        u.got_request(block(1));
        assert!(!u.has_queries());
    }

    #[test]
    fn cancel_removes_a_specific_queued_block() {
        let mut u = PeerUploader::new(Duration::from_secs(20));
        u.set_choked(false);
        u.got_request(block(0));
        u.got_request(block(1));
        u.got_cancel(&block(0));
        assert_eq!(u.flushed(false, 0.0), Some(block(1)));
    }

    #[test]
    fn rate_capped_engine_suppresses_flush() {
        let mut u = PeerUploader::new(Duration::from_secs(20));
        u.set_choked(false);
        u.got_request(block(0));
        assert_eq!(u.flushed(true, 0.0), None);
        assert_eq!(u.flushed(false, 0.0), Some(block(0)));
    }
}
