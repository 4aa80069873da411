//! Engine-wide tunables. Adapted from the teacher's `config::TorrentConfig`
//! / `ClientConfig` split, generalized with the knobs the choker, picker and
//! upload-rate cap need that the teacher hardcoded inline.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bytes requested per block (teacher's `BLOCK_SIZE`, made configurable).
    pub request_size: usize,

    /// Target number of outstanding requests per peer.
    pub backlog: usize,

    /// Rate-meter decay window.
    pub rate_window: Duration,

    /// Choker tick period (design: 10s).
    pub choke_period: Duration,

    /// Optimistic-unchoke rotation period in ticks (design: every 3rd tick).
    pub optimistic_rotation_ticks: u32,

    /// Minimum and maximum number of unchoked peers the choker maintains.
    pub min_uploads: usize,
    pub max_uploads: usize,

    /// A peer that has sent nothing in this long (while we're downloading)
    /// is snubbed.
    pub snub_time: Duration,

    /// Global upload cap; `None` means uncapped.
    pub max_upload_rate: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_size: crate::BLOCK_SIZE,
            backlog: 10,
            rate_window: Duration::from_secs(20),
            choke_period: Duration::from_secs(10),
            optimistic_rotation_ticks: 3,
            min_uploads: 4,
            max_uploads: 7,
            snub_time: Duration::from_secs(30),
            max_upload_rate: None,
        }
    }
}
