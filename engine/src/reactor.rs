//! Event reactor collaborator seam (design §4.2, §6).
//!
//! The design's single-threaded `fd -> connection` + timer-heap reactor is,
//! in this port, `tokio`'s own non-blocking-socket reactor and task
//! scheduler -- the teacher already runs one `tokio::select!` loop per
//! torrent (`torrent::Torrent::run`) rather than hand-rolling `poll`. What
//! the design calls out as a *collaborator* (so the core stays testable
//! without real sockets or a wall clock) is the `Scheduler`: `schedule(task,
//! delay)` and `now()`. `Engine::run` is the reactor's single event loop;
//! it is built from a `tokio::select!` exactly like the teacher's, and the
//! `Scheduler` trait lets tests substitute a fake clock instead of sleeping
//! for real ten-second choker ticks.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// `now()` is seconds since an arbitrary fixed epoch, monotonic for the
/// lifetime of one scheduler -- the same unit `RateMeter` expects.
pub trait Scheduler: Send + Sync {
    fn now(&self) -> f64;
    fn sleep(&self, delay: Duration) -> BoxFuture;
}

/// Real-clock scheduler backed by `tokio::time`, grounded in the teacher's
/// use of `tokio::select!` + `tokio::time` throughout `torrent.rs`.
#[derive(Debug, Clone, Copy)]
pub struct TokioScheduler {
    epoch: std::time::Instant,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self { epoch: std::time::Instant::now() }
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn sleep(&self, delay: Duration) -> BoxFuture {
        Box::pin(async move {
            tokio::time::sleep(delay).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tokio_scheduler_now_advances_monotonically() {
        let s = TokioScheduler::new();
        let t0 = s.now();
        s.sleep(Duration::from_millis(5)).await;
        assert!(s.now() >= t0);
    }
}
