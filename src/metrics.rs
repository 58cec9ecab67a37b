//! Lightweight download progress and throughput accounting.
//!
//! Kept deliberately simple: a handful of atomics updated from peer session
//! tasks and the swarm driver, read out by whatever is driving the download
//! (a CLI progress bar, a caller polling [`crate::engine::Engine`]). No
//! histograms, no per-peer breakdowns -- those are speedometer/UI concerns
//! outside this engine's scope.
//!
//! The rolling download rate is the one piece of state that isn't a plain
//! atomic: §4.6 asks for the last 10 per-second samples of the delta in
//! `bytes_downloaded`, which needs a ring buffer. That buffer sits behind a
//! short-lived `std::sync::Mutex`, sampled once a second by the swarm
//! driver's own timer; every other counter here is wait-free.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Mutex,
    },
};

/// The number of per-second samples kept for the rolling rate estimator.
const RATE_WINDOW_LEN: usize = 10;

/// Thread-safe additive counters tracking a single torrent's download
/// progress and connection churn, shared between the swarm and its peer
/// sessions.
pub(crate) struct Metrics {
    bytes_downloaded: AtomicU64,
    pieces_downloaded: AtomicUsize,
    pieces_verified: AtomicUsize,
    pieces_failed: AtomicUsize,
    active_peers: AtomicUsize,
    connection_attempts: AtomicUsize,
    successful_connections: AtomicUsize,
    failed_connections: AtomicUsize,
    piece_count: usize,
    rate_window: Mutex<RateWindow>,
}

/// The ring buffer backing the rolling download-rate estimate, plus the last
/// `bytes_downloaded` reading it was sampled against.
struct RateWindow {
    samples: VecDeque<u64>,
    last_total: u64,
}

impl Metrics {
    pub fn new(piece_count: usize) -> Self {
        Self {
            bytes_downloaded: AtomicU64::new(0),
            pieces_downloaded: AtomicUsize::new(0),
            pieces_verified: AtomicUsize::new(0),
            pieces_failed: AtomicUsize::new(0),
            active_peers: AtomicUsize::new(0),
            connection_attempts: AtomicUsize::new(0),
            successful_connections: AtomicUsize::new(0),
            failed_connections: AtomicUsize::new(0),
            piece_count,
            rate_window: Mutex::new(RateWindow {
                samples: VecDeque::with_capacity(RATE_WINDOW_LEN),
                last_total: 0,
            }),
        }
    }

    /// Records the arrival of a block's payload, regardless of whether its
    /// piece goes on to verify; this is a measure of network traffic, not
    /// of useful progress.
    pub fn record_block(&self, len: usize) {
        self.bytes_downloaded.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Records that a piece has been fully assembled and passed to
    /// [`crate::disk::FileMapper`] for verification, regardless of the
    /// hash outcome.
    pub fn record_piece_downloaded(&self) {
        self.pieces_downloaded.fetch_add(1, Ordering::Relaxed);
    }

    /// Records that one more piece has passed its hash check.
    pub fn record_piece_verified(&self) {
        self.pieces_verified.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a hash mismatch (§4.3 "Complete(index, false)"). Byte
    /// accounting for the discarded piece is left alone: `bytes_downloaded`
    /// already counts the network traffic that was spent on it, and
    /// `pieces_verified` was never incremented for it in the first place.
    pub fn record_piece_failed(&self) {
        self.pieces_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_successful_connection(&self) {
        self.successful_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_connection(&self) {
        self.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_peers(&self, count: usize) {
        self.active_peers.store(count, Ordering::Relaxed);
    }

    /// Appends one sample to the rolling rate window: the delta in
    /// `bytes_downloaded` since the previous sample. Meant to be called once
    /// a second by the swarm driver's timer (§4.6, §5).
    pub fn sample_rate(&self) {
        let total = self.bytes_downloaded.load(Ordering::Relaxed);
        let mut window = self.rate_window.lock().expect("rate window poisoned");
        let delta = total.saturating_sub(window.last_total);
        window.last_total = total;
        if window.samples.len() == RATE_WINDOW_LEN {
            window.samples.pop_front();
        }
        window.samples.push_back(delta);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (current_rate, average_rate) = {
            let window = self.rate_window.lock().expect("rate window poisoned");
            let current = window.samples.back().copied().unwrap_or(0);
            let average = if window.samples.is_empty() {
                0.0
            } else {
                window.samples.iter().sum::<u64>() as f64
                    / window.samples.len() as f64
            };
            (current, average)
        };

        MetricsSnapshot {
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            pieces_downloaded: self.pieces_downloaded.load(Ordering::Relaxed),
            pieces_verified: self.pieces_verified.load(Ordering::Relaxed),
            pieces_failed: self.pieces_failed.load(Ordering::Relaxed),
            piece_count: self.piece_count,
            active_peers: self.active_peers.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            successful_connections: self
                .successful_connections
                .load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
            current_rate_bytes_per_sec: current,
            average_rate_bytes_per_sec: average_rate,
        }
    }
}

/// A point-in-time snapshot of a torrent's download metrics, safe to hand
/// out to callers without exposing the underlying atomics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MetricsSnapshot {
    /// Total bytes of block payload received so far, including bytes
    /// belonging to pieces that later failed their hash check.
    pub bytes_downloaded: u64,
    /// The number of pieces fully assembled and run through hash
    /// verification (verified + failed).
    pub pieces_downloaded: usize,
    /// The number of pieces that have passed their hash check.
    pub pieces_verified: usize,
    /// The number of pieces that failed their hash check (and were reset).
    pub pieces_failed: usize,
    /// The total number of pieces in the torrent.
    pub piece_count: usize,
    /// The number of peers currently connected.
    pub active_peers: usize,
    /// The number of outbound connection attempts made so far.
    pub connection_attempts: usize,
    /// The number of connection attempts that completed a handshake.
    pub successful_connections: usize,
    /// The number of connection attempts that failed (refused, timed out, or
    /// handshake mismatch).
    pub failed_connections: usize,
    /// The most recent one-second sample of download throughput.
    pub current_rate_bytes_per_sec: u64,
    /// The mean throughput across the rolling window (§4.6 "average_rate").
    pub average_rate_bytes_per_sec: f64,
}

impl MetricsSnapshot {
    /// Returns the fraction of pieces verified, in `[0.0, 1.0]`.
    pub fn progress(&self) -> f64 {
        if self.piece_count == 0 {
            return 1.0;
        }
        self.pieces_verified as f64 / self.piece_count as f64
    }

    /// Returns true once every piece has verified.
    pub fn is_complete(&self) -> bool {
        self.pieces_verified >= self.piece_count
    }
}
