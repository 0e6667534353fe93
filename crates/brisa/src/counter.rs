use std::{
    ops::AddAssign,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::{sync::Mutex, time::Instant};

/// Exponential Moving Average (EMA) smoothing factor
/// Higher values = more responsive to changes, lower values = smoother
const EMA_ALPHA: f64 = 0.3;

/// Counter of rates, used in downloaded and uploaded.
///
/// It is shared between a peer task, which records bytes, and its torrent,
/// which reads the rates for the choke algorithm and the snapshots.
#[derive(Debug)]
pub struct Counter {
    // -- cumulative counters --
    pub total_downloaded: AtomicU64,
    pub total_uploaded: AtomicU64,

    // -- rate calculation --
    pub download_rate: AtomicU64,
    pub upload_rate: AtomicU64,

    // -- internal state --
    window_downloaded: AtomicU64,
    window_uploaded: AtomicU64,
    last_update: Mutex<Instant>,
    ema_download: Mutex<f64>,
    ema_upload: Mutex<f64>,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            total_downloaded: AtomicU64::new(0),
            total_uploaded: AtomicU64::new(0),
            download_rate: AtomicU64::new(0),
            upload_rate: AtomicU64::new(0),
            window_downloaded: AtomicU64::new(0),
            window_uploaded: AtomicU64::new(0),
            last_update: Mutex::new(Instant::now()),
            ema_download: Mutex::new(0.0),
            ema_upload: Mutex::new(0.0),
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record downloaded bytes
    pub fn record_download(&self, bytes: u64) {
        self.total_downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record uploaded bytes
    pub fn record_upload(&self, bytes: u64) {
        self.total_uploaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn download_rate(&self) -> u64 {
        self.download_rate.load(Ordering::Relaxed)
    }

    pub fn upload_rate(&self) -> u64 {
        self.upload_rate.load(Ordering::Relaxed)
    }

    pub fn total_downloaded(&self) -> u64 {
        self.total_downloaded.load(Ordering::Relaxed)
    }

    pub fn total_uploaded(&self) -> u64 {
        self.total_uploaded.load(Ordering::Relaxed)
    }

    /// Update rates with EMA smoothing
    pub async fn update_rates(&self) {
        let now = Instant::now();
        let mut last_update = self.last_update.lock().await;
        let elapsed = now.duration_since(*last_update).as_secs_f64();

        if elapsed < 0.001 {
            // Minimum 1ms elapsed
            return;
        }

        // Get and reset window counters
        let downloaded = self.window_downloaded.swap(0, Ordering::Relaxed);
        let uploaded = self.window_uploaded.swap(0, Ordering::Relaxed);

        // Calculate instantaneous rates
        let dl_rate = downloaded as f64 / elapsed;
        let ul_rate = uploaded as f64 / elapsed;

        // Apply EMA smoothing
        let mut ema_dl = self.ema_download.lock().await;
        let mut ema_ul = self.ema_upload.lock().await;

        *ema_dl = if *ema_dl == 0.0 {
            dl_rate
        } else {
            EMA_ALPHA * dl_rate + (1.0 - EMA_ALPHA) * *ema_dl
        };

        *ema_ul = if *ema_ul == 0.0 {
            ul_rate
        } else {
            EMA_ALPHA * ul_rate + (1.0 - EMA_ALPHA) * *ema_ul
        };

        // Store rates as integers (bytes/sec)
        self.download_rate.store(*ema_dl as u64, Ordering::Relaxed);
        self.upload_rate.store(*ema_ul as u64, Ordering::Relaxed);

        *last_update = now;
    }
}

/// A round based throughput counter, used by the request window of a peer.
///
/// Bytes are accumulated in the current round, and when the round is
/// concluded with [`ThruputCounter::reset`], its value is folded into a
/// weighted average where the latest round has a weight of 1/5.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThruputCounter {
    total: u64,
    round: u64,
    avg: u64,
}

impl ThruputCounter {
    const WEIGHT: u64 = 5;

    /// Finish the current round.
    pub fn reset(&mut self) {
        if self.avg == 0 {
            self.avg = self.round / Self::WEIGHT;
        } else {
            let diff = self.round as i64 - self.avg as i64;
            self.avg = (self.avg as i64 + diff / Self::WEIGHT as i64) as u64;
        }
        self.round = 0;
    }

    /// Bytes accumulated in the current round.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// The weighted average of the previous rounds.
    pub fn avg(&self) -> u64 {
        self.avg
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

impl AddAssign<u64> for ThruputCounter {
    fn add_assign(&mut self, rhs: u64) {
        self.total += rhs;
        self.round += rhs;
    }
}
