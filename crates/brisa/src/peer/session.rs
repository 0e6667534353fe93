use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::{counter::ThruputCounter, extensions::core::BLOCK_LEN};

/// At any given time, a connection with a peer is in one of the below states.
#[derive(Clone, Default, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// The TCP connection is being established, directly or through a
    /// proxy.
    #[default]
    Connecting,
    /// Exchanging the encrypted handshake, if any, and the BitTorrent
    /// handshake.
    Handshaking,
    /// The handshakes were exchanged. The bitfield is only accepted as the
    /// first message of this state.
    AwaitingBitfield,
    /// This is the normal state of a peer session, in which any messages,
    /// apart from the handshake and the bitfield, may be exchanged.
    Active,
    /// The connection is being torn down, because of an error or because the
    /// torrent asked.
    Closing,
    Closed,
}

/// Holds and provides facilities to modify the state of a peer session.
#[derive(Debug)]
pub struct Session {
    pub state: ConnectionState,

    /// Downloaded payload, in rounds of one second.
    pub download: ThruputCounter,

    /// Whether the session is in slow start.
    pub in_slow_start: bool,

    /// The target request queue size is the number of block requests we keep
    /// outstanding to fully saturate the link.
    ///
    /// This value is derived by collecting a running average of the
    /// downloaded bytes per second, as well as the average request latency,
    /// to arrive at the bandwidth-delay product B x D.
    ///
    /// ```text
    /// queue = download_rate * link_latency / 16 KiB
    /// ```
    pub target_request_queue_len: u16,

    /// Upper bound of the queue, the `reqq` of the peer.
    pub max_request_queue_len: u16,

    /// The last time some requests were sent to the peer.
    pub last_outgoing_request_time: Option<Instant>,

    /// Updated with the time of receipt of the most recently received
    /// requested block.
    pub last_incoming_block_time: Option<Instant>,

    /// Average time between the last issued request and receiving the next
    /// block. Peers don't have to serve requests in order, so this is more of
    /// a general approximation.
    pub avg_request_rtt: Option<Duration>,

    /// Requests that timed out since the last block arrived.
    pub timed_out_request_count: usize,

    /// Longest a request may wait for its block.
    pub max_request_timeout: Duration,

    /// Last message received from the peer, of any kind.
    pub last_received: Instant,

    /// Last message sent to the peer, of any kind.
    pub last_sent: Instant,
}

impl Session {
    /// When we check whether to exit slow start mode we want to allow for
    /// some error margin, the download rate fluctuates from one second to
    /// the next.
    const SLOW_START_ERROR_MARGIN: u64 = 10000;

    /// The target request queue size is set to this value once we are able
    /// to start downloading.
    pub const START_REQUEST_QUEUE_LEN: u16 = 4;

    /// Used when the peer does not tell its `reqq`.
    pub const DEFAULT_REQUEST_QUEUE_LEN: u16 = 200;

    /// We never keep more requests than this in flight.
    pub const MAX_REQUEST_QUEUE_LEN: u16 = 250;

    /// The smallest timeout value we can give a peer. Very fast peers will
    /// have small round-trip-times, so a slight deviation would punish them
    /// unnecessarily.
    pub const MIN_TIMEOUT: Duration = Duration::from_secs(2);

    /// A keep-alive is sent after this much silence from us.
    pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

    /// The peer is dropped after this much silence.
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(180);

    pub fn new(max_request_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            state: ConnectionState::default(),
            download: ThruputCounter::default(),
            in_slow_start: false,
            target_request_queue_len: Self::START_REQUEST_QUEUE_LEN,
            max_request_queue_len: Self::DEFAULT_REQUEST_QUEUE_LEN,
            last_outgoing_request_time: None,
            last_incoming_block_time: None,
            avg_request_rtt: None,
            timed_out_request_count: 0,
            max_request_timeout,
            last_received: now,
            last_sent: now,
        }
    }

    /// Set the maximum queue from the `reqq` of the extended handshake.
    pub fn set_reqq(&mut self, reqq: Option<u16>) {
        self.max_request_queue_len = reqq
            .unwrap_or(Self::DEFAULT_REQUEST_QUEUE_LEN)
            .clamp(1, Self::MAX_REQUEST_QUEUE_LEN);
        self.target_request_queue_len =
            self.target_request_queue_len.min(self.max_request_queue_len);
    }

    /// Returns the current request timeout value, based on the running
    /// average of past request round trip times.
    pub fn request_timeout(&self) -> Duration {
        let max = self.max_request_timeout.max(Self::MIN_TIMEOUT);
        match self.avg_request_rtt {
            // we allow up to four times the average
            Some(rtt) => (rtt * 4).max(Self::MIN_TIMEOUT).min(max),
            None => max,
        }
    }

    /// Updates state to reflect that a request of the peer timed out.
    pub fn register_request_timeout(&mut self) {
        self.timed_out_request_count += 1;
        self.in_slow_start = false;
        self.target_request_queue_len = (self.target_request_queue_len / 2).max(1);
    }

    /// Prepares for requesting blocks.
    /// This should be called after being unchoked.
    pub fn prepare_for_download(&mut self) {
        self.in_slow_start = true;
        self.target_request_queue_len =
            Self::START_REQUEST_QUEUE_LEN.min(self.max_request_queue_len);
    }

    /// Updates various statistics around a block download.
    /// This should be called every time a requested block is received.
    pub fn update_download_stats(&mut self, block_len: u32) {
        let now = Instant::now();

        if let Some(last_outgoing_request_time) = self.last_outgoing_request_time
        {
            let rtt = now.saturating_duration_since(last_outgoing_request_time);
            self.avg_request_rtt = Some(match self.avg_request_rtt {
                None => rtt,
                Some(avg) => (avg * 4 + rtt) / 5,
            });
        }

        self.download += block_len as u64;
        self.last_incoming_block_time = Some(now);
        self.timed_out_request_count = 0;

        // in slow start the queue grows by one for every block, so it
        // doubles every round trip.
        if self.in_slow_start
            && self.target_request_queue_len < self.max_request_queue_len
        {
            self.target_request_queue_len += 1;
        }
    }

    /// Updates the request window, this should be called every second.
    pub fn tick(&mut self) {
        self.maybe_exit_slow_start();

        // has to be after `maybe_exit_slow_start`, which looks at the round
        // that is not concluded yet, and before
        // `update_target_request_queue_len`, which needs the round accounted
        // in the average.
        self.download.reset();

        self.update_target_request_queue_len();
    }

    /// We leave slow start if the download rate has not increased
    /// significantly since the last round.
    fn maybe_exit_slow_start(&mut self) {
        if self.in_slow_start
            && self.download.round() > 0
            && self.download.round() + Self::SLOW_START_ERROR_MARGIN
                < self.download.avg()
        {
            debug!("leaving slow start");
            self.in_slow_start = false;
        }
    }

    /// Adjusts the target request queue size based on the current download
    /// statistics.
    fn update_target_request_queue_len(&mut self) {
        if self.in_slow_start {
            return;
        }
        let prev_queue_len = self.target_request_queue_len;

        let download_rate = self.download.avg();
        let latency = self
            .avg_request_rtt
            .unwrap_or_default()
            .max(Duration::from_secs(1));
        let bytes = download_rate as u128 * latency.as_millis() / 1000;

        // round up, overestimating the link capacity is cheaper than
        // underestimating it
        let queue = bytes.div_ceil(BLOCK_LEN as u128);

        self.target_request_queue_len =
            queue.clamp(1, self.max_request_queue_len as u128) as u16;

        if prev_queue_len != self.target_request_queue_len {
            debug!(
                "request queue changed from {} to {}",
                prev_queue_len, self.target_request_queue_len
            );
        }
    }

    /// If the peer is owed a keep-alive.
    pub fn needs_keep_alive(&self) -> bool {
        self.last_sent.elapsed() >= Self::KEEP_ALIVE_INTERVAL
    }

    /// If the peer has been silent for too long.
    pub fn is_idle(&self) -> bool {
        self.last_received.elapsed() >= Self::IDLE_TIMEOUT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(Duration::from_secs(20))
    }

    #[test]
    fn should_prepare_for_download() {
        let mut s = session();
        s.prepare_for_download();
        assert_eq!(s.target_request_queue_len, Session::START_REQUEST_QUEUE_LEN);
        assert!(s.in_slow_start);
    }

    #[test]
    fn should_exit_slow_start() {
        let mut s = session();
        s.in_slow_start = true;
        s.target_request_queue_len = 1;

        // rate increasing
        s.download += 10 * BLOCK_LEN as u64;
        s.maybe_exit_slow_start();
        assert!(s.in_slow_start);

        // 0 + (10 * 16384) / 5 = 32768
        s.download.reset();

        s.download += 10 * BLOCK_LEN as u64;
        s.maybe_exit_slow_start();
        assert!(s.in_slow_start);

        // 32768 + (163840 - 32768) / 5 = 58982
        s.download.reset();

        // this round's increase is much less than that of the previous
        // round, should exit slow start
        s.download += 2 * BLOCK_LEN as u64 + 9000;
        s.maybe_exit_slow_start();
        assert!(!s.in_slow_start);
    }

    #[test]
    fn should_not_update_target_request_queue_in_slow_start() {
        let mut s = session();
        s.in_slow_start = true;
        s.target_request_queue_len = 1;

        s.download += 2 * BLOCK_LEN as u64;
        s.download.reset();

        s.update_target_request_queue_len();
        assert_eq!(s.target_request_queue_len, 1);
    }

    #[test]
    fn should_update_target_request_queue() {
        let mut s = session();
        s.in_slow_start = false;
        s.target_request_queue_len = 1;

        // more than a multiple of the block length, to test against integer
        // truncation
        s.download += 10 * BLOCK_LEN as u64 + 5000;
        s.download.reset();

        // 0 + (10 * 16384 + 5000) / 5 = 33768
        // (33768 + (16384 - 1)) / 16384 = 3.06 ~ 3
        s.update_target_request_queue_len();
        assert_eq!(s.target_request_queue_len, 3);
    }

    #[test]
    fn queue_is_capped_by_reqq() {
        let mut s = session();
        s.set_reqq(Some(2));
        s.download += 100 * BLOCK_LEN as u64;
        s.download.reset();
        s.update_target_request_queue_len();
        assert_eq!(s.target_request_queue_len, 2);

        s.set_reqq(Some(1000));
        assert_eq!(s.max_request_queue_len, Session::MAX_REQUEST_QUEUE_LEN);
        s.set_reqq(None);
        assert_eq!(s.max_request_queue_len, Session::DEFAULT_REQUEST_QUEUE_LEN);
    }

    #[test]
    fn should_update_download_stats_in_slow_start() {
        let mut s = session();
        s.in_slow_start = true;
        s.target_request_queue_len = 1;
        s.timed_out_request_count = 2;

        s.update_download_stats(BLOCK_LEN);

        assert_eq!(s.target_request_queue_len, 2);
        assert!(s.last_incoming_block_time.is_some());
        assert_eq!(s.download.round(), BLOCK_LEN as u64);
        assert_eq!(s.timed_out_request_count, 0);
    }

    #[test]
    fn request_timeout_is_bounded() {
        let mut s = session();
        assert_eq!(s.request_timeout(), Duration::from_secs(20));

        s.avg_request_rtt = Some(Duration::from_millis(10));
        assert_eq!(s.request_timeout(), Session::MIN_TIMEOUT);

        s.avg_request_rtt = Some(Duration::from_secs(3));
        assert_eq!(s.request_timeout(), Duration::from_secs(12));

        s.avg_request_rtt = Some(Duration::from_secs(30));
        assert_eq!(s.request_timeout(), Duration::from_secs(20));

        s.register_request_timeout();
        assert_eq!(s.timed_out_request_count, 1);
        assert!(!s.in_slow_start);
    }
}
