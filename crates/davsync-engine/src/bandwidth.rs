//! Bandwidth manager
//!
//! Per-root, per-direction byte-rate limiting. Each direction gets a token
//! bucket refilled continuously; transfers request an allowance before
//! moving bytes, so pacing happens at the transport buffer boundary and
//! cancellation stays prompt (waits are short sleeps in a loop).
//!
//! Modes per direction: off, absolute (KB/s) or relative (percent of the
//! link throughput measured over a five second window).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use std::sync::Arc;

use tracing::debug;

use davsync_core::config::{BandwidthConfig, RateLimit};
use davsync_core::domain::Direction;
use davsync_core::ports::TransferPacer;

/// Upper bound on a single pacing sleep; keeps aborts responsive.
const MAX_PACE_SLEEP: Duration = Duration::from_millis(500);

/// Throughput sampling window for the relative mode.
const SAMPLE_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct BucketInner {
    tokens: f64,
    last_refill: Instant,
    /// Bytes per second; f64 for smooth fractional refill.
    rate: f64,
}

/// Byte-granularity token bucket.
///
/// The burst capacity is one second's worth of tokens, floored at 64 KiB
/// so tiny limits still make progress.
#[derive(Debug)]
pub struct ByteBucket {
    inner: Mutex<BucketInner>,
}

impl ByteBucket {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        let rate = rate_bytes_per_sec as f64;
        Self {
            inner: Mutex::new(BucketInner {
                tokens: Self::capacity_for(rate),
                last_refill: Instant::now(),
                rate,
            }),
        }
    }

    fn capacity_for(rate: f64) -> f64 {
        rate.max(64.0 * 1024.0)
    }

    /// Adjusts the refill rate (relative mode recomputation).
    pub fn set_rate(&self, rate_bytes_per_sec: u64) {
        let mut inner = self.inner.lock().unwrap();
        Self::refill(&mut inner);
        inner.rate = rate_bytes_per_sec as f64;
        inner.tokens = inner.tokens.min(Self::capacity_for(inner.rate));
    }

    fn refill(inner: &mut BucketInner) {
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            inner.tokens =
                (inner.tokens + elapsed * inner.rate).min(Self::capacity_for(inner.rate));
            inner.last_refill = now;
        }
    }

    /// Tokens currently available, after refill.
    pub fn available(&self) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        Self::refill(&mut inner);
        inner.tokens
    }

    fn try_take(&self, bytes: f64) -> Result<(), Duration> {
        let mut inner = self.inner.lock().unwrap();
        Self::refill(&mut inner);
        if inner.tokens >= bytes {
            inner.tokens -= bytes;
            Ok(())
        } else {
            let deficit = bytes - inner.tokens;
            let wait = if inner.rate > 0.0 {
                Duration::from_secs_f64(deficit / inner.rate)
            } else {
                MAX_PACE_SLEEP
            };
            Err(wait)
        }
    }

    /// Suspends until `bytes` tokens could be taken.
    pub async fn acquire(&self, bytes: u64) {
        // pace in sub-chunks so a dropped future never holds a long sleep
        let mut remaining = bytes as f64;
        while remaining > 0.0 {
            let chunk = remaining.min(64.0 * 1024.0);
            loop {
                match self.try_take(chunk) {
                    Ok(()) => break,
                    Err(wait) => tokio::time::sleep(wait.min(MAX_PACE_SLEEP)).await,
                }
            }
            remaining -= chunk;
        }
    }
}

/// Sliding-window throughput estimate for the relative mode.
#[derive(Debug, Default)]
struct Sampler {
    samples: VecDeque<(Instant, u64)>,
}

impl Sampler {
    fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        while let Some((t, _)) = self.samples.front() {
            if now.duration_since(*t) > SAMPLE_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second observed over the window.
    fn measured_rate(&self) -> f64 {
        let total: u64 = self.samples.iter().map(|(_, b)| b).sum();
        total as f64 / SAMPLE_WINDOW.as_secs_f64()
    }
}

struct DirectionState {
    mode: RateLimit,
    bucket: Option<Arc<ByteBucket>>,
    sampler: Mutex<Sampler>,
}

impl DirectionState {
    fn new(mode: RateLimit) -> Self {
        let bucket = match mode {
            RateLimit::Off => None,
            RateLimit::AbsoluteKbps(kbps) => Some(Arc::new(ByteBucket::new(kbps * 1024))),
            // starts unconstrained; tightens once throughput is measured
            RateLimit::RelativePercent(_) => Some(Arc::new(ByteBucket::new(u64::MAX / 4))),
        };
        Self {
            mode,
            bucket,
            sampler: Mutex::new(Sampler::default()),
        }
    }

    fn record(&self, bytes: u64) {
        if let RateLimit::RelativePercent(percent) = self.mode {
            let mut sampler = self.sampler.lock().unwrap();
            sampler.record(bytes);
            let measured = sampler.measured_rate();
            if measured > 0.0 {
                if let Some(bucket) = &self.bucket {
                    let cap = (measured * f64::from(percent) / 100.0) as u64;
                    bucket.set_rate(cap.max(64 * 1024));
                }
            }
        }
    }
}

/// Per-direction rate limiting for one root.
pub struct BandwidthManager {
    upload: DirectionState,
    download: DirectionState,
}

impl BandwidthManager {
    pub fn new(config: &BandwidthConfig) -> Self {
        debug!(upload = ?config.upload, download = ?config.download, "Bandwidth limits");
        Self {
            upload: DirectionState::new(config.upload),
            download: DirectionState::new(config.download),
        }
    }

    fn state(&self, direction: Direction) -> &DirectionState {
        match direction {
            Direction::Down => &self.download,
            _ => &self.upload,
        }
    }

    /// The pacer transfers attach for `direction`; `None` when unlimited.
    pub fn pacer(self: &Arc<Self>, direction: Direction) -> Option<Arc<dyn TransferPacer>> {
        self.state(direction).bucket.as_ref()?;
        Some(Arc::new(DirectionPacer {
            manager: Arc::clone(self),
            direction,
        }))
    }
}

struct DirectionPacer {
    manager: Arc<BandwidthManager>,
    direction: Direction,
}

#[async_trait::async_trait]
impl TransferPacer for DirectionPacer {
    async fn allow(&self, bytes: u64) {
        let state = self.manager.state(self.direction);
        if let Some(bucket) = &state.bucket {
            bucket.acquire(bytes).await;
        }
        state.record(bytes);
    }
}
