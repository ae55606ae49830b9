//! Telemetry broadcaster
//!
//! Consumes `(marker, trigger)` pairs from ingest in sequence order and
//! pushes one sample per marker. Delivery is best-effort: while the outlet is down, samples are
//! counted as dropped and a fresh connection is attempted with exponential
//! backoff. Nothing here ever waits on recording state.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SinkConnector, SinkError, TelemetrySample, TelemetrySink};
use crate::markers::FrameMarkerEvent;
use crate::trigger::TriggerEvent;

const RATE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelemetryStats {
    pub connected: bool,
    pub sent: u64,
    pub dropped: u64,
    pub reconnect_attempts: u64,
    /// Samples delivered per second over the last full window
    pub rate_hz: f64,
    pub last_sequence: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TelemetryStatsHandle {
    inner: Arc<Mutex<TelemetryStats>>,
}

impl TelemetryStatsHandle {
    fn lock(&self) -> MutexGuard<'_, TelemetryStats> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> TelemetryStats {
        self.lock().clone()
    }
}

/// Counts deliveries and turns them into a per-second rate
#[derive(Debug)]
struct RateMeter {
    window_start: Instant,
    count: u64,
}

impl RateMeter {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    fn record(&mut self) {
        self.count += 1;
    }

    /// Close the window once it is at least `RATE_WINDOW` long
    fn roll(&mut self, now: Instant) -> Option<f64> {
        let elapsed = now.duration_since(self.window_start);
        if elapsed < RATE_WINDOW {
            return None;
        }
        let rate = self.count as f64 / elapsed.as_secs_f64();
        self.window_start = now;
        self.count = 0;
        Some(rate)
    }
}

pub struct TelemetryBroadcaster {
    connector: Arc<dyn SinkConnector>,
    sink: Option<Box<dyn TelemetrySink>>,
    stats: TelemetryStatsHandle,
    base_backoff: Duration,
    max_backoff: Duration,
    failures: u32,
    next_connect_at: Option<Instant>,
    rate: RateMeter,
}

impl TelemetryBroadcaster {
    pub fn new(
        connector: Box<dyn SinkConnector>,
        base_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            connector: Arc::from(connector),
            sink: None,
            stats: TelemetryStatsHandle::default(),
            base_backoff,
            max_backoff,
            failures: 0,
            next_connect_at: None,
            rate: RateMeter::new(Instant::now()),
        }
    }

    pub fn stats_handle(&self) -> TelemetryStatsHandle {
        self.stats.clone()
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(exp)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    fn schedule_reconnect(&mut self, now: Instant, error: String) {
        self.failures = self.failures.saturating_add(1);
        let delay = self.backoff_for_attempt(self.failures);
        self.next_connect_at = Some(now + delay);

        let mut stats = self.stats.lock();
        stats.connected = false;
        stats.last_error = Some(error);
        debug!("Next telemetry connection attempt in {:?}", delay);
    }

    /// Open a connection if none is live and the backoff has expired.
    ///
    /// `failures` is left alone here; only a delivered sample resets it, so an
    /// outlet that accepts connections but rejects every push still backs off.
    async fn ensure_connected(&mut self, now: Instant) -> bool {
        if self.sink.is_some() {
            return true;
        }
        if let Some(at) = self.next_connect_at {
            if now < at {
                return false;
            }
        }

        self.stats.lock().reconnect_attempts += 1;
        let connector = Arc::clone(&self.connector);
        let connected = tokio::task::spawn_blocking(move || connector.connect())
            .await
            .unwrap_or_else(|e| Err(SinkError::Connect(format!("connect task failed: {}", e))));
        match connected {
            Ok(sink) => {
                info!("Telemetry outlet connected: {}", self.connector.describe());
                self.sink = Some(sink);
                self.next_connect_at = None;
                let mut stats = self.stats.lock();
                stats.connected = true;
                stats.last_error = None;
                true
            }
            Err(e) => {
                warn!(
                    "Telemetry outlet {} unavailable: {}",
                    self.connector.describe(),
                    e
                );
                self.schedule_reconnect(now, e.to_string());
                false
            }
        }
    }

    /// Push `marker` tagged with `trigger`, the trigger ingest paired it with.
    ///
    /// Returns the sample whether or not it was delivered.
    pub async fn emit(
        &mut self,
        marker: &FrameMarkerEvent,
        trigger: &TriggerEvent,
    ) -> TelemetrySample {
        let sample = TelemetrySample::tagged(marker, trigger);
        let now = Instant::now();

        let delivered = if self.ensure_connected(now).await {
            match self.sink.as_mut().map(|sink| sink.push(&sample)) {
                Some(Ok(())) => {
                    self.failures = 0;
                    true
                }
                Some(Err(e)) => {
                    warn!("Telemetry outlet dropped: {}", e);
                    self.sink = None;
                    self.schedule_reconnect(now, e.to_string());
                    false
                }
                None => false,
            }
        } else {
            false
        };

        let mut stats = self.stats.lock();
        stats.last_sequence = Some(sample.sequence);
        if delivered {
            stats.sent += 1;
            self.rate.record();
        } else {
            stats.dropped += 1;
        }
        if let Some(rate) = self.rate.roll(now) {
            stats.rate_hz = rate;
        }

        sample
    }

    fn refresh_rate(&mut self) {
        if let Some(rate) = self.rate.roll(Instant::now()) {
            self.stats.lock().rate_hz = rate;
        }
    }

    pub async fn run(
        mut self,
        mut markers: mpsc::UnboundedReceiver<(FrameMarkerEvent, TriggerEvent)>,
        shutdown: CancellationToken,
    ) {
        info!(
            "Telemetry broadcaster started for {}",
            self.connector.describe()
        );
        let mut rate_timer = tokio::time::interval(RATE_WINDOW);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                marker = markers.recv() => {
                    match marker {
                        Some((marker, trigger)) => {
                            self.emit(&marker, &trigger).await;
                        }
                        None => break,
                    }
                }
                _ = rate_timer.tick() => self.refresh_rate(),
            }
        }

        let stats = self.stats.get();
        info!(
            "Telemetry broadcaster stopped ({} sent, {} dropped)",
            stats.sent, stats.dropped
        );
    }
}
