//! Background sync loop and the lock-free adjusted clock.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::ntp::{self, TimeSample};

/// Smoothing weight for newly selected samples.
const ALPHA: f64 = 0.1;

/// Probes taken per sync cycle.
const PROBES_PER_CYCLE: usize = 3;

/// Spacing between probes within one cycle.
const PROBE_SPACING: Duration = Duration::from_millis(20);

/// Cadence of the sync loop.
const SYNC_INTERVAL: Duration = Duration::from_secs(2);

/// Per-probe receive timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Consecutive empty cycles before switching to the fallback server.
const FALLBACK_THRESHOLD: u32 = 5;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to resolve '{0}'")]
    Resolve(String),
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("timed out waiting for reply")]
    Timeout,
    #[error("reply shorter than 48 bytes")]
    ShortReply,
}

/// Raw wall-clock time in microseconds since the Unix epoch.
pub fn wall_clock_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Exponential moving average over selected clock offsets. The first sample
/// seeds the average directly.
#[derive(Debug, Default)]
pub struct OffsetFilter {
    smoothed_us: f64,
    has_initial: bool,
}

impl OffsetFilter {
    pub fn update(&mut self, offset_us: i64) -> i64 {
        if self.has_initial {
            self.smoothed_us = ALPHA * offset_us as f64 + (1.0 - ALPHA) * self.smoothed_us;
        } else {
            self.smoothed_us = offset_us as f64;
            self.has_initial = true;
        }
        self.smoothed_us as i64
    }

    pub fn has_initial(&self) -> bool {
        self.has_initial
    }
}

#[derive(Default)]
struct ClockShared {
    smoothed_offset_us: AtomicI64,
    has_initial_offset: AtomicBool,
    last_synced_local_us: AtomicU64,
    consecutive_failures: AtomicU32,
    using_fallback: AtomicBool,
    healthy: AtomicBool,
}

/// Cloneable, lock-free view of the synchronized clock. Safe to call from
/// any thread, including media callbacks.
#[derive(Clone, Default)]
pub struct ClockHandle {
    shared: Arc<ClockShared>,
}

impl ClockHandle {
    /// Reference-adjusted local time in microseconds.
    pub fn now_us(&self) -> u64 {
        let offset = self.shared.smoothed_offset_us.load(Ordering::Relaxed);
        wall_clock_us().wrapping_add(offset as u64)
    }

    pub fn smoothed_offset_us(&self) -> i64 {
        self.shared.smoothed_offset_us.load(Ordering::Relaxed)
    }

    pub fn has_initial_offset(&self) -> bool {
        self.shared.has_initial_offset.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.shared.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn using_fallback(&self) -> bool {
        self.shared.using_fallback.load(Ordering::Relaxed)
    }

    pub fn time_since_last_sync_us(&self) -> u64 {
        let last = self.shared.last_synced_local_us.load(Ordering::Relaxed);
        wall_clock_us().saturating_sub(last)
    }
}

/// What a cycle should do, decided before any probe is sent.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CyclePlan {
    Probe,
    /// Switch to the fallback server; no samples this cycle.
    SwitchToFallback,
}

/// Sync-loop state that does not need to be visible to readers. Separated
/// from the I/O so cycle decisions stay testable.
pub(crate) struct SyncState {
    primary: String,
    fallback: Option<String>,
    active: String,
    filter: OffsetFilter,
    shared: Arc<ClockShared>,
}

impl SyncState {
    fn new(primary: String, fallback: Option<String>, shared: Arc<ClockShared>) -> Self {
        Self {
            active: primary.clone(),
            primary,
            fallback,
            filter: OffsetFilter::default(),
            shared,
        }
    }

    pub(crate) fn active_server(&self) -> &str {
        &self.active
    }

    pub(crate) fn begin_cycle(&mut self) -> CyclePlan {
        let failures = self.shared.consecutive_failures.load(Ordering::Relaxed);
        let on_fallback = self.shared.using_fallback.load(Ordering::Relaxed);
        if failures >= FALLBACK_THRESHOLD && !on_fallback {
            if let Some(fallback) = self.fallback.clone() {
                info!(
                    primary = %self.primary,
                    fallback = %fallback,
                    "time reference unreachable, switching to fallback"
                );
                self.active = fallback;
                self.shared.using_fallback.store(true, Ordering::Relaxed);
                self.shared.consecutive_failures.store(0, Ordering::Relaxed);
                return CyclePlan::SwitchToFallback;
            }
        }
        CyclePlan::Probe
    }

    /// Fold the cycle's accepted samples. Returns the new smoothed offset if
    /// any sample was applied.
    pub(crate) fn finish_cycle(&mut self, accepted: &[TimeSample]) -> Option<i64> {
        if accepted.is_empty() {
            self.shared.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            self.shared.healthy.store(false, Ordering::Relaxed);
            return None;
        }

        // Minimum round trip wins; first occurrence breaks ties.
        let mut best = accepted[0];
        for s in &accepted[1..] {
            if s.rtt < best.rtt {
                best = *s;
            }
        }

        let smoothed = self.filter.update(best.offset);
        self.shared.smoothed_offset_us.store(smoothed, Ordering::Relaxed);
        self.shared.has_initial_offset.store(true, Ordering::Relaxed);
        self.shared.last_synced_local_us.store(wall_clock_us(), Ordering::Relaxed);
        self.shared.consecutive_failures.store(0, Ordering::Relaxed);
        self.shared.healthy.store(true, Ordering::Relaxed);

        debug!(
            offset_us = best.offset,
            rtt_us = best.rtt,
            smoothed_us = smoothed,
            "applied clock sample"
        );
        Some(smoothed)
    }
}

/// One NTP request/response exchange against `server` ("host" or
/// "host:port"; port defaults to 123). The returned sample may still fail
/// the round-trip rejection check.
pub async fn probe(server: &str) -> Result<TimeSample, ProbeError> {
    let target = if server.contains(':') {
        server.to_string()
    } else {
        format!("{server}:123")
    };

    let addr = tokio::net::lookup_host(&target)
        .await
        .map_err(|_| ProbeError::Resolve(target.clone()))?
        .next()
        .ok_or_else(|| ProbeError::Resolve(target.clone()))?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;

    let t1 = wall_clock_us();
    let request = ntp::build_request(t1);
    socket.send_to(&request, addr).await?;

    let mut buf = [0u8; 128];
    let len = tokio::time::timeout(PROBE_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| ProbeError::Timeout)??;
    let t4 = wall_clock_us();

    let ts = ntp::parse_response(&buf[..len]).ok_or(ProbeError::ShortReply)?;
    Ok(TimeSample::compute(t1, ts.receive_us, ts.transmit_us, t4))
}

/// Owns the background sync task. Dropping it cancels the loop.
pub struct ClockSync {
    handle: ClockHandle,
    stop: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

impl ClockSync {
    /// Spawn the sync loop against `primary`, failing over to `fallback`
    /// after repeated empty cycles.
    pub fn spawn(primary: impl Into<String>, fallback: Option<String>) -> ClockSync {
        let primary = primary.into();
        let handle = ClockHandle::default();
        let stop = Arc::new(Notify::new());

        info!(server = %primary, fallback = ?fallback, "starting clock sync");

        let shared = handle.shared.clone();
        let stop_signal = stop.clone();
        let task = tokio::spawn(async move {
            let mut state = SyncState::new(primary, fallback, shared.clone());
            let mut ticker = tokio::time::interval(SYNC_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop_signal.notified() => break,
                    _ = ticker.tick() => {}
                }

                if state.begin_cycle() == CyclePlan::SwitchToFallback {
                    continue;
                }

                let mut accepted = Vec::with_capacity(PROBES_PER_CYCLE);
                for i in 0..PROBES_PER_CYCLE {
                    match probe(state.active_server()).await {
                        Ok(sample) if sample.is_acceptable() => accepted.push(sample),
                        Ok(sample) => {
                            debug!(rtt_us = sample.rtt, "rejected high-rtt sample");
                        }
                        Err(err) => {
                            shared.healthy.store(false, Ordering::Relaxed);
                            if shared.consecutive_failures.load(Ordering::Relaxed) == 0 {
                                error!(server = %state.active_server(), %err, "clock probe failed");
                            } else {
                                debug!(server = %state.active_server(), %err, "clock probe failed");
                            }
                        }
                    }
                    if i + 1 < PROBES_PER_CYCLE {
                        tokio::time::sleep(PROBE_SPACING).await;
                    }
                }

                let had_failures = shared.consecutive_failures.load(Ordering::Relaxed) > 0;
                if state.finish_cycle(&accepted).is_some() && had_failures {
                    info!("clock sync recovered");
                }
            }
            debug!("clock sync loop stopped");
        });

        ClockSync { handle, stop, task }
    }

    pub fn handle(&self) -> ClockHandle {
        self.handle.clone()
    }

    /// Cancel the pending wait and let the loop finish its current cycle.
    pub async fn shutdown(mut self) {
        self.stop.notify_one();
        // Await through a reference; `self` still owns the handle for Drop.
        if let Err(err) = (&mut self.task).await {
            if !err.is_cancelled() {
                warn!(%err, "clock sync task panicked");
            }
        }
    }
}

impl Drop for ClockSync {
    fn drop(&mut self) {
        self.stop.notify_one();
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(offset: i64, rtt: u64) -> TimeSample {
        TimeSample { offset, rtt, aux_diff: 0 }
    }

    fn state_with_fallback() -> (SyncState, ClockHandle) {
        let handle = ClockHandle::default();
        let state = SyncState::new(
            "primary.local".into(),
            Some("pool.ntp.org".into()),
            handle.shared.clone(),
        );
        (state, handle)
    }

    #[test]
    fn first_sample_seeds_filter_directly() {
        let mut filter = OffsetFilter::default();
        assert_eq!(filter.update(5000), 5000);
    }

    #[test]
    fn second_sample_is_smoothed() {
        let mut filter = OffsetFilter::default();
        filter.update(1000);
        // 0.1 * 2000 + 0.9 * 1000
        assert_eq!(filter.update(2000), 1100);
    }

    #[test]
    fn min_rtt_sample_wins_first_occurrence_on_tie() {
        let (mut state, handle) = state_with_fallback();
        let smoothed = state
            .finish_cycle(&[sample(100, 500), sample(900, 300), sample(50, 300)])
            .unwrap();
        // Both ties have rtt 300; the first (offset 900) is selected.
        assert_eq!(smoothed, 900);
        assert!(handle.is_healthy());
        assert_eq!(handle.consecutive_failures(), 0);
    }

    #[test]
    fn empty_cycle_increments_failures_and_marks_unhealthy() {
        let (mut state, handle) = state_with_fallback();
        assert!(state.finish_cycle(&[]).is_none());
        assert_eq!(handle.consecutive_failures(), 1);
        assert!(!handle.is_healthy());
    }

    #[test]
    fn fallback_switches_exactly_once_after_threshold() {
        let (mut state, handle) = state_with_fallback();
        for _ in 0..5 {
            assert_eq!(state.begin_cycle(), CyclePlan::Probe);
            state.finish_cycle(&[]);
        }
        assert_eq!(handle.consecutive_failures(), 5);

        // The switch consumes one cycle with no samples taken.
        assert_eq!(state.begin_cycle(), CyclePlan::SwitchToFallback);
        assert!(handle.using_fallback());
        assert_eq!(handle.consecutive_failures(), 0);
        assert_eq!(state.active_server(), "pool.ntp.org");

        // Further empty cycles never switch again.
        for _ in 0..10 {
            assert_eq!(state.begin_cycle(), CyclePlan::Probe);
            state.finish_cycle(&[]);
        }
        assert_eq!(state.active_server(), "pool.ntp.org");
    }

    #[test]
    fn no_fallback_configured_keeps_probing() {
        let handle = ClockHandle::default();
        let mut state = SyncState::new("primary.local".into(), None, handle.shared.clone());
        for _ in 0..10 {
            assert_eq!(state.begin_cycle(), CyclePlan::Probe);
            state.finish_cycle(&[]);
        }
        assert!(!handle.using_fallback());
    }

    #[test]
    fn successful_cycle_publishes_offset_to_handle() {
        let (mut state, handle) = state_with_fallback();
        state.finish_cycle(&[sample(-2500, 100)]);
        assert_eq!(handle.smoothed_offset_us(), -2500);
        assert!(handle.has_initial_offset());
    }

    #[tokio::test]
    async fn shutdown_joins_the_sync_task() {
        // Nothing listens on this port; shutdown must still stop the loop
        // and join the task cleanly.
        let sync = ClockSync::spawn("127.0.0.1:1", None);
        let handle = sync.handle();
        sync.shutdown().await;
        assert!(!handle.is_healthy());
    }

    #[tokio::test]
    async fn probe_against_loopback_responder() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            let ts = ntp::parse_response(&buf[..len]).unwrap();
            // The client's transmit time arrives in the transmit slot.
            let now = wall_clock_us();
            let reply = ntp::build_response(ts.transmit_us, now, now);
            server.send_to(&reply, peer).await.unwrap();
        });

        let sample = probe(&addr.to_string()).await.unwrap();
        // Same clock on both ends: offset stays within the loopback rtt.
        assert!(sample.rtt < 1_000_000);
        assert!(sample.offset.unsigned_abs() <= sample.rtt);
    }
}
