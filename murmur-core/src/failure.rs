use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::event::{EventBus, GossipEvent};

/// Lower clamp for the adaptive phi threshold.
const PHI_THRESHOLD_FLOOR: f64 = 2.0;
/// Upper clamp for the adaptive phi threshold.
const PHI_THRESHOLD_CEILING: f64 = 16.0;
/// Intervals required before phi is computed for a peer.
const MIN_SAMPLES: usize = 2;
/// Checks between adaptive threshold adjustments.
const ADAPT_EVERY: u64 = 64;
const HIGH_FAILURE_RATE: f64 = 0.1;
const LOW_FAILURE_RATE: f64 = 0.01;

/// A peer the detector has declared failed during a check.
#[derive(Debug, Clone)]
pub struct FailureVerdict {
    /// Peer that was declared failed.
    pub peer_id: String,
    /// Phi value at the final check.
    pub phi: f64,
}

/// Aggregate detector state for diagnostics.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct DetectorStats {
    /// Peers with a tracking window.
    pub tracked: usize,
    /// Peers currently under suspicion.
    pub suspected: usize,
    /// Current (possibly adapted) phi threshold.
    pub threshold: f64,
}

struct SampleWindow {
    intervals_ms: VecDeque<f64>,
    last_heartbeat: Instant,
    phi: f64,
    suspected: bool,
    suspicion_level: f64,
}

impl SampleWindow {
    fn new(now: Instant) -> Self {
        Self {
            intervals_ms: VecDeque::new(),
            last_heartbeat: now,
            phi: 0.0,
            suspected: false,
            suspicion_level: 0.0,
        }
    }

    fn record(&mut self, now: Instant, max_samples: usize) {
        let interval = now.saturating_duration_since(self.last_heartbeat);
        self.intervals_ms.push_back(interval.as_secs_f64() * 1_000.0);
        if self.intervals_ms.len() > max_samples {
            self.intervals_ms.pop_front();
        }
        self.last_heartbeat = now;
    }

    fn mean(&self) -> f64 {
        if self.intervals_ms.is_empty() {
            return 0.0;
        }
        self.intervals_ms.iter().sum::<f64>() / self.intervals_ms.len() as f64
    }

    fn stddev(&self) -> f64 {
        if self.intervals_ms.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .intervals_ms
            .iter()
            .map(|interval| (interval - mean).powi(2))
            .sum::<f64>()
            / self.intervals_ms.len() as f64;
        variance.sqrt()
    }
}

#[derive(Default)]
struct AdaptiveState {
    checks: u64,
    failures: u64,
    peak_phi: f64,
}

/// Phi-accrual failure detector: a continuous, self-calibrating suspicion
/// score per peer instead of a binary timeout.
///
/// States per peer: unknown (too few samples) → healthy → suspected →
/// failed. `failed` is terminal for the tracking record; a rejoining peer
/// starts a fresh window.
pub struct PhiAccrualDetector {
    windows: DashMap<String, SampleWindow>,
    threshold: Mutex<f64>,
    suspicion_multiplier: f64,
    max_sample_size: usize,
    min_std_ms: f64,
    adaptive: bool,
    adaptive_state: Mutex<AdaptiveState>,
    events: EventBus,
}

impl PhiAccrualDetector {
    /// Create a detector with the given tuning.
    #[must_use]
    pub fn new(
        phi_threshold: f64,
        suspicion_multiplier: f64,
        max_sample_size: usize,
        min_std_deviation: Duration,
        adaptive: bool,
        events: EventBus,
    ) -> Self {
        Self {
            windows: DashMap::new(),
            threshold: Mutex::new(phi_threshold),
            suspicion_multiplier,
            max_sample_size,
            min_std_ms: min_std_deviation.as_secs_f64() * 1_000.0,
            adaptive,
            adaptive_state: Mutex::new(AdaptiveState::default()),
            events,
        }
    }

    /// Record a heartbeat from `peer_id`.
    ///
    /// The first heartbeat opens the tracking window; one received while the
    /// peer is suspected clears suspicion immediately (the detector is
    /// optimistic about flapping peers).
    pub fn heartbeat(&self, peer_id: &str) {
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(peer_id.to_string())
            .or_insert_with(|| SampleWindow::new(now));
        let window = entry.value_mut();
        if window.last_heartbeat < now {
            window.record(now, self.max_sample_size);
        }
        if window.suspected {
            window.suspected = false;
            window.suspicion_level = 0.0;
            debug!(peer = %peer_id, "suspected peer recovered");
            self.events.emit(GossipEvent::PeerRecovered {
                peer_id: peer_id.to_string(),
            });
        }
    }

    /// Run one detection pass over every tracked peer.
    ///
    /// Returns the peers declared failed in this pass; their tracking
    /// records are discarded and it is the caller's job to drop them from
    /// the peer directory.
    pub fn check(&self) -> Vec<FailureVerdict> {
        let now = Instant::now();
        let threshold = *self.threshold.lock();
        let failure_level = threshold * self.suspicion_multiplier;
        let mut failed = Vec::new();

        for mut entry in self.windows.iter_mut() {
            let window = entry.value_mut();
            if window.intervals_ms.len() < MIN_SAMPLES {
                continue;
            }

            let elapsed_ms =
                now.saturating_duration_since(window.last_heartbeat).as_secs_f64() * 1_000.0;
            let stddev = window.stddev().max(self.min_std_ms);
            let phi = phi_score((elapsed_ms - window.mean()) / stddev);
            window.phi = phi;

            {
                let mut adaptive = self.adaptive_state.lock();
                adaptive.checks += 1;
                adaptive.peak_phi = adaptive.peak_phi.max(phi);
            }

            if window.suspected {
                window.suspicion_level += 1.0;
                if window.suspicion_level >= failure_level {
                    failed.push(FailureVerdict {
                        peer_id: entry.key().clone(),
                        phi,
                    });
                }
            } else if phi > threshold {
                window.suspected = true;
                window.suspicion_level = 0.0;
                debug!(peer = %entry.key(), phi, "peer entered suspicion");
            }
        }

        for verdict in &failed {
            self.windows.remove(&verdict.peer_id);
            info!(peer = %verdict.peer_id, phi = verdict.phi, "peer declared failed");
            self.adaptive_state.lock().failures += 1;
            self.events.emit(GossipEvent::PeerFailed {
                peer_id: verdict.peer_id.clone(),
                phi: verdict.phi,
            });
        }

        if self.adaptive {
            let due = {
                let state = self.adaptive_state.lock();
                state.checks >= ADAPT_EVERY
            };
            if due {
                self.adapt_threshold();
            }
        }

        failed
    }

    /// Discard the tracking record for a removed peer.
    pub fn forget(&self, peer_id: &str) {
        self.windows.remove(peer_id);
    }

    /// Latest phi computed for `peer_id`, when tracked.
    #[must_use]
    pub fn phi(&self, peer_id: &str) -> Option<f64> {
        self.windows.get(peer_id).map(|entry| entry.value().phi)
    }

    /// `true` while `peer_id` is under suspicion.
    #[must_use]
    pub fn is_suspected(&self, peer_id: &str) -> bool {
        self.windows
            .get(peer_id)
            .is_some_and(|entry| entry.value().suspected)
    }

    /// Aggregate counts for metrics.
    #[must_use]
    pub fn stats(&self) -> DetectorStats {
        let mut stats = DetectorStats {
            threshold: *self.threshold.lock(),
            ..DetectorStats::default()
        };
        for entry in &self.windows {
            stats.tracked += 1;
            if entry.value().suspected {
                stats.suspected += 1;
            }
        }
        stats
    }

    /// Nudge the threshold against the observed failure rate: tolerate more
    /// when failures are frequent, tighten when they are rare and phi stays
    /// comfortably low. Clamped to `[2.0, 16.0]`.
    fn adapt_threshold(&self) {
        let (rate, peak_phi) = {
            let mut state = self.adaptive_state.lock();
            let rate = if state.checks == 0 {
                0.0
            } else {
                state.failures as f64 / state.checks as f64
            };
            let peak = state.peak_phi;
            *state = AdaptiveState::default();
            (rate, peak)
        };

        let mut threshold = self.threshold.lock();
        let before = *threshold;
        if rate > HIGH_FAILURE_RATE {
            *threshold += 0.5;
        } else if rate < LOW_FAILURE_RATE && peak_phi < before * 0.5 {
            *threshold -= 0.25;
        }
        *threshold = threshold.clamp(PHI_THRESHOLD_FLOOR, PHI_THRESHOLD_CEILING);
        if (*threshold - before).abs() > f64::EPSILON {
            debug!(
                previous = before,
                current = *threshold,
                failure_rate = rate,
                "adapted phi threshold"
            );
        }
    }
}

/// Logistic approximation of the standard normal CDF; the cubic term is the
/// truncated series the accrual-detector literature uses. Kept verbatim as a
/// policy choice rather than corrected statistics.
fn normal_cdf(x: f64) -> f64 {
    let exponent = -x * (1.5976 + 0.070_566 * x * x);
    1.0 / (1.0 + exponent.exp())
}

fn phi_score(normalized: f64) -> f64 {
    let tail = (1.0 - normal_cdf(normalized)).max(1e-30);
    -tail.log10()
}
