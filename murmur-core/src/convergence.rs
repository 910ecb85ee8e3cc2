use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::directory::PeerDirectory;
use crate::event::{EventBus, GossipEvent};
use crate::rumor::MessageId;

/// Below this rate or coverage the tracker raises an advisory issue.
const DEGRADED_RATIO: f64 = 0.5;

/// Advisory operational conditions flagged by the tracker.
///
/// These are health signals for an operator; the tracker never mutates
/// protocol state or blocks progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConvergenceIssue {
    /// Too few tracked messages converged inside the rolling window.
    LowConvergenceRate {
        /// Converged / tracked within the window.
        rate: f64,
    },
    /// Too few known nodes were observed relaying recently.
    PoorCoverage {
        /// Fraction of known nodes seen within the window.
        coverage: f64,
    },
    /// Messages are converging, but slowly.
    SlowConvergence {
        /// Mean time-to-converge across the window, in milliseconds.
        average_ms: f64,
    },
    /// Tracked messages exceeded the convergence deadline.
    StuckMessages {
        /// Messages past the deadline without converging.
        count: usize,
    },
}

struct TrackedMessage {
    relays: HashSet<String>,
    first_seen: Instant,
    converged: bool,
    lost: bool,
}

/// Rolling-window convergence statistics.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ConvergenceStats {
    /// Messages currently tracked.
    pub tracked: usize,
    /// Messages that converged inside the rolling window.
    pub converged_in_window: usize,
    /// Converged / tracked within the window.
    pub convergence_rate: f64,
    /// Mean time-to-converge across the window, in milliseconds.
    pub average_convergence_ms: f64,
    /// Fraction of known nodes observed relaying within the window.
    pub coverage: f64,
    /// Stability in `[0, 1]` from the coefficient of variation of
    /// convergence times.
    pub stability: f64,
}

/// Estimates whether the cluster has reached consistency for each message.
///
/// For every distinct message relayed through the dissemination protocol the
/// tracker grows the set of distinct relaying nodes; once the reached
/// fraction crosses the configured threshold the message counts as converged
/// and its time-to-converge enters the rolling statistics.
pub struct ConvergenceTracker {
    directory: Arc<PeerDirectory>,
    events: EventBus,
    threshold: f64,
    stability_window: Duration,
    max_convergence_time: Duration,
    tracked: DashMap<MessageId, TrackedMessage>,
    node_last_seen: DashMap<String, Instant>,
    window: Mutex<VecDeque<(Instant, Duration)>>,
}

impl ConvergenceTracker {
    /// Create a tracker observing the given directory for cluster size.
    #[must_use]
    pub fn new(
        directory: Arc<PeerDirectory>,
        threshold: f64,
        stability_window: Duration,
        max_convergence_time: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            directory,
            events,
            threshold,
            stability_window,
            max_convergence_time,
            tracked: DashMap::new(),
            node_last_seen: DashMap::new(),
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Record that `node_id` was observed relaying message `id`.
    ///
    /// Duplicate observations of the same node are idempotent. Crossing the
    /// coverage threshold marks the message converged exactly once and
    /// emits [`GossipEvent::ConvergenceAchieved`].
    pub fn observe(&self, id: MessageId, node_id: &str) {
        let now = Instant::now();
        self.node_last_seen.insert(node_id.to_string(), now);

        let mut entry = self.tracked.entry(id).or_insert_with(|| TrackedMessage {
            relays: HashSet::new(),
            first_seen: now,
            converged: false,
            lost: false,
        });
        let message = entry.value_mut();
        message.relays.insert(node_id.to_string());
        if message.converged || message.lost {
            return;
        }

        let total = self.directory.estimated_cluster_size().max(1);
        let coverage = message.relays.len() as f64 / total as f64;
        if coverage >= self.threshold {
            message.converged = true;
            let elapsed = now.saturating_duration_since(message.first_seen);
            debug!(%id, ?elapsed, coverage, "message converged");
            self.window.lock().push_back((now, elapsed));
            self.events.emit(GossipEvent::ConvergenceAchieved {
                id,
                elapsed,
                coverage,
            });
        }
    }

    /// Run one periodic pass: flag stuck messages, expire old tracking
    /// entries, and raise advisory issues for degraded statistics.
    pub fn check(&self) {
        let now = Instant::now();
        let mut stuck = Vec::new();

        for mut entry in self.tracked.iter_mut() {
            let message = entry.value_mut();
            if !message.converged
                && !message.lost
                && now.saturating_duration_since(message.first_seen) > self.max_convergence_time
            {
                message.lost = true;
                stuck.push(*entry.key());
            }
        }
        for id in &stuck {
            warn!(%id, "message exceeded convergence deadline");
            self.events.emit(GossipEvent::ConvergenceLost { id: *id });
        }

        // Entries past the tracking window have told us everything they
        // will; their statistics already live in the rolling window.
        self.tracked.retain(|_, message| {
            now.saturating_duration_since(message.first_seen) <= self.stability_window
        });
        self.node_last_seen.retain(|_, last_seen| {
            now.saturating_duration_since(*last_seen) <= self.stability_window
        });
        {
            let mut window = self.window.lock();
            while window
                .front()
                .is_some_and(|(at, _)| now.saturating_duration_since(*at) > self.stability_window)
            {
                window.pop_front();
            }
        }

        let stats = self.stats();
        if !stuck.is_empty() {
            self.issue(ConvergenceIssue::StuckMessages { count: stuck.len() });
        }
        if stats.tracked > 0 && stats.convergence_rate < DEGRADED_RATIO {
            self.issue(ConvergenceIssue::LowConvergenceRate {
                rate: stats.convergence_rate,
            });
        }
        if !self.node_last_seen.is_empty() && stats.coverage < DEGRADED_RATIO {
            self.issue(ConvergenceIssue::PoorCoverage {
                coverage: stats.coverage,
            });
        }
        if stats.converged_in_window > 0
            && stats.average_convergence_ms > self.max_convergence_time.as_millis() as f64 / 2.0
        {
            self.issue(ConvergenceIssue::SlowConvergence {
                average_ms: stats.average_convergence_ms,
            });
        }
    }

    /// Rolling-window statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> ConvergenceStats {
        let now = Instant::now();
        let tracked = self.tracked.len();
        let converged_tracked = self
            .tracked
            .iter()
            .filter(|entry| entry.value().converged)
            .count();

        let window = self.window.lock();
        let times: Vec<f64> = window
            .iter()
            .map(|(_, elapsed)| elapsed.as_secs_f64() * 1_000.0)
            .collect();
        drop(window);

        let converged_in_window = times.len();
        let average = if times.is_empty() {
            0.0
        } else {
            times.iter().sum::<f64>() / times.len() as f64
        };
        let stability = stability_score(&times, average);

        let total = self.directory.estimated_cluster_size().max(1);
        let seen_recently = self
            .node_last_seen
            .iter()
            .filter(|entry| {
                now.saturating_duration_since(*entry.value()) <= self.stability_window
            })
            .count();

        ConvergenceStats {
            tracked,
            converged_in_window,
            convergence_rate: if tracked == 0 {
                1.0
            } else {
                converged_tracked as f64 / tracked as f64
            },
            average_convergence_ms: average,
            coverage: (seen_recently as f64 / total as f64).clamp(0.0, 1.0),
            stability,
        }
    }

    fn issue(&self, issue: ConvergenceIssue) {
        debug!(?issue, "convergence issue flagged");
        self.events.emit(GossipEvent::ConvergenceIssue { issue });
    }
}

/// Stability from the coefficient of variation of convergence times: lower
/// variance scores closer to 1.
fn stability_score(times_ms: &[f64], mean: f64) -> f64 {
    if times_ms.len() < 2 || mean <= f64::EPSILON {
        return if times_ms.is_empty() { 0.0 } else { 1.0 };
    }
    let variance =
        times_ms.iter().map(|time| (time - mean).powi(2)).sum::<f64>() / times_ms.len() as f64;
    let cv = variance.sqrt() / mean;
    (1.0 / (1.0 + cv)).clamp(0.0, 1.0)
}
