use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GossipError;

/// Tunables for one gossip node, consumed at construction time.
///
/// All durations deserialize from humantime strings (`"500ms"`, `"30s"`).
/// Invalid values fail fast in [`GossipConfig::validate`]; nothing is checked
/// again at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Stable node identifier (auto-generated when empty).
    pub node_id: String,
    /// Peers receiving pushed rumors per gossip round.
    pub push_fanout: usize,
    /// Peers receiving pull requests per gossip round.
    pub pull_fanout: usize,
    /// Cadence of epidemic gossip rounds.
    #[serde(with = "humantime_serde")]
    pub gossip_interval: Duration,
    /// Cadence of anti-entropy reconciliation rounds.
    #[serde(with = "humantime_serde")]
    pub anti_entropy_interval: Duration,
    /// Only rumors newer than this are eligible for pushing.
    #[serde(with = "humantime_serde")]
    pub max_message_age: Duration,
    /// Rumors older than this are purged from the rumor store.
    #[serde(with = "humantime_serde")]
    pub max_rumor_age: Duration,
    /// Probability that an eligible rumor is included in any one push.
    pub retransmission_probability: f64,
    /// Upper bound on tracked peers; the oldest is evicted past this.
    pub max_peers: usize,
    /// Peer count below which the directory logs a warning.
    pub min_peers: usize,
    /// Silence after which a peer is evicted by the health check.
    #[serde(with = "humantime_serde")]
    pub peer_timeout: Duration,
    /// Phi value above which a peer becomes suspected.
    pub phi_threshold: f64,
    /// Multiplier applied to the threshold to derive the failure level.
    pub suspicion_multiplier: f64,
    /// Cadence of failure-detector checks.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Fraction of live nodes a message must reach to count as converged.
    pub convergence_threshold: f64,
    /// Rolling window over which convergence statistics are computed.
    #[serde(with = "humantime_serde")]
    pub stability_window: Duration,
    /// Tracked messages older than this without converging are flagged.
    #[serde(with = "humantime_serde")]
    pub max_convergence_time: Duration,
    /// Heartbeat inter-arrival samples retained per peer.
    pub max_sample_size: usize,
    /// Floor for the sample standard deviation used in phi.
    #[serde(with = "humantime_serde")]
    pub min_std_deviation: Duration,
    /// Budget for any single point-to-point send.
    #[serde(with = "humantime_serde")]
    pub send_timeout: Duration,
    /// Strategy applied to genuinely concurrent writes.
    pub conflict_resolution: ConflictStrategy,
    /// Enables the adaptive phi-threshold routine.
    pub adaptive_threshold: bool,
    /// Peers contacted at startup, as `id@host:port` or bare `host:port`.
    pub seed_peers: Vec<String>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            push_fanout: 3,
            pull_fanout: 3,
            gossip_interval: Duration::from_secs(1),
            anti_entropy_interval: Duration::from_secs(10),
            max_message_age: Duration::from_secs(30),
            max_rumor_age: Duration::from_secs(300),
            retransmission_probability: 0.6,
            max_peers: 50,
            min_peers: 1,
            peer_timeout: Duration::from_secs(60),
            phi_threshold: 8.0,
            suspicion_multiplier: 2.0,
            heartbeat_interval: Duration::from_secs(1),
            convergence_threshold: 0.95,
            stability_window: Duration::from_secs(60),
            max_convergence_time: Duration::from_secs(30),
            max_sample_size: 100,
            min_std_deviation: Duration::from_millis(100),
            send_timeout: Duration::from_millis(500),
            conflict_resolution: ConflictStrategy::LastWriterWins,
            adaptive_threshold: false,
            seed_peers: Vec::new(),
        }
    }
}

impl GossipConfig {
    /// Check every tunable, failing fast on the first invalid value.
    pub fn validate(&self) -> Result<(), GossipError> {
        for (name, interval) in [
            ("gossip_interval", self.gossip_interval),
            ("anti_entropy_interval", self.anti_entropy_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("peer_timeout", self.peer_timeout),
            ("max_rumor_age", self.max_rumor_age),
            ("max_message_age", self.max_message_age),
            ("send_timeout", self.send_timeout),
            ("stability_window", self.stability_window),
            ("max_convergence_time", self.max_convergence_time),
        ] {
            if interval.is_zero() {
                return Err(GossipError::Configuration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.push_fanout == 0 || self.pull_fanout == 0 {
            return Err(GossipError::Configuration(
                "push_fanout and pull_fanout must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retransmission_probability) {
            return Err(GossipError::Configuration(format!(
                "retransmission_probability {} is outside [0, 1]",
                self.retransmission_probability
            )));
        }
        if !(0.0..=1.0).contains(&self.convergence_threshold) || self.convergence_threshold == 0.0 {
            return Err(GossipError::Configuration(format!(
                "convergence_threshold {} is outside (0, 1]",
                self.convergence_threshold
            )));
        }
        if self.max_peers == 0 || self.max_peers < self.min_peers {
            return Err(GossipError::Configuration(format!(
                "max_peers {} must be non-zero and at least min_peers {}",
                self.max_peers, self.min_peers
            )));
        }
        if !self.phi_threshold.is_finite() || self.phi_threshold <= 0.0 {
            return Err(GossipError::Configuration(format!(
                "phi_threshold {} must be a positive finite value",
                self.phi_threshold
            )));
        }
        if !self.suspicion_multiplier.is_finite() || self.suspicion_multiplier < 1.0 {
            return Err(GossipError::Configuration(format!(
                "suspicion_multiplier {} must be at least 1.0",
                self.suspicion_multiplier
            )));
        }
        if self.max_sample_size < 2 {
            return Err(GossipError::Configuration(
                "max_sample_size must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

/// Policy applied when two writes to the same key are causally concurrent.
///
/// Every strategy is deterministic so that replicas resolving the same pair
/// independently converge on the same winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Higher wall-clock timestamp wins; ties go to the larger node id.
    #[default]
    LastWriterWins,
    /// Higher per-key version counter wins.
    HighestVersion,
    /// Lexicographically larger node id wins unconditionally.
    NodePriority,
    /// Structural merge of JSON values, falling back to last-writer-wins.
    Merge,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::LastWriterWins => "last-writer-wins",
            Self::HighestVersion => "highest-version",
            Self::NodePriority => "node-priority",
            Self::Merge => "merge",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn defaults_pass_validation() {
        GossipConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = GossipConfig {
            gossip_interval: Duration::ZERO,
            ..GossipConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(GossipError::Configuration(_))
        ));
    }

    #[test]
    fn probability_outside_unit_range_is_rejected() {
        let config = GossipConfig {
            retransmission_probability: 1.5,
            ..GossipConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn fanout_of_zero_is_rejected() {
        let config = GossipConfig {
            push_fanout: 0,
            ..GossipConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn strategy_names_use_kebab_case() {
        let json = serde_json::to_string(&ConflictStrategy::LastWriterWins).unwrap();
        assert_eq!(json, "\"last-writer-wins\"");
        let parsed: ConflictStrategy = serde_json::from_str("\"node-priority\"").unwrap();
        assert_eq!(parsed, ConflictStrategy::NodePriority);
    }

    #[test]
    fn durations_parse_from_humantime_strings() {
        let config: GossipConfig =
            serde_json::from_str(r#"{"gossip_interval": "250ms", "peer_timeout": "2m"}"#).unwrap();
        assert_eq!(config.gossip_interval, Duration::from_millis(250));
        assert_eq!(config.peer_timeout, Duration::from_secs(120));
    }
}
