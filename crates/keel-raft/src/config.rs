//! Node configuration.
//!
//! Timing is the safety-critical part: the heartbeat period must stay below
//! the election timeout floor or followers will depose a healthy leader, so
//! the relationship is validated once at construction and never re-checked at
//! runtime.

use std::time::Duration;

use rand::Rng;

use crate::{NodeId, RaftError, Result};

/// Configuration consumed by a consensus engine.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's id. Must be unique across the cluster.
    pub id: NodeId,
    /// Election timeout floor; the actual timeout adds random jitter.
    pub election_timeout: Duration,
    /// How often a leader sends heartbeats, even with no data to replicate.
    pub heartbeat_period: Duration,
    /// Per-call deadline for vote RPCs.
    pub vote_rpc_timeout: Duration,
    /// Per-call deadline for append-entries RPCs.
    pub append_rpc_timeout: Duration,
}

impl RaftConfig {
    /// Creates a configuration with default timing for the given node id.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            election_timeout: Duration::from_millis(5000),
            heartbeat_period: Duration::from_millis(500),
            vote_rpc_timeout: Duration::from_millis(100),
            append_rpc_timeout: Duration::from_millis(100),
        }
    }

    /// Checks the timing relationship between heartbeats and elections.
    ///
    /// Heartbeats must be sent more often than elections are run; a
    /// configuration violating that must not be allowed to start.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_period >= self.election_timeout {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat period {:?} must be shorter than election timeout {:?}",
                self.heartbeat_period, self.election_timeout
            )));
        }
        Ok(())
    }

    /// Returns a randomized election timeout: `floor + uniform(0, floor)`.
    ///
    /// The jitter keeps simultaneous candidates from splitting the vote
    /// forever. The randomness source is injected so tests can pin it.
    pub fn next_election_timeout(&self, rng: &mut impl Rng) -> Duration {
        let base = self.election_timeout.as_nanos() as u64;
        self.election_timeout + Duration::from_nanos(rng.gen_range(0..=base))
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RaftConfig::new(1);
        assert!(config.validate().is_ok());
        assert_eq!(config.id, 1);
    }

    #[test]
    fn test_heartbeat_must_beat_election_timeout() {
        let mut config = RaftConfig::new(1);
        config.heartbeat_period = config.election_timeout;
        assert!(matches!(
            config.validate(),
            Err(RaftError::InvalidConfig(_))
        ));

        config.heartbeat_period = config.election_timeout + Duration::from_millis(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_election_timeout_jitter_bounds() {
        let config = RaftConfig::new(1);
        let mut rng = SmallRng::seed_from_u64(7);

        for _ in 0..100 {
            let timeout = config.next_election_timeout(&mut rng);
            assert!(timeout >= config.election_timeout);
            assert!(timeout <= config.election_timeout * 2);
        }
    }

    #[test]
    fn test_jitter_is_deterministic_for_a_seed() {
        let config = RaftConfig::new(1);
        let a: Vec<_> = {
            let mut rng = SmallRng::seed_from_u64(42);
            (0..8).map(|_| config.next_election_timeout(&mut rng)).collect()
        };
        let b: Vec<_> = {
            let mut rng = SmallRng::seed_from_u64(42);
            (0..8).map(|_| config.next_election_timeout(&mut rng)).collect()
        };
        assert_eq!(a, b);
    }
}
