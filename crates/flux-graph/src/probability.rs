//! Probability-based routing
//!
//! A probability node names a distribution (`cache_hit_rate`,
//! `success_rate`, ...) and a rate. Each evaluation draws one uniform
//! sample in [0,1) from the graph's seedable PRNG: draws below the rate
//! produce the positive outcome name, the rest the negative one. The
//! node's condition map then routes the outcome name to a destination.

use flux_common::{SimError, SimResult};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration of a probability-routing node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityConfig {
    /// Distribution name, e.g. `cache_hit_rate`
    pub distribution: String,
    /// Probability of the positive outcome, in [0,1]
    pub rate: f64,
    /// Explicit (positive, negative) outcome names for distributions
    /// without a built-in mapping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcomes: Option<(String, String)>,
}

impl ProbabilityConfig {
    /// Outcome names for this distribution.
    pub fn outcome_pair(&self) -> SimResult<(&str, &str)> {
        if let Some((hit, miss)) = &self.outcomes {
            return Ok((hit, miss));
        }
        match self.distribution.as_str() {
            "cache_hit_rate" => Ok(("cache_hit", "cache_miss")),
            "success_rate" => Ok(("success", "failure")),
            "error_rate" => Ok(("failure", "success")),
            other => Err(SimError::Config(format!(
                "probability distribution {other} has no outcome mapping; set `outcomes`"
            ))),
        }
    }

    /// Outcome for an already-drawn uniform sample in [0,1).
    pub fn outcome_for(&self, sample: f64) -> SimResult<&str> {
        if !(0.0..=1.0).contains(&self.rate) {
            return Err(SimError::Config(format!(
                "probability rate {} out of [0,1] for {}",
                self.rate, self.distribution
            )));
        }
        let (hit, miss) = self.outcome_pair()?;
        Ok(if sample < self.rate { hit } else { miss })
    }

    /// Draw one sample and return the outcome name.
    pub fn draw<R: Rng>(&self, rng: &mut R) -> SimResult<&str> {
        self.outcome_for(rng.gen_range(0.0..1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(rate: f64) -> ProbabilityConfig {
        ProbabilityConfig {
            distribution: "cache_hit_rate".into(),
            rate,
            outcomes: None,
        }
    }

    #[test]
    fn test_outcome_pairs() {
        assert_eq!(config(0.5).outcome_pair().unwrap(), ("cache_hit", "cache_miss"));
        let custom = ProbabilityConfig {
            distribution: "fraud_rate".into(),
            rate: 0.1,
            outcomes: Some(("fraud".into(), "clean".into())),
        };
        assert_eq!(custom.outcome_pair().unwrap(), ("fraud", "clean"));
        let unknown = ProbabilityConfig {
            distribution: "fraud_rate".into(),
            rate: 0.1,
            outcomes: None,
        };
        assert!(unknown.outcome_pair().is_err());
    }

    #[test]
    fn test_draw_is_replayable() {
        let cfg = config(0.8);
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            assert_eq!(cfg.draw(&mut a).unwrap(), cfg.draw(&mut b).unwrap());
        }
    }

    #[test]
    fn test_draw_converges_to_rate() {
        let cfg = config(0.8);
        let mut rng = StdRng::seed_from_u64(7);
        let hits = (0..10_000)
            .filter(|_| cfg.draw(&mut rng).unwrap() == "cache_hit")
            .count();
        let ratio = hits as f64 / 10_000.0;
        assert!((ratio - 0.8).abs() < 0.02, "ratio {ratio} too far from 0.8");
    }

    #[test]
    fn test_outcome_for_sample() {
        let cfg = config(0.8);
        assert_eq!(cfg.outcome_for(0.5).unwrap(), "cache_hit");
        assert_eq!(cfg.outcome_for(0.9).unwrap(), "cache_miss");
        assert_eq!(cfg.outcome_for(0.8).unwrap(), "cache_miss");
    }

    #[test]
    fn test_degenerate_rates() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            assert_eq!(config(1.0).draw(&mut rng).unwrap(), "cache_hit");
            assert_eq!(config(0.0).draw(&mut rng).unwrap(), "cache_miss");
        }
        assert!(config(1.5).draw(&mut rng).is_err());
    }
}
