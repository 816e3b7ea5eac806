//! Exploration policies.
//!
//! A [`Policy`] proposes an action for a context. The
//! [`EpsilonGreedyExplorer`] follows that proposal most of the time and picks a
//! uniformly random action with probability `epsilon`, reporting the
//! probability of the action it returned so rewards can be weighted later.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Context passed to the decision engine for a single storefront request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MartContext {
    /// Free-form feature string (e.g. `"category=shoes;device=mobile"`).
    pub features: String,
}

impl MartContext {
    pub fn new(features: impl Into<String>) -> Self {
        Self {
            features: features.into(),
        }
    }
}

impl fmt::Display for MartContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.features)
    }
}

/// Chooses a 1-based action id for a context.
pub trait Policy<C>: Send + Sync {
    fn choose_action(&self, ctx: &C) -> u32;
}

/// Policy that always returns the same configured action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedActionPolicy {
    action: u32,
}

impl FixedActionPolicy {
    pub fn new(action: u32) -> Self {
        Self { action }
    }

    pub fn action(&self) -> u32 {
        self.action
    }
}

impl<C> Policy<C> for FixedActionPolicy {
    fn choose_action(&self, _ctx: &C) -> u32 {
        self.action
    }
}

/// The outcome of one exploration step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// The chosen 1-based action.
    pub action: u32,
    /// Probability with which the explorer picks this action for the context.
    pub probability: f32,
}

/// Epsilon-greedy exploration around a default policy.
#[derive(Debug, Clone)]
pub struct EpsilonGreedyExplorer<P> {
    policy: P,
    epsilon: f32,
    action_count: u32,
}

impl<P> EpsilonGreedyExplorer<P> {
    /// Creates a new explorer.
    ///
    /// `epsilon` is clamped to `[0, 1]`; non-finite values disable exploration.
    pub fn new(policy: P, epsilon: f32, action_count: u32) -> Self {
        let clamped = if epsilon.is_finite() {
            epsilon.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if clamped != epsilon {
            tracing::warn!(epsilon, clamped, "epsilon out of range, clamping");
        }
        Self {
            policy,
            epsilon: clamped,
            action_count,
        }
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn action_count(&self) -> u32 {
        self.action_count
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Picks an action for `ctx` using the supplied random source.
    pub fn choose<C, R>(&self, ctx: &C, rng: &mut R) -> Decision
    where
        P: Policy<C>,
        R: Rng + ?Sized,
    {
        let default_action = self.policy.choose_action(ctx);
        if self.action_count == 0 {
            return Decision {
                action: default_action,
                probability: 1.0,
            };
        }

        let action = if rng.gen::<f32>() < self.epsilon {
            rng.gen_range(1..=self.action_count)
        } else {
            default_action
        };

        let base = self.epsilon / self.action_count as f32;
        let probability = if action == default_action {
            1.0 - self.epsilon + base
        } else {
            base
        };

        Decision {
            action,
            probability,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn zero_epsilon_always_follows_policy() {
        let explorer = EpsilonGreedyExplorer::new(FixedActionPolicy::new(3), 0.0, 5);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let decision = explorer.choose(&MartContext::new("x"), &mut rng);
            assert_eq!(decision.action, 3);
            assert!((decision.probability - 1.0).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn full_epsilon_stays_within_action_range() {
        let explorer = EpsilonGreedyExplorer::new(FixedActionPolicy::new(1), 1.0, 4);
        let mut rng = StdRng::seed_from_u64(42);
        let mut seen = [false; 4];
        for _ in 0..500 {
            let decision = explorer.choose(&MartContext::default(), &mut rng);
            assert!((1..=4).contains(&decision.action));
            seen[(decision.action - 1) as usize] = true;
        }
        assert!(seen.iter().all(|s| *s), "expected every action at least once");
    }

    #[test]
    fn probability_of_non_default_action_is_uniform_share() {
        let explorer = EpsilonGreedyExplorer::new(FixedActionPolicy::new(1), 0.4, 4);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            let decision = explorer.choose(&MartContext::default(), &mut rng);
            if decision.action == 1 {
                assert!((decision.probability - 0.7).abs() < 1e-6);
            } else {
                assert!((decision.probability - 0.1).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn epsilon_is_clamped() {
        let explorer = EpsilonGreedyExplorer::new(FixedActionPolicy::new(1), 3.5, 2);
        assert_eq!(explorer.epsilon(), 1.0);
        let explorer = EpsilonGreedyExplorer::new(FixedActionPolicy::new(1), f32::NAN, 2);
        assert_eq!(explorer.epsilon(), 0.0);
    }
}
