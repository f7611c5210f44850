//! Unified decision envelope for selector outputs.
//!
//! A portfolio round wants a single, audit-friendly record of a policy
//! decision that can be:
//! - logged (debugging / monitoring)
//! - replayed (offline evaluation)
//! - recorded alongside the eventual `RunRecord`
//!
//! This module provides a small `Decision` struct and a typed `DecisionNote`
//! list that policies attach to explain "why this choice happened".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Which policy produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionPolicy {
    Ucb1,
    Thompson,
    Exp3,
}

/// Audit-friendly notes attached to a decision.
///
/// Notes are intentionally small, typed, and stable. Prefer adding new
/// variants over changing existing semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DecisionNote {
    /// The chosen arm had zero pulls (cold-start sweep).
    ExploreFirst,

    /// Policy chose deterministically (argmax of UCB scores, stable
    /// tie-breaks).
    DeterministicChoice,

    /// Policy sampled per-arm posteriors and chose the max.
    SampledPosteriorMax,

    /// Policy sampled from a probability distribution to choose an arm.
    SampledFromDistribution,

    /// Transferred priors were seeded before this decision.
    PriorSeeded { arms: Vec<String> },
}

/// A single selector decision in a unified envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    /// The policy that produced this decision.
    pub policy: DecisionPolicy,
    /// The selected arm id.
    pub chosen: String,
    /// Optional per-arm probabilities (when the policy has a distribution).
    pub probs: Option<BTreeMap<String, f64>>,
    /// Audit notes describing why this choice happened.
    pub notes: Vec<DecisionNote>,
}
