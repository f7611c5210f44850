//! Error taxonomy for the portfolio engine.
//!
//! The split follows the blast radius of each failure:
//!
//! - Per-round failures ([`PortfolioError::MethodExecutionFailure`],
//!   [`PortfolioError::TimedOut`], [`PortfolioError::SurrogateFitFailure`])
//!   terminate in a `RunRecord` status and a floor reward — they never abort
//!   the portfolio loop.
//! - [`PortfolioError::StoreUnavailable`] is retried with bounded backoff; if
//!   retries exhaust, the session proceeds on in-memory statistics and is
//!   flagged degraded.
//! - Everything else is a caller error rejected before dispatch.

use thiserror::Error;

/// Errors surfaced by the portfolio engine.
#[derive(Debug, Error)]
pub enum PortfolioError {
    /// A configuration vector does not fit an arm's parameter space.
    /// Rejected before dispatch.
    #[error("invalid configuration for arm '{arm}': {reason}")]
    InvalidConfiguration { arm: String, reason: String },

    /// A reward fell outside the selector's configured range.
    #[error("invalid reward {reward}: expected finite value in [{lo}, {hi}]")]
    InvalidReward { reward: f64, lo: f64, hi: f64 },

    /// An arm id was referenced that is not (and never was) registered.
    #[error("unknown arm '{0}'")]
    UnknownArm(String),

    /// An arm id was registered twice.
    #[error("arm '{0}' is already registered")]
    DuplicateArm(String),

    /// A solver returned an error or panicked.
    #[error("method execution failed for arm '{arm}': {reason}")]
    MethodExecutionFailure { arm: String, reason: String },

    /// A solver exceeded the shared deadline and was cancelled.
    #[error("arm '{0}' timed out")]
    TimedOut(String),

    /// GP covariance factorization failed after jitter escalation.
    /// Surrogate proposals fall back to the bandit-only path for the round.
    #[error("surrogate fit failed: covariance not positive-definite after {escalations} jitter escalations")]
    SurrogateFitFailure { escalations: u32 },

    /// The persistence backend is unavailable past its retry budget.
    #[error("performance store unavailable: {0}")]
    StoreUnavailable(String),

    /// No active arms to select from.
    #[error("portfolio has no active arms")]
    EmptyPortfolio,

    /// A session budget with neither a round count nor a deadline.
    #[error("invalid session budget: {0}")]
    InvalidBudget(String),

    /// A session worker terminated abnormally (e.g. panicked).
    #[error("session failed: {0}")]
    SessionFailure(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PortfolioError>;
