//! Arm registry and typed configuration spaces.
//!
//! The registry is an explicit value constructed once at process start and
//! passed by reference into the portfolio manager — there is no hidden global
//! lookup. Registration order doubles as the deterministic tie-break order
//! everywhere an ordering over arms is needed.
//!
//! Configurations are plain `Vec<f64>` vectors aligned to an arm's
//! [`ConfigSpace`]: continuous parameters hold the raw value, integer
//! parameters hold a rounded value, choice parameters hold an option index.
//! [`ConfigSpace::validate`] rejects malformed vectors before anything is
//! dispatched.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{PortfolioError, Result};

/// Kind of a single tunable parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamKind {
    /// Continuous value in `[lo, hi]`.
    Continuous { lo: f64, hi: f64 },
    /// Integer value in `[lo, hi]` (stored as an integral `f64`).
    Integer { lo: i64, hi: i64 },
    /// Categorical choice (stored as an option index).
    Choice { options: Vec<String> },
}

/// A named parameter in an arm's configuration space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
}

impl ParamSpec {
    pub fn continuous(name: &str, lo: f64, hi: f64) -> Self {
        Self {
            name: name.to_string(),
            kind: ParamKind::Continuous { lo, hi },
        }
    }

    pub fn integer(name: &str, lo: i64, hi: i64) -> Self {
        Self {
            name: name.to_string(),
            kind: ParamKind::Integer { lo, hi },
        }
    }

    pub fn choice(name: &str, options: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind: ParamKind::Choice {
                options: options.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    fn check(&self, value: f64) -> std::result::Result<(), String> {
        if !value.is_finite() {
            return Err(format!("parameter '{}' is not finite", self.name));
        }
        match &self.kind {
            ParamKind::Continuous { lo, hi } => {
                if value < *lo || value > *hi {
                    return Err(format!(
                        "parameter '{}' = {} outside [{}, {}]",
                        self.name, value, lo, hi
                    ));
                }
            }
            ParamKind::Integer { lo, hi } => {
                if value.fract() != 0.0 {
                    return Err(format!("parameter '{}' = {} is not integral", self.name, value));
                }
                let v = value as i64;
                if v < *lo || v > *hi {
                    return Err(format!(
                        "parameter '{}' = {} outside [{}, {}]",
                        self.name, v, lo, hi
                    ));
                }
            }
            ParamKind::Choice { options } => {
                if value.fract() != 0.0 || value < 0.0 || (value as usize) >= options.len() {
                    return Err(format!(
                        "parameter '{}' = {} is not a valid option index (0..{})",
                        self.name,
                        value,
                        options.len()
                    ));
                }
            }
        }
        Ok(())
    }

    /// Draw a uniform value for this parameter.
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match &self.kind {
            ParamKind::Continuous { lo, hi } => {
                if hi > lo {
                    rng.random_range(*lo..=*hi)
                } else {
                    *lo
                }
            }
            ParamKind::Integer { lo, hi } => {
                if hi > lo {
                    rng.random_range(*lo..=*hi) as f64
                } else {
                    *lo as f64
                }
            }
            ParamKind::Choice { options } => {
                if options.len() > 1 {
                    rng.random_range(0..options.len()) as f64
                } else {
                    0.0
                }
            }
        }
    }
}

/// Ordered parameter space of one arm.
///
/// An empty space is valid: the arm takes no configuration and its
/// configuration vector is always `[]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSpace {
    pub params: Vec<ParamSpec>,
}

impl ConfigSpace {
    pub fn new(params: Vec<ParamSpec>) -> Self {
        Self { params }
    }

    /// Number of parameters (the dimensionality of configuration vectors).
    pub fn dim(&self) -> usize {
        self.params.len()
    }

    /// Validate a configuration vector against this space.
    pub fn validate(&self, arm: &str, config: &[f64]) -> Result<()> {
        if config.len() != self.params.len() {
            return Err(PortfolioError::InvalidConfiguration {
                arm: arm.to_string(),
                reason: format!(
                    "expected {} parameters, got {}",
                    self.params.len(),
                    config.len()
                ),
            });
        }
        for (spec, &value) in self.params.iter().zip(config) {
            spec.check(value).map_err(|reason| PortfolioError::InvalidConfiguration {
                arm: arm.to_string(),
                reason,
            })?;
        }
        Ok(())
    }

    /// Draw a uniform configuration vector from this space.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        self.params.iter().map(|p| p.sample(rng)).collect()
    }
}

/// A registered candidate solving method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodArm {
    /// Stable identifier (selection / tie-break key).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// The arm's tunable parameter space.
    pub space: ConfigSpace,
}

impl MethodArm {
    pub fn new(id: &str, name: &str, space: ConfigSpace) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            space,
        }
    }
}

/// Explicit arm registry.
///
/// Deregistering an arm keeps its entry (historical records stay resolvable)
/// but removes it from [`Registry::arms_in_order`], so future selection
/// excludes it.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    arms: Vec<MethodArm>,
    retired: Vec<bool>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an arm. Fails with [`PortfolioError::DuplicateArm`] if the id
    /// is already present (retired or not).
    pub fn register(&mut self, arm: MethodArm) -> Result<()> {
        if self.arms.iter().any(|a| a.id == arm.id) {
            return Err(PortfolioError::DuplicateArm(arm.id));
        }
        self.arms.push(arm);
        self.retired.push(false);
        Ok(())
    }

    /// Retire an arm from future selection. History referencing it remains
    /// valid.
    pub fn deregister(&mut self, id: &str) -> Result<()> {
        let idx = self
            .arms
            .iter()
            .position(|a| a.id == id)
            .ok_or_else(|| PortfolioError::UnknownArm(id.to_string()))?;
        self.retired[idx] = true;
        Ok(())
    }

    /// Look up an arm by id, including retired arms.
    pub fn get(&self, id: &str) -> Option<&MethodArm> {
        self.arms.iter().find(|a| a.id == id)
    }

    /// True if the id was ever registered.
    pub fn contains(&self, id: &str) -> bool {
        self.arms.iter().any(|a| a.id == id)
    }

    /// Active arm ids in registration order.
    pub fn arms_in_order(&self) -> Vec<String> {
        self.arms
            .iter()
            .zip(&self.retired)
            .filter(|(_, &retired)| !retired)
            .map(|(a, _)| a.id.clone())
            .collect()
    }

    /// Registration index of an arm (tie-break order), including retired arms.
    pub fn registration_index(&self, id: &str) -> Option<usize> {
        self.arms.iter().position(|a| a.id == id)
    }

    /// Number of active arms.
    pub fn active_len(&self) -> usize {
        self.retired.iter().filter(|&&r| !r).count()
    }

    /// Validate a configuration against an arm's space.
    pub fn validate_config(&self, arm_id: &str, config: &[f64]) -> Result<()> {
        let arm = self
            .get(arm_id)
            .ok_or_else(|| PortfolioError::UnknownArm(arm_id.to_string()))?;
        arm.space.validate(arm_id, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn space() -> ConfigSpace {
        ConfigSpace::new(vec![
            ParamSpec::continuous("temp", 0.1, 10.0),
            ParamSpec::integer("iters", 1, 100),
            ParamSpec::choice("schedule", &["linear", "geometric"]),
        ])
    }

    #[test]
    fn validate_accepts_in_range_config() {
        assert!(space().validate("sa", &[1.5, 50.0, 1.0]).is_ok());
    }

    #[test]
    fn validate_rejects_wrong_arity() {
        let err = space().validate("sa", &[1.5, 50.0]).unwrap_err();
        assert!(matches!(err, PortfolioError::InvalidConfiguration { .. }));
    }

    #[test]
    fn validate_rejects_out_of_bounds_and_non_integral() {
        assert!(space().validate("sa", &[99.0, 50.0, 1.0]).is_err());
        assert!(space().validate("sa", &[1.5, 50.5, 1.0]).is_err());
        assert!(space().validate("sa", &[1.5, 50.0, 2.0]).is_err());
        assert!(space().validate("sa", &[f64::NAN, 50.0, 1.0]).is_err());
    }

    #[test]
    fn sample_is_always_valid() {
        let sp = space();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let c = sp.sample(&mut rng);
            assert!(sp.validate("sa", &c).is_ok(), "sampled config invalid: {:?}", c);
        }
    }

    #[test]
    fn registry_orders_and_retires() {
        let mut reg = Registry::new();
        reg.register(MethodArm::new("sa", "simulated annealing", space()))
            .unwrap();
        reg.register(MethodArm::new("ga", "genetic search", ConfigSpace::default()))
            .unwrap();
        assert_eq!(reg.arms_in_order(), vec!["sa".to_string(), "ga".to_string()]);

        reg.deregister("sa").unwrap();
        assert_eq!(reg.arms_in_order(), vec!["ga".to_string()]);
        // History stays resolvable.
        assert!(reg.get("sa").is_some());
        assert_eq!(reg.registration_index("sa"), Some(0));
    }

    #[test]
    fn registry_rejects_duplicates_and_unknown() {
        let mut reg = Registry::new();
        reg.register(MethodArm::new("sa", "sa", ConfigSpace::default()))
            .unwrap();
        assert!(matches!(
            reg.register(MethodArm::new("sa", "again", ConfigSpace::default())),
            Err(PortfolioError::DuplicateArm(_))
        ));
        assert!(matches!(
            reg.deregister("nope"),
            Err(PortfolioError::UnknownArm(_))
        ));
    }
}
