//! Feature-space helpers: extraction interface and similarity metrics.
//!
//! Concrete feature extraction is a collaborator concern — domain adapters
//! know what "number of cities" or "matrix sparsity" means. The engine only
//! needs a fixed-length vector and a similarity metric over it.

use serde::{Deserialize, Serialize};

use crate::ProblemInstance;

/// Maps a problem instance to a fixed-length numeric feature vector.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, problem: &ProblemInstance) -> Vec<f64>;
}

/// Passthrough extractor: the instance's own feature vector.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityExtractor;

impl FeatureExtractor for IdentityExtractor {
    fn extract(&self, problem: &ProblemInstance) -> Vec<f64> {
        problem.features.clone()
    }
}

/// Distance metric used for nearest-neighbor lookups over feature vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Cosine similarity (default).
    #[default]
    Cosine,
    /// Similarity derived from Euclidean distance: `1 / (1 + d)`.
    Euclidean,
}

impl DistanceMetric {
    /// Similarity in `[0, 1]`-ish range; higher is more similar.
    ///
    /// Mismatched lengths and zero-norm vectors yield 0 similarity rather
    /// than an error.
    pub fn similarity(&self, a: &[f64], b: &[f64]) -> f64 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }
        match self {
            DistanceMetric::Cosine => {
                let mut dot = 0.0;
                let mut na = 0.0;
                let mut nb = 0.0;
                for (&x, &y) in a.iter().zip(b) {
                    dot += x * y;
                    na += x * x;
                    nb += y * y;
                }
                let denom = na.sqrt() * nb.sqrt();
                if denom > 0.0 && denom.is_finite() {
                    (dot / denom).clamp(-1.0, 1.0)
                } else {
                    0.0
                }
            }
            DistanceMetric::Euclidean => {
                let d2: f64 = a.iter().zip(b).map(|(&x, &y)| (x - y) * (x - y)).sum();
                let d = d2.sqrt();
                if d.is_finite() {
                    1.0 / (1.0 + d)
                } else {
                    0.0
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = [0.3, 0.5, 0.1];
        assert!((DistanceMetric::Cosine.similarity(&v, &v) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(DistanceMetric::Cosine.similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn zero_norm_and_length_mismatch_yield_zero() {
        assert_eq!(DistanceMetric::Cosine.similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(DistanceMetric::Cosine.similarity(&[1.0], &[1.0, 1.0]), 0.0);
        assert_eq!(DistanceMetric::Euclidean.similarity(&[], &[]), 0.0);
    }

    #[test]
    fn identity_extractor_passes_features_through() {
        use crate::ObjectiveSense;
        let p = ProblemInstance::new("p", "qap", vec![0.2, 0.8], ObjectiveSense::Minimize);
        assert_eq!(IdentityExtractor.extract(&p), vec![0.2, 0.8]);
    }

    #[test]
    fn euclidean_similarity_decreases_with_distance() {
        let a = [0.0, 0.0];
        let near = DistanceMetric::Euclidean.similarity(&a, &[0.1, 0.1]);
        let far = DistanceMetric::Euclidean.similarity(&a, &[5.0, 5.0]);
        assert!(near > far);
    }
}
