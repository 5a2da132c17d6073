//! Vector math behind dominance.

/// Guard against division by zero for null vectors.
pub const EPSILON: f64 = 1e-9;

/// Dot product over the common prefix of `a` and `b`.
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len(), "vector dimension mismatch");
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Euclidean norm.
pub fn norm(a: &[f64]) -> f64 {
    a.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Cosine of the angle between `a` and `b`, in `[-1, 1]` for non-null input.
///
/// A null vector yields 0.
pub fn angular_similarity(a: &[f64], b: &[f64]) -> f64 {
    dot(a, b) / (norm(a) * norm(b) + EPSILON)
}

/// Energy after `dominant` absorbs `weak` at similarity `sim`.
pub fn siphon(dominant: f64, weak: f64, sim: f64, factor: f64) -> f64 {
    dominant + factor * sim * weak
}
