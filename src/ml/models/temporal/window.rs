//! Sequence Windows
//!
//! Trailing windows over a ticker's feature vectors. A window always ends at
//! the point being scored, so it never reads ahead of that point.

use crate::ml::features::FeatureVector;

/// The `length` vectors ending at `position` (inclusive), if that much history exists.
pub fn trailing_window(
    vectors: &[FeatureVector],
    position: usize,
    length: usize,
) -> Option<&[FeatureVector]> {
    if length == 0 || position >= vectors.len() || position + 1 < length {
        return None;
    }
    Some(&vectors[position + 1 - length..=position])
}

/// Whether any vector in the window carries zero-dispersion guard values
pub fn has_quiescent(window: &[FeatureVector]) -> bool {
    window.iter().any(|fv| fv.quiescent)
}

/// All full windows free of quiescent vectors, oldest first
pub fn clean_windows(
    vectors: &[FeatureVector],
    length: usize,
) -> impl Iterator<Item = &[FeatureVector]> {
    vectors
        .windows(length.max(1))
        .filter(move |w| w.len() == length && !has_quiescent(w))
}
