use ndarray::Array1;
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::matrix::RatingMatrix;
use crate::types::{Recommendation, TitleId};

/// Similarity-weighted estimate of every title from a set of peer rows.
///
/// `peers` holds `(row, similarity)` pairs. Returns `None` when the weights sum
/// to zero, which leaves every estimate undefined.
pub fn weighted_scores(peers: &[(usize, f64)], matrix: &RatingMatrix) -> Option<Array1<f64>> {
    let total_weight: f64 = peers.iter().map(|(_, similarity)| similarity).sum();
    if total_weight == 0.0 || !total_weight.is_finite() {
        return None;
    }

    let (_, cols) = matrix.dim();
    let mut scores = Array1::<f64>::zeros(cols);
    for (row, similarity) in peers {
        scores.scaled_add(*similarity, &matrix.row(*row));
    }
    scores /= total_weight;
    Some(scores)
}

/// Ranks titles by their weighted estimate and returns up to `size` of them
/// that are not in `seen`.
///
/// `None` means no recommendation is possible for this author: the peers'
/// similarities sum to zero. Equal estimates keep column order.
pub fn aggregate(
    peers: &[(usize, f64)],
    matrix: &RatingMatrix,
    seen: &HashSet<TitleId>,
    size: usize,
) -> Option<Recommendation> {
    let scores = weighted_scores(peers, matrix)?;

    let mut ranking: Vec<(usize, f64)> = scores.iter().copied().enumerate().collect();
    ranking.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let title_ids = matrix.title_ids();
    let recommendation = ranking
        .into_iter()
        .map(|(col, _)| title_ids[col])
        .filter(|title_id| !seen.contains(title_id))
        .take(size)
        .collect();
    Some(recommendation)
}
