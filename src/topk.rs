use ndarray::ArrayView1;
use std::cmp::Ordering;

/// Indices of the `k` largest similarities in `row`, best first.
///
/// The entry at `self_index` and anything outside [-1, 1] (the diagonal
/// sentinel, NaN) never appear. Equal values keep their original index order.
pub fn top_k(row: ArrayView1<'_, f64>, k: usize, self_index: usize) -> Vec<(usize, f64)> {
    if k == 0 {
        return Vec::new();
    }

    let mut candidates: Vec<(usize, f64)> = row
        .iter()
        .enumerate()
        .filter(|(index, value)| *index != self_index && (-1.0..=1.0).contains(*value))
        .map(|(index, value)| (index, *value))
        .collect();

    // Stable sort keeps ascending index order among ties.
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    candidates.truncate(k);
    candidates
}
