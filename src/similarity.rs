use futures::{stream, StreamExt};
use ndarray::{Array1, Array2, ArrayView1, Axis as NdAxis};
use rayon::prelude::*;
use std::collections::HashSet;
use tracing::debug;

use crate::cache::{CacheStats, PairwiseCache};
use crate::matrix::{RatingMatrix, NO_DATA};
use crate::types::{Axis, OverlapPolicy};

/// Diagonal marker of a similarity matrix. Strictly below any correlation.
pub const DIAGONAL_SENTINEL: f64 = -2.0;

/// Pearson correlation of two equally long vectors.
///
/// Returns `0.0` when fewer than two positions take part or when either side
/// has no variance over them.
pub fn pearson(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>, policy: OverlapPolicy) -> f64 {
    debug_assert_eq!(a.len(), b.len());

    let pairs: Vec<(f64, f64)> = match policy {
        OverlapPolicy::Sparse => a
            .iter()
            .zip(b.iter())
            .filter(|(x, y)| **x > NO_DATA && **y > NO_DATA)
            .map(|(x, y)| (*x, *y))
            .collect(),
        OverlapPolicy::Dense => a.iter().zip(b.iter()).map(|(x, y)| (*x, *y)).collect(),
    };

    if pairs.len() < 2 {
        return 0.0;
    }

    let n = pairs.len() as f64;
    let mean_a = pairs.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_b = pairs.iter().map(|(_, y)| y).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in &pairs {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    if var_a == 0.0 || var_b == 0.0 {
        return 0.0;
    }

    let r = cov / (var_a * var_b).sqrt();
    if r.is_finite() {
        r.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Computes similarities between matrix rows or columns.
pub struct SimilarityEngine {
    policy: OverlapPolicy,
    cache: PairwiseCache,
    pair_concurrency: usize,
}

impl SimilarityEngine {
    pub fn new(policy: OverlapPolicy, cache: PairwiseCache, pair_concurrency: usize) -> Self {
        Self {
            policy,
            cache,
            pair_concurrency: pair_concurrency.max(1),
        }
    }

    pub fn policy(&self) -> OverlapPolicy {
        self.policy
    }

    pub fn cache(&self) -> &PairwiseCache {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Full symmetric similarity matrix along `axis` of an authors x titles matrix.
    ///
    /// Only pairs `i < j` are computed, in parallel; the lower triangle is a
    /// mirror and the diagonal holds [`DIAGONAL_SENTINEL`].
    pub fn similarity_matrix(&self, cells: &Array2<f64>, axis: Axis) -> Array2<f64> {
        similarity_matrix(cells, axis, self.policy)
    }

    /// Similarities of author `row` to every author, the entry for `row` itself
    /// being [`DIAGONAL_SENTINEL`]. Pair values go through the cache, except
    /// pairs with a row in `refresh`, which are recomputed and written back.
    pub async fn author_similarities(
        &self,
        matrix: &RatingMatrix,
        row: usize,
        refresh: &HashSet<usize>,
    ) -> Array1<f64> {
        let ids = matrix.author_ids();
        let own_id = ids[row];
        let own = matrix.row(row);

        let values: Vec<f64> = stream::iter(0..ids.len())
            .map(|other| {
                let own = own.clone();
                async move {
                    if other == row {
                        return DIAGONAL_SENTINEL;
                    }
                    let compute = || pearson(own, matrix.row(other), self.policy);
                    if refresh.contains(&other) {
                        self.cache.refresh(Axis::Author, own_id, ids[other], compute).await
                    } else {
                        self.cache
                            .get_or_compute(Axis::Author, own_id, ids[other], compute)
                            .await
                    }
                }
            })
            .buffered(self.pair_concurrency)
            .collect()
            .await;

        Array1::from(values)
    }
}

/// See [`SimilarityEngine::similarity_matrix`].
pub fn similarity_matrix(cells: &Array2<f64>, axis: Axis, policy: OverlapPolicy) -> Array2<f64> {
    // Entities become rows of `vectors`.
    let vectors = match axis {
        Axis::Author => cells.to_owned(),
        Axis::Title => cells.t().as_standard_layout().into_owned(),
    };
    let n = vectors.nrows();

    let upper: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let lhs = vectors.index_axis(NdAxis(0), i);
            ((i + 1)..n)
                .map(|j| pearson(lhs, vectors.index_axis(NdAxis(0), j), policy))
                .collect()
        })
        .collect();

    let mut sim = Array2::from_elem((n, n), DIAGONAL_SENTINEL);
    for (i, row) in upper.into_iter().enumerate() {
        for (offset, value) in row.into_iter().enumerate() {
            let j = i + 1 + offset;
            sim[[i, j]] = value;
            sim[[j, i]] = value;
        }
    }

    debug!("{} similarity matrix {}x{} computed", axis, n, n);
    sim
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheBackend, MemoryCache};
    use ndarray::{arr1, arr2};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_pearson_perfect_correlation() {
        let a = arr1(&[1.0, 2.0, 3.0, 4.0]);
        let b = arr1(&[2.0, 4.0, 6.0, 8.0]);
        let c = arr1(&[8.0, 6.0, 4.0, 2.0]);
        assert!((pearson(a.view(), b.view(), OverlapPolicy::Dense) - 1.0).abs() < 1e-12);
        assert!((pearson(a.view(), c.view(), OverlapPolicy::Dense) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pearson_is_symmetric() {
        let a = arr1(&[10.0, 6.0, 9.0, 0.0, 3.5]);
        let b = arr1(&[8.4, 5.0, 9.0, 7.0, 1.0]);
        for policy in [OverlapPolicy::Sparse, OverlapPolicy::Dense] {
            assert_eq!(pearson(a.view(), b.view(), policy), pearson(b.view(), a.view(), policy));
        }
    }

    #[test]
    fn test_sparse_needs_two_shared_positions() {
        let a = arr1(&[5.0, 0.0, 3.0]);
        let b = arr1(&[4.0, 2.0, 0.0]);
        assert_eq!(pearson(a.view(), b.view(), OverlapPolicy::Sparse), 0.0);
        assert_ne!(pearson(a.view(), b.view(), OverlapPolicy::Dense), 0.0);
    }

    #[test]
    fn test_sparse_ignores_no_data_positions() {
        let a = arr1(&[1.0, 2.0, 3.0, 0.0]);
        let b = arr1(&[2.0, 4.0, 6.0, 9.0]);
        assert!((pearson(a.view(), b.view(), OverlapPolicy::Sparse) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_constant_vector_is_neutral() {
        let a = arr1(&[3.0, 3.0, 3.0]);
        let b = arr1(&[1.0, 2.0, 3.0]);
        assert_eq!(pearson(a.view(), b.view(), OverlapPolicy::Dense), 0.0);
    }

    #[test]
    fn test_title_similarity_uses_columns() {
        // Rows are authors: [10, 6, 9] and [8.4, 5, 9].
        let cells = arr2(&[[10.0, 6.0, 9.0], [8.4, 5.0, 9.0]]);
        let sim = similarity_matrix(&cells, Axis::Title, OverlapPolicy::Sparse);

        let expected = pearson(
            arr1(&[10.0, 8.4]).view(),
            arr1(&[6.0, 5.0]).view(),
            OverlapPolicy::Sparse,
        );
        assert_eq!(sim.dim(), (3, 3));
        assert_eq!(sim[[0, 1]], expected);
        assert!((expected - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_similarity_matrix_symmetric_with_sentinel_diagonal() {
        let cells = arr2(&[
            [5.0, 3.0, 0.0, 1.0],
            [4.0, 0.0, 4.0, 1.0],
            [1.0, 1.0, 5.0, 5.0],
            [0.0, 1.0, 4.0, 4.0],
            [2.0, 2.0, 2.0, 3.0],
        ]);
        for axis in [Axis::Author, Axis::Title] {
            let sim = similarity_matrix(&cells, axis, OverlapPolicy::Sparse);
            let n = sim.nrows();
            for i in 0..n {
                assert_eq!(sim[[i, i]], DIAGONAL_SENTINEL);
                for j in 0..n {
                    assert_eq!(sim[[i, j]], sim[[j, i]]);
                    if i != j {
                        assert!((-1.0..=1.0).contains(&sim[[i, j]]));
                    }
                }
            }
        }
    }

    #[test]
    fn test_similarity_matrix_is_reproducible() {
        let cells = arr2(&[[5.0, 3.0, 2.0], [4.0, 1.0, 4.0], [1.0, 1.0, 5.0], [2.5, 0.0, 4.0]]);
        let first = similarity_matrix(&cells, Axis::Title, OverlapPolicy::Dense);
        let second = similarity_matrix(&cells, Axis::Title, OverlapPolicy::Dense);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_author_similarities_match_matrix_and_fill_cache() {
        let cells = arr2(&[[5.0, 3.0, 2.0], [4.0, 1.0, 4.0], [1.0, 1.0, 5.0]]);
        let matrix = RatingMatrix::from_parts(cells.clone(), vec![1, 2, 3], vec![10, 20, 30]).unwrap();

        let backend = Arc::new(MemoryCache::new("test".to_string()));
        let cache = PairwiseCache::new(
            Some(backend.clone() as Arc<dyn CacheBackend>),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        );
        let engine = SimilarityEngine::new(OverlapPolicy::Sparse, cache, 4);

        let row = engine.author_similarities(&matrix, 1, &HashSet::new()).await;
        let full = engine.similarity_matrix(&cells, Axis::Author);
        assert_eq!(row, full.row(1).to_owned());
        assert_eq!(backend.len().await, 2);

        let again = engine.author_similarities(&matrix, 0, &HashSet::new()).await;
        assert_eq!(again, full.row(0).to_owned());
        assert_eq!(engine.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_refreshed_rows_bypass_stale_cache_entries() {
        let cells = arr2(&[[5.0, 3.0, 2.0], [4.0, 1.0, 4.0], [1.0, 1.0, 5.0]]);
        let matrix = RatingMatrix::from_parts(cells.clone(), vec![1, 2, 3], vec![10, 20, 30]).unwrap();

        let backend = Arc::new(MemoryCache::new("test".to_string()));
        backend
            .set("author:10:20", 0.123, Duration::from_secs(3600))
            .await
            .unwrap();
        let cache = PairwiseCache::new(
            Some(backend.clone() as Arc<dyn CacheBackend>),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        );
        let engine = SimilarityEngine::new(OverlapPolicy::Sparse, cache, 4);
        let expected = engine.similarity_matrix(&cells, Axis::Author);

        let cached = engine.author_similarities(&matrix, 0, &HashSet::new()).await;
        assert_eq!(cached[1], 0.123);

        let refresh: HashSet<usize> = [1].into_iter().collect();
        let refreshed = engine.author_similarities(&matrix, 0, &refresh).await;
        assert_eq!(refreshed, expected.row(0).to_owned());
        assert_eq!(backend.get("author:10:20").await.unwrap(), Some(expected[[0, 1]]));
    }
}
