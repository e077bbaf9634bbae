use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::error::AnalyzerError;
use crate::matrix::RatingMatrix;
use crate::types::{AuthorId, TitleId};
use crate::Result;

/// A built rating matrix, and optionally its title similarity matrix, with the
/// time it was built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixSnapshot {
    pub built_at: DateTime<Utc>,
    pub title_ids: Vec<TitleId>,
    pub author_ids: Vec<AuthorId>,
    pub ratings: Array2<f64>,
    pub title_similarity: Option<Array2<f64>>,
}

impl MatrixSnapshot {
    pub fn new(
        matrix: &RatingMatrix,
        title_similarity: Option<&Array2<f64>>,
        built_at: DateTime<Utc>,
    ) -> Self {
        Self {
            built_at,
            title_ids: matrix.title_ids().to_vec(),
            author_ids: matrix.author_ids().to_vec(),
            ratings: matrix.cells().clone(),
            title_similarity: title_similarity.cloned(),
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.built_at
    }

    /// Splits the snapshot into a usable matrix and title similarity matrix.
    pub fn into_parts(self) -> Result<(RatingMatrix, Option<Array2<f64>>)> {
        let titles = self.title_ids.len();
        if let Some(sim) = &self.title_similarity {
            if sim.dim() != (titles, titles) {
                return Err(AnalyzerError::Dimension {
                    expected: format!("{}x{}", titles, titles),
                    actual: format!("{}x{}", sim.nrows(), sim.ncols()),
                });
            }
        }
        let matrix = RatingMatrix::from_parts(self.ratings, self.title_ids, self.author_ids)?;
        Ok((matrix, self.title_similarity))
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// A snapshot younger than the store's maximum age, if one is readable.
    async fn load(&self, now: DateTime<Utc>) -> Option<MatrixSnapshot>;
    async fn save(&self, snapshot: &MatrixSnapshot) -> Result<()>;
}

/// Keeps one snapshot as a JSON file.
pub struct FileSnapshotStore {
    path: PathBuf,
    max_age: Duration,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            path: path.into(),
            max_age,
        }
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self, now: DateTime<Utc>) -> Option<MatrixSnapshot> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No snapshot at {}", self.path.display());
                return None;
            }
            Err(e) => {
                warn!("Failed to read snapshot {}: {}", self.path.display(), e);
                return None;
            }
        };

        let snapshot: MatrixSnapshot = match serde_json::from_slice(&bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Ignoring corrupt snapshot {}: {}", self.path.display(), e);
                return None;
            }
        };

        let age = snapshot.age(now);
        if age >= self.max_age || age < Duration::zero() {
            info!(
                "Snapshot {} is {}s old, rebuilding",
                self.path.display(),
                age.num_seconds()
            );
            return None;
        }

        Some(snapshot)
    }

    async fn save(&self, snapshot: &MatrixSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let bytes = serde_json::to_vec(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!("Snapshot written to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use tempfile::tempdir;

    fn sample(built_at: DateTime<Utc>) -> MatrixSnapshot {
        let matrix =
            RatingMatrix::from_parts(arr2(&[[1.0, 2.0], [3.0, 4.0]]), vec![5, 6], vec![7, 8]).unwrap();
        let sim = arr2(&[[-2.0, 0.5], [0.5, -2.0]]);
        MatrixSnapshot::new(&matrix, Some(&sim), built_at)
    }

    #[tokio::test]
    async fn test_round_trip_within_max_age() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("matrix.json"), Duration::hours(1));
        let now = Utc::now();
        let snapshot = sample(now - Duration::minutes(5));

        store.save(&snapshot).await.unwrap();
        let loaded = store.load(now).await.unwrap();
        assert_eq!(loaded, snapshot);

        let (matrix, sim) = loaded.into_parts().unwrap();
        assert_eq!(matrix.author_row(8), Some(1));
        assert_eq!(sim.unwrap()[[0, 1]], 0.5);
    }

    #[tokio::test]
    async fn test_expired_snapshot_is_ignored() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("matrix.json"), Duration::hours(1));
        let now = Utc::now();

        store.save(&sample(now - Duration::hours(2))).await.unwrap();
        assert!(store.load(now).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_snapshot_are_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("matrix.json");
        let store = FileSnapshotStore::new(&path, Duration::hours(1));

        assert!(store.load(Utc::now()).await.is_none());

        tokio::fs::write(&path, b"{ not json").await.unwrap();
        assert!(store.load(Utc::now()).await.is_none());
    }

    #[test]
    fn test_into_parts_rejects_mismatched_similarity() {
        let mut snapshot = sample(Utc::now());
        snapshot.title_similarity = Some(Array2::zeros((3, 3)));
        assert!(snapshot.into_parts().is_err());
    }
}
