/*!
# Bangumi Analyzer

Batch analyzer for a community of title reviewers.

## Features

- Authors x titles rating matrix from reviews, follows and title scores
- Pearson similarity between titles and between authors
- Top-K similar titles and authors
- Weighted recommendations of unseen titles
- Pairwise similarity cache (Redis or in-memory) and staleness gating
*/

pub mod analyzer;
pub mod cache;
pub mod config;
pub mod error;
pub mod matrix;
pub mod recommend;
pub mod similarity;
pub mod snapshot;
pub mod staleness;
pub mod storage;
pub mod store;
pub mod topk;
pub mod types;

use error::AnalyzerError;

pub type Result<T> = std::result::Result<T, AnalyzerError>;

pub use analyzer::{Analyzer, AnalyzerSettings, RunReport};
pub use cache::{CacheBackend, MemoryCache, PairwiseCache, RedisCache};
pub use config::AnalyzerConfig;
pub use matrix::{RatingMatrix, RatingMatrixBuilder};
pub use similarity::SimilarityEngine;
pub use snapshot::{FileSnapshotStore, SnapshotStore};
pub use staleness::StalenessGate;
pub use storage::SqliteStore;
