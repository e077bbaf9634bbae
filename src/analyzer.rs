use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::CacheStats;
use crate::config::AnalyzerConfig;
use crate::error::AnalyzerError;
use crate::matrix::{RatingMatrix, RatingMatrixBuilder};
use crate::recommend;
use crate::similarity::{similarity_matrix, SimilarityEngine};
use crate::snapshot::{MatrixSnapshot, SnapshotStore};
use crate::staleness::StalenessGate;
use crate::store::{RatingSource, ResultSink};
use crate::topk::top_k;
use crate::types::{Author, AuthorId, Axis, PeerMatch, TitleId};
use crate::Result;

#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    pub title_top_matches: usize,
    pub author_top_matches: usize,
    pub recommendation_size: usize,
    pub author_ttl: chrono::Duration,
    pub io_timeout: Duration,
    pub flush_cache_after_run: bool,
}

impl From<&AnalyzerConfig> for AnalyzerSettings {
    fn from(config: &AnalyzerConfig) -> Self {
        Self {
            title_top_matches: config.title_top_matches,
            author_top_matches: config.author_top_matches,
            recommendation_size: config.recommendation_size,
            author_ttl: chrono::Duration::from_std(config.author_ttl)
                .unwrap_or_else(|_| chrono::Duration::days(1)),
            io_timeout: config.io_timeout,
            flush_cache_after_run: config.flush_cache_after_run,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub titles: usize,
    pub authors: usize,
    pub snapshot_reused: bool,
    pub skipped_references: usize,
    pub title_matches_persisted: usize,
    pub failed_titles: Vec<TitleId>,
    pub authors_processed: usize,
    pub authors_skipped: usize,
    pub authors_without_recommendation: usize,
    pub failed_authors: Vec<AuthorId>,
    pub cache: CacheStats,
}

impl RunReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: None,
            titles: 0,
            authors: 0,
            snapshot_reused: false,
            skipped_references: 0,
            title_matches_persisted: 0,
            failed_titles: Vec::new(),
            authors_processed: 0,
            authors_skipped: 0,
            authors_without_recommendation: 0,
            failed_authors: Vec::new(),
            cache: CacheStats::default(),
        }
    }
}

enum AuthorOutcome {
    Recommended,
    NoRecommendation,
}

/// Runs the batch pass: title similarities for every title, then matches and
/// recommendations for every author the staleness gate lets through.
pub struct Analyzer {
    source: Arc<dyn RatingSource>,
    sink: Arc<dyn ResultSink>,
    engine: SimilarityEngine,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    settings: AnalyzerSettings,
}

impl Analyzer {
    pub fn new(
        source: Arc<dyn RatingSource>,
        sink: Arc<dyn ResultSink>,
        engine: SimilarityEngine,
        settings: AnalyzerSettings,
    ) -> Self {
        Self {
            source,
            sink,
            engine,
            snapshots: None,
            settings,
        }
    }

    pub fn with_snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// One full run. With `force`, every author is recomputed regardless of
    /// staleness. Only a failure to enumerate the source fails the run.
    pub async fn run(&self, force: bool) -> Result<RunReport> {
        let started_at = Utc::now();
        let started = Instant::now();
        let cache_before = self.engine.cache_stats();
        let mut report = RunReport::new(started_at);
        info!("New analyze run {} beginning", report.run_id);

        let authors = self
            .with_timeout("enumerating authors", self.source.authors())
            .await?;

        let phase = Instant::now();
        let PreparedMatrix {
            matrix,
            title_similarity,
            data_as_of,
        } = self.load_or_build(&authors, started_at, &mut report).await?;
        let (author_count, title_count) = matrix.dim();
        report.authors = author_count;
        report.titles = title_count;
        info!(
            "Rating matrix {}x{} ready in {:?}",
            author_count,
            title_count,
            phase.elapsed()
        );

        let phase = Instant::now();
        self.persist_title_matches(&matrix, &title_similarity, &mut report)
            .await;
        info!(
            "{} title top-matches persisted in {:?}",
            report.title_matches_persisted,
            phase.elapsed()
        );

        let phase = Instant::now();
        let gate = if force {
            StalenessGate::forced()
        } else {
            StalenessGate::new(self.settings.author_ttl)
        };
        let mut refresh = PairRefresh::new(
            self.engine.cache().is_enabled(),
            authors
                .iter()
                .filter(|a| StalenessGate::data_changed(a))
                .map(|a| a.id),
        );
        for author in &authors {
            self.process_author_if_stale(
                &gate,
                &matrix,
                author,
                (started_at, data_as_of),
                &mut refresh,
                &mut report,
            )
            .await;
        }
        info!(
            "Authors processed: {}, skipped: {}, failed: {} in {:?}",
            report.authors_processed,
            report.authors_skipped,
            report.failed_authors.len(),
            phase.elapsed()
        );

        if self.settings.flush_cache_after_run {
            self.engine.cache().clear().await;
        }

        report.cache = self.engine.cache_stats().since(&cache_before);
        report.finished_at = Some(Utc::now());
        info!(
            "Analyze run {} finished in {:?}",
            report.run_id,
            started.elapsed()
        );
        Ok(report)
    }

    /// Returns the rating matrix and title similarity matrix, from a fresh
    /// snapshot when one still covers every author's data and otherwise
    /// rebuilt from the source.
    async fn load_or_build(
        &self,
        authors: &[Author],
        now: DateTime<Utc>,
        report: &mut RunReport,
    ) -> Result<PreparedMatrix> {
        if let Some(snapshots) = &self.snapshots {
            if let Some(snapshot) = snapshots.load(now).await {
                if let Some(author_id) = outdated_by(&snapshot, authors) {
                    info!(
                        "Author {} changed after the snapshot was built, rebuilding",
                        author_id
                    );
                } else {
                    let data_as_of = snapshot.built_at;
                    match snapshot.into_parts() {
                        Ok((matrix, Some(title_similarity))) => {
                            info!("Reusing rating matrix snapshot");
                            report.snapshot_reused = true;
                            return Ok(PreparedMatrix {
                                matrix,
                                title_similarity,
                                data_as_of,
                            });
                        }
                        Ok((matrix, None)) => {
                            info!("Reusing rating matrix snapshot without title similarities");
                            report.snapshot_reused = true;
                            let title_similarity = self.title_similarity(&matrix).await?;
                            return Ok(PreparedMatrix {
                                matrix,
                                title_similarity,
                                data_as_of,
                            });
                        }
                        Err(e) => warn!("Unusable snapshot, rebuilding: {}", e),
                    }
                }
            }
        }

        let titles = self
            .with_timeout("enumerating titles", self.source.titles())
            .await?;
        let (matrix, stats) = RatingMatrixBuilder::new(&titles, authors).build();
        report.skipped_references = stats.skipped_references;

        let title_similarity = self.title_similarity(&matrix).await?;

        if let Some(snapshots) = &self.snapshots {
            let snapshot = MatrixSnapshot::new(&matrix, Some(&title_similarity), now);
            if let Err(e) = snapshots.save(&snapshot).await {
                warn!("Failed to save rating matrix snapshot: {}", e);
            }
        }

        Ok(PreparedMatrix {
            matrix,
            title_similarity,
            data_as_of: now,
        })
    }

    async fn title_similarity(&self, matrix: &RatingMatrix) -> Result<Array2<f64>> {
        let phase = Instant::now();
        let cells = matrix.cells().clone();
        let policy = self.engine.policy();
        let similarity =
            tokio::task::spawn_blocking(move || similarity_matrix(&cells, Axis::Title, policy))
                .await?;

        info!(
            "Title similarity matrix {:?} calculated in {:?}",
            similarity.dim(),
            phase.elapsed()
        );
        Ok(similarity)
    }

    async fn persist_title_matches(
        &self,
        matrix: &RatingMatrix,
        similarity: &Array2<f64>,
        report: &mut RunReport,
    ) {
        let title_ids = matrix.title_ids();
        for (col, title_id) in title_ids.iter().enumerate() {
            let matches: Vec<PeerMatch> =
                top_k(similarity.row(col), self.settings.title_top_matches, col)
                    .into_iter()
                    .map(|(peer, similarity)| PeerMatch {
                        peer_id: title_ids[peer],
                        similarity,
                    })
                    .collect();

            match self
                .with_timeout(
                    "persisting title matches",
                    self.sink.set_title_matches(*title_id, &matches),
                )
                .await
            {
                Ok(()) => report.title_matches_persisted += 1,
                Err(e) => {
                    error!("Failed to persist top-matches of title {}: {}", title_id, e);
                    report.failed_titles.push(*title_id);
                }
            }
        }
    }

    /// `times` is the run start and the moment the matrix data was read; the
    /// latter is what the author gets marked as analyzed at.
    async fn process_author_if_stale(
        &self,
        gate: &StalenessGate,
        matrix: &RatingMatrix,
        author: &Author,
        times: (DateTime<Utc>, DateTime<Utc>),
        refresh: &mut PairRefresh,
        report: &mut RunReport,
    ) {
        let (now, data_as_of) = times;
        let freshness = gate.check(author, now);
        if !freshness.needs_recompute() {
            debug!("Author {} is fresh, skipping", author.id);
            report.authors_skipped += 1;
            return;
        }

        let Some(row) = matrix.author_row(author.id) else {
            debug!("Author {} is not in the rating matrix yet, skipping", author.id);
            report.authors_skipped += 1;
            return;
        };

        debug!(
            "Calculating top-matches and recommendation of author {} ({:?})",
            author.id, freshness
        );
        let refresh_rows = refresh.rows_for(matrix.author_ids(), row);
        let outcome = self
            .process_author(matrix, row, &refresh_rows, data_as_of)
            .await;
        refresh.mark(matrix.author_ids(), row, &refresh_rows);

        match outcome {
            Ok(AuthorOutcome::Recommended) => report.authors_processed += 1,
            Ok(AuthorOutcome::NoRecommendation) => {
                report.authors_processed += 1;
                report.authors_without_recommendation += 1;
            }
            Err(e) => {
                error!("Failed to analyze author {}: {}", author.id, e);
                report.failed_authors.push(author.id);
            }
        }
    }

    async fn process_author(
        &self,
        matrix: &RatingMatrix,
        row: usize,
        refresh_rows: &HashSet<usize>,
        analyzed_at: DateTime<Utc>,
    ) -> Result<AuthorOutcome> {
        let author_ids = matrix.author_ids();
        let author_id = author_ids[row];

        let similarities = self
            .engine
            .author_similarities(matrix, row, refresh_rows)
            .await;
        let peers = top_k(similarities.view(), self.settings.author_top_matches, row);
        let matches: Vec<PeerMatch> = peers
            .iter()
            .map(|&(peer, similarity)| PeerMatch {
                peer_id: author_ids[peer],
                similarity,
            })
            .collect();

        let seen = self
            .with_timeout(
                "loading watched titles",
                self.source.watched_title_ids(author_id),
            )
            .await?;
        let recommendation =
            recommend::aggregate(&peers, matrix, &seen, self.settings.recommendation_size);
        if recommendation.is_none() {
            info!("No recommendation possible for author {}", author_id);
        }

        self.with_timeout(
            "persisting author results",
            self.sink.set_author_results(
                author_id,
                &matches,
                recommendation.as_deref(),
                analyzed_at,
            ),
        )
        .await?;

        Ok(match recommendation {
            Some(_) => AuthorOutcome::Recommended,
            None => AuthorOutcome::NoRecommendation,
        })
    }

    async fn with_timeout<T, F>(&self, what: &str, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.settings.io_timeout, operation)
            .await
            .map_err(|_| AnalyzerError::Timeout(what.to_string()))?
    }
}

struct PreparedMatrix {
    matrix: RatingMatrix,
    title_similarity: Array2<f64>,
    data_as_of: DateTime<Utc>,
}

/// First author whose data is newer than the snapshot, or who is missing
/// from it.
fn outdated_by(snapshot: &MatrixSnapshot, authors: &[Author]) -> Option<AuthorId> {
    let known: HashSet<AuthorId> = snapshot.author_ids.iter().copied().collect();
    authors
        .iter()
        .find(|a| {
            !known.contains(&a.id)
                || matches!(a.updated_at, Some(updated_at) if updated_at > snapshot.built_at)
        })
        .map(|a| a.id)
}

/// Tracks which cached author pairs can no longer be trusted this run.
///
/// A pair is stale when either side's data changed since its last analysis.
/// Each stale pair is recomputed and written back once, after which the cache
/// serves it again.
struct PairRefresh {
    enabled: bool,
    changed: HashSet<AuthorId>,
    rewritten: HashSet<(AuthorId, AuthorId)>,
}

impl PairRefresh {
    fn new(enabled: bool, changed: impl Iterator<Item = AuthorId>) -> Self {
        Self {
            enabled,
            changed: changed.collect(),
            rewritten: HashSet::new(),
        }
    }

    fn rows_for(&self, author_ids: &[AuthorId], row: usize) -> HashSet<usize> {
        if !self.enabled {
            return HashSet::new();
        }
        let own = author_ids[row];
        let own_changed = self.changed.contains(&own);
        author_ids
            .iter()
            .enumerate()
            .filter(|&(other, id)| {
                other != row
                    && (own_changed || self.changed.contains(id))
                    && !self.rewritten.contains(&ordered(own, *id))
            })
            .map(|(other, _)| other)
            .collect()
    }

    fn mark(&mut self, author_ids: &[AuthorId], row: usize, rows: &HashSet<usize>) {
        let own = author_ids[row];
        for &other in rows {
            self.rewritten.insert(ordered(own, author_ids[other]));
        }
    }
}

fn ordered(a: AuthorId, b: AuthorId) -> (AuthorId, AuthorId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
