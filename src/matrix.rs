use ndarray::{Array2, ArrayView1};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::error::AnalyzerError;
use crate::types::{Author, AuthorId, Title, TitleId};
use crate::Result;

/// Multiplier applied to a followed title the author has not reviewed.
pub const FOLLOW_BOOST: f64 = 1.05;

/// Cell value for a title without a global score and without a review.
pub const NO_DATA: f64 = 0.0;

/// Authors (rows) x titles (columns) of effective scores.
#[derive(Debug, Clone, PartialEq)]
pub struct RatingMatrix {
    cells: Array2<f64>,
    title_ids: Vec<TitleId>,
    author_ids: Vec<AuthorId>,
    author_index: HashMap<AuthorId, usize>,
}

impl RatingMatrix {
    /// Reassembles a matrix from its stored parts, e.g. a snapshot.
    pub fn from_parts(
        cells: Array2<f64>,
        title_ids: Vec<TitleId>,
        author_ids: Vec<AuthorId>,
    ) -> Result<Self> {
        let (rows, cols) = cells.dim();
        if rows != author_ids.len() || cols != title_ids.len() {
            return Err(AnalyzerError::Dimension {
                expected: format!("{}x{}", author_ids.len(), title_ids.len()),
                actual: format!("{}x{}", rows, cols),
            });
        }

        let title_index = index_of(&title_ids);
        let author_index = index_of(&author_ids);
        if title_index.len() != title_ids.len() || author_index.len() != author_ids.len() {
            return Err(AnalyzerError::Snapshot(
                "duplicate ids in stored matrix".to_string(),
            ));
        }

        Ok(Self {
            cells,
            title_ids,
            author_ids,
            author_index,
        })
    }

    pub fn cells(&self) -> &Array2<f64> {
        &self.cells
    }

    pub fn title_ids(&self) -> &[TitleId] {
        &self.title_ids
    }

    pub fn author_ids(&self) -> &[AuthorId] {
        &self.author_ids
    }

    /// (authors, titles)
    pub fn dim(&self) -> (usize, usize) {
        self.cells.dim()
    }

    pub fn author_row(&self, id: AuthorId) -> Option<usize> {
        self.author_index.get(&id).copied()
    }

    pub fn row(&self, row: usize) -> ArrayView1<'_, f64> {
        self.cells.row(row)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub duplicate_titles: usize,
    pub duplicate_authors: usize,
    pub skipped_references: usize,
}

/// Assembles a [`RatingMatrix`] from a full read of titles and authors.
///
/// Column and row positions follow enumeration order; a repeated id keeps its
/// first position. Reviews and follows of titles that are not in the title
/// enumeration are dropped.
pub struct RatingMatrixBuilder<'a> {
    titles: &'a [Title],
    authors: &'a [Author],
}

impl<'a> RatingMatrixBuilder<'a> {
    pub fn new(titles: &'a [Title], authors: &'a [Author]) -> Self {
        Self { titles, authors }
    }

    pub fn build(&self) -> (RatingMatrix, BuildStats) {
        let mut stats = BuildStats::default();

        let mut title_ids = Vec::with_capacity(self.titles.len());
        let mut baselines = Vec::with_capacity(self.titles.len());
        let mut title_index = HashMap::with_capacity(self.titles.len());
        for title in self.titles {
            if title_index.contains_key(&title.id) {
                stats.duplicate_titles += 1;
                continue;
            }
            title_index.insert(title.id, title_ids.len());
            title_ids.push(title.id);
            baselines.push(title.score.unwrap_or(NO_DATA));
        }

        let mut author_ids = Vec::with_capacity(self.authors.len());
        let mut author_index = HashMap::with_capacity(self.authors.len());
        let mut rows: Vec<&Author> = Vec::with_capacity(self.authors.len());
        for author in self.authors {
            if author_index.contains_key(&author.id) {
                stats.duplicate_authors += 1;
                continue;
            }
            author_index.insert(author.id, author_ids.len());
            author_ids.push(author.id);
            rows.push(author);
        }

        let mut cells = Array2::from_shape_fn((author_ids.len(), title_ids.len()), |(_, col)| {
            baselines[col]
        });

        for (row, author) in rows.iter().enumerate() {
            let mut reviewed = HashSet::with_capacity(author.reviews.len());
            for review in &author.reviews {
                match title_index.get(&review.title_id) {
                    Some(&col) => {
                        cells[[row, col]] = review.score;
                        reviewed.insert(col);
                    }
                    None => {
                        stats.skipped_references += 1;
                        debug!(
                            "Author {} reviewed unknown title {}, skipping",
                            author.id, review.title_id
                        );
                    }
                }
            }

            for title_id in &author.follows {
                match title_index.get(title_id) {
                    Some(&col) if !reviewed.contains(&col) => {
                        cells[[row, col]] *= FOLLOW_BOOST;
                    }
                    Some(_) => {}
                    None => {
                        stats.skipped_references += 1;
                        debug!(
                            "Author {} follows unknown title {}, skipping",
                            author.id, title_id
                        );
                    }
                }
            }
        }

        info!(
            "Rating matrix {}x{} built ({} unknown references skipped)",
            author_ids.len(),
            title_ids.len(),
            stats.skipped_references
        );

        let matrix = RatingMatrix {
            cells,
            title_ids,
            author_ids,
            author_index,
        };
        (matrix, stats)
    }
}

fn index_of(ids: &[i64]) -> HashMap<i64, usize> {
    ids.iter().enumerate().map(|(i, id)| (*id, i)).collect()
}
