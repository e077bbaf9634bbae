use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::AnalyzerError;

pub type TitleId = i64;
pub type AuthorId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Title {
    pub id: TitleId,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub title_id: TitleId,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub id: AuthorId,
    #[serde(default)]
    pub reviews: Vec<Review>,
    #[serde(default)]
    pub follows: HashSet<TitleId>,
    /// Last time this author's matches and recommendation were recomputed.
    #[serde(default)]
    pub analyzed_at: Option<DateTime<Utc>>,
    /// Last time the author's reviews or follows changed.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Author {
    pub fn new(id: AuthorId) -> Self {
        Self {
            id,
            reviews: Vec::new(),
            follows: HashSet::new(),
            analyzed_at: None,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMatch {
    pub peer_id: i64,
    pub similarity: f64,
}

pub type Recommendation = Vec<TitleId>;

/// Which entities are being compared: matrix columns (titles) or rows (authors).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    Title,
    Author,
}

impl Axis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Axis::Title => "title",
            Axis::Author => "author",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which cells take part in a correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverlapPolicy {
    /// Only positions where both vectors carry data (`> 0.0`).
    #[default]
    Sparse,
    /// Every position of both vectors.
    Dense,
}

impl FromStr for OverlapPolicy {
    type Err = AnalyzerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sparse" => Ok(OverlapPolicy::Sparse),
            "dense" => Ok(OverlapPolicy::Dense),
            other => Err(AnalyzerError::Config(format!(
                "unknown overlap policy '{}', expected 'sparse' or 'dense'",
                other
            ))),
        }
    }
}

/// Input dataset accepted by the `import` command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub titles: Vec<Title>,
    #[serde(default)]
    pub authors: Vec<Author>,
}
