use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::types::{Author, AuthorId, PeerMatch, Title, TitleId};
use crate::Result;

/// Where titles, authors and their history are read from.
#[async_trait]
pub trait RatingSource: Send + Sync {
    /// Every title, in stable enumeration order.
    async fn titles(&self) -> Result<Vec<Title>>;

    /// Every author with reviews and follows, in stable enumeration order.
    async fn authors(&self) -> Result<Vec<Author>>;

    /// Titles the author has already reviewed or is watching.
    async fn watched_title_ids(&self, author_id: AuthorId) -> Result<HashSet<TitleId>>;
}

/// Where computed matches and recommendations are written to.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn set_title_matches(&self, title_id: TitleId, matches: &[PeerMatch]) -> Result<()>;

    /// Replaces the author's matches and marks it analyzed at `analyzed_at`.
    /// A `None` recommendation leaves the previously stored one in place.
    async fn set_author_results(
        &self,
        author_id: AuthorId,
        matches: &[PeerMatch],
        recommendation: Option<&[TitleId]>,
        analyzed_at: DateTime<Utc>,
    ) -> Result<()>;
}
