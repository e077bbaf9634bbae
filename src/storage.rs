use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tracing::{debug, info};

use crate::store::{RatingSource, ResultSink};
use crate::types::{Author, AuthorId, Dataset, PeerMatch, Review, Title, TitleId};
use crate::Result;

/// SQLite-backed source of ratings and sink of analysis results.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AuthorResults {
    pub matches: Vec<PeerMatch>,
    pub recommendation: Vec<TitleId>,
    pub analyzed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub titles: usize,
    pub authors: usize,
    pub authors_changed: usize,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Every connection to an in-memory database is a separate database.
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        info!("Connected to {}", database_url);
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS titles (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id INTEGER NOT NULL UNIQUE,
                score REAL
            )",
            "CREATE TABLE IF NOT EXISTS authors (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id INTEGER NOT NULL UNIQUE,
                analyzed_at TEXT,
                updated_at TEXT
            )",
            "CREATE TABLE IF NOT EXISTS reviews (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                author_id INTEGER NOT NULL,
                title_id INTEGER NOT NULL,
                score REAL NOT NULL,
                UNIQUE (author_id, title_id)
            )",
            "CREATE TABLE IF NOT EXISTS follows (
                author_id INTEGER NOT NULL,
                title_id INTEGER NOT NULL,
                PRIMARY KEY (author_id, title_id)
            )",
            "CREATE TABLE IF NOT EXISTS title_matches (
                title_id INTEGER NOT NULL,
                rank INTEGER NOT NULL,
                peer_id INTEGER NOT NULL,
                similarity REAL NOT NULL,
                PRIMARY KEY (title_id, rank)
            )",
            "CREATE TABLE IF NOT EXISTS author_matches (
                author_id INTEGER NOT NULL,
                rank INTEGER NOT NULL,
                peer_id INTEGER NOT NULL,
                similarity REAL NOT NULL,
                PRIMARY KEY (author_id, rank)
            )",
            "CREATE TABLE IF NOT EXISTS recommendations (
                author_id INTEGER NOT NULL,
                rank INTEGER NOT NULL,
                title_id INTEGER NOT NULL,
                PRIMARY KEY (author_id, rank)
            )",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        debug!("Schema ready");
        Ok(())
    }

    /// Upserts a dataset. An author's `updated_at` moves only when its reviews
    /// or follows differ from what is stored.
    pub async fn import_dataset(&self, dataset: &Dataset) -> Result<ImportStats> {
        let now = Utc::now();
        let mut stats = ImportStats::default();
        let mut tx = self.pool.begin().await?;

        for title in &dataset.titles {
            sqlx::query(
                "INSERT INTO titles (id, score) VALUES (?, ?)
                 ON CONFLICT (id) DO UPDATE SET score = excluded.score",
            )
            .bind(title.id)
            .bind(title.score)
            .execute(&mut *tx)
            .await?;
            stats.titles += 1;
        }

        for author in &dataset.authors {
            sqlx::query("INSERT INTO authors (id) VALUES (?) ON CONFLICT (id) DO NOTHING")
                .bind(author.id)
                .execute(&mut *tx)
                .await?;
            stats.authors += 1;

            let stored_reviews: Vec<(i64, f64)> =
                sqlx::query("SELECT title_id, score FROM reviews WHERE author_id = ? ORDER BY seq")
                    .bind(author.id)
                    .fetch_all(&mut *tx)
                    .await?
                    .iter()
                    .map(|row| -> std::result::Result<(i64, f64), sqlx::Error> {
                        Ok((row.try_get("title_id")?, row.try_get("score")?))
                    })
                    .collect::<std::result::Result<_, sqlx::Error>>()?;
            let stored_follows: HashSet<i64> =
                sqlx::query("SELECT title_id FROM follows WHERE author_id = ?")
                    .bind(author.id)
                    .fetch_all(&mut *tx)
                    .await?
                    .iter()
                    .map(|row| row.try_get("title_id"))
                    .collect::<std::result::Result<_, sqlx::Error>>()?;

            let incoming_reviews: Vec<(i64, f64)> = dedup_reviews(&author.reviews);
            if stored_reviews == incoming_reviews && stored_follows == author.follows {
                continue;
            }

            sqlx::query("DELETE FROM reviews WHERE author_id = ?")
                .bind(author.id)
                .execute(&mut *tx)
                .await?;
            for (title_id, score) in &incoming_reviews {
                sqlx::query("INSERT INTO reviews (author_id, title_id, score) VALUES (?, ?, ?)")
                    .bind(author.id)
                    .bind(title_id)
                    .bind(score)
                    .execute(&mut *tx)
                    .await?;
            }

            sqlx::query("DELETE FROM follows WHERE author_id = ?")
                .bind(author.id)
                .execute(&mut *tx)
                .await?;
            let mut follows: Vec<&i64> = author.follows.iter().collect();
            follows.sort();
            for title_id in follows {
                sqlx::query("INSERT INTO follows (author_id, title_id) VALUES (?, ?)")
                    .bind(author.id)
                    .bind(title_id)
                    .execute(&mut *tx)
                    .await?;
            }

            sqlx::query("UPDATE authors SET updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(author.id)
                .execute(&mut *tx)
                .await?;
            stats.authors_changed += 1;
        }

        tx.commit().await?;
        info!(
            "Imported {} titles and {} authors ({} changed)",
            stats.titles, stats.authors, stats.authors_changed
        );
        Ok(stats)
    }

    pub async fn title_matches(&self, title_id: TitleId) -> Result<Vec<PeerMatch>> {
        let rows = sqlx::query(
            "SELECT peer_id, similarity FROM title_matches WHERE title_id = ? ORDER BY rank",
        )
        .bind(title_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(peer_match).collect()
    }

    pub async fn author_results(&self, author_id: AuthorId) -> Result<AuthorResults> {
        let matches = sqlx::query(
            "SELECT peer_id, similarity FROM author_matches WHERE author_id = ? ORDER BY rank",
        )
        .bind(author_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(peer_match)
        .collect::<Result<Vec<_>>>()?;

        let recommendation = sqlx::query(
            "SELECT title_id FROM recommendations WHERE author_id = ? ORDER BY rank",
        )
        .bind(author_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| row.try_get("title_id"))
        .collect::<std::result::Result<Vec<i64>, sqlx::Error>>()?;

        let analyzed_at = sqlx::query("SELECT analyzed_at FROM authors WHERE id = ?")
            .bind(author_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.try_get::<Option<DateTime<Utc>>, _>("analyzed_at"))
            .transpose()?
            .flatten();

        Ok(AuthorResults {
            matches,
            recommendation,
            analyzed_at,
        })
    }
}

#[async_trait]
impl RatingSource for SqliteStore {
    async fn titles(&self) -> Result<Vec<Title>> {
        let rows = sqlx::query("SELECT id, score FROM titles ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;

        let mut titles = Vec::with_capacity(rows.len());
        for row in rows {
            titles.push(Title {
                id: row.try_get("id")?,
                score: row.try_get("score")?,
            });
        }
        Ok(titles)
    }

    async fn authors(&self) -> Result<Vec<Author>> {
        let mut reviews: HashMap<AuthorId, Vec<Review>> = HashMap::new();
        for row in sqlx::query("SELECT author_id, title_id, score FROM reviews ORDER BY seq")
            .fetch_all(&self.pool)
            .await?
        {
            reviews
                .entry(row.try_get("author_id")?)
                .or_default()
                .push(Review {
                    title_id: row.try_get("title_id")?,
                    score: row.try_get("score")?,
                });
        }

        let mut follows: HashMap<AuthorId, HashSet<TitleId>> = HashMap::new();
        for row in sqlx::query("SELECT author_id, title_id FROM follows")
            .fetch_all(&self.pool)
            .await?
        {
            follows
                .entry(row.try_get("author_id")?)
                .or_default()
                .insert(row.try_get("title_id")?);
        }

        let rows = sqlx::query("SELECT id, analyzed_at, updated_at FROM authors ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;

        let mut authors = Vec::with_capacity(rows.len());
        for row in rows {
            let id: AuthorId = row.try_get("id")?;
            authors.push(Author {
                id,
                reviews: reviews.remove(&id).unwrap_or_default(),
                follows: follows.remove(&id).unwrap_or_default(),
                analyzed_at: row.try_get("analyzed_at")?,
                updated_at: row.try_get("updated_at")?,
            });
        }
        Ok(authors)
    }

    async fn watched_title_ids(&self, author_id: AuthorId) -> Result<HashSet<TitleId>> {
        let rows = sqlx::query(
            "SELECT title_id FROM reviews WHERE author_id = ?
             UNION
             SELECT title_id FROM follows WHERE author_id = ?",
        )
        .bind(author_id)
        .bind(author_id)
        .fetch_all(&self.pool)
        .await?;

        let mut watched = HashSet::with_capacity(rows.len());
        for row in rows {
            watched.insert(row.try_get("title_id")?);
        }
        Ok(watched)
    }
}

#[async_trait]
impl ResultSink for SqliteStore {
    async fn set_title_matches(&self, title_id: TitleId, matches: &[PeerMatch]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM title_matches WHERE title_id = ?")
            .bind(title_id)
            .execute(&mut *tx)
            .await?;
        for (rank, entry) in matches.iter().enumerate() {
            sqlx::query(
                "INSERT INTO title_matches (title_id, rank, peer_id, similarity) VALUES (?, ?, ?, ?)",
            )
            .bind(title_id)
            .bind(rank as i64)
            .bind(entry.peer_id)
            .bind(entry.similarity)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn set_author_results(
        &self,
        author_id: AuthorId,
        matches: &[PeerMatch],
        recommendation: Option<&[TitleId]>,
        analyzed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM author_matches WHERE author_id = ?")
            .bind(author_id)
            .execute(&mut *tx)
            .await?;
        for (rank, entry) in matches.iter().enumerate() {
            sqlx::query(
                "INSERT INTO author_matches (author_id, rank, peer_id, similarity) VALUES (?, ?, ?, ?)",
            )
            .bind(author_id)
            .bind(rank as i64)
            .bind(entry.peer_id)
            .bind(entry.similarity)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(recommendation) = recommendation {
            sqlx::query("DELETE FROM recommendations WHERE author_id = ?")
                .bind(author_id)
                .execute(&mut *tx)
                .await?;
            for (rank, title_id) in recommendation.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO recommendations (author_id, rank, title_id) VALUES (?, ?, ?)",
                )
                .bind(author_id)
                .bind(rank as i64)
                .bind(title_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query("UPDATE authors SET analyzed_at = ? WHERE id = ?")
            .bind(analyzed_at)
            .bind(author_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn peer_match(row: &sqlx::sqlite::SqliteRow) -> Result<PeerMatch> {
    Ok(PeerMatch {
        peer_id: row.try_get("peer_id")?,
        similarity: row.try_get("similarity")?,
    })
}

/// Review list in stored form: one entry per title, the last score winning,
/// in first-seen order.
fn dedup_reviews(reviews: &[Review]) -> Vec<(i64, f64)> {
    let mut order: Vec<i64> = Vec::with_capacity(reviews.len());
    let mut scores: HashMap<i64, f64> = HashMap::with_capacity(reviews.len());
    for review in reviews {
        if scores.insert(review.title_id, review.score).is_none() {
            order.push(review.title_id);
        }
    }
    order.into_iter().map(|id| (id, scores[&id])).collect()
}
