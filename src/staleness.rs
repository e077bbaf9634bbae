use chrono::{DateTime, Duration, Utc};

use crate::types::Author;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    NeverAnalyzed,
    DataChanged,
    Expired,
    Fresh,
}

impl Freshness {
    pub fn needs_recompute(&self) -> bool {
        !matches!(self, Freshness::Fresh)
    }
}

/// Decides per author whether this run recomputes its matches.
#[derive(Debug, Clone, Copy)]
pub struct StalenessGate {
    ttl: Duration,
    force: bool,
}

impl StalenessGate {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, force: false }
    }

    /// A gate that lets every author through.
    pub fn forced() -> Self {
        Self {
            ttl: Duration::zero(),
            force: true,
        }
    }

    pub fn check(&self, author: &Author, now: DateTime<Utc>) -> Freshness {
        let Some(analyzed_at) = author.analyzed_at else {
            return Freshness::NeverAnalyzed;
        };
        if Self::data_changed(author) {
            return Freshness::DataChanged;
        }
        if self.force || now - analyzed_at >= self.ttl {
            return Freshness::Expired;
        }
        Freshness::Fresh
    }

    /// Whether the author's reviews or follows may differ from what its last
    /// analysis saw. Independent of the TTL and of `force`.
    pub fn data_changed(author: &Author) -> bool {
        match (author.analyzed_at, author.updated_at) {
            (None, _) => true,
            (Some(analyzed_at), Some(updated_at)) => updated_at > analyzed_at,
            (Some(_), None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzed(hours_ago: i64, now: DateTime<Utc>) -> Author {
        let mut author = Author::new(1);
        author.analyzed_at = Some(now - Duration::hours(hours_ago));
        author
    }

    #[test]
    fn test_never_analyzed_is_recomputed() {
        let gate = StalenessGate::new(Duration::hours(24));
        assert_eq!(gate.check(&Author::new(1), Utc::now()), Freshness::NeverAnalyzed);
    }

    #[test]
    fn test_fresh_author_is_skipped() {
        let now = Utc::now();
        let gate = StalenessGate::new(Duration::hours(24));
        let author = analyzed(2, now);
        assert_eq!(gate.check(&author, now), Freshness::Fresh);
        assert!(!gate.check(&author, now).needs_recompute());
        assert!(!StalenessGate::data_changed(&author));
    }

    #[test]
    fn test_expired_author_is_recomputed() {
        let now = Utc::now();
        let gate = StalenessGate::new(Duration::hours(24));
        assert_eq!(gate.check(&analyzed(24, now), now), Freshness::Expired);
        assert_eq!(gate.check(&analyzed(30, now), now), Freshness::Expired);
    }

    #[test]
    fn test_changed_data_is_recomputed() {
        let now = Utc::now();
        let gate = StalenessGate::new(Duration::hours(24));
        let mut author = analyzed(2, now);
        author.updated_at = Some(now - Duration::hours(1));
        assert_eq!(gate.check(&author, now), Freshness::DataChanged);

        assert!(StalenessGate::data_changed(&author));

        author.updated_at = Some(now - Duration::hours(3));
        assert_eq!(gate.check(&author, now), Freshness::Fresh);
    }

    #[test]
    fn test_forced_gate_passes_everyone() {
        let now = Utc::now();
        let gate = StalenessGate::forced();
        assert_eq!(gate.check(&analyzed(0, now), now), Freshness::Expired);

        let mut changed = analyzed(0, now);
        changed.updated_at = Some(now + Duration::seconds(1));
        assert_eq!(gate.check(&changed, now), Freshness::DataChanged);
        assert!(StalenessGate::data_changed(&Author::new(2)));
    }
}
