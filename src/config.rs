use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AnalyzerError;
use crate::types::OverlapPolicy;
use crate::Result;

#[derive(Clone, Debug)]
pub struct AnalyzerConfig {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub redis_max_memory: Option<String>,
    pub cache_enabled: bool,
    pub cache_prefix: String,
    pub cache_ttl: Duration,
    pub flush_cache_after_run: bool,
    pub title_top_matches: usize,
    pub author_top_matches: usize,
    pub recommendation_size: usize,
    pub author_ttl: Duration,
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_max_age: Duration,
    pub io_timeout: Duration,
    pub pair_concurrency: usize,
    pub overlap_policy: OverlapPolicy,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:bangumi.db".to_string(),
            redis_url: None,
            redis_max_memory: None,
            cache_enabled: true,
            cache_prefix: "bangumi".to_string(),
            cache_ttl: Duration::from_secs(24 * 3600),
            flush_cache_after_run: false,
            title_top_matches: 10,
            author_top_matches: 10,
            recommendation_size: 20,
            author_ttl: Duration::from_secs(24 * 3600),
            snapshot_path: None,
            snapshot_max_age: Duration::from_secs(3600),
            io_timeout: Duration::from_secs(10),
            pair_concurrency: 32,
            overlap_policy: OverlapPolicy::Sparse,
        }
    }
}

impl AnalyzerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset or unparsable numbers keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let flag = |key: &str, default: bool| {
            lookup(key)
                .and_then(|v| v.trim().parse::<bool>().ok())
                .unwrap_or(default)
        };
        let secs = |key: &str, default: Duration| {
            parsed(key).map(Duration::from_secs).unwrap_or(default)
        };
        let count = |key: &str, default: usize| parsed(key).map(|v| v as usize).unwrap_or(default);

        let overlap_policy = match lookup("ANALYZER_OVERLAP_POLICY") {
            Some(value) => OverlapPolicy::from_str(&value)?,
            None => defaults.overlap_policy,
        };

        let config = Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            redis_url: lookup("REDIS_URL").filter(|v| !v.is_empty()),
            redis_max_memory: lookup("REDIS_MAX_MEMORY").filter(|v| !v.is_empty()),
            cache_enabled: flag("ANALYZER_CACHE_ENABLED", defaults.cache_enabled),
            cache_prefix: lookup("ANALYZER_CACHE_PREFIX").unwrap_or(defaults.cache_prefix),
            cache_ttl: secs("ANALYZER_CACHE_TTL_SECS", defaults.cache_ttl),
            flush_cache_after_run: flag(
                "ANALYZER_FLUSH_CACHE_AFTER_RUN",
                defaults.flush_cache_after_run,
            ),
            title_top_matches: count("ANALYZER_TITLE_TOP_MATCHES", defaults.title_top_matches),
            author_top_matches: count("ANALYZER_AUTHOR_TOP_MATCHES", defaults.author_top_matches),
            recommendation_size: count(
                "ANALYZER_RECOMMENDATION_SIZE",
                defaults.recommendation_size,
            ),
            author_ttl: secs("ANALYZER_AUTHOR_TTL_SECS", defaults.author_ttl),
            snapshot_path: lookup("ANALYZER_SNAPSHOT_PATH")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            snapshot_max_age: secs("ANALYZER_SNAPSHOT_MAX_AGE_SECS", defaults.snapshot_max_age),
            io_timeout: secs("ANALYZER_IO_TIMEOUT_SECS", defaults.io_timeout),
            pair_concurrency: count("ANALYZER_PAIR_CONCURRENCY", defaults.pair_concurrency),
            overlap_policy,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("ANALYZER_TITLE_TOP_MATCHES", self.title_top_matches),
            ("ANALYZER_AUTHOR_TOP_MATCHES", self.author_top_matches),
            ("ANALYZER_RECOMMENDATION_SIZE", self.recommendation_size),
            ("ANALYZER_PAIR_CONCURRENCY", self.pair_concurrency),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(AnalyzerError::Config(format!("{} must be positive", name)));
            }
        }
        if self.io_timeout.is_zero() {
            return Err(AnalyzerError::Config(
                "ANALYZER_IO_TIMEOUT_SECS must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<AnalyzerConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AnalyzerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.database_url, "sqlite:bangumi.db");
        assert!(config.redis_url.is_none());
        assert!(config.cache_enabled);
        assert_eq!(config.recommendation_size, 20);
        assert_eq!(config.overlap_policy, OverlapPolicy::Sparse);
    }

    #[test]
    fn test_overrides_and_bad_numbers() {
        let config = from_pairs(&[
            ("REDIS_URL", "redis://localhost:6379"),
            ("ANALYZER_TITLE_TOP_MATCHES", "5"),
            ("ANALYZER_AUTHOR_TTL_SECS", "not-a-number"),
            ("ANALYZER_CACHE_ENABLED", "false"),
            ("ANALYZER_OVERLAP_POLICY", "dense"),
            ("ANALYZER_SNAPSHOT_PATH", "/tmp/matrix.json"),
        ])
        .unwrap();

        assert_eq!(config.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(config.title_top_matches, 5);
        assert_eq!(config.author_ttl, Duration::from_secs(24 * 3600));
        assert!(!config.cache_enabled);
        assert_eq!(config.overlap_policy, OverlapPolicy::Dense);
        assert_eq!(config.snapshot_path, Some(PathBuf::from("/tmp/matrix.json")));
    }

    #[test]
    fn test_rejects_zero_sizes_and_unknown_policy() {
        assert!(from_pairs(&[("ANALYZER_RECOMMENDATION_SIZE", "0")]).is_err());
        assert!(from_pairs(&[("ANALYZER_OVERLAP_POLICY", "jaccard")]).is_err());
    }
}
