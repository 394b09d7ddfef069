//! Static tunables for retrieval and the bulk pipeline, plus the CLI flags
//! that populate them.

use std::time::Duration;

use clap::Args;

use crate::backoff::RetryPolicy;
use crate::error::ConfigError;

/// Partition searched when a request does not name one.
pub const DEFAULT_PARTITION: &str = "PSW By Mary J. Wilk";

/// Knobs bounding one retrieval request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalConfig {
    default_partition: String,
    default_top_k: usize,
    max_top_k: usize,
    max_candidates: usize,
    similarity_floor: f32,
    cache_ttl: Duration,
    upstream_timeout: Duration,
    serve_stale_on_error: bool,
}

impl RetrievalConfig {
    /// Partition used when the request omits one.
    pub fn default_partition(&self) -> &str {
        &self.default_partition
    }

    /// Result count used when the request omits `topK`.
    pub fn default_top_k(&self) -> usize {
        self.default_top_k
    }

    /// Hard ceiling on results per request.
    pub fn max_top_k(&self) -> usize {
        self.max_top_k
    }

    /// Cap on candidates loaded per partition.
    pub fn max_candidates(&self) -> usize {
        self.max_candidates
    }

    /// Minimum cosine similarity kept.
    pub fn similarity_floor(&self) -> f32 {
        self.similarity_floor
    }

    /// How long a partition's candidate list stays fresh.
    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Deadline for each embed call, scoped read and point read.
    pub fn upstream_timeout(&self) -> Duration {
        self.upstream_timeout
    }

    /// Serve an expired candidate list when refreshing it fails.
    pub fn serve_stale_on_error(&self) -> bool {
        self.serve_stale_on_error
    }

    /// Clamps a requested result count into `[1, max_top_k]`. Zero and
    /// negative requests become 1.
    pub fn effective_top_k(&self, requested: Option<i64>) -> usize {
        let max = self.max_top_k.max(1);
        match requested {
            Some(k) => usize::try_from(k.max(1)).map_or(max, |k| k.min(max)),
            None => self.default_top_k.clamp(1, max),
        }
    }

    pub fn with_default_partition(mut self, partition: impl Into<String>) -> Self {
        self.default_partition = partition.into();
        self
    }

    pub fn with_top_k(mut self, default_top_k: usize, max_top_k: usize) -> Self {
        self.default_top_k = default_top_k;
        self.max_top_k = max_top_k;
        self
    }

    pub fn with_max_candidates(mut self, max_candidates: usize) -> Self {
        self.max_candidates = max_candidates;
        self
    }

    pub fn with_similarity_floor(mut self, floor: f32) -> Self {
        self.similarity_floor = floor;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    pub fn with_serve_stale_on_error(mut self, enabled: bool) -> Self {
        self.serve_stale_on_error = enabled;
        self
    }

    /// Rejects values that would make every request fail or misbehave.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if !(-1.0..=1.0).contains(&self.similarity_floor) {
            return Err(ConfigError::FloorOutOfRange(self.similarity_floor));
        }
        if self.default_partition.trim().is_empty() {
            return Err(ConfigError::BlankPartition);
        }
        for (name, value) in [
            ("max_top_k", self.max_top_k),
            ("max_candidates", self.max_candidates),
        ] {
            if value == 0 {
                return Err(ConfigError::NotPositive { name });
            }
        }
        if self.upstream_timeout.is_zero() {
            return Err(ConfigError::NotPositive {
                name: "upstream_timeout",
            });
        }
        Ok(self)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_partition: DEFAULT_PARTITION.to_string(),
            default_top_k: 5,
            max_top_k: 20,
            max_candidates: 800,
            similarity_floor: 0.60,
            cache_ttl: Duration::from_secs(10 * 60),
            upstream_timeout: Duration::from_secs(10),
            serve_stale_on_error: false,
        }
    }
}

/// Knobs bounding a bulk mutation run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    max_in_flight: usize,
    log_every: usize,
    retry: RetryPolicy,
    dry_run: bool,
    shuffle_seed: Option<u64>,
}

impl PipelineConfig {
    /// Builds a pipeline config; the admission window must hold at least one write.
    pub fn new(max_in_flight: usize, retry: RetryPolicy) -> Result<Self, ConfigError> {
        if max_in_flight == 0 {
            return Err(ConfigError::NotPositive {
                name: "max_in_flight",
            });
        }
        Ok(Self {
            max_in_flight,
            retry,
            ..Self::default()
        })
    }

    /// Upper bound on concurrently outstanding writes.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Completions between progress log lines.
    pub fn log_every(&self) -> usize {
        self.log_every
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Fixed seed for the input shuffle; `None` draws from entropy.
    pub fn shuffle_seed(&self) -> Option<u64> {
        self.shuffle_seed
    }

    pub fn with_log_every(mut self, log_every: usize) -> Self {
        self.log_every = log_every.max(1);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_shuffle_seed(mut self, seed: Option<u64>) -> Self {
        self.shuffle_seed = seed;
        self
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 150,
            log_every: 1000,
            retry: RetryPolicy::default(),
            dry_run: false,
            shuffle_seed: None,
        }
    }
}

/// Retrieval flags shared by binaries that serve queries.
#[derive(Args, Debug, Clone)]
pub struct RetrievalArgs {
    /// Partition searched when a request omits one
    #[arg(long, env = "CORPUSRAG_DEFAULT_PARTITION", default_value = DEFAULT_PARTITION)]
    pub default_partition: String,

    /// Default top-k when the client does not override it
    #[arg(long, env = "CORPUSRAG_DEFAULT_TOP_K", default_value_t = 5)]
    pub default_top_k: usize,

    /// Maximum top-k allowed per request
    #[arg(long, env = "CORPUSRAG_MAX_TOP_K", default_value_t = 20)]
    pub max_top_k: usize,

    /// Candidates loaded per partition; anything beyond is never ranked
    #[arg(long, env = "CORPUSRAG_MAX_CANDIDATES", default_value_t = 800)]
    pub max_candidates: usize,

    /// Minimum cosine similarity a chunk needs to be returned
    #[arg(long, env = "CORPUSRAG_SIMILARITY_FLOOR", default_value_t = 0.60)]
    pub similarity_floor: f32,

    /// Seconds a partition's candidate list stays cached
    #[arg(long, env = "CORPUSRAG_CACHE_TTL_SECS", default_value_t = 600)]
    pub cache_ttl_secs: u64,

    /// Seconds before an embedding call or store read is abandoned
    #[arg(long, env = "CORPUSRAG_UPSTREAM_TIMEOUT_SECS", default_value_t = 10)]
    pub upstream_timeout_secs: u64,

    /// Serve an expired candidate list when refreshing it fails
    #[arg(long, env = "CORPUSRAG_SERVE_STALE", default_value_t = false)]
    pub serve_stale_on_error: bool,
}

impl RetrievalArgs {
    /// Converts the parsed flags into a validated `RetrievalConfig`.
    pub fn build_config(&self) -> Result<RetrievalConfig, ConfigError> {
        RetrievalConfig::default()
            .with_default_partition(self.default_partition.trim())
            .with_top_k(self.default_top_k, self.max_top_k)
            .with_max_candidates(self.max_candidates)
            .with_similarity_floor(self.similarity_floor)
            .with_cache_ttl(Duration::from_secs(self.cache_ttl_secs))
            .with_upstream_timeout(Duration::from_secs(self.upstream_timeout_secs))
            .with_serve_stale_on_error(self.serve_stale_on_error)
            .validate()
    }
}

/// Flow-control and retry flags for bulk mutation runs.
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// Maximum writes in flight at once (reduce if contention is high)
    #[arg(long, env = "CORPUSRAG_MAX_IN_FLIGHT", default_value_t = 150)]
    pub max_in_flight: usize,

    /// Completions between progress log lines
    #[arg(long, env = "CORPUSRAG_LOG_EVERY", default_value_t = 1000)]
    pub log_every: usize,

    /// Attempts per record before it is reported as permanently failed
    #[arg(long, env = "CORPUSRAG_MAX_ATTEMPTS", default_value_t = 10)]
    pub max_attempts: u32,

    /// Base backoff delay in milliseconds
    #[arg(long, env = "CORPUSRAG_BACKOFF_BASE_MS", default_value_t = 250)]
    pub backoff_base_ms: u64,

    /// Multiplier applied per failed attempt
    #[arg(long, env = "CORPUSRAG_BACKOFF_GROWTH", default_value_t = 1.8)]
    pub backoff_growth: f64,

    /// Ceiling on a single backoff delay in milliseconds
    #[arg(long, env = "CORPUSRAG_BACKOFF_MAX_MS", default_value_t = 60_000)]
    pub backoff_max_ms: u64,

    /// Upper bound of the random jitter added to each delay, in milliseconds
    #[arg(long, env = "CORPUSRAG_JITTER_MS", default_value_t = 300)]
    pub jitter_ms: u64,

    /// Preview the selection without writing anything
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Seed for the input shuffle (random when omitted)
    #[arg(long, env = "CORPUSRAG_SHUFFLE_SEED")]
    pub shuffle_seed: Option<u64>,
}

impl PipelineArgs {
    /// Converts the parsed flags into a validated `PipelineConfig`.
    pub fn build_config(&self) -> Result<PipelineConfig, ConfigError> {
        let retry = RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.backoff_base_ms),
            self.backoff_growth,
            Duration::from_millis(self.backoff_max_ms),
            Duration::from_millis(self.jitter_ms),
        )?;
        Ok(PipelineConfig::new(self.max_in_flight, retry)?
            .with_log_every(self.log_every)
            .with_dry_run(self.dry_run)
            .with_shuffle_seed(self.shuffle_seed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        retrieval: RetrievalArgs,
        #[command(flatten)]
        pipeline: PipelineArgs,
    }

    #[test]
    fn top_k_is_clamped() {
        let config = RetrievalConfig::default();
        assert_eq!(config.effective_top_k(None), 5);
        assert_eq!(config.effective_top_k(Some(0)), 1);
        assert_eq!(config.effective_top_k(Some(7)), 7);
        assert_eq!(config.effective_top_k(Some(500)), 20);
        assert_eq!(config.effective_top_k(Some(-3)), 1);
        assert_eq!(config.effective_top_k(Some(i64::MAX)), 20);
    }

    #[test]
    fn unvalidated_zero_maximum_still_returns_one() {
        let config = RetrievalConfig::default().with_top_k(5, 0);
        assert_eq!(config.effective_top_k(None), 1);
        assert_eq!(config.effective_top_k(Some(9)), 1);
    }

    #[test]
    fn defaults_parse_into_valid_configs() {
        let cli = TestCli::parse_from(["test"]);
        let retrieval = cli.retrieval.build_config().expect("retrieval config");
        assert_eq!(retrieval, RetrievalConfig::default());
        let pipeline = cli.pipeline.build_config().expect("pipeline config");
        assert_eq!(pipeline.max_in_flight(), 150);
        assert_eq!(pipeline.retry(), &RetryPolicy::default());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let cli = TestCli::parse_from(["test", "--similarity-floor", "1.5"]);
        assert!(matches!(
            cli.retrieval.build_config(),
            Err(ConfigError::FloorOutOfRange(_))
        ));
        let cli = TestCli::parse_from(["test", "--max-in-flight", "0"]);
        assert!(cli.pipeline.build_config().is_err());
    }
}
