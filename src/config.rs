use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Requests in the current window before the failure rate is considered.
    pub min_requests_for_rate: u32,
    pub failure_rate_threshold: f64,
    /// Requests per measurement window; counters reset when it fills.
    pub window_size: u32,
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            min_requests_for_rate: 10,
            failure_rate_threshold: 0.5,
            window_size: 100,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyConfig {
    pub record_ttl: Duration,
    /// Lifetime of the claim taken by `start_processing`.
    pub lease_ttl: Duration,
    pub max_attempts: u32,
    pub max_event_id_len: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(24 * 60 * 60),
            lease_ttl: Duration::from_secs(5 * 60),
            max_attempts: 6,
            max_event_id_len: 255,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    pub batch_size: usize,
    pub lease_ttl: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(300_000),
            multiplier: 2.0,
            jitter: true,
            batch_size: 10,
            lease_ttl: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DlqConfig {
    pub enabled: bool,
    pub max_size: usize,
    /// Queue length above which every insert raises a size warning.
    pub warn_threshold: usize,
    pub retention: Duration,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 1000,
            warn_threshold: 100,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggerConfig {
    pub max_entries: usize,
    pub max_per_correlation: usize,
    pub max_per_index: usize,
    pub retention: Duration,
    pub source: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_per_correlation: 100,
            max_per_index: 1000,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            source: "webhook-pipeline".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub processing_timeout: Duration,
    /// Abort the processor task when the timeout fires instead of letting it finish.
    pub abort_on_timeout: bool,
    pub enable_retries: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            processing_timeout: Duration::from_millis(30_000),
            abort_on_timeout: false,
            enable_retries: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweeperConfig {
    pub retry_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineConfig {
    pub circuit: CircuitConfig,
    pub idempotency: IdempotencyConfig,
    pub retry: RetryConfig,
    pub dlq: DlqConfig,
    pub logger: LoggerConfig,
    pub orchestrator: OrchestratorConfig,
    pub sweeper: SweeperConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from `WEBHOOK_*` variables resolved by `lookup`.
    /// Unparseable values keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(parsed) = read::<u32>(&lookup, "WEBHOOK_CIRCUIT_FAILURE_THRESHOLD") {
            config.circuit.failure_threshold = parsed.max(1);
        }
        if let Some(parsed) = read::<f64>(&lookup, "WEBHOOK_CIRCUIT_FAILURE_RATE") {
            config.circuit.failure_rate_threshold = parsed.clamp(0.0, 1.0);
        }
        if let Some(parsed) = read::<u32>(&lookup, "WEBHOOK_CIRCUIT_MIN_REQUESTS") {
            config.circuit.min_requests_for_rate = parsed.max(1);
        }
        if let Some(parsed) = read::<u64>(&lookup, "WEBHOOK_CIRCUIT_COOLDOWN_MS") {
            config.circuit.cooldown = Duration::from_millis(parsed);
        }

        if let Some(parsed) = read::<u64>(&lookup, "WEBHOOK_IDEMPOTENCY_TTL_SECS") {
            config.idempotency.record_ttl = Duration::from_secs(parsed.max(1));
        }
        if let Some(parsed) = read::<u64>(&lookup, "WEBHOOK_IDEMPOTENCY_LEASE_SECS") {
            config.idempotency.lease_ttl = Duration::from_secs(parsed.max(1));
        }
        if let Some(parsed) = read::<u32>(&lookup, "WEBHOOK_MAX_ATTEMPTS") {
            config.idempotency.max_attempts = parsed.max(1);
        }

        if let Some(parsed) = read::<u32>(&lookup, "WEBHOOK_RETRY_MAX_RETRIES") {
            config.retry.max_retries = parsed.max(1);
        }
        if let Some(parsed) = read::<u64>(&lookup, "WEBHOOK_RETRY_BASE_DELAY_MS") {
            config.retry.base_delay = Duration::from_millis(parsed);
        }
        if let Some(parsed) = read::<u64>(&lookup, "WEBHOOK_RETRY_MAX_DELAY_MS") {
            config.retry.max_delay = Duration::from_millis(parsed);
        }
        if let Some(parsed) = read::<f64>(&lookup, "WEBHOOK_RETRY_MULTIPLIER") {
            config.retry.multiplier = parsed.max(1.0);
        }
        if let Some(parsed) = read::<bool>(&lookup, "WEBHOOK_RETRY_JITTER") {
            config.retry.jitter = parsed;
        }
        if let Some(parsed) = read::<usize>(&lookup, "WEBHOOK_RETRY_BATCH_SIZE") {
            config.retry.batch_size = parsed.max(1);
        }

        if let Some(parsed) = read::<bool>(&lookup, "WEBHOOK_DLQ_ENABLED") {
            config.dlq.enabled = parsed;
        }
        if let Some(parsed) = read::<usize>(&lookup, "WEBHOOK_DLQ_MAX_SIZE") {
            config.dlq.max_size = parsed.max(1);
        }
        if let Some(parsed) = read::<usize>(&lookup, "WEBHOOK_DLQ_WARN_THRESHOLD") {
            config.dlq.warn_threshold = parsed;
        }
        if let Some(parsed) = read::<u64>(&lookup, "WEBHOOK_DLQ_RETENTION_SECS") {
            config.dlq.retention = Duration::from_secs(parsed.max(1));
        }

        if let Some(parsed) = read::<usize>(&lookup, "WEBHOOK_LOG_MAX_ENTRIES") {
            config.logger.max_entries = parsed.max(1);
        }
        if let Some(parsed) = read::<u64>(&lookup, "WEBHOOK_LOG_RETENTION_SECS") {
            config.logger.retention = Duration::from_secs(parsed.max(1));
        }

        if let Some(parsed) = read::<u64>(&lookup, "WEBHOOK_PROCESSING_TIMEOUT_MS") {
            config.orchestrator.processing_timeout = Duration::from_millis(parsed.max(1));
        }
        if let Some(parsed) = read::<bool>(&lookup, "WEBHOOK_ABORT_ON_TIMEOUT") {
            config.orchestrator.abort_on_timeout = parsed;
        }
        if let Some(parsed) = read::<bool>(&lookup, "WEBHOOK_RETRIES_ENABLED") {
            config.orchestrator.enable_retries = parsed;
        }

        if let Some(parsed) = read::<u64>(&lookup, "WEBHOOK_RETRY_SWEEP_INTERVAL_MS") {
            config.sweeper.retry_interval = Duration::from_millis(parsed.max(100));
        }
        if let Some(parsed) = read::<u64>(&lookup, "WEBHOOK_CLEANUP_INTERVAL_MS") {
            config.sweeper.cleanup_interval = Duration::from_millis(parsed.max(1000));
        }

        config.normalize()
    }

    /// The tracker must allow the first attempt plus every retry.
    pub fn normalize(mut self) -> Self {
        let required = self.retry.max_retries.saturating_add(1);
        if self.idempotency.max_attempts < required {
            tracing::warn!(
                configured = self.idempotency.max_attempts,
                required,
                "raising idempotency max_attempts to cover the retry budget"
            );
            self.idempotency.max_attempts = required;
        }
        if self.retry.max_delay < self.retry.base_delay {
            self.retry.max_delay = self.retry.base_delay;
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub bind_addr: String,
    pub signing_secret: Option<String>,
    pub admin_token: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:webhooks.db".to_string()),
            bind_addr: std::env::var("WEBHOOK_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:3002".to_string()),
            signing_secret: non_empty(std::env::var("WEBHOOK_SIGNING_SECRET").ok()),
            admin_token: non_empty(std::env::var("WEBHOOK_ADMIN_TOKEN").ok()),
        }
    }
}

fn read<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|value| value.trim().parse::<T>().ok())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
