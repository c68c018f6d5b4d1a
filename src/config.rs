use std::env;
use std::time::Duration;

/// Upstream API endpoints and consumer credentials.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub rest_url: String,
    pub upload_url: String,
    pub replace_url: String,
    pub request_token_url: String,
    pub access_token_url: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            consumer_key: String::new(),
            consumer_secret: String::new(),
            rest_url: String::new(),
            upload_url: String::new(),
            replace_url: String::new(),
            request_token_url: String::new(),
            access_token_url: String::new(),
        }
    }
}

/// Retry, archiving and callback policy for jobs.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Total delivery attempts before a job is dead-lettered.
    pub max_attempts: u32,
    /// Archive completed jobs to durable storage.
    pub archive_completions: bool,
    /// Archive exhausted failures to durable storage.
    pub archive_failures: bool,
    pub callback: CallbackConfig,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            archive_completions: false,
            archive_failures: true,
            callback: CallbackConfig::default(),
        }
    }
}

/// Webhook callback delivery policy.
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    pub enabled: bool,
    /// POST attempts per callback.
    pub attempts: u32,
    /// Fixed delay between attempts (not exponential).
    pub delay: Duration,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            attempts: 3,
            delay: Duration::from_millis(1000),
        }
    }
}

/// Idempotent response cache settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 300,
            prefix: "dispatch:cache:".to_string(),
        }
    }
}

/// Per-user fixed-window rate limit settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Admitted calls per user per second; 0 disables the limiter.
    pub per_second: u32,
    pub prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 1,
            prefix: "dispatch:ratelimit:sec:".to_string(),
        }
    }
}

/// Consumer settings for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent in-flight messages per queue pipeline.
    pub concurrency: usize,
    pub rest_concurrency: usize,
    pub upload_concurrency: usize,
    pub replace_concurrency: usize,
    /// Delay before a rate-limit-denied message is requeued.
    pub requeue_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            rest_concurrency: 1,
            upload_concurrency: 1,
            replace_concurrency: 1,
            requeue_delay: Duration::from_secs(1),
        }
    }
}

/// Top-level configuration tree.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub jobs: JobsConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub worker: WorkerConfig,
}

impl Config {
    /// Build a configuration from environment variables, falling back to the
    /// defaults above for anything unset.
    pub fn from_env() -> Self {
        let default_concurrency = env_usize("WORKER_CONCURRENCY", 1);
        Self {
            upstream: UpstreamConfig {
                consumer_key: env_string("UPSTREAM_CONSUMER_KEY", ""),
                consumer_secret: env_string("UPSTREAM_CONSUMER_SECRET", ""),
                rest_url: env_string("UPSTREAM_REST_URL", ""),
                upload_url: env_string("UPSTREAM_UPLOAD_URL", ""),
                replace_url: env_string("UPSTREAM_REPLACE_URL", ""),
                request_token_url: env_string("UPSTREAM_REQUEST_TOKEN_URL", ""),
                access_token_url: env_string("UPSTREAM_ACCESS_TOKEN_URL", ""),
            },
            jobs: JobsConfig {
                max_attempts: env_u32("JOB_RETRY_ATTEMPTS", 3),
                archive_completions: env_bool("SAVE_COMPLETED_JOBS", false),
                archive_failures: env_bool("SAVE_FAILED_JOBS", true),
                callback: CallbackConfig {
                    enabled: env_bool("CALLBACK_ENABLED", true),
                    attempts: env_u32("CALLBACK_RETRY_ATTEMPTS", 3),
                    delay: Duration::from_millis(env_u64("CALLBACK_RETRY_DELAY_MS", 1000)),
                },
            },
            cache: CacheConfig {
                enabled: env_bool("CACHE_ENABLED", true),
                ttl_seconds: env_u64("CACHE_TTL_SECONDS", 300),
                prefix: env_string("CACHE_PREFIX", "dispatch:cache:"),
            },
            rate_limit: RateLimitConfig {
                per_second: env_u32("RATE_LIMIT_PER_SECOND", 1),
                prefix: env_string("RATE_LIMIT_SECOND_PREFIX", "dispatch:ratelimit:sec:"),
            },
            worker: WorkerConfig {
                concurrency: default_concurrency,
                rest_concurrency: env_usize("WORKER_REST_CONCURRENCY", default_concurrency),
                upload_concurrency: env_usize("WORKER_UPLOAD_CONCURRENCY", default_concurrency),
                replace_concurrency: env_usize("WORKER_REPLACE_CONCURRENCY", default_concurrency),
                requeue_delay: Duration::from_millis(env_u64("RATE_LIMIT_REQUEUE_DELAY_MS", 1000)),
            },
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => value != "false" && value != "0",
        Err(_) => default,
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
