//! Defaults and tunables shared across the runtime.

/// Number of Redis keys each sampled job type contributes to the fetch script.
pub const FETCH_KEYS_PER_JOB_TYPE: usize = 6;

/// Idle backoff ladder for the worker loop, indexed by consecutive empty fetches.
pub const SLEEP_BACKOFFS_MS: [u64; 5] = [0, 10, 100, 1000, 5000];

/// Delay before retrying a fetch that failed at the transport level.
pub const FETCH_ERROR_BACKOFF_MS: u64 = 10;

pub const DEFAULT_PRIORITY: u32 = 1;
pub const MAX_PRIORITY: u32 = 100_000;
pub const DEFAULT_MAX_FAILS: u32 = 4;

/// Effective timeout when a job type declares none. Two weeks, in milliseconds.
pub const NO_TIMEOUT_SENTINEL_MS: i64 = 14 * 24 * 60 * 60 * 1000;

pub const HEARTBEAT_PERIOD_SECS: u64 = 5;

/// A pool whose heartbeat is older than this is considered dead.
pub const DEAD_POOL_CUTOFF_SECS: i64 = 5 * 60;
pub const REAP_PERIOD_SECS: u64 = 10 * 60;
pub const REAP_JITTER_SECS: u64 = 30;

pub const REQUEUE_PERIOD_MS: u64 = 1000;
pub const REQUEUE_JITTER_MS: u64 = 1000;
/// Upper bound on entries promoted per requeue pass.
pub const REQUEUE_BATCH: usize = 100;

pub const PERIODIC_LEASE_TTL_SECS: u64 = 30;
pub const PERIODIC_PERIOD_SECS: u64 = 30;
pub const PERIODIC_JITTER_SECS: u64 = 10;
/// How far ahead the periodic enqueuer materializes firing times.
pub const PERIODIC_HORIZON_SECS: i64 = 2 * 60 * 60;

/// Safety TTL on unique-job markers so a crashed worker cannot block a
/// logical job forever.
pub const UNIQUE_KEY_TTL_SECS: i64 = 24 * 60 * 60;

pub const RUN_JOB_TIMEOUT_ERROR: &str = "Run Job Timeout";
pub const STRAY_JOB_ERROR: &str = "stray job: no handler";

pub const DRAIN_JOB_PREFIX: &str = "drain_worker:";
