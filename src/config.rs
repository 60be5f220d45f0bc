//! Process configuration, loaded once from the environment and threaded
//! through every component constructor.

use std::path::PathBuf;

/// Startup failure classes, mapped to the dispatcher's exit codes.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("store unreachable: {0}")]
    Store(String),
    #[error("sandbox unavailable: {0}")]
    Sandbox(String),
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => 1,
            StartupError::Store(_) => 2,
            StartupError::Sandbox(_) => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub problem_root: PathBuf,
    /// Dispatcher worker pool size
    pub workers: u32,
    /// Sandbox box free-list size; must cover every worker
    pub sandbox_boxes: u32,
    /// Mining epoch, milliseconds
    pub epoch_ms: u64,
    pub points_alpha: f64,
    pub points_min: f64,
    /// Lease window before the reaper reclaims a claimed submission
    pub max_lease_ms: u64,
    /// Judging attempts before a submission is poisoned
    pub max_attempts: i64,
    /// Worker dequeue poll interval
    pub poll_ms: u64,
    pub compile_cpu_ms: u64,
    pub compile_mem_kib: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, StartupError> {
        let workers = env_parse("WORKERS", num_cpus::get() as u32)?;
        let sandbox_boxes = env_parse("SANDBOX_BOXES", workers.max(8))?;

        let config = Self {
            database_url: env_string("DATABASE_URL", "sqlite://chainjudge.db"),
            problem_root: PathBuf::from(env_string(
                "PROBLEM_ROOT",
                "/var/lib/chainjudge/problems",
            )),
            workers,
            sandbox_boxes,
            epoch_ms: env_parse("EPOCH_MS", 600_000u64)?,
            points_alpha: env_parse("POINTS_ALPHA", 10.0f64)?,
            points_min: env_parse("POINTS_MIN", 1.0f64)?,
            max_lease_ms: env_parse("MAX_LEASE_MS", 120_000u64)?,
            max_attempts: env_parse("MAX_ATTEMPTS", 3i64)?,
            poll_ms: env_parse("POLL_MS", 500u64)?,
            compile_cpu_ms: env_parse("COMPILE_CPU_MS", 30_000u64)?,
            compile_mem_kib: env_parse("COMPILE_MEM_KIB", 2_097_152u64)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), StartupError> {
        if self.workers == 0 {
            return Err(StartupError::Config("WORKERS must be at least 1".into()));
        }
        if self.sandbox_boxes < self.workers {
            return Err(StartupError::Config(format!(
                "SANDBOX_BOXES ({}) must be >= WORKERS ({})",
                self.sandbox_boxes, self.workers
            )));
        }
        if self.epoch_ms == 0 {
            return Err(StartupError::Config("EPOCH_MS must be positive".into()));
        }
        if self.points_alpha <= 0.0 {
            return Err(StartupError::Config("POINTS_ALPHA must be positive".into()));
        }
        if self.points_min < 1.0 {
            return Err(StartupError::Config("POINTS_MIN must be at least 1".into()));
        }
        if self.max_attempts < 1 {
            return Err(StartupError::Config("MAX_ATTEMPTS must be at least 1".into()));
        }
        Ok(())
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T, StartupError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| StartupError::Config(format!("invalid {}={}: {}", key, raw, e))),
        Err(_) => Ok(default),
    }
}
