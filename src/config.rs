use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ErrorKind, PoolError, Result};

pub const DEFAULT_MAX_WORKERS: usize = 4;
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on execution units; the real count is also capped by
    /// available hardware parallelism.
    pub max_workers: usize,
    /// Delay before a faulted unit is replaced.
    pub restart_delay: Duration,
    /// Timeout for fetching remote image sources.
    pub fetch_timeout: Duration,
    /// Optional JSON preprocessor config handed to the pipeline loader.
    pub processor_config: Option<PathBuf>,
    /// Overrides detected hardware parallelism when set.
    pub parallelism: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            restart_delay: DEFAULT_RESTART_DELAY,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            processor_config: None,
            parallelism: None,
        }
    }
}

/// Compile-time value first, then the process environment.
fn lookup(key: &'static str, compiled: Option<&'static str>) -> Option<String> {
    compiled
        .map(String::from)
        .or_else(|| env::var(key).ok())
        .filter(|v| !v.trim().is_empty())
}

fn parse<T: FromStr>(key: &'static str, raw: Option<String>) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    raw.map(|v| {
        v.trim().parse::<T>().map_err(|e| {
            PoolError::with_kind(ErrorKind::Config, "invalid_config_value")
                .push_str(format!("{}={:?}: {}", key, v, e))
        })
    })
    .transpose()
}

impl PoolConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let max_workers = parse::<usize>(
            "REMBG_MAX_WORKERS",
            lookup("REMBG_MAX_WORKERS", option_env!("REMBG_MAX_WORKERS")),
        )?
        .unwrap_or(defaults.max_workers);

        if max_workers == 0 {
            return Err(PoolError::with_kind(ErrorKind::Config, "invalid_config_value")
                .push_str("REMBG_MAX_WORKERS must be at least 1"));
        }

        let restart_delay = parse::<u64>(
            "REMBG_RESTART_DELAY_MS",
            lookup("REMBG_RESTART_DELAY_MS", option_env!("REMBG_RESTART_DELAY_MS")),
        )?
        .map(Duration::from_millis)
        .unwrap_or(defaults.restart_delay);

        let fetch_timeout = parse::<u64>(
            "REMBG_FETCH_TIMEOUT_SECS",
            lookup("REMBG_FETCH_TIMEOUT_SECS", option_env!("REMBG_FETCH_TIMEOUT_SECS")),
        )?
        .map(Duration::from_secs)
        .unwrap_or(defaults.fetch_timeout);

        let processor_config = lookup("REMBG_PROCESSOR_CONFIG", option_env!("REMBG_PROCESSOR_CONFIG"))
            .map(PathBuf::from);

        Ok(Self {
            max_workers,
            restart_delay,
            fetch_timeout,
            processor_config,
            parallelism: None,
        })
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism.max(1));
        self
    }

    pub fn with_processor_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.processor_config = Some(path.into());
        self
    }

    /// `min(max_workers, available_parallelism)`, never zero.
    pub fn unit_count(&self) -> usize {
        let hardware = self.parallelism.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(DEFAULT_MAX_WORKERS)
        });
        self.max_workers.min(hardware).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// The process environment is shared by every test thread.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const KEYS: [&str; 4] = [
        "REMBG_MAX_WORKERS",
        "REMBG_RESTART_DELAY_MS",
        "REMBG_FETCH_TIMEOUT_SECS",
        "REMBG_PROCESSOR_CONFIG",
    ];

    fn from_env_with(vars: &[(&str, &str)]) -> Result<PoolConfig> {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: ENV_LOCK serializes every test that touches these variables.
        unsafe {
            for key in KEYS {
                env::remove_var(key);
            }
            for (key, value) in vars {
                env::set_var(key, value);
            }
        }
        let config = PoolConfig::from_env();
        unsafe {
            for key in KEYS {
                env::remove_var(key);
            }
        }
        config
    }

    #[test]
    fn from_env_defaults_when_unset() {
        let cfg = from_env_with(&[]).unwrap();
        assert_eq!(cfg.max_workers, DEFAULT_MAX_WORKERS);
        assert_eq!(cfg.restart_delay, DEFAULT_RESTART_DELAY);
        assert_eq!(cfg.fetch_timeout, DEFAULT_FETCH_TIMEOUT);
        assert_eq!(cfg.processor_config, None);
        assert_eq!(cfg.parallelism, None);
    }

    #[test]
    fn from_env_reads_every_variable() {
        let cfg = from_env_with(&[
            ("REMBG_MAX_WORKERS", "2"),
            ("REMBG_RESTART_DELAY_MS", "250"),
            ("REMBG_FETCH_TIMEOUT_SECS", " 5 "),
            ("REMBG_PROCESSOR_CONFIG", "/etc/rembg/preprocessor_config.json"),
        ])
        .unwrap();
        assert_eq!(cfg.max_workers, 2);
        assert_eq!(cfg.restart_delay, Duration::from_millis(250));
        assert_eq!(cfg.fetch_timeout, Duration::from_secs(5));
        assert_eq!(
            cfg.processor_config,
            Some(PathBuf::from("/etc/rembg/preprocessor_config.json"))
        );
    }

    #[test]
    fn from_env_treats_blank_as_unset() {
        let cfg = from_env_with(&[("REMBG_MAX_WORKERS", "  "), ("REMBG_PROCESSOR_CONFIG", "")]).unwrap();
        assert_eq!(cfg.max_workers, DEFAULT_MAX_WORKERS);
        assert_eq!(cfg.processor_config, None);
    }

    #[test]
    fn from_env_rejects_zero_and_garbage() {
        let err = from_env_with(&[("REMBG_MAX_WORKERS", "0")]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
        assert!(err.message().contains("at least 1"));

        let err = from_env_with(&[("REMBG_RESTART_DELAY_MS", "soon")]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
        assert!(err.message().contains("REMBG_RESTART_DELAY_MS"));
    }

    #[test]
    fn parse_reports_the_offending_key() {
        let err = parse::<usize>("REMBG_MAX_WORKERS", Some("many".into())).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
        assert!(err.message().contains("REMBG_MAX_WORKERS"));
    }

    #[test]
    fn parse_missing_is_none() {
        assert_eq!(parse::<u64>("REMBG_RESTART_DELAY_MS", None).unwrap(), None);
        assert_eq!(parse::<u64>("REMBG_RESTART_DELAY_MS", Some(" 250 ".into())).unwrap(), Some(250));
    }

    #[test]
    fn unit_count_is_capped_and_positive() {
        let cfg = PoolConfig::default().with_max_workers(1);
        assert_eq!(cfg.unit_count(), 1);

        let cfg = PoolConfig::default().with_max_workers(10_000);
        assert!(cfg.unit_count() >= 1);
        assert!(cfg.unit_count() <= 10_000);

        let cfg = PoolConfig::default().with_max_workers(8).with_parallelism(3);
        assert_eq!(cfg.unit_count(), 3);
        let cfg = PoolConfig::default().with_max_workers(2).with_parallelism(16);
        assert_eq!(cfg.unit_count(), 2);
    }
}
