//! Centralized typed configuration, populated once at startup from the
//! environment. Collaborators consume a [`Config`] by injection rather than
//! reading `std::env` themselves.

use std::env;
use std::time::Duration;

use anyhow::Context;

const DEFAULT_DRAFT_TTL_HOURS: i64 = 6;
const DEFAULT_DRAFT_CLEANUP_INTERVAL_MINUTES: i64 = 15;
const DEFAULT_TASK_PROCESSING_TTL_SECONDS: u64 = 3600;
const TASK_PROCESSING_TTL_FLOOR_SECONDS: u64 = 30;
const DEFAULT_TASK_REAPER_INTERVAL_SECONDS: u64 = 30;
const TASK_REAPER_INTERVAL_FLOOR_SECONDS: u64 = 5;
const DEFAULT_DATA_DIR: &str = "./data";

#[derive(Clone, Debug)]
pub struct Config {
    /// `SBM_DRAFT_TTL_HOURS`. `<= 0` disables draft cleanup entirely.
    pub draft_ttl_hours: i64,
    /// `SBM_DRAFT_CLEANUP_INTERVAL_MINUTES`. `<= 0` disables the sweeper.
    pub draft_cleanup_interval_minutes: i64,
    /// `SBM_TASK_PROCESSING_TTL_SECONDS`, floored at 30.
    pub task_processing_ttl: Duration,
    /// `SBM_TASK_REAPER_INTERVAL_SECONDS`, floored at 5.
    pub task_reaper_interval: Duration,
    /// `SBM_OCR_CACHE_TTL_HOURS`. `0` means never expire.
    pub ocr_cache_ttl_hours: u64,
    /// `SBM_OCR_CACHE_DIR`, falling back to `DATA_DIR`.
    pub ocr_cache_dir: String,
    /// `DATA_DIR`, default `./data`.
    pub data_dir: String,
    /// `SBM_REGRESSION_SAMPLES_DIR`, override for fixture import.
    pub regression_samples_dir: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = env_or(env::var("DATA_DIR"), DEFAULT_DATA_DIR.to_string());
        let ocr_cache_dir =
            env::var("SBM_OCR_CACHE_DIR").unwrap_or_else(|_| data_dir.clone());

        Ok(Self {
            draft_ttl_hours: env_parse_or(
                "SBM_DRAFT_TTL_HOURS",
                DEFAULT_DRAFT_TTL_HOURS,
            )?,
            draft_cleanup_interval_minutes: env_parse_or(
                "SBM_DRAFT_CLEANUP_INTERVAL_MINUTES",
                DEFAULT_DRAFT_CLEANUP_INTERVAL_MINUTES,
            )?,
            task_processing_ttl: Duration::from_secs(
                env_parse_or::<u64>(
                    "SBM_TASK_PROCESSING_TTL_SECONDS",
                    DEFAULT_TASK_PROCESSING_TTL_SECONDS,
                )?
                .max(TASK_PROCESSING_TTL_FLOOR_SECONDS),
            ),
            task_reaper_interval: Duration::from_secs(
                env_parse_or::<u64>(
                    "SBM_TASK_REAPER_INTERVAL_SECONDS",
                    DEFAULT_TASK_REAPER_INTERVAL_SECONDS,
                )?
                .max(TASK_REAPER_INTERVAL_FLOOR_SECONDS),
            ),
            ocr_cache_ttl_hours: env_parse_or("SBM_OCR_CACHE_TTL_HOURS", 0)?,
            ocr_cache_dir,
            data_dir,
            regression_samples_dir: env::var("SBM_REGRESSION_SAMPLES_DIR").ok(),
        })
    }

    /// Draft cleanup is disabled when either knob is non-positive.
    pub fn draft_cleanup_enabled(&self) -> bool {
        self.draft_ttl_hours > 0 && self.draft_cleanup_interval_minutes > 0
    }
}

fn env_or(result: Result<String, env::VarError>, default: String) -> String {
    result.unwrap_or(default)
}

fn env_parse_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(s) => s.parse::<T>().with_context(|| format!("invalid {key}: {s}")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(e).context(format!("invalid unicode in {key}")),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        // SAFETY: test runs single-threaded within this process's env.
        for key in [
            "SBM_DRAFT_TTL_HOURS",
            "SBM_DRAFT_CLEANUP_INTERVAL_MINUTES",
            "SBM_TASK_PROCESSING_TTL_SECONDS",
            "SBM_TASK_REAPER_INTERVAL_SECONDS",
            "SBM_OCR_CACHE_TTL_HOURS",
            "SBM_OCR_CACHE_DIR",
            "DATA_DIR",
            "SBM_REGRESSION_SAMPLES_DIR",
        ] {
            env::remove_var(key);
        }

        let config = Config::from_env().unwrap();
        assert_eq!(config.draft_ttl_hours, 6);
        assert_eq!(config.draft_cleanup_interval_minutes, 15);
        assert_eq!(config.task_processing_ttl, Duration::from_secs(3600));
        assert_eq!(config.task_reaper_interval, Duration::from_secs(30));
        assert_eq!(config.data_dir, "./data");
        assert!(config.draft_cleanup_enabled());
    }

    #[test]
    fn floors_are_enforced() {
        env::set_var("SBM_TASK_PROCESSING_TTL_SECONDS", "1");
        env::set_var("SBM_TASK_REAPER_INTERVAL_SECONDS", "1");
        let config = Config::from_env().unwrap();
        assert_eq!(config.task_processing_ttl, Duration::from_secs(30));
        assert_eq!(config.task_reaper_interval, Duration::from_secs(5));
        env::remove_var("SBM_TASK_PROCESSING_TTL_SECONDS");
        env::remove_var("SBM_TASK_REAPER_INTERVAL_SECONDS");
    }
}
