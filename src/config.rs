use crate::import::persister::DEFAULT_BATCH_SIZE;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn env_opt_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Default number of concurrent record writers.
pub fn default_workers() -> usize {
    num_cpus::get().clamp(4, 8)
}

/// Runtime configuration for the import engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportConfig {
    /// Records planned and written per batch.
    pub batch_size: usize,
    /// Maximum concurrent record writes inside a batch.
    pub workers: usize,
    /// Phones per existing-lead lookup query.
    pub lookup_chunk_size: usize,
    /// Upload limit for the HTTP surface, in bytes.
    pub max_upload_bytes: u64,
    /// Extra `*.json` rule sets.
    pub rules_dir: Option<PathBuf>,
    /// Overrides the tag color of every rule set.
    pub tag_color: Option<String>,
    /// How long finished HTTP jobs stay queryable.
    pub job_retention: Duration,
}

impl ImportConfig {
    pub fn from_env() -> Self {
        Self {
            batch_size: env_usize("IMPORT_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            workers: env_usize("IMPORT_WORKERS", default_workers()),
            lookup_chunk_size: env_usize("IMPORT_LOOKUP_CHUNK", 500),
            max_upload_bytes: env_usize("IMPORT_MAX_UPLOAD_MB", 20) as u64 * 1024 * 1024,
            rules_dir: env_opt_string("IMPORT_RULES_DIR").map(PathBuf::from),
            tag_color: env_opt_string("IMPORT_TAG_COLOR"),
            job_retention: Duration::from_secs(
                env_usize("IMPORT_JOB_RETENTION_MINS", 60) as u64 * 60,
            ),
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            workers: default_workers(),
            lookup_chunk_size: 500,
            max_upload_bytes: 20 * 1024 * 1024,
            rules_dir: None,
            tag_color: None,
            job_retention: Duration::from_secs(60 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ImportConfig::default();
        assert_eq!(config.batch_size, 25);
        assert!((4..=8).contains(&config.workers));
        assert_eq!(config.max_upload_bytes, 20 * 1024 * 1024);
        assert_eq!(config.job_retention, Duration::from_secs(3600));
    }

    #[test]
    fn test_env_usize_rejects_zero_and_garbage() {
        // Keys are unique to this test so parallel tests never observe them.
        unsafe {
            env::set_var("LEAD_IMPORT_TEST_ZERO", "0");
            env::set_var("LEAD_IMPORT_TEST_GARBAGE", "many");
        }
        assert_eq!(env_usize("LEAD_IMPORT_TEST_ZERO", 7), 7);
        assert_eq!(env_usize("LEAD_IMPORT_TEST_GARBAGE", 3), 3);
        assert_eq!(env_usize("LEAD_IMPORT_TEST_UNSET", 9), 9);
    }
}
