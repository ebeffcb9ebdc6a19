use std::path::Path;
use std::time::Duration;

use scan_core::Pipeline;

use crate::PipelineError;

/// Sizing and timing of the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub worker_count: usize,
    /// Visibility window of a leased delivery.
    pub lease: Duration,
    /// A job delivered more often than this is failed.
    pub max_deliveries: u32,
    /// Base delay between polls of an empty broker.
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            lease: Duration::from_secs(60),
            max_deliveries: 5,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl PoolConfig {
    /// Read `WORKER_COUNT`, `LEASE_SECS`, `MAX_DELIVERIES` and
    /// `POLL_INTERVAL_MS`. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, PipelineError> {
        let defaults = Self::default();
        let worker_count = parse_var("WORKER_COUNT")?.unwrap_or(defaults.worker_count);
        if worker_count == 0 {
            return Err(PipelineError::Config("WORKER_COUNT must be at least 1".into()));
        }
        let lease_secs: u64 = parse_var("LEASE_SECS")?.unwrap_or(defaults.lease.as_secs());
        if lease_secs == 0 {
            return Err(PipelineError::Config("LEASE_SECS must be at least 1".into()));
        }
        Ok(Self {
            worker_count,
            lease: Duration::from_secs(lease_secs),
            max_deliveries: parse_var("MAX_DELIVERIES")?.unwrap_or(defaults.max_deliveries),
            poll_interval: parse_var("POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
        })
    }

    /// How often a busy worker renews its lease.
    pub fn renew_interval(&self) -> Duration {
        (self.lease / 3).max(Duration::from_millis(50))
    }

    /// How often the broker looks for lapsed leases.
    pub fn lease_check_interval(&self) -> Duration {
        (self.lease / 4).clamp(Duration::from_millis(50), Duration::from_secs(5))
    }
}

/// Load the pipeline named by `PIPELINE_CONFIG`, or the built-in COLMAP
/// pipeline when it is unset.
pub fn pipeline_from_env() -> Result<Pipeline, PipelineError> {
    match std::env::var("PIPELINE_CONFIG") {
        Ok(path) if !path.trim().is_empty() => load_pipeline(Path::new(path.trim())),
        _ => Ok(Pipeline::colmap_default()),
    }
}

pub fn load_pipeline(path: &Path) -> Result<Pipeline, PipelineError> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    Pipeline::from_json(&json).map_err(|e| PipelineError::Config(e.to_string()))
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, PipelineError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PipelineError::Config(format!("invalid value for {name}: {raw}"))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_scale_with_the_lease() {
        let config = PoolConfig {
            lease: Duration::from_secs(30),
            ..Default::default()
        };
        assert_eq!(config.renew_interval(), Duration::from_secs(10));
        assert_eq!(config.lease_check_interval(), Duration::from_secs(5));

        let short = PoolConfig {
            lease: Duration::from_millis(400),
            ..Default::default()
        };
        assert_eq!(short.lease_check_interval(), Duration::from_millis(100));
    }

    #[test]
    fn loads_pipeline_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(
            &path,
            r#"{"stages": [
                {"name": "ingest", "action": {"kind": "ingest_bundle"}},
                {"name": "echo", "action": {"kind": "tool", "program": "echo", "args": ["{work}"]}}
            ]}"#,
        )
        .unwrap();
        let pipeline = load_pipeline(&path).unwrap();
        assert_eq!(pipeline.len(), 2);
        assert_eq!(pipeline.first().name, "ingest");

        assert!(matches!(
            load_pipeline(&dir.path().join("missing.json")),
            Err(PipelineError::Config(_))
        ));
    }
}
