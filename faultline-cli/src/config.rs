//! TOML run configuration, layered under command-line flags.

use anyhow::Context as _;
use serde::Deserialize;
use std::path::Path;

/// Values a config file may provide. Every field is optional: the effective
/// setting is flag, then file, then built-in default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub workload: Option<String>,
    pub concurrency: Option<usize>,
    /// Total workload duration in seconds.
    pub time_limit: Option<f64>,
    /// Target op rate per second across all threads.
    pub rate: Option<f64>,
    /// Seconds between nemesis operations; 0 disables the nemesis.
    pub nemesis_interval: Option<f64>,
    /// Probability that a store operation turns indeterminate.
    pub fault_probability: Option<f64>,
    /// Deliberately lose acknowledged writes, to demonstrate invalid runs.
    pub buggy: Option<bool>,
    pub nodes: Option<Vec<String>>,
}

impl RunConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "workload = \"set\"\nconcurrency = 8\ntime_limit = 3.5\nnodes = [\"n1\", \"n2\"]"
        )
        .unwrap();
        let config = RunConfig::load(file.path()).unwrap();
        assert_eq!(config.workload.as_deref(), Some("set"));
        assert_eq!(config.concurrency, Some(8));
        assert_eq!(config.time_limit, Some(3.5));
        assert_eq!(config.nodes.as_deref().map(|n| n.len()), Some(2));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "concurrencyy = 8").unwrap();
        assert!(RunConfig::load(file.path()).is_err());
    }
}
