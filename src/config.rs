use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::engine::FlushPolicy;
use crate::error::ConfigError;

/// Engine configuration, usually loaded from JSON. Every field has a default,
/// so `{}` is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Hosts of the cluster and the work type served by each of their ranks.
    pub hosts: Vec<HostConfig>,
    /// Work types beyond the built-in `control` and `work`.
    pub work_types: Vec<String>,
    /// How long a soft-targeted task waits for its busy target before any
    /// other rank may take it.
    pub soft_target_wait_ms: u64,
    /// Whether read references are counted. Without them data is never freed.
    pub read_refcounts: bool,
    pub checkpoint: Option<CheckpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub name: String,
    /// One entry per rank on this host, naming the work type it serves.
    pub ranks: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    pub path: Utf8PathBuf,
    #[serde(default)]
    pub flush: FlushPolicy,
}

impl Default for Config {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::local(1, workers)
    }
}

impl Config {
    /// A single `localhost` with `control` control ranks followed by `workers`
    /// worker ranks.
    pub fn local(control: usize, workers: usize) -> Self {
        let mut ranks = vec!["control".to_string(); control];
        ranks.extend(std::iter::repeat_n("work".to_string(), workers));
        Self {
            hosts: vec![HostConfig {
                name: "localhost".into(),
                ranks,
            }],
            work_types: Vec::new(),
            soft_target_wait_ms: 10,
            read_refcounts: true,
            checkpoint: None,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = Config::from_json_str("{}").unwrap();
        assert_eq!(config.soft_target_wait_ms, 10);
        assert!(config.read_refcounts);
        assert!(config.checkpoint.is_none());
        assert_eq!(config.hosts.len(), 1);
        assert_eq!(config.hosts[0].ranks[0], "control");
    }

    #[test]
    fn test_checkpoint_section() {
        let config = Config::from_json_str(
            r#"{ "checkpoint": { "path": "ckpt.cbor", "flush": "always" }, "read_refcounts": false }"#,
        )
        .unwrap();
        let checkpoint = config.checkpoint.unwrap();
        assert_eq!(checkpoint.path.as_str(), "ckpt.cbor");
        assert_eq!(checkpoint.flush, FlushPolicy::Always);
        assert!(!config.read_refcounts);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            Config::from_json_str(r#"{ "ranks": 4 }"#),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("sluice.json")).unwrap();
        std::fs::write(&path, r#"{ "soft_target_wait_ms": 50 }"#).unwrap();
        let config = Config::from_json_file(&path).unwrap();
        assert_eq!(config.soft_target_wait_ms, 50);
    }
}
