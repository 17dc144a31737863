use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Defaults loaded from `~/.config/rawarc/config.toml`; every value can be
/// overridden per run with the matching CLI flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RawarcConfig {
    /// Downloader tasks per stream (audio and video each get this many).
    pub threads: usize,
    /// Retry budget per segment before it is requeued or given up.
    pub fail_threshold: u32,
    /// Transport-level retries within a single segment attempt.
    pub connect_retries: u32,
    /// How many times a segment that exhausted its budget is requeued.
    pub requeue_failed: u32,
    /// Seconds a requeued segment waits before its next attempt.
    pub requeue_delay_secs: u64,
    /// Whether the final segment may be requeued (the live tail is often
    /// simply not available yet).
    pub requeue_last: bool,
    /// Prefer the QUIC transport when built with the `http3` feature.
    pub use_quic: bool,
    /// fsync segment files before the atomic rename.
    pub fsync: bool,
    /// Default log level (debug, info, warn, error).
    pub log_level: String,
}

impl Default for RawarcConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            fail_threshold: 20,
            connect_retries: 3,
            requeue_failed: 2,
            requeue_delay_secs: 10,
            requeue_last: false,
            use_quic: true,
            fsync: false,
            log_level: "info".to_string(),
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("rawarc")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<RawarcConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = RawarcConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: RawarcConfig = toml::from_str(&data)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = RawarcConfig::default();
        assert_eq!(cfg.threads, 1);
        assert_eq!(cfg.fail_threshold, 20);
        assert_eq!(cfg.connect_retries, 3);
        assert!(!cfg.requeue_last);
        assert!(cfg.use_quic);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = RawarcConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: RawarcConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.threads, cfg.threads);
        assert_eq!(parsed.fail_threshold, cfg.fail_threshold);
        assert_eq!(parsed.log_level, cfg.log_level);
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let toml = r#"
            threads = 8
            fail_threshold = 40
        "#;
        let cfg: RawarcConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.threads, 8);
        assert_eq!(cfg.fail_threshold, 40);
        assert_eq!(cfg.connect_retries, 3);
        assert_eq!(cfg.log_level, "info");
    }
}
