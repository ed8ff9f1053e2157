//! TOML configuration with environment overrides.
//!
//! ```toml
//! [digest]
//! function = "sha256"
//!
//! [retry]
//! limit = 5
//! initial_delay_ms = 100
//! retryable_codes = ["unavailable"]
//!
//! [staging]
//! strategy = "fallback"
//! root = "/tmp/casstage"
//!
//! [store]
//! root = "casstage-store"
//! ```
//!
//! Every field is optional. Environment variables override the file:
//! `CASSTAGE_ROOT`, `CASSTAGE_STAGING_ROOT`, `CASSTAGE_HASH` and
//! `CASSTAGE_STRATEGY`.

use crate::error::{Error, Result};
use crate::hash::{DigestGenerator, HashFunction};
use crate::remote::Code;
use crate::retry::{DEFAULT_INITIAL_DELAY, DEFAULT_RETRY_LIMIT, RetryPolicy};
use crate::staging::StagingStrategy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_STORE_ROOT: &str = "CASSTAGE_ROOT";
pub const ENV_STAGING_ROOT: &str = "CASSTAGE_STAGING_ROOT";
pub const ENV_HASH: &str = "CASSTAGE_HASH";
pub const ENV_STRATEGY: &str = "CASSTAGE_STRATEGY";

/// Label used for errors in configuration that did not come from a file.
const INLINE: &str = "<inline>";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub digest: DigestConfig,
    pub retry: RetryConfig,
    pub staging: StagingConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DigestConfig {
    pub function: HashFunction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub limit: u32,
    pub initial_delay_ms: u64,
    pub retryable_codes: Vec<Code>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_RETRY_LIMIT,
            initial_delay_ms: DEFAULT_INITIAL_DELAY.as_millis() as u64,
            retryable_codes: vec![Code::Unavailable],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StagingConfig {
    pub strategy: StagingStrategy,
    /// Directory under which staged trees are created.
    pub root: PathBuf,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            strategy: StagingStrategy::default(),
            root: std::env::temp_dir().join("casstage"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("casstage-store"),
        }
    }
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(path, &content)
    }

    fn parse(origin: &Path, content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| Error::invalid_config(origin, e.to_string()))?;
        config.validate(origin)?;
        Ok(config)
    }

    fn validate(&self, origin: &Path) -> Result<()> {
        if self.retry.retryable_codes.contains(&Code::Ok) {
            return Err(Error::invalid_config(
                origin,
                "retry.retryable_codes cannot contain \"ok\"",
            ));
        }
        Ok(())
    }

    /// Override fields from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Override fields from `lookup`, which maps variable names to values.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let origin = Path::new("<environment>");

        if let Some(root) = lookup(ENV_STORE_ROOT) {
            self.store.root = PathBuf::from(root);
        }
        if let Some(root) = lookup(ENV_STAGING_ROOT) {
            self.staging.root = PathBuf::from(root);
        }
        if let Some(name) = lookup(ENV_HASH) {
            self.digest.function = HashFunction::parse(&name)
                .map_err(|e| Error::invalid_config(origin, format!("{ENV_HASH}: {e}")))?;
        }
        if let Some(name) = lookup(ENV_STRATEGY) {
            self.staging.strategy = name
                .parse()
                .map_err(|e| Error::invalid_config(origin, format!("{ENV_STRATEGY}: {e}")))?;
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.limit,
            Duration::from_millis(self.retry.initial_delay_ms),
        )
        .with_retryable_codes(self.retry.retryable_codes.iter().copied())
    }

    pub fn generator(&self) -> DigestGenerator {
        DigestGenerator::new(self.digest.function)
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(Path::new(INLINE), s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config: Config = "".parse().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.digest.function, HashFunction::Sha256);
        assert_eq!(config.retry.limit, 5);
        assert_eq!(config.retry.initial_delay_ms, 100);
        assert_eq!(config.staging.strategy, StagingStrategy::Fallback);

        let policy = config.retry_policy();
        assert!(policy.is_retryable(Code::Unavailable));
        assert!(!policy.is_retryable(Code::NotFound));
    }

    #[test]
    fn test_full_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("casstage.toml");
        fs::write(
            &path,
            r#"
[digest]
function = "blake3"

[retry]
limit = 2
initial_delay_ms = 10
retryable_codes = ["unavailable", "resource_exhausted"]

[staging]
strategy = "broker"
root = "/var/tmp/stage"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.generator().function(), HashFunction::Blake3);
        assert_eq!(config.staging.strategy, StagingStrategy::Broker);
        assert_eq!(config.staging.root, PathBuf::from("/var/tmp/stage"));
        assert_eq!(config.store, StoreConfig::default());

        let policy = config.retry_policy();
        assert_eq!(policy.limit(), 2);
        assert_eq!(policy.initial_delay(), Duration::from_millis(10));
        assert!(policy.is_retryable(Code::ResourceExhausted));
    }

    #[test]
    fn test_invalid_files() {
        for content in [
            "[digest]\nfunction = \"md5\"\n",
            "[retry]\nretryable_codes = [\"ok\"]\n",
            "[unknown]\nx = 1\n",
            "[retry]\nlimit = -1\n",
        ] {
            assert!(
                matches!(content.parse::<Config>(), Err(Error::InvalidConfig { .. })),
                "accepted {content:?}"
            );
        }
    }

    #[test]
    fn test_env_overrides() {
        let vars = HashMap::from([
            (ENV_STORE_ROOT, "/srv/cas"),
            (ENV_HASH, "sha-1"),
            (ENV_STRATEGY, "broker"),
        ]);

        let mut config = Config::default();
        config
            .apply_env_with(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.store.root, PathBuf::from("/srv/cas"));
        assert_eq!(config.digest.function, HashFunction::Sha1);
        assert_eq!(config.staging.strategy, StagingStrategy::Broker);
        assert_eq!(config.staging.root, StagingConfig::default().root);
    }

    #[test]
    fn test_env_rejects_bad_values() {
        let mut config = Config::default();
        let result = config.apply_env_with(|key| (key == ENV_HASH).then(|| "md5".to_string()));
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }
}
