//! Configuration loading and validation for the seald service.
//!
//! All values are read from environment variables at startup. The process
//! will exit with a clear error message if any required variable is missing
//! or invalid for the configured wrap scheme.

use anyhow::{Context, Result};
use sealcore::WrapScheme;
use serde::Deserialize;

/// Validated seald service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Filesystem path of the SQLite database. **Required.**
    pub db_path: String,

    /// Port the HTTP server listens on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Wrap scheme for newly generated DEKs: `env_kek` or `kms`.
    #[serde(default = "default_wrap_scheme")]
    pub wrap_scheme: String,

    /// Base64-encoded 32-byte key-encryption key. Required when
    /// `wrap_scheme` is `env_kek`; also needed to read rows wrapped under
    /// the KEK after a KMS migration.
    #[serde(default)]
    pub kek_base64: Option<String>,

    /// KMS key identifier. Required when `wrap_scheme` is `kms`.
    #[serde(default)]
    pub kms_key_id: Option<String>,

    /// Per-attempt timeout (seconds) for KMS calls.
    #[serde(default = "default_kms_timeout_secs")]
    pub kms_timeout_secs: u64,

    /// Retry budget for transient KMS failures.
    #[serde(default = "default_kms_max_retries")]
    pub kms_max_retries: u32,

    /// Default record batch size for `rotate/run`.
    #[serde(default = "default_rotate_batch_size")]
    pub rotate_batch_size: usize,

    /// Database connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_port() -> u16 {
    7300
}
fn default_wrap_scheme() -> String {
    "env_kek".into()
}
fn default_kms_timeout_secs() -> u64 {
    10
}
fn default_kms_max_retries() -> u32 {
    3
}
fn default_rotate_batch_size() -> usize {
    500
}
fn default_pool_size() -> u32 {
    4
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// The parsed wrap scheme.
    pub fn scheme(&self) -> Result<WrapScheme> {
        WrapScheme::parse(&self.wrap_scheme)
            .map_err(|_| anyhow::anyhow!("WRAP_SCHEME must be \"env_kek\" or \"kms\""))
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            anyhow::bail!("DB_PATH is required and must not be empty");
        }
        let scheme = self.scheme()?;
        match scheme {
            WrapScheme::EnvKek if self.kek_base64.as_deref().unwrap_or("").trim().is_empty() => {
                anyhow::bail!("KEK_BASE64 is required when WRAP_SCHEME is env_kek");
            }
            WrapScheme::Kms if self.kms_key_id.as_deref().unwrap_or("").trim().is_empty() => {
                anyhow::bail!("KMS_KEY_ID is required when WRAP_SCHEME is kms");
            }
            _ => {}
        }
        if self.rotate_batch_size == 0 {
            anyhow::bail!("ROTATE_BATCH_SIZE must be > 0");
        }
        if self.pool_size == 0 {
            anyhow::bail!("POOL_SIZE must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            db_path: "/var/lib/ledgerseal/keys.db".into(),
            listen_port: default_listen_port(),
            wrap_scheme: default_wrap_scheme(),
            kek_base64: Some("Zm9v".repeat(11)),
            kms_key_id: None,
            kms_timeout_secs: default_kms_timeout_secs(),
            kms_max_retries: default_kms_max_retries(),
            rotate_batch_size: default_rotate_batch_size(),
            pool_size: default_pool_size(),
            log_level: default_log_level(),
        }
    }

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_listen_port(), 7300);
        assert_eq!(default_wrap_scheme(), "env_kek");
        assert_eq!(default_kms_timeout_secs(), 10);
        assert_eq!(default_kms_max_retries(), 3);
        assert_eq!(default_rotate_batch_size(), 500);
        assert_eq!(default_pool_size(), 4);
        assert_eq!(default_log_level(), "info");
    }

    #[test]
    fn validate_rejects_empty_db_path() {
        let cfg = Config {
            db_path: " ".into(),
            ..base_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_kek_scheme_requires_kek() {
        let cfg = Config {
            kek_base64: None,
            ..base_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn kms_scheme_requires_key_id() {
        let cfg = Config {
            wrap_scheme: "kms".into(),
            kms_key_id: None,
            ..base_config()
        };
        assert!(cfg.validate().is_err());

        let ok = Config {
            wrap_scheme: "kms".into(),
            kms_key_id: Some("alias/ledgerseal".into()),
            kek_base64: None,
            ..base_config()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let cfg = Config {
            wrap_scheme: "vault".into(),
            ..base_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let cfg = Config {
            rotate_batch_size: 0,
            ..base_config()
        };
        assert!(cfg.validate().is_err());
    }
}
