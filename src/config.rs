//! Configuration loading via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// SSH executor settings derived from environment variables, configuration
/// files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq)]
#[ortho_config(prefix = "TSSH")]
pub struct SshConfig {
    /// Login user forced for every instance. When empty, the user comes
    /// from the image's `default_user` tag, then [`SshConfig::default_user`].
    #[ortho_config(default = String::new())]
    pub user: String,
    /// TCP port for SSH on target instances.
    #[ortho_config(default = 22)]
    pub server_port: u16,
    /// Address of the bastion host; empty means no bastion is available.
    #[ortho_config(default = String::new())]
    pub bastion_address: String,
    /// Login user on the bastion host.
    #[ortho_config(default = "root".to_owned())]
    pub bastion_user: String,
    /// TCP port for SSH on the bastion host.
    #[ortho_config(default = 22)]
    pub bastion_port: u16,
    /// Tunnel through the bastion even when the instance has a public
    /// network.
    #[ortho_config(default = false)]
    pub force_bastion_on_public_host: bool,
    /// TCP dial timeout in seconds.
    #[ortho_config(default = 10.0)]
    pub timeout_secs: f64,
    /// Bound on a whole SSH session in seconds; zero disables the bound.
    #[ortho_config(default = 20.0)]
    pub deadline_secs: f64,
    /// Buffer remote stdout/stderr into the result for inline printing.
    #[ortho_config(default = false)]
    pub inline_output: bool,
    /// Keep remote stderr separate instead of merging it into stdout.
    #[ortho_config(default = false)]
    pub inline_stdout_only: bool,
    /// Directory receiving per-host stdout files; empty discards stdout.
    #[ortho_config(default = String::new())]
    pub out_directory: String,
    /// Directory receiving per-host stderr files; empty discards stderr.
    #[ortho_config(default = String::new())]
    pub err_directory: String,
    /// Number of SSH workers; zero means one per CPU core.
    #[ortho_config(default = 0)]
    pub parallelism: usize,
    /// Fallback login user when neither an override nor an image tag names
    /// one.
    #[ortho_config(default = "root".to_owned())]
    pub default_user: String,
    /// Report what would run without opening any SSH connection.
    #[ortho_config(default = false)]
    pub dry_run: bool,
}

impl SshConfig {
    /// Loads configuration merging defaults, configuration files, and
    /// environment variables, without consuming CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge
    /// sources.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("triton-pssh")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Conflict`] when inline output is combined
    /// with per-host output directories, and [`ConfigError::InvalidValue`]
    /// for non-positive timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inline_output
            && (!self.out_directory.trim().is_empty() || !self.err_directory.trim().is_empty())
        {
            return Err(ConfigError::Conflict(String::from(
                "inline output cannot be used with out/err directories",
            )));
        }
        if self.timeout_secs <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: String::from("timeout_secs"),
                message: String::from("must be greater than zero"),
            });
        }
        if self.deadline_secs < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: String::from("deadline_secs"),
                message: String::from("must not be negative"),
            });
        }
        Ok(())
    }

    /// TCP dial timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }

    /// Whole-session bound, when enabled.
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        (self.deadline_secs > 0.0).then(|| Duration::from_secs_f64(self.deadline_secs))
    }

    /// Worker count with the zero default resolved to the CPU count.
    #[must_use]
    pub fn effective_parallelism(&self) -> usize {
        if self.parallelism > 0 {
            return self.parallelism;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }
}

/// Persistent-cache settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq)]
#[ortho_config(prefix = "TSSH_CACHE")]
pub struct CacheConfig {
    /// Skip the on-disk cache entirely.
    #[ortho_config(default = false)]
    pub no_cache: bool,
    /// Image record lifetime in hours.
    #[ortho_config(default = 168)]
    pub image_expiration_hours: u64,
    /// Network record lifetime in hours.
    #[ortho_config(default = 168)]
    pub network_expiration_hours: u64,
    /// Instance page lifetime in hours.
    #[ortho_config(default = 24)]
    pub instances_expiration_hours: u64,
}

impl CacheConfig {
    /// Loads configuration merging defaults, configuration files, and
    /// environment variables, without consuming CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge
    /// sources.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("triton-pssh")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Image record TTL.
    #[must_use]
    pub fn image_ttl(&self) -> Duration {
        Duration::from_secs(self.image_expiration_hours * 3600)
    }

    /// Network record TTL.
    #[must_use]
    pub fn network_ttl(&self) -> Duration {
        Duration::from_secs(self.network_expiration_hours * 3600)
    }

    /// Instance page TTL.
    #[must_use]
    pub fn instances_ttl(&self) -> Duration {
        Duration::from_secs(self.instances_expiration_hours * 3600)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Indicates mutually exclusive options were combined.
    #[error("conflicting configuration: {0}")]
    Conflict(String),
    /// Indicates a field holds an out-of-range value.
    #[error("invalid configuration value for {field}: {message}")]
    InvalidValue {
        /// Field that failed validation.
        field: String,
        /// Description of the constraint.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    #[fixture]
    fn base_config() -> SshConfig {
        SshConfig {
            user: String::new(),
            server_port: 22,
            bastion_address: String::new(),
            bastion_user: String::from("root"),
            bastion_port: 22,
            force_bastion_on_public_host: false,
            timeout_secs: 10.0,
            deadline_secs: 20.0,
            inline_output: false,
            inline_stdout_only: false,
            out_directory: String::new(),
            err_directory: String::new(),
            parallelism: 4,
            default_user: String::from("root"),
            dry_run: false,
        }
    }

    #[rstest]
    fn defaults_validate(base_config: SshConfig) {
        assert!(base_config.validate().is_ok());
    }

    #[rstest]
    fn inline_output_conflicts_with_output_directories(base_config: SshConfig) {
        let cfg = SshConfig {
            inline_output: true,
            out_directory: String::from("/tmp/out"),
            ..base_config.clone()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Conflict(_))));

        let cfg = SshConfig {
            inline_output: true,
            err_directory: String::from("/tmp/err"),
            ..base_config
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Conflict(_))));
    }

    #[rstest]
    fn zero_timeout_is_rejected(base_config: SshConfig) {
        let cfg = SshConfig {
            timeout_secs: 0.0,
            ..base_config
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[rstest]
    fn deadline_of_zero_disables_the_bound(base_config: SshConfig) {
        let cfg = SshConfig {
            deadline_secs: 0.0,
            ..base_config
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.deadline(), None);
    }

    #[rstest]
    fn parallelism_zero_resolves_to_the_cpu_count(base_config: SshConfig) {
        let cfg = SshConfig {
            parallelism: 0,
            ..base_config
        };
        assert!(cfg.effective_parallelism() >= 1);
    }
}
