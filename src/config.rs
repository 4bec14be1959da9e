//! Hypervisor backend settings layered by `ortho-config`.

use std::net::Ipv4Addr;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default hypervisor management CLI.
pub const DEFAULT_HYPERVISOR_BIN: &str = "VBoxManage";

/// Default directory holding the host adapter pool.
pub const DEFAULT_POOL_DIR: &str = "~/.covey/hypervisor/adapters";

/// Default suffix marking VMs owned by this tool. Must stay stable: reaping
/// finds stale VMs by it.
pub const DEFAULT_VM_SUFFIX: &str = "_covey";

/// Settings for the hypervisor backend, derived from configuration files,
/// environment variables, and defaults.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "COVEY",
    discovery(
        app_name = "covey",
        env_var = "COVEY_CONFIG_PATH",
        config_file_name = "covey.toml",
        dotfile_name = ".covey.toml",
        project_file_name = "covey.toml"
    )
)]
pub struct HypervisorConfig {
    /// Hypervisor management CLI.
    #[ortho_config(default = DEFAULT_HYPERVISOR_BIN.to_owned())]
    pub hypervisor_bin: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `ssh-keyscan` executable.
    #[ortho_config(default = "ssh-keyscan".to_owned())]
    pub ssh_keyscan_bin: String,
    /// Directory of the cross-process adapter pool. Supports `~/`.
    #[ortho_config(default = DEFAULT_POOL_DIR.to_owned())]
    pub pool_dir: String,
    /// Number of host-only adapters the pool manages.
    #[ortho_config(default = 8)]
    pub adapter_count: u8,
    /// Name prefix of host-only adapters; adapter `n` is `<prefix><n>`.
    #[ortho_config(default = "vboxnet".to_owned())]
    pub adapter_prefix: String,
    /// First /24 subnet handed to adapters; later adapters take the following
    /// /24 blocks.
    #[ortho_config(default = "172.28.0.0".to_owned())]
    pub subnet_base: String,
    /// VM cloned for every node.
    #[ortho_config(default = "covey-template".to_owned())]
    pub template: String,
    /// Snapshot of the template that clones link to.
    #[ortho_config(default = "zygote".to_owned())]
    pub template_snapshot: String,
    /// Login user when a node spec names none.
    #[ortho_config(default = "vagrant".to_owned())]
    pub default_user: String,
    /// Private key accepted by the template image on first boot. Defaults to
    /// `~/.ssh/id_covey_template`.
    pub template_key_path: Option<String>,
    /// Seconds to wait for a node to accept SSH.
    #[ortho_config(default = 240)]
    pub ready_timeout_secs: u64,
    /// Seconds between SSH readiness probes.
    #[ortho_config(default = 2)]
    pub poll_interval_secs: u64,
    /// Suffix appended to every VM name.
    #[ortho_config(default = DEFAULT_VM_SUFFIX.to_owned())]
    pub vm_suffix: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            hypervisor_bin: DEFAULT_HYPERVISOR_BIN.to_owned(),
            ssh_bin: String::from("ssh"),
            ssh_keyscan_bin: String::from("ssh-keyscan"),
            pool_dir: DEFAULT_POOL_DIR.to_owned(),
            adapter_count: 8,
            adapter_prefix: String::from("vboxnet"),
            subnet_base: String::from("172.28.0.0"),
            template: String::from("covey-template"),
            template_snapshot: String::from("zygote"),
            default_user: String::from("vagrant"),
            template_key_path: None,
            ready_timeout_secs: 240,
            poll_interval_secs: 2,
            vm_suffix: DEFAULT_VM_SUFFIX.to_owned(),
        }
    }
}

/// Names a setting in error messages along with the ways to set it.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn message(&self, problem: &str) -> String {
        format!(
            "{problem} {}: set {} or add {} to covey.toml",
            self.description, self.env_var, self.toml_key
        )
    }
}

impl HypervisorConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(metadata.message("missing")));
        }
        Ok(())
    }

    /// Loads settings from defaults, `covey.toml`, `COVEY_*` variables and
    /// command-line flags, later sources winning.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Like [`Self::load_from_sources`] but ignores the process arguments,
    /// which belong to the `covey` subcommands.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("covey")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Parses [`HypervisorConfig::subnet_base`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when it is not an IPv4 address.
    pub fn subnet_base_addr(&self) -> Result<Ipv4Addr, ConfigError> {
        self.subnet_base.trim().parse().map_err(|_| {
            ConfigError::Invalid(
                FieldMetadata::new("adapter subnet base", "COVEY_SUBNET_BASE", "subnet_base")
                    .message("invalid"),
            )
        })
    }

    /// Performs semantic validation. Error messages include guidance on how
    /// to provide values via environment variables or configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.hypervisor_bin,
                FieldMetadata::new("hypervisor CLI", "COVEY_HYPERVISOR_BIN", "hypervisor_bin"),
            ),
            (
                &self.ssh_bin,
                FieldMetadata::new("ssh executable", "COVEY_SSH_BIN", "ssh_bin"),
            ),
            (
                &self.ssh_keyscan_bin,
                FieldMetadata::new(
                    "ssh-keyscan executable",
                    "COVEY_SSH_KEYSCAN_BIN",
                    "ssh_keyscan_bin",
                ),
            ),
            (
                &self.pool_dir,
                FieldMetadata::new("adapter pool directory", "COVEY_POOL_DIR", "pool_dir"),
            ),
            (
                &self.adapter_prefix,
                FieldMetadata::new("adapter name prefix", "COVEY_ADAPTER_PREFIX", "adapter_prefix"),
            ),
            (
                &self.template,
                FieldMetadata::new("template VM", "COVEY_TEMPLATE", "template"),
            ),
            (
                &self.template_snapshot,
                FieldMetadata::new(
                    "template snapshot",
                    "COVEY_TEMPLATE_SNAPSHOT",
                    "template_snapshot",
                ),
            ),
            (
                &self.default_user,
                FieldMetadata::new("default login user", "COVEY_DEFAULT_USER", "default_user"),
            ),
            (
                &self.vm_suffix,
                FieldMetadata::new("VM name suffix", "COVEY_VM_SUFFIX", "vm_suffix"),
            ),
        ];
        for (value, metadata) in &required {
            Self::require_field(value, metadata)?;
        }

        if let Some(path) = &self.template_key_path {
            Self::require_field(
                path,
                &FieldMetadata::new(
                    "template key path",
                    "COVEY_TEMPLATE_KEY_PATH",
                    "template_key_path",
                ),
            )?;
        }
        if self.adapter_count == 0 {
            return Err(ConfigError::Invalid(
                FieldMetadata::new("adapter count", "COVEY_ADAPTER_COUNT", "adapter_count")
                    .message("zero"),
            ));
        }
        if self.poll_interval_secs == 0 || self.ready_timeout_secs < self.poll_interval_secs {
            return Err(ConfigError::Invalid(
                FieldMetadata::new(
                    "readiness timing",
                    "COVEY_READY_TIMEOUT_SECS and COVEY_POLL_INTERVAL_SECS",
                    "ready_timeout_secs and poll_interval_secs",
                )
                .message("inconsistent"),
            ));
        }

        let base = self.subnet_base_addr()?;
        let [first, second, third, fourth] = base.octets();
        if fourth != 0 || u16::from(third) + u16::from(self.adapter_count) > 256 {
            return Err(ConfigError::Invalid(format!(
                "subnet base {first}.{second}.{third}.{fourth} cannot hold {} /24 adapter subnets: set COVEY_SUBNET_BASE or add subnet_base to covey.toml",
                self.adapter_count
            )));
        }
        Ok(())
    }
}

/// Raised when settings cannot be loaded or are unusable.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// A required setting is blank.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// The layered sources could not be merged.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn defaults_validate() {
        HypervisorConfig::default()
            .validate()
            .expect("defaults should be valid");
    }

    #[rstest]
    fn blank_template_names_env_and_toml_key() {
        let config = HypervisorConfig {
            template: String::from("  "),
            ..HypervisorConfig::default()
        };

        let err = config.validate().expect_err("blank template should fail");

        assert_eq!(
            err,
            ConfigError::MissingField(String::from(
                "missing template VM: set COVEY_TEMPLATE or add template to covey.toml"
            ))
        );
    }

    #[rstest]
    #[case(HypervisorConfig { adapter_count: 0, ..HypervisorConfig::default() })]
    #[case(HypervisorConfig { poll_interval_secs: 0, ..HypervisorConfig::default() })]
    #[case(HypervisorConfig { subnet_base: String::from("10.0.0.1"), ..HypervisorConfig::default() })]
    #[case(HypervisorConfig { subnet_base: String::from("10.0.250.0"), ..HypervisorConfig::default() })]
    #[case(HypervisorConfig { subnet_base: String::from("not-an-ip"), ..HypervisorConfig::default() })]
    fn out_of_range_values_are_invalid(#[case] config: HypervisorConfig) {
        let err = config.validate().expect_err("config should be invalid");

        assert!(matches!(err, ConfigError::Invalid(_)), "unexpected: {err}");
    }
}
