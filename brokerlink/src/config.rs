//! Configuration resolved once at startup.
//!
//! [`GatewayConfig`] and [`ExecJob`] double as `clap` argument groups, so
//! the binary flattens them straight into its subcommands. [`ExecJob`] can
//! also be read from a TOML job file using the same field names.

use std::path::PathBuf;
use std::time::Duration;

use regex::bytes::Regex;
use secrecy::SecretString;
use serde::Deserialize;

use crate::broker::{DeviceFilter, SshBroker};
use crate::channel::{DEFAULT_PROMPT_PATTERN, PromptRules, compile_prompt_pattern};
use crate::driver::{DEFAULT_COMMAND_TIMEOUT, DEFAULT_DELAY_BEFORE_CHECK, DEFAULT_RECOVERY_TEST_COMMAND, RunParams};
use crate::error::ConfigError;
use crate::fleet::{DeviceSelection, FleetOptions};
use crate::transport::{AuthMethod, HostKeyVerification, SshConfig};

pub use crate::broker::Inventory;

/// How to reach the broker's SSH gateway.
#[derive(Debug, Clone, clap::Args)]
pub struct GatewayConfig {
    /// Gateway host name or address
    #[arg(long = "gateway-host", env = "BROKERLINK_GATEWAY_HOST")]
    pub host: String,

    /// Gateway SSH port
    #[arg(long = "gateway-port", env = "BROKERLINK_GATEWAY_PORT", default_value_t = 22)]
    pub port: u16,

    /// Routing key (service serial) the gateway scopes devices by
    #[arg(long, env = "BROKERLINK_ROUTING_KEY")]
    pub routing_key: String,

    /// Gateway password
    #[arg(long = "gateway-password", env = "BROKERLINK_GATEWAY_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Private key for the gateway
    #[arg(long = "gateway-key", env = "BROKERLINK_GATEWAY_KEY")]
    pub key_path: Option<PathBuf>,

    /// Host key checking for the gateway
    #[arg(long, value_enum, env = "BROKERLINK_HOST_KEY_VERIFICATION", default_value_t = HostKeyVerification::AcceptNew)]
    pub host_key_verification: HostKeyVerification,

    /// known_hosts file (defaults to ~/.ssh/known_hosts)
    #[arg(long, env = "BROKERLINK_KNOWN_HOSTS")]
    pub known_hosts: Option<PathBuf>,

    /// Pattern that marks a device as idle at its prompt
    #[arg(long, env = "BROKERLINK_PROMPT_PATTERN", default_value = DEFAULT_PROMPT_PATTERN)]
    pub prompt_pattern: String,

    /// Seconds allowed for connecting and authenticating
    #[arg(long, env = "BROKERLINK_CONNECT_TIMEOUT", default_value_t = 30)]
    pub connect_timeout: u64,

    /// Static device inventory (TOML)
    #[arg(long, env = "BROKERLINK_INVENTORY")]
    pub inventory: Option<PathBuf>,
}

impl GatewayConfig {
    /// Connection settings for the gateway. The login name is replaced
    /// per device with `<device>@<routing_key>`.
    pub fn to_ssh_config(&self) -> SshConfig {
        let auth = match (&self.key_path, &self.password) {
            (Some(path), _) => AuthMethod::PrivateKey {
                path: path.clone(),
                passphrase: None,
            },
            (None, Some(password)) => AuthMethod::Password(SecretString::from(password.clone())),
            (None, None) => AuthMethod::None,
        };

        SshConfig::new(self.host.clone(), self.routing_key.clone())
            .port(self.port)
            .auth(auth)
            .timeout(Duration::from_secs(self.connect_timeout))
            .host_keys(self.host_key_verification, self.known_hosts.clone())
    }

    /// The compiled device prompt pattern.
    pub fn prompt_regex(&self) -> Result<Regex, ConfigError> {
        compile_prompt_pattern(&self.prompt_pattern).map_err(|e| ConfigError::Invalid {
            name: "prompt_pattern",
            message: e.to_string(),
        })
    }

    /// The configured inventory, or an empty one.
    pub fn load_inventory(&self) -> Result<Inventory, ConfigError> {
        match &self.inventory {
            Some(path) => Inventory::load(path),
            None => Ok(Inventory::default()),
        }
    }

    /// Build the production broker adapter.
    pub fn broker(&self) -> Result<SshBroker, ConfigError> {
        Ok(SshBroker::new(
            self.to_ssh_config(),
            self.routing_key.clone(),
            self.prompt_regex()?,
            self.load_inventory()?,
        ))
    }
}

/// Session relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address.
    pub local_address: String,

    /// Listen port, 1..=65535.
    pub local_port: u16,

    /// Shared password clients must present; `None` accepts anyone.
    pub password: Option<SecretString>,

    /// Host key as OpenSSH PEM; an ephemeral key is generated without one.
    pub host_key_pem: Option<String>,

    /// Stop serving after this long.
    pub lifetime: Option<Duration>,

    /// Validate and bind once, then stop.
    pub test_mode: bool,

    /// Time live sessions get to finish on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            local_address: "localhost".to_string(),
            local_port: 2222,
            password: None,
            host_key_pem: None,
            lifetime: None,
            test_mode: false,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

const DEFAULT_FAN_OUT: usize = 8;

fn default_delay_before_check() -> u64 {
    DEFAULT_DELAY_BEFORE_CHECK.as_secs()
}

fn default_command_retries() -> u32 {
    1
}

fn default_recovery_test_command() -> String {
    DEFAULT_RECOVERY_TEST_COMMAND.to_string()
}

fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT.as_secs()
}

fn default_pause() -> f64 {
    0.5
}

fn default_fan_out() -> usize {
    DEFAULT_FAN_OUT
}

/// One exec-and-wait job.
#[derive(Debug, Clone, Deserialize, clap::Args)]
#[serde(deny_unknown_fields)]
pub struct ExecJob {
    /// Select devices whose name matches this pattern
    #[arg(long)]
    #[serde(default)]
    pub device_name: Option<String>,

    /// Select devices whose host matches this pattern
    #[arg(long)]
    #[serde(default)]
    pub device_host: Option<String>,

    /// Explicit device (repeatable)
    #[arg(long = "device", value_name = "NAME")]
    #[serde(default)]
    pub devices: Vec<String>,

    /// Inventory attribute to filter on
    #[arg(long, requires = "filter_pattern")]
    #[serde(default)]
    pub filter_attr: Option<String>,

    /// Pattern searched for in the filter attribute
    #[arg(long, requires = "filter_attr")]
    #[serde(default)]
    pub filter_pattern: Option<String>,

    /// Command to send (repeatable, in order)
    #[arg(long = "command", value_name = "CMD")]
    #[serde(default)]
    pub commands: Vec<String>,

    /// Prompt pattern (repeatable, paired with --answer)
    #[arg(long = "prompt", value_name = "REGEX")]
    #[serde(default)]
    pub prompts: Vec<String>,

    /// Answer for the prompt at the same position
    #[arg(long = "answer", value_name = "TEXT")]
    #[serde(default)]
    pub answers: Vec<String>,

    /// Mask answers in executed_commands and logs
    #[arg(long)]
    #[serde(default)]
    pub hide_answers: bool,

    /// Seconds to wait for prompts per command and for recovery
    #[arg(long)]
    #[serde(default)]
    pub seconds_to_wait: Option<u64>,

    /// Seconds to wait before the first recovery probe
    #[arg(long, default_value_t = default_delay_before_check())]
    #[serde(default = "default_delay_before_check")]
    pub delay_before_check: u64,

    /// Total number of command attempts
    #[arg(long, default_value_t = default_command_retries())]
    #[serde(default = "default_command_retries")]
    pub command_retries: u32,

    /// Probe command sent while waiting for recovery
    #[arg(long, default_value_t = default_recovery_test_command())]
    #[serde(default = "default_recovery_test_command")]
    pub recovery_test_command: String,

    /// Keep going when a device fails
    #[arg(long)]
    #[serde(default)]
    pub continue_on_device_failure: bool,

    /// Seconds a single read may take
    #[arg(long, default_value_t = default_command_timeout())]
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,

    /// Seconds to pause after each command
    #[arg(long, default_value_t = default_pause())]
    #[serde(default = "default_pause")]
    pub wait_between_commands: f64,

    /// Seconds to pause after each answer
    #[arg(long, default_value_t = default_pause())]
    #[serde(default = "default_pause")]
    pub wait_after_answer: f64,

    /// Devices run at the same time
    #[arg(long, default_value_t = default_fan_out())]
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
}

impl ExecJob {
    /// Parse a job from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Load {
            path: "<job>".to_string(),
            message: e.to_string(),
        })
    }

    /// Resolve `\r`, `\n`, `\t` and `\\` in commands and answers given on
    /// the command line.
    pub fn unescaped(mut self) -> Self {
        for text in self
            .commands
            .iter_mut()
            .chain(self.answers.iter_mut())
            .chain(std::iter::once(&mut self.recovery_test_command))
        {
            *text = unescape(text);
        }
        self
    }

    /// Which devices the job targets. An explicit list wins, then name,
    /// host and the generic attribute filter, in that order.
    pub fn selection(&self) -> Result<DeviceSelection, ConfigError> {
        if !self.devices.is_empty() {
            return Ok(DeviceSelection::Devices(self.devices.clone()));
        }
        if let Some(pattern) = &self.device_name {
            return Ok(DeviceSelection::Filter(DeviceFilter::by_name(pattern)?));
        }
        if let Some(pattern) = &self.device_host {
            return Ok(DeviceSelection::Filter(DeviceFilter::by_host(pattern)?));
        }
        match (&self.filter_attr, &self.filter_pattern) {
            (Some(attr), Some(pattern)) => {
                Ok(DeviceSelection::Filter(DeviceFilter::new(attr.clone(), pattern)?))
            }
            (Some(_), None) => Err(ConfigError::Missing("filter_pattern")),
            (None, Some(_)) => Err(ConfigError::Missing("filter_attr")),
            (None, None) => Err(ConfigError::Missing(
                "device_name, device_host, devices or filter_attr/filter_pattern",
            )),
        }
    }

    /// Per-device run parameters.
    pub fn run_params(&self) -> Result<RunParams, ConfigError> {
        let seconds_to_wait = self
            .seconds_to_wait
            .ok_or(ConfigError::Missing("seconds_to_wait"))?;

        let mut rules = PromptRules::from_pairs(&self.prompts, &self.answers)?;
        if self.hide_answers {
            rules = PromptRules::new(
                rules
                    .iter()
                    .cloned()
                    .map(|mut rule| {
                        rule.hidden = true;
                        rule
                    })
                    .collect(),
            );
        }

        let params = RunParams::new(self.commands.clone(), Duration::from_secs(seconds_to_wait))
            .prompt_rules(rules)
            .delay_before_check(Duration::from_secs(self.delay_before_check))
            .command_retries(self.command_retries)
            .recovery_test_command(self.recovery_test_command.clone())
            .command_timeout(Duration::from_secs(self.command_timeout))
            .pacing(
                seconds("wait_between_commands", self.wait_between_commands)?,
                seconds("wait_after_answer", self.wait_after_answer)?,
            );
        params.validate()?;
        Ok(params)
    }

    /// Fleet policy for the job.
    pub fn fleet_options(&self) -> FleetOptions {
        FleetOptions {
            continue_on_device_failure: self.continue_on_device_failure,
            fan_out: self.fan_out.max(1),
            ..FleetOptions::default()
        }
    }
}

fn seconds(name: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|e| ConfigError::Invalid {
        name,
        message: e.to_string(),
    })
}

/// Replace `\r`, `\n`, `\t` and `\\` escapes with the characters they
/// name. Unknown escapes are kept as written.
pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
