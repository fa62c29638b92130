//! # Brokerlink
//!
//! Interactive command execution, device recovery and session routing for
//! network devices reached through a remote access broker.
//!
//! Two independent subsystems share the broker capability:
//!
//! - **Fleet runs.** [`FleetOrchestrator`] fans a device list out to one
//!   [`DeviceRunner`] per device. A runner sends a command sequence over an
//!   interactive channel, answers prompts as they appear ([`PromptMatcher`]),
//!   retries failed attempts and then waits for the device to come back
//!   ([`RecoveryProbe`]), typically after a reload.
//! - **Session relay.** [`SessionRelay`] accepts sessions whose username is
//!   `<target>@<routing-key>`, opens the matching backend stream through the
//!   broker and pumps bytes both ways.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use brokerlink::broker::DeviceFilter;
//! use brokerlink::channel::{PromptRule, PromptRules};
//! use brokerlink::fleet::{DeviceSelection, FleetOptions};
//! use brokerlink::{FleetOrchestrator, RunParams};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(broker: brokerlink::broker::SshBroker) -> Result<(), brokerlink::Error> {
//! let params = RunParams::new(vec!["reload".into()], Duration::from_secs(600))
//!     .prompt_rules(PromptRules::new(vec![
//!         PromptRule::new(r"Proceed with reload\?", "\r").unwrap(),
//!     ]));
//!
//! let fleet = FleetOrchestrator::new(broker, FleetOptions::default());
//! let selection = DeviceSelection::Filter(DeviceFilter::by_name("^edge-")?);
//! let result = fleet.run(&selection, &params, &CancellationToken::new()).await?;
//!
//! println!("{}", serde_json::to_string_pretty(&result.report()).unwrap());
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod channel;
pub mod config;
pub mod driver;
pub mod error;
pub mod fleet;
pub mod relay;
pub mod transport;

// Re-export main types for convenience
pub use broker::Broker;
pub use channel::CommandChannel;
pub use driver::{DeviceOutcome, DeviceRunner, DeviceStatus, PromptMatcher, RecoveryProbe, RunParams};
pub use error::{Error, Result};
pub use fleet::{FleetOrchestrator, FleetResult};
pub use relay::{RouteIdentity, SessionRelay};
pub use transport::{AuthMethod, SshConfig};
